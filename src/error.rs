//! Error types for the CSI driver operator
//!
//! Splits failures into transient errors, which the controller retries by
//! requeueing the deployment, and permanent errors, which mark the
//! deployment `Failed` until its spec changes.

use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    // =========================================================================
    // Enhancement Errors
    // =========================================================================
    #[error("unknown driver: {driver}")]
    UnknownDriver { driver: String },

    #[error("unknown version {version} for driver {driver}")]
    UnknownVersion { driver: String, version: String },

    #[error("malformed credentials: {0}")]
    MalformedCredentials(String),

    #[error("enhance failed: {0}")]
    Enhance(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("invalid spec: {0}")]
    Validation(String),

    // =========================================================================
    // Aggregates
    // =========================================================================
    #[error("{0}")]
    Aggregate(ErrorList),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A list of independent errors collected from one sync batch.
#[derive(Debug, Default)]
pub struct ErrorList(pub Vec<Error>);

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl Error {
    /// True if retrying cannot fix this error; only a spec change can.
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::UnknownDriver { .. }
            | Error::UnknownVersion { .. }
            | Error::MalformedCredentials(_)
            | Error::Enhance(_) => true,
            Error::Aggregate(list) => list.0.iter().any(Error::is_permanent),
            _ => false,
        }
    }

    /// True if the controller should requeue the deployment for this error.
    pub fn is_retryable(&self) -> bool {
        !self.is_permanent() && !matches!(self, Error::Validation(_))
    }

    /// Combine a batch of errors into a single value. Empty means success.
    pub fn aggregate(mut errs: Vec<Error>) -> Option<Error> {
        match errs.len() {
            0 => None,
            1 => Some(errs.remove(0)),
            _ => Some(Error::Aggregate(ErrorList(errs))),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_permanent_classification() {
        let err = Error::UnknownDriver {
            driver: "csi-floppy".into(),
        };
        assert!(err.is_permanent());
        assert!(!err.is_retryable());

        let err = Error::Timeout { operation: "get" };
        assert!(!err.is_permanent());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_not_retryable_not_permanent() {
        let err = Error::Validation("spec.driverName: invalid".into());
        assert!(!err.is_permanent());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_aggregate_permanent_if_any_member_permanent() {
        let agg = Error::Aggregate(ErrorList(vec![
            Error::Timeout { operation: "list" },
            Error::UnknownVersion {
                driver: "csi-rbd".into(),
                version: "v9".into(),
            },
        ]));
        assert!(agg.is_permanent());

        let agg = Error::Aggregate(ErrorList(vec![
            Error::Timeout { operation: "list" },
            Error::Timeout { operation: "get" },
        ]));
        assert!(!agg.is_permanent());
        assert!(agg.is_retryable());
    }

    #[test]
    fn test_aggregate_flattens_single_error() {
        assert_matches!(Error::aggregate(vec![]), None);
        assert_matches!(
            Error::aggregate(vec![Error::Timeout { operation: "get" }]),
            Some(Error::Timeout { .. })
        );
        assert_matches!(
            Error::aggregate(vec![
                Error::Timeout { operation: "get" },
                Error::Timeout { operation: "list" },
            ]),
            Some(Error::Aggregate(_))
        );
    }

    #[test]
    fn test_error_list_message_concatenates_members() {
        let agg = Error::Aggregate(ErrorList(vec![
            Error::Enhance("first".into()),
            Error::Enhance("second".into()),
        ]));
        let msg = agg.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }
}
