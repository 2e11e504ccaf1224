//! Structural spec validation
//!
//! Pure and deterministic: the same spec always produces the same ordered
//! list of field-scoped errors, so a failed validation is never retried
//! until the generation changes.

use crate::crd::CsiDeployment;
use regex::Regex;
use std::sync::OnceLock;

const MAX_DRIVER_NAME: usize = 63;
const DRIVER_NAME_PATTERN: &str = r"^[a-zA-Z0-9][-a-zA-Z0-9_.]{0,61}[a-zA-Z0-9]$";

fn driver_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DRIVER_NAME_PATTERN).expect("driver name pattern"))
}

/// One field-scoped validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a deployment's structural well-formedness. An empty list means
/// valid.
pub fn validate(deploy: &CsiDeployment) -> Vec<FieldError> {
    let mut errors = Vec::new();

    let driver_name = &deploy.spec.driver_name;
    if driver_name.len() > MAX_DRIVER_NAME {
        errors.push(FieldError {
            field: "spec.driverName",
            message: format!("must be no more than {MAX_DRIVER_NAME} characters"),
        });
    }
    if !driver_name_regex().is_match(driver_name) {
        errors.push(FieldError {
            field: "spec.driverName",
            message: "must consist of alphanumeric characters, '-', '_' or '.', and must start \
                      and end with an alphanumeric character"
                .to_string(),
        });
    }

    if let Some(template) = &deploy.spec.driver_template {
        let containers = template
            .template
            .spec
            .as_ref()
            .map(|s| s.containers.len())
            .unwrap_or(0);
        if containers != 1 {
            errors.push(FieldError {
                field: "spec.driverTemplate",
                message: "must have one and only one container".to_string(),
            });
        }
    }

    errors
}

/// Join the errors into one message for the Validated condition.
pub fn aggregate_message(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CsiDeploymentSpec, DriverTemplate};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    fn deployment(driver_name: &str) -> CsiDeployment {
        CsiDeployment {
            metadata: Default::default(),
            spec: CsiDeploymentSpec {
                driver_name: driver_name.to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    fn template_with_containers(count: usize) -> DriverTemplate {
        DriverTemplate {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: (0..count)
                        .map(|i| Container {
                            name: format!("c{i}"),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }),
            },
            rules: Vec::new(),
        }
    }

    #[test]
    fn test_valid_names() {
        for name in ["csi-rbd", "com.cloud.csi.cbs", "a-b_c.d9", "ab"] {
            assert!(validate(&deployment(name)).is_empty(), "{name} rejected");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "-leading", "trailing-", "has space", "has/slash"] {
            assert!(!validate(&deployment(name)).is_empty(), "{name} accepted");
        }
    }

    #[test]
    fn test_name_too_long() {
        let name = "a".repeat(64);
        let errors = validate(&deployment(&name));
        assert!(errors
            .iter()
            .any(|e| e.message.contains("63 characters")));
    }

    #[test]
    fn test_template_container_count() {
        let mut deploy = deployment("csi-rbd");

        deploy.spec.driver_template = Some(template_with_containers(1));
        assert!(validate(&deploy).is_empty());

        deploy.spec.driver_template = Some(template_with_containers(0));
        assert_eq!(validate(&deploy).len(), 1);

        deploy.spec.driver_template = Some(template_with_containers(2));
        assert_eq!(validate(&deploy).len(), 1);
    }

    #[test]
    fn test_errors_are_field_scoped_and_ordered() {
        let mut deploy = deployment("-bad-");
        deploy.spec.driver_template = Some(template_with_containers(0));
        let errors = validate(&deploy);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "spec.driverName");
        assert_eq!(errors[1].field, "spec.driverTemplate");

        let message = aggregate_message(&errors);
        assert!(message.contains("spec.driverName"));
        assert!(message.contains("spec.driverTemplate"));
    }
}
