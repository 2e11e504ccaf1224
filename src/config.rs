//! Process-level configuration
//!
//! All configurable parameters are read once at startup (flags or
//! environment, see `main.rs`) and handed to the controller and enhancers as
//! an immutable value. The core never reads flags or environment directly.

/// Global configuration shared by the controller and all enhancers.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Path to the kubelet's root dir on every node, used to derive the
    /// driver socket and mount host paths.
    pub kubelet_root_dir: String,

    /// Domain of the image registry all sidecar and driver images are
    /// resolved against.
    pub registry_domain: String,

    /// Filesystems to create StorageClasses for on block backends.
    pub filesystems: Vec<String>,

    /// Default Ceph cluster credentials, used when a deployment does not
    /// carry its own.
    pub ceph: CephConfig,

    /// Default cloud API credentials, used when a deployment does not carry
    /// its own.
    pub cloud: CloudConfig,
}

/// Default Ceph cluster access configuration.
#[derive(Debug, Clone, Default)]
pub struct CephConfig {
    /// Comma-separated monitor addresses.
    pub monitors: String,
    /// ID of the Ceph admin user.
    pub admin_id: String,
    /// Keyring of the Ceph admin user.
    pub admin_key: String,
}

/// Default cloud API access configuration.
#[derive(Debug, Clone, Default)]
pub struct CloudConfig {
    /// Base64-encoded API secret id.
    pub secret_id: String,
    /// Base64-encoded API secret key.
    pub secret_key: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            kubelet_root_dir: "/var/lib/kubelet".to_string(),
            registry_domain: "registry.billyronks.io/library".to_string(),
            filesystems: vec!["ext4".to_string(), "xfs".to_string()],
            ceph: CephConfig {
                admin_id: "admin".to_string(),
                ..CephConfig::default()
            },
            cloud: CloudConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.kubelet_root_dir, "/var/lib/kubelet");
        assert_eq!(config.filesystems, vec!["ext4", "xfs"]);
        assert_eq!(config.ceph.admin_id, "admin");
        assert!(config.ceph.monitors.is_empty());
    }
}
