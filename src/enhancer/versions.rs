//! Static version table
//!
//! Maps (driver, components version) to the image tags of the driver and
//! every sidecar. The table is plain data; resolution failures are permanent
//! errors because no amount of retrying will make an unknown version known.

use crate::crd::{CsiVersion, DRIVER_CEPH_FS, DRIVER_CEPH_RBD, DRIVER_CLOUD_BLOCK, DRIVER_CLOUD_FS};
use crate::error::{Error, Result};

// =============================================================================
// Component roles
// =============================================================================

/// The sidecar roles a deployment can declare.
///
/// Every role maps to exactly one slot on the node spec, the controller
/// spec, or both; the mapping lives in [`ComponentRole::placement`] and is
/// exhaustive by construction, so adding a role without deciding its
/// placement does not compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentRole {
    Provisioner,
    Attacher,
    Resizer,
    Snapshotter,
    LivenessProbe,
    NodeRegistrar,
    ClusterRegistrar,
}

/// Where a role's container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub node: bool,
    pub controller: bool,
}

impl ComponentRole {
    /// All roles, in sidecar injection order.
    pub const ALL: [ComponentRole; 7] = [
        ComponentRole::Provisioner,
        ComponentRole::Attacher,
        ComponentRole::Resizer,
        ComponentRole::Snapshotter,
        ComponentRole::LivenessProbe,
        ComponentRole::NodeRegistrar,
        ComponentRole::ClusterRegistrar,
    ];

    /// Which workload(s) the role's container is injected into.
    pub fn placement(self) -> Placement {
        match self {
            ComponentRole::Provisioner
            | ComponentRole::Attacher
            | ComponentRole::Resizer
            | ComponentRole::Snapshotter
            | ComponentRole::ClusterRegistrar => Placement {
                node: false,
                controller: true,
            },
            ComponentRole::NodeRegistrar => Placement {
                node: true,
                controller: false,
            },
            ComponentRole::LivenessProbe => Placement {
                node: true,
                controller: true,
            },
        }
    }

    /// Critical roles receive a fixed default resource limit.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            ComponentRole::Provisioner
                | ComponentRole::Attacher
                | ComponentRole::Resizer
                | ComponentRole::Snapshotter
        )
    }
}

// =============================================================================
// Version table
// =============================================================================

/// Image tags of one (driver, version) release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarImages {
    pub provisioner: Option<&'static str>,
    pub attacher: Option<&'static str>,
    pub resizer: Option<&'static str>,
    pub snapshotter: Option<&'static str>,
    pub liveness_probe: Option<&'static str>,
    pub node_registrar: Option<&'static str>,
    pub cluster_registrar: Option<&'static str>,
    pub driver: &'static str,
}

const NO_IMAGES: SidecarImages = SidecarImages {
    provisioner: None,
    attacher: None,
    resizer: None,
    snapshotter: None,
    liveness_probe: None,
    node_registrar: None,
    cluster_registrar: None,
    driver: "",
};

impl SidecarImages {
    /// Image tag for a role, if this release ships one.
    pub fn image(&self, role: ComponentRole) -> Option<&'static str> {
        match role {
            ComponentRole::Provisioner => self.provisioner,
            ComponentRole::Attacher => self.attacher,
            ComponentRole::Resizer => self.resizer,
            ComponentRole::Snapshotter => self.snapshotter,
            ComponentRole::LivenessProbe => self.liveness_probe,
            ComponentRole::NodeRegistrar => self.node_registrar,
            ComponentRole::ClusterRegistrar => self.cluster_registrar,
        }
    }
}

const CEPH_RBD_V0: SidecarImages = SidecarImages {
    provisioner: Some("csi-provisioner:v0.4.2"),
    attacher: Some("csi-attacher:v0.4.2"),
    snapshotter: Some("csi-snapshotter:v0.4.1"),
    liveness_probe: Some("livenessprobe:v0.4.1"),
    node_registrar: Some("driver-registrar:v0.3.0"),
    driver: "rbdplugin:v0.3.0",
    ..NO_IMAGES
};

const CEPH_RBD_V1: SidecarImages = SidecarImages {
    provisioner: Some("csi-provisioner:v1.0.1"),
    attacher: Some("csi-attacher:v1.1.0"),
    snapshotter: Some("csi-snapshotter:v1.1.0"),
    liveness_probe: Some("livenessprobe:v1.1.0"),
    node_registrar: Some("csi-node-driver-registrar:v1.1.0"),
    driver: "rbdplugin:v1.0.0",
    ..NO_IMAGES
};

const CEPH_FS_V0: SidecarImages = SidecarImages {
    provisioner: Some("csi-provisioner:v0.4.2"),
    attacher: Some("csi-attacher:v0.4.2"),
    liveness_probe: Some("livenessprobe:v0.4.1"),
    node_registrar: Some("driver-registrar:v0.3.0"),
    driver: "cephfsplugin:v0.3.0",
    ..NO_IMAGES
};

const CEPH_FS_V1: SidecarImages = SidecarImages {
    provisioner: Some("csi-provisioner:v1.0.1"),
    attacher: Some("csi-attacher:v1.1.0"),
    liveness_probe: Some("livenessprobe:v1.1.0"),
    node_registrar: Some("csi-node-driver-registrar:v1.1.0"),
    driver: "cephfsplugin:v1.0.0",
    ..NO_IMAGES
};

const CLOUD_BLOCK_V0: SidecarImages = SidecarImages {
    provisioner: Some("csi-provisioner:v0.4.2"),
    attacher: Some("csi-attacher:v0.4.2"),
    node_registrar: Some("driver-registrar:v0.3.0"),
    driver: "csi-cloud-cbs:v0.2.1",
    ..NO_IMAGES
};

const CLOUD_BLOCK_V1: SidecarImages = SidecarImages {
    provisioner: Some("csi-provisioner:v1.6.0"),
    attacher: Some("csi-attacher:v1.1.0"),
    resizer: Some("csi-resizer:v0.5.0"),
    snapshotter: Some("csi-snapshotter:v1.2.2"),
    node_registrar: Some("csi-node-driver-registrar:v1.1.0"),
    driver: "csi-cloud-cbs:v1.2.0",
    ..NO_IMAGES
};

const CLOUD_BLOCK_V1P1: SidecarImages = SidecarImages {
    driver: "csi-cloud-cbs:v1.2.1",
    ..CLOUD_BLOCK_V1
};

const CLOUD_FS_V0: SidecarImages = SidecarImages {
    provisioner: Some("csi-provisioner:v0.4.2"),
    attacher: Some("csi-attacher:v0.4.2"),
    node_registrar: Some("driver-registrar:v0.3.0"),
    driver: "csi-cloud-cfs:v0.3.0",
    ..NO_IMAGES
};

const CLOUD_FS_V1: SidecarImages = SidecarImages {
    provisioner: Some("csi-provisioner:v1.6.0"),
    attacher: Some("csi-attacher:v1.1.0"),
    node_registrar: Some("csi-node-driver-registrar:v1.1.0"),
    driver: "csi-cloud-cfs:v1.0.0",
    ..NO_IMAGES
};

/// Resolve the image tags for a (driver, version) pair.
pub fn lookup(driver: &str, version: CsiVersion) -> Result<&'static SidecarImages> {
    let entry = match driver {
        DRIVER_CEPH_RBD => match version {
            CsiVersion::V0 => Some(&CEPH_RBD_V0),
            CsiVersion::V1 => Some(&CEPH_RBD_V1),
            _ => None,
        },
        DRIVER_CEPH_FS => match version {
            CsiVersion::V0 => Some(&CEPH_FS_V0),
            CsiVersion::V1 => Some(&CEPH_FS_V1),
            _ => None,
        },
        DRIVER_CLOUD_BLOCK => match version {
            CsiVersion::V0 => Some(&CLOUD_BLOCK_V0),
            CsiVersion::V1 => Some(&CLOUD_BLOCK_V1),
            CsiVersion::V1p1 => Some(&CLOUD_BLOCK_V1P1),
            _ => None,
        },
        DRIVER_CLOUD_FS => match version {
            CsiVersion::V0 => Some(&CLOUD_FS_V0),
            CsiVersion::V1 => Some(&CLOUD_FS_V1),
            _ => None,
        },
        _ => {
            return Err(Error::UnknownDriver {
                driver: driver.to_string(),
            })
        }
    };

    entry.ok_or_else(|| Error::UnknownVersion {
        driver: driver.to_string(),
        version: version.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every (driver, version) pair served by the table.
    fn known_pairs() -> Vec<(&'static str, CsiVersion)> {
        vec![
            (DRIVER_CEPH_RBD, CsiVersion::V0),
            (DRIVER_CEPH_RBD, CsiVersion::V1),
            (DRIVER_CEPH_FS, CsiVersion::V0),
            (DRIVER_CEPH_FS, CsiVersion::V1),
            (DRIVER_CLOUD_BLOCK, CsiVersion::V0),
            (DRIVER_CLOUD_BLOCK, CsiVersion::V1),
            (DRIVER_CLOUD_BLOCK, CsiVersion::V1p1),
            (DRIVER_CLOUD_FS, CsiVersion::V0),
            (DRIVER_CLOUD_FS, CsiVersion::V1),
        ]
    }

    #[test]
    fn test_every_known_pair_resolves_with_driver_image() {
        for (driver, version) in known_pairs() {
            let images = lookup(driver, version).unwrap();
            assert!(
                !images.driver.is_empty(),
                "{driver}/{version} has no driver image"
            );
        }
    }

    #[test]
    fn test_unknown_driver_and_version() {
        assert!(matches!(
            lookup("csi-floppy", CsiVersion::V1),
            Err(Error::UnknownDriver { .. })
        ));
        assert!(matches!(
            lookup(DRIVER_CEPH_RBD, CsiVersion::V1p1),
            Err(Error::UnknownVersion { .. })
        ));
        assert!(matches!(
            lookup(DRIVER_CEPH_RBD, CsiVersion::Custom),
            Err(Error::UnknownVersion { .. })
        ));
    }

    #[test]
    fn test_role_placement_covers_every_role() {
        for role in ComponentRole::ALL {
            let placement = role.placement();
            assert!(
                placement.node || placement.controller,
                "{role:?} placed nowhere"
            );
        }
    }

    #[test]
    fn test_critical_roles() {
        assert!(ComponentRole::Provisioner.is_critical());
        assert!(ComponentRole::Resizer.is_critical());
        assert!(!ComponentRole::NodeRegistrar.is_critical());
        assert!(!ComponentRole::LivenessProbe.is_critical());
    }

    #[test]
    fn test_image_accessor_matches_table() {
        let images = lookup(DRIVER_CEPH_RBD, CsiVersion::V1).unwrap();
        assert_eq!(
            images.image(ComponentRole::Provisioner),
            Some("csi-provisioner:v1.0.1")
        );
        assert_eq!(images.image(ComponentRole::Resizer), None);
        assert_eq!(images.image(ComponentRole::ClusterRegistrar), None);
    }
}
