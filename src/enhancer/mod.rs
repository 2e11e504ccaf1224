//! Enhancer subsystem
//!
//! Expands a terse well-known deployment (driver name + components version +
//! backend parameters) into a fully specified driver pod template, sidecar
//! set and derived Secret / StorageClass / ConfigMap artifacts.
//!
//! Enhancement is a pure transform: every strategy takes the deployment by
//! reference and returns a new spec. The reconciler owns the semantic diff
//! against the stored spec and the decision to persist, so re-running an
//! enhancer on an already-enhanced deployment produces an equal spec and no
//! update churn.

pub mod ceph;
pub mod cloud;
pub mod versions;

pub use ceph::CephEnhancer;
pub use cloud::CloudEnhancer;
pub use versions::{ComponentRole, SidecarImages};

use crate::config::OperatorConfig;
use crate::crd::{
    Component, CsiDeployment, CsiDeploymentSpec, DRIVER_CEPH_FS, DRIVER_CEPH_RBD,
    DRIVER_CLOUD_BLOCK, DRIVER_CLOUD_FS,
};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Component parameter key carrying the liveness probe port.
pub const LIVENESS_PROBE_PORT_PARAM: &str = "livenessProbePort";

/// Expansion strategy for one family of well-known drivers.
pub trait Enhance {
    /// Expand the deployment into a complete spec.
    fn enhance(&self, deploy: &CsiDeployment) -> Result<CsiDeploymentSpec>;
}

// =============================================================================
// Registry
// =============================================================================

/// Dispatches a deployment to the strategy registered for its driver name.
pub struct EnhancerRegistry {
    strategies: BTreeMap<&'static str, Box<dyn Enhance + Send + Sync>>,
}

impl EnhancerRegistry {
    /// Build the registry with all well-known strategies.
    pub fn new(config: Arc<OperatorConfig>) -> Self {
        let mut strategies: BTreeMap<&'static str, Box<dyn Enhance + Send + Sync>> =
            BTreeMap::new();
        strategies.insert(
            DRIVER_CEPH_RBD,
            Box::new(CephEnhancer::new(config.clone())),
        );
        strategies.insert(DRIVER_CEPH_FS, Box::new(CephEnhancer::new(config.clone())));
        strategies.insert(
            DRIVER_CLOUD_BLOCK,
            Box::new(CloudEnhancer::new(config.clone())),
        );
        strategies.insert(DRIVER_CLOUD_FS, Box::new(CloudEnhancer::new(config)));
        Self { strategies }
    }

    /// Expand a well-known deployment. Unknown driver names are permanent
    /// errors.
    pub fn enhance(&self, deploy: &CsiDeployment) -> Result<CsiDeploymentSpec> {
        let strategy = self
            .strategies
            .get(deploy.spec.driver_name.as_str())
            .ok_or_else(|| Error::UnknownDriver {
                driver: deploy.spec.driver_name.clone(),
            })?;
        strategy.enhance(deploy)
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Join a registry domain and an image tag into a full image reference.
pub(crate) fn image_path(domain: &str, name: &str) -> String {
    format!(
        "{}/{}",
        domain.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

/// Name of the derived credentials Secret.
pub(crate) fn secret_name(driver_name: &str) -> String {
    format!("{driver_name}-secret")
}

/// Name of the derived cluster-config ConfigMap.
pub(crate) fn config_map_name(driver_name: &str) -> String {
    format!("{driver_name}-config")
}

/// Fixed resource limit applied to critical sidecars.
pub(crate) fn critical_resources() -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity("100m".to_string()));
    limits.insert("memory".to_string(), Quantity("100Mi".to_string()));
    ResourceRequirements {
        limits: Some(limits),
        ..Default::default()
    }
}

/// Replace every declared sidecar component with its canonical definition
/// for the resolved release: versioned image, default parameters, and the
/// fixed resource limit for critical roles. Undeclared roles stay absent, so
/// the user controls which sidecars run while the operator controls what
/// runs in them.
pub(crate) fn enhance_components(
    config: &OperatorConfig,
    spec: &mut CsiDeploymentSpec,
    images: &SidecarImages,
) {
    for role in ComponentRole::ALL {
        let Some(tag) = images.image(role) else {
            continue;
        };
        let component = Component {
            image: image_path(&config.registry_domain, tag),
            resources: if role.is_critical() {
                critical_resources()
            } else {
                ResourceRequirements::default()
            },
            parameters: BTreeMap::new(),
        };

        let placement = role.placement();
        if placement.node {
            if let Some(slot) = node_slot(spec, role) {
                if slot.is_some() {
                    *slot = Some(component.clone());
                }
            }
        }
        if placement.controller {
            if let Some(slot) = controller_slot(spec, role) {
                if slot.is_some() {
                    *slot = Some(component.clone());
                }
            }
        }
    }

    let ctrl = &mut spec.controller;
    let has_controller = ctrl.provisioner.is_some()
        || ctrl.attacher.is_some()
        || ctrl.resizer.is_some()
        || ctrl.snapshotter.is_some()
        || ctrl.cluster_registrar.is_some()
        || ctrl.liveness_probe.is_some();
    if has_controller && ctrl.replicas <= 0 {
        ctrl.replicas = 1;
    }
}

/// Role to node-spec field mapping.
fn node_slot(spec: &mut CsiDeploymentSpec, role: ComponentRole) -> Option<&mut Option<Component>> {
    match role {
        ComponentRole::NodeRegistrar => Some(&mut spec.node.node_registrar),
        ComponentRole::LivenessProbe => Some(&mut spec.node.liveness_probe),
        _ => None,
    }
}

/// Role to controller-spec field mapping.
fn controller_slot(
    spec: &mut CsiDeploymentSpec,
    role: ComponentRole,
) -> Option<&mut Option<Component>> {
    match role {
        ComponentRole::Provisioner => Some(&mut spec.controller.provisioner),
        ComponentRole::Attacher => Some(&mut spec.controller.attacher),
        ComponentRole::Resizer => Some(&mut spec.controller.resizer),
        ComponentRole::Snapshotter => Some(&mut spec.controller.snapshotter),
        ComponentRole::ClusterRegistrar => Some(&mut spec.controller.cluster_registrar),
        ComponentRole::LivenessProbe => Some(&mut spec.controller.liveness_probe),
        _ => None,
    }
}

/// Fill the liveness probe port parameter on declared probe components.
pub(crate) fn set_liveness_probe_ports(spec: &mut CsiDeploymentSpec, node: &str, controller: &str) {
    if let Some(probe) = &mut spec.node.liveness_probe {
        probe.parameters = BTreeMap::from([(
            LIVENESS_PROBE_PORT_PARAM.to_string(),
            node.to_string(),
        )]);
    }
    if let Some(probe) = &mut spec.controller.liveness_probe {
        probe.parameters = BTreeMap::from([(
            LIVENESS_PROBE_PORT_PARAM.to_string(),
            controller.to_string(),
        )]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CsiVersion, NodeComponents};

    fn deployment(driver: &str, version: CsiVersion) -> CsiDeployment {
        let mut deploy = CsiDeployment {
            metadata: Default::default(),
            spec: CsiDeploymentSpec {
                driver_name: driver.to_string(),
                version,
                ..Default::default()
            },
            status: None,
        };
        deploy.metadata.name = Some("test".to_string());
        deploy.metadata.namespace = Some("kube-system".to_string());
        deploy
    }

    #[test]
    fn test_image_path_joins_slashes() {
        assert_eq!(image_path("registry.io/lib", "img:v1"), "registry.io/lib/img:v1");
        assert_eq!(image_path("registry.io/lib/", "/img:v1"), "registry.io/lib/img:v1");
    }

    #[test]
    fn test_unknown_driver_is_permanent() {
        let registry = EnhancerRegistry::new(Arc::new(OperatorConfig::default()));
        let deploy = deployment("csi-floppy", CsiVersion::V1);
        let err = registry.enhance(&deploy).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_enhance_components_fills_declared_slots_only() {
        let config = OperatorConfig::default();
        let images = versions::lookup(DRIVER_CEPH_RBD, CsiVersion::V1).unwrap();

        let mut spec = CsiDeploymentSpec {
            driver_name: DRIVER_CEPH_RBD.to_string(),
            version: CsiVersion::V1,
            node: NodeComponents {
                node_registrar: Some(Component::default()),
                liveness_probe: None,
            },
            ..Default::default()
        };
        spec.controller.provisioner = Some(Component::default());

        enhance_components(&config, &mut spec, images);

        let registrar = spec.node.node_registrar.as_ref().unwrap();
        assert!(registrar.image.ends_with("csi-node-driver-registrar:v1.1.0"));
        assert!(registrar.resources.limits.is_none());

        let provisioner = spec.controller.provisioner.as_ref().unwrap();
        assert!(provisioner.image.ends_with("csi-provisioner:v1.0.1"));
        assert!(provisioner.resources.limits.is_some());

        // Undeclared roles stay off.
        assert!(spec.node.liveness_probe.is_none());
        assert!(spec.controller.attacher.is_none());
        assert_eq!(spec.controller.replicas, 1);
    }

    #[test]
    fn test_enhance_components_no_controller_keeps_replicas_zero() {
        let config = OperatorConfig::default();
        let images = versions::lookup(DRIVER_CEPH_RBD, CsiVersion::V1).unwrap();
        let mut spec = CsiDeploymentSpec {
            driver_name: DRIVER_CEPH_RBD.to_string(),
            version: CsiVersion::V1,
            node: NodeComponents {
                node_registrar: Some(Component::default()),
                liveness_probe: None,
            },
            ..Default::default()
        };

        enhance_components(&config, &mut spec, images);
        assert_eq!(spec.controller.replicas, 0);
    }

    #[test]
    fn test_slot_mapping_consistent_with_placement() {
        let mut spec = CsiDeploymentSpec::default();
        for role in ComponentRole::ALL {
            let placement = role.placement();
            assert_eq!(node_slot(&mut spec, role).is_some(), placement.node);
            assert_eq!(
                controller_slot(&mut spec, role).is_some(),
                placement.controller
            );
        }
    }
}
