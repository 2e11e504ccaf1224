//! CsiDeployment CRD
//!
//! Declarative deployment descriptor for a CSI driver: either a fully custom
//! pod template plus sidecar components, or a terse well-known driver name +
//! version that the enhancer expands into a complete specification.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, PodTemplateSpec, ResourceRequirements, Secret};
use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Well-known driver names
// =============================================================================

/// Ceph RBD block storage driver.
pub const DRIVER_CEPH_RBD: &str = "csi-rbd";
/// CephFS shared filesystem driver.
pub const DRIVER_CEPH_FS: &str = "csi-cephfs";
/// Cloud block storage driver.
pub const DRIVER_CLOUD_BLOCK: &str = "csi-cloud-cbs";
/// Cloud shared filesystem driver.
pub const DRIVER_CLOUD_FS: &str = "csi-cloud-cfs";

// =============================================================================
// CsiDeployment CRD
// =============================================================================

/// CsiDeployment describes one CSI driver installation: the driver pod
/// template, its sidecar components, and the Secrets / StorageClasses /
/// ConfigMaps the driver needs to serve volumes.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "CsiDeployment",
    plural = "csideployments",
    shortname = "csid",
    status = "CsiDeploymentStatus",
    printcolumn = r#"{"name": "Driver", "type": "string", "jsonPath": ".spec.driverName"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.version"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CsiDeploymentSpec {
    /// Well-known components version. When set to anything other than
    /// `custom`, `driverName` must be a well-known driver and the operator
    /// enhances `driverTemplate`, `node`, `controller`, `secrets`,
    /// `storageClasses` and `configMaps` from it.
    #[serde(default)]
    pub version: CsiVersion,

    /// Name of the CSI driver. Also used as the provisioner name of every
    /// derived StorageClass.
    pub driver_name: String,

    /// Backend parameters for a well-known driver, such as Ceph cluster
    /// information or cloud credentials.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Driver pod template and extra RBAC rules. Supplied directly for a
    /// custom deployment, synthesized by the enhancer for well-known ones.
    #[serde(default)]
    pub driver_template: Option<DriverTemplate>,

    /// Sidecar components of the per-node DaemonSet.
    #[serde(default)]
    pub node: NodeComponents,

    /// Sidecar components of the controller Deployment.
    #[serde(default)]
    pub controller: ControllerComponents,

    /// Secrets used to provision/attach/resize/snapshot volumes.
    #[serde(default)]
    pub secrets: Vec<Secret>,

    /// StorageClasses served by this driver. The provisioner field is
    /// overridden with `driverName` during synchronization.
    #[serde(default)]
    pub storage_classes: Vec<StorageClass>,

    /// ConfigMaps consumed by the driver containers.
    #[serde(default)]
    pub config_maps: Vec<ConfigMap>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Version of the well-known CSI external components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CsiVersion {
    /// Fully custom deployment, no enhancement performed.
    #[default]
    #[serde(rename = "")]
    Custom,
    /// The 0.x line of CSI components.
    #[serde(rename = "v0")]
    V0,
    /// The 1.x line of CSI components.
    #[serde(rename = "v1")]
    V1,
    /// The 1.x line with an updated cloud block driver.
    #[serde(rename = "v1p1")]
    V1p1,
}

impl std::fmt::Display for CsiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CsiVersion::Custom => write!(f, ""),
            CsiVersion::V0 => write!(f, "v0"),
            CsiVersion::V1 => write!(f, "v1"),
            CsiVersion::V1p1 => write!(f, "v1p1"),
        }
    }
}

/// Driver pod template plus the cluster RBAC rules the driver needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverTemplate {
    /// Must contain one and only one container, the concrete driver. The
    /// container is expected to read the CSI socket from the `CSI_ENDPOINT`
    /// environment variable injected by the operator.
    #[serde(default)]
    pub template: PodTemplateSpec,

    /// Extra cluster rules needed by the driver, merged into the node
    /// ClusterRole.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Sidecar components of the node DaemonSet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeComponents {
    /// Registers the driver socket with the kubelet.
    #[serde(default)]
    pub node_registrar: Option<Component>,

    /// Probes driver health over the CSI socket.
    #[serde(default)]
    pub liveness_probe: Option<Component>,
}

/// Sidecar components of the controller Deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControllerComponents {
    /// Replicas of the controller Deployment.
    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub provisioner: Option<Component>,

    #[serde(default)]
    pub attacher: Option<Component>,

    #[serde(default)]
    pub resizer: Option<Component>,

    #[serde(default)]
    pub snapshotter: Option<Component>,

    /// Registers the driver with the cluster (CSIDriver object).
    #[serde(default)]
    pub cluster_registrar: Option<Component>,

    #[serde(default)]
    pub liveness_probe: Option<Component>,
}

/// Configuration of one external sidecar container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Sidecar container image.
    #[serde(default)]
    pub image: String,

    /// Resource requirements of the sidecar container.
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Additional parameters, such as the liveness probe port.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a CsiDeployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsiDeploymentStatus {
    /// Current phase.
    #[serde(default)]
    pub phase: CsiPhase,

    /// The spec generation last processed without error.
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Generations of the workload objects the operator has created or
    /// updated, used to detect out-of-band edits.
    #[serde(default)]
    pub children: Vec<ChildGeneration>,

    /// Latest observations of the deployment's state.
    #[serde(default)]
    pub conditions: Vec<CsiCondition>,
}

/// Deployment lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CsiPhase {
    #[default]
    Pending,
    Running,
    Failed,
}

impl std::fmt::Display for CsiPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CsiPhase::Pending => write!(f, "Pending"),
            CsiPhase::Running => write!(f, "Running"),
            CsiPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Tracks the last seen generation of one child workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChildGeneration {
    /// API group of the child object.
    #[serde(default)]
    pub group: String,
    /// Kind of the child object.
    pub kind: String,
    /// Namespace of the child object.
    pub namespace: String,
    /// Name of the child object.
    pub name: String,
    /// Generation of the child as of the last successful sync.
    #[serde(default)]
    pub last_generation: i64,
}

/// Condition describing one aspect of the deployment's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsiCondition {
    /// Type of the condition.
    pub r#type: String,
    /// Status: True, False, Unknown.
    pub status: ConditionStatus,
    /// Last time the condition transitioned between status values.
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Machine-readable reason for the last transition.
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message for the last transition.
    #[serde(default)]
    pub message: Option<String>,
}

/// Condition status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

// =============================================================================
// Implementations
// =============================================================================

impl CsiDeployment {
    /// Get the name of this deployment.
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Get the namespace of this deployment.
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// True once deletion has been requested.
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True if this is a well-known deployment subject to enhancement.
    pub fn is_well_known(&self) -> bool {
        self.spec.version != CsiVersion::Custom
    }

    /// True if any controller sidecar is enabled, i.e. a controller
    /// Deployment must exist.
    pub fn has_controller(&self) -> bool {
        let ctrl = &self.spec.controller;
        ctrl.provisioner.is_some()
            || ctrl.attacher.is_some()
            || ctrl.snapshotter.is_some()
            || ctrl.resizer.is_some()
            || ctrl.cluster_registrar.is_some()
            || ctrl.liveness_probe.is_some()
    }

    /// Current status, or a default when none has been written yet.
    pub fn status_or_default(&self) -> CsiDeploymentStatus {
        self.status.clone().unwrap_or_default()
    }
}

impl CsiDeploymentStatus {
    /// Find a condition by type.
    pub fn condition(&self, r#type: &str) -> Option<&CsiCondition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(spec: CsiDeploymentSpec) -> CsiDeployment {
        CsiDeployment {
            metadata: Default::default(),
            spec,
            status: None,
        }
    }

    #[test]
    fn test_version_serde_names() {
        assert_eq!(serde_json::to_string(&CsiVersion::Custom).unwrap(), r#""""#);
        assert_eq!(serde_json::to_string(&CsiVersion::V1).unwrap(), r#""v1""#);
        assert_eq!(
            serde_json::from_str::<CsiVersion>(r#""v1p1""#).unwrap(),
            CsiVersion::V1p1
        );
    }

    #[test]
    fn test_default_version_is_custom() {
        let spec: CsiDeploymentSpec =
            serde_json::from_str(r#"{"driverName": "csi-rbd"}"#).unwrap();
        assert_eq!(spec.version, CsiVersion::Custom);
        assert!(spec.parameters.is_empty());
    }

    #[test]
    fn test_has_controller() {
        let mut spec = CsiDeploymentSpec {
            driver_name: "csi-rbd".into(),
            ..Default::default()
        };
        assert!(!deployment(spec.clone()).has_controller());

        spec.controller.provisioner = Some(Component::default());
        assert!(deployment(spec).has_controller());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(CsiPhase::Pending.to_string(), "Pending");
        assert_eq!(CsiPhase::Running.to_string(), "Running");
        assert_eq!(CsiPhase::Failed.to_string(), "Failed");
    }
}

impl Default for CsiDeploymentSpec {
    fn default() -> Self {
        Self {
            version: CsiVersion::Custom,
            driver_name: String::new(),
            parameters: BTreeMap::new(),
            driver_template: None,
            node: NodeComponents::default(),
            controller: ControllerComponents::default(),
            secrets: Vec::new(),
            storage_classes: Vec::new(),
            config_maps: Vec::new(),
        }
    }
}
