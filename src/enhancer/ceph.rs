//! Ceph enhancement strategies
//!
//! Expands the Ceph block (`csi-rbd`) and Ceph filesystem (`csi-cephfs`)
//! drivers: privileged host pod template, sidecar images from the version
//! table, and derived Secret / StorageClass / ConfigMap artifacts built from
//! the Ceph cluster parameters.

use crate::config::OperatorConfig;
use crate::crd::{
    CsiDeployment, CsiDeploymentSpec, CsiVersion, DriverTemplate, DRIVER_CEPH_FS, DRIVER_CEPH_RBD,
};
use crate::enhancer::{
    config_map_name, enhance_components, image_path, secret_name, set_liveness_probe_ports,
    versions, Enhance,
};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, HostPathVolumeSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// Parameter keys carrying Ceph cluster information.
const MONITORS_KEY: &str = "monitors";
const ADMIN_ID_KEY: &str = "adminID";
const ADMIN_KEYRING_KEY: &str = "adminKey";
const POOLS_KEY: &str = "pools";
// Multi-cluster configuration used by CephFS v1 deployments.
const CONFIGS_KEY: &str = "configs";

const RBD_NODE_PROBE_PORT: &str = "9809";
const RBD_CONTROLLER_PROBE_PORT: &str = "9808";
const CEPHFS_NODE_PROBE_PORT: &str = "9819";
const CEPHFS_CONTROLLER_PROBE_PORT: &str = "9818";

/// StorageClass parameter key pair referencing a Secret.
struct KeySet {
    name: &'static str,
    namespace: &'static str,
}

fn provisioner_secret_keys(version: CsiVersion) -> KeySet {
    match version {
        CsiVersion::V0 => KeySet {
            name: "csiProvisionerSecretName",
            namespace: "csiProvisionerSecretNamespace",
        },
        _ => KeySet {
            name: "csi.storage.k8s.io/provisioner-secret-name",
            namespace: "csi.storage.k8s.io/provisioner-secret-namespace",
        },
    }
}

fn controller_publish_secret_keys(version: CsiVersion) -> KeySet {
    match version {
        CsiVersion::V0 => KeySet {
            name: "csiControllerPublishSecretName",
            namespace: "csiControllerPublishSecretNamespace",
        },
        _ => KeySet {
            name: "csi.storage.k8s.io/controller-publish-secret-name",
            namespace: "csi.storage.k8s.io/controller-publish-secret-namespace",
        },
    }
}

fn controller_expand_secret_keys(version: CsiVersion) -> KeySet {
    match version {
        CsiVersion::V0 => KeySet {
            name: "csiControllerExpandSecretName",
            namespace: "csiControllerExpandSecretNamespace",
        },
        _ => KeySet {
            name: "csi.storage.k8s.io/controller-expand-secret-name",
            namespace: "csi.storage.k8s.io/controller-expand-secret-namespace",
        },
    }
}

/// RBD mounts secrets at publish time, CephFS at stage time.
fn node_secret_keys(version: CsiVersion, driver: &str) -> KeySet {
    match (version, driver) {
        (CsiVersion::V0, DRIVER_CEPH_RBD) => KeySet {
            name: "csiNodePublishSecretName",
            namespace: "csiNodePublishSecretNamespace",
        },
        (CsiVersion::V0, _) => KeySet {
            name: "csiNodeStageSecretName",
            namespace: "csiNodeStageSecretNamespace",
        },
        (_, DRIVER_CEPH_RBD) => KeySet {
            name: "csi.storage.k8s.io/node-publish-secret-name",
            namespace: "csi.storage.k8s.io/node-publish-secret-namespace",
        },
        (_, _) => KeySet {
            name: "csi.storage.k8s.io/node-stage-secret-name",
            namespace: "csi.storage.k8s.io/node-stage-secret-namespace",
        },
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// Enhancer for Ceph RBD and CephFS deployments.
pub struct CephEnhancer {
    config: Arc<OperatorConfig>,
}

impl CephEnhancer {
    pub fn new(config: Arc<OperatorConfig>) -> Self {
        Self { config }
    }
}

impl Enhance for CephEnhancer {
    fn enhance(&self, deploy: &CsiDeployment) -> Result<CsiDeploymentSpec> {
        match deploy.spec.driver_name.as_str() {
            DRIVER_CEPH_RBD => self.enhance_rbd(deploy),
            DRIVER_CEPH_FS => self.enhance_cephfs(deploy),
            other => Err(Error::Enhance(format!("not a ceph driver: {other}"))),
        }
    }
}

impl CephEnhancer {
    fn enhance_rbd(&self, deploy: &CsiDeployment) -> Result<CsiDeploymentSpec> {
        let images = versions::lookup(&deploy.spec.driver_name, deploy.spec.version)?;
        let mut spec = deploy.spec.clone();

        enhance_components(&self.config, &mut spec, images);
        set_liveness_probe_ports(&mut spec, RBD_NODE_PROBE_PORT, RBD_CONTROLLER_PROBE_PORT);

        let driver_image = image_path(&self.config.registry_domain, images.driver);
        spec.driver_template = Some(DriverTemplate {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    host_network: Some(true),
                    host_pid: Some(true),
                    dns_policy: Some("ClusterFirstWithHostNet".to_string()),
                    tolerations: Some(vec![master_toleration()]),
                    containers: vec![Container {
                        name: "csi-rbd".to_string(),
                        image: Some(driver_image),
                        security_context: Some(privileged_context()),
                        args: Some(vec![
                            "--nodeid=$(NODE_ID)".to_string(),
                            "--endpoint=$(CSI_ENDPOINT)".to_string(),
                            "--v=5".to_string(),
                            format!("--drivername={}", spec.driver_name),
                            "--containerized=true".to_string(),
                            "--metadatastorage=k8s_configmap".to_string(),
                        ]),
                        env: Some(
                            field_envs()
                                .into_iter()
                                .chain([EnvVar {
                                    name: "HOST_ROOTFS".to_string(),
                                    value: Some("/rootfs".to_string()),
                                    ..Default::default()
                                }])
                                .collect(),
                        ),
                        image_pull_policy: Some("Always".to_string()),
                        volume_mounts: Some(
                            host_volume_mounts()
                                .into_iter()
                                .chain([VolumeMount {
                                    name: "host-rootfs".to_string(),
                                    mount_path: "/rootfs".to_string(),
                                    ..Default::default()
                                }])
                                .collect(),
                        ),
                        ..Default::default()
                    }],
                    volumes: Some(
                        host_volumes()
                            .into_iter()
                            .chain([host_path_volume("host-rootfs", "/")])
                            .collect(),
                    ),
                    ..Default::default()
                }),
            },
            rules: Vec::new(),
        });

        if let Some(info) = self.ceph_info(deploy) {
            let (secrets, classes) = self.secret_and_storage_classes(deploy, &spec, &info);
            spec.secrets = secrets;
            spec.storage_classes = self.with_filesystems(&spec.driver_name, classes);
        }

        Ok(spec)
    }

    fn enhance_cephfs(&self, deploy: &CsiDeployment) -> Result<CsiDeploymentSpec> {
        let images = versions::lookup(&deploy.spec.driver_name, deploy.spec.version)?;
        let mut spec = deploy.spec.clone();

        enhance_components(&self.config, &mut spec, images);
        set_liveness_probe_ports(&mut spec, CEPHFS_NODE_PROBE_PORT, CEPHFS_CONTROLLER_PROBE_PORT);

        spec.driver_template = Some(self.cephfs_driver_template(images.driver, &spec));

        if deploy.spec.version == CsiVersion::V0 {
            if let Some(info) = self.ceph_info(deploy) {
                let (secrets, classes) = self.secret_and_storage_classes(deploy, &spec, &info);
                spec.secrets = secrets;
                spec.storage_classes = classes;
            }
        } else if let Some(configs) = self.ceph_cluster_configs(deploy)? {
            let (secrets, classes, config_maps) =
                self.multi_cluster_artifacts(deploy, &spec, configs);
            spec.secrets = secrets;
            spec.storage_classes = classes;
            spec.config_maps = config_maps;
        }

        Ok(spec)
    }

    fn cephfs_driver_template(&self, driver_tag: &str, spec: &CsiDeploymentSpec) -> DriverTemplate {
        let driver_image = image_path(&self.config.registry_domain, driver_tag);
        let mut pod_spec = PodSpec {
            host_network: Some(true),
            host_pid: Some(true),
            dns_policy: Some("ClusterFirstWithHostNet".to_string()),
            tolerations: Some(vec![master_toleration()]),
            containers: vec![Container {
                name: "csi-cephfs".to_string(),
                image: Some(driver_image),
                security_context: Some(privileged_context()),
                args: Some(vec![
                    "--nodeid=$(NODE_ID)".to_string(),
                    "--endpoint=$(CSI_ENDPOINT)".to_string(),
                    "--v=5".to_string(),
                    format!("--drivername={}", spec.driver_name),
                    "--metadatastorage=k8s_configmap".to_string(),
                ]),
                env: Some(field_envs()),
                image_pull_policy: Some("Always".to_string()),
                volume_mounts: Some(host_volume_mounts()),
                ..Default::default()
            }],
            volumes: Some(host_volumes()),
            ..Default::default()
        };

        // Cluster config and key cache mounts exist from v1 on.
        if spec.version != CsiVersion::V0 {
            let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
            volumes.push(Volume {
                name: "ceph-csi-config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(config_map_name(&spec.driver_name)),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volumes.push(Volume {
                name: "keys-tmp-dir".to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });

            let container = &mut pod_spec.containers[0];
            container.args = Some(vec![
                "--nodeid=$(NODE_ID)".to_string(),
                "--endpoint=$(CSI_ENDPOINT)".to_string(),
                "--v=5".to_string(),
                format!("--drivername={}", spec.driver_name),
                "--type=cephfs".to_string(),
            ]);
            if let Some(env) = &mut container.env {
                env.push(EnvVar {
                    name: "POD_IP".to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "status.podIP".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
            if let Some(mounts) = &mut container.volume_mounts {
                mounts.push(VolumeMount {
                    name: "ceph-csi-config".to_string(),
                    mount_path: "/etc/ceph-csi-config/".to_string(),
                    ..Default::default()
                });
                mounts.push(VolumeMount {
                    name: "keys-tmp-dir".to_string(),
                    mount_path: "/tmp/csi/keys".to_string(),
                    ..Default::default()
                });
            }
        }

        DriverTemplate {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(pod_spec),
            },
            rules: Vec::new(),
        }
    }

    /// One Secret holding the admin credentials and one StorageClass per
    /// pool. A single class takes the bare driver name.
    fn secret_and_storage_classes(
        &self,
        deploy: &CsiDeployment,
        spec: &CsiDeploymentSpec,
        info: &CephInfo,
    ) -> (Vec<k8s_openapi::api::core::v1::Secret>, Vec<StorageClass>) {
        let driver = spec.driver_name.as_str();
        let secret_name = secret_name(driver);
        let namespace = deploy.namespace().to_string();

        let mut data = BTreeMap::new();
        match driver {
            DRIVER_CEPH_FS => {
                data.insert("adminID".to_string(), byte_string(&info.admin_id));
                data.insert("adminKey".to_string(), byte_string(&info.admin_key));
            }
            _ => {
                data.insert(info.admin_id.clone(), byte_string(&info.admin_key));
            }
        }
        let secret = k8s_openapi::api::core::v1::Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        let provisioner_keys = provisioner_secret_keys(spec.version);
        let node_keys = node_secret_keys(spec.version, driver);

        let mut classes = Vec::new();
        for pool in &info.pools {
            let mut parameters = BTreeMap::new();
            parameters.insert("monitors".to_string(), info.monitors.clone());
            parameters.insert("pool".to_string(), pool.clone());
            parameters.insert("adminid".to_string(), info.admin_id.clone());
            parameters.insert("userid".to_string(), info.admin_id.clone());
            parameters.insert(provisioner_keys.name.to_string(), secret_name.clone());
            parameters.insert(provisioner_keys.namespace.to_string(), namespace.clone());
            parameters.insert(node_keys.name.to_string(), secret_name.clone());
            parameters.insert(node_keys.namespace.to_string(), namespace.clone());
            match driver {
                DRIVER_CEPH_RBD => {
                    parameters.insert("imageFormat".to_string(), "2".to_string());
                }
                DRIVER_CEPH_FS => {
                    parameters.insert("provisionVolume".to_string(), "true".to_string());
                }
                _ => {}
            }

            classes.push(StorageClass {
                metadata: ObjectMeta {
                    name: Some(format!("{driver}-{pool}")),
                    ..Default::default()
                },
                provisioner: driver.to_string(),
                reclaim_policy: Some("Delete".to_string()),
                parameters: Some(parameters),
                ..Default::default()
            });
        }

        if classes.len() == 1 {
            classes[0].metadata.name = Some(driver.to_string());
        }

        (vec![secret], classes)
    }

    /// Per-cluster Secrets and StorageClasses plus the cluster enumeration
    /// ConfigMap consumed by CephFS v1 drivers.
    fn multi_cluster_artifacts(
        &self,
        deploy: &CsiDeployment,
        spec: &CsiDeploymentSpec,
        configs: Vec<CephClusterConfig>,
    ) -> (
        Vec<k8s_openapi::api::core::v1::Secret>,
        Vec<StorageClass>,
        Vec<ConfigMap>,
    ) {
        let driver = spec.driver_name.as_str();
        let namespace = deploy.namespace().to_string();

        let mut secrets = Vec::new();
        let mut classes = Vec::new();
        let mut driver_configs = Vec::new();

        let publish_keys = controller_publish_secret_keys(spec.version);
        let expand_keys = controller_expand_secret_keys(spec.version);
        let provisioner_keys = provisioner_secret_keys(spec.version);
        let node_keys = node_secret_keys(spec.version, driver);

        for conf in configs {
            let cluster_secret_name = format!("{}-{}", secret_name(driver), conf.cluster_id);
            let mut data = BTreeMap::new();
            data.insert("adminID".to_string(), byte_string(&conf.admin_id));
            data.insert("adminKey".to_string(), byte_string(&conf.admin_key));
            if !conf.user_id.is_empty() && !conf.user_key.is_empty() {
                data.insert("userID".to_string(), byte_string(&conf.user_id));
                data.insert("userKey".to_string(), byte_string(&conf.user_key));
            }
            secrets.push(k8s_openapi::api::core::v1::Secret {
                metadata: ObjectMeta {
                    name: Some(cluster_secret_name.clone()),
                    namespace: Some(namespace.clone()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            });

            let fs_name = if conf.fs_name.is_empty() {
                "cephfs".to_string()
            } else {
                conf.fs_name.clone()
            };

            for pool in conf.pools.split(',') {
                let mut parameters = BTreeMap::new();
                parameters.insert("pool".to_string(), pool.to_string());
                parameters.insert("adminid".to_string(), conf.admin_id.clone());
                parameters.insert("userid".to_string(), conf.admin_id.clone());
                parameters.insert("clusterID".to_string(), conf.cluster_id.clone());
                parameters.insert("fsName".to_string(), fs_name.clone());
                parameters.insert("provisionVolume".to_string(), "true".to_string());
                for keys in [&publish_keys, &expand_keys, &provisioner_keys, &node_keys] {
                    parameters.insert(keys.name.to_string(), cluster_secret_name.clone());
                    parameters.insert(keys.namespace.to_string(), namespace.clone());
                }

                classes.push(StorageClass {
                    metadata: ObjectMeta {
                        name: Some(format!("{driver}-{}-{pool}", conf.cluster_id)),
                        ..Default::default()
                    },
                    provisioner: driver.to_string(),
                    reclaim_policy: Some("Delete".to_string()),
                    allow_volume_expansion: Some(true),
                    parameters: Some(parameters),
                    ..Default::default()
                });
            }

            driver_configs.push(CephDriverConfig {
                cluster_id: conf.cluster_id.clone(),
                monitors: conf.monitors.split(',').map(str::to_string).collect(),
                ceph_fs: (!conf.subvolume_group.is_empty()).then(|| CephFsDriverConfig {
                    subvolume_group: conf.subvolume_group.clone(),
                }),
            });
        }

        if classes.len() == 1 {
            classes[0].metadata.name = Some(driver.to_string());
        }

        let body = serde_json::to_string(&driver_configs).unwrap_or_else(|_| "[]".to_string());
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(config_map_name(driver)),
                namespace: Some(namespace),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("config.json".to_string(), body)])),
            ..Default::default()
        };

        (secrets, classes, vec![config_map])
    }

    /// Block volumes get one StorageClass per supported filesystem.
    fn with_filesystems(&self, driver: &str, classes: Vec<StorageClass>) -> Vec<StorageClass> {
        if driver != DRIVER_CEPH_RBD {
            return classes;
        }

        let mut result = Vec::new();
        for class in &classes {
            for fs in &self.config.filesystems {
                let mut sc = class.clone();
                if let Some(name) = &mut sc.metadata.name {
                    name.push('-');
                    name.push_str(fs);
                }
                if let Some(parameters) = &mut sc.parameters {
                    parameters.insert("fstype".to_string(), fs.clone());
                }
                result.push(sc);
            }
        }
        result
    }

    /// Cluster access info from the deployment parameters, falling back to
    /// the global configuration. Incomplete info means the user supplies
    /// secrets and classes manually; it is not an error.
    fn ceph_info(&self, deploy: &CsiDeployment) -> Option<CephInfo> {
        let params = &deploy.spec.parameters;
        let fallback = &self.config.ceph;

        let monitors = params
            .get(MONITORS_KEY)
            .cloned()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.monitors.clone());
        let admin_id = params
            .get(ADMIN_ID_KEY)
            .cloned()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.admin_id.clone());
        let admin_key = params
            .get(ADMIN_KEYRING_KEY)
            .cloned()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.admin_key.clone());
        let pools = params.get(POOLS_KEY).cloned().unwrap_or_default();

        if monitors.is_empty() || admin_id.is_empty() || admin_key.is_empty() || pools.is_empty() {
            return None;
        }

        Some(CephInfo {
            monitors,
            admin_id,
            admin_key,
            pools: pools.split(',').map(str::to_string).collect(),
        })
    }

    /// Multi-cluster configuration from the `configs` parameter. Absent is
    /// fine; malformed JSON is a permanent error.
    fn ceph_cluster_configs(&self, deploy: &CsiDeployment) -> Result<Option<Vec<CephClusterConfig>>> {
        let Some(body) = deploy.spec.parameters.get(CONFIGS_KEY) else {
            return Ok(None);
        };
        let configs: Vec<CephClusterConfig> = serde_json::from_str(body)
            .map_err(|e| Error::MalformedCredentials(format!("invalid ceph configs: {e}")))?;
        Ok(Some(configs))
    }
}

// =============================================================================
// Data shapes
// =============================================================================

/// Single-cluster access info.
struct CephInfo {
    monitors: String,
    admin_id: String,
    admin_key: String,
    pools: Vec<String>,
}

/// One entry of the `configs` multi-cluster parameter.
#[derive(Debug, Clone, Default, Deserialize)]
struct CephClusterConfig {
    #[serde(default)]
    monitors: String,
    #[serde(default, rename = "adminID")]
    admin_id: String,
    #[serde(default, rename = "adminKey")]
    admin_key: String,
    #[serde(default)]
    pools: String,
    #[serde(default, rename = "clusterID")]
    cluster_id: String,
    #[serde(default, rename = "fsName")]
    fs_name: String,
    #[serde(default, rename = "subvolumeGroup")]
    subvolume_group: String,
    #[serde(default, rename = "userID")]
    user_id: String,
    #[serde(default, rename = "userKey")]
    user_key: String,
}

/// Cluster entry written into the driver ConfigMap.
#[derive(Debug, Serialize)]
struct CephDriverConfig {
    #[serde(rename = "clusterID")]
    cluster_id: String,
    monitors: Vec<String>,
    #[serde(rename = "cephFS", skip_serializing_if = "Option::is_none")]
    ceph_fs: Option<CephFsDriverConfig>,
}

#[derive(Debug, Serialize)]
struct CephFsDriverConfig {
    #[serde(rename = "subvolumeGroup")]
    subvolume_group: String,
}

// =============================================================================
// Pod template pieces
// =============================================================================

fn byte_string(value: &str) -> ByteString {
    ByteString(value.as_bytes().to_vec())
}

fn master_toleration() -> Toleration {
    Toleration {
        key: Some("node-role.kubernetes.io/master".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }
}

fn privileged_context() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        capabilities: Some(Capabilities {
            add: Some(vec!["SYS_ADMIN".to_string()]),
            ..Default::default()
        }),
        allow_privilege_escalation: Some(true),
        ..Default::default()
    }
}

fn field_envs() -> Vec<EnvVar> {
    vec![
        EnvVar {
            name: "NODE_ID".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "spec.nodeName".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "POD_NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_volumes() -> Vec<Volume> {
    vec![
        host_path_volume("host-dev", "/dev"),
        host_path_volume("host-sys", "/sys"),
        host_path_volume("lib-modules", "/lib/modules"),
    ]
}

fn host_volume_mounts() -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: "host-dev".to_string(),
            mount_path: "/dev".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "host-sys".to_string(),
            mount_path: "/sys".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "lib-modules".to_string(),
            mount_path: "/lib/modules".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Component;
    use assert_matches::assert_matches;

    fn rbd_deployment() -> CsiDeployment {
        let mut deploy = CsiDeployment {
            metadata: Default::default(),
            spec: CsiDeploymentSpec {
                driver_name: DRIVER_CEPH_RBD.to_string(),
                version: CsiVersion::V1,
                ..Default::default()
            },
            status: None,
        };
        deploy.metadata.name = Some("ceph".to_string());
        deploy.metadata.namespace = Some("kube-system".to_string());
        deploy.spec.node.node_registrar = Some(Component::default());
        deploy.spec.parameters = BTreeMap::from([
            ("monitors".to_string(), "10.0.0.1:6789".to_string()),
            ("adminID".to_string(), "admin".to_string()),
            ("adminKey".to_string(), "s3cret".to_string()),
            ("pools".to_string(), "rbd".to_string()),
        ]);
        deploy
    }

    fn enhancer() -> CephEnhancer {
        CephEnhancer::new(Arc::new(OperatorConfig::default()))
    }

    #[test]
    fn test_rbd_well_known_scenario() {
        let deploy = rbd_deployment();
        let spec = enhancer().enhance(&deploy).unwrap();

        // Driver template with exactly one privileged container.
        let template = spec.driver_template.as_ref().unwrap();
        let pod = template.template.spec.as_ref().unwrap();
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(
            pod.containers[0]
                .security_context
                .as_ref()
                .unwrap()
                .privileged,
            Some(true)
        );

        // Registrar filled from the version table, no controller sidecars.
        assert!(spec
            .node
            .node_registrar
            .as_ref()
            .unwrap()
            .image
            .ends_with("csi-node-driver-registrar:v1.1.0"));
        assert!(spec.controller.provisioner.is_none());
        assert_eq!(spec.controller.replicas, 0);

        // One secret keyed by the admin id.
        assert_eq!(spec.secrets.len(), 1);
        let data = spec.secrets[0].data.as_ref().unwrap();
        assert_eq!(data.get("admin"), Some(&byte_string("s3cret")));

        // One storage class per configured filesystem.
        let filesystems = OperatorConfig::default().filesystems;
        assert_eq!(spec.storage_classes.len(), filesystems.len());
        for (sc, fs) in spec.storage_classes.iter().zip(&filesystems) {
            assert_eq!(sc.metadata.name.as_deref(), Some(format!("csi-rbd-{fs}").as_str()));
            assert_eq!(sc.provisioner, "csi-rbd");
            let params = sc.parameters.as_ref().unwrap();
            assert_eq!(params.get("fstype"), Some(fs));
            assert_eq!(params.get("pool"), Some(&"rbd".to_string()));
        }
    }

    #[test]
    fn test_enhance_is_deterministic_and_idempotent() {
        let deploy = rbd_deployment();
        let first = enhancer().enhance(&deploy).unwrap();
        let second = enhancer().enhance(&deploy).unwrap();
        assert_eq!(first, second);

        // Enhancing the already-enhanced spec changes nothing.
        let mut enhanced = deploy.clone();
        enhanced.spec = first.clone();
        let third = enhancer().enhance(&enhanced).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_missing_parameters_skip_derived_artifacts() {
        let mut deploy = rbd_deployment();
        deploy.spec.parameters.clear();
        let spec = enhancer().enhance(&deploy).unwrap();
        assert!(spec.secrets.is_empty());
        assert!(spec.storage_classes.is_empty());
        // The template is still synthesized.
        assert!(spec.driver_template.is_some());
    }

    #[test]
    fn test_cephfs_multi_cluster_configs() {
        let mut deploy = rbd_deployment();
        deploy.spec.driver_name = DRIVER_CEPH_FS.to_string();
        deploy.spec.parameters = BTreeMap::from([(
            "configs".to_string(),
            r#"[{"monitors": "10.0.0.1:6789,10.0.0.2:6789", "adminID": "admin",
                 "adminKey": "k", "pools": "a,b", "clusterID": "east",
                 "subvolumeGroup": "csi"}]"#
                .to_string(),
        )]);

        let spec = enhancer().enhance(&deploy).unwrap();
        assert_eq!(spec.secrets.len(), 1);
        assert_eq!(
            spec.secrets[0].metadata.name.as_deref(),
            Some("csi-cephfs-secret-east")
        );
        assert_eq!(spec.storage_classes.len(), 2);
        assert_eq!(
            spec.storage_classes[0].metadata.name.as_deref(),
            Some("csi-cephfs-east-a")
        );
        assert_eq!(spec.storage_classes[0].allow_volume_expansion, Some(true));

        let config_map = &spec.config_maps[0];
        assert_eq!(config_map.metadata.name.as_deref(), Some("csi-cephfs-config"));
        let body = config_map.data.as_ref().unwrap().get("config.json").unwrap();
        assert!(body.contains(r#""clusterID":"east""#));
        assert!(body.contains(r#""subvolumeGroup":"csi""#));

        // The v1 template mounts the cluster config.
        let pod = spec.driver_template.as_ref().unwrap().template.spec.as_ref().unwrap();
        let volumes = pod.volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == "ceph-csi-config"));
    }

    #[test]
    fn test_cephfs_malformed_configs_is_permanent() {
        let mut deploy = rbd_deployment();
        deploy.spec.driver_name = DRIVER_CEPH_FS.to_string();
        deploy.spec.parameters =
            BTreeMap::from([("configs".to_string(), "not json".to_string())]);

        let err = enhancer().enhance(&deploy).unwrap_err();
        assert_matches!(err, Error::MalformedCredentials(_));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_single_pool_takes_driver_name_before_fs_expansion() {
        let deploy = rbd_deployment();
        let spec = enhancer().enhance(&deploy).unwrap();
        // Base name is the bare driver, expanded once per filesystem.
        assert!(spec
            .storage_classes
            .iter()
            .all(|sc| sc.metadata.name.as_deref().unwrap().starts_with("csi-rbd-")));
    }
}
