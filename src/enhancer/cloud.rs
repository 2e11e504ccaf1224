//! Cloud enhancement strategies
//!
//! Expands the cloud block (`csi-cloud-cbs`) and cloud filesystem
//! (`csi-cloud-cfs`) drivers: host pod template wired to the cloud API via a
//! derived credentials Secret, sidecar images from the version table, and
//! per-tier StorageClasses.

use crate::config::OperatorConfig;
use crate::crd::{
    CsiDeployment, CsiDeploymentSpec, CsiVersion, DriverTemplate, DRIVER_CLOUD_BLOCK,
    DRIVER_CLOUD_FS,
};
use crate::enhancer::{
    enhance_components, image_path, secret_name, set_liveness_probe_ports, versions, Enhance,
};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    Secret, SecretKeySelector, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::sync::Arc;

// Parameter keys carrying the cloud API credentials, base64 encoded.
const SECRET_ID_KEY: &str = "secretID";
const SECRET_KEY_KEY: &str = "secretKey";

/// Environment variables the cloud drivers read their credentials from.
pub const CLOUD_API_SECRET_ID_ENV: &str = "CLOUD_API_SECRET_ID";
pub const CLOUD_API_SECRET_KEY_ENV: &str = "CLOUD_API_SECRET_KEY";

const BLOCK_NODE_PROBE_PORT: &str = "9829";
const BLOCK_CONTROLLER_PROBE_PORT: &str = "9828";
const FS_NODE_PROBE_PORT: &str = "9839";
const FS_CONTROLLER_PROBE_PORT: &str = "9838";

// =============================================================================
// Strategy
// =============================================================================

/// Enhancer for cloud block and filesystem deployments.
pub struct CloudEnhancer {
    config: Arc<OperatorConfig>,
}

impl CloudEnhancer {
    pub fn new(config: Arc<OperatorConfig>) -> Self {
        Self { config }
    }
}

impl Enhance for CloudEnhancer {
    fn enhance(&self, deploy: &CsiDeployment) -> Result<CsiDeploymentSpec> {
        match deploy.spec.driver_name.as_str() {
            DRIVER_CLOUD_BLOCK => self.enhance_block(deploy),
            DRIVER_CLOUD_FS => self.enhance_filesystem(deploy),
            other => Err(Error::Enhance(format!("not a cloud driver: {other}"))),
        }
    }
}

impl CloudEnhancer {
    fn enhance_block(&self, deploy: &CsiDeployment) -> Result<CsiDeploymentSpec> {
        let images = versions::lookup(&deploy.spec.driver_name, deploy.spec.version)?;
        let mut spec = deploy.spec.clone();

        enhance_components(&self.config, &mut spec, images);
        set_liveness_probe_ports(&mut spec, BLOCK_NODE_PROBE_PORT, BLOCK_CONTROLLER_PROBE_PORT);

        spec.driver_template = Some(self.driver_template(
            "csi-cloud-cbs",
            images.driver,
            &spec,
            true,
        ));

        if let Some(credentials) = self.credentials(deploy)? {
            spec.secrets = vec![self.credentials_secret(deploy, &spec, &credentials)];
            spec.storage_classes = block_storage_classes(&spec.driver_name);
        }

        Ok(spec)
    }

    fn enhance_filesystem(&self, deploy: &CsiDeployment) -> Result<CsiDeploymentSpec> {
        let images = versions::lookup(&deploy.spec.driver_name, deploy.spec.version)?;
        let mut spec = deploy.spec.clone();

        enhance_components(&self.config, &mut spec, images);
        set_liveness_probe_ports(&mut spec, FS_NODE_PROBE_PORT, FS_CONTROLLER_PROBE_PORT);

        spec.driver_template = Some(self.driver_template(
            "csi-cloud-cfs",
            images.driver,
            &spec,
            false,
        ));

        if let Some(credentials) = self.credentials(deploy)? {
            spec.secrets = vec![self.credentials_secret(deploy, &spec, &credentials)];
            spec.storage_classes = filesystem_storage_classes(&spec.driver_name);
        }

        Ok(spec)
    }

    fn driver_template(
        &self,
        container_name: &str,
        driver_tag: &str,
        spec: &CsiDeploymentSpec,
        host_ipc: bool,
    ) -> DriverTemplate {
        let secret = secret_name(&spec.driver_name);
        // The 1.x drivers ship a static binary at the image root.
        let command = match spec.version {
            CsiVersion::V0 => format!("/bin/{container_name}"),
            _ => format!("/{container_name}"),
        };

        DriverTemplate {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    host_network: Some(true),
                    host_pid: Some(true),
                    host_ipc: host_ipc.then_some(true),
                    dns_policy: Some("ClusterFirstWithHostNet".to_string()),
                    tolerations: Some(vec![Toleration {
                        key: Some("node-role.kubernetes.io/master".to_string()),
                        effect: Some("NoSchedule".to_string()),
                        ..Default::default()
                    }]),
                    containers: vec![Container {
                        name: container_name.to_string(),
                        image: Some(image_path(&self.config.registry_domain, driver_tag)),
                        command: Some(vec![command]),
                        args: Some(vec![
                            "--v=5".to_string(),
                            "--logtostderr=true".to_string(),
                            "--endpoint=$(CSI_ENDPOINT)".to_string(),
                        ]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            capabilities: Some(Capabilities {
                                add: Some(vec!["SYS_ADMIN".to_string()]),
                                ..Default::default()
                            }),
                            allow_privilege_escalation: Some(true),
                            ..Default::default()
                        }),
                        env: Some(vec![
                            secret_env(CLOUD_API_SECRET_ID_ENV, &secret),
                            secret_env(CLOUD_API_SECRET_KEY_ENV, &secret),
                        ]),
                        image_pull_policy: Some("Always".to_string()),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "device-dir".to_string(),
                            mount_path: "/dev".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "device-dir".to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: "/dev".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            rules: Vec::new(),
        }
    }

    fn credentials_secret(
        &self,
        deploy: &CsiDeployment,
        spec: &CsiDeploymentSpec,
        credentials: &CloudCredentials,
    ) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(
            CLOUD_API_SECRET_ID_ENV.to_string(),
            ByteString(credentials.secret_id.clone()),
        );
        data.insert(
            CLOUD_API_SECRET_KEY_ENV.to_string(),
            ByteString(credentials.secret_key.clone()),
        );
        Secret {
            metadata: ObjectMeta {
                name: Some(secret_name(&spec.driver_name)),
                namespace: Some(deploy.namespace().to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    /// API credentials from the deployment parameters, falling back to the
    /// global configuration. Absent credentials skip the derived artifacts;
    /// undecodable ones are a permanent error.
    fn credentials(&self, deploy: &CsiDeployment) -> Result<Option<CloudCredentials>> {
        let params = &deploy.spec.parameters;
        let fallback = &self.config.cloud;

        let encoded_id = params
            .get(SECRET_ID_KEY)
            .cloned()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.secret_id.clone());
        let encoded_key = params
            .get(SECRET_KEY_KEY)
            .cloned()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.secret_key.clone());

        if encoded_id.is_empty() || encoded_key.is_empty() {
            return Ok(None);
        }

        let secret_id = BASE64
            .decode(&encoded_id)
            .map_err(|e| Error::MalformedCredentials(format!("secretID decoding failed: {e}")))?;
        let secret_key = BASE64
            .decode(&encoded_key)
            .map_err(|e| Error::MalformedCredentials(format!("secretKey decoding failed: {e}")))?;

        Ok(Some(CloudCredentials {
            secret_id,
            secret_key,
        }))
    }
}

struct CloudCredentials {
    secret_id: Vec<u8>,
    secret_key: Vec<u8>,
}

fn secret_env(name: &str, secret: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One StorageClass per disk tier.
fn block_storage_classes(driver: &str) -> Vec<StorageClass> {
    let tier = |name: &str, parameters: BTreeMap<String, String>| StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: driver.to_string(),
        reclaim_policy: Some("Delete".to_string()),
        parameters: Some(parameters),
        ..Default::default()
    };

    vec![
        tier(
            "cbs-basic-prepaid",
            BTreeMap::from([
                ("diskType".to_string(), "CLOUD_BASIC".to_string()),
                ("diskChargeType".to_string(), "PREPAID".to_string()),
                ("diskChargeTypePrepaidPeriod".to_string(), "2".to_string()),
                (
                    "diskChargePrepaidRenewFlag".to_string(),
                    "NOTIFY_AND_AUTO_RENEW".to_string(),
                ),
            ]),
        ),
        tier(
            "cbs-premium",
            BTreeMap::from([("diskType".to_string(), "CLOUD_PREMIUM".to_string())]),
        ),
        tier(
            "cbs-ssd",
            BTreeMap::from([("diskType".to_string(), "CLOUD_SSD".to_string())]),
        ),
    ]
}

fn filesystem_storage_classes(driver: &str) -> Vec<StorageClass> {
    vec![StorageClass {
        metadata: ObjectMeta {
            name: Some(driver.to_string()),
            ..Default::default()
        },
        provisioner: driver.to_string(),
        reclaim_policy: Some("Delete".to_string()),
        parameters: Some(BTreeMap::from([(
            "storagetype".to_string(),
            "SD".to_string(),
        )])),
        ..Default::default()
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Component;
    use assert_matches::assert_matches;

    fn block_deployment() -> CsiDeployment {
        let mut deploy = CsiDeployment {
            metadata: Default::default(),
            spec: CsiDeploymentSpec {
                driver_name: DRIVER_CLOUD_BLOCK.to_string(),
                version: CsiVersion::V1,
                ..Default::default()
            },
            status: None,
        };
        deploy.metadata.name = Some("cbs".to_string());
        deploy.metadata.namespace = Some("kube-system".to_string());
        deploy.spec.node.node_registrar = Some(Component::default());
        deploy.spec.controller.provisioner = Some(Component::default());
        deploy.spec.parameters = BTreeMap::from([
            ("secretID".to_string(), BASE64.encode("id-123")),
            ("secretKey".to_string(), BASE64.encode("key-456")),
        ]);
        deploy
    }

    fn enhancer() -> CloudEnhancer {
        CloudEnhancer::new(Arc::new(OperatorConfig::default()))
    }

    #[test]
    fn test_block_storage_tiers_and_secret() {
        let deploy = block_deployment();
        let spec = enhancer().enhance(&deploy).unwrap();

        assert_eq!(spec.storage_classes.len(), 3);
        let names: Vec<_> = spec
            .storage_classes
            .iter()
            .map(|sc| sc.metadata.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["cbs-basic-prepaid", "cbs-premium", "cbs-ssd"]);
        for sc in &spec.storage_classes {
            assert_eq!(sc.provisioner, DRIVER_CLOUD_BLOCK);
        }

        let data = spec.secrets[0].data.as_ref().unwrap();
        assert_eq!(
            data.get(CLOUD_API_SECRET_ID_ENV),
            Some(&ByteString(b"id-123".to_vec()))
        );
        assert_eq!(
            data.get(CLOUD_API_SECRET_KEY_ENV),
            Some(&ByteString(b"key-456".to_vec()))
        );

        // The 1.x driver binary lives at the image root.
        let pod = spec.driver_template.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(
            pod.containers[0].command.as_ref().unwrap(),
            &vec!["/csi-cloud-cbs".to_string()]
        );
        assert_eq!(pod.host_ipc, Some(true));

        assert_eq!(spec.controller.replicas, 1);
    }

    #[test]
    fn test_malformed_credentials_is_permanent() {
        let mut deploy = block_deployment();
        deploy
            .spec
            .parameters
            .insert("secretID".to_string(), "%%%not-base64%%%".to_string());
        let err = enhancer().enhance(&deploy).unwrap_err();
        assert_matches!(err, Error::MalformedCredentials(_));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_absent_credentials_skip_artifacts() {
        let mut deploy = block_deployment();
        deploy.spec.parameters.clear();
        let spec = enhancer().enhance(&deploy).unwrap();
        assert!(spec.secrets.is_empty());
        assert!(spec.storage_classes.is_empty());
        assert!(spec.driver_template.is_some());
    }

    #[test]
    fn test_filesystem_single_class() {
        let mut deploy = block_deployment();
        deploy.spec.driver_name = DRIVER_CLOUD_FS.to_string();
        let spec = enhancer().enhance(&deploy).unwrap();

        assert_eq!(spec.storage_classes.len(), 1);
        assert_eq!(
            spec.storage_classes[0].metadata.name.as_deref(),
            Some(DRIVER_CLOUD_FS)
        );
        let pod = spec.driver_template.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.host_ipc, None);
    }

    #[test]
    fn test_enhance_is_deterministic() {
        let deploy = block_deployment();
        let first = enhancer().enhance(&deploy).unwrap();
        let second = enhancer().enhance(&deploy).unwrap();
        assert_eq!(first, second);
    }
}
