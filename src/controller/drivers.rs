//! Workload synchronization
//!
//! Builds the node DaemonSet and controller Deployment from the enhanced
//! driver template and converges them against live state. Field-level diffing
//! of a full pod template is unreliable, so updates are driven by the
//! generation counters: a live generation that no longer matches the one
//! recorded in status means someone edited the workload out-of-band, and an
//! advanced deployment generation means the template itself may have changed.

use crate::config::OperatorConfig;
use crate::controller::ops;
use crate::controller::ownership::{merge_labels, merge_object_meta, owner_labels, owner_reference};
use crate::controller::rbac::service_account_name;
use crate::controller::reconciler::Reconciler;
use crate::crd::{ChildGeneration, Component, CsiDeployment};
use crate::enhancer::LIVENESS_PROBE_PORT_PARAM;
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentSpec,
    DeploymentStrategy,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, HostPathVolumeSource,
    ObjectFieldSelector, PodSpec, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use std::collections::BTreeMap;
use tracing::{debug, info};

const NODE_DRIVER_LABEL: &str = "storage.billyronks.io/nodedriver";
const CONTROLLER_DRIVER_LABEL: &str = "storage.billyronks.io/controllerdriver";

const SOCKET_VOLUME: &str = "csi-socket";
const REGISTRATION_VOLUME: &str = "registration-dir";
const POD_MOUNT_VOLUME: &str = "pod-mount";
const DEVICE_MOUNT_VOLUME: &str = "device-mount";

const DEVICE_MOUNT_REL_PATH: &str = "plugins/kubernetes.io/csi/volumeDevices";

const ENDPOINT_ENV_NAME: &str = "CSI_ENDPOINT";
const ENDPOINT_INSIDE_CONTAINER: &str = "/csi/csi.sock";
const SOCKET_MOUNT_DIR: &str = "/csi";

const LIVENESS_PROBE_PORT_NAME: &str = "healthz";
const LIVENESS_PROBE_PERIOD: i32 = 2;
const LIVENESS_PROBE_TIMEOUT: i32 = 3;
const LIVENESS_PROBE_INITIAL_DELAY: i32 = 10;
const LIVENESS_PROBE_FAILURE_THRESHOLD: i32 = 5;
// Node and controller default to different ports as some drivers run with
// host networking.
const NODE_LIVENESS_PROBE_PORT: i32 = 9808;
const CONTROLLER_LIVENESS_PROBE_PORT: i32 = 9809;

const SYSTEM_NAMESPACE: &str = "kube-system";

impl Reconciler {
    /// Converge the node driver DaemonSet.
    pub(crate) async fn sync_node_driver(
        &self,
        deploy: &CsiDeployment,
    ) -> Result<(Option<DaemonSet>, bool)> {
        let desired = generate_node_driver(&self.config, deploy)?;
        let name = desired.metadata.name.clone().unwrap_or_default();
        let api: Api<DaemonSet> = self.api_namespaced(deploy.namespace());

        let Some(exist) = ops::get_opt(&api, &name).await? else {
            let created = ops::create(&api, &desired).await?;
            info!(daemon_set = %name, owner = %deploy.name(), "created node driver");
            return Ok((Some(created), true));
        };

        let mut update = exist.clone();
        let meta_changed = merge_object_meta(&desired.metadata, &mut update.metadata);
        let status = deploy.status_or_default();
        let drifted = !has_same_generation(
            &status.children,
            "apps",
            "DaemonSet",
            deploy.namespace(),
            &name,
            exist.metadata.generation,
        );
        let spec_changed = status.observed_generation != deploy.metadata.generation;

        if meta_changed || drifted || spec_changed {
            update.spec = desired.spec;
            let updated = ops::replace(&api, &name, &update).await?;
            info!(daemon_set = %name, owner = %deploy.name(), "updated node driver");
            return Ok((Some(updated), true));
        }

        Ok((Some(update), false))
    }

    /// Converge the controller driver Deployment, if any controller sidecar
    /// is declared.
    pub(crate) async fn sync_controller_driver(
        &self,
        deploy: &CsiDeployment,
    ) -> Result<(Option<Deployment>, bool)> {
        if !deploy.has_controller() {
            debug!(owner = %deploy.name(), "controller service disabled");
            return Ok((None, false));
        }

        let desired = generate_controller_driver(deploy)?;
        let name = desired.metadata.name.clone().unwrap_or_default();
        let api: Api<Deployment> = self.api_namespaced(deploy.namespace());

        let Some(exist) = ops::get_opt(&api, &name).await? else {
            let created = ops::create(&api, &desired).await?;
            info!(deployment = %name, owner = %deploy.name(), "created controller driver");
            return Ok((Some(created), true));
        };

        let mut update = exist.clone();
        let meta_changed = merge_object_meta(&desired.metadata, &mut update.metadata);
        let status = deploy.status_or_default();
        let drifted = !has_same_generation(
            &status.children,
            "apps",
            "Deployment",
            deploy.namespace(),
            &name,
            exist.metadata.generation,
        );
        let spec_changed = status.observed_generation != deploy.metadata.generation;

        if meta_changed || drifted || spec_changed {
            update.spec = desired.spec;
            let updated = ops::replace(&api, &name, &update).await?;
            info!(deployment = %name, owner = %deploy.name(), "updated controller driver");
            return Ok((Some(updated), true));
        }

        Ok((Some(update), false))
    }
}

/// True if the recorded generation for this child matches the live one.
pub(crate) fn has_same_generation(
    children: &[ChildGeneration],
    group: &str,
    kind: &str,
    namespace: &str,
    name: &str,
    live_generation: Option<i64>,
) -> bool {
    children
        .iter()
        .filter(|c| c.group == group && c.kind == kind && c.namespace == namespace && c.name == name)
        .any(|c| Some(c.last_generation) == live_generation)
}

// =============================================================================
// Node driver generation
// =============================================================================

/// Build the node driver DaemonSet from the enhanced template.
pub(crate) fn generate_node_driver(
    config: &OperatorConfig,
    deploy: &CsiDeployment,
) -> Result<DaemonSet> {
    let mut template = driver_pod_template(deploy)?;
    let pod = template.spec.get_or_insert_with(PodSpec::default);

    if deploy.namespace() == SYSTEM_NAMESPACE {
        pod.priority_class_name = Some("system-cluster-critical".to_string());
    }
    pod.service_account_name = Some(service_account_name(deploy, false));

    if let Some(registrar) = &deploy.spec.node.node_registrar {
        pod.containers
            .push(node_registrar_container(config, deploy, registrar));
    }
    if let Some(probe) = &deploy.spec.node.liveness_probe {
        pod.containers
            .push(liveness_probe_container(probe, false));
    }

    pod.volumes
        .get_or_insert_with(Vec::new)
        .extend(node_driver_volumes(config, deploy));

    let driver = &mut pod.containers[0];
    driver
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .extend(node_driver_volume_mounts(config));
    driver
        .env
        .get_or_insert_with(Vec::new)
        .push(endpoint_env());
    if let Some(probe) = &deploy.spec.node.liveness_probe {
        inject_liveness_probe(driver, liveness_probe_port(&probe.parameters, false));
    }

    let name = format!("{}-node", deploy.name());
    let selected = BTreeMap::from([(NODE_DRIVER_LABEL.to_string(), name.clone())]);
    merge_labels(
        template.metadata.get_or_insert_with(Default::default),
        &selected,
    );

    Ok(DaemonSet {
        metadata: ObjectMeta {
            namespace: Some(deploy.namespace().to_string()),
            name: Some(name),
            labels: Some(owner_labels(deploy)),
            owner_references: Some(vec![owner_reference(deploy)]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selected),
                ..Default::default()
            },
            template,
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn node_driver_volumes(config: &OperatorConfig, deploy: &CsiDeployment) -> Vec<Volume> {
    let host_path = |name: &str, path: String, type_: &str| Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path,
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    };

    vec![
        // Driver socket dir, e.g. /var/lib/kubelet/plugins/csi-rbd.
        host_path(
            SOCKET_VOLUME,
            node_socket_dir(config, deploy),
            "DirectoryOrCreate",
        ),
        // Kubelet plugin registration dir watched by the registrar.
        host_path(
            REGISTRATION_VOLUME,
            kubelet_path(config, "plugins_registry"),
            "Directory",
        ),
        // Raw block device publish dir.
        host_path(
            DEVICE_MOUNT_VOLUME,
            kubelet_path(config, DEVICE_MOUNT_REL_PATH),
            "DirectoryOrCreate",
        ),
        // Per-pod volume publish dir.
        host_path(
            POD_MOUNT_VOLUME,
            kubelet_path(config, "pods"),
            "DirectoryOrCreate",
        ),
    ]
}

fn node_driver_volume_mounts(config: &OperatorConfig) -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: SOCKET_VOLUME.to_string(),
            mount_path: SOCKET_MOUNT_DIR.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: DEVICE_MOUNT_VOLUME.to_string(),
            mount_path: kubelet_path(config, DEVICE_MOUNT_REL_PATH),
            mount_propagation: Some("Bidirectional".to_string()),
            ..Default::default()
        },
        VolumeMount {
            name: POD_MOUNT_VOLUME.to_string(),
            mount_path: kubelet_path(config, "pods"),
            mount_propagation: Some("Bidirectional".to_string()),
            ..Default::default()
        },
    ]
}

fn node_registrar_container(
    config: &OperatorConfig,
    deploy: &CsiDeployment,
    component: &Component,
) -> Container {
    let mut registrar = Container {
        name: "node-driver-registrar".to_string(),
        image: Some(component.image.clone()),
        args: Some(vec![
            "--v=5".to_string(),
            "--csi-address=$(ADDRESS)".to_string(),
            "--kubelet-registration-path=$(DRIVER_REG_SOCK_PATH)".to_string(),
        ]),
        resources: Some(component.resources.clone()),
        env: Some(vec![
            EnvVar {
                name: "ADDRESS".to_string(),
                value: Some(ENDPOINT_INSIDE_CONTAINER.to_string()),
                ..Default::default()
            },
            // Socket path as seen by the kubelet on the host.
            EnvVar {
                name: "DRIVER_REG_SOCK_PATH".to_string(),
                value: Some(format!("{}/csi.sock", node_socket_dir(config, deploy))),
                ..Default::default()
            },
            EnvVar {
                name: "KUBE_NODE_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.nodeName".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: SOCKET_VOLUME.to_string(),
                mount_path: SOCKET_MOUNT_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: REGISTRATION_VOLUME.to_string(),
                mount_path: "/registration".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };
    copy_security_context(deploy, &mut registrar);
    registrar
}

/// Host directory holding the driver socket.
fn node_socket_dir(config: &OperatorConfig, deploy: &CsiDeployment) -> String {
    kubelet_path(
        config,
        &format!("plugins/{}", sanitize_driver_name(&deploy.spec.driver_name)),
    )
}

fn kubelet_path(config: &OperatorConfig, rel: &str) -> String {
    format!("{}/{rel}", config.kubelet_root_dir.trim_end_matches('/'))
}

/// Driver names may contain characters unusable in a directory name.
fn sanitize_driver_name(driver: &str) -> String {
    driver
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// =============================================================================
// Controller driver generation
// =============================================================================

/// Build the controller driver Deployment from the enhanced template.
pub(crate) fn generate_controller_driver(deploy: &CsiDeployment) -> Result<Deployment> {
    let mut template = driver_pod_template(deploy)?;
    let pod = template.spec.get_or_insert_with(PodSpec::default);

    if deploy.namespace() == SYSTEM_NAMESPACE {
        pod.priority_class_name = Some("system-cluster-critical".to_string());
    }
    pod.service_account_name = Some(service_account_name(deploy, true));

    let ctrl = &deploy.spec.controller;
    if let Some(provisioner) = &ctrl.provisioner {
        pod.containers.push(provisioner_container(deploy, provisioner));
    }
    if let Some(attacher) = &ctrl.attacher {
        pod.containers.push(attacher_container(deploy, attacher));
    }
    if let Some(resizer) = &ctrl.resizer {
        pod.containers.push(resizer_container(deploy, resizer));
    }
    if let Some(snapshotter) = &ctrl.snapshotter {
        pod.containers.push(snapshotter_container(deploy, snapshotter));
    }
    if let Some(registrar) = &ctrl.cluster_registrar {
        pod.containers
            .push(cluster_registrar_container(deploy, registrar));
    }
    if let Some(probe) = &ctrl.liveness_probe {
        pod.containers.push(liveness_probe_container(probe, true));
    }

    // The controller shares the socket over an ephemeral volume.
    pod.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: SOCKET_VOLUME.to_string(),
        empty_dir: Some(Default::default()),
        ..Default::default()
    });

    let driver = &mut pod.containers[0];
    driver
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name: SOCKET_VOLUME.to_string(),
            mount_path: SOCKET_MOUNT_DIR.to_string(),
            ..Default::default()
        });
    driver
        .env
        .get_or_insert_with(Vec::new)
        .push(endpoint_env());
    if let Some(probe) = &ctrl.liveness_probe {
        inject_liveness_probe(driver, liveness_probe_port(&probe.parameters, true));
    }

    let name = format!("{}-controller", deploy.name());
    let selected = BTreeMap::from([(CONTROLLER_DRIVER_LABEL.to_string(), name.clone())]);
    merge_labels(
        template.metadata.get_or_insert_with(Default::default),
        &selected,
    );

    Ok(Deployment {
        metadata: ObjectMeta {
            namespace: Some(deploy.namespace().to_string()),
            name: Some(name),
            labels: Some(owner_labels(deploy)),
            owner_references: Some(vec![owner_reference(deploy)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(selected),
                ..Default::default()
            },
            template,
            replicas: Some(ctrl.replicas),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn provisioner_container(deploy: &CsiDeployment, component: &Component) -> Container {
    let mut args = vec![
        "--v=5".to_string(),
        "--csi-address=$(ADDRESS)".to_string(),
        "--enable-leader-election=true".to_string(),
    ];
    // Pre-1.0 provisioners take the driver name explicitly.
    if deploy.spec.version == crate::crd::CsiVersion::V0 {
        args.push(format!("--provisioner={}", deploy.spec.driver_name));
    }

    let mut provisioner = Container {
        name: "csi-provisioner".to_string(),
        image: Some(component.image.clone()),
        args: Some(args),
        resources: Some(component.resources.clone()),
        env: Some(sidecar_envs()),
        volume_mounts: Some(sidecar_volume_mounts()),
        ..Default::default()
    };
    copy_security_context(deploy, &mut provisioner);
    provisioner
}

fn attacher_container(deploy: &CsiDeployment, component: &Component) -> Container {
    let mut args = vec![
        "--v=5".to_string(),
        "--csi-address=$(ADDRESS)".to_string(),
        "--leader-election".to_string(),
        "--leader-election-namespace=$(MY_NAMESPACE)".to_string(),
        "--leader-election-identity=$(MY_NAME)".to_string(),
    ];
    // The 1.1 attacher line needs the lease election type spelled out.
    if matches!(
        deploy.spec.version,
        crate::crd::CsiVersion::V1 | crate::crd::CsiVersion::V1p1
    ) {
        args.push("--leader-election-type=leases".to_string());
    }

    let mut attacher = Container {
        name: "csi-attacher".to_string(),
        image: Some(component.image.clone()),
        args: Some(args),
        resources: Some(component.resources.clone()),
        env: Some(named_pod_envs()),
        volume_mounts: Some(sidecar_volume_mounts()),
        ..Default::default()
    };
    copy_security_context(deploy, &mut attacher);
    attacher
}

fn resizer_container(deploy: &CsiDeployment, component: &Component) -> Container {
    let mut resizer = Container {
        name: "csi-resizer".to_string(),
        image: Some(component.image.clone()),
        args: Some(vec![
            "--v=5".to_string(),
            "--csi-address=$(ADDRESS)".to_string(),
            "--leader-election".to_string(),
            "--leader-election-namespace=$(MY_NAMESPACE)".to_string(),
            "--leader-election-identity=$(MY_NAME)".to_string(),
        ]),
        resources: Some(component.resources.clone()),
        env: Some(named_pod_envs()),
        volume_mounts: Some(sidecar_volume_mounts()),
        ..Default::default()
    };
    copy_security_context(deploy, &mut resizer);
    resizer
}

fn snapshotter_container(deploy: &CsiDeployment, component: &Component) -> Container {
    let mut snapshotter = Container {
        name: "csi-snapshotter".to_string(),
        image: Some(component.image.clone()),
        args: Some(vec![
            "--v=5".to_string(),
            "--csi-address=$(ADDRESS)".to_string(),
            "--connection-timeout=1m".to_string(),
        ]),
        resources: Some(component.resources.clone()),
        env: Some(sidecar_envs()),
        volume_mounts: Some(sidecar_volume_mounts()),
        ..Default::default()
    };
    copy_security_context(deploy, &mut snapshotter);
    snapshotter
}

fn cluster_registrar_container(deploy: &CsiDeployment, component: &Component) -> Container {
    let mut registrar = Container {
        name: "cluster-driver-registrar".to_string(),
        image: Some(component.image.clone()),
        args: Some(vec![
            "--v=5".to_string(),
            "--csi-address=$(ADDRESS)".to_string(),
            "--pod-info-mount".to_string(),
        ]),
        resources: Some(component.resources.clone()),
        env: Some(sidecar_envs()),
        volume_mounts: Some(sidecar_volume_mounts()),
        ..Default::default()
    };
    copy_security_context(deploy, &mut registrar);
    registrar
}

// =============================================================================
// Shared pieces
// =============================================================================

/// The enhanced (or user-supplied) driver pod template, cloned for mutation.
fn driver_pod_template(
    deploy: &CsiDeployment,
) -> Result<k8s_openapi::api::core::v1::PodTemplateSpec> {
    let template = deploy
        .spec
        .driver_template
        .as_ref()
        .ok_or_else(|| Error::Validation("spec.driverTemplate: required".to_string()))?;
    let mut template = template.template.clone();
    let pod = template.spec.get_or_insert_with(PodSpec::default);
    if pod.containers.is_empty() {
        return Err(Error::Validation(
            "spec.driverTemplate: must have one and only one container".to_string(),
        ));
    }
    Ok(template)
}

fn liveness_probe_container(component: &Component, controller: bool) -> Container {
    let port = liveness_probe_port(&component.parameters, controller);
    Container {
        name: "liveness-probe".to_string(),
        image: Some(component.image.clone()),
        args: Some(vec![
            "--v=5".to_string(),
            "--csi-address=$(ADDRESS)".to_string(),
            format!("--health-port={port}"),
            format!("--connection-timeout={LIVENESS_PROBE_TIMEOUT}s"),
        ]),
        resources: Some(component.resources.clone()),
        env: Some(sidecar_envs()),
        volume_mounts: Some(sidecar_volume_mounts()),
        ..Default::default()
    }
}

/// Expose the health port on the driver container and probe it.
fn inject_liveness_probe(container: &mut Container, port: i32) {
    container
        .ports
        .get_or_insert_with(Vec::new)
        .push(ContainerPort {
            name: Some(LIVENESS_PROBE_PORT_NAME.to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    container.liveness_probe = Some(Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::String(LIVENESS_PROBE_PORT_NAME.to_string()),
            ..Default::default()
        }),
        period_seconds: Some(LIVENESS_PROBE_PERIOD),
        timeout_seconds: Some(LIVENESS_PROBE_TIMEOUT),
        failure_threshold: Some(LIVENESS_PROBE_FAILURE_THRESHOLD),
        initial_delay_seconds: Some(LIVENESS_PROBE_INITIAL_DELAY),
        ..Default::default()
    });
}

fn liveness_probe_port(parameters: &BTreeMap<String, String>, controller: bool) -> i32 {
    parameters
        .get(LIVENESS_PROBE_PORT_PARAM)
        .and_then(|v| v.parse().ok())
        .unwrap_or(if controller {
            CONTROLLER_LIVENESS_PROBE_PORT
        } else {
            NODE_LIVENESS_PROBE_PORT
        })
}

fn sidecar_envs() -> Vec<EnvVar> {
    vec![EnvVar {
        name: "ADDRESS".to_string(),
        value: Some(ENDPOINT_INSIDE_CONTAINER.to_string()),
        ..Default::default()
    }]
}

/// ADDRESS plus the pod identity envs used for leader election.
fn named_pod_envs() -> Vec<EnvVar> {
    let field_env = |name: &str, path: &str| EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut envs = vec![
        field_env("MY_NAME", "metadata.name"),
        field_env("MY_NAMESPACE", "metadata.namespace"),
    ];
    envs.extend(sidecar_envs());
    envs
}

fn sidecar_volume_mounts() -> Vec<VolumeMount> {
    vec![VolumeMount {
        name: SOCKET_VOLUME.to_string(),
        mount_path: SOCKET_MOUNT_DIR.to_string(),
        ..Default::default()
    }]
}

fn endpoint_env() -> EnvVar {
    EnvVar {
        name: ENDPOINT_ENV_NAME.to_string(),
        value: Some(format!("unix:/{ENDPOINT_INSIDE_CONTAINER}")),
        ..Default::default()
    }
}

/// Sidecars run under the same security context as the driver container.
fn copy_security_context(deploy: &CsiDeployment, container: &mut Container) {
    let context = deploy
        .spec
        .driver_template
        .as_ref()
        .and_then(|t| t.template.spec.as_ref())
        .and_then(|s| s.containers.first())
        .and_then(|c| c.security_context.as_ref());
    if let Some(context) = context {
        container.security_context = Some(context.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CsiDeploymentSpec, CsiVersion, DRIVER_CEPH_RBD};
    use crate::enhancer::{CephEnhancer, Enhance};
    use std::sync::Arc;

    fn enhanced_deployment() -> CsiDeployment {
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
        deploy.metadata.uid = Some("7a1d".to_string());
        deploy.metadata.generation = Some(1);
        deploy.spec.node.node_registrar = Some(Component::default());
        deploy.spec.node.liveness_probe = Some(Component::default());
        deploy.spec.controller.provisioner = Some(Component::default());
        deploy.spec.controller.attacher = Some(Component::default());

        let enhancer = CephEnhancer::new(Arc::new(OperatorConfig::default()));
        deploy.spec = enhancer.enhance(&deploy).unwrap();
        deploy
    }

    #[test]
    fn test_generate_node_driver() {
        let config = OperatorConfig::default();
        let deploy = enhanced_deployment();
        let ds = generate_node_driver(&config, &deploy).unwrap();

        assert_eq!(ds.metadata.name.as_deref(), Some("ceph-node"));
        let pod = ds.spec.as_ref().unwrap().template.spec.as_ref().unwrap();

        // Driver, registrar and probe containers.
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["csi-rbd", "node-driver-registrar", "liveness-probe"]);

        // kube-system deployments are cluster critical.
        assert_eq!(
            pod.priority_class_name.as_deref(),
            Some("system-cluster-critical")
        );
        assert_eq!(pod.service_account_name.as_deref(), Some("csi-node-ceph"));

        // The driver gets the endpoint env and the probe port.
        let driver = &pod.containers[0];
        let envs = driver.env.as_ref().unwrap();
        assert!(envs
            .iter()
            .any(|e| e.name == "CSI_ENDPOINT" && e.value.as_deref() == Some("unix://csi/csi.sock")));
        assert!(driver.liveness_probe.is_some());
        let port = &driver.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 9809);

        // Socket volume points at the sanitized driver dir.
        let volumes = pod.volumes.as_ref().unwrap();
        let socket = volumes.iter().find(|v| v.name == SOCKET_VOLUME).unwrap();
        assert_eq!(
            socket.host_path.as_ref().unwrap().path,
            "/var/lib/kubelet/plugins/csi-rbd"
        );

        // The registrar reports the host socket path to the kubelet.
        let registrar = &pod.containers[1];
        assert!(registrar.env.as_ref().unwrap().iter().any(|e| {
            e.name == "DRIVER_REG_SOCK_PATH"
                && e.value.as_deref() == Some("/var/lib/kubelet/plugins/csi-rbd/csi.sock")
        }));
        // Sidecars inherit the driver's security context.
        assert_eq!(
            registrar.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
    }

    #[test]
    fn test_generate_controller_driver() {
        let deploy = enhanced_deployment();
        let deployment = generate_controller_driver(&deploy).unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("ceph-controller"));
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));

        let pod = spec.template.spec.as_ref().unwrap();
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["csi-rbd", "csi-provisioner", "csi-attacher"]);

        // Socket is an ephemeral volume on the controller.
        let volumes = pod.volumes.as_ref().unwrap();
        let socket = volumes.iter().find(|v| v.name == SOCKET_VOLUME).unwrap();
        assert!(socket.empty_dir.is_some());
        assert!(socket.host_path.is_none());

        // The 1.x attacher needs the lease election type.
        let attacher = &pod.containers[2];
        assert!(attacher
            .args
            .as_ref()
            .unwrap()
            .contains(&"--leader-election-type=leases".to_string()));
    }

    #[test]
    fn test_sanitize_driver_name() {
        assert_eq!(sanitize_driver_name("csi-rbd"), "csi-rbd");
        assert_eq!(sanitize_driver_name("com.cloud.csi/cbs"), "com.cloud.csi-cbs");
        assert_eq!(sanitize_driver_name("a_b"), "a-b");
    }

    #[test]
    fn test_liveness_probe_port_parameter_override() {
        let params = BTreeMap::from([(LIVENESS_PROBE_PORT_PARAM.to_string(), "9999".to_string())]);
        assert_eq!(liveness_probe_port(&params, false), 9999);
        assert_eq!(liveness_probe_port(&BTreeMap::new(), false), 9808);
        assert_eq!(liveness_probe_port(&BTreeMap::new(), true), 9809);
    }

    #[test]
    fn test_has_same_generation() {
        let children = vec![ChildGeneration {
            group: "apps".to_string(),
            kind: "DaemonSet".to_string(),
            namespace: "kube-system".to_string(),
            name: "ceph-node".to_string(),
            last_generation: 4,
        }];

        assert!(has_same_generation(
            &children,
            "apps",
            "DaemonSet",
            "kube-system",
            "ceph-node",
            Some(4)
        ));
        // Out-of-band edit bumped the live generation.
        assert!(!has_same_generation(
            &children,
            "apps",
            "DaemonSet",
            "kube-system",
            "ceph-node",
            Some(5)
        ));
        // Unrecorded child is treated as drifted.
        assert!(!has_same_generation(
            &children,
            "apps",
            "Deployment",
            "kube-system",
            "ceph-controller",
            Some(1)
        ));
    }

    #[test]
    fn test_missing_template_is_a_validation_error() {
        let config = OperatorConfig::default();
        let mut deploy = enhanced_deployment();
        deploy.spec.driver_template = None;
        let err = generate_node_driver(&config, &deploy).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
