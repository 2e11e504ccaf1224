//! RBAC synchronization
//!
//! Each driver gets a node and, when controller sidecars are enabled, a
//! controller identity: ClusterRole + ServiceAccount + ClusterRoleBinding.
//! Role contents depend on which sidecars are declared. ClusterRoles and
//! ClusterRoleBindings are cluster-scoped and named by the deployment UID so
//! two deployments with the same name in different namespaces never collide.

use crate::controller::ops;
use crate::controller::ownership::{
    add_owner_labels, add_owner_reference, merge_object_meta, owner_label_selector, owner_labels,
};
use crate::controller::reconciler::Reconciler;
use crate::crd::CsiDeployment;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use tracing::{debug, info};

const NAME_PREFIX: &str = "csi-";
const NODE_TAG: &str = "node-";
const CONTROLLER_TAG: &str = "controller-";

/// ClusterRole and ClusterRoleBinding name, derived from the deployment UID.
pub(crate) fn cluster_role_name(deploy: &CsiDeployment, controller: bool) -> String {
    let tag = if controller { CONTROLLER_TAG } else { NODE_TAG };
    let uid = deploy.metadata.uid.as_deref().unwrap_or_default();
    format!("{NAME_PREFIX}{tag}{uid}")
}

/// ServiceAccount name, derived from the deployment name.
pub(crate) fn service_account_name(deploy: &CsiDeployment, controller: bool) -> String {
    let tag = if controller { CONTROLLER_TAG } else { NODE_TAG };
    format!("{NAME_PREFIX}{tag}{}", deploy.name())
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Rules needed by the node driver, plus any extra rules the driver
/// template declares.
pub(crate) fn generate_node_role(deploy: &CsiDeployment) -> ClusterRole {
    let mut rules = vec![
        rule(&[""], &["persistentvolumes"], &["get", "list", "watch", "update"]),
        rule(&[""], &["nodes"], &["get", "list", "update"]),
        rule(&[""], &["namespaces"], &["get", "list"]),
        rule(
            &["storage.k8s.io"],
            &["volumeattachments"],
            &["get", "list", "watch", "update"],
        ),
    ];
    if let Some(template) = &deploy.spec.driver_template {
        rules.extend(template.rules.iter().cloned());
    }

    ClusterRole {
        metadata: ObjectMeta {
            name: Some(cluster_role_name(deploy, false)),
            labels: Some(owner_labels(deploy)),
            ..Default::default()
        },
        rules: Some(rules),
        ..Default::default()
    }
}

/// Rules needed by the controller driver, depending on which sidecars are
/// declared.
pub(crate) fn generate_controller_role(deploy: &CsiDeployment) -> ClusterRole {
    let ctrl = &deploy.spec.controller;
    let mut rules = vec![
        rule(
            &[""],
            &["persistentvolumes"],
            &["get", "list", "watch", "update", "create", "delete"],
        ),
        rule(&[""], &["events"], &["list", "watch", "create", "update", "patch"]),
        // Leader election of the sidecars.
        rule(
            &[""],
            &["configmaps", "endpoints"],
            &["get", "list", "watch", "update", "create", "delete"],
        ),
        rule(
            &["coordination.k8s.io"],
            &["leases"],
            &["get", "list", "watch", "update", "create", "delete"],
        ),
    ];

    let needs_secret_rule = ctrl.provisioner.is_some()
        || ctrl.attacher.is_some()
        || ctrl.resizer.is_some()
        || ctrl.snapshotter.is_some();
    if needs_secret_rule {
        rules.push(rule(&[""], &["secrets"], &["get", "list"]));
    }

    if ctrl.provisioner.is_some() {
        rules.push(rule(
            &[""],
            &["persistentvolumeclaims"],
            &["get", "list", "watch", "update"],
        ));
        rules.push(rule(
            &["storage.k8s.io"],
            &["storageclasses"],
            &["get", "list", "watch"],
        ));
    }

    if ctrl.attacher.is_some() {
        rules.push(rule(
            &[""],
            &["nodes"],
            &["get", "list", "watch", "update", "patch"],
        ));
        rules.push(rule(
            &["storage.k8s.io"],
            &["volumeattachments"],
            &["get", "list", "watch", "update"],
        ));
        rules.push(rule(
            &["storage.k8s.io"],
            &["csinodes"],
            &["get", "list", "watch", "update"],
        ));
    }

    if ctrl.snapshotter.is_some() {
        rules.push(rule(
            &["snapshot.storage.k8s.io"],
            &["volumesnapshotclasses"],
            &["get", "list", "watch"],
        ));
        rules.push(rule(
            &["snapshot.storage.k8s.io"],
            &["volumesnapshotcontents"],
            &["create", "get", "list", "watch", "update", "delete"],
        ));
        rules.push(rule(
            &["snapshot.storage.k8s.io"],
            &["volumesnapshots"],
            &["get", "list", "watch", "update"],
        ));
        rules.push(rule(
            &["apiextensions.k8s.io"],
            &["customresourcedefinitions"],
            &["create", "list", "watch", "delete"],
        ));
    }

    // The provisioner rules already cover everything the resizer reads.
    if ctrl.resizer.is_some() && ctrl.provisioner.is_none() {
        rules.push(rule(
            &[""],
            &["persistentvolumeclaims"],
            &["get", "list", "watch"],
        ));
        rules.push(rule(
            &[""],
            &["persistentvolumeclaims/status"],
            &["update", "patch"],
        ));
        rules.push(rule(
            &["storage.k8s.io"],
            &["storageclasses"],
            &["get", "list", "watch"],
        ));
    }

    if ctrl.cluster_registrar.is_some() {
        rules.push(rule(&["storage.k8s.io"], &["csidrivers"], &["create", "delete"]));
    }

    ClusterRole {
        metadata: ObjectMeta {
            name: Some(cluster_role_name(deploy, true)),
            labels: Some(owner_labels(deploy)),
            ..Default::default()
        },
        rules: Some(rules),
        ..Default::default()
    }
}

pub(crate) fn generate_service_account(deploy: &CsiDeployment, controller: bool) -> ServiceAccount {
    let mut sa = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(service_account_name(deploy, controller)),
            namespace: Some(deploy.namespace().to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    add_owner_labels(&mut sa.metadata, deploy);
    add_owner_reference(&mut sa.metadata, deploy);
    sa
}

pub(crate) fn generate_cluster_role_binding(
    deploy: &CsiDeployment,
    controller: bool,
) -> ClusterRoleBinding {
    let mut crb = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(cluster_role_name(deploy, controller)),
            ..Default::default()
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name(deploy, controller),
            namespace: Some(deploy.namespace().to_string()),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role_name(deploy, controller),
        },
    };
    add_owner_labels(&mut crb.metadata, deploy);
    crb
}

impl Reconciler {
    /// Converge ClusterRoles, ServiceAccounts and ClusterRoleBindings.
    /// Returns true if any of the three kinds changed.
    pub(crate) async fn sync_rbac_objects(&self, deploy: &CsiDeployment) -> Result<bool> {
        let mut changed = false;
        let mut errs = Vec::new();

        match self.sync_cluster_roles(deploy).await {
            Ok(updated) => changed = changed || updated,
            Err(err) => errs.push(err),
        }
        match self.sync_service_accounts(deploy).await {
            Ok(updated) => changed = changed || updated,
            Err(err) => errs.push(err),
        }
        match self.sync_cluster_role_bindings(deploy).await {
            Ok(updated) => changed = changed || updated,
            Err(err) => errs.push(err),
        }

        match Error::aggregate(errs) {
            None if changed => Ok(true),
            None => Ok(false),
            Some(err) => Err(err),
        }
    }

    async fn sync_cluster_roles(&self, deploy: &CsiDeployment) -> Result<bool> {
        let api: Api<ClusterRole> = self.api_cluster();
        let mut desired = vec![generate_node_role(deploy)];
        if deploy.has_controller() {
            desired.push(generate_controller_role(deploy));
        }

        let mut changed = false;
        let mut errs = Vec::new();
        for role in desired {
            let name = role.metadata.name.clone().unwrap_or_default();
            let result: Result<bool> = async {
                let Some(exist) = ops::get_opt(&api, &name).await? else {
                    info!(cluster_role = %name, owner = %deploy.name(), "creating cluster role");
                    ops::create(&api, &role).await?;
                    return Ok(true);
                };

                let mut update = exist.clone();
                let mut updated = merge_object_meta(&role.metadata, &mut update.metadata);
                if update.rules != role.rules {
                    update.rules = role.rules.clone();
                    updated = true;
                }
                if updated {
                    info!(cluster_role = %name, owner = %deploy.name(), "updating cluster role");
                    ops::replace(&api, &name, &update).await?;
                }
                Ok(updated)
            }
            .await;

            match result {
                Ok(updated) => changed = changed || updated,
                Err(err) => errs.push(err),
            }
        }

        match Error::aggregate(errs) {
            None => Ok(changed),
            Some(err) => Err(err),
        }
    }

    async fn sync_service_accounts(&self, deploy: &CsiDeployment) -> Result<bool> {
        let api: Api<ServiceAccount> = self.api_namespaced(deploy.namespace());
        let mut desired = vec![generate_service_account(deploy, false)];
        if deploy.has_controller() {
            desired.push(generate_service_account(deploy, true));
        }

        let mut changed = false;
        let mut errs = Vec::new();
        for account in desired {
            let name = account.metadata.name.clone().unwrap_or_default();
            let result: Result<bool> = async {
                let Some(exist) = ops::get_opt(&api, &name).await? else {
                    info!(service_account = %name, owner = %deploy.name(), "creating service account");
                    ops::create(&api, &account).await?;
                    return Ok(true);
                };

                let mut update = exist.clone();
                if merge_object_meta(&account.metadata, &mut update.metadata) {
                    ops::replace(&api, &name, &update).await?;
                    return Ok(true);
                }
                Ok(false)
            }
            .await;

            match result {
                Ok(updated) => changed = changed || updated,
                Err(err) => errs.push(err),
            }
        }

        match Error::aggregate(errs) {
            None => Ok(changed),
            Some(err) => Err(err),
        }
    }

    async fn sync_cluster_role_bindings(&self, deploy: &CsiDeployment) -> Result<bool> {
        let api: Api<ClusterRoleBinding> = self.api_cluster();
        let mut desired = vec![generate_cluster_role_binding(deploy, false)];
        if deploy.has_controller() {
            desired.push(generate_cluster_role_binding(deploy, true));
        }

        let mut changed = false;
        let mut errs = Vec::new();
        for binding in desired {
            let name = binding.metadata.name.clone().unwrap_or_default();
            let result: Result<bool> = async {
                let Some(exist) = ops::get_opt(&api, &name).await? else {
                    info!(binding = %name, owner = %deploy.name(), "creating cluster role binding");
                    ops::create(&api, &binding).await?;
                    return Ok(true);
                };

                let mut update = exist.clone();
                let mut updated = merge_object_meta(&binding.metadata, &mut update.metadata);
                if update.subjects != binding.subjects {
                    update.subjects = binding.subjects.clone();
                    updated = true;
                }
                if update.role_ref != binding.role_ref {
                    update.role_ref = binding.role_ref.clone();
                    updated = true;
                }
                if updated {
                    info!(binding = %name, owner = %deploy.name(), "updating cluster role binding");
                    ops::replace(&api, &name, &update).await?;
                }
                Ok(updated)
            }
            .await;

            match result {
                Ok(updated) => changed = changed || updated,
                Err(err) => errs.push(err),
            }
        }

        match Error::aggregate(errs) {
            None => Ok(changed),
            Some(err) => Err(err),
        }
    }

    /// Delete every cluster-scoped RBAC object owned by the deployment.
    /// ServiceAccounts are namespaced and left to native garbage collection.
    pub(crate) async fn clear_rbac_objects(&self, deploy: &CsiDeployment) -> Result<()> {
        let mut errs = Vec::new();

        let roles: Api<ClusterRole> = self.api_cluster();
        match ops::list_labeled(&roles, &owner_label_selector(deploy)).await {
            Ok(existing) => {
                for role in existing {
                    let name = role.metadata.name.clone().unwrap_or_default();
                    match ops::delete(&roles, &name).await {
                        Ok(()) => debug!(cluster_role = %name, "cluster role deleted"),
                        Err(err) => errs.push(err),
                    }
                }
            }
            Err(err) => errs.push(err),
        }

        let bindings: Api<ClusterRoleBinding> = self.api_cluster();
        match ops::list_labeled(&bindings, &owner_label_selector(deploy)).await {
            Ok(existing) => {
                for binding in existing {
                    let name = binding.metadata.name.clone().unwrap_or_default();
                    match ops::delete(&bindings, &name).await {
                        Ok(()) => debug!(binding = %name, "cluster role binding deleted"),
                        Err(err) => errs.push(err),
                    }
                }
            }
            Err(err) => errs.push(err),
        }

        match Error::aggregate(errs) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Component, CsiDeploymentSpec, DriverTemplate};

    fn deployment() -> CsiDeployment {
        let mut deploy = CsiDeployment {
            metadata: Default::default(),
            spec: CsiDeploymentSpec {
                driver_name: "csi-rbd".to_string(),
                ..Default::default()
            },
            status: None,
        };
        deploy.metadata.name = Some("ceph".to_string());
        deploy.metadata.namespace = Some("kube-system".to_string());
        deploy.metadata.uid = Some("7a1d".to_string());
        deploy
    }

    #[test]
    fn test_names_derive_from_uid_and_name() {
        let deploy = deployment();
        assert_eq!(cluster_role_name(&deploy, false), "csi-node-7a1d");
        assert_eq!(cluster_role_name(&deploy, true), "csi-controller-7a1d");
        assert_eq!(service_account_name(&deploy, false), "csi-node-ceph");
        assert_eq!(service_account_name(&deploy, true), "csi-controller-ceph");
    }

    #[test]
    fn test_node_role_includes_template_rules() {
        let mut deploy = deployment();
        deploy.spec.driver_template = Some(DriverTemplate {
            rules: vec![rule(&[""], &["configmaps"], &["get"])],
            ..Default::default()
        });

        let role = generate_node_role(&deploy);
        let rules = role.rules.as_ref().unwrap();
        assert_eq!(rules.len(), 5);
        assert_eq!(
            rules.last().unwrap().resources,
            Some(vec!["configmaps".to_string()])
        );
        assert!(role.metadata.labels.is_some());
    }

    #[test]
    fn test_controller_role_grows_with_sidecars() {
        let mut deploy = deployment();
        let base_len = generate_controller_role(&deploy)
            .rules
            .as_ref()
            .unwrap()
            .len();

        deploy.spec.controller.provisioner = Some(Component::default());
        let with_provisioner = generate_controller_role(&deploy)
            .rules
            .as_ref()
            .unwrap()
            .len();
        // secrets rule + two provisioner rules
        assert_eq!(with_provisioner, base_len + 3);

        // Resizer rules fold into the provisioner's.
        deploy.spec.controller.resizer = Some(Component::default());
        assert_eq!(
            generate_controller_role(&deploy).rules.as_ref().unwrap().len(),
            with_provisioner
        );

        // Without the provisioner the resizer carries its own rules.
        deploy.spec.controller.provisioner = None;
        let resizer_role = generate_controller_role(&deploy);
        let resizer_only = resizer_role.rules.as_ref().unwrap();
        assert!(resizer_only
            .iter()
            .any(|r| r.resources == Some(vec!["persistentvolumeclaims/status".to_string()])));
    }

    #[test]
    fn test_cluster_role_binding_points_at_service_account() {
        let mut deploy = deployment();
        deploy.spec.controller.provisioner = Some(Component::default());

        let crb = generate_cluster_role_binding(&deploy, true);
        assert_eq!(crb.role_ref.name, "csi-controller-7a1d");
        let subject = &crb.subjects.as_ref().unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.name, "csi-controller-ceph");
        assert_eq!(subject.namespace.as_deref(), Some("kube-system"));
        assert!(crb.metadata.labels.is_some());
    }

    #[test]
    fn test_cluster_registrar_rule() {
        let mut deploy = deployment();
        deploy.spec.controller.cluster_registrar = Some(Component::default());
        let role = generate_controller_role(&deploy);
        assert!(role
            .rules
            .as_ref()
            .unwrap()
            .iter()
            .any(|r| r.resources == Some(vec!["csidrivers".to_string()])));
    }
}
