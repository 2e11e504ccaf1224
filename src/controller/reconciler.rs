//! CsiDeployment reconcile loop
//!
//! One invocation per event, at most one in flight per deployment identity
//! (guaranteed by the controller runtime). Each invocation works on a copy of
//! the fetched object, performs at most one enhancement persist and one
//! status persist, and drives every child synchronizer even when some of
//! them fail, so independent kinds keep converging.

use crate::config::OperatorConfig;
use crate::controller::conditions::{
    update_condition, CONDITION_CONTROLLER_AVAILABLE, CONDITION_NODE_AVAILABLE, CONDITION_SYNCED,
    CONDITION_VALIDATED,
};
use crate::controller::ownership::owner_of;
use crate::controller::{finalizer, ops, validation};
use crate::crd::{
    ChildGeneration, ConditionStatus, CsiDeployment, CsiPhase,
};
use crate::enhancer::EnhancerRegistry;
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, Resource};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue interval after a successful reconciliation.
const RESYNC_SECONDS: u64 = 300;
/// Base delay for error backoff.
const ERROR_REQUEUE_SECONDS: u64 = 30;
/// Ceiling for error backoff.
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

// Event reasons, one per sync category.
const REASON_SYNC_ERROR: &str = "SyncError";
const REASON_RBAC_SYNCED: &str = "RBACSynced";
const REASON_SECRETS_SYNCED: &str = "SecretsSynced";
const REASON_STORAGE_CLASSES_SYNCED: &str = "StorageClassesSynced";
const REASON_CONFIG_MAPS_SYNCED: &str = "ConfigMapsSynced";
const REASON_NODE_DRIVER_SYNCED: &str = "NodeDriverSynced";
const REASON_CONTROLLER_DRIVER_SYNCED: &str = "ControllerDriverSynced";

/// Shared context of the CsiDeployment controller.
pub struct Reconciler {
    client: Client,
    pub(crate) config: Arc<OperatorConfig>,
    enhancer: EnhancerRegistry,
    reporter: Reporter,
    error_counts: DashMap<String, u32>,
    metrics: Metrics,
}

/// Counters served by the process metrics endpoint.
struct Metrics {
    reconciliations: prometheus::IntCounter,
    failures: prometheus::IntCounter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            reconciliations: prometheus::register_int_counter!(
                "csi_operator_reconciliations_total",
                "Total reconciliation attempts"
            )
            .expect("register reconciliation counter"),
            failures: prometheus::register_int_counter!(
                "csi_operator_reconciliation_failures_total",
                "Total failed reconciliations"
            )
            .expect("register failure counter"),
        }
    }
}

/// Start the CsiDeployment controller and block until shutdown.
pub async fn run_controller(client: Client, config: Arc<OperatorConfig>) -> Result<()> {
    let deployments: Api<CsiDeployment> = Api::all(client.clone());
    let ctx = Arc::new(Reconciler::new(client.clone(), config));

    info!("starting CsiDeployment controller");

    Controller::new(deployments, watcher::Config::default())
        // Namespaced children carry an owner reference.
        .owns(
            Api::<DaemonSet>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<Deployment>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<Secret>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<ServiceAccount>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<ConfigMap>::all(client.clone()),
            watcher::Config::default(),
        )
        // Cluster-scoped children are related through the owner labels;
        // owner references don't cross the scope boundary.
        .watches(
            Api::<StorageClass>::all(client.clone()),
            watcher::Config::default(),
            |sc: StorageClass| owner_object_ref(sc.metadata.labels.as_ref()),
        )
        .watches(
            Api::<ClusterRole>::all(client.clone()),
            watcher::Config::default(),
            |role: ClusterRole| owner_object_ref(role.metadata.labels.as_ref()),
        )
        .watches(
            Api::<ClusterRoleBinding>::all(client.clone()),
            watcher::Config::default(),
            |binding: ClusterRoleBinding| owner_object_ref(binding.metadata.labels.as_ref()),
        )
        .shutdown_on_signal()
        .run(
            |deploy, ctx| async move { ctx.reconcile(deploy).await },
            error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!(object = %obj, "reconciled"),
                Err(err) => error!(error = %err, "reconciliation failed"),
            }
        })
        .await;

    Ok(())
}

/// Map a labeled cluster-scoped child back to its owning deployment.
fn owner_object_ref(
    labels: Option<&std::collections::BTreeMap<String, String>>,
) -> Option<ObjectRef<CsiDeployment>> {
    let (namespace, name) = owner_of(labels)?;
    Some(ObjectRef::new(&name).within(&namespace))
}

fn error_policy(deploy: Arc<CsiDeployment>, err: &Error, ctx: Arc<Reconciler>) -> Action {
    let key = format!("{}/{}", deploy.namespace(), deploy.name());
    let count = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };
    let delay = (ERROR_REQUEUE_SECONDS * 2u64.saturating_pow(count.saturating_sub(1)))
        .min(MAX_ERROR_REQUEUE_SECONDS);
    warn!(
        deployment = %key,
        error = %err,
        retries = count,
        delay_seconds = delay,
        "requeueing after error"
    );
    Action::requeue(Duration::from_secs(delay))
}

impl Reconciler {
    pub fn new(client: Client, config: Arc<OperatorConfig>) -> Self {
        Self {
            client,
            enhancer: EnhancerRegistry::new(config.clone()),
            config,
            reporter: Reporter {
                controller: "csi-driver-operator".into(),
                instance: None,
            },
            error_counts: DashMap::new(),
            metrics: Metrics::new(),
        }
    }

    pub(crate) fn api_namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub(crate) fn api_cluster<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    /// Handle one delivered event for a deployment.
    pub(crate) async fn reconcile(&self, deploy: Arc<CsiDeployment>) -> Result<Action> {
        self.metrics.reconciliations.inc();
        debug!(
            deployment = %format!("{}/{}", deploy.namespace(), deploy.name()),
            "reconciling"
        );

        let mut new_deploy = (*deploy).clone();

        let outcome = if new_deploy.is_terminating() {
            self.clear_deployment(&new_deploy).await.err()
        } else {
            let field_errors = validation::validate(&new_deploy);
            if field_errors.is_empty() {
                let status = new_deploy.status.get_or_insert_with(Default::default);
                update_condition(status, CONDITION_VALIDATED, ConditionStatus::True, "");
                self.sync(&mut new_deploy).await.err()
            } else {
                let message = validation::aggregate_message(&field_errors);
                let status = new_deploy.status.get_or_insert_with(Default::default);
                update_condition(status, CONDITION_VALIDATED, ConditionStatus::False, &message);
                Some(Error::Validation(message))
            }
        };

        if let Some(err) = &outcome {
            self.metrics.failures.inc();
            self.publish_event(&deploy, EventType::Warning, REASON_SYNC_ERROR, &err.to_string())
                .await;
        }

        // Failure reasons must land in status even when the sync failed.
        self.update_status(&deploy, &new_deploy).await?;

        match outcome {
            None => {
                self.error_counts
                    .remove(&format!("{}/{}", deploy.namespace(), deploy.name()));
                if deploy.is_terminating() {
                    Ok(Action::await_change())
                } else {
                    Ok(Action::requeue(Duration::from_secs(RESYNC_SECONDS)))
                }
            }
            // Transient errors requeue with backoff via the error policy.
            Some(err) if err.is_retryable() => Err(err),
            // Permanent and validation errors wait for a spec change.
            Some(_) => Ok(Action::await_change()),
        }
    }

    /// Delete the cluster-scoped children, then clear the finalizer. Any
    /// cleanup failure keeps the finalizer so the deployment is never
    /// garbage-collected with orphaned cluster-scoped objects.
    async fn clear_deployment(&self, deploy: &CsiDeployment) -> Result<()> {
        info!(
            deployment = %format!("{}/{}", deploy.namespace(), deploy.name()),
            "clearing deployment"
        );

        let mut errs = Vec::new();
        if let Err(err) = self.clear_storage_classes(deploy).await {
            errs.push(err);
        }
        if let Err(err) = self.clear_rbac_objects(deploy).await {
            errs.push(err);
        }
        if let Some(err) = Error::aggregate(errs) {
            return Err(err);
        }

        let api: Api<CsiDeployment> = self.api_namespaced(deploy.namespace());
        finalizer::clear_finalizer(&api, deploy).await
    }

    /// The active path: finalizer, enhancement, child synchronizers, status.
    async fn sync(&self, deploy: &mut CsiDeployment) -> Result<()> {
        let status = deploy.status_or_default();
        if status.phase == CsiPhase::Failed
            && status.observed_generation == deploy.metadata.generation
        {
            debug!(
                deployment = %deploy.name(),
                "skipping failed deployment until its spec changes"
            );
            return Ok(());
        }

        // Children must never exist without the finalizer, else a concurrent
        // delete could orphan the cluster-scoped ones.
        let api: Api<CsiDeployment> = self.api_namespaced(deploy.namespace());
        finalizer::ensure_finalizer(&api, deploy).await?;

        if let Err(err) = self.enhance(deploy).await {
            self.sync_workload_status(deploy, None, None, Some(&err));
            return Err(err);
        }

        let mut errs = Vec::new();

        match self.sync_rbac_objects(deploy).await {
            Ok(true) => {
                self.publish_event(
                    deploy,
                    EventType::Normal,
                    REASON_RBAC_SYNCED,
                    "RBAC resources have been synced",
                )
                .await
            }
            Ok(false) => {}
            Err(err) => errs.push(err),
        }

        match self.sync_secrets(deploy).await {
            Ok(true) => {
                self.publish_event(
                    deploy,
                    EventType::Normal,
                    REASON_SECRETS_SYNCED,
                    "Secrets have been synced",
                )
                .await
            }
            Ok(false) => {}
            Err(err) => errs.push(err),
        }

        match self.sync_storage_classes(deploy).await {
            Ok(true) => {
                self.publish_event(
                    deploy,
                    EventType::Normal,
                    REASON_STORAGE_CLASSES_SYNCED,
                    "StorageClasses have been synced",
                )
                .await
            }
            Ok(false) => {}
            Err(err) => errs.push(err),
        }

        match self.sync_config_maps(deploy).await {
            Ok(true) => {
                self.publish_event(
                    deploy,
                    EventType::Normal,
                    REASON_CONFIG_MAPS_SYNCED,
                    "ConfigMaps have been synced",
                )
                .await
            }
            Ok(false) => {}
            Err(err) => errs.push(err),
        }

        // The generation list is rebuilt from whichever workloads synced.
        let mut children = Vec::new();

        let node = match self.sync_node_driver(deploy).await {
            Ok((node, changed)) => {
                if let Some(ds) = &node {
                    children.push(child_generation("apps", "DaemonSet", &ds.metadata));
                }
                if changed {
                    self.publish_event(
                        deploy,
                        EventType::Normal,
                        REASON_NODE_DRIVER_SYNCED,
                        "Node driver has been synced",
                    )
                    .await;
                }
                node
            }
            Err(err) => {
                errs.push(err);
                None
            }
        };

        let controller = match self.sync_controller_driver(deploy).await {
            Ok((controller, changed)) => {
                if let Some(d) = &controller {
                    children.push(child_generation("apps", "Deployment", &d.metadata));
                }
                if changed {
                    self.publish_event(
                        deploy,
                        EventType::Normal,
                        REASON_CONTROLLER_DRIVER_SYNCED,
                        "Controller driver has been synced",
                    )
                    .await;
                }
                controller
            }
            Err(err) => {
                errs.push(err);
                None
            }
        };

        let err = Error::aggregate(errs);
        deploy
            .status
            .get_or_insert_with(Default::default)
            .children = children;
        self.sync_workload_status(deploy, node.as_ref(), controller.as_ref(), err.as_ref());

        match err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Enhance a well-known deployment. Enhancement is a pure transform; the
    /// spec is only persisted when it semantically changed.
    async fn enhance(&self, deploy: &mut CsiDeployment) -> Result<()> {
        if !deploy.is_well_known() {
            debug!(deployment = %deploy.name(), "not a well known type");
            return Ok(());
        }

        let enhanced = self.enhancer.enhance(deploy)?;
        if enhanced == deploy.spec {
            debug!(deployment = %deploy.name(), "already enhanced");
            return Ok(());
        }

        deploy.spec = enhanced;
        info!(
            deployment = %format!("{}/{}", deploy.namespace(), deploy.name()),
            "enhancing deployment"
        );

        let api: Api<CsiDeployment> = self.api_namespaced(deploy.namespace());
        let updated = ops::replace(&api, deploy.name(), deploy).await?;
        deploy.metadata = updated.metadata;
        Ok(())
    }

    /// Derive phase and conditions from the synchronization outcome.
    fn sync_workload_status(
        &self,
        deploy: &mut CsiDeployment,
        node: Option<&DaemonSet>,
        controller: Option<&Deployment>,
        err: Option<&Error>,
    ) {
        let generation = deploy.metadata.generation;
        let controller_required = deploy.has_controller();
        let status = deploy.status.get_or_insert_with(Default::default);

        status.phase = compute_phase(node, controller, controller_required, err);

        match err {
            None => {
                status.observed_generation = generation;
                update_condition(status, CONDITION_SYNCED, ConditionStatus::True, "");
            }
            Some(err) => {
                // A permanent failure is a conclusive outcome for this
                // generation; recording it arms the short-circuit until the
                // spec changes.
                if err.is_permanent() {
                    status.observed_generation = generation;
                }
                update_condition(
                    status,
                    CONDITION_SYNCED,
                    ConditionStatus::False,
                    &err.to_string(),
                );
            }
        }

        let (value, message) = match node {
            None => (ConditionStatus::Unknown, String::new()),
            Some(ds) => {
                let unavailable = ds
                    .status
                    .as_ref()
                    .and_then(|s| s.number_unavailable)
                    .unwrap_or(0);
                if unavailable > 0 {
                    (
                        ConditionStatus::False,
                        format!("Node driver has {unavailable} not ready replicas"),
                    )
                } else {
                    (ConditionStatus::True, String::new())
                }
            }
        };
        update_condition(status, CONDITION_NODE_AVAILABLE, value, &message);

        let (value, message) = match controller {
            None => (ConditionStatus::Unknown, String::new()),
            Some(d) => {
                let unavailable = d
                    .status
                    .as_ref()
                    .and_then(|s| s.unavailable_replicas)
                    .unwrap_or(0);
                if unavailable > 0 {
                    (
                        ConditionStatus::False,
                        format!("Controller driver has {unavailable} not ready replicas"),
                    )
                } else {
                    (ConditionStatus::True, String::new())
                }
            }
        };
        update_condition(status, CONDITION_CONTROLLER_AVAILABLE, value, &message);
    }

    /// Persist the status if it semantically differs from the fetched one.
    async fn update_status(&self, old: &CsiDeployment, new: &CsiDeployment) -> Result<()> {
        let old_status = old.status.clone().unwrap_or_default();
        let new_status = new.status.clone().unwrap_or_default();
        if old_status == new_status {
            return Ok(());
        }

        let api: Api<CsiDeployment> = self.api_namespaced(new.namespace());
        match ops::patch_status_merge::<CsiDeployment>(
            &api,
            new.name(),
            &serde_json::json!({"status": new_status}),
        )
        .await
        {
            Ok(_) => Ok(()),
            // The deployment may be gone right after its finalizer cleared.
            Err(Error::Kube(err)) if ops::is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn publish_event(
        &self,
        deploy: &CsiDeployment,
        type_: EventType,
        reason: &str,
        note: &str,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            deploy.object_ref(&()),
        );
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            warn!(error = %err, reason, "failed to publish event");
        }
    }
}

fn child_generation(
    group: &str,
    kind: &str,
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> ChildGeneration {
    ChildGeneration {
        group: group.to_string(),
        kind: kind.to_string(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        last_generation: meta.generation.unwrap_or_default(),
    }
}

/// Phase derivation, evaluated every iteration.
fn compute_phase(
    node: Option<&DaemonSet>,
    controller: Option<&Deployment>,
    controller_required: bool,
    err: Option<&Error>,
) -> CsiPhase {
    if err.is_some_and(Error::is_permanent) {
        return CsiPhase::Failed;
    }

    let node_ready = node.is_some_and(|ds| {
        ds.status
            .as_ref()
            .and_then(|s| s.number_unavailable)
            .unwrap_or(0)
            == 0
    });
    let controller_ready = !controller_required
        || controller.is_some_and(|d| {
            d.status
                .as_ref()
                .and_then(|s| s.unavailable_replicas)
                .unwrap_or(0)
                == 0
        });

    if node_ready && controller_ready {
        CsiPhase::Running
    } else {
        CsiPhase::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DaemonSetStatus, DeploymentStatus};

    fn daemon_set(unavailable: i32) -> DaemonSet {
        DaemonSet {
            status: Some(DaemonSetStatus {
                number_unavailable: Some(unavailable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn deployment(unavailable: i32) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                unavailable_replicas: Some(unavailable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_phase_running_without_controller_requirement() {
        let node = daemon_set(0);
        assert_eq!(compute_phase(Some(&node), None, false, None), CsiPhase::Running);
    }

    #[test]
    fn test_phase_pending_while_replicas_unavailable() {
        let node = daemon_set(2);
        assert_eq!(compute_phase(Some(&node), None, false, None), CsiPhase::Pending);

        let node = daemon_set(0);
        let controller = deployment(1);
        assert_eq!(
            compute_phase(Some(&node), Some(&controller), true, None),
            CsiPhase::Pending
        );

        // Required controller that doesn't exist yet.
        assert_eq!(
            compute_phase(Some(&node), None, true, None),
            CsiPhase::Pending
        );
    }

    #[test]
    fn test_phase_running_with_healthy_controller() {
        let node = daemon_set(0);
        let controller = deployment(0);
        assert_eq!(
            compute_phase(Some(&node), Some(&controller), true, None),
            CsiPhase::Running
        );
    }

    #[test]
    fn test_phase_failed_on_permanent_error_wins() {
        let node = daemon_set(0);
        let err = Error::UnknownDriver {
            driver: "csi-floppy".into(),
        };
        assert_eq!(
            compute_phase(Some(&node), None, false, Some(&err)),
            CsiPhase::Failed
        );
    }

    #[test]
    fn test_phase_pending_on_transient_error() {
        let err = Error::Timeout { operation: "get" };
        assert_eq!(compute_phase(None, None, false, Some(&err)), CsiPhase::Pending);
    }

    #[test]
    fn test_child_generation_from_meta() {
        let meta = k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("ceph-node".to_string()),
            namespace: Some("kube-system".to_string()),
            generation: Some(7),
            ..Default::default()
        };
        let child = child_generation("apps", "DaemonSet", &meta);
        assert_eq!(child.kind, "DaemonSet");
        assert_eq!(child.last_generation, 7);
    }
}
