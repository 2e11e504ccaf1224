//! Finalizer lifecycle
//!
//! The finalizer must be on the deployment before the first child is
//! created: a delete racing child creation would otherwise garbage-collect
//! the deployment and orphan its cluster-scoped children. It is only cleared
//! after cluster-scoped cleanup has fully succeeded.

use crate::controller::ops;
use crate::crd::CsiDeployment;
use crate::error::{Error, Result};
use kube::Api;

/// Finalizer string owned by this operator.
pub const FINALIZER: &str = "storage.billyronks.io/csi-deployment";

/// True if the deployment carries our finalizer.
pub fn has_finalizer(deploy: &CsiDeployment) -> bool {
    deploy
        .metadata
        .finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|f| f == FINALIZER)
}

/// Idempotently add the finalizer, persisting immediately.
pub async fn ensure_finalizer(api: &Api<CsiDeployment>, deploy: &mut CsiDeployment) -> Result<()> {
    if has_finalizer(deploy) {
        return Ok(());
    }

    let mut finalizers = deploy.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());

    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    let updated = ops::patch_merge(api, deploy.name(), &patch).await?;
    // Carry the bumped resourceVersion so a later spec persist doesn't
    // conflict with our own patch.
    deploy.metadata = updated.metadata;
    Ok(())
}

/// Remove exactly our finalizer, preserving any others. An already deleted
/// deployment counts as success.
pub async fn clear_finalizer(api: &Api<CsiDeployment>, deploy: &CsiDeployment) -> Result<()> {
    let finalizers: Vec<String> = deploy
        .metadata
        .finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();

    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    match ops::patch_merge::<CsiDeployment>(api, deploy.name(), &patch).await {
        Ok(_) => Ok(()),
        Err(Error::Kube(err)) if ops::is_not_found(&err) => Ok(()),
        Err(err) => Err(err),
    }
}
