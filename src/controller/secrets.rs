//! Secret synchronization
//!
//! Converges the Secrets declared in the spec against live cluster state:
//! list by owner label, create or update what is desired, prune the rest.

use crate::controller::ops;
use crate::controller::ownership::{
    add_owner_labels, add_owner_reference, merge_object_meta, owner_label_selector,
};
use crate::controller::reconciler::Reconciler;
use crate::crd::CsiDeployment;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use std::collections::BTreeMap;
use tracing::info;

impl Reconciler {
    /// Converge all Secrets of a deployment. Returns true if anything was
    /// created, updated or deleted.
    pub(crate) async fn sync_secrets(&self, deploy: &CsiDeployment) -> Result<bool> {
        let api: Api<Secret> = self.api_namespaced(deploy.namespace());
        let existing = ops::list_labeled(&api, &owner_label_selector(deploy)).await?;
        let mut existing: BTreeMap<String, Secret> = existing
            .into_iter()
            .filter_map(|s| s.metadata.name.clone().map(|name| (name, s)))
            .collect();

        let mut changed = false;
        let mut errs = Vec::new();

        for secret in &deploy.spec.secrets {
            let name = secret.metadata.name.clone().unwrap_or_default();
            let exist = existing.remove(&name);
            match self.sync_secret(&api, exist, secret.clone(), deploy).await {
                Ok(true) => changed = true,
                Ok(false) => {}
                Err(err) => errs.push(err),
            }
        }

        // Remaining secrets are no longer wanted by this deployment.
        for name in existing.into_keys() {
            match ops::delete(&api, &name).await {
                Ok(()) => changed = true,
                Err(err) => errs.push(err),
            }
        }

        match Error::aggregate(errs) {
            None => Ok(changed),
            Some(err) => Err(err),
        }
    }

    async fn sync_secret(
        &self,
        api: &Api<Secret>,
        exist: Option<Secret>,
        mut desired: Secret,
        deploy: &CsiDeployment,
    ) -> Result<bool> {
        if desired.metadata.namespace.is_none() {
            desired.metadata.namespace = Some(deploy.namespace().to_string());
        }
        add_owner_labels(&mut desired.metadata, deploy);
        add_owner_reference(&mut desired.metadata, deploy);
        let name = desired.metadata.name.clone().unwrap_or_default();

        let Some(exist) = exist else {
            info!(
                secret = %name,
                owner = %deploy.name(),
                "creating secret"
            );
            ops::create(api, &desired).await?;
            return Ok(true);
        };

        // Compare the payload with server-managed metadata masked out.
        let mut update = desired.clone();
        update.metadata = exist.metadata.clone();
        filter_secret_default_fields(&mut update, &exist);
        let mut changed = update != exist;
        if merge_object_meta(&desired.metadata, &mut update.metadata) {
            changed = true;
        }

        if changed {
            info!(secret = %name, owner = %deploy.name(), "updating secret");
            ops::replace(api, &name, &update).await?;
            return Ok(true);
        }

        Ok(false)
    }
}

/// Mask fields the apiserver defaults so they don't read as drift.
fn filter_secret_default_fields(desired: &mut Secret, live: &Secret) {
    if desired.type_.is_none() && live.type_.as_deref() == Some("Opaque") {
        desired.type_ = live.type_.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_masks_defaulted_type() {
        let mut desired = Secret::default();
        let live = Secret {
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        filter_secret_default_fields(&mut desired, &live);
        assert_eq!(desired.type_.as_deref(), Some("Opaque"));
    }

    #[test]
    fn test_filter_keeps_explicit_type() {
        let mut desired = Secret {
            type_: Some("kubernetes.io/tls".to_string()),
            ..Default::default()
        };
        let live = Secret {
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        filter_secret_default_fields(&mut desired, &live);
        assert_eq!(desired.type_.as_deref(), Some("kubernetes.io/tls"));
    }
}
