//! StorageClass synchronization
//!
//! StorageClasses are cluster-scoped, so native garbage collection never
//! reaches them: selection and teardown both go through the owner labels.
//! Their parameters are immutable, so a changed class is deleted and
//! recreated instead of updated in place.

use crate::controller::ops;
use crate::controller::ownership::{add_owner_labels, merge_object_meta, owner_label_selector};
use crate::controller::reconciler::Reconciler;
use crate::crd::CsiDeployment;
use crate::error::{Error, Result};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::Api;
use std::collections::BTreeMap;
use tracing::{debug, info};

impl Reconciler {
    /// Converge all StorageClasses of a deployment. Returns true if anything
    /// was created, recreated or deleted.
    pub(crate) async fn sync_storage_classes(&self, deploy: &CsiDeployment) -> Result<bool> {
        let api: Api<StorageClass> = self.api_cluster();
        let existing = ops::list_labeled(&api, &owner_label_selector(deploy)).await?;
        let mut existing: BTreeMap<String, StorageClass> = existing
            .into_iter()
            .filter_map(|sc| sc.metadata.name.clone().map(|name| (name, sc)))
            .collect();

        let mut changed = false;
        let mut errs = Vec::new();

        for class in &deploy.spec.storage_classes {
            let name = class.metadata.name.clone().unwrap_or_default();
            let exist = existing.remove(&name);
            match self
                .sync_storage_class(&api, exist, class.clone(), deploy)
                .await
            {
                Ok(true) => changed = true,
                Ok(false) => {}
                Err(err) => errs.push(err),
            }
        }

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

    async fn sync_storage_class(
        &self,
        api: &Api<StorageClass>,
        exist: Option<StorageClass>,
        mut desired: StorageClass,
        deploy: &CsiDeployment,
    ) -> Result<bool> {
        add_owner_labels(&mut desired.metadata, deploy);
        desired.provisioner = deploy.spec.driver_name.clone();
        let name = desired.metadata.name.clone().unwrap_or_default();

        if let Some(exist) = exist {
            let mut update = desired.clone();
            update.metadata = exist.metadata.clone();
            filter_storage_class_default_fields(&mut update, &exist);
            let mut changed = update != exist;
            if merge_object_meta(&desired.metadata, &mut update.metadata) {
                changed = true;
            }
            if !changed {
                return Ok(false);
            }

            // The payload is immutable; replace the whole object.
            info!(
                storage_class = %name,
                owner = %deploy.name(),
                "storage class changed, deleting for recreation"
            );
            ops::delete(api, &name).await?;
        }

        info!(storage_class = %name, owner = %deploy.name(), "creating storage class");
        ops::create(api, &desired).await?;
        Ok(true)
    }

    /// Delete every StorageClass owned by the deployment. Used during
    /// teardown before the finalizer is cleared.
    pub(crate) async fn clear_storage_classes(&self, deploy: &CsiDeployment) -> Result<()> {
        let api: Api<StorageClass> = self.api_cluster();
        let existing = ops::list_labeled(&api, &owner_label_selector(deploy)).await?;

        let mut errs = Vec::new();
        for class in existing {
            let name = class.metadata.name.clone().unwrap_or_default();
            match ops::delete(&api, &name).await {
                Ok(()) => debug!(storage_class = %name, "storage class deleted"),
                Err(err) => errs.push(err),
            }
        }

        match Error::aggregate(errs) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Mask fields the apiserver defaults so they don't read as drift.
fn filter_storage_class_default_fields(desired: &mut StorageClass, live: &StorageClass) {
    if desired.reclaim_policy.is_none() && live.reclaim_policy.as_deref() == Some("Delete") {
        desired.reclaim_policy = live.reclaim_policy.clone();
    }
    if desired.volume_binding_mode.is_none()
        && live.volume_binding_mode.as_deref() == Some("Immediate")
    {
        desired.volume_binding_mode = live.volume_binding_mode.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_masks_defaulted_fields() {
        let mut desired = StorageClass::default();
        let live = StorageClass {
            reclaim_policy: Some("Delete".to_string()),
            volume_binding_mode: Some("Immediate".to_string()),
            ..Default::default()
        };
        filter_storage_class_default_fields(&mut desired, &live);
        assert_eq!(desired.reclaim_policy.as_deref(), Some("Delete"));
        assert_eq!(desired.volume_binding_mode.as_deref(), Some("Immediate"));
    }

    #[test]
    fn test_filter_keeps_non_default_values() {
        let mut desired = StorageClass {
            reclaim_policy: Some("Retain".to_string()),
            ..Default::default()
        };
        let live = StorageClass {
            reclaim_policy: Some("Delete".to_string()),
            volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
            ..Default::default()
        };
        filter_storage_class_default_fields(&mut desired, &live);
        assert_eq!(desired.reclaim_policy.as_deref(), Some("Retain"));
        // Non-default live value is real drift, not masked.
        assert_eq!(desired.volume_binding_mode, None);
    }
}
