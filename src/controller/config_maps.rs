//! ConfigMap synchronization
//!
//! Same converge-by-diff pattern as Secrets: list by owner label, create or
//! update what is desired, prune the rest.

use crate::controller::ops;
use crate::controller::ownership::{
    add_owner_labels, add_owner_reference, merge_object_meta, owner_label_selector,
};
use crate::controller::reconciler::Reconciler;
use crate::crd::CsiDeployment;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use std::collections::BTreeMap;
use tracing::info;

impl Reconciler {
    /// Converge all ConfigMaps of a deployment. Returns true if anything was
    /// created, updated or deleted.
    pub(crate) async fn sync_config_maps(&self, deploy: &CsiDeployment) -> Result<bool> {
        let api: Api<ConfigMap> = self.api_namespaced(deploy.namespace());
        let existing = ops::list_labeled(&api, &owner_label_selector(deploy)).await?;
        let mut existing: BTreeMap<String, ConfigMap> = existing
            .into_iter()
            .filter_map(|c| c.metadata.name.clone().map(|name| (name, c)))
            .collect();

        let mut changed = false;
        let mut errs = Vec::new();

        for config_map in &deploy.spec.config_maps {
            let name = config_map.metadata.name.clone().unwrap_or_default();
            let exist = existing.remove(&name);
            match self
                .sync_config_map(&api, exist, config_map.clone(), deploy)
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

    async fn sync_config_map(
        &self,
        api: &Api<ConfigMap>,
        exist: Option<ConfigMap>,
        mut desired: ConfigMap,
        deploy: &CsiDeployment,
    ) -> Result<bool> {
        if desired.metadata.namespace.is_none() {
            desired.metadata.namespace = Some(deploy.namespace().to_string());
        }
        add_owner_labels(&mut desired.metadata, deploy);
        add_owner_reference(&mut desired.metadata, deploy);
        let name = desired.metadata.name.clone().unwrap_or_default();

        let Some(exist) = exist else {
            info!(config_map = %name, owner = %deploy.name(), "creating configmap");
            ops::create(api, &desired).await?;
            return Ok(true);
        };

        let mut update = desired.clone();
        update.metadata = exist.metadata.clone();
        let mut changed = update != exist;
        if merge_object_meta(&desired.metadata, &mut update.metadata) {
            changed = true;
        }

        if changed {
            info!(config_map = %name, owner = %deploy.name(), "updating configmap");
            ops::replace(api, &name, &update).await?;
            return Ok(true);
        }

        Ok(false)
    }
}
