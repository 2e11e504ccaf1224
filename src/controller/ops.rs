//! Timeout-bounded cluster API helpers
//!
//! Every call against the cluster runs under its own fixed timeout so a hung
//! apiserver connection surfaces as a retryable error instead of stalling the
//! reconcile worker. Deletes tolerate objects that are already gone.

use crate::error::{Error, Result};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

/// Upper bound for one cluster API call.
pub(crate) const API_TIMEOUT: Duration = Duration::from_secs(60);

async fn bounded<T, F>(operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, kube::Error>>,
{
    match tokio::time::timeout(API_TIMEOUT, fut).await {
        Ok(result) => result.map_err(Error::Kube),
        Err(_) => Err(Error::Timeout { operation }),
    }
}

/// True for a 404 from the apiserver.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

pub(crate) async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    bounded("get", api.get_opt(name)).await
}

pub(crate) async fn list_labeled<K>(api: &Api<K>, selector: &str) -> Result<Vec<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    bounded("list", api.list(&ListParams::default().labels(selector)))
        .await
        .map(|list| list.items)
}

pub(crate) async fn create<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    bounded("create", api.create(&PostParams::default(), obj)).await
}

pub(crate) async fn replace<K>(api: &Api<K>, name: &str, obj: &K) -> Result<K>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    bounded("update", api.replace(name, &PostParams::default(), obj)).await
}

/// Delete an object, treating "already deleted" as success.
pub(crate) async fn delete<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match tokio::time::timeout(API_TIMEOUT, api.delete(name, &DeleteParams::default())).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) if is_not_found(&err) => Ok(()),
        Ok(Err(err)) => Err(Error::Kube(err)),
        Err(_) => Err(Error::Timeout { operation: "delete" }),
    }
}

pub(crate) async fn patch_merge<K>(api: &Api<K>, name: &str, value: &serde_json::Value) -> Result<K>
where
    K: Clone + DeserializeOwned + Debug,
{
    bounded(
        "patch",
        api.patch(name, &PatchParams::default(), &Patch::Merge(value)),
    )
    .await
}

pub(crate) async fn patch_status_merge<K>(
    api: &Api<K>,
    name: &str,
    value: &serde_json::Value,
) -> Result<K>
where
    K: Clone + DeserializeOwned + Debug,
{
    bounded(
        "patch status",
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(value)),
    )
    .await
}
