//! Child object ownership
//!
//! Every child carries owner labels so cluster-scoped kinds, which native
//! garbage collection cannot reach across scope boundaries, can be selected
//! and cleaned up by list-by-label. Namespaced children additionally carry an
//! owner reference so the platform garbage collector covers them as well.

use crate::crd::CsiDeployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::BTreeMap;

/// Label naming the owning CsiDeployment.
pub const OWNER_NAME_LABEL: &str = "storage.billyronks.io/owner-name";
/// Label naming the owning CsiDeployment's namespace.
pub const OWNER_NAMESPACE_LABEL: &str = "storage.billyronks.io/owner-namespace";

/// Owner label pair for a deployment.
pub fn owner_labels(deploy: &CsiDeployment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNER_NAME_LABEL.to_string(), deploy.name().to_string()),
        (
            OWNER_NAMESPACE_LABEL.to_string(),
            deploy.namespace().to_string(),
        ),
    ])
}

/// Label selector string matching every child of a deployment.
pub fn owner_label_selector(deploy: &CsiDeployment) -> String {
    format!(
        "{OWNER_NAME_LABEL}={},{OWNER_NAMESPACE_LABEL}={}",
        deploy.name(),
        deploy.namespace()
    )
}

/// Stamp the owner labels onto a child's metadata.
pub fn add_owner_labels(meta: &mut ObjectMeta, deploy: &CsiDeployment) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    for (key, value) in owner_labels(deploy) {
        labels.insert(key, value);
    }
}

/// Read the owner identity back from a child's labels.
pub fn owner_of(labels: Option<&BTreeMap<String, String>>) -> Option<(String, String)> {
    let labels = labels?;
    let name = labels.get(OWNER_NAME_LABEL)?;
    let namespace = labels.get(OWNER_NAMESPACE_LABEL)?;
    Some((namespace.clone(), name.clone()))
}

/// Controller owner reference pointing at a deployment.
pub fn owner_reference(deploy: &CsiDeployment) -> OwnerReference {
    OwnerReference {
        api_version: CsiDeployment::api_version(&()).to_string(),
        kind: CsiDeployment::kind(&()).to_string(),
        name: deploy.name().to_string(),
        uid: deploy.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        ..Default::default()
    }
}

/// Stamp the controller owner reference onto a namespaced child's metadata.
pub fn add_owner_reference(meta: &mut ObjectMeta, deploy: &CsiDeployment) {
    meta.owner_references = Some(vec![owner_reference(deploy)]);
}

/// Merge the desired metadata into the live metadata without deleting keys
/// the system added: owner references are replaced wholesale, labels and
/// annotations are only added or updated. Returns true if anything changed.
pub fn merge_object_meta(desired: &ObjectMeta, live: &mut ObjectMeta) -> bool {
    let mut changed = false;

    if desired.owner_references != live.owner_references {
        changed = true;
        live.owner_references = desired.owner_references.clone();
    }

    if let Some(desired_labels) = &desired.labels {
        let labels = live.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in desired_labels {
            if labels.get(key) != Some(value) {
                changed = true;
                labels.insert(key.clone(), value.clone());
            }
        }
    }

    if let Some(desired_annotations) = &desired.annotations {
        let annotations = live.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in desired_annotations {
            if annotations.get(key) != Some(value) {
                changed = true;
                annotations.insert(key.clone(), value.clone());
            }
        }
    }

    changed
}

/// Merge extra labels into metadata, keeping existing keys that don't clash.
pub fn merge_labels(meta: &mut ObjectMeta, extra: &BTreeMap<String, String>) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    for (key, value) in extra {
        labels.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CsiDeploymentSpec;

    fn deployment() -> CsiDeployment {
        let mut deploy = CsiDeployment {
            metadata: Default::default(),
            spec: CsiDeploymentSpec::default(),
            status: None,
        };
        deploy.metadata.name = Some("ceph".to_string());
        deploy.metadata.namespace = Some("kube-system".to_string());
        deploy.metadata.uid = Some("uid-1".to_string());
        deploy
    }

    #[test]
    fn test_owner_labels_round_trip() {
        let deploy = deployment();
        let mut meta = ObjectMeta::default();
        add_owner_labels(&mut meta, &deploy);
        assert_eq!(
            owner_of(meta.labels.as_ref()),
            Some(("kube-system".to_string(), "ceph".to_string()))
        );
    }

    #[test]
    fn test_selector_matches_labels() {
        let deploy = deployment();
        assert_eq!(
            owner_label_selector(&deploy),
            "storage.billyronks.io/owner-name=ceph,storage.billyronks.io/owner-namespace=kube-system"
        );
    }

    #[test]
    fn test_merge_object_meta_preserves_foreign_keys() {
        let deploy = deployment();
        let mut desired = ObjectMeta::default();
        add_owner_labels(&mut desired, &deploy);

        let mut live = ObjectMeta {
            labels: Some(BTreeMap::from([(
                "kubernetes.io/managed-by".to_string(),
                "someone-else".to_string(),
            )])),
            ..Default::default()
        };

        assert!(merge_object_meta(&desired, &mut live));
        let labels = live.labels.as_ref().unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(
            labels.get("kubernetes.io/managed-by"),
            Some(&"someone-else".to_string())
        );

        // Second merge is a no-op.
        assert!(!merge_object_meta(&desired, &mut live));
    }

    #[test]
    fn test_merge_object_meta_replaces_owner_references() {
        let deploy = deployment();
        let mut desired = ObjectMeta::default();
        add_owner_reference(&mut desired, &deploy);

        let mut live = ObjectMeta::default();
        assert!(merge_object_meta(&desired, &mut live));
        assert_eq!(
            live.owner_references.as_ref().unwrap()[0].name,
            "ceph".to_string()
        );
        assert!(!merge_object_meta(&desired, &mut live));
    }
}
