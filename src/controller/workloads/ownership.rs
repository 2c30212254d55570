//! Claiming and releasing workloads
//!
//! While a rollout runs, its resource is the controlling owner of both
//! Deployments. Claim adds that owner reference (and unpauses the
//! Deployment), release removes every reference of the rollout's kind.
//! Both return `None` when the object is already in the wanted state, which
//! is what makes them safe to repeat.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::{json, Value};

/// The controlling owner of a Deployment, if it has one
pub fn controller_owner(deploy: &Deployment) -> Option<&OwnerReference> {
    deploy
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Same kind and API group/version as `owner`
pub fn is_same_kind(reference: &OwnerReference, owner: &OwnerReference) -> bool {
    reference.kind == owner.kind && reference.api_version == owner.api_version
}

/// Merge patch adding `owner` as controller and clearing `spec.paused`
pub fn claim_patch(deploy: &Deployment, owner: &OwnerReference) -> Option<Value> {
    let mut refs = deploy.metadata.owner_references.clone().unwrap_or_default();

    if refs
        .iter()
        .any(|r| is_same_kind(r, owner) && r.uid == owner.uid)
    {
        return None;
    }
    refs.push(owner.clone());

    Some(json!({
        "metadata": {
            "resourceVersion": deploy.metadata.resource_version,
            "ownerReferences": refs,
        },
        "spec": {
            "paused": false,
        },
    }))
}

/// Merge patch removing every owner reference of `owner`'s kind
pub fn release_patch(deploy: &Deployment, owner: &OwnerReference) -> Option<Value> {
    let refs = deploy.metadata.owner_references.clone().unwrap_or_default();
    let remaining: Vec<OwnerReference> = refs
        .iter()
        .filter(|r| !is_same_kind(r, owner))
        .cloned()
        .collect();

    if remaining.len() == refs.len() {
        return None;
    }

    Some(json!({
        "metadata": {
            "resourceVersion": deploy.metadata.resource_version,
            "ownerReferences": remaining,
        },
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use kube::api::ObjectMeta;

    fn rollout_owner() -> OwnerReference {
        OwnerReference {
            api_version: "kulta.io/v1alpha1".to_string(),
            kind: "BatchRollout".to_string(),
            name: "web-rollout".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn other_owner() -> OwnerReference {
        OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "bundle".to_string(),
            uid: "uid-2".to_string(),
            controller: None,
            block_owner_deletion: None,
        }
    }

    fn deployment(owners: Vec<OwnerReference>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                resource_version: Some("7".to_string()),
                owner_references: Some(owners),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                paused: Some(true),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_controller_owner() {
        assert!(controller_owner(&deployment(vec![other_owner()])).is_none());
        let deploy = deployment(vec![other_owner(), rollout_owner()]);
        assert_eq!(controller_owner(&deploy).unwrap().uid, "uid-1");
    }

    #[test]
    fn test_claim_appends_owner_and_unpauses() {
        let patch = claim_patch(&deployment(vec![other_owner()]), &rollout_owner()).unwrap();

        assert_eq!(patch["metadata"]["resourceVersion"], "7");
        assert_eq!(patch["spec"]["paused"], false);
        let refs = patch["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0]["kind"], "ConfigMap");
        assert_eq!(refs[1]["kind"], "BatchRollout");
        assert_eq!(refs[1]["controller"], true);
    }

    #[test]
    fn test_claim_is_noop_when_already_claimed() {
        let deploy = deployment(vec![rollout_owner()]);
        assert!(claim_patch(&deploy, &rollout_owner()).is_none());
    }

    #[test]
    fn test_release_removes_only_rollout_kind() {
        let deploy = deployment(vec![other_owner(), rollout_owner()]);
        let patch = release_patch(&deploy, &rollout_owner()).unwrap();

        let refs = patch["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["kind"], "ConfigMap");
        assert!(patch.get("spec").is_none());
    }

    #[test]
    fn test_release_matches_kind_not_uid() {
        // A reference left behind by an earlier incarnation of the rollout is released too
        let mut stale = rollout_owner();
        stale.uid = "uid-old".to_string();
        let deploy = deployment(vec![stale]);

        let patch = release_patch(&deploy, &rollout_owner()).unwrap();
        assert!(patch["metadata"]["ownerReferences"]
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_release_is_noop_when_absent() {
        assert!(release_patch(&deployment(vec![other_owner()]), &rollout_owner()).is_none());
        assert!(release_patch(&deployment(vec![]), &rollout_owner()).is_none());
    }
}
