//! Object store access for the workloads a rollout drives
//!
//! Workload controllers never hold a `kube::Client` directly. They read and
//! patch through `WorkloadClient`, which production code backs with the
//! Kubernetes API and tests back with an in-memory store.

use crate::controller::config::ControllerConfig;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict while patching {0}")]
    Conflict(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    fn from_kube(err: kube::Error, key: &NamespacedName) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound(key.to_string()),
            kube::Error::Api(resp) if resp.code == 409 => ClientError::Conflict(key.to_string()),
            other => ClientError::Kube(other),
        }
    }
}

/// Namespace + name of a workload
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read and patch Deployments
///
/// Patches are JSON merge patches computed against a baseline the caller has
/// just read. They carry the baseline `metadata.resourceVersion`, so a write
/// racing with another controller comes back as `ClientError::Conflict`.
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    async fn get_deployment(&self, key: &NamespacedName) -> Result<Deployment, ClientError>;

    async fn patch_deployment(
        &self,
        key: &NamespacedName,
        patch: &serde_json::Value,
    ) -> Result<Deployment, ClientError>;
}

/// `WorkloadClient` backed by the Kubernetes API
pub struct KubeWorkloadClient {
    client: kube::Client,
    field_manager: String,
}

impl KubeWorkloadClient {
    pub fn new(client: kube::Client, config: &ControllerConfig) -> Self {
        Self {
            client,
            field_manager: config.field_manager.clone(),
        }
    }

    fn api(&self, key: &NamespacedName) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get_deployment(&self, key: &NamespacedName) -> Result<Deployment, ClientError> {
        self.api(key)
            .get(&key.name)
            .await
            .map_err(|e| ClientError::from_kube(e, key))
    }

    async fn patch_deployment(
        &self,
        key: &NamespacedName,
        patch: &serde_json::Value,
    ) -> Result<Deployment, ClientError> {
        debug!(deployment = %key, patch = %patch, "Patching Deployment");

        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };

        self.api(key)
            .patch(&key.name, &params, &Patch::Merge(patch))
            .await
            .map_err(|e| ClientError::from_kube(e, key))
    }
}

#[cfg(test)]
pub use mock::MockWorkloadClient;
