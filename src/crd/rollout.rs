use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// BatchRollout moves capacity from a source Deployment to a target Deployment
/// in fixed batches, keeping the combined replica count constant.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kulta.io",
    version = "v1alpha1",
    kind = "BatchRollout",
    namespaced,
    status = "RolloutStatus",
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.sourceDeployment"}"#,
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".spec.targetDeployment"}"#,
    printcolumn = r#"{"name":"Batch", "type":"integer", "jsonPath":".status.currentBatch"}"#,
    printcolumn = r#"{"name":"Size", "type":"integer", "jsonPath":".status.rolloutTargetSize"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct BatchRolloutSpec {
    /// Name of the Deployment currently carrying the traffic (same namespace)
    #[serde(rename = "sourceDeployment")]
    pub source_deployment: String,

    /// Name of the Deployment running the new version (same namespace)
    #[serde(rename = "targetDeployment")]
    pub target_deployment: String,

    /// How the replicas move from source to target
    #[serde(rename = "rolloutPlan")]
    pub rollout_plan: RolloutPlan,
}

/// Ordered batches plus the strategy used inside each batch
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct RolloutPlan {
    /// Batches applied in order; the last one absorbs rounding
    #[serde(rename = "rolloutBatches", default)]
    pub rollout_batches: Vec<RolloutBatch>,

    /// Whether the target grows before the source shrinks, or the reverse.
    /// Defaults to IncreaseFirst.
    #[serde(rename = "rolloutStrategy", default)]
    #[schemars(with = "String")]
    pub rollout_strategy: RolloutStrategyType,

    /// Expected total replica count. Only cross-checked, never used to scale.
    #[serde(rename = "targetSize", skip_serializing_if = "Option::is_none")]
    pub target_size: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct RolloutBatch {
    /// Replicas moved by this batch: absolute ("2") or percentage ("50%")
    pub replicas: IntOrString,

    /// Replicas allowed to be unavailable while this batch rolls out
    #[serde(rename = "maxUnavailable", skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

/// Order of operations inside one batch
///
/// Serialized as a plain string. Values this version does not know are kept
/// as `Unknown` so the controller can reject them instead of the whole
/// resource failing to deserialize.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum RolloutStrategyType {
    /// Scale the target up first, then shrink the source once the target is ready
    #[default]
    IncreaseFirst,
    /// Shrink the source first, then scale the target up
    DecreaseFirst,
    Unknown(String),
}

impl From<String> for RolloutStrategyType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "IncreaseFirst" | "" => RolloutStrategyType::IncreaseFirst,
            "DecreaseFirst" => RolloutStrategyType::DecreaseFirst,
            _ => RolloutStrategyType::Unknown(value),
        }
    }
}

impl From<RolloutStrategyType> for String {
    fn from(value: RolloutStrategyType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RolloutStrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutStrategyType::IncreaseFirst => f.write_str("IncreaseFirst"),
            RolloutStrategyType::DecreaseFirst => f.write_str("DecreaseFirst"),
            RolloutStrategyType::Unknown(other) => f.write_str(other),
        }
    }
}

/// Status of the BatchRollout
///
/// Owned and persisted by the rollout driver; the workload controllers only
/// write the fields below through the `&mut` they are handed on every call.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutStatus {
    /// Index of the batch being rolled out (0-indexed). Advanced by the driver only.
    #[serde(rename = "currentBatch", default)]
    pub current_batch: i32,

    /// source + target replicas observed at verification; fixed for the rollout
    #[serde(rename = "rolloutTargetSize", default)]
    pub rollout_target_size: i32,

    /// Pod template hash of the target being rolled out
    #[serde(rename = "newPodTemplateIdentifier", skip_serializing_if = "Option::is_none")]
    pub new_pod_template_identifier: Option<String>,

    /// Pod template hash of the last target that was fully delivered
    #[serde(
        rename = "lastAppliedPodTemplateIdentifier",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_applied_pod_template_identifier: Option<String>,

    /// Target replicas requested so far
    #[serde(rename = "upgradedReplicas", default)]
    pub upgraded_replicas: i32,

    /// Target replicas observed ready at the last batch check
    #[serde(rename = "upgradedReadyReplicas", default)]
    pub upgraded_ready_replicas: i32,

    /// Why the last phase asked to be called again, if it did
    #[serde(rename = "retryReason", skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,
}

impl RolloutStatus {
    /// Mark the current phase for retry without failing the rollout
    pub fn rollout_retry(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(batch = self.current_batch, reason = %reason, "Rollout phase will be retried");
        self.retry_reason = Some(reason);
    }

    pub fn clear_retry(&mut self) {
        self.retry_reason = None;
    }
}

#[cfg(test)]
#[path = "rollout_test.rs"]
mod tests;
