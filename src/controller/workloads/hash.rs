//! Pod template identifiers
//!
//! The target's pod template is reduced to a content digest when the rollout
//! is verified. The digest of the last fully rolled out template is kept in
//! status, so a rollout whose target did not change is refused.

use super::WorkloadError;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use sha2::{Digest, Sha256};

/// Identify a pod template by content
///
/// SHA-256 over the template's JSON serialization, hex encoded. The k8s
/// types serialize maps in sorted order, so equal templates give equal
/// identifiers across processes.
pub fn compute_pod_template_hash(template: &PodTemplateSpec) -> Result<String, WorkloadError> {
    let json = serde_json::to_vec(template)
        .map_err(|e| WorkloadError::SerializationError(e.to_string()))?;

    Ok(hex::encode(Sha256::digest(&json)))
}
