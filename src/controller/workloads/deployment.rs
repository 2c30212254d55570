//! Batch rollout between two Deployments
//!
//! The source Deployment runs the old version, the target the new one. Each
//! batch moves replicas from source to target in two halves and the
//! combined replica count returns to `rollout_target_size` before the batch
//! counts as delivered:
//!
//! - IncreaseFirst: grow the target to its goal, then shrink the source once
//!   enough target replicas are ready.
//! - DecreaseFirst: shrink the source to its goal, then grow the target once
//!   the source pods are gone.
//!
//! Which half we are in is never stored. It is read off the cluster: a
//! combined desired count equal to `rollout_target_size` means the batch has
//! not started (or has finished), anything else means the first half already
//! landed.

use super::batch;
use super::hash::compute_pod_template_hash;
use super::ownership::{claim_patch, controller_owner, release_patch};
use super::{WorkloadController, WorkloadError};
use crate::controller::client::{NamespacedName, WorkloadClient};
use crate::controller::events::{EventRecorder, RolloutEvent};
use crate::crd::rollout::{BatchRollout, RolloutPlan, RolloutStatus, RolloutStrategyType};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Replicas assumed for a source Deployment without `spec.replicas`
const DEFAULT_SOURCE_REPLICAS: i32 = 1;

/// Replicas assumed for a target Deployment without `spec.replicas`
const DEFAULT_TARGET_REPLICAS: i32 = 0;

/// Fresh snapshot of both Deployments, read at the start of a phase
struct Workloads {
    source: Deployment,
    target: Deployment,
}

impl Workloads {
    fn source_replicas(&self) -> i32 {
        desired_replicas(&self.source, DEFAULT_SOURCE_REPLICAS)
    }

    fn target_replicas(&self) -> i32 {
        desired_replicas(&self.target, DEFAULT_TARGET_REPLICAS)
    }

    fn combined_replicas(&self) -> i32 {
        self.source_replicas() + self.target_replicas()
    }
}

fn desired_replicas(deploy: &Deployment, default: i32) -> i32 {
    deploy
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(default)
}

/// Pods that exist for the Deployment, ready or not
fn observed_replicas(deploy: &Deployment) -> i32 {
    deploy.status.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

fn ready_replicas(deploy: &Deployment) -> i32 {
    deploy
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

fn is_paused(deploy: &Deployment) -> bool {
    deploy
        .spec
        .as_ref()
        .and_then(|s| s.paused)
        .unwrap_or(false)
}

/// Rolls a BatchRollout's plan out across its source and target Deployments
pub struct DeploymentController {
    client: Arc<dyn WorkloadClient>,
    recorder: Arc<dyn EventRecorder>,
    parent: ObjectReference,
    owner: OwnerReference,
    rollout_name: String,
    rollout_plan: RolloutPlan,
    source: NamespacedName,
    target: NamespacedName,
}

impl DeploymentController {
    /// Build the adapter for `rollout`
    ///
    /// The rollout must have a namespace, name and uid: it becomes the
    /// controlling owner of both Deployments while the rollout runs.
    pub fn new(
        client: Arc<dyn WorkloadClient>,
        recorder: Arc<dyn EventRecorder>,
        rollout: &BatchRollout,
    ) -> Result<Self, WorkloadError> {
        let namespace = rollout
            .namespace()
            .ok_or(WorkloadError::MissingOwnerIdentity)?;
        let owner = rollout
            .controller_owner_ref(&())
            .ok_or(WorkloadError::MissingOwnerIdentity)?;

        Ok(Self {
            client,
            recorder,
            parent: rollout.object_ref(&()),
            owner,
            rollout_name: rollout.name_any(),
            rollout_plan: rollout.spec.rollout_plan.clone(),
            source: NamespacedName::new(&namespace, &rollout.spec.source_deployment),
            target: NamespacedName::new(&namespace, &rollout.spec.target_deployment),
        })
    }

    async fn event(&self, event: RolloutEvent) {
        self.recorder.record(&self.parent, event).await;
    }

    /// Log and record a fatal phase error, then hand it back
    async fn fatal(&self, phase: &str, err: WorkloadError) -> WorkloadError {
        error!(
            rollout = ?self.rollout_name,
            phase = phase,
            error = %err,
            "Rollout phase failed"
        );
        self.event(RolloutEvent::warning(
            format!("{phase}Failed"),
            err.to_string(),
        ))
        .await;
        err
    }

    /// Read both Deployments
    ///
    /// Any failure (including not found, the workloads may not exist yet)
    /// marks the status for retry and returns None.
    async fn fetch_deployments(&self, status: &mut RolloutStatus) -> Option<Workloads> {
        let mut fetched = Vec::with_capacity(2);

        for key in [&self.source, &self.target] {
            match self.client.get_deployment(key).await {
                Ok(deploy) => fetched.push(deploy),
                Err(e) => {
                    if e.is_not_found() {
                        debug!(rollout = ?self.rollout_name, deployment = %key, "Deployment not found yet");
                    } else {
                        warn!(
                            rollout = ?self.rollout_name,
                            deployment = %key,
                            error = %e,
                            "Failed to get Deployment"
                        );
                        self.event(RolloutEvent::warning("FetchFailed", e.to_string()))
                            .await;
                    }
                    status.rollout_retry(e.to_string());
                    return None;
                }
            }
        }

        let target = fetched.pop()?;
        let source = fetched.pop()?;
        Some(Workloads { source, target })
    }

    fn current_batch_index(&self, status: &RolloutStatus) -> Result<usize, WorkloadError> {
        let batches = self.rollout_plan.rollout_batches.len();
        usize::try_from(status.current_batch)
            .ok()
            .filter(|i| *i < batches)
            .ok_or(WorkloadError::BatchOutOfRange {
                batch: i64::from(status.current_batch),
                batches,
            })
    }

    /// Set `spec.replicas`; true when the Deployment is (now) at `replicas`
    async fn patch_replicas(
        &self,
        status: &mut RolloutStatus,
        key: &NamespacedName,
        deploy: &Deployment,
        default: i32,
        replicas: i32,
    ) -> bool {
        let current = desired_replicas(deploy, default);
        if current == replicas {
            debug!(deployment = %key, replicas = replicas, "Deployment already at desired replicas");
            return true;
        }

        let patch = json!({
            "metadata": {
                "resourceVersion": deploy.metadata.resource_version,
            },
            "spec": {
                "replicas": replicas,
            },
        });

        match self.client.patch_deployment(key, &patch).await {
            Ok(_) => {
                info!(
                    rollout = ?self.rollout_name,
                    deployment = %key,
                    from = current,
                    to = replicas,
                    "Scaled Deployment"
                );
                true
            }
            Err(e) => {
                warn!(deployment = %key, error = %e, "Failed to scale Deployment (will retry)");
                self.event(RolloutEvent::warning("PatchFailed", e.to_string()))
                    .await;
                status.rollout_retry(e.to_string());
                false
            }
        }
    }

    async fn claim(&self, status: &mut RolloutStatus, key: &NamespacedName, deploy: &Deployment) -> bool {
        let Some(patch) = claim_patch(deploy, &self.owner) else {
            debug!(deployment = %key, "Deployment already claimed");
            return true;
        };

        match self.client.patch_deployment(key, &patch).await {
            Ok(_) => {
                info!(rollout = ?self.rollout_name, deployment = %key, "Claimed Deployment");
                true
            }
            Err(e) => {
                warn!(deployment = %key, error = %e, "Failed to claim Deployment (will retry)");
                self.event(RolloutEvent::warning("ClaimFailed", e.to_string()))
                    .await;
                status.rollout_retry(e.to_string());
                false
            }
        }
    }

    async fn release(&self, status: &mut RolloutStatus, key: &NamespacedName, deploy: &Deployment) -> bool {
        let Some(patch) = release_patch(deploy, &self.owner) else {
            debug!(deployment = %key, "Deployment already released");
            return true;
        };

        match self.client.patch_deployment(key, &patch).await {
            Ok(_) => {
                info!(rollout = ?self.rollout_name, deployment = %key, "Released Deployment");
                true
            }
            Err(e) => {
                warn!(deployment = %key, error = %e, "Failed to release Deployment (will retry)");
                self.event(RolloutEvent::warning("ReleaseFailed", e.to_string()))
                    .await;
                status.rollout_retry(e.to_string());
                false
            }
        }
    }

    async fn verify(&self, status: &mut RolloutStatus) -> Result<bool, WorkloadError> {
        let Some(workloads) = self.fetch_deployments(status).await else {
            return Ok(false);
        };

        let total = workloads.combined_replicas();

        let template = workloads
            .target
            .spec
            .as_ref()
            .map(|s| s.template.clone())
            .unwrap_or_default();
        let target_hash = match compute_pod_template_hash(&template) {
            Ok(hash) => hash,
            Err(e) => {
                status.rollout_retry(e.to_string());
                return Ok(false);
            }
        };
        if status.last_applied_pod_template_identifier.as_deref() == Some(target_hash.as_str()) {
            return Err(WorkloadError::NoTemplateChange(target_hash));
        }

        if let Some(declared) = self.rollout_plan.target_size {
            if declared != total {
                return Err(WorkloadError::TargetSizeMismatch {
                    declared,
                    actual: total,
                });
            }
        }
        batch::verify_sum_of_batch_sizes(&self.rollout_plan, total)?;

        if !is_paused(&workloads.target) && workloads.target_replicas() != 0 {
            return Err(WorkloadError::TargetInProgress(self.target.to_string()));
        }

        for (key, deploy) in [
            (&self.source, &workloads.source),
            (&self.target, &workloads.target),
        ] {
            if let Some(owner) = controller_owner(deploy) {
                return Err(WorkloadError::AlreadyOwned {
                    name: key.to_string(),
                    owner_kind: owner.kind.clone(),
                    owner_name: owner.name.clone(),
                });
            }
        }

        status.rollout_target_size = total;
        status.new_pod_template_identifier = Some(target_hash);
        status.clear_retry();

        info!(
            rollout = ?self.rollout_name,
            total = total,
            batches = self.rollout_plan.rollout_batches.len(),
            strategy = %self.rollout_plan.rollout_strategy,
            "Rollout verified"
        );
        self.event(RolloutEvent::normal(
            "RolloutVerified",
            "Rollout spec and the Deployments are verified",
        ))
        .await;
        Ok(true)
    }

    /// No overlap yet: move whichever side the strategy moves first
    async fn rollout_batch_first_half(
        &self,
        status: &mut RolloutStatus,
        workloads: &Workloads,
        target_goal: i32,
        source_goal: i32,
    ) -> Result<(), WorkloadError> {
        match &self.rollout_plan.rollout_strategy {
            RolloutStrategyType::IncreaseFirst => {
                if workloads.target_replicas() >= target_goal {
                    debug!(rollout = ?self.rollout_name, target_goal = target_goal, "Target already at batch goal");
                    status.rollout_retry(format!(
                        "batch {} waiting for check",
                        status.current_batch
                    ));
                    return Ok(());
                }
                if self
                    .patch_replicas(status, &self.target, &workloads.target, DEFAULT_TARGET_REPLICAS, target_goal)
                    .await
                {
                    status.rollout_retry(format!(
                        "batch {} first half submitted",
                        status.current_batch
                    ));
                    self.event(RolloutEvent::normal(
                        "BatchRollout",
                        format!(
                            "Scaled target up to {} replicas for batch {}",
                            target_goal, status.current_batch
                        ),
                    ))
                    .await;
                }
            }
            RolloutStrategyType::DecreaseFirst => {
                if workloads.source_replicas() <= source_goal {
                    debug!(rollout = ?self.rollout_name, source_goal = source_goal, "Source already at batch goal");
                    status.rollout_retry(format!(
                        "batch {} waiting for check",
                        status.current_batch
                    ));
                    return Ok(());
                }
                if self
                    .patch_replicas(status, &self.source, &workloads.source, DEFAULT_SOURCE_REPLICAS, source_goal)
                    .await
                {
                    status.rollout_retry(format!(
                        "batch {} first half submitted",
                        status.current_batch
                    ));
                    self.event(RolloutEvent::normal(
                        "BatchRollout",
                        format!(
                            "Scaled source down to {} replicas for batch {}",
                            source_goal, status.current_batch
                        ),
                    ))
                    .await;
                }
            }
            RolloutStrategyType::Unknown(other) => {
                return Err(WorkloadError::UnknownStrategy(other.clone()));
            }
        }
        Ok(())
    }

    /// Overlap (or shortfall) exists: settle the other side once it is safe
    async fn rollout_batch_second_half(
        &self,
        status: &mut RolloutStatus,
        workloads: &Workloads,
        batch_index: usize,
        target_goal: i32,
        source_goal: i32,
    ) -> Result<(), WorkloadError> {
        let submitted = match &self.rollout_plan.rollout_strategy {
            RolloutStrategyType::IncreaseFirst => {
                let unavailable =
                    batch::max_unavailable(&self.rollout_plan.rollout_batches[batch_index], target_goal)?;
                let ready = ready_replicas(&workloads.target);
                if ready.saturating_add(unavailable) < target_goal {
                    info!(
                        rollout = ?self.rollout_name,
                        ready = ready,
                        max_unavailable = unavailable,
                        target_goal = target_goal,
                        "Target not ready enough to shrink source"
                    );
                    status.rollout_retry(format!(
                        "target has {} ready replicas, needs {} before the source can shrink",
                        ready,
                        (target_goal - unavailable).max(0)
                    ));
                    return Ok(());
                }
                self.patch_replicas(status, &self.source, &workloads.source, DEFAULT_SOURCE_REPLICAS, source_goal)
                    .await
            }
            RolloutStrategyType::DecreaseFirst => {
                let remaining = observed_replicas(&workloads.source);
                if remaining != source_goal {
                    info!(
                        rollout = ?self.rollout_name,
                        source_replicas = remaining,
                        source_goal = source_goal,
                        "Source has not shrunk yet"
                    );
                    status.rollout_retry(format!(
                        "source still has {} replicas, waiting for {}",
                        remaining, source_goal
                    ));
                    return Ok(());
                }
                self.patch_replicas(status, &self.target, &workloads.target, DEFAULT_TARGET_REPLICAS, target_goal)
                    .await
            }
            RolloutStrategyType::Unknown(other) => {
                return Err(WorkloadError::UnknownStrategy(other.clone()));
            }
        };

        if submitted {
            status.upgraded_replicas = target_goal;
            status.rollout_retry(format!(
                "batch {} submitted, waiting for availability",
                status.current_batch
            ));
            info!(
                rollout = ?self.rollout_name,
                batch = status.current_batch,
                target_goal = target_goal,
                source_goal = source_goal,
                "Submitted all upgrade requests for batch"
            );
            self.event(RolloutEvent::normal(
                "BatchRollout",
                format!(
                    "Finished submitting all upgrade requests for batch {}",
                    status.current_batch
                ),
            ))
            .await;
        }
        Ok(())
    }

    async fn rollout_batch(&self, status: &mut RolloutStatus) -> Result<bool, WorkloadError> {
        let batch_index = self.current_batch_index(status)?;
        let Some(workloads) = self.fetch_deployments(status).await else {
            return Ok(false);
        };

        let total = status.rollout_target_size;
        let target_goal = batch::target_goal(&self.rollout_plan, total, batch_index)?;
        let source_goal = batch::source_goal(&self.rollout_plan, total, batch_index)?;

        if workloads.combined_replicas() == total {
            self.rollout_batch_first_half(status, &workloads, target_goal, source_goal)
                .await?;
        } else {
            self.rollout_batch_second_half(status, &workloads, batch_index, target_goal, source_goal)
                .await?;
        }

        // Completion is only ever judged by check_one_batch_pods
        Ok(false)
    }

    async fn check_batch(&self, status: &mut RolloutStatus) -> Result<bool, WorkloadError> {
        let batch_index = self.current_batch_index(status)?;
        let Some(workloads) = self.fetch_deployments(status).await else {
            return Ok(false);
        };

        let total = status.rollout_target_size;
        let source_goal = batch::source_goal(&self.rollout_plan, total, batch_index)?;
        let unavailable =
            batch::max_unavailable(&self.rollout_plan.rollout_batches[batch_index], total)?;
        let ready_target = ready_replicas(&workloads.target);
        let source_count = observed_replicas(&workloads.source);

        info!(
            rollout = ?self.rollout_name,
            batch = batch_index,
            source_replicas = source_count,
            source_goal = source_goal,
            ready_target = ready_target,
            max_unavailable = unavailable,
            "Checking batch progress"
        );
        status.upgraded_ready_replicas = ready_target;

        if workloads.combined_replicas() != total {
            status.rollout_retry(format!(
                "batch {} is still rolling, {} replicas requested out of {}",
                batch_index,
                workloads.combined_replicas(),
                total
            ));
            return Ok(false);
        }
        if source_count != source_goal {
            status.rollout_retry(format!(
                "there are still {} source replicas, waiting for {}",
                source_count, source_goal
            ));
            return Ok(false);
        }
        if unavailable
            .saturating_add(ready_target)
            .saturating_add(source_count)
            < total
        {
            status.rollout_retry("the batch is not ready yet");
            return Ok(false);
        }

        if batch_index == self.rollout_plan.rollout_batches.len() - 1 {
            status.last_applied_pod_template_identifier = status.new_pod_template_identifier.clone();
        }
        status.clear_retry();

        info!(rollout = ?self.rollout_name, batch = batch_index, "All pods in current batch are available");
        self.event(RolloutEvent::normal(
            "BatchAvailable",
            format!("Batch {} is available", batch_index),
        ))
        .await;
        Ok(true)
    }
}

#[async_trait]
impl WorkloadController for DeploymentController {
    async fn verify_spec(&self, status: &mut RolloutStatus) -> Result<bool, WorkloadError> {
        match self.verify(status).await {
            Err(e) => Err(self.fatal("Verify", e).await),
            ok => ok,
        }
    }

    async fn initialize(&self, status: &mut RolloutStatus) -> Result<bool, WorkloadError> {
        let Some(workloads) = self.fetch_deployments(status).await else {
            return Ok(false);
        };

        if !self.claim(status, &self.source, &workloads.source).await {
            return Ok(false);
        }
        if !self.claim(status, &self.target, &workloads.target).await {
            return Ok(false);
        }

        status.clear_retry();
        info!(rollout = ?self.rollout_name, "Rollout initialized");
        self.event(RolloutEvent::normal(
            "RolloutInitialized",
            "Source and target Deployments are claimed",
        ))
        .await;
        Ok(true)
    }

    async fn rollout_one_batch_pods(
        &self,
        status: &mut RolloutStatus,
    ) -> Result<bool, WorkloadError> {
        match self.rollout_batch(status).await {
            Err(e) => Err(self.fatal("BatchRollout", e).await),
            ok => ok,
        }
    }

    async fn check_one_batch_pods(
        &self,
        status: &mut RolloutStatus,
    ) -> Result<bool, WorkloadError> {
        match self.check_batch(status).await {
            Err(e) => Err(self.fatal("BatchCheck", e).await),
            ok => ok,
        }
    }

    async fn finalize_one_batch(&self, _status: &mut RolloutStatus) -> Result<bool, WorkloadError> {
        // Nothing to clean up between Deployment batches
        Ok(true)
    }

    async fn finalize(&self, status: &mut RolloutStatus, succeeded: bool) -> bool {
        let Some(workloads) = self.fetch_deployments(status).await else {
            return false;
        };

        if !self.release(status, &self.source, &workloads.source).await {
            return false;
        }
        if !self.release(status, &self.target, &workloads.target).await {
            return false;
        }

        status.clear_retry();
        info!(rollout = ?self.rollout_name, succeeded = succeeded, "Rollout finalized");
        self.event(RolloutEvent::normal(
            "RolloutFinalized",
            format!("Rollout resources are finalized, succeeded = {}", succeeded),
        ))
        .await;
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "deployment_test.rs"]
mod tests;
