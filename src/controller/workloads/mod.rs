//! Workload adapters for batch rollouts
//!
//! A rollout driver moves a pair of workloads through
//! `verify_spec → initialize → {rollout_one_batch_pods, check_one_batch_pods}* →
//! finalize_one_batch → … → finalize`, holding only a `dyn WorkloadController`.
//! Each workload kind provides its own adapter; `DeploymentController` covers
//! a pair of replica-count based Deployments.
//!
//! Return convention for the phase methods:
//! - `Ok(true)`: phase complete, move on
//! - `Ok(false)`: not yet, call the same phase again (reason in `status.retry_reason`)
//! - `Err(_)`: fatal, the rollout cannot succeed and should be finalized as failed

pub mod batch;
pub mod deployment;
pub mod hash;
pub mod ownership;

pub use deployment::DeploymentController;

use crate::crd::rollout::RolloutStatus;
use async_trait::async_trait;
use thiserror::Error;

/// Conditions no amount of retrying can fix
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("there is no difference between the source and target, hash = {0}")]
    NoTemplateChange(String),

    #[error("the rollout plan is attempting to scale the workload, target = {declared}, workload size = {actual}")]
    TargetSizeMismatch { declared: i32, actual: i32 },

    #[error("the rollout plan batch size mismatch, total batch size = {sum}, total replicas = {total}")]
    BatchSizeMismatch { sum: i64, total: i32 },

    #[error("invalid batch value {0}: must be a non-negative number or a 0-100 percentage")]
    InvalidBatchValue(String),

    #[error("the rollout plan has no batches")]
    EmptyPlan,

    #[error("batch {batch} is out of range, the plan has {batches} batches")]
    BatchOutOfRange { batch: i64, batches: usize },

    #[error("the Deployment {0} is in the middle of updating, need to be paused or empty")]
    TargetInProgress(String),

    #[error("the Deployment {name} is already controlled by {owner_kind} {owner_name}")]
    AlreadyOwned {
        name: String,
        owner_kind: String,
        owner_name: String,
    },

    #[error("encountered an unknown rollout strategy `{0}`")]
    UnknownStrategy(String),

    #[error("rollout resource has no name or uid to own workloads with")]
    MissingOwnerIdentity,

    #[error("failed to serialize pod template: {0}")]
    SerializationError(String),
}

/// Capability every workload kind implements to take part in a batch rollout
///
/// `status` belongs to the driver, which persists it between calls.
/// Implementations re-read the workloads on every call and never trust state
/// kept from an earlier one.
#[async_trait]
pub trait WorkloadController: Send + Sync {
    /// Check the workloads can be rolled out according to the plan
    async fn verify_spec(&self, status: &mut RolloutStatus) -> Result<bool, WorkloadError>;

    /// Take exclusive control of the workloads
    async fn initialize(&self, status: &mut RolloutStatus) -> Result<bool, WorkloadError>;

    /// Move the replicas of the current batch
    async fn rollout_one_batch_pods(&self, status: &mut RolloutStatus)
        -> Result<bool, WorkloadError>;

    /// Whether the current batch is delivered and available
    async fn check_one_batch_pods(&self, status: &mut RolloutStatus)
        -> Result<bool, WorkloadError>;

    /// Post-batch bookkeeping before the driver advances `current_batch`
    async fn finalize_one_batch(&self, status: &mut RolloutStatus) -> Result<bool, WorkloadError>;

    /// Give up control of the workloads; called once when the rollout ends
    async fn finalize(&self, status: &mut RolloutStatus, succeeded: bool) -> bool;
}
