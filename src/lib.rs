//! Batch rollouts between two Deployments
//!
//! A `BatchRollout` names a source Deployment (old version) and a target
//! Deployment (new version) and a plan of batches. The workload controller
//! in `controller::workloads` moves replicas from source to target one batch
//! at a time while keeping the combined replica count at the rollout size.

pub mod controller;
pub mod crd;
