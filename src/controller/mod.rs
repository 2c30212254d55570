pub mod client;
pub mod config;
pub mod events;
pub mod workloads;

pub use client::{ClientError, KubeWorkloadClient, NamespacedName, WorkloadClient};
pub use config::ControllerConfig;
pub use events::{EventRecorder, KubeEventRecorder, RolloutEvent, Severity};
pub use workloads::{DeploymentController, WorkloadController, WorkloadError};
