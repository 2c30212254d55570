//! Event recording for rollout phase transitions and failures
//!
//! Events are fire-and-forget: a failure to record one is logged and never
//! changes the outcome of the phase that emitted it.

use crate::controller::config::ControllerConfig;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolloutEvent {
    pub severity: Severity,
    pub reason: String,
    pub message: String,
}

impl RolloutEvent {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Sink for rollout events, attached to the parent rollout resource
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, parent: &ObjectReference, event: RolloutEvent);
}

/// Publishes Kubernetes Events through the kube runtime recorder
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: kube::Client, config: &ControllerConfig) -> Self {
        let reporter = Reporter {
            controller: config.reporter.clone(),
            instance: config.reporter_instance.clone(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, parent: &ObjectReference, event: RolloutEvent) {
        let type_ = match event.severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        };

        let kube_event = Event {
            type_,
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: event.reason.clone(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&kube_event, parent).await {
            warn!(
                error = %e,
                reason = %event.reason,
                parent = ?parent.name,
                "Failed to publish rollout event (non-fatal)"
            );
        }
    }
}

#[cfg(test)]
pub use mock::MockEventRecorder;
