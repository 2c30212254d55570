//! Controller configuration from environment variables
//!
//! - `KULTA_FIELD_MANAGER`: field manager recorded on Deployment patches
//!   (default: kulta-batch-rollout)
//! - `KULTA_CONTROLLER_NAME`: reporting controller for Kubernetes Events
//!   (default: kulta-batch-controller)
//! - `KULTA_POD_NAME`: reporting instance for Kubernetes Events (optional)

pub const DEFAULT_FIELD_MANAGER: &str = "kulta-batch-rollout";
pub const DEFAULT_CONTROLLER_NAME: &str = "kulta-batch-controller";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub field_manager: String,
    pub reporter: String,
    pub reporter_instance: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            reporter: DEFAULT_CONTROLLER_NAME.to_string(),
            reporter_instance: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (empty values count as unset)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            field_manager: get("KULTA_FIELD_MANAGER")
                .unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string()),
            reporter: get("KULTA_CONTROLLER_NAME")
                .unwrap_or_else(|| DEFAULT_CONTROLLER_NAME.to_string()),
            reporter_instance: get("KULTA_POD_NAME"),
        }
    }
}
