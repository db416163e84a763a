//! Operator configuration
//!
//! Values the synthesizer and reconciler fall back to. Built once at startup
//! and shared by reference; tests construct their own.

use std::collections::BTreeMap;
use std::time::Duration;

/// Image used when an Oomer does not name one
pub const DEFAULT_IMAGE: &str = "jdockerty/oomer:v0.0.1";

/// Label pair applied when an Oomer has no labels
pub const DEFAULT_LABEL_KEY: &str = "app";
pub const DEFAULT_LABEL_VALUE: &str = "oomer";

/// Name of the single container in the pod template
pub const DEFAULT_CONTAINER_NAME: &str = "oomer";

/// Where the crashing container writes its termination message
pub const DEFAULT_TERMINATION_MESSAGE_PATH: &str = "/tmp/oomed-pod.log";

/// Finalizer owned by this operator
pub const FINALIZER_NAME: &str = "jdocklabs.co.uk/finalizer";

/// Field manager recorded on writes
pub const FIELD_MANAGER: &str = "oom-operator";

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Delay before recreating a Deployment whose selector had to change
const DEFAULT_RECREATE_SECONDS: u64 = 5;

/// Configuration injected into the synthesizer and reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    pub default_image: String,
    pub default_labels: BTreeMap<String, String>,
    pub container_name: String,
    pub termination_message_path: String,
    /// Periodic re-check interval in the steady state
    pub requeue_interval: Duration,
    pub recreate_delay: Duration,
    pub finalizer: String,
    pub field_manager: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        let mut default_labels = BTreeMap::new();
        default_labels.insert(
            DEFAULT_LABEL_KEY.to_string(),
            DEFAULT_LABEL_VALUE.to_string(),
        );

        Self {
            default_image: DEFAULT_IMAGE.to_string(),
            default_labels,
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            termination_message_path: DEFAULT_TERMINATION_MESSAGE_PATH.to_string(),
            requeue_interval: Duration::from_secs(DEFAULT_REQUEUE_SECONDS),
            recreate_delay: Duration::from_secs(DEFAULT_RECREATE_SECONDS),
            finalizer: FINALIZER_NAME.to_string(),
            field_manager: FIELD_MANAGER.to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    pub fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    pub fn with_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizer = finalizer.into();
        self
    }
}
