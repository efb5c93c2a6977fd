pub mod store;

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::{types::DEFAULT_CLASS, workqueue::RateLimiter};

pub use store::{global_resync, resyncing_store, ConfigSnapshot, ConfigStore};

/// Name of the config blob holding [`AutoscalerConfig`].
pub const AUTOSCALER_CONFIG_NAME: &str = "autoscaler";

fn default_class() -> String {
    DEFAULT_CLASS.to_string()
}

fn default_workers() -> usize {
    4
}

fn default_listen_addr() -> String {
    "[::]:8080".to_string()
}

fn default_decision_channel_capacity() -> usize {
    1024
}

fn default_retry_base_delay_ms() -> u64 {
    5
}

fn default_retry_max_delay_seconds() -> u64 {
    1000
}

/// Process settings, read once at startup.
#[derive(Deserialize, Clone, Debug)]
pub struct ControllerConfig {
    /// Directory holding the hot-reloadable config blobs, one file per config name
    pub config_dir: PathBuf,
    /// Autoscaler class handled by this controller
    #[serde(default = "default_class")]
    pub class: String,
    /// Number of concurrent reconcile workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Namespace to watch. All namespaces if not specified.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Listen address of the decision endpoint
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Capacity of the channel between the decision engine and the work queue
    #[serde(default = "default_decision_channel_capacity")]
    pub decision_channel_capacity: usize,
    /// First retry delay of a failing key
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Ceiling of the retry delay of a failing key
    #[serde(default = "default_retry_max_delay_seconds")]
    pub retry_max_delay_seconds: u64,
}

impl ControllerConfig {
    pub fn try_from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CONF_").from_env()
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_secs(self.retry_max_delay_seconds),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config `{name}`: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config `{name}`: {reason}")]
    Invalid { name: String, reason: String },
    #[error("failed to read config directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn default_enable_scale_to_zero() -> bool {
    true
}

fn default_scale_to_zero_grace_period_seconds() -> u64 {
    30
}

fn default_activation_min_ready_replicas() -> i32 {
    1
}

fn default_container_concurrency_target_default() -> f64 {
    100.0
}

// A day is far longer than any sensible grace period and keeps time arithmetic in range.
const MAX_GRACE_PERIOD_SECONDS: u64 = 24 * 60 * 60;

/// Autoscaling policy shared by every PodAutoscaler of this class.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AutoscalerConfig {
    /// Whether revisions without demand may be scaled to zero at all
    #[serde(default = "default_enable_scale_to_zero")]
    pub enable_scale_to_zero: bool,
    /// How long a zero decision must hold before an active revision is scaled to zero
    #[serde(default = "default_scale_to_zero_grace_period_seconds")]
    pub scale_to_zero_grace_period_seconds: u64,
    /// Ready replicas required before an activating revision serves traffic directly
    #[serde(default = "default_activation_min_ready_replicas")]
    pub activation_min_ready_replicas: i32,
    /// Per-replica concurrency target handed to the decision engine when the
    /// PodAutoscaler sets no container concurrency
    #[serde(default = "default_container_concurrency_target_default")]
    pub container_concurrency_target_default: f64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            enable_scale_to_zero: default_enable_scale_to_zero(),
            scale_to_zero_grace_period_seconds: default_scale_to_zero_grace_period_seconds(),
            activation_min_ready_replicas: default_activation_min_ready_replicas(),
            container_concurrency_target_default: default_container_concurrency_target_default(),
        }
    }
}

impl AutoscalerConfig {
    pub fn scale_to_zero_grace_period(&self) -> Duration {
        Duration::from_secs(self.scale_to_zero_grace_period_seconds)
    }

    fn validate(&self) -> Result<(), String> {
        if self.scale_to_zero_grace_period_seconds == 0
            || self.scale_to_zero_grace_period_seconds > MAX_GRACE_PERIOD_SECONDS
        {
            return Err(format!(
                "scale-to-zero-grace-period-seconds must be within 1..={}, got {}",
                MAX_GRACE_PERIOD_SECONDS, self.scale_to_zero_grace_period_seconds
            ));
        }
        if self.activation_min_ready_replicas < 1 {
            return Err(format!(
                "activation-min-ready-replicas must be at least 1, got {}",
                self.activation_min_ready_replicas
            ));
        }
        if !(self.container_concurrency_target_default > 0.0) {
            return Err(format!(
                "container-concurrency-target-default must be positive, got {}",
                self.container_concurrency_target_default
            ));
        }
        Ok(())
    }
}

/// One parsed config blob.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigKind {
    Autoscaler(AutoscalerConfig),
}

type Parser = fn(&str, &str) -> Result<ConfigKind, ConfigError>;

/// Config names this controller reacts to, with their parser.
const REGISTRY: &[(&str, Parser)] = &[(AUTOSCALER_CONFIG_NAME, parse_autoscaler)];

fn parse_autoscaler(name: &str, blob: &str) -> Result<ConfigKind, ConfigError> {
    // An empty blob means "all defaults", which serde_yaml would reject as a missing document.
    let config: AutoscalerConfig = if blob.trim().is_empty() {
        AutoscalerConfig::default()
    } else {
        serde_yaml::from_str(blob).map_err(|source| ConfigError::Parse {
            name: name.to_string(),
            source,
        })?
    };
    config.validate().map_err(|reason| ConfigError::Invalid {
        name: name.to_string(),
        reason,
    })?;
    Ok(ConfigKind::Autoscaler(config))
}

/// Parses `blob` if `name` is a registered config name.
pub fn parse(name: &str, blob: &str) -> Option<Result<ConfigKind, ConfigError>> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, parser)| parser(name, blob))
}
