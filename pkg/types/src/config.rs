use pkg_constants::controller::{
    DEFAULT_RETRY_BACKOFF_FACTOR, DEFAULT_RETRY_INITIAL_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Daemon configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/memberd/data
/// manifest: /etc/memberd/workloads.yaml
/// debounce-ms: 50
/// resync-interval-secs: 300
/// probe-interval-ms: 250
/// min-ready-ms: 0
/// retry:
///   initial-delay-ms: 500
///   max-delay-ms: 30000
///   backoff-factor: 2.0
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default, alias = "debounce-ms")]
    pub debounce_ms: Option<u64>,
    #[serde(default, alias = "resync-interval-secs")]
    pub resync_interval_secs: Option<u64>,
    #[serde(default, alias = "probe-interval-ms")]
    pub probe_interval_ms: Option<u64>,
    #[serde(default, alias = "min-ready-ms")]
    pub min_ready_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Backoff policy for ordinal creation steps.
///
/// There is no attempt limit: a failing ordinal blocks its replica set until
/// the step succeeds or the operation is cancelled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Delay, in milliseconds, before the first retry.
    #[serde(default = "default_initial_delay_ms", alias = "initial-delay-ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay between retries.
    #[serde(default = "default_max_delay_ms", alias = "max-delay-ms")]
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier applied to the delay after each attempt.
    #[serde(default = "default_backoff_factor", alias = "backoff-factor")]
    pub backoff_factor: f64,
}

fn default_initial_delay_ms() -> u64 {
    DEFAULT_RETRY_INITIAL_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_RETRY_MAX_DELAY_MS
}

fn default_backoff_factor() -> f64 {
    DEFAULT_RETRY_BACKOFF_FACTOR
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            backoff_factor: DEFAULT_RETRY_BACKOFF_FACTOR,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.backoff_factor.max(1.0);
        let delay = self.initial_delay_ms as f64 * factor.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for(500), Duration::from_millis(1_000));
    }

    #[test]
    fn parses_kebab_case_file() {
        let cfg: ControllerConfigFile = serde_yaml::from_str(
            "data-dir: /var/lib/memberd\ndebounce-ms: 10\nretry:\n  initial-delay-ms: 20\n",
        )
        .unwrap();
        assert_eq!(cfg.data_dir.as_deref(), Some("/var/lib/memberd"));
        assert_eq!(cfg.debounce_ms, Some(10));
        let retry = cfg.retry.unwrap();
        assert_eq!(retry.initial_delay_ms, 20);
        assert_eq!(retry.max_delay_ms, DEFAULT_RETRY_MAX_DELAY_MS);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg: ControllerConfigFile =
            load_config_file("/nonexistent/memberd/config.yaml").unwrap();
        assert!(cfg.data_dir.is_none());
        assert!(cfg.retry.is_none());
    }
}
