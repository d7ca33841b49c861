use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_stop_grace_ms() -> u64 {
    10_000
}

fn default_supported_runtimes() -> Vec<String> {
    vec!["go:1.19".to_string()]
}

/// Per-process runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Runtimes this node can execute; a container must declare at least
    /// one of them to be startable.
    #[serde(default = "default_supported_runtimes")]
    pub supported_runtimes: Vec<String>,
    /// How long a stopped container gets to self-report before it is
    /// force-killed with exit code 137.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            supported_runtimes: default_supported_runtimes(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grace_period_is_ten_seconds() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stop_grace_period(), Duration::from_secs(10));
        assert_eq!(config.supported_runtimes, vec!["go:1.19".to_string()]);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "supported_runtimes": ["wasm:1"] }"#).unwrap();
        assert_eq!(config.supported_runtimes, vec!["wasm:1".to_string()]);
        assert_eq!(config.stop_grace_ms, 10_000);
    }
}
