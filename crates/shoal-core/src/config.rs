//! Session configuration: thread counts per task kind, time limit, observers.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::limits::TimeLimit;
use crate::pool::ThreadBounds;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Wall-clock limit in seconds; zero or negative = unbounded.
    pub time_limit_secs: i64,
    /// How long the orchestrator idles between checks.
    pub poll_interval_ms: u64,
    /// How long shutdown waits for workers before detaching them.
    pub shutdown_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            time_limit_secs: 0,
            poll_interval_ms: 500,
            shutdown_grace_ms: 1000,
        }
    }
}

/// One configured strategy kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    #[serde(flatten)]
    pub bounds: ThreadBounds,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub settings: Settings,
    pub divers: ThreadBounds,
    pub surfers: ThreadBounds,
    pub strategies: Vec<StrategyConfig>,
    pub observers: Vec<String>,
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn time_limit(&self) -> TimeLimit {
        TimeLimit::from_secs(self.settings.time_limit_secs)
    }

    /// Flattened `key = value` view, in a stable order.
    pub fn settings(&self) -> Vec<(String, String)> {
        let mut out = vec![
            (
                "settings.time-limit".to_string(),
                self.time_limit().to_string(),
            ),
            (
                "settings.poll-interval-ms".to_string(),
                self.settings.poll_interval_ms.to_string(),
            ),
            (
                "settings.shutdown-grace-ms".to_string(),
                self.settings.shutdown_grace_ms.to_string(),
            ),
        ];
        push_bounds(&mut out, "divers", &self.divers);
        push_bounds(&mut out, "surfers", &self.surfers);
        for strategy in &self.strategies {
            push_bounds(&mut out, &format!("strategies.{}", strategy.name), &strategy.bounds);
        }
        out.push(("observers".to_string(), self.observers.join(",")));
        out
    }
}

fn push_bounds(out: &mut Vec<(String, String)>, prefix: &str, bounds: &ThreadBounds) {
    out.push((format!("{prefix}.threads"), bounds.threads.to_string()));
    out.push((format!("{prefix}.min-threads"), bounds.min_threads.to_string()));
    out.push((format!("{prefix}.max-threads"), bounds.max_threads.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_when_empty() {
        let config = SessionConfig::from_json("{}").unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.divers, ThreadBounds::new(0, 0, 128));
        assert!(config.strategies.is_empty());
        assert_eq!(config.time_limit(), TimeLimit::Unbounded);
    }

    #[test]
    fn test_full_config() {
        let config = SessionConfig::from_json(
            r#"{
                "settings": { "time_limit_secs": 30, "poll_interval_ms": 50 },
                "divers": { "threads": 2, "max_threads": 4 },
                "strategies": [ { "name": "depth-first", "threads": 1 } ],
                "observers": [ "stop-controller", "progress" ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.time_limit(), TimeLimit::Bounded(Duration::from_secs(30)));
        assert_eq!(config.settings.shutdown_grace_ms, 1000);
        assert_eq!(config.divers, ThreadBounds::new(2, 0, 4));
        assert_eq!(config.strategies[0].name, "depth-first");
        assert_eq!(config.strategies[0].bounds, ThreadBounds::new(1, 0, 128));
        assert_eq!(config.observers.len(), 2);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            SessionConfig::from_json("{ not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_settings_dump() {
        let mut config = SessionConfig::default();
        config.strategies.push(StrategyConfig {
            name: "random".into(),
            bounds: ThreadBounds::fixed(3),
        });
        let settings = config.settings();
        let lookup = |key: &str| {
            settings
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(lookup("settings.time-limit"), Some("unbounded"));
        assert_eq!(lookup("divers.max-threads"), Some("128"));
        assert_eq!(lookup("strategies.random.threads"), Some("3"));
        assert_eq!(lookup("observers"), Some(""));
    }
}
