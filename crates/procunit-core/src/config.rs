use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Rank value of a unit that has not been assigned a place in a job topology
pub const UNSET_RANK: i64 = -1;

/// Tunable timings and budgets of a process unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitTimings {
    /// Number of restarts an orchestrator may attempt. Stored, never enacted by the unit.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Time a process gets to exit after a graceful termination request (in milliseconds)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Interval between liveness checks while `start` waits (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Default maximum number of lines written by one log read
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,

    /// Default window size of a tail read (in bytes)
    #[serde(default = "default_tail_bytes")]
    pub tail_bytes: u64,
}

impl Default for UnitTimings {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            grace_period_ms: default_grace_period_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            log_lines: default_log_lines(),
            tail_bytes: default_tail_bytes(),
        }
    }
}

impl UnitTimings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the timings and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("poll_interval_ms must be greater than zero"));
        }

        if self.poll_interval_ms >= self.grace_period_ms {
            return Err(anyhow::anyhow!(
                "poll_interval_ms must be smaller than grace_period_ms"
            ));
        }

        if self.log_lines == 0 {
            return Err(anyhow::anyhow!("log_lines must be greater than zero"));
        }

        if self.tail_bytes == 0 {
            return Err(anyhow::anyhow!("tail_bytes must be greater than zero"));
        }

        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration of a single supervised process
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct UnitConfig {
    #[builder(default)]
    #[builder(setter(custom))]
    pub entrypoint: Vec<String>,
    #[builder(default = "UNSET_RANK")]
    pub rank: i64,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub out_path: Option<PathBuf>,
    #[builder(default)]
    pub err_path: Option<PathBuf>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    pub timings: UnitTimings,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            entrypoint: Vec::new(),
            rank: UNSET_RANK,
            env: HashMap::new(),
            out_path: None,
            err_path: None,
            working_directory: None,
            timings: UnitTimings::default(),
        }
    }
}

impl UnitConfig {
    pub fn builder() -> UnitConfigBuilder {
        UnitConfigBuilder::default()
    }
}

impl UnitConfigBuilder {
    pub fn entrypoint<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let entrypoint: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.entrypoint = Some(entrypoint);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

// Default value functions for serde
fn default_retry_budget() -> u32 {
    3
}
fn default_grace_period_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_log_lines() -> usize {
    1000
}
fn default_tail_bytes() -> u64 {
    3000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let timings = UnitTimings::default();
        assert!(timings.validate().is_ok());
        assert_eq!(timings.retry_budget, 3);
        assert_eq!(timings.grace_period(), Duration::from_secs(10));
        assert_eq!(timings.poll_interval(), Duration::from_millis(100));
        assert_eq!(timings.log_lines, 1000);
    }

    #[test]
    fn test_invalid_timings() {
        let mut timings = UnitTimings {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(timings.validate().is_err());

        timings.poll_interval_ms = 500;
        timings.grace_period_ms = 200;
        assert!(timings.validate().is_err());

        timings.grace_period_ms = 1_000;
        timings.log_lines = 0;
        assert!(timings.validate().is_err());
    }

    #[test]
    fn test_partial_timings_deserialize_with_defaults() {
        let timings: UnitTimings =
            serde_json::from_str(r#"{"gracePeriodMs": 2500, "retryBudget": 5}"#).unwrap();
        assert_eq!(timings.grace_period_ms, 2_500);
        assert_eq!(timings.retry_budget, 5);
        assert_eq!(timings.poll_interval_ms, 100);
        assert_eq!(timings.tail_bytes, 3000);
    }

    #[test]
    fn test_builder_defaults() {
        let config = UnitConfig::builder().build().unwrap();
        assert!(config.entrypoint.is_empty());
        assert_eq!(config.rank, UNSET_RANK);
        assert!(config.out_path.is_none());
        assert_eq!(config, UnitConfig::default());
    }

    #[test]
    fn test_builder_custom_setters() {
        let config = UnitConfig::builder()
            .entrypoint(["sh", "-c", "echo hi"])
            .rank(2)
            .env("A", "1")
            .env_multi([("B", "2"), ("A", "3")])
            .out_path("/tmp/unit/out.log")
            .build()
            .unwrap();

        assert_eq!(config.entrypoint, vec!["sh", "-c", "echo hi"]);
        assert_eq!(config.rank, 2);
        assert_eq!(config.env.get("A").map(String::as_str), Some("3"));
        assert_eq!(config.env.get("B").map(String::as_str), Some("2"));
        assert_eq!(config.out_path, Some(PathBuf::from("/tmp/unit/out.log")));
        assert_eq!(config.err_path, None);
    }
}
