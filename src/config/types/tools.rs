//! Tool execution configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Tool execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default circuit breaker settings
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
    /// Per-tool circuit breaker overrides
    #[serde(default)]
    pub overrides: HashMap<String, CircuitBreakerConfig>,
    /// Timeout for a single tool call
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfig {
            circuit: CircuitBreakerConfig::default(),
            overrides: HashMap::new(),
            call_timeout: default_call_timeout(),
        }
    }
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Circuit breaker thresholds for one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_consecutive")]
    pub consecutive_failure_threshold: u32,
    /// Failure ratio (0..=1) within the window that opens the circuit
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,
    /// Samples required before the failure rate is considered
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,
    /// Rolling window length
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
    /// Maximum samples kept in the window
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// How long the circuit stays open
    #[serde(default = "default_open_duration", with = "humantime_serde")]
    pub open_duration: Duration,
    /// Probe calls admitted while half-open
    #[serde(default = "default_probe_count")]
    pub half_open_probe_count: u32,
    /// Probe successes required to close again
    #[serde(default = "default_probe_successes")]
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            consecutive_failure_threshold: default_consecutive(),
            failure_rate_threshold: default_failure_rate(),
            minimum_calls: default_minimum_calls(),
            window: default_window(),
            max_samples: default_max_samples(),
            open_duration: default_open_duration(),
            half_open_probe_count: default_probe_count(),
            half_open_success_threshold: default_probe_successes(),
        }
    }
}

fn default_consecutive() -> u32 {
    5
}

fn default_failure_rate() -> f64 {
    0.5
}

fn default_minimum_calls() -> u32 {
    10
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_max_samples() -> usize {
    100
}

fn default_open_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_count() -> u32 {
    3
}

fn default_probe_successes() -> u32 {
    2
}
