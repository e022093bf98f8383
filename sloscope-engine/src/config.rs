//! Runner configuration.
//!
//! Configuration is sourced from the environment with serde-style defaults.
//! Every field has a working default so a bare library embedding needs no
//! environment at all.
//!
//! Recognized environment variables:
//! - `SLOSCOPE_LOG_LEVEL`: tracing filter directive (default `info`)
//! - `SLOSCOPE_READY_TIMEOUT`: default readiness deadline (default `60s`)
//! - `SLOSCOPE_READY_POLL_INTERVAL_MS`: readiness poll interval (default `1000`)

use std::env;

use serde::Deserialize;

/// Runner configuration shared by all tasks in a run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Tracing filter directive, e.g. `info` or `sloscope_engine=debug`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Default deadline for readiness tasks that specify no timeout
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: String,

    /// Interval between readiness probe attempts, in milliseconds
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,

    /// Latency percentiles collected by load tasks that specify none
    #[serde(default = "default_latency_percentiles")]
    pub latency_percentiles: Vec<f64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ready_timeout() -> String {
    "60s".to_string()
}

fn default_ready_poll_interval_ms() -> u64 {
    1000
}

fn default_latency_percentiles() -> Vec<f64> {
    vec![50.0, 75.0, 90.0, 95.0, 99.0, 99.9]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ready_timeout: default_ready_timeout(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            latency_percentiles: default_latency_percentiles(),
        }
    }
}

impl Config {
    /// Build a configuration from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(level) = env::var("SLOSCOPE_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(timeout) = env::var("SLOSCOPE_READY_TIMEOUT") {
            config.ready_timeout = timeout;
        }
        if let Ok(interval) = env::var("SLOSCOPE_READY_POLL_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                config.ready_poll_interval_ms = ms;
            }
        }
        config
    }
}

/// Initialize the global tracing subscriber from the configured log level.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(config: &Config) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.ready_timeout, "60s");
        assert_eq!(config.ready_poll_interval_ms, 1000);
        assert!(config.latency_percentiles.contains(&95.0));
    }

    #[test]
    fn test_from_env_overrides() {
        env::set_var("SLOSCOPE_READY_TIMEOUT", "5s");
        let config = Config::from_env();
        assert_eq!(config.ready_timeout, "5s");
        env::remove_var("SLOSCOPE_READY_TIMEOUT");
    }
}
