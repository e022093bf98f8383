//! Metric names and sample aggregation.
//!
//! Canonical metric names have the form `backend/name` for registered
//! metrics, or `backend/name/aggregator` for a virtual aggregated reading
//! over a sample metric. Built-in percentile metric names carry a trailing
//! decimal percent which is normalized so that, e.g., `p95.00` and `p95`
//! refer to the same metric.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::EngineError;

/// Backend id under which HTTP load metrics are registered.
pub const HTTP_METRIC_BACKEND: &str = "http";
/// Backend id under which gRPC load metrics are registered.
pub const GRPC_METRIC_BACKEND: &str = "grpc";

/// Built-in HTTP request count metric (counter).
pub const HTTP_REQUEST_COUNT: &str = "http/request-count";
/// Built-in HTTP error count metric (counter).
pub const HTTP_ERROR_COUNT: &str = "http/error-count";
/// Built-in HTTP error rate metric (gauge).
pub const HTTP_ERROR_RATE: &str = "http/error-rate";
/// Built-in HTTP latency sample metric (sample, msec).
pub const HTTP_LATENCY: &str = "http/latency";
/// Built-in HTTP mean latency metric (gauge, msec).
pub const HTTP_LATENCY_MEAN: &str = "http/latency-mean";

/// Built-in gRPC request count metric (counter).
pub const GRPC_REQUEST_COUNT: &str = "grpc/request-count";
/// Built-in gRPC error count metric (counter).
pub const GRPC_ERROR_COUNT: &str = "grpc/error-count";
/// Built-in gRPC error rate metric (gauge).
pub const GRPC_ERROR_RATE: &str = "grpc/error-rate";
/// Built-in gRPC latency sample metric (sample, msec).
pub const GRPC_LATENCY: &str = "grpc/latency";

/// Prefix of built-in HTTP latency percentile gauges, e.g. `http/latency-p95`.
pub const HTTP_LATENCY_PERCENTILE_PREFIX: &str = "http/latency-p";
/// Prefix of aggregated gRPC latency percentiles, e.g. `grpc/latency/p95`.
pub const GRPC_LATENCY_PERCENTILE_PREFIX: &str = "grpc/latency/p";

/// Prefix of percentile aggregator tokens.
pub const PERCENTILE_AGGREGATOR_PREFIX: &str = "p";

/// Normalize percentile values embedded in built-in metric names.
///
/// The trailing token after a known percentile prefix is parsed as a float
/// and re-rendered without trailing zeros, so `http/latency-p95.00` becomes
/// `http/latency-p95`. Names without a known prefix pass through unchanged.
/// Normalization is idempotent.
pub fn normalize_metric_name(name: &str) -> Result<String, EngineError> {
    for prefix in [HTTP_LATENCY_PERCENTILE_PREFIX, GRPC_LATENCY_PERCENTILE_PREFIX] {
        if let Some(rest) = name.strip_prefix(prefix) {
            let percent: f64 = rest.parse().map_err(|_| {
                EngineError::Parse(format!("cannot extract percent from metric {name}"))
            })?;
            return Ok(format!("{prefix}{percent}"));
        }
    }
    Ok(name.to_string())
}

/// An aggregation function over a sample metric's observation vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Arithmetic mean
    Mean,
    /// Population standard deviation
    StdDev,
    /// Smallest observation
    Min,
    /// Largest observation
    Max,
    /// Number of observations, surfaced as a float
    Count,
    /// The given percentile, in `[0, 100]`
    Percentile(f64),
}

impl FromStr for Aggregation {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(Aggregation::Mean),
            "stddev" => Ok(Aggregation::StdDev),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "count" => Ok(Aggregation::Count),
            other => {
                let rest = other.strip_prefix(PERCENTILE_AGGREGATOR_PREFIX).ok_or_else(|| {
                    EngineError::Parse(format!("invalid aggregation function {other}"))
                })?;
                let percent: f64 = rest.parse().map_err(|_| {
                    EngineError::Parse(format!(
                        "unable to extract percent from aggregation function {other}"
                    ))
                })?;
                if !(0.0..=100.0).contains(&percent) {
                    return Err(EngineError::Parse(format!(
                        "percent in aggregation function {other} is outside [0, 100]"
                    )));
                }
                Ok(Aggregation::Percentile(percent))
            }
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Mean => write!(f, "mean"),
            Aggregation::StdDev => write!(f, "stddev"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Count => write!(f, "count"),
            Aggregation::Percentile(p) => write!(f, "{PERCENTILE_AGGREGATOR_PREFIX}{p}"),
        }
    }
}

/// Aggregate a sample vector.
///
/// Returns `None` for an empty sample. A single-observation sample collapses
/// every aggregator to the observation itself.
pub fn aggregate(values: &[f64], aggregation: Aggregation) -> Option<f64> {
    if values.is_empty() {
        warn!("aggregation {aggregation} over empty sample");
        return None;
    }
    if values.len() == 1 {
        return Some(values[0]);
    }
    match aggregation {
        Aggregation::Mean => Some(mean(values)),
        Aggregation::StdDev => {
            let m = mean(values);
            let variance =
                values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
            Some(variance.sqrt())
        }
        Aggregation::Min => values.iter().copied().reduce(f64::min),
        Aggregation::Max => values.iter().copied().reduce(f64::max),
        Aggregation::Count => Some(values.len() as f64),
        Aggregation::Percentile(percent) => {
            if !(0.0..=100.0).contains(&percent) {
                warn!("percent {percent} outside [0, 100]");
                return None;
            }
            let mut sorted = values.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            Some(percentile_of_sorted(&sorted, percent))
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

// Rank method: integral ranks average the two straddling observations,
// p0 clamps to the minimum and p100 to the maximum.
fn percentile_of_sorted(sorted: &[f64], percent: f64) -> f64 {
    let n = sorted.len();
    if percent <= 0.0 {
        return sorted[0];
    }
    if percent >= 100.0 {
        return sorted[n - 1];
    }
    let rank = percent / 100.0 * n as f64;
    let floor = rank.floor();
    if (rank - floor).abs() < f64::EPSILON {
        let i = floor as usize;
        if i == 0 {
            return sorted[0];
        }
        if i >= n {
            return sorted[n - 1];
        }
        (sorted[i - 1] + sorted[i]) / 2.0
    } else {
        let i = (rank.ceil() as usize).min(n);
        sorted[i - 1]
    }
}
