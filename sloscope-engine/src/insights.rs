//! The insights store.
//!
//! Insights record the number of application versions under measurement,
//! metric metadata, per-version observation vectors, SLO limits, and the SLO
//! satisfaction matrices. Tasks mutate insights through the experiment
//! handle; the assess task reads scalar metric values back out through
//! [`Insights::scalar_metric_value`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::error::EngineError;
use crate::metrics::{
    aggregate, normalize_metric_name, Aggregation, PERCENTILE_AGGREGATOR_PREFIX,
};

/// The type of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Monotonically non-decreasing scalar
    Counter,
    /// Scalar that may move in either direction
    Gauge,
    /// Vector of raw observations
    Sample,
    /// Vector of histogram buckets
    Histogram,
}

/// Metadata describing a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMeta {
    /// Human readable description of the metric
    pub description: String,
    /// Units for this metric, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Type of the metric
    #[serde(rename = "type")]
    pub metric_type: MetricType,
}

/// One bucket of a histogram metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistBucket {
    /// Inclusive lower edge of the bucket
    pub lower: f64,
    /// Exclusive upper edge of the bucket
    pub upper: f64,
    /// Number of observations in the bucket
    pub count: u64,
}

/// A metric observation supplied to [`Insights::update_metric`].
///
/// The dynamic shape must agree with the registered metric type: a scalar
/// for counters and gauges, a float vector for samples, a bucket vector for
/// histograms.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A single scalar observation
    Scalar(f64),
    /// A batch of sample observations
    Sample(Vec<f64>),
    /// A batch of histogram buckets
    Histogram(Vec<HistBucket>),
}

impl MetricValue {
    fn matches(&self, metric_type: MetricType) -> bool {
        matches!(
            (self, metric_type),
            (MetricValue::Scalar(_), MetricType::Counter)
                | (MetricValue::Scalar(_), MetricType::Gauge)
                | (MetricValue::Sample(_), MetricType::Sample)
                | (MetricValue::Histogram(_), MetricType::Histogram)
        )
    }
}

/// A service level objective: a limit on a scalar metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slo {
    /// Qualified metric name, `backend/name` or `backend/name/aggregator`
    pub metric: String,
    /// Acceptable limit for this metric
    pub limit: f64,
}

/// Upper and lower SLO limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SloLimits {
    /// Upper limits: satisfied when the observed value is at most the limit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upper: Vec<Slo>,
    /// Lower limits: satisfied when the observed value is at least the limit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lower: Vec<Slo>,
}

/// SLO satisfaction matrices.
///
/// `upper[i][j]` records whether upper SLO `i` is satisfied by version `j`;
/// `lower` is the symmetric matrix for lower limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SloResults {
    /// Satisfaction of upper limits, SLO index by version index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upper: Vec<Vec<bool>>,
    /// Satisfaction of lower limits, SLO index by version index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lower: Vec<Vec<bool>>,
}

/// Metrics, metadata, and SLO state accumulated over an experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    /// Number of application versions under measurement
    #[serde(rename = "numVersions")]
    pub num_versions: usize,

    /// Metadata for every registered metric, keyed by canonical name
    #[serde(rename = "metricsInfo", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics_info: BTreeMap<String, MetricMeta>,

    /// Per-version observation vectors for counter, gauge, and sample
    /// metrics. The outer vector has one entry per version.
    #[serde(
        rename = "nonHistMetricValues",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub non_hist_metric_values: Vec<BTreeMap<String, Vec<f64>>>,

    /// Per-version bucket vectors for histogram metrics
    #[serde(
        rename = "histMetricValues",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub hist_metric_values: Vec<BTreeMap<String, Vec<HistBucket>>>,

    /// SLO limits configured for this experiment
    #[serde(rename = "SLOs", default, skip_serializing_if = "Option::is_none")]
    pub slos: Option<SloLimits>,

    /// SLO satisfaction matrices filled by the assess task
    #[serde(
        rename = "SLOsSatisfied",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub slos_satisfied: Option<SloResults>,
}

impl Insights {
    /// Allocate the per-version value containers, or verify consistency if
    /// they already exist (e.g. after deserializing a partial artifact).
    pub fn init_metrics(&mut self) -> Result<(), EngineError> {
        if !self.non_hist_metric_values.is_empty() || !self.hist_metric_values.is_empty() {
            if self.non_hist_metric_values.len() != self.num_versions
                || self.hist_metric_values.len() != self.num_versions
            {
                return Err(EngineError::Invariant(format!(
                    "inconsistent number of app versions in non-hist metric values ({}), hist metric values ({}), num versions ({})",
                    self.non_hist_metric_values.len(),
                    self.hist_metric_values.len(),
                    self.num_versions
                )));
            }
            if self.non_hist_metric_values[0].len() + self.hist_metric_values[0].len()
                != self.metrics_info.len()
            {
                return Err(EngineError::Invariant(format!(
                    "inconsistent number of metrics in non-hist metric values ({}), hist metric values ({}), metrics info ({})",
                    self.non_hist_metric_values[0].len(),
                    self.hist_metric_values[0].len(),
                    self.metrics_info.len()
                )));
            }
            return Ok(());
        }
        self.non_hist_metric_values = vec![BTreeMap::new(); self.num_versions];
        self.hist_metric_values = vec![BTreeMap::new(); self.num_versions];
        Ok(())
    }

    fn register_metric(&mut self, name: &str, meta: &MetricMeta) -> Result<(), EngineError> {
        if let Some(old) = self.metrics_info.get(name) {
            if old != meta {
                return Err(EngineError::Invariant(format!(
                    "old and new metric metadata for {name} differ; old: {old:?}, new: {meta:?}"
                )));
            }
            return Ok(());
        }
        self.metrics_info.insert(name.to_string(), meta.clone());
        Ok(())
    }

    /// Register a metric and append an observation for the given version.
    ///
    /// The name is canonicalized first. Fails on a type/value mismatch, an
    /// out-of-range version index, a metadata conflict, or an unparseable
    /// percentile in the name.
    pub fn update_metric(
        &mut self,
        name: &str,
        meta: &MetricMeta,
        version: usize,
        value: MetricValue,
    ) -> Result<(), EngineError> {
        if !value.matches(meta.metric_type) {
            return Err(EngineError::Invariant(format!(
                "metric value and type are incompatible; name: {name}, meta: {meta:?}, version: {version}, value: {value:?}"
            )));
        }
        if self.num_versions <= version {
            return Err(EngineError::Invariant(format!(
                "insufficient number of versions {} with version index {version}",
                self.num_versions
            )));
        }
        if self.non_hist_metric_values.len() != self.num_versions
            || self.hist_metric_values.len() != self.num_versions
        {
            return Err(EngineError::Invariant(
                "metric value containers are not initialized".to_string(),
            ));
        }

        let name = normalize_metric_name(name)?;
        self.register_metric(&name, meta)?;

        match value {
            MetricValue::Scalar(v) => {
                self.non_hist_metric_values[version]
                    .entry(name)
                    .or_default()
                    .push(v);
            }
            MetricValue::Sample(vs) => {
                self.non_hist_metric_values[version]
                    .entry(name)
                    .or_default()
                    .extend(vs);
            }
            MetricValue::Histogram(buckets) => {
                self.hist_metric_values[version]
                    .entry(name)
                    .or_default()
                    .extend(buckets);
            }
        }
        Ok(())
    }

    /// Set the SLO limits. Idempotent: re-setting an equal value succeeds,
    /// re-setting a different value is a conflict.
    pub fn set_slos(&mut self, limits: SloLimits) -> Result<(), EngineError> {
        match &self.slos {
            Some(existing) if *existing == limits => Ok(()),
            Some(existing) => Err(EngineError::Invariant(format!(
                "old and new SLO limits conflict; old: {existing:?}, new: {limits:?}"
            ))),
            None => {
                self.slos = Some(limits);
                Ok(())
            }
        }
    }

    fn counter_or_gauge_value(&self, version: usize, name: &str) -> Option<f64> {
        let meta = match self.metrics_info.get(name) {
            Some(meta) => meta,
            None => {
                warn!("no metadata found for metric {name}");
                return None;
            }
        };
        if meta.metric_type != MetricType::Counter && meta.metric_type != MetricType::Gauge {
            error!("metric {name} is not of type counter or gauge");
            return None;
        }
        let values = match self.non_hist_metric_values.get(version) {
            Some(values) => values,
            None => {
                warn!(
                    "metric values not found for version {version}; initialized for {} versions",
                    self.non_hist_metric_values.len()
                );
                return None;
            }
        };
        values.get(name).and_then(|vs| vs.last()).copied()
    }

    fn sample_aggregation(&self, version: usize, base: &str, aggregator: &str) -> Option<f64> {
        let aggregation: Aggregation = match aggregator.parse() {
            Ok(aggregation) => aggregation,
            Err(err) => {
                error!("invalid aggregation over {base}: {err}");
                return None;
            }
        };
        let values = self.non_hist_metric_values.get(version)?.get(base)?;
        aggregate(values, aggregation)
    }

    // Names reaching this point have exactly three slash-separated tokens,
    // guaranteed by the caller's segment count check.
    fn aggregate_metric(&self, version: usize, name: &str) -> Option<f64> {
        let segments: Vec<&str> = name.split('/').collect();
        let base = format!("{}/{}", segments[0], segments[1]);
        match self.metrics_info.get(&base) {
            Some(meta) if meta.metric_type == MetricType::Sample => {
                trace!("aggregating sample metric {base}");
                self.sample_aggregation(version, &base, segments[2])
            }
            Some(_) => {
                error!("metric {base} used for aggregation is not a sample metric");
                None
            }
            None => {
                warn!("could not find metric {base} used for aggregation");
                None
            }
        }
    }

    /// Resolve a scalar reading of the given qualified metric for a version.
    ///
    /// Three-segment names aggregate over the sample-typed base metric;
    /// two-segment names canonicalize and return the last appended counter
    /// or gauge observation. Anything else, and every numeric failure along
    /// the way, resolves to absent.
    pub fn scalar_metric_value(&self, version: usize, name: &str) -> Option<f64> {
        match name.split('/').count() {
            3 => self.aggregate_metric(version, name),
            2 => {
                let normalized = match normalize_metric_name(name) {
                    Ok(normalized) => normalized,
                    Err(err) => {
                        error!("{err}");
                        return None;
                    }
                };
                self.counter_or_gauge_value(version, &normalized)
            }
            _ => {
                error!(
                    "invalid metric name {name}; metric names must be of the form a/b or a/b/c, \
                     where a is a metrics backend id, b is a metric name, and c is an aggregation function"
                );
                None
            }
        }
    }

    /// Look up metadata for a qualified metric name.
    ///
    /// For a three-segment name the metadata is synthesized from the base
    /// sample metric: the type is counter for the `count` aggregator and
    /// gauge otherwise, and the description names the aggregation.
    pub fn get_metrics_info(&self, name: &str) -> Result<MetricMeta, EngineError> {
        let segments: Vec<&str> = name.split('/').collect();
        match segments.len() {
            3 => {
                let base = format!("{}/{}", segments[0], segments[1]);
                let base_meta = self.metrics_info.get(&base).ok_or_else(|| {
                    EngineError::Invariant(format!("unable to find info for sample metric {base}"))
                })?;
                let aggregator = segments[2];
                let metric_type = if aggregator == "count" {
                    MetricType::Counter
                } else {
                    MetricType::Gauge
                };
                let rendered = match aggregator.strip_prefix(PERCENTILE_AGGREGATOR_PREFIX) {
                    Some(percent) if percent.parse::<f64>().is_ok() => {
                        format!("{percent}-th percentile value")
                    }
                    _ => format!("{aggregator} value"),
                };
                Ok(MetricMeta {
                    description: format!("{rendered} of {base}"),
                    units: base_meta.units.clone(),
                    metric_type,
                })
            }
            2 => self.metrics_info.get(name).cloned().ok_or_else(|| {
                EngineError::Invariant(format!("unable to find info for metric {name}"))
            }),
            _ => Err(EngineError::Parse(format!(
                "invalid metric name {name}; metric names must be of the form a/b or a/b/c"
            ))),
        }
    }
}
