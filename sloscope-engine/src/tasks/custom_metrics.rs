//! The custom-metrics task: pull named metrics from configured backends and
//! append one observation per version. The backend protocol lives behind the
//! [`MetricsQuerier`](crate::context::MetricsQuerier) seam; headers on the
//! provider spec carry simple forwarded credentials.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::context::RunContext;
use crate::error::EngineError;
use crate::experiment::Experiment;
use crate::insights::{MetricMeta, MetricType};
use crate::tasks::{Task, TaskMeta};

/// One metric offered by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProviderMetric {
    /// Metric name; registered as `<backend>/<name>`
    #[validate(length(min = 1))]
    pub name: String,

    /// Human readable description
    pub description: String,

    /// Units for this metric, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,

    /// Type of the metric
    #[serde(rename = "type")]
    pub metric_type: MetricType,

    /// Free-form query parameters forwarded to the querier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A metrics backend and the metrics to pull from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProviderSpec {
    /// Backend id; the first segment of the canonical metric names
    #[validate(length(min = 1))]
    pub name: String,

    /// Endpoint of the backend, if the querier needs one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Headers forwarded verbatim, including credentials
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Metrics to pull from this backend
    #[validate(length(min = 1))]
    pub metrics: Vec<ProviderMetric>,
}

/// Inputs to the custom-metrics task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CustomMetricsInputs {
    /// Backends to pull from
    #[validate(length(min = 1))]
    pub backends: Vec<ProviderSpec>,

    /// Per-version substitution values; one entry per application version
    #[serde(rename = "versionValues")]
    #[validate(length(min = 1))]
    pub version_values: Vec<BTreeMap<String, String>>,
}

/// Pulls metrics from external backends into the insights store.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMetricsTask {
    /// Shared task metadata
    pub meta: TaskMeta,
    /// Task inputs
    pub inputs: CustomMetricsInputs,
}

impl Task for CustomMetricsTask {
    fn validate_inputs(&self) -> Result<(), EngineError> {
        self.inputs
            .validate()
            .map_err(|e| EngineError::Parse(format!("invalid custom-metrics task inputs: {e}")))?;
        for backend in &self.inputs.backends {
            backend
                .validate()
                .map_err(|e| EngineError::Parse(format!("invalid backend spec: {e}")))?;
            for metric in &backend.metrics {
                metric
                    .validate()
                    .map_err(|e| EngineError::Parse(format!("invalid metric spec: {e}")))?;
            }
        }
        Ok(())
    }

    fn initialize_defaults(&mut self) {}

    fn run(&self, experiment: &mut Experiment, context: &RunContext) -> Result<(), EngineError> {
        let querier = context.metrics_querier()?;
        let result = experiment.result.as_mut().ok_or_else(|| {
            EngineError::Invariant("experiment without results cannot collect metrics".to_string())
        })?;
        result.init_insights_with_num_versions(self.inputs.version_values.len())?;
        let insights = result.insights.as_mut().ok_or_else(|| {
            EngineError::Invariant("insights disappeared after initialization".to_string())
        })?;

        for backend in &self.inputs.backends {
            for metric in &backend.metrics {
                let qualified = format!("{}/{}", backend.name, metric.name);
                let meta = MetricMeta {
                    description: metric.description.clone(),
                    units: metric.units.clone(),
                    metric_type: metric.metric_type,
                };
                for (version, values) in self.inputs.version_values.iter().enumerate() {
                    debug!("querying {qualified} for version {version}");
                    let value = querier.query(backend, metric, version, values)?;
                    insights.update_metric(&qualified, &meta, version, value)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::MetricsQuerier;
    use crate::insights::MetricValue;

    struct FixedQuerier {
        value: f64,
    }

    impl MetricsQuerier for FixedQuerier {
        fn query(
            &self,
            _backend: &ProviderSpec,
            _metric: &ProviderMetric,
            version: usize,
            _values: &BTreeMap<String, String>,
        ) -> Result<MetricValue, EngineError> {
            Ok(MetricValue::Scalar(self.value + version as f64))
        }
    }

    fn task(metric_type: MetricType) -> CustomMetricsTask {
        CustomMetricsTask {
            meta: TaskMeta {
                task: Some(crate::tasks::CUSTOM_METRICS_TASK_NAME.to_string()),
                ..Default::default()
            },
            inputs: CustomMetricsInputs {
                backends: vec![ProviderSpec {
                    name: "prom".to_string(),
                    url: Some("http://prom.example:9090".to_string()),
                    headers: BTreeMap::new(),
                    metrics: vec![ProviderMetric {
                        name: "requests".to_string(),
                        description: "request count".to_string(),
                        units: None,
                        metric_type,
                        params: None,
                    }],
                }],
                version_values: vec![BTreeMap::new(), BTreeMap::new()],
            },
        }
    }

    fn context() -> RunContext {
        RunContext::new(Config::default()).with_metrics_querier(Box::new(FixedQuerier { value: 10.0 }))
    }

    #[test]
    fn test_appends_one_observation_per_version() {
        let mut exp = Experiment::default();
        exp.init_results(1);
        task(MetricType::Counter).run(&mut exp, &context()).unwrap();

        let insights = exp.result.unwrap().insights.unwrap();
        assert_eq!(insights.num_versions, 2);
        assert_eq!(insights.non_hist_metric_values[0]["prom/requests"], vec![10.0]);
        assert_eq!(insights.non_hist_metric_values[1]["prom/requests"], vec![11.0]);
    }

    #[test]
    fn test_meta_conflict_across_runs_fails() {
        let mut exp = Experiment::default();
        exp.init_results(1);
        let ctx = context();
        task(MetricType::Counter).run(&mut exp, &ctx).unwrap();
        let err = task(MetricType::Gauge).run(&mut exp, &ctx).unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }

    #[test]
    fn test_validate_rejects_empty_backends() {
        let mut t = task(MetricType::Counter);
        t.inputs.backends.clear();
        assert!(t.validate_inputs().is_err());
    }

    #[test]
    fn test_missing_querier_fails_the_task() {
        let mut exp = Experiment::default();
        exp.init_results(1);
        let err = task(MetricType::Counter)
            .run(&mut exp, &RunContext::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Task(_)));
    }
}
