//! The HTTP load task: drive load against one endpoint per version and
//! record the built-in HTTP metrics. The wire-level load generator lives
//! behind the [`HttpLoadDriver`](crate::context::HttpLoadDriver) seam; this
//! task owns version setup and all metric bookkeeping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::context::{LoadSummary, RunContext};
use crate::error::EngineError;
use crate::experiment::Experiment;
use crate::insights::{Insights, MetricMeta, MetricType, MetricValue};
use crate::metrics::{
    aggregate, Aggregation, HTTP_ERROR_COUNT, HTTP_ERROR_RATE, HTTP_LATENCY,
    HTTP_LATENCY_MEAN, HTTP_LATENCY_PERCENTILE_PREFIX, HTTP_REQUEST_COUNT,
};
use crate::tasks::{parse_duration, Task, TaskMeta};

const DEFAULT_DURATION: &str = "5s";
const DEFAULT_CONNECTIONS: u32 = 4;

/// One HTTP endpoint under test; each endpoint is one application version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct HttpEndpoint {
    /// Target URL
    #[validate(length(min = 1))]
    pub url: String,

    /// Extra request headers for this endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// Inputs to the HTTP load task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CollectHttpInputs {
    /// Single target URL; mutually exclusive with `endpoints`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// One endpoint per application version; mutually exclusive with `url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1))]
    pub endpoints: Option<Vec<HttpEndpoint>>,

    /// How long to generate load, e.g. `5s`; duration expiry is success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Total number of requests; takes precedence over `duration`
    #[serde(rename = "numRequests", default, skip_serializing_if = "Option::is_none")]
    pub num_requests: Option<u64>,

    /// Number of parallel connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<u32>,

    /// Requests per second; unlimited when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qps: Option<f64>,

    /// Request payload; requests are GET without and POST with a payload
    #[serde(rename = "payloadStr", default, skip_serializing_if = "Option::is_none")]
    pub payload_str: Option<String>,

    /// Content type sent with the payload
    #[serde(rename = "contentType", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Request headers applied to every endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    /// Latency percentiles to record as gauges; configured default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<Vec<f64>>,
}

/// Generates HTTP load and collects the built-in HTTP metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectHttpTask {
    /// Shared task metadata
    pub meta: TaskMeta,
    /// Task inputs
    pub inputs: CollectHttpInputs,
}

impl CollectHttpTask {
    fn resolved_endpoints(&self) -> Vec<HttpEndpoint> {
        match (&self.inputs.url, &self.inputs.endpoints) {
            (Some(url), None) => vec![HttpEndpoint {
                url: url.clone(),
                headers: self.inputs.headers.clone(),
            }],
            (None, Some(endpoints)) => endpoints.clone(),
            _ => Vec::new(),
        }
    }
}

impl Task for CollectHttpTask {
    fn validate_inputs(&self) -> Result<(), EngineError> {
        self.inputs
            .validate()
            .map_err(|e| EngineError::Parse(format!("invalid http task inputs: {e}")))?;
        match (&self.inputs.url, &self.inputs.endpoints) {
            (None, None) => {
                return Err(EngineError::Parse(
                    "http task needs a url or a list of endpoints".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(EngineError::Parse(
                    "http task with both a url and a list of endpoints".to_string(),
                ))
            }
            _ => {}
        }
        if let Some(endpoints) = &self.inputs.endpoints {
            for endpoint in endpoints {
                endpoint
                    .validate()
                    .map_err(|e| EngineError::Parse(format!("invalid http endpoint: {e}")))?;
            }
        }
        if let Some(duration) = &self.inputs.duration {
            parse_duration(duration)?;
        }
        if let Some(percentiles) = &self.inputs.percentiles {
            for p in percentiles {
                if !(0.0..=100.0).contains(p) {
                    return Err(EngineError::Parse(format!(
                        "latency percentile {p} is outside [0, 100]"
                    )));
                }
            }
        }
        Ok(())
    }

    fn initialize_defaults(&mut self) {
        if self.inputs.duration.is_none() && self.inputs.num_requests.is_none() {
            self.inputs.duration = Some(DEFAULT_DURATION.to_string());
        }
        if self.inputs.connections.is_none() {
            self.inputs.connections = Some(DEFAULT_CONNECTIONS);
        }
    }

    fn run(&self, experiment: &mut Experiment, context: &RunContext) -> Result<(), EngineError> {
        let driver = context.http_load_driver()?;
        let endpoints = self.resolved_endpoints();
        let result = experiment.result.as_mut().ok_or_else(|| {
            EngineError::Invariant("experiment without results cannot collect metrics".to_string())
        })?;
        result.init_insights_with_num_versions(endpoints.len())?;
        let insights = result.insights.as_mut().ok_or_else(|| {
            EngineError::Invariant("insights disappeared after initialization".to_string())
        })?;
        let percentiles = self
            .inputs
            .percentiles
            .clone()
            .unwrap_or_else(|| context.config().latency_percentiles.clone());

        for (version, endpoint) in endpoints.iter().enumerate() {
            debug!("generating HTTP load against {}", endpoint.url);
            let summary = driver.collect(&self.inputs, endpoint)?;
            record_load_summary(
                insights,
                version,
                &summary,
                LoadMetricNames {
                    request_count: HTTP_REQUEST_COUNT,
                    error_count: HTTP_ERROR_COUNT,
                    error_rate: HTTP_ERROR_RATE,
                    latency: HTTP_LATENCY,
                },
            )?;

            if let Some(mean) = aggregate(&summary.latencies_ms, Aggregation::Mean) {
                insights.update_metric(
                    HTTP_LATENCY_MEAN,
                    &gauge_meta("mean request latency", Some("msec")),
                    version,
                    MetricValue::Scalar(mean),
                )?;
            }
            for percentile in &percentiles {
                if let Some(value) =
                    aggregate(&summary.latencies_ms, Aggregation::Percentile(*percentile))
                {
                    insights.update_metric(
                        &format!("{HTTP_LATENCY_PERCENTILE_PREFIX}{percentile}"),
                        &gauge_meta(
                            &format!("{percentile}-th percentile request latency"),
                            Some("msec"),
                        ),
                        version,
                        MetricValue::Scalar(value),
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Canonical names under which one load task registers its built-ins.
pub(crate) struct LoadMetricNames {
    pub request_count: &'static str,
    pub error_count: &'static str,
    pub error_rate: &'static str,
    pub latency: &'static str,
}

pub(crate) fn record_load_summary(
    insights: &mut Insights,
    version: usize,
    summary: &LoadSummary,
    names: LoadMetricNames,
) -> Result<(), EngineError> {
    insights.update_metric(
        names.request_count,
        &counter_meta("number of requests sent"),
        version,
        MetricValue::Scalar(summary.request_count),
    )?;
    insights.update_metric(
        names.error_count,
        &counter_meta("number of errors observed"),
        version,
        MetricValue::Scalar(summary.error_count),
    )?;
    insights.update_metric(
        names.error_rate,
        &gauge_meta("fraction of requests that errored", None),
        version,
        MetricValue::Scalar(summary.error_rate),
    )?;
    insights.update_metric(
        names.latency,
        &MetricMeta {
            description: "observed request latencies".to_string(),
            units: Some("msec".to_string()),
            metric_type: MetricType::Sample,
        },
        version,
        MetricValue::Sample(summary.latencies_ms.clone()),
    )?;
    Ok(())
}

pub(crate) fn counter_meta(description: &str) -> MetricMeta {
    MetricMeta {
        description: description.to_string(),
        units: None,
        metric_type: MetricType::Counter,
    }
}

pub(crate) fn gauge_meta(description: &str, units: Option<&str>) -> MetricMeta {
    MetricMeta {
        description: description.to_string(),
        units: units.map(|u| u.to_string()),
        metric_type: MetricType::Gauge,
    }
}
