//! Run context and collaborator seams.
//!
//! The network and cluster halves of the load, readiness, and
//! custom-metrics tasks live behind trait objects supplied through
//! [`RunContext`]. The engine observes a single synchronous return value
//! from each collaborator; any internal concurrency is encapsulated.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::EngineError;
use crate::insights::MetricValue;
use crate::tasks::collect_grpc::{CollectGrpcInputs, GrpcEndpoint};
use crate::tasks::collect_http::{CollectHttpInputs, HttpEndpoint};
use crate::tasks::custom_metrics::{ProviderMetric, ProviderSpec};

/// Outcome of one load generation run against one version.
#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    /// Number of requests sent
    pub request_count: f64,
    /// Number of error responses observed
    pub error_count: f64,
    /// Fraction of requests that errored
    pub error_rate: f64,
    /// Observed request latencies, in milliseconds
    pub latencies_ms: Vec<f64>,
}

/// Generates HTTP load against one endpoint and reports what it observed.
pub trait HttpLoadDriver {
    /// Run the load described by the task inputs against the endpoint.
    fn collect(
        &self,
        inputs: &CollectHttpInputs,
        endpoint: &HttpEndpoint,
    ) -> Result<LoadSummary, EngineError>;
}

/// Generates gRPC load against one endpoint and reports what it observed.
pub trait GrpcLoadDriver {
    /// Run the load described by the task inputs against the endpoint.
    fn collect(
        &self,
        inputs: &CollectGrpcInputs,
        endpoint: &GrpcEndpoint,
    ) -> Result<LoadSummary, EngineError>;
}

/// Answers whether a cluster resource currently exists and is ready.
pub trait ReadinessProbe {
    /// One probe attempt. Errors are task failures; `false` means try again.
    fn check(
        &self,
        resource: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<bool, EngineError>;
}

/// Fetches one metric observation from an external backend.
pub trait MetricsQuerier {
    /// Query the backend for one metric, for one version. The returned value
    /// shape must match the metric's declared type.
    fn query(
        &self,
        backend: &ProviderSpec,
        metric: &ProviderMetric,
        version: usize,
        values: &BTreeMap<String, String>,
    ) -> Result<MetricValue, EngineError>;
}

/// Collaborators and configuration shared by every task in a run.
///
/// A context with a missing collaborator fails the corresponding task with
/// a descriptive error, so embeddings only wire up what their specs use.
#[derive(Default)]
pub struct RunContext {
    config: Config,
    http: Option<Box<dyn HttpLoadDriver>>,
    grpc: Option<Box<dyn GrpcLoadDriver>>,
    probe: Option<Box<dyn ReadinessProbe>>,
    querier: Option<Box<dyn MetricsQuerier>>,
}

impl RunContext {
    /// Create a context with the given configuration and no collaborators.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Attach an HTTP load driver.
    pub fn with_http_load_driver(mut self, driver: Box<dyn HttpLoadDriver>) -> Self {
        self.http = Some(driver);
        self
    }

    /// Attach a gRPC load driver.
    pub fn with_grpc_load_driver(mut self, driver: Box<dyn GrpcLoadDriver>) -> Self {
        self.grpc = Some(driver);
        self
    }

    /// Attach a readiness probe.
    pub fn with_readiness_probe(mut self, probe: Box<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Attach a custom-metrics querier.
    pub fn with_metrics_querier(mut self, querier: Box<dyn MetricsQuerier>) -> Self {
        self.querier = Some(querier);
        self
    }

    /// The run configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn http_load_driver(&self) -> Result<&dyn HttpLoadDriver, EngineError> {
        self.http
            .as_deref()
            .ok_or_else(|| EngineError::Task("no HTTP load driver configured for this run".to_string()))
    }

    pub(crate) fn grpc_load_driver(&self) -> Result<&dyn GrpcLoadDriver, EngineError> {
        self.grpc
            .as_deref()
            .ok_or_else(|| EngineError::Task("no gRPC load driver configured for this run".to_string()))
    }

    pub(crate) fn readiness_probe(&self) -> Result<&dyn ReadinessProbe, EngineError> {
        self.probe
            .as_deref()
            .ok_or_else(|| EngineError::Task("no readiness probe configured for this run".to_string()))
    }

    pub(crate) fn metrics_querier(&self) -> Result<&dyn MetricsQuerier, EngineError> {
        self.querier
            .as_deref()
            .ok_or_else(|| EngineError::Task("no metrics querier configured for this run".to_string()))
    }
}
