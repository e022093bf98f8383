//! The gRPC load task: drive load against one call per version and record
//! the built-in gRPC metrics. Latency is stored as a sample metric, so
//! percentiles resolve through the aggregated form `grpc/latency/p<X>`.

use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::context::RunContext;
use crate::error::EngineError;
use crate::experiment::Experiment;
use crate::metrics::{GRPC_ERROR_COUNT, GRPC_ERROR_RATE, GRPC_LATENCY, GRPC_REQUEST_COUNT};
use crate::tasks::collect_http::{record_load_summary, LoadMetricNames};
use crate::tasks::{parse_duration, Task, TaskMeta};

const DEFAULT_TOTAL: u64 = 200;
const DEFAULT_CONCURRENCY: u32 = 50;

/// One gRPC destination under test; each endpoint is one application version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct GrpcEndpoint {
    /// Host and port of the gRPC server
    #[validate(length(min = 1))]
    pub host: String,

    /// Fully qualified method; falls back to the task-level `call`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<String>,
}

/// Inputs to the gRPC load task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CollectGrpcInputs {
    /// Single target host; mutually exclusive with `endpoints`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// One destination per application version; mutually exclusive with `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1))]
    pub endpoints: Option<Vec<GrpcEndpoint>>,

    /// Fully qualified method, e.g. `routeguide.RouteGuide.GetFeature`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<String>,

    /// URL of the proto file describing the service
    #[serde(rename = "protoURL", default, skip_serializing_if = "Option::is_none")]
    pub proto_url: Option<String>,

    /// Request payload forwarded to the load driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Number of concurrent in-flight requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,

    /// Total number of requests to send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,

    /// Per-request timeout, e.g. `20s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Generates gRPC load and collects the built-in gRPC metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectGrpcTask {
    /// Shared task metadata
    pub meta: TaskMeta,
    /// Task inputs
    pub inputs: CollectGrpcInputs,
}

impl CollectGrpcTask {
    fn resolved_endpoints(&self) -> Vec<GrpcEndpoint> {
        match (&self.inputs.host, &self.inputs.endpoints) {
            (Some(host), None) => vec![GrpcEndpoint {
                host: host.clone(),
                call: self.inputs.call.clone(),
            }],
            (None, Some(endpoints)) => endpoints.clone(),
            _ => Vec::new(),
        }
    }
}

impl Task for CollectGrpcTask {
    fn validate_inputs(&self) -> Result<(), EngineError> {
        self.inputs
            .validate()
            .map_err(|e| EngineError::Parse(format!("invalid grpc task inputs: {e}")))?;
        match (&self.inputs.host, &self.inputs.endpoints) {
            (None, None) => {
                return Err(EngineError::Parse(
                    "grpc task needs a host or a list of endpoints".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(EngineError::Parse(
                    "grpc task with both a host and a list of endpoints".to_string(),
                ))
            }
            _ => {}
        }
        for endpoint in self.resolved_endpoints() {
            endpoint
                .validate()
                .map_err(|e| EngineError::Parse(format!("invalid grpc endpoint: {e}")))?;
            if endpoint.call.as_deref().unwrap_or_default().is_empty() {
                return Err(EngineError::Parse(format!(
                    "grpc endpoint {} has no call to invoke",
                    endpoint.host
                )));
            }
        }
        if let Some(timeout) = &self.inputs.timeout {
            parse_duration(timeout)?;
        }
        Ok(())
    }

    fn initialize_defaults(&mut self) {
        if self.inputs.total.is_none() {
            self.inputs.total = Some(DEFAULT_TOTAL);
        }
        if self.inputs.concurrency.is_none() {
            self.inputs.concurrency = Some(DEFAULT_CONCURRENCY);
        }
    }

    fn run(&self, experiment: &mut Experiment, context: &RunContext) -> Result<(), EngineError> {
        let driver = context.grpc_load_driver()?;
        let endpoints = self.resolved_endpoints();
        let result = experiment.result.as_mut().ok_or_else(|| {
            EngineError::Invariant("experiment without results cannot collect metrics".to_string())
        })?;
        result.init_insights_with_num_versions(endpoints.len())?;
        let insights = result.insights.as_mut().ok_or_else(|| {
            EngineError::Invariant("insights disappeared after initialization".to_string())
        })?;

        for (version, endpoint) in endpoints.iter().enumerate() {
            debug!("generating gRPC load against {}", endpoint.host);
            let summary = driver.collect(&self.inputs, endpoint)?;
            record_load_summary(
                insights,
                version,
                &summary,
                LoadMetricNames {
                    request_count: GRPC_REQUEST_COUNT,
                    error_count: GRPC_ERROR_COUNT,
                    error_rate: GRPC_ERROR_RATE,
                    latency: GRPC_LATENCY,
                },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::{GrpcLoadDriver, LoadSummary};

    struct FakeGrpcDriver;

    impl GrpcLoadDriver for FakeGrpcDriver {
        fn collect(
            &self,
            _inputs: &CollectGrpcInputs,
            _endpoint: &GrpcEndpoint,
        ) -> Result<LoadSummary, EngineError> {
            Ok(LoadSummary {
                request_count: 200.0,
                error_count: 10.0,
                error_rate: 0.05,
                latencies_ms: vec![4.0, 6.0, 8.0, 10.0],
            })
        }
    }

    fn task() -> CollectGrpcTask {
        let mut task = CollectGrpcTask {
            meta: TaskMeta {
                task: Some(crate::tasks::COLLECT_GRPC_TASK_NAME.to_string()),
                ..Default::default()
            },
            inputs: CollectGrpcInputs {
                host: Some("127.0.0.1:50051".to_string()),
                endpoints: None,
                call: Some("routeguide.RouteGuide.GetFeature".to_string()),
                proto_url: None,
                data: None,
                concurrency: None,
                total: None,
                timeout: None,
            },
        };
        task.initialize_defaults();
        task
    }

    fn context() -> RunContext {
        RunContext::new(Config::default()).with_grpc_load_driver(Box::new(FakeGrpcDriver))
    }

    #[test]
    fn test_records_built_in_metrics() {
        let mut exp = Experiment::default();
        exp.init_results(1);
        task().run(&mut exp, &context()).unwrap();

        let insights = exp.result.unwrap().insights.unwrap();
        assert_eq!(insights.num_versions, 1);
        assert_eq!(insights.scalar_metric_value(0, GRPC_REQUEST_COUNT), Some(200.0));
        assert_eq!(insights.scalar_metric_value(0, GRPC_ERROR_RATE), Some(0.05));
        // latency percentiles resolve through the aggregated sample form
        assert_eq!(insights.scalar_metric_value(0, "grpc/latency/mean"), Some(7.0));
        assert!(insights.scalar_metric_value(0, "grpc/latency/p100").unwrap() >= 10.0);
    }

    #[test]
    fn test_validate_requires_a_call() {
        let mut t = task();
        t.inputs.call = None;
        assert!(t.validate_inputs().is_err());
    }

    #[test]
    fn test_validate_requires_exactly_one_target_form() {
        let mut t = task();
        t.inputs.endpoints = Some(vec![GrpcEndpoint {
            host: "a:1".to_string(),
            call: Some("pkg.Svc.Method".to_string()),
        }]);
        assert!(t.validate_inputs().is_err());
    }

    #[test]
    fn test_defaults_fill_total_and_concurrency() {
        let t = task();
        assert_eq!(t.inputs.total, Some(DEFAULT_TOTAL));
        assert_eq!(t.inputs.concurrency, Some(DEFAULT_CONCURRENCY));
    }
}
