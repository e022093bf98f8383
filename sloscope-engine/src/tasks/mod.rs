//! Task abstraction and the closed task registry.
//!
//! An experiment spec is an ordered sequence of tasks. Each task carries
//! shared metadata (`task` discriminator, `run` inline script, `if`
//! predicate) and variant-specific inputs under `with`. Dispatch happens at
//! parse time: unknown discriminators, a task with neither a name nor a run
//! command, and malformed inputs are all fatal parse errors.

pub mod assess;
pub mod collect_grpc;
pub mod collect_http;
pub mod custom_metrics;
pub mod ready;
pub mod run_script;

use std::time::Duration;

use serde::de::Error as DeError;
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::context::RunContext;
use crate::error::EngineError;
use crate::experiment::Experiment;

pub use assess::AssessTask;
pub use collect_grpc::CollectGrpcTask;
pub use collect_http::CollectHttpTask;
pub use custom_metrics::CustomMetricsTask;
pub use ready::ReadyTask;
pub use run_script::RunTask;

/// Discriminator of the readiness task.
pub const READY_TASK_NAME: &str = "ready";
/// Discriminator of the custom-metrics task.
pub const CUSTOM_METRICS_TASK_NAME: &str = "custom-metrics";
/// Discriminator of the HTTP load task.
pub const COLLECT_HTTP_TASK_NAME: &str = "http";
/// Discriminator of the gRPC load task.
pub const COLLECT_GRPC_TASK_NAME: &str = "grpc";
/// Discriminator of the assess task.
pub const ASSESS_TASK_NAME: &str = "assess";
/// Name reported for the inline-script task, which has no discriminator.
pub const RUN_TASK_NAME: &str = "run";

/// Fields common to all tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Name of the task. Specify either `task` or `run`, not both.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Inline script to execute instead of a named task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,

    /// Condition deciding whether this task runs; when it evaluates to
    /// false the task is skipped. Example: `SLOs()`.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Behavior common to every task variant.
pub trait Task {
    /// Check the task inputs without mutating anything.
    fn validate_inputs(&self) -> Result<(), EngineError>;

    /// Fill in defaults for unset inputs. Idempotent.
    fn initialize_defaults(&mut self);

    /// Execute the task against the experiment.
    fn run(&self, experiment: &mut Experiment, context: &RunContext) -> Result<(), EngineError>;
}

/// Wire form of a task: shared metadata plus the raw `with` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawTask {
    #[serde(flatten)]
    meta: TaskMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    with: Option<serde_json::Value>,
}

/// A parsed task, one variant per registry entry.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskSpec {
    /// Wait for a cluster resource to become ready
    Ready(ReadyTask),
    /// Pull named metrics from configured backends
    CustomMetrics(CustomMetricsTask),
    /// Generate HTTP load and collect built-in metrics
    CollectHttp(CollectHttpTask),
    /// Generate gRPC load and collect built-in metrics
    CollectGrpc(CollectGrpcTask),
    /// Evaluate SLOs against current insights
    Assess(AssessTask),
    /// Execute an inline shell script
    Run(RunTask),
}

/// The ordered sequence of tasks in an experiment.
pub type ExperimentSpec = Vec<TaskSpec>;

impl TaskSpec {
    /// Shared metadata of this task.
    pub fn meta(&self) -> &TaskMeta {
        match self {
            TaskSpec::Ready(t) => &t.meta,
            TaskSpec::CustomMetrics(t) => &t.meta,
            TaskSpec::CollectHttp(t) => &t.meta,
            TaskSpec::CollectGrpc(t) => &t.meta,
            TaskSpec::Assess(t) => &t.meta,
            TaskSpec::Run(t) => &t.meta,
        }
    }

    /// Name of this task: its discriminator, or `run` for inline scripts.
    pub fn name(&self) -> &str {
        match self {
            TaskSpec::Ready(_) => READY_TASK_NAME,
            TaskSpec::CustomMetrics(_) => CUSTOM_METRICS_TASK_NAME,
            TaskSpec::CollectHttp(_) => COLLECT_HTTP_TASK_NAME,
            TaskSpec::CollectGrpc(_) => COLLECT_GRPC_TASK_NAME,
            TaskSpec::Assess(_) => ASSESS_TASK_NAME,
            TaskSpec::Run(_) => RUN_TASK_NAME,
        }
    }

    /// This task's `if` clause, if any.
    pub fn condition(&self) -> Option<&str> {
        self.meta().condition.as_deref()
    }

    fn as_task(&self) -> &dyn Task {
        match self {
            TaskSpec::Ready(t) => t,
            TaskSpec::CustomMetrics(t) => t,
            TaskSpec::CollectHttp(t) => t,
            TaskSpec::CollectGrpc(t) => t,
            TaskSpec::Assess(t) => t,
            TaskSpec::Run(t) => t,
        }
    }

    /// Execute this task.
    pub fn run(
        &self,
        experiment: &mut Experiment,
        context: &RunContext,
    ) -> Result<(), EngineError> {
        self.as_task().run(experiment, context)
    }

    fn from_raw(raw: RawTask) -> Result<TaskSpec, EngineError> {
        let RawTask { meta, with } = raw;
        if meta.task.is_some() && meta.run.is_some() {
            return Err(EngineError::Parse(
                "invalid task with both a task name and a run command".to_string(),
            ));
        }
        let name = meta.task.clone().unwrap_or_default();
        let mut spec = if meta.task.is_none() {
            if meta.run.is_none() {
                return Err(EngineError::Parse(
                    "invalid task found without a task name or a run command".to_string(),
                ));
            }
            TaskSpec::Run(RunTask { meta })
        } else {
            match name.as_str() {
                READY_TASK_NAME => TaskSpec::Ready(ReadyTask {
                    inputs: parse_inputs(&name, with)?,
                    meta,
                }),
                CUSTOM_METRICS_TASK_NAME => TaskSpec::CustomMetrics(CustomMetricsTask {
                    inputs: parse_inputs(&name, with)?,
                    meta,
                }),
                COLLECT_HTTP_TASK_NAME => TaskSpec::CollectHttp(CollectHttpTask {
                    inputs: parse_inputs(&name, with)?,
                    meta,
                }),
                COLLECT_GRPC_TASK_NAME => TaskSpec::CollectGrpc(CollectGrpcTask {
                    inputs: parse_inputs(&name, with)?,
                    meta,
                }),
                ASSESS_TASK_NAME => TaskSpec::Assess(AssessTask {
                    inputs: parse_inputs(&name, with)?,
                    meta,
                }),
                "" => {
                    return Err(EngineError::Parse(
                        "invalid task found without a task name or a run command".to_string(),
                    ))
                }
                other => return Err(EngineError::Parse(format!("unknown task: {other}"))),
            }
        };
        spec.as_task().validate_inputs()?;
        match &mut spec {
            TaskSpec::Ready(t) => t.initialize_defaults(),
            TaskSpec::CustomMetrics(t) => t.initialize_defaults(),
            TaskSpec::CollectHttp(t) => t.initialize_defaults(),
            TaskSpec::CollectGrpc(t) => t.initialize_defaults(),
            TaskSpec::Assess(t) => t.initialize_defaults(),
            TaskSpec::Run(t) => t.initialize_defaults(),
        }
        Ok(spec)
    }

    fn to_raw(&self) -> Result<RawTask, serde_json::Error> {
        let with = match self {
            TaskSpec::Ready(t) => Some(serde_json::to_value(&t.inputs)?),
            TaskSpec::CustomMetrics(t) => Some(serde_json::to_value(&t.inputs)?),
            TaskSpec::CollectHttp(t) => Some(serde_json::to_value(&t.inputs)?),
            TaskSpec::CollectGrpc(t) => Some(serde_json::to_value(&t.inputs)?),
            TaskSpec::Assess(t) => Some(serde_json::to_value(&t.inputs)?),
            TaskSpec::Run(_) => None,
        };
        Ok(RawTask {
            meta: self.meta().clone(),
            with,
        })
    }
}

fn parse_inputs<T: serde::de::DeserializeOwned>(
    name: &str,
    with: Option<serde_json::Value>,
) -> Result<T, EngineError> {
    let with = with.unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    serde_json::from_value(with)
        .map_err(|e| EngineError::Parse(format!("malformed inputs for {name} task: {e}")))
}

impl Serialize for TaskSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = self.to_raw().map_err(S::Error::custom)?;
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawTask::deserialize(deserializer)?;
        TaskSpec::from_raw(raw).map_err(D::Error::custom)
    }
}

/// Parse a duration string such as `500ms`, `2s`, `1.5m`, or `1h`.
pub(crate) fn parse_duration(s: &str) -> Result<Duration, EngineError> {
    let s = s.trim();
    let unit_start = s
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| EngineError::Parse(format!("duration {s:?} has no unit")))?;
    let (number, unit) = s.split_at(unit_start);
    let value: f64 = number
        .parse()
        .map_err(|_| EngineError::Parse(format!("invalid duration {s:?}")))?;
    if value < 0.0 {
        return Err(EngineError::Parse(format!("negative duration {s:?}")));
    }
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(EngineError::Parse(format!("unknown duration unit in {s:?}"))),
    };
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_parses_registered_tasks() {
        let yaml = r#"
- task: ready
  with:
    resource: deployment
    name: app
- task: assess
  with:
    SLOs:
      upper:
        - metric: http/error-rate
          limit: 0
- run: echo hello
  if: SLOs()
"#;
        let spec: ExperimentSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.len(), 3);
        assert_eq!(spec[0].name(), READY_TASK_NAME);
        assert_eq!(spec[1].name(), ASSESS_TASK_NAME);
        assert_eq!(spec[2].name(), RUN_TASK_NAME);
        assert_eq!(spec[2].condition(), Some("SLOs()"));
    }

    #[test]
    fn test_unknown_discriminator_is_rejected() {
        let yaml = "- task: flood\n";
        let err = serde_yaml::from_str::<ExperimentSpec>(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown task"));
    }

    #[test]
    fn test_task_without_name_or_run_is_rejected() {
        let yaml = "- if: SLOs()\n";
        assert!(serde_yaml::from_str::<ExperimentSpec>(yaml).is_err());
    }

    #[test]
    fn test_task_with_both_name_and_run_is_rejected() {
        let yaml = "- task: assess\n  run: echo hi\n";
        assert!(serde_yaml::from_str::<ExperimentSpec>(yaml).is_err());
    }

    #[test]
    fn test_malformed_inputs_are_rejected() {
        let yaml = "- task: http\n  with:\n    url: 42\n";
        assert!(serde_yaml::from_str::<ExperimentSpec>(yaml).is_err());
    }

    #[test]
    fn test_spec_round_trips_through_yaml() {
        let yaml = r#"
- task: http
  with:
    url: https://example.com/get
    duration: 2s
- task: assess
  with:
    SLOs:
      upper:
        - metric: http/error-rate
          limit: 0
"#;
        let spec: ExperimentSpec = serde_yaml::from_str(yaml).unwrap();
        let rendered = serde_yaml::to_string(&spec).unwrap();
        let reparsed: ExperimentSpec = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(spec, reparsed);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("2").is_err());
        assert!(parse_duration("2d").is_err());
        assert!(parse_duration("-3s").is_err());
    }
}
