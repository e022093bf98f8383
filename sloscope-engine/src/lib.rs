//! Metrics-driven experiment engine for validating service-level objectives.
//!
//! An operator describes an experiment as an ordered sequence of tasks:
//! load generation (HTTP or gRPC), custom metric collection from external
//! backends, readiness checks, inline scripts, and SLO assessment. The
//! engine executes the sequence, accumulates observed metrics into a
//! structured insights record, evaluates upper and lower SLO limits per
//! application version, and persists the combined spec and result artifact
//! through a pluggable driver after every task.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sloscope_engine::{run_experiment, Config, RunContext};
//! use sloscope_store::FileDriver;
//!
//! let config = Config::from_env();
//! sloscope_engine::init_tracing(&config);
//!
//! let driver = FileDriver::new(".");
//! let context = RunContext::new(config)
//!     .with_http_load_driver(Box::new(my_http_driver));
//! run_experiment(false, &driver, &context)?;
//! ```
//!
//! # Modules
//!
//! - [`experiment`]: the experiment data model and engine state machine
//! - [`insights`]: metric registration, observation storage, SLO state
//! - [`metrics`]: canonical metric names and sample aggregation
//! - [`tasks`]: the task abstraction and the closed task registry
//! - [`predicate`]: the `if` clause expression language
//! - [`driver`]: the persistence contract and the in-memory test driver
//! - [`context`]: collaborator seams for load, readiness, and backends
//! - [`config`]: environment-sourced runner configuration

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod experiment;
pub mod insights;
pub mod metrics;
pub mod predicate;
pub mod tasks;

pub use config::{init_tracing, Config};
pub use context::{
    GrpcLoadDriver, HttpLoadDriver, LoadSummary, MetricsQuerier, ReadinessProbe, RunContext,
};
pub use driver::{Driver, RecordingDriver};
pub use error::{EngineError, EngineResult};
pub use experiment::{run_experiment, Experiment, ExperimentResult, MAJOR_MINOR};
pub use insights::{
    HistBucket, Insights, MetricMeta, MetricType, MetricValue, Slo, SloLimits, SloResults,
};
pub use metrics::{aggregate, normalize_metric_name, Aggregation};
pub use predicate::Predicate;
pub use tasks::{ExperimentSpec, Task, TaskMeta, TaskSpec};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
