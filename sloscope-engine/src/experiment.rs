//! The experiment: spec, result, and the engine state machine.
//!
//! An experiment owns an ordered task spec and a result. The engine runs the
//! spec one task at a time, gating each task on its `if` clause, counting
//! completed tasks (skipped tasks included), latching the failure flag on
//! the first task error, and persisting a snapshot through the driver after
//! the loop increment and after every counted task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::context::RunContext;
use crate::driver::Driver;
use crate::error::EngineError;
use crate::insights::Insights;
use crate::predicate::Predicate;
use crate::tasks::ExperimentSpec;

/// Version string stamped into freshly initialized results.
pub const MAJOR_MINOR: &str = "v0.1";

/// An experiment: a task spec and the results accumulated by running it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// The sequence of tasks that constitute this experiment
    #[serde(default)]
    pub spec: ExperimentSpec,

    /// Current results; partial until the experiment completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExperimentResult>,
}

/// The current results of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Revision of this experiment, stamped by the driver at init
    #[serde(default)]
    pub revision: i64,

    /// Wall clock time at which the result was initialized
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,

    /// Number of loops this experiment has run for
    #[serde(rename = "numLoops")]
    pub num_loops: u32,

    /// Number of completed tasks, skipped tasks included
    #[serde(rename = "numCompletedTasks")]
    pub num_completed_tasks: usize,

    /// True once any task has failed; stays true for the revision
    pub failure: bool,

    /// Version of the runner that created this result
    #[serde(rename = "iter8Version")]
    pub runner_version: String,

    /// Insights produced by the tasks so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<Insights>,
}

impl ExperimentResult {
    /// Lazily allocate insights for `n` application versions.
    ///
    /// Calling again with a different `n` is an invariant violation; the
    /// version count is immutable once set.
    pub fn init_insights_with_num_versions(&mut self, n: usize) -> Result<(), EngineError> {
        if let Some(insights) = &self.insights {
            if insights.num_versions != n {
                return Err(EngineError::Invariant(format!(
                    "inconsistent number of app versions; old ({}); new ({n})",
                    insights.num_versions
                )));
            }
        }
        let insights = self.insights.get_or_insert_with(|| Insights {
            num_versions: n,
            ..Default::default()
        });
        insights.init_metrics()
    }
}

impl Experiment {
    /// Read an experiment through the given driver.
    pub fn build(driver: &dyn Driver) -> Result<Experiment, EngineError> {
        driver.read()
    }

    /// Initialize a fresh result section at the given revision.
    pub fn init_results(&mut self, revision: i64) {
        self.result = Some(ExperimentResult {
            revision,
            start_time: Utc::now(),
            num_loops: 0,
            num_completed_tasks: 0,
            failure: false,
            runner_version: MAJOR_MINOR.to_string(),
            insights: None,
        });
    }

    /// True when every task in the spec has been counted as completed.
    pub fn completed(&self) -> bool {
        match &self.result {
            Some(result) => result.num_completed_tasks == self.spec.len(),
            None => false,
        }
    }

    /// True when a result exists and no task has failed.
    pub fn no_failure(&self) -> bool {
        matches!(&self.result, Some(result) if !result.failure)
    }

    /// Indices of the versions that satisfy every configured SLO.
    ///
    /// With no SLOs configured every version trivially satisfies; with no
    /// versions there is nothing to satisfy. Satisfaction cells that were
    /// never evaluated read as unsatisfied.
    fn slos_satisfied_by(&self) -> Vec<usize> {
        let insights = match self.result.as_ref().and_then(|r| r.insights.as_ref()) {
            Some(insights) => insights,
            None => return Vec::new(),
        };
        if insights.num_versions == 0 {
            return Vec::new();
        }
        let limits = match &insights.slos {
            Some(limits) => limits,
            None => return (0..insights.num_versions).collect(),
        };
        let cell = |matrix: Option<&Vec<Vec<bool>>>, i: usize, j: usize| -> bool {
            matrix
                .and_then(|m| m.get(i))
                .and_then(|row| row.get(j))
                .copied()
                .unwrap_or(false)
        };
        let satisfied = insights.slos_satisfied.as_ref();
        (0..insights.num_versions)
            .filter(|&j| {
                limits
                    .upper
                    .iter()
                    .enumerate()
                    .all(|(i, _)| cell(satisfied.map(|s| &s.upper), i, j))
                    && limits
                        .lower
                        .iter()
                        .enumerate()
                        .all(|(i, _)| cell(satisfied.map(|s| &s.lower), i, j))
            })
            .collect()
    }

    /// True when every version satisfies every configured SLO.
    ///
    /// Callable from task predicates as `SLOs()`. Returns false when the
    /// result or insights are absent, or when no versions were observed.
    pub fn slos(&self) -> bool {
        let insights = match self.result.as_ref().and_then(|r| r.insights.as_ref()) {
            Some(insights) => insights,
            None => {
                debug!("experiment result or insights absent; SLOs() is false");
                return false;
            }
        };
        if insights.num_versions == 0 {
            return false;
        }
        insights.num_versions == self.slos_satisfied_by().len()
    }

    fn fail_experiment(&mut self) {
        if let Some(result) = &mut self.result {
            result.failure = true;
        }
    }

    fn increment_num_completed_tasks(&mut self) {
        if let Some(result) = &mut self.result {
            result.num_completed_tasks += 1;
        }
    }

    fn increment_num_loops(&mut self) {
        if let Some(result) = &mut self.result {
            result.num_loops += 1;
        }
    }

    /// Run the experiment: one full traversal of the spec.
    ///
    /// The caller decides whether the result is fresh or reused; see
    /// [`run_experiment`]. A task error latches the failure flag, persists a
    /// final snapshot, and aborts this invocation.
    pub fn run(&mut self, driver: &dyn Driver, context: &RunContext) -> Result<(), EngineError> {
        if self.result.is_none() {
            return Err(EngineError::Invariant(
                "experiment with no result section cannot be run".to_string(),
            ));
        }

        self.increment_num_loops();
        if let Some(result) = &self.result {
            debug!("experiment loop {} started", result.num_loops);
        }
        driver.write(self)?;

        let tasks = self.spec.clone();
        debug!("attempting to execute {} tasks", tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            info!("task {}: {} : started", i + 1, task.name());
            let mut should_run = true;
            if let Some(condition) = task.condition() {
                let predicate = Predicate::compile(condition)?;
                should_run = predicate.eval(self)?;
            }
            if should_run {
                if let Err(err) = task.run(self, context) {
                    error!("task {}: {} : failure", i + 1, task.name());
                    self.fail_experiment();
                    driver.write(self)?;
                    return Err(err);
                }
                info!("task {}: {} : completed", i + 1, task.name());
            } else {
                info!("task {}: {} : skipped", i + 1, task.name());
            }
            self.increment_num_completed_tasks();
            driver.write(self)?;
        }
        Ok(())
    }
}

/// Read the experiment through the driver and run it.
///
/// With `reuse_result` false a fresh result is initialized at the driver's
/// revision; with `reuse_result` true the persisted result carries over, as
/// when a scheduler re-enters a looping experiment.
pub fn run_experiment(
    reuse_result: bool,
    driver: &dyn Driver,
    context: &RunContext,
) -> Result<(), EngineError> {
    let mut experiment = Experiment::build(driver)?;
    if !reuse_result {
        experiment.init_results(driver.revision());
    }
    experiment.run(driver, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::{MetricMeta, MetricType, MetricValue, Slo, SloLimits, SloResults};

    #[test]
    fn test_init_results_stamps_revision_and_version() {
        let mut exp = Experiment::default();
        exp.init_results(4);
        let result = exp.result.unwrap();
        assert_eq!(result.revision, 4);
        assert_eq!(result.num_loops, 0);
        assert_eq!(result.runner_version, MAJOR_MINOR);
        assert!(!result.failure);
    }

    #[test]
    fn test_init_insights_is_idempotent_per_count() {
        let mut exp = Experiment::default();
        exp.init_results(1);
        let result = exp.result.as_mut().unwrap();
        result.init_insights_with_num_versions(2).unwrap();
        result.init_insights_with_num_versions(2).unwrap();
        assert!(result.init_insights_with_num_versions(3).is_err());
    }

    #[test]
    fn test_completed_and_no_failure() {
        let mut exp = Experiment::default();
        assert!(!exp.completed());
        assert!(!exp.no_failure());

        exp.init_results(1);
        assert!(exp.completed()); // empty spec
        assert!(exp.no_failure());

        exp.result.as_mut().unwrap().failure = true;
        assert!(!exp.no_failure());
    }

    fn experiment_with_slo_state(
        num_versions: usize,
        limits: Option<SloLimits>,
        satisfied: Option<SloResults>,
    ) -> Experiment {
        let mut exp = Experiment::default();
        exp.init_results(1);
        let result = exp.result.as_mut().unwrap();
        result.init_insights_with_num_versions(num_versions).unwrap();
        let insights = result.insights.as_mut().unwrap();
        insights.slos = limits;
        insights.slos_satisfied = satisfied;
        exp
    }

    #[test]
    fn test_slos_false_without_insights_or_versions() {
        let exp = Experiment::default();
        assert!(!exp.slos());

        let mut exp = Experiment::default();
        exp.init_results(1);
        assert!(!exp.slos());

        let exp = experiment_with_slo_state(0, None, None);
        assert!(!exp.slos());
    }

    #[test]
    fn test_slos_true_without_configured_limits() {
        let exp = experiment_with_slo_state(2, None, None);
        assert!(exp.slos());
    }

    #[test]
    fn test_slos_requires_every_cell() {
        let limits = SloLimits {
            upper: vec![Slo {
                metric: "http/error-rate".to_string(),
                limit: 0.0,
            }],
            lower: vec![],
        };
        let exp = experiment_with_slo_state(
            2,
            Some(limits.clone()),
            Some(SloResults {
                upper: vec![vec![true, true]],
                lower: vec![],
            }),
        );
        assert!(exp.slos());

        let exp = experiment_with_slo_state(
            2,
            Some(limits.clone()),
            Some(SloResults {
                upper: vec![vec![true, false]],
                lower: vec![],
            }),
        );
        assert!(!exp.slos());

        // limits configured but never assessed: cells read unsatisfied
        let exp = experiment_with_slo_state(2, Some(limits), None);
        assert!(!exp.slos());
    }

    #[test]
    fn test_result_serializes_with_artifact_field_names() {
        let mut exp = Experiment::default();
        exp.init_results(2);
        let result = exp.result.as_mut().unwrap();
        result.init_insights_with_num_versions(1).unwrap();
        result
            .insights
            .as_mut()
            .unwrap()
            .update_metric(
                "prom/requests",
                &MetricMeta {
                    description: "requests".to_string(),
                    units: None,
                    metric_type: MetricType::Counter,
                },
                0,
                MetricValue::Scalar(100.0),
            )
            .unwrap();

        let json = serde_json::to_value(&exp).unwrap();
        let result = &json["result"];
        assert!(result.get("startTime").is_some());
        assert!(result.get("numLoops").is_some());
        assert!(result.get("numCompletedTasks").is_some());
        assert!(result.get("iter8Version").is_some());
        assert_eq!(result["insights"]["numVersions"], 1);
        assert!(result["insights"]["nonHistMetricValues"][0]
            .get("prom/requests")
            .is_some());

        let reparsed: Experiment = serde_json::from_value(json).unwrap();
        assert_eq!(reparsed, exp);
    }
}
