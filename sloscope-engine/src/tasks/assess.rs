//! The assess task: record SLO limits and evaluate them against the current
//! insights. Satisfaction matrices are rebuilt and fully re-evaluated on
//! every run; a missing or absent metric value marks the cell unsatisfied.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

use crate::context::RunContext;
use crate::error::EngineError;
use crate::experiment::Experiment;
use crate::insights::{SloLimits, SloResults};
use crate::tasks::{Task, TaskMeta};

/// Inputs to the assess task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct AssessInputs {
    /// Upper and lower SLO limits to record and evaluate
    #[serde(rename = "SLOs", default, skip_serializing_if = "Option::is_none")]
    pub slos: Option<SloLimits>,
}

/// Evaluates SLO limits against the insights gathered so far.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessTask {
    /// Shared task metadata
    pub meta: TaskMeta,
    /// Task inputs
    pub inputs: AssessInputs,
}

impl Task for AssessTask {
    fn validate_inputs(&self) -> Result<(), EngineError> {
        if let Some(limits) = &self.inputs.slos {
            for slo in limits.upper.iter().chain(limits.lower.iter()) {
                let segments = slo.metric.split('/').count();
                if !(2..=3).contains(&segments) {
                    return Err(EngineError::Parse(format!(
                        "SLO metric {} is not a qualified metric name",
                        slo.metric
                    )));
                }
            }
        }
        Ok(())
    }

    fn initialize_defaults(&mut self) {}

    fn run(&self, experiment: &mut Experiment, _context: &RunContext) -> Result<(), EngineError> {
        let result = experiment.result.as_mut().ok_or_else(|| {
            EngineError::Invariant("experiment without results cannot be assessed".to_string())
        })?;
        // An assess with nothing measured still records its limits; the
        // zero-version insights make SLOs() read false downstream.
        if result.insights.is_none() {
            result.init_insights_with_num_versions(0)?;
        }
        let insights = result.insights.as_mut().ok_or_else(|| {
            EngineError::Invariant("insights disappeared after initialization".to_string())
        })?;

        if let Some(limits) = &self.inputs.slos {
            insights.set_slos(limits.clone())?;
        }

        let limits = insights.slos.clone().unwrap_or_default();
        let num_versions = insights.num_versions;
        let mut satisfied = SloResults {
            upper: vec![vec![false; num_versions]; limits.upper.len()],
            lower: vec![vec![false; num_versions]; limits.lower.len()],
        };

        for (i, slo) in limits.upper.iter().enumerate() {
            for (j, cell) in satisfied.upper[i].iter_mut().enumerate() {
                let value = insights.scalar_metric_value(j, &slo.metric);
                *cell = value.map(|v| v <= slo.limit).unwrap_or(false);
                debug!(
                    "upper SLO {} for version {j}: value {value:?}, limit {}, satisfied {cell}",
                    slo.metric, slo.limit
                );
            }
        }
        for (i, slo) in limits.lower.iter().enumerate() {
            for (j, cell) in satisfied.lower[i].iter_mut().enumerate() {
                let value = insights.scalar_metric_value(j, &slo.metric);
                *cell = value.map(|v| v >= slo.limit).unwrap_or(false);
                debug!(
                    "lower SLO {} for version {j}: value {value:?}, limit {}, satisfied {cell}",
                    slo.metric, slo.limit
                );
            }
        }

        insights.slos_satisfied = Some(satisfied);
        info!(
            "assessed {} upper and {} lower SLOs over {num_versions} versions",
            limits.upper.len(),
            limits.lower.len()
        );
        Ok(())
    }
}
