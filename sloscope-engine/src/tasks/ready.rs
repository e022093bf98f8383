//! The readiness task: block until a cluster resource is ready or a
//! deadline expires. The probe itself is a collaborator; this task owns the
//! polling loop and the timeout semantics (expiry is task failure).

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

use crate::context::RunContext;
use crate::error::EngineError;
use crate::experiment::Experiment;
use crate::tasks::{parse_duration, Task, TaskMeta};

/// Inputs to the readiness task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ReadyInputs {
    /// Kind of the resource to wait for, e.g. `deployment`
    #[validate(length(min = 1))]
    pub resource: String,

    /// Name of the resource
    #[validate(length(min = 1))]
    pub name: String,

    /// Namespace of the resource; the probe's default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// How long to wait before declaring failure, e.g. `60s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Waits for a cluster resource to exist and report ready.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyTask {
    /// Shared task metadata
    pub meta: TaskMeta,
    /// Task inputs
    pub inputs: ReadyInputs,
}

impl Task for ReadyTask {
    fn validate_inputs(&self) -> Result<(), EngineError> {
        self.inputs
            .validate()
            .map_err(|e| EngineError::Parse(format!("invalid ready task inputs: {e}")))?;
        if let Some(timeout) = &self.inputs.timeout {
            parse_duration(timeout)?;
        }
        Ok(())
    }

    fn initialize_defaults(&mut self) {}

    fn run(&self, _experiment: &mut Experiment, context: &RunContext) -> Result<(), EngineError> {
        let probe = context.readiness_probe()?;
        let timeout = match &self.inputs.timeout {
            Some(timeout) => parse_duration(timeout)?,
            None => parse_duration(&context.config().ready_timeout)?,
        };
        let poll_interval = Duration::from_millis(context.config().ready_poll_interval_ms);
        let deadline = Instant::now() + timeout;

        loop {
            let ready = probe.check(
                &self.inputs.resource,
                &self.inputs.name,
                self.inputs.namespace.as_deref(),
            )?;
            if ready {
                info!(
                    "{} {} is ready",
                    self.inputs.resource, self.inputs.name
                );
                return Ok(());
            }
            if Instant::now() + poll_interval > deadline {
                return Err(EngineError::Task(format!(
                    "{} {} did not become ready within {timeout:?}",
                    self.inputs.resource, self.inputs.name
                )));
            }
            debug!(
                "{} {} not ready yet; retrying",
                self.inputs.resource, self.inputs.name
            );
            thread::sleep(poll_interval);
        }
    }
}
