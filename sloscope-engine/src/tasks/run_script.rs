//! The inline-script task: run a shell command, fail on non-zero exit.

use std::process::Command;

use tracing::{debug, error};

use crate::context::RunContext;
use crate::error::EngineError;
use crate::experiment::Experiment;
use crate::tasks::{Task, TaskMeta};

/// Executes the `run` script of its metadata through `sh -c`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTask {
    /// Shared task metadata; `run` holds the script
    pub meta: TaskMeta,
}

impl Task for RunTask {
    fn validate_inputs(&self) -> Result<(), EngineError> {
        match self.meta.run.as_deref() {
            Some(script) if !script.trim().is_empty() => Ok(()),
            _ => Err(EngineError::Parse(
                "run task without a script to execute".to_string(),
            )),
        }
    }

    fn initialize_defaults(&mut self) {}

    fn run(&self, _experiment: &mut Experiment, _context: &RunContext) -> Result<(), EngineError> {
        let script = self.meta.run.as_deref().ok_or_else(|| {
            EngineError::Parse("run task without a script to execute".to_string())
        })?;
        debug!("running script: {script}");
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .output()
            .map_err(|e| EngineError::Task(format!("unable to launch script: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            debug!("script stdout: {stdout}");
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("script stderr: {stderr}");
            return Err(EngineError::Task(format!(
                "script exited with {}",
                output.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_task(script: &str) -> RunTask {
        RunTask {
            meta: TaskMeta {
                run: Some(script.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_run_succeeds() {
        let mut exp = Experiment::default();
        let context = RunContext::default();
        assert!(run_task("echo hello").run(&mut exp, &context).is_ok());
    }

    #[test]
    fn test_run_fails_on_non_zero_exit() {
        let mut exp = Experiment::default();
        let context = RunContext::default();
        let err = run_task("exit 3").run(&mut exp, &context).unwrap_err();
        assert!(matches!(err, EngineError::Task(_)));
    }

    #[test]
    fn test_validate_rejects_empty_script() {
        assert!(run_task("   ").validate_inputs().is_err());
    }
}
