//! The persistence driver contract.
//!
//! A driver owns the artifact layout and versioning; the engine reads the
//! experiment through it at run start and writes a snapshot after the loop
//! increment and after every counted task. The engine never constructs
//! concrete drivers.

use std::sync::Mutex;

use crate::error::EngineError;
use crate::experiment::Experiment;

/// Reads and writes the experiment artifact.
pub trait Driver {
    /// Read the experiment.
    fn read(&self) -> Result<Experiment, EngineError>;

    /// Write a snapshot of the experiment.
    fn write(&self, experiment: &Experiment) -> Result<(), EngineError>;

    /// The revision stamped into freshly initialized results.
    fn revision(&self) -> i64;
}

/// In-memory driver that records every write.
///
/// Embeddings and test suites use this to assert on the exact sequence of
/// snapshots the engine persisted.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    experiment: Experiment,
    revision: i64,
    writes: Mutex<Vec<Experiment>>,
}

impl RecordingDriver {
    /// Create a driver that serves the given experiment, at revision 1.
    pub fn new(experiment: Experiment) -> Self {
        Self {
            experiment,
            revision: 1,
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Override the revision reported by this driver.
    pub fn with_revision(mut self, revision: i64) -> Self {
        self.revision = revision;
        self
    }

    /// All snapshots written so far, in order.
    pub fn writes(&self) -> Vec<Experiment> {
        self.writes.lock().expect("writes lock poisoned").clone()
    }

    /// The most recent snapshot, if any.
    pub fn last_write(&self) -> Option<Experiment> {
        self.writes.lock().expect("writes lock poisoned").last().cloned()
    }
}

impl Driver for RecordingDriver {
    fn read(&self) -> Result<Experiment, EngineError> {
        Ok(self.experiment.clone())
    }

    fn write(&self, experiment: &Experiment) -> Result<(), EngineError> {
        self.writes
            .lock()
            .map_err(|_| EngineError::Driver("writes lock poisoned".to_string()))?
            .push(experiment.clone());
        Ok(())
    }

    fn revision(&self) -> i64 {
        self.revision
    }
}
