//! The file-backed driver.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use sloscope_engine::tasks::ExperimentSpec;
use sloscope_engine::{Driver, EngineError, Experiment, ExperimentResult};

/// Conventional file holding the experiment spec.
pub const EXPERIMENT_SPEC_FILE: &str = "experiment.yaml";
/// Conventional file holding the result snapshot.
pub const EXPERIMENT_RESULT_FILE: &str = "result.yaml";

/// Driver that persists the experiment in a local directory.
///
/// `experiment.yaml` is read at run start and may contain either a full
/// artifact (`spec` plus optional `result`) or a bare task list. When
/// `result.yaml` exists its result overrides whatever the spec file carried,
/// so an interrupted run resumes from the last persisted snapshot. Writes go
/// to `result.yaml` through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileDriver {
    dir: PathBuf,
    revision: i64,
}

impl FileDriver {
    /// Create a driver rooted at the given directory, at revision 1.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            revision: 1,
        }
    }

    /// Override the revision reported by this driver.
    pub fn with_revision(mut self, revision: i64) -> Self {
        self.revision = revision;
        self
    }

    /// Path of the spec file.
    pub fn spec_path(&self) -> PathBuf {
        self.dir.join(EXPERIMENT_SPEC_FILE)
    }

    /// Path of the result file.
    pub fn result_path(&self) -> PathBuf {
        self.dir.join(EXPERIMENT_RESULT_FILE)
    }
}

impl Driver for FileDriver {
    fn read(&self) -> Result<Experiment, EngineError> {
        let spec_path = self.spec_path();
        let raw = fs::read_to_string(&spec_path).map_err(|e| {
            EngineError::Driver(format!("unable to read {}: {e}", spec_path.display()))
        })?;
        let mut experiment = parse_experiment(&raw)?;

        let result_path = self.result_path();
        if result_path.exists() {
            debug!("overlaying result from {}", result_path.display());
            let raw = fs::read_to_string(&result_path).map_err(|e| {
                EngineError::Driver(format!("unable to read {}: {e}", result_path.display()))
            })?;
            let result: ExperimentResult = serde_yaml::from_str(&raw).map_err(|e| {
                EngineError::Driver(format!("unable to parse {}: {e}", result_path.display()))
            })?;
            experiment.result = Some(result);
        }
        Ok(experiment)
    }

    fn write(&self, experiment: &Experiment) -> Result<(), EngineError> {
        let result = experiment.result.as_ref().ok_or_else(|| {
            EngineError::Driver("experiment without a result section cannot be persisted".to_string())
        })?;
        let rendered = serde_yaml::to_string(result)
            .map_err(|e| EngineError::Driver(format!("unable to render result: {e}")))?;
        atomic_write(&self.result_path(), rendered.as_bytes())
    }

    fn revision(&self) -> i64 {
        self.revision
    }
}

// The spec file usually holds a full artifact; a bare task list is accepted
// for hand-written specs.
fn parse_experiment(raw: &str) -> Result<Experiment, EngineError> {
    match serde_yaml::from_str::<Experiment>(raw) {
        Ok(experiment) => Ok(experiment),
        Err(artifact_err) => match serde_yaml::from_str::<ExperimentSpec>(raw) {
            Ok(spec) => {
                warn!("spec file holds a bare task list; treating it as the experiment spec");
                Ok(Experiment { spec, result: None })
            }
            Err(_) => Err(EngineError::Driver(format!(
                "unable to parse experiment: {artifact_err}"
            ))),
        },
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| EngineError::Driver(format!("unable to create {}: {e}", parent.display())))?;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = path.with_file_name(format!(".{name}.tmp.{}", std::process::id()));

    let mut file = fs::File::create(&tmp)
        .map_err(|e| EngineError::Driver(format!("unable to create {}: {e}", tmp.display())))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| EngineError::Driver(format!("unable to write {}: {e}", tmp.display())))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        EngineError::Driver(format!("unable to replace {}: {e}", path.display()))
    })?;
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
