//! Filesystem persistence for sloscope experiments.
//!
//! The conventional local layout splits the artifact into `experiment.yaml`
//! (the spec, optionally with a prior result) and `result.yaml` (the result
//! snapshot the engine writes after every task). Input files may be YAML or
//! JSON; output is canonical YAML.

pub mod file;

pub use file::{FileDriver, EXPERIMENT_SPEC_FILE, EXPERIMENT_RESULT_FILE};
