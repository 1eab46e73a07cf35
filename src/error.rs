use std::fmt::{Display, Formatter};

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("Could not find project file. (Looked for '{0}' and '{1}')")]
    NotFound(Utf8PathBuf, Utf8PathBuf),

    #[error("Couldn't read project file '{0}'.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Malformed project file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, serde_yaml_ng::Error),

    #[error("Invalid setting '{0}': {1}")]
    Invalid(&'static str, String),

    #[error("Refusing to overwrite existing project file '{0}'")]
    Exists(Utf8PathBuf),

    #[error("Couldn't scaffold project in '{0}'.\n{1}")]
    Scaffold(Utf8PathBuf, std::io::Error),
}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Couldn't read input '{0}'.\n{1}")]
    Input(Utf8PathBuf, String),

    #[error("Couldn't launch simulator '{0}'.\n{1}")]
    Launch(String, std::io::Error),

    #[error("Simulation failed ({0})")]
    Simulation(String),

    #[error("Simulation did not produce expected artifact '{0}'")]
    MissingArtifact(Utf8PathBuf),

    #[error("Couldn't prepare temporary workspace.\n{0}")]
    Workspace(std::io::Error),

    #[error("Couldn't write output '{0}'.\n{1}")]
    Output(Utf8PathBuf, std::io::Error),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

/// Failure of a single compute task, together with whatever log artifact
/// could be salvaged from its workspace.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TaskFailure {
    #[source]
    pub error: ComputeError,
    pub log: Option<Utf8PathBuf>,
}

/// A task failure attributed to its dataset.
#[derive(Debug)]
pub struct DatasetFailure {
    pub index: usize,
    pub name: String,
    pub error: ComputeError,
    pub log: Option<Utf8PathBuf>,
}

impl Display for DatasetFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dataset {} '{}': {}", self.index, self.name, self.error)?;

        if let Some(log) = &self.log {
            write!(f, "\nA log may be available in {log}")?;
        }

        Ok(())
    }
}

impl std::error::Error for DatasetFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Every failure of one compute batch, in dataset order.
#[derive(Debug)]
pub struct ComputeFailure {
    pub failures: Vec<DatasetFailure>,
    /// Datasets that were queued but never started after the first failure.
    pub cancelled: Vec<usize>,
}

impl Display for ComputeFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for failure in &self.failures {
            writeln!(f, "{failure}")?;
        }

        if !self.cancelled.is_empty() {
            write!(f, "Datasets never started: {:?}", self.cancelled)?;
        }

        Ok(())
    }
}

impl std::error::Error for ComputeFailure {}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Expected {expected} dataset results, got {actual}")]
    ResultCount { expected: usize, actual: usize },

    #[error("Dataset {0} is missing its '{1}' artifact")]
    MissingArtifact(usize, &'static str),

    #[error("Couldn't measure structure '{0}'.\n{1}")]
    Measure(Utf8PathBuf, std::io::Error),

    #[error("Structure '{0}' has no header line")]
    EmptyStructure(Utf8PathBuf),

    #[error("Artifact '{0}' lies outside of the output root '{1}'")]
    OutsideRoot(Utf8PathBuf, Utf8PathBuf),

    #[error("Couldn't stage track '{0}'.\n{1}")]
    Track(Utf8PathBuf, std::io::Error),

    #[error("Ids in '{0}' are not contiguous from 0")]
    NonContiguous(&'static str),

    #[error("Entry {0} references missing {1} id {2}")]
    DanglingReference(usize, &'static str, usize),
}

#[derive(Debug, Error)]
pub enum PopulationError {
    #[error("Couldn't launch catalog populator '{0}'.\n{1}")]
    Launch(String, std::io::Error),

    #[error("Catalog populator exited with {status}:\n{output}")]
    Failed { status: String, output: String },

    #[error("Couldn't mark catalog as populated.\n{0}")]
    Marker(std::io::Error),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Unknown rule '{0}'")]
    UnknownRule(String),

    #[error("Output '{0}' is produced by more than one build statement")]
    DuplicateOutput(Utf8PathBuf),

    #[error("Cycle detected in build graph at '{0}'")]
    Cycle(String),

    #[error("Input '{0}' is missing and no statement produces it")]
    MissingInput(Utf8PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level error, tagged with the phase of the pipeline that failed.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Error while loading the project specification.\n{0}")]
    Specification(#[from] SpecError),

    #[error("Error while processing datasets.\n{0}")]
    Compute(#[from] ComputeFailure),

    #[error("Error while assembling the manifest.\n{0}")]
    Assembly(#[from] AssemblyError),

    #[error("Pipeline succeeded, but populating the catalog failed.\n{0}")]
    Population(#[from] PopulationError),

    #[error("Error while describing the build graph.\n{0}")]
    Graph(#[from] GraphError),

    #[error("Couldn't start worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Dataset index {0} is out of range ({1} datasets)")]
    NoSuchDataset(usize, usize),

    #[error("Couldn't write '{0}'.\n{1}")]
    Write(Utf8PathBuf, std::io::Error),
}
