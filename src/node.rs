use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::BuildConfig;
use crate::fingerprint::SettingsRecord;
use crate::project::Dataset;

/// The named artifacts a compute task leaves in its output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    Structure,
    ContactMap,
    Log,
    Settings,
    InputSet,
    OutputSet,
}

impl ArtifactKind {
    /// Artifacts produced by the simulation inside its workspace. The
    /// settings record is written by the task itself, after everything else.
    pub const PRODUCED: [ArtifactKind; 5] = [
        ArtifactKind::Structure,
        ArtifactKind::ContactMap,
        ArtifactKind::Log,
        ArtifactKind::InputSet,
        ArtifactKind::OutputSet,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Structure => "structure.csv",
            ArtifactKind::ContactMap => "contactmap.tsv",
            ArtifactKind::Log => "sim.log",
            ArtifactKind::Settings => "settings.json",
            ArtifactKind::InputSet => "contacts.in.tsv",
            ArtifactKind::OutputSet => "contacts.out.tsv",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArtifactKind::Structure => "structure",
            ArtifactKind::ContactMap => "contactmap",
            ArtifactKind::Log => "log",
            ArtifactKind::Settings => "settings",
            ArtifactKind::InputSet => "input_set",
            ArtifactKind::OutputSet => "output_set",
        }
    }
}

/// Artifact name to resolved path, for one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts(BTreeMap<ArtifactKind, Utf8PathBuf>);

impl Artifacts {
    pub fn insert(&mut self, kind: ArtifactKind, path: Utf8PathBuf) {
        self.0.insert(kind, path);
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&Utf8Path> {
        self.0.get(&kind).map(Utf8PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, &Utf8Path)> {
        self.0.iter().map(|(kind, path)| (*kind, path.as_path()))
    }
}

/// One unit of cacheable, schedulable work: a dataset's simulation.
///
/// The node owns `output_dir` exclusively for the duration of a build. Its
/// declared outputs are known up front; the same files are reported as
/// implicit outputs when the node is described to an external executor,
/// because only a completed run guarantees they exist.
#[derive(Debug, Clone)]
pub struct BuildNode {
    pub index: usize,
    pub name: String,
    pub input: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub outputs: Artifacts,
    /// Files that must exist before the simulation runs. Their timestamps
    /// never make the node stale.
    pub order_only: Vec<Utf8PathBuf>,
}

impl BuildNode {
    pub fn for_dataset(config: &BuildConfig, index: usize, dataset: &Dataset) -> Self {
        let output_dir = config.node_dir(index);
        let mut outputs = Artifacts::default();

        for kind in ArtifactKind::PRODUCED.into_iter().chain([ArtifactKind::Settings]) {
            outputs.insert(kind, output_dir.join(kind.file_name()));
        }

        Self {
            index,
            name: dataset.name.clone(),
            input: config.resolve_input(&dataset.data),
            output_dir,
            outputs,
            order_only: Vec::new(),
        }
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Utf8PathBuf {
        self.output_dir.join(kind.file_name())
    }

    pub fn record(&self) -> SettingsRecord {
        SettingsRecord::at(self.artifact(ArtifactKind::Settings))
    }

    pub fn implicit_outputs(&self) -> Vec<Utf8PathBuf> {
        self.outputs.iter().map(|(_, path)| path.to_owned()).collect()
    }
}
