//! The pipeline of one project: plan, compute, assemble, populate.
//!
//! A [`Workflow`] can drive the pipeline itself through the worker pool, or
//! describe it as a [`BuildGraph`] for an external executor that then calls
//! back into the single-step operations ([`Workflow::compute`],
//! [`Workflow::assemble`], [`Workflow::populate`]).

use std::fs;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::BuildConfig;
use crate::error::{
    AssemblyError, ComputeError, ComputeFailure, DatasetFailure, PopulationError, TaskFailure,
    WorkflowError,
};
use crate::fingerprint::{SettingsFingerprint, refresh_stamp};
use crate::graph::{BuildGraph, Callbacks};
use crate::manifest;
use crate::node::{Artifacts, BuildNode};
use crate::pool::{BatchFailure, JobError, WorkerPool};
use crate::populate::CatalogPopulator;
use crate::project::ProjectSpec;
use crate::simulator::Simulator;
use crate::staleness::{self, Staleness};
use crate::task;
use crate::utils::{as_overhead, copy_if_newer, write_atomic};

/// Which nodes need to run, decided before anything is dispatched.
#[derive(Debug)]
pub struct Plan {
    pub stale: Vec<(BuildNode, Staleness)>,
    pub fresh: Vec<BuildNode>,
}

/// What a completed build did.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    /// Datasets whose simulation ran, in dataset order.
    pub dispatched: Vec<usize>,
    /// Datasets whose cached output was reused.
    pub fresh: Vec<usize>,
    pub manifest: Utf8PathBuf,
    /// Whether the catalog was populated.
    pub populated: bool,
}

pub struct Workflow {
    config: BuildConfig,
    project_file: Utf8PathBuf,
    spec: ProjectSpec,
    fingerprint: SettingsFingerprint,
    simulator: Box<dyn Simulator>,
    populator: Option<Box<dyn CatalogPopulator>>,
}

impl Workflow {
    /// Load the project described by `config`. Fails before any work is
    /// dispatched if the project file is missing or malformed.
    pub fn load(
        config: BuildConfig,
        simulator: impl Simulator + 'static,
    ) -> Result<Self, WorkflowError> {
        let project_file = config.project_file()?;
        let spec = ProjectSpec::load_file(&project_file)?;
        let fingerprint = SettingsFingerprint::from_settings(&spec.project);

        Ok(Self {
            config,
            project_file,
            spec,
            fingerprint,
            simulator: Box::new(simulator),
            populator: None,
        })
    }

    pub fn with_populator(mut self, populator: impl CatalogPopulator + 'static) -> Self {
        self.populator = Some(Box::new(populator));
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn spec(&self) -> &ProjectSpec {
        &self.spec
    }

    pub fn fingerprint(&self) -> &SettingsFingerprint {
        &self.fingerprint
    }

    pub fn nodes(&self) -> Vec<BuildNode> {
        self.spec
            .datasets
            .iter()
            .enumerate()
            .map(|(i, dataset)| BuildNode::for_dataset(&self.config, i, dataset))
            .collect()
    }

    /// Ask the staleness oracle about every node.
    pub fn plan(&self) -> Plan {
        let mut plan = Plan {
            stale: Vec::new(),
            fresh: Vec::new(),
        };

        for node in self.nodes() {
            match staleness::check(&node, &self.fingerprint) {
                Staleness::Fresh => {
                    tracing::info!(dataset = node.index, name = %node.name, "up to date, skipping");
                    plan.fresh.push(node);
                }
                reason => {
                    tracing::info!(dataset = node.index, name = %node.name, %reason, "stale");
                    plan.stale.push((node, reason));
                }
            }
        }

        plan
    }

    /// Run the whole pipeline incrementally.
    ///
    /// Stale nodes run in the worker pool. If any of them fails, nothing is
    /// assembled and the error lists every failed dataset. The catalog is
    /// populated only when a populator is configured.
    pub fn build(&self) -> Result<BuildReport, WorkflowError> {
        let started = Instant::now();
        self.prepare()?;

        let plan = self.plan();
        let dispatched: Vec<usize> = plan.stale.iter().map(|(node, _)| node.index).collect();
        let fresh: Vec<usize> = plan.fresh.iter().map(|node| node.index).collect();

        let mut results: Vec<Artifacts> = self.nodes().into_iter().map(|n| n.outputs).collect();

        if !plan.stale.is_empty() {
            let nodes: Vec<BuildNode> = plan.stale.into_iter().map(|(node, _)| node).collect();

            let computed = self.execute(&nodes)?;
            for (node, artifacts) in nodes.iter().zip(computed) {
                results[node.index] = artifacts;
            }
        }

        let manifest = self.write_manifest(&results)?;
        let populated = self.populate()?;

        tracing::info!(
            dispatched = dispatched.len(),
            fresh = fresh.len(),
            "build finished {}",
            as_overhead(started)
        );

        Ok(BuildReport {
            dispatched,
            fresh,
            manifest,
            populated,
        })
    }

    /// Run the simulation of dataset `index` unconditionally.
    pub fn compute(&self, index: usize) -> Result<Artifacts, WorkflowError> {
        let node = self
            .nodes()
            .into_iter()
            .nth(index)
            .ok_or(WorkflowError::NoSuchDataset(index, self.spec.datasets.len()))?;

        self.prepare()?;

        task::run(&self.fingerprint, &node, self.simulator.as_ref()).map_err(|failure| {
            ComputeFailure {
                failures: vec![dataset_failure(&node, failure)],
                cancelled: Vec::new(),
            }
            .into()
        })
    }

    /// Assemble the manifest from the outputs already on disk.
    pub fn assemble(&self) -> Result<Utf8PathBuf, WorkflowError> {
        let results: Vec<Artifacts> = self.nodes().into_iter().map(|n| n.outputs).collect();
        self.write_manifest(&results)
    }

    /// Hand the manifest to the catalog populator, if there is one, and mark
    /// the catalog as populated.
    pub fn populate(&self) -> Result<bool, WorkflowError> {
        let Some(populator) = &self.populator else {
            return Ok(false);
        };

        populator.populate(&self.config.output_root)?;
        write_atomic(&self.config.populated_marker(), b"").map_err(PopulationError::Marker)?;

        tracing::info!(root = %self.config.output_root, "catalog populated");
        Ok(true)
    }

    /// Bring the settings stamp up to date. Returns whether it was rewritten.
    pub fn stamp(&self) -> Result<bool, WorkflowError> {
        let root = &self.config.output_root;
        fs::create_dir_all(root).map_err(|e| WorkflowError::Write(root.clone(), e))?;

        let stamp = self.config.stamp_path();
        refresh_stamp(&stamp, &self.fingerprint).map_err(|e| WorkflowError::Write(stamp, e))
    }

    /// Describe the pipeline for an external executor and write it as
    /// `build.ninja` in the output root.
    ///
    /// `invocation` is the command line rules use to call back into this
    /// program. The catalog step is described only when a populator is
    /// configured.
    pub fn configure(
        &self,
        invocation: &str,
        version_marker: Option<&Utf8Path>,
    ) -> Result<Utf8PathBuf, WorkflowError> {
        self.prepare()?;

        let mut callbacks = Callbacks::new(invocation);
        if self.populator.is_some() {
            callbacks = callbacks.with_populate(version_marker);
        } else if let Some(marker) = version_marker {
            tracing::warn!(%marker, "no catalog populator configured, ignoring version marker");
        }

        let graph =
            BuildGraph::for_project(&self.config, &self.project_file, &self.spec, callbacks)?;

        let path = self.config.ninja_path();
        write_atomic(&path, graph.to_ninja().as_bytes())
            .map_err(|e| WorkflowError::Write(path.clone(), e))?;

        tracing::info!(%path, statements = graph.statements().len(), "wrote build description");
        Ok(path)
    }

    /// Create the output root and bring the settings stamp up to date.
    fn prepare(&self) -> Result<(), WorkflowError> {
        self.stamp().map(|_| ())
    }

    fn execute(&self, nodes: &[BuildNode]) -> Result<Vec<Artifacts>, WorkflowError> {
        let pool = WorkerPool::new(self.config.concurrency)?;

        tracing::info!(
            tasks = nodes.len(),
            workers = pool.size(),
            settings = %self.fingerprint.digest().short(),
            "dispatching simulations"
        );

        pool.execute(
            nodes,
            |node| node.name.clone(),
            |node| task::run(&self.fingerprint, node, self.simulator.as_ref()),
        )
        .map_err(|failure| compute_failure(nodes, failure).into())
    }

    fn write_manifest(&self, results: &[Artifacts]) -> Result<Utf8PathBuf, WorkflowError> {
        let tracks = self.stage_tracks()?;
        let manifest = manifest::assemble(&self.spec, results, &tracks, &self.config.output_root)?;

        let path = self.config.manifest_path();
        manifest
            .write_to(&path)
            .map_err(|e| WorkflowError::Write(path.clone(), e))?;

        tracing::info!(%path, datasets = manifest.datasets.len(), "wrote manifest");
        Ok(path)
    }

    /// Copy track data under the output root so the manifest can refer to it
    /// with relative urls.
    fn stage_tracks(&self) -> Result<Vec<Utf8PathBuf>, AssemblyError> {
        let mut staged = Vec::with_capacity(self.spec.tracks.len());

        for (i, track) in self.spec.tracks.iter().enumerate() {
            let source = self.config.resolve_input(&track.data);
            let name = source.file_name().unwrap_or("data");
            let target = self.config.track_dir(i).join(name);

            let copied = copy_if_newer(&source, &target)
                .map_err(|e| AssemblyError::Track(source.clone(), e))?;
            if copied {
                tracing::debug!(track = %track.name, %target, "staged track");
            }

            staged.push(target);
        }

        Ok(staged)
    }
}

fn dataset_failure(node: &BuildNode, failure: TaskFailure) -> DatasetFailure {
    DatasetFailure {
        index: node.index,
        name: node.name.clone(),
        error: failure.error,
        log: failure.log,
    }
}

/// Attribute pool failures, reported by submission position, to datasets.
fn compute_failure(nodes: &[BuildNode], batch: BatchFailure<TaskFailure>) -> ComputeFailure {
    let failures = batch
        .failures
        .into_iter()
        .map(|(position, error)| {
            let node = &nodes[position];
            match error {
                JobError::Failed(failure) => dataset_failure(node, failure),
                JobError::Panicked(message) => DatasetFailure {
                    index: node.index,
                    name: node.name.clone(),
                    error: ComputeError::Panicked(message),
                    log: None,
                },
            }
        })
        .collect();

    let cancelled = batch
        .cancelled
        .into_iter()
        .map(|position| nodes[position].index)
        .collect();

    ComputeFailure {
        failures,
        cancelled,
    }
}
