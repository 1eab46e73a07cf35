//! A single compute task: one simulation for one node.
//!
//! The task runs the simulator in a scoped temporary workspace, copies the
//! produced artifacts into the node's output directory and only then records
//! the settings it ran with and refreshes the directory's modification time.
//! The workspace is removed on every exit path, including unwinding.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ComputeError, TaskFailure};
use crate::fingerprint::SettingsFingerprint;
use crate::node::{ArtifactKind, Artifacts, BuildNode};
use crate::recovery::RecordGuard;
use crate::simulator::Simulator;
use crate::utils::touch;

pub type ComputeResult = Result<Artifacts, TaskFailure>;

/// Run the simulation for `node` unconditionally. Callers decide staleness.
pub fn run(
    settings: &SettingsFingerprint,
    node: &BuildNode,
    simulator: &dyn Simulator,
) -> ComputeResult {
    let record = node.record();
    let guard = RecordGuard::arm(&record)
        .map_err(|e| failure(ComputeError::Output(record.path().to_owned(), e)))?;

    fs::create_dir_all(&node.output_dir)
        .map_err(|e| failure(ComputeError::Output(node.output_dir.clone(), e)))?;

    let workspace = tempfile::Builder::new()
        .prefix("hicflow-")
        .tempdir()
        .map_err(|e| failure(ComputeError::Workspace(e)))?;
    let path = Utf8Path::from_path(workspace.path()).ok_or_else(|| {
        failure(ComputeError::Workspace(std::io::Error::other(
            "temporary directory path is not valid UTF-8",
        )))
    })?;

    tracing::debug!(dataset = node.index, workspace = %path, "running simulation");

    let outcome = simulator
        .simulate(settings, &node.input, path)
        .and_then(|()| collect(path, node));

    let artifacts = match outcome {
        Ok(artifacts) => artifacts,
        Err(error) => {
            let log = salvage_log(path, node);
            return Err(TaskFailure { error, log });
        }
    };

    // The log is already in the output directory from here on.
    let log = artifacts.get(ArtifactKind::Log).map(Utf8Path::to_owned);
    let finalize = |error: ComputeError| TaskFailure {
        error,
        log: log.clone(),
    };

    guard
        .persist(settings)
        .map_err(|e| finalize(ComputeError::Output(record.path().to_owned(), e)))?;
    touch(&node.output_dir)
        .map_err(|e| finalize(ComputeError::Output(node.output_dir.clone(), e)))?;
    guard.disarm();

    Ok(artifacts)
}

fn failure(error: ComputeError) -> TaskFailure {
    TaskFailure { error, log: None }
}

/// Copy every produced artifact out of the workspace.
fn collect(workspace: &Utf8Path, node: &BuildNode) -> Result<Artifacts, ComputeError> {
    let mut artifacts = Artifacts::default();

    for kind in ArtifactKind::PRODUCED {
        let source = workspace.join(kind.file_name());
        if !source.is_file() {
            return Err(ComputeError::MissingArtifact(source));
        }

        let target = node.artifact(kind);
        fs::copy(&source, &target).map_err(|e| ComputeError::Output(target.clone(), e))?;
        artifacts.insert(kind, target);
    }

    artifacts.insert(ArtifactKind::Settings, node.artifact(ArtifactKind::Settings));
    Ok(artifacts)
}

/// Best effort: keep whatever log the failed run produced.
fn salvage_log(workspace: &Utf8Path, node: &BuildNode) -> Option<Utf8PathBuf> {
    let source = workspace.join(ArtifactKind::Log.file_name());
    let target = node.artifact(ArtifactKind::Log);

    match fs::copy(&source, &target) {
        Ok(_) => Some(target),
        Err(err) => {
            tracing::debug!(dataset = node.index, "no log to salvage: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BuildConfig;
    use crate::project::{Dataset, ProjectSettings};
    use crate::staleness;
    use std::sync::Mutex;

    /// Writes every artifact, or fails after writing only the log.
    struct Scripted {
        fail: bool,
        workspaces: Mutex<Vec<Utf8PathBuf>>,
    }

    impl Scripted {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                workspaces: Mutex::new(Vec::new()),
            }
        }
    }

    impl Simulator for Scripted {
        fn simulate(
            &self,
            _: &SettingsFingerprint,
            _: &Utf8Path,
            workspace: &Utf8Path,
        ) -> Result<(), ComputeError> {
            self.workspaces.lock().unwrap().push(workspace.to_owned());
            fs::write(workspace.join("sim.log"), "step 1\n").unwrap();

            if self.fail {
                return Err(ComputeError::Simulation("exit status: 1".into()));
            }

            for kind in ArtifactKind::PRODUCED {
                fs::write(workspace.join(kind.file_name()), "x\n").unwrap();
            }

            Ok(())
        }
    }

    fn setup() -> (tempfile::TempDir, BuildNode, SettingsFingerprint) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("a.hic"), "contacts").unwrap();

        let config = BuildConfig::new(root);
        let dataset = Dataset {
            name: "a".into(),
            data: "a.hic".into(),
        };
        let node = BuildNode::for_dataset(&config, 0, &dataset);
        let settings = SettingsFingerprint::from_settings(&ProjectSettings::default());

        (dir, node, settings)
    }

    #[test]
    fn test_success_records_settings() {
        let (_dir, node, settings) = setup();
        let simulator = Scripted::new(false);

        let artifacts = run(&settings, &node, &simulator).unwrap();

        assert_eq!(artifacts, node.outputs);
        for (_, path) in artifacts.iter() {
            assert!(path.is_file(), "{path} missing");
        }
        assert_eq!(node.record().load(), Some(settings.clone()));
        assert!(!staleness::is_stale(&node, &settings));
    }

    #[test]
    fn test_workspace_removed() {
        let (_dir, node, settings) = setup();

        let simulator = Scripted::new(false);
        run(&settings, &node, &simulator).unwrap();

        let simulator_failing = Scripted::new(true);
        run(&settings, &node, &simulator_failing).unwrap_err();

        let used = simulator
            .workspaces
            .lock()
            .unwrap()
            .iter()
            .chain(simulator_failing.workspaces.lock().unwrap().iter())
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(used.len(), 2);
        assert!(used.iter().all(|ws| !ws.exists()));
    }

    #[test]
    fn test_failure_salvages_log_and_drops_record() {
        let (_dir, node, settings) = setup();

        run(&settings, &node, &Scripted::new(false)).unwrap();
        assert!(node.record().load().is_some());

        let failure = run(&settings, &node, &Scripted::new(true)).unwrap_err();

        assert!(matches!(failure.error, ComputeError::Simulation(_)));
        assert_eq!(failure.log, Some(node.artifact(ArtifactKind::Log)));
        assert_eq!(node.record().load(), None);
        assert!(staleness::is_stale(&node, &settings));
    }

    #[test]
    fn test_record_failure_reports_copied_log() {
        /// Leaves a directory where the settings record has to go.
        struct Obstructed(Utf8PathBuf);

        impl Simulator for Obstructed {
            fn simulate(
                &self,
                _: &SettingsFingerprint,
                _: &Utf8Path,
                workspace: &Utf8Path,
            ) -> Result<(), ComputeError> {
                for kind in ArtifactKind::PRODUCED {
                    fs::write(workspace.join(kind.file_name()), "x\n").unwrap();
                }
                fs::create_dir_all(&self.0).unwrap();
                Ok(())
            }
        }

        let (_dir, node, settings) = setup();
        let simulator = Obstructed(node.artifact(ArtifactKind::Settings));

        let failure = run(&settings, &node, &simulator).unwrap_err();

        assert!(matches!(failure.error, ComputeError::Output(_, _)));
        assert_eq!(failure.log, Some(node.artifact(ArtifactKind::Log)));
        assert!(node.artifact(ArtifactKind::Log).is_file());
        assert!(staleness::is_stale(&node, &settings));
    }

    #[test]
    fn test_missing_artifact_is_compute_error() {
        struct LogOnly;

        impl Simulator for LogOnly {
            fn simulate(
                &self,
                _: &SettingsFingerprint,
                _: &Utf8Path,
                workspace: &Utf8Path,
            ) -> Result<(), ComputeError> {
                fs::write(workspace.join("sim.log"), "done\n").unwrap();
                Ok(())
            }
        }

        let (_dir, node, settings) = setup();
        let failure = run(&settings, &node, &LogOnly).unwrap_err();

        assert!(matches!(failure.error, ComputeError::MissingArtifact(_)));
        assert!(failure.log.is_some());
        assert_eq!(node.record().load(), None);
    }
}
