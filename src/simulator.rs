use std::fs;
use std::process::{Command, Stdio};

use camino::Utf8Path;

use crate::error::ComputeError;
use crate::fingerprint::SettingsFingerprint;
use crate::node::ArtifactKind;

/// The external, non-idempotent computation behind every compute task.
///
/// An implementation reads `input`, runs inside `workspace` and must leave one
/// file per [`ArtifactKind::PRODUCED`] entry in the workspace, named after
/// [`ArtifactKind::file_name`]. It should write its log as early as possible
/// so a failed run can still be diagnosed.
pub trait Simulator: Send + Sync {
    fn simulate(
        &self,
        settings: &SettingsFingerprint,
        input: &Utf8Path,
        workspace: &Utf8Path,
    ) -> Result<(), ComputeError>;
}

/// Runs an external program once per dataset.
///
/// The program is invoked as
/// `PROGRAM [ARGS..] --chromosome C --interval N --threshold T
/// --distance-threshold D --timesteps S --bond-coeff B --output WORKSPACE INPUT`
/// with its working directory set to the workspace. Standard output and
/// standard error are appended to the log artifact.
#[derive(Debug, Clone)]
pub struct CommandSimulator {
    program: String,
    args: Vec<String>,
}

impl CommandSimulator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra leading argument passed before the generated ones.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn command(
        &self,
        settings: &SettingsFingerprint,
        input: &Utf8Path,
        workspace: &Utf8Path,
    ) -> Command {
        let mut command = Command::new(&self.program);

        command
            .args(&self.args)
            .arg("--chromosome")
            .arg(&settings.chromosome)
            .arg("--interval")
            .arg(settings.interval.to_string())
            .arg("--threshold")
            .arg(settings.threshold.to_string())
            .arg("--distance-threshold")
            .arg(settings.distance_threshold.to_string())
            .arg("--timesteps")
            .arg(settings.timesteps.to_string())
            .arg("--bond-coeff")
            .arg(settings.bond_coeff.to_string())
            .arg("--output")
            .arg(workspace)
            .arg(input)
            .current_dir(workspace)
            .stdin(Stdio::null());

        command
    }
}

impl Simulator for CommandSimulator {
    fn simulate(
        &self,
        settings: &SettingsFingerprint,
        input: &Utf8Path,
        workspace: &Utf8Path,
    ) -> Result<(), ComputeError> {
        let meta =
            fs::metadata(input).map_err(|e| ComputeError::Input(input.to_owned(), e.to_string()))?;

        if !meta.is_file() || meta.len() == 0 {
            return Err(ComputeError::Input(
                input.to_owned(),
                "not a non-empty file".to_string(),
            ));
        }

        let log_path = workspace.join(ArtifactKind::Log.file_name());
        let log = fs::File::options()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| ComputeError::Output(log_path.clone(), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| ComputeError::Output(log_path.clone(), e))?;

        tracing::debug!(program = %self.program, %input, %workspace, "launching simulator");

        let status = self
            .command(settings, input, workspace)
            .stdout(log)
            .stderr(log_err)
            .status()
            .map_err(|e| ComputeError::Launch(self.program.clone(), e))?;

        if !status.success() {
            return Err(ComputeError::Simulation(status.to_string()));
        }

        Ok(())
    }
}
