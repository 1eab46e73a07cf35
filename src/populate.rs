use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::PopulationError;

/// The downstream step that loads a finished manifest into a catalog.
pub trait CatalogPopulator: Send + Sync {
    /// Populate from the manifest found in `output_root`.
    fn populate(&self, output_root: &Utf8Path) -> Result<(), PopulationError>;
}

/// Runs `PROGRAM OUTPUT_ROOT [SERVER_DIR]` and reports its combined output
/// when it fails.
#[derive(Debug, Clone)]
pub struct CommandPopulator {
    program: String,
    server_dir: Option<Utf8PathBuf>,
}

impl CommandPopulator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            server_dir: None,
        }
    }

    pub fn with_server_dir(mut self, server_dir: impl Into<Utf8PathBuf>) -> Self {
        self.server_dir = Some(server_dir.into());
        self
    }
}

impl CatalogPopulator for CommandPopulator {
    fn populate(&self, output_root: &Utf8Path) -> Result<(), PopulationError> {
        let mut command = Command::new(&self.program);
        command.arg(output_root).stdin(Stdio::null());
        if let Some(server_dir) = &self.server_dir {
            command.arg(server_dir);
        }

        tracing::debug!(program = %self.program, %output_root, "populating catalog");

        let output = command
            .output()
            .map_err(|e| PopulationError::Launch(self.program.clone(), e))?;

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));

            return Err(PopulationError::Failed {
                status: output.status.to_string(),
                output: text,
            });
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_success() {
        let populator = CommandPopulator::new("true");
        populator.populate(Utf8Path::new("/tmp")).unwrap();
    }

    #[test]
    fn test_failure_reports_output() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let script = root.join("db_pop");
        std::fs::write(&script, "echo \"cannot open $1\" >&2\nexit 2\n").unwrap();

        // Runs `sh SCRIPT SERVER_DIR`, so the script sees the server dir as $1.
        let err = CommandPopulator::new("sh")
            .with_server_dir("/srv/catalog")
            .populate(&script)
            .unwrap_err();

        assert!(matches!(
            err,
            PopulationError::Failed { ref output, .. } if output.contains("cannot open /srv/catalog")
        ));
    }

    #[test]
    fn test_launch_error() {
        let err = CommandPopulator::new("/nonexistent/db_pop")
            .populate(Utf8Path::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, PopulationError::Launch(..)));
    }
}
