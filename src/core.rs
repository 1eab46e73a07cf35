use camino::{Utf8Path, Utf8PathBuf};

use crate::error::SpecError;
use crate::pool::DEFAULT_CONCURRENCY;

/// File names searched, in order, for the project specification.
pub const PROJECT_FILES: [&str; 2] = ["workflow.yaml", "project.yaml"];

/// A 32-byte BLAKE3 hash.
///
/// Used to identify a settings fingerprint in logs and in the settings stamp
/// handed to the external build executor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// First 12 hex digits, enough to tell settings apart in a log line.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Immutable configuration of a single build invocation.
///
/// Constructed once (usually from the command line) and passed by reference
/// to every component. Nothing in the crate reads ambient global state for
/// paths or pool sizes; everything is derived from this value.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Directory holding the project file and the raw input data.
    pub project_dir: Utf8PathBuf,
    /// Root of all generated output. Manifest urls are relative to it.
    pub output_root: Utf8PathBuf,
    /// Number of compute tasks allowed to run at the same time.
    pub concurrency: usize,
}

impl BuildConfig {
    /// Configuration with the default output root `<project>/.build`.
    pub fn new(project_dir: impl Into<Utf8PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let output_root = project_dir.join(".build");

        Self {
            project_dir,
            output_root,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_output_root(mut self, output_root: impl Into<Utf8PathBuf>) -> Self {
        self.output_root = output_root.into();
        self
    }

    /// Sets the pool size. Zero is clamped to one worker.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Locate the project file, preferring `workflow.yaml` over `project.yaml`.
    pub fn project_file(&self) -> Result<Utf8PathBuf, SpecError> {
        let search = PROJECT_FILES.map(|name| self.project_dir.join(name));

        search
            .iter()
            .find(|path| path.is_file())
            .cloned()
            .ok_or_else(|| SpecError::NotFound(search[0].clone(), search[1].clone()))
    }

    /// Resolve a path from the project file against the project directory.
    pub fn resolve_input(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.project_dir.join(path)
    }

    /// Output directory owned by the compute task of dataset `index`.
    pub fn node_dir(&self, index: usize) -> Utf8PathBuf {
        self.output_root.join(format!("lammps_{index}"))
    }

    pub fn track_dir(&self, index: usize) -> Utf8PathBuf {
        self.output_root.join("tracks").join(index.to_string())
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.output_root.join("project.json")
    }

    pub fn stamp_path(&self) -> Utf8PathBuf {
        self.output_root.join("settings.stamp")
    }

    pub fn ninja_path(&self) -> Utf8PathBuf {
        self.output_root.join("build.ninja")
    }

    /// Marker touched after the catalog has been populated.
    pub fn populated_marker(&self) -> Utf8PathBuf {
        self.output_root.join("generated")
    }
}
