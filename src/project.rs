//! The project specification: global settings, datasets and tracks.
//!
//! Defaults live on the typed structures themselves. A project file only has
//! to mention the keys it wants to change; every missing key falls back to
//! the value documented on [`ProjectSettings`], and unknown keys are ignored.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::{BuildConfig, PROJECT_FILES};
use crate::error::SpecError;

/// Global processing settings shared by every dataset of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    /// Display name of the project. Default `"Untitled"`.
    pub name: String,
    /// Resolution of the contact records in base pairs. Default `200000`.
    pub interval: u64,
    /// Chromosome selector passed to the simulation. Default `"X"`.
    #[serde(deserialize_with = "string_or_number")]
    pub chromosome: String,
    /// Minimum contact count for a record to become a bond. Default `2.0`.
    pub threshold: f64,
    /// Distance under which two simulated segments are in contact. Default `1.5`.
    pub distance_threshold: f64,
    /// Segments with no mapped data, copied into every structure entry.
    pub blackout: Vec<u32>,
    /// Number of simulation steps. Default `1000000`.
    pub timesteps: u64,
    /// Bond coefficient of the simulated polymer. Default `55.0`.
    pub bond_coeff: f64,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            name: "Untitled".to_string(),
            interval: 200_000,
            chromosome: "X".to_string(),
            threshold: 2.0,
            distance_threshold: 1.5,
            blackout: Vec::new(),
            timesteps: 1_000_000,
            bond_coeff: 55.0,
        }
    }
}

/// One raw input to be simulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    /// Path to the raw contact data, relative to the project directory.
    pub data: Utf8PathBuf,
}

/// Auxiliary per-position data shown alongside the structures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub data: Utf8PathBuf,
}

/// A fully resolved project specification.
///
/// Loaded once per build invocation and never mutated afterwards. The order
/// of `datasets` is the order of manifest ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProjectSpec {
    #[serde(default)]
    pub project: ProjectSettings,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

impl ProjectSpec {
    /// Find and parse the project file for `config`.
    pub fn load(config: &BuildConfig) -> Result<Self, SpecError> {
        let path = config.project_file()?;
        Self::load_file(&path)
    }

    pub fn load_file(path: &Utf8Path) -> Result<Self, SpecError> {
        let text = fs::read_to_string(path).map_err(|e| SpecError::Read(path.to_owned(), e))?;
        let spec = Self::parse(&text).map_err(|e| SpecError::Parse(path.to_owned(), e))?;
        spec.validate()?;

        tracing::debug!(
            %path,
            datasets = spec.datasets.len(),
            tracks = spec.tracks.len(),
            "loaded project specification"
        );

        Ok(spec)
    }

    /// Parse a project document. An empty document is a project with only
    /// default settings.
    pub fn parse(text: &str) -> Result<Self, serde_yaml_ng::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml_ng::from_str(text)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        let settings = &self.project;

        if settings.interval == 0 {
            return Err(SpecError::Invalid("interval", "must be positive".into()));
        }

        for (key, value) in [
            ("threshold", settings.threshold),
            ("distance_threshold", settings.distance_threshold),
            ("bond_coeff", settings.bond_coeff),
        ] {
            if !value.is_finite() {
                return Err(SpecError::Invalid(key, format!("{value} is not a finite number")));
            }
        }

        if let Some(dataset) = self.datasets.iter().find(|d| d.data.as_str().is_empty()) {
            return Err(SpecError::Invalid(
                "datasets",
                format!("dataset '{}' has no data path", dataset.name),
            ));
        }

        Ok(())
    }
}

/// Chromosome selectors are commonly written unquoted (`chromosome: 22`).
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Selector {
        Text(String),
        Integer(i64),
    }

    Ok(match Selector::deserialize(deserializer)? {
        Selector::Text(text) => text,
        Selector::Integer(number) => number.to_string(),
    })
}

const TEMPLATE: &str = r#"# Project specification for hicflow.
#
# Every key under `project` is optional; the values below are the defaults.
# Changing any of interval, chromosome, threshold, distance_threshold,
# timesteps or bond_coeff re-runs the simulation for every dataset.
project:
  name: Untitled
  interval: 200000
  chromosome: X
  threshold: 2.0
  distance_threshold: 1.5
  blackout: []
  timesteps: 1000000
  bond_coeff: 55

# Each dataset is simulated independently. Its position in this list is its
# id in the generated manifest.
datasets: []
#  - name: "00hr"
#    data: data/first.hic

tracks: []
#  - name: H3K27ac
#    data: data/tracks.csv
"#;

/// Create a new project directory with a documented project file and an
/// empty `data/` directory.
pub fn scaffold(dir: &Utf8Path) -> Result<Utf8PathBuf, SpecError> {
    let existing = PROJECT_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists());

    if let Some(file) = existing {
        return Err(SpecError::Exists(file));
    }

    let file = dir.join("project.yaml");

    fs::create_dir_all(dir.join("data")).map_err(|e| SpecError::Scaffold(dir.to_owned(), e))?;
    fs::write(&file, TEMPLATE).map_err(|e| SpecError::Scaffold(dir.to_owned(), e))?;

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_take_defaults() {
        let spec = ProjectSpec::parse(
            r#"
project:
  name: Sample
  timesteps: 500
datasets:
  - name: a
    data: a.hic
"#,
        )
        .unwrap();

        assert_eq!(spec.project.name, "Sample");
        assert_eq!(spec.project.timesteps, 500);
        assert_eq!(spec.project.interval, 200_000);
        assert_eq!(spec.project.bond_coeff, 55.0);
        assert_eq!(spec.datasets.len(), 1);
        assert!(spec.tracks.is_empty());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let spec = ProjectSpec::parse(
            r#"
project:
  colour: blue
  interval: 100000
viewer:
  zoom: 3
"#,
        )
        .unwrap();

        assert_eq!(spec.project.interval, 100_000);
    }

    #[test]
    fn test_numeric_chromosome() {
        let spec = ProjectSpec::parse("project:\n  chromosome: 22\n").unwrap();
        assert_eq!(spec.project.chromosome, "22");
    }

    #[test]
    fn test_empty_document() {
        let spec = ProjectSpec::parse("").unwrap();
        assert_eq!(spec, ProjectSpec::default());
    }

    #[test]
    fn test_malformed_settings() {
        assert!(ProjectSpec::parse("project:\n  interval: lots\n").is_err());

        let spec = ProjectSpec::parse("project:\n  interval: 0\n").unwrap();
        assert!(matches!(spec.validate(), Err(SpecError::Invalid("interval", _))));
    }

    #[test]
    fn test_template_parses_to_defaults() {
        let spec = ProjectSpec::parse(TEMPLATE).unwrap();
        assert_eq!(spec.project, ProjectSettings::default());
        assert!(spec.datasets.is_empty());
    }

    #[test]
    fn test_scaffold_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("proj");

        let file = scaffold(&root).unwrap();
        assert!(file.is_file());
        assert!(root.join("data").is_dir());

        assert!(matches!(scaffold(&root), Err(SpecError::Exists(_))));
    }
}
