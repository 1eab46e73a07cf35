//! The manifest handed to the structure browser.
//!
//! Every entry is keyed by a 0-based id equal to the position of its dataset
//! (or track) in the project specification. The contact map, structure and
//! dataset entries of one dataset share that id and reference each other by
//! it. All urls are relative to the output root, using `/` as separator, so
//! the output root can be moved or served as-is.

use std::fs;
use std::io::{self, BufRead, BufReader};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::BuildConfig;
use crate::error::AssemblyError;
use crate::node::{ArtifactKind, Artifacts};
use crate::project::ProjectSpec;

const FORMAT_VERSION: &str = "1.0";
const STRUCTURE_KIND: &str = "LAMMPS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub project: ProjectEntry,
    pub data: DataSection,
    pub datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub name: String,
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataSection {
    pub array: Vec<ArrayEntry>,
    #[serde(rename = "md-contact-map")]
    pub contact_maps: Vec<ContactMapEntry>,
    pub structure: Vec<StructureEntry>,
}

/// Per-position track data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayEntry {
    pub id: usize,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactMapEntry {
    pub id: usize,
    pub version: String,
    pub url: String,
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureKind {
    pub version: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureEntry {
    pub id: usize,
    #[serde(rename = "type")]
    pub kind: StructureKind,
    #[serde(rename = "md-contact-map")]
    pub contact_map: usize,
    pub unmapped_segments: Vec<u32>,
    pub num_segments: usize,
    pub url: String,
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureRef {
    pub id: usize,
    #[serde(rename = "md-contact-map")]
    pub contact_map: usize,
    pub input_set: String,
    pub output_set: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub id: usize,
    pub name: String,
    pub structure: StructureRef,
    pub epigenetics: usize,
}

/// Build the manifest from per-dataset results in dataset order.
///
/// `results[i]` must belong to `spec.datasets[i]`. `tracks[i]` is the staged
/// copy of `spec.tracks[i]`. Every path must lie under `root`. Reads the
/// structure artifacts to count segments, writes nothing.
pub fn assemble(
    spec: &ProjectSpec,
    results: &[Artifacts],
    tracks: &[Utf8PathBuf],
    root: &Utf8Path,
) -> Result<Manifest, AssemblyError> {
    if results.len() != spec.datasets.len() {
        return Err(AssemblyError::ResultCount {
            expected: spec.datasets.len(),
            actual: results.len(),
        });
    }

    let settings = &spec.project;
    let interval = settings.interval;
    let mut data = DataSection::default();
    let mut datasets = Vec::with_capacity(results.len());

    for (id, (dataset, artifacts)) in spec.datasets.iter().zip(results).enumerate() {
        let artifact = |kind: ArtifactKind| {
            artifacts
                .get(kind)
                .ok_or(AssemblyError::MissingArtifact(id, kind.name()))
        };

        let structure = artifact(ArtifactKind::Structure)?;

        data.contact_maps.push(ContactMapEntry {
            id,
            version: FORMAT_VERSION.into(),
            url: relative_url(artifact(ArtifactKind::ContactMap)?, root)?,
            interval,
        });

        data.structure.push(StructureEntry {
            id,
            kind: StructureKind {
                version: FORMAT_VERSION.into(),
                name: STRUCTURE_KIND.into(),
            },
            contact_map: id,
            unmapped_segments: settings.blackout.clone(),
            num_segments: count_segments(structure)?,
            url: relative_url(structure, root)?,
            interval,
        });

        datasets.push(DatasetEntry {
            id,
            name: dataset.name.clone(),
            structure: StructureRef {
                id,
                contact_map: id,
                input_set: relative_url(artifact(ArtifactKind::InputSet)?, root)?,
                output_set: relative_url(artifact(ArtifactKind::OutputSet)?, root)?,
            },
            epigenetics: id,
        });
    }

    for (id, track) in tracks.iter().enumerate() {
        data.array.push(ArrayEntry {
            id,
            url: relative_url(track, root)?,
        });
    }

    let manifest = Manifest {
        project: ProjectEntry {
            name: settings.name.clone(),
            interval,
        },
        data,
        datasets,
    };

    manifest.validate()?;
    Ok(manifest)
}

impl Manifest {
    /// Check that ids are contiguous from 0 in every section and that every
    /// cross-reference resolves within this manifest.
    pub fn validate(&self) -> Result<(), AssemblyError> {
        let data = &self.data;

        contiguous("array", data.array.iter().map(|e| e.id))?;
        contiguous("md-contact-map", data.contact_maps.iter().map(|e| e.id))?;
        contiguous("structure", data.structure.iter().map(|e| e.id))?;
        contiguous("datasets", self.datasets.iter().map(|e| e.id))?;

        let maps = data.contact_maps.len();
        let structures = data.structure.len();

        for entry in &data.structure {
            if entry.contact_map >= maps {
                return Err(AssemblyError::DanglingReference(
                    entry.id,
                    "md-contact-map",
                    entry.contact_map,
                ));
            }
        }

        for entry in &self.datasets {
            if entry.structure.id >= structures {
                return Err(AssemblyError::DanglingReference(
                    entry.id,
                    "structure",
                    entry.structure.id,
                ));
            }
            if entry.structure.contact_map >= maps {
                return Err(AssemblyError::DanglingReference(
                    entry.id,
                    "md-contact-map",
                    entry.structure.contact_map,
                ));
            }
        }

        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Write the manifest atomically. Equal manifests produce identical bytes.
    pub fn write_to(&self, path: &Utf8Path) -> io::Result<()> {
        let bytes = self.to_json().map_err(io::Error::other)?;
        crate::utils::write_atomic(path, &bytes)
    }

    pub fn read_from(path: &Utf8Path) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(io::Error::other)
    }

    /// Read the manifest of a previous build.
    pub fn load(config: &BuildConfig) -> io::Result<Self> {
        Self::read_from(&config.manifest_path())
    }
}

fn contiguous(
    section: &'static str,
    ids: impl Iterator<Item = usize>,
) -> Result<(), AssemblyError> {
    for (expected, id) in ids.enumerate() {
        if id != expected {
            return Err(AssemblyError::NonContiguous(section));
        }
    }

    Ok(())
}

/// Number of segments in a structure file: its line count minus the header.
pub fn count_segments(path: &Utf8Path) -> Result<usize, AssemblyError> {
    let file = fs::File::open(path).map_err(|e| AssemblyError::Measure(path.to_owned(), e))?;
    let mut lines = 0;

    for line in BufReader::new(file).split(b'\n') {
        line.map_err(|e| AssemblyError::Measure(path.to_owned(), e))?;
        lines += 1;
    }

    match lines {
        0 => Err(AssemblyError::EmptyStructure(path.to_owned())),
        n => Ok(n - 1),
    }
}

fn relative_url(path: &Utf8Path, root: &Utf8Path) -> Result<String, AssemblyError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| AssemblyError::OutsideRoot(path.to_owned(), root.to_owned()))?;

    Ok(relative
        .components()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join("/"))
}
