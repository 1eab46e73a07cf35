//! Settings fingerprints and their persisted forms.
//!
//! A [`SettingsFingerprint`] is the part of [`ProjectSettings`] that changes
//! what a simulation produces. It is persisted in two places:
//!
//! * a per-node [`SettingsRecord`], written only after a successful run, which
//!   the staleness oracle compares against the current fingerprint;
//! * a project-wide settings stamp, whose modification time moves only when
//!   the fingerprint changes, so a timestamp-driven executor sees a settings
//!   change as an ordinary input change.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::project::ProjectSettings;

/// The settings that affect computation correctness.
///
/// Display-only settings (`name`, `blackout`) are not part of it. They end up
/// in the manifest but never invalidate a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFingerprint {
    pub interval: u64,
    pub chromosome: String,
    pub threshold: f64,
    pub distance_threshold: f64,
    pub timesteps: u64,
    pub bond_coeff: f64,
}

impl SettingsFingerprint {
    pub fn from_settings(settings: &ProjectSettings) -> Self {
        Self {
            interval: settings.interval,
            chromosome: settings.chromosome.clone(),
            threshold: settings.threshold,
            distance_threshold: settings.distance_threshold,
            timesteps: settings.timesteps,
            bond_coeff: settings.bond_coeff,
        }
    }

    pub fn digest(&self) -> Hash32 {
        let canonical = format!(
            "interval={}\0chromosome={}\0threshold={:?}\0distance_threshold={:?}\0timesteps={}\0bond_coeff={:?}",
            self.interval,
            self.chromosome,
            self.threshold,
            self.distance_threshold,
            self.timesteps,
            self.bond_coeff,
        );

        Hash32::hash(canonical)
    }

    pub(crate) fn to_json(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(io::Error::other)
    }
}

/// The fingerprint recorded by the last successful run of one node.
#[derive(Debug, Clone)]
pub struct SettingsRecord {
    path: Utf8PathBuf,
}

impl SettingsRecord {
    pub fn at(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Read the recorded fingerprint. A missing, unreadable or unparseable
    /// record is reported as `None`, the same as a node that never ran.
    pub fn load(&self) -> Option<SettingsFingerprint> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(path = %self.path, "unreadable settings record: {err}");
                }
                return None;
            }
        };

        serde_json::from_slice(&bytes)
            .inspect_err(|err| {
                tracing::debug!(path = %self.path, "discarding corrupt settings record: {err}")
            })
            .ok()
    }

    pub fn store(&self, fingerprint: &SettingsFingerprint) -> io::Result<()> {
        crate::utils::write_atomic(&self.path, &fingerprint.to_json()?)
    }

    /// Delete the record. Deleting an absent record succeeds.
    pub fn invalidate(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// Rewrite the settings stamp at `path` if its content differs from
/// `fingerprint`. Returns whether the stamp was (re)written.
pub fn refresh_stamp(path: &Utf8Path, fingerprint: &SettingsFingerprint) -> io::Result<bool> {
    let bytes = fingerprint.to_json()?;

    if fs::read(path).is_ok_and(|current| current == bytes) {
        return Ok(false);
    }

    crate::utils::write_atomic(path, &bytes)?;
    tracing::info!(%path, digest = %fingerprint.digest().short(), "settings stamp updated");

    Ok(true)
}
