//! Decides whether a node's cached output can be trusted.
//!
//! A node is stale when its output directory is missing, when its settings
//! record does not match the current fingerprint, or when its input is
//! strictly newer than its output directory. A settings mismatch makes a node
//! stale even if the input is older than the output. Anything that prevents
//! the check from completing counts as stale.

use std::fmt::{Display, Formatter};
use std::io;

use crate::fingerprint::SettingsFingerprint;
use crate::node::BuildNode;
use crate::utils::modified;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// Cached output is valid.
    Fresh,
    /// The output directory does not exist.
    MissingOutput,
    /// No valid settings record: never run, failed, or invalidated.
    NoRecord,
    /// The record holds a different fingerprint.
    SettingsChanged,
    /// The input was modified after the output directory.
    InputNewer,
    /// Filesystem metadata could not be read.
    Unknown(String),
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}

impl Display for Staleness {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Staleness::Fresh => write!(f, "up to date"),
            Staleness::MissingOutput => write!(f, "no previous output"),
            Staleness::NoRecord => write!(f, "no valid settings record"),
            Staleness::SettingsChanged => write!(f, "settings changed"),
            Staleness::InputNewer => write!(f, "input modified"),
            Staleness::Unknown(reason) => write!(f, "could not check ({reason})"),
        }
    }
}

/// Classify `node` against the `current` fingerprint. Reads metadata and the
/// settings record, writes nothing.
pub fn check(node: &BuildNode, current: &SettingsFingerprint) -> Staleness {
    inspect(node, current).unwrap_or_else(|err| Staleness::Unknown(err.to_string()))
}

pub fn is_stale(node: &BuildNode, current: &SettingsFingerprint) -> bool {
    check(node, current).is_stale()
}

fn inspect(node: &BuildNode, current: &SettingsFingerprint) -> io::Result<Staleness> {
    if !node.output_dir.is_dir() {
        return Ok(Staleness::MissingOutput);
    }

    match node.record().load() {
        None => return Ok(Staleness::NoRecord),
        Some(recorded) if recorded != *current => return Ok(Staleness::SettingsChanged),
        Some(_) => {}
    }

    if modified(&node.input)? > modified(&node.output_dir)? {
        return Ok(Staleness::InputNewer);
    }

    Ok(Staleness::Fresh)
}
