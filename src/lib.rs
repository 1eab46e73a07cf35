#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
pub mod fingerprint;
pub mod graph;
pub mod manifest;
pub mod node;
pub mod pool;
pub mod populate;
pub mod project;
mod recovery;
pub mod simulator;
pub mod staleness;
pub mod task;
mod utils;
mod workflow;

pub use crate::core::{BuildConfig, Hash32, PROJECT_FILES};
pub use crate::error::*;
pub use crate::fingerprint::{SettingsFingerprint, SettingsRecord};
pub use crate::graph::{BuildGraph, BuildStatement, Callbacks, EdgeKind, GraphBuilder, Rule};
pub use crate::manifest::Manifest;
pub use crate::node::{ArtifactKind, Artifacts, BuildNode};
pub use crate::pool::{DEFAULT_CONCURRENCY, WorkerPool};
pub use crate::populate::{CatalogPopulator, CommandPopulator};
pub use crate::project::{Dataset, ProjectSettings, ProjectSpec, Track, scaffold};
pub use crate::recovery::RecordGuard;
pub use crate::simulator::{CommandSimulator, Simulator};
pub use crate::staleness::{Staleness, is_stale};
#[cfg(feature = "logging")]
pub use crate::utils::{LOG_ENV, init_logging};
pub use crate::workflow::{BuildReport, Plan, Workflow};
