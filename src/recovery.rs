//! Keeps a failed or interrupted run from looking like a successful one.
//!
//! A [`RecordGuard`] deletes a node's settings record the moment it is armed
//! and again when it is dropped, unless the run explicitly disarms it after
//! every output has been written. A process killed mid-run therefore leaves
//! no record behind, and a run that returns an error or unwinds from a panic
//! removes any record it may already have stored. Partial outputs may remain
//! on disk, but without a record the staleness oracle never trusts them.

use std::io;

use crate::fingerprint::{SettingsFingerprint, SettingsRecord};

#[must_use = "dropping the guard immediately invalidates the record"]
pub struct RecordGuard<'a> {
    record: &'a SettingsRecord,
    armed: bool,
}

impl<'a> RecordGuard<'a> {
    /// Invalidate `record` and keep it invalid until [`RecordGuard::disarm`].
    pub fn arm(record: &'a SettingsRecord) -> io::Result<Self> {
        record.invalidate()?;

        Ok(Self {
            record,
            armed: true,
        })
    }

    /// Store the fingerprint. The record is still removed if the guard is
    /// dropped without being disarmed.
    pub fn persist(&self, fingerprint: &SettingsFingerprint) -> io::Result<()> {
        self.record.store(fingerprint)
    }

    /// Accept the record as the outcome of a completed run.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Err(err) = self.record.invalidate() {
            tracing::error!(
                path = %self.record.path(),
                "couldn't remove settings record after failed run: {err}"
            );
        }
    }
}
