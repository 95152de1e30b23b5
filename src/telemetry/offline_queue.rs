//! Persisted backlog of records that could not be delivered.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{TrackerError, TrackerResult};
use crate::telemetry::record::TelemetryRecord;

/// Ordered backlog mirrored to a JSON array file after every mutation.
#[derive(Debug)]
pub struct OfflineQueue {
    path: PathBuf,
    records: Vec<TelemetryRecord>,
}

fn persistence_error(path: &Path, action: &str, err: impl std::fmt::Display) -> TrackerError {
    TrackerError::PersistenceError(format!("{} {}: {}", action, path.display(), err))
}

impl OfflineQueue {
    /// An in-memory queue bound to `path` without touching the disk.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Vec::new(),
        }
    }

    /// Load the backlog, creating the file as `[]` when it does not exist.
    pub fn load(path: impl Into<PathBuf>) -> TrackerResult<Self> {
        let mut queue = Self::empty(path);
        if !queue.path.exists() {
            queue.persist()?;
            return Ok(queue);
        }
        let text = fs::read_to_string(&queue.path)
            .map_err(|e| persistence_error(&queue.path, "reading", e))?;
        queue.records = serde_json::from_str(&text)
            .map_err(|e| persistence_error(&queue.path, "parsing", e))?;
        if !queue.records.is_empty() {
            log::info!(
                "Loaded {} queued record(s) from {}",
                queue.records.len(),
                queue.path.display()
            );
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    /// Write the whole queue to a sibling temp file and rename it over the
    /// target, so a crash leaves either the old or the new array on disk.
    pub fn persist(&self) -> TrackerResult<()> {
        let json = serde_json::to_vec(&self.records)
            .map_err(|e| persistence_error(&self.path, "serialising", e))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(|e| persistence_error(&tmp, "writing", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| persistence_error(&self.path, "replacing", e))
    }

    /// Append and persist. The record stays queued in memory even if the
    /// write fails.
    pub fn push(&mut self, record: TelemetryRecord) -> TrackerResult<()> {
        self.records.push(record);
        self.persist()
    }

    /// Remove every record for a delivery attempt made outside the lock.
    pub fn take_all(&mut self) -> Vec<TelemetryRecord> {
        std::mem::take(&mut self.records)
    }

    /// Put undelivered records back ahead of anything queued meanwhile,
    /// keeping their relative order, and persist.
    pub fn requeue_front(&mut self, mut failed: Vec<TelemetryRecord>) -> TrackerResult<()> {
        failed.append(&mut self.records);
        self.records = failed;
        self.persist()
    }
}

/// Try each record with `send`, keeping the failures in order.
/// Returns the delivered records' results and the failures.
pub fn deliver_backlog<F, T>(
    backlog: Vec<TelemetryRecord>,
    mut send: F,
) -> (Vec<T>, Vec<TelemetryRecord>)
where
    F: FnMut(&TelemetryRecord) -> TrackerResult<T>,
{
    let mut delivered = Vec::new();
    let mut failed = Vec::new();
    for record in backlog {
        match send(&record) {
            Ok(result) => delivered.push(result),
            Err(e) => {
                log::debug!("Backlog record {} still undeliverable: {}", record.iso_timestamp(), e);
                failed.push(record);
            }
        }
    }
    (delivered, failed)
}
