//! Per-run error manifests.
//!
//! Each run writes at most one manifest per repository, created lazily on the
//! first failure. Manifests from earlier runs are the input of the error
//! recovery phase: their entries are re-uploaded, this run's failures land in
//! a fresh manifest, and the consumed files are deleted afterwards, so a file
//! that eventually succeeds simply stops being listed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::types::FileRepresentation;
use crate::utils::fs::{read_json, write_json_atomic};
use crate::{Result, TransferError};

/// Retry classification of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClassification {
    /// Transport-level failure, likely to succeed on a later run.
    Retryable,
    /// The target rejected the file for semantic reasons.
    SkippedByPolicy,
}

/// Classify a failure by the HTTP status the target reported, if any.
pub fn classify_status(status_code: Option<u16>) -> ErrorClassification {
    match status_code {
        Some(code) if (400..500).contains(&code) => ErrorClassification::SkippedByPolicy,
        _ => ErrorClassification::Retryable,
    }
}

/// One failed file reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFailureRecord {
    #[serde(flatten)]
    pub file: FileRepresentation,
    pub classification: ErrorClassification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl FileFailureRecord {
    pub fn new(
        file: FileRepresentation,
        classification: ErrorClassification,
        status_code: Option<u16>,
        reason: Option<String>,
    ) -> Self {
        Self {
            file,
            classification,
            status_code,
            reason,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    errors: Vec<FileFailureRecord>,
}

struct WriterState {
    records: Vec<FileFailureRecord>,
    dirty: bool,
}

/// Append-only failure manifest for one (repository, run).
pub struct ErrorManifestWriter {
    path: PathBuf,
    state: Mutex<WriterState>,
}

impl ErrorManifestWriter {
    pub fn new(errors_dir: &Path, run_id: &str) -> Self {
        Self {
            path: errors_dir.join(format!("{run_id}.json")),
            state: Mutex::new(WriterState {
                records: Vec::new(),
                dirty: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: FileFailureRecord) {
        let mut state = self.state.lock();
        state.records.push(record);
        state.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Rewrite the manifest file if records were appended since the last
    /// flush. The file is only created once a failure exists.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.records.clone()
        };
        write_json_atomic(&self.path, &ManifestFile { errors: snapshot }).await
    }
}

/// Manifests of earlier runs for one repository, with their file paths so
/// consumed manifests can be deleted after a successful replay.
pub async fn read_prior_manifests(
    errors_dir: &Path,
    current_run_id: &str,
) -> Result<Vec<(PathBuf, Vec<FileFailureRecord>)>> {
    let current_name = format!("{current_run_id}.json");
    let mut manifests = Vec::new();

    let mut entries = match tokio::fs::read_dir(errors_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
        Err(e) => return Err(TransferError::state_io("reading", errors_dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TransferError::state_io("reading", errors_dir, e))?
    {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".json") || name == current_name {
            continue;
        }
        if let Some(manifest) = read_json::<ManifestFile>(&path).await? {
            debug!(path = %path.display(), entries = manifest.errors.len(), "prior error manifest found");
            manifests.push((path, manifest.errors));
        }
    }
    // Stable replay order across runs.
    manifests.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(manifests)
}
