//! Persisted state model.
//!
//! Two JSON documents: one global `state.json` for the run, and one
//! `repos/<repoKey>/state.json` per repository. Fields deserialize with
//! defaults so state written by older engine versions keeps loading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the three transfer phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    FullTransfer,
    FilesDiff,
    ErrorRecovery,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 3] = [
        PhaseKind::FullTransfer,
        PhaseKind::FilesDiff,
        PhaseKind::ErrorRecovery,
    ];

    pub fn ordinal(self) -> usize {
        match self {
            PhaseKind::FullTransfer => 1,
            PhaseKind::FilesDiff => 2,
            PhaseKind::ErrorRecovery => 3,
        }
    }

    /// Human-readable label used by the status report.
    pub fn label(self) -> &'static str {
        match self {
            PhaseKind::FullTransfer => "Transferring all files in the repository (1/3)",
            PhaseKind::FilesDiff => "Transferring newly created and modified files (2/3)",
            PhaseKind::ErrorRecovery => "Retrying transfer failures (3/3)",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PhaseKind::FullTransfer => "full transfer phase",
            PhaseKind::FilesDiff => "files diff phase",
            PhaseKind::ErrorRecovery => "error recovery phase",
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A half-open wall-clock interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Start/completion flags of a single-shot phase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PhaseProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
}

/// Progress of one diff pass. A new entry is appended every run; the handled
/// range is fixed once handling begins so a resumed run re-examines the same
/// interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffDetails {
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_range: Option<TimeRange>,
}

/// Per-repository persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoState {
    pub repo_key: String,
    #[serde(default)]
    pub build_info: bool,
    #[serde(default)]
    pub full_transfer: PhaseProgress,
    #[serde(default)]
    pub diffs: Vec<DiffDetails>,
    #[serde(default)]
    pub errors_handled: bool,

    #[serde(default)]
    pub total_units: u64,
    #[serde(default)]
    pub transferred_units: u64,
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default)]
    pub transferred_size_bytes: u64,
    #[serde(default)]
    pub failed_units: u64,
}

impl RepoState {
    pub fn new(repo_key: impl Into<String>) -> Self {
        Self {
            repo_key: repo_key.into(),
            build_info: false,
            full_transfer: PhaseProgress::default(),
            diffs: Vec::new(),
            errors_handled: false,
            total_units: 0,
            transferred_units: 0,
            total_size_bytes: 0,
            transferred_size_bytes: 0,
            failed_units: 0,
        }
    }

    /// Whether the full sweep finished in some run.
    pub fn is_fully_transferred(&self) -> bool {
        self.full_transfer.completed
    }

    pub fn latest_diff(&self) -> Option<&DiffDetails> {
        self.diffs.last()
    }

    /// A repository with every phase completed is skipped entirely on the
    /// next run.
    pub fn all_phases_completed(&self) -> bool {
        self.full_transfer.completed
            && self.diffs.last().is_some_and(|d| d.completed)
            && self.errors_handled
    }
}

/// Global persisted run state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseKind>,
    #[serde(default)]
    pub working_threads: usize,
    #[serde(default)]
    pub transfer_failures: u64,

    /// Repository-level progress: how many of the selected repositories have
    /// completed all phases.
    #[serde(default)]
    pub total_repositories: u64,
    #[serde(default)]
    pub transferred_repositories: u64,

    /// Byte totals aggregated over all selected repositories.
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default)]
    pub transferred_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_ordinals_follow_execution_order() {
        assert_eq!(PhaseKind::FullTransfer.ordinal(), 1);
        assert_eq!(PhaseKind::FilesDiff.ordinal(), 2);
        assert_eq!(PhaseKind::ErrorRecovery.ordinal(), 3);
    }

    #[test]
    fn completion_requires_all_three_phases() {
        let mut repo = RepoState::new("repo1");
        assert!(!repo.all_phases_completed());

        repo.full_transfer.completed = true;
        repo.errors_handled = true;
        assert!(!repo.all_phases_completed(), "no diff pass recorded yet");

        repo.diffs.push(DiffDetails {
            started: Utc::now(),
            completed: false,
            handled_range: None,
        });
        assert!(!repo.all_phases_completed());

        repo.diffs.last_mut().unwrap().completed = true;
        assert!(repo.all_phases_completed());
    }

    #[test]
    fn old_state_files_load_with_defaults() {
        let repo: RepoState = serde_json::from_str(r#"{"repo_key":"r"}"#).unwrap();
        assert_eq!(repo.repo_key, "r");
        assert!(!repo.is_fully_transferred());
        assert!(repo.diffs.is_empty());
    }
}
