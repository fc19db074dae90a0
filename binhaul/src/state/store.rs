//! The state manager: serialized mutation, atomic persistence, resume.
//!
//! All mutations go through one internal lock. Persistence snapshots the
//! state under the lock and writes outside it, so no HTTP call or disk write
//! ever runs with the lock held. Every file write is temp-then-rename.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{DiffDetails, PhaseKind, RepoState, RunState, TimeRange};
use crate::utils::fs::{ensure_dir_all, read_json, write_json_atomic};
use crate::{Result, TransferError};

const GLOBAL_STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "lock";

/// Advisory single-process lock on a transfer directory. Removed on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

struct StateInner {
    run: RunState,
    repos: HashMap<String, RepoState>,
}

/// Owner of all persisted transfer state.
pub struct TransferStateManager {
    dir: PathBuf,
    run_id: String,
    inner: Mutex<StateInner>,
    /// Set when a state write failed; resuming from disk may lose progress.
    unsafe_resume: AtomicBool,
}

impl TransferStateManager {
    /// `dir` is the transfer state root, typically `<home>/transfer`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            run_id: Uuid::new_v4().to_string(),
            inner: Mutex::new(StateInner {
                run: RunState::default(),
                repos: HashMap::new(),
            }),
            unsafe_resume: AtomicBool::new(false),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn transfer_dir(&self) -> &Path {
        &self.dir
    }

    pub fn repo_dir(&self, repo_key: &str) -> PathBuf {
        self.dir.join("repos").join(repo_key)
    }

    pub fn errors_dir(&self, repo_key: &str) -> PathBuf {
        self.repo_dir(repo_key).join("errors")
    }

    pub fn delayed_dir(&self, repo_key: &str) -> PathBuf {
        self.repo_dir(repo_key).join("delayed")
    }

    fn repo_state_file(&self, repo_key: &str) -> PathBuf {
        self.repo_dir(repo_key).join(GLOBAL_STATE_FILE)
    }

    /// Take the single-process lock for this transfer directory.
    pub fn try_lock(&self) -> Result<StateLock> {
        let path = self.dir.join(LOCK_FILE);
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| TransferError::state_io("creating directory", &self.dir, e))?;
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(TransferError::LockHeld { path });
            }
            Err(e) => return Err(TransferError::state_io("creating", &path, e)),
        };
        let _ = writeln!(file, "{}", std::process::id());
        debug!(path = %path.display(), "transfer lock acquired");
        Ok(StateLock { path })
    }

    /// Load state persisted by previous runs, if any.
    pub async fn load_state(&self) -> Result<()> {
        let run: Option<RunState> = read_json(&self.dir.join(GLOBAL_STATE_FILE)).await?;
        let mut repos = HashMap::new();

        let repos_dir = self.dir.join("repos");
        match tokio::fs::read_dir(&repos_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| TransferError::state_io("reading", &repos_dir, e))?
                {
                    let state_file = entry.path().join(GLOBAL_STATE_FILE);
                    if let Some(repo) = read_json::<RepoState>(&state_file).await? {
                        repos.insert(repo.repo_key.clone(), repo);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(TransferError::state_io("reading", &repos_dir, e)),
        }

        let mut inner = self.inner.lock();
        if let Some(run) = run {
            inner.run = run;
        }
        let loaded = repos.len();
        inner.repos = repos;
        drop(inner);
        if loaded > 0 {
            info!(repositories = loaded, "previous transfer state loaded");
        }
        Ok(())
    }

    /// Persist a snapshot of the global state and every repository state.
    pub async fn save_state(&self) -> Result<()> {
        let (run, repos) = {
            let inner = self.inner.lock();
            (inner.run.clone(), inner.repos.clone())
        };

        let result = self.write_snapshot(&run, &repos).await;
        if let Err(e) = &result {
            self.unsafe_resume.store(true, Ordering::SeqCst);
            error!(error = %e, "persisting transfer state failed, resume safety degraded");
        }
        result
    }

    async fn write_snapshot(&self, run: &RunState, repos: &HashMap<String, RepoState>) -> Result<()> {
        ensure_dir_all(&self.dir).await?;
        write_json_atomic(&self.dir.join(GLOBAL_STATE_FILE), run).await?;
        for (repo_key, repo) in repos {
            write_json_atomic(&self.repo_state_file(repo_key), repo).await?;
        }
        Ok(())
    }

    /// Whether a state write failed earlier in this run.
    pub fn is_resume_unsafe(&self) -> bool {
        self.unsafe_resume.load(Ordering::SeqCst)
    }

    /// Persist on a timer until cancelled. Errors are logged, not fatal.
    pub fn spawn_autosave(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let _ = manager.save_state().await;
            }
        })
    }

    // Run-level mutations.

    pub fn mark_run_started(&self, threads: usize) {
        let mut inner = self.inner.lock();
        inner.run.running = true;
        inner.run.start_time = Some(Utc::now());
        inner.run.working_threads = threads;
    }

    pub fn mark_run_finished(&self) {
        let mut inner = self.inner.lock();
        inner.run.running = false;
        inner.run.current_repo = None;
        inner.run.current_phase = None;
    }

    pub fn set_current(&self, repo_key: Option<&str>, phase: Option<PhaseKind>) {
        let mut inner = self.inner.lock();
        inner.run.current_repo = repo_key.map(str::to_string);
        inner.run.current_phase = phase;
    }

    pub fn set_working_threads(&self, threads: usize) {
        self.inner.lock().run.working_threads = threads.max(1);
    }

    pub fn working_threads(&self) -> usize {
        self.inner.lock().run.working_threads
    }

    pub fn set_total_repositories(&self, total: u64) {
        self.inner.lock().run.total_repositories = total;
    }

    pub fn inc_transferred_repositories(&self) {
        self.inner.lock().run.transferred_repositories += 1;
    }

    pub fn run_snapshot(&self) -> RunState {
        self.inner.lock().run.clone()
    }

    // Repository-level mutations.

    /// Seed (or reseed) a repository's totals from the source summary.
    /// Global byte totals track the sum over all seeded repositories.
    pub fn set_repo_state(
        &self,
        repo_key: &str,
        total_files: u64,
        total_size_bytes: u64,
        build_info: bool,
    ) {
        let mut inner = self.inner.lock();
        let repo = inner
            .repos
            .entry(repo_key.to_string())
            .or_insert_with(|| RepoState::new(repo_key));
        let previous_total = repo.total_size_bytes;
        repo.total_units = total_files;
        repo.total_size_bytes = total_size_bytes;
        repo.build_info = build_info;
        inner.run.total_size_bytes = inner
            .run
            .total_size_bytes
            .saturating_sub(previous_total)
            .saturating_add(total_size_bytes);
    }

    pub fn repo_snapshot(&self, repo_key: &str) -> Option<RepoState> {
        self.inner.lock().repos.get(repo_key).cloned()
    }

    pub fn is_repo_transferred(&self, repo_key: &str) -> bool {
        self.inner
            .lock()
            .repos
            .get(repo_key)
            .is_some_and(|r| r.is_fully_transferred())
    }

    pub fn all_phases_completed(&self, repo_key: &str) -> bool {
        self.inner
            .lock()
            .repos
            .get(repo_key)
            .is_some_and(|r| r.all_phases_completed())
    }

    fn with_repo<T>(&self, repo_key: &str, f: impl FnOnce(&mut RepoState, &mut RunState) -> T) -> T {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let repo = inner
            .repos
            .entry(repo_key.to_string())
            .or_insert_with(|| RepoState::new(repo_key));
        f(repo, &mut inner.run)
    }

    /// Record a phase start. Restarting an unfinished full sweep resets the
    /// repository's progress counters: the sweep revisits every file, and the
    /// target reports already-present files as skipped.
    pub fn mark_phase_started(&self, repo_key: &str, phase: PhaseKind, at: DateTime<Utc>) {
        self.with_repo(repo_key, |repo, run| match phase {
            PhaseKind::FullTransfer => {
                repo.full_transfer.started = Some(at);
                run.transferred_size_bytes = run
                    .transferred_size_bytes
                    .saturating_sub(repo.transferred_size_bytes);
                repo.transferred_units = 0;
                repo.transferred_size_bytes = 0;
                repo.failed_units = 0;
            }
            PhaseKind::FilesDiff => {
                repo.diffs.push(DiffDetails {
                    started: at,
                    completed: false,
                    handled_range: None,
                });
            }
            PhaseKind::ErrorRecovery => {}
        });
    }

    /// Record a phase completion.
    pub fn mark_phase_completed(&self, repo_key: &str, phase: PhaseKind) {
        self.with_repo(repo_key, |repo, _| match phase {
            PhaseKind::FullTransfer => repo.full_transfer.completed = true,
            PhaseKind::FilesDiff => {
                if let Some(diff) = repo.diffs.last_mut() {
                    diff.completed = true;
                }
            }
            PhaseKind::ErrorRecovery => repo.errors_handled = true,
        });
    }

    /// The half-open range the current diff pass must examine: from the last
    /// completed diff (or the full sweep start) up to the current pass start.
    /// The range is recorded on the pass so resuming re-examines the same
    /// interval.
    pub fn get_diff_handling_range(&self, repo_key: &str) -> Result<TimeRange> {
        self.with_repo(repo_key, |repo, _| {
            if let Some(range) = repo.diffs.last().and_then(|d| d.handled_range) {
                return Ok(range);
            }

            let end = repo
                .diffs
                .last()
                .map(|d| d.started)
                .ok_or_else(|| TransferError::internal("diff range requested before diff phase start"))?;
            let start = repo
                .diffs
                .iter()
                .rev()
                .skip(1)
                .find(|d| d.completed)
                .map(|d| d.started)
                .or(repo.full_transfer.started)
                .ok_or_else(|| {
                    TransferError::internal("diff range requested before full transfer start")
                })?;

            let range = TimeRange { start, end };
            if let Some(diff) = repo.diffs.last_mut() {
                diff.handled_range = Some(range);
            }
            Ok(range)
        })
    }

    /// Account for confirmed transfers (successful or skipped-as-present).
    ///
    /// Increments clamp at the repository totals: later phases re-confirm
    /// files the full sweep already counted (the target answers SKIPPED), and
    /// those must not push transferred past total.
    pub fn inc_transferred_size_and_files(&self, repo_key: &str, files: u64, bytes: u64) {
        self.with_repo(repo_key, |repo, run| {
            let files = files.min(repo.total_units.saturating_sub(repo.transferred_units));
            let bytes = bytes.min(
                repo.total_size_bytes
                    .saturating_sub(repo.transferred_size_bytes),
            );
            repo.transferred_units += files;
            repo.transferred_size_bytes += bytes;
            run.transferred_size_bytes += bytes;
        });
    }

    /// Account for files discovered after the summary was taken (diff finds).
    pub fn inc_total_size_and_files(&self, repo_key: &str, files: u64, bytes: u64) {
        self.with_repo(repo_key, |repo, run| {
            repo.total_units += files;
            repo.total_size_bytes += bytes;
            run.total_size_bytes += bytes;
        });
    }

    /// Confirmed file count summed over every known repository.
    pub fn transferred_units_total(&self) -> u64 {
        self.inner
            .lock()
            .repos
            .values()
            .map(|r| r.transferred_units)
            .sum()
    }

    pub fn inc_transfer_failures(&self, repo_key: &str, count: u64) {
        self.with_repo(repo_key, |repo, run| {
            repo.failed_units += count;
            run.transfer_failures += count;
        });
    }
}
