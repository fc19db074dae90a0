//! The repository orchestrator.
//!
//! Drives the three phases in order for each selected repository, persists
//! state between phases, and turns a user interrupt into a cooperative stop:
//! in-flight work finishes, state is saved, and the next run picks up where
//! this one left off.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::types::RepoSummary;
use crate::api::target::version_at_least;
use crate::api::{HttpSourceClient, HttpTargetClient, SourceApi, TargetApi};
use crate::config::TransferConfig;
use crate::events::{EventBroadcaster, TransferEvent};
use crate::manifest::ErrorManifestWriter;
use crate::phases::{ErrorRecoveryPhase, FilesDiffPhase, FullTransferPhase, PhaseBase};
use crate::state::{PhaseKind, TransferStateManager};
use crate::{Result, TransferError};

/// End-of-run totals for the caller to present.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub total_repositories: u64,
    pub transferred_repositories: u64,
    pub transferred_files: u64,
    pub transferred_bytes: u64,
    pub failures: u64,
    /// Where the per-repository error manifests live.
    pub transfer_dir: PathBuf,
    pub interrupted: bool,
    /// False when a state write failed and resuming may repeat work.
    pub resume_safe: bool,
}

/// Drives a whole transfer: plugin verification, repository selection and the
/// per-repository phase sequence.
pub struct TransferRunner {
    config: TransferConfig,
    state: Arc<TransferStateManager>,
    source: Arc<dyn SourceApi>,
    target: Arc<dyn TargetApi>,
    events: EventBroadcaster,
    cancel: CancellationToken,
}

impl TransferRunner {
    pub fn new(config: TransferConfig) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let source = Arc::new(HttpSourceClient::new(
            config.source.clone(),
            config.threads,
            cancel.clone(),
        )?);
        let target = Arc::new(HttpTargetClient::new(
            config.target.clone(),
            config.source.clone(),
            config.threads,
            cancel.clone(),
        )?);
        Ok(Self::with_clients(config, source, target, cancel))
    }

    /// Construct with injected clients. Embedders and tests use this to run
    /// the engine against fakes.
    pub fn with_clients(
        config: TransferConfig,
        source: Arc<dyn SourceApi>,
        target: Arc<dyn TargetApi>,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(TransferStateManager::new(config.transfer_dir()));
        Self {
            config,
            state,
            source,
            target,
            events: EventBroadcaster::new(),
            cancel,
        }
    }

    /// Token the caller cancels to request a graceful stop (e.g. on SIGINT).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Counter snapshots for progress observers.
    pub fn state_manager(&self) -> Arc<TransferStateManager> {
        self.state.clone()
    }

    /// Transfer the given repositories, in order.
    pub async fn run(&self, repo_keys: &[String]) -> Result<TransferSummary> {
        let _lock = self.state.try_lock()?;
        self.state.load_state().await?;
        self.verify_target_plugin().await?;

        let filter = self.config.repo_filter()?;
        let selected: Vec<String> = repo_keys
            .iter()
            .filter(|k| filter.matches(k.as_str()))
            .cloned()
            .collect();
        info!(
            repositories = selected.len(),
            threads = self.config.threads,
            "transfer starting"
        );

        self.state.set_total_repositories(selected.len() as u64);
        self.state.mark_run_started(self.config.threads);
        self.events.emit(TransferEvent::RunStarted {
            repositories: selected.len(),
        });

        let autosave_stop = CancellationToken::new();
        let autosave = self
            .state
            .spawn_autosave(self.config.autosave_interval, autosave_stop.clone());

        let mut first_failure: Option<TransferError> = None;
        for repo_key in &selected {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.config.force
                && self.state.all_phases_completed(repo_key)
                && !self.has_recorded_failures(repo_key).await
            {
                debug!(repo = %repo_key, "already transferred, skipping");
                continue;
            }
            // A failing repository does not stop the others.
            if let Err(e) = self.transfer_repository(repo_key).await {
                error!(repo = %repo_key, error = %e, "repository transfer failed");
                first_failure.get_or_insert(e);
            }
            self.save_checked().await;
        }

        autosave_stop.cancel();
        let _ = autosave.await;
        self.state.mark_run_finished();
        self.save_checked().await;

        let summary = self.build_summary();
        self.events.emit(TransferEvent::RunCompleted {
            transferred_files: summary.transferred_files,
            failures: summary.failures,
        });
        info!(
            transferred_files = summary.transferred_files,
            failures = summary.failures,
            manifests = %summary.transfer_dir.display(),
            "transfer finished; run again to retry recorded failures"
        );

        match first_failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn verify_target_plugin(&self) -> Result<()> {
        let version = self.target.plugin_version().await?;
        if !version_at_least(&version, &self.config.min_plugin_version) {
            return Err(TransferError::plugin(format!(
                "installed version {version} is older than required {}",
                self.config.min_plugin_version
            )));
        }
        info!(%version, "target transfer plugin verified");
        Ok(())
    }

    async fn transfer_repository(&self, repo_key: &str) -> Result<()> {
        let was_completed = self.state.all_phases_completed(repo_key);
        let summary = self.source.repo_summary(repo_key).await?;
        self.state.set_repo_state(
            repo_key,
            summary.files_count,
            summary.used_space_bytes,
            summary.build_info,
        );
        self.events.emit(TransferEvent::RepoStarted {
            repo_key: repo_key.to_string(),
        });
        info!(
            repo = %repo_key,
            files = summary.files_count,
            bytes = summary.used_space_bytes,
            package_type = ?summary.package_type,
            "repository transfer starting"
        );

        // One failure manifest per (repository, run), shared by all phases.
        let manifest = Arc::new(ErrorManifestWriter::new(
            &self.state.errors_dir(repo_key),
            self.state.run_id(),
        ));

        for kind in PhaseKind::ALL {
            if self.cancel.is_cancelled() {
                break;
            }
            if kind == PhaseKind::FullTransfer
                && !self.config.force
                && self.state.is_repo_transferred(repo_key)
            {
                debug!(repo = %repo_key, "full transfer already completed, skipping");
                continue;
            }
            self.run_phase(repo_key, kind, &summary, &manifest).await?;
            self.apply_worker_recommendation().await;
        }

        if !self.cancel.is_cancelled() && !was_completed && self.state.all_phases_completed(repo_key)
        {
            self.state.inc_transferred_repositories();
            self.events.emit(TransferEvent::RepoCompleted {
                repo_key: repo_key.to_string(),
            });
            info!(repo = %repo_key, "repository transfer completed");
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        repo_key: &str,
        kind: PhaseKind,
        summary: &RepoSummary,
        manifest: &Arc<ErrorManifestWriter>,
    ) -> Result<()> {
        self.state.set_current(Some(repo_key), Some(kind));
        self.state.mark_phase_started(repo_key, kind, Utc::now());
        self.save_checked().await;
        self.events.emit(TransferEvent::PhaseStarted {
            repo_key: repo_key.to_string(),
            phase: kind,
        });
        info!(repo = %repo_key, phase = %kind, "phase started");

        let base = self.phase_base(repo_key, summary, manifest);
        let result = match kind {
            PhaseKind::FullTransfer => FullTransferPhase::new(base).run().await,
            PhaseKind::FilesDiff => FilesDiffPhase::new(base).run().await,
            PhaseKind::ErrorRecovery => ErrorRecoveryPhase::new(base).run().await,
        };
        result.map_err(|e| TransferError::Phase {
            phase: kind.name(),
            repo: repo_key.to_string(),
            reason: e.to_string(),
        })?;

        // A phase that stopped on interrupt stays "started" and repeats on
        // the next run.
        if self.cancel.is_cancelled() {
            info!(repo = %repo_key, phase = %kind, "phase interrupted before completion");
        } else {
            self.state.mark_phase_completed(repo_key, kind);
            self.events.emit(TransferEvent::PhaseCompleted {
                repo_key: repo_key.to_string(),
                phase: kind,
            });
            info!(repo = %repo_key, phase = %kind, "phase completed");
        }
        self.save_checked().await;
        Ok(())
    }

    fn phase_base(
        &self,
        repo_key: &str,
        summary: &RepoSummary,
        manifest: &Arc<ErrorManifestWriter>,
    ) -> PhaseBase {
        PhaseBase {
            repo_key: repo_key.to_string(),
            package_type: summary.package_type,
            build_info_repo: summary.build_info,
            check_existence_in_filestore: self.config.check_existence_in_filestore,
            threads: self.state.working_threads().max(1),
            poll_interval: self.config.poll_interval,
            state: self.state.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            manifest: manifest.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// A completed repository still re-runs while failure manifests exist,
    /// so the error recovery phase can retry them.
    async fn has_recorded_failures(&self, repo_key: &str) -> bool {
        let errors_dir = self.state.errors_dir(repo_key);
        let Ok(mut entries) = tokio::fs::read_dir(&errors_dir).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().ends_with(".json") {
                return true;
            }
        }
        false
    }

    /// Pick up the target's concurrency recommendation between phases.
    async fn apply_worker_recommendation(&self) {
        match self.target.recommended_threads().await {
            Ok(Some(threads)) if threads != self.state.working_threads() => {
                info!(threads, "adjusting worker count to target recommendation");
                self.state.set_working_threads(threads);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "recommended thread query failed"),
        }
    }

    async fn save_checked(&self) {
        if let Err(e) = self.state.save_state().await {
            warn!(error = %e, "state snapshot failed, continuing in memory");
        }
    }

    fn build_summary(&self) -> TransferSummary {
        let run = self.state.run_snapshot();
        TransferSummary {
            total_repositories: run.total_repositories,
            transferred_repositories: run.transferred_repositories,
            transferred_files: self.state.transferred_units_total(),
            transferred_bytes: run.transferred_size_bytes,
            failures: run.transfer_failures,
            transfer_dir: self.state.transfer_dir().to_path_buf(),
            interrupted: self.cancel.is_cancelled(),
            resume_safe: !self.state.is_resume_unsafe(),
        }
    }
}
