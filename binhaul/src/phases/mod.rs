//! The three transfer phases, executed in order per repository.

pub mod diff;
pub mod error_recovery;
pub mod full;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::types::PackageType;
use crate::api::{SourceApi, TargetApi};
use crate::chunk::{UploadCandidate, UploadChunk};
use crate::delay::{DelayPolicy, DelayedArtifactsWriter};
use crate::manifest::ErrorManifestWriter;
use crate::pipeline::{ChunkDispatcher, PipelineContext, TransferPipeline};
use crate::state::{PhaseKind, TransferStateManager};
use crate::{Result, TransferError};

pub use diff::FilesDiffPhase;
pub use error_recovery::ErrorRecoveryPhase;
pub use full::FullTransferPhase;

/// Dependencies shared by every phase of one repository's transfer.
#[derive(Clone)]
pub struct PhaseBase {
    pub repo_key: String,
    pub package_type: PackageType,
    pub build_info_repo: bool,
    pub check_existence_in_filestore: bool,
    pub threads: usize,
    pub poll_interval: Duration,
    pub state: Arc<TransferStateManager>,
    pub source: Arc<dyn SourceApi>,
    pub target: Arc<dyn TargetApi>,
    pub manifest: Arc<ErrorManifestWriter>,
    /// The user's interrupt token.
    pub cancel: CancellationToken,
}

impl PhaseBase {
    pub(crate) fn pipeline_context(&self) -> PipelineContext {
        PipelineContext {
            repo_key: self.repo_key.clone(),
            build_info_repo: self.build_info_repo,
            check_existence_in_filestore: self.check_existence_in_filestore,
            threads: self.threads,
            poll_interval: self.poll_interval,
            state: self.state.clone(),
            target: self.target.clone(),
            manifest: self.manifest.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub(crate) fn delayed_writer(&self, phase: PhaseKind) -> DelayedArtifactsWriter {
        DelayedArtifactsWriter::new(&self.state.delayed_dir(&self.repo_key), phase)
    }

    /// Replay deferred uploads after the primary sweep drained, before the
    /// phase completes. Replay runs with an empty delay policy so nothing is
    /// deferred twice; a replayed file that fails lands in the manifest like
    /// any other.
    pub(crate) async fn replay_delayed(
        &self,
        pipeline: &TransferPipeline,
        delayed: &DelayedArtifactsWriter,
    ) -> Result<()> {
        delayed
            .flush()
            .await
            .map_err(|e| TransferError::DelayedArtifacts {
                reason: e.to_string(),
            })?;
        if delayed.is_empty() || pipeline.stop_token().is_cancelled() {
            return Ok(());
        }

        info!(
            repo = %self.repo_key,
            count = delayed.len(),
            "replaying deferred uploads"
        );
        upload_by_chunks(
            delayed.candidates(),
            &pipeline.dispatcher(),
            &DelayPolicy::none(),
            None,
            self.build_info_repo,
            self.check_existence_in_filestore,
            &pipeline.stop_token(),
        )
        .await?;
        Ok(())
    }

    /// Delete a fully replayed spill file. Best effort.
    pub(crate) async fn discard_spill(&self, delayed: &DelayedArtifactsWriter) {
        if let Err(e) = delayed.remove().await {
            warn!(error = %e, "removing delayed artifacts spill failed");
        }
    }
}

/// Chunk a batch of candidates and hand full chunks to the uploader pool,
/// flushing the residual partial chunk at the end. Candidates matching the
/// delay policy are spilled instead of chunked.
///
/// Returns `true` when a stop request interrupted the batch.
pub(crate) async fn upload_by_chunks(
    candidates: Vec<UploadCandidate>,
    dispatcher: &ChunkDispatcher,
    policy: &DelayPolicy,
    delayed: Option<&DelayedArtifactsWriter>,
    build_info_repo: bool,
    check_existence_in_filestore: bool,
    stop: &CancellationToken,
) -> Result<bool> {
    let mut chunk = UploadChunk::new(check_existence_in_filestore);
    for candidate in candidates {
        if stop.is_cancelled() {
            return Ok(true);
        }
        if let Some(writer) = delayed {
            if policy.should_delay(&candidate.file) {
                writer.append(candidate.file, candidate.size);
                continue;
            }
        }
        chunk.append_candidate(candidate.file, candidate.size, build_info_repo);
        if chunk.is_full() {
            dispatcher.dispatch(chunk.take()).await?;
        }
    }
    if !chunk.is_empty() {
        dispatcher.dispatch(chunk.take()).await?;
    }
    Ok(false)
}
