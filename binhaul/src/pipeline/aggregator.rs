//! The chunk status poller.
//!
//! A single task consumes accepted-chunk tokens from the uploaders and polls
//! the target until every chunk reports DONE. Confirmed files update the
//! state counters; failed files are appended to the error manifest. The
//! poller keeps polling in-flight chunks after a stop request so counters
//! only ever reflect confirmed work; a user interrupt aborts the poll calls
//! themselves, and the unconfirmed chunks are simply re-offered on resume.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PipelineContext, UploadedChunkData};
use crate::TransferError;
use crate::api::TargetApi;
use crate::api::types::{ChunkPoll, FileOutcome, FileRepresentation, FileStatusRecord};
use crate::manifest::{ErrorManifestWriter, FileFailureRecord, classify_status};
use crate::state::TransferStateManager;

pub(crate) fn spawn(
    ctx: &PipelineContext,
    chunk_rx: mpsc::Receiver<UploadedChunkData>,
) -> JoinHandle<()> {
    let poller = StatusPoller {
        repo_key: ctx.repo_key.clone(),
        target: ctx.target.clone(),
        state: ctx.state.clone(),
        manifest: ctx.manifest.clone(),
        poll_interval: ctx.poll_interval,
        cancel: ctx.cancel.clone(),
    };
    tokio::spawn(poller.run(chunk_rx))
}

struct StatusPoller {
    repo_key: String,
    target: Arc<dyn TargetApi>,
    state: Arc<TransferStateManager>,
    manifest: Arc<ErrorManifestWriter>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl StatusPoller {
    async fn run(self, mut chunk_rx: mpsc::Receiver<UploadedChunkData>) {
        let mut in_flight: VecDeque<UploadedChunkData> = VecDeque::new();
        let mut channel_open = true;

        'poll: loop {
            // Block for the first token when idle; otherwise just drain
            // whatever is queued.
            if in_flight.is_empty() {
                if !channel_open {
                    break;
                }
                match chunk_rx.recv().await {
                    Some(data) => in_flight.push_back(data),
                    None => {
                        channel_open = false;
                        continue;
                    }
                }
            }
            loop {
                match chunk_rx.try_recv() {
                    Ok(data) => in_flight.push_back(data),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        channel_open = false;
                        break;
                    }
                }
            }

            let mut still_in_progress = VecDeque::new();
            for data in in_flight.drain(..) {
                match self.target.chunk_status(&data.token).await {
                    Ok(ChunkPoll::InProgress) => still_in_progress.push_back(data),
                    Ok(ChunkPoll::Done(outcomes)) => self.apply_outcomes(data, outcomes),
                    Err(TransferError::Cancelled) => {
                        warn!(
                            repo = %self.repo_key,
                            abandoned = still_in_progress.len() + 1,
                            "interrupted; unconfirmed chunks will be re-offered on the next run"
                        );
                        break 'poll;
                    }
                    Err(e) => {
                        warn!(repo = %self.repo_key, token = %data.token, error = %e, "chunk status poll failed");
                        self.record_chunk_failed(data, &e);
                    }
                }
            }
            in_flight = still_in_progress;

            if let Err(e) = self.manifest.flush().await {
                warn!(error = %e, "flushing error manifest failed");
            }
            if in_flight.is_empty() && !channel_open {
                break;
            }
            if !in_flight.is_empty() {
                // An interrupt skips the wait; the next poll call observes it.
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        if let Err(e) = self.manifest.flush().await {
            warn!(error = %e, "flushing error manifest failed");
        }
        debug!(repo = %self.repo_key, "chunk status poller drained");
    }

    /// Attribute per-file outcomes of a DONE chunk to counters and manifest.
    fn apply_outcomes(&self, data: UploadedChunkData, outcomes: Vec<FileStatusRecord>) {
        let sizes: HashMap<FileRepresentation, u64> = data
            .candidates
            .into_iter()
            .map(|c| (c.file, c.size))
            .collect();

        let mut confirmed_files = 0u64;
        let mut confirmed_bytes = 0u64;
        let mut failed = 0u64;
        for outcome in outcomes {
            let size = sizes.get(&outcome.file).copied().unwrap_or(0);
            let placeholder = outcome.file.is_placeholder();
            match outcome.status {
                FileOutcome::Success | FileOutcome::Skipped => {
                    // Placeholders materialize directories; they carry no
                    // transferable bytes and stay out of the counters.
                    if !placeholder {
                        confirmed_files += 1;
                        confirmed_bytes += size;
                    }
                }
                FileOutcome::Fail if placeholder => {
                    // Some targets refuse empty-name references. The
                    // directory will exist once any child arrives.
                    debug!(path = %outcome.file.full_path(), "placeholder rejected, treated as skipped");
                }
                FileOutcome::Fail => {
                    self.manifest.append(FileFailureRecord::new(
                        outcome.file,
                        classify_status(outcome.status_code),
                        outcome.status_code,
                        outcome.reason,
                    ));
                    failed += 1;
                }
            }
        }

        self.state
            .inc_transferred_size_and_files(&self.repo_key, confirmed_files, confirmed_bytes);
        if failed > 0 {
            self.state.inc_transfer_failures(&self.repo_key, failed);
        }
        debug!(
            repo = %self.repo_key,
            token = %data.token,
            confirmed = confirmed_files,
            failed,
            "chunk done"
        );
    }

    /// A chunk whose status can no longer be determined fails wholesale.
    fn record_chunk_failed(&self, data: UploadedChunkData, err: &TransferError) {
        let status_code = match err {
            TransferError::HttpStatus { status, .. } => Some(status.as_u16()),
            _ => None,
        };
        let mut failed = 0u64;
        for candidate in data.candidates {
            if candidate.file.is_placeholder() {
                continue;
            }
            self.manifest.append(FileFailureRecord::new(
                candidate.file,
                classify_status(status_code),
                status_code,
                Some(err.to_string()),
            ));
            failed += 1;
        }
        if failed > 0 {
            self.state.inc_transfer_failures(&self.repo_key, failed);
        }
    }
}
