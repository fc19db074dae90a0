//! The producer/consumer upload pipeline.
//!
//! Two bounded pools per phase: chunk builders walk directories or scan time
//! windows and assemble chunks; chunk uploaders submit chunks to the target
//! and forward the accepted tokens over a bounded channel to a single status
//! poller, which polls tokens to completion, updates counters and records
//! failures.
//!
//! Stop is cooperative. A single token, child of the user's interrupt token,
//! is cancelled by the errors queue once any task reports a fatal error;
//! every producer observes it at the top of its loop. Shutdown order: stop
//! enumeration, drain builders, replay deferred uploads, drain uploaders,
//! drain the poller, surface the first fatal error.

pub mod aggregator;

use std::sync::Arc;
use std::time::Duration;

use task_pool::{ErrorsQueue, PoolConfig, PoolHandle, TaskPool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::types::ChunkToken;
use crate::api::TargetApi;
use crate::chunk::{UploadCandidate, UploadChunk};
use crate::manifest::{ErrorManifestWriter, FileFailureRecord, classify_status};
use crate::state::TransferStateManager;
use crate::{Result, TransferError};

/// How many fatal task errors stop the pipeline.
const ERROR_STOP_THRESHOLD: usize = 1;

/// Capacity of the uploader-to-poller token channel.
const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// An accepted chunk awaiting status, flowing from uploaders to the poller.
#[derive(Debug)]
pub struct UploadedChunkData {
    pub token: ChunkToken,
    pub candidates: Vec<UploadCandidate>,
}

/// Per-phase inputs of the pipeline.
#[derive(Clone)]
pub struct PipelineContext {
    pub repo_key: String,
    pub build_info_repo: bool,
    pub check_existence_in_filestore: bool,
    pub threads: usize,
    pub poll_interval: Duration,
    pub state: Arc<TransferStateManager>,
    pub target: Arc<dyn TargetApi>,
    pub manifest: Arc<ErrorManifestWriter>,
    /// The user's interrupt token.
    pub cancel: CancellationToken,
}

/// A running pipeline instance. One per phase execution.
pub struct TransferPipeline {
    builder: TaskPool<TransferError>,
    uploader: TaskPool<TransferError>,
    dispatcher: ChunkDispatcher,
    poller: JoinHandle<()>,
    errors: ErrorsQueue<TransferError>,
    stop: CancellationToken,
}

impl TransferPipeline {
    pub fn start(ctx: &PipelineContext) -> Self {
        let stop = ctx.cancel.child_token();
        let errors = ErrorsQueue::new(ERROR_STOP_THRESHOLD, stop.clone());
        let builder = TaskPool::new(
            "chunk-builder",
            PoolConfig::new(ctx.threads),
            errors.clone(),
        );
        let uploader = TaskPool::new(
            "chunk-uploader",
            PoolConfig::new(ctx.threads),
            errors.clone(),
        );

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let dispatcher = ChunkDispatcher {
            repo_key: ctx.repo_key.clone().into(),
            uploader: uploader.handle(),
            target: ctx.target.clone(),
            manifest: ctx.manifest.clone(),
            state: ctx.state.clone(),
            chunk_tx,
            stop: stop.clone(),
        };
        let poller = aggregator::spawn(ctx, chunk_rx);

        Self {
            builder,
            uploader,
            dispatcher,
            poller,
            errors,
            stop,
        }
    }

    /// Token observed by every task at the top of its loop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Submission handle for chunk-builder tasks (directory walks, window
    /// scans). Builder tasks may submit further builder tasks.
    pub fn builder(&self) -> PoolHandle<TransferError> {
        self.builder.handle()
    }

    pub fn dispatcher(&self) -> ChunkDispatcher {
        self.dispatcher.clone()
    }

    /// Wait until all enumeration tasks (and their fan-out) finished.
    pub async fn drain_builders(&self) {
        self.builder.join().await;
    }

    /// Drain uploads and the status poller, then surface the first fatal
    /// error a task reported.
    pub async fn finish(self) -> Result<()> {
        let Self {
            builder: _builder,
            uploader,
            dispatcher,
            poller,
            errors,
            stop: _stop,
        } = self;

        uploader.join().await;
        // Last sender gone: the poller drains its in-flight chunks and exits.
        drop(dispatcher);
        if poller.await.is_err() {
            warn!("chunk status poller panicked");
        }

        let mut failures = errors.take_all();
        match failures.is_empty() {
            true => Ok(()),
            false => Err(failures.remove(0)),
        }
    }
}

/// Cloneable handle that turns finished chunks into uploader-pool tasks.
#[derive(Clone)]
pub struct ChunkDispatcher {
    repo_key: Arc<str>,
    uploader: PoolHandle<TransferError>,
    target: Arc<dyn TargetApi>,
    manifest: Arc<ErrorManifestWriter>,
    state: Arc<TransferStateManager>,
    chunk_tx: mpsc::Sender<UploadedChunkData>,
    stop: CancellationToken,
}

impl ChunkDispatcher {
    /// Queue a chunk for upload. Empty chunks are ignored.
    pub async fn dispatch(&self, chunk: UploadChunk) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let task = self.clone();
        self.uploader
            .add_task(async move { task.upload_chunk_task(chunk).await })
            .await
            .map_err(|e| TransferError::internal(e.to_string()))
    }

    /// Uploader-pool task: submit the chunk, hand the token to the poller.
    async fn upload_chunk_task(self, chunk: UploadChunk) -> Result<()> {
        if self.stop.is_cancelled() {
            return Ok(());
        }

        let token = match self.target.upload_chunk(&chunk).await {
            Ok(token) => token,
            Err(TransferError::Cancelled) => return Ok(()),
            // A failed submission fails every file in the chunk; the run
            // continues and the error recovery phase retries them later.
            Err(e) => {
                self.record_chunk_failure(chunk, &e).await;
                return Ok(());
            }
        };

        let data = UploadedChunkData {
            token,
            candidates: chunk.into_candidates(),
        };
        tokio::select! {
            _ = self.stop.cancelled() => Ok(()),
            sent = self.chunk_tx.send(data) => {
                sent.map_err(|_| TransferError::internal("chunk status poller is gone"))
            }
        }
    }

    async fn record_chunk_failure(&self, chunk: UploadChunk, err: &TransferError) {
        let status_code = match err {
            TransferError::HttpStatus { status, .. } => Some(status.as_u16()),
            _ => None,
        };
        let mut failed = 0u64;
        for candidate in chunk.into_candidates() {
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
        if let Err(e) = self.manifest.flush().await {
            warn!(error = %e, "flushing error manifest failed");
        }
    }
}
