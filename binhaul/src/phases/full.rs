//! The full transfer phase.
//!
//! Treats every directory as a task: a task pages through one directory's
//! contents, appends files to its current chunk and fans subdirectories out
//! as new tasks on the chunk-builder pool. Empty directories ship a single
//! placeholder reference so the target materializes them. The phase runs at
//! most once per repository; an interrupted sweep repeats from the root on
//! the next run and relies on the target to skip files it already holds.

use std::sync::Arc;

use futures::future::BoxFuture;
use task_pool::PoolHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PhaseBase;
use crate::api::SourceApi;
use crate::api::types::{FileRepresentation, ItemType};
use crate::chunk::UploadChunk;
use crate::delay::{DelayPolicy, DelayedArtifactsWriter};
use crate::pipeline::{ChunkDispatcher, TransferPipeline};
use crate::state::PhaseKind;
use crate::{Result, SEARCH_PAGE_LIMIT, TransferError};

pub struct FullTransferPhase {
    base: PhaseBase,
}

impl FullTransferPhase {
    pub fn new(base: PhaseBase) -> Self {
        Self { base }
    }

    pub async fn run(&self) -> Result<()> {
        let delayed = Arc::new(self.base.delayed_writer(PhaseKind::FullTransfer));
        let pipeline = TransferPipeline::start(&self.base.pipeline_context());

        let walk = Arc::new(WalkContext {
            repo_key: self.base.repo_key.clone(),
            build_info_repo: self.base.build_info_repo,
            check_existence_in_filestore: self.base.check_existence_in_filestore,
            source: self.base.source.clone(),
            builder: pipeline.builder(),
            dispatcher: pipeline.dispatcher(),
            policy: DelayPolicy::for_package_type(self.base.package_type),
            delayed: delayed.clone(),
            stop: pipeline.stop_token(),
        });
        walk.builder
            .add_task(walk_directory(walk.clone(), ".".to_string()))
            .await
            .map_err(|e| TransferError::internal(e.to_string()))?;
        pipeline.drain_builders().await;
        drop(walk);

        self.base.replay_delayed(&pipeline, &delayed).await?;

        let stop = pipeline.stop_token();
        pipeline.finish().await?;
        if !stop.is_cancelled() {
            self.base.discard_spill(&delayed).await;
        }
        Ok(())
    }
}

struct WalkContext {
    repo_key: String,
    build_info_repo: bool,
    check_existence_in_filestore: bool,
    source: Arc<dyn SourceApi>,
    builder: PoolHandle<TransferError>,
    dispatcher: ChunkDispatcher,
    policy: DelayPolicy,
    delayed: Arc<DelayedArtifactsWriter>,
    stop: CancellationToken,
}

fn join_child(parent: &str, name: &str) -> String {
    if parent == "." {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Chunk-builder task visiting one directory. Boxed because subdirectories
/// re-enter through the pool.
fn walk_directory(ctx: Arc<WalkContext>, relative_path: String) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        if ctx.stop.is_cancelled() {
            return Ok(());
        }
        debug!(repo = %ctx.repo_key, path = %relative_path, "visiting directory");

        let mut chunk = UploadChunk::new(ctx.check_existence_in_filestore);
        let mut page = 0usize;
        loop {
            if ctx.stop.is_cancelled() {
                return Ok(());
            }
            let items = ctx
                .source
                .list_directory(&ctx.repo_key, &relative_path, page)
                .await?;

            if page == 0 && items.is_empty() {
                chunk.append_candidate(
                    FileRepresentation::folder_placeholder(&ctx.repo_key, &relative_path),
                    0,
                    ctx.build_info_repo,
                );
                break;
            }

            let full_page = items.len() >= SEARCH_PAGE_LIMIT;
            for item in items {
                if ctx.stop.is_cancelled() {
                    return Ok(());
                }
                if item.name == "." {
                    continue;
                }
                match item.item_type {
                    ItemType::Folder => {
                        let child = join_child(&relative_path, &item.name);
                        ctx.builder
                            .add_task(walk_directory(ctx.clone(), child))
                            .await
                            .map_err(|e| TransferError::internal(e.to_string()))?;
                    }
                    ItemType::File => {
                        let size = item.size.unwrap_or(0);
                        let file = item.file_representation();
                        if ctx.policy.should_delay(&file) {
                            ctx.delayed.append(file, size);
                            continue;
                        }
                        chunk.append_candidate(file, size, ctx.build_info_repo);
                        if chunk.is_full() {
                            ctx.dispatcher.dispatch(chunk.take()).await?;
                        }
                    }
                }
            }

            if !full_page {
                break;
            }
            page += 1;
        }

        if !chunk.is_empty() {
            ctx.dispatcher.dispatch(chunk.take()).await?;
        }
        debug!(repo = %ctx.repo_key, path = %relative_path, "directory done");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_paths_are_relative_to_repo_root() {
        assert_eq!(join_child(".", "libs"), "libs");
        assert_eq!(join_child("libs", "acme"), "libs/acme");
        assert_eq!(join_child("libs/acme", "1.0"), "libs/acme/1.0");
    }
}
