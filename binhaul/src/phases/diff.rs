//! The files diff phase.
//!
//! Catches up with files created or modified while (and after) the full
//! sweep ran. The handled range is split into fixed-width windows so each
//! search stays within the source's pagination limits and progress remains
//! observable; window tasks run on the chunk-builder pool and may overlap
//! freely, while results inside one window arrive in modification order.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{PhaseBase, upload_by_chunks};
use crate::api::SourceApi;
use crate::api::types::ItemType;
use crate::chunk::UploadCandidate;
use crate::delay::{DelayPolicy, DelayedArtifactsWriter};
use crate::pipeline::{ChunkDispatcher, TransferPipeline};
use crate::state::{PhaseKind, TimeRange};
use crate::{DIFF_WINDOW_MINUTES, Result, SEARCH_PAGE_LIMIT, TransferError};

pub struct FilesDiffPhase {
    base: PhaseBase,
}

impl FilesDiffPhase {
    pub fn new(base: PhaseBase) -> Self {
        Self { base }
    }

    pub async fn run(&self) -> Result<()> {
        let range = self.base.state.get_diff_handling_range(&self.base.repo_key)?;
        let windows = split_windows(range);
        if windows.is_empty() {
            debug!(repo = %self.base.repo_key, "empty diff range, nothing to handle");
            return Ok(());
        }
        info!(
            repo = %self.base.repo_key,
            windows = windows.len(),
            from = %range.start,
            to = %range.end,
            "handling files diffs"
        );

        let delayed = Arc::new(self.base.delayed_writer(PhaseKind::FilesDiff));
        let pipeline = TransferPipeline::start(&self.base.pipeline_context());

        let scan = Arc::new(ScanContext {
            repo_key: self.base.repo_key.clone(),
            build_info_repo: self.base.build_info_repo,
            check_existence_in_filestore: self.base.check_existence_in_filestore,
            source: self.base.source.clone(),
            dispatcher: pipeline.dispatcher(),
            policy: DelayPolicy::for_package_type(self.base.package_type),
            delayed: delayed.clone(),
            stop: pipeline.stop_token(),
        });
        for window in windows {
            if scan.stop.is_cancelled() {
                break;
            }
            let scan = scan.clone();
            pipeline
                .builder()
                .add_task(async move { scan_window(scan, window).await })
                .await
                .map_err(|e| TransferError::internal(e.to_string()))?;
        }
        pipeline.drain_builders().await;
        drop(scan);

        self.base.replay_delayed(&pipeline, &delayed).await?;

        let stop = pipeline.stop_token();
        pipeline.finish().await?;
        if !stop.is_cancelled() {
            self.base.discard_spill(&delayed).await;
            info!(repo = %self.base.repo_key, "done handling files diffs");
        }
        Ok(())
    }
}

/// Split a half-open range into consecutive windows of at most
/// [`DIFF_WINDOW_MINUTES`]; their union is exactly the input range.
pub(crate) fn split_windows(range: TimeRange) -> Vec<TimeRange> {
    let width = chrono::Duration::minutes(DIFF_WINDOW_MINUTES);
    let mut windows = Vec::new();
    let mut cursor = range.start;
    while cursor < range.end {
        let end = (cursor + width).min(range.end);
        windows.push(TimeRange { start: cursor, end });
        cursor = end;
    }
    windows
}

struct ScanContext {
    repo_key: String,
    build_info_repo: bool,
    check_existence_in_filestore: bool,
    source: Arc<dyn SourceApi>,
    dispatcher: ChunkDispatcher,
    policy: DelayPolicy,
    delayed: Arc<DelayedArtifactsWriter>,
    stop: CancellationToken,
}

/// Chunk-builder task scanning one time window, page by page.
async fn scan_window(ctx: Arc<ScanContext>, window: TimeRange) -> Result<()> {
    if ctx.stop.is_cancelled() {
        return Ok(());
    }
    debug!(
        repo = %ctx.repo_key,
        from = %window.start,
        to = %window.end,
        "scanning time window"
    );

    let mut page = 0usize;
    loop {
        if ctx.stop.is_cancelled() {
            return Ok(());
        }
        let items = ctx
            .source
            .diff_window(&ctx.repo_key, window.start, window.end, page)
            .await?;
        if items.is_empty() {
            if page == 0 {
                debug!(from = %window.start, to = %window.end, "no diffs in window");
            }
            return Ok(());
        }

        let full_page = items.len() >= SEARCH_PAGE_LIMIT;
        let candidates: Vec<UploadCandidate> = items
            .into_iter()
            .filter(|item| item.item_type == ItemType::File)
            .map(|item| UploadCandidate {
                size: item.size.unwrap_or(0),
                file: item.file_representation(),
            })
            .collect();
        let stopped = upload_by_chunks(
            candidates,
            &ctx.dispatcher,
            &ctx.policy,
            Some(&ctx.delayed),
            ctx.build_info_repo,
            ctx.check_existence_in_filestore,
            &ctx.stop,
        )
        .await?;
        if stopped || !full_page {
            return Ok(());
        }
        page += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(h: u32, min: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, min, 0).unwrap()
    }

    #[test]
    fn windows_tile_the_range_exactly() {
        let range = TimeRange {
            start: at(10, 0),
            end: at(11, 40),
        };
        let windows = split_windows(range);
        // 100 minutes: six full windows and one 10-minute remainder.
        assert_eq!(windows.len(), 7);
        assert_eq!(windows[0].start, range.start);
        assert_eq!(windows.last().unwrap().end, range.end);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(windows[6].end - windows[6].start, chrono::Duration::minutes(10));
    }

    #[test]
    fn short_range_is_a_single_window() {
        let range = TimeRange {
            start: at(10, 0),
            end: at(10, 0) + chrono::Duration::seconds(1),
        };
        let windows = split_windows(range);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0], range);
    }

    #[test]
    fn empty_range_has_no_windows() {
        let range = TimeRange {
            start: at(10, 0),
            end: at(10, 0),
        };
        assert!(split_windows(range).is_empty());
    }
}
