//! The error recovery phase.
//!
//! Replays failure manifests left behind by earlier runs. Every entry goes
//! through the regular upload pipeline; failures observed now land in this
//! run's manifest, and the consumed files are deleted once the replay
//! completes, so an entry that finally succeeded is simply no longer listed.
//! Runs last so failures recorded by this run's sweeps are not prematurely
//! reclassified.

use tracing::{info, warn};

use super::{PhaseBase, upload_by_chunks};
use crate::chunk::UploadCandidate;
use crate::delay::DelayPolicy;
use crate::manifest::read_prior_manifests;
use crate::pipeline::TransferPipeline;
use crate::Result;

pub struct ErrorRecoveryPhase {
    base: PhaseBase,
}

impl ErrorRecoveryPhase {
    pub fn new(base: PhaseBase) -> Self {
        Self { base }
    }

    pub async fn run(&self) -> Result<()> {
        let errors_dir = self.base.state.errors_dir(&self.base.repo_key);
        let manifests = read_prior_manifests(&errors_dir, self.base.state.run_id()).await?;
        if manifests.is_empty() {
            info!(repo = %self.base.repo_key, "no prior failures to retry");
            return Ok(());
        }
        let entries: usize = manifests.iter().map(|(_, records)| records.len()).sum();
        info!(
            repo = %self.base.repo_key,
            manifests = manifests.len(),
            entries,
            "retrying previously failed uploads"
        );

        let pipeline = TransferPipeline::start(&self.base.pipeline_context());
        let stop = pipeline.stop_token();
        let policy = DelayPolicy::none();
        {
            let dispatcher = pipeline.dispatcher();
            for (_, records) in &manifests {
                let candidates: Vec<UploadCandidate> = records
                    .iter()
                    .map(|record| UploadCandidate {
                        file: record.file.clone(),
                        // Prior-run manifests carry no sizes; counters only
                        // move for files the summary already accounted for.
                        size: 0,
                    })
                    .collect();
                if upload_by_chunks(
                    candidates,
                    &dispatcher,
                    &policy,
                    None,
                    self.base.build_info_repo,
                    self.base.check_existence_in_filestore,
                    &stop,
                )
                .await?
                {
                    break;
                }
            }
        }

        pipeline.drain_builders().await;
        pipeline.finish().await?;

        if !stop.is_cancelled() {
            for (path, _) in manifests {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "removing consumed manifest failed");
                }
            }
        }
        Ok(())
    }
}
