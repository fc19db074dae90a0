//! Offline status report rendered from persisted state.
//!
//! Reads the state files directly, so it works while another process runs
//! the transfer (or after one stopped). No engine instance is needed.

use std::fmt::Write as _;
use std::path::Path;

use crate::Result;
use crate::state::{PhaseKind, RepoState, RunState};
use crate::utils::fs::read_json;

/// Render a human-readable status summary for a transfer directory.
pub async fn show_status(transfer_dir: &Path) -> Result<String> {
    let run: Option<RunState> = read_json(&transfer_dir.join("state.json")).await?;
    let Some(run) = run.filter(|r| r.running) else {
        return Ok("Status:\tNot running\n".to_string());
    };

    let mut out = String::new();
    let _ = writeln!(out, "Overall Transfer Status");
    let _ = writeln!(out, "Status:\tRunning");
    if let Some(start) = run.start_time {
        let _ = writeln!(out, "Start time:\t{}", start.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    let _ = writeln!(
        out,
        "Storage:\t{} / {} ({})",
        size_to_string(run.transferred_size_bytes),
        size_to_string(run.total_size_bytes),
        percentage(run.transferred_size_bytes, run.total_size_bytes)
    );
    let _ = writeln!(
        out,
        "Repositories:\t{} / {} ({})",
        run.transferred_repositories,
        run.total_repositories,
        percentage(run.transferred_repositories, run.total_repositories)
    );
    let _ = writeln!(out, "Working threads:\t{}", run.working_threads);
    let _ = writeln!(out, "Transfer failures:\t{}", run.transfer_failures);

    if let Some(repo_key) = &run.current_repo {
        let repo: Option<RepoState> = read_json(
            &transfer_dir
                .join("repos")
                .join(repo_key)
                .join("state.json"),
        )
        .await?;

        let _ = writeln!(out);
        let _ = writeln!(out, "Current Repository Status");
        let _ = writeln!(out, "Name:\t{repo_key}");
        if let Some(phase) = run.current_phase {
            let _ = writeln!(out, "Phase:\t{}", phase.label());
            // Per-repository progress is only meaningful while the full
            // sweep runs; later phases re-confirm already-counted files.
            if phase == PhaseKind::FullTransfer {
                if let Some(repo) = repo {
                    let _ = writeln!(
                        out,
                        "Storage:\t{} / {} ({})",
                        size_to_string(repo.transferred_size_bytes),
                        size_to_string(repo.total_size_bytes),
                        percentage(repo.transferred_size_bytes, repo.total_size_bytes)
                    );
                    let _ = writeln!(
                        out,
                        "Files:\t{} / {} ({})",
                        repo.transferred_units,
                        repo.total_units,
                        percentage(repo.transferred_units, repo.total_units)
                    );
                }
            }
        }
    }
    Ok(out)
}

const SIZE_UNITS: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Byte count as a binary-unit string with one decimal, KiB at minimum.
pub fn size_to_string(bytes: u64) -> String {
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", SIZE_UNITS[unit])
}

fn percentage(part: u64, total: u64) -> String {
    if total == 0 {
        return "0.0%".to_string();
    }
    format!("{:.1}%", part as f64 * 100.0 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TransferStateManager;

    #[test]
    fn sizes_render_in_binary_units() {
        let cases: [(u64, &str); 16] = [
            (0, "0.0 KiB"),
            (10, "0.0 KiB"),
            (100, "0.1 KiB"),
            (1000, "1.0 KiB"),
            (1024, "1.0 KiB"),
            (1025, "1.0 KiB"),
            (4000, "3.9 KiB"),
            (4096, "4.0 KiB"),
            (1_000_000, "976.6 KiB"),
            (1_048_576, "1.0 MiB"),
            (1_073_741_824, "1.0 GiB"),
            (1_099_511_627_776, "1.0 TiB"),
            (1_125_899_906_842_624, "1.0 PiB"),
            (1_152_921_504_606_846_976, "1.0 EiB"),
            (11_111, "10.9 KiB"),
            (5_000, "4.9 KiB"),
        ];
        for (bytes, expected) in cases {
            assert_eq!(size_to_string(bytes), expected, "bytes = {bytes}");
        }
    }

    #[test]
    fn percentages_have_one_decimal() {
        assert_eq!(percentage(5_000, 11_111), "45.0%");
        assert_eq!(percentage(15, 1_111), "1.4%");
        assert_eq!(percentage(500, 10_000), "5.0%");
        assert_eq!(percentage(0, 0), "0.0%");
    }

    async fn seeded_state(phase: PhaseKind) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let transfer_dir = dir.path().join("transfer");
        let manager = TransferStateManager::new(&transfer_dir);
        manager.mark_run_started(16);
        manager.set_total_repositories(1_111);
        manager.set_repo_state("repo1", 10_000, 10_000, false);
        manager.inc_transferred_size_and_files("repo1", 500, 5_000);
        manager.inc_transfer_failures("repo1", 223);
        manager.set_current(Some("repo1"), Some(phase));
        // Overall totals cover repositories beyond repo1.
        manager.set_repo_state("other", 0, 1_111, false);
        manager.save_state().await.unwrap();
        (dir, transfer_dir)
    }

    #[tokio::test]
    async fn status_without_state_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let report = show_status(dir.path()).await.unwrap();
        assert!(report.contains("Not running"));
    }

    #[tokio::test]
    async fn status_during_full_transfer_shows_repo_progress() {
        let (_dir, transfer_dir) = seeded_state(PhaseKind::FullTransfer).await;
        let report = show_status(&transfer_dir).await.unwrap();

        assert!(report.contains("Overall Transfer Status"));
        assert!(report.contains("Status:\tRunning"));
        assert!(report.contains("Start time:\t"));
        assert!(report.contains("Storage:\t4.9 KiB / 10.9 KiB (45.0%)"));
        assert!(report.contains("Working threads:\t16"));
        assert!(report.contains("Transfer failures:\t223"));

        assert!(report.contains("Current Repository Status"));
        assert!(report.contains("Name:\trepo1"));
        assert!(report.contains("Phase:\tTransferring all files in the repository (1/3)"));
        assert!(report.contains("Storage:\t4.9 KiB / 9.8 KiB (50.0%)"));
        assert!(report.contains("Files:\t500 / 10000 (5.0%)"));
    }

    #[tokio::test]
    async fn status_during_diff_omits_repo_progress() {
        let (_dir, transfer_dir) = seeded_state(PhaseKind::FilesDiff).await;
        let report = show_status(&transfer_dir).await.unwrap();

        assert!(report.contains("Phase:\tTransferring newly created and modified files (2/3)"));
        assert!(!report.contains("Files:\t500 / 10000 (5.0%)"));
        assert!(!report.contains("Storage:\t4.9 KiB / 9.8 KiB (50.0%)"));
    }
}
