//! Deferred uploads for artifacts that must follow their peers.
//!
//! Metadata aggregates (package indexes, docker manifests) reference sibling
//! artifacts, so the target must receive them last. During a phase's primary
//! sweep, matching files are spilled to a side file instead of being chunked;
//! the phase replays the spill once the sweep drains, before its completion
//! is persisted. Replay runs with an empty policy, so a file is delayed at
//! most once per run.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::types::{FileRepresentation, PackageType};
use crate::chunk::UploadCandidate;
use crate::state::PhaseKind;
use crate::utils::fs::write_json_atomic;
use crate::Result;

/// Filename predicates deciding which uploads to defer.
#[derive(Debug, Clone, Default)]
pub struct DelayPolicy {
    name_suffixes: Vec<&'static str>,
}

impl DelayPolicy {
    /// No deferral. Used for replay and for the error recovery phase.
    pub fn none() -> Self {
        Self::default()
    }

    /// The deferral rules of a repository's package type.
    pub fn for_package_type(package_type: PackageType) -> Self {
        let name_suffixes: Vec<&'static str> = match package_type {
            PackageType::Maven | PackageType::Gradle | PackageType::Ivy | PackageType::Sbt => {
                vec![
                    "maven-metadata.xml",
                    "maven-metadata.xml.md5",
                    "maven-metadata.xml.sha1",
                    "maven-metadata.xml.sha256",
                ]
            }
            PackageType::Docker => vec!["manifest.json", "list.manifest.json"],
            PackageType::Npm | PackageType::Nuget | PackageType::Generic => Vec::new(),
        };
        Self { name_suffixes }
    }

    pub fn should_delay(&self, file: &FileRepresentation) -> bool {
        !file.is_placeholder()
            && self
                .name_suffixes
                .iter()
                .any(|suffix| file.name.ends_with(suffix))
    }

    pub fn is_empty(&self) -> bool {
        self.name_suffixes.is_empty()
    }
}

/// A deferred file together with the size the source reported for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedArtifact {
    #[serde(flatten)]
    pub file: FileRepresentation,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SpillFile {
    #[serde(default)]
    delayed: Vec<DelayedArtifact>,
}

struct SpillState {
    records: Vec<DelayedArtifact>,
    dirty: bool,
}

/// Spill file of deferred uploads for one phase of one repository.
pub struct DelayedArtifactsWriter {
    path: PathBuf,
    state: Mutex<SpillState>,
}

impl DelayedArtifactsWriter {
    pub fn new(delayed_dir: &Path, phase: PhaseKind) -> Self {
        let file_name = match phase {
            PhaseKind::FullTransfer => "full_transfer.json",
            PhaseKind::FilesDiff => "files_diff.json",
            PhaseKind::ErrorRecovery => "error_recovery.json",
        };
        Self {
            path: delayed_dir.join(file_name),
            state: Mutex::new(SpillState {
                records: Vec::new(),
                dirty: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, file: FileRepresentation, size: u64) {
        debug!(file = %file.full_path(), "upload delayed until peers finish");
        let mut state = self.state.lock();
        state.records.push(DelayedArtifact { file, size });
        state.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Rewrite the spill file if records were appended since the last flush.
    /// The file is only created once something was deferred.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.records.clone()
        };
        write_json_atomic(&self.path, &SpillFile { delayed: snapshot }).await
    }

    /// Deferred uploads as chunk candidates, for replay.
    pub fn candidates(&self) -> Vec<UploadCandidate> {
        self.state
            .lock()
            .records
            .iter()
            .map(|d| UploadCandidate {
                file: d.file.clone(),
                size: d.size,
            })
            .collect()
    }

    /// Remove the spill file after a successful replay.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::utils::fs::io_error("removing", &self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maven_family_delays_metadata_aggregates() {
        let policy = DelayPolicy::for_package_type(PackageType::Maven);
        let metadata = FileRepresentation::file("libs", "org/acme/lib", "maven-metadata.xml");
        let checksum = FileRepresentation::file("libs", "org/acme/lib", "maven-metadata.xml.sha1");
        let jar = FileRepresentation::file("libs", "org/acme/lib/1.0", "lib-1.0.jar");

        assert!(policy.should_delay(&metadata));
        assert!(policy.should_delay(&checksum));
        assert!(!policy.should_delay(&jar));
    }

    #[test]
    fn docker_delays_manifests() {
        let policy = DelayPolicy::for_package_type(PackageType::Docker);
        let manifest = FileRepresentation::file("docker", "app/latest", "manifest.json");
        let layer = FileRepresentation::file("docker", "app/latest", "sha256__abc");

        assert!(policy.should_delay(&manifest));
        assert!(!policy.should_delay(&layer));
    }

    #[test]
    fn generic_and_empty_policies_delay_nothing() {
        let generic = DelayPolicy::for_package_type(PackageType::Generic);
        let metadata = FileRepresentation::file("gen", "x", "maven-metadata.xml");
        assert!(!generic.should_delay(&metadata));
        assert!(generic.is_empty());
        assert!(!DelayPolicy::none().should_delay(&metadata));
    }

    #[test]
    fn placeholders_are_never_delayed() {
        let policy = DelayPolicy::for_package_type(PackageType::Maven);
        let placeholder = FileRepresentation::folder_placeholder("libs", "org/acme");
        assert!(!policy.should_delay(&placeholder));
    }

    #[tokio::test]
    async fn spill_file_created_on_demand_and_replayable() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DelayedArtifactsWriter::new(dir.path(), PhaseKind::FullTransfer);

        writer.flush().await.unwrap();
        assert!(!writer.path().exists());

        writer.append(
            FileRepresentation::file("libs", "org/acme", "maven-metadata.xml"),
            321,
        );
        writer.flush().await.unwrap();
        assert!(writer.path().exists());

        let candidates = writer.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].size, 321);

        writer.remove().await.unwrap();
        assert!(!writer.path().exists());
    }
}
