//! Wire model shared by the source search API and the target plugin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServerDetails;

/// A transferable unit. `name` is empty for a directory placeholder, which
/// the target materializes as an empty directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRepresentation {
    pub repo: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
}

impl FileRepresentation {
    pub fn file(
        repo: impl Into<String>,
        path: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            path: path.into(),
            name: name.into(),
        }
    }

    /// Placeholder that stands for an empty directory.
    pub fn folder_placeholder(repo: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            path: path.into(),
            name: String::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.name.is_empty()
    }

    /// `repo/path/name` form used in logs and manifests.
    pub fn full_path(&self) -> String {
        let mut out = self.repo.clone();
        for part in [self.path.as_str(), self.name.as_str()] {
            if !part.is_empty() && part != "." {
                out.push('/');
                out.push_str(part);
            }
        }
        out
    }
}

/// Item kind as reported by the source search API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Folder,
}

/// One row of a source search result page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    pub repo: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl SearchItem {
    pub fn file_representation(&self) -> FileRepresentation {
        FileRepresentation::file(&self.repo, &self.path, &self.name)
    }
}

/// Totals and package type of a source repository, used to seed per-repo
/// counters before the first phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSummary {
    pub files_count: u64,
    pub used_space_bytes: u64,
    #[serde(default)]
    pub package_type: PackageType,
    /// Repositories holding build metadata get placeholder-free chunks.
    #[serde(default)]
    pub build_info: bool,
}

/// Package type of a repository, driving the delayed-upload policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Maven,
    Gradle,
    Ivy,
    Sbt,
    Npm,
    Nuget,
    Docker,
    #[default]
    #[serde(other)]
    Generic,
}

/// Target authentication payload carried inside every chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetAuth {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl TargetAuth {
    pub fn from_details(details: &ServerDetails) -> Self {
        Self {
            url: details.url.clone(),
            username: details.username.clone(),
            password: details.password.clone(),
            access_token: details.access_token.clone(),
        }
    }
}

/// Opaque handle the target returns when it accepts a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkToken(pub String);

impl std::fmt::Display for ChunkToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-file outcome inside a DONE chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileOutcome {
    Success,
    Skipped,
    Fail,
}

/// One file's status inside a chunk status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatusRecord {
    #[serde(flatten)]
    pub file: FileRepresentation,
    pub status: FileOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Normalized chunk poll result.
#[derive(Debug, Clone)]
pub enum ChunkPoll {
    InProgress,
    Done(Vec<FileStatusRecord>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_has_empty_name() {
        let placeholder = FileRepresentation::folder_placeholder("repo1", "a/b");
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.full_path(), "repo1/a/b");

        let file = FileRepresentation::file("repo1", ".", "a.bin");
        assert!(!file.is_placeholder());
        assert_eq!(file.full_path(), "repo1/a.bin");
    }

    #[test]
    fn search_item_deserializes_with_type_field() {
        let item: SearchItem = serde_json::from_str(
            r#"{"repo":"r","path":"dir","name":"f.jar","type":"file","size":42}"#,
        )
        .unwrap();
        assert_eq!(item.item_type, ItemType::File);
        assert_eq!(item.size, Some(42));
        assert!(item.modified.is_none());
    }

    #[test]
    fn unknown_package_type_falls_back_to_generic() {
        let summary: RepoSummary = serde_json::from_str(
            r#"{"files_count":1,"used_space_bytes":2,"package_type":"conan"}"#,
        )
        .unwrap();
        assert_eq!(summary.package_type, PackageType::Generic);
        assert!(!summary.build_info);
    }

    #[test]
    fn file_status_record_flattens_file_fields() {
        let record: FileStatusRecord = serde_json::from_str(
            r#"{"repo":"r","path":"p","name":"n","status":"SKIPPED","reason":"already exists"}"#,
        )
        .unwrap();
        assert_eq!(record.status, FileOutcome::Skipped);
        assert_eq!(record.file.name, "n");
    }
}
