//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::{Result, TransferError};

/// Default number of workers per pool (chunk builders and chunk uploaders).
pub const DEFAULT_THREADS: usize = 8;

/// Default interval between chunk status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between periodic state snapshots.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Oldest target plugin version the engine can talk to.
pub const MIN_PLUGIN_VERSION: &str = "1.4.0";

/// Connection details of one service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDetails {
    /// Base URL, e.g. `https://repo.example.com/`.
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Access token, preferred over username/password when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl ServerDetails {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: String::new(),
            password: String::new(),
            access_token: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Join an API path onto the base URL, normalizing slashes.
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Everything the engine needs to run a transfer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Source service, the one being read.
    pub source: ServerDetails,
    /// Target service, the one being written. Must have the transfer plugin
    /// installed.
    pub target: ServerDetails,
    /// Directory under which the `transfer` state subdirectory is kept.
    pub home_dir: PathBuf,
    /// Workers per pool. Both the chunk-builder and chunk-uploader pools use
    /// this count.
    pub threads: usize,
    /// Interval between chunk status polls against the target.
    pub poll_interval: Duration,
    /// Interval between periodic state snapshots.
    pub autosave_interval: Duration,
    /// Minimum acceptable target plugin version (dotted numeric).
    pub min_plugin_version: String,
    /// Ask the target to look the checksum up in its filestore before
    /// requesting the bytes.
    pub check_existence_in_filestore: bool,
    /// Re-run phases already marked completed.
    pub force: bool,
    pub verbose: bool,
    /// Only repositories matching one of these globs are transferred.
    /// Empty means all.
    pub include_repo_patterns: Vec<String>,
    /// Repositories matching one of these globs are skipped.
    pub exclude_repo_patterns: Vec<String>,
}

impl TransferConfig {
    pub fn new(source: ServerDetails, target: ServerDetails, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            target,
            home_dir: home_dir.into(),
            threads: DEFAULT_THREADS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
            min_plugin_version: MIN_PLUGIN_VERSION.to_string(),
            check_existence_in_filestore: false,
            force: false,
            verbose: false,
            include_repo_patterns: Vec::new(),
            exclude_repo_patterns: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.url.trim().is_empty() {
            return Err(TransferError::config("source URL is empty"));
        }
        if self.target.url.trim().is_empty() {
            return Err(TransferError::config("target URL is empty"));
        }
        if self.threads == 0 {
            return Err(TransferError::config("threads must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(TransferError::config("poll interval must be non-zero"));
        }
        // Surface bad glob patterns before any phase starts.
        self.repo_filter()?;
        Ok(())
    }

    /// Compile the include/exclude patterns into a matcher.
    pub fn repo_filter(&self) -> Result<RepoFilter> {
        RepoFilter::new(&self.include_repo_patterns, &self.exclude_repo_patterns)
    }

    /// State root: `<home>/transfer`.
    pub fn transfer_dir(&self) -> PathBuf {
        self.home_dir.join("transfer")
    }
}

/// Compiled include/exclude repository matcher.
#[derive(Debug)]
pub struct RepoFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl RepoFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: Self::build(include)?,
            exclude: Self::build(exclude)?,
        })
    }

    fn build(patterns: &[String]) -> Result<Option<GlobSet>> {
        if patterns.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                TransferError::config(format!("invalid repository pattern `{pattern}`: {e}"))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| TransferError::config(format!("invalid repository patterns: {e}")))?;
        Ok(Some(set))
    }

    pub fn matches(&self, repo_key: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(repo_key) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(repo_key),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransferConfig {
        TransferConfig::new(
            ServerDetails::new("https://src.example.com").with_credentials("admin", "s3cr3t"),
            ServerDetails::new("https://dst.example.com/").with_access_token("tok"),
            "/tmp/binhaul-home",
        )
    }

    #[test]
    fn api_url_normalizes_slashes() {
        let details = ServerDetails::new("https://dst.example.com/");
        assert_eq!(
            details.api_url("/api/plugins/execute/uploadChunk"),
            "https://dst.example.com/api/plugins/execute/uploadChunk"
        );
    }

    #[test]
    fn defaults_validate() {
        config().validate().unwrap();
    }

    #[test]
    fn zero_threads_rejected() {
        let mut cfg = config();
        cfg.threads = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_glob_rejected() {
        let mut cfg = config();
        cfg.include_repo_patterns = vec!["libs-[".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn repo_filter_include_exclude() {
        let filter = RepoFilter::new(
            &["libs-*".to_string()],
            &["libs-snapshot*".to_string()],
        )
        .unwrap();
        assert!(filter.matches("libs-release-local"));
        assert!(!filter.matches("libs-snapshot-local"));
        assert!(!filter.matches("docker-local"));

        let open = RepoFilter::new(&[], &[]).unwrap();
        assert!(open.matches("anything"));
    }
}
