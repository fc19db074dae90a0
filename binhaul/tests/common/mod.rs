//! In-memory source and target fakes for end-to-end engine tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use binhaul::api::types::{
    ChunkPoll, ChunkToken, FileOutcome, FileRepresentation, FileStatusRecord, ItemType,
    PackageType, RepoSummary, SearchItem,
};
use binhaul::api::{SourceApi, TargetApi};
use binhaul::chunk::UploadChunk;
use binhaul::Result;

/// Route engine logs through the capture-aware test writer. Safe to call
/// from every test; only the first call installs the subscriber.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("binhaul=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// One file of the fake source tree.
#[derive(Debug, Clone)]
pub struct FakeFile {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// A fake source service holding a single repository's tree in memory.
pub struct FakeSource {
    pub repo_key: String,
    pub package_type: PackageType,
    files: Mutex<Vec<FakeFile>>,
    /// Directories that exist but hold no content.
    empty_dirs: Mutex<Vec<String>>,
    /// Files whose mtime is bumped when a listing touches them, simulating a
    /// writer racing the sweep.
    touch_on_list: Mutex<Vec<(String, String)>>,
}

impl FakeSource {
    pub fn new(repo_key: &str) -> Arc<Self> {
        Arc::new(Self {
            repo_key: repo_key.to_string(),
            package_type: PackageType::Generic,
            files: Mutex::new(Vec::new()),
            empty_dirs: Mutex::new(Vec::new()),
            touch_on_list: Mutex::new(Vec::new()),
        })
    }

    /// Bump the file's mtime to "now" when the sweep lists its directory.
    pub fn touch_during_listing(&self, path: &str, name: &str) {
        self.touch_on_list
            .lock()
            .push((path.to_string(), name.to_string()));
    }

    pub fn add_file(&self, path: &str, name: &str, size: u64, modified: DateTime<Utc>) {
        self.files.lock().push(FakeFile {
            path: path.to_string(),
            name: name.to_string(),
            size,
            modified,
        });
    }

    pub fn add_empty_dir(&self, path: &str) {
        self.empty_dirs.lock().push(path.to_string());
    }

    pub fn file_count(&self) -> u64 {
        self.files.lock().len() as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.lock().iter().map(|f| f.size).sum()
    }

    fn subdirectories_of(&self, parent: &str) -> Vec<String> {
        let mut dirs: HashSet<String> = HashSet::new();
        let child_of = |full: &str| -> Option<String> {
            if parent == "." {
                Some(full.split('/').next().unwrap_or(full).to_string())
            } else {
                let rest = full.strip_prefix(parent)?.strip_prefix('/')?;
                Some(rest.split('/').next().map(str::to_string).unwrap_or_default())
            }
        };
        for file in self.files.lock().iter() {
            if file.path == parent || file.path == "." {
                continue;
            }
            if let Some(child) = child_of(&file.path) {
                if !child.is_empty() {
                    dirs.insert(child);
                }
            }
        }
        for dir in self.empty_dirs.lock().iter() {
            if dir == parent {
                continue;
            }
            if let Some(child) = child_of(dir) {
                if !child.is_empty() {
                    dirs.insert(child);
                }
            }
        }
        let mut dirs: Vec<String> = dirs.into_iter().collect();
        dirs.sort();
        dirs
    }
}

#[async_trait]
impl SourceApi for FakeSource {
    async fn repo_summary(&self, _repo_key: &str) -> Result<RepoSummary> {
        Ok(RepoSummary {
            files_count: self.file_count(),
            used_space_bytes: self.total_bytes(),
            package_type: self.package_type,
            build_info: false,
        })
    }

    async fn list_directory(
        &self,
        repo_key: &str,
        relative_path: &str,
        page: usize,
    ) -> Result<Vec<SearchItem>> {
        if page > 0 {
            return Ok(Vec::new());
        }
        {
            let touched = self.touch_on_list.lock();
            let mut files = self.files.lock();
            for file in files.iter_mut() {
                if touched.iter().any(|(p, n)| p == &file.path && n == &file.name) {
                    file.modified = Utc::now();
                }
            }
        }
        // Sorted map gives the ascending-by-name ordering of the real API.
        let mut items: BTreeMap<String, SearchItem> = BTreeMap::new();
        for dir in self.subdirectories_of(relative_path) {
            items.insert(
                dir.clone(),
                SearchItem {
                    repo: repo_key.to_string(),
                    path: relative_path.to_string(),
                    name: dir,
                    item_type: ItemType::Folder,
                    modified: None,
                    size: None,
                },
            );
        }
        for file in self.files.lock().iter().filter(|f| f.path == relative_path) {
            items.insert(
                file.name.clone(),
                SearchItem {
                    repo: repo_key.to_string(),
                    path: file.path.clone(),
                    name: file.name.clone(),
                    item_type: ItemType::File,
                    modified: Some(file.modified),
                    size: Some(file.size),
                },
            );
        }
        Ok(items.into_values().collect())
    }

    async fn diff_window(
        &self,
        repo_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: usize,
    ) -> Result<Vec<SearchItem>> {
        if page > 0 {
            return Ok(Vec::new());
        }
        let mut items: Vec<SearchItem> = self
            .files
            .lock()
            .iter()
            .filter(|f| f.modified >= from && f.modified < to)
            .map(|f| SearchItem {
                repo: repo_key.to_string(),
                path: f.path.clone(),
                name: f.name.clone(),
                item_type: ItemType::File,
                modified: Some(f.modified),
                size: Some(f.size),
            })
            .collect();
        items.sort_by_key(|i| i.modified);
        Ok(items)
    }
}

/// A fake target plugin that accepts chunks and reports outcomes instantly.
pub struct FakeTarget {
    chunks: Mutex<Vec<Vec<FileRepresentation>>>,
    /// Files the target already holds; uploads of these report SKIPPED.
    present: Mutex<HashSet<FileRepresentation>>,
    /// Files that fail with the given status code and reason.
    failing: Mutex<Vec<(FileRepresentation, u16, String)>>,
}

impl FakeTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chunks: Mutex::new(Vec::new()),
            present: Mutex::new(HashSet::new()),
            failing: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_file(&self, file: FileRepresentation, status_code: u16, reason: &str) {
        self.failing.lock().push((file, status_code, reason.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn uploaded_chunks(&self) -> Vec<Vec<FileRepresentation>> {
        self.chunks.lock().clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Distinct non-placeholder files seen across all chunks.
    pub fn uploaded_files(&self) -> HashSet<FileRepresentation> {
        self.chunks
            .lock()
            .iter()
            .flatten()
            .filter(|f| !f.is_placeholder())
            .cloned()
            .collect()
    }

    pub fn placeholder_count(&self) -> usize {
        self.chunks
            .lock()
            .iter()
            .flatten()
            .filter(|f| f.is_placeholder())
            .count()
    }

    fn outcome_for(&self, file: &FileRepresentation) -> FileStatusRecord {
        if let Some((_, code, reason)) = self
            .failing
            .lock()
            .iter()
            .find(|(failing, _, _)| failing == file)
        {
            return FileStatusRecord {
                file: file.clone(),
                status: FileOutcome::Fail,
                status_code: Some(*code),
                reason: Some(reason.clone()),
            };
        }
        let already_present = !self.present.lock().insert(file.clone());
        FileStatusRecord {
            file: file.clone(),
            status: if already_present {
                FileOutcome::Skipped
            } else {
                FileOutcome::Success
            },
            status_code: None,
            reason: None,
        }
    }
}

#[async_trait]
impl TargetApi for FakeTarget {
    async fn plugin_version(&self) -> Result<String> {
        Ok("9.9.9".to_string())
    }

    async fn upload_chunk(&self, chunk: &UploadChunk) -> Result<ChunkToken> {
        let files: Vec<FileRepresentation> =
            chunk.candidates().iter().map(|c| c.file.clone()).collect();
        let mut chunks = self.chunks.lock();
        chunks.push(files);
        Ok(ChunkToken(format!("token-{}", chunks.len())))
    }

    async fn chunk_status(&self, token: &ChunkToken) -> Result<ChunkPoll> {
        let index: usize = token
            .0
            .trim_start_matches("token-")
            .parse()
            .expect("fake token format");
        let files = self.chunks.lock()[index - 1].clone();
        Ok(ChunkPoll::Done(
            files.iter().map(|f| self.outcome_for(f)).collect(),
        ))
    }

    async fn recommended_threads(&self) -> Result<Option<usize>> {
        Ok(None)
    }
}
