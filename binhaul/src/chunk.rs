//! Upload chunk assembly.
//!
//! A chunk is the unit the target plugin accepts in a single call: up to
//! [`UPLOAD_CHUNK_SIZE`](crate::UPLOAD_CHUNK_SIZE) file references plus the
//! target authentication payload. Sizes ride along internally so counters can
//! be attributed once the target reports per-file outcomes; they are not part
//! of the wire body.

use serde::Serialize;

use crate::UPLOAD_CHUNK_SIZE;
use crate::api::types::{FileRepresentation, TargetAuth};

/// A file reference paired with the size reported by the source search.
#[derive(Debug, Clone)]
pub struct UploadCandidate {
    pub file: FileRepresentation,
    pub size: u64,
}

/// An in-progress batch of upload candidates.
#[derive(Debug, Clone)]
pub struct UploadChunk {
    candidates: Vec<UploadCandidate>,
    pub check_existence_in_filestore: bool,
}

impl UploadChunk {
    pub fn new(check_existence_in_filestore: bool) -> Self {
        Self {
            candidates: Vec::with_capacity(UPLOAD_CHUNK_SIZE),
            check_existence_in_filestore,
        }
    }

    /// Append a candidate. Build-metadata repositories never receive
    /// directory placeholders, so those are dropped there.
    ///
    /// Returns whether the candidate was actually added.
    pub fn append_candidate(
        &mut self,
        file: FileRepresentation,
        size: u64,
        build_info_repo: bool,
    ) -> bool {
        if build_info_repo && file.is_placeholder() {
            return false;
        }
        self.candidates.push(UploadCandidate { file, size });
        true
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.candidates.len() >= UPLOAD_CHUNK_SIZE
    }

    /// Drain this chunk into an owned one ready for upload, leaving an empty
    /// chunk with the same flags behind.
    pub fn take(&mut self) -> UploadChunk {
        UploadChunk {
            candidates: std::mem::take(&mut self.candidates),
            check_existence_in_filestore: self.check_existence_in_filestore,
        }
    }

    pub fn candidates(&self) -> &[UploadCandidate] {
        &self.candidates
    }

    pub fn into_candidates(self) -> Vec<UploadCandidate> {
        self.candidates
    }

    pub fn total_size(&self) -> u64 {
        self.candidates.iter().map(|c| c.size).sum()
    }

    /// Wire body sent to the target plugin.
    pub fn wire_body(&self, auth: &TargetAuth) -> UploadChunkBody {
        UploadChunkBody {
            target_auth: auth.clone(),
            check_existence_in_filestore: self.check_existence_in_filestore,
            upload_candidates: self.candidates.iter().map(|c| c.file.clone()).collect(),
        }
    }
}

/// JSON body of `uploadChunk`.
#[derive(Debug, Clone, Serialize)]
pub struct UploadChunkBody {
    pub target_auth: TargetAuth,
    pub check_existence_in_filestore: bool,
    pub upload_candidates: Vec<FileRepresentation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(n: usize) -> FileRepresentation {
        FileRepresentation::file("repo1", "dir", format!("f{n}.bin"))
    }

    #[test]
    fn fills_at_chunk_size() {
        let mut chunk = UploadChunk::new(false);
        for n in 0..UPLOAD_CHUNK_SIZE {
            assert!(!chunk.is_full());
            chunk.append_candidate(file(n), 10, false);
        }
        assert!(chunk.is_full());
        assert_eq!(chunk.len(), UPLOAD_CHUNK_SIZE);
        assert_eq!(chunk.total_size(), 10 * UPLOAD_CHUNK_SIZE as u64);
    }

    #[test]
    fn take_resets_but_keeps_flags() {
        let mut chunk = UploadChunk::new(true);
        chunk.append_candidate(file(0), 1, false);
        let taken = chunk.take();
        assert_eq!(taken.len(), 1);
        assert!(taken.check_existence_in_filestore);
        assert!(chunk.is_empty());
        assert!(chunk.check_existence_in_filestore);
    }

    #[test]
    fn build_info_repo_drops_placeholders() {
        let mut chunk = UploadChunk::new(false);
        let placeholder = FileRepresentation::folder_placeholder("repo1", "empty");
        assert!(!chunk.append_candidate(placeholder.clone(), 0, true));
        assert!(chunk.is_empty());
        assert!(chunk.append_candidate(placeholder, 0, false));
        assert_eq!(chunk.len(), 1);
    }

    #[test]
    fn wire_body_carries_references_only() {
        let mut chunk = UploadChunk::new(false);
        chunk.append_candidate(file(0), 123, false);
        let auth = TargetAuth {
            url: "https://dst.example.com".to_string(),
            username: "admin".to_string(),
            password: "pw".to_string(),
            access_token: None,
        };
        let body = serde_json::to_value(chunk.wire_body(&auth)).unwrap();
        assert_eq!(body["upload_candidates"][0]["name"], "f0.bin");
        assert!(body["upload_candidates"][0].get("size").is_none());
        assert_eq!(body["target_auth"]["username"], "admin");
    }
}
