//! Chunk uploads and asynchronous status polls against the target plugin.
//!
//! The plugin accepts a chunk of file references in one call, answers with an
//! opaque token, and is polled on a fixed interval until it reports per-file
//! outcomes. A 401/403 anywhere is the signature of target credentials having
//! been replaced by the separately-run config transfer; the client then
//! rebuilds its authentication from the source server's credentials and
//! retries instead of failing the run.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::client::{apply_auth, build_http_client};
use crate::api::retry::{Attempt, RetryPolicy, run_with_retries};
use crate::api::types::{ChunkPoll, ChunkToken, FileStatusRecord, TargetAuth};
use crate::chunk::UploadChunk;
use crate::config::ServerDetails;
use crate::{Result, TARGET_PLUGIN_NAME, TransferError};

/// Write-side contract the pipeline consumes.
#[async_trait]
pub trait TargetApi: Send + Sync {
    /// Version of the installed transfer plugin.
    async fn plugin_version(&self) -> Result<String>;

    /// Submit a chunk; returns the token to poll on.
    async fn upload_chunk(&self, chunk: &UploadChunk) -> Result<ChunkToken>;

    /// Poll an accepted chunk.
    async fn chunk_status(&self, token: &ChunkToken) -> Result<ChunkPoll>;

    /// Worker count the target currently recommends, if it exposes one.
    async fn recommended_threads(&self) -> Result<Option<usize>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ChunkStatusKind {
    InProgress,
    Done,
}

#[derive(Debug, Deserialize)]
struct ChunkStatusResponse {
    status: ChunkStatusKind,
    #[serde(default)]
    files: Vec<FileStatusRecord>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct ThreadsResponse {
    threads: usize,
}

/// HTTP implementation of [`TargetApi`].
pub struct HttpTargetClient {
    http: Client,
    /// Credentials currently used against the target. Swapped for the
    /// source's credentials after the first 401/403.
    auth: RwLock<ServerDetails>,
    source_details: ServerDetails,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl HttpTargetClient {
    pub fn new(
        target: ServerDetails,
        source: ServerDetails,
        threads: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            http: build_http_client(threads)?,
            auth: RwLock::new(target),
            source_details: source,
            retry: RetryPolicy::default(),
            cancel,
        })
    }

    fn plugin_url(&self, endpoint: &str) -> String {
        self.auth
            .read()
            .api_url(&format!("api/plugins/execute/{endpoint}"))
    }

    /// Keep the target URL, inherit the source's credentials.
    fn inherit_source_credentials(&self) {
        let mut auth = self.auth.write();
        auth.username = self.source_details.username.clone();
        auth.password = self.source_details.password.clone();
        auth.access_token = self.source_details.access_token.clone();
        info!("target rejected credentials, inheriting source server credentials");
    }

    /// Send a request with retry, backoff and one credential refresh.
    async fn execute(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
        operation: &'static str,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let reauthed = AtomicBool::new(false);
        run_with_retries(&self.retry, &self.cancel, |_| {
            let method = method.clone();
            let url = url.clone();
            let body = body.clone();
            let reauthed = &reauthed;
            async move {
                let details = self.auth.read().clone();
                let mut request = apply_auth(self.http.request(method, &url), &details);
                if let Some(body) = &body {
                    request = request.json(body);
                }

                let response = match request.send().await {
                    Ok(response) => response,
                    Err(e) => {
                        let err = TransferError::from(e);
                        return if err.is_retryable() {
                            Attempt::Again(err)
                        } else {
                            Attempt::Abort(err)
                        };
                    }
                };

                let status = response.status();
                let err = TransferError::http_status(status, &url, operation);
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    if reauthed.swap(true, Ordering::SeqCst) {
                        return Attempt::Abort(err);
                    }
                    self.inherit_source_credentials();
                    return Attempt::Again(err);
                }
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    return Attempt::Again(err);
                }
                if !status.is_success() {
                    return Attempt::Abort(err);
                }

                match response.bytes().await {
                    Ok(bytes) => Attempt::Done((status, bytes.to_vec())),
                    Err(e) => Attempt::Again(TransferError::from(e)),
                }
            }
        })
        .await
    }
}

#[async_trait]
impl TargetApi for HttpTargetClient {
    async fn plugin_version(&self) -> Result<String> {
        let url = self.plugin_url(&format!("{TARGET_PLUGIN_NAME}Version"));
        let (_, bytes) = self
            .execute(Method::GET, url, None, "fetching plugin version")
            .await
            .map_err(|e| TransferError::plugin(format!("version endpoint unreachable: {e}")))?;

        if let Ok(parsed) = serde_json::from_slice::<VersionResponse>(&bytes) {
            return Ok(parsed.version);
        }
        let text = String::from_utf8_lossy(&bytes)
            .trim()
            .trim_matches('"')
            .to_string();
        if text.is_empty() {
            return Err(TransferError::plugin("empty version response"));
        }
        Ok(text)
    }

    async fn upload_chunk(&self, chunk: &UploadChunk) -> Result<ChunkToken> {
        let auth = TargetAuth::from_details(&self.auth.read());
        let body = serde_json::to_value(chunk.wire_body(&auth))?;
        let url = self.plugin_url("uploadChunk");
        let (_, bytes) = self
            .execute(Method::POST, url, Some(body), "uploading chunk")
            .await?;

        let token = String::from_utf8_lossy(&bytes)
            .trim()
            .trim_matches('"')
            .to_string();
        if token.is_empty() {
            return Err(TransferError::ChunkRejected {
                reason: "target accepted the chunk but returned no token".to_string(),
            });
        }
        debug!(%token, files = chunk.len(), "chunk accepted");
        Ok(ChunkToken(token))
    }

    async fn chunk_status(&self, token: &ChunkToken) -> Result<ChunkPoll> {
        let url = self.plugin_url("uploadStatus");
        let body = json!({ "token": token });
        let (status, bytes) = self
            .execute(Method::POST, url, Some(body), "polling chunk status")
            .await?;

        if status == StatusCode::ACCEPTED {
            return Ok(ChunkPoll::InProgress);
        }
        let response: ChunkStatusResponse = serde_json::from_slice(&bytes)?;
        match response.status {
            ChunkStatusKind::InProgress => Ok(ChunkPoll::InProgress),
            ChunkStatusKind::Done => Ok(ChunkPoll::Done(response.files)),
        }
    }

    async fn recommended_threads(&self) -> Result<Option<usize>> {
        let url = self.plugin_url("recommendedThreads");
        match self
            .execute(Method::GET, url, None, "fetching recommended threads")
            .await
        {
            Ok((_, bytes)) => {
                let parsed: ThreadsResponse = serde_json::from_slice(&bytes)?;
                Ok(Some(parsed.threads.max(1)))
            }
            // Older plugins don't expose the endpoint.
            Err(TransferError::HttpStatus {
                status: StatusCode::NOT_FOUND,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Compare dotted-numeric version strings, ignoring non-numeric suffixes
/// (`2.1.0-rc1` compares as `2.1.0`).
pub fn version_at_least(actual: &str, required: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.split('.')
            .map(|p| {
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }
    let actual = parts(actual);
    let required = parts(required);
    let len = actual.len().max(required.len());
    for i in 0..len {
        let a = actual.get(i).copied().unwrap_or(0);
        let r = required.get(i).copied().unwrap_or(0);
        if a != r {
            return a > r;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison() {
        assert!(version_at_least("1.4.0", "1.4.0"));
        assert!(version_at_least("1.10.0", "1.4.0"));
        assert!(version_at_least("2.0", "1.9.9"));
        assert!(version_at_least("1.4.1-rc2", "1.4.1"));
        assert!(!version_at_least("1.3.9", "1.4.0"));
        assert!(!version_at_least("0.9", "1.0.0"));
    }

    #[test]
    fn chunk_status_response_parses() {
        let response: ChunkStatusResponse = serde_json::from_str(
            r#"{
                "status": "DONE",
                "files": [
                    {"repo":"r","path":"p","name":"a","status":"SUCCESS"},
                    {"repo":"r","path":"p","name":"b","status":"FAIL","status_code":422,"reason":"rejected"}
                ]
            }"#,
        )
        .unwrap();
        assert!(matches!(response.status, ChunkStatusKind::Done));
        assert_eq!(response.files.len(), 2);
    }
}
