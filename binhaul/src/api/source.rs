//! Search queries against the source service.
//!
//! The source exposes a filter-based search endpoint. The engine issues two
//! query shapes: a directory listing (one level, sorted by name) and a
//! modified-time window scan (sorted by modification time). Both are paged
//! with a fixed limit so no single response exceeds the server's cursor
//! limits.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::client::{apply_auth, build_http_client};
use crate::api::retry::{Attempt, RetryPolicy, run_with_retries};
use crate::api::types::{RepoSummary, SearchItem};
use crate::config::ServerDetails;
use crate::{Result, SEARCH_PAGE_LIMIT, TransferError};

/// Read-side contract the phases consume.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Totals and package type for a repository.
    async fn repo_summary(&self, repo_key: &str) -> Result<RepoSummary>;

    /// One page of the direct children of `relative_path`, sorted ascending
    /// by name.
    async fn list_directory(
        &self,
        repo_key: &str,
        relative_path: &str,
        page: usize,
    ) -> Result<Vec<SearchItem>>;

    /// One page of files modified within `[from, to)`, sorted ascending by
    /// modification time.
    async fn diff_window(
        &self,
        repo_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: usize,
    ) -> Result<Vec<SearchItem>>;
}

/// Body of a directory-listing search request.
pub(crate) fn directory_listing_body(repo_key: &str, relative_path: &str, page: usize) -> Value {
    json!({
        "filter": {
            "repo": repo_key,
            "path": relative_path,
            "type": "any",
        },
        "include": ["repo", "path", "name", "type", "size"],
        "sort": {"asc": ["name"]},
        "offset": page * SEARCH_PAGE_LIMIT,
        "limit": SEARCH_PAGE_LIMIT,
    })
}

/// Body of a modified-time window search request. The window is half-open:
/// `modified >= from` and `modified < to`.
pub(crate) fn diff_window_body(
    repo_key: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    page: usize,
) -> Value {
    json!({
        "filter": {
            "repo": repo_key,
            "modified_gte": from.to_rfc3339_opts(SecondsFormat::Millis, true),
            "modified_lt": to.to_rfc3339_opts(SecondsFormat::Millis, true),
        },
        "include": ["repo", "path", "name", "modified", "size"],
        "sort": {"asc": ["modified"]},
        "offset": page * SEARCH_PAGE_LIMIT,
        "limit": SEARCH_PAGE_LIMIT,
    })
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<SearchItem>,
}

/// HTTP implementation of [`SourceApi`].
pub struct HttpSourceClient {
    http: Client,
    details: ServerDetails,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl HttpSourceClient {
    pub fn new(details: ServerDetails, threads: usize, cancel: CancellationToken) -> Result<Self> {
        Ok(Self {
            http: build_http_client(threads)?,
            details,
            retry: RetryPolicy::default(),
            cancel,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        operation: &'static str,
    ) -> Result<T> {
        let bytes = run_with_retries(&self.retry, &self.cancel, |_| {
            let url = url.clone();
            async move {
                let request = apply_auth(self.http.get(&url), &self.details);
                read_response(request.send().await, &url, operation).await
            }
        })
        .await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            TransferError::source_query(format!("{operation}: malformed response: {e}"))
        })
    }

    async fn search(&self, body: Value, operation: &'static str) -> Result<Vec<SearchItem>> {
        let url = self.details.api_url("api/search/items");
        let bytes = run_with_retries(&self.retry, &self.cancel, |_| {
            let url = url.clone();
            let body = body.clone();
            async move {
                let request = apply_auth(self.http.post(&url).json(&body), &self.details);
                read_response(request.send().await, &url, operation).await
            }
        })
        .await?;
        let page: SearchPage = serde_json::from_slice(&bytes).map_err(|e| {
            TransferError::source_query(format!("{operation}: malformed response: {e}"))
        })?;
        debug!(operation, results = page.results.len(), "search page received");
        Ok(page.results)
    }
}

/// Classify a raw response for the retry driver and extract its body.
async fn read_response(
    response: reqwest::Result<reqwest::Response>,
    url: &str,
    operation: &'static str,
) -> Attempt<Vec<u8>> {
    let response = match response {
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
    if !status.is_success() {
        let err = TransferError::http_status(status, url, operation);
        return if err.is_retryable() {
            Attempt::Again(err)
        } else {
            Attempt::Abort(err)
        };
    }

    match response.bytes().await {
        Ok(bytes) => Attempt::Done(bytes.to_vec()),
        Err(e) => Attempt::Again(TransferError::from(e)),
    }
}

#[async_trait]
impl SourceApi for HttpSourceClient {
    async fn repo_summary(&self, repo_key: &str) -> Result<RepoSummary> {
        let url = self
            .details
            .api_url(&format!("api/repositories/{repo_key}/summary"));
        self.get_json(url, "fetching repository summary").await
    }

    async fn list_directory(
        &self,
        repo_key: &str,
        relative_path: &str,
        page: usize,
    ) -> Result<Vec<SearchItem>> {
        self.search(
            directory_listing_body(repo_key, relative_path, page),
            "listing directory",
        )
        .await
    }

    async fn diff_window(
        &self,
        repo_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: usize,
    ) -> Result<Vec<SearchItem>> {
        self.search(
            diff_window_body(repo_key, from, to, page),
            "scanning diff window",
        )
        .await
    }
}
