//! HTTP client construction shared by the source and target clients.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};

use crate::Result;
use crate::config::ServerDetails;

/// Overall request timeout. Chunk uploads carry references, not bytes, so
/// requests stay small even for large artifacts.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the shared HTTP client. The idle pool is sized to the worker count
/// so concurrent uploads and polls reuse connections instead of reopening
/// them.
pub fn build_http_client(threads: usize) -> Result<Client> {
    let client = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(threads.max(8))
        .build()?;
    Ok(client)
}

/// Apply credentials to a request: access token wins over basic auth.
pub fn apply_auth(request: RequestBuilder, details: &ServerDetails) -> RequestBuilder {
    if let Some(token) = &details.access_token {
        request.bearer_auth(token)
    } else if !details.username.is_empty() {
        request.basic_auth(&details.username, Some(&details.password))
    } else {
        request
    }
}
