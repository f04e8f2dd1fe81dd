//! HTTP sync-server provider.
//!
//! Talks to a server that stores the payload under one URL:
//! - `GET`  returns the payload with an `ETag`, or 404 if empty
//! - `PUT`  replaces it; `If-Match` (or `If-None-Match: *` for the first
//!   upload) makes the server refuse stale writes with 412

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{ProviderAdapter, RemoteData, RevisionToken};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, ETAG, HeaderMap, IF_MATCH, IF_NONE_MATCH, RETRY_AFTER};
use std::time::Duration;
use strata_core::ProviderId;

const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

pub struct HttpProvider {
    id: ProviderId,
    url: String,
    token: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpProvider {
    /// Create a provider for the payload at `url`.
    pub fn new(id: impl Into<ProviderId>, url: &str, timeout: Duration) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            id: id.into(),
            url: url.trim_end_matches('/').to_string(),
            token: None,
            timeout,
            http,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let req = self.http.request(method, &self.url);
        match &self.token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => req,
        }
    }

    fn etag(&self, headers: &HeaderMap) -> ProviderResult<RevisionToken> {
        headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(RevisionToken::new)
            .ok_or_else(|| ProviderError::Other(format!("{} sent no ETag", self.url)))
    }

    fn transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Network(format!("{}: {}", self.url, e))
        }
    }
}

/// Maps a non-success status to an error.
fn status_error(status: StatusCode, headers: &HeaderMap, body: String) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Auth(format!("{}: {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => ProviderError::RateLimited {
            retry_after: retry_after(headers, chrono::Utc::now()),
        },
        s if s.is_server_error() => ProviderError::Network(format!("{}: {}", status, body)),
        _ => ProviderError::Other(format!("{}: {}", status, body)),
    }
}

/// Wait time requested by `Retry-After` (seconds or HTTP date) or by an
/// `X-RateLimit-Reset` epoch timestamp.
pub(crate) fn retry_after(headers: &HeaderMap, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    if let Some(value) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        if let Ok(at) = chrono::DateTime::parse_from_rfc2822(value) {
            return Some((at.with_timezone(&chrono::Utc) - now).to_std().unwrap_or(Duration::ZERO));
        }
    }
    let reset = headers
        .get(RATE_LIMIT_RESET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let at = chrono::DateTime::from_timestamp(reset, 0)?;
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn pull(&self) -> ProviderResult<Option<RemoteData>> {
        let resp = self
            .request(reqwest::Method::GET)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, body));
        }
        let rev = self.etag(resp.headers())?;
        let data = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        tracing::debug!("GET {} -> {} bytes at {}", self.url, data.len(), rev);
        Ok(Some(RemoteData { data, rev }))
    }

    async fn push(&self, data: Bytes, expected: Option<&RevisionToken>) -> ProviderResult<RevisionToken> {
        let req = self
            .request(reqwest::Method::PUT)
            .header(CONTENT_TYPE, "application/octet-stream");
        let req = match expected {
            Some(rev) => req.header(IF_MATCH, rev.as_str()),
            None => req.header(IF_NONE_MATCH, "*"),
        };
        let len = data.len();
        let resp = req.body(data).send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        if status == StatusCode::PRECONDITION_FAILED {
            let actual = self.etag(resp.headers()).ok();
            return Err(ProviderError::Conflict {
                expected: expected.cloned(),
                actual,
            });
        }
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, body));
        }
        let rev = self.etag(resp.headers())?;
        tracing::debug!("PUT {} ({} bytes) -> {}", self.url, len, rev);
        Ok(rev)
    }
}
