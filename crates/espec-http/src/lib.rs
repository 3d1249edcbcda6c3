//! Outbound HTTP fetch utilities shared by the search provider and preview scrapers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "espec-http";

/// Upstream error bodies are cut to this many characters before they are surfaced.
pub const ERROR_BODY_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
        }
    }
}

/// Single-attempt fetcher. Failures are reported, never retried.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body_snippet: String,
    },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// A fetch's claim on its host's semaphore. On drop, including when the
/// fetch is cancelled, the host entry is removed if nothing else uses it.
struct HostSlot<'a> {
    fetcher: &'a HttpFetcher,
    host: String,
    semaphore: Option<Arc<Semaphore>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl HostSlot<'_> {
    async fn acquire(&mut self) {
        if let Some(semaphore) = &self.semaphore {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            self.permit = Some(permit);
        }
    }
}

impl Drop for HostSlot<'_> {
    fn drop(&mut self) {
        self.permit.take();
        let mut map = self
            .fetcher
            .per_host
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.semaphore.take();
        let idle = map.get(&self.host).is_some_and(|s| {
            Arc::strong_count(s) == 1 && s.available_permits() == self.fetcher.per_host_limit
        });
        if idle {
            map.remove(&self.host);
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
        })
    }

    fn host_slot(&self, host: &str) -> HostSlot<'_> {
        let mut map = self.per_host.lock().unwrap_or_else(PoisonError::into_inner);
        let semaphore = map
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone();
        HostSlot {
            fetcher: self,
            host: host.to_string(),
            semaphore: Some(semaphore),
            permit: None,
        }
    }

    /// GET `url` with extra `headers`. Non-success statuses become
    /// [`FetchError::HttpStatus`] carrying the start of the response body.
    pub async fn fetch(
        &self,
        request_id: Uuid,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let mut slot = self.host_slot(&host);
        slot.acquire().await;

        let span = info_span!("http_fetch", %request_id, host = %host);
        self.send(parsed, headers).instrument(span).await
    }

    async fn send(&self, url: Url, headers: HeaderMap) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).headers(headers).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "non-success response");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body_snippet: truncate_chars(&body, ERROR_BODY_SNIPPET_CHARS),
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
