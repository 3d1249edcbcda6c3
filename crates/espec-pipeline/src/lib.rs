//! Listing search pipeline: provider query, candidate screening, preview enrichment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, Utc};
use espec_adapters::{
    source_domain, ApiKey, BraveSearchClient, HttpPreviewFetcher, PreviewImageFetcher, ProviderError,
    SearchProfile, SearchProvider, BRAVE_WEB_SEARCH_ENDPOINT, DEFAULT_PREVIEW_USER_AGENT,
};
use espec_core::{
    classify, infer_year, Listing, RawCandidate, RequestError, SearchDebug, SearchParams,
    SearchRequest, SearchResponse,
};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "espec-pipeline";

pub const API_KEY_ENV: &str = "BRAVE_SEARCH_API_KEY";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_key: Option<ApiKey>,
    pub search_endpoint: String,
    pub search_timeout: Duration,
    pub preview_timeout: Duration,
    pub preview_concurrency: usize,
    pub user_agent: String,
    pub search_profile_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            search_endpoint: BRAVE_WEB_SEARCH_ENDPOINT.to_string(),
            search_timeout: Duration::from_secs(15),
            preview_timeout: Duration::from_secs(8),
            preview_concurrency: 6,
            user_agent: DEFAULT_PREVIEW_USER_AGENT.to_string(),
            search_profile_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var(API_KEY_ENV).ok().and_then(ApiKey::new),
            search_endpoint: std::env::var("ESPEC_SEARCH_ENDPOINT")
                .unwrap_or(defaults.search_endpoint),
            search_timeout: env_secs("ESPEC_SEARCH_TIMEOUT_SECS").unwrap_or(defaults.search_timeout),
            preview_timeout: env_secs("ESPEC_PREVIEW_TIMEOUT_SECS").unwrap_or(defaults.preview_timeout),
            preview_concurrency: std::env::var("ESPEC_PREVIEW_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.preview_concurrency),
            user_agent: std::env::var("ESPEC_USER_AGENT").unwrap_or(defaults.user_agent),
            search_profile_path: std::env::var("ESPEC_SEARCH_PROFILE").ok().map(PathBuf::from),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Missing BRAVE_SEARCH_API_KEY in environment.")]
    MissingCredential,
    #[error(transparent)]
    Validation(#[from] RequestError),
    #[error("search provider returned status {status}")]
    Upstream { status: u16, details: String },
    #[error("search provider timed out after {0:?}")]
    ProviderTimeout(Duration),
    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for SearchError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Status { status, details } => Self::Upstream { status, details },
            other => Self::Provider(other),
        }
    }
}

pub struct ListingSearchPipeline {
    api_key: Option<ApiKey>,
    profile: SearchProfile,
    provider: Arc<dyn SearchProvider>,
    previews: Arc<dyn PreviewImageFetcher>,
    search_timeout: Duration,
    preview_timeout: Duration,
    preview_concurrency: usize,
}

impl ListingSearchPipeline {
    pub fn new(
        api_key: Option<ApiKey>,
        profile: SearchProfile,
        provider: Arc<dyn SearchProvider>,
        previews: Arc<dyn PreviewImageFetcher>,
    ) -> Self {
        let defaults = PipelineConfig::default();
        Self {
            api_key,
            profile,
            provider,
            previews,
            search_timeout: defaults.search_timeout,
            preview_timeout: defaults.preview_timeout,
            preview_concurrency: defaults.preview_concurrency,
        }
    }

    pub fn with_timeouts(mut self, search_timeout: Duration, preview_timeout: Duration) -> Self {
        self.search_timeout = search_timeout;
        self.preview_timeout = preview_timeout;
        self
    }

    pub fn with_preview_concurrency(mut self, preview_concurrency: usize) -> Self {
        self.preview_concurrency = preview_concurrency.max(1);
        self
    }

    /// Wires the Brave client and HTTP preview fetcher from configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let profile = match &config.search_profile_path {
            Some(path) => SearchProfile::load(path)?,
            None => SearchProfile::default(),
        };
        let provider = BraveSearchClient::new(&config.search_endpoint, config.search_timeout)?;
        let previews = HttpPreviewFetcher::new(
            &config.user_agent,
            config.preview_timeout,
            config.preview_concurrency.max(1),
        )?;
        Ok(Self::new(
            config.api_key.clone(),
            profile,
            Arc::new(provider),
            Arc::new(previews),
        )
        .with_timeouts(config.search_timeout, config.preview_timeout)
        .with_preview_concurrency(config.preview_concurrency))
    }

    pub async fn search(&self, params: &SearchParams) -> Result<SearchResponse, SearchError> {
        self.search_at(params, Utc::now()).await
    }

    /// Runs one search as of `now`, which drives eligibility dates and `fetched_at`.
    pub async fn search_at(
        &self,
        params: &SearchParams,
        now: DateTime<Utc>,
    ) -> Result<SearchResponse, SearchError> {
        let Some(api_key) = &self.api_key else {
            return Err(SearchError::MissingCredential);
        };
        let request = SearchRequest::from_params(params)?;
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "listing_search",
            %request_id,
            query = %request.query,
            eligible = %request.eligible
        );
        self.run(request_id, api_key, request, now).instrument(span).await
    }

    async fn run(
        &self,
        request_id: Uuid,
        api_key: &ApiKey,
        request: SearchRequest,
        now: DateTime<Utc>,
    ) -> Result<SearchResponse, SearchError> {
        let provider_query = self.profile.build_provider_query(&request.query);
        let candidates = tokio::time::timeout(
            self.search_timeout,
            self.provider
                .search(request_id, api_key, &provider_query, request.provider_count()),
        )
        .await
        .map_err(|_| SearchError::ProviderTimeout(self.search_timeout))?
        .map_err(|err| {
            if let ProviderError::Status { status, .. } = &err {
                warn!(status, "search provider rejected request");
            }
            SearchError::from(err)
        })?;
        info!(provider_count = candidates.len(), "provider results received");

        let today = now.date_naive();
        let accepted = candidates
            .iter()
            .filter_map(|candidate| self.screen(candidate, &request, today))
            .collect::<Vec<_>>();

        let fan_out = self.preview_concurrency.min(request.limit as usize).max(1);
        let results = stream::iter(accepted)
            .map(|listing| self.enrich(request_id, listing))
            .buffered(fan_out)
            .collect::<Vec<_>>()
            .await;
        info!(results = results.len(), "listing search complete");

        Ok(SearchResponse {
            query: request.query.clone(),
            filters: request.applied_filters(),
            results,
            debug: SearchDebug::from_candidates(&candidates),
            fetched_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }

    /// Structural and eligibility screening of one candidate.
    fn screen(
        &self,
        candidate: &RawCandidate,
        request: &SearchRequest,
        today: NaiveDate,
    ) -> Option<Listing> {
        let url = candidate.url();
        if url.is_empty() {
            debug!(title = candidate.title(), "dropping candidate without url");
            return None;
        }
        let Some(domain) = source_domain(url) else {
            debug!(url, "dropping candidate with unparseable url");
            return None;
        };
        if !self.profile.admits_url(&domain, url) {
            debug!(url, domain = %domain, "dropping non-listing page");
            return None;
        }

        let year = infer_year(&candidate.search_text(), today.year());
        let verdict = classify(year, request.soon_months, today);
        if !request.eligible.includes(verdict.status) {
            debug!(url, status = verdict.status.as_str(), "excluded by eligibility filter");
            return None;
        }
        Some(Listing::from_candidate(candidate, domain, year, verdict))
    }

    async fn enrich(&self, request_id: Uuid, listing: Listing) -> Listing {
        let image = tokio::time::timeout(
            self.preview_timeout,
            self.previews.fetch_preview_image(request_id, &listing.source_url),
        )
        .await
        .unwrap_or_else(|_| {
            debug!(url = %listing.source_url, "preview fetch timed out");
            None
        });
        listing.with_image(image)
    }
}
