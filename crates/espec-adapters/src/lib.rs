//! Search provider client, marketplace search profile, and preview-image scraping.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use espec_core::RawCandidate;
use espec_http::{FetchError, HttpClientConfig, HttpFetcher};
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "espec-adapters";

pub const BRAVE_WEB_SEARCH_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

pub const DEFAULT_PREVIEW_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; ESpecBot/1.0; +https://www.especauto.com/)";

const SUBSCRIPTION_TOKEN_HEADER: &str = "x-subscription-token";

/// Structural rule for result URLs on the listed hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRule {
    pub hosts: Vec<String>,
    /// When non-empty, the URL must contain at least one of these.
    #[serde(default)]
    pub require_any: Vec<String>,
    /// The URL must contain none of these.
    #[serde(default)]
    pub reject_any: Vec<String>,
}

impl UrlRule {
    fn applies_to(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }

    fn admits(&self, url: &str) -> bool {
        if !self.require_any.is_empty() && !self.require_any.iter().any(|m| url.contains(m.as_str())) {
            return false;
        }
        !self.reject_any.iter().any(|m| url.contains(m.as_str()))
    }
}

/// Marketplace knowledge: which sites to search, which words mark a real
/// listing, and which URL shapes are category pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchProfile {
    pub site_scopes: Vec<String>,
    pub listing_hints: Vec<String>,
    pub value_hints: Vec<String>,
    pub excluded_terms: Vec<String>,
    #[serde(default)]
    pub url_rules: Vec<UrlRule>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SearchProfile {
    fn default() -> Self {
        Self {
            site_scopes: strings(&[
                "mobile.de",
                "autoscout24",
                "marktplaats.nl",
                "leboncoin.fr",
                "subito.it",
                "autotrader.co.uk",
            ]),
            listing_hints: strings(&[
                "details.html?id=",
                "fahrzeuge/details",
                "Anzeige",
                "ad id",
                "ref:",
                "immatriculation",
                "kenteken",
            ]),
            value_hints: strings(&["€", "EUR", "km", "miles"]),
            excluded_terms: strings(&["suchen.mobile.de", "/marke/", "/modell/", "/auto/"]),
            url_rules: vec![
                UrlRule {
                    hosts: strings(&["mobile.de", "suchen.mobile.de"]),
                    require_any: strings(&["details.html", "fahrzeuge/details", "id="]),
                    reject_any: Vec::new(),
                },
                UrlRule {
                    hosts: strings(&["leboncoin.fr"]),
                    require_any: Vec::new(),
                    reject_any: strings(&["/ck/"]),
                },
            ],
        }
    }
}

impl SearchProfile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    /// Provider query for a free-text user query.
    pub fn build_provider_query(&self, user_query: &str) -> String {
        let sites = self
            .site_scopes
            .iter()
            .map(|s| format!("site:{s}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let excluded = self
            .excluded_terms
            .iter()
            .map(|t| format!("-{t}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{user_query} {} {} {sites} {excluded}",
            quoted_or_group(&self.listing_hints),
            quoted_or_group(&self.value_hints),
        )
    }

    /// Whether a result URL on `host` passes every rule for that host.
    /// Hosts without rules always pass.
    pub fn admits_url(&self, host: &str, url: &str) -> bool {
        self.url_rules
            .iter()
            .filter(|rule| rule.applies_to(host))
            .all(|rule| rule.admits(url))
    }
}

fn quoted_or_group(terms: &[String]) -> String {
    let inner = terms
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("({inner})")
}

/// Host of an absolute URL with one leading `www.` removed.
pub fn source_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

/// Search-provider credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// `None` for blank input.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into().trim().to_string();
        (!raw.is_empty()).then_some(Self(raw))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("search provider returned status {status}")]
    Status { status: u16, details: String },
    #[error("search credential is not a valid header value")]
    InvalidCredential,
    #[error("search provider request failed: {0}")]
    Transport(#[source] FetchError),
    #[error("search provider returned a non-JSON body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<FetchError> for ProviderError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus {
                status,
                body_snippet,
                ..
            } => Self::Status {
                status,
                details: body_snippet,
            },
            other => Self::Transport(other),
        }
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        request_id: Uuid,
        api_key: &ApiKey,
        query: &str,
        count: u32,
    ) -> Result<Vec<RawCandidate>, ProviderError>;
}

/// Brave web-search API client.
#[derive(Debug)]
pub struct BraveSearchClient {
    endpoint: Url,
    http: HttpFetcher,
}

impl BraveSearchClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("parsing search endpoint {endpoint}"))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            global_concurrency: 4,
            per_host_concurrency: 4,
            ..Default::default()
        })
        .context("building search http client")?;
        Ok(Self { endpoint, http })
    }
}

#[async_trait]
impl SearchProvider for BraveSearchClient {
    async fn search(
        &self,
        request_id: Uuid,
        api_key: &ApiKey,
        query: &str,
        count: u32,
    ) -> Result<Vec<RawCandidate>, ProviderError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("count", &count.to_string());

        let mut token =
            HeaderValue::from_str(api_key.expose()).map_err(|_| ProviderError::InvalidCredential)?;
        token.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(HeaderName::from_static(SUBSCRIPTION_TOKEN_HEADER), token);

        let resp = self.http.fetch(request_id, url.as_str(), headers).await?;
        let payload: JsonValue = serde_json::from_slice(&resp.body)?;
        Ok(parse_web_results(&payload))
    }
}

/// Web results of a provider payload. A missing or non-array result list is
/// an empty page; item fields that are absent or not strings read as `None`.
pub fn parse_web_results(payload: &JsonValue) -> Vec<RawCandidate> {
    let Some(results) = payload.pointer("/web/results").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    results
        .iter()
        .map(|item| RawCandidate {
            title: json_string(item, "title"),
            url: json_string(item, "url"),
            description: json_string(item, "description"),
        })
        .collect()
}

fn json_string(value: &JsonValue, key: &str) -> Option<String> {
    value.get(key).and_then(JsonValue::as_str).map(ToString::to_string)
}

/// Best-effort preview lookup; any failure is `None`.
#[async_trait]
pub trait PreviewImageFetcher: Send + Sync {
    async fn fetch_preview_image(&self, request_id: Uuid, page_url: &str) -> Option<String>;
}

#[derive(Debug)]
pub struct HttpPreviewFetcher {
    http: HttpFetcher,
}

impl HttpPreviewFetcher {
    pub fn new(user_agent: &str, timeout: Duration, concurrency: usize) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(user_agent.to_string()),
            global_concurrency: concurrency,
            per_host_concurrency: concurrency.min(4),
        })
        .context("building preview http client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PreviewImageFetcher for HttpPreviewFetcher {
    async fn fetch_preview_image(&self, request_id: Uuid, page_url: &str) -> Option<String> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        match self.http.fetch(request_id, page_url, headers).await {
            Ok(resp) => extract_preview_image(&resp.text(), page_url),
            Err(err) => {
                debug!(url = page_url, error = %err, "preview fetch failed");
                None
            }
        }
    }
}

static PREVIEW_IMAGE_SOURCES: Lazy<Vec<(Selector, &'static str)>> = Lazy::new(|| {
    [
        (r#"meta[property="og:image"]"#, "content"),
        (r#"meta[name="twitter:image"]"#, "content"),
        (r#"link[rel="image_src"]"#, "href"),
    ]
    .into_iter()
    .map(|(css, attr)| (Selector::parse(css).expect("valid preview selector"), attr))
    .collect()
});

fn select_first_attr(document: &Html, selector: &Selector, attr: &str) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Preview image of an HTML page: Open Graph first, then Twitter card, then
/// `link[rel=image_src]`. Values starting with `/` are resolved against `page_url`.
pub fn extract_preview_image(html: &str, page_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let image = PREVIEW_IMAGE_SOURCES
        .iter()
        .find_map(|(selector, attr)| select_first_attr(&document, selector, attr))?;

    if !image.starts_with('/') {
        return Some(image);
    }
    let resolved = Url::parse(page_url)
        .and_then(|base| base.join(&image))
        .map(|u| u.to_string());
    Some(resolved.unwrap_or(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use axum::{
        extract::Query,
        http::{HeaderMap as AxumHeaders, StatusCode},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use std::collections::HashMap;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(rel: &str) -> String {
        std::fs::read_to_string(workspace_root().join("fixtures").join(rel)).expect("read fixture")
    }

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn provider_query_matches_marketplace_template() {
        let query = SearchProfile::default().build_provider_query("BMW E36");
        assert_eq!(
            query,
            "BMW E36 (\"details.html?id=\" OR \"fahrzeuge/details\" OR \"Anzeige\" OR \"ad id\" OR \"ref:\" OR \"immatriculation\" OR \"kenteken\") (\"€\" OR \"EUR\" OR \"km\" OR \"miles\") site:mobile.de OR site:autoscout24 OR site:marktplaats.nl OR site:leboncoin.fr OR site:subito.it OR site:autotrader.co.uk -suchen.mobile.de -/marke/ -/modell/ -/auto/"
        );
    }

    #[test]
    fn mobile_de_keeps_only_detail_pages() {
        let profile = SearchProfile::default();
        assert!(!profile.admits_url("mobile.de", "https://www.mobile.de/auto/bmw-3er-e36.html"));
        assert!(!profile.admits_url("suchen.mobile.de", "https://suchen.mobile.de/fahrzeuge/search.html"));
        assert!(profile.admits_url(
            "suchen.mobile.de",
            "https://suchen.mobile.de/fahrzeuge/details.html?id=123"
        ));
        assert!(profile.admits_url("mobile.de", "https://www.mobile.de/fahrzeuge/details/123"));
        assert!(profile.admits_url("mobile.de", "https://www.mobile.de/x?id=9"));
    }

    #[test]
    fn leboncoin_category_pages_are_rejected() {
        let profile = SearchProfile::default();
        assert!(!profile.admits_url("leboncoin.fr", "https://www.leboncoin.fr/ck/voitures/bmw"));
        assert!(profile.admits_url("leboncoin.fr", "https://www.leboncoin.fr/ad/voitures/2712345"));
    }

    #[test]
    fn hosts_without_rules_pass_through() {
        let profile = SearchProfile::default();
        assert!(profile.admits_url("autoscout24.de", "https://www.autoscout24.de/lst/bmw"));
        assert!(profile.admits_url("m.mobile.de", "https://m.mobile.de/auto/bmw"));
    }

    #[test]
    fn source_domain_strips_one_www_label() {
        assert_eq!(
            source_domain("https://www.autoscout24.de/angebote/x").as_deref(),
            Some("autoscout24.de")
        );
        assert_eq!(
            source_domain("https://suchen.mobile.de/fahrzeuge/details.html?id=1").as_deref(),
            Some("suchen.mobile.de")
        );
        assert_eq!(source_domain("https://WWW.Subito.IT/a").as_deref(), Some("subito.it"));
        assert_eq!(source_domain("/relative/path"), None);
    }

    #[test]
    fn api_key_debug_is_redacted_and_blank_keys_are_absent() {
        let key = ApiKey::new("secret-token").unwrap();
        assert_eq!(format!("{key:?}"), "ApiKey(<redacted>)");
        assert_eq!(key.expose(), "secret-token");
        assert!(ApiKey::new("   ").is_none());
    }

    #[test]
    fn web_results_parse_from_fixture() {
        let payload: JsonValue = serde_json::from_str(&fixture("brave/bmw_e36.json")).unwrap();
        let candidates = parse_web_results(&payload);
        assert_eq!(candidates.len(), 6);
        assert_eq!(candidates[0].title(), "BMW 325i Cabrio E36 1995 Automatik");
        assert_eq!(
            candidates[0].url(),
            "https://suchen.mobile.de/fahrzeuge/details.html?id=381234567"
        );
    }

    #[test]
    fn malformed_result_lists_read_as_empty() {
        assert!(parse_web_results(&serde_json::json!({})).is_empty());
        assert!(parse_web_results(&serde_json::json!({"web": {"results": "nope"}})).is_empty());

        let candidates = parse_web_results(&serde_json::json!({
            "web": {"results": [{"title": "no url"}, 7, {"url": "https://a.example/1", "title": null}]}
        }));
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].url, None);
        assert_eq!(candidates[1], RawCandidate::default());
        assert_eq!(candidates[2].title, None);
        assert_eq!(candidates[2].url(), "https://a.example/1");
    }

    #[test]
    fn preview_prefers_open_graph_and_resolves_root_relative() {
        let html = fixture("pages/mobile_de_listing.html");
        let image = extract_preview_image(
            &html,
            "https://suchen.mobile.de/fahrzeuge/details.html?id=381234567",
        );
        assert_eq!(
            image.as_deref(),
            Some("https://suchen.mobile.de/images/381234567/1.jpg")
        );
    }

    #[test]
    fn preview_falls_back_through_twitter_then_image_src() {
        let page = "https://example.com/listing/1";
        let twitter = r#"<html><head>
            <meta property="og:image" content="  ">
            <meta name="twitter:image" content="https://cdn.example.com/t.jpg">
            <link rel="image_src" href="https://cdn.example.com/l.jpg">
            </head></html>"#;
        assert_eq!(
            extract_preview_image(twitter, page).as_deref(),
            Some("https://cdn.example.com/t.jpg")
        );

        let legacy = r#"<html><head><link rel="image_src" href="/l.jpg"></head></html>"#;
        assert_eq!(
            extract_preview_image(legacy, page).as_deref(),
            Some("https://example.com/l.jpg")
        );

        let protocol_relative =
            r#"<html><head><meta property="og:image" content="//img.example.net/a.jpg"></head></html>"#;
        assert_eq!(
            extract_preview_image(protocol_relative, page).as_deref(),
            Some("https://img.example.net/a.jpg")
        );

        let relative = r#"<html><head><meta property="og:image" content="img/a.jpg"></head></html>"#;
        assert_eq!(extract_preview_image(relative, page).as_deref(), Some("img/a.jpg"));

        assert_eq!(extract_preview_image("<html><body>none</body></html>", page), None);
    }

    fn fake_brave() -> Router {
        Router::new()
            .route(
                "/res/v1/web/search",
                get(
                    |headers: AxumHeaders, Query(params): Query<HashMap<String, String>>| async move {
                        let token = headers
                            .get("x-subscription-token")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        if token != "test-key" {
                            return (StatusCode::UNAUTHORIZED, "bad token".to_string()).into_response();
                        }
                        Json(serde_json::json!({
                            "web": {"results": [{
                                "title": params.get("q").cloned().unwrap_or_default(),
                                "url": format!("https://suchen.mobile.de/details.html?id={}", params.get("count").cloned().unwrap_or_default()),
                                "description": "desc"
                            }]}
                        }))
                        .into_response()
                    },
                ),
            )
            .route(
                "/limited",
                get(|| async { (StatusCode::TOO_MANY_REQUESTS, "r".repeat(700)) }),
            )
            .route("/html", get(|| async { "<html>not json</html>" }))
    }

    #[tokio::test]
    async fn brave_client_sends_query_count_and_token() {
        let base = spawn_server(fake_brave()).await;
        let client =
            BraveSearchClient::new(&format!("{base}/res/v1/web/search"), Duration::from_secs(5)).unwrap();
        let key = ApiKey::new("test-key").unwrap();

        let candidates = client
            .search(Uuid::new_v4(), &key, "BMW E36 site:mobile.de", 20)
            .await
            .expect("search");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].title(), "BMW E36 site:mobile.de");
        assert!(candidates[0].url().ends_with("id=20"));
    }

    #[tokio::test]
    async fn brave_client_surfaces_status_and_truncated_details() {
        let base = spawn_server(fake_brave()).await;
        let key = ApiKey::new("test-key").unwrap();

        let client = BraveSearchClient::new(&format!("{base}/limited"), Duration::from_secs(5)).unwrap();
        match client.search(Uuid::new_v4(), &key, "q", 5).await.unwrap_err() {
            ProviderError::Status { status, details } => {
                assert_eq!(status, 429);
                assert_eq!(details.chars().count(), 500);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let wrong_key = ApiKey::new("other").unwrap();
        let client =
            BraveSearchClient::new(&format!("{base}/res/v1/web/search"), Duration::from_secs(5)).unwrap();
        let err = client.search(Uuid::new_v4(), &wrong_key, "q", 5).await.unwrap_err();
        assert!(matches!(err, ProviderError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn brave_client_rejects_non_json_bodies() {
        let base = spawn_server(fake_brave()).await;
        let key = ApiKey::new("test-key").unwrap();
        let client = BraveSearchClient::new(&format!("{base}/html"), Duration::from_secs(5)).unwrap();
        let err = client.search(Uuid::new_v4(), &key, "q", 5).await.unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[tokio::test]
    async fn http_preview_fetcher_degrades_to_none() {
        let html = fixture("pages/mobile_de_listing.html");
        let app = Router::new()
            .route("/listing", get(move || async move { axum::response::Html(html) }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        let base = spawn_server(app).await;
        let fetcher =
            HttpPreviewFetcher::new(DEFAULT_PREVIEW_USER_AGENT, Duration::from_secs(5), 4).unwrap();

        let image = fetcher
            .fetch_preview_image(Uuid::new_v4(), &format!("{base}/listing"))
            .await;
        assert_eq!(image, Some(format!("{base}/images/381234567/1.jpg")));

        assert_eq!(
            fetcher
                .fetch_preview_image(Uuid::new_v4(), &format!("{base}/missing"))
                .await,
            None
        );
        assert_eq!(
            fetcher.fetch_preview_image(Uuid::new_v4(), "not a url").await,
            None
        );
    }
}
