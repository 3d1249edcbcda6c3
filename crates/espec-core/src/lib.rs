//! Core domain model, eligibility heuristic, and text inference for ESpec listing search.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "espec-core";

/// Vehicles become importable this many years after their assumed build date.
pub const ELIGIBILITY_AGE_YEARS: i32 = 25;

/// Every allow-listed marketplace prices in euros.
pub const PRICE_CURRENCY: &str = "EUR";

pub const DEFAULT_ELIGIBLE_FILTER: &str = "now";
pub const DEFAULT_SOON_MONTHS: u32 = 12;
pub const MIN_SOON_MONTHS: u32 = 1;
pub const MAX_SOON_MONTHS: u32 = 36;
pub const DEFAULT_LIMIT: u32 = 24;
pub const MIN_LIMIT: u32 = 1;
pub const MAX_LIMIT: u32 = 30;

/// The provider never returns more than this many results per page.
pub const MAX_PROVIDER_COUNT: u32 = 20;

const LISTING_ID_LEN: usize = 22;

static YEAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?-u:\b)(19[5-9]\d|20[0-2]\d)(?-u:\b)").expect("valid year pattern"));

static PRICE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:€|EUR)\s?([0-9][0-9.,\s]{2,})").expect("valid price pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityStatus {
    EligibleNow,
    EligibleSoon,
    NotEligible,
    Uncertain,
}

impl EligibilityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EligibleNow => "eligible_now",
            Self::EligibleSoon => "eligible_soon",
            Self::NotEligible => "not_eligible",
            Self::Uncertain => "uncertain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
}

/// User-selected eligibility filter. Unrecognised values are kept verbatim so
/// they can be echoed back; they match nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EligibilityFilter {
    All,
    Now,
    Soon,
    Uncertain,
    Unrecognized(String),
}

impl EligibilityFilter {
    pub fn parse(value: &str) -> Self {
        match value {
            "all" => Self::All,
            "now" => Self::Now,
            "soon" => Self::Soon,
            "uncertain" => Self::Uncertain,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::All => "all",
            Self::Now => "now",
            Self::Soon => "soon",
            Self::Uncertain => "uncertain",
            Self::Unrecognized(raw) => raw,
        }
    }

    pub fn includes(&self, status: EligibilityStatus) -> bool {
        use EligibilityStatus::*;
        match self {
            Self::All => status != NotEligible,
            Self::Now => status == EligibleNow,
            Self::Soon => matches!(status, EligibleNow | EligibleSoon),
            Self::Uncertain => matches!(status, EligibleNow | EligibleSoon | Uncertain),
            Self::Unrecognized(_) => false,
        }
    }
}

impl fmt::Display for EligibilityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EligibilityFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

pub fn should_include(status: EligibilityStatus, filter: &EligibilityFilter) -> bool {
    filter.includes(status)
}

/// Outcome of the 25-year rule for one listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityVerdict {
    pub status: EligibilityStatus,
    pub confidence: Confidence,
    pub reason: String,
    pub eligible_on: Option<NaiveDate>,
}

/// Eligibility date under the rule, assuming a January 1 build date.
pub fn eligible_date_for(year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.checked_add(ELIGIBILITY_AGE_YEARS)?, 1, 1)
}

/// Calendar-month distance, ignoring the day of month.
pub fn months_between(from: NaiveDate, to: NaiveDate) -> i32 {
    (to.year() - from.year()) * 12 + (to.month() as i32 - from.month() as i32)
}

/// Applies the 25-year rule as of `today`.
pub fn classify(
    year: Option<i32>,
    soon_window_months: u32,
    today: NaiveDate,
) -> EligibilityVerdict {
    let Some((year, eligible_on)) = year.and_then(|y| eligible_date_for(y).map(|d| (y, d))) else {
        return EligibilityVerdict {
            status: EligibilityStatus::Uncertain,
            confidence: Confidence::Low,
            reason: "Year not found in listing title/snippet. Needs build/registration date."
                .to_string(),
            eligible_on: None,
        };
    };

    if eligible_on <= today {
        return EligibilityVerdict {
            status: EligibilityStatus::EligibleNow,
            confidence: Confidence::Medium,
            reason: format!(
                "Eligible under the 25-year rule based on inferred year ({year}). Confirm build month for high confidence."
            ),
            eligible_on: None,
        };
    }

    let window = i32::try_from(soon_window_months).unwrap_or(i32::MAX);
    if months_between(today, eligible_on) <= window {
        return EligibilityVerdict {
            status: EligibilityStatus::EligibleSoon,
            confidence: Confidence::Medium,
            reason: format!(
                "Likely eligible on {} (25-year rule) based on inferred year ({year}).",
                eligible_on.format("%b %Y")
            ),
            eligible_on: Some(eligible_on),
        };
    }

    EligibilityVerdict {
        status: EligibilityStatus::NotEligible,
        confidence: Confidence::Medium,
        reason: format!("Not yet eligible under the 25-year rule based on inferred year ({year})."),
        eligible_on: Some(eligible_on),
    }
}

/// First year-like token wins; if it falls outside `[1950, current_year + 1]`
/// the text has no usable year.
pub fn infer_year(text: &str, current_year: i32) -> Option<i32> {
    let caps = YEAR_PATTERN.captures(text)?;
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    if year < 1950 || year > current_year + 1 {
        return None;
    }
    Some(year)
}

/// Currency-prefixed amount with group separators removed. Amounts that do
/// not fit an `i64` are treated as absent.
pub fn infer_price(text: &str) -> Option<i64> {
    let caps = PRICE_PATTERN.captures(text)?;
    let digits = caps
        .get(1)?
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.' && *c != ',')
        .collect::<String>();
    digits.parse().ok()
}

pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Short, URL-safe id derived from the listing URL.
pub fn listing_id(source_url: &str) -> String {
    let digest = Sha256::digest(source_url.as_bytes());
    let mut id = URL_SAFE_NO_PAD.encode(digest);
    id.truncate(LISTING_ID_LEN);
    id
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Missing q")]
    MissingQuery,
}

/// Raw inbound query parameters, as received.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub eligible: Option<String>,
    #[serde(rename = "soonMonths")]
    pub soon_months: Option<String>,
    pub limit: Option<String>,
}

/// Validated, clamped search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub eligible: EligibilityFilter,
    pub soon_months: u32,
    pub limit: u32,
}

impl SearchRequest {
    pub fn from_params(params: &SearchParams) -> Result<Self, RequestError> {
        let query = params.q.as_deref().unwrap_or_default().trim().to_string();
        if query.is_empty() {
            return Err(RequestError::MissingQuery);
        }
        let eligible = params
            .eligible
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_ELIGIBLE_FILTER);
        Ok(Self {
            query,
            eligible: EligibilityFilter::parse(eligible),
            soon_months: parse_clamped(
                params.soon_months.as_deref(),
                DEFAULT_SOON_MONTHS,
                MIN_SOON_MONTHS,
                MAX_SOON_MONTHS,
            ),
            limit: parse_clamped(params.limit.as_deref(), DEFAULT_LIMIT, MIN_LIMIT, MAX_LIMIT),
        })
    }

    /// Result count requested from the provider.
    pub fn provider_count(&self) -> u32 {
        self.limit.min(MAX_PROVIDER_COUNT)
    }

    pub fn applied_filters(&self) -> AppliedFilters {
        AppliedFilters {
            eligible: self.eligible.clone(),
            soon_months: self.soon_months,
            limit: self.limit,
        }
    }
}

fn parse_clamped(value: Option<&str>, default: u32, min: u32, max: u32) -> u32 {
    let parsed = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(i64::from(default));
    parsed.clamp(i64::from(min), i64::from(max)) as u32
}

/// One search-provider hit, before any filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub title: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
}

impl RawCandidate {
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or_default()
    }

    pub fn url(&self) -> &str {
        self.url.as_deref().unwrap_or_default()
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }

    /// Title and snippet joined, the text that years and prices are read from.
    pub fn search_text(&self) -> String {
        format!("{} {}", self.title(), self.description())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title_raw: String,
    pub title_normalized: String,
    pub source_url: String,
    pub source_domain: String,
    pub snippet: String,
    pub image_url: Option<String>,
    pub inferred_year: Option<i32>,
    pub price_value: Option<i64>,
    pub price_currency: String,
    pub eligibility_status: EligibilityStatus,
    pub eligible_on: Option<NaiveDate>,
    pub confidence: Confidence,
    pub eligibility_reason: String,
}

impl Listing {
    /// Builds a listing without a preview image; see [`Listing::with_image`].
    pub fn from_candidate(
        candidate: &RawCandidate,
        source_domain: impl Into<String>,
        inferred_year: Option<i32>,
        verdict: EligibilityVerdict,
    ) -> Self {
        let source_url = candidate.url().to_string();
        Self {
            id: listing_id(&source_url),
            title_raw: candidate.title().to_string(),
            title_normalized: normalize_title(candidate.title()),
            source_url,
            source_domain: source_domain.into(),
            snippet: candidate.description().to_string(),
            image_url: None,
            inferred_year,
            price_value: infer_price(&candidate.search_text()),
            price_currency: PRICE_CURRENCY.to_string(),
            eligibility_status: verdict.status,
            eligible_on: verdict.eligible_on,
            confidence: verdict.confidence,
            eligibility_reason: verdict.reason,
        }
    }

    pub fn with_image(mut self, image_url: Option<String>) -> Self {
        self.image_url = image_url;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedFilters {
    pub eligible: EligibilityFilter,
    #[serde(rename = "soonMonths")]
    pub soon_months: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleHit {
    pub title: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchDebug {
    #[serde(rename = "braveCount")]
    pub provider_count: usize,
    #[serde(rename = "braveSample")]
    pub provider_sample: Vec<SampleHit>,
}

impl SearchDebug {
    pub const SAMPLE_SIZE: usize = 3;

    pub fn from_candidates(candidates: &[RawCandidate]) -> Self {
        Self {
            provider_count: candidates.len(),
            provider_sample: candidates
                .iter()
                .take(Self::SAMPLE_SIZE)
                .map(|c| SampleHit {
                    title: c.title.clone(),
                    url: c.url.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub filters: AppliedFilters,
    pub results: Vec<Listing>,
    pub debug: SearchDebug,
    pub fetched_at: String,
}
