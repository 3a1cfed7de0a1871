use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, UrlError};
use crate::models::Query;
use crate::query_guard;
use crate::tier::Tier;

/// Maximum number of URLs a single job may carry.
pub const MAX_URLS_PER_JOB: usize = 10_000;
pub const MAX_URL_LENGTH: usize = 2048;
pub const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// Lifecycle status of a crawl job.
///
/// `Ready -> Processing -> {Ready | Error | Timeout | Cancelled}`; a job that
/// finishes normally returns to `Ready` for its next scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ready,
    Processing,
    Error,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ready => "ready",
            JobStatus::Processing => "processing",
            JobStatus::Error => "error",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// True for the statuses a run can stop in without completing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Error | JobStatus::Timeout | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ready" => Ok(JobStatus::Ready),
            "processing" => Ok(JobStatus::Processing),
            "error" => Ok(JobStatus::Error),
            "timeout" => Ok(JobStatus::Timeout),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Status snapshot polled from the job record for cooperative cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobState {
    pub status: JobStatus,
    pub cancelled: bool,
}

impl JobState {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled || self.status == JobStatus::Cancelled
    }
}

// ---------------------------------------------------------------------------
// Fetch policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rotation {
    #[default]
    Random,
    RoundRobin,
}

/// How tier 2 obtains and uses proxy endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPolicy {
    pub enabled: bool,
    /// Region filter such as `us`, `eu` or `as`; `None` or `any` for no filter.
    #[serde(alias = "geo_targeting", skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,
    #[serde(alias = "rotation_strategy")]
    pub rotation: Rotation,
    /// Fetch directly when no proxy is available instead of failing the tier.
    pub fallback_to_direct: bool,
    /// The proxy terminates TLS itself, so certificate checks are disabled.
    pub intercepts_tls: bool,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            geo: None,
            rotation: Rotation::Random,
            fallback_to_direct: true,
            intercepts_tls: false,
        }
    }
}

impl ProxyPolicy {
    pub fn region(&self) -> Option<&str> {
        self.geo.as_deref().filter(|g| !g.eq_ignore_ascii_case("any"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    Load,
    DomContentLoaded,
    #[default]
    NetworkIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// Rendering options handed to the render provider for tiers 3 and 4.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderPolicy {
    pub wait_strategy: WaitStrategy,
    pub wait_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_selector: Option<String>,
    pub viewport: Viewport,
    /// Resource types to block, e.g. `image`, `stylesheet`, `font`.
    pub block_resources: Vec<String>,
}

impl Default for RenderPolicy {
    fn default() -> Self {
        Self {
            wait_strategy: WaitStrategy::NetworkIdle,
            wait_timeout_ms: 30_000,
            wait_for_selector: None,
            viewport: Viewport::default(),
            block_resources: Vec::new(),
        }
    }
}

impl RenderPolicy {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Which tiers escalation may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationPolicy {
    pub min_tier: Tier,
    pub max_tier: Tier,
    pub auto_escalate: bool,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            min_tier: Tier::MIN,
            max_tier: Tier::MAX,
            auto_escalate: true,
        }
    }
}

/// Per-job fetch configuration shared by every URL of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub proxy: ProxyPolicy,
    pub render: RenderPolicy,
    pub escalation: EscalationPolicy,
    pub request_timeout_secs: u64,
    /// In-tier retries for transient proxy failures.
    pub max_retries: u32,
    /// Responses larger than this are abandoned mid-read.
    pub max_body_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyPolicy::default(),
            render: RenderPolicy::default(),
            escalation: EscalationPolicy::default(),
            request_timeout_secs: 30,
            max_retries: 3,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// A URL plus the fetch configuration it is crawled with.
#[derive(Debug, Clone)]
pub struct CrawlTarget {
    pub url: String,
    pub config: Arc<FetchConfig>,
}

impl CrawlTarget {
    pub fn new(url: impl Into<String>, config: Arc<FetchConfig>) -> Self {
        Self {
            url: url.into(),
            config,
        }
    }
}

// ---------------------------------------------------------------------------
// Job definition
// ---------------------------------------------------------------------------

fn default_min_delay_ms() -> u64 {
    1000
}

fn default_job_timeout_secs() -> u64 {
    900
}

/// A crawl job: an ordered URL list plus the queries to run on each page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub urls: Vec<String>,
    pub queries: Vec<Query>,
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Minimum spacing between requests to the same domain.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

impl JobSpec {
    pub fn new(urls: Vec<String>, queries: Vec<Query>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            urls,
            queries,
            fetch: FetchConfig::default(),
            min_delay_ms: default_min_delay_ms(),
            job_timeout_secs: default_job_timeout_secs(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_secs = timeout.as_secs();
        self
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Reject the job as a whole if any part of it is invalid, otherwise
    /// return it with trimmed URLs and the sanitized queries that will run.
    ///
    /// URLs are checked syntactically only; address checks happen at fetch
    /// time so DNS answers cannot change between validation and use.
    pub fn validated(mut self) -> Result<Self, AppError> {
        self.urls = validate_urls(&self.urls)?;
        self.queries = query_guard::validate_queries(&self.queries)?;

        let esc = &self.fetch.escalation;
        if esc.min_tier > esc.max_tier {
            return Err(AppError::Config(format!(
                "min_tier ({}) must not exceed max_tier ({})",
                esc.min_tier.ordinal(),
                esc.max_tier.ordinal()
            )));
        }
        if self.job_timeout_secs == 0 {
            return Err(AppError::Config("job_timeout_secs must be positive".into()));
        }
        if self.fetch.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "request_timeout_secs must be positive".into(),
            ));
        }
        if self.fetch.max_body_bytes == 0 {
            return Err(AppError::Config("max_body_bytes must be positive".into()));
        }
        Ok(self)
    }

    /// The crawl targets in job order, sharing one fetch configuration.
    pub fn targets(&self) -> Vec<CrawlTarget> {
        let config = Arc::new(self.fetch.clone());
        self.urls
            .iter()
            .map(|u| CrawlTarget::new(u.trim(), Arc::clone(&config)))
            .collect()
    }
}

/// Bounds, per-URL syntax and duplicates. Duplicates are compared after
/// normalisation, so `https://a.com` and `https://a.com/#top` collide.
fn validate_urls(urls: &[String]) -> Result<Vec<String>, AppError> {
    if urls.is_empty() {
        return Err(AppError::Validation("URL list cannot be empty".into()));
    }
    if urls.len() > MAX_URLS_PER_JOB {
        return Err(AppError::Validation(format!(
            "URL list has {} entries, maximum is {MAX_URLS_PER_JOB}",
            urls.len()
        )));
    }

    let mut seen = HashSet::with_capacity(urls.len());
    let mut trimmed = Vec::with_capacity(urls.len());
    for (i, raw) in urls.iter().enumerate() {
        let url = raw.trim();
        if url.chars().count() > MAX_URL_LENGTH {
            return Err(AppError::Validation(format!(
                "URL at index {i} exceeds maximum length of {MAX_URL_LENGTH}"
            )));
        }
        let mut parsed = check_url_syntax(url)?;
        parsed.set_fragment(None);
        if !seen.insert(parsed.to_string()) {
            return Err(AppError::Validation(format!(
                "duplicate URL at index {i}: {url}"
            )));
        }
        trimmed.push(url.to_string());
    }
    Ok(trimmed)
}

fn check_url_syntax(raw: &str) -> Result<url::Url, UrlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }
    let url = url::Url::parse(trimmed).map_err(|e| UrlError::Malformed(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlError::SchemeNotAllowed(other.to_string())),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(UrlError::MissingHost);
    }
    Ok(url)
}

/// Runtime knobs for the job runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Persist progress after this many URLs (and always after the last one).
    pub progress_every: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { progress_every: 10 }
    }
}

impl RunnerConfig {
    pub fn with_progress_every(mut self, every: usize) -> Self {
        self.progress_every = every.max(1);
        self
    }
}
