use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CrawlTarget, FetchConfig, JobState, JobStatus, ProxyPolicy, RenderPolicy};
use crate::models::{CrawlResult, ExtractionMap, FetchedPage, JobProgress, Query, UrlStatus};
use crate::session::SessionProfile;
use crate::tier::Tier;

/// Executes a single fetch at a given escalation tier.
///
/// A session is opened once per job and reused for every URL, so cookies and
/// the browsing identity stay consistent across the job.
pub trait TierFetcher: Send + Sync + Clone {
    type Session: Send + Sync;

    fn open_session(
        &self,
        profile: &SessionProfile,
        config: &FetchConfig,
    ) -> Result<Self::Session, AppError>;

    /// Fetch `target` using the strategy of `tier`.
    ///
    /// Returns `AppError::TierUnavailable` when the tier is not configured.
    /// Blocking detection is left to the caller.
    fn fetch_at(
        &self,
        tier: Tier,
        session: &Self::Session,
        target: &CrawlTarget,
    ) -> impl Future<Output = Result<FetchedPage, AppError>> + Send;
}

/// Runs a batch of queries against fetched content.
///
/// Never fails as a whole: a query that cannot run maps to `None`.
pub trait Extractor: Send + Sync + Clone {
    fn extract(
        &self,
        content: &[u8],
        content_type: Option<&str>,
        queries: &[Query],
    ) -> impl Future<Output = ExtractionMap> + Send;
}

/// Reads the current status of a job record, polled for cancellation.
pub trait JobStatusSource: Send + Sync + Clone {
    fn job_state(&self, job_id: Uuid) -> impl Future<Output = Result<JobState, AppError>> + Send;
}

/// Receives progress updates while a job runs.
pub trait ProgressSink: Send + Sync + Clone {
    fn update_progress(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn update_url_status(
        &self,
        job_id: Uuid,
        url: &str,
        status: UrlStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Receives the final per-URL results of a run, in job order.
pub trait ResultSink: Send + Sync + Clone {
    fn save_results(
        &self,
        job_id: Uuid,
        results: &[CrawlResult],
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A proxy the IP-rotation tier can route through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub url: String,
    pub region: Option<String>,
}

impl ProxyEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// The proxy URL with its password replaced, safe for logs.
    pub fn masked(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut u) if u.password().is_some() => {
                let _ = u.set_password(Some("***"));
                u.to_string()
            }
            Ok(u) => u.to_string(),
            Err(_) => "<invalid proxy url>".to_string(),
        }
    }
}

/// Supplies proxy endpoints and tracks their health.
pub trait ProxyProvider: Send + Sync + Clone {
    fn endpoint(&self, policy: &ProxyPolicy)
    -> impl Future<Output = Option<ProxyEndpoint>> + Send;

    fn mark_failed(
        &self,
        endpoint: &ProxyEndpoint,
        reason: &str,
    ) -> impl Future<Output = ()> + Send;

    fn record_usage(
        &self,
        endpoint: &ProxyEndpoint,
        success: bool,
        bytes: u64,
    ) -> impl Future<Output = ()> + Send;
}

/// Everything a render provider needs for one page.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    pub policy: RenderPolicy,
    pub user_agent: String,
    pub proxy: Option<ProxyEndpoint>,
    /// Tier 4: attempt to solve challenges after rendering.
    pub solve_captcha: bool,
}

/// Renders a page in a headless browser (tiers 3 and 4).
pub trait RenderProvider: Send + Sync + Clone {
    fn render(
        &self,
        request: &RenderRequest,
    ) -> impl Future<Output = Result<FetchedPage, AppError>> + Send;
}

/// Persists the browsing identity of a job between runs.
pub trait SessionStore: Send + Sync + Clone {
    fn load(&self, job_id: Uuid) -> impl Future<Output = Option<SessionProfile>> + Send;

    fn save(&self, job_id: Uuid, profile: &SessionProfile) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// No-op implementations
// ---------------------------------------------------------------------------

/// A proxy provider with no endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProxies;

impl ProxyProvider for NoProxies {
    async fn endpoint(&self, _policy: &ProxyPolicy) -> Option<ProxyEndpoint> {
        None
    }

    async fn mark_failed(&self, _endpoint: &ProxyEndpoint, _reason: &str) {}

    async fn record_usage(&self, _endpoint: &ProxyEndpoint, _success: bool, _bytes: u64) {}
}

/// A render provider for builds without a browser; every call is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRenderer;

impl RenderProvider for NoRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<FetchedPage, AppError> {
        Err(AppError::TierUnavailable {
            tier: if request.solve_captcha { 4 } else { 3 },
            reason: "no render provider configured".into(),
        })
    }
}

/// A session store that forgets everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSessionStore;

impl SessionStore for NullSessionStore {
    async fn load(&self, _job_id: Uuid) -> Option<SessionProfile> {
        None
    }

    async fn save(&self, _job_id: Uuid, _profile: &SessionProfile) {}
}
