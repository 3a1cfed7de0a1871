//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CrawlTarget, FetchConfig, JobState, JobStatus};
use crate::models::{
    CrawlResult, ExtractionMap, ExtractionResult, FetchedPage, JobProgress, Query, UrlStatus,
};
use crate::runner::{RunnerEvent, RunnerReporter};
use crate::session::SessionProfile;
use crate::tier::Tier;
use crate::traits::{Extractor, JobStatusSource, ProgressSink, ResultSink, TierFetcher};
use crate::url_guard::HostResolver;

/// A 200 HTML page whose body is long enough to never look like a challenge.
pub fn ok_page(body: &str) -> FetchedPage {
    FetchedPage::html(
        200,
        format!(
            "<html><head>{body}</head><body>{}</body></html>",
            "<p>content</p>".repeat(20)
        ),
    )
}

// ---------------------------------------------------------------------------
// MockTierFetcher
// ---------------------------------------------------------------------------

/// Mock tier fetcher.
///
/// Responses queued per tier with [`on`](Self::on) are served first, once
/// each. Pages registered per URL with [`page`](Self::page) are served at any
/// tier, any number of times. Anything else is `TierUnavailable`.
#[derive(Clone, Default)]
pub struct MockTierFetcher {
    queued: Arc<Mutex<HashMap<Tier, VecDeque<Result<FetchedPage, AppError>>>>>,
    pages: Arc<Mutex<HashMap<String, FetchedPage>>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<(Tier, String)>>>,
    sessions: Arc<Mutex<Vec<SessionProfile>>>,
}

impl MockTierFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, tier: Tier, response: Result<FetchedPage, AppError>) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(tier)
            .or_default()
            .push_back(response);
        self
    }

    pub fn page(self, url: &str, page: FetchedPage) -> Self {
        self.pages.lock().unwrap().insert(url.to_string(), page);
        self
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Tiers tried, in order.
    pub fn calls(&self) -> Vec<Tier> {
        self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    /// URLs fetched, in order, one entry per URL even across tiers.
    pub fn fetched_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for (_, url) in self.calls.lock().unwrap().iter() {
            if urls.last() != Some(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    pub fn opened_sessions(&self) -> Vec<SessionProfile> {
        self.sessions.lock().unwrap().clone()
    }
}

impl TierFetcher for MockTierFetcher {
    type Session = ();

    fn open_session(&self, profile: &SessionProfile, _config: &FetchConfig) -> Result<(), AppError> {
        self.sessions.lock().unwrap().push(profile.clone());
        Ok(())
    }

    async fn fetch_at(
        &self,
        tier: Tier,
        _session: &(),
        target: &CrawlTarget,
    ) -> Result<FetchedPage, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((tier, target.url.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&tier)
            .and_then(VecDeque::pop_front);
        if let Some(response) = queued {
            return response;
        }
        if let Some(page) = self.pages.lock().unwrap().get(&target.url) {
            return Ok(page.clone());
        }
        Err(AppError::TierUnavailable {
            tier: tier.ordinal(),
            reason: "not scripted".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extractor: every query yields the page text as its single match.
#[derive(Clone, Default)]
pub struct MockExtractor {
    calls: Arc<Mutex<Vec<Vec<Query>>>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The query list handed over on each call.
    pub fn calls(&self) -> Vec<Vec<Query>> {
        self.calls.lock().unwrap().clone()
    }
}

impl Extractor for MockExtractor {
    async fn extract(
        &self,
        content: &[u8],
        _content_type: Option<&str>,
        queries: &[Query],
    ) -> ExtractionMap {
        self.calls.lock().unwrap().push(queries.to_vec());
        let text = String::from_utf8_lossy(content).to_string();
        queries
            .iter()
            .map(|q| {
                (
                    q.name.clone(),
                    ExtractionResult::from_strings(vec![text.clone()], q.join),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

/// Mock job backend that records every write.
#[derive(Clone, Default)]
pub struct MockBackend {
    progress: Arc<Mutex<Vec<JobProgress>>>,
    url_statuses: Arc<Mutex<Vec<(String, UrlStatus)>>>,
    job_statuses: Arc<Mutex<Vec<JobStatus>>>,
    results: Arc<Mutex<Vec<CrawlResult>>>,
    polls: Arc<Mutex<usize>>,
    cancel_after: Option<usize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the job as cancelled once it has been polled more than `n` times.
    pub fn cancel_after_polls(mut self, n: usize) -> Self {
        self.cancel_after = Some(n);
        self
    }

    pub fn progress(&self) -> Vec<JobProgress> {
        self.progress.lock().unwrap().clone()
    }

    pub fn url_statuses(&self) -> Vec<(String, UrlStatus)> {
        self.url_statuses.lock().unwrap().clone()
    }

    pub fn job_statuses(&self) -> Vec<JobStatus> {
        self.job_statuses.lock().unwrap().clone()
    }

    pub fn results(&self) -> Vec<CrawlResult> {
        self.results.lock().unwrap().clone()
    }
}

impl JobStatusSource for MockBackend {
    async fn job_state(&self, _job_id: Uuid) -> Result<JobState, AppError> {
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;
        let cancelled = self.cancel_after.is_some_and(|n| *polls > n);
        Ok(JobState {
            status: JobStatus::Processing,
            cancelled,
        })
    }
}

impl ProgressSink for MockBackend {
    async fn update_progress(&self, _job_id: Uuid, progress: &JobProgress) -> Result<(), AppError> {
        self.progress.lock().unwrap().push(*progress);
        Ok(())
    }

    async fn update_url_status(
        &self,
        _job_id: Uuid,
        url: &str,
        status: UrlStatus,
    ) -> Result<(), AppError> {
        self.url_statuses
            .lock()
            .unwrap()
            .push((url.to_string(), status));
        Ok(())
    }

    async fn update_job_status(&self, _job_id: Uuid, status: JobStatus) -> Result<(), AppError> {
        self.job_statuses.lock().unwrap().push(status);
        Ok(())
    }
}

impl ResultSink for MockBackend {
    async fn save_results(&self, _job_id: Uuid, results: &[CrawlResult]) -> Result<(), AppError> {
        self.results.lock().unwrap().extend_from_slice(results);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StaticResolver
// ---------------------------------------------------------------------------

/// Resolver with a fixed host table; unknown hosts fail to resolve.
#[derive(Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addrs: &[&str]) -> Self {
        let ips = addrs.iter().map(|a| a.parse().unwrap()).collect();
        self.hosts.insert(host.to_string(), ips);
        self
    }
}

impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        self.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records the kind of every event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl RunnerReporter for MockReporter {
    fn report(&self, event: RunnerEvent<'_>) {
        let name = match event {
            RunnerEvent::JobStarted { .. } => "job_started",
            RunnerEvent::UrlRejected { .. } => "url_rejected",
            RunnerEvent::RateLimited { .. } => "rate_limited",
            RunnerEvent::UrlFinished { .. } => "url_finished",
            RunnerEvent::UrlFailed { .. } => "url_failed",
            RunnerEvent::ProgressSaved { .. } => "progress_saved",
            RunnerEvent::JobStopped { .. } => "job_stopped",
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}
