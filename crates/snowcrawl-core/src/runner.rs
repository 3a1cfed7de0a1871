use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::escalation::EscalationController;
use crate::job::{CrawlTarget, JobSpec, JobStatus, RunnerConfig};
use crate::models::{CrawlResult, CrawlStatus, JobProgress, UrlStatus, compute_hash};
use crate::session::SessionProfile;
use crate::throttle::{DomainRateLimiter, ThrottleConfig};
use crate::tier::Tier;
use crate::traits::{
    Extractor, JobStatusSource, NullSessionStore, ProgressSink, ResultSink, SessionStore,
    TierFetcher,
};
use crate::url_guard::{HostResolver, SystemResolver, UrlGuard};

/// How a job run ended. Partial results are kept on timeout and cancellation.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(Vec<CrawlResult>),
    Timeout(Vec<CrawlResult>),
    Cancelled(Vec<CrawlResult>),
    Error(String),
}

impl JobOutcome {
    /// The status the job record is left in.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Ready,
            JobOutcome::Timeout(_) => JobStatus::Timeout,
            JobOutcome::Cancelled(_) => JobStatus::Cancelled,
            JobOutcome::Error(_) => JobStatus::Error,
        }
    }

    pub fn results(&self) -> &[CrawlResult] {
        match self {
            JobOutcome::Completed(r) | JobOutcome::Timeout(r) | JobOutcome::Cancelled(r) => r,
            JobOutcome::Error(_) => &[],
        }
    }

    pub fn into_results(self) -> Vec<CrawlResult> {
        match self {
            JobOutcome::Completed(r) | JobOutcome::Timeout(r) | JobOutcome::Cancelled(r) => r,
            JobOutcome::Error(_) => Vec::new(),
        }
    }
}

/// Events emitted by the runner for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunnerEvent<'a> {
    JobStarted {
        job_id: Uuid,
        name: &'a str,
        total: usize,
    },
    UrlRejected {
        job_id: Uuid,
        url: &'a str,
        error: &'a str,
    },
    RateLimited {
        url: &'a str,
        waited: Duration,
    },
    UrlFinished {
        job_id: Uuid,
        url: &'a str,
        tier: Option<Tier>,
        http_code: Option<u16>,
    },
    UrlFailed {
        job_id: Uuid,
        url: &'a str,
        error: &'a str,
    },
    ProgressSaved {
        job_id: Uuid,
        progress: &'a JobProgress,
    },
    JobStopped {
        job_id: Uuid,
        status: JobStatus,
        processed: usize,
        failed: usize,
    },
}

/// Trait for receiving runner events (decoupled logging).
pub trait RunnerReporter: Send + Sync {
    fn report(&self, event: RunnerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunnerReporter;

impl RunnerReporter for TracingRunnerReporter {
    fn report(&self, event: RunnerEvent<'_>) {
        match event {
            RunnerEvent::JobStarted {
                job_id,
                name,
                total,
            } => {
                tracing::info!(%job_id, %name, %total, "Job started");
            }
            RunnerEvent::UrlRejected { job_id, url, error } => {
                tracing::warn!(%job_id, %url, %error, "URL rejected");
            }
            RunnerEvent::RateLimited { url, waited } => {
                tracing::debug!(%url, waited_ms = %waited.as_millis(), "Rate limited");
            }
            RunnerEvent::UrlFinished {
                job_id,
                url,
                tier,
                http_code,
            } => {
                let tier = tier.map(Tier::ordinal);
                tracing::info!(%job_id, %url, ?tier, ?http_code, "URL finished");
            }
            RunnerEvent::UrlFailed { job_id, url, error } => {
                tracing::warn!(%job_id, %url, %error, "URL failed");
            }
            RunnerEvent::ProgressSaved { job_id, progress } => {
                tracing::debug!(
                    %job_id,
                    processed = progress.processed,
                    total = progress.total,
                    failed = progress.failed,
                    "Progress saved"
                );
            }
            RunnerEvent::JobStopped {
                job_id,
                status,
                processed,
                failed,
            } => {
                tracing::info!(%job_id, %status, %processed, %failed, "Job stopped");
            }
        }
    }
}

/// Runs crawl jobs: validates, throttles, escalates and extracts each URL in
/// order, tracking progress and honouring timeout and cancellation.
///
/// `B` is the job backend: it reports cancellation and receives progress and
/// final results.
pub struct CrawlJobRunner<F, E, B, S = NullSessionStore, H = SystemResolver>
where
    F: TierFetcher,
    E: Extractor,
    B: JobStatusSource + ProgressSink + ResultSink,
    S: SessionStore,
    H: HostResolver,
{
    fetcher: F,
    extractor: E,
    backend: B,
    sessions: S,
    guard: UrlGuard<H>,
    controller: EscalationController,
    shared_limiter: Option<DomainRateLimiter>,
    config: RunnerConfig,
}

impl<F, E, B> CrawlJobRunner<F, E, B>
where
    F: TierFetcher,
    E: Extractor,
    B: JobStatusSource + ProgressSink + ResultSink,
{
    pub fn new(fetcher: F, extractor: E, backend: B) -> Self {
        Self {
            fetcher,
            extractor,
            backend,
            sessions: NullSessionStore,
            guard: UrlGuard::new(),
            controller: EscalationController::default(),
            shared_limiter: None,
            config: RunnerConfig::default(),
        }
    }
}

impl<F, E, B, S, H> CrawlJobRunner<F, E, B, S, H>
where
    F: TierFetcher,
    E: Extractor,
    B: JobStatusSource + ProgressSink + ResultSink,
    S: SessionStore,
    H: HostResolver,
{
    pub fn with_sessions<S2: SessionStore>(self, sessions: S2) -> CrawlJobRunner<F, E, B, S2, H> {
        CrawlJobRunner {
            fetcher: self.fetcher,
            extractor: self.extractor,
            backend: self.backend,
            sessions,
            guard: self.guard,
            controller: self.controller,
            shared_limiter: self.shared_limiter,
            config: self.config,
        }
    }

    pub fn with_url_guard<H2: HostResolver>(self, guard: UrlGuard<H2>) -> CrawlJobRunner<F, E, B, S, H2> {
        CrawlJobRunner {
            fetcher: self.fetcher,
            extractor: self.extractor,
            backend: self.backend,
            sessions: self.sessions,
            guard,
            controller: self.controller,
            shared_limiter: self.shared_limiter,
            config: self.config,
        }
    }

    pub fn with_controller(mut self, controller: EscalationController) -> Self {
        self.controller = controller;
        self
    }

    /// Share one limiter across jobs instead of a fresh one per run. The
    /// limiter's own delay then applies in place of each job's `min_delay_ms`.
    pub fn with_shared_limiter(mut self, limiter: DomainRateLimiter) -> Self {
        self.shared_limiter = Some(limiter);
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one job to completion, timeout or cancellation.
    pub async fn run_job<WR: RunnerReporter>(
        &self,
        job: &JobSpec,
        cancel: &CancellationToken,
        reporter: &WR,
    ) -> JobOutcome {
        let job = match job.clone().validated() {
            Ok(job) => job,
            Err(e) => return self.fail_job(job.id, e, reporter).await,
        };
        let job = &job;

        let started = Instant::now();
        let targets = job.targets();
        let total = targets.len();

        self.set_job_status(job.id, JobStatus::Processing).await;
        reporter.report(RunnerEvent::JobStarted {
            job_id: job.id,
            name: &job.name,
            total,
        });

        let profile = match self.sessions.load(job.id).await {
            Some(profile) => profile,
            None => SessionProfile::random(),
        };
        let session = match self.fetcher.open_session(&profile, &job.fetch) {
            Ok(session) => session,
            Err(e) => return self.fail_job(job.id, e, reporter).await,
        };
        let limiter = self
            .shared_limiter
            .clone()
            .unwrap_or_else(|| DomainRateLimiter::new(ThrottleConfig::new(job.min_delay())));

        let mut progress = JobProgress::new(total);
        let mut saved_at = 0;
        let mut results = Vec::with_capacity(total);
        let mut stopped = None;

        for (i, target) in targets.iter().enumerate() {
            let elapsed = started.elapsed();
            if elapsed >= job.timeout() {
                tracing::warn!(job_id = %job.id, elapsed_secs = elapsed.as_secs(), "Job timeout reached");
                stopped = Some(JobStatus::Timeout);
                break;
            }
            if self.is_cancelled(job.id, cancel).await {
                stopped = Some(JobStatus::Cancelled);
                break;
            }

            self.set_url_status(job.id, &target.url, UrlStatus::Processing)
                .await;

            let remaining = job.timeout().saturating_sub(elapsed);
            let step = self.crawl_url(job, &session, &limiter, target, reporter);
            let result = tokio::select! {
                r = tokio::time::timeout(remaining, step) => match r {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(job_id = %job.id, url = %target.url, "Job timeout reached during fetch");
                        self.set_url_status(job.id, &target.url, UrlStatus::Error).await;
                        stopped = Some(JobStatus::Timeout);
                        break;
                    }
                },
                () = cancel.cancelled() => {
                    self.set_url_status(job.id, &target.url, UrlStatus::Error).await;
                    stopped = Some(JobStatus::Cancelled);
                    break;
                }
            };

            match &result.error {
                None => reporter.report(RunnerEvent::UrlFinished {
                    job_id: job.id,
                    url: &result.url,
                    tier: result.tier_used,
                    http_code: result.http_code,
                }),
                Some(error) => reporter.report(RunnerEvent::UrlFailed {
                    job_id: job.id,
                    url: &result.url,
                    error,
                }),
            }
            let url_status = if result.is_success() {
                UrlStatus::Finished
            } else {
                UrlStatus::Error
            };
            self.set_url_status(job.id, &target.url, url_status).await;

            progress.record(result.is_success());
            results.push(result);

            let done = i + 1;
            if done % self.config.progress_every == 0 || done == total {
                self.save_progress(job.id, &progress, reporter).await;
                saved_at = done;
            }
        }

        if progress.processed != saved_at {
            self.save_progress(job.id, &progress, reporter).await;
        }

        self.sessions.save(job.id, &profile).await;

        if let Err(e) = self.backend.save_results(job.id, &results).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to save results");
        }

        let status = stopped.unwrap_or(JobStatus::Ready);
        self.set_job_status(job.id, status).await;
        reporter.report(RunnerEvent::JobStopped {
            job_id: job.id,
            status,
            processed: progress.processed,
            failed: progress.failed,
        });

        match status {
            JobStatus::Timeout => JobOutcome::Timeout(results),
            JobStatus::Cancelled => JobOutcome::Cancelled(results),
            _ => JobOutcome::Completed(results),
        }
    }

    /// Validate, throttle, fetch and extract one URL. Never fails: every
    /// problem is recorded in the returned result.
    async fn crawl_url<WR: RunnerReporter>(
        &self,
        job: &JobSpec,
        session: &F::Session,
        limiter: &DomainRateLimiter,
        target: &CrawlTarget,
        reporter: &WR,
    ) -> CrawlResult {
        let url = match self.guard.validate(&target.url).await {
            Ok(url) => url,
            Err(e) => {
                let error = AppError::from(e).to_string();
                reporter.report(RunnerEvent::UrlRejected {
                    job_id: job.id,
                    url: &target.url,
                    error: &error,
                });
                return CrawlResult::failed(&target.url, error);
            }
        };

        let waited = limiter.wait_if_needed(url.as_str()).await;
        if !waited.is_zero() {
            reporter.report(RunnerEvent::RateLimited {
                url: &target.url,
                waited,
            });
        }

        let fetch_target = CrawlTarget::new(url.as_str(), Arc::clone(&target.config));
        let report = self
            .controller
            .run(&self.fetcher, session, &fetch_target)
            .await;

        let mut result = CrawlResult::failed(&target.url, "");
        result.http_code = report.last_status;
        result.escalation_log = report.attempts;

        let page = match report.result {
            Ok(page) => page,
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };

        result.tier_used = Some(report.tier);
        result.content_type = page.content_type.clone();
        result.content_hash = Some(compute_hash(&page.body));

        if page.status >= 400 {
            result.error = Some(format!("HTTP {}", page.status));
            return result;
        }

        result.data = self
            .extractor
            .extract(&page.body, page.content_type.as_deref(), &job.queries)
            .await;
        result.status = CrawlStatus::Success;
        result.error = None;
        result.crawled_at = Utc::now();
        result
    }

    async fn is_cancelled(&self, job_id: Uuid, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        match self.backend.job_state(job_id).await {
            Ok(state) => state.is_cancelled(),
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "Failed to read job status");
                false
            }
        }
    }

    async fn fail_job<WR: RunnerReporter>(
        &self,
        job_id: Uuid,
        error: AppError,
        reporter: &WR,
    ) -> JobOutcome {
        let message = error.to_string();
        tracing::error!(%job_id, error = %message, "Job failed");
        self.set_job_status(job_id, JobStatus::Error).await;
        reporter.report(RunnerEvent::JobStopped {
            job_id,
            status: JobStatus::Error,
            processed: 0,
            failed: 0,
        });
        JobOutcome::Error(message)
    }

    async fn save_progress<WR: RunnerReporter>(
        &self,
        job_id: Uuid,
        progress: &JobProgress,
        reporter: &WR,
    ) {
        if let Err(e) = self.backend.update_progress(job_id, progress).await {
            tracing::error!(%job_id, error = %e, "Failed to save progress");
            return;
        }
        reporter.report(RunnerEvent::ProgressSaved { job_id, progress });
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) {
        if let Err(e) = self.backend.update_job_status(job_id, status).await {
            tracing::error!(%job_id, %status, error = %e, "Failed to update job status");
        }
    }

    async fn set_url_status(&self, job_id: Uuid, url: &str, status: UrlStatus) {
        if let Err(e) = self.backend.update_url_status(job_id, url, status).await {
            tracing::error!(%job_id, %url, error = %e, "Failed to update URL status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::BlockingDetector;
    use crate::job::FetchConfig;
    use crate::models::{ExtractionResult, FetchedPage, Query, QueryType};
    use crate::session::MemorySessionStore;
    use crate::testutil::{
        MockBackend, MockExtractor, MockReporter, MockTierFetcher, StaticResolver, ok_page,
    };

    const PUBLIC_IP: &str = "93.184.216.34";

    fn resolver() -> StaticResolver {
        StaticResolver::new()
            .with_host("example.com", &[PUBLIC_IP])
            .with_host("shop.example.com", &[PUBLIC_IP])
            .with_host("internal.example.com", &["10.1.2.3"])
    }

    fn job(urls: &[&str]) -> JobSpec {
        JobSpec::new(
            urls.iter().map(|u| u.to_string()).collect(),
            vec![Query::new("title", QueryType::Xpath, "//title/text()")],
        )
        .with_min_delay(Duration::from_secs(1))
    }

    fn runner(
        fetcher: MockTierFetcher,
        backend: MockBackend,
    ) -> CrawlJobRunner<MockTierFetcher, MockExtractor, MockBackend, NullSessionStore, StaticResolver>
    {
        CrawlJobRunner::new(fetcher, MockExtractor::new(), backend)
            .with_url_guard(UrlGuard::with_resolver(resolver()))
    }

    #[tokio::test(start_paused = true)]
    async fn completes_job_with_results_for_every_url() {
        let fetcher = MockTierFetcher::new()
            .page("https://example.com/a", ok_page("<title>A</title>"))
            .page("https://example.com/b", ok_page("<title>B</title>"));
        let backend = MockBackend::new();
        let reporter = MockReporter::new();
        let start = Instant::now();

        let outcome = runner(fetcher.clone(), backend.clone())
            .run_job(
                &job(&["https://example.com/a", "https://example.com/b"]),
                &CancellationToken::new(),
                &reporter,
            )
            .await;

        assert!(start.elapsed() >= Duration::from_secs(1), "second request is throttled");
        assert_eq!(outcome.status(), JobStatus::Ready);
        let JobOutcome::Completed(results) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.status, CrawlStatus::Success);
            assert_eq!(r.tier_used, Some(Tier::Lightweight));
            assert_eq!(r.http_code, Some(200));
            assert!(r.content_hash.is_some());
            assert!(matches!(
                r.data.get("title"),
                Some(Some(ExtractionResult::Matches(_)))
            ));
        }
        assert_eq!(results[0].url, "https://example.com/a");
        assert_eq!(
            backend.job_statuses(),
            vec![JobStatus::Processing, JobStatus::Ready]
        );
        assert_eq!(backend.results().len(), 2);
        assert!(reporter.events().contains(&"rate_limited".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn url_failures_do_not_stop_the_job() {
        let fetcher = MockTierFetcher::new()
            .page("https://example.com/ok", ok_page("fine"))
            .page(
                "https://shop.example.com/gone",
                FetchedPage::html(404, "x".repeat(500)),
            );
        let backend = MockBackend::new();

        let outcome = runner(fetcher.clone(), backend.clone())
            .run_job(
                &job(&[
                    "http://127.0.0.1/admin",
                    "https://internal.example.com/",
                    "https://shop.example.com/gone",
                    "https://example.com/ok",
                ]),
                &CancellationToken::new(),
                &MockReporter::new(),
            )
            .await;

        let JobOutcome::Completed(results) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(results.len(), 4);
        assert!(results[0].error.as_deref().unwrap().contains("SSRF blocked"));
        assert!(results[1].error.as_deref().unwrap().contains("10.1.2.3"));
        assert_eq!(results[2].error.as_deref(), Some("HTTP 404"));
        assert_eq!(results[2].http_code, Some(404));
        assert!(results[3].is_success());
        // Rejected URLs never reach the fetcher.
        assert_eq!(
            fetcher.fetched_urls(),
            vec!["https://shop.example.com/gone", "https://example.com/ok"]
        );
        let progress = backend.progress();
        let last = progress.last().unwrap();
        assert_eq!((last.processed, last.failed), (4, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_escalation_is_recorded() {
        let mut fetch = FetchConfig::default();
        fetch.escalation.max_tier = Tier::IpRotation;
        let fetcher =
            MockTierFetcher::new().page("https://example.com/", FetchedPage::html(403, "Forbidden"));

        let outcome = runner(fetcher, MockBackend::new())
            .run_job(
                &job(&["https://example.com/"]).with_fetch(fetch),
                &CancellationToken::new(),
                &MockReporter::new(),
            )
            .await;

        let results = outcome.into_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CrawlStatus::Error);
        assert_eq!(results[0].http_code, Some(403));
        assert_eq!(results[0].escalation_log.len(), 2);
        assert!(
            results[0]
                .error
                .as_deref()
                .unwrap()
                .starts_with("Scraping failed at Tier 2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_hits_job_timeout() {
        let fetcher = MockTierFetcher::new()
            .page("https://example.com/slow", ok_page("late"))
            .with_delay(Duration::from_secs(60));
        let backend = MockBackend::new();

        let outcome = runner(fetcher, backend.clone())
            .run_job(
                &job(&["https://example.com/slow"]).with_timeout(Duration::from_secs(5)),
                &CancellationToken::new(),
                &MockReporter::new(),
            )
            .await;

        assert!(matches!(outcome, JobOutcome::Timeout(ref r) if r.is_empty()));
        assert_eq!(backend.job_statuses().last(), Some(&JobStatus::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_partial_results() {
        let fetcher = MockTierFetcher::new()
            .page("https://example.com/1", ok_page("one"))
            .page("https://example.com/2", ok_page("two"))
            .page("https://example.com/3", ok_page("three"))
            .with_delay(Duration::from_secs(2));

        let outcome = runner(fetcher, MockBackend::new())
            .run_job(
                &job(&[
                    "https://example.com/1",
                    "https://example.com/2",
                    "https://example.com/3",
                ])
                .with_timeout(Duration::from_secs(3)),
                &CancellationToken::new(),
                &MockReporter::new(),
            )
            .await;

        let JobOutcome::Timeout(results) = outcome else {
            panic!("expected timeout");
        };
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_flag_stops_between_urls() {
        let fetcher = MockTierFetcher::new()
            .page("https://example.com/1", ok_page("one"))
            .page("https://example.com/2", ok_page("two"));
        let backend = MockBackend::new().cancel_after_polls(1);

        let outcome = runner(fetcher.clone(), backend.clone())
            .run_job(
                &job(&["https://example.com/1", "https://example.com/2"]),
                &CancellationToken::new(),
                &MockReporter::new(),
            )
            .await;

        let JobOutcome::Cancelled(results) = outcome else {
            panic!("expected cancellation");
        };
        assert_eq!(results.len(), 1);
        assert_eq!(fetcher.fetched_urls(), vec!["https://example.com/1"]);
        assert_eq!(backend.job_statuses().last(), Some(&JobStatus::Cancelled));
        assert_eq!(backend.results().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_stops_before_first_url() {
        let fetcher = MockTierFetcher::new().page("https://example.com/", ok_page("x"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = runner(fetcher.clone(), MockBackend::new())
            .run_job(&job(&["https://example.com/"]), &cancel, &MockReporter::new())
            .await;

        assert!(matches!(outcome, JobOutcome::Cancelled(ref r) if r.is_empty()));
        assert!(fetcher.fetched_urls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_saved_at_fixed_cadence() {
        let urls: Vec<String> = (0..25).map(|i| format!("https://example.com/{i}")).collect();
        let mut fetcher = MockTierFetcher::new();
        for u in &urls {
            fetcher = fetcher.page(u, ok_page("x"));
        }
        let backend = MockBackend::new();
        let spec = JobSpec::new(
            urls,
            vec![Query::new("body", QueryType::Regex, "x")],
        )
        .with_min_delay(Duration::ZERO);

        runner(fetcher, backend.clone())
            .run_job(&spec, &CancellationToken::new(), &MockReporter::new())
            .await;

        let saved: Vec<usize> = backend.progress().iter().map(|p| p.processed).collect();
        assert_eq!(saved, vec![10, 20, 25]);
        assert_eq!(backend.progress().last().unwrap().percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_profile_is_reused_across_runs() {
        let fetcher = MockTierFetcher::new()
            .page("https://example.com/a", ok_page("a"))
            .page("https://example.com/b", ok_page("b"));
        let sessions = MemorySessionStore::default();
        let runner = runner(fetcher.clone(), MockBackend::new()).with_sessions(sessions.clone());
        let spec = job(&["https://example.com/a", "https://example.com/b"]);

        runner
            .run_job(&spec, &CancellationToken::new(), &MockReporter::new())
            .await;
        runner
            .run_job(&spec, &CancellationToken::new(), &MockReporter::new())
            .await;

        let opened = fetcher.opened_sessions();
        assert_eq!(opened.len(), 2, "one session per run, not per URL");
        assert_eq!(opened[0], opened[1]);
        assert_eq!(sessions.load(spec.id).await, Some(opened[0].clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_controller_changes_what_counts_as_blocked() {
        let mut fetch = FetchConfig::default();
        fetch.escalation.max_tier = Tier::IpRotation;
        let not_found = FetchedPage::html(404, "x".repeat(500));
        let spec = job(&["https://example.com/gone"]).with_fetch(fetch);

        let fetcher = MockTierFetcher::new().page("https://example.com/gone", not_found.clone());
        let results = runner(fetcher.clone(), MockBackend::new())
            .run_job(&spec, &CancellationToken::new(), &MockReporter::new())
            .await
            .into_results();
        assert_eq!(results[0].error.as_deref(), Some("HTTP 404"));
        assert_eq!(fetcher.calls(), vec![Tier::Lightweight]);

        // A 500-char error page now reads as a stub challenge.
        let fetcher = MockTierFetcher::new().page("https://example.com/gone", not_found);
        let results = runner(fetcher.clone(), MockBackend::new())
            .with_controller(EscalationController::new(
                BlockingDetector::new().with_min_body_len(1000),
            ))
            .run_job(&spec, &CancellationToken::new(), &MockReporter::new())
            .await
            .into_results();
        assert_eq!(fetcher.calls(), vec![Tier::Lightweight, Tier::IpRotation]);
        assert_eq!(results[0].escalation_log.len(), 2);
        assert!(
            results[0]
                .error
                .as_deref()
                .unwrap()
                .starts_with("Scraping failed at Tier 2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shared_limiter_replaces_job_delay() {
        let urls = ["https://example.com/a", "https://example.com/b"];
        let fetcher = MockTierFetcher::new()
            .page(urls[0], ok_page("a"))
            .page(urls[1], ok_page("b"));

        // Job asks for no delay; the shared limiter still spaces requests.
        let start = Instant::now();
        runner(fetcher.clone(), MockBackend::new())
            .with_shared_limiter(DomainRateLimiter::with_delay(Duration::from_secs(2)))
            .run_job(
                &job(&urls).with_min_delay(Duration::ZERO),
                &CancellationToken::new(),
                &MockReporter::new(),
            )
            .await;
        assert!(start.elapsed() >= Duration::from_secs(2));

        // Job asks for 5s; a zero-delay shared limiter wins.
        let start = Instant::now();
        runner(fetcher, MockBackend::new())
            .with_shared_limiter(DomainRateLimiter::with_delay(Duration::ZERO))
            .run_job(
                &job(&urls).with_min_delay(Duration::from_secs(5)),
                &CancellationToken::new(),
                &MockReporter::new(),
            )
            .await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn extractor_receives_trimmed_queries() {
        let extractor = MockExtractor::new();
        let fetcher = MockTierFetcher::new().page("https://example.com/", ok_page("x"));
        let spec = JobSpec::new(
            vec![" https://example.com/ ".into()],
            vec![
                Query::new("digits", QueryType::Regex, " \\d+ "),
                Query::new("title", QueryType::Xpath, "\n//title/text() "),
            ],
        );

        let outcome = CrawlJobRunner::new(fetcher.clone(), extractor.clone(), MockBackend::new())
            .with_url_guard(UrlGuard::with_resolver(resolver()))
            .run_job(&spec, &CancellationToken::new(), &MockReporter::new())
            .await;

        assert_eq!(outcome.status(), JobStatus::Ready);
        assert_eq!(fetcher.fetched_urls(), vec!["https://example.com/"]);
        let calls = extractor.calls();
        assert_eq!(calls.len(), 1);
        let expressions: Vec<&str> = calls[0].iter().map(|q| q.expression.as_str()).collect();
        assert_eq!(expressions, vec!["\\d+", "//title/text()"]);
    }

    #[tokio::test]
    async fn padded_query_name_fails_the_job() {
        let fetcher = MockTierFetcher::new().page("https://example.com/", ok_page("x"));
        let backend = MockBackend::new();
        let spec = JobSpec::new(
            vec!["https://example.com/".into()],
            vec![Query::new("title ", QueryType::Xpath, "//title/text()")],
        );

        let outcome = runner(fetcher.clone(), backend.clone())
            .run_job(&spec, &CancellationToken::new(), &MockReporter::new())
            .await;

        assert!(matches!(outcome, JobOutcome::Error(ref m) if m.contains("invalid query name")));
        assert_eq!(backend.job_statuses(), vec![JobStatus::Error]);
        assert!(fetcher.fetched_urls().is_empty());
    }

    #[tokio::test]
    async fn invalid_job_is_rejected_whole() {
        let fetcher = MockTierFetcher::new();
        let backend = MockBackend::new();
        let spec = JobSpec::new(
            vec!["https://example.com/".into()],
            vec![Query::new("x", QueryType::Regex, "(a+)+")],
        );

        let outcome = runner(fetcher.clone(), backend.clone())
            .run_job(&spec, &CancellationToken::new(), &MockReporter::new())
            .await;

        assert!(matches!(outcome, JobOutcome::Error(ref m) if m.contains("backtracking")));
        assert_eq!(backend.job_statuses(), vec![JobStatus::Error]);
        assert!(fetcher.fetched_urls().is_empty());
    }
}
