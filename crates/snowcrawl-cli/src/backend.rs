//! In-process job backend for single runs from the command line.
//!
//! There is no job store behind the CLI: status lives in memory, progress is
//! logged, and cancellation comes from Ctrl-C through the runner's token.

use std::sync::{Arc, Mutex};

use snowcrawl_core::error::AppError;
use snowcrawl_core::job::{JobState, JobStatus};
use snowcrawl_core::models::{CrawlResult, JobProgress, UrlStatus};
use snowcrawl_core::traits::{JobStatusSource, ProgressSink, ResultSink};
use uuid::Uuid;

#[derive(Clone)]
pub struct LocalBackend {
    status: Arc<Mutex<JobStatus>>,
    results: Arc<Mutex<Vec<CrawlResult>>>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            status: Arc::new(Mutex::new(JobStatus::Ready)),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Results saved by the last run.
    pub fn results(&self) -> Vec<CrawlResult> {
        self.results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl JobStatusSource for LocalBackend {
    async fn job_state(&self, _job_id: Uuid) -> Result<JobState, AppError> {
        Ok(JobState {
            status: self.status(),
            cancelled: false,
        })
    }
}

impl ProgressSink for LocalBackend {
    async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<(), AppError> {
        tracing::info!(
            %job_id,
            processed = progress.processed,
            total = progress.total,
            failed = progress.failed,
            "Progress {:.1}%",
            progress.percentage
        );
        Ok(())
    }

    async fn update_url_status(&self, _job_id: Uuid, url: &str, status: UrlStatus) -> Result<(), AppError> {
        tracing::debug!(%url, ?status, "URL status");
        Ok(())
    }

    async fn update_job_status(&self, _job_id: Uuid, status: JobStatus) -> Result<(), AppError> {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
        Ok(())
    }
}

impl ResultSink for LocalBackend {
    async fn save_results(&self, _job_id: Uuid, results: &[CrawlResult]) -> Result<(), AppError> {
        *self.results.lock().unwrap_or_else(|p| p.into_inner()) = results.to_vec();
        Ok(())
    }
}
