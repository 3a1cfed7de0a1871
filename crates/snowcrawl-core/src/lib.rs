pub mod blocking;
pub mod error;
pub mod escalation;
pub mod job;
pub mod models;
pub mod query_guard;
pub mod runner;
pub mod session;
pub mod throttle;
pub mod tier;
pub mod traits;
pub mod url_guard;
pub mod util;

#[cfg(test)]
pub mod testutil;

pub use blocking::{BlockingDetector, BlockingSignal};
pub use error::{AppError, QueryError, UrlError};
pub use escalation::{EscalationAttempt, EscalationController, EscalationReport};
pub use job::{
    CrawlTarget, EscalationPolicy, FetchConfig, JobSpec, JobState, JobStatus, ProxyPolicy,
    RenderPolicy, RunnerConfig,
};
pub use models::{
    CrawlResult, CrawlStatus, ExtractionMap, ExtractionResult, FetchedPage, JobProgress, Query,
    QueryType, UrlStatus, compute_hash,
};
pub use runner::{
    CrawlJobRunner, JobOutcome, RunnerEvent, RunnerReporter, TracingRunnerReporter,
};
pub use session::{MemorySessionStore, SessionProfile};
pub use throttle::{DomainRateLimiter, ThrottleConfig};
pub use tier::{TIERS, Tier, TierSpec, estimate_cost};
pub use traits::{
    Extractor, JobStatusSource, NoProxies, NoRenderer, NullSessionStore, ProgressSink,
    ProxyEndpoint, ProxyProvider, RenderProvider, RenderRequest, ResultSink, SessionStore,
    TierFetcher,
};
pub use url_guard::{HostResolver, SystemResolver, UrlGuard};
