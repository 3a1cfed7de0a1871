//! Per-domain request throttling for polite fetching.
//!
//! The job runner calls [`DomainRateLimiter::wait_if_needed`] before every
//! fetch so that consecutive requests to the same host are spaced by at least
//! the configured minimum delay. Different domains never wait on each other.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use snowcrawl_core::throttle::{DomainRateLimiter, ThrottleConfig};
//!
//! # async fn run() {
//! let limiter = DomainRateLimiter::new(
//!     ThrottleConfig::new(Duration::from_secs(1)).with_jitter(Duration::from_millis(250)),
//! );
//! limiter.wait_if_needed("https://example.com/a").await;
//! // Sleeps ~1s before returning.
//! limiter.wait_if_needed("https://example.com/b").await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::util;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive requests to the same domain.
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter]).
    ///
    /// Set to `Duration::ZERO` to disable.
    pub jitter: Duration,

    /// Once the domain map holds more entries than this, domains idle for
    /// longer than the delay are dropped.
    pub max_domains: usize,
}

impl ThrottleConfig {
    /// Create a new config with the given per-domain delay and no jitter.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
            max_domains: 10_000,
        }
    }

    /// Add random jitter (uniform [0, jitter]) on top of the base delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_domains(mut self, max: usize) -> Self {
        self.max_domains = max.max(1);
        self
    }

    /// Compute the effective delay for a single wait (delay + random jitter).
    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let jitter_ms = util::random_below(self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for ThrottleConfig {
    /// 1 second delay, no jitter.
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Enforces a minimum delay between requests to the same domain.
///
/// Cloning shares the underlying state, so one limiter can be handed to
/// several tasks (or several jobs) and still serialise access per domain.
#[derive(Debug, Clone)]
pub struct DomainRateLimiter {
    config: ThrottleConfig,
    /// Time the most recent permitted request per domain is scheduled at.
    last_request: Arc<Mutex<HashMap<String, Instant>>>,
}

impl DomainRateLimiter {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            last_request: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::new(ThrottleConfig::new(delay))
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// The domain key of a URL (its host and port, as in `netloc`).
    pub fn domain_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    /// Block until this domain may be requested again, then record the
    /// request. Returns how long the caller waited.
    ///
    /// The slot is reserved while the lock is held and the sleep happens after
    /// releasing it, so concurrent callers for one domain queue up behind each
    /// other while other domains proceed.
    pub async fn wait_if_needed(&self, url: &str) -> Duration {
        if self.config.delay.is_zero() {
            return Duration::ZERO;
        }
        let Some(domain) = Self::domain_key(url) else {
            return Duration::ZERO;
        };

        let now = Instant::now();
        let scheduled = {
            let mut map = self.last_request.lock().await;
            if map.len() >= self.config.max_domains {
                self.prune(&mut map, now);
            }
            let scheduled = match map.get(&domain) {
                Some(&last) => (last + self.config.effective_delay()).max(now),
                None => now,
            };
            map.insert(domain.clone(), scheduled);
            scheduled
        };

        let wait = scheduled.saturating_duration_since(now);
        if !wait.is_zero() {
            tracing::debug!(
                domain = %domain,
                sleep_ms = %wait.as_millis(),
                "Throttling request"
            );
            tokio::time::sleep_until(scheduled).await;
        }
        wait
    }

    /// Forget the last request time for one domain, or for all of them.
    pub async fn reset(&self, domain: Option<&str>) {
        let mut map = self.last_request.lock().await;
        match domain {
            Some(d) => {
                map.remove(d);
            }
            None => map.clear(),
        }
    }

    /// Number of domains currently tracked.
    pub async fn tracked_domains(&self) -> usize {
        self.last_request.lock().await.len()
    }

    fn prune(&self, map: &mut HashMap<String, Instant>, now: Instant) {
        let horizon = self.config.delay + self.config.jitter;
        let before = map.len();
        map.retain(|_, last| now.saturating_duration_since(*last) < horizon);
        tracing::debug!(removed = before - map.len(), "Pruned idle domains");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_key_extracts_netloc() {
        assert_eq!(
            DomainRateLimiter::domain_key("https://example.com/path?q=1"),
            Some("example.com".to_string())
        );
        assert_eq!(
            DomainRateLimiter::domain_key("http://example.com:8080/page"),
            Some("example.com:8080".to_string())
        );
        assert_eq!(DomainRateLimiter::domain_key("not-a-url"), None);
    }

    #[test]
    fn effective_delay_with_jitter_is_bounded() {
        let config =
            ThrottleConfig::new(Duration::from_millis(100)).with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let d = config.effective_delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_domain_waits_for_delay() {
        let limiter = DomainRateLimiter::with_delay(Duration::from_secs(1));

        let start = Instant::now();
        assert_eq!(
            limiter.wait_if_needed("http://example.com/page1").await,
            Duration::ZERO
        );
        let waited = limiter.wait_if_needed("http://example.com/page2").await;

        assert_eq!(waited, Duration::from_secs(1));
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_accounts_for_elapsed_time() {
        let limiter = DomainRateLimiter::with_delay(Duration::from_secs(1));

        limiter.wait_if_needed("http://example.com/a").await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        let waited = limiter.wait_if_needed("http://example.com/b").await;

        assert_eq!(waited, Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn different_domains_do_not_block() {
        let limiter = DomainRateLimiter::with_delay(Duration::from_secs(5));

        let start = Instant::now();
        limiter.wait_if_needed("http://example.com/page1").await;
        limiter.wait_if_needed("http://other.com/page1").await;

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_serialised_per_domain() {
        let limiter = DomainRateLimiter::with_delay(Duration::from_secs(1));
        let start = Instant::now();

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .wait_if_needed(&format!("http://example.com/{i}"))
                        .await
                })
            })
            .collect();
        let mut waits = Vec::new();
        for h in handles {
            waits.push(h.await.unwrap());
        }
        waits.sort();

        assert_eq!(
            waits,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(2)
            ]
        );
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_disables_waiting() {
        let limiter = DomainRateLimiter::with_delay(Duration::ZERO);
        for _ in 0..3 {
            assert_eq!(
                limiter.wait_if_needed("http://example.com/").await,
                Duration::ZERO
            );
        }
        assert_eq!(limiter.tracked_domains().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forgets_domains() {
        let limiter = DomainRateLimiter::with_delay(Duration::from_secs(1));
        limiter.wait_if_needed("http://a.com/").await;
        limiter.wait_if_needed("http://b.com/").await;

        limiter.reset(Some("a.com")).await;
        assert_eq!(
            limiter.wait_if_needed("http://a.com/").await,
            Duration::ZERO
        );

        limiter.reset(None).await;
        assert_eq!(limiter.tracked_domains().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_domains_are_pruned() {
        let limiter = DomainRateLimiter::new(
            ThrottleConfig::new(Duration::from_millis(100)).with_max_domains(2),
        );
        limiter.wait_if_needed("http://a.com/").await;
        limiter.wait_if_needed("http://b.com/").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        limiter.wait_if_needed("http://c.com/").await;
        assert_eq!(limiter.tracked_domains().await, 1);
    }
}
