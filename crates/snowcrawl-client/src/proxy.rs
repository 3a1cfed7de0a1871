//! Fixed-list proxy provider for local runs.
//!
//! Endpoints are configured up front (CLI flags or a job file). The pool
//! filters by region, skips endpoints that failed repeatedly until a cooldown
//! passes, and keeps per-endpoint usage counters.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use snowcrawl_core::job::{ProxyPolicy, Rotation};
use snowcrawl_core::traits::{ProxyEndpoint, ProxyProvider};
use snowcrawl_core::util;

/// Consecutive failures before an endpoint is rested.
const DEFAULT_MAX_FAILURES: u32 = 3;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Usage counters for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyStats {
    /// Masked endpoint URL.
    pub proxy: String,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub bytes: u64,
}

#[derive(Debug)]
struct Slot {
    endpoint: ProxyEndpoint,
    requests: u64,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    bytes: u64,
    last_failure: Option<Instant>,
}

impl Slot {
    fn healthy(&self, max_failures: u32, cooldown: Duration) -> bool {
        self.consecutive_failures < max_failures
            || self.last_failure.is_none_or(|t| t.elapsed() >= cooldown)
    }
}

/// Proxy provider over a fixed endpoint list.
#[derive(Debug, Clone)]
pub struct StaticProxyPool {
    slots: Arc<Mutex<Vec<Slot>>>,
    max_failures: u32,
    cooldown: Duration,
}

impl StaticProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        let slots = endpoints
            .into_iter()
            .map(|endpoint| Slot {
                endpoint,
                requests: 0,
                successes: 0,
                failures: 0,
                consecutive_failures: 0,
                bytes: 0,
                last_failure: None,
            })
            .collect();
        Self {
            slots: Arc::new(Mutex::new(slots)),
            max_failures: DEFAULT_MAX_FAILURES,
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    /// Rest an endpoint after `max_failures` consecutive failures, for `cooldown`.
    pub fn with_health(mut self, max_failures: u32, cooldown: Duration) -> Self {
        self.max_failures = max_failures.max(1);
        self.cooldown = cooldown;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> Vec<ProxyStats> {
        self.lock()
            .iter()
            .map(|s| ProxyStats {
                proxy: s.endpoint.masked(),
                requests: s.requests,
                successes: s.successes,
                failures: s.failures,
                consecutive_failures: s.consecutive_failures,
                bytes: s.bytes,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn select(&self, policy: &ProxyPolicy) -> Option<ProxyEndpoint> {
        let slots = self.lock();
        let candidates: Vec<&Slot> = slots
            .iter()
            .filter(|s| s.healthy(self.max_failures, self.cooldown))
            .filter(|s| policy.region().is_none_or(|geo| region_matches(geo, s.endpoint.region.as_deref())))
            .collect();

        let chosen = match policy.rotation {
            Rotation::Random => util::pick(&candidates).copied(),
            // Least used first; ties keep list order.
            Rotation::RoundRobin => candidates.iter().min_by_key(|s| s.requests).copied(),
        };
        chosen.map(|s| s.endpoint.clone())
    }

    fn update(&self, endpoint: &ProxyEndpoint, f: impl FnOnce(&mut Slot)) {
        let mut slots = self.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.endpoint.url == endpoint.url) {
            f(slot);
        }
    }
}

/// Whether an endpoint's region serves a geo target.
///
/// `us`, `eu` and `as` cover the regions whose names start with `us-`, `eu-`
/// and `ap-`; any other target must equal the region name.
pub fn region_matches(geo: &str, region: Option<&str>) -> bool {
    let Some(region) = region else {
        return false;
    };
    let geo = geo.to_ascii_lowercase();
    let region = region.to_ascii_lowercase();
    let prefix = match geo.as_str() {
        "us" => "us-",
        "eu" => "eu-",
        "as" => "ap-",
        _ => return region == geo,
    };
    region == geo || region.starts_with(prefix)
}

impl ProxyProvider for StaticProxyPool {
    async fn endpoint(&self, policy: &ProxyPolicy) -> Option<ProxyEndpoint> {
        let selected = self.select(policy);
        match &selected {
            Some(ep) => tracing::info!(
                proxy = %ep.masked(),
                region = ep.region.as_deref().unwrap_or("-"),
                rotation = ?policy.rotation,
                "Selected proxy"
            ),
            None => tracing::warn!(geo = policy.region().unwrap_or("any"), "No healthy proxies available"),
        }
        selected
    }

    async fn mark_failed(&self, endpoint: &ProxyEndpoint, reason: &str) {
        tracing::warn!(proxy = %endpoint.masked(), %reason, "Proxy marked as failed");
        self.update(endpoint, |slot| {
            slot.requests += 1;
            slot.failures += 1;
            slot.consecutive_failures += 1;
            slot.last_failure = Some(Instant::now());
        });
    }

    async fn record_usage(&self, endpoint: &ProxyEndpoint, success: bool, bytes: u64) {
        tracing::debug!(proxy = %endpoint.masked(), success, bytes, "Proxy usage tracked");
        self.update(endpoint, |slot| {
            slot.requests += 1;
            slot.bytes += bytes;
            if success {
                slot.successes += 1;
                slot.consecutive_failures = 0;
            } else {
                slot.failures += 1;
            }
        });
    }
}
