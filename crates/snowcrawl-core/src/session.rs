//! Browsing identity reused across all URLs of a job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::traits::SessionStore;
use crate::util;

pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
    "Mozilla/5.0 (Linux; Android 14; SM-S918B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36",
];

pub const REFERRERS: &[&str] = &[
    "https://www.google.com/",
    "https://www.bing.com/",
    "https://duckduckgo.com/",
];

/// User agent and referrer presented for every request of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProfile {
    pub user_agent: String,
    pub referrer: String,
    pub created_at: DateTime<Utc>,
}

impl SessionProfile {
    pub fn new(user_agent: impl Into<String>, referrer: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            referrer: referrer.into(),
            created_at: Utc::now(),
        }
    }

    /// A fresh identity drawn from the built-in pools.
    pub fn random() -> Self {
        let ua = util::pick(USER_AGENTS).copied().unwrap_or(USER_AGENTS[0]);
        let referrer = util::pick(REFERRERS).copied().unwrap_or(REFERRERS[0]);
        Self::new(ua, referrer)
    }
}

/// In-process session store with a size bound and idle expiry.
#[derive(Clone)]
pub struct MemorySessionStore {
    cache: Cache<Uuid, SessionProfile>,
}

impl MemorySessionStore {
    pub fn new(max_capacity: u64, time_to_idle: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_idle(time_to_idle)
                .build(),
        }
    }
}

impl Default for MemorySessionStore {
    /// 1000 sessions, dropped after a day without use.
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(24 * 60 * 60))
    }
}

impl SessionStore for MemorySessionStore {
    async fn load(&self, job_id: Uuid) -> Option<SessionProfile> {
        self.cache.get(&job_id).await
    }

    async fn save(&self, job_id: Uuid, profile: &SessionProfile) {
        self.cache.insert(job_id, profile.clone()).await;
    }
}
