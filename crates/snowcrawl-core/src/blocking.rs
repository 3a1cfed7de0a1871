//! Bot-protection detection on fetched responses.
//!
//! Content matching is kept to phrases that only appear on challenge or
//! interstitial pages. Generic words such as "captcha" or a vendor name show
//! up in the scripts of ordinary pages and would trigger needless escalation.

use serde::{Deserialize, Serialize};

use crate::models::FetchedPage;

/// Challenge-page phrases (lowercase) and the indicator each one raises.
const CHALLENGE_PHRASES: &[(&str, &str)] = &[
    ("just a moment...", "cloudflare_challenge"),
    ("attention required! | cloudflare", "cloudflare_challenge"),
    ("cf-browser-verification", "cloudflare_browser_verification"),
    ("_cf_chl_opt", "cloudflare_browser_verification"),
    ("checking your browser", "browser_check"),
    ("verify you are human", "human_verification"),
    ("please complete the security check", "security_check"),
    ("unusual traffic from your computer network", "unusual_traffic"),
    ("px-captcha", "perimeterx_detected"),
    ("captcha-delivery.com", "datadome_detected"),
    ("pardon our interruption", "distil_detected"),
    ("incapsula incident id", "incapsula_detected"),
    ("<title>access denied", "access_denied"),
];

/// Indicators derived from one response. Non-empty means blocked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingSignal {
    pub indicators: Vec<String>,
}

impl BlockingSignal {
    pub fn is_blocked(&self) -> bool {
        !self.indicators.is_empty()
    }

    fn push(&mut self, indicator: &str) {
        if !self.indicators.iter().any(|i| i == indicator) {
            self.indicators.push(indicator.to_string());
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockingDetector {
    /// Bodies shorter than this (after trimming) count as suspicious, but
    /// only alongside another indicator or an error status.
    min_body_len: usize,
}

impl Default for BlockingDetector {
    fn default() -> Self {
        Self { min_body_len: 200 }
    }
}

impl BlockingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_body_len(mut self, len: usize) -> Self {
        self.min_body_len = len;
        self
    }

    /// Inspect a status code and body for signs of a bot-protection challenge.
    pub fn detect(&self, status: u16, body: &str) -> BlockingSignal {
        self.inspect(status, Some(body))
    }

    /// Like [`detect`](Self::detect), but PDF and JSON responses are judged
    /// on status alone: challenge pages are HTML.
    pub fn detect_page(&self, page: &FetchedPage) -> BlockingSignal {
        if page.is_pdf() || page.is_json() {
            return self.inspect(page.status, None);
        }
        self.inspect(page.status, Some(page.text().as_ref()))
    }

    fn inspect(&self, status: u16, body: Option<&str>) -> BlockingSignal {
        let mut signal = BlockingSignal::default();

        match status {
            403 => signal.push("403_forbidden"),
            429 => signal.push("429_rate_limited"),
            503 => signal.push("503_service_unavailable"),
            _ => {}
        }

        if let Some(body) = body {
            let lower = body.to_lowercase();
            for (phrase, indicator) in CHALLENGE_PHRASES {
                if lower.contains(phrase) {
                    signal.push(indicator);
                }
            }

            let minimal = body.trim().chars().count() < self.min_body_len;
            if minimal && (signal.is_blocked() || status >= 400) {
                signal.push("minimal_content");
            }
        }

        if signal.is_blocked() {
            tracing::debug!(status, indicators = ?signal.indicators, "Blocking detected");
        }
        signal
    }
}
