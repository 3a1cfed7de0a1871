//! Tiered fetch escalation.
//!
//! Each URL starts at the job's minimum tier. A tier that is blocked,
//! unavailable or fails is followed by exactly the next tier, until a tier
//! succeeds, auto-escalation is off, or the maximum tier has been tried.

use serde::{Deserialize, Serialize};

use crate::blocking::BlockingDetector;
use crate::error::AppError;
use crate::job::CrawlTarget;
use crate::models::FetchedPage;
use crate::tier::Tier;
use crate::traits::TierFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Blocked,
    Unavailable,
    Error,
}

/// One tier tried for one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationAttempt {
    pub tier: Tier,
    pub outcome: AttemptOutcome,
    pub message: String,
}

/// What a single tier produced, before the controller decides what to do.
#[derive(Debug)]
enum TierOutcome {
    Success(FetchedPage),
    Blocked { status: u16, indicators: Vec<String> },
    Unavailable(String),
    Error(AppError),
}

/// Result of escalating one URL.
#[derive(Debug)]
pub struct EscalationReport {
    /// The page from the first tier that succeeded, or the final failure.
    pub result: Result<FetchedPage, AppError>,
    /// The last tier tried (the successful one on success).
    pub tier: Tier,
    /// Status of the last response received, if any tier got that far.
    pub last_status: Option<u16>,
    pub attempts: Vec<EscalationAttempt>,
}

impl EscalationReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Human-readable steps in order, including the escalation hops.
    pub fn log_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.attempts.len() * 3);
        for (i, attempt) in self.attempts.iter().enumerate() {
            if i > 0 {
                lines.push(format!("Escalating to Tier {}", attempt.tier.ordinal()));
            }
            lines.push(format!("Attempting {}", attempt.tier));
            lines.push(attempt.message.clone());
        }
        lines
    }
}

#[derive(Debug, Clone, Default)]
pub struct EscalationController {
    detector: BlockingDetector,
}

impl EscalationController {
    pub fn new(detector: BlockingDetector) -> Self {
        Self { detector }
    }

    /// Fetch `target`, escalating through tiers as its policy allows.
    pub async fn run<F: TierFetcher>(
        &self,
        fetcher: &F,
        session: &F::Session,
        target: &CrawlTarget,
    ) -> EscalationReport {
        let policy = target.config.escalation;
        let mut tier = policy.min_tier;
        let mut attempts = Vec::new();
        let mut last_status = None;

        loop {
            tracing::info!(url = %target.url, tier = tier.ordinal(), "Attempting {tier}");

            let outcome = self.attempt(fetcher, session, target, tier).await;
            let (attempt, reason) = match outcome {
                TierOutcome::Success(page) => {
                    tracing::info!(
                        url = %target.url,
                        tier = tier.ordinal(),
                        cost = tier.spec().cost_per_page,
                        "Fetch succeeded"
                    );
                    last_status = Some(page.status);
                    attempts.push(EscalationAttempt {
                        tier,
                        outcome: AttemptOutcome::Success,
                        message: format!("Success with Tier {}", tier.ordinal()),
                    });
                    return EscalationReport {
                        result: Ok(page),
                        tier,
                        last_status,
                        attempts,
                    };
                }
                TierOutcome::Blocked { status, indicators } => {
                    tracing::warn!(url = %target.url, tier = tier.ordinal(), ?indicators, "Tier blocked");
                    last_status = Some(status);
                    let joined = indicators.join(", ");
                    (
                        EscalationAttempt {
                            tier,
                            outcome: AttemptOutcome::Blocked,
                            message: format!("Tier {} blocked: {joined}", tier.ordinal()),
                        },
                        format!("blocked ({joined})"),
                    )
                }
                TierOutcome::Unavailable(reason) => {
                    tracing::warn!(url = %target.url, tier = tier.ordinal(), %reason, "Tier unavailable");
                    (
                        EscalationAttempt {
                            tier,
                            outcome: AttemptOutcome::Unavailable,
                            message: format!("Tier {} not available: {reason}", tier.ordinal()),
                        },
                        reason,
                    )
                }
                TierOutcome::Error(e) => {
                    tracing::error!(url = %target.url, tier = tier.ordinal(), error = %e, "Tier failed");
                    (
                        EscalationAttempt {
                            tier,
                            outcome: AttemptOutcome::Error,
                            message: format!("Tier {} error: {e}", tier.ordinal()),
                        },
                        e.to_string(),
                    )
                }
            };
            attempts.push(attempt);

            let next = tier.next().filter(|n| policy.auto_escalate && *n <= policy.max_tier);
            match next {
                Some(n) => tier = n,
                None => {
                    return EscalationReport {
                        result: Err(AppError::TiersExhausted {
                            tier: tier.ordinal(),
                            reason,
                        }),
                        tier,
                        last_status,
                        attempts,
                    };
                }
            }
        }
    }

    async fn attempt<F: TierFetcher>(
        &self,
        fetcher: &F,
        session: &F::Session,
        target: &CrawlTarget,
        tier: Tier,
    ) -> TierOutcome {
        match fetcher.fetch_at(tier, session, target).await {
            Ok(page) => {
                let signal = self.detector.detect_page(&page);
                if signal.is_blocked() {
                    TierOutcome::Blocked {
                        status: page.status,
                        indicators: signal.indicators,
                    }
                } else {
                    TierOutcome::Success(page)
                }
            }
            Err(AppError::TierUnavailable { reason, .. }) => TierOutcome::Unavailable(reason),
            Err(e) => TierOutcome::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::job::{EscalationPolicy, FetchConfig};
    use crate::testutil::{MockTierFetcher, ok_page};

    fn target(policy: EscalationPolicy) -> CrawlTarget {
        let config = FetchConfig {
            escalation: policy,
            ..FetchConfig::default()
        };
        CrawlTarget::new("https://example.com/", Arc::new(config))
    }

    fn policy(min: Tier, max: Tier, auto: bool) -> EscalationPolicy {
        EscalationPolicy {
            min_tier: min,
            max_tier: max,
            auto_escalate: auto,
        }
    }

    #[tokio::test]
    async fn success_on_first_tier() {
        let fetcher = MockTierFetcher::new().on(Tier::Lightweight, Ok(ok_page("hello")));
        let report = EscalationController::default()
            .run(&fetcher, &(), &target(EscalationPolicy::default()))
            .await;

        assert!(report.is_success());
        assert_eq!(report.tier, Tier::Lightweight);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].message, "Success with Tier 1");
        assert_eq!(fetcher.calls(), vec![Tier::Lightweight]);
    }

    #[tokio::test]
    async fn blocked_then_unavailable_exhausts_at_max_tier() {
        let fetcher = MockTierFetcher::new()
            .on(Tier::Lightweight, Ok(FetchedPage::html(403, "Forbidden")))
            .on(
                Tier::IpRotation,
                Err(AppError::TierUnavailable {
                    tier: 2,
                    reason: "no proxy available".into(),
                }),
            );
        let report = EscalationController::default()
            .run(
                &fetcher,
                &(),
                &target(policy(Tier::Lightweight, Tier::IpRotation, true)),
            )
            .await;

        match &report.result {
            Err(AppError::TiersExhausted { tier, reason }) => {
                assert_eq!(*tier, 2);
                assert_eq!(reason, "no proxy available");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(report.tier, Tier::IpRotation);
        assert_eq!(report.last_status, Some(403));
        let outcomes: Vec<_> = report.attempts.iter().map(|a| (a.tier, a.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                (Tier::Lightweight, AttemptOutcome::Blocked),
                (Tier::IpRotation, AttemptOutcome::Unavailable),
            ]
        );
        assert!(report.attempts[0].message.starts_with("Tier 1 blocked: 403_forbidden"));
        assert_eq!(
            report.log_lines(),
            vec![
                "Attempting Tier 1 (Lightweight)".to_string(),
                "Tier 1 blocked: 403_forbidden, minimal_content".to_string(),
                "Escalating to Tier 2".to_string(),
                "Attempting Tier 2 (IP Rotation)".to_string(),
                "Tier 2 not available: no proxy available".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn escalates_one_tier_at_a_time() {
        let fetcher = MockTierFetcher::new()
            .on(Tier::Lightweight, Ok(FetchedPage::html(429, "slow down")))
            .on(Tier::IpRotation, Err(AppError::NetworkError("reset".into())))
            .on(Tier::Browser, Ok(ok_page("rendered")));
        let report = EscalationController::default()
            .run(&fetcher, &(), &target(EscalationPolicy::default()))
            .await;

        assert!(report.is_success());
        assert_eq!(report.tier, Tier::Browser);
        assert_eq!(
            fetcher.calls(),
            vec![Tier::Lightweight, Tier::IpRotation, Tier::Browser]
        );
        assert!(
            report
                .attempts
                .windows(2)
                .all(|w| w[1].tier.ordinal() == w[0].tier.ordinal() + 1)
        );
    }

    #[tokio::test]
    async fn no_auto_escalation_stops_at_first_failure() {
        let fetcher = MockTierFetcher::new()
            .on(Tier::Lightweight, Ok(FetchedPage::html(403, "Forbidden")));
        let report = EscalationController::default()
            .run(
                &fetcher,
                &(),
                &target(policy(Tier::Lightweight, Tier::Captcha, false)),
            )
            .await;

        assert!(matches!(
            report.result,
            Err(AppError::TiersExhausted { tier: 1, .. })
        ));
        assert_eq!(fetcher.calls(), vec![Tier::Lightweight]);
    }

    #[tokio::test]
    async fn starts_at_min_tier() {
        let fetcher = MockTierFetcher::new().on(Tier::Browser, Ok(ok_page("rendered")));
        let report = EscalationController::default()
            .run(
                &fetcher,
                &(),
                &target(policy(Tier::Browser, Tier::Captcha, true)),
            )
            .await;

        assert!(report.is_success());
        assert_eq!(fetcher.calls(), vec![Tier::Browser]);
    }

    #[tokio::test]
    async fn top_tier_failure_exhausts() {
        let fetcher = MockTierFetcher::new();
        let report = EscalationController::default()
            .run(
                &fetcher,
                &(),
                &target(policy(Tier::Browser, Tier::Captcha, true)),
            )
            .await;

        assert!(matches!(
            report.result,
            Err(AppError::TiersExhausted { tier: 4, .. })
        ));
        assert_eq!(fetcher.calls(), vec![Tier::Browser, Tier::Captcha]);
    }
}
