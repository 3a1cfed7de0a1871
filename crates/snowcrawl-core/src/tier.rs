//! Escalation tiers and their static cost table.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One rung of the fetch escalation ladder, ordered by cost and capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Tier {
    /// Direct HTTP GET with browser-like headers.
    Lightweight = 1,
    /// Tier 1 routed through a rotating proxy.
    IpRotation = 2,
    /// Headless browser rendering.
    Browser = 3,
    /// Browser rendering plus automated challenge solving.
    Captcha = 4,
}

impl Tier {
    pub const MIN: Tier = Tier::Lightweight;
    pub const MAX: Tier = Tier::Captcha;

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// The next tier up, or `None` at the top of the ladder.
    pub fn next(self) -> Option<Tier> {
        Tier::try_from(self.ordinal() + 1).ok()
    }

    pub fn spec(self) -> &'static TierSpec {
        &TIERS[usize::from(self.ordinal() - 1)]
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::Lightweight),
            2 => Ok(Tier::IpRotation),
            3 => Ok(Tier::Browser),
            4 => Ok(Tier::Captcha),
            other => Err(format!("tier must be between 1 and 4, got {other}")),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        tier.ordinal()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tier {} ({})", self.ordinal(), self.name())
    }
}

/// Static metadata for a tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierSpec {
    pub tier: Tier,
    pub name: &'static str,
    pub description: &'static str,
    /// Approximate cost in USD per fetched page.
    pub cost_per_page: f64,
    #[serde(serialize_with = "serialize_secs")]
    pub expected_latency: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

pub const TIERS: [TierSpec; 4] = [
    TierSpec {
        tier: Tier::Lightweight,
        name: "Lightweight",
        description: "Fast requests-based scraping",
        cost_per_page: 0.0001,
        expected_latency: Duration::from_secs(2),
    },
    TierSpec {
        tier: Tier::IpRotation,
        name: "IP Rotation",
        description: "Residential proxy for IP-based blocking",
        cost_per_page: 0.005,
        expected_latency: Duration::from_secs(4),
    },
    TierSpec {
        tier: Tier::Browser,
        name: "Browser Mode",
        description: "Full headless browser with stealth",
        cost_per_page: 0.08,
        expected_latency: Duration::from_secs(12),
    },
    TierSpec {
        tier: Tier::Captcha,
        name: "CAPTCHA Solving",
        description: "Browser + automatic CAPTCHA solving",
        cost_per_page: 0.15,
        expected_latency: Duration::from_secs(25),
    },
];

/// Estimated spend for fetching `pages` pages at `tier`.
pub fn estimate_cost(tier: Tier, pages: u64) -> f64 {
    tier.spec().cost_per_page * pages as f64
}
