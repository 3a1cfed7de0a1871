//! SSRF protection for outbound fetches.
//!
//! Every URL is re-validated right before it is fetched: the host is resolved
//! to all of its addresses and the URL is refused if any of them lands in a
//! loopback, private, link-local or otherwise internal range. Running the
//! check at fetch time (rather than only when the job is created) narrows the
//! window for DNS rebinding.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::error::UrlError;

/// Resolves a hostname to every address it currently points at.
pub trait HostResolver: Send + Sync + Clone {
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Vec<IpAddr>>> + Send;
}

/// Resolver backed by the system DNS configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Validates URLs against the blocked address table.
#[derive(Debug, Clone, Default)]
pub struct UrlGuard<H = SystemResolver> {
    resolver: H,
    allow_private: bool,
}

impl UrlGuard<SystemResolver> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<H: HostResolver> UrlGuard<H> {
    pub fn with_resolver(resolver: H) -> Self {
        Self {
            resolver,
            allow_private: false,
        }
    }

    /// Skip the address checks. Only meant for crawling local test fixtures.
    pub fn allow_private(mut self, allow: bool) -> Self {
        self.allow_private = allow;
        self
    }

    /// Validate `raw` and return it normalised (trimmed, fragment removed).
    pub async fn validate(&self, raw: &str) -> Result<Url, UrlError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(UrlError::Empty);
        }

        let mut url = Url::parse(trimmed).map_err(|e| UrlError::Malformed(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(UrlError::SchemeNotAllowed(other.to_string())),
        }
        url.set_fragment(None);

        if self.allow_private {
            return Ok(url);
        }

        let host = url.host().ok_or(UrlError::MissingHost)?;
        match host {
            Host::Ipv4(v4) => check_ip(&v4.to_string(), IpAddr::V4(v4))?,
            Host::Ipv6(v6) => check_ip(&v6.to_string(), IpAddr::V6(v6))?,
            Host::Domain(domain) => {
                if domain.is_empty() {
                    return Err(UrlError::MissingHost);
                }
                if is_localhost(domain) {
                    return Err(UrlError::Localhost);
                }
                let port = url.port_or_known_default().unwrap_or(80);
                let addrs = self.resolver.resolve(domain, port).await.map_err(|e| {
                    UrlError::Unresolvable {
                        host: domain.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                if addrs.is_empty() {
                    return Err(UrlError::Unresolvable {
                        host: domain.to_string(),
                        reason: "no addresses returned".into(),
                    });
                }
                for ip in addrs {
                    check_ip(domain, ip)?;
                }
            }
        }

        Ok(url)
    }
}

fn check_ip(host: &str, ip: IpAddr) -> Result<(), UrlError> {
    if is_blocked_ip(ip) {
        tracing::warn!(%host, %ip, "SSRF attempt blocked");
        return Err(UrlError::Blocked {
            host: host.to_string(),
            ip,
        });
    }
    Ok(())
}

fn is_localhost(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost")
}

/// Check an address given as text. Anything that fails to parse is blocked.
pub fn is_blocked_addr(addr: &str) -> bool {
    addr.trim()
        .parse::<IpAddr>()
        .map_or(true, is_blocked_ip)
}

/// Returns true if `ip` falls in a range outbound fetches must never reach.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_blocked_v4(v4),
            None => is_blocked_v6(v6),
        },
    }
}

fn is_blocked_v4(v4: Ipv4Addr) -> bool {
    v4.is_loopback()            // 127.0.0.0/8
        || v4.is_private()      // 10/8, 172.16/12, 192.168/16
        || v4.is_link_local()   // 169.254.0.0/16, cloud metadata
        || v4.octets()[0] == 0  // 0.0.0.0/8
        || v4.is_broadcast()
        || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
}

fn is_blocked_v6(v6: Ipv6Addr) -> bool {
    v6.is_loopback()            // ::1
        || v6.is_unspecified()  // ::
        || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
        || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
}
