use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client;
use reqwest::cookie::Jar;
use reqwest::header::{self, HeaderMap, HeaderValue};
use snowcrawl_core::error::AppError;
use snowcrawl_core::job::{CrawlTarget, FetchConfig};
use snowcrawl_core::models::FetchedPage;
use snowcrawl_core::session::SessionProfile;
use snowcrawl_core::tier::Tier;
use snowcrawl_core::traits::{
    NoProxies, NoRenderer, ProxyEndpoint, ProxyProvider, RenderProvider, RenderRequest,
    TierFetcher,
};
use snowcrawl_core::url_guard::is_blocked_ip;
use url::{Host, Url};

/// Redirect hops followed before giving up.
pub const MAX_REDIRECTS: usize = 10;

/// Statuses that mean the proxy (or the path to the origin) failed, not the page.
const RETRY_STATUSES: [u16; 3] = [407, 502, 504];

/// Tier fetcher backed by reqwest.
///
/// Tier 1 is a direct GET with browser-like headers. Tier 2 is the same
/// request routed through an endpoint from the proxy provider. Tiers 3 and 4
/// are delegated to the render provider.
///
/// Transient failures at tiers 1 and 2 (HTTP 407/502/504 or a retryable
/// transport error) are retried in place with exponential backoff, picking a
/// fresh proxy each time, before the tier is reported as failed.
#[derive(Clone)]
pub struct HttpTierFetcher<P = NoProxies, R = NoRenderer> {
    proxies: P,
    renderer: R,
    retry_base: Duration,
    allow_private: bool,
}

impl HttpTierFetcher {
    pub fn new() -> Self {
        Self {
            proxies: NoProxies,
            renderer: NoRenderer,
            retry_base: Duration::from_secs(1),
            allow_private: false,
        }
    }
}

impl Default for HttpTierFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProxyProvider, R: RenderProvider> HttpTierFetcher<P, R> {
    pub fn with_proxies<P2: ProxyProvider>(self, proxies: P2) -> HttpTierFetcher<P2, R> {
        HttpTierFetcher {
            proxies,
            renderer: self.renderer,
            retry_base: self.retry_base,
            allow_private: self.allow_private,
        }
    }

    pub fn with_renderer<R2: RenderProvider>(self, renderer: R2) -> HttpTierFetcher<P, R2> {
        HttpTierFetcher {
            proxies: self.proxies,
            renderer,
            retry_base: self.retry_base,
            allow_private: self.allow_private,
        }
    }

    /// Backoff before retry `n` is `base * 2^n`.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Follow redirects to private/reserved addresses.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_redirects(mut self) -> Self {
        self.allow_private = true;
        self
    }

    async fn fetch_http(
        &self,
        tier: Tier,
        session: &HttpSession,
        target: &CrawlTarget,
    ) -> Result<FetchedPage, AppError> {
        let config = &target.config;
        let mut attempt: u32 = 0;

        loop {
            let proxy = match tier {
                Tier::IpRotation => self.pick_proxy(config).await?,
                _ => None,
            };
            let client = match &proxy {
                Some(endpoint) => session.proxy_client(endpoint)?,
                None => session.direct.clone(),
            };

            let result = send(&client, &target.url, session.timeout, config.max_body_bytes).await;
            let transient = match &result {
                Ok(page) => RETRY_STATUSES.contains(&page.status),
                Err(e) => e.is_retryable(),
            };

            if let Some(endpoint) = &proxy {
                match &result {
                    Ok(page) if !transient => {
                        self.proxies
                            .record_usage(endpoint, true, page.body.len() as u64)
                            .await;
                    }
                    Ok(page) => {
                        self.proxies
                            .mark_failed(endpoint, &format!("HTTP {}", page.status))
                            .await;
                    }
                    Err(e) => self.proxies.mark_failed(endpoint, &e.to_string()).await,
                }
            }

            if !transient || attempt >= config.max_retries {
                return result;
            }

            let backoff = self.retry_base.saturating_mul(2u32.saturating_pow(attempt));
            attempt += 1;
            tracing::warn!(
                url = %target.url,
                tier = tier.ordinal(),
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                proxy = proxy.as_ref().map(ProxyEndpoint::masked).as_deref(),
                "Transient failure, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn pick_proxy(&self, config: &FetchConfig) -> Result<Option<ProxyEndpoint>, AppError> {
        let policy = &config.proxy;
        if !policy.enabled {
            return Err(AppError::TierUnavailable {
                tier: Tier::IpRotation.ordinal(),
                reason: "proxy rotation disabled".into(),
            });
        }
        match self.proxies.endpoint(policy).await {
            Some(endpoint) => {
                tracing::debug!(proxy = %endpoint.masked(), region = ?endpoint.region, "Using proxy");
                Ok(Some(endpoint))
            }
            None if policy.fallback_to_direct => {
                tracing::warn!(geo = ?policy.region(), "No proxy available, falling back to direct");
                Ok(None)
            }
            None => Err(AppError::TierUnavailable {
                tier: Tier::IpRotation.ordinal(),
                reason: "no proxy available".into(),
            }),
        }
    }

    async fn fetch_rendered(
        &self,
        tier: Tier,
        session: &HttpSession,
        target: &CrawlTarget,
    ) -> Result<FetchedPage, AppError> {
        let config = &target.config;
        let proxy = if config.proxy.enabled {
            self.proxies.endpoint(&config.proxy).await
        } else {
            None
        };
        let request = RenderRequest {
            url: target.url.clone(),
            policy: config.render.clone(),
            user_agent: session.profile.user_agent.clone(),
            proxy,
            solve_captcha: tier == Tier::Captcha,
        };
        self.renderer.render(&request).await
    }
}

impl<P: ProxyProvider, R: RenderProvider> TierFetcher for HttpTierFetcher<P, R> {
    type Session = HttpSession;

    fn open_session(
        &self,
        profile: &SessionProfile,
        config: &FetchConfig,
    ) -> Result<HttpSession, AppError> {
        HttpSession::open(profile.clone(), config, self.allow_private)
    }

    async fn fetch_at(
        &self,
        tier: Tier,
        session: &HttpSession,
        target: &CrawlTarget,
    ) -> Result<FetchedPage, AppError> {
        match tier {
            Tier::Lightweight | Tier::IpRotation => self.fetch_http(tier, session, target).await,
            Tier::Browser | Tier::Captcha => self.fetch_rendered(tier, session, target).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// HTTP state shared by every URL of one job.
///
/// All clients share one cookie jar, so cookies set on a direct request are
/// sent through proxies too.
pub struct HttpSession {
    profile: SessionProfile,
    jar: Arc<Jar>,
    timeout: Duration,
    intercepts_tls: bool,
    allow_private: bool,
    direct: Client,
    proxied: Mutex<HashMap<String, Client>>,
}

impl HttpSession {
    fn open(
        profile: SessionProfile,
        config: &FetchConfig,
        allow_private: bool,
    ) -> Result<Self, AppError> {
        let jar = Arc::new(Jar::default());
        let timeout = config.request_timeout();
        let direct = build_client(&profile, &jar, timeout, None, false, allow_private)?;
        Ok(Self {
            profile,
            jar,
            timeout,
            intercepts_tls: config.proxy.intercepts_tls,
            allow_private,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    pub fn profile(&self) -> &SessionProfile {
        &self.profile
    }

    fn proxy_client(&self, endpoint: &ProxyEndpoint) -> Result<Client, AppError> {
        let mut clients = self.proxied.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(client) = clients.get(&endpoint.url) {
            return Ok(client.clone());
        }
        let client = build_client(
            &self.profile,
            &self.jar,
            self.timeout,
            Some(endpoint),
            self.intercepts_tls,
            self.allow_private,
        )?;
        clients.insert(endpoint.url.clone(), client.clone());
        Ok(client)
    }
}

fn browser_headers(profile: &SessionProfile) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers.insert(
        header::UPGRADE_INSECURE_REQUESTS,
        HeaderValue::from_static("1"),
    );
    headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("cross-site"));
    headers.insert("sec-fetch-user", HeaderValue::from_static("?1"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    if let Ok(referer) = HeaderValue::from_str(&profile.referrer) {
        headers.insert(header::REFERER, referer);
    }
    headers
}

fn build_client(
    profile: &SessionProfile,
    jar: &Arc<Jar>,
    timeout: Duration,
    proxy: Option<&ProxyEndpoint>,
    accept_invalid_certs: bool,
    allow_private: bool,
) -> Result<Client, AppError> {
    let redirects = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        if !allow_private && !redirect_allowed(attempt.url()) {
            return attempt.error("redirect to private or non-http target blocked");
        }
        attempt.follow()
    });

    let mut builder = Client::builder()
        .user_agent(profile.user_agent.as_str())
        .default_headers(browser_headers(profile))
        .cookie_provider(Arc::clone(jar))
        .redirect(redirects)
        .timeout(timeout);

    if let Some(endpoint) = proxy {
        let proxy = reqwest::Proxy::all(endpoint.url.as_str())
            .map_err(|e| AppError::ProxyError(format!("{}: {e}", endpoint.masked())))?;
        builder = builder.proxy(proxy);
        if accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    builder
        .build()
        .map_err(|e| AppError::HttpError(format!("Failed to build HTTP client: {e}")))
}

/// Redirect targets must be http(s) and must not name a blocked address
/// literally. Hostnames are not resolved here.
fn redirect_allowed(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    match url.host() {
        Some(Host::Ipv4(v4)) => !is_blocked_ip(IpAddr::V4(v4)),
        Some(Host::Ipv6(v6)) => !is_blocked_ip(IpAddr::V6(v6)),
        Some(Host::Domain(d)) => {
            let d = d.trim_end_matches('.').to_ascii_lowercase();
            d != "localhost" && !d.ends_with(".localhost")
        }
        None => false,
    }
}

async fn send(
    client: &Client,
    url: &str,
    timeout: Duration,
    max_body: u64,
) -> Result<FetchedPage, AppError> {
    let mut response = client.get(url).send().await.map_err(|e| map_error(e, timeout))?;

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let final_url = response.url().to_string();

    let too_large = || AppError::HttpError(format!("response body exceeds {max_body} bytes"));
    if response.content_length().is_some_and(|len| len > max_body) {
        return Err(too_large());
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| map_error(e, timeout))? {
        if (body.len() + chunk.len()) as u64 > max_body {
            tracing::warn!(url, max_body, "Response body over cap, abandoning read");
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }

    Ok(FetchedPage {
        status,
        content_type,
        body,
        final_url,
    })
}

fn map_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else if e.is_redirect() {
        AppError::HttpError(format!("Redirect refused: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}
