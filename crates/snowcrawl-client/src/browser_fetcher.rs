use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetBlockedUrLsParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use snowcrawl_core::error::AppError;
use snowcrawl_core::job::{RenderPolicy, WaitStrategy};
use snowcrawl_core::models::FetchedPage;
use snowcrawl_core::tier::Tier;
use snowcrawl_core::traits::{RenderProvider, RenderRequest};

/// Settle time after navigation for the `networkidle` strategy.
const NETWORK_IDLE_SETTLE: Duration = Duration::from_millis(500);
const SELECTOR_POLL: Duration = Duration::from_millis(100);

/// Headless Chromium render provider for the browser tier.
///
/// A single Chromium process is shared across all clones of this struct;
/// each render opens a new tab, applies the request's user agent, viewport
/// and resource blocking, waits according to the render policy, grabs the
/// DOM and closes the tab.
///
/// Challenge solving (tier 4) is not built in; such requests report the
/// tier as unavailable.
///
/// # Example
///
/// ```rust,no_run
/// use snowcrawl_client::BrowserRenderer;
/// use snowcrawl_client::HttpTierFetcher;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let renderer = BrowserRenderer::launch().await?;
/// let fetcher = HttpTierFetcher::new().with_renderer(renderer);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserRenderer {
    browser: Arc<Browser>,
}

impl BrowserRenderer {
    /// Launches a headless Chromium browser.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH`, `CHROME_BIN`
    /// or the default locations checked by `chromiumoxide`.
    pub async fn launch() -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // Snap-packaged Chromium exposes a wrapper that rejects standard
        // Chrome CLI flags (--headless, --disable-gpu, ...).
        if let Some(bin) = find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::Config(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Config(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
        })
    }

    async fn render_page(&self, request: &RenderRequest) -> Result<FetchedPage, AppError> {
        let url = request.url.as_str();
        let policy = &request.policy;
        let nav_err = |e: chromiumoxide::error::CdpError| {
            AppError::HttpError(format!("Failed to render {url}: {e}"))
        };

        let page = self.browser.new_page("about:blank").await.map_err(nav_err)?;
        prepare_page(&page, request).await.map_err(nav_err)?;

        page.goto(url).await.map_err(nav_err)?;
        wait_for(&page, policy).await?;

        let html = page.content().await.map_err(nav_err)?;
        let final_url = page.url().await.ok().flatten().unwrap_or_else(|| url.to_string());

        // Close the tab to free browser resources.
        let _ = page.close().await;

        Ok(FetchedPage {
            status: 200,
            content_type: Some("text/html; charset=utf-8".into()),
            body: html.into_bytes(),
            final_url,
        })
    }
}

impl RenderProvider for BrowserRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<FetchedPage, AppError> {
        if request.solve_captcha {
            return Err(AppError::TierUnavailable {
                tier: Tier::Captcha.ordinal(),
                reason: "no challenge solver configured".into(),
            });
        }
        if let Some(proxy) = &request.proxy {
            tracing::debug!(proxy = %proxy.masked(), "Browser uses its launch-time network settings");
        }

        let budget = request.policy.wait_timeout();
        match tokio::time::timeout(budget, self.render_page(request)).await {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(budget.as_secs())),
        }
    }
}

async fn prepare_page(page: &Page, request: &RenderRequest) -> Result<(), chromiumoxide::error::CdpError> {
    page.set_user_agent(request.user_agent.as_str()).await?;

    let viewport = request.policy.viewport;
    page.execute(SetDeviceMetricsOverrideParams::new(
        i64::from(viewport.width),
        i64::from(viewport.height),
        1.0,
        false,
    ))
    .await?;

    let patterns = blocked_url_patterns(&request.policy.block_resources);
    if !patterns.is_empty() {
        page.execute(SetBlockedUrLsParams::new(patterns)).await?;
    }
    Ok(())
}

async fn wait_for(page: &Page, policy: &RenderPolicy) -> Result<(), AppError> {
    let wait_err = |e: chromiumoxide::error::CdpError| {
        AppError::HttpError(format!("Page did not finish loading: {e}"))
    };

    match policy.wait_strategy {
        WaitStrategy::DomContentLoaded => {
            page.find_element("body").await.map_err(wait_err)?;
        }
        WaitStrategy::Load => {
            page.wait_for_navigation().await.map_err(wait_err)?;
        }
        WaitStrategy::NetworkIdle => {
            page.wait_for_navigation().await.map_err(wait_err)?;
            tokio::time::sleep(NETWORK_IDLE_SETTLE).await;
        }
    }

    if let Some(selector) = &policy.wait_for_selector {
        // Bounded by the caller's overall render timeout.
        while page.find_element(selector.as_str()).await.is_err() {
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }
    Ok(())
}

/// URL patterns for the resource types a render policy blocks.
pub fn blocked_url_patterns(resources: &[String]) -> Vec<String> {
    let mut patterns = Vec::new();
    for resource in resources {
        let exts: &[&str] = match resource.to_ascii_lowercase().as_str() {
            "image" => &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico"],
            "stylesheet" => &["css"],
            "font" => &["woff", "woff2", "ttf", "otf"],
            "media" => &["mp4", "webm", "mp3", "ogg"],
            other => {
                tracing::debug!(resource = other, "Unknown resource type, not blocked");
                &[]
            }
        };
        patterns.extend(exts.iter().map(|ext| format!("*.{ext}")));
    }
    patterns.sort();
    patterns.dedup();
    patterns
}

/// Tries to locate the real Chrome/Chromium binary.
///
/// An explicit `CHROME_BIN` wins; then the binary inside a snap, then
/// well-known system paths. `None` lets `chromiumoxide` do its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    let candidates: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}
