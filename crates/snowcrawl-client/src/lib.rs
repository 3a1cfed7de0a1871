#[cfg(feature = "browser")]
pub mod browser_fetcher;
pub mod extract;
pub mod fetcher;
pub mod proxy;

#[cfg(feature = "browser")]
pub use browser_fetcher::BrowserRenderer;
pub use extract::QueryEngine;
pub use fetcher::{HttpSession, HttpTierFetcher};
pub use proxy::{ProxyStats, StaticProxyPool};
