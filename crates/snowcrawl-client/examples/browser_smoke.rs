/// Smoke-test for `BrowserRenderer`.
///
/// Launches a headless Chromium, renders <https://example.com> with images
/// and fonts blocked, and checks the rendered HTML contains the expected `<h1>`.
///
/// Run with:
///   cargo run --example browser_smoke --features browser
use snowcrawl_client::BrowserRenderer;
use snowcrawl_core::job::RenderPolicy;
use snowcrawl_core::traits::{RenderProvider, RenderRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser...");
    let renderer = BrowserRenderer::launch().await?;

    let request = RenderRequest {
        url: "https://example.com".into(),
        policy: RenderPolicy {
            block_resources: vec!["image".into(), "font".into()],
            ..RenderPolicy::default()
        },
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".into(),
        proxy: None,
        solve_captcha: false,
    };
    println!("Rendering {} ...", request.url);
    let page = renderer.render(&request).await?;
    let html = page.text();

    assert_eq!(page.status, 200, "unexpected status {}", page.status);
    assert!(
        html.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in rendered HTML"
    );

    println!("OK: {} bytes from {}", html.len(), page.final_url);
    println!("First 300 chars:\n{}", html.chars().take(300).collect::<String>());
    Ok(())
}
