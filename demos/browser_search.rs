/// Runs one market search through headless Chromium and prints the start
/// of the rendered results page.
///
/// Run with:
///   cargo run -p ceres-client --example browser_search --features browser -- \
///     'https://market.example.com/ara?q={term}' domates
use std::time::Duration;

use ceres_client::BrowserSessionFactory;
use ceres_core::models::{Source, SourceKind};
use ceres_core::traits::{SearchSession, SessionFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut args = std::env::args().skip(1);
    let template = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: browser_search <url-template> <term>"))?;
    let term = args.next().unwrap_or_else(|| "domates".to_string());

    let source = Source {
        id: "demo".into(),
        name: "Demo market".into(),
        kind: SourceKind::MarketSearch,
        url: template,
        polling_interval_secs: 3600,
        freshness_window_secs: 86_400,
        enabled: true,
    };

    let factory = BrowserSessionFactory::launch(Duration::from_secs(30)).await?;
    let mut session = factory.open(&source).await?;
    let html = session.search(&term).await;
    session.close().await;
    let html = html?;

    println!("Rendered {} bytes for '{term}'", html.len());
    println!("{}", html.chars().take(300).collect::<String>());
    Ok(())
}
