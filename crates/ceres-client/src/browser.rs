//! Market search through a headless Chromium, for sites that render
//! results with JavaScript.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ceres_core::error::AppError;
use ceres_core::models::Source;
use ceres_core::traits::{SearchSession, SessionFactory};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;

use crate::http_session::search_url;

/// Shares one Chromium process; every session gets its own tab.
#[derive(Clone)]
pub struct BrowserSessionFactory {
    browser: Arc<Browser>,
    /// Selector that marks a rendered results page.
    ready_selector: String,
}

impl BrowserSessionFactory {
    /// Launches headless Chromium.
    ///
    /// `CHROME_BIN` overrides the binary; otherwise well-known install
    /// locations are tried before `chromiumoxide`'s own lookup.
    pub async fn launch(request_timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .disable_default_args()
            .request_timeout(request_timeout);

        // The snap wrapper drops --headless; the real binary inside the snap works.
        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .arg("--lang=tr-TR")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::SearchError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to make progress.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            ready_selector: "body".to_string(),
        })
    }

    pub fn with_ready_selector(mut self, selector: impl Into<String>) -> Self {
        self.ready_selector = selector.into();
        self
    }
}

fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

pub struct BrowserSession {
    page: Page,
    template: String,
    source_id: String,
    ready_selector: String,
}

impl SessionFactory for BrowserSessionFactory {
    type Session = BrowserSession;

    async fn open(&self, source: &Source) -> Result<BrowserSession, AppError> {
        search_url(&source.url, "x")?;
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::SearchError(format!("Failed to open tab: {e}")))?;
        Ok(BrowserSession {
            page,
            template: source.url.clone(),
            source_id: source.id.clone(),
            ready_selector: self.ready_selector.clone(),
        })
    }
}

impl SearchSession for BrowserSession {
    async fn search(&mut self, term: &str) -> Result<String, AppError> {
        let url = search_url(&self.template, term)?;
        tracing::debug!(source = %self.source_id, %term, "Browser search");

        self.page
            .goto(url.as_str())
            .await
            .map_err(|e| AppError::SearchError(format!("Navigation to {url} failed: {e}")))?;
        self.page
            .find_element(self.ready_selector.as_str())
            .await
            .map_err(|e| AppError::SearchError(format!("Results did not render: {e}")))?;
        self.page
            .content()
            .await
            .map_err(|e| AppError::SearchError(format!("Failed to read page content: {e}")))
    }

    async fn close(self) {
        if let Err(e) = self.page.close().await {
            tracing::warn!(source = %self.source_id, error = %e, "Failed to close browser tab");
        }
    }
}
