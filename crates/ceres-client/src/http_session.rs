//! Market search over plain HTTP, for sites that render results server-side.

use ceres_core::error::AppError;
use ceres_core::models::Source;
use ceres_core::traits::{Fetcher, SearchSession, SessionFactory};

use crate::fetcher::ReqwestFetcher;

/// Placeholder replaced by the encoded search term.
pub const TERM_PLACEHOLDER: &str = "{term}";

/// Fills a source's search template with the url-encoded `term`.
pub fn search_url(template: &str, term: &str) -> Result<String, AppError> {
    if !template.contains(TERM_PLACEHOLDER) {
        return Err(AppError::ConfigError(format!(
            "search template '{template}' has no {TERM_PLACEHOLDER} placeholder"
        )));
    }
    let encoded: String = url::form_urlencoded::byte_serialize(term.trim().as_bytes()).collect();
    let url = template.replace(TERM_PLACEHOLDER, &encoded);
    url::Url::parse(&url)
        .map_err(|e| AppError::ConfigError(format!("search url '{url}' is invalid: {e}")))?;
    Ok(url)
}

#[derive(Clone)]
pub struct HttpSearchFactory {
    fetcher: ReqwestFetcher,
}

impl HttpSearchFactory {
    pub fn new(fetcher: ReqwestFetcher) -> Self {
        Self { fetcher }
    }
}

pub struct HttpSearchSession {
    fetcher: ReqwestFetcher,
    template: String,
    source_id: String,
}

impl SessionFactory for HttpSearchFactory {
    type Session = HttpSearchSession;

    async fn open(&self, source: &Source) -> Result<HttpSearchSession, AppError> {
        // Validate the template once instead of on every search.
        search_url(&source.url, "x")?;
        Ok(HttpSearchSession {
            fetcher: self.fetcher.clone(),
            template: source.url.clone(),
            source_id: source.id.clone(),
        })
    }
}

impl SearchSession for HttpSearchSession {
    async fn search(&mut self, term: &str) -> Result<String, AppError> {
        let url = search_url(&self.template, term)?;
        tracing::debug!(source = %self.source_id, %term, "HTTP search");
        self.fetcher.fetch(&url).await.map_err(|e| match e {
            AppError::HttpError { .. } | AppError::Timeout(_) => e,
            other => AppError::SearchError(other.to_string()),
        })
    }

    async fn close(self) {
        tracing::debug!(source = %self.source_id, "HTTP search session closed");
    }
}
