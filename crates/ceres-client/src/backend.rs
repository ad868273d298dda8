//! Runtime choice between the HTTP and browser search implementations.

use std::fmt;
use std::str::FromStr;
#[cfg(feature = "browser")]
use std::time::Duration;

use ceres_core::error::AppError;
use ceres_core::models::Source;
use ceres_core::traits::{SearchSession, SessionFactory};

#[cfg(feature = "browser")]
use crate::browser::{BrowserSession, BrowserSessionFactory};
use crate::fetcher::ReqwestFetcher;
use crate::http_session::{HttpSearchFactory, HttpSearchSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchBackendKind {
    #[default]
    Http,
    Browser,
}

impl FromStr for SearchBackendKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "browser" | "chromium" => Ok(Self::Browser),
            other => Err(AppError::ConfigError(format!(
                "unknown search backend '{other}' (expected http or browser)"
            ))),
        }
    }
}

impl fmt::Display for SearchBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Browser => f.write_str("browser"),
        }
    }
}

#[derive(Clone)]
pub enum SearchBackend {
    Http(HttpSearchFactory),
    #[cfg(feature = "browser")]
    Browser(BrowserSessionFactory),
}

impl SearchBackend {
    /// Builds the requested backend. `Browser` needs the `browser` feature.
    pub async fn build(kind: SearchBackendKind, fetcher: ReqwestFetcher) -> Result<Self, AppError> {
        match kind {
            SearchBackendKind::Http => Ok(Self::Http(HttpSearchFactory::new(fetcher))),
            #[cfg(feature = "browser")]
            SearchBackendKind::Browser => {
                let timeout = Duration::from_secs(fetcher.timeout_secs().max(1));
                Ok(Self::Browser(BrowserSessionFactory::launch(timeout).await?))
            }
            #[cfg(not(feature = "browser"))]
            SearchBackendKind::Browser => Err(AppError::ConfigError(
                "browser search backend requires the `browser` feature".into(),
            )),
        }
    }
}

pub enum BackendSession {
    Http(HttpSearchSession),
    #[cfg(feature = "browser")]
    Browser(BrowserSession),
}

impl SessionFactory for SearchBackend {
    type Session = BackendSession;

    async fn open(&self, source: &Source) -> Result<BackendSession, AppError> {
        match self {
            Self::Http(factory) => factory.open(source).await.map(BackendSession::Http),
            #[cfg(feature = "browser")]
            Self::Browser(factory) => factory.open(source).await.map(BackendSession::Browser),
        }
    }
}

impl SearchSession for BackendSession {
    async fn search(&mut self, term: &str) -> Result<String, AppError> {
        match self {
            Self::Http(session) => session.search(term).await,
            #[cfg(feature = "browser")]
            Self::Browser(session) => session.search(term).await,
        }
    }

    async fn close(self) {
        match self {
            Self::Http(session) => session.close().await,
            #[cfg(feature = "browser")]
            Self::Browser(session) => session.close().await,
        }
    }
}
