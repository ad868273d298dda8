use std::time::Duration;

use crate::error::AppError;
use crate::models::Source;
use crate::traits::{SearchSession, SessionFactory};

/// A market-search session scoped to one job.
///
/// The underlying session is opened on the first search and reused after
/// that. Callers must finish with [`SessionScope::close`]; every search is
/// bounded by the scope's timeout.
pub struct SessionScope<'a, SF: SessionFactory> {
    factory: &'a SF,
    source: &'a Source,
    timeout: Duration,
    session: Option<SF::Session>,
    searches: usize,
}

impl<'a, SF: SessionFactory> SessionScope<'a, SF> {
    pub fn new(factory: &'a SF, source: &'a Source, timeout: Duration) -> Self {
        Self {
            factory,
            source,
            timeout,
            session: None,
            searches: 0,
        }
    }

    /// True once the first search has opened a session.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn searches(&self) -> usize {
        self.searches
    }

    /// Runs one search. Exceeding the timeout yields `SearchTimeout`.
    pub async fn search(&mut self, term: &str) -> Result<String, AppError> {
        if self.session.is_none() {
            let opened = self.factory.open(self.source).await?;
            tracing::debug!(source = %self.source.id, "Search session opened");
            self.session = Some(opened);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(AppError::SearchError("search session unavailable".into()));
        };

        self.searches += 1;
        match tokio::time::timeout(self.timeout, session.search(term)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::SearchTimeout(self.timeout.as_secs())),
        }
    }

    /// Releases the session, if one was opened.
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            tracing::debug!(
                source = %self.source.id,
                searches = self.searches,
                "Search session closed"
            );
        }
    }
}

impl<SF: SessionFactory> Drop for SessionScope<'_, SF> {
    fn drop(&mut self) {
        if self.session.is_some() {
            tracing::warn!(source = %self.source.id, "Search session dropped without close");
        }
    }
}
