//! Test utilities: mock implementations of the I/O traits plus fixtures.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobStatus, ScrapeJob, TriggerKind};
use crate::memory::MemoryStore;
use crate::models::{Product, Source, SourceKind};
use crate::traits::{
    CatalogStore, EstimateRequest, Fetcher, PriceEstimate, PriceEstimator, SearchSession,
    SessionFactory,
};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that returns queued responses for both GETs and form posts.
#[derive(Clone)]
pub struct MockFetcher {
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns a default HTML string.
    responses: Arc<Mutex<VecDeque<Result<String, AppError>>>>,
    urls: Arc<Mutex<Vec<String>>>,
    forms: Arc<Mutex<Vec<Vec<(String, String)>>>>,
}

impl MockFetcher {
    pub fn new(body: &str) -> Self {
        Self::with_responses(vec![Ok(body.to_string())])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            urls: Arc::new(Mutex::new(Vec::new())),
            forms: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// URLs passed to `fetch`, in call order.
    pub fn fetched_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Forms passed to `submit_form`, in call order.
    pub fn submitted_forms(&self) -> Vec<Vec<(String, String)>> {
        self.forms.lock().unwrap().clone()
    }

    /// Total network calls of either kind.
    pub fn calls(&self) -> usize {
        self.urls.lock().unwrap().len() + self.forms.lock().unwrap().len()
    }

    fn next(&self) -> Result<String, AppError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("<html><body>default</body></html>".to_string()))
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.urls.lock().unwrap().push(url.to_string());
        self.next()
    }

    async fn submit_form(&self, _url: &str, form: &[(String, String)]) -> Result<String, AppError> {
        self.forms.lock().unwrap().push(form.to_vec());
        self.next()
    }
}

// ---------------------------------------------------------------------------
// MockSessionFactory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionLog {
    pages: VecDeque<Result<String, AppError>>,
    opened: usize,
    closed: usize,
    terms: Vec<String>,
}

/// Mock search sessions sharing one queue of result pages.
#[derive(Clone)]
pub struct MockSessionFactory {
    log: Arc<Mutex<SessionLog>>,
    delay: Option<Duration>,
}

impl MockSessionFactory {
    pub fn with_pages(pages: Vec<Result<String, AppError>>) -> Self {
        Self {
            log: Arc::new(Mutex::new(SessionLog {
                pages: pages.into(),
                ..SessionLog::default()
            })),
            delay: None,
        }
    }

    /// Every search sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn opened(&self) -> usize {
        self.log.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }

    pub fn terms(&self) -> Vec<String> {
        self.log.lock().unwrap().terms.clone()
    }
}

pub struct MockSession {
    log: Arc<Mutex<SessionLog>>,
    delay: Option<Duration>,
}

impl SearchSession for MockSession {
    async fn search(&mut self, term: &str) -> Result<String, AppError> {
        self.log.lock().unwrap().terms.push(term.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.log
            .lock()
            .unwrap()
            .pages
            .pop_front()
            .unwrap_or_else(|| Ok("<html><body><table></table></body></html>".to_string()))
    }

    async fn close(self) {
        self.log.lock().unwrap().closed += 1;
    }
}

impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    async fn open(&self, _source: &Source) -> Result<MockSession, AppError> {
        self.log.lock().unwrap().opened += 1;
        Ok(MockSession {
            log: Arc::clone(&self.log),
            delay: self.delay,
        })
    }
}

// ---------------------------------------------------------------------------
// MockEstimator
// ---------------------------------------------------------------------------

/// Mock estimator with a fixed answer.
#[derive(Clone)]
pub struct MockEstimator {
    answer: Option<f64>,
    fail: bool,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl MockEstimator {
    /// Never produces an estimate.
    pub fn none() -> Self {
        Self {
            answer: None,
            fail: false,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn fixed(price: f64) -> Self {
        Self {
            answer: Some(price),
            ..Self::none()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::none()
        }
    }
}

impl PriceEstimator for MockEstimator {
    async fn estimate(&self, request: &EstimateRequest) -> Result<Option<PriceEstimate>, AppError> {
        self.requests
            .lock()
            .unwrap()
            .push(request.product.key.clone());
        if self.fail {
            return Err(AppError::EstimationError {
                message: "model unavailable".into(),
                status_code: 503,
                retryable: true,
            });
        }
        Ok(self.answer.map(|price| PriceEstimate {
            price,
            unit: request.product.unit.clone(),
            rationale: "fixed test estimate".into(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// An enabled source polled hourly, with a two-day freshness window.
pub fn sample_source(id: &str, kind: SourceKind) -> Source {
    let url = match kind {
        SourceKind::MarketSearch => format!("https://{id}.example.com/ara?q={{term}}"),
        _ => format!("https://{id}.example.com/fiyatlar"),
    };
    Source {
        id: id.to_string(),
        name: id.to_uppercase(),
        kind,
        url,
        polling_interval_secs: 3600,
        freshness_window_secs: 2 * 86_400,
        enabled: true,
    }
}

pub fn sample_product(key: &str, name: &str, category: &str) -> Product {
    Product {
        key: key.to_string(),
        name: name.to_string(),
        category: category.to_string(),
        unit: "kg".to_string(),
        search_term: None,
        aliases: vec![],
    }
}

pub fn sample_catalog() -> Vec<Product> {
    vec![
        sample_product("domates", "Domates", "sebze"),
        sample_product("patates", "Patates", "sebze"),
        sample_product("biber", "Biber", "sebze"),
        sample_product("limon", "Limon", "meyve"),
    ]
}

/// Store seeded with one source of each kind and [`sample_catalog`].
pub async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    for source in [
        sample_source("tzob", SourceKind::ReferenceIndex),
        sample_source("hal", SourceKind::WholesaleListing),
        sample_source("camgoz", SourceKind::MarketSearch),
    ] {
        store.upsert_source(&source).await.unwrap();
    }
    for product in sample_catalog() {
        store.upsert_product(&product).await.unwrap();
    }
    store
}

/// A job that ran and finished with `status`.
pub fn finished_job(source_id: &str, status: JobStatus) -> ScrapeJob {
    let now = Utc::now();
    ScrapeJob {
        id: Uuid::new_v4(),
        source_id: source_id.to_string(),
        trigger: TriggerKind::Scheduled,
        status,
        attempt: 1,
        max_attempts: 3,
        created_at: now,
        started_at: Some(now),
        finished_at: Some(now),
        not_before: now,
        result_summary: None,
        error_detail: None,
        error_code: None,
        cancel_requested: false,
        retry_of: None,
        superseded_by: None,
        worker_id: Some("test".to_string()),
    }
}

/// A wholesale listing page with `(name, price, volume)` rows and an
/// optional pager link to `next`.
pub fn listing_page(rows: &[(&str, &str, &str)], next: Option<usize>) -> String {
    let rows: String = rows
        .iter()
        .map(|(name, price, volume)| {
            format!(
                "<tr><td>{name}</td><td>Yerli</td><td>Geleneksel</td><td>{price}</td><td>{volume}</td><td>Kg</td></tr>"
            )
        })
        .collect();
    let pager = next
        .map(|page| {
            format!(
                r#"<tr><td colspan="6"><a href="javascript:__doPostBack('ctl00$grid','Page${page}')">{page}</a></td></tr>"#
            )
        })
        .unwrap_or_default();
    format!(
        r#"<html><body><form>
          <input type="hidden" name="__VIEWSTATE" value="vs" />
          <table>
            <tr><th>Ürün</th><th>Cins</th><th>Tür</th><th>Ort.</th><th>Hacim</th><th>Birim</th></tr>
            {rows}{pager}
          </table>
        </form></body></html>"#
    )
}

/// A market search results page with one listing offered by `boxes`.
pub fn search_page(title: &str, boxes: &[(&str, &str)]) -> String {
    let boxes: String = boxes
        .iter()
        .map(|(market, price)| {
            format!(
                r#"<div class="border p-2 rounded"><span class="fw-semibold">{market}</span><span class="fw-bold">{price} TL</span></div>"#
            )
        })
        .collect();
    format!(
        r#"<html><body><table>
          <tr class="table-light"><td data-label="Ürün">{title}</td></tr>
          <tr class="price-details"><td>{boxes}</td></tr>
        </table></body></html>"#
    )
}
