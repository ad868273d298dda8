use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::job::JobSummary;
use crate::models::{NewObservation, Product, Source, SourceKind, compute_hash};
use crate::parsers::market_search::{self, MarketSearchConfig};
use crate::parsers::wholesale::MAX_PAGES;
use crate::parsers::{ParseContext, ParseOutput, next_page_form, parse_document};
use crate::session::SessionScope;
use crate::traits::{Fetcher, SessionFactory};

/// Tuning for a single scrape run.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Pause between two searches of the same run.
    pub search_delay: Duration,
    /// Upper bound on products searched per market-search run.
    pub max_search_products: usize,
    pub search_timeout: Duration,
    pub market: MarketSearchConfig,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            search_delay: Duration::from_secs(2),
            max_search_products: 100,
            search_timeout: Duration::from_secs(30),
            market: MarketSearchConfig::default(),
        }
    }
}

/// Observations produced by one run, ready to be committed with the job.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOutcome {
    pub observations: Vec<NewObservation>,
    pub summary: JobSummary,
}

/// Fetches or searches one source and parses the result.
///
/// Generic over the transport so it can be driven by mocks in tests.
pub struct ScrapeService<F, SF>
where
    F: Fetcher,
    SF: SessionFactory,
{
    fetcher: F,
    sessions: SF,
    config: ScrapeConfig,
}

impl<F, SF> ScrapeService<F, SF>
where
    F: Fetcher,
    SF: SessionFactory,
{
    pub fn new(fetcher: F, sessions: SF, config: ScrapeConfig) -> Self {
        Self {
            fetcher,
            sessions,
            config,
        }
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    /// Runs the source once.
    ///
    /// `last_observed` holds the newest observation time per product for
    /// this source and orders market searches, least recent first.
    pub async fn scrape(
        &self,
        source: &Source,
        products: &[Product],
        last_observed: &HashMap<String, DateTime<Utc>>,
    ) -> Result<ScrapeOutcome, AppError> {
        let mut payloads = String::new();
        let output = match source.kind {
            SourceKind::ReferenceIndex => {
                let payload = self.fetcher.fetch(&source.url).await?;
                tracing::debug!(source = %source.id, bytes = payload.len(), "Fetched reference index");
                let ctx = context(source, products);
                let out = parse_document(source.kind, &payload, &ctx)?;
                payloads.push_str(&payload);
                out
            }
            SourceKind::WholesaleListing => self.scrape_listing(source, products, &mut payloads).await?,
            SourceKind::MarketSearch => {
                let plan = search_plan(products, last_observed, self.config.max_search_products);
                let mut scope = SessionScope::new(&self.sessions, source, self.config.search_timeout);
                let result = self.run_searches(&mut scope, source, products, &plan, &mut payloads).await;
                scope.close().await;
                result?
            }
        };

        let keys: BTreeSet<String> = output
            .observations
            .iter()
            .map(|o| o.product_key.clone())
            .collect();
        let summary = JobSummary {
            observations: output.observations.len(),
            skipped_rows: output.skipped,
            products: keys.into_iter().collect(),
            payload_hash: (!payloads.is_empty()).then(|| compute_hash(&payloads)),
        };
        tracing::info!(
            source = %source.id,
            observations = summary.observations,
            skipped = summary.skipped_rows,
            "Source parsed"
        );

        Ok(ScrapeOutcome {
            observations: output.observations,
            summary,
        })
    }

    /// Follows the listing pager until no further page is linked, a page
    /// comes back empty, or the page cap is reached.
    async fn scrape_listing(
        &self,
        source: &Source,
        products: &[Product],
        payloads: &mut String,
    ) -> Result<ParseOutput, AppError> {
        let mut output = ParseOutput::default();
        let mut payload = self.fetcher.fetch(&source.url).await?;

        for page in 1..=MAX_PAGES {
            let ctx = context(source, products);
            let parsed = parse_document(source.kind, &payload, &ctx)?;
            payloads.push_str(&payload);
            if parsed.observations.is_empty() && parsed.skipped == 0 {
                break;
            }
            output.merge(parsed);

            let Some(form) = next_page_form(&payload, page + 1) else {
                break;
            };
            if page == MAX_PAGES {
                tracing::warn!(source = %source.id, pages = MAX_PAGES, "Listing page cap reached");
                break;
            }
            tracing::debug!(source = %source.id, page = page + 1, "Fetching next listing page");
            payload = self.fetcher.submit_form(&source.url, &form).await?;
        }

        // Varieties split across pages collapse again per product.
        Ok(recollapse(output))
    }

    async fn run_searches(
        &self,
        scope: &mut SessionScope<'_, SF>,
        source: &Source,
        products: &[Product],
        plan: &[&Product],
        payloads: &mut String,
    ) -> Result<ParseOutput, AppError> {
        let mut output = ParseOutput::default();
        for (i, product) in plan.iter().enumerate() {
            if i > 0 && !self.config.search_delay.is_zero() {
                tokio::time::sleep(self.config.search_delay).await;
            }
            let page = scope.search(product.search_term()).await?;
            let ctx = context(source, products);
            let parsed = market_search::parse_results(&page, product, &ctx, &self.config.market)?;
            if parsed.observations.is_empty() {
                tracing::debug!(source = %source.id, product = %product.key, "No usable listings");
            }
            payloads.push_str(&page);
            output.merge(parsed);
        }
        Ok(output)
    }
}

/// Products to search, least recently observed first (never observed
/// before anything else), capped at `max`.
pub fn search_plan<'a>(
    products: &'a [Product],
    last_observed: &HashMap<String, DateTime<Utc>>,
    max: usize,
) -> Vec<&'a Product> {
    let mut plan: Vec<&Product> = products.iter().collect();
    plan.sort_by(|a, b| {
        last_observed
            .get(&a.key)
            .cmp(&last_observed.get(&b.key))
            .then_with(|| a.key.cmp(&b.key))
    });
    plan.truncate(max);
    plan
}

fn context<'a>(source: &'a Source, products: &'a [Product]) -> ParseContext<'a> {
    ParseContext {
        source_id: &source.id,
        products,
        fetched_at: Utc::now(),
    }
}

/// Averages observations of the same product that came from different
/// pages. Weights are lost after the first collapse, so pages count equally.
fn recollapse(output: ParseOutput) -> ParseOutput {
    let mut grouped: HashMap<(String, String), Vec<NewObservation>> = HashMap::new();
    let mut order = Vec::new();
    for obs in output.observations {
        let key = (obs.product_key.clone(), obs.unit.clone());
        if !grouped.contains_key(&key) {
            order.push(key.clone());
        }
        grouped.entry(key).or_default().push(obs);
    }

    let mut observations = Vec::with_capacity(order.len());
    for key in order {
        let Some(mut group) = grouped.remove(&key) else {
            continue;
        };
        if group.len() == 1 {
            observations.extend(group);
            continue;
        }
        let average = group.iter().map(|o| o.price).sum::<f64>() / group.len() as f64;
        let quality = group.iter().map(|o| o.quality).max();
        let observed_at = group.iter().map(|o| o.observed_at).max();
        let mut first = group.swap_remove(0);
        first.price = crate::models::round_to(average, 2);
        if let Some(quality) = quality {
            first.quality = quality;
        }
        if let Some(observed_at) = observed_at {
            first.observed_at = observed_at;
        }
        observations.push(first);
    }

    ParseOutput {
        observations,
        skipped: output.skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchQuality;
    use crate::testutil::*;

    fn fast_config() -> ScrapeConfig {
        ScrapeConfig {
            search_delay: Duration::ZERO,
            ..ScrapeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_reference_index_fetches_once_and_summarizes() {
        let fetcher = MockFetcher::new(
            r#"[{"product": "Domates", "price": 30}, {"product": "Ananas", "price": 90}]"#,
        );
        let svc = ScrapeService::new(fetcher.clone(), MockSessionFactory::with_pages(vec![]), fast_config());
        let source = sample_source("tzob", SourceKind::ReferenceIndex);

        let outcome = svc.scrape(&source, &sample_catalog(), &HashMap::new()).await.unwrap();

        assert_eq!(outcome.observations.len(), 1);
        assert_eq!(outcome.summary.observations, 1);
        assert_eq!(outcome.summary.skipped_rows, 1);
        assert_eq!(outcome.summary.products, vec!["domates".to_string()]);
        assert_eq!(outcome.summary.payload_hash.as_ref().map(String::len), Some(64));
        assert_eq!(fetcher.fetched_urls(), vec![source.url.clone()]);
    }

    #[tokio::test]
    async fn test_fetch_error_propagates() {
        let svc = ScrapeService::new(
            MockFetcher::with_error(AppError::NetworkError("connection refused".into())),
            MockSessionFactory::with_pages(vec![]),
            fast_config(),
        );
        let source = sample_source("tzob", SourceKind::ReferenceIndex);

        let err = svc.scrape(&source, &sample_catalog(), &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, AppError::NetworkError(_)));
    }

    #[tokio::test]
    async fn test_wholesale_follows_pager() {
        let fetcher = MockFetcher::with_responses(vec![
            Ok(listing_page(&[("Domates", "20,00", "1.000")], Some(2))),
            Ok(listing_page(&[("Domates", "30,00", "500"), ("Patates", "12,00", "800")], None)),
        ]);
        let svc = ScrapeService::new(fetcher.clone(), MockSessionFactory::with_pages(vec![]), fast_config());
        let source = sample_source("hal", SourceKind::WholesaleListing);

        let outcome = svc.scrape(&source, &sample_catalog(), &HashMap::new()).await.unwrap();

        let forms = fetcher.submitted_forms();
        assert_eq!(forms.len(), 1);
        assert!(forms[0].contains(&("__EVENTARGUMENT".to_string(), "Page$2".to_string())));

        let domates = outcome
            .observations
            .iter()
            .find(|o| o.product_key == "domates")
            .unwrap();
        assert_eq!(domates.price, 25.0);
        assert_eq!(outcome.observations.len(), 2);
    }

    #[tokio::test]
    async fn test_wholesale_stops_at_empty_page() {
        let fetcher = MockFetcher::with_responses(vec![
            Ok(listing_page(&[("Domates", "20,00", "1.000")], Some(2))),
            Ok(listing_page(&[], Some(3))),
        ]);
        let svc = ScrapeService::new(fetcher.clone(), MockSessionFactory::with_pages(vec![]), fast_config());
        let source = sample_source("hal", SourceKind::WholesaleListing);

        let outcome = svc.scrape(&source, &sample_catalog(), &HashMap::new()).await.unwrap();
        assert_eq!(fetcher.submitted_forms().len(), 1);
        assert_eq!(outcome.observations.len(), 1);
    }

    #[tokio::test]
    async fn test_market_search_uses_one_session_and_closes_it() {
        let page = search_page("Domates 1 kg", &[("A101", "30,00"), ("BİM", "32,00"), ("Şok", "34,00")]);
        let sessions = MockSessionFactory::with_pages(vec![Ok(page.clone()), Ok(page)]);
        let svc = ScrapeService::new(MockFetcher::new(""), sessions.clone(), fast_config());
        let source = sample_source("camgoz", SourceKind::MarketSearch);
        let catalog = vec![
            sample_product("domates", "Domates", "sebze"),
            sample_product("patates", "Patates", "sebze"),
        ];

        let outcome = svc.scrape(&source, &catalog, &HashMap::new()).await.unwrap();

        assert_eq!(sessions.opened(), 1);
        assert_eq!(sessions.closed(), 1);
        assert_eq!(sessions.terms(), vec!["Domates", "Patates"]);
        assert_eq!(outcome.observations.len(), 1);
        assert_eq!(outcome.observations[0].price, 32.0);
        assert_eq!(outcome.observations[0].quality, MatchQuality::Exact);
    }

    #[tokio::test]
    async fn test_market_search_closes_session_on_error() {
        let sessions = MockSessionFactory::with_pages(vec![Err(AppError::SearchError("blocked".into()))]);
        let svc = ScrapeService::new(MockFetcher::new(""), sessions.clone(), fast_config());
        let source = sample_source("camgoz", SourceKind::MarketSearch);

        let err = svc.scrape(&source, &sample_catalog(), &HashMap::new()).await.unwrap_err();

        assert!(matches!(err, AppError::SearchError(_)));
        assert_eq!(sessions.opened(), 1);
        assert_eq!(sessions.closed(), 1);
    }

    #[test]
    fn test_search_plan_orders_least_recent_first() {
        let catalog = vec![
            sample_product("a", "A", "x"),
            sample_product("b", "B", "x"),
            sample_product("c", "C", "x"),
        ];
        let now = Utc::now();
        let last = HashMap::from([
            ("a".to_string(), now),
            ("b".to_string(), now - chrono::TimeDelta::days(3)),
        ]);

        let plan: Vec<&str> = search_plan(&catalog, &last, 2)
            .into_iter()
            .map(|p| p.key.as_str())
            .collect();
        assert_eq!(plan, vec!["c", "b"]);
    }
}
