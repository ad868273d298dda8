mod export;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ceres_client::{OpenAiEstimator, ReqwestFetcher, SearchBackend, SearchBackendKind};
use ceres_core::catalog::CatalogFile;
use ceres_core::estimate::{ChainedEstimator, TrendEstimator};
use ceres_core::job::JobFilter;
use ceres_core::parsers::{self, ParseContext, ParseOutput};
use ceres_core::traits::Storage;
use ceres_core::{Actor, AdminService, Engine, EngineConfig, JobStatus, MemoryStore, SourceKind};
use ceres_db::{Database, DatabaseConfig};

use export::{ExportFormat, write_prices};

type CliEstimator = ChainedEstimator<Option<OpenAiEstimator>, TrendEstimator>;
type CliAdmin = AdminService<Database, CliEstimator>;

#[derive(Parser)]
#[command(name = "ceres", version, about = "Commodity price scraping and pricing engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the worker pool until CTRL+C
    Worker {
        /// Use an in-memory store instead of PostgreSQL
        #[arg(long, default_value_t = false)]
        memory: bool,

        /// Catalog file to seed before starting (required with --memory)
        #[arg(short, long)]
        catalog: Option<PathBuf>,

        /// Market search backend
        #[arg(long, env = "CERES_SEARCH_BACKEND", default_value = "http")]
        search_backend: String,

        /// Allow fetching private and loopback addresses
        #[arg(long, env = "CERES_ALLOW_PRIVATE_URLS", default_value_t = false)]
        allow_private_urls: bool,
    },

    /// Load sources and products from a JSON catalog file
    Seed {
        #[arg(short, long)]
        catalog: PathBuf,
    },

    /// Parse a saved payload offline and print the observations
    Parse {
        /// Source kind of the payload (reference-index, wholesale-listing, market-search)
        #[arg(short, long)]
        kind: String,

        /// Payload file
        #[arg(short, long)]
        file: PathBuf,

        /// Catalog file providing the products to match
        #[arg(short, long)]
        catalog: PathBuf,

        /// Product searched for; required for market-search payloads
        #[arg(short, long)]
        product: Option<String>,

        #[arg(long, default_value = "offline")]
        source: String,
    },

    /// Enqueue a manual scrape of a source
    Trigger {
        #[arg(short, long)]
        source: String,
    },

    /// Show the circuit breaker and trust of every source
    Health,

    /// List jobs, newest first
    Jobs {
        #[arg(short, long)]
        source: Option<String>,

        /// queued, running, succeeded, failed or cancelled
        #[arg(long)]
        status: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Force a source's circuit breaker closed
    Reset {
        #[arg(short, long)]
        source: String,
    },

    /// Re-enqueue failed jobs
    Retry {
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Cancel one job, or every queued job of a source
    Cancel {
        #[arg(short, long)]
        source: Option<String>,

        #[arg(short, long, conflicts_with = "source")]
        job: Option<Uuid>,
    },

    /// Delete finished jobs older than the given age
    Cleanup {
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Show or set a product's active price
    Price {
        product: String,

        /// Record a manual price
        #[arg(long)]
        set: Option<f64>,

        /// Unit of the manual price (defaults to the product's unit)
        #[arg(long, requires = "set")]
        unit: Option<String>,

        /// Also print the last N price versions
        #[arg(long)]
        history: Option<usize>,
    },

    /// Recompute active prices (every product when none are named)
    Recompute { products: Vec<String> },

    /// Export every current price
    Prices {
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
    },

    /// Rebuild seasonal coefficients from observation history
    Seasonal,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ceres=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let actor = Actor::operator();

    match cli.command {
        Commands::Worker {
            memory,
            catalog,
            search_backend,
            allow_private_urls,
        } => {
            let kind: SearchBackendKind = search_backend.parse()?;
            if memory {
                let catalog = catalog.context("--memory needs a --catalog to seed from")?;
                let store = MemoryStore::new();
                seed(&catalog, &store).await?;
                cmd_worker(store, kind, allow_private_urls).await?;
            } else {
                let db = connect_db().await?;
                if let Some(catalog) = catalog {
                    seed(&catalog, &db).await?;
                }
                cmd_worker(db, kind, allow_private_urls).await?;
            }
        }
        Commands::Seed { catalog } => {
            let db = connect_db().await?;
            seed(&catalog, &db).await?;
        }
        Commands::Parse {
            kind,
            file,
            catalog,
            product,
            source,
        } => {
            let kind: SourceKind = kind.parse().map_err(anyhow::Error::msg)?;
            let catalog = CatalogFile::load(&catalog)?;
            let payload = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read payload file: {}", file.display()))?;
            let output = cmd_parse(kind, &payload, &catalog, product.as_deref(), &source)?;
            tracing::info!(
                observations = output.observations.len(),
                skipped = output.skipped,
                "Payload parsed"
            );
            println!("{}", serde_json::to_string_pretty(&output.observations)?);
        }
        Commands::Trigger { source } => {
            let admin = admin_service().await?;
            let job = admin.trigger(&actor, &source, Utc::now()).await?;
            println!("Enqueued job {} for {}", job.id, job.source_id);
        }
        Commands::Health => {
            let admin = admin_service().await?;
            cmd_health(&admin, &actor).await?;
        }
        Commands::Jobs {
            source,
            status,
            limit,
        } => {
            let status = status
                .map(|s| s.parse::<JobStatus>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let filter = JobFilter {
                source_id: source,
                status,
                limit,
                ..JobFilter::default()
            };
            let admin = admin_service().await?;
            cmd_jobs(&admin, &actor, &filter).await?;
        }
        Commands::Reset { source } => {
            let admin = admin_service().await?;
            let stats = admin.reset(&actor, &source, Utc::now()).await?;
            println!("Circuit breaker for {} is {}", source, stats.state.as_str());
        }
        Commands::Retry { source } => {
            let admin = admin_service().await?;
            let jobs = admin.retry(&actor, source.as_deref(), Utc::now()).await?;
            for job in &jobs {
                println!("  {} {} (retry of {})", job.id, job.source_id, fmt_opt(job.retry_of));
            }
            println!("Re-enqueued {} failed jobs", jobs.len());
        }
        Commands::Cancel { source, job } => {
            let admin = admin_service().await?;
            match job {
                Some(job_id) => {
                    let job = admin.cancel_job(&actor, job_id, Utc::now()).await?;
                    if job.cancel_requested && !job.status.is_terminal() {
                        println!("Job {} is running; its results will be discarded", job.id);
                    } else {
                        println!("Job {} is {}", job.id, job.status);
                    }
                }
                None => {
                    let count = admin.cancel(&actor, source.as_deref(), Utc::now()).await?;
                    println!("Cancelled {count} queued jobs");
                }
            }
        }
        Commands::Cleanup { days } => {
            let admin = admin_service().await?;
            let count = admin.cleanup(&actor, days, Utc::now()).await?;
            println!("Deleted {count} finished jobs");
        }
        Commands::Price {
            product,
            set,
            unit,
            history,
        } => {
            let admin = admin_service().await?;
            cmd_price(&admin, &actor, &product, set, unit, history).await?;
        }
        Commands::Recompute { products } => {
            let admin = admin_service().await?;
            let report = admin.recompute(&actor, &products, Utc::now()).await?;
            for product in &report.updated {
                println!("  updated    {product}");
            }
            for product in &report.missing {
                println!("  no price   {product}");
            }
            for (product, error) in &report.failed {
                println!("  failed     {product}: {error}");
            }
            println!(
                "\n{} updated, {} unchanged, {} without price, {} failed",
                report.updated.len(),
                report.unchanged,
                report.missing.len(),
                report.failed.len()
            );
        }
        Commands::Prices { format } => {
            let admin = admin_service().await?;
            let prices = admin.prices(&actor).await?;
            write_prices(&prices, format, std::io::stdout().lock())?;
        }
        Commands::Seasonal => {
            let admin = admin_service().await?;
            let coefficients = admin.refresh_seasonal(&actor, Utc::now()).await?;
            for c in &coefficients {
                println!("  {:<12} month {:>2}  x{:.3}", c.category, c.month, c.factor);
            }
            println!("Stored {} seasonal coefficients", coefficients.len());
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

fn estimator() -> Result<CliEstimator> {
    Ok(ChainedEstimator::new(
        OpenAiEstimator::from_env()?,
        TrendEstimator::default(),
    ))
}

/// Admin services over the database, attached without crash recovery so a
/// worker running elsewhere keeps its jobs.
async fn admin_service() -> Result<Arc<CliAdmin>> {
    let db = connect_db().await?;
    let fetcher = ReqwestFetcher::new()?;
    let sessions = SearchBackend::build(SearchBackendKind::Http, fetcher.clone()).await?;
    let engine = Engine::attach(db, fetcher, sessions, estimator()?, EngineConfig::from_env()?).await?;
    Ok(engine.admin())
}

async fn seed<S: Storage>(path: &Path, store: &S) -> Result<()> {
    let catalog = CatalogFile::load(path)?;
    let report = catalog.seed(store).await?;
    tracing::info!(
        sources = report.sources,
        products = report.products,
        catalog = %path.display(),
        "Catalog seeded"
    );
    Ok(())
}

async fn cmd_worker<S: Storage + 'static>(
    store: S,
    kind: SearchBackendKind,
    allow_private_urls: bool,
) -> Result<()> {
    let config = EngineConfig::from_env()?;
    let mut fetcher = ReqwestFetcher::new()?;
    if allow_private_urls {
        fetcher = fetcher.allow_private_urls();
    }
    let sessions = SearchBackend::build(kind, fetcher.clone()).await?;
    let engine = Engine::bootstrap(store, fetcher, sessions, estimator()?, config).await?;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for CTRL+C");
        }
        tracing::info!("Shutdown requested; waiting for running jobs");
        stopper.cancel();
    });

    engine.run(cancel).await?;
    Ok(())
}

fn cmd_parse(
    kind: SourceKind,
    payload: &str,
    catalog: &CatalogFile,
    product: Option<&str>,
    source: &str,
) -> Result<ParseOutput> {
    let ctx = ParseContext {
        source_id: source,
        products: &catalog.products,
        fetched_at: Utc::now(),
    };
    if kind != SourceKind::MarketSearch {
        return Ok(parsers::parse_document(kind, payload, &ctx)?);
    }

    let Some(key) = product else {
        bail!("market-search payloads need --product");
    };
    let Some(product) = catalog.products.iter().find(|p| p.key == key) else {
        bail!("product '{key}' is not in the catalog");
    };
    let config = EngineConfig::from_env()?.scrape.market;
    Ok(parsers::market_search::parse_results(
        payload, product, &ctx, &config,
    )?)
}

async fn cmd_health(admin: &CliAdmin, actor: &Actor) -> Result<()> {
    let sources = admin.health(actor, Utc::now()).await?;
    if sources.is_empty() {
        println!("No sources configured. Run `ceres seed --catalog <file>` first.");
        return Ok(());
    }

    for s in &sources {
        let cooldown = s
            .breaker
            .cooldown_remaining_secs
            .map(|secs| format!(" (retry in {secs}s)"))
            .unwrap_or_default();
        let trust = s
            .trust
            .map(|t| format!("{t:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<12} {:<18} {:<9} failures={}/{} trust={}{}{}",
            s.source_id,
            s.kind.as_str(),
            s.breaker.state.as_str(),
            s.breaker.consecutive_failures,
            s.breaker.failure_threshold,
            trust,
            if s.enabled { "" } else { " [disabled]" },
            cooldown,
        );
        if let Some(error) = &s.breaker.last_error {
            println!("  {:<12} last error: {error}", "");
        }
    }
    Ok(())
}

async fn cmd_jobs(admin: &CliAdmin, actor: &Actor, filter: &JobFilter) -> Result<()> {
    let page = admin.jobs(actor, filter).await?;
    if page.jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    for job in &page.jobs {
        let duration = job
            .duration()
            .map(|d| format!(" {:.1}s", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_default();
        println!(
            "  [{:<9}] {} {} {:<10} attempt {}/{}{}",
            job.status.to_string(),
            job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            job.id,
            job.source_id,
            job.attempt,
            job.max_attempts,
            duration,
        );
        if let Some(error) = &job.error_detail {
            println!("               {error}");
        }
    }
    println!("\nShowing {} of {} jobs", page.jobs.len(), page.total);
    Ok(())
}

async fn cmd_price(
    admin: &CliAdmin,
    actor: &Actor,
    product: &str,
    set: Option<f64>,
    unit: Option<String>,
    history: Option<usize>,
) -> Result<()> {
    let now = Utc::now();
    let price = match set {
        Some(value) if !value.is_finite() || value <= 0.0 => {
            bail!("price must be a positive number, got {value}")
        }
        Some(value) => {
            let update = admin
                .set_manual_price(actor, product, value, unit, now)
                .await?;
            if !update.changed {
                tracing::info!(product, "Active price unchanged");
            }
            update.price
        }
        None => admin.price(actor, product).await?,
    };

    println!(
        "{} {:.2}/{} basis={} confidence={:.2}{}",
        price.product_key,
        price.price,
        price.unit,
        price.basis,
        price.confidence,
        if price.stale { " [stale]" } else { "" },
    );

    if let Some(limit) = history {
        for version in admin.price_history(actor, product, limit).await? {
            println!(
                "  {} {:>10.2} {:<16} x{:.3}{}",
                version.computed_at.format("%Y-%m-%d %H:%M"),
                version.price,
                version.basis.to_string(),
                version.seasonal_factor,
                if version.is_current { " (current)" } else { "" },
            );
        }
    }
    Ok(())
}

fn fmt_opt(id: Option<Uuid>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    const CATALOG: &str = r#"{
        "sources": [],
        "products": [
            {"key": "domates", "name": "Domates", "category": "sebze", "unit": "kg"},
            {"key": "limon", "name": "Limon", "category": "meyve", "unit": "kg"}
        ]
    }"#;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_prices_defaults_to_csv() {
        let cli = Cli::try_parse_from(["ceres", "prices"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Prices {
                format: ExportFormat::Csv
            }
        ));
        let cli = Cli::try_parse_from(["ceres", "prices", "--format", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Prices {
                format: ExportFormat::Json
            }
        ));
    }

    #[test]
    fn test_cancel_rejects_job_and_source_together() {
        let id = Uuid::new_v4().to_string();
        let result = Cli::try_parse_from(["ceres", "cancel", "--job", &id, "--source", "tzob"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_price_unit_requires_set() {
        assert!(Cli::try_parse_from(["ceres", "price", "domates", "--unit", "kg"]).is_err());
        assert!(
            Cli::try_parse_from(["ceres", "price", "domates", "--set", "42.5", "--unit", "kg"])
                .is_ok()
        );
    }

    #[test]
    fn test_parse_reads_reference_index_payload() {
        let catalog = CatalogFile::parse(CATALOG).unwrap();
        let payload = r#"[{"product": "Domates", "price": 30}, {"product": "Karpuz", "price": 9}]"#;

        let output = cmd_parse(SourceKind::ReferenceIndex, payload, &catalog, None, "tzob").unwrap();

        assert_eq!(output.observations.len(), 1);
        assert_eq!(output.observations[0].product_key, "domates");
        assert_eq!(output.observations[0].source_id, "tzob");
        assert_eq!(output.skipped, 1);
    }

    #[test]
    fn test_parse_market_search_needs_a_known_product() {
        let catalog = CatalogFile::parse(CATALOG).unwrap();

        let err = cmd_parse(SourceKind::MarketSearch, "<html></html>", &catalog, None, "m")
            .unwrap_err();
        assert!(err.to_string().contains("--product"));

        let err = cmd_parse(
            SourceKind::MarketSearch,
            "<html></html>",
            &catalog,
            Some("karpuz"),
            "m",
        )
        .unwrap_err();
        assert!(err.to_string().contains("not in the catalog"));
    }

    #[tokio::test]
    async fn test_seed_loads_catalog_into_store() {
        use ceres_core::traits::CatalogStore;
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();
        let store = MemoryStore::new();

        seed(file.path(), &store).await.unwrap();

        assert_eq!(store.list_products().await.unwrap().len(), 2);
    }
}
