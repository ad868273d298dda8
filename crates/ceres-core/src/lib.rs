pub mod admin;
pub mod catalog;
pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod job;
pub mod job_queue;
pub mod logbook;
pub mod memory;
pub mod models;
pub mod parsers;
pub mod pricing;
pub mod registry;
pub mod scheduler;
pub mod scrape;
pub mod seasonal;
pub mod session;
pub mod traits;
pub mod trust;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use admin::{Actor, AdminService, Role};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::AppError;
pub use job::{JobStatus, ScrapeJob, TriggerKind};
pub use job_queue::JobQueue;
pub use memory::MemoryStore;
pub use models::{ActivePrice, PriceObservation, Product, Source, SourceKind, compute_hash};
pub use traits::{
    BreakerStore, CatalogStore, Fetcher, ObservationStore, PriceEstimator, PriceStore,
    SearchSession, SessionFactory, Storage,
};
