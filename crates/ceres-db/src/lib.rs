//! PostgreSQL storage for the Ceres engine.
//!
//! [`Database`] implements every store trait from `ceres-core`, so it can be
//! handed to [`ceres_core::Engine`] in place of the in-memory store.

pub mod config;
pub mod database;

mod breaker_repository;
mod catalog_repository;
mod job_repository;
mod observation_repository;
mod price_repository;

pub use config::DatabaseConfig;
pub use database::Database;
