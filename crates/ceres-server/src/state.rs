use std::sync::Arc;

use ceres_client::OpenAiEstimator;
use ceres_core::AdminService;
use ceres_core::estimate::{ChainedEstimator, TrendEstimator};
use ceres_db::Database;

use crate::auth::AuthTokens;

/// The model-backed estimator when configured, the trend fallback otherwise.
pub type ServerEstimator = ChainedEstimator<Option<OpenAiEstimator>, TrendEstimator>;

pub type ServerAdmin = AdminService<Database, ServerEstimator>;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub db: Database,
    pub admin: Arc<ServerAdmin>,
    pub tokens: AuthTokens,
}
