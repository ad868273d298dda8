use thiserror::Error;

/// Application-wide error types for Ceres.
#[derive(Error, Debug)]
pub enum AppError {
    /// A source payload could not be interpreted at all.
    #[error("Parse error: {message} (near `{fragment}`)")]
    ParseError { message: String, fragment: String },

    /// A browser or HTTP search exceeded its session timeout.
    #[error("Search timed out after {0} seconds")]
    SearchTimeout(u64),

    /// A browser or HTTP search failed.
    #[error("Search error: {0}")]
    SearchError(String),

    /// The source's circuit breaker is open; no attempt was made.
    #[error("Circuit open for source '{source_id}', retry after {retry_after_secs} seconds")]
    CircuitOpen {
        source_id: String,
        retry_after_secs: u64,
    },

    /// A job failed permanently after its bounded retries.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// No manual entry, observation, or estimate could price the product.
    #[error("No eligible price for product '{0}'")]
    NoEligiblePrice(String),

    /// HTTP request failed (fetching a page).
    #[error("HTTP error (status {status}): {message}")]
    HttpError { status: u16, message: String },

    /// Price estimation service failed.
    #[error("Estimation error (HTTP {status_code}): {message}")]
    EstimationError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A caller-supplied value was rejected.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested transition conflicts with current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    pub fn parse(message: impl Into<String>, fragment: impl AsRef<str>) -> Self {
        AppError::ParseError {
            message: message.into(),
            fragment: truncate_fragment(fragment.as_ref()),
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::SearchTimeout(_)
            | AppError::SearchError(_) => true,
            AppError::HttpError { status, .. } => *status == 429 || *status >= 500,
            AppError::EstimationError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns true if this error counts as a source failure for the breaker.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::SearchTimeout(_)
                | AppError::SearchError(_)
                | AppError::HttpError { .. }
                | AppError::ParseError { .. }
        )
    }

    /// Stable machine-readable code, persisted on failed jobs and returned by the API.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ParseError { .. } => "parse_error",
            AppError::SearchTimeout(_) => "search_timeout",
            AppError::SearchError(_) => "search_error",
            AppError::CircuitOpen { .. } => CIRCUIT_OPEN_CODE,
            AppError::RetryExhausted { .. } => "retry_exhausted",
            AppError::NoEligiblePrice(_) => "no_eligible_price",
            AppError::HttpError { .. } => "http_error",
            AppError::EstimationError { .. } => "estimation_error",
            AppError::SerializationError(_) => "serialization_error",
            AppError::Timeout(_) => "timeout",
            AppError::RateLimitExceeded => "rate_limited",
            AppError::NetworkError(_) => "network_error",
            AppError::DatabaseError(_) => "database_error",
            AppError::ConfigError(_) => "config_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::Generic(_) => "internal_error",
        }
    }
}

/// Error code recorded on jobs that were short-circuited by an open breaker.
pub const CIRCUIT_OPEN_CODE: &str = "circuit_open";

fn truncate_fragment(fragment: &str) -> String {
    const MAX: usize = 120;
    let trimmed = fragment.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
