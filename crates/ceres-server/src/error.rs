use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use ceres_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::InvalidInput(_) | AppError::SerializationError(_) => StatusCode::BAD_REQUEST,
        AppError::Unauthorized => StatusCode::UNAUTHORIZED,
        AppError::Forbidden(_) => StatusCode::FORBIDDEN,
        AppError::NotFound(_) | AppError::NoEligiblePrice(_) => StatusCode::NOT_FOUND,
        AppError::CircuitOpen { .. } | AppError::Conflict(_) => StatusCode::CONFLICT,
        AppError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        AppError::Timeout(_) | AppError::SearchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        AppError::HttpError { .. }
        | AppError::NetworkError(_)
        | AppError::SearchError(_)
        | AppError::EstimationError { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let retry_after_secs = match &self.0 {
            AppError::CircuitOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "Request failed");
        }

        let body = ErrorResponse {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
            retry_after_secs,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_domain_errors_to_status() {
        let open = AppError::CircuitOpen {
            source_id: "hal".into(),
            retry_after_secs: 42,
        };
        assert_eq!(status_for(&open), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&AppError::Conflict("busy".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&AppError::Forbidden("viewer".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&AppError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&AppError::InvalidInput("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&AppError::DatabaseError("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_circuit_open_sets_retry_after() {
        let response = ApiError(AppError::CircuitOpen {
            source_id: "hal".into(),
            retry_after_secs: 42,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }
}
