use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Ceres API",
        version = "0.1.0",
        description = "Admin and pricing API for the Ceres commodity price engine."
    ),
    paths(
        crate::routes::source_health,
        crate::routes::stats,
        crate::routes::list_jobs,
        crate::routes::logs,
        crate::routes::trigger,
        crate::routes::reset,
        crate::routes::retry,
        crate::routes::cancel,
        crate::routes::cancel_job,
        crate::routes::cleanup,
        crate::routes::list_prices,
        crate::routes::get_price,
        crate::routes::price_history,
        crate::routes::set_manual_price,
        crate::routes::recompute,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::JobResponse,
        crate::dto::JobSummaryResponse,
        crate::dto::JobListResponse,
        crate::dto::SourceRequest,
        crate::dto::ScopeRequest,
        crate::dto::CleanupRequest,
        crate::dto::CountResponse,
        crate::dto::BreakerResponse,
        crate::dto::SourceHealthResponse,
        crate::dto::SourceActivityResponse,
        crate::dto::StatsResponse,
        crate::dto::LogEntryResponse,
        crate::dto::HealthResponse,
        crate::dto::PriceResponse,
        crate::dto::PriceListResponse,
        crate::dto::ManualPriceRequest,
        crate::dto::PriceUpdateResponse,
        crate::dto::RecomputeRequest,
        crate::dto::RecomputeFailure,
        crate::dto::RecomputeResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "admin", description = "Source health, job queue control and logs"),
        (name = "prices", description = "Active prices and manual overrides"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI document.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "ADMIN_TOKEN grants every operation, VIEWER_TOKEN grants reads only.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
