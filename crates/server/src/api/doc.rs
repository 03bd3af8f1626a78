//! OpenAPI document served via Scalar UI at `/docs`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "twinder API",
        version = "0.1.0",
        description = "Swipe ingestion and per-user like/dislike aggregates.",
    ),
    tags(
        (name = "Health", description = "Server readiness and backends"),
        (name = "Swipes", description = "Swipe ingestion through the broker"),
        (name = "Users", description = "Per-user stats and match lists"),
    ),
    paths(
        crate::api::health::health,
        crate::api::swipe::swipe,
        crate::api::users::user_stats,
        crate::api::users::user_matches,
    ),
    components(schemas(
        crate::api::ErrorResponse,
        crate::api::health::HealthResponse,
        twinder_core::SwipeRequest,
        twinder_core::UserStats,
        twinder_core::UserMatches,
    ))
)]
pub struct ApiDoc;
