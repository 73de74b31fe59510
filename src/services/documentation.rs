use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for KeyFury Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::results::get_results,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::results::ResultsResponse,
            crate::dto::results::PlayerResult,
            crate::dto::results::PerformanceSampleView,
            crate::dto::ws::ClientMessage,
            crate::dto::ws::ServerMessage,
            crate::dto::ws::PlayerView,
            crate::dto::ws::ChatMessageView,
            crate::dto::ws::TimerSyncView,
            crate::error::ErrorBody,
            crate::state::session::EndReason,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "results", description = "Post-round standings"),
        (name = "race", description = "WebSocket race coordination"),
    )
)]
pub struct ApiDoc;
