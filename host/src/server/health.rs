use axum::{debug_handler, http::StatusCode, routing::get, Router};
use utoipa::OpenApi;

use crate::SchedulerState;

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Scheduler is up"),
    )
)]
#[debug_handler(state = SchedulerState)]
/// Health check
///
/// Liveness of the loop itself is exported through /metrics.
async fn handler() -> StatusCode {
    StatusCode::OK
}

#[derive(OpenApi)]
#[openapi(paths(handler))]
struct Docs;

pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<SchedulerState> {
    Router::new().route("/health", get(handler))
}
