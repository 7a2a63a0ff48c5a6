mod blacklist;
mod health;
mod jobs;
mod pubsub;
mod queue;

use axum::{routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::error::HostResult;
use crate::SchedulerState;

async fn metrics_handler() -> HostResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = String::new();
    encoder
        .encode_utf8(&prometheus::gather(), &mut buffer)
        .map_err(|e| anyhow::anyhow!("failed to encode metrics: {e}"))?;
    Ok(buffer)
}

#[derive(OpenApi)]
#[openapi(info(
    title = "conveyor",
    description = "Continuous-integration task scheduler status API"
))]
struct Docs;

pub fn create_docs() -> utoipa::openapi::OpenApi {
    let mut docs = Docs::openapi();
    docs.merge(health::create_docs());
    docs.merge(queue::create_docs());
    docs.merge(jobs::create_docs());
    docs.merge(pubsub::create_docs());
    docs.merge(blacklist::create_docs());
    docs
}

pub fn create_router(state: SchedulerState) -> Router {
    let api = Router::new()
        .merge(health::create_router())
        .merge(queue::create_router())
        .merge(jobs::create_router())
        .merge(pubsub::create_router())
        .merge(blacklist::create_router())
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    api.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", create_docs()))
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve<F>(state: SchedulerState, address: &str, shutdown: F) -> HostResult<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!("listening on http://{address}");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
