use axum::{debug_handler, extract::State, http::StatusCode, routing::post, Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use utoipa::{OpenApi, ToSchema};

use crate::error::{HostError, HostResult};
use crate::SchedulerState;

/// Pub/sub push envelope wrapping a worker-pool completion notification.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PushMessage {
    pub message: PushMessageData,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PushMessageData {
    /// Base64 of the notification JSON.
    pub data: String,
}

#[derive(Debug, Deserialize)]
struct TaskNotification {
    #[serde(rename = "swarmingTaskId", alias = "taskId")]
    task_id: String,
}

#[utoipa::path(
    post,
    path = "/pubsub",
    tag = "PubSub",
    request_body = PushMessage,
    responses(
        (status = 200, description = "Notification processed or ignored"),
        (status = 400, description = "Undecodable notification"),
        (status = 500, description = "Processing failed; the message will be redelivered")
    )
)]
#[debug_handler(state = SchedulerState)]
/// Worker-pool task completion notifications. Unknown task ids are
/// acknowledged so dead messages are not redelivered forever.
async fn handler(
    State(state): State<SchedulerState>,
    Json(push): Json<PushMessage>,
) -> HostResult<StatusCode> {
    let decoded = STANDARD
        .decode(&push.message.data)
        .map_err(|e| HostError::Config(format!("bad pubsub payload: {e}")))?;
    let notification: TaskNotification = serde_json::from_slice(&decoded)?;

    let known = state
        .scheduler
        .update_from_pool(&notification.task_id)
        .await?;
    if !known {
        tracing::debug!(
            "acknowledging notification for unknown pool task {}",
            notification.task_id
        );
    }
    Ok(StatusCode::OK)
}

#[derive(OpenApi)]
#[openapi(paths(handler), components(schemas(PushMessage, PushMessageData)))]
struct Docs;

pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<SchedulerState> {
    Router::new().route("/pubsub", post(handler))
}
