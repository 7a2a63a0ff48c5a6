use axum::{
    debug_handler,
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

use conveyor_lib::task::Task;
use conveyor_scheduler::CandidateView;

use crate::error::{HostError, HostResult};
use crate::SchedulerState;

#[derive(Serialize, ToSchema)]
pub struct QueueStatus {
    /// End of the last completed drain.
    pub last_scheduled: Option<DateTime<Utc>>,
    /// Scored candidates that were not triggered, best first.
    pub queue: Vec<CandidateView>,
    /// Candidates dropped during the last iteration, with the reason in
    /// their diagnostics.
    pub rejected: Vec<CandidateView>,
}

#[utoipa::path(
    get,
    path = "/queue",
    tag = "Scheduling",
    responses(
        (status = 200, description = "Current candidate queue with diagnostics", body = QueueStatus)
    )
)]
#[debug_handler(state = SchedulerState)]
/// The candidate queue as of the last loop iteration.
async fn queue_handler(State(state): State<SchedulerState>) -> HostResult<Json<QueueStatus>> {
    Ok(Json(QueueStatus {
        last_scheduled: state.scheduler.last_scheduled().await,
        queue: state.scheduler.queue_view().await,
        rejected: state.scheduler.rejected_view().await,
    }))
}

#[utoipa::path(
    get,
    path = "/task/{id}",
    tag = "Scheduling",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "The task", body = Task),
        (status = 404, description = "No such task")
    )
)]
#[debug_handler(state = SchedulerState)]
/// Look up one task by id.
async fn task_handler(
    State(state): State<SchedulerState>,
    Path(id): Path<String>,
) -> HostResult<Json<Task>> {
    state
        .scheduler
        .get_task(&id)
        .await?
        .map(Json)
        .ok_or_else(|| HostError::NotFound(format!("task {id}")))
}

#[derive(OpenApi)]
#[openapi(
    paths(queue_handler, task_handler),
    components(schemas(
        QueueStatus,
        CandidateView,
        conveyor_scheduler::Diagnostics,
        conveyor_scheduler::JobRef,
        conveyor_scheduler::ScoringSnapshot,
        Task,
    ))
)]
struct Docs;

pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<SchedulerState> {
    Router::new()
        .route("/queue", get(queue_handler))
        .route("/task/:id", get(task_handler))
}
