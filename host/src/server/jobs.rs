use axum::{
    debug_handler,
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::{OpenApi, ToSchema};

use conveyor_lib::job::Job;

use crate::error::{HostError, HostResult};
use crate::SchedulerState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ForceJobRequest {
    pub repo: String,
    pub revision: String,
    pub job: String,
}

#[utoipa::path(
    post,
    path = "/jobs",
    tag = "Jobs",
    request_body = ForceJobRequest,
    responses(
        (status = 200, description = "The created forced job", body = Job),
        (status = 400, description = "Unknown repo or job spec")
    )
)]
#[debug_handler(state = SchedulerState)]
/// Manually request a job. Its tasks run at maximum priority and bypass
/// deduplication against earlier runs.
async fn force_handler(
    State(state): State<SchedulerState>,
    Json(req): Json<ForceJobRequest>,
) -> HostResult<Json<Job>> {
    let job = state
        .scheduler
        .trigger_forced_job(&req.repo, &req.revision, &req.job)
        .await?;
    Ok(Json(job))
}

#[utoipa::path(
    get,
    path = "/job/{id}",
    tag = "Jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "The job", body = Job),
        (status = 404, description = "No such job")
    )
)]
#[debug_handler(state = SchedulerState)]
/// Look up one job by id.
async fn job_handler(
    State(state): State<SchedulerState>,
    Path(id): Path<String>,
) -> HostResult<Json<Job>> {
    state
        .scheduler
        .get_job(&id)
        .await?
        .map(Json)
        .ok_or_else(|| HostError::NotFound(format!("job {id}")))
}

#[derive(OpenApi)]
#[openapi(
    paths(force_handler, job_handler),
    components(schemas(ForceJobRequest, Job))
)]
struct Docs;

pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<SchedulerState> {
    Router::new()
        .route("/jobs", post(force_handler))
        .route("/job/:id", get(job_handler))
}
