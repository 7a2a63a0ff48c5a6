use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use utoipa::OpenApi;

use conveyor_scheduler::Rule;

use crate::error::{HostError, HostResult};
use crate::SchedulerState;

#[utoipa::path(
    get,
    path = "/blacklist",
    tag = "Blacklist",
    responses(
        (status = 200, description = "All blacklist rules", body = [Rule])
    )
)]
#[debug_handler(state = SchedulerState)]
/// List the active blacklist rules.
async fn list_handler(State(state): State<SchedulerState>) -> Json<Vec<Rule>> {
    Json(state.scheduler.blacklist_rules())
}

#[utoipa::path(
    post,
    path = "/blacklist",
    tag = "Blacklist",
    request_body = Rule,
    responses(
        (status = 200, description = "Rule added"),
        (status = 400, description = "Invalid rule")
    )
)]
#[debug_handler(state = SchedulerState)]
/// Add a blacklist rule.
async fn add_handler(
    State(state): State<SchedulerState>,
    Json(rule): Json<Rule>,
) -> HostResult<StatusCode> {
    state.scheduler.add_blacklist_rule(rule)?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    delete,
    path = "/blacklist/{name}",
    tag = "Blacklist",
    params(("name" = String, Path, description = "Rule name")),
    responses(
        (status = 200, description = "Rule removed"),
        (status = 404, description = "No such rule")
    )
)]
#[debug_handler(state = SchedulerState)]
/// Remove a blacklist rule by name.
async fn remove_handler(
    State(state): State<SchedulerState>,
    Path(name): Path<String>,
) -> HostResult<StatusCode> {
    if state.scheduler.remove_blacklist_rule(&name) {
        Ok(StatusCode::OK)
    } else {
        Err(HostError::NotFound(format!("blacklist rule {name}")))
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(list_handler, add_handler, remove_handler),
    components(schemas(Rule))
)]
struct Docs;

pub fn create_docs() -> utoipa::openapi::OpenApi {
    Docs::openapi()
}

pub fn create_router() -> Router<SchedulerState> {
    Router::new()
        .route("/blacklist", get(list_handler).post(add_handler))
        .route("/blacklist/:name", delete(remove_handler))
}
