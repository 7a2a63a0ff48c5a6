use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum HostError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Lib(#[from] conveyor_lib::LibError),

    #[error(transparent)]
    Pool(#[from] conveyor_pool::PoolError),

    #[error(transparent)]
    Scheduler(#[from] conveyor_scheduler::SchedulerError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type HostResult<T> = Result<T, HostError>;

impl IntoResponse for HostError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            HostError::NotFound(_) => StatusCode::NOT_FOUND,
            HostError::Config(_) | HostError::Serde(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
