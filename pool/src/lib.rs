mod cas;
mod client;
mod http;
pub mod mock;
mod request;

pub use cas::{InputUploader, NoopUploader};
pub use client::{BotInfo, Dimension, PoolClient, PoolTaskResult, PoolTaskState, TriggerResponse};
pub use http::HttpPoolClient;
pub use request::{pool_priority, CasDigest, CasInput, InputRef, IsolatedInput, TaskSlice, TriggerRequest};

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum PoolError {
    #[error("worker pool rpc failed: {0}")]
    Rpc(String),

    #[error("worker pool task {0} not found")]
    TaskNotFound(String),

    #[error("invalid trigger request: {0}")]
    InvalidRequest(String),

    #[error("input upload failed for {repo}@{revision}: {message}")]
    Upload {
        repo: String,
        revision: String,
        message: String,
    },
}

pub type PoolResult<T> = Result<T, PoolError>;
