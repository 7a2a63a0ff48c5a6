pub mod graph;
pub mod id;
pub mod job;
pub mod repo;
pub mod specs;
pub mod subst;
pub mod task;
pub mod window;

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum LibError {
    #[error("unknown repo: {0}")]
    UnknownRepo(String),

    #[error("unknown commit {commit} in repo {repo}")]
    UnknownCommit { repo: String, commit: String },

    #[error("unknown task spec {name} at {repo}@{revision}")]
    UnknownTaskSpec {
        repo: String,
        revision: String,
        name: String,
    },

    #[error("unknown job spec {name} at {repo}@{revision}")]
    UnknownJobSpec {
        repo: String,
        revision: String,
        name: String,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(String),
}

pub type LibResult<T> = Result<T, LibError>;
