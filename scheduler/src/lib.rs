pub mod blacklist;
mod blamelist;
mod candidates;
mod drain;
mod jobs;
mod matching;
mod process;
pub mod scoring;
mod view;

mod scheduler;

pub use blacklist::{Blacklist, Rule};
pub use candidates::{Candidate, CandidateView, Diagnostics, JobRef, ScoringSnapshot};
pub use scheduler::{SchedulerOpts, TaskScheduler};

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Lib(#[from] conveyor_lib::LibError),

    #[error(transparent)]
    Store(#[from] conveyor_store::StoreError),

    #[error(transparent)]
    Pool(#[from] conveyor_pool::PoolError),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("invalid blacklist rule: {0}")]
    InvalidRule(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
