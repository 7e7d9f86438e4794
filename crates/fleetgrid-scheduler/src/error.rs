//! Scheduler error types.

use thiserror::Error;

use fleetgrid_state::Version;

/// Errors that can occur while serving hosts or planning.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no configuration for {name}:{version}")]
    AppNotConfigured { name: String, version: Version },

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),

    #[error("update queue error: {0}")]
    Queue(#[from] fleetgrid_rollout::QueueError),

    #[error("cloud engine error: {0}")]
    Cloud(#[from] fleetgrid_state::CloudError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
