//! Update queue error types.

use thiserror::Error;

use crate::queue::UpdateState;

/// Errors that can occur during update queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("no queue for host: {0}")]
    UnknownHost(String),

    #[error("no queued update for app {app} on host {host}")]
    UnknownApp { host: String, app: String },

    #[error("illegal update state transition {from} -> {to}")]
    IllegalTransition { from: UpdateState, to: UpdateState },
}

pub type QueueResult<T> = Result<T, QueueError>;
