use std::sync::Arc;

use thiserror::Error;

/// Outcome of a task or context operation that did not produce a value.
///
/// `Cancelled` is not a user error: it is the signal a cancelled flow uses to
/// unwind through `?`. The task boundary swallows it, so it never reaches a
/// reducer and never produces a `Failure` event.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The owning cancellation token was cancelled.
    #[error("task cancelled")]
    Cancelled,

    /// The action body failed. Shared so every awaiter sees the same error.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl TaskError {
    /// Build a failure from anything `anyhow` can hold.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Failed(Arc::new(err.into()))
    }

    /// Build a failure from a message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        TaskError::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    /// The underlying failure, if this is not a cancellation.
    pub fn failure(&self) -> Option<&anyhow::Error> {
        match self {
            TaskError::Cancelled => None,
            TaskError::Failed(err) => Some(err),
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(Arc::new(err))
    }
}
