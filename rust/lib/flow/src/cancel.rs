use crate::error::TaskError;

/// Hierarchical, one-way cancellation flag.
///
/// A child is cancelled when cancelled directly or when any ancestor is.
/// Cancellation never travels upward: cancelling a child leaves its parent
/// and siblings untouched. Cancelling twice is a no-op.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    /// A root token with no parent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child token. Already cancelled if `self` is.
    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Derive a child of `parent`, or a fresh root when there is none.
    pub fn derive(parent: Option<&CancellationToken>) -> Self {
        match parent {
            Some(parent) => parent.child(),
            None => Self::new(),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Gate for context operations: `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once this token (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}
