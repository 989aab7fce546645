use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::TaskError;

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Label carried by every log line the store emits.
    pub name: String,
    /// Runtime that async action bodies, debounce timers and lazy loaders
    /// are spawned on. `None` uses the runtime current at spawn time; with
    /// neither, anything that needs to spawn fails with a `TaskError`.
    pub runtime: Option<Handle>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "store".to_string(),
            runtime: None,
        }
    }
}

impl StoreConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// The configured runtime, else the one this thread is running in.
    pub(crate) fn handle(&self) -> Result<Handle, TaskError> {
        match &self.runtime {
            Some(handle) => Ok(handle.clone()),
            None => Handle::try_current()
                .map_err(|err| TaskError::msg(format!("[{}] no tokio runtime: {err}", self.name))),
        }
    }

    pub(crate) fn spawn<F>(&self, fut: F) -> Result<JoinHandle<()>, TaskError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Ok(self.handle()?.spawn(fut))
    }
}
