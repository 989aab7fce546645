//! Task engine.
//!
//! Every dispatch runs through [`start_task`]: derive a token, build a
//! context bound to it, run the action body, and report back through the
//! `on_settle` callback. Sync and async bodies come out as the same [`Task`]
//! handle, so callers never care which one they dispatched.

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context as PollContext, Poll};

use tokio::sync::watch;
use tracing::debug;

use crate::action::{Action, ActionKind, BoxFuture, Event, Payload};
use crate::cancel::CancellationToken;
use crate::context::Context;
use crate::error::TaskError;
use crate::store::Store;

/// What a task reports to the store's reduction pipeline.
#[derive(Debug, Clone)]
pub(crate) enum Settle {
    /// An async body has started and not yet settled.
    Loading,
    Completed(Payload),
    Failed(TaskError),
}

/// How a task settles.
pub type Outcome = Result<Payload, TaskError>;

struct TaskInner {
    action: Action,
    is_async: bool,
    token: CancellationToken,
    outcome: watch::Sender<Option<Outcome>>,
}

/// Handle to one action invocation.
///
/// Cheap to clone; all clones share the outcome. Await it (or call
/// [`wait`](Task::wait)) for the result. Once settled the outcome never
/// changes. A cancelled task never settles: awaiting it yields
/// `Err(TaskError::Cancelled)`.
///
/// A body that itself returns `Err(Cancelled)` while its own token is still
/// live (typically because it awaited a child task that was cancelled from
/// elsewhere, say by `latest` or by hand) leaves the task neither settled
/// nor cancelled, and [`wait`](Task::wait) does not return until the task is
/// cancelled. Cancel the parent too, or race the child against something
/// that settles.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    fn new(action: &Action, token: CancellationToken, is_async: bool) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(TaskInner {
                action: action.clone(),
                is_async,
                token,
                outcome,
            }),
        }
    }

    pub fn action(&self) -> &Action {
        &self.inner.action
    }

    /// True if the action body is a future.
    pub fn is_async(&self) -> bool {
        self.inner.is_async
    }

    /// Cancel this task and every task dispatched from inside it.
    pub fn cancel(&self) {
        if !self.inner.token.is_cancelled() {
            debug!("cancel task {}", self.inner.action.name());
        }
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn is_settled(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// The result, once the task has completed successfully.
    pub fn result(&self) -> Payload {
        match &*self.inner.outcome.borrow() {
            Some(Ok(result)) => result.clone(),
            _ => None,
        }
    }

    /// The settled outcome, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Wait for the task to settle.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.inner.outcome.subscribe();
        let settled = async {
            rx.wait_for(Option::is_some)
                .await
                .map(|slot| (*slot).clone())
        };
        tokio::select! {
            biased;
            settled = settled => match settled {
                Ok(Some(outcome)) => outcome,
                _ => Err(TaskError::Cancelled),
            },
            _ = self.inner.token.cancelled() => Err(TaskError::Cancelled),
        }
    }

    fn settle(&self, outcome: Outcome) {
        self.inner.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("action", &self.inner.action.name())
            .field("async", &self.inner.is_async)
            .field("cancelled", &self.is_cancelled())
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl IntoFuture for Task {
    type Output = Outcome;
    type IntoFuture = BoxFuture<Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl IntoFuture for &Task {
    type Output = Outcome;
    type IntoFuture = BoxFuture<Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        self.clone().into_future()
    }
}

/// Tasks started together by `Store::flows`.
#[derive(Clone, Debug)]
pub struct TaskGroup {
    tasks: Vec<Task>,
    cancelled: Arc<AtomicBool>,
}

impl TaskGroup {
    pub(crate) fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every task in the group. Later calls do nothing.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in &self.tasks {
            task.cancel();
        }
    }

    /// Wait for every task. Fails with the first error.
    pub async fn wait(&self) -> Result<Vec<Payload>, TaskError> {
        futures::future::try_join_all(self.tasks.iter().map(Task::wait)).await
    }
}

impl IntoFuture for TaskGroup {
    type Output = Result<Vec<Payload>, TaskError>;
    type IntoFuture = BoxFuture<Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

/// Run `action` under a child of `parent` (or a fresh root token).
///
/// - Sync bodies settle before this returns. A failure is reported through
///   `on_settle` and returned as `Err`; a cancellation is returned without
///   any report.
/// - Async bodies need a runtime (see [`StoreConfig`](crate::StoreConfig));
///   without one this returns `Err` before the body is built, reporting
///   nothing.
/// - Async bodies run up to their first suspension point here, then
///   `Settle::Loading` is reported, and the rest runs on the store's runtime.
///   Completion or failure is reported once, never after cancellation.
pub(crate) fn start_task<F>(
    action: &Action,
    store: &Store,
    payload: Payload,
    parent: Option<&CancellationToken>,
    event: Option<Event>,
    on_settle: F,
) -> Result<Task, TaskError>
where
    F: Fn(Settle) + Send + Sync + 'static,
{
    let token = CancellationToken::derive(parent);

    match action.kind() {
        ActionKind::Signal | ActionKind::Wrapper(_) => {
            let task = Task::new(action, token.clone(), false);
            if !token.is_cancelled() {
                on_settle(Settle::Completed(None));
            }
            task.settle(Ok(None));
            Ok(task)
        }
        ActionKind::Sync(body) => {
            let context = Context::new(store.clone(), token.clone(), event);
            match body(&context, payload) {
                Ok(result) => {
                    let task = Task::new(action, token.clone(), false);
                    if !token.is_cancelled() {
                        on_settle(Settle::Completed(result.clone()));
                    }
                    task.settle(Ok(result));
                    Ok(task)
                }
                Err(TaskError::Cancelled) => Err(TaskError::Cancelled),
                Err(err) => {
                    if !token.is_cancelled() {
                        on_settle(Settle::Failed(err.clone()));
                    }
                    Err(err)
                }
            }
        }
        ActionKind::Async(body) => {
            let runtime = store.config().handle()?;
            let context = Context::new(store.clone(), token.clone(), event);
            let task = Task::new(action, token.clone(), true);

            let mut fut = body(context, payload);
            let first = {
                let _guard = runtime.enter();
                let waker = futures::task::noop_waker();
                let mut cx = PollContext::from_waker(&waker);
                fut.as_mut().poll(&mut cx)
            };

            on_settle(Settle::Loading);

            let handle = task.clone();
            runtime.spawn(async move {
                let outcome = match first {
                    Poll::Ready(outcome) => outcome,
                    Poll::Pending => fut.await,
                };
                match outcome {
                    Ok(_) | Err(TaskError::Failed(_)) if token.is_cancelled() => {}
                    Ok(result) => {
                        on_settle(Settle::Completed(result.clone()));
                        handle.settle(Ok(result));
                    }
                    Err(TaskError::Cancelled) => {}
                    Err(err) => {
                        on_settle(Settle::Failed(err.clone()));
                        handle.settle(Err(err));
                    }
                }
            });
            Ok(task)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::value::StateValue;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(Settle) + Send + Sync + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_c = log.clone();
        let on_settle = move |s: Settle| {
            let entry = match s {
                Settle::Loading => "loading".to_string(),
                Settle::Completed(r) => format!(
                    "completed:{}",
                    r.and_then(|v| v.downcast_ref::<u32>().copied())
                        .map(|n| n.to_string())
                        .unwrap_or_default()
                ),
                Settle::Failed(e) => format!("failed:{e}"),
            };
            log_c.lock().unwrap().push(entry);
        };
        (log, on_settle)
    }

    // ========================================================================
    // Sync bodies
    // ========================================================================

    #[tokio::test]
    async fn sync_settles_immediately() {
        let store = Store::new(None);
        let action = Action::sync("Seven", |_, _| Ok(Some(StateValue::new(7u32))));
        let (log, on_settle) = recorder();

        let task = start_task(&action, &store, None, None, None, on_settle).unwrap();
        assert!(!task.is_async());
        assert!(task.is_settled());
        assert_eq!(task.result().unwrap().downcast_ref::<u32>(), Some(&7));
        assert_eq!(*log.lock().unwrap(), vec!["completed:7"]);
    }

    #[tokio::test]
    async fn sync_failure_reports_once_and_returns_err() {
        let store = Store::new(None);
        let action = Action::sync("Broken", |_, _| Err(TaskError::msg("boom")));
        let (log, on_settle) = recorder();

        let err = start_task(&action, &store, None, None, None, on_settle).unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(*log.lock().unwrap(), vec!["failed:boom"]);
    }

    #[tokio::test]
    async fn sync_cancellation_reports_nothing() {
        let store = Store::new(None);
        let action = Action::sync("Gone", |_, _| Err(TaskError::Cancelled));
        let (log, on_settle) = recorder();

        let err = start_task(&action, &store, None, None, None, on_settle).unwrap_err();
        assert!(err.is_cancelled());
        assert!(log.lock().unwrap().is_empty());
    }

    // ========================================================================
    // Async bodies
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn async_reports_loading_then_completion() {
        let store = Store::new(None);
        let action = Action::future("Slow", |ctx, _| async move {
            ctx.delay(Duration::from_millis(50)).await?;
            Ok(Some(StateValue::new(3u32)))
        });
        let (log, on_settle) = recorder();

        let task = start_task(&action, &store, None, None, None, on_settle).unwrap();
        assert!(task.is_async());
        assert_eq!(*log.lock().unwrap(), vec!["loading"]);

        let result = task.wait().await.unwrap();
        assert_eq!(result.unwrap().downcast_ref::<u32>(), Some(&3));
        assert_eq!(*log.lock().unwrap(), vec!["loading", "completed:3"]);
    }

    #[tokio::test]
    async fn async_without_suspension_still_settles_later() {
        let store = Store::new(None);
        let action = Action::future("Quick", |_, _| async { Ok(Some(StateValue::new(1u32))) });
        let (log, on_settle) = recorder();

        let task = start_task(&action, &store, None, None, None, on_settle).unwrap();
        assert!(!task.is_settled());
        assert_eq!(*log.lock().unwrap(), vec!["loading"]);
        task.wait().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["loading", "completed:1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn async_failure_rejects_awaiters() {
        let store = Store::new(None);
        let action = Action::future("Broken", |ctx, _| async move {
            ctx.delay(Duration::from_millis(10)).await?;
            Err(TaskError::msg("cannot load"))
        });
        let (log, on_settle) = recorder();

        let task = start_task(&action, &store, None, None, None, on_settle).unwrap();
        let err = task.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "cannot load");
        // A second awaiter sees the same failure.
        assert_eq!(task.wait().await.unwrap_err().to_string(), "cannot load");
        assert_eq!(*log.lock().unwrap(), vec!["loading", "failed:cannot load"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_async_never_reports_completion() {
        let store = Store::new(None);
        let action = Action::future("Slow", |_ctx, _| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Some(StateValue::new(9u32)))
        });
        let (log, on_settle) = recorder();

        let task = start_task(&action, &store, None, None, None, on_settle).unwrap();
        task.cancel();
        assert!(task.wait().await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock().unwrap(), vec!["loading"]);
        assert!(!task.is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_async_never_reports_failure() {
        let store = Store::new(None);
        let action = Action::future("Doomed", |_ctx, _| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(TaskError::msg("too late"))
        });
        let (log, on_settle) = recorder();

        let task = start_task(&action, &store, None, None, None, on_settle).unwrap();
        task.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock().unwrap(), vec!["loading"]);
        assert!(task.outcome().is_none());
    }

    #[test]
    fn async_without_runtime_fails_before_running() {
        let store = Store::new(None);
        let ran = Arc::new(AtomicBool::new(false));
        let ran_c = ran.clone();
        let action = Action::future("Offline", move |_, _| {
            ran_c.store(true, Ordering::SeqCst);
            async { Ok(None) }
        });
        let (log, on_settle) = recorder();

        let err = start_task(&action, &store, None, None, None, on_settle).unwrap_err();
        assert!(!err.is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn awaiting_child_cancelled_elsewhere_leaves_parent_pending() {
        let store = Store::new(None);
        let child = Action::future("Child", |ctx, _| async move {
            ctx.delay(Duration::from_secs(1)).await?;
            Ok(None)
        });
        let handles = Arc::new(Mutex::new(None));
        let handles_c = handles.clone();
        let parent = Action::future("Parent", move |ctx, _| {
            let (child, handles) = (child.clone(), handles_c.clone());
            async move {
                let task = ctx.dispatch(&child, None)?;
                *handles.lock().unwrap() = Some(task.clone());
                task.await
            }
        });

        let root = store.dispatch(&parent, None).unwrap();
        let child_task = handles.lock().unwrap().clone().unwrap();
        child_task.cancel();

        let waited = tokio::time::timeout(Duration::from_secs(5), root.wait()).await;
        assert!(waited.is_err());
        assert!(!root.is_settled());
        assert!(!root.is_cancelled());

        root.cancel();
        assert!(root.wait().await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_token_cancels_child_task() {
        let store = Store::new(None);
        let parent = CancellationToken::new();
        let action = Action::future("Slow", |ctx, _| async move {
            ctx.delay(Duration::from_millis(100)).await?;
            Ok(None)
        });
        let (log, on_settle) = recorder();

        let task = start_task(&action, &store, None, Some(&parent), None, on_settle).unwrap();
        parent.cancel();
        assert!(task.is_cancelled());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock().unwrap(), vec!["loading"]);
    }

    #[tokio::test]
    async fn settled_task_ignores_later_cancel() {
        let store = Store::new(None);
        let action = Action::sync("Seven", |_, _| Ok(Some(StateValue::new(7u32))));
        let task = store.dispatch(&action, None).unwrap();
        task.cancel();
        let result = task.wait().await.unwrap();
        assert_eq!(result.unwrap().downcast_ref::<u32>(), Some(&7));
    }

    // ========================================================================
    // TaskGroup
    // ========================================================================

    #[tokio::test]
    async fn group_cancel_is_idempotent_and_reaches_all() {
        let store = Store::new(None);
        let a = Action::future("A", |ctx, _| async move {
            ctx.delay(Duration::from_secs(1)).await?;
            Ok(None)
        });
        let b = Action::future("B", |ctx, _| async move {
            ctx.delay(Duration::from_secs(1)).await?;
            Ok(None)
        });
        let group = TaskGroup::new(vec![
            store.dispatch(&a, None).unwrap(),
            store.dispatch(&b, None).unwrap(),
        ]);
        group.cancel();
        group.cancel();
        assert!(group.tasks().iter().all(Task::is_cancelled));
        assert!(group.wait().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn group_waits_for_all_results() {
        let store = Store::new(None);
        let one = Action::sync("One", |_, _| Ok(Some(StateValue::new(1u32))));
        let two = Action::future("Two", |_, _| async { Ok(Some(StateValue::new(2u32))) });
        let group = TaskGroup::new(vec![
            store.dispatch(&one, None).unwrap(),
            store.dispatch(&two, None).unwrap(),
        ]);
        let results = group.await.unwrap();
        let values: Vec<u32> = results
            .into_iter()
            .map(|r| *r.unwrap().downcast_ref::<u32>().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2]);
    }
}
