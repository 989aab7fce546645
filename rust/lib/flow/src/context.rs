//! The capability set a running action body receives.
//!
//! Every operation checks the owning token first. Once the token is
//! cancelled the operation does nothing and yields `Err(TaskError::Cancelled)`,
//! so a cancelled flow unwinds at its next `?` without side effects.
//! Awaitables returned here also resolve to `Cancelled` as soon as the token
//! is cancelled while they are pending.

use std::collections::BTreeMap;
use std::future::{Future, poll_fn, ready};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::action::{Action, ActionSet, BoxFuture, Event, Payload};
use crate::cancel::CancellationToken;
use crate::error::TaskError;
use crate::reducer::ReducerSpec;
use crate::store::{Selector, Store, lock};
use crate::task::Task;
use crate::value::{StateValue, SubscriptionId};

/// A pending context operation.
pub type Pending<T> = BoxFuture<Result<T, TaskError>>;

/// The common shape `race` and `all` combine: something that settles with an
/// optional value.
pub type Awaitable = Pending<Payload>;

/// Conversion into an [`Awaitable`], for feeding `race` and `all`.
///
/// Non-payload results (`ActionResult`, nested race/all results) are wrapped
/// in a `StateValue`; downcast them back on the way out.
pub trait IntoAwaitable {
    fn into_awaitable(self) -> Awaitable;
}

impl IntoAwaitable for Awaitable {
    fn into_awaitable(self) -> Awaitable {
        self
    }
}

impl IntoAwaitable for Task {
    fn into_awaitable(self) -> Awaitable {
        Box::pin(async move { self.wait().await })
    }
}

impl IntoAwaitable for &Task {
    fn into_awaitable(self) -> Awaitable {
        self.clone().into_awaitable()
    }
}

impl IntoAwaitable for Pending<()> {
    fn into_awaitable(self) -> Awaitable {
        Box::pin(async move { self.await.map(|()| None) })
    }
}

impl IntoAwaitable for Pending<ActionResult> {
    fn into_awaitable(self) -> Awaitable {
        Box::pin(async move { self.await.map(|r| Some(StateValue::new(r))) })
    }
}

impl IntoAwaitable for Pending<RaceResult> {
    fn into_awaitable(self) -> Awaitable {
        Box::pin(async move { self.await.map(|r| Some(StateValue::new(r))) })
    }
}

impl IntoAwaitable for Pending<AllResult> {
    fn into_awaitable(self) -> Awaitable {
        Box::pin(async move { self.await.map(|r| Some(StateValue::new(r))) })
    }
}

/// What `Context::action` resolves with.
#[derive(Clone, Debug)]
pub struct ActionResult {
    pub action: Action,
    pub payload: Payload,
    pub result: Payload,
}

/// What `Context::race` resolves with: every entry settled by the time the
/// race resolved, plus the key of the entry that won.
#[derive(Clone, Debug)]
pub struct RaceResult {
    key: String,
    values: BTreeMap<String, Payload>,
}

impl RaceResult {
    /// Key of the entry that settled first.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// True if `key` settled before the race resolved.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key).and_then(Option::as_ref)
    }

    pub fn get_as<T: std::any::Any>(&self, key: &str) -> Option<&T> {
        self.get(key).and_then(|v| v.downcast_ref::<T>())
    }
}

/// What `Context::all` resolves with: one value per key.
#[derive(Clone, Debug, Default)]
pub struct AllResult {
    values: BTreeMap<String, Payload>,
}

impl AllResult {
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key).and_then(Option::as_ref)
    }

    pub fn get_as<T: std::any::Any>(&self, key: &str) -> Option<&T> {
        self.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn cancelled<T: Send + 'static>() -> Pending<T> {
    Box::pin(ready(Err(TaskError::Cancelled)))
}

/// Handed to every action body. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    pub(crate) store: Store,
    pub(crate) token: CancellationToken,
    event: Option<Event>,
}

impl Context {
    pub(crate) fn new(store: Store, token: CancellationToken, event: Option<Event>) -> Self {
        Self {
            store,
            token,
            event,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The event that triggered this task, for handlers started by
    /// `throttle`, `debounce`, `latest` or `every`.
    pub fn event(&self) -> Option<&Event> {
        self.event.as_ref()
    }

    // ====================================================================
    // Dispatch
    // ====================================================================

    /// Dispatch as a child of this task: cancelling this task cancels it.
    pub fn dispatch(&self, action: &Action, payload: Payload) -> Result<Task, TaskError> {
        self.token.check()?;
        self.store.dispatch_inner(action, payload, Some(&self.token), None)
    }

    /// Child dispatch that carries the triggering event to the handler.
    pub(crate) fn dispatch_from(
        &self,
        action: &Action,
        payload: Payload,
        event: Event,
    ) -> Result<Task, TaskError> {
        self.token.check()?;
        self.store
            .dispatch_inner(action, payload, Some(&self.token), Some(event))
    }

    /// Dispatch `action` at most once per store.
    pub fn dispatch_once(&self, action: &Action, payload: Payload) -> Result<Task, TaskError> {
        self.token.check()?;
        self.store.dispatch_once_inner(action, payload, Some(&self.token))
    }

    /// Start a flow on the store (see `Store::flow`).
    pub fn flow(&self, action: &Action) -> Result<Task, TaskError> {
        self.token.check()?;
        self.store.flow(action)
    }

    /// Add reducers to the store (see `Store::reducer`).
    pub fn reducer(&self, spec: impl Into<ReducerSpec>) -> Result<bool, TaskError> {
        self.token.check()?;
        Ok(self.store.reducer(spec))
    }

    // ====================================================================
    // State
    // ====================================================================

    /// The full state snapshot, as of now.
    pub fn state(&self) -> Result<Option<StateValue>, TaskError> {
        self.token.check()?;
        Ok(self.store.get_state())
    }

    /// One selected value, as of now.
    pub fn select(&self, selector: impl Into<Selector>) -> Result<Payload, TaskError> {
        self.token.check()?;
        Ok(self.store.select(selector))
    }

    /// Several selected values, positionally.
    pub fn select_all(&self, selectors: &[Selector]) -> Result<Vec<Payload>, TaskError> {
        self.token.check()?;
        Ok(self.store.select_all(selectors))
    }

    // ====================================================================
    // Awaitables
    // ====================================================================

    /// Resolves the next time any of `actions` is dispatched on the store.
    ///
    /// The subscription is made now, not when the future is first polled, so
    /// a dispatch right after this call is not missed.
    pub fn action(&self, actions: impl Into<ActionSet>) -> Pending<ActionResult> {
        if self.token.is_cancelled() {
            return cancelled();
        }

        let (tx, rx) = oneshot::channel::<ActionResult>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let ids: Arc<Mutex<Vec<SubscriptionId>>> = Arc::new(Mutex::new(Vec::new()));

        let actions: ActionSet = actions.into();
        for action in actions.iter() {
            let tx = tx.clone();
            let ids_c = ids.clone();
            let store = self.store.clone();
            let id = self.store.subscribe(action, move |n| {
                if let Some(tx) = lock(&tx).take() {
                    let _ = tx.send(ActionResult {
                        action: n.event.action.clone(),
                        payload: n.event.payload.clone(),
                        result: n.event.result.clone(),
                    });
                }
                for id in lock(&ids_c).drain(..) {
                    store.unsubscribe(id);
                }
            });
            lock(&ids).push(id);
        }

        let guard = Unsubscribe {
            store: self.store.clone(),
            ids,
        };
        let token = self.token.clone();
        Box::pin(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(TaskError::Cancelled),
                fired = rx => fired.map_err(|_| TaskError::Cancelled),
            }
        })
    }

    /// Settles after `duration`.
    pub fn delay(&self, duration: Duration) -> Pending<()> {
        if self.token.is_cancelled() {
            return cancelled();
        }
        let deadline = Instant::now() + duration;
        let token = self.token.clone();
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(TaskError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Ok(()),
            }
        })
    }

    /// Settles with `value` after `duration`.
    pub fn delay_with(&self, duration: Duration, value: Payload) -> Awaitable {
        let wait = self.delay(duration);
        Box::pin(async move { wait.await.map(|()| value) })
    }

    /// Resolves as soon as the first entry settles.
    ///
    /// The result holds every entry that settled by then and the winning
    /// key; ties go to the entry listed first. Losing
    /// entries are dropped from the race, not cancelled: a losing `Task`
    /// keeps running and will still reach the store when it settles.
    ///
    /// An entry that resolves `Cancelled` drops out of the race. If every
    /// entry does, the race itself is `Cancelled`. A failure of the first
    /// entry to settle fails the race.
    pub fn race<K: Into<String>>(
        &self,
        entries: impl IntoIterator<Item = (K, Awaitable)>,
    ) -> Pending<RaceResult> {
        if self.token.is_cancelled() {
            return cancelled();
        }
        let mut entries: Vec<(String, Option<Awaitable>)> = entries
            .into_iter()
            .map(|(k, a)| (k.into(), Some(a)))
            .collect();
        let empty = entries.is_empty();
        let token = self.token.clone();

        Box::pin(async move {
            let settled = poll_fn(move |cx| {
                if empty {
                    return Poll::Pending;
                }
                let mut winner: Option<String> = None;
                let mut values = BTreeMap::new();
                for (key, slot) in entries.iter_mut() {
                    let Some(fut) = slot.as_mut() else { continue };
                    match fut.as_mut().poll(cx) {
                        Poll::Pending => {}
                        Poll::Ready(Err(TaskError::Cancelled)) => *slot = None,
                        Poll::Ready(Err(err)) => {
                            if winner.is_none() {
                                return Poll::Ready(Err(err));
                            }
                            *slot = None;
                        }
                        Poll::Ready(Ok(value)) => {
                            winner.get_or_insert_with(|| key.clone());
                            values.insert(key.clone(), value);
                            *slot = None;
                        }
                    }
                }
                if let Some(key) = winner {
                    return Poll::Ready(Ok(RaceResult { key, values }));
                }
                if entries.iter().all(|(_, slot)| slot.is_none()) {
                    return Poll::Ready(Err(TaskError::Cancelled));
                }
                Poll::Pending
            });
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(TaskError::Cancelled),
                result = settled => result,
            }
        })
    }

    /// Resolves when every entry has settled, or with the first failure.
    ///
    /// Entries are awaited as given; `all` never re-runs anything, so awaiting
    /// the same tasks in a second `all` sees their original outcomes.
    pub fn all<K: Into<String>>(
        &self,
        entries: impl IntoIterator<Item = (K, Awaitable)>,
    ) -> Pending<AllResult> {
        if self.token.is_cancelled() {
            return cancelled();
        }
        let (keys, futs): (Vec<String>, Vec<Awaitable>) = entries
            .into_iter()
            .map(|(k, a)| (k.into(), a))
            .unzip();
        let token = self.token.clone();

        Box::pin(async move {
            let results = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TaskError::Cancelled),
                results = futures::future::try_join_all(futs) => results?,
            };
            Ok(AllResult {
                values: keys.into_iter().zip(results).collect(),
            })
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("store", &self.store.name())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Drops the subscriptions of an `action()` waiter that goes away unresolved.
struct Unsubscribe {
    store: Store,
    ids: Arc<Mutex<Vec<SubscriptionId>>>,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        for id in lock(&self.ids).drain(..) {
            self.store.unsubscribe(id);
        }
    }
}

/// Settles after `duration`. Not tied to any task.
pub async fn delay(duration: Duration) {
    tokio::time::sleep(duration).await;
}
