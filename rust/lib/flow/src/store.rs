//! The store: current state, the reducer composition, listeners, and the
//! dispatch pipeline that ties them together.
//!
//! Every settle of a task (completion, `Loading`, `Failure`) becomes one
//! [`Event`]. The event is reduced under a single lock, so reductions are
//! serialized and each one sees the state left by the previous one. When the
//! resulting snapshot differs by identity, change listeners are notified;
//! listeners keyed on the event's action are notified every time. Listeners
//! always run outside the store's locks, so they may dispatch, subscribe or
//! unsubscribe freely.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, trace, warn};

use crate::action::{Action, ActionId, Event, Payload};
use crate::cancel::CancellationToken;
use crate::config::StoreConfig;
use crate::error::TaskError;
use crate::reducer::{Composition, Reducer, ReducerSpec};
use crate::task::{Settle, Task, TaskGroup, start_task};
use crate::value::{StateValue, SubscriptionId, same_state};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Where a listener is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Every state change, whatever caused it.
    Changes,
    /// Every event for one action, whether or not state changed.
    Action(ActionId),
}

impl From<&Action> for Channel {
    fn from(action: &Action) -> Self {
        Channel::Action(action.id())
    }
}

impl From<Action> for Channel {
    fn from(action: Action) -> Self {
        Channel::Action(action.id())
    }
}

/// What a listener receives.
#[derive(Clone, Debug)]
pub struct Notification {
    /// State after the event was reduced.
    pub state: Option<StateValue>,
    pub event: Event,
}

type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

struct ListenerEntry {
    id: SubscriptionId,
    listener: Listener,
}

/// How to read a value out of the state.
#[derive(Clone)]
pub enum Selector {
    /// The entry at this key of a [`StateMap`](crate::StateMap) state.
    Key(String),
    /// An arbitrary projection of the whole state.
    Func(Arc<dyn Fn(Option<&StateValue>) -> Payload + Send + Sync>),
}

impl Selector {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(Option<&StateValue>) -> Payload + Send + Sync + 'static,
    {
        Selector::Func(Arc::new(f))
    }

    fn apply(&self, state: Option<&StateValue>) -> Payload {
        match self {
            Selector::Key(key) => state
                .and_then(StateValue::as_map)
                .and_then(|map| map.get(key))
                .cloned(),
            Selector::Func(f) => f(state),
        }
    }
}

impl From<&str> for Selector {
    fn from(key: &str) -> Self {
        Selector::Key(key.to_string())
    }
}

impl From<String> for Selector {
    fn from(key: String) -> Self {
        Selector::Key(key)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Selector::Func(_) => f.write_str("Func(..)"),
        }
    }
}

struct StoreInner {
    config: StoreConfig,
    state: RwLock<Option<StateValue>>,
    composition: RwLock<Composition>,
    // Serializes reductions.
    reducing: Mutex<()>,
    listeners: RwLock<HashMap<Channel, Vec<ListenerEntry>>>,
    flows: Mutex<HashMap<ActionId, Task>>,
    once: Mutex<HashMap<ActionId, Task>>,
    next_subscription: AtomicU64,
    disposed: AtomicBool,
}

/// Shared handle to a store. Cloning is cheap; all clones see the same state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// A store with the default configuration.
    ///
    /// Initial state is `root` applied to an empty state with the `Init`
    /// event; with no root the state starts (and stays, until reducers are
    /// added) empty.
    pub fn new(root: Option<Reducer>) -> Self {
        Self::with_config(root, StoreConfig::default())
    }

    pub fn with_config(root: Option<Reducer>, config: StoreConfig) -> Self {
        let composition = Composition::new(root);
        let state = composition.initial();
        debug!("[{}] created", config.name);
        Self {
            inner: Arc::new(StoreInner {
                config,
                state: RwLock::new(state),
                composition: RwLock::new(composition),
                reducing: Mutex::new(()),
                listeners: RwLock::new(HashMap::new()),
                flows: Mutex::new(HashMap::new()),
                once: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    // ====================================================================
    // Dispatch pipeline
    // ====================================================================

    /// Run `action` with `payload` as a root task (no parent token).
    ///
    /// A sync body's failure comes back as `Err` after the `Failure` event has
    /// been reduced; an async body's failure is reported through the returned
    /// task instead.
    pub fn dispatch(&self, action: &Action, payload: Payload) -> Result<Task, TaskError> {
        self.dispatch_inner(action, payload, None, None)
    }

    pub(crate) fn dispatch_inner(
        &self,
        action: &Action,
        payload: Payload,
        parent: Option<&CancellationToken>,
        event: Option<Event>,
    ) -> Result<Task, TaskError> {
        if action.wrapper().is_some() {
            warn!(
                "[{}] {} is emitted by the store and cannot be dispatched",
                self.name(),
                action.name()
            );
            return start_task(action, self, payload, parent, None, |_| {});
        }

        trace!("[{}] dispatch {}", self.name(), action.name());
        let store = self.clone();
        let target = action.clone();
        let sent = payload.clone();
        start_task(action, self, payload, parent, event, move |settle| {
            store.handle_settle(&target, &sent, settle);
        })
    }

    /// Dispatch `action` only the first time this is called for it; later
    /// calls return the first task.
    pub fn dispatch_once(&self, action: &Action, payload: Payload) -> Result<Task, TaskError> {
        self.dispatch_once_inner(action, payload, None)
    }

    pub(crate) fn dispatch_once_inner(
        &self,
        action: &Action,
        payload: Payload,
        parent: Option<&CancellationToken>,
    ) -> Result<Task, TaskError> {
        if let Some(task) = lock(&self.inner.once).get(&action.id()) {
            return Ok(task.clone());
        }
        let task = self.dispatch_inner(action, payload, parent, None)?;
        Ok(lock(&self.inner.once)
            .entry(action.id())
            .or_insert(task)
            .clone())
    }

    fn handle_settle(&self, action: &Action, payload: &Payload, settle: Settle) {
        let event = match settle {
            Settle::Loading => Event {
                action: Action::loading(),
                target: Some(action.clone()),
                payload: payload.clone(),
                result: None,
                error: None,
            },
            Settle::Completed(result) => Event {
                action: action.clone(),
                target: None,
                payload: payload.clone(),
                result,
                error: None,
            },
            Settle::Failed(error) => {
                debug!("[{}] {} failed: {error}", self.name(), action.name());
                Event {
                    action: Action::failure(),
                    target: Some(action.clone()),
                    payload: payload.clone(),
                    result: None,
                    error: Some(error),
                }
            }
        };
        self.apply(event);
    }

    /// Reduce `event`, then notify: change listeners first (only if the
    /// snapshot changed), then listeners on the event's action.
    fn apply(&self, event: Event) {
        let (state, changed) = {
            let _serial = lock(&self.inner.reducing);
            let current = read(&self.inner.state).clone();
            let next = read(&self.inner.composition).reduce(current.as_ref(), &event);
            if same_state(next.as_ref(), current.as_ref()) {
                (current, false)
            } else {
                *write(&self.inner.state) = next.clone();
                (next, true)
            }
        };

        let notification = Notification { state, event };
        if changed {
            self.notify(Channel::Changes, &notification);
        }
        self.notify(Channel::Action(notification.event.action.id()), &notification);
    }

    fn notify(&self, channel: Channel, notification: &Notification) {
        let listeners: Vec<Listener> = read(&self.inner.listeners)
            .get(&channel)
            .map(|entries| entries.iter().map(|e| e.listener.clone()).collect())
            .unwrap_or_default();
        if listeners.is_empty() {
            return;
        }
        trace!(
            "[{}] notify {} listener(s) of {}",
            self.name(),
            listeners.len(),
            notification.event.action.name()
        );
        for listener in listeners {
            listener(notification);
        }
    }

    // ====================================================================
    // State
    // ====================================================================

    /// The current snapshot.
    pub fn get_state(&self) -> Option<StateValue> {
        read(&self.inner.state).clone()
    }

    /// One value out of the current snapshot.
    pub fn select(&self, selector: impl Into<Selector>) -> Payload {
        let selector: Selector = selector.into();
        selector.apply(self.get_state().as_ref())
    }

    /// Several values out of one snapshot, positionally.
    pub fn select_all(&self, selectors: &[Selector]) -> Vec<Payload> {
        let state = self.get_state();
        selectors.iter().map(|s| s.apply(state.as_ref())).collect()
    }

    // ====================================================================
    // Listeners
    // ====================================================================

    /// Attach `listener` to `channel`. Listeners on one channel run in
    /// subscription order.
    pub fn subscribe<F>(&self, channel: impl Into<Channel>, listener: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        write(&self.inner.listeners)
            .entry(channel.into())
            .or_default()
            .push(ListenerEntry {
                id,
                listener: Arc::new(listener),
            });
        id
    }

    /// Attach `listener` to every state change.
    pub fn subscribe_changes<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe(Channel::Changes, listener)
    }

    /// Detach a listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = write(&self.inner.listeners);
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of listeners attached to `channel`.
    pub fn listener_count(&self, channel: impl Into<Channel>) -> usize {
        read(&self.inner.listeners)
            .get(&channel.into())
            .map_or(0, Vec::len)
    }

    // ====================================================================
    // Reducers and flows
    // ====================================================================

    /// Extend the composition.
    ///
    /// If anything was added, the state is re-derived from empty with the
    /// `Init` event (replacing the current state) and change listeners are
    /// notified if the snapshot changed. Re-adding reducers the store already
    /// has does nothing and returns false.
    pub fn reducer(&self, spec: impl Into<ReducerSpec>) -> bool {
        let state = {
            let _serial = lock(&self.inner.reducing);
            let mut composition = write(&self.inner.composition);
            if !composition.add(spec.into()) {
                return false;
            }
            let next = composition.initial();
            drop(composition);

            let mut state = write(&self.inner.state);
            if same_state(next.as_ref(), state.as_ref()) {
                None
            } else {
                *state = next.clone();
                Some(next)
            }
        };

        debug!("[{}] reducers extended", self.name());
        if let Some(state) = state {
            self.notify(
                Channel::Changes,
                &Notification {
                    state,
                    event: Event::init(),
                },
            );
        }
        true
    }

    /// Start `action` as a long-running flow, once per store.
    ///
    /// Calling this again for the same action returns the task started the
    /// first time. A sync flow that fails is not recorded, so it can be
    /// started again.
    pub fn flow(&self, action: &Action) -> Result<Task, TaskError> {
        if let Some(task) = lock(&self.inner.flows).get(&action.id()) {
            return Ok(task.clone());
        }
        debug!("[{}] start flow {}", self.name(), action.name());
        let task = self.dispatch(action, None)?;
        Ok(lock(&self.inner.flows)
            .entry(action.id())
            .or_insert(task)
            .clone())
    }

    /// Start several flows; the group settles when all of them have.
    pub fn flows(&self, actions: &[Action]) -> Result<TaskGroup, TaskError> {
        let tasks = actions
            .iter()
            .map(|action| self.flow(action))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TaskGroup::new(tasks))
    }

    /// Cancel every flow and drop every listener.
    ///
    /// State and reducers are kept; dispatching still reduces, but there is
    /// nobody left to notify until someone subscribes again.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let flows: Vec<Task> = lock(&self.inner.flows).drain().map(|(_, t)| t).collect();
        let once: Vec<Task> = lock(&self.inner.once).drain().map(|(_, t)| t).collect();
        for task in flows.iter().chain(once.iter()) {
            task.cancel();
        }
        write(&self.inner.listeners).clear();
        info!(
            "[{}] disposed, cancelled {} task(s)",
            self.name(),
            flows.len() + once.len()
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.config.name)
            .field("state", &self.get_state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
