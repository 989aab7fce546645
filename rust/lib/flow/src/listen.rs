//! Listener combinators: run a handler each time an action is dispatched,
//! under a rate policy.
//!
//! Each combinator registers one listener per watched action, owned by the
//! calling context. The handler is dispatched as a child of that context, so
//! cancelling the owner cancels in-flight handlers. A watcher spawned with
//! the registration removes the listeners as soon as the owner is cancelled.
//!
//! Policy state (last run, pending timer, previous task) is kept per watched
//! action, not per registration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::action::{Action, ActionSet, Event, Payload};
use crate::context::Context;
use crate::error::TaskError;
use crate::store::{Notification, Store, lock};
use crate::task::Task;
use crate::value::{StateValue, SubscriptionId};

/// Where a handler's payload comes from, resolved when the trigger fires.
#[derive(Clone)]
pub enum PayloadSource {
    Static(Payload),
    FromEvent(Arc<dyn Fn(&Event) -> Payload + Send + Sync>),
}

impl PayloadSource {
    /// Derive the payload from the triggering event.
    pub fn from_event<F>(f: F) -> Self
    where
        F: Fn(&Event) -> Payload + Send + Sync + 'static,
    {
        PayloadSource::FromEvent(Arc::new(f))
    }

    /// Forward the triggering event's payload unchanged.
    pub fn forward() -> Self {
        Self::from_event(|event| event.payload.clone())
    }

    fn resolve(&self, event: &Event) -> Payload {
        match self {
            PayloadSource::Static(payload) => payload.clone(),
            PayloadSource::FromEvent(f) => f(event),
        }
    }
}

impl From<Payload> for PayloadSource {
    fn from(payload: Payload) -> Self {
        PayloadSource::Static(payload)
    }
}

impl From<StateValue> for PayloadSource {
    fn from(value: StateValue) -> Self {
        PayloadSource::Static(Some(value))
    }
}

#[derive(Clone, Copy, Debug)]
enum Policy {
    Throttle(Duration),
    Debounce(Duration),
    Latest,
    Every,
}

#[derive(Default)]
struct PolicyState {
    last_run: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    previous: Option<Task>,
}

/// Handle to the listeners a combinator registered.
#[derive(Debug)]
pub struct Registration {
    store: Store,
    ids: Arc<Mutex<Vec<SubscriptionId>>>,
}

impl Registration {
    pub fn ids(&self) -> Vec<SubscriptionId> {
        lock(&self.ids).clone()
    }

    /// Remove every listener. Already-running handlers are not cancelled.
    pub fn unsubscribe(&self) {
        remove_all(&self.store, &self.ids);
    }
}

fn remove_all(store: &Store, ids: &Mutex<Vec<SubscriptionId>>) {
    for id in lock(ids).drain(..) {
        store.unsubscribe(id);
    }
}

struct Listener {
    ctx: Context,
    handler: Action,
    payload: PayloadSource,
    policy: Policy,
    state: Mutex<PolicyState>,
    ids: Arc<Mutex<Vec<SubscriptionId>>>,
}

impl Listener {
    fn on_trigger(self: &Arc<Self>, notification: &Notification) {
        if self.ctx.is_cancelled() {
            trace!("owner of {} cancelled, removing listener", self.handler.name());
            remove_all(&self.ctx.store, &self.ids);
            return;
        }

        let event = &notification.event;
        let payload = self.payload.resolve(event);
        match self.policy {
            Policy::Every => self.run(payload, event),
            Policy::Latest => {
                let previous = lock(&self.state).previous.take();
                if let Some(task) = previous.filter(|t| !t.is_settled()) {
                    task.cancel();
                }
                self.run(payload, event);
            }
            Policy::Throttle(window) => {
                let due = lock(&self.state)
                    .last_run
                    .is_none_or(|last| Instant::now().duration_since(last) >= window);
                if due {
                    self.run(payload, event);
                }
            }
            Policy::Debounce(window) => {
                let mut state = lock(&self.state);
                if let Some(task) = state.previous.take() {
                    task.cancel();
                }
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                let this = self.clone();
                let event = event.clone();
                let timer = self.ctx.store.config().spawn(async move {
                    tokio::time::sleep(window).await;
                    this.run(payload, &event);
                });
                match timer {
                    Ok(timer) => state.timer = Some(timer),
                    Err(err) => warn!("debounce {} not scheduled: {err}", self.handler.name()),
                }
            }
        }
    }

    fn run(&self, payload: Payload, event: &Event) {
        lock(&self.state).last_run = Some(Instant::now());
        match self.ctx.dispatch_from(&self.handler, payload, event.clone()) {
            Ok(task) => lock(&self.state).previous = Some(task),
            Err(TaskError::Cancelled) => {}
            Err(err) => warn!("handler {} failed: {err}", self.handler.name()),
        }
    }
}

impl Context {
    fn listen(
        &self,
        actions: ActionSet,
        handler: &Action,
        payload: PayloadSource,
        policy: Policy,
    ) -> Result<Registration, TaskError> {
        self.token.check()?;
        let runtime = self.store.config().handle()?;
        let ids = Arc::new(Mutex::new(Vec::new()));

        for action in actions.iter() {
            let listener = Arc::new(Listener {
                ctx: self.clone(),
                handler: handler.clone(),
                payload: payload.clone(),
                policy,
                state: Mutex::new(PolicyState::default()),
                ids: ids.clone(),
            });
            let id = self
                .store
                .subscribe(action, move |n| listener.on_trigger(n));
            lock(&ids).push(id);
        }

        let token = self.token.clone();
        let store = self.store.clone();
        let watched = ids.clone();
        runtime.spawn(async move {
            token.cancelled().await;
            trace!("owner cancelled, removing {} listener(s)", lock(&watched).len());
            remove_all(&store, &watched);
        });

        Ok(Registration {
            store: self.store.clone(),
            ids,
        })
    }

    /// Run `handler` on a dispatch of `actions` only if it last ran at least
    /// `window` ago. Leading edge: the first trigger runs immediately.
    pub fn throttle(
        &self,
        actions: impl Into<ActionSet>,
        window: Duration,
        handler: &Action,
        payload: impl Into<PayloadSource>,
    ) -> Result<Registration, TaskError> {
        self.listen(actions.into(), handler, payload.into(), Policy::Throttle(window))
    }

    /// Run `handler` once `window` has passed without another dispatch of
    /// `actions`. Each trigger cancels the previous handler task and restarts
    /// the timer; the last trigger's payload wins.
    pub fn debounce(
        &self,
        actions: impl Into<ActionSet>,
        window: Duration,
        handler: &Action,
        payload: impl Into<PayloadSource>,
    ) -> Result<Registration, TaskError> {
        self.listen(actions.into(), handler, payload.into(), Policy::Debounce(window))
    }

    /// Run `handler` on every dispatch of `actions`, cancelling the previous
    /// handler task if it has not settled.
    pub fn latest(
        &self,
        actions: impl Into<ActionSet>,
        handler: &Action,
        payload: impl Into<PayloadSource>,
    ) -> Result<Registration, TaskError> {
        self.listen(actions.into(), handler, payload.into(), Policy::Latest)
    }

    /// Run `handler` on every dispatch of `actions`.
    pub fn every(
        &self,
        actions: impl Into<ActionSet>,
        handler: &Action,
        payload: impl Into<PayloadSource>,
    ) -> Result<Registration, TaskError> {
        self.listen(actions.into(), handler, payload.into(), Policy::Every)
    }
}
