//! Deferred actions: stand-ins for actions whose definitions are loaded on
//! first use.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use tracing::{debug, warn};

use crate::action::{Action, BoxFuture, Payload};
use crate::context::Context;
use crate::error::TaskError;
use crate::store::lock;

/// A loaded module whose default export is the action to run.
#[derive(Clone, Debug)]
pub struct Module {
    pub default: Action,
}

impl From<Module> for Action {
    fn from(module: Module) -> Self {
        module.default
    }
}

/// Produces the real action behind a lazy one.
pub type Loader = Arc<dyn Fn() -> BoxFuture<Result<Action, TaskError>> + Send + Sync>;

/// Wrap an async constructor as a [`Loader`].
pub fn loader<F, Fut, A>(f: F) -> Loader
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<A, TaskError>> + Send + 'static,
    A: Into<Action> + 'static,
{
    Arc::new(move || -> BoxFuture<Result<Action, TaskError>> {
        let fut = f();
        Box::pin(async move { fut.await.map(Into::into) })
    })
}

enum Phase {
    Idle,
    Loading,
    Ready(Vec<Action>),
}

struct LazyState {
    phase: Phase,
    queue: VecDeque<(Context, Payload)>,
}

/// An action that loads its real actions on first dispatch.
///
/// The loaders run once, concurrently. Dispatches made while they run are
/// queued and replayed in order, each through the context it was made in,
/// once they have all resolved; later dispatches run the loaded actions
/// right away. Every loaded action is dispatched with the same payload, in
/// loader order. If any loader fails the queue is dropped and the next
/// dispatch tries again.
pub fn lazy(loaders: impl IntoIterator<Item = Loader>) -> Action {
    let loaders: Arc<Vec<Loader>> = Arc::new(loaders.into_iter().collect());
    let state = Arc::new(Mutex::new(LazyState {
        phase: Phase::Idle,
        queue: VecDeque::new(),
    }));

    Action::sync("Lazy", move |ctx, payload| {
        let mut guard = lock(&state);
        if let Phase::Ready(actions) = &guard.phase {
            let actions = actions.clone();
            drop(guard);
            run_all(ctx, &actions, payload);
            return Ok(None);
        }
        guard.queue.push_back((ctx.clone(), payload));
        if matches!(guard.phase, Phase::Idle) {
            guard.phase = Phase::Loading;
            drop(guard);
            debug!("loading {} lazy action(s)", loaders.len());
            let spawned = ctx
                .store
                .config()
                .spawn(load(loaders.clone(), state.clone()));
            if let Err(err) = spawned {
                let mut guard = lock(&state);
                guard.queue.clear();
                guard.phase = Phase::Idle;
                return Err(err);
            }
        }
        Ok(None)
    })
}

async fn load(loaders: Arc<Vec<Loader>>, state: Arc<Mutex<LazyState>>) {
    match try_join_all(loaders.iter().map(|l| l())).await {
        Ok(actions) => loop {
            // Drain before flipping to Ready so queued calls keep their order.
            let next = {
                let mut guard = lock(&state);
                match guard.queue.pop_front() {
                    Some(call) => call,
                    None => {
                        guard.phase = Phase::Ready(actions);
                        return;
                    }
                }
            };
            let (ctx, payload) = next;
            run_all(&ctx, &actions, payload);
        },
        Err(err) => {
            warn!("lazy action failed to load: {err}");
            let mut guard = lock(&state);
            guard.queue.clear();
            guard.phase = Phase::Idle;
        }
    }
}

// Loaded actions see the same triggering event as the stand-in did.
fn run_all(ctx: &Context, actions: &[Action], payload: Payload) {
    for action in actions {
        let dispatched = match ctx.event() {
            Some(event) => ctx.dispatch_from(action, payload.clone(), event.clone()),
            None => ctx.dispatch(action, payload.clone()),
        };
        match dispatched {
            Ok(_) | Err(TaskError::Cancelled) => {}
            Err(err) => warn!("lazy {} failed: {err}", action.name()),
        }
    }
}

impl Context {
    /// Build a lazy action from `loaders`, typically for `every` or
    /// `latest`. See [`lazy`].
    pub fn lazy(&self, loaders: impl IntoIterator<Item = Loader>) -> Result<Action, TaskError> {
        self.token.check()?;
        Ok(lazy(loaders))
    }
}
