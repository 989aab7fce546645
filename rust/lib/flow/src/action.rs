use std::any::Any;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::Context;
use crate::error::TaskError;
use crate::value::StateValue;

/// A boxed, `Send`-able future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Payloads and results travel as optional type-erased values.
pub type Payload = Option<StateValue>;

type SyncBody = Arc<dyn Fn(&Context, Payload) -> Result<Payload, TaskError> + Send + Sync>;
type AsyncBody = Arc<dyn Fn(Context, Payload) -> BoxFuture<Result<Payload, TaskError>> + Send + Sync>;

// Ids 1..=15 are reserved for the well-known actions.
const INIT_ID: u64 = 1;
const LOADING_ID: u64 = 2;
const FAILURE_ID: u64 = 3;
static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(16);

/// Stable identity of an action, assigned once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

/// The synthetic actions the engine emits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper {
    /// Initial derivation of state. Reducers see this with an empty state.
    Init,
    /// An async action has started; `target` is the real action.
    Loading,
    /// An action failed; `target` is the real action, `error` is set.
    Failure,
}

/// How an action runs, fixed when the action is defined.
#[derive(Clone)]
pub(crate) enum ActionKind {
    /// "This happened." No body; settles synchronously with no result.
    Signal,
    Sync(SyncBody),
    Async(AsyncBody),
    Wrapper(Wrapper),
}

/// An action: an identity that reducers and listeners key on, plus the body
/// (if any) that runs when it is dispatched.
///
/// Cloning is cheap. Equality and hashing use the id only, so two actions
/// built from the same closure are still distinct.
#[derive(Clone)]
pub struct Action {
    id: ActionId,
    name: Arc<str>,
    kind: ActionKind,
}

impl Action {
    fn with_kind(name: &str, kind: ActionKind) -> Self {
        Self {
            id: ActionId(NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed)),
            name: Arc::from(name),
            kind,
        }
    }

    fn well_known(id: u64, name: &str, wrapper: Wrapper) -> Self {
        Self {
            id: ActionId(id),
            name: Arc::from(name),
            kind: ActionKind::Wrapper(wrapper),
        }
    }

    /// A bodiless action: dispatching it only runs the reducers and listeners.
    pub fn signal(name: &str) -> Self {
        Self::with_kind(name, ActionKind::Signal)
    }

    /// An action whose body runs to completion on the dispatching thread.
    ///
    /// ```ignore
    /// let double = Action::sync("Double", |_ctx, payload| {
    ///     let n = payload.and_then(|p| p.downcast_ref::<i64>().copied()).unwrap_or(0);
    ///     Ok(Some(StateValue::new(n * 2)))
    /// });
    /// ```
    pub fn sync<F>(name: &str, body: F) -> Self
    where
        F: Fn(&Context, Payload) -> Result<Payload, TaskError> + Send + Sync + 'static,
    {
        Self::with_kind(name, ActionKind::Sync(Arc::new(body)))
    }

    /// An action whose body is a future, spawned on the store's runtime.
    /// Dispatching one from a thread with no runtime, on a store configured
    /// without one, fails instead of running the body.
    ///
    /// ```ignore
    /// let load = Action::future("Load", |ctx, _payload| async move {
    ///     ctx.delay(Duration::from_millis(50)).await?;
    ///     Ok(Some(StateValue::new(1u32)))
    /// });
    /// ```
    pub fn future<F, Fut>(name: &str, body: F) -> Self
    where
        F: Fn(Context, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, TaskError>> + Send + 'static,
    {
        let body: AsyncBody = Arc::new(move |ctx, payload| -> BoxFuture<Result<Payload, TaskError>> {
            Box::pin(body(ctx, payload))
        });
        Self::with_kind(name, ActionKind::Async(body))
    }

    /// Reducers see this when state is (re)derived from empty.
    pub fn init() -> Self {
        Self::well_known(INIT_ID, "Init", Wrapper::Init)
    }

    /// Emitted before an async action settles. `Event::target` is the real action.
    pub fn loading() -> Self {
        Self::well_known(LOADING_ID, "Loading", Wrapper::Loading)
    }

    /// Emitted when an action fails. `Event::target` is the real action.
    pub fn failure() -> Self {
        Self::well_known(FAILURE_ID, "Failure", Wrapper::Failure)
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_async(&self) -> bool {
        matches!(self.kind, ActionKind::Async(_))
    }

    /// The well-known wrapper this action is, if any.
    pub fn wrapper(&self) -> Option<Wrapper> {
        match self.kind {
            ActionKind::Wrapper(w) => Some(w),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &ActionKind {
        &self.kind
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Action {}

impl Hash for Action {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ActionKind::Signal => "signal",
            ActionKind::Sync(_) => "sync",
            ActionKind::Async(_) => "async",
            ActionKind::Wrapper(_) => "wrapper",
        };
        f.debug_struct("Action")
            .field("id", &self.id.0)
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

impl From<&Action> for Action {
    fn from(action: &Action) -> Self {
        action.clone()
    }
}

/// One or more actions, for operations that accept either.
#[derive(Clone, Debug)]
pub struct ActionSet(pub(crate) Vec<Action>);

impl ActionSet {
    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.0.iter()
    }
}

impl From<Action> for ActionSet {
    fn from(action: Action) -> Self {
        ActionSet(vec![action])
    }
}

impl From<&Action> for ActionSet {
    fn from(action: &Action) -> Self {
        ActionSet(vec![action.clone()])
    }
}

impl From<Vec<Action>> for ActionSet {
    fn from(actions: Vec<Action>) -> Self {
        ActionSet(actions)
    }
}

impl From<&[Action]> for ActionSet {
    fn from(actions: &[Action]) -> Self {
        ActionSet(actions.to_vec())
    }
}

impl<const N: usize> From<[&Action; N]> for ActionSet {
    fn from(actions: [&Action; N]) -> Self {
        ActionSet(actions.into_iter().cloned().collect())
    }
}

/// The unit passed to every reducer and listener.
///
/// `target` is set only when `action` is `Loading` or `Failure`, and names the
/// real action being wrapped.
#[derive(Clone, Debug)]
pub struct Event {
    pub action: Action,
    pub target: Option<Action>,
    pub payload: Payload,
    pub result: Payload,
    pub error: Option<TaskError>,
}

impl Event {
    pub(crate) fn init() -> Self {
        Self {
            action: Action::init(),
            target: None,
            payload: None,
            result: None,
            error: None,
        }
    }

    /// True if this event is for `action`.
    pub fn is(&self, action: &Action) -> bool {
        self.action == *action
    }

    /// True if this is a `Loading`/`Failure` wrapper around `action`.
    pub fn targets(&self, action: &Action) -> bool {
        self.target.as_ref() == Some(action)
    }

    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    pub fn result_as<T: Any>(&self) -> Option<&T> {
        self.result.as_ref().and_then(|r| r.downcast_ref::<T>())
    }
}
