//! Flow: a state container with cancellable effect orchestration.
//!
//! State lives in a [`Store`] and only changes by reducing [`Event`]s.
//! Effects are [`Action`]s: dispatching one runs its body as a [`Task`] and
//! feeds the outcome back through the reducers.
//!
//! # Actions
//!
//! - `Action::signal(name)`: a marker, reduced and nothing else
//! - `Action::sync(name, body)`: body runs to completion inside `dispatch`
//! - `Action::future(name, body)`: body is spawned; the store sees a
//!   `Loading` event right away and the result (or a `Failure`) later
//!
//! # Cancellation
//!
//! Every task owns a [`CancellationToken`] derived from its parent's. Every
//! [`Context`] operation checks it first and yields
//! `Err(TaskError::Cancelled)` once it is cancelled, so flows unwind with `?`.
//! Cancelled tasks never reduce and never notify.
//!
//! # Example
//!
//! ```ignore
//! use openerp_flow::{Action, Reducer, Store};
//!
//! let increase = Action::signal("Increase");
//! let inc = increase.clone();
//! let store = Store::new(Some(Reducer::typed(|| 0i64, move |n, e| {
//!     e.is(&inc).then(|| n + 1)
//! })));
//!
//! // A flow that bumps the counter on every click, at most every 100ms.
//! let click = Action::signal("Click");
//! let (click_c, increase_c) = (click.clone(), increase.clone());
//! store.flow(&Action::sync("Root", move |ctx, _| {
//!     ctx.throttle(&click_c, Duration::from_millis(100), &increase_c, None)?;
//!     Ok(None)
//! }))?;
//!
//! store.dispatch(&click, None)?;
//! ```

pub mod action;
pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod lazy;
pub mod listen;
pub mod reducer;
pub mod store;
pub mod task;
pub mod value;

// Re-export primary types at crate root.
pub use action::{Action, ActionId, ActionSet, BoxFuture, Event, Payload, Wrapper};
pub use cancel::CancellationToken;
pub use config::StoreConfig;
pub use context::{
    ActionResult, AllResult, Awaitable, Context, IntoAwaitable, Pending, RaceResult, delay,
};
pub use error::TaskError;
pub use lazy::{Loader, Module, lazy, loader};
pub use listen::{PayloadSource, Registration};
pub use reducer::{Reducer, ReducerSpec, combine, merge_sequential};
pub use store::{Channel, Notification, Selector, Store};
pub use task::{Outcome, Task, TaskGroup};
pub use value::{StateValue, StateMap, SubscriptionId, same_state};
