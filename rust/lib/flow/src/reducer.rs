//! Reducer composition.
//!
//! A reducer maps `(previous state, event)` to the next state. Returning the
//! very same `StateValue` (same allocation) means "no change"; the store uses
//! that identity to decide whether to notify.
//!
//! The store layers its reducers in a fixed order:
//!
//! 1. the root reducer given at construction,
//! 2. whole-state reducers added later, merged sequentially,
//! 3. per-key reducers added later, combined into a [`StateMap`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::action::Event;
use crate::value::{StateMap, StateValue, same_state};

type ReduceFn = dyn Fn(Option<&StateValue>, &Event) -> Option<StateValue> + Send + Sync;

/// A state-transition function. Cloning shares the function; identity is the
/// `Arc` pointer, so adding the same `Reducer` twice is detected.
#[derive(Clone)]
pub struct Reducer(Arc<ReduceFn>);

impl Reducer {
    /// Wrap a raw reducer over optional, type-erased state.
    pub fn new<F>(reduce: F) -> Self
    where
        F: Fn(Option<&StateValue>, &Event) -> Option<StateValue> + Send + Sync + 'static,
    {
        Reducer(Arc::new(reduce))
    }

    /// A reducer over one concrete type.
    ///
    /// `init` seeds the state when there is none yet (or it holds another
    /// type). `reduce` returns `Some(next)` to replace the state and `None` to
    /// keep the current snapshot untouched.
    ///
    /// ```ignore
    /// let counter = Reducer::typed(|| 0i64, move |count, event| {
    ///     if event.is(&increase) { Some(count + 1) } else { None }
    /// });
    /// ```
    pub fn typed<T, I, F>(init: I, reduce: F) -> Self
    where
        T: Any + Send + Sync,
        I: Fn() -> T + Send + Sync + 'static,
        F: Fn(&T, &Event) -> Option<T> + Send + Sync + 'static,
    {
        Reducer::new(move |state, event| {
            match state.and_then(|s| s.downcast_ref::<T>()) {
                Some(current) => match reduce(current, event) {
                    Some(next) => Some(StateValue::new(next)),
                    None => state.cloned(),
                },
                None => {
                    let seed = init();
                    let next = reduce(&seed, event).unwrap_or(seed);
                    Some(StateValue::new(next))
                }
            }
        })
    }

    /// A reducer that always yields `value` once seeded. Handy for constant
    /// branches of a combined state.
    pub fn constant<T: Any + Send + Sync + Clone>(value: T) -> Self {
        Reducer::typed(move || value.clone(), |_, _| None)
    }

    pub fn reduce(&self, state: Option<&StateValue>, event: &Event) -> Option<StateValue> {
        (self.0)(state, event)
    }

    pub fn ptr_eq(&self, other: &Reducer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reducer")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Combine per-key reducers into one reducer over a [`StateMap`].
///
/// Each key's reducer sees the previous value at that key. The map is copied
/// on the first key whose value changes identity; if none does, the input
/// snapshot comes back unchanged. A key reducer returning `None` removes it.
pub fn combine<K: Into<String>>(reducers: impl IntoIterator<Item = (K, Reducer)>) -> Reducer {
    let entries: Vec<(String, Reducer)> = reducers
        .into_iter()
        .map(|(k, r)| (k.into(), r))
        .collect();

    Reducer::new(move |state, event| {
        let current = state.and_then(StateValue::as_map);
        let mut next: Option<StateMap> = None;

        for (key, reducer) in &entries {
            let prev = match &next {
                Some(map) => map.get(key).cloned(),
                None => current.and_then(|m| m.get(key)).cloned(),
            };
            let value = reducer.reduce(prev.as_ref(), event);
            if same_state(value.as_ref(), prev.as_ref()) {
                continue;
            }
            let map = next.get_or_insert_with(|| current.cloned().unwrap_or_default());
            match value {
                Some(v) => {
                    map.insert(key.clone(), v);
                }
                None => {
                    map.remove(key);
                }
            }
        }

        match next {
            Some(map) => Some(StateValue::new(map)),
            None => state.cloned(),
        }
    })
}

/// `b` applied to the output of `a`.
pub fn merge_sequential(a: &Reducer, b: &Reducer) -> Reducer {
    let (a, b) = (a.clone(), b.clone());
    Reducer::new(move |state, event| {
        let mid = a.reduce(state, event);
        b.reduce(mid.as_ref(), event)
    })
}

/// What `Store::reducer` accepts.
pub enum ReducerSpec {
    /// Per-key reducers. A key that already has a reducer keeps it.
    Keyed(Vec<(String, Reducer)>),
    /// Whole-state reducers, chained after the existing ones in order.
    Whole(Vec<Reducer>),
}

impl From<Reducer> for ReducerSpec {
    fn from(reducer: Reducer) -> Self {
        ReducerSpec::Whole(vec![reducer])
    }
}

impl From<Vec<Reducer>> for ReducerSpec {
    fn from(reducers: Vec<Reducer>) -> Self {
        ReducerSpec::Whole(reducers)
    }
}

impl<K: Into<String>> From<(K, Reducer)> for ReducerSpec {
    fn from((key, reducer): (K, Reducer)) -> Self {
        ReducerSpec::Keyed(vec![(key.into(), reducer)])
    }
}

impl<K: Into<String>> From<Vec<(K, Reducer)>> for ReducerSpec {
    fn from(entries: Vec<(K, Reducer)>) -> Self {
        ReducerSpec::Keyed(entries.into_iter().map(|(k, r)| (k.into(), r)).collect())
    }
}

impl<K: Into<String>, const N: usize> From<[(K, Reducer); N]> for ReducerSpec {
    fn from(entries: [(K, Reducer); N]) -> Self {
        ReducerSpec::Keyed(entries.into_iter().map(|(k, r)| (k.into(), r)).collect())
    }
}

/// The store's layered reducer: root, then chained whole-state reducers,
/// then combined per-key reducers.
#[derive(Default)]
pub(crate) struct Composition {
    whole: Option<Reducer>,
    seen: Vec<Reducer>,
    keyed: Vec<(String, Reducer)>,
    combined: Option<Reducer>,
}

impl Composition {
    pub(crate) fn new(root: Option<Reducer>) -> Self {
        Self {
            seen: root.iter().cloned().collect(),
            whole: root,
            ..Self::default()
        }
    }

    /// Merge `spec` in. Returns true if the composition changed.
    pub(crate) fn add(&mut self, spec: ReducerSpec) -> bool {
        let mut changed = false;
        match spec {
            ReducerSpec::Keyed(entries) => {
                for (key, reducer) in entries {
                    if self.keyed.iter().any(|(k, _)| *k == key) {
                        continue;
                    }
                    self.keyed.push((key, reducer));
                    changed = true;
                }
                if changed {
                    self.combined = Some(combine(self.keyed.iter().cloned()));
                }
            }
            ReducerSpec::Whole(reducers) => {
                for reducer in reducers {
                    if self.seen.iter().any(|r| r.ptr_eq(&reducer)) {
                        continue;
                    }
                    self.whole = Some(match self.whole.take() {
                        Some(prev) => merge_sequential(&prev, &reducer),
                        None => reducer.clone(),
                    });
                    self.seen.push(reducer);
                    changed = true;
                }
            }
        }
        changed
    }

    pub(crate) fn reduce(&self, state: Option<&StateValue>, event: &Event) -> Option<StateValue> {
        let mut next = state.cloned();
        if let Some(whole) = &self.whole {
            next = whole.reduce(next.as_ref(), event);
        }
        if let Some(combined) = &self.combined {
            next = combined.reduce(next.as_ref(), event);
        }
        next
    }

    /// State derived from empty with the `Init` event.
    pub(crate) fn initial(&self) -> Option<StateValue> {
        self.reduce(None, &Event::init())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;

    fn event(action: &Action) -> Event {
        Event {
            action: action.clone(),
            target: None,
            payload: None,
            result: None,
            error: None,
        }
    }

    fn counter(increase: &Action, decrease: &Action) -> Reducer {
        let (inc, dec) = (increase.clone(), decrease.clone());
        Reducer::typed(
            || 0i64,
            move |n, e| {
                if e.is(&inc) {
                    Some(n + 1)
                } else if e.is(&dec) {
                    Some(n - 1)
                } else {
                    None
                }
            },
        )
    }

    // ========================================================================
    // Typed reducers
    // ========================================================================

    #[test]
    fn typed_seeds_from_empty() {
        let r = Reducer::constant(5u32);
        let s = r.reduce(None, &Event::init()).unwrap();
        assert_eq!(s.downcast_ref::<u32>(), Some(&5));
    }

    #[test]
    fn typed_unchanged_returns_same_snapshot() {
        let inc = Action::signal("Increase");
        let dec = Action::signal("Decrease");
        let noop = Action::signal("Noop");
        let r = counter(&inc, &dec);

        let s0 = r.reduce(None, &Event::init()).unwrap();
        let s1 = r.reduce(Some(&s0), &event(&noop)).unwrap();
        assert!(s0.ptr_eq(&s1));

        let s2 = r.reduce(Some(&s0), &event(&inc)).unwrap();
        assert!(!s0.ptr_eq(&s2));
        assert_eq!(s2.downcast_ref::<i64>(), Some(&1));
    }

    // ========================================================================
    // combine
    // ========================================================================

    #[test]
    fn combine_builds_keyed_initial_state() {
        let r = combine([("one", Reducer::constant(1u32)), ("two", Reducer::constant(2u32))]);
        let s = r.reduce(None, &Event::init()).unwrap();
        let map = s.as_map().unwrap();
        assert_eq!(map.get_as::<u32>("one"), Some(&1));
        assert_eq!(map.get_as::<u32>("two"), Some(&2));
    }

    #[test]
    fn combine_noop_returns_same_reference() {
        let noop = Action::signal("Noop");
        let r = combine([("one", Reducer::constant(1u32))]);
        let s0 = r.reduce(None, &Event::init()).unwrap();
        let s1 = r.reduce(Some(&s0), &event(&noop)).unwrap();
        assert!(s0.ptr_eq(&s1));
    }

    #[test]
    fn combine_copies_on_write_and_shares_untouched_keys() {
        let inc = Action::signal("Increase");
        let dec = Action::signal("Decrease");
        let r = combine([
            ("count", counter(&inc, &dec)),
            ("label", Reducer::constant("fixed".to_string())),
        ]);
        let s0 = r.reduce(None, &Event::init()).unwrap();
        let s1 = r.reduce(Some(&s0), &event(&inc)).unwrap();

        assert!(!s0.ptr_eq(&s1));
        let (m0, m1) = (s0.as_map().unwrap(), s1.as_map().unwrap());
        assert_eq!(m0.get_as::<i64>("count"), Some(&0));
        assert_eq!(m1.get_as::<i64>("count"), Some(&1));
        assert!(m0.get("label").unwrap().ptr_eq(m1.get("label").unwrap()));
    }

    #[test]
    fn combine_removes_key_when_reducer_returns_none() {
        let clear = Action::signal("Clear");
        let clear_c = clear.clone();
        let r = combine([(
            "token",
            Reducer::new(move |state, e| {
                if e.is(&clear_c) {
                    None
                } else {
                    Some(state.cloned().unwrap_or_else(|| StateValue::new("t".to_string())))
                }
            }),
        )]);
        let s0 = r.reduce(None, &Event::init()).unwrap();
        assert!(s0.as_map().unwrap().contains_key("token"));
        let s1 = r.reduce(Some(&s0), &event(&clear)).unwrap();
        assert!(!s1.as_map().unwrap().contains_key("token"));
    }

    // ========================================================================
    // merge_sequential
    // ========================================================================

    #[test]
    fn merge_feeds_first_output_into_second() {
        let double = Reducer::typed(|| 1i64, |n, _| Some(n * 2));
        let add_three = Reducer::typed(|| 0i64, |n, _| Some(n + 3));
        let noop = Action::signal("Noop");

        let merged = merge_sequential(&double, &add_three);
        let seeded = StateValue::new(5i64);
        let out = merged.reduce(Some(&seeded), &event(&noop)).unwrap();
        assert_eq!(out.downcast_ref::<i64>(), Some(&13));

        let reversed = merge_sequential(&add_three, &double);
        let out = reversed.reduce(Some(&seeded), &event(&noop)).unwrap();
        assert_eq!(out.downcast_ref::<i64>(), Some(&16));
    }

    // ========================================================================
    // Composition
    // ========================================================================

    #[test]
    fn composition_readding_same_reducer_is_noop() {
        let r = Reducer::constant(1u8);
        let mut c = Composition::new(None);
        assert!(c.add(r.clone().into()));
        assert!(!c.add(r.into()));
    }

    #[test]
    fn composition_root_counts_as_seen() {
        let root = Reducer::constant(1u8);
        let mut c = Composition::new(Some(root.clone()));
        assert!(!c.add(root.into()));
    }

    #[test]
    fn composition_first_keyed_reducer_wins() {
        let mut c = Composition::new(None);
        assert!(c.add(("other", Reducer::constant(1u32)).into()));
        assert!(!c.add(("other", Reducer::constant(9u32)).into()));
        let s = c.initial().unwrap();
        assert_eq!(s.as_map().unwrap().get_as::<u32>("other"), Some(&1));
    }

    #[test]
    fn composition_layers_root_then_keyed() {
        let root = Reducer::typed(
            || StateMap::new().with("count", StateValue::new(0i64)),
            |_, _| None,
        );
        let mut c = Composition::new(Some(root));
        c.add(("other", Reducer::constant(1u32)).into());

        let s = c.initial().unwrap();
        let map = s.as_map().unwrap();
        assert_eq!(map.get_as::<i64>("count"), Some(&0));
        assert_eq!(map.get_as::<u32>("other"), Some(&1));
    }

    #[test]
    fn composition_replay_is_deterministic() {
        let inc = Action::signal("Increase");
        let dec = Action::signal("Decrease");
        let c = Composition::new(Some(counter(&inc, &dec)));
        let script = [&inc, &inc, &dec, &inc, &dec, &dec];

        let run = || {
            let mut state = c.initial();
            let mut seen = Vec::new();
            for a in script {
                state = c.reduce(state.as_ref(), &event(a));
                seen.push(*state.as_ref().unwrap().downcast_ref::<i64>().unwrap());
            }
            seen
        };
        assert_eq!(run(), vec![1, 2, 1, 2, 1, 0]);
        assert_eq!(run(), run());
    }

    #[test]
    fn empty_composition_keeps_empty_state() {
        let c = Composition::new(None);
        assert!(c.initial().is_none());
    }
}
