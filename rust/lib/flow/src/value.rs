use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A type-erased, reference-counted value.
///
/// State snapshots, payloads and results are all `StateValue`s. Clone is
/// cheap (an atomic increment), and identity is the `Arc` pointer: two
/// values are "the same" only if they share an allocation. Reducers rely on
/// this to signal "nothing changed" by handing back the value they got.
#[derive(Clone)]
pub struct StateValue {
    inner: Arc<dyn Any + Send + Sync>,
}

impl StateValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// `None` if the value is not a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn type_id(&self) -> TypeId {
        (*self.inner).type_id()
    }

    /// Identity comparison: true if both handles share one allocation.
    pub fn ptr_eq(&self, other: &StateValue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// View the value as a [`StateMap`], if that is what it holds.
    pub fn as_map(&self) -> Option<&StateMap> {
        self.downcast_ref::<StateMap>()
    }

    /// Live handles to this allocation, states and payloads included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateValue")
            .field("type_id", &(*self.inner).type_id())
            .finish()
    }
}

impl From<StateMap> for StateValue {
    fn from(map: StateMap) -> Self {
        StateValue::new(map)
    }
}

/// Identity comparison over optional snapshots. Two empty states are the same.
pub fn same_state(a: Option<&StateValue>, b: Option<&StateValue>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.ptr_eq(b),
        _ => false,
    }
}

/// Keyed state container that per-key reducers combine into.
///
/// Values are `StateValue`s, so cloning the map for copy-on-write only bumps
/// reference counts. Ordered by key for deterministic iteration.
#[derive(Clone, Debug, Default)]
pub struct StateMap {
    entries: BTreeMap<String, StateValue>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.entries.get(key)
    }

    /// Typed lookup: the value at `key` downcast to `T`.
    pub fn get_as<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: StateValue) -> Option<StateValue> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.entries.remove(key)
    }

    /// Builder form of [`insert`](Self::insert): a copy of `self` with `key` set.
    pub fn with(&self, key: impl Into<String>, value: StateValue) -> StateMap {
        let mut next = self.clone();
        next.insert(key, value);
        next
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, StateValue)> for StateMap {
    fn from_iter<I: IntoIterator<Item = (K, StateValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Returned by `Store::subscribe`; pass it to `Store::unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_and_downcast_correct_type() {
        let v = StateValue::new(42u32);
        assert_eq!(v.downcast_ref::<u32>(), Some(&42u32));
        assert_eq!(v.downcast_ref::<i32>(), None);
    }

    #[test]
    fn is_and_type_id() {
        let v = StateValue::new(42u32);
        assert!(v.is::<u32>());
        assert!(!v.is::<String>());
        assert_eq!(v.type_id(), TypeId::of::<u32>());
    }

    // ========================================================================
    // Identity
    // ========================================================================

    #[test]
    fn clone_is_same_identity() {
        let v1 = StateValue::new(vec![0u8; 1024]);
        let v2 = v1.clone();
        assert!(v1.ptr_eq(&v2));
        assert_eq!(v1.ref_count(), 2);
    }

    #[test]
    fn equal_contents_are_different_identity() {
        let a = StateValue::new(1u32);
        let b = StateValue::new(1u32);
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn same_state_handles_empty() {
        let a = StateValue::new(1u32);
        assert!(same_state(None, None));
        assert!(same_state(Some(&a), Some(&a.clone())));
        assert!(!same_state(Some(&a), None));
        assert!(!same_state(None, Some(&a)));
    }

    // ========================================================================
    // StateMap
    // ========================================================================

    #[test]
    fn map_insert_and_typed_get() {
        let mut map = StateMap::new();
        map.insert("count", StateValue::new(2i64));
        assert_eq!(map.get_as::<i64>("count"), Some(&2));
        assert_eq!(map.get_as::<u32>("count"), None);
        assert!(map.get("other").is_none());
    }

    #[test]
    fn map_with_leaves_original_untouched() {
        let base: StateMap = [("a", StateValue::new(1u32))].into_iter().collect();
        let next = base.with("b", StateValue::new(2u32));
        assert_eq!(base.len(), 1);
        assert_eq!(next.len(), 2);
        // Untouched entries are shared, not copied.
        assert!(base.get("a").unwrap().ptr_eq(next.get("a").unwrap()));
    }

    #[test]
    fn map_keys_are_ordered() {
        let map: StateMap = [
            ("c", StateValue::new(3u32)),
            ("a", StateValue::new(1u32)),
            ("b", StateValue::new(2u32)),
        ]
        .into_iter()
        .collect();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn value_as_map() {
        let v: StateValue = StateMap::new().with("x", StateValue::new(1u8)).into();
        assert_eq!(v.as_map().unwrap().len(), 1);
        assert!(StateValue::new(1u8).as_map().is_none());
    }

    #[test]
    fn subscription_id_equality() {
        assert_eq!(SubscriptionId(1), SubscriptionId(1));
        assert_ne!(SubscriptionId(1), SubscriptionId(2));
    }

    // Compile-time: StateValue must be Send + Sync.
    fn _assert_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<StateValue>();
        assert_sync::<StateValue>();
        assert_send::<StateMap>();
        assert_sync::<StateMap>();
    }
}
