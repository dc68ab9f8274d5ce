use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, MutexGuard},
};

/// Keyed state capability used by the throttle and the session registry.
///
/// Implementations must be cheap to call and never block on I/O; values are
/// cloned out (typically `Copy` records or `Arc` handles).
pub trait StateStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn set(&self, key: K, value: V);
    fn delete(&self, key: &K) -> Option<V>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-lifetime in-memory store.
#[derive(Debug)]
pub struct MemoryStore<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> MemoryStore<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<K, V>> {
        // A panic while holding the guard cannot leave a HashMap half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K, V> StateStore<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        self.map().get(key).cloned()
    }

    fn set(&self, key: K, value: V) {
        self.map().insert(key, value);
    }

    fn delete(&self, key: &K) -> Option<V> {
        self.map().remove(key)
    }

    fn len(&self) -> usize {
        self.map().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_delete() {
        let s: MemoryStore<String, u32> = MemoryStore::new();
        assert!(s.is_empty());
        s.set("a".to_string(), 1);
        assert_eq!(s.get(&"a".to_string()), Some(1));
        s.set("a".to_string(), 2);
        assert_eq!(s.len(), 1);
        assert_eq!(s.delete(&"a".to_string()), Some(2));
        assert_eq!(s.get(&"a".to_string()), None);
    }
}
