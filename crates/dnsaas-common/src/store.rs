//! Record store abstraction
//!
//! Components keep their records behind [`Store`] so a durable backend can
//! replace [`MemoryStore`] without touching the algorithms that use it.

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Id-keyed record store
pub trait Store<V>: Send + Sync {
    /// Insert or replace a record
    fn insert(&self, id: Uuid, value: V);

    /// Get a copy of a record
    fn get(&self, id: &Uuid) -> Option<V>;

    /// Mutate a record in place, returning the updated copy
    fn update(&self, id: &Uuid, f: &mut dyn FnMut(&mut V)) -> Option<V>;

    /// Remove a record
    fn remove(&self, id: &Uuid) -> Option<V>;

    /// All records, in no particular order
    fn values(&self) -> Vec<V>;

    fn contains(&self, id: &Uuid) -> bool {
        self.get(id).is_some()
    }

    fn len(&self) -> usize {
        self.values().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store
pub struct MemoryStore<V> {
    records: RwLock<HashMap<Uuid, V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self { records: RwLock::new(HashMap::new()) }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> Store<V> for MemoryStore<V> {
    fn insert(&self, id: Uuid, value: V) {
        self.records.write().insert(id, value);
    }

    fn get(&self, id: &Uuid) -> Option<V> {
        self.records.read().get(id).cloned()
    }

    fn update(&self, id: &Uuid, f: &mut dyn FnMut(&mut V)) -> Option<V> {
        let mut records = self.records.write();
        let record = records.get_mut(id)?;
        f(record);
        Some(record.clone())
    }

    fn remove(&self, id: &Uuid) -> Option<V> {
        self.records.write().remove(id)
    }

    fn values(&self) -> Vec<V> {
        self.records.read().values().cloned().collect()
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.records.read().contains_key(id)
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}
