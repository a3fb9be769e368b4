use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::RwLock;

use super::RecordStore;

pub struct MemoryStore<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> RecordStore<V> for MemoryStore<V> {
    fn put(&self, key: &str, value: V) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| anyhow!("memory store lock poisoned"))?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?
            .get(key)
            .cloned())
    }

    fn len(&self) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?
            .len())
    }

    fn put_batch(&self, entries: Vec<(String, V)>) -> Result<()> {
        let mut map = self
            .entries
            .write()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        map.extend(entries);
        Ok(())
    }
}
