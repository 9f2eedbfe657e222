use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::cursor::{CursorStore, StoreError};

/// Ephemeral cursor store for tests and throwaway runs. Progress dies with
/// the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, u64>>,
    prefix: String,
}

impl MemoryStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { data: RwLock::new(HashMap::new()), prefix: prefix.into() }
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load(&self, task_key: &str) -> Result<u64, StoreError> {
        let data = self.data.read().expect("cursor map lock poisoned");
        Ok(data.get(&format!("{}{task_key}", self.prefix)).copied().unwrap_or(0))
    }

    async fn save(&self, task_key: &str, height: u64) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("cursor map lock poisoned");
        data.insert(format!("{}{task_key}", self.prefix), height);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
