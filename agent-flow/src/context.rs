use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{GraphError, Result};

/// Typed key/value store shared by the tasks of a single session.
///
/// Values are stored as JSON so any serde type can move between tasks. A context
/// belongs to exactly one session; cloning it shares the same underlying map.
#[derive(Clone, Debug, Default)]
pub struct Context {
    data: Arc<DashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| {
            GraphError::ContextError(format!("failed to serialize value for '{}': {}", key, e))
        })?;
        self.data.insert(key, value);
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_sync(key)
    }

    pub fn get_sync<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Like [`Context::get`], but a missing or mistyped value is an error.
    pub async fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .data
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| GraphError::ContextError(format!("{} not found in context", key)))?;

        serde_json::from_value(value).map_err(|e| {
            GraphError::ContextError(format!("{} has an unexpected shape: {}", key, e))
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}
