//! # Key/Value Store
//!
//! Durable store consumed by message persistence. The bundled
//! [`InMemoryKeyValueStore`] survives component restarts within one process,
//! which is what crash-recovery tests rely on, and supports fault injection.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{A2aError, A2aResult};

/// Namespace used when callers do not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Options for [`KeyValueStore::set_value`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOptions {
    pub namespace: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl StoreOptions {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Options for [`KeyValueStore::list_keys`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    /// Glob pattern where `*` matches any run of characters
    pub pattern: Option<String>,
}

/// Durable key/value collaborator
#[async_trait]
pub trait KeyValueStore: Send + Sync + Debug {
    async fn set_value(&self, key: &str, value: Value, options: &StoreOptions) -> A2aResult<()>;

    async fn get_value(&self, key: &str, namespace: Option<&str>) -> A2aResult<Option<Value>>;

    async fn list_keys(&self, options: &ListOptions) -> A2aResult<Vec<String>>;

    async fn delete_value(&self, key: &str, namespace: Option<&str>) -> A2aResult<bool>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    metadata: HashMap<String, String>,
    updated_at: DateTime<Utc>,
}

/// Process-local key/value store
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: DashMap<(String, String), StoredValue>,
    failing: AtomicBool,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a storage error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metadata(&self, key: &str, namespace: Option<&str>) -> Option<HashMap<String, String>> {
        self.entries
            .get(&Self::key(key, namespace))
            .map(|entry| entry.metadata.clone())
    }

    pub fn updated_at(&self, key: &str, namespace: Option<&str>) -> Option<DateTime<Utc>> {
        self.entries
            .get(&Self::key(key, namespace))
            .map(|entry| entry.updated_at)
    }

    fn key(key: &str, namespace: Option<&str>) -> (String, String) {
        (
            namespace.unwrap_or(DEFAULT_NAMESPACE).to_string(),
            key.to_string(),
        )
    }

    fn check_available(&self) -> A2aResult<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(A2aError::StorageError(
                "key/value store unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn set_value(&self, key: &str, value: Value, options: &StoreOptions) -> A2aResult<()> {
        self.check_available()?;
        self.entries.insert(
            Self::key(key, options.namespace.as_deref()),
            StoredValue {
                value,
                metadata: options.metadata.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_value(&self, key: &str, namespace: Option<&str>) -> A2aResult<Option<Value>> {
        self.check_available()?;
        Ok(self
            .entries
            .get(&Self::key(key, namespace))
            .map(|entry| entry.value.clone()))
    }

    async fn list_keys(&self, options: &ListOptions) -> A2aResult<Vec<String>> {
        self.check_available()?;
        let namespace = options.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| entry.key().1.clone())
            .filter(|key| {
                options
                    .pattern
                    .as_deref()
                    .map_or(true, |pattern| glob_matches(pattern, key))
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_value(&self, key: &str, namespace: Option<&str>) -> A2aResult<bool> {
        self.check_available()?;
        Ok(self.entries.remove(&Self::key(key, namespace)).is_some())
    }
}

/// Match `text` against a pattern where `*` matches any (possibly empty) run
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !text.starts_with(first) || text.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &text[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("message:*", "message:abc"));
        assert!(glob_matches("*", ""));
        assert!(glob_matches("a*c*e", "abcde"));
        assert!(!glob_matches("a*c*e", "abcd"));
        assert!(!glob_matches("message:*", "other:abc"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("ab*ba", "aba"));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = InMemoryKeyValueStore::new();
        let options = StoreOptions::namespace("ns1").with_metadata("type", "test");
        store.set_value("message:1", json!(1), &options).await.unwrap();
        store
            .set_value("message:2", json!(2), &StoreOptions::namespace("ns2"))
            .await
            .unwrap();
        store
            .set_value("other", json!(3), &StoreOptions::namespace("ns1"))
            .await
            .unwrap();

        let keys = store
            .list_keys(&ListOptions {
                namespace: Some("ns1".into()),
                pattern: Some("message:*".into()),
            })
            .await
            .unwrap();
        assert_eq!(keys, vec!["message:1"]);
        assert_eq!(store.get_value("message:2", Some("ns1")).await.unwrap(), None);
        assert_eq!(
            store.metadata("message:1", Some("ns1")).unwrap().get("type"),
            Some(&"test".to_string())
        );

        assert!(store.delete_value("message:1", Some("ns1")).await.unwrap());
        assert!(!store.delete_value("message:1", Some("ns1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_store_returns_storage_error() {
        let store = InMemoryKeyValueStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.get_value("k", None).await,
            Err(A2aError::StorageError(_))
        ));
        store.set_failing(false);
        assert_eq!(store.get_value("k", None).await.unwrap(), None);
    }
}
