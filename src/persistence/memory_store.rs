//! In-memory `PersistenceStore`, the coordinator's default adapter.

use super::{PersistenceStore, Query, Record, SortField, SortOrder};
use crate::error::CoordinatorResult;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), Record>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        namespace: &str,
        category: &str,
        tags: Vec<String>,
        ttl: Option<std::time::Duration>,
    ) -> CoordinatorResult<()> {
        let now = Utc::now();
        let size = value.to_string().len();
        self.entries.insert(
            (namespace.to_string(), key.to_string()),
            Record {
                key: key.to_string(),
                namespace: namespace.to_string(),
                category: category.to_string(),
                tags,
                value,
                timestamp: now,
                accessed: now,
                size,
                ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str, namespace: &str) -> CoordinatorResult<Option<serde_json::Value>> {
        let now = Utc::now();
        let entry_key = (namespace.to_string(), key.to_string());
        let result = if let Some(mut entry) = self.entries.get_mut(&entry_key) {
            if entry.is_expired(now) {
                drop(entry);
                self.entries.remove(&entry_key);
                None
            } else {
                entry.accessed = now;
                Some(entry.value.clone())
            }
        } else {
            None
        };
        Ok(result)
    }

    async fn query(&self, query: Query) -> CoordinatorResult<Vec<Record>> {
        let now = Utc::now();
        let mut records: Vec<Record> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .filter(|r| query.namespace.as_deref().map_or(true, |n| n == r.namespace))
            .filter(|r| query.category.as_deref().map_or(true, |c| c == r.category))
            .filter(|r| query.tags.iter().all(|t| r.tags.contains(t)))
            .collect();

        match query.sort {
            Some(SortField::Timestamp) => records.sort_by_key(|r| r.timestamp),
            Some(SortField::Accessed) => records.sort_by_key(|r| r.accessed),
            Some(SortField::Size) => records.sort_by_key(|r| r.size),
            Some(SortField::Name) => records.sort_by(|a, b| a.key.cmp(&b.key)),
            Some(SortField::Priority) | None => {}
        }
        if query.order == Some(SortOrder::Descending) {
            records.reverse();
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn delete(&self, key: &str, namespace: &str) -> CoordinatorResult<bool> {
        Ok(self
            .entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }
}
