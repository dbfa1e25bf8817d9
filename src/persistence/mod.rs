//! Persistence Store contract (spec §6.3) and the checkpoint document
//! layout (spec §6.4).
//!
//! The store itself is out of scope for the CORE; this module defines the
//! trait the orchestrator consumes plus an in-memory default and a
//! rusqlite-backed adapter, grounded in the teacher's
//! `infrastructure/persistence.rs` snapshot/document shape but with the
//! encryption layer dropped (no spec requirement for encrypted checkpoints;
//! see DESIGN.md).

mod memory_store;
mod sqlite_store;

pub use memory_store::MemoryStore;
pub use sqlite_store::SqliteStore;

use crate::error::CoordinatorResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    Timestamp,
    Accessed,
    Size,
    Priority,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub namespace: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
    pub sort: Option<SortField>,
    pub order: Option<SortOrder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub namespace: String,
    pub category: String,
    pub tags: Vec<String>,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
    pub size: usize,
    pub ttl: Option<std::time::Duration>,
}

impl Record {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl).unwrap_or_default();
                now.signed_duration_since(self.timestamp) > ttl
            }
            None => false,
        }
    }
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        namespace: &str,
        category: &str,
        tags: Vec<String>,
        ttl: Option<std::time::Duration>,
    ) -> CoordinatorResult<()>;

    async fn get(&self, key: &str, namespace: &str) -> CoordinatorResult<Option<serde_json::Value>>;

    async fn query(&self, query: Query) -> CoordinatorResult<Vec<Record>>;

    async fn delete(&self, key: &str, namespace: &str) -> CoordinatorResult<bool>;
}

/// The `orchestrator/state` document in namespace `swarm` (spec §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub swarm_id: String,
    pub topology_pattern: String,
    pub agents: Vec<crate::agent::Agent>,
    pub non_terminal_tasks: Vec<crate::task::Task>,
    /// adjacency lists keyed by agent id
    pub topology_graph: BTreeMap<String, Vec<String>>,
    pub metrics: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub const CHECKPOINT_NAMESPACE: &str = "swarm";
pub const CHECKPOINT_KEY: &str = "orchestrator/state";

/// Writes a checkpoint, swallowing any persistence error per spec §7's
/// "checkpoint paths are logged and swallowed" propagation policy.
pub async fn save_checkpoint(store: &dyn PersistenceStore, checkpoint: &Checkpoint) {
    let value = match serde_json::to_value(checkpoint) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize checkpoint");
            return;
        }
    };
    if let Err(e) = store
        .put(
            CHECKPOINT_KEY,
            value,
            CHECKPOINT_NAMESPACE,
            "checkpoint",
            vec![],
            None,
        )
        .await
    {
        tracing::warn!(error = %e, "checkpoint write failed, continuing");
    }
}

/// Reads the checkpoint on startup; any failure falls back to cold start
/// with empty registries, per spec §7.
pub async fn load_checkpoint(store: &dyn PersistenceStore) -> Option<Checkpoint> {
    match store.get(CHECKPOINT_KEY, CHECKPOINT_NAMESPACE).await {
        Ok(Some(value)) => serde_json::from_value(value).ok(),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(error = %e, "checkpoint read failed, starting cold");
            None
        }
    }
}
