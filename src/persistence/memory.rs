//! Process-local gateway for tests and `PERSISTENCE_BACKEND=memory`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

use super::{EventQuery, PersistenceError, PersistenceGateway, PersistenceResult};
use crate::models::{BlockedEntry, SecurityEvent};

/// In-memory implementation of [`PersistenceGateway`].
///
/// Enforces the same unique-address rule as the hosted table. Clones share
/// the same underlying data.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    blocked: Arc<RwLock<HashMap<String, BlockedEntry>>>,
    events: Arc<RwLock<Vec<SecurityEvent>>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored block row.
    pub async fn blocked_entries(&self) -> Vec<BlockedEntry> {
        self.blocked.read().await.values().cloned().collect()
    }

    /// Snapshot of the event log in insertion order.
    pub async fn events(&self) -> Vec<SecurityEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn find_blocked(&self, address: &str) -> PersistenceResult<Option<BlockedEntry>> {
        Ok(self.blocked.read().await.get(address).cloned())
    }

    async fn insert_blocked(&self, entry: &BlockedEntry) -> PersistenceResult<()> {
        let mut blocked = self.blocked.write().await;
        if blocked.contains_key(&entry.address) {
            return Err(PersistenceError::Duplicate);
        }
        blocked.insert(entry.address.clone(), entry.clone());
        trace!(address = %entry.address, "Stored block row");
        Ok(())
    }

    async fn delete_blocked(&self, address: &str) -> PersistenceResult<bool> {
        Ok(self.blocked.write().await.remove(address).is_some())
    }

    async fn list_blocked(&self, limit: Option<u32>) -> PersistenceResult<Vec<BlockedEntry>> {
        let mut entries: Vec<BlockedEntry> = self.blocked.read().await.values().cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            entries.truncate(limit as usize);
        }
        Ok(entries)
    }

    async fn insert_event(&self, event: &SecurityEvent) -> PersistenceResult<()> {
        let mut stored = event.clone();
        stored.id.get_or_insert_with(Uuid::new_v4);
        self.events.write().await.push(stored);
        Ok(())
    }

    async fn list_events(&self, query: &EventQuery) -> PersistenceResult<Vec<SecurityEvent>> {
        let mut events: Vec<SecurityEvent> = self
            .events
            .read()
            .await
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            events.truncate(limit as usize);
        }
        Ok(events)
    }

    async fn mark_events_blocked(&self, query: &EventQuery) -> PersistenceResult<u64> {
        let mut events = self.events.write().await;
        let mut touched = 0;
        for event in events.iter_mut().filter(|event| query.matches(event)) {
            event.blocked = true;
            touched += 1;
        }
        Ok(touched)
    }

    async fn ping(&self) -> PersistenceResult<()> {
        Ok(())
    }
}
