//! In-memory node store
//!
//! Same compare-and-set semantics as the etcd backend, held behind one
//! process-local lock. Used by tests and single-conductor runs.

use super::{NodeStore, StoreError};
use anvil_core::{HistoryEntry, Node};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct Inner {
    nodes: HashMap<Uuid, Node>,
    history: HashMap<Uuid, Vec<HistoryEntry>>,
    conductors: HashMap<String, Instant>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// A conductor whose last heartbeat is older than this is dead.
    dead_after: Duration,
}

impl MemoryStore {
    pub fn new(dead_after: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                nodes: HashMap::new(),
                history: HashMap::new(),
                conductors: HashMap::new(),
            }),
            dead_after,
        }
    }

    /// Test hook: age a conductor's heartbeat so takeover paths can run
    /// without waiting out the timeout.
    #[cfg(test)]
    pub fn expire_conductor(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(seen) = inner.conductors.get_mut(id) {
            *seen = Instant::now() - self.dead_after * 2;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(90))
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn create_node(&self, node: Node) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.nodes.contains_key(&node.uuid) {
            return Err(StoreError::Backend(format!(
                "node {} already exists",
                node.uuid
            )));
        }
        if let Some(name) = &node.name {
            if inner
                .nodes
                .values()
                .any(|n| n.name.as_deref() == Some(name.as_str()))
            {
                return Err(StoreError::DuplicateName(name.clone()));
            }
        }
        inner.nodes.insert(node.uuid, node);
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> Result<Node, StoreError> {
        let inner = self.inner.read().unwrap();
        inner
            .nodes
            .get(&id)
            .cloned()
            .ok_or(StoreError::NodeNotFound(id))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Node>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .nodes
            .values()
            .find(|n| n.name.as_deref() == Some(name))
            .cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.nodes.values().cloned().collect())
    }

    async fn delete_node(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let node = inner.nodes.get(&id).ok_or(StoreError::NodeNotFound(id))?;
        if let Some(holder) = &node.reservation {
            return Err(StoreError::NodeBusy {
                node: id,
                reason: format!("reserved by {holder}"),
            });
        }
        if node.operation_in_flight() {
            return Err(StoreError::NodeBusy {
                node: id,
                reason: "operation in flight".to_string(),
            });
        }
        inner.nodes.remove(&id);
        // History intentionally survives the node.
        Ok(())
    }

    async fn try_reserve(&self, id: Uuid, conductor: &str) -> Result<Node, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let node = inner.nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))?;
        match &node.reservation {
            None => {
                node.reservation = Some(conductor.to_string());
                node.updated_at = Utc::now();
                Ok(node.clone())
            }
            Some(holder) if holder == conductor => Ok(node.clone()),
            Some(holder) => Err(StoreError::ReservationHeld {
                node: id,
                holder: holder.clone(),
            }),
        }
    }

    async fn steal_reservation(
        &self,
        id: Uuid,
        from: &str,
        to: &str,
    ) -> Result<Node, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let node = inner.nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))?;
        match &node.reservation {
            Some(holder) if holder == from => {
                node.reservation = Some(to.to_string());
                node.updated_at = Utc::now();
                Ok(node.clone())
            }
            Some(holder) => Err(StoreError::ReservationHeld {
                node: id,
                holder: holder.clone(),
            }),
            None => Err(StoreError::NotHolder {
                node: id,
                conductor: from.to_string(),
            }),
        }
    }

    async fn release(&self, id: Uuid, conductor: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let node = inner.nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))?;
        match &node.reservation {
            Some(holder) if holder == conductor => {
                node.reservation = None;
                node.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::NotHolder {
                node: id,
                conductor: conductor.to_string(),
            }),
        }
    }

    async fn save_guarded(&self, node: &Node, conductor: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let stored = inner
            .nodes
            .get_mut(&node.uuid)
            .ok_or(StoreError::NodeNotFound(node.uuid))?;
        if stored.reservation.as_deref() != Some(conductor) {
            return Err(StoreError::NotHolder {
                node: node.uuid,
                conductor: conductor.to_string(),
            });
        }
        let mut updated = node.clone();
        updated.reservation = stored.reservation.clone();
        updated.updated_at = Utc::now();
        *stored = updated;
        Ok(())
    }

    async fn register_conductor(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        inner.conductors.insert(id.to_string(), Instant::now());
        Ok(())
    }

    async fn heartbeat(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        inner.conductors.insert(id.to_string(), Instant::now());
        Ok(())
    }

    async fn conductor_alive(&self, id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .conductors
            .get(id)
            .is_some_and(|seen| seen.elapsed() < self.dead_after))
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        inner.history.entry(entry.node_id).or_default().push(entry);
        Ok(())
    }

    async fn list_history(
        &self,
        node_id: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let inner = self.inner.read().unwrap();
        let entries = inner
            .history
            .get(&node_id)
            .map(|v| {
                v.iter()
                    .filter(|e| {
                        since.is_none_or(|lower| e.created_at >= lower)
                            && until.is_none_or(|upper| e.created_at < upper)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::{EventType, Severity};

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let store = MemoryStore::default();
        store
            .create_node(Node::new("fake").with_name("r1-u01"))
            .await
            .unwrap();
        let err = store
            .create_node(Node::new("fake").with_name("r1-u01"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn reserve_is_a_compare_and_set() {
        let store = MemoryStore::default();
        let node = Node::new("fake");
        let id = node.uuid;
        store.create_node(node).await.unwrap();

        let reserved = store.try_reserve(id, "cond-a").await.unwrap();
        assert_eq!(reserved.reservation.as_deref(), Some("cond-a"));

        // Re-acquire by the holder is idempotent.
        store.try_reserve(id, "cond-a").await.unwrap();

        let err = store.try_reserve(id, "cond-b").await.unwrap_err();
        assert!(matches!(err, StoreError::ReservationHeld { .. }));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_an_explicit_error() {
        let store = MemoryStore::default();
        let node = Node::new("fake");
        let id = node.uuid;
        store.create_node(node).await.unwrap();

        // Unheld release is NotHolder, never silent success.
        assert!(matches!(
            store.release(id, "cond-a").await.unwrap_err(),
            StoreError::NotHolder { .. }
        ));

        store.try_reserve(id, "cond-a").await.unwrap();
        assert!(matches!(
            store.release(id, "cond-b").await.unwrap_err(),
            StoreError::NotHolder { .. }
        ));
        store.release(id, "cond-a").await.unwrap();
    }

    #[tokio::test]
    async fn steal_requires_the_expected_previous_holder() {
        let store = MemoryStore::default();
        let node = Node::new("fake");
        let id = node.uuid;
        store.create_node(node).await.unwrap();
        store.try_reserve(id, "cond-dead").await.unwrap();

        assert!(store
            .steal_reservation(id, "cond-other", "cond-b")
            .await
            .is_err());
        let stolen = store
            .steal_reservation(id, "cond-dead", "cond-b")
            .await
            .unwrap();
        assert_eq!(stolen.reservation.as_deref(), Some("cond-b"));
    }

    #[tokio::test]
    async fn guarded_save_fails_once_reservation_is_gone() {
        let store = MemoryStore::default();
        let node = Node::new("fake");
        let id = node.uuid;
        store.create_node(node).await.unwrap();

        let mut held = store.try_reserve(id, "cond-a").await.unwrap();
        held.maintenance = true;

        // Simulate takeover by another conductor mid-operation.
        store.steal_reservation(id, "cond-a", "cond-b").await.unwrap();

        let err = store.save_guarded(&held, "cond-a").await.unwrap_err();
        assert!(matches!(err, StoreError::NotHolder { .. }));
        // The aborted write left no trace.
        assert!(!store.get_node(id).await.unwrap().maintenance);
    }

    #[tokio::test]
    async fn delete_refuses_reserved_or_busy_nodes() {
        let store = MemoryStore::default();
        let node = Node::new("fake");
        let id = node.uuid;
        store.create_node(node).await.unwrap();

        store.try_reserve(id, "cond-a").await.unwrap();
        assert!(matches!(
            store.delete_node(id).await.unwrap_err(),
            StoreError::NodeBusy { .. }
        ));

        store.release(id, "cond-a").await.unwrap();
        store.delete_node(id).await.unwrap();
        assert!(matches!(
            store.get_node(id).await.unwrap_err(),
            StoreError::NodeNotFound(_)
        ));
    }

    #[tokio::test]
    async fn history_is_returned_in_creation_order() {
        let store = MemoryStore::default();
        let node_id = Uuid::new_v4();
        for i in 0..5 {
            store
                .append_history(HistoryEntry::new(
                    node_id,
                    "cond-a",
                    EventType::Power,
                    Severity::Info,
                    format!("event {i}"),
                ))
                .await
                .unwrap();
        }
        let events = store.list_history(node_id, None, None).await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, entry) in events.iter().enumerate() {
            assert_eq!(entry.event, format!("event {i}"));
        }
    }

    #[tokio::test]
    async fn history_window_bounds_are_half_open() {
        let store = MemoryStore::default();
        let node_id = Uuid::new_v4();
        let base = Utc::now();
        for i in 0..4 {
            let mut entry = HistoryEntry::new(
                node_id,
                "cond-a",
                EventType::Power,
                Severity::Info,
                format!("event {i}"),
            );
            entry.created_at = base + chrono::Duration::seconds(i);
            store.append_history(entry).await.unwrap();
        }

        let since = base + chrono::Duration::seconds(1);
        let until = base + chrono::Duration::seconds(3);

        let windowed = store
            .list_history(node_id, Some(since), Some(until))
            .await
            .unwrap();
        // [since, until): events 1 and 2; event 3 sits on the upper bound.
        assert_eq!(windowed.len(), 2);
        assert_eq!(windowed[0].event, "event 1");
        assert_eq!(windowed[1].event, "event 2");

        let tail = store
            .list_history(node_id, Some(until), None)
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event, "event 3");
    }

    #[tokio::test]
    async fn conductor_liveness_follows_heartbeats() {
        let store = MemoryStore::default();
        assert!(!store.conductor_alive("cond-a").await.unwrap());
        store.register_conductor("cond-a").await.unwrap();
        assert!(store.conductor_alive("cond-a").await.unwrap());
        store.expire_conductor("cond-a");
        assert!(!store.conductor_alive("cond-a").await.unwrap());
    }
}
