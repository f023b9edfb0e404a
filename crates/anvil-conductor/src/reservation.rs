//! Reservation manager
//!
//! Wraps the store's compare-and-set primitives with the fleet-level
//! policy: a node held by a conductor whose liveness marker has lapsed is
//! stealable. Acquire never queues or blocks; a conflict returns
//! immediately and the caller polls.

use crate::observability::{events, metrics};
use crate::store::{NodeStore, StoreError};
use anvil_core::{AnvilError, Node};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn NodeStore>,
    conductor_id: String,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn NodeStore>, conductor_id: String) -> Self {
        Self {
            store,
            conductor_id,
        }
    }

    pub fn conductor_id(&self) -> &str {
        &self.conductor_id
    }

    /// Acquire the exclusive lock on `node_id` for this conductor.
    ///
    /// On conflict, the holder's liveness is checked once: a dead holder's
    /// reservation is taken over with a second compare-and-set conditioned
    /// on the old holder, so two stealing conductors cannot both win.
    pub async fn acquire(&self, node_id: Uuid) -> Result<Node, AnvilError> {
        match self.store.try_reserve(node_id, &self.conductor_id).await {
            Ok(node) => {
                debug!(node_id = %node_id, conductor = %self.conductor_id, "reservation acquired");
                Ok(node)
            }
            Err(StoreError::ReservationHeld { node, holder }) => {
                if self.store.conductor_alive(&holder).await.map_err(AnvilError::from)? {
                    metrics::record_reservation_conflict();
                    return Err(AnvilError::AlreadyReserved { node, holder });
                }
                let stolen = self
                    .store
                    .steal_reservation(node_id, &holder, &self.conductor_id)
                    .await
                    .map_err(AnvilError::from)?;
                events::reservation_stolen(node_id, &holder, &self.conductor_id);
                metrics::record_reservation_stolen();
                Ok(stolen)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Release the lock. Releasing an unheld or foreign-held node is an
    /// explicit `NotHolder` error.
    pub async fn release(&self, node_id: Uuid) -> Result<(), AnvilError> {
        self.store
            .release(node_id, &self.conductor_id)
            .await
            .map_err(AnvilError::from)
    }

    pub async fn is_held_by(&self, node_id: Uuid, conductor: &str) -> Result<bool, AnvilError> {
        let node = self.store.get_node(node_id).await.map_err(AnvilError::from)?;
        Ok(node.reservation.as_deref() == Some(conductor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    async fn store_with_node() -> (Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        let node = Node::new("fake");
        let id = node.uuid;
        store.create_node(node).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn concurrent_acquires_admit_exactly_one_winner() {
        let (store, id) = store_with_node().await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = ReservationManager::new(
                Arc::clone(&store) as Arc<dyn NodeStore>,
                format!("cond-{i}"),
            );
            // Every contender is alive, so nothing is stealable.
            store.register_conductor(&format!("cond-{i}")).await.unwrap();
            handles.push(tokio::spawn(async move { manager.acquire(id).await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn conflict_with_a_live_holder_is_already_reserved() {
        let (store, id) = store_with_node().await;
        store.register_conductor("cond-a").await.unwrap();

        let a = ReservationManager::new(Arc::clone(&store) as Arc<dyn NodeStore>, "cond-a".into());
        let b = ReservationManager::new(Arc::clone(&store) as Arc<dyn NodeStore>, "cond-b".into());

        a.acquire(id).await.unwrap();
        let err = b.acquire(id).await.unwrap_err();
        assert!(matches!(err, AnvilError::AlreadyReserved { .. }));
        assert!(a.is_held_by(id, "cond-a").await.unwrap());
    }

    #[tokio::test]
    async fn dead_holders_reservation_is_stolen() {
        let (store, id) = store_with_node().await;
        store.register_conductor("cond-dead").await.unwrap();

        let dead =
            ReservationManager::new(Arc::clone(&store) as Arc<dyn NodeStore>, "cond-dead".into());
        dead.acquire(id).await.unwrap();

        store.expire_conductor("cond-dead");

        let b = ReservationManager::new(Arc::clone(&store) as Arc<dyn NodeStore>, "cond-b".into());
        let node = b.acquire(id).await.unwrap();
        assert_eq!(node.reservation.as_deref(), Some("cond-b"));
    }

    #[tokio::test]
    async fn release_maps_not_holder() {
        let (store, id) = store_with_node().await;
        let b = ReservationManager::new(Arc::clone(&store) as Arc<dyn NodeStore>, "cond-b".into());
        assert!(matches!(
            b.release(id).await.unwrap_err(),
            AnvilError::NotHolder { .. }
        ));
    }
}
