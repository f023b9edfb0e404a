//! Etcd-backed node store
//!
//! Node records live under `/anvil/nodes/` as JSON values. Reservation
//! acquire/steal/release and guarded saves are etcd transactions compared
//! against the record's mod revision, which gives the conditional-update
//! semantics the reservation protocol needs across independent conductor
//! processes. Conductor liveness is a leased key under `/anvil/conductors/`
//! kept alive by a background task; lease expiry is how a dead conductor
//! becomes stealable.

use super::{NodeStore, StoreError};
use crate::config::ConductorConfig;
use anvil_core::{HistoryEntry, Node};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use chrono::{DateTime, Utc};
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, SortOrder, SortTarget, Txn, TxnOp,
};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

const NODES_PREFIX: &str = "/anvil/nodes/";
const NAMES_PREFIX: &str = "/anvil/names/";
const HISTORY_PREFIX: &str = "/anvil/history/";
const CONDUCTORS_PREFIX: &str = "/anvil/conductors/";

/// Bounded CAS retry for contended records; contention beyond this means
/// something is fighting over a node it should not hold.
const CAS_ATTEMPTS: u32 = 5;

fn backend(err: etcd_client::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn node_key(id: Uuid) -> String {
    format!("{NODES_PREFIX}{id}")
}

fn name_key(name: &str) -> String {
    format!("{NAMES_PREFIX}{name}")
}

fn conductor_key(id: &str) -> String {
    format!("{CONDUCTORS_PREFIX}{id}")
}

fn history_key(entry: &HistoryEntry) -> String {
    // Zero-padded creation timestamp keeps lexicographic key order equal to
    // creation order within a node.
    let nanos = entry.created_at.timestamp_nanos_opt().unwrap_or(0);
    format!(
        "{HISTORY_PREFIX}{}/{nanos:020}-{}",
        entry.node_id, entry.uuid
    )
}

pub struct EtcdStore {
    client: Arc<RwLock<Client>>,
    lease_ttl: i64,
    keepalive_interval: std::time::Duration,
    lease: Mutex<Option<i64>>,
}

impl EtcdStore {
    /// Connect with exponential backoff.
    pub async fn connect(config: &ConductorConfig) -> Result<Self, StoreError> {
        let backoff = ExponentialBackoff {
            initial_interval: config.etcd_backoff_initial,
            max_interval: config.etcd_backoff_max,
            max_elapsed_time: Some(config.etcd_backoff_max_elapsed),
            multiplier: config.etcd_backoff_multiplier,
            ..Default::default()
        };

        let endpoints = config.etcd_endpoints.clone();
        let client = retry(backoff, || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => {
                    debug!("connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| StoreError::Backend(format!("failed to connect to etcd: {e}")))?;

        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            lease_ttl: config.lease_ttl,
            keepalive_interval: config.heartbeat_interval,
            lease: Mutex::new(None),
        })
    }

    /// Read a node record together with its mod revision.
    async fn get_with_revision(&self, id: Uuid) -> Result<(Node, i64), StoreError> {
        let mut client = self.client.write().await;
        let resp = client.get(node_key(id), None).await.map_err(backend)?;
        let kv = resp.kvs().first().ok_or(StoreError::NodeNotFound(id))?;
        let node: Node =
            serde_json::from_slice(kv.value()).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok((node, kv.mod_revision()))
    }

    /// Put `node` iff its record is still at `revision`.
    async fn put_if_unchanged(&self, node: &Node, revision: i64) -> Result<bool, StoreError> {
        let key = node_key(node.uuid);
        let value = serde_json::to_vec(node).map_err(|e| StoreError::Backend(e.to_string()))?;
        let txn = Txn::new()
            .when([Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                revision,
            )])
            .and_then([TxnOp::put(key, value, None)]);
        let mut client = self.client.write().await;
        let resp = client.txn(txn).await.map_err(backend)?;
        Ok(resp.succeeded())
    }

    /// Run `mutate` on the current record under a revision-compare loop.
    /// `mutate` either produces the updated record or an error that ends the
    /// operation (reservation conflicts surface here).
    async fn update_with_cas<F>(&self, id: Uuid, mut mutate: F) -> Result<Node, StoreError>
    where
        F: FnMut(&mut Node) -> Result<(), StoreError>,
    {
        for attempt in 1..=CAS_ATTEMPTS {
            let (mut node, revision) = self.get_with_revision(id).await?;
            mutate(&mut node)?;
            node.updated_at = Utc::now();
            if self.put_if_unchanged(&node, revision).await? {
                return Ok(node);
            }
            trace!(node_id = %id, attempt, "node record changed underneath, re-reading");
        }
        Err(StoreError::Backend(format!(
            "gave up after {CAS_ATTEMPTS} contended updates on node {id}"
        )))
    }
}

#[async_trait]
impl NodeStore for EtcdStore {
    async fn create_node(&self, node: Node) -> Result<(), StoreError> {
        let key = node_key(node.uuid);
        let value =
            serde_json::to_vec(&node).map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut compares = vec![Compare::create_revision(key.clone(), CompareOp::Equal, 0)];
        let mut puts = vec![TxnOp::put(key, value, None)];
        if let Some(name) = &node.name {
            // The name index key reserves the name atomically with creation.
            compares.push(Compare::create_revision(
                name_key(name),
                CompareOp::Equal,
                0,
            ));
            puts.push(TxnOp::put(name_key(name), node.uuid.to_string(), None));
        }

        let txn = Txn::new().when(compares).and_then(puts);
        let mut client = self.client.write().await;
        let resp = client.txn(txn).await.map_err(backend)?;
        if !resp.succeeded() {
            if let Some(name) = node.name {
                return Err(StoreError::DuplicateName(name));
            }
            return Err(StoreError::Backend(format!(
                "node {} already exists",
                node.uuid
            )));
        }
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> Result<Node, StoreError> {
        Ok(self.get_with_revision(id).await?.0)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Node>, StoreError> {
        let id = {
            let mut client = self.client.write().await;
            let resp = client.get(name_key(name), None).await.map_err(backend)?;
            match resp.kvs().first() {
                Some(kv) => kv
                    .value_str()
                    .map_err(backend)?
                    .parse::<Uuid>()
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
                None => return Ok(None),
            }
        };
        Ok(Some(self.get_node(id).await?))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let mut client = self.client.write().await;
        let resp = client
            .get(NODES_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend)?;
        let mut nodes = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<Node>(kv.value()) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(kv.key()),
                    error = %e,
                    "skipping undecodable node record"
                ),
            }
        }
        Ok(nodes)
    }

    async fn delete_node(&self, id: Uuid) -> Result<(), StoreError> {
        let (node, revision) = self.get_with_revision(id).await?;
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

        let key = node_key(id);
        let mut deletes = vec![TxnOp::delete(key.clone(), None)];
        if let Some(name) = &node.name {
            deletes.push(TxnOp::delete(name_key(name), None));
        }
        let txn = Txn::new()
            .when([Compare::mod_revision(key, CompareOp::Equal, revision)])
            .and_then(deletes);
        let mut client = self.client.write().await;
        let resp = client.txn(txn).await.map_err(backend)?;
        if !resp.succeeded() {
            return Err(StoreError::NodeBusy {
                node: id,
                reason: "record changed during delete".to_string(),
            });
        }
        Ok(())
    }

    async fn try_reserve(&self, id: Uuid, conductor: &str) -> Result<Node, StoreError> {
        self.update_with_cas(id, |node| match &node.reservation {
            None => {
                node.reservation = Some(conductor.to_string());
                Ok(())
            }
            Some(holder) if holder == conductor => Ok(()),
            Some(holder) => Err(StoreError::ReservationHeld {
                node: id,
                holder: holder.clone(),
            }),
        })
        .await
    }

    async fn steal_reservation(
        &self,
        id: Uuid,
        from: &str,
        to: &str,
    ) -> Result<Node, StoreError> {
        self.update_with_cas(id, |node| match &node.reservation {
            Some(holder) if holder == from => {
                node.reservation = Some(to.to_string());
                Ok(())
            }
            Some(holder) => Err(StoreError::ReservationHeld {
                node: id,
                holder: holder.clone(),
            }),
            None => Err(StoreError::NotHolder {
                node: id,
                conductor: from.to_string(),
            }),
        })
        .await
    }

    async fn release(&self, id: Uuid, conductor: &str) -> Result<(), StoreError> {
        self.update_with_cas(id, |node| match &node.reservation {
            Some(holder) if holder == conductor => {
                node.reservation = None;
                Ok(())
            }
            _ => Err(StoreError::NotHolder {
                node: id,
                conductor: conductor.to_string(),
            }),
        })
        .await
        .map(|_| ())
    }

    async fn save_guarded(&self, node: &Node, conductor: &str) -> Result<(), StoreError> {
        let (stored, revision) = self.get_with_revision(node.uuid).await?;
        if stored.reservation.as_deref() != Some(conductor) {
            return Err(StoreError::NotHolder {
                node: node.uuid,
                conductor: conductor.to_string(),
            });
        }
        let mut updated = node.clone();
        updated.reservation = stored.reservation;
        updated.updated_at = Utc::now();
        if !self.put_if_unchanged(&updated, revision).await? {
            // The record moved under us; the only legitimate concurrent
            // writer is a takeover, so treat it as loss of the reservation.
            return Err(StoreError::NotHolder {
                node: node.uuid,
                conductor: conductor.to_string(),
            });
        }
        Ok(())
    }

    async fn register_conductor(&self, id: &str) -> Result<(), StoreError> {
        let mut client = self.client.write().await;
        let lease = client
            .lease_grant(self.lease_ttl, None)
            .await
            .map_err(backend)?;
        let lease_id = lease.id();

        client
            .put(
                conductor_key(id),
                Utc::now().to_rfc3339(),
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(backend)?;
        *self.lease.lock().await = Some(lease_id);

        debug!(conductor = id, lease_id, "registered conductor in etcd");

        // Keep-alive task: lease expiry is the fleet-visible death signal.
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(backend)?;
        let interval = self.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    error!(lease_id, error = %e, "lease keep-alive send failed");
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) => {
                        trace!(lease_id, ttl = resp.ttl(), "lease keep-alive ok");
                    }
                    Ok(None) => {
                        error!(lease_id, "lease keep-alive stream closed");
                        break;
                    }
                    Err(e) => {
                        error!(lease_id, error = %e, "lease keep-alive failed");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn heartbeat(&self, id: &str) -> Result<(), StoreError> {
        // Lease renewal is owned by the keep-alive task started at
        // registration; re-establishing a keeper stream here would race it.
        // Only confirm registration happened.
        if self.lease.lock().await.is_none() {
            return Err(StoreError::Backend(format!(
                "conductor {id} is not registered"
            )));
        }
        Ok(())
    }

    async fn conductor_alive(&self, id: &str) -> Result<bool, StoreError> {
        let mut client = self.client.write().await;
        let resp = client
            .get(conductor_key(id), None)
            .await
            .map_err(backend)?;
        Ok(!resp.kvs().is_empty())
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<(), StoreError> {
        let value =
            serde_json::to_vec(&entry).map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut client = self.client.write().await;
        client
            .put(history_key(&entry), value, None)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_history(
        &self,
        node_id: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let prefix = format!("{HISTORY_PREFIX}{node_id}/");
        let mut client = self.client.write().await;
        let resp = client
            .get(
                prefix,
                Some(
                    GetOptions::new()
                        .with_prefix()
                        .with_sort(SortTarget::Key, SortOrder::Ascend),
                ),
            )
            .await
            .map_err(backend)?;

        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<HistoryEntry>(kv.value()) {
                Ok(entry) => {
                    if since.is_none_or(|lower| entry.created_at >= lower)
                        && until.is_none_or(|upper| entry.created_at < upper)
                    {
                        entries.push(entry);
                    }
                }
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(kv.key()),
                    error = %e,
                    "skipping undecodable history entry"
                ),
            }
        }
        Ok(entries)
    }
}
