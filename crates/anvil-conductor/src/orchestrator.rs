//! Node orchestration engine
//!
//! Drives one node at a time through the power/provisioning state machine:
//! acquire the reservation, validate the requested target, run the resolved
//! capability under the backend's retry budget, then settle state and append
//! the audit record. Every store write is guarded on the reservation still
//! being held, so a takeover mid-operation aborts the operation instead of
//! corrupting the record. One node's unreachable hardware never takes the
//! process down.

use crate::config::ConductorConfig;
use crate::executor::{self, ExecutorError};
use crate::observability::{events, metrics};
use crate::registry::DriverRegistry;
use crate::reservation::ReservationManager;
use crate::store::{NodeStore, StoreError};
use anvil_core::{
    AnvilError, EventType, Fault, HistoryEntry, InterfaceKind, Node, PowerState, ProvisionState,
    ProvisionVerb, Severity, TransitionTable,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// What one resync call did with its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Hardware was queried and the record reconciled or confirmed.
    Synced,
    /// Maintenance node or operation in flight; hardware untouched.
    Skipped,
}

pub struct NodeOrchestrator {
    store: Arc<dyn NodeStore>,
    registry: Arc<DriverRegistry>,
    reservations: ReservationManager,
    transitions: TransitionTable,
    config: Arc<ConductorConfig>,
}

impl NodeOrchestrator {
    pub fn new(
        store: Arc<dyn NodeStore>,
        registry: Arc<DriverRegistry>,
        config: Arc<ConductorConfig>,
    ) -> Self {
        let reservations =
            ReservationManager::new(Arc::clone(&store), config.conductor_id.clone());
        Self {
            store,
            registry,
            reservations,
            transitions: TransitionTable::default(),
            config,
        }
    }

    /// Replace the default transition table with deployment-specific data.
    pub fn with_transitions(mut self, transitions: TransitionTable) -> Self {
        self.transitions = transitions;
        self
    }

    pub fn conductor_id(&self) -> &str {
        self.reservations.conductor_id()
    }

    /// Enroll a new node.
    pub async fn enroll(&self, node: Node) -> Result<Uuid, AnvilError> {
        let id = node.uuid;
        self.store.create_node(node).await?;
        Ok(id)
    }

    /// Decommission a node. Refused while reserved or mid-operation.
    pub async fn decommission(&self, node_id: Uuid) -> Result<(), AnvilError> {
        self.store.delete_node(node_id).await.map_err(AnvilError::from)
    }

    pub async fn node(&self, node_id: Uuid) -> Result<Node, AnvilError> {
        self.store.get_node(node_id).await.map_err(AnvilError::from)
    }

    pub async fn history(
        &self,
        node_id: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryEntry>, AnvilError> {
        self.store
            .list_history(node_id, since, until)
            .await
            .map_err(AnvilError::from)
    }

    /// Drive `node_id` to power state `target` on behalf of `user`.
    pub async fn change_power_state(
        &self,
        node_id: Uuid,
        target: PowerState,
        user: Option<String>,
    ) -> Result<(), AnvilError> {
        let node = self.reservations.acquire(node_id).await?;
        let result = self.run_power_op(node, target, user).await;
        self.release_quietly(node_id).await;
        result
    }

    /// Drive `node_id` to provisioning state `target` on behalf of `user`.
    pub async fn change_provision_state(
        &self,
        node_id: Uuid,
        target: ProvisionState,
        user: Option<String>,
    ) -> Result<(), AnvilError> {
        let node = self.reservations.acquire(node_id).await?;
        let result = self.run_provision_op(node, target, user).await;
        self.release_quietly(node_id).await;
        result
    }

    /// Reconcile one node's recorded power state with what the hardware
    /// reports. Automated: maintenance nodes and nodes mid-operation are
    /// skipped without touching hardware, and report [`SyncOutcome::Skipped`]
    /// so sweeps do not count them as reconciled.
    pub async fn sync_power_state(&self, node_id: Uuid) -> Result<SyncOutcome, AnvilError> {
        let preview = self.store.get_node(node_id).await?;
        if preview.maintenance {
            debug!(node_id = %node_id, "skipping resync of maintenance node");
            return Ok(SyncOutcome::Skipped);
        }
        if preview.operation_in_flight() {
            debug!(node_id = %node_id, "skipping resync, operation in flight");
            return Ok(SyncOutcome::Skipped);
        }

        let node = self.reservations.acquire(node_id).await?;
        let result = self.run_power_sync(node).await;
        self.release_quietly(node_id).await;
        result
    }

    /// One periodic sweep over this conductor's group. Per-node failures
    /// are logged and never abort the sweep. Returns the number of nodes
    /// reconciled.
    pub async fn resync_sweep(&self) -> usize {
        let nodes = match self.store.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "resync sweep could not list nodes");
                return 0;
            }
        };

        let mut by_state: HashMap<ProvisionState, usize> = HashMap::new();
        let mut synced = 0;
        for node in nodes {
            if node.conductor_group != self.config.conductor_group {
                continue;
            }
            *by_state.entry(node.provision_state).or_default() += 1;
            if node.maintenance {
                continue;
            }
            match self.sync_power_state(node.uuid).await {
                Ok(SyncOutcome::Synced) => synced += 1,
                Ok(SyncOutcome::Skipped) => {}
                Err(e) if e.is_reservation_conflict() => {
                    debug!(node_id = %node.uuid, error = %e, "resync skipped, node busy");
                }
                Err(e) => {
                    warn!(node_id = %node.uuid, error = %e, "resync failed");
                }
            }
        }

        for (state, count) in by_state {
            metrics::set_nodes_by_provision_state(&state.to_string(), count);
        }
        synced
    }

    async fn run_power_op(
        &self,
        mut node: Node,
        target: PowerState,
        user: Option<String>,
    ) -> Result<(), AnvilError> {
        let node_id = node.uuid;

        if !target.is_valid_target() {
            return Err(AnvilError::InvalidPowerTarget {
                node: node_id,
                target,
            });
        }
        if node.disable_power_off && target == PowerState::Off {
            return Err(AnvilError::PowerOffDisabled { node: node_id });
        }
        // Idempotent resync: nothing to do, no hardware touched.
        if node.power_state == target {
            return Ok(());
        }

        let policy = self.config.retry_policy_for(&node.driver);
        if policy.max_attempts == 0 {
            return Err(AnvilError::Configuration(format!(
                "retry budget for driver {} allows no attempts",
                node.driver
            )));
        }

        let power = self
            .registry
            .resolve_for_node(InterfaceKind::Power, &node)?
            .as_power()
            .ok_or_else(|| {
                AnvilError::Configuration("power namespace resolved to a non-power implementation".to_string())
            })?;

        node.target_power_state = Some(target);
        self.save_guarded(&node).await?;

        let snapshot = node.clone();
        let outcome = executor::execute(policy, move |_attempt| {
            let power = Arc::clone(&power);
            let node = snapshot.clone();
            async move {
                match target {
                    PowerState::Rebooting => power.reboot(&node).await,
                    other => power.set_power_state(&node, other).await,
                }
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                let previous = node.power_state;
                node.power_state = target.settled();
                node.target_power_state = None;
                node.last_error = None;
                node.clear_fault_if(Fault::PowerFailure);
                node.conductor_affinity = Some(self.conductor_id().to_string());
                self.save_guarded(&node).await?;

                events::power_state_changed(node_id, previous, node.power_state);
                metrics::record_power_action("success");
                self.append_audit(
                    HistoryEntry::new(
                        node_id,
                        self.conductor_id(),
                        EventType::Power,
                        Severity::Info,
                        format!("power state changed from {previous} to {}", node.power_state),
                    )
                    .with_user(user),
                )
                .await;
                Ok(())
            }
            Err(exec_err) => {
                // The operation did not happen: current state is untouched,
                // the outstanding target is withdrawn, the fault recorded.
                node.target_power_state = None;
                node.record_fault(Fault::PowerFailure, exec_err.to_string());
                self.save_guarded(&node).await?;

                events::node_faulted(node_id, Fault::PowerFailure, &exec_err.to_string());
                metrics::record_power_action("failure");
                self.append_audit(
                    HistoryEntry::new(
                        node_id,
                        self.conductor_id(),
                        EventType::Power,
                        Severity::Error,
                        format!("power {target} failed: {exec_err}"),
                    )
                    .with_user(user),
                )
                .await;
                Err(self.map_exec_error(node_id, "power", exec_err))
            }
        }
    }

    async fn run_provision_op(
        &self,
        mut node: Node,
        target: ProvisionState,
        user: Option<String>,
    ) -> Result<(), AnvilError> {
        let node_id = node.uuid;

        // Idempotent resync.
        if node.provision_state == target {
            return Ok(());
        }

        let verb = self
            .transitions
            .verb_for(node.provision_state, target)
            .ok_or(AnvilError::InvalidTransition {
                node: node_id,
                from: node.provision_state,
                to: target,
            })?;

        let policy = self.config.retry_policy_for(&node.driver);
        if policy.max_attempts == 0 {
            return Err(AnvilError::Configuration(format!(
                "retry budget for driver {} allows no attempts",
                node.driver
            )));
        }

        let implementation = self
            .registry
            .resolve_for_node(verb.interface_kind(), &node)?;

        node.target_provision_state = Some(target);
        self.save_guarded(&node).await?;

        let snapshot = node.clone();
        let outcome = executor::execute(policy, move |_attempt| {
            let implementation = implementation.clone();
            let node = snapshot.clone();
            async move { run_provision_verb(verb, &implementation, &node).await }
        })
        .await;

        match outcome {
            Ok(observed_power) => {
                let previous = node.provision_state;
                node.provision_state = target;
                node.target_provision_state = None;
                node.last_error = None;
                node.clear_fault_if(verb.fault());
                node.conductor_affinity = Some(self.conductor_id().to_string());
                if let Some(power_state) = observed_power {
                    node.power_state = power_state;
                }
                self.save_guarded(&node).await?;

                events::provision_state_changed(node_id, previous, target);
                metrics::record_provision_action(&verb.to_string(), "success");
                self.append_audit(
                    HistoryEntry::new(
                        node_id,
                        self.conductor_id(),
                        EventType::Provisioning,
                        Severity::Info,
                        format!("provision state changed from {previous} to {target} ({verb})"),
                    )
                    .with_user(user),
                )
                .await;
                Ok(())
            }
            Err(exec_err) => {
                node.target_provision_state = None;
                node.record_fault(verb.fault(), exec_err.to_string());
                self.save_guarded(&node).await?;

                events::node_faulted(node_id, verb.fault(), &exec_err.to_string());
                metrics::record_provision_action(&verb.to_string(), "failure");
                self.append_audit(
                    HistoryEntry::new(
                        node_id,
                        self.conductor_id(),
                        EventType::Provisioning,
                        Severity::Error,
                        format!("{verb} towards {target} failed: {exec_err}"),
                    )
                    .with_user(user),
                )
                .await;
                Err(self.map_exec_error(node_id, &verb.to_string(), exec_err))
            }
        }
    }

    async fn run_power_sync(&self, mut node: Node) -> Result<SyncOutcome, AnvilError> {
        let node_id = node.uuid;

        // Re-check under the reservation: the preview read was unlocked.
        if node.maintenance || node.operation_in_flight() {
            return Ok(SyncOutcome::Skipped);
        }

        let power = self
            .registry
            .resolve_for_node(InterfaceKind::Power, &node)?
            .as_power()
            .ok_or_else(|| {
                AnvilError::Configuration("power namespace resolved to a non-power implementation".to_string())
            })?;

        let policy = self.config.retry_policy_for(&node.driver);
        let snapshot = node.clone();
        let observed = executor::execute(policy, move |_attempt| {
            let power = Arc::clone(&power);
            let node = snapshot.clone();
            async move { power.get_power_state(&node).await }
        })
        .await;

        match observed {
            Ok(actual) if actual == node.power_state => Ok(SyncOutcome::Synced),
            Ok(actual) => {
                let previous = node.power_state;
                node.power_state = actual;
                self.save_guarded(&node).await?;
                events::power_state_changed(node_id, previous, actual);
                self.append_audit(HistoryEntry::new(
                    node_id,
                    self.conductor_id(),
                    EventType::Power,
                    Severity::Warning,
                    format!("power state resynced from {previous} to {actual}"),
                ))
                .await;
                Ok(SyncOutcome::Synced)
            }
            Err(exec_err) => {
                // An unobservable node is marked unknown; no fault, since no
                // action was requested.
                if node.power_state != PowerState::Unknown {
                    node.power_state = PowerState::Unknown;
                    node.last_error = Some(exec_err.to_string());
                    self.save_guarded(&node).await?;
                }
                Err(self.map_exec_error(node_id, "power sync", exec_err))
            }
        }
    }

    /// Guarded write of the node record; failing the guard means the
    /// reservation was revoked mid-operation.
    async fn save_guarded(&self, node: &Node) -> Result<(), AnvilError> {
        match self.store.save_guarded(node, self.conductor_id()).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotHolder { .. }) => Err(AnvilError::LostReservation {
                node: node.uuid,
            }),
            Err(other) => Err(other.into()),
        }
    }

    /// Append an audit record. A failure here never rolls back the node
    /// state that was already applied; it is surfaced on its own channel.
    async fn append_audit(&self, entry: HistoryEntry) {
        let node_id = entry.node_id;
        if let Err(e) = self.store.append_history(entry).await {
            events::audit_write_failed(node_id, &e.to_string());
            metrics::record_audit_write_failure();
        }
    }

    async fn release_quietly(&self, node_id: Uuid) {
        match self.reservations.release(node_id).await {
            Ok(()) => {}
            Err(AnvilError::NotHolder { .. }) => {
                // Reservation was taken over mid-operation; nothing to release.
                debug!(node_id = %node_id, "reservation already gone at release");
            }
            Err(e) => warn!(node_id = %node_id, error = %e, "failed to release reservation"),
        }
    }

    fn map_exec_error(&self, node_id: Uuid, action: &str, err: ExecutorError) -> AnvilError {
        match err {
            ExecutorError::InvalidBudget => AnvilError::Configuration(
                "retry budget must allow at least one attempt".to_string(),
            ),
            ExecutorError::Fatal { source, .. } => AnvilError::Hardware(source),
            ExecutorError::Exhausted { attempts, last } => {
                events::retries_exhausted(node_id, action, attempts, &last.to_string());
                metrics::record_retries_exhausted();
                AnvilError::RetriesExhausted { attempts, last }
            }
        }
    }
}

/// Dispatch one provisioning verb to the resolved implementation.
///
/// `Manage` doubles as a connectivity probe and reports the power state it
/// observed so the caller can fold it into the record.
async fn run_provision_verb(
    verb: ProvisionVerb,
    implementation: &anvil_core::InterfaceImpl,
    node: &Node,
) -> Result<Option<PowerState>, anvil_core::HardwareError> {
    use anvil_core::HardwareError;

    match verb {
        ProvisionVerb::Manage => {
            let power = implementation.as_power().ok_or_else(|| {
                HardwareError::Fatal("manage verb resolved to a non-power implementation".into())
            })?;
            power.get_power_state(node).await.map(Some)
        }
        ProvisionVerb::Provide | ProvisionVerb::Clean => {
            let deploy = implementation.as_deploy().ok_or_else(|| {
                HardwareError::Fatal("verb resolved to a non-deploy implementation".into())
            })?;
            deploy.prepare(node).await.map(|()| None)
        }
        ProvisionVerb::Deploy => {
            let deploy = implementation.as_deploy().ok_or_else(|| {
                HardwareError::Fatal("verb resolved to a non-deploy implementation".into())
            })?;
            deploy.deploy(node).await.map(|()| None)
        }
        ProvisionVerb::TearDown => {
            let deploy = implementation.as_deploy().ok_or_else(|| {
                HardwareError::Fatal("verb resolved to a non-deploy implementation".into())
            })?;
            deploy.tear_down(node).await.map(|()| None)
        }
        ProvisionVerb::Rescue => {
            let rescue = implementation.as_rescue().ok_or_else(|| {
                HardwareError::Fatal("verb resolved to a non-rescue implementation".into())
            })?;
            rescue.rescue(node).await.map(|()| None)
        }
        ProvisionVerb::Unrescue => {
            let rescue = implementation.as_rescue().ok_or_else(|| {
                HardwareError::Fatal("verb resolved to a non-rescue implementation".into())
            })?;
            rescue.unrescue(node).await.map(|()| None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::fake::{FakeHardware, FAKE_DRIVER};
    use crate::store::MemoryStore;
    use anvil_core::interfaces::PowerInterface;
    use anvil_core::{Extension, HardwareError, InterfaceImpl};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Harness {
        store: Arc<MemoryStore>,
        fake: FakeHardware,
        orch: Arc<NodeOrchestrator>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        let mut config = ConductorConfig::default();
        config.conductor_id = "cond-test".to_string();
        let config = Arc::new(config);

        let fake = FakeHardware::new();
        let mut registry = DriverRegistry::new(config.enabled_interfaces.clone());
        fake.install(&mut registry);

        let orch = Arc::new(NodeOrchestrator::new(
            Arc::clone(&store) as Arc<dyn NodeStore>,
            Arc::new(registry),
            config,
        ));
        Harness { store, fake, orch }
    }

    async fn enroll(
        h: &Harness,
        provision_state: ProvisionState,
        power_state: PowerState,
    ) -> Uuid {
        let mut node = Node::new(FAKE_DRIVER);
        node.provision_state = provision_state;
        node.power_state = power_state;
        let id = node.uuid;
        h.store.create_node(node).await.unwrap();
        id
    }

    #[tokio::test]
    async fn power_on_settles_state_and_appends_history() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::Off).await;

        h.orch
            .change_power_state(id, PowerState::On, Some("deployer".to_string()))
            .await
            .unwrap();

        let node = h.store.get_node(id).await.unwrap();
        assert_eq!(node.power_state, PowerState::On);
        assert!(node.target_power_state.is_none());
        assert!(node.reservation.is_none());
        assert_eq!(node.conductor_affinity.as_deref(), Some("cond-test"));
        assert_eq!(h.fake.power.script.calls(), 1);

        let history = h.store.list_history(id, None, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, EventType::Power);
        assert_eq!(history[0].user.as_deref(), Some("deployer"));
    }

    #[tokio::test]
    async fn requesting_the_current_state_touches_no_hardware() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::On).await;

        h.orch
            .change_power_state(id, PowerState::On, None)
            .await
            .unwrap();

        assert_eq!(h.fake.power.script.calls(), 0);
        assert!(h.store.list_history(id, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_leave_current_state_untouched() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::Off).await;
        // The fake driver's budget is 3 attempts.
        h.fake.power.script.fail_retryable(10);

        let err = h
            .orch
            .change_power_state(id, PowerState::On, None)
            .await
            .unwrap_err();
        match err {
            AnvilError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error {other:?}"),
        }

        let node = h.store.get_node(id).await.unwrap();
        assert_eq!(node.power_state, PowerState::Off);
        assert!(node.target_power_state.is_none());
        assert_eq!(node.fault, Some(Fault::PowerFailure));
        assert!(node.last_error.is_some());
        assert_eq!(h.fake.power.script.calls(), 3);
    }

    #[tokio::test]
    async fn fatal_failure_aborts_after_one_attempt() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::Off).await;
        h.fake
            .power
            .script
            .push_failure(HardwareError::Fatal("auth rejected".to_string()));

        let err = h
            .orch
            .change_power_state(id, PowerState::On, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnvilError::Hardware(HardwareError::Fatal(_))));
        assert_eq!(h.fake.power.script.calls(), 1);

        let node = h.store.get_node(id).await.unwrap();
        assert_eq!(node.fault, Some(Fault::PowerFailure));
        assert_eq!(node.power_state, PowerState::Off);
    }

    #[tokio::test]
    async fn deploy_succeeding_on_second_attempt_reaches_active() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::On).await;
        h.fake.deploy.script.fail_retryable(1);

        h.orch
            .change_provision_state(id, ProvisionState::Active, Some("deployer".to_string()))
            .await
            .unwrap();

        let node = h.store.get_node(id).await.unwrap();
        assert_eq!(node.provision_state, ProvisionState::Active);
        assert!(node.target_provision_state.is_none());
        assert_eq!(h.fake.deploy.script.calls(), 2);

        let history = h.store.list_history(id, None, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, EventType::Provisioning);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_before_hardware() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Enroll, PowerState::Off).await;

        let err = h
            .orch
            .change_provision_state(id, ProvisionState::Active, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnvilError::InvalidTransition { .. }));
        assert_eq!(h.fake.deploy.script.calls(), 0);

        let node = h.store.get_node(id).await.unwrap();
        assert_eq!(node.provision_state, ProvisionState::Enroll);
        assert!(node.reservation.is_none());
    }

    #[tokio::test]
    async fn successful_power_action_clears_a_power_fault() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::Off).await;

        h.fake.power.script.fail_retryable(10);
        let _ = h.orch.change_power_state(id, PowerState::On, None).await;
        assert_eq!(
            h.store.get_node(id).await.unwrap().fault,
            Some(Fault::PowerFailure)
        );

        // Drain the script and retry the same kind of action.
        h.fake.power.script.clear();
        h.orch
            .change_power_state(id, PowerState::On, None)
            .await
            .unwrap();
        let node = h.store.get_node(id).await.unwrap();
        assert!(node.fault.is_none());
        assert!(node.last_error.is_none());
    }

    #[tokio::test]
    async fn maintenance_node_is_skipped_by_the_sweep() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::On).await;
        let mut node = h.store.get_node(id).await.unwrap();
        node.maintenance = true;
        node.maintenance_reason = Some("PSU replacement".to_string());
        h.store.try_reserve(id, "cond-test").await.unwrap();
        h.store.save_guarded(&node, "cond-test").await.unwrap();
        h.store.release(id, "cond-test").await.unwrap();

        let synced = h.orch.resync_sweep().await;
        assert_eq!(synced, 0);
        assert_eq!(h.fake.power.script.calls(), 0);
    }

    #[tokio::test]
    async fn in_flight_nodes_are_skipped_and_not_counted_as_synced() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::Off).await;
        let mut node = h.store.get_node(id).await.unwrap();
        node.target_power_state = Some(PowerState::On);
        h.store.try_reserve(id, "cond-test").await.unwrap();
        h.store.save_guarded(&node, "cond-test").await.unwrap();
        h.store.release(id, "cond-test").await.unwrap();

        let outcome = h.orch.sync_power_state(id).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(h.fake.power.script.calls(), 0);

        let synced = h.orch.resync_sweep().await;
        assert_eq!(synced, 0);
        assert_eq!(h.fake.power.script.calls(), 0);
    }

    #[tokio::test]
    async fn sweep_reconciles_drifted_power_state() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Active, PowerState::On).await;
        // Hardware says off while the record says on.
        h.fake.power.set_observed_state(PowerState::Off);

        let synced = h.orch.resync_sweep().await;
        assert_eq!(synced, 1);
        let node = h.store.get_node(id).await.unwrap();
        assert_eq!(node.power_state, PowerState::Off);
        assert!(node.reservation.is_none());
    }

    #[tokio::test]
    async fn operator_request_on_maintenance_node_still_runs() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::Off).await;
        let mut node = h.store.get_node(id).await.unwrap();
        node.maintenance = true;
        h.store.try_reserve(id, "cond-test").await.unwrap();
        h.store.save_guarded(&node, "cond-test").await.unwrap();
        h.store.release(id, "cond-test").await.unwrap();

        h.orch
            .change_power_state(id, PowerState::On, Some("operator".to_string()))
            .await
            .unwrap();
        assert_eq!(h.fake.power.script.calls(), 1);
        assert_eq!(h.store.get_node(id).await.unwrap().power_state, PowerState::On);
    }

    #[tokio::test]
    async fn disable_power_off_rejects_off_but_not_reboot() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Active, PowerState::On).await;
        let mut node = h.store.get_node(id).await.unwrap();
        node.disable_power_off = true;
        h.store.try_reserve(id, "cond-test").await.unwrap();
        h.store.save_guarded(&node, "cond-test").await.unwrap();
        h.store.release(id, "cond-test").await.unwrap();

        let err = h
            .orch
            .change_power_state(id, PowerState::Off, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnvilError::PowerOffDisabled { .. }));
        assert_eq!(h.fake.power.script.calls(), 0);

        h.orch
            .change_power_state(id, PowerState::Rebooting, None)
            .await
            .unwrap();
        assert_eq!(h.store.get_node(id).await.unwrap().power_state, PowerState::On);
    }

    #[tokio::test]
    async fn unknown_is_not_a_valid_power_target() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::Off).await;
        let err = h
            .orch
            .change_power_state(id, PowerState::Unknown, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnvilError::InvalidPowerTarget { .. }));
    }

    #[tokio::test]
    async fn decommission_is_refused_while_reserved() {
        let h = harness();
        let id = enroll(&h, ProvisionState::Available, PowerState::Off).await;
        h.store.try_reserve(id, "cond-other").await.unwrap();

        let err = h.orch.decommission(id).await.unwrap_err();
        assert!(matches!(err, AnvilError::NodeBusy { .. }));

        h.store.release(id, "cond-other").await.unwrap();
        h.orch.decommission(id).await.unwrap();
    }

    // Power interface that parks on a gate so the test can revoke the
    // reservation while the hardware call is in flight.
    struct GatedPower {
        gate_entered: Arc<Notify>,
        gate_release: Arc<Notify>,
    }

    impl Extension for GatedPower {
        fn name(&self) -> &str {
            "gated-power"
        }
    }

    #[async_trait]
    impl PowerInterface for GatedPower {
        async fn get_power_state(&self, _node: &Node) -> Result<PowerState, HardwareError> {
            Ok(PowerState::Off)
        }
        async fn set_power_state(
            &self,
            _node: &Node,
            _target: PowerState,
        ) -> Result<(), HardwareError> {
            self.gate_entered.notify_one();
            self.gate_release.notified().await;
            Ok(())
        }
        async fn reboot(&self, _node: &Node) -> Result<(), HardwareError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn reservation_lost_mid_operation_aborts_without_state_change() {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        let mut config = ConductorConfig::default();
        config.conductor_id = "cond-test".to_string();
        config.enable_interface(InterfaceKind::Power, "gated-power");
        let config = Arc::new(config);

        let gate_entered = Arc::new(Notify::new());
        let gate_release = Arc::new(Notify::new());
        let mut registry = DriverRegistry::new(config.enabled_interfaces.clone());
        registry.register(InterfaceImpl::Power(Arc::new(GatedPower {
            gate_entered: Arc::clone(&gate_entered),
            gate_release: Arc::clone(&gate_release),
        })));
        registry.register_hardware_type(
            crate::registry::HardwareType::new("gated")
                .support(InterfaceKind::Power, "gated-power"),
        );

        let orch = Arc::new(NodeOrchestrator::new(
            Arc::clone(&store) as Arc<dyn NodeStore>,
            Arc::new(registry),
            config,
        ));

        let mut node = Node::new("gated");
        node.provision_state = ProvisionState::Available;
        node.power_state = PowerState::Off;
        let id = node.uuid;
        store.create_node(node).await.unwrap();

        let orch2 = Arc::clone(&orch);
        let op = tokio::spawn(async move {
            orch2.change_power_state(id, PowerState::On, None).await
        });

        // Wait for the hardware call, then take the node over.
        gate_entered.notified().await;
        store
            .steal_reservation(id, "cond-test", "cond-usurper")
            .await
            .unwrap();
        gate_release.notify_one();

        let err = op.await.unwrap().unwrap_err();
        assert!(matches!(err, AnvilError::LostReservation { .. }));

        let node = store.get_node(id).await.unwrap();
        // The aborted operation applied nothing.
        assert_eq!(node.power_state, PowerState::Off);
        assert_eq!(node.reservation.as_deref(), Some("cond-usurper"));
    }

    // Store wrapper whose history appends always fail, for checking that
    // audit failures never roll back a successful hardware action.
    struct BrokenAuditStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl NodeStore for BrokenAuditStore {
        async fn create_node(&self, node: Node) -> Result<(), StoreError> {
            self.inner.create_node(node).await
        }
        async fn get_node(&self, id: Uuid) -> Result<Node, StoreError> {
            self.inner.get_node(id).await
        }
        async fn find_by_name(&self, name: &str) -> Result<Option<Node>, StoreError> {
            self.inner.find_by_name(name).await
        }
        async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
            self.inner.list_nodes().await
        }
        async fn delete_node(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.delete_node(id).await
        }
        async fn try_reserve(&self, id: Uuid, conductor: &str) -> Result<Node, StoreError> {
            self.inner.try_reserve(id, conductor).await
        }
        async fn steal_reservation(
            &self,
            id: Uuid,
            from: &str,
            to: &str,
        ) -> Result<Node, StoreError> {
            self.inner.steal_reservation(id, from, to).await
        }
        async fn release(&self, id: Uuid, conductor: &str) -> Result<(), StoreError> {
            self.inner.release(id, conductor).await
        }
        async fn save_guarded(&self, node: &Node, conductor: &str) -> Result<(), StoreError> {
            self.inner.save_guarded(node, conductor).await
        }
        async fn register_conductor(&self, id: &str) -> Result<(), StoreError> {
            self.inner.register_conductor(id).await
        }
        async fn heartbeat(&self, id: &str) -> Result<(), StoreError> {
            self.inner.heartbeat(id).await
        }
        async fn conductor_alive(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.conductor_alive(id).await
        }
        async fn append_history(&self, _entry: HistoryEntry) -> Result<(), StoreError> {
            Err(StoreError::Backend("audit volume offline".to_string()))
        }
        async fn list_history(
            &self,
            node_id: Uuid,
            since: Option<DateTime<Utc>>,
            until: Option<DateTime<Utc>>,
        ) -> Result<Vec<HistoryEntry>, StoreError> {
            self.inner.list_history(node_id, since, until).await
        }
    }

    #[tokio::test]
    async fn audit_failure_does_not_fail_a_successful_operation() {
        let inner = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        let store = Arc::new(BrokenAuditStore {
            inner: Arc::clone(&inner),
        });
        let mut config = ConductorConfig::default();
        config.conductor_id = "cond-test".to_string();
        let config = Arc::new(config);

        let fake = FakeHardware::new();
        let mut registry = DriverRegistry::new(config.enabled_interfaces.clone());
        fake.install(&mut registry);

        let orch = NodeOrchestrator::new(
            store as Arc<dyn NodeStore>,
            Arc::new(registry),
            config,
        );

        let mut node = Node::new(FAKE_DRIVER);
        node.provision_state = ProvisionState::Available;
        node.power_state = PowerState::Off;
        let id = node.uuid;
        inner.create_node(node).await.unwrap();

        // The hardware action succeeded, so the operation reports success
        // even though its audit entry could not be written.
        orch.change_power_state(id, PowerState::On, None)
            .await
            .unwrap();
        let node = inner.get_node(id).await.unwrap();
        assert_eq!(node.power_state, PowerState::On);
        assert!(inner.list_history(id, None, None).await.unwrap().is_empty());
    }
}
