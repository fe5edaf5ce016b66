//! Behavior state machines.
//!
//! - `state` - states, inputs, transitions
//! - `operation` - the pluggable operation contract and invoker hook
//! - `table` - transition table construction
//! - `timer` - one pending timer per player
//! - `store` - subject records and the predicted/authoritative sync protocol
//! - `machine` - the dispatcher
//! - `definition` - declarative definitions and the operation registry
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── BehaviorHost (one per side) ─────────────────────────────┐
//! │                                                                                       │
//! │  ┌──────────────────┐   ┌───────────────── BehaviorMachine (per object type) ───────┐ │
//! │  │   SubjectStore   │   │                                                            │ │
//! │  │                  │◀──│  TransitionTable   state → input → operation               │ │
//! │  │ subject →        │   │                    operation → timeout states              │ │
//! │  │   authoritative  │   │  Operations        verify / perform                        │ │
//! │  │   predicted      │   │  TimerRegistry     player → pending timer                  │ │
//! │  │   diverged_at    │   │  StateSync         side + grace delay                      │ │
//! │  └──────────────────┘   └────────────────────────────────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────────────────────────────┘
//!            ▲                                      │
//!            └──── replication (authoritative) ─────┘
//! ```

pub mod config;
pub mod definition;
pub mod error;
pub mod machine;
pub mod operation;
pub mod state;
pub mod store;
pub mod table;
pub mod timer;

use std::collections::HashMap;

use tracing::info;

pub use config::{SyncConfig, DEFAULT_GRACE_DELAY, GRACE_DELAY_ENV};
pub use definition::{BehaviorDefinition, OperationFactory, OperationRegistry, OperationSpec, SetState};
pub use error::{DefinitionError, OperationError, StoreError};
pub use machine::{BehaviorMachine, MAX_FOLLOW_UP_DEPTH};
pub use operation::{
    Bindings, Invoker, Operation, OperationContext, OperationId, OperationResult, Outcome,
    TimeoutPolicy,
};
pub use state::{Input, InputId, InputSet, State, Transition, Trigger};
pub use store::{Side, StateSync, SubjectId, SubjectRecord, SubjectStore};
pub use table::{Conflict, Excluded, TransitionTable};
pub use timer::{PendingTimer, PlayerId, TimerId, TimerRegistry, Timestamp};

/// Everything one side runs: the subject store and a machine per loaded
/// object type.
#[derive(Debug)]
pub struct BehaviorHost {
    sync: StateSync,
    store: SubjectStore,
    machines: HashMap<String, BehaviorMachine>,
}

impl BehaviorHost {
    pub fn new(side: Side, config: SyncConfig) -> Self {
        Self {
            sync: StateSync::new(side, &config),
            store: SubjectStore::new(),
            machines: HashMap::new(),
        }
    }

    /// Which copy this host owns.
    pub fn side(&self) -> Side {
        self.sync.side()
    }

    /// Get the subject store.
    pub fn store(&self) -> &SubjectStore {
        &self.store
    }

    /// Get the subject store for direct edits.
    pub fn store_mut(&mut self) -> &mut SubjectStore {
        &mut self.store
    }

    /// Load a definition, replacing (and disposing) any machine already
    /// loaded for the same object type.
    pub fn load(
        &mut self,
        definition: &BehaviorDefinition,
        registry: &OperationRegistry,
    ) -> Result<(), DefinitionError> {
        let machine = definition.build(registry, self.sync)?;
        info!(
            object_type = %definition.object_type,
            side = ?self.side(),
            operations = machine.operation_count(),
            "behavior loaded"
        );
        if let Some(mut previous) = self.machines.insert(definition.object_type.clone(), machine) {
            previous.dispose();
        }
        Ok(())
    }

    /// Unload an object type, cancelling its timers and disposing its
    /// operations. Subject records are left alone.
    pub fn unload(&mut self, object_type: &str) -> bool {
        match self.machines.remove(object_type) {
            Some(mut machine) => {
                machine.dispose();
                info!(object_type, "behavior unloaded");
                true
            }
            None => false,
        }
    }

    /// Get the machine loaded for `object_type`.
    pub fn machine(&self, object_type: &str) -> Option<&BehaviorMachine> {
        self.machines.get(object_type)
    }

    /// Get the machine loaded for `object_type` for direct dispatch.
    pub fn machine_mut(&mut self, object_type: &str) -> Option<&mut BehaviorMachine> {
        self.machines.get_mut(object_type)
    }

    /// Spawn a subject governed by `object_type`.
    pub fn spawn(&mut self, object_type: impl Into<String>) -> Result<SubjectId, StoreError> {
        self.store.spawn(object_type)
    }

    /// Dispatch an input by name to the subject's machine.
    pub fn process(
        &mut self,
        subject: SubjectId,
        player: Option<PlayerId>,
        input: &str,
        now: Timestamp,
    ) -> bool {
        let Some(object_type) = self.store.object_type(subject).map(str::to_string) else {
            return false;
        };
        let Some(machine) = self.machines.get_mut(&object_type) else {
            return false;
        };
        match machine.input(input) {
            Some(input) => machine.process(&mut self.store, subject, player, input, now),
            None => false,
        }
    }

    /// Current state of `subject`, if its object type is loaded.
    pub fn state(&mut self, subject: SubjectId, now: Timestamp) -> Option<State> {
        let object_type = self.store.object_type(subject)?.to_string();
        let machine = self.machines.get(&object_type)?;
        machine.read_state(&mut self.store, subject, now).ok()
    }

    /// Names of the inputs applicable to `subject` right now.
    pub fn available_inputs(&mut self, subject: SubjectId, now: Timestamp) -> Vec<String> {
        let Some(object_type) = self.store.object_type(subject).map(str::to_string) else {
            return Vec::new();
        };
        let Some(machine) = self.machines.get(&object_type) else {
            return Vec::new();
        };
        machine
            .available_inputs(&mut self.store, subject, now)
            .into_iter()
            .map(|input| machine.inputs().name(input).to_string())
            .collect()
    }

    /// Fire due timers on every machine.
    pub fn tick(&mut self, now: Timestamp) -> usize {
        self.machines
            .values_mut()
            .map(|machine| machine.tick(&mut self.store, now))
            .sum()
    }

    /// Authoritative copies changed since the last call.
    pub fn drain_replication(&mut self) -> Vec<(SubjectId, State)> {
        self.store.drain_dirty()
    }

    /// Apply replicated authoritative copies.
    pub fn apply_replication(&mut self, updates: &[(SubjectId, State)]) -> Result<(), StoreError> {
        for (subject, state) in updates {
            self.store.apply_replicated(*subject, state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const P1: PlayerId = PlayerId(1);

    fn blaster() -> BehaviorDefinition {
        BehaviorDefinition::from_json(
            r#"{
                "object_type": "blaster",
                "initial_state": "idle",
                "inputs": [{ "name": "start" }, { "name": "stop" }],
                "operations": [
                    {
                        "kind": "set_state",
                        "name": "charge",
                        "config": {
                            "from": "idle", "to": "charging", "input": "start",
                            "timeout": { "to": "idle", "after_ms": 500 }
                        }
                    },
                    {
                        "kind": "set_state",
                        "name": "stop",
                        "config": { "from": "charging", "to": "idle", "input": "stop" }
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    fn host(side: Side) -> (BehaviorHost, SubjectId) {
        let mut host = BehaviorHost::new(side, SyncConfig::default());
        host.load(&blaster(), &OperationRegistry::with_builtins())
            .unwrap();
        let subject = host.spawn("blaster").unwrap();
        (host, subject)
    }

    fn replicate(server: &mut BehaviorHost, client: &mut BehaviorHost) {
        let updates = server.drain_replication();
        client.apply_replication(&updates).unwrap();
    }

    #[test]
    fn test_host_basic() {
        let (mut host, subject) = host(Side::Authoritative);

        assert_eq!(host.state(subject, 0), Some(State::new("idle")));
        assert_eq!(host.available_inputs(subject, 0), vec!["start"]);
        assert!(host.process(subject, Some(P1), "start", 0));
        assert!(!host.process(subject, Some(P1), "start", 0));
        assert!(!host.process(subject, Some(P1), "nonsense", 0));
        assert_eq!(host.available_inputs(subject, 0), vec!["stop"]);

        assert_eq!(host.tick(500), 1);
        assert_eq!(host.state(subject, 500), Some(State::new("idle")));
    }

    #[test]
    fn test_unload_cancels_timers() {
        let (mut host, subject) = host(Side::Authoritative);
        host.process(subject, Some(P1), "start", 0);

        assert!(host.unload("blaster"));
        assert!(!host.unload("blaster"));
        assert!(host.machine("blaster").is_none());
        assert_eq!(host.tick(1_000), 0);
        assert!(!host.process(subject, Some(P1), "stop", 1_000));

        // The record outlives the machine.
        assert_eq!(host.store().get(subject).unwrap().authoritative(), Some("charging"));
    }

    #[test]
    fn test_reload_replaces_machine() {
        let (mut host, subject) = host(Side::Authoritative);
        host.process(subject, Some(P1), "start", 0);

        host.load(&blaster(), &OperationRegistry::with_builtins())
            .unwrap();
        assert!(host.machine("blaster").unwrap().timers().is_empty());
        assert_eq!(host.state(subject, 0), Some(State::new("charging")));
        assert!(host.process(subject, Some(P1), "stop", 10));
    }

    #[test]
    fn test_prediction_confirmed_by_server() {
        let (mut server, subject) = host(Side::Authoritative);
        let (mut client, _) = host(Side::Predicted);

        // Client predicts; the input reaches the server a few ms later.
        assert!(client.process(subject, Some(P1), "start", 1_000));
        assert_eq!(client.state(subject, 1_000), Some(State::new("charging")));
        assert!(server.process(subject, Some(P1), "start", 1_030));
        replicate(&mut server, &mut client);

        for now in [1_040, 1_100, 1_400] {
            assert_eq!(client.state(subject, now), Some(State::new("charging")));
            assert_eq!(client.store().get(subject).unwrap().diverged_at(), None);
        }
    }

    #[test]
    fn test_dropped_prediction_snaps_back() {
        let (mut server, subject) = host(Side::Authoritative);
        let (mut client, _) = host(Side::Predicted);
        server.state(subject, 0);
        replicate(&mut server, &mut client);

        // The server never hears about this input.
        assert!(client.process(subject, Some(P1), "start", 1_000));

        assert_eq!(client.state(subject, 1_010), Some(State::new("charging")));
        assert_eq!(client.state(subject, 1_090), Some(State::new("charging")));
        assert_eq!(client.state(subject, 1_100), Some(State::new("idle")));
        assert_eq!(client.store().get(subject).unwrap().predicted(), Some("idle"));
        assert_eq!(client.available_inputs(subject, 1_100), vec!["start"]);
    }

    #[test]
    fn test_server_timeout_propagates() {
        let (mut server, subject) = host(Side::Authoritative);
        let (mut client, _) = host(Side::Predicted);

        client.process(subject, Some(P1), "start", 0);
        server.process(subject, Some(P1), "start", 0);
        replicate(&mut server, &mut client);

        // Server times out first and goes back to idle.
        assert_eq!(server.tick(500), 1);
        replicate(&mut server, &mut client);

        // Client still shows its prediction for one grace window; its own
        // timer fires in the meantime and converges it anyway.
        assert_eq!(client.state(subject, 501), Some(State::new("charging")));
        assert_eq!(client.tick(502), 1);
        assert_eq!(client.state(subject, 503), Some(State::new("idle")));
        assert_eq!(client.store().get(subject).unwrap().diverged_at(), None);
    }

    #[test]
    fn test_repeated_prediction_still_reconciles() {
        let pulsing = BehaviorDefinition::from_json(
            r#"{
                "object_type": "pump",
                "initial_state": "idle",
                "inputs": [{ "name": "go" }, { "name": "pulse" }],
                "operations": [
                    { "kind": "set_state", "name": "go",
                      "config": { "from": "idle", "to": "busy", "input": "go" } },
                    { "kind": "set_state", "name": "pulse",
                      "config": { "from": "busy", "to": "busy", "input": "pulse" } }
                ]
            }"#,
        )
        .unwrap();
        let registry = OperationRegistry::with_builtins();
        let mut server = BehaviorHost::new(Side::Authoritative, SyncConfig::default());
        let mut client = BehaviorHost::new(Side::Predicted, SyncConfig::default());
        server.load(&pulsing, &registry).unwrap();
        client.load(&pulsing, &registry).unwrap();
        let subject = server.spawn("pump").unwrap();
        client.spawn("pump").unwrap();

        // The server stays idle; it never hears about the client's inputs.
        assert_eq!(server.state(subject, 0), Some(State::new("idle")));
        replicate(&mut server, &mut client);

        assert!(client.process(subject, Some(P1), "go", 0));
        let handled: Vec<bool> = (1..=40)
            .map(|step| client.process(subject, Some(P1), "pulse", step * 50))
            .collect();

        // Pulses keep the prediction alive only until the grace delay runs
        // out; the read at t=150 snaps back to idle.
        assert_eq!(&handled[..2], &[true, true]);
        assert!(handled[2..].iter().all(|handled| !handled));
        assert_eq!(client.state(subject, 2_010), Some(State::new("idle")));
        assert_eq!(client.store().get(subject).unwrap().diverged_at(), None);
    }

    #[test]
    fn test_direct_machine_access() {
        let (mut host, subject) = host(Side::Authoritative);
        let second = host.store_mut().spawn("blaster").unwrap();
        assert_eq!(host.store().len(), 2);
        assert!(host.process(second, Some(P1), "start", 0));

        host.machine_mut("blaster").unwrap().dispose();
        assert!(host.machine("blaster").unwrap().is_disposed());
        assert!(!host.process(subject, Some(P1), "start", 10));
        assert_eq!(host.tick(1_000), 0);
        assert!(host.machine_mut("shovel").is_none());
    }
}
