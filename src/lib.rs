//! Behavior State Library
//!
//! Per-object behavior for a networked, tick-driven simulation.
//!
//! # Overview
//!
//! Each governed object (a *subject*) carries a named state. Inputs trigger
//! transitions resolved against a per-object-type transition table built
//! from a declarative definition.
//!
//! - **Transition Table** - Built once per object type from the transitions
//!   each operation declares. Input edges dispatch to an operation; timeout
//!   edges mark the states in which an operation's timer is live.
//!
//! - **Dispatcher** - Runs the verify/perform lifecycle, persists the next
//!   state and arms or cancels the player's timer.
//!
//! - **Timers** - Cooperative, one slot per player, fired from the host's
//!   tick loop. Stale timers are ignored.
//!
//! - **State Sync** - Subjects keep an authoritative and a predicted copy.
//!   The predicted side holds its prediction for a grace delay before
//!   snapping to the authoritative copy.
//!
//! # Design Principles
//!
//! 1. **Nothing is fatal** - A misbehaving operation degrades to "not
//!    handled"; it never stops the machine or affects other subjects.
//!
//! 2. **Time is passed in** - Every call takes the host's tick timestamp.
//!
//! 3. **No networking** - Replication moves authoritative copies between
//!    stores; how the bytes travel is up to the host.
//!
//! # Example
//!
//! ```rust
//! use behavior_state::behavior::{
//!     BehaviorDefinition, BehaviorHost, OperationRegistry, PlayerId, Side, State, SyncConfig,
//! };
//!
//! let definition = BehaviorDefinition::from_json(r#"{
//!     "object_type": "blaster",
//!     "initial_state": "idle",
//!     "inputs": [{ "name": "start" }],
//!     "operations": [{
//!         "kind": "set_state",
//!         "name": "charge",
//!         "config": {
//!             "from": "idle", "to": "charging", "input": "start",
//!             "timeout": { "to": "idle", "after_ms": 500 }
//!         }
//!     }]
//! }"#).unwrap();
//!
//! let mut server = BehaviorHost::new(Side::Authoritative, SyncConfig::default());
//! server.load(&definition, &OperationRegistry::with_builtins()).unwrap();
//!
//! let blaster = server.spawn("blaster").unwrap();
//! assert!(server.process(blaster, Some(PlayerId(1)), "start", 0));
//! assert_eq!(server.state(blaster, 0), Some(State::new("charging")));
//!
//! // The charge times out on the tick loop.
//! server.tick(500);
//! assert_eq!(server.state(blaster, 500), Some(State::new("idle")));
//! ```

pub mod behavior;

// Re-export everything from behavior module at crate root
pub use behavior::*;
