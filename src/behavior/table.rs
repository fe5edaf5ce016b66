//! Transition table construction.
//!
//! Built once per object type from the transitions every operation declares.
//! Every state mentioned by any transition gets an entry in the dispatch map,
//! so lookups never have to distinguish "unknown state" from "no edges".

use std::collections::{HashMap, HashSet};

use tracing::warn;

use super::error::DefinitionError;
use super::operation::{Operation, OperationId};
use super::state::{InputId, InputSet, State, Transition, Trigger};

/// An operation left out of the table, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excluded {
    pub operation: OperationId,
    pub name: String,
    pub error: DefinitionError,
}

/// A `(state, input)` pair registered by more than one operation.
///
/// The later registration wins; the conflict is kept so tests and tools can
/// surface it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub state: State,
    pub input: InputId,
    pub replaced: OperationId,
    pub by: OperationId,
}

#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    dispatch: HashMap<State, HashMap<InputId, OperationId>>,
    timeout_states: HashMap<OperationId, HashSet<State>>,
    excluded: Vec<Excluded>,
    conflicts: Vec<Conflict>,
}

impl TransitionTable {
    /// Build the table for `object_type`.
    ///
    /// An operation whose transitions cannot be listed or resolved is logged
    /// and excluded as a whole; the rest of the table is still built.
    pub fn build(object_type: &str, operations: &[Box<dyn Operation>], inputs: &InputSet) -> Self {
        let mut table = Self::default();

        for (index, operation) in operations.iter().enumerate() {
            let id = OperationId(index);
            let resolved = operation
                .transitions()
                .and_then(|transitions| resolve(&transitions, inputs));

            match resolved {
                Ok(edges) => table.register(object_type, id, edges),
                Err(error) => {
                    warn!(
                        object_type,
                        operation = operation.name(),
                        %error,
                        "excluding operation from transition table"
                    );
                    table.excluded.push(Excluded {
                        operation: id,
                        name: operation.name().to_string(),
                        error,
                    });
                }
            }
        }

        table
    }

    fn register(&mut self, object_type: &str, operation: OperationId, edges: Vec<Edge>) {
        for edge in edges {
            self.ensure_state(edge.from.clone());
            self.ensure_state(edge.to);

            match edge.input {
                None => {
                    self.timeout_states
                        .entry(operation)
                        .or_default()
                        .insert(edge.from);
                }
                Some(input) => {
                    let row = self.dispatch.entry(edge.from.clone()).or_default();
                    if let Some(replaced) = row.insert(input, operation) {
                        if replaced != operation {
                            warn!(
                                object_type,
                                state = %edge.from,
                                input = input.index(),
                                %replaced,
                                by = %operation,
                                "duplicate transition registration, later one wins"
                            );
                            self.conflicts.push(Conflict {
                                state: edge.from,
                                input,
                                replaced,
                                by: operation,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Drop every edge `operation` registered and record why.
    pub fn exclude(&mut self, operation: OperationId, name: &str, error: DefinitionError) {
        for row in self.dispatch.values_mut() {
            row.retain(|_, op| *op != operation);
        }
        self.timeout_states.remove(&operation);
        self.excluded.push(Excluded {
            operation,
            name: name.to_string(),
            error,
        });
    }

    /// Make sure `state` has a (possibly empty) dispatch entry.
    pub fn ensure_state(&mut self, state: State) {
        self.dispatch.entry(state).or_default();
    }

    /// Check if `state` is part of the table.
    pub fn contains(&self, state: &State) -> bool {
        self.dispatch.contains_key(state)
    }

    /// The operation bound to `input` in `state`, if any.
    pub fn lookup(&self, state: &State, input: InputId) -> Option<OperationId> {
        self.dispatch.get(state)?.get(&input).copied()
    }

    /// Inputs with a registered operation in `state`, in declaration order.
    pub fn inputs_for(&self, state: &State) -> Vec<InputId> {
        let mut inputs: Vec<InputId> = self
            .dispatch
            .get(state)
            .map(|row| row.keys().copied().collect())
            .unwrap_or_default();
        inputs.sort();
        inputs
    }

    /// Whether `operation`'s timer is armed while in `state`.
    pub fn arms_timeout(&self, operation: OperationId, state: &State) -> bool {
        self.timeout_states
            .get(&operation)
            .is_some_and(|states| states.contains(state))
    }

    /// Every state in the table, in no particular order.
    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.dispatch.keys()
    }

    /// Operations left out, in the order they were excluded.
    pub fn excluded(&self) -> &[Excluded] {
        &self.excluded
    }

    /// Check if `operation` was left out.
    pub fn is_excluded(&self, operation: OperationId) -> bool {
        self.excluded.iter().any(|e| e.operation == operation)
    }

    /// Duplicate `(state, input)` registrations seen while building.
    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }
}

/// A transition with its input resolved; `None` marks a timeout edge.
struct Edge {
    from: State,
    to: State,
    input: Option<InputId>,
}

fn resolve(transitions: &[Transition], inputs: &InputSet) -> Result<Vec<Edge>, DefinitionError> {
    transitions
        .iter()
        .map(|t| {
            let input = match &t.trigger {
                Trigger::Timeout => None,
                Trigger::Input(name) => Some(
                    inputs
                        .id(name)
                        .ok_or_else(|| DefinitionError::UnknownInput(name.clone()))?,
                ),
            };
            Ok(Edge {
                from: t.from.clone(),
                to: t.to.clone(),
                input,
            })
        })
        .collect()
}
