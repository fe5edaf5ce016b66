//! States, inputs and the transitions between them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DefinitionError;

/// A named condition of a subject.
///
/// Compared and hashed by its identifier; serializes as the bare identifier
/// so a persisted slot round-trips exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(String);

impl State {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for State {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for State {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What fires a transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// A named input, resolved against the definition's inputs.
    Input(String),
    /// The owning operation's timer elapsed.
    Timeout,
}

/// An edge declared by an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub trigger: Trigger,
}

impl Transition {
    pub fn on_input(from: impl Into<State>, to: impl Into<State>, input: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            trigger: Trigger::Input(input.into()),
        }
    }

    pub fn on_timeout(from: impl Into<State>, to: impl Into<State>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            trigger: Trigger::Timeout,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trigger {
            Trigger::Input(input) => write!(f, "{} -[{}]-> {}", self.from, input, self.to),
            Trigger::Timeout => write!(f, "{} -[timeout]-> {}", self.from, self.to),
        }
    }
}

/// Handle to an input within one definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputId(pub(crate) usize);

impl InputId {
    /// Declaration position of the input.
    pub fn index(self) -> usize {
        self.0
    }
}

/// An external stimulus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub name: String,

    /// Whether a handled dispatch reports the event as consumed.
    #[serde(default = "default_consume")]
    pub consume: bool,
}

fn default_consume() -> bool {
    true
}

impl Input {
    pub fn new(name: impl Into<String>, consume: bool) -> Self {
        Self {
            name: name.into(),
            consume,
        }
    }
}

/// The inputs of one definition, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct InputSet {
    inputs: Vec<Input>,
    by_name: HashMap<String, InputId>,
}

impl InputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list, rejecting duplicate names.
    pub fn from_inputs(inputs: impl IntoIterator<Item = Input>) -> Result<Self, DefinitionError> {
        let mut set = Self::new();
        for input in inputs {
            set.add(input)?;
        }
        Ok(set)
    }

    /// Append an input, rejecting a name already taken.
    pub fn add(&mut self, input: Input) -> Result<InputId, DefinitionError> {
        if self.by_name.contains_key(&input.name) {
            return Err(DefinitionError::DuplicateInput(input.name));
        }
        let id = InputId(self.inputs.len());
        self.by_name.insert(input.name.clone(), id);
        self.inputs.push(input);
        Ok(id)
    }

    /// Resolve an input by name.
    pub fn id(&self, name: &str) -> Option<InputId> {
        self.by_name.get(name).copied()
    }

    /// Get an input by id.
    pub fn get(&self, id: InputId) -> Option<&Input> {
        self.inputs.get(id.0)
    }

    /// Get an input's name, for logs.
    pub fn name(&self, id: InputId) -> &str {
        self.get(id).map_or("<unknown>", |input| input.name.as_str())
    }

    /// Number of declared inputs.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Check if no input is declared.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Iterate in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (InputId, &Input)> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(index, input)| (InputId(index), input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_equality_by_value() {
        assert_eq!(State::new("idle"), State::from("idle"));
        assert_ne!(State::new("idle"), State::new("charging"));
    }

    #[test]
    fn test_state_serializes_as_identifier() {
        let state = State::new("charging");
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, "\"charging\"");

        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_transition_display() {
        let t = Transition::on_input("idle", "charging", "start");
        assert_eq!(t.to_string(), "idle -[start]-> charging");

        let t = Transition::on_timeout("charging", "idle");
        assert_eq!(t.to_string(), "charging -[timeout]-> idle");
    }

    #[test]
    fn test_input_set_lookup() {
        let inputs = InputSet::from_inputs([
            Input::new("start", true),
            Input::new("peek", false),
        ])
        .unwrap();

        assert_eq!(inputs.len(), 2);
        let peek = inputs.id("peek").unwrap();
        assert_eq!(peek.index(), 1);
        assert!(!inputs.get(peek).unwrap().consume);
        assert_eq!(inputs.name(peek), "peek");
        assert!(inputs.id("missing").is_none());

        let names: Vec<(usize, &str)> = inputs
            .iter()
            .map(|(id, input)| (id.index(), input.name.as_str()))
            .collect();
        assert_eq!(names, vec![(0, "start"), (1, "peek")]);
    }

    #[test]
    fn test_input_set_rejects_duplicates() {
        let result = InputSet::from_inputs([Input::new("start", true), Input::new("start", false)]);
        assert_eq!(
            result.unwrap_err(),
            DefinitionError::DuplicateInput("start".to_string())
        );
    }

    #[test]
    fn test_input_consume_defaults_to_true() {
        let input: Input = serde_json::from_str(r#"{"name":"fire"}"#).unwrap();
        assert!(input.consume);
    }
}
