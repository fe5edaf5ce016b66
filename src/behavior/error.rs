//! Error types.
//!
//! Nothing in this crate is fatal: definition errors exclude a single
//! operation, dispatch errors degrade to "not handled", store errors leave
//! the persisted state untouched.

use thiserror::Error;

use super::state::State;
use super::store::SubjectId;

/// Configuration errors raised while building a machine from a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// A transition references an input the definition does not declare.
    #[error("unknown input `{0}`")]
    UnknownInput(String),

    /// No constructor is registered for an operation kind.
    #[error("unknown operation kind `{0}`")]
    UnknownOperation(String),

    /// An operation's config could not be interpreted.
    #[error("invalid config for operation `{operation}`: {reason}")]
    InvalidConfig { operation: String, reason: String },

    /// The definition has no usable initial state.
    #[error("initial state must not be empty")]
    EmptyInitialState,

    /// Two inputs share a name.
    #[error("input `{0}` declared twice")]
    DuplicateInput(String),

    /// The definition document itself is malformed.
    #[error("malformed definition: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for DefinitionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Runtime error escaping an operation's verify or perform step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation failed: {0}")]
pub struct OperationError(pub String);

impl OperationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// State store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unknown subject {0}")]
    UnknownSubject(SubjectId),

    /// The store already holds `u32::MAX` subjects.
    #[error("subject store is full")]
    CapacityExceeded,

    /// The subject is governed by a different object type.
    #[error("subject {subject} belongs to `{actual}`, not `{expected}`")]
    WrongObjectType {
        subject: SubjectId,
        expected: String,
        actual: String,
    },

    /// The state is not part of this machine's transition table.
    #[error("state `{0}` is not known to this machine")]
    UnsupportedState(State),
}
