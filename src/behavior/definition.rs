//! Declarative behavior definitions and the operation registry.
//!
//! A definition names its object type, initial state, inputs and the
//! operations to instantiate. Operations are looked up by kind in an
//! explicit registry of constructors; there is no runtime type discovery.
//!
//! ```json
//! {
//!   "object_type": "blaster",
//!   "initial_state": "idle",
//!   "inputs": [{ "name": "start" }, { "name": "peek", "consume": false }],
//!   "operations": [
//!     {
//!       "kind": "set_state",
//!       "name": "charge",
//!       "config": {
//!         "from": "idle",
//!         "to": "charging",
//!         "input": "start",
//!         "timeout": { "to": "idle", "after_ms": 500 }
//!       }
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{DefinitionError, OperationError};
use super::machine::BehaviorMachine;
use super::operation::{Bindings, Operation, OperationContext, OperationResult, Outcome};
use super::state::{Input, InputSet, State, Transition};
use super::store::StateSync;

/// One operation entry of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Registry key.
    pub kind: String,

    /// Display name; defaults to the kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub config: serde_json::Value,
}

impl OperationSpec {
    pub fn new(kind: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            config,
        }
    }

    /// Set the display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Get the name used in logs, falling back to the kind.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }

    /// Decode the config into an operation-specific type.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, DefinitionError> {
        serde_json::from_value(self.config.clone()).map_err(|err| DefinitionError::InvalidConfig {
            operation: self.display_name().to_string(),
            reason: err.to_string(),
        })
    }
}

/// Behavior definition for one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorDefinition {
    pub object_type: String,
    pub initial_state: State,

    #[serde(default)]
    pub inputs: Vec<Input>,

    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

impl BehaviorDefinition {
    /// Parse a definition document.
    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Instantiate the operations and build a machine.
    ///
    /// Operations whose kind is unknown or whose constructor fails are
    /// logged and skipped.
    pub fn build(
        &self,
        registry: &OperationRegistry,
        sync: StateSync,
    ) -> Result<BehaviorMachine, DefinitionError> {
        let inputs = InputSet::from_inputs(self.inputs.iter().cloned())?;

        let mut operations = Vec::with_capacity(self.operations.len());
        for spec in &self.operations {
            match registry.create(spec) {
                Ok(operation) => operations.push(operation),
                Err(error) => warn!(
                    object_type = %self.object_type,
                    operation = spec.display_name(),
                    %error,
                    "skipping operation"
                ),
            }
        }

        BehaviorMachine::new(
            self.object_type.clone(),
            self.initial_state.clone(),
            inputs,
            operations,
            sync,
        )
    }
}

pub type OperationFactory =
    Box<dyn Fn(&OperationSpec) -> Result<Box<dyn Operation>, DefinitionError>>;

/// Maps operation kinds to constructors.
#[derive(Default)]
pub struct OperationRegistry {
    factories: HashMap<String, OperationFactory>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `set_state` kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SetState::KIND, |spec| {
            SetState::from_spec(spec).map(|op| Box::new(op) as Box<dyn Operation>)
        });
        registry
    }

    /// Register `factory` under `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&OperationSpec) -> Result<Box<dyn Operation>, DefinitionError> + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    /// Build the operation `spec` describes.
    pub fn create(&self, spec: &OperationSpec) -> Result<Box<dyn Operation>, DefinitionError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| DefinitionError::UnknownOperation(spec.kind.clone()))?;
        factory(spec)
    }

    /// Check if a constructor is registered for `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct SetStateConfig {
    from: State,
    to: State,
    input: String,
    #[serde(default)]
    timeout: Option<TimeoutConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct TimeoutConfig {
    to: State,
    after_ms: u64,
}

/// Moves `from -> to` on an input, optionally falling through to another
/// state once a delay elapses.
#[derive(Debug)]
pub struct SetState {
    name: String,
    config: SetStateConfig,
}

impl SetState {
    pub const KIND: &'static str = "set_state";

    /// Decode and validate a `set_state` entry.
    pub fn from_spec(spec: &OperationSpec) -> Result<Self, DefinitionError> {
        let config: SetStateConfig = spec.config()?;
        if let Some(timeout) = &config.timeout {
            if timeout.after_ms == 0 {
                return Err(DefinitionError::InvalidConfig {
                    operation: spec.display_name().to_string(),
                    reason: "timeout.after_ms must be positive".to_string(),
                });
            }
        }
        Ok(Self {
            name: spec.display_name().to_string(),
            config,
        })
    }
}

impl Operation for SetState {
    fn name(&self) -> &str {
        &self.name
    }

    fn transitions(&self) -> Result<Vec<Transition>, DefinitionError> {
        let c = &self.config;
        let mut transitions = vec![Transition::on_input(
            c.from.clone(),
            c.to.clone(),
            c.input.clone(),
        )];
        if let Some(timeout) = &c.timeout {
            transitions.push(Transition::on_timeout(c.to.clone(), timeout.to.clone()));
        }
        Ok(transitions)
    }

    fn bind(&mut self, bindings: &Bindings<'_>) -> Result<(), DefinitionError> {
        let c = &self.config;
        bindings.input(&c.input)?;
        bindings.state(c.from.as_str())?;
        bindings.state(c.to.as_str())?;
        if let Some(timeout) = &c.timeout {
            bindings.state(timeout.to.as_str())?;
        }
        Ok(())
    }

    fn verify(&mut self, ctx: &OperationContext<'_>) -> Result<Outcome, OperationError> {
        if ctx.from_timer {
            return Ok(Outcome::None);
        }
        Ok(match self.config.timeout {
            Some(_) => Outcome::Started,
            None => Outcome::StartedAndFinished,
        })
    }

    fn perform(&mut self, ctx: &OperationContext<'_>) -> Result<OperationResult, OperationError> {
        let c = &self.config;
        match (&c.timeout, ctx.from_timer) {
            (Some(timeout), true) => Ok(OperationResult::to(timeout.to.clone())
                .with_outcome(Outcome::Finished)
                .cancel_timeout()),
            (Some(timeout), false) => Ok(OperationResult::to(c.to.clone())
                .with_outcome(Outcome::Started)
                .start_timeout(Duration::from_millis(timeout.after_ms))),
            (None, true) => Err(OperationError::new("timer fired without a timeout")),
            (None, false) => Ok(OperationResult::to(c.to.clone()).with_outcome(Outcome::Finished)),
        }
    }
}
