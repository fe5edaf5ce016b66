//! The operation contract.
//!
//! An operation is a pluggable unit of behavior. It declares the transitions
//! it drives and offers a two-step lifecycle: `verify` decides whether the
//! attempt may go ahead, `perform` carries it out and says what state comes
//! next and what to do with the player's timer.
//!
//! ```text
//!  input / timer
//!       │
//!       ▼
//!   verify ──Failed──▶ abort (no mutation)
//!       │
//!       │ Started? ──▶ invoker.started() ──veto──▶ abort
//!       ▼
//!   perform ──▶ persist next_state ──▶ timer policy ──▶ invoker.finished()?
//! ```

use std::fmt;
use std::time::Duration;

use super::error::{DefinitionError, OperationError};
use super::state::{InputId, InputSet, State, Transition};
use super::store::SubjectId;
use super::table::TransitionTable;
use super::timer::{PlayerId, Timestamp};

/// Handle to an operation owned by one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) usize);

impl OperationId {
    /// Position of the operation in its machine.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Lifecycle result tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    #[default]
    None,
    Started,
    StartedAndFinished,
    Failed,
    Finished,
}

impl Outcome {
    /// Check if verify refused the attempt.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Outcomes the invoker hook gets a chance to veto.
    pub fn starts(&self) -> bool {
        matches!(self, Self::Started | Self::StartedAndFinished)
    }
}

/// What to do with the player's pending timer after a perform step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Leave any pending timer alone.
    #[default]
    Ignore,
    /// Cancel any pending timer and arm a new one.
    Start,
    /// Cancel any pending timer.
    Cancel,
}

/// Result of a perform step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub next_state: State,
    pub outcome: Outcome,
    pub timeout: TimeoutPolicy,
    pub timeout_delay: Duration,

    /// Another input to dispatch for the same subject and player once this
    /// result has been applied.
    pub follow_up: Option<InputId>,
}

impl OperationResult {
    /// Move to `next_state`, leaving timers alone.
    pub fn to(next_state: impl Into<State>) -> Self {
        Self {
            next_state: next_state.into(),
            outcome: Outcome::None,
            timeout: TimeoutPolicy::Ignore,
            timeout_delay: Duration::ZERO,
            follow_up: None,
        }
    }

    /// Tag the result for the invoker hook.
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Arm the player's timer, replacing any pending one.
    pub fn start_timeout(mut self, delay: Duration) -> Self {
        self.timeout = TimeoutPolicy::Start;
        self.timeout_delay = delay;
        self
    }

    /// Cancel the player's pending timer.
    pub fn cancel_timeout(mut self) -> Self {
        self.timeout = TimeoutPolicy::Cancel;
        self.timeout_delay = Duration::ZERO;
        self
    }

    /// Dispatch `input` once this result has been applied.
    pub fn then_dispatch(mut self, input: InputId) -> Self {
        self.follow_up = Some(input);
        self
    }
}

/// Everything an operation gets to see about one dispatch.
#[derive(Debug, Clone)]
pub struct OperationContext<'a> {
    pub object_type: &'a str,
    pub subject: SubjectId,
    pub player: PlayerId,
    pub state: &'a State,
    pub input: InputId,
    pub now: Timestamp,
    /// True when re-entered from an elapsed timer.
    pub from_timer: bool,
}

/// Resolved inputs and states handed to each operation after table
/// construction.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    pub object_type: &'a str,
    /// The operation being bound; named in bind errors.
    pub operation: &'a str,
    pub inputs: &'a InputSet,
    pub table: &'a TransitionTable,
}

impl<'a> Bindings<'a> {
    /// Resolve an input by name.
    pub fn input(&self, name: &str) -> Result<InputId, DefinitionError> {
        self.inputs
            .id(name)
            .ok_or_else(|| DefinitionError::UnknownInput(name.to_string()))
    }

    /// Resolve a state by name, requiring it to be part of the table.
    pub fn state(&self, name: &str) -> Result<State, DefinitionError> {
        let state = State::new(name);
        if self.table.contains(&state) {
            Ok(state)
        } else {
            Err(DefinitionError::InvalidConfig {
                operation: self.operation.to_string(),
                reason: format!("state `{}` has no transitions in `{}`", name, self.object_type),
            })
        }
    }
}

/// A pluggable unit of behavior.
pub trait Operation: fmt::Debug {
    /// Name used in logs and by invoker hooks.
    fn name(&self) -> &str;

    /// The edges this operation drives.
    fn transitions(&self) -> Result<Vec<Transition>, DefinitionError>;

    /// Called once after the table is built.
    fn bind(&mut self, _bindings: &Bindings<'_>) -> Result<(), DefinitionError> {
        Ok(())
    }

    fn verify(&mut self, ctx: &OperationContext<'_>) -> Result<Outcome, OperationError>;

    fn perform(&mut self, ctx: &OperationContext<'_>) -> Result<OperationResult, OperationError>;

    /// Called when the owning machine is torn down.
    fn dispose(&mut self) {}
}

/// Optional hook observing operation starts and completions, e.g. to keep
/// a player from running two exclusive operations at once.
pub trait Invoker: fmt::Debug {
    /// Returns `true` to veto the start.
    fn started(&mut self, operation: &str, subject: SubjectId, player: PlayerId) -> bool;

    /// Called after a perform step reports `Outcome::Finished`.
    fn finished(&mut self, operation: &str, subject: SubjectId, player: PlayerId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_outcome_classification() {
        assert!(Outcome::Failed.is_failed());
        assert!(!Outcome::Started.is_failed());
        assert!(Outcome::Started.starts());
        assert!(Outcome::StartedAndFinished.starts());
        assert!(!Outcome::None.starts());
        assert!(!Outcome::Finished.starts());
    }

    #[test]
    fn test_result_builder() {
        let result = OperationResult::to("charging")
            .with_outcome(Outcome::Started)
            .start_timeout(Duration::from_millis(500));

        assert_eq!(result.next_state, State::new("charging"));
        assert_eq!(result.outcome, Outcome::Started);
        assert_eq!(result.timeout, TimeoutPolicy::Start);
        assert_eq!(result.timeout_delay, Duration::from_millis(500));
        assert_eq!(result.follow_up, None);

        let result = result.cancel_timeout();
        assert_eq!(result.timeout, TimeoutPolicy::Cancel);
        assert_eq!(result.timeout_delay, Duration::ZERO);
    }
}
