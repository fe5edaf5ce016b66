//! The dispatcher.
//!
//! One `BehaviorMachine` exists per object type and per side. It resolves
//! `(current state, input)` to an operation, runs the operation lifecycle,
//! persists the result and keeps each player's timer slot up to date.
//! Everything runs synchronously inside the host's tick.

use tracing::{debug, error, trace, warn};

use super::error::{DefinitionError, StoreError};
use super::operation::{
    Bindings, Invoker, Operation, OperationContext, OperationId, Outcome, TimeoutPolicy,
};
use super::state::{InputId, InputSet, State};
use super::store::{Side, StateSync, SubjectId, SubjectStore};
use super::table::TransitionTable;
use super::timer::{PlayerId, TimerRegistry, Timestamp};

/// Follow-up dispatches chained from a single external input.
pub const MAX_FOLLOW_UP_DEPTH: usize = 8;

#[derive(Debug)]
pub struct BehaviorMachine {
    object_type: String,
    initial_state: State,
    inputs: InputSet,
    operations: Vec<Box<dyn Operation>>,
    table: TransitionTable,
    sync: StateSync,
    timers: TimerRegistry,
    invoker: Option<Box<dyn Invoker>>,
    disposed: bool,
}

impl BehaviorMachine {
    /// Build the transition table and bind every operation.
    ///
    /// Operations that fail to declare, resolve or bind are logged and left
    /// out; the machine still initializes for the rest.
    pub fn new(
        object_type: impl Into<String>,
        initial_state: State,
        inputs: InputSet,
        mut operations: Vec<Box<dyn Operation>>,
        sync: StateSync,
    ) -> Result<Self, DefinitionError> {
        let object_type = object_type.into();
        if initial_state.as_str().is_empty() {
            return Err(DefinitionError::EmptyInitialState);
        }

        let mut table = TransitionTable::build(&object_type, &operations, &inputs);
        table.ensure_state(initial_state.clone());

        let mut unbound = Vec::new();
        for (index, operation) in operations.iter_mut().enumerate() {
            let id = OperationId(index);
            if table.is_excluded(id) {
                continue;
            }
            let name = operation.name().to_string();
            let bindings = Bindings {
                object_type: &object_type,
                operation: &name,
                inputs: &inputs,
                table: &table,
            };
            if let Err(error) = operation.bind(&bindings) {
                warn!(
                    object_type = %object_type,
                    operation = %name,
                    %error,
                    "operation failed to bind, excluding"
                );
                unbound.push((id, name, error));
            }
        }
        for (id, name, error) in unbound {
            table.exclude(id, &name, error);
        }

        debug!(
            object_type = %object_type,
            operations = operations.len(),
            excluded = table.excluded().len(),
            side = ?sync.side(),
            "behavior machine ready"
        );

        Ok(Self {
            object_type,
            initial_state,
            inputs,
            operations,
            table,
            sync,
            timers: TimerRegistry::new(),
            invoker: None,
            disposed: false,
        })
    }

    /// Attach the invoker hook.
    pub fn with_invoker(mut self, invoker: Box<dyn Invoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Get the object type this machine governs.
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    /// Get the state new and reset subjects start in.
    pub fn initial_state(&self) -> &State {
        &self.initial_state
    }

    /// Which copy this machine reads and writes.
    pub fn side(&self) -> Side {
        self.sync.side()
    }

    /// Get the declared inputs.
    pub fn inputs(&self) -> &InputSet {
        &self.inputs
    }

    /// Resolve an input by name.
    pub fn input(&self, name: &str) -> Option<InputId> {
        self.inputs.id(name)
    }

    /// Get the transition table.
    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Get the pending timers.
    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    /// Number of operations, excluded ones included.
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Get an operation's name.
    pub fn operation_name(&self, operation: OperationId) -> Option<&str> {
        self.operations.get(operation.index()).map(|op| op.name())
    }

    /// Find an operation by name.
    pub fn operation(&self, name: &str) -> Option<OperationId> {
        self.operations
            .iter()
            .position(|op| op.name() == name)
            .map(OperationId)
    }

    /// Check if the machine has been torn down.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Dispatch `input` for `subject` on behalf of `player`.
    ///
    /// Returns whether the input was handled and should be reported as
    /// consumed. An input with no edge in the current state is the normal
    /// "not applicable" case and returns `false` without touching anything.
    pub fn process(
        &mut self,
        store: &mut SubjectStore,
        subject: SubjectId,
        player: Option<PlayerId>,
        input: InputId,
        now: Timestamp,
    ) -> bool {
        self.process_at_depth(store, subject, player, input, now, 0)
    }

    fn process_at_depth(
        &mut self,
        store: &mut SubjectStore,
        subject: SubjectId,
        player: Option<PlayerId>,
        input: InputId,
        now: Timestamp,
        depth: usize,
    ) -> bool {
        let Some(player) = self.admit(store, subject, player) else {
            return false;
        };
        let Ok(state) = self.read_state(store, subject, now) else {
            return false;
        };

        if !self.table.contains(&state) {
            warn!(
                object_type = %self.object_type,
                %subject,
                %state,
                initial = %self.initial_state,
                "unknown current state, resetting to initial"
            );
            if let Some(record) = store.get_mut(subject) {
                self.sync.write(record, &self.initial_state);
            }
            return false;
        }

        let Some(operation) = self.table.lookup(&state, input) else {
            trace!(
                object_type = %self.object_type,
                %state,
                input = self.inputs.name(input),
                "input not applicable"
            );
            return false;
        };

        self.run(store, subject, player, state, input, operation, now, false, depth)
    }

    /// Re-enter after `operation`'s timer elapsed.
    ///
    /// A timer armed in a state the subject has since left is stale and
    /// ignored.
    pub fn on_timer(
        &mut self,
        store: &mut SubjectStore,
        subject: SubjectId,
        player: Option<PlayerId>,
        input: InputId,
        operation: OperationId,
        now: Timestamp,
    ) -> bool {
        let Some(player) = self.admit(store, subject, player) else {
            return false;
        };
        let Ok(state) = self.read_state(store, subject, now) else {
            return false;
        };

        if !self.table.arms_timeout(operation, &state) {
            debug!(
                object_type = %self.object_type,
                %subject,
                %player,
                %state,
                %operation,
                "stale timer ignored"
            );
            return false;
        }

        self.run(store, subject, player, state, input, operation, now, true, 0)
    }

    /// Fire every timer due at `now`. Returns how many were handled.
    pub fn tick(&mut self, store: &mut SubjectStore, now: Timestamp) -> usize {
        if self.disposed {
            return 0;
        }
        self.timers
            .take_due(now)
            .into_iter()
            .filter(|(player, timer)| {
                self.on_timer(
                    store,
                    timer.subject,
                    Some(*player),
                    timer.input,
                    timer.operation,
                    now,
                )
            })
            .count()
    }

    /// Inputs with a registered operation in the subject's current state.
    pub fn available_inputs(
        &self,
        store: &mut SubjectStore,
        subject: SubjectId,
        now: Timestamp,
    ) -> Vec<InputId> {
        if self.disposed {
            return Vec::new();
        }
        match self.read_state(store, subject, now) {
            Ok(state) => self.table.inputs_for(&state),
            Err(_) => Vec::new(),
        }
    }

    /// Current state of `subject` as this side sees it.
    pub fn read_state(
        &self,
        store: &mut SubjectStore,
        subject: SubjectId,
        now: Timestamp,
    ) -> Result<State, StoreError> {
        self.check_owner(store, subject)?;
        let record = store
            .get_mut(subject)
            .ok_or(StoreError::UnknownSubject(subject))?;
        Ok(self.sync.read(record, &self.initial_state, now))
    }

    /// Write `state` for `subject`. States outside the table are logged and
    /// ignored.
    pub fn write_state(
        &self,
        store: &mut SubjectStore,
        subject: SubjectId,
        state: &State,
    ) -> Result<(), StoreError> {
        self.check_owner(store, subject)?;
        if !self.table.contains(state) {
            warn!(
                object_type = %self.object_type,
                %subject,
                %state,
                "ignoring write of unsupported state"
            );
            return Err(StoreError::UnsupportedState(state.clone()));
        }
        let record = store
            .get_mut(subject)
            .ok_or(StoreError::UnknownSubject(subject))?;
        self.sync.write(record, state);
        Ok(())
    }

    /// Cancel the player's pending timer, if any.
    pub fn cancel_timer(&mut self, player: PlayerId) -> bool {
        self.timers.cancel(player).is_some()
    }

    /// Cancel every timer and dispose every operation. Safe to call twice.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        let cancelled = self.timers.clear();
        for operation in &mut self.operations {
            operation.dispose();
        }
        self.disposed = true;
        debug!(object_type = %self.object_type, cancelled, "behavior machine disposed");
    }

    fn check_owner(&self, store: &SubjectStore, subject: SubjectId) -> Result<(), StoreError> {
        match store.object_type(subject) {
            None => Err(StoreError::UnknownSubject(subject)),
            Some(actual) if actual != self.object_type => Err(StoreError::WrongObjectType {
                subject,
                expected: self.object_type.clone(),
                actual: actual.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Identity checks shared by `process` and `on_timer`.
    fn admit(
        &self,
        store: &SubjectStore,
        subject: SubjectId,
        player: Option<PlayerId>,
    ) -> Option<PlayerId> {
        if self.disposed {
            return None;
        }
        if let Err(err) = self.check_owner(store, subject) {
            debug!(object_type = %self.object_type, %err, "rejecting dispatch");
            return None;
        }
        player
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        store: &mut SubjectStore,
        subject: SubjectId,
        player: PlayerId,
        state: State,
        input: InputId,
        operation_id: OperationId,
        now: Timestamp,
        from_timer: bool,
        depth: usize,
    ) -> bool {
        let Some(operation) = self.operations.get_mut(operation_id.index()) else {
            return false;
        };
        let ctx = OperationContext {
            object_type: &self.object_type,
            subject,
            player,
            state: &state,
            input,
            now,
            from_timer,
        };

        let outcome = match operation.verify(&ctx) {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(
                    object_type = %self.object_type,
                    operation = operation.name(),
                    input = self.inputs.name(input),
                    %state,
                    %error,
                    "verify raised"
                );
                return false;
            }
        };

        if outcome.is_failed() {
            debug!(
                object_type = %self.object_type,
                operation = operation.name(),
                %subject,
                %player,
                %state,
                "verify failed"
            );
            return false;
        }

        if outcome.starts() {
            if let Some(invoker) = self.invoker.as_mut() {
                if invoker.started(operation.name(), subject, player) {
                    debug!(
                        object_type = %self.object_type,
                        operation = operation.name(),
                        %subject,
                        %player,
                        "start vetoed by invoker"
                    );
                    return false;
                }
            }
        }

        let result = match operation.perform(&ctx) {
            Ok(result) => result,
            Err(error) => {
                error!(
                    object_type = %self.object_type,
                    operation = operation.name(),
                    input = self.inputs.name(input),
                    %state,
                    %error,
                    "perform raised"
                );
                return false;
            }
        };

        if !self.table.contains(&result.next_state) {
            error!(
                object_type = %self.object_type,
                operation = operation.name(),
                input = self.inputs.name(input),
                %state,
                next_state = %result.next_state,
                "operation produced a state outside the table"
            );
            return false;
        }

        let Some(record) = store.get_mut(subject) else {
            return false;
        };
        self.sync.write(record, &result.next_state);

        match result.timeout {
            TimeoutPolicy::Ignore => {}
            TimeoutPolicy::Cancel => {
                self.timers.cancel(player);
            }
            TimeoutPolicy::Start => {
                let (timer, replaced) = self.timers.arm(
                    player,
                    now,
                    result.timeout_delay,
                    subject,
                    input,
                    operation_id,
                );
                trace!(
                    object_type = %self.object_type,
                    %player,
                    ?timer,
                    replaced = ?replaced.map(|t| t.id),
                    delay_ms = u64::try_from(result.timeout_delay.as_millis()).unwrap_or(u64::MAX),
                    "timer armed"
                );
            }
        }

        if result.outcome == Outcome::Finished {
            if let Some(invoker) = self.invoker.as_mut() {
                invoker.finished(operation.name(), subject, player);
            }
        }

        debug!(
            object_type = %self.object_type,
            operation = operation.name(),
            %subject,
            %player,
            from = %state,
            to = %result.next_state,
            from_timer,
            "transition"
        );

        let consumed = self.inputs.get(input).is_some_and(|i| i.consume);

        if let Some(next) = result.follow_up {
            if depth + 1 >= MAX_FOLLOW_UP_DEPTH {
                warn!(
                    object_type = %self.object_type,
                    %subject,
                    input = self.inputs.name(next),
                    "follow-up chain too deep, dropping"
                );
            } else {
                self.process_at_depth(store, subject, Some(player), next, now, depth + 1);
            }
        }

        consumed
    }
}

impl Drop for BehaviorMachine {
    fn drop(&mut self) {
        self.dispose();
    }
}
