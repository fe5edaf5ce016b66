//! Cooperative timer registry.
//!
//! Timers are not threads: the host's tick loop asks for the timers that
//! are due and re-enters the machine with them. Each player has at most one
//! pending slot; arming a new timer replaces whatever was pending.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::operation::OperationId;
use super::state::InputId;
use super::store::SubjectId;

/// Milliseconds on the host's tick clock.
pub type Timestamp = u64;

/// Stable numeric identity of the actor invoking transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player#{}", self.0)
    }
}

/// Unique per arm call, so a re-armed slot is never mistaken for the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// A delayed re-entry into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    pub id: TimerId,
    pub due_at: Timestamp,
    pub subject: SubjectId,
    pub input: InputId,
    pub operation: OperationId,
}

/// One pending timer slot per player.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    slots: HashMap<PlayerId, PendingTimer>,
    next_id: u64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `player`, due `delay` after `now`.
    ///
    /// Any timer already pending for the player is cancelled first and
    /// returned.
    pub fn arm(
        &mut self,
        player: PlayerId,
        now: Timestamp,
        delay: Duration,
        subject: SubjectId,
        input: InputId,
        operation: OperationId,
    ) -> (TimerId, Option<PendingTimer>) {
        let replaced = self.cancel(player);

        self.next_id += 1;
        let id = TimerId(self.next_id);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.slots.insert(
            player,
            PendingTimer {
                id,
                due_at: now.saturating_add(delay_ms),
                subject,
                input,
                operation,
            },
        );
        (id, replaced)
    }

    /// Cancel the player's pending timer. Cancelling nothing is a no-op.
    pub fn cancel(&mut self, player: PlayerId) -> Option<PendingTimer> {
        self.slots.remove(&player)
    }

    /// Check if the player has a timer pending.
    pub fn is_pending(&self, player: PlayerId) -> bool {
        self.slots.contains_key(&player)
    }

    /// Get the player's pending timer.
    pub fn pending(&self, player: PlayerId) -> Option<&PendingTimer> {
        self.slots.get(&player)
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_due(&mut self, now: Timestamp) -> Vec<(PlayerId, PendingTimer)> {
        let due: Vec<PlayerId> = self
            .slots
            .iter()
            .filter(|(_, timer)| timer.due_at <= now)
            .map(|(player, _)| *player)
            .collect();

        let mut fired: Vec<(PlayerId, PendingTimer)> = due
            .into_iter()
            .filter_map(|player| self.slots.remove(&player).map(|timer| (player, timer)))
            .collect();
        fired.sort_by_key(|(_, timer)| (timer.due_at, timer.id));
        fired
    }

    /// Earliest pending due time, if any.
    pub fn next_due(&self) -> Option<Timestamp> {
        self.slots.values().map(|timer| timer.due_at).min()
    }

    /// Cancel everything. Returns how many timers were pending.
    pub fn clear(&mut self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const P1: PlayerId = PlayerId(1);
    const P2: PlayerId = PlayerId(2);

    fn arm(registry: &mut TimerRegistry, player: PlayerId, now: Timestamp, ms: u64) -> TimerId {
        registry
            .arm(
                player,
                now,
                Duration::from_millis(ms),
                SubjectId(0),
                InputId(0),
                OperationId(0),
            )
            .0
    }

    #[test]
    fn test_arm_and_fire() {
        let mut timers = TimerRegistry::new();
        arm(&mut timers, P1, 1_000, 500);

        assert!(timers.is_pending(P1));
        assert_eq!(timers.next_due(), Some(1_500));
        assert!(timers.take_due(1_499).is_empty());

        let fired = timers.take_due(1_500);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, P1);
        assert!(!timers.is_pending(P1));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut timers = TimerRegistry::new();
        arm(&mut timers, P1, 0, 100);

        assert!(timers.cancel(P1).is_some());
        assert!(timers.cancel(P1).is_none());
        assert!(!timers.is_pending(P1));
        assert!(timers.take_due(1_000).is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut timers = TimerRegistry::new();
        arm(&mut timers, P1, 0, 100);

        assert_eq!(timers.take_due(100).len(), 1);
        assert!(timers.cancel(P1).is_none());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_second_arm_replaces_first() {
        let mut timers = TimerRegistry::new();
        let first = arm(&mut timers, P1, 0, 100);
        let (second, replaced) = timers.arm(
            P1,
            50,
            Duration::from_millis(200),
            SubjectId(0),
            InputId(0),
            OperationId(1),
        );

        assert_eq!(replaced.map(|t| t.id), Some(first));
        assert_eq!(timers.len(), 1);

        // The first due time passes without anything firing.
        assert!(timers.take_due(100).is_empty());

        let fired = timers.take_due(250);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1.id, second);
        assert_eq!(fired[0].1.operation, OperationId(1));
    }

    #[test]
    fn test_players_have_independent_slots() {
        let mut timers = TimerRegistry::new();
        arm(&mut timers, P1, 0, 300);
        arm(&mut timers, P2, 0, 100);

        let fired = timers.take_due(300);
        let players: Vec<PlayerId> = fired.iter().map(|(p, _)| *p).collect();
        assert_eq!(players, vec![P2, P1]);
    }

    #[test]
    fn test_clear() {
        let mut timers = TimerRegistry::new();
        arm(&mut timers, P1, 0, 300);
        arm(&mut timers, P2, 0, 100);

        assert_eq!(timers.clear(), 2);
        assert_eq!(timers.clear(), 0);
        assert_eq!(timers.next_due(), None);
    }
}
