//! Subject state storage and the predicted/authoritative sync protocol.
//!
//! Every subject persists two state slots: the authoritative copy, written
//! only on the authoritative side and replicated out, and the predicted copy,
//! maintained locally on the other side. When the copies disagree the
//! predicted side keeps showing its prediction for a grace delay, then snaps
//! to the authoritative copy.
//!
//! # Predicted-side read
//!
//! ```text
//!            predicted == authoritative ──▶ clear marker, return predicted
//!                      │ no
//!                      ▼
//!              marker set? ── no ──▶ marker = now, return predicted
//!                      │ yes
//!                      ▼
//!      now - marker < grace ── yes ──▶ return predicted
//!                      │ no
//!                      ▼
//!      clear marker, predicted = authoritative, return authoritative
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::SyncConfig;
use super::error::StoreError;
use super::state::State;
use super::timer::Timestamp;

/// Which copy a side owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Source of truth (server).
    Authoritative,
    /// Locally predicted (client).
    Predicted,
}

impl Side {
    /// Check if this side owns the authoritative copy.
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Self::Authoritative)
    }
}

/// Arena index of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub(crate) u32);

impl SubjectId {
    /// Position of the subject in its store.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject#{}", self.0)
    }
}

/// Persisted layout of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub object_type: String,

    authoritative: Option<String>,

    predicted: Option<String>,

    /// Set when the copies first disagree; absent when converged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diverged_at: Option<Timestamp>,

    /// Authoritative copy changed since the last replication drain.
    #[serde(skip)]
    dirty: bool,
}

impl SubjectRecord {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            authoritative: None,
            predicted: None,
            diverged_at: None,
            dirty: false,
        }
    }

    /// Get the authoritative copy, if one was written or replicated.
    pub fn authoritative(&self) -> Option<&str> {
        self.authoritative.as_deref()
    }

    /// Get the locally predicted copy.
    pub fn predicted(&self) -> Option<&str> {
        self.predicted.as_deref()
    }

    /// When the copies started to disagree.
    pub fn diverged_at(&self) -> Option<Timestamp> {
        self.diverged_at
    }

    /// Check if the authoritative copy awaits replication.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Per-side arena of subject records.
#[derive(Debug, Clone, Default)]
pub struct SubjectStore {
    records: Vec<SubjectRecord>,
}

impl SubjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subject governed by `object_type`. Ids are handed out in
    /// order, so both sides spawning the same subjects agree on ids.
    pub fn spawn(&mut self, object_type: impl Into<String>) -> Result<SubjectId, StoreError> {
        let index =
            u32::try_from(self.records.len()).map_err(|_| StoreError::CapacityExceeded)?;
        self.records.push(SubjectRecord::new(object_type));
        Ok(SubjectId(index))
    }

    /// Get a subject's record.
    pub fn get(&self, subject: SubjectId) -> Option<&SubjectRecord> {
        self.records.get(subject.index())
    }

    /// Get a subject's record for writing.
    pub fn get_mut(&mut self, subject: SubjectId) -> Option<&mut SubjectRecord> {
        self.records.get_mut(subject.index())
    }

    /// Get the object type governing a subject.
    pub fn object_type(&self, subject: SubjectId) -> Option<&str> {
        self.get(subject).map(|r| r.object_type.as_str())
    }

    /// Number of spawned subjects.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no subject has been spawned.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over every subject in spawn order.
    pub fn iter(&self) -> impl Iterator<Item = (SubjectId, &SubjectRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| Some((SubjectId(u32::try_from(index).ok()?), record)))
    }

    /// Collect authoritative copies changed since the last drain and clear
    /// their dirty flags. This is the replication payload.
    pub fn drain_dirty(&mut self) -> Vec<(SubjectId, State)> {
        let mut changed = Vec::new();
        for (index, record) in self.records.iter_mut().enumerate() {
            if !record.dirty {
                continue;
            }
            record.dirty = false;
            // spawn never hands out an index past u32::MAX
            let Ok(index) = u32::try_from(index) else {
                continue;
            };
            if let Some(state) = &record.authoritative {
                changed.push((SubjectId(index), State::new(state.clone())));
            }
        }
        changed
    }

    /// Receive a replicated authoritative copy.
    pub fn apply_replicated(&mut self, subject: SubjectId, state: &State) -> Result<(), StoreError> {
        let record = self
            .get_mut(subject)
            .ok_or(StoreError::UnknownSubject(subject))?;
        record.authoritative = Some(state.as_str().to_string());
        Ok(())
    }
}

/// Reads and writes subject state for one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSync {
    side: Side,
    grace_delay: Duration,
}

impl StateSync {
    pub fn new(side: Side, config: &SyncConfig) -> Self {
        Self {
            side,
            grace_delay: config.grace_delay,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// How long a disagreeing prediction is shown before snapping back.
    pub fn grace_delay(&self) -> Duration {
        self.grace_delay
    }

    /// Persist `state` into the copy this side owns.
    pub fn write(&self, record: &mut SubjectRecord, state: &State) {
        match self.side {
            Side::Authoritative => {
                record.authoritative = Some(state.as_str().to_string());
                record.dirty = true;
            }
            Side::Predicted => {
                // The grace window keeps running across re-predictions; only
                // agreement with the authoritative copy closes it.
                if record.authoritative.as_deref() == Some(state.as_str()) {
                    record.diverged_at = None;
                }
                record.predicted = Some(state.as_str().to_string());
            }
        }
    }

    /// Current state as seen by this side, creating it lazily from `initial`.
    pub fn read(&self, record: &mut SubjectRecord, initial: &State, now: Timestamp) -> State {
        match self.side {
            Side::Authoritative => match &record.authoritative {
                Some(state) => State::new(state.clone()),
                None => {
                    self.write(record, initial);
                    initial.clone()
                }
            },
            Side::Predicted => self.read_predicted(record, initial, now),
        }
    }

    fn read_predicted(&self, record: &mut SubjectRecord, initial: &State, now: Timestamp) -> State {
        let authoritative = record
            .authoritative
            .clone()
            .unwrap_or_else(|| initial.as_str().to_string());
        let predicted = record
            .predicted
            .get_or_insert_with(|| authoritative.clone())
            .clone();

        if predicted == authoritative {
            record.diverged_at = None;
            return State::new(predicted);
        }

        let Some(since) = record.diverged_at else {
            record.diverged_at = Some(now);
            return State::new(predicted);
        };

        let elapsed = Duration::from_millis(now.saturating_sub(since));
        if elapsed < self.grace_delay {
            return State::new(predicted);
        }

        record.diverged_at = None;
        record.predicted = Some(authoritative.clone());
        State::new(authoritative)
    }

    /// Current state without any bookkeeping.
    pub fn peek(&self, record: &SubjectRecord, initial: &State) -> State {
        let slot = match self.side {
            Side::Authoritative => record.authoritative.as_ref(),
            Side::Predicted => record.predicted.as_ref().or(record.authoritative.as_ref()),
        };
        slot.map_or_else(|| initial.clone(), |state| State::new(state.clone()))
    }
}
