//! Election state machine and lease decision rules

use crate::error::{ElectionError, Result};
use crate::record::{LeaseRecord, VersionedRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the local candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Phase {
    Follower = 0,
    Leader = 1,
    Releasing = 2,
}

impl Phase {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Leader,
            2 => Self::Releasing,
            _ => Self::Follower,
        }
    }

    /// Only `Follower → Leader → Releasing → Follower` is allowed
    pub fn can_transition_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Follower, Phase::Leader)
                | (Phase::Leader, Phase::Releasing)
                | (Phase::Releasing, Phase::Follower)
        )
    }
}

impl Default for Phase {
    fn default() -> Self {
        Self::Follower
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Follower => write!(f, "follower"),
            Phase::Leader => write!(f, "leader"),
            Phase::Releasing => write!(f, "releasing"),
        }
    }
}

/// Why a leader left the `Leader` phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDownReason {
    /// A conditional renewal lost to another writer
    Conflict,
    /// The record names another holder, or vanished
    LeaseLost,
    /// No successful renewal within the renew deadline
    DeadlineExceeded,
    /// The run loop was cancelled while leading
    Cancelled,
}

impl fmt::Display for StepDownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepDownReason::Conflict => write!(f, "renewal conflict"),
            StepDownReason::LeaseLost => write!(f, "lease lost"),
            StepDownReason::DeadlineExceeded => write!(f, "renew deadline exceeded"),
            StepDownReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a candidate should do with the record it just read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No record exists; try to create it
    Claim,
    /// The lease expired or was released; try a conditional takeover
    Takeover { current: VersionedRecord },
    /// We hold a live lease; refresh it
    Renew { current: VersionedRecord },
    /// Someone else holds a live lease
    Defer {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

/// Decide how `identity` should treat `current` at `now`
pub fn decide(current: Option<&VersionedRecord>, identity: &str, now: DateTime<Utc>) -> Decision {
    let current = match current {
        Some(current) => current,
        None => return Decision::Claim,
    };

    let record = &current.record;
    if record.is_expired(now) || !record.is_held() {
        return Decision::Takeover {
            current: current.clone(),
        };
    }

    if record.holder_identity == identity {
        Decision::Renew {
            current: current.clone(),
        }
    } else {
        Decision::Defer {
            holder: record.holder_identity.clone(),
            expires_at: record.expires_at(),
        }
    }
}

/// Record written when `identity` claims or takes over the lease
pub fn acquire_record(
    previous: Option<&LeaseRecord>,
    identity: &str,
    lease_duration_seconds: u32,
    now: DateTime<Utc>,
) -> LeaseRecord {
    match previous {
        Some(prev) if prev.holder_identity == identity => LeaseRecord {
            holder_identity: identity.to_string(),
            lease_duration_seconds,
            acquire_time: prev.acquire_time,
            renew_time: now,
            leader_transitions: prev.leader_transitions,
        },
        Some(prev) => LeaseRecord {
            holder_identity: identity.to_string(),
            lease_duration_seconds,
            acquire_time: now,
            renew_time: now,
            leader_transitions: prev.leader_transitions.saturating_add(1),
        },
        None => LeaseRecord {
            holder_identity: identity.to_string(),
            lease_duration_seconds,
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        },
    }
}

/// Record written on renewal; only `renew_time` moves
pub fn renew_record(current: &LeaseRecord, now: DateTime<Utc>) -> LeaseRecord {
    LeaseRecord {
        renew_time: now,
        ..current.clone()
    }
}

/// Record written on graceful release
pub fn release_record(current: &LeaseRecord, now: DateTime<Utc>) -> LeaseRecord {
    LeaseRecord {
        holder_identity: String::new(),
        lease_duration_seconds: 1,
        acquire_time: now,
        renew_time: now,
        leader_transitions: current.leader_transitions,
    }
}

/// Tracks the phase and rejects transitions outside the cycle
#[derive(Debug, Default)]
pub struct StateMachine {
    phase: Phase,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to `next`, returning the phase left behind
    pub fn transition(&mut self, next: Phase) -> Result<Phase> {
        if !self.phase.can_transition_to(next) {
            return Err(ElectionError::invalid_state(format!(
                "cannot move from {} to {}",
                self.phase, next
            )));
        }
        let previous = self.phase;
        self.phase = next;
        Ok(previous)
    }
}
