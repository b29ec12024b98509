//! Leadership observation and callback dispatch

use crate::clock::Clock;
use crate::machine::{Phase, StepDownReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Work started or stopped on a leadership transition
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Notified with the identity of a newly observed leader
pub type LeaderCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// User callbacks.
///
/// Callbacks run on the election loop; long-running work should be handed
/// off to a task so renewals keep their schedule.
#[derive(Clone, Default)]
pub struct LeaderCallbacks {
    on_started_leading: Option<Callback>,
    on_stopped_leading: Option<Callback>,
    on_new_leader: Option<LeaderCallback>,
}

impl LeaderCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_started_leading<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_started_leading = Some(Arc::new(f));
        self
    }

    pub fn on_stopped_leading<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_stopped_leading = Some(Arc::new(f));
        self
    }

    pub fn on_new_leader<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_new_leader = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for LeaderCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderCallbacks")
            .field("on_started_leading", &self.on_started_leading.is_some())
            .field("on_stopped_leading", &self.on_stopped_leading.is_some())
            .field("on_new_leader", &self.on_new_leader.is_some())
            .finish()
    }
}

/// Phase and observed leader, always published together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipSnapshot {
    pub phase: Phase,
    pub leader: Option<String>,
}

/// Events emitted by an election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElectionEvent {
    StartedLeading {
        identity: String,
        timestamp: DateTime<Utc>,
    },
    StoppedLeading {
        identity: String,
        reason: StepDownReason,
        timestamp: DateTime<Utc>,
    },
    NewLeader {
        identity: String,
        timestamp: DateTime<Utc>,
    },
}

/// Publishes leadership state and fires callbacks once per transition
pub struct Dispatcher {
    identity: String,
    phase: AtomicU8,
    leading: AtomicBool,
    snapshot_tx: watch::Sender<LeadershipSnapshot>,
    event_tx: broadcast::Sender<ElectionEvent>,
    callbacks: LeaderCallbacks,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(identity: String, callbacks: LeaderCallbacks, clock: Arc<dyn Clock>) -> Self {
        let (snapshot_tx, _) = watch::channel(LeadershipSnapshot::default());
        let (event_tx, _) = broadcast::channel(256);

        Self {
            identity,
            phase: AtomicU8::new(Phase::Follower as u8),
            leading: AtomicBool::new(false),
            snapshot_tx,
            event_tx,
            callbacks,
            clock,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Lock-free; safe to call from any thread
    pub fn is_leader(&self) -> bool {
        self.phase() == Phase::Leader
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Last observed holder; may lag the backend by up to one tick
    pub fn current_leader(&self) -> Option<String> {
        self.snapshot_tx.borrow().leader.clone()
    }

    pub fn snapshot(&self) -> LeadershipSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ElectionEvent> {
        self.event_tx.subscribe()
    }

    /// Publish a new phase. The flag is stored before the snapshot so a
    /// step-down is visible to `is_leader` first.
    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
        self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.phase == phase {
                return false;
            }
            snapshot.phase = phase;
            if phase == Phase::Leader {
                snapshot.leader = Some(self.identity.clone());
            }
            true
        });
    }

    /// Record the holder seen in the backend, notifying on change
    pub(crate) fn observe_leader(&self, holder: Option<&str>) {
        let changed = self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.leader.as_deref() == holder {
                return false;
            }
            snapshot.leader = holder.map(str::to_string);
            true
        });
        if !changed {
            return;
        }

        let holder = match holder {
            Some(holder) => holder,
            None => {
                tracing::debug!("Lease has no holder");
                return;
            }
        };

        if holder == self.identity {
            tracing::info!("Still leading");
        } else {
            tracing::info!("Another instance has been elected as leader: {}", holder);
        }

        let _ = self.event_tx.send(ElectionEvent::NewLeader {
            identity: holder.to_string(),
            timestamp: self.clock.now(),
        });
        if let Some(callback) = &self.callbacks.on_new_leader {
            callback(holder);
        }
    }

    /// Fires at most once until the next `stopped_leading`
    pub(crate) fn started_leading(&self) {
        if self.leading.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!("Started leading");
        let _ = self.event_tx.send(ElectionEvent::StartedLeading {
            identity: self.identity.clone(),
            timestamp: self.clock.now(),
        });
        if let Some(callback) = &self.callbacks.on_started_leading {
            callback();
        }
    }

    /// Fires at most once per `started_leading`
    pub(crate) fn stopped_leading(&self, reason: StepDownReason) {
        if !self.leading.swap(false, Ordering::AcqRel) {
            return;
        }

        tracing::info!("Leadership lost, stopped leading ({})", reason);
        let _ = self.event_tx.send(ElectionEvent::StoppedLeading {
            identity: self.identity.clone(),
            reason,
            timestamp: self.clock.now(),
        });
        if let Some(callback) = &self.callbacks.on_stopped_leading {
            callback();
        }
    }
}

/// Cheap, cloneable read side of an election
#[derive(Clone)]
pub struct ElectionHandle {
    dispatcher: Arc<Dispatcher>,
}

impl ElectionHandle {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn identity(&self) -> &str {
        self.dispatcher.identity()
    }

    pub fn is_leader(&self) -> bool {
        self.dispatcher.is_leader()
    }

    pub fn phase(&self) -> Phase {
        self.dispatcher.phase()
    }

    pub fn current_leader(&self) -> Option<String> {
        self.dispatcher.current_leader()
    }

    pub fn snapshot(&self) -> LeadershipSnapshot {
        self.dispatcher.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipSnapshot> {
        self.dispatcher.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ElectionEvent> {
        self.dispatcher.events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::AtomicUsize;

    fn counting_dispatcher() -> (Dispatcher, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        let callbacks = {
            let (started, stopped, observed) = (started.clone(), stopped.clone(), observed.clone());
            LeaderCallbacks::new()
                .on_started_leading(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                })
                .on_stopped_leading(move || {
                    stopped.fetch_add(1, Ordering::SeqCst);
                })
                .on_new_leader(move |_| {
                    observed.fetch_add(1, Ordering::SeqCst);
                })
        };

        let dispatcher = Dispatcher::new("a".to_string(), callbacks, Arc::new(SystemClock));
        (dispatcher, started, stopped, observed)
    }

    #[test]
    fn test_callbacks_fire_once_per_transition() {
        let (dispatcher, started, stopped, _) = counting_dispatcher();

        dispatcher.stopped_leading(StepDownReason::Cancelled);
        assert_eq!(stopped.load(Ordering::SeqCst), 0);

        dispatcher.started_leading();
        dispatcher.started_leading();
        assert_eq!(started.load(Ordering::SeqCst), 1);

        dispatcher.stopped_leading(StepDownReason::Conflict);
        dispatcher.stopped_leading(StepDownReason::Conflict);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        dispatcher.started_leading();
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_phase_flag_and_snapshot() {
        let (dispatcher, _, _, _) = counting_dispatcher();
        assert!(!dispatcher.is_leader());

        dispatcher.set_phase(Phase::Leader);
        assert!(dispatcher.is_leader());
        assert_eq!(
            dispatcher.snapshot(),
            LeadershipSnapshot {
                phase: Phase::Leader,
                leader: Some("a".to_string()),
            }
        );

        dispatcher.set_phase(Phase::Releasing);
        assert!(!dispatcher.is_leader());
        assert_eq!(dispatcher.phase(), Phase::Releasing);
    }

    #[test]
    fn test_new_leader_only_on_change() {
        let (dispatcher, _, _, observed) = counting_dispatcher();

        dispatcher.observe_leader(Some("b"));
        dispatcher.observe_leader(Some("b"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.current_leader(), Some("b".to_string()));

        dispatcher.observe_leader(None);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.current_leader(), None);

        dispatcher.observe_leader(Some("c"));
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_events_and_subscription() {
        let (dispatcher, _, _, _) = counting_dispatcher();
        let mut events = dispatcher.events();
        let mut snapshots = dispatcher.subscribe();

        dispatcher.set_phase(Phase::Leader);
        dispatcher.started_leading();

        snapshots.changed().await.unwrap();
        assert_eq!(snapshots.borrow().phase, Phase::Leader);

        match events.recv().await.unwrap() {
            ElectionEvent::StartedLeading { identity, .. } => assert_eq!(identity, "a"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = ElectionEvent::StoppedLeading {
            identity: "a".to_string(),
            reason: StepDownReason::DeadlineExceeded,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stopped_leading");
        assert_eq!(json["reason"], "deadline_exceeded");
    }
}
