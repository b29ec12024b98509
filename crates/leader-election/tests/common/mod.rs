//! Shared harness for multi-candidate election tests

#![allow(dead_code)]

use async_trait::async_trait;
use leader_election::{
    CancellationToken, Clock, ElectionConfig, ElectionError, ElectionHandle, LeaderElector,
    LeaseKey, LeaseRecord, LeaseStore, MemoryLeaseStore, MonotonicClock, Result, Version,
    VersionedRecord,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const LEASE: Duration = Duration::from_secs(15);
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const RETRY: Duration = Duration::from_secs(2);

/// Failure injected into every call through a [`FaultyStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Every call fails as if the backend were unreachable
    Unavailable,
    /// Writes are rejected as conflicts; reads still work
    Conflict,
    /// Writes are applied but the reply is lost
    AckLost,
}

/// Wraps a shared store so one candidate can be partitioned from it
#[derive(Clone)]
pub struct FaultyStore {
    inner: MemoryLeaseStore,
    fault: Arc<Mutex<Fault>>,
}

impl FaultyStore {
    pub fn new(inner: MemoryLeaseStore) -> Self {
        Self {
            inner,
            fault: Arc::new(Mutex::new(Fault::None)),
        }
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock().unwrap() = fault;
    }

    fn fault(&self) -> Fault {
        *self.fault.lock().unwrap()
    }
}

#[async_trait]
impl LeaseStore for FaultyStore {
    async fn fetch(&self, key: &LeaseKey) -> Result<Option<VersionedRecord>> {
        match self.fault() {
            Fault::Unavailable => Err(ElectionError::unavailable("partitioned")),
            _ => self.inner.fetch(key).await,
        }
    }

    async fn create(&self, key: &LeaseKey, record: &LeaseRecord) -> Result<Version> {
        match self.fault() {
            Fault::None => self.inner.create(key, record).await,
            Fault::Unavailable => Err(ElectionError::unavailable("partitioned")),
            Fault::Conflict => Err(ElectionError::already_exists(key.to_string())),
            Fault::AckLost => {
                let _ = self.inner.create(key, record).await;
                Err(ElectionError::unavailable("reply lost"))
            }
        }
    }

    async fn update(
        &self,
        key: &LeaseKey,
        record: &LeaseRecord,
        expected: &Version,
    ) -> Result<Version> {
        match self.fault() {
            Fault::None => self.inner.update(key, record, expected).await,
            Fault::Unavailable => Err(ElectionError::unavailable("partitioned")),
            Fault::Conflict => Err(ElectionError::conflict(key.to_string())),
            Fault::AckLost => {
                let _ = self.inner.update(key, record, expected).await;
                Err(ElectionError::unavailable("reply lost"))
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "faulty-memory"
    }
}

/// Ordered log of callback invocations across candidates
#[derive(Clone, Default)]
pub struct CallbackLog {
    entries: Arc<Mutex<Vec<(String, &'static str)>>>,
}

impl CallbackLog {
    pub fn push(&self, identity: &str, what: &'static str) {
        self.entries
            .lock()
            .unwrap()
            .push((identity.to_string(), what));
    }

    pub fn for_identity(&self, identity: &str) -> Vec<&'static str> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == identity)
            .map(|(_, what)| *what)
            .collect()
    }

    pub fn count(&self, identity: &str, what: &str) -> usize {
        self.for_identity(identity)
            .into_iter()
            .filter(|w| *w == what)
            .count()
    }
}

/// One running candidate
pub struct Candidate {
    pub identity: String,
    pub handle: ElectionHandle,
    pub store: FaultyStore,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<()>>,
}

impl Candidate {
    pub fn is_leader(&self) -> bool {
        self.handle.is_leader()
    }

    /// Cancel and wait for the loop to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap().unwrap();
    }
}

pub fn election_config(identity: &str) -> ElectionConfig {
    ElectionConfig::new("lock", "default", identity).with_timings(LEASE, RENEW_DEADLINE, RETRY)
}

pub fn shared_clock() -> Arc<dyn Clock> {
    Arc::new(MonotonicClock::new())
}

/// Spawn a candidate that records its callbacks into `log`
pub fn spawn_candidate(
    identity: &str,
    backend: &MemoryLeaseStore,
    clock: Arc<dyn Clock>,
    log: &CallbackLog,
) -> Candidate {
    let store = FaultyStore::new(backend.clone());

    let started_log = log.clone();
    let stopped_log = log.clone();
    let (started_id, stopped_id) = (identity.to_string(), identity.to_string());

    let elector = LeaderElector::builder(election_config(identity))
        .store(Arc::new(store.clone()))
        .clock(clock)
        .on_started_leading(move || started_log.push(&started_id, "started"))
        .on_stopped_leading(move || stopped_log.push(&stopped_id, "stopped"))
        .build()
        .unwrap();

    let handle = elector.handle();
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { elector.run(cancel).await })
    };

    Candidate {
        identity: identity.to_string(),
        handle,
        store,
        cancel,
        task,
    }
}

pub fn lease_key() -> LeaseKey {
    LeaseKey::new("default", "lock")
}

/// Number of candidates currently believing they lead
pub fn leader_count(candidates: &[&Candidate]) -> usize {
    candidates.iter().filter(|c| c.is_leader()).count()
}

/// Advance paused time in small steps, asserting at most one leader throughout
pub async fn run_checked(candidates: &[&Candidate], total: Duration) {
    let step = Duration::from_millis(100);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        tokio::time::sleep(step).await;
        elapsed += step;
        assert!(
            leader_count(candidates) <= 1,
            "split brain after {:?}",
            elapsed
        );
    }
}
