//! The election control loop.
//!
//! One sequential loop per candidate alternates between acquiring the lease
//! (while follower) and renewing it (while leader). Every backend write is
//! conditional, so racing candidates are serialized by the backend; locally
//! the leader steps down as soon as it cannot prove it still holds a live
//! lease.

use crate::accessor::LeaseAccessor;
use crate::clock::{Clock, SystemClock};
use crate::config::ElectionConfig;
use crate::dispatcher::{Dispatcher, ElectionHandle, LeaderCallbacks};
use crate::error::{ElectionError, Result};
use crate::machine::{
    acquire_record, decide, release_record, renew_record, Decision, Phase, StateMachine,
    StepDownReason,
};
use crate::record::{LeaseKey, VersionedRecord};
use crate::store::{create_store, LeaseStore};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Result of one renewal attempt that reached the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenewOutcome {
    Renewed,
    Lost(StepDownReason),
}

/// Runs a lease-based election for one candidate
pub struct LeaderElector {
    config: ElectionConfig,
    accessor: LeaseAccessor,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
}

impl LeaderElector {
    pub fn builder(config: ElectionConfig) -> LeaderElectorBuilder {
        LeaderElectorBuilder::new(config)
    }

    /// Build an elector using the backend named in the configuration
    pub async fn from_config(config: ElectionConfig, callbacks: LeaderCallbacks) -> Result<Self> {
        config.validate()?;
        let store = create_store(&config.backend).await?;
        Self::builder(config)
            .store(store)
            .callbacks(callbacks)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.dispatcher.is_leader()
    }

    /// Identity of the last observed leader
    pub fn current_leader(&self) -> Option<String> {
        self.dispatcher.current_leader()
    }

    pub fn handle(&self) -> ElectionHandle {
        ElectionHandle::new(self.dispatcher.clone())
    }

    /// Drive the election until `cancel` fires.
    ///
    /// Transient backend failures never end the loop. When cancelled while
    /// leading, the lease is released on a best-effort basis within
    /// `release_grace`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ElectionError::invalid_state("election is already running"));
        }

        let _guard = RunGuard { elector: self };

        let span = tracing::info_span!(
            "leader_election",
            name = %self.config.name,
            namespace = %self.config.namespace,
            identity = %self.config.identity,
        );
        self.run_loop(&cancel).instrument(span).await
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(
            "Starting leader election for lease {} on {} backend",
            self.accessor.key(),
            self.accessor.backend_name()
        );

        let mut machine = StateMachine::new();
        loop {
            let acquired_at = match self.acquire(cancel).await {
                Some(acquired_at) => acquired_at,
                None => break,
            };

            self.transition(&mut machine, Phase::Leader)?;
            self.dispatcher.started_leading();

            let reason = self.renew(cancel, acquired_at).await;

            self.transition(&mut machine, Phase::Releasing)?;
            self.dispatcher.stopped_leading(reason);
            if reason == StepDownReason::Cancelled && self.config.release_on_cancel {
                self.release().await;
            }
            self.transition(&mut machine, Phase::Follower)?;

            if cancel.is_cancelled() {
                break;
            }
        }

        tracing::info!("Leader election stopped");
        Ok(())
    }

    fn transition(&self, machine: &mut StateMachine, next: Phase) -> Result<()> {
        let previous = machine.transition(next)?;
        tracing::debug!("Phase {} -> {}", previous, next);
        self.dispatcher.set_phase(next);
        Ok(())
    }

    /// Retry until the lease is ours. Returns when the winning attempt
    /// started, or `None` if cancelled.
    async fn acquire(&self, cancel: &CancellationToken) -> Option<Instant> {
        let mut first_attempt = true;
        loop {
            if !first_attempt {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    _ = sleep(self.retry_wait()) => {}
                }
            }
            first_attempt = false;

            if cancel.is_cancelled() {
                return None;
            }

            let started = Instant::now();
            let now = self.clock.now();
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                attempt = self.try_acquire(now) => attempt,
            };

            match attempt {
                Ok(true) => {
                    tracing::info!("Successfully acquired lease {}", self.accessor.key());
                    return Some(started);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to acquire lease {}: {}", self.accessor.key(), e);
                }
            }
        }
    }

    async fn try_acquire(&self, now: DateTime<Utc>) -> Result<bool> {
        let identity = self.config.identity.as_str();
        let current = self.accessor.fetch().await?;
        if let Some(current) = &current {
            self.dispatcher.observe_leader(current.record.holder());
        }

        let write = match decide(current.as_ref(), identity, now) {
            Decision::Defer { holder, expires_at } => {
                tracing::debug!(
                    "Lease {} is held by {} until {}",
                    self.accessor.key(),
                    holder,
                    expires_at
                );
                return Ok(false);
            }
            Decision::Claim => {
                let record = acquire_record(None, identity, self.lease_seconds(), now);
                self.accessor.create(&record).await
            }
            Decision::Takeover { current } | Decision::Renew { current } => {
                let record = acquire_record(
                    Some(&current.record),
                    identity,
                    self.lease_seconds(),
                    now,
                );
                self.accessor.update(&record, &current.version).await
            }
        };

        match write {
            Ok(_) => {
                self.dispatcher.observe_leader(Some(identity));
                Ok(true)
            }
            Err(e) if e.is_contention() => {
                tracing::debug!("Lost the race for lease {}: {}", self.accessor.key(), e);
                self.observe_winner().await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort read of whoever beat us to the write
    async fn observe_winner(&self) {
        if let Ok(Some(winner)) = self.accessor.fetch().await {
            self.dispatcher.observe_leader(winner.record.holder());
        }
    }

    /// Keep the lease alive; returns why leadership ended.
    ///
    /// The renew deadline counts from the start of the last successful
    /// write, and no attempt may run past it.
    async fn renew(&self, cancel: &CancellationToken, acquired_at: Instant) -> StepDownReason {
        let mut last_renewed = acquired_at;
        loop {
            let deadline = last_renewed + self.config.renew_deadline;
            let next_attempt = (Instant::now() + self.config.retry_period).min(deadline);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StepDownReason::Cancelled,
                _ = sleep_until(next_attempt) => {}
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    "Failed to renew lease {} within {:?}, stepping down",
                    self.accessor.key(),
                    self.config.renew_deadline
                );
                return StepDownReason::DeadlineExceeded;
            }

            let started = Instant::now();
            let now = self.clock.now();
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StepDownReason::Cancelled,
                attempt = timeout_at(deadline, self.try_renew(now)) => attempt,
            };

            match attempt {
                Ok(Ok(RenewOutcome::Renewed)) => {
                    tracing::trace!("Renewed lease {}", self.accessor.key());
                    last_renewed = started;
                }
                Ok(Ok(RenewOutcome::Lost(reason))) => return reason,
                Ok(Err(e)) => {
                    tracing::warn!("Failed to renew lease {}: {}", self.accessor.key(), e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Renewal of lease {} still pending at the renew deadline, stepping down",
                        self.accessor.key()
                    );
                    return StepDownReason::DeadlineExceeded;
                }
            }
        }
    }

    async fn try_renew(&self, now: DateTime<Utc>) -> Result<RenewOutcome> {
        let identity = self.config.identity.as_str();
        let current: VersionedRecord = match self.accessor.fetch().await? {
            Some(current) => current,
            None => {
                tracing::warn!("Lease {} disappeared while leading", self.accessor.key());
                self.dispatcher.observe_leader(None);
                return Ok(RenewOutcome::Lost(StepDownReason::LeaseLost));
            }
        };

        self.dispatcher.observe_leader(current.record.holder());
        if !current.record.is_held_by(identity) {
            tracing::warn!(
                "Lease {} is now held by {:?}",
                self.accessor.key(),
                current.record.holder()
            );
            return Ok(RenewOutcome::Lost(StepDownReason::LeaseLost));
        }

        let record = renew_record(&current.record, now);
        match self.accessor.update(&record, &current.version).await {
            Ok(_) => Ok(RenewOutcome::Renewed),
            Err(e) if e.is_contention() => {
                tracing::info!("Renewal of lease {} lost to a concurrent write", self.accessor.key());
                Ok(RenewOutcome::Lost(StepDownReason::Conflict))
            }
            Err(e) => Err(e),
        }
    }

    /// Clear the holder so a follower can take over without waiting for expiry
    async fn release(&self) {
        match timeout(self.config.release_grace, self.try_release()).await {
            Ok(Ok(true)) => {
                tracing::info!("Released lease {}", self.accessor.key());
                self.dispatcher.observe_leader(None);
            }
            Ok(Ok(false)) => {
                tracing::debug!("Lease {} is no longer ours, nothing to release", self.accessor.key());
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to release lease {}: {}", self.accessor.key(), e);
            }
            Err(_) => {
                tracing::warn!(
                    "Releasing lease {} did not finish within {:?}",
                    self.accessor.key(),
                    self.config.release_grace
                );
            }
        }
    }

    async fn try_release(&self) -> Result<bool> {
        let current = match self.accessor.fetch().await? {
            Some(current) if current.record.is_held_by(&self.config.identity) => current,
            _ => return Ok(false),
        };
        let record = release_record(&current.record, self.clock.now());
        self.accessor.update(&record, &current.version).await?;
        Ok(true)
    }

    fn retry_wait(&self) -> Duration {
        let jitter = self.config.retry_jitter;
        if jitter > 0.0 {
            self.config
                .retry_period
                .mul_f64(1.0 + rand::random::<f64>() * jitter)
        } else {
            self.config.retry_period
        }
    }

    fn lease_seconds(&self) -> u32 {
        self.config.lease_duration_seconds()
    }
}

/// Restores a follower state when `run` ends, including when its future is
/// dropped mid-flight.
struct RunGuard<'a> {
    elector: &'a LeaderElector,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let dispatcher = &self.elector.dispatcher;
        if dispatcher.phase() != Phase::Follower {
            tracing::warn!("Election loop ended while {}, stepping down", dispatcher.phase());
            dispatcher.set_phase(Phase::Follower);
        }
        dispatcher.stopped_leading(StepDownReason::Cancelled);
        self.elector.running.store(false, Ordering::Release);
    }
}

/// Builder for [`LeaderElector`]
pub struct LeaderElectorBuilder {
    config: ElectionConfig,
    store: Option<Arc<dyn LeaseStore>>,
    callbacks: LeaderCallbacks,
    clock: Arc<dyn Clock>,
}

impl LeaderElectorBuilder {
    pub fn new(config: ElectionConfig) -> Self {
        Self {
            config,
            store: None,
            callbacks: LeaderCallbacks::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn callbacks(mut self, callbacks: LeaderCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn on_started_leading<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.on_started_leading(f);
        self
    }

    pub fn on_stopped_leading<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.on_stopped_leading(f);
        self
    }

    pub fn on_new_leader<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.on_new_leader(f);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and assemble the elector
    pub fn build(self) -> Result<LeaderElector> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| ElectionError::configuration("No lease store configured"))?;

        let key = LeaseKey::new(self.config.namespace.clone(), self.config.name.clone());
        let accessor = LeaseAccessor::new(store, key, self.config.request_timeout);
        let dispatcher = Arc::new(Dispatcher::new(
            self.config.identity.clone(),
            self.callbacks,
            self.clock.clone(),
        ));

        Ok(LeaderElector {
            config: self.config,
            accessor,
            dispatcher,
            clock: self.clock,
            running: AtomicBool::new(false),
        })
    }
}
