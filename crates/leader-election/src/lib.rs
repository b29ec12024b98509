//! Lease-based leader election
//!
//! Candidates contend for a single lease record held in a strongly
//! consistent store. Every write is conditional on the version last read,
//! so the store arbitrates races; locally each candidate steps down as soon
//! as it cannot prove it still holds a live lease.
//!
//! ```no_run
//! use leader_election::{ElectionConfig, LeaderElector, MemoryLeaseStore};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> leader_election::Result<()> {
//! let elector = LeaderElector::builder(ElectionConfig::new("scheduler", "default", "node-a"))
//!     .store(Arc::new(MemoryLeaseStore::new()))
//!     .on_started_leading(|| println!("start work"))
//!     .on_stopped_leading(|| println!("stop work"))
//!     .build()?;
//!
//! elector.run(CancellationToken::new()).await
//! # }
//! ```

pub mod accessor;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod elector;
pub mod error;
#[cfg(feature = "kubernetes")]
pub mod kube_store;
pub mod machine;
pub mod record;
pub mod store;

pub use accessor::LeaseAccessor;
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use config::{ElectionConfig, StoreBackendConfig};
pub use dispatcher::{ElectionEvent, ElectionHandle, LeaderCallbacks, LeadershipSnapshot};
pub use elector::{LeaderElector, LeaderElectorBuilder};
pub use error::{ElectionError, Result};
#[cfg(feature = "kubernetes")]
pub use kube_store::KubeLeaseStore;
pub use machine::{Decision, Phase, StepDownReason};
pub use record::{LeaseKey, LeaseRecord, Version, VersionedRecord};
pub use store::{create_store, LeaseStore, MemoryLeaseStore, SledLeaseStore};

pub use tokio_util::sync::CancellationToken;
