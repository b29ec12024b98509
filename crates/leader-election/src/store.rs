//! Lease store backends

use crate::config::StoreBackendConfig;
use crate::error::{ElectionError, Result};
use crate::record::{LeaseKey, LeaseRecord, Version, VersionedRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Strongly consistent storage for lease records.
///
/// Implementations must make `create` and `update` atomic: exactly one of
/// several concurrent creates succeeds, and an update applies only while the
/// stored version still equals `expected`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the record, `None` when it does not exist
    async fn fetch(&self, key: &LeaseKey) -> Result<Option<VersionedRecord>>;

    /// Create the record, failing with `AlreadyExists` if it is present
    async fn create(&self, key: &LeaseKey, record: &LeaseRecord) -> Result<Version>;

    /// Replace the record if it is still at `expected`, failing with `Conflict` otherwise
    async fn update(
        &self,
        key: &LeaseKey,
        record: &LeaseRecord,
        expected: &Version,
    ) -> Result<Version>;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Create a store based on configuration
pub async fn create_store(config: &StoreBackendConfig) -> Result<Arc<dyn LeaseStore>> {
    match config {
        StoreBackendConfig::Memory => Ok(Arc::new(MemoryLeaseStore::new())),
        StoreBackendConfig::Sled { path } => Ok(Arc::new(SledLeaseStore::open(path)?)),
        #[cfg(feature = "kubernetes")]
        StoreBackendConfig::Kubernetes => {
            Ok(Arc::new(crate::kube_store::KubeLeaseStore::try_default().await?))
        }
        #[cfg(not(feature = "kubernetes"))]
        StoreBackendConfig::Kubernetes => Err(ElectionError::configuration(
            "kubernetes backend requires the `kubernetes` feature",
        )),
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: HashMap<LeaseKey, (LeaseRecord, u64)>,
    revision: u64,
}

/// In-memory store; clones share the same records
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a record out-of-band, as an operator would
    pub async fn remove(&self, key: &LeaseKey) -> Option<LeaseRecord> {
        let mut inner = self.inner.lock().await;
        inner.records.remove(key).map(|(record, _)| record)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn fetch(&self, key: &LeaseKey) -> Result<Option<VersionedRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.get(key).map(|(record, version)| VersionedRecord {
            record: record.clone(),
            version: Version::from(*version),
        }))
    }

    async fn create(&self, key: &LeaseKey, record: &LeaseRecord) -> Result<Version> {
        let mut inner = self.inner.lock().await;
        if inner.records.contains_key(key) {
            return Err(ElectionError::already_exists(key.to_string()));
        }

        inner.revision += 1;
        let version = inner.revision;
        inner.records.insert(key.clone(), (record.clone(), version));
        Ok(Version::from(version))
    }

    async fn update(
        &self,
        key: &LeaseKey,
        record: &LeaseRecord,
        expected: &Version,
    ) -> Result<Version> {
        let mut inner = self.inner.lock().await;
        let current = match inner.records.get(key) {
            Some((_, version)) => Version::from(*version),
            None => return Err(ElectionError::conflict(key.to_string())),
        };
        if &current != expected {
            return Err(ElectionError::conflict(key.to_string()));
        }

        inner.revision += 1;
        let version = inner.revision;
        inner.records.insert(key.clone(), (record.clone(), version));
        Ok(Version::from(version))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// On-disk envelope for sled
#[derive(Debug, Serialize, Deserialize)]
struct StoredLease {
    version: u64,
    record: LeaseRecord,
}

/// Sled-based store; writes go through `compare_and_swap`.
///
/// Versions come from the database-wide id generator, so a record deleted
/// and re-created never reuses a version a candidate may still hold.
pub struct SledLeaseStore {
    db: sled::Db,
}

impl SledLeaseStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Delete a record out-of-band, as an operator would
    pub fn remove(&self, key: &LeaseKey) -> Result<Option<LeaseRecord>> {
        match self.db.remove(key.storage_key())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?.record)),
            None => Ok(None),
        }
    }

    fn decode(bytes: &[u8]) -> Result<StoredLease> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl LeaseStore for SledLeaseStore {
    async fn fetch(&self, key: &LeaseKey) -> Result<Option<VersionedRecord>> {
        match self.db.get(key.storage_key())? {
            Some(bytes) => {
                let stored = Self::decode(&bytes)?;
                Ok(Some(VersionedRecord {
                    record: stored.record,
                    version: Version::from(stored.version),
                }))
            }
            None => Ok(None),
        }
    }

    async fn create(&self, key: &LeaseKey, record: &LeaseRecord) -> Result<Version> {
        let stored = StoredLease {
            version: self.db.generate_id()?,
            record: record.clone(),
        };
        let bytes = serde_json::to_vec(&stored)?;

        match self
            .db
            .compare_and_swap(key.storage_key(), None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => {
                self.db.flush_async().await?;
                Ok(Version::from(stored.version))
            }
            Err(_) => Err(ElectionError::already_exists(key.to_string())),
        }
    }

    async fn update(
        &self,
        key: &LeaseKey,
        record: &LeaseRecord,
        expected: &Version,
    ) -> Result<Version> {
        let storage_key = key.storage_key();
        let current_bytes = match self.db.get(&storage_key)? {
            Some(bytes) => bytes,
            None => return Err(ElectionError::conflict(key.to_string())),
        };
        let current = Self::decode(&current_bytes)?;
        if Version::from(current.version) != *expected {
            return Err(ElectionError::conflict(key.to_string()));
        }

        let next = StoredLease {
            version: self.db.generate_id()?,
            record: record.clone(),
        };
        let bytes = serde_json::to_vec(&next)?;

        match self
            .db
            .compare_and_swap(&storage_key, Some(current_bytes), Some(bytes))?
        {
            Ok(()) => {
                self.db.flush_async().await?;
                Ok(Version::from(next.version))
            }
            Err(_) => Err(ElectionError::conflict(key.to_string())),
        }
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
