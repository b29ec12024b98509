//! Access to the single lease record contested by an election

use crate::error::Result;
use crate::record::{LeaseKey, LeaseRecord, Version, VersionedRecord};
use crate::store::LeaseStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Binds a store to one lease key and bounds every call with a timeout.
///
/// No retries happen here; the election loops decide what to do next.
#[derive(Clone)]
pub struct LeaseAccessor {
    store: Arc<dyn LeaseStore>,
    key: LeaseKey,
    request_timeout: Duration,
}

impl LeaseAccessor {
    pub fn new(store: Arc<dyn LeaseStore>, key: LeaseKey, request_timeout: Duration) -> Self {
        Self {
            store,
            key,
            request_timeout,
        }
    }

    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub async fn fetch(&self) -> Result<Option<VersionedRecord>> {
        timeout(self.request_timeout, self.store.fetch(&self.key)).await?
    }

    pub async fn create(&self, record: &LeaseRecord) -> Result<Version> {
        timeout(self.request_timeout, self.store.create(&self.key, record)).await?
    }

    pub async fn update(&self, record: &LeaseRecord, expected: &Version) -> Result<Version> {
        timeout(
            self.request_timeout,
            self.store.update(&self.key, record, expected),
        )
        .await?
    }
}
