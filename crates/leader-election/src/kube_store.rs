//! Kubernetes Lease backend.
//!
//! Records map onto `coordination.k8s.io/v1` Lease objects. The object's
//! `resourceVersion` is the version token, so `replace` doubles as the
//! conditional update: the API server answers 409 when the object moved on.

use crate::error::{ElectionError, Result};
use crate::record::{LeaseKey, LeaseRecord, Version, VersionedRecord};
use crate::store::LeaseStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;

const CONFLICT: u16 = 409;

/// Lease store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeLeaseStore {
    client: Client,
}

impl KubeLeaseStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config or the local kubeconfig
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, key: &LeaseKey) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

fn to_lease(key: &LeaseKey, record: &LeaseRecord, version: Option<&Version>) -> Lease {
    let lease_duration = i32::try_from(record.lease_duration_seconds).unwrap_or(i32::MAX);
    let transitions = i32::try_from(record.leader_transitions).unwrap_or(i32::MAX);

    Lease {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            resource_version: version.map(|v| v.as_str().to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(record.holder_identity.clone()),
            lease_duration_seconds: Some(lease_duration),
            acquire_time: Some(MicroTime(record.acquire_time)),
            renew_time: Some(MicroTime(record.renew_time)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }),
    }
}

fn from_lease(lease: Lease) -> Result<VersionedRecord> {
    let version = lease
        .metadata
        .resource_version
        .clone()
        .ok_or_else(|| ElectionError::unavailable("lease has no resourceVersion"))?;
    let spec = lease.spec.unwrap_or_default();
    let epoch = DateTime::<Utc>::default();

    Ok(VersionedRecord {
        record: LeaseRecord {
            holder_identity: spec.holder_identity.unwrap_or_default(),
            lease_duration_seconds: spec
                .lease_duration_seconds
                .and_then(|s| u32::try_from(s).ok())
                .unwrap_or(0),
            acquire_time: spec.acquire_time.map(|t| t.0).unwrap_or(epoch),
            renew_time: spec.renew_time.map(|t| t.0).unwrap_or(epoch),
            leader_transitions: spec
                .lease_transitions
                .and_then(|t| u32::try_from(t).ok())
                .unwrap_or(0),
        },
        version: Version::new(version),
    })
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn fetch(&self, key: &LeaseKey) -> Result<Option<VersionedRecord>> {
        match self.api(key).get_opt(&key.name).await? {
            Some(lease) => from_lease(lease).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, key: &LeaseKey, record: &LeaseRecord) -> Result<Version> {
        let lease = to_lease(key, record, None);
        match self.api(key).create(&PostParams::default(), &lease).await {
            Ok(created) => Ok(from_lease(created)?.version),
            Err(kube::Error::Api(e)) if e.code == CONFLICT => {
                Err(ElectionError::already_exists(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        key: &LeaseKey,
        record: &LeaseRecord,
        expected: &Version,
    ) -> Result<Version> {
        let lease = to_lease(key, record, Some(expected));
        match self
            .api(key)
            .replace(&key.name, &PostParams::default(), &lease)
            .await
        {
            Ok(replaced) => Ok(from_lease(replaced)?.version),
            Err(kube::Error::Api(e)) if e.code == CONFLICT => {
                Err(ElectionError::conflict(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "kubernetes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_lease_mapping_preserves_fields() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let key = LeaseKey::new("kube-system", "scheduler");
        let record = LeaseRecord {
            holder_identity: "node-a".to_string(),
            lease_duration_seconds: 15,
            acquire_time: t0,
            renew_time: t0 + chrono::Duration::seconds(4),
            leader_transitions: 3,
        };

        let mut lease = to_lease(&key, &record, Some(&Version::new("812")));
        assert_eq!(lease.metadata.name.as_deref(), Some("scheduler"));
        assert_eq!(lease.metadata.resource_version.as_deref(), Some("812"));

        lease.metadata.resource_version = Some("813".to_string());
        let back = from_lease(lease).unwrap();
        assert_eq!(back.record, record);
        assert_eq!(back.version, Version::new("813"));
    }

    #[test]
    fn test_sparse_lease_reads_as_released() {
        let lease = Lease {
            metadata: ObjectMeta {
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: None,
        };

        let back = from_lease(lease).unwrap();
        assert!(!back.record.is_held());
        assert_eq!(back.record.lease_duration_seconds, 0);
    }
}
