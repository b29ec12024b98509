//! Lease record model shared through the coordination backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifies one lease record in a backend
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseKey {
    pub namespace: String,
    pub name: String,
}

impl LeaseKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Flat key for stores without a namespace concept
    pub fn storage_key(&self) -> String {
        format!("leases/{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque optimistic-concurrency token issued by the backend
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The single piece of state candidates share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Empty when nobody holds the lease
    pub holder_identity: String,
    pub lease_duration_seconds: u32,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub leader_transitions: u32,
}

impl LeaseRecord {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_duration_seconds))
    }

    /// Instant after which any candidate may take the lease over.
    /// Saturates at the latest representable time, so an out-of-range
    /// `renew_time` reads as never expiring.
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_duration())
            .ok()
            .and_then(|duration| self.renew_time.checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_held(&self) -> bool {
        !self.holder_identity.is_empty()
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.is_held() && self.holder_identity == identity
    }

    /// Holder as an option, empty meaning released
    pub fn holder(&self) -> Option<&str> {
        if self.is_held() {
            Some(self.holder_identity.as_str())
        } else {
            None
        }
    }
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub record: LeaseRecord,
    pub version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(renewed_at: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            holder_identity: "a".to_string(),
            lease_duration_seconds: 15,
            acquire_time: renewed_at,
            renew_time: renewed_at,
            leader_transitions: 0,
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let lease = record(t0);

        assert_eq!(lease.expires_at(), t0 + chrono::Duration::seconds(15));
        assert!(!lease.is_expired(t0 + chrono::Duration::seconds(15)));
        assert!(lease.is_expired(t0 + chrono::Duration::milliseconds(15_001)));
    }

    #[test]
    fn test_expiry_saturates_near_end_of_time() {
        let lease = record(DateTime::<Utc>::MAX_UTC - chrono::Duration::seconds(1));

        assert_eq!(lease.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(!lease.is_expired(Utc::now()));
        assert!(!lease.is_expired(DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn test_holder_helpers() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut lease = record(t0);
        assert!(lease.is_held_by("a"));
        assert_eq!(lease.holder(), Some("a"));

        lease.holder_identity.clear();
        assert!(!lease.is_held());
        assert!(!lease.is_held_by(""));
        assert_eq!(lease.holder(), None);
    }

    #[test]
    fn test_record_wire_format() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
        let json = serde_json::to_value(record(t0)).unwrap();

        assert_eq!(json["holderIdentity"], "a");
        assert_eq!(json["leaseDurationSeconds"], 15);
        assert_eq!(json["leaderTransitions"], 0);
        assert_eq!(json["renewTime"], "2024-01-01T12:30:00Z");
    }

    #[test]
    fn test_key_formats() {
        let key = LeaseKey::new("kube-system", "scheduler");
        assert_eq!(key.to_string(), "kube-system/scheduler");
        assert_eq!(key.storage_key(), "leases/kube-system/scheduler");
        assert_eq!(Version::from(7).as_str(), "7");
    }
}
