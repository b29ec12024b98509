//! Election configuration management

use crate::error::{ElectionError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Name of the lease record contested by all candidates
    pub name: String,

    /// Scope the lease lives in
    pub namespace: String,

    /// Identity of this candidate, unique among concurrently running instances
    pub identity: String,

    /// Release the lease when cancelled while leading
    pub release_on_cancel: bool,

    /// Extra random fraction added to each acquisition wait (0.0 disables)
    pub retry_jitter: f64,

    /// Validity window granted on each acquire or renew
    pub lease_duration: Duration,

    /// How long a leader keeps retrying renewal before stepping down
    pub renew_deadline: Duration,

    /// Wait between acquisition and renewal attempts
    pub retry_period: Duration,

    /// Upper bound on a single backend call
    pub request_timeout: Duration,

    /// Upper bound on the release write during shutdown
    pub release_grace: Duration,

    /// Backend holding the lease record
    pub backend: StoreBackendConfig,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            name: "leader-election".to_string(),
            namespace: "default".to_string(),
            identity: generate_identity(),
            release_on_cancel: true,
            retry_jitter: 0.0,
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            release_grace: Duration::from_secs(5),
            backend: StoreBackendConfig::default(),
        }
    }
}

/// Lease store backend options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreBackendConfig {
    /// In-process storage (tests, single-process demos)
    Memory,

    /// Embedded sled database
    Sled { path: PathBuf },

    /// Kubernetes coordination.k8s.io/v1 Lease objects
    Kubernetes,
}

impl Default for StoreBackendConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Build a candidate identity from the host name and a random suffix
pub fn generate_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "candidate".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

impl ElectionConfig {
    /// Create a configuration with the default timings
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            ..Default::default()
        }
    }

    /// Override the three election timings
    pub fn with_timings(
        mut self,
        lease_duration: Duration,
        renew_deadline: Duration,
        retry_period: Duration,
    ) -> Self {
        self.lease_duration = lease_duration;
        self.renew_deadline = renew_deadline;
        self.retry_period = retry_period;
        self
    }

    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ElectionError::configuration(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content)
            .map_err(|e| ElectionError::configuration(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ElectionError::configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            ElectionError::configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ElectionError::configuration("Election name cannot be empty"));
        }

        if self.namespace.is_empty() {
            return Err(ElectionError::configuration("Namespace cannot be empty"));
        }

        if self.identity.is_empty() {
            return Err(ElectionError::configuration(
                "Candidate identity cannot be empty",
            ));
        }

        if self.lease_duration < Duration::from_secs(1) {
            return Err(ElectionError::configuration(
                "Lease duration must be at least 1 second",
            ));
        }

        if self.lease_duration.subsec_nanos() != 0 {
            return Err(ElectionError::configuration(
                "Lease duration must be a whole number of seconds",
            ));
        }

        if self.lease_duration.as_secs() > u64::from(u32::MAX) {
            return Err(ElectionError::configuration("Lease duration is too large"));
        }

        if self.retry_period.is_zero() {
            return Err(ElectionError::configuration(
                "Retry period must be greater than zero",
            ));
        }

        if !(0.0..1.0).contains(&self.retry_jitter) {
            return Err(ElectionError::configuration(
                "Retry jitter must be in the range [0.0, 1.0)",
            ));
        }

        if self.retry_period >= self.renew_deadline {
            return Err(ElectionError::configuration(format!(
                "Retry period ({:?}) must be shorter than renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }

        let worst_wait = self.retry_period.as_secs_f64() * (1.0 + self.retry_jitter);
        if worst_wait >= self.renew_deadline.as_secs_f64() {
            return Err(ElectionError::configuration(format!(
                "Retry period ({:?}, jitter {}) must be shorter than renew deadline ({:?})",
                self.retry_period, self.retry_jitter, self.renew_deadline
            )));
        }

        if self.renew_deadline >= self.lease_duration {
            return Err(ElectionError::configuration(format!(
                "Renew deadline ({:?}) must be shorter than lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(ElectionError::configuration(
                "Request timeout must be greater than zero",
            ));
        }

        if self.release_grace.is_zero() {
            return Err(ElectionError::configuration(
                "Release grace period must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Lease duration as written into the lease record
    pub fn lease_duration_seconds(&self) -> u32 {
        u32::try_from(self.lease_duration.as_secs()).unwrap_or(u32::MAX)
    }
}
