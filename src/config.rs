//! Configuration module for the locus location store.

use crate::error::{LocusError, Result};
use crate::types::MachineLocation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a locus node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationStoreConfig {
    /// Network address of this machine, registered with the global store.
    pub local_location: MachineLocation,
    /// Working directory for checkpoint staging and the reconcile marker.
    pub working_dir: PathBuf,
    /// Logical prefix naming the checkpoint lineage this node belongs to.
    /// A reconcile marker written under a different prefix is stale.
    pub checkpoint_prefix: String,
    /// Window within which a repeated touch for the same hash is dropped,
    /// and within which a database entry counts as fresh.
    #[serde(with = "humantime_serde")]
    pub touch_frequency: Duration,
    /// Lifetime of a location entry; drives TTL compaction and, scaled by
    /// 0.75, the reconcile marker freshness window.
    #[serde(with = "humantime_serde")]
    pub location_entry_expiry: Duration,
    /// Base period of inactive-machine recomputation at the global store.
    /// Five of these define the "recent inactivity" window of the
    /// registration policy.
    #[serde(with = "humantime_serde")]
    pub recompute_inactive_machines_expiry: Duration,
    /// Suppress Add events for hashes registered moments ago.
    pub skip_redundant_content_location_add: bool,
    /// Replica count at or above which an Add can ride the event stream
    /// alone instead of an eager global write.
    pub safe_to_lazily_update_machine_count_threshold: usize,
    /// Run the initial heartbeat before `start` returns instead of in a
    /// background task.
    pub inline_post_initialization: bool,
    /// Heartbeat and checkpoint cadence.
    pub heartbeat: HeartbeatConfig,
    /// Reconciliation behavior.
    pub reconciliation: ReconciliationConfig,
    /// Proactive replication behavior.
    pub replication: ProactiveReplicationConfig,
    /// Eviction ordering parameters.
    pub eviction: EvictionConfig,
    /// Logging configuration.
    pub observability: ObservabilityConfig,
}

impl LocationStoreConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| LocusError::InvalidConfig {
            field: "config".to_string(),
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| LocusError::InvalidConfig {
            field: "config".to_string(),
            reason: format!("failed to parse: {}", e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Failures here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_prefix.is_empty() {
            return Err(invalid("checkpoint_prefix", "must not be empty"));
        }
        if self.checkpoint_prefix.contains('|') {
            return Err(invalid(
                "checkpoint_prefix",
                "must not contain the marker separator '|'",
            ));
        }
        if self.local_location.as_str().is_empty() {
            return Err(invalid("local_location", "must not be empty"));
        }
        if self.touch_frequency.is_zero() {
            return Err(invalid("touch_frequency", "must be non-zero"));
        }
        if self.location_entry_expiry.is_zero() {
            return Err(invalid("location_entry_expiry", "must be non-zero"));
        }
        if self.heartbeat.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat.heartbeat_interval", "must be non-zero"));
        }
        self.eviction.validate()?;
        Ok(())
    }

    /// Create a minimal development configuration rooted at `working_dir`.
    pub fn development(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_location: MachineLocation::new("127.0.0.1:7071"),
            working_dir: working_dir.into(),
            checkpoint_prefix: "dev".to_string(),
            touch_frequency: Duration::from_secs(300),
            location_entry_expiry: Duration::from_secs(24 * 3600),
            recompute_inactive_machines_expiry: Duration::from_secs(60),
            skip_redundant_content_location_add: true,
            safe_to_lazily_update_machine_count_threshold: 3,
            inline_post_initialization: true,
            heartbeat: HeartbeatConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            replication: ProactiveReplicationConfig::default(),
            eviction: EvictionConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Heartbeat and checkpoint cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Minimum interval between checkpoints created by a master.
    #[serde(with = "humantime_serde")]
    pub create_checkpoint_interval: Duration,
    /// Interval at which a worker re-restores the latest checkpoint.
    #[serde(with = "humantime_serde")]
    pub restore_checkpoint_interval: Duration,
    /// A first restore is skipped when the latest checkpoint is younger
    /// than this.
    #[serde(with = "humantime_serde")]
    pub restore_checkpoint_age_threshold: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            create_checkpoint_interval: Duration::from_secs(30 * 60),
            restore_checkpoint_interval: Duration::from_secs(30 * 60),
            restore_checkpoint_age_threshold: Duration::from_secs(5 * 60),
        }
    }
}

/// Reconciliation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Enable reconciliation after the first checkpoint restore.
    pub enabled: bool,
    /// Delay between reconciliation cycles.
    #[serde(with = "humantime_serde")]
    pub cycle_frequency: Duration,
    /// Maximum number of Add/Remove differences emitted per cycle.
    pub max_cycle_size: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle_frequency: Duration::from_secs(30),
            max_cycle_size: 100_000,
        }
    }
}

/// Proactive replication behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveReplicationConfig {
    /// Enable proactive replication after the first checkpoint restore.
    pub enabled: bool,
    /// Await the replication pass instead of running it in the background.
    pub inline: bool,
    /// Copy content whose replica count is below this threshold.
    pub locations_threshold: usize,
    /// Pacing delay between successive copy invocations.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Stop after this many copy outcomes, successes and failures summed.
    pub copy_limit: usize,
}

impl Default for ProactiveReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            inline: false,
            locations_threshold: 3,
            delay: Duration::from_secs(30),
            copy_limit: 5,
        }
    }
}

/// Eviction ordering parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Bounded pool of candidates kept per half of the approximate sort.
    pub pool_size: usize,
    /// Candidates pulled and scored per step.
    pub window_size: usize,
    /// Fraction of the pool emitted per step, best first.
    pub removal_fraction: f64,
    /// Fraction of the pool discarded per step, worst first.
    pub discard_fraction: f64,
    /// Only candidates older than this are emitted.
    #[serde(with = "humantime_serde")]
    pub min_age: Duration,
    /// Decay horizon of the recall model behind the effective-age formula.
    #[serde(with = "humantime_serde")]
    pub content_lifetime: Duration,
    /// Probability that a single machine is unreachable when its content is
    /// wanted. Must lie strictly between 0 and 1.
    pub machine_risk: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            pool_size: 5_000,
            window_size: 500,
            removal_fraction: 0.015,
            discard_fraction: 0.0,
            min_age: Duration::ZERO,
            content_lifetime: Duration::from_secs(24 * 3600),
            machine_risk: 0.1,
        }
    }
}

impl EvictionConfig {
    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(invalid("eviction.pool_size", "must be non-zero"));
        }
        if self.window_size == 0 {
            return Err(invalid("eviction.window_size", "must be non-zero"));
        }
        if !(self.removal_fraction > 0.0 && self.removal_fraction <= 1.0) {
            return Err(invalid("eviction.removal_fraction", "must be in (0, 1]"));
        }
        if !(0.0..1.0).contains(&self.discard_fraction) {
            return Err(invalid("eviction.discard_fraction", "must be in [0, 1)"));
        }
        if !(self.machine_risk > 0.0 && self.machine_risk < 1.0) {
            return Err(invalid("eviction.machine_risk", "must be in (0, 1)"));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is not set.
    pub log_level: String,
    /// Emit JSON-structured log lines.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

fn invalid(field: &str, reason: &str) -> LocusError {
    LocusError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(h) = s.strip_suffix('h') {
            h.parse::<u64>()
                .map(|v| Duration::from_secs(v * 3600))
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }

}
