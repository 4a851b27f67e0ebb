use crate::message::ServerId;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Immutable per-participant configuration, threaded by reference into the
/// driver and its processors.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// This server's identity. Required, unique within the ensemble.
    pub server_id: ServerId,
    /// Peer addresses keyed by server id. May be empty for an uninitialized
    /// server which will `join` an existing cluster.
    #[serde(default)]
    pub servers: BTreeMap<ServerId, String>,
    /// Directory holding the transaction log, epoch files and lock file.
    pub logdir: PathBuf,
    /// Drives heartbeats, discovery deadlines and the failure detector.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    /// Upper bound on proposals persisted per log sync.
    #[serde(default = "default_sync_max_batch_size")]
    pub sync_max_batch_size: usize,
    /// Size at which the active log segment is rolled.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
    /// Depth of the bounded queues between the driver and its processors.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_sync_max_batch_size() -> usize {
    64
}

fn default_segment_max_bytes() -> u64 {
    64 << 20
}

fn default_queue_depth() -> usize {
    1_024
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("server_id must not be empty")]
    EmptyServerId,
    #[error("server {0:?} has an empty address")]
    EmptyAddress(ServerId),
    #[error("timeout must be non-zero")]
    ZeroTimeout,
    #[error("sync_max_batch_size must be non-zero")]
    ZeroBatchSize,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.is_empty() {
            return Err(ConfigError::EmptyServerId);
        }
        for (id, addr) in &self.servers {
            if addr.is_empty() {
                return Err(ConfigError::EmptyAddress(id.clone()));
            }
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.sync_max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }

    /// Heartbeat emission period: a third of the failure-detection timeout,
    /// so a peer sees several beats before declaring us dead.
    pub fn heartbeat_period(&self) -> Duration {
        self.timeout / 3
    }
}
