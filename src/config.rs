//! Engine configuration.
//!
//! All timing and capacity knobs live here so tests can shrink intervals and
//! deployments can load tuned values from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunable parameters for a mesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Hop budget stamped on locally originated messages
    pub max_ttl: u8,
    /// Capacity of the recently-seen message id cache
    pub dedup_cache_size: usize,
    /// How often to broadcast a topology announcement
    pub announce_interval: Duration,
    /// How often to refresh transport advertising/scanning
    pub advertise_interval: Duration,
    /// How often to run the sweep (topology aging, queue expiry, idle sessions)
    pub sweep_interval: Duration,
    /// Silence after which a peer or route is marked stale (unreachable)
    pub silence_window: Duration,
    /// Additional grace after staleness before a record is fully evicted
    pub evict_grace: Duration,
    /// Inactivity after which session key material is torn down
    pub session_idle_timeout: Duration,
    /// Retention deadline for store-and-forward entries
    pub queue_retention: Duration,
    /// Global byte cap for the store-and-forward queue
    pub queue_max_bytes: usize,
    /// Per-destination byte cap for the store-and-forward queue
    pub queue_max_destination_bytes: usize,
    /// Maximum times a queued message may bounce back into the queue
    pub max_retries: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_ttl: crate::protocol::MAX_TTL,
            dedup_cache_size: 4096,
            announce_interval: Duration::from_secs(5),
            advertise_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            silence_window: Duration::from_secs(30),
            evict_grace: Duration::from_secs(300),
            session_idle_timeout: Duration::from_secs(600),
            queue_retention: Duration::from_secs(3600),
            queue_max_bytes: 1024 * 1024,
            queue_max_destination_bytes: 256 * 1024,
            max_retries: 8,
        }
    }
}

impl MeshConfig {
    /// Load configuration from a JSON file, falling back to defaults for
    /// missing fields.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Persist the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = MeshConfig::default();
        assert!(config.max_ttl >= 1);
        assert!(config.queue_max_destination_bytes <= config.queue_max_bytes);
        assert!(config.silence_window < config.evict_grace + config.silence_window);
    }

    #[test]
    fn round_trips_through_json() {
        let config = MeshConfig {
            max_ttl: 3,
            ..MeshConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: MeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_ttl, 3);
        assert_eq!(back.dedup_cache_size, config.dedup_cache_size);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let back: MeshConfig = serde_json::from_str(r#"{"max_ttl": 2}"#).unwrap();
        assert_eq!(back.max_ttl, 2);
        assert_eq!(back.queue_max_bytes, MeshConfig::default().queue_max_bytes);
    }
}
