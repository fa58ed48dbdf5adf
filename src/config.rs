//! Node configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! file (or no file) yields a working node. Durations are whole seconds.
//!
//! ```toml
//! realm = "home-lab"
//! bind = "0.0.0.0:50305"
//!
//! [sync]
//! proof_policy = "required"
//! interval_secs = 120
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::ratelimit::RateLimitConfig;
use crate::sync::ProofPolicy;

pub const DEFAULT_REALM: &str = "default";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatClass {
    #[default]
    Unknown,
    Open,
    Restricted,
    Symmetric,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub realm: String,
    pub bind: SocketAddr,
    /// Where `identity.key`, the transport certificate and pins live.
    /// `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Overlay address put in the descriptor. Derived from `bind` when unset.
    pub advertise_addr: Option<SocketAddr>,
    /// Reported in diagnostics only; nothing is probed.
    pub nat_class: NatClass,
    pub key_exportable: bool,
    pub descriptor_ttl_secs: u64,
    pub republish_interval_secs: u64,
    pub dht_k: usize,
    pub dht_alpha: usize,
    pub max_frame_len: usize,
    pub request_timeout_secs: u64,
    pub replay: ReplayConfig,
    pub rate_limits: RateLimitConfig,
    pub search: SearchConfig,
    pub sync: SyncConfig,
    pub gossip: GossipConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub ttl_secs: u64,
    pub max_per_peer: usize,
    pub cleanup_interval_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_query_len: usize,
    pub time_cap_ms: u64,
    pub max_results: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_delta_entries: usize,
    pub proof_policy: ProofPolicy,
    pub proof_timeout_secs: u64,
    pub interval_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub default_ttl_secs: u64,
    pub default_max_hops: u32,
    pub seen_cache_size: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            realm: DEFAULT_REALM.to_string(),
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            data_dir: None,
            advertise_addr: None,
            nat_class: NatClass::Unknown,
            key_exportable: true,
            descriptor_ttl_secs: 2 * 60 * 60,
            republish_interval_secs: 30 * 60,
            dht_k: 20,
            dht_alpha: 3,
            max_frame_len: crate::frame::DEFAULT_MAX_FRAME_LEN,
            request_timeout_secs: 10,
            replay: ReplayConfig::default(),
            rate_limits: RateLimitConfig::default(),
            search: SearchConfig::default(),
            sync: SyncConfig::default(),
            gossip: GossipConfig::default(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10 * 60,
            max_per_peer: 1024,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_query_len: 256,
            time_cap_ms: 5_000,
            max_results: 200,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_delta_entries: 500,
            proof_policy: ProofPolicy::Required,
            proof_timeout_secs: 10,
            interval_secs: 5 * 60,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 5 * 60,
            default_max_hops: 6,
            seen_cache_size: 4096,
        }
    }
}

impl MeshConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, MeshError> {
        let config: MeshConfig =
            toml::from_str(s).map_err(|e| MeshError::fatal(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, MeshError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MeshError::fatal(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if self.realm.trim().is_empty() {
            return Err(MeshError::fatal("realm must not be empty"));
        }
        if self.republish_interval_secs == 0 {
            return Err(MeshError::fatal("republish interval must be positive"));
        }
        if self.descriptor_ttl_secs <= self.republish_interval_secs {
            return Err(MeshError::fatal(
                "descriptor ttl must exceed the republish interval",
            ));
        }
        if self.dht_k == 0 || self.dht_alpha == 0 {
            return Err(MeshError::fatal("dht_k and dht_alpha must be positive"));
        }
        if self.replay.max_per_peer == 0 || self.gossip.seen_cache_size == 0 {
            return Err(MeshError::fatal("cache sizes must be positive"));
        }
        if self.sync.max_delta_entries == 0 {
            return Err(MeshError::fatal("sync page size must be positive"));
        }
        if self.search.max_results == 0 || self.search.max_query_len == 0 {
            return Err(MeshError::fatal("search limits must be positive"));
        }
        if self.max_frame_len < crate::frame::FRAME_HEADER_LEN {
            return Err(MeshError::fatal("max frame length too small"));
        }
        Ok(())
    }

    pub fn descriptor_ttl(&self) -> Duration {
        Duration::from_secs(self.descriptor_ttl_secs)
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_secs(self.republish_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ReplayConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl SearchConfig {
    pub fn time_cap(&self) -> Duration {
        Duration::from_millis(self.time_cap_ms)
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn proof_timeout(&self) -> Duration {
        Duration::from_secs(self.proof_timeout_secs)
    }
}

impl GossipConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}
