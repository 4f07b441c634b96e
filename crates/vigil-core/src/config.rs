//! Configuration system for Vigil.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VIGIL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/vigil/config.toml
//!   3. ~/.config/vigil/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub identity: IdentityConfig,
    pub stream: StreamConfig,
    pub datagram: DatagramConfig,
    pub router: RouterConfig,
    pub partner: PartnerConfig,
    pub reputation: ReputationConfig,
    pub pool: WorkerPoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Local identity key, e.g. "TCP:[10.4.0.1]:9729".
    pub local_key: String,
    /// Directory for the identity/agreement database blobs.
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// TCP port the channel accept loop listens on. 0 = OS-assigned.
    pub listen_port: u16,
    /// Ceiling on simultaneously associated primary channels. Sends past
    /// the ceiling fail synchronously with a backpressure error.
    pub max_channels: usize,
    /// Outbound connect attempt timeout.
    pub connect_timeout_ms: u64,
    /// Idle time after which a channel half-closes its output.
    pub channel_idle_ms: u64,
    /// No-activity time after which a channel with queued sends is
    /// considered hung and aborted.
    pub channel_hung_ms: u64,
    /// How long a half-closed channel keeps reading before giving up.
    pub drain_input_ms: u64,
    /// Upper bound on the writer's queue wait, so idle deadlines are
    /// observed even when nothing arrives.
    pub send_wakeup_ms: u64,
    /// Period of the hung-channel scan.
    pub hung_check_ms: u64,
    /// Incoming messages larger than this abort the channel.
    pub max_message_size: u64,
    /// Messages at or above this size are spooled to a temp file.
    pub min_file_message_size: u64,
    /// Directory for spooled message payloads.
    pub message_dir: PathBuf,
    /// Per-peer ceiling on received messages.
    pub receive_rate: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatagramConfig {
    /// IPv4 multicast group. Empty = multicast disabled.
    pub group: String,
    pub multicast_port: u16,
    pub unicast_port: u16,
    /// Destination port for unicast sends. 0 = same as `unicast_port`.
    pub unicast_send_port: u16,
    /// Open a second multicast socket and only accept packets seen on
    /// both, to reject unicast spoofed at the multicast port.
    pub verify_multicast: bool,
    /// Entries kept in the multicast verification cache.
    pub verify_cache_size: usize,
    /// gzip packets at or above `compress_min` bytes.
    pub compress: bool,
    pub compress_min: usize,
    /// Stop multicast sends after this long without seeing our own
    /// packets come back.
    pub multicast_muzzle_after_ms: u64,
    /// When muzzled, loop normally-multicast packets back locally so
    /// handlers still run.
    pub loopback_if_muzzled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Beacon period. 0 = no beacon.
    pub beacon_interval_ms: u64,
    /// Hop count stamped on originated messages.
    pub initial_hop_count: u8,
    /// Probability of admitting a message originator to the partner list.
    pub partner_add_probability: f64,
    /// Entries kept in the duplicate-verifier cache.
    pub dup_cache_size: usize,
    /// Reseed partners from the default list after this long without a
    /// packet from any non-partner.
    pub partner_refresh_interval_ms: u64,
    /// Ceiling on originated messages.
    pub originate_rate: RateLimitConfig,
    /// Ceiling on forwarded messages.
    pub forward_rate: RateLimitConfig,
}

/// An events-per-interval ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub events: u32,
    pub interval_ms: u64,
}

impl RateLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartnerConfig {
    /// Ceiling on partner-list membership.
    pub max_partners: usize,
    /// Peers seen via multicast within this window are not admitted —
    /// multicast already reaches them.
    pub recent_multicast_ms: u64,
    /// Minimum spacing between evictions.
    pub min_eviction_interval_ms: u64,
    /// Identity keys consulted when the partner list runs empty.
    pub default_partners: Vec<String>,
}

/// Signed reputation deltas per event kind, plus the per-event magnitude cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub max_delta: i32,
    pub agree_vote: i32,
    pub disagree_vote: i32,
    pub call_internal: i32,
    pub spoof_detected: i32,
    pub replay_detected: i32,
    pub attack_detected: i32,
    pub vote_verified: i32,
    pub vote_not_verified: i32,
    pub vote_disowned: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Runtime worker threads.
    pub min_threads: usize,
    /// Ceiling on blocking helper threads.
    pub max_blocking_threads: usize,
    /// Idle thread reap timeout.
    pub keepalive_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            stream: StreamConfig::default(),
            datagram: DatagramConfig::default(),
            router: RouterConfig::default(),
            partner: PartnerConfig::default(),
            reputation: ReputationConfig::default(),
            pool: WorkerPoolConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            local_key: "TCP:[127.0.0.1]:9729".to_string(),
            state_dir: data_dir().join("state"),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            listen_port: 9729,
            max_channels: 50,
            connect_timeout_ms: 120_000,
            channel_idle_ms: 120_000,
            channel_hung_ms: 180_000,
            drain_input_ms: 10_000,
            send_wakeup_ms: 60_000,
            hung_check_ms: 30_000,
            max_message_size: 1024 * 1024 * 1024,
            min_file_message_size: 1024,
            message_dir: data_dir().join("messages"),
            receive_rate: RateLimitConfig {
                events: 600,
                interval_ms: 60_000,
            },
        }
    }
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            group: "239.64.8.33".to_string(),
            multicast_port: 9731,
            unicast_port: 9730,
            unicast_send_port: 0,
            verify_multicast: false,
            verify_cache_size: 100,
            compress: false,
            compress_min: 512,
            multicast_muzzle_after_ms: 600_000,
            loopback_if_muzzled: true,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            beacon_interval_ms: 0,
            initial_hop_count: 2,
            partner_add_probability: 0.5,
            dup_cache_size: 100,
            partner_refresh_interval_ms: 4 * 60 * 60 * 1000,
            originate_rate: RateLimitConfig {
                events: 40,
                interval_ms: 1_000,
            },
            forward_rate: RateLimitConfig {
                events: 40,
                interval_ms: 10_000,
            },
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            events: 40,
            interval_ms: 1_000,
        }
    }
}

impl Default for PartnerConfig {
    fn default() -> Self {
        Self {
            max_partners: 6,
            recent_multicast_ms: 90_000,
            min_eviction_interval_ms: 10_000,
            default_partners: Vec::new(),
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            max_delta: 100,
            agree_vote: 100,
            disagree_vote: -150,
            call_internal: 100,
            spoof_detected: -30,
            replay_detected: -20,
            attack_detected: -500,
            vote_verified: 40,
            vote_not_verified: -30,
            vote_disowned: -400,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 3,
            max_blocking_threads: 150,
            keepalive_ms: 60_000,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("vigil")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("vigil")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl VigilConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            VigilConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VIGIL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&VigilConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply VIGIL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VIGIL_IDENTITY__LOCAL_KEY") {
            self.identity.local_key = v;
        }
        if let Ok(v) = std::env::var("VIGIL_STREAM__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.stream.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("VIGIL_STREAM__MAX_CHANNELS") {
            if let Ok(n) = v.parse() {
                self.stream.max_channels = n;
            }
        }
        if let Ok(v) = std::env::var("VIGIL_DATAGRAM__GROUP") {
            self.datagram.group = v;
        }
        if let Ok(v) = std::env::var("VIGIL_DATAGRAM__UNICAST_PORT") {
            if let Ok(p) = v.parse() {
                self.datagram.unicast_port = p;
            }
        }
        if let Ok(v) = std::env::var("VIGIL_DATAGRAM__COMPRESS") {
            self.datagram.compress = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("VIGIL_ROUTER__BEACON_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.router.beacon_interval_ms = ms;
            }
        }
    }
}
