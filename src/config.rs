//! Config loader (C8, ambient): YAML on disk, validated into the typed
//! `Config` the rest of the engine consumes. Mirrors the two-step
//! raw-then-validated conversion of the teacher's `KeeperConfig`.

use eyre::{eyre, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    verbosity: u8,
    databases: RawDatabases,
    sync: RawSync,
}

#[derive(Debug, Deserialize)]
struct RawDatabases {
    #[serde(rename = "redis-local")]
    redis_local: RawDatabase,
    #[serde(rename = "redis-cloud")]
    redis_cloud: RawDatabase,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RawSync {
    #[serde(default)]
    autostart: bool,
    db_poll_freq: u64,
    time_interval_size: u64,
    #[serde(default = "default_interval_nb")]
    time_interval_nb: i64,
    #[serde(default)]
    time_interval_start_idx: usize,
    key_label_ts: String,
    key_label: String,
    #[serde(default)]
    compaction: RawCompaction,
}

fn default_interval_nb() -> i64 {
    -1
}

#[derive(Debug, Deserialize, Default)]
struct RawCompaction {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_key_suffix")]
    key_suffix: String,
    #[serde(default = "default_bucket_duration")]
    bucket_duration: u64,
    #[serde(default = "default_aggregator")]
    aggregator: String,
}

fn default_key_suffix() -> String {
    "_compacted".to_string()
}

fn default_bucket_duration() -> u64 {
    60_000
}

fn default_aggregator() -> String {
    "avg".to_string()
}

#[derive(Debug, Clone)]
pub struct DatabaseEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub autostart: bool,
    pub db_poll_freq_secs: u64,
    pub time_interval_size: u64,
    pub time_interval_nb: i64,
    pub time_interval_start_idx: usize,
    pub key_label_ts: String,
    pub key_label: String,
    pub compaction: CompactionSettings,
}

#[derive(Debug, Clone)]
pub struct CompactionSettings {
    pub enabled: bool,
    pub key_suffix: String,
    pub bucket_duration_ms: u64,
    pub aggregator: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub verbosity: u8,
    pub redis_local: DatabaseEndpoint,
    pub redis_cloud: DatabaseEndpoint,
    pub sync: SyncConfig,
}

impl Config {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(raw).map_err(|e| eyre!("invalid config: {e}"))?;
        Self::from_raw(raw)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| eyre!("cannot read config file {}: {e}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        if raw.sync.time_interval_size == 0 {
            return Err(eyre!("sync.time_interval_size must be greater than zero"));
        }
        if raw.sync.db_poll_freq == 0 {
            return Err(eyre!("sync.db_poll_freq must be greater than zero"));
        }
        if raw.sync.key_label_ts.trim().is_empty() {
            return Err(eyre!("sync.key_label_ts must not be empty"));
        }
        if raw.sync.key_label.trim().is_empty() {
            return Err(eyre!("sync.key_label must not be empty"));
        }
        if raw.sync.time_interval_nb < -1 {
            return Err(eyre!("sync.time_interval_nb must be -1 or a non-negative count"));
        }

        if raw.sync.db_poll_freq < 5 {
            tracing::warn!(
                db_poll_freq = raw.sync.db_poll_freq,
                "sync.db_poll_freq is unusually low, this will poll the store aggressively"
            );
        }
        if raw.sync.time_interval_size > 7 * 24 * 3_600_000 {
            tracing::warn!(
                time_interval_size = raw.sync.time_interval_size,
                "sync.time_interval_size is larger than a week in milliseconds, resume granularity will be coarse"
            );
        }
        if raw.verbosity > 2 {
            tracing::warn!(verbosity = raw.verbosity, "verbosity above 2 has no additional effect, clamping");
        }

        Ok(Config {
            verbosity: raw.verbosity.min(2),
            redis_local: DatabaseEndpoint {
                host: raw.databases.redis_local.host,
                port: raw.databases.redis_local.port,
            },
            redis_cloud: DatabaseEndpoint {
                host: raw.databases.redis_cloud.host,
                port: raw.databases.redis_cloud.port,
            },
            sync: SyncConfig {
                autostart: raw.sync.autostart,
                db_poll_freq_secs: raw.sync.db_poll_freq,
                time_interval_size: raw.sync.time_interval_size,
                time_interval_nb: raw.sync.time_interval_nb,
                time_interval_start_idx: raw.sync.time_interval_start_idx,
                key_label_ts: raw.sync.key_label_ts,
                key_label: raw.sync.key_label,
                compaction: CompactionSettings {
                    enabled: raw.sync.compaction.enabled,
                    key_suffix: raw.sync.compaction.key_suffix,
                    bucket_duration_ms: raw.sync.compaction.bucket_duration,
                    aggregator: raw.sync.compaction.aggregator,
                },
            },
        })
    }
}

/// `tracing_subscriber::EnvFilter` level implied by the config's verbosity
/// knob, matching the `SeanaticConfig.loglevel` derivation of the source
/// this was distilled from: 0 = warnings only, 1 = info, 2+ = debug.
pub fn verbosity_to_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}
