use std::time::Duration;

use pixelgrid_shared::codec::DEFAULT_MAX_BATCH;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CACHE_MAX_PIXELS: usize = 500_000;
pub const DEFAULT_AUTOSAVE_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_OFFLINE_QUEUE_LIMIT: usize = 10_000;
pub const DEFAULT_OFFLINE_FLUSH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_INGEST_CAPACITY: usize = 100;
pub const DEFAULT_INGEST_THROTTLE_MS: i64 = 16;
pub const DEFAULT_DIRTY_MARGIN: u16 = 2;
pub const DEFAULT_LOADER_BATCH_SIZE: usize = 1_000;
pub const DEFAULT_LOADER_MAX_PIXELS: usize = 100_000;
pub const DEFAULT_LOADER_YIELD_EVERY: usize = 4;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Storage metadata item listing the sectors that have a persisted snapshot.
pub const ACTIVE_SECTORS_ITEM: &str = "active_sectors";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Resident pixel budget enforced by `optimize_cache`.
    pub cache_max_pixels: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_max_pixels: DEFAULT_CACHE_MAX_PIXELS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identifies this device; remote updates carrying it are loopback and ignored.
    pub user_id: String,
    pub autosave_interval_ms: u64,
    /// Autosave waits until no local edit happened for this long.
    pub save_debounce_ms: u64,
    pub send_batch_size: usize,
    /// Maximum number of updates held while offline. Oldest are compacted away first.
    pub offline_queue_limit: usize,
    pub offline_flush_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            autosave_interval_ms: DEFAULT_AUTOSAVE_INTERVAL_MS,
            save_debounce_ms: DEFAULT_SAVE_DEBOUNCE_MS,
            send_batch_size: DEFAULT_MAX_BATCH,
            offline_queue_limit: DEFAULT_OFFLINE_QUEUE_LIMIT,
            offline_flush_interval_ms: DEFAULT_OFFLINE_FLUSH_INTERVAL_MS,
        }
    }
}

impl SyncConfig {
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }

    pub fn offline_flush_interval(&self) -> Duration {
        Duration::from_millis(self.offline_flush_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub capacity: usize,
    pub throttle_ms: i64,
    /// Padding added around the coalesced dirty rectangle.
    pub dirty_margin: u16,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_INGEST_CAPACITY,
            throttle_ms: DEFAULT_INGEST_THROTTLE_MS,
            dirty_margin: DEFAULT_DIRTY_MARGIN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub max_pixels: usize,
    /// Sectors processed between cooperative yields in range/preload loads.
    pub yield_every: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_LOADER_BATCH_SIZE,
            max_pixels: DEFAULT_LOADER_MAX_PIXELS,
            yield_every: DEFAULT_LOADER_YIELD_EVERY,
        }
    }
}

/// Bounded exponential backoff for transport reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_RECONNECT_BASE_MS,
            max_ms: DEFAULT_RECONNECT_MAX_MS,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exponent = (attempt - 1).min(16);
        let delay = self.base_ms.saturating_mul(1u64 << exponent).min(self.max_ms);
        Some(Duration::from_millis(delay))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub ingest: IngestConfig,
    pub loader: LoaderConfig,
    pub reconnect: ReconnectPolicy,
}

impl EngineConfig {
    /// Defaults with selected values overridden from `PIXELGRID_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_positive("PIXELGRID_CACHE_MAX_PIXELS") {
            config.store.cache_max_pixels = value;
        }
        if let Some(value) = env_positive("PIXELGRID_AUTOSAVE_INTERVAL_MS") {
            config.sync.autosave_interval_ms = value;
        }
        if let Some(value) = env_positive("PIXELGRID_SAVE_DEBOUNCE_MS") {
            config.sync.save_debounce_ms = value;
        }
        if let Some(value) = env_positive("PIXELGRID_SEND_BATCH_SIZE") {
            config.sync.send_batch_size = value;
        }
        if let Some(value) = env_positive("PIXELGRID_OFFLINE_QUEUE_LIMIT") {
            config.sync.offline_queue_limit = value;
        }
        if let Some(value) = env_positive("PIXELGRID_INGEST_CAPACITY") {
            config.ingest.capacity = value;
        }
        if let Some(value) = env_positive("PIXELGRID_LOADER_BATCH_SIZE") {
            config.loader.batch_size = value;
        }
        if let Ok(user_id) = std::env::var("PIXELGRID_USER_ID") {
            let user_id = user_id.trim();
            if !user_id.is_empty() {
                config.sync.user_id = user_id.to_string();
            }
        }
        config
    }
}

fn env_positive<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}
