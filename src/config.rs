use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for the player, its buffered sources and block loaders.
///
/// Every field has a default so a config file only needs the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Bytes the block cache aims to stay under
    pub cache_size_bytes: u64,
    /// Upper bound on the number of blocks per log
    pub max_blocks: usize,
    /// Smallest block duration
    pub min_block_duration_ms: u64,
    /// Time given to consumers to subscribe before loaders start
    pub start_delay_ms: u64,
    /// Data time read from the start before the first snapshot
    pub seek_on_start_ms: u64,
    /// Largest amount of data time a single play tick may read
    pub max_tick_ms: f64,
    /// Grace period before a seek reports buffering
    pub seek_ack_timeout_ms: u64,
    /// Grace period before the start-of-playback read reports buffering
    pub start_play_buffering_ms: u64,
    /// Grace period before a play tick reports buffering
    pub tick_buffering_ms: u64,
    /// Progress refresh interval while idle
    pub idle_refresh_ms: u64,
    /// Minimum wall time per play iteration
    pub min_frame_ms: u64,
    /// How far (data time) a playback producer may read ahead
    pub read_ahead_ms: u64,
    /// Byte bound on a playback producer's read-ahead
    pub read_ahead_bytes: usize,
    /// Set to false to disable background block loading
    pub enable_preload: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            // Larger budgets have crashed memory-constrained hosts.
            cache_size_bytes: 1_000_000_000,
            max_blocks: 400,
            min_block_duration_ms: 100,
            start_delay_ms: 100,
            seek_on_start_ms: 99,
            max_tick_ms: 300.0,
            seek_ack_timeout_ms: 100,
            start_play_buffering_ms: 100,
            tick_buffering_ms: 500,
            idle_refresh_ms: 1000,
            min_frame_ms: 16,
            read_ahead_ms: 10_000,
            read_ahead_bytes: 64 * 1024 * 1024,
            enable_preload: true,
        }
    }
}

impl PlayerConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("logplay").join("config.json"))
    }

    /// Load the user's config file, falling back to defaults when it is
    /// missing or unreadable
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match Self::from_path(&path) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!("Ignoring config file {:?}: {:#}", path, e),
                }
            }
        }
        Self::default()
    }

    /// Load a config file, failing on any error
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn min_block_duration(&self) -> Duration {
        Duration::from_millis(self.min_block_duration_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn seek_on_start(&self) -> Duration {
        Duration::from_millis(self.seek_on_start_ms)
    }

    pub fn seek_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_ack_timeout_ms)
    }

    pub fn start_play_buffering(&self) -> Duration {
        Duration::from_millis(self.start_play_buffering_ms)
    }

    pub fn tick_buffering(&self) -> Duration {
        Duration::from_millis(self.tick_buffering_ms)
    }

    pub fn idle_refresh(&self) -> Duration {
        Duration::from_millis(self.idle_refresh_ms)
    }

    pub fn min_frame(&self) -> Duration {
        Duration::from_millis(self.min_frame_ms)
    }

    pub fn read_ahead(&self) -> Duration {
        Duration::from_millis(self.read_ahead_ms)
    }
}
