pub mod block_loader;
mod emitter;
mod engine;
pub mod player;


pub use block_loader::{BlockCache, BlockLayout, BlockLoader, MessageBlock};
pub use player::Player;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{MessageEvent, Problem, Time, Topic, TopicStats};

/// Coarse operational status of a player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayerPresence {
    Initializing,
    Present,
    Buffering,
    Reconnecting,
    Error,
    NotPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayerCapability {
    SetSpeed,
    PlaybackControl,
}

/// Part of the merged span, as fractions in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FractionRange {
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    /// Ranges held in the playback read-ahead of any log
    pub fully_loaded_fraction_ranges: Vec<FractionRange>,
    /// One entry per log with a running block loader
    pub message_cache: Vec<BlockCache>,
}

/// Playback data of a snapshot; absent until the logs are open and while
/// the player is in error
#[derive(Debug, Clone, Serialize)]
pub struct ActiveData {
    /// Events delivered since the previous snapshot, ordered by receive time
    pub messages: Vec<MessageEvent>,
    pub total_bytes_received: u64,
    pub current_time: Time,
    pub start_time: Time,
    pub end_time: Time,
    pub is_playing: bool,
    pub speed: f64,
    /// Changes whenever a seek completes; consumers drop derived state then
    pub last_seek_time: DateTime<Utc>,
    pub topics: Vec<Topic>,
    pub topic_stats: BTreeMap<String, TopicStats>,
    pub datatypes: HashMap<String, Value>,
    pub published_topics: BTreeMap<String, BTreeSet<String>>,
}

/// Snapshot handed to the listener. Never mutated after delivery.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerState {
    pub name: Option<String>,
    pub player_id: String,
    pub presence: PlayerPresence,
    pub progress: Progress,
    pub capabilities: Vec<PlayerCapability>,
    pub problems: Vec<Problem>,
    pub active_data: Option<ActiveData>,
}

impl PlayerState {
    pub fn current_time(&self) -> Option<Time> {
        self.active_data.as_ref().map(|a| a.current_time)
    }

    pub fn is_playing(&self) -> bool {
        self.active_data.as_ref().map_or(false, |a| a.is_playing)
    }

    pub fn messages(&self) -> &[MessageEvent] {
        self.active_data.as_ref().map_or(&[], |a| a.messages.as_slice())
    }
}

/// Receiver of player snapshots.
///
/// Deliveries never overlap; the next snapshot is handed over only after
/// `on_state` returns.
#[async_trait]
pub trait PlayerListener: Send + Sync {
    async fn on_state(&self, state: PlayerState);
}

#[async_trait]
impl PlayerListener for mpsc::Sender<PlayerState> {
    async fn on_state(&self, state: PlayerState) {
        if self.send(state).await.is_err() {
            debug!("Listener channel closed, dropping snapshot");
        }
    }
}

#[async_trait]
impl PlayerListener for mpsc::UnboundedSender<PlayerState> {
    async fn on_state(&self, state: PlayerState) {
        if self.send(state).is_err() {
            debug!("Listener channel closed, dropping snapshot");
        }
    }
}
