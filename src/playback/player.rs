use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::engine::{Engine, Shared, StateKind};
use super::PlayerListener;
use crate::config::PlayerConfig;
use crate::core::{lock, Subscription, Time, Topic};
use crate::error::{PlayerError, PlayerResult};
use crate::source::IterableSource;

static NEXT_PLAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Everything the driver needs, held until a listener is registered
struct Setup {
    sources: Vec<Arc<dyn IterableSource>>,
    config: PlayerConfig,
    name: Option<String>,
}

/// Plays one or more logs as a single timeline.
///
/// Control calls only record what was asked for; a background driver task
/// runs the state machine and reports to the listener. The driver starts
/// when [`Player::set_listener`] is called.
pub struct Player {
    id: String,
    shared: Arc<Shared>,
    setup: Mutex<Option<Setup>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    pub fn new(sources: Vec<Arc<dyn IterableSource>>, config: PlayerConfig) -> PlayerResult<Self> {
        if sources.is_empty() {
            return Err(PlayerError::NoSources);
        }
        Ok(Self {
            id: format!("player-{}", NEXT_PLAYER_ID.fetch_add(1, Ordering::Relaxed)),
            shared: Arc::new(Shared::new()),
            setup: Mutex::new(Some(Setup {
                sources,
                config,
                name: None,
            })),
            driver: Mutex::new(None),
        })
    }

    /// Name reported in every snapshot
    pub fn with_name(self, name: impl Into<String>) -> Self {
        if let Some(setup) = lock(&self.setup).as_mut() {
            setup.name = Some(name.into());
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register the listener and start opening the logs. Only one listener
    /// may ever be registered.
    pub fn set_listener<L: PlayerListener + 'static>(&self, listener: L) -> PlayerResult<()> {
        let setup = lock(&self.setup).take();
        let Some(setup) = setup else {
            return Err(if self.shared.control().state == StateKind::Close {
                PlayerError::Closed
            } else {
                PlayerError::ListenerAlreadySet
            });
        };

        let engine = Engine::new(
            self.shared.clone(),
            setup.sources,
            setup.config,
            setup.name,
            self.id.clone(),
            Arc::new(listener),
        );
        self.shared.control().request(StateKind::Initialize);
        *lock(&self.driver) = Some(tokio::spawn(engine.run()));
        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn start_playback(&self) {
        if let Err(e) = self.start_play(None) {
            warn!("Failed to start playback: {}", e);
        }
    }

    /// Play and pause automatically once `time` is reached.
    ///
    /// `time` is clamped into the log span. Fails if it is not after the
    /// current time.
    pub fn play_until(&self, time: Time) -> PlayerResult<()> {
        self.start_play(Some(time))
    }

    fn start_play(&self, until: Option<Time>) -> PlayerResult<()> {
        let mut control = self.shared.control();
        if control.is_playing || control.until_time.is_some() {
            return Ok(());
        }
        if let Some(until) = until {
            if control.current_time.map_or(false, |current| until <= current) {
                return Err(PlayerError::invariant("play-until time must be after the current time"));
            }
            control.until_time = Some(match (control.start_time, control.end_time) {
                (Some(start), Some(end)) => until.clamp_to(start, end),
                _ => until,
            });
        }
        control.is_playing = true;

        // Any other pending state sees `is_playing` once it reaches idle.
        if control.state == StateKind::Idle && control.next_state.map_or(true, |s| s == StateKind::Idle) {
            control.request(StateKind::ResetPlaybackIterator);
            drop(control);
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    pub fn pause_playback(&self) {
        let mut control = self.shared.control();
        if !control.is_playing {
            return;
        }
        control.is_playing = false;
        control.until_time = None;
        control.reset_tick = true;
        if control.state == StateKind::Play {
            control.request(StateKind::Idle);
            drop(control);
            self.shared.wake.notify_one();
        }
    }

    pub fn set_playback_speed(&self, speed: f64) -> PlayerResult<()> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(PlayerError::InvalidSpeed(speed));
        }
        {
            let mut control = self.shared.control();
            control.speed = speed;
            control.reset_tick = true;
        }
        self.shared.refresh.notify_one();
        Ok(())
    }

    /// Jump to `time`, clamped into the log span. Clears any play-until time.
    pub fn seek_playback(&self, time: Time) -> PlayerResult<()> {
        let mut control = self.shared.control();
        if matches!(control.state, StateKind::Preinit | StateKind::Initialize) {
            debug!("Deferring seek to {} until initialized", time);
            control.seek_target = Some(time);
            return Ok(());
        }

        let (Some(start), Some(end)) = (control.start_time, control.end_time) else {
            return Err(PlayerError::invariant("initialized but no start/end set"));
        };
        let target = time.clamp_to(start, end);
        if control.seek_target == Some(target) {
            debug!("Ignoring seek, already seeking to {}", target);
            return Ok(());
        }
        if control.seek_target.is_none() && control.current_time == Some(target) {
            debug!("Ignoring seek, already at {}", target);
            return Ok(());
        }

        control.seek_target = Some(target);
        control.until_time = None;
        control.reset_tick = true;
        if control.request(StateKind::SeekBackfill) {
            drop(control);
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Replace the subscription list.
    ///
    /// When paused, this backfills at the current time so new topics get a
    /// last-known value right away. While playing, the next tick picks the
    /// change up.
    pub fn set_subscriptions(&self, subscriptions: Vec<Subscription>) {
        let mut control = self.shared.control();
        debug!("Set {} subscriptions", subscriptions.len());
        control.subscriptions = subscriptions;
        control.subscription_generation += 1;

        let settled = matches!(control.state, StateKind::Idle | StateKind::SeekBackfill | StateKind::Play);
        if settled && !control.is_playing {
            if let Some(current) = control.current_time {
                control.seek_target.get_or_insert(current);
                control.until_time = None;
                if control.request(StateKind::SeekBackfill) {
                    drop(control);
                    self.shared.wake.notify_one();
                }
            }
        }
    }

    /// Accepted and ignored; logs cannot be published to
    pub fn set_publishers(&self, _topics: Vec<Topic>) {}

    /// Accepted and ignored
    pub fn set_global_variables(&self, _variables: serde_json::Value) {}

    pub fn publish(&self, _topic: &str, _message: serde_json::Value) -> PlayerResult<()> {
        Err(PlayerError::Unsupported("Publishing"))
    }

    pub fn set_parameter(&self, _key: &str, _value: serde_json::Value) -> PlayerResult<()> {
        Err(PlayerError::Unsupported("Parameter editing"))
    }

    pub async fn call_service(&self, _service: &str, _request: serde_json::Value) -> PlayerResult<serde_json::Value> {
        Err(PlayerError::Unsupported("Service calls"))
    }

    /// Release every source and wait for the driver to exit
    pub async fn close(&self) {
        if lock(&self.setup).take().is_some() {
            // Never started; nothing was opened.
            self.shared.control().state = StateKind::Close;
            return;
        }

        if self.shared.control().request(StateKind::Close) {
            self.shared.wake.notify_one();
        }
        let driver = lock(&self.driver).take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!("Player driver exited abnormally: {}", e);
            }
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if self.shared.control().request(StateKind::Close) {
            self.shared.wake.notify_one();
        }
    }
}
