use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::block_loader::{BlockCache, BlockLoader};
use super::emitter::Emitter;
use super::{ActiveData, FractionRange, PlayerCapability, PlayerListener, PlayerPresence, PlayerState, Progress};
use crate::config::PlayerConfig;
use crate::core::{
    lock, CancelToken, Initialization, MessageEvent, PreloadType, Problem, ProblemManager, Subscription, Time,
    TimeRange, Topic, TopicStats,
};
use crate::error::{PlayerError, PlayerResult, SourceResult};
use crate::source::{
    BackfillArgs, BufferedSource, ConsumptionType, IterableSource, IteratorResult, MessageCursor,
    MessageIteratorArgs,
};

const GLOBAL_ERROR_KEY: &str = "global-error";

/// Fallback tick duration when there is no previous tick to measure from
const FIRST_TICK: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateKind {
    Preinit,
    Initialize,
    StartPlay,
    Idle,
    SeekBackfill,
    Play,
    ResetPlaybackIterator,
    Close,
}

/// Fields written by the control surface and read by the driver
pub(crate) struct Control {
    pub state: StateKind,
    pub next_state: Option<StateKind>,
    /// Cancelled whenever a new state is requested
    pub cancel: CancelToken,
    pub is_playing: bool,
    pub speed: f64,
    pub start_time: Option<Time>,
    pub end_time: Option<Time>,
    pub current_time: Option<Time>,
    pub seek_target: Option<Time>,
    pub until_time: Option<Time>,
    pub subscriptions: Vec<Subscription>,
    pub subscription_generation: u64,
    /// Forget the previous tick's timing on the next tick
    pub reset_tick: bool,
}

impl Control {
    pub fn new() -> Self {
        Self {
            state: StateKind::Preinit,
            next_state: None,
            cancel: CancelToken::new(),
            is_playing: false,
            speed: 1.0,
            start_time: None,
            end_time: None,
            current_time: None,
            seek_target: None,
            until_time: None,
            subscriptions: Vec::new(),
            subscription_generation: 0,
            reset_tick: false,
        }
    }

    fn closing(&self) -> bool {
        self.state == StateKind::Close || self.next_state == Some(StateKind::Close)
    }

    /// Record an external request and interrupt the running state
    pub fn request(&mut self, next: StateKind) -> bool {
        if self.closing() {
            return false;
        }
        debug!("Requesting state {:?} (current {:?})", next, self.state);
        self.next_state = Some(next);
        self.cancel.cancel();
        self.cancel = CancelToken::new();
        true
    }

    /// Transition chosen by the running state itself. Loses to any pending
    /// external request.
    fn request_internal(&mut self, next: StateKind) {
        if self.next_state.is_none() && !self.closing() {
            self.next_state = Some(next);
        }
    }

    fn bounds(&self) -> PlayerResult<(Time, Time)> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(PlayerError::invariant("start and end are not known")),
        }
    }
}

pub(crate) struct Shared {
    pub control: Mutex<Control>,
    /// Wakes the driver when a state is requested
    pub wake: Notify,
    /// Asks the idle state for a fresh snapshot
    pub refresh: Notify,
    /// Signalled by block loaders after each stored block
    pub progress: Notify,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(Control::new()),
            wake: Notify::new(),
            refresh: Notify::new(),
            progress: Notify::new(),
        }
    }

    pub fn control(&self) -> std::sync::MutexGuard<'_, Control> {
        lock(&self.control)
    }
}

/// One input log and everything the engine holds for it
struct LogSlot {
    source: BufferedSource,
    initialization: Option<Initialization>,
    loader: Option<BlockLoader>,
    cache: Option<watch::Receiver<Option<BlockCache>>>,
    cursor: Option<Box<dyn MessageCursor>>,
    /// Event read past the previous tick's boundary
    carried: Option<MessageEvent>,
}

impl LogSlot {
    fn topics(&self, subscriptions: &[Subscription], full_only: bool) -> BTreeSet<String> {
        let Some(init) = &self.initialization else {
            return BTreeSet::new();
        };
        subscriptions
            .iter()
            .filter(|s| !full_only || s.preload_type == PreloadType::Full)
            .filter(|s| init.has_topic(&s.topic))
            .map(|s| s.topic.clone())
            .collect()
    }

    async fn end_cursor(&mut self, index: usize) {
        self.carried = None;
        if let Some(mut cursor) = self.cursor.take() {
            if let Err(e) = cursor.end().await {
                warn!("Source {}: failed to end cursor: {}", index, e);
            }
        }
    }
}

/// Merged metadata of every log
#[derive(Default)]
struct Catalog {
    topics: Vec<Topic>,
    topic_stats: BTreeMap<String, TopicStats>,
    datatypes: HashMap<String, serde_json::Value>,
    published_topics: BTreeMap<String, BTreeSet<String>>,
}

impl Catalog {
    fn merge(&mut self, init: &Initialization) {
        for topic in &init.topics {
            if !self.topics.iter().any(|t| t.name == topic.name) {
                self.topics.push(topic.clone());
            }
        }
        for (topic, stats) in &init.topic_stats {
            let merged = self.topic_stats.entry(topic.clone()).or_default();
            merged.num_messages += stats.num_messages;
            merged.size_in_bytes += stats.size_in_bytes;
            merged.first_message_time = min_some(merged.first_message_time, stats.first_message_time);
            merged.last_message_time = merged.last_message_time.max(stats.last_message_time);
        }
        for (name, definition) in &init.datatypes {
            self.datatypes.entry(name.clone()).or_insert_with(|| definition.clone());
        }
        for (topic, publishers) in &init.publishers_by_topic {
            self.published_topics
                .entry(topic.clone())
                .or_default()
                .extend(publishers.iter().cloned());
        }
    }
}

/// Earliest start and latest end over every opened log
fn merged_bounds(logs: &[LogSlot]) -> PlayerResult<(Time, Time)> {
    let inits = logs.iter().filter_map(|l| l.initialization.as_ref());
    let start = inits.clone().map(|i| i.start).min().ok_or(PlayerError::NoSources)?;
    let end = inits.map(|i| i.end).max().ok_or(PlayerError::NoSources)?;
    Ok((start, end))
}

/// Data time one play tick covers, in milliseconds: wall time since the last
/// tick scaled by `speed`, capped, then smoothed against the previous tick
fn tick_range_ms(elapsed: Duration, speed: f64, max_tick_ms: f64, previous: Option<f64>) -> f64 {
    let range_ms = (elapsed.as_secs_f64() * 1000.0 * speed).min(max_tick_ms);
    match previous {
        Some(last) => last * 0.9 + range_ms * 0.1,
        None => range_ms,
    }
}

fn min_some(a: Option<Time>, b: Option<Time>) -> Option<Time> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Snapshot bookkeeping, kept apart from the logs so a read can borrow the
/// logs while a slow-read callback updates what is reported
struct Reporter {
    emitter: Emitter,
    name: Option<String>,
    player_id: String,
    presence: PlayerPresence,
    has_error: bool,
    messages: Vec<MessageEvent>,
    problems: ProblemManager,
    received_bytes: u64,
    last_seek_time: DateTime<Utc>,
    catalog: Catalog,
    progress: Progress,
    /// Time reported instead of the current time while a seek is pending
    current_override: Option<Time>,
}

impl Reporter {
    fn emit(&mut self, shared: &Shared) {
        let messages = std::mem::take(&mut self.messages);
        let state = {
            let control = shared.control();
            let active_data = match (self.has_error, control.start_time, control.end_time, control.current_time) {
                (false, Some(start_time), Some(end_time), Some(current_time)) => {
                    self.received_bytes += messages.iter().map(|m| m.size_in_bytes as u64).sum::<u64>();
                    Some(ActiveData {
                        messages,
                        total_bytes_received: self.received_bytes,
                        current_time: self.current_override.unwrap_or(current_time),
                        start_time,
                        end_time,
                        is_playing: control.is_playing,
                        speed: control.speed,
                        last_seek_time: self.last_seek_time,
                        topics: self.catalog.topics.clone(),
                        topic_stats: self.catalog.topic_stats.clone(),
                        datatypes: self.catalog.datatypes.clone(),
                        published_topics: self.catalog.published_topics.clone(),
                    })
                }
                _ => None,
            };
            PlayerState {
                name: self.name.clone(),
                player_id: self.player_id.clone(),
                presence: self.presence,
                progress: self.progress.clone(),
                capabilities: vec![PlayerCapability::SetSpeed, PlayerCapability::PlaybackControl],
                problems: self.problems.problems(),
                active_data,
            }
        };
        self.emitter.queue(state);
    }
}

/// Run `fut`; if it has not finished after `grace`, report through
/// `on_slow` and keep waiting. The grace period never cancels `fut`.
async fn with_buffering<F, S>(fut: F, grace: Duration, reporter: &mut Reporter, shared: &Shared, on_slow: S) -> F::Output
where
    F: Future,
    S: FnOnce(&mut Reporter),
{
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => return out,
        _ = tokio::time::sleep(grace) => {}
    }
    on_slow(reporter);
    reporter.emit(shared);
    fut.await
}

/// Read every log's cursor up to and including `end` and merge the events.
/// `None` if cancelled.
async fn read_until(
    logs: &mut [LogSlot],
    end: Time,
    cancel: &CancelToken,
    problems: &ProblemManager,
) -> PlayerResult<Option<Vec<MessageEvent>>> {
    let mut batch = Vec::new();
    for (index, log) in logs.iter_mut().enumerate() {
        if let Some(carried) = log.carried.take() {
            if carried.receive_time > end {
                log.carried = Some(carried);
                continue;
            }
            batch.push(carried);
        }
        let Some(cursor) = log.cursor.as_mut() else {
            continue;
        };

        loop {
            let Some(result) = cancel.run_until_cancelled(cursor.next()).await else {
                return Ok(None);
            };
            match result? {
                None => break,
                Some(IteratorResult::MessageEvent(event)) => {
                    if event.receive_time > end {
                        log.carried = Some(event);
                        break;
                    }
                    batch.push(event);
                }
                Some(IteratorResult::Problem { connection_id, problem }) => {
                    let connection = connection_id.map_or_else(|| "unknown".to_string(), |id| id.to_string());
                    problems.add_problem(format!("source-{}:connection-{}", index, connection), problem);
                }
                Some(IteratorResult::Stamp(stamp)) => {
                    if stamp >= end {
                        break;
                    }
                }
            }
        }
    }
    batch.sort_by_key(|e| e.receive_time);
    Ok(Some(batch))
}

type BackfillSet = JoinSet<(usize, SourceResult<Vec<MessageEvent>>)>;

/// Gather every log's backfill. `None` if any was cancelled.
async fn collect_backfill(set: &mut BackfillSet, problems: &ProblemManager) -> PlayerResult<Option<Vec<MessageEvent>>> {
    let mut messages = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (index, result) = joined.map_err(|e| PlayerError::invariant(format!("backfill task failed: {}", e)))?;
        let key = format!("source-{}:backfill", index);
        match result {
            Ok(found) => {
                problems.remove_problem(&key);
                messages.extend(found);
            }
            Err(e) if e.is_cancelled() => return Ok(None),
            Err(e) => {
                warn!("Source {}: backfill failed: {}", index, e);
                problems.add_problem(key, Problem::warn("Failed to load messages for seek").with_error(&e));
            }
        }
    }
    messages.sort_by_key(|m| m.receive_time);
    Ok(Some(messages))
}

/// The driver: runs one state body at a time until closed
pub(crate) struct Engine {
    shared: Arc<Shared>,
    config: PlayerConfig,
    logs: Vec<LogSlot>,
    reporter: Reporter,
    seen_subscriptions: u64,
    last_tick: Option<Instant>,
    last_range_ms: Option<f64>,
}

impl Engine {
    pub fn new(
        shared: Arc<Shared>,
        sources: Vec<Arc<dyn IterableSource>>,
        config: PlayerConfig,
        name: Option<String>,
        player_id: String,
        listener: Arc<dyn PlayerListener>,
    ) -> Self {
        let limits = crate::source::ReadAheadLimits {
            duration: config.read_ahead(),
            max_bytes: config.read_ahead_bytes,
        };
        let logs = sources
            .into_iter()
            .map(|source| LogSlot {
                source: BufferedSource::new(source, limits),
                initialization: None,
                loader: None,
                cache: None,
                cursor: None,
                carried: None,
            })
            .collect();

        Self {
            shared,
            config,
            logs,
            reporter: Reporter {
                emitter: Emitter::new(listener),
                name,
                player_id,
                presence: PlayerPresence::NotPresent,
                has_error: false,
                messages: Vec::new(),
                problems: ProblemManager::new(),
                received_bytes: 0,
                last_seek_time: Utc::now(),
                catalog: Catalog::default(),
                progress: Progress::default(),
                current_override: None,
            },
            seen_subscriptions: 0,
            last_tick: None,
            last_range_ms: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            let Some((state, cancel)) = self.take_next_state() else {
                self.shared.wake.notified().await;
                continue;
            };
            debug!("Entering state {:?}", state);

            if state != StateKind::Play {
                self.end_cursors().await;
            }
            if let Err(e) = self.run_state(state, &cancel).await {
                self.set_error(e);
            }
            if state == StateKind::Close {
                break;
            }
        }
        self.reporter.emitter.shutdown().await;
        info!("Player {} closed", self.reporter.player_id);
    }

    fn take_next_state(&mut self) -> Option<(StateKind, CancelToken)> {
        let mut control = self.shared.control();
        let next = control.next_state.take()?;
        if self.reporter.has_error && next != StateKind::Close {
            debug!("Ignoring state {:?} after fatal error", next);
            return None;
        }
        control.state = next;
        Some((next, control.cancel.clone()))
    }

    async fn run_state(&mut self, state: StateKind, cancel: &CancelToken) -> PlayerResult<()> {
        match state {
            StateKind::Preinit => Ok(()),
            StateKind::Initialize => self.initialize(cancel).await,
            StateKind::StartPlay => self.start_play(cancel).await,
            StateKind::Idle => self.idle(cancel).await,
            StateKind::SeekBackfill => {
                let result = self.seek_backfill(cancel).await;
                let mut control = self.shared.control();
                if control.next_state != Some(StateKind::SeekBackfill) {
                    control.seek_target = None;
                }
                result
            }
            StateKind::Play => self.play(cancel).await,
            StateKind::ResetPlaybackIterator => self.reset_playback_iterator().await,
            StateKind::Close => {
                self.close().await;
                Ok(())
            }
        }
    }

    fn set_error(&mut self, e: PlayerError) {
        error!("Playback stopped: {}", e);
        self.reporter.has_error = true;
        self.reporter.presence = PlayerPresence::Error;
        self.reporter
            .problems
            .add_problem(GLOBAL_ERROR_KEY, Problem::error(e.to_string()));
        self.shared.control().is_playing = false;
        self.reporter.emit(&self.shared);
    }

    fn emit(&mut self) {
        self.reporter.emit(&self.shared);
    }

    fn request_internal(&self, next: StateKind) {
        self.shared.control().request_internal(next);
    }

    async fn end_cursors(&mut self) {
        for (index, log) in self.logs.iter_mut().enumerate() {
            log.end_cursor(index).await;
        }
    }

    /// Recreate every log's playback cursor starting at `from`
    async fn open_cursors(&mut self, from: Time) -> PlayerResult<()> {
        let subscriptions = {
            let control = self.shared.control();
            self.seen_subscriptions = control.subscription_generation;
            control.subscriptions.clone()
        };
        self.apply_loader_topics(&subscriptions);

        for (index, log) in self.logs.iter_mut().enumerate() {
            log.end_cursor(index).await;
            let topics = log.topics(&subscriptions, false);
            if topics.is_empty() {
                continue;
            }
            let args = MessageIteratorArgs {
                topics,
                start: from,
                end: None,
                consumption_type: ConsumptionType::Partial,
            };
            log.cursor = Some(log.source.message_iterator(args).await?);
        }
        Ok(())
    }

    fn apply_loader_topics(&self, subscriptions: &[Subscription]) {
        for log in &self.logs {
            if let Some(loader) = &log.loader {
                loader.set_topics(log.topics(subscriptions, true));
            }
        }
    }

    /// Pick up subscription changes. True if they changed since last seen.
    fn apply_subscriptions(&mut self) -> bool {
        let subscriptions = {
            let control = self.shared.control();
            if control.subscription_generation == self.seen_subscriptions {
                return false;
            }
            self.seen_subscriptions = control.subscription_generation;
            control.subscriptions.clone()
        };
        debug!("Subscriptions changed: {} topics", subscriptions.len());
        self.apply_loader_topics(&subscriptions);
        true
    }

    fn update_progress(&mut self) {
        let Ok((start, end)) = self.shared.control().bounds() else {
            return;
        };
        let span = end.as_nanos().saturating_sub(start.as_nanos()) as f64;
        let fraction = |t: Time| {
            if span <= 0.0 {
                return 1.0;
            }
            (t.as_nanos().saturating_sub(start.as_nanos()) as f64 / span).clamp(0.0, 1.0)
        };

        self.reporter.progress = Progress {
            fully_loaded_fraction_ranges: self
                .logs
                .iter()
                .flat_map(|log| log.source.loaded_ranges())
                .map(|r: TimeRange| FractionRange {
                    start: fraction(r.start),
                    end: fraction(r.end),
                })
                .collect(),
            message_cache: self
                .logs
                .iter()
                .filter_map(|log| log.cache.as_ref().and_then(|rx| rx.borrow().clone()))
                .collect(),
        };
    }

    async fn initialize(&mut self, cancel: &CancelToken) -> PlayerResult<()> {
        self.reporter.presence = PlayerPresence::Initializing;
        self.emit();

        let mut set = JoinSet::new();
        for (index, log) in self.logs.iter().enumerate() {
            let source = log.source.clone();
            set.spawn(async move { (index, source.initialize().await) });
        }
        let mut results: Vec<(usize, SourceResult<Initialization>)> = Vec::new();
        let gathered = cancel
            .run_until_cancelled(async {
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok(result) => results.push(result),
                        Err(e) => return Err(PlayerError::invariant(format!("initialize task failed: {}", e))),
                    }
                }
                Ok(())
            })
            .await;
        match gathered {
            None => {
                set.shutdown().await;
                return Ok(());
            }
            Some(outcome) => outcome?,
        }

        results.sort_by_key(|(index, _)| *index);
        for (index, result) in results {
            let init = result.map_err(PlayerError::Initialize)?;
            for (n, problem) in init.problems.iter().enumerate() {
                self.reporter
                    .problems
                    .add_problem(format!("source-{}:init-{}", index, n), problem.clone());
            }
            self.reporter.catalog.merge(&init);
            self.logs[index].initialization = Some(init);
        }

        let (start, end) = merged_bounds(&self.logs)?;
        info!("Opened {} log(s) spanning {} to {}", self.logs.len(), start, end);

        if self.config.enable_preload {
            for (index, log) in self.logs.iter_mut().enumerate() {
                if let Some(init) = &log.initialization {
                    log.loader = Some(BlockLoader::new(
                        index,
                        log.source.clone(),
                        self.reporter.problems.clone(),
                        TimeRange::new(init.start, init.end),
                        &self.config,
                    ));
                }
            }
        }

        {
            let mut control = self.shared.control();
            control.start_time = Some(start);
            control.end_time = Some(end);
            control.current_time = Some(start);
            control.seek_target = control.seek_target.map(|t| t.clamp_to(start, end));
            control.until_time = control.until_time.map(|t| t.clamp_to(start, end));
        }
        self.reporter.presence = PlayerPresence::Present;
        self.emit();

        // Give consumers a moment to subscribe before the loaders pick topics.
        if cancel
            .run_until_cancelled(tokio::time::sleep(self.config.start_delay()))
            .await
            .is_none()
        {
            return Ok(());
        }

        self.apply_subscriptions();
        let subscriptions = self.shared.control().subscriptions.clone();
        self.apply_loader_topics(&subscriptions);
        for log in self.logs.iter_mut() {
            let Some(loader) = &log.loader else {
                continue;
            };
            let (tx, rx) = watch::channel(None);
            let shared = self.shared.clone();
            loader.start_loading(move |cache| {
                tx.send_replace(Some(cache));
                shared.progress.notify_one();
            });
            log.cache = Some(rx);
        }

        self.request_internal(StateKind::StartPlay);
        Ok(())
    }

    async fn start_play(&mut self, cancel: &CancelToken) -> PlayerResult<()> {
        let (start, end, seeking) = {
            let control = self.shared.control();
            let (start, end) = control.bounds()?;
            (start, end, control.seek_target.is_some())
        };
        if seeking {
            self.request_internal(StateKind::SeekBackfill);
            return Ok(());
        }

        let stop = start.add(self.config.seek_on_start()).min(end);
        self.open_cursors(start).await?;
        let problems = self.reporter.problems.clone();
        let read = with_buffering(
            read_until(&mut self.logs, stop, cancel, &problems),
            self.config.start_play_buffering(),
            &mut self.reporter,
            &self.shared,
            |r| r.presence = PlayerPresence::Buffering,
        )
        .await?;
        let Some(batch) = read else {
            return Ok(());
        };

        self.shared.control().current_time = Some(stop);
        self.reporter.messages = batch;
        self.reporter.presence = PlayerPresence::Present;
        self.emit();
        self.request_internal(StateKind::Idle);
        Ok(())
    }

    async fn idle(&mut self, cancel: &CancelToken) -> PlayerResult<()> {
        if self.shared.control().is_playing {
            self.request_internal(StateKind::ResetPlaybackIterator);
            return Ok(());
        }

        self.apply_subscriptions();
        self.reporter.presence = PlayerPresence::Present;
        self.update_progress();
        self.emit();

        let shared = self.shared.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.idle_refresh()) => {}
                _ = shared.progress.notified() => {}
                _ = shared.refresh.notified() => {}
            }
            self.apply_subscriptions();
            self.update_progress();
            self.emit();
        }
    }

    async fn seek_backfill(&mut self, cancel: &CancelToken) -> PlayerResult<()> {
        let (target, subscriptions) = {
            let control = self.shared.control();
            let (start, end) = control.bounds()?;
            let target = control
                .seek_target
                .ok_or_else(|| PlayerError::invariant("seek-backfill entered without a seek target"))?;
            (target.clamp_to(start, end), control.subscriptions.clone())
        };
        self.apply_subscriptions();
        debug!("Seeking to {}", target);

        let mut set: BackfillSet = JoinSet::new();
        for (index, log) in self.logs.iter().enumerate() {
            let topics = log.topics(&subscriptions, false);
            if topics.is_empty() {
                continue;
            }
            let source = log.source.clone();
            let token = cancel.clone();
            set.spawn(async move {
                let args = BackfillArgs { topics, time: target };
                (index, source.get_backfill_messages(args, &token).await)
            });
        }

        let problems = self.reporter.problems.clone();
        let gathered = with_buffering(
            cancel.run_until_cancelled(collect_backfill(&mut set, &problems)),
            self.config.seek_ack_timeout(),
            &mut self.reporter,
            &self.shared,
            |r| {
                r.presence = PlayerPresence::Buffering;
                r.messages.clear();
                r.current_override = Some(target);
            },
        )
        .await;
        self.reporter.current_override = None;

        let messages = match gathered {
            Some(Ok(Some(messages))) => messages,
            Some(Err(e)) => return Err(e),
            Some(Ok(None)) | None => {
                set.shutdown().await;
                return Ok(());
            }
        };

        let is_playing = {
            let mut control = self.shared.control();
            control.current_time = Some(target);
            control.is_playing
        };
        self.last_tick = None;
        self.last_range_ms = None;
        self.reporter.messages = messages;
        self.reporter.last_seek_time = Utc::now();
        self.reporter.presence = PlayerPresence::Present;
        self.emit();

        self.request_internal(if is_playing {
            StateKind::ResetPlaybackIterator
        } else {
            StateKind::Idle
        });
        Ok(())
    }

    async fn reset_playback_iterator(&mut self) -> PlayerResult<()> {
        let (current, is_playing) = {
            let control = self.shared.control();
            let current = control
                .current_time
                .ok_or_else(|| PlayerError::invariant("no current time to resume from"))?;
            (current, control.is_playing)
        };
        self.open_cursors(current.next()).await?;
        self.request_internal(if is_playing { StateKind::Play } else { StateKind::Idle });
        Ok(())
    }

    async fn play(&mut self, cancel: &CancelToken) -> PlayerResult<()> {
        self.reporter.presence = PlayerPresence::Present;
        loop {
            {
                let mut control = self.shared.control();
                if !control.is_playing || control.next_state.is_some() {
                    control.request_internal(StateKind::Idle);
                    break;
                }
                let (_, end) = control.bounds()?;
                if control.current_time.map_or(false, |t| t >= end) {
                    debug!("Reached end of playback");
                    control.is_playing = false;
                    control.until_time = None;
                    control.request_internal(StateKind::Idle);
                    drop(control);
                    self.last_tick = None;
                    self.last_range_ms = None;
                    break;
                }
            }

            let frame_start = Instant::now();
            self.tick(cancel).await?;
            if cancel.is_cancelled() {
                break;
            }
            self.update_progress();

            let elapsed = frame_start.elapsed();
            let min_frame = self.config.min_frame();
            if elapsed < min_frame {
                cancel
                    .run_until_cancelled(tokio::time::sleep(min_frame - elapsed))
                    .await;
            }
        }
        Ok(())
    }

    async fn tick(&mut self, cancel: &CancelToken) -> PlayerResult<()> {
        let (start, current, bound, until, speed) = {
            let mut control = self.shared.control();
            let (start, end) = control.bounds()?;
            let current = control
                .current_time
                .ok_or_else(|| PlayerError::invariant("tick without a current time"))?;
            if std::mem::take(&mut control.reset_tick) {
                self.last_tick = None;
                self.last_range_ms = None;
            }
            (start, current, control.until_time.unwrap_or(end), control.until_time, control.speed)
        };

        let now = Instant::now();
        let elapsed = self.last_tick.map_or(FIRST_TICK, |last| now.duration_since(last));
        self.last_tick = Some(now);

        let range_ms = tick_range_ms(elapsed, speed, self.config.max_tick_ms, self.last_range_ms);
        self.last_range_ms = Some(range_ms);

        let advanced = current.add(Duration::from_secs_f64(range_ms.max(0.0) / 1000.0));
        let tick_end = advanced.max(current.next()).clamp_to(start, bound);

        if self.apply_subscriptions() {
            debug!("Recreating cursors for new subscriptions");
            self.open_cursors(current.next()).await?;
        }

        let problems = self.reporter.problems.clone();
        let read = with_buffering(
            read_until(&mut self.logs, tick_end, cancel, &problems),
            self.config.tick_buffering(),
            &mut self.reporter,
            &self.shared,
            |r| r.presence = PlayerPresence::Buffering,
        )
        .await?;
        let Some(batch) = read else {
            return Ok(());
        };

        self.reporter.presence = PlayerPresence::Present;
        // The previous batch must reach the listener before this one.
        self.reporter.emitter.flush().await;
        {
            let mut control = self.shared.control();
            control.current_time = Some(tick_end);
            if until.map_or(false, |until| tick_end >= until) {
                debug!("Reached play-until time {}", tick_end);
                control.is_playing = false;
                control.until_time = None;
                control.request_internal(StateKind::Idle);
            }
        }
        self.reporter.messages = batch;
        self.emit();
        Ok(())
    }

    async fn close(&mut self) {
        self.shared.control().is_playing = false;
        for (index, log) in self.logs.iter_mut().enumerate() {
            if let Some(loader) = &log.loader {
                loader.stop_loading().await;
            }
            log.end_cursor(index).await;
            log.source.terminate().await;
        }
        self.reporter.presence = PlayerPresence::NotPresent;
        self.emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_range_is_capped() {
        assert_eq!(tick_range_ms(Duration::from_secs(1), 1.0, 300.0, None), 300.0);
        assert!((tick_range_ms(Duration::from_secs(1), 0.1, 300.0, None) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_tick_range_scales_with_speed() {
        let range = tick_range_ms(Duration::from_millis(20), 10.0, 300.0, None);
        assert!((range - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_tick_range_is_smoothed_against_previous() {
        // 90% of the previous 100ms plus 10% of this tick's 20ms
        let range = tick_range_ms(Duration::from_millis(20), 1.0, 300.0, Some(100.0));
        assert!((range - 92.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_opened_logs_has_no_bounds() {
        assert!(matches!(merged_bounds(&[]), Err(PlayerError::NoSources)));
    }
}
