use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::iterable::{
    BackfillArgs, ConsumptionType, IterableSource, IteratorResult, MessageCursor, MessageIteratorArgs,
};
use crate::core::{lock, CancelToken, Initialization, MessageEvent, Time, TimeRange};
use crate::error::{SourceError, SourceResult};

/// Bounds on how far a producer may run ahead of its consumer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadAheadLimits {
    /// Data time buffered past the consumer's position
    pub duration: Duration,
    pub max_bytes: usize,
}

impl Default for ReadAheadLimits {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Wraps a log source with a read-ahead buffer and a single producer slot.
///
/// Only one producer reads the underlying source at a time. Playback
/// ([`ConsumptionType::Partial`]) cursors and backfills stop whichever
/// producer holds the slot and wait for it to end its cursor first. Full
/// reads never take the slot from a playback producer; they wait until the
/// playback cursor is released. A cursor that loses its producer reopens the
/// source at the point it had reached the next time it runs dry, so
/// preemption never drops or repeats events.
///
/// Cloning is cheap; clones share the slot.
#[derive(Clone)]
pub struct BufferedSource {
    inner: Arc<BufferedInner>,
}

struct BufferedInner {
    source: Arc<dyn IterableSource>,
    limits: ReadAheadLimits,
    span: Mutex<Option<TimeRange>>,
    slot: AsyncMutex<Option<Producer>>,
    /// Signalled whenever the slot is emptied
    released: Notify,
    generation: AtomicU64,
    /// Read-ahead of the current playback cursor, for progress reporting
    playback: Mutex<Option<Weak<ReadAhead>>>,
}

struct Producer {
    generation: u64,
    consumption_type: ConsumptionType,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

impl Producer {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Producer {} did not exit cleanly: {}", self.generation, e);
        }
    }
}

impl BufferedSource {
    pub fn new(source: Arc<dyn IterableSource>, limits: ReadAheadLimits) -> Self {
        Self {
            inner: Arc::new(BufferedInner {
                source,
                limits,
                span: Mutex::new(None),
                slot: AsyncMutex::new(None),
                released: Notify::new(),
                generation: AtomicU64::new(0),
                playback: Mutex::new(None),
            }),
        }
    }

    fn span(&self) -> SourceResult<TimeRange> {
        lock(&self.inner.span).ok_or(SourceError::Uninitialized)
    }

    /// Time ranges currently held in the playback read-ahead.
    ///
    /// Only ranges whose every event has already been read from the source
    /// are reported.
    pub fn loaded_ranges(&self) -> Vec<TimeRange> {
        let Some(buffer) = lock(&self.inner.playback).as_ref().and_then(Weak::upgrade) else {
            return Vec::new();
        };
        let state = buffer.lock();
        match state.read_head {
            Some(read_head) if read_head >= state.head => vec![TimeRange::new(state.head, read_head)],
            _ => Vec::new(),
        }
    }

    /// Stop the active producer, waiting until its cursor is released
    pub async fn stop_producer(&self) {
        let previous = self.inner.slot.lock().await.take();
        if let Some(producer) = previous {
            debug!("Stopping producer {}", producer.generation);
            producer.stop().await;
        }
        self.inner.released.notify_waiters();
    }

    /// Lock the producer slot. Full reads wait while a playback producer
    /// holds it.
    async fn claim_slot(&self, consumption_type: ConsumptionType) -> AsyncMutexGuard<'_, Option<Producer>> {
        loop {
            let released = self.inner.released.notified();
            let slot = self.inner.slot.lock().await;
            let playback_active = slot
                .as_ref()
                .map_or(false, |p| p.consumption_type == ConsumptionType::Partial);
            if consumption_type == ConsumptionType::Partial || !playback_active {
                return slot;
            }
            drop(slot);
            debug!("Full read waiting for playback to release the source");
            released.await;
        }
    }

    /// Stop reading and drop all buffered data
    pub async fn terminate(&self) {
        self.stop_producer().await;
        *lock(&self.inner.playback) = None;
    }

    /// Take the producer slot for a new producer, stopping the previous one
    async fn start_producer(
        &self,
        args: MessageIteratorArgs,
        buffer: Arc<ReadAhead>,
        skip: Skip,
    ) -> SourceResult<(u64, CancelToken)> {
        let span = self.span()?;
        let range_end = args.end.unwrap_or(span.end);

        let consumption_type = args.consumption_type;
        let mut slot = self.claim_slot(consumption_type).await;
        if let Some(previous) = slot.take() {
            debug!("Preempting producer {}", previous.generation);
            previous.stop().await;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancelToken::new();
        if consumption_type == ConsumptionType::Partial {
            *lock(&self.inner.playback) = Some(Arc::downgrade(&buffer));
        }
        debug!("Starting producer {} at {}", generation, args.start);

        let task = tokio::spawn(produce(
            self.inner.source.clone(),
            args,
            buffer,
            cancel.clone(),
            skip,
            range_end,
        ));
        *slot = Some(Producer {
            generation,
            consumption_type,
            cancel: cancel.clone(),
            task,
        });
        Ok((generation, cancel))
    }

    /// Stop the producer only if it is still the one identified by `generation`
    async fn release(&self, generation: u64) {
        let mut slot = self.inner.slot.lock().await;
        if slot.as_ref().map_or(false, |p| p.generation == generation) {
            if let Some(producer) = slot.take() {
                producer.stop().await;
            }
            drop(slot);
            self.inner.released.notify_waiters();
        }
    }

    fn forget_playback(&self, buffer: &Arc<ReadAhead>) {
        let mut playback = lock(&self.inner.playback);
        if playback.as_ref().map_or(false, |w| w.as_ptr() == Arc::as_ptr(buffer)) {
            *playback = None;
        }
    }
}

#[async_trait]
impl IterableSource for BufferedSource {
    async fn initialize(&self) -> SourceResult<Initialization> {
        let initialization = self.inner.source.initialize().await?;
        *lock(&self.inner.span) = Some(TimeRange::new(initialization.start, initialization.end));
        Ok(initialization)
    }

    async fn message_iterator(&self, args: MessageIteratorArgs) -> SourceResult<Box<dyn MessageCursor>> {
        let buffer = ReadAhead::new(args.start, self.inner.limits);
        let (generation, cancel) = self
            .start_producer(args.clone(), buffer.clone(), Skip::none())
            .await?;

        Ok(Box::new(BufferedCursor {
            owner: self.clone(),
            resume: ResumePoint {
                time: args.start,
                delivered: 0,
            },
            args,
            buffer,
            generation,
            cancel,
            finished: false,
        }))
    }

    async fn get_backfill_messages(
        &self,
        args: BackfillArgs,
        cancel: &CancelToken,
    ) -> SourceResult<Vec<MessageEvent>> {
        self.span()?;
        // Hold the slot for the whole backfill so no producer starts meanwhile.
        let mut slot = cancel
            .run_until_cancelled(self.inner.slot.lock())
            .await
            .ok_or(SourceError::Cancelled)?;
        if let Some(previous) = slot.take() {
            debug!("Stopping producer {} for backfill", previous.generation);
            previous.stop().await;
        }
        let result = self.inner.source.get_backfill_messages(args, cancel).await;
        drop(slot);
        self.inner.released.notify_waiters();
        result
    }

    fn is_indexed(&self) -> bool {
        self.inner.source.is_indexed()
    }
}

enum Outcome {
    Running,
    Exhausted,
    Failed(SourceError),
    /// Stopped before reaching the end of its range
    Preempted,
}

struct ReadAheadState {
    items: VecDeque<IteratorResult>,
    bytes: usize,
    outcome: Outcome,
    /// Receive time of the last event handed to the consumer
    head: Time,
    /// Every event at or before this time has been read from the source
    read_head: Option<Time>,
    newest: Option<Time>,
}

/// Queue between one producer task and its cursor
struct ReadAhead {
    state: Mutex<ReadAheadState>,
    readable: Notify,
    writable: Notify,
    limits: ReadAheadLimits,
}

impl ReadAhead {
    fn new(head: Time, limits: ReadAheadLimits) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReadAheadState {
                items: VecDeque::new(),
                bytes: 0,
                outcome: Outcome::Running,
                head,
                read_head: None,
                newest: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            limits,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReadAheadState> {
        lock(&self.state)
    }

    fn is_full(&self) -> bool {
        let state = self.lock();
        state.bytes >= self.limits.max_bytes
            || state
                .newest
                .map_or(false, |newest| newest.duration_since(state.head) > self.limits.duration)
    }

    fn push(&self, item: IteratorResult) {
        {
            let mut state = self.lock();
            let loaded_through = match &item {
                IteratorResult::Stamp(time) => Some(*time),
                IteratorResult::MessageEvent(event) if event.receive_time > Time::ZERO => {
                    Some(event.receive_time.saturating_sub(Duration::from_nanos(1)))
                }
                _ => None,
            };
            if let Some(time) = item.time() {
                state.newest = Some(time);
            }
            if loaded_through > state.read_head {
                state.read_head = loaded_through;
            }
            state.bytes += item.size_in_bytes();
            state.items.push_back(item);
        }
        self.readable.notify_one();
    }

    fn finish(&self, outcome: Outcome, range_end: Time) {
        {
            let mut state = self.lock();
            if matches!(outcome, Outcome::Exhausted) {
                state.read_head = Some(range_end);
            }
            state.outcome = outcome;
        }
        self.readable.notify_one();
    }

    /// Wait until there is room to read more. False if cancelled first.
    async fn wait_for_space(&self, cancel: &CancelToken) -> bool {
        while self.is_full() {
            if cancel.run_until_cancelled(self.writable.notified()).await.is_none() {
                return false;
            }
        }
        true
    }
}

/// Events a resumed producer must drop because the cursor already
/// delivered them before being preempted
#[derive(Debug, Clone, Copy)]
struct Skip {
    time: Time,
    remaining: usize,
}

impl Skip {
    fn none() -> Self {
        Self {
            time: Time::ZERO,
            remaining: 0,
        }
    }

    fn drops(&mut self, item: &IteratorResult) -> bool {
        let IteratorResult::MessageEvent(event) = item else {
            return false;
        };
        if self.remaining > 0 && event.receive_time == self.time {
            self.remaining -= 1;
            return true;
        }
        if event.receive_time > self.time {
            self.remaining = 0;
        }
        false
    }
}

async fn produce(
    source: Arc<dyn IterableSource>,
    args: MessageIteratorArgs,
    buffer: Arc<ReadAhead>,
    cancel: CancelToken,
    mut skip: Skip,
    range_end: Time,
) {
    let mut cursor = match cancel.run_until_cancelled(source.message_iterator(args)).await {
        None => return buffer.finish(Outcome::Preempted, range_end),
        Some(Err(e)) => return buffer.finish(Outcome::Failed(e), range_end),
        Some(Ok(cursor)) => cursor,
    };

    let outcome = loop {
        if !buffer.wait_for_space(&cancel).await {
            break Outcome::Preempted;
        }
        match cancel.run_until_cancelled(cursor.next()).await {
            None => break Outcome::Preempted,
            Some(Ok(Some(item))) => {
                if !skip.drops(&item) {
                    buffer.push(item);
                }
            }
            Some(Ok(None)) => break Outcome::Exhausted,
            Some(Err(e)) if e.is_cancelled() => break Outcome::Preempted,
            Some(Err(e)) => break Outcome::Failed(e),
        }
    };

    if let Err(e) = cursor.end().await {
        warn!("Failed to end source cursor: {}", e);
    }
    buffer.finish(outcome, range_end);
}

/// Where a cursor stands, so a replacement producer can continue from it
#[derive(Debug, Clone, Copy)]
struct ResumePoint {
    time: Time,
    /// Events already delivered with receive time `time`
    delivered: usize,
}

impl ResumePoint {
    fn track(&mut self, item: &IteratorResult) {
        if let IteratorResult::MessageEvent(event) = item {
            if event.receive_time == self.time {
                self.delivered += 1;
            } else {
                self.time = event.receive_time;
                self.delivered = 1;
            }
        }
    }
}

/// Cursor handed out by [`BufferedSource`]
pub struct BufferedCursor {
    owner: BufferedSource,
    args: MessageIteratorArgs,
    buffer: Arc<ReadAhead>,
    generation: u64,
    cancel: CancelToken,
    resume: ResumePoint,
    finished: bool,
}

enum Step {
    Item(IteratorResult),
    Done,
    Fail(SourceError),
    Resume,
    Wait,
}

impl BufferedCursor {
    fn step(&self) -> Step {
        let mut state = self.buffer.lock();
        if let Some(item) = state.items.pop_front() {
            state.bytes = state.bytes.saturating_sub(item.size_in_bytes());
            if let IteratorResult::MessageEvent(event) = &item {
                state.head = event.receive_time;
            }
            return Step::Item(item);
        }
        match std::mem::replace(&mut state.outcome, Outcome::Running) {
            Outcome::Running => Step::Wait,
            Outcome::Exhausted => {
                state.outcome = Outcome::Exhausted;
                Step::Done
            }
            Outcome::Preempted => {
                state.outcome = Outcome::Preempted;
                Step::Resume
            }
            Outcome::Failed(e) => {
                state.outcome = Outcome::Exhausted;
                Step::Fail(e)
            }
        }
    }

    async fn resume(&mut self) -> SourceResult<()> {
        debug!(
            "Resuming preempted cursor at {} (skipping {})",
            self.resume.time, self.resume.delivered
        );
        let args = MessageIteratorArgs {
            start: self.resume.time,
            ..self.args.clone()
        };
        let skip = Skip {
            time: self.resume.time,
            remaining: self.resume.delivered,
        };
        let buffer = ReadAhead::new(self.resume.time, self.owner.inner.limits);
        let (generation, cancel) = self.owner.start_producer(args, buffer.clone(), skip).await?;
        self.buffer = buffer;
        self.generation = generation;
        self.cancel = cancel;
        Ok(())
    }

    async fn finish(&mut self) {
        self.finished = true;
        self.owner.release(self.generation).await;
        self.owner.forget_playback(&self.buffer);
    }
}

#[async_trait]
impl MessageCursor for BufferedCursor {
    async fn next(&mut self) -> SourceResult<Option<IteratorResult>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            match self.step() {
                Step::Item(item) => {
                    self.buffer.writable.notify_one();
                    self.resume.track(&item);
                    return Ok(Some(item));
                }
                Step::Done => {
                    self.finish().await;
                    return Ok(None);
                }
                Step::Fail(e) => {
                    self.finish().await;
                    return Err(e);
                }
                Step::Resume => self.resume().await?,
                Step::Wait => self.buffer.readable.notified().await,
            }
        }
    }

    async fn end(&mut self) -> SourceResult<()> {
        if !self.finished {
            self.finish().await;
        }
        Ok(())
    }
}

impl Drop for BufferedCursor {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.cancel.cancel();
        // The slot still names this cursor's producer; free it for waiting readers.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let owner = self.owner.clone();
            let generation = self.generation;
            handle.spawn(async move { owner.release(generation).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, MockSource};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn topics() -> BTreeSet<String> {
        ["a".to_string()].into_iter().collect()
    }

    /// One event every 100ms over [0s, 2s], with a duplicate timestamp at 1s
    fn messages() -> Vec<MessageEvent> {
        let mut out: Vec<MessageEvent> = (0..=20u64)
            .map(|i| MessageEvent::new("a", Time::from_millis(i * 100), json!(i)))
            .collect();
        out.push(MessageEvent::new("a", Time::from_millis(1000), json!(100)));
        out
    }

    fn args(start: Time, consumption_type: ConsumptionType) -> MessageIteratorArgs {
        MessageIteratorArgs {
            topics: topics(),
            start,
            end: None,
            consumption_type,
        }
    }

    fn tight() -> ReadAheadLimits {
        ReadAheadLimits {
            duration: Duration::ZERO,
            max_bytes: usize::MAX,
        }
    }

    async fn next_event(cursor: &mut Box<dyn MessageCursor>) -> Option<MessageEvent> {
        loop {
            match cursor.next().await.unwrap()? {
                IteratorResult::MessageEvent(event) => return Some(event),
                _ => continue,
            }
        }
    }

    async fn collect(cursor: &mut Box<dyn MessageCursor>) -> Vec<MessageEvent> {
        let mut out = Vec::new();
        while let Some(event) = next_event(cursor).await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_reads_everything_in_order_under_tight_limits() {
        let source = BufferedSource::new(Arc::new(MemorySource::new("m", messages())), tight());
        source.initialize().await.unwrap();

        let mut cursor = source
            .message_iterator(args(Time::ZERO, ConsumptionType::Partial))
            .await
            .unwrap();
        let events = collect(&mut cursor).await;

        assert_eq!(events.len(), 22);
        assert!(events.windows(2).all(|w| w[0].receive_time <= w[1].receive_time));
    }

    #[tokio::test]
    async fn test_uninitialized_source_rejects_reads() {
        let source = BufferedSource::new(Arc::new(MemorySource::new("m", messages())), tight());
        let result = source.message_iterator(args(Time::ZERO, ConsumptionType::Partial)).await;
        assert!(matches!(result, Err(SourceError::Uninitialized)));
    }

    #[tokio::test]
    async fn test_preempted_cursor_resumes_without_gaps_or_repeats() {
        let mock = MockSource::new(messages());
        let stats = mock.stats();
        let source = BufferedSource::new(Arc::new(mock), tight());
        source.initialize().await.unwrap();

        let mut loader = source
            .message_iterator(args(Time::ZERO, ConsumptionType::Full))
            .await
            .unwrap();
        let mut seen = Vec::new();
        for _ in 0..11 {
            seen.push(next_event(&mut loader).await.unwrap());
        }
        assert_eq!(seen.last().unwrap().receive_time, Time::from_millis(1000));

        // Playback takes the slot and runs to completion.
        let mut playback = source
            .message_iterator(args(Time::from_millis(500), ConsumptionType::Partial))
            .await
            .unwrap();
        assert_eq!(collect(&mut playback).await.len(), 17);

        seen.extend(collect(&mut loader).await);
        let values: Vec<u64> = seen.iter().map(|e| e.message.as_u64().unwrap()).collect();
        let mut expected: Vec<u64> = (0..=10).collect();
        expected.push(100);
        expected.extend(11..=20);
        assert_eq!(values, expected);

        loader.end().await.unwrap();
        assert_eq!(stats.open_cursors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_read_waits_for_playback_to_finish() {
        let mock = MockSource::new(messages());
        let stats = mock.stats();
        let source = BufferedSource::new(Arc::new(mock), tight());
        source.initialize().await.unwrap();

        let mut playback = source
            .message_iterator(args(Time::ZERO, ConsumptionType::Partial))
            .await
            .unwrap();
        next_event(&mut playback).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_secs(1),
            source.message_iterator(args(Time::ZERO, ConsumptionType::Full)),
        )
        .await;
        assert!(blocked.is_err());
        // Playback kept its producer.
        assert_eq!(next_event(&mut playback).await.unwrap().message.as_u64(), Some(1));

        let waiting = tokio::spawn({
            let source = source.clone();
            async move {
                let mut loader = source
                    .message_iterator(args(Time::ZERO, ConsumptionType::Full))
                    .await
                    .unwrap();
                collect(&mut loader).await.len()
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        playback.end().await.unwrap();
        assert_eq!(waiting.await.unwrap(), 22);
        assert_eq!(stats.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_dropped_cursor_frees_the_slot() {
        let source = BufferedSource::new(Arc::new(MemorySource::new("m", messages())), tight());
        source.initialize().await.unwrap();

        let mut playback = source
            .message_iterator(args(Time::ZERO, ConsumptionType::Partial))
            .await
            .unwrap();
        next_event(&mut playback).await.unwrap();
        drop(playback);

        let mut loader = source
            .message_iterator(args(Time::ZERO, ConsumptionType::Full))
            .await
            .unwrap();
        assert_eq!(collect(&mut loader).await.len(), 22);
    }

    #[tokio::test]
    async fn test_loaded_ranges_never_run_ahead_of_reads() {
        let limits = ReadAheadLimits {
            duration: Duration::from_millis(500),
            max_bytes: usize::MAX,
        };
        let source = BufferedSource::new(Arc::new(MemorySource::new("m", messages())), limits);
        source.initialize().await.unwrap();
        assert!(source.loaded_ranges().is_empty());

        let mut cursor = source
            .message_iterator(args(Time::ZERO, ConsumptionType::Partial))
            .await
            .unwrap();
        next_event(&mut cursor).await.unwrap();
        tokio::task::yield_now().await;

        for range in source.loaded_ranges() {
            assert!(range.end < Time::from_millis(2000));
            assert!(range.start <= range.end);
        }

        collect(&mut cursor).await;
        // Finished cursors no longer hold a read-ahead.
        assert!(source.loaded_ranges().is_empty());
    }

    #[tokio::test]
    async fn test_full_reads_do_not_report_loaded_ranges() {
        let source = BufferedSource::new(Arc::new(MemorySource::new("m", messages())), Default::default());
        source.initialize().await.unwrap();
        let mut cursor = source
            .message_iterator(args(Time::ZERO, ConsumptionType::Full))
            .await
            .unwrap();
        next_event(&mut cursor).await.unwrap();
        assert!(source.loaded_ranges().is_empty());
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_ends_cursor() {
        let mock = MockSource::new(messages()).with_fault_at(Time::from_millis(300));
        let source = BufferedSource::new(Arc::new(mock), Default::default());
        source.initialize().await.unwrap();

        let mut cursor = source
            .message_iterator(args(Time::ZERO, ConsumptionType::Partial))
            .await
            .unwrap();
        let mut result = Ok(None);
        for _ in 0..10 {
            result = cursor.next().await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(SourceError::Read(_))));
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backfill_stops_active_producer() {
        let mock = MockSource::new(messages());
        let stats = mock.stats();
        let source = BufferedSource::new(Arc::new(mock), tight());
        source.initialize().await.unwrap();

        let mut cursor = source
            .message_iterator(args(Time::ZERO, ConsumptionType::Partial))
            .await
            .unwrap();
        next_event(&mut cursor).await.unwrap();

        let found = source
            .get_backfill_messages(
                BackfillArgs {
                    topics: topics(),
                    time: Time::from_millis(1050),
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message.as_u64(), Some(100));
        assert_eq!(stats.open_cursors(), 0);
    }
}
