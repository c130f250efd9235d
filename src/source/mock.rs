use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::iterable::{BackfillArgs, IterableSource, IteratorResult, MessageCursor, MessageIteratorArgs};
use super::memory::MemorySource;
use crate::core::{CancelToken, Initialization, MessageEvent, Problem, Time};
use crate::error::{SourceError, SourceResult};

/// Mock log source for testing without files
///
/// Wraps a [`MemorySource`] and can inject latency, transient problems and
/// unrecoverable read faults. Every call is counted so tests can verify when
/// (and whether) the source is read.
pub struct MockSource {
    inner: MemorySource,
    stats: Arc<MockStats>,
    initialize_delay: Duration,
    backfill_delay: Duration,
    event_delay: Duration,
    problems_at: Vec<Time>,
    faults_at: Vec<Time>,
    fail_initialize: Option<String>,
}

/// Call counters shared between a mock source and its cursors
#[derive(Debug, Default)]
pub struct MockStats {
    pub initialize_calls: AtomicU64,
    pub cursors_opened: AtomicU64,
    pub open_cursors: AtomicI64,
    pub next_calls: AtomicU64,
    pub backfill_calls: AtomicU64,
}

impl MockStats {
    /// Total read operations issued against the source
    pub fn reads(&self) -> u64 {
        self.cursors_opened.load(Ordering::SeqCst)
            + self.next_calls.load(Ordering::SeqCst)
            + self.backfill_calls.load(Ordering::SeqCst)
    }

    pub fn open_cursors(&self) -> i64 {
        self.open_cursors.load(Ordering::SeqCst)
    }
}

impl MockSource {
    pub fn new(messages: Vec<MessageEvent>) -> Self {
        Self::from_memory(MemorySource::new("mock", messages))
    }

    pub fn from_memory(inner: MemorySource) -> Self {
        Self {
            inner,
            stats: Arc::new(MockStats::default()),
            initialize_delay: Duration::ZERO,
            backfill_delay: Duration::ZERO,
            event_delay: Duration::ZERO,
            problems_at: Vec::new(),
            faults_at: Vec::new(),
            fail_initialize: None,
        }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    pub fn with_initialize_delay(mut self, delay: Duration) -> Self {
        self.initialize_delay = delay;
        self
    }

    pub fn with_backfill_delay(mut self, delay: Duration) -> Self {
        self.backfill_delay = delay;
        self
    }

    /// Delay applied to every cursor advance
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Yield a transient problem just before the event at `time`
    pub fn with_problem_at(mut self, time: Time) -> Self {
        self.problems_at.push(time);
        self
    }

    /// Fail unrecoverably when a cursor reaches the event at `time`
    pub fn with_fault_at(mut self, time: Time) -> Self {
        self.faults_at.push(time);
        self
    }

    pub fn with_initialize_failure(mut self, message: impl Into<String>) -> Self {
        self.fail_initialize = Some(message.into());
        self
    }
}

#[async_trait]
impl IterableSource for MockSource {
    async fn initialize(&self) -> SourceResult<Initialization> {
        self.stats.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if !self.initialize_delay.is_zero() {
            tokio::time::sleep(self.initialize_delay).await;
        }
        if let Some(message) = &self.fail_initialize {
            return Err(SourceError::Initialization(message.clone()));
        }
        self.inner.initialize().await
    }

    async fn message_iterator(&self, args: MessageIteratorArgs) -> SourceResult<Box<dyn MessageCursor>> {
        self.stats.cursors_opened.fetch_add(1, Ordering::SeqCst);
        let start = args.start;
        let inner = self.inner.message_iterator(args).await?;
        self.stats.open_cursors.fetch_add(1, Ordering::SeqCst);

        let mut problems: Vec<Time> = self.problems_at.iter().copied().filter(|t| *t >= start).collect();
        problems.sort();

        Ok(Box::new(MockCursor {
            inner,
            stats: self.stats.clone(),
            event_delay: self.event_delay,
            problems: problems.into(),
            faults: self.faults_at.clone(),
            held: None,
            ended: false,
        }))
    }

    async fn get_backfill_messages(
        &self,
        args: BackfillArgs,
        cancel: &CancelToken,
    ) -> SourceResult<Vec<MessageEvent>> {
        self.stats.backfill_calls.fetch_add(1, Ordering::SeqCst);
        if !self.backfill_delay.is_zero() {
            cancel
                .run_until_cancelled(tokio::time::sleep(self.backfill_delay))
                .await
                .ok_or(SourceError::Cancelled)?;
        }
        self.inner.get_backfill_messages(args, cancel).await
    }

    fn is_indexed(&self) -> bool {
        true
    }
}

struct MockCursor {
    inner: Box<dyn MessageCursor>,
    stats: Arc<MockStats>,
    event_delay: Duration,
    problems: VecDeque<Time>,
    faults: Vec<Time>,
    /// Event read from `inner` while a problem was yielded ahead of it
    held: Option<IteratorResult>,
    ended: bool,
}

impl MockCursor {
    fn release(&mut self) {
        if !self.ended {
            self.ended = true;
            self.stats.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl MessageCursor for MockCursor {
    async fn next(&mut self) -> SourceResult<Option<IteratorResult>> {
        if self.ended {
            return Ok(None);
        }
        self.stats.next_calls.fetch_add(1, Ordering::SeqCst);
        if !self.event_delay.is_zero() {
            tokio::time::sleep(self.event_delay).await;
        }

        let result = match self.held.take() {
            Some(held) => held,
            None => match self.inner.next().await? {
                Some(result) => result,
                None => return Ok(None),
            },
        };

        let Some(time) = result.time() else {
            return Ok(Some(result));
        };
        if self.faults.contains(&time) {
            return Err(SourceError::Read(format!("injected fault at {}", time)));
        }
        if self.problems.front().map_or(false, |t| *t <= time) {
            let at = self.problems.pop_front().unwrap_or(time);
            self.held = Some(result);
            return Ok(Some(IteratorResult::Problem {
                connection_id: Some(0),
                problem: Problem::warn(format!("injected problem at {}", at)),
            }));
        }
        Ok(Some(result))
    }

    async fn end(&mut self) -> SourceResult<()> {
        self.release();
        self.inner.end().await
    }
}

impl Drop for MockCursor {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ConsumptionType;
    use serde_json::json;

    fn args() -> MessageIteratorArgs {
        MessageIteratorArgs {
            topics: ["a".to_string()].into_iter().collect(),
            start: Time::ZERO,
            end: None,
            consumption_type: ConsumptionType::Full,
        }
    }

    fn messages() -> Vec<MessageEvent> {
        (0..3).map(|i| MessageEvent::new("a", Time::new(i, 0), json!(i))).collect()
    }

    #[tokio::test]
    async fn test_counts_open_cursors() {
        let source = MockSource::new(messages());
        let stats = source.stats();

        let mut cursor = source.message_iterator(args()).await.unwrap();
        assert_eq!(stats.open_cursors(), 1);
        cursor.next().await.unwrap();
        cursor.end().await.unwrap();
        assert_eq!(stats.open_cursors(), 0);

        let cursor = source.message_iterator(args()).await.unwrap();
        drop(cursor);
        assert_eq!(stats.open_cursors(), 0);
        assert_eq!(stats.cursors_opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_problem_precedes_event() {
        let source = MockSource::new(messages()).with_problem_at(Time::new(1, 0));
        let mut cursor = source.message_iterator(args()).await.unwrap();

        assert!(matches!(cursor.next().await.unwrap(), Some(IteratorResult::MessageEvent(_))));
        assert!(matches!(cursor.next().await.unwrap(), Some(IteratorResult::Problem { .. })));
        match cursor.next().await.unwrap() {
            Some(IteratorResult::MessageEvent(event)) => assert_eq!(event.receive_time, Time::new(1, 0)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fault_is_unrecoverable_error() {
        let source = MockSource::new(messages()).with_fault_at(Time::new(2, 0));
        let mut cursor = source.message_iterator(args()).await.unwrap();
        cursor.next().await.unwrap();
        cursor.next().await.unwrap();
        assert!(matches!(cursor.next().await, Err(SourceError::Read(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfill_delay_is_cancellable() {
        let source = MockSource::new(messages()).with_backfill_delay(Duration::from_secs(5));
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = source
            .get_backfill_messages(
                BackfillArgs {
                    topics: ["a".to_string()].into_iter().collect(),
                    time: Time::new(1, 0),
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_initialize_failure() {
        let source = MockSource::new(messages()).with_initialize_failure("bad header");
        assert!(matches!(source.initialize().await, Err(SourceError::Initialization(_))));
    }
}
