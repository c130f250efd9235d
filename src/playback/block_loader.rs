use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PlayerConfig;
use crate::core::{lock, CancelToken, MessageEvent, Problem, ProblemManager, Time, TimeRange};
use crate::error::SourceResult;
use crate::source::{BufferedSource, ConsumptionType, IterableSource, IteratorResult, MessageIteratorArgs};

/// Messages of one block, grouped by topic. Never mutated once shared.
#[derive(Debug, Default, Serialize)]
pub struct MessageBlock {
    pub messages_by_topic: HashMap<String, Vec<MessageEvent>>,
    pub size_in_bytes: usize,
}

/// Snapshot of a log's block cache, handed to progress listeners
#[derive(Debug, Clone, Serialize)]
pub struct BlockCache {
    pub start_time: Time,
    pub block_duration: Duration,
    #[serde(skip_serializing)]
    pub blocks: Vec<Option<Arc<MessageBlock>>>,
    pub cached_blocks: usize,
    pub total_bytes: usize,
}

/// Partition of a log's span into equal blocks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockLayout {
    pub start: Time,
    pub end: Time,
    pub block_duration: Duration,
    pub block_count: usize,
}

impl BlockLayout {
    pub fn new(span: TimeRange, min_block_duration: Duration, max_blocks: usize) -> Self {
        let total = span.end.as_nanos().saturating_sub(span.start.as_nanos()) + 1;
        let max_blocks = max_blocks.max(1) as u128;
        let min = min_block_duration.as_nanos().max(1);
        let duration = min.max(total.div_ceil(max_blocks));
        let block_count = total.div_ceil(duration);

        Self {
            start: span.start,
            end: span.end,
            block_duration: Duration::from_nanos(duration.min(u64::MAX as u128) as u64),
            block_count: block_count as usize,
        }
    }

    /// Inclusive time range of block `index`
    pub fn block_range(&self, index: usize) -> TimeRange {
        let nanos = self.block_duration.as_nanos();
        let start = Time::from_nanos(self.start.as_nanos() + nanos * index as u128);
        let end = Time::from_nanos(start.as_nanos() + nanos - 1).min(self.end);
        TimeRange::new(start, end)
    }
}

struct CachedBlock {
    topics: BTreeSet<String>,
    data: Arc<MessageBlock>,
    filled_seq: u64,
}

type ProgressFn = Arc<dyn Fn(BlockCache) + Send + Sync>;

/// Background cache of full-subscription topics for one log.
///
/// The loader walks the log's blocks in time order, reading each block's
/// missing topics through the shared [`BufferedSource`]. Once every block
/// holds the current topics it sleeps until the topic set changes.
pub struct BlockLoader {
    index: usize,
    source: BufferedSource,
    problems: ProblemManager,
    layout: BlockLayout,
    max_blocks: usize,
    cache_size_bytes: usize,
    topics: watch::Sender<BTreeSet<String>>,
    task: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
}

impl BlockLoader {
    pub fn new(
        index: usize,
        source: BufferedSource,
        problems: ProblemManager,
        span: TimeRange,
        config: &PlayerConfig,
    ) -> Self {
        let layout = BlockLayout::new(span, config.min_block_duration(), config.max_blocks);
        debug!(
            "Source {}: {} blocks of {:?}",
            index, layout.block_count, layout.block_duration
        );
        let (topics, _) = watch::channel(BTreeSet::new());
        Self {
            index,
            source,
            problems,
            layout,
            max_blocks: config.max_blocks,
            cache_size_bytes: usize::try_from(config.cache_size_bytes).unwrap_or(usize::MAX),
            topics,
            task: Mutex::new(None),
        }
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Change which topics are cached from now on. Blocks already holding
    /// removed topics keep them until evicted.
    pub fn set_topics(&self, topics: BTreeSet<String>) {
        self.topics.send_if_modified(|current| {
            if *current == topics {
                return false;
            }
            *current = topics;
            true
        });
    }

    /// Start the background loop. Does nothing if it is already running.
    pub fn start_loading<F>(&self, on_progress: F)
    where
        F: Fn(BlockCache) + Send + Sync + 'static,
    {
        let mut task = lock(&self.task);
        if task.is_some() {
            return;
        }

        let cancel = CancelToken::new();
        let worker = Worker {
            index: self.index,
            source: self.source.clone(),
            problems: self.problems.clone(),
            layout: self.layout,
            max_blocks: self.max_blocks,
            budget: self.cache_size_bytes,
            blocks: (0..self.layout.block_count).map(|_| None).collect(),
            fill_seq: 0,
            total_bytes: 0,
            topics: self.topics.subscribe(),
            cancel: cancel.clone(),
            on_progress: Arc::new(on_progress),
        };
        info!("Source {}: starting block loader", self.index);
        *task = Some((cancel, tokio::spawn(worker.run())));
    }

    /// Stop the background loop and wait for it to release the source
    pub async fn stop_loading(&self) {
        let running = lock(&self.task).take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Source {}: block loader exited abnormally: {}", self.index, e);
            }
            debug!("Source {}: block loader stopped", self.index);
        }
    }
}

impl Drop for BlockLoader {
    fn drop(&mut self) {
        if let Some((cancel, _)) = lock(&self.task).as_ref() {
            cancel.cancel();
        }
    }
}

enum Pass {
    Complete,
    TopicsChanged,
    Stopped,
}

struct Worker {
    index: usize,
    source: BufferedSource,
    problems: ProblemManager,
    layout: BlockLayout,
    max_blocks: usize,
    budget: usize,
    blocks: Vec<Option<CachedBlock>>,
    fill_seq: u64,
    total_bytes: usize,
    topics: watch::Receiver<BTreeSet<String>>,
    cancel: CancelToken,
    on_progress: ProgressFn,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let topics = self.topics.borrow_and_update().clone();
            match self.load_pass(&topics).await {
                Pass::Stopped => return,
                Pass::TopicsChanged => continue,
                Pass::Complete => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = self.topics.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn load_pass(&mut self, topics: &BTreeSet<String>) -> Pass {
        if topics.is_empty() {
            return Pass::Complete;
        }
        for index in 0..self.layout.block_count {
            if self.cancel.is_cancelled() {
                return Pass::Stopped;
            }
            if self.topics.has_changed().unwrap_or(false) {
                return Pass::TopicsChanged;
            }

            let missing: BTreeSet<String> = match &self.blocks[index] {
                Some(block) => topics.difference(&block.topics).cloned().collect(),
                None => topics.clone(),
            };
            if missing.is_empty() {
                continue;
            }

            let key = format!("source-{}:block-{}", self.index, index);
            match self.load_block(index, &missing).await {
                Ok(Some(loaded)) => {
                    self.problems.remove_problem(&key);
                    self.store(index, missing, loaded);
                }
                Ok(None) => return Pass::Stopped,
                Err(e) => {
                    warn!("Source {}: skipping block {}: {}", self.index, index, e);
                    self.problems.add_problem(
                        key,
                        Problem::warn(format!("Failed to load block {}", index)).with_error(&e),
                    );
                }
            }
        }
        Pass::Complete
    }

    /// Read `topics` for one block. `Ok(None)` if stopped first.
    async fn load_block(&self, index: usize, topics: &BTreeSet<String>) -> SourceResult<Option<MessageBlock>> {
        let range = self.layout.block_range(index);
        let args = MessageIteratorArgs {
            topics: topics.clone(),
            start: range.start,
            end: Some(range.end),
            consumption_type: ConsumptionType::Full,
        };
        let mut cursor = match self.cancel.run_until_cancelled(self.source.message_iterator(args)).await {
            None => return Ok(None),
            Some(cursor) => cursor?,
        };

        let mut block = MessageBlock {
            messages_by_topic: topics.iter().map(|t| (t.clone(), Vec::new())).collect(),
            size_in_bytes: 0,
        };
        let result = loop {
            match self.cancel.run_until_cancelled(cursor.next()).await {
                None => break Ok(None),
                Some(Ok(Some(IteratorResult::MessageEvent(event)))) => {
                    block.size_in_bytes += event.size_in_bytes;
                    block.messages_by_topic.entry(event.topic.clone()).or_default().push(event);
                }
                Some(Ok(Some(IteratorResult::Problem { connection_id, problem }))) => {
                    let connection = connection_id.map_or_else(|| "unknown".to_string(), |id| id.to_string());
                    self.problems
                        .add_problem(format!("source-{}:connection-{}", self.index, connection), problem);
                }
                Some(Ok(Some(IteratorResult::Stamp(_)))) => {}
                Some(Ok(None)) => break Ok(Some(block)),
                Some(Err(e)) => break Err(e),
            }
        };

        if let Err(e) = cursor.end().await {
            warn!("Source {}: failed to end block cursor: {}", self.index, e);
        }
        result
    }

    fn store(&mut self, index: usize, topics: BTreeSet<String>, loaded: MessageBlock) {
        let mut merged = loaded;
        let mut all_topics = topics;
        if let Some(previous) = self.blocks[index].take() {
            self.total_bytes -= previous.data.size_in_bytes;
            for (topic, messages) in &previous.data.messages_by_topic {
                merged
                    .messages_by_topic
                    .entry(topic.clone())
                    .or_insert_with(|| messages.clone());
            }
            merged.size_in_bytes += previous.data.size_in_bytes;
            all_topics.extend(previous.topics);
        }

        self.fill_seq += 1;
        self.total_bytes += merged.size_in_bytes;
        self.blocks[index] = Some(CachedBlock {
            topics: all_topics,
            data: Arc::new(merged),
            filled_seq: self.fill_seq,
        });
        self.evict(index);
        (self.on_progress)(self.snapshot());
    }

    /// Drop least-recently-filled blocks until within budget, sparing `keep`
    fn evict(&mut self, keep: usize) {
        loop {
            let cached = self.blocks.iter().filter(|b| b.is_some()).count();
            if self.total_bytes <= self.budget && cached <= self.max_blocks {
                return;
            }
            let victim = self
                .blocks
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != keep)
                .filter_map(|(i, b)| b.as_ref().map(|b| (i, b.filled_seq)))
                .min_by_key(|(_, seq)| *seq)
                .map(|(i, _)| i);
            let Some(victim) = victim else {
                return;
            };
            if let Some(block) = self.blocks[victim].take() {
                debug!("Source {}: evicting block {}", self.index, victim);
                self.total_bytes -= block.data.size_in_bytes;
            }
        }
    }

    fn snapshot(&self) -> BlockCache {
        let blocks: Vec<Option<Arc<MessageBlock>>> = self
            .blocks
            .iter()
            .map(|b| b.as_ref().map(|b| b.data.clone()))
            .collect();
        BlockCache {
            start_time: self.layout.start,
            block_duration: self.layout.block_duration,
            cached_blocks: blocks.iter().filter(|b| b.is_some()).count(),
            blocks,
            total_bytes: self.total_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, MockSource, ReadAheadLimits};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn messages(topics: &[&str]) -> Vec<MessageEvent> {
        (0..5u64)
            .flat_map(|i| {
                topics
                    .iter()
                    .map(move |t| MessageEvent::new(*t, Time::from_millis(i * 100), json!(i)).with_size(10))
            })
            .collect()
    }

    fn topics(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn buffered(source: impl IterableSource + 'static) -> BufferedSource {
        let buffered = BufferedSource::new(Arc::new(source), ReadAheadLimits::default());
        buffered.initialize().await.unwrap();
        buffered
    }

    fn span() -> TimeRange {
        TimeRange::new(Time::ZERO, Time::from_millis(499))
    }

    async fn wait_for(rx: &mut mpsc::UnboundedReceiver<BlockCache>, done: impl Fn(&BlockCache) -> bool) -> BlockCache {
        loop {
            let cache = rx.recv().await.unwrap();
            if done(&cache) {
                return cache;
            }
        }
    }

    #[test]
    fn test_layout_respects_minimum_and_cap() {
        let layout = BlockLayout::new(span(), Duration::from_millis(100), 400);
        assert_eq!(layout.block_count, 5);
        assert_eq!(layout.block_duration, Duration::from_millis(100));
        assert_eq!(layout.block_range(4).end, Time::from_millis(499));

        let long = TimeRange::new(Time::ZERO, Time::new(999, 999_999_999));
        let layout = BlockLayout::new(long, Duration::from_millis(100), 400);
        assert_eq!(layout.block_count, 400);
        assert_eq!(layout.block_duration, Duration::from_millis(2500));
    }

    #[test]
    fn test_single_instant_log_has_one_block() {
        let layout = BlockLayout::new(TimeRange::new(Time::new(3, 0), Time::new(3, 0)), Duration::from_millis(100), 400);
        assert_eq!(layout.block_count, 1);
        assert_eq!(layout.block_range(0), TimeRange::new(Time::new(3, 0), Time::new(3, 0)));
    }

    #[tokio::test]
    async fn test_budget_evicts_least_recently_filled_block() {
        let source = buffered(MemorySource::new("m", messages(&["a"]))).await;
        let config = PlayerConfig {
            cache_size_bytes: 40,
            ..Default::default()
        };
        let loader = BlockLoader::new(0, source, ProblemManager::new(), span(), &config);
        loader.set_topics(topics(&["a"]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        loader.start_loading(move |cache| {
            let _ = tx.send(cache);
        });
        let cache = wait_for(&mut rx, |c| c.blocks[4].is_some()).await;

        assert!(cache.blocks[0].is_none());
        assert!(cache.blocks[1..].iter().all(|b| b.is_some()));
        assert_eq!(cache.total_bytes, 40);
        loader.stop_loading().await;
    }

    #[tokio::test]
    async fn test_failed_block_is_skipped_and_reported() {
        let mock = MockSource::from_memory(MemorySource::new("m", messages(&["a"])))
            .with_fault_at(Time::from_millis(200));
        let source = buffered(mock).await;
        let problems = ProblemManager::new();
        let loader = BlockLoader::new(3, source, problems.clone(), span(), &PlayerConfig::default());
        loader.set_topics(topics(&["a"]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        loader.start_loading(move |cache| {
            let _ = tx.send(cache);
        });
        let cache = wait_for(&mut rx, |c| c.blocks[4].is_some()).await;

        assert!(cache.blocks[2].is_none());
        assert_eq!(cache.cached_blocks, 4);
        assert!(problems.has_problem("source-3:block-2"));
        loader.stop_loading().await;
    }

    #[tokio::test]
    async fn test_topic_changes_converge() {
        let source = buffered(MemorySource::new("m", messages(&["a", "b"]))).await;
        let loader = BlockLoader::new(0, source, ProblemManager::new(), span(), &PlayerConfig::default());
        loader.set_topics(topics(&["a"]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        loader.start_loading(move |cache| {
            let _ = tx.send(cache);
        });
        wait_for(&mut rx, |c| c.cached_blocks == 5).await;

        loader.set_topics(topics(&["b"]));
        loader.set_topics(topics(&["a", "b"]));
        let cache = wait_for(&mut rx, |c| {
            c.blocks
                .iter()
                .all(|b| b.as_ref().map_or(false, |b| b.messages_by_topic.contains_key("b")))
        })
        .await;

        for block in cache.blocks.iter().flatten() {
            assert_eq!(block.messages_by_topic["a"].len(), 1);
            assert_eq!(block.messages_by_topic["b"].len(), 1);
        }
        loader.stop_loading().await;
    }

    #[tokio::test]
    async fn test_stop_releases_source() {
        let mock = MockSource::new(messages(&["a"])).with_event_delay(Duration::from_millis(5));
        let stats = mock.stats();
        let source = buffered(mock).await;
        let loader = BlockLoader::new(0, source, ProblemManager::new(), span(), &PlayerConfig::default());
        loader.set_topics(topics(&["a"]));
        loader.start_loading(|_| {});

        tokio::time::sleep(Duration::from_millis(7)).await;
        loader.stop_loading().await;
        assert_eq!(stats.open_cursors(), 0);
    }
}
