use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::iterable::{BackfillArgs, IterableSource, IteratorResult, MessageCursor, MessageIteratorArgs};
use crate::core::{CancelToken, Initialization, MessageEvent, Time, TimeRange, Topic, TopicStats};
use crate::error::{SourceError, SourceResult};

/// Indexed log held entirely in memory.
///
/// Events are stable-sorted by receive time, so events sharing a timestamp
/// keep their recorded order. A per-topic index answers backfill with a
/// binary search.
pub struct MemorySource {
    name: String,
    messages: Arc<Vec<MessageEvent>>,
    by_topic: HashMap<String, Vec<usize>>,
    topics: Vec<Topic>,
    datatypes: HashMap<String, Value>,
    bounds: Option<TimeRange>,
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("messages", &self.messages.len())
            .field("topics", &self.topics.iter().map(|t| t.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl MemorySource {
    pub fn new(name: impl Into<String>, mut messages: Vec<MessageEvent>) -> Self {
        messages.sort_by_key(|m| m.receive_time);

        let mut by_topic: HashMap<String, Vec<usize>> = HashMap::new();
        let mut topics: Vec<Topic> = Vec::new();
        for (idx, msg) in messages.iter().enumerate() {
            let entry = by_topic.entry(msg.topic.clone()).or_default();
            if entry.is_empty() {
                topics.push(Topic::new(msg.topic.clone(), msg.schema_name.clone()));
            }
            entry.push(idx);
        }

        Self {
            name: name.into(),
            messages: Arc::new(messages),
            by_topic,
            topics,
            datatypes: HashMap::new(),
            bounds: None,
        }
    }

    /// Advertise a topic that has no messages
    pub fn with_topic(mut self, topic: Topic) -> Self {
        if !self.topics.iter().any(|t| t.name == topic.name) {
            self.topics.push(topic);
        }
        self
    }

    pub fn with_datatype(mut self, schema_name: impl Into<String>, definition: Value) -> Self {
        self.datatypes.insert(schema_name.into(), definition);
        self
    }

    /// Override the time bounds derived from the messages
    pub fn with_bounds(mut self, start: Time, end: Time) -> Self {
        self.bounds = Some(TimeRange::new(start, end));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn summarize(&self) -> SourceResult<Initialization> {
        let bounds = match (self.bounds, self.messages.first(), self.messages.last()) {
            (Some(bounds), _, _) => bounds,
            (None, Some(first), Some(last)) => TimeRange::new(first.receive_time, last.receive_time),
            _ => return Err(SourceError::Empty(self.name.clone())),
        };

        let mut topic_stats: BTreeMap<String, TopicStats> = BTreeMap::new();
        for msg in self.messages.iter() {
            topic_stats.entry(msg.topic.clone()).or_default().record(msg);
        }

        Ok(Initialization {
            start: bounds.start,
            end: bounds.end,
            topics: self.topics.clone(),
            topic_stats,
            datatypes: self.datatypes.clone(),
            publishers_by_topic: BTreeMap::new(),
            problems: Vec::new(),
            profile: None,
        })
    }
}

#[async_trait]
impl IterableSource for MemorySource {
    async fn initialize(&self) -> SourceResult<Initialization> {
        self.summarize()
    }

    async fn message_iterator(&self, args: MessageIteratorArgs) -> SourceResult<Box<dyn MessageCursor>> {
        let position = self.messages.partition_point(|m| m.receive_time < args.start);
        Ok(Box::new(MemoryCursor {
            messages: self.messages.clone(),
            position,
            end: args.end,
            topics: args.topics.into_iter().collect(),
        }))
    }

    async fn get_backfill_messages(
        &self,
        args: BackfillArgs,
        cancel: &CancelToken,
    ) -> SourceResult<Vec<MessageEvent>> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        Ok(backfill_from_index(&self.messages, &self.by_topic, &args.topics, args.time))
    }

    fn is_indexed(&self) -> bool {
        true
    }
}

/// Last event at or before `time` per topic, ordered by receive time
fn backfill_from_index(
    messages: &[MessageEvent],
    by_topic: &HashMap<String, Vec<usize>>,
    topics: &BTreeSet<String>,
    time: Time,
) -> Vec<MessageEvent> {
    let mut found: Vec<MessageEvent> = topics
        .iter()
        .filter_map(|topic| {
            let indices = by_topic.get(topic)?;
            let count = indices.partition_point(|&i| messages[i].receive_time <= time);
            count.checked_sub(1).map(|last| messages[indices[last]].clone())
        })
        .collect();
    found.sort_by_key(|m| m.receive_time);
    found
}

struct MemoryCursor {
    messages: Arc<Vec<MessageEvent>>,
    position: usize,
    end: Option<Time>,
    topics: HashSet<String>,
}

#[async_trait]
impl MessageCursor for MemoryCursor {
    async fn next(&mut self) -> SourceResult<Option<IteratorResult>> {
        while let Some(msg) = self.messages.get(self.position) {
            if self.end.map_or(false, |end| msg.receive_time > end) {
                self.position = self.messages.len();
                return Ok(None);
            }
            self.position += 1;
            if self.topics.contains(&msg.topic) {
                return Ok(Some(IteratorResult::MessageEvent(msg.clone())));
            }
        }
        Ok(None)
    }
}
