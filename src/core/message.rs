use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::problem::Problem;
use super::time::Time;

/// A single recorded event on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Topic (channel) name
    pub topic: String,

    /// Time the event was recorded
    pub receive_time: Time,

    /// Time the publisher stamped the event, if known
    pub publish_time: Option<Time>,

    /// Decoded payload, shared between playback batches and the block cache
    pub message: Arc<Value>,

    /// Schema identifier of the topic
    pub schema_name: Option<String>,

    /// Approximate in-memory size, used for cache budgeting
    pub size_in_bytes: usize,
}

impl MessageEvent {
    /// Create an event, estimating its size from the serialized payload
    pub fn new(topic: impl Into<String>, receive_time: Time, message: Value) -> Self {
        let topic = topic.into();
        let size_in_bytes = estimate_size(&topic, &message);
        Self {
            topic,
            receive_time,
            publish_time: None,
            message: Arc::new(message),
            schema_name: None,
            size_in_bytes,
        }
    }

    pub fn with_schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = Some(schema_name.into());
        self
    }

    pub fn with_publish_time(mut self, publish_time: Time) -> Self {
        self.publish_time = Some(publish_time);
        self
    }

    pub fn with_size(mut self, size_in_bytes: usize) -> Self {
        self.size_in_bytes = size_in_bytes;
        self
    }
}

fn estimate_size(topic: &str, message: &Value) -> usize {
    let payload = serde_json::to_vec(message).map(|v| v.len()).unwrap_or(0);
    topic.len() + payload + std::mem::size_of::<MessageEvent>()
}

/// A topic advertised by a log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub schema_name: Option<String>,
}

impl Topic {
    pub fn new(name: impl Into<String>, schema_name: Option<String>) -> Self {
        Self {
            name: name.into(),
            schema_name,
        }
    }
}

/// Per-topic statistics gathered at initialization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicStats {
    pub num_messages: u64,
    pub size_in_bytes: u64,
    pub first_message_time: Option<Time>,
    pub last_message_time: Option<Time>,
}

impl TopicStats {
    /// Fold one event into the statistics
    pub fn record(&mut self, event: &MessageEvent) {
        self.num_messages += 1;
        self.size_in_bytes += event.size_in_bytes as u64;
        if self.first_message_time.map_or(true, |t| event.receive_time < t) {
            self.first_message_time = Some(event.receive_time);
        }
        if self.last_message_time.map_or(true, |t| event.receive_time > t) {
            self.last_message_time = Some(event.receive_time);
        }
    }
}

/// Summary a log produces once, before any read
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Initialization {
    /// First time with data (inclusive)
    pub start: Time,
    /// Last time with data (inclusive)
    pub end: Time,
    pub topics: Vec<Topic>,
    pub topic_stats: BTreeMap<String, TopicStats>,
    /// Schema name to schema definition
    pub datatypes: HashMap<String, Value>,
    /// Topic to the set of publishers that wrote it
    pub publishers_by_topic: BTreeMap<String, BTreeSet<String>>,
    /// Non-fatal problems found while opening the log
    pub problems: Vec<Problem>,
    pub profile: Option<String>,
}

impl Initialization {
    pub fn has_topic(&self, name: &str) -> bool {
        self.topics.iter().any(|t| t.name == name)
    }
}

/// How a subscribed topic is read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadType {
    /// Eligible for background block caching
    #[default]
    Full,
    /// Only read during forward playback
    Partial,
}

/// A consumer's interest in a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    #[serde(default)]
    pub preload_type: PreloadType,
}

impl Subscription {
    pub fn full(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            preload_type: PreloadType::Full,
        }
    }

    pub fn partial(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            preload_type: PreloadType::Partial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_stats_record() {
        let mut stats = TopicStats::default();
        stats.record(&MessageEvent::new("a", Time::new(2, 0), json!(1)).with_size(10));
        stats.record(&MessageEvent::new("a", Time::new(1, 0), json!(2)).with_size(5));

        assert_eq!(stats.num_messages, 2);
        assert_eq!(stats.size_in_bytes, 15);
        assert_eq!(stats.first_message_time, Some(Time::new(1, 0)));
        assert_eq!(stats.last_message_time, Some(Time::new(2, 0)));
    }

    #[test]
    fn test_subscription_defaults_to_full() {
        let sub: Subscription = serde_json::from_str(r#"{"topic":"/imu"}"#).unwrap();
        assert_eq!(sub.preload_type, PreloadType::Full);

        let sub: Subscription =
            serde_json::from_str(r#"{"topic":"/imu","preload_type":"partial"}"#).unwrap();
        assert_eq!(sub, Subscription::partial("/imu"));
    }

    #[test]
    fn test_event_size_estimate_grows_with_payload() {
        let small = MessageEvent::new("a", Time::ZERO, json!(1));
        let large = MessageEvent::new("a", Time::ZERO, json!({"data": "x".repeat(100)}));
        assert!(large.size_in_bytes > small.size_in_bytes + 90);
    }
}
