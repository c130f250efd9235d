use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, warn};

use crate::core::{CancelToken, Initialization, MessageEvent, Problem, Time, TimeRange, Topic, TopicStats};
use crate::error::{SourceError, SourceResult};
use crate::source::{BackfillArgs, IterableSource, IteratorResult, MessageCursor, MessageIteratorArgs};

/// One line of a JSON-lines log
#[derive(Debug, Deserialize)]
struct Record {
    topic: String,
    receive_time: Time,
    #[serde(default)]
    publish_time: Option<Time>,
    #[serde(default)]
    schema: Option<String>,
    message: Value,
}

impl Record {
    fn into_event(self, size: usize) -> MessageEvent {
        let mut event = MessageEvent::new(self.topic, self.receive_time, self.message).with_size(size);
        if let Some(publish_time) = self.publish_time {
            event = event.with_publish_time(publish_time);
        }
        if let Some(schema) = self.schema {
            event = event.with_schema(schema);
        }
        event
    }
}

/// What one line of the file turned out to be
enum Line {
    Blank,
    Malformed(serde_json::Error),
    /// Earlier than an event already seen; never yielded
    OutOfOrder(MessageEvent, Time),
    Event(MessageEvent),
}

/// Classifies lines in file order. The running maximum starts at the top of
/// the file, so a line is out of order no matter where a reader starts.
#[derive(Default)]
struct LineReader {
    line_no: u64,
    high_water: Option<Time>,
}

impl LineReader {
    fn classify(&mut self, line: &str) -> Line {
        self.line_no += 1;
        if line.trim().is_empty() {
            return Line::Blank;
        }
        let event = match serde_json::from_str::<Record>(line) {
            Ok(record) => record.into_event(line.len()),
            Err(e) => return Line::Malformed(e),
        };
        match self.high_water {
            Some(high) if event.receive_time < high => Line::OutOfOrder(event, high),
            _ => {
                self.high_water = Some(event.receive_time);
                Line::Event(event)
            }
        }
    }
}

/// Streaming log stored as one JSON record per line:
///
/// ```json
/// {"topic": "/imu", "receive_time": {"sec": 1, "nsec": 0}, "schema": "Imu", "message": {"x": 1}}
/// ```
///
/// Nothing is indexed; every cursor and backfill reads from the top of the
/// file.
pub struct JsonlSource {
    path: PathBuf,
    name: String,
}

impl JsonlSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> SourceResult<Lines<BufReader<File>>> {
        let file = File::open(&self.path).await?;
        Ok(BufReader::new(file).lines())
    }
}

#[async_trait]
impl IterableSource for JsonlSource {
    async fn initialize(&self) -> SourceResult<Initialization> {
        let mut lines = self.open().await?;
        let mut reader = LineReader::default();
        let mut bounds: Option<TimeRange> = None;
        let mut topics: Vec<Topic> = Vec::new();
        let mut topic_stats: BTreeMap<String, TopicStats> = BTreeMap::new();
        let mut malformed = 0u64;
        let mut out_of_order = 0u64;

        while let Some(line) = lines.next_line().await? {
            match reader.classify(&line) {
                Line::Blank => {}
                Line::Malformed(e) => {
                    debug!("{}: line {} is malformed: {}", self.name, reader.line_no, e);
                    malformed += 1;
                }
                Line::OutOfOrder(..) => out_of_order += 1,
                Line::Event(event) => {
                    bounds = Some(match bounds {
                        Some(range) => TimeRange::new(range.start, event.receive_time),
                        None => TimeRange::new(event.receive_time, event.receive_time),
                    });
                    if !topic_stats.contains_key(&event.topic) {
                        topics.push(Topic::new(event.topic.clone(), event.schema_name.clone()));
                    }
                    topic_stats.entry(event.topic.clone()).or_default().record(&event);
                }
            }
        }

        let Some(bounds) = bounds else {
            return Err(SourceError::Empty(self.name.clone()));
        };

        let mut problems = Vec::new();
        if malformed > 0 {
            warn!("{}: skipping {} malformed lines", self.name, malformed);
            problems.push(Problem::warn(format!("{} malformed lines in {} are skipped", malformed, self.name)));
        }
        if out_of_order > 0 {
            warn!("{}: skipping {} out-of-order lines", self.name, out_of_order);
            problems.push(
                Problem::warn(format!("{} out-of-order lines in {} are skipped", out_of_order, self.name))
                    .with_tip("Sort the file by receive_time to play every record"),
            );
        }

        Ok(Initialization {
            start: bounds.start,
            end: bounds.end,
            topics,
            topic_stats,
            datatypes: HashMap::new(),
            publishers_by_topic: BTreeMap::new(),
            problems,
            profile: None,
        })
    }

    async fn message_iterator(&self, args: MessageIteratorArgs) -> SourceResult<Box<dyn MessageCursor>> {
        Ok(Box::new(JsonlCursor {
            name: self.name.clone(),
            lines: Some(self.open().await?),
            reader: LineReader::default(),
            start: args.start,
            end: args.end,
            topics: args.topics.into_iter().collect(),
        }))
    }

    async fn get_backfill_messages(
        &self,
        args: BackfillArgs,
        cancel: &CancelToken,
    ) -> SourceResult<Vec<MessageEvent>> {
        let mut lines = self.open().await?;
        let mut reader = LineReader::default();
        let mut latest: HashMap<String, MessageEvent> = HashMap::new();

        while let Some(line) = lines.next_line().await? {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            if let Line::Event(event) = reader.classify(&line) {
                if event.receive_time > args.time {
                    break;
                }
                if args.topics.contains(&event.topic) {
                    latest.insert(event.topic.clone(), event);
                }
            }
        }

        let mut found: Vec<MessageEvent> = latest.into_values().collect();
        found.sort_by_key(|m| m.receive_time);
        Ok(found)
    }
}

struct JsonlCursor {
    name: String,
    lines: Option<Lines<BufReader<File>>>,
    reader: LineReader,
    start: Time,
    end: Option<Time>,
    topics: HashSet<String>,
}

impl JsonlCursor {
    /// Problems are only reported for the part of the file being played
    fn in_range(&self) -> bool {
        self.reader.high_water.map_or(false, |t| t >= self.start)
    }

    fn problem(&self, problem: Problem) -> Option<IteratorResult> {
        Some(IteratorResult::Problem {
            connection_id: None,
            problem,
        })
    }
}

#[async_trait]
impl MessageCursor for JsonlCursor {
    async fn next(&mut self) -> SourceResult<Option<IteratorResult>> {
        loop {
            let Some(lines) = self.lines.as_mut() else {
                return Ok(None);
            };
            let Some(line) = lines.next_line().await? else {
                self.lines = None;
                return Ok(None);
            };

            match self.reader.classify(&line) {
                Line::Blank => {}
                Line::Malformed(e) => {
                    if self.in_range() {
                        let message = format!("Skipping malformed line {} of {}", self.reader.line_no, self.name);
                        return Ok(self.problem(Problem::warn(message).with_error(&e)));
                    }
                }
                Line::OutOfOrder(event, high) => {
                    if self.in_range() && self.end.map_or(true, |end| event.receive_time <= end) {
                        let message = format!(
                            "Skipping line {} of {}: {} is earlier than {}",
                            self.reader.line_no, self.name, event.receive_time, high
                        );
                        return Ok(self.problem(Problem::warn(message)));
                    }
                }
                Line::Event(event) => {
                    if self.end.map_or(false, |end| event.receive_time > end) {
                        self.lines = None;
                        return Ok(None);
                    }
                    if event.receive_time >= self.start && self.topics.contains(&event.topic) {
                        return Ok(Some(IteratorResult::MessageEvent(event)));
                    }
                }
            }
        }
    }

    async fn end(&mut self) -> SourceResult<()> {
        self.lines = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ConsumptionType;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::io::Write;

    fn line(topic: &str, millis: u64, value: i64) -> String {
        let time = Time::from_millis(millis);
        json!({
            "topic": topic,
            "receive_time": {"sec": time.sec, "nsec": time.nsec},
            "message": {"value": value},
        })
        .to_string()
    }

    fn write_log(lines: &[String]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(file, "{}", l).unwrap();
        }
        file
    }

    fn topics(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn drain(cursor: &mut Box<dyn MessageCursor>) -> Vec<IteratorResult> {
        let mut out = Vec::new();
        while let Some(item) = cursor.next().await.unwrap() {
            out.push(item);
        }
        out
    }

    fn sample() -> tempfile::NamedTempFile {
        write_log(&[
            line("a", 1000, 1),
            line("b", 1500, 2),
            "not json".to_string(),
            line("a", 2000, 3),
            line("b", 1800, 4),
            String::new(),
            line("a", 3000, 5),
        ])
    }

    #[tokio::test]
    async fn test_initialize_summarizes_file() {
        let file = sample();
        let source = JsonlSource::new(file.path());
        let init = source.initialize().await.unwrap();

        assert_eq!(init.start, Time::from_millis(1000));
        assert_eq!(init.end, Time::from_millis(3000));
        let names: Vec<&str> = init.topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(init.topic_stats["a"].num_messages, 3);
        assert_eq!(init.topic_stats["b"].num_messages, 1);
        assert_eq!(init.problems.len(), 2);
        assert!(!source.is_indexed());
    }

    #[tokio::test]
    async fn test_unnormalized_times_are_carried_into_seconds() {
        let file = write_log(&[
            r#"{"topic":"a","receive_time":{"sec":1,"nsec":1500000000},"message":1}"#.to_string(),
            line("a", 3000, 2),
        ]);
        let init = JsonlSource::new(file.path()).initialize().await.unwrap();
        assert_eq!(init.start, Time::from_millis(2500));
        assert!(init.problems.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_rejects_empty_file() {
        let file = write_log(&["garbage".to_string()]);
        let err = JsonlSource::new(file.path()).initialize().await.unwrap_err();
        assert!(matches!(err, SourceError::Empty(_)));
    }

    #[tokio::test]
    async fn test_cursor_reports_bad_lines_without_reordering() {
        let file = sample();
        let source = JsonlSource::new(file.path());
        let mut cursor = source
            .message_iterator(MessageIteratorArgs {
                topics: topics(&["a", "b"]),
                start: Time::from_millis(1000),
                end: Some(Time::from_millis(2500)),
                consumption_type: ConsumptionType::Partial,
            })
            .await
            .unwrap();
        let items = drain(&mut cursor).await;

        let kinds: Vec<&str> = items
            .iter()
            .map(|i| match i {
                IteratorResult::MessageEvent(_) => "event",
                IteratorResult::Problem { .. } => "problem",
                IteratorResult::Stamp(_) => "stamp",
            })
            .collect();
        assert_eq!(kinds, vec!["event", "event", "problem", "event", "problem"]);

        let times: Vec<Time> = items.iter().filter_map(|i| i.time()).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(times.last(), Some(&Time::from_millis(2000)));
    }

    #[tokio::test]
    async fn test_cursor_skips_to_start_and_filters_topics() {
        let file = sample();
        let source = JsonlSource::new(file.path());
        let mut cursor = source
            .message_iterator(MessageIteratorArgs {
                topics: topics(&["a"]),
                start: Time::from_millis(2000),
                end: None,
                consumption_type: ConsumptionType::Full,
            })
            .await
            .unwrap();
        let values: Vec<Value> = drain(&mut cursor)
            .await
            .into_iter()
            .filter_map(|i| match i {
                IteratorResult::MessageEvent(e) => Some(e.message["value"].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![json!(3), json!(5)]);
        cursor.end().await.unwrap();
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backfill_takes_last_in_order_value() {
        let file = sample();
        let source = JsonlSource::new(file.path());
        let found = source
            .get_backfill_messages(
                BackfillArgs {
                    topics: topics(&["a", "b", "missing"]),
                    time: Time::from_millis(2500),
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        // b@1800 is out of order and never played, so b@1500 is the last value.
        let summary: Vec<(String, Value)> = found
            .iter()
            .map(|e| (e.topic.clone(), e.message["value"].clone()))
            .collect();
        assert_eq!(summary, vec![("b".to_string(), json!(2)), ("a".to_string(), json!(3))]);
    }

    #[tokio::test]
    async fn test_backfill_honours_cancellation() {
        let file = sample();
        let source = JsonlSource::new(file.path());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = source
            .get_backfill_messages(
                BackfillArgs {
                    topics: topics(&["a"]),
                    time: Time::from_millis(2500),
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
