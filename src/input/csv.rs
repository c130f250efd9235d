use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

use crate::core::{MessageEvent, Time};
use crate::source::MemorySource;

struct Columns {
    time: usize,
    topic: usize,
    message: usize,
    schema: Option<usize>,
}

/// Load a log from a CSV file
///
/// Supports flexible column names:
/// - time,topic,message
/// - timestamp,channel,payload,schema
/// - receive_time,topic,data,datatype
///
/// Times are decimal seconds. The message column is parsed as JSON; cells
/// that are not valid JSON are kept as strings.
pub fn load_csv(path: impl AsRef<Path>) -> Result<MemorySource> {
    let file_path = path.as_ref();
    let mut rdr = csv::Reader::from_path(file_path)
        .with_context(|| format!("Failed to open CSV file {:?}", file_path))?;

    let headers = rdr.headers().context("Failed to read CSV header")?;
    let columns = detect_columns(headers)?;

    let mut messages = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read CSV row {}", row + 1))?;

        let time = record
            .get(columns.time)
            .context("Missing time column")?
            .parse::<Time>()
            .with_context(|| format!("Bad time on row {}", row + 1))?;
        let topic = record.get(columns.topic).context("Missing topic column")?;
        if topic.is_empty() {
            anyhow::bail!("Empty topic on row {}", row + 1);
        }
        let raw = record.get(columns.message).context("Missing message column")?;

        let mut event = MessageEvent::new(topic, time, parse_message(raw));
        if let Some(schema) = columns.schema.and_then(|idx| record.get(idx)).filter(|s| !s.is_empty()) {
            event = event.with_schema(schema);
        }
        messages.push(event);
    }

    tracing::info!("Loaded {} messages from {:?}", messages.len(), file_path);

    let name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.display().to_string());
    Ok(MemorySource::new(name, messages))
}

fn parse_message(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Detect column indices from CSV headers
fn detect_columns(headers: &csv::StringRecord) -> Result<Columns> {
    Ok(Columns {
        time: find_column(headers, &["time", "timestamp", "t", "ts", "receive_time"])?,
        topic: find_column(headers, &["topic", "channel", "name"])?,
        message: find_column(headers, &["message", "data", "payload", "value"])?,
        schema: find_column(headers, &["schema", "schema_name", "datatype", "type"]).ok(),
    })
}

/// Find a column by checking possible names
fn find_column(headers: &csv::StringRecord, names: &[&str]) -> Result<usize> {
    for (idx, header) in headers.iter().enumerate() {
        let header_lower = header.trim().to_lowercase();
        if names.iter().any(|&name| header_lower == name) {
            return Ok(idx);
        }
    }

    anyhow::bail!("Could not find column with names: {:?}", names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CancelToken;
    use crate::source::{BackfillArgs, IterableSource};
    use serde_json::json;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_with_aliases() {
        let file = write_csv(
            "Timestamp,Channel,Payload,Datatype\n\
             1.5,/imu,\"{\"\"x\"\": 1}\",sensor/Imu\n\
             0.000000001,/gps,fix,\n",
        );
        let source = load_csv(file.path()).unwrap();
        assert_eq!(source.len(), 2);

        let init = source.initialize().await.unwrap();
        assert_eq!(init.start, Time::new(0, 1));
        assert_eq!(init.end, Time::new(1, 500_000_000));
        let imu = init.topics.iter().find(|t| t.name == "/imu").unwrap();
        assert_eq!(imu.schema_name.as_deref(), Some("sensor/Imu"));
        let gps = init.topics.iter().find(|t| t.name == "/gps").unwrap();
        assert_eq!(gps.schema_name, None);

        let found = source
            .get_backfill_messages(
                BackfillArgs {
                    topics: ["/imu".to_string(), "/gps".to_string()].into(),
                    time: Time::new(2, 0),
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(*found[0].message, json!("fix"));
        assert_eq!(*found[1].message, json!({"x": 1}));
    }

    #[test]
    fn test_missing_column_is_rejected() {
        let file = write_csv("time,topic\n1,a\n");
        let err = load_csv(file.path()).unwrap_err();
        assert!(err.to_string().contains("Could not find column"));
    }

    #[test]
    fn test_bad_time_names_the_row() {
        let file = write_csv("time,topic,message\n1,a,1\n-2,a,2\n");
        let err = load_csv(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("row 2"));
    }

    #[tokio::test]
    async fn test_header_only_file_is_empty() {
        let file = write_csv("time,topic,message\n");
        let source = load_csv(file.path()).unwrap();
        assert!(source.initialize().await.is_err());
    }
}
