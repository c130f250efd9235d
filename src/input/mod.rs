pub mod csv;
pub mod jsonl;

pub use csv::load_csv;
pub use jsonl::JsonlSource;

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::source::IterableSource;

/// Input format detection result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    Jsonl,
    Unknown,
}

/// Detect the format of an input file from its first bytes
pub fn detect_format(data: &[u8]) -> InputFormat {
    // A JSON object on the first line also contains commas, so check it first
    if is_jsonl(data) {
        return InputFormat::Jsonl;
    }

    if is_csv(data) {
        return InputFormat::Csv;
    }

    InputFormat::Unknown
}

fn sample_text(data: &[u8]) -> Option<&str> {
    let sample = &data[..data.len().min(4096)];
    match std::str::from_utf8(sample) {
        Ok(text) => Some(text),
        // The sample may end partway through a multi-byte character
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&sample[..e.valid_up_to()]).ok(),
        Err(_) => None,
    }
}

fn is_jsonl(data: &[u8]) -> bool {
    let Some(text) = sample_text(data) else {
        return false;
    };
    let Some(first) = text.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return false;
    };
    if !first.starts_with('{') {
        return false;
    }
    // A first line longer than the sample cannot be parsed, only sniffed
    !text.contains('\n') || serde_json::from_str::<serde_json::Value>(first).map_or(false, |v| v.is_object())
}

fn is_csv(data: &[u8]) -> bool {
    if data.len() < 10 {
        return false;
    }

    match sample_text(data) {
        // time,topic,message has at least two commas on the header line
        Some(text) => text.lines().take(5).any(|line| line.chars().filter(|&c| c == ',').count() >= 2),
        None => false,
    }
}

/// Open a log file, auto-detecting its format
pub fn open_source(path: impl AsRef<Path>) -> Result<Arc<dyn IterableSource>> {
    let path = path.as_ref();
    let mut head = Vec::with_capacity(4096);
    std::fs::File::open(path)
        .with_context(|| format!("Failed to open {:?}", path))?
        .take(4096)
        .read_to_end(&mut head)
        .with_context(|| format!("Failed to read {:?}", path))?;

    match detect_format(&head) {
        InputFormat::Csv => Ok(Arc::new(load_csv(path)?)),
        InputFormat::Jsonl => Ok(Arc::new(JsonlSource::new(path))),
        InputFormat::Unknown => anyhow::bail!("Unknown input format: {:?}", path),
    }
}
