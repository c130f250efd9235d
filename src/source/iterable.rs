use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::core::{CancelToken, Initialization, MessageEvent, Problem, Time};
use crate::error::SourceResult;

/// What a cursor is being used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionType {
    /// Complete range scans used to fill cache blocks
    Full,
    /// Forward playback reads
    Partial,
}

/// Arguments for opening a cursor
#[derive(Debug, Clone)]
pub struct MessageIteratorArgs {
    pub topics: BTreeSet<String>,
    /// First receive time to yield (inclusive)
    pub start: Time,
    /// Last receive time to yield (inclusive). `None` reads to the end.
    pub end: Option<Time>,
    pub consumption_type: ConsumptionType,
}

/// Arguments for a last-value-per-topic query
#[derive(Debug, Clone)]
pub struct BackfillArgs {
    pub topics: BTreeSet<String>,
    pub time: Time,
}

/// One item produced by a cursor
#[derive(Debug, Clone, PartialEq)]
pub enum IteratorResult {
    MessageEvent(MessageEvent),
    /// A recoverable problem; the cursor keeps going
    Problem {
        connection_id: Option<u32>,
        problem: Problem,
    },
    /// Everything up to and including this time has been yielded
    Stamp(Time),
}

impl IteratorResult {
    pub fn time(&self) -> Option<Time> {
        match self {
            IteratorResult::MessageEvent(event) => Some(event.receive_time),
            IteratorResult::Stamp(time) => Some(*time),
            IteratorResult::Problem { .. } => None,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            IteratorResult::MessageEvent(event) => event.size_in_bytes,
            _ => 0,
        }
    }
}

/// A single-use forward reader over a log.
///
/// Receive times of yielded events never decrease. Once `next` returns
/// `Ok(None)` or an error the cursor is spent; `end` releases whatever it
/// holds and must be awaited before the owner opens another cursor.
#[async_trait]
pub trait MessageCursor: Send {
    /// Next item, `Ok(None)` when exhausted, `Err` when the log cannot be
    /// read any further
    async fn next(&mut self) -> SourceResult<Option<IteratorResult>>;

    /// Release the cursor's resources
    async fn end(&mut self) -> SourceResult<()> {
        Ok(())
    }
}

/// Contract every log decoder provides to the playback core.
///
/// Implementations:
/// - indexed sources answer cursor creation and backfill with a lookup
/// - streaming sources scan from the beginning of the log
#[async_trait]
pub trait IterableSource: Send + Sync {
    /// Open the log and summarize it. Must succeed before any read.
    async fn initialize(&self) -> SourceResult<Initialization>;

    /// Open a forward cursor
    async fn message_iterator(&self, args: MessageIteratorArgs) -> SourceResult<Box<dyn MessageCursor>>;

    /// Last event at or before `args.time` for each requested topic, ordered
    /// by receive time. Returns [`SourceError::Cancelled`](crate::error::SourceError)
    /// if `cancel` fires first.
    async fn get_backfill_messages(
        &self,
        args: BackfillArgs,
        cancel: &CancelToken,
    ) -> SourceResult<Vec<MessageEvent>>;

    /// Whether random access is cheap for this source
    fn is_indexed(&self) -> bool {
        false
    }
}
