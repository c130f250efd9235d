pub mod buffered;
pub mod iterable;
pub mod memory;
pub mod mock;

pub use buffered::{BufferedCursor, BufferedSource, ReadAheadLimits};
pub use iterable::{
    BackfillArgs, ConsumptionType, IterableSource, IteratorResult, MessageCursor, MessageIteratorArgs,
};
pub use memory::MemorySource;
pub use mock::{MockSource, MockStats};
