pub mod cancel;
pub mod message;
pub mod problem;
pub mod time;

pub use cancel::CancelToken;
pub use message::{Initialization, MessageEvent, PreloadType, Subscription, Topic, TopicStats};
pub use problem::{Problem, ProblemManager, Severity};
pub use time::{Time, TimeRange};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
