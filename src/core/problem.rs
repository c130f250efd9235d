use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::lock;

/// Severity of a reported problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warn,
    Info,
}

/// A warning or error surfaced to the consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub severity: Severity,
    pub message: String,
    /// Display form of the originating error, including its causes
    pub error: Option<String>,
    /// Hint on how to resolve the problem
    pub tip: Option<String>,
}

impl Problem {
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(Severity::Warn, message)
    }

    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            error: None,
            tip: None,
        }
    }

    pub fn with_error(mut self, error: &dyn std::error::Error) -> Self {
        let mut text = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        self.error = Some(text);
        self
    }

    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }
}

/// Current problems keyed by cause.
///
/// Re-reporting a cause replaces its previous entry. The handle is cheap to
/// clone; the block loaders and the engine share one set.
#[derive(Debug, Clone, Default)]
pub struct ProblemManager {
    problems: Arc<Mutex<BTreeMap<String, Problem>>>,
}

impl ProblemManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_problem(&self, key: impl Into<String>, problem: Problem) {
        lock(&self.problems).insert(key.into(), problem);
    }

    /// Remove a problem whose cause resolved. Returns whether one was present.
    pub fn remove_problem(&self, key: &str) -> bool {
        lock(&self.problems).remove(key).is_some()
    }

    pub fn has_problem(&self, key: &str) -> bool {
        lock(&self.problems).contains_key(key)
    }

    /// Snapshot of all current problems, ordered by key
    pub fn problems(&self) -> Vec<Problem> {
        lock(&self.problems).values().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.problems).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_cause_overwrites() {
        let manager = ProblemManager::new();
        manager.add_problem("block-1", Problem::warn("first"));
        manager.add_problem("block-1", Problem::warn("second"));

        let problems = manager.problems();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].message, "second");
    }

    #[test]
    fn test_remove_resolved_problem() {
        let manager = ProblemManager::new();
        manager.add_problem("a", Problem::error("broken"));
        manager.add_problem("b", Problem::warn("slow"));

        assert!(manager.remove_problem("a"));
        assert!(!manager.remove_problem("a"));
        assert!(!manager.has_problem("a"));
        assert_eq!(manager.problems().len(), 1);
    }

    #[test]
    fn test_survives_a_panicking_holder() {
        let manager = ProblemManager::new();
        manager.add_problem("a", Problem::warn("kept"));
        let poisoner = manager.clone();
        let result = std::thread::spawn(move || {
            let _held = poisoner.problems.lock().unwrap();
            panic!("holder panicked");
        })
        .join();
        assert!(result.is_err());
        assert!(manager.problems.is_poisoned());

        manager.add_problem("b", Problem::warn("added"));
        assert_eq!(manager.problems().len(), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let manager = ProblemManager::new();
        let other = manager.clone();
        other.add_problem("x", Problem::error("boom"));
        assert!(manager.has_problem("x"));
    }

    #[test]
    fn test_with_error_includes_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let problem = Problem::error("read failed").with_error(&io);
        assert_eq!(problem.error.as_deref(), Some("disk gone"));
    }
}
