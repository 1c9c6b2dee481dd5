//! Failure injection for the mock collaborators.

use std::collections::HashMap;
use std::time::Duration;

/// Mocked operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ReleaseLookup,
    TagCommit,
    Fetch,
    Build,
}

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Error message to return (None = succeed after the delay)
    pub message: Option<String>,
    /// Delay to add before responding
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            delay: None,
            fail_count: None,
        }
    }

    pub fn delay(duration: Duration) -> Self {
        Self {
            message: None,
            delay: Some(duration),
            fail_count: None,
        }
    }

    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }
}

#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<MockOp, FailureConfig>,
    call_counts: HashMap<MockOp, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, op: MockOp, config: FailureConfig) {
        self.configs.insert(op, config);
        self.call_counts.insert(op, 0);
    }

    pub fn clear(&mut self, op: MockOp) {
        self.configs.remove(&op);
        self.call_counts.remove(&op);
    }

    /// Count a call to `op`. Returns the configured failure while it is
    /// still active.
    pub fn check(&mut self, op: MockOp) -> Option<FailureConfig> {
        let config = self.configs.get(&op)?;
        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;
        match config.fail_count {
            Some(limit) if *count > limit => None,
            _ => Some(config.clone()),
        }
    }

    /// Apply any injected delay, then return the injected error message.
    pub fn trip(&mut self, op: MockOp) -> Option<String> {
        let config = self.check(op)?;
        if let Some(delay) = config.delay {
            std::thread::sleep(delay);
        }
        config.message
    }
}
