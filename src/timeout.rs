//! Timeout bounds for the staging and validation pipelines.
//!
//! - `fetch_seconds`: maximum wall-clock time for the source checkout
//! - `build_seconds`: maximum wall-clock time per build command
//! - `check_seconds`: per-check budget inside the validation suite
//! - `suite_seconds`: global budget for the whole validation suite
//!
//! Timeouts are enforced by the caller; a [`Deadline`] only tracks time.
//! Expiry never cancels a stage mid-way except by killing an isolated
//! child process.

use std::time::{Duration, Instant};

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Source checkout limit (default: 300)
    pub fetch_seconds: u64,

    /// Limit per build command (default: 1800 = 30 min)
    pub build_seconds: u64,

    /// Limit per validation check (default: 60)
    pub check_seconds: u64,

    /// Limit for the whole validation suite (default: 300)
    pub suite_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_seconds: 300,
            build_seconds: 1800,
            check_seconds: 60,
            suite_seconds: 300,
        }
    }
}

impl TimeoutConfig {
    /// Validate bounds.
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        // fetch_seconds must be in (0, 86400]
        if self.fetch_seconds == 0 || self.fetch_seconds > 86400 {
            return Err(TimeoutValidationError::FetchOutOfBounds {
                value: self.fetch_seconds,
            });
        }

        // build_seconds must be in (0, 86400]
        if self.build_seconds == 0 || self.build_seconds > 86400 {
            return Err(TimeoutValidationError::BuildOutOfBounds {
                value: self.build_seconds,
            });
        }

        // check_seconds must be in (0, 3600]
        if self.check_seconds == 0 || self.check_seconds > 3600 {
            return Err(TimeoutValidationError::CheckOutOfBounds {
                value: self.check_seconds,
            });
        }

        // suite_seconds must be in [check_seconds, 86400]
        if self.suite_seconds < self.check_seconds || self.suite_seconds > 86400 {
            return Err(TimeoutValidationError::SuiteOutOfBounds {
                value: self.suite_seconds,
                min: self.check_seconds,
            });
        }

        Ok(())
    }

    /// Create TimeoutConfig from effective config values
    pub fn from_config(
        fetch: Option<u64>,
        build: Option<u64>,
        check: Option<u64>,
        suite: Option<u64>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            fetch_seconds: fetch.unwrap_or(defaults.fetch_seconds),
            build_seconds: build.unwrap_or(defaults.build_seconds),
            check_seconds: check.unwrap_or(defaults.check_seconds),
            suite_seconds: suite.unwrap_or(defaults.suite_seconds),
        }
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_seconds)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_seconds)
    }

    pub fn check(&self) -> Duration {
        Duration::from_secs(self.check_seconds)
    }

    pub fn suite(&self) -> Duration {
        Duration::from_secs(self.suite_seconds)
    }
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("fetch_timeout_seconds must be in (0, 86400], got {value}")]
    FetchOutOfBounds { value: u64 },

    #[error("build_timeout_seconds must be in (0, 86400], got {value}")]
    BuildOutOfBounds { value: u64 },

    #[error("check_timeout_seconds must be in (0, 3600], got {value}")]
    CheckOutOfBounds { value: u64 },

    #[error("suite_timeout_seconds must be in [{min}, 86400], got {value}")]
    SuiteOutOfBounds { value: u64, min: u64 },
}

/// Wall-clock budget that started at construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    /// The shorter of `limit` and the time remaining.
    pub fn cap(&self, limit: Duration) -> Duration {
        limit.min(self.remaining())
    }
}
