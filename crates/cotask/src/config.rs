//! Executor configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::queue::Handoff;

/// When a newly created task first runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    /// Runs once it is awaited, submitted, or detached.
    #[default]
    Lazy,
    /// Polled inline at creation until its first suspension.
    Eager,
}

/// Where a finished task's awaiter is resumed.
///
/// `Immediate` puts the awaiter at the front of the ready queue so the run
/// loop picks it up next. Chains of any depth unwind through the loop rather
/// than the call stack. `Queued` puts it at the back, behind work that was
/// already ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumePolicy {
    #[default]
    Immediate,
    Queued,
}

impl ResumePolicy {
    pub(crate) fn handoff(self) -> Handoff {
        match self {
            Self::Immediate => Handoff::Front,
            Self::Queued => Handoff::Back,
        }
    }
}

/// Unrecognized policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} policy: {value:?}")]
pub struct ParsePolicyError {
    kind: &'static str,
    value: String,
}

impl FromStr for StartPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lazy" => Ok(Self::Lazy),
            "eager" => Ok(Self::Eager),
            _ => Err(ParsePolicyError {
                kind: "start",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for ResumePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "queued" => Ok(Self::Queued),
            _ => Err(ParsePolicyError {
                kind: "resume",
                value: s.to_string(),
            }),
        }
    }
}

/// Settings for one [`Executor`](crate::Executor).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub start: StartPolicy,
    pub resume: ResumePolicy,
    /// How long `sync_wait` blocks on an empty queue before giving up.
    /// `None` waits forever.
    pub stall_timeout_ms: Option<u64>,
}

impl ExecutorConfig {
    pub fn with_start(mut self, start: StartPolicy) -> Self {
        self.start = start;
        self
    }

    pub fn with_resume(mut self, resume: ResumePolicy) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    /// Read `COTASK_START`, `COTASK_RESUME` and `COTASK_STALL_TIMEOUT_MS`.
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("COTASK_START") {
            match raw.parse() {
                Ok(start) => config.start = start,
                Err(err) => tracing::warn!(error = %err, "Ignoring COTASK_START"),
            }
        }

        if let Some(raw) = lookup("COTASK_RESUME") {
            match raw.parse() {
                Ok(resume) => config.resume = resume,
                Err(err) => tracing::warn!(error = %err, "Ignoring COTASK_RESUME"),
            }
        }

        if let Some(raw) = lookup("COTASK_STALL_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.stall_timeout_ms = Some(ms),
                Err(_) => tracing::warn!(
                    value = %raw,
                    "Invalid COTASK_STALL_TIMEOUT_MS, waiting without limit"
                ),
            }
        }

        config
    }
}
