//! Backoff policies for failed jobs.

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on any computed backoff delay (one week).
pub const MAX_BACKOFF_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Backoff kind as written in the stored `opts.backoff.type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Retry right away.
    None,
    /// Constant delay between retries.
    Fixed,
    /// Delay doubles with every failed attempt.
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::None => "none",
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
        }
    }
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BackoffKind::None),
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(JobError::InvalidOptions(format!(
                "unknown backoff kind {other:?}"
            ))),
        }
    }
}

/// Retry delay policy attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// No delay before the next attempt.
    #[default]
    None,
    /// Wait `delay_ms` before every retry.
    Fixed { delay_ms: u64 },
    /// Wait `delay_ms * 2^(attempts_made - 1)` before the next retry.
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Creates a fixed backoff.
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed {
            delay_ms: duration_ms(delay),
        }
    }

    /// Creates an exponential backoff.
    pub fn exponential(delay: Duration) -> Self {
        Backoff::Exponential {
            delay_ms: duration_ms(delay),
        }
    }

    /// Builds a backoff from its stored kind and base delay.
    pub fn from_kind(kind: BackoffKind, delay_ms: u64) -> Self {
        match kind {
            BackoffKind::None => Backoff::None,
            BackoffKind::Fixed => Backoff::Fixed { delay_ms },
            BackoffKind::Exponential => Backoff::Exponential { delay_ms },
        }
    }

    /// Parses a kind name such as `"exponential"` together with its base delay.
    pub fn parse(kind: &str, delay_ms: u64) -> JobResult<Self> {
        Ok(Self::from_kind(kind.parse()?, delay_ms))
    }

    pub fn kind(&self) -> BackoffKind {
        match self {
            Backoff::None => BackoffKind::None,
            Backoff::Fixed { .. } => BackoffKind::Fixed,
            Backoff::Exponential { .. } => BackoffKind::Exponential,
        }
    }

    /// Base delay in milliseconds.
    pub fn delay_ms(&self) -> u64 {
        match self {
            Backoff::None => 0,
            Backoff::Fixed { delay_ms } | Backoff::Exponential { delay_ms } => *delay_ms,
        }
    }

    /// Delay before the retry that follows `attempts_made` failed attempts.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        let ms = match *self {
            Backoff::None => 0,
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1);
                let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
                delay_ms.saturating_mul(factor)
            }
        };

        Duration::from_millis(ms.min(MAX_BACKOFF_MS))
    }
}

fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
