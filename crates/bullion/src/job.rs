//! Job records and their stored representation.
//!
//! A job is persisted as a flat hash of string fields. Field names and
//! encodings are shared with other Bull-style implementations, so jobs written
//! by one worker version can be read by another:
//!
//! | field          | encoding                                         |
//! |----------------|--------------------------------------------------|
//! | `data`         | JSON payload                                     |
//! | `opts`         | JSON `{"delay": n, "backoff": {"type", "delay"}}` |
//! | `delay`        | decimal ms, `"undefined"` when never set          |
//! | `timestamp`    | decimal ms since the Unix epoch                   |
//! | `attempts`     | decimal, maximum attempts                         |
//! | `attemptsMade` | decimal                                           |
//! | `progress`     | decimal float                                     |
//! | `stacktrace`   | JSON array of strings, oldest first               |
//! | `returnvalue`  | JSON, `null` when absent                          |

use crate::error::{JobError, JobResult};
use crate::keys::QueueKeys;
use crate::retry::{Backoff, BackoffKind};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const FIELD_DATA: &str = "data";
pub const FIELD_OPTS: &str = "opts";
pub const FIELD_DELAY: &str = "delay";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_ATTEMPTS: &str = "attempts";
pub const FIELD_ATTEMPTS_MADE: &str = "attemptsMade";
pub const FIELD_PROGRESS: &str = "progress";
pub const FIELD_STACKTRACE: &str = "stacktrace";
pub const FIELD_RETURN_VALUE: &str = "returnvalue";

/// Stored value meaning "delay was never set".
pub const DELAY_UNSET: &str = "undefined";

/// Stack traces kept per job unless the queue is configured otherwise.
pub const DEFAULT_STACKTRACE_LIMIT: usize = 10;

/// Low bits of the delayed-set score reserved for the id tie-breaker.
const SCORE_ID_BITS: u32 = 12;
const SCORE_ID_MASK: u64 = (1 << SCORE_ID_BITS) - 1;

/// Latest eta whose delayed-set score stays exact as a Redis double (2^53).
pub const MAX_ETA_MS: i64 = (1 << (53 - SCORE_ID_BITS)) - 1;

/// Score of a job in the delayed set: `eta * 4096 + (id & 0xfff)`.
///
/// Jobs due at the same millisecond keep their creation order.
pub fn delayed_score(eta_ms: i64, id: JobId) -> JobResult<i64> {
    eta_ms
        .checked_mul(1 << SCORE_ID_BITS)
        .and_then(|score| score.checked_add((id.as_u64() & SCORE_ID_MASK) as i64))
        .ok_or_else(|| JobError::InvalidOptions(format!("eta {eta_ms}ms is out of range")))
}

/// Current wall-clock time in ms since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Timestamp component of a delayed-set score.
pub fn score_timestamp(score: i64) -> i64 {
    score >> SCORE_ID_BITS
}

/// Queue-assigned job identifier, taken from the queue's atomic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for JobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| JobError::decoding(s, format!("invalid job id: {e}")))
    }
}

/// Options accepted when enqueuing a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    /// Push to the claim end of the ready list.
    pub lifo: bool,

    /// Milliseconds to wait before the job becomes ready.
    pub delay_ms: i64,

    /// Absolute time the job becomes ready. Takes precedence over `delay_ms`.
    pub eta: Option<DateTime<Utc>>,

    /// Delay policy between failed attempts.
    pub backoff: Backoff,

    /// Maximum number of attempts, including the first.
    pub attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            lifo: false,
            delay_ms: 0,
            eta: None,
            backoff: Backoff::None,
            attempts: 1,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    /// Set a delay before the job becomes ready.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.eta = None;
        self
    }

    /// Make the job ready at a specific time.
    pub fn at(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Rejects options that could never describe a valid job.
    pub fn validate(&self) -> JobResult<()> {
        if self.delay_ms < 0 {
            return Err(JobError::InvalidOptions(format!(
                "delay must not be negative (got {}ms)",
                self.delay_ms
            )));
        }
        if self.attempts == 0 {
            return Err(JobError::InvalidOptions(
                "attempts must be at least 1".to_string(),
            ));
        }
        if self.delay_ms > MAX_ETA_MS {
            return Err(JobError::InvalidOptions(format!(
                "delay must not exceed {}ms (got {}ms)",
                MAX_ETA_MS, self.delay_ms
            )));
        }
        if let Some(eta) = self.eta {
            check_eta(eta.timestamp_millis())?;
        }
        Ok(())
    }

    /// Eta of a job created at `now_ms`, rejected when its score would not
    /// survive the delayed set.
    pub(crate) fn resolve_eta(&self, now_ms: i64) -> JobResult<i64> {
        check_eta(now_ms.saturating_add(self.resolve_delay(now_ms)))
    }

    /// Delay relative to `now_ms`, with `eta` taking precedence.
    pub(crate) fn resolve_delay(&self, now_ms: i64) -> i64 {
        match self.eta {
            Some(eta) => (eta.timestamp_millis() - now_ms).max(0),
            None => self.delay_ms,
        }
    }
}

fn check_eta(eta_ms: i64) -> JobResult<i64> {
    if eta_ms > MAX_ETA_MS {
        return Err(JobError::InvalidOptions(format!(
            "eta {}ms is past the latest schedulable time ({}ms)",
            eta_ms, MAX_ETA_MS
        )));
    }
    Ok(eta_ms)
}

/// A unit of work as stored in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Queue-assigned id.
    pub id: JobId,

    /// Opaque payload.
    pub data: Value,

    /// Milliseconds after `timestamp` before the job was eligible to run.
    pub delay: i64,

    /// Creation time in ms since the Unix epoch.
    pub timestamp: i64,

    /// Maximum attempts.
    pub attempts: u32,

    /// Attempts started so far.
    pub attempts_made: u32,

    /// Retry delay policy.
    pub backoff: Backoff,

    /// Application-defined progress.
    pub progress: f64,

    /// Failure messages, oldest first.
    pub stacktraces: Vec<String>,

    /// Handler result once completed.
    pub return_value: Option<Value>,

    queue: QueueKeys,
}

impl Job {
    /// Creates a job that has not been enqueued yet.
    pub(crate) fn pending(queue: QueueKeys, data: Value, opts: &JobOptions, now_ms: i64) -> Self {
        Self {
            id: JobId::default(),
            data,
            delay: opts.resolve_delay(now_ms),
            timestamp: now_ms,
            attempts: opts.attempts,
            attempts_made: 0,
            backoff: opts.backoff,
            progress: 0.0,
            stacktraces: Vec::new(),
            return_value: None,
            queue,
        }
    }

    /// Queue this job belongs to.
    pub fn queue(&self) -> &QueueKeys {
        &self.queue
    }

    /// Key of the lock guarding this job while it is active.
    pub fn lock_key(&self) -> String {
        self.queue.lock(self.id)
    }

    /// Earliest time the job may run, in ms since the Unix epoch.
    pub fn eta_ms(&self) -> i64 {
        self.timestamp.saturating_add(self.delay)
    }

    /// Deserialize the payload into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> JobResult<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| JobError::decoding(self.id, format!("payload: {e}")))
    }

    /// Append a failure message, dropping the oldest beyond `limit`.
    pub fn push_stacktrace(&mut self, entry: impl Into<String>, limit: usize) {
        self.stacktraces.push(entry.into());
        if self.stacktraces.len() > limit {
            let excess = self.stacktraces.len() - limit;
            self.stacktraces.drain(..excess);
        }
    }

    /// True when another failure would not be retried.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts_made >= self.attempts
    }

    /// Encode into the stored field representation.
    pub fn to_fields(&self) -> JobResult<Vec<(&'static str, String)>> {
        let mut opts = Map::new();
        opts.insert(FIELD_DELAY.to_string(), json!(self.delay));
        if self.backoff.kind() != BackoffKind::None {
            opts.insert(
                "backoff".to_string(),
                json!({
                    "type": self.backoff.kind().as_str(),
                    "delay": self.backoff.delay_ms(),
                }),
            );
        }

        let return_value = match &self.return_value {
            Some(value) => serde_json::to_string(value)?,
            None => "null".to_string(),
        };

        Ok(vec![
            (FIELD_DATA, serde_json::to_string(&self.data)?),
            (FIELD_OPTS, serde_json::to_string(&Value::Object(opts))?),
            (FIELD_DELAY, self.delay.to_string()),
            (FIELD_TIMESTAMP, self.timestamp.to_string()),
            (FIELD_ATTEMPTS, self.attempts.to_string()),
            (FIELD_ATTEMPTS_MADE, self.attempts_made.to_string()),
            (FIELD_PROGRESS, self.progress.to_string()),
            (FIELD_STACKTRACE, encode_stacktraces(&self.stacktraces)?),
            (FIELD_RETURN_VALUE, return_value),
        ])
    }

    /// Decode a stored record.
    pub fn from_fields(queue: QueueKeys, id: JobId, fields: &HashMap<String, String>) -> JobResult<Self> {
        let field = |name: &str| fields.get(name).map(String::as_str);

        let data = match field(FIELD_DATA) {
            Some(raw) => parse_json(id, FIELD_DATA, raw)?,
            None => return Err(JobError::decoding(id, "missing field data")),
        };

        let delay = match field(FIELD_DELAY) {
            None | Some("" | DELAY_UNSET) => 0,
            Some(raw) => parse_number(id, FIELD_DELAY, raw)?,
        };

        let timestamp = match field(FIELD_TIMESTAMP) {
            Some(raw) => parse_number(id, FIELD_TIMESTAMP, raw)?,
            None => return Err(JobError::decoding(id, "missing field timestamp")),
        };

        let attempts = match field(FIELD_ATTEMPTS) {
            None | Some("") => 1,
            Some(raw) => parse_number(id, FIELD_ATTEMPTS, raw)?,
        };

        let attempts_made = match field(FIELD_ATTEMPTS_MADE) {
            None | Some("") => 0,
            Some(raw) => parse_number(id, FIELD_ATTEMPTS_MADE, raw)?,
        };

        let progress = match field(FIELD_PROGRESS) {
            None | Some("") => 0.0,
            Some(raw) => parse_number(id, FIELD_PROGRESS, raw)?,
        };

        let backoff = match field(FIELD_OPTS) {
            None | Some("") => Backoff::None,
            Some(raw) => decode_backoff(id, &parse_json(id, FIELD_OPTS, raw)?)?,
        };

        let stacktraces = match field(FIELD_STACKTRACE) {
            None | Some("") => Vec::new(),
            Some(raw) => decode_stacktraces(id, &parse_json(id, FIELD_STACKTRACE, raw)?)?,
        };

        let return_value = match field(FIELD_RETURN_VALUE) {
            None | Some("") => None,
            Some(raw) => match parse_json(id, FIELD_RETURN_VALUE, raw)? {
                Value::Null => None,
                value => Some(value),
            },
        };

        Ok(Self {
            id,
            data,
            delay,
            timestamp,
            attempts,
            attempts_made,
            backoff,
            progress,
            stacktraces,
            return_value,
            queue,
        })
    }
}

/// Encode a stack-trace list as stored in the `stacktrace` field.
pub fn encode_stacktraces(stacktraces: &[String]) -> JobResult<String> {
    Ok(serde_json::to_string(stacktraces)?)
}

/// Encode a handler result as stored in the `returnvalue` field.
pub fn encode_return_value(value: &Value) -> JobResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn parse_json(id: JobId, field: &str, raw: &str) -> JobResult<Value> {
    serde_json::from_str(raw).map_err(|e| JobError::decoding(id, format!("{field}: {e}")))
}

fn parse_number<T: FromStr>(id: JobId, field: &str, raw: &str) -> JobResult<T>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| JobError::decoding(id, format!("{field}: {e} (got {raw:?})")))
}

#[derive(Deserialize)]
struct StoredBackoff {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delay: u64,
}

fn decode_backoff(id: JobId, opts: &Value) -> JobResult<Backoff> {
    match opts.get("backoff") {
        None | Some(Value::Null) => Ok(Backoff::None),
        // A bare number is shorthand for a fixed delay.
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|delay_ms| Backoff::Fixed { delay_ms })
            .ok_or_else(|| JobError::decoding(id, format!("opts.backoff: invalid delay {n}"))),
        Some(value) => {
            let stored: StoredBackoff = serde_json::from_value(value.clone())
                .map_err(|e| JobError::decoding(id, format!("opts.backoff: {e}")))?;
            let kind = stored
                .kind
                .parse::<BackoffKind>()
                .map_err(|e| JobError::decoding(id, format!("opts.backoff: {e}")))?;
            Ok(Backoff::from_kind(kind, stored.delay))
        }
    }
}

fn decode_stacktraces(id: JobId, value: &Value) -> JobResult<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()),
        other => Err(JobError::decoding(
            id,
            format!("stacktrace: expected array, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> QueueKeys {
        QueueKeys::new("bull", "test").unwrap()
    }

    fn sample_job() -> Job {
        let opts = JobOptions::new()
            .attempts(3)
            .backoff(Backoff::Exponential { delay_ms: 100 });
        let mut job = Job::pending(keys(), json!({"to": "a@example.com"}), &opts, 1_700_000_000_000);
        job.id = JobId::new(42);
        job
    }

    fn to_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_round_trip_fresh_job() {
        let job = sample_job();
        let fields = to_map(job.to_fields().unwrap());
        let restored = Job::from_fields(keys(), job.id, &fields).unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_round_trip_with_history() {
        let mut job = sample_job();
        job.delay = 2500;
        job.attempts_made = 2;
        job.progress = 42.5;
        job.push_stacktrace("boom", 10);
        job.push_stacktrace("boom again", 10);
        job.return_value = Some(json!({"sent": true}));

        let fields = to_map(job.to_fields().unwrap());
        let restored = Job::from_fields(keys(), job.id, &fields).unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_round_trip_every_backoff_kind() {
        for backoff in [
            Backoff::None,
            Backoff::Fixed { delay_ms: 250 },
            Backoff::Exponential { delay_ms: 100 },
        ] {
            let mut job = sample_job();
            job.backoff = backoff;
            let fields = to_map(job.to_fields().unwrap());
            let restored = Job::from_fields(keys(), job.id, &fields).unwrap();
            assert_eq!(restored.backoff, backoff);
        }
    }

    #[test]
    fn test_serialized_field_layout() {
        let fields = to_map(sample_job().to_fields().unwrap());

        assert_eq!(fields[FIELD_DATA], r#"{"to":"a@example.com"}"#);
        assert_eq!(fields[FIELD_DELAY], "0");
        assert_eq!(fields[FIELD_TIMESTAMP], "1700000000000");
        assert_eq!(fields[FIELD_ATTEMPTS], "3");
        assert_eq!(fields[FIELD_ATTEMPTS_MADE], "0");
        assert_eq!(fields[FIELD_PROGRESS], "0");
        assert_eq!(fields[FIELD_STACKTRACE], "[]");
        assert_eq!(fields[FIELD_RETURN_VALUE], "null");

        let opts: Value = serde_json::from_str(&fields[FIELD_OPTS]).unwrap();
        assert_eq!(opts["backoff"]["type"], "exponential");
        assert_eq!(opts["backoff"]["delay"], 100);
    }

    #[test]
    fn test_no_backoff_omits_opts_entry() {
        let mut job = sample_job();
        job.backoff = Backoff::None;
        let fields = to_map(job.to_fields().unwrap());
        let opts: Value = serde_json::from_str(&fields[FIELD_OPTS]).unwrap();
        assert!(opts.get("backoff").is_none());
    }

    #[test]
    fn test_unset_delay_reads_as_zero() {
        let mut fields = to_map(sample_job().to_fields().unwrap());
        fields.insert(FIELD_DELAY.to_string(), DELAY_UNSET.to_string());

        let job = Job::from_fields(keys(), JobId::new(1), &fields).unwrap();
        assert_eq!(job.delay, 0);
    }

    #[test]
    fn test_reads_legacy_string_delay_and_numeric_backoff() {
        let mut fields = to_map(sample_job().to_fields().unwrap());
        fields.insert(
            FIELD_OPTS.to_string(),
            r#"{"delay":"1500","backoff":3000}"#.to_string(),
        );

        let job = Job::from_fields(keys(), JobId::new(1), &fields).unwrap();
        assert_eq!(job.backoff, Backoff::Fixed { delay_ms: 3000 });
    }

    #[test]
    fn test_malformed_numeric_field_is_decoding_error() {
        let mut fields = to_map(sample_job().to_fields().unwrap());
        fields.insert(FIELD_TIMESTAMP.to_string(), "yesterday".to_string());

        let err = Job::from_fields(keys(), JobId::new(9), &fields).unwrap_err();
        assert!(matches!(err, JobError::Decoding { .. }));
    }

    #[test]
    fn test_malformed_payload_is_decoding_error() {
        let mut fields = to_map(sample_job().to_fields().unwrap());
        fields.insert(FIELD_DATA.to_string(), "{not json".to_string());

        let err = Job::from_fields(keys(), JobId::new(9), &fields).unwrap_err();
        assert!(matches!(err, JobError::Decoding { .. }));
    }

    #[test]
    fn test_unknown_backoff_kind_is_decoding_error() {
        let mut fields = to_map(sample_job().to_fields().unwrap());
        fields.insert(
            FIELD_OPTS.to_string(),
            r#"{"delay":0,"backoff":{"type":"linear","delay":5}}"#.to_string(),
        );

        let err = Job::from_fields(keys(), JobId::new(9), &fields).unwrap_err();
        assert!(matches!(err, JobError::Decoding { .. }));
    }

    #[test]
    fn test_stacktrace_is_capped() {
        let mut job = sample_job();
        for i in 0..5 {
            job.push_stacktrace(format!("error {i}"), 3);
        }
        assert_eq!(job.stacktraces, vec!["error 2", "error 3", "error 4"]);
    }

    #[test]
    fn test_lock_key() {
        let job = sample_job();
        assert_eq!(job.lock_key(), "bull:test:42:lock");
    }

    #[test]
    fn test_delayed_score_layout() {
        let score = delayed_score(1_000, JobId::new(4097)).unwrap();
        assert_eq!(score, 1_000 * 4096 + 1);
        assert_eq!(score_timestamp(score), 1_000);

        // same eta, creation order preserved
        assert!(delayed_score(5, JobId::new(7)).unwrap() < delayed_score(5, JobId::new(8)).unwrap());
    }

    #[test]
    fn test_delayed_score_overflow_is_an_error() {
        assert!(matches!(
            delayed_score(i64::MAX, JobId::new(1)),
            Err(JobError::InvalidOptions(_))
        ));
        let latest = delayed_score(MAX_ETA_MS, JobId::new(4095)).unwrap();
        assert!(latest < 1 << 53);
    }

    #[test]
    fn test_far_future_options_are_rejected() {
        let huge_delay = JobOptions::new().delay(Duration::from_secs(u64::MAX));
        assert!(matches!(huge_delay.validate(), Err(JobError::InvalidOptions(_))));

        let huge_eta = JobOptions::new().at(DateTime::<Utc>::MAX_UTC);
        assert!(matches!(huge_eta.validate(), Err(JobError::InvalidOptions(_))));

        // each bound passes alone but not added to the creation time
        let edge = JobOptions::new().delay(Duration::from_millis(MAX_ETA_MS as u64));
        assert!(edge.validate().is_ok());
        assert!(edge.resolve_eta(0).is_ok());
        assert!(matches!(edge.resolve_eta(1), Err(JobError::InvalidOptions(_))));
    }

    #[test]
    fn test_options_validation() {
        assert!(JobOptions::new().validate().is_ok());

        let negative = JobOptions {
            delay_ms: -1,
            ..JobOptions::default()
        };
        assert!(matches!(negative.validate(), Err(JobError::InvalidOptions(_))));

        let no_attempts = JobOptions::new().attempts(0);
        assert!(matches!(no_attempts.validate(), Err(JobError::InvalidOptions(_))));
    }

    #[test]
    fn test_eta_overrides_delay() {
        let now = 10_000;
        let eta = DateTime::<Utc>::from_timestamp_millis(12_500).unwrap();
        let opts = JobOptions::new().delay(Duration::from_secs(60)).at(eta);
        assert_eq!(opts.resolve_delay(now), 2_500);

        let past = DateTime::<Utc>::from_timestamp_millis(5_000).unwrap();
        assert_eq!(JobOptions::new().at(past).resolve_delay(now), 0);
    }

    #[test]
    fn test_data_as() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Email {
            to: String,
        }

        let job = sample_job();
        let email: Email = job.data_as().unwrap();
        assert_eq!(email.to, "a@example.com");
    }
}
