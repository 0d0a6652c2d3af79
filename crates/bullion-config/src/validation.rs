//! Configuration validation.
//!
//! Collects every problem in one pass so a bad deployment reports all of
//! them at once, and fails before any connection is opened.

use crate::BullionConfig;
use std::fmt;

/// A single configuration problem.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Queue name is missing.
    EmptyQueueName,
    /// Key prefix is empty.
    EmptyPrefix,
    /// A key component contains the key separator.
    SeparatorInName { field: String, value: String },
    /// Redis URL has the wrong scheme.
    InvalidRedisUrl { url: String },
    /// Pool size is zero.
    ZeroPoolSize,
    /// Worker concurrency is zero.
    ZeroConcurrency,
    /// A duration that must be positive is zero.
    NonPositiveDuration { name: String },
    /// Lock renewal would not happen before the lock expires.
    RenewNotBeforeExpiry { renew_ms: u64, ttl_ms: u64 },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyQueueName => write!(f, "Queue name is required"),
            Self::EmptyPrefix => write!(f, "Queue prefix cannot be empty"),
            Self::SeparatorInName { field, value } => {
                write!(f, "{} '{}' must not contain ':'", field, value)
            }
            Self::InvalidRedisUrl { url } => {
                write!(f, "Invalid Redis URL '{}': must start with redis:// or rediss://", url)
            }
            Self::ZeroPoolSize => write!(f, "Redis pool size must be at least 1"),
            Self::ZeroConcurrency => write!(f, "Worker concurrency must be at least 1"),
            Self::NonPositiveDuration { name } => write!(f, "'{}' must be positive", name),
            Self::RenewNotBeforeExpiry { renew_ms, ttl_ms } => {
                write!(
                    f,
                    "Lock renewal interval ({}ms) must be shorter than the lock ttl ({}ms)",
                    renew_ms, ttl_ms
                )
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the entire configuration.
    pub fn validate(config: &BullionConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        Self::validate_redis(config, &mut errors);
        Self::validate_queue(config, &mut errors);
        Self::validate_worker(config, &mut errors);
        Self::validate_promoter(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_redis(config: &BullionConfig, errors: &mut Vec<ConfigValidationError>) {
        let redis = &config.redis;
        if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
            errors.push(ConfigValidationError::InvalidRedisUrl {
                url: redis.url.clone(),
            });
        }
        if redis.pool_size == 0 {
            errors.push(ConfigValidationError::ZeroPoolSize);
        }
        if redis.connect_timeout_secs == 0 {
            errors.push(non_positive("redis.connect_timeout_secs"));
        }
    }

    fn validate_queue(config: &BullionConfig, errors: &mut Vec<ConfigValidationError>) {
        let queue = &config.queue;
        if queue.name.is_empty() {
            errors.push(ConfigValidationError::EmptyQueueName);
        }
        if queue.prefix.is_empty() {
            errors.push(ConfigValidationError::EmptyPrefix);
        }

        for (field, value) in [("queue.name", &queue.name), ("queue.prefix", &queue.prefix)] {
            if value.contains(':') {
                errors.push(ConfigValidationError::SeparatorInName {
                    field: field.to_string(),
                    value: value.clone(),
                });
            }
        }
    }

    fn validate_worker(config: &BullionConfig, errors: &mut Vec<ConfigValidationError>) {
        let worker = &config.worker;
        if worker.concurrency == 0 {
            errors.push(ConfigValidationError::ZeroConcurrency);
        }
        if worker.lock_ttl_ms == 0 {
            errors.push(non_positive("worker.lock_ttl_ms"));
        }
        if worker.poll_interval_ms == 0 {
            errors.push(non_positive("worker.poll_interval_ms"));
        }

        match worker.lock_renew_ms {
            Some(0) => errors.push(non_positive("worker.lock_renew_ms")),
            Some(renew_ms) if renew_ms >= worker.lock_ttl_ms => {
                errors.push(ConfigValidationError::RenewNotBeforeExpiry {
                    renew_ms,
                    ttl_ms: worker.lock_ttl_ms,
                });
            }
            _ => {}
        }
    }

    fn validate_promoter(config: &BullionConfig, errors: &mut Vec<ConfigValidationError>) {
        let promoter = &config.promoter;
        if !promoter.enabled {
            return;
        }
        if promoter.max_interval_ms == 0 {
            errors.push(non_positive("promoter.max_interval_ms"));
        }
        if promoter.stalled_interval_ms == 0 {
            errors.push(non_positive("promoter.stalled_interval_ms"));
        }
    }
}

fn non_positive(name: &str) -> ConfigValidationError {
    ConfigValidationError::NonPositiveDuration {
        name: name.to_string(),
    }
}
