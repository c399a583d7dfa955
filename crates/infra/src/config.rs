//! Configuration loading and representation.

use std::str::FromStr;
use std::time::Duration;

use crate::contact_stream::DEFAULT_BATCH_SIZE;
use crate::jobs::RetryPolicy;

/// Default number of retries after the first attempt of a contact sync job.
pub const DEFAULT_RETRY_LIMIT: u32 = 4;

/// Runtime configuration of the contact sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactSyncConfig {
    /// SQLite connection URL (e.g. `sqlite://contacts.db`).
    pub database_url: String,
    /// Retries allowed after the first attempt.
    pub retry_limit: u32,
    /// First backoff delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Backoff cap.
    pub backoff_max: Duration,
    /// Records merged per transaction.
    pub batch_size: usize,
    /// Name for logging
    pub queue_name: String,
}

impl Default for ContactSyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            batch_size: DEFAULT_BATCH_SIZE,
            queue_name: "incoming-contact-sync".to_string(),
        }
    }
}

impl ContactSyncConfig {
    /// Load configuration from `CONTACT_SYNC_*` environment variables.
    ///
    /// Missing variables fall back to defaults; unparsable ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let database_url = lookup("CONTACT_SYNC_DATABASE_URL").unwrap_or_else(|| {
            tracing::warn!("CONTACT_SYNC_DATABASE_URL not set; using an in-memory database");
            defaults.database_url.clone()
        });

        Self {
            database_url,
            retry_limit: parse_or(&lookup, "CONTACT_SYNC_RETRY_LIMIT", defaults.retry_limit),
            backoff_base: Duration::from_millis(parse_or(
                &lookup,
                "CONTACT_SYNC_BACKOFF_BASE_MS",
                defaults.backoff_base.as_millis() as u64,
            )),
            backoff_max: Duration::from_millis(parse_or(
                &lookup,
                "CONTACT_SYNC_BACKOFF_MAX_MS",
                defaults.backoff_max.as_millis() as u64,
            )),
            batch_size: parse_or(&lookup, "CONTACT_SYNC_BATCH_SIZE", defaults.batch_size).max(1),
            queue_name: defaults.queue_name,
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Retry policy for the contact sync job queue.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.retry_limit, self.backoff_base, self.backoff_max)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable configuration value");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_contact_sync_policy() {
        let config = ContactSyncConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config.retry_limit, 4);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.database_url, "sqlite::memory:");
    }

    #[test]
    fn env_values_override_defaults() {
        let config = ContactSyncConfig::from_lookup(lookup_from(&[
            ("CONTACT_SYNC_DATABASE_URL", "sqlite://contacts.db"),
            ("CONTACT_SYNC_RETRY_LIMIT", "2"),
            ("CONTACT_SYNC_BACKOFF_BASE_MS", "10"),
            ("CONTACT_SYNC_BACKOFF_MAX_MS", "50"),
            ("CONTACT_SYNC_BATCH_SIZE", "16"),
        ]));

        assert_eq!(config.database_url, "sqlite://contacts.db");
        assert_eq!(config.retry_limit, 2);
        assert_eq!(config.backoff_base, Duration::from_millis(10));
        assert_eq!(config.backoff_max, Duration::from_millis(50));
        assert_eq!(config.batch_size, 16);
    }

    #[test]
    fn unparsable_values_fall_back() {
        let config = ContactSyncConfig::from_lookup(lookup_from(&[
            ("CONTACT_SYNC_RETRY_LIMIT", "lots"),
            ("CONTACT_SYNC_BATCH_SIZE", "0"),
        ]));
        assert_eq!(config.retry_limit, DEFAULT_RETRY_LIMIT);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn retry_policy_uses_configured_limit() {
        let policy = ContactSyncConfig::default().with_retry_limit(3).retry_policy();
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
