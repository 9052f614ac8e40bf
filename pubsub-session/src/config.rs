//! Client configuration and reconnect policy.

use std::time::Duration;

use crate::error::Error;

pub(crate) const DEFAULT_ORIGIN: &str = "ps.pndsn.com";
/// Long-poll window; the broker holds a subscribe request up to ~280s.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(310);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PUBLISH_SIZE: usize = 32 * 1024;
pub(crate) const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Immutable client configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Required for publishing; a subscribe-only client leaves this unset.
    pub publish_key: Option<String>,
    pub subscribe_key: String,
    /// Broker host. A bare host is reached over HTTPS; an `http://` or
    /// `https://` prefix is used as given.
    pub origin: String,
    /// Identity reported to the broker (presence, publisher id).
    pub uuid: String,
    /// Upper bound for one subscribe long-poll.
    pub poll_timeout: Duration,
    /// Upper bound for one publish request.
    pub request_timeout: Duration,
    pub max_publish_size: usize,
    /// Buffer size of [`EventStream`](crate::EventStream)s.
    pub event_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Config {
    pub fn new(subscribe_key: impl Into<String>) -> Self {
        Self {
            publish_key: None,
            subscribe_key: subscribe_key.into(),
            origin: DEFAULT_ORIGIN.to_string(),
            uuid: format!("pn-{}", uuid::Uuid::new_v4()),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_publish_size: DEFAULT_MAX_PUBLISH_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_publish_key(mut self, publish_key: impl Into<String>) -> Self {
        self.publish_key = Some(publish_key.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.subscribe_key.trim().is_empty() {
            return Err(Error::InvalidConfig("subscribe key must not be empty".into()));
        }
        if self.origin.trim().is_empty() {
            return Err(Error::InvalidConfig("origin must not be empty".into()));
        }
        if self.uuid.trim().is_empty() {
            return Err(Error::InvalidConfig("uuid must not be empty".into()));
        }
        if self.poll_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be greater than zero".into()));
        }
        if self.reconnect.max_backoff.is_zero() {
            return Err(Error::InvalidConfig("max backoff must be greater than zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event capacity must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Backoff applied by the session loop between failed polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Maximum random delay added to each backoff.
    pub jitter: Duration,
    /// Immediate retries after a malformed response before it is reported.
    pub malformed_retry_limit: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            max_attempts: None,
            jitter: Duration::from_secs(1),
            malformed_retry_limit: 1,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): 1s, 2s, 4s, ... capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let backoff = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        backoff.saturating_add(jitter_duration(self.jitter, attempt))
    }

    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

fn jitter_duration(max_jitter: Duration, attempt: u32) -> Duration {
    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }
    // Wall-clock subsecond nanos are random enough to spread clients apart.
    let now_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(32));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(32));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = ReconnectPolicy {
            jitter: Duration::from_millis(50),
            ..Default::default()
        };
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            let base = no_jitter().delay_for_attempt(attempt);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(50));
        }
    }

    #[test]
    fn huge_backoff_saturates() {
        let policy = ReconnectPolicy {
            initial_backoff: Duration::MAX,
            max_backoff: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::MAX);
        assert_eq!(policy.delay_for_attempt(40), Duration::MAX);
    }

    #[test]
    fn unlimited_attempts_by_default() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.attempts_exhausted(u32::MAX));

        let capped = ReconnectPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(!capped.attempts_exhausted(3));
        assert!(capped.attempts_exhausted(4));
    }

    #[test]
    fn config_defaults() {
        let config = Config::new("sub-key");
        assert_eq!(config.origin, DEFAULT_ORIGIN);
        assert!(config.uuid.starts_with("pn-"));
        assert!(config.publish_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_origin_trailing_slash_trimmed() {
        let config = Config::new("sub-key").with_origin("127.0.0.1:8080/");
        assert_eq!(config.origin, "127.0.0.1:8080");
    }

    #[test]
    fn config_rejects_empty_subscribe_key() {
        assert!(matches!(
            Config::new("  ").validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn config_rejects_zero_timeouts() {
        let config = Config::new("sub-key").with_poll_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
