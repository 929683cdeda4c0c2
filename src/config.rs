use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::signing::DEFAULT_SIGNATURE_HEADER;

/// Upper bound on per-run fan-out, regardless of configuration.
pub const MAX_CONCURRENCY_LIMIT: usize = 10;

/// Minimum headroom of the claim lease over the request timeout.
pub const CLAIM_LEASE_MARGIN: Duration = Duration::from_secs(5);

/// Exponential retry backoff.
///
/// Delay before attempt `n + 1` after `n` failures is
/// `min(base * 2^(n-1), max)` plus up to `jitter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    /// Delay before the next attempt, given the failed attempt count.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let base_ms = self.base.as_millis().max(1) as u64;
        let max_ms = (self.max.as_millis() as u64).max(base_ms);
        let pow = 2u64.saturating_pow(attempt_count.saturating_sub(1));
        let exp = base_ms.saturating_mul(pow).min(max_ms);

        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            fastrand::u64(0..=jitter_ms)
        };

        Duration::from_millis(exp.saturating_add(jitter))
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum records fetched per run.
    pub batch_limit: usize,

    /// Records delivered concurrently within one run. Clamped to
    /// `1..=MAX_CONCURRENCY_LIMIT`.
    pub max_concurrency: usize,

    /// Timeout for a single delivery attempt.
    pub request_timeout: Duration,

    /// Once elapsed, no new record of the batch is started.
    pub run_deadline: Option<Duration>,

    /// How long a claimed record stays invisible to other runs. Never
    /// shorter than `request_timeout + CLAIM_LEASE_MARGIN` in effect.
    pub claim_lease: Duration,

    pub user_agent: String,
    pub signature_header: String,

    /// `None` makes retrying records due again immediately.
    pub backoff: Option<Backoff>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_limit: 50,
            max_concurrency: 5,
            request_timeout: Duration::from_secs(10),
            run_deadline: None,
            claim_lease: Duration::from_secs(60),
            user_agent: format!("WebhookDelivery-Webhook/{}", env!("CARGO_PKG_VERSION")),
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            backoff: None,
        }
    }
}

impl DispatcherConfig {
    /// Build from `WEBHOOK_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(limit) = parse_var::<usize, _>(&lookup, "WEBHOOK_BATCH_LIMIT")? {
            if limit == 0 {
                return Err(ConfigError {
                    key: "WEBHOOK_BATCH_LIMIT".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.batch_limit = limit;
        }
        if let Some(n) = parse_var(&lookup, "WEBHOOK_MAX_CONCURRENCY")? {
            config.max_concurrency = n;
        }
        if let Some(ms) = parse_var(&lookup, "WEBHOOK_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "WEBHOOK_RUN_DEADLINE_MS")? {
            config.run_deadline = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var(&lookup, "WEBHOOK_CLAIM_LEASE_MS")? {
            config.claim_lease = Duration::from_millis(ms);
        }
        if let Some(header) = lookup("WEBHOOK_SIGNATURE_HEADER") {
            config.signature_header = header;
        }
        if let Some(agent) = lookup("WEBHOOK_USER_AGENT") {
            config.user_agent = agent;
        }

        if let Some(base_ms) = parse_var::<u64, _>(&lookup, "WEBHOOK_BACKOFF_BASE_MS")? {
            let max_ms = parse_var(&lookup, "WEBHOOK_BACKOFF_MAX_MS")?.unwrap_or(base_ms.saturating_mul(32));
            let jitter_ms = parse_var(&lookup, "WEBHOOK_BACKOFF_JITTER_MS")?.unwrap_or(0);
            config.backoff = Some(Backoff::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
                Duration::from_millis(jitter_ms),
            ));
        }

        if config.claim_lease <= config.request_timeout {
            return Err(ConfigError {
                key: "WEBHOOK_CLAIM_LEASE_MS".to_string(),
                reason: format!(
                    "claim lease {}ms must exceed the request timeout {}ms",
                    config.claim_lease.as_millis(),
                    config.request_timeout.as_millis()
                ),
            });
        }

        Ok(config)
    }

    /// Lease used when claiming a record.
    ///
    /// A lease that could expire while the attempt is still in flight
    /// would let another run deliver the same record concurrently.
    pub fn effective_claim_lease(&self) -> Duration {
        self.claim_lease
            .max(self.request_timeout.saturating_add(CLAIM_LEASE_MARGIN))
    }

    /// Effective fan-out for a run.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_CONCURRENCY_LIMIT)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };

    raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = DispatcherConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.batch_limit, 50);
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.signature_header, "X-Webhook-Signature");
        assert!(config.user_agent.starts_with("WebhookDelivery-Webhook/"));
        assert!(config.backoff.is_none());
        assert!(config.run_deadline.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = DispatcherConfig::from_lookup(lookup_from(&[
            ("WEBHOOK_BATCH_LIMIT", "20"),
            ("WEBHOOK_REQUEST_TIMEOUT_MS", "1500"),
            ("WEBHOOK_RUN_DEADLINE_MS", "30000"),
            ("WEBHOOK_SIGNATURE_HEADER", "X-SiteVoice-Signature"),
            ("WEBHOOK_BACKOFF_BASE_MS", "100"),
        ]))
        .unwrap();

        assert_eq!(config.batch_limit, 20);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.run_deadline, Some(Duration::from_secs(30)));
        assert_eq!(config.signature_header, "X-SiteVoice-Signature");
        assert_eq!(
            config.backoff,
            Some(Backoff::new(
                Duration::from_millis(100),
                Duration::from_millis(3200),
                Duration::ZERO,
            ))
        );
    }

    #[test]
    fn unparsable_value_names_the_key() {
        let err = DispatcherConfig::from_lookup(lookup_from(&[("WEBHOOK_MAX_CONCURRENCY", "lots")]))
            .unwrap_err();

        assert_eq!(err.key, "WEBHOOK_MAX_CONCURRENCY");
    }

    #[test]
    fn zero_batch_limit_is_rejected() {
        let err = DispatcherConfig::from_lookup(lookup_from(&[("WEBHOOK_BATCH_LIMIT", "0")]))
            .unwrap_err();

        assert_eq!(err.key, "WEBHOOK_BATCH_LIMIT");
    }

    #[test]
    fn claim_lease_must_outlive_request_timeout() {
        let err = DispatcherConfig::from_lookup(lookup_from(&[("WEBHOOK_CLAIM_LEASE_MS", "0")]))
            .unwrap_err();
        assert_eq!(err.key, "WEBHOOK_CLAIM_LEASE_MS");

        let err = DispatcherConfig::from_lookup(lookup_from(&[
            ("WEBHOOK_REQUEST_TIMEOUT_MS", "5000"),
            ("WEBHOOK_CLAIM_LEASE_MS", "5000"),
        ]))
        .unwrap_err();
        assert_eq!(err.key, "WEBHOOK_CLAIM_LEASE_MS");

        let config = DispatcherConfig::from_lookup(lookup_from(&[
            ("WEBHOOK_REQUEST_TIMEOUT_MS", "5000"),
            ("WEBHOOK_CLAIM_LEASE_MS", "5001"),
        ]))
        .unwrap();
        assert_eq!(config.claim_lease, Duration::from_millis(5001));
    }

    #[test]
    fn effective_claim_lease_covers_the_request_timeout() {
        let config = DispatcherConfig {
            request_timeout: Duration::from_secs(10),
            claim_lease: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.effective_claim_lease(), Duration::from_secs(10) + CLAIM_LEASE_MARGIN);

        let config = DispatcherConfig {
            request_timeout: Duration::from_secs(1),
            claim_lease: Duration::from_secs(120),
            ..Default::default()
        };
        assert_eq!(config.effective_claim_lease(), Duration::from_secs(120));
    }

    #[test]
    fn concurrency_is_clamped() {
        let mut config = DispatcherConfig::default();

        config.max_concurrency = 0;
        assert_eq!(config.concurrency(), 1);

        config.max_concurrency = 64;
        assert_eq!(config.concurrency(), MAX_CONCURRENCY_LIMIT);
    }

    #[test]
    fn backoff_grows_exponentially_up_to_max() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            Duration::ZERO,
        );

        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn backoff_jitter_stays_in_range() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );

        for _ in 0..100 {
            let delay = backoff.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
