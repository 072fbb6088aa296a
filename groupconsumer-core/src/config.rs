use std::collections::HashMap;
use std::time::Duration;

use backoff::strategy::{exponential, fixed};

use crate::error::{Error, Result};
use crate::offset::InitialOffset;

const ENV_OFFSETS_INITIAL: &str = "GROUPCONSUMER_OFFSETS_INITIAL";
const ENV_RETRY_INTERVAL_MS: &str = "GROUPCONSUMER_RETRY_INTERVAL_MS";
const ENV_RETRY_MAX_INTERVAL_MS: &str = "GROUPCONSUMER_RETRY_MAX_INTERVAL_MS";
const ENV_RETRY_FACTOR: &str = "GROUPCONSUMER_RETRY_FACTOR";
const ENV_RETRY_JITTER: &str = "GROUPCONSUMER_RETRY_JITTER";
const ENV_LEASE_TTL_MS: &str = "GROUPCONSUMER_LEASE_TTL_MS";
const ENV_LEASE_RENEW_INTERVAL_MS: &str = "GROUPCONSUMER_LEASE_RENEW_INTERVAL_MS";

const DEFAULT_RETRY_INTERVAL_MILLIS: u64 = 1000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_LEASE_TTL_MILLIS: u64 = 30_000;
// renewals per lease when only the TTL is configured
const DEFAULT_RENEWALS_PER_TTL: u32 = 3;

/// How long to wait between attempts of a failing collaborator call. Every strategy retries
/// forever; the partition manager only stops retrying when it is interrupted.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    Fixed {
        interval: Duration,
    },
    Exponential {
        base: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Fixed {
            interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MILLIS),
        }
    }
}

impl RetryStrategy {
    /// A fresh sequence of delays, one per retry.
    pub fn backoff(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self {
            RetryStrategy::Fixed { interval } => Box::new(fixed::Interval::new(*interval)),
            RetryStrategy::Exponential {
                base,
                max,
                factor,
                jitter,
            } => Box::new(
                exponential::Exponential::new(*base, *max)
                    .factor(*factor)
                    .jitter(*jitter),
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerConfig {
    /// Where to start when no committed offset is usable.
    pub initial_offset: InitialOffset,
    pub retry: RetryStrategy,
}

/// How long a partition claim stays valid without being renewed, and how often its owner
/// renews it. A claim that was not renewed for `ttl` is treated as abandoned and may be taken
/// over by another member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        let ttl = Duration::from_millis(DEFAULT_LEASE_TTL_MILLIS);
        Self {
            ttl,
            renew_interval: ttl / DEFAULT_RENEWALS_PER_TTL,
        }
    }
}

fn parse_env<T>(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_vars
        .get(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| {
                Error::Config(format!("Parsing {key}(set to '{value}'): {e}"))
            })
        })
        .transpose()
}

/// Loads the configuration from environment variables.
impl TryFrom<HashMap<String, String>> for ManagerConfig {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self> {
        let mut config = ManagerConfig::default();

        if let Some(initial) = env_vars.get(ENV_OFFSETS_INITIAL) {
            config.initial_offset = initial.parse()?;
        }

        let interval = Duration::from_millis(
            parse_env(&env_vars, ENV_RETRY_INTERVAL_MS)?.unwrap_or(DEFAULT_RETRY_INTERVAL_MILLIS),
        );
        if interval.is_zero() {
            return Err(Error::Config(format!(
                "{ENV_RETRY_INTERVAL_MS} must be greater than zero"
            )));
        }

        // a cap on the interval is what makes the backoff grow
        config.retry = match parse_env::<u64>(&env_vars, ENV_RETRY_MAX_INTERVAL_MS)? {
            None => RetryStrategy::Fixed { interval },
            Some(max) => {
                let max = Duration::from_millis(max);
                if max < interval {
                    return Err(Error::Config(format!(
                        "{ENV_RETRY_MAX_INTERVAL_MS} must not be smaller than {ENV_RETRY_INTERVAL_MS}"
                    )));
                }

                let factor =
                    parse_env::<f64>(&env_vars, ENV_RETRY_FACTOR)?.unwrap_or(DEFAULT_RETRY_FACTOR);
                if factor < 1.0 {
                    return Err(Error::Config(format!(
                        "{ENV_RETRY_FACTOR} must be at least 1.0, got {factor}"
                    )));
                }

                let jitter = parse_env::<f64>(&env_vars, ENV_RETRY_JITTER)?.unwrap_or(0.0);
                if !(0.0..=1.0).contains(&jitter) {
                    return Err(Error::Config(format!(
                        "{ENV_RETRY_JITTER} must be between 0 and 1, got {jitter}"
                    )));
                }

                RetryStrategy::Exponential {
                    base: interval,
                    max,
                    factor,
                    jitter,
                }
            }
        };

        Ok(config)
    }
}

/// Loads the lease settings from environment variables.
impl TryFrom<HashMap<String, String>> for LeaseConfig {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self> {
        let Some(ttl) = parse_env::<u64>(&env_vars, ENV_LEASE_TTL_MS)? else {
            if env_vars.contains_key(ENV_LEASE_RENEW_INTERVAL_MS) {
                return Err(Error::Config(format!(
                    "{ENV_LEASE_RENEW_INTERVAL_MS} requires {ENV_LEASE_TTL_MS}"
                )));
            }
            return Ok(LeaseConfig::default());
        };

        let ttl = Duration::from_millis(ttl);
        let renew_interval = parse_env::<u64>(&env_vars, ENV_LEASE_RENEW_INTERVAL_MS)?
            .map(Duration::from_millis)
            .unwrap_or(ttl / DEFAULT_RENEWALS_PER_TTL);

        // the owner has to get at least one renewal in before its lease runs out
        if renew_interval.is_zero() || renew_interval >= ttl {
            return Err(Error::Config(format!(
                "{ENV_LEASE_RENEW_INTERVAL_MS} must be greater than zero and smaller than {ENV_LEASE_TTL_MS}"
            )));
        }

        Ok(LeaseConfig {
            ttl,
            renew_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::try_from(HashMap::new()).unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.initial_offset, InitialOffset::Oldest);
        assert_eq!(
            config.retry,
            RetryStrategy::Fixed {
                interval: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_fixed_retry_from_env() {
        let config = ManagerConfig::try_from(env(&[
            (ENV_OFFSETS_INITIAL, "newest"),
            (ENV_RETRY_INTERVAL_MS, "250"),
        ]))
        .unwrap();

        assert_eq!(config.initial_offset, InitialOffset::Newest);
        let delays: Vec<_> = config.retry.backoff().take(3).collect();
        assert_eq!(delays, vec![Duration::from_millis(250); 3]);
    }

    #[test]
    fn test_exponential_retry_from_env() {
        let config = ManagerConfig::try_from(env(&[
            (ENV_RETRY_INTERVAL_MS, "100"),
            (ENV_RETRY_MAX_INTERVAL_MS, "1000"),
            (ENV_RETRY_FACTOR, "3"),
        ]))
        .unwrap();

        assert_eq!(
            config.retry,
            RetryStrategy::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_millis(1000),
                factor: 3.0,
                jitter: 0.0,
            }
        );

        let delays: Vec<_> = config.retry.backoff().take(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(900),
                Duration::from_millis(1000),
            ]
        );
    }

    #[test]
    fn test_invalid_config() {
        let invalid = [
            env(&[(ENV_OFFSETS_INITIAL, "sometimes")]),
            env(&[(ENV_RETRY_INTERVAL_MS, "soon")]),
            env(&[(ENV_RETRY_INTERVAL_MS, "0")]),
            env(&[
                (ENV_RETRY_INTERVAL_MS, "500"),
                (ENV_RETRY_MAX_INTERVAL_MS, "100"),
            ]),
            env(&[
                (ENV_RETRY_MAX_INTERVAL_MS, "5000"),
                (ENV_RETRY_FACTOR, "0.5"),
            ]),
            env(&[
                (ENV_RETRY_MAX_INTERVAL_MS, "5000"),
                (ENV_RETRY_JITTER, "1.5"),
            ]),
        ];

        for env_vars in invalid {
            let result = ManagerConfig::try_from(env_vars.clone());
            assert!(
                matches!(result, Err(Error::Config(_))),
                "expected a config error for {env_vars:?}"
            );
        }
    }

    #[test]
    fn test_lease_config() {
        let lease = LeaseConfig::try_from(HashMap::new()).unwrap();
        assert_eq!(lease, LeaseConfig::default());
        assert_eq!(lease.ttl, Duration::from_secs(30));
        assert_eq!(lease.renew_interval, Duration::from_secs(10));

        let lease = LeaseConfig::try_from(env(&[(ENV_LEASE_TTL_MS, "900")])).unwrap();
        assert_eq!(lease.renew_interval, Duration::from_millis(300));

        let lease = LeaseConfig::try_from(env(&[
            (ENV_LEASE_TTL_MS, "10000"),
            (ENV_LEASE_RENEW_INTERVAL_MS, "2000"),
        ]))
        .unwrap();
        assert_eq!(
            lease,
            LeaseConfig {
                ttl: Duration::from_secs(10),
                renew_interval: Duration::from_secs(2),
            }
        );
    }

    #[test]
    fn test_invalid_lease_config() {
        let invalid = [
            env(&[(ENV_LEASE_TTL_MS, "forever")]),
            env(&[(ENV_LEASE_TTL_MS, "0")]),
            env(&[(ENV_LEASE_TTL_MS, "1000"), (ENV_LEASE_RENEW_INTERVAL_MS, "1000")]),
            env(&[(ENV_LEASE_TTL_MS, "1000"), (ENV_LEASE_RENEW_INTERVAL_MS, "0")]),
            env(&[(ENV_LEASE_RENEW_INTERVAL_MS, "1000")]),
        ];

        for env_vars in invalid {
            let result = LeaseConfig::try_from(env_vars.clone());
            assert!(
                matches!(result, Err(Error::Config(_))),
                "expected a config error for {env_vars:?}"
            );
        }
    }
}
