//! Runtime configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::geo::DEFAULT_RADIUS_KM;
use crate::retry::RetryPolicy;

pub const ENV_SEARCH_RADIUS_KM: &str = "RIDE_SEARCH_RADIUS_KM";
pub const ENV_BUS_CAPACITY: &str = "RIDE_BUS_CAPACITY";
pub const ENV_GATEWAY_TIMEOUT_MS: &str = "RIDE_GATEWAY_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "RIDE_MAX_RETRIES";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Radius around a driver within which waiting rides are surfaced.
    pub search_radius_km: f64,
    /// Events buffered per subscriber before it is reported as lagging.
    pub bus_capacity: usize,
    /// Upper bound on a single escrow gateway call.
    pub gateway_timeout: Duration,
    /// Backoff for re-fetching state after transient store failures.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search_radius_km: DEFAULT_RADIUS_KM,
            bus_capacity: 256,
            gateway_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `RIDE_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(radius) = parse::<f64>(&lookup, ENV_SEARCH_RADIUS_KM)? {
            if !radius.is_finite() || radius < 0.0 {
                return Err(ConfigError::Invalid {
                    key: ENV_SEARCH_RADIUS_KM,
                    value: radius.to_string(),
                });
            }
            config.search_radius_km = radius;
        }
        if let Some(capacity) = parse::<usize>(&lookup, ENV_BUS_CAPACITY)? {
            config.bus_capacity = capacity.max(1);
        }
        if let Some(millis) = parse::<u64>(&lookup, ENV_GATEWAY_TIMEOUT_MS)? {
            config.gateway_timeout = Duration::from_millis(millis);
        }
        if let Some(retries) = parse::<usize>(&lookup, ENV_MAX_RETRIES)? {
            config.retry.max_retries = retries;
        }
        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.search_radius_km, 8.0);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_SEARCH_RADIUS_KM, "2.5"),
            (ENV_BUS_CAPACITY, "32"),
            (ENV_GATEWAY_TIMEOUT_MS, "1500"),
            (ENV_MAX_RETRIES, "0"),
        ]))
        .unwrap();
        assert_eq!(config.search_radius_km, 2.5);
        assert_eq!(config.bus_capacity, 32);
        assert_eq!(config.gateway_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.max_retries, 0);
    }

    #[test]
    fn invalid_values_are_reported() {
        let result = EngineConfig::from_lookup(lookup(&[(ENV_BUS_CAPACITY, "lots")]));
        assert_eq!(
            result,
            Err(ConfigError::Invalid {
                key: ENV_BUS_CAPACITY,
                value: "lots".to_string()
            })
        );

        let result = EngineConfig::from_lookup(lookup(&[(ENV_SEARCH_RADIUS_KM, "-1")]));
        assert!(result.is_err());
    }
}
