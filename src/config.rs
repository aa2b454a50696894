//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Settings for any dependency without its own entry
    pub defaults: DependencyConfig,
    /// Per-dependency settings keyed by dependency name
    pub dependencies: HashMap<String, DependencyConfig>,
    /// Health check service settings
    pub health: HealthServiceConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("RESILIENCE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in probe URLs and headers
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        let probes = self
            .dependencies
            .values_mut()
            .chain(std::iter::once(&mut self.defaults))
            .filter_map(|dep| dep.probe.as_mut());

        for probe in probes {
            probe.url = Self::expand_string(&re, &probe.url);
            for value in probe.headers.values_mut() {
                *value = Self::expand_string(&re, value);
            }
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check every dependency section for values the runtime cannot honor
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate("defaults")?;
        for (name, dep) in &self.dependencies {
            dep.validate(name)?;
        }
        Ok(())
    }

    /// Effective settings for a dependency, with component names filled in
    #[must_use]
    pub fn dependency(&self, name: &str) -> DependencyConfig {
        let mut dep = self
            .dependencies
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());
        dep.circuit_breaker.name = name.to_string();
        dep.retry.name = name.to_string();
        dep.pool.name = name.to_string();
        dep.health_check.name = name.to_string();
        dep
    }

    /// Names of all explicitly configured dependencies, sorted
    #[must_use]
    pub fn dependency_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dependencies.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Everything the resilience layer needs to protect one dependency
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DependencyConfig {
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Per-attempt and overall timeouts
    pub timeouts: TimeoutConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Connection pool configuration
    pub pool: PoolConfig,
    /// Health check configuration
    pub health_check: HealthCheckConfig,
    /// HTTP probe used by the health check (no probe, no scheduled check)
    pub probe: Option<HttpProbeConfig>,
}

impl DependencyConfig {
    fn validate(&self, name: &str) -> Result<()> {
        let fail = |field: &str, why: &str| -> Result<()> {
            Err(Error::Config(format!("{name}.{field} {why}")))
        };

        if self.circuit_breaker.failure_threshold == 0 {
            return fail("circuit_breaker.failure_threshold", "must be at least 1");
        }
        if self.circuit_breaker.success_threshold == 0 {
            return fail("circuit_breaker.success_threshold", "must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts", "must be at least 1");
        }
        if self.retry.max_delay < self.retry.base_delay {
            return fail("retry.max_delay", "must not be below base_delay");
        }
        if self.pool.max_connections == 0 {
            return fail("pool.max_connections", "must be at least 1");
        }
        if self.pool.max_connections_per_host == 0 {
            return fail("pool.max_connections_per_host", "must be at least 1");
        }
        if self.pool.max_connections_per_host > self.pool.max_connections {
            return fail("pool.max_connections_per_host", "must not exceed max_connections");
        }
        if self.health_check.consecutive_failures == 0
            || self.health_check.consecutive_successes == 0
        {
            return fail("health_check", "thresholds must be at least 1");
        }
        if self.health_check.interval.is_zero() {
            return fail("health_check.interval", "must be greater than zero");
        }
        if self.health_check.timeout.is_zero() {
            return fail("health_check.timeout", "must be greater than zero");
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_second == 0 {
            return fail("rate_limit.requests_per_second", "must be at least 1");
        }
        Ok(())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Dependency name (filled in from the config key)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Enable circuit breaker
    pub enabled: bool,
    /// Failures before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes to close
    pub success_threshold: u32,
    /// Time spent open before half-open
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// Delay grows with the attempt number
    Linear,
    /// Delay doubles per attempt, capped at `max_delay`
    #[default]
    Exponential,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Policy name (filled in from the config key)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Base delay
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Maximum delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Randomize delays by ±50%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

/// Adapter timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on each individual attempt
    #[serde(with = "humantime_serde::option")]
    pub attempt: Option<Duration>,
    /// Bound on the whole call, retries and backoff included
    #[serde(with = "humantime_serde::option")]
    pub deadline: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            attempt: Some(Duration::from_secs(10)),
            deadline: Some(Duration::from_secs(30)),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Sustained requests per second
    pub requests_per_second: u32,
    /// Burst size
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 10,
            burst_size: 20,
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name (filled in from the config key)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Global cap on active sessions
    pub max_connections: usize,
    /// Cap on active sessions to one host
    pub max_connections_per_host: usize,
    /// Bound on establishing a new session
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on a single request over a session
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum wait for a free slot
    #[serde(with = "humantime_serde")]
    pub pool_timeout: Duration,
    /// Idle sessions older than this are closed
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_connections: 100,
            max_connections_per_host: 30,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            pool_timeout: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(30),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Check name (filled in from the config key)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Schedule this check in the background loop
    pub enabled: bool,
    /// Time between probes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Bound on a single probe
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Consecutive failures before UNHEALTHY
    pub consecutive_failures: u32,
    /// Consecutive successes before HEALTHY
    pub consecutive_successes: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            consecutive_failures: 3,
            consecutive_successes: 2,
        }
    }
}

/// HTTP probe target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProbeConfig {
    /// URL to GET
    pub url: String,
    /// Extra request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Successful responses slower than this report DEGRADED
    #[serde(default, with = "humantime_serde::option")]
    pub degraded_latency: Option<Duration>,
}

/// Health check service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthServiceConfig {
    /// Run scheduled probes
    pub enabled: bool,
}

impl Default for HealthServiceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Human-readable serde module for Duration ("30s", "5m", "250ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Format a duration the way [`parse_duration`] reads it back
    #[must_use]
    pub fn format_duration(duration: Duration) -> String {
        if duration.subsec_millis() == 0 {
            let secs = duration.as_secs();
            if secs >= 60 && secs % 60 == 0 {
                format!("{}m", secs / 60)
            } else {
                format!("{secs}s")
            }
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    /// Parse "250ms", "30s", "5m"; a bare number means seconds
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }

    /// Same format for `Option<Duration>`; absent or null means unset
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_duration_units() {
        use humantime_serde::parse_duration;

        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_format_duration_reads_back() {
        use humantime_serde::{format_duration, parse_duration};

        for d in [
            Duration::from_millis(100),
            Duration::from_secs(45),
            Duration::from_secs(120),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_dependencies_deserialized_from_yaml() {
        let yaml = r#"
dependencies:
  binance:
    circuit_breaker:
      failure_threshold: 3
      timeout: 15s
    retry:
      max_attempts: 4
      strategy: linear
      base_delay: 200ms
      jitter: false
    timeouts:
      attempt: 2s
      deadline: null
    probe:
      url: https://api.binance.com/api/v3/ping
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let dep = config.dependency("binance");

        assert_eq!(dep.circuit_breaker.name, "binance");
        assert_eq!(dep.circuit_breaker.failure_threshold, 3);
        assert_eq!(dep.circuit_breaker.success_threshold, 2);
        assert_eq!(dep.circuit_breaker.timeout, Duration::from_secs(15));
        assert_eq!(dep.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(dep.retry.base_delay, Duration::from_millis(200));
        assert_eq!(dep.timeouts.attempt, Some(Duration::from_secs(2)));
        assert_eq!(dep.timeouts.deadline, None);
        assert!(dep.probe.is_some());
    }

    #[test]
    fn test_unknown_dependency_uses_defaults() {
        let mut config = Config::default();
        config.defaults.retry.max_attempts = 7;

        let dep = config.dependency("kraken");
        assert_eq!(dep.retry.max_attempts, 7);
        assert_eq!(dep.pool.name, "kraken");
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let mut config = Config::default();
        config.dependencies.insert(
            "redis".to_string(),
            DependencyConfig {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 0,
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("redis.circuit_breaker.failure_threshold"));
    }

    #[test]
    fn test_validate_rejects_zero_health_interval() {
        let mut config = Config::default();
        config.defaults.health_check.interval = Duration::ZERO;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("defaults.health_check.interval"));
    }

    #[test]
    fn test_validate_rejects_per_host_above_global() {
        let mut config = Config::default();
        config.defaults.pool.max_connections = 4;
        config.defaults.pool.max_connections_per_host = 8;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_expands_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
dependencies:
  coinbase:
    probe:
      url: "${{RESILIENCE_TEST_UNSET_HOST:-https://api.exchange.coinbase.com}}/time"
"#
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        let probe = config.dependency("coinbase").probe.unwrap();
        assert_eq!(probe.url, "https://api.exchange.coinbase.com/time");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/resilience.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }
}
