//! Pipeline configuration.
//!
//! ## Environment Variables
//!
//! | Variable | Default |
//! |---|---|
//! | `KAFKA_TOPIC` | `usage_reports_v2` |
//! | `KAFKA_BUFFER_SIZE` | `1000` |
//! | `KAFKA_BUFFER_INTERVAL` (ms) | `5000` |
//! | `KAFKA_BUFFER_DYNAMIC` | `true` |
//! | `KAFKA_MAX_PAYLOAD_BYTES` | `1000000` |
//! | `KAFKA_PAYLOAD_SAFETY_MARGIN_BYTES` | `10000` |
//! | `KAFKA_BROKER` | required |
//! | `KAFKA_SSL` / `KAFKA_SSL_CA_PATH` | off |
//! | `KAFKA_SASL_MECHANISM` / `KAFKA_SASL_USERNAME` / `KAFKA_SASL_PASSWORD` | none |
//! | `KAFKA_RETRY_INITIAL_MS` / `KAFKA_RETRY_MAX_MS` | `300` / `30000` |
//! | `KAFKA_RETRY_MULTIPLIER` / `KAFKA_RETRY_FACTOR` / `KAFKA_RETRY_RETRIES` | `2.0` / `0.2` / `5` |
//! | `KAFKA_LOG_LEVEL` | `info` |
//! | `USAGE_COMPRESSION` | `gzip` |
//! | `FALLBACK_MAX_BYTES` | 512 MiB |
//! | `FALLBACK_RETRY_INTERVAL_MS` | `1000` |
//! | `SHUTDOWN_TIMEOUT_SECS` | `30` |

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

use crate::compression::Compression;
use crate::error::{Result, UsageError};
use crate::retry::RetryPolicy;

/// Report Buffer settings.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Flush once this many size units (operation-map entries) are pending.
    /// Ignored when `dynamic` is on.
    pub size: usize,

    /// Periodic flush interval
    pub interval: Duration,

    /// Use the feedback-tuned byte estimator instead of the fixed unit count
    pub dynamic: bool,

    /// Hard broker payload ceiling in bytes
    pub max_payload_bytes: usize,

    /// Headroom subtracted from the ceiling to get the split threshold
    pub safety_margin_bytes: usize,

    /// Seed for the estimator: expected compressed bytes per size unit
    pub default_bytes_per_unit: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: 1000,
            interval: Duration::from_millis(5000),
            dynamic: true,
            max_payload_bytes: 1_000_000,
            safety_margin_bytes: 10_000,
            default_bytes_per_unit: 600,
        }
    }
}

impl BufferConfig {
    /// Byte threshold above which a flush is split into chunks.
    pub fn limit_in_bytes(&self) -> usize {
        self.max_payload_bytes.saturating_sub(self.safety_margin_bytes)
    }
}

/// SASL mechanisms supported by the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl FromStr for SaslMechanism {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(SaslMechanism::Plain),
            "scram-sha-256" => Ok(SaslMechanism::ScramSha256),
            "scram-sha-512" => Ok(SaslMechanism::ScramSha512),
            other => Err(UsageError::ConfigError(format!(
                "unknown SASL mechanism: {}",
                other
            ))),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct SaslCredentials {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsSettings {
    /// PEM bundle of trusted roots. Falls back to the bundled webpki roots.
    pub ca_path: Option<PathBuf>,
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConnectionConfig {
    /// `host:port`
    pub broker: String,
    pub tls: Option<TlsSettings>,
    pub sasl: Option<SaslCredentials>,
    pub client_id: String,
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    /// How long cached topic metadata (partition list) is trusted
    pub metadata_max_age: Duration,
}

impl Default for BrokerConnectionConfig {
    fn default() -> Self {
        Self {
            broker: "localhost:9092".to_string(),
            tls: None,
            sasl: None,
            client_id: "usage".to_string(),
            request_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(5),
            metadata_max_age: Duration::from_secs(180),
        }
    }
}

impl BrokerConnectionConfig {
    /// Host part of `broker`.
    pub fn host(&self) -> &str {
        let broker = self.broker.as_str();
        if let Some(rest) = broker.strip_prefix('[') {
            // [::1]:9092
            return rest.split(']').next().unwrap_or(rest);
        }
        match broker.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
            _ => broker,
        }
    }

    /// TLS server name for SNI. `None` when the broker host is a literal IP.
    pub fn tls_server_name(&self) -> Option<String> {
        let host = self.host();
        if host.parse::<IpAddr>().is_ok() {
            None
        } else {
            Some(host.to_string())
        }
    }
}

/// Fallback Queue settings.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Total payload bytes retained before the oldest entries are evicted
    pub max_bytes: usize,
    /// Pause between failed resend attempts
    pub retry_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024,
            retry_interval: Duration::from_millis(1000),
        }
    }
}

/// Verbosity of the broker client's own logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerLogLevel {
    Nothing,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl BrokerLogLevel {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            BrokerLogLevel::Nothing => LevelFilter::OFF,
            BrokerLogLevel::Error => LevelFilter::ERROR,
            BrokerLogLevel::Warn => LevelFilter::WARN,
            BrokerLogLevel::Info => LevelFilter::INFO,
            BrokerLogLevel::Debug => LevelFilter::DEBUG,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BrokerLogLevel::Nothing => "off",
            BrokerLogLevel::Error => "error",
            BrokerLogLevel::Warn => "warn",
            BrokerLogLevel::Info => "info",
            BrokerLogLevel::Debug => "debug",
        }
    }

    /// `EnvFilter` directive scoping this level to the broker client.
    pub fn directive(self) -> String {
        format!("rskafka={}", self.as_str())
    }
}

impl FromStr for BrokerLogLevel {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nothing" | "off" => Ok(BrokerLogLevel::Nothing),
            "error" => Ok(BrokerLogLevel::Error),
            "warn" => Ok(BrokerLogLevel::Warn),
            "info" => Ok(BrokerLogLevel::Info),
            "debug" => Ok(BrokerLogLevel::Debug),
            other => Err(UsageError::ConfigError(format!(
                "unknown KAFKA_LOG_LEVEL: {}",
                other
            ))),
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub topic: String,
    pub buffer: BufferConfig,
    pub connection: BrokerConnectionConfig,
    pub retry: RetryPolicy,
    pub fallback: FallbackConfig,
    pub compression: Compression,
    /// Upper bound on `stop()`
    pub shutdown_timeout: Duration,
    pub broker_log_level: BrokerLogLevel,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            topic: "usage_reports_v2".to_string(),
            buffer: BufferConfig::default(),
            connection: BrokerConnectionConfig::default(),
            retry: RetryPolicy::default(),
            fallback: FallbackConfig::default(),
            compression: Compression::default(),
            shutdown_timeout: Duration::from_secs(30),
            broker_log_level: BrokerLogLevel::default(),
        }
    }
}

impl UsageConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = UsageConfig::default();

        let broker = env
            .string("KAFKA_BROKER")
            .ok_or_else(|| UsageError::ConfigError("KAFKA_BROKER not set".to_string()))?;

        let tls = if env.parse("KAFKA_SSL", false)? {
            Some(TlsSettings {
                ca_path: env.string("KAFKA_SSL_CA_PATH").map(PathBuf::from),
            })
        } else {
            None
        };

        let sasl = match env.string("KAFKA_SASL_MECHANISM") {
            Some(mechanism) => Some(SaslCredentials {
                mechanism: mechanism.parse()?,
                username: env.string("KAFKA_SASL_USERNAME").ok_or_else(|| {
                    UsageError::ConfigError("KAFKA_SASL_USERNAME not set".to_string())
                })?,
                password: env.string("KAFKA_SASL_PASSWORD").ok_or_else(|| {
                    UsageError::ConfigError("KAFKA_SASL_PASSWORD not set".to_string())
                })?,
            }),
            None => None,
        };

        let buffer = BufferConfig {
            size: env.parse("KAFKA_BUFFER_SIZE", defaults.buffer.size)?,
            interval: Duration::from_millis(env.parse(
                "KAFKA_BUFFER_INTERVAL",
                defaults.buffer.interval.as_millis() as u64,
            )?),
            dynamic: env.parse("KAFKA_BUFFER_DYNAMIC", defaults.buffer.dynamic)?,
            max_payload_bytes: env
                .parse("KAFKA_MAX_PAYLOAD_BYTES", defaults.buffer.max_payload_bytes)?,
            safety_margin_bytes: env.parse(
                "KAFKA_PAYLOAD_SAFETY_MARGIN_BYTES",
                defaults.buffer.safety_margin_bytes,
            )?,
            default_bytes_per_unit: defaults.buffer.default_bytes_per_unit,
        };

        let retry = RetryPolicy {
            max_retries: env.parse("KAFKA_RETRY_RETRIES", defaults.retry.max_retries)?,
            initial_backoff: Duration::from_millis(env.parse(
                "KAFKA_RETRY_INITIAL_MS",
                defaults.retry.initial_backoff.as_millis() as u64,
            )?),
            max_backoff: Duration::from_millis(env.parse(
                "KAFKA_RETRY_MAX_MS",
                defaults.retry.max_backoff.as_millis() as u64,
            )?),
            backoff_multiplier: env
                .parse("KAFKA_RETRY_MULTIPLIER", defaults.retry.backoff_multiplier)?,
            jitter_factor: env.parse("KAFKA_RETRY_FACTOR", defaults.retry.jitter_factor)?,
        };

        let fallback = FallbackConfig {
            max_bytes: env.parse("FALLBACK_MAX_BYTES", defaults.fallback.max_bytes)?,
            retry_interval: Duration::from_millis(env.parse(
                "FALLBACK_RETRY_INTERVAL_MS",
                defaults.fallback.retry_interval.as_millis() as u64,
            )?),
        };

        let config = UsageConfig {
            topic: env.string("KAFKA_TOPIC").unwrap_or(defaults.topic),
            buffer,
            connection: BrokerConnectionConfig {
                broker,
                tls,
                sasl,
                ..BrokerConnectionConfig::default()
            },
            retry,
            fallback,
            compression: env.parse("USAGE_COMPRESSION", defaults.compression)?,
            shutdown_timeout: Duration::from_secs(env.parse(
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout.as_secs(),
            )?),
            broker_log_level: env.parse("KAFKA_LOG_LEVEL", defaults.broker_log_level)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants between settings.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(UsageError::ConfigError(msg.to_string()));

        if self.topic.is_empty() {
            return invalid("topic must not be empty");
        }
        if self.connection.broker.is_empty() {
            return invalid("broker address must not be empty");
        }
        if self.buffer.size == 0 {
            return invalid("buffer size must be greater than 0");
        }
        if self.buffer.interval.is_zero() {
            return invalid("buffer interval must be greater than 0");
        }
        if self.buffer.safety_margin_bytes >= self.buffer.max_payload_bytes {
            return invalid("payload safety margin must be smaller than the payload ceiling");
        }
        if self.buffer.default_bytes_per_unit == 0 {
            return invalid("default bytes per unit must be greater than 0");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return invalid("retry factor must be between 0.0 and 1.0");
        }
        if let Some(sasl) = &self.connection.sasl {
            if sasl.username.is_empty() || sasl.password.is_empty() {
                return invalid("SASL requires a username and a password");
            }
        }
        if self.fallback.retry_interval.is_zero() {
            return invalid("fallback retry interval must be greater than 0");
        }
        Ok(())
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
    {
        match self.string(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| UsageError::ConfigError(format!("invalid value for {}: {}", key, raw))),
            None => Ok(default),
        }
    }
}
