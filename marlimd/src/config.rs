//! Daemon configuration.
//!
//! Loads typed configuration from environment variables with sensible
//! defaults. There is no module-level mutable state: the config structs
//! are built once here and threaded into components via constructors.

use crate::error::{DaemonError, DaemonResult};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub engine: EngineConfig,
    pub safety: SafetyConfig,
    pub lease: LeaseConfig,
    pub environment: Environment,
    /// PostgreSQL connection string, when persistence is configured
    pub database_url: Option<String>,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Risk per trade as percent of capital (1 = 1%)
    pub risk_fraction_pct: Decimal,
    /// Accepted shortfall between requested and filled entry qty, percent
    pub fill_tolerance_pct: Decimal,
    /// Insurance stop resting on the exchange; None = per environment
    /// default (off in paper, on in live)
    pub insurance_enabled: Option<bool>,
    /// Gap between the local stop and the insurance trigger, percent
    pub insurance_buffer_pct: Decimal,
    /// Entry submit-to-ack budget
    pub entry_ack_timeout: Duration,
    /// Readiness flips when the exchange stays unreachable this long
    pub exchange_unreachable_threshold: Duration,
}

/// Safety-net configuration.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub enabled: bool,
    /// Poll cadence against exchange positions
    pub poll_interval: Duration,
    /// Fixed protective stop distance, percent of entry
    pub stop_pct: Decimal,
    /// Consecutive failures before panic mode
    pub max_retry_attempts: u32,
    /// Cooldown between execution attempts per position
    pub execution_cooldown: Duration,
}

/// Lease configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub ttl: Duration,
}

impl LeaseConfig {
    /// Renewal cadence: at most TTL/3 between renewals.
    pub fn renew_interval(&self) -> Duration {
        self.ttl / 3
    }
}

/// Runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Stub exchange, no real orders
    Paper,
    /// Real exchange credentials
    Live,
    /// Test environment
    Test,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // .env is optional
        let _ = dotenvy::dotenv();

        let environment = match env::var("MARLIM_ENV")
            .unwrap_or_else(|_| "paper".to_string())
            .to_lowercase()
            .as_str()
        {
            "paper" => Environment::Paper,
            "live" => Environment::Live,
            "test" => Environment::Test,
            other => {
                return Err(DaemonError::Config(format!(
                    "Invalid MARLIM_ENV: {}. Expected: paper, live, test",
                    other
                )));
            },
        };

        let api = ApiConfig {
            host: env::var("MARLIM_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: load_parsed("MARLIM_API_PORT", 8080)?,
        };

        let engine = EngineConfig {
            risk_fraction_pct: load_decimal("MARLIM_RISK_FRACTION_PCT", Decimal::ONE)?,
            fill_tolerance_pct: load_decimal("MARLIM_FILL_TOLERANCE_PCT", Decimal::new(5, 1))?,
            insurance_enabled: match env::var("MARLIM_INSURANCE_ENABLED") {
                Ok(v) => Some(v == "1" || v.eq_ignore_ascii_case("true")),
                Err(_) => None,
            },
            insurance_buffer_pct: load_decimal("MARLIM_INSURANCE_BUFFER_PCT", Decimal::new(2, 1))?,
            entry_ack_timeout: Duration::from_secs(load_parsed("MARLIM_ENTRY_ACK_TIMEOUT_SECS", 10)?),
            exchange_unreachable_threshold: Duration::from_secs(load_parsed(
                "MARLIM_EXCHANGE_UNREACHABLE_SECS",
                60,
            )?),
        };

        let safety = SafetyConfig {
            enabled: env::var("MARLIM_SAFETY_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            poll_interval: Duration::from_secs(load_parsed("MARLIM_SAFETY_POLL_SECS", 20)?),
            stop_pct: load_decimal("MARLIM_SAFETY_STOP_PCT", Decimal::from(2))?,
            max_retry_attempts: load_parsed("MARLIM_SAFETY_MAX_RETRIES", 3)?,
            execution_cooldown: Duration::from_secs(load_parsed("MARLIM_SAFETY_COOLDOWN_SECS", 60)?),
        };

        let lease = LeaseConfig {
            ttl: Duration::from_secs(load_parsed("MARLIM_LEASE_TTL_SECS", 30)?),
        };

        Ok(Self {
            api,
            engine,
            safety,
            lease,
            environment,
            database_url: env::var("DATABASE_URL").ok(),
        })
    }

    /// Test configuration: loopback API on a random port, short timers.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            engine: EngineConfig {
                risk_fraction_pct: Decimal::ONE,
                fill_tolerance_pct: Decimal::new(5, 1),
                insurance_enabled: Some(false),
                insurance_buffer_pct: Decimal::new(2, 1),
                entry_ack_timeout: Duration::from_millis(200),
                exchange_unreachable_threshold: Duration::from_secs(5),
            },
            safety: SafetyConfig {
                enabled: true,
                poll_interval: Duration::from_millis(50),
                stop_pct: Decimal::from(2),
                max_retry_attempts: 3,
                execution_cooldown: Duration::from_millis(50),
            },
            lease: LeaseConfig {
                ttl: Duration::from_secs(5),
            },
            environment: Environment::Test,
            database_url: None,
        }
    }

    /// Resolved insurance default: off in paper/test, on in live, unless
    /// explicitly configured.
    pub fn insurance_enabled(&self) -> bool {
        self.engine
            .insurance_enabled
            .unwrap_or(self.environment == Environment::Live)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            engine: EngineConfig {
                risk_fraction_pct: Decimal::ONE,
                fill_tolerance_pct: Decimal::new(5, 1),
                insurance_enabled: None,
                insurance_buffer_pct: Decimal::new(2, 1),
                entry_ack_timeout: Duration::from_secs(10),
                exchange_unreachable_threshold: Duration::from_secs(60),
            },
            safety: SafetyConfig {
                enabled: true,
                poll_interval: Duration::from_secs(20),
                stop_pct: Decimal::from(2),
                max_retry_attempts: 3,
                execution_cooldown: Duration::from_secs(60),
            },
            lease: LeaseConfig {
                ttl: Duration::from_secs(30),
            },
            environment: Environment::Paper,
            database_url: None,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Paper => write!(f, "paper"),
            Environment::Live => write!(f, "live"),
            Environment::Test => write!(f, "test"),
        }
    }
}

fn load_parsed<T: FromStr>(key: &str, default: T) -> DaemonResult<T> {
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
        Err(_) => Ok(default),
    }
}

fn load_decimal(key: &str, default: Decimal) -> DaemonResult<Decimal> {
    match env::var(key) {
        Ok(val) => Decimal::from_str(&val)
            .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
        Err(_) => Ok(default),
    }
}

// =============================================================================
// Tests
// =============================================================================
