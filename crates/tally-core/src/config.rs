//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration can be loaded from environment variables and config files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

/// Main application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub rating: RatingConfig,
    #[serde(default)]
    pub locking: LockingConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Rating pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RatingConfig {
    /// Maximum depth when chasing fallback subjects
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,

    /// Subject tried once when the primary subject has no rating plan
    #[serde(default = "default_fallback_subject")]
    pub fallback_subject: String,

    /// Decimals kept on per-increment costs
    #[serde(default = "default_rounding_decimals")]
    pub rounding_decimals: u32,

    /// Tariff type assumed when a request does not carry one
    #[serde(default = "default_tariff_type")]
    pub default_tariff_type: String,
}

fn default_max_recursion_depth() -> usize {
    3
}

fn default_fallback_subject() -> String {
    crate::ANY.to_string()
}

fn default_rounding_decimals() -> u32 {
    10
}

fn default_tariff_type() -> String {
    "*voice".to_string()
}

/// Keyed lock registry configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LockingConfig {
    /// Bound on how long a caller waits for a guarded call (None = wait forever)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Default filter directive when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Runtime configuration for the tally binary
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Number of requests processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// JSON fixture with tariffs, destinations, accounts and shared groups
    #[serde(default = "default_fixtures_path")]
    pub fixtures_path: String,
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_fixtures_path() -> String {
    "config/fixtures.json".to_string()
}

impl AppConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("rating.max_recursion_depth", 3)?
            .set_default("rating.fallback_subject", crate::ANY)?
            .set_default("rating.rounding_decimals", 10)?
            .set_default("rating.default_tariff_type", "*voice")?
            .set_default("log.level", "info")?
            .set_default("log.json", false)?
            .set_default("runtime.workers", num_cpus::get() as i64)?
            .set_default("runtime.fixtures_path", "config/fixtures.json")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with TALLY__ prefix
            .add_source(
                Environment::with_prefix("TALLY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Caller-side wait bound for guarded calls
    pub fn lock_timeout(&self) -> Option<std::time::Duration> {
        self.locking.timeout_ms.map(std::time::Duration::from_millis)
    }
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: default_max_recursion_depth(),
            fallback_subject: default_fallback_subject(),
            rounding_decimals: default_rounding_decimals(),
            default_tariff_type: default_tariff_type(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fixtures_path: default_fixtures_path(),
        }
    }
}
