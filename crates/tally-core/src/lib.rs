//! Tally Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the Tally rating engine. It includes:
//!
//! - Domain models (UsageDescriptor, RatingInfo, TimeSpan, CallCost, Account, ...)
//! - Collaborator traits for account and tariff persistence
//! - Unified error handling
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod serde_duration;
pub mod traits;
pub mod units;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Pseudo subject / destination matching everything
pub const ANY: &str = "*any";

/// Separator used by composite storage keys
pub const KEY_SEPARATOR: &str = ":";

/// Build a composite key (`tenant:category:subject`, `tenant:account`, ...)
pub fn concatenated_key(parts: &[&str]) -> String {
    parts.join(KEY_SEPARATOR)
}
