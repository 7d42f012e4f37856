//! Unified error handling for Tally
//!
//! Every failure the rating and debit pipeline can surface is one variant of
//! [`AppError`]. Not-found conditions are kept apart on purpose so callers can
//! tell a missing account from a disabled one, and a missing tariff from a
//! destination that is priced but unreachable.

use thiserror::Error;

/// Main application error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    // ==================== Not Found ====================
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account disabled: {0}")]
    AccountDisabled(String),

    #[error("Rating profile not found: {0}")]
    RatingProfileNotFound(String),

    #[error("Rating plan not found: {0}")]
    RatingPlanNotFound(String),

    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    #[error("Shared group not found: {0}")]
    SharedGroupNotFound(String),

    // ==================== Policy Violations ====================
    #[error("Unauthorized destination: {0}")]
    UnauthorizedDestination(String),

    #[error("Insufficient credit: requested {requested}s, available {available}s")]
    InsufficientCredit { requested: i64, available: i64 },

    // ==================== Resolution Limits ====================
    #[error("Max fallback recursion depth reached for {0}")]
    MaxRecursionDepth(String),

    // ==================== Validation ====================
    #[error("Validation error: {0}")]
    Validation(String),

    // ==================== Locking ====================
    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    // ==================== Refunds ====================
    #[error("Refund failed for {} account(s): {}", .0.len(), .0.join("; "))]
    Refund(Vec<String>),

    // ==================== Internal ====================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the stable error code for logs and API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::AccountNotFound(_) => "account_not_found",
            AppError::AccountDisabled(_) => "account_disabled",
            AppError::RatingProfileNotFound(_) => "rating_profile_not_found",
            AppError::RatingPlanNotFound(_) => "rating_plan_not_found",
            AppError::DestinationNotFound(_) => "destination_not_found",
            AppError::SharedGroupNotFound(_) => "shared_group_not_found",
            AppError::UnauthorizedDestination(_) => "unauthorized_destination",
            AppError::InsufficientCredit { .. } => "insufficient_credit",
            AppError::MaxRecursionDepth(_) => "max_recursion_depth",
            AppError::Validation(_) => "validation_error",
            AppError::LockTimeout(_) => "lock_timeout",
            AppError::Refund(_) => "refund_failed",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// True for the not-found family of errors
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::AccountNotFound(_)
                | AppError::RatingProfileNotFound(_)
                | AppError::RatingPlanNotFound(_)
                | AppError::DestinationNotFound(_)
                | AppError::SharedGroupNotFound(_)
        )
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
