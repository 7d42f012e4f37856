//! Collaborator traits
//!
//! The rating core reads tariffs and reads/writes accounts through these
//! narrow contracts; storage technology lives behind them.

use crate::error::AppError;
use crate::models::{Account, RatingPlan, RatingProfile, SharedGroup};
use async_trait::async_trait;

/// Account persistence
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Find account by `tenant:account` key
    async fn get_account(&self, key: &str) -> Result<Option<Account>, AppError>;

    /// Create or replace an account
    async fn set_account(&self, account: &Account) -> Result<(), AppError>;

    /// Find a shared group by id
    async fn get_shared_group(&self, id: &str) -> Result<Option<SharedGroup>, AppError>;
}

/// Tariff lookups
#[async_trait]
pub trait TariffStore: Send + Sync {
    /// Find rating profile by `tenant:category:subject` key
    async fn get_rating_profile(&self, key: &str) -> Result<Option<RatingProfile>, AppError>;

    /// Find rating plan by id
    async fn get_rating_plan(&self, id: &str) -> Result<Option<RatingPlan>, AppError>;

    /// Destination ids containing exactly this prefix
    async fn destination_ids_for_prefix(&self, prefix: &str) -> Result<Vec<String>, AppError>;
}
