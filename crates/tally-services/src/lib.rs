//! Rating and debiting services for Tally
//!
//! This crate holds the usage-rating pipeline and the guarded balance-debit
//! protocol built on top of the `tally-core` models.
//!
//! # Pipeline
//!
//! A [`UsageDescriptor`](tally_core::models::UsageDescriptor) flows through:
//!
//! 1. [`TariffResolver`] attaches the rating plans covering the interval
//! 2. [`splitter`] cuts the interval into priced sub-intervals
//! 3. [`CostCalculator`] builds the increments and the [`CallCost`](tally_core::models::CallCost)
//! 4. [`debit`] consumes the increments against account balances
//!
//! # Services
//!
//! - `RatingEngine` - the public operations: rate, debit, max debit,
//!   max duration estimation and refund
//! - `TariffResolver` - rating profile and fallback resolution
//! - `CostCalculator` - increment pricing, connect fees and max-cost caps

pub mod calculator;
pub mod debit;
pub mod engine;
pub mod estimator;
pub mod refund;
pub mod resolver;
pub mod splitter;

pub use calculator::CostCalculator;
pub use debit::AccountSet;
pub use engine::{RatingEngine, Unrated};
pub use estimator::MaxUsage;
pub use resolver::TariffResolver;

/// Business logic constants
pub mod constants {
    /// Times a debit re-locks when shared-group membership changes under it
    pub const MAX_LOCK_ATTEMPTS: usize = 3;
}
