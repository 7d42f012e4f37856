//! Domain models for Tally
//!
//! This module contains all the core domain models used throughout the application.

pub mod account;
pub mod call_cost;
pub mod rate_interval;
pub mod rating_info;
pub mod tariff;
pub mod timespan;
pub mod usage;

pub use account::{
    Account, AccountSummary, Balance, BalanceSummary, SharedGroup, SharingStrategy, DEFAULT_BALANCE_ID,
};
pub use call_cost::{CallCost, UNRATED_COST};
pub use rate_interval::{MaxCostStrategy, Rate, RateInterval, Rating, RoundingMethod, Timing};
pub use rating_info::RatingInfo;
pub use tariff::{Destination, RatingPlan, RatingPlanActivation, RatingProfile};
pub use timespan::{DebitInfo, Increment, MonetaryInfo, TimeSpan, UnitInfo};
pub use usage::{TariffType, UsageDescriptor};
