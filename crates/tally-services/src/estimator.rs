//! Session-duration estimator
//!
//! Reads a dry-run debit of the whole requested interval and finds how much
//! of it the account can actually afford.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_core::models::{CallCost, UsageDescriptor};
use tally_core::units;
use uuid::Uuid;

/// Affordable usage for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxUsage {
    /// Account is never limited by credit
    Unlimited,
    Limited(#[serde(with = "tally_core::serde_duration")] Duration),
}

impl MaxUsage {
    /// Bounded duration, None when unlimited
    pub fn limit(&self) -> Option<Duration> {
        match self {
            MaxUsage::Unlimited => None,
            MaxUsage::Limited(d) => Some(*d),
        }
    }

    /// Usable duration out of `requested`
    pub fn within(&self, requested: Duration) -> Duration {
        match self {
            MaxUsage::Unlimited => requested,
            MaxUsage::Limited(d) => (*d).min(requested),
        }
    }
}

/// Affordable share of `cd` given its dry-run call cost.
///
/// `cc` must be decompressed. `default_balance` is the uuid and pre-debit
/// value of the real account's `*default` money balance; once increments
/// paid from it would drive it below zero, usage stops there.
pub fn max_usage(cc: &CallCost, cd: &UsageDescriptor, default_balance: Option<(Uuid, Decimal)>) -> Duration {
    let requested = cd.duration();
    let limit = rate_limit(cd);
    let mut remaining = default_balance.map(|(_, value)| value);
    let mut total = Duration::zero();

    for ts in &cc.timespans {
        if let (Some(limit), Some(ri)) = (limit, ts.rate_interval.as_ref()) {
            let (value, _, unit) = ri.rating.rate_parameters(ts.group_start());
            let unit = units::seconds(unit);
            if !unit.is_zero() && value / unit > limit {
                return total.min(requested);
            }
        }

        for increment in &ts.increments {
            let from_default = match (default_balance, increment.debit_info.as_ref()) {
                (Some((uuid, _)), Some(info)) => info.monetary.as_ref().is_some_and(|m| m.balance_uuid == uuid),
                _ => false,
            };
            if from_default {
                if let Some(value) = remaining.as_mut() {
                    *value -= increment.total_cost();
                    if *value < Decimal::ZERO {
                        return total.min(requested);
                    }
                }
            }
            total = total + increment.total_duration();
        }
    }
    total.min(requested)
}

/// Per-second price ceiling of the descriptor, if set
fn rate_limit(cd: &UsageDescriptor) -> Option<Decimal> {
    let max_rate = cd.max_rate.filter(|r| *r > Decimal::ZERO)?;
    let unit = units::seconds(cd.max_rate_unit);
    if unit <= Decimal::ZERO {
        return None;
    }
    Some(max_rate / unit)
}
