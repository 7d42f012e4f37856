//! Call cost model
//!
//! The output artifact of a rating or debit call.

use crate::models::account::AccountSummary;
use crate::models::rate_interval::RoundingMethod;
use crate::models::timespan::{Increment, TimeSpan};
use crate::models::usage::{TariffType, UsageDescriptor};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Cost reported when a request could not be priced at all
pub const UNRATED_COST: Decimal = Decimal::NEGATIVE_ONE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallCost {
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub account: String,
    pub destination: String,
    pub tariff_type: TariffType,

    pub cost: Decimal,

    pub timespans: Vec<TimeSpan>,

    /// Billed usage in seconds
    #[serde(default)]
    pub rated_usage: Decimal,

    /// Session cost after this call, seeds the next segment's cap
    #[serde(default)]
    pub max_cost_so_far: Decimal,

    /// Usage was cut short by a `*disconnect` cap
    #[serde(default)]
    pub max_cost_disconnect: bool,

    /// Rounding correction applied after the debit
    #[serde(default)]
    pub round_increment: Option<Increment>,

    #[serde(default)]
    pub account_summary: Option<AccountSummary>,

    #[serde(default)]
    pub account_summary_after: Option<AccountSummary>,
}

impl CallCost {
    pub fn new(cd: &UsageDescriptor) -> Self {
        Self {
            tenant: cd.tenant.clone(),
            category: cd.category.clone(),
            subject: cd.subject.clone(),
            account: cd.account_key(),
            destination: cd.destination.clone(),
            tariff_type: cd.tariff_type,
            cost: Decimal::ZERO,
            timespans: Vec::new(),
            rated_usage: Decimal::ZERO,
            max_cost_so_far: cd.max_cost_so_far,
            max_cost_disconnect: false,
            round_increment: None,
            account_summary: None,
            account_summary_after: None,
        }
    }

    /// Placeholder for a request that could not be priced
    pub fn unrated(cd: &UsageDescriptor) -> Self {
        Self {
            cost: UNRATED_COST,
            ..Self::new(cd)
        }
    }

    pub fn is_unrated(&self) -> bool {
        self.cost == UNRATED_COST && self.timespans.is_empty()
    }

    /// Connect fee of the first span's rate interval
    pub fn connect_fee(&self) -> Decimal {
        self.timespans
            .first()
            .and_then(|ts| ts.rate_interval.as_ref())
            .map(|ri| ri.rating.connect_fee)
            .unwrap_or(Decimal::ZERO)
    }

    /// Rounding of the most precise rate table among the spans
    pub fn longest_rounding(&self) -> (RoundingMethod, u32) {
        self.timespans
            .iter()
            .filter_map(|ts| ts.rate_interval.as_ref())
            .map(|ri| (ri.rating.rounding_method, ri.rating.rounding_decimals))
            .fold(None, |best: Option<(RoundingMethod, u32)>, cur| match best {
                Some(b) if b.1 >= cur.1 => Some(b),
                _ => Some(cur),
            })
            .unwrap_or((RoundingMethod::Middle, 4))
    }

    /// Recompute span costs from their increments and the total
    pub fn update_cost(&mut self) {
        let mut total = Decimal::ZERO;
        for ts in &mut self.timespans {
            ts.cost = ts.calculate_cost();
            total += ts.cost;
        }
        self.cost = total;
    }

    pub fn update_rated_usage(&mut self) {
        self.rated_usage = self.timespans.iter().map(TimeSpan::usage_seconds).sum();
    }

    /// Round the total; returns `unrounded - rounded`
    pub fn round(&mut self) -> Decimal {
        let (method, decimals) = self.longest_rounding();
        let rounded = method.round(self.cost, decimals);
        let delta = self.cost - rounded;
        self.cost = rounded;
        delta
    }

    pub fn total_duration(&self) -> Duration {
        self.timespans
            .iter()
            .fold(Duration::zero(), |acc, ts| acc + ts.duration())
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.timespans.last().map(|ts| ts.time_end)
    }

    pub fn compress(&mut self) {
        for ts in &mut self.timespans {
            ts.increments = crate::models::timespan::compress_increments(std::mem::take(&mut ts.increments));
        }
    }

    pub fn decompress(&mut self) {
        for ts in &mut self.timespans {
            ts.increments = crate::models::timespan::decompress_increments(std::mem::take(&mut ts.increments));
        }
    }

    /// Every increment, compressed entries included, in span order
    pub fn increments(&self) -> impl Iterator<Item = &Increment> {
        self.timespans.iter().flat_map(|ts| ts.increments.iter())
    }
}
