//! Rate interval model
//!
//! A [`RateInterval`] couples a calendar predicate ([`Timing`]) with a rate
//! table ([`Rating`]). All calendar evaluation happens in UTC.

use crate::units;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rounding method applied to costs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RoundingMethod {
    #[serde(rename = "*up")]
    Up,
    #[serde(rename = "*down")]
    Down,
    #[default]
    #[serde(rename = "*middle")]
    Middle,
}

impl RoundingMethod {
    /// Round `value` to `decimals` places with this method
    pub fn round(&self, value: Decimal, decimals: u32) -> Decimal {
        let strategy = match self {
            RoundingMethod::Up => RoundingStrategy::AwayFromZero,
            RoundingMethod::Down => RoundingStrategy::ToZero,
            RoundingMethod::Middle => RoundingStrategy::MidpointAwayFromZero,
        };
        value.round_dp_with_strategy(decimals, strategy)
    }
}

impl fmt::Display for RoundingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundingMethod::Up => write!(f, "*up"),
            RoundingMethod::Down => write!(f, "*down"),
            RoundingMethod::Middle => write!(f, "*middle"),
        }
    }
}

/// What happens once a session reaches `max_cost`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxCostStrategy {
    /// Cost is pinned at the cap, the remainder is free
    #[serde(rename = "*free")]
    Free,
    /// Usage stops at the increment reaching the cap
    #[serde(rename = "*disconnect")]
    Disconnect,
}

/// Calendar predicate; empty lists match everything
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Timing {
    #[serde(default)]
    pub years: Vec<i32>,

    #[serde(default)]
    pub months: Vec<u32>,

    #[serde(default)]
    pub month_days: Vec<u32>,

    #[serde(default)]
    pub week_days: Vec<Weekday>,

    /// Inclusive start of the daily window (None = midnight)
    #[serde(default)]
    pub start_time: Option<NaiveTime>,

    /// Exclusive end of the daily window (None = end of day)
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
}

impl Timing {
    /// Check the date part of the predicate
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        (self.years.is_empty() || self.years.contains(&date.year()))
            && (self.months.is_empty() || self.months.contains(&date.month()))
            && (self.month_days.is_empty() || self.month_days.contains(&date.day()))
            && (self.week_days.is_empty() || self.week_days.contains(&date.weekday()))
    }

    /// The daily window `[start, end)` on `date`, or None when the date does not match
    pub fn window_on(&self, date: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.matches_date(date) {
            return None;
        }
        let midnight = date.and_time(NaiveTime::MIN).and_utc();
        let start = self
            .start_time
            .map(|t| date.and_time(t).and_utc())
            .unwrap_or(midnight);
        let end = match self.end_time {
            Some(t) if t > NaiveTime::MIN => date.and_time(t).and_utc(),
            _ => midnight + Duration::days(1),
        };
        if end <= start {
            return None;
        }
        Some((start, end))
    }

    /// True when `at` falls inside the window of its own day
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.window_on(at.date_naive())
            .is_some_and(|(start, end)| start <= at && at < end)
    }
}

/// One rate tier, in force from `group_interval_start` of elapsed usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    #[serde(default = "zero_duration", with = "crate::serde_duration")]
    pub group_interval_start: Duration,

    /// Price per `rate_unit`
    pub value: Decimal,

    /// Billing step
    #[serde(with = "crate::serde_duration")]
    pub rate_increment: Duration,

    #[serde(with = "crate::serde_duration")]
    pub rate_unit: Duration,
}

fn zero_duration() -> Duration {
    Duration::zero()
}

fn default_rounding_decimals() -> u32 {
    4
}

/// Rate table of an interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    #[serde(default)]
    pub connect_fee: Decimal,

    #[serde(default)]
    pub rounding_method: RoundingMethod,

    #[serde(default = "default_rounding_decimals")]
    pub rounding_decimals: u32,

    /// Session cost ceiling; zero disables capping
    #[serde(default)]
    pub max_cost: Decimal,

    #[serde(default)]
    pub max_cost_strategy: Option<MaxCostStrategy>,

    #[serde(default)]
    pub rates: Vec<Rate>,
}

impl Rating {
    /// Tier with the greatest group start not after `offset`
    pub fn tier_at(&self, offset: Duration) -> Option<&Rate> {
        self.rates
            .iter()
            .filter(|r| r.group_interval_start <= offset)
            .max_by_key(|r| r.group_interval_start)
    }

    /// `(value, increment, unit)` in force at `offset`
    pub fn rate_parameters(&self, offset: Duration) -> (Decimal, Duration, Duration) {
        match self.tier_at(offset) {
            Some(rate) => (rate.value, rate.rate_increment, rate.rate_unit),
            None => (Decimal::ZERO, Duration::seconds(1), Duration::seconds(1)),
        }
    }

    /// Unrounded cost of `duration` starting at elapsed `offset`
    pub fn cost(&self, duration: Duration, offset: Duration) -> Decimal {
        let (value, _, unit) = self.rate_parameters(offset);
        let unit_secs = units::seconds(unit);
        if unit_secs.is_zero() {
            return Decimal::ZERO;
        }
        units::seconds(duration) / unit_secs * value
    }

    /// Unrounded cost of one billing step of the tier in force at `offset`
    pub fn increment_cost(&self, offset: Duration) -> Decimal {
        let (_, step, _) = self.rate_parameters(offset);
        self.cost(step, offset)
    }

    /// Elapsed offsets where a later tier takes over
    pub fn tier_starts(&self) -> impl Iterator<Item = Duration> + '_ {
        self.rates
            .iter()
            .map(|r| r.group_interval_start)
            .filter(|gis| *gis > Duration::zero())
    }

    /// Active cap, if any
    pub fn cap(&self) -> Option<(Decimal, MaxCostStrategy)> {
        match self.max_cost_strategy {
            Some(strategy) if self.max_cost > Decimal::ZERO => Some((self.max_cost, strategy)),
            _ => None,
        }
    }
}

impl Default for Rating {
    fn default() -> Self {
        Self {
            connect_fee: Decimal::ZERO,
            rounding_method: RoundingMethod::Middle,
            rounding_decimals: default_rounding_decimals(),
            max_cost: Decimal::ZERO,
            max_cost_strategy: None,
            rates: Vec::new(),
        }
    }
}

/// Calendar predicate plus rate table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RateInterval {
    #[serde(default)]
    pub timing: Timing,

    #[serde(default)]
    pub rating: Rating,

    /// Priority when several intervals match the same instant
    #[serde(default)]
    pub weight: Decimal,
}

impl RateInterval {
    #[inline]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.timing.contains(at)
    }

    /// Start of the window containing `at` (None when not active)
    pub fn window_start(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.timing
            .window_on(at.date_naive())
            .filter(|(start, end)| *start <= at && at < *end)
            .map(|(start, _)| start)
    }

    /// Window edges on the day of `at`
    pub fn edges_on(&self, at: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.timing
            .window_on(at.date_naive())
            .map(|(start, end)| vec![start, end])
            .unwrap_or_default()
    }
}
