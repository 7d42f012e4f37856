//! Sub-interval and increment models
//!
//! A [`TimeSpan`] is a contiguous slice of the usage interval priced under a
//! single rate interval. Its [`Increment`]s are the billed units and, through
//! their [`DebitInfo`], the ledger that refunds replay.

use crate::models::rate_interval::RateInterval;
use crate::models::rating_info::RatingInfo;
use crate::models::usage::TariffType;
use crate::units;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unit balance that paid an increment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub balance_uuid: Uuid,
    pub balance_id: String,
    /// Units taken from the balance
    pub consumed: Decimal,
    pub tariff_type: TariffType,
}

/// Monetary balance that paid an increment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonetaryInfo {
    pub balance_uuid: Uuid,
    pub balance_id: String,
}

/// Which balance of which account paid an increment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DebitInfo {
    #[serde(default)]
    pub unit: Option<UnitInfo>,

    #[serde(default)]
    pub monetary: Option<MonetaryInfo>,

    /// Owning account key; differs from the caller for shared-group debits
    pub account_id: String,
}

fn one() -> u32 {
    1
}

/// Smallest billed unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Increment {
    #[serde(with = "crate::serde_duration")]
    pub duration: Duration,

    pub cost: Decimal,

    #[serde(default)]
    pub debit_info: Option<DebitInfo>,

    /// Number of identical consecutive increments this entry stands for
    #[serde(default = "one")]
    pub compress_factor: u32,
}

impl Increment {
    pub fn new(duration: Duration, cost: Decimal) -> Self {
        Self {
            duration,
            cost,
            debit_info: None,
            compress_factor: 1,
        }
    }

    pub fn total_cost(&self) -> Decimal {
        self.cost * Decimal::from(self.compress_factor)
    }

    pub fn total_duration(&self) -> Duration {
        self.duration * self.compress_factor as i32
    }

    fn same_as(&self, other: &Increment) -> bool {
        self.duration == other.duration && self.cost == other.cost && self.debit_info == other.debit_info
    }
}

/// Collapse runs of identical increments
pub fn compress_increments(increments: Vec<Increment>) -> Vec<Increment> {
    let mut out: Vec<Increment> = Vec::with_capacity(increments.len());
    for inc in increments {
        match out.last_mut() {
            Some(last) if last.same_as(&inc) => last.compress_factor += inc.compress_factor,
            _ => out.push(inc),
        }
    }
    out
}

/// Expand compressed increments back to one entry per billed unit
pub fn decompress_increments(increments: Vec<Increment>) -> Vec<Increment> {
    let mut out = Vec::with_capacity(increments.len());
    for inc in increments {
        let factor = inc.compress_factor.max(1);
        for _ in 0..factor {
            out.push(Increment {
                compress_factor: 1,
                ..inc.clone()
            });
        }
    }
    out
}

/// Contiguous slice of usage priced under one rate interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,

    pub cost: Decimal,

    /// Cumulative session duration at `time_end`
    #[serde(with = "crate::serde_duration")]
    pub duration_index: Duration,

    #[serde(default)]
    pub rate_interval: Option<RateInterval>,

    #[serde(default)]
    pub increments: Vec<Increment>,

    #[serde(default)]
    pub matched_subject: String,
    #[serde(default)]
    pub matched_prefix: String,
    #[serde(default)]
    pub matched_dest_id: String,
    #[serde(default)]
    pub rating_plan_id: String,

    /// Index of the RatingInfo in force, within the descriptor
    #[serde(skip)]
    pub rating_info: Option<usize>,
}

impl TimeSpan {
    pub fn new(time_start: DateTime<Utc>, time_end: DateTime<Utc>, duration_index: Duration) -> Self {
        Self {
            time_start,
            time_end,
            cost: Decimal::ZERO,
            duration_index,
            rate_interval: None,
            increments: Vec::new(),
            matched_subject: String::new(),
            matched_prefix: String::new(),
            matched_dest_id: String::new(),
            rating_plan_id: String::new(),
            rating_info: None,
        }
    }

    #[inline]
    pub fn duration(&self) -> Duration {
        self.time_end - self.time_start
    }

    /// Session offset where this span begins
    pub fn group_start(&self) -> Duration {
        let start = self.duration_index - self.duration();
        if start < Duration::zero() {
            Duration::zero()
        } else {
            start
        }
    }

    #[inline]
    pub fn group_end(&self) -> Duration {
        self.duration_index
    }

    /// Tag this span with a RatingInfo and copy its match metadata
    pub fn set_rating_info(&mut self, index: usize, info: &RatingInfo) {
        self.rating_info = Some(index);
        self.matched_subject = info.matched_subject.clone();
        self.matched_prefix = info.matched_prefix.clone();
        self.matched_dest_id = info.matched_dest_id.clone();
        self.rating_plan_id = info.rating_plan_id.clone();
    }

    /// Cut at `at`, keeping `[start, at)` and returning `[at, end)`.
    ///
    /// The tail inherits the rating metadata but not the rate interval.
    pub fn split_at(&mut self, at: DateTime<Utc>) -> TimeSpan {
        let mut tail = TimeSpan::new(at, self.time_end, self.duration_index);
        tail.rating_info = self.rating_info;
        tail.matched_subject = self.matched_subject.clone();
        tail.matched_prefix = self.matched_prefix.clone();
        tail.matched_dest_id = self.matched_dest_id.clone();
        tail.rating_plan_id = self.rating_plan_id.clone();
        self.time_end = at;
        self.duration_index = self.duration_index - tail.duration();
        tail
    }

    /// Cost from the increments when present, else from the rate interval
    pub fn calculate_cost(&self) -> Decimal {
        if !self.increments.is_empty() {
            return self.increments.iter().map(Increment::total_cost).sum();
        }
        match &self.rate_interval {
            Some(ri) => ri.rating.cost(self.duration(), self.group_start()),
            None => Decimal::ZERO,
        }
    }

    /// Billed usage in seconds
    pub fn usage_seconds(&self) -> Decimal {
        units::seconds(self.increments.iter().map(Increment::total_duration).fold(Duration::zero(), |a, b| a + b))
    }

    /// Spans that can be merged into one
    pub fn mergeable_with(&self, next: &TimeSpan) -> bool {
        self.time_end == next.time_start
            && self.rate_interval == next.rate_interval
            && self.matched_subject == next.matched_subject
            && self.matched_prefix == next.matched_prefix
            && self.matched_dest_id == next.matched_dest_id
            && self.rating_plan_id == next.rating_plan_id
    }

    /// Absorb the following span
    pub fn merge(&mut self, next: TimeSpan) {
        self.time_end = next.time_end;
        self.duration_index = next.duration_index;
        self.cost += next.cost;
        self.increments.extend(next.increments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, min, 0).unwrap()
    }

    #[test]
    fn test_split_keeps_duration_index_consistent() {
        let mut ts = TimeSpan::new(at(0), at(10), Duration::minutes(15));
        let tail = ts.split_at(at(4));
        assert_eq!(ts.time_end, at(4));
        assert_eq!(tail.time_start, at(4));
        assert_eq!(tail.duration_index, Duration::minutes(15));
        assert_eq!(ts.duration_index, Duration::minutes(9));
        assert_eq!(ts.group_start(), Duration::minutes(5));
        assert_eq!(tail.group_start(), Duration::minutes(9));
    }

    #[test]
    fn test_compress_and_decompress() {
        let a = Increment::new(Duration::seconds(1), dec!(0.01));
        let b = Increment::new(Duration::seconds(60), dec!(0.5));
        let compressed = compress_increments(vec![a.clone(), a.clone(), a.clone(), b.clone()]);
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].compress_factor, 3);
        assert_eq!(compressed[0].total_cost(), dec!(0.03));

        let expanded = decompress_increments(compressed);
        assert_eq!(expanded, vec![a.clone(), a.clone(), a, b]);
    }

    #[test]
    fn test_merge_adjacent() {
        let mut first = TimeSpan::new(at(0), at(1), Duration::minutes(1));
        first.cost = dec!(1);
        let mut second = TimeSpan::new(at(1), at(2), Duration::minutes(2));
        second.cost = dec!(2);
        assert!(first.mergeable_with(&second));
        first.merge(second);
        assert_eq!(first.time_end, at(2));
        assert_eq!(first.cost, dec!(3));
        assert_eq!(first.duration_index, Duration::minutes(2));
    }
}
