//! Resolved pricing context

use crate::models::rate_interval::RateInterval;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One rating plan activation applying to part of a usage interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RatingInfo {
    pub activation_time: DateTime<Utc>,
    pub matched_subject: String,
    pub matched_prefix: String,
    pub matched_dest_id: String,
    pub rating_plan_id: String,

    /// Rate intervals of the matched destination; empty means no coverage
    #[serde(default)]
    pub rate_intervals: Vec<RateInterval>,

    /// Rating keys tried when this activation has no coverage
    #[serde(default)]
    pub fallback_keys: Vec<String>,
}

impl RatingInfo {
    /// Uncovered placeholder carrying only fallback keys
    pub fn placeholder(activation_time: DateTime<Utc>, fallback_keys: Vec<String>) -> Self {
        Self {
            activation_time,
            fallback_keys,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_covered(&self) -> bool {
        !self.rate_intervals.is_empty()
    }
}

/// Coverage is continuous when the first activation is not after `start`
/// and every entry carries rate intervals
pub fn is_continuous(infos: &[RatingInfo], start: DateTime<Utc>) -> bool {
    match infos.first() {
        Some(first) if first.activation_time <= start => infos.iter().all(RatingInfo::is_covered),
        _ => false,
    }
}
