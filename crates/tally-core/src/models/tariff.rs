//! Tariff models
//!
//! Destinations group dialling prefixes, rating plans price destinations,
//! and rating profiles activate plans over time for a subject.

use crate::models::rate_interval::RateInterval;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named set of dialling prefixes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Destination {
    pub id: String,
    pub prefixes: Vec<String>,
}

impl Destination {
    /// Normalize a phone number for prefix matching
    pub fn normalize_number(number: &str) -> String {
        number.chars().filter(|c| c.is_ascii_digit()).collect()
    }

    /// Generate all possible prefixes for a number (for LPM lookup)
    ///
    /// Returns prefixes from longest to shortest.
    pub fn generate_prefixes(number: &str) -> Vec<String> {
        let normalized = Self::normalize_number(number);
        (1..=normalized.len())
            .rev()
            .map(|i| normalized[..i].to_string())
            .collect()
    }
}

/// Rate intervals per destination id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RatingPlan {
    pub id: String,

    /// An id mapped to an empty list is explicitly unreachable
    #[serde(default)]
    pub destination_rates: HashMap<String, Vec<RateInterval>>,
}

impl RatingPlan {
    /// Highest interval weight priced for a destination id
    pub fn destination_weight(&self, dest_id: &str) -> Option<Decimal> {
        self.destination_rates
            .get(dest_id)
            .map(|intervals| intervals.iter().map(|ri| ri.weight).max().unwrap_or(Decimal::ZERO))
    }
}

/// Rating plan activation inside a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingPlanActivation {
    pub activation_time: DateTime<Utc>,
    pub rating_plan_id: String,

    #[serde(default)]
    pub fallback_keys: Vec<String>,
}

/// Activation chain for `tenant:category:subject`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RatingProfile {
    pub id: String,

    #[serde(default)]
    pub activations: Vec<RatingPlanActivation>,
}

impl RatingProfile {
    /// Activations relevant to `[start, end]`, ascending: the last one at or
    /// before `start` followed by every one up to `end`
    pub fn active_for(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<&RatingPlanActivation> {
        let mut sorted: Vec<&RatingPlanActivation> = self.activations.iter().collect();
        sorted.sort_by_key(|a| a.activation_time);

        let first = sorted
            .iter()
            .rposition(|a| a.activation_time <= start)
            .unwrap_or(0);

        sorted
            .into_iter()
            .skip(first)
            .take_while(|a| a.activation_time <= end)
            .collect()
    }
}
