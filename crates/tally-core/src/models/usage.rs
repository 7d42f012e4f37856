//! Usage descriptor model
//!
//! A [`UsageDescriptor`] is one rating or debit request: who is calling,
//! where, for which interval, and under which session policies.

use crate::error::AppError;
use crate::models::rating_info::RatingInfo;
use crate::{concatenated_key, AppResult};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Kind of usage being rated; also keys balance collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum TariffType {
    #[default]
    #[serde(rename = "*voice")]
    Voice,
    #[serde(rename = "*data")]
    Data,
    #[serde(rename = "*sms")]
    Sms,
    #[serde(rename = "*generic")]
    Generic,
    #[serde(rename = "*monetary")]
    Monetary,
}

impl fmt::Display for TariffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TariffType::Voice => "*voice",
            TariffType::Data => "*data",
            TariffType::Sms => "*sms",
            TariffType::Generic => "*generic",
            TariffType::Monetary => "*monetary",
        };
        f.write_str(s)
    }
}

impl TariffType {
    /// Parse from string (case-insensitive, leading `*` optional)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim_start_matches('*').to_lowercase().as_str() {
            "voice" => Some(TariffType::Voice),
            "data" => Some(TariffType::Data),
            "sms" => Some(TariffType::Sms),
            "generic" => Some(TariffType::Generic),
            "monetary" => Some(TariffType::Monetary),
            _ => None,
        }
    }

    /// Usage of this kind is split on plan activations and calendar days
    pub fn is_calendar_aware(&self) -> bool {
        matches!(self, TariffType::Voice)
    }
}

fn default_allow_negative() -> bool {
    true
}

fn zero_duration() -> Duration {
    Duration::zero()
}

fn default_max_rate_unit() -> Duration {
    Duration::seconds(60)
}

/// One rating/debit request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageDescriptor {
    pub tenant: String,

    #[serde(default)]
    pub category: String,

    /// Pricing identity
    pub subject: String,

    /// Billing identity; empty means the subject
    #[serde(default)]
    pub account: String,

    pub destination: String,

    #[serde(default)]
    pub tariff_type: TariffType,

    pub time_start: DateTime<Utc>,

    pub time_end: DateTime<Utc>,

    /// Cumulative duration of the session up to `time_end`
    #[serde(default = "zero_duration", with = "crate::serde_duration")]
    pub duration_index: Duration,

    /// 0 for the first segment of a session
    #[serde(default)]
    pub loop_index: u32,

    /// Highest acceptable rate per `max_rate_unit` when estimating
    #[serde(default)]
    pub max_rate: Option<Decimal>,

    #[serde(default = "default_max_rate_unit", with = "crate::serde_duration")]
    pub max_rate_unit: Duration,

    /// Cost already accumulated by earlier segments of the session
    #[serde(default)]
    pub max_cost_so_far: Decimal,

    /// Fail instead of granting less than requested
    #[serde(default)]
    pub force_duration: bool,

    #[serde(default)]
    pub perform_rounding: bool,

    /// When false, balances must not be driven negative
    #[serde(default = "default_allow_negative")]
    pub allow_negative: bool,

    #[serde(default)]
    pub dry_run: bool,

    /// Pricing context attached by the resolver
    #[serde(skip)]
    pub rating_infos: Vec<RatingInfo>,
}

impl UsageDescriptor {
    /// Account storage key (`tenant:account`)
    pub fn account_key(&self) -> String {
        let account = if self.account.is_empty() {
            &self.subject
        } else {
            &self.account
        };
        concatenated_key(&[&self.tenant, account])
    }

    /// Rating profile key for a given subject (`tenant:category:subject`)
    pub fn rating_key(&self, subject: &str) -> String {
        concatenated_key(&[&self.tenant, &self.category, subject])
    }

    /// Elapsed time of this segment
    pub fn duration(&self) -> Duration {
        self.time_end - self.time_start
    }

    /// Check interval sanity and normalize the duration index
    pub fn validate(&mut self) -> AppResult<()> {
        if self.time_end < self.time_start {
            return Err(AppError::Validation(format!(
                "time_end {} is before time_start {}",
                self.time_end, self.time_start
            )));
        }
        let elapsed = self.duration();
        if self.duration_index.is_zero() && !elapsed.is_zero() {
            debug!(elapsed_secs = elapsed.num_seconds(), "Duration index unset, using elapsed time");
            self.duration_index = elapsed;
        } else if self.duration_index < elapsed {
            return Err(AppError::Validation(format!(
                "duration index {}s shorter than elapsed {}s",
                self.duration_index.num_seconds(),
                elapsed.num_seconds()
            )));
        }
        Ok(())
    }

    /// Shrink the request so that it covers only `duration`
    pub fn truncate_to(&mut self, duration: Duration) {
        let removed = self.duration() - duration;
        self.time_end = self.time_start + duration;
        self.duration_index = self.duration_index - removed;
    }
}

impl Default for UsageDescriptor {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            tenant: String::new(),
            category: String::new(),
            subject: String::new(),
            account: String::new(),
            destination: String::new(),
            tariff_type: TariffType::Voice,
            time_start: now,
            time_end: now,
            duration_index: Duration::zero(),
            loop_index: 0,
            max_rate: None,
            max_rate_unit: default_max_rate_unit(),
            max_cost_so_far: Decimal::ZERO,
            force_duration: false,
            perform_rounding: false,
            allow_negative: true,
            dry_run: false,
            rating_infos: Vec::new(),
        }
    }
}
