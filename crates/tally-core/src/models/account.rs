//! Account model
//!
//! An account holds balances grouped by tariff type. Unit balances (free
//! minutes, data bundles) pay usage directly; monetary balances pay cost.
//! Balances flagged with a shared group can be consumed by every member
//! account of that group.

use crate::models::usage::TariffType;
use crate::ANY;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Id of the monetary balance created on demand when an account goes negative
pub const DEFAULT_BALANCE_ID: &str = "*default";

fn new_uuid() -> Uuid {
    Uuid::new_v4()
}

/// A single balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    #[serde(default = "new_uuid")]
    pub uuid: Uuid,

    #[serde(default)]
    pub id: String,

    pub value: Decimal,

    /// Selection priority, higher first
    #[serde(default)]
    pub weight: Decimal,

    /// Restrict usage to these destination ids (empty = any)
    #[serde(default)]
    pub destination_ids: Vec<String>,

    /// Once this balance cannot pay, lower priority balances are not tried
    #[serde(default)]
    pub blocker: bool,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,

    #[serde(default)]
    pub shared_group: Option<String>,
}

impl Balance {
    pub fn new(id: &str, value: Decimal, weight: Decimal) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            id: id.to_string(),
            value,
            weight,
            destination_ids: Vec::new(),
            blocker: false,
            disabled: false,
            expiration: None,
            shared_group: None,
        }
    }

    /// Usable at `at`: enabled and not expired
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        !self.disabled && self.expiration.map_or(true, |exp| exp > at)
    }

    /// Match precision against the dialled number's destination ids
    ///
    /// `dest_matches` maps destination id to the length of the prefix that
    /// matched. Unrestricted balances match with precision 0.
    pub fn destination_precision(&self, dest_matches: &HashMap<String, usize>) -> Option<usize> {
        if self.destination_ids.is_empty() || self.destination_ids.iter().any(|d| d == ANY) {
            return Some(0);
        }
        self.destination_ids
            .iter()
            .filter_map(|d| dest_matches.get(d).copied())
            .max()
    }
}

/// Account entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Account {
    /// `tenant:account`
    pub id: String,

    #[serde(default)]
    pub balances: HashMap<TariffType, Vec<Balance>>,

    /// Consumed units (or money) per tariff type
    #[serde(default)]
    pub counters: HashMap<TariffType, Decimal>,

    /// Never limit usage by credit
    #[serde(default)]
    pub allow_negative: bool,

    #[serde(default)]
    pub disabled: bool,
}

impl Account {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn balances_of(&self, tariff: TariffType) -> &[Balance] {
        self.balances.get(&tariff).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn balance_mut(&mut self, tariff: TariffType, uuid: &Uuid) -> Option<&mut Balance> {
        self.balances
            .get_mut(&tariff)
            .and_then(|list| list.iter_mut().find(|b| &b.uuid == uuid))
    }

    /// The `*default` monetary balance, created with weight 0 when missing
    pub fn default_money_balance(&mut self) -> &mut Balance {
        let list = self.balances.entry(TariffType::Monetary).or_default();
        let idx = match list.iter().position(|b| b.id == DEFAULT_BALANCE_ID) {
            Some(idx) => idx,
            None => {
                list.push(Balance::new(DEFAULT_BALANCE_ID, Decimal::ZERO, Decimal::ZERO));
                list.len() - 1
            }
        };
        &mut list[idx]
    }

    /// Value of the `*default` balance if present
    pub fn default_money_value(&self) -> Option<Decimal> {
        self.balances_of(TariffType::Monetary)
            .iter()
            .find(|b| b.id == DEFAULT_BALANCE_ID)
            .map(|b| b.value)
    }

    /// Shared groups referenced by balances usable for `tariff`
    pub fn shared_group_ids(&self, tariff: TariffType) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for t in [tariff, TariffType::Monetary] {
            for b in self.balances_of(t) {
                if let Some(sg) = &b.shared_group {
                    ids.insert(sg.clone());
                }
            }
        }
        ids
    }

    pub fn add_counter(&mut self, tariff: TariffType, amount: Decimal) {
        *self.counters.entry(tariff).or_default() += amount;
    }

    /// Balance values snapshot
    pub fn summary(&self) -> AccountSummary {
        let mut balances: Vec<BalanceSummary> = self
            .balances
            .iter()
            .flat_map(|(tariff, list)| {
                list.iter().map(move |b| BalanceSummary {
                    uuid: b.uuid,
                    id: b.id.clone(),
                    tariff_type: *tariff,
                    value: b.value,
                    disabled: b.disabled,
                })
            })
            .collect();
        balances.sort_by(|a, b| a.tariff_type.cmp(&b.tariff_type).then_with(|| a.id.cmp(&b.id)));
        AccountSummary {
            id: self.id.clone(),
            balances,
            allow_negative: self.allow_negative,
            disabled: self.disabled,
        }
    }
}

/// Balance state in an [`AccountSummary`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub uuid: Uuid,
    pub id: String,
    pub tariff_type: TariffType,
    pub value: Decimal,
    pub disabled: bool,
}

/// Audit snapshot of an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub id: String,
    pub balances: Vec<BalanceSummary>,
    pub allow_negative: bool,
    pub disabled: bool,
}

/// Ordering of shared-group member balances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SharingStrategy {
    /// Highest weight first
    #[default]
    #[serde(rename = "*highest")]
    Highest,
    /// Lowest weight first
    #[serde(rename = "*lowest")]
    Lowest,
}

impl fmt::Display for SharingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharingStrategy::Highest => write!(f, "*highest"),
            SharingStrategy::Lowest => write!(f, "*lowest"),
        }
    }
}

/// Accounts that can pay for each other's usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SharedGroup {
    pub id: String,

    /// Member account keys
    #[serde(default)]
    pub member_ids: Vec<String>,

    #[serde(default)]
    pub strategy: SharingStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_money_balance_created_once() {
        let mut acc = Account::new("cgrates.org:1001");
        acc.default_money_balance().value -= dec!(1.5);
        acc.default_money_balance().value -= dec!(0.5);
        assert_eq!(acc.balances_of(TariffType::Monetary).len(), 1);
        assert_eq!(acc.default_money_value(), Some(dec!(-2)));
    }

    #[test]
    fn test_balance_activity() {
        let now = Utc::now();
        let mut b = Balance::new("b", dec!(10), dec!(10));
        assert!(b.is_active_at(now));
        b.expiration = Some(now - Duration::seconds(1));
        assert!(!b.is_active_at(now));
        b.expiration = None;
        b.disabled = true;
        assert!(!b.is_active_at(now));
    }

    #[test]
    fn test_destination_precision() {
        let mut matches = HashMap::new();
        matches.insert("NAT".to_string(), 2);
        matches.insert("MOBILE".to_string(), 4);

        let mut b = Balance::new("b", dec!(10), dec!(10));
        assert_eq!(b.destination_precision(&matches), Some(0));
        b.destination_ids = vec!["NAT".into(), "MOBILE".into()];
        assert_eq!(b.destination_precision(&matches), Some(4));
        b.destination_ids = vec!["INTL".into()];
        assert_eq!(b.destination_precision(&matches), None);
    }

    #[test]
    fn test_shared_group_ids() {
        let mut acc = Account::new("t:1");
        let mut b = Balance::new("sg", dec!(5), dec!(0));
        b.shared_group = Some("SG1".into());
        acc.balances.insert(TariffType::Monetary, vec![b]);
        assert!(acc.shared_group_ids(TariffType::Voice).contains("SG1"));
    }
}
