//! Balance debit engine
//!
//! Consumes priced increments against the balances of an account and of the
//! members of its shared groups, recording in every increment which balance
//! of which account paid for it.

use crate::refund::refund_rounding;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tally_core::models::{
    Account, AccountSummary, Balance, CallCost, DebitInfo, Increment, MonetaryInfo, SharedGroup, SharingStrategy,
    TariffType, UnitInfo, UsageDescriptor,
};
use tally_core::traits::AccountStore;
use tally_core::{units, AppError, AppResult};
use tally_guardian::canonical_keys;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// The accounts one debit may touch: the caller plus shared-group members
#[derive(Debug, Clone)]
pub struct AccountSet {
    primary: String,
    accounts: BTreeMap<String, Account>,
    groups: Vec<SharedGroup>,
    touched: BTreeSet<String>,
}

impl AccountSet {
    /// Load `key` and every member of the shared groups its `tariff`
    /// balances belong to
    #[instrument(skip(store))]
    pub async fn load<A: AccountStore + ?Sized>(store: &A, key: &str, tariff: TariffType) -> AppResult<Self> {
        let primary = store.get_account(key).await?.ok_or_else(|| {
            error!("Account not found: {}", key);
            AppError::AccountNotFound(key.to_string())
        })?;
        if primary.disabled {
            error!("Account disabled: {}", key);
            return Err(AppError::AccountDisabled(key.to_string()));
        }

        let mut accounts = BTreeMap::new();
        let mut groups = Vec::new();
        for group_id in primary.shared_group_ids(tariff) {
            let Some(group) = store.get_shared_group(&group_id).await? else {
                warn!(group = %group_id, "Shared group referenced by {} not found", key);
                continue;
            };
            for member in &group.member_ids {
                if member == key || accounts.contains_key(member) {
                    continue;
                }
                match store.get_account(member).await? {
                    Some(account) if !account.disabled => {
                        accounts.insert(member.clone(), account);
                    }
                    Some(_) => debug!(member = %member, "Skipping disabled group member"),
                    None => warn!(member = %member, group = %group.id, "Group member account not found"),
                }
            }
            groups.push(group);
        }
        accounts.insert(key.to_string(), primary);

        Ok(Self {
            primary: key.to_string(),
            accounts,
            groups,
            touched: BTreeSet::new(),
        })
    }

    /// Keys that must be locked before this set may be changed
    pub fn required_keys(&self) -> Vec<String> {
        canonical_keys(
            std::iter::once(self.primary.clone())
                .chain(self.groups.iter().flat_map(|g| g.member_ids.iter().cloned())),
        )
    }

    pub fn primary(&self) -> &Account {
        // inserted by `load`, never removed
        &self.accounts[&self.primary]
    }

    pub fn summary(&self) -> AccountSummary {
        self.primary().summary()
    }

    pub fn get(&self, id: &str) -> Option<&Account> {
        self.accounts.get(id)
    }

    /// Mutable access; the account will be persisted
    fn get_mut(&mut self, id: &str) -> Option<&mut Account> {
        let account = self.accounts.get_mut(id)?;
        self.touched.insert(id.to_string());
        Some(account)
    }

    /// Ids of the accounts changed so far
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.touched.iter().map(String::as_str)
    }

    /// Write every touched account once
    #[instrument(skip(self, store), fields(account = %self.primary))]
    pub async fn persist<A: AccountStore + ?Sized>(&self, store: &A) -> AppResult<()> {
        for id in &self.touched {
            if let Some(account) = self.accounts.get(id) {
                store.set_account(account).await?;
            }
        }
        debug!(accounts = self.touched.len(), "Persisted accounts");
        Ok(())
    }

    /// Balances able to pay `tariff` usage, in consumption order.
    ///
    /// Own balances go by weight then destination precision; a shared
    /// balance expands in place into the group's pool.
    fn candidates(&self, tariff: TariffType, at: DateTime<Utc>, dest: &HashMap<String, usize>) -> Vec<Candidate> {
        let primary = self.primary();
        let mut own: Vec<(&Balance, usize)> = primary
            .balances_of(tariff)
            .iter()
            .filter(|b| b.is_active_at(at))
            .filter_map(|b| b.destination_precision(dest).map(|p| (b, p)))
            .collect();
        own.sort_by(|a, b| b.0.weight.cmp(&a.0.weight).then_with(|| b.1.cmp(&a.1)));

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (balance, _) in own {
            let group = balance
                .shared_group
                .as_ref()
                .and_then(|id| self.groups.iter().find(|g| &g.id == id));
            let expanded = match group {
                Some(group) => self.pool(group, tariff, at, dest),
                None => vec![Candidate::new(&primary.id, balance)],
            };
            out.extend(expanded.into_iter().filter(|c| seen.insert(c.uuid)));
        }
        out
    }

    /// Shared balances of `group`, ordered by its strategy, caller first on ties
    fn pool(&self, group: &SharedGroup, tariff: TariffType, at: DateTime<Utc>, dest: &HashMap<String, usize>) -> Vec<Candidate> {
        let members = std::iter::once(self.primary.as_str()).chain(
            group
                .member_ids
                .iter()
                .map(String::as_str)
                .filter(|m| *m != self.primary),
        );

        let mut pool: Vec<(Decimal, Candidate)> = Vec::new();
        for member in members {
            let Some(account) = self.accounts.get(member) else { continue };
            for b in account.balances_of(tariff) {
                if b.shared_group.as_deref() == Some(group.id.as_str())
                    && b.is_active_at(at)
                    && b.destination_precision(dest).is_some()
                {
                    pool.push((b.weight, Candidate::new(&account.id, b)));
                }
            }
        }
        match group.strategy {
            SharingStrategy::Highest => pool.sort_by(|a, b| b.0.cmp(&a.0)),
            SharingStrategy::Lowest => pool.sort_by(|a, b| a.0.cmp(&b.0)),
        }
        pool.into_iter().map(|(_, c)| c).collect()
    }

    /// Settle one increment; false when nothing could pay for it
    fn pay(&mut self, increment: &mut Increment, tariff: TariffType, plan: &PaymentPlan, go_negative: bool) -> bool {
        let mut blocked = false;

        if !increment.duration.is_zero() {
            let needed = units::seconds(increment.duration);
            for c in &plan.units {
                let Some(account) = self.accounts.get_mut(&c.account_id) else { continue };
                let Some(balance) = account.balance_mut(tariff, &c.uuid) else { continue };
                if balance.value >= needed {
                    balance.value -= needed;
                    account.add_counter(tariff, needed);
                    self.touched.insert(c.account_id.clone());
                    increment.cost = Decimal::ZERO;
                    increment.debit_info = Some(DebitInfo {
                        unit: Some(UnitInfo {
                            balance_uuid: c.uuid,
                            balance_id: c.balance_id.clone(),
                            consumed: needed,
                            tariff_type: tariff,
                        }),
                        monetary: None,
                        account_id: c.account_id.clone(),
                    });
                    return true;
                }
                if c.blocker {
                    blocked = true;
                    break;
                }
            }
        }

        if increment.cost.is_zero() {
            return true;
        }

        if !blocked {
            for c in &plan.money {
                let Some(account) = self.accounts.get_mut(&c.account_id) else { continue };
                let Some(balance) = account.balance_mut(TariffType::Monetary, &c.uuid) else { continue };
                if balance.value >= increment.cost {
                    balance.value -= increment.cost;
                    account.add_counter(TariffType::Monetary, increment.cost);
                    self.touched.insert(c.account_id.clone());
                    increment.debit_info = Some(monetary_info(&c.account_id, c.uuid, &c.balance_id));
                    return true;
                }
                if c.blocker {
                    break;
                }
            }
        }

        if !go_negative {
            return false;
        }
        let primary = self.primary.clone();
        let Some(account) = self.get_mut(&primary) else {
            return false;
        };
        let balance = account.default_money_balance();
        balance.value -= increment.cost;
        let info = monetary_info(&primary, balance.uuid, &balance.id);
        account.add_counter(TariffType::Monetary, increment.cost);
        increment.debit_info = Some(info);
        true
    }
}

fn monetary_info(account_id: &str, uuid: Uuid, balance_id: &str) -> DebitInfo {
    DebitInfo {
        unit: None,
        monetary: Some(MonetaryInfo {
            balance_uuid: uuid,
            balance_id: balance_id.to_string(),
        }),
        account_id: account_id.to_string(),
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    account_id: String,
    uuid: Uuid,
    balance_id: String,
    blocker: bool,
}

impl Candidate {
    fn new(account_id: &str, balance: &Balance) -> Self {
        Self {
            account_id: account_id.to_string(),
            uuid: balance.uuid,
            balance_id: balance.id.clone(),
            blocker: balance.blocker,
        }
    }
}

/// Unit balances are tried before money
struct PaymentPlan {
    units: Vec<Candidate>,
    money: Vec<Candidate>,
}

/// Walk the increments of `cc` and pay each one.
///
/// Leaves `cc` decompressed. Without `go_negative` the call cost is cut at
/// the first increment nothing could pay for.
pub fn pay_increments(
    set: &mut AccountSet,
    cc: &mut CallCost,
    cd: &UsageDescriptor,
    dest: &HashMap<String, usize>,
    go_negative: bool,
) {
    cc.decompress();
    let plan = PaymentPlan {
        units: if cd.tariff_type == TariffType::Monetary {
            Vec::new()
        } else {
            set.candidates(cd.tariff_type, cd.time_start, dest)
        },
        money: set.candidates(TariffType::Monetary, cd.time_start, dest),
    };

    let mut cut = None;
    'spans: for (i, ts) in cc.timespans.iter_mut().enumerate() {
        for (j, increment) in ts.increments.iter_mut().enumerate() {
            if !set.pay(increment, cd.tariff_type, &plan, go_negative) {
                cut = Some((i, j));
                break 'spans;
            }
        }
    }
    if let Some((span, increment)) = cut {
        debug!(span, increment, "Credit exhausted, truncating");
        truncate_at(cc, span, increment);
    }
    cc.update_cost();
    cc.update_rated_usage();
}

/// Drop increment `increment` of span `span` and everything after it
fn truncate_at(cc: &mut CallCost, span: usize, increment: usize) {
    cc.timespans.truncate(span + 1);
    let keep = match cc.timespans.get_mut(span) {
        Some(ts) => {
            ts.increments.truncate(increment);
            let usage = ts
                .increments
                .iter()
                .fold(Duration::zero(), |acc, inc| acc + inc.total_duration());
            let removed = ts.duration() - usage;
            ts.time_end = ts.time_start + usage;
            ts.duration_index = ts.duration_index - removed;
            !ts.increments.is_empty()
        }
        None => true,
    };
    if !keep {
        cc.timespans.pop();
    }
}

/// Full debit of a priced call cost against `set`
pub fn debit_call_cost(
    set: &mut AccountSet,
    cc: &mut CallCost,
    cd: &UsageDescriptor,
    dest: &HashMap<String, usize>,
    go_negative: bool,
) {
    pay_increments(set, cc, cd, dest, go_negative);
    if cd.perform_rounding {
        reconcile_rounding(set, cc);
    }
    cc.compress();
    cc.max_cost_so_far = cd.max_cost_so_far + cc.cost;
}

/// Round the cost and hand the difference back to the last money payer
fn reconcile_rounding(set: &mut AccountSet, cc: &mut CallCost) {
    let delta = cc.round();
    if delta.is_zero() {
        return;
    }
    let payer = cc
        .timespans
        .iter()
        .rev()
        .flat_map(|ts| ts.increments.iter().rev())
        .filter_map(|inc| inc.debit_info.as_ref())
        .find(|info| info.monetary.is_some())
        .map(|info| DebitInfo {
            unit: None,
            ..info.clone()
        });

    let mut correction = Increment::new(Duration::zero(), delta);
    correction.debit_info = payer;
    if let Some(account_id) = correction.debit_info.as_ref().map(|info| info.account_id.clone()) {
        if let Some(account) = set.get_mut(&account_id) {
            refund_rounding(account, &correction);
        }
    }
    debug!(delta = %delta, "Applied rounding correction");
    cc.round_increment = Some(correction);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tally_core::models::{Rate, RateInterval, Rating, TimeSpan};
    use tally_store::MemoryStore;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn descriptor(seconds: i64) -> UsageDescriptor {
        UsageDescriptor {
            tenant: "t".into(),
            subject: "1001".into(),
            destination: "4930".into(),
            time_start: at(),
            time_end: at() + Duration::seconds(seconds),
            duration_index: Duration::seconds(seconds),
            ..Default::default()
        }
    }

    /// `seconds` one-second increments costing `price` each
    fn call_cost(cd: &UsageDescriptor, price: Decimal, fee: Decimal) -> CallCost {
        let mut ts = TimeSpan::new(cd.time_start, cd.time_end, cd.duration_index);
        ts.rate_interval = Some(RateInterval {
            rating: Rating {
                connect_fee: fee,
                rates: vec![Rate {
                    group_interval_start: Duration::zero(),
                    value: price,
                    rate_increment: Duration::seconds(1),
                    rate_unit: Duration::seconds(1),
                }],
                ..Default::default()
            },
            ..Default::default()
        });
        if !fee.is_zero() {
            ts.increments.push(Increment::new(Duration::zero(), fee));
        }
        let mut inc = Increment::new(Duration::seconds(1), price);
        inc.compress_factor = cd.duration().num_seconds() as u32;
        ts.increments.push(inc);
        let mut cc = CallCost::new(cd);
        cc.timespans = vec![ts];
        cc.update_cost();
        cc
    }

    fn money(id: &str, value: Decimal, weight: Decimal) -> Balance {
        Balance::new(id, value, weight)
    }

    async fn load(store: &MemoryStore) -> AccountSet {
        AccountSet::load(store, "t:1001", TariffType::Voice).await.unwrap()
    }

    #[tokio::test]
    async fn test_missing_and_disabled_accounts() {
        let store = MemoryStore::new();
        let err = AccountSet::load(&store, "t:1001", TariffType::Voice).await.unwrap_err();
        assert!(matches!(err, AppError::AccountNotFound(_)));

        let mut acc = Account::new("t:1001");
        acc.disabled = true;
        store.insert_account(acc);
        let err = AccountSet::load(&store, "t:1001", TariffType::Voice).await.unwrap_err();
        assert!(matches!(err, AppError::AccountDisabled(_)));
    }

    #[tokio::test]
    async fn test_units_before_money_by_weight() {
        let store = MemoryStore::new();
        let mut acc = Account::new("t:1001");
        acc.balances.insert(
            TariffType::Voice,
            vec![Balance::new("low", dec!(100), dec!(5)), Balance::new("high", dec!(10), dec!(20))],
        );
        acc.balances
            .insert(TariffType::Monetary, vec![money("main", dec!(10), dec!(10))]);
        store.insert_account(acc);

        let cd = descriptor(30);
        let mut cc = call_cost(&cd, dec!(0.01), Decimal::ZERO);
        let mut set = load(&store).await;
        debit_call_cost(&mut set, &mut cc, &cd, &HashMap::new(), false);

        let acc = set.get("t:1001").unwrap();
        let voice = acc.balances_of(TariffType::Voice);
        assert_eq!(voice.iter().find(|b| b.id == "high").unwrap().value, dec!(0));
        assert_eq!(voice.iter().find(|b| b.id == "low").unwrap().value, dec!(80));
        assert_eq!(acc.balances_of(TariffType::Monetary)[0].value, dec!(10));
        assert_eq!(acc.counters[&TariffType::Voice], dec!(30));
        assert_eq!(cc.cost, Decimal::ZERO);
        assert_eq!(cc.rated_usage, dec!(30));
    }

    #[tokio::test]
    async fn test_destination_precision_orders_equal_weights() {
        let store = MemoryStore::new();
        let mut acc = Account::new("t:1001");
        let mut generic = money("generic", dec!(10), dec!(10));
        generic.destination_ids = vec!["DE".into()];
        let mut berlin = money("berlin", dec!(10), dec!(10));
        berlin.destination_ids = vec!["DE_BERLIN".into()];
        acc.balances.insert(TariffType::Monetary, vec![generic, berlin]);
        store.insert_account(acc);

        let dest = HashMap::from([("DE".to_string(), 2), ("DE_BERLIN".to_string(), 4)]);
        let cd = descriptor(10);
        let mut cc = call_cost(&cd, dec!(0.1), Decimal::ZERO);
        let mut set = load(&store).await;
        debit_call_cost(&mut set, &mut cc, &cd, &dest, false);

        let list = set.get("t:1001").unwrap().balances_of(TariffType::Monetary);
        assert_eq!(list.iter().find(|b| b.id == "berlin").unwrap().value, dec!(9));
        assert_eq!(list.iter().find(|b| b.id == "generic").unwrap().value, dec!(10));
    }

    #[tokio::test]
    async fn test_truncates_without_go_negative() {
        let store = MemoryStore::new();
        let mut acc = Account::new("t:1001");
        acc.balances
            .insert(TariffType::Monetary, vec![money("main", dec!(0.5), dec!(10))]);
        store.insert_account(acc);

        let cd = descriptor(60);
        let mut cc = call_cost(&cd, dec!(0.02), dec!(0.1));
        let mut set = load(&store).await;
        debit_call_cost(&mut set, &mut cc, &cd, &HashMap::new(), false);

        // fee 0.1 then 20 seconds at 0.02
        assert_eq!(cc.cost, dec!(0.5));
        assert_eq!(cc.total_duration(), Duration::seconds(20));
        assert_eq!(cc.timespans[0].duration_index, Duration::seconds(20));
        assert_eq!(set.get("t:1001").unwrap().balances_of(TariffType::Monetary)[0].value, dec!(0));
    }

    #[tokio::test]
    async fn test_go_negative_uses_default_balance() {
        let store = MemoryStore::new();
        let mut acc = Account::new("t:1001");
        acc.balances
            .insert(TariffType::Monetary, vec![money("main", dec!(0.1), dec!(10))]);
        store.insert_account(acc);

        let cd = descriptor(10);
        let mut cc = call_cost(&cd, dec!(0.1), Decimal::ZERO);
        let mut set = load(&store).await;
        debit_call_cost(&mut set, &mut cc, &cd, &HashMap::new(), true);

        assert_eq!(cc.cost, dec!(1));
        let acc = set.get("t:1001").unwrap();
        assert_eq!(acc.default_money_value(), Some(dec!(-0.9)));
    }

    #[tokio::test]
    async fn test_blocker_stops_consumption() {
        let store = MemoryStore::new();
        let mut acc = Account::new("t:1001");
        let mut blocker = money("promo", dec!(0.05), dec!(20));
        blocker.blocker = true;
        acc.balances
            .insert(TariffType::Monetary, vec![blocker, money("main", dec!(10), dec!(10))]);
        store.insert_account(acc);

        let cd = descriptor(10);
        let mut cc = call_cost(&cd, dec!(0.01), Decimal::ZERO);
        let mut set = load(&store).await;
        debit_call_cost(&mut set, &mut cc, &cd, &HashMap::new(), false);

        assert_eq!(cc.total_duration(), Duration::seconds(5));
        let list = set.get("t:1001").unwrap().balances_of(TariffType::Monetary);
        assert_eq!(list.iter().find(|b| b.id == "main").unwrap().value, dec!(10));
    }

    #[tokio::test]
    async fn test_shared_group_pays_with_owner_recorded() {
        let store = MemoryStore::new();
        let mut caller = Account::new("t:1001");
        let mut own = money("pool", dec!(0.2), dec!(10));
        own.shared_group = Some("SG".into());
        caller.balances.insert(TariffType::Monetary, vec![own]);
        store.insert_account(caller);

        let mut member = Account::new("t:1002");
        let mut shared = money("pool", dec!(5), dec!(10));
        shared.shared_group = Some("SG".into());
        member.balances.insert(TariffType::Monetary, vec![shared]);
        store.insert_account(member);

        store.insert_shared_group(SharedGroup {
            id: "SG".into(),
            member_ids: vec!["t:1001".into(), "t:1002".into()],
            strategy: SharingStrategy::Highest,
        });

        let cd = descriptor(10);
        let mut cc = call_cost(&cd, dec!(0.1), Decimal::ZERO);
        let mut set = load(&store).await;
        assert_eq!(set.required_keys(), vec!["t:1001", "t:1002"]);
        debit_call_cost(&mut set, &mut cc, &cd, &HashMap::new(), false);

        assert_eq!(cc.cost, dec!(1));
        let payers: BTreeSet<&str> = cc
            .increments()
            .filter_map(|i| i.debit_info.as_ref())
            .map(|i| i.account_id.as_str())
            .collect();
        assert_eq!(payers, BTreeSet::from(["t:1001", "t:1002"]));
        assert_eq!(set.get("t:1002").unwrap().balances_of(TariffType::Monetary)[0].value, dec!(4.2));
        assert_eq!(set.touched().collect::<Vec<_>>(), vec!["t:1001", "t:1002"]);
    }

    #[tokio::test]
    async fn test_rounding_correction_goes_back_to_payer() {
        let store = MemoryStore::new();
        let mut acc = Account::new("t:1001");
        acc.balances
            .insert(TariffType::Monetary, vec![money("main", dec!(10), dec!(10))]);
        store.insert_account(acc);

        let mut cd = descriptor(3);
        cd.perform_rounding = true;
        let mut cc = call_cost(&cd, dec!(0.00333), Decimal::ZERO);
        if let Some(ri) = cc.timespans[0].rate_interval.as_mut() {
            ri.rating.rounding_decimals = 2;
            ri.rating.rounding_method = tally_core::models::RoundingMethod::Up;
        }
        let mut set = load(&store).await;
        debit_call_cost(&mut set, &mut cc, &cd, &HashMap::new(), false);

        // 0.00999 rounded up to 0.01, the extra 0.00001 is taken too
        assert_eq!(cc.cost, dec!(0.01));
        let correction = cc.round_increment.as_ref().unwrap();
        assert_eq!(correction.cost, dec!(-0.00001));
        assert_eq!(set.get("t:1001").unwrap().balances_of(TariffType::Monetary)[0].value, dec!(9.99));
    }
}
