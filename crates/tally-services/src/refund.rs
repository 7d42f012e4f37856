//! Refund and rounding reconciliation
//!
//! Pure balance arithmetic replaying an increment's [`DebitInfo`] in
//! reverse. Locking, loading and persisting are the engine's job.
//!
//! [`DebitInfo`]: tally_core::models::DebitInfo

use rust_decimal::Decimal;
use tally_core::models::{Account, Increment, MonetaryInfo, TariffType};
use tracing::warn;

/// Give back what `increment` took from `account`.
///
/// Returns true when a balance changed. Increments without debit info and
/// balances that no longer exist are skipped.
pub fn refund_increment(account: &mut Account, increment: &Increment) -> bool {
    let Some(info) = &increment.debit_info else {
        return false;
    };
    let factor = Decimal::from(increment.compress_factor.max(1));
    let mut changed = false;

    if let Some(unit) = &info.unit {
        let amount = unit.consumed * factor;
        match account.balance_mut(unit.tariff_type, &unit.balance_uuid) {
            Some(balance) => {
                balance.value += amount;
                changed = true;
            }
            None => warn!(
                account = %account.id,
                balance = %unit.balance_uuid,
                "Refund skipped, unit balance vanished"
            ),
        }
        if changed {
            account.add_counter(unit.tariff_type, -amount);
        }
    }

    if let Some(monetary) = &info.monetary {
        changed |= credit_money(account, monetary, increment.cost * factor);
    }
    changed
}

/// Monetary-only replay of the rounding correction
pub fn refund_rounding(account: &mut Account, increment: &Increment) -> bool {
    match increment.debit_info.as_ref().and_then(|info| info.monetary.as_ref()) {
        Some(monetary) => credit_money(account, monetary, increment.total_cost()),
        None => false,
    }
}

fn credit_money(account: &mut Account, monetary: &MonetaryInfo, amount: Decimal) -> bool {
    if amount.is_zero() {
        return false;
    }
    match account.balance_mut(TariffType::Monetary, &monetary.balance_uuid) {
        Some(balance) => {
            balance.value += amount;
            account.add_counter(TariffType::Monetary, -amount);
            true
        }
        None => {
            warn!(
                account = %account.id,
                balance = %monetary.balance_uuid,
                "Refund skipped, monetary balance vanished"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use tally_core::models::{Balance, DebitInfo, UnitInfo};
    use uuid::Uuid;

    fn account() -> Account {
        let mut acc = Account::new("t:1001");
        acc.balances
            .insert(TariffType::Monetary, vec![Balance::new("main", dec!(5), dec!(10))]);
        acc.balances
            .insert(TariffType::Voice, vec![Balance::new("minutes", dec!(30), dec!(10))]);
        acc
    }

    fn paid_by_money(acc: &Account, cost: Decimal, factor: u32) -> Increment {
        let b = &acc.balances_of(TariffType::Monetary)[0];
        Increment {
            duration: Duration::seconds(1),
            cost,
            debit_info: Some(DebitInfo {
                unit: None,
                monetary: Some(MonetaryInfo {
                    balance_uuid: b.uuid,
                    balance_id: b.id.clone(),
                }),
                account_id: acc.id.clone(),
            }),
            compress_factor: factor,
        }
    }

    #[test]
    fn test_refund_money_with_compress_factor() {
        let mut acc = account();
        let inc = paid_by_money(&acc, dec!(0.25), 4);
        assert!(refund_increment(&mut acc, &inc));
        assert_eq!(acc.balances_of(TariffType::Monetary)[0].value, dec!(6));
        assert_eq!(acc.counters[&TariffType::Monetary], dec!(-1));
    }

    #[test]
    fn test_refund_units() {
        let mut acc = account();
        let b = acc.balances_of(TariffType::Voice)[0].clone();
        let inc = Increment {
            duration: Duration::seconds(60),
            cost: Decimal::ZERO,
            debit_info: Some(DebitInfo {
                unit: Some(UnitInfo {
                    balance_uuid: b.uuid,
                    balance_id: b.id.clone(),
                    consumed: dec!(60),
                    tariff_type: TariffType::Voice,
                }),
                monetary: None,
                account_id: acc.id.clone(),
            }),
            compress_factor: 2,
        };
        assert!(refund_increment(&mut acc, &inc));
        assert_eq!(acc.balances_of(TariffType::Voice)[0].value, dec!(150));
    }

    #[test]
    fn test_missing_debit_info_or_balance_is_noop() {
        let mut acc = account();
        let before = acc.clone();
        assert!(!refund_increment(&mut acc, &Increment::new(Duration::seconds(1), dec!(1))));

        let mut inc = paid_by_money(&acc, dec!(1), 1);
        if let Some(info) = inc.debit_info.as_mut() {
            info.monetary = Some(MonetaryInfo {
                balance_uuid: Uuid::new_v4(),
                balance_id: "gone".into(),
            });
        }
        assert!(!refund_increment(&mut acc, &inc));
        assert_eq!(acc, before);
    }

    #[test]
    fn test_refund_rounding_is_monetary_only() {
        let mut acc = account();
        let mut inc = paid_by_money(&acc, dec!(-0.004), 1);
        inc.duration = Duration::zero();
        assert!(refund_rounding(&mut acc, &inc));
        assert_eq!(acc.balances_of(TariffType::Monetary)[0].value, dec!(4.996));
    }
}
