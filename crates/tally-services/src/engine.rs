//! Rating engine
//!
//! Public entry point of the rating core: `rate`, `debit`, `max_debit`,
//! `estimate_max_duration` and `refund`. Every operation that changes
//! balances runs under the [`Guardian`] locks of all accounts it may touch.

use crate::calculator::CostCalculator;
use crate::constants::MAX_LOCK_ATTEMPTS;
use crate::debit::{self, AccountSet};
use crate::estimator::{self, MaxUsage};
use crate::refund::refund_increment;
use crate::resolver::TariffResolver;
use crate::splitter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tally_core::models::{CallCost, Increment, TariffType, UsageDescriptor, DEFAULT_BALANCE_ID};
use tally_core::traits::{AccountStore, TariffStore};
use tally_core::{AppConfig, AppError, AppResult};
use tally_guardian::Guardian;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// A request that could not be priced.
///
/// Carries the `-1` sentinel call cost next to the cause so callers can tell
/// "could not price" apart from "priced at zero".
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct Unrated {
    pub call_cost: CallCost,
    #[source]
    pub error: AppError,
}

impl From<Unrated> for AppError {
    fn from(unrated: Unrated) -> Self {
        unrated.error
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Debit,
    MaxDebit,
    MaxUsage,
}

enum Outcome {
    Cost(CallCost),
    Usage(MaxUsage),
}

enum Locked {
    Done(Outcome),
    /// Shared-group membership needs more keys than were locked
    Retry(Vec<String>),
}

/// Rating and debiting facade
pub struct RatingEngine<A: AccountStore, T: TariffStore> {
    accounts: Arc<A>,
    resolver: Arc<TariffResolver<T>>,
    calculator: CostCalculator,
    guardian: Guardian,
    lock_timeout: Option<std::time::Duration>,
}

impl<A: AccountStore, T: TariffStore> Clone for RatingEngine<A, T> {
    fn clone(&self) -> Self {
        Self {
            accounts: self.accounts.clone(),
            resolver: self.resolver.clone(),
            calculator: self.calculator,
            guardian: self.guardian.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<A, T> RatingEngine<A, T>
where
    A: AccountStore + 'static,
    T: TariffStore + 'static,
{
    /// Create a new engine
    pub fn new(accounts: Arc<A>, tariffs: Arc<T>, guardian: Guardian, config: &AppConfig) -> Self {
        Self {
            accounts,
            resolver: Arc::new(TariffResolver::new(tariffs, config.rating.clone())),
            calculator: CostCalculator::from_config(&config.rating),
            guardian,
            lock_timeout: config.lock_timeout(),
        }
    }

    pub fn guardian(&self) -> &Guardian {
        &self.guardian
    }

    /// Price a request without touching any account
    #[instrument(skip(self, cd), fields(subject = %cd.subject, destination = %cd.destination))]
    pub async fn rate(&self, mut cd: UsageDescriptor) -> Result<CallCost, Unrated> {
        match self.price(&mut cd).await {
            Ok(cc) => Ok(cc),
            Err(error) => {
                error!("Failed to rate {}: {}", cd.rating_key(&cd.subject), error);
                Err(Unrated {
                    call_cost: CallCost::unrated(&cd),
                    error,
                })
            }
        }
    }

    /// Price and debit a request; nothing is persisted for dry runs
    #[instrument(skip(self, cd), fields(account = %cd.account_key()))]
    pub async fn debit(&self, cd: UsageDescriptor) -> AppResult<CallCost> {
        match self.with_accounts(cd, Op::Debit).await? {
            Outcome::Cost(cc) => Ok(cc),
            Outcome::Usage(_) => Err(AppError::Internal("debit produced no call cost".into())),
        }
    }

    /// Debit no more than the account can afford.
    ///
    /// Fails with `InsufficientCredit` when nothing is affordable, or when
    /// `force_duration` is set and less than the whole request is.
    #[instrument(skip(self, cd), fields(account = %cd.account_key()))]
    pub async fn max_debit(&self, cd: UsageDescriptor) -> AppResult<CallCost> {
        match self.with_accounts(cd, Op::MaxDebit).await? {
            Outcome::Cost(cc) => Ok(cc),
            Outcome::Usage(_) => Err(AppError::Internal("max debit produced no call cost".into())),
        }
    }

    /// How long the request may run on the account's current credit
    #[instrument(skip(self, cd), fields(account = %cd.account_key()))]
    pub async fn estimate_max_duration(&self, cd: UsageDescriptor) -> AppResult<MaxUsage> {
        match self.with_accounts(cd, Op::MaxUsage).await? {
            Outcome::Usage(usage) => Ok(usage),
            Outcome::Cost(_) => Err(AppError::Internal("estimate produced a call cost".into())),
        }
    }

    /// Give back what `increments` took.
    ///
    /// Each owning account is locked, updated and written once. A failing
    /// account does not stop the others; failures are reported together.
    #[instrument(skip(self, increments), fields(increments = increments.len()))]
    pub async fn refund(&self, increments: &[Increment]) -> AppResult<()> {
        let mut by_account: BTreeMap<String, Vec<Increment>> = BTreeMap::new();
        for increment in increments {
            if let Some(info) = &increment.debit_info {
                by_account
                    .entry(info.account_id.clone())
                    .or_default()
                    .push(increment.clone());
            }
        }

        let mut failures = Vec::new();
        for (account_id, batch) in by_account {
            let store = self.accounts.clone();
            let key = account_id.clone();
            let result = self
                .guardian
                .guard(vec![account_id.clone()], self.lock_timeout, async move {
                    let mut account = store
                        .get_account(&key)
                        .await?
                        .ok_or_else(|| AppError::AccountNotFound(key.clone()))?;
                    let mut changed = 0usize;
                    for increment in &batch {
                        if refund_increment(&mut account, increment) {
                            changed += 1;
                        }
                    }
                    if changed > 0 {
                        store.set_account(&account).await?;
                    }
                    Ok(changed)
                })
                .await;

            match result {
                Ok(changed) => info!(account = %account_id, changed, "Refunded increments"),
                Err(e) => {
                    error!("Refund failed for {}: {}", account_id, e);
                    failures.push(format!("{}: {}", account_id, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::Refund(failures))
        }
    }

    async fn price(&self, cd: &mut UsageDescriptor) -> AppResult<CallCost> {
        cd.validate()?;
        self.resolver.load_rating_plans(cd).await?;
        let spans = splitter::split(cd);
        Ok(self.calculator.price(spans, cd))
    }

    /// Run `op` holding the locks of every account it may touch.
    ///
    /// Keys are guessed from the caller's account first; when its shared
    /// groups turn out to need more, the call is retried with the full set.
    async fn with_accounts(&self, mut cd: UsageDescriptor, op: Op) -> AppResult<Outcome> {
        cd.validate()?;
        let mut keys = vec![cd.account_key()];

        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            let engine = self.clone();
            let request = cd.clone();
            let locked = keys.clone();
            let result = self
                .guardian
                .guard(keys.clone(), self.lock_timeout, async move {
                    engine.run_locked(request, op, locked).await
                })
                .await?;

            match result {
                Locked::Done(outcome) => return Ok(outcome),
                Locked::Retry(required) => {
                    debug!(attempt, keys = ?required, "Lock set grew, retrying");
                    keys = required;
                }
            }
        }

        error!("Lock set for {} kept changing", cd.account_key());
        Err(AppError::Internal(format!(
            "could not settle lock set for {}",
            cd.account_key()
        )))
    }

    async fn run_locked(&self, cd: UsageDescriptor, op: Op, locked: Vec<String>) -> AppResult<Locked> {
        let mut set = AccountSet::load(self.accounts.as_ref(), &cd.account_key(), cd.tariff_type).await?;
        let required = set.required_keys();
        if required.iter().any(|k| !locked.contains(k)) {
            return Ok(Locked::Retry(required));
        }

        let outcome = match op {
            Op::Debit => {
                let go_negative = cd.allow_negative || set.primary().allow_negative;
                Outcome::Cost(self.debit_set(&mut set, cd, go_negative).await?)
            }
            Op::MaxDebit => Outcome::Cost(self.max_debit_set(&mut set, cd).await?),
            Op::MaxUsage => Outcome::Usage(self.estimate_set(&set, cd).await?),
        };
        Ok(Locked::Done(outcome))
    }

    async fn debit_set(&self, set: &mut AccountSet, mut cd: UsageDescriptor, go_negative: bool) -> AppResult<CallCost> {
        let mut cc = self.price(&mut cd).await?;
        let dest = self.resolver.destination_matches(&cd.destination).await?;

        cc.account_summary = Some(set.summary());
        debit::debit_call_cost(set, &mut cc, &cd, &dest, go_negative);
        cc.account_summary_after = Some(set.summary());

        if cd.dry_run {
            debug!("Dry run, accounts left untouched");
        } else {
            set.persist(self.accounts.as_ref()).await?;
        }
        info!(cost = %cc.cost, usage = %cc.rated_usage, dry_run = cd.dry_run, "Debited usage");
        Ok(cc)
    }

    async fn max_debit_set(&self, set: &mut AccountSet, mut cd: UsageDescriptor) -> AppResult<CallCost> {
        if set.primary().allow_negative {
            return self.debit_set(set, cd, true).await;
        }

        let requested = cd.duration();
        let available = self.estimate_set(set, cd.clone()).await?.within(requested);
        let insufficient = AppError::InsufficientCredit {
            requested: requested.num_seconds(),
            available: available.num_seconds(),
        };
        if available.is_zero() && !requested.is_zero() {
            error!("No credit left for {}", cd.account_key());
            return Err(insufficient);
        }
        if cd.force_duration && available < requested {
            error!("Forced duration not affordable for {}", cd.account_key());
            return Err(insufficient);
        }
        if available < requested {
            debug!(requested_secs = requested.num_seconds(), available_secs = available.num_seconds(), "Shortening debit");
            cd.truncate_to(available);
        }
        self.debit_set(set, cd, true).await
    }

    async fn estimate_set(&self, set: &AccountSet, mut cd: UsageDescriptor) -> AppResult<MaxUsage> {
        if set.primary().allow_negative {
            return Ok(MaxUsage::Unlimited);
        }
        let default_balance = set
            .primary()
            .balances_of(TariffType::Monetary)
            .iter()
            .find(|b| b.id == DEFAULT_BALANCE_ID)
            .map(|b| (b.uuid, b.value));

        let mut cc = self.price(&mut cd).await?;
        let dest = self.resolver.destination_matches(&cd.destination).await?;
        let mut scratch = set.clone();
        debit::pay_increments(&mut scratch, &mut cc, &cd, &dest, false);

        let usage = estimator::max_usage(&cc, &cd, default_balance);
        debug!(usage_secs = usage.num_seconds(), "Estimated max usage");
        Ok(MaxUsage::Limited(usage))
    }
}
