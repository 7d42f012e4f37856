//! In-memory store
//!
//! Stores everything in concurrent HashMaps. Suitable for testing and
//! single-process deployments; data is lost on restart.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tally_core::models::{Account, Destination, RatingPlan, RatingProfile, SharedGroup};
use tally_core::traits::{AccountStore, TariffStore};
use tally_core::AppResult;
use tracing::{debug, instrument};

/// In-memory implementation of [`AccountStore`] and [`TariffStore`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    accounts: Arc<RwLock<HashMap<String, Account>>>,
    shared_groups: Arc<RwLock<HashMap<String, SharedGroup>>>,
    rating_profiles: Arc<RwLock<HashMap<String, RatingProfile>>>,
    rating_plans: Arc<RwLock<HashMap<String, RatingPlan>>>,
    /// prefix -> destination ids
    destinations: Arc<RwLock<HashMap<String, Vec<String>>>>,
    account_writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, account: Account) {
        self.accounts.write().insert(account.id.clone(), account);
    }

    pub fn insert_shared_group(&self, group: SharedGroup) {
        self.shared_groups.write().insert(group.id.clone(), group);
    }

    pub fn insert_rating_profile(&self, profile: RatingProfile) {
        self.rating_profiles.write().insert(profile.id.clone(), profile);
    }

    pub fn insert_rating_plan(&self, plan: RatingPlan) {
        self.rating_plans.write().insert(plan.id.clone(), plan);
    }

    /// Index a destination under each of its prefixes
    pub fn insert_destination(&self, destination: Destination) {
        let mut index = self.destinations.write();
        for prefix in &destination.prefixes {
            let ids = index.entry(prefix.clone()).or_default();
            if !ids.contains(&destination.id) {
                ids.push(destination.id.clone());
            }
        }
    }

    /// Current copy of an account, bypassing the trait
    pub fn account(&self, key: &str) -> Option<Account> {
        self.accounts.read().get(key).cloned()
    }

    /// Number of `set_account` calls so far
    pub fn account_writes(&self) -> usize {
        self.account_writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    #[instrument(skip(self))]
    async fn get_account(&self, key: &str) -> AppResult<Option<Account>> {
        debug!("Finding account by key: {}", key);
        Ok(self.accounts.read().get(key).cloned())
    }

    #[instrument(skip(self, account), fields(account = %account.id))]
    async fn set_account(&self, account: &Account) -> AppResult<()> {
        self.accounts.write().insert(account.id.clone(), account.clone());
        self.account_writes.fetch_add(1, Ordering::Relaxed);
        debug!("Stored account");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_shared_group(&self, id: &str) -> AppResult<Option<SharedGroup>> {
        Ok(self.shared_groups.read().get(id).cloned())
    }
}

#[async_trait]
impl TariffStore for MemoryStore {
    #[instrument(skip(self))]
    async fn get_rating_profile(&self, key: &str) -> AppResult<Option<RatingProfile>> {
        Ok(self.rating_profiles.read().get(key).cloned())
    }

    #[instrument(skip(self))]
    async fn get_rating_plan(&self, id: &str) -> AppResult<Option<RatingPlan>> {
        Ok(self.rating_plans.read().get(id).cloned())
    }

    async fn destination_ids_for_prefix(&self, prefix: &str) -> AppResult<Vec<String>> {
        Ok(self
            .destinations
            .read()
            .get(prefix)
            .cloned()
            .unwrap_or_default())
    }
}
