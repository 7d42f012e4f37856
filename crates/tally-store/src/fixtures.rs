//! JSON fixtures
//!
//! One document carrying destinations, rating plans, rating profiles,
//! accounts and shared groups, loaded into a [`MemoryStore`]. Dangling
//! references are rejected at parse time.

use crate::memory::MemoryStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tally_core::models::{Account, Destination, RatingPlan, RatingProfile, SharedGroup};
use tally_core::{AppError, AppResult, ANY};
use tracing::{error, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub rating_plans: Vec<RatingPlan>,
    #[serde(default)]
    pub rating_profiles: Vec<RatingProfile>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub shared_groups: Vec<SharedGroup>,
}

impl Fixtures {
    pub fn from_json(json: &str) -> AppResult<Self> {
        let fixtures: Self = serde_json::from_str(json)?;
        fixtures.validate()?;
        Ok(fixtures)
    }

    /// Every destination, rating plan and shared group referenced must be defined
    pub fn validate(&self) -> AppResult<()> {
        let destinations: HashSet<&str> = self.destinations.iter().map(|d| d.id.as_str()).collect();
        for plan in &self.rating_plans {
            if let Some(dest) = plan
                .destination_rates
                .keys()
                .find(|id| id.as_str() != ANY && !destinations.contains(id.as_str()))
            {
                error!("Rating plan {} prices unknown destination {}", plan.id, dest);
                return Err(AppError::DestinationNotFound(dest.clone()));
            }
        }

        let plans: HashSet<&str> = self.rating_plans.iter().map(|p| p.id.as_str()).collect();
        for profile in &self.rating_profiles {
            if let Some(a) = profile
                .activations
                .iter()
                .find(|a| !plans.contains(a.rating_plan_id.as_str()))
            {
                error!("Rating profile {} activates unknown plan {}", profile.id, a.rating_plan_id);
                return Err(AppError::RatingPlanNotFound(a.rating_plan_id.clone()));
            }
        }

        let groups: HashSet<&str> = self.shared_groups.iter().map(|g| g.id.as_str()).collect();
        for account in &self.accounts {
            let missing = account
                .balances
                .values()
                .flatten()
                .filter_map(|b| b.shared_group.as_deref())
                .find(|g| !groups.contains(g));
            if let Some(group) = missing {
                error!("Account {} shares unknown group {}", account.id, group);
                return Err(AppError::SharedGroupNotFound(group.to_string()));
            }
        }
        Ok(())
    }

    /// Read a fixture file
    pub async fn from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            error!("Failed to read fixtures {}: {}", path.display(), e);
            AppError::Internal(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Copy everything into `store`
    pub fn load_into(self, store: &MemoryStore) {
        info!(
            destinations = self.destinations.len(),
            rating_plans = self.rating_plans.len(),
            rating_profiles = self.rating_profiles.len(),
            accounts = self.accounts.len(),
            shared_groups = self.shared_groups.len(),
            "Loading fixtures"
        );
        for d in self.destinations {
            store.insert_destination(d);
        }
        for p in self.rating_plans {
            store.insert_rating_plan(p);
        }
        for p in self.rating_profiles {
            store.insert_rating_profile(p);
        }
        for a in self.accounts {
            store.insert_account(a);
        }
        for g in self.shared_groups {
            store.insert_shared_group(g);
        }
    }

    /// Build a fresh store from these fixtures
    pub fn into_store(self) -> MemoryStore {
        let store = MemoryStore::new();
        self.load_into(&store);
        store
    }
}
