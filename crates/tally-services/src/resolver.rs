//! Tariff resolver
//!
//! Finds the rating plan activations covering a usage window and, when an
//! activation does not price the destination, chases its fallback subjects
//! over the uncovered sub-window only.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tally_core::config::RatingConfig;
use tally_core::models::rating_info::is_continuous;
use tally_core::models::{Destination, RateInterval, RatingInfo, RatingPlan, RatingProfile, UsageDescriptor};
use tally_core::traits::TariffStore;
use tally_core::{AppError, AppResult, ANY, KEY_SEPARATOR};
use tracing::{debug, error, instrument, warn};

/// Prefixes of a dialled number with the destination ids they belong to,
/// longest prefix first
type PrefixMatches = Vec<(String, Vec<String>)>;

/// Tariff resolver over a [`TariffStore`]
pub struct TariffResolver<T: TariffStore> {
    tariffs: Arc<T>,
    config: RatingConfig,
}

impl<T: TariffStore> TariffResolver<T> {
    /// Create a new tariff resolver
    pub fn new(tariffs: Arc<T>, config: RatingConfig) -> Self {
        Self { tariffs, config }
    }

    pub fn config(&self) -> &RatingConfig {
        &self.config
    }

    /// Attach the rating infos covering `cd` to it.
    ///
    /// The primary subject is tried first, then the fallback subject once.
    /// No plan at all yields [`AppError::RatingPlanNotFound`]; plans that
    /// leave part of the window unpriced yield
    /// [`AppError::UnauthorizedDestination`].
    #[instrument(skip(self, cd), fields(subject = %cd.subject, destination = %cd.destination))]
    pub async fn load_rating_plans(&self, cd: &mut UsageDescriptor) -> AppResult<()> {
        let primary = cd.rating_key(&cd.subject);
        let prefixes = self.prefix_matches(&cd.destination).await?;

        let mut result = self
            .resolve(primary.clone(), &prefixes, cd.time_start, cd.time_end, 1)
            .await;

        let retry = match &result {
            Ok(infos) => !is_continuous(infos, cd.time_start),
            Err(AppError::MaxRecursionDepth(_)) => false,
            Err(_) => true,
        };
        if retry {
            let fallback = cd.rating_key(&self.config.fallback_subject);
            if fallback != primary {
                debug!("Primary subject incomplete, trying {}", fallback);
                let second = self
                    .resolve(fallback, &prefixes, cd.time_start, cd.time_end, 1)
                    .await;
                // keep the partial primary answer if the fallback has nothing
                result = match (result, second) {
                    (_, Err(e @ AppError::MaxRecursionDepth(_))) => Err(e),
                    (Ok(first), Err(_)) => Ok(first),
                    (Ok(first), Ok(second)) if second.is_empty() => Ok(first),
                    (_, second) => second,
                };
            }
        }

        match result {
            Ok(infos) if is_continuous(&infos, cd.time_start) => {
                debug!(rating_infos = infos.len(), "Rating plans loaded");
                cd.rating_infos = infos;
                Ok(())
            }
            Ok(infos) if !infos.is_empty() => {
                warn!("Destination {} not covered for the whole call", cd.destination);
                Err(AppError::UnauthorizedDestination(cd.destination.clone()))
            }
            Err(e @ AppError::MaxRecursionDepth(_)) => {
                error!("Fallback resolution too deep for {}: {}", primary, e);
                Err(e)
            }
            Ok(_) | Err(_) => {
                error!("Could not determine rating plans for {}", primary);
                Err(AppError::RatingPlanNotFound(primary))
            }
        }
    }

    /// Destination id -> matched prefix length for a dialled number
    pub async fn destination_matches(&self, destination: &str) -> AppResult<HashMap<String, usize>> {
        let mut matches = HashMap::new();
        for (prefix, ids) in self.prefix_matches(destination).await? {
            for id in ids {
                matches.entry(id).or_insert(prefix.len());
            }
        }
        Ok(matches)
    }

    async fn prefix_matches(&self, destination: &str) -> AppResult<PrefixMatches> {
        let mut out = Vec::new();
        for prefix in Destination::generate_prefixes(destination) {
            let ids = self.tariffs.destination_ids_for_prefix(&prefix).await?;
            if !ids.is_empty() {
                out.push((prefix, ids));
            }
        }
        Ok(out)
    }

    /// Rating infos of `key` over `[start, end]`, fallbacks merged in
    fn resolve<'a>(
        &'a self,
        key: String,
        prefixes: &'a PrefixMatches,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        depth: usize,
    ) -> BoxFuture<'a, AppResult<Vec<RatingInfo>>> {
        async move {
            if depth > self.config.max_recursion_depth {
                return Err(AppError::MaxRecursionDepth(key));
            }
            let profile = self
                .tariffs
                .get_rating_profile(&key)
                .await?
                .ok_or_else(|| AppError::RatingProfileNotFound(key.clone()))?;

            let infos = self.window_infos(&profile, prefixes, start, end).await?;
            if is_continuous(&infos, start) {
                return Ok(infos);
            }

            let mut merged = Vec::with_capacity(infos.len());
            for (idx, info) in infos.iter().enumerate() {
                if info.is_covered() || info.fallback_keys.is_empty() {
                    merged.push(info.clone());
                    continue;
                }
                let sub_start = if idx == 0 { start } else { info.activation_time };
                let sub_end = infos.get(idx + 1).map(|n| n.activation_time).unwrap_or(end);

                match self
                    .chase_fallbacks(&info.fallback_keys, prefixes, sub_start, sub_end, depth + 1)
                    .await?
                {
                    Some(found) => merged.extend(found),
                    None => merged.push(info.clone()),
                }
            }
            merged.sort_by_key(|ri| ri.activation_time);
            Ok(merged)
        }
        .boxed()
    }

    /// First fallback key covering the half-open sub-window `[start, end)`,
    /// else the best partial one
    async fn chase_fallbacks(
        &self,
        keys: &[String],
        prefixes: &PrefixMatches,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        depth: usize,
    ) -> AppResult<Option<Vec<RatingInfo>>> {
        let mut partial: Option<Vec<RatingInfo>> = None;
        for key in keys {
            let found = match self.resolve(key.clone(), prefixes, start, end, depth).await {
                Ok(found) => found,
                Err(e @ AppError::MaxRecursionDepth(_)) => return Err(e),
                Err(e) => {
                    debug!("Fallback {} skipped: {}", key, e);
                    continue;
                }
            };
            // activations from `end` on belong to the caller's own plans
            let found: Vec<RatingInfo> = found
                .into_iter()
                .filter(|ri| ri.activation_time <= start || ri.activation_time < end)
                .collect();
            let continuous = is_continuous(&found, start);
            let mut covered: Vec<RatingInfo> = found.into_iter().filter(RatingInfo::is_covered).collect();
            if covered.is_empty() {
                continue;
            }
            if covered[0].activation_time < start {
                covered[0].activation_time = start;
            }
            if continuous {
                return Ok(Some(covered));
            }
            if partial.is_none() {
                partial = Some(covered);
            }
        }
        Ok(partial)
    }

    /// One RatingInfo per active activation of the profile
    async fn window_infos(
        &self,
        profile: &RatingProfile,
        prefixes: &PrefixMatches,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<RatingInfo>> {
        let mut infos = Vec::new();
        for activation in profile.active_for(start, end) {
            let plan = match self.tariffs.get_rating_plan(&activation.rating_plan_id).await? {
                Some(plan) => plan,
                None => {
                    warn!("Rating plan {} referenced by {} not found", activation.rating_plan_id, profile.id);
                    RatingPlan::default()
                }
            };
            match match_destination(&plan, prefixes) {
                Some((prefix, dest_id, intervals)) => infos.push(RatingInfo {
                    activation_time: activation.activation_time,
                    matched_subject: profile.id.clone(),
                    matched_prefix: prefix,
                    matched_dest_id: dest_id,
                    rating_plan_id: activation.rating_plan_id.clone(),
                    rate_intervals: intervals,
                    fallback_keys: activation.fallback_keys.clone(),
                }),
                None if !activation.fallback_keys.is_empty() => {
                    let mut placeholder =
                        RatingInfo::placeholder(activation.activation_time, activation.fallback_keys.clone());
                    placeholder.rating_plan_id = activation.rating_plan_id.clone();
                    infos.push(placeholder);
                }
                None => debug!("Plan {} does not price any prefix", activation.rating_plan_id),
            }
        }

        // the window starts before the first activation
        if let Some(first) = infos.first() {
            if first.activation_time > start {
                if let Some(key) = self.fallback_key_for(&profile.id) {
                    infos.insert(0, RatingInfo::placeholder(start, vec![key]));
                }
            }
        }
        Ok(infos)
    }

    fn fallback_key_for(&self, profile_key: &str) -> Option<String> {
        let (scope, subject) = profile_key.rsplit_once(KEY_SEPARATOR)?;
        if subject == self.config.fallback_subject {
            return None;
        }
        Some(format!("{}{}{}", scope, KEY_SEPARATOR, self.config.fallback_subject))
    }
}

/// Longest matching prefix wins; among ids sharing it the heaviest priced
/// destination wins; `*any` is the last resort
fn match_destination(plan: &RatingPlan, prefixes: &PrefixMatches) -> Option<(String, String, Vec<RateInterval>)> {
    for (prefix, ids) in prefixes {
        let best = ids
            .iter()
            .filter_map(|id| plan.destination_weight(id).map(|w| (w, id)))
            .fold(None, |best: Option<(Decimal, &String)>, cur| match best {
                Some(b) if b.0 >= cur.0 => Some(b),
                _ => Some(cur),
            });
        if let Some((_, id)) = best {
            let intervals = plan.destination_rates.get(id).cloned().unwrap_or_default();
            return Some((prefix.clone(), id.clone(), intervals));
        }
    }
    plan.destination_rates
        .get(ANY)
        .map(|intervals| (ANY.to_string(), ANY.to_string(), intervals.clone()))
}
