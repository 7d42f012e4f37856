//! Cost calculator
//!
//! Materializes the increments of every split sub-interval, applies the
//! connect fee and the max-cost policy, and produces the [`CallCost`].

use chrono::Duration;
use rust_decimal::Decimal;
use tally_core::config::RatingConfig;
use tally_core::models::{CallCost, Increment, MaxCostStrategy, RoundingMethod, TimeSpan, UsageDescriptor};
use tracing::debug;

/// Prices split sub-intervals
#[derive(Debug, Clone, Copy)]
pub struct CostCalculator {
    /// Precision of a single increment's cost
    rounding_decimals: u32,
}

impl CostCalculator {
    pub fn new(rounding_decimals: u32) -> Self {
        Self { rounding_decimals }
    }

    pub fn from_config(config: &RatingConfig) -> Self {
        Self::new(config.rounding_decimals)
    }

    /// Price `spans` for `cd`.
    ///
    /// The running session cost starts at `cd.max_cost_so_far` so a cap is
    /// shared by every segment of one session.
    pub fn price(&self, spans: Vec<TimeSpan>, cd: &UsageDescriptor) -> CallCost {
        let mut cc = CallCost::new(cd);
        let mut so_far = cd.max_cost_so_far;
        let mut priced: Vec<TimeSpan> = Vec::with_capacity(spans.len());

        for (idx, mut ts) in spans.into_iter().enumerate() {
            let Some(rating) = ts.rate_interval.as_ref().map(|ri| ri.rating.clone()) else {
                priced.push(ts);
                continue;
            };
            if ts.duration().is_zero() {
                priced.push(ts);
                continue;
            }

            let mut increments = Vec::new();
            if idx == 0 && cd.loop_index == 0 && rating.connect_fee > Decimal::ZERO {
                increments.push(Increment::new(Duration::zero(), rating.connect_fee));
                so_far += rating.connect_fee;
            }

            let (_, step, _) = rating.rate_parameters(ts.group_start());
            let count = increment_count(ts.duration(), step);
            // the table's own rounding applies to the call total only
            let per_increment =
                RoundingMethod::Middle.round(rating.increment_cost(ts.group_start()), self.rounding_decimals);

            let cap = rating.cap();
            let mut cut_at = None;
            for n in 0..count {
                let mut cost = per_increment;
                match cap {
                    Some((max, MaxCostStrategy::Free)) if so_far + cost > max => {
                        cost = (max - so_far).max(Decimal::ZERO);
                    }
                    Some((max, MaxCostStrategy::Disconnect)) if so_far + cost > max => {
                        cut_at = Some(n);
                        break;
                    }
                    _ => {}
                }
                so_far += cost;
                increments.push(Increment::new(step, cost));
            }

            ts.increments = increments;
            if let Some(kept) = cut_at {
                debug!(span = idx, kept, "Max cost reached, disconnecting");
                let usage = step * kept as i32;
                let removed = ts.duration() - usage;
                ts.time_end = ts.time_start + usage;
                ts.duration_index = ts.duration_index - removed;
                cc.max_cost_disconnect = true;
                if !ts.increments.is_empty() {
                    priced.push(ts);
                }
                break;
            }
            priced.push(ts);
        }

        cc.timespans = merge_spans(priced);
        cc.update_cost();
        let (method, decimals) = cc.longest_rounding();
        cc.cost = method.round(cc.cost, decimals);
        cc.update_rated_usage();
        cc.max_cost_so_far = so_far;
        cc.compress();
        debug!(cost = %cc.cost, spans = cc.timespans.len(), "Priced usage");
        cc
    }
}

fn increment_count(duration: Duration, step: Duration) -> u32 {
    let step = step.num_milliseconds();
    if step <= 0 {
        return 0;
    }
    let millis = duration.num_milliseconds();
    u32::try_from((millis + step - 1) / step).unwrap_or(u32::MAX)
}

/// Join neighbours that carry the same rate interval and match metadata
pub fn merge_spans(spans: Vec<TimeSpan>) -> Vec<TimeSpan> {
    let mut out: Vec<TimeSpan> = Vec::with_capacity(spans.len());
    for ts in spans {
        match out.last_mut() {
            Some(last) if last.mergeable_with(&ts) => last.merge(ts),
            _ => out.push(ts),
        }
    }
    out
}
