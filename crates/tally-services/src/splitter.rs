//! Interval splitter
//!
//! Decomposes a usage interval into contiguous [`TimeSpan`]s, each priced
//! under exactly one rate interval. Calendar-aware usage (voice) is cut on
//! rating plan activations, then at midnight, then on rate interval window
//! edges and tier starts. Other usage is cut on tier starts only. Finally
//! every span is stretched to a whole number of billing increments.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use tally_core::models::{RateInterval, RatingInfo, TimeSpan, UsageDescriptor};
use tally_core::units;
use tracing::debug;

/// Split and normalize
pub fn split(cd: &UsageDescriptor) -> Vec<TimeSpan> {
    let spans = split_spans(cd);
    normalize(spans)
}

/// Split without increment normalization; the result exactly covers
/// `[time_start, time_end]`
pub fn split_spans(cd: &UsageDescriptor) -> Vec<TimeSpan> {
    let mut first = TimeSpan::new(cd.time_start, cd.time_end, cd.duration_index);
    let infos = &cd.rating_infos;
    if infos.is_empty() {
        return vec![first];
    }

    let initial = infos
        .iter()
        .rposition(|ri| ri.activation_time <= cd.time_start)
        .unwrap_or(0);
    first.set_rating_info(initial, &infos[initial]);

    if cd.time_end <= cd.time_start {
        if let Some(ri) = best_interval(&infos[initial].rate_intervals, cd.time_start) {
            first.rate_interval = Some(ri.clone());
        }
        return vec![first];
    }

    let mut spans = vec![first];
    if cd.tariff_type.is_calendar_aware() {
        split_by_rating_plans(&mut spans, infos, cd.time_start, cd.time_end);
        spans = split_by_days(spans);
    }
    let spans = split_by_rate_intervals(spans, infos, cd.tariff_type.is_calendar_aware());
    debug!(spans = spans.len(), "Split usage interval");
    spans
}

fn split_by_rating_plans(spans: &mut Vec<TimeSpan>, infos: &[RatingInfo], start: DateTime<Utc>, end: DateTime<Utc>) {
    for (idx, info) in infos.iter().enumerate() {
        let at = info.activation_time;
        if at <= start {
            continue;
        }
        if at >= end {
            break;
        }
        let Some(last) = spans.last_mut() else { break };
        if last.time_start < at && at < last.time_end {
            let mut tail = last.split_at(at);
            tail.set_rating_info(idx, info);
            spans.push(tail);
        }
    }
}

fn split_by_days(spans: Vec<TimeSpan>) -> Vec<TimeSpan> {
    let mut out = Vec::with_capacity(spans.len());
    for mut ts in spans {
        loop {
            let midnight = next_midnight(ts.time_start);
            if midnight >= ts.time_end {
                out.push(ts);
                break;
            }
            let tail = ts.split_at(midnight);
            out.push(ts);
            ts = tail;
        }
    }
    out
}

fn next_midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    (at.date_naive() + Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(at)
}

fn split_by_rate_intervals(spans: Vec<TimeSpan>, infos: &[RatingInfo], calendar_aware: bool) -> Vec<TimeSpan> {
    let mut out = Vec::with_capacity(spans.len());
    for ts in spans {
        let intervals = ts
            .rating_info
            .and_then(|idx| infos.get(idx))
            .map(|ri| ri.rate_intervals.as_slice())
            .unwrap_or(&[]);
        if intervals.is_empty() {
            out.push(ts);
            continue;
        }
        cut_by_intervals(ts, intervals, calendar_aware, &mut out);
    }
    out
}

/// Walk one span, cutting wherever the interval in force or its tier changes
fn cut_by_intervals(mut ts: TimeSpan, intervals: &[RateInterval], calendar_aware: bool, out: &mut Vec<TimeSpan>) {
    let fixed = if calendar_aware {
        None
    } else {
        Some(best_interval(intervals, ts.time_start))
    };

    loop {
        let current = match fixed {
            Some(ri) => ri,
            None => best_interval(intervals, ts.time_start),
        };

        let mut points: Vec<DateTime<Utc>> = Vec::new();
        if calendar_aware {
            points.extend(intervals.iter().flat_map(|ri| ri.edges_on(ts.time_start)));
        }
        if let Some(ri) = current {
            let group_start = ts.group_start();
            points.extend(
                ri.rating
                    .tier_starts()
                    .filter(|gis| *gis > group_start && *gis < ts.group_end())
                    .map(|gis| ts.time_start + (gis - group_start)),
            );
        }
        points.retain(|p| *p > ts.time_start && *p < ts.time_end);
        points.sort();
        points.dedup();

        let cut = points.into_iter().find(|p| {
            let tier_edge = current.is_some_and(|ri| tier_changes(ri, &ts, *p));
            let owner_edge = fixed.is_none() && !same_interval(best_interval(intervals, *p), current);
            tier_edge || owner_edge
        });

        ts.rate_interval = current.cloned();
        match cut {
            Some(at) => {
                let tail = ts.split_at(at);
                out.push(ts);
                ts = tail;
            }
            None => {
                out.push(ts);
                break;
            }
        }
    }
}

fn tier_changes(ri: &RateInterval, ts: &TimeSpan, at: DateTime<Utc>) -> bool {
    let offset = ts.group_start() + (at - ts.time_start);
    ri.rating.tier_at(ts.group_start()) != ri.rating.tier_at(offset)
}

fn same_interval(a: Option<&RateInterval>, b: Option<&RateInterval>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => std::ptr::eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Rate interval in force at `at`.
///
/// Highest weight wins; on equal weight the interval whose window opened
/// most recently (the narrower one) wins; remaining ties go to the interval
/// declared first.
pub fn best_interval(intervals: &[RateInterval], at: DateTime<Utc>) -> Option<&RateInterval> {
    intervals
        .iter()
        .enumerate()
        .filter_map(|(idx, ri)| ri.window_start(at).map(|ws| (idx, ws, ri)))
        .max_by(|a, b| {
            a.2.weight
                .cmp(&b.2.weight)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| b.0.cmp(&a.0))
        })
        .map(|(_, _, ri)| ri)
}

/// Stretch spans shorter than (or not a multiple of) their billing increment.
///
/// The increment is the one of the tier in force at the span's elapsed
/// offset. A stretched span swallows or trims the spans it now overlaps.
pub fn normalize(mut spans: Vec<TimeSpan>) -> Vec<TimeSpan> {
    let mut i = 0;
    while i < spans.len() {
        let target = spans[i].rate_interval.as_ref().map(|ri| {
            let (_, increment, _) = ri.rating.rate_parameters(spans[i].group_start());
            units::round_up_to(increment, spans[i].duration())
        });
        if let Some(target) = target {
            let ts = &mut spans[i];
            let natural = ts.duration();
            if target > natural {
                ts.time_end = ts.time_start + target;
                ts.duration_index = ts.duration_index + (target - natural);
                remove_overlapped(&mut spans, i);
            }
        }
        i += 1;
    }
    spans
}

fn remove_overlapped(spans: &mut Vec<TimeSpan>, index: usize) {
    let end = spans[index].time_end;
    let mut last_covered = index;
    for j in index + 1..spans.len() {
        match spans[j].time_end.cmp(&end) {
            Ordering::Less | Ordering::Equal => last_covered = j,
            Ordering::Greater => {
                if spans[j].time_start < end {
                    spans[j].time_start = end;
                }
                break;
            }
        }
    }
    if last_covered > index {
        spans.drain(index + 1..=last_covered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tally_core::models::{Rate, Rating, TariffType, Timing};

    fn rate(value: Decimal, increment: i64) -> Rate {
        Rate {
            group_interval_start: Duration::zero(),
            value,
            rate_increment: Duration::seconds(increment),
            rate_unit: Duration::seconds(60),
        }
    }

    fn interval(start: Option<(u32, u32)>, end: Option<(u32, u32)>, weight: Decimal, rates: Vec<Rate>) -> RateInterval {
        RateInterval {
            timing: Timing {
                start_time: start.and_then(|(h, m)| NaiveTime::from_hms_opt(h, m, 0)),
                end_time: end.and_then(|(h, m)| NaiveTime::from_hms_opt(h, m, 0)),
                ..Default::default()
            },
            rating: Rating {
                rates,
                ..Default::default()
            },
            weight,
        }
    }

    /// Peak 08:00-18:00, off-peak 18:00-24:00 and 00:00-08:00
    fn peak_offpeak() -> Vec<RateInterval> {
        vec![
            interval(Some((8, 0)), Some((18, 0)), dec!(10), vec![rate(dec!(1), 1)]),
            interval(Some((18, 0)), None, dec!(10), vec![rate(dec!(0.5), 1)]),
            interval(None, Some((8, 0)), dec!(10), vec![rate(dec!(0.5), 1)]),
        ]
    }

    fn descriptor(start: DateTime<Utc>, end: DateTime<Utc>, intervals: Vec<RateInterval>) -> UsageDescriptor {
        let mut cd = UsageDescriptor {
            tenant: "t".into(),
            subject: "s".into(),
            destination: "49".into(),
            time_start: start,
            time_end: end,
            rating_infos: vec![RatingInfo {
                activation_time: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                rating_plan_id: "RP".into(),
                rate_intervals: intervals,
                ..Default::default()
            }],
            ..Default::default()
        };
        cd.validate().unwrap();
        cd
    }

    fn assert_contiguous(spans: &[TimeSpan], start: DateTime<Utc>, end: DateTime<Utc>) {
        assert_eq!(spans.first().unwrap().time_start, start);
        assert_eq!(spans.last().unwrap().time_end, end);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].time_end, pair[1].time_start);
        }
    }

    #[test]
    fn test_peak_boundary_produces_two_spans() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 17, 30, 0).unwrap();
        let end = start + Duration::hours(1);
        let spans = split(&descriptor(start, end, peak_offpeak()));

        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].time_end, Utc.with_ymd_and_hms(2024, 3, 4, 18, 0, 0).unwrap());
        assert_eq!(spans[0].time_end, spans[1].time_start);
        assert_eq!(spans[0].rate_interval.as_ref().unwrap().rating.rates[0].value, dec!(1));
        assert_eq!(spans[1].rate_interval.as_ref().unwrap().rating.rates[0].value, dec!(0.5));
        assert_eq!(spans[0].duration_index, Duration::minutes(30));
        assert_eq!(spans[1].duration_index, Duration::minutes(60));
    }

    #[test]
    fn test_midnight_split() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 23, 50, 0).unwrap();
        let end = start + Duration::minutes(20);
        let spans = split(&descriptor(start, end, peak_offpeak()));
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].time_start, Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_rating_plan_activation_split() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let end = start + Duration::minutes(10);
        let mut cd = descriptor(start, end, peak_offpeak());
        cd.rating_infos.push(RatingInfo {
            activation_time: start + Duration::minutes(4),
            rating_plan_id: "RP_NEW".into(),
            rate_intervals: vec![interval(None, None, dec!(0), vec![rate(dec!(2), 1)])],
            ..Default::default()
        });

        let spans = split(&cd);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].rating_plan_id, "RP");
        assert_eq!(spans[1].rating_plan_id, "RP_NEW");
        assert_eq!(spans[1].time_start, start + Duration::minutes(4));
    }

    #[test]
    fn test_data_ignores_calendar() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 23, 50, 0).unwrap();
        let end = start + Duration::minutes(20);
        let mut cd = descriptor(start, end, peak_offpeak());
        cd.tariff_type = TariffType::Data;
        let spans = split(&cd);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].rate_interval.as_ref().unwrap().rating.rates[0].value, dec!(0.5));
    }

    #[test]
    fn test_tier_start_cuts_span() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let end = start + Duration::seconds(90);
        let tiers = vec![
            rate(dec!(1), 1),
            Rate {
                group_interval_start: Duration::seconds(60),
                value: dec!(0.5),
                rate_increment: Duration::seconds(1),
                rate_unit: Duration::seconds(60),
            },
        ];
        let spans = split(&descriptor(start, end, vec![interval(None, None, dec!(0), tiers)]));
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].duration(), Duration::seconds(60));
        assert_eq!(spans[1].group_start(), Duration::seconds(60));
    }

    #[test]
    fn test_zero_duration_single_span() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let spans = split(&descriptor(start, start, peak_offpeak()));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].duration(), Duration::zero());
        assert_eq!(spans[0].rating_plan_id, "RP");
        assert!(spans[0].increments.is_empty());
    }

    #[test]
    fn test_priority_policy_three_way() {
        let at = Utc.with_ymd_and_hms(2024, 12, 25, 12, 0, 0).unwrap();
        let weekday = RateInterval {
            timing: Timing {
                week_days: vec![Weekday::Wed],
                ..Default::default()
            },
            ..interval(None, None, dec!(10), vec![rate(dec!(1), 1)])
        };
        let lunch = interval(Some((11, 0)), Some((14, 0)), dec!(10), vec![rate(dec!(2), 1)]);
        let lunch_twin = interval(Some((11, 0)), Some((14, 0)), dec!(10), vec![rate(dec!(3), 1)]);
        let holiday = RateInterval {
            timing: Timing {
                months: vec![12],
                month_days: vec![25],
                ..Default::default()
            },
            ..interval(None, None, dec!(20), vec![rate(dec!(0), 1)])
        };

        // equal weight: most recent window start, then declaration order
        let candidates = vec![weekday.clone(), lunch.clone(), lunch_twin.clone()];
        assert_eq!(best_interval(&candidates, at), Some(&candidates[1]));

        // weight beats everything
        let candidates = vec![weekday, lunch, lunch_twin, holiday];
        assert_eq!(best_interval(&candidates, at), Some(&candidates[3]));
    }

    #[test]
    fn test_normalization_stretches_and_trims() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 17, 59, 30).unwrap();
        let end = start + Duration::minutes(2);
        let intervals = vec![
            interval(Some((8, 0)), Some((18, 0)), dec!(10), vec![rate(dec!(1), 60)]),
            interval(Some((18, 0)), None, dec!(10), vec![rate(dec!(0.5), 1)]),
        ];
        let cd = descriptor(start, end, intervals);
        let raw = split_spans(&cd);
        assert_eq!(raw.len(), 2);

        let spans = normalize(raw);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].duration(), Duration::seconds(60));
        assert_eq!(spans[1].time_start, spans[0].time_end);
        assert_eq!(spans[1].time_end, end);
        assert_eq!(spans[1].duration_index, Duration::minutes(2));

        assert_eq!(normalize(spans.clone()), spans);
    }

    #[test]
    fn test_normalization_swallows_short_followers() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 17, 59, 50).unwrap();
        let end = start + Duration::seconds(30);
        let intervals = vec![
            interval(Some((8, 0)), Some((18, 0)), dec!(10), vec![rate(dec!(1), 60)]),
            interval(Some((18, 0)), None, dec!(10), vec![rate(dec!(0.5), 1)]),
        ];
        let spans = split(&descriptor(start, end, intervals));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].duration(), Duration::seconds(60));
        assert_eq!(spans[0].duration_index, Duration::seconds(60));
    }

    proptest! {
        #[test]
        fn prop_split_is_contiguous(start_min in 0i64..(7 * 24 * 60), len_secs in 1i64..(36 * 3600)) {
            let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
            let start = base + Duration::minutes(start_min);
            let end = start + Duration::seconds(len_secs);
            let mut intervals = peak_offpeak();
            intervals.push(RateInterval {
                timing: Timing { week_days: vec![Weekday::Sat, Weekday::Sun], ..Default::default() },
                ..interval(None, None, dec!(20), vec![rate(dec!(0.2), 60)])
            });
            let spans = split_spans(&descriptor(start, end, intervals));

            assert_contiguous(&spans, start, end);
            prop_assert_eq!(spans.last().unwrap().duration_index, end - start);
            for ts in &spans {
                prop_assert!(ts.time_start < ts.time_end);
                prop_assert!(ts.rate_interval.is_some());
            }
        }

        #[test]
        fn prop_normalization_is_idempotent(start_sec in 0i64..(2 * 24 * 3600), len_secs in 1i64..(4 * 3600), inc in 1i64..120) {
            let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
            let start = base + Duration::seconds(start_sec);
            let end = start + Duration::seconds(len_secs);
            let intervals = vec![
                interval(Some((8, 0)), Some((18, 0)), dec!(10), vec![rate(dec!(1), inc)]),
                interval(Some((18, 0)), None, dec!(10), vec![rate(dec!(0.5), 1)]),
                interval(None, Some((8, 0)), dec!(10), vec![rate(dec!(0.5), 30)]),
            ];
            let once = split(&descriptor(start, end, intervals));
            let twice = normalize(once.clone());
            prop_assert_eq!(once, twice);
        }
    }
}
