//! Sanitizing aggregator: the single admission path for every candle that
//! reaches a series, live or historical.
//!
//! `validate -> align -> aggregate by bucket -> sort -> clamp`. The reducer is
//! idempotent, so re-running it over a series it already produced is a no-op.

use crate::market::types::Candle;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub invalid: usize,
    pub misaligned: usize,
    pub merged: usize,
    pub clamped: usize,
}

impl SanitizeReport {
    /// Candles excluded for bad data, as opposed to merging or window clamping.
    pub fn rejected(&self) -> usize {
        self.invalid + self.misaligned
    }
}

pub fn sanitize(candles: &[Candle], interval_seconds: i64, max_len: usize) -> Vec<Candle> {
    sanitize_with_report(candles, interval_seconds, max_len).0
}

pub fn sanitize_with_report(
    candles: &[Candle],
    interval_seconds: i64,
    max_len: usize,
) -> (Vec<Candle>, SanitizeReport) {
    let mut report = SanitizeReport::default();
    let mut buckets: BTreeMap<i64, Candle> = BTreeMap::new();

    for candle in candles {
        if !candle.is_valid() {
            report.invalid += 1;
            continue;
        }
        if interval_seconds > 1 && candle.time.rem_euclid(interval_seconds) != 0 {
            report.misaligned += 1;
            continue;
        }

        match buckets.entry(candle.time) {
            Entry::Vacant(slot) => {
                slot.insert(candle.clone());
            }
            Entry::Occupied(mut slot) => {
                report.merged += 1;
                merge_into(slot.get_mut(), candle);
            }
        }
    }

    let mut series = buckets.into_values().collect::<Vec<_>>();
    if series.len() > max_len {
        report.clamped = series.len() - max_len;
        series.drain(..report.clamped);
    }
    (series, report)
}

/// First open, max high, min low, last close.
fn merge_into(existing: &mut Candle, later: &Candle) {
    existing.high = existing.high.max(later.high);
    existing.low = existing.low.min(later.low);
    existing.close = later.close;
    if later.volume.is_some() {
        existing.volume = later.volume;
    }
    if existing.symbol.is_none() {
        existing.symbol = later.symbol.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(time: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(time, open, high, low, close)
    }

    fn pseudo_random_series(len: usize, seed: u64) -> Vec<Candle> {
        let mut state = seed;
        let mut next = move || {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            state >> 33
        };

        (0..len)
            .map(|_| {
                let time = (next() % 40) as i64 * 30;
                let base = (next() % 1_000) as f64 / 10.0 + 1.0;
                let spread = (next() % 50) as f64 / 10.0;
                let mut item = candle(time, base, base + spread, base - spread / 2.0, base + 0.1);
                if next() % 11 == 0 {
                    item.open = f64::NAN;
                }
                if next() % 13 == 0 {
                    std::mem::swap(&mut item.high, &mut item.low);
                }
                item
            })
            .collect()
    }

    #[test]
    fn merges_same_bucket_first_open_max_high_min_low_last_close() {
        let input = vec![
            candle(60, 10.0, 12.0, 9.0, 11.0),
            candle(60, 100.0, 101.0, 99.0, 100.0),
        ];
        let output = sanitize(&input, 60, 1_000);
        assert_eq!(output, vec![candle(60, 10.0, 101.0, 9.0, 100.0)]);
    }

    #[test]
    fn drops_misaligned_candles() {
        let input = vec![candle(60, 1.0, 2.0, 0.5, 1.5), candle(61, 1.0, 2.0, 0.5, 1.5)];
        let (output, report) = sanitize_with_report(&input, 60, 1_000);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].time, 60);
        assert_eq!(report.misaligned, 1);
    }

    #[test]
    fn skips_alignment_for_unit_intervals() {
        let input = vec![candle(61, 1.0, 2.0, 0.5, 1.5), candle(7, 1.0, 2.0, 0.5, 1.5)];
        let output = sanitize(&input, 1, 1_000);
        assert_eq!(output.iter().map(|c| c.time).collect::<Vec<_>>(), vec![7, 61]);
    }

    #[test]
    fn drops_invalid_candles() {
        let input = vec![
            candle(60, f64::NAN, 2.0, 0.5, 1.5),
            candle(120, 1.0, 0.5, 2.0, 1.5),
            candle(180, 1.0, f64::INFINITY, 0.5, 1.5),
            candle(240, 1.0, 2.0, 0.5, 1.5),
        ];
        let (output, report) = sanitize_with_report(&input, 60, 1_000);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].time, 240);
        assert_eq!(report.invalid, 3);
        assert_eq!(report.rejected(), 3);
    }

    #[test]
    fn empty_and_all_invalid_inputs_produce_empty_series() {
        assert!(sanitize(&[], 60, 1_000).is_empty());
        assert!(sanitize(&[candle(60, f64::NAN, 1.0, 1.0, 1.0)], 60, 1_000).is_empty());
    }

    #[test]
    fn clamps_to_most_recent_buckets() {
        let input = (0..1_500_i64)
            .map(|index| candle(index * 60, 1.0, 2.0, 0.5, 1.5))
            .collect::<Vec<_>>();
        let (output, report) = sanitize_with_report(&input, 60, 1_000);

        assert_eq!(output.len(), 1_000);
        assert_eq!(report.clamped, 500);
        assert_eq!(output.first().map(|c| c.time), Some(500 * 60));
        assert_eq!(output.last().map(|c| c.time), Some(1_499 * 60));
    }

    #[test]
    fn sorts_out_of_order_input() {
        let input = vec![
            candle(180, 3.0, 3.0, 3.0, 3.0),
            candle(60, 1.0, 1.0, 1.0, 1.0),
            candle(120, 2.0, 2.0, 2.0, 2.0),
        ];
        let output = sanitize(&input, 60, 1_000);
        assert_eq!(
            output.iter().map(|c| c.time).collect::<Vec<_>>(),
            vec![60, 120, 180]
        );
    }

    #[test]
    fn aggregation_is_idempotent_and_output_is_strictly_ascending() {
        for seed in 1..=25_u64 {
            for (interval, max_len) in [(30_i64, 1_000_usize), (60, 8), (1, 15), (0, 3)] {
                let input = pseudo_random_series(200, seed);
                let once = sanitize(&input, interval, max_len);
                let twice = sanitize(&once, interval, max_len);
                assert_eq!(once, twice, "seed {seed} interval {interval}");

                assert!(once.len() <= max_len);
                assert!(once.windows(2).all(|pair| pair[0].time < pair[1].time));
                assert!(once.iter().all(Candle::is_valid));
                if interval > 1 {
                    assert!(once.iter().all(|c| c.time % interval == 0));
                }
            }
        }
    }

    #[test]
    fn keeps_latest_volume_and_first_symbol() {
        let input = vec![
            candle(60, 1.0, 2.0, 0.5, 1.5).with_volume(3.0).with_symbol("BTCUSDT"),
            candle(60, 1.0, 2.0, 0.5, 1.5),
            candle(60, 1.0, 2.0, 0.5, 1.6).with_volume(5.0),
        ];
        let output = sanitize(&input, 60, 1_000);
        assert_eq!(output[0].volume, Some(5.0));
        assert_eq!(output[0].symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(output[0].close, 1.6);
    }

    #[test]
    fn late_data_outside_the_window_is_lost() {
        let window = (10..20_i64)
            .map(|index| candle(index * 60, 1.0, 1.0, 1.0, 1.0))
            .collect::<Vec<_>>();
        let mut accumulated = sanitize(&window, 60, 10);
        accumulated.push(candle(0, 5.0, 5.0, 5.0, 5.0));

        let output = sanitize(&accumulated, 60, 10);
        assert_eq!(output.len(), 10);
        assert!(output.iter().all(|c| c.time != 0));
    }
}
