use crate::market::types::Candle;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinePoint {
    pub time: i64,
    pub value: f64,
}

/// Simple moving average of closes, one point per candle from index `period - 1`.
pub fn sma(series: &[Candle], period: usize) -> Vec<LinePoint> {
    if period == 0 || series.len() < period {
        return Vec::new();
    }

    let mut points = Vec::with_capacity(series.len() + 1 - period);
    let mut window_sum = series[..period].iter().map(|c| c.close).sum::<f64>();
    points.push(LinePoint {
        time: series[period - 1].time,
        value: window_sum / period as f64,
    });
    for index in period..series.len() {
        window_sum += series[index].close - series[index - period].close;
        points.push(LinePoint {
            time: series[index].time,
            value: window_sum / period as f64,
        });
    }
    points
}

/// Exponential moving average seeded with the SMA of the first `period` closes.
pub fn ema(series: &[Candle], period: usize) -> Vec<LinePoint> {
    if period == 0 || series.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut value = series[..period].iter().map(|c| c.close).sum::<f64>() / period as f64;
    let mut points = Vec::with_capacity(series.len() + 1 - period);
    points.push(LinePoint {
        time: series[period - 1].time,
        value,
    });
    for candle in &series[period..] {
        value = (candle.close - value) * multiplier + value;
        points.push(LinePoint {
            time: candle.time,
            value,
        });
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closes(values: &[f64]) -> Vec<Candle> {
        values
            .iter()
            .enumerate()
            .map(|(index, close)| Candle::new(index as i64 * 60, *close, *close, *close, *close))
            .collect()
    }

    #[test]
    fn sma_slides_over_closes() {
        let points = sma(&closes(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3);
        assert_eq!(
            points,
            vec![
                LinePoint { time: 120, value: 2.0 },
                LinePoint { time: 180, value: 3.0 },
                LinePoint { time: 240, value: 4.0 },
            ]
        );
    }

    #[test]
    fn ema_seeds_with_sma() {
        let points = ema(&closes(&[2.0, 4.0, 6.0, 8.0]), 3);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], LinePoint { time: 120, value: 4.0 });
        assert!((points[1].value - 6.0).abs() < 1e-12);
    }

    #[test]
    fn short_series_or_zero_period_yield_nothing() {
        assert!(sma(&closes(&[1.0, 2.0]), 3).is_empty());
        assert!(ema(&closes(&[1.0, 2.0]), 0).is_empty());
        assert!(sma(&[], 1).is_empty());
    }
}
