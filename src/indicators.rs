// =============================================================================
// Indicators — EMA and ATR over 1-minute bars
// =============================================================================
//
// Just enough indicator machinery for the built-in strategies. Both are
// computed from bar slices on demand; strategies are pure functions of their
// inputs, so there is no incremental state to carry between scans.
// =============================================================================

use crate::market_data::Bar;

/// Exponential moving average of bar closes over `period`.
///
/// Returns `None` until at least `period` bars are available. The first EMA
/// value is seeded with the SMA of the first `period` closes.
pub fn ema(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = bars[..period].iter().map(|b| b.close).sum::<f64>() / period as f64;

    let mut value = seed;
    for bar in &bars[period..] {
        value = (bar.close - value) * k + value;
    }
    Some(value)
}

/// Average true range over `period`, using Wilder's smoothing.
///
/// Returns `None` until `period + 1` bars are available (the first true range
/// needs a previous close).
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut trs = Vec::with_capacity(bars.len() - 1);
    for w in bars.windows(2) {
        let (prev, cur) = (w[0], w[1]);
        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        trs.push(tr);
    }

    let mut value: f64 = trs[..period].iter().sum::<f64>() / period as f64;
    for tr in &trs[period..] {
        value = (value * (period as f64 - 1.0) + tr) / period as f64;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> Bar {
        Bar { ts_open: 0, open: close, high: close + 1.0, low: close - 1.0, close, ticks: 1 }
    }

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes.iter().copied().map(bar).collect()
    }

    #[test]
    fn ema_needs_enough_bars() {
        assert!(ema(&bars(&[1.0, 2.0]), 3).is_none());
        assert!(ema(&bars(&[1.0, 2.0, 3.0]), 3).is_some());
        assert!(ema(&bars(&[1.0]), 0).is_none());
    }

    #[test]
    fn ema_of_constant_series_is_constant() {
        let v = ema(&bars(&[5.0; 20]), 9).unwrap();
        assert!((v - 5.0).abs() < 1e-9);
    }

    #[test]
    fn ema_tracks_rising_series_below_last() {
        let closes: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let v = ema(&bars(&closes), 9).unwrap();
        assert!(v < 30.0);
        assert!(v > 20.0);
    }

    #[test]
    fn atr_needs_period_plus_one() {
        assert!(atr(&bars(&[1.0; 14]), 14).is_none());
        assert!(atr(&bars(&[1.0; 15]), 14).is_some());
    }

    #[test]
    fn atr_of_flat_bars_is_the_bar_range() {
        // Every bar has high-low = 2 and no gaps, so ATR converges to 2.
        let v = atr(&bars(&[10.0; 20]), 14).unwrap();
        assert!((v - 2.0).abs() < 1e-9);
    }
}
