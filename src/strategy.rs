// =============================================================================
// Strategy port — pluggable, pure signal producers + ranking
// =============================================================================
//
// Strategies are pure with respect to their inputs: bars, quote, instrument
// metadata, and the clock, all carried in `SignalContext`. They run CPU-only
// inside the scan tick and must not block on I/O.
//
// Built-in modules: opening-range breakout (orb) and EMA momentum
// (ema_momentum). The configured set is resolved by `build_strategies`.
// =============================================================================

use std::collections::BTreeMap;

use tracing::warn;

use crate::indicators::{atr, ema};
use crate::market_data::Bar;
use crate::types::{Instrument, MarketWindow, Quote, Side};

/// Everything a strategy may look at for one symbol.
pub struct SignalContext<'a> {
    pub instrument: &'a Instrument,
    /// 1-minute bars, oldest first, last element is the forming bar.
    pub bars: &'a [Bar],
    pub quote: Quote,
    pub window: MarketWindow,
    /// Unix millis of "now".
    pub now: i64,
    /// Unix millis of today's entry-window open.
    pub session_open_ms: i64,
}

/// A candidate trade produced by a strategy, before risk gating.
#[derive(Debug, Clone)]
pub struct SignalDraft {
    pub symbol: String,
    pub side: Side,
    pub strategy: &'static str,
    pub entry: f64,
    pub stop: f64,
    pub tp: f64,
    pub score: f64,
    pub features: BTreeMap<String, f64>,
    pub rationale: String,
}

/// A pluggable signal producer.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate_signals(&self, ctx: &SignalContext<'_>) -> Vec<SignalDraft>;
}

/// Resolve the configured strategy set; unknown names are skipped with a
/// warning rather than failing startup.
pub fn build_strategies(names: &[String]) -> Vec<Box<dyn Strategy>> {
    let mut out: Vec<Box<dyn Strategy>> = Vec::new();
    for name in names {
        match name.as_str() {
            "orb" => out.push(Box::new(OpeningRangeBreakout::default())),
            "ema_momentum" => out.push(Box::new(EmaMomentum::default())),
            other => warn!(strategy = other, "unknown strategy in config — skipped"),
        }
    }
    out
}

// =============================================================================
// Opening-range breakout
// =============================================================================

/// Breakout of the first N minutes' high/low, stop at the far side of the
/// range, target at a fixed multiple of the range risk.
pub struct OpeningRangeBreakout {
    pub range_minutes: usize,
    pub target_rr: f64,
}

impl Default for OpeningRangeBreakout {
    fn default() -> Self {
        Self { range_minutes: 15, target_rr: 1.5 }
    }
}

impl Strategy for OpeningRangeBreakout {
    fn name(&self) -> &'static str {
        "orb"
    }

    fn generate_signals(&self, ctx: &SignalContext<'_>) -> Vec<SignalDraft> {
        let range_end = ctx.session_open_ms + (self.range_minutes as i64) * 60_000;

        // The opening range must be fully formed and we must be past it.
        if ctx.now < range_end {
            return Vec::new();
        }
        let range_bars: Vec<&Bar> = ctx
            .bars
            .iter()
            .filter(|b| b.ts_open >= ctx.session_open_ms && b.ts_open < range_end)
            .collect();
        if range_bars.len() < self.range_minutes {
            return Vec::new();
        }

        let range_high = range_bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let range_low = range_bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let range_width = range_high - range_low;
        if range_width <= 0.0 {
            return Vec::new();
        }

        let last = ctx.quote.last;
        let mut features = BTreeMap::new();
        features.insert("range_high".to_string(), range_high);
        features.insert("range_low".to_string(), range_low);
        features.insert("range_width".to_string(), range_width);
        features.insert("last".to_string(), last);

        if last > range_high {
            let entry = ctx.quote.ask;
            let stop = range_low;
            let tp = entry + self.target_rr * (entry - stop);
            let score = ((last - range_high) / range_width).min(1.0);
            vec![SignalDraft {
                symbol: ctx.instrument.symbol.clone(),
                side: Side::Long,
                strategy: self.name(),
                entry,
                stop,
                tp,
                score,
                features,
                rationale: format!(
                    "close {last:.2} broke above opening range high {range_high:.2}"
                ),
            }]
        } else if last < range_low {
            let entry = ctx.quote.bid;
            let stop = range_high;
            let tp = entry - self.target_rr * (stop - entry);
            let score = ((range_low - last) / range_width).min(1.0);
            vec![SignalDraft {
                symbol: ctx.instrument.symbol.clone(),
                side: Side::Short,
                strategy: self.name(),
                entry,
                stop,
                tp,
                score,
                features,
                rationale: format!(
                    "close {last:.2} broke below opening range low {range_low:.2}"
                ),
            }]
        } else {
            Vec::new()
        }
    }
}

// =============================================================================
// EMA momentum
// =============================================================================

/// Fast-over-slow EMA alignment with ATR-sized stop and target.
pub struct EmaMomentum {
    pub fast: usize,
    pub slow: usize,
    pub atr_period: usize,
    pub stop_atr: f64,
    pub target_atr: f64,
}

impl Default for EmaMomentum {
    fn default() -> Self {
        Self { fast: 9, slow: 21, atr_period: 14, stop_atr: 1.5, target_atr: 2.5 }
    }
}

impl Strategy for EmaMomentum {
    fn name(&self) -> &'static str {
        "ema_momentum"
    }

    fn generate_signals(&self, ctx: &SignalContext<'_>) -> Vec<SignalDraft> {
        // Exclude the forming bar from indicator math.
        let closed = if ctx.bars.is_empty() { ctx.bars } else { &ctx.bars[..ctx.bars.len() - 1] };

        let (Some(fast), Some(slow), Some(atr_val)) = (
            ema(closed, self.fast),
            ema(closed, self.slow),
            atr(closed, self.atr_period),
        ) else {
            return Vec::new();
        };
        if atr_val <= 0.0 {
            return Vec::new();
        }

        let last = ctx.quote.last;
        let mut features = BTreeMap::new();
        features.insert(format!("ema_{}", self.fast), fast);
        features.insert(format!("ema_{}", self.slow), slow);
        features.insert(format!("atr_{}", self.atr_period), atr_val);
        features.insert("last".to_string(), last);

        let score = ((fast - slow).abs() / atr_val).min(1.0);

        if fast > slow && last > fast {
            let entry = ctx.quote.ask;
            vec![SignalDraft {
                symbol: ctx.instrument.symbol.clone(),
                side: Side::Long,
                strategy: self.name(),
                entry,
                stop: entry - self.stop_atr * atr_val,
                tp: entry + self.target_atr * atr_val,
                score,
                features,
                rationale: format!(
                    "ema{} {fast:.2} above ema{} {slow:.2} with price extended",
                    self.fast, self.slow
                ),
            }]
        } else if fast < slow && last < fast {
            let entry = ctx.quote.bid;
            vec![SignalDraft {
                symbol: ctx.instrument.symbol.clone(),
                side: Side::Short,
                strategy: self.name(),
                entry,
                stop: entry + self.stop_atr * atr_val,
                tp: entry - self.target_atr * atr_val,
                score,
                features,
                rationale: format!(
                    "ema{} {fast:.2} below ema{} {slow:.2} with price extended",
                    self.fast, self.slow
                ),
            }]
        } else {
            Vec::new()
        }
    }
}

// =============================================================================
// Ranking
// =============================================================================

/// Rank candidates score-descending, keep the best per symbol, cap the count.
///
/// The sort is stable so equal scores keep strategy order, which keeps the
/// whole pipeline deterministic for fixed inputs.
pub fn rank_signals(mut drafts: Vec<SignalDraft>, max: usize) -> Vec<SignalDraft> {
    drafts.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut seen = std::collections::HashSet::new();
    drafts.retain(|d| seen.insert(d.symbol.clone()));
    drafts.truncate(max);
    drafts
}
