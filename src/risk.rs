// =============================================================================
// RiskEngine — ordered entry gates and deterministic position sizing
// =============================================================================
//
// `can_enter` is stateless per call: every input it judges arrives as an
// argument, so for fixed inputs the verdict and quantity are identical. The
// gates run in a fixed order and the first failure short-circuits with a
// machine-readable rejection; the orchestrator persists the corresponding
// risk event and, for a daily-loss breach, auto-pauses.
//
// Gate order:
//   1. market hours        5. daily loss stop (strict)
//   2. paused/kill-switch  6. freeze quantity
//   3. per-trade risk cap  7. price band (tick-clamped)
//   4. portfolio heat cap  8. spread quality
// =============================================================================

use serde::Serialize;

use crate::config::Config;
use crate::store::models::RiskEventType;
use crate::types::{Instrument, MarketWindow, Quote, Side};

/// Snapshot of coordinator state the gates judge against.
#[derive(Debug, Clone, Copy)]
pub struct PortfolioView {
    pub window: MarketWindow,
    pub paused: bool,
    /// Aggregate open risk in rupees.
    pub portfolio_heat: f64,
    /// Realised PnL for the session in rupees.
    pub daily_realized_pnl: f64,
}

/// An approved, sized, tick-clamped plan.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SizedPlan {
    pub qty: i64,
    pub entry: f64,
    pub stop: f64,
    pub tp: f64,
    pub risk_amount: f64,
    pub risk_pct: f64,
    pub heat_before: f64,
    pub heat_after: f64,
}

/// A gate rejection: which gate fired and why.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub event_type: RiskEventType,
    pub details: String,
}

impl Rejection {
    fn new(event_type: RiskEventType, details: impl Into<String>) -> Self {
        Self { event_type, details: details.into() }
    }
}

/// Entry gate configuration, fixed for the session.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    capital: f64,
    per_trade_risk_pct: f64,
    max_portfolio_heat_pct: f64,
    daily_loss_stop_pct: f64,
    max_spread_mid_pct: f64,
}

impl RiskEngine {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capital: config.capital,
            per_trade_risk_pct: config.per_trade_risk_pct,
            max_portfolio_heat_pct: config.max_portfolio_heat_pct,
            daily_loss_stop_pct: config.daily_loss_stop_pct,
            max_spread_mid_pct: config.max_spread_mid_pct,
        }
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn daily_loss_limit(&self) -> f64 {
        self.daily_loss_stop_pct / 100.0 * self.capital
    }

    /// Run the gate ladder for a candidate entry.
    #[allow(clippy::too_many_arguments)]
    pub fn can_enter(
        &self,
        instrument: &Instrument,
        side: Side,
        entry: f64,
        stop: f64,
        tp: f64,
        quote: Quote,
        view: PortfolioView,
    ) -> Result<SizedPlan, Rejection> {
        // Bands that never intersect a real price mean instrument metadata is
        // stale or the symbol is frozen for the session.
        if instrument.upper_band <= instrument.lower_band || instrument.tick_size <= 0.0 {
            return Err(Rejection::new(
                RiskEventType::FreezeBand,
                format!("instrument {} has unusable bands/tick metadata", instrument.symbol),
            ));
        }

        // 1. Market hours.
        if view.window != MarketWindow::Entry {
            return Err(Rejection::new(
                RiskEventType::MarketClosed,
                format!("entries not allowed in {} window", view.window),
            ));
        }

        // 2. Paused / kill switch.
        if view.paused {
            return Err(Rejection::new(
                RiskEventType::TradingPaused,
                "orchestrator is paused",
            ));
        }

        // 3. Per-trade risk cap (sizing happens here).
        let entry = round_to_tick(entry, instrument.tick_size);
        let stop = round_to_tick(stop, instrument.tick_size);
        let tp = round_to_tick(tp, instrument.tick_size);

        let stop_distance = (entry - stop).abs();
        if stop_distance <= 0.0 {
            return Err(Rejection::new(
                RiskEventType::TradeRiskCap,
                "stop distance is zero after tick clamping",
            ));
        }
        // Stops must protect, not invert.
        let stop_side_ok = match side {
            Side::Long => stop < entry && tp > entry,
            Side::Short => stop > entry && tp < entry,
        };
        if !stop_side_ok {
            return Err(Rejection::new(
                RiskEventType::TradeRiskCap,
                format!("stop/tp not on the protective side for {side}"),
            ));
        }

        let risk_budget = self.per_trade_risk_pct / 100.0 * self.capital;
        let qty_raw = (risk_budget / stop_distance).floor() as i64;
        let qty = (qty_raw / instrument.lot_size) * instrument.lot_size;
        if qty <= 0 {
            return Err(Rejection::new(
                RiskEventType::ZeroQty,
                format!(
                    "risk budget {:.2} sizes to zero lots at stop distance {:.2}",
                    risk_budget, stop_distance
                ),
            ));
        }

        let risk_amount = qty as f64 * stop_distance;
        if risk_amount > risk_budget {
            return Err(Rejection::new(
                RiskEventType::TradeRiskCap,
                format!("risk {risk_amount:.2} exceeds per-trade budget {risk_budget:.2}"),
            ));
        }

        // 4. Portfolio heat cap.
        let heat_cap = self.max_portfolio_heat_pct / 100.0 * self.capital;
        let heat_after = view.portfolio_heat + risk_amount;
        if heat_after > heat_cap {
            return Err(Rejection::new(
                RiskEventType::HeatCap,
                format!(
                    "heat {:.2} + new risk {:.2} exceeds cap {:.2}",
                    view.portfolio_heat, risk_amount, heat_cap
                ),
            ));
        }

        // 5. Daily loss stop (strict inequality: at the limit is a breach).
        if view.daily_realized_pnl <= -self.daily_loss_limit() {
            return Err(Rejection::new(
                RiskEventType::DailyLossStop,
                format!(
                    "daily pnl {:.2} breaches loss stop {:.2}",
                    view.daily_realized_pnl,
                    -self.daily_loss_limit()
                ),
            ));
        }

        // 6. Freeze quantity.
        if qty > instrument.freeze_qty {
            return Err(Rejection::new(
                RiskEventType::FreezeQty,
                format!("qty {qty} exceeds freeze qty {}", instrument.freeze_qty),
            ));
        }

        // 7. Price band.
        if entry < instrument.lower_band || entry > instrument.upper_band {
            return Err(Rejection::new(
                RiskEventType::PriceBand,
                format!(
                    "entry {entry:.2} outside band [{:.2}, {:.2}]",
                    instrument.lower_band, instrument.upper_band
                ),
            ));
        }

        // 8. Spread quality.
        let spread_pct = quote.spread_over_mid() * 100.0;
        if spread_pct > self.max_spread_mid_pct {
            return Err(Rejection::new(
                RiskEventType::SpreadBlowout,
                format!(
                    "spread {spread_pct:.3}% of mid exceeds {:.3}%",
                    self.max_spread_mid_pct
                ),
            ));
        }

        Ok(SizedPlan {
            qty,
            entry,
            stop,
            tp,
            risk_amount,
            risk_pct: self.per_trade_risk_pct,
            heat_before: view.portfolio_heat,
            heat_after,
        })
    }
}

/// Clamp a price to the instrument tick grid.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    (price / tick).round() * tick
}
