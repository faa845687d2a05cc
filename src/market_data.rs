// =============================================================================
// MarketDataStream — tick ingest, heartbeat, reconnect, 1-minute bars
// =============================================================================
//
// Live mode connects to the broker's market data WebSocket; PAPER mode runs a
// synthetic random-walk feed through the exact same hub so every consumer
// (strategies, risk gates, readiness) behaves identically in both modes.
//
// The hub owns the last-quote table and 1-minute bar aggregation. Every tick
// refreshes the market data heartbeat; readiness turns on its age.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::paper::PaperBroker;
use crate::bus::{BusEvent, EventBus};
use crate::types::{Instrument, Quote, Tick};

/// Bars retained per symbol.
const BAR_CAPACITY: usize = 500;

const BAR_INTERVAL_MS: i64 = 60_000;

/// One aggregated 1-minute bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    /// Unix millis of the bar's open, aligned to the minute.
    pub ts_open: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub ticks: u64,
}

/// Shared market data state: quotes, bars, and the feed heartbeat.
pub struct MarketDataHub {
    quotes: RwLock<HashMap<String, Quote>>,
    closed_bars: RwLock<HashMap<String, VecDeque<Bar>>>,
    forming: RwLock<HashMap<String, Bar>>,
    heartbeat: RwLock<Instant>,
    bus: EventBus,
}

impl MarketDataHub {
    pub fn new(bus: EventBus) -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            closed_bars: RwLock::new(HashMap::new()),
            forming: RwLock::new(HashMap::new()),
            heartbeat: RwLock::new(Instant::now()),
            bus,
        }
    }

    /// Ingest one tick: quote table, bar aggregation, heartbeat, bus.
    pub fn apply_tick(&self, tick: Tick) {
        self.quotes.write().insert(
            tick.symbol.clone(),
            Quote { last: tick.last, bid: tick.bid, ask: tick.ask, ts: tick.ts },
        );

        self.roll_bar(&tick.symbol, tick.last, tick.ts);

        *self.heartbeat.write() = Instant::now();
        crate::metrics::beat_marketdata_heartbeat();

        self.bus.publish(BusEvent::Tick(tick));
    }

    fn roll_bar(&self, symbol: &str, price: f64, ts: i64) {
        let bar_open = ts - ts.rem_euclid(BAR_INTERVAL_MS);
        let mut forming = self.forming.write();

        match forming.get_mut(symbol) {
            Some(bar) if bar.ts_open == bar_open => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                bar.ticks += 1;
            }
            Some(bar) => {
                // Minute rolled: close out the forming bar.
                let closed = *bar;
                *bar = Bar { ts_open: bar_open, open: price, high: price, low: price, close: price, ticks: 1 };
                drop(forming);

                let mut all = self.closed_bars.write();
                let series = all.entry(symbol.to_string()).or_default();
                series.push_back(closed);
                while series.len() > BAR_CAPACITY {
                    series.pop_front();
                }
            }
            None => {
                forming.insert(
                    symbol.to_string(),
                    Bar { ts_open: bar_open, open: price, high: price, low: price, close: price, ticks: 1 },
                );
            }
        }
    }

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.quotes.read().get(symbol).copied()
    }

    /// The most recent `n` closed bars (oldest first), plus the forming bar.
    pub fn bars(&self, symbol: &str, n: usize) -> Vec<Bar> {
        let mut out: Vec<Bar> = self
            .closed_bars
            .read()
            .get(symbol)
            .map(|series| series.iter().rev().take(n).rev().copied().collect())
            .unwrap_or_default();
        if let Some(forming) = self.forming.read().get(symbol) {
            out.push(*forming);
        }
        out
    }

    /// Seconds since the last tick was ingested.
    pub fn heartbeat_age_secs(&self) -> f64 {
        self.heartbeat.read().elapsed().as_secs_f64()
    }
}

// =============================================================================
// Live WebSocket feed
// =============================================================================

/// Connect to the broker market data WebSocket and feed ticks into the hub.
///
/// Runs until the stream disconnects or errors, then returns so the caller's
/// reconnect loop can restart it (5 s pause, same as every other stream).
pub async fn run_market_stream(url: &str, tokens: &[i64], hub: &Arc<MarketDataHub>) -> Result<()> {
    info!(url = %url, tokens = tokens.len(), "connecting to market data WebSocket");

    let (ws, _resp) = tokio_tungstenite::connect_async(url)
        .await
        .context("failed to connect to market data WebSocket")?;
    info!("market data WebSocket connected");

    let (mut write, mut read) = ws.split();

    // Subscribe to the configured instrument tokens.
    let sub = serde_json::json!({ "action": "subscribe", "tokens": tokens });
    futures_util::SinkExt::send(
        &mut write,
        tokio_tungstenite::tungstenite::Message::Text(sub.to_string()),
    )
    .await
    .context("failed to send subscribe frame")?;

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_tick(&text) {
                        Ok(Some(tick)) => hub.apply_tick(tick),
                        Ok(None) => {
                            // Heartbeat frame: still refreshes feed liveness.
                            *hub.heartbeat.write() = Instant::now();
                            crate::metrics::beat_marketdata_heartbeat();
                        }
                        Err(e) => warn!(error = %e, "failed to parse tick frame"),
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "market data WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("market data WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse one market data frame. Heartbeats yield `None`.
fn parse_tick(text: &str) -> Result<Option<Tick>> {
    let root: serde_json::Value = serde_json::from_str(text).context("tick frame is not JSON")?;
    if root["type"].as_str() == Some("heartbeat") {
        return Ok(None);
    }

    let last = root["last"].as_f64().context("tick missing last")?;
    Ok(Some(Tick {
        token: root["token"].as_i64().unwrap_or(0),
        symbol: root["symbol"].as_str().unwrap_or_default().to_string(),
        last,
        bid: root["bid"].as_f64().unwrap_or(last),
        ask: root["ask"].as_f64().unwrap_or(last),
        ts: root["ts"].as_i64().unwrap_or(0),
    }))
}

// =============================================================================
// Synthetic paper feed
// =============================================================================

/// Drive a random-walk feed through the paper broker and the hub.
///
/// Prices are seeded at the midpoint of each instrument's price band and step
/// a few basis points per tick, which is enough motion for strategies and
/// exit triggers to fire in PAPER mode.
pub async fn run_synthetic_feed(
    instruments: Vec<Instrument>,
    broker: Arc<PaperBroker>,
    hub: Arc<MarketDataHub>,
    interval: std::time::Duration,
) {
    let mut prices: HashMap<String, f64> = instruments
        .iter()
        .map(|i| (i.symbol.clone(), (i.lower_band + i.upper_band) / 2.0))
        .collect();
    let tokens: HashMap<String, i64> =
        instruments.iter().map(|i| (i.symbol.clone(), i.token)).collect();

    info!(symbols = prices.len(), "synthetic market data feed running");
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        for (symbol, price) in prices.iter_mut() {
            let step: f64 = rand::thread_rng().gen_range(-5.0..5.0) / 10_000.0;
            *price *= 1.0 + step;

            broker.on_tick(symbol, *price);
            hub.apply_tick(Tick {
                token: tokens.get(symbol).copied().unwrap_or(0),
                symbol: symbol.clone(),
                last: *price,
                bid: *price * 0.9998,
                ask: *price * 1.0002,
                ts: chrono::Utc::now().timestamp_millis(),
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, last: f64, ts: i64) -> Tick {
        Tick {
            token: 1,
            symbol: symbol.to_string(),
            last,
            bid: last - 0.1,
            ask: last + 0.1,
            ts,
        }
    }

    #[test]
    fn quotes_follow_ticks() {
        let hub = MarketDataHub::new(EventBus::default());
        hub.apply_tick(tick("NIFTY", 21480.0, 1_000));
        let q = hub.quote("NIFTY").unwrap();
        assert_eq!(q.last, 21480.0);
        assert!(hub.quote("BANKNIFTY").is_none());
    }

    #[test]
    fn bars_aggregate_within_a_minute() {
        let hub = MarketDataHub::new(EventBus::default());
        hub.apply_tick(tick("NIFTY", 100.0, 0));
        hub.apply_tick(tick("NIFTY", 105.0, 10_000));
        hub.apply_tick(tick("NIFTY", 95.0, 20_000));
        hub.apply_tick(tick("NIFTY", 102.0, 30_000));

        let bars = hub.bars("NIFTY", 10);
        assert_eq!(bars.len(), 1); // forming bar only
        let bar = bars[0];
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.low, 95.0);
        assert_eq!(bar.close, 102.0);
        assert_eq!(bar.ticks, 4);
    }

    #[test]
    fn bars_roll_on_minute_boundary() {
        let hub = MarketDataHub::new(EventBus::default());
        hub.apply_tick(tick("NIFTY", 100.0, 0));
        hub.apply_tick(tick("NIFTY", 101.0, 59_999));
        hub.apply_tick(tick("NIFTY", 102.0, 60_000));

        let bars = hub.bars("NIFTY", 10);
        assert_eq!(bars.len(), 2); // one closed + forming
        assert_eq!(bars[0].close, 101.0);
        assert_eq!(bars[1].open, 102.0);
    }

    #[test]
    fn heartbeat_resets_on_tick() {
        let hub = MarketDataHub::new(EventBus::default());
        hub.apply_tick(tick("NIFTY", 100.0, 0));
        assert!(hub.heartbeat_age_secs() < 1.0);
    }

    #[test]
    fn tick_parsing() {
        let t = parse_tick(r#"{"token":256265,"symbol":"NIFTY","last":21480.5,"bid":21480.0,"ask":21481.0,"ts":99}"#)
            .unwrap()
            .unwrap();
        assert_eq!(t.symbol, "NIFTY");
        assert_eq!(t.last, 21480.5);

        assert!(parse_tick(r#"{"type":"heartbeat"}"#).unwrap().is_none());
        assert!(parse_tick("not json").is_err());
    }
}
