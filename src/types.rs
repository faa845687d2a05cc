// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether the engine routes orders to the real broker or simulates fills.
///
/// The engine always starts in `Paper`; switching to `Live` requires the
/// typed confirmation phrase via the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Paper,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "PAPER"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

impl std::str::FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PAPER" => Ok(Self::Paper),
            "LIVE" => Ok(Self::Live),
            other => anyhow::bail!("invalid trading mode: '{other}' (use PAPER or LIVE)"),
        }
    }
}

/// Direction of a signal / position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Used in PnL arithmetic.
    pub fn direction(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// The side of the order that opens a position in this direction.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// The side of the order that closes a position in this direction.
    pub fn exit_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// BUY/SELL as sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    /// The opposite side (used when a STOP/TP closes what the ENTRY opened).
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of an order inside (or alongside) an OCO group.
///
/// `Exit` is the flatten/kill-switch market order; it lives outside the
/// entry/stop/tp triplet but shares the deterministic id scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderTag {
    Entry,
    Stop,
    Tp,
    Exit,
}

impl OrderTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Stop => "STOP",
            Self::Tp => "TP",
            Self::Exit => "EXIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENTRY" => Some(Self::Entry),
            "STOP" => Some(Self::Stop),
            "TP" => Some(Self::Tp),
            "EXIT" => Some(Self::Exit),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    /// Stop-loss limit.
    Sl,
    /// Stop-loss market.
    SlM,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::Sl => "SL",
            Self::SlM => "SL-M",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            "SL" => Some(Self::Sl),
            "SL-M" => Some(Self::SlM),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Placed,
    Partial,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Placed => "PLACED",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PLACED" => Some(Self::Placed),
            "PARTIAL" => Some(Self::Partial),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Terminal statuses never transition again; repeated terminal events for
    /// the same order are no-ops.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }

    /// Statuses that count as "live at the broker" for idempotent placement.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Placed | Self::Partial | Self::Filled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Opening,
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "OPENING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPENING" => Some(Self::Opening),
            "OPEN" => Some(Self::Open),
            "CLOSING" => Some(Self::Closing),
            "CLOSED" => Some(Self::Closed),
        _ => None,
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OCO group lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcoState {
    AwaitingEntry,
    Armed,
    ChildFilled,
    Canceled,
    Closed,
}

impl OcoState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingEntry => "AWAITING_ENTRY",
            Self::Armed => "ARMED",
            Self::ChildFilled => "CHILD_FILLED",
            Self::Canceled => "CANCELED",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AWAITING_ENTRY" => Some(Self::AwaitingEntry),
            "ARMED" => Some(Self::Armed),
            "CHILD_FILLED" => Some(Self::ChildFilled),
            "CANCELED" => Some(Self::Canceled),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OcoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session window classification in the trading timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketWindow {
    /// New entries allowed.
    Entry,
    /// Children may be placed/modified; no new parent entries.
    ExitOnly,
    /// Neither; EOD flatten runs at window open.
    Closed,
}

impl std::fmt::Display for MarketWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "ENTRY"),
            Self::ExitOnly => write!(f, "EXIT_ONLY"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Tradable instrument metadata, immutable for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub token: i64,
    pub tick_size: f64,
    pub lot_size: i64,
    /// Exchange-imposed maximum single-order size.
    pub freeze_qty: i64,
    pub lower_band: f64,
    pub upper_band: f64,
}

/// Best bid/ask + last trade for a symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    /// Unix millis of the source tick.
    pub ts: i64,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Relative spread `(ask - bid) / mid`; `f64::INFINITY` when unquotable.
    pub fn spread_over_mid(&self) -> f64 {
        let mid = self.mid();
        if mid > 0.0 {
            (self.ask - self.bid) / mid
        } else {
            f64::INFINITY
        }
    }
}

/// A single market data tick as published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub token: i64,
    pub symbol: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    /// Unix millis.
    pub ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_terminality() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Placed.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
    }

    #[test]
    fn order_status_liveness() {
        assert!(OrderStatus::Placed.is_live());
        assert!(OrderStatus::Partial.is_live());
        assert!(OrderStatus::Filled.is_live());
        assert!(!OrderStatus::New.is_live());
        assert!(!OrderStatus::Rejected.is_live());
    }

    #[test]
    fn enum_string_roundtrips() {
        for tag in [OrderTag::Entry, OrderTag::Stop, OrderTag::Tp, OrderTag::Exit] {
            assert_eq!(OrderTag::parse(tag.as_str()), Some(tag));
        }
        for st in [
            OrderStatus::New,
            OrderStatus::Placed,
            OrderStatus::Partial,
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
        ] {
            assert_eq!(OrderStatus::parse(st.as_str()), Some(st));
        }
        for s in [OcoState::AwaitingEntry, OcoState::Armed, OcoState::ChildFilled, OcoState::Canceled, OcoState::Closed] {
            assert_eq!(OcoState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn side_arithmetic() {
        assert_eq!(Side::Long.direction(), 1.0);
        assert_eq!(Side::Short.direction(), -1.0);
        assert_eq!(Side::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(Side::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.entry_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_order_side(), OrderSide::Buy);
    }

    #[test]
    fn quote_spread() {
        let q = Quote { last: 100.0, bid: 99.9, ask: 100.1, ts: 0 };
        assert!((q.mid() - 100.0).abs() < 1e-9);
        assert!((q.spread_over_mid() - 0.002).abs() < 1e-9);
    }

    #[test]
    fn trading_mode_parse() {
        assert_eq!("paper".parse::<TradingMode>().unwrap(), TradingMode::Paper);
        assert_eq!("LIVE".parse::<TradingMode>().unwrap(), TradingMode::Live);
        assert!("demo".parse::<TradingMode>().is_err());
    }
}
