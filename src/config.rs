// =============================================================================
// Configuration — immutable snapshot with content hash
// =============================================================================
//
// The engine loads configuration exactly once at startup: an optional JSON
// file merged with environment overrides. The resulting value is never
// mutated at runtime (LIVE mode in particular forbids it); operational state
// such as pause/mode lives on the coordinator, not here.
//
// `config_sha` is a content hash of the canonical JSON form, stamped onto
// every Decision and AuditLog row for forensic reproducibility.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::types::Instrument;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_timezone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_capital() -> f64 {
    1_000_000.0
}

fn default_per_trade_risk_pct() -> f64 {
    0.5
}

fn default_max_portfolio_heat_pct() -> f64 {
    2.0
}

fn default_daily_loss_stop_pct() -> f64 {
    2.0
}

fn default_max_spread_mid_pct() -> f64 {
    0.25
}

fn default_scan_interval_secs() -> u64 {
    5
}

fn default_heartbeat_stale_secs() -> u64 {
    5
}

fn default_lease_secs() -> u64 {
    30
}

fn default_flatten_bound_ms() -> u64 {
    2_000
}

fn default_max_entries_per_scan() -> usize {
    3
}

fn default_fee_bps() -> f64 {
    3.0
}

fn default_entry_open() -> String {
    "09:15".to_string()
}

fn default_entry_close() -> String {
    "15:20".to_string()
}

fn default_session_close() -> String {
    "15:25".to_string()
}

fn default_sqlite_path() -> String {
    "meridian.db".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_leader_key() -> String {
    "meridian:leader".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_strategies() -> Vec<String> {
    vec!["orb".to_string(), "ema_momentum".to_string()]
}

fn default_instruments() -> Vec<Instrument> {
    vec![
        Instrument {
            symbol: "NIFTY".to_string(),
            token: 256265,
            tick_size: 0.05,
            lot_size: 50,
            freeze_qty: 1800,
            lower_band: 19_350.0,
            upper_band: 23_650.0,
        },
        Instrument {
            symbol: "BANKNIFTY".to_string(),
            token: 260105,
            tick_size: 0.05,
            lot_size: 15,
            freeze_qty: 900,
            lower_band: 40_500.0,
            upper_band: 49_500.0,
        },
    ]
}

// =============================================================================
// Broker connection settings
// =============================================================================

/// Credentials and endpoints for the live broker gateway.
///
/// The secret is used exclusively for HMAC request signing and is never
/// logged or serialised into snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub order_stream_url: String,
    #[serde(default)]
    pub market_data_url: String,
}

// =============================================================================
// Config
// =============================================================================

/// Immutable engine configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // --- Trading session --------------------------------------------------

    /// Trading timezone; all session windows are evaluated here regardless
    /// of the host timezone.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Entry window open, "HH:MM" in the trading timezone.
    #[serde(default = "default_entry_open")]
    pub entry_open: String,

    /// Entry window close / exit-only window open.
    #[serde(default = "default_entry_close")]
    pub entry_close: String,

    /// Exit-only window close; EOD flatten runs here.
    #[serde(default = "default_session_close")]
    pub session_close: String,

    /// Session holidays as "YYYY-MM-DD" dates (weekends are always closed).
    #[serde(default)]
    pub holidays: Vec<String>,

    // --- Capital & risk ---------------------------------------------------

    /// Session capital in rupees.
    #[serde(default = "default_capital")]
    pub capital: f64,

    /// Per-trade risk cap as percent of capital (0.5 = 0.5%).
    #[serde(default = "default_per_trade_risk_pct")]
    pub per_trade_risk_pct: f64,

    /// Portfolio heat cap as percent of capital.
    #[serde(default = "default_max_portfolio_heat_pct")]
    pub max_portfolio_heat_pct: f64,

    /// Daily loss stop as percent of capital; breach auto-pauses the engine.
    #[serde(default = "default_daily_loss_stop_pct")]
    pub daily_loss_stop_pct: f64,

    /// Maximum acceptable `(ask - bid) / mid` as percent.
    #[serde(default = "default_max_spread_mid_pct")]
    pub max_spread_mid_pct: f64,

    /// Flat round-trip fee model in basis points (net PnL = gross - fees).
    #[serde(default = "default_fee_bps")]
    pub fee_bps: f64,

    // --- Cadence & bounds -------------------------------------------------

    /// Scan pipeline tick interval in seconds.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Heartbeats older than this are considered stale for readiness.
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,

    /// Leader lease TTL in seconds; refresh runs every third of this.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Hard wall-time bound on the flatten path in milliseconds.
    #[serde(default = "default_flatten_bound_ms")]
    pub flatten_bound_ms: u64,

    /// Cap on new entries placed in a single scan tick.
    #[serde(default = "default_max_entries_per_scan")]
    pub max_entries_per_scan: usize,

    // --- Backends ---------------------------------------------------------

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_leader_key")]
    pub leader_key: String,

    /// Control-plane bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub broker: BrokerConfig,

    // --- Universe ---------------------------------------------------------

    /// Enabled strategy module names (see `strategy::build_strategies`).
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,

    /// Session instrument seed; refreshed into the store pre-open.
    #[serde(default = "default_instruments")]
    pub instruments: Vec<Instrument>,
}

impl Default for Config {
    fn default() -> Self {
        // Serde fills every field from its default helper.
        serde_json::from_str("{}").expect("default config deserialises")
    }
}

impl Config {
    /// Load configuration from an optional JSON file plus env overrides.
    ///
    /// Missing file is not an error — defaults apply. Env always wins over
    /// file values so deployments can pin secrets outside the config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?
        } else {
            warn!(path = %path.display(), "config file not found — using defaults");
            Self::default()
        };

        config.apply_env();

        info!(
            timezone = %config.timezone,
            capital = config.capital,
            scan_interval_secs = config.scan_interval_secs,
            strategies = ?config.strategies,
            instruments = config.instruments.len(),
            "config loaded"
        );

        Ok(config)
    }

    /// Apply environment overrides (MERIDIAN_* plus broker credentials).
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MERIDIAN_TIMEZONE") {
            self.timezone = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_CAPITAL") {
            if let Ok(n) = v.parse() {
                self.capital = n;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_SQLITE_PATH") {
            self.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_REDIS_URL") {
            self.redis_url = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("BROKER_API_KEY") {
            self.broker.api_key = v;
        }
        if let Ok(v) = std::env::var("BROKER_API_SECRET") {
            self.broker.api_secret = v;
        }
        if let Ok(v) = std::env::var("BROKER_BASE_URL") {
            self.broker.base_url = v;
        }
    }

    /// Content hash of the canonical JSON form, truncated to 12 hex chars.
    ///
    /// Credentials are excluded so that rotating a secret does not change the
    /// forensic identity of the trading configuration.
    pub fn config_sha(&self) -> String {
        let mut redacted = self.clone();
        redacted.broker.api_key = String::new();
        redacted.broker.api_secret = String::new();

        let canonical =
            serde_json::to_string(&redacted).expect("config serialises to JSON");
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)[..12].to_string()
    }

    pub fn scan_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scan_interval_secs)
    }

    /// Look up instrument metadata by symbol.
    pub fn instrument(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.symbol == symbol)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.timezone, "Asia/Kolkata");
        assert_eq!(cfg.entry_open, "09:15");
        assert_eq!(cfg.entry_close, "15:20");
        assert_eq!(cfg.session_close, "15:25");
        assert_eq!(cfg.scan_interval_secs, 5);
        assert_eq!(cfg.lease_secs, 30);
        assert_eq!(cfg.flatten_bound_ms, 2_000);
        assert_eq!(cfg.strategies, vec!["orb", "ema_momentum"]);
        assert!(!cfg.instruments.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "capital": 500000.0, "strategies": ["orb"] }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.capital, 500_000.0);
        assert_eq!(cfg.strategies, vec!["orb"]);
        assert_eq!(cfg.scan_interval_secs, 5);
        assert_eq!(cfg.timezone, "Asia/Kolkata");
    }

    #[test]
    fn config_sha_is_stable_and_short() {
        let cfg = Config::default();
        let a = cfg.config_sha();
        let b = cfg.config_sha();
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn config_sha_changes_with_content() {
        let a = Config::default().config_sha();
        let mut cfg = Config::default();
        cfg.capital = 42.0;
        assert_ne!(a, cfg.config_sha());
    }

    #[test]
    fn config_sha_ignores_credentials() {
        let a = Config::default().config_sha();
        let mut cfg = Config::default();
        cfg.broker.api_key = "k".to_string();
        cfg.broker.api_secret = "s".to_string();
        assert_eq!(a, cfg.config_sha());
    }

    #[test]
    fn instrument_lookup() {
        let cfg = Config::default();
        assert!(cfg.instrument("NIFTY").is_some());
        assert!(cfg.instrument("UNKNOWN").is_none());
    }
}
