// =============================================================================
// Clock & MarketHoursGate — session window classification in the trading TZ
// =============================================================================
//
// Windows (defaults):
//   Entry      09:15–15:20  new entries allowed
//   Exit-only  15:20–15:25  children may be placed/modified; no new parents
//   Closed     otherwise    EOD flatten runs at window open
//
// Holidays and weekends are Closed. Times are always evaluated in the
// configured trading timezone; the host timezone is irrelevant.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use tracing::info;

use crate::config::Config;
use crate::types::MarketWindow;

/// Wall/monotonic clock seam. Production uses [`SystemClock`]; tests pin time.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now_utc().timestamp_millis()
    }
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Classifies instants into entry / exit-only / closed session windows.
#[derive(Debug, Clone)]
pub struct MarketHoursGate {
    tz: Tz,
    entry_open: NaiveTime,
    entry_close: NaiveTime,
    session_close: NaiveTime,
    holidays: Vec<NaiveDate>,
}

impl MarketHoursGate {
    pub fn from_config(config: &Config) -> Result<Self> {
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid trading timezone '{}': {e}", config.timezone))?;

        let entry_open = parse_hhmm(&config.entry_open)
            .with_context(|| format!("invalid entry_open '{}'", config.entry_open))?;
        let entry_close = parse_hhmm(&config.entry_close)
            .with_context(|| format!("invalid entry_close '{}'", config.entry_close))?;
        let session_close = parse_hhmm(&config.session_close)
            .with_context(|| format!("invalid session_close '{}'", config.session_close))?;

        anyhow::ensure!(
            entry_open < entry_close && entry_close <= session_close,
            "session windows must be ordered: entry_open < entry_close <= session_close"
        );

        let holidays = config
            .holidays
            .iter()
            .map(|d| {
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .with_context(|| format!("invalid holiday date '{d}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            timezone = %tz,
            entry_open = %entry_open,
            entry_close = %entry_close,
            session_close = %session_close,
            holidays = holidays.len(),
            "market hours gate configured"
        );

        Ok(Self { tz, entry_open, entry_close, session_close, holidays })
    }

    /// Classify a UTC instant into the session window it falls in.
    pub fn classify(&self, now: DateTime<Utc>) -> MarketWindow {
        let local = now.with_timezone(&self.tz);
        let date = local.date_naive();

        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketWindow::Closed;
        }
        if self.holidays.contains(&date) {
            return MarketWindow::Closed;
        }

        let t = local.time();
        if t >= self.entry_open && t < self.entry_close {
            MarketWindow::Entry
        } else if t >= self.entry_close && t < self.session_close {
            MarketWindow::ExitOnly
        } else {
            MarketWindow::Closed
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn entry_open(&self) -> NaiveTime {
        self.entry_open
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").context("expected HH:MM")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn gate() -> MarketHoursGate {
        MarketHoursGate::from_config(&Config::default()).unwrap()
    }

    /// Build a UTC instant from an IST wall-clock time.
    fn ist(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Kolkata
            .with_ymd_and_hms(y, m, d, hh, mm, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn entry_window_weekday() {
        let g = gate();
        // 2026-07-29 is a Wednesday.
        assert_eq!(g.classify(ist(2026, 7, 29, 9, 15)), MarketWindow::Entry);
        assert_eq!(g.classify(ist(2026, 7, 29, 12, 0)), MarketWindow::Entry);
        assert_eq!(g.classify(ist(2026, 7, 29, 15, 19)), MarketWindow::Entry);
    }

    #[test]
    fn exit_only_window() {
        let g = gate();
        assert_eq!(g.classify(ist(2026, 7, 29, 15, 20)), MarketWindow::ExitOnly);
        assert_eq!(g.classify(ist(2026, 7, 29, 15, 24)), MarketWindow::ExitOnly);
    }

    #[test]
    fn closed_outside_session() {
        let g = gate();
        assert_eq!(g.classify(ist(2026, 7, 29, 9, 14)), MarketWindow::Closed);
        assert_eq!(g.classify(ist(2026, 7, 29, 15, 25)), MarketWindow::Closed);
        assert_eq!(g.classify(ist(2026, 7, 29, 3, 0)), MarketWindow::Closed);
    }

    #[test]
    fn weekend_is_closed() {
        let g = gate();
        // 2026-08-01 is a Saturday, 2026-08-02 a Sunday.
        assert_eq!(g.classify(ist(2026, 8, 1, 10, 0)), MarketWindow::Closed);
        assert_eq!(g.classify(ist(2026, 8, 2, 10, 0)), MarketWindow::Closed);
    }

    #[test]
    fn holiday_is_closed() {
        let mut cfg = Config::default();
        cfg.holidays = vec!["2026-07-29".to_string()];
        let g = MarketHoursGate::from_config(&cfg).unwrap();
        assert_eq!(g.classify(ist(2026, 7, 29, 10, 0)), MarketWindow::Closed);
    }

    #[test]
    fn classification_uses_trading_tz_not_host_tz() {
        let g = gate();
        // 03:45 UTC == 09:15 IST: entry opens regardless of host timezone.
        let utc = Utc.with_ymd_and_hms(2026, 7, 29, 3, 45, 0).unwrap();
        assert_eq!(g.classify(utc), MarketWindow::Entry);
        let utc = Utc.with_ymd_and_hms(2026, 7, 29, 3, 44, 0).unwrap();
        assert_eq!(g.classify(utc), MarketWindow::Closed);
    }

    #[test]
    fn misordered_windows_rejected() {
        let mut cfg = Config::default();
        cfg.entry_close = "09:00".to_string();
        assert!(MarketHoursGate::from_config(&cfg).is_err());
    }
}
