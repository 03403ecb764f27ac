//! Wall-clock sources and market-local session calendar.
//!
//! All session arithmetic goes through a fixed UTC offset so behavior never
//! depends on the host timezone.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use std::sync::Mutex;

use crate::config::SessionConfig;
use crate::{Error, Result};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock driven by the tokio timer, anchored at `origin`.
///
/// Under a paused runtime, `tokio::time::sleep` auto-advances this clock.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.started.elapsed()).unwrap_or(Duration::zero());
        self.origin + elapsed
    }
}

/// Manually stepped clock.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: Duration) {
        let next = self.now() + by;
        self.set(next);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Converts between UTC instants and market-local session times.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    offset: FixedOffset,
    market_open: NaiveTime,
    range_end: NaiveTime,
    eod_cutoff: NaiveTime,
}

impl MarketCalendar {
    #[allow(clippy::result_large_err)]
    pub fn new(session: &SessionConfig) -> Result<Self> {
        let offset = FixedOffset::east_opt(session.utc_offset_minutes * 60).ok_or_else(|| {
            Error::config(format!(
                "session.utc_offset_minutes out of range: {}",
                session.utc_offset_minutes
            ))
        })?;
        Ok(Self {
            offset,
            market_open: session.market_open,
            range_end: session.range_end,
            eod_cutoff: session.eod_cutoff,
        })
    }

    pub fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    pub fn local_time(&self, at: DateTime<Utc>) -> NaiveTime {
        self.local(at).time()
    }

    pub fn trading_day(&self, at: DateTime<Utc>) -> NaiveDate {
        self.local(at).date_naive()
    }

    /// UTC instant of a market-local wall time on `date`.
    pub fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        (date.and_time(time) - Duration::seconds(self.offset.local_minus_utc() as i64)).and_utc()
    }

    pub fn market_open(&self, date: NaiveDate) -> DateTime<Utc> {
        self.at(date, self.market_open)
    }

    pub fn range_end(&self, date: NaiveDate) -> DateTime<Utc> {
        self.at(date, self.range_end)
    }

    pub fn eod_cutoff(&self, date: NaiveDate) -> DateTime<Utc> {
        self.at(date, self.eod_cutoff)
    }

    pub fn is_eod(&self, at: DateTime<Utc>) -> bool {
        self.local_time(at) >= self.eod_cutoff
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// First trading day strictly after `date`.
    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut next = date + Duration::days(1);
        while !self.is_trading_day(next) {
            next += Duration::days(1);
        }
        next
    }

    /// Trading day of the session that is current or next at `at`.
    ///
    /// Once today's EOD cutoff has passed, this is the next trading day.
    pub fn upcoming_session(&self, at: DateTime<Utc>) -> NaiveDate {
        let today = self.trading_day(at);
        if self.is_trading_day(today) && !self.is_eod(at) {
            today
        } else {
            self.next_trading_day(today)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calendar() -> MarketCalendar {
        MarketCalendar::new(&SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_local_time_uses_fixed_offset() {
        let cal = calendar();
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 4, 0, 0).unwrap();
        assert_eq!(cal.local_time(at), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }

    #[test]
    fn test_at_round_trips() {
        let cal = calendar();
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let open = cal.market_open(day);
        assert_eq!(open, Utc.with_ymd_and_hms(2026, 3, 2, 3, 45, 0).unwrap());
        assert_eq!(cal.trading_day(open), day);
    }

    #[test]
    fn test_weekend_skipped() {
        let cal = calendar();
        let friday = NaiveDate::from_ymd_opt(2026, 3, 6).unwrap();
        assert_eq!(cal.next_trading_day(friday), NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
    }

    #[test]
    fn test_upcoming_session_after_eod() {
        let cal = calendar();
        // 15:30 IST on a Friday
        let at = Utc.with_ymd_and_hms(2026, 3, 6, 10, 0, 0).unwrap();
        assert_eq!(cal.upcoming_session(at), NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        // 09:00 IST on a Monday
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 3, 30, 0).unwrap();
        assert_eq!(cal.upcoming_session(at), NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 4, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 4, 0, 0).unwrap();
        let clock = TokioClock::starting_at(start);
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }
}
