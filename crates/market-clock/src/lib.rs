//! Eastern-time market session clock. All session decisions in the engine go
//! through here; no other component compares wall-clock times directly.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::US::Eastern;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Session {
    PreMarket,
    Regular,
    AfterHours,
    Closed,
}

impl Session {
    pub fn is_extended(&self) -> bool {
        matches!(self, Session::PreMarket | Session::AfterHours)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Session::PreMarket => "pre_market",
            Session::Regular => "regular",
            Session::AfterHours => "after_hours",
            Session::Closed => "closed",
        }
    }
}

const PRE_OPEN_MINUTES: u32 = 4 * 60;
const REGULAR_OPEN_MINUTES: u32 = 9 * 60 + 30;
const REGULAR_CLOSE_MINUTES: u32 = 16 * 60;
const AFTER_CLOSE_MINUTES: u32 = 20 * 60;

pub struct MarketClock;

impl MarketClock {
    pub fn new() -> Self {
        Self
    }

    pub fn current_session(&self) -> Session {
        self.session_at(Utc::now())
    }

    /// Classify a UTC instant by converting to Eastern at the edge. Holidays
    /// and weekends are fully closed, including extended hours.
    pub fn session_at(&self, instant: DateTime<Utc>) -> Session {
        let eastern = instant.with_timezone(&Eastern);
        if !self.is_trading_day(eastern.date_naive()) {
            return Session::Closed;
        }

        let minutes = eastern.time().hour() * 60 + eastern.time().minute();
        if (PRE_OPEN_MINUTES..REGULAR_OPEN_MINUTES).contains(&minutes) {
            Session::PreMarket
        } else if (REGULAR_OPEN_MINUTES..REGULAR_CLOSE_MINUTES).contains(&minutes) {
            Session::Regular
        } else if (REGULAR_CLOSE_MINUTES..AFTER_CLOSE_MINUTES).contains(&minutes) {
            Session::AfterHours
        } else {
            Session::Closed
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        !us_equity_holidays(date.year()).contains(&date)
    }

    /// The next regular-session open strictly after `instant` (or `instant`
    /// itself if the regular session is already open).
    pub fn next_regular_open(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        if self.session_at(instant) == Session::Regular {
            return instant;
        }

        let eastern = instant.with_timezone(&Eastern);
        let open_time = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let mut date = eastern.date_naive();

        // Same-day open still ahead of us?
        if self.is_trading_day(date) && eastern.time() < open_time {
            return Eastern
                .from_local_datetime(&date.and_time(open_time))
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(instant);
        }

        loop {
            date = date.succ_opt().expect("date overflow");
            if self.is_trading_day(date) {
                if let Some(open) = Eastern.from_local_datetime(&date.and_time(open_time)).single()
                {
                    return open.with_timezone(&Utc);
                }
            }
        }
    }

    /// Calendar date in exchange-local (Eastern) time.
    pub fn trading_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&Eastern).date_naive()
    }

    /// Minutes remaining in the regular session, or `None` outside it.
    pub fn minutes_until_regular_close(&self, instant: DateTime<Utc>) -> Option<i64> {
        if self.session_at(instant) != Session::Regular {
            return None;
        }
        let eastern = instant.with_timezone(&Eastern);
        let now_minutes = (eastern.time().hour() * 60 + eastern.time().minute()) as i64;
        Some(REGULAR_CLOSE_MINUTES as i64 - now_minutes)
    }

    /// Suspend until the next regular open. Returns immediately when already
    /// open. Sleeps in bounded increments so a shutdown signal is never
    /// blocked for long.
    pub async fn wait_until_next_open(&self) {
        loop {
            let now = Utc::now();
            if self.session_at(now) == Session::Regular {
                return;
            }
            let open = self.next_regular_open(now);
            let remaining = open - now;
            if remaining <= Duration::zero() {
                return;
            }
            let sleep_secs = remaining.num_seconds().clamp(1, 60) as u64;
            tracing::debug!(
                next_open = %open,
                minutes_remaining = remaining.num_minutes(),
                "market closed, waiting for next regular open"
            );
            tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)).await;
        }
    }
}

impl Default for MarketClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Observed U.S. equity exchange holidays for a year: fixed dates shifted
/// for weekends, floating Monday/Thursday rules, and Good Friday from the
/// Gregorian computus.
pub fn us_equity_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);

    days.push(observed(NaiveDate::from_ymd_opt(year, 1, 1).unwrap()));
    days.push(nth_weekday(year, 1, Weekday::Mon, 3)); // MLK Day
    days.push(nth_weekday(year, 2, Weekday::Mon, 3)); // Washington's Birthday
    days.push(easter_sunday(year) - Duration::days(2)); // Good Friday
    days.push(last_weekday(year, 5, Weekday::Mon)); // Memorial Day
    days.push(observed(NaiveDate::from_ymd_opt(year, 6, 19).unwrap())); // Juneteenth
    days.push(observed(NaiveDate::from_ymd_opt(year, 7, 4).unwrap())); // Independence Day
    days.push(nth_weekday(year, 9, Weekday::Mon, 1)); // Labor Day
    days.push(nth_weekday(year, 11, Weekday::Thu, 4)); // Thanksgiving
    days.push(observed(NaiveDate::from_ymd_opt(year, 12, 25).unwrap())); // Christmas

    days
}

/// Saturday holidays observe on Friday, Sunday holidays on Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let mut date = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let mut count = 0;
    loop {
        if date.weekday() == weekday {
            count += 1;
            if count == n {
                return date;
            }
        }
        date = date.succ_opt().unwrap();
    }
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    let mut date = next_month.pred_opt().unwrap();
    while date.weekday() != weekday {
        date = date.pred_opt().unwrap();
    }
    date
}

/// Anonymous Gregorian computus (Meeus/Jones/Butcher).
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eastern_utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Eastern
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn session_boundaries_on_a_trading_day() {
        let clock = MarketClock::new();
        // Monday 2025-06-02
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 2, 3, 59)), Session::Closed);
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 2, 4, 0)), Session::PreMarket);
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 2, 9, 29)), Session::PreMarket);
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 2, 9, 30)), Session::Regular);
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 2, 15, 59)), Session::Regular);
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 2, 16, 0)), Session::AfterHours);
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 2, 19, 59)), Session::AfterHours);
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 2, 20, 0)), Session::Closed);
    }

    #[test]
    fn weekends_are_closed_even_midday() {
        let clock = MarketClock::new();
        // Saturday 2025-06-07
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 7, 12, 0)), Session::Closed);
        assert!(!clock.is_trading_day(NaiveDate::from_ymd_opt(2025, 6, 8).unwrap()));
    }

    #[test]
    fn known_holidays_2025() {
        let clock = MarketClock::new();
        let holidays = [
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 20).unwrap(),  // MLK
            NaiveDate::from_ymd_opt(2025, 4, 18).unwrap(),  // Good Friday
            NaiveDate::from_ymd_opt(2025, 5, 26).unwrap(),  // Memorial Day
            NaiveDate::from_ymd_opt(2025, 7, 4).unwrap(),
            NaiveDate::from_ymd_opt(2025, 11, 27).unwrap(), // Thanksgiving
            NaiveDate::from_ymd_opt(2025, 12, 25).unwrap(),
        ];
        for day in holidays {
            assert!(!clock.is_trading_day(day), "{} should be a holiday", day);
        }
        assert!(clock.is_trading_day(NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()));
    }

    #[test]
    fn saturday_holiday_observed_on_friday() {
        // July 4, 2026 falls on Saturday; observed Friday July 3.
        let clock = MarketClock::new();
        assert!(!clock.is_trading_day(NaiveDate::from_ymd_opt(2026, 7, 3).unwrap()));
        assert!(clock.is_trading_day(NaiveDate::from_ymd_opt(2026, 7, 6).unwrap()));
    }

    #[test]
    fn next_open_from_friday_evening_is_monday() {
        let clock = MarketClock::new();
        // Friday 2025-06-06 18:00 ET → Monday 2025-06-09 09:30 ET
        let open = clock.next_regular_open(eastern_utc(2025, 6, 6, 18, 0));
        let expected = eastern_utc(2025, 6, 9, 9, 30);
        assert_eq!(open, expected);
    }

    #[test]
    fn next_open_same_day_premarket() {
        let clock = MarketClock::new();
        let open = clock.next_regular_open(eastern_utc(2025, 6, 2, 7, 0));
        assert_eq!(open, eastern_utc(2025, 6, 2, 9, 30));
    }

    #[test]
    fn next_open_during_regular_session_is_now() {
        let clock = MarketClock::new();
        let now = eastern_utc(2025, 6, 2, 11, 0);
        assert_eq!(clock.next_regular_open(now), now);
    }

    #[test]
    fn minutes_until_close_counts_down() {
        let clock = MarketClock::new();
        assert_eq!(
            clock.minutes_until_regular_close(eastern_utc(2025, 6, 2, 15, 30)),
            Some(30)
        );
        assert_eq!(clock.minutes_until_regular_close(eastern_utc(2025, 6, 2, 18, 0)), None);
    }

    #[test]
    fn dst_transition_keeps_eastern_hours() {
        let clock = MarketClock::new();
        // Standard time (January) and daylight time (June) both open at 9:30 ET.
        assert_eq!(clock.session_at(eastern_utc(2025, 1, 6, 9, 30)), Session::Regular);
        assert_eq!(clock.session_at(eastern_utc(2025, 6, 2, 9, 30)), Session::Regular);
    }
}
