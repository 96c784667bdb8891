use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use std::collections::HashSet;

// US Eastern standard time; override with MARKET_UTC_OFFSET_HOURS.
const DEFAULT_UTC_OFFSET_HOURS: i32 = -5;

// Before this local time the close (and the provider's end-of-day data) is not final.
const CLOSE_CUTOFF_HOUR: u32 = 16;
const CLOSE_CUTOFF_MINUTE: u32 = 30;

#[derive(Debug, Clone)]
pub struct MarketCalendar {
    offset: FixedOffset,
    holidays: HashSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn new(utc_offset_hours: i32, holidays: HashSet<NaiveDate>) -> anyhow::Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600)
            .with_context(|| format!("invalid market UTC offset: {utc_offset_hours}h"))?;
        Ok(Self { offset, holidays })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let hours = match std::env::var("MARKET_UTC_OFFSET_HOURS") {
            Ok(s) => s
                .trim()
                .parse::<i32>()
                .with_context(|| format!("MARKET_UTC_OFFSET_HOURS is not an integer: {s}"))?,
            Err(_) => DEFAULT_UTC_OFFSET_HOURS,
        };

        let mut holidays = fixed_holidays();
        if let Ok(s) = std::env::var("MARKET_HOLIDAYS") {
            holidays.extend(parse_holidays(&s)?);
        }

        Self::new(hours, holidays)
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.holidays.contains(&date)
    }

    /// The latest trading day whose close is final at `now_utc`.
    pub fn latest_closed_session(&self, now_utc: DateTime<Utc>) -> NaiveDate {
        let now_local = now_utc.with_timezone(&self.offset);

        let cutoff_reached =
            (now_local.hour(), now_local.minute()) >= (CLOSE_CUTOFF_HOUR, CLOSE_CUTOFF_MINUTE);
        let mut date = now_local.date_naive();
        if !cutoff_reached {
            date = date - Duration::days(1);
        }

        while !self.is_trading_day(date) {
            date = date - Duration::days(1);
        }
        date
    }

    /// Trading days in `[from, to]`, ascending.
    pub fn trading_days(&self, from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
        from.iter_days()
            .take_while(|d| *d <= to)
            .filter(|d| self.is_trading_day(*d))
            .collect()
    }
}

pub fn parse_date(s: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date (expected YYYY-MM-DD): {s}"))
}

pub fn resolve_as_of_date(
    calendar: &MarketCalendar,
    as_of_date_arg: Option<&str>,
    now_utc: DateTime<Utc>,
) -> anyhow::Result<NaiveDate> {
    match as_of_date_arg {
        Some(s) => parse_date(s),
        None => Ok(calendar.latest_closed_session(now_utc)),
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

fn parse_holidays(s: &str) -> anyhow::Result<Vec<NaiveDate>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_date)
        .collect()
}

fn fixed_holidays() -> HashSet<NaiveDate> {
    // Fixed-date exchange holidays only; floating ones come from MARKET_HOLIDAYS.
    let mut out = HashSet::new();
    for y in 2024..=2030 {
        for (m, d) in [(1, 1), (6, 19), (7, 4), (12, 25)] {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                out.insert(date);
            }
        }
    }
    out
}
