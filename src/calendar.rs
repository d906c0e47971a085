//! US equity trading calendar.
//!
//! Sessions are weekdays that are not market holidays. Holidays are generated
//! by rule per year (fixed dates with weekend observance, nth-weekday rules,
//! Good Friday from the Easter computus) and merged with a configurable list
//! of one-off closures.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate, Weekday};

#[derive(Debug, Clone, Default)]
pub struct TradingCalendar {
    extra_closures: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calendar with additional one-off closures on top of the holiday rules.
    pub fn with_closures(closures: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            extra_closures: closures.into_iter().collect(),
        }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.extra_closures.contains(&date) || holidays_for_year(date.year()).contains(&date)
    }

    pub fn is_session(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.is_holiday(date)
    }

    /// Ordered sessions in `[start, end]`. Empty when `start > end`.
    pub fn sessions_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        if start > end {
            return Vec::new();
        }

        let mut closed: BTreeSet<NaiveDate> = (start.year()..=end.year())
            .flat_map(holidays_for_year)
            .collect();
        closed.extend(self.extra_closures.range(start..=end));

        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| !is_weekend(*d) && !closed.contains(d))
            .collect()
    }

    /// The last `count` sessions ending at or before `as_of`, oldest first.
    ///
    /// Returns fewer than `count` only when the calendar runs out of dates.
    pub fn sessions_ending(&self, as_of: NaiveDate, count: usize) -> Vec<NaiveDate> {
        let mut sessions = Vec::with_capacity(count);
        let mut cursor = Some(as_of);
        while sessions.len() < count {
            let Some(date) = cursor else { break };
            if self.is_session(date) {
                sessions.push(date);
            }
            cursor = date.pred_opt();
        }
        sessions.reverse();
        sessions
    }

    pub fn last_session_on_or_before(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.sessions_ending(date, 1).pop()
    }

    pub fn previous_session(&self, date: NaiveDate) -> Option<NaiveDate> {
        date.pred_opt()
            .and_then(|d| self.last_session_on_or_before(d))
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Rule-based market holidays for `year`.
fn holidays_for_year(year: i32) -> Vec<NaiveDate> {
    let ymd = |m, d| NaiveDate::from_ymd_opt(year, m, d);
    let nth = |m, weekday, n| NaiveDate::from_weekday_of_month_opt(year, m, weekday, n);

    let candidates = [
        new_years_day(year),
        if year >= 1998 { nth(1, Weekday::Mon, 3) } else { None },
        nth(2, Weekday::Mon, 3),
        easter_sunday(year).map(|d| d - Duration::days(2)),
        last_weekday_of_month(year, 5, Weekday::Mon),
        if year >= 2022 { ymd(6, 19).map(observed) } else { None },
        ymd(7, 4).map(observed),
        nth(9, Weekday::Mon, 1),
        nth(11, Weekday::Thu, 4),
        ymd(12, 25).map(observed),
    ];

    candidates.into_iter().flatten().collect()
}

/// New Year's Day on a Saturday is not moved back into the previous year.
fn new_years_day(year: i32) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(year, 1, 1)?;
    match date.weekday() {
        Weekday::Sat => None,
        Weekday::Sun => date.succ_opt(),
        _ => Some(date),
    }
}

fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut date = first_of_next.pred_opt()?;
    while date.weekday() != weekday {
        date = date.pred_opt()?;
    }
    Some(date)
}

/// Western Easter Sunday (anonymous Gregorian computus).
fn easter_sunday(year: i32) -> Option<NaiveDate> {
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
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}
