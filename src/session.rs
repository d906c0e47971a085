//! Session finality and the short-lived cache for in-progress session bars.
//!
//! A session's bar is final once `close_time + finalization_delay` has passed
//! in the exchange's local time on that date. Until then the bar is
//! provisional: it is served from [`ProvisionalCache`] and never persisted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;
use error_stack::{Report, ResultExt};

use crate::config::{MAX_FINALIZATION_DELAY_MINUTES, SessionConfig};
use crate::error::ConfigError;
use crate::model::ProvisionalBar;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    timezone: Tz,
    close_time: NaiveTime,
    finalization_delay: TimeDelta,
}

impl SessionPolicy {
    pub fn new(timezone: Tz, close_time: NaiveTime, finalization_delay: TimeDelta) -> Self {
        Self {
            timezone,
            close_time,
            finalization_delay,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, Report<ConfigError>> {
        let timezone: Tz = config
            .timezone
            .parse()
            .map_err(|_| {
                Report::new(ConfigError::Validation {
                    field: format!("session.timezone \"{}\" is not an IANA zone", config.timezone),
                })
            })?;

        let close_time = NaiveTime::parse_from_str(&config.close_time, "%H:%M")
            .change_context(ConfigError::Validation {
                field: format!("session.close_time \"{}\" is not HH:MM", config.close_time),
            })?;

        if !(0..=MAX_FINALIZATION_DELAY_MINUTES).contains(&config.finalization_delay_minutes) {
            return Err(Report::new(ConfigError::Validation {
                field: format!(
                    "session.finalization_delay_minutes must be within 0..={MAX_FINALIZATION_DELAY_MINUTES}"
                ),
            }));
        }

        Ok(Self::new(
            timezone,
            close_time,
            TimeDelta::minutes(config.finalization_delay_minutes),
        ))
    }

    /// Calendar date at the exchange for the instant `now`.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    /// Whether the bar for `date` can no longer change.
    pub fn is_final(&self, date: NaiveDate, now: DateTime<Utc>) -> bool {
        let local_now = now.with_timezone(&self.timezone).naive_local();
        local_now >= date.and_time(self.close_time) + self.finalization_delay
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new(
            chrono_tz::America::New_York,
            NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            TimeDelta::minutes(60),
        )
    }
}

/// Per-symbol cache of the current session's provisional bar.
///
/// Passed to the accessor as a handle; entries expire after `ttl`.
pub struct ProvisionalCache {
    ttl: TimeDelta,
    entries: Mutex<HashMap<String, ProvisionalBar>>,
}

impl ProvisionalCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached bar for `symbol` on `date`, if it was fetched less than `ttl` ago.
    pub fn get(&self, symbol: &str, date: NaiveDate, now: DateTime<Utc>) -> Option<ProvisionalBar> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(symbol)
            .filter(|bar| bar.date() == date && now - bar.fetched_at() < self.ttl)
            .cloned()
    }

    pub fn insert(&self, bar: ProvisionalBar) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(bar.symbol().to_string(), bar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bar;
    use chrono::TimeZone;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn utc(y: i32, m: u32, day: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, day, h, min, 0).unwrap()
    }

    fn provisional(symbol: &str, date: NaiveDate, fetched_at: DateTime<Utc>) -> ProvisionalBar {
        ProvisionalBar::new(
            Bar {
                symbol: symbol.into(),
                date,
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.5,
                adj_close: 10.5,
                volume: 100,
            },
            fetched_at,
        )
    }

    #[test]
    fn session_not_final_before_close_plus_delay() {
        let policy = SessionPolicy::default();
        // 2024-06-14 16:30 EDT == 20:30 UTC; delay is 60 minutes.
        assert!(!policy.is_final(d("2024-06-14"), utc(2024, 6, 14, 20, 30)));
        assert!(policy.is_final(d("2024-06-14"), utc(2024, 6, 14, 21, 0)));
        assert!(policy.is_final(d("2024-06-13"), utc(2024, 6, 14, 13, 0)));
    }

    #[test]
    fn today_uses_exchange_timezone() {
        let policy = SessionPolicy::default();
        // 02:00 UTC on the 15th is still the 14th in New York.
        assert_eq!(policy.today(utc(2024, 6, 15, 2, 0)), d("2024-06-14"));
    }

    #[test]
    fn from_config_parses_fields() {
        let config = SessionConfig {
            timezone: "Asia/Seoul".into(),
            close_time: "15:30".into(),
            finalization_delay_minutes: 30,
            provisional_ttl_secs: 60,
        };
        let policy = SessionPolicy::from_config(&config).unwrap();
        // 16:00 KST == 07:00 UTC
        assert!(policy.is_final(d("2024-06-14"), utc(2024, 6, 14, 7, 0)));
        assert!(!policy.is_final(d("2024-06-14"), utc(2024, 6, 14, 6, 59)));
    }

    #[test]
    fn cache_hit_within_ttl() {
        let cache = ProvisionalCache::new(Duration::from_secs(300));
        let fetched = utc(2024, 6, 14, 17, 0);
        cache.insert(provisional("XYZ", d("2024-06-14"), fetched));

        let hit = cache.get("XYZ", d("2024-06-14"), fetched + TimeDelta::seconds(299));
        assert!(hit.is_some());
        assert!(cache
            .get("XYZ", d("2024-06-14"), fetched + TimeDelta::seconds(300))
            .is_none());
    }

    #[test]
    fn cache_miss_for_other_session_date() {
        let cache = ProvisionalCache::new(Duration::from_secs(300));
        let fetched = utc(2024, 6, 14, 17, 0);
        cache.insert(provisional("XYZ", d("2024-06-14"), fetched));
        assert!(cache.get("XYZ", d("2024-06-17"), fetched).is_none());
        assert!(cache.get("ABC", d("2024-06-14"), fetched).is_none());
    }
}
