//! Test doubles shared across module tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use error_stack::{Report, bail};
use futures::future::BoxFuture;

use crate::error::ProviderError;
use crate::model::Bar;
use crate::provider::MarketDataProvider;
use crate::session::Clock;

pub fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn bar(symbol: &str, date: NaiveDate, close: f64) -> Bar {
    Bar {
        symbol: symbol.into(),
        date,
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        adj_close: close,
        volume: 1_000,
    }
}

/// Provider serving bars from memory and counting calls.
#[derive(Default)]
pub struct MockProvider {
    daily: Mutex<HashMap<String, Vec<Bar>>>,
    session: Mutex<HashMap<String, Bar>>,
    pub daily_calls: AtomicUsize,
    pub session_calls: AtomicUsize,
    delay: Option<Duration>,
    transient_failures: AtomicUsize,
    permanent_error: Mutex<Option<fn(&str) -> ProviderError>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bars(self, bars: Vec<Bar>) -> Self {
        {
            let mut daily = self.daily.lock().unwrap();
            for b in bars {
                daily.entry(b.symbol.clone()).or_default().push(b);
            }
        }
        self
    }

    pub fn with_session_bar(self, bar: Bar) -> Self {
        self.session.lock().unwrap().insert(bar.symbol.clone(), bar);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `n` daily requests with a transient error.
    pub fn failing_transiently(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every daily request with the error built by `make`.
    pub fn failing_with(self, make: fn(&str) -> ProviderError) -> Self {
        *self.permanent_error.lock().unwrap() = Some(make);
        self
    }

    pub fn daily_calls(&self) -> usize {
        self.daily_calls.load(Ordering::SeqCst)
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }
}

impl MarketDataProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn fetch_daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<Bar>, Report<ProviderError>>> {
        let symbol = symbol.to_string();
        Box::pin(async move {
            self.daily_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(make) = *self.permanent_error.lock().unwrap() {
                bail!(make(&symbol));
            }
            let failing = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                bail!(ProviderError::Timeout {
                    provider: "mock".into(),
                });
            }
            let daily = self.daily.lock().unwrap();
            Ok(daily
                .get(&symbol)
                .map(|bars| {
                    bars.iter()
                        .filter(|b| b.date >= start && b.date <= end)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn fetch_session_bar(&self, symbol: &str) -> BoxFuture<'_, Result<Bar, Report<ProviderError>>> {
        let symbol = symbol.to_string();
        Box::pin(async move {
            self.session_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let session = self.session.lock().unwrap();
            match session.get(&symbol) {
                Some(bar) => Ok(bar.clone()),
                None => bail!(ProviderError::NoSessionData { symbol }),
            }
        })
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Parse an RFC 3339 instant, e.g. `2024-06-14T18:00:00Z`.
    pub fn at(instant: &str) -> Self {
        Self::new(
            DateTime::parse_from_rfc3339(instant)
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    pub fn advance(&self, delta: TimeDelta) {
        *self.now.lock().unwrap() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
