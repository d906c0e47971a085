//! Fills missing sessions from the market data provider.
//!
//! Missing dates are merged into spans so that nearby gaps share one request.
//! Each span is validated as a whole before anything is written, and only
//! dates that were actually missing are stored.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use error_stack::{Report, ResultExt};
use serde::{Serialize, Serializer};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::calendar::TradingCalendar;
use crate::config::ProviderConfig;
use crate::error::{BackfillError, ProviderError};
use crate::model::Bar;
use crate::provider::MarketDataProvider;
use crate::session::{Clock, SessionPolicy};
use crate::storage::Storage;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
    /// Missing dates at most this many sessions apart share one request.
    pub merge_gap_sessions: usize,
}

impl BackfillSettings {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            merge_gap_sessions: config.merge_gap_sessions,
        }
    }
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self::from_config(&ProviderConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Complete,
    Partial,
    Failed,
}

/// Inclusive range of sessions fetched with one provider request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanFailure {
    pub span: Span,
    #[serde(serialize_with = "serialize_display")]
    pub error: BackfillError,
}

fn serialize_display<S: Serializer>(error: &BackfillError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub symbol: String,
    pub requested: usize,
    pub written: usize,
    pub still_missing: BTreeSet<NaiveDate>,
    pub failures: Vec<SpanFailure>,
}

impl BackfillReport {
    fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            requested: 0,
            written: 0,
            still_missing: BTreeSet::new(),
            failures: Vec::new(),
        }
    }

    pub fn status(&self) -> BackfillStatus {
        if self.still_missing.is_empty() {
            BackfillStatus::Complete
        } else if self.written == 0 {
            BackfillStatus::Failed
        } else {
            BackfillStatus::Partial
        }
    }
}

pub struct BackfillOrchestrator {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn MarketDataProvider>,
    calendar: Arc<TradingCalendar>,
    policy: SessionPolicy,
    clock: Arc<dyn Clock>,
    settings: BackfillSettings,
    flights: Mutex<HashMap<String, FlightEntry>>,
}

/// Backfill of one symbol that concurrent callers queue behind.
#[derive(Default)]
struct InFlight {
    outcome: tokio::sync::Mutex<Option<Settled>>,
}

/// What the last run did, kept while callers are still queued.
struct Settled {
    attempted: BTreeSet<NaiveDate>,
    report: BackfillReport,
}

impl Settled {
    /// The settled outcome seen from a caller whose dates are all in `attempted`.
    fn report_for(
        &self,
        missing: &BTreeSet<NaiveDate>,
        pending: BTreeSet<NaiveDate>,
    ) -> BackfillReport {
        let failures = self
            .report
            .failures
            .iter()
            .filter(|f| pending.range(f.span.start..=f.span.end).next().is_some())
            .cloned()
            .collect();
        BackfillReport {
            requested: missing.len(),
            still_missing: pending,
            failures,
            ..BackfillReport::empty(&self.report.symbol)
        }
    }
}

struct FlightEntry {
    flight: Arc<InFlight>,
    callers: usize,
}

/// Membership in a symbol's flight; the entry goes away with its last caller.
struct FlightTicket<'a> {
    flights: &'a Mutex<HashMap<String, FlightEntry>>,
    symbol: &'a str,
    flight: Arc<InFlight>,
}

impl Drop for FlightTicket<'_> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = flights.get_mut(self.symbol) {
            entry.callers -= 1;
            if entry.callers == 0 {
                flights.remove(self.symbol);
            }
        }
    }
}

impl BackfillOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn MarketDataProvider>,
        calendar: Arc<TradingCalendar>,
        policy: SessionPolicy,
        clock: Arc<dyn Clock>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            storage,
            provider,
            calendar,
            policy,
            clock,
            settings,
            flights: Mutex::new(HashMap::new()),
        }
    }

    fn join_flight<'a>(&'a self, symbol: &'a str) -> FlightTicket<'a> {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        let entry = flights
            .entry(symbol.to_string())
            .or_insert_with(|| FlightEntry {
                flight: Arc::default(),
                callers: 0,
            });
        entry.callers += 1;
        FlightTicket {
            flights: &self.flights,
            symbol,
            flight: entry.flight.clone(),
        }
    }

    /// Fetch and store bars for `missing` sessions of `symbol`.
    ///
    /// Concurrent calls for the same symbol run one at a time. A queued
    /// caller whose dates were filled meanwhile makes no provider request,
    /// and one whose dates the previous run already tried gets that run's
    /// outcome instead of asking again. Provider and validation failures are
    /// reported per span in the returned report; only a failing store is an
    /// `Err`.
    pub async fn backfill(
        &self,
        symbol: &str,
        missing: &BTreeSet<NaiveDate>,
    ) -> Result<BackfillReport, Report<BackfillError>> {
        let (Some(&first), Some(&last)) = (missing.first(), missing.last()) else {
            return Ok(BackfillReport::empty(symbol));
        };

        let ticket = self.join_flight(symbol);
        let mut settled = ticket.flight.outcome.lock().await;

        let existing = self
            .storage
            .existing_dates(symbol, first, last)
            .await
            .change_context(BackfillError::Storage)?;
        let pending: BTreeSet<NaiveDate> = missing.difference(&existing).copied().collect();

        let mut report = BackfillReport {
            requested: missing.len(),
            ..BackfillReport::empty(symbol)
        };
        if pending.is_empty() {
            debug!(symbol, "gaps already filled by a concurrent backfill");
            return Ok(report);
        }
        if let Some(previous) = settled.as_ref() {
            if pending.is_subset(&previous.attempted) {
                debug!(
                    symbol,
                    still_missing = pending.len(),
                    "reusing outcome of a concurrent backfill"
                );
                return Ok(previous.report_for(missing, pending));
            }
        }

        let now = self.clock.now();
        let (closed, open): (BTreeSet<NaiveDate>, BTreeSet<NaiveDate>) = pending
            .iter()
            .partition(|date| self.policy.is_final(**date, now));
        if !open.is_empty() {
            debug!(symbol, dates = ?open, "skipping sessions that are not final yet");
        }

        let mut written = BTreeSet::new();
        for span in plan_spans(&self.calendar, &closed, self.settings.merge_gap_sessions) {
            let result = self
                .fetch_span(symbol, span)
                .await
                .and_then(|bars| validate_span(&self.calendar, symbol, span, bars));
            let bars = match result {
                Ok(bars) => bars,
                Err(err) => {
                    warn!(symbol, start = %span.start, end = %span.end, error = ?err, "backfill span failed");
                    report.failures.push(SpanFailure {
                        span,
                        error: err.current_context().clone(),
                    });
                    continue;
                }
            };

            let to_write: Vec<Bar> = bars
                .into_iter()
                .filter(|b| closed.contains(&b.date))
                .collect();
            if to_write.is_empty() {
                continue;
            }
            self.storage
                .upsert_bars(&to_write)
                .await
                .change_context(BackfillError::Storage)
                .attach_with(|| format!("{symbol} {} .. {}", span.start, span.end))?;
            written.extend(to_write.iter().map(|b| b.date));
        }

        report.written = written.len();
        report.still_missing = pending.difference(&written).copied().collect();
        info!(
            symbol,
            requested = report.requested,
            written = report.written,
            still_missing = report.still_missing.len(),
            status = ?report.status(),
            "backfill finished"
        );
        *settled = Some(Settled {
            attempted: pending,
            report: report.clone(),
        });
        Ok(report)
    }

    /// One provider request for `span`, retried on transient errors.
    async fn fetch_span(&self, symbol: &str, span: Span) -> Result<Vec<Bar>, Report<BackfillError>> {
        let mut backoff = self.settings.retry_base_delay;
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(
                self.settings.request_timeout,
                self.provider.fetch_daily_bars(symbol, span.start, span.end),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Report::new(ProviderError::Timeout {
                    provider: self.provider.name().to_string(),
                })),
            };

            match result {
                Ok(bars) => return Ok(bars),
                Err(report)
                    if report.current_context().is_transient()
                        && attempt < self.settings.max_retries =>
                {
                    attempt += 1;
                    warn!(symbol, attempt, error = %report.current_context(), "provider request failed, retrying...");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(report) => {
                    let context = match report.current_context() {
                        ProviderError::SymbolNotFound { .. } | ProviderError::NoSessionData { .. } => {
                            BackfillError::SymbolUnknown {
                                symbol: symbol.to_string(),
                            }
                        }
                        ProviderError::ResponseParse { .. } => BackfillError::ValidationFailed {
                            symbol: symbol.to_string(),
                        },
                        _ => BackfillError::ProviderUnavailable {
                            symbol: symbol.to_string(),
                        },
                    };
                    return Err(report
                        .change_context(context)
                        .attach(format!("after {} attempt(s)", attempt + 1)));
                }
            }
        }
    }
}

/// Group dates into spans; dates at most `merge_gap_sessions` sessions apart
/// share a span.
pub fn plan_spans(
    calendar: &TradingCalendar,
    dates: &BTreeSet<NaiveDate>,
    merge_gap_sessions: usize,
) -> Vec<Span> {
    let mut spans: Vec<Span> = Vec::new();
    for &date in dates {
        match spans.last_mut() {
            Some(span)
                if calendar.sessions_between(span.end, date).len().saturating_sub(1)
                    <= merge_gap_sessions =>
            {
                span.end = date;
            }
            _ => spans.push(Span {
                start: date,
                end: date,
            }),
        }
    }
    spans
}

/// Why `bar` cannot be a valid daily record, if it cannot.
pub(crate) fn bar_defect(bar: &Bar) -> Option<&'static str> {
    let prices = [bar.open, bar.high, bar.low, bar.close, bar.adj_close];
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return Some("prices must be finite and positive");
    }
    if bar.low > bar.high {
        return Some("low above high");
    }
    if bar.low > bar.open.min(bar.close) {
        return Some("low above open or close");
    }
    if bar.high < bar.open.max(bar.close) {
        return Some("high below open or close");
    }
    if bar.volume < 0 {
        return Some("negative volume");
    }
    None
}

/// Check every bar of a span; any defect rejects the whole span.
fn validate_span(
    calendar: &TradingCalendar,
    symbol: &str,
    span: Span,
    bars: Vec<Bar>,
) -> Result<Vec<Bar>, Report<BackfillError>> {
    let invalid = |reason: String| {
        Report::new(BackfillError::ValidationFailed {
            symbol: symbol.to_string(),
        })
        .attach(reason)
    };

    let mut by_date = BTreeMap::new();
    for bar in bars {
        if !bar.symbol.eq_ignore_ascii_case(symbol) {
            return Err(invalid(format!("bar for {} in response for {symbol}", bar.symbol)));
        }
        if bar.date < span.start || bar.date > span.end {
            return Err(invalid(format!("{} outside {} .. {}", bar.date, span.start, span.end)));
        }
        if !calendar.is_session(bar.date) {
            return Err(invalid(format!("{} is not a trading session", bar.date)));
        }
        if let Some(defect) = bar_defect(&bar) {
            return Err(invalid(format!("{}: {defect}", bar.date)));
        }
        if by_date.insert(bar.date, bar).is_some() {
            return Err(invalid("duplicate date in response".to_string()));
        }
    }
    Ok(by_date.into_values().collect())
}
