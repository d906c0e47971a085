//! Cache-first access to bar windows.
//!
//! Closed sessions come from the bar store, backfilled on a miss. The
//! current session, while it is not final, comes from the provider through
//! the [`ProvisionalCache`] and is never stored.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use error_stack::{Report, ResultExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::backfill::{BackfillOrchestrator, BackfillSettings, BackfillStatus, bar_defect};
use crate::calendar::TradingCalendar;
use crate::error::AccessError;
use crate::gaps::GapDetector;
use crate::model::{Bar, ProvisionalBar};
use crate::provider::MarketDataProvider;
use crate::session::{Clock, ProvisionalCache, SessionPolicy};
use crate::storage::Storage;

/// Bars of closed sessions only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedWindow {
    symbol: String,
    bars: Vec<Bar>,
}

/// Closed sessions followed by the in-progress bar of the current session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionalWindow {
    symbol: String,
    bars: Vec<Bar>,
    fetched_at: DateTime<Utc>,
}

impl ProvisionalWindow {
    /// The in-progress bar.
    pub fn current(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn closed_bars(&self) -> &[Bar] {
        &self.bars[..self.bars.len().saturating_sub(1)]
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// Consecutive session bars ending at the requested date, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Window {
    Closed(ClosedWindow),
    Provisional(ProvisionalWindow),
}

impl Window {
    pub(crate) fn closed(symbol: String, bars: Vec<Bar>) -> Self {
        Self::Closed(ClosedWindow { symbol, bars })
    }

    pub(crate) fn provisional(symbol: String, mut closed: Vec<Bar>, current: ProvisionalBar) -> Self {
        let fetched_at = current.fetched_at();
        closed.push(current.bar().clone());
        Self::Provisional(ProvisionalWindow {
            symbol,
            bars: closed,
            fetched_at,
        })
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Closed(w) => &w.symbol,
            Self::Provisional(w) => &w.symbol,
        }
    }

    pub fn bars(&self) -> &[Bar] {
        match self {
            Self::Closed(w) => &w.bars,
            Self::Provisional(w) => &w.bars,
        }
    }

    pub fn len(&self) -> usize {
        self.bars().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars().is_empty()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.bars().last().map(|b| b.date)
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

pub struct CacheFirstAccessor {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn MarketDataProvider>,
    calendar: Arc<TradingCalendar>,
    policy: SessionPolicy,
    cache: Arc<ProvisionalCache>,
    clock: Arc<dyn Clock>,
    gaps: GapDetector,
    backfill: BackfillOrchestrator,
    request_timeout: Duration,
}

impl CacheFirstAccessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn MarketDataProvider>,
        calendar: Arc<TradingCalendar>,
        policy: SessionPolicy,
        cache: Arc<ProvisionalCache>,
        clock: Arc<dyn Clock>,
        settings: BackfillSettings,
    ) -> Self {
        let request_timeout = settings.request_timeout;
        Self {
            gaps: GapDetector::new(storage.clone(), calendar.clone()),
            backfill: BackfillOrchestrator::new(
                storage.clone(),
                provider.clone(),
                calendar.clone(),
                policy.clone(),
                clock.clone(),
                settings,
            ),
            storage,
            provider,
            calendar,
            policy,
            cache,
            clock,
            request_timeout,
        }
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.policy.today(self.clock.now())
    }

    pub fn gap_detector(&self) -> &GapDetector {
        &self.gaps
    }

    pub fn orchestrator(&self) -> &BackfillOrchestrator {
        &self.backfill
    }

    /// The last `lookback` sessions of `symbol` ending at `as_of`.
    ///
    /// If `as_of` is not a session the window ends at the last session
    /// before it. Returns exactly `lookback` bars or `InsufficientData`.
    pub async fn get_window(
        &self,
        symbol: &str,
        as_of: NaiveDate,
        lookback: usize,
    ) -> Result<Window, Report<AccessError>> {
        let insufficient = || {
            Report::new(AccessError::InsufficientData {
                symbol: symbol.to_string(),
            })
        };

        if lookback == 0 {
            return Err(insufficient().attach("lookback must be > 0"));
        }
        let now = self.clock.now();
        let today = self.policy.today(now);
        if as_of > today {
            return Err(insufficient().attach(format!("{as_of} is after today ({today})")));
        }

        let sessions = self.calendar.sessions_ending(as_of, lookback);
        let Some(&last) = sessions.last() else {
            return Err(insufficient().attach("no sessions before the requested date"));
        };
        if sessions.len() < lookback {
            return Err(insufficient().attach(format!(
                "only {} sessions exist up to {as_of}",
                sessions.len()
            )));
        }

        if self.policy.is_final(last, now) {
            let bars = self.closed_bars(symbol, &sessions).await?;
            return Ok(Window::closed(symbol.to_string(), bars));
        }

        debug!(symbol, date = %last, "last session not final; using provisional bar");
        let closed = self.closed_bars(symbol, &sessions[..sessions.len() - 1]).await?;
        let current = self.session_bar(symbol, last, now).await?;
        Ok(Window::provisional(symbol.to_string(), closed, current))
    }

    /// Stored bars for exactly `dates`, backfilling gaps first.
    async fn closed_bars(
        &self,
        symbol: &str,
        dates: &[NaiveDate],
    ) -> Result<Vec<Bar>, Report<AccessError>> {
        let (Some(&start), Some(&end)) = (dates.first(), dates.last()) else {
            return Ok(Vec::new());
        };

        let gaps = self
            .gaps
            .find_gaps(symbol, start, end)
            .await
            .change_context(AccessError::Storage)?;

        if !gaps.is_empty() {
            info!(symbol, missing = gaps.len(), %start, %end, "cache miss, backfilling");
            let report = self
                .backfill
                .backfill(symbol, &gaps)
                .await
                .change_context(AccessError::Storage)?;

            let remaining = self
                .gaps
                .find_gaps(symbol, start, end)
                .await
                .change_context(AccessError::Storage)?;
            if !remaining.is_empty() {
                let mut err = Report::new(AccessError::InsufficientData {
                    symbol: symbol.to_string(),
                })
                .attach(format!("missing sessions: {}", format_dates(&remaining)));
                if report.status() != BackfillStatus::Complete {
                    for failure in &report.failures {
                        err = err.attach(format!(
                            "{} .. {}: {}",
                            failure.span.start, failure.span.end, failure.error
                        ));
                    }
                }
                return Err(err);
            }
        }

        let wanted: BTreeSet<NaiveDate> = dates.iter().copied().collect();
        let bars: Vec<Bar> = self
            .storage
            .get_bars_in_range(symbol, start, end)
            .await
            .change_context(AccessError::Storage)?
            .into_iter()
            .filter(|b| wanted.contains(&b.date))
            .collect();

        if !bars.iter().map(|b| b.date).eq(dates.iter().copied()) {
            return Err(Report::new(AccessError::InsufficientData {
                symbol: symbol.to_string(),
            })
            .attach(format!(
                "store returned {} of {} expected sessions",
                bars.len(),
                dates.len()
            )));
        }
        Ok(bars)
    }

    /// In-progress bar for `date`, from the cache while it is fresh.
    async fn session_bar(
        &self,
        symbol: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<ProvisionalBar, Report<AccessError>> {
        if let Some(bar) = self.cache.get(symbol, date, now) {
            debug!(symbol, %date, "provisional cache hit");
            return Ok(bar);
        }

        let insufficient = || {
            Report::new(AccessError::InsufficientData {
                symbol: symbol.to_string(),
            })
        };

        let bar = match tokio::time::timeout(
            self.request_timeout,
            self.provider.fetch_session_bar(symbol),
        )
        .await
        {
            Ok(Ok(bar)) => bar,
            Ok(Err(report)) => {
                return Err(report.change_context(AccessError::InsufficientData {
                    symbol: symbol.to_string(),
                }));
            }
            Err(_) => return Err(insufficient().attach("session bar request timed out")),
        };

        if bar.date != date || !bar.symbol.eq_ignore_ascii_case(symbol) {
            return Err(insufficient().attach(format!(
                "provider returned {} {} for session {date}",
                bar.symbol, bar.date
            )));
        }
        if let Some(defect) = bar_defect(&bar) {
            return Err(insufficient().attach(format!("session bar {date}: {defect}")));
        }

        let provisional = ProvisionalBar::new(bar, now);
        self.cache.insert(provisional.clone());
        Ok(provisional)
    }
}

fn format_dates(dates: &BTreeSet<NaiveDate>) -> String {
    dates
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
