use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use error_stack::Report;
use tracing::debug;

use crate::calendar::TradingCalendar;
use crate::error::StorageError;
use crate::storage::Storage;

/// Finds trading sessions that have no stored bar. Never calls the provider.
pub struct GapDetector {
    storage: Arc<dyn Storage>,
    calendar: Arc<TradingCalendar>,
}

impl GapDetector {
    pub fn new(storage: Arc<dyn Storage>, calendar: Arc<TradingCalendar>) -> Self {
        Self { storage, calendar }
    }

    /// Sessions in `[start, end]` with no bar for `symbol`.
    pub async fn find_gaps(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeSet<NaiveDate>, Report<StorageError>> {
        let sessions = self.calendar.sessions_between(start, end);
        if sessions.is_empty() {
            return Ok(BTreeSet::new());
        }
        let existing = self.storage.existing_dates(symbol, start, end).await?;
        let gaps: BTreeSet<NaiveDate> = sessions
            .into_iter()
            .filter(|date| !existing.contains(date))
            .collect();
        debug!(symbol, %start, %end, missing = gaps.len(), "gap detection");
        Ok(gaps)
    }
}
