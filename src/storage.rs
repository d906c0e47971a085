pub mod sqlite;

use std::collections::BTreeSet;

use chrono::NaiveDate;
use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::StorageError;
use crate::model::{Bar, IndicatorRow, TimeframeBucket};

/// Bar store and indicator variant store.
///
/// Every write is an upsert keyed by (symbol, date); the last write wins.
pub trait Storage: Send + Sync {
    fn upsert_bars(&self, bars: &[Bar]) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    /// Dates in `[start, end]` that already have a bar for `symbol`.
    fn existing_dates(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<BTreeSet<NaiveDate>, Report<StorageError>>>;

    /// Bars in `[start, end]`, oldest first.
    fn get_bars_in_range(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<Bar>, Report<StorageError>>>;

    fn get_indicator_row(
        &self,
        symbol: &str,
        date: NaiveDate,
        bucket: TimeframeBucket,
    ) -> BoxFuture<'_, Result<Option<IndicatorRow>, Report<StorageError>>>;

    /// Rows in `[start, end]`, oldest first.
    fn list_indicator_rows(
        &self,
        symbol: &str,
        bucket: TimeframeBucket,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<IndicatorRow>, Report<StorageError>>>;

    /// Rejects any row whose columns are not exactly its bucket's catalog.
    fn upsert_indicator_rows(
        &self,
        rows: &[IndicatorRow],
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    /// Delete rows of `bucket`, optionally limited to one symbol and to dates
    /// on or after `since`. Returns the number of rows removed.
    fn invalidate_indicator_rows(
        &self,
        bucket: TimeframeBucket,
        symbol: Option<&str>,
        since: Option<NaiveDate>,
    ) -> BoxFuture<'_, Result<u64, Report<StorageError>>>;
}
