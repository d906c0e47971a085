use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::StorageError;
use crate::indicator::catalog;
use crate::model::{Bar, IndicatorRow, TimeframeBucket};
use crate::storage::Storage;

type BarRow = (String, NaiveDate, f64, f64, f64, f64, f64, i64);

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`, run migrations and bring
    /// the indicator tables in line with the catalog.
    pub async fn open(path: &Path) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        Self::init(pool).await
    }

    /// Private in-memory database. A single pooled connection keeps every
    /// query on the same database.
    #[cfg(test)]
    pub(crate) async fn open_in_memory() -> Result<Self, Report<StorageError>> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .change_context(StorageError::Migration)?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .change_context(StorageError::Migration)?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, Report<StorageError>> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;

        let storage = Self { pool };
        for bucket in TimeframeBucket::ALL {
            storage.ensure_bucket_schema(bucket).await?;
        }
        Ok(storage)
    }

    /// Add catalog columns the table lacks and record the column signature.
    async fn ensure_bucket_schema(&self, bucket: TimeframeBucket) -> Result<(), Report<StorageError>> {
        let table = bucket.table_name();
        let existing: BTreeSet<String> = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Migration)?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<BTreeSet<String>, _>>()
            .change_context(StorageError::Migration)?;

        let columns = catalog::columns(bucket);
        for column in columns.iter().filter(|c| !existing.contains(*c)) {
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} REAL"))
                .execute(&self.pool)
                .await
                .change_context(StorageError::Migration)
                .attach_with(|| format!("adding {table}.{column}"))?;
            info!(bucket = %bucket, column = %column, "added indicator column");
        }

        let signature = columns.join(",");
        let previous: Option<String> =
            sqlx::query_scalar("SELECT columns FROM bucket_schema WHERE bucket = ?")
                .bind(bucket.as_str())
                .fetch_optional(&self.pool)
                .await
                .change_context(StorageError::Migration)?;

        if previous.as_deref() == Some(signature.as_str()) {
            return Ok(());
        }
        if previous.is_some() {
            warn!(
                bucket = %bucket,
                "indicator catalog changed; stored rows may be stale until invalidated"
            );
        }

        sqlx::query(
            "INSERT INTO bucket_schema (bucket, columns, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(bucket) DO UPDATE SET columns = excluded.columns, \
             updated_at = excluded.updated_at",
        )
        .bind(bucket.as_str())
        .bind(&signature)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .change_context(StorageError::Migration)?;
        Ok(())
    }
}

fn bar_from_row((symbol, date, open, high, low, close, adj_close, volume): BarRow) -> Bar {
    Bar {
        symbol,
        date,
        open,
        high,
        low,
        close,
        adj_close,
        volume,
    }
}

fn select_indicator_sql(bucket: TimeframeBucket, filter: &str) -> String {
    format!(
        "SELECT symbol, date, {}, threshold_version, computed_at FROM {} WHERE {filter}",
        catalog::columns(bucket).join(", "),
        bucket.table_name()
    )
}

fn indicator_from_row(
    bucket: TimeframeBucket,
    row: &SqliteRow,
) -> Result<IndicatorRow, Report<StorageError>> {
    let mut values = std::collections::BTreeMap::new();
    for column in catalog::columns(bucket) {
        let value: Option<f64> = row
            .try_get(column.as_str())
            .change_context(StorageError::Query)
            .attach_with(|| format!("column {column}"))?;
        values.insert(column, value);
    }
    let threshold_version: i64 = row.try_get("threshold_version").change_context(StorageError::Query)?;
    let computed_at: DateTime<Utc> = row.try_get("computed_at").change_context(StorageError::Query)?;

    Ok(IndicatorRow {
        symbol: row.try_get("symbol").change_context(StorageError::Query)?,
        date: row.try_get("date").change_context(StorageError::Query)?,
        bucket,
        values,
        threshold_version: u32::try_from(threshold_version).change_context(StorageError::Query)?,
        computed_at,
    })
}

/// The row must carry exactly its bucket's catalog columns.
fn check_row_schema(row: &IndicatorRow) -> Result<(), Report<StorageError>> {
    let expected: BTreeSet<String> = catalog::columns(row.bucket).into_iter().collect();
    let actual: BTreeSet<String> = row.values.keys().cloned().collect();
    if expected != actual {
        let unexpected: Vec<_> = actual.difference(&expected).collect();
        let missing: Vec<_> = expected.difference(&actual).collect();
        return Err(Report::new(StorageError::Schema {
            bucket: row.bucket.to_string(),
        })
        .attach(format!(
            "{} {}: unexpected {unexpected:?}, missing {missing:?}",
            row.symbol, row.date
        )));
    }
    Ok(())
}

impl Storage for SqliteStorage {
    fn upsert_bars(&self, bars: &[Bar]) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let bars = bars.to_vec();
        Box::pin(async move {
            let fetched_at = Utc::now();
            let mut tx = self
                .pool
                .begin()
                .await
                .change_context(StorageError::Insert)?;

            for b in &bars {
                sqlx::query(
                    "INSERT INTO bars \
                     (symbol, date, open, high, low, close, adj_close, volume, fetched_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(symbol, date) DO UPDATE SET \
                     open = excluded.open, high = excluded.high, low = excluded.low, \
                     close = excluded.close, adj_close = excluded.adj_close, \
                     volume = excluded.volume, fetched_at = excluded.fetched_at",
                )
                .bind(&b.symbol)
                .bind(b.date)
                .bind(b.open)
                .bind(b.high)
                .bind(b.low)
                .bind(b.close)
                .bind(b.adj_close)
                .bind(b.volume)
                .bind(fetched_at)
                .execute(&mut *tx)
                .await
                .change_context(StorageError::Insert)?;
            }

            tx.commit().await.change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn existing_dates(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<BTreeSet<NaiveDate>, Report<StorageError>>> {
        let symbol = symbol.to_string();
        Box::pin(async move {
            let dates: Vec<NaiveDate> = sqlx::query_scalar(
                "SELECT date FROM bars WHERE symbol = ? AND date >= ? AND date <= ?",
            )
            .bind(&symbol)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;
            Ok(dates.into_iter().collect())
        })
    }

    fn get_bars_in_range(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<Bar>, Report<StorageError>>> {
        let symbol = symbol.to_string();
        Box::pin(async move {
            let rows: Vec<BarRow> = sqlx::query_as(
                "SELECT symbol, date, open, high, low, close, adj_close, volume \
                 FROM bars \
                 WHERE symbol = ? AND date >= ? AND date <= ? \
                 ORDER BY date ASC",
            )
            .bind(&symbol)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(rows.into_iter().map(bar_from_row).collect())
        })
    }

    fn get_indicator_row(
        &self,
        symbol: &str,
        date: NaiveDate,
        bucket: TimeframeBucket,
    ) -> BoxFuture<'_, Result<Option<IndicatorRow>, Report<StorageError>>> {
        let symbol = symbol.to_string();
        Box::pin(async move {
            let sql = select_indicator_sql(bucket, "symbol = ? AND date = ?");
            let row = sqlx::query(&sql)
                .bind(&symbol)
                .bind(date)
                .fetch_optional(&self.pool)
                .await
                .change_context(StorageError::Query)?;

            row.map(|r| indicator_from_row(bucket, &r)).transpose()
        })
    }

    fn list_indicator_rows(
        &self,
        symbol: &str,
        bucket: TimeframeBucket,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<IndicatorRow>, Report<StorageError>>> {
        let symbol = symbol.to_string();
        Box::pin(async move {
            let sql = select_indicator_sql(
                bucket,
                "symbol = ? AND date >= ? AND date <= ? ORDER BY date ASC",
            );
            let rows = sqlx::query(&sql)
                .bind(&symbol)
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await
                .change_context(StorageError::Query)?;

            rows.iter()
                .map(|r| indicator_from_row(bucket, r))
                .collect()
        })
    }

    fn upsert_indicator_rows(
        &self,
        rows: &[IndicatorRow],
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let rows = rows.to_vec();
        Box::pin(async move {
            // Nothing is written if any row is off-schema.
            for row in &rows {
                check_row_schema(row)?;
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .change_context(StorageError::Insert)?;

            for row in &rows {
                let columns = catalog::columns(row.bucket);
                let placeholders = vec!["?"; columns.len() + 4].join(", ");
                let updates = columns
                    .iter()
                    .map(String::as_str)
                    .chain(["threshold_version", "computed_at"])
                    .map(|c| format!("{c} = excluded.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "INSERT INTO {} (symbol, date, {}, threshold_version, computed_at) \
                     VALUES ({placeholders}) \
                     ON CONFLICT(symbol, date) DO UPDATE SET {updates}",
                    row.bucket.table_name(),
                    columns.join(", "),
                );

                let mut query = sqlx::query(&sql).bind(&row.symbol).bind(row.date);
                for column in &columns {
                    query = query.bind(row.value(column));
                }
                query
                    .bind(i64::from(row.threshold_version))
                    .bind(row.computed_at)
                    .execute(&mut *tx)
                    .await
                    .change_context(StorageError::Insert)
                    .attach_with(|| format!("{} {} ({})", row.symbol, row.date, row.bucket))?;
            }

            tx.commit().await.change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn invalidate_indicator_rows(
        &self,
        bucket: TimeframeBucket,
        symbol: Option<&str>,
        since: Option<NaiveDate>,
    ) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
        let symbol = symbol.map(str::to_string);
        Box::pin(async move {
            let mut sql = format!("DELETE FROM {} WHERE 1 = 1", bucket.table_name());
            if symbol.is_some() {
                sql.push_str(" AND symbol = ?");
            }
            if since.is_some() {
                sql.push_str(" AND date >= ?");
            }

            let mut query = sqlx::query(&sql);
            if let Some(symbol) = &symbol {
                query = query.bind(symbol);
            }
            if let Some(since) = since {
                query = query.bind(since);
            }
            let result = query
                .execute(&self.pool)
                .await
                .change_context(StorageError::Insert)?;
            Ok(result.rows_affected())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::testing::{bar, d};

    async fn in_memory_storage() -> SqliteStorage {
        SqliteStorage::open_in_memory().await.unwrap()
    }

    fn indicator_row(symbol: &str, date: NaiveDate, bucket: TimeframeBucket) -> IndicatorRow {
        let values: BTreeMap<String, Option<f64>> = catalog::columns(bucket)
            .into_iter()
            .enumerate()
            .map(|(i, c)| (c, if i % 3 == 0 { None } else { Some(i as f64) }))
            .collect();
        IndicatorRow {
            symbol: symbol.into(),
            date,
            bucket,
            values,
            threshold_version: 1,
            computed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_and_query_bars() {
        let storage = in_memory_storage().await;
        let bars = vec![
            bar("XYZ", d("2024-01-03"), 11.0),
            bar("XYZ", d("2024-01-02"), 10.0),
            bar("ABC", d("2024-01-02"), 99.0),
        ];
        storage.upsert_bars(&bars).await.unwrap();

        let result = storage
            .get_bars_in_range("XYZ", d("2024-01-01"), d("2024-01-31"))
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        // Oldest first
        assert_eq!(result[0].date, d("2024-01-02"));
        assert_eq!(result[1], bars[0]);
    }

    #[tokio::test]
    async fn upsert_same_key_keeps_last_write() {
        let storage = in_memory_storage().await;
        storage.upsert_bars(&[bar("XYZ", d("2024-01-02"), 10.0)]).await.unwrap();
        storage.upsert_bars(&[bar("XYZ", d("2024-01-02"), 12.5)]).await.unwrap();

        let result = storage
            .get_bars_in_range("XYZ", d("2024-01-02"), d("2024-01-02"))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].close, 12.5);
    }

    #[tokio::test]
    async fn existing_dates_limited_to_range_and_symbol() {
        let storage = in_memory_storage().await;
        storage
            .upsert_bars(&[
                bar("XYZ", d("2024-01-02"), 10.0),
                bar("XYZ", d("2024-01-04"), 10.0),
                bar("XYZ", d("2024-01-10"), 10.0),
                bar("ABC", d("2024-01-03"), 10.0),
            ])
            .await
            .unwrap();

        let dates = storage
            .existing_dates("XYZ", d("2024-01-02"), d("2024-01-05"))
            .await
            .unwrap();
        assert_eq!(dates, BTreeSet::from([d("2024-01-02"), d("2024-01-04")]));
    }

    #[tokio::test]
    async fn indicator_row_roundtrip_keeps_nulls() {
        let storage = in_memory_storage().await;
        let row = indicator_row("XYZ", d("2024-06-14"), TimeframeBucket::Intermediate);
        storage.upsert_indicator_rows(&[row.clone()]).await.unwrap();

        let loaded = storage
            .get_indicator_row("XYZ", d("2024-06-14"), TimeframeBucket::Intermediate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.values, row.values);
        assert_eq!(loaded.value("rsi_14"), None);
        assert_eq!(loaded.threshold_version, 1);

        let other_bucket = storage
            .get_indicator_row("XYZ", d("2024-06-14"), TimeframeBucket::Short)
            .await
            .unwrap();
        assert!(other_bucket.is_none());
    }

    #[tokio::test]
    async fn indicator_upsert_replaces_row() {
        let storage = in_memory_storage().await;
        let mut row = indicator_row("XYZ", d("2024-06-14"), TimeframeBucket::Short);
        storage.upsert_indicator_rows(&[row.clone()]).await.unwrap();

        row.values.insert("rsi_10".into(), Some(55.5));
        row.threshold_version = 2;
        storage.upsert_indicator_rows(&[row]).await.unwrap();

        let rows = storage
            .list_indicator_rows("XYZ", TimeframeBucket::Short, d("2024-01-01"), d("2024-12-31"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("rsi_10"), Some(55.5));
        assert_eq!(rows[0].threshold_version, 2);
    }

    #[tokio::test]
    async fn cross_bucket_row_rejected() {
        let storage = in_memory_storage().await;
        let mut row = indicator_row("XYZ", d("2024-06-14"), TimeframeBucket::Intermediate);
        row.bucket = TimeframeBucket::Short;
        let valid = indicator_row("XYZ", d("2024-06-13"), TimeframeBucket::Short);

        let err = storage
            .upsert_indicator_rows(&[valid, row])
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), StorageError::Schema { .. }));

        // The valid row in the same batch was not written either
        let rows = storage
            .list_indicator_rows("XYZ", TimeframeBucket::Short, d("2024-01-01"), d("2024-12-31"))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn partial_row_rejected() {
        let storage = in_memory_storage().await;
        let mut row = indicator_row("XYZ", d("2024-06-14"), TimeframeBucket::Long);
        row.values.remove("sma_200");
        assert!(storage.upsert_indicator_rows(&[row]).await.is_err());
    }

    #[tokio::test]
    async fn invalidate_by_symbol_and_date() {
        let storage = in_memory_storage().await;
        let bucket = TimeframeBucket::Short;
        storage
            .upsert_indicator_rows(&[
                indicator_row("XYZ", d("2024-06-12"), bucket),
                indicator_row("XYZ", d("2024-06-13"), bucket),
                indicator_row("XYZ", d("2024-06-14"), bucket),
                indicator_row("ABC", d("2024-06-14"), bucket),
            ])
            .await
            .unwrap();

        let removed = storage
            .invalidate_indicator_rows(bucket, Some("XYZ"), Some(d("2024-06-13")))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let removed = storage.invalidate_indicator_rows(bucket, None, None).await.unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn missing_catalog_column_is_added_back() {
        let storage = in_memory_storage().await;
        sqlx::query("ALTER TABLE indicators_short DROP COLUMN roc_5")
            .execute(&storage.pool)
            .await
            .unwrap();

        storage
            .ensure_bucket_schema(TimeframeBucket::Short)
            .await
            .unwrap();

        let row = indicator_row("XYZ", d("2024-06-14"), TimeframeBucket::Short);
        storage.upsert_indicator_rows(&[row]).await.unwrap();
    }

    #[tokio::test]
    async fn bucket_schema_records_signature() {
        let storage = in_memory_storage().await;
        let signature: String =
            sqlx::query_scalar("SELECT columns FROM bucket_schema WHERE bucket = 'long'")
                .fetch_one(&storage.pool)
                .await
                .unwrap();
        assert_eq!(signature, catalog::columns(TimeframeBucket::Long).join(","));
    }
}
