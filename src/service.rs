//! Ties the accessor, engine, classifier and indicator store together.

use std::sync::Arc;

use chrono::NaiveDate;
use error_stack::{Report, ResultExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::accessor::{CacheFirstAccessor, Window};
use crate::error::{AccessError, AnalysisError};
use crate::indicator::catalog::{self, IndicatorDefinition};
use crate::indicator::engine::{ComputeExtent, IndicatorEngine, IndicatorSnapshot, IndicatorValue};
use crate::model::{IndicatorRow, SignalLabel, TimeframeBucket};
use crate::signal::ThresholdConfig;
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignalOutcome {
    /// Price-level indicator; carries no label.
    NotApplicable,
    /// Not enough bars for a value.
    Unavailable,
    Label { label: SignalLabel },
    ClassifyFailed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedIndicator {
    pub column: String,
    pub value: IndicatorValue,
    pub signal: SignalOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub symbol: String,
    pub bucket: TimeframeBucket,
    pub date: NaiveDate,
    pub provisional: bool,
    pub threshold_version: u32,
    pub persisted: bool,
    pub indicators: Vec<AnalyzedIndicator>,
}

impl Analysis {
    pub fn indicator(&self, column: &str) -> Option<&AnalyzedIndicator> {
        self.indicators.iter().find(|i| i.column == column)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedRow {
    pub row: IndicatorRow,
    /// Computed under a different threshold version than the one loaded.
    pub stale: bool,
}

fn access_context(symbol: &str, error: &AccessError) -> AnalysisError {
    match error {
        AccessError::InsufficientData { .. } => AnalysisError::InsufficientData {
            symbol: symbol.to_string(),
        },
        AccessError::Storage => AnalysisError::Storage,
    }
}

pub struct AnalysisService {
    accessor: Arc<CacheFirstAccessor>,
    storage: Arc<dyn Storage>,
    engine: IndicatorEngine,
    thresholds: Arc<ThresholdConfig>,
}

impl AnalysisService {
    pub fn new(
        accessor: Arc<CacheFirstAccessor>,
        storage: Arc<dyn Storage>,
        thresholds: Arc<ThresholdConfig>,
    ) -> Self {
        Self {
            accessor,
            storage,
            engine: IndicatorEngine::new(),
            thresholds,
        }
    }

    /// Compute and classify every indicator of `bucket` for the window
    /// ending at `as_of`, storing the row when `persist` is set and the
    /// window holds only closed sessions.
    pub async fn analyze(
        &self,
        symbol: &str,
        bucket: TimeframeBucket,
        as_of: NaiveDate,
        persist: bool,
    ) -> Result<Analysis, Report<AnalysisError>> {
        let window = self.window(symbol, as_of, bucket.lookback_sessions()).await?;
        self.analyze_window(&window, bucket, persist).await
    }

    pub async fn window(
        &self,
        symbol: &str,
        as_of: NaiveDate,
        lookback: usize,
    ) -> Result<Window, Report<AnalysisError>> {
        match self.accessor.get_window(symbol, as_of, lookback).await {
            Ok(window) => Ok(window),
            Err(report) => {
                let context = access_context(symbol, report.current_context());
                Err(report.change_context(context))
            }
        }
    }

    pub async fn analyze_window(
        &self,
        window: &Window,
        bucket: TimeframeBucket,
        persist: bool,
    ) -> Result<Analysis, Report<AnalysisError>> {
        let definitions = catalog::definitions(bucket);
        let Some(snapshot) = self.engine.latest(window, definitions) else {
            return Err(Report::new(AnalysisError::InsufficientData {
                symbol: window.symbol().to_string(),
            })
            .attach("empty window"));
        };

        let indicators = definitions
            .iter()
            .map(|def| {
                let value = snapshot.values.get(def).copied().unwrap_or(
                    IndicatorValue::Unavailable {
                        required: def.required_bars(),
                        available: window.len(),
                    },
                );
                AnalyzedIndicator {
                    column: def.column(),
                    value,
                    signal: self.signal_for(def, value),
                }
            })
            .collect();

        let persisted = persist && !window.is_provisional();
        if persisted {
            let row = self.row_from(window.symbol(), bucket, &snapshot);
            self.storage
                .upsert_indicator_rows(&[row])
                .await
                .change_context(AnalysisError::Storage)?;
        } else if persist {
            debug!(symbol = window.symbol(), "provisional window; row not stored");
        }

        Ok(Analysis {
            symbol: window.symbol().to_string(),
            bucket,
            date: snapshot.date,
            provisional: window.is_provisional(),
            threshold_version: self.thresholds.version(),
            persisted,
            indicators,
        })
    }

    fn signal_for(&self, def: &IndicatorDefinition, value: IndicatorValue) -> SignalOutcome {
        if !def.kind.is_classifiable() {
            return SignalOutcome::NotApplicable;
        }
        let Some(value) = value.value() else {
            return SignalOutcome::Unavailable;
        };
        match self
            .thresholds
            .classify(def.kind, def.params, def.bucket, value)
        {
            Ok(label) => SignalOutcome::Label { label },
            Err(report) => SignalOutcome::ClassifyFailed {
                reason: report.current_context().to_string(),
            },
        }
    }

    fn row_from(
        &self,
        symbol: &str,
        bucket: TimeframeBucket,
        snapshot: &IndicatorSnapshot,
    ) -> IndicatorRow {
        IndicatorRow {
            symbol: symbol.to_string(),
            date: snapshot.date,
            bucket,
            values: snapshot.columns(),
            threshold_version: self.thresholds.version(),
            computed_at: self.accessor.now(),
        }
    }

    /// Store rows for every closed session in `[start, end]`.
    ///
    /// One window covers the range plus the bucket's warm-up, so each series
    /// is computed once. Returns the number of rows written.
    pub async fn backfill_history(
        &self,
        symbol: &str,
        bucket: TimeframeBucket,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize, Report<AnalysisError>> {
        let end = end.min(self.accessor.today());
        let sessions = self.accessor.calendar().sessions_between(start, end);
        let Some(&last) = sessions.last() else {
            return Ok(0);
        };

        let lookback = sessions.len() + bucket.lookback_sessions() - 1;
        let window = self.window(symbol, last, lookback).await?;
        let provisional_date = window.is_provisional().then(|| window.last_date()).flatten();

        let rows: Vec<IndicatorRow> = self
            .engine
            .compute(&window, catalog::definitions(bucket), ComputeExtent::EveryDate)
            .iter()
            .filter(|s| s.date >= start && s.date <= end && Some(s.date) != provisional_date)
            .map(|s| self.row_from(symbol, bucket, s))
            .collect();

        self.storage
            .upsert_indicator_rows(&rows)
            .await
            .change_context(AnalysisError::Storage)?;
        info!(symbol, bucket = %bucket, rows = rows.len(), "indicator history stored");
        Ok(rows.len())
    }

    /// Stored row for (symbol, date, bucket), flagged stale when it was
    /// computed under another threshold version.
    pub async fn cached(
        &self,
        symbol: &str,
        bucket: TimeframeBucket,
        date: NaiveDate,
    ) -> Result<Option<CachedRow>, Report<AnalysisError>> {
        let row = self
            .storage
            .get_indicator_row(symbol, date, bucket)
            .await
            .change_context(AnalysisError::Storage)?;
        Ok(row.map(|row| CachedRow {
            stale: row.threshold_version != self.thresholds.version(),
            row,
        }))
    }

    pub async fn invalidate(
        &self,
        bucket: TimeframeBucket,
        symbol: Option<&str>,
        since: Option<NaiveDate>,
    ) -> Result<u64, Report<AnalysisError>> {
        let removed = self
            .storage
            .invalidate_indicator_rows(bucket, symbol, since)
            .await
            .change_context(AnalysisError::Storage)?;
        info!(bucket = %bucket, symbol, ?since, removed, "indicator rows invalidated");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backfill::BackfillSettings;
    use crate::calendar::TradingCalendar;
    use crate::config::{BandConfig, ThresholdRuleConfig, ThresholdsConfig};
    use crate::model::Bar;
    use crate::session::{ProvisionalCache, SessionPolicy};
    use crate::storage::sqlite::SqliteStorage;
    use crate::testing::{ManualClock, MockProvider, bar, d};

    fn rising_bars() -> Vec<Bar> {
        TradingCalendar::new()
            .sessions_between(d("2024-01-02"), d("2024-06-28"))
            .into_iter()
            .enumerate()
            .map(|(i, date)| bar("XYZ", date, 50.0 + i as f64))
            .collect()
    }

    fn thresholds(version: u32) -> Arc<ThresholdConfig> {
        let band = |label: &str, bound| BandConfig {
            label: label.into(),
            bound,
        };
        Arc::new(
            ThresholdConfig::from_config(&ThresholdsConfig {
                version,
                rules: vec![ThresholdRuleConfig {
                    indicator: "rsi".into(),
                    params: vec![10],
                    bucket: "short".into(),
                    upper: vec![band("strong_sell", 80.0), band("sell", 70.0)],
                    lower: vec![band("buy", 30.0), band("strong_buy", 20.0)],
                }],
            })
            .unwrap(),
        )
    }

    async fn accessor(
        provider: MockProvider,
        now: &str,
    ) -> (Arc<CacheFirstAccessor>, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        let accessor = CacheFirstAccessor::new(
            storage.clone(),
            Arc::new(provider),
            Arc::new(TradingCalendar::new()),
            SessionPolicy::default(),
            Arc::new(ProvisionalCache::new(Duration::from_secs(300))),
            Arc::new(ManualClock::at(now)),
            BackfillSettings::default(),
        );
        (Arc::new(accessor), storage)
    }

    async fn service(now: &str) -> AnalysisService {
        let provider = MockProvider::new()
            .with_bars(rising_bars())
            .with_session_bar(bar("XYZ", d("2024-06-14"), 500.0));
        let (accessor, storage) = accessor(provider, now).await;
        AnalysisService::new(accessor, storage, thresholds(1))
    }

    #[tokio::test]
    async fn analyze_classifies_and_persists() {
        let service = service("2024-06-20T12:00:00Z").await;

        let analysis = service
            .analyze("XYZ", TimeframeBucket::Short, d("2024-06-14"), true)
            .await
            .unwrap();

        assert_eq!(analysis.date, d("2024-06-14"));
        assert!(!analysis.provisional);
        assert!(analysis.persisted);
        assert_eq!(analysis.indicators.len(), catalog::definitions(TimeframeBucket::Short).len());

        let rsi = analysis.indicator("rsi_10").unwrap();
        assert_eq!(rsi.value, IndicatorValue::Available { value: 100.0 });
        assert_eq!(
            rsi.signal,
            SignalOutcome::Label {
                label: SignalLabel::StrongSell
            }
        );
        assert_eq!(
            analysis.indicator("sma_10").unwrap().signal,
            SignalOutcome::NotApplicable
        );
        assert!(matches!(
            analysis.indicator("stoch_k_10").unwrap().signal,
            SignalOutcome::ClassifyFailed { .. }
        ));

        let cached = service
            .cached("XYZ", TimeframeBucket::Short, d("2024-06-14"))
            .await
            .unwrap()
            .unwrap();
        assert!(!cached.stale);
        assert_eq!(cached.row.value("rsi_10"), Some(100.0));
    }

    #[tokio::test]
    async fn provisional_analysis_is_not_persisted() {
        // 14:00 in New York on 2024-06-14
        let service = service("2024-06-14T18:00:00Z").await;

        let analysis = service
            .analyze("XYZ", TimeframeBucket::Short, d("2024-06-14"), true)
            .await
            .unwrap();

        assert!(analysis.provisional);
        assert!(!analysis.persisted);
        let cached = service
            .cached("XYZ", TimeframeBucket::Short, d("2024-06-14"))
            .await
            .unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn rows_from_older_thresholds_are_stale() {
        let provider = MockProvider::new().with_bars(rising_bars());
        let (accessor, storage) = accessor(provider, "2024-06-20T12:00:00Z").await;
        let v1 = AnalysisService::new(accessor.clone(), storage.clone(), thresholds(1));
        v1.analyze("XYZ", TimeframeBucket::Short, d("2024-06-14"), true)
            .await
            .unwrap();

        let v2 = AnalysisService::new(accessor, storage, thresholds(2));
        let cached = v2
            .cached("XYZ", TimeframeBucket::Short, d("2024-06-14"))
            .await
            .unwrap()
            .unwrap();
        assert!(cached.stale);
    }

    #[tokio::test]
    async fn history_stores_one_row_per_session() {
        let service = service("2024-06-20T12:00:00Z").await;

        let written = service
            .backfill_history("XYZ", TimeframeBucket::Short, d("2024-06-03"), d("2024-06-14"))
            .await
            .unwrap();
        assert_eq!(written, 10);

        let rows = service
            .storage
            .list_indicator_rows("XYZ", TimeframeBucket::Short, d("2024-06-01"), d("2024-06-30"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|r| r.value("sma_20").is_some()));

        let removed = service
            .invalidate(TimeframeBucket::Short, Some("XYZ"), Some(d("2024-06-10")))
            .await
            .unwrap();
        assert_eq!(removed, 5);
    }

    #[tokio::test]
    async fn history_skips_unfinished_session() {
        let service = service("2024-06-14T18:00:00Z").await;

        let written = service
            .backfill_history("XYZ", TimeframeBucket::Short, d("2024-06-10"), d("2024-06-20"))
            .await
            .unwrap();
        // 06-10 .. 06-13 closed; 06-14 still trading
        assert_eq!(written, 4);
    }

    #[tokio::test]
    async fn missing_history_is_insufficient_data() {
        let (accessor, storage) = accessor(MockProvider::new(), "2024-06-20T12:00:00Z").await;
        let service = AnalysisService::new(accessor, storage, thresholds(1));

        let err = service
            .analyze("XYZ", TimeframeBucket::Short, d("2024-06-14"), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            AnalysisError::InsufficientData { .. }
        ));
    }
}
