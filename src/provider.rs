pub mod yahoo;

use std::sync::Arc;

use chrono::NaiveDate;
use error_stack::Report;
use futures::future::BoxFuture;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::model::Bar;

/// Abstraction over an external daily market-data service.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn MarketDataProvider`).
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch daily bars for `[start, end]` in one request.
    ///
    /// Bars for dates the provider has no complete record of are omitted.
    fn fetch_daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<Bar>, Report<ProviderError>>>;

    /// Fetch the bar of the most recent session, which may still be in progress.
    fn fetch_session_bar(&self, symbol: &str) -> BoxFuture<'_, Result<Bar, Report<ProviderError>>>;
}

/// Build the provider named in the config.
pub fn build_provider(config: &ProviderConfig) -> Option<Arc<dyn MarketDataProvider>> {
    match config.name.as_str() {
        "yahoo" => Some(Arc::new(yahoo::YahooProvider::new(config)) as Arc<dyn MarketDataProvider>),
        other => {
            tracing::warn!(name = other, "unknown provider in config");
            None
        }
    }
}
