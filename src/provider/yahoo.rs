use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::model::Bar;
use crate::provider::MarketDataProvider;

const PROVIDER_NAME: &str = "yahoo";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) bar-cache/0.1";

/// Yahoo Finance v8 chart API client for daily bars.
pub struct YahooProvider {
    client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl YahooProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(nonzero!(1u32));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        }
    }

    async fn fetch_chart(
        &self,
        symbol: &str,
        params: &[(&str, String)],
    ) -> Result<ChartResponse, Report<ProviderError>> {
        // Wait for rate limiter before making the request
        self.rate_limiter.until_ready().await;

        let url = format!("{}/v8/finance/chart/{}", self.base_url, symbol);
        let response = match self.client.get(&url).query(params).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(Report::new(e).change_context(ProviderError::Timeout {
                    provider: PROVIDER_NAME.into(),
                }));
            }
            Err(e) => {
                return Err(Report::new(e).change_context(ProviderError::Request {
                    provider: PROVIDER_NAME.into(),
                }));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Report::new(ProviderError::SymbolNotFound {
                symbol: symbol.to_string(),
            }));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Report::new(ProviderError::RateLimited {
                provider: PROVIDER_NAME.into(),
            }));
        }
        if !status.is_success() {
            return Err(Report::new(ProviderError::Request {
                provider: PROVIDER_NAME.into(),
            })
            .attach(format!("HTTP status: {status}")));
        }

        response
            .json()
            .await
            .change_context(ProviderError::ResponseParse {
                provider: PROVIDER_NAME.into(),
            })
            .attach_with(|| format!("symbol: {symbol}"))
    }
}

impl MarketDataProvider for YahooProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn fetch_daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<Bar>, Report<ProviderError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let period1 = start.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp();
            let period2 = end
                .and_hms_opt(23, 59, 59)
                .unwrap_or_default()
                .and_utc()
                .timestamp();
            let params = [
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", "1d".to_string()),
                ("includeAdjustedClose", "true".to_string()),
            ];

            let chart = self.fetch_chart(&symbol, &params).await?;
            let bars: Vec<Bar> = parse_chart(&symbol, chart)?
                .into_iter()
                .filter(|b| b.date >= start && b.date <= end)
                .collect();

            info!(
                symbol = %symbol,
                %start,
                %end,
                fetched = bars.len(),
                "yahoo daily bar fetch complete"
            );

            Ok(bars)
        })
    }

    fn fetch_session_bar(&self, symbol: &str) -> BoxFuture<'_, Result<Bar, Report<ProviderError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let params = [
                ("range", "1d".to_string()),
                ("interval", "1d".to_string()),
            ];
            let chart = self.fetch_chart(&symbol, &params).await?;
            let bar = parse_chart(&symbol, chart)?.pop().ok_or_else(|| {
                Report::new(ProviderError::NoSessionData {
                    symbol: symbol.clone(),
                })
            })?;
            debug!(symbol = %symbol, date = %bar.date, close = bar.close, "yahoo session bar");
            Ok(bar)
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    gmtoffset: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<i64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

/// Convert a chart response into bars, oldest first.
///
/// Rows with any missing OHLCV field are dropped rather than filled in.
fn parse_chart(symbol: &str, response: ChartResponse) -> Result<Vec<Bar>, Report<ProviderError>> {
    let parse_error = || ProviderError::ResponseParse {
        provider: PROVIDER_NAME.into(),
    };

    let Some(data) = response.chart.result.and_then(|r| r.into_iter().next()) else {
        return match response.chart.error {
            Some(err) if err.code == "Not Found" => Err(Report::new(ProviderError::SymbolNotFound {
                symbol: symbol.to_string(),
            })),
            Some(err) => Err(Report::new(parse_error())
                .attach(format!("{}: {}", err.code, err.description))),
            None => Err(Report::new(parse_error()).attach("empty result with no error")),
        };
    };

    // Daily timestamps are session opens; shift into exchange time before taking the date.
    let offset_secs = data.meta.and_then(|m| m.gmtoffset).unwrap_or(0);
    let offset = FixedOffset::east_opt(offset_secs).ok_or_else(|| {
        Report::new(parse_error()).attach(format!("invalid gmtoffset: {offset_secs}"))
    })?;

    let timestamps = data.timestamp.unwrap_or_default();
    let Some(quote) = data.indicators.quote.into_iter().next() else {
        return Err(Report::new(parse_error()).attach("no quote data"));
    };
    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose);

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let date = DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.with_timezone(&offset).date_naive())
            .ok_or_else(|| Report::new(parse_error()).attach(format!("invalid timestamp: {ts}")))?;

        let field = |v: &Vec<Option<f64>>| v.get(i).copied().flatten();
        let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
            field(&quote.open),
            field(&quote.high),
            field(&quote.low),
            field(&quote.close),
            quote.volume.get(i).copied().flatten(),
        ) else {
            debug!(symbol, %date, "skipping incomplete yahoo row");
            continue;
        };
        let adj_close = adj_closes
            .as_ref()
            .and_then(|v| v.get(i).copied().flatten())
            .unwrap_or(close);

        bars.push(Bar {
            symbol: symbol.to_string(),
            date,
            open,
            high,
            low,
            close,
            adj_close,
            volume,
        });
    }

    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart(json: &str) -> ChartResponse {
        serde_json::from_str(json).expect("fixture parses")
    }

    #[test]
    fn parses_bars_in_exchange_time() {
        // 2024-06-13 and 2024-06-14 13:30 UTC session opens, EDT offset.
        let response = chart(
            r#"{"chart":{"result":[{
                "meta":{"gmtoffset":-14400},
                "timestamp":[1718285400,1718371800],
                "indicators":{
                    "quote":[{"open":[10.0,11.0],"high":[12.0,12.5],"low":[9.5,10.5],
                              "close":[11.0,12.0],"volume":[1000,2000]}],
                    "adjclose":[{"adjclose":[10.9,11.9]}]
                }}],"error":null}}"#,
        );
        let bars = parse_chart("XYZ", response).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 6, 13).unwrap());
        assert_eq!(bars[1].date, NaiveDate::from_ymd_opt(2024, 6, 14).unwrap());
        assert_eq!(bars[1].close, 12.0);
        assert_eq!(bars[1].adj_close, 11.9);
        assert_eq!(bars[1].volume, 2000);
        assert_eq!(bars[0].symbol, "XYZ");
    }

    #[test]
    fn incomplete_rows_are_dropped() {
        let response = chart(
            r#"{"chart":{"result":[{
                "timestamp":[1718285400,1718371800],
                "indicators":{
                    "quote":[{"open":[10.0,null],"high":[12.0,12.5],"low":[9.5,10.5],
                              "close":[11.0,12.0],"volume":[1000,2000]}]
                }}],"error":null}}"#,
        );
        let bars = parse_chart("XYZ", response).unwrap();
        assert_eq!(bars.len(), 1);
        // Without adjclose the close is used.
        assert_eq!(bars[0].adj_close, 11.0);
    }

    #[test]
    fn not_found_error_maps_to_symbol_not_found() {
        let response = chart(
            r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#,
        );
        let err = parse_chart("GONE", response).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProviderError::SymbolNotFound { symbol } if symbol == "GONE"
        ));
    }

    #[test]
    fn other_chart_error_is_parse_error() {
        let response = chart(
            r#"{"chart":{"result":null,"error":{"code":"Bad Request","description":"Invalid input"}}}"#,
        );
        let err = parse_chart("XYZ", response).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProviderError::ResponseParse { .. }
        ));
    }

    /// Integration test: requires network access. Run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn integration_fetch_daily_bars() {
        let provider = YahooProvider::new(&ProviderConfig::default());
        let bars = provider
            .fetch_daily_bars(
                "SPY",
                NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
                NaiveDate::from_ymd_opt(2024, 6, 14).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bars.len(), 5);
    }
}
