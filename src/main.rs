use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bar_cache::accessor::CacheFirstAccessor;
use bar_cache::backfill::BackfillSettings;
use bar_cache::calendar::TradingCalendar;
use bar_cache::config::{self, AppConfig};
use bar_cache::error::{AccessError, AnalysisError};
use bar_cache::model::TimeframeBucket;
use bar_cache::provider::build_provider;
use bar_cache::service::AnalysisService;
use bar_cache::session::{ProvisionalCache, SessionPolicy, SystemClock};
use bar_cache::signal::ThresholdConfig;
use bar_cache::storage::Storage;
use bar_cache::storage::sqlite::SqliteStorage;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("provider error")]
    Provider,
    #[display("insufficient data")]
    Data,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "bar-cache", about = "Daily bar cache with indicator analysis")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the last `lookback` session bars ending at a date.
    Window {
        symbol: String,
        /// Last date of the window (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        as_of: Option<NaiveDate>,
        #[arg(long, default_value_t = 20)]
        lookback: usize,
    },
    /// List sessions with no stored bar.
    Gaps {
        symbol: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Compute and classify a bucket's indicators.
    Analyze {
        symbol: String,
        #[arg(long, default_value = "intermediate", value_parser = parse_bucket)]
        bucket: TimeframeBucket,
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Override the bucket's default window length.
        #[arg(long)]
        lookback: Option<usize>,
        /// Store the indicator row (closed sessions only).
        #[arg(long, default_value_t = false)]
        persist: bool,
    },
    /// Fill missing bars, or store indicator rows when `--bucket` is given.
    Backfill {
        symbol: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long, value_parser = parse_bucket)]
        bucket: Option<TimeframeBucket>,
    },
    /// Show a stored indicator row.
    Cached {
        symbol: String,
        #[arg(long, value_parser = parse_bucket)]
        bucket: TimeframeBucket,
        #[arg(long)]
        date: NaiveDate,
    },
    /// Delete stored indicator rows.
    Invalidate {
        #[arg(long, value_parser = parse_bucket)]
        bucket: TimeframeBucket,
        #[arg(long)]
        symbol: Option<String>,
        /// Only rows on or after this date.
        #[arg(long)]
        since: Option<NaiveDate>,
    },
}

fn parse_bucket(s: &str) -> Result<TimeframeBucket, String> {
    TimeframeBucket::from_str(s)
        .ok_or_else(|| format!("unknown bucket \"{s}\" (short, intermediate, long)"))
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    // ── Storage ───────────────────────────────────────────────────────────────
    let data_dir = &config.general.data_dir;
    let db_path = format!("{data_dir}/bar-cache.db");
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(Path::new(&db_path))
            .await
            .change_context(AppError::Storage)?,
    );

    // ── Provider, calendar, session policy ───────────────────────────────────
    let provider = build_provider(&config.provider).ok_or_else(|| {
        Report::new(AppError::Provider).attach(format!("provider.name: {}", config.provider.name))
    })?;
    let calendar = Arc::new(TradingCalendar::with_closures(
        config.calendar.extra_closures.iter().copied(),
    ));
    let policy = SessionPolicy::from_config(&config.session).change_context(AppError::Config)?;
    let cache = Arc::new(ProvisionalCache::new(Duration::from_secs(
        config.session.provisional_ttl_secs,
    )));
    let thresholds = Arc::new(
        ThresholdConfig::from_config(&config.thresholds).change_context(AppError::Config)?,
    );

    let accessor = Arc::new(CacheFirstAccessor::new(
        Arc::clone(&storage),
        provider,
        calendar,
        policy,
        cache,
        Arc::new(SystemClock),
        BackfillSettings::from_config(&config.provider),
    ));
    let service = AnalysisService::new(Arc::clone(&accessor), Arc::clone(&storage), thresholds);

    match cli.command {
        Command::Window {
            symbol,
            as_of,
            lookback,
        } => {
            let as_of = as_of.unwrap_or_else(|| accessor.today());
            let window = accessor
                .get_window(&symbol, as_of, lookback)
                .await
                .map_err(access_error)?;
            print_json(&window)?;
        }
        Command::Gaps { symbol, from, to } => {
            let gaps = accessor
                .gap_detector()
                .find_gaps(&symbol, from, to)
                .await
                .change_context(AppError::Storage)?;
            print_json(&gaps)?;
        }
        Command::Analyze {
            symbol,
            bucket,
            as_of,
            lookback,
            persist,
        } => {
            let as_of = as_of.unwrap_or_else(|| accessor.today());
            let analysis = match lookback {
                Some(lookback) => {
                    let window = service
                        .window(&symbol, as_of, lookback)
                        .await
                        .map_err(analysis_error)?;
                    service.analyze_window(&window, bucket, persist).await
                }
                None => service.analyze(&symbol, bucket, as_of, persist).await,
            }
            .map_err(analysis_error)?;
            print_json(&analysis)?;
        }
        Command::Backfill {
            symbol,
            from,
            to,
            bucket: Some(bucket),
        } => {
            let written = service
                .backfill_history(&symbol, bucket, from, to)
                .await
                .map_err(analysis_error)?;
            info!(symbol = %symbol, bucket = %bucket, written, "history backfill complete");
            print_json(&serde_json::json!({ "rows_written": written }))?;
        }
        Command::Backfill {
            symbol,
            from,
            to,
            bucket: None,
        } => {
            let gaps = accessor
                .gap_detector()
                .find_gaps(&symbol, from, to)
                .await
                .change_context(AppError::Storage)?;
            let report = accessor
                .orchestrator()
                .backfill(&symbol, &gaps)
                .await
                .change_context(AppError::Storage)?;
            print_json(&serde_json::json!({
                "status": report.status(),
                "report": report,
            }))?;
        }
        Command::Cached {
            symbol,
            bucket,
            date,
        } => {
            let row = service
                .cached(&symbol, bucket, date)
                .await
                .map_err(analysis_error)?;
            print_json(&row)?;
        }
        Command::Invalidate {
            bucket,
            symbol,
            since,
        } => {
            let removed = service
                .invalidate(bucket, symbol.as_deref(), since)
                .await
                .map_err(analysis_error)?;
            print_json(&serde_json::json!({ "rows_removed": removed }))?;
        }
    }

    Ok(())
}

fn access_error(report: Report<AccessError>) -> Report<AppError> {
    let context = match report.current_context() {
        AccessError::InsufficientData { .. } => AppError::Data,
        AccessError::Storage => AppError::Storage,
    };
    report.change_context(context)
}

fn analysis_error(report: Report<AnalysisError>) -> Report<AppError> {
    let context = match report.current_context() {
        AnalysisError::InsufficientData { .. } => AppError::Data,
        AnalysisError::Storage => AppError::Storage,
    };
    report.change_context(context)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Report<AppError>> {
    let json = serde_json::to_string_pretty(value).change_context(AppError::Runtime)?;
    println!("{json}");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
    }
}
