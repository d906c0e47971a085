use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum ProviderError {
    #[display("request to {provider} failed")]
    Request { provider: String },
    #[display("failed to parse response from {provider}")]
    ResponseParse { provider: String },
    #[display("rate limit exceeded for {provider}")]
    RateLimited { provider: String },
    #[display("request to {provider} timed out")]
    Timeout { provider: String },
    #[display("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },
    #[display("no data for the current session of {symbol}")]
    NoSessionData { symbol: String },
}

impl ProviderError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Request { .. } | Self::RateLimited { .. } | Self::Timeout { .. }
        )
    }
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert data")]
    Insert,
    #[display("failed to query data")]
    Query,
    #[display("indicator row does not match the {bucket} schema")]
    Schema { bucket: String },
}

#[derive(Debug, Clone, PartialEq, Display, Error)]
pub enum BackfillError {
    #[display("provider unavailable while backfilling {symbol}")]
    ProviderUnavailable { symbol: String },
    #[display("provider returned invalid bars for {symbol}")]
    ValidationFailed { symbol: String },
    #[display("provider does not know {symbol}")]
    SymbolUnknown { symbol: String },
    #[display("failed to write backfilled bars")]
    Storage,
}

#[derive(Debug, Display, Error)]
pub enum AccessError {
    #[display("insufficient data for {symbol}")]
    InsufficientData { symbol: String },
    #[display("bar store unavailable")]
    Storage,
}

#[derive(Debug, Clone, PartialEq, Display, Error)]
pub enum ClassifyError {
    #[display("no thresholds configured for {indicator} ({bucket})")]
    Unconfigured { indicator: String, bucket: String },
    #[display("cannot classify non-finite value for {indicator}")]
    InvalidValue { indicator: String },
}

#[derive(Debug, Display, Error)]
pub enum IndicatorError {
    #[display("insufficient data: need {required}, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
}

#[derive(Debug, Display, Error)]
pub enum AnalysisError {
    #[display("not enough data to analyze {symbol}")]
    InsufficientData { symbol: String },
    #[display("indicator store unavailable")]
    Storage,
}
