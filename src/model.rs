use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One closed trading session's OHLCV record for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: i64,
}

/// Bar of a session that has not closed yet. Never written to the bar store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionalBar {
    bar: Bar,
    fetched_at: DateTime<Utc>,
}

impl ProvisionalBar {
    pub(crate) fn new(bar: Bar, fetched_at: DateTime<Utc>) -> Self {
        Self { bar, fetched_at }
    }

    pub fn bar(&self) -> &Bar {
        &self.bar
    }

    pub fn symbol(&self) -> &str {
        &self.bar.symbol
    }

    pub fn date(&self) -> NaiveDate {
        self.bar.date
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// Analysis timeframe. Each bucket owns a fixed set of indicator definitions
/// and its own storage table.
///
/// String representations match the config file format (e.g. `"short"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeframeBucket {
    Short,
    Intermediate,
    Long,
}

impl TimeframeBucket {
    pub const ALL: [TimeframeBucket; 3] = [Self::Short, Self::Intermediate, Self::Long];

    /// Parse a config-format string into a `TimeframeBucket`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "short" => Some(Self::Short),
            "intermediate" => Some(Self::Intermediate),
            "long" => Some(Self::Long),
            _ => None,
        }
    }

    /// Return the config-format string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Intermediate => "intermediate",
            Self::Long => "long",
        }
    }

    /// Name of the variant table holding this bucket's indicator rows.
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Short => "indicators_short",
            Self::Intermediate => "indicators_intermediate",
            Self::Long => "indicators_long",
        }
    }

    /// Number of sessions fetched for an interactive analysis of this bucket.
    pub fn lookback_sessions(self) -> usize {
        match self {
            Self::Short => 60,
            Self::Intermediate => 260,
            Self::Long => 520,
        }
    }
}

impl fmt::Display for TimeframeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalLabel {
    StrongBuy,
    Buy,
    Neutral,
    Sell,
    StrongSell,
}

impl SignalLabel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "strong_buy" => Some(Self::StrongBuy),
            "buy" => Some(Self::Buy),
            "neutral" => Some(Self::Neutral),
            "sell" => Some(Self::Sell),
            "strong_sell" => Some(Self::StrongSell),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrongBuy => "strong_buy",
            Self::Buy => "buy",
            Self::Neutral => "neutral",
            Self::Sell => "sell",
            Self::StrongSell => "strong_sell",
        }
    }
}

impl fmt::Display for SignalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored indicator values for one (symbol, date) in one bucket.
///
/// Keys are the bucket's column names; `None` marks a value that could not be
/// computed because the window was too short.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorRow {
    pub symbol: String,
    pub date: NaiveDate,
    pub bucket: TimeframeBucket,
    pub values: BTreeMap<String, Option<f64>>,
    pub threshold_version: u32,
    pub computed_at: DateTime<Utc>,
}

impl IndicatorRow {
    pub fn value(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied().flatten()
    }
}
