//! Compiled-in indicator definitions per timeframe bucket.
//!
//! Each definition owns exactly one column of its bucket's table, so the
//! catalog doubles as the schema of the indicator store.

use std::fmt;

use error_stack::{Report, bail};
use serde::Serialize;

use crate::error::IndicatorError;
use crate::indicator::Indicator;
use crate::indicator::atr::Atr;
use crate::indicator::bollinger::{BandOutput, BollingerBands, STD_DEV_MULTIPLIER};
use crate::indicator::ma::{Input, MovingAverage, Smoothing};
use crate::indicator::macd::{Macd, MacdOutput};
use crate::indicator::oscillator::{Roc, StochK, WilliamsR};
use crate::indicator::rsi::Rsi;
use crate::model::TimeframeBucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Rsi,
    Sma,
    Ema,
    Macd,
    MacdSignal,
    MacdHist,
    BbUpper,
    BbMiddle,
    BbLower,
    BbPctB,
    VolumeMa,
    Atr,
    StochK,
    Roc,
    WilliamsR,
}

impl IndicatorKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "rsi" => Some(Self::Rsi),
            "sma" => Some(Self::Sma),
            "ema" => Some(Self::Ema),
            "macd" => Some(Self::Macd),
            "macd_signal" => Some(Self::MacdSignal),
            "macd_hist" => Some(Self::MacdHist),
            "bb_upper" => Some(Self::BbUpper),
            "bb_middle" => Some(Self::BbMiddle),
            "bb_lower" => Some(Self::BbLower),
            "bb_pct_b" => Some(Self::BbPctB),
            "volume_ma" => Some(Self::VolumeMa),
            "atr" => Some(Self::Atr),
            "stoch_k" => Some(Self::StochK),
            "roc" => Some(Self::Roc),
            "williams_r" => Some(Self::WilliamsR),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsi => "rsi",
            Self::Sma => "sma",
            Self::Ema => "ema",
            Self::Macd => "macd",
            Self::MacdSignal => "macd_signal",
            Self::MacdHist => "macd_hist",
            Self::BbUpper => "bb_upper",
            Self::BbMiddle => "bb_middle",
            Self::BbLower => "bb_lower",
            Self::BbPctB => "bb_pct_b",
            Self::VolumeMa => "volume_ma",
            Self::Atr => "atr",
            Self::StochK => "stoch_k",
            Self::Roc => "roc",
            Self::WilliamsR => "williams_r",
        }
    }

    /// Oscillator-type kinds carry a signal label; price-level kinds do not.
    pub fn is_classifiable(&self) -> bool {
        matches!(
            self,
            Self::Rsi | Self::MacdHist | Self::BbPctB | Self::StochK | Self::Roc | Self::WilliamsR
        )
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndicatorDefinition {
    pub kind: IndicatorKind,
    pub params: &'static [usize],
    pub bucket: TimeframeBucket,
}

impl IndicatorDefinition {
    const fn new(kind: IndicatorKind, params: &'static [usize], bucket: TimeframeBucket) -> Self {
        Self {
            kind,
            params,
            bucket,
        }
    }

    /// Stored column name, e.g. `rsi_14` or `macd_hist_12_26_9`.
    pub fn column(&self) -> String {
        let mut column = self.kind.as_str().to_string();
        for p in self.params {
            column.push('_');
            column.push_str(&p.to_string());
        }
        column
    }

    fn param(&self, index: usize) -> Result<usize, Report<IndicatorError>> {
        match self.params.get(index) {
            Some(&p) => Ok(p),
            None => bail!(IndicatorError::InvalidParameter {
                name: format!("{} is missing parameter {index}", self.kind),
            }),
        }
    }

    pub fn build(&self) -> Result<Box<dyn Indicator>, Report<IndicatorError>> {
        let indicator: Box<dyn Indicator> = match self.kind {
            IndicatorKind::Rsi => Box::new(Rsi::new(self.param(0)?)?),
            IndicatorKind::Sma => Box::new(self.average(Smoothing::Simple)?),
            IndicatorKind::Ema => Box::new(self.average(Smoothing::Exponential)?),
            IndicatorKind::Macd => Box::new(self.macd(MacdOutput::Line)?),
            IndicatorKind::MacdSignal => Box::new(self.macd(MacdOutput::Signal)?),
            IndicatorKind::MacdHist => Box::new(self.macd(MacdOutput::Histogram)?),
            IndicatorKind::BbUpper => Box::new(self.bands(BandOutput::Upper)?),
            IndicatorKind::BbMiddle => Box::new(self.bands(BandOutput::Middle)?),
            IndicatorKind::BbLower => Box::new(self.bands(BandOutput::Lower)?),
            IndicatorKind::BbPctB => Box::new(self.bands(BandOutput::PercentB)?),
            IndicatorKind::VolumeMa => {
                Box::new(self.average(Smoothing::Simple)?.over(Input::Volume))
            }
            IndicatorKind::Atr => Box::new(Atr::new(self.param(0)?)?),
            IndicatorKind::StochK => Box::new(StochK::new(self.param(0)?)?),
            IndicatorKind::Roc => Box::new(Roc::new(self.param(0)?)?),
            IndicatorKind::WilliamsR => Box::new(WilliamsR::new(self.param(0)?)?),
        };
        Ok(indicator)
    }

    fn average(&self, smoothing: Smoothing) -> Result<MovingAverage, Report<IndicatorError>> {
        MovingAverage::new(self.param(0)?, smoothing)
    }

    fn macd(&self, output: MacdOutput) -> Result<Macd, Report<IndicatorError>> {
        Macd::new(self.param(0)?, self.param(1)?, self.param(2)?, output)
    }

    fn bands(&self, output: BandOutput) -> Result<BollingerBands, Report<IndicatorError>> {
        BollingerBands::new(self.param(0)?, STD_DEV_MULTIPLIER, output)
    }

    /// Bars needed for one value.
    pub fn required_bars(&self) -> usize {
        let p = |i: usize| self.params.get(i).copied().unwrap_or(0);
        match self.kind {
            IndicatorKind::Macd => p(1),
            IndicatorKind::MacdSignal | IndicatorKind::MacdHist => (p(1) + p(2)).saturating_sub(1),
            IndicatorKind::Rsi | IndicatorKind::Atr | IndicatorKind::Roc => p(0) + 1,
            _ => p(0),
        }
    }
}

impl fmt::Display for IndicatorDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bucket, self.column())
    }
}

use IndicatorKind as K;
use TimeframeBucket::{Intermediate, Long, Short};

const SHORT: &[IndicatorDefinition] = &[
    IndicatorDefinition::new(K::Rsi, &[10], Short),
    IndicatorDefinition::new(K::Sma, &[10], Short),
    IndicatorDefinition::new(K::Sma, &[20], Short),
    IndicatorDefinition::new(K::Ema, &[12], Short),
    IndicatorDefinition::new(K::Macd, &[6, 13, 5], Short),
    IndicatorDefinition::new(K::MacdSignal, &[6, 13, 5], Short),
    IndicatorDefinition::new(K::MacdHist, &[6, 13, 5], Short),
    IndicatorDefinition::new(K::BbUpper, &[10], Short),
    IndicatorDefinition::new(K::BbMiddle, &[10], Short),
    IndicatorDefinition::new(K::BbLower, &[10], Short),
    IndicatorDefinition::new(K::BbPctB, &[10], Short),
    IndicatorDefinition::new(K::VolumeMa, &[10], Short),
    IndicatorDefinition::new(K::Atr, &[10], Short),
    IndicatorDefinition::new(K::StochK, &[10], Short),
    IndicatorDefinition::new(K::Roc, &[5], Short),
    IndicatorDefinition::new(K::WilliamsR, &[10], Short),
];

const INTERMEDIATE: &[IndicatorDefinition] = &[
    IndicatorDefinition::new(K::Rsi, &[14], Intermediate),
    IndicatorDefinition::new(K::Sma, &[50], Intermediate),
    IndicatorDefinition::new(K::Sma, &[100], Intermediate),
    IndicatorDefinition::new(K::Ema, &[26], Intermediate),
    IndicatorDefinition::new(K::Macd, &[12, 26, 9], Intermediate),
    IndicatorDefinition::new(K::MacdSignal, &[12, 26, 9], Intermediate),
    IndicatorDefinition::new(K::MacdHist, &[12, 26, 9], Intermediate),
    IndicatorDefinition::new(K::BbUpper, &[20], Intermediate),
    IndicatorDefinition::new(K::BbMiddle, &[20], Intermediate),
    IndicatorDefinition::new(K::BbLower, &[20], Intermediate),
    IndicatorDefinition::new(K::BbPctB, &[20], Intermediate),
    IndicatorDefinition::new(K::VolumeMa, &[20], Intermediate),
    IndicatorDefinition::new(K::Atr, &[14], Intermediate),
    IndicatorDefinition::new(K::StochK, &[14], Intermediate),
    IndicatorDefinition::new(K::Roc, &[20], Intermediate),
    IndicatorDefinition::new(K::WilliamsR, &[14], Intermediate),
];

const LONG: &[IndicatorDefinition] = &[
    IndicatorDefinition::new(K::Rsi, &[30], Long),
    IndicatorDefinition::new(K::Sma, &[150], Long),
    IndicatorDefinition::new(K::Sma, &[200], Long),
    IndicatorDefinition::new(K::Ema, &[50], Long),
    IndicatorDefinition::new(K::Macd, &[19, 39, 9], Long),
    IndicatorDefinition::new(K::MacdSignal, &[19, 39, 9], Long),
    IndicatorDefinition::new(K::MacdHist, &[19, 39, 9], Long),
    IndicatorDefinition::new(K::BbUpper, &[50], Long),
    IndicatorDefinition::new(K::BbMiddle, &[50], Long),
    IndicatorDefinition::new(K::BbLower, &[50], Long),
    IndicatorDefinition::new(K::BbPctB, &[50], Long),
    IndicatorDefinition::new(K::VolumeMa, &[50], Long),
    IndicatorDefinition::new(K::Atr, &[30], Long),
    IndicatorDefinition::new(K::StochK, &[30], Long),
    IndicatorDefinition::new(K::Roc, &[60], Long),
    IndicatorDefinition::new(K::WilliamsR, &[30], Long),
];

/// Definitions stored in `bucket`, in column order.
pub fn definitions(bucket: TimeframeBucket) -> &'static [IndicatorDefinition] {
    match bucket {
        TimeframeBucket::Short => SHORT,
        TimeframeBucket::Intermediate => INTERMEDIATE,
        TimeframeBucket::Long => LONG,
    }
}

/// Column names of `bucket`, in catalog order.
pub fn columns(bucket: TimeframeBucket) -> Vec<String> {
    definitions(bucket).iter().map(|d| d.column()).collect()
}

pub fn find(
    kind: IndicatorKind,
    params: &[usize],
    bucket: TimeframeBucket,
) -> Option<&'static IndicatorDefinition> {
    definitions(bucket)
        .iter()
        .find(|d| d.kind == kind && d.params == params)
}

/// Largest warm-up any definition of `bucket` needs.
pub fn max_required(bucket: TimeframeBucket) -> usize {
    definitions(bucket)
        .iter()
        .map(|d| d.required_bars())
        .max()
        .unwrap_or(0)
}
