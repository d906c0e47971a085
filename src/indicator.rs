pub mod atr;
pub mod bollinger;
pub mod catalog;
pub mod engine;
pub mod ma;
pub mod macd;
pub mod oscillator;
pub mod rsi;

use error_stack::Report;

use crate::error::IndicatorError;
use crate::model::Bar;

/// A technical analysis indicator that operates on a slice of bars.
///
/// Bars must be in ascending chronological order (oldest first).
pub trait Indicator: Send {
    /// Unique name of this indicator (e.g., "rsi", "sma").
    fn name(&self) -> &str;

    /// Minimum number of bars required to produce at least one output value.
    fn required_bars(&self) -> usize;

    /// Calculate indicator values from bars.
    ///
    /// Returns `bars.len() - required_bars() + 1` values; the last value
    /// belongs to the last bar.
    fn calculate(&self, bars: &[Bar]) -> Result<Vec<f64>, Report<IndicatorError>>;
}

/// Extract close prices from a slice of bars.
pub fn close_prices(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Extract volumes from a slice of bars.
pub fn volumes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.volume as f64).collect()
}
