use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::ma::{MovingAverage, Smoothing};
use crate::indicator::{Indicator, close_prices};
use crate::model::Bar;

/// Which MACD series `calculate` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacdOutput {
    Line,
    Signal,
    Histogram,
}

pub struct Macd {
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
    output: MacdOutput,
}

impl Macd {
    pub fn new(
        fast_period: usize,
        slow_period: usize,
        signal_period: usize,
        output: MacdOutput,
    ) -> Result<Self, Report<IndicatorError>> {
        if fast_period == 0 || slow_period == 0 || signal_period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "all periods must be > 0".into(),
            });
        }
        if fast_period >= slow_period {
            bail!(IndicatorError::InvalidParameter {
                name: "fast_period must be < slow_period".into(),
            });
        }
        Ok(Self {
            fast_period,
            slow_period,
            signal_period,
            output,
        })
    }

    fn macd_line(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>> {
        let fast_ema = MovingAverage::new(self.fast_period, Smoothing::Exponential)?.calculate_prices(prices)?;
        let slow_ema = MovingAverage::new(self.slow_period, Smoothing::Exponential)?.calculate_prices(prices)?;

        // Align: slow_ema is shorter by (slow_period - fast_period) elements
        let offset = self.slow_period - self.fast_period;
        Ok(fast_ema[offset..]
            .iter()
            .zip(slow_ema.iter())
            .map(|(f, s)| f - s)
            .collect())
    }

    /// Calculate (macd_line, signal_line, histogram) tuples.
    pub fn calculate_full(
        &self,
        bars: &[Bar],
    ) -> Result<Vec<(f64, f64, f64)>, Report<IndicatorError>> {
        let prices = close_prices(bars);
        let required = self.slow_period + self.signal_period - 1;
        if prices.len() < required {
            bail!(IndicatorError::InsufficientData {
                required,
                available: prices.len(),
            });
        }

        let macd_line = self.macd_line(&prices)?;
        let signal_line = MovingAverage::new(self.signal_period, Smoothing::Exponential)?.calculate_prices(&macd_line)?;
        // Signal is shorter by (signal_period - 1)
        let signal_offset = self.signal_period - 1;

        Ok(macd_line[signal_offset..]
            .iter()
            .zip(signal_line.iter())
            .map(|(&m, &s)| (m, s, m - s))
            .collect())
    }
}

impl Indicator for Macd {
    fn name(&self) -> &str {
        match self.output {
            MacdOutput::Line => "macd",
            MacdOutput::Signal => "macd_signal",
            MacdOutput::Histogram => "macd_hist",
        }
    }

    fn required_bars(&self) -> usize {
        match self.output {
            MacdOutput::Line => self.slow_period,
            MacdOutput::Signal | MacdOutput::Histogram => {
                self.slow_period + self.signal_period - 1
            }
        }
    }

    fn calculate(&self, bars: &[Bar]) -> Result<Vec<f64>, Report<IndicatorError>> {
        if self.output == MacdOutput::Line {
            let prices = close_prices(bars);
            if prices.len() < self.slow_period {
                bail!(IndicatorError::InsufficientData {
                    required: self.slow_period,
                    available: prices.len(),
                });
            }
            return self.macd_line(&prices);
        }

        let full = self.calculate_full(bars)?;
        Ok(full
            .into_iter()
            .map(|(_, s, h)| match self.output {
                MacdOutput::Signal => s,
                _ => h,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::test_support::bars_from_closes;

    #[test]
    fn macd_invalid_fast_ge_slow() {
        assert!(Macd::new(26, 12, 9, MacdOutput::Line).is_err());
    }

    #[test]
    fn macd_period_zero_invalid() {
        assert!(Macd::new(0, 26, 9, MacdOutput::Line).is_err());
    }

    #[test]
    fn macd_histogram_insufficient_data() {
        let macd = Macd::new(12, 26, 9, MacdOutput::Histogram).unwrap();
        assert!(macd.calculate(&bars_from_closes(&[1.0; 33])).is_err());
        assert_eq!(macd.calculate(&bars_from_closes(&[1.0; 34])).unwrap().len(), 1);
    }

    #[test]
    fn macd_flat_prices_returns_zero() {
        let macd = Macd::new(3, 5, 3, MacdOutput::Line).unwrap();
        let values = macd.calculate(&bars_from_closes(&[10.0_f64; 10])).unwrap();
        assert_eq!(values.len(), 6);
        for v in &values {
            assert!(v.abs() < 1e-9, "expected 0 for flat prices, got {v}");
        }
    }

    #[test]
    fn macd_outputs_align_with_last_bar() {
        let closes: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let bars = bars_from_closes(&closes);
        for output in [MacdOutput::Line, MacdOutput::Signal, MacdOutput::Histogram] {
            let macd = Macd::new(3, 5, 3, output).unwrap();
            let values = macd.calculate(&bars).unwrap();
            assert_eq!(values.len(), bars.len() - macd.required_bars() + 1);
        }
    }

    #[test]
    fn histogram_is_line_minus_signal() {
        let closes: Vec<f64> = (1..=15).map(|i| (i as f64).sqrt()).collect();
        let macd = Macd::new(3, 5, 3, MacdOutput::Histogram).unwrap();
        for (m, s, h) in macd.calculate_full(&bars_from_closes(&closes)).unwrap() {
            assert!((m - s - h).abs() < 1e-12);
        }
    }
}
