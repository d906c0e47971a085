use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::ma::{MovingAverage, Smoothing};
use crate::indicator::{Indicator, close_prices};
use crate::model::Bar;

/// Band multiplier used by every catalog definition.
pub const STD_DEV_MULTIPLIER: f64 = 2.0;

/// Which Bollinger series `calculate` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandOutput {
    Upper,
    Middle,
    Lower,
    /// Position of the close inside the bands: 0 at the lower band, 1 at the upper.
    PercentB,
}

pub struct BollingerBands {
    period: usize,
    std_dev_multiplier: f64,
    output: BandOutput,
}

impl BollingerBands {
    pub fn new(
        period: usize,
        std_dev_multiplier: f64,
        output: BandOutput,
    ) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        if std_dev_multiplier <= 0.0 {
            bail!(IndicatorError::InvalidParameter {
                name: "std_dev_multiplier must be > 0".into(),
            });
        }
        Ok(Self {
            period,
            std_dev_multiplier,
            output,
        })
    }

    /// Returns (upper, middle, lower) band values.
    pub fn calculate_bands(
        &self,
        bars: &[Bar],
    ) -> Result<Vec<(f64, f64, f64)>, Report<IndicatorError>> {
        let prices = close_prices(bars);
        let sma = MovingAverage::new(self.period, Smoothing::Simple)?.calculate_prices(&prices)?;

        let bands = prices
            .windows(self.period)
            .zip(sma.iter())
            .map(|(window, &middle)| {
                let variance =
                    window.iter().map(|&p| (p - middle).powi(2)).sum::<f64>() / self.period as f64;
                let std_dev = variance.sqrt();
                let upper = middle + self.std_dev_multiplier * std_dev;
                let lower = middle - self.std_dev_multiplier * std_dev;
                (upper, middle, lower)
            })
            .collect();

        Ok(bands)
    }
}

impl Indicator for BollingerBands {
    fn name(&self) -> &str {
        match self.output {
            BandOutput::Upper => "bb_upper",
            BandOutput::Middle => "bb_middle",
            BandOutput::Lower => "bb_lower",
            BandOutput::PercentB => "bb_pct_b",
        }
    }

    fn required_bars(&self) -> usize {
        self.period
    }

    fn calculate(&self, bars: &[Bar]) -> Result<Vec<f64>, Report<IndicatorError>> {
        let bands = self.calculate_bands(bars)?;
        let closes = &bars[self.period - 1..];

        Ok(bands
            .into_iter()
            .zip(closes)
            .map(|((upper, middle, lower), bar)| match self.output {
                BandOutput::Upper => upper,
                BandOutput::Middle => middle,
                BandOutput::Lower => lower,
                BandOutput::PercentB => {
                    let width = upper - lower;
                    if width == 0.0 {
                        0.5
                    } else {
                        (bar.close - lower) / width
                    }
                }
            })
            .collect())
    }
}
