use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::ma::{MovingAverage, Smoothing};
use crate::indicator::{Indicator, close_prices};
use crate::model::Bar;

/// Relative strength index over Wilder-smoothed gains and losses.
pub struct Rsi {
    average: MovingAverage,
    period: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        Ok(Self {
            average: MovingAverage::new(period, Smoothing::Wilder)?,
            period,
        })
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &str {
        "rsi"
    }

    fn required_bars(&self) -> usize {
        self.period + 1
    }

    fn calculate(&self, bars: &[Bar]) -> Result<Vec<f64>, Report<IndicatorError>> {
        if bars.len() < self.required_bars() {
            bail!(IndicatorError::InsufficientData {
                required: self.required_bars(),
                available: bars.len(),
            });
        }

        let (gains, losses): (Vec<f64>, Vec<f64>) = close_prices(bars)
            .windows(2)
            .map(|w| {
                let change = w[1] - w[0];
                (change.max(0.0), (-change).max(0.0))
            })
            .unzip();

        let gains = self.average.calculate_prices(&gains)?;
        let losses = self.average.calculate_prices(&losses)?;
        Ok(gains
            .into_iter()
            .zip(losses)
            .map(|(gain, loss)| strength(gain, loss))
            .collect())
    }
}

fn strength(gain: f64, loss: f64) -> f64 {
    match (gain == 0.0, loss == 0.0) {
        (true, true) => 50.0,
        (_, true) => 100.0,
        _ => 100.0 - 100.0 / (1.0 + gain / loss),
    }
}
