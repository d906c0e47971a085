use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::{Indicator, close_prices, volumes};
use crate::model::Bar;

/// How each new value is folded into the average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Smoothing {
    /// Plain mean of the last `period` values.
    Simple,
    /// Weight `2 / (period + 1)` on the newest value.
    Exponential,
    /// Weight `1 / period` on the newest value (RSI, ATR).
    Wilder,
}

/// Which bar field is averaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Close,
    Volume,
}

pub struct MovingAverage {
    period: usize,
    smoothing: Smoothing,
    input: Input,
}

impl MovingAverage {
    pub fn new(period: usize, smoothing: Smoothing) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self {
            period,
            smoothing,
            input: Input::Close,
        })
    }

    pub fn over(mut self, input: Input) -> Self {
        self.input = input;
        self
    }

    /// Average of `values`; the first output covers the first `period` inputs.
    /// Recursive kinds are seeded with the simple mean of that first window.
    pub fn calculate_prices(&self, values: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>> {
        if values.len() < self.period {
            bail!(IndicatorError::InsufficientData {
                required: self.period,
                available: values.len(),
            });
        }

        let period = self.period as f64;
        if self.smoothing == Smoothing::Simple {
            return Ok(values
                .windows(self.period)
                .map(|w| w.iter().sum::<f64>() / period)
                .collect());
        }

        let alpha = match self.smoothing {
            Smoothing::Exponential => 2.0 / (period + 1.0),
            _ => 1.0 / period,
        };
        let mut average = values[..self.period].iter().sum::<f64>() / period;
        let mut out = Vec::with_capacity(values.len() - self.period + 1);
        out.push(average);
        for &v in &values[self.period..] {
            average += alpha * (v - average);
            out.push(average);
        }
        Ok(out)
    }
}

impl Indicator for MovingAverage {
    fn name(&self) -> &str {
        match (self.input, self.smoothing) {
            (Input::Close, Smoothing::Simple) => "sma",
            (Input::Close, Smoothing::Exponential) => "ema",
            (Input::Close, Smoothing::Wilder) => "wma",
            (Input::Volume, _) => "volume_ma",
        }
    }

    fn required_bars(&self) -> usize {
        self.period
    }

    fn calculate(&self, bars: &[Bar]) -> Result<Vec<f64>, Report<IndicatorError>> {
        let values = match self.input {
            Input::Close => close_prices(bars),
            Input::Volume => volumes(bars),
        };
        self.calculate_prices(&values)
    }
}
