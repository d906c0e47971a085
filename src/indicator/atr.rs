use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::Indicator;
use crate::indicator::ma::{MovingAverage, Smoothing};
use crate::model::Bar;

/// Average True Range with Wilder's smoothing.
pub struct Atr {
    average: MovingAverage,
    period: usize,
}

impl Atr {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        Ok(Self {
            average: MovingAverage::new(period, Smoothing::Wilder)?,
            period,
        })
    }
}

fn true_range(bar: &Bar, prev_close: f64) -> f64 {
    (bar.high - bar.low)
        .max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
}

impl Indicator for Atr {
    fn name(&self) -> &str {
        "atr"
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

        let ranges: Vec<f64> = bars
            .windows(2)
            .map(|w| true_range(&w[1], w[0].close))
            .collect();

        self.average.calculate_prices(&ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::test_support::bars_from_hlc;

    #[test]
    fn atr_period_zero_invalid() {
        assert!(Atr::new(0).is_err());
    }

    #[test]
    fn atr_needs_period_plus_one_bars() {
        let atr = Atr::new(3).unwrap();
        let rows = [(11.0, 9.0, 10.0); 3];
        assert!(atr.calculate(&bars_from_hlc(&rows)).is_err());
    }

    #[test]
    fn atr_constant_range() {
        let atr = Atr::new(3).unwrap();
        let rows = [(11.0, 9.0, 10.0); 6];
        let values = atr.calculate(&bars_from_hlc(&rows)).unwrap();
        assert_eq!(values.len(), 4);
        for v in values {
            assert!((v - 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn atr_uses_gap_from_previous_close() {
        let atr = Atr::new(1).unwrap();
        // Gap up: previous close 10, today's range 14..15
        let values = atr
            .calculate(&bars_from_hlc(&[(11.0, 9.0, 10.0), (15.0, 14.0, 14.5)]))
            .unwrap();
        assert_eq!(values, vec![5.0]);
    }
}
