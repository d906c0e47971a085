//! Range and momentum oscillators: stochastic %K, rate of change, Williams %R.

use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::{Indicator, close_prices};
use crate::model::Bar;

fn check_period(period: usize) -> Result<(), Report<IndicatorError>> {
    if period == 0 {
        bail!(IndicatorError::InvalidParameter {
            name: "period must be > 0".into(),
        });
    }
    Ok(())
}

fn check_len(required: usize, available: usize) -> Result<(), Report<IndicatorError>> {
    if available < required {
        bail!(IndicatorError::InsufficientData {
            required,
            available,
        });
    }
    Ok(())
}

/// Highest high and lowest low of each trailing window.
fn ranges(bars: &[Bar], period: usize) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
    bars.windows(period).map(|w| {
        let high = w.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = w.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let close = w[w.len() - 1].close;
        (high, low, close)
    })
}

/// Stochastic %K (unsmoothed), 0..=100.
pub struct StochK {
    period: usize,
}

impl StochK {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        check_period(period)?;
        Ok(Self { period })
    }
}

impl Indicator for StochK {
    fn name(&self) -> &str {
        "stoch_k"
    }

    fn required_bars(&self) -> usize {
        self.period
    }

    fn calculate(&self, bars: &[Bar]) -> Result<Vec<f64>, Report<IndicatorError>> {
        check_len(self.period, bars.len())?;
        Ok(ranges(bars, self.period)
            .map(|(high, low, close)| {
                if high == low {
                    50.0
                } else {
                    (close - low) / (high - low) * 100.0
                }
            })
            .collect())
    }
}

/// Rate of change in percent over `period` sessions.
pub struct Roc {
    period: usize,
}

impl Roc {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        check_period(period)?;
        Ok(Self { period })
    }
}

impl Indicator for Roc {
    fn name(&self) -> &str {
        "roc"
    }

    fn required_bars(&self) -> usize {
        self.period + 1
    }

    fn calculate(&self, bars: &[Bar]) -> Result<Vec<f64>, Report<IndicatorError>> {
        check_len(self.required_bars(), bars.len())?;
        let prices = close_prices(bars);
        Ok(prices
            .iter()
            .zip(&prices[self.period..])
            .map(|(&then, &now)| (now - then) / then * 100.0)
            .collect())
    }
}

/// Williams %R, -100..=0.
pub struct WilliamsR {
    period: usize,
}

impl WilliamsR {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        check_period(period)?;
        Ok(Self { period })
    }
}

impl Indicator for WilliamsR {
    fn name(&self) -> &str {
        "williams_r"
    }

    fn required_bars(&self) -> usize {
        self.period
    }

    fn calculate(&self, bars: &[Bar]) -> Result<Vec<f64>, Report<IndicatorError>> {
        check_len(self.period, bars.len())?;
        Ok(ranges(bars, self.period)
            .map(|(high, low, close)| {
                if high == low {
                    -50.0
                } else {
                    (high - close) / (high - low) * -100.0
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::test_support::{bars_from_closes, bars_from_hlc};

    #[test]
    fn zero_period_rejected() {
        assert!(StochK::new(0).is_err());
        assert!(Roc::new(0).is_err());
        assert!(WilliamsR::new(0).is_err());
    }

    #[test]
    fn stoch_close_at_high_is_100() {
        let stoch = StochK::new(3).unwrap();
        let bars = bars_from_hlc(&[(10.0, 8.0, 9.0), (11.0, 9.0, 10.0), (12.0, 10.0, 12.0)]);
        assert_eq!(stoch.calculate(&bars).unwrap(), vec![100.0]);
    }

    #[test]
    fn stoch_flat_range_is_midpoint() {
        let stoch = StochK::new(2).unwrap();
        let values = stoch.calculate(&bars_from_closes(&[5.0; 4])).unwrap();
        assert_eq!(values, vec![50.0, 50.0, 50.0]);
    }

    #[test]
    fn williams_close_at_low_is_minus_100() {
        let wr = WilliamsR::new(3).unwrap();
        let bars = bars_from_hlc(&[(12.0, 10.0, 11.0), (11.0, 9.0, 10.0), (10.0, 8.0, 8.0)]);
        assert_eq!(wr.calculate(&bars).unwrap(), vec![-100.0]);
    }

    #[test]
    fn williams_flat_range_is_midpoint() {
        let wr = WilliamsR::new(2).unwrap();
        assert_eq!(wr.calculate(&bars_from_closes(&[5.0; 2])).unwrap(), vec![-50.0]);
    }

    #[test]
    fn roc_known_value() {
        let roc = Roc::new(2).unwrap();
        let values = roc.calculate(&bars_from_closes(&[100.0, 105.0, 110.0, 99.0])).unwrap();
        assert_eq!(values.len(), 2);
        assert!((values[0] - 10.0).abs() < 1e-9);
        // 99 vs 105
        assert!((values[1] - (-6.0 / 105.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn roc_insufficient_data() {
        let roc = Roc::new(5).unwrap();
        assert!(roc.calculate(&bars_from_closes(&[1.0; 5])).is_err());
    }
}
