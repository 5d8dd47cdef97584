use crate::error::{CoreError, Result};
use crate::models::Bar;

/// Rejects venue bars that would corrupt the buffers
pub struct BarValidator;

impl BarValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a bar for correctness
    pub fn validate(&self, bar: &Bar) -> Result<()> {
        self.validate_prices(bar)?;
        self.validate_ohlc_relationship(bar)?;
        Ok(())
    }

    /// All prices must be positive and finite
    fn validate_prices(&self, bar: &Bar) -> Result<()> {
        for (name, value) in [
            ("open", bar.open),
            ("high", bar.high),
            ("low", bar.low),
            ("close", bar.close),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(CoreError::Malformed(format!(
                    "Invalid {} price: {}",
                    name, value
                )));
            }
        }
        // Volume can be 0.0 on quiet minutes
        if !bar.volume.is_finite() || bar.volume < 0.0 {
            return Err(CoreError::Malformed(format!(
                "Invalid volume: {}",
                bar.volume
            )));
        }
        Ok(())
    }

    fn validate_ohlc_relationship(&self, bar: &Bar) -> Result<()> {
        if bar.high < bar.low {
            return Err(CoreError::Malformed(format!(
                "High ({}) is less than low ({})",
                bar.high, bar.low
            )));
        }
        if bar.high < bar.open.max(bar.close) {
            return Err(CoreError::Malformed(format!(
                "High ({}) is below open/close ({}/{})",
                bar.high, bar.open, bar.close
            )));
        }
        if bar.low > bar.open.min(bar.close) {
            return Err(CoreError::Malformed(format!(
                "Low ({}) is above open/close ({}/{})",
                bar.low, bar.open, bar.close
            )));
        }
        Ok(())
    }
}

impl Default for BarValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_valid_bar() -> Bar {
        Bar {
            open_time: Utc::now(),
            open: 100.0,
            high: 102.0,
            low: 99.0,
            close: 101.0,
            volume: 1000.0,
        }
    }

    #[test]
    fn test_validate_valid_bar() {
        assert!(BarValidator::new().validate(&make_valid_bar()).is_ok());
    }

    #[test]
    fn test_validate_negative_price() {
        let mut bar = make_valid_bar();
        bar.low = -1.0;

        let result = BarValidator::new().validate(&bar);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid low price"));
    }

    #[test]
    fn test_validate_nan_rejected() {
        let mut bar = make_valid_bar();
        bar.close = f64::NAN;
        assert!(BarValidator::new().validate(&bar).is_err());
    }

    #[test]
    fn test_validate_zero_volume_allowed() {
        let mut bar = make_valid_bar();
        bar.volume = 0.0;
        assert!(BarValidator::new().validate(&bar).is_ok());

        bar.volume = -5.0;
        assert!(BarValidator::new().validate(&bar).is_err());
    }

    #[test]
    fn test_validate_high_below_low() {
        let mut bar = make_valid_bar();
        bar.high = 98.0;
        let result = BarValidator::new().validate(&bar);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("less than low"));
    }

    #[test]
    fn test_validate_close_outside_range() {
        let mut bar = make_valid_bar();
        bar.close = 105.0;
        assert!(BarValidator::new().validate(&bar).is_err());
    }
}
