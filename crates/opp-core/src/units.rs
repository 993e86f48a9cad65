//! Unit system and temperature conversion
//!
//! The display unit system converts temperature states whose reported unit
//! disagrees with the configured one, preserving the decimal precision of
//! the original string representation.

use serde::{Deserialize, Serialize};

/// Decimal digits carried by an f64 before representation noise appears;
/// derived from the machine epsilon of a 64-bit float.
pub const FLOAT_PRECISION: u32 = 15;

/// Unit string for degrees Celsius
pub const TEMP_CELSIUS: &str = "°C";

/// Unit string for degrees Fahrenheit
pub const TEMP_FAHRENHEIT: &str = "°F";

/// Round a float to [`FLOAT_PRECISION`] decimals.
///
/// Very large magnitudes are returned untouched; they carry no fractional
/// precision to clean up.
pub fn round_precision(value: f64) -> f64 {
    if !value.is_finite() || value.abs() >= 1e15 {
        return value;
    }
    let factor = 10f64.powi(FLOAT_PRECISION as i32);
    (value * factor).round() / factor
}

/// A temperature unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Parse a unit-of-measurement attribute string
    pub fn from_unit_str(unit: &str) -> Option<Self> {
        match unit {
            TEMP_CELSIUS => Some(Self::Celsius),
            TEMP_FAHRENHEIT => Some(Self::Fahrenheit),
            _ => None,
        }
    }

    /// The unit-of-measurement attribute string
    pub fn as_unit_str(&self) -> &'static str {
        match self {
            Self::Celsius => TEMP_CELSIUS,
            Self::Fahrenheit => TEMP_FAHRENHEIT,
        }
    }
}

/// Convert a temperature value between units
pub fn convert_temperature(value: f64, from: TemperatureUnit, to: TemperatureUnit) -> f64 {
    use TemperatureUnit::*;
    match (from, to) {
        (Celsius, Fahrenheit) => value * 9.0 / 5.0 + 32.0,
        (Fahrenheit, Celsius) => (value - 32.0) * 5.0 / 9.0,
        _ => value,
    }
}

/// Convert a temperature state string, keeping the decimal precision of
/// the input representation ("70" stays integer-shaped, "70.5" keeps one
/// decimal). Returns None when the string is not numeric.
pub fn convert_temperature_str(
    value: &str,
    from: TemperatureUnit,
    to: TemperatureUnit,
) -> Option<String> {
    let parsed: f64 = value.trim().parse().ok()?;
    if from == to {
        return Some(value.to_string());
    }
    let converted = convert_temperature(parsed, from, to);
    let decimals = value
        .split_once('.')
        .map(|(_, frac)| frac.trim().len())
        .unwrap_or(0);
    Some(format!("{:.*}", decimals, converted))
}

/// The configured display unit system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSystem {
    /// Display unit for temperatures
    pub temperature: TemperatureUnit,
}

impl UnitSystem {
    /// Metric system: Celsius
    pub fn metric() -> Self {
        Self {
            temperature: TemperatureUnit::Celsius,
        }
    }

    /// Imperial system: Fahrenheit
    pub fn imperial() -> Self {
        Self {
            temperature: TemperatureUnit::Fahrenheit,
        }
    }
}

impl Default for UnitSystem {
    fn default() -> Self {
        Self::metric()
    }
}
