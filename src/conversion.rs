//! Sensor conversion from raw electrical values to engineering units.
//!
//! All functions are pure. Temperatures are returned in Fahrenheit.

use serde::{Deserialize, Serialize};

/// Steinhart–Hart coefficients for a 10k NTC thermistor.
const SH_A: f64 = 1.129148e-3;
const SH_B: f64 = 2.34125e-4;
const SH_C: f64 = 8.76741e-8;

/// Divider supply voltage for thermistor inputs.
pub const THERMISTOR_SUPPLY_VOLTS: f64 = 10.0;

/// Reference resistor in the thermistor divider.
pub const THERMISTOR_REFERENCE_OHMS: f64 = 10_000.0;

/// Nominal resistance of a 1k platinum RTD at 0 °C.
pub const RTD_R0: f64 = 1000.0;

/// Temperature coefficient of a platinum RTD.
pub const RTD_ALPHA: f64 = 0.00385;

/// Default current reading floor; anything below is sensor noise.
pub const CURRENT_NOISE_FLOOR_AMPS: f64 = 2.2;

/// Analog voltage span of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageRange {
    /// 0–10 V
    #[default]
    ZeroToTen,
    /// 2–10 V, used by valve actuators and their feedback
    TwoToTen,
}

impl VoltageRange {
    pub const fn bounds(self) -> (f64, f64) {
        match self {
            VoltageRange::ZeroToTen => (0.0, 10.0),
            VoltageRange::TwoToTen => (2.0, 10.0),
        }
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Resistance of the thermistor from the divider voltage.
///
/// The thermistor sits on the supply side of the divider, so a higher
/// measured voltage means a lower thermistor resistance.
pub fn thermistor_resistance(volts: f64, supply: f64, reference_ohms: f64) -> Option<f64> {
    if !(volts > 0.0 && volts < supply) {
        return None;
    }
    Some(reference_ohms * (supply - volts) / volts)
}

/// Temperature in °F of a 10k NTC thermistor with the given resistance.
pub fn steinhart_hart_fahrenheit(ohms: f64) -> Option<f64> {
    if ohms <= 0.0 || !ohms.is_finite() {
        return None;
    }
    let ln_r = ohms.ln();
    let kelvin = 1.0 / (SH_A + SH_B * ln_r + SH_C * ln_r.powi(3));
    Some(celsius_to_fahrenheit(kelvin - 273.15))
}

/// Converts a thermistor divider voltage to °F, applying a calibration offset.
///
/// Returns `None` when the voltage is outside the open interval `(0, supply)`,
/// which indicates an open or shorted sensor.
///
/// # Example
///
/// ```
/// use hvac_sequencer::conversion::thermistor_fahrenheit;
///
/// // Balanced divider: 10 kΩ thermistor, 25 °C
/// let temp = thermistor_fahrenheit(5.0, 0.0).unwrap();
/// assert!((temp - 77.0).abs() < 0.5);
/// ```
pub fn thermistor_fahrenheit(volts: f64, offset: f64) -> Option<f64> {
    thermistor_resistance(volts, THERMISTOR_SUPPLY_VOLTS, THERMISTOR_REFERENCE_OHMS)
        .and_then(steinhart_hart_fahrenheit)
        .map(|temp| temp + offset)
}

/// Converts a 1k platinum RTD resistance to °F using the linear approximation.
pub fn rtd_fahrenheit(ohms: f64, offset: f64) -> Option<f64> {
    if ohms <= 0.0 || !ohms.is_finite() {
        return None;
    }
    let celsius = (ohms - RTD_R0) / (RTD_R0 * RTD_ALPHA);
    Some(celsius_to_fahrenheit(celsius) + offset)
}

/// Scales a voltage within `range` proportionally onto `[min, max]`.
///
/// Voltages outside the range are clamped to its ends.
pub fn scale_voltage(volts: f64, range: VoltageRange, min: f64, max: f64) -> f64 {
    let (low, high) = range.bounds();
    let ratio = ((volts - low) / (high - low)).clamp(0.0, 1.0);
    min + ratio * (max - min)
}

/// Converts a 0–10 V current transducer signal to amps.
///
/// Readings below `noise_floor` are reported as zero.
pub fn current_amps(volts: f64, max_amps: f64, noise_floor: f64) -> f64 {
    let amps = scale_voltage(volts, VoltageRange::ZeroToTen, 0.0, max_amps);
    if amps < noise_floor { 0.0 } else { amps }
}

/// Converts a 0–100 % command to the output voltage for `range`.
pub fn percent_to_volts(percent: f64, range: VoltageRange) -> f64 {
    let (low, high) = range.bounds();
    low + percent.clamp(0.0, 100.0) / 100.0 * (high - low)
}
