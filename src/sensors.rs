pub mod bme68x;
pub mod calib;
pub mod heater;
pub mod model;
pub mod registers;

pub use bme68x::{Bme68x, DriverState};
pub use heater::{HeaterProfile, HeaterStep, IirFilter, MeasurementSettings, Oversampling, OversamplingConfig};
pub use model::Model;

use std::time::Duration;

/// One compensated measurement, produced once per completed cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// °C
    pub temperature: f32,
    /// hPa
    pub pressure: f32,
    /// %RH
    pub humidity: f32,
    /// Ω
    pub gas_resistance: f32,
    /// The device flagged the gas conversion as valid
    pub gas_valid: bool,
    /// The heater plate reached its target temperature
    pub heater_stable: bool,
    /// Heater profile step used for this measurement
    pub heater_step: u8,
    /// Monotonic time since the component started
    pub timestamp: Duration,
}
