//! Heater profiles and measurement settings.

use super::model::Model;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Oversampling settings for temperature, pressure and humidity.
///
/// Higher oversampling reduces noise but lengthens the conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Oversampling {
    /// Disables the channel entirely.
    Skipped = 0,
    #[default]
    X1 = 1,
    X2 = 2,
    X4 = 3,
    X8 = 4,
    X16 = 5,
}

impl Oversampling {
    /// ADC cycles spent for this setting
    pub fn cycles(self) -> u32 {
        match self {
            Oversampling::Skipped => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
            Oversampling::X16 => 16,
        }
    }
}

/// IIR filter coefficient for temperature and pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum IirFilter {
    #[default]
    Off = 0,
    C1 = 1,
    C3 = 2,
    C7 = 3,
    C15 = 4,
    C31 = 5,
    C63 = 6,
    C127 = 7,
}

/// Grouped oversampling settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OversamplingConfig {
    pub temperature: Oversampling,
    pub pressure: Oversampling,
    pub humidity: Oversampling,
}

impl Default for OversamplingConfig {
    fn default() -> Self {
        Self {
            temperature: Oversampling::X2,
            pressure: Oversampling::X1,
            humidity: Oversampling::X1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeasurementSettings {
    pub oversampling: OversamplingConfig,
    pub iir_filter: IirFilter,
}

/// One heater set point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaterStep {
    /// Target plate temperature in °C
    pub temperature: u16,
    /// Time the plate is held at the target before the gas reading
    pub duration_ms: u16,
}

/// Sequence of heater set points; forced measurements walk it one step at
/// a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaterProfile {
    steps: Vec<HeaterStep>,
}

/// Profile used when nothing is configured
pub const DEFAULT_HEATER_STEP: HeaterStep = HeaterStep {
    temperature: 320,
    duration_ms: 150,
};

impl Default for HeaterProfile {
    fn default() -> Self {
        Self {
            steps: vec![DEFAULT_HEATER_STEP],
        }
    }
}

impl HeaterProfile {
    pub fn new(steps: Vec<HeaterStep>) -> Self {
        Self { steps }
    }

    pub fn single(temperature: u16, duration_ms: u16) -> Self {
        Self::new(vec![HeaterStep {
            temperature,
            duration_ms,
        }])
    }

    pub fn steps(&self) -> &[HeaterStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check the profile against the limits of `model`.
    pub fn validate(&self, model: Model) -> Result<(), String> {
        let spec = model.spec();
        if self.steps.is_empty() {
            return Err("heater profile has no steps".to_string());
        }
        if self.steps.len() > spec.max_heater_steps {
            return Err(format!(
                "{} supports at most {} heater step(s), got {}",
                spec.name,
                spec.max_heater_steps,
                self.steps.len()
            ));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.temperature < spec.min_heater_temp_c || step.temperature > spec.max_heater_temp_c {
                return Err(format!(
                    "step {}: heater temperature {} °C outside {}..={} °C",
                    i, step.temperature, spec.min_heater_temp_c, spec.max_heater_temp_c
                ));
            }
            if step.duration_ms == 0 || step.duration_ms > spec.max_heater_duration_ms {
                return Err(format!(
                    "step {}: heater duration {} ms outside 1..={} ms",
                    i, step.duration_ms, spec.max_heater_duration_ms
                ));
            }
        }
        Ok(())
    }
}

/// Encode a heater duration into the gas_wait register format: 6-bit
/// mantissa and a 2-bit multiplier of 1, 4, 16 or 64 ms. The smallest
/// multiplier that fits is used, so precision is only lost above 63 ms.
pub fn encode_gas_wait(duration_ms: u16) -> u8 {
    if duration_ms >= 0xFC0 {
        return 0xFF;
    }
    let mut base = duration_ms;
    let mut factor = 0u8;
    while base > 0x3F {
        base /= 4;
        factor += 1;
    }
    base as u8 | (factor << 6)
}

/// Time the device needs for the T/P/H conversion in forced mode,
/// excluding the heater phase.
pub fn tph_conversion_time(oversampling: &OversamplingConfig) -> Duration {
    let cycles = oversampling.temperature.cycles()
        + oversampling.pressure.cycles()
        + oversampling.humidity.cycles();
    let mut micros = cycles * 1963;
    micros += 477 * 4; // TPH switching
    micros += 477 * 5; // gas measurement
    micros += 1000; // wake up from sleep
    Duration::from_micros(micros as u64)
}
