//! Bridge between raw samples and the vendor fusion library.
//!
//! The library is opaque: it takes timestamped physical inputs and returns
//! virtual sensor signals, keeping an adaptive baseline between calls. The
//! bridge owns the only instance and is the single writer of its state.

pub mod estimator;

pub use estimator::GasBaselineEstimator;

use crate::errors::{FusionError, FusionResult};
use crate::sensors::{Model, RawSample};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Confidence of a fused signal, from unreliable (0) to high (3).
/// Serialized as the numeric level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Accuracy {
    Unreliable = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Accuracy {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Accuracy::Unreliable),
            1 => Some(Accuracy::Low),
            2 => Some(Accuracy::Medium),
            3 => Some(Accuracy::High),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

impl From<Accuracy> for u8 {
    fn from(accuracy: Accuracy) -> Self {
        accuracy.level()
    }
}

impl TryFrom<u8> for Accuracy {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Accuracy::from_level(level).ok_or_else(|| format!("accuracy level {} is not in 0..=3", level))
    }
}

/// Physical input kinds accepted by the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Temperature,
    Humidity,
    Pressure,
    GasResistance,
    HeaterStep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionInput {
    pub kind: InputKind,
    pub signal: f32,
    pub timestamp_ns: u64,
}

/// Virtual sensors produced by the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualSensor {
    Iaq,
    Co2Equivalent,
    BreathVocEquivalent,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionSignal {
    pub sensor: VirtualSensor,
    pub signal: f32,
    pub accuracy: Accuracy,
    pub timestamp_ns: u64,
}

/// Capability interface of a fusion library.
pub trait FusionLibrary: Send {
    /// Prepare the library for `model`, resetting any baseline.
    fn init(&mut self, model: Model) -> FusionResult<()>;

    /// Feed one batch of inputs sharing a timestamp.
    fn do_steps(&mut self, inputs: &[FusionInput]) -> FusionResult<Vec<FusionSignal>>;

    fn serialize_state(&self) -> FusionResult<Vec<u8>>;

    fn restore_state(&mut self, blob: &[u8]) -> FusionResult<()>;

    fn version(&self) -> String;
}

/// One fused value with its confidence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedValue {
    pub value: f32,
    pub accuracy: Accuracy,
}

/// Virtual outputs derived from exactly one raw sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedOutput {
    /// Index for Air Quality, unitless
    pub iaq: FusedValue,
    /// ppm
    pub co2_equivalent: FusedValue,
    /// ppm
    pub breath_voc_equivalent: FusedValue,
}

pub struct FusionBridge {
    library: Box<dyn FusionLibrary>,
    model: Option<Model>,
    processed: u64,
}

impl FusionBridge {
    pub fn new(library: Box<dyn FusionLibrary>) -> Self {
        Self {
            library,
            model: None,
            processed: 0,
        }
    }

    pub fn initialize(&mut self, model: Model) -> FusionResult<()> {
        self.library.init(model).map_err(|e| match e {
            FusionError::Init { .. } => e,
            other => FusionError::Init {
                reason: other.to_string(),
            },
        })?;
        info!("[fusion] {} initialized for {}", self.library.version(), model);
        self.model = Some(model);
        self.processed = 0;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.model.is_some()
    }

    /// Samples successfully fused since initialization
    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn process(&mut self, sample: &RawSample) -> FusionResult<FusedOutput> {
        if !self.is_initialized() {
            return Err(FusionError::NotInitialized);
        }

        let timestamp_ns = sample.timestamp.as_nanos() as u64;
        let input = |kind, signal| FusionInput {
            kind,
            signal,
            timestamp_ns,
        };
        let mut inputs = vec![
            input(InputKind::Temperature, sample.temperature),
            input(InputKind::Humidity, sample.humidity),
            input(InputKind::Pressure, sample.pressure),
            input(InputKind::HeaterStep, sample.heater_step as f32),
        ];
        if sample.gas_valid && sample.heater_stable {
            inputs.push(input(InputKind::GasResistance, sample.gas_resistance));
        }

        let signals = self.library.do_steps(&inputs)?;
        let find = |sensor: VirtualSensor| {
            signals
                .iter()
                .find(|s| s.sensor == sensor)
                .map(|s| FusedValue {
                    value: s.signal,
                    accuracy: s.accuracy,
                })
                .ok_or_else(|| FusionError::Process {
                    reason: format!("library returned no {:?} output", sensor),
                })
        };
        let output = FusedOutput {
            iaq: find(VirtualSensor::Iaq)?,
            co2_equivalent: find(VirtualSensor::Co2Equivalent)?,
            breath_voc_equivalent: find(VirtualSensor::BreathVocEquivalent)?,
        };

        self.processed += 1;
        debug!(
            "[fusion] iaq={:.1} ({:?}) co2eq={:.0} bvoc={:.2}",
            output.iaq.value, output.iaq.accuracy, output.co2_equivalent.value, output.breath_voc_equivalent.value
        );
        Ok(output)
    }

    /// Serialize the library's baseline so it survives restarts.
    pub fn save_state(&self) -> FusionResult<Vec<u8>> {
        if !self.is_initialized() {
            return Err(FusionError::NotInitialized);
        }
        self.library.serialize_state()
    }

    pub fn load_state(&mut self, blob: &[u8]) -> FusionResult<()> {
        if !self.is_initialized() {
            return Err(FusionError::NotInitialized);
        }
        self.library.restore_state(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(seconds: u64, gas: f32) -> RawSample {
        RawSample {
            temperature: 21.0,
            pressure: 1013.25,
            humidity: 45.0,
            gas_resistance: gas,
            gas_valid: true,
            heater_stable: true,
            heater_step: 0,
            timestamp: Duration::from_secs(seconds),
        }
    }

    fn bridge() -> FusionBridge {
        let mut bridge = FusionBridge::new(Box::new(GasBaselineEstimator::new()));
        bridge.initialize(Model::Bme688).unwrap();
        bridge
    }

    /// Library that never reports a breath-VOC signal
    struct PartialLibrary;

    impl FusionLibrary for PartialLibrary {
        fn init(&mut self, _model: Model) -> FusionResult<()> {
            Ok(())
        }

        fn do_steps(&mut self, inputs: &[FusionInput]) -> FusionResult<Vec<FusionSignal>> {
            let timestamp_ns = inputs[0].timestamp_ns;
            Ok(vec![
                FusionSignal { sensor: VirtualSensor::Iaq, signal: 50.0, accuracy: Accuracy::Low, timestamp_ns },
                FusionSignal { sensor: VirtualSensor::Co2Equivalent, signal: 600.0, accuracy: Accuracy::Low, timestamp_ns },
            ])
        }

        fn serialize_state(&self) -> FusionResult<Vec<u8>> {
            Ok(Vec::new())
        }

        fn restore_state(&mut self, _blob: &[u8]) -> FusionResult<()> {
            Ok(())
        }

        fn version(&self) -> String {
            "partial".to_string()
        }
    }

    #[test]
    fn test_process_requires_initialize() {
        let mut bridge = FusionBridge::new(Box::new(GasBaselineEstimator::new()));
        assert_eq!(bridge.process(&sample(1, 250000.0)), Err(FusionError::NotInitialized));
        assert_eq!(bridge.save_state(), Err(FusionError::NotInitialized));
        assert!(!bridge.is_initialized());
        bridge.initialize(Model::Bme690).unwrap();
        assert!(bridge.is_initialized());
    }

    #[test]
    fn test_process_is_deterministic_for_identical_state() {
        let mut a = bridge();
        let mut b = bridge();
        for (i, gas) in [240000.0, 260000.0, 250000.0].into_iter().enumerate() {
            a.process(&sample(i as u64 + 1, gas)).unwrap();
            b.process(&sample(i as u64 + 1, gas)).unwrap();
        }
        let next = sample(10, 180000.0);
        assert_eq!(a.process(&next).unwrap(), b.process(&next).unwrap());
        assert_eq!(a.processed(), 4);
    }

    #[test]
    fn test_state_round_trip_reproduces_output() {
        let mut saved = bridge();
        for i in 1..=30 {
            saved.process(&sample(i * 3, 200000.0 + (i as f32) * 1000.0)).unwrap();
        }
        let blob = saved.save_state().unwrap();

        let mut restored = bridge();
        restored.load_state(&blob).unwrap();

        let next = sample(100, 150000.0);
        assert_eq!(saved.process(&next).unwrap(), restored.process(&next).unwrap());
    }

    #[test]
    fn test_state_evolves_between_calls() {
        let mut bridge = bridge();
        let first = bridge.process(&sample(1, 300000.0)).unwrap();
        bridge.process(&sample(2, 300000.0)).unwrap();
        // Same reading against a moved baseline
        let polluted_first = {
            let mut fresh = self::bridge();
            fresh.process(&sample(1, 100000.0)).unwrap()
        };
        let polluted_later = bridge.process(&sample(3, 100000.0)).unwrap();
        assert_ne!(polluted_first, polluted_later);
        assert!(first.iaq.value <= polluted_later.iaq.value);
    }

    #[test]
    fn test_missing_virtual_output_is_process_error() {
        let mut bridge = FusionBridge::new(Box::new(PartialLibrary));
        bridge.initialize(Model::Bme680).unwrap();
        assert!(matches!(bridge.process(&sample(1, 1.0)), Err(FusionError::Process { .. })));
    }

    #[test]
    fn test_invalid_gas_is_not_fed() {
        let mut bridge = bridge();
        let mut s = sample(1, 250000.0);
        s.heater_stable = false;
        assert!(matches!(bridge.process(&s), Err(FusionError::Process { .. })));
    }

    #[test]
    fn test_accuracy_levels() {
        assert_eq!(Accuracy::from_level(3), Some(Accuracy::High));
        assert_eq!(Accuracy::from_level(4), None);
        assert_eq!(Accuracy::Medium.level(), 2);
    }
}
