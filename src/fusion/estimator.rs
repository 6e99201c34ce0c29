//! Stand-in fusion library used when the vendor binary is not linked.
//!
//! It tracks an adaptive clean-air gas baseline and scores each reading
//! against it, with a humidity contribution. Accuracy grows with the number
//! of samples seen, so a restored state keeps its confidence.

use super::{Accuracy, FusionInput, FusionLibrary, FusionSignal, InputKind, VirtualSensor};
use crate::errors::{FusionError, FusionResult};
use crate::sensors::Model;
use serde::{Deserialize, Serialize};

const STATE_VERSION: u32 = 1;
const DEFAULT_BURN_IN_SAMPLES: u64 = 20;
/// Fraction of the gap closed per sample when readings fall below baseline
const BASELINE_DRIFT: f32 = 0.002;
const HUMIDITY_REFERENCE: f32 = 40.0;
const GAS_WEIGHT: f32 = 75.0;
const HUMIDITY_WEIGHT: f32 = 25.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EstimatorState {
    version: u32,
    model: Model,
    gas_baseline: Option<f32>,
    samples: u64,
    /// Timestamps restart with the process, so this is not persisted
    #[serde(skip)]
    last_timestamp_ns: Option<u64>,
}

impl EstimatorState {
    fn new(model: Model) -> Self {
        Self {
            version: STATE_VERSION,
            model,
            gas_baseline: None,
            samples: 0,
            last_timestamp_ns: None,
        }
    }
}

pub struct GasBaselineEstimator {
    burn_in: u64,
    state: Option<EstimatorState>,
}

impl Default for GasBaselineEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl GasBaselineEstimator {
    pub fn new() -> Self {
        Self::with_burn_in(DEFAULT_BURN_IN_SAMPLES)
    }

    /// Samples needed before the baseline leaves the unreliable stage.
    pub fn with_burn_in(samples: u64) -> Self {
        Self {
            burn_in: samples.max(1),
            state: None,
        }
    }

    fn accuracy(&self, samples: u64) -> Accuracy {
        if samples < self.burn_in {
            Accuracy::Unreliable
        } else if samples < 2 * self.burn_in {
            Accuracy::Low
        } else if samples < 4 * self.burn_in {
            Accuracy::Medium
        } else {
            Accuracy::High
        }
    }
}

fn process_error(reason: impl Into<String>) -> FusionError {
    FusionError::Process {
        reason: reason.into(),
    }
}

fn humidity_score(humidity: f32) -> f32 {
    let score = if humidity >= HUMIDITY_REFERENCE {
        (100.0 - humidity) / (100.0 - HUMIDITY_REFERENCE) * HUMIDITY_WEIGHT
    } else {
        humidity / HUMIDITY_REFERENCE * HUMIDITY_WEIGHT
    };
    score.clamp(0.0, HUMIDITY_WEIGHT)
}

impl FusionLibrary for GasBaselineEstimator {
    fn init(&mut self, model: Model) -> FusionResult<()> {
        self.state = Some(EstimatorState::new(model));
        Ok(())
    }

    fn do_steps(&mut self, inputs: &[FusionInput]) -> FusionResult<Vec<FusionSignal>> {
        let burn_in = self.burn_in;
        let state = self.state.as_mut().ok_or(FusionError::NotInitialized)?;

        let timestamp_ns = inputs
            .first()
            .map(|i| i.timestamp_ns)
            .ok_or_else(|| process_error("no inputs"))?;
        if inputs.iter().any(|i| i.timestamp_ns != timestamp_ns) {
            return Err(process_error("inputs carry different timestamps"));
        }
        if let Some(last) = state.last_timestamp_ns {
            if timestamp_ns <= last {
                return Err(process_error(format!(
                    "timestamp {} ns does not advance past {} ns",
                    timestamp_ns, last
                )));
            }
        }
        if let Some(bad) = inputs.iter().find(|i| !i.signal.is_finite()) {
            return Err(process_error(format!("{:?} is not finite", bad.kind)));
        }

        let signal = |kind: InputKind| inputs.iter().find(|i| i.kind == kind).map(|i| i.signal);
        let humidity = signal(InputKind::Humidity).ok_or_else(|| process_error("missing humidity"))?;
        signal(InputKind::Temperature).ok_or_else(|| process_error("missing temperature"))?;
        let gas = signal(InputKind::GasResistance)
            .ok_or_else(|| process_error("no valid gas resistance in this step"))?;
        if gas <= 0.0 {
            return Err(process_error(format!("gas resistance {} Ω", gas)));
        }

        state.samples += 1;
        state.last_timestamp_ns = Some(timestamp_ns);
        let baseline = match state.gas_baseline {
            None => gas,
            Some(b) if state.samples <= burn_in || gas > b => b.max(gas),
            Some(b) => b + (gas - b) * BASELINE_DRIFT,
        };
        state.gas_baseline = Some(baseline);
        let samples = state.samples;

        let ratio = (gas / baseline).min(1.0);
        let quality = ratio * GAS_WEIGHT + humidity_score(humidity);
        let iaq = ((100.0 - quality) * 5.0).clamp(0.0, 500.0);
        let co2_equivalent = 400.0 + iaq * 4.0;
        let breath_voc_equivalent = 0.5 * 10f32.powf(iaq / 250.0);

        let accuracy = self.accuracy(samples);
        let out = |sensor, signal| FusionSignal {
            sensor,
            signal,
            accuracy,
            timestamp_ns,
        };
        Ok(vec![
            out(VirtualSensor::Iaq, iaq),
            out(VirtualSensor::Co2Equivalent, co2_equivalent),
            out(VirtualSensor::BreathVocEquivalent, breath_voc_equivalent),
        ])
    }

    fn serialize_state(&self) -> FusionResult<Vec<u8>> {
        let state = self.state.as_ref().ok_or(FusionError::NotInitialized)?;
        serde_json::to_vec(state).map_err(|e| FusionError::State {
            reason: e.to_string(),
        })
    }

    fn restore_state(&mut self, blob: &[u8]) -> FusionResult<()> {
        let current = self.state.as_ref().ok_or(FusionError::NotInitialized)?;
        let restored: EstimatorState = serde_json::from_slice(blob).map_err(|e| FusionError::State {
            reason: e.to_string(),
        })?;
        if restored.version != STATE_VERSION {
            return Err(FusionError::State {
                reason: format!("state version {} is not {}", restored.version, STATE_VERSION),
            });
        }
        if restored.model != current.model {
            return Err(FusionError::State {
                reason: format!("state belongs to {}, library runs {}", restored.model, current.model),
            });
        }
        self.state = Some(restored);
        Ok(())
    }

    fn version(&self) -> String {
        format!("gas-baseline-estimator v{}", STATE_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(ts: u64, humidity: f32, gas: Option<f32>) -> Vec<FusionInput> {
        let mut v = vec![
            FusionInput { kind: InputKind::Temperature, signal: 21.0, timestamp_ns: ts },
            FusionInput { kind: InputKind::Humidity, signal: humidity, timestamp_ns: ts },
        ];
        if let Some(gas) = gas {
            v.push(FusionInput { kind: InputKind::GasResistance, signal: gas, timestamp_ns: ts });
        }
        v
    }

    fn iaq(signals: &[FusionSignal]) -> &FusionSignal {
        signals.iter().find(|s| s.sensor == VirtualSensor::Iaq).unwrap()
    }

    #[test]
    fn test_requires_init() {
        let mut lib = GasBaselineEstimator::new();
        assert_eq!(lib.do_steps(&inputs(1, 45.0, Some(1.0))), Err(FusionError::NotInitialized));
    }

    #[test]
    fn test_accuracy_rises_with_samples() {
        let mut lib = GasBaselineEstimator::with_burn_in(2);
        lib.init(Model::Bme688).unwrap();
        let levels: Vec<Accuracy> = (1..=8)
            .map(|ts| iaq(&lib.do_steps(&inputs(ts, 45.0, Some(250000.0))).unwrap()).accuracy)
            .collect();
        assert_eq!(
            levels,
            vec![
                Accuracy::Unreliable,
                Accuracy::Low,
                Accuracy::Low,
                Accuracy::Medium,
                Accuracy::Medium,
                Accuracy::Medium,
                Accuracy::Medium,
                Accuracy::High,
            ]
        );
    }

    #[test]
    fn test_lower_gas_resistance_means_worse_air() {
        let mut lib = GasBaselineEstimator::new();
        lib.init(Model::Bme680).unwrap();
        let clean = iaq(&lib.do_steps(&inputs(1, 45.0, Some(300000.0))).unwrap()).signal;
        let dirty = iaq(&lib.do_steps(&inputs(2, 45.0, Some(60000.0))).unwrap()).signal;
        assert!(dirty > clean);
        assert!((0.0..=500.0).contains(&dirty));
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut lib = GasBaselineEstimator::new();
        lib.init(Model::Bme688).unwrap();
        lib.do_steps(&inputs(10, 45.0, Some(250000.0))).unwrap();

        let stale = lib.do_steps(&inputs(10, 45.0, Some(250000.0)));
        assert!(matches!(stale, Err(FusionError::Process { .. })));
        let nan = lib.do_steps(&inputs(11, f32::NAN, Some(250000.0)));
        assert!(matches!(nan, Err(FusionError::Process { .. })));
        let no_gas = lib.do_steps(&inputs(12, 45.0, None));
        assert!(matches!(no_gas, Err(FusionError::Process { .. })));
    }

    #[test]
    fn test_restore_rejects_other_model_and_garbage() {
        let mut a = GasBaselineEstimator::new();
        a.init(Model::Bme680).unwrap();
        let blob = a.serialize_state().unwrap();

        let mut b = GasBaselineEstimator::new();
        b.init(Model::Bme688).unwrap();
        assert!(matches!(b.restore_state(&blob), Err(FusionError::State { .. })));
        assert!(matches!(b.restore_state(b"not json"), Err(FusionError::State { .. })));
    }
}
