use super::{invalid, read_config};
use crate::dispatch::OutputKind;
use crate::errors::ConfigResult;
use crate::sensors::heater::DEFAULT_HEATER_STEP;
use crate::sensors::{HeaterProfile, HeaterStep, IirFilter, MeasurementSettings, Model, OversamplingConfig};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

/// Root configuration struct expecting `[[sensor]]` TOML array format
#[derive(Debug, Deserialize)]
pub struct SensorConfig {
    #[serde(rename = "sensor", default)]
    pub sensors: Vec<SensorEntry>,
}

/// One sensor entry, matching each `[[sensor]]` section
#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub id: String,
    pub model: Model,
    pub bus: String,
    #[serde(default = "default_address")]
    pub address: u8,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
    #[serde(default = "default_max_read_attempts")]
    pub max_read_attempts: u32,
    #[serde(default = "default_read_backoff_ms")]
    pub read_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub publish_raw_on_fusion_failure: bool,
    /// °C, used for the heater resistance calculation
    #[serde(default = "default_ambient_temperature")]
    pub ambient_temperature: i32,
    #[serde(default)]
    pub oversampling: OversamplingConfig,
    #[serde(default)]
    pub iir_filter: IirFilter,
    #[serde(rename = "heater", default = "default_heater")]
    pub heater: Vec<HeaterStep>,
    /// Fusion state file; state is not persisted when unset
    pub state_file: Option<String>,
    #[serde(default = "default_state_save_interval_s")]
    pub state_save_interval_s: u64,
    /// Run the device self-test during setup
    #[serde(default)]
    pub self_test: bool,
    #[serde(default)]
    pub outputs: BTreeMap<OutputKind, OutputEntry>,
}

/// Per-channel overrides, e.g. `[sensor.outputs.iaq]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputEntry {
    pub name: Option<String>,
    pub accuracy_decimals: Option<u8>,
}

/// Immutable device description handed to a component
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    pub model: Model,
    pub address: u8,
    pub outputs: BTreeSet<OutputKind>,
    pub sample_interval: Duration,
    pub self_test: bool,
}

fn default_address() -> u8 {
    0x77
}

fn default_update_interval_ms() -> u64 {
    3000
}

fn default_loop_interval_ms() -> u64 {
    10
}

fn default_max_read_attempts() -> u32 {
    3
}

fn default_read_backoff_ms() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_ambient_temperature() -> i32 {
    25
}

fn default_heater() -> Vec<HeaterStep> {
    vec![DEFAULT_HEATER_STEP]
}

fn default_state_save_interval_s() -> u64 {
    6 * 60 * 60
}

const MAX_DECIMALS: u8 = 6;

impl SensorEntry {
    pub fn heater_profile(&self) -> HeaterProfile {
        HeaterProfile::new(self.heater.clone())
    }

    pub fn measurement_settings(&self) -> MeasurementSettings {
        MeasurementSettings {
            oversampling: self.oversampling,
            iir_filter: self.iir_filter,
        }
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            id: self.id.clone(),
            model: self.model,
            address: self.address,
            outputs: self.outputs.keys().copied().collect(),
            sample_interval: Duration::from_millis(self.update_interval_ms),
            self_test: self.self_test,
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        let field = |name: &str| format!("sensor.{}.{}", self.id, name);

        if self.id.trim().is_empty() {
            return Err(invalid("sensor.id", "must not be empty"));
        }
        if !matches!(self.address, 0x76 | 0x77) {
            return Err(invalid(
                field("address"),
                format!("{:#04x} is not a BME68x address (0x76 or 0x77)", self.address),
            ));
        }
        if self.update_interval_ms == 0 {
            return Err(invalid(field("update_interval_ms"), "must be positive"));
        }
        if self.loop_interval_ms == 0 || self.loop_interval_ms > self.update_interval_ms {
            return Err(invalid(
                field("loop_interval_ms"),
                "must be positive and no longer than update_interval_ms",
            ));
        }
        if self.max_read_attempts == 0 {
            return Err(invalid(field("max_read_attempts"), "at least one attempt is needed"));
        }
        if self.state_save_interval_s == 0 {
            return Err(invalid(field("state_save_interval_s"), "must be positive"));
        }
        if !(-40..=85).contains(&self.ambient_temperature) {
            return Err(invalid(field("ambient_temperature"), "outside the -40..85 °C operating range"));
        }
        self.heater_profile()
            .validate(self.model)
            .map_err(|reason| invalid(field("heater"), reason))?;
        for (kind, entry) in &self.outputs {
            if entry.accuracy_decimals.is_some_and(|d| d > MAX_DECIMALS) {
                return Err(invalid(
                    field(&format!("outputs.{}.accuracy_decimals", kind)),
                    format!("at most {} decimals", MAX_DECIMALS),
                ));
            }
            if entry.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
                return Err(invalid(field(&format!("outputs.{}.name", kind)), "must not be empty"));
            }
        }
        Ok(())
    }
}

impl SensorConfig {
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let parsed: SensorConfig = toml::from_str(content)?;
        let mut ids = HashSet::new();
        for s in &parsed.sensors {
            s.validate()?;
            if !ids.insert(s.id.as_str()) {
                return Err(invalid("sensor.id", format!("duplicate sensor id '{}'", s.id)));
            }
        }
        Ok(parsed)
    }
}

/// Loads config from TOML file
pub fn load_sensor_config(path: &str) -> ConfigResult<SensorConfig> {
    SensorConfig::parse(&read_config(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigError;
    use crate::sensors::Oversampling;

    const MINIMAL: &str = r#"
        [[sensor]]
        id = "bme0"
        model = "BME688"
        bus = "i2c1"
    "#;

    #[test]
    fn test_defaults() {
        let cfg = SensorConfig::parse(MINIMAL).unwrap();
        let s = &cfg.sensors[0];
        assert_eq!(s.address, 0x77);
        assert_eq!(s.update_interval_ms, 3000);
        assert_eq!(s.loop_interval_ms, 10);
        assert_eq!(s.max_read_attempts, 3);
        assert_eq!(s.read_backoff_ms, 10);
        assert!(s.publish_raw_on_fusion_failure);
        assert_eq!(s.heater, vec![DEFAULT_HEATER_STEP]);
        assert_eq!(s.state_save_interval_s, 21600);
        assert_eq!(s.state_file, None);
        assert!(!s.self_test);
        assert!(s.outputs.is_empty());
        assert_eq!(s.oversampling, OversamplingConfig::default());
    }

    #[test]
    fn test_full_entry() {
        let cfg = SensorConfig::parse(
            r#"
            [[sensor]]
            id = "bme1"
            model = "BME680"
            bus = "i2c1"
            address = 0x76
            update_interval_ms = 1000
            publish_raw_on_fusion_failure = false
            iir_filter = "c3"
            state_file = "/var/lib/hub/bme1.json"
            self_test = true

            [sensor.oversampling]
            temperature = "x4"

            [[sensor.heater]]
            temperature = 300
            duration_ms = 100

            [sensor.outputs.temperature]
            accuracy_decimals = 1

            [sensor.outputs.iaq]
            name = "air_quality"
            "#,
        )
        .unwrap();
        let s = &cfg.sensors[0];
        assert_eq!(s.model, Model::Bme680);
        assert_eq!(s.iir_filter, IirFilter::C3);
        assert_eq!(s.oversampling.temperature, Oversampling::X4);
        assert_eq!(s.heater_profile(), HeaterProfile::single(300, 100));
        assert_eq!(s.outputs[&OutputKind::Iaq].name.as_deref(), Some("air_quality"));

        let device = s.device_config();
        assert_eq!(device.address, 0x76);
        assert_eq!(device.sample_interval, Duration::from_secs(1));
        assert!(device.self_test);
        assert_eq!(
            device.outputs.into_iter().collect::<Vec<_>>(),
            vec![OutputKind::Temperature, OutputKind::Iaq]
        );
    }

    fn invalid_field(content: &str) -> String {
        match SensorConfig::parse(content) {
            Err(ConfigError::InvalidValue { field, .. }) => field,
            other => panic!("expected InvalidValue, got {:?}", other.map(|c| c.sensors.len())),
        }
    }

    #[test]
    fn test_validation_names_the_field() {
        assert_eq!(invalid_field(&format!("{}address = 0x10\n", MINIMAL)), "sensor.bme0.address");
        assert_eq!(invalid_field(&format!("{}max_read_attempts = 0\n", MINIMAL)), "sensor.bme0.max_read_attempts");
        assert_eq!(
            invalid_field(&format!("{}[[sensor.heater]]\ntemperature = 500\nduration_ms = 100\n", MINIMAL)),
            "sensor.bme0.heater"
        );
        assert_eq!(invalid_field(&format!("{}{}", MINIMAL, MINIMAL)), "sensor.id");
    }

    #[test]
    fn test_unknown_model_and_output_are_format_errors() {
        let bad_model = MINIMAL.replace("BME688", "BME280");
        assert!(matches!(SensorConfig::parse(&bad_model), Err(ConfigError::FormatError(_))));
        let bad_output = format!("{}[sensor.outputs.co2]\n", MINIMAL);
        assert!(matches!(SensorConfig::parse(&bad_output), Err(ConfigError::FormatError(_))));
    }
}
