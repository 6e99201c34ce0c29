pub mod bus_config;
pub mod sensor_config;

pub use bus_config::{load_bus_config, BusConfig, BusEntry};
pub use sensor_config::{load_sensor_config, DeviceConfig, OutputEntry, SensorConfig, SensorEntry};

use crate::errors::{ConfigError, ConfigResult};
use std::fs;

/// Read a config file, keeping the path in the error
fn read_config(path: &str) -> ConfigResult<String> {
    fs::read_to_string(path).map_err(|source| ConfigError::LoadError {
        path: path.to_string(),
        source,
    })
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}
