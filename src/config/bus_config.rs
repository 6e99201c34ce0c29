use super::{invalid, read_config};
use crate::bus::BusType;
use crate::errors::ConfigResult;
use serde::Deserialize;
use std::collections::HashSet;

/// Root structure for loading `[[bus]]` style TOML config
#[derive(Debug, Deserialize)]
pub struct BusConfig {
    #[serde(rename = "bus", default)]
    pub buses: Vec<BusEntry>,
}

/// One bus entry (an I2C adapter or a simulated bus)
#[derive(Debug, Clone, Deserialize)]
pub struct BusEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub r#type: String, // 'type' is a reserved word in Rust, use raw identifier
    /// Device node for I2C buses, ignored by simulated ones
    #[serde(default)]
    pub path: String,
}

impl BusEntry {
    pub fn bus_type(&self) -> ConfigResult<BusType> {
        BusType::from_str(&self.r#type)
            .ok_or_else(|| invalid(format!("bus.{}.type", self.id), format!("unknown bus type '{}'", self.r#type)))
    }
}

impl BusConfig {
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let parsed: BusConfig = toml::from_str(content)?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for b in &self.buses {
            if !seen.insert(b.id.as_str()) {
                return Err(invalid("bus.id", format!("duplicate bus id '{}'", b.id)));
            }
            if b.bus_type()? == BusType::I2C && b.path.is_empty() {
                return Err(invalid(format!("bus.{}.path", b.id), "I2C buses need a device path"));
            }
        }
        Ok(())
    }
}

/// Load bus config file
pub fn load_bus_config(path: &str) -> ConfigResult<BusConfig> {
    BusConfig::parse(&read_config(path)?)
}
