use crate::bus::i2c::I2CBus;
use crate::bus::{BusType, SharedBus};
use crate::config::{BusConfig, BusEntry, SensorConfig, SensorEntry};
use crate::dispatch::{OutputChannel, OutputDispatcher, ValueSink};
use crate::errors::{RegistryError, RegistryResult};
use crate::fusion::{FusionBridge, GasBaselineEstimator};
use crate::scheduler::{Bme68xComponent, CyclePolicy};
use crate::sensors::Bme68x;
use crate::state_store::FileStateStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Open every configured bus, then build and set up one component per sensor.
pub async fn init_all(
    sensor_config: &SensorConfig,
    bus_config: &BusConfig,
    sink: Arc<dyn ValueSink>,
) -> RegistryResult<Vec<Bme68xComponent<SharedBus>>> {
    let mut bus_map = HashMap::new();
    for b in bus_config.buses.iter() {
        let bus = open_bus(b, sensor_config)?;
        info!("[registry] bus '{}' opened ({})", b.id, b.r#type);
        bus_map.insert(b.id.clone(), bus);
    }

    let mut components = Vec::new();
    info!("[registry] initializing {} sensors...", sensor_config.sensors.len());
    for s in sensor_config.sensors.iter() {
        let bus = bus_map
            .get(&s.bus)
            .ok_or_else(|| RegistryError::BusNotFound { bus: s.bus.clone() })?;
        info!(
            "[registry] registering sensor: id={} model={} bus={} address={:#04x}",
            s.id, s.model, s.bus, s.address
        );

        let mut component = build_component(s, bus.clone(), sink.clone())?;
        component
            .setup(Instant::now())
            .await
            .map_err(|source| RegistryError::SetupError {
                sensor: s.id.clone(),
                source,
            })?;
        components.push(component);
    }

    Ok(components)
}

fn open_bus(entry: &BusEntry, sensor_config: &SensorConfig) -> RegistryResult<SharedBus> {
    match entry.bus_type()? {
        BusType::I2C => {
            let bus = I2CBus::new(&entry.path).map_err(|source| RegistryError::BusOpenError {
                bus: entry.id.clone(),
                source,
            })?;
            debug!("[registry] bus '{}' uses {}", entry.id, bus.path());
            Ok(SharedBus::new(entry.id.clone(), Box::new(bus)))
        }
        #[cfg(any(test, feature = "simulator"))]
        BusType::Simulated => {
            let bus = crate::bus::sim::SimulatedBus::new();
            for s in sensor_config.sensors.iter().filter(|s| s.bus == entry.id) {
                bus.attach(s.address, s.model);
            }
            Ok(SharedBus::new(entry.id.clone(), Box::new(bus)))
        }
        #[cfg(not(any(test, feature = "simulator")))]
        BusType::Simulated => {
            let _ = sensor_config;
            Err(RegistryError::UnsupportedBus {
                bus: entry.id.clone(),
                kind: entry.r#type.clone(),
            })
        }
    }
}

fn build_component(
    entry: &SensorEntry,
    bus: SharedBus,
    sink: Arc<dyn ValueSink>,
) -> RegistryResult<Bme68xComponent<SharedBus>> {
    let driver = Bme68x::new(entry.id.clone(), entry.address, entry.model, bus)
        .with_settings(entry.measurement_settings())
        .with_ambient_temperature(entry.ambient_temperature)
        .with_heater_profile(entry.heater_profile())
        .map_err(|source| RegistryError::SetupError {
            sensor: entry.id.clone(),
            source: source.into(),
        })?;

    let mut dispatcher = OutputDispatcher::new(entry.id.clone());
    for (kind, overrides) in &entry.outputs {
        let mut channel = OutputChannel::new(*kind, sink.clone());
        if let Some(name) = &overrides.name {
            channel = channel.with_name(name.clone());
        }
        if let Some(decimals) = overrides.accuracy_decimals {
            channel = channel.with_decimals(decimals);
        }
        dispatcher.add_channel(channel);
    }

    let fusion = FusionBridge::new(Box::new(GasBaselineEstimator::new()));
    let component = Bme68xComponent::new(
        entry.device_config(),
        driver,
        fusion,
        dispatcher,
        CyclePolicy::from(entry),
    );
    Ok(match &entry.state_file {
        Some(path) => {
            let store = FileStateStore::new(path);
            debug!("[registry] sensor '{}' keeps fusion state in {}", entry.id, store.path().display());
            component.with_state_store(Box::new(store))
        }
        None => component,
    })
}
