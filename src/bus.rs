pub mod i2c;
#[cfg(any(test, feature = "simulator"))]
pub mod sim;

use crate::errors::BusResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Register-block access to devices on an I2C bus.
///
/// Implementations perform exactly one bus transaction per call and never
/// retry; failures go straight back to the caller. A call may block for a
/// bounded, bus-specific time while other peripherals hold the bus.
#[async_trait]
pub trait I2cTransport: Send {
    /// Read `len` consecutive registers starting at `start_reg`.
    async fn read_registers(&mut self, address: u8, start_reg: u8, len: usize) -> BusResult<Vec<u8>>;

    /// Write `data` to consecutive registers starting at `start_reg`.
    async fn write_registers(&mut self, address: u8, start_reg: u8, data: &[u8]) -> BusResult<()>;
}

#[async_trait]
impl<T: I2cTransport + ?Sized> I2cTransport for Box<T> {
    async fn read_registers(&mut self, address: u8, start_reg: u8, len: usize) -> BusResult<Vec<u8>> {
        (**self).read_registers(address, start_reg, len).await
    }

    async fn write_registers(&mut self, address: u8, start_reg: u8, data: &[u8]) -> BusResult<()> {
        (**self).write_registers(address, start_reg, data).await
    }
}

/// Bus type enum for the supported transports
#[derive(Debug, Clone, PartialEq)]
pub enum BusType {
    I2C,
    Simulated,
}

impl BusType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "i2c" => Some(BusType::I2C),
            "sim" | "simulated" => Some(BusType::Simulated),
            _ => None,
        }
    }
}

/// Cloneable handle to a bus shared by several peripherals.
///
/// The lock is held for one transaction only, so devices on the same bus
/// interleave their transfers.
#[derive(Clone)]
pub struct SharedBus {
    id: String,
    inner: Arc<Mutex<Box<dyn I2cTransport>>>,
}

impl SharedBus {
    pub fn new(id: impl Into<String>, transport: Box<dyn I2cTransport>) -> Self {
        Self {
            id: id.into(),
            inner: Arc::new(Mutex::new(transport)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl I2cTransport for SharedBus {
    async fn read_registers(&mut self, address: u8, start_reg: u8, len: usize) -> BusResult<Vec<u8>> {
        let mut bus = self.inner.lock().await;
        bus.read_registers(address, start_reg, len).await
    }

    async fn write_registers(&mut self, address: u8, start_reg: u8, data: &[u8]) -> BusResult<()> {
        let mut bus = self.inner.lock().await;
        bus.write_registers(address, start_reg, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimulatedBus;
    use super::*;
    use crate::sensors::model::Model;

    #[test]
    fn test_bus_type_parsing() {
        assert_eq!(BusType::from_str("I2C"), Some(BusType::I2C));
        assert_eq!(BusType::from_str("sim"), Some(BusType::Simulated));
        assert_eq!(BusType::from_str("spi"), None);
    }

    #[tokio::test]
    async fn test_shared_bus_clones_reach_same_device() {
        let sim = SimulatedBus::new();
        sim.attach(0x77, Model::Bme688);
        let mut first = SharedBus::new("i2c0", Box::new(sim));
        let mut second = first.clone();

        first.write_registers(0x77, 0x72, &[0x05]).await.unwrap();
        let value = second.read_registers(0x77, 0x72, 1).await.unwrap();
        assert_eq!(value, vec![0x05]);
        assert_eq!(second.id(), "i2c0");
    }
}
