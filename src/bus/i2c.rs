use crate::bus::I2cTransport;
use crate::errors::{BusError, BusResult};
use async_trait::async_trait;
#[cfg(target_os = "linux")]
use i2cdev::core::I2CDevice;
#[cfg(target_os = "linux")]
use i2cdev::linux::LinuxI2CDevice;

/// SMBus block transfers are limited to 32 bytes.
#[cfg(target_os = "linux")]
const MAX_BLOCK_LEN: usize = 32;

/// Linux `/dev/i2c-N` bus adapter
#[cfg(target_os = "linux")]
pub struct I2CBus {
    device: LinuxI2CDevice,
    path: String,
}

#[cfg(not(target_os = "linux"))]
pub struct I2CBus {
    path: String,
}

#[cfg(target_os = "linux")]
impl I2CBus {
    pub fn new(path: &str) -> BusResult<Self> {
        let device = LinuxI2CDevice::new(path, 0).map_err(|e| BusError::Transfer {
            address: 0,
            register: 0,
            reason: format!("failed to open {}: {}", path, e),
        })?;
        Ok(Self {
            device,
            path: path.to_string(),
        })
    }

    fn select(&mut self, address: u8, register: u8) -> BusResult<()> {
        self.device
            .set_slave_address(address as u16)
            .map_err(|e| transfer_error(address, register, e))
    }
}

#[cfg(not(target_os = "linux"))]
impl I2CBus {
    pub fn new(path: &str) -> BusResult<Self> {
        Err(BusError::Unsupported(format!(
            "cannot open {}; use a `sim` bus on this host",
            path
        )))
    }
}

impl I2CBus {
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(target_os = "linux")]
fn transfer_error(address: u8, register: u8, error: impl std::fmt::Display) -> BusError {
    BusError::Transfer {
        address,
        register,
        reason: error.to_string(),
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl I2cTransport for I2CBus {
    async fn read_registers(&mut self, address: u8, start_reg: u8, len: usize) -> BusResult<Vec<u8>> {
        if len == 0 || len > MAX_BLOCK_LEN {
            return Err(BusError::Transfer {
                address,
                register: start_reg,
                reason: format!("block length {} outside 1..={}", len, MAX_BLOCK_LEN),
            });
        }
        self.select(address, start_reg)?;

        if len == 1 {
            // Use SMBus read byte data for single byte reads
            let byte = self
                .device
                .smbus_read_byte_data(start_reg)
                .map_err(|e| transfer_error(address, start_reg, e))?;
            return Ok(vec![byte]);
        }

        let data = self
            .device
            .smbus_read_i2c_block_data(start_reg, len as u8)
            .map_err(|e| transfer_error(address, start_reg, e))?;
        if data.len() != len {
            return Err(BusError::Transfer {
                address,
                register: start_reg,
                reason: format!("short read: {} of {} bytes", data.len(), len),
            });
        }
        Ok(data)
    }

    async fn write_registers(&mut self, address: u8, start_reg: u8, data: &[u8]) -> BusResult<()> {
        self.select(address, start_reg)?;
        // BME68x writes are register/value pairs without auto-increment
        for (offset, byte) in data.iter().enumerate() {
            let register = start_reg.wrapping_add(offset as u8);
            self.device
                .smbus_write_byte_data(register, *byte)
                .map_err(|e| transfer_error(address, register, e))?;
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
#[async_trait]
impl I2cTransport for I2CBus {
    async fn read_registers(&mut self, _address: u8, _start_reg: u8, _len: usize) -> BusResult<Vec<u8>> {
        Err(BusError::Unsupported("I2C is only supported on Linux".to_string()))
    }

    async fn write_registers(&mut self, _address: u8, _start_reg: u8, _data: &[u8]) -> BusResult<()> {
        Err(BusError::Unsupported("I2C is only supported on Linux".to_string()))
    }
}
