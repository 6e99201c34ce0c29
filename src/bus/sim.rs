//! Simulated I2C bus hosting BME68x devices.
//!
//! Each device answers with a fixed calibration and a configurable
//! environment, so a measurement compensates to known values
//! (21 °C, 1013.25 hPa, 45 %RH, 250 kΩ on the high-range variants).
//! Heater steps below 200 °C read four times that resistance.
//! Faults can be injected per device.

use crate::bus::I2cTransport;
use crate::errors::{BusError, BusResult};
use crate::sensors::model::Model;
use crate::sensors::registers::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// res_heat code of a 200 °C step under the fixed calibration
const COOL_PLATE_RES_HEAT: u8 = 160;

/// Raw ADC counts the simulated device reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimEnvironment {
    pub temp_adc: u32,
    pub press_adc: u32,
    pub hum_adc: u16,
    pub gas_adc: u16,
    pub gas_range: u8,
    /// Range reported while the heater step is cooler than 200 °C
    pub cool_gas_range: u8,
}

impl Default for SimEnvironment {
    fn default() -> Self {
        Self {
            temp_adc: 524288,
            press_adc: 947251,
            hum_adc: 11520,
            gas_adc: 512,
            gas_range: 8,
            cool_gas_range: 6,
        }
    }
}

struct DeviceState {
    regs: [u8; 256],
    measuring: bool,
    polls_remaining: u32,
    polls_before_ready: u32,
    never_ready: bool,
    fail_next: u32,
    env: SimEnvironment,
    measurements: u32,
}

impl DeviceState {
    fn new(model: Model) -> Self {
        let mut regs = [0u8; 256];
        regs[CHIP_ID as usize] = EXPECTED_CHIP_ID;
        regs[VARIANT_ID as usize] = model.spec().variant_id;
        // par_t2 = 3360, par_p1 = 6250, par_h2 = 1024, everything else zero
        regs[CALIB_ADDR_1 as usize + 1] = 0x20;
        regs[CALIB_ADDR_1 as usize + 2] = 0x0D;
        regs[CALIB_ADDR_1 as usize + 5] = 0x6A;
        regs[CALIB_ADDR_1 as usize + 6] = 0x18;
        regs[CALIB_ADDR_2 as usize] = 0x40;

        Self {
            regs,
            measuring: false,
            polls_remaining: 0,
            polls_before_ready: 0,
            never_ready: false,
            fail_next: 0,
            env: SimEnvironment::default(),
            measurements: 0,
        }
    }

    fn take_failure(&mut self) -> bool {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            true
        } else {
            false
        }
    }

    fn write(&mut self, reg: u8, value: u8) {
        match reg {
            SOFT_RESET if value == SOFT_RESET_CMD => {
                for r in [CTRL_GAS_0, CTRL_GAS_1, CTRL_HUM, CTRL_MEAS, CONFIG, FIELD_0] {
                    self.regs[r as usize] = 0;
                }
                self.measuring = false;
            }
            CTRL_MEAS if value & MODE_MSK == FORCED_MODE => {
                self.regs[reg as usize] = value;
                self.start_measurement();
            }
            _ => self.regs[reg as usize] = value,
        }
    }

    fn start_measurement(&mut self) {
        let ctrl_gas_1 = self.regs[CTRL_GAS_1 as usize];
        let step = ctrl_gas_1 & NBCONV_MSK;
        let run_gas = ctrl_gas_1 & RUN_GAS_MSK != 0;
        let env = self.env;

        let base = DATA_START as usize;
        self.regs[base] = (env.press_adc >> 12) as u8;
        self.regs[base + 1] = (env.press_adc >> 4) as u8;
        self.regs[base + 2] = ((env.press_adc & 0x0F) << 4) as u8;
        self.regs[base + 3] = (env.temp_adc >> 12) as u8;
        self.regs[base + 4] = (env.temp_adc >> 4) as u8;
        self.regs[base + 5] = ((env.temp_adc & 0x0F) << 4) as u8;
        self.regs[base + 6] = (env.hum_adc >> 8) as u8;
        self.regs[base + 7] = env.hum_adc as u8;

        let res_heat = self.regs[RES_HEAT_0 as usize + step as usize];
        let gas_range = if res_heat < COOL_PLATE_RES_HEAT {
            env.cool_gas_range
        } else {
            env.gas_range
        };
        let mut gas_lsb = (((env.gas_adc & 0x03) as u8) << 6) | (gas_range & GAS_RANGE_MSK);
        if run_gas {
            gas_lsb |= GASM_VALID_MSK | HEAT_STAB_MSK;
        }
        // Both gas register pairs, the variant decides which one is read
        for offset in [11, 13] {
            self.regs[base + offset] = (env.gas_adc >> 2) as u8;
            self.regs[base + offset + 1] = gas_lsb;
        }

        self.regs[FIELD_0 as usize] = step;
        self.measuring = true;
        self.polls_remaining = self.polls_before_ready;
    }

    fn read_status(&mut self) -> u8 {
        if self.measuring && !self.never_ready {
            if self.polls_remaining > 0 {
                self.polls_remaining -= 1;
            } else {
                self.measuring = false;
                self.measurements += 1;
                self.regs[FIELD_0 as usize] |= NEW_DATA_MSK;
                self.regs[CTRL_MEAS as usize] &= !MODE_MSK;
            }
        }
        self.regs[FIELD_0 as usize]
    }
}

/// Handle to one simulated device, used to inspect it and inject faults.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.lock().regs[reg as usize]
    }

    pub fn set_register(&self, reg: u8, value: u8) {
        self.lock().regs[reg as usize] = value;
    }

    /// Number of status polls answered with "no new data" per measurement
    pub fn set_polls_before_ready(&self, polls: u32) {
        self.lock().polls_before_ready = polls;
    }

    /// Never complete a measurement
    pub fn set_never_ready(&self, never: bool) {
        self.lock().never_ready = never;
    }

    /// Fail the next `count` transfers addressed to this device
    pub fn fail_next_transfers(&self, count: u32) {
        self.lock().fail_next = count;
    }

    pub fn environment(&self) -> SimEnvironment {
        self.lock().env
    }

    pub fn set_environment(&self, env: SimEnvironment) {
        self.lock().env = env;
    }

    /// Completed measurements so far
    pub fn measurements(&self) -> u32 {
        self.lock().measurements
    }
}

/// Bus with simulated devices keyed by address; other addresses NACK.
#[derive(Clone, Default)]
pub struct SimulatedBus {
    devices: Arc<Mutex<HashMap<u8, SimulatedDevice>>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, address: u8, model: Model) -> SimulatedDevice {
        let device = SimulatedDevice {
            state: Arc::new(Mutex::new(DeviceState::new(model))),
        };
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, device.clone());
        device
    }

    fn device(&self, address: u8) -> BusResult<SimulatedDevice> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .cloned()
            .ok_or(BusError::Nack { address })
    }
}

fn injected(address: u8, register: u8) -> BusError {
    BusError::Transfer {
        address,
        register,
        reason: "injected fault".to_string(),
    }
}

#[async_trait]
impl I2cTransport for SimulatedBus {
    async fn read_registers(&mut self, address: u8, start_reg: u8, len: usize) -> BusResult<Vec<u8>> {
        let device = self.device(address)?;
        let mut state = device.lock();
        if state.take_failure() {
            return Err(injected(address, start_reg));
        }
        let start = start_reg as usize;
        if start + len > state.regs.len() {
            return Err(BusError::Transfer {
                address,
                register: start_reg,
                reason: format!("read of {} bytes runs past the register file", len),
            });
        }
        if start_reg == FIELD_0 {
            state.read_status();
        }
        Ok(state.regs[start..start + len].to_vec())
    }

    async fn write_registers(&mut self, address: u8, start_reg: u8, data: &[u8]) -> BusResult<()> {
        let device = self.device(address)?;
        let mut state = device.lock();
        if state.take_failure() {
            return Err(injected(address, start_reg));
        }
        for (offset, value) in data.iter().enumerate() {
            state.write(start_reg.wrapping_add(offset as u8), *value);
        }
        Ok(())
    }
}
