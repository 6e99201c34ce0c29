//! BME680 / BME688 / BME690 register driver.
//!
//! The driver owns the device's measurement lifecycle: forced-mode trigger,
//! new-data polling and readout. It never sleeps during a measurement; the
//! caller waits the conversion time returned by
//! [`Bme68x::trigger_forced_measurement`] before reading.

use super::calib::{gas_resistance_high, Calibration, RawAdc};
use super::heater::{encode_gas_wait, tph_conversion_time, HeaterProfile, HeaterStep, MeasurementSettings};
use super::model::{GasFormula, Model};
use super::registers::*;
use super::RawSample;
use crate::bus::I2cTransport;
use crate::errors::{SensorError, SensorResult};
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Heater set points of the self-test. A cool plate reads a markedly higher
/// gas resistance than a hot one.
const SELF_TEST_COOL: HeaterStep = HeaterStep {
    temperature: 150,
    duration_ms: 1000,
};
const SELF_TEST_HOT: HeaterStep = HeaterStep {
    temperature: 350,
    duration_ms: 2000,
};
const SELF_TEST_PAIRS: usize = 3;
const SELF_TEST_MIN_GAS_RATIO: f32 = 2.0;
const SELF_TEST_READ_ATTEMPTS: u32 = 5;
const SELF_TEST_READ_BACKOFF: Duration = Duration::from_millis(10);
const PLAUSIBLE_TEMPERATURE_C: RangeInclusive<f32> = 0.0..=60.0;
const PLAUSIBLE_PRESSURE_HPA: RangeInclusive<f32> = 900.0..=1100.0;
const PLAUSIBLE_HUMIDITY_PCT: RangeInclusive<f32> = 20.0..=80.0;

/// Driver measurement state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    /// Forced measurement running on the given heater step
    Measuring { step: usize },
    /// New-data flag seen, field data not read yet
    DataReady { step: usize },
}

pub struct Bme68x<T> {
    id: String,
    address: u8,
    model: Model,
    bus: T,
    calib: Option<Calibration>,
    settings: MeasurementSettings,
    /// Written by the next `init`
    configured: HeaterProfile,
    /// Active on the device, empty until `init` succeeds
    profile: HeaterProfile,
    next_step: usize,
    ambient_c: i32,
    state: DriverState,
}

impl<T: I2cTransport> Bme68x<T> {
    pub fn new(id: String, address: u8, model: Model, bus: T) -> Self {
        Self {
            id,
            address,
            model,
            bus,
            calib: None,
            settings: MeasurementSettings::default(),
            configured: HeaterProfile::default(),
            profile: HeaterProfile::new(Vec::new()),
            next_step: 0,
            ambient_c: 25,
            state: DriverState::Idle,
        }
    }

    pub fn with_settings(mut self, settings: MeasurementSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Heater profile written by the next [`Bme68x::init`]. A running device
    /// only changes profile through [`Bme68x::configure_heater_profile`].
    pub fn with_heater_profile(mut self, profile: HeaterProfile) -> SensorResult<Self> {
        profile.validate(self.model).map_err(|reason| SensorError::Config {
            sensor: self.id.clone(),
            reason,
        })?;
        self.configured = profile;
        Ok(self)
    }

    /// Ambient temperature estimate used for the heater resistance.
    pub fn with_ambient_temperature(mut self, celsius: i32) -> Self {
        self.ambient_c = celsius;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn heater_profile(&self) -> &HeaterProfile {
        &self.profile
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calib.as_ref()
    }

    /// Read registers, retrying a failed transfer once.
    async fn read(&mut self, reg: u8, len: usize) -> SensorResult<Vec<u8>> {
        match self.bus.read_registers(self.address, reg, len).await {
            Ok(data) => Ok(data),
            Err(e) => {
                debug!("[{}] read of {:#04x} failed ({}), retrying once", self.id, reg, e);
                Ok(self.bus.read_registers(self.address, reg, len).await?)
            }
        }
    }

    async fn read_byte(&mut self, reg: u8) -> SensorResult<u8> {
        let data = self.read(reg, 1).await?;
        data.first().copied().ok_or_else(|| SensorError::Config {
            sensor: self.id.clone(),
            reason: format!("empty read from register {:#04x}", reg),
        })
    }

    async fn write(&mut self, reg: u8, data: &[u8]) -> SensorResult<()> {
        match self.bus.write_registers(self.address, reg, data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("[{}] write to {:#04x} failed ({}), retrying once", self.id, reg, e);
                Ok(self.bus.write_registers(self.address, reg, data).await?)
            }
        }
    }

    /// Read-modify-write of the bits selected by `mask`.
    async fn modify(&mut self, reg: u8, mask: u8, value: u8) -> SensorResult<()> {
        let current = self.read_byte(reg).await?;
        self.write(reg, &[(current & !mask) | (value & mask)]).await
    }

    async fn check_identity(&mut self) -> SensorResult<()> {
        let chip_id = self.read_byte(CHIP_ID).await?;
        if chip_id != EXPECTED_CHIP_ID {
            return Err(SensorError::WrongChipId {
                sensor: self.id.clone(),
                expected: EXPECTED_CHIP_ID,
                actual: chip_id,
            });
        }

        let spec = self.model.spec();
        let variant = self.read_byte(VARIANT_ID).await?;
        if variant != spec.variant_id {
            return Err(SensorError::VariantMismatch {
                sensor: self.id.clone(),
                model: spec.name.to_string(),
                expected: spec.variant_id,
                actual: variant,
            });
        }
        Ok(())
    }

    /// Identify the device, reset it, load calibration and apply the
    /// measurement settings and heater profile. The driver only counts as
    /// initialized once every step succeeded.
    pub async fn init(&mut self) -> SensorResult<()> {
        self.calib = None;
        self.profile = HeaterProfile::new(Vec::new());
        self.state = DriverState::Idle;

        self.check_identity().await?;
        let profile = self.configured.clone();
        profile.validate(self.model).map_err(|reason| SensorError::Config {
            sensor: self.id.clone(),
            reason,
        })?;

        self.write(SOFT_RESET, &[SOFT_RESET_CMD]).await?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let block1 = self.read(CALIB_ADDR_1, CALIB_LEN_1).await?;
        let block2 = self.read(CALIB_ADDR_2, CALIB_LEN_2).await?;
        let heater = [
            self.read_byte(RES_HEAT_VAL).await?,
            self.read_byte(RES_HEAT_RANGE).await?,
            self.read_byte(RANGE_SW_ERR).await?,
        ];
        let calib = Calibration::from_registers(&block1, &block2, heater).ok_or_else(|| {
            SensorError::Config {
                sensor: self.id.clone(),
                reason: "calibration blocks have unexpected length".to_string(),
            }
        })?;

        self.apply_settings().await?;
        self.write_heater_profile(calib, &profile).await?;
        self.calib = Some(calib);
        self.profile = profile;
        self.next_step = 0;

        info!(
            "[{}] {} ready at {:#04x}, {} heater step(s)",
            self.id,
            self.model.name(),
            self.address,
            self.profile.len()
        );
        Ok(())
    }

    async fn apply_settings(&mut self) -> SensorResult<()> {
        let os = self.settings.oversampling;
        self.modify(CTRL_HUM, OSH_MSK, os.humidity as u8).await?;
        // Keep the mode bits at sleep while changing oversampling
        let ctrl_meas = ((os.temperature as u8) << OST_POS) | ((os.pressure as u8) << OSP_POS);
        self.write(CTRL_MEAS, &[ctrl_meas]).await?;
        self.modify(CONFIG, FILTER_MSK, (self.settings.iir_filter as u8) << FILTER_POS)
            .await
    }

    /// Write the heater set points of `profile` and enable gas conversions.
    pub async fn configure_heater_profile(&mut self, profile: HeaterProfile) -> SensorResult<()> {
        profile.validate(self.model).map_err(|reason| SensorError::Config {
            sensor: self.id.clone(),
            reason,
        })?;
        if self.state != DriverState::Idle {
            return Err(SensorError::Busy {
                sensor: self.id.clone(),
            });
        }
        let calib = self.calib.ok_or_else(|| SensorError::Uninitialized {
            sensor: self.id.clone(),
        })?;

        self.write_heater_profile(calib, &profile).await?;
        debug!("[{}] heater profile: {:?}", self.id, profile.steps());
        self.configured = profile.clone();
        self.profile = profile;
        self.next_step = 0;
        Ok(())
    }

    async fn write_heater_profile(&mut self, calib: Calibration, profile: &HeaterProfile) -> SensorResult<()> {
        let res_heat: Vec<u8> = profile
            .steps()
            .iter()
            .map(|s| calib.heater_resistance(s.temperature, self.ambient_c))
            .collect();
        let gas_wait: Vec<u8> = profile
            .steps()
            .iter()
            .map(|s| encode_gas_wait(s.duration_ms))
            .collect();

        self.write(RES_HEAT_0, &res_heat).await?;
        self.write(GAS_WAIT_0, &gas_wait).await?;
        self.modify(CTRL_GAS_0, HEAT_OFF_MSK, 0).await?;
        let run_gas = self.model.spec().run_gas << RUN_GAS_POS;
        self.modify(CTRL_GAS_1, RUN_GAS_MSK | NBCONV_MSK, run_gas).await
    }

    /// Start a single forced measurement on the next heater step.
    ///
    /// Returns the minimum time to wait before the result can be read.
    pub async fn trigger_forced_measurement(&mut self) -> SensorResult<Duration> {
        if self.state != DriverState::Idle {
            return Err(SensorError::Busy {
                sensor: self.id.clone(),
            });
        }
        if self.calib.is_none() || self.profile.is_empty() {
            return Err(SensorError::Uninitialized {
                sensor: self.id.clone(),
            });
        }

        let step = self.next_step % self.profile.len();
        self.modify(CTRL_GAS_1, NBCONV_MSK, step as u8).await?;
        self.modify(CTRL_MEAS, MODE_MSK, FORCED_MODE).await?;

        self.state = DriverState::Measuring { step };
        self.next_step = (step + 1) % self.profile.len();

        let heater = Duration::from_millis(self.profile.steps()[step].duration_ms as u64);
        Ok(tph_conversion_time(&self.settings.oversampling) + heater)
    }

    /// Read and compensate the result of the running measurement.
    ///
    /// Fails with [`SensorError::NotReady`] while the device has not set its
    /// new-data flag; the measurement stays in progress in that case.
    pub async fn read_raw_sample(&mut self, timestamp: Duration) -> SensorResult<RawSample> {
        let step = match self.state {
            DriverState::Idle => {
                return Err(SensorError::NotTriggered {
                    sensor: self.id.clone(),
                })
            }
            DriverState::Measuring { step } | DriverState::DataReady { step } => step,
        };

        let status = self.read_byte(FIELD_0).await?;
        if status & NEW_DATA_MSK == 0 {
            return Err(SensorError::NotReady {
                sensor: self.id.clone(),
            });
        }
        self.state = DriverState::DataReady { step };

        let data = match self.read(DATA_START, DATA_LEN).await {
            Ok(data) if data.len() == DATA_LEN => data,
            Ok(data) => {
                self.state = DriverState::Idle;
                return Err(SensorError::Config {
                    sensor: self.id.clone(),
                    reason: format!("short field read: {} bytes", data.len()),
                });
            }
            Err(e) => {
                self.state = DriverState::Idle;
                return Err(e);
            }
        };
        self.state = DriverState::Idle;

        let calib = self.calib.ok_or_else(|| SensorError::Uninitialized {
            sensor: self.id.clone(),
        })?;
        Ok(self.decode(&calib, status, &data, timestamp))
    }

    fn decode(&self, calib: &Calibration, status: u8, d: &[u8], timestamp: Duration) -> RawSample {
        let spec = self.model.spec();
        let o = spec.gas_data_offset;
        let gas_lsb = d[o + 1];
        let adc = RawAdc {
            press: ((d[0] as u32) << 12) | ((d[1] as u32) << 4) | ((d[2] as u32) >> 4),
            temp: ((d[3] as u32) << 12) | ((d[4] as u32) << 4) | ((d[5] as u32) >> 4),
            hum: ((d[6] as u16) << 8) | d[7] as u16,
            gas: ((d[o] as u16) << 2) | (gas_lsb >> 6) as u16,
            gas_range: gas_lsb & GAS_RANGE_MSK,
        };

        let comp = calib.compensate(&adc);
        let gas = match spec.gas_formula {
            GasFormula::LowRange => calib.gas_resistance_low(adc.gas, adc.gas_range),
            GasFormula::HighRange => gas_resistance_high(adc.gas, adc.gas_range),
        };

        RawSample {
            temperature: comp.temperature_c as f32,
            pressure: (comp.pressure_pa / 100.0) as f32,
            humidity: comp.humidity_pct as f32,
            gas_resistance: gas as f32,
            gas_valid: gas_lsb & GASM_VALID_MSK != 0,
            heater_stable: gas_lsb & HEAT_STAB_MSK != 0,
            heater_step: status & GAS_INDEX_MSK,
            timestamp,
        }
    }

    /// Drop any measurement in progress. The device itself returns to sleep
    /// on its own once a forced conversion ends.
    pub fn abort(&mut self) {
        if self.state != DriverState::Idle {
            debug!("[{}] abandoning measurement in state {:?}", self.id, self.state);
        }
        self.state = DriverState::Idle;
    }

    /// Check the device end to end: identity, plausible T/P/H readings and
    /// the gas response between a cool and a hot heater plate.
    ///
    /// Unlike the measurement cycle this sleeps through each conversion, so
    /// it belongs at startup. The active heater profile is restored
    /// afterwards, whether the test passed or not.
    pub async fn self_test(&mut self) -> SensorResult<()> {
        if self.calib.is_none() || self.profile.is_empty() {
            return Err(SensorError::Uninitialized {
                sensor: self.id.clone(),
            });
        }
        if self.state != DriverState::Idle {
            return Err(SensorError::Busy {
                sensor: self.id.clone(),
            });
        }

        let active = self.profile.clone();
        let result = self.run_self_test().await;
        self.abort();
        let restored = self.configure_heater_profile(active).await;
        if let (Err(_), Err(e)) = (&result, &restored) {
            warn!("[{}] heater profile not restored after self-test: {}", self.id, e);
        }
        result?;
        restored?;
        info!("[{}] self-test passed", self.id);
        Ok(())
    }

    async fn run_self_test(&mut self) -> SensorResult<()> {
        self.check_identity().await?;

        let mut cool = 0.0;
        let mut hot = 0.0;
        for _ in 0..SELF_TEST_PAIRS {
            cool += self.self_test_measurement(SELF_TEST_COOL).await?;
            hot += self.self_test_measurement(SELF_TEST_HOT).await?;
        }
        let (cool, hot) = (cool / SELF_TEST_PAIRS as f32, hot / SELF_TEST_PAIRS as f32);
        debug!("[{}] self-test gas resistance: {:.0} Ω cool, {:.0} Ω hot", self.id, cool, hot);
        if hot <= 0.0 || cool / hot < SELF_TEST_MIN_GAS_RATIO {
            return Err(self.self_test_failure(format!(
                "gas resistance {:.0} Ω at {} °C vs {:.0} Ω at {} °C, expected a ratio of at least {}",
                cool, SELF_TEST_COOL.temperature, hot, SELF_TEST_HOT.temperature, SELF_TEST_MIN_GAS_RATIO
            )));
        }
        Ok(())
    }

    /// One forced measurement on `step`, returning its gas resistance.
    async fn self_test_measurement(&mut self, step: HeaterStep) -> SensorResult<f32> {
        self.configure_heater_profile(HeaterProfile::new(vec![step])).await?;
        let wait = self.trigger_forced_measurement().await?;
        tokio::time::sleep(wait).await;

        let mut attempt = 1;
        let sample = loop {
            match self.read_raw_sample(Duration::ZERO).await {
                Ok(sample) => break sample,
                Err(SensorError::NotReady { .. }) if attempt < SELF_TEST_READ_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(SELF_TEST_READ_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        };

        let readings = [
            ("temperature", sample.temperature, "°C", PLAUSIBLE_TEMPERATURE_C),
            ("pressure", sample.pressure, "hPa", PLAUSIBLE_PRESSURE_HPA),
            ("humidity", sample.humidity, "%", PLAUSIBLE_HUMIDITY_PCT),
        ];
        for (name, value, unit, range) in readings {
            if !range.contains(&value) {
                return Err(self.self_test_failure(format!(
                    "{} {:.2} {} outside {}..={}",
                    name,
                    value,
                    unit,
                    range.start(),
                    range.end()
                )));
            }
        }
        if !sample.gas_valid || !sample.heater_stable {
            return Err(self.self_test_failure(format!(
                "no valid gas reading with the heater at {} °C",
                step.temperature
            )));
        }
        Ok(sample.gas_resistance)
    }

    fn self_test_failure(&self, reason: String) -> SensorError {
        SensorError::SelfTest {
            sensor: self.id.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::{SimEnvironment, SimulatedBus, SimulatedDevice};
    use crate::errors::BusError;
    use crate::sensors::heater::{HeaterStep, OversamplingConfig};

    const ADDR: u8 = 0x77;

    fn driver(model: Model) -> (Bme68x<SimulatedBus>, SimulatedDevice) {
        let bus = SimulatedBus::new();
        let device = bus.attach(ADDR, model);
        (Bme68x::new("env0".to_string(), ADDR, model, bus), device)
    }

    async fn ready_driver(model: Model) -> (Bme68x<SimulatedBus>, SimulatedDevice) {
        let (mut drv, device) = driver(model);
        drv.init().await.unwrap();
        (drv, device)
    }

    #[tokio::test]
    async fn test_trigger_moves_to_measuring_and_rejects_second_trigger() {
        for model in Model::ALL {
            let (mut drv, _device) = ready_driver(model).await;
            drv.configure_heater_profile(HeaterProfile::single(300, 100)).await.unwrap();
            assert_eq!(drv.state(), DriverState::Idle);

            drv.trigger_forced_measurement().await.unwrap();
            assert_eq!(drv.state(), DriverState::Measuring { step: 0 });

            let second = drv.trigger_forced_measurement().await;
            assert!(matches!(second, Err(SensorError::Busy { .. })), "{:?}", model);
            assert_eq!(drv.state(), DriverState::Measuring { step: 0 });
        }
    }

    #[tokio::test]
    async fn test_init_rejects_wrong_chip_and_variant() {
        let (mut drv, device) = driver(Model::Bme688);
        device.set_register(CHIP_ID, 0x60);
        assert!(matches!(drv.init().await, Err(SensorError::WrongChipId { actual: 0x60, .. })));

        let bus = SimulatedBus::new();
        bus.attach(ADDR, Model::Bme680);
        let mut drv = Bme68x::new("env0".to_string(), ADDR, Model::Bme690, bus);
        let err = drv.init().await.unwrap_err();
        assert!(err.is_config());
        assert!(matches!(err, SensorError::VariantMismatch { actual: 0x00, .. }));
    }

    #[tokio::test]
    async fn test_conversion_time_includes_heater_duration() {
        let (mut drv, _device) = ready_driver(Model::Bme688).await;
        drv.configure_heater_profile(HeaterProfile::single(320, 150)).await.unwrap();
        let wait = drv.trigger_forced_measurement().await.unwrap();
        let tph = tph_conversion_time(&OversamplingConfig::default());
        assert_eq!(wait, tph + Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_heater_profile_registers() {
        let (mut drv, device) = ready_driver(Model::Bme688).await;
        let profile = HeaterProfile::new(vec![
            HeaterStep { temperature: 320, duration_ms: 150 },
            HeaterStep { temperature: 200, duration_ms: 100 },
        ]);
        drv.configure_heater_profile(profile).await.unwrap();

        assert_eq!(device.register(RES_HEAT_0), 207);
        assert_eq!(device.register(GAS_WAIT_0), 0x40 | 37);
        assert_eq!(device.register(GAS_WAIT_0 + 1), 0x40 | 25);
        assert_eq!(device.register(CTRL_GAS_1) & RUN_GAS_MSK, 0x20);
    }

    #[tokio::test]
    async fn test_invalid_profile_is_config_error() {
        let (mut drv, _device) = ready_driver(Model::Bme680).await;
        let profile = HeaterProfile::new(vec![HeaterStep { temperature: 320, duration_ms: 150 }; 2]);
        let err = drv.configure_heater_profile(profile).await.unwrap_err();
        assert!(matches!(err, SensorError::Config { .. }));
        // The previous profile stays active
        assert_eq!(drv.heater_profile(), &HeaterProfile::default());
    }

    #[tokio::test]
    async fn test_read_before_ready_fails_not_ready() {
        let (mut drv, device) = ready_driver(Model::Bme688).await;
        device.set_polls_before_ready(2);
        drv.trigger_forced_measurement().await.unwrap();

        for _ in 0..2 {
            let res = drv.read_raw_sample(Duration::ZERO).await;
            assert!(matches!(res, Err(SensorError::NotReady { .. })));
            assert!(matches!(drv.state(), DriverState::Measuring { .. }));
        }
        let sample = drv.read_raw_sample(Duration::from_millis(200)).await.unwrap();
        assert_eq!(drv.state(), DriverState::Idle);
        assert_eq!(sample.timestamp, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_read_without_trigger() {
        let (mut drv, _device) = ready_driver(Model::Bme688).await;
        let res = drv.read_raw_sample(Duration::ZERO).await;
        assert!(matches!(res, Err(SensorError::NotTriggered { .. })));
    }

    #[tokio::test]
    async fn test_sample_values_high_range_variant() {
        let (mut drv, _device) = ready_driver(Model::Bme688).await;
        drv.trigger_forced_measurement().await.unwrap();
        let sample = drv.read_raw_sample(Duration::ZERO).await.unwrap();

        assert!((sample.temperature - 21.0).abs() < 1e-3);
        assert!((sample.pressure - 1013.25).abs() < 1e-3);
        assert!((sample.humidity - 45.0).abs() < 1e-3);
        assert_eq!(sample.gas_resistance, 250000.0);
        assert!(sample.gas_valid && sample.heater_stable);
    }

    #[tokio::test]
    async fn test_sample_values_low_range_variant() {
        let (mut drv, _device) = ready_driver(Model::Bme680).await;
        drv.trigger_forced_measurement().await.unwrap();
        let sample = drv.read_raw_sample(Duration::ZERO).await.unwrap();
        assert!((31000.0..31600.0).contains(&sample.gas_resistance));
    }

    #[tokio::test]
    async fn test_steps_are_walked_round_robin() {
        let (mut drv, _device) = ready_driver(Model::Bme690).await;
        let steps = vec![
            HeaterStep { temperature: 320, duration_ms: 150 },
            HeaterStep { temperature: 200, duration_ms: 100 },
            HeaterStep { temperature: 250, duration_ms: 50 },
        ];
        drv.configure_heater_profile(HeaterProfile::new(steps)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            drv.trigger_forced_measurement().await.unwrap();
            seen.push(drv.read_raw_sample(Duration::ZERO).await.unwrap().heater_step);
        }
        assert_eq!(seen, vec![0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn test_single_bus_failure_is_retried_once() {
        let (mut drv, device) = ready_driver(Model::Bme688).await;
        device.fail_next_transfers(1);
        drv.trigger_forced_measurement().await.unwrap();

        device.fail_next_transfers(2);
        let res = drv.read_raw_sample(Duration::ZERO).await;
        assert!(matches!(res, Err(SensorError::Bus(BusError::Transfer { .. }))));
    }

    #[tokio::test]
    async fn test_failed_init_leaves_driver_uninitialized() {
        let (mut drv, device) = ready_driver(Model::Bme688).await;
        device.set_register(CHIP_ID, 0x00);
        assert!(drv.init().await.is_err());

        assert!(drv.heater_profile().is_empty());
        let res = drv.trigger_forced_measurement().await;
        assert!(matches!(res, Err(SensorError::Uninitialized { .. })));
        let res = drv.configure_heater_profile(HeaterProfile::default()).await;
        assert!(matches!(res, Err(SensorError::Uninitialized { .. })));
    }

    #[tokio::test]
    async fn test_builder_rejects_profile_outside_model_limits() {
        let (drv, _device) = driver(Model::Bme688);
        let empty = drv.with_heater_profile(HeaterProfile::new(Vec::new()));
        assert!(matches!(empty, Err(SensorError::Config { .. })));

        let (drv, _device) = ready_driver(Model::Bme680).await;
        let three = HeaterProfile::new(vec![HeaterStep { temperature: 320, duration_ms: 150 }; 3]);
        let Err(err) = drv.with_heater_profile(three) else {
            panic!("a 3-step profile was accepted on a BME680");
        };
        assert!(matches!(err, SensorError::Config { .. }));
    }

    #[tokio::test]
    async fn test_builder_profile_applies_on_next_init() {
        let (drv, device) = driver(Model::Bme688);
        let mut drv = drv.with_heater_profile(HeaterProfile::single(200, 100)).unwrap();
        drv.init().await.unwrap();
        assert_eq!(drv.heater_profile(), &HeaterProfile::single(200, 100));
        assert_eq!(device.register(GAS_WAIT_0), 0x40 | 25);

        // Swapping the profile on a running driver leaves the device untouched
        let mut drv = drv.with_heater_profile(HeaterProfile::single(320, 150)).unwrap();
        assert_eq!(drv.heater_profile(), &HeaterProfile::single(200, 100));
        let wait = drv.trigger_forced_measurement().await.unwrap();
        assert_eq!(wait, tph_conversion_time(&OversamplingConfig::default()) + Duration::from_millis(100));
        drv.abort();

        drv.init().await.unwrap();
        assert_eq!(drv.heater_profile(), &HeaterProfile::single(320, 150));
        assert_eq!(device.register(GAS_WAIT_0), 0x40 | 37);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_test_passes_and_restores_profile() {
        for model in Model::ALL {
            let (mut drv, device) = ready_driver(model).await;
            drv.configure_heater_profile(HeaterProfile::single(300, 100)).await.unwrap();
            let before = device.measurements();

            drv.self_test().await.unwrap();
            assert_eq!(device.measurements() - before, 6, "{:?}", model);
            assert_eq!(drv.heater_profile(), &HeaterProfile::single(300, 100));
            assert_eq!(drv.state(), DriverState::Idle);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_test_detects_flat_gas_response() {
        let (mut drv, device) = ready_driver(Model::Bme688).await;
        device.set_environment(SimEnvironment {
            cool_gas_range: 8,
            ..SimEnvironment::default()
        });
        let err = drv.self_test().await.unwrap_err();
        assert!(matches!(err, SensorError::SelfTest { .. }));
        assert!(err.is_config());
        assert_eq!(drv.heater_profile(), &HeaterProfile::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_test_checks_identity_and_readiness() {
        let (mut drv, _device) = driver(Model::Bme690);
        assert!(matches!(drv.self_test().await, Err(SensorError::Uninitialized { .. })));

        let (mut drv, device) = ready_driver(Model::Bme690).await;
        device.set_never_ready(true);
        assert!(matches!(drv.self_test().await, Err(SensorError::NotReady { .. })));
        assert_eq!(drv.state(), DriverState::Idle);

        device.set_never_ready(false);
        device.set_register(VARIANT_ID, 0x01);
        assert!(matches!(drv.self_test().await, Err(SensorError::VariantMismatch { .. })));
    }

    #[tokio::test]
    async fn test_abort_returns_to_idle() {
        let (mut drv, device) = ready_driver(Model::Bme688).await;
        device.set_never_ready(true);
        drv.trigger_forced_measurement().await.unwrap();
        drv.abort();
        assert_eq!(drv.state(), DriverState::Idle);
        assert!(drv.trigger_forced_measurement().await.is_ok());
    }
}
