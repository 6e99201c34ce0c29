//! BME68x register map and bit fields.

pub const CHIP_ID: u8 = 0xD0;
pub const VARIANT_ID: u8 = 0xF0;
pub const SOFT_RESET: u8 = 0xE0;
pub const SOFT_RESET_CMD: u8 = 0xB6;
pub const EXPECTED_CHIP_ID: u8 = 0x61;

/// meas_status_0 followed by the field data
pub const FIELD_0: u8 = 0x1D;
/// Data registers start at press_msb, right after status and meas_index
pub const DATA_START: u8 = 0x1F;
pub const DATA_LEN: usize = 15;

pub const RES_HEAT_0: u8 = 0x5A;
pub const GAS_WAIT_0: u8 = 0x64;
pub const CTRL_GAS_0: u8 = 0x70;
pub const CTRL_GAS_1: u8 = 0x71;
pub const CTRL_HUM: u8 = 0x72;
pub const CTRL_MEAS: u8 = 0x74;
pub const CONFIG: u8 = 0x75;

/// Factory calibration blocks
pub const CALIB_ADDR_1: u8 = 0x89;
pub const CALIB_LEN_1: usize = 25;
pub const CALIB_ADDR_2: u8 = 0xE1;
pub const CALIB_LEN_2: usize = 16;
pub const RES_HEAT_VAL: u8 = 0x00;
pub const RES_HEAT_RANGE: u8 = 0x02;
pub const RANGE_SW_ERR: u8 = 0x04;

pub const NEW_DATA_MSK: u8 = 0x80;
pub const GAS_INDEX_MSK: u8 = 0x0F;
pub const MODE_MSK: u8 = 0x03;
pub const FORCED_MODE: u8 = 0x01;
pub const OSH_MSK: u8 = 0x07;
pub const OST_POS: u8 = 5;
pub const OSP_POS: u8 = 2;
pub const FILTER_MSK: u8 = 0x1C;
pub const FILTER_POS: u8 = 2;
pub const RUN_GAS_MSK: u8 = 0x30;
pub const RUN_GAS_POS: u8 = 4;
pub const NBCONV_MSK: u8 = 0x0F;
pub const HEAT_OFF_MSK: u8 = 0x08;
pub const GAS_RANGE_MSK: u8 = 0x0F;
pub const GASM_VALID_MSK: u8 = 0x20;
pub const HEAT_STAB_MSK: u8 = 0x10;
