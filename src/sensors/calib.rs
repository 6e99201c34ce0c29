//! Factory calibration coefficients and the compensation formulas that turn
//! raw ADC counts into physical units.

use super::registers::{CALIB_LEN_1, CALIB_LEN_2};

/// Lookup tables for the BME680 range-switching gas conversion.
mod gas_constants {
    pub static ARRAY1_INT: [u32; 16] = [
        2147483647, 2147483647, 2147483647, 2147483647, 2147483647, 2126008810, 2147483647,
        2130303777, 2147483647, 2147483647, 2143188679, 2136746228, 2147483647, 2126008810,
        2147483647, 2147483647,
    ];
    pub static ARRAY2_INT: [u32; 16] = [
        4096000000, 2048000000, 1024000000, 512000000, 255744255, 127110228, 64000000, 32258064,
        16016016, 8000000, 4000000, 2000000, 1000000, 500000, 250000, 125000,
    ];
}

/// Factory-fused calibration coefficients, unique to every chip.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub par_t1: u16,
    pub par_t2: i16,
    pub par_t3: i8,
    pub par_p1: u16,
    pub par_p2: i16,
    pub par_p3: i8,
    pub par_p4: i16,
    pub par_p5: i16,
    pub par_p6: i8,
    pub par_p7: i8,
    pub par_p8: i16,
    pub par_p9: i16,
    pub par_p10: u8,
    pub par_h1: u16,
    pub par_h2: u16,
    pub par_h3: i8,
    pub par_h4: i8,
    pub par_h5: i8,
    pub par_h6: u8,
    pub par_h7: i8,
    pub par_g1: i8,
    pub par_g2: i16,
    pub par_g3: i8,
    pub res_heat_range: u8,
    pub res_heat_val: i8,
    pub range_sw_err: i8,
}

/// Uncompensated readings from one forced measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawAdc {
    pub temp: u32,
    pub press: u32,
    pub hum: u16,
    pub gas: u16,
    pub gas_range: u8,
}

/// Compensated temperature, pressure and humidity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compensated {
    pub temperature_c: f64,
    pub pressure_pa: f64,
    pub humidity_pct: f64,
}

fn le_u16(lsb: u8, msb: u8) -> u16 {
    u16::from_le_bytes([lsb, msb])
}

fn le_i16(lsb: u8, msb: u8) -> i16 {
    i16::from_le_bytes([lsb, msb])
}

impl Calibration {
    /// Map the two calibration blocks (0x89.., 0xE1..) and the three heater
    /// bytes (0x00, 0x02, 0x04) to coefficients.
    pub fn from_registers(block1: &[u8], block2: &[u8], heater: [u8; 3]) -> Option<Self> {
        if block1.len() != CALIB_LEN_1 || block2.len() != CALIB_LEN_2 {
            return None;
        }
        let mut b = [0u8; CALIB_LEN_1 + CALIB_LEN_2];
        b[..CALIB_LEN_1].copy_from_slice(block1);
        b[CALIB_LEN_1..].copy_from_slice(block2);

        Some(Calibration {
            par_t1: le_u16(b[33], b[34]),
            par_t2: le_i16(b[1], b[2]),
            par_t3: b[3] as i8,
            par_p1: le_u16(b[5], b[6]),
            par_p2: le_i16(b[7], b[8]),
            par_p3: b[9] as i8,
            par_p4: le_i16(b[11], b[12]),
            par_p5: le_i16(b[13], b[14]),
            par_p6: b[16] as i8,
            par_p7: b[15] as i8,
            par_p8: le_i16(b[19], b[20]),
            par_p9: le_i16(b[21], b[22]),
            par_p10: b[23],
            // H1 and H2 share the nibbles of byte 26
            par_h1: ((b[27] as u16) << 4) | (b[26] & 0x0F) as u16,
            par_h2: ((b[25] as u16) << 4) | (b[26] >> 4) as u16,
            par_h3: b[28] as i8,
            par_h4: b[29] as i8,
            par_h5: b[30] as i8,
            par_h6: b[31],
            par_h7: b[32] as i8,
            par_g1: b[37] as i8,
            par_g2: le_i16(b[35], b[36]),
            par_g3: b[38] as i8,
            res_heat_val: heater[0] as i8,
            res_heat_range: (heater[1] >> 4) & 0x03,
            range_sw_err: (heater[2] as i8) >> 4,
        })
    }

    /// Temperature, pressure and humidity compensation.
    ///
    /// Temperature is computed first because its fine value feeds the
    /// other two formulas.
    pub fn compensate(&self, adc: &RawAdc) -> Compensated {
        let t_fine = self.t_fine(adc.temp);
        let temperature_c = t_fine / 5120.0;
        Compensated {
            temperature_c,
            pressure_pa: self.pressure(t_fine, adc.press),
            humidity_pct: self.humidity(temperature_c, adc.hum),
        }
    }

    fn t_fine(&self, temp_adc: u32) -> f64 {
        let adc = temp_adc as f64;
        let t1 = self.par_t1 as f64;
        let var1 = (adc / 16384.0 - t1 / 1024.0) * self.par_t2 as f64;
        let d = adc / 131072.0 - t1 / 8192.0;
        let var2 = d * d * (self.par_t3 as f64 * 16.0);
        var1 + var2
    }

    fn pressure(&self, t_fine: f64, press_adc: u32) -> f64 {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * (self.par_p6 as f64 / 131072.0);
        var2 += var1 * self.par_p5 as f64 * 2.0;
        var2 = var2 / 4.0 + self.par_p4 as f64 * 65536.0;
        var1 = (self.par_p3 as f64 * var1 * var1 / 16384.0 + self.par_p2 as f64 * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * self.par_p1 as f64;
        if var1.abs() < 1.0 {
            // Avoid division by zero on blank calibration
            return 0.0;
        }

        let mut press = 1048576.0 - press_adc as f64;
        press = (press - var2 / 4096.0) * 6250.0 / var1;
        let var1 = self.par_p9 as f64 * press * press / 2147483648.0;
        let var2 = press * (self.par_p8 as f64 / 32768.0);
        let scaled = press / 256.0;
        let var3 = scaled * scaled * scaled * (self.par_p10 as f64 / 131072.0);
        press + (var1 + var2 + var3 + self.par_p7 as f64 * 128.0) / 16.0
    }

    fn humidity(&self, temperature_c: f64, hum_adc: u16) -> f64 {
        let var1 = hum_adc as f64
            - (self.par_h1 as f64 * 16.0 + (self.par_h3 as f64 / 2.0) * temperature_c);
        let var2 = var1
            * (self.par_h2 as f64 / 262144.0)
            * (1.0
                + (self.par_h4 as f64 / 16384.0) * temperature_c
                + (self.par_h5 as f64 / 1048576.0) * temperature_c * temperature_c);
        let var3 = self.par_h6 as f64 / 16384.0;
        let var4 = self.par_h7 as f64 / 2097152.0;
        let hum = var2 + (var3 + var4 * temperature_c) * var2 * var2;
        hum.clamp(0.0, 100.0)
    }

    /// Gas resistance in ohms using the BME680 range-switching tables.
    pub fn gas_resistance_low(&self, gas_adc: u16, gas_range: u8) -> f64 {
        let range = (gas_range & 0x0F) as usize;
        // 64-bit intermediates, extreme resistances overflow 32 bits
        let var1 = ((1340 + 5 * self.range_sw_err as i64) * gas_constants::ARRAY1_INT[range] as i64) >> 16;
        let var2 = ((gas_adc as i64) << 15) - (1 << 24) + var1;
        if var2 == 0 {
            return 0.0;
        }
        let var3 = (gas_constants::ARRAY2_INT[range] as i64 * var1) >> 9;
        ((var3 + (var2 >> 1)) / var2) as f64
    }

    /// Target heater resistance register value for `target_c`, given the
    /// current ambient temperature.
    pub fn heater_resistance(&self, target_c: u16, ambient_c: i32) -> u8 {
        let target = target_c.min(400) as i64;
        let ambient = ambient_c as i64;
        let var1 = ((ambient * self.par_g3 as i64) / 10) << 8;
        let var2 = (self.par_g1 as i64 + 784)
            * ((((self.par_g2 as i64 + 154009) * target * 5) / 100 + 3276800) / 10);
        let var3 = var1 + (var2 >> 1);
        let var4 = var3 / (self.res_heat_range as i64 + 4);
        let var5 = 131 * self.res_heat_val as i64 + 65536;
        let res_heat_x100 = (var4 / var5 - 250) * 34;
        ((res_heat_x100 + 50) / 100).clamp(0, u8::MAX as i64) as u8
    }
}

/// Gas resistance in ohms for the BME688 generation.
pub fn gas_resistance_high(gas_adc: u16, gas_range: u8) -> f64 {
    let var1 = 262144u32 >> (gas_range & 0x0F);
    let var2 = 4096 + (gas_adc as i32 - 512) * 3;
    if var2 <= 0 {
        return 0.0;
    }
    1_000_000.0 * var1 as f64 / var2 as f64
}
