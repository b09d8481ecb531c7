//! Bosch BME280 temperature, pressure and humidity sensor over I2C
//!
//! Compensation follows the datasheet integer formulas (section 4.2.3 and 8.2).
//! One physical device serves three `Sensor`s, see [`Bme280::into_channels`].

use std::sync::{Arc, Mutex};

use embedded_hal::i2c::I2c;

use super::{Sensor, SensorError, SensorKind};

/// I2C address with SDO tied to ground
pub const DEFAULT_ADDRESS: u8 = 0x76;
/// Value of the `id` register
pub const CHIP_ID: u8 = 0x60;

const REG_CALIB_00: u8 = 0x88;
const REG_ID: u8 = 0xd0;
const REG_CALIB_26: u8 = 0xe1;
const REG_CTRL_HUM: u8 = 0xf2;
const REG_CTRL_MEAS: u8 = 0xf4;
const REG_DATA: u8 = 0xf7;

/// Humidity oversampling x1
const CTRL_HUM_OSRS_X1: u8 = 0x01;
/// Temperature and pressure oversampling x1, normal mode
const CTRL_MEAS_NORMAL_X1: u8 = 0x27;

/// `t_fine` at -40 °C and 85 °C
const T_FINE_MIN: i64 = -204_800;
const T_FINE_MAX: i64 = 435_200;

/// Factory trimming parameters
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,

    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,

    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

impl Calibration {
    /// Parse the `calib00..calib25` and `calib26..calib32` blocks
    pub fn parse(tp: &[u8; 26], h: &[u8; 7]) -> Self {
        let u = |i: usize| u16::from_le_bytes([tp[i], tp[i + 1]]);
        let s = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);

        Self {
            t1: u(0),
            t2: s(2),
            t3: s(4),
            p1: u(6),
            p2: s(8),
            p3: s(10),
            p4: s(12),
            p5: s(14),
            p6: s(16),
            p7: s(18),
            p8: s(20),
            p9: s(22),
            h1: tp[25],
            h2: i16::from_le_bytes([h[0], h[1]]),
            h3: h[2],
            h4: (h[3] as i8 as i16) << 4 | (h[4] & 0x0f) as i16,
            h5: (h[5] as i8 as i16) << 4 | (h[4] >> 4) as i16,
            h6: h[6] as i8,
        }
    }

    /// Returns `(t_fine, temperature)`, temperature in 0.01 °C
    ///
    /// `t_fine` is limited to the -40..=85 °C operating range.
    pub fn compensate_temperature(&self, adc_t: i32) -> (i32, i32) {
        let (adc_t, t1) = (adc_t as i64, self.t1 as i64);
        let var1 = (((adc_t >> 3) - (t1 << 1)) * self.t2 as i64) >> 11;
        let var2 = (((((adc_t >> 4) - t1) * ((adc_t >> 4) - t1)) >> 12) * self.t3 as i64) >> 14;

        let t_fine = (var1 + var2).clamp(T_FINE_MIN, T_FINE_MAX) as i32;
        (t_fine, (t_fine * 5 + 128) >> 8)
    }

    /// Pressure in Pa as unsigned Q24.8
    ///
    /// Evaluated in 128 bits, the 64-bit datasheet path overflows for large `dig_P1`.
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: i32) -> u32 {
        let mut var1 = t_fine as i128 - 128_000;
        let mut var2 = var1 * var1 * self.p6 as i128;
        var2 += (var1 * self.p5 as i128) << 17;
        var2 += (self.p4 as i128) << 35;
        var1 = ((var1 * var1 * self.p3 as i128) >> 8) + ((var1 * self.p2 as i128) << 12);
        var1 = (((1i128 << 47) + var1) * self.p1 as i128) >> 33;

        if var1 == 0 {
            // avoid division by zero on a blank calibration
            return 0;
        }

        let mut p = 1_048_576 - adc_p as i128;
        p = (((p << 31) - var2) * 3125) / var1;
        var1 = (self.p9 as i128 * (p >> 13) * (p >> 13)) >> 25;
        var2 = (self.p8 as i128 * p) >> 19;
        p = ((p + var1 + var2) >> 8) + ((self.p7 as i128) << 4);

        p.clamp(0, u32::MAX as i128) as u32
    }

    /// Relative humidity in %RH as unsigned Q22.10
    pub fn compensate_humidity(&self, adc_h: i32, t_fine: i32) -> u32 {
        let (h1, h2, h3) = (self.h1 as i64, self.h2 as i64, self.h3 as i64);
        let (h4, h5, h6) = (self.h4 as i64, self.h5 as i64, self.h6 as i64);
        let adc_h = adc_h as i64;

        let mut v = t_fine as i64 - 76_800;
        v = ((((adc_h << 14) - (h4 << 20) - (h5 * v)) + 16_384) >> 15)
            * (((((((v * h6) >> 10) * (((v * h3) >> 11) + 32_768)) >> 10) + 2_097_152) * h2
                + 8_192)
                >> 14);
        v -= ((((v >> 15) * (v >> 15)) >> 7) * h1) >> 4;
        v = v.clamp(0, 419_430_400);

        (v >> 12) as u32
    }

    /// Convert raw ADC values to physical units
    pub fn compensate(&self, raw: &RawSample) -> Measurement {
        let (t_fine, t) = self.compensate_temperature(raw.adc_t);
        let p = self.compensate_pressure(raw.adc_p, t_fine);
        let h = self.compensate_humidity(raw.adc_h, t_fine);

        Measurement {
            temperature_c: t as f32 / 100.0,
            pressure_hpa: (p as f64 / 256.0 / 100.0) as f32,
            humidity_pct: h as f32 / 1024.0,
        }
    }
}

/// Uncompensated ADC output of one conversion
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RawSample {
    pub adc_p: i32,
    pub adc_t: i32,
    pub adc_h: i32,
}

impl RawSample {
    /// Decode the `press_msb..hum_lsb` burst
    pub fn parse(d: &[u8; 8]) -> Self {
        let adc20 = |i: usize| (d[i] as i32) << 12 | (d[i + 1] as i32) << 4 | (d[i + 2] as i32) >> 4;

        Self {
            adc_p: adc20(0),
            adc_t: adc20(3),
            adc_h: (d[6] as i32) << 8 | d[7] as i32,
        }
    }
}

/// One compensated measurement
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Measurement {
    pub temperature_c: f32,
    pub pressure_hpa: f32,
    pub humidity_pct: f32,
}

impl Measurement {
    /// Value for `kind`, NaN for quantities this sensor does not measure
    pub fn get(&self, kind: SensorKind) -> f32 {
        match kind {
            SensorKind::Temperature => self.temperature_c,
            SensorKind::Pressure => self.pressure_hpa,
            SensorKind::Humidity => self.humidity_pct,
            SensorKind::Sound | SensorKind::Dust => f32::NAN,
        }
    }
}

/// BME280 device
pub struct Bme280<I2C> {
    i2c: I2C,
    address: u8,
    calibration: Option<Calibration>,
}

impl<I2C: I2c> Bme280<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self::with_address(i2c, DEFAULT_ADDRESS)
    }

    pub fn with_address(i2c: I2C, address: u8) -> Self {
        Self {
            i2c,
            address,
            calibration: None,
        }
    }

    /// Check the chip id, load calibration and start continuous conversion
    pub fn probe(&mut self) -> Result<(), SensorError> {
        let mut id = [0u8; 1];
        self.read_regs(REG_ID, &mut id)?;
        if id[0] != CHIP_ID {
            return Err(SensorError::NotDetected {
                expected: CHIP_ID,
                found: id[0],
            });
        }

        let mut tp = [0u8; 26];
        let mut h = [0u8; 7];
        self.read_regs(REG_CALIB_00, &mut tp)?;
        self.read_regs(REG_CALIB_26, &mut h)?;
        let calibration = Calibration::parse(&tp, &h);
        debug!("bme280 calibration {:?}", calibration);

        self.write_reg(REG_CTRL_HUM, CTRL_HUM_OSRS_X1)?;
        self.write_reg(REG_CTRL_MEAS, CTRL_MEAS_NORMAL_X1)?;

        self.calibration = Some(calibration);
        Ok(())
    }

    /// Read and compensate the latest conversion, probing first if needed
    pub fn measure(&mut self) -> Result<Measurement, SensorError> {
        if self.calibration.is_none() {
            self.probe()?;
        }

        let mut data = [0u8; 8];
        self.read_regs(REG_DATA, &mut data)?;
        let raw = RawSample::parse(&data);
        trace!("bme280 raw {:?}", raw);

        match &self.calibration {
            Some(c) => Ok(c.compensate(&raw)),
            None => Err(SensorError::NotDetected {
                expected: CHIP_ID,
                found: 0,
            }),
        }
    }

    /// Split into temperature, pressure and humidity sensors sharing this device
    pub fn into_channels(self) -> [Bme280Channel<I2C>; 3] {
        let dev = Arc::new(Mutex::new(self));
        [
            SensorKind::Temperature,
            SensorKind::Pressure,
            SensorKind::Humidity,
        ]
        .map(|kind| Bme280Channel {
            kind,
            dev: dev.clone(),
        })
    }

    pub fn release(self) -> I2C {
        self.i2c
    }

    fn read_regs(&mut self, reg: u8, buff: &mut [u8]) -> Result<(), SensorError> {
        self.i2c
            .write_read(self.address, &[reg], buff)
            .map_err(|e| SensorError::Bus(format!("{:?}", e)))
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), SensorError> {
        self.i2c
            .write(self.address, &[reg, value])
            .map_err(|e| SensorError::Bus(format!("{:?}", e)))
    }
}

/// One quantity of a shared BME280
pub struct Bme280Channel<I2C> {
    kind: SensorKind,
    dev: Arc<Mutex<Bme280<I2C>>>,
}

impl<I2C: I2c> Bme280Channel<I2C> {
    fn with_dev<T>(&self, f: impl FnOnce(&mut Bme280<I2C>) -> T) -> T {
        let mut dev = self.dev.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut dev)
    }
}

impl<I2C: I2c + Send> Sensor for Bme280Channel<I2C> {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        self.with_dev(|d| d.probe())
    }

    fn read(&mut self) -> Result<f32, SensorError> {
        let m = self.with_dev(|d| d.measure())?;
        Ok(m.get(self.kind))
    }
}

#[cfg(test)]
mod test {
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction};

    use super::*;

    fn calibration() -> Calibration {
        Calibration {
            t1: 27504,
            t2: 26435,
            t3: -1000,
            p1: 36477,
            p2: -10685,
            p3: 3024,
            p4: 2855,
            p5: 140,
            p6: -7,
            p7: 15500,
            p8: -14600,
            p9: 6000,
            h1: 75,
            h2: 362,
            h3: 0,
            h4: 313,
            h5: 50,
            h6: 30,
        }
    }

    fn calibration_blocks() -> (Vec<u8>, Vec<u8>) {
        let c = calibration();
        let mut tp = Vec::new();
        tp.extend_from_slice(&c.t1.to_le_bytes());
        for v in [c.t2, c.t3] {
            tp.extend_from_slice(&v.to_le_bytes());
        }
        tp.extend_from_slice(&c.p1.to_le_bytes());
        for v in [c.p2, c.p3, c.p4, c.p5, c.p6, c.p7, c.p8, c.p9] {
            tp.extend_from_slice(&v.to_le_bytes());
        }
        tp.push(0x00);
        tp.push(c.h1);

        // h4 = 313 (0x139), h5 = 50 (0x032), nibbles share 0xe5
        let h = vec![0x6a, 0x01, 0x00, 0x13, 0x29, 0x03, 30];

        (tp, h)
    }

    const RAW: RawSample = RawSample {
        adc_p: 415_148,
        adc_t: 519_888,
        adc_h: 30_000,
    };

    #[test]
    fn parse_calibration_blocks() {
        let (tp, h) = calibration_blocks();
        let tp: [u8; 26] = tp.try_into().unwrap();
        let h: [u8; 7] = h.try_into().unwrap();

        assert_eq!(Calibration::parse(&tp, &h), calibration());
    }

    #[test]
    fn compensate_temperature() {
        let (t_fine, t) = calibration().compensate_temperature(RAW.adc_t);
        assert_eq!(t_fine, 128_422);
        assert_eq!(t, 2508);
    }

    #[test]
    fn compensate_pressure_and_humidity() {
        let c = calibration();
        let (t_fine, _) = c.compensate_temperature(RAW.adc_t);

        assert_eq!(c.compensate_pressure(RAW.adc_p, t_fine), 25_767_233);
        assert_eq!(c.compensate_humidity(RAW.adc_h, t_fine), 56_317);
    }

    #[test]
    fn blank_calibration_reads_zero_pressure() {
        assert_eq!(Calibration::default().compensate_pressure(RAW.adc_p, 0), 0);
    }

    #[test]
    fn measurement_units() {
        let m = calibration().compensate(&RAW);

        assert!((m.temperature_c - 25.08).abs() < 1e-4);
        assert!((m.pressure_hpa - 1006.5325).abs() < 1e-3);
        assert!((m.humidity_pct - 54.997).abs() < 1e-3);
    }

    #[test]
    fn extreme_calibration_stays_in_range() {
        let hot = Calibration {
            t1: 0,
            t2: i16::MAX,
            t3: i16::MAX,
            p1: u16::MAX,
            p2: i16::MIN,
            p3: i16::MAX,
            p4: i16::MAX,
            p5: i16::MIN,
            p6: i16::MAX,
            p7: i16::MAX,
            p8: i16::MIN,
            p9: i16::MAX,
            h1: u8::MAX,
            h2: i16::MAX,
            h3: u8::MAX,
            h4: i16::MIN,
            h5: i16::MAX,
            h6: i8::MAX,
        };
        let raw = RawSample {
            adc_p: 0xf_ffff,
            adc_t: 0xf_ffff,
            adc_h: 0xffff,
        };

        let m = hot.compensate(&raw);
        assert_eq!(m.temperature_c, 85.0);
        assert!(m.pressure_hpa.is_finite());
        assert!((0.0..=100.0).contains(&m.humidity_pct));

        let cold = Calibration {
            t2: i16::MIN,
            t3: 0,
            ..hot
        };
        let (t_fine, t) = cold.compensate_temperature(0xf_ffff);
        assert_eq!((t_fine, t), (-204_800, -4000));
    }

    #[test]
    fn raw_sample_burst() {
        let d = [0x65, 0x5a, 0xc0, 0x7e, 0xed, 0x00, 0x75, 0x30];
        assert_eq!(RawSample::parse(&d), RAW);
    }

    #[test]
    fn probe_and_read_channels() {
        let a = DEFAULT_ADDRESS;
        let (tp, h) = calibration_blocks();
        let data = vec![0x65, 0x5a, 0xc0, 0x7e, 0xed, 0x00, 0x75, 0x30];

        let i2c = I2cMock::new(&[
            Transaction::write_read(a, vec![REG_ID], vec![CHIP_ID]),
            Transaction::write_read(a, vec![REG_CALIB_00], tp),
            Transaction::write_read(a, vec![REG_CALIB_26], h),
            Transaction::write(a, vec![REG_CTRL_HUM, 0x01]),
            Transaction::write(a, vec![REG_CTRL_MEAS, 0x27]),
            Transaction::write_read(a, vec![REG_DATA], data.clone()),
            Transaction::write_read(a, vec![REG_DATA], data),
        ]);
        let mut done = i2c.clone();

        let [mut temp, mut press, _hum] = Bme280::new(i2c).into_channels();
        temp.probe().unwrap();

        assert!((temp.read().unwrap() - 25.08).abs() < 1e-4);
        assert!((press.read().unwrap() - 1006.5325).abs() < 1e-3);

        done.done();
    }

    #[test]
    fn probe_wrong_id() {
        let i2c = I2cMock::new(&[Transaction::write_read(
            DEFAULT_ADDRESS,
            vec![REG_ID],
            vec![0x58],
        )]);
        let mut done = i2c.clone();

        let mut dev = Bme280::new(i2c);
        match dev.probe() {
            Err(SensorError::NotDetected { expected, found }) => {
                assert_eq!((expected, found), (0x60, 0x58));
            }
            other => panic!("unexpected {:?}", other),
        }

        done.done();
    }
}
