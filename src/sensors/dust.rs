//! Optical dust sensor (GP2Y1010 class) read through a 12-bit ADC

use std::fs;
use std::path::PathBuf;

use super::{Sensor, SensorError, SensorKind};

/// ADC reference voltage
pub const VREF: f32 = 3.3;
/// Full scale count of a 12-bit ADC
pub const ADC_MAX: f32 = 4095.0;
/// Output voltage with no dust
pub const NO_DUST_VOLTAGE: f32 = 0.6;
/// Sensitivity in V per 100 µg/m³
pub const SENSITIVITY: f32 = 0.5;

/// Dust density in µg/m³ for a raw ADC count, never negative
pub fn density(raw: u16) -> f32 {
    let voltage = raw as f32 * VREF / ADC_MAX;
    ((voltage - NO_DUST_VOLTAGE) * 1000.0 / SENSITIVITY).max(0.0)
}

/// Dust sensor over an ADC sampling function
pub struct Dust<F> {
    adc: F,
}

impl<F> Dust<F>
where
    F: FnMut() -> Result<u16, SensorError> + Send,
{
    pub fn new(adc: F) -> Self {
        Self { adc }
    }
}

/// Dust sensor on a Linux IIO channel, e.g. `/sys/bus/iio/devices/iio:device0/in_voltage0_raw`
pub fn iio(path: PathBuf) -> Dust<impl FnMut() -> Result<u16, SensorError> + Send> {
    Dust::new(move || {
        let raw = fs::read_to_string(&path)?;
        raw.trim()
            .parse()
            .map_err(|e| SensorError::Bus(format!("bad ADC value {:?}: {}", raw.trim(), e)))
    })
}

impl<F> Sensor for Dust<F>
where
    F: FnMut() -> Result<u16, SensorError> + Send,
{
    fn kind(&self) -> SensorKind {
        SensorKind::Dust
    }

    fn read(&mut self) -> Result<f32, SensorError> {
        let raw = (self.adc)()?;
        trace!("dust adc {}", raw);
        Ok(density(raw))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clean_air_floors_at_zero() {
        assert_eq!(density(0), 0.0);
        assert_eq!(density(744), 0.0);
    }

    #[test]
    fn density_scale() {
        // 1.1 V is 1000 µg/m³ above the 0.6 V baseline
        let raw = (1.1 / VREF * ADC_MAX).round() as u16;
        assert!((density(raw) - 1000.0).abs() < 2.0);

        let mut s = Dust::new(|| Ok(4095));
        assert!((s.read().unwrap() - 5400.0).abs() < 0.1);
    }

    #[test]
    fn iio_channel_file() {
        let path = std::env::temp_dir().join(format!("lora-node-iio-{}", std::process::id()));
        let mut s = iio(path.clone());

        assert!(matches!(s.read(), Err(SensorError::Io(_))));

        std::fs::write(&path, "4095\n").unwrap();
        assert!((s.read().unwrap() - 5400.0).abs() < 0.1);

        std::fs::write(&path, "n/a").unwrap();
        assert!(matches!(s.read(), Err(SensorError::Bus(_))));

        std::fs::remove_file(&path).unwrap();
    }
}
