//! Sensor abstraction for the acquisition cycle
//!
//! A sensor produces one `f32` per `read` call. Transducer access stays behind
//! the trait, this module only carries the numeric conversions the node needs.

use std::fmt;

pub mod bme280;
pub mod dust;
pub mod sound;

pub use bme280::{Bme280, Bme280Channel};
pub use dust::Dust;
pub use sound::SoundLevel;

/// Measured quantity, also the payload key
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum SensorKind {
    Temperature,
    Pressure,
    Humidity,
    Sound,
    Dust,
}

impl SensorKind {
    /// Key used in the transmitted JSON record
    pub const fn key(self) -> &'static str {
        match self {
            SensorKind::Temperature => "temp",
            SensorKind::Pressure => "press",
            SensorKind::Humidity => "hum",
            SensorKind::Sound => "sound",
            SensorKind::Dust => "dust",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Sensor errors
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("sensor not detected (expected id 0x{expected:02x}, found 0x{found:02x})")]
    NotDetected { expected: u8, found: u8 },

    #[error("sensor bus error: {0}")]
    Bus(String),

    #[error("sensor io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} sensor task stopped")]
    TaskStopped(SensorKind),
}

/// A source of single readings
pub trait Sensor: Send {
    fn kind(&self) -> SensorKind;

    /// Check the peripheral is present and prepare it for reading
    fn probe(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    /// Take one reading in the unit of `kind()`
    fn read(&mut self) -> Result<f32, SensorError>;
}

impl<S: Sensor + ?Sized> Sensor for Box<S> {
    fn kind(&self) -> SensorKind {
        (**self).kind()
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        (**self).probe()
    }

    fn read(&mut self) -> Result<f32, SensorError> {
        (**self).read()
    }
}

/// Sensor backed by a closure
pub struct FnSensor<F> {
    kind: SensorKind,
    f: F,
}

/// Wrap a reading function as a sensor of the given kind
pub fn from_fn<F>(kind: SensorKind, f: F) -> FnSensor<F>
where
    F: FnMut() -> Result<f32, SensorError> + Send,
{
    FnSensor { kind, f }
}

impl<F> Sensor for FnSensor<F>
where
    F: FnMut() -> Result<f32, SensorError> + Send,
{
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn read(&mut self) -> Result<f32, SensorError> {
        (self.f)()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_keys() {
        let keys: Vec<_> = [
            SensorKind::Temperature,
            SensorKind::Pressure,
            SensorKind::Humidity,
            SensorKind::Sound,
            SensorKind::Dust,
        ]
        .iter()
        .map(|k| k.key())
        .collect();

        assert_eq!(keys, ["temp", "press", "hum", "sound", "dust"]);
    }

    #[test]
    fn closure_sensor() {
        let mut n = 0.0;
        let mut s = from_fn(SensorKind::Sound, move || {
            n += 1.0;
            Ok(n)
        });

        assert_eq!(s.kind(), SensorKind::Sound);
        assert!(s.probe().is_ok());
        assert_eq!(s.read().unwrap(), 1.0);
        assert_eq!(s.read().unwrap(), 2.0);
    }
}
