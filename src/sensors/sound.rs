//! Sound pressure level from an I2S MEMS microphone (INMP441 class)
//!
//! Frames are 32-bit little endian slots carrying an 18-bit sample left
//! aligned. Level is the DC-removed RMS over one block, converted to dB SPL
//! through the microphone sensitivity.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use super::{Sensor, SensorError, SensorKind};

/// Significant bits per sample
pub const SAMPLE_BITS: u32 = 18;
/// Sensitivity in dBFS for a 94 dB SPL tone
pub const SENSITIVITY_DBFS: f32 = -26.0;
/// Reference level of the sensitivity figure
pub const REFERENCE_SPL: f32 = 94.0;
/// Frames per level measurement
pub const DEFAULT_BLOCK: usize = 1024;

/// Sound pressure level in dB for one block of raw 32-bit slots
///
/// Returns NaN for an empty block and 0 for silence.
pub fn spl_from_samples(slots: &[i32]) -> f32 {
    if slots.is_empty() {
        return f32::NAN;
    }

    let shift = 32 - SAMPLE_BITS;
    let samples = slots.iter().map(|s| (s >> shift) as f64);

    let n = slots.len() as f64;
    let mean = samples.clone().sum::<f64>() / n;
    let rms = (samples.map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();

    let full_scale = (1u32 << (SAMPLE_BITS - 1)) as f64;
    let dbfs = 20.0 * (rms / full_scale).log10();
    let spl = dbfs as f32 + REFERENCE_SPL - SENSITIVITY_DBFS;

    spl.max(0.0)
}

/// Sound level sensor over any stream of I2S frames
pub struct SoundLevel<R> {
    source: R,
    block: Vec<i32>,
}

impl<R: Read + Send> SoundLevel<R> {
    pub fn new(source: R) -> Self {
        Self::with_block(source, DEFAULT_BLOCK)
    }

    pub fn with_block(source: R, frames: usize) -> Self {
        Self {
            source,
            block: vec![0; frames.max(1)],
        }
    }

    pub fn release(self) -> R {
        self.source
    }
}

impl<R: Read + Send> Sensor for SoundLevel<R> {
    fn kind(&self) -> SensorKind {
        SensorKind::Sound
    }

    fn read(&mut self) -> Result<f32, SensorError> {
        self.source
            .read_i32_into::<LittleEndian>(&mut self.block)?;

        Ok(spl_from_samples(&self.block))
    }
}
