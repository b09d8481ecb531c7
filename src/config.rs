//! Radio and node configuration

use core::time::Duration;

#[cfg(feature = "structopt")]
use structopt::StructOpt;

use crate::blocking::PollOptions;
use crate::modulation::lora::{Bandwidth, CodingRate, SpreadingFactor, TxPower};

/// Lowest carrier frequency the SX1276 synthesizer covers
pub const MIN_FREQUENCY_HZ: u64 = 137_000_000;
/// Highest carrier frequency the SX1276 synthesizer covers
pub const MAX_FREQUENCY_HZ: u64 = 1_020_000_000;

/// LoRa link configuration
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(StructOpt))]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RadioConfig {
    /// Carrier frequency in Hz
    #[cfg_attr(feature = "structopt", structopt(long = "frequency", default_value = "868000000"))]
    pub carrier_frequency_hz: u64,

    /// Spreading factor (6 to 12)
    #[cfg_attr(feature = "structopt", structopt(long = "sf", default_value = "7"))]
    pub spreading_factor: u8,

    /// Bandwidth code (0: 7.8kHz to 9: 500kHz)
    #[cfg_attr(feature = "structopt", structopt(long = "bw", default_value = "7"))]
    pub bandwidth_code: u8,

    /// Coding rate (1: 4/5 to 4: 4/8)
    #[cfg_attr(feature = "structopt", structopt(long = "cr", default_value = "1"))]
    pub coding_rate: u8,

    /// Transmit power in dBm (2 to 17)
    #[cfg_attr(feature = "structopt", structopt(long = "power", default_value = "17"))]
    pub tx_power_dbm: i8,

    /// Disable payload CRC
    #[cfg_attr(feature = "structopt", structopt(long = "no-crc", parse(from_flag = std::ops::Not::not)))]
    pub crc_enabled: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            carrier_frequency_hz: 868_000_000,
            spreading_factor: 7,
            bandwidth_code: 7,
            coding_rate: 1,
            tx_power_dbm: 17,
            crc_enabled: true,
        }
    }
}

impl RadioConfig {
    /// Copy of this configuration with every field clamped to the device range
    pub fn clamped(&self) -> Self {
        Self {
            carrier_frequency_hz: self
                .carrier_frequency_hz
                .clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ),
            spreading_factor: SpreadingFactor::clamped(self.spreading_factor).value(),
            bandwidth_code: Bandwidth::clamped(self.bandwidth_code).code(),
            coding_rate: CodingRate::clamped(self.coding_rate).code(),
            tx_power_dbm: TxPower::clamped(self.tx_power_dbm).dbm() as i8,
            crc_enabled: self.crc_enabled,
        }
    }
}

/// Transmit-done poll ceilings per bandwidth band
///
/// Narrow bandwidths mean long airtime, so they get more polls. Bands are
/// codes 0-1, 2-3, 4-5, 6-7 and 8-9.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TxPollPolicy {
    pub interval: Duration,
    pub ceilings: [u32; 5],
}

impl Default for TxPollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2),
            ceilings: [500, 250, 125, 60, 30],
        }
    }
}

impl TxPollPolicy {
    /// Poll options for the given bandwidth
    pub fn options(&self, bandwidth: Bandwidth) -> PollOptions {
        let band = (bandwidth.code() as usize / 2).min(self.ceilings.len() - 1);
        PollOptions::new(self.interval, self.ceilings[band])
    }
}

/// Chip identity probe performed by `Sx127x::init`
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ProbeConfig {
    pub expected_version: u8,
    pub poll: PollOptions,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            expected_version: crate::registers::CHIP_VERSION,
            poll: PollOptions::new(Duration::from_millis(2), 100),
        }
    }
}

/// Driver timing configuration
#[derive(Clone, PartialEq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct DriverConfig {
    pub probe: ProbeConfig,
    pub tx_poll: TxPollPolicy,
}

/// Sensor node cycle configuration
#[cfg(feature = "std")]
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(StructOpt))]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct NodeConfig {
    #[cfg_attr(feature = "structopt", structopt(flatten))]
    pub radio: RadioConfig,

    /// Samples taken by each sensor per cycle
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub sample_count: usize,

    /// Interval between two samples of one sensor
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1s", parse(try_from_str = crate::duration_from_str)))]
    pub sample_interval: Duration,

    /// Time spent powered down between cycles
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "60s", parse(try_from_str = crate::duration_from_str)))]
    pub sleep_duration: Duration,

    /// Wait before retrying initialisation after an error
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5s", parse(try_from_str = crate::duration_from_str)))]
    pub error_cooldown: Duration,

    /// Bound on the wait for network connectivity
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10s", parse(try_from_str = crate::duration_from_str)))]
    pub connect_timeout: Duration,
}

#[cfg(feature = "std")]
impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            radio: RadioConfig::default(),
            sample_count: 10,
            sample_interval: Duration::from_secs(1),
            sleep_duration: Duration::from_secs(60),
            error_cooldown: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Receiver gateway configuration
#[cfg(feature = "std")]
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(StructOpt))]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct GatewayConfig {
    #[cfg_attr(feature = "structopt", structopt(flatten))]
    pub radio: RadioConfig,

    #[cfg_attr(feature = "structopt", structopt(flatten))]
    pub poll: PollOptions,

    /// Forward packets even when their payload CRC check failed
    #[cfg_attr(feature = "structopt", structopt(long = "accept-bad-crc", parse(from_flag = std::ops::Not::not)))]
    pub strict_crc: bool,

    /// Bound on the wait for network connectivity
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10s", parse(try_from_str = crate::duration_from_str)))]
    pub connect_timeout: Duration,
}

#[cfg(feature = "std")]
impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            radio: RadioConfig::default(),
            poll: PollOptions::new(Duration::from_millis(10), 100),
            strict_crc: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}
