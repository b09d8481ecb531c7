//! Common LoRa modulation options
//!
//! Out of range inputs are clamped to the nearest valid value, never rejected.

/// Spreading factor for LoRa mode
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpreadingFactor {
    /// LoRa Spreading Factor 6, 64 chips / symbol (implicit header only)
    Sf6 = 6,
    /// LoRa Spreading Factor 7, 128 chips / symbol
    Sf7 = 7,
    /// LoRa Spreading Factor 8, 256 chips / symbol
    Sf8 = 8,
    /// LoRa Spreading Factor 9, 512 chips / symbol
    Sf9 = 9,
    /// LoRa Spreading Factor 10 1024 chips / symbol
    Sf10 = 10,
    /// LoRa Spreading Factor 11 2048 chips / symbol
    Sf11 = 11,
    /// LoRa Spreading Factor 12 4096 chips / symbol
    Sf12 = 12,
}

impl SpreadingFactor {
    pub fn clamped(sf: u8) -> Self {
        match sf {
            0..=6 => Self::Sf6,
            7 => Self::Sf7,
            8 => Self::Sf8,
            9 => Self::Sf9,
            10 => Self::Sf10,
            11 => Self::Sf11,
            _ => Self::Sf12,
        }
    }

    pub const fn value(self) -> u8 {
        self as u8
    }
}

/// Channel bandwidth, discriminants are the `RegModemConfig1` codes
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bandwidth {
    Bw7_8kHz = 0,
    Bw10_4kHz = 1,
    Bw15_6kHz = 2,
    Bw20_8kHz = 3,
    Bw31_25kHz = 4,
    Bw41_7kHz = 5,
    Bw62_5kHz = 6,
    Bw125kHz = 7,
    Bw250kHz = 8,
    Bw500kHz = 9,
}

impl Bandwidth {
    pub fn clamped(code: u8) -> Self {
        match code {
            0 => Self::Bw7_8kHz,
            1 => Self::Bw10_4kHz,
            2 => Self::Bw15_6kHz,
            3 => Self::Bw20_8kHz,
            4 => Self::Bw31_25kHz,
            5 => Self::Bw41_7kHz,
            6 => Self::Bw62_5kHz,
            7 => Self::Bw125kHz,
            8 => Self::Bw250kHz,
            _ => Self::Bw500kHz,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Nominal bandwidth in Hz
    pub const fn hz(self) -> u32 {
        match self {
            Self::Bw7_8kHz => 7_800,
            Self::Bw10_4kHz => 10_400,
            Self::Bw15_6kHz => 15_600,
            Self::Bw20_8kHz => 20_800,
            Self::Bw31_25kHz => 31_250,
            Self::Bw41_7kHz => 41_700,
            Self::Bw62_5kHz => 62_500,
            Self::Bw125kHz => 125_000,
            Self::Bw250kHz => 250_000,
            Self::Bw500kHz => 500_000,
        }
    }
}

/// Coding rate, discriminants are the `RegModemConfig1` codes
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodingRate {
    /// LoRa Coding rate 4/5
    Cr4_5 = 1,
    /// LoRa Coding rate 4/6
    Cr4_6 = 2,
    /// LoRa Coding rate 4/7
    Cr4_7 = 3,
    /// LoRa Coding rate 4/8
    Cr4_8 = 4,
}

impl CodingRate {
    pub fn clamped(cr: u8) -> Self {
        match cr {
            0..=1 => Self::Cr4_5,
            2 => Self::Cr4_6,
            3 => Self::Cr4_7,
            _ => Self::Cr4_8,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// PA_BOOST output power in dBm
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TxPower(u8);

impl TxPower {
    pub const MIN_DBM: u8 = 2;
    pub const MAX_DBM: u8 = 17;

    pub fn clamped(dbm: i8) -> Self {
        Self(dbm.clamp(Self::MIN_DBM as i8, Self::MAX_DBM as i8) as u8)
    }

    pub const fn dbm(self) -> u8 {
        self.0
    }
}
