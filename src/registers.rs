//! SX1276/77/78/79 LoRa mode register map
//!
//! Configuration registers that pack several fields into one byte are modelled as
//! typed bitfields so a field update can only ever touch its own bits.

use bitflags::bitflags;

/// LoRa mode register addresses
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Fifo = 0x00,
    OpMode = 0x01,
    FrfMsb = 0x06,
    FrfMid = 0x07,
    FrfLsb = 0x08,
    PaConfig = 0x09,
    Lna = 0x0c,
    FifoAddrPtr = 0x0d,
    FifoTxBaseAddr = 0x0e,
    FifoRxBaseAddr = 0x0f,
    FifoRxCurrentAddr = 0x10,
    IrqFlags = 0x12,
    RxNbBytes = 0x13,
    PktSnrValue = 0x19,
    PktRssiValue = 0x1a,
    RssiValue = 0x1b,
    ModemConfig1 = 0x1d,
    ModemConfig2 = 0x1e,
    PayloadLength = 0x22,
    ModemConfig3 = 0x26,
    DetectionOptimize = 0x31,
    DetectionThreshold = 0x37,
    SyncWord = 0x39,
    Version = 0x42,
}

impl Reg {
    pub const fn addr(self) -> u8 {
        self as u8
    }
}

/// Address bit set for register writes
pub const WRITE_FLAG: u8 = 0x80;

/// Silicon revision reported by SX1276/77/78/79 parts
pub const CHIP_VERSION: u8 = 0x12;

/// LoRa (long range) mode select bit in `RegOpMode`
pub const MODE_LONG_RANGE: u8 = 0x80;
pub const MODE_SLEEP: u8 = 0x00;
pub const MODE_STDBY: u8 = 0x01;
pub const MODE_TX: u8 = 0x03;
pub const MODE_RX_CONTINUOUS: u8 = 0x05;
pub const MODE_MASK: u8 = 0x07;

/// Route output power through the PA_BOOST pin
pub const PA_BOOST: u8 = 0x80;

/// Maximum LNA gain with boost enabled
pub const LNA_BOOST_HF: u8 = 0x03;

/// `RegModemConfig3` value with the AGC auto-on bit set
pub const MODEM_CONFIG_3_AGC_AUTO: u8 = 0x04;

/// Detection optimize / threshold pair required at SF6
pub const DETECTION_SF6: (u8, u8) = (0xc5, 0x0c);
/// Detection optimize / threshold pair for SF7 to SF12
pub const DETECTION_SF7_12: (u8, u8) = (0xc3, 0x0a);

/// RSSI offsets for the high frequency and low frequency ports
pub const RSSI_OFFSET_HF: i16 = 157;
pub const RSSI_OFFSET_LF: i16 = 164;

/// Frequency at and above which the high frequency port is in use
pub const HF_PORT_MIN_HZ: u64 = 868_000_000;

/// Crystal oscillator frequency
pub const FXOSC_HZ: u64 = 32_000_000;

bitflags! {
    /// `RegIrqFlags`, bits are cleared by writing one
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct IrqFlags: u8 {
        const RX_TIMEOUT = 0x80;
        const RX_DONE = 0x40;
        const PAYLOAD_CRC_ERROR = 0x20;
        const VALID_HEADER = 0x10;
        const TX_DONE = 0x08;
        const CAD_DONE = 0x04;
        const FHSS_CHANGE_CHANNEL = 0x02;
        const CAD_DETECTED = 0x01;
    }
}

/// A register whose content is a typed bitfield
pub trait Register: Copy + From<u8> + Into<u8> {
    const ADDR: Reg;
}

/// Replace the bits selected by `mask` with `value << shift`
const fn merge(raw: u8, mask: u8, shift: u8, value: u8) -> u8 {
    (raw & !mask) | ((value << shift) & mask)
}

/// Compute the 24-bit synthesizer word for a carrier frequency
///
/// `floor(hz * 2^19 / 32 MHz)`, saturating at 24 bits.
pub const fn frequency_word(hz: u64) -> u32 {
    let frf = match hz.checked_mul(1 << 19) {
        Some(scaled) => scaled / FXOSC_HZ,
        None => return 0x00ff_ffff,
    };
    if frf > 0x00ff_ffff {
        0x00ff_ffff
    } else {
        frf as u32
    }
}

/// Split a synthesizer word into `RegFrfMsb`, `RegFrfMid`, `RegFrfLsb`
pub const fn frequency_bytes(frf: u32) -> [u8; 3] {
    [(frf >> 16) as u8, (frf >> 8) as u8, frf as u8]
}

/// `RegOpMode`: long range mode flag and transceiver mode
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpMode(u8);

impl OpMode {
    pub const fn lora(mode: u8) -> Self {
        Self(MODE_LONG_RANGE | (mode & MODE_MASK))
    }

    pub const fn mode(self) -> u8 {
        self.0 & MODE_MASK
    }
}

/// `RegModemConfig1`: bandwidth [7:4], coding rate [3:1], implicit header [0]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ModemConfig1(u8);

impl ModemConfig1 {
    const BW_MASK: u8 = 0xf0;
    const CR_MASK: u8 = 0x0e;
    const IMPLICIT_MASK: u8 = 0x01;

    pub const fn bandwidth(self) -> u8 {
        (self.0 & Self::BW_MASK) >> 4
    }

    pub const fn coding_rate(self) -> u8 {
        (self.0 & Self::CR_MASK) >> 1
    }

    pub const fn implicit_header(self) -> bool {
        self.0 & Self::IMPLICIT_MASK != 0
    }

    pub const fn with_bandwidth(self, code: u8) -> Self {
        Self(merge(self.0, Self::BW_MASK, 4, code))
    }

    pub const fn with_coding_rate(self, cr: u8) -> Self {
        Self(merge(self.0, Self::CR_MASK, 1, cr))
    }
}

/// `RegModemConfig2`: spreading factor [7:4], tx continuous [3], CRC on [2],
/// symbol timeout msb [1:0]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ModemConfig2(u8);

impl ModemConfig2 {
    const SF_MASK: u8 = 0xf0;
    const CRC_MASK: u8 = 0x04;

    pub const fn spreading_factor(self) -> u8 {
        (self.0 & Self::SF_MASK) >> 4
    }

    pub const fn crc_on(self) -> bool {
        self.0 & Self::CRC_MASK != 0
    }

    pub const fn with_spreading_factor(self, sf: u8) -> Self {
        Self(merge(self.0, Self::SF_MASK, 4, sf))
    }

    pub const fn with_crc(self, on: bool) -> Self {
        Self(merge(self.0, Self::CRC_MASK, 2, on as u8))
    }
}

/// `RegPaConfig`: PA select [7], max power [6:4], output power [3:0]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct PaConfig(u8);

impl PaConfig {
    /// PA_BOOST output at `dbm` (already clamped to 2..=17)
    pub const fn boost(dbm: u8) -> Self {
        Self(PA_BOOST | ((dbm - 2) & 0x0f))
    }
}

macro_rules! impl_register {
    ($($t:ident => $reg:ident),* $(,)?) => {
        $(
            impl From<u8> for $t {
                fn from(raw: u8) -> Self {
                    Self(raw)
                }
            }

            impl From<$t> for u8 {
                fn from(r: $t) -> u8 {
                    r.0
                }
            }

            impl Register for $t {
                const ADDR: Reg = Reg::$reg;
            }
        )*
    };
}

impl_register!(
    OpMode => OpMode,
    ModemConfig1 => ModemConfig1,
    ModemConfig2 => ModemConfig2,
    PaConfig => PaConfig,
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frequency_word_868mhz() {
        let frf = frequency_word(868_000_000);
        assert_eq!(frf, 0xd9_0000);
        assert_eq!(frequency_bytes(frf), [0xd9, 0x00, 0x00]);
    }

    #[test]
    fn frequency_word_truncates() {
        // 915 MHz lands exactly, 433.1 MHz does not
        assert_eq!(frequency_word(915_000_000), 0xe4_c000);
        assert_eq!(frequency_word(433_100_000), 0x6c_4666);
        assert_eq!(frequency_bytes(0x6c_4666), [0x6c, 0x46, 0x66]);
    }

    #[test]
    fn frequency_word_saturates() {
        assert_eq!(frequency_word(64_000_000_000), 0xff_ffff);
        assert_eq!(frequency_word(1 << 45), 0xff_ffff);
        assert_eq!(frequency_word(u64::MAX), 0xff_ffff);
    }

    #[test]
    fn modem_config_2_keeps_low_nibble() {
        let r = ModemConfig2::from(0x77).with_spreading_factor(12);
        assert_eq!(u8::from(r), 0xc7);
        assert_eq!(r.spreading_factor(), 12);
        assert!(r.crc_on());

        let r = r.with_crc(false);
        assert_eq!(u8::from(r), 0xc3);
    }

    #[test]
    fn modem_config_1_fields_are_independent() {
        let r = ModemConfig1::from(0x72).with_coding_rate(4);
        assert_eq!(u8::from(r), 0x78);
        let r = r.with_bandwidth(9);
        assert_eq!(u8::from(r), 0x98);
        assert_eq!(r.bandwidth(), 9);
        assert_eq!(r.coding_rate(), 4);
        assert!(!r.implicit_header());
    }

    #[test]
    fn pa_boost_power() {
        assert_eq!(u8::from(PaConfig::boost(17)), 0x8f);
        assert_eq!(u8::from(PaConfig::boost(2)), 0x80);
    }
}
