//! SX1276/77/78/79 LoRa transceiver driver
//!
//! Translates radio intent into register operations and hides the mode
//! transitions the chip requires: configuration only in sleep or standby,
//! standby before FIFO access, then TX or continuous RX.
//!
//! Chip modes: `Sleep <-> Standby <-> {Tx, RxContinuous}`. Only `send_packet`
//! and `receive_mode` leave standby. The driver is a single-owner resource and
//! does no internal locking.
//!
//! ## https://github.com/rust-iot/radio-hal
//! ## Copyright 2020-2022 Ryan Kurte

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiDevice;

use crate::blocking::{poll, PollOutcome};
use crate::bus::{RegisterBus, Registers};
use crate::config::{DriverConfig, RadioConfig, MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ};
use crate::modulation::lora::{Bandwidth, CodingRate, SpreadingFactor, TxPower};
use crate::registers::*;
use crate::{BasicInfo, Receive, Rssi, Transmit, MAX_PACKET_LEN};

/// Transceiver mode as tracked by the driver
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Mode {
    Sleep,
    Standby,
    Tx,
    RxContinuous,
}

impl Mode {
    const fn bits(self) -> u8 {
        match self {
            Mode::Sleep => MODE_SLEEP,
            Mode::Standby => MODE_STDBY,
            Mode::Tx => MODE_TX,
            Mode::RxContinuous => MODE_RX_CONTINUOUS,
        }
    }

    fn from_op_mode(op: OpMode) -> Self {
        match op.mode() {
            MODE_SLEEP => Mode::Sleep,
            MODE_TX => Mode::Tx,
            MODE_RX_CONTINUOUS => Mode::RxContinuous,
            _ => Mode::Standby,
        }
    }
}

/// Driver error type
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum Error<SpiErr, PinErr> {
    /// Register bus transfer failed
    #[cfg_attr(feature = "std", error("register bus error: {0:?}"))]
    Bus(SpiErr),
    /// Reset line could not be driven
    #[cfg_attr(feature = "std", error("reset pin error: {0:?}"))]
    Pin(PinErr),
    /// Payload does not fit the FIFO
    #[cfg_attr(feature = "std", error("packet of {0} bytes exceeds the 255 byte FIFO"))]
    PacketTooLong(usize),
    /// Received payload failed its CRC check
    #[cfg_attr(feature = "std", error("payload CRC error"))]
    Crc,
}

/// Driver-owned state
#[derive(Clone, Debug, PartialEq)]
pub struct DriverState {
    pub mode: Mode,
    /// Transmissions whose completion was never observed, process lifetime
    pub lost_packet_count: u32,
}

/// SX127x LoRa driver
pub struct Sx127x<Spi, Rst, Delay> {
    bus: RegisterBus<Spi>,
    reset: Rst,
    delay: Delay,
    config: DriverConfig,
    state: DriverState,

    bandwidth: Bandwidth,
    frequency_hz: u64,
}

impl<Spi, Rst, Delay> Sx127x<Spi, Rst, Delay>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    Delay: DelayNs,
{
    pub fn new(spi: Spi, reset: Rst, delay: Delay) -> Self {
        Self::with_config(spi, reset, delay, DriverConfig::default())
    }

    pub fn with_config(spi: Spi, reset: Rst, delay: Delay, config: DriverConfig) -> Self {
        Self {
            bus: RegisterBus::new(spi),
            reset,
            delay,
            config,
            state: DriverState {
                mode: Mode::Standby,
                lost_packet_count: 0,
            },
            bandwidth: Bandwidth::Bw125kHz,
            frequency_hz: 0,
        }
    }

    /// Pulse the reset line and wait for the oscillator to settle
    pub fn reset(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.reset.set_low().map_err(Error::Pin)?;
        self.delay.delay_ms(1);
        self.reset.set_high().map_err(Error::Pin)?;
        self.delay.delay_ms(10);

        Ok(())
    }

    /// Reset the chip, wait for its identity and apply the default configuration
    ///
    /// The returned outcome is incomplete when the version register never
    /// matched; in that case nothing has been written to the device and the
    /// driver state is untouched.
    pub fn init(&mut self) -> Result<PollOutcome, Error<Spi::Error, Rst::Error>> {
        self.reset()?;

        let expected = self.config.probe.expected_version;
        let bus = &mut self.bus;
        let outcome = poll(&mut self.delay, &self.config.probe.poll, || {
            let version = bus.reg_read(Reg::Version)?;
            debug!("version=0x{:02x}", version);
            Ok(version == expected)
        })
        .map_err(Error::Bus)?;

        if !outcome.completed {
            error!(
                "SX127x not detected after {} polls (expected version 0x{:02x})",
                outcome.attempts, expected
            );
            return Ok(outcome);
        }

        debug!("SX127x detected after {} polls", outcome.attempts);

        self.sleep()?;
        self.write(Reg::FifoRxBaseAddr, 0)?;
        self.write(Reg::FifoTxBaseAddr, 0)?;
        let lna = self.read(Reg::Lna)?;
        self.write(Reg::Lna, lna | LNA_BOOST_HF)?;
        self.write(Reg::ModemConfig3, MODEM_CONFIG_3_AGC_AUTO)?;
        self.set_tx_power(TxPower::MAX_DBM as i8)?;

        self.sync_from_chip()?;
        self.idle()?;

        Ok(outcome)
    }

    /// Rebuild the cached mode, bandwidth and frequency from the chip
    ///
    /// Used when the process restarts while the transceiver kept its registers.
    pub fn resume(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.sync_from_chip()?;
        debug!(
            "resumed in {:?} at {} Hz, {:?}",
            self.state.mode, self.frequency_hz, self.bandwidth
        );
        Ok(())
    }

    fn sync_from_chip(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        let op = self.bus.read::<OpMode>().map_err(Error::Bus)?;
        self.state.mode = Mode::from_op_mode(op);

        self.bandwidth = Bandwidth::clamped(self.read_modem_config_1()?.bandwidth());

        let mut frf = [0u8; 3];
        self.bus
            .read_burst(Reg::FrfMsb, &mut frf)
            .map_err(Error::Bus)?;
        let frf = (frf[0] as u64) << 16 | (frf[1] as u64) << 8 | frf[2] as u64;
        self.frequency_hz = (frf * FXOSC_HZ) >> 19;

        Ok(())
    }

    /// Apply a complete link configuration, clamping every field
    pub fn configure(&mut self, config: &RadioConfig) -> Result<(), Error<Spi::Error, Rst::Error>> {
        let c = config.clamped();
        debug!("configure {:?}", c);

        self.set_frequency(c.carrier_frequency_hz)?;
        self.set_spreading_factor(c.spreading_factor)?;
        self.set_bandwidth(c.bandwidth_code)?;
        self.set_coding_rate(c.coding_rate)?;
        self.set_tx_power(c.tx_power_dbm)?;
        if c.crc_enabled {
            self.enable_crc()
        } else {
            self.disable_crc()
        }
    }

    /// Set the carrier frequency in Hz, clamped to the synthesizer range
    ///
    /// Writes `floor(hz * 2^19 / 32 MHz)` to `RegFrfMsb..RegFrfLsb`, no rounding.
    pub fn set_frequency(&mut self, hz: u64) -> Result<(), Error<Spi::Error, Rst::Error>> {
        let hz = hz.clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ);
        self.ensure_idle()?;

        let [msb, mid, lsb] = frequency_bytes(frequency_word(hz));
        self.write(Reg::FrfMsb, msb)?;
        self.write(Reg::FrfMid, mid)?;
        self.write(Reg::FrfLsb, lsb)?;

        self.frequency_hz = hz;
        Ok(())
    }

    /// Set the spreading factor, clamped to 6..=12
    pub fn set_spreading_factor(&mut self, sf: u8) -> Result<(), Error<Spi::Error, Rst::Error>> {
        let sf = SpreadingFactor::clamped(sf);
        self.ensure_idle()?;

        let (optimize, threshold) = match sf {
            SpreadingFactor::Sf6 => DETECTION_SF6,
            _ => DETECTION_SF7_12,
        };
        self.write(Reg::DetectionOptimize, optimize)?;
        self.write(Reg::DetectionThreshold, threshold)?;

        self.bus
            .modify::<ModemConfig2>(|r| r.with_spreading_factor(sf.value()))
            .map_err(Error::Bus)?;
        Ok(())
    }

    /// Set the bandwidth code, clamped to 0..=9
    pub fn set_bandwidth(&mut self, code: u8) -> Result<(), Error<Spi::Error, Rst::Error>> {
        let bw = Bandwidth::clamped(code);
        self.ensure_idle()?;

        self.bus
            .modify::<ModemConfig1>(|r| r.with_bandwidth(bw.code()))
            .map_err(Error::Bus)?;

        debug!("bandwidth {} Hz", bw.hz());
        self.bandwidth = bw;
        Ok(())
    }

    /// Set the coding rate, clamped to 1..=4 (4/5 to 4/8)
    pub fn set_coding_rate(&mut self, cr: u8) -> Result<(), Error<Spi::Error, Rst::Error>> {
        let cr = CodingRate::clamped(cr);
        self.ensure_idle()?;

        self.bus
            .modify::<ModemConfig1>(|r| r.with_coding_rate(cr.code()))
            .map_err(Error::Bus)?;
        Ok(())
    }

    /// Set the output power in dBm, clamped to 2..=17, always through PA_BOOST
    pub fn set_tx_power(&mut self, dbm: i8) -> Result<(), Error<Spi::Error, Rst::Error>> {
        let power = TxPower::clamped(dbm);
        self.ensure_idle()?;

        self.bus
            .write(PaConfig::boost(power.dbm()))
            .map_err(Error::Bus)
    }

    /// Append a CRC on transmit and verify it on receive
    pub fn enable_crc(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.set_crc(true)
    }

    pub fn disable_crc(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.set_crc(false)
    }

    fn set_crc(&mut self, on: bool) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.ensure_idle()?;

        self.bus
            .modify::<ModemConfig2>(|r| r.with_crc(on))
            .map_err(Error::Bus)?;
        Ok(())
    }

    pub fn spreading_factor(&mut self) -> Result<u8, Error<Spi::Error, Rst::Error>> {
        let r = self.bus.read::<ModemConfig2>().map_err(Error::Bus)?;
        Ok(r.spreading_factor())
    }

    pub fn bandwidth(&mut self) -> Result<u8, Error<Spi::Error, Rst::Error>> {
        Ok(self.read_modem_config_1()?.bandwidth())
    }

    pub fn coding_rate(&mut self) -> Result<u8, Error<Spi::Error, Rst::Error>> {
        Ok(self.read_modem_config_1()?.coding_rate())
    }

    fn read_modem_config_1(&mut self) -> Result<ModemConfig1, Error<Spi::Error, Rst::Error>> {
        self.bus.read::<ModemConfig1>().map_err(Error::Bus)
    }

    /// Transmit a packet and poll for completion
    ///
    /// The poll ceiling scales with the configured bandwidth. When completion is
    /// never observed the lost packet counter is incremented and the call still
    /// returns `Ok`, check `packets_lost()` or the returned outcome.
    pub fn send_packet(&mut self, data: &[u8]) -> Result<PollOutcome, Error<Spi::Error, Rst::Error>> {
        self.start_transmit(data)?;

        let options = self.config.tx_poll.options(self.bandwidth);
        debug!(
            "{:?} tx poll ceiling {} x {:?}",
            self.bandwidth, options.max_attempts, options.interval
        );

        let bus = &mut self.bus;
        let outcome = poll(&mut self.delay, &options, || {
            let irq = IrqFlags::from_bits_retain(bus.reg_read(Reg::IrqFlags)?);
            trace!("irq flags {:?}", irq);
            Ok(irq.contains(IrqFlags::TX_DONE))
        })
        .map_err(Error::Bus)?;

        if outcome.completed {
            self.state.mode = Mode::Standby;
        } else {
            self.state.lost_packet_count += 1;
            error!(
                "send_packet: no tx done after {} polls ({} lost)",
                outcome.attempts, self.state.lost_packet_count
            );
        }

        self.clear_irq(IrqFlags::TX_DONE)?;

        Ok(outcome)
    }

    /// Enter continuous receive mode
    pub fn receive_mode(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.set_mode(Mode::RxContinuous)
    }

    /// True when the RX done IRQ is set
    pub fn received(&mut self) -> Result<bool, Error<Spi::Error, Rst::Error>> {
        Ok(self.irq_flags()?.contains(IrqFlags::RX_DONE))
    }

    /// True when the payload CRC error IRQ is set
    pub fn crc_error(&mut self) -> Result<bool, Error<Spi::Error, Rst::Error>> {
        Ok(self.irq_flags()?.contains(IrqFlags::PAYLOAD_CRC_ERROR))
    }

    /// Copy the last received packet into `buff`, returning the number of bytes written
    ///
    /// The packet is truncated to `buff.len()`. Only the RX done IRQ is cleared;
    /// the CRC error IRQ is not checked here and stays observable through
    /// `crc_error()`.
    pub fn receive_packet(&mut self, buff: &mut [u8]) -> Result<usize, Error<Spi::Error, Rst::Error>> {
        let current = self.read(Reg::FifoRxCurrentAddr)?;
        self.write(Reg::FifoAddrPtr, current)?;

        let n = (self.read(Reg::RxNbBytes)? as usize).min(buff.len());
        self.bus
            .read_burst(Reg::Fifo, &mut buff[..n])
            .map_err(Error::Bus)?;

        self.clear_irq(IrqFlags::RX_DONE)?;

        Ok(n)
    }

    /// RSSI of the last received packet in dBm
    pub fn packet_rssi(&mut self) -> Result<i16, Error<Spi::Error, Rst::Error>> {
        let raw = self.read(Reg::PktRssiValue)?;
        Ok(raw as i16 - self.rssi_offset())
    }

    /// SNR of the last received packet in dB
    pub fn packet_snr(&mut self) -> Result<f32, Error<Spi::Error, Rst::Error>> {
        let raw = self.read(Reg::PktSnrValue)? as i8;
        Ok(raw as f32 * 0.25)
    }

    /// Current channel RSSI in dBm
    pub fn rssi(&mut self) -> Result<i16, Error<Spi::Error, Rst::Error>> {
        let raw = self.read(Reg::RssiValue)?;
        Ok(raw as i16 - self.rssi_offset())
    }

    fn rssi_offset(&self) -> i16 {
        if self.frequency_hz >= HF_PORT_MIN_HZ {
            RSSI_OFFSET_HF
        } else {
            RSSI_OFFSET_LF
        }
    }

    /// Number of transmissions whose completion was never observed
    pub fn packets_lost(&self) -> u32 {
        self.state.lost_packet_count
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    /// Put the transceiver to sleep
    ///
    /// The bus, reset pin and delay stay owned by the driver; use `release` to
    /// take them back.
    pub fn close(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.sleep()
    }

    /// Destroy the driver, returning the underlying resources
    pub fn release(self) -> (Spi, Rst, Delay) {
        (self.bus.release(), self.reset, self.delay)
    }

    pub fn irq_flags(&mut self) -> Result<IrqFlags, Error<Spi::Error, Rst::Error>> {
        Ok(IrqFlags::from_bits_retain(self.read(Reg::IrqFlags)?))
    }

    pub fn clear_irq(&mut self, flags: IrqFlags) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.write(Reg::IrqFlags, flags.bits())
    }

    fn idle(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.set_mode(Mode::Standby)
    }

    fn sleep(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.set_mode(Mode::Sleep)
    }

    /// Configuration writes are only valid in sleep or standby
    fn ensure_idle(&mut self) -> Result<(), Error<Spi::Error, Rst::Error>> {
        match self.state.mode {
            Mode::Tx | Mode::RxContinuous => self.idle(),
            Mode::Sleep | Mode::Standby => Ok(()),
        }
    }

    fn set_mode(&mut self, mode: Mode) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.bus
            .write(OpMode::lora(mode.bits()))
            .map_err(Error::Bus)?;

        if self.state.mode != mode {
            debug!("mode {:?} -> {:?}", self.state.mode, mode);
        }
        self.state.mode = mode;

        Ok(())
    }

    fn read(&mut self, reg: Reg) -> Result<u8, Error<Spi::Error, Rst::Error>> {
        self.bus.reg_read(reg).map_err(Error::Bus)
    }

    fn write(&mut self, reg: Reg, value: u8) -> Result<(), Error<Spi::Error, Rst::Error>> {
        self.bus.reg_write(reg, value).map_err(Error::Bus)
    }
}

impl<Spi, Rst, Delay> Transmit for Sx127x<Spi, Rst, Delay>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    Delay: DelayNs,
{
    type Error = Error<Spi::Error, Rst::Error>;

    fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if data.len() > MAX_PACKET_LEN {
            return Err(Error::PacketTooLong(data.len()));
        }

        self.idle()?;
        self.write(Reg::FifoAddrPtr, 0)?;
        self.bus.write_burst(Reg::Fifo, data).map_err(Error::Bus)?;
        self.write(Reg::PayloadLength, data.len() as u8)?;

        self.set_mode(Mode::Tx)
    }

    fn check_transmit(&mut self) -> Result<bool, Self::Error> {
        Ok(self.irq_flags()?.contains(IrqFlags::TX_DONE))
    }
}

impl<Spi, Rst, Delay> Receive for Sx127x<Spi, Rst, Delay>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    Delay: DelayNs,
{
    type Error = Error<Spi::Error, Rst::Error>;
    type Info = BasicInfo;

    fn start_receive(&mut self) -> Result<(), Self::Error> {
        self.receive_mode()
    }

    /// Reports a packet only once it passed its CRC check, bad packets are dropped
    fn check_receive(&mut self, restart: bool) -> Result<bool, Self::Error> {
        let irq = self.irq_flags()?;

        if !irq.contains(IrqFlags::RX_DONE) {
            return Ok(false);
        }

        if irq.contains(IrqFlags::PAYLOAD_CRC_ERROR) {
            warn!("dropping packet with bad CRC");
            self.clear_irq(IrqFlags::RX_DONE | IrqFlags::PAYLOAD_CRC_ERROR)?;

            if !restart {
                return Err(Error::Crc);
            }
            if self.state.mode != Mode::RxContinuous {
                self.receive_mode()?;
            }
            return Ok(false);
        }

        Ok(true)
    }

    fn get_received(&mut self, buff: &mut [u8]) -> Result<(usize, Self::Info), Self::Error> {
        let info = BasicInfo::new(self.packet_rssi()?, self.packet_snr()?);
        let n = self.receive_packet(buff)?;

        Ok((n, info))
    }
}

impl<Spi, Rst, Delay> Rssi for Sx127x<Spi, Rst, Delay>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    Delay: DelayNs,
{
    type Error = Error<Spi::Error, Rst::Error>;

    fn poll_rssi(&mut self) -> Result<i16, Self::Error> {
        self.rssi()
    }
}
