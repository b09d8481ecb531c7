//! Receiver gateway
//!
//! Listens on the sensor node's channel and hands every decoded payload,
//! unmodified, to a `Forwarder`. Forwarding failures are logged and dropped,
//! there is no retry or backpressure.

use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiDevice;
use rolling_stats::Stats;

use crate::blocking::{poll, BlockingError, BlockingReceive};
use crate::config::GatewayConfig;
use crate::node::LinkManager;
use crate::registers::IrqFlags;
use crate::{BasicInfo, Receive, Sx127x, MAX_PACKET_LEN};

/// Downstream consumer of received payloads
pub trait Forwarder {
    fn forward(&mut self, payload: &str, info: &BasicInfo) -> Result<(), ForwardError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("forwarder io error: {0}")]
    Io(#[from] io::Error),

    #[error("collector rejected payload: {0}")]
    Rejected(String),
}

/// Logs payloads at info level
#[derive(Clone, Debug, Default)]
pub struct LogForwarder;

impl Forwarder for LogForwarder {
    fn forward(&mut self, payload: &str, info: &BasicInfo) -> Result<(), ForwardError> {
        info!("rx {} (rssi {} dBm, snr {:.2} dB)", payload, info.rssi, info.snr);
        Ok(())
    }
}

/// Writes newline delimited payloads, e.g. to stdout for a collector client
#[derive(Debug)]
pub struct WriteForwarder<W> {
    inner: W,
}

impl<W: Write> WriteForwarder<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Forwarder for WriteForwarder<W> {
    fn forward(&mut self, payload: &str, _info: &BasicInfo) -> Result<(), ForwardError> {
        writeln!(self.inner, "{}", payload)?;
        self.inner.flush()?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("radio not detected after {attempts} polls")]
    RadioNotDetected { attempts: u32 },

    #[error("no connectivity after {0:?}")]
    ConnectivityTimeout(Duration),

    #[error("radio error: {0}")]
    Radio(String),
}

fn radio_error<E: fmt::Debug>(e: E) -> GatewayError {
    GatewayError::Radio(format!("{:?}", e))
}

/// Rolling link statistics
pub struct LinkStats {
    pub rssi: Stats<f32>,
    pub snr: Stats<f32>,
    pub received: u32,
    pub forwarded: u32,
    pub crc_errors: u32,
    pub invalid: u32,
    pub forward_errors: u32,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            rssi: Stats::new(),
            snr: Stats::new(),
            received: 0,
            forwarded: 0,
            crc_errors: 0,
            invalid: 0,
            forward_errors: 0,
        }
    }
}

impl LinkStats {
    fn update(&mut self, info: &BasicInfo) {
        self.received += 1;
        self.rssi.update(info.rssi as f32);
        self.snr.update(info.snr);
    }
}

impl fmt::Display for LinkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} received, {} forwarded, {} crc errors, {} invalid; rssi {:.1} dBm (min {:.0} max {:.0}), snr {:.2} dB (std dev {:.2})",
            self.received,
            self.forwarded,
            self.crc_errors,
            self.invalid,
            self.rssi.mean,
            self.rssi.min,
            self.rssi.max,
            self.snr.mean,
            self.snr.std_dev
        )
    }
}

/// A received packet
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub info: BasicInfo,
}

/// Receiver node
pub struct Gateway<Spi, Rst, Delay, F> {
    radio: Sx127x<Spi, Rst, Delay>,
    delay: Delay,
    forwarder: F,
    link: Box<dyn LinkManager>,
    config: GatewayConfig,
    stats: LinkStats,
}

impl<Spi, Rst, Delay, F> Gateway<Spi, Rst, Delay, F>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    Delay: DelayNs,
    F: Forwarder,
{
    /// `delay` paces reception polling, the driver keeps its own
    pub fn new(
        radio: Sx127x<Spi, Rst, Delay>,
        delay: Delay,
        forwarder: F,
        link: Box<dyn LinkManager>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            radio,
            delay,
            forwarder,
            link,
            config,
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }

    pub fn radio_mut(&mut self) -> &mut Sx127x<Spi, Rst, Delay> {
        &mut self.radio
    }

    /// Wait for the link, bring up the radio and enter continuous receive
    pub fn start(&mut self) -> Result<(), GatewayError> {
        let timeout = self.config.connect_timeout;
        if !self.link.wait_connected(timeout) {
            return Err(GatewayError::ConnectivityTimeout(timeout));
        }

        let outcome = self.radio.init().map_err(radio_error)?;
        if !outcome.completed {
            return Err(GatewayError::RadioNotDetected {
                attempts: outcome.attempts,
            });
        }

        self.radio
            .configure(&self.config.radio)
            .map_err(radio_error)?;
        self.radio.start_receive().map_err(radio_error)?;

        info!(
            "listening on {} Hz (strict crc: {})",
            self.config.radio.clamped().carrier_frequency_hz,
            self.config.strict_crc
        );
        Ok(())
    }

    /// Poll for one packet, `None` when the poll ceiling passed without one
    pub fn receive(&mut self) -> Result<Option<Packet>, GatewayError> {
        let mut buff = [0u8; MAX_PACKET_LEN];

        let (n, info) = if self.config.strict_crc {
            match self
                .radio
                .do_receive(&mut self.delay, &mut buff, &self.config.poll)
            {
                Ok(r) => r,
                Err(BlockingError::Timeout) => return Ok(None),
                Err(BlockingError::Inner(e)) => return Err(radio_error(e)),
            }
        } else {
            let radio = &mut self.radio;
            let outcome = poll(&mut self.delay, &self.config.poll, || radio.received())
                .map_err(radio_error)?;
            if !outcome.completed {
                return Ok(None);
            }

            if self.radio.crc_error().map_err(radio_error)? {
                warn!("accepting packet with bad CRC");
                self.stats.crc_errors += 1;
                self.radio
                    .clear_irq(IrqFlags::PAYLOAD_CRC_ERROR)
                    .map_err(radio_error)?;
            }

            self.radio.get_received(&mut buff).map_err(radio_error)?
        };

        self.stats.update(&info);
        Ok(Some(Packet {
            data: buff[..n].to_vec(),
            info,
        }))
    }

    /// Receive and forward at most one packet, true if one was forwarded
    pub fn process_one(&mut self) -> Result<bool, GatewayError> {
        let packet = match self.receive()? {
            Some(p) => p,
            None => return Ok(false),
        };

        debug!(
            "{} bytes, rssi {} dBm, snr {:.2} dB",
            packet.data.len(),
            packet.info.rssi,
            packet.info.snr
        );

        let payload = match std::str::from_utf8(&packet.data) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping non UTF-8 payload: {}", e);
                self.stats.invalid += 1;
                return Ok(false);
            }
        };

        match self.forwarder.forward(payload, &packet.info) {
            Ok(()) => {
                self.stats.forwarded += 1;
                Ok(true)
            }
            Err(e) => {
                error!("forwarding failed: {}", e);
                self.stats.forward_errors += 1;
                Ok(false)
            }
        }
    }

    /// Receive and forward until the radio fails
    pub fn run(&mut self) -> Result<(), GatewayError> {
        self.start()?;

        loop {
            if self.process_one()? && self.stats.forwarded % 10 == 0 {
                info!("{}", self.stats);
            }
        }
    }
}
