//! Provides common helpers for implementing node and gateway utilities
//!
//! ## https://github.com/rust-iot/radio-hal
//! ## Copyright 2020 Ryan Kurte

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiDevice;
use structopt::StructOpt;

use crate::config::{GatewayConfig, NodeConfig, RadioConfig};
use crate::gateway::{Gateway, GatewayError, LogForwarder, WriteForwarder};
use crate::node::{
    AlwaysConnected, FileStore, MemoryStore, NodeController, NodeError, RetainedStore,
    ThreadSleep, WakeCause,
};
use crate::sensors::{dust, Sensor, SensorKind, SoundLevel};
use crate::{Rssi, Sx127x};

/// Operations supported by the command line utility
#[derive(Clone, StructOpt, PartialEq, Debug)]
pub enum Operation {
    #[structopt(name = "node")]
    /// Run the sensor node duty cycle
    Node(NodeOptions),

    #[structopt(name = "gateway")]
    /// Receive packets and forward their payloads
    Gateway(GatewayOptions),

    #[structopt(name = "tx")]
    /// Transmit a packet
    Transmit(TransmitOptions),

    #[structopt(name = "rssi")]
    /// Poll RSSI on the configured channel
    Rssi(RssiOptions),
}

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("radio not detected after {0} polls")]
    NotDetected(u32),

    #[error("radio error: {0}")]
    Radio(String),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn radio_error<E: core::fmt::Debug>(e: E) -> HelperError {
    HelperError::Radio(format!("{:?}", e))
}

/// Configuration for the node operation
#[derive(Clone, StructOpt, PartialEq, Debug)]
pub struct NodeOptions {
    #[structopt(flatten)]
    pub config: NodeConfig,

    /// File retaining the node state across restarts
    #[structopt(long)]
    pub state_file: Option<PathBuf>,

    /// Resume from the retained state instead of cold starting
    #[structopt(long)]
    pub resume: bool,

    /// I2S capture stream (raw 32-bit little endian frames) for the sound level
    #[structopt(long)]
    pub mic: Option<PathBuf>,

    /// IIO raw value file of the ADC channel wired to the dust sensor
    #[structopt(long)]
    pub dust_adc: Option<PathBuf>,
}

/// Run the node controller forever
pub fn do_node<Spi, Rst, D>(
    radio: Sx127x<Spi, Rst, D>,
    mut sensors: Vec<Box<dyn Sensor>>,
    options: NodeOptions,
) -> Result<(), HelperError>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    D: DelayNs,
{
    if let Some(mic) = &options.mic {
        sensors.push(Box::new(SoundLevel::new(File::open(mic)?)));
    }
    if let Some(adc) = &options.dust_adc {
        sensors.push(Box::new(dust::iio(adc.clone())));
    }

    let kinds: Vec<SensorKind> = sensors.iter().map(|s| s.kind()).collect();
    info!("node sensors: {:?}", kinds);

    let store: Box<dyn RetainedStore> = match &options.state_file {
        Some(p) => Box::new(FileStore::new(p)),
        None => Box::new(MemoryStore::default()),
    };

    let mut node = NodeController::new(
        radio,
        sensors,
        Box::new(AlwaysConnected),
        store,
        Box::new(ThreadSleep),
        options.config,
    )?;

    let cause = if options.resume {
        WakeCause::Timer
    } else {
        WakeCause::PowerOn
    };
    node.boot(cause);
    node.run()
}

/// Configuration for the gateway operation
#[derive(Clone, StructOpt, PartialEq, Debug)]
pub struct GatewayOptions {
    #[structopt(flatten)]
    pub config: GatewayConfig,

    /// Append payloads to this file instead of logging them
    #[structopt(long)]
    pub output: Option<PathBuf>,
}

/// Receive and forward until the radio fails
pub fn do_gateway<Spi, Rst, D>(
    radio: Sx127x<Spi, Rst, D>,
    delay: D,
    options: GatewayOptions,
) -> Result<(), HelperError>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    D: DelayNs,
{
    let link = Box::new(AlwaysConnected);

    match &options.output {
        Some(p) => {
            let f = OpenOptions::new().create(true).append(true).open(p)?;
            let mut g = Gateway::new(radio, delay, WriteForwarder::new(f), link, options.config);
            g.run()?;
        }
        None => {
            let mut g = Gateway::new(radio, delay, LogForwarder, link, options.config);
            g.run()?;
        }
    }

    Ok(())
}

/// Configuration for the transmit operation
#[derive(Clone, StructOpt, PartialEq, Debug)]
pub struct TransmitOptions {
    #[structopt(flatten)]
    pub radio: RadioConfig,

    /// Data to be transmitted
    #[structopt(long)]
    pub data: String,

    /// Specify period for repeated transmission
    #[structopt(long, parse(try_from_str = crate::duration_from_str))]
    pub period: Option<Duration>,
}

pub fn do_transmit<Spi, Rst, D>(
    radio: &mut Sx127x<Spi, Rst, D>,
    options: TransmitOptions,
) -> Result<(), HelperError>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    D: DelayNs,
{
    bring_up(radio, &options.radio)?;

    loop {
        let outcome = radio
            .send_packet(options.data.as_bytes())
            .map_err(radio_error)?;
        info!(
            "sent {} bytes ({} polls, {} lost)",
            options.data.len(),
            outcome.attempts,
            radio.packets_lost()
        );

        match options.period {
            Some(p) => thread::sleep(p),
            None => break,
        }
    }

    radio.close().map_err(radio_error)
}

/// Configuration for the RSSI operation
#[derive(Clone, StructOpt, PartialEq, Debug)]
pub struct RssiOptions {
    #[structopt(flatten)]
    pub radio: RadioConfig,

    /// Interval between RSSI polls
    #[structopt(long, default_value = "1s", parse(try_from_str = crate::duration_from_str))]
    pub period: Duration,

    /// Number of polls, zero for continuous
    #[structopt(long, default_value = "1")]
    pub count: u32,
}

pub fn do_rssi<Spi, Rst, D>(
    radio: &mut Sx127x<Spi, Rst, D>,
    options: RssiOptions,
) -> Result<Vec<i16>, HelperError>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    D: DelayNs,
{
    bring_up(radio, &options.radio)?;
    radio.receive_mode().map_err(radio_error)?;

    let mut values = vec![];
    loop {
        let rssi = radio.poll_rssi().map_err(radio_error)?;
        info!("rssi: {} dBm", rssi);
        values.push(rssi);

        if options.count != 0 && values.len() >= options.count as usize {
            break;
        }
        thread::sleep(options.period);
    }

    radio.close().map_err(radio_error)?;
    Ok(values)
}

fn bring_up<Spi, Rst, D>(
    radio: &mut Sx127x<Spi, Rst, D>,
    config: &RadioConfig,
) -> Result<(), HelperError>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    D: DelayNs,
{
    let outcome = radio.init().map_err(radio_error)?;
    if !outcome.completed {
        return Err(HelperError::NotDetected(outcome.attempts));
    }

    radio.configure(config).map_err(radio_error)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{SimChip, SimDelay};
    use crate::registers::Reg;

    fn parse(args: &[&str]) -> Operation {
        Operation::from_iter_safe(args.iter().copied()).unwrap()
    }

    #[test]
    fn parse_node_defaults() {
        match parse(&["lora-node", "node"]) {
            Operation::Node(o) => {
                assert_eq!(o.config, NodeConfig::default());
                assert!(!o.resume);
                assert_eq!(o.dust_adc, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_node_dust_channel() {
        let args = ["lora-node", "node", "--dust-adc", "/sys/bus/iio/devices/iio:device0/in_voltage0_raw"];
        match parse(&args) {
            Operation::Node(o) => assert_eq!(
                o.dust_adc,
                Some(PathBuf::from("/sys/bus/iio/devices/iio:device0/in_voltage0_raw"))
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_gateway_flags() {
        match parse(&["lora-node", "gateway", "--accept-bad-crc", "--sf", "9"]) {
            Operation::Gateway(o) => {
                assert!(!o.config.strict_crc);
                assert_eq!(o.config.radio.spreading_factor, 9);
                assert!(o.config.radio.crc_enabled);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_transmit() {
        let op = parse(&["lora-node", "tx", "--data", "hello", "--no-crc", "--period", "5s"]);
        match op {
            Operation::Transmit(o) => {
                assert_eq!(o.data, "hello");
                assert!(!o.radio.crc_enabled);
                assert_eq!(o.period, Some(Duration::from_secs(5)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn transmit_once() {
        let chip = SimChip::new();
        let mut radio = Sx127x::new(chip.clone(), chip.reset_pin(), SimDelay::default());

        let options = TransmitOptions {
            radio: RadioConfig::default(),
            data: "ping".to_string(),
            period: None,
        };
        do_transmit(&mut radio, options).unwrap();

        assert_eq!(chip.transmitted(), vec![b"ping".to_vec()]);
        assert_eq!(radio.mode(), crate::Mode::Sleep);
    }

    #[test]
    fn rssi_polls() {
        let chip = SimChip::new();
        let mut radio = Sx127x::new(chip.clone(), chip.reset_pin(), SimDelay::default());

        let options = RssiOptions {
            radio: RadioConfig::default(),
            period: Duration::ZERO,
            count: 3,
        };

        // init resets the chip, RegRssiValue reads back zero
        assert_eq!(do_rssi(&mut radio, options).unwrap(), vec![-157; 3]);
        assert_eq!(chip.reg(Reg::OpMode) & 0x07, 0x00);
    }

    #[test]
    fn missing_radio_is_reported() {
        let chip = SimChip::with_version(0x00);
        let mut radio = Sx127x::new(chip.clone(), chip.reset_pin(), SimDelay::default());

        let options = TransmitOptions {
            radio: RadioConfig::default(),
            data: "ping".to_string(),
            period: None,
        };
        assert!(matches!(
            do_transmit(&mut radio, options),
            Err(HelperError::NotDetected(100))
        ));
    }
}
