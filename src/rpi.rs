//! Raspberry Pi (Linux spidev / i2c-dev / gpiochip) hardware binding
//!
//! Wires an SX127x module on SPI with a GPIO reset line, and an optional BME280
//! on I2C, using `rppal`.

use rppal::gpio::{Gpio, OutputPin};
use rppal::hal::Delay;
use rppal::i2c::I2c;
use rppal::spi::{Bus, Mode, SimpleHalSpiDevice, SlaveSelect, Spi};
use structopt::StructOpt;

use crate::config::DriverConfig;
use crate::sensors::{Bme280, Sensor};
use crate::Sx127x;

/// Radio driver on Raspberry Pi peripherals
pub type PiRadio = Sx127x<SimpleHalSpiDevice<Spi>, OutputPin, Delay>;

#[derive(Debug, thiserror::Error)]
pub enum RpiError {
    #[error("gpio error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("spi error: {0}")]
    Spi(#[from] rppal::spi::Error),

    #[error("i2c error: {0}")]
    I2c(#[from] rppal::i2c::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Hardware wiring options
#[derive(Clone, StructOpt, PartialEq, Debug)]
pub struct HardwareOptions {
    /// SPI bus (0 or 1)
    #[structopt(long, default_value = "0")]
    pub spi_bus: u8,

    /// SPI chip select (0 to 2)
    #[structopt(long, default_value = "0")]
    pub spi_cs: u8,

    /// SPI clock in Hz
    #[structopt(long, default_value = "1000000")]
    pub spi_hz: u32,

    /// BCM GPIO driving the transceiver reset line
    #[structopt(long, default_value = "17")]
    pub reset_pin: u8,

    /// Skip the BME280 on the I2C bus
    #[structopt(long)]
    pub no_bme280: bool,

    /// BME280 I2C address
    #[structopt(long, default_value = "118")]
    pub bme280_address: u16,
}

impl HardwareOptions {
    /// Open the SPI device and reset line and build the radio driver
    pub fn radio(&self) -> Result<PiRadio, RpiError> {
        let bus = match self.spi_bus {
            0 => Bus::Spi0,
            1 => Bus::Spi1,
            b => return Err(RpiError::InvalidConfig(format!("unsupported SPI bus {}", b))),
        };
        let cs = match self.spi_cs {
            0 => SlaveSelect::Ss0,
            1 => SlaveSelect::Ss1,
            2 => SlaveSelect::Ss2,
            c => return Err(RpiError::InvalidConfig(format!("unsupported chip select {}", c))),
        };

        let spi = Spi::new(bus, cs, self.spi_hz, Mode::Mode0)?;
        let reset = Gpio::new()?.get(self.reset_pin)?.into_output_high();

        debug!(
            "radio on SPI{}.{} at {} Hz, reset on GPIO{}",
            self.spi_bus, self.spi_cs, self.spi_hz, self.reset_pin
        );

        Ok(Sx127x::with_config(
            SimpleHalSpiDevice::new(spi),
            reset,
            Delay::new(),
            DriverConfig::default(),
        ))
    }

    /// Delay for polling outside the driver
    pub fn delay(&self) -> Delay {
        Delay::new()
    }

    /// Temperature, pressure and humidity sensors, empty when disabled
    pub fn sensors(&self) -> Result<Vec<Box<dyn Sensor>>, RpiError> {
        if self.no_bme280 {
            return Ok(vec![]);
        }

        let address = u8::try_from(self.bme280_address).map_err(|_| {
            RpiError::InvalidConfig(format!("bad I2C address {}", self.bme280_address))
        })?;

        let dev = Bme280::with_address(I2c::new()?, address);
        Ok(dev
            .into_channels()
            .into_iter()
            .map(|c| Box::new(c) as Box<dyn Sensor>)
            .collect())
    }
}
