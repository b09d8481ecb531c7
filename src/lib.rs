//! SX127x LoRa radio driver and duty-cycled sensor node
//!
//! The radio core (`bus`, `registers`, `modulation`, `blocking`, `config`, `sx127x`)
//! is `no_std` and built on `embedded-hal` 1.0 traits. The `std` feature adds the
//! sensor tasks, the node state machine and the receiver gateway.
//!
//! ## https://github.com/rust-iot/radio-hal
//! ## Copyright 2018-2022 Ryan Kurte

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]

#[macro_use]
extern crate log;

pub mod blocking;
pub mod bus;
pub mod config;
pub mod modulation;
pub mod registers;
pub mod sx127x;

#[cfg(feature = "std")]
pub mod gateway;
#[cfg(feature = "std")]
pub mod node;
#[cfg(feature = "std")]
pub mod sensors;
#[cfg(feature = "std")]
pub mod task;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(feature = "helpers")]
pub mod helpers;

#[cfg(feature = "rpi")]
pub mod rpi;

pub use config::RadioConfig;
pub use sx127x::{Error, Mode, Sx127x};

/// Largest payload the transceiver FIFO can carry in one packet
pub const MAX_PACKET_LEN: usize = 255;

/// Transmit trait for radios that can send packets
pub trait Transmit {
    /// Radio error
    type Error;

    /// Load the packet and start transmitting
    ///
    /// Returns an error if the transmission was not started
    fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Check for transmit completion
    ///
    /// Returns true for transmit complete, false otherwise
    fn check_transmit(&mut self) -> Result<bool, Self::Error>;
}

/// Receive trait for radios that can receive packets
pub trait Receive {
    /// Radio error
    type Error;
    /// Packet received info
    type Info: ReceiveInfo;

    /// Enter receive mode
    fn start_receive(&mut self) -> Result<(), Self::Error>;

    /// Check for reception
    ///
    /// The restart flag indicates on (recoverable) error conditions (such as invalid CRC)
    /// the radio should re-enter receive mode if required and continue reception.
    ///
    /// This returns true for received, false for not received, or the provided error
    fn check_receive(&mut self, restart: bool) -> Result<bool, Self::Error>;

    /// Fetch a received packet if rx is complete
    ///
    /// This copies received data into the provided buffer and returns the number of bytes received
    /// as well as information about the received packet
    fn get_received(&mut self, buff: &mut [u8]) -> Result<(usize, Self::Info), Self::Error>;
}

/// ReceiveInfo exposes link quality for a received packet
pub trait ReceiveInfo {
    fn rssi(&self) -> i16;
}

/// Rssi trait allows polling for RSSI on the current channel
pub trait Rssi {
    /// Radio error
    type Error;

    /// Fetch the current RSSI value from the radio
    /// Note that the radio MUST be in RX mode (or capable of measuring RSSI) when this is called
    fn poll_rssi(&mut self) -> Result<i16, Self::Error>;
}

/// Packet information for LoRa receptions, RSSI in dBm and SNR in dB
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BasicInfo {
    /// Received Signal Strength Indicator (RSSI) of received packet in dBm
    pub rssi: i16,
    /// Signal to noise ratio of received packet in dB
    pub snr: f32,
}

impl BasicInfo {
    pub fn new(rssi: i16, snr: f32) -> Self {
        Self { rssi, snr }
    }
}

impl ReceiveInfo for BasicInfo {
    fn rssi(&self) -> i16 {
        self.rssi
    }
}

/// Parse a human readable duration (`100ms`, `5s`, `1min`) for command line options
#[cfg(feature = "helpers")]
pub fn duration_from_str(s: &str) -> Result<core::time::Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}
