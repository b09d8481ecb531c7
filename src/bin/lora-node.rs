//! LoRa sensor node and gateway command line utility
//!
//! ## https://github.com/rust-iot/radio-hal
//! ## Copyright 2020 Ryan Kurte

use log::{info, LevelFilter};
use structopt::StructOpt;

use lora_sensor_node::helpers::{do_gateway, do_node, do_rssi, do_transmit, Operation};
use lora_sensor_node::rpi::HardwareOptions;

#[derive(StructOpt, Debug)]
#[structopt(name = "lora-node", about = "SX127x LoRa sensor node utility")]
struct Options {
    #[structopt(subcommand)]
    operation: Operation,

    #[structopt(flatten)]
    hardware: HardwareOptions,

    /// Log level (overridden by RUST_LOG)
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Options::from_args();

    env_logger::Builder::new()
        .filter_level(opts.log_level)
        .parse_default_env()
        .init();

    info!("lora-node {}", env!("CARGO_PKG_VERSION"));

    let mut radio = opts.hardware.radio()?;

    match opts.operation {
        Operation::Node(o) => {
            let sensors = opts.hardware.sensors()?;
            do_node(radio, sensors, o)?;
        }
        Operation::Gateway(o) => {
            do_gateway(radio, opts.hardware.delay(), o)?;
        }
        Operation::Transmit(o) => {
            do_transmit(&mut radio, o)?;
        }
        Operation::Rssi(o) => {
            do_rssi(&mut radio, o)?;
        }
    }

    Ok(())
}
