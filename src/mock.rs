//! Simulated SX127x for driver and application testing
//!
//! `SimChip` implements `SpiDevice` and models the register file, the FIFO
//! pointer behaviour and the IRQ flags closely enough to exercise the driver
//! without hardware. Handles are cheap clones sharing one chip, so a test can
//! keep one to inject packets while the driver owns another.
//!
//! ## <https://github.com/rust-iot/radio-hal>
//! ## Copyright 2020-2022 Ryan Kurte

extern crate std;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::vec::Vec;

use core::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, Operation, SpiDevice};

use crate::registers::*;

const REG_COUNT: usize = 0x80;
const FIFO_LEN: usize = 256;

/// Register file and FIFO of a simulated transceiver
#[derive(Debug, Clone)]
pub struct ChipState {
    regs: [u8; REG_COUNT],
    fifo: [u8; FIFO_LEN],

    version: u8,
    /// Number of version reads answered with zero before the identity shows up
    version_delay: u32,
    tx_responsive: bool,
    in_reset: bool,

    transmitted: Vec<Vec<u8>>,
    writes: Vec<(u8, u8)>,
}

impl ChipState {
    fn new(version: u8) -> Self {
        let mut s = Self {
            regs: [0u8; REG_COUNT],
            fifo: [0u8; FIFO_LEN],
            version,
            version_delay: 0,
            tx_responsive: true,
            in_reset: false,
            transmitted: Vec::new(),
            writes: Vec::new(),
        };
        s.power_on();
        s
    }

    /// Register values after power on or reset
    fn power_on(&mut self) {
        self.regs = [0u8; REG_COUNT];
        self.fifo = [0u8; FIFO_LEN];

        for (reg, value) in [
            (Reg::OpMode, 0x09),
            (Reg::FrfMsb, 0x6c),
            (Reg::FrfMid, 0x80),
            (Reg::PaConfig, 0x4f),
            (Reg::Lna, 0x20),
            (Reg::FifoTxBaseAddr, 0x80),
            (Reg::ModemConfig1, 0x72),
            (Reg::ModemConfig2, 0x70),
            (Reg::PayloadLength, 0x01),
            (Reg::DetectionOptimize, 0xc3),
            (Reg::DetectionThreshold, 0x0a),
            (Reg::SyncWord, 0x12),
        ] {
            self.regs[reg.addr() as usize] = value;
        }
    }

    fn reg(&self, reg: Reg) -> u8 {
        self.regs[reg.addr() as usize]
    }

    fn set(&mut self, reg: Reg, value: u8) {
        self.regs[reg.addr() as usize] = value;
    }

    fn raise(&mut self, flags: IrqFlags) {
        let irq = self.reg(Reg::IrqFlags) | flags.bits();
        self.set(Reg::IrqFlags, irq);
    }

    fn fifo_ptr(&mut self) -> usize {
        let ptr = self.reg(Reg::FifoAddrPtr);
        self.set(Reg::FifoAddrPtr, ptr.wrapping_add(1));
        ptr as usize
    }

    fn read(&mut self, addr: u8) -> u8 {
        if addr == Reg::Fifo.addr() {
            let ptr = self.fifo_ptr();
            return self.fifo[ptr];
        }
        if addr == Reg::Version.addr() {
            if self.version_delay > 0 {
                self.version_delay -= 1;
                return 0x00;
            }
            return self.version;
        }
        self.regs[addr as usize]
    }

    fn write(&mut self, addr: u8, value: u8) {
        self.writes.push((addr, value));

        if addr == Reg::Fifo.addr() {
            let ptr = self.fifo_ptr();
            self.fifo[ptr] = value;
        } else if addr == Reg::IrqFlags.addr() {
            let irq = self.reg(Reg::IrqFlags) & !value;
            self.set(Reg::IrqFlags, irq);
        } else if addr == Reg::Version.addr() {
            // read only
        } else if addr == Reg::OpMode.addr() {
            self.set(Reg::OpMode, value);
            if value & MODE_MASK == MODE_TX {
                self.transmit();
            }
        } else {
            self.regs[addr as usize] = value;
        }
    }

    fn transmit(&mut self) {
        if !self.tx_responsive {
            return;
        }

        let base = self.reg(Reg::FifoTxBaseAddr);
        let len = self.reg(Reg::PayloadLength) as usize;
        let payload = (0..len)
            .map(|i| self.fifo[base.wrapping_add(i as u8) as usize])
            .collect();
        self.transmitted.push(payload);

        self.raise(IrqFlags::TX_DONE);
        let op = self.reg(Reg::OpMode);
        self.set(Reg::OpMode, (op & !MODE_MASK) | MODE_STDBY);
    }

    fn deliver(&mut self, payload: &[u8], corrupted: bool) {
        let base = self.reg(Reg::FifoRxBaseAddr);
        for (i, b) in payload.iter().take(FIFO_LEN).enumerate() {
            self.fifo[base.wrapping_add(i as u8) as usize] = *b;
        }
        self.set(Reg::FifoRxCurrentAddr, base);
        self.set(Reg::RxNbBytes, payload.len().min(crate::MAX_PACKET_LEN) as u8);

        let mut flags = IrqFlags::RX_DONE | IrqFlags::VALID_HEADER;
        if corrupted && ModemConfig2::from(self.reg(Reg::ModemConfig2)).crc_on() {
            flags |= IrqFlags::PAYLOAD_CRC_ERROR;
        }
        self.raise(flags);
    }
}

/// Shared handle to a simulated transceiver
#[derive(Debug, Clone)]
pub struct SimChip {
    state: Arc<Mutex<ChipState>>,
}

impl Default for SimChip {
    fn default() -> Self {
        Self::new()
    }
}

impl SimChip {
    /// A responsive chip reporting the SX1276 version
    pub fn new() -> Self {
        Self::with_version(CHIP_VERSION)
    }

    /// A chip reporting `version` from `RegVersion`
    pub fn with_version(version: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChipState::new(version))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChipState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reset line wired to this chip
    pub fn reset_pin(&self) -> SimReset {
        SimReset { chip: self.clone() }
    }

    /// Answer the next `reads` version reads with zero
    pub fn set_version_after(&self, reads: u32) {
        self.lock().version_delay = reads;
    }

    /// When false, entering TX never raises TX done
    pub fn set_tx_responsive(&self, responsive: bool) {
        self.lock().tx_responsive = responsive;
    }

    pub fn reg(&self, reg: Reg) -> u8 {
        self.lock().reg(reg)
    }

    /// Set a register without logging a write, e.g. link quality readouts
    pub fn set_reg(&self, reg: Reg, value: u8) {
        self.lock().set(reg, value);
    }

    /// Payloads transmitted so far
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.lock().transmitted.clone()
    }

    /// Register writes `(address, value)` issued over the bus
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Place an intact packet in the RX FIFO and raise RX done
    pub fn deliver(&self, payload: &[u8]) {
        self.lock().deliver(payload, false);
    }

    /// Place a packet whose CRC check failed, the CRC error flag is raised when CRC is on
    pub fn deliver_corrupted(&self, payload: &[u8]) {
        self.lock().deliver(payload, true);
    }
}

impl spi::ErrorType for SimChip {
    type Error = Infallible;
}

/// Bus state for one chip-select framed transaction
struct Frame {
    addr: Option<u8>,
    write: bool,
}

impl Frame {
    fn clock(&mut self, chip: &mut ChipState, mosi: u8) -> u8 {
        let addr = match self.addr {
            None => {
                self.write = mosi & WRITE_FLAG != 0;
                self.addr = Some(mosi & !WRITE_FLAG);
                return 0x00;
            }
            Some(a) => a,
        };

        let miso = if self.write {
            chip.write(addr, mosi);
            0x00
        } else {
            chip.read(addr)
        };

        if addr != Reg::Fifo.addr() {
            self.addr = Some((addr + 1) & !WRITE_FLAG);
        }

        miso
    }
}

impl SpiDevice for SimChip {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
        let mut chip = self.lock();
        let mut frame = Frame {
            addr: None,
            write: false,
        };

        for op in operations.iter_mut() {
            match op {
                Operation::TransferInPlace(buff) => {
                    for b in buff.iter_mut() {
                        *b = frame.clock(&mut chip, *b);
                    }
                }
                Operation::Write(data) => {
                    for b in data.iter() {
                        frame.clock(&mut chip, *b);
                    }
                }
                Operation::Read(buff) => {
                    for b in buff.iter_mut() {
                        *b = frame.clock(&mut chip, 0x00);
                    }
                }
                Operation::Transfer(read, write) => {
                    for i in 0..read.len().max(write.len()) {
                        let miso = frame.clock(&mut chip, write.get(i).copied().unwrap_or(0x00));
                        if let Some(b) = read.get_mut(i) {
                            *b = miso;
                        }
                    }
                }
                Operation::DelayNs(_) => (),
            }
        }

        Ok(())
    }
}

/// Reset line of a `SimChip`, a low then high pulse restores power on registers
#[derive(Debug, Clone)]
pub struct SimReset {
    chip: SimChip,
}

impl digital::ErrorType for SimReset {
    type Error = Infallible;
}

impl OutputPin for SimReset {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.chip.lock().in_reset = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut chip = self.chip.lock();
        if chip.in_reset {
            chip.in_reset = false;
            chip.power_on();
        }
        Ok(())
    }
}

/// Delay that records time instead of sleeping, clones share one clock
#[derive(Debug, Clone, Default)]
pub struct SimDelay {
    elapsed_ns: Arc<AtomicU64>,
}

impl SimDelay {
    /// Total time delayed through any clone of this delay
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::SeqCst))
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns.fetch_add(ns as u64, Ordering::SeqCst);
    }
}
