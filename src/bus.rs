//! Register bus to the transceiver
//!
//! Every access is one chip-select framed, MSB-first, full duplex exchange of
//! one address byte followed by N data bytes. Writes set the top address bit,
//! reads clear it.

use embedded_hal::spi::SpiDevice;

use crate::registers::{Reg, Register, WRITE_FLAG};
use crate::MAX_PACKET_LEN;

/// Registers trait provides register level access to the radio device
pub trait Registers<R: Copy> {
    type Error;

    /// Read a register value
    fn reg_read(&mut self, reg: R) -> Result<u8, Self::Error>;

    /// Write a register value
    fn reg_write(&mut self, reg: R, value: u8) -> Result<(), Self::Error>;
}

/// SPI register bus, owns the `SpiDevice` (and with it chip-select)
#[derive(Debug)]
pub struct RegisterBus<Spi> {
    spi: Spi,
}

impl<Spi: SpiDevice> RegisterBus<Spi> {
    pub fn new(spi: Spi) -> Self {
        Self { spi }
    }

    /// Raw full duplex exchange, `frame[0]` holds the address byte
    ///
    /// On return `frame[1..]` holds the bytes clocked out by the device.
    pub fn transfer(&mut self, frame: &mut [u8]) -> Result<(), Spi::Error> {
        self.spi.transfer_in_place(frame)
    }

    /// Write `data` starting at `reg` in a single burst
    pub fn write_burst(&mut self, reg: Reg, data: &[u8]) -> Result<(), Spi::Error> {
        let mut frame = [0u8; MAX_PACKET_LEN + 1];
        let n = data.len().min(MAX_PACKET_LEN);

        frame[0] = reg.addr() | WRITE_FLAG;
        frame[1..=n].copy_from_slice(&data[..n]);

        trace!("write {:?} {:02x?}", reg, &data[..n]);

        self.transfer(&mut frame[..=n])
    }

    /// Read `buff.len()` bytes starting at `reg` in a single burst
    pub fn read_burst(&mut self, reg: Reg, buff: &mut [u8]) -> Result<(), Spi::Error> {
        let mut frame = [0xffu8; MAX_PACKET_LEN + 1];
        let n = buff.len().min(MAX_PACKET_LEN);

        frame[0] = reg.addr() & !WRITE_FLAG;
        self.transfer(&mut frame[..=n])?;
        buff[..n].copy_from_slice(&frame[1..=n]);

        trace!("read {:?} {:02x?}", reg, &buff[..n]);

        Ok(())
    }

    /// Read a typed register
    pub fn read<R: Register>(&mut self) -> Result<R, Spi::Error> {
        self.reg_read(R::ADDR).map(R::from)
    }

    /// Write a typed register
    pub fn write<R: Register>(&mut self, value: R) -> Result<(), Spi::Error> {
        self.reg_write(R::ADDR, value.into())
    }

    /// Read-modify-write a typed register, returning the written value
    pub fn modify<R: Register>(&mut self, f: impl FnOnce(R) -> R) -> Result<R, Spi::Error> {
        let updated = f(self.read::<R>()?);
        self.write(updated)?;
        Ok(updated)
    }

    pub fn release(self) -> Spi {
        self.spi
    }
}

impl<Spi: SpiDevice> Registers<Reg> for RegisterBus<Spi> {
    type Error = Spi::Error;

    fn reg_read(&mut self, reg: Reg) -> Result<u8, Self::Error> {
        let mut frame = [reg.addr() & !WRITE_FLAG, 0xff];
        self.transfer(&mut frame)?;

        trace!("read {:?}: 0x{:02x}", reg, frame[1]);

        Ok(frame[1])
    }

    fn reg_write(&mut self, reg: Reg, value: u8) -> Result<(), Self::Error> {
        trace!("write {:?}: 0x{:02x}", reg, value);

        let mut frame = [reg.addr() | WRITE_FLAG, value];
        self.transfer(&mut frame)
    }
}

#[cfg(test)]
mod test {
    use std::vec;

    use embedded_hal_mock::eh1::spi::{Mock as SpiMock, Transaction};

    use super::*;
    use crate::registers::ModemConfig2;

    #[test]
    fn read_clears_write_bit() {
        let spi = SpiMock::new(&[
            Transaction::transaction_start(),
            Transaction::transfer_in_place(vec![0x42, 0xff], vec![0x00, 0x12]),
            Transaction::transaction_end(),
        ]);
        let mut bus = RegisterBus::new(spi);

        assert_eq!(bus.reg_read(Reg::Version).unwrap(), 0x12);

        bus.release().done();
    }

    #[test]
    fn write_sets_write_bit() {
        let spi = SpiMock::new(&[
            Transaction::transaction_start(),
            Transaction::transfer_in_place(vec![0x81, 0x81], vec![0x00, 0x00]),
            Transaction::transaction_end(),
        ]);
        let mut bus = RegisterBus::new(spi);

        bus.reg_write(Reg::OpMode, 0x81).unwrap();

        bus.release().done();
    }

    #[test]
    fn burst_write_is_one_frame() {
        let spi = SpiMock::new(&[
            Transaction::transaction_start(),
            Transaction::transfer_in_place(vec![0x80, b'h', b'i', b'!'], vec![0x00; 4]),
            Transaction::transaction_end(),
        ]);
        let mut bus = RegisterBus::new(spi);

        bus.write_burst(Reg::Fifo, b"hi!").unwrap();

        bus.release().done();
    }

    #[test]
    fn burst_read_returns_data_bytes() {
        let spi = SpiMock::new(&[
            Transaction::transaction_start(),
            Transaction::transfer_in_place(vec![0x00, 0xff, 0xff], vec![0x00, 0xaa, 0xbb]),
            Transaction::transaction_end(),
        ]);
        let mut bus = RegisterBus::new(spi);

        let mut buff = [0u8; 2];
        bus.read_burst(Reg::Fifo, &mut buff).unwrap();
        assert_eq!(buff, [0xaa, 0xbb]);

        bus.release().done();
    }

    #[test]
    fn modify_preserves_other_fields() {
        let spi = SpiMock::new(&[
            Transaction::transaction_start(),
            Transaction::transfer_in_place(vec![0x1e, 0xff], vec![0x00, 0x74]),
            Transaction::transaction_end(),
            Transaction::transaction_start(),
            Transaction::transfer_in_place(vec![0x9e, 0x94], vec![0x00, 0x00]),
            Transaction::transaction_end(),
        ]);
        let mut bus = RegisterBus::new(spi);

        let r = bus
            .modify::<ModemConfig2>(|r| r.with_spreading_factor(9))
            .unwrap();
        assert_eq!(r.spreading_factor(), 9);

        bus.release().done();
    }
}
