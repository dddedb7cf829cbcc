//! 24Cxx serial EEPROM access over the I2C stream.

use crate::consts::i2c as stm;
use crate::device::Ch341;
use crate::error::{Error, Result};
use crate::i2c::{i2c_ops, I2cOp};
use log::{debug, trace};
use std::fmt;
use std::str::FromStr;

/// Base 7-bit address of a 24Cxx part.
pub const EEPROM_ADDRESS: u8 = 0x50;

/// Supported 24Cxx part classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EepromType {
    C24C01,
    C24C02,
    C24C04,
    C24C08,
    C24C16,
    C24C32,
    C24C64,
    C24C128,
    C24C256,
    C24C512,
    C24C1024,
    C24C2048,
    C24C4096,
}

struct EepromInfo {
    name: &'static str,
    size: usize,
    address_bytes: usize,
    page_size: usize,
}

const EEPROM_TABLE: [EepromInfo; 13] = [
    EepromInfo { name: "24c01", size: 128, address_bytes: 1, page_size: 8 },
    EepromInfo { name: "24c02", size: 256, address_bytes: 1, page_size: 8 },
    EepromInfo { name: "24c04", size: 512, address_bytes: 1, page_size: 16 },
    EepromInfo { name: "24c08", size: 1024, address_bytes: 1, page_size: 16 },
    EepromInfo { name: "24c16", size: 2048, address_bytes: 1, page_size: 16 },
    EepromInfo { name: "24c32", size: 4096, address_bytes: 2, page_size: 32 },
    EepromInfo { name: "24c64", size: 8192, address_bytes: 2, page_size: 32 },
    EepromInfo { name: "24c128", size: 16384, address_bytes: 2, page_size: 64 },
    EepromInfo { name: "24c256", size: 32768, address_bytes: 2, page_size: 64 },
    EepromInfo { name: "24c512", size: 65536, address_bytes: 2, page_size: 128 },
    EepromInfo { name: "24c1024", size: 131072, address_bytes: 2, page_size: 256 },
    EepromInfo { name: "24c2048", size: 262144, address_bytes: 2, page_size: 256 },
    EepromInfo { name: "24c4096", size: 524288, address_bytes: 2, page_size: 256 },
];

impl EepromType {
    pub const ALL: [EepromType; 13] = [
        EepromType::C24C01,
        EepromType::C24C02,
        EepromType::C24C04,
        EepromType::C24C08,
        EepromType::C24C16,
        EepromType::C24C32,
        EepromType::C24C64,
        EepromType::C24C128,
        EepromType::C24C256,
        EepromType::C24C512,
        EepromType::C24C1024,
        EepromType::C24C2048,
        EepromType::C24C4096,
    ];

    fn info(self) -> &'static EepromInfo {
        &EEPROM_TABLE[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Capacity in bytes.
    pub fn size(self) -> usize {
        self.info().size
    }

    /// Word address bytes sent after the device address (1 or 2).
    pub fn address_bytes(self) -> usize {
        self.info().address_bytes
    }

    pub fn page_size(self) -> usize {
        self.info().page_size
    }

    /// Device address and word address bytes for a memory location. Address
    /// bits above the word address go into the low device address bits.
    pub fn address_for(self, addr: usize) -> (u8, Vec<u8>) {
        let bytes = self.address_bytes();
        let high = (addr >> (8 * bytes)) as u8 & 0x07;
        let word = (0..bytes)
            .rev()
            .map(|i| (addr >> (8 * i)) as u8)
            .collect();
        (EEPROM_ADDRESS | high, word)
    }

    /// Span of one device address: accesses never cross it.
    fn block_size(self) -> usize {
        1 << (8 * self.address_bytes())
    }

    fn check_range(self, addr: usize, len: usize) -> Result<()> {
        let end = addr.saturating_add(len);
        if end > self.size() {
            return Err(Error::TransferTooLarge {
                max: self.size(),
                actual: end,
            });
        }
        Ok(())
    }

    /// Splits a read into per-stream pieces: (address, length).
    pub fn read_chunks(self, addr: usize, len: usize) -> Vec<(usize, usize)> {
        split(addr, len, stm::CHUNK_MAX, self.block_size())
    }

    /// Splits a write into per-stream pieces that never cross a page and
    /// fit one output chunk together with the addressing bytes.
    pub fn write_chunks(self, addr: usize, len: usize) -> Vec<(usize, usize)> {
        let room = stm::CHUNK_MAX - 1 - self.address_bytes();
        split(addr, len, room, self.page_size())
    }
}

fn split(addr: usize, len: usize, max: usize, boundary: usize) -> Vec<(usize, usize)> {
    let mut chunks = Vec::new();
    let mut pos = addr;
    let end = addr + len;
    while pos < end {
        let to_boundary = boundary - pos % boundary;
        let n = (end - pos).min(max).min(to_boundary);
        chunks.push((pos, n));
        pos += n;
    }
    chunks
}

impl fmt::Display for EepromType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EepromType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        EepromType::ALL
            .iter()
            .copied()
            .find(|t| t.name() == lower)
            .ok_or_else(|| Error::ArgumentOutOfRange(format!("unknown EEPROM type '{}'", s)))
    }
}

impl Ch341 {
    // --- EEPROM Methods ---

    /// Reads `buf.len()` bytes starting at `addr`.
    pub fn read_eeprom(&self, ty: EepromType, addr: usize, buf: &mut [u8]) -> Result<()> {
        ty.check_range(addr, buf.len())?;
        debug!("EEPROM {} read {} bytes at 0x{:05X}", ty, buf.len(), addr);
        let mut done = 0;
        for (pos, len) in ty.read_chunks(addr, buf.len()) {
            let (device, word) = ty.address_for(pos);
            let mut write = Vec::with_capacity(1 + word.len());
            write.push(device << 1);
            write.extend_from_slice(&word);
            let data = self.stream_i2c(&write, len)?;
            buf[done..done + len].copy_from_slice(&data);
            done += len;
        }
        Ok(())
    }

    /// Writes `data` starting at `addr`, one page segment per stream, each
    /// followed by the write-cycle delay.
    pub fn write_eeprom(&self, ty: EepromType, addr: usize, data: &[u8]) -> Result<()> {
        ty.check_range(addr, data.len())?;
        debug!("EEPROM {} write {} bytes at 0x{:05X}", ty, data.len(), addr);
        let mode = self.stream_mode();
        let mut done = 0;
        for (pos, len) in ty.write_chunks(addr, data.len()) {
            let (device, word) = ty.address_for(pos);
            let mut write = Vec::with_capacity(1 + word.len() + len);
            write.push(device << 1);
            write.extend_from_slice(&word);
            write.extend_from_slice(&data[done..done + len]);
            let mut ops = i2c_ops(mode, &write, 0)?;
            ops.push(I2cOp::DelayMs(stm::EEPROM_WRITE_CYCLE_MS));
            trace!("EEPROM page write at 0x{:05X}: {} bytes", pos, len);
            self.i2c_stream_ops(&ops)?;
            done += len;
        }
        Ok(())
    }
}
