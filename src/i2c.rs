//! I2C master functionality for CH341 devices.
//!
//! Transfers are expressed as an I2C stream: a list of sub-commands (START,
//! length-tagged output and input blocks, delays, STOP) packed behind the
//! `0xAA` opcode into 32-byte command packets. Encoding is split from I/O so
//! the exact stream can be inspected with [`i2c_ops`] and [`encode_ops`].

use crate::consts::{self, i2c as stm};
use crate::device::Ch341;
use crate::error::{Error, Result};
use crate::flags::PinState;
use crate::packet;
use log::{debug, trace};
use std::fmt;
use std::str::FromStr;

/// I2C clock selection, bits 0-1 of the stream mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum I2cSpeed {
    /// ~20 kHz.
    Low,
    /// ~100 kHz.
    #[default]
    Standard,
    /// ~400 kHz.
    Fast,
    /// ~750 kHz.
    High,
}

impl I2cSpeed {
    pub fn bits(self) -> u8 {
        match self {
            I2cSpeed::Low => 0,
            I2cSpeed::Standard => 1,
            I2cSpeed::Fast => 2,
            I2cSpeed::High => 3,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & consts::stream::SPEED_MASK {
            0 => I2cSpeed::Low,
            1 => I2cSpeed::Standard,
            2 => I2cSpeed::Fast,
            _ => I2cSpeed::High,
        }
    }

    /// Nominal SCL frequency.
    pub fn hz(self) -> u32 {
        match self {
            I2cSpeed::Low => 20_000,
            I2cSpeed::Standard => 100_000,
            I2cSpeed::Fast => 400_000,
            I2cSpeed::High => 750_000,
        }
    }
}

impl fmt::Display for I2cSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            I2cSpeed::Low => "low",
            I2cSpeed::Standard => "standard",
            I2cSpeed::Fast => "fast",
            I2cSpeed::High => "high",
        };
        write!(f, "{} ({} kHz)", name, self.hz() / 1000)
    }
}

impl FromStr for I2cSpeed {
    type Err = Error;

    /// Accepts `0`..`3` or `low`, `standard`, `fast`, `high`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "low" => Ok(I2cSpeed::Low),
            "1" | "standard" => Ok(I2cSpeed::Standard),
            "2" | "fast" => Ok(I2cSpeed::Fast),
            "3" | "high" => Ok(I2cSpeed::High),
            other => Err(Error::ArgumentOutOfRange(format!(
                "unknown I2C speed '{}' (expected 0-3 or low/standard/fast/high)",
                other
            ))),
        }
    }
}

/// Session-level stream parameters shared by I2C and SPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamMode {
    pub speed: I2cSpeed,
    /// SPI: dual input/output (5-wire).
    pub dual_io: bool,
    /// SPI: most significant bit first.
    pub msb_first: bool,
}

impl StreamMode {
    pub fn bits(self) -> u8 {
        let mut bits = self.speed.bits();
        if self.dual_io {
            bits |= consts::stream::DUAL_IO;
        }
        if self.msb_first {
            bits |= consts::stream::MSB_FIRST;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        StreamMode {
            speed: I2cSpeed::from_bits(bits),
            dual_io: bits & consts::stream::DUAL_IO != 0,
            msb_first: bits & consts::stream::MSB_FIRST != 0,
        }
    }

    /// Bits understood by the chip; bit order is applied on the host.
    fn chip_bits(self) -> u8 {
        self.bits() & (consts::stream::SPEED_MASK | consts::stream::DUAL_IO)
    }
}

/// One logical element of an I2C stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum I2cOp {
    /// Stream parameters, once at the head of every stream.
    Set(StreamMode),
    Start,
    /// An output chunk of at most [`CHUNK_MAX`](consts::i2c::CHUNK_MAX)
    /// bytes. With `address` set the first byte is sent on its own and its
    /// acknowledge is reported back.
    Write { data: Vec<u8>, address: bool },
    /// An input chunk of at most `CHUNK_MAX` bytes. The last chunk of a read
    /// does not acknowledge its final byte.
    Read { len: usize, last: bool },
    Stop,
    DelayUs(u8),
    DelayMs(u8),
}

impl I2cOp {
    /// Bytes the adapter returns for this element.
    pub fn response_len(&self) -> usize {
        match self {
            I2cOp::Write {
                data,
                address: true,
            } if !data.is_empty() => 1,
            I2cOp::Read { len, .. } => *len,
            _ => 0,
        }
    }

    /// Stream sub-commands for this element.
    pub fn subcommands(&self) -> Vec<Vec<u8>> {
        match self {
            I2cOp::Set(mode) => vec![vec![stm::STM_SET | mode.chip_bits()]],
            I2cOp::Start => vec![vec![stm::STM_STA]],
            I2cOp::Stop => vec![vec![stm::STM_STO]],
            I2cOp::DelayUs(us) => vec![vec![stm::STM_US | (us & stm::STM_DLY_MAX)]],
            I2cOp::DelayMs(ms) => vec![vec![stm::STM_MS | (ms & stm::STM_DLY_MAX)]],
            I2cOp::Write { data, address } => {
                let mut subs = Vec::with_capacity(2);
                let rest = if *address && !data.is_empty() {
                    subs.push(vec![stm::STM_OUT, data[0]]);
                    &data[1..]
                } else {
                    &data[..]
                };
                if !rest.is_empty() {
                    let mut sub = Vec::with_capacity(rest.len() + 1);
                    sub.push(stm::STM_OUT | rest.len() as u8);
                    sub.extend_from_slice(rest);
                    subs.push(sub);
                }
                subs
            }
            I2cOp::Read { len, last } => {
                let acked = if *last { len.saturating_sub(1) } else { *len };
                let mut subs = Vec::with_capacity(2);
                if acked > 0 {
                    subs.push(vec![stm::STM_IN | acked as u8]);
                }
                if *last && *len > 0 {
                    subs.push(vec![stm::STM_IN]);
                }
                subs
            }
        }
    }
}

fn check_stream_length(len: usize) -> Result<()> {
    if len > stm::STREAM_BUFFER_MAX {
        return Err(Error::TransferTooLarge {
            max: stm::STREAM_BUFFER_MAX,
            actual: len,
        });
    }
    Ok(())
}

/// Builds the logical stream for a write-then-read transaction.
///
/// `write` starts with the 8-bit address byte. A single-byte `write` whose
/// read bit is set is a plain read. Reads after a longer write use a
/// repeated START with the read address.
pub fn i2c_ops(mode: StreamMode, write: &[u8], read_len: usize) -> Result<Vec<I2cOp>> {
    check_stream_length(write.len())?;
    check_stream_length(read_len)?;
    if write.is_empty() && read_len > 0 {
        return Err(Error::ArgumentOutOfRange(
            "an I2C read needs an address byte".to_string(),
        ));
    }

    let mut ops = vec![I2cOp::Set(mode), I2cOp::Start];
    for (i, chunk) in write.chunks(stm::CHUNK_MAX).enumerate() {
        ops.push(I2cOp::Write {
            data: chunk.to_vec(),
            address: i == 0,
        });
    }
    if read_len > 0 {
        let read_only = write.len() == 1 && write[0] & 0x01 != 0;
        if !read_only {
            ops.push(I2cOp::Start);
            ops.push(I2cOp::Write {
                data: vec![write[0] | 0x01],
                address: true,
            });
        }
        let chunks = read_len.div_ceil(stm::CHUNK_MAX);
        for i in 0..chunks {
            let len = (read_len - i * stm::CHUNK_MAX).min(stm::CHUNK_MAX);
            ops.push(I2cOp::Read {
                len,
                last: i + 1 == chunks,
            });
        }
    }
    ops.push(I2cOp::Stop);
    Ok(ops)
}

/// Packs logical stream elements into `0xAA` command packets.
pub fn encode_ops(ops: &[I2cOp]) -> Result<Vec<Vec<u8>>> {
    packet::pack_subcommands(
        stm::CMD_I2C_STREAM,
        Some(stm::STM_END),
        ops.iter().flat_map(|op| op.subcommands()),
    )
}

impl Ch341 {
    // --- I2C Methods ---

    /// Sets the stream mode (I2C speed, SPI I/O width and bit order).
    pub fn set_stream(&self, mode: StreamMode) -> Result<()> {
        self.require_streams("I2C/SPI stream mode")?;
        debug!(
            "Session {}: stream mode 0x{:02X} ({}, dual_io={}, msb_first={})",
            self.index,
            mode.bits(),
            mode.speed,
            mode.dual_io,
            mode.msb_first
        );
        let packets = encode_ops(&[I2cOp::Set(mode)])?;
        self.send_command(&packets)?;
        self.state.lock().stream = mode;
        Ok(())
    }

    pub fn stream_mode(&self) -> StreamMode {
        self.state.lock().stream
    }

    /// Executes an arbitrary I2C stream and returns the bytes it produced,
    /// with acknowledge bytes already checked and removed.
    pub fn i2c_stream_ops(&self, ops: &[I2cOp]) -> Result<Vec<u8>> {
        self.require_streams("I2C")?;
        let read_len: usize = ops
            .iter()
            .map(|op| match op {
                I2cOp::Read { len, .. } => *len,
                _ => 0,
            })
            .sum();
        check_stream_length(read_len)?;
        let response_len: usize = ops.iter().map(I2cOp::response_len).sum();
        let packets = encode_ops(ops)?;
        trace!(
            "I2C stream: {} ops in {} packets, {} response bytes",
            ops.len(),
            packets.len(),
            response_len
        );
        let response = self.transact(&packets, response_len)?;

        let mut data = Vec::with_capacity(response_len);
        let mut offset = 0;
        for op in ops {
            match op {
                I2cOp::Write {
                    data: bytes,
                    address: true,
                } if !bytes.is_empty() => {
                    let ack = response[offset];
                    offset += 1;
                    if ack & stm::ACK_STATUS_NACK != 0 {
                        let address = bytes.first().map_or(0, |b| b >> 1);
                        debug!("NACK from 0x{:02X} (status 0x{:02X})", address, ack);
                        return Err(Error::DeviceNotResponding { address });
                    }
                }
                I2cOp::Read { len, .. } => {
                    data.extend_from_slice(&response[offset..offset + len]);
                    offset += len;
                }
                _ => {}
            }
        }
        Ok(data)
    }

    /// Writes `write` (starting with the 8-bit address byte) and then reads
    /// `read_len` bytes.
    pub fn stream_i2c(&self, write: &[u8], read_len: usize) -> Result<Vec<u8>> {
        if write.is_empty() && read_len == 0 {
            return Ok(Vec::new());
        }
        let ops = i2c_ops(self.stream_mode(), write, read_len)?;
        self.i2c_stream_ops(&ops)
    }

    /// Reads one register of a 7-bit addressed target.
    pub fn i2c_read_byte(&self, device: u8, reg: u8) -> Result<u8> {
        let addr = check_7bit(device)?;
        let data = self.stream_i2c(&[addr << 1, reg], 1)?;
        Ok(data[0])
    }

    /// Writes one register of a 7-bit addressed target.
    pub fn i2c_write_byte(&self, device: u8, reg: u8, value: u8) -> Result<()> {
        let addr = check_7bit(device)?;
        self.stream_i2c(&[addr << 1, reg, value], 0).map(|_| ())
    }

    /// Probes a 7-bit address. `Ok(false)` when nothing acknowledges.
    pub fn i2c_detect(&self, device: u8) -> Result<bool> {
        let addr = check_7bit(device)?;
        match self.stream_i2c(&[addr << 1], 0) {
            Ok(_) => Ok(true),
            Err(Error::DeviceNotResponding { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// I2C bus scan over an inclusive range of 7-bit addresses.
    pub fn i2c_scan(&self, start_addr: u8, end_addr: u8) -> Result<Vec<u8>> {
        self.i2c_scan_with_progress(start_addr, end_addr, |_, _, _, _| {})
    }

    /// I2C bus scan with a progress callback: (addr, found, current_idx, total).
    pub fn i2c_scan_with_progress<F>(
        &self,
        start_addr: u8,
        end_addr: u8,
        mut progress_callback: F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(u8, bool, usize, usize),
    {
        check_7bit(end_addr)?;
        if start_addr > end_addr {
            return Err(Error::ArgumentOutOfRange(format!(
                "scan range 0x{:02X}..=0x{:02X} is empty",
                start_addr, end_addr
            )));
        }
        self.i2c_check_bus()?;
        let total = (end_addr - start_addr) as usize + 1;
        let mut found_devices = Vec::new();
        for (idx, addr) in (start_addr..=end_addr).enumerate() {
            let found = self.i2c_detect(addr)?;
            if found {
                found_devices.push(addr);
            }
            progress_callback(addr, found, idx, total);
        }
        debug!("I2C scan found {} device(s)", found_devices.len());
        Ok(found_devices)
    }

    /// Fails with [`Error::BusStuck`] when SDA or SCL reads low on an idle bus.
    pub fn i2c_check_bus(&self) -> Result<()> {
        let status = self.get_status()?;
        let sda_low = !status.contains(PinState::SDA);
        let scl_low = !status.contains(PinState::SCL);
        if sda_low || scl_low {
            return Err(Error::BusStuck { sda_low, scl_low });
        }
        Ok(())
    }
}

fn check_7bit(addr: u8) -> Result<u8> {
    if addr <= 0x7F {
        Ok(addr)
    } else {
        Err(Error::ArgumentOutOfRange(format!(
            "7-bit I2C address must be 0-127 (got 0x{:02X})",
            addr
        )))
    }
}
