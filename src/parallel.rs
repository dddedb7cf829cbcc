//! Parallel port functionality (EPP 1.7/1.9, MEM, ECP) for CH341 devices.
//!
//! The port exposes two block channels. In EPP modes channel 0 carries data
//! cycles and channel 1 address cycles; in MEM mode they are the two address
//! strobes. The active mode lives on the chip, so the session tracks it and
//! skips redundant mode changes.

use crate::consts::{self, para, vendor};
use crate::device::Ch341;
use crate::error::{unsupported_on, Error, Result};
use crate::packet;
use log::{debug, trace, warn};

/// Parallel port mode, as programmed into the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParallelMode {
    Epp17 = 0,
    Epp19 = 1,
    Mem = 2,
    Ecp = 3,
}

impl ParallelMode {
    pub fn from_u8(mode: u8) -> Result<Self> {
        match mode {
            0 => Ok(ParallelMode::Epp17),
            1 => Ok(ParallelMode::Epp19),
            2 => Ok(ParallelMode::Mem),
            3 => Ok(ParallelMode::Ecp),
            other => Err(Error::ArgumentOutOfRange(format!(
                "parallel mode must be 0-3 (got {})",
                other
            ))),
        }
    }

    #[inline]
    pub fn is_epp(self) -> bool {
        matches!(self, ParallelMode::Epp17 | ParallelMode::Epp19)
    }
}

/// Value word of the mode request.
pub fn para_init_value(mode: ParallelMode, reset: bool) -> u16 {
    let value = (mode as u16) << 8;
    if reset {
        value | vendor::PARA_INIT_RESET
    } else {
        value
    }
}

/// One access of a combined address+data MEM sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemIo {
    Read { addr: u8 },
    Write { addr: u8, data: u8 },
}

/// Encodes a MEM address+data sequence. Bit 7 of the address byte selects a
/// read; bits 6-0 carry the address.
pub fn encode_mem_io(ops: &[MemIo]) -> Result<Vec<Vec<u8>>> {
    let mut subs = Vec::with_capacity(ops.len());
    for op in ops {
        let addr = match op {
            MemIo::Read { addr } | MemIo::Write { addr, .. } => *addr,
        };
        if addr > para::IO_ADDR_MASK {
            return Err(Error::ArgumentOutOfRange(format!(
                "MEM address must be 0-127 (got 0x{:02X})",
                addr
            )));
        }
        subs.push(match op {
            MemIo::Read { addr } => vec![para::IO_ADDR_READ | addr],
            MemIo::Write { addr, data } => vec![*addr, *data],
        });
    }
    packet::pack_subcommands(para::CMD_IO_ADDR, None, subs)
}

impl Ch341 {
    // --- Parallel Mode ---

    /// Selects the port mode. A no-op when the mode is already active.
    pub fn set_para_mode(&self, mode: ParallelMode) -> Result<()> {
        self.check_para_mode(mode)?;
        if self.state.lock().para_mode == Some(mode) {
            trace!("Parallel mode {:?} already active", mode);
            return Ok(());
        }
        debug!("Session {}: parallel mode -> {:?}", self.index, mode);
        self.vendor_write(vendor::PARA_INIT, para_init_value(mode, false), 0)?;
        self.state.lock().para_mode = Some(mode);
        Ok(())
    }

    /// Pulses RST# and then selects the port mode.
    pub fn init_parallel(&self, mode: ParallelMode) -> Result<()> {
        self.check_para_mode(mode)?;
        debug!("Session {}: parallel init with reset, mode {:?}", self.index, mode);
        self.vendor_write(vendor::PARA_INIT, para_init_value(mode, true), 0)?;
        self.state.lock().para_mode = Some(mode);
        Ok(())
    }

    pub fn para_mode(&self) -> Option<ParallelMode> {
        self.state.lock().para_mode
    }

    fn check_para_mode(&self, mode: ParallelMode) -> Result<()> {
        let caps = self.capabilities;
        match mode {
            ParallelMode::Epp19 if !caps.epp19 => Err(unsupported_on("EPP 1.9", caps.chip)),
            ParallelMode::Ecp if !caps.ecp => Err(unsupported_on("ECP", caps.chip)),
            _ => Ok(()),
        }
    }

    fn require_para_mode(&self, accept: fn(ParallelMode) -> bool, what: &str) -> Result<()> {
        match self.para_mode() {
            Some(mode) if accept(mode) => Ok(()),
            Some(mode) => Err(Error::UnsupportedMode(format!(
                "{} is not available in parallel mode {:?}",
                what, mode
            ))),
            None => Err(Error::UnsupportedMode(format!(
                "{} needs a parallel mode; call set_para_mode first",
                what
            ))),
        }
    }

    fn check_block(&self, len: usize) -> Result<()> {
        let max = self.capabilities.epp_block_max;
        if len > max {
            return Err(Error::TransferTooLarge { max, actual: len });
        }
        Ok(())
    }

    // --- Block Channels ---

    fn read_block(&self, opcode: u8, len: usize) -> Result<Vec<u8>> {
        self.check_block(len)?;
        self.require_para_mode(|_| true, "Block read")?;
        if len == 0 {
            return Ok(Vec::new());
        }
        self.transact(&[vec![opcode, len as u8]], len)
    }

    // Reports the bytes that reached the transport before a failure.
    fn write_block(&self, opcode: u8, data: &[u8]) -> Result<usize> {
        self.check_block(data.len())?;
        self.require_para_mode(|_| true, "Block write")?;
        let mut done = 0;
        for packet in packet::chunk_with_opcode(opcode, data) {
            let payload = packet.len() - 1;
            match self.write(&packet) {
                Ok(sent) if sent == packet.len() => done += payload,
                Ok(sent) => {
                    let partial = done + sent.saturating_sub(1);
                    warn!("Parallel write stopped after {} of {} bytes", partial, data.len());
                    return Ok(partial);
                }
                Err(Error::Timeout) if done > 0 => {
                    warn!("Parallel write timed out after {} of {} bytes", done, data.len());
                    return Ok(done);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    /// Reads a block through channel 0.
    pub fn read_data0(&self, len: usize) -> Result<Vec<u8>> {
        self.read_block(para::CMD_R0, len)
    }

    /// Reads a block through channel 1.
    pub fn read_data1(&self, len: usize) -> Result<Vec<u8>> {
        self.read_block(para::CMD_R1, len)
    }

    /// Writes a block through channel 0 and returns the bytes sent.
    pub fn write_data0(&self, data: &[u8]) -> Result<usize> {
        self.write_block(para::CMD_W0, data)
    }

    /// Writes a block through channel 1 and returns the bytes sent.
    pub fn write_data1(&self, data: &[u8]) -> Result<usize> {
        self.write_block(para::CMD_W1, data)
    }

    // --- EPP ---

    pub fn epp_read_data(&self, len: usize) -> Result<Vec<u8>> {
        self.require_para_mode(ParallelMode::is_epp, "EPP data read")?;
        self.read_data0(len)
    }

    pub fn epp_write_data(&self, data: &[u8]) -> Result<usize> {
        self.require_para_mode(ParallelMode::is_epp, "EPP data write")?;
        self.write_data0(data)
    }

    pub fn epp_read_addr(&self, len: usize) -> Result<Vec<u8>> {
        self.require_para_mode(ParallelMode::is_epp, "EPP address read")?;
        self.read_data1(len)
    }

    pub fn epp_write_addr(&self, data: &[u8]) -> Result<usize> {
        self.require_para_mode(ParallelMode::is_epp, "EPP address write")?;
        self.write_data1(data)
    }

    /// Sets the EPP address with a single address cycle.
    pub fn epp_set_addr(&self, addr: u8) -> Result<()> {
        self.epp_write_addr(&[addr]).map(|_| ())
    }

    // --- MEM ---

    pub fn mem_read_addr0(&self, len: usize) -> Result<Vec<u8>> {
        self.require_para_mode(|m| m == ParallelMode::Mem, "MEM read")?;
        self.read_data0(len)
    }

    pub fn mem_read_addr1(&self, len: usize) -> Result<Vec<u8>> {
        self.require_para_mode(|m| m == ParallelMode::Mem, "MEM read")?;
        self.read_data1(len)
    }

    pub fn mem_write_addr0(&self, data: &[u8]) -> Result<usize> {
        self.require_para_mode(|m| m == ParallelMode::Mem, "MEM write")?;
        self.write_data0(data)
    }

    pub fn mem_write_addr1(&self, data: &[u8]) -> Result<usize> {
        self.require_para_mode(|m| m == ParallelMode::Mem, "MEM write")?;
        self.write_data1(data)
    }

    /// Runs a combined address+data MEM sequence and returns the bytes read,
    /// in order.
    pub fn mem_io_addr(&self, ops: &[MemIo]) -> Result<Vec<u8>> {
        if !self.capabilities.mem_addressing {
            return Err(unsupported_on("MEM address+data access", self.capabilities.chip));
        }
        let packets = encode_mem_io(ops)?;
        self.require_para_mode(|m| m == ParallelMode::Mem, "MEM address+data access")?;
        let reads = ops
            .iter()
            .filter(|op| matches!(op, MemIo::Read { .. }))
            .count();
        self.transact(&packets, reads)
    }

    // --- Printer and PIO ---

    /// Sends data to the printer port and returns the bytes sent.
    pub fn print_out(&self, data: &[u8]) -> Result<usize> {
        if data.len() > consts::MAX_BUFFER_LENGTH {
            return Err(Error::TransferTooLarge {
                max: consts::MAX_BUFFER_LENGTH,
                actual: data.len(),
            });
        }
        let packets = packet::chunk_with_opcode(para::CMD_PRINT_OUT, data);
        self.send_command(&packets)?;
        Ok(data.len())
    }

    /// Sends a raw PIO command stream.
    pub fn pio_stream(&self, stream: &[u8]) -> Result<()> {
        if stream.len() > consts::MAX_BUFFER_LENGTH {
            return Err(Error::TransferTooLarge {
                max: consts::MAX_BUFFER_LENGTH,
                actual: stream.len(),
            });
        }
        let packets = packet::chunk_with_opcode(para::CMD_PIO_STREAM, stream);
        self.send_command(&packets)
    }
}
