//! SPI master functionality for CH341 devices.
//!
//! Fixed pin mapping on D7..D0:
//!
//! | Pin | Signal        |
//! |-----|---------------|
//! | D0  | CS0           |
//! | D1  | CS1           |
//! | D2  | CS2           |
//! | D3  | DCK (clock)   |
//! | D4  | DOUT2         |
//! | D5  | DOUT (MOSI)   |
//! | D6  | DIN2          |
//! | D7  | DIN (MISO)    |
//!
//! The chip shifts least significant bit first; MSB-first mode is handled
//! by reversing bits on the host. Chip select is driven with a UIO stream
//! around the transfer so it stays asserted for every clock of the call.

use crate::consts::{self, spi, uio};
use crate::device::Ch341;
use crate::error::{Error, Result};
use crate::i2c::StreamMode;
use crate::packet;
use log::{debug, trace, warn};

/// Chip-select line and polarity for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChipSelect {
    line: u8,
    active_high: bool,
}

impl ChipSelect {
    /// Active-low chip select on CS0..CS2.
    pub fn new(line: u8) -> Result<Self> {
        if line > 2 {
            return Err(Error::ArgumentOutOfRange(format!(
                "chip-select line must be 0-2 (got {})",
                line
            )));
        }
        Ok(ChipSelect {
            line,
            active_high: false,
        })
    }

    pub fn active_high(mut self) -> Self {
        self.active_high = true;
        self
    }

    /// Decodes the vendor form: bit 7 marks the select valid, bits 1-0 pick
    /// the line. `None` when bit 7 is clear.
    pub fn from_raw(raw: u8) -> Result<Option<Self>> {
        if raw & spi::CHIP_SELECT_VALID == 0 {
            return Ok(None);
        }
        ChipSelect::new(raw & 0x03).map(Some)
    }

    pub fn line(&self) -> u8 {
        self.line
    }

    #[inline]
    fn mask(&self) -> u8 {
        1 << self.line
    }

    /// D5..D0 output levels with this select idle or asserted.
    pub fn levels(&self, asserted: bool) -> u8 {
        let drive_low = asserted != self.active_high;
        if drive_low {
            spi::IDLE_LEVELS & !self.mask()
        } else {
            spi::IDLE_LEVELS | self.mask()
        }
    }
}

/// UIO packet driving D5..D0 to `levels` with all six pins as outputs.
pub fn uio_levels_packet(levels: u8) -> Vec<u8> {
    vec![
        uio::CMD_UIO_STREAM,
        uio::STM_OUT | (levels & uio::VALUE_MASK),
        uio::STM_DIR | spi::OUTPUT_DIRECTION,
        uio::STM_END,
    ]
}

/// Packet that asserts or releases a chip select.
pub fn chip_select_packet(cs: ChipSelect, asserted: bool) -> Vec<u8> {
    uio_levels_packet(cs.levels(asserted))
}

#[inline]
fn order(byte: u8, msb_first: bool) -> u8 {
    if msb_first {
        byte.reverse_bits()
    } else {
        byte
    }
}

/// Splits data into `0xA8` stream packets, applying the bit order.
pub fn encode_spi_stream(data: &[u8], msb_first: bool) -> Vec<Vec<u8>> {
    let ordered: Vec<u8> = data.iter().map(|&b| order(b, msb_first)).collect();
    packet::chunk_with_opcode(spi::CMD_SPI_STREAM, &ordered)
}

/// Interleaves the two 5-wire lanes byte by byte.
pub fn interleave(lane1: &[u8], lane2: &[u8]) -> Vec<u8> {
    lane1
        .iter()
        .zip(lane2)
        .flat_map(|(&a, &b)| [a, b])
        .collect()
}

/// Splits interleaved data back into the two lanes.
pub fn deinterleave(data: &[u8], lane1: &mut [u8], lane2: &mut [u8]) {
    for (i, pair) in data.chunks_exact(2).enumerate() {
        lane1[i] = pair[0];
        lane2[i] = pair[1];
    }
}

/// Output mask of a bit-time byte: everything but the clock.
const BIT_OUT_MASK: u8 = uio::VALUE_MASK & !spi::PIN_DCK;
/// Input bits of a bit-time byte.
const BIT_IN_MASK: u8 = spi::PIN_DIN | spi::PIN_DIN2;

/// Encodes a bit stream: each byte is one bit time carrying DOUT, DOUT2 and
/// CS2..CS0 on its low bits. Every bit time drives the outputs with the
/// clock low, raises the clock and samples the inputs.
pub fn encode_bit_stream(bits: &[u8]) -> Result<Vec<Vec<u8>>> {
    if bits.len() > spi::BIT_STREAM_MAX_BITS {
        return Err(Error::TransferTooLarge {
            max: spi::BIT_STREAM_MAX_BITS,
            actual: bits.len(),
        });
    }
    let head = std::iter::once(vec![uio::STM_DIR | spi::OUTPUT_DIRECTION]);
    let body = bits.iter().map(|&b| {
        let out = b & BIT_OUT_MASK;
        vec![
            uio::STM_OUT | out,
            uio::STM_OUT | out | spi::PIN_DCK,
            uio::STM_IN,
        ]
    });
    packet::pack_subcommands(uio::CMD_UIO_STREAM, Some(uio::STM_END), head.chain(body))
}

fn check_length(len: usize) -> Result<()> {
    if len > consts::MAX_BUFFER_LENGTH {
        return Err(Error::TransferTooLarge {
            max: consts::MAX_BUFFER_LENGTH,
            actual: len,
        });
    }
    Ok(())
}

impl Ch341 {
    // --- SPI Methods ---

    fn spi_exchange(&self, cs: Option<ChipSelect>, data: &[u8], msb_first: bool) -> Result<Vec<u8>> {
        // Each data packet is answered before the next one goes out
        let mut exchanges = Vec::new();
        if let Some(cs) = cs {
            exchanges.push((chip_select_packet(cs, true), 0));
        }
        exchanges.extend(
            encode_spi_stream(data, msb_first)
                .into_iter()
                .map(|packet| {
                    let len = packet.len() - 1;
                    (packet, len)
                }),
        );
        if let Some(cs) = cs {
            exchanges.push((chip_select_packet(cs, false), 0));
        }
        let response = self.transact_each(&exchanges)?;
        Ok(response.into_iter().map(|b| order(b, msb_first)).collect())
    }

    // Switches dual I/O on or off, leaving the rest of the stream mode alone
    fn spi_lanes(&self, dual_io: bool) -> Result<StreamMode> {
        let mode = self.stream_mode();
        if mode.dual_io == dual_io {
            return Ok(mode);
        }
        debug!("Session {}: dual I/O {}", self.index, if dual_io { "on" } else { "off" });
        let mode = StreamMode { dual_io, ..mode };
        self.set_stream(mode)?;
        Ok(mode)
    }

    /// 4-wire full-duplex transfer. `buf` is sent and replaced by the
    /// received bytes. Turns dual I/O off if a 5-wire transfer left it on.
    pub fn stream_spi4(&self, cs: Option<ChipSelect>, buf: &mut [u8]) -> Result<()> {
        check_length(buf.len())?;
        self.require_streams("SPI")?;
        if buf.is_empty() {
            return Ok(());
        }
        let mode = self.spi_lanes(false)?;
        trace!("SPI4 {} bytes, cs={:?}, msb_first={}", buf.len(), cs, mode.msb_first);
        let response = self.spi_exchange(cs, buf, mode.msb_first)?;
        buf.copy_from_slice(&response);
        Ok(())
    }

    /// 5-wire transfer: `lane1` on DOUT/DIN, `lane2` on DOUT2/DIN2. Enables
    /// dual I/O in the stream mode if needed.
    pub fn stream_spi5(&self, cs: Option<ChipSelect>, lane1: &mut [u8], lane2: &mut [u8]) -> Result<()> {
        if lane1.len() != lane2.len() {
            return Err(Error::ArgumentOutOfRange(format!(
                "5-wire lanes differ in length ({} vs {})",
                lane1.len(),
                lane2.len()
            )));
        }
        check_length(lane1.len() * 2)?;
        self.require_streams("SPI")?;
        let mode = self.spi_lanes(true)?;
        if lane1.is_empty() {
            return Ok(());
        }
        let response = self.spi_exchange(cs, &interleave(lane1, lane2), mode.msb_first)?;
        deinterleave(&response, lane1, lane2);
        Ok(())
    }

    /// Superseded 3-wire transfer with a single bidirectional data line,
    /// clocked bit by bit through the UIO stream.
    #[deprecated(note = "use stream_spi4; kept for adapters wired for the old 3-wire mode")]
    pub fn stream_spi3(&self, cs: Option<ChipSelect>, buf: &mut [u8]) -> Result<()> {
        check_length(buf.len())?;
        self.require_streams("SPI")?;
        let msb_first = self.stream_mode().msb_first;
        let idle = cs.map_or(spi::IDLE_LEVELS, |c| c.levels(false));
        let active = cs.map_or(spi::IDLE_LEVELS, |c| c.levels(true));
        if let Some(cs) = cs {
            self.send_command(&[chip_select_packet(cs, true)])?;
        }
        let result = self.spi3_bytes(buf, active, msb_first);
        if cs.is_some() {
            self.send_command(&[uio_levels_packet(idle)])?;
        }
        result
    }

    fn spi3_bytes(&self, buf: &mut [u8], active: u8, msb_first: bool) -> Result<()> {
        let bytes_per_call = spi::BIT_STREAM_RECOMMENDED_BITS / 8;
        let shift = |i: usize| if msb_first { 7 - i } else { i };
        for chunk in buf.chunks_mut(bytes_per_call) {
            let mut bits: Vec<u8> = chunk
                .iter()
                .flat_map(|&byte| {
                    (0..8).map(move |i| {
                        let base = active & !spi::PIN_DOUT;
                        if (byte >> shift(i)) & 1 != 0 {
                            base | spi::PIN_DOUT
                        } else {
                            base
                        }
                    })
                })
                .collect();
            self.bit_stream_spi(&mut bits)?;
            for (byte, sampled) in chunk.iter_mut().zip(bits.chunks(8)) {
                *byte = sampled.iter().enumerate().fold(0u8, |acc, (i, &b)| {
                    acc | (((b & spi::PIN_DIN) >> 7) << shift(i))
                });
            }
        }
        Ok(())
    }

    /// Bit-level transfer: each byte of `bits` is one bit time (see
    /// [`encode_bit_stream`]). On return bits 7 and 6 hold DIN and DIN2.
    pub fn bit_stream_spi(&self, bits: &mut [u8]) -> Result<()> {
        let packets = encode_bit_stream(bits)?;
        self.require_streams("SPI bit stream")?;
        if bits.len() > spi::BIT_STREAM_RECOMMENDED_BITS {
            warn!(
                "Bit stream of {} bits exceeds the recommended {} bits per call",
                bits.len(),
                spi::BIT_STREAM_RECOMMENDED_BITS
            );
        }
        let response = self.transact(&packets, bits.len())?;
        for (bit, input) in bits.iter_mut().zip(response) {
            *bit = (*bit & BIT_OUT_MASK) | (input & BIT_IN_MASK);
        }
        Ok(())
    }
}
