//! Command packet codec.
//!
//! Three layers are encoded here, all pure data transformations:
//!
//! *   [`CommandPacket`]: one opcode byte followed by an opcode-dependent
//!     payload, never longer than [`PACKET_LENGTH`](crate::consts::PACKET_LENGTH).
//! *   [`DriverCommand`]: the request/response envelope, a little-endian
//!     function (or status) code and length followed by the data buffer.
//! *   [`SetupPacket`]: the 8-byte USB setup structure carried by control
//!     pipe commands.

use crate::consts;
use crate::error::{Error, Result};

/// A single command packet: opcode plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl CommandPacket {
    /// Largest payload a standard packet can carry.
    pub const MAX_PAYLOAD: usize = consts::PACKET_LENGTH - 1;

    pub fn new(opcode: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() > Self::MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                max: Self::MAX_PAYLOAD,
                actual: payload.len(),
            });
        }
        Ok(Self {
            opcode,
            payload: payload.to_vec(),
        })
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        buf.push(self.opcode);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Re-frames this packet behind the short-packet opcode with its true length.
    pub fn to_short_frame(&self) -> Result<Vec<u8>> {
        wrap_short(&self.to_bytes())
    }
}

/// Encodes `opcode` and `payload` into a command packet buffer.
pub fn encode(opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
    CommandPacket::new(opcode, payload).map(|p| p.to_bytes())
}

/// Splits a command packet buffer back into opcode and payload.
pub fn decode(buf: &[u8]) -> Result<CommandPacket> {
    match buf.split_first() {
        None => Err(Error::MalformedPacket("empty command packet".to_string())),
        Some(_) if buf.len() > consts::PACKET_LENGTH => Err(Error::MalformedPacket(format!(
            "command packet of {} bytes exceeds {}",
            buf.len(),
            consts::PACKET_LENGTH
        ))),
        Some((&opcode, payload)) => Ok(CommandPacket {
            opcode,
            payload: payload.to_vec(),
        }),
    }
}

/// Wraps a command shorter than the packet size as `[SHORT_PKT, len, command...]`.
pub fn wrap_short(command: &[u8]) -> Result<Vec<u8>> {
    let max = consts::PACKET_LENGTH - 2;
    if command.len() > max {
        return Err(Error::PayloadTooLarge {
            max,
            actual: command.len(),
        });
    }
    let mut buf = Vec::with_capacity(command.len() + 2);
    buf.push(consts::para::CMD_SHORT_PKT);
    buf.push(command.len() as u8);
    buf.extend_from_slice(command);
    Ok(buf)
}

/// Recovers the inner command of a short-packet frame.
pub fn unwrap_short(frame: &[u8]) -> Result<&[u8]> {
    match frame {
        [consts::para::CMD_SHORT_PKT, len, rest @ ..] if rest.len() >= *len as usize => {
            Ok(&rest[..*len as usize])
        }
        [consts::para::CMD_SHORT_PKT, len, rest @ ..] => Err(Error::MalformedPacket(format!(
            "short packet declares {} bytes but carries {}",
            len,
            rest.len()
        ))),
        _ => Err(Error::MalformedPacket("not a short packet".to_string())),
    }
}

/// Packs sub-commands behind `opcode` into as few packets as possible.
///
/// A sub-command is never split across packets. Each packet that has room
/// left is terminated with `end`, when given.
pub fn pack_subcommands<I>(opcode: u8, end: Option<u8>, subcommands: I) -> Result<Vec<Vec<u8>>>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let mut packets = Vec::new();
    let mut current = vec![opcode];
    for sub in subcommands {
        if sub.len() > CommandPacket::MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                max: CommandPacket::MAX_PAYLOAD,
                actual: sub.len(),
            });
        }
        if current.len() + sub.len() > consts::PACKET_LENGTH {
            close_packet(&mut current, end);
            packets.push(std::mem::replace(&mut current, vec![opcode]));
        }
        current.extend_from_slice(&sub);
    }
    if current.len() > 1 {
        close_packet(&mut current, end);
        packets.push(current);
    }
    Ok(packets)
}

fn close_packet(packet: &mut Vec<u8>, end: Option<u8>) {
    if let Some(end) = end {
        if packet.len() < consts::PACKET_LENGTH {
            packet.push(end);
        }
    }
}

/// Splits `data` into command packets each starting with `opcode`.
pub fn chunk_with_opcode(opcode: u8, data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(CommandPacket::MAX_PAYLOAD)
        .map(|chunk| {
            let mut packet = Vec::with_capacity(chunk.len() + 1);
            packet.push(opcode);
            packet.extend_from_slice(chunk);
            packet
        })
        .collect()
}

/// The driver command envelope.
///
/// On the way in `code` is a function code or pipe number; on the way out
/// it carries the operation status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCommand {
    pub code: u32,
    pub data: Vec<u8>,
}

impl DriverCommand {
    pub fn new(code: u32, data: &[u8]) -> Result<Self> {
        if data.len() > consts::MAX_BUFFER_LENGTH {
            return Err(Error::PayloadTooLarge {
                max: consts::MAX_BUFFER_LENGTH,
                actual: data.len(),
            });
        }
        Ok(Self {
            code,
            data: data.to_vec(),
        })
    }

    /// Status of a response.
    pub fn status(&self) -> u32 {
        self.code
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(consts::COMMAND_HEADER_LENGTH + self.data.len());
        buf.extend_from_slice(&self.code.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < consts::COMMAND_HEADER_LENGTH {
            return Err(Error::MalformedPacket(format!(
                "command of {} bytes is shorter than its {}-byte header",
                buf.len(),
                consts::COMMAND_HEADER_LENGTH
            )));
        }
        let code = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let body = &buf[consts::COMMAND_HEADER_LENGTH..];
        if length > body.len() {
            return Err(Error::MalformedPacket(format!(
                "command declares {} data bytes but carries {}",
                length,
                body.len()
            )));
        }
        Ok(Self {
            code,
            data: body[..length].to_vec(),
        })
    }
}

/// Decodes a response envelope into its status and payload.
pub fn decode_response(buf: &[u8]) -> Result<(u32, Vec<u8>)> {
    DriverCommand::from_bytes(buf).map(|cmd| (cmd.code, cmd.data))
}

/// USB control request setup stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const LENGTH: usize = 8;

    /// Vendor OUT request without a data stage.
    pub fn vendor_write(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: consts::vendor::WRITE,
            request,
            value,
            index,
            length: 0,
        }
    }

    /// Vendor IN request reading `length` bytes.
    pub fn vendor_read(request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type: consts::vendor::READ,
            request,
            value,
            index,
            length,
        }
    }

    /// Data stage direction is device-to-host.
    #[inline]
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err(Error::MalformedPacket(format!(
                "setup packet of {} bytes (expected {})",
                buf.len(),
                Self::LENGTH
            )));
        }
        Ok(Self {
            request_type: buf[0],
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}
