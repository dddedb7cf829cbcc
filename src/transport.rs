//! USB transport capability consumed by the driver.
//!
//! The driver never talks to a USB stack directly. A [`UsbTransport`]
//! enumerates CH341 devices and opens them; the resulting [`UsbHandle`]
//! exposes the control pipe, the two bulk data pipes and the interrupt pipe.
//! The libusb implementation lives in [`crate::usb`]; tests supply their own.
//!
//! Releasing a handle is dropping it. Sessions keep the handle behind an
//! `Arc` and every worker that touches it is joined before the session drops
//! its reference, so the last drop is the single release.

use crate::consts;
use crate::error::Result;
use crate::packet::SetupPacket;
use std::fmt;
use std::time::Duration;

/// Bulk pipes of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    /// Device-to-host data (`0x82`).
    DataUp,
    /// Host-to-device data (`0x02`).
    DataDown,
}

impl Pipe {
    /// Endpoint address of the pipe.
    pub fn endpoint(self) -> u8 {
        match self {
            Pipe::DataUp => consts::endpoint::DATA_UP,
            Pipe::DataDown => consts::endpoint::DATA_DOWN,
        }
    }
}

/// Physical identity of an attached adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub bus: u8,
    pub address: u8,
    pub vid: u16,
    pub pid: u16,
}

impl DeviceIdentity {
    pub fn new(bus: u8, address: u8, vid: u16, pid: u16) -> Self {
        Self {
            bus,
            address,
            vid,
            pid,
        }
    }

    /// Identity string used for notification filters, e.g.
    /// `USB\VID_1A86&PID_5512\001-004`.
    pub fn id_string(&self) -> String {
        format!(
            "USB\\VID_{:04X}&PID_{:04X}\\{:03}-{:03}",
            self.vid, self.pid, self.bus, self.address
        )
    }

    /// Case-insensitive substring match against [`id_string`](Self::id_string).
    /// An empty filter matches everything.
    pub fn matches(&self, filter: &str) -> bool {
        filter.is_empty()
            || self
                .id_string()
                .to_ascii_uppercase()
                .contains(&filter.to_ascii_uppercase())
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id_string())
    }
}

/// Enumerates and opens adapters.
pub trait UsbTransport: Send + Sync {
    /// Lists the attached adapters in a stable order. The position in this
    /// list is the physical index.
    fn list_devices(&self, filter: Option<&str>) -> Result<Vec<DeviceIdentity>>;

    /// Opens the adapter with the given identity.
    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn UsbHandle>>;
}

/// An opened adapter.
///
/// A `timeout` of `None` waits forever. Every call is one transport
/// operation with its own timeout window.
pub trait UsbHandle: Send + Sync {
    /// Issues a control transfer. The data stage direction follows bit 7 of
    /// `setup.request_type`; `data` is filled for IN requests and sent for
    /// OUT requests. Returns the number of bytes transferred.
    fn control_transfer(
        &self,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize>;

    /// Reads from a bulk pipe.
    fn bulk_read(&self, pipe: Pipe, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;

    /// Writes to a bulk pipe and returns the number of bytes sent.
    fn bulk_write(&self, pipe: Pipe, data: &[u8], timeout: Option<Duration>) -> Result<usize>;

    /// Waits up to `timeout` for interrupt pipe data and decodes it as a
    /// 24-bit pin status word. `Ok(None)` means nothing arrived in time.
    fn poll_interrupt(&self, timeout: Option<Duration>) -> Result<Option<u32>>;

    /// Port-resets the adapter.
    fn reset(&self) -> Result<()>;
}

/// Decodes an interrupt payload (little-endian, up to three bytes) into a
/// pin status word.
pub fn decode_interrupt_status(payload: &[u8]) -> u32 {
    payload
        .iter()
        .take(3)
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | (u32::from(b) << (8 * i)))
}
