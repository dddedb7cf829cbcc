//! libusb-backed transport (`libusb` feature).

use crate::consts;
use crate::error::{Error, Result};
use crate::packet::SetupPacket;
use crate::transport::{decode_interrupt_status, DeviceIdentity, Pipe, UsbHandle, UsbTransport};
use log::{debug, trace, warn};
use parking_lot::RwLock;
use rusb::{Context, DeviceHandle, UsbContext};
use std::time::Duration;

/// Product IDs of the adapter's three straps.
const CH341_PIDS: [u16; 3] = [
    consts::CH341_PARALLEL_PID,
    consts::CH341_PRINTER_PID,
    consts::CH341_SERIAL_PID,
];

/// Transport over a libusb context.
pub struct LibusbTransport {
    context: Context,
}

impl LibusbTransport {
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self { context })
    }
}

impl UsbTransport for LibusbTransport {
    fn list_devices(&self, filter: Option<&str>) -> Result<Vec<DeviceIdentity>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut found = Vec::new();
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    trace!("Skipping device without descriptor: {}", e);
                    continue;
                }
            };
            if descriptor.vendor_id() != consts::WCH_VID
                || !CH341_PIDS.contains(&descriptor.product_id())
            {
                continue;
            }
            let identity = DeviceIdentity::new(
                device.bus_number(),
                device.address(),
                descriptor.vendor_id(),
                descriptor.product_id(),
            );
            if filter.map_or(true, |f| identity.matches(f)) {
                debug!("Found CH341 device: {}", identity);
                found.push(identity);
            }
        }
        found.sort_by_key(|id| (id.bus, id.address));
        Ok(found)
    }

    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn UsbHandle>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == identity.bus && d.address() == identity.address)
            .ok_or(Error::DeviceUnavailable {
                index: 0,
                message: format!("{} is no longer attached", identity),
            })?;
        let mut handle = device.open().map_err(map_rusb_error)?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            // Not supported on every platform
            debug!("Auto-detach of kernel driver unavailable: {}", e);
        }
        handle
            .claim_interface(consts::endpoint::INTERFACE)
            .map_err(|e| {
                warn!(
                    "Failed to claim interface {} on {}: {}",
                    consts::endpoint::INTERFACE,
                    identity,
                    e
                );
                map_rusb_error(e)
            })?;
        debug!("Opened {}", identity);
        Ok(Box::new(LibusbHandle {
            handle: RwLock::new(handle),
        }))
    }
}

/// An opened adapter. The claimed interface is released when dropped.
pub struct LibusbHandle {
    handle: RwLock<DeviceHandle<Context>>,
}

// libusb treats a zero timeout as unlimited.
fn libusb_timeout(timeout: Option<Duration>) -> Duration {
    timeout.unwrap_or(Duration::ZERO)
}

impl UsbHandle for LibusbHandle {
    fn control_transfer(
        &self,
        setup: &SetupPacket,
        data: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let handle = self.handle.read();
        let timeout = libusb_timeout(timeout);
        let result = if setup.is_in() {
            handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
        } else {
            handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
        };
        result.map_err(map_rusb_error)
    }

    fn bulk_read(&self, pipe: Pipe, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.handle
            .read()
            .read_bulk(pipe.endpoint(), buf, libusb_timeout(timeout))
            .map_err(map_rusb_error)
    }

    fn bulk_write(&self, pipe: Pipe, data: &[u8], timeout: Option<Duration>) -> Result<usize> {
        self.handle
            .read()
            .write_bulk(pipe.endpoint(), data, libusb_timeout(timeout))
            .map_err(map_rusb_error)
    }

    fn poll_interrupt(&self, timeout: Option<Duration>) -> Result<Option<u32>> {
        let mut buf = [0u8; consts::PACKET_LENGTH_SHORT];
        match self.handle.read().read_interrupt(
            consts::endpoint::INTERRUPT_UP,
            &mut buf,
            libusb_timeout(timeout),
        ) {
            Ok(0) => Ok(None),
            Ok(n) => {
                trace!("Interrupt data: {:02X?}", &buf[..n]);
                Ok(Some(decode_interrupt_status(&buf[..n])))
            }
            Err(rusb::Error::Timeout) => Ok(None),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn reset(&self) -> Result<()> {
        self.handle.write().reset().map_err(map_rusb_error)
    }
}

/// Maps a libusb error onto the driver's error type. Anything without a
/// driver-level meaning is passed through as its libusb result code.
pub fn map_rusb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::Timeout => Error::Timeout,
        rusb::Error::NoDevice | rusb::Error::NotFound => Error::DeviceUnavailable {
            index: 0,
            message: err.to_string(),
        },
        other => Error::Transport {
            status: libusb_code(other) as u32,
        },
    }
}

fn libusb_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}
