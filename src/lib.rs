//! # ch341-usb
//!
//! A Rust crate for driving WCH CH341, CH341A and CH341A3 USB bridge chips as
//! I²C, SPI, parallel port (EPP/MEM/ECP), UART and GPIO adapters.
//!
//! The chip speaks a vendor command-packet protocol over two bulk pipes, an
//! interrupt pipe and the control pipe. This crate encodes that protocol for
//! each bus personality and manages open sessions, optional buffered
//! transfers and asynchronous events. The USB stack is abstracted behind
//! [`UsbTransport`]; the `libusb` feature (default) provides an
//! implementation on top of the `rusb` crate.
//!
//! ## Features
//!
//! *   Session registry (`DeviceRegistry`) over logical indices `0..16`, with
//!     per-session timeouts, exclusivity and personality selection.
//! *   Chip revision detection (`chip_version`) and capability checks.
//! *   I²C:
//!     *   Stream transfers (`stream_i2c`) and register helpers
//!         (`i2c_read_byte`, `i2c_write_byte`).
//!     *   Bus scan, address probe and stuck-bus detection.
//!     *   24C01 to 24C4096 EEPROM reads and page-aligned writes.
//! *   SPI: 4-wire (`stream_spi4`), dual-lane 5-wire (`stream_spi5`), the
//!     superseded 3-wire encoding (`stream_spi3`) and bit streams
//!     (`bit_stream_spi`).
//! *   Parallel port: EPP 1.7/1.9, MEM and ECP modes, block channels 0 and 1,
//!     combined address+data MEM access, printer output and PIO streams.
//! *   GPIO: 20 pin bits through `set_output`, D5..D0 through `set_d5_d0`,
//!     typed `GpioPin` helpers.
//! *   UART (serial strap): baud rate and parity setup.
//! *   Buffered upload and download with background workers.
//! *   Interrupt events and device arrival/removal notifications as channels.
//!
//! ## Chip Support & Limitations
//!
//! *   **CH341 (version < 0x20):** No stream commands, so no I²C, SPI or UIO.
//!     Parallel blocks are limited to 31 bytes; EPP 1.9, ECP and combined MEM
//!     addressing are unavailable.
//! *   **CH341A / CH341A3:** Everything above; parallel blocks up to 255 bytes.
//! *   The USB product ID reflects the chip's power-up strap. `0x5512` carries
//!     I²C/SPI/parallel/GPIO, `0x5584` the printer port and `0x5523` the UART.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use ch341_usb::{DeviceRegistry, I2cSpeed, LibusbTransport, Personality, Result};
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     // Optional: Initialize logging
//!     // env_logger::init();
//!
//!     let registry = DeviceRegistry::new(Arc::new(LibusbTransport::new()?));
//!     let device = registry.open(0)?;
//!     println!("Chip: {:?}", device.chip_version());
//!
//!     registry.set_timeouts(0, 500, 500)?;
//!     registry.set_mode(0, Personality::I2c(I2cSpeed::Standard))?;
//!
//!     device.i2c_write_byte(0x50, 0x00, 0x42)?;
//!     let value = device.i2c_read_byte(0x50, 0x00)?;
//!     println!("Read back 0x{:02X}", value);
//!
//!     registry.close(0);
//!     Ok(())
//! }
//! ```
//!
//! ## Hardware Setup Notes
//!
//! *   **I²C Pull-up Resistors:** Required externally on SDA (pin 23) and
//!     SCL (pin 24).
//! *   **Linux udev Rules:** Grant user permission to the USB device. Create
//!     `/etc/udev/rules.d/99-ch341.rules`:
//!     ```udev
//!     SUBSYSTEM=="usb", ATTRS{idVendor}=="1a86", ATTRS{idProduct}=="5512", MODE="0666", GROUP="plugdev"
//!     SUBSYSTEM=="usb", ATTRS{idVendor}=="1a86", ATTRS{idProduct}=="5584", MODE="0666", GROUP="plugdev"
//!     ```
//!     The serial strap (`5523`) is normally claimed by the kernel `ch341`
//!     driver; the libusb transport detaches it on open.
//!
//! ## License
//!
//! This project is licensed under the WTFPL - see the [LICENSE](LICENSE) file for details.

// Make internal modules private, re-export public types
mod buffered;
mod consts;
mod device;
pub mod eeprom;
mod error;
pub mod gpio; // Keep gpio public for its enums/structs
pub mod i2c; // Keep i2c public for its enums/structs
pub mod interrupt;
pub mod notify;
pub mod packet;
pub mod parallel;
mod registry;
pub mod serial;
pub mod spi;
pub mod transport;
#[cfg(feature = "libusb")]
pub mod usb;

pub use device::{
    timeout_from_ms, Capabilities, Ch341, ChipVersion, Personality, SessionConfig, Strap,
};
pub use eeprom::EepromType;
pub use error::{Error, Result};
pub use gpio::{GpioDirection, GpioLevel, GpioPin};
pub use i2c::{I2cOp, I2cSpeed, StreamMode};
pub use interrupt::{InterruptEvent, InterruptRoutine};
pub use notify::{DeviceEvent, DeviceNotification};
pub use packet::{CommandPacket, DriverCommand, SetupPacket};
pub use parallel::{MemIo, ParallelMode};
pub use registry::DeviceRegistry;
pub use serial::Parity;
pub use spi::ChipSelect;
pub use transport::{DeviceIdentity, Pipe, UsbHandle, UsbTransport};
#[cfg(feature = "libusb")]
pub use usb::LibusbTransport;
// Re-export only essential public constants
pub use consts::{
    CH341_PARALLEL_PID, CH341_PRINTER_PID, CH341_SERIAL_PID, MAX_DEVICES, NO_TIMEOUT_MS, WCH_VID,
};

/// Publicly accessible flags for controlling device features.
pub mod flags {
    use bitflags::bitflags;

    /// Enable flags for [`Ch341::set_output`](crate::Ch341::set_output).
    pub mod gpio {
        pub use crate::consts::gpio::{
            ENABLE_DATA_0_7, ENABLE_DATA_16_19, ENABLE_DATA_8_15, ENABLE_DIR_0_7,
            ENABLE_DIR_8_15, ENABLE_MASK,
        };
    }

    bitflags! {
        /// 24-bit pin status word, as returned by `get_status` and carried by
        /// interrupt events.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct PinState: u32 {
            const D0 = 1 << 0;
            const D1 = 1 << 1;
            const D2 = 1 << 2;
            const D3 = 1 << 3;
            const D4 = 1 << 4;
            const D5 = 1 << 5;
            const D6 = 1 << 6;
            const D7 = 1 << 7;
            const ERR = 1 << 8;
            const PEMP = 1 << 9;
            const INT = 1 << 10;
            const SLCT = 1 << 11;
            const WAIT = 1 << 13;
            const DATAS = 1 << 14;
            const ADDRS = 1 << 15;
            const RESET = 1 << 16;
            const WRITE = 1 << 17;
            const SCL = 1 << 22;
            const SDA = 1 << 23;
        }
    }

    impl PinState {
        /// D7..D0 as a byte.
        pub fn data_byte(self) -> u8 {
            (self.bits() & 0xFF) as u8
        }
    }
}

pub use flags::PinState;

/// Version of this driver, as reported by the `GET_VERSION` driver command.
pub fn driver_version() -> u32 {
    consts::DRIVER_VERSION
}

/// Process-wide registry over the libusb transport, built on first use.
///
/// Library code never reaches for this; it exists for applications that want
/// a single shared table of sessions.
#[cfg(feature = "libusb")]
pub fn global() -> Result<&'static DeviceRegistry> {
    use std::sync::{Arc, OnceLock};
    static GLOBAL: OnceLock<DeviceRegistry> = OnceLock::new();
    if let Some(registry) = GLOBAL.get() {
        return Ok(registry);
    }
    let transport = LibusbTransport::new()?;
    Ok(GLOBAL.get_or_init(|| DeviceRegistry::new(Arc::new(transport))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_state_bits() {
        let state = PinState::from_bits_retain(0x00C0_04A5);
        assert!(state.contains(PinState::SDA | PinState::SCL | PinState::INT));
        assert_eq!(state.data_byte(), 0xA5);
        assert!(!state.contains(PinState::ERR));
    }

    #[test]
    fn test_driver_version() {
        assert_eq!(driver_version(), consts::DRIVER_VERSION);
    }
}
