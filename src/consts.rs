//! Internal constants: USB identities, pipes, vendor requests and per-personality opcodes.

// Default Vendor/Product IDs
/// WCH (Nanjing Qinheng) vendor ID for CH341 devices.
pub const WCH_VID: u16 = 0x1A86;

/// Product ID when the chip is strapped for I2C/SPI/parallel/GPIO (EPP/MEM mode).
pub const CH341_PARALLEL_PID: u16 = 0x5512;
/// Product ID when the chip is strapped as a printer port.
pub const CH341_PRINTER_PID: u16 = 0x5584;
/// Product ID when the chip is strapped as a serial (UART) bridge.
pub const CH341_SERIAL_PID: u16 = 0x5523;

/// Maximum number of simultaneously open sessions (logical indices 0..16).
pub const MAX_DEVICES: usize = 16;

// --- Packet sizes ---
/// Standard command packet length.
pub const PACKET_LENGTH: usize = 32;
/// Short packet length.
pub const PACKET_LENGTH_SHORT: usize = 8;
/// Maximum data length carried by a single driver command.
pub const MAX_BUFFER_LENGTH: usize = 0x1000;
/// Driver command header: function/status (4) + length (4).
pub const COMMAND_HEADER_LENGTH: usize = 8;

/// Timeout sentinel meaning "never time out".
pub const NO_TIMEOUT_MS: u32 = 0xFFFF_FFFF;

/// Version reported by [`crate::driver_version`].
pub const DRIVER_VERSION: u32 = 0x21;

// --- Endpoints ---
pub mod endpoint {
    pub const INTERRUPT_UP: u8 = 0x81;
    #[allow(dead_code)] // Never written by the host; listed for completeness of the map
    pub const INTERRUPT_DOWN: u8 = 0x01;
    pub const DATA_UP: u8 = 0x82;
    pub const DATA_DOWN: u8 = 0x02;
    /// Interface claimed on open.
    pub const INTERFACE: u8 = 0;
}

// --- Driver command function codes (pipe numbers and function requests) ---
pub mod func {
    pub const NO_OPERATION: u32 = 0x00;
    pub const GET_VERSION: u32 = 0x01;
    pub const GET_CONFIG: u32 = 0x02;
    pub const PIPE_DEVICE_CTRL: u32 = 0x04;
    pub const PIPE_INTER_UP: u32 = 0x05;
    pub const PIPE_DATA_UP: u32 = 0x06;
    pub const PIPE_DATA_DOWN: u32 = 0x07;
    pub const SET_TIMEOUT: u32 = 0x09;
    pub const RESET_DEVICE: u32 = 0x0C;
    pub const SET_PARA_MODE: u32 = 0x0F;
    pub const READ_DATA0: u32 = 0x10;
    pub const READ_DATA1: u32 = 0x11;
    pub const WRITE_DATA0: u32 = 0x12;
    pub const WRITE_DATA1: u32 = 0x13;
    pub const WRITE_READ: u32 = 0x14;
    pub const BUFFER_MODE: u32 = 0x20;
    pub const BUFFER_MODE_DOWN: u32 = 0x21;
}

/// Status placed in a driver command response on success.
pub const STATUS_SUCCESS: u32 = 0;

// --- USB standard requests ---
pub mod usb {
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const DESCRIPTOR_DEVICE: u16 = 0x0100;
    pub const DESCRIPTOR_CONFIG: u16 = 0x0200;
    pub const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
    pub const DEVICE_DESCRIPTOR_LENGTH: usize = 18;
    pub const CONFIG_DESCRIPTOR_MAX: usize = 255;
}

// --- Vendor control requests ---
pub mod vendor {
    /// Request type for vendor IN (device-to-host) transfers.
    pub const READ: u8 = 0xC0;
    /// Request type for vendor OUT (host-to-device) transfers.
    pub const WRITE: u8 = 0x40;

    pub const PARA_INIT: u8 = 0xB1;
    pub const BUF_CLEAR: u8 = 0xB2;
    pub const DELAY_MS: u8 = 0x5E;
    pub const GET_VER: u8 = 0x5F;

    /// Serial strap: write a register pair.
    pub const SERIAL_WRITE_REG: u8 = 0x9A;
    /// Serial strap: initialise the UART.
    pub const SERIAL_INIT: u8 = 0xA1;
    /// Register pair holding prescaler and divisor.
    pub const SERIAL_REG_DIVISOR: u16 = 0x1312;
    /// Register pair holding the line-control register.
    pub const SERIAL_REG_LCR: u16 = 0x2518;

    /// `PARA_INIT` value flag that pulses RST# before applying the mode.
    pub const PARA_INIT_RESET: u16 = 0x0002;
}

// --- Chip versions ---
pub mod chip {
    pub const CH341: u8 = 0x10;
    pub const CH341A: u8 = 0x20;
    pub const CH341A3: u8 = 0x30;
}

// --- Parallel port opcodes ---
pub mod para {
    pub const CMD_STS: u8 = 0xA0;
    pub const CMD_R0: u8 = 0xAC;
    pub const CMD_R1: u8 = 0xAD;
    pub const CMD_W0: u8 = 0xA6;
    pub const CMD_W1: u8 = 0xA7;

    pub const CMD_SET_OUTPUT: u8 = 0xA1;
    pub const CMD_IO_ADDR: u8 = 0xA2;
    pub const CMD_PRINT_OUT: u8 = 0xA3;
    #[allow(dead_code)] // PWM output is not driven by this crate
    pub const CMD_PWM_OUT: u8 = 0xA4;
    pub const CMD_SHORT_PKT: u8 = 0xA5;
    pub const CMD_PIO_STREAM: u8 = 0xAE;

    /// `CMD_IO_ADDR` read flag; bits 6..0 carry the address.
    pub const IO_ADDR_READ: u8 = 0x80;
    pub const IO_ADDR_MASK: u8 = 0x7F;

    /// Largest EPP/MEM block per call on the original CH341.
    pub const EPP_IO_MAX_CH341: usize = super::PACKET_LENGTH - 1;
    /// Largest EPP/MEM block per call on CH341A and newer.
    pub const EPP_IO_MAX_CH341A: usize = 0xFF;

    /// Number of status bytes answered to `CMD_STS`.
    pub const STATUS_LENGTH: usize = 6;

    /// Fixed second byte of a `CMD_SET_OUTPUT` packet.
    pub const SET_OUTPUT_MAGIC: u8 = 0x6A;
    pub const SET_OUTPUT_LENGTH: usize = 11;
}

// --- I2C stream opcodes ---
pub mod i2c {
    pub const CMD_I2C_STREAM: u8 = 0xAA;

    pub const STM_STA: u8 = 0x74;
    pub const STM_STO: u8 = 0x75;
    pub const STM_OUT: u8 = 0x80;
    pub const STM_IN: u8 = 0xC0;
    pub const STM_SET: u8 = 0x60;
    pub const STM_US: u8 = 0x40;
    pub const STM_MS: u8 = 0x50;
    pub const STM_END: u8 = 0x00;

    /// Largest value of the 6-bit length field of `STM_OUT`/`STM_IN`.
    pub const STM_LEN_MAX: usize = 0x3F;
    /// Largest value of a single delay sub-command.
    pub const STM_DLY_MAX: u8 = 0x0F;

    /// Largest data block in one length-tagged sub-command: the length field
    /// limit, further bounded by the packet (one opcode byte plus one
    /// sub-command header byte).
    pub const CHUNK_MAX: usize = if STM_LEN_MAX < super::PACKET_LENGTH - 2 {
        STM_LEN_MAX
    } else {
        super::PACKET_LENGTH - 2
    };

    /// Size of the device-side working buffer a single stream may use.
    pub const STREAM_BUFFER_MAX: usize = super::MAX_BUFFER_LENGTH;

    /// Bit 7 of an acknowledge status byte is set when the target did not ACK.
    pub const ACK_STATUS_NACK: u8 = 0x80;

    /// Write-cycle time allowed after an EEPROM page write.
    pub const EEPROM_WRITE_CYCLE_MS: u8 = 5;
}

// --- SPI stream opcodes ---
pub mod spi {
    pub const CMD_SPI_STREAM: u8 = 0xA8;

    /// Payload bytes per SPI stream packet.
    pub const STREAM_CHUNK: usize = super::PACKET_LENGTH - 1;

    /// Absolute ceiling for one bit-stream call.
    pub const BIT_STREAM_MAX_BITS: usize = 896;
    /// Recommended ceiling for one bit-stream call.
    pub const BIT_STREAM_RECOMMENDED_BITS: usize = 256;

    // Pin mapping on D7..D0
    pub const PIN_CS0: u8 = 1 << 0;
    pub const PIN_CS1: u8 = 1 << 1;
    pub const PIN_CS2: u8 = 1 << 2;
    pub const PIN_DCK: u8 = 1 << 3;
    pub const PIN_DOUT2: u8 = 1 << 4;
    pub const PIN_DOUT: u8 = 1 << 5;
    pub const PIN_DIN2: u8 = 1 << 6;
    pub const PIN_DIN: u8 = 1 << 7;

    pub const CS_MASK: u8 = PIN_CS0 | PIN_CS1 | PIN_CS2;
    /// Idle level: chip selects and data outputs high, clock low.
    pub const IDLE_LEVELS: u8 = CS_MASK | PIN_DOUT | PIN_DOUT2;
    /// D5..D0 all outputs.
    pub const OUTPUT_DIRECTION: u8 = 0x3F;
    /// Chip-select argument flag: bit 7 set means the select bits are valid.
    pub const CHIP_SELECT_VALID: u8 = 0x80;
}

// --- UIO stream opcodes ---
pub mod uio {
    pub const CMD_UIO_STREAM: u8 = 0xAB;

    pub const STM_IN: u8 = 0x00;
    pub const STM_DIR: u8 = 0x40;
    pub const STM_OUT: u8 = 0x80;
    pub const STM_END: u8 = 0x20;

    /// D5..D0 value mask for `STM_DIR` and `STM_OUT`.
    pub const VALUE_MASK: u8 = 0x3F;
}

// --- Stream mode bits (`set_stream`) ---
pub mod stream {
    pub const SPEED_MASK: u8 = 0b0000_0011;
    pub const DUAL_IO: u8 = 1 << 2;
    pub const MSB_FIRST: u8 = 1 << 7;
}

// --- GPIO ---
pub mod gpio {
    /// Host-side shadow of the direction word after open (control outputs
    /// of the parallel port driven, D7..D0 inputs).
    pub const DEFAULT_DIRECTION: u32 = 0x000F_C000;
    /// Highest pin bit addressable by `set_output`.
    pub const PIN_COUNT: u8 = 20;
    /// Enable flags of `set_output`.
    pub const ENABLE_DATA_8_15: u8 = 1 << 0;
    pub const ENABLE_DIR_8_15: u8 = 1 << 1;
    pub const ENABLE_DATA_0_7: u8 = 1 << 2;
    pub const ENABLE_DIR_0_7: u8 = 1 << 3;
    pub const ENABLE_DATA_16_19: u8 = 1 << 4;
    pub const ENABLE_MASK: u8 = 0x1F;
}

// --- Serial strap line control ---
pub mod serial {
    pub const LCR_ENABLE_RX: u8 = 0x80;
    pub const LCR_ENABLE_TX: u8 = 0x40;
    pub const LCR_MARK_SPACE: u8 = 0x20;
    pub const LCR_PAR_EVEN: u8 = 0x10;
    pub const LCR_ENABLE_PAR: u8 = 0x08;
    pub const LCR_CS8: u8 = 0x03;

    /// Base clock of the baud generator.
    pub const CLOCK_RATE: u32 = 48_000_000;
    pub const MIN_BAUD: u32 = 50;
    pub const MAX_BAUD: u32 = 3_000_000;
    /// Divisor register flag: disable the receive FIFO wait.
    pub const DIVISOR_NO_WAIT: u16 = 1 << 7;
    /// Lowest version byte whose divisor register takes `DIVISOR_NO_WAIT`.
    pub const NO_WAIT_MIN_VERSION: u8 = 0x28;
}

// --- Background pumps and notification polling ---
pub mod pump {
    /// FIFO capacity in packets (one device working buffer).
    pub const QUEUE_PACKETS: usize = super::MAX_BUFFER_LENGTH / super::PACKET_LENGTH;
    /// Poll window of one pump transfer, so stop requests are seen promptly.
    pub const POLL_MS: u64 = 50;
    /// Interrupt events kept before the oldest is dropped.
    pub const INTERRUPT_QUEUE: usize = 64;
    /// Enumeration period of the device watcher.
    pub const WATCH_PERIOD_MS: u64 = 200;
}
