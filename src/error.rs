use thiserror::Error;

/// Errors that can occur when using CH341 devices.
///
/// Length and addressing problems are detected before any USB traffic is
/// issued. Status codes reported by the USB transport are passed through in
/// [`Error::Transport`] without reinterpretation.
#[derive(Error, Debug)]
pub enum Error {
    /// No physical device backs the requested index, or the session was closed.
    #[error("Device unavailable at index {index}: {message}")]
    DeviceUnavailable {
        /// The logical index that was requested.
        index: usize,
        /// Additional error details.
        message: String,
    },
    /// The device is held exclusively by another session.
    #[error("Device at index {index} is held for exclusive use")]
    ExclusivityViolation {
        /// The logical index that was requested.
        index: usize,
    },
    /// The personality or feature is not available on the detected chip.
    #[error("Mode not supported by this chip: {0}")]
    UnsupportedMode(String),
    /// A command payload does not fit the packet it is encoded into.
    #[error("Payload too large for packet (max {max}, got {actual})")]
    PayloadTooLarge {
        /// Maximum payload size.
        max: usize,
        /// Payload size supplied.
        actual: usize,
    },
    /// A transfer exceeds a protocol or hardware limit.
    #[error("Transfer too large (max {max}, got {actual})")]
    TransferTooLarge {
        /// Maximum allowed size for this operation.
        max: usize,
        /// Actual size requested.
        actual: usize,
    },
    /// A received buffer violates the packet structure.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    /// The bus target did not acknowledge.
    #[error(
        "No acknowledge from I2C address 0x{address:02X}. This is normal when scanning for devices."
    )]
    DeviceNotResponding {
        /// The 7-bit address that was not acknowledged.
        address: u8,
    },
    /// A single transport operation exceeded its configured timeout.
    #[error("Timeout waiting for device response")]
    Timeout,
    /// The transport reported a failure; the status is its own result code.
    #[error("USB transport error (status 0x{status:08X})")]
    Transport {
        /// Opaque transport status code.
        status: u32,
    },
    /// SDA or SCL is held low while the bus should be idle.
    #[error(
        "I2C bus stuck (SDA low: {sda_low}, SCL low: {scl_low}). Check for unpowered targets holding the lines or missing pull-ups."
    )]
    BusStuck {
        /// SDA read low.
        sda_low: bool,
        /// SCL read low.
        scl_low: bool,
    },
    /// A background worker thread could not be started.
    #[error("Failed to start {worker} worker: {source}")]
    WorkerSpawn {
        /// Which worker was being started.
        worker: &'static str,
        /// The operating system error.
        #[source]
        source: std::io::Error,
    },
    /// Function argument is outside the valid range.
    #[error("Argument out of range: {0}")]
    ArgumentOutOfRange(String),
}

/// Result type alias for CH341 operations.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn unsupported_on(feature: &str, chip: crate::ChipVersion) -> Error {
    Error::UnsupportedMode(format!("{} requires CH341A or newer (found {:?})", feature, chip))
}

pub(crate) fn session_closed(index: usize) -> Error {
    Error::DeviceUnavailable {
        index,
        message: "session is closed".to_string(),
    }
}

pub(crate) fn spawn_failed(worker: &'static str, source: std::io::Error) -> Error {
    log::warn!("Failed to spawn {} worker: {}", worker, source);
    Error::WorkerSpawn { worker, source }
}
