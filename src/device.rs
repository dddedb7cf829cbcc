//! Device session handle and generic device operations for CH341 adapters.

use crate::buffered::{DownloadPump, UploadPump};
use crate::consts;
use crate::error::{session_closed, unsupported_on, Error, Result};
use crate::flags::PinState;
use crate::i2c::{I2cSpeed, StreamMode};
use crate::interrupt::InterruptWatcher;
use crate::packet::{DriverCommand, SetupPacket};
use crate::parallel::ParallelMode;
use crate::serial::Parity;
use crate::transport::{DeviceIdentity, Pipe, UsbHandle};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

/// Silicon revision reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChipVersion {
    /// Original CH341 (no stream commands).
    Ch341,
    /// CH341A.
    Ch341A,
    /// CH341A3 and later.
    Ch341A3,
}

impl ChipVersion {
    /// Classifies the first byte of the version request.
    pub fn from_version_byte(version: u8) -> Self {
        if version >= consts::chip::CH341A3 {
            ChipVersion::Ch341A3
        } else if version >= consts::chip::CH341A {
            ChipVersion::Ch341A
        } else {
            ChipVersion::Ch341
        }
    }

    /// Nominal version code (`0x10`, `0x20`, `0x30`).
    pub fn code(self) -> u8 {
        match self {
            ChipVersion::Ch341 => consts::chip::CH341,
            ChipVersion::Ch341A => consts::chip::CH341A,
            ChipVersion::Ch341A3 => consts::chip::CH341A3,
        }
    }

    #[inline]
    pub fn is_ch341a_or_newer(self) -> bool {
        self >= ChipVersion::Ch341A
    }
}

/// Which USB personality the chip was strapped into at power-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strap {
    /// `0x5512`: I2C/SPI/EPP/MEM/GPIO.
    Parallel,
    /// `0x5584`: printer port.
    Printer,
    /// `0x5523`: UART.
    Serial,
}

impl Strap {
    pub fn from_pid(pid: u16) -> Self {
        match pid {
            consts::CH341_SERIAL_PID => Strap::Serial,
            consts::CH341_PRINTER_PID => Strap::Printer,
            _ => Strap::Parallel,
        }
    }
}

/// Features available on the attached adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Raw version byte returned by the chip.
    pub version: u8,
    pub chip: ChipVersion,
    pub strap: Strap,
    /// I2C, SPI and UIO stream commands.
    pub streams: bool,
    pub ecp: bool,
    pub epp19: bool,
    /// MEM mode combined address+data access.
    pub mem_addressing: bool,
    /// Largest block moved by one EPP/MEM read or write call.
    pub epp_block_max: usize,
}

impl Capabilities {
    pub fn new(version: u8, strap: Strap) -> Self {
        let chip = ChipVersion::from_version_byte(version);
        let newer = chip.is_ch341a_or_newer();
        Capabilities {
            version,
            chip,
            strap,
            streams: newer,
            ecp: newer,
            epp19: newer,
            mem_addressing: newer,
            epp_block_max: if newer {
                consts::para::EPP_IO_MAX_CH341A
            } else {
                consts::para::EPP_IO_MAX_CH341
            },
        }
    }
}

/// Bus personality selected with [`Ch341::set_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    I2c(I2cSpeed),
    Spi { msb_first: bool },
    Parallel(ParallelMode),
    Serial { parity: Parity, baud: u32 },
    Gpio,
}

/// Per-session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// `None` waits forever.
    pub write_timeout: Option<Duration>,
    /// `None` waits forever.
    pub read_timeout: Option<Duration>,
    pub exclusive: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            write_timeout: None,
            read_timeout: None,
            exclusive: false,
        }
    }
}

/// Converts a millisecond timeout with the "no timeout" sentinel.
pub fn timeout_from_ms(ms: u32) -> Option<Duration> {
    if ms == consts::NO_TIMEOUT_MS {
        None
    } else {
        Some(Duration::from_millis(u64::from(ms)))
    }
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) personality: Option<Personality>,
    pub(crate) para_mode: Option<ParallelMode>,
    pub(crate) stream: StreamMode,
    pub(crate) gpio_dir: u32,
    pub(crate) gpio_data: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            personality: None,
            para_mode: None,
            stream: StreamMode::default(),
            gpio_dir: consts::gpio::DEFAULT_DIRECTION,
            gpio_data: 0,
        }
    }
}

/// An open session on one CH341 adapter.
///
/// Sessions are created by [`DeviceRegistry::open`](crate::DeviceRegistry::open)
/// and shared as `Arc<Ch341>`. After the registry closes the session every
/// operation fails with [`Error::DeviceUnavailable`].
///
/// Personality operations on one session are not reentrant: a command and
/// its response are exchanged under the session's I/O lock, but callers that
/// interleave multi-step sequences from several threads must serialize them.
pub struct Ch341 {
    pub(crate) index: usize,
    pub(crate) identity: DeviceIdentity,
    pub(crate) capabilities: Capabilities,
    handle: RwLock<Option<Arc<dyn UsbHandle>>>,
    io: Mutex<()>,
    /// Shared with the download worker, which reads the write timeout per packet.
    pub(crate) config: Arc<Mutex<SessionConfig>>,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) upload: Mutex<Option<UploadPump>>,
    pub(crate) download: Mutex<Option<DownloadPump>>,
    pub(crate) interrupts: Mutex<Option<InterruptWatcher>>,
    pub(crate) workers: Arc<AtomicUsize>,
}

impl fmt::Debug for Ch341 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ch341")
            .field("index", &self.index)
            .field("identity", &self.identity)
            .field("capabilities", &self.capabilities)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Ch341 {
    // --- Construction and Info ---

    /// Wraps an opened handle, detecting the chip revision.
    pub(crate) fn open(
        index: usize,
        identity: DeviceIdentity,
        handle: Arc<dyn UsbHandle>,
        workers: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let mut version = [0u8; 2];
        let setup = SetupPacket::vendor_read(consts::vendor::GET_VER, 0, 0, version.len() as u16);
        let n = handle.control_transfer(&setup, &mut version, None)?;
        if n == 0 {
            return Err(Error::MalformedPacket(
                "empty chip version response".to_string(),
            ));
        }
        let capabilities = Capabilities::new(version[0], Strap::from_pid(identity.pid));
        debug!(
            "Session {} on {}: version byte 0x{:02X} -> {:?}",
            index, identity, version[0], capabilities
        );
        Ok(Ch341 {
            index,
            identity,
            capabilities,
            handle: RwLock::new(Some(handle)),
            io: Mutex::new(()),
            config: Arc::new(Mutex::new(SessionConfig::default())),
            state: Mutex::new(SessionState::default()),
            upload: Mutex::new(None),
            download: Mutex::new(None),
            interrupts: Mutex::new(None),
            workers,
        })
    }

    /// Logical index of this session.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Device name, usable as a notification filter.
    pub fn device_name(&self) -> String {
        self.identity.id_string()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn chip_version(&self) -> ChipVersion {
        self.capabilities.chip
    }

    /// `false` once the registry has closed this session.
    pub fn is_open(&self) -> bool {
        self.handle.read().is_some()
    }

    pub fn config(&self) -> SessionConfig {
        self.config.lock().clone()
    }

    pub fn personality(&self) -> Option<Personality> {
        self.state.lock().personality
    }

    // --- Configuration ---

    /// Sets per-operation timeouts in milliseconds. `0xFFFF_FFFF` disables the timeout.
    pub fn set_timeouts(&self, write_ms: u32, read_ms: u32) -> Result<()> {
        self.handle()?;
        let mut config = self.config.lock();
        config.write_timeout = timeout_from_ms(write_ms);
        config.read_timeout = timeout_from_ms(read_ms);
        debug!(
            "Session {} timeouts: write={:?}, read={:?}",
            self.index, config.write_timeout, config.read_timeout
        );
        Ok(())
    }

    pub(crate) fn set_exclusive_flag(&self, exclusive: bool) {
        self.config.lock().exclusive = exclusive;
    }

    /// Selects a bus personality, validating it against the chip revision
    /// and the USB strap.
    pub fn set_mode(&self, personality: Personality) -> Result<()> {
        self.check_personality(&personality)?;
        debug!("Session {} personality -> {:?}", self.index, personality);
        match personality {
            Personality::I2c(speed) => {
                let mode = StreamMode {
                    speed,
                    ..self.stream_mode()
                };
                self.set_stream(mode)?;
            }
            Personality::Spi { msb_first } => {
                let mode = StreamMode {
                    msb_first,
                    dual_io: false,
                    ..self.stream_mode()
                };
                self.set_stream(mode)?;
            }
            Personality::Parallel(mode) => self.set_para_mode(mode)?,
            Personality::Serial { parity, baud } => self.setup_serial(parity, baud)?,
            Personality::Gpio => {}
        }
        self.state.lock().personality = Some(personality);
        Ok(())
    }

    fn check_personality(&self, personality: &Personality) -> Result<()> {
        let caps = self.capabilities;
        let strap_ok = match personality {
            Personality::Serial { .. } => caps.strap == Strap::Serial,
            Personality::Parallel(_) => caps.strap != Strap::Serial,
            _ => caps.strap == Strap::Parallel,
        };
        if !strap_ok {
            return Err(Error::UnsupportedMode(format!(
                "{:?} is not available with the {:?} strap (PID 0x{:04X})",
                personality, caps.strap, self.identity.pid
            )));
        }
        match personality {
            Personality::I2c(_) | Personality::Spi { .. } if !caps.streams => {
                Err(unsupported_on("Stream commands", caps.chip))
            }
            Personality::Parallel(ParallelMode::Ecp) if !caps.ecp => {
                Err(unsupported_on("ECP mode", caps.chip))
            }
            Personality::Parallel(ParallelMode::Epp19) if !caps.epp19 => {
                Err(unsupported_on("EPP 1.9 mode", caps.chip))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn require_streams(&self, feature: &str) -> Result<()> {
        if self.capabilities.streams {
            Ok(())
        } else {
            Err(unsupported_on(feature, self.capabilities.chip))
        }
    }

    // --- Transport Access ---

    pub(crate) fn handle(&self) -> Result<Arc<dyn UsbHandle>> {
        self.handle
            .read()
            .as_ref()
            .cloned()
            .ok_or_else(|| session_closed(self.index))
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.config.lock().read_timeout
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        self.config.lock().write_timeout
    }

    pub(crate) fn vendor_write(&self, request: u8, value: u16, index: u16) -> Result<()> {
        let setup = SetupPacket::vendor_write(request, value, index);
        trace!("Vendor OUT {:02X?}", setup.to_bytes());
        self.handle()?
            .control_transfer(&setup, &mut [], self.write_timeout())?;
        Ok(())
    }

    pub(crate) fn vendor_read(&self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        let setup = SetupPacket::vendor_read(request, value, index, buf.len() as u16);
        let n = self
            .handle()?
            .control_transfer(&setup, buf, self.read_timeout())?;
        trace!("Vendor IN {:02X?} -> {:02X?}", setup.to_bytes(), &buf[..n]);
        Ok(n)
    }

    /// Reads from the upload pipe. With upload buffering enabled this drains
    /// already-queued data without touching the transport.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if let Some(pump) = self.upload.lock().as_ref() {
            return Ok(pump.read_available(buf));
        }
        let n = self
            .handle()?
            .bulk_read(Pipe::DataUp, buf, self.read_timeout())?;
        trace!("Read {} bytes: {:02X?}", n, &buf[..n]);
        Ok(n)
    }

    /// Writes to the download pipe and returns the number of bytes accepted.
    /// With download buffering enabled the data is queued and this returns
    /// without waiting for the transport.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if let Some(pump) = self.download.lock().as_ref() {
            return Ok(pump.enqueue(data, self.write_timeout()));
        }
        trace!("Write {} bytes: {:02X?}", data.len(), data);
        self.handle()?
            .bulk_write(Pipe::DataDown, data, self.write_timeout())
    }

    // Sends each packet as its own transfer; a short write is a timeout.
    fn send_packets_unlocked(&self, packets: &[Vec<u8>]) -> Result<()> {
        for packet in packets {
            trace!("Command packet: {:02X?}", packet);
            let sent = self.write(packet)?;
            if sent < packet.len() {
                warn!("Command packet truncated: sent {} of {} bytes", sent, packet.len());
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    // Collects exactly `len` response bytes; each read has its own timeout window.
    fn read_response_unlocked(&self, len: usize) -> Result<Vec<u8>> {
        let timeout = self.read_timeout();
        let mut response = vec![0u8; len];
        let mut received = 0;
        while received < len {
            // The pump slot is released before waiting so close can stop the pump
            let reader = self.upload.lock().as_ref().map(UploadPump::reader);
            let n = match reader {
                Some(reader) => reader.read_timeout(&mut response[received..], timeout)?,
                None => self
                    .handle()?
                    .bulk_read(Pipe::DataUp, &mut response[received..], timeout)?,
            };
            if n == 0 {
                return Err(Error::Timeout);
            }
            received += n;
        }
        trace!("Response: {:02X?}", response);
        Ok(response)
    }

    /// Sends command packets without expecting a response.
    pub(crate) fn send_command(&self, packets: &[Vec<u8>]) -> Result<()> {
        let _io = self.io.lock();
        self.send_packets_unlocked(packets)
    }

    /// Sends command packets, then reads `response_len` bytes.
    pub(crate) fn transact(&self, packets: &[Vec<u8>], response_len: usize) -> Result<Vec<u8>> {
        let _io = self.io.lock();
        self.send_packets_unlocked(packets)?;
        if response_len == 0 {
            return Ok(Vec::new());
        }
        self.read_response_unlocked(response_len)
    }

    /// Like [`transact`](Self::transact), but each packet is followed by
    /// reading its own share of the response.
    pub(crate) fn transact_each(&self, exchanges: &[(Vec<u8>, usize)]) -> Result<Vec<u8>> {
        let _io = self.io.lock();
        let mut response = Vec::new();
        for (packet, len) in exchanges {
            self.send_packets_unlocked(std::slice::from_ref(packet))?;
            if *len > 0 {
                response.extend(self.read_response_unlocked(*len)?);
            }
        }
        Ok(response)
    }

    // --- Generic Device Operations ---

    /// Writes a command stream, then reads `step * times` bytes.
    pub fn write_read(&self, command: &[u8], step: usize, times: usize) -> Result<Vec<u8>> {
        let total = step.checked_mul(times).unwrap_or(usize::MAX);
        if total > consts::MAX_BUFFER_LENGTH {
            return Err(Error::TransferTooLarge {
                max: consts::MAX_BUFFER_LENGTH,
                actual: total,
            });
        }
        if command.len() > consts::MAX_BUFFER_LENGTH {
            return Err(Error::TransferTooLarge {
                max: consts::MAX_BUFFER_LENGTH,
                actual: command.len(),
            });
        }
        let packets: Vec<Vec<u8>> = command
            .chunks(consts::PACKET_LENGTH)
            .map(|c| c.to_vec())
            .collect();
        self.transact(&packets, total)
    }

    /// Reads the 24-bit pin status word.
    pub fn get_input(&self) -> Result<u32> {
        let response = self.transact(&[vec![consts::para::CMD_STS]], consts::para::STATUS_LENGTH)?;
        Ok(u32::from(response[0]) | (u32::from(response[1]) << 8) | (u32::from(response[2]) << 16))
    }

    /// Reads the pin status word as typed flags.
    pub fn get_status(&self) -> Result<PinState> {
        self.get_input().map(PinState::from_bits_retain)
    }

    /// Clears the adapter's internal buffers.
    pub fn flush_buffer(&self) -> Result<()> {
        debug!("Session {}: flushing adapter buffers", self.index);
        self.vendor_write(consts::vendor::BUF_CLEAR, 0, 0)
    }

    /// Programs the adapter-side delay used between buffered operations.
    pub fn set_delay_ms(&self, delay_ms: u16) -> Result<()> {
        debug!("Session {}: delay {} ms", self.index, delay_ms);
        self.vendor_write(consts::vendor::DELAY_MS, delay_ms, 0)
    }

    fn get_descriptor(&self, kind: u16, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let setup = SetupPacket {
            request_type: consts::usb::REQUEST_TYPE_STANDARD_IN,
            request: consts::usb::GET_DESCRIPTOR,
            value: kind,
            index: 0,
            length: len as u16,
        };
        let n = self
            .handle()?
            .control_transfer(&setup, &mut buf, self.read_timeout())?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Raw USB device descriptor.
    pub fn device_descriptor(&self) -> Result<Vec<u8>> {
        self.get_descriptor(
            consts::usb::DESCRIPTOR_DEVICE,
            consts::usb::DEVICE_DESCRIPTOR_LENGTH,
        )
    }

    /// Raw USB configuration descriptor (with interface and endpoint descriptors).
    pub fn config_descriptor(&self) -> Result<Vec<u8>> {
        self.get_descriptor(
            consts::usb::DESCRIPTOR_CONFIG,
            consts::usb::CONFIG_DESCRIPTOR_MAX,
        )
    }

    /// Port-resets the adapter. Session configuration is kept, chip-side
    /// mode state is lost.
    pub fn reset_device(&self) -> Result<()> {
        debug!("Session {}: reset", self.index);
        self.handle()?.reset()?;
        let mut state = self.state.lock();
        state.para_mode = None;
        state.stream = StreamMode::default();
        Ok(())
    }

    // --- Driver Command Envelope ---

    /// Executes one driver command and returns its response envelope.
    ///
    /// Transport failures come back as a response carrying the transport's
    /// own status code; other errors are returned as `Err`.
    pub fn driver_command(&self, command: &DriverCommand) -> Result<DriverCommand> {
        trace!(
            "Driver command 0x{:02X} with {} bytes",
            command.code,
            command.data.len()
        );
        match self.dispatch(command) {
            Ok(data) => DriverCommand::new(consts::STATUS_SUCCESS, &data),
            Err(Error::Transport { status }) => Ok(DriverCommand {
                code: status,
                data: Vec::new(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Byte-level form of [`driver_command`](Self::driver_command).
    pub fn execute(&self, request: &[u8]) -> Result<Vec<u8>> {
        let command = DriverCommand::from_bytes(request)?;
        self.driver_command(&command).map(|r| r.to_bytes())
    }

    fn dispatch(&self, command: &DriverCommand) -> Result<Vec<u8>> {
        let data = &command.data;
        match command.code {
            consts::func::NO_OPERATION => Ok(Vec::new()),
            consts::func::GET_VERSION => Ok(consts::DRIVER_VERSION.to_le_bytes().to_vec()),
            consts::func::PIPE_DEVICE_CTRL => {
                let setup = SetupPacket::from_bytes(data)?;
                let mut stage = if setup.is_in() {
                    vec![0u8; setup.length as usize]
                } else {
                    data[SetupPacket::LENGTH..].to_vec()
                };
                let timeout = if setup.is_in() {
                    self.read_timeout()
                } else {
                    self.write_timeout()
                };
                let n = self.handle()?.control_transfer(&setup, &mut stage, timeout)?;
                stage.truncate(n);
                Ok(if setup.is_in() { stage } else { Vec::new() })
            }
            consts::func::PIPE_DATA_UP => {
                let mut buf = vec![0u8; data.len()];
                let n = self.read(&mut buf)?;
                buf.truncate(n);
                Ok(buf)
            }
            consts::func::PIPE_DATA_DOWN => {
                let n = self.write(data)?;
                Ok(data[..n].to_vec())
            }
            consts::func::PIPE_INTER_UP => {
                let status = self.read_interrupt()?;
                Ok(status.bits().to_le_bytes()[..3].to_vec())
            }
            consts::func::GET_CONFIG => self.config_descriptor(),
            consts::func::SET_TIMEOUT => {
                let write_ms = le_u32(data, 0)?;
                let read_ms = le_u32(data, 4)?;
                self.set_timeouts(write_ms, read_ms).map(|_| Vec::new())
            }
            consts::func::RESET_DEVICE => self.reset_device().map(|_| Vec::new()),
            consts::func::SET_PARA_MODE => {
                let mode = data.first().copied().unwrap_or_default();
                self.set_para_mode(ParallelMode::from_u8(mode)?)
                    .map(|_| Vec::new())
            }
            consts::func::WRITE_READ => {
                let step = le_u32(data, 0)? as usize;
                let times = le_u32(data, 4)? as usize;
                self.write_read(&data[8..], step, times)
            }
            consts::func::BUFFER_MODE => self
                .set_buffered_upload(data.first().is_some_and(|&b| b != 0))
                .map(|_| Vec::new()),
            consts::func::BUFFER_MODE_DOWN => self
                .set_buffered_download(data.first().is_some_and(|&b| b != 0))
                .map(|_| Vec::new()),
            consts::func::READ_DATA0 => self.read_data0(data.len()),
            consts::func::READ_DATA1 => self.read_data1(data.len()),
            consts::func::WRITE_DATA0 => self.write_data0(data).map(|n| data[..n].to_vec()),
            consts::func::WRITE_DATA1 => self.write_data1(data).map(|n| data[..n].to_vec()),
            code => Err(Error::ArgumentOutOfRange(format!(
                "unknown driver function code 0x{:02X}",
                code
            ))),
        }
    }

    // --- Shutdown ---

    /// Stops background workers and releases the transport handle. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.stop_workers();
        if self.handle.write().take().is_some() {
            debug!("Session {} on {} released", self.index, self.identity);
        }
    }
}

fn le_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| {
            Error::MalformedPacket(format!(
                "driver command needs a 32-bit word at offset {} (got {} bytes)",
                offset,
                data.len()
            ))
        })
}

impl Drop for Ch341 {
    fn drop(&mut self) {
        self.shutdown();
    }
}
