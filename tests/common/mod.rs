//! In-process CH341 simulator used by the integration tests.
//!
//! `SimBus` implements the transport capability over a set of `SimDevice`s.
//! Each device interprets the command packets written to its download pipe
//! the way the chip does and queues the replies on its upload pipe. It hosts
//! I2C memory targets, an SPI loopback gated on CS0, a UIO port that loops
//! DOUT/DOUT2 back to DIN/DIN2, two parallel block channels, MEM registers
//! and an interrupt queue.

#![allow(dead_code)]

use ch341_usb::packet::SetupPacket;
use ch341_usb::{DeviceIdentity, Pipe, Result, UsbHandle, UsbTransport};
use ch341_usb::{Error, CH341_PARALLEL_PID, WCH_VID};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest a simulated transfer blocks when no timeout is configured.
const MAX_WAIT: Duration = Duration::from_secs(2);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct SimBus {
    devices: Mutex<Vec<Arc<SimDevice>>>,
}

impl SimBus {
    pub fn new() -> Arc<Self> {
        Arc::new(SimBus::default())
    }

    pub fn with_devices(devices: &[Arc<SimDevice>]) -> Arc<Self> {
        let bus = SimBus::new();
        for dev in devices {
            bus.attach(Arc::clone(dev));
        }
        bus
    }

    pub fn attach(&self, device: Arc<SimDevice>) {
        self.devices.lock().push(device);
    }

    pub fn detach(&self, address: u8) -> Option<Arc<SimDevice>> {
        let mut devices = self.devices.lock();
        let pos = devices.iter().position(|d| d.identity.address == address)?;
        let dev = devices.remove(pos);
        dev.unplugged.store(true, Ordering::SeqCst);
        Some(dev)
    }
}

impl UsbTransport for SimBus {
    fn list_devices(&self, filter: Option<&str>) -> Result<Vec<DeviceIdentity>> {
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|d| d.identity.clone())
            .filter(|id| filter.map_or(true, |f| id.matches(f)))
            .collect())
    }

    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn UsbHandle>> {
        let device = self
            .devices
            .lock()
            .iter()
            .find(|d| &d.identity == identity)
            .cloned()
            .ok_or_else(|| Error::DeviceUnavailable {
                index: 0,
                message: format!("{} not attached", identity),
            })?;
        device.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimHandle { device }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct I2cStats {
    pub starts: usize,
    pub stops: usize,
    /// Data length of each length-tagged output block.
    pub out_blocks: Vec<usize>,
    /// Length of each input block.
    pub in_blocks: Vec<usize>,
    pub ms_delays: usize,
    pub last_set: Option<u8>,
}

struct I2cTarget {
    memory: Vec<u8>,
    address_bytes: usize,
    pointer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum I2cPhase {
    Idle,
    Address,
    Write { pending: usize, acc: usize },
    Read,
}

struct SimState {
    upload: VecDeque<u8>,
    interrupts: VecDeque<u32>,
    written: Vec<Vec<u8>>,
    vendor_writes: Vec<(u8, u16, u16)>,
    pins: u32,
    // I2C
    targets: HashMap<u8, I2cTarget>,
    phase: I2cPhase,
    current: Option<u8>,
    i2c: I2cStats,
    // UIO / SPI
    uio_out: u8,
    uio_dir: u8,
    // Parallel
    channels: [VecDeque<u8>; 2],
    mem_regs: [u8; 128],
    printed: Vec<u8>,
    pio: Vec<u8>,
    set_output: Vec<Vec<u8>>,
    // Serial strap
    uart_tx: Vec<u8>,
}

impl Default for SimState {
    fn default() -> Self {
        SimState {
            upload: VecDeque::new(),
            interrupts: VecDeque::new(),
            written: Vec::new(),
            vendor_writes: Vec::new(),
            // SDA and SCL pulled up
            pins: 0x00C0_0000,
            targets: HashMap::new(),
            phase: I2cPhase::Idle,
            current: None,
            i2c: I2cStats::default(),
            uio_out: 0x3F,
            uio_dir: 0,
            channels: [VecDeque::new(), VecDeque::new()],
            mem_regs: [0; 128],
            printed: Vec::new(),
            pio: Vec::new(),
            set_output: Vec::new(),
            uart_tx: Vec::new(),
        }
    }
}

pub struct SimDevice {
    pub identity: DeviceIdentity,
    version: u8,
    state: Mutex<SimState>,
    data_ready: Condvar,
    pub opens: AtomicUsize,
    pub releases: AtomicUsize,
    pub resets: AtomicUsize,
    /// Every call made through a handle of this device.
    pub transport_calls: AtomicUsize,
    /// Makes bulk writes block until their timeout.
    pub stall_writes: AtomicBool,
    /// Makes bulk writes take the full `MAX_WAIT` whatever their timeout.
    pub hang_writes: AtomicBool,
    unplugged: AtomicBool,
}

impl SimDevice {
    pub fn new(address: u8, pid: u16, version: u8) -> Arc<Self> {
        Arc::new(SimDevice {
            identity: DeviceIdentity::new(1, address, WCH_VID, pid),
            version,
            state: Mutex::new(SimState::default()),
            data_ready: Condvar::new(),
            opens: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            transport_calls: AtomicUsize::new(0),
            stall_writes: AtomicBool::new(false),
            hang_writes: AtomicBool::new(false),
            unplugged: AtomicBool::new(false),
        })
    }

    /// A CH341A3 on the parallel strap.
    pub fn ch341a(address: u8) -> Arc<Self> {
        SimDevice::new(address, CH341_PARALLEL_PID, 0x30)
    }

    /// An original CH341 on the parallel strap.
    pub fn ch341(address: u8) -> Arc<Self> {
        SimDevice::new(address, CH341_PARALLEL_PID, 0x12)
    }

    pub fn add_i2c_target(&self, addr7: u8, size: usize, address_bytes: usize) {
        self.state.lock().targets.insert(
            addr7,
            I2cTarget {
                memory: vec![0xFF; size],
                address_bytes,
                pointer: 0,
            },
        );
    }

    pub fn i2c_memory(&self, addr7: u8) -> Vec<u8> {
        self.state
            .lock()
            .targets
            .get(&addr7)
            .map(|t| t.memory.clone())
            .unwrap_or_default()
    }

    pub fn i2c_stats(&self) -> I2cStats {
        self.state.lock().i2c.clone()
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.i2c = I2cStats::default();
        state.written.clear();
    }

    pub fn push_upload(&self, data: &[u8]) {
        self.state.lock().upload.extend(data.iter().copied());
        self.data_ready.notify_all();
    }

    pub fn push_interrupt(&self, word: u32) {
        self.state.lock().interrupts.push_back(word);
        self.data_ready.notify_all();
    }

    pub fn set_pins(&self, word: u32) {
        self.state.lock().pins = word;
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn vendor_writes(&self) -> Vec<(u8, u16, u16)> {
        self.state.lock().vendor_writes.clone()
    }

    pub fn uio_levels(&self) -> u8 {
        self.state.lock().uio_out
    }

    pub fn queue_channel(&self, channel: usize, data: &[u8]) {
        self.state.lock().channels[channel].extend(data.iter().copied());
    }

    pub fn channel(&self, channel: usize) -> Vec<u8> {
        self.state.lock().channels[channel].iter().copied().collect()
    }

    pub fn mem_reg(&self, addr: u8) -> u8 {
        self.state.lock().mem_regs[addr as usize]
    }

    pub fn printed(&self) -> Vec<u8> {
        self.state.lock().printed.clone()
    }

    pub fn pio(&self) -> Vec<u8> {
        self.state.lock().pio.clone()
    }

    pub fn set_output_packets(&self) -> Vec<Vec<u8>> {
        self.state.lock().set_output.clone()
    }

    pub fn uart_tx(&self) -> Vec<u8> {
        self.state.lock().uart_tx.clone()
    }

    pub fn calls(&self) -> usize {
        self.transport_calls.load(Ordering::SeqCst)
    }

    fn is_serial(&self) -> bool {
        self.identity.pid == ch341_usb::CH341_SERIAL_PID
    }

    fn check_attached(&self) -> Result<()> {
        if self.unplugged.load(Ordering::SeqCst) {
            Err(Error::DeviceUnavailable {
                index: 0,
                message: "unplugged".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn handle_bulk_write(&self, data: &[u8]) {
        let mut state = self.state.lock();
        state.written.push(data.to_vec());
        if self.is_serial() {
            state.uart_tx.extend_from_slice(data);
            return;
        }
        let Some((&opcode, body)) = data.split_first() else {
            return;
        };
        match opcode {
            0xA0 => {
                let pins = state.pins.to_le_bytes();
                state.upload.extend([pins[0], pins[1], pins[2], 0, 0, 0]);
            }
            0xA1 => state.set_output.push(data.to_vec()),
            0xA2 => mem_io(&mut state, body),
            0xA3 => state.printed.extend_from_slice(body),
            0xA6 => state.channels[0].extend(body.iter().copied()),
            0xA7 => state.channels[1].extend(body.iter().copied()),
            0xA8 => spi_stream(&mut state, body),
            0xAA => i2c_stream(&mut state, body),
            0xAB => uio_stream(&mut state, body),
            0xAC | 0xAD => {
                let channel = usize::from(opcode - 0xAC);
                let len = body.first().copied().unwrap_or(0) as usize;
                for _ in 0..len {
                    let b = state.channels[channel].pop_front().unwrap_or(0);
                    state.upload.push_back(b);
                }
            }
            0xAE => state.pio.extend_from_slice(body),
            _ => {}
        }
        drop(state);
        self.data_ready.notify_all();
    }
}

fn mem_io(state: &mut SimState, body: &[u8]) {
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if b & 0x80 != 0 {
            let value = state.mem_regs[(b & 0x7F) as usize];
            state.upload.push_back(value);
            i += 1;
        } else {
            if let Some(&value) = body.get(i + 1) {
                state.mem_regs[b as usize] = value;
            }
            i += 2;
        }
    }
}

fn cs0_asserted(state: &SimState) -> bool {
    state.uio_out & 0x01 == 0
}

fn spi_stream(state: &mut SimState, body: &[u8]) {
    let looped = cs0_asserted(state);
    for &b in body {
        state.upload.push_back(if looped { b } else { 0xFF });
    }
}

fn uio_stream(state: &mut SimState, body: &[u8]) {
    for &b in body {
        match b & 0xC0 {
            0x00 if b & 0x20 != 0 => break,
            0x00 => {
                let out = state.uio_out;
                let din = (out >> 5) & 1;
                let din2 = (out >> 4) & 1;
                state.upload.push_back((out & 0x3F) | (din << 7) | (din2 << 6));
            }
            0x40 => state.uio_dir = b & 0x3F,
            0x80 => state.uio_out = b & 0x3F,
            _ => {}
        }
    }
}

fn i2c_out_byte(state: &mut SimState, byte: u8) -> u8 {
    match state.phase {
        I2cPhase::Address => {
            let addr7 = byte >> 1;
            let present = state.targets.contains_key(&addr7);
            state.current = present.then_some(addr7);
            if byte & 1 != 0 {
                state.phase = I2cPhase::Read;
            } else {
                let pending = state.targets.get(&addr7).map_or(0, |t| t.address_bytes);
                state.phase = I2cPhase::Write { pending, acc: 0 };
            }
            if present {
                0x00
            } else {
                0x80
            }
        }
        I2cPhase::Write { pending, acc } => {
            let current = state.current;
            if let Some(target) = current.and_then(|a| state.targets.get_mut(&a)) {
                if pending > 0 {
                    let acc = (acc << 8) | usize::from(byte);
                    if pending == 1 {
                        target.pointer = acc % target.memory.len();
                    }
                    state.phase = I2cPhase::Write {
                        pending: pending - 1,
                        acc,
                    };
                } else {
                    let len = target.memory.len();
                    target.memory[target.pointer % len] = byte;
                    target.pointer = (target.pointer + 1) % len;
                }
            }
            0x00
        }
        _ => 0x80,
    }
}

fn i2c_in_byte(state: &mut SimState) -> u8 {
    let current = state.current;
    match current.and_then(|a| state.targets.get_mut(&a)) {
        Some(target) if state.phase == I2cPhase::Read => {
            let len = target.memory.len();
            let value = target.memory[target.pointer % len];
            target.pointer = (target.pointer + 1) % len;
            value
        }
        _ => 0xFF,
    }
}

fn i2c_stream(state: &mut SimState, body: &[u8]) {
    let mut i = 0;
    while i < body.len() {
        let cmd = body[i];
        i += 1;
        match cmd {
            0x00 => break,
            0x74 => {
                state.i2c.starts += 1;
                state.phase = I2cPhase::Address;
            }
            0x75 => {
                state.i2c.stops += 1;
                state.phase = I2cPhase::Idle;
                state.current = None;
            }
            0x40..=0x4F => {}
            0x50..=0x5F => state.i2c.ms_delays += 1,
            0x60..=0x6F => state.i2c.last_set = Some(cmd & 0x0F),
            0x80 => {
                if let Some(&byte) = body.get(i) {
                    let status = i2c_out_byte(state, byte);
                    state.upload.push_back(status);
                    i += 1;
                }
            }
            0x81..=0xBF => {
                let n = usize::from(cmd & 0x3F);
                state.i2c.out_blocks.push(n);
                let end = (i + n).min(body.len());
                for k in i..end {
                    i2c_out_byte(state, body[k]);
                }
                i = end;
            }
            0xC0..=0xFF => {
                let n = usize::from(cmd & 0x3F).max(1);
                state.i2c.in_blocks.push(n);
                for _ in 0..n {
                    let value = i2c_in_byte(state);
                    state.upload.push_back(value);
                }
            }
            _ => {}
        }
    }
}

/// Handle to a simulated device; dropping it is the release.
pub struct SimHandle {
    device: Arc<SimDevice>,
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.device.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl SimHandle {
    fn call(&self) -> Result<()> {
        self.device.transport_calls.fetch_add(1, Ordering::SeqCst);
        self.device.check_attached()
    }
}

impl UsbHandle for SimHandle {
    fn control_transfer(
        &self,
        setup: &SetupPacket,
        data: &mut [u8],
        _timeout: Option<Duration>,
    ) -> Result<usize> {
        self.call()?;
        let dev = &self.device;
        match (setup.request_type, setup.request) {
            (0xC0, 0x5F) => {
                let reply = [dev.version, 0x00];
                let n = reply.len().min(data.len());
                data[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            (0x80, 0x06) => {
                let [vid_lo, vid_hi] = dev.identity.vid.to_le_bytes();
                let [pid_lo, pid_hi] = dev.identity.pid.to_le_bytes();
                let reply: Vec<u8> = if setup.value == 0x0100 {
                    vec![
                        18, 1, 0x10, 0x01, 0xFF, 0, 0, 8, vid_lo, vid_hi, pid_lo, pid_hi, 0x04,
                        0x03, 0, 2, 0, 1,
                    ]
                } else {
                    vec![9, 2, 39, 0, 1, 1, 0, 0x80, 0x30]
                };
                let n = reply.len().min(data.len());
                data[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            (0x40, request) => {
                dev.state
                    .lock()
                    .vendor_writes
                    .push((request, setup.value, setup.index));
                Ok(data.len())
            }
            _ => Err(Error::Transport { status: 0xFFFF_FFF7 }),
        }
    }

    fn bulk_read(&self, pipe: Pipe, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.call()?;
        assert_eq!(pipe, Pipe::DataUp);
        let deadline = Instant::now() + timeout.unwrap_or(MAX_WAIT).min(MAX_WAIT);
        let mut state = self.device.state.lock();
        while state.upload.is_empty() {
            if self
                .device
                .data_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(Error::Timeout);
            }
        }
        let n = buf.len().min(32).min(state.upload.len());
        for (slot, byte) in buf.iter_mut().zip(state.upload.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn bulk_write(&self, pipe: Pipe, data: &[u8], timeout: Option<Duration>) -> Result<usize> {
        self.call()?;
        assert_eq!(pipe, Pipe::DataDown);
        if self.device.hang_writes.load(Ordering::SeqCst) {
            std::thread::sleep(MAX_WAIT);
            return Err(Error::Timeout);
        }
        if self.device.stall_writes.load(Ordering::SeqCst) {
            std::thread::sleep(timeout.unwrap_or(MAX_WAIT).min(MAX_WAIT));
            return Err(Error::Timeout);
        }
        self.device.handle_bulk_write(data);
        Ok(data.len())
    }

    fn poll_interrupt(&self, timeout: Option<Duration>) -> Result<Option<u32>> {
        self.call()?;
        let deadline = Instant::now() + timeout.unwrap_or(MAX_WAIT).min(MAX_WAIT);
        let mut state = self.device.state.lock();
        loop {
            if let Some(word) = state.interrupts.pop_front() {
                return Ok(Some(word));
            }
            if self
                .device
                .data_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    fn reset(&self) -> Result<()> {
        self.call()?;
        self.device.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Polls `cond` until it holds or `within` elapses.
pub fn wait_for(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
