//! Buffered upload and download.
//!
//! With buffering enabled a dedicated worker owns the bulk pipe for its
//! direction and exchanges 32-byte packets with the application through a
//! bounded FIFO of one device working buffer
//! ([`QUEUE_PACKETS`](crate::consts::pump::QUEUE_PACKETS) packets). A full
//! upload FIFO stalls the worker instead of dropping data; a full download
//! FIFO makes `write` return the partial count once the write timeout runs
//! out.
//!
//! Workers poll in short windows so that a stop request is observed within
//! [`POLL_MS`](crate::consts::pump::POLL_MS). Stopping joins the worker and
//! discards whatever is still queued.

use crate::consts::{self, pump};
use crate::device::Ch341;
use crate::device::SessionConfig;
use crate::error::{spawn_failed, Error, Result};
use crate::transport::{Pipe, UsbHandle};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Counts a live background worker for as long as it exists.
pub(crate) struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    pub(crate) fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        WorkerGuard(Arc::clone(counter))
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn poll_window() -> Duration {
    Duration::from_millis(pump::POLL_MS)
}

/// Background reader of the upload pipe.
pub(crate) struct UploadPump {
    thread: Option<JoinHandle<()>>,
    reader: UploadReader,
}

/// Consumer side of the upload FIFO. Cloned out of the session's pump slot
/// so that a blocked read never holds the slot.
#[derive(Clone)]
pub(crate) struct UploadReader {
    index: usize,
    rx: Receiver<Vec<u8>>,
    carry: Arc<Mutex<Vec<u8>>>,
    stop: Arc<AtomicBool>,
}

impl UploadPump {
    pub(crate) fn spawn(index: usize, handle: Arc<dyn UsbHandle>, workers: &Arc<AtomicUsize>) -> Result<Self> {
        let (tx, rx) = bounded::<Vec<u8>>(pump::QUEUE_PACKETS);
        let stop = Arc::new(AtomicBool::new(false));
        let guard = WorkerGuard::new(workers);
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("ch341-{}-upload", index))
            .spawn(move || {
                let _guard = guard;
                upload_loop(&*handle, &tx, &thread_stop);
            })
            .map_err(|e| spawn_failed("upload", e))?;
        Ok(UploadPump {
            thread: Some(thread),
            reader: UploadReader {
                index,
                rx,
                carry: Arc::new(Mutex::new(Vec::new())),
                stop,
            },
        })
    }

    pub(crate) fn reader(&self) -> UploadReader {
        self.reader.clone()
    }

    pub(crate) fn read_available(&self, buf: &mut [u8]) -> usize {
        self.reader.read_available(buf)
    }

    /// Packets waiting to be read (a partly read packet counts as one).
    pub(crate) fn backlog(&self) -> usize {
        let partial = usize::from(!self.reader.carry.lock().is_empty());
        self.reader.rx.len() + partial
    }

    /// Stops and joins the worker. Returns the number of discarded packets.
    /// Readers still waiting on the FIFO fail once the stop flag is set.
    pub(crate) fn stop(mut self) -> usize {
        self.reader.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Upload worker panicked");
            }
        }
        let discarded = self.backlog();
        if discarded > 0 {
            warn!("Discarding {} unread upload packet(s)", discarded);
        }
        discarded
    }
}

impl UploadReader {
    /// Copies already-queued data into `buf` without waiting.
    pub(crate) fn read_available(&self, buf: &mut [u8]) -> usize {
        let mut carry = self.carry.lock();
        let mut filled = take_carry(&mut carry, buf);
        while filled < buf.len() {
            match self.rx.try_recv() {
                Ok(packet) => filled += place(&packet, &mut buf[filled..], &mut carry),
                Err(_) => break,
            }
        }
        filled
    }

    /// Waits up to `timeout` for the first data, then behaves like
    /// [`read_available`](Self::read_available). The wait runs in poll
    /// windows and ends early when the pump is stopped.
    pub(crate) fn read_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        while !buf.is_empty() && self.carry.lock().is_empty() {
            if self.stop.load(Ordering::SeqCst) {
                return Err(upload_stopped(self.index));
            }
            let window = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::Timeout);
                    }
                    left.min(poll_window())
                }
                None => poll_window(),
            };
            match self.rx.recv_timeout(window) {
                Ok(packet) => self.carry.lock().extend_from_slice(&packet),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(upload_stopped(self.index)),
            }
        }
        Ok(self.read_available(buf))
    }
}

fn upload_stopped(index: usize) -> Error {
    Error::DeviceUnavailable {
        index,
        message: "upload worker stopped".to_string(),
    }
}

fn take_carry(carry: &mut Vec<u8>, buf: &mut [u8]) -> usize {
    let n = carry.len().min(buf.len());
    buf[..n].copy_from_slice(&carry[..n]);
    carry.drain(..n);
    n
}

// Copies as much of `packet` as fits; the rest becomes the carry-over.
fn place(packet: &[u8], buf: &mut [u8], carry: &mut Vec<u8>) -> usize {
    let n = packet.len().min(buf.len());
    buf[..n].copy_from_slice(&packet[..n]);
    carry.extend_from_slice(&packet[n..]);
    n
}

fn upload_loop(handle: &dyn UsbHandle, tx: &Sender<Vec<u8>>, stop: &AtomicBool) {
    let mut buf = [0u8; consts::PACKET_LENGTH];
    while !stop.load(Ordering::SeqCst) {
        match handle.bulk_read(Pipe::DataUp, &mut buf, Some(poll_window())) {
            Ok(0) | Err(Error::Timeout) => continue,
            Ok(n) => {
                trace!("Upload worker queued {} bytes", n);
                let mut packet = buf[..n].to_vec();
                loop {
                    match tx.send_timeout(packet, poll_window()) {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(p)) => {
                            if stop.load(Ordering::SeqCst) {
                                return;
                            }
                            packet = p;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => return,
                    }
                }
            }
            Err(e @ Error::DeviceUnavailable { .. }) => {
                warn!("Upload worker exiting: {}", e);
                return;
            }
            Err(e) => {
                warn!("Upload worker read failed: {}", e);
                thread::sleep(poll_window());
            }
        }
    }
}

/// Background writer of the download pipe.
pub(crate) struct DownloadPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    in_flight: Arc<AtomicUsize>,
}

impl DownloadPump {
    pub(crate) fn spawn(
        index: usize,
        handle: Arc<dyn UsbHandle>,
        config: Arc<Mutex<SessionConfig>>,
        workers: &Arc<AtomicUsize>,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<Vec<u8>>(pump::QUEUE_PACKETS);
        let stop = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let guard = WorkerGuard::new(workers);
        let (thread_stop, thread_rx, thread_in_flight) =
            (Arc::clone(&stop), rx.clone(), Arc::clone(&in_flight));
        let thread = thread::Builder::new()
            .name(format!("ch341-{}-download", index))
            .spawn(move || {
                let _guard = guard;
                download_loop(&*handle, &thread_rx, &thread_in_flight, &config, &thread_stop);
            })
            .map_err(|e| spawn_failed("download", e))?;
        Ok(DownloadPump {
            stop,
            thread: Some(thread),
            tx,
            rx,
            in_flight,
        })
    }

    /// Queues `data` as packets. Returns the bytes queued, which is short of
    /// `data.len()` only when the FIFO stayed full for `timeout`.
    pub(crate) fn enqueue(&self, data: &[u8], timeout: Option<Duration>) -> usize {
        let mut queued = 0;
        for chunk in data.chunks(consts::PACKET_LENGTH) {
            let sent = match timeout {
                Some(t) => self.tx.send_timeout(chunk.to_vec(), t).is_ok(),
                None => self.tx.send(chunk.to_vec()).is_ok(),
            };
            if !sent {
                warn!("Download FIFO full: queued {} of {} bytes", queued, data.len());
                break;
            }
            queued += chunk.len();
        }
        queued
    }

    /// Packets not yet physically sent.
    pub(crate) fn backlog(&self) -> usize {
        self.tx.len() + self.in_flight.load(Ordering::SeqCst)
    }

    /// Stops and joins the worker. Returns the number of discarded packets.
    pub(crate) fn stop(mut self) -> usize {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Download worker panicked");
            }
        }
        let discarded = self.rx.try_iter().count();
        if discarded > 0 {
            warn!("Discarding {} unsent download packet(s)", discarded);
        }
        discarded
    }
}

fn download_loop(
    handle: &dyn UsbHandle,
    rx: &Receiver<Vec<u8>>,
    in_flight: &AtomicUsize,
    config: &Mutex<SessionConfig>,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::SeqCst) {
        let packet = match rx.recv_timeout(poll_window()) {
            Ok(p) => p,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        in_flight.store(1, Ordering::SeqCst);
        // Picks up timeouts changed while the worker runs
        let write_timeout = config.lock().write_timeout;
        match handle.bulk_write(Pipe::DataDown, &packet, write_timeout) {
            Ok(n) if n == packet.len() => trace!("Download worker sent {} bytes", n),
            Ok(n) => warn!("Download worker sent {} of {} bytes", n, packet.len()),
            Err(e @ Error::DeviceUnavailable { .. }) => {
                in_flight.store(0, Ordering::SeqCst);
                warn!("Download worker exiting: {}", e);
                return;
            }
            Err(e) => warn!("Download worker write failed: {}", e),
        }
        in_flight.store(0, Ordering::SeqCst);
    }
}

impl Ch341 {
    // --- Buffered Transfers ---

    /// Enables or disables buffered upload. Enabling starts from an empty
    /// FIFO; disabling joins the worker and discards unread packets.
    pub fn set_buffered_upload(&self, enable: bool) -> Result<()> {
        let mut slot = self.upload.lock();
        if let Some(old) = slot.take() {
            old.stop();
            debug!("Session {}: buffered upload off", self.index);
        }
        if enable {
            *slot = Some(UploadPump::spawn(self.index, self.handle()?, &self.workers)?);
            debug!("Session {}: buffered upload on", self.index);
        }
        Ok(())
    }

    /// Enables or disables buffered download. Disabling joins the worker;
    /// packets not yet sent are discarded.
    pub fn set_buffered_download(&self, enable: bool) -> Result<()> {
        let mut slot = self.download.lock();
        if let Some(old) = slot.take() {
            old.stop();
            debug!("Session {}: buffered download off", self.index);
        }
        if enable {
            let handle = self.handle()?;
            *slot = Some(DownloadPump::spawn(
                self.index,
                handle,
                Arc::clone(&self.config),
                &self.workers,
            )?);
            debug!("Session {}: buffered download on", self.index);
        }
        Ok(())
    }

    pub fn is_buffered_upload(&self) -> bool {
        self.upload.lock().is_some()
    }

    pub fn is_buffered_download(&self) -> bool {
        self.download.lock().is_some()
    }

    /// Packets waiting in the upload FIFO (0 when unbuffered).
    pub fn upload_backlog(&self) -> usize {
        self.upload.lock().as_ref().map_or(0, UploadPump::backlog)
    }

    /// Packets not yet sent from the download FIFO (0 when unbuffered).
    pub fn download_backlog(&self) -> usize {
        self.download.lock().as_ref().map_or(0, DownloadPump::backlog)
    }

    /// Stops every background worker of this session.
    pub(crate) fn stop_workers(&self) {
        if let Some(pump) = self.upload.lock().take() {
            pump.stop();
        }
        if let Some(pump) = self.download.lock().take() {
            pump.stop();
        }
        self.disable_interrupt_events();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_keeps_carry_over() {
        let mut buf = [0u8; 3];
        let mut carry = Vec::new();
        assert_eq!(place(&[1, 2, 3, 4, 5], &mut buf, &mut carry), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(carry, vec![4, 5]);
        let mut next = [0u8; 1];
        assert_eq!(take_carry(&mut carry, &mut next), 1);
        assert_eq!(next, [4]);
        assert_eq!(carry, vec![5]);
    }

    #[test]
    fn test_stopped_reader_reports_its_session() {
        let (tx, rx) = bounded(4);
        let reader = UploadReader {
            index: 7,
            rx,
            carry: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(AtomicBool::new(false)),
        };
        tx.send(vec![1, 2, 3]).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(reader.read_timeout(&mut buf, None).unwrap(), 2);
        assert_eq!(reader.read_timeout(&mut buf, None).unwrap(), 1);
        assert!(matches!(
            reader.read_timeout(&mut buf, Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));

        reader.stop.store(true, Ordering::SeqCst);
        assert!(matches!(
            reader.read_timeout(&mut buf, None),
            Err(Error::DeviceUnavailable { index: 7, .. })
        ));
    }

    #[test]
    fn test_worker_guard_counts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = WorkerGuard::new(&counter);
        let b = WorkerGuard::new(&counter);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        drop(a);
        drop(b);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
