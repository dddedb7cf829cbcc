//! Interrupt pipe events for CH341 devices.
//!
//! The interrupt pipe reports the 24-bit pin status word whenever the INT#
//! input fires. With events enabled a watcher thread polls the pipe and
//! pushes [`InterruptEvent`]s into a bounded channel. When the application
//! falls behind, the oldest event is dropped so the latest observed state
//! always gets through.

use crate::consts::pump;
use crate::device::Ch341;
use crate::error::{spawn_failed, Error, Result};
use crate::flags::PinState;
use crate::transport::UsbHandle;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One interrupt pipe report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptEvent {
    /// Arrival order, starting at 1. Gaps mean events were dropped.
    pub seq: u64,
    pub status: PinState,
}

/// Callback invoked with the status word of each interrupt.
pub type InterruptRoutine = Box<dyn FnMut(PinState) + Send + 'static>;

fn poll_window() -> Duration {
    Duration::from_millis(pump::POLL_MS)
}

pub(crate) struct InterruptWatcher {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl InterruptWatcher {
    fn spawn(
        index: usize,
        handle: Arc<dyn UsbHandle>,
        workers: &Arc<AtomicUsize>,
    ) -> Result<(Self, Receiver<InterruptEvent>)> {
        let (tx, rx) = bounded::<InterruptEvent>(pump::INTERRUPT_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));
        let guard = crate::buffered::WorkerGuard::new(workers);
        let (thread_stop, overflow) = (Arc::clone(&stop), rx.clone());
        let thread = thread::Builder::new()
            .name(format!("ch341-{}-interrupt", index))
            .spawn(move || {
                let _guard = guard;
                poll_loop(&*handle, &tx, &overflow, &thread_stop);
            })
            .map_err(|e| spawn_failed("interrupt", e))?;
        Ok((
            InterruptWatcher {
                stop,
                threads: vec![thread],
            },
            rx,
        ))
    }

    // Runs `routine` for every event until the watcher stops.
    fn attach_routine(
        &mut self,
        index: usize,
        rx: Receiver<InterruptEvent>,
        mut routine: InterruptRoutine,
        workers: &Arc<AtomicUsize>,
    ) -> Result<()> {
        let guard = crate::buffered::WorkerGuard::new(workers);
        let stop = Arc::clone(&self.stop);
        let thread = thread::Builder::new()
            .name(format!("ch341-{}-interrupt-routine", index))
            .spawn(move || {
                let _guard = guard;
                while !stop.load(Ordering::SeqCst) {
                    match rx.recv_timeout(poll_window()) {
                        Ok(event) => routine(event.status),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .map_err(|e| spawn_failed("interrupt routine", e))?;
        self.threads.push(thread);
        Ok(())
    }

    /// Stops and joins the watcher threads.
    pub(crate) fn stop(self) {
        drop(self);
    }
}

impl Drop for InterruptWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let current = thread::current().id();
        for thread in self.threads.drain(..) {
            // A routine that disables events runs on this very thread; it
            // exits on its own once the stop flag is seen.
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                warn!("Interrupt thread panicked");
            }
        }
    }
}

fn push_latest(tx: &Sender<InterruptEvent>, overflow: &Receiver<InterruptEvent>, mut event: InterruptEvent) {
    loop {
        match tx.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Full(e)) => {
                if let Ok(dropped) = overflow.try_recv() {
                    warn!("Interrupt queue full, dropped event {}", dropped.seq);
                }
                event = e;
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

fn poll_loop(
    handle: &dyn UsbHandle,
    tx: &Sender<InterruptEvent>,
    overflow: &Receiver<InterruptEvent>,
    stop: &AtomicBool,
) {
    let mut seq = 0u64;
    while !stop.load(Ordering::SeqCst) {
        match handle.poll_interrupt(Some(poll_window())) {
            Ok(Some(word)) => {
                seq += 1;
                let status = PinState::from_bits_retain(word);
                trace!("Interrupt {}: status 0x{:06X}", seq, word);
                push_latest(tx, overflow, InterruptEvent { seq, status });
            }
            Ok(None) | Err(Error::Timeout) => continue,
            Err(e @ Error::DeviceUnavailable { .. }) => {
                warn!("Interrupt watcher exiting: {}", e);
                return;
            }
            Err(e) => {
                warn!("Interrupt poll failed: {}", e);
                thread::sleep(poll_window());
            }
        }
    }
}

impl Ch341 {
    // --- Interrupt Events ---

    /// Starts delivering interrupt events and returns their channel.
    /// Replaces any earlier subscription, whose channel then disconnects.
    pub fn enable_interrupt_events(&self) -> Result<Receiver<InterruptEvent>> {
        self.disable_interrupt_events();
        let (watcher, rx) = InterruptWatcher::spawn(self.index, self.handle()?, &self.workers)?;
        *self.interrupts.lock() = Some(watcher);
        debug!("Session {}: interrupt events on", self.index);
        Ok(rx)
    }

    /// Stops interrupt delivery. A no-op when nothing is subscribed.
    pub fn disable_interrupt_events(&self) {
        // Joined outside the lock; a running routine may query the session
        let old = self.interrupts.lock().take();
        if let Some(watcher) = old {
            watcher.stop();
            debug!("Session {}: interrupt events off", self.index);
        }
    }

    /// Runs `routine` on a dedicated thread for every interrupt. `None`
    /// cancels the subscription.
    pub fn set_interrupt_routine(&self, routine: Option<InterruptRoutine>) -> Result<()> {
        let Some(routine) = routine else {
            self.disable_interrupt_events();
            return Ok(());
        };
        self.disable_interrupt_events();
        let (mut watcher, rx) = InterruptWatcher::spawn(self.index, self.handle()?, &self.workers)?;
        watcher.attach_routine(self.index, rx, routine, &self.workers)?;
        *self.interrupts.lock() = Some(watcher);
        debug!("Session {}: interrupt routine installed", self.index);
        Ok(())
    }

    pub fn interrupt_events_enabled(&self) -> bool {
        self.interrupts.lock().is_some()
    }

    /// Waits for one interrupt report, bounded by the read timeout.
    pub fn read_interrupt(&self) -> Result<PinState> {
        if self.interrupt_events_enabled() {
            return Err(Error::UnsupportedMode(
                "interrupt events are enabled; read them from the event channel".to_string(),
            ));
        }
        let handle = self.handle()?;
        let timeout = self.read_timeout();
        loop {
            match handle.poll_interrupt(timeout)? {
                Some(word) => {
                    trace!("Interrupt status 0x{:06X}", word);
                    return Ok(PinState::from_bits_retain(word));
                }
                None if timeout.is_some() => return Err(Error::Timeout),
                None => continue,
            }
        }
    }
}
