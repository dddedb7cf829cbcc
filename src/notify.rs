//! Device arrival and removal notifications.
//!
//! The transport has no hot-plug callback of its own, so the watcher diffs
//! enumeration snapshots every
//! [`WATCH_PERIOD_MS`](crate::consts::pump::WATCH_PERIOD_MS). Devices present
//! when watching starts are not reported.

use crate::buffered::WorkerGuard;
use crate::consts::pump;
use crate::error::{spawn_failed, Result};
use crate::transport::{DeviceIdentity, UsbTransport};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    Arrived,
    /// The device is going away; stop using its session.
    RemovePending,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNotification {
    pub event: DeviceEvent,
    pub identity: DeviceIdentity,
}

impl DeviceNotification {
    /// Identity string of the device, as matched by the watch filter.
    pub fn id(&self) -> String {
        self.identity.id_string()
    }
}

/// Events turning the `before` snapshot into `after`. Removals come first,
/// each as `RemovePending` followed by `Removed`.
pub fn diff_snapshots(before: &[DeviceIdentity], after: &[DeviceIdentity]) -> Vec<DeviceNotification> {
    let mut events = Vec::new();
    for gone in before.iter().filter(|d| !after.contains(d)) {
        for event in [DeviceEvent::RemovePending, DeviceEvent::Removed] {
            events.push(DeviceNotification {
                event,
                identity: gone.clone(),
            });
        }
    }
    for new in after.iter().filter(|d| !before.contains(d)) {
        events.push(DeviceNotification {
            event: DeviceEvent::Arrived,
            identity: new.clone(),
        });
    }
    events
}

pub(crate) struct DeviceWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    pub(crate) fn spawn(
        transport: Arc<dyn UsbTransport>,
        filter: Option<String>,
        workers: &Arc<AtomicUsize>,
    ) -> Result<(Self, Receiver<DeviceNotification>)> {
        let initial = transport.list_devices(filter.as_deref())?;
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let guard = WorkerGuard::new(workers);
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("ch341-device-watch".to_string())
            .spawn(move || {
                let _guard = guard;
                watch_loop(&*transport, filter.as_deref(), initial, &tx, &thread_stop);
            })
            .map_err(|e| spawn_failed("device watch", e))?;
        Ok((
            DeviceWatcher {
                stop,
                thread: Some(thread),
            },
            rx,
        ))
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Device watcher panicked");
            }
        }
    }
}

fn watch_loop(
    transport: &dyn UsbTransport,
    filter: Option<&str>,
    mut snapshot: Vec<DeviceIdentity>,
    tx: &Sender<DeviceNotification>,
    stop: &AtomicBool,
) {
    // Sleep in poll windows so a stop request is seen quickly
    let period = Duration::from_millis(pump::WATCH_PERIOD_MS);
    let step = Duration::from_millis(pump::POLL_MS);
    'watch: while !stop.load(Ordering::SeqCst) {
        let mut waited = Duration::ZERO;
        while waited < period {
            if stop.load(Ordering::SeqCst) {
                break 'watch;
            }
            thread::sleep(step);
            waited += step;
        }
        let current = match transport.list_devices(filter) {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                continue;
            }
        };
        for notification in diff_snapshots(&snapshot, &current) {
            debug!("{:?}: {}", notification.event, notification.identity);
            if tx.send(notification).is_err() {
                trace!("Notification receiver dropped, watcher exiting");
                return;
            }
        }
        snapshot = current;
    }
}
