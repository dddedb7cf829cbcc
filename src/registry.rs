//! Device session registry.
//!
//! A [`DeviceRegistry`] maps logical indices `0..16` to open [`Ch341`]
//! sessions. Index `n` opens the `n`-th adapter the transport enumerates.
//! Each index has its own lock, so opening or closing one index never waits
//! on another. The registry is cheap to clone and every clone shares the
//! same table.

use crate::consts;
use crate::device::{Ch341, ChipVersion, Personality};
use crate::error::{session_closed, Error, Result};
use crate::notify::{DeviceNotification, DeviceWatcher};
use crate::transport::{DeviceIdentity, UsbTransport};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// Sessions holding one physical device.
#[derive(Debug, Default)]
struct Claim {
    indices: Vec<usize>,
    exclusive: bool,
}

struct Inner {
    transport: Arc<dyn UsbTransport>,
    slots: Vec<Mutex<Option<Arc<Ch341>>>>,
    claims: Mutex<HashMap<DeviceIdentity, Claim>>,
    watcher: Mutex<Option<DeviceWatcher>>,
    workers: Arc<AtomicUsize>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.watcher.lock().take();
        for slot in &self.slots {
            if let Some(session) = slot.lock().take() {
                session.shutdown();
            }
        }
    }
}

#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open: Vec<usize> = (0..consts::MAX_DEVICES)
            .filter(|&i| self.inner.slots[i].lock().is_some())
            .collect();
        f.debug_struct("DeviceRegistry")
            .field("open", &open)
            .field("workers", &self.active_workers())
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(transport: Arc<dyn UsbTransport>) -> Self {
        DeviceRegistry {
            inner: Arc::new(Inner {
                transport,
                slots: (0..consts::MAX_DEVICES).map(|_| Mutex::new(None)).collect(),
                claims: Mutex::new(HashMap::new()),
                watcher: Mutex::new(None),
                workers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    fn slot(&self, index: usize) -> Result<&Mutex<Option<Arc<Ch341>>>> {
        self.inner
            .slots
            .get(index)
            .ok_or_else(|| Error::DeviceUnavailable {
                index,
                message: format!("index must be below {}", consts::MAX_DEVICES),
            })
    }

    /// Adapters currently attached, in physical index order.
    pub fn list_devices(&self, filter: Option<&str>) -> Result<Vec<DeviceIdentity>> {
        self.inner.transport.list_devices(filter)
    }

    /// Opens the session at `index`.
    ///
    /// Opening an index that is already open returns the same session unless
    /// that session is exclusive.
    pub fn open(&self, index: usize) -> Result<Arc<Ch341>> {
        let mut slot = self.slot(index)?.lock();
        if let Some(session) = slot.as_ref() {
            if session.config().exclusive {
                return Err(Error::ExclusivityViolation { index });
            }
            debug!("Session {} already open, sharing it", index);
            return Ok(Arc::clone(session));
        }

        let devices = self.inner.transport.list_devices(None)?;
        let identity = devices
            .get(index)
            .cloned()
            .ok_or_else(|| Error::DeviceUnavailable {
                index,
                message: format!("only {} device(s) attached", devices.len()),
            })?;
        if self
            .inner
            .claims
            .lock()
            .get(&identity)
            .is_some_and(|c| c.exclusive)
        {
            return Err(Error::ExclusivityViolation { index });
        }

        let handle = self
            .inner
            .transport
            .open(&identity)
            .map_err(|e| match e {
                Error::DeviceUnavailable { message, .. } => Error::DeviceUnavailable { index, message },
                other => other,
            })?;
        let session = Arc::new(Ch341::open(
            index,
            identity.clone(),
            Arc::from(handle),
            Arc::clone(&self.inner.workers),
        )?);
        self.inner
            .claims
            .lock()
            .entry(identity.clone())
            .or_default()
            .indices
            .push(index);
        *slot = Some(Arc::clone(&session));
        info!("Opened session {} on {} ({:?})", index, identity, session.chip_version());
        Ok(session)
    }

    /// Closes the session at `index`, stopping its workers and releasing the
    /// transport handle. Closing a closed or unknown index does nothing.
    pub fn close(&self, index: usize) {
        let Some(slot) = self.inner.slots.get(index) else {
            return;
        };
        let Some(session) = slot.lock().take() else {
            return;
        };
        session.shutdown();
        let mut claims = self.inner.claims.lock();
        if let Some(claim) = claims.get_mut(session.identity()) {
            claim.indices.retain(|&i| i != index);
            if claim.indices.is_empty() {
                claims.remove(session.identity());
            } else if session.config().exclusive {
                claim.exclusive = false;
            }
        }
        info!("Closed session {}", index);
    }

    /// Closes every open session.
    pub fn close_all(&self) {
        for index in 0..consts::MAX_DEVICES {
            self.close(index);
        }
    }

    /// The open session at `index`.
    pub fn session(&self, index: usize) -> Result<Arc<Ch341>> {
        self.slot(index)?
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| session_closed(index))
    }

    pub fn is_open(&self, index: usize) -> bool {
        self.session(index).is_ok()
    }

    /// Marks the session exclusive. While set, further opens of its physical
    /// device fail with [`Error::ExclusivityViolation`].
    pub fn set_exclusive(&self, index: usize, exclusive: bool) -> Result<()> {
        let session = self.session(index)?;
        let mut claims = self.inner.claims.lock();
        let claim = claims.entry(session.identity().clone()).or_default();
        if exclusive && claim.indices.iter().any(|&i| i != index) {
            warn!(
                "Session {} made exclusive while {:?} share its device",
                index, claim.indices
            );
        }
        claim.exclusive = exclusive;
        session.set_exclusive_flag(exclusive);
        debug!("Session {} exclusive: {}", index, exclusive);
        Ok(())
    }

    /// Sets timeouts in milliseconds; `0xFFFF_FFFF` disables a timeout.
    pub fn set_timeouts(&self, index: usize, write_ms: u32, read_ms: u32) -> Result<()> {
        self.session(index)?.set_timeouts(write_ms, read_ms)
    }

    pub fn set_mode(&self, index: usize, personality: Personality) -> Result<()> {
        self.session(index)?.set_mode(personality)
    }

    pub fn chip_version(&self, index: usize) -> Result<ChipVersion> {
        Ok(self.session(index)?.chip_version())
    }

    /// Background workers alive across all sessions and the device watcher.
    pub fn active_workers(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }

    /// Starts reporting arrivals and removals of devices whose identity
    /// string contains `filter`. Replaces an earlier watch.
    pub fn watch_devices(&self, filter: Option<&str>) -> Result<Receiver<DeviceNotification>> {
        self.unwatch_devices();
        let (watcher, rx) = DeviceWatcher::spawn(
            Arc::clone(&self.inner.transport),
            filter.filter(|f| !f.is_empty()).map(str::to_string),
            &self.inner.workers,
        )?;
        *self.inner.watcher.lock() = Some(watcher);
        debug!("Watching devices (filter {:?})", filter);
        Ok(rx)
    }

    /// Stops device notifications. A no-op when not watching.
    pub fn unwatch_devices(&self) {
        let old = self.inner.watcher.lock().take();
        if old.is_some() {
            drop(old);
            debug!("Device watch stopped");
        }
    }
}
