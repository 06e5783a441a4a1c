//! Library context
//!
//! A [`Context`] owns everything with process-wide lifetime: the selected
//! backend, the device registry, the open-handle table and the event-loop
//! state (in-flight transfers and watched file descriptors). Creating a
//! context initializes the backend; dropping the last clone tears it down.
//! All operations hang off the context or off values created through it.
//!
//! Locking discipline: the registry lock, handle-table lock, per-device and
//! per-handle locks are only ever taken one at a time or in that order. The
//! event-loop lock is taken before any per-transfer lock and released before
//! user callbacks or backend calls run.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use byteorder::{ByteOrder, NativeEndian};
use tracing::{debug, error, warn};

use crate::backend::UsbBackend;
use crate::clock::Deadline;
use crate::descriptors::{DEVICE_DESC_LENGTH, USB_MAXCONFIG};
use crate::device::{Device, DeviceShared, DiscoveredDevices};
use crate::eventloop::{IoState, PollfdNotifiers};
use crate::handle::{DeviceHandle, HandleTable};
use crate::transfer::{
    normalize_control_setup, EngineFlags, Transfer, TransferFlags, TransferKind, TransferStatus,
    CONTROL_SETUP_SIZE,
};
use crate::{Error, Result};

pub(crate) struct ContextInner {
    backend: Arc<dyn UsbBackend>,
    /// Registry of known devices, keyed by session ID. Membership only;
    /// lifetime is governed by the device reference counts.
    devices: Mutex<Vec<Arc<DeviceShared>>>,
    open_handles: HandleTable,
    pub(crate) io: Mutex<IoState>,
    pub(crate) notifiers: Mutex<PollfdNotifiers>,
    /// Concurrent-driver guard for the event loop.
    pub(crate) polling: AtomicBool,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let leftover = {
            let mut handles = self.open_handles.lock().unwrap();
            handles.retain(|h| h.strong_count() > 0);
            handles.len()
        };
        if leftover > 0 {
            warn!("{} device handles still open at teardown", leftover);
        }
        self.backend.exit();
    }
}

/// Handle to the library's process-wide state. Cheap to clone; the backend
/// is torn down when the last clone (and every value created through it) is
/// gone.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    /// Initialize the library over the given backend.
    pub fn new(backend: Arc<dyn UsbBackend>) -> Result<Context> {
        let ctx = Context {
            inner: Arc::new(ContextInner {
                backend,
                devices: Mutex::new(Vec::new()),
                open_handles: Mutex::new(Vec::new()),
                io: Mutex::new(IoState::new()),
                notifiers: Mutex::new(PollfdNotifiers::default()),
                polling: AtomicBool::new(false),
            }),
        };
        ctx.inner.backend.init(&ctx)?;
        Ok(ctx)
    }

    pub(crate) fn backend(&self) -> &dyn UsbBackend {
        self.inner.backend.as_ref()
    }

    // ---- device registry -------------------------------------------------

    /// Create a device under a backend-assigned session ID and publish it in
    /// the registry. The returned device carries one reference. Backends
    /// call this during enumeration for attachments they have not seen
    /// before.
    pub fn alloc_device(&self, session_id: u64, bus_number: u8, device_address: u8) -> Device {
        let shared = Arc::new(DeviceShared::new(
            session_id,
            bus_number,
            device_address,
            self.backend().device_priv_size(),
        ));
        self.inner.devices.lock().unwrap().push(shared.clone());
        Device::from_new(self.clone(), shared)
    }

    /// Look up a known device by session ID. The returned device carries a
    /// fresh reference of its own.
    pub fn get_device_by_session_id(&self, session_id: u64) -> Option<Device> {
        let devices = self.inner.devices.lock().unwrap();
        devices
            .iter()
            .find(|d| d.session_id() == session_id)
            .map(|d| Device::from_registry(self.clone(), d.clone()))
    }

    /// Final sanity checks on a newly discovered device: read the device
    /// descriptor and record its configuration count. Devices reporting
    /// zero configurations, or more than the USB specification allows,
    /// fail and must not be appended to the discovered set.
    pub fn sanitize_device(&self, device: &Device) -> Result<()> {
        let (raw, _host_endian) = self.backend().get_device_descriptor(device)?;

        let num_configurations = raw[DEVICE_DESC_LENGTH - 1];
        if num_configurations > USB_MAXCONFIG {
            error!("too many configurations");
            return Err(Error::Io);
        } else if num_configurations < 1 {
            debug!("no configurations?");
            return Err(Error::Io);
        }

        device.set_num_configurations(num_configurations);
        Ok(())
    }

    pub(crate) fn registry_remove(&self, shared: &Arc<DeviceShared>) {
        let mut devices = self.inner.devices.lock().unwrap();
        devices.retain(|d| !Arc::ptr_eq(d, shared));
    }

    // ---- enumeration -----------------------------------------------------

    /// Enumerate the devices currently attached to the system.
    ///
    /// Every entry carries one device reference. Release them by dropping
    /// the vector or through [`Context::free_device_list`]; keep a device
    /// past the list by cloning it first.
    pub fn get_device_list(&self) -> Result<Vec<Device>> {
        let mut discovered = DiscoveredDevices::new();
        self.backend().get_device_list(self, &mut discovered)?;

        debug!("enumerated {} devices", discovered.len());
        let list: Vec<Device> = discovered.iter().cloned().collect();
        // the discovered set drops here, releasing its enumeration refs
        Ok(list)
    }

    /// Release a device list produced by [`Context::get_device_list`].
    ///
    /// With `unref_devices` set, one reference per entry is released. When
    /// unset the references are intentionally leaked, mirroring callers
    /// that keep raw device references alive beyond the list.
    pub fn free_device_list(&self, list: Vec<Device>, unref_devices: bool) {
        if unref_devices {
            drop(list);
        } else {
            for device in list {
                std::mem::forget(device);
            }
        }
    }

    // ---- opening ---------------------------------------------------------

    /// Open a device for I/O. Non-blocking; no requests go over the bus.
    pub fn open(&self, device: &Device) -> Result<Arc<DeviceHandle>> {
        DeviceHandle::open(device)
    }

    /// Find the first device matching `vendor_id`/`product_id` and open it.
    ///
    /// Intended for test tools; if several devices share the IDs only the
    /// first is considered. Returns [`Error::NotFound`] when no device
    /// matches.
    pub fn open_device_with_vid_pid(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Arc<DeviceHandle>> {
        let list = self.get_device_list()?;
        for device in &list {
            let desc = device.device_descriptor()?;
            if desc.vendor_id == vendor_id && desc.product_id == product_id {
                return self.open(device);
            }
        }
        Err(Error::NotFound)
    }

    pub(crate) fn register_handle(&self, handle: &Arc<DeviceHandle>) {
        self.inner
            .open_handles
            .lock()
            .unwrap()
            .push(Arc::downgrade(handle));
    }

    /// Prune table entries whose handle is being dropped.
    pub(crate) fn unregister_closed_handles(&self) {
        self.inner
            .open_handles
            .lock()
            .unwrap()
            .retain(|h: &Weak<DeviceHandle>| h.strong_count() > 0);
    }

    // ---- transfers -------------------------------------------------------

    /// Allocate a transfer with a zeroed backend-private block.
    pub fn alloc_transfer(&self) -> Transfer {
        Transfer::alloc(self.backend().transfer_priv_size())
    }

    /// Submit a configured transfer to the backend and link it into the
    /// in-flight set.
    ///
    /// For control transfers the three 16-bit setup fields are converted
    /// from host order to little-endian wire order in place. This happens on
    /// every submit, so re-submitting a control transfer requires rewriting
    /// its setup header first.
    pub fn submit_transfer(&self, transfer: &Transfer) -> Result<()> {
        {
            let mut state = transfer.state();
            state.transferred = 0;
            state.deadline = Deadline::from_timeout_ms(state.timeout_ms, Instant::now());

            if state.kind == TransferKind::Control {
                if state.buffer.len() < CONTROL_SETUP_SIZE {
                    return Err(Error::InvalidParam);
                }
                debug!(
                    "RQT={:02x} RQ={:02x} VAL={:04x} IDX={:04x} length={}",
                    state.buffer[0],
                    state.buffer[1],
                    NativeEndian::read_u16(&state.buffer[2..4]),
                    NativeEndian::read_u16(&state.buffer[4..6]),
                    NativeEndian::read_u16(&state.buffer[6..8]),
                );
                normalize_control_setup(&mut state.buffer)?;
            }
        }

        self.backend().submit_transfer(self, transfer)?;
        self.inner.io.lock().unwrap().flying.insert(transfer);
        Ok(())
    }

    /// Ask the backend to cancel an in-flight transfer and return without
    /// waiting. The transfer still completes exactly once through its
    /// callback; the status reflects how the cancel raced with completion.
    pub fn cancel_transfer(&self, transfer: &Transfer) -> Result<()> {
        let r = self.backend().cancel_transfer(self, transfer);
        if let Err(e) = &r {
            error!("cancel transfer failed: {}", e);
        }
        r
    }

    /// Cancel a transfer and drive the event loop until the cancellation
    /// has propagated. The transfer's user callback is suppressed.
    pub fn cancel_transfer_sync(&self, transfer: &Transfer) -> Result<()> {
        self.cancel_transfer(transfer)?;

        transfer.state().engine_flags |= EngineFlags::SYNC_CANCELLED;
        while transfer
            .state()
            .engine_flags
            .contains(EngineFlags::SYNC_CANCELLED)
        {
            self.poll()?;
        }
        Ok(())
    }

    // ---- backend completion helpers --------------------------------------

    /// Report a terminal outcome for a submitted transfer. Called by the
    /// backend; delinks the transfer, publishes status and actual length,
    /// and fires the user callback.
    ///
    /// [`TransferStatus::Silent`] delinks without delivering anything.
    pub fn handle_transfer_completion(&self, transfer: &Transfer, status: TransferStatus) {
        self.inner.io.lock().unwrap().flying.remove(transfer);

        if status == TransferStatus::Silent {
            return;
        }

        let callback = {
            let mut state = transfer.state();
            let mut status = status;

            if status == TransferStatus::Completed
                && state.flags.contains(TransferFlags::SHORT_NOT_OK)
            {
                let mut requested = state.buffer.len();
                if state.kind == TransferKind::Control {
                    requested = requested.saturating_sub(CONTROL_SETUP_SIZE);
                }
                if requested != state.transferred {
                    debug!("interpreting short transfer as error");
                    status = TransferStatus::Error;
                }
            }

            state.status = status;
            state.actual_length = state.transferred;
            state.callback.take()
        };

        if let Some(mut cb) = callback {
            cb(transfer);
            let mut state = transfer.state();
            if state.flags.contains(TransferFlags::FREE_TRANSFER) {
                // release engine-side resources; the callback stays dropped
                if state.flags.contains(TransferFlags::FREE_BUFFER) {
                    state.buffer = Vec::new();
                }
            } else {
                state.callback = Some(cb);
            }
        } else if transfer.state().flags.contains(TransferFlags::FREE_TRANSFER) {
            let mut state = transfer.state();
            if state.flags.contains(TransferFlags::FREE_BUFFER) {
                state.buffer = Vec::new();
            }
        }
    }

    /// Report that a previously requested cancellation has completed.
    /// Called by the backend. The delivered status depends on why the
    /// transfer was cancelled: a synchronous cancel completes silently, a
    /// timeout-latched transfer reports [`TransferStatus::TimedOut`], and
    /// everything else reports [`TransferStatus::Cancelled`].
    pub fn handle_transfer_cancellation(&self, transfer: &Transfer) {
        {
            let mut state = transfer.state();
            if state.engine_flags.contains(EngineFlags::SYNC_CANCELLED) {
                state.engine_flags -= EngineFlags::SYNC_CANCELLED;
                drop(state);
                debug!("detected sync cancel");
                self.handle_transfer_completion(transfer, TransferStatus::Silent);
                return;
            }

            if state.engine_flags.contains(EngineFlags::TIMED_OUT) {
                drop(state);
                debug!("detected timeout cancellation");
                self.handle_transfer_completion(transfer, TransferStatus::TimedOut);
                return;
            }
        }

        self.handle_transfer_completion(transfer, TransferStatus::Cancelled);
    }
}
