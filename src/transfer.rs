//! USB transfer objects
//!
//! A [`Transfer`] describes one USB transfer: target handle, endpoint, type,
//! data buffer, timeout and completion callback. The same object carries the
//! engine's private bookkeeping (absolute deadline, in-flight linkage, flags)
//! and the backend's private block. Transfers are cheap cloneable references;
//! the engine keeps one while the transfer is in flight, the user keeps
//! another to observe the outcome or cancel.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian, NativeEndian};

use crate::clock::Deadline;
use crate::handle::DeviceHandle;
use crate::{Error, Result};

/// Size of the control setup header that prefixes control transfer buffers.
pub const CONTROL_SETUP_SIZE: usize = 8;

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferKind {
    #[default]
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Terminal outcome of a transfer, published before the callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// Transfer completed without error. The whole requested amount may not
    /// have been transferred; check the actual length.
    #[default]
    Completed,
    /// Transfer failed
    Error,
    /// Transfer timed out
    TimedOut,
    /// Transfer was cancelled
    Cancelled,
    /// The endpoint stalled
    Stall,
    /// Device was disconnected
    NoDevice,
    /// Device sent more data than requested
    Overflow,
    /// Internal sentinel: terminal outcome that is never delivered to a user
    /// callback. Used to complete a synchronously cancelled transfer.
    Silent,
}

bitflags! {
    /// User-settable transfer flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransferFlags: u8 {
        /// Report a transfer that moves less data than requested as an error.
        const SHORT_NOT_OK = 1 << 0;
        /// Release the data buffer when the transfer is released.
        const FREE_BUFFER = 1 << 1;
        /// Release the transfer's callback and buffered resources after the
        /// completion callback has run.
        const FREE_TRANSFER = 1 << 2;
    }
}

bitflags! {
    /// Engine-private transfer flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct EngineFlags: u8 {
        /// The timeout sweep latched this transfer and issued a cancel.
        const TIMED_OUT = 1 << 0;
        /// A synchronous cancel is waiting for this transfer's terminal event.
        const SYNC_CANCELLED = 1 << 1;
    }
}

/// Per-packet descriptor for isochronous transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacket {
    /// Requested length of this packet
    pub length: u32,
    /// Amount actually transferred, filled in by the backend
    pub actual_length: u32,
    /// Per-packet outcome, filled in by the backend
    pub status: TransferStatus,
}

/// The 8-byte setup header of a control transfer.
///
/// Fields are filled in host byte order; the engine converts the three
/// 16-bit fields to little-endian wire order at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlSetup {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl ControlSetup {
    /// Serialize into the first [`CONTROL_SETUP_SIZE`] bytes of `buf`, with
    /// the 16-bit fields in host byte order.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.request_type;
        buf[1] = self.request;
        NativeEndian::write_u16(&mut buf[2..4], self.value);
        NativeEndian::write_u16(&mut buf[4..6], self.index);
        NativeEndian::write_u16(&mut buf[6..8], self.length);
    }
}

/// Convert the setup header's 16-bit fields from host order to the
/// little-endian wire order, in place. Runs once per submit; re-submitting
/// the same transfer requires the caller to rewrite the setup first.
pub(crate) fn normalize_control_setup(buf: &mut [u8]) -> Result<()> {
    if buf.len() < CONTROL_SETUP_SIZE {
        return Err(Error::InvalidParam);
    }
    for off in [2usize, 4, 6] {
        let host = NativeEndian::read_u16(&buf[off..off + 2]);
        LittleEndian::write_u16(&mut buf[off..off + 2], host);
    }
    Ok(())
}

/// Completion callback, invoked inline by the event-loop thread.
pub type TransferCallback = Box<dyn FnMut(&Transfer) + Send>;

pub(crate) struct TransferState {
    // user-visible part
    pub(crate) handle: Weak<DeviceHandle>,
    pub(crate) endpoint: u8,
    pub(crate) kind: TransferKind,
    pub(crate) flags: TransferFlags,
    pub(crate) buffer: Vec<u8>,
    pub(crate) timeout_ms: u32,
    pub(crate) iso_packets: Vec<IsoPacket>,
    pub(crate) callback: Option<TransferCallback>,
    pub(crate) status: TransferStatus,
    pub(crate) actual_length: usize,
    // engine part
    pub(crate) deadline: Deadline,
    pub(crate) engine_flags: EngineFlags,
    pub(crate) transferred: usize,
    pub(crate) sched_key: Option<crate::scheduler::SchedKey>,
}

impl TransferState {
    fn empty() -> TransferState {
        TransferState {
            handle: Weak::new(),
            endpoint: 0,
            kind: TransferKind::default(),
            flags: TransferFlags::empty(),
            buffer: Vec::new(),
            timeout_ms: 0,
            iso_packets: Vec::new(),
            callback: None,
            status: TransferStatus::default(),
            actual_length: 0,
            deadline: Deadline::Never,
            engine_flags: EngineFlags::empty(),
            transferred: 0,
            sched_key: None,
        }
    }
}

pub(crate) struct TransferInner {
    pub(crate) state: Mutex<TransferState>,
    /// Backend-private block, sized by the backend's declared transfer size.
    os_priv: Mutex<Vec<u8>>,
}

/// A reference to one USB transfer. See the module docs.
#[derive(Clone)]
pub struct Transfer {
    pub(crate) inner: Arc<TransferInner>,
}

impl Transfer {
    pub(crate) fn alloc(priv_size: usize) -> Transfer {
        Transfer {
            inner: Arc::new(TransferInner {
                state: Mutex::new(TransferState::empty()),
                os_priv: Mutex::new(vec![0; priv_size]),
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, TransferState> {
        self.inner.state.lock().unwrap()
    }

    /// Return the transfer to its freshly-allocated state, dropping the
    /// buffer, callback and any engine bookkeeping. The backend-private
    /// block is re-zeroed but keeps its size.
    pub fn reset(&self) {
        *self.state() = TransferState::empty();
        self.inner.os_priv.lock().unwrap().fill(0);
    }

    /// Configure as a bulk transfer on `endpoint`. The buffer supplies OUT
    /// data or receives IN data depending on the endpoint direction bit.
    pub fn set_bulk(
        &self,
        handle: &Arc<DeviceHandle>,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout_ms: u32,
        callback: impl FnMut(&Transfer) + Send + 'static,
    ) {
        let mut state = self.state();
        state.handle = Arc::downgrade(handle);
        state.endpoint = endpoint;
        state.kind = TransferKind::Bulk;
        state.buffer = buffer;
        state.timeout_ms = timeout_ms;
        state.callback = Some(Box::new(callback));
    }

    /// Configure as an interrupt transfer on `endpoint`.
    pub fn set_interrupt(
        &self,
        handle: &Arc<DeviceHandle>,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout_ms: u32,
        callback: impl FnMut(&Transfer) + Send + 'static,
    ) {
        self.set_bulk(handle, endpoint, buffer, timeout_ms, callback);
        self.state().kind = TransferKind::Interrupt;
    }

    /// Configure as a control transfer. The buffer is laid out as the 8-byte
    /// setup header followed by `data` (OUT payload, or space for IN data
    /// sized by `setup.length`).
    pub fn set_control(
        &self,
        handle: &Arc<DeviceHandle>,
        setup: ControlSetup,
        data: &[u8],
        timeout_ms: u32,
        callback: impl FnMut(&Transfer) + Send + 'static,
    ) {
        let mut buffer = vec![0u8; CONTROL_SETUP_SIZE + data.len().max(setup.length as usize)];
        setup.write_to(&mut buffer);
        buffer[CONTROL_SETUP_SIZE..CONTROL_SETUP_SIZE + data.len()].copy_from_slice(data);

        let mut state = self.state();
        state.handle = Arc::downgrade(handle);
        state.endpoint = 0;
        state.kind = TransferKind::Control;
        state.buffer = buffer;
        state.timeout_ms = timeout_ms;
        state.callback = Some(Box::new(callback));
    }

    /// Configure as an isochronous transfer with the given per-packet
    /// layout. The buffer holds the packets back to back.
    pub fn set_isochronous(
        &self,
        handle: &Arc<DeviceHandle>,
        endpoint: u8,
        buffer: Vec<u8>,
        packets: Vec<IsoPacket>,
        timeout_ms: u32,
        callback: impl FnMut(&Transfer) + Send + 'static,
    ) {
        let mut state = self.state();
        state.handle = Arc::downgrade(handle);
        state.endpoint = endpoint;
        state.kind = TransferKind::Isochronous;
        state.buffer = buffer;
        state.iso_packets = packets;
        state.timeout_ms = timeout_ms;
        state.callback = Some(Box::new(callback));
    }

    /// Replace the transfer flags.
    pub fn set_flags(&self, flags: TransferFlags) {
        self.state().flags = flags;
    }

    pub fn flags(&self) -> TransferFlags {
        self.state().flags
    }

    pub fn endpoint(&self) -> u8 {
        self.state().endpoint
    }

    pub fn kind(&self) -> TransferKind {
        self.state().kind
    }

    pub fn timeout_ms(&self) -> u32 {
        self.state().timeout_ms
    }

    /// Last published terminal status.
    pub fn status(&self) -> TransferStatus {
        self.state().status
    }

    /// Number of bytes moved by the last completion. For control transfers
    /// this excludes the setup header.
    pub fn actual_length(&self) -> usize {
        self.state().actual_length
    }

    /// Snapshot of the data buffer.
    pub fn buffer(&self) -> Vec<u8> {
        self.state().buffer.clone()
    }

    /// Length of the data buffer.
    pub fn buffer_len(&self) -> usize {
        self.state().buffer.len()
    }

    /// Snapshot of the isochronous packet descriptors.
    pub fn iso_packets(&self) -> Vec<IsoPacket> {
        self.state().iso_packets.clone()
    }

    /// The device handle this transfer targets, if it is still open.
    pub fn handle(&self) -> Option<Arc<DeviceHandle>> {
        self.state().handle.upgrade()
    }

    /// Run `f` over the mutable data buffer. Backends use this to deposit IN
    /// data.
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.state().buffer)
    }

    /// Run `f` over the mutable isochronous packet array. Backends use this
    /// to publish per-packet results.
    pub fn with_iso_packets_mut<R>(&self, f: impl FnOnce(&mut [IsoPacket]) -> R) -> R {
        f(&mut self.state().iso_packets)
    }

    /// Record the number of bytes the backend moved for this transfer.
    pub fn set_transferred(&self, bytes: usize) {
        self.state().transferred = bytes;
    }

    /// Backend-private block attached to this transfer.
    pub fn os_priv(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.os_priv.lock().unwrap()
    }

    /// Whether two `Transfer` values reference the same transfer.
    pub fn same_transfer(&self, other: &Transfer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Transfer")
            .field("endpoint", &state.endpoint)
            .field("kind", &state.kind)
            .field("flags", &state.flags)
            .field("timeout_ms", &state.timeout_ms)
            .field("status", &state.status)
            .field("actual_length", &state.actual_length)
            .finish()
    }
}
