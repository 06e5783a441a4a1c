//! Userspace USB device I/O
//!
//! This crate lets applications enumerate USB devices and perform I/O
//! against them over the operating system's raw USB transport, through a
//! backend selected at context creation. It provides:
//!
//! - a reference-counted device registry with session-ID deduplication, so
//!   stable device references survive re-enumeration
//! - open device handles with claimed-interface tracking and the usual
//!   interface/configuration/halt/reset management
//! - an asynchronous transfer engine: submitted transfers are ordered by
//!   deadline, multiplexed over the backend's file descriptors by a
//!   caller-driven event loop, and reported exactly once through a
//!   completion callback, whether they complete, get cancelled, or time out
//! - blocking one-shot helpers in [`sync`] layered over the engine
//!
//! ```no_run
//! use std::sync::Arc;
//! use usbio::backend::mock::{MockBackend, ScriptedDevice};
//! use usbio::Context;
//!
//! # fn main() -> usbio::Result<()> {
//! let backend = Arc::new(MockBackend::new(vec![ScriptedDevice::new(
//!     1, 1, 4, 0x1234, 0x5678,
//! )]));
//! let ctx = Context::new(backend)?;
//!
//! let devices = ctx.get_device_list()?;
//! let handle = ctx.open(&devices[0])?;
//! handle.claim_interface(0)?;
//! ctx.free_device_list(devices, true);
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod clock;
mod context;
mod descriptors;
mod device;
mod error;
mod eventloop;
mod handle;
pub mod logging;
mod scheduler;
pub mod sync;
mod transfer;

pub use backend::UsbBackend;
pub use context::Context;
pub use descriptors::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, Interface, InterfaceDescriptor,
    DEVICE_DESC_LENGTH, USB_MAXCONFIG,
};
pub use device::{Device, DiscoveredDevices};
pub use error::{Error, Result};
pub use eventloop::{PollEvents, Pollfd};
pub use handle::DeviceHandle;
pub use transfer::{
    ControlSetup, IsoPacket, Transfer, TransferCallback, TransferFlags, TransferKind,
    TransferStatus, CONTROL_SETUP_SIZE,
};
