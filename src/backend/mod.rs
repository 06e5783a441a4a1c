//! Backend contract
//!
//! The engine is portable over exactly one OS backend selected at context
//! creation. The backend owns the kernel transport: it discovers devices,
//! opens them, submits and cancels transfers, and reports transfer outcomes
//! back through the context's [`handle_transfer_completion`] and
//! [`handle_transfer_cancellation`] helpers. File descriptors the backend
//! needs watched are registered through [`add_pollfd`]/[`remove_pollfd`];
//! the event loop multiplexes them and hands readiness back to
//! [`UsbBackend::handle_events`].
//!
//! [`handle_transfer_completion`]: crate::Context::handle_transfer_completion
//! [`handle_transfer_cancellation`]: crate::Context::handle_transfer_cancellation
//! [`add_pollfd`]: crate::Context::add_pollfd
//! [`remove_pollfd`]: crate::Context::remove_pollfd

pub mod mock;

use std::os::fd::RawFd;

use crate::context::Context;
use crate::descriptors::{ConfigDescriptor, DEVICE_DESC_LENGTH};
use crate::device::{Device, DiscoveredDevices};
use crate::handle::DeviceHandle;
use crate::transfer::Transfer;
use crate::{Error, Result};

/// The capability set the engine requires from an OS backend.
///
/// All methods are invoked with shared access; backends keep their own state
/// behind interior mutability and may additionally use the private byte
/// blocks attached to every device, handle and transfer, sized by the
/// `*_priv_size` declarations.
pub trait UsbBackend: Send + Sync {
    /// One-time backend initialization, called while the context is being
    /// created. A backend that needs file descriptors watched from the start
    /// registers them here.
    fn init(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Final teardown, called when the context is dropped.
    fn exit(&self) {}

    /// Size of the private block attached to every device.
    fn device_priv_size(&self) -> usize {
        0
    }

    /// Size of the private block attached to every open handle.
    fn device_handle_priv_size(&self) -> usize {
        0
    }

    /// Size of the private block attached to every transfer.
    fn transfer_priv_size(&self) -> usize {
        0
    }

    /// Scan for devices and append one entry per device to `discovered`.
    ///
    /// The backend re-associates previously seen devices through
    /// [`Context::get_device_by_session_id`] and creates new ones with
    /// [`Context::alloc_device`] followed by [`Context::sanitize_device`];
    /// devices failing sanitization are dropped rather than appended.
    fn get_device_list(&self, ctx: &Context, discovered: &mut DiscoveredDevices) -> Result<()>;

    /// Open the kernel-side transport for `handle`.
    fn open(&self, handle: &DeviceHandle) -> Result<()>;

    /// Close the kernel-side transport for `handle`.
    fn close(&self, handle: &DeviceHandle);

    /// Read the raw 18-byte device descriptor. The returned flag tells
    /// whether multi-byte fields are already in host byte order.
    fn get_device_descriptor(&self, device: &Device) -> Result<([u8; DEVICE_DESC_LENGTH], bool)>;

    /// Parsed descriptor of the active configuration.
    fn get_active_config_descriptor(&self, device: &Device) -> Result<ConfigDescriptor>;

    /// Activate a configuration; -1 puts the device in unconfigured state.
    /// Blocking.
    fn set_configuration(&self, handle: &DeviceHandle, configuration: i32) -> Result<()>;

    /// Assert exclusive userspace ownership of an interface.
    fn claim_interface(&self, handle: &DeviceHandle, interface: u8) -> Result<()>;

    /// Release a previously claimed interface. Blocking.
    fn release_interface(&self, handle: &DeviceHandle, interface: u8) -> Result<()>;

    /// Activate an alternate setting on a claimed interface. Blocking.
    fn set_interface_altsetting(
        &self,
        handle: &DeviceHandle,
        interface: u8,
        altsetting: u8,
    ) -> Result<()>;

    /// Clear a halt/stall condition on an endpoint. Blocking.
    fn clear_halt(&self, handle: &DeviceHandle, endpoint: u8) -> Result<()>;

    /// Perform a port reset. Blocking.
    fn reset_device(&self, handle: &DeviceHandle) -> Result<()>;

    /// Whether a kernel driver is bound to the interface. Backends that do
    /// not support the query keep the default.
    fn kernel_driver_active(&self, _handle: &DeviceHandle, _interface: u8) -> Result<bool> {
        Err(Error::NotSupported)
    }

    /// Unbind the kernel driver from an interface. Backends that do not
    /// support detaching keep the default.
    fn detach_kernel_driver(&self, _handle: &DeviceHandle, _interface: u8) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Hand an already configured transfer to the kernel. A transfer whose
    /// submission fails is not considered in flight.
    fn submit_transfer(&self, ctx: &Context, transfer: &Transfer) -> Result<()>;

    /// Ask the kernel to cancel an in-flight transfer. Non-blocking; the
    /// cancellation outcome is reported later through
    /// [`Context::handle_transfer_cancellation`].
    fn cancel_transfer(&self, ctx: &Context, transfer: &Transfer) -> Result<()>;

    /// Process readiness on the backend's registered file descriptors,
    /// reporting every terminal transfer through the context helpers.
    fn handle_events(&self, ctx: &Context, readable: &[RawFd], writable: &[RawFd]) -> Result<()>;

    /// Hook invoked once when a device's reference count reaches zero,
    /// before its private block is released.
    fn destroy_device(&self, _device: &Device) {}
}
