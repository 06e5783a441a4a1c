//! Open device handles
//!
//! A [`DeviceHandle`] is an open session on a device: all I/O and all
//! interface management goes through it. The handle owns a device reference
//! plus one extra reference taken by open, so the device stays reachable
//! through [`DeviceHandle::device`] even after the caller has released its
//! enumeration list. Dropping the last `Arc` to a handle closes it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::device::Device;
use crate::{Error, Result};

/// Width of the claimed-interface bitmap.
const CLAIMED_INTERFACES_BITS: u8 = u32::BITS as u8;

struct HandleState {
    /// One bit per interface number the handle has claimed.
    claimed_interfaces: u32,
    /// Set once the backend open succeeded; gates close-side teardown.
    opened: bool,
}

/// An open session on a USB device.
pub struct DeviceHandle {
    device: Device,
    state: Mutex<HandleState>,
    os_priv: Mutex<Vec<u8>>,
}

impl DeviceHandle {
    pub(crate) fn open(device: &Device) -> Result<Arc<DeviceHandle>> {
        debug!(
            "open {}.{}",
            device.bus_number(),
            device.device_address()
        );
        let ctx = device.context().clone();
        let handle = Arc::new(DeviceHandle {
            device: device.clone(),
            state: Mutex::new(HandleState {
                claimed_interfaces: 0,
                opened: false,
            }),
            os_priv: Mutex::new(vec![0; ctx.backend().device_handle_priv_size()]),
        });

        ctx.backend().open(&handle)?;
        handle.state.lock().unwrap().opened = true;
        handle.device.shared.take_extra_ref();
        ctx.register_handle(&handle);
        Ok(handle)
    }

    /// The underlying device. Does not take a device reference; clone the
    /// returned device if it must outlive the handle.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current claimed-interface bitmap, one bit per interface number.
    pub fn claimed_interfaces(&self) -> u32 {
        self.state.lock().unwrap().claimed_interfaces
    }

    /// Backend-private block attached to this handle.
    pub fn os_priv(&self) -> MutexGuard<'_, Vec<u8>> {
        self.os_priv.lock().unwrap()
    }

    /// Activate a configuration by its bConfigurationValue; -1 puts the
    /// device in unconfigured state. All claimed interfaces must be released
    /// before changing configuration. Blocking.
    pub fn set_configuration(&self, configuration: i32) -> Result<()> {
        debug!("configuration {}", configuration);
        self.device
            .ctx
            .backend()
            .set_configuration(self, configuration)
    }

    /// Claim an interface so its endpoints can be used for I/O. Claiming an
    /// already claimed interface succeeds without a backend round-trip.
    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        debug!("interface {}", interface);
        if interface >= CLAIMED_INTERFACES_BITS {
            return Err(Error::InvalidParam);
        }

        let mut state = self.state.lock().unwrap();
        if state.claimed_interfaces & (1 << interface) != 0 {
            return Ok(());
        }

        self.device.ctx.backend().claim_interface(self, interface)?;
        state.claimed_interfaces |= 1 << interface;
        Ok(())
    }

    /// Release a claimed interface, resetting it to its first alternate
    /// setting. Fails with [`Error::NotFound`] if the interface is not
    /// claimed. Blocking.
    pub fn release_interface(&self, interface: u8) -> Result<()> {
        debug!("interface {}", interface);
        if interface >= CLAIMED_INTERFACES_BITS {
            return Err(Error::InvalidParam);
        }

        let mut state = self.state.lock().unwrap();
        if state.claimed_interfaces & (1 << interface) == 0 {
            return Err(Error::NotFound);
        }

        self.device
            .ctx
            .backend()
            .release_interface(self, interface)?;
        state.claimed_interfaces &= !(1 << interface);
        Ok(())
    }

    /// Activate an alternate setting on a previously claimed interface.
    /// Blocking.
    pub fn set_interface_alt_setting(&self, interface: u8, alternate_setting: u8) -> Result<()> {
        debug!("interface {} altsetting {}", interface, alternate_setting);
        if interface >= CLAIMED_INTERFACES_BITS {
            return Err(Error::InvalidParam);
        }

        {
            let state = self.state.lock().unwrap();
            if state.claimed_interfaces & (1 << interface) == 0 {
                return Err(Error::NotFound);
            }
        }

        self.device
            .ctx
            .backend()
            .set_interface_altsetting(self, interface, alternate_setting)
    }

    /// Clear a halt/stall condition on an endpoint. Cancel pending transfers
    /// on the endpoint first. Blocking.
    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        debug!("endpoint {:#x}", endpoint);
        self.device.ctx.backend().clear_halt(self, endpoint)
    }

    /// Perform a USB port reset. If re-enumeration is required the handle
    /// becomes invalid and [`Error::NotFound`] is returned. Blocking.
    pub fn reset_device(&self) -> Result<()> {
        debug!("reset");
        self.device.ctx.backend().reset_device(self)
    }

    /// Whether a kernel driver is bound to `interface`. Returns
    /// [`Error::NotSupported`] if the backend cannot tell.
    pub fn kernel_driver_active(&self, interface: u8) -> Result<bool> {
        debug!("interface {}", interface);
        self.device
            .ctx
            .backend()
            .kernel_driver_active(self, interface)
    }

    /// Unbind the kernel driver from `interface` so it can be claimed.
    /// Returns [`Error::NotSupported`] if the backend cannot detach.
    pub fn detach_kernel_driver(&self, interface: u8) -> Result<()> {
        debug!("interface {}", interface);
        self.device
            .ctx
            .backend()
            .detach_kernel_driver(self, interface)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let opened = self.state.lock().unwrap().opened;
        if opened {
            debug!(
                "close {}.{}",
                self.device.bus_number(),
                self.device.device_address()
            );
            self.device.ctx.unregister_closed_handles();
            self.device.ctx.backend().close(self);
            self.device.shared.release_extra_ref();
        }
        // the owned device reference drops with the field
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.device)
            .field("claimed_interfaces", &self.claimed_interfaces())
            .finish()
    }
}

/// The process-wide table of open handles. Entries are weak: a handle's
/// lifetime is owned by the embedder, the table only observes it.
pub(crate) type HandleTable = Mutex<Vec<Weak<DeviceHandle>>>;
