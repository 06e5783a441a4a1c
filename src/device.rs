//! USB devices and the device registry
//!
//! A [`Device`] represents a USB device currently or previously seen on a
//! bus. Devices are reference counted: cloning takes a reference, dropping
//! releases one, and the last release delinks the device from the registry
//! and runs the backend's destroy hook. The registry itself only tracks
//! membership so that re-enumeration can hand out the same device for the
//! same backend session ID; it never keeps a device alive on its own.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::context::Context;
use crate::descriptors::{ConfigDescriptor, DeviceDescriptor};
use crate::{Error, Result};

struct DeviceMeta {
    refcnt: u32,
    num_configurations: u8,
}

/// Registry-shared portion of a device. Reachable from every [`Device`]
/// reference and from the registry's membership list.
pub(crate) struct DeviceShared {
    session_id: u64,
    bus_number: u8,
    device_address: u8,
    meta: Mutex<DeviceMeta>,
    os_priv: Mutex<Vec<u8>>,
}

impl DeviceShared {
    pub(crate) fn new(
        session_id: u64,
        bus_number: u8,
        device_address: u8,
        priv_size: usize,
    ) -> DeviceShared {
        DeviceShared {
            session_id,
            bus_number,
            device_address,
            meta: Mutex::new(DeviceMeta {
                refcnt: 1,
                num_configurations: 0,
            }),
            os_priv: Mutex::new(vec![0; priv_size]),
        }
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Take one reference without materializing a `Device` value. Paired
    /// with [`DeviceShared::release_extra_ref`].
    pub(crate) fn take_extra_ref(&self) {
        self.meta.lock().unwrap().refcnt += 1;
    }

    /// Release a reference taken with [`DeviceShared::take_extra_ref`]. The
    /// holder of an extra reference always also owns a `Device` value, so
    /// this can never be the final release.
    pub(crate) fn release_extra_ref(&self) {
        let mut meta = self.meta.lock().unwrap();
        debug_assert!(meta.refcnt > 1);
        meta.refcnt = meta.refcnt.saturating_sub(1);
    }
}

/// A reference to a USB device. See the module docs for the reference
/// counting rules.
pub struct Device {
    pub(crate) ctx: Context,
    pub(crate) shared: Arc<DeviceShared>,
}

impl Device {
    /// Wrap an already-counted shared record (a fresh allocation).
    pub(crate) fn from_new(ctx: Context, shared: Arc<DeviceShared>) -> Device {
        Device { ctx, shared }
    }

    /// Wrap a shared record found in the registry, taking one reference.
    pub(crate) fn from_registry(ctx: Context, shared: Arc<DeviceShared>) -> Device {
        shared.take_extra_ref();
        Device { ctx, shared }
    }

    /// Number of the bus this device is connected to.
    pub fn bus_number(&self) -> u8 {
        self.shared.bus_number
    }

    /// Address of the device on its bus.
    pub fn device_address(&self) -> u8 {
        self.shared.device_address
    }

    /// Backend-assigned session ID identifying this attachment instance.
    pub fn session_id(&self) -> u64 {
        self.shared.session_id
    }

    /// Number of configurations the device reports, as recorded during
    /// enumeration.
    pub fn num_configurations(&self) -> u8 {
        self.shared.meta.lock().unwrap().num_configurations
    }

    pub(crate) fn set_num_configurations(&self, n: u8) {
        self.shared.meta.lock().unwrap().num_configurations = n;
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.shared.meta.lock().unwrap().refcnt
    }

    /// Whether two `Device` values reference the same device.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// The context this device belongs to.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Backend-private block attached to this device.
    pub fn os_priv(&self) -> MutexGuard<'_, Vec<u8>> {
        self.shared.os_priv.lock().unwrap()
    }

    /// Read and parse the device descriptor through the backend.
    pub fn device_descriptor(&self) -> Result<DeviceDescriptor> {
        let (raw, host_endian) = self.ctx.backend().get_device_descriptor(self)?;
        Ok(DeviceDescriptor::parse(&raw, host_endian))
    }

    /// Parsed descriptor of the active configuration.
    pub fn active_config_descriptor(&self) -> Result<ConfigDescriptor> {
        self.ctx.backend().get_active_config_descriptor(self)
    }

    /// Convenience lookup of an endpoint's wMaxPacketSize in the active
    /// configuration. Useful for sizing isochronous transfers.
    pub fn max_packet_size(&self, endpoint: u8) -> Result<u16> {
        let config = self.active_config_descriptor().map_err(|e| {
            debug!("could not retrieve active config descriptor: {}", e);
            Error::other("could not retrieve active config descriptor")
        })?;
        config.max_packet_size(endpoint)
    }
}

impl Clone for Device {
    fn clone(&self) -> Device {
        self.shared.take_extra_ref();
        Device {
            ctx: self.ctx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let refcnt = {
            let mut meta = self.shared.meta.lock().unwrap();
            meta.refcnt = meta.refcnt.saturating_sub(1);
            meta.refcnt
        };

        if refcnt == 0 {
            debug!(
                "destroy device {}.{}",
                self.shared.bus_number, self.shared.device_address
            );
            self.ctx.backend().destroy_device(self);
            self.ctx.registry_remove(&self.shared);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("bus_number", &self.shared.bus_number)
            .field("device_address", &self.shared.device_address)
            .field("session_id", &self.shared.session_id)
            .finish()
    }
}

/// Transient, growable collection of devices produced by one enumeration
/// pass. Each entry holds one device reference, released when the
/// collection is dropped.
#[derive(Default)]
pub struct DiscoveredDevices {
    devices: Vec<Device>,
}

impl DiscoveredDevices {
    pub(crate) fn new() -> DiscoveredDevices {
        DiscoveredDevices::default()
    }

    /// Append a device, transferring ownership of its reference.
    pub fn push(&mut self, device: Device) {
        self.devices.push(device);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}
