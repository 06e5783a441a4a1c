//! Scripted in-process backend
//!
//! A fully scripted [`UsbBackend`] used by the test suite and by embedders
//! developing against the engine without hardware. Devices are declared up
//! front; transfer outcomes are queued by the test and delivered through the
//! real event-loop path: every queued outcome writes a wake byte into a
//! self-pipe whose read end is registered with the engine, so completions
//! flow through `poll` → readiness → [`UsbBackend::handle_events`] exactly
//! like a kernel-backed transport.

use std::collections::VecDeque;
use std::io::{pipe, PipeReader, PipeWriter, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Mutex;

use tracing::debug;

use crate::backend::UsbBackend;
use crate::context::Context;
use crate::descriptors::{
    ConfigDescriptor, EndpointDescriptor, Interface, InterfaceDescriptor, DEVICE_DESC_LENGTH,
};
use crate::device::{Device, DiscoveredDevices};
use crate::eventloop::PollEvents;
use crate::handle::DeviceHandle;
use crate::transfer::{Transfer, TransferKind, TransferStatus, CONTROL_SETUP_SIZE};
use crate::{Error, Result};

/// One device the mock backend reports during enumeration.
#[derive(Clone)]
pub struct ScriptedDevice {
    pub session_id: u64,
    pub bus_number: u8,
    pub device_address: u8,
    /// Raw device descriptor, little-endian fields
    pub descriptor: [u8; DEVICE_DESC_LENGTH],
    /// Active configuration handed out pre-parsed
    pub config: ConfigDescriptor,
}

impl ScriptedDevice {
    /// A single-configuration device with one vendor-specific interface
    /// carrying a bulk IN (0x81) and a bulk OUT (0x02) endpoint.
    pub fn new(
        session_id: u64,
        bus_number: u8,
        device_address: u8,
        vendor_id: u16,
        product_id: u16,
    ) -> ScriptedDevice {
        let mut descriptor = [
            0x12, // bLength
            0x01, // bDescriptorType (Device)
            0x00, 0x02, // bcdUSB (2.00)
            0x00, // bDeviceClass
            0x00, // bDeviceSubClass
            0x00, // bDeviceProtocol
            0x40, // bMaxPacketSize0
            0x00, 0x00, // idVendor (patched below)
            0x00, 0x00, // idProduct (patched below)
            0x00, 0x01, // bcdDevice (1.00)
            0x01, // iManufacturer
            0x02, // iProduct
            0x03, // iSerialNumber
            0x01, // bNumConfigurations
        ];
        descriptor[8..10].copy_from_slice(&vendor_id.to_le_bytes());
        descriptor[10..12].copy_from_slice(&product_id.to_le_bytes());

        ScriptedDevice {
            session_id,
            bus_number,
            device_address,
            descriptor,
            config: ConfigDescriptor {
                value: 1,
                interfaces: vec![Interface {
                    altsettings: vec![InterfaceDescriptor {
                        interface_number: 0,
                        alternate_setting: 0,
                        class: 0xff,
                        endpoints: vec![
                            EndpointDescriptor {
                                address: 0x81,
                                attributes: 0x02,
                                max_packet_size: 512,
                                interval: 0,
                            },
                            EndpointDescriptor {
                                address: 0x02,
                                attributes: 0x02,
                                max_packet_size: 64,
                                interval: 0,
                            },
                        ],
                    }],
                }],
            },
        }
    }

    /// Override the descriptor's bNumConfigurations field.
    pub fn with_num_configurations(mut self, n: u8) -> ScriptedDevice {
        self.descriptor[DEVICE_DESC_LENGTH - 1] = n;
        self
    }
}

struct AutoComplete {
    status: TransferStatus,
    data: Vec<u8>,
}

enum MockEvent {
    Completion {
        transfer: Transfer,
        status: TransferStatus,
        data: Vec<u8>,
    },
    Cancellation {
        transfer: Transfer,
    },
}

#[derive(Default)]
struct MockState {
    devices: Vec<ScriptedDevice>,
    submitted: Vec<Transfer>,
    pending: VecDeque<MockEvent>,
    auto_complete: Option<AutoComplete>,
    fail_open: Option<Error>,
    fail_submit: Option<Error>,
    fail_claim: Option<Error>,
    kernel_driver_support: bool,
    active_drivers: Vec<u8>,
    opens: u32,
    closes: u32,
    destroyed_sessions: Vec<u64>,
    claims: Vec<u8>,
    releases: Vec<u8>,
    alt_settings: Vec<(u8, u8)>,
    configurations: Vec<i32>,
    cleared_halts: Vec<u8>,
    resets: u32,
    detached: Vec<u8>,
    cancel_requests: u32,
}

/// The scripted backend. See the module docs.
pub struct MockBackend {
    state: Mutex<MockState>,
    reader: Mutex<Option<PipeReader>>,
    writer: Mutex<Option<PipeWriter>>,
}

impl MockBackend {
    pub fn new(devices: Vec<ScriptedDevice>) -> MockBackend {
        MockBackend {
            state: Mutex::new(MockState {
                devices,
                kernel_driver_support: true,
                ..MockState::default()
            }),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    fn wake(&self) {
        if let Some(w) = self.writer.lock().unwrap().as_ref() {
            let mut writer: &PipeWriter = w;
            let _ = writer.write(&[1]);
        }
    }

    fn remove_submitted(&self, transfer: &Transfer) -> bool {
        let mut state = self.state.lock().unwrap();
        match state
            .submitted
            .iter()
            .position(|t| t.same_transfer(transfer))
        {
            Some(idx) => {
                state.submitted.remove(idx);
                true
            }
            None => false,
        }
    }

    // ---- scripting -------------------------------------------------------

    /// Queue a terminal outcome for `transfer`, delivered at the next
    /// event-loop pass. `data` is deposited into the transfer buffer (after
    /// the setup header for control transfers) and its length becomes the
    /// transferred byte count.
    pub fn complete_transfer(&self, transfer: &Transfer, status: TransferStatus, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .pending
            .push_back(MockEvent::Completion {
                transfer: transfer.clone(),
                status,
                data: data.to_vec(),
            });
        self.wake();
    }

    /// Complete every subsequently submitted transfer with `status` and
    /// `data`, without the test holding a transfer reference.
    pub fn set_auto_complete(&self, status: TransferStatus, data: &[u8]) {
        self.state.lock().unwrap().auto_complete = Some(AutoComplete {
            status,
            data: data.to_vec(),
        });
    }

    pub fn set_fail_open(&self, error: Option<Error>) {
        self.state.lock().unwrap().fail_open = error;
    }

    pub fn set_fail_submit(&self, error: Option<Error>) {
        self.state.lock().unwrap().fail_submit = error;
    }

    pub fn set_fail_claim(&self, error: Option<Error>) {
        self.state.lock().unwrap().fail_claim = error;
    }

    pub fn set_kernel_driver_support(&self, supported: bool) {
        self.state.lock().unwrap().kernel_driver_support = supported;
    }

    /// Mark a kernel driver as bound to `interface`.
    pub fn bind_kernel_driver(&self, interface: u8) {
        self.state.lock().unwrap().active_drivers.push(interface);
    }

    // ---- observation -----------------------------------------------------

    pub fn opens(&self) -> u32 {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().unwrap().closes
    }

    pub fn destroyed_sessions(&self) -> Vec<u64> {
        self.state.lock().unwrap().destroyed_sessions.clone()
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.state.lock().unwrap().claims.clone()
    }

    pub fn released(&self) -> Vec<u8> {
        self.state.lock().unwrap().releases.clone()
    }

    pub fn alt_settings(&self) -> Vec<(u8, u8)> {
        self.state.lock().unwrap().alt_settings.clone()
    }

    pub fn configurations(&self) -> Vec<i32> {
        self.state.lock().unwrap().configurations.clone()
    }

    pub fn cleared_halts(&self) -> Vec<u8> {
        self.state.lock().unwrap().cleared_halts.clone()
    }

    pub fn resets(&self) -> u32 {
        self.state.lock().unwrap().resets
    }

    pub fn detached(&self) -> Vec<u8> {
        self.state.lock().unwrap().detached.clone()
    }

    pub fn cancel_requests(&self) -> u32 {
        self.state.lock().unwrap().cancel_requests
    }

    /// Number of transfers accepted and not yet reported terminal.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }
}

impl UsbBackend for MockBackend {
    fn init(&self, ctx: &Context) -> Result<()> {
        let (reader, writer) = pipe().map_err(Error::other)?;
        ctx.add_pollfd(reader.as_fd().as_raw_fd(), PollEvents::READABLE);
        *self.reader.lock().unwrap() = Some(reader);
        *self.writer.lock().unwrap() = Some(writer);
        Ok(())
    }

    fn exit(&self) {
        self.reader.lock().unwrap().take();
        self.writer.lock().unwrap().take();
    }

    fn device_priv_size(&self) -> usize {
        4
    }

    fn device_handle_priv_size(&self) -> usize {
        4
    }

    fn transfer_priv_size(&self) -> usize {
        8
    }

    fn get_device_list(&self, ctx: &Context, discovered: &mut DiscoveredDevices) -> Result<()> {
        let scripted = self.state.lock().unwrap().devices.clone();

        for entry in scripted {
            let device = match ctx.get_device_by_session_id(entry.session_id) {
                Some(existing) => existing,
                None => {
                    let device =
                        ctx.alloc_device(entry.session_id, entry.bus_number, entry.device_address);
                    if let Err(e) = ctx.sanitize_device(&device) {
                        debug!("skipping device {}: {}", entry.session_id, e);
                        continue;
                    }
                    device
                }
            };
            discovered.push(device);
        }
        Ok(())
    }

    fn open(&self, _handle: &DeviceHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state.fail_open.clone() {
            return Err(e);
        }
        state.opens += 1;
        Ok(())
    }

    fn close(&self, _handle: &DeviceHandle) {
        self.state.lock().unwrap().closes += 1;
    }

    fn get_device_descriptor(&self, device: &Device) -> Result<([u8; DEVICE_DESC_LENGTH], bool)> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .iter()
            .find(|d| d.session_id == device.session_id())
            .map(|d| (d.descriptor, false))
            .ok_or(Error::NoDevice)
    }

    fn get_active_config_descriptor(&self, device: &Device) -> Result<ConfigDescriptor> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .iter()
            .find(|d| d.session_id == device.session_id())
            .map(|d| d.config.clone())
            .ok_or(Error::NoDevice)
    }

    fn set_configuration(&self, _handle: &DeviceHandle, configuration: i32) -> Result<()> {
        self.state.lock().unwrap().configurations.push(configuration);
        Ok(())
    }

    fn claim_interface(&self, _handle: &DeviceHandle, interface: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state.fail_claim.clone() {
            return Err(e);
        }
        state.claims.push(interface);
        Ok(())
    }

    fn release_interface(&self, _handle: &DeviceHandle, interface: u8) -> Result<()> {
        self.state.lock().unwrap().releases.push(interface);
        Ok(())
    }

    fn set_interface_altsetting(
        &self,
        _handle: &DeviceHandle,
        interface: u8,
        altsetting: u8,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .alt_settings
            .push((interface, altsetting));
        Ok(())
    }

    fn clear_halt(&self, _handle: &DeviceHandle, endpoint: u8) -> Result<()> {
        self.state.lock().unwrap().cleared_halts.push(endpoint);
        Ok(())
    }

    fn reset_device(&self, _handle: &DeviceHandle) -> Result<()> {
        self.state.lock().unwrap().resets += 1;
        Ok(())
    }

    fn kernel_driver_active(&self, _handle: &DeviceHandle, interface: u8) -> Result<bool> {
        let state = self.state.lock().unwrap();
        if !state.kernel_driver_support {
            return Err(Error::NotSupported);
        }
        Ok(state.active_drivers.contains(&interface))
    }

    fn detach_kernel_driver(&self, _handle: &DeviceHandle, interface: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.kernel_driver_support {
            return Err(Error::NotSupported);
        }
        match state.active_drivers.iter().position(|&i| i == interface) {
            Some(idx) => {
                state.active_drivers.remove(idx);
                state.detached.push(interface);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn submit_transfer(&self, _ctx: &Context, transfer: &Transfer) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state.fail_submit.clone() {
            return Err(e);
        }
        state.submitted.push(transfer.clone());

        let auto = state
            .auto_complete
            .as_ref()
            .map(|a| (a.status, a.data.clone()));
        if let Some((status, data)) = auto {
            state.pending.push_back(MockEvent::Completion {
                transfer: transfer.clone(),
                status,
                data,
            });
            drop(state);
            self.wake();
        }
        Ok(())
    }

    fn cancel_transfer(&self, _ctx: &Context, transfer: &Transfer) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.cancel_requests += 1;

        let in_flight = state
            .submitted
            .iter()
            .any(|t| t.same_transfer(transfer));
        let completion_pending = state.pending.iter().any(|e| {
            matches!(e, MockEvent::Completion { transfer: t, .. } if t.same_transfer(transfer))
        });
        // a transfer the "kernel" has already finished cannot be cancelled
        if !in_flight || completion_pending {
            return Err(Error::NotFound);
        }

        state.pending.push_back(MockEvent::Cancellation {
            transfer: transfer.clone(),
        });
        drop(state);
        self.wake();
        Ok(())
    }

    fn handle_events(&self, ctx: &Context, readable: &[RawFd], _writable: &[RawFd]) -> Result<()> {
        {
            let reader = self.reader.lock().unwrap();
            if let Some(r) = reader.as_ref() {
                if readable.contains(&r.as_fd().as_raw_fd()) {
                    let mut wake_bytes = [0u8; 64];
                    let mut reader: &PipeReader = r;
                    let _ = reader.read(&mut wake_bytes);
                }
            }
        }

        loop {
            let event = self.state.lock().unwrap().pending.pop_front();
            let Some(event) = event else { break };

            match event {
                MockEvent::Completion {
                    transfer,
                    status,
                    data,
                } => {
                    if !self.remove_submitted(&transfer) {
                        continue;
                    }
                    let offset = if transfer.kind() == TransferKind::Control {
                        CONTROL_SETUP_SIZE
                    } else {
                        0
                    };
                    transfer.with_buffer_mut(|buf| {
                        let n = data.len().min(buf.len().saturating_sub(offset));
                        buf[offset..offset + n].copy_from_slice(&data[..n]);
                    });
                    transfer.set_transferred(data.len());
                    ctx.handle_transfer_completion(&transfer, status);
                }
                MockEvent::Cancellation { transfer } => {
                    if !self.remove_submitted(&transfer) {
                        continue;
                    }
                    ctx.handle_transfer_cancellation(&transfer);
                }
            }
        }
        Ok(())
    }

    fn destroy_device(&self, device: &Device) {
        self.state
            .lock()
            .unwrap()
            .destroyed_sessions
            .push(device.session_id());
    }
}
