//! Synchronous convenience I/O
//!
//! Single-shot blocking transfers layered over the asynchronous engine: each
//! call allocates a transfer, submits it and drives the event loop on the
//! calling thread until the transfer reaches a terminal state. The terminal
//! status is mapped onto a `Result`; the number of bytes moved is returned
//! on success. For IN transfers the received data is copied back into the
//! caller's buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::handle::DeviceHandle;
use crate::transfer::{ControlSetup, Transfer, TransferStatus, CONTROL_SETUP_SIZE};
use crate::{Error, Result};

const ENDPOINT_DIR_IN: u8 = 0x80;

/// Perform a control transfer and wait for it to complete.
///
/// For device-to-host requests (`setup.request_type` direction bit set) the
/// received bytes are copied into `data`; `setup.length` bounds the amount
/// requested from the device.
pub fn control_transfer(
    ctx: &Context,
    handle: &Arc<DeviceHandle>,
    setup: ControlSetup,
    data: &mut [u8],
    timeout_ms: u32,
) -> Result<usize> {
    let transfer = ctx.alloc_transfer();
    let is_in = setup.request_type & ENDPOINT_DIR_IN != 0;
    let out_data: &[u8] = if is_in { &[] } else { data };
    transfer.set_control(handle, setup, out_data, timeout_ms, |_| {});

    let transferred = run_to_completion(ctx, &transfer)?;
    if is_in {
        transfer.with_buffer_mut(|buf| {
            let payload = &buf[CONTROL_SETUP_SIZE.min(buf.len())..];
            let copy = transferred.min(data.len()).min(payload.len());
            data[..copy].copy_from_slice(&payload[..copy]);
        });
    }
    Ok(transferred)
}

/// Perform a bulk transfer and wait for it to complete.
///
/// The endpoint's direction bit selects between writing `data` to the
/// device and filling `data` from it.
pub fn bulk_transfer(
    ctx: &Context,
    handle: &Arc<DeviceHandle>,
    endpoint: u8,
    data: &mut [u8],
    timeout_ms: u32,
) -> Result<usize> {
    let transfer = ctx.alloc_transfer();
    transfer.set_bulk(handle, endpoint, data.to_vec(), timeout_ms, |_| {});
    finish_stream_transfer(ctx, transfer, endpoint, data)
}

/// Perform an interrupt transfer and wait for it to complete.
pub fn interrupt_transfer(
    ctx: &Context,
    handle: &Arc<DeviceHandle>,
    endpoint: u8,
    data: &mut [u8],
    timeout_ms: u32,
) -> Result<usize> {
    let transfer = ctx.alloc_transfer();
    transfer.set_interrupt(handle, endpoint, data.to_vec(), timeout_ms, |_| {});
    finish_stream_transfer(ctx, transfer, endpoint, data)
}

fn finish_stream_transfer(
    ctx: &Context,
    transfer: Transfer,
    endpoint: u8,
    data: &mut [u8],
) -> Result<usize> {
    let transferred = run_to_completion(ctx, &transfer)?;
    if endpoint & ENDPOINT_DIR_IN != 0 {
        transfer.with_buffer_mut(|buf| {
            let copy = transferred.min(data.len()).min(buf.len());
            data[..copy].copy_from_slice(&buf[..copy]);
        });
    }
    Ok(transferred)
}

/// Submit `transfer` and drive the event loop until its callback has fired,
/// then map the terminal status.
fn run_to_completion(ctx: &Context, transfer: &Transfer) -> Result<usize> {
    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        let mut state = transfer.state();
        state.callback = Some(Box::new(move |_t: &Transfer| {
            done.store(true, Ordering::SeqCst);
        }));
    }

    ctx.submit_transfer(transfer)?;
    while !done.load(Ordering::SeqCst) {
        ctx.poll()?;
    }

    match transfer.status() {
        TransferStatus::Completed => Ok(transfer.actual_length()),
        TransferStatus::TimedOut => Err(Error::Timeout),
        TransferStatus::Stall => Err(Error::Pipe),
        TransferStatus::NoDevice => Err(Error::NoDevice),
        TransferStatus::Overflow => Err(Error::Overflow),
        TransferStatus::Error | TransferStatus::Cancelled => Err(Error::Io),
        TransferStatus::Silent => Err(Error::other("silent completion on sync transfer")),
    }
}
