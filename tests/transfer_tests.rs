//! Transfer engine integration tests
//!
//! Covers submission, deadline ordering, timeout-induced cancellation,
//! synchronous cancellation, short-transfer handling, wire normalization of
//! the control setup header, and the blocking convenience helpers. Outcomes
//! are delivered through the mock backend's self-pipe, so every test drives
//! the real poll path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use usbio::backend::mock::{MockBackend, ScriptedDevice};
use usbio::{
    sync, Context, ControlSetup, DeviceHandle, Error, Transfer, TransferFlags, TransferStatus,
};

fn new_ctx() -> (Arc<MockBackend>, Context, Arc<DeviceHandle>) {
    let mock = Arc::new(MockBackend::new(vec![ScriptedDevice::new(
        1, 1, 4, 0x1234, 0x5678,
    )]));
    let ctx = Context::new(mock.clone()).unwrap();
    let list = ctx.get_device_list().unwrap();
    let handle = ctx.open(&list[0]).unwrap();
    ctx.free_device_list(list, true);
    (mock, ctx, handle)
}

/// Drive the event loop until `cond` holds, panicking if it never does.
fn drive_until(ctx: &Context, cond: impl Fn() -> bool) {
    for _ in 0..50 {
        if cond() {
            return;
        }
        ctx.poll_timeout(Duration::from_millis(500)).unwrap();
    }
    panic!("event loop never reached expected state");
}

fn counting_callback() -> (Arc<AtomicU32>, impl FnMut(&Transfer) + Send + 'static) {
    let count = Arc::new(AtomicU32::new(0));
    let cb_count = count.clone();
    (count, move |_t: &Transfer| {
        cb_count.fetch_add(1, Ordering::SeqCst);
    })
}

// ============================================================================
// Completion paths
// ============================================================================

#[test]
fn test_bulk_transfer_completes_once() {
    let (mock, ctx, handle) = new_ctx();

    let (fired, callback) = counting_callback();
    let transfer = ctx.alloc_transfer();
    transfer.set_bulk(&handle, 0x81, vec![0u8; 64], 0, callback);

    ctx.submit_transfer(&transfer).unwrap();
    assert_eq!(mock.in_flight(), 1);

    mock.complete_transfer(&transfer, TransferStatus::Completed, b"payload");
    drive_until(&ctx, || fired.load(Ordering::SeqCst) == 1);

    assert_eq!(transfer.status(), TransferStatus::Completed);
    assert_eq!(transfer.actual_length(), 7);
    assert_eq!(&transfer.buffer()[..7], b"payload");
    assert_eq!(mock.in_flight(), 0);
    assert_eq!(ctx.get_next_timeout(), None);

    // no second delivery
    ctx.poll_timeout(Duration::from_millis(20)).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_short_transfer_with_short_not_ok_is_an_error() {
    let (mock, ctx, handle) = new_ctx();

    let (fired, callback) = counting_callback();
    let transfer = ctx.alloc_transfer();
    transfer.set_bulk(&handle, 0x81, vec![0u8; 512], 0, callback);
    transfer.set_flags(TransferFlags::SHORT_NOT_OK);

    ctx.submit_transfer(&transfer).unwrap();
    mock.complete_transfer(&transfer, TransferStatus::Completed, &[0xabu8; 200]);
    drive_until(&ctx, || fired.load(Ordering::SeqCst) == 1);

    assert_eq!(transfer.status(), TransferStatus::Error);
    assert_eq!(transfer.actual_length(), 200);
}

#[test]
fn test_short_transfer_without_flag_stays_completed() {
    let (mock, ctx, handle) = new_ctx();

    let (fired, callback) = counting_callback();
    let transfer = ctx.alloc_transfer();
    transfer.set_bulk(&handle, 0x81, vec![0u8; 512], 0, callback);

    ctx.submit_transfer(&transfer).unwrap();
    mock.complete_transfer(&transfer, TransferStatus::Completed, &[0xabu8; 200]);
    drive_until(&ctx, || fired.load(Ordering::SeqCst) == 1);

    assert_eq!(transfer.status(), TransferStatus::Completed);
    assert_eq!(transfer.actual_length(), 200);
}

#[test]
fn test_failed_submission_is_not_linked() {
    let (mock, ctx, handle) = new_ctx();
    mock.set_fail_submit(Some(Error::NoDevice));

    let transfer = ctx.alloc_transfer();
    transfer.set_bulk(&handle, 0x81, vec![0u8; 16], 100, |_| {});

    assert_eq!(ctx.submit_transfer(&transfer), Err(Error::NoDevice));
    assert_eq!(mock.in_flight(), 0);
    assert_eq!(ctx.get_next_timeout(), None);
}

// ============================================================================
// Timeouts and cancellation
// ============================================================================

#[test]
fn test_timeout_induced_cancel_reports_timed_out_once() {
    let (mock, ctx, handle) = new_ctx();

    let (fired, callback) = counting_callback();
    let transfer = ctx.alloc_transfer();
    transfer.set_bulk(&handle, 0x02, vec![0u8; 32], 100, callback);
    ctx.submit_transfer(&transfer).unwrap();

    // the backend never signals; the 100 ms deadline must fire the sweep
    drive_until(&ctx, || fired.load(Ordering::SeqCst) == 1);

    assert_eq!(transfer.status(), TransferStatus::TimedOut);
    assert_eq!(mock.cancel_requests(), 1);
    assert_eq!(mock.in_flight(), 0);

    ctx.poll_timeout(Duration::from_millis(20)).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_user_cancel_reports_cancelled() {
    let (_mock, ctx, handle) = new_ctx();

    let (fired, callback) = counting_callback();
    let transfer = ctx.alloc_transfer();
    transfer.set_bulk(&handle, 0x81, vec![0u8; 32], 0, callback);
    ctx.submit_transfer(&transfer).unwrap();

    ctx.cancel_transfer(&transfer).unwrap();
    drive_until(&ctx, || fired.load(Ordering::SeqCst) == 1);
    assert_eq!(transfer.status(), TransferStatus::Cancelled);
}

#[test]
fn test_sync_cancel_suppresses_callback() {
    let (mock, ctx, handle) = new_ctx();

    let (fired, callback) = counting_callback();
    let transfer = ctx.alloc_transfer();
    let setup = ControlSetup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        length: 18,
    };
    transfer.set_control(&handle, setup, &[], 0, callback);
    ctx.submit_transfer(&transfer).unwrap();

    ctx.cancel_transfer_sync(&transfer).unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(mock.in_flight(), 0);

    // nothing left to deliver
    ctx.poll_timeout(Duration::from_millis(20)).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_deadline_ordering_drives_timeout_order() {
    let (mock, ctx, handle) = new_ctx();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let make_callback = |name: &'static str| {
        let order = order.clone();
        move |_t: &Transfer| {
            order.lock().unwrap().push(name);
        }
    };

    let t1 = ctx.alloc_transfer();
    t1.set_bulk(&handle, 0x81, vec![0u8; 8], 200, make_callback("t1"));
    let t2 = ctx.alloc_transfer();
    t2.set_bulk(&handle, 0x81, vec![0u8; 8], 0, make_callback("t2"));
    let t3 = ctx.alloc_transfer();
    t3.set_bulk(&handle, 0x81, vec![0u8; 8], 50, make_callback("t3"));

    ctx.submit_transfer(&t1).unwrap();
    ctx.submit_transfer(&t2).unwrap();
    ctx.submit_transfer(&t3).unwrap();

    // the nearest deadline is t3's
    let next = ctx.get_next_timeout().unwrap();
    assert!(next <= Duration::from_millis(50));

    drive_until(&ctx, || order.lock().unwrap().len() == 2);
    assert_eq!(*order.lock().unwrap(), vec!["t3", "t1"]);
    assert_eq!(t3.status(), TransferStatus::TimedOut);
    assert_eq!(t1.status(), TransferStatus::TimedOut);

    // the infinite-timeout transfer is still in flight and imposes no
    // deadline
    assert_eq!(mock.in_flight(), 1);
    assert_eq!(ctx.get_next_timeout(), None);
}

// ============================================================================
// Control setup wire format
// ============================================================================

#[test]
fn test_control_setup_normalized_to_wire_order_at_submit() {
    let (_mock, ctx, handle) = new_ctx();

    let transfer = ctx.alloc_transfer();
    let setup = ControlSetup {
        request_type: 0x40,
        request: 0x01,
        value: 0x1234,
        index: 0x5678,
        length: 0x00ff,
    };
    transfer.set_control(&handle, setup, &[], 0, |_| {});
    ctx.submit_transfer(&transfer).unwrap();

    let buffer = transfer.buffer();
    assert_eq!(
        &buffer[..8],
        &[0x40, 0x01, 0x34, 0x12, 0x78, 0x56, 0xff, 0x00]
    );

    ctx.cancel_transfer_sync(&transfer).unwrap();
}

#[test]
fn test_control_transfer_rejects_missing_setup() {
    let (_mock, ctx, _handle) = new_ctx();

    // a control transfer whose buffer cannot hold the setup header
    let transfer = ctx.alloc_transfer();
    assert_eq!(ctx.submit_transfer(&transfer), Err(Error::InvalidParam));
}

// ============================================================================
// Flags
// ============================================================================

#[test]
fn test_free_transfer_releases_callback_and_buffer() {
    let (mock, ctx, handle) = new_ctx();

    let (fired, callback) = counting_callback();
    let transfer = ctx.alloc_transfer();
    transfer.set_bulk(&handle, 0x81, vec![0u8; 64], 0, callback);
    transfer.set_flags(TransferFlags::FREE_TRANSFER | TransferFlags::FREE_BUFFER);

    ctx.submit_transfer(&transfer).unwrap();
    mock.complete_transfer(&transfer, TransferStatus::Completed, b"x");
    drive_until(&ctx, || fired.load(Ordering::SeqCst) == 1);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(transfer.buffer_len(), 0);
}

// ============================================================================
// Blocking convenience helpers
// ============================================================================

#[test]
fn test_sync_bulk_in_returns_data() {
    let (mock, ctx, handle) = new_ctx();
    mock.set_auto_complete(TransferStatus::Completed, b"hello");

    let mut data = [0u8; 16];
    let n = sync::bulk_transfer(&ctx, &handle, 0x81, &mut data, 1000).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&data[..5], b"hello");
}

#[test]
fn test_sync_control_in_returns_data() {
    let (mock, ctx, handle) = new_ctx();
    mock.set_auto_complete(TransferStatus::Completed, &[1, 2, 3, 4]);

    let mut data = [0u8; 4];
    let setup = ControlSetup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        length: 4,
    };
    let n = sync::control_transfer(&ctx, &handle, setup, &mut data, 1000).unwrap();
    assert_eq!(n, 4);
    assert_eq!(data, [1, 2, 3, 4]);
}

#[test]
fn test_sync_interrupt_out_reports_length() {
    let (mock, ctx, handle) = new_ctx();
    mock.set_auto_complete(TransferStatus::Completed, &[0u8; 8]);

    let mut data = [0x55u8; 8];
    let n = sync::interrupt_transfer(&ctx, &handle, 0x02, &mut data, 1000).unwrap();
    assert_eq!(n, 8);
}

#[test]
fn test_sync_transfer_times_out() {
    let (_mock, ctx, handle) = new_ctx();

    // never completed by the backend; the 50 ms deadline must surface as a
    // timeout error
    let mut data = [0u8; 8];
    let result = sync::bulk_transfer(&ctx, &handle, 0x81, &mut data, 50);
    assert_eq!(result, Err(Error::Timeout));
}

#[test]
fn test_sync_stall_maps_to_pipe_error() {
    let (mock, ctx, handle) = new_ctx();
    mock.set_auto_complete(TransferStatus::Stall, &[]);

    let mut data = [0u8; 8];
    let result = sync::bulk_transfer(&ctx, &handle, 0x02, &mut data, 1000);
    assert_eq!(result, Err(Error::Pipe));
}
