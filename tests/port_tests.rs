//! Port behaviour across threads: blocking, abort and end-of-stream.

use audioflow::error::IoError;
use audioflow::port::{Port, PortKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_ring_preserves_order_across_threads() {
    let port = Port::ring_buffer("fifo", 64).unwrap();
    let writer = port.clone();
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let expected = data.clone();

    let handle = thread::spawn(move || {
        for chunk in data.chunks(48) {
            assert_eq!(writer.write(chunk, None), Ok(chunk.len()));
        }
        writer.write_done();
    });

    let mut received = Vec::new();
    let mut buf = [0u8; 40];
    loop {
        match port.read(&mut buf, Some(Duration::from_secs(2))) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(IoError::Done) => break,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    handle.join().unwrap();
    assert_eq!(received, expected);
}

#[test]
fn test_abort_releases_blocked_reader() {
    let port = Port::ring_buffer("stuck", 16).unwrap();
    let reader = port.clone();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 8];
        reader.read(&mut buf, None)
    });

    thread::sleep(Duration::from_millis(20));
    port.abort();
    assert_eq!(handle.join().unwrap(), Err(IoError::Abort));

    // A reset port is usable again.
    port.reset();
    assert_eq!(port.write(&[1, 2], None), Ok(2));
}

#[test]
fn test_abort_releases_blocked_writer() {
    let port = Port::ring_buffer("full", 4).unwrap();
    port.write(&[0; 4], None).unwrap();
    let writer = port.clone();
    let handle = thread::spawn(move || writer.write(&[1; 4], None));

    thread::sleep(Duration::from_millis(20));
    port.abort();
    assert_eq!(handle.join().unwrap(), Err(IoError::Abort));
}

#[test]
fn test_read_timeout() {
    let port = Port::ring_buffer("idle", 16).unwrap();
    let start = Instant::now();
    let mut buf = [0u8; 4];
    assert_eq!(port.read(&mut buf, Some(Duration::from_millis(20))), Err(IoError::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(15));

    // A zero timeout never blocks.
    port.write(&[9, 9], None).unwrap();
    assert_eq!(port.read(&mut buf, Some(Duration::ZERO)), Ok(2));
}

#[test]
fn test_frame_pool_backpressure() {
    let port = Port::frame_pool("frames", 32, 2).unwrap();
    assert_eq!(port.kind(), PortKind::FramePool);
    port.write(&[1; 32], None).unwrap();
    port.write(&[2; 16], None).unwrap();
    assert_eq!(port.write(&[3; 8], Some(Duration::from_millis(10))), Err(IoError::Timeout));

    let mut buf = [0u8; 32];
    assert_eq!(port.read(&mut buf, None), Ok(32));
    assert_eq!(port.write(&[3; 8], Some(Duration::from_millis(10))), Ok(8));
    assert_eq!(port.read(&mut buf, None), Ok(16));
    assert_eq!(&buf[..16], &[2; 16]);
}

#[test]
fn test_callback_port_drives_closure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let port = Port::callback_reader("drv", move |buf: &mut [u8], _timeout| {
        counted.fetch_add(1, Ordering::Relaxed);
        buf.fill(0xAB);
        Ok(buf.len())
    });
    assert_eq!(port.kind(), PortKind::Callback);

    let mut buf = [0u8; 10];
    assert_eq!(port.read(&mut buf, None), Ok(10));
    assert_eq!(buf, [0xAB; 10]);
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    port.abort();
    assert_eq!(port.read(&mut buf, None), Err(IoError::Abort));
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn test_clones_share_backing_store() {
    let a = Port::ring_buffer("shared", 32).unwrap();
    let b = a.clone();
    assert!(a.same_port(&b));
    a.write(&[5; 10], None).unwrap();
    assert_eq!(b.filled_size(), 10);
    assert_eq!(b.free_size(), 22);
}
