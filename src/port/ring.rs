//! Byte ring buffer port.

use super::{PortBackend, PortKind, deadline, wait_until};
use crate::error::{Error, IoError, IoResult, Result};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A bounded byte FIFO with blocking, abortable reads and writes.
///
/// A read returns once the request is filled, the stream is marked done,
/// the port is aborted, or the timeout expires. Whatever was copied before
/// the wait ended is returned as a short read; a wait that copied nothing
/// returns `Timeout`, `Done` or `Abort`.
pub struct RingBuffer {
    state: Mutex<RingState>,
    readable: Condvar,
    writable: Condvar,
}

struct RingState {
    data: VecDeque<u8>,
    capacity: usize,
    aborted: bool,
    write_done: bool,
    stats: RingStats,
}

/// Statistics about ring buffer traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingStats {
    /// Total bytes written.
    pub bytes_written: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Number of times the buffer was aborted.
    pub aborts: u64,
}

impl RingBuffer {
    /// Create a ring buffer holding up to `capacity` bytes.
    ///
    /// A zero capacity is rejected: every write on it would block until aborted.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("ring buffer capacity must be > 0".into()));
        }
        Ok(Self {
            state: Mutex::new(RingState {
                data: VecDeque::with_capacity(capacity),
                capacity,
                aborted: false,
                write_done: false,
                stats: RingStats::default(),
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        })
    }

    /// Get traffic statistics.
    pub fn stats(&self) -> RingStats {
        self.state.lock().unwrap().stats
    }

    /// Read without waiting; returns the number of bytes copied.
    pub fn read_available(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        let n = buf.len().min(state.data.len());
        for (dst, src) in buf[..n].iter_mut().zip(state.data.drain(..n)) {
            *dst = src;
        }
        state.stats.bytes_read += n as u64;
        if n > 0 {
            self.writable.notify_all();
        }
        n
    }
}

impl PortBackend for RingBuffer {
    fn kind(&self) -> PortKind {
        PortKind::RingBuffer
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> IoResult {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = deadline(timeout);
        let mut state = self.state.lock().unwrap();
        let mut copied = 0;

        loop {
            let n = (buf.len() - copied).min(state.data.len());
            if n > 0 {
                for (dst, src) in buf[copied..copied + n].iter_mut().zip(state.data.drain(..n)) {
                    *dst = src;
                }
                copied += n;
                state.stats.bytes_read += n as u64;
                self.writable.notify_all();
            }

            if copied == buf.len() {
                return Ok(copied);
            }
            if state.write_done {
                return if copied > 0 { Ok(copied) } else { Err(IoError::Done) };
            }
            if state.aborted {
                return if copied > 0 { Ok(copied) } else { Err(IoError::Abort) };
            }

            let (guard, expired) = wait_until(&self.readable, state, deadline);
            state = guard;
            if expired && state.data.is_empty() && !state.aborted && !state.write_done {
                return if copied > 0 { Ok(copied) } else { Err(IoError::Timeout) };
            }
        }
    }

    fn write(&self, buf: &[u8], timeout: Option<Duration>) -> IoResult {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = deadline(timeout);
        let mut state = self.state.lock().unwrap();
        let mut written = 0;

        loop {
            if state.aborted {
                return if written > 0 { Ok(written) } else { Err(IoError::Abort) };
            }

            let free = state.capacity - state.data.len();
            let n = (buf.len() - written).min(free);
            if n > 0 {
                state.data.extend(&buf[written..written + n]);
                written += n;
                state.stats.bytes_written += n as u64;
                self.readable.notify_all();
            }

            if written == buf.len() {
                return Ok(written);
            }

            let (guard, expired) = wait_until(&self.writable, state, deadline);
            state = guard;
            if expired && state.data.len() >= state.capacity && !state.aborted {
                return if written > 0 { Ok(written) } else { Err(IoError::Timeout) };
            }
        }
    }

    fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.aborted {
            state.aborted = true;
            state.stats.aborts += 1;
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.data.clear();
        state.aborted = false;
        state.write_done = false;
        self.writable.notify_all();
    }

    fn write_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.write_done = true;
        self.readable.notify_all();
    }

    fn size(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    fn filled_size(&self) -> usize {
        self.state.lock().unwrap().data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ring_write_read() {
        let rb = RingBuffer::new(16).unwrap();
        assert_eq!(rb.write(&[1, 2, 3, 4], None), Ok(4));
        assert_eq!(rb.filled_size(), 4);
        assert_eq!(rb.free_size(), 12);

        let mut buf = [0u8; 4];
        assert_eq!(rb.read(&mut buf, Some(Duration::ZERO)), Ok(4));
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(rb.filled_size(), 0);
    }

    #[test]
    fn test_ring_short_read_on_timeout() {
        let rb = RingBuffer::new(16).unwrap();
        rb.write(&[9, 9], None).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(rb.read(&mut buf, Some(Duration::from_millis(10))), Ok(2));
        assert_eq!(
            rb.read(&mut buf, Some(Duration::from_millis(10))),
            Err(IoError::Timeout)
        );
    }

    #[test]
    fn test_ring_write_timeout_when_full() {
        let rb = RingBuffer::new(4).unwrap();
        assert_eq!(rb.write(&[0; 4], None), Ok(4));
        assert_eq!(
            rb.write(&[0; 2], Some(Duration::from_millis(10))),
            Err(IoError::Timeout)
        );
        assert_eq!(rb.write(&[0; 6], Some(Duration::ZERO)), Err(IoError::Timeout));
    }

    #[test]
    fn test_ring_done_after_drain() {
        let rb = RingBuffer::new(16).unwrap();
        rb.write(&[5, 6, 7], None).unwrap();
        rb.write_done();

        let mut buf = [0u8; 8];
        assert_eq!(rb.read(&mut buf, None), Ok(3));
        assert_eq!(rb.read(&mut buf, None), Err(IoError::Done));

        rb.reset();
        assert_eq!(rb.read(&mut buf, Some(Duration::ZERO)), Err(IoError::Timeout));
    }

    #[test]
    fn test_ring_abort_wakes_blocked_reader() {
        let rb = Arc::new(RingBuffer::new(16).unwrap());
        let reader = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                rb.read(&mut buf, None)
            })
        };

        thread::sleep(Duration::from_millis(20));
        rb.abort();
        assert_eq!(reader.join().unwrap(), Err(IoError::Abort));
        assert_eq!(rb.stats().aborts, 1);

        // Abort latches until reset.
        assert_eq!(rb.write(&[1], None), Err(IoError::Abort));
        rb.reset();
        assert_eq!(rb.write(&[1], None), Ok(1));
    }

    #[test]
    fn test_ring_abort_wakes_blocked_writer() {
        let rb = Arc::new(RingBuffer::new(2).unwrap());
        rb.write(&[0, 0], None).unwrap();
        let writer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || rb.write(&[1, 2], None))
        };

        thread::sleep(Duration::from_millis(20));
        rb.abort();
        assert_eq!(writer.join().unwrap(), Err(IoError::Abort));
    }

    #[test]
    fn test_ring_producer_consumer() {
        let rb = Arc::new(RingBuffer::new(64).unwrap());
        let producer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                for i in 0..100u8 {
                    rb.write(&[i; 10], None).unwrap();
                }
                rb.write_done();
            })
        };

        let mut total = 0;
        let mut buf = [0u8; 10];
        loop {
            match rb.read(&mut buf, None) {
                Ok(n) => total += n,
                Err(IoError::Done) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        producer.join().unwrap();
        assert_eq!(total, 1000);
        assert_eq!(rb.stats().bytes_read, 1000);
    }
}
