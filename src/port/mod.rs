//! Ports: bounded hand-off channels between elements.
//!
//! A [`Port`] is a cheap, clonable handle over one of three backing stores:
//!
//! - [`RingBuffer`]: byte-oriented FIFO, blocking with timeout
//! - [`CallbackPort`]: forwards reads or writes to a driver closure
//! - [`FramePool`]: fixed-size frame nodes recycled between one writer and one reader
//!
//! Every blocking call can be interrupted with [`Port::abort`], which is how an
//! element task stuck in I/O is released during shutdown. The backing store
//! is dropped exactly once, when the last handle goes away.
//!
//! # Example
//!
//! ```rust
//! use audioflow::port::Port;
//! use std::time::Duration;
//!
//! let port = Port::ring_buffer("mic_out_rb", 1024).unwrap();
//! port.write(&[1, 2, 3, 4], None).unwrap();
//!
//! let mut buf = [0u8; 4];
//! let n = port.read(&mut buf, Some(Duration::from_millis(10))).unwrap();
//! assert_eq!(n, 4);
//! ```

mod callback;
mod frame_pool;
mod ring;

pub use callback::{CallbackPort, ReadCallback, WriteCallback};
pub use frame_pool::{FramePool, FramePoolStats};
pub use ring::{RingBuffer, RingStats};

use crate::error::{IoResult, Result};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Backing kind of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PortKind {
    /// Byte ring buffer.
    #[default]
    RingBuffer,
    /// Driver callback.
    Callback,
    /// Fixed-size frame pool.
    FramePool,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::RingBuffer => write!(f, "rb"),
            PortKind::Callback => write!(f, "cb"),
            PortKind::FramePool => write!(f, "fb"),
        }
    }
}

/// Operations every port backing store provides.
///
/// `timeout` of `None` blocks until the transfer can make progress;
/// `Some(Duration::ZERO)` never blocks.
pub trait PortBackend: Send + Sync {
    /// Backing kind.
    fn kind(&self) -> PortKind;

    /// Read into `buf`.
    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> IoResult;

    /// Write `buf`.
    fn write(&self, buf: &[u8], timeout: Option<Duration>) -> IoResult;

    /// Force current and future blocking transfers to return `Abort`.
    fn abort(&self);

    /// Clear buffered content and the abort and done flags.
    fn reset(&self);

    /// Mark the end of the stream.
    fn write_done(&self);

    /// Total capacity (bytes for ring buffers, nodes for frame pools).
    fn size(&self) -> usize;

    /// Currently filled amount, in the same unit as [`size`](Self::size).
    fn filled_size(&self) -> usize;

    /// Currently free amount, in the same unit as [`size`](Self::size).
    fn free_size(&self) -> usize {
        self.size().saturating_sub(self.filled_size())
    }
}

/// A shared handle to a port.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

struct PortInner {
    tag: Mutex<String>,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
    backend: Box<dyn PortBackend>,
}

impl Port {
    /// Wrap a backing store in a port handle.
    pub fn new(tag: impl Into<String>, backend: impl PortBackend + 'static) -> Self {
        Self {
            inner: Arc::new(PortInner {
                tag: Mutex::new(tag.into()),
                read_timeout: Mutex::new(None),
                write_timeout: Mutex::new(None),
                backend: Box::new(backend),
            }),
        }
    }

    /// Create a ring buffer port of `size` bytes. Fails on a zero size.
    pub fn ring_buffer(tag: impl Into<String>, size: usize) -> Result<Self> {
        Ok(Self::new(tag, RingBuffer::new(size)?))
    }

    /// Create a frame pool port with `node_num` frames of `node_size` bytes.
    pub fn frame_pool(tag: impl Into<String>, node_size: usize, node_num: usize) -> Result<Self> {
        Ok(Self::new(tag, FramePool::new(node_size, node_num)?))
    }

    /// Create a callback port that reads through a driver closure.
    pub fn callback_reader<F>(tag: impl Into<String>, read: F) -> Self
    where
        F: FnMut(&mut [u8], Option<Duration>) -> IoResult + Send + 'static,
    {
        Self::new(tag, CallbackPort::reader(read))
    }

    /// Create a callback port that writes through a driver closure.
    pub fn callback_writer<F>(tag: impl Into<String>, write: F) -> Self
    where
        F: FnMut(&[u8], Option<Duration>) -> IoResult + Send + 'static,
    {
        Self::new(tag, CallbackPort::writer(write))
    }

    /// Get the port's tag.
    pub fn tag(&self) -> String {
        self.inner.tag.lock().unwrap().clone()
    }

    /// Rename the port.
    pub fn set_tag(&self, tag: impl Into<String>) {
        *self.inner.tag.lock().unwrap() = tag.into();
    }

    /// Get the backing kind.
    pub fn kind(&self) -> PortKind {
        self.inner.backend.kind()
    }

    /// Read with an explicit timeout.
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> IoResult {
        let result = self.inner.backend.read(buf, timeout);
        if let Err(e) = result {
            tracing::trace!(port = %self.tag(), error = %e, "port read");
        }
        result
    }

    /// Write with an explicit timeout.
    pub fn write(&self, buf: &[u8], timeout: Option<Duration>) -> IoResult {
        let result = self.inner.backend.write(buf, timeout);
        match result {
            Ok(n) if n != buf.len() => {
                tracing::trace!(port = %self.tag(), written = n, len = buf.len(), "short port write");
            }
            Err(e) => tracing::trace!(port = %self.tag(), error = %e, "port write"),
            _ => {}
        }
        result
    }

    /// Read using the port's configured read timeout.
    pub fn read_default(&self, buf: &mut [u8]) -> IoResult {
        let timeout = self.read_timeout();
        self.read(buf, timeout)
    }

    /// Write using the port's configured write timeout.
    pub fn write_default(&self, buf: &[u8]) -> IoResult {
        let timeout = self.write_timeout();
        self.write(buf, timeout)
    }

    /// Abort any in-flight or future blocking transfer. Idempotent.
    pub fn abort(&self) {
        tracing::trace!(port = %self.tag(), "abort");
        self.inner.backend.abort();
    }

    /// Clear buffered content and the abort and done flags.
    ///
    /// Only meaningful while the elements on both sides are not running.
    pub fn reset(&self) {
        self.inner.backend.reset();
    }

    /// Mark the end of the stream. Readers drain what is buffered, then see `Done`.
    pub fn write_done(&self) {
        self.inner.backend.write_done();
    }

    /// Total capacity.
    pub fn size(&self) -> usize {
        self.inner.backend.size()
    }

    /// Currently filled amount.
    pub fn filled_size(&self) -> usize {
        self.inner.backend.filled_size()
    }

    /// Currently free amount.
    pub fn free_size(&self) -> usize {
        self.inner.backend.free_size()
    }

    /// Default read timeout (`None` blocks forever).
    pub fn read_timeout(&self) -> Option<Duration> {
        *self.inner.read_timeout.lock().unwrap()
    }

    /// Set the default read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.inner.read_timeout.lock().unwrap() = timeout;
    }

    /// Default write timeout (`None` blocks forever).
    pub fn write_timeout(&self) -> Option<Duration> {
        *self.inner.write_timeout.lock().unwrap()
    }

    /// Set the default write timeout.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.inner.write_timeout.lock().unwrap() = timeout;
    }

    /// Returns `true` if both handles refer to the same port.
    pub fn same_port(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("tag", &self.tag())
            .field("kind", &self.kind())
            .field("size", &self.size())
            .field("filled", &self.filled_size())
            .finish()
    }
}

// ============================================================================
// Blocking helpers shared by the backing stores
// ============================================================================

pub(crate) fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

/// Wait on `cv` until notified or `deadline` passes.
///
/// Returns the guard and whether the deadline has passed.
pub(crate) fn wait_until<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, T>, bool) {
    match deadline {
        None => (cv.wait(guard).unwrap(), false),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return (guard, true);
            }
            let (guard, _) = cv.wait_timeout(guard, d - now).unwrap();
            let expired = Instant::now() >= d;
            (guard, expired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoError;

    #[test]
    fn test_port_tag_and_kind() {
        let port = Port::ring_buffer("a_out_rb", 64).unwrap();
        assert_eq!(port.tag(), "a_out_rb");
        assert_eq!(port.kind(), PortKind::RingBuffer);
        port.set_tag("renamed");
        assert_eq!(port.tag(), "renamed");
    }

    #[test]
    fn test_default_timeouts() {
        let port = Port::ring_buffer("rb", 64).unwrap();
        assert_eq!(port.read_timeout(), None);
        port.set_read_timeout(Some(Duration::from_millis(5)));

        let mut buf = [0u8; 8];
        assert_eq!(port.read_default(&mut buf), Err(IoError::Timeout));
    }

    #[test]
    fn test_same_port() {
        let a = Port::frame_pool("fb", 16, 2).unwrap();
        let b = a.clone();
        let c = Port::frame_pool("fb", 16, 2).unwrap();
        assert!(a.same_port(&b));
        assert!(!a.same_port(&c));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        use crate::error::Error;

        assert!(matches!(Port::ring_buffer("rb", 0), Err(Error::InvalidConfig(_))));
        assert!(matches!(Port::frame_pool("fb", 0, 4), Err(Error::InvalidConfig(_))));
        assert!(matches!(Port::frame_pool("fb", 16, 0), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_callback_kind() {
        let port = Port::callback_reader("x_in_cb", |buf, _| Ok(buf.len()));
        assert_eq!(port.kind(), PortKind::Callback);
        let mut buf = [0u8; 10];
        assert_eq!(port.read(&mut buf, None), Ok(10));
    }
}
