//! Driver-callback port.

use super::{PortBackend, PortKind};
use crate::error::{IoError, IoResult};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Driver read function. The closure owns whatever context the driver needs.
pub type ReadCallback = Box<dyn FnMut(&mut [u8], Option<Duration>) -> IoResult + Send>;

/// Driver write function.
pub type WriteCallback = Box<dyn FnMut(&[u8], Option<Duration>) -> IoResult + Send>;

/// A port that forwards transfers to a driver closure.
///
/// A callback port holds no data of its own, so [`size`](PortBackend::size)
/// is always zero. Once aborted, transfers return `Abort` without calling
/// the driver until the port is reset.
pub struct CallbackPort {
    read: Option<Mutex<ReadCallback>>,
    write: Option<Mutex<WriteCallback>>,
    aborted: AtomicBool,
    done: AtomicBool,
}

impl CallbackPort {
    /// Create a read-side callback port.
    pub fn reader<F>(read: F) -> Self
    where
        F: FnMut(&mut [u8], Option<Duration>) -> IoResult + Send + 'static,
    {
        Self {
            read: Some(Mutex::new(Box::new(read))),
            write: None,
            aborted: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// Create a write-side callback port.
    pub fn writer<F>(write: F) -> Self
    where
        F: FnMut(&[u8], Option<Duration>) -> IoResult + Send + 'static,
    {
        Self {
            read: None,
            write: Some(Mutex::new(Box::new(write))),
            aborted: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// Returns `true` if the port has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

impl PortBackend for CallbackPort {
    fn kind(&self) -> PortKind {
        PortKind::Callback
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> IoResult {
        if self.is_aborted() {
            return Err(IoError::Abort);
        }
        if self.done.load(Ordering::Acquire) {
            return Err(IoError::Done);
        }
        match &self.read {
            Some(read) => (read.lock().unwrap())(buf, timeout),
            None => Err(IoError::Fail),
        }
    }

    fn write(&self, buf: &[u8], timeout: Option<Duration>) -> IoResult {
        if self.is_aborted() {
            return Err(IoError::Abort);
        }
        match &self.write {
            Some(write) => (write.lock().unwrap())(buf, timeout),
            None => Err(IoError::Fail),
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    fn reset(&self) {
        self.aborted.store(false, Ordering::Release);
        self.done.store(false, Ordering::Release);
    }

    fn write_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    fn size(&self) -> usize {
        0
    }

    fn filled_size(&self) -> usize {
        0
    }
}
