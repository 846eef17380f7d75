//! Task state bits shared between an element handle and its task.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub(crate) const STOPPED: u8 = 1 << 0;
pub(crate) const RESUMED: u8 = 1 << 1;
pub(crate) const PAUSED: u8 = 1 << 2;
pub(crate) const BUFFER_REACH_LEVEL: u8 = 1 << 3;
pub(crate) const TASK_DESTROYED: u8 = 1 << 4;

/// A set of sticky flags that can be waited on.
#[derive(Default)]
pub(crate) struct StateSignal {
    bits: Mutex<u8>,
    changed: Condvar,
}

impl StateSignal {
    pub(crate) fn set(&self, bits: u8) {
        *self.bits.lock().unwrap() |= bits;
        self.changed.notify_all();
    }

    pub(crate) fn clear(&self, bits: u8) {
        *self.bits.lock().unwrap() &= !bits;
    }

    pub(crate) fn is_set(&self, bits: u8) -> bool {
        *self.bits.lock().unwrap() & bits == bits
    }

    /// Wait until all of `bits` are set. Returns `false` on timeout.
    pub(crate) fn wait(&self, bits: u8, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.bits.lock().unwrap();
        while *guard & bits != bits {
            match deadline {
                None => guard = self.changed.wait(guard).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    guard = self.changed.wait_timeout(guard, d - now).unwrap().0;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_and_clear() {
        let signal = StateSignal::default();
        signal.set(STOPPED | PAUSED);
        assert!(signal.is_set(STOPPED));
        signal.clear(STOPPED);
        assert!(!signal.is_set(STOPPED));
        assert!(signal.is_set(PAUSED));
    }

    #[test]
    fn test_wait_timeout() {
        let signal = StateSignal::default();
        assert!(!signal.wait(RESUMED, Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_wait_wakes() {
        let signal = Arc::new(StateSignal::default());
        let setter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                signal.set(TASK_DESTROYED);
            })
        };
        assert!(signal.wait(TASK_DESTROYED, Some(Duration::from_secs(2))));
        setter.join().unwrap();
    }
}
