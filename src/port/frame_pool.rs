//! Fixed-size frame pool port.
//!
//! Nodes cycle between a free list and a ready list. The writer takes a
//! free node, fills it with one frame and queues it; the reader takes the
//! oldest ready frame, copies it out and returns the node to the free list.
//! Frames are never shared, so a producer can feed several consumers by
//! writing the same frame into several pools.

use super::{PortBackend, PortKind, deadline, wait_until};
use crate::error::{Error, IoError, IoResult, Result};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Statistics about frame pool traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramePoolStats {
    /// Frames queued by the writer.
    pub frames_written: u64,
    /// Frames consumed by the reader.
    pub frames_read: u64,
    /// Frames discarded because the reader's buffer was too small.
    pub frames_discarded: u64,
}

struct Node {
    data: Box<[u8]>,
    len: usize,
}

struct PoolState {
    free: Vec<Node>,
    ready: VecDeque<Node>,
    aborted: bool,
    write_done: bool,
    stats: FramePoolStats,
}

/// A pool of `node_num` frames of `node_size` bytes each.
pub struct FramePool {
    node_size: usize,
    node_num: usize,
    state: Mutex<PoolState>,
    /// Signalled when a frame becomes ready.
    ready: Condvar,
    /// Signalled when a node is returned to the free list.
    free: Condvar,
}

impl FramePool {
    /// Create a pool, allocating every node up front.
    ///
    /// Both the node size and the node count must be non-zero.
    pub fn new(node_size: usize, node_num: usize) -> Result<Self> {
        if node_size == 0 || node_num == 0 {
            return Err(Error::InvalidConfig(format!(
                "frame pool needs non-zero node size and count, got {node_size}x{node_num}"
            )));
        }
        let free = (0..node_num)
            .map(|_| Node {
                data: vec![0u8; node_size].into_boxed_slice(),
                len: 0,
            })
            .collect();

        Ok(Self {
            node_size,
            node_num,
            state: Mutex::new(PoolState {
                free,
                ready: VecDeque::with_capacity(node_num),
                aborted: false,
                write_done: false,
                stats: FramePoolStats::default(),
            }),
            ready: Condvar::new(),
            free: Condvar::new(),
        })
    }

    /// Size of one frame node in bytes.
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Get traffic statistics.
    pub fn stats(&self) -> FramePoolStats {
        self.state.lock().unwrap().stats
    }
}

impl PortBackend for FramePool {
    fn kind(&self) -> PortKind {
        PortKind::FramePool
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> IoResult {
        let deadline = deadline(timeout);
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(mut node) = state.ready.pop_front() {
                let len = node.len;
                let result = if len > buf.len() {
                    tracing::warn!(frame = len, buf = buf.len(), "frame larger than read buffer");
                    state.stats.frames_discarded += 1;
                    Err(IoError::Fail)
                } else {
                    buf[..len].copy_from_slice(&node.data[..len]);
                    state.stats.frames_read += 1;
                    Ok(len)
                };
                node.len = 0;
                state.free.push(node);
                self.free.notify_one();
                return result;
            }
            if state.write_done {
                return Err(IoError::Done);
            }
            if state.aborted {
                return Err(IoError::Abort);
            }

            let (guard, expired) = wait_until(&self.ready, state, deadline);
            state = guard;
            if expired && state.ready.is_empty() && !state.aborted && !state.write_done {
                return Err(IoError::Timeout);
            }
        }
    }

    fn write(&self, buf: &[u8], timeout: Option<Duration>) -> IoResult {
        if buf.len() > self.node_size {
            tracing::warn!(frame = buf.len(), node_size = self.node_size, "frame out of range");
            return Err(IoError::Fail);
        }
        let deadline = deadline(timeout);
        let mut state = self.state.lock().unwrap();

        loop {
            if state.aborted {
                return Err(IoError::Abort);
            }
            if let Some(mut node) = state.free.pop() {
                node.data[..buf.len()].copy_from_slice(buf);
                node.len = buf.len();
                state.ready.push_back(node);
                state.stats.frames_written += 1;
                self.ready.notify_one();
                return Ok(buf.len());
            }

            let (guard, expired) = wait_until(&self.free, state, deadline);
            state = guard;
            if expired && state.free.is_empty() && !state.aborted {
                return Err(IoError::Timeout);
            }
        }
    }

    fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        state.aborted = true;
        self.ready.notify_all();
        self.free.notify_all();
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(mut node) = state.ready.pop_front() {
            node.len = 0;
            state.free.push(node);
        }
        state.aborted = false;
        state.write_done = false;
        self.free.notify_all();
    }

    fn write_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.write_done = true;
        self.ready.notify_all();
    }

    fn size(&self) -> usize {
        self.node_num
    }

    fn filled_size(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }
}
