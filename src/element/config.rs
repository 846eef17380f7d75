//! Element configuration.

use crate::error::{Error, IoResult, Result};
use crate::observability::TracingConfig;
use crate::port::{PortKind, ReadCallback, WriteCallback};
use std::fmt;
use std::time::Duration;

/// Default size of the buffer handed to `process`.
pub const DEFAULT_BUFFER_LEN: usize = 2048;
/// Default output ring buffer size.
pub const DEFAULT_OUT_RB_SIZE: usize = 4096;
/// Default output frame node size.
pub const DEFAULT_OUT_FB_NODE_SIZE: usize = 1024;
/// Default output frame node count.
pub const DEFAULT_OUT_FB_NODE_NUM: usize = 4;
/// Default wait used by control calls that hand off to the task.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(2000);

/// Configuration for creating an [`Element`](super::Element).
///
/// Every field is validated once, by [`Element::new`](super::Element::new).
pub struct ElementConfig {
    /// Element tag; replaced by the pipeline's name on registration.
    pub tag: String,
    /// Size of the buffer handed to `process`.
    pub buffer_len: usize,
    /// Kind of the input port.
    pub in_type: PortKind,
    /// Kind of the output port created when the element is linked.
    pub out_type: PortKind,
    /// Size of a linked ring buffer output; `0` uses the pipeline's default.
    pub out_rb_size: usize,
    /// Node size of a linked frame pool output.
    pub out_fb_node_size: usize,
    /// Node count of a linked frame pool output.
    pub out_fb_node_num: usize,
    /// Number of multi-input slots.
    pub multi_in_port_num: usize,
    /// Number of multi-output slots.
    pub multi_out_port_num: usize,
    /// Run the element on its own thread. Inline elements are driven by their owner.
    pub spawn_task: bool,
    /// Stack size of the element thread (`None` uses the platform default).
    pub stack_size: Option<usize>,
    /// Driver read function; requires `in_type == PortKind::Callback`.
    pub read: Option<ReadCallback>,
    /// Driver write function; requires `out_type == PortKind::Callback`.
    pub write: Option<WriteCallback>,
    /// Input timeout (`None` blocks forever).
    pub input_timeout: Option<Duration>,
    /// Output timeout (`None` blocks forever).
    pub output_timeout: Option<Duration>,
    /// Span toggles; only `element_spans` is consulted.
    pub tracing: TracingConfig,
}

impl Default for ElementConfig {
    fn default() -> Self {
        Self {
            tag: String::new(),
            buffer_len: DEFAULT_BUFFER_LEN,
            in_type: PortKind::RingBuffer,
            out_type: PortKind::RingBuffer,
            out_rb_size: DEFAULT_OUT_RB_SIZE,
            out_fb_node_size: DEFAULT_OUT_FB_NODE_SIZE,
            out_fb_node_num: DEFAULT_OUT_FB_NODE_NUM,
            multi_in_port_num: 0,
            multi_out_port_num: 0,
            spawn_task: true,
            stack_size: None,
            read: None,
            write: None,
            input_timeout: None,
            output_timeout: None,
            tracing: TracingConfig::default(),
        }
    }
}

impl ElementConfig {
    /// Create a config with the given tag and defaults for everything else.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Set the process buffer length.
    pub fn with_buffer_len(mut self, len: usize) -> Self {
        self.buffer_len = len;
        self
    }

    /// Link the output through a ring buffer of `size` bytes.
    pub fn with_out_rb(mut self, size: usize) -> Self {
        self.out_type = PortKind::RingBuffer;
        self.out_rb_size = size;
        self
    }

    /// Link the output through a frame pool.
    pub fn with_out_fb(mut self, node_size: usize, node_num: usize) -> Self {
        self.out_type = PortKind::FramePool;
        self.out_fb_node_size = node_size;
        self.out_fb_node_num = node_num;
        self
    }

    /// Set the number of multi-input and multi-output slots.
    pub fn with_multi_ports(mut self, inputs: usize, outputs: usize) -> Self {
        self.multi_in_port_num = inputs;
        self.multi_out_port_num = outputs;
        self
    }

    /// Make this an inline element without its own thread.
    pub fn inline(mut self) -> Self {
        self.spawn_task = false;
        self
    }

    /// Set the element thread's stack size.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Read input through a driver function.
    pub fn with_read<F>(mut self, read: F) -> Self
    where
        F: FnMut(&mut [u8], Option<Duration>) -> IoResult + Send + 'static,
    {
        self.in_type = PortKind::Callback;
        self.read = Some(Box::new(read));
        self
    }

    /// Write output through a driver function.
    pub fn with_write<F>(mut self, write: F) -> Self
    where
        F: FnMut(&[u8], Option<Duration>) -> IoResult + Send + 'static,
    {
        self.out_type = PortKind::Callback;
        self.write = Some(Box::new(write));
        self
    }

    /// Set the input timeout.
    pub fn with_input_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.input_timeout = timeout;
        self
    }

    /// Set the output timeout.
    pub fn with_output_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.output_timeout = timeout;
        self
    }

    /// Set the span toggles.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.read.is_some() && self.in_type != PortKind::Callback {
            return Err(Error::InvalidConfig(format!(
                "[{}] read callback needs a callback input, got {}",
                self.tag, self.in_type
            )));
        }
        if self.write.is_some() && self.out_type != PortKind::Callback {
            return Err(Error::InvalidConfig(format!(
                "[{}] write callback needs a callback output, got {}",
                self.tag, self.out_type
            )));
        }
        if self.out_type == PortKind::FramePool
            && (self.out_fb_node_size == 0 || self.out_fb_node_num == 0)
        {
            return Err(Error::InvalidConfig(format!(
                "[{}] frame pool output needs non-zero node size and count",
                self.tag
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ElementConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementConfig")
            .field("tag", &self.tag)
            .field("buffer_len", &self.buffer_len)
            .field("in_type", &self.in_type)
            .field("out_type", &self.out_type)
            .field("out_rb_size", &self.out_rb_size)
            .field("out_fb_node_size", &self.out_fb_node_size)
            .field("out_fb_node_num", &self.out_fb_node_num)
            .field("multi_in_port_num", &self.multi_in_port_num)
            .field("multi_out_port_num", &self.multi_out_port_num)
            .field("spawn_task", &self.spawn_task)
            .field("tracing", &self.tracing)
            .field("has_read", &self.read.is_some())
            .field("has_write", &self.write.is_some())
            .finish_non_exhaustive()
    }
}
