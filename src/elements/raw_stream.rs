//! RawStream: an application-driven pipeline end.
//!
//! A raw stream has no task of its own. The application calls
//! [`RawStream::write`] to feed the first element of a pipeline, or
//! [`RawStream::read`] to drain the last one.

use crate::element::{AudioElement, Element, ElementConfig, ElementContext, ElementStatus};
use crate::error::{IoError, IoResult, Result};
use crate::port::PortKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Direction of a stream element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamType {
    /// Data flows out of the pipeline into the application.
    #[default]
    Reader,
    /// Data flows from the application into the pipeline.
    Writer,
}

/// Configuration for a [`RawStream`].
#[derive(Debug, Clone)]
pub struct RawStreamConfig {
    /// Direction.
    pub stream_type: StreamType,
    /// Kind of the output port created when linked.
    pub out_type: PortKind,
    /// Linked output ring size; `0` uses the pipeline's default.
    pub out_rb_size: usize,
    /// Node size of a linked frame pool output.
    pub out_fb_node_size: usize,
    /// Node count of a linked frame pool output.
    pub out_fb_node_num: usize,
    /// Input timeout for [`RawStream::read`] (`None` blocks forever).
    pub input_timeout: Option<Duration>,
    /// Output timeout for [`RawStream::write`] (`None` blocks forever).
    pub output_timeout: Option<Duration>,
    /// Element tag.
    pub tag: String,
}

impl Default for RawStreamConfig {
    fn default() -> Self {
        Self {
            stream_type: StreamType::Reader,
            out_type: PortKind::RingBuffer,
            out_rb_size: 0,
            out_fb_node_size: crate::element::DEFAULT_OUT_FB_NODE_SIZE,
            out_fb_node_num: crate::element::DEFAULT_OUT_FB_NODE_NUM,
            input_timeout: None,
            output_timeout: None,
            tag: "raw".to_string(),
        }
    }
}

impl RawStreamConfig {
    /// A reader config.
    pub fn reader() -> Self {
        Self::default()
    }

    /// A writer config.
    pub fn writer() -> Self {
        Self {
            stream_type: StreamType::Writer,
            ..Default::default()
        }
    }
}

/// Byte counters of a [`RawStream`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawStreamStats {
    /// Bytes handed to the application.
    pub bytes_read: u64,
    /// Bytes taken from the application.
    pub bytes_written: u64,
}

#[derive(Default)]
struct Counters {
    read: AtomicU64,
    written: AtomicU64,
}

struct RawCallbacks {
    stream_type: StreamType,
    counters: Arc<Counters>,
}

impl AudioElement for RawCallbacks {
    fn process(&mut self, ctx: &ElementContext<'_>, _buf: &mut [u8]) -> IoResult {
        tracing::error!(element = %ctx.tag(), "raw stream is driven by its owner");
        Err(IoError::ProcessFail)
    }

    fn destroy(&mut self) {
        tracing::debug!(
            stream = ?self.stream_type,
            read = self.counters.read.load(Ordering::Relaxed),
            written = self.counters.written.load(Ordering::Relaxed),
            "raw stream destroyed"
        );
    }
}

/// A task-less element moving data between the application and a pipeline.
///
/// # Example
///
/// ```rust
/// use audioflow::elements::{RawStream, RawStreamConfig};
/// use audioflow::port::Port;
///
/// let raw = RawStream::new(RawStreamConfig::writer()).unwrap();
/// raw.element().set_output_port(Some(Port::ring_buffer("out", 64).unwrap()));
/// raw.element().run().unwrap();
///
/// assert_eq!(raw.write(&[1, 2, 3, 4]), Ok(4));
/// assert_eq!(raw.stats().bytes_written, 4);
/// ```
#[derive(Clone)]
pub struct RawStream {
    element: Element,
    stream_type: StreamType,
    counters: Arc<Counters>,
}

impl RawStream {
    /// Create a raw stream element.
    pub fn new(config: RawStreamConfig) -> Result<Self> {
        let mut element_config = ElementConfig::new(config.tag)
            .inline()
            .with_input_timeout(config.input_timeout)
            .with_output_timeout(config.output_timeout);
        element_config = match config.out_type {
            PortKind::FramePool => {
                element_config.with_out_fb(config.out_fb_node_size, config.out_fb_node_num)
            }
            _ => element_config.with_out_rb(config.out_rb_size),
        };
        let counters = Arc::new(Counters::default());
        let element = Element::new(
            element_config,
            RawCallbacks {
                stream_type: config.stream_type,
                counters: Arc::clone(&counters),
            },
        )?;
        Ok(Self {
            element,
            stream_type: config.stream_type,
            counters,
        })
    }

    /// The underlying element, for registering and linking.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Direction of this stream.
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Read from the element's input port.
    ///
    /// End of data reports `STATE_FINISHED`; an abort or failure reports
    /// `STATE_STOPPED`. A timeout reports nothing.
    pub fn read(&self, buf: &mut [u8]) -> IoResult {
        let result = self.element.input(buf);
        if let Ok(n) = result {
            self.counters.read.fetch_add(n as u64, Ordering::Relaxed);
        }
        self.report(result);
        result
    }

    /// Write to the element's output port. Reports like [`read`](Self::read).
    pub fn write(&self, buf: &[u8]) -> IoResult {
        let result = self.element.output(buf);
        if let Ok(n) = result {
            self.counters.written.fetch_add(n as u64, Ordering::Relaxed);
        }
        self.report(result);
        result
    }

    fn report(&self, result: IoResult) {
        match result {
            Ok(0) | Err(IoError::Done) => self.element.report_status(ElementStatus::StateFinished),
            Ok(_) | Err(IoError::Timeout) => {}
            Err(e) => {
                tracing::debug!(element = %self.element.tag(), error = %e, "raw stream stopped");
                self.element.report_status(ElementStatus::StateStopped);
            }
        }
    }

    /// Byte counters.
    pub fn stats(&self) -> RawStreamStats {
        RawStreamStats {
            bytes_read: self.counters.read.load(Ordering::Relaxed),
            bytes_written: self.counters.written.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RawStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStream")
            .field("tag", &self.element.tag())
            .field("type", &self.stream_type)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventIface, EventIfaceConfig};
    use crate::port::Port;

    #[test]
    fn test_reader_reports_finish() {
        let iface = EventIface::new(EventIfaceConfig::default()).unwrap();
        let raw = RawStream::new(RawStreamConfig::reader()).unwrap();
        let port = Port::ring_buffer("in", 16).unwrap();
        raw.element().set_input_port(Some(port.clone()));
        raw.element().set_listener(&iface);
        raw.element().run().unwrap();
        iface.discard();

        port.write(&[7; 8], None).unwrap();
        port.write_done();
        let mut buf = [0u8; 8];
        assert_eq!(raw.read(&mut buf), Ok(8));
        assert!(iface.is_empty());

        assert_eq!(raw.read(&mut buf), Err(IoError::Done));
        let msg = iface.try_listen().unwrap();
        assert_eq!(msg.status(), Some(ElementStatus::StateFinished));
        assert_eq!(raw.stats().bytes_read, 8);
    }

    #[test]
    fn test_writer_reports_stop_on_abort() {
        let iface = EventIface::new(EventIfaceConfig::default()).unwrap();
        let raw = RawStream::new(RawStreamConfig::writer()).unwrap();
        let port = Port::ring_buffer("out", 16).unwrap();
        raw.element().set_output_port(Some(port.clone()));
        raw.element().set_listener(&iface);

        port.abort();
        assert_eq!(raw.write(&[1; 4]), Err(IoError::Abort));
        let msg = iface.try_listen().unwrap();
        assert_eq!(msg.status(), Some(ElementStatus::StateStopped));
    }

    #[test]
    fn test_timeout_reports_nothing() {
        let iface = EventIface::new(EventIfaceConfig::default()).unwrap();
        let config = RawStreamConfig {
            input_timeout: Some(Duration::from_millis(5)),
            ..RawStreamConfig::reader()
        };
        let raw = RawStream::new(config).unwrap();
        raw.element().set_input_port(Some(Port::ring_buffer("in", 16).unwrap()));
        raw.element().set_listener(&iface);

        let mut buf = [0u8; 4];
        assert_eq!(raw.read(&mut buf), Err(IoError::Timeout));
        assert!(iface.is_empty());
    }
}
