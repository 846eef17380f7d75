//! Elements: threaded processing nodes connected by ports.
//!
//! An [`Element`] pairs a set of [`AudioElement`] callbacks with the
//! machinery to drive them: an input port, an output port, optional indexed
//! multi-input and multi-output ports, a state machine and a task thread.
//!
//! # Lifecycle
//!
//! ```text
//!  Init ──run──► Initializing ──open ok──► Running ──process Ok(0)/Done──► Finished
//!                     │                     │  ▲
//!                  open err              pause resume
//!                     ▼                     ▼  │
//!                   Error                  Paused
//!
//!  stop (any running state) ──► Stopped        reset_state ──► Init
//! ```
//!
//! The task is created by the first [`run`](Element::run) and survives
//! stop, finish and pause; only [`terminate`](Element::terminate) or
//! [`deinit`](Element::deinit) end it. Every state change that matters to
//! the outside world is reported as an [`ElementStatus`] through the
//! element's event route: a synchronous callback if one is set, otherwise
//! the listener queue.
//!
//! # Example
//!
//! ```rust
//! use audioflow::element::{Element, ElementConfig, ElementState, from_process};
//! use audioflow::port::Port;
//! use std::time::Duration;
//!
//! let el = Element::new(
//!     ElementConfig::new("copy").with_buffer_len(64),
//!     from_process(|ctx, buf| {
//!         let n = ctx.input(buf)?;
//!         ctx.output(&buf[..n])
//!     }),
//! )
//! .unwrap();
//!
//! let input = Port::ring_buffer("in", 256).unwrap();
//! let output = Port::ring_buffer("out", 256).unwrap();
//! el.set_input_port(Some(input.clone()));
//! el.set_output_port(Some(output.clone()));
//!
//! el.run().unwrap();
//! input.write(&[7u8; 64], None).unwrap();
//! input.write_done();
//!
//! let mut buf = [0u8; 64];
//! assert_eq!(output.read(&mut buf, Some(Duration::from_secs(1))), Ok(64));
//! el.wait_for_stop().unwrap();
//! assert_eq!(el.state(), ElementState::Finished);
//! ```

mod config;
mod context;
mod info;
mod inner;
mod signal;
mod state;
mod task;
mod traits;

pub use config::{
    DEFAULT_BUFFER_LEN, DEFAULT_MAX_WAIT, DEFAULT_OUT_FB_NODE_NUM, DEFAULT_OUT_FB_NODE_SIZE,
    DEFAULT_OUT_RB_SIZE, ElementConfig,
};
pub use context::ElementContext;
pub use info::{AudioInfo, CodecFormat};
pub use state::{ElementState, ElementStatus};
pub use traits::{AudioElement, ProcessFn, from_process};

pub(crate) use state::TaskCommand;

use crate::error::{Error, IoResult, Result};
use crate::event::{EventIface, EventMessage};
use crate::port::{Port, PortKind};
use inner::ElementInner;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Global element ID counter.
static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an element instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ElementId(pub u64);

impl ElementId {
    /// Generate a new unique element ID.
    pub fn new() -> Self {
        Self(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ElementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Element({})", self.0)
    }
}

/// Synchronous per-element event hook; takes precedence over a listener.
pub type EventCallback = Box<dyn FnMut(&EventMessage) + Send>;

/// Runs `deinit` when the last [`Element`] handle is dropped.
struct DeinitGuard {
    inner: Arc<ElementInner>,
}

impl Drop for DeinitGuard {
    fn drop(&mut self) {
        self.inner.deinit();
    }
}

/// A clonable handle to an element.
///
/// All clones refer to the same element. The element is deinitialized
/// when the last handle is dropped, unless [`deinit`](Self::deinit) ran
/// first. The task thread never keeps the element alive on its own.
#[derive(Clone)]
pub struct Element {
    inner: Arc<ElementInner>,
    _guard: Arc<DeinitGuard>,
}

impl Element {
    /// Create an element from a config and its callbacks.
    ///
    /// Driver `read`/`write` functions in the config become owned callback
    /// ports tagged `<tag>_in_cb` and `<tag>_out_cb`. Nothing is spawned
    /// until [`run`](Self::run).
    pub fn new(config: ElementConfig, callbacks: impl AudioElement + 'static) -> Result<Self> {
        Self::from_boxed(config, Box::new(callbacks))
    }

    /// Create an element from boxed callbacks.
    pub fn from_boxed(config: ElementConfig, callbacks: Box<dyn AudioElement>) -> Result<Self> {
        let inner = Arc::new(ElementInner::new(config, callbacks)?);
        tracing::debug!(element = %inner.tag(), id = %inner.id, "element created");
        Ok(Self {
            _guard: Arc::new(DeinitGuard {
                inner: Arc::clone(&inner),
            }),
            inner,
        })
    }

    /// Unique id.
    pub fn id(&self) -> ElementId {
        self.inner.id
    }

    /// Current tag.
    pub fn tag(&self) -> String {
        self.inner.tag()
    }

    /// Rename the element.
    pub fn set_tag(&self, tag: &str) {
        self.inner.set_tag(tag);
    }

    /// Returns `true` if both handles refer to the same element.
    pub fn same_element(&self, other: &Element) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the element: create its task if needed, then open it.
    ///
    /// Returns once `open` has completed. Fails if `open` failed, in which
    /// case `ErrorOpen` has been reported.
    pub fn run(&self) -> Result<()> {
        self.inner.run()
    }

    /// Resume a stopped or paused element.
    ///
    /// With a non-zero `threshold` in `[0, 1]`, also waits until the output
    /// port holds `threshold * size`.
    pub fn resume(&self, threshold: f32, timeout: Option<Duration>) -> Result<()> {
        self.inner.resume(threshold, timeout)
    }

    /// Pause a running element. Its task stays alive.
    pub fn pause(&self) -> Result<()> {
        self.inner.pause()
    }

    /// Request a stop. Aborts the element's ports so blocked I/O returns.
    ///
    /// Does not wait; follow with [`wait_for_stop`](Self::wait_for_stop).
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    /// Wait up to [`DEFAULT_MAX_WAIT`] for the element to stop.
    pub fn wait_for_stop(&self) -> Result<()> {
        self.inner.wait_for_stop(Some(DEFAULT_MAX_WAIT))
    }

    /// Wait up to `timeout` for the element to stop (`None` waits forever).
    pub fn wait_for_stop_ms(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.wait_for_stop(timeout)
    }

    /// End the element task, waiting up to [`DEFAULT_MAX_WAIT`].
    pub fn terminate(&self) -> Result<()> {
        self.inner.terminate(Some(DEFAULT_MAX_WAIT))
    }

    /// End the element task, waiting up to `timeout`.
    pub fn terminate_with_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.terminate(timeout)
    }

    /// Stop, terminate and release the element. Idempotent.
    ///
    /// Calls `destroy` on the callbacks once and releases every port handle;
    /// ports shared with other elements stay alive through their other handles.
    pub fn deinit(&self) {
        self.inner.deinit();
    }

    /// Force the state back to `Init` without touching the task.
    pub fn reset_state(&self) {
        self.inner.set_state(ElementState::Init);
    }

    /// Current state.
    pub fn state(&self) -> ElementState {
        self.inner.state()
    }

    /// Returns `true` while the element is processing.
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Returns `true` while a stop request is pending.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Returns `true` once [`deinit`](Self::deinit) has run.
    pub fn is_deinited(&self) -> bool {
        self.inner.deinited.load(Ordering::Acquire)
    }

    /// Call the element's `seek` callback.
    pub fn seek(&self, data: &[u8], out: &mut [u8]) -> Result<usize> {
        self.inner.seek(data, out)
    }

    /// Wait until the output port holds more than `size`
    /// (bytes for ring buffers, frames for frame pools).
    pub fn wait_for_buffer(&self, size: usize, timeout: Option<Duration>) -> Result<()> {
        self.inner.wait_for_buffer(size, timeout)
    }

    // ========================================================================
    // Ports
    // ========================================================================

    /// Set or clear the input port.
    pub fn set_input_port(&self, port: Option<Port>) {
        let mut ports = self.inner.ports.lock().unwrap();
        if let Some(port) = &port {
            self.inner.io.lock().unwrap().in_type = port.kind();
        }
        ports.input = port;
    }

    /// Get the input port.
    pub fn input_port(&self) -> Option<Port> {
        self.inner.ports.lock().unwrap().input.clone()
    }

    /// Set or clear the output port.
    pub fn set_output_port(&self, port: Option<Port>) {
        let mut ports = self.inner.ports.lock().unwrap();
        if let Some(port) = &port {
            self.inner.io.lock().unwrap().out_type = port.kind();
        }
        ports.output = port;
    }

    /// Get the output port.
    pub fn output_port(&self) -> Option<Port> {
        self.inner.output_port()
    }

    /// Set or clear multi-input slot `index`.
    pub fn set_multi_input_port(&self, port: Option<Port>, index: usize) -> Result<()> {
        let mut ports = self.inner.ports.lock().unwrap();
        let max = ports.multi_in.len();
        let slot = ports
            .multi_in
            .get_mut(index)
            .ok_or(Error::PortIndex { index, max })?;
        *slot = port;
        Ok(())
    }

    /// Get multi-input slot `index`.
    pub fn multi_input_port(&self, index: usize) -> Option<Port> {
        self.inner.ports.lock().unwrap().multi_in.get(index).cloned().flatten()
    }

    /// Set or clear multi-output slot `index`.
    pub fn set_multi_output_port(&self, port: Option<Port>, index: usize) -> Result<()> {
        let mut ports = self.inner.ports.lock().unwrap();
        let max = ports.multi_out.len();
        let slot = ports
            .multi_out
            .get_mut(index)
            .ok_or(Error::PortIndex { index, max })?;
        *slot = port;
        Ok(())
    }

    /// Get multi-output slot `index`.
    pub fn multi_output_port(&self, index: usize) -> Option<Port> {
        self.inner.ports.lock().unwrap().multi_out.get(index).cloned().flatten()
    }

    /// Number of multi-input slots.
    pub fn multi_input_max(&self) -> usize {
        self.inner.ports.lock().unwrap().multi_in.len()
    }

    /// Number of multi-output slots.
    pub fn multi_output_max(&self) -> usize {
        self.inner.ports.lock().unwrap().multi_out.len()
    }

    /// Abort the input and multi-input ports.
    pub fn abort_input_port(&self) {
        self.inner.abort_input_ports();
    }

    /// Abort the output and multi-output ports.
    pub fn abort_output_port(&self) {
        self.inner.abort_output_ports();
    }

    /// Reset the input and multi-input ports.
    pub fn reset_input_port(&self) {
        self.inner.reset_input_ports();
    }

    /// Reset the output and multi-output ports.
    pub fn reset_output_port(&self) {
        self.inner.reset_output_ports();
    }

    /// Mark the end of stream on the output and multi-output ports.
    pub fn set_port_done(&self) {
        self.inner.set_port_done();
    }

    /// Kind of the input port.
    pub fn in_type(&self) -> PortKind {
        self.inner.io.lock().unwrap().in_type
    }

    /// Kind of the output port, and of the port created when linking.
    pub fn out_type(&self) -> PortKind {
        self.inner.io.lock().unwrap().out_type
    }

    /// Size of the ring buffer created for this element when linking.
    pub fn output_ringbuf_size(&self) -> usize {
        self.inner.io.lock().unwrap().out_rb_size
    }

    /// Set the size of the ring buffer created when linking; `0` uses the pipeline's default.
    pub fn set_output_ringbuf_size(&self, size: usize) {
        self.inner.io.lock().unwrap().out_rb_size = size;
    }

    /// Frame pool geometry created for this element when linking.
    pub fn output_framebuf_size(&self) -> (usize, usize) {
        let io = self.inner.io.lock().unwrap();
        (io.out_fb_node_size, io.out_fb_node_num)
    }

    /// Set the frame pool geometry created when linking.
    pub fn set_output_framebuf_size(&self, node_size: usize, node_num: usize) -> Result<()> {
        if node_size == 0 || node_num == 0 {
            return Err(Error::InvalidConfig(
                "frame pool node size and count must be > 0".into(),
            ));
        }
        let mut io = self.inner.io.lock().unwrap();
        io.out_fb_node_size = node_size;
        io.out_fb_node_num = node_num;
        Ok(())
    }

    /// Set the input timeout.
    pub fn set_input_timeout(&self, timeout: Option<Duration>) {
        self.inner.io.lock().unwrap().input_timeout = timeout;
    }

    /// Set the output timeout.
    pub fn set_output_timeout(&self, timeout: Option<Duration>) {
        self.inner.io.lock().unwrap().output_timeout = timeout;
    }

    // ========================================================================
    // Task-less I/O
    // ========================================================================

    /// Read from the input port, as a callback would.
    pub fn input(&self, buf: &mut [u8]) -> IoResult {
        self.inner.input(buf)
    }

    /// Write to the output port, as a callback would.
    pub fn output(&self, buf: &[u8]) -> IoResult {
        self.inner.output(buf)
    }

    /// Read from multi-input slot `index`.
    pub fn multi_input(&self, buf: &mut [u8], index: usize, timeout: Option<Duration>) -> IoResult {
        self.inner.multi_input(buf, index, timeout)
    }

    /// Write to every connected multi-output slot.
    pub fn multi_output(&self, buf: &[u8], timeout: Option<Duration>) -> IoResult {
        self.inner.multi_output(buf, timeout)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Route reports to `iface`.
    pub fn set_listener(&self, iface: &EventIface) {
        self.inner.route.lock().unwrap().listener = Some(iface.sender());
    }

    /// Stop routing reports to a listener.
    pub fn remove_listener(&self) {
        self.inner.route.lock().unwrap().listener = None;
    }

    /// Deliver reports synchronously to `callback` instead of the listener.
    ///
    /// The callback runs on whichever thread reports, usually the element task.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: FnMut(&EventMessage) + Send + 'static,
    {
        self.inner.route.lock().unwrap().callback = Some(Arc::new(Mutex::new(Box::new(callback))));
    }

    /// Remove the event callback.
    pub fn clear_event_callback(&self) {
        self.inner.route.lock().unwrap().callback = None;
    }

    /// Report a status.
    pub fn report_status(&self, status: ElementStatus) {
        self.inner.report_status(status);
    }

    /// Report the current info as music info.
    pub fn report_info(&self) {
        self.inner.report_info();
    }

    /// Report the codec format.
    pub fn report_codec_fmt(&self) {
        self.inner.report_codec_fmt();
    }

    /// Report the current position.
    pub fn report_pos(&self) {
        self.inner.report_pos();
    }

    // ========================================================================
    // Info
    // ========================================================================

    /// Snapshot of the element info.
    pub fn info(&self) -> AudioInfo {
        self.inner.info.lock().unwrap().clone()
    }

    /// Replace the element info.
    pub fn set_info(&self, info: AudioInfo) {
        *self.inner.info.lock().unwrap() = info;
    }

    /// Set the PCM format fields.
    pub fn set_music_info(&self, sample_rates: u32, channels: u8, bits: u8) {
        let mut info = self.inner.info.lock().unwrap();
        info.sample_rates = sample_rates;
        info.channels = channels;
        info.bits = bits;
    }

    /// Set the codec format.
    pub fn set_codec_fmt(&self, fmt: CodecFormat) {
        self.inner.info.lock().unwrap().codec_fmt = fmt;
    }

    /// Set the URI.
    pub fn set_uri(&self, uri: Option<&str>) {
        self.inner.info.lock().unwrap().uri = uri.map(str::to_string);
    }

    /// Get the URI.
    pub fn uri(&self) -> Option<String> {
        self.inner.info.lock().unwrap().uri.clone()
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.inner.id)
            .field("tag", &self.tag())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
