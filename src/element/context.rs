//! The view of an element handed to its callbacks.

use super::inner::ElementInner;
use super::{AudioInfo, CodecFormat, ElementId, ElementState, ElementStatus};
use crate::error::IoResult;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Runtime context passed to [`AudioElement`](super::AudioElement) callbacks.
///
/// Gives a callback access to its element's ports, info and event route
/// without handing out the element handle itself.
pub struct ElementContext<'a> {
    inner: &'a ElementInner,
}

impl<'a> ElementContext<'a> {
    pub(super) fn new(inner: &'a ElementInner) -> Self {
        Self { inner }
    }

    /// Element tag.
    pub fn tag(&self) -> String {
        self.inner.tag()
    }

    /// Element id.
    pub fn id(&self) -> ElementId {
        self.inner.id
    }

    /// Current state.
    pub fn state(&self) -> ElementState {
        self.inner.state()
    }

    /// Returns `true` once a stop has been requested and not yet handled.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Size of the buffer handed to `process`.
    pub fn buffer_len(&self) -> usize {
        self.inner.buffer_len
    }

    /// Number of multi-input slots.
    pub fn multi_input_max(&self) -> usize {
        self.inner.ports.lock().unwrap().multi_in.len()
    }

    /// Number of multi-output slots.
    pub fn multi_output_max(&self) -> usize {
        self.inner.ports.lock().unwrap().multi_out.len()
    }

    // ------------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------------

    /// Read from the input port using the input timeout.
    ///
    /// A `Fail` result is also reported as `ErrorInput`.
    pub fn input(&self, buf: &mut [u8]) -> IoResult {
        self.inner.input(buf)
    }

    /// Write to the output port using the output timeout.
    ///
    /// A `Fail` result is also reported as `ErrorOutput`.
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

    // ------------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------------

    /// Report a status through the element's event route.
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

    // ------------------------------------------------------------------------
    // Info
    // ------------------------------------------------------------------------

    /// Snapshot of the element info.
    pub fn info(&self) -> AudioInfo {
        self.inner.info.lock().unwrap().clone()
    }

    /// Replace the element info.
    pub fn set_info(&self, info: AudioInfo) {
        *self.inner.info.lock().unwrap() = info;
    }

    fn with_info(&self, f: impl FnOnce(&mut AudioInfo)) {
        f(&mut self.inner.info.lock().unwrap());
    }

    /// Advance the byte position.
    pub fn update_byte_pos(&self, delta: u64) {
        self.with_info(|info| info.byte_pos += delta);
    }

    /// Set the byte position.
    pub fn set_byte_pos(&self, pos: u64) {
        self.with_info(|info| info.byte_pos = pos);
    }

    /// Grow the total byte count.
    pub fn update_total_bytes(&self, delta: u64) {
        self.with_info(|info| info.total_bytes += delta);
    }

    /// Set the total byte count.
    pub fn set_total_bytes(&self, total: u64) {
        self.with_info(|info| info.total_bytes = total);
    }

    /// Set the duration in milliseconds.
    pub fn set_duration(&self, duration: u32) {
        self.with_info(|info| info.duration = duration);
    }

    /// Set the codec format.
    pub fn set_codec_fmt(&self, fmt: CodecFormat) {
        self.with_info(|info| info.codec_fmt = fmt);
    }

    /// Set the PCM format fields.
    pub fn set_music_info(&self, sample_rates: u32, channels: u8, bits: u8) {
        self.with_info(|info| {
            info.sample_rates = sample_rates;
            info.channels = channels;
            info.bits = bits;
        });
    }

    /// Set the bit rate.
    pub fn set_bps(&self, bps: u32) {
        self.with_info(|info| info.bps = bps);
    }

    // ------------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------------

    /// Change the input timeout.
    pub fn set_input_timeout(&self, timeout: Option<Duration>) {
        self.inner.io.lock().unwrap().input_timeout = timeout;
    }

    /// Change the output timeout.
    pub fn set_output_timeout(&self, timeout: Option<Duration>) {
        self.inner.io.lock().unwrap().output_timeout = timeout;
    }
}

impl std::fmt::Debug for ElementContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementContext")
            .field("tag", &self.tag())
            .field("state", &self.state())
            .finish()
    }
}
