//! Metrics collection using metrics-rs.

use metrics::{Counter, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FRAMES_PROCESSED: &str = "audioflow_frames_processed";
const BYTES_IN: &str = "audioflow_bytes_in";
const BYTES_OUT: &str = "audioflow_bytes_out";
const STATUS_REPORTS: &str = "audioflow_status_reports";
const EVENTS_DROPPED: &str = "audioflow_events_dropped";
const REF_ZERO_FILL: &str = "audioflow_ref_zero_fill";
const VAD_TRANSITIONS: &str = "audioflow_vad_transitions";
const PORT_FILLED_BYTES: &str = "audioflow_port_filled_bytes";
const PROCESS_TIME_NS: &str = "audioflow_process_time_ns";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        FRAMES_PROCESSED,
        Unit::Count,
        "Process callbacks that produced data"
    );
    metrics::describe_counter!(BYTES_IN, Unit::Bytes, "Bytes read from element inputs");
    metrics::describe_counter!(BYTES_OUT, Unit::Bytes, "Bytes written to element outputs");
    metrics::describe_counter!(
        STATUS_REPORTS,
        Unit::Count,
        "Status reports emitted by elements"
    );
    metrics::describe_counter!(
        EVENTS_DROPPED,
        Unit::Count,
        "Event messages dropped because the listener queue was full"
    );
    metrics::describe_counter!(
        REF_ZERO_FILL,
        Unit::Count,
        "Echo reference frames zero-filled after a short read"
    );
    metrics::describe_counter!(
        VAD_TRANSITIONS,
        Unit::Count,
        "Voice activity state transitions"
    );
    metrics::describe_gauge!(PORT_FILLED_BYTES, Unit::Bytes, "Buffered amount in a port");
    metrics::describe_histogram!(
        PROCESS_TIME_NS,
        Unit::Nanoseconds,
        "Time spent in one process callback"
    );
}

/// Record a status report.
#[inline]
pub fn record_status_report(element: &str, status: &str) {
    counter!(STATUS_REPORTS, "element" => element.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record an event dropped on a full queue.
#[inline]
pub fn record_event_dropped(element: &str) {
    counter!(EVENTS_DROPPED, "element" => element.to_string()).increment(1);
}

/// Record a zero-filled echo reference frame.
#[inline]
pub fn record_ref_zero_fill(element: &str) {
    counter!(REF_ZERO_FILL, "element" => element.to_string()).increment(1);
}

/// Record a voice activity transition.
#[inline]
pub fn record_vad_transition(element: &str, state: &str) {
    counter!(VAD_TRANSITIONS, "element" => element.to_string(), "state" => state.to_string())
        .increment(1);
}

/// Record the filled amount of a port.
#[inline]
pub fn record_port_filled(port: &str, filled: usize) {
    gauge!(PORT_FILLED_BYTES, "port" => port.to_string()).set(filled as f64);
}

/// Metrics collector for one element, with its labels resolved once.
#[derive(Clone)]
pub struct ElementMetrics {
    element: String,
    frames: Counter,
    bytes_in: Counter,
    bytes_out: Counter,
    process_time: Histogram,
}

impl ElementMetrics {
    /// Create a collector labelled with `element`.
    pub fn new(element: &str) -> Self {
        Self {
            element: element.to_string(),
            frames: counter!(FRAMES_PROCESSED, "element" => element.to_string()),
            bytes_in: counter!(BYTES_IN, "element" => element.to_string()),
            bytes_out: counter!(BYTES_OUT, "element" => element.to_string()),
            process_time: histogram!(PROCESS_TIME_NS, "element" => element.to_string()),
        }
    }

    /// Record a process call that produced data.
    #[inline]
    pub fn record_frame(&self) {
        self.frames.increment(1);
    }

    /// Record bytes read from an input.
    #[inline]
    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.increment(bytes as u64);
    }

    /// Record bytes written to an output.
    #[inline]
    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.increment(bytes as u64);
    }

    /// Record process time.
    #[inline]
    pub fn record_time(&self, duration: Duration) {
        self.process_time.record(duration.as_nanos() as f64);
    }

    /// Start a timer and return a guard that records on drop.
    pub fn start_timer(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// Get the element label.
    pub fn element(&self) -> &str {
        &self.element
    }
}

/// Guard that records process time when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    metrics: &'a ElementMetrics,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_time(self.start.elapsed());
    }
}
