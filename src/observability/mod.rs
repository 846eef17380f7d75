//! Observability features: metrics and tracing.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `audioflow_frames_processed` | Counter | Process calls that produced data |
//! | `audioflow_bytes_in` | Counter | Bytes read from element inputs |
//! | `audioflow_bytes_out` | Counter | Bytes written to element outputs |
//! | `audioflow_status_reports` | Counter | Status reports, labelled by status |
//! | `audioflow_events_dropped` | Counter | Events dropped on a full listener queue |
//! | `audioflow_ref_zero_fill` | Counter | Echo reference frames zero-filled |
//! | `audioflow_vad_transitions` | Counter | Voice activity transitions |
//! | `audioflow_port_filled_bytes` | Gauge | Buffered amount in a port |
//! | `audioflow_process_time_ns` | Histogram | Time per process call |
//!
//! ## Tracing
//!
//! Every element task runs inside an `element` span, every service
//! listener inside a `listener` span and every pipeline control call inside
//! a `pipeline` span. Each config carries a [`TracingConfig`] that can turn
//! its span off. The crate never installs a subscriber.

mod metrics;
mod tracing_support;

pub use metrics::{
    ElementMetrics, TimerGuard, init_metrics, record_event_dropped, record_port_filled,
    record_ref_zero_fill, record_status_report, record_vad_transition,
};
pub use tracing_support::{
    TracingConfig, span_element, span_listener, span_pipeline, trace_state_change,
};
