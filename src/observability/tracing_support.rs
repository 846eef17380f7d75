//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Which tasks and control calls open a span.
///
/// Carried by `ElementConfig`, `PipelineConfig` and `ListenerConfig`; each
/// consults its own flag when it opens its span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    /// Whether to create spans for pipeline control calls.
    pub pipeline_spans: bool,
    /// Whether element tasks run inside an element span.
    pub element_spans: bool,
    /// Whether listener tasks run inside a listener span.
    pub listener_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            pipeline_spans: true,
            element_spans: true,
            listener_spans: true,
        }
    }
}

impl TracingConfig {
    /// Create a minimal config (pipeline spans only).
    pub fn minimal() -> Self {
        Self {
            pipeline_spans: true,
            element_spans: false,
            listener_spans: false,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            pipeline_spans: false,
            element_spans: false,
            listener_spans: false,
        }
    }

    /// Span for a pipeline, or a disabled span if pipeline spans are off.
    pub fn pipeline(&self, name: &str) -> Span {
        if self.pipeline_spans {
            span_pipeline(name)
        } else {
            Span::none()
        }
    }

    /// Span for an element task, or a disabled span if element spans are off.
    pub fn element(&self, tag: &str) -> Span {
        if self.element_spans {
            span_element(tag)
        } else {
            Span::none()
        }
    }

    /// Span for a listener task, or a disabled span if listener spans are off.
    pub fn listener(&self, name: &str) -> Span {
        if self.listener_spans {
            span_listener(name)
        } else {
            Span::none()
        }
    }
}

/// Create a span for pipeline control.
#[inline]
pub fn span_pipeline(name: &str) -> Span {
    span!(Level::INFO, "pipeline", name = %name)
}

/// Create a span for an element task.
///
/// # Example
///
/// ```rust
/// use audioflow::observability::span_element;
///
/// let span = span_element("aec");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_element(tag: &str) -> Span {
    span!(Level::DEBUG, "element", element = %tag)
}

/// Create a span for a service listener task.
#[inline]
pub fn span_listener(name: &str) -> Span {
    span!(Level::DEBUG, "listener", name = %name)
}

/// Log an element state change.
#[inline]
pub fn trace_state_change(element: &str, from: &str, to: &str) {
    tracing::debug!(element = %element, from = %from, to = %to, "element state changed");
}
