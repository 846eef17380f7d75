//! Pipelines: a named registry of elements wired into a chain.
//!
//! A [`Pipeline`] owns handles to its registered elements and the ports it
//! creates when linking them. Lifecycle calls fan out to every linked
//! element in registration order.
//!
//! Stopping is split in two phases so that every element has been told to
//! abort before any of them is waited on: [`stop`](Pipeline::stop) aborts
//! and requests, [`wait_for_stop`](Pipeline::wait_for_stop) waits.
//!
//! # Example
//!
//! ```rust
//! use audioflow::element::{Element, ElementConfig, from_process};
//! use audioflow::pipeline::{Pipeline, PipelineConfig};
//!
//! let src = Element::new(
//!     ElementConfig::new("src").with_read(|buf, _| Ok(buf.len())),
//!     from_process(|ctx, buf| {
//!         let n = ctx.input(buf)?;
//!         ctx.output(&buf[..n])
//!     }),
//! )
//! .unwrap();
//! let sink = Element::new(ElementConfig::new("sink"), from_process(|ctx, buf| ctx.input(buf))).unwrap();
//!
//! let mut pipeline = Pipeline::new(PipelineConfig::new("play")).unwrap();
//! pipeline.register(&src, "mic").unwrap();
//! pipeline.register(&sink, "spk").unwrap();
//! pipeline.link(&["mic", "spk"]).unwrap();
//! assert_eq!(sink.input_port().unwrap().tag(), "mic_out_rb");
//!
//! pipeline.run().unwrap();
//! pipeline.stop().unwrap();
//! pipeline.wait_for_stop().unwrap();
//! pipeline.deinit();
//! ```

use crate::element::{DEFAULT_MAX_WAIT, Element, ElementId, ElementState, ElementStatus};
use crate::error::{Error, Result};
use crate::event::{EventIface, EventSender};
use crate::observability::TracingConfig;
use crate::port::{Port, PortKind};
use std::time::Duration;

/// Default ring buffer size for links whose producer does not set one.
pub const DEFAULT_PIPELINE_RB_SIZE: usize = 8 * 1024;

/// Configuration for a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name used in logs and spans.
    pub name: String,
    /// Ring buffer size used when a producer's output size is `0`. Must be non-zero.
    pub rb_size: usize,
    /// Span toggles; only `pipeline_spans` is consulted.
    pub tracing: TracingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            rb_size: DEFAULT_PIPELINE_RB_SIZE,
            tracing: TracingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a config with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the default ring buffer size.
    pub fn with_rb_size(mut self, size: usize) -> Self {
        self.rb_size = size;
        self
    }

    /// Set the span toggles.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.rb_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "[{}] pipeline ring buffer size must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

struct ElementItem {
    element: Element,
    linked: bool,
    status: ElementStatus,
}

struct LinkedPort {
    port: Port,
    host: ElementId,
}

/// A registry of elements and the links between them.
pub struct Pipeline {
    config: PipelineConfig,
    state: ElementState,
    items: Vec<ElementItem>,
    ports: Vec<LinkedPort>,
    linked: bool,
    listener: Option<EventSender>,
    deinited: bool,
    span: tracing::Span,
}

impl Pipeline {
    /// Create an empty pipeline in state `Init`.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let span = config.tracing.pipeline(&config.name);
        Ok(Self {
            config,
            state: ElementState::Init,
            items: Vec::new(),
            ports: Vec::new(),
            linked: false,
            listener: None,
            deinited: false,
            span,
        })
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Pipeline state.
    pub fn state(&self) -> ElementState {
        self.state
    }

    /// Force the pipeline state.
    pub fn change_state(&mut self, state: ElementState) {
        tracing::trace!(pipeline = %self.config.name, from = %self.state, to = %state, "pipeline state");
        self.state = state;
    }

    /// Returns `true` once [`link`](Self::link) has succeeded and until [`unlink`](Self::unlink).
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register `element` under `name`, renaming it.
    ///
    /// Re-registering an element moves it to the end. Names are unique
    /// ignoring ASCII case.
    pub fn register(&mut self, element: &Element, name: &str) -> Result<()> {
        let _ = self.unregister(element);
        if self.position(name).is_some() {
            return Err(Error::DuplicateElement(name.to_string()));
        }
        element.set_tag(name);
        self.items.push(ElementItem {
            element: element.clone(),
            linked: false,
            status: ElementStatus::None,
        });
        tracing::debug!(pipeline = %self.config.name, element = %name, "registered");
        Ok(())
    }

    /// Remove `element` from the registry.
    pub fn unregister(&mut self, element: &Element) -> Result<()> {
        match self.items.iter().position(|i| i.element.same_element(element)) {
            Some(pos) => {
                self.items.remove(pos);
                Ok(())
            }
            None => Err(Error::UnknownElement(element.tag())),
        }
    }

    /// Remove the element registered under `tag` and return it.
    pub fn unregister_by_tag(&mut self, tag: &str) -> Result<Element> {
        let pos = self
            .position(tag)
            .ok_or_else(|| Error::UnknownElement(tag.to_string()))?;
        Ok(self.items.remove(pos).element)
    }

    /// Find an element by tag, ignoring ASCII case.
    pub fn get_by_tag(&self, tag: &str) -> Option<Element> {
        self.position(tag).map(|pos| self.items[pos].element.clone())
    }

    /// Registered elements in registration order.
    pub fn elements(&self) -> Vec<Element> {
        self.items.iter().map(|i| i.element.clone()).collect()
    }

    /// Linked elements in registration order.
    pub fn linked_elements(&self) -> Vec<Element> {
        self.linked_items().map(|i| i.element.clone()).collect()
    }

    fn position(&self, tag: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|i| i.element.tag().eq_ignore_ascii_case(tag))
    }

    fn linked_items(&self) -> impl Iterator<Item = &ElementItem> {
        self.items.iter().filter(|i| i.linked)
    }

    // ========================================================================
    // Linking
    // ========================================================================

    /// Chain the named elements: each one's output feeds the next one's input.
    ///
    /// Every name is resolved and checked before anything is wired, so a
    /// failed link leaves no port behind. An existing link is undone first.
    pub fn link(&mut self, names: &[&str]) -> Result<()> {
        if self.linked {
            self.unlink();
        }
        if names.is_empty() {
            return Err(Error::Link("empty link sequence".into()));
        }

        let mut chain = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let pos = self.position(name).ok_or_else(|| {
                tracing::error!(pipeline = %self.config.name, element = %name, "link: unknown element");
                Error::UnknownElement(name.to_string())
            })?;
            if chain.contains(&pos) {
                return Err(Error::Link(format!("'{name}' appears twice")));
            }
            let element = &self.items[pos].element;
            if i + 1 < names.len() && element.out_type() == PortKind::Callback {
                return Err(Error::Link(format!(
                    "'{name}' writes through a callback and cannot feed '{}'",
                    names[i + 1]
                )));
            }
            chain.push(pos);
        }

        let last = chain.len() - 1;
        let mut outputs = Vec::with_capacity(last);
        for &pos in &chain[..last] {
            outputs.push(self.create_output_port(&self.items[pos].element)?);
        }
        let mut outputs = outputs.into_iter();

        let mut prev: Option<Port> = None;
        for (i, &pos) in chain.iter().enumerate() {
            self.items[pos].linked = true;
            if last == 0 {
                tracing::debug!(pipeline = %self.config.name, "only one element in pipeline");
                break;
            }
            let element = self.items[pos].element.clone();
            if i > 0 {
                element.set_input_port(prev.take());
            }
            if i < last {
                let Some(port) = outputs.next() else { break };
                element.set_output_port(Some(port.clone()));
                self.ports.push(LinkedPort {
                    port: port.clone(),
                    host: element.id(),
                });
                tracing::debug!(element = %element.tag(), port = %port.tag(), "linked output");
                prev = Some(port);
            }
        }
        self.linked = true;
        Ok(())
    }

    fn create_output_port(&self, element: &Element) -> Result<Port> {
        let tag = element.tag();
        match element.out_type() {
            PortKind::FramePool => {
                let (node_size, node_num) = element.output_framebuf_size();
                Port::frame_pool(format!("{tag}_out_fb"), node_size, node_num)
            }
            _ => {
                let size = match element.output_ringbuf_size() {
                    0 => self.config.rb_size,
                    size => size,
                };
                Port::ring_buffer(format!("{tag}_out_rb"), size)
            }
        }
    }

    /// Undo [`link`](Self::link): detach the listener and release linked ports.
    ///
    /// Callback ports owned by the elements stay in place.
    pub fn unlink(&mut self) {
        if !self.linked {
            return;
        }
        self.remove_listener();
        for item in self.items.iter_mut().filter(|i| i.linked) {
            item.linked = false;
            if item.element.in_type() != PortKind::Callback {
                item.element.set_input_port(None);
            }
            if item.element.out_type() != PortKind::Callback {
                item.element.set_output_port(None);
            }
        }
        for linked in self.ports.drain(..) {
            let Some(host) = self.items.iter().find(|i| i.element.id() == linked.host) else {
                continue;
            };
            if host.element.input_port().is_some_and(|p| p.same_port(&linked.port)) {
                host.element.set_input_port(None);
            }
            if host.element.output_port().is_some_and(|p| p.same_port(&linked.port)) {
                host.element.set_output_port(None);
            }
        }
        self.linked = false;
        tracing::debug!(pipeline = %self.config.name, "unlinked");
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Route reports of every linked element to `iface`, replacing an earlier listener.
    pub fn set_listener(&mut self, iface: &EventIface) {
        if self.listener.is_some() {
            self.remove_listener();
        }
        for item in self.linked_items() {
            item.element.set_listener(iface);
        }
        self.listener = Some(iface.sender());
    }

    /// Detach the listener from every linked element.
    pub fn remove_listener(&mut self) {
        if self.listener.take().is_none() {
            tracing::trace!(pipeline = %self.config.name, "no listener registered");
            return;
        }
        for item in self.linked_items() {
            item.element.remove_listener();
        }
    }

    /// Returns `true` if a listener is attached.
    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start every linked element.
    ///
    /// Only allowed from `Init`. A running or paused pipeline is left alone.
    /// On failure the pipeline goes to `Error` and its elements are
    /// terminated; later calls fail until it is rewound with
    /// [`change_state`](Self::change_state) or
    /// [`wait_for_stop`](Self::wait_for_stop).
    pub fn run(&mut self) -> Result<()> {
        let _span = self.span.clone().entered();
        if self.state == ElementState::Error {
            tracing::warn!(pipeline = %self.config.name, "run after a failed start");
            return Err(Error::InvalidState(format!(
                "[{}] pipeline failed to start; rewind it before running again",
                self.config.name
            )));
        }
        if self.state != ElementState::Init {
            tracing::debug!(pipeline = %self.config.name, state = %self.state, "already started");
            return Ok(());
        }
        let mut result = Ok(());
        for item in self.linked_items() {
            let element = &item.element;
            let started = if element.state().is_startable() {
                element.run()
            } else {
                element.resume(0.0, Some(DEFAULT_MAX_WAIT))
            };
            if let Err(e) = started {
                tracing::error!(element = %element.tag(), error = %e, "element failed to start");
                result = Err(e);
                break;
            }
        }
        match result {
            Ok(()) => {
                self.change_state(ElementState::Running);
                tracing::info!(pipeline = %self.config.name, "pipeline started");
                Ok(())
            }
            Err(e) => {
                self.change_state(ElementState::Error);
                if let Err(te) = self.terminate() {
                    tracing::warn!(pipeline = %self.config.name, error = %te, "terminate after failed run");
                }
                Err(e)
            }
        }
    }

    /// Ask every linked element to stop. Does not wait.
    pub fn stop(&mut self) -> Result<()> {
        let _span = self.span.clone().entered();
        if self.state != ElementState::Running {
            tracing::debug!(pipeline = %self.config.name, state = %self.state, "stop: not running");
            return Err(Error::InvalidState(format!(
                "pipeline '{}' is {}",
                self.config.name, self.state
            )));
        }
        let mut result = Ok(());
        for item in self.linked_items() {
            if let Err(e) = item.element.stop() {
                tracing::warn!(element = %item.element.tag(), error = %e, "stop failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Wait for every linked element to stop, then reset them and the pipeline to `Init`.
    pub fn wait_for_stop(&mut self) -> Result<()> {
        self.wait_stop(None)
    }

    /// As [`wait_for_stop`](Self::wait_for_stop), with a per-element timeout.
    pub fn wait_for_stop_ms(&mut self, timeout: Duration) -> Result<()> {
        self.wait_stop(Some(timeout))
    }

    fn wait_stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        let _span = self.span.clone().entered();
        if self.state != ElementState::Running {
            return Err(Error::InvalidState(format!(
                "pipeline '{}' is {}",
                self.config.name, self.state
            )));
        }
        let mut result = Ok(());
        for item in self.linked_items() {
            match item.element.wait_for_stop_ms(timeout) {
                Ok(()) => item.element.reset_state(),
                Err(e) => {
                    tracing::debug!(element = %item.element.tag(), error = %e, "wait stop failed");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        self.change_state(ElementState::Init);
        result
    }

    /// End every linked element's task.
    ///
    /// All ports are aborted before any task is waited on.
    pub fn terminate(&mut self) -> Result<()> {
        let _span = self.span.clone().entered();
        for item in self.linked_items() {
            item.element.abort_output_port();
            item.element.abort_input_port();
        }
        let mut result = Ok(());
        for item in self.linked_items() {
            if let Err(e) = item.element.terminate() {
                tracing::warn!(element = %item.element.tag(), error = %e, "terminate failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Pause every linked element.
    pub fn pause(&mut self) -> Result<()> {
        let mut result = Ok(());
        for item in self.linked_items() {
            if let Err(e) = item.element.pause() {
                tracing::warn!(element = %item.element.tag(), error = %e, "pause failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Resume every linked element and mark the pipeline `Running`.
    pub fn resume(&mut self) -> Result<()> {
        let mut result = Ok(());
        for item in self.linked_items() {
            if let Err(e) = item.element.resume(0.0, Some(DEFAULT_MAX_WAIT)) {
                tracing::warn!(element = %item.element.tag(), error = %e, "resume failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.change_state(ElementState::Running);
        result
    }

    // ========================================================================
    // Rewind
    // ========================================================================

    /// Reset the input and output ports of every linked element.
    pub fn reset_port(&mut self) {
        for item in self.linked_items() {
            item.element.reset_input_port();
            item.element.reset_output_port();
        }
    }

    /// Reset every linked element to `Init`.
    pub fn reset_elements(&mut self) {
        for item in self.linked_items() {
            item.element.reset_state();
        }
    }

    /// Forget the statuses recorded by [`check_items_state`](Self::check_items_state).
    pub fn reset_items_state(&mut self) {
        for item in self.items.iter_mut().filter(|i| i.linked) {
            item.status = ElementStatus::None;
        }
    }

    /// Record `status` for `element` and return `true` once every linked
    /// element has reported the same status.
    pub fn check_items_state(&mut self, element: &Element, status: ElementStatus) -> bool {
        let mut found = false;
        for item in self.items.iter_mut().filter(|i| i.linked) {
            if item.element.same_element(element) {
                item.status = status;
                found = true;
            }
        }
        found && self.linked_items().all(|i| i.status == status)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Terminate, unlink and deinitialize every registered element. Idempotent.
    ///
    /// Safe on a partially built pipeline.
    pub fn deinit(&mut self) {
        if self.deinited {
            return;
        }
        self.deinited = true;
        if let Err(e) = self.terminate() {
            tracing::warn!(pipeline = %self.config.name, error = %e, "deinit: terminate failed");
        }
        self.unlink();
        for item in self.items.drain(..) {
            tracing::trace!(element = %item.element.tag(), "deinit element");
            item.element.deinit();
        }
        tracing::debug!(pipeline = %self.config.name, "pipeline deinitialized");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("elements", &self.items.len())
            .field("linked", &self.linked)
            .finish()
    }
}
