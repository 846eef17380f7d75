//! Service listeners: per-service supervisor threads.
//!
//! A [`ServiceListener`] turns element reports into service actions. It
//! runs on its own thread with a small command queue:
//!
//! | Command | Behaviour |
//! |---------|-----------|
//! | `Idle`  | block on the command queue; the event queue is not polled |
//! | `Start` | poll the event queue with a short timeout and react |
//! | `Exit`  | leave the loop; [`exit`](ServiceListener::exit) returns after the thread ended |
//!
//! While started, an error report from an active service stops it and
//! raises [`ServiceEventCode::Error`]; a stopped or finished report from
//! the watched element raises [`ServiceEventCode::Finished`]. After either,
//! the listener goes idle by itself.
//!
//! # Example
//!
//! ```rust
//! use audioflow::event::{EventIface, EventIfaceConfig};
//! use audioflow::pipeline::{Pipeline, PipelineConfig};
//! use audioflow::service::{ListenerConfig, PipelineService, ServiceListener};
//! use std::sync::{Arc, Mutex};
//!
//! let iface = Arc::new(EventIface::new(EventIfaceConfig::default()).unwrap());
//! let pipeline = Arc::new(Mutex::new(Pipeline::new(PipelineConfig::new("player")).unwrap()));
//! let service = PipelineService::new(Arc::clone(&pipeline))
//!     .with_callback(|event| println!("service event: {:?}", event.code));
//!
//! let mut listener = ServiceListener::spawn(ListenerConfig::new("player"), iface, service).unwrap();
//! listener.start().unwrap();
//! listener.idle().unwrap();
//! listener.exit().unwrap();
//! ```

mod handler;

pub use handler::{PipelineService, ServiceCallback, ServiceEvent, ServiceEventCode, ServiceHandler};

use crate::element::{DEFAULT_MAX_WAIT, ElementStatus};
use crate::error::{Error, Result};
use crate::event::{EventIface, EventMessage, MessageCommand};
use crate::observability::TracingConfig;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default event poll timeout while started.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Default depth of the listener command queue.
pub const DEFAULT_COMMAND_DEPTH: usize = 5;

/// Configuration for a [`ServiceListener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Name of the listener thread and span.
    pub name: String,
    /// Event poll timeout while started.
    pub poll_timeout: Duration,
    /// Depth of the command queue.
    pub queue_depth: usize,
    /// Stack size of the listener thread (`None` uses the platform default).
    pub stack_size: Option<usize>,
    /// Span toggles; only `listener_spans` is consulted.
    pub tracing: TracingConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "listener".to_string(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            queue_depth: DEFAULT_COMMAND_DEPTH,
            stack_size: None,
            tracing: TracingConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Create a config with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the command queue depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the listener thread's stack size.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the span toggles.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    fn span(&self) -> tracing::Span {
        self.tracing.listener(&self.name)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "[{}] poll timeout must be > 0",
                self.name
            )));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig(format!(
                "[{}] command queue depth must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Control commands of a [`ServiceListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerCommand {
    /// Stop polling and block on the command queue.
    Idle,
    /// Poll the event queue and react to reports.
    Start,
    /// End the listener thread.
    Exit,
}

#[derive(Debug, PartialEq, Eq)]
enum Reaction {
    Continue,
    Idle,
}

/// A supervisor thread reacting to the reports of one event queue.
pub struct ServiceListener {
    name: String,
    commands: kanal::Sender<ListenerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl ServiceListener {
    /// Spawn the listener thread in the idle state.
    ///
    /// Returns after the thread has started.
    pub fn spawn<H: ServiceHandler>(
        config: ListenerConfig,
        iface: Arc<EventIface>,
        handler: H,
    ) -> Result<Self> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = kanal::bounded(config.queue_depth);
        let (ready_tx, ready_rx) = kanal::bounded(1);

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }
        let name = config.name.clone();
        let thread = builder.spawn(move || {
            let _ = ready_tx.send(());
            drop(ready_tx);
            listener_main(config, cmd_rx, iface, handler);
        })?;

        if ready_rx.recv_timeout(DEFAULT_MAX_WAIT).is_err() {
            return Err(Error::Timeout(format!("[{name}] listener start")));
        }
        tracing::debug!(listener = %name, "listener started");
        Ok(Self {
            name,
            commands: cmd_tx,
            thread: Some(thread),
        })
    }

    /// Listener name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` until [`exit`](Self::exit) has completed.
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stop polling the event queue.
    pub fn idle(&self) -> Result<()> {
        self.send(ListenerCommand::Idle)
    }

    /// Start polling the event queue. Stale reports queued while idle are discarded.
    pub fn start(&self) -> Result<()> {
        self.send(ListenerCommand::Start)
    }

    /// Send a control command without blocking.
    pub fn send(&self, cmd: ListenerCommand) -> Result<()> {
        match self.commands.try_send(cmd) {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::error!(listener = %self.name, ?cmd, "listener command queue full");
                Err(Error::InvalidState(format!(
                    "[{}] listener command queue full",
                    self.name
                )))
            }
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    /// End the listener thread and wait for it. Idempotent.
    pub fn exit(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if self.commands.send(ListenerCommand::Exit).is_err() {
            tracing::debug!(listener = %self.name, "listener already gone");
        }
        if thread.thread().id() == thread::current().id() {
            return Ok(());
        }
        thread.join().map_err(|_| {
            Error::InvalidState(format!("[{}] listener thread panicked", self.name))
        })?;
        tracing::debug!(listener = %self.name, "listener exited");
        Ok(())
    }
}

impl Drop for ServiceListener {
    fn drop(&mut self) {
        if let Err(e) = self.exit() {
            tracing::warn!(listener = %self.name, error = %e, "listener exit on drop");
        }
    }
}

impl std::fmt::Debug for ServiceListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceListener")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn listener_main<H: ServiceHandler>(
    config: ListenerConfig,
    commands: kanal::Receiver<ListenerCommand>,
    iface: Arc<EventIface>,
    mut handler: H,
) {
    let span = config.span();
    let _enter = span.enter();
    let mut started = false;

    loop {
        let cmd = if started {
            match commands.try_recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            }
        } else {
            match commands.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            }
        };
        match cmd {
            Some(ListenerCommand::Idle) => started = false,
            Some(ListenerCommand::Start) => {
                if !started {
                    let stale = iface.discard();
                    if stale > 0 {
                        tracing::trace!(dropped = stale, "discarded stale reports");
                    }
                }
                started = true;
            }
            Some(ListenerCommand::Exit) => break,
            None => {}
        }
        if !started {
            continue;
        }

        let msg = match iface.listen(Some(config.poll_timeout)) {
            Ok(msg) => msg,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                tracing::warn!(error = %e, "event queue unavailable, going idle");
                started = false;
                continue;
            }
        };
        if react(&mut handler, &msg) == Reaction::Idle {
            started = false;
        }
    }
    tracing::debug!("listener thread exiting");
}

fn react<H: ServiceHandler>(handler: &mut H, msg: &EventMessage) -> Reaction {
    match msg.cmd {
        MessageCommand::ReportStatus => {
            let Some(status) = msg.status() else {
                return Reaction::Continue;
            };
            if !handler.is_active() {
                tracing::trace!(element = %msg.source_tag, %status, "report while inactive");
                return Reaction::Continue;
            }
            if status.is_error() {
                tracing::warn!(element = %msg.source_tag, %status, "element error, stopping service");
                handler.stop();
                handler.notify(ServiceEvent::error(&msg.source_tag, status));
                return Reaction::Idle;
            }
            if matches!(status, ElementStatus::StateStopped | ElementStatus::StateFinished)
                && handler.ends_service(&msg.source_tag)
            {
                tracing::info!(element = %msg.source_tag, %status, "service finished");
                handler.stop();
                handler.notify(ServiceEvent::finished(&msg.source_tag, status));
                return Reaction::Idle;
            }
            Reaction::Continue
        }
        MessageCommand::ReportMusicInfo => {
            if let Some(info) = msg.info() {
                handler.on_music_info(&msg.source_tag, info.clone());
            }
            Reaction::Continue
        }
        _ => {
            tracing::trace!(%msg, "report ignored");
            Reaction::Continue
        }
    }
}
