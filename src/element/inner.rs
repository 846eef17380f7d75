//! Shared element state and the control operations behind [`Element`](super::Element).

use super::config::{DEFAULT_MAX_WAIT, ElementConfig};
use super::signal::{BUFFER_REACH_LEVEL, PAUSED, RESUMED, STOPPED, StateSignal, TASK_DESTROYED};
use super::{
    AudioElement, AudioInfo, ElementContext, ElementId, ElementState, ElementStatus, EventCallback,
    TaskCommand, task,
};
use crate::error::{Error, IoError, IoResult, Result};
use crate::event::{EventData, EventMessage, EventSender, MessageCommand};
use crate::observability::{self, ElementMetrics, TracingConfig};
use crate::port::{Port, PortKind};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(super) type PortSlots = SmallVec<[Option<Port>; 4]>;

#[derive(Default)]
pub(super) struct Ports {
    pub(super) input: Option<Port>,
    pub(super) output: Option<Port>,
    pub(super) multi_in: PortSlots,
    pub(super) multi_out: PortSlots,
}

pub(super) struct IoSettings {
    pub(super) input_timeout: Option<Duration>,
    pub(super) output_timeout: Option<Duration>,
    pub(super) in_type: PortKind,
    pub(super) out_type: PortKind,
    pub(super) out_rb_size: usize,
    pub(super) out_fb_node_size: usize,
    pub(super) out_fb_node_num: usize,
    pub(super) buf_size_expect: usize,
}

#[derive(Default)]
pub(super) struct EventRoute {
    pub(super) listener: Option<EventSender>,
    pub(super) callback: Option<Arc<Mutex<EventCallback>>>,
}

pub(crate) struct ElementInner {
    pub(super) id: ElementId,
    pub(super) tag: Mutex<String>,
    pub(super) state: Mutex<ElementState>,
    pub(super) task_run: AtomicBool,
    pub(super) is_running: AtomicBool,
    pub(super) is_open: AtomicBool,
    pub(super) stopping: AtomicBool,
    pub(super) deinited: AtomicBool,
    pub(super) signal: StateSignal,
    pub(super) ports: Mutex<Ports>,
    pub(super) io: Mutex<IoSettings>,
    pub(super) info: Mutex<AudioInfo>,
    pub(super) route: Mutex<EventRoute>,
    pub(super) callbacks: Mutex<Box<dyn AudioElement>>,
    pub(super) commands: Mutex<Option<kanal::Sender<TaskCommand>>>,
    pub(super) thread: Mutex<Option<JoinHandle<()>>>,
    pub(super) metrics: Mutex<ElementMetrics>,
    pub(super) buffer_len: usize,
    pub(super) spawn_task: bool,
    pub(super) stack_size: Option<usize>,
    pub(super) tracing: TracingConfig,
}

impl ElementInner {
    pub(super) fn new(mut config: ElementConfig, callbacks: Box<dyn AudioElement>) -> Result<Self> {
        config.validate()?;
        if config.buffer_len == 0 && config.spawn_task {
            return Err(Error::InvalidConfig(format!(
                "[{}] element task needs a non-zero buffer",
                config.tag
            )));
        }

        let tag = config.tag.clone();
        let input = config
            .read
            .take()
            .map(|read| Port::callback_reader(format!("{tag}_in_cb"), read));
        let output = config
            .write
            .take()
            .map(|write| Port::callback_writer(format!("{tag}_out_cb"), write));

        Ok(Self {
            id: ElementId::new(),
            tag: Mutex::new(tag.clone()),
            state: Mutex::new(ElementState::Init),
            task_run: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            is_open: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            deinited: AtomicBool::new(false),
            signal: StateSignal::default(),
            ports: Mutex::new(Ports {
                input,
                output,
                multi_in: SmallVec::from_elem(None, config.multi_in_port_num),
                multi_out: SmallVec::from_elem(None, config.multi_out_port_num),
            }),
            io: Mutex::new(IoSettings {
                input_timeout: config.input_timeout,
                output_timeout: config.output_timeout,
                in_type: config.in_type,
                out_type: config.out_type,
                out_rb_size: config.out_rb_size,
                out_fb_node_size: config.out_fb_node_size,
                out_fb_node_num: config.out_fb_node_num,
                buf_size_expect: 0,
            }),
            info: Mutex::new(AudioInfo::default()),
            route: Mutex::new(EventRoute::default()),
            callbacks: Mutex::new(callbacks),
            commands: Mutex::new(None),
            thread: Mutex::new(None),
            metrics: Mutex::new(ElementMetrics::new(&tag)),
            buffer_len: config.buffer_len,
            spawn_task: config.spawn_task,
            stack_size: config.stack_size,
            tracing: config.tracing,
        })
    }

    // ========================================================================
    // Identity and state
    // ========================================================================

    pub(crate) fn tag(&self) -> String {
        self.tag.lock().unwrap().clone()
    }

    pub(super) fn set_tag(&self, tag: &str) {
        *self.tag.lock().unwrap() = tag.to_string();
        *self.metrics.lock().unwrap() = ElementMetrics::new(tag);
    }

    pub(crate) fn state(&self) -> ElementState {
        *self.state.lock().unwrap()
    }

    pub(super) fn set_state(&self, new: ElementState) {
        let old = std::mem::replace(&mut *self.state.lock().unwrap(), new);
        if old != new {
            observability::trace_state_change(&self.tag(), &old.to_string(), &new.to_string());
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub(super) fn metrics(&self) -> ElementMetrics {
        self.metrics.lock().unwrap().clone()
    }

    fn context(&self) -> ElementContext<'_> {
        ElementContext::new(self)
    }

    // ========================================================================
    // Event route
    // ========================================================================

    pub(crate) fn send_event(&self, msg: EventMessage) -> bool {
        let (callback, listener) = {
            let route = self.route.lock().unwrap();
            (route.callback.clone(), route.listener.clone())
        };
        if let Some(callback) = callback {
            (callback.lock().unwrap())(&msg);
            return true;
        }
        match listener {
            Some(listener) => listener.send(msg),
            None => false,
        }
    }

    pub(crate) fn report_status(&self, status: ElementStatus) {
        let tag = self.tag();
        observability::record_status_report(&tag, &status.to_string());
        tracing::debug!(element = %tag, status = ?status, "report status");
        self.send_event(EventMessage::new_status(self.id, tag, status));
    }

    fn report(&self, cmd: MessageCommand, data: EventData) {
        let msg = EventMessage {
            source: self.id,
            source_tag: self.tag(),
            cmd,
            data,
        };
        self.send_event(msg);
    }

    pub(crate) fn report_info(&self) {
        let info = self.info.lock().unwrap().clone();
        self.report(MessageCommand::ReportMusicInfo, EventData::MusicInfo(info));
    }

    pub(crate) fn report_codec_fmt(&self) {
        let fmt = self.info.lock().unwrap().codec_fmt;
        self.report(MessageCommand::ReportCodecFmt, EventData::CodecFmt(fmt));
    }

    pub(crate) fn report_pos(&self) {
        let info = self.info.lock().unwrap().clone();
        self.report(MessageCommand::ReportPosition, EventData::Position(info));
    }

    // ========================================================================
    // Data path
    // ========================================================================

    pub(crate) fn input(&self, buf: &mut [u8]) -> IoResult {
        let Some(port) = self.ports.lock().unwrap().input.clone() else {
            tracing::error!(element = %self.tag(), "no input port");
            return Err(IoError::Fail);
        };
        let timeout = self.io.lock().unwrap().input_timeout;
        let result = port.read(buf, timeout);
        match result {
            Ok(n) => self.metrics().record_in(n),
            Err(IoError::Fail) => {
                tracing::error!(element = %self.tag(), "input failed");
                self.report_status(ElementStatus::ErrorInput);
            }
            Err(IoError::Abort) => tracing::warn!(element = %self.tag(), "input aborted"),
            Err(e) => tracing::trace!(element = %self.tag(), result = %e, "input"),
        }
        result
    }

    pub(crate) fn output(&self, buf: &[u8]) -> IoResult {
        let Some(port) = self.ports.lock().unwrap().output.clone() else {
            tracing::error!(element = %self.tag(), "no output port");
            return Err(IoError::Fail);
        };
        if buf.is_empty() {
            return Ok(0);
        }
        let (timeout, expect) = {
            let io = self.io.lock().unwrap();
            (io.output_timeout, io.buf_size_expect)
        };
        let result = port.write(buf, timeout);
        if port.kind() != PortKind::Callback {
            let filled = port.filled_size();
            observability::record_port_filled(&port.tag(), filled);
            if filled > expect || result.is_err() {
                self.signal.set(BUFFER_REACH_LEVEL);
            }
        }
        match result {
            Ok(n) => self.metrics().record_out(n),
            Err(IoError::Fail) => {
                tracing::error!(element = %self.tag(), "output failed");
                self.report_status(ElementStatus::ErrorOutput);
            }
            Err(IoError::Abort) => tracing::warn!(element = %self.tag(), "output aborted"),
            Err(e) => tracing::trace!(element = %self.tag(), result = %e, "output"),
        }
        result
    }

    pub(crate) fn multi_input(&self, buf: &mut [u8], index: usize, timeout: Option<Duration>) -> IoResult {
        let port = {
            let ports = self.ports.lock().unwrap();
            match ports.multi_in.get(index) {
                Some(slot) => slot.clone(),
                None => {
                    tracing::error!(
                        element = %self.tag(),
                        index,
                        max = ports.multi_in.len(),
                        "multi input index out of range"
                    );
                    return Err(IoError::Fail);
                }
            }
        };
        match port {
            Some(port) => port.read(buf, timeout),
            None => Err(IoError::Fail),
        }
    }

    /// Write `buf` to every connected multi-output port; the first error wins.
    pub(crate) fn multi_output(&self, buf: &[u8], timeout: Option<Duration>) -> IoResult {
        let ports: PortSlots = self.ports.lock().unwrap().multi_out.clone();
        let mut result = Ok(buf.len());
        for port in ports.iter().flatten() {
            if let Err(e) = port.write(buf, timeout) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    // ========================================================================
    // Port control
    // ========================================================================

    fn input_ports(&self) -> SmallVec<[Port; 4]> {
        let ports = self.ports.lock().unwrap();
        ports
            .input
            .iter()
            .chain(ports.multi_in.iter().flatten())
            .cloned()
            .collect()
    }

    fn output_ports(&self) -> SmallVec<[Port; 4]> {
        let ports = self.ports.lock().unwrap();
        ports
            .output
            .iter()
            .chain(ports.multi_out.iter().flatten())
            .cloned()
            .collect()
    }

    pub(crate) fn abort_input_ports(&self) {
        self.input_ports().iter().for_each(Port::abort);
    }

    pub(crate) fn abort_output_ports(&self) {
        self.output_ports().iter().for_each(Port::abort);
    }

    pub(crate) fn reset_input_ports(&self) {
        self.input_ports().iter().for_each(Port::reset);
    }

    pub(crate) fn reset_output_ports(&self) {
        self.output_ports().iter().for_each(Port::reset);
    }

    /// Clear a latched abort on an owned callback input.
    pub(super) fn reset_callback_input(&self) {
        let input = self.ports.lock().unwrap().input.clone();
        if let Some(port) = input.filter(|p| p.kind() == PortKind::Callback) {
            port.reset();
        }
    }

    pub(crate) fn set_port_done(&self) {
        self.output_ports().iter().for_each(Port::write_done);
    }

    pub(crate) fn output_port(&self) -> Option<Port> {
        self.ports.lock().unwrap().output.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub(super) fn send_command(&self, cmd: TaskCommand) -> Result<()> {
        let commands = self.commands.lock().unwrap().clone();
        let Some(commands) = commands else {
            return Err(Error::ChannelClosed);
        };
        tracing::trace!(element = %self.tag(), ?cmd, "send command");
        match commands.try_send(cmd) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::InvalidState(format!(
                "[{}] command queue full",
                self.tag()
            ))),
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    pub(crate) fn run(self: &Arc<Self>) -> Result<()> {
        if self.deinited.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!("[{}] element deinitialized", self.tag())));
        }
        if !self.task_run.load(Ordering::Acquire) {
            tracing::debug!(element = %self.tag(), "element starting");
            if self.spawn_task {
                if let Err(e) = task::spawn(self) {
                    self.set_state(ElementState::Error);
                    self.report_status(ElementStatus::ErrorOpen);
                    tracing::error!(element = %self.tag(), error = %e, "task spawn failed");
                    return Err(e);
                }
            } else {
                self.task_run.store(true, Ordering::Release);
            }
        }
        self.resume(0.0, Some(DEFAULT_MAX_WAIT))?;
        if self.state() == ElementState::Error {
            return Err(Error::InvalidState(format!("[{}] open failed", self.tag())));
        }
        Ok(())
    }

    pub(crate) fn resume(&self, threshold: f32, timeout: Option<Duration>) -> Result<()> {
        if !self.task_run.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!("[{}] element not started", self.tag())));
        }
        let state = self.state();
        if state == ElementState::Running {
            self.report_status(ElementStatus::StateRunning);
            return Ok(());
        }
        if !self.spawn_task {
            self.is_running.store(true, Ordering::Release);
            self.set_state(ElementState::Running);
            self.report_status(ElementStatus::StateRunning);
            return Ok(());
        }
        match state {
            ElementState::Error => {
                return Err(Error::InvalidState(format!("[{}] element in error", self.tag())));
            }
            ElementState::Finished => {
                self.report_status(ElementStatus::StateFinished);
                return Ok(());
            }
            _ => {}
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidConfig(format!(
                "resume threshold {threshold} outside [0, 1]"
            )));
        }

        self.signal.clear(RESUMED);
        self.send_command(TaskCommand::Resume)?;
        if !self.signal.wait(RESUMED, timeout) {
            tracing::warn!(element = %self.tag(), "resume timed out");
            return Err(Error::Timeout(format!("[{}] resume", self.tag())));
        }
        if threshold != 0.0 {
            let size = self.output_port().map_or(0, |p| p.size());
            self.wait_for_buffer((size as f32 * threshold) as usize, timeout)?;
        }
        Ok(())
    }

    pub(crate) fn pause(&self) -> Result<()> {
        if !self.task_run.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!("[{}] element not started", self.tag())));
        }
        if self.state() >= ElementState::Paused {
            tracing::trace!(element = %self.tag(), state = %self.state(), "already paused");
            return Ok(());
        }
        self.signal.clear(PAUSED);
        if !self.spawn_task {
            self.is_running.store(false, Ordering::Release);
            self.set_state(ElementState::Paused);
            return Ok(());
        }
        self.send_command(TaskCommand::Pause)?;
        if self.signal.wait(PAUSED, Some(DEFAULT_MAX_WAIT)) {
            Ok(())
        } else {
            Err(Error::Timeout(format!("[{}] pause", self.tag())))
        }
    }

    pub(crate) fn stop(&self) -> Result<()> {
        if !self.task_run.load(Ordering::Acquire) {
            tracing::trace!(element = %self.tag(), "stop: element not started");
            return Ok(());
        }
        if !self.is_running() {
            self.signal.set(STOPPED);
            self.report_status(ElementStatus::StateStopped);
            tracing::debug!(element = %self.tag(), "element already stopped");
            return Ok(());
        }
        self.abort_output_ports();
        self.abort_input_ports();
        if self.state() == ElementState::Running {
            self.signal.clear(STOPPED);
        }
        if !self.spawn_task {
            self.is_running.store(false, Ordering::Release);
            self.set_state(ElementState::Stopped);
            self.signal.set(STOPPED);
            self.report_status(ElementStatus::StateStopped);
            return Ok(());
        }
        if self.stopping.swap(true, Ordering::AcqRel) {
            tracing::trace!(element = %self.tag(), "stop already requested");
            return Ok(());
        }
        if let Err(e) = self.send_command(TaskCommand::Stop) {
            self.stopping.store(false, Ordering::Release);
            tracing::warn!(element = %self.tag(), error = %e, "send stop failed");
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn wait_for_stop(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        if self.signal.wait(STOPPED, timeout) {
            Ok(())
        } else {
            Err(Error::Timeout(format!("[{}] wait for stop", self.tag())))
        }
    }

    pub(crate) fn terminate(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.task_run.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.spawn_task {
            self.task_run.store(false, Ordering::Release);
            self.is_running.store(false, Ordering::Release);
            return Ok(());
        }
        self.abort_output_ports();
        self.abort_input_ports();
        self.signal.clear(TASK_DESTROYED);
        match self.send_command(TaskCommand::Destroy) {
            Ok(()) | Err(Error::ChannelClosed) => {}
            Err(e) => return Err(e),
        }
        if !self.signal.wait(TASK_DESTROYED, timeout) {
            tracing::warn!(element = %self.tag(), "task destroy timed out");
            return Err(Error::Timeout(format!("[{}] terminate", self.tag())));
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!(element = %self.tag(), "element task panicked");
            }
        }
        *self.commands.lock().unwrap() = None;
        tracing::debug!(element = %self.tag(), "element task destroyed");
        Ok(())
    }

    pub(crate) fn wait_for_buffer(&self, size: usize, timeout: Option<Duration>) -> Result<()> {
        let out_type = self.io.lock().unwrap().out_type;
        if out_type == PortKind::Callback {
            return Err(Error::InvalidState(format!(
                "[{}] callback output has no buffer level",
                self.tag()
            )));
        }
        if self.output_port().is_none() {
            return Err(Error::NoPort(self.tag()));
        }
        self.io.lock().unwrap().buf_size_expect = size;
        self.signal.clear(BUFFER_REACH_LEVEL);
        if self.signal.wait(BUFFER_REACH_LEVEL, timeout) {
            Ok(())
        } else {
            Err(Error::Timeout(format!("[{}] wait for buffer", self.tag())))
        }
    }

    pub(crate) fn seek(&self, data: &[u8], out: &mut [u8]) -> Result<usize> {
        let ctx = self.context();
        self.callbacks.lock().unwrap().seek(&ctx, data, out)
    }

    pub(crate) fn deinit(&self) {
        if self.deinited.swap(true, Ordering::AcqRel) {
            return;
        }
        let tag = self.tag();
        if let Err(e) = self.stop() {
            tracing::warn!(element = %tag, error = %e, "deinit: stop failed");
        }
        if let Err(e) = self.wait_for_stop(Some(DEFAULT_MAX_WAIT)) {
            tracing::warn!(element = %tag, error = %e, "deinit: wait for stop failed");
        }
        if let Err(e) = self.terminate(Some(DEFAULT_MAX_WAIT)) {
            tracing::warn!(element = %tag, error = %e, "deinit: terminate failed");
        }
        match self.callbacks.try_lock() {
            Ok(mut callbacks) => callbacks.destroy(),
            Err(_) => tracing::error!(element = %tag, "deinit: callbacks still in use, destroy skipped"),
        }
        *self.ports.lock().unwrap() = Ports::default();
        *self.route.lock().unwrap() = EventRoute::default();
        tracing::debug!(element = %tag, "element deinitialized");
    }
}
