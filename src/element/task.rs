//! The element task: one thread per element, driven by commands.
//!
//! The task lives from the first `run` until `terminate`. While the element
//! is running the task polls its command queue between `process` calls;
//! otherwise it blocks on the queue. Stopping, finishing, failing and
//! pausing all close the element and park the task until the next command.

use super::config::DEFAULT_MAX_WAIT;
use super::inner::ElementInner;
use super::signal::{PAUSED, RESUMED, STOPPED, TASK_DESTROYED};
use super::{ElementContext, ElementState, ElementStatus, TaskCommand};
use crate::error::{Error, IoError, Result};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

/// Pending commands an element task accepts before senders see a full queue.
const COMMAND_QUEUE_DEPTH: usize = 8;

enum Flow {
    Continue,
    Failed,
    Exit,
}

pub(super) fn spawn(inner: &Arc<ElementInner>) -> Result<()> {
    let tag = inner.tag();
    let (cmd_tx, cmd_rx) = kanal::bounded(COMMAND_QUEUE_DEPTH);
    let (ready_tx, ready_rx) = kanal::bounded(1);

    let mut builder = thread::Builder::new().name(format!("el-{tag}"));
    if let Some(size) = inner.stack_size {
        builder = builder.stack_size(size);
    }

    *inner.commands.lock().unwrap() = Some(cmd_tx);
    let task_inner = Arc::clone(inner);
    let handle = match builder.spawn(move || task_main(task_inner, cmd_rx, ready_tx)) {
        Ok(handle) => handle,
        Err(e) => {
            *inner.commands.lock().unwrap() = None;
            return Err(Error::Spawn(e));
        }
    };
    *inner.thread.lock().unwrap() = Some(handle);

    match ready_rx.recv_timeout(DEFAULT_MAX_WAIT) {
        Ok(()) => {
            tracing::debug!(element = %tag, "element task created");
            Ok(())
        }
        Err(_) => Err(Error::Timeout(format!("[{tag}] task start"))),
    }
}

fn task_main(
    inner: Arc<ElementInner>,
    commands: kanal::Receiver<TaskCommand>,
    ready: kanal::Sender<()>,
) {
    let span = inner.task_span();
    let _enter = span.enter();

    inner.task_run.store(true, Ordering::Release);
    inner.set_state(ElementState::Init);
    let mut buf = vec![0u8; inner.buffer_len];
    inner.signal.clear(STOPPED);
    let _ = ready.send(());
    drop(ready);

    loop {
        let cmd = if inner.is_running() {
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
        if let Some(cmd) = cmd {
            match inner.on_command(cmd) {
                Flow::Continue => {}
                Flow::Failed => inner.signal.set(STOPPED),
                Flow::Exit => break,
            }
        }
        inner.process_running(&mut buf);
    }

    if inner.is_open.load(Ordering::Acquire) {
        inner.process_deinit();
        inner.set_state(ElementState::Stopped);
    }
    inner.stopping.store(false, Ordering::Release);
    inner.is_running.store(false, Ordering::Release);
    inner.task_run.store(false, Ordering::Release);
    tracing::debug!(element = %inner.tag(), "element task exiting");
    inner.signal.set(STOPPED | RESUMED | TASK_DESTROYED);
}

impl ElementInner {
    pub(super) fn task_span(&self) -> tracing::Span {
        self.tracing.element(&self.tag())
    }

    fn on_command(&self, cmd: TaskCommand) -> Flow {
        tracing::trace!(element = %self.tag(), ?cmd, state = %self.state(), "task command");
        match cmd {
            TaskCommand::Finish => self.on_cmd_finish(),
            TaskCommand::Stop => self.on_cmd_stop(),
            TaskCommand::Pause => self.on_cmd_pause(),
            TaskCommand::Resume => {
                if !self.on_cmd_resume() {
                    return Flow::Failed;
                }
            }
            TaskCommand::Destroy => {
                self.is_running.store(false, Ordering::Release);
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    /// Run `open`. Returns `false` if the element did not reach `Running`.
    fn process_init(&self) -> bool {
        self.is_open.store(true, Ordering::Release);
        self.set_state(ElementState::Initializing);
        let result = {
            let ctx = ElementContext::new(self);
            self.callbacks.lock().unwrap().open(&ctx)
        };
        match result {
            Ok(()) | Err(IoError::Done) => {
                self.set_state(ElementState::Running);
                self.report_status(ElementStatus::StateRunning);
                true
            }
            Err(IoError::Abort) => {
                tracing::warn!(element = %self.tag(), "open aborted");
                self.on_cmd_stop();
                false
            }
            Err(e) => {
                tracing::error!(element = %self.tag(), error = %e, "open failed");
                self.set_state(ElementState::Error);
                self.report_status(ElementStatus::ErrorOpen);
                self.on_cmd_error();
                false
            }
        }
    }

    /// Run `close` if the element is open.
    fn process_deinit(&self) {
        if !self.is_open.swap(false, Ordering::AcqRel) {
            return;
        }
        let ctx = ElementContext::new(self);
        if let Err(e) = self.callbacks.lock().unwrap().close(&ctx) {
            tracing::warn!(element = %self.tag(), error = %e, "close failed");
        }
    }

    fn on_cmd_resume(&self) -> bool {
        let state = self.state();
        if state == ElementState::Running {
            self.is_running.store(true, Ordering::Release);
            self.signal.set(RESUMED);
            return true;
        }
        if !matches!(
            state,
            ElementState::Init | ElementState::Running | ElementState::Paused
        ) {
            self.reset_output_ports();
        }
        self.reset_callback_input();
        self.is_running.store(true, Ordering::Release);
        let opened = self.process_init();
        self.signal.set(RESUMED);
        if !opened {
            self.abort_output_ports();
            self.abort_input_ports();
            self.is_running.store(false, Ordering::Release);
            return false;
        }
        self.signal.clear(STOPPED);
        true
    }

    fn on_cmd_stop(&self) {
        let state = self.state();
        if state != ElementState::Finished && state != ElementState::Stopped {
            self.process_deinit();
            self.set_state(ElementState::Stopped);
            self.report_status(ElementStatus::StateStopped);
        } else {
            if !self.is_running() && state == ElementState::Stopped {
                self.stopping.store(false, Ordering::Release);
                return;
            }
            self.set_state(ElementState::Stopped);
            self.report_status(ElementStatus::StateStopped);
        }
        self.is_running.store(false, Ordering::Release);
        self.stopping.store(false, Ordering::Release);
        self.signal.set(STOPPED);
    }

    fn on_cmd_finish(&self) {
        let state = self.state();
        if state == ElementState::Error || state == ElementState::Stopped {
            tracing::trace!(element = %self.tag(), %state, "finish ignored");
            return;
        }
        self.process_deinit();
        self.set_state(ElementState::Finished);
        self.report_status(ElementStatus::StateFinished);
        self.is_running.store(false, Ordering::Release);
        self.signal.set(STOPPED);
    }

    fn on_cmd_error(&self) {
        if self.state() == ElementState::Stopped {
            return;
        }
        self.process_deinit();
        self.set_state(ElementState::Error);
        self.is_running.store(false, Ordering::Release);
        self.signal.set(STOPPED);
    }

    fn on_cmd_pause(&self) {
        self.set_state(ElementState::Paused);
        self.process_deinit();
        self.report_status(ElementStatus::StatePaused);
        self.is_running.store(false, Ordering::Release);
        self.signal.set(PAUSED);
    }

    fn process_running(&self, buf: &mut [u8]) {
        if self.state() < ElementState::Running || !self.is_running() {
            return;
        }
        let metrics = self.metrics();
        let result = {
            let _timer = metrics.start_timer();
            let ctx = ElementContext::new(self);
            self.callbacks.lock().unwrap().process(&ctx, buf)
        };
        match result {
            Ok(n) if n > 0 => metrics.record_frame(),
            Ok(_) | Err(IoError::Done) => {
                if self.state() == ElementState::Init {
                    // reset_state was called while running: reopen
                    self.on_cmd_resume();
                    return;
                }
                self.set_port_done();
                self.on_cmd_finish();
            }
            Err(IoError::Abort) => {
                tracing::trace!(element = %self.tag(), "process aborted");
                self.on_cmd_stop();
            }
            Err(e @ (IoError::Fail | IoError::ProcessFail)) => {
                tracing::error!(element = %self.tag(), error = %e, "process failed");
                self.report_status(ElementStatus::ErrorProcess);
                self.on_cmd_error();
            }
            Err(IoError::Timeout) => {
                tracing::trace!(element = %self.tag(), "process timed out");
            }
        }
    }
}
