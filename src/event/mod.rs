//! Event interface: the queue through which elements report to listeners.
//!
//! An [`EventIface`] owns a bounded queue. Elements hold an [`EventSender`]
//! for it and publish [`EventMessage`]s without ever blocking: when the
//! queue is full the message is dropped and counted. A service listener
//! drains the queue with [`EventIface::listen`].
//!
//! # Example
//!
//! ```rust
//! use audioflow::element::{ElementId, ElementStatus};
//! use audioflow::event::{EventData, EventIface, EventIfaceConfig, EventMessage, MessageCommand};
//! use std::time::Duration;
//!
//! let iface = EventIface::new(EventIfaceConfig::default()).unwrap();
//! let sender = iface.sender();
//! sender.send(EventMessage::new_status(ElementId::new(), "mic", ElementStatus::StateFinished));
//!
//! let msg = iface.listen(Some(Duration::from_millis(10))).unwrap();
//! assert_eq!(msg.cmd, MessageCommand::ReportStatus);
//! assert_eq!(msg.status(), Some(ElementStatus::StateFinished));
//! ```

use crate::element::{AudioInfo, CodecFormat, ElementId, ElementStatus};
use crate::error::{Error, Result};
use crate::observability;
use bytes::Bytes;
use kanal::ReceiveErrorTimeout;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default depth of an event queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 5;

// ============================================================================
// Messages
// ============================================================================

/// What an event message reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCommand {
    /// A status transition.
    ReportStatus = 8,
    /// Decoded music format.
    ReportMusicInfo = 9,
    /// Encoded format.
    ReportCodecFmt = 10,
    /// Stream position.
    ReportPosition = 11,
}

impl MessageCommand {
    /// Numeric code of this command.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Payload of an event message.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    /// No payload.
    None,
    /// Status of a `ReportStatus` message.
    Status(ElementStatus),
    /// Info snapshot of a `ReportMusicInfo` message.
    MusicInfo(AudioInfo),
    /// Format of a `ReportCodecFmt` message.
    CodecFmt(CodecFormat),
    /// Info snapshot of a `ReportPosition` message.
    Position(AudioInfo),
    /// Opaque bytes for custom reports.
    Raw(Bytes),
}

/// A message published by an element.
///
/// The source is identified by id and tag rather than by handle, so a
/// listener never keeps an element alive.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    /// Id of the reporting element.
    pub source: ElementId,
    /// Tag of the reporting element at the time of the report.
    pub source_tag: String,
    /// What is being reported.
    pub cmd: MessageCommand,
    /// Payload.
    pub data: EventData,
}

impl EventMessage {
    /// Build a status report.
    pub fn new_status(source: ElementId, tag: impl Into<String>, status: ElementStatus) -> Self {
        Self {
            source,
            source_tag: tag.into(),
            cmd: MessageCommand::ReportStatus,
            data: EventData::Status(status),
        }
    }

    /// The reported status, for `ReportStatus` messages.
    pub fn status(&self) -> Option<ElementStatus> {
        match (self.cmd, &self.data) {
            (MessageCommand::ReportStatus, EventData::Status(s)) => Some(*s),
            _ => None,
        }
    }

    /// The carried info snapshot, for music info and position reports.
    pub fn info(&self) -> Option<&AudioInfo> {
        match &self.data {
            EventData::MusicInfo(info) | EventData::Position(info) => Some(info),
            _ => None,
        }
    }
}

impl fmt::Display for EventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status() {
            Some(status) => write!(f, "[{}] {:?} {}", self.source_tag, self.cmd, status),
            None => write!(f, "[{}] {:?}", self.source_tag, self.cmd),
        }
    }
}

// ============================================================================
// Interface
// ============================================================================

/// Configuration for an [`EventIface`].
#[derive(Debug, Clone)]
pub struct EventIfaceConfig {
    /// Queue depth.
    pub queue_depth: usize,
    /// Timeout used by [`EventIface::listen_default`].
    pub default_timeout: Option<Duration>,
}

impl Default for EventIfaceConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            default_timeout: None,
        }
    }
}

impl EventIfaceConfig {
    /// Set the queue depth.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the default listen timeout.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Statistics about an event queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventStats {
    /// Messages accepted by the queue.
    pub sent: u64,
    /// Messages dropped because the queue was full.
    pub dropped: u64,
}

#[derive(Default)]
struct StatsInner {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// A bounded event queue.
pub struct EventIface {
    tx: kanal::Sender<EventMessage>,
    rx: kanal::Receiver<EventMessage>,
    stats: Arc<StatsInner>,
    config: EventIfaceConfig,
}

impl EventIface {
    /// Create an event interface.
    pub fn new(config: EventIfaceConfig) -> Result<Self> {
        if config.queue_depth == 0 {
            return Err(Error::InvalidConfig("event queue depth must be > 0".into()));
        }
        let (tx, rx) = kanal::bounded(config.queue_depth);
        Ok(Self {
            tx,
            rx,
            stats: Arc::new(StatsInner::default()),
            config,
        })
    }

    /// Get a sender publishing into this queue.
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Wait for the next message.
    ///
    /// `None` waits forever. Returns `Error::Timeout` when nothing arrived.
    pub fn listen(&self, timeout: Option<Duration>) -> Result<EventMessage> {
        match timeout {
            None => self.rx.recv().map_err(|_| Error::ChannelClosed),
            Some(t) if t.is_zero() => self
                .try_listen()
                .ok_or_else(|| Error::Timeout("event listen".into())),
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(msg) => Ok(msg),
                Err(ReceiveErrorTimeout::Timeout) => Err(Error::Timeout("event listen".into())),
                Err(_) => Err(Error::ChannelClosed),
            },
        }
    }

    /// Wait for the next message using the configured default timeout.
    pub fn listen_default(&self) -> Result<EventMessage> {
        self.listen(self.config.default_timeout)
    }

    /// Take a message if one is pending.
    pub fn try_listen(&self) -> Option<EventMessage> {
        match self.rx.try_recv() {
            Ok(Some(msg)) => Some(msg),
            _ => None,
        }
    }

    /// Drop every pending message; returns how many were dropped.
    pub fn discard(&self) -> usize {
        let mut n = 0;
        while self.try_listen().is_some() {
            n += 1;
        }
        n
    }

    /// Number of pending messages.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if no message is pending.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Queue depth.
    pub fn capacity(&self) -> usize {
        self.config.queue_depth
    }

    /// Get queue statistics.
    pub fn stats(&self) -> EventStats {
        EventStats {
            sent: self.stats.sent.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for EventIface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventIface")
            .field("pending", &self.len())
            .field("depth", &self.config.queue_depth)
            .finish()
    }
}

/// Publishing half of an [`EventIface`].
#[derive(Clone)]
pub struct EventSender {
    tx: kanal::Sender<EventMessage>,
    stats: Arc<StatsInner>,
}

impl EventSender {
    /// Publish a message without blocking.
    ///
    /// Returns `false` if the queue was full or closed and the message was dropped.
    pub fn send(&self, msg: EventMessage) -> bool {
        let tag = msg.source_tag.clone();
        match self.tx.try_send(msg) {
            Ok(true) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(false) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                observability::record_event_dropped(&tag);
                tracing::warn!(element = %tag, "event queue full, message dropped");
                false
            }
            Err(_) => {
                tracing::debug!(element = %tag, "event queue closed");
                false
            }
        }
    }

    /// Returns `true` if both senders publish into the same queue.
    pub fn same_queue(&self, other: &EventSender) -> bool {
        Arc::ptr_eq(&self.stats, &other.stats)
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn report(status: ElementStatus) -> EventMessage {
        EventMessage::new_status(ElementId::new(), "el", status)
    }

    #[test]
    fn test_send_and_listen() {
        let iface = EventIface::new(EventIfaceConfig::default()).unwrap();
        assert!(iface.sender().send(report(ElementStatus::StateRunning)));
        assert_eq!(iface.len(), 1);

        let msg = iface.listen(None).unwrap();
        assert_eq!(msg.status(), Some(ElementStatus::StateRunning));
        assert!(iface.is_empty());
    }

    #[test]
    fn test_full_queue_drops() {
        let iface = EventIface::new(EventIfaceConfig::default()).unwrap();
        let sender = iface.sender();
        for _ in 0..DEFAULT_QUEUE_DEPTH {
            assert!(sender.send(report(ElementStatus::StateRunning)));
        }
        assert!(!sender.send(report(ElementStatus::ErrorProcess)));

        let stats = iface.stats();
        assert_eq!(stats.sent, 5);
        assert_eq!(stats.dropped, 1);
        assert_eq!(iface.discard(), 5);
    }

    #[test]
    fn test_listen_timeout() {
        let iface = EventIface::new(EventIfaceConfig::default()).unwrap();
        let err = iface.listen(Some(Duration::from_millis(10))).unwrap_err();
        assert!(err.is_timeout());
        assert!(iface.listen(Some(Duration::ZERO)).unwrap_err().is_timeout());
    }

    #[test]
    fn test_listen_wakes_on_send() {
        let iface = EventIface::new(EventIfaceConfig::default()).unwrap();
        let sender = iface.sender();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.send(report(ElementStatus::StateFinished))
        });

        let msg = iface.listen(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(msg.status(), Some(ElementStatus::StateFinished));
        assert!(producer.join().unwrap());
    }

    #[test]
    fn test_zero_depth_rejected() {
        assert!(EventIface::new(EventIfaceConfig::default().with_queue_depth(0)).is_err());
    }

    #[test]
    fn test_message_accessors() {
        let msg = EventMessage {
            source: ElementId::new(),
            source_tag: "dec".into(),
            cmd: MessageCommand::ReportMusicInfo,
            data: EventData::MusicInfo(AudioInfo::pcm(16000, 1, 16)),
        };
        assert_eq!(msg.status(), None);
        assert_eq!(msg.info().unwrap().sample_rates, 16000);
        assert_eq!(MessageCommand::ReportPosition.code(), 11);
        assert_eq!(msg.to_string(), "[dec] ReportMusicInfo");
    }
}
