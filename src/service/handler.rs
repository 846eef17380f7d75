//! Service-side reactions to element reports.

use crate::element::{AudioInfo, ElementState, ElementStatus};
use crate::pipeline::Pipeline;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Service-level event delivered to a user callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceEventCode {
    /// An element reported an error and the service was stopped.
    Error,
    /// The service finished and was stopped.
    Finished,
    /// Decoded music info became available.
    MusicInfo,
}

/// An event raised by a service listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEvent {
    /// What happened.
    pub code: ServiceEventCode,
    /// Tag of the element whose report caused the event.
    pub source_tag: String,
    /// The reported status, for `Error` and `Finished`.
    pub status: Option<ElementStatus>,
    /// The reported info, for `MusicInfo`.
    pub info: Option<AudioInfo>,
}

impl ServiceEvent {
    /// An error event caused by `status`.
    pub fn error(source_tag: impl Into<String>, status: ElementStatus) -> Self {
        Self {
            code: ServiceEventCode::Error,
            source_tag: source_tag.into(),
            status: Some(status),
            info: None,
        }
    }

    /// A finished event caused by `status`.
    pub fn finished(source_tag: impl Into<String>, status: ElementStatus) -> Self {
        Self {
            code: ServiceEventCode::Finished,
            source_tag: source_tag.into(),
            status: Some(status),
            info: None,
        }
    }

    /// A music info event.
    pub fn music_info(source_tag: impl Into<String>, info: AudioInfo) -> Self {
        Self {
            code: ServiceEventCode::MusicInfo,
            source_tag: source_tag.into(),
            status: None,
            info: Some(info),
        }
    }
}

/// The service a [`ServiceListener`](super::ServiceListener) acts on.
///
/// All methods run on the listener thread.
pub trait ServiceHandler: Send + 'static {
    /// Returns `true` while the service is playing or recording.
    ///
    /// Status reports arriving while inactive are ignored.
    fn is_active(&self) -> bool;

    /// Stop the service and rewind its pipeline.
    fn stop(&mut self);

    /// Deliver a service event to the user.
    fn notify(&mut self, event: ServiceEvent);

    /// Whether a stopped or finished report from `source_tag` ends the service.
    fn ends_service(&self, source_tag: &str) -> bool {
        let _ = source_tag;
        true
    }

    /// Handle decoded music info reported by `source_tag`.
    fn on_music_info(&mut self, source_tag: &str, info: AudioInfo) {
        self.notify(ServiceEvent::music_info(source_tag, info));
    }
}

/// User callback of a [`PipelineService`].
pub type ServiceCallback = Box<dyn FnMut(&ServiceEvent) + Send>;

/// A [`ServiceHandler`] driving a shared [`Pipeline`].
///
/// Stopping runs the two-phase pipeline stop, resets its ports and
/// elements and puts it back to `Init`. The pipeline lock is released
/// before the user callback runs, so the callback may restart the pipeline.
pub struct PipelineService {
    pipeline: Arc<Mutex<Pipeline>>,
    active: Arc<AtomicBool>,
    watched: Option<String>,
    music_sink: Option<String>,
    callback: Option<ServiceCallback>,
}

impl PipelineService {
    /// Create an inactive service over `pipeline`.
    pub fn new(pipeline: Arc<Mutex<Pipeline>>) -> Self {
        Self {
            pipeline,
            active: Arc::new(AtomicBool::new(false)),
            watched: None,
            music_sink: None,
            callback: None,
        }
    }

    /// Only a stopped or finished report from `tag` ends the service.
    pub fn with_watched(mut self, tag: impl Into<String>) -> Self {
        self.watched = Some(tag.into());
        self
    }

    /// Retune the element `tag` from reported music info instead of notifying.
    pub fn with_music_sink(mut self, tag: impl Into<String>) -> Self {
        self.music_sink = Some(tag.into());
        self
    }

    /// Set the user callback.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&ServiceEvent) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Shared activity flag; set it once the pipeline runs.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    /// Mark the service active or inactive.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

impl ServiceHandler for PipelineService {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        let mut pipeline = self.pipeline.lock().unwrap();
        if pipeline.state() == ElementState::Running {
            if let Err(e) = pipeline.stop() {
                tracing::warn!(pipeline = %pipeline.name(), error = %e, "service stop");
            }
            if let Err(e) = pipeline.wait_for_stop() {
                tracing::warn!(pipeline = %pipeline.name(), error = %e, "service wait for stop");
            }
        }
        pipeline.reset_port();
        pipeline.reset_elements();
        pipeline.change_state(ElementState::Init);
    }

    fn notify(&mut self, event: ServiceEvent) {
        if let Some(callback) = self.callback.as_mut() {
            callback(&event);
        }
    }

    fn ends_service(&self, source_tag: &str) -> bool {
        self.watched
            .as_deref()
            .is_none_or(|tag| tag.eq_ignore_ascii_case(source_tag))
    }

    fn on_music_info(&mut self, source_tag: &str, info: AudioInfo) {
        let Some(sink_tag) = self.music_sink.as_deref() else {
            self.notify(ServiceEvent::music_info(source_tag, info));
            return;
        };
        let sink = self.pipeline.lock().unwrap().get_by_tag(sink_tag);
        match sink {
            Some(sink) => {
                tracing::debug!(
                    element = %sink_tag,
                    rate = info.sample_rates,
                    channels = info.channels,
                    bits = info.bits,
                    "retune from music info"
                );
                sink.set_music_info(info.sample_rates, info.channels, info.bits);
            }
            None => tracing::warn!(element = %sink_tag, "music info sink not registered"),
        }
    }
}

impl fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineService")
            .field("active", &self.is_active())
            .field("watched", &self.watched)
            .field("music_sink", &self.music_sink)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Element, ElementConfig, from_process};
    use crate::pipeline::PipelineConfig;

    fn shared_pipeline() -> (Arc<Mutex<Pipeline>>, Element) {
        let mut pipeline = Pipeline::new(PipelineConfig::new("svc")).unwrap();
        let sink = Element::new(ElementConfig::new("sink"), from_process(|_, _| Ok(0))).unwrap();
        pipeline.register(&sink, "spk").unwrap();
        (Arc::new(Mutex::new(pipeline)), sink)
    }

    #[test]
    fn test_watched_element() {
        let (pipeline, _sink) = shared_pipeline();
        let any = PipelineService::new(Arc::clone(&pipeline));
        assert!(any.ends_service("dec"));

        let watched = PipelineService::new(pipeline).with_watched("SPK");
        assert!(watched.ends_service("spk"));
        assert!(!watched.ends_service("dec"));
    }

    #[test]
    fn test_music_info_retunes_sink() {
        let (pipeline, sink) = shared_pipeline();
        let mut service = PipelineService::new(pipeline).with_music_sink("spk");
        let info = AudioInfo {
            sample_rates: 16000,
            channels: 1,
            ..Default::default()
        };
        service.on_music_info("dec", info);
        assert_eq!(sink.info().sample_rates, 16000);
        assert_eq!(sink.info().channels, 1);
    }

    #[test]
    fn test_music_info_notifies_without_sink() {
        let (pipeline, _sink) = shared_pipeline();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let mut service = PipelineService::new(pipeline)
            .with_callback(move |ev: &ServiceEvent| seen_cb.lock().unwrap().push(ev.code));
        service.on_music_info("dec", AudioInfo::default());
        assert_eq!(*seen.lock().unwrap(), vec![ServiceEventCode::MusicInfo]);
    }

    #[test]
    fn test_stop_rewinds_idle_pipeline() {
        let (pipeline, _sink) = shared_pipeline();
        let mut service = PipelineService::new(Arc::clone(&pipeline));
        service.set_active(true);
        service.stop();
        assert!(!service.is_active());
        assert_eq!(pipeline.lock().unwrap().state(), ElementState::Init);
    }
}
