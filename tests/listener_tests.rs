//! Service listener reacting to a live pipeline.

use audioflow::element::{Element, ElementConfig, ElementState, from_process};
use audioflow::error::IoError;
use audioflow::event::{EventIface, EventIfaceConfig};
use audioflow::pipeline::{Pipeline, PipelineConfig};
use audioflow::service::{
    ListenerConfig, PipelineService, ServiceEvent, ServiceEventCode, ServiceListener,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const FRAME: usize = 320;

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn live_source() -> Element {
    Element::new(
        ElementConfig::new("mic")
            .with_buffer_len(FRAME)
            .with_read(|buf: &mut [u8], _timeout| {
                thread::sleep(Duration::from_millis(1));
                buf.fill(1);
                Ok(buf.len())
            }),
        from_process(|ctx, buf| {
            let n = ctx.input(buf)?;
            ctx.output(&buf[..n])
        }),
    )
    .unwrap()
}

/// Fails its process call after `frames` good frames.
fn failing_filter(frames: usize) -> Element {
    let seen = AtomicUsize::new(0);
    Element::new(
        ElementConfig::new("filter").with_buffer_len(FRAME),
        from_process(move |ctx, buf| {
            let n = ctx.input(buf)?;
            if seen.fetch_add(1, Ordering::SeqCst) >= frames {
                return Err(IoError::ProcessFail);
            }
            ctx.output(&buf[..n])
        }),
    )
    .unwrap()
}

fn sink() -> Element {
    Element::new(
        ElementConfig::new("spk")
            .with_buffer_len(FRAME)
            .with_input_timeout(Some(Duration::from_millis(20))),
        from_process(|ctx, buf| ctx.input(buf)),
    )
    .unwrap()
}

struct Harness {
    pipeline: Arc<Mutex<Pipeline>>,
    listener: ServiceListener,
    events: Arc<Mutex<Vec<ServiceEvent>>>,
    active: Arc<std::sync::atomic::AtomicBool>,
    elements: Vec<Element>,
}

fn harness(filter: Element, watched: Option<&str>) -> Harness {
    let iface = Arc::new(EventIface::new(EventIfaceConfig::default()).unwrap());
    let elements = vec![live_source(), filter, sink()];

    let mut pipeline = Pipeline::new(PipelineConfig::new("recorder")).unwrap();
    for el in &elements {
        pipeline.register(el, &el.tag()).unwrap();
    }
    pipeline.link(&["mic", "filter", "spk"]).unwrap();
    pipeline.set_listener(&iface);
    let pipeline = Arc::new(Mutex::new(pipeline));

    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&events);
    let mut service = PipelineService::new(Arc::clone(&pipeline))
        .with_callback(move |ev: &ServiceEvent| recorded.lock().unwrap().push(ev.clone()));
    if let Some(tag) = watched {
        service = service.with_watched(tag);
    }
    let active = service.active_flag();

    let listener = ServiceListener::spawn(ListenerConfig::new("recorder"), iface, service).unwrap();
    Harness {
        pipeline,
        listener,
        events,
        active,
        elements,
    }
}

#[test]
fn test_process_error_stops_pipeline_once() {
    let mut h = harness(failing_filter(20), None);
    h.listener.start().unwrap();
    thread::sleep(Duration::from_millis(20));

    h.active.store(true, Ordering::Release);
    h.pipeline.lock().unwrap().run().unwrap();

    assert!(wait_for(|| !h.events.lock().unwrap().is_empty()));
    assert!(wait_for(|| h.pipeline.lock().unwrap().state() == ElementState::Init));
    // Late stop reports from the other elements must not raise a second event.
    thread::sleep(Duration::from_millis(50));

    let events = h.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, ServiceEventCode::Error);
    assert_eq!(events[0].source_tag, "filter");
    assert!(!h.active.load(Ordering::Acquire));
    assert!(h.elements.iter().all(|el| !el.is_running()));

    h.listener.exit().unwrap();
}

#[test]
fn test_restart_after_error() {
    let mut h = harness(failing_filter(5), None);
    h.listener.start().unwrap();
    thread::sleep(Duration::from_millis(20));

    h.active.store(true, Ordering::Release);
    h.pipeline.lock().unwrap().run().unwrap();
    assert!(wait_for(|| h.events.lock().unwrap().len() == 1));
    assert!(wait_for(|| h.pipeline.lock().unwrap().state() == ElementState::Init));

    // The listener idled itself; starting it again discards stale reports.
    h.listener.start().unwrap();
    thread::sleep(Duration::from_millis(20));
    h.active.store(true, Ordering::Release);
    h.pipeline.lock().unwrap().run().unwrap();
    assert!(wait_for(|| h.events.lock().unwrap().len() == 2));
    assert_eq!(h.events.lock().unwrap()[1].code, ServiceEventCode::Error);

    h.listener.exit().unwrap();
}

#[test]
fn test_inactive_service_ignores_errors() {
    let mut h = harness(failing_filter(3), None);
    h.listener.start().unwrap();
    thread::sleep(Duration::from_millis(20));

    h.pipeline.lock().unwrap().run().unwrap();
    assert!(wait_for(|| h.elements[1].state() == ElementState::Error));
    thread::sleep(Duration::from_millis(50));
    assert!(h.events.lock().unwrap().is_empty());

    h.listener.exit().unwrap();
    let mut pipeline = h.pipeline.lock().unwrap();
    pipeline.stop().unwrap();
    pipeline.wait_for_stop().unwrap();
}

#[test]
fn test_exit_from_idle() {
    let mut h = harness(failing_filter(0), Some("spk"));
    assert!(h.listener.is_running());
    h.listener.idle().unwrap();
    h.listener.exit().unwrap();
    assert!(!h.listener.is_running());
    h.pipeline.lock().unwrap().deinit();
}
