//! Echo cancellation inside a running pipeline.

use audioflow::element::{Element, ElementConfig, ElementState, from_process};
use audioflow::elements::{
    AecAlgorithm, AecAlgorithmConfig, AecConfig, AecMode, ArrayStream, ArrayStreamConfig,
    VadConfig, VadState,
};
use audioflow::error::Error;
use audioflow::pipeline::{Pipeline, PipelineConfig};
use audioflow::port::Port;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const FRAME: usize = 640;
const SAMPLES: usize = FRAME / 2;

fn to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn rms(samples: &[i16]) -> f64 {
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len().max(1) as f64).sqrt()
}

fn tone(count: usize, amplitude: f64) -> Vec<i16> {
    (0..count)
        .map(|i| (amplitude * (i as f64 * 2.0 * std::f64::consts::PI * 440.0 / 16000.0).sin()) as i16)
        .collect()
}

/// Deterministic wide-band reference signal.
fn noise(count: usize, seed: u32) -> Vec<i16> {
    let mut state = seed;
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((state >> 16) as i16) / 4
        })
        .collect()
}

fn stream_config(buffer_len: usize) -> ArrayStreamConfig {
    ArrayStreamConfig {
        buffer_len,
        ..Default::default()
    }
}

#[test]
fn test_dual_mic_without_reference() {
    let frames = 50;
    let mono = tone(frames * SAMPLES, 3000.0);
    let interleaved: Vec<i16> = mono.iter().flat_map(|&s| [s, s]).collect();

    let (mic, _) = ArrayStream::reader(stream_config(2 * FRAME), to_bytes(&interleaved)).unwrap();
    let (aec, handle) = AecAlgorithm::element(AecAlgorithmConfig {
        dual_ch: true,
        ..Default::default()
    })
    .unwrap();
    let (spk, captured) = ArrayStream::writer(stream_config(FRAME), frames * FRAME).unwrap();

    // Connect then drop the reference: every frame falls back to silence.
    aec.set_multi_input_port(Some(Port::ring_buffer("ref", 4 * FRAME).unwrap()), 0).unwrap();
    aec.set_multi_input_port(None, 0).unwrap();

    let mut pipeline = Pipeline::new(PipelineConfig::new("recorder")).unwrap();
    pipeline.register(&mic, "mic").unwrap();
    pipeline.register(&aec, "aec").unwrap();
    pipeline.register(&spk, "spk").unwrap();
    pipeline.link(&["mic", "aec", "spk"]).unwrap();
    pipeline.run().unwrap();
    pipeline.wait_for_stop().unwrap();

    let stats = handle.stats();
    assert_eq!(stats.frames, frames as u64);
    assert_eq!(stats.ref_zero_fill, frames as u64);
    let out = captured.captured();
    assert_eq!(out.len(), frames * FRAME);
    // The averaged microphones pass through the canceller untouched.
    assert!(rms(&to_samples(&out)) > 1000.0);
}

#[test]
fn test_reference_disconnected_mid_stream() {
    let frames = 50;
    let cut_at = 20;
    let mono = tone(frames * SAMPLES, 3000.0);
    let interleaved = to_bytes(&mono.iter().flat_map(|&s| [s, s]).collect::<Vec<_>>());

    let (aec, handle) = AecAlgorithm::element(AecAlgorithmConfig {
        dual_ch: true,
        ..Default::default()
    })
    .unwrap();
    let ref_port = Port::ring_buffer("ref", frames * FRAME).unwrap();
    ref_port.write(&to_bytes(&noise(frames * SAMPLES, 3)), None).unwrap();
    aec.set_multi_input_port(Some(ref_port), 0).unwrap();

    // The microphone drops the reference slot once the canceller is well under way.
    let mic = {
        let aec = aec.clone();
        let handle = handle.clone();
        let served = AtomicUsize::new(0);
        Element::new(
            ElementConfig::new("mic")
                .with_buffer_len(2 * FRAME)
                .with_read(move |buf, _| {
                    let index = served.fetch_add(1, Ordering::Relaxed);
                    if index == cut_at {
                        let deadline = Instant::now() + Duration::from_secs(2);
                        while handle.stats().frames < 5 && Instant::now() < deadline {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        aec.set_multi_input_port(None, 0).unwrap();
                    }
                    let start = index * 2 * FRAME;
                    if start >= interleaved.len() {
                        return Ok(0);
                    }
                    let n = buf.len().min(interleaved.len() - start);
                    buf[..n].copy_from_slice(&interleaved[start..start + n]);
                    Ok(n)
                }),
            from_process(|ctx, buf| {
                let n = ctx.input(buf)?;
                if n == 0 {
                    return Ok(0);
                }
                ctx.output(&buf[..n])
            }),
        )
        .unwrap()
    };
    let (spk, captured) = ArrayStream::writer(stream_config(FRAME), frames * FRAME).unwrap();

    let mut pipeline = Pipeline::new(PipelineConfig::new("recorder")).unwrap();
    pipeline.register(&mic, "mic").unwrap();
    pipeline.register(&aec, "aec").unwrap();
    pipeline.register(&spk, "spk").unwrap();
    pipeline.link(&["mic", "aec", "spk"]).unwrap();
    pipeline.run().unwrap();
    pipeline.wait_for_stop().unwrap();

    let stats = handle.stats();
    assert_eq!(stats.frames, frames as u64);
    assert_eq!(captured.captured().len(), frames * FRAME);
    assert!(stats.ref_zero_fill >= (frames - cut_at) as u64, "zero fill {}", stats.ref_zero_fill);
    assert!(stats.ref_zero_fill < frames as u64, "zero fill {}", stats.ref_zero_fill);
    assert!(aec.multi_input_port(0).is_none());
}

#[test]
fn test_reference_cancels_echo() {
    let frames = 50;
    let reference = noise(frames * SAMPLES, 7);
    let echo: Vec<i16> = reference.iter().map(|&s| s / 2).collect();

    let (mic, _) = ArrayStream::reader(stream_config(FRAME), to_bytes(&echo)).unwrap();
    let (aec, handle) = AecAlgorithm::element(AecAlgorithmConfig {
        aec: AecConfig {
            ec_only_output: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    let (spk, captured) = ArrayStream::writer(stream_config(FRAME), frames * FRAME).unwrap();

    let ref_port = Port::ring_buffer("ref", frames * FRAME).unwrap();
    ref_port.write(&to_bytes(&reference), None).unwrap();
    aec.set_multi_input_port(Some(ref_port), 0).unwrap();

    let mut pipeline = Pipeline::new(PipelineConfig::new("voip")).unwrap();
    pipeline.register(&mic, "mic").unwrap();
    pipeline.register(&aec, "aec").unwrap();
    pipeline.register(&spk, "spk").unwrap();
    pipeline.link(&["mic", "aec", "spk"]).unwrap();
    pipeline.run().unwrap();
    pipeline.wait_for_stop().unwrap();

    assert_eq!(handle.stats().frames, frames as u64);
    assert_eq!(handle.stats().ref_zero_fill, 0);

    let out = to_samples(&captured.captured());
    let tail = (frames - 10) * SAMPLES;
    assert!(rms(&out[tail..]) < rms(&echo[tail..]) / 2.0);
}

#[test]
fn test_vad_transitions_in_pipeline() {
    let mut samples = tone(10 * SAMPLES, 6000.0);
    samples.extend(std::iter::repeat_n(0i16, 10 * SAMPLES));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = Arc::clone(&seen);
    let (mic, _) = ArrayStream::reader(stream_config(FRAME), to_bytes(&samples)).unwrap();
    let (aec, handle) = AecAlgorithm::element(AecAlgorithmConfig {
        vad: VadConfig {
            enable: true,
            start_threshold_ms: 40,
            stop_threshold_ms: 40,
            silence_threshold_ms: 40,
            ..Default::default()
        },
        on_vad_state: Some(Box::new(move |state| seen_cb.lock().unwrap().push(state))),
        ..Default::default()
    })
    .unwrap();
    let (spk, _captured) = ArrayStream::writer(stream_config(FRAME), 20 * FRAME).unwrap();

    let mut pipeline = Pipeline::new(PipelineConfig::new("wakeup")).unwrap();
    pipeline.register(&mic, "mic").unwrap();
    pipeline.register(&aec, "aec").unwrap();
    pipeline.register(&spk, "spk").unwrap();
    pipeline.link(&["mic", "aec", "spk"]).unwrap();
    pipeline.run().unwrap();
    pipeline.wait_for_stop().unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![VadState::SpeechStart, VadState::SpeechEnd, VadState::Silence]
    );
    assert_eq!(handle.vad_state(), VadState::Silence);
    assert_eq!(handle.stats().vad_transitions, 3);
}

#[test]
fn test_invalid_config_fails_fast() {
    let bad_rate = AecAlgorithmConfig {
        aec: AecConfig {
            fs: 44100,
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(matches!(AecAlgorithm::element(bad_rate), Err(Error::InvalidConfig(_))));

    let dual_hw = AecAlgorithmConfig {
        dual_ch: true,
        aec: AecConfig {
            mode: AecMode::Hardware,
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(matches!(AecAlgorithm::element(dual_hw), Err(Error::InvalidConfig(_))));

    let vad_mismatch = AecAlgorithmConfig {
        aec: AecConfig {
            fs: 8000,
            ..Default::default()
        },
        vad: VadConfig {
            enable: true,
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(matches!(AecAlgorithm::element(vad_mismatch), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_retune_while_idle() {
    let (aec, handle) = AecAlgorithm::element(AecAlgorithmConfig::default()).unwrap();
    let (mut aec_config, vad_config) = handle.config();
    aec_config.ns_level = 3;
    handle.set_config(aec_config, vad_config).unwrap();
    assert_eq!(handle.config().0.ns_level, 3);
    assert_eq!(aec.state(), ElementState::Init);
}
