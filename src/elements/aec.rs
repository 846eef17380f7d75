//! Acoustic echo cancellation with noise suppression and voice activity detection.
//!
//! [`AecAlgorithm`] consumes 20 ms frames of 16-bit PCM from a microphone
//! and a far-end reference, removes the echo of the reference with an NLMS
//! adaptive filter, gates residual noise and emits one processed frame per
//! input frame.
//!
//! The reference comes from one of three places:
//!
//! | Input | Reference |
//! |-------|-----------|
//! | hardware mode | right channel of the interleaved input frame |
//! | software mode | multi-input port 0, one frame |
//! | dual-channel  | multi-input port 0, half the (two-mic) input |
//!
//! A reference that does not arrive in time is replaced by silence and
//! counted in [`AecStats::ref_zero_fill`]; processing never fails on it.
//!
//! With VAD enabled, output passes through a hold-back queue so the frames
//! leading up to a detected speech onset are still delivered, and frames
//! after speech ends are held back instead of passed on.
//!
//! # Example
//!
//! ```rust
//! use audioflow::elements::{AecAlgorithm, AecAlgorithmConfig, AecConfig};
//!
//! let config = AecAlgorithmConfig {
//!     aec: AecConfig { fs: 8000, ..Default::default() },
//!     ..Default::default()
//! };
//! let (aec, handle) = AecAlgorithm::element(config).unwrap();
//! assert_eq!(handle.frame_size(), 320);
//! assert_eq!(aec.multi_input_max(), 1);
//!
//! // Illegal sample rates are rejected before anything is created.
//! let bad = AecAlgorithmConfig {
//!     aec: AecConfig { fs: 44100, ..Default::default() },
//!     ..Default::default()
//! };
//! assert!(AecAlgorithm::element(bad).is_err());
//! ```

use crate::element::{AudioElement, Element, ElementConfig, ElementContext};
use crate::error::{Error, IoError, IoResult, Result};
use crate::observability;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Frame duration in milliseconds.
pub const FRAME_MS: u32 = 20;

/// Largest supported reference delay, in samples.
pub const MAX_DELAY_POINTS: u16 = 1000;

/// Where the canceller gets its reference from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AecMode {
    /// Mic and reference arrive interleaved in the input frame (left, right).
    Hardware,
    /// The reference arrives on multi-input port 0.
    #[default]
    Software,
}

/// Noise suppression flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NsType {
    /// No noise suppression.
    Close,
    /// Model-based suppression; uses the same energy gate here.
    Ai,
    /// Energy gate.
    #[default]
    Traditional,
}

/// Voice activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum VadState {
    /// No decision yet.
    #[default]
    None = 0,
    /// Speech started.
    SpeechStart = 1,
    /// Speech ended.
    SpeechEnd = 2,
    /// Silence after speech.
    Silence = 3,
}

impl VadState {
    /// Static name, used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            VadState::None => "vad_none",
            VadState::SpeechStart => "vad_speech_start",
            VadState::SpeechEnd => "vad_speech_end",
            VadState::Silence => "vad_silence",
        }
    }

    /// Returns `true` if the detector may move from `self` to `next`.
    ///
    /// A state is never re-entered and `None` is never re-entered once left.
    pub fn can_enter(self, next: VadState) -> bool {
        self != next && next != VadState::None
    }
}

impl fmt::Display for VadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Echo canceller and noise suppressor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AecConfig {
    /// Reference source.
    pub mode: AecMode,
    /// Sample rate; 8000 or 16000.
    pub fs: u32,
    /// Reference delay in samples.
    pub delay_points: u16,
    /// Echo tail depth, 1 to 50; each step adds eight filter taps.
    pub ec_depth: u8,
    /// Reference gain as a left shift, 0 to 2.
    pub ref_scale: u8,
    /// Speaker volume level, 0 to 15.
    pub voice_vol: u8,
    /// Double-talk threshold, 10 to 64; a larger value adapts more cautiously.
    pub tx_rx_thr: u8,
    /// Adaptation floor, 1 to 10.
    pub tx_rx_flr: u8,
    /// Noise suppression flavour.
    pub ns_type: NsType,
    /// Noise gate level, 0 to 8; smaller gates a lower noise floor.
    pub ns_level: u8,
    /// Noise gate strength, 0 to 2.
    pub ns_para: u8,
    /// Output gain, `0x10` (unity) to `0x1f`.
    pub drc: u8,
    /// Emit the canceller output only, without suppression or gain.
    pub ec_only_output: bool,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            mode: AecMode::Software,
            fs: 16000,
            delay_points: 0,
            ec_depth: 20,
            ref_scale: 0,
            voice_vol: 14,
            tx_rx_thr: 30,
            tx_rx_flr: 6,
            ns_type: NsType::Traditional,
            ns_level: 7,
            ns_para: 2,
            drc: 0x15,
            ec_only_output: false,
        }
    }
}

impl AecConfig {
    /// Size of one 20 ms frame in bytes.
    pub fn frame_size(&self) -> usize {
        (self.fs / 1000 * 2 * FRAME_MS) as usize
    }

    fn validate(&self) -> Result<()> {
        if self.fs != 8000 && self.fs != 16000 {
            return Err(Error::InvalidConfig(format!(
                "aec sample rate must be 8000 or 16000, got {}",
                self.fs
            )));
        }
        if self.ec_depth == 0 || self.ec_depth > 50 {
            return Err(Error::InvalidConfig(format!(
                "aec ec_depth must be in 1..=50, got {}",
                self.ec_depth
            )));
        }
        if self.delay_points > MAX_DELAY_POINTS {
            return Err(Error::InvalidConfig(format!(
                "aec delay_points must be <= {MAX_DELAY_POINTS}, got {}",
                self.delay_points
            )));
        }
        if self.ref_scale > 2 {
            return Err(Error::InvalidConfig(format!(
                "aec ref_scale must be 0, 1 or 2, got {}",
                self.ref_scale
            )));
        }
        if self.ns_level > 8 {
            return Err(Error::InvalidConfig(format!(
                "aec ns_level must be <= 8, got {}",
                self.ns_level
            )));
        }
        if self.ns_para > 2 {
            return Err(Error::InvalidConfig(format!(
                "aec ns_para must be 0, 1 or 2, got {}",
                self.ns_para
            )));
        }
        Ok(())
    }
}

/// Voice activity detector settings.
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Run the detector and hold back non-speech output.
    pub enable: bool,
    /// Voiced time needed to declare speech start.
    pub start_threshold_ms: u32,
    /// Unvoiced time needed to declare speech end.
    pub stop_threshold_ms: u32,
    /// Further unvoiced time after speech end before declaring silence.
    pub silence_threshold_ms: u32,
    /// RMS level above which a frame counts as voiced.
    pub eng_threshold: u32,
    /// Hold-back capacity in bytes.
    pub buf_size: usize,
    /// Frame size in bytes; must equal the canceller frame.
    pub frame_size: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enable: false,
            start_threshold_ms: 480,
            stop_threshold_ms: 960,
            silence_threshold_ms: 320,
            eng_threshold: 2000,
            buf_size: 15360,
            frame_size: 640,
        }
    }
}

impl VadConfig {
    fn frames(ms: u32) -> usize {
        (ms / FRAME_MS).max(1) as usize
    }

    fn validate(&self, frame_size: usize) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        if self.frame_size != frame_size {
            return Err(Error::InvalidConfig(format!(
                "vad frame size {} does not match the aec frame {frame_size}",
                self.frame_size
            )));
        }
        if self.buf_size < frame_size {
            return Err(Error::InvalidConfig(format!(
                "vad buffer of {} bytes holds no frame",
                self.buf_size
            )));
        }
        Ok(())
    }
}

/// Called once per VAD state transition.
pub type VadCallback = Box<dyn FnMut(VadState) + Send>;

/// Called with every processed frame before hold-back.
pub type EcOutCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Configuration of an AEC element.
pub struct AecAlgorithmConfig {
    /// Canceller settings.
    pub aec: AecConfig,
    /// Detector settings.
    pub vad: VadConfig,
    /// Input carries two microphones; the reference is half the input size.
    pub dual_ch: bool,
    /// Linked output ring size; `0` uses the pipeline's default.
    pub out_rb_size: usize,
    /// Number of multi-output ports fed with every processed frame.
    pub multi_out_port_num: usize,
    /// Wait for reference data; `Some(ZERO)` never waits.
    pub ref_timeout: Option<Duration>,
    /// Element tag.
    pub tag: String,
    /// VAD transition callback.
    pub on_vad_state: Option<VadCallback>,
    /// Processed frame callback.
    pub on_ec_out: Option<EcOutCallback>,
}

impl Default for AecAlgorithmConfig {
    fn default() -> Self {
        Self {
            aec: AecConfig::default(),
            vad: VadConfig::default(),
            dual_ch: false,
            out_rb_size: 0,
            multi_out_port_num: 0,
            ref_timeout: Some(Duration::ZERO),
            tag: "aec_algorithm".to_string(),
            on_vad_state: None,
            on_ec_out: None,
        }
    }
}

impl fmt::Debug for AecAlgorithmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AecAlgorithmConfig")
            .field("aec", &self.aec)
            .field("vad", &self.vad)
            .field("dual_ch", &self.dual_ch)
            .field("out_rb_size", &self.out_rb_size)
            .field("multi_out_port_num", &self.multi_out_port_num)
            .field("ref_timeout", &self.ref_timeout)
            .finish_non_exhaustive()
    }
}

/// Counters of an AEC element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AecStats {
    /// Frames processed.
    pub frames: u64,
    /// Frames whose reference was replaced by silence.
    pub ref_zero_fill: u64,
    /// VAD state transitions.
    pub vad_transitions: u64,
    /// Frames dropped from a full hold-back queue.
    pub holdback_dropped: u64,
}

struct Shared {
    aec: AecConfig,
    vad: VadConfig,
    dirty: bool,
    vad_state: VadState,
    stats: AecStats,
}

/// Handle for inspecting and retuning a running AEC element.
#[derive(Clone)]
pub struct AecHandle {
    shared: Arc<Mutex<Shared>>,
}

impl AecHandle {
    /// Current VAD state.
    pub fn vad_state(&self) -> VadState {
        self.shared.lock().unwrap().vad_state
    }

    /// Current settings.
    pub fn config(&self) -> (AecConfig, VadConfig) {
        let shared = self.shared.lock().unwrap();
        (shared.aec.clone(), shared.vad.clone())
    }

    /// Retune the element; applied from the next frame.
    ///
    /// The mode, sample rate and VAD enable flag are fixed at creation.
    pub fn set_config(&self, aec: AecConfig, vad: VadConfig) -> Result<()> {
        aec.validate()?;
        let mut shared = self.shared.lock().unwrap();
        if aec.mode != shared.aec.mode || aec.fs != shared.aec.fs {
            return Err(Error::InvalidConfig(
                "aec mode and sample rate cannot change after creation".into(),
            ));
        }
        if vad.enable != shared.vad.enable {
            return Err(Error::InvalidConfig(
                "vad cannot be toggled after creation".into(),
            ));
        }
        vad.validate(aec.frame_size())?;
        shared.aec = aec;
        shared.vad = vad;
        shared.dirty = true;
        Ok(())
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> AecStats {
        self.shared.lock().unwrap().stats
    }

    /// Size of one frame in bytes.
    pub fn frame_size(&self) -> usize {
        self.shared.lock().unwrap().aec.frame_size()
    }
}

impl fmt::Debug for AecHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AecHandle")
            .field("vad_state", &self.vad_state())
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// DSP
// ============================================================================

fn read_samples(bytes: &[u8], out: &mut [i16]) {
    for (s, b) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *s = i16::from_le_bytes([b[0], b[1]]);
    }
}

fn write_samples(samples: &[i16], out: &mut [u8]) {
    for (b, s) in out.chunks_exact_mut(2).zip(samples) {
        b.copy_from_slice(&s.to_le_bytes());
    }
}

fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

fn saturate(v: f32) -> i16 {
    v.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Normalized LMS echo canceller.
struct Canceller {
    weights: Vec<f32>,
    history: VecDeque<f32>,
    delay: usize,
    ref_shift: u8,
    step: f32,
    dt_ratio: f32,
}

impl Canceller {
    fn new(config: &AecConfig) -> Self {
        let taps = usize::from(config.ec_depth) * 8;
        let delay = usize::from(config.delay_points);
        let mut canceller = Self {
            weights: vec![0.0; taps],
            history: VecDeque::from(vec![0.0; taps + delay]),
            delay,
            ref_shift: 0,
            step: 0.0,
            dt_ratio: 0.0,
        };
        canceller.retune(config);
        canceller
    }

    /// Apply tunables without losing the adapted filter.
    fn retune(&mut self, config: &AecConfig) {
        let taps = self.weights.len();
        let delay = usize::from(config.delay_points);
        if delay != self.delay {
            self.history = VecDeque::from(vec![0.0; taps + delay]);
            self.delay = delay;
        }
        self.ref_shift = config.ref_scale;
        self.step = f32::from(config.tx_rx_flr.clamp(1, 10)) / 20.0;
        self.dt_ratio = f32::from(config.tx_rx_thr.clamp(10, 64)) / 16.0;
    }

    fn process(&mut self, mic: &[i16], reference: &[i16], out: &mut [i16]) {
        let taps = self.weights.len();
        let scale = f32::from(1u16 << self.ref_shift);
        for ((&m, &r), o) in mic.iter().zip(reference).zip(out.iter_mut()) {
            self.history.pop_back();
            self.history.push_front(f32::from(r) * scale);

            let window = self.history.range(self.delay..self.delay + taps);
            let energy: f32 = window.clone().map(|x| x * x).sum();
            let estimate: f32 = self.weights.iter().zip(window).map(|(w, x)| w * x).sum();
            let mic = f32::from(m);
            let err = mic - estimate;
            *o = saturate(err);

            // Freeze adaptation while the near end dominates the reference.
            if energy > 0.0 && mic * mic <= self.dt_ratio * energy {
                let mu = self.step / (energy + 1.0);
                let window = self.history.range(self.delay..self.delay + taps);
                for (w, x) in self.weights.iter_mut().zip(window) {
                    *w += mu * err * x;
                }
            }
        }
    }
}

/// Frame-level noise gate and output gain.
struct Suppressor {
    enabled: bool,
    threshold: f32,
    attenuation: f32,
    gain: f32,
}

impl Suppressor {
    fn new(config: &AecConfig) -> Self {
        let enabled = !config.ec_only_output && config.ns_type != NsType::Close;
        let gain = if config.ec_only_output || config.drc < 0x10 {
            1.0
        } else {
            1.0 + f32::from(config.drc - 0x10) / 16.0
        };
        Self {
            enabled,
            threshold: 32.0 * f32::from(9 - config.ns_level.min(8)),
            attenuation: 1.0 / f32::from(2u8 << config.ns_para.min(2)),
            gain,
        }
    }

    fn process(&self, frame: &mut [i16]) {
        let scale = if self.enabled && rms(frame) < self.threshold {
            self.attenuation
        } else {
            1.0
        } * self.gain;
        if scale != 1.0 {
            for s in frame.iter_mut() {
                *s = saturate(f32::from(*s) * scale);
            }
        }
    }
}

/// Frame-level energy detector.
struct Vad {
    start_frames: usize,
    stop_frames: usize,
    silence_frames: usize,
    threshold: f32,
    voiced_run: usize,
    unvoiced_run: usize,
    state: VadState,
}

impl Vad {
    fn new(config: &VadConfig) -> Self {
        let mut vad = Self {
            start_frames: 0,
            stop_frames: 0,
            silence_frames: 0,
            threshold: 0.0,
            voiced_run: 0,
            unvoiced_run: 0,
            state: VadState::None,
        };
        vad.retune(config);
        vad
    }

    fn retune(&mut self, config: &VadConfig) {
        self.start_frames = VadConfig::frames(config.start_threshold_ms);
        self.stop_frames = VadConfig::frames(config.stop_threshold_ms);
        self.silence_frames = VadConfig::frames(config.silence_threshold_ms);
        self.threshold = config.eng_threshold as f32;
    }

    /// Feed one frame; returns the new state if it changed.
    fn update(&mut self, frame: &[i16]) -> Option<VadState> {
        if rms(frame) >= self.threshold {
            self.voiced_run += 1;
            self.unvoiced_run = 0;
        } else {
            self.unvoiced_run += 1;
            self.voiced_run = 0;
        }
        let next = match self.state {
            VadState::SpeechStart if self.unvoiced_run >= self.stop_frames => VadState::SpeechEnd,
            VadState::SpeechEnd if self.voiced_run >= self.start_frames => VadState::SpeechStart,
            VadState::SpeechEnd if self.unvoiced_run >= self.stop_frames + self.silence_frames => {
                VadState::Silence
            }
            VadState::None | VadState::Silence if self.voiced_run >= self.start_frames => {
                VadState::SpeechStart
            }
            state => state,
        };
        if self.state.can_enter(next) {
            self.state = next;
            Some(next)
        } else {
            None
        }
    }
}

/// Output delay line used while VAD is enabled.
struct HoldBack {
    frames: VecDeque<Vec<u8>>,
    frame_size: usize,
    limit: usize,
    backlog: usize,
}

impl HoldBack {
    fn new(config: &VadConfig, frame_size: usize, prefill: usize) -> Self {
        let mut frames = VecDeque::with_capacity(config.buf_size / frame_size + 4);
        frames.extend((0..prefill).map(|_| vec![0u8; frame_size]));
        Self {
            frames,
            frame_size,
            limit: config.buf_size,
            backlog: 0,
        }
    }

    fn filled(&self) -> usize {
        self.frames.len() * self.frame_size
    }

    /// Queue `current` and write the frame the VAD state releases, if any.
    ///
    /// A queued frame leaves the queue only after `write` accepted it.
    fn push<W, D>(&mut self, state: VadState, current: &[u8], mut write: W, mut on_drop: D) -> IoResult
    where
        W: FnMut(&[u8]) -> IoResult,
        D: FnMut(),
    {
        let frame = self.frame_size;
        if state == VadState::SpeechEnd {
            let mut written = frame;
            if self.backlog >= frame {
                if let Some(old) = self.frames.front() {
                    written = write(old)?;
                    self.frames.pop_front();
                }
                self.backlog -= frame;
            }
            if self.limit < self.filled() + frame {
                self.frames.pop_front();
                on_drop();
            }
            self.frames.push_back(current.to_vec());
            return Ok(written);
        }

        self.frames.push_back(current.to_vec());
        let written = match self.frames.front() {
            Some(old) => write(old)?,
            None => frame,
        };
        self.frames.pop_front();
        self.backlog = self.filled();
        Ok(written)
    }
}

// ============================================================================
// Element
// ============================================================================

/// The AEC/VAD element callbacks.
pub struct AecAlgorithm {
    shared: Arc<Mutex<Shared>>,
    mode: AecMode,
    dual_ch: bool,
    frame_size: usize,
    ref_timeout: Option<Duration>,
    vad_enabled: bool,
    on_vad_state: Option<VadCallback>,
    on_ec_out: Option<EcOutCallback>,
    metrics_tag: String,
    // Built by `open`.
    canceller: Option<Canceller>,
    suppressor: Option<Suppressor>,
    vad: Option<Vad>,
    holdback: Option<HoldBack>,
    mic: Vec<i16>,
    reference: Vec<i16>,
    ref_bytes: Vec<u8>,
    out: Vec<i16>,
    out_bytes: Vec<u8>,
}

impl AecAlgorithm {
    /// Validate `config` and create the element with its handle.
    ///
    /// Nothing is allocated when validation fails.
    pub fn element(config: AecAlgorithmConfig) -> Result<(Element, AecHandle)> {
        config.aec.validate()?;
        let frame_size = config.aec.frame_size();
        config.vad.validate(frame_size)?;
        if config.dual_ch && config.aec.mode == AecMode::Hardware {
            return Err(Error::InvalidConfig(
                "dual-channel input carries no reference channel; use software mode".into(),
            ));
        }

        let buffer_len = if config.dual_ch || config.aec.mode == AecMode::Hardware {
            frame_size * 2
        } else {
            frame_size
        };
        let element_config = ElementConfig::new(config.tag.clone())
            .with_buffer_len(buffer_len)
            .with_out_rb(config.out_rb_size)
            .with_multi_ports(1, config.multi_out_port_num);

        let shared = Arc::new(Mutex::new(Shared {
            aec: config.aec.clone(),
            vad: config.vad.clone(),
            dirty: false,
            vad_state: VadState::None,
            stats: AecStats::default(),
        }));
        let algorithm = AecAlgorithm {
            shared: Arc::clone(&shared),
            mode: config.aec.mode,
            dual_ch: config.dual_ch,
            frame_size,
            ref_timeout: config.ref_timeout,
            vad_enabled: config.vad.enable,
            on_vad_state: config.on_vad_state,
            on_ec_out: config.on_ec_out,
            metrics_tag: config.tag,
            canceller: None,
            suppressor: None,
            vad: None,
            holdback: None,
            mic: vec![0; frame_size / 2],
            reference: vec![0; frame_size / 2],
            ref_bytes: vec![0; frame_size],
            out: vec![0; frame_size / 2],
            out_bytes: vec![0; frame_size],
        };
        let element = Element::new(element_config, algorithm)?;
        Ok((element, AecHandle { shared }))
    }

    fn apply_pending_config(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        if !shared.dirty {
            return;
        }
        shared.dirty = false;
        if let Some(canceller) = self.canceller.as_mut() {
            canceller.retune(&shared.aec);
        }
        self.suppressor = Some(Suppressor::new(&shared.aec));
        if let Some(vad) = self.vad.as_mut() {
            vad.retune(&shared.vad);
        }
        if let Some(holdback) = self.holdback.as_mut() {
            holdback.limit = shared.vad.buf_size;
        }
    }

    /// Split the input into mic and reference samples.
    fn split_input(&mut self, ctx: &ElementContext<'_>, input: &[u8], len: usize) {
        let samples = self.frame_size / 2;
        self.mic.fill(0);
        match (self.mode, self.dual_ch) {
            (AecMode::Hardware, _) => {
                self.reference.fill(0);
                for (i, lr) in input[..len].chunks_exact(4).take(samples).enumerate() {
                    self.mic[i] = i16::from_le_bytes([lr[0], lr[1]]);
                    self.reference[i] = i16::from_le_bytes([lr[2], lr[3]]);
                }
            }
            (AecMode::Software, true) => {
                // Average the two microphones into the canceller input.
                for (i, pair) in input[..len].chunks_exact(4).take(samples).enumerate() {
                    let a = i32::from(i16::from_le_bytes([pair[0], pair[1]]));
                    let b = i32::from(i16::from_le_bytes([pair[2], pair[3]]));
                    self.mic[i] = ((a + b) / 2) as i16;
                }
                self.read_reference(ctx, input.len() / 2);
            }
            (AecMode::Software, false) => {
                read_samples(&input[..len], &mut self.mic);
                self.read_reference(ctx, input.len());
            }
        }
    }

    fn read_reference(&mut self, ctx: &ElementContext<'_>, want: usize) {
        let want = want.min(self.ref_bytes.len());
        let got = ctx.multi_input(&mut self.ref_bytes[..want], 0, self.ref_timeout);
        if got == Ok(want) {
            read_samples(&self.ref_bytes[..want], &mut self.reference);
            return;
        }
        self.reference.fill(0);
        self.shared.lock().unwrap().stats.ref_zero_fill += 1;
        observability::record_ref_zero_fill(&self.metrics_tag);
        tracing::debug!(element = %ctx.tag(), want, result = ?got, "reference short, zero-filled");
    }

    fn run_vad(&mut self, ctx: &ElementContext<'_>) {
        let Some(vad) = self.vad.as_mut() else {
            return;
        };
        let Some(next) = vad.update(&self.out) else {
            return;
        };
        let previous = {
            let mut shared = self.shared.lock().unwrap();
            let previous = shared.vad_state;
            shared.vad_state = next;
            shared.stats.vad_transitions += 1;
            previous
        };
        tracing::debug!(element = %ctx.tag(), from = %previous, to = %next, "vad state");
        observability::record_vad_transition(&self.metrics_tag, next.as_str());
        if let Some(callback) = self.on_vad_state.as_mut() {
            callback(next);
        }
    }

    /// Emit the processed frame, through the hold-back queue when VAD has decided.
    fn emit(&mut self, ctx: &ElementContext<'_>) -> IoResult {
        let state = self.vad.as_ref().map_or(VadState::None, |v| v.state);
        let Some(holdback) = self.holdback.as_mut().filter(|_| state != VadState::None) else {
            return ctx.output(&self.out_bytes);
        };
        let shared = &self.shared;
        holdback.push(
            state,
            &self.out_bytes,
            |frame| ctx.output(frame),
            || shared.lock().unwrap().stats.holdback_dropped += 1,
        )
    }
}

impl AudioElement for AecAlgorithm {
    fn open(&mut self, ctx: &ElementContext<'_>) -> std::result::Result<(), IoError> {
        let (aec, vad) = {
            let mut shared = self.shared.lock().unwrap();
            shared.dirty = false;
            shared.vad_state = VadState::None;
            (shared.aec.clone(), shared.vad.clone())
        };
        self.canceller = Some(Canceller::new(&aec));
        self.suppressor = Some(Suppressor::new(&aec));
        if self.vad_enabled {
            let detector = Vad::new(&vad);
            let prefill = 2 + detector.start_frames;
            self.holdback = Some(HoldBack::new(&vad, self.frame_size, prefill));
            self.vad = Some(detector);
            tracing::debug!(element = %ctx.tag(), prefill, "vad hold-back ready");
        }
        tracing::debug!(
            element = %ctx.tag(),
            fs = aec.fs,
            mode = ?aec.mode,
            dual_ch = self.dual_ch,
            frame = self.frame_size,
            "aec open"
        );
        Ok(())
    }

    fn process(&mut self, ctx: &ElementContext<'_>, buf: &mut [u8]) -> IoResult {
        let read = ctx.input(buf)?;
        if read != buf.len() {
            tracing::warn!(element = %ctx.tag(), read, want = buf.len(), "short mic read");
        }
        if read == 0 {
            return Ok(0);
        }
        self.apply_pending_config();
        self.split_input(ctx, buf, read);

        let (Some(canceller), Some(suppressor)) = (self.canceller.as_mut(), self.suppressor.as_ref())
        else {
            return Err(IoError::ProcessFail);
        };
        canceller.process(&self.mic, &self.reference, &mut self.out);
        suppressor.process(&mut self.out);
        write_samples(&self.out, &mut self.out_bytes);
        self.shared.lock().unwrap().stats.frames += 1;

        if ctx.multi_output_max() > 0 {
            // Fan-out never blocks the main path.
            let _ = ctx.multi_output(&self.out_bytes, Some(Duration::ZERO));
        }
        self.run_vad(ctx);
        if let Some(callback) = self.on_ec_out.as_mut() {
            callback(&self.out_bytes);
        }
        self.emit(ctx)
    }

    fn close(&mut self, ctx: &ElementContext<'_>) -> std::result::Result<(), IoError> {
        self.holdback = None;
        self.vad = None;
        tracing::debug!(element = %ctx.tag(), "aec close");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(samples: usize, amplitude: f32) -> Vec<i16> {
        (0..samples)
            .map(|i| (amplitude * (i as f32 * 0.3).sin()) as i16)
            .collect()
    }

    #[test]
    fn test_holdback_keeps_frame_when_output_fails() {
        let config = VadConfig {
            buf_size: 32,
            ..VadConfig::default()
        };
        let mut holdback = HoldBack::new(&config, 4, 2);
        let mut out = Vec::new();

        let accept = |out: &mut Vec<u8>, frame: &[u8]| -> IoResult {
            out.extend_from_slice(frame);
            Ok(frame.len())
        };
        assert_eq!(holdback.push(VadState::SpeechStart, &[1; 4], |f| accept(&mut out, f), || {}), Ok(4));
        assert_eq!(holdback.frames.len(), 2);
        assert_eq!(holdback.backlog, 8);

        let result = holdback.push(VadState::SpeechEnd, &[2; 4], |_| Err(IoError::Abort), || {});
        assert_eq!(result, Err(IoError::Abort));
        assert_eq!(holdback.frames.len(), 2);
        assert_eq!(holdback.backlog, 8);

        assert_eq!(holdback.push(VadState::SpeechEnd, &[2; 4], |f| accept(&mut out, f), || {}), Ok(4));
        assert_eq!(out, vec![0; 8]);
        assert_eq!(holdback.frames.front().map(Vec::as_slice), Some(&[1u8; 4][..]));
        assert_eq!(holdback.backlog, 4);

        // A failed release while speaking leaves the new frame queued as well.
        let result = holdback.push(VadState::SpeechStart, &[3; 4], |_| Err(IoError::Fail), || {});
        assert_eq!(result, Err(IoError::Fail));
        assert_eq!(holdback.frames.len(), 3);
    }

    #[test]
    fn test_validation() {
        let check = |aec: AecConfig| {
            AecAlgorithm::element(AecAlgorithmConfig {
                aec,
                ..Default::default()
            })
        };
        assert!(check(AecConfig { fs: 48000, ..Default::default() }).is_err());
        assert!(check(AecConfig { ec_depth: 0, ..Default::default() }).is_err());
        assert!(check(AecConfig { ns_level: 9, ..Default::default() }).is_err());
        assert!(check(AecConfig { ns_para: 3, ..Default::default() }).is_err());
        assert!(check(AecConfig { fs: 8000, ..Default::default() }).is_ok());
    }

    #[test]
    fn test_vad_frame_must_match() {
        let config = AecAlgorithmConfig {
            aec: AecConfig { fs: 8000, ..Default::default() },
            vad: VadConfig { enable: true, ..Default::default() },
            ..Default::default()
        };
        assert!(matches!(
            AecAlgorithm::element(config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_dual_channel_needs_software_mode() {
        let config = AecAlgorithmConfig {
            aec: AecConfig { mode: AecMode::Hardware, ..Default::default() },
            dual_ch: true,
            ..Default::default()
        };
        assert!(AecAlgorithm::element(config).is_err());
    }

    #[test]
    fn test_buffer_len_by_mode() {
        let (soft, _) = AecAlgorithm::element(AecAlgorithmConfig::default()).unwrap();
        assert_eq!(soft.multi_input_max(), 1);
        let hw = AecAlgorithmConfig {
            aec: AecConfig { mode: AecMode::Hardware, ..Default::default() },
            ..Default::default()
        };
        let (hw, handle) = AecAlgorithm::element(hw).unwrap();
        assert_eq!(handle.frame_size(), 640);
        assert_eq!(hw.output_ringbuf_size(), 0);
    }

    #[test]
    fn test_vad_transitions() {
        assert!(VadState::None.can_enter(VadState::SpeechStart));
        assert!(!VadState::SpeechStart.can_enter(VadState::SpeechStart));
        assert!(!VadState::Silence.can_enter(VadState::None));

        let mut vad = Vad::new(&VadConfig {
            enable: true,
            start_threshold_ms: 40,
            stop_threshold_ms: 40,
            silence_threshold_ms: 20,
            ..Default::default()
        });
        let loud = tone(320, 10000.0);
        let quiet = vec![0i16; 320];

        assert_eq!(vad.update(&loud), None);
        assert_eq!(vad.update(&loud), Some(VadState::SpeechStart));
        assert_eq!(vad.update(&loud), None);
        assert_eq!(vad.update(&quiet), None);
        assert_eq!(vad.update(&quiet), Some(VadState::SpeechEnd));
        assert_eq!(vad.update(&quiet), Some(VadState::Silence));
        assert_eq!(vad.update(&quiet), None);
    }

    #[test]
    fn test_canceller_passes_mic_without_reference() {
        let mut canceller = Canceller::new(&AecConfig::default());
        let mic = tone(320, 3000.0);
        let silence = vec![0i16; 320];
        let mut out = vec![0i16; 320];
        canceller.process(&mic, &silence, &mut out);
        assert_eq!(out, mic);
    }

    #[test]
    fn test_canceller_reduces_echo() {
        let mut canceller = Canceller::new(&AecConfig {
            ec_depth: 2,
            ..Default::default()
        });
        let reference = tone(320, 4000.0);
        let echo: Vec<i16> = reference.iter().map(|&s| s / 2).collect();
        let mut out = vec![0i16; 320];
        for _ in 0..30 {
            canceller.process(&echo, &reference, &mut out);
        }
        assert!(rms(&out) < rms(&echo) / 4.0);
    }

    #[test]
    fn test_suppressor_gates_quiet_frames() {
        let suppressor = Suppressor::new(&AecConfig {
            drc: 0x10,
            ..Default::default()
        });
        let mut quiet = vec![40i16; 320];
        suppressor.process(&mut quiet);
        assert!(quiet.iter().all(|&s| s == 5));

        let mut loud = tone(320, 8000.0);
        let before = loud.clone();
        suppressor.process(&mut loud);
        assert_eq!(loud, before);

        let off = Suppressor::new(&AecConfig {
            ec_only_output: true,
            ..Default::default()
        });
        let mut frame = vec![40i16; 320];
        off.process(&mut frame);
        assert!(frame.iter().all(|&s| s == 40));
    }

    #[test]
    fn test_set_config() {
        let (_el, handle) = AecAlgorithm::element(AecAlgorithmConfig::default()).unwrap();
        let (mut aec, vad) = handle.config();
        aec.ec_depth = 30;
        handle.set_config(aec.clone(), vad.clone()).unwrap();
        assert_eq!(handle.config().0.ec_depth, 30);

        aec.fs = 8000;
        assert!(handle.set_config(aec, vad).is_err());
    }
}
