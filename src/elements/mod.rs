//! Built-in audio elements.
//!
//! ## Streams
//! - [`RawStream`]: Task-less pipeline end driven by application reads or writes
//! - [`ArrayStream`]: Plays a memory buffer into a pipeline, or captures one
//!
//! ## Algorithms
//! - [`AecAlgorithm`]: Echo cancellation, noise suppression and voice activity detection

mod aec;
mod array_stream;
mod raw_stream;

// Streams
pub use array_stream::{ArrayStream, ArrayStreamConfig, ArrayStreamHandle};
pub use raw_stream::{RawStream, RawStreamConfig, RawStreamStats, StreamType};

// Algorithms
pub use aec::{
    AecAlgorithm, AecAlgorithmConfig, AecConfig, AecHandle, AecMode, AecStats, EcOutCallback,
    FRAME_MS, MAX_DELAY_POINTS, NsType, VadCallback, VadConfig, VadState,
};
