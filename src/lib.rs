//! # Audioflow
//!
//! A real-time audio dataflow engine.
//!
//! Audio moves through a chain of [`Element`](element::Element)s, each driven
//! by its own task thread and connected to its neighbours by bounded
//! [`Port`](port::Port)s. A [`Pipeline`](pipeline::Pipeline) registers
//! elements under tags, links them in order and runs, pauses, stops and
//! tears them down as a unit. Elements report state changes through an
//! [`EventIface`](event::EventIface), and a
//! [`ServiceListener`](service::ServiceListener) turns those reports into
//! service-level reactions.
//!
//! ## Features
//!
//! - **Ports**: ring buffers, frame pools and driver callbacks, all abortable
//! - **Persistent tasks**: stop, finish and pause park the task instead of ending it
//! - **Two-phase teardown**: every port is aborted before any task is joined
//! - **Built-in elements**: raw and array streams, echo cancellation with VAD
//!
//! ## Quick Start
//!
//! ```rust
//! use audioflow::prelude::*;
//!
//! let (src, _data) = ArrayStream::reader(ArrayStreamConfig::default(), vec![0u8; 4096]).unwrap();
//! let (sink, captured) = ArrayStream::writer(ArrayStreamConfig::default(), 4096).unwrap();
//!
//! let mut pipeline = Pipeline::new(PipelineConfig::new("copy")).unwrap();
//! pipeline.register(&src, "src").unwrap();
//! pipeline.register(&sink, "sink").unwrap();
//! pipeline.link(&["src", "sink"]).unwrap();
//!
//! pipeline.run().unwrap();
//! pipeline.wait_for_stop().unwrap();
//! assert_eq!(captured.captured().len(), 4096);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod element;
pub mod elements;
pub mod error;
pub mod event;
pub mod observability;
pub mod pipeline;
pub mod port;
pub mod service;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::element::{
        AudioElement, AudioInfo, Element, ElementConfig, ElementContext, ElementState,
        ElementStatus, from_process,
    };
    pub use crate::elements::{
        AecAlgorithm, AecAlgorithmConfig, ArrayStream, ArrayStreamConfig, RawStream,
        RawStreamConfig, StreamType,
    };
    pub use crate::error::{Error, IoError, IoResult, Result};
    pub use crate::event::{EventIface, EventIfaceConfig, EventMessage};
    pub use crate::pipeline::{Pipeline, PipelineConfig};
    pub use crate::port::{Port, PortKind};
    pub use crate::service::{ListenerConfig, PipelineService, ServiceListener};
}

pub use error::{Error, Result};
