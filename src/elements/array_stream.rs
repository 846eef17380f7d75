//! ArrayStream: play a memory buffer into a pipeline, or capture one out of it.

use super::raw_stream::StreamType;
use crate::element::{AudioElement, DEFAULT_BUFFER_LEN, Element, ElementConfig, ElementContext, ElementState};
use crate::error::{Error, IoError, IoResult, Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Input timeout a reader applies when it opens.
const READER_INPUT_TIMEOUT: Duration = Duration::from_millis(40);

/// Configuration for an [`ArrayStream`].
#[derive(Debug, Clone)]
pub struct ArrayStreamConfig {
    /// Size of the buffer moved per `process` call.
    pub buffer_len: usize,
    /// Linked output ring size of a reader; `0` uses the pipeline's default.
    pub out_rb_size: usize,
    /// Element tag.
    pub tag: String,
}

impl Default for ArrayStreamConfig {
    fn default() -> Self {
        Self {
            buffer_len: DEFAULT_BUFFER_LEN,
            out_rb_size: 0,
            tag: "array".to_string(),
        }
    }
}

enum Storage {
    Source(Bytes),
    Sink(Vec<u8>),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Source(data) => data.len(),
            Storage::Sink(data) => data.len(),
        }
    }
}

struct ArrayState {
    storage: Storage,
    offset: usize,
    filled: usize,
}

type SharedArray = Arc<Mutex<ArrayState>>;

fn read_array(state: &SharedArray, buf: &mut [u8]) -> IoResult {
    let mut state = state.lock().unwrap();
    let Storage::Source(data) = &state.storage else {
        return Err(IoError::Fail);
    };
    if buf.is_empty() || state.offset >= data.len() {
        return Ok(0);
    }
    let n = buf.len().min(data.len() - state.offset);
    buf[..n].copy_from_slice(&data[state.offset..state.offset + n]);
    state.offset += n;
    Ok(n)
}

fn write_array(state: &SharedArray, buf: &[u8]) -> IoResult {
    let mut state = state.lock().unwrap();
    let offset = state.offset;
    let Storage::Sink(data) = &mut state.storage else {
        return Err(IoError::Fail);
    };
    if buf.is_empty() || offset >= data.len() {
        return Ok(0);
    }
    let n = buf.len().min(data.len() - offset);
    data[offset..offset + n].copy_from_slice(&buf[..n]);
    state.offset += n;
    state.filled = state.filled.max(state.offset);
    Ok(n)
}

struct ArrayCallbacks {
    stream_type: StreamType,
    state: SharedArray,
}

impl AudioElement for ArrayCallbacks {
    fn open(&mut self, ctx: &ElementContext<'_>) -> std::result::Result<(), IoError> {
        let info = ctx.info();
        let mut state = self.state.lock().unwrap();
        let total = state.storage.len();
        state.offset = 0;
        if self.stream_type == StreamType::Reader {
            ctx.set_input_timeout(Some(READER_INPUT_TIMEOUT));
        }
        if info.byte_pos > 0 {
            state.offset = (info.byte_pos as usize).min(total);
        } else if self.stream_type == StreamType::Writer {
            state.filled = 0;
        }
        drop(state);
        ctx.set_total_bytes(total as u64);
        tracing::debug!(
            element = %ctx.tag(),
            stream = ?self.stream_type,
            total,
            byte_pos = info.byte_pos,
            "array open"
        );
        Ok(())
    }

    fn process(&mut self, ctx: &ElementContext<'_>, buf: &mut [u8]) -> IoResult {
        let read = ctx.input(buf)?;
        if read == 0 {
            return Ok(0);
        }
        if self.stream_type == StreamType::Reader {
            ctx.update_byte_pos(read as u64);
        }
        let written = ctx.output(&buf[..read])?;
        if self.stream_type == StreamType::Writer {
            ctx.update_byte_pos(written as u64);
        }
        Ok(written)
    }

    fn close(&mut self, ctx: &ElementContext<'_>) -> std::result::Result<(), IoError> {
        if ctx.state() != ElementState::Paused {
            self.state.lock().unwrap().offset = 0;
            ctx.set_byte_pos(0);
        }
        Ok(())
    }
}

/// Handle to the memory behind an [`ArrayStream`] element.
#[derive(Clone)]
pub struct ArrayStreamHandle {
    stream_type: StreamType,
    state: SharedArray,
}

impl ArrayStreamHandle {
    /// Direction of the stream.
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Replace the data a reader plays. Takes effect from the next open.
    pub fn set_data(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.stream_type != StreamType::Reader {
            return Err(Error::InvalidState("array writer has no source data".into()));
        }
        let mut state = self.state.lock().unwrap();
        state.storage = Storage::Source(data.into());
        state.offset = 0;
        Ok(())
    }

    /// Bytes captured by a writer so far.
    pub fn captured(&self) -> Bytes {
        let state = self.state.lock().unwrap();
        match &state.storage {
            Storage::Sink(data) => Bytes::copy_from_slice(&data[..state.filled]),
            Storage::Source(_) => Bytes::new(),
        }
    }

    /// Current read or write offset.
    pub fn offset(&self) -> usize {
        self.state.lock().unwrap().offset
    }

    /// Size of the backing array.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().storage.len()
    }
}

impl std::fmt::Debug for ArrayStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayStreamHandle")
            .field("type", &self.stream_type)
            .field("offset", &self.offset())
            .field("size", &self.size())
            .finish()
    }
}

/// Element factory for memory-backed streams.
///
/// A reader pulls its input from the array through an owned callback
/// port; a writer pushes its output into the array the same way. The
/// position survives a pause and is rewound by any other close.
///
/// # Example
///
/// ```rust
/// use audioflow::elements::{ArrayStream, ArrayStreamConfig};
/// use audioflow::port::Port;
///
/// let (reader, _handle) = ArrayStream::reader(ArrayStreamConfig::default(), vec![1u8; 100]).unwrap();
/// let out = Port::ring_buffer("out", 256).unwrap();
/// reader.set_output_port(Some(out.clone()));
/// reader.run().unwrap();
/// reader.wait_for_stop().unwrap();
///
/// assert_eq!(out.filled_size(), 100);
/// ```
#[derive(Debug)]
pub struct ArrayStream;

impl ArrayStream {
    /// Create a reader playing `data`.
    pub fn reader(config: ArrayStreamConfig, data: impl Into<Bytes>) -> Result<(Element, ArrayStreamHandle)> {
        let state = Arc::new(Mutex::new(ArrayState {
            storage: Storage::Source(data.into()),
            offset: 0,
            filled: 0,
        }));
        let port_state = Arc::clone(&state);
        let element_config = ElementConfig::new(config.tag)
            .with_buffer_len(config.buffer_len)
            .with_out_rb(config.out_rb_size)
            .with_read(move |buf, _timeout| read_array(&port_state, buf));
        Self::build(element_config, StreamType::Reader, state)
    }

    /// Create a writer capturing up to `capacity` bytes.
    pub fn writer(config: ArrayStreamConfig, capacity: usize) -> Result<(Element, ArrayStreamHandle)> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("array writer capacity must be > 0".into()));
        }
        let state = Arc::new(Mutex::new(ArrayState {
            storage: Storage::Sink(vec![0; capacity]),
            offset: 0,
            filled: 0,
        }));
        let port_state = Arc::clone(&state);
        let element_config = ElementConfig::new(config.tag)
            .with_buffer_len(config.buffer_len)
            .with_write(move |buf, _timeout| write_array(&port_state, buf));
        Self::build(element_config, StreamType::Writer, state)
    }

    fn build(
        config: ElementConfig,
        stream_type: StreamType,
        state: SharedArray,
    ) -> Result<(Element, ArrayStreamHandle)> {
        let element = Element::new(
            config,
            ArrayCallbacks {
                stream_type,
                state: Arc::clone(&state),
            },
        )?;
        Ok((element, ArrayStreamHandle { stream_type, state }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;

    #[test]
    fn test_reader_plays_array() {
        let data: Vec<u8> = (0..=255).collect();
        let config = ArrayStreamConfig {
            buffer_len: 100,
            ..Default::default()
        };
        let (reader, handle) = ArrayStream::reader(config, data.clone()).unwrap();
        let out = Port::ring_buffer("out", 512).unwrap();
        reader.set_output_port(Some(out.clone()));
        reader.run().unwrap();
        reader.wait_for_stop().unwrap();

        assert_eq!(reader.state(), ElementState::Finished);
        let mut buf = vec![0u8; 256];
        assert_eq!(out.read(&mut buf, None), Ok(256));
        assert_eq!(buf, data);
        // Closing rewinds.
        assert_eq!(handle.offset(), 0);
        assert_eq!(reader.info().byte_pos, 0);
        assert_eq!(reader.info().total_bytes, 256);
    }

    #[test]
    fn test_writer_captures_until_full() {
        let (writer, handle) = ArrayStream::writer(ArrayStreamConfig::default(), 10).unwrap();
        let input = Port::ring_buffer("in", 64).unwrap();
        writer.set_input_port(Some(input.clone()));
        input.write(&[5u8; 16], None).unwrap();
        input.write_done();

        writer.run().unwrap();
        writer.wait_for_stop().unwrap();
        assert_eq!(writer.state(), ElementState::Finished);
        assert_eq!(&handle.captured()[..], &[5u8; 10]);
    }

    #[test]
    fn test_writer_rejects_zero_capacity() {
        assert!(ArrayStream::writer(ArrayStreamConfig::default(), 0).is_err());
    }

    #[test]
    fn test_set_data_only_for_reader() {
        let (_reader, handle) = ArrayStream::reader(ArrayStreamConfig::default(), vec![1u8; 4]).unwrap();
        handle.set_data(vec![2u8; 8]).unwrap();
        assert_eq!(handle.size(), 8);

        let (_writer, handle) = ArrayStream::writer(ArrayStreamConfig::default(), 4).unwrap();
        assert!(handle.set_data(vec![0u8; 1]).is_err());
    }
}
