//! The callback set every element kind implements.

use super::ElementContext;
use crate::error::{Error, IoError, IoResult, Result};

/// Processing callbacks of an element.
///
/// The element task calls `open` once when started, then `process`
/// repeatedly, then `close` when stopped, finished or paused. `process`
/// is only ever called between a successful `open` and the following
/// `close`, and never from two threads at once.
///
/// The value returned by `process` drives the task:
///
/// | Return | Effect |
/// |--------|--------|
/// | `Ok(n)`, `n > 0` | keep running |
/// | `Ok(0)` or `Err(Done)` | mark outputs done, report `StateFinished` |
/// | `Err(Abort)` | report `StateStopped` |
/// | `Err(Fail)` or `Err(ProcessFail)` | report `ErrorProcess` |
/// | `Err(Timeout)` | keep running |
///
/// # Example
///
/// ```rust
/// use audioflow::element::{AudioElement, ElementContext};
/// use audioflow::error::IoResult;
///
/// /// Halves the amplitude of 16-bit samples.
/// struct Attenuate;
///
/// impl AudioElement for Attenuate {
///     fn process(&mut self, ctx: &ElementContext<'_>, buf: &mut [u8]) -> IoResult {
///         let n = ctx.input(buf)?;
///         for s in buf[..n].chunks_exact_mut(2) {
///             let v = i16::from_le_bytes([s[0], s[1]]) / 2;
///             s.copy_from_slice(&v.to_le_bytes());
///         }
///         ctx.output(&buf[..n])
///     }
/// }
/// ```
pub trait AudioElement: Send {
    /// Prepare for processing.
    fn open(&mut self, _ctx: &ElementContext<'_>) -> std::result::Result<(), IoError> {
        Ok(())
    }

    /// Move one unit of data.
    fn process(&mut self, ctx: &ElementContext<'_>, buf: &mut [u8]) -> IoResult;

    /// Release what `open` acquired.
    fn close(&mut self, _ctx: &ElementContext<'_>) -> std::result::Result<(), IoError> {
        Ok(())
    }

    /// Release everything; called once when the element is deinitialized.
    fn destroy(&mut self) {}

    /// Element-specific seek. Returns the number of bytes written to `out`.
    fn seek(&mut self, _ctx: &ElementContext<'_>, _data: &[u8], _out: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported("seek".into()))
    }
}

/// An element whose only callback is a `process` closure.
pub struct ProcessFn<F>(F);

/// Build an element from a `process` closure.
///
/// ```rust
/// use audioflow::element::{Element, ElementConfig, from_process};
///
/// let passthrough = from_process(|ctx, buf| {
///     let n = ctx.input(buf)?;
///     ctx.output(&buf[..n])
/// });
/// let el = Element::new(ElementConfig::new("copy"), passthrough).unwrap();
/// assert_eq!(el.tag(), "copy");
/// ```
pub fn from_process<F>(process: F) -> ProcessFn<F>
where
    F: FnMut(&ElementContext<'_>, &mut [u8]) -> IoResult + Send,
{
    ProcessFn(process)
}

impl<F> AudioElement for ProcessFn<F>
where
    F: FnMut(&ElementContext<'_>, &mut [u8]) -> IoResult + Send,
{
    fn process(&mut self, ctx: &ElementContext<'_>, buf: &mut [u8]) -> IoResult {
        (self.0)(ctx, buf)
    }
}
