//! Containment for panics raised by application callbacks.
//!
//! Completion callbacks and inbox handlers are user code. A panic inside one
//! must not unwind through the pipeline context, so every invocation goes
//! through [`run_callback`], which turns the payload into a
//! [`PipelineError::CallbackPanicked`].

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
};

use crate::PipelineError;

/// Wrapper that formats a panic payload when logged or displayed.
///
/// ```
/// use hubwire::panic::format_panic;
/// assert_eq!(format_panic(Box::new("boom")).to_string(), "boom");
/// assert!(format_panic(Box::new(5_u32)).to_string().contains("Any"));
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

/// Create a [`PanicMessage`] for the given payload.
pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage { PanicMessage(panic) }

/// Invoke `callback`, converting a panic into [`PipelineError::CallbackPanicked`].
///
/// # Errors
///
/// Returns the formatted panic when `callback` unwinds.
pub fn run_callback<F, R>(callback: F) -> Result<R, PipelineError>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(callback))
        .map_err(|payload| PipelineError::CallbackPanicked(format_panic(payload).to_string().into()))
}
