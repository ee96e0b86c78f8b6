use tracing::debug;

use crate::pal::{Bindings, RawHandle};

/// An operating system handle that is closed when this value is dropped.
///
/// This guarantees that snapshot and process handles are released on every exit path of the
/// function that opened them, including early returns via `?`.
#[derive(Debug)]
pub(crate) struct OwnedHandle<'b, B: Bindings> {
    bindings: &'b B,
    raw: RawHandle,
}

impl<'b, B: Bindings> OwnedHandle<'b, B> {
    /// Takes ownership of a handle just returned by `bindings`.
    pub(crate) fn new(bindings: &'b B, raw: RawHandle) -> Self {
        Self { bindings, raw }
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl<B: Bindings> Drop for OwnedHandle<'_, B> {
    fn drop(&mut self) {
        // Nothing useful can be done if closing fails, the handle is gone either way.
        if let Err(e) = self.bindings.close_handle(self.raw) {
            debug!(handle = self.raw.0, error = %e, "failed to close handle");
        }
    }
}
