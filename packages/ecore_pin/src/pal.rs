//! Platform Abstraction Layer (PAL). Every call into the operating system goes through the
//! [`Bindings`] trait defined here, so the logic above it can be exercised with mock bindings.

mod abstractions;
pub(crate) use abstractions::*;

mod facade;
pub(crate) use facade::*;

mod owned_handle;
pub(crate) use owned_handle::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;

// Other platforms have no processor topology or process scheduling API that we know how to use,
// so every call reports "not supported" and the callers take their fallback paths.
#[cfg(not(windows))]
mod fallback;
#[cfg(not(windows))]
pub(crate) use fallback::*;
