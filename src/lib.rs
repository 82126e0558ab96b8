//! Offset template operators for destriping time-ordered detector data.
//!
//! - [`template_offset`]: synthesis, projection and diagonal preconditioning
//! - [`accel`]: explicit accelerator device context
//! - [`buffer`]: shape-checked views of caller buffers
//!
//! Python bindings are compiled with the `bindings` feature. The device code
//! path is compiled with the `offload` feature; without it, every call runs on
//! the host.

pub mod accel;
pub mod buffer;
pub mod template_offset;

#[cfg(feature = "bindings")]
mod python;
