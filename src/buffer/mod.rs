//! Coherent two-copy matrix buffers.
//!
//! - [`storage`]: shared storage object with per-side coherence state
//! - [`dense`]: the `DenseMatrix` handle, views, and byte serialization

pub mod dense;
pub mod storage;

pub use dense::{DenseMatrix, HostValues};
pub use storage::{BufferError, Element, SideState};
