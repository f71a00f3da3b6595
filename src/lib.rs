//! matrix-worker: distributed numerical-computation worker core.
//!
//! A long-running process that serves remote matrix compute/transfer
//! requests against dense matrices whose values may live in host memory,
//! accelerator memory, or both:
//!
//! - [`buffer`]: coherent two-copy matrix buffers with lazy host↔device
//!   materialization and zero-copy vector views
//! - [`device`]: capacity-checked, scoped accelerator memory management
//! - [`worker`]: the request-serving service with interchangeable
//!   scheduling variants (blocking-per-call vs. event-driven)
//! - [`config`]: the resolved process configuration

pub mod buffer;
pub mod config;
pub mod device;
pub mod worker;
