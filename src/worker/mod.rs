//! Request serving.
//!
//! - [`protocol`]: wire envelope and length-prefixed frame codec
//! - [`engine`]: request execution against registered matrices
//! - [`service`]: service lifecycle and scheduling-variant selection
//! - [`sync_server`]: blocking thread-per-call scheduling variant
//! - [`async_server`]: event-driven multiplexed scheduling variant

pub mod async_server;
pub mod engine;
pub mod protocol;
pub mod service;
pub mod sync_server;

pub use engine::{CancelToken, WorkerEngine};
pub use service::{ServiceError, ServiceState, WorkerService};
