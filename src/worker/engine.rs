//! Request execution against registered matrices.
//!
//! The engine owns the worker's matrix registry and turns each decoded
//! request into buffer operations (materialize, write, view) plus the
//! host-side numeric computation. Matrix handles are cloned out of the
//! registry before use, so the registry lock is never held across a
//! materialize; per-matrix serialization happens inside the buffer layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::buffer::{BufferError, DenseMatrix};
use crate::device::{DeviceContext, DeviceError};
use crate::worker::protocol::{ComputeKind, ErrorKind, Frame, WorkerRequest, WorkerResponse};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Unknown matrix `{0}`")]
    UnknownMatrix(String),

    #[error("Compute kind expects {expected} inputs, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Shape mismatch: {a_rows}x{a_cols} vs {b_rows}x{b_cols}")]
    ShapeMismatch {
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    },

    #[error("Request cancelled")]
    Cancelled,
}

impl EngineError {
    /// Structured wire category for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Buffer(BufferError::Device(DeviceError::OutOfDeviceMemory {
                ..
            })) => ErrorKind::OutOfDeviceMemory,
            EngineError::Buffer(BufferError::Device(_)) => ErrorKind::TransferFailure,
            EngineError::Buffer(BufferError::InvalidViewShape { .. }) => {
                ErrorKind::InvalidViewShape
            }
            EngineError::Buffer(_) => ErrorKind::MalformedRequest,
            EngineError::UnknownMatrix(_) => ErrorKind::UnknownMatrix,
            EngineError::ArityMismatch { .. } | EngineError::ShapeMismatch { .. } => {
                ErrorKind::MalformedRequest
            }
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Cooperative cancellation flag for one request.
///
/// A child token observes its parent's cancellation (the service shutdown
/// token is the parent of every request token) but cancelling a child
/// never propagates upward.
#[derive(Clone, Default)]
pub struct CancelToken {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that is cancelled whenever this one is.
    pub fn child(&self) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(self.own.clone()),
        }
    }

    pub fn cancel(&self) {
        self.own.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::Acquire))
    }

    fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// The worker's matrix registry and request executor.
pub struct WorkerEngine {
    matrices: Mutex<HashMap<String, DenseMatrix<f64>>>,
    ctx: Arc<DeviceContext>,
    next_id: AtomicU64,
}

impl WorkerEngine {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            matrices: Mutex::new(HashMap::new()),
            ctx,
            next_id: AtomicU64::new(0),
        }
    }

    /// The device context matrices in this registry target.
    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Number of registered matrices.
    pub fn matrix_count(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, DenseMatrix<f64>>> {
        self.matrices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_id(&self) -> String {
        format!("mat-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lookup(&self, id: &str) -> Result<DenseMatrix<f64>, EngineError> {
        self.registry()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownMatrix(id.to_string()))
    }

    /// Decode and execute one wire frame, producing the response frame.
    ///
    /// Both scheduling variants funnel through here, so dispatch behavior
    /// is identical regardless of how the call was scheduled.
    pub fn handle_frame(&self, frame: Frame, cancel: &CancelToken) -> Frame {
        let request_id = Uuid::new_v4();
        let (response, payload) = match frame.decode_header::<WorkerRequest>() {
            Ok(request) => {
                debug!(%request_id, request = ?request, "Executing request");
                self.execute(request, frame.payload, cancel)
            }
            Err(e) => (
                WorkerResponse::Error {
                    kind: ErrorKind::MalformedRequest,
                    message: e.to_string(),
                },
                Bytes::new(),
            ),
        };

        match Frame::new(&response, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%request_id, error = %e, "Failed to encode response");
                Frame {
                    header: Bytes::from_static(
                        br#"{"status":"error","kind":"internal","message":"response encoding failed"}"#,
                    ),
                    payload: Bytes::new(),
                }
            }
        }
    }

    /// Execute one request, mapping any failure into a structured error
    /// response. Per-request failures never escape as process failures.
    pub fn execute(
        &self,
        request: WorkerRequest,
        payload: Bytes,
        cancel: &CancelToken,
    ) -> (WorkerResponse, Bytes) {
        match self.try_execute(request, payload, cancel) {
            Ok(response) => response,
            Err(e) => (
                WorkerResponse::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                },
                Bytes::new(),
            ),
        }
    }

    fn try_execute(
        &self,
        request: WorkerRequest,
        payload: Bytes,
        cancel: &CancelToken,
    ) -> Result<(WorkerResponse, Bytes), EngineError> {
        cancel.check()?;

        match request {
            WorkerRequest::Store {
                id,
                num_rows,
                num_cols,
            } => {
                let matrix =
                    DenseMatrix::from_bytes(num_rows, num_cols, &payload, self.ctx.clone())?;
                let id = id.unwrap_or_else(|| self.fresh_id());
                self.registry().insert(id.clone(), matrix);
                debug!(%id, num_rows, num_cols, "Stored matrix");
                Ok((WorkerResponse::Stored { id }, Bytes::new()))
            }

            WorkerRequest::Fetch { id } => {
                let matrix = self.lookup(&id)?;
                cancel.check()?;
                let bytes = matrix.to_bytes()?;
                debug!(%id, bytes = bytes.len(), "Fetched matrix");
                Ok((
                    WorkerResponse::Payload {
                        id,
                        num_rows: matrix.num_rows(),
                        num_cols: matrix.num_cols(),
                    },
                    bytes,
                ))
            }

            WorkerRequest::Write { id } => {
                let matrix = self.lookup(&id)?;
                let expected = matrix.len() * std::mem::size_of::<f64>();
                if payload.len() != expected {
                    return Err(EngineError::Buffer(BufferError::PayloadSizeMismatch {
                        rows: matrix.num_rows(),
                        cols: matrix.num_cols(),
                        expected,
                        got: payload.len(),
                    }));
                }
                let mut values = vec![0.0f64; matrix.len()];
                bytemuck::cast_slice_mut::<f64, u8>(&mut values).copy_from_slice(&payload);
                cancel.check()?;
                matrix.write_host(values)?;
                debug!(%id, "Wrote matrix values");
                Ok((WorkerResponse::Done { id }, Bytes::new()))
            }

            WorkerRequest::Promote { id } => {
                let matrix = self.lookup(&id)?;
                cancel.check()?;
                matrix.materialize_on_device()?;
                debug!(%id, "Promoted matrix to device");
                Ok((WorkerResponse::Done { id }, Bytes::new()))
            }

            WorkerRequest::Compute {
                kind,
                inputs,
                output,
            } => {
                let id = self.compute(kind, &inputs, output, cancel)?;
                Ok((WorkerResponse::Done { id }, Bytes::new()))
            }

            WorkerRequest::Transpose { id, output } => {
                let matrix = self.lookup(&id)?;
                let view = matrix.transpose_view()?;
                let out = output.unwrap_or_else(|| self.fresh_id());
                self.registry().insert(out.clone(), view);
                debug!(source = %id, view = %out, "Registered transpose view");
                Ok((WorkerResponse::Done { id: out }, Bytes::new()))
            }

            WorkerRequest::Free { id } => {
                match self.registry().remove(&id) {
                    Some(_) => {
                        debug!(%id, "Freed matrix");
                        Ok((WorkerResponse::Freed { id }, Bytes::new()))
                    }
                    None => Err(EngineError::UnknownMatrix(id)),
                }
            }
        }
    }

    /// Run one numeric computation, registering the result.
    ///
    /// Inputs are read one at a time under their own storage locks, so an
    /// operation naming the same matrix twice cannot deadlock.
    fn compute(
        &self,
        kind: ComputeKind,
        inputs: &[String],
        output: Option<String>,
        cancel: &CancelToken,
    ) -> Result<String, EngineError> {
        let expected = match kind {
            ComputeKind::EwAdd | ComputeKind::EwMul => 2,
            ComputeKind::Scale { .. } => 1,
        };
        if inputs.len() != expected {
            return Err(EngineError::ArityMismatch {
                expected,
                got: inputs.len(),
            });
        }

        let first = self.lookup(&inputs[0])?;
        let (num_rows, num_cols) = (first.num_rows(), first.num_cols());
        let a = first.host_values()?.to_vec();
        cancel.check()?;

        let values = match kind {
            ComputeKind::Scale { factor } => a.iter().map(|v| v * factor).collect(),
            ComputeKind::EwAdd | ComputeKind::EwMul => {
                let second = self.lookup(&inputs[1])?;
                if (second.num_rows(), second.num_cols()) != (num_rows, num_cols) {
                    return Err(EngineError::ShapeMismatch {
                        a_rows: num_rows,
                        a_cols: num_cols,
                        b_rows: second.num_rows(),
                        b_cols: second.num_cols(),
                    });
                }
                let b = second.host_values()?.to_vec();
                cancel.check()?;

                match kind {
                    ComputeKind::EwAdd => {
                        a.iter().zip(&b).map(|(x, y)| x + y).collect::<Vec<f64>>()
                    }
                    ComputeKind::EwMul => {
                        a.iter().zip(&b).map(|(x, y)| x * y).collect::<Vec<f64>>()
                    }
                    ComputeKind::Scale { .. } => unreachable!(),
                }
            }
        };

        cancel.check()?;
        let result = DenseMatrix::from_values(num_rows, num_cols, values, self.ctx.clone())?;
        let id = output.unwrap_or_else(|| self.fresh_id());
        self.registry().insert(id.clone(), result);
        debug!(?kind, %id, "Compute complete");
        Ok(id)
    }
}
