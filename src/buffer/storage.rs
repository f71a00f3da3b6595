//! Shared matrix storage with per-side coherence state.
//!
//! A [`Storage`] owns a matrix's host and device copies and mediates every
//! transition between them. Each side carries an explicit [`SideState`]
//! instead of a dirty boolean, which makes the core invariant structural:
//! at most one side is ever `Stale`, and a `Stale` side always has a
//! `Current` counterpart to refresh from.
//!
//! `Storage` is not internally synchronized. Handles wrap it in
//! `Arc<Mutex<..>>` and hold the lock across every materialize-then-use
//! sequence; views alias the same storage object, so serialization happens
//! at the storage level rather than per handle.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::device::{DeviceAllocation, DeviceContext, DeviceError};

/// Value types a matrix can hold. Plain-old-data so host and device copies
/// are byte-for-byte interchangeable.
pub trait Element: Pod + PartialEq + std::fmt::Debug + Send + Sync + 'static {}

impl Element for f32 {}
impl Element for f64 {}
impl Element for i32 {}
impl Element for i64 {}
impl Element for u8 {}

#[derive(Error, Debug)]
pub enum BufferError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Invalid view shape: {rows}x{cols} source is not vector-shaped")]
    InvalidViewShape { rows: usize, cols: usize },

    #[error("Payload size mismatch: {rows}x{cols} needs {expected} bytes, got {got}")]
    PayloadSizeMismatch {
        rows: usize,
        cols: usize,
        expected: usize,
        got: usize,
    },

    #[error("Value count mismatch: storage holds {expected} elements, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Index ({row}, {col}) out of bounds for {rows}x{cols} matrix")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },
}

/// Coherence state of one storage side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideState {
    /// No physical storage on this side.
    Absent,
    /// This side holds the authoritative values.
    Current,
    /// This side has physical storage whose values were superseded by a
    /// write on the other side.
    Stale,
}

impl SideState {
    pub fn is_current(&self) -> bool {
        matches!(self, SideState::Current)
    }
}

/// A matrix's physical storage: host values, device region, and the
/// coherence state of each side.
pub struct Storage<T: Element> {
    len: usize,
    host: Option<Vec<T>>,
    device: Option<DeviceAllocation>,
    host_state: SideState,
    device_state: SideState,
    ctx: Arc<DeviceContext>,
}

impl<T: Element> Storage<T> {
    /// Create storage populated on the host side.
    pub fn new_host(values: Vec<T>, ctx: Arc<DeviceContext>) -> Self {
        let storage = Self {
            len: values.len(),
            host: Some(values),
            device: None,
            host_state: SideState::Current,
            device_state: SideState::Absent,
            ctx,
        };
        storage.check_coherence();
        storage
    }

    /// Logical element count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical size of one copy in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    pub fn host_state(&self) -> SideState {
        self.host_state
    }

    pub fn device_state(&self) -> SideState {
        self.device_state
    }

    /// Whether device storage has been allocated.
    pub fn device_resident(&self) -> bool {
        self.device.is_some()
    }

    /// Produce a current host copy, copying device→host only if the host
    /// side is absent or stale.
    ///
    /// Copy-then-commit: the device copy lands in a staging buffer first,
    /// so a [`DeviceError::TransferFailure`] leaves both sides exactly as
    /// they were.
    pub fn materialize_on_host(&mut self) -> Result<&[T], BufferError> {
        match self.host_state {
            SideState::Current => {}
            SideState::Absent | SideState::Stale => {
                // A non-current host implies the device holds the values.
                debug_assert_eq!(self.device_state, SideState::Current);
                let device = self.device.as_ref().ok_or_else(|| {
                    DeviceError::TransferFailure(
                        "host copy requested but device storage is absent".to_string(),
                    )
                })?;

                let mut staging = vec![T::zeroed(); self.len];
                device.read_into(bytemuck::cast_slice_mut(&mut staging))?;

                self.host = Some(staging);
                self.host_state = SideState::Current;
            }
        }
        self.check_coherence();
        self.current_host()
    }

    /// Produce a current device copy, allocating device storage on first
    /// use and copying host→device only if the device side is absent or
    /// stale.
    ///
    /// Allocation is capacity-checked before it happens; an
    /// [`DeviceError::OutOfDeviceMemory`] failure leaves no partial
    /// allocation and no state change. A copy failure on a freshly
    /// allocated region releases that region on the spot.
    pub fn materialize_on_device(&mut self) -> Result<(), BufferError> {
        if self.device_state == SideState::Current {
            return Ok(());
        }

        let host = self.host.as_ref().ok_or_else(|| {
            DeviceError::TransferFailure(
                "device copy requested but host storage is absent".to_string(),
            )
        })?;
        let bytes: &[u8] = bytemuck::cast_slice(host);

        match &self.device {
            Some(alloc) => alloc.write_from(bytes)?,
            None => {
                let alloc = DeviceAllocation::new(self.ctx.clone(), bytes.len())?;
                alloc.write_from(bytes)?;
                self.device = Some(alloc);
            }
        }

        self.device_state = SideState::Current;
        self.host_state = SideState::Current;
        self.check_coherence();
        Ok(())
    }

    /// Replace the host values. The host side becomes `Current` and any
    /// device copy becomes `Stale`, regardless of prior state.
    pub fn write_host(&mut self, values: Vec<T>) -> Result<(), BufferError> {
        if values.len() != self.len {
            return Err(BufferError::LengthMismatch {
                expected: self.len,
                got: values.len(),
            });
        }

        self.host = Some(values);
        self.host_state = SideState::Current;
        self.device_state = if self.device.is_some() {
            SideState::Stale
        } else {
            SideState::Absent
        };
        self.check_coherence();
        Ok(())
    }

    /// Replace the device values, allocating device storage if needed. The
    /// device side becomes `Current` and any host copy becomes `Stale`,
    /// regardless of prior state.
    pub fn write_device(&mut self, values: &[T]) -> Result<(), BufferError> {
        if values.len() != self.len {
            return Err(BufferError::LengthMismatch {
                expected: self.len,
                got: values.len(),
            });
        }
        let bytes: &[u8] = bytemuck::cast_slice(values);

        match &self.device {
            Some(alloc) => alloc.write_from(bytes)?,
            None => {
                let alloc = DeviceAllocation::new(self.ctx.clone(), bytes.len())?;
                alloc.write_from(bytes)?;
                self.device = Some(alloc);
            }
        }

        self.device_state = SideState::Current;
        self.host_state = if self.host.is_some() {
            SideState::Stale
        } else {
            SideState::Absent
        };
        self.check_coherence();
        Ok(())
    }

    /// Current host values. Errors if the host side is not `Current`
    /// (callers go through [`Storage::materialize_on_host`] first).
    pub fn current_host(&self) -> Result<&[T], BufferError> {
        match (&self.host, self.host_state) {
            (Some(values), SideState::Current) => Ok(values),
            _ => Err(BufferError::Device(DeviceError::TransferFailure(
                "host side is not current".to_string(),
            ))),
        }
    }

    fn check_coherence(&self) {
        debug_assert!(
            !(self.host_state == SideState::Stale && self.device_state == SideState::Stale),
            "both storage sides stale"
        );
        debug_assert!(
            self.host_state != SideState::Stale || self.device_state == SideState::Current,
            "stale host without current device"
        );
        debug_assert!(
            self.device_state != SideState::Stale || self.host_state == SideState::Current,
            "stale device without current host"
        );
    }
}
