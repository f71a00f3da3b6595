//! Dense matrix handles over shared coherent storage.
//!
//! A [`DenseMatrix`] is a cheap handle: dimensions plus an
//! `Arc<Mutex<Storage>>`. Views (and clones) share the same storage
//! object, so coherence state lives in exactly one place no matter how
//! many handles alias it, and every materialize-then-use sequence runs
//! under the storage lock.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytemuck::Zeroable;
use bytes::Bytes;

use crate::buffer::storage::{BufferError, Element, SideState, Storage};
use crate::device::DeviceContext;

/// A 2-D matrix of a fixed element type, with values in host memory,
/// device memory, or both.
pub struct DenseMatrix<T: Element> {
    num_rows: usize,
    num_cols: usize,
    storage: Arc<Mutex<Storage<T>>>,
}

/// Clones alias the same storage, like views with identical dimensions.
impl<T: Element> Clone for DenseMatrix<T> {
    fn clone(&self) -> Self {
        Self {
            num_rows: self.num_rows,
            num_cols: self.num_cols,
            storage: self.storage.clone(),
        }
    }
}

/// Read access to a matrix's current host values.
///
/// Holds the storage lock for its lifetime, so the materialize-then-read
/// sequence that produced it cannot interleave with writes or materializes
/// through any aliasing handle.
pub struct HostValues<'a, T: Element> {
    guard: MutexGuard<'a, Storage<T>>,
}

impl<T: Element> Deref for HostValues<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.guard.current_host().unwrap_or(&[])
    }
}

impl<T: Element> DenseMatrix<T> {
    /// Create a matrix from host values.
    pub fn from_values(
        num_rows: usize,
        num_cols: usize,
        values: Vec<T>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self, BufferError> {
        if values.len() != num_rows * num_cols {
            return Err(BufferError::LengthMismatch {
                expected: num_rows * num_cols,
                got: values.len(),
            });
        }

        Ok(Self {
            num_rows,
            num_cols,
            storage: Arc::new(Mutex::new(Storage::new_host(values, ctx))),
        })
    }

    /// Construct a matrix from a flat, host-contiguous byte sequence, the
    /// inverse of [`DenseMatrix::to_bytes`].
    pub fn from_bytes(
        num_rows: usize,
        num_cols: usize,
        bytes: &[u8],
        ctx: Arc<DeviceContext>,
    ) -> Result<Self, BufferError> {
        let expected = num_rows * num_cols * std::mem::size_of::<T>();
        if bytes.len() != expected {
            return Err(BufferError::PayloadSizeMismatch {
                rows: num_rows,
                cols: num_cols,
                expected,
                got: bytes.len(),
            });
        }

        // Copy through a typed buffer; the input bytes carry no alignment
        // guarantee.
        let mut values = vec![T::zeroed(); num_rows * num_cols];
        bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(bytes);

        Self::from_values(num_rows, num_cols, values, ctx)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    /// Logical element count.
    pub fn len(&self) -> usize {
        self.num_rows * self.num_cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn storage(&self) -> MutexGuard<'_, Storage<T>> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the storage, materialize on host, and return a guard over the
    /// current values. No copy is issued when the host side is already
    /// current.
    pub fn host_values(&self) -> Result<HostValues<'_, T>, BufferError> {
        let mut guard = self.storage();
        guard.materialize_on_host()?;
        Ok(HostValues { guard })
    }

    /// Read one element (row-major), materializing on host if needed.
    pub fn get(&self, row: usize, col: usize) -> Result<T, BufferError> {
        if row >= self.num_rows || col >= self.num_cols {
            return Err(BufferError::IndexOutOfBounds {
                row,
                col,
                rows: self.num_rows,
                cols: self.num_cols,
            });
        }
        let values = self.host_values()?;
        Ok(values[row * self.num_cols + col])
    }

    /// Ensure a current device copy exists, allocating device storage on
    /// first use. No-op when the device side is already current.
    pub fn materialize_on_device(&self) -> Result<(), BufferError> {
        self.storage().materialize_on_device()
    }

    /// Replace the values through the host side.
    pub fn write_host(&self, values: Vec<T>) -> Result<(), BufferError> {
        self.storage().write_host(values)
    }

    /// Replace the values through the device side.
    pub fn write_device(&self, values: &[T]) -> Result<(), BufferError> {
        self.storage().write_device(values)
    }

    /// Whether device storage has been allocated for this matrix.
    pub fn device_resident(&self) -> bool {
        self.storage().device_resident()
    }

    /// Coherence state of (host, device) sides. Primarily for tests and
    /// diagnostics.
    pub fn side_states(&self) -> (SideState, SideState) {
        let storage = self.storage();
        (storage.host_state(), storage.device_state())
    }

    /// Transposed view of a vector-shaped matrix.
    ///
    /// Transposing a 1×n or n×1 matrix is a no-op on the physical layout,
    /// so the view shares this matrix's storage and only swaps the stated
    /// dimensions. Any other shape fails with
    /// [`BufferError::InvalidViewShape`] and mutates nothing.
    pub fn transpose_view(&self) -> Result<DenseMatrix<T>, BufferError> {
        if self.num_rows != 1 && self.num_cols != 1 {
            return Err(BufferError::InvalidViewShape {
                rows: self.num_rows,
                cols: self.num_cols,
            });
        }

        Ok(Self {
            num_rows: self.num_cols,
            num_cols: self.num_rows,
            storage: self.storage.clone(),
        })
    }

    /// Serialize the current authoritative values as flat little-endian
    /// bytes, materializing on host first.
    pub fn to_bytes(&self) -> Result<Bytes, BufferError> {
        let values = self.host_values()?;
        Ok(Bytes::copy_from_slice(bytemuck::cast_slice(&values[..])))
    }
}

impl<T: Element> std::fmt::Debug for DenseMatrix<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenseMatrix")
            .field("num_rows", &self.num_rows)
            .field("num_cols", &self.num_cols)
            .finish()
    }
}
