//! Scoped device memory lifetime.
//!
//! A [`DeviceAllocation`] owns exactly one device region from allocation
//! to release. Release is idempotent: the handle is cleared the first
//! time, so a region can never be freed twice, and copies against a
//! released allocation fail instead of touching freed memory.

use std::sync::Arc;

use tracing::debug;

use crate::device::context::{DeviceContext, DeviceError, RegionHandle};

/// Guard for one device memory region.
pub struct DeviceAllocation {
    ctx: Arc<DeviceContext>,
    handle: Option<RegionHandle>,
    size: usize,
}

impl DeviceAllocation {
    /// Allocate `bytes` of device memory.
    ///
    /// Queries available device memory first and fails with
    /// [`DeviceError::OutOfDeviceMemory`] (carrying requested and available
    /// byte counts) before any allocation is attempted, so a failure leaves
    /// no partial allocation. The check is a best-effort guard: a
    /// concurrent allocator may consume the headroom between check and
    /// allocation, in which case the allocation itself reports the same
    /// error.
    pub fn new(ctx: Arc<DeviceContext>, bytes: usize) -> Result<Self, DeviceError> {
        let handle = ctx.alloc_region(bytes)?;
        Ok(Self {
            ctx,
            handle: Some(handle),
            size: bytes,
        })
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the region has already been released.
    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    /// Free the region. Safe to call repeatedly; only the first call
    /// reaches the device.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.ctx.release_region(handle);
            debug!(bytes = self.size, "Device allocation released");
        }
    }

    /// Copy host bytes into the region (host → device).
    pub fn write_from(&self, src: &[u8]) -> Result<(), DeviceError> {
        match self.handle {
            Some(handle) => self.ctx.copy_to_device(handle, src),
            None => Err(DeviceError::TransferFailure(
                "copy into released device region".to_string(),
            )),
        }
    }

    /// Copy the region back into host bytes (device → host).
    pub fn read_into(&self, dst: &mut [u8]) -> Result<(), DeviceError> {
        match self.handle {
            Some(handle) => self.ctx.copy_to_host(handle, dst),
            None => Err(DeviceError::TransferFailure(
                "copy from released device region".to_string(),
            )),
        }
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("size", &self.size)
            .field("released", &self.is_released())
            .finish()
    }
}
