//! Device context: accelerator discovery, memory accounting, and copies.
//!
//! The default backend emulates device memory in host RAM with a
//! configurable capacity, so the full coherence and allocation logic runs
//! without an accelerator. The `cuda` feature gates the real backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DeviceConfig;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfDeviceMemory { requested: usize, available: usize },

    #[error("Device transfer failed: {0}")]
    TransferFailure(String),

    #[error("Device region size mismatch: region is {expected} bytes, buffer is {got}")]
    RegionSizeMismatch { expected: usize, got: usize },

    #[error("Device {0} not available")]
    DeviceNotAvailable(usize),
}

/// Information about the accelerator backing this context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device index.
    pub id: usize,

    /// Device name (e.g. "NVIDIA GeForce GTX 1070", "emulated").
    pub name: String,

    /// Total device memory in bytes.
    pub total_memory: usize,
}

/// A point-in-time view of device memory occupancy.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    /// Bytes currently available for allocation.
    pub available: usize,

    /// Total device memory in bytes.
    pub total: usize,
}

/// Allocation and transfer counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStats {
    pub allocations: u64,
    pub releases: u64,
    pub h2d_transfers: u64,
    pub d2h_transfers: u64,
    pub h2d_bytes: u64,
    pub d2h_bytes: u64,
}

/// Opaque handle to one device memory region.
pub(crate) type RegionHandle = u64;

struct EmulatedState {
    capacity: usize,
    used: usize,
    regions: HashMap<RegionHandle, Vec<u8>>,
    next_handle: RegionHandle,
    fault_transfers: bool,
    stats: DeviceStats,
}

/// One accelerator's memory space.
///
/// Shared (`Arc`) between every allocation and buffer that targets the
/// device. The capacity check in [`DeviceContext::alloc_region`] is a
/// best-effort guard against a point-in-time snapshot, not a reservation:
/// a concurrent allocator may win the race, in which case the loser fails
/// at allocation time with the same `OutOfDeviceMemory`.
pub struct DeviceContext {
    info: DeviceInfo,
    state: Mutex<EmulatedState>,
}

impl DeviceContext {
    /// Create a host-emulated device with the given memory capacity.
    pub fn new(memory_budget: usize) -> Self {
        Self {
            info: DeviceInfo {
                id: 0,
                name: "emulated".to_string(),
                total_memory: memory_budget,
            },
            state: Mutex::new(EmulatedState {
                capacity: memory_budget,
                used: 0,
                regions: HashMap::new(),
                next_handle: 0,
                fault_transfers: false,
                stats: DeviceStats::default(),
            }),
        }
    }

    /// Detect the accelerator for this process.
    ///
    /// With the `cuda` feature enabled, binds the configured CUDA device.
    /// Without it, emulates device memory in host RAM using the configured
    /// budget.
    pub fn detect(config: &DeviceConfig) -> Self {
        #[cfg(feature = "cuda")]
        {
            Self::detect_cuda(config)
        }

        #[cfg(not(feature = "cuda"))]
        {
            info!(
                budget = config.memory_budget,
                "CUDA not enabled, emulating device memory in host RAM"
            );
            Self::new(config.memory_budget)
        }
    }

    #[cfg(feature = "cuda")]
    fn detect_cuda(_config: &DeviceConfig) -> Self {
        // Real implementation would use cudarc to bind the device and back
        // alloc/copy with cuMemAlloc/cuMemcpy. Compile-time gated until the
        // CUDA backend lands.
        todo!("Implement CUDA device binding with cudarc")
    }

    /// Create an emulated device whose transfers all fail.
    ///
    /// Test support: exercises the `TransferFailure` paths without an
    /// accelerator that can actually fail.
    pub fn with_transfer_faults(memory_budget: usize) -> Self {
        let ctx = Self::new(memory_budget);
        ctx.state().fault_transfers = true;
        ctx
    }

    fn state(&self) -> MutexGuard<'_, EmulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device identity and capacity.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Query current memory occupancy.
    pub fn memory_info(&self) -> MemoryInfo {
        let state = self.state();
        MemoryInfo {
            available: state.capacity - state.used,
            total: state.capacity,
        }
    }

    /// Allocation and transfer counters since creation.
    pub fn stats(&self) -> DeviceStats {
        self.state().stats
    }

    /// Allocate a region of `bytes` device bytes.
    ///
    /// The capacity check precedes the allocation, so a failure leaves no
    /// partial allocation behind.
    pub(crate) fn alloc_region(&self, bytes: usize) -> Result<RegionHandle, DeviceError> {
        let mut state = self.state();

        let available = state.capacity - state.used;
        if bytes > available {
            return Err(DeviceError::OutOfDeviceMemory {
                requested: bytes,
                available,
            });
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.regions.insert(handle, vec![0u8; bytes]);
        state.used += bytes;
        state.stats.allocations += 1;

        debug!(handle, bytes, available, "Allocated device region");
        Ok(handle)
    }

    /// Free a region. Unknown handles are ignored; the allocation guard
    /// clears its handle on first release, so a live handle is never freed
    /// twice.
    pub(crate) fn release_region(&self, handle: RegionHandle) {
        let mut state = self.state();
        if let Some(region) = state.regions.remove(&handle) {
            state.used -= region.len();
            state.stats.releases += 1;
            debug!(handle, bytes = region.len(), "Released device region");
        }
    }

    /// Copy host bytes into a device region (host → device).
    pub(crate) fn copy_to_device(
        &self,
        handle: RegionHandle,
        src: &[u8],
    ) -> Result<(), DeviceError> {
        let mut state = self.state();

        if state.fault_transfers {
            return Err(DeviceError::TransferFailure(
                "injected transfer fault".to_string(),
            ));
        }

        let region = state
            .regions
            .get_mut(&handle)
            .ok_or_else(|| DeviceError::TransferFailure("device region released".to_string()))?;

        if region.len() != src.len() {
            return Err(DeviceError::RegionSizeMismatch {
                expected: region.len(),
                got: src.len(),
            });
        }

        region.copy_from_slice(src);
        state.stats.h2d_transfers += 1;
        state.stats.h2d_bytes += src.len() as u64;

        debug!(handle, bytes = src.len(), "H2D transfer");
        Ok(())
    }

    /// Copy a device region back into host bytes (device → host).
    pub(crate) fn copy_to_host(
        &self,
        handle: RegionHandle,
        dst: &mut [u8],
    ) -> Result<(), DeviceError> {
        let mut state = self.state();

        if state.fault_transfers {
            return Err(DeviceError::TransferFailure(
                "injected transfer fault".to_string(),
            ));
        }

        let region = state
            .regions
            .get(&handle)
            .ok_or_else(|| DeviceError::TransferFailure("device region released".to_string()))?;

        if region.len() != dst.len() {
            return Err(DeviceError::RegionSizeMismatch {
                expected: region.len(),
                got: dst.len(),
            });
        }

        dst.copy_from_slice(region);
        state.stats.d2h_transfers += 1;
        state.stats.d2h_bytes += dst.len() as u64;

        debug!(handle, bytes = dst.len(), "D2H transfer");
        Ok(())
    }
}
