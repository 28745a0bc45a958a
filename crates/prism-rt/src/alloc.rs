//! Buffer bookkeeping for a single build attempt.

use prism_core::{BufferDesc, BufferHandle, Error, GpuDevice, Result};
use tracing::warn;

/// Buffers created while preparing one build.
///
/// If the attempt fails before anything was recorded, [`Self::abandon`]
/// destroys them immediately so no partially built structure survives.
#[derive(Debug, Default)]
pub(crate) struct BuildAllocation {
    created: Vec<BufferHandle>,
}

impl BuildAllocation {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create a buffer, reporting any failure as an allocation failure.
    pub(crate) fn create<D: GpuDevice>(
        &mut self,
        device: &mut D,
        desc: &BufferDesc<'_>,
    ) -> Result<BufferHandle> {
        let handle = device
            .create_buffer(desc)
            .map_err(Error::into_allocation_failure)?;
        self.created.push(handle);
        Ok(handle)
    }

    /// Destroy everything created so far.
    pub(crate) fn abandon<D: GpuDevice>(self, device: &mut D) {
        for handle in self.created.into_iter().rev() {
            if let Err(e) = device.destroy_buffer(handle) {
                warn!("Failed to release {handle:?} after a failed build: {e}");
            }
        }
    }

    /// Keep everything created so far.
    pub(crate) fn commit(self) {}
}

/// Run `record` with a fresh allocation; abandon it if `record` fails.
pub(crate) fn with_allocation<D, T, F>(device: &mut D, record: F) -> Result<T>
where
    D: GpuDevice,
    F: FnOnce(&mut D, &mut BuildAllocation) -> Result<T>,
{
    let mut allocation = BuildAllocation::new();
    match record(device, &mut allocation) {
        Ok(value) => {
            allocation.commit();
            Ok(value)
        }
        Err(e) => {
            allocation.abandon(device);
            Err(e)
        }
    }
}

/// Round `value` up to a power-of-two `alignment`.
#[inline]
pub(crate) const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
