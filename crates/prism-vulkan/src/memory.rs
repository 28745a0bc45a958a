//! GPU memory management.

use crate::error::{Result, VulkanError};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use prism_core::{BufferDesc, BufferUsage};

/// Vulkan usage flags for a core buffer usage.
///
/// Every buffer is addressable: builds, instance records and the SBT are all
/// referenced by device address.
pub fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    if usage.contains(BufferUsage::SCRATCH) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::BUILD_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::SHADER_TABLE) {
        flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    flags
}

/// Memory location for a core buffer usage.
pub fn memory_location(usage: BufferUsage) -> MemoryLocation {
    if usage.contains(BufferUsage::UPLOAD) {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::GpuOnly
    }
}

/// GPU memory allocator wrapper.
pub struct BufferAllocator {
    allocator: Option<Allocator>,
    device: ash::Device,
}

impl BufferAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Some(allocator),
            device: device.clone(),
        })
    }

    /// Allocate and bind a buffer whose address is a multiple of `min_alignment`.
    pub fn create_buffer(&mut self, desc: &BufferDesc<'_>, min_alignment: u64) -> Result<VulkanBuffer> {
        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| VulkanError::InvalidState("Allocator shut down".to_string()))?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(buffer_usage_flags(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };

        let mut requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(min_alignment);

        let allocation = allocator.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: memory_location(desc.usage),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            allocator.free(allocation)?;
            return Err(e.into());
        }

        let address = unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };

        Ok(VulkanBuffer {
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
            address,
        })
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut VulkanBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator
                .as_mut()
                .ok_or_else(|| VulkanError::InvalidState("Allocator shut down".to_string()))?
                .free(allocation)?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Free all GPU memory. Must run before the Vulkan device is destroyed.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub usage: BufferUsage,
    /// Buffer device address.
    pub address: vk::DeviceAddress,
}

impl VulkanBuffer {
    /// Map the buffer memory for CPU access.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| VulkanError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| VulkanError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(VulkanError::InvalidState(format!(
                "Write of {} bytes at {offset} exceeds buffer of {} bytes",
                data.len(),
                self.size
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_buffer_is_addressable() {
        for usage in [
            BufferUsage::ACCELERATION_STRUCTURE,
            BufferUsage::SCRATCH,
            BufferUsage::SHADER_TABLE | BufferUsage::UPLOAD,
        ] {
            assert!(buffer_usage_flags(usage).contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        }
    }

    #[test]
    fn usage_translation() {
        let flags = buffer_usage_flags(BufferUsage::BUILD_INPUT | BufferUsage::UPLOAD);
        assert!(flags.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR));
        assert!(!flags.contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));

        assert!(buffer_usage_flags(BufferUsage::SHADER_TABLE)
            .contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));
        assert!(buffer_usage_flags(BufferUsage::SCRATCH)
            .contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn uploads_are_host_visible() {
        assert_eq!(memory_location(BufferUsage::UPLOAD), MemoryLocation::CpuToGpu);
        assert_eq!(
            memory_location(BufferUsage::ACCELERATION_STRUCTURE),
            MemoryLocation::GpuOnly
        );
    }
}
