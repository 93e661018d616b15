//! Host-visible storage buffers
//!
//! Each device region is one VkBuffer bound to its own host-visible,
//! host-coherent VkDeviceMemory. Uploads and downloads go through a memory
//! map, so the caller must make sure no submitted work still uses the
//! buffer.

use ash::{vk, Device};
use std::sync::Arc;

use crate::error::DeviceError;

/// VkBuffer plus the memory backing it
pub struct StorageBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    /// Size in bytes
    size: vk::DeviceSize,
    device: Arc<Device>,
}

impl StorageBuffer {
    /// Create a storage buffer of `size` bytes in memory with `properties`.
    pub fn new(
        device: Arc<Device>,
        size: vk::DeviceSize,
        properties: vk::MemoryPropertyFlags,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
    ) -> Result<Self, DeviceError> {
        let buffer_create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_create_info, None) }
            .map_err(|e| out_of_memory_or(e, size))?;

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_type_index =
            match find_memory_type(memory_properties, mem_requirements.memory_type_bits, properties) {
                Some(index) => index,
                None => {
                    unsafe { device.destroy_buffer(buffer, None) };
                    return Err(DeviceError::InitializationFailed(
                        "no host-visible memory type for storage buffers".to_string(),
                    ));
                }
            };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(out_of_memory_or(e, size));
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(DeviceError::VulkanApi(e));
        }

        log::debug!(
            "Created storage buffer: {} bytes (allocation {} bytes, memory type {})",
            size,
            mem_requirements.size,
            memory_type_index
        );

        Ok(Self {
            buffer,
            memory,
            size,
            device,
        })
    }

    /// Copy `data` into the buffer. `data` must be exactly the buffer size.
    pub fn upload(&self, data: &[f32]) -> Result<(), DeviceError> {
        let data_size = std::mem::size_of_val(data) as u64;
        if data_size != self.size {
            return Err(DeviceError::SizeMismatch {
                host: data_size,
                device: self.size,
            });
        }

        let mapped_ptr = unsafe {
            self.device
                .map_memory(self.memory, 0, data_size, vk::MemoryMapFlags::empty())
        }?;

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr() as *const u8,
                mapped_ptr as *mut u8,
                data_size as usize,
            );
            self.device.unmap_memory(self.memory);
        }

        log::debug!("Uploaded {} bytes to storage buffer", data_size);
        Ok(())
    }

    /// Copy the whole buffer back to the host.
    pub fn download(&self) -> Result<Vec<f32>, DeviceError> {
        let mut data = vec![0.0f32; self.elements()];

        let mapped_ptr = unsafe {
            self.device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
        }?;

        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped_ptr as *const u8,
                data.as_mut_ptr() as *mut u8,
                self.size as usize,
            );
            self.device.unmap_memory(self.memory);
        }

        log::debug!("Downloaded {} bytes from storage buffer", self.size);
        Ok(data)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn elements(&self) -> usize {
        (self.size as usize) / std::mem::size_of::<f32>()
    }
}

impl Drop for StorageBuffer {
    fn drop(&mut self) {
        log::debug!("Destroying storage buffer (size={})", self.size);
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

fn out_of_memory_or(result: vk::Result, requested: u64) -> DeviceError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            DeviceError::OutOfMemory {
                requested,
                available: 0,
            }
        }
        other => DeviceError::VulkanApi(other),
    }
}

/// Find a memory type allowed by `type_filter` that has all of `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_memory_type() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let result = find_memory_type(
            &props,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert_eq!(result, Some(1));

        // Type 1 excluded by the filter
        let result = find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(result, None);
    }

    #[test]
    fn test_out_of_memory_mapping() {
        assert!(matches!(
            out_of_memory_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, 64),
            DeviceError::OutOfMemory { requested: 64, .. }
        ));
        assert!(matches!(
            out_of_memory_or(vk::Result::ERROR_DEVICE_LOST, 64),
            DeviceError::VulkanApi(vk::Result::ERROR_DEVICE_LOST)
        ));
    }
}
