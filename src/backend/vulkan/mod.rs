//! Vulkan backend
//!
//! Runs each GEMM as one compute dispatch of `shader/gemm_strided.comp`
//! (compiled to SPIR-V ahead of time). Regions are host-visible coherent
//! storage buffers, so transfers are plain memory maps. Every dispatch is
//! submitted with a fence; `synchronize`, transfers and the next dispatch
//! wait on it, which keeps stages strictly ordered.

mod buffer;
mod compute;

use ash::{vk, Device, Entry, Instance};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::Path;
use std::sync::Arc;

use crate::backend::{GemmBackend, GemmCall, RegionId};
use crate::error::DeviceError;

use buffer::StorageBuffer;
use compute::{CommandBufferPool, ComputePipeline, DescriptorBindingBuilder, ShaderModule};

/// Workgroup edge of the GEMM shader (local_size_x = local_size_y)
const TILE_SIZE: u32 = 16;

/// Push constants of the GEMM shader; layout matches `Params` in the GLSL
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GemmPushConstants {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub lda: u32,
    pub ldb: u32,
    pub ldc: u32,
    pub trans_a: u32,
    pub trans_b: u32,
    pub alpha: f32,
    pub beta: f32,
}

impl GemmPushConstants {
    pub fn from_call(call: &GemmCall) -> Result<Self, DeviceError> {
        let narrow = |value: usize, what: &str| {
            u32::try_from(value)
                .map_err(|_| DeviceError::Rejected(format!("{} = {} exceeds u32", what, value)))
        };
        Ok(Self {
            m: narrow(call.m, "m")?,
            n: narrow(call.n, "n")?,
            k: narrow(call.k, "k")?,
            lda: narrow(call.lda, "lda")?,
            ldb: narrow(call.ldb, "ldb")?,
            ldc: narrow(call.ldc, "ldc")?,
            trans_a: call.trans_a.is_transposed() as u32,
            trans_b: call.trans_b.is_transposed() as u32,
            alpha: call.alpha,
            beta: call.beta,
        })
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self as *const GemmPushConstants as *const u8,
                std::mem::size_of::<GemmPushConstants>(),
            )
        }
    }

    /// Workgroups needed to cover the `m x n` output
    pub fn group_count(&self) -> (u32, u32, u32) {
        (self.m.div_ceil(TILE_SIZE), self.n.div_ceil(TILE_SIZE), 1)
    }
}

/// Instance and logical device; destroyed last.
struct DeviceOwner {
    _entry: Entry,
    instance: Instance,
    device: Arc<Device>,
}

impl Drop for DeviceOwner {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device");
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// GEMM backend on the first Vulkan device with a compute queue.
pub struct VulkanBackend {
    // Field order is drop order: everything holding the device goes first
    regions: HashMap<u64, StorageBuffer>,
    pipeline: ComputePipeline,
    commands: CommandBufferPool,
    fence: vk::Fence,
    pending: bool,
    compute_queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    heap_size: u64,
    memory_used: u64,
    next_region: u64,
    device_name: String,
    owner: DeviceOwner,
}

impl VulkanBackend {
    /// Load the compiled GEMM shader from `path` and bring up the device.
    pub fn from_spirv_path(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let spirv = std::fs::read(path.as_ref()).map_err(|e| {
            DeviceError::InitializationFailed(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::new(&spirv)
    }

    pub fn new(gemm_spirv: &[u8]) -> Result<Self, DeviceError> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            DeviceError::InitializationFailed(format!("failed to load Vulkan: {:?}", e))
        })?;

        let app_name = CString::new("gemm-stages").map_err(|e| {
            DeviceError::InitializationFailed(format!("invalid application name: {}", e))
        })?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&app_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        Self::open_device(entry, instance, gemm_spirv)
    }

    fn open_device(entry: Entry, instance: Instance, gemm_spirv: &[u8]) -> Result<Self, DeviceError> {
        let physical_devices = match unsafe { instance.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e.into());
            }
        };

        // First device exposing a compute queue
        let selected = physical_devices.iter().find_map(|&physical_device| {
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
            families
                .iter()
                .position(|props| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
                .map(|family| (physical_device, family as u32))
        });

        let Some((physical_device, compute_queue_family)) = selected else {
            unsafe { instance.destroy_instance(None) };
            return Err(DeviceError::NoSuitableDevice);
        };

        let device_props = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(device_props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_queue_family)
            .queue_priorities(&queue_priorities);
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = match unsafe {
            instance.create_device(physical_device, &device_create_info, None)
        } {
            Ok(device) => Arc::new(device),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e.into());
            }
        };

        // From here on the owner tears down device and instance on any error
        let owner = DeviceOwner {
            _entry: entry,
            instance,
            device: device.clone(),
        };

        let compute_queue = unsafe { device.get_device_queue(compute_queue_family, 0) };
        let heap_size = host_visible_heap_size(&memory_properties);

        let shader = ShaderModule::new(device.clone(), gemm_spirv, "main")?;
        let bindings = DescriptorBindingBuilder::new()
            .add_storage_buffer(0) // A
            .add_storage_buffer(1) // B
            .add_storage_buffer(2) // C
            .build();
        let pipeline = ComputePipeline::new(
            device.clone(),
            &shader,
            &bindings,
            std::mem::size_of::<GemmPushConstants>() as u32,
        )?;
        let commands = CommandBufferPool::new(device.clone(), compute_queue_family, 2)?;
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }?;

        log::info!(
            "Vulkan device '{}': compute queue family {}, {} bytes host-visible memory",
            device_name,
            compute_queue_family,
            heap_size
        );

        Ok(Self {
            regions: HashMap::new(),
            pipeline,
            commands,
            fence,
            pending: false,
            compute_queue,
            memory_properties,
            heap_size,
            memory_used: 0,
            next_region: 0,
            device_name,
            owner,
        })
    }

    fn device(&self) -> &Arc<Device> {
        &self.owner.device
    }

    /// Block until the last submission has finished.
    fn wait_pending(&mut self) -> Result<(), DeviceError> {
        if !self.pending {
            return Ok(());
        }
        unsafe {
            self.device()
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => DeviceError::Fault("device lost".to_string()),
                    other => DeviceError::VulkanApi(other),
                })?;
            self.device().reset_fences(&[self.fence])?;
        }
        self.pending = false;
        Ok(())
    }

    fn buffer(&self, region: RegionId) -> Result<&StorageBuffer, DeviceError> {
        self.regions
            .get(&region.0)
            .ok_or(DeviceError::UnknownRegion(region.0))
    }
}

/// Size of the heap behind the first host-visible coherent memory type.
fn host_visible_heap_size(memory_properties: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    (0..memory_properties.memory_type_count as usize)
        .map(|i| memory_properties.memory_types[i])
        .find(|ty| ty.property_flags.contains(wanted))
        .map(|ty| memory_properties.memory_heaps[ty.heap_index as usize].size)
        .unwrap_or(0)
}

impl GemmBackend for VulkanBackend {
    fn device_name(&self) -> String {
        self.device_name.clone()
    }

    fn available_memory(&self) -> u64 {
        self.heap_size.saturating_sub(self.memory_used)
    }

    fn allocate(&mut self, bytes: u64) -> Result<RegionId, DeviceError> {
        let available = self.available_memory();
        if bytes > available {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available,
            });
        }

        let buffer = StorageBuffer::new(
            self.device().clone(),
            bytes,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            &self.memory_properties,
        )
        .map_err(|e| match e {
            DeviceError::OutOfMemory { requested, .. } => DeviceError::OutOfMemory {
                requested,
                available,
            },
            other => other,
        })?;

        let id = self.next_region;
        self.next_region += 1;
        self.regions.insert(id, buffer);
        self.memory_used += bytes;
        Ok(RegionId(id))
    }

    fn free(&mut self, region: RegionId) -> Result<(), DeviceError> {
        self.wait_pending()?;
        let buffer = self
            .regions
            .remove(&region.0)
            .ok_or(DeviceError::UnknownRegion(region.0))?;
        self.memory_used -= buffer.size();
        Ok(())
    }

    fn upload(&mut self, region: RegionId, data: &[f32]) -> Result<(), DeviceError> {
        self.wait_pending()?;
        self.buffer(region)?.upload(data)
    }

    fn download(&mut self, region: RegionId) -> Result<Vec<f32>, DeviceError> {
        self.wait_pending()?;
        self.buffer(region)?.download()
    }

    fn gemm(&mut self, call: &GemmCall) -> Result<(), DeviceError> {
        call.check_extents(|region| self.regions.get(&region.0).map(StorageBuffer::elements))?;
        let constants = GemmPushConstants::from_call(call)?;

        // The descriptor set and command buffers are reused
        self.wait_pending()?;

        let handles = [
            self.buffer(call.a)?.handle(),
            self.buffer(call.b)?.handle(),
            self.buffer(call.c)?.handle(),
        ];
        self.pipeline.bind_storage_buffers(&handles);

        let cmd_buffer = self.commands.begin_command_buffer()?;
        self.pipeline
            .record_dispatch(cmd_buffer, constants.as_bytes(), constants.group_count());
        self.pipeline.record_write_barrier(cmd_buffer);
        self.commands.end_command_buffer(cmd_buffer)?;
        self.commands
            .submit(cmd_buffer, self.compute_queue, self.fence)
            .map_err(|e| match e {
                DeviceError::VulkanApi(vk::Result::ERROR_DEVICE_LOST) => {
                    DeviceError::Fault("device lost during submit".to_string())
                }
                other => other,
            })?;
        self.pending = true;
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        self.wait_pending()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.wait_pending() {
            log::warn!("Pending GEMM did not complete before teardown: {}", e);
        }
        unsafe {
            self.device().destroy_fence(self.fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Transpose;

    #[test]
    fn test_push_constant_layout() {
        // Ten 4-byte fields, no padding
        assert_eq!(std::mem::size_of::<GemmPushConstants>(), 40);
    }

    #[test]
    fn test_push_constants_from_call() {
        let call = GemmCall {
            trans_a: Transpose::Yes,
            trans_b: Transpose::No,
            m: 33,
            n: 16,
            k: 5,
            alpha: 2.0,
            a: RegionId(0),
            lda: 5,
            b: RegionId(1),
            ldb: 5,
            beta: 1.0,
            c: RegionId(2),
            ldc: 40,
        };
        let constants = GemmPushConstants::from_call(&call).unwrap();
        assert_eq!(constants.trans_a, 1);
        assert_eq!(constants.trans_b, 0);
        assert_eq!(constants.ldc, 40);
        assert_eq!(constants.group_count(), (3, 1, 1));
        assert_eq!(constants.as_bytes().len(), 40);
    }
}
