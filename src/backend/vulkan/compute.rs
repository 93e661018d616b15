//! Compute pipeline plumbing for the GEMM kernel
//!
//! - `ShaderModule`: SPIR-V module with its entry point
//! - `ComputePipeline`: VkPipeline (compute), layout, one descriptor set
//! - `CommandBufferPool`: reusable command buffers submitted with a fence

use ash::{vk, Device};
use std::ffi::CString;
use std::sync::Arc;

use crate::error::DeviceError;

/// Compiled SPIR-V shader module
pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    pub entry_point: String,
    device: Arc<Device>,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytes.
    pub fn new(device: Arc<Device>, spirv: &[u8], entry_point: &str) -> Result<Self, DeviceError> {
        // read_spv checks the magic number and realigns to u32 words
        let code = ash::util::read_spv(&mut std::io::Cursor::new(spirv))
            .map_err(|e| DeviceError::InitializationFailed(format!("invalid SPIR-V: {}", e)))?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let handle = unsafe { device.create_shader_module(&create_info, None) }?;

        log::debug!("Created shader module: {} words, entry={}", code.len(), entry_point);
        Ok(Self {
            handle,
            entry_point: entry_point.to_string(),
            device,
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.handle, None);
        }
    }
}

/// Command buffer pool for reuse across dispatches
pub struct CommandBufferPool {
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    next_buffer_index: usize,
    device: Arc<Device>,
}

impl CommandBufferPool {
    pub fn new(device: Arc<Device>, queue_family: u32, count: u32) -> Result<Self, DeviceError> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let command_buffers = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(e.into());
            }
        };

        log::debug!(
            "Created CommandBufferPool: {} buffers, queue_family={}",
            count,
            queue_family
        );

        Ok(Self {
            command_pool,
            command_buffers,
            next_buffer_index: 0,
            device,
        })
    }

    /// Reset the next command buffer (round-robin) and begin recording.
    ///
    /// The caller must have waited for any earlier submission of it.
    pub fn begin_command_buffer(&mut self) -> Result<vk::CommandBuffer, DeviceError> {
        let cmd_buffer = self.command_buffers[self.next_buffer_index];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .reset_command_buffer(cmd_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(cmd_buffer, &begin_info)?;
        }

        self.next_buffer_index = (self.next_buffer_index + 1) % self.command_buffers.len();
        Ok(cmd_buffer)
    }

    pub fn end_command_buffer(&self, cmd_buffer: vk::CommandBuffer) -> Result<(), DeviceError> {
        unsafe { self.device.end_command_buffer(cmd_buffer) }?;
        Ok(())
    }

    /// Submit without waiting; `fence` is signalled on completion.
    pub fn submit(
        &self,
        cmd_buffer: vk::CommandBuffer,
        queue: vk::Queue,
        fence: vk::Fence,
    ) -> Result<(), DeviceError> {
        let submit_info =
            vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd_buffer));

        unsafe { self.device.queue_submit(queue, &[submit_info], fence) }?;
        log::debug!("Command buffer submitted");
        Ok(())
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        log::debug!("Dropping CommandBufferPool");
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Compute pipeline with a single reusable descriptor set.
pub struct ComputePipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    device: Arc<Device>,
}

impl ComputePipeline {
    /// Build the pipeline for `shader` with storage-buffer `bindings` and
    /// `push_constant_size` bytes of push constants.
    pub fn new(
        device: Arc<Device>,
        shader: &ShaderModule,
        bindings: &[vk::DescriptorSetLayoutBinding],
        push_constant_size: u32,
    ) -> Result<Self, DeviceError> {
        log::info!(
            "Creating ComputePipeline: entry={}, bindings={}, push_constants={} bytes",
            shader.entry_point,
            bindings.len(),
            push_constant_size
        );

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        let descriptor_set_layout =
            unsafe { device.create_descriptor_set_layout(&layout_info, None) }?;

        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_size)];
        let set_layouts = [descriptor_set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: bindings.len() as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(1);
        let descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }?;

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);
        let descriptor_set = unsafe { device.allocate_descriptor_sets(&alloc_info) }?[0];

        let entry_point = CString::new(shader.entry_point.as_str()).map_err(|e| {
            DeviceError::InitializationFailed(format!("invalid entry point name: {}", e))
        })?;
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.handle)
            .name(&entry_point);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipeline = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        // .1 is the error, .0 the partially created pipelines
        .map_err(|e| DeviceError::VulkanApi(e.1))?[0];

        log::info!("ComputePipeline created successfully");

        Ok(Self {
            pipeline,
            layout,
            descriptor_set_layout,
            descriptor_pool,
            descriptor_set,
            device,
        })
    }

    /// Point the descriptor set at `buffers`, binding `i` to `buffers[i]`.
    ///
    /// Only legal while no submitted command buffer uses the set.
    pub fn bind_storage_buffers(&self, buffers: &[vk::Buffer]) {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|buffer| {
                vk::DescriptorBufferInfo::default()
                    .buffer(*buffer)
                    .offset(0)
                    .range(vk::WHOLE_SIZE)
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set)
                    .dst_binding(binding as u32)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();

        unsafe {
            self.device.update_descriptor_sets(&writes, &[]);
        }
    }

    /// Record bind + push constants + dispatch.
    pub fn record_dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        push_constants: &[u8],
        group_count: (u32, u32, u32),
    ) {
        unsafe {
            self.device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline,
            );
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            self.device.cmd_push_constants(
                command_buffer,
                self.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constants,
            );
            self.device.cmd_dispatch(
                command_buffer,
                group_count.0,
                group_count.1,
                group_count.2,
            );
        }

        log::debug!(
            "Recorded compute dispatch: workgroups=({}, {}, {})",
            group_count.0,
            group_count.1,
            group_count.2
        );
    }

    /// Make shader writes visible to later dispatches and to host reads.
    pub fn record_write_barrier(&self, command_buffer: vk::CommandBuffer) {
        let memory_barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::HOST_READ);

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            );
        }
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        log::debug!("Dropping ComputePipeline");
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}

/// Builder for storage-buffer descriptor bindings
#[derive(Default)]
pub struct DescriptorBindingBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorBindingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage buffer visible to the compute stage
    pub fn add_storage_buffer(mut self, binding: u32) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
        );
        self
    }

    pub fn build(self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_binding_builder() {
        let bindings = DescriptorBindingBuilder::new()
            .add_storage_buffer(0)
            .add_storage_buffer(1)
            .add_storage_buffer(2)
            .build();

        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[2].binding, 2);
        assert!(bindings
            .iter()
            .all(|b| b.descriptor_type == vk::DescriptorType::STORAGE_BUFFER));
    }
}
