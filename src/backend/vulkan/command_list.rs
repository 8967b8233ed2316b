//! Command buffers recorded by the generate pass.

use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::descriptor::VulkanDescriptorSet;
use crate::backend::vulkan::device::{ExtensionID, VulkanDevice};
use crate::backend::vulkan::pipeline::VulkanPipeline;
use crate::backend::vulkan::query_pool::VulkanQueryPool;
use crate::backend::vulkan::resource::{VulkanBuffer, VulkanTexture};
use crate::backend::vulkan::sync::Semaphore;
use crate::backend::{padded_update_len, BufferBarrierInfo, CommandList, DeviceBuffer, DeviceTexture, RenderAttachment, RenderingInfo, TextureBarrierInfo};
use crate::core::error::Error;
use crate::graph::state::{PipelineStage, TextureState};

/// `vkCmdUpdateBuffer` accepts at most this many bytes per call.
const MAX_UPDATE_SIZE: usize = 65536;

/// A primary command buffer, allocated from the pool of the queue it will be submitted to.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanCommandList {
    #[derivative(Debug = "ignore")]
    device: VulkanDevice,
    handle: vk::CommandBuffer,
    queue: usize,
    name: String,
}

impl VulkanCommandList {
    pub(crate) fn new(device: VulkanDevice, queue: usize, name: &str) -> Result<Self> {
        let handle = {
            let pool = device.queue(queue)?.pool()?;
            let info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(*pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            unsafe { device.handle().allocate_command_buffers(&info)? }
                .into_iter()
                .next()
                .ok_or(Error::Uncategorized("Command buffer allocation failed."))?
        };
        #[cfg(feature = "debug-markers")]
        device.set_name(handle, name);
        Ok(Self {
            device,
            handle,
            queue,
            name: name.to_owned(),
        })
    }

    /// # Safety
    /// The command buffer must not be freed through this handle.
    pub unsafe fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn queue_index(&self) -> usize {
        self.queue
    }

    fn vk(&self) -> &ash::Device {
        self.device.handle()
    }
}

impl Drop for VulkanCommandList {
    fn drop(&mut self) {
        match self.device.queue(self.queue).and_then(|queue| queue.pool()) {
            Ok(pool) => unsafe { self.device.handle().free_command_buffers(*pool, std::slice::from_ref(&self.handle)) },
            Err(err) => error!("Leaking command buffer {}: {err}", self.name),
        }
    }
}

fn full_range(texture: &VulkanTexture, base_mip: u32, mip_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: texture.aspect(),
        base_mip_level: base_mip,
        level_count: mip_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn mip_layers(texture: &VulkanTexture, mip: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: texture.aspect(),
        mip_level: mip,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn extent3d(extent: vk::Extent2D) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: 1,
    }
}

fn attachment_info(attachment: &RenderAttachment<VulkanDevice>) -> vk::RenderingAttachmentInfo {
    vk::RenderingAttachmentInfo::builder()
        .image_view(unsafe { attachment.texture.view() })
        .image_layout(attachment.state.layout())
        .load_op(attachment.load_op)
        .store_op(attachment.store_op)
        .clear_value(attachment.clear_value.into())
        .build()
}

impl CommandList<VulkanDevice> for VulkanCommandList {
    fn begin(&mut self) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::builder();
        unsafe { self.vk().begin_command_buffer(self.handle, &info)? };
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        unsafe { self.vk().end_command_buffer(self.handle)? };
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: &VulkanPipeline) -> Result<()> {
        unsafe { self.vk().cmd_bind_pipeline(self.handle, pipeline.bind_point(), pipeline.handle()) };
        Ok(())
    }

    fn bind_descriptor_set(&mut self, pipeline: &VulkanPipeline, set: &VulkanDescriptorSet) -> Result<()> {
        unsafe {
            self.vk()
                .cmd_bind_descriptor_sets(self.handle, pipeline.bind_point(), pipeline.layout(), 0, &[set.handle()], &[])
        };
        Ok(())
    }

    fn push_constants(&mut self, pipeline: &VulkanPipeline, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) -> Result<()> {
        unsafe { self.vk().cmd_push_constants(self.handle, pipeline.layout(), stages, offset, data) };
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<()> {
        unsafe { self.vk().cmd_draw(self.handle, vertex_count, instance_count, first_vertex, first_instance) };
        Ok(())
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) -> Result<()> {
        unsafe {
            self.vk()
                .cmd_draw_indexed(self.handle, index_count, instance_count, first_index, vertex_offset, first_instance)
        };
        Ok(())
    }

    fn draw_indexed_indirect_count(&mut self, draw_calls: &VulkanBuffer, count: &VulkanBuffer, count_offset: u64, max_draws: u32, stride: u32) -> Result<()> {
        unsafe {
            self.vk()
                .cmd_draw_indexed_indirect_count(self.handle, draw_calls.handle(), 0, count.handle(), count_offset, max_draws, stride)
        };
        Ok(())
    }

    fn draw_indirect_count(&mut self, draw_calls: &VulkanBuffer, count: &VulkanBuffer, count_offset: u64, max_draws: u32, stride: u32) -> Result<()> {
        unsafe {
            self.vk()
                .cmd_draw_indirect_count(self.handle, draw_calls.handle(), 0, count.handle(), count_offset, max_draws, stride)
        };
        Ok(())
    }

    fn dispatch(&mut self, dims: [u32; 3]) -> Result<()> {
        unsafe { self.vk().cmd_dispatch(self.handle, dims[0], dims[1], dims[2]) };
        Ok(())
    }

    fn dispatch_indirect(&mut self, buffer: &VulkanBuffer) -> Result<()> {
        unsafe { self.vk().cmd_dispatch_indirect(self.handle, buffer.handle(), 0) };
        Ok(())
    }

    fn trace_rays(&mut self, pipeline: &VulkanPipeline, dims: [u32; 3]) -> Result<()> {
        let functions = self
            .device
            .ray_tracing_pipeline()
            .ok_or(Error::ExtensionNotSupported(ExtensionID::RayTracingPipeline))?;
        let sbt = pipeline
            .shader_binding_table()
            .ok_or(Error::Uncategorized("trace_rays with a pipeline that is not a ray tracing pipeline"))?;
        unsafe { functions.cmd_trace_rays(self.handle, &sbt.ray_gen, &sbt.miss, &sbt.hit, &sbt.callable, dims[0], dims[1], dims[2]) };
        Ok(())
    }

    fn bind_vertex_buffer(&mut self, buffer: &VulkanBuffer) -> Result<()> {
        unsafe { self.vk().cmd_bind_vertex_buffers(self.handle, 0, &[buffer.handle()], &[0]) };
        Ok(())
    }

    fn bind_index_buffer(&mut self, buffer: &VulkanBuffer) -> Result<()> {
        unsafe { self.vk().cmd_bind_index_buffer(self.handle, buffer.handle(), 0, vk::IndexType::UINT32) };
        Ok(())
    }

    fn copy_texture_to_buffer(&mut self, src: &VulkanTexture, dst: &VulkanBuffer) -> Result<()> {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: mip_layers(src, 0),
            image_offset: vk::Offset3D::default(),
            image_extent: extent3d(src.extent()),
        };
        unsafe {
            self.vk()
                .cmd_copy_image_to_buffer(self.handle, src.handle(), TextureState::TransferSrc.layout(), dst.handle(), &[region])
        };
        Ok(())
    }

    fn copy_buffer_to_texture(&mut self, src: &VulkanBuffer, dst: &VulkanTexture) -> Result<()> {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: mip_layers(dst, 0),
            image_offset: vk::Offset3D::default(),
            image_extent: extent3d(dst.extent()),
        };
        unsafe {
            self.vk()
                .cmd_copy_buffer_to_image(self.handle, src.handle(), dst.handle(), TextureState::TransferDst.layout(), &[region])
        };
        Ok(())
    }

    fn copy_buffer(&mut self, src: &VulkanBuffer, dst: &VulkanBuffer) -> Result<()> {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size().min(dst.size()),
        };
        unsafe { self.vk().cmd_copy_buffer(self.handle, src.handle(), dst.handle(), &[region]) };
        Ok(())
    }

    fn copy_texture(&mut self, src: &VulkanTexture, dst: &VulkanTexture) -> Result<()> {
        let extent = vk::Extent2D {
            width: src.extent().width.min(dst.extent().width),
            height: src.extent().height.min(dst.extent().height),
        };
        self.copy_texture_region(src, vk::Offset2D::default(), dst, vk::Offset2D::default(), extent)
    }

    fn copy_texture_region(&mut self, src: &VulkanTexture, src_offset: vk::Offset2D, dst: &VulkanTexture, dst_offset: vk::Offset2D, extent: vk::Extent2D) -> Result<()> {
        let region = vk::ImageCopy {
            src_subresource: mip_layers(src, 0),
            src_offset: vk::Offset3D {
                x: src_offset.x,
                y: src_offset.y,
                z: 0,
            },
            dst_subresource: mip_layers(dst, 0),
            dst_offset: vk::Offset3D {
                x: dst_offset.x,
                y: dst_offset.y,
                z: 0,
            },
            extent: extent3d(extent),
        };
        unsafe {
            self.vk().cmd_copy_image(
                self.handle,
                src.handle(),
                TextureState::TransferSrc.layout(),
                dst.handle(),
                TextureState::TransferDst.layout(),
                &[region],
            )
        };
        Ok(())
    }

    fn blit_texture(&mut self, src: &VulkanTexture, dst: &VulkanTexture) -> Result<()> {
        let corner = |extent: vk::Extent2D| vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: mip_layers(src, 0),
            src_offsets: [vk::Offset3D::default(), corner(src.extent())],
            dst_subresource: mip_layers(dst, 0),
            dst_offsets: [vk::Offset3D::default(), corner(dst.extent())],
        };
        unsafe {
            self.vk().cmd_blit_image(
                self.handle,
                src.handle(),
                TextureState::TransferSrc.layout(),
                dst.handle(),
                TextureState::TransferDst.layout(),
                &[region],
                vk::Filter::LINEAR,
            )
        };
        Ok(())
    }

    fn update_buffer(&mut self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut padded = data.to_vec();
        padded.resize(padded_update_len(buffer.size(), offset, data.len())? as usize, 0);
        for (index, chunk) in padded.chunks(MAX_UPDATE_SIZE).enumerate() {
            let chunk_offset = offset + (index * MAX_UPDATE_SIZE) as u64;
            unsafe { self.vk().cmd_update_buffer(self.handle, buffer.handle(), chunk_offset, chunk) };
        }
        Ok(())
    }

    fn texture_barrier(&mut self, texture: &VulkanTexture, barrier: &TextureBarrierInfo) -> Result<()> {
        let is_depth = texture.aspect().contains(vk::ImageAspectFlags::DEPTH);
        let image_barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(barrier.src_stages)
            .src_access_mask(barrier.src_state.access(is_depth))
            .dst_stage_mask(barrier.dst_stages)
            .dst_access_mask(barrier.dst_state.access(is_depth))
            .old_layout(barrier.src_state.layout())
            .new_layout(barrier.dst_state.layout())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(unsafe { texture.handle() })
            .subresource_range(full_range(texture, barrier.base_mip, barrier.mip_count))
            .build();
        let dependency = vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(&image_barrier));
        unsafe { self.vk().cmd_pipeline_barrier2(self.handle, &dependency) };
        Ok(())
    }

    fn buffer_barrier(&mut self, buffer: &VulkanBuffer, barrier: &BufferBarrierInfo) -> Result<()> {
        let buffer_barrier = vk::BufferMemoryBarrier2::builder()
            .src_stage_mask(barrier.src_stages)
            .src_access_mask(barrier.src_access)
            .dst_stage_mask(barrier.dst_stages)
            .dst_access_mask(barrier.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(unsafe { buffer.handle() })
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        let dependency = vk::DependencyInfo::builder().buffer_memory_barriers(std::slice::from_ref(&buffer_barrier));
        unsafe { self.vk().cmd_pipeline_barrier2(self.handle, &dependency) };
        Ok(())
    }

    fn begin_rendering(&mut self, info: &RenderingInfo<'_, VulkanDevice>) -> Result<()> {
        let color = info.color_attachments.iter().map(attachment_info).collect::<Vec<_>>();
        let depth = info.depth_attachment.as_ref().map(attachment_info);
        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: info.extent,
        };
        let mut rendering = vk::RenderingInfo::builder()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color);
        if let Some(depth) = depth.as_ref() {
            rendering = rendering.depth_attachment(depth);
        }

        #[cfg(feature = "debug-markers")]
        self.device.begin_label(self.handle, info.name);

        unsafe {
            self.vk().cmd_begin_rendering(self.handle, &rendering);
            self.vk().cmd_set_viewport(
                self.handle,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: info.extent.width as f32,
                    height: info.extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            self.vk().cmd_set_scissor(self.handle, 0, &[area]);
        }
        Ok(())
    }

    fn end_rendering(&mut self) -> Result<()> {
        unsafe { self.vk().cmd_end_rendering(self.handle) };
        #[cfg(feature = "debug-markers")]
        self.device.end_label(self.handle);
        Ok(())
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) -> Result<()> {
        unsafe { self.vk().cmd_set_viewport(self.handle, 0, &[viewport]) };
        Ok(())
    }

    fn reset_queries(&mut self, pool: &VulkanQueryPool, first: u32, count: u32) -> Result<()> {
        unsafe { self.vk().cmd_reset_query_pool(self.handle, pool.handle(), first, count) };
        Ok(())
    }

    fn write_timestamp(&mut self, stage: PipelineStage, pool: &VulkanQueryPool, index: u32) -> Result<()> {
        unsafe { self.vk().cmd_write_timestamp2(self.handle, stage, pool.handle(), index) };
        Ok(())
    }

    fn begin_query(&mut self, pool: &VulkanQueryPool, index: u32) -> Result<()> {
        unsafe { self.vk().cmd_begin_query(self.handle, pool.handle(), index, vk::QueryControlFlags::empty()) };
        Ok(())
    }

    fn end_query(&mut self, pool: &VulkanQueryPool, index: u32) -> Result<()> {
        unsafe { self.vk().cmd_end_query(self.handle, pool.handle(), index) };
        Ok(())
    }
}

pub(crate) fn submit_info(semaphores: &[&Semaphore]) -> Vec<vk::SemaphoreSubmitInfo> {
    semaphores
        .iter()
        .map(|semaphore| {
            vk::SemaphoreSubmitInfo::builder()
                .semaphore(unsafe { semaphore.handle() })
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .build()
        })
        .collect()
}
