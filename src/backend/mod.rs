//! The native GPU surface the render graph is lowered onto.
//!
//! The graph never talks to a graphics API directly. Everything it needs is expressed through the [`Device`]
//! and [`CommandList`] traits, so the same recorded jobs can run on the [`vulkan`] backend or on the
//! [`recording`] backend that captures every native call for inspection.

use anyhow::Result;
use ash::vk;

use crate::core::error::Error;
use crate::core::name::Name;
use crate::graph::declaration::{align_update_size, ClearValue, SamplerProperties};
use crate::graph::pipeline_state::{ComputePipelineState, GraphicsPipelineState, RayTracingPipelineState};
use crate::graph::state::{BufferAccess, PipelineStage, TextureState};

pub mod recording;
pub mod vulkan;

/// The memory type of an allocation indicates where it should live.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum MemoryType {
    /// GPU only accessible memory. This is where most resources live.
    #[default]
    GpuOnly,
    /// Host visible memory, used for staging uploads and readbacks.
    CpuToGpu,
    /// Memory useful for CPU readback of data.
    GpuToCpu,
}

impl From<MemoryType> for gpu_allocator::MemoryLocation {
    fn from(value: MemoryType) -> Self {
        match value {
            MemoryType::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
            MemoryType::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
            MemoryType::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferCreateInfo<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryType,
}

#[derive(Debug, Clone)]
pub struct TextureCreateInfo<'a> {
    pub name: &'a str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_count: u32,
}

/// Padded length of an update of `len` bytes at `offset`, or an error if it runs past the end of the buffer.
pub(crate) fn padded_update_len(size: u64, offset: u64, len: usize) -> Result<u64> {
    let padded = align_update_size(len as u64);
    if offset % 4 != 0 || offset + padded > size {
        return Err(Error::BufferUpdateOutOfRange {
            offset,
            len: padded,
            size,
        }
        .into());
    }
    Ok(padded)
}

/// Queries on a created buffer, used to decide whether a stored resource still matches its declaration.
pub trait DeviceBuffer {
    fn size(&self) -> u64;
    fn usage(&self) -> vk::BufferUsageFlags;
    fn memory_type(&self) -> MemoryType;
}

/// Queries on a created texture.
pub trait DeviceTexture {
    fn extent(&self) -> vk::Extent2D;
    fn format(&self) -> vk::Format;
    fn usage(&self) -> vk::ImageUsageFlags;
    fn mip_count(&self) -> u32;
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TextureBarrierInfo {
    pub src_stages: PipelineStage,
    pub dst_stages: PipelineStage,
    pub src_state: TextureState,
    pub dst_state: TextureState,
    pub base_mip: u32,
    pub mip_count: u32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BufferBarrierInfo {
    pub src_stages: PipelineStage,
    pub dst_stages: PipelineStage,
    pub src_access: BufferAccess,
    pub dst_access: BufferAccess,
}

pub struct RenderAttachment<'a, D: Device> {
    pub texture: &'a D::Texture,
    pub state: TextureState,
    pub clear_value: ClearValue,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
}

pub struct RenderingInfo<'a, D: Device> {
    pub name: &'a str,
    pub color_attachments: Vec<RenderAttachment<'a, D>>,
    pub depth_attachment: Option<RenderAttachment<'a, D>>,
    pub extent: vk::Extent2D,
}

/// A texture bound as a whole, or a single mip through its view.
pub enum ImageBinding<'a, D: Device> {
    Whole(&'a D::Texture),
    Mip(&'a D::TextureView),
}

pub enum DescriptorResource<'a, D: Device> {
    StorageImage(ImageBinding<'a, D>),
    CombinedImageSampler(ImageBinding<'a, D>, SamplerProperties),
    SampledImage(ImageBinding<'a, D>),
    SampledImageArray(Vec<(ImageBinding<'a, D>, SamplerProperties)>),
    UniformBuffer { buffer: &'a D::Buffer, offset: u64, range: Option<u64> },
    UniformBufferArray(Vec<&'a D::Buffer>),
    StorageBuffer(&'a D::Buffer),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

pub struct DescriptorWrite<'a, D: Device> {
    pub binding: u32,
    pub resource: DescriptorResource<'a, D>,
}

pub struct GraphicsShaders<'a> {
    pub vertex: &'a [u32],
    pub fragment: Option<&'a [u32]>,
}

pub struct RayTracingShader<'a> {
    pub name: &'a Name,
    pub stage: vk::ShaderStageFlags,
    pub code: &'a [u32],
}

/// Native command list being recorded. One list is recorded per job, frame in flight and flag variant.
pub trait CommandList<D: Device> {
    fn begin(&mut self) -> Result<()>;
    fn finish(&mut self) -> Result<()>;

    fn bind_pipeline(&mut self, pipeline: &D::Pipeline) -> Result<()>;
    fn bind_descriptor_set(&mut self, pipeline: &D::Pipeline, set: &D::DescriptorSet) -> Result<()>;
    fn push_constants(&mut self, pipeline: &D::Pipeline, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) -> Result<()>;

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<()>;
    fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) -> Result<()>;
    fn draw_indexed_indirect_count(&mut self, draw_calls: &D::Buffer, count: &D::Buffer, count_offset: u64, max_draws: u32, stride: u32) -> Result<()>;
    fn draw_indirect_count(&mut self, draw_calls: &D::Buffer, count: &D::Buffer, count_offset: u64, max_draws: u32, stride: u32) -> Result<()>;
    fn dispatch(&mut self, dims: [u32; 3]) -> Result<()>;
    fn dispatch_indirect(&mut self, buffer: &D::Buffer) -> Result<()>;
    fn trace_rays(&mut self, pipeline: &D::Pipeline, dims: [u32; 3]) -> Result<()>;

    fn bind_vertex_buffer(&mut self, buffer: &D::Buffer) -> Result<()>;
    fn bind_index_buffer(&mut self, buffer: &D::Buffer) -> Result<()>;

    fn copy_texture_to_buffer(&mut self, src: &D::Texture, dst: &D::Buffer) -> Result<()>;
    fn copy_buffer_to_texture(&mut self, src: &D::Buffer, dst: &D::Texture) -> Result<()>;
    fn copy_buffer(&mut self, src: &D::Buffer, dst: &D::Buffer) -> Result<()>;
    fn copy_texture(&mut self, src: &D::Texture, dst: &D::Texture) -> Result<()>;
    fn copy_texture_region(&mut self, src: &D::Texture, src_offset: vk::Offset2D, dst: &D::Texture, dst_offset: vk::Offset2D, extent: vk::Extent2D) -> Result<()>;
    fn blit_texture(&mut self, src: &D::Texture, dst: &D::Texture) -> Result<()>;
    /// Write `data` at `offset`, padded with zeroes to whole words. Fails if the padded data does not fit.
    fn update_buffer(&mut self, buffer: &D::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    fn texture_barrier(&mut self, texture: &D::Texture, barrier: &TextureBarrierInfo) -> Result<()>;
    fn buffer_barrier(&mut self, buffer: &D::Buffer, barrier: &BufferBarrierInfo) -> Result<()>;

    fn begin_rendering(&mut self, info: &RenderingInfo<'_, D>) -> Result<()>;
    fn end_rendering(&mut self) -> Result<()>;
    fn set_viewport(&mut self, viewport: vk::Viewport) -> Result<()>;

    fn reset_queries(&mut self, pool: &D::QueryPool, first: u32, count: u32) -> Result<()>;
    fn write_timestamp(&mut self, stage: PipelineStage, pool: &D::QueryPool, index: u32) -> Result<()>;
    fn begin_query(&mut self, pool: &D::QueryPool, index: u32) -> Result<()>;
    fn end_query(&mut self, pool: &D::QueryPool, index: u32) -> Result<()>;
}

/// Native capability surface of a GPU. Implementations are cheap to clone and share their internal state.
pub trait Device: Clone + Sized {
    type Buffer: DeviceBuffer;
    type Texture: DeviceTexture;
    type TextureView;
    type Semaphore;
    type Fence;
    type CommandList: CommandList<Self>;
    type DescriptorPool;
    type DescriptorSet;
    type Pipeline;
    type QueryPool;

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<Self::Buffer>;
    fn create_texture(&self, info: &TextureCreateInfo) -> Result<Self::Texture>;
    /// View of a single mip level.
    fn create_texture_view(&self, texture: &Self::Texture, mip: u32) -> Result<Self::TextureView>;

    fn create_semaphore(&self) -> Result<Self::Semaphore>;
    fn create_fence(&self, signaled: bool) -> Result<Self::Fence>;
    fn wait_for_fence(&self, fence: &Self::Fence) -> Result<()>;
    fn reset_fence(&self, fence: &Self::Fence) -> Result<()>;

    /// Create a command list for a queue that supports `work_types`.
    fn create_command_list(&self, work_types: vk::QueueFlags, name: &str) -> Result<Self::CommandList>;
    fn submit(&self, list: &Self::CommandList, wait: &[&Self::Semaphore], signal: &[&Self::Semaphore], fence: Option<&Self::Fence>) -> Result<()>;

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<Self::DescriptorPool>;
    fn allocate_descriptor_set(&self, pool: &Self::DescriptorPool, pipeline: &Self::Pipeline) -> Result<Self::DescriptorSet>;
    fn write_descriptor_set(&self, set: &Self::DescriptorSet, writes: &[DescriptorWrite<'_, Self>]) -> Result<()>;

    fn create_graphics_pipeline(&self, state: &GraphicsPipelineState, shaders: &GraphicsShaders) -> Result<Self::Pipeline>;
    fn create_compute_pipeline(&self, state: &ComputePipelineState, shader: &[u32]) -> Result<Self::Pipeline>;
    fn create_ray_tracing_pipeline(&self, state: &RayTracingPipelineState, shaders: &[RayTracingShader]) -> Result<Self::Pipeline>;

    fn create_query_pool(&self, ty: vk::QueryType, count: u32) -> Result<Self::QueryPool>;
    fn query_results(&self, pool: &Self::QueryPool, first: u32, count: u32) -> Result<Vec<u64>>;

    /// Block until all submitted work has completed.
    fn await_all(&self) -> Result<()>;
}
