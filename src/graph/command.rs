//! The abstract command stream a [`BuildContext`](crate::BuildContext) records. Commands reference resources
//! through [`TextureRef`]/[`BufferRef`] and are lowered to native calls per frame and flag variant.

use ash::vk;

use crate::core::name::Name;
use crate::graph::pipeline_state::{ComputePipelineState, GraphicsPipelineState, RayTracingPipelineState};
use crate::graph::refs::{BufferRef, TextureRef};
use crate::graph::state::{BufferAccess, PipelineStage, TextureState};

#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    /// Storage image.
    RwTexture(TextureRef),
    /// Combined image sampler using the texture's sampler properties.
    SamplableTexture(TextureRef),
    /// Sampled image without a sampler.
    Texture(TextureRef),
    SampledTextureArray(Vec<TextureRef>),
    UniformBuffer(BufferRef),
    UniformBufferRange { buffer: BufferRef, offset: u64, size: u64 },
    UniformBufferArray(Vec<BufferRef>),
    StorageBuffer(BufferRef),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorBinding {
    pub descriptor: Descriptor,
    /// Pipeline stages that access the descriptor.
    pub stages: PipelineStage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureBarrier {
    pub texture: TextureRef,
    pub src_stages: PipelineStage,
    pub dst_stages: PipelineStage,
    pub src_state: TextureState,
    pub dst_state: TextureState,
    pub base_mip: u32,
    pub mip_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferBarrier {
    pub buffer: BufferRef,
    pub src_stages: PipelineStage,
    pub dst_stages: PipelineStage,
    pub src_access: BufferAccess,
    pub dst_access: BufferAccess,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindGraphicsPipeline(Box<GraphicsPipelineState>),
    BindComputePipeline(Box<ComputePipelineState>),
    BindRayTracingPipeline(Box<RayTracingPipelineState>),
    DrawPrimitives {
        vertex_count: u32,
        vertex_offset: u32,
        instance_count: u32,
        instance_offset: u32,
    },
    DrawIndexedPrimitives {
        index_count: u32,
        index_offset: u32,
        vertex_offset: i32,
        instance_count: u32,
        instance_offset: u32,
    },
    DrawIndexedIndirectWithCount {
        draw_call_buffer: BufferRef,
        count_buffer: BufferRef,
        max_draw_calls: u32,
        stride: u32,
        count_buffer_offset: u64,
    },
    DrawIndirectWithCount {
        draw_call_buffer: BufferRef,
        count_buffer: BufferRef,
        max_draw_calls: u32,
        stride: u32,
        count_buffer_offset: u64,
    },
    Dispatch {
        dims: [u32; 3],
    },
    DispatchIndirect {
        indirect_buffer: BufferRef,
    },
    /// Sparse by binding index. Every slot up to the highest bound one is set when recorded.
    BindDescriptors(Vec<Option<DescriptorBinding>>),
    BindVertexBuffer(BufferRef),
    BindIndexBuffer(BufferRef),
    CopyTextureToBuffer {
        src: TextureRef,
        dst: BufferRef,
    },
    CopyBufferToTexture {
        src: BufferRef,
        dst: TextureRef,
    },
    CopyBuffer {
        src: BufferRef,
        dst: BufferRef,
    },
    CopyTexture {
        src: TextureRef,
        dst: TextureRef,
    },
    CopyTextureRegion {
        src: TextureRef,
        src_offset: vk::Offset2D,
        dst: TextureRef,
        dst_offset: vk::Offset2D,
        extent: vk::Extent2D,
    },
    BlitTexture {
        src: TextureRef,
        dst: TextureRef,
    },
    PlaceTextureBarrier(TextureBarrier),
    PlaceBufferBarrier(BufferBarrier),
    FillBuffer {
        buffer: Name,
        data: Vec<u8>,
    },
    BeginRenderPass {
        pass_name: Name,
        render_targets: Vec<Name>,
    },
    EndRenderPass,
    IfEnabledCond(Name),
    IfDisabledCond(Name),
    EndIfCond,
    ExportTexture {
        texture: Name,
        stage: PipelineStage,
        state: TextureState,
    },
    ExportBuffer {
        buffer: Name,
        stage: PipelineStage,
        access: BufferAccess,
    },
    PushConstant {
        stages: vk::ShaderStageFlags,
        data: Vec<u8>,
    },
    TraceRays {
        dims: [u32; 3],
    },
    ResetQueries {
        offset: u32,
        count: u32,
        timestamps: bool,
    },
    QueryTimestamp {
        index: u32,
        is_closing: bool,
    },
    BeginQuery(u32),
    EndQuery(u32),
    /// `dims` is x, y, width, height in pixels.
    SetViewport {
        dims: [f32; 4],
        min_depth: f32,
        max_depth: f32,
    },
}

impl Command {
    /// Conditional markers only shape which commands a flag variant keeps and never reach the native list.
    pub fn is_condition_marker(&self) -> bool {
        matches!(self, Command::IfEnabledCond(_) | Command::IfDisabledCond(_) | Command::EndIfCond)
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self, Command::PlaceTextureBarrier(_) | Command::PlaceBufferBarrier(_))
    }
}
