//! A [`Device`] that records native calls instead of talking to a GPU.
//!
//! Every command list keeps the exact sequence of calls the graph lowered into it, and every submission is logged
//! with its wait and signal semaphores. Buffer memory is emulated on the CPU: buffer updates and buffer to buffer
//! copies are replayed in submission order, so transfer-only jobs produce observable results. Everything else
//! (draws, dispatches, texture contents) is only recorded.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use ash::vk;

use crate::backend::{
    padded_update_len, BufferBarrierInfo, BufferCreateInfo, CommandList, DescriptorResource, DescriptorWrite, Device, DeviceBuffer, DeviceTexture, GraphicsShaders,
    ImageBinding, MemoryType, RayTracingShader, RenderingInfo, TextureBarrierInfo, TextureCreateInfo,
};
use crate::core::error::Error;
use crate::graph::pipeline_state::{ComputePipelineState, GraphicsPipelineState, RayTracingPipelineState};
use crate::graph::state::PipelineStage;

#[derive(Debug, Default)]
struct RecordingState {
    next_id: u64,
    submissions: Vec<Submission>,
    textures: Vec<TextureRecord>,
    buffers: Vec<BufferRecord>,
    descriptor_pools: Vec<DescriptorPoolRecord>,
    descriptor_writes: Vec<DescriptorWriteRecord>,
    pipelines: Vec<PipelineKind>,
    semaphores: usize,
    await_all_calls: usize,
}

/// Device that records instead of executing. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingDevice {
    inner: Arc<Mutex<RecordingState>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub command_list: u64,
    pub name: String,
    pub wait: Vec<u64>,
    pub signal: Vec<u64>,
    pub fence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureRecord {
    pub id: u64,
    pub name: String,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferRecord {
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub memory: MemoryType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorPoolRecord {
    pub id: u64,
    pub sizes: Vec<(vk::DescriptorType, u32)>,
    pub max_sets: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorWriteRecord {
    pub set: u64,
    pub binding: u32,
    pub ty: vk::DescriptorType,
    /// Ids of the buffers, textures or views written.
    pub resources: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineKind {
    Graphics(Box<GraphicsPipelineState>),
    Compute(Box<ComputePipelineState>),
    RayTracing(Box<RayTracingPipelineState>),
}

#[derive(Debug, Clone)]
pub struct RecordedBuffer {
    id: u64,
    size: u64,
    usage: vk::BufferUsageFlags,
    memory: MemoryType,
    data: Arc<Mutex<Vec<u8>>>,
}

impl RecordedBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Emulated memory contents after all replayed submissions.
    pub fn contents(&self) -> Result<Vec<u8>> {
        Ok(self.data.lock().map_err(|_| Error::PoisonError)?.clone())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let data = self.data.lock().map_err(|_| Error::PoisonError)?;
        let bytes = data
            .get(offset..offset + 4)
            .ok_or(Error::Uncategorized("read past the end of a recorded buffer"))?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl DeviceBuffer for RecordedBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    fn memory_type(&self) -> MemoryType {
        self.memory
    }
}

#[derive(Debug, Clone)]
pub struct RecordedTexture {
    id: u64,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    mip_count: u32,
}

impl RecordedTexture {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl DeviceTexture for RecordedTexture {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.format
    }

    fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    fn mip_count(&self) -> u32 {
        self.mip_count
    }
}

#[derive(Debug, Clone)]
pub struct RecordedTextureView {
    pub id: u64,
    pub texture: u64,
    pub mip: u32,
}

#[derive(Debug)]
pub struct RecordedSemaphore {
    pub id: u64,
}

#[derive(Debug)]
pub struct RecordedFence {
    pub id: u64,
    signaled: AtomicBool,
}

impl RecordedFence {
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct RecordedDescriptorPool {
    pub id: u64,
    max_sets: u32,
    allocated: AtomicU32,
}

#[derive(Debug)]
pub struct RecordedDescriptorSet {
    pub id: u64,
    pub pipeline: u64,
}

#[derive(Debug)]
pub struct RecordedPipeline {
    pub id: u64,
    pub kind: PipelineKind,
}

#[derive(Debug)]
pub struct RecordedQueryPool {
    pub id: u64,
    pub ty: vk::QueryType,
    pub count: u32,
}

/// One native call, with resources identified by the id they were created with.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    BindPipeline(u64),
    BindDescriptorSet { pipeline: u64, set: u64 },
    PushConstants { pipeline: u64, stages: vk::ShaderStageFlags, offset: u32, data: Vec<u8> },
    Draw { vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32 },
    DrawIndexed { index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32 },
    DrawIndexedIndirectCount { draw_calls: u64, count: u64, count_offset: u64, max_draws: u32, stride: u32 },
    DrawIndirectCount { draw_calls: u64, count: u64, count_offset: u64, max_draws: u32, stride: u32 },
    Dispatch([u32; 3]),
    DispatchIndirect(u64),
    TraceRays { pipeline: u64, dims: [u32; 3] },
    BindVertexBuffer(u64),
    BindIndexBuffer(u64),
    CopyTextureToBuffer { src: u64, dst: u64 },
    CopyBufferToTexture { src: u64, dst: u64 },
    CopyBuffer { src: u64, dst: u64 },
    CopyTexture { src: u64, dst: u64 },
    CopyTextureRegion { src: u64, src_offset: vk::Offset2D, dst: u64, dst_offset: vk::Offset2D, extent: vk::Extent2D },
    BlitTexture { src: u64, dst: u64 },
    UpdateBuffer { buffer: u64, offset: u64, data: Vec<u8> },
    TextureBarrier { texture: u64, info: TextureBarrierInfo },
    BufferBarrier { buffer: u64, info: BufferBarrierInfo },
    BeginRendering { name: String, colors: Vec<(u64, vk::AttachmentLoadOp, vk::AttachmentStoreOp)>, depth: Option<u64>, extent: vk::Extent2D },
    EndRendering,
    SetViewport { x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32 },
    ResetQueries { pool: u64, first: u32, count: u32 },
    WriteTimestamp { stage: PipelineStage, pool: u64, index: u32 },
    BeginQuery { pool: u64, index: u32 },
    EndQuery { pool: u64, index: u32 },
}

#[derive(Debug)]
enum Replay {
    Update { dst: Arc<Mutex<Vec<u8>>>, offset: u64, data: Vec<u8> },
    Copy { src: Arc<Mutex<Vec<u8>>>, dst: Arc<Mutex<Vec<u8>>> },
}

impl Replay {
    fn apply(&self) -> Result<()> {
        match self {
            Replay::Update {
                dst,
                offset,
                data,
            } => {
                let mut dst = dst.lock().map_err(|_| Error::PoisonError)?;
                let start = *offset as usize;
                let end = (start + data.len()).min(dst.len());
                if start < end {
                    dst[start..end].copy_from_slice(&data[..end - start]);
                }
            }
            Replay::Copy {
                src,
                dst,
            } => {
                if Arc::ptr_eq(src, dst) {
                    return Ok(());
                }
                let src = src.lock().map_err(|_| Error::PoisonError)?.clone();
                let mut dst = dst.lock().map_err(|_| Error::PoisonError)?;
                let len = src.len().min(dst.len());
                dst[..len].copy_from_slice(&src[..len]);
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RecordedCommandList {
    id: u64,
    name: String,
    work_types: vk::QueueFlags,
    calls: Vec<NativeCall>,
    replay: Vec<Replay>,
    recording: bool,
    finished: bool,
}

impl RecordedCommandList {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn work_types(&self) -> vk::QueueFlags {
        self.work_types
    }

    pub fn calls(&self) -> &[NativeCall] {
        &self.calls
    }

    fn record(&mut self, call: NativeCall) -> Result<()> {
        if !self.recording {
            return Err(Error::Uncategorized("command recorded outside of begin/finish").into());
        }
        self.calls.push(call);
        Ok(())
    }
}

fn image_id(image: &ImageBinding<'_, RecordingDevice>) -> u64 {
    match image {
        ImageBinding::Whole(texture) => texture.id,
        ImageBinding::Mip(view) => view.id,
    }
}

impl CommandList<RecordingDevice> for RecordedCommandList {
    fn begin(&mut self) -> Result<()> {
        self.recording = true;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.recording = false;
        self.finished = true;
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: &RecordedPipeline) -> Result<()> {
        self.record(NativeCall::BindPipeline(pipeline.id))
    }

    fn bind_descriptor_set(&mut self, pipeline: &RecordedPipeline, set: &RecordedDescriptorSet) -> Result<()> {
        self.record(NativeCall::BindDescriptorSet {
            pipeline: pipeline.id,
            set: set.id,
        })
    }

    fn push_constants(&mut self, pipeline: &RecordedPipeline, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) -> Result<()> {
        self.record(NativeCall::PushConstants {
            pipeline: pipeline.id,
            stages,
            offset,
            data: data.to_vec(),
        })
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<()> {
        self.record(NativeCall::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) -> Result<()> {
        self.record(NativeCall::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    fn draw_indexed_indirect_count(&mut self, draw_calls: &RecordedBuffer, count: &RecordedBuffer, count_offset: u64, max_draws: u32, stride: u32) -> Result<()> {
        self.record(NativeCall::DrawIndexedIndirectCount {
            draw_calls: draw_calls.id,
            count: count.id,
            count_offset,
            max_draws,
            stride,
        })
    }

    fn draw_indirect_count(&mut self, draw_calls: &RecordedBuffer, count: &RecordedBuffer, count_offset: u64, max_draws: u32, stride: u32) -> Result<()> {
        self.record(NativeCall::DrawIndirectCount {
            draw_calls: draw_calls.id,
            count: count.id,
            count_offset,
            max_draws,
            stride,
        })
    }

    fn dispatch(&mut self, dims: [u32; 3]) -> Result<()> {
        self.record(NativeCall::Dispatch(dims))
    }

    fn dispatch_indirect(&mut self, buffer: &RecordedBuffer) -> Result<()> {
        self.record(NativeCall::DispatchIndirect(buffer.id))
    }

    fn trace_rays(&mut self, pipeline: &RecordedPipeline, dims: [u32; 3]) -> Result<()> {
        self.record(NativeCall::TraceRays {
            pipeline: pipeline.id,
            dims,
        })
    }

    fn bind_vertex_buffer(&mut self, buffer: &RecordedBuffer) -> Result<()> {
        self.record(NativeCall::BindVertexBuffer(buffer.id))
    }

    fn bind_index_buffer(&mut self, buffer: &RecordedBuffer) -> Result<()> {
        self.record(NativeCall::BindIndexBuffer(buffer.id))
    }

    fn copy_texture_to_buffer(&mut self, src: &RecordedTexture, dst: &RecordedBuffer) -> Result<()> {
        self.record(NativeCall::CopyTextureToBuffer {
            src: src.id,
            dst: dst.id,
        })
    }

    fn copy_buffer_to_texture(&mut self, src: &RecordedBuffer, dst: &RecordedTexture) -> Result<()> {
        self.record(NativeCall::CopyBufferToTexture {
            src: src.id,
            dst: dst.id,
        })
    }

    fn copy_buffer(&mut self, src: &RecordedBuffer, dst: &RecordedBuffer) -> Result<()> {
        self.record(NativeCall::CopyBuffer {
            src: src.id,
            dst: dst.id,
        })?;
        self.replay.push(Replay::Copy {
            src: src.data.clone(),
            dst: dst.data.clone(),
        });
        Ok(())
    }

    fn copy_texture(&mut self, src: &RecordedTexture, dst: &RecordedTexture) -> Result<()> {
        self.record(NativeCall::CopyTexture {
            src: src.id,
            dst: dst.id,
        })
    }

    fn copy_texture_region(&mut self, src: &RecordedTexture, src_offset: vk::Offset2D, dst: &RecordedTexture, dst_offset: vk::Offset2D, extent: vk::Extent2D) -> Result<()> {
        self.record(NativeCall::CopyTextureRegion {
            src: src.id,
            src_offset,
            dst: dst.id,
            dst_offset,
            extent,
        })
    }

    fn blit_texture(&mut self, src: &RecordedTexture, dst: &RecordedTexture) -> Result<()> {
        self.record(NativeCall::BlitTexture {
            src: src.id,
            dst: dst.id,
        })
    }

    fn update_buffer(&mut self, buffer: &RecordedBuffer, offset: u64, data: &[u8]) -> Result<()> {
        padded_update_len(buffer.size, offset, data.len())?;
        self.record(NativeCall::UpdateBuffer {
            buffer: buffer.id,
            offset,
            data: data.to_vec(),
        })?;
        self.replay.push(Replay::Update {
            dst: buffer.data.clone(),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn texture_barrier(&mut self, texture: &RecordedTexture, barrier: &TextureBarrierInfo) -> Result<()> {
        self.record(NativeCall::TextureBarrier {
            texture: texture.id,
            info: *barrier,
        })
    }

    fn buffer_barrier(&mut self, buffer: &RecordedBuffer, barrier: &BufferBarrierInfo) -> Result<()> {
        self.record(NativeCall::BufferBarrier {
            buffer: buffer.id,
            info: *barrier,
        })
    }

    fn begin_rendering(&mut self, info: &RenderingInfo<'_, RecordingDevice>) -> Result<()> {
        self.record(NativeCall::BeginRendering {
            name: info.name.to_owned(),
            colors: info
                .color_attachments
                .iter()
                .map(|attachment| (attachment.texture.id, attachment.load_op, attachment.store_op))
                .collect(),
            depth: info.depth_attachment.as_ref().map(|attachment| attachment.texture.id),
            extent: info.extent,
        })
    }

    fn end_rendering(&mut self) -> Result<()> {
        self.record(NativeCall::EndRendering)
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) -> Result<()> {
        self.record(NativeCall::SetViewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        })
    }

    fn reset_queries(&mut self, pool: &RecordedQueryPool, first: u32, count: u32) -> Result<()> {
        self.record(NativeCall::ResetQueries {
            pool: pool.id,
            first,
            count,
        })
    }

    fn write_timestamp(&mut self, stage: PipelineStage, pool: &RecordedQueryPool, index: u32) -> Result<()> {
        self.record(NativeCall::WriteTimestamp {
            stage,
            pool: pool.id,
            index,
        })
    }

    fn begin_query(&mut self, pool: &RecordedQueryPool, index: u32) -> Result<()> {
        self.record(NativeCall::BeginQuery {
            pool: pool.id,
            index,
        })
    }

    fn end_query(&mut self, pool: &RecordedQueryPool, index: u32) -> Result<()> {
        self.record(NativeCall::EndQuery {
            pool: pool.id,
            index,
        })
    }
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<RecordingState>> {
        Ok(self.inner.lock().map_err(|_| Error::PoisonError)?)
    }

    fn next_id(&self) -> Result<u64> {
        let mut state = self.state()?;
        state.next_id += 1;
        Ok(state.next_id)
    }

    /// All submissions so far, in submission order.
    pub fn submissions(&self) -> Result<Vec<Submission>> {
        Ok(self.state()?.submissions.clone())
    }

    pub fn clear_submissions(&self) -> Result<()> {
        self.state()?.submissions.clear();
        Ok(())
    }

    pub fn textures(&self) -> Result<Vec<TextureRecord>> {
        Ok(self.state()?.textures.clone())
    }

    pub fn buffers(&self) -> Result<Vec<BufferRecord>> {
        Ok(self.state()?.buffers.clone())
    }

    pub fn descriptor_pools(&self) -> Result<Vec<DescriptorPoolRecord>> {
        Ok(self.state()?.descriptor_pools.clone())
    }

    pub fn descriptor_writes(&self) -> Result<Vec<DescriptorWriteRecord>> {
        Ok(self.state()?.descriptor_writes.clone())
    }

    /// Every pipeline object created, in creation order.
    pub fn pipelines(&self) -> Result<Vec<PipelineKind>> {
        Ok(self.state()?.pipelines.clone())
    }

    pub fn semaphore_count(&self) -> Result<usize> {
        Ok(self.state()?.semaphores)
    }

    pub fn await_all_calls(&self) -> Result<usize> {
        Ok(self.state()?.await_all_calls)
    }

    fn create_pipeline(&self, kind: PipelineKind) -> Result<RecordedPipeline> {
        let id = self.next_id()?;
        self.state()?.pipelines.push(kind.clone());
        #[cfg(feature = "log-objects")]
        trace!("Created new recorded pipeline {id}");
        Ok(RecordedPipeline {
            id,
            kind,
        })
    }
}

impl Device for RecordingDevice {
    type Buffer = RecordedBuffer;
    type Texture = RecordedTexture;
    type TextureView = RecordedTextureView;
    type Semaphore = RecordedSemaphore;
    type Fence = RecordedFence;
    type CommandList = RecordedCommandList;
    type DescriptorPool = RecordedDescriptorPool;
    type DescriptorSet = RecordedDescriptorSet;
    type Pipeline = RecordedPipeline;
    type QueryPool = RecordedQueryPool;

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<RecordedBuffer> {
        let id = self.next_id()?;
        self.state()?.buffers.push(BufferRecord {
            id,
            name: info.name.to_owned(),
            size: info.size,
            memory: info.memory,
        });
        #[cfg(feature = "log-objects")]
        trace!("Created new recorded buffer {id} `{}` ({} bytes)", info.name, info.size);
        Ok(RecordedBuffer {
            id,
            size: info.size,
            usage: info.usage,
            memory: info.memory,
            data: Arc::new(Mutex::new(vec![0; info.size as usize])),
        })
    }

    fn create_texture(&self, info: &TextureCreateInfo) -> Result<RecordedTexture> {
        let id = self.next_id()?;
        self.state()?.textures.push(TextureRecord {
            id,
            name: info.name.to_owned(),
            extent: info.extent,
            format: info.format,
            mip_count: info.mip_count,
        });
        #[cfg(feature = "log-objects")]
        trace!("Created new recorded texture {id} `{}`", info.name);
        Ok(RecordedTexture {
            id,
            extent: info.extent,
            format: info.format,
            usage: info.usage,
            mip_count: info.mip_count,
        })
    }

    fn create_texture_view(&self, texture: &RecordedTexture, mip: u32) -> Result<RecordedTextureView> {
        if mip >= texture.mip_count {
            return Err(Error::Uncategorized("texture view mip out of range").into());
        }
        Ok(RecordedTextureView {
            id: self.next_id()?,
            texture: texture.id,
            mip,
        })
    }

    fn create_semaphore(&self) -> Result<RecordedSemaphore> {
        let id = self.next_id()?;
        self.state()?.semaphores += 1;
        Ok(RecordedSemaphore {
            id,
        })
    }

    fn create_fence(&self, signaled: bool) -> Result<RecordedFence> {
        Ok(RecordedFence {
            id: self.next_id()?,
            signaled: AtomicBool::new(signaled),
        })
    }

    fn wait_for_fence(&self, fence: &RecordedFence) -> Result<()> {
        // Submissions complete immediately, so an unsignaled fence was never submitted and would block forever.
        if fence.is_signaled() {
            Ok(())
        } else {
            Err(Error::Uncategorized("waiting on a fence that was never submitted").into())
        }
    }

    fn reset_fence(&self, fence: &RecordedFence) -> Result<()> {
        fence.signaled.store(false, Ordering::Release);
        Ok(())
    }

    fn create_command_list(&self, work_types: vk::QueueFlags, name: &str) -> Result<RecordedCommandList> {
        Ok(RecordedCommandList {
            id: self.next_id()?,
            name: name.to_owned(),
            work_types,
            calls: vec![],
            replay: vec![],
            recording: false,
            finished: false,
        })
    }

    fn submit(&self, list: &RecordedCommandList, wait: &[&RecordedSemaphore], signal: &[&RecordedSemaphore], fence: Option<&RecordedFence>) -> Result<()> {
        if !list.finished {
            return Err(Error::Uncategorized("submitted a command list that was never finished").into());
        }
        for op in &list.replay {
            op.apply()?;
        }
        self.state()?.submissions.push(Submission {
            command_list: list.id,
            name: list.name.clone(),
            wait: wait.iter().map(|semaphore| semaphore.id).collect(),
            signal: signal.iter().map(|semaphore| semaphore.id).collect(),
            fence: fence.map(|fence| fence.id),
        });
        if let Some(fence) = fence {
            fence.signaled.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<RecordedDescriptorPool> {
        let id = self.next_id()?;
        self.state()?.descriptor_pools.push(DescriptorPoolRecord {
            id,
            sizes: sizes.iter().map(|size| (size.ty, size.descriptor_count)).collect(),
            max_sets,
        });
        Ok(RecordedDescriptorPool {
            id,
            max_sets,
            allocated: AtomicU32::new(0),
        })
    }

    fn allocate_descriptor_set(&self, pool: &RecordedDescriptorPool, pipeline: &RecordedPipeline) -> Result<RecordedDescriptorSet> {
        let allocated = pool.allocated.fetch_add(1, Ordering::AcqRel);
        if allocated >= pool.max_sets {
            return Err(Error::VkError(vk::Result::ERROR_OUT_OF_POOL_MEMORY).into());
        }
        Ok(RecordedDescriptorSet {
            id: self.next_id()?,
            pipeline: pipeline.id,
        })
    }

    fn write_descriptor_set(&self, set: &RecordedDescriptorSet, writes: &[DescriptorWrite<'_, Self>]) -> Result<()> {
        let mut state = self.state()?;
        for write in writes {
            let (ty, resources) = match &write.resource {
                DescriptorResource::StorageImage(image) => (vk::DescriptorType::STORAGE_IMAGE, vec![image_id(image)]),
                DescriptorResource::CombinedImageSampler(image, _) => (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vec![image_id(image)]),
                DescriptorResource::SampledImage(image) => (vk::DescriptorType::SAMPLED_IMAGE, vec![image_id(image)]),
                DescriptorResource::SampledImageArray(images) => (
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    images.iter().map(|(image, _)| image_id(image)).collect(),
                ),
                DescriptorResource::UniformBuffer {
                    buffer, ..
                } => (vk::DescriptorType::UNIFORM_BUFFER, vec![buffer.id]),
                DescriptorResource::UniformBufferArray(buffers) => (vk::DescriptorType::UNIFORM_BUFFER, buffers.iter().map(|buffer| buffer.id).collect()),
                DescriptorResource::StorageBuffer(buffer) => (vk::DescriptorType::STORAGE_BUFFER, vec![buffer.id]),
                DescriptorResource::AccelerationStructure(_) => (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, vec![]),
            };
            state.descriptor_writes.push(DescriptorWriteRecord {
                set: set.id,
                binding: write.binding,
                ty,
                resources,
            });
        }
        Ok(())
    }

    fn create_graphics_pipeline(&self, state: &GraphicsPipelineState, _shaders: &GraphicsShaders) -> Result<RecordedPipeline> {
        self.create_pipeline(PipelineKind::Graphics(Box::new(state.clone())))
    }

    fn create_compute_pipeline(&self, state: &ComputePipelineState, _shader: &[u32]) -> Result<RecordedPipeline> {
        self.create_pipeline(PipelineKind::Compute(Box::new(state.clone())))
    }

    fn create_ray_tracing_pipeline(&self, state: &RayTracingPipelineState, _shaders: &[RayTracingShader]) -> Result<RecordedPipeline> {
        self.create_pipeline(PipelineKind::RayTracing(Box::new(state.clone())))
    }

    fn create_query_pool(&self, ty: vk::QueryType, count: u32) -> Result<RecordedQueryPool> {
        Ok(RecordedQueryPool {
            id: self.next_id()?,
            ty,
            count,
        })
    }

    fn query_results(&self, pool: &RecordedQueryPool, first: u32, count: u32) -> Result<Vec<u64>> {
        if first + count > pool.count {
            return Err(Error::Uncategorized("query range out of bounds").into());
        }
        Ok(vec![0; count as usize])
    }

    fn await_all(&self) -> Result<()> {
        self.state()?.await_all_calls += 1;
        Ok(())
    }
}
