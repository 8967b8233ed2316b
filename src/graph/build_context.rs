//! The recording side of a job.
//!
//! A [`BuildContext`] is handed out by [`JobGraph::add_job`](crate::JobGraph::add_job). It collects resource
//! declarations and an abstract command stream, and keeps the pipeline state that is pending until the next
//! draw, dispatch or ray trace. Nothing is submitted while recording. Once all jobs are recorded,
//! [`JobGraph::build_jobs`](crate::JobGraph::build_jobs) compiles every context into a [`Job`] holding one
//! native command list per frame in flight and flag variant.
//!
//! # Example
//! ```
//! # use anyhow::Result;
//! # use ash::vk;
//! # use deimos::prelude::*;
//! # fn record(ctx: &mut BuildContext<RecordingDevice>) -> Result<()> {
//! ctx.declare_render_target("color", vk::Format::R8G8B8A8_UNORM)?;
//! ctx.declare_flag("wireframe")?;
//!
//! ctx.begin_render_pass("main", ["color"])?;
//! ctx.bind_vertex_shader("triangle.vert");
//! ctx.bind_fragment_shader("triangle.frag");
//! ctx.draw_primitives(3, 0, 1, 0)?;
//!
//! // Pipeline state setters record nothing by themselves, only the draw is conditional.
//! ctx.if_enabled("wireframe")?;
//! ctx.bind_vertex_shader("triangle.vert");
//! ctx.bind_fragment_shader("wireframe.frag");
//! ctx.set_vertex_topology(vk::PrimitiveTopology::LINE_STRIP);
//! ctx.set_line_width(2.0);
//! ctx.draw_primitives(3, 0, 1, 0)?;
//! ctx.end_if()?;
//! ctx.end_render_pass();
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use anyhow::Result;
use ash::vk;

use crate::backend::{BufferCreateInfo, CommandList, Device, MemoryType, TextureCreateInfo};
use crate::core::error::Error;
use crate::core::name::Name;
use crate::graph::command::{Command, Descriptor, DescriptorBinding};
use crate::graph::declaration::{BufferDeclaration, ClearValue, Declaration, RenderTarget, SamplerProperties, TextureDeclaration};
use crate::graph::job::{Job, JobFrame};
use crate::graph::pass::barrier_insertion::{buffer_declaration, texture_declaration};
use crate::graph::pass::{run_pass, ApplyFlagConditionsPass, BarrierInsertionPass, GenerateCommandListPass};
use crate::graph::pipeline_cache::PipelineCache;
use crate::graph::pipeline_state::{
    ComputePipelineState, DepthTestMode, DescriptorInfo, GraphicsPipelineState, PushConstantDesc, RayTracingPipelineState, RayTracingShaderGroup,
    VertexLayout,
};
use crate::graph::refs::{BufferRef, TextureRef};
use crate::graph::resource_storage::ResourceStorage;
use crate::graph::state::{is_compute_stage, is_graphics_stage, is_ray_tracing_stage, shader_stages, BufferAccess, MemoryAccess, PipelineStage, TextureState};
use crate::{FRAMES_IN_FLIGHT_COUNT, FULL_SCREEN_QUAD_SHADER, MAX_DESCRIPTOR_COUNT, MAX_FLAG_COUNT};

/// Number of descriptors of each type bound over the whole recording, used to size the job's descriptor pool.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
struct DescriptorCounts {
    storage_image: u32,
    uniform_buffer: u32,
    combined_image_sampler: u32,
    sampled_image: u32,
    storage_buffer: u32,
    acceleration_structure: u32,
    total_sets: u32,
}

impl DescriptorCounts {
    fn add(&mut self, ty: vk::DescriptorType, count: u32) {
        match ty {
            vk::DescriptorType::STORAGE_IMAGE => self.storage_image += count,
            vk::DescriptorType::UNIFORM_BUFFER => self.uniform_buffer += count,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => self.combined_image_sampler += count,
            vk::DescriptorType::SAMPLED_IMAGE => self.sampled_image += count,
            vk::DescriptorType::STORAGE_BUFFER => self.storage_buffer += count,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => self.acceleration_structure += count,
            _ => {}
        }
    }

    fn pool_sizes(&self, multiplier: u32) -> Vec<vk::DescriptorPoolSize> {
        [
            (vk::DescriptorType::STORAGE_IMAGE, self.storage_image),
            (vk::DescriptorType::UNIFORM_BUFFER, self.uniform_buffer),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, self.combined_image_sampler),
            (vk::DescriptorType::SAMPLED_IMAGE, self.sampled_image),
            (vk::DescriptorType::STORAGE_BUFFER, self.storage_buffer),
            (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, self.acceleration_structure),
        ]
        .into_iter()
        .filter(|(_, count)| *count != 0)
        .map(|(ty, count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count: count * multiplier,
        })
        .collect()
    }
}

/// Recorder for a single job. See the [module documentation](self) for an overview.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BuildContext<D: Device> {
    #[derivative(Debug = "ignore")]
    device: D,
    name: Name,
    screen_size: vk::Extent2D,
    declarations: BTreeMap<Name, Declaration>,
    render_targets: BTreeMap<Name, RenderTarget>,
    commands: Vec<Command>,
    work_types: vk::QueueFlags,
    graphics_state: GraphicsPipelineState,
    compute_state: ComputePipelineState,
    rt_state: RayTracingPipelineState,
    descriptor_counts: DescriptorCounts,
    active_stages: PipelineStage,
    flags: Vec<Name>,
    condition_depth: u32,
    /// Push constants recorded since the last draw, emitted right after the next pipeline bind.
    pending_push_constants: Vec<Command>,
    descriptors: Vec<Option<DescriptorBinding>>,
    uses_timestamps: bool,
    uses_pipeline_stats: bool,
}

impl<D: Device> BuildContext<D> {
    pub fn new(device: D, name: impl Into<Name>, screen_size: vk::Extent2D) -> Self {
        Self {
            device,
            name: name.into(),
            screen_size,
            declarations: BTreeMap::new(),
            render_targets: BTreeMap::new(),
            commands: vec![],
            work_types: vk::QueueFlags::empty(),
            graphics_state: GraphicsPipelineState::default(),
            compute_state: ComputePipelineState::default(),
            rt_state: RayTracingPipelineState::default(),
            descriptor_counts: DescriptorCounts::default(),
            active_stages: PipelineStage::empty(),
            flags: vec![],
            condition_depth: 0,
            pending_push_constants: vec![],
            descriptors: vec![],
            uses_timestamps: false,
            uses_pipeline_stats: false,
        }
    }

    /// Name of the job this context records.
    pub fn name(&self) -> &Name {
        &self.name
    }

    fn declare(&mut self, declaration: Declaration) -> Result<()> {
        let name = declaration.name().clone();
        if self.declarations.contains_key(&name) {
            return Err(Error::DuplicateDeclaration(name).into());
        }
        self.declarations.insert(name, declaration);
        Ok(())
    }

    fn declare_texture_inner(
        &mut self,
        name: Name,
        dims: Option<vk::Extent2D>,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        create_mips: bool,
        scale: Option<f32>,
    ) -> Result<()> {
        self.declare(Declaration::Texture(TextureDeclaration::new(name, dims, format, usage, create_mips, scale)))
    }

    /// Declare a texture with fixed dimensions.
    pub fn declare_texture(&mut self, name: impl Into<Name>, dims: vk::Extent2D, format: vk::Format) -> Result<()> {
        self.declare_texture_inner(name.into(), Some(dims), format, vk::ImageUsageFlags::empty(), false, None)
    }

    /// Declare a texture that always has the size of the screen.
    pub fn declare_screen_size_texture(&mut self, name: impl Into<Name>, format: vk::Format) -> Result<()> {
        self.declare_texture_inner(name.into(), None, format, vk::ImageUsageFlags::empty(), false, None)
    }

    /// Declare a texture sized as a fraction of the screen. When `create_mips` is set, the texture gets a full
    /// mip chain and a view per mip, so single mips can be bound through [`TextureRef::mip`].
    pub fn declare_proportional_texture(&mut self, name: impl Into<Name>, format: vk::Format, scale: f32, create_mips: bool) -> Result<()> {
        self.declare_texture_inner(name.into(), None, format, vk::ImageUsageFlags::empty(), create_mips, Some(scale))
    }

    fn declare_color_target(&mut self, name: Name, dims: Option<vk::Extent2D>, format: vk::Format) -> Result<()> {
        self.declare_texture_inner(name.clone(), dims, format, vk::ImageUsageFlags::COLOR_ATTACHMENT, false, None)?;
        self.render_targets.insert(name, RenderTarget::color());
        Ok(())
    }

    fn declare_depth_target_inner(&mut self, name: Name, dims: Option<vk::Extent2D>, format: vk::Format, scale: Option<f32>) -> Result<()> {
        self.declare_texture_inner(name.clone(), dims, format, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT, false, scale)?;
        self.render_targets.insert(name, RenderTarget::depth());
        Ok(())
    }

    /// Declare a screen sized color attachment. It is cleared to black when a render pass begins and stored at the end.
    pub fn declare_render_target(&mut self, name: impl Into<Name>, format: vk::Format) -> Result<()> {
        self.declare_color_target(name.into(), None, format)
    }

    pub fn declare_sized_render_target(&mut self, name: impl Into<Name>, dims: vk::Extent2D, format: vk::Format) -> Result<()> {
        self.declare_color_target(name.into(), Some(dims), format)
    }

    /// Declare a screen sized depth attachment, cleared to 1.0 when a render pass begins.
    pub fn declare_depth_target(&mut self, name: impl Into<Name>, format: vk::Format) -> Result<()> {
        self.declare_depth_target_inner(name.into(), None, format, None)
    }

    pub fn declare_sized_depth_target(&mut self, name: impl Into<Name>, dims: vk::Extent2D, format: vk::Format) -> Result<()> {
        self.declare_depth_target_inner(name.into(), Some(dims), format, None)
    }

    pub fn declare_proportional_depth_target(&mut self, name: impl Into<Name>, format: vk::Format, scale: f32) -> Result<()> {
        self.declare_depth_target_inner(name.into(), None, format, Some(scale))
    }

    /// Declare a GPU only buffer of `size` bytes.
    pub fn declare_buffer(&mut self, name: impl Into<Name>, size: u64) -> Result<()> {
        let name = name.into();
        self.declare(Declaration::Buffer(BufferDeclaration::new(name, size, vk::BufferUsageFlags::empty(), MemoryType::GpuOnly, None)))
    }

    /// Declare a host visible buffer, typically used as source of uploads.
    pub fn declare_staging_buffer(&mut self, name: impl Into<Name>, size: u64) -> Result<()> {
        let name = name.into();
        self.declare(Declaration::Buffer(BufferDeclaration::new(
            name,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryType::CpuToGpu,
            None,
        )))
    }

    /// Declare a buffer holding `stride` bytes for every pixel of a screen scaled by `scale`.
    pub fn declare_proportional_buffer(&mut self, name: impl Into<Name>, scale: f32, stride: u64) -> Result<()> {
        let name = name.into();
        self.declare(Declaration::Buffer(BufferDeclaration::new(
            name,
            stride,
            vk::BufferUsageFlags::empty(),
            MemoryType::GpuOnly,
            Some(scale),
        )))
    }

    pub fn bind_vertex_shader(&mut self, shader: impl Into<Name>) {
        self.work_types |= vk::QueueFlags::GRAPHICS;
        self.graphics_state.vertex_shader = Some(shader.into());
        self.active_stages = vk::PipelineStageFlags2::VERTEX_SHADER;
    }

    pub fn bind_fragment_shader(&mut self, shader: impl Into<Name>) {
        self.work_types |= vk::QueueFlags::GRAPHICS;
        self.graphics_state.fragment_shader = Some(shader.into());
        self.active_stages = vk::PipelineStageFlags2::FRAGMENT_SHADER;
    }

    pub fn bind_compute_shader(&mut self, shader: impl Into<Name>) {
        self.work_types |= vk::QueueFlags::COMPUTE;
        self.compute_state.compute_shader = Some(shader.into());
        self.active_stages = vk::PipelineStageFlags2::COMPUTE_SHADER;
    }

    pub fn bind_rt_generation_shader(&mut self, shader: impl Into<Name>) {
        self.work_types |= vk::QueueFlags::GRAPHICS;
        self.rt_state.ray_gen_shader = Some(shader.into());
        self.active_stages = vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;
    }

    pub fn bind_rt_closest_hit_shader(&mut self, shader: impl Into<Name>) {
        self.work_types |= vk::QueueFlags::GRAPHICS;
        self.rt_state.closest_hit_shaders.push(shader.into());
        self.active_stages = vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;
    }

    pub fn bind_rt_miss_shader(&mut self, shader: impl Into<Name>) {
        self.work_types |= vk::QueueFlags::GRAPHICS;
        self.rt_state.miss_shaders.push(shader.into());
        self.active_stages = vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;
    }

    pub fn bind_rt_shader_group(&mut self, group: RayTracingShaderGroup) {
        self.rt_state.shader_groups.push(group);
    }

    pub fn set_rt_max_recursion_depth(&mut self, depth: u32) {
        self.rt_state.max_recursion = depth;
    }

    /// Override the stages that following descriptor and push constant binds are visible to.
    pub fn set_bind_stages(&mut self, stages: PipelineStage) {
        self.active_stages = stages;
    }

    fn prepare_texture(&mut self, texture: &TextureRef, state: TextureState, usage: vk::ImageUsageFlags) -> Result<()> {
        let Some(name) = texture.declared_name() else {
            return Ok(());
        };
        texture_declaration(&mut self.declarations, name)?.usage |= usage;

        if let Some(target) = self.render_targets.get_mut(name) {
            match state.memory_access() {
                MemoryAccess::Read => target.store = true,
                MemoryAccess::Write => {
                    target.load = true;
                    target.clear = false;
                }
                MemoryAccess::None | MemoryAccess::ReadWrite => {}
            }
        }
        Ok(())
    }

    fn prepare_buffer(&mut self, buffer: &BufferRef, usage: vk::BufferUsageFlags) -> Result<()> {
        if let Some(name) = buffer.declared_name() {
            buffer_declaration(&mut self.declarations, name)?.usage |= usage;
        }
        Ok(())
    }

    fn set_pipeline_state_descriptor(&mut self, index: u32, ty: vk::DescriptorType, count: u32) -> Result<()> {
        if index as usize >= MAX_DESCRIPTOR_COUNT {
            return Err(Error::TooManyDescriptors(index).into());
        }
        let info = DescriptorInfo {
            stages: shader_stages(self.active_stages),
            ty,
            count,
        };
        if is_graphics_stage(self.active_stages) {
            self.graphics_state.descriptor_state.set(index, info);
        }
        if is_compute_stage(self.active_stages) {
            self.compute_state.descriptor_state.set(index, info);
        }
        if is_ray_tracing_stage(self.active_stages) {
            self.rt_state.descriptor_state.set(index, info);
        }
        Ok(())
    }

    fn set_descriptor(&mut self, index: u32, ty: vk::DescriptorType, count: u32, descriptor: Descriptor) -> Result<()> {
        self.set_pipeline_state_descriptor(index, ty, count)?;
        self.descriptor_counts.add(ty, count);
        let index = index as usize;
        if self.descriptors.len() <= index {
            self.descriptors.resize(index + 1, None);
        }
        self.descriptors[index] = Some(DescriptorBinding {
            descriptor,
            stages: self.active_stages,
        });
        Ok(())
    }

    /// Bind a texture as storage image. The texture is kept in the `General` state while bound.
    pub fn bind_rw_texture(&mut self, index: u32, texture: impl Into<TextureRef>) -> Result<()> {
        let texture = texture.into();
        self.prepare_texture(&texture, TextureState::General, vk::ImageUsageFlags::STORAGE)?;
        self.set_descriptor(index, vk::DescriptorType::STORAGE_IMAGE, 1, Descriptor::RwTexture(texture))
    }

    /// Bind a texture together with the sampler described by its [`SamplerProperties`].
    pub fn bind_samplable_texture(&mut self, index: u32, texture: impl Into<TextureRef>) -> Result<()> {
        let texture = texture.into();
        self.prepare_texture(&texture, TextureState::ShaderRead, vk::ImageUsageFlags::SAMPLED)?;
        self.set_descriptor(index, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1, Descriptor::SamplableTexture(texture))
    }

    /// Bind a texture without a sampler.
    pub fn bind_texture(&mut self, index: u32, texture: impl Into<TextureRef>) -> Result<()> {
        let texture = texture.into();
        self.prepare_texture(&texture, TextureState::ShaderRead, vk::ImageUsageFlags::SAMPLED)?;
        self.set_descriptor(index, vk::DescriptorType::SAMPLED_IMAGE, 1, Descriptor::Texture(texture))
    }

    pub fn bind_sampled_texture_array(&mut self, index: u32, textures: impl IntoIterator<Item = impl Into<TextureRef>>) -> Result<()> {
        let textures: Vec<TextureRef> = textures.into_iter().map(Into::into).collect();
        for texture in &textures {
            self.prepare_texture(texture, TextureState::ShaderRead, vk::ImageUsageFlags::SAMPLED)?;
        }
        let count = textures.len() as u32;
        self.set_descriptor(index, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, count, Descriptor::SampledTextureArray(textures))
    }

    pub fn bind_uniform_buffer(&mut self, index: u32, buffer: impl Into<BufferRef>) -> Result<()> {
        let buffer = buffer.into();
        self.prepare_buffer(&buffer, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        self.set_descriptor(index, vk::DescriptorType::UNIFORM_BUFFER, 1, Descriptor::UniformBuffer(buffer))
    }

    /// Bind `size` bytes of a buffer starting at `offset` as uniform buffer.
    pub fn bind_uniform_buffer_range(&mut self, index: u32, buffer: impl Into<BufferRef>, offset: u64, size: u64) -> Result<()> {
        let buffer = buffer.into();
        self.prepare_buffer(&buffer, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        self.set_descriptor(
            index,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            Descriptor::UniformBufferRange {
                buffer,
                offset,
                size,
            },
        )
    }

    pub fn bind_uniform_buffers(&mut self, index: u32, buffers: impl IntoIterator<Item = impl Into<BufferRef>>) -> Result<()> {
        let buffers: Vec<BufferRef> = buffers.into_iter().map(Into::into).collect();
        for buffer in &buffers {
            self.prepare_buffer(buffer, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        }
        let count = buffers.len() as u32;
        self.set_descriptor(index, vk::DescriptorType::UNIFORM_BUFFER, count, Descriptor::UniformBufferArray(buffers))
    }

    pub fn bind_storage_buffer(&mut self, index: u32, buffer: impl Into<BufferRef>) -> Result<()> {
        let buffer = buffer.into();
        self.prepare_buffer(&buffer, vk::BufferUsageFlags::STORAGE_BUFFER)?;
        self.set_descriptor(index, vk::DescriptorType::STORAGE_BUFFER, 1, Descriptor::StorageBuffer(buffer))
    }

    /// Bind a top level acceleration structure. Acceleration structures are built outside of the graph.
    pub fn bind_acceleration_structure(&mut self, index: u32, acceleration_structure: vk::AccelerationStructureKHR) -> Result<()> {
        self.set_descriptor(
            index,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            Descriptor::AccelerationStructure(acceleration_structure),
        )
    }

    /// Record push constant data for the active stages. Consecutive push constants are concatenated in the order
    /// they are recorded and uploaded right before the next draw, dispatch or ray trace.
    pub fn push_constant(&mut self, data: &[u8]) {
        let stages = shader_stages(self.active_stages);
        let desc = PushConstantDesc {
            stages,
            size: data.len() as u32,
        };
        if is_graphics_stage(self.active_stages) {
            self.graphics_state.push_constants.push(desc);
        } else if is_ray_tracing_stage(self.active_stages) {
            self.rt_state.push_constants.push(desc);
        } else if is_compute_stage(self.active_stages) {
            self.compute_state.push_constants.push(desc);
        }
        self.pending_push_constants.push(Command::PushConstant {
            stages,
            data: data.to_vec(),
        });
    }

    /// Record any plain value as push constant. See [`BuildContext::push_constant`].
    pub fn push_constant_value<T: Copy>(&mut self, value: &T) {
        // SAFETY: T is Copy, so its bytes can be read as a plain slice of u8 for the lifetime of the borrow.
        let (_, data, _) = unsafe { std::slice::from_ref(value).align_to::<u8>() };
        self.push_constant(data);
    }

    pub fn set_vertex_layout(&mut self, layout: VertexLayout) {
        self.graphics_state.vertex_layout = layout;
    }

    pub fn set_vertex_topology(&mut self, topology: vk::PrimitiveTopology) {
        self.graphics_state.topology = topology;
    }

    pub fn set_depth_test_mode(&mut self, mode: DepthTestMode) {
        self.graphics_state.depth_test = mode;
    }

    pub fn set_is_blending_enabled(&mut self, enabled: bool) {
        self.graphics_state.blending = enabled;
    }

    pub fn set_line_width(&mut self, width: f32) {
        self.graphics_state.line_width = width;
    }

    /// `dims` is `[x, y, width, height]` in pixels.
    pub fn set_viewport(&mut self, dims: [f32; 4], min_depth: f32, max_depth: f32) {
        self.commands.push(Command::SetViewport {
            dims,
            min_depth,
            max_depth,
        });
    }

    pub fn bind_vertex_buffer(&mut self, buffer: impl Into<BufferRef>) -> Result<()> {
        let buffer = buffer.into();
        self.active_stages = vk::PipelineStageFlags2::VERTEX_INPUT;
        self.prepare_buffer(&buffer, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        self.commands.push(Command::BindVertexBuffer(buffer));
        Ok(())
    }

    /// Bind an index buffer of 32-bit indices.
    pub fn bind_index_buffer(&mut self, buffer: impl Into<BufferRef>) -> Result<()> {
        let buffer = buffer.into();
        self.active_stages = vk::PipelineStageFlags2::VERTEX_INPUT;
        self.prepare_buffer(&buffer, vk::BufferUsageFlags::INDEX_BUFFER)?;
        self.commands.push(Command::BindIndexBuffer(buffer));
        Ok(())
    }

    fn flush_push_constants(&mut self) {
        self.commands.append(&mut self.pending_push_constants);
    }

    fn handle_descriptor_bindings(&mut self) -> Result<()> {
        if self.descriptors.is_empty() {
            return Ok(());
        }
        if let Some(index) = self.descriptors.iter().position(Option::is_none) {
            return Err(Error::EmptyDescriptorBinding(index as u32).into());
        }
        let descriptors = std::mem::take(&mut self.descriptors);
        self.commands.push(Command::BindDescriptors(descriptors));
        self.descriptor_counts.total_sets += 1;
        Ok(())
    }

    fn handle_pending_graphic_state(&mut self) -> Result<()> {
        self.commands.push(Command::BindGraphicsPipeline(Box::new(self.graphics_state.clone())));
        self.flush_push_constants();

        self.graphics_state.descriptor_state.reset();
        self.graphics_state.vertex_layout = VertexLayout::default();
        self.graphics_state.topology = vk::PrimitiveTopology::TRIANGLE_LIST;
        self.graphics_state.depth_test = DepthTestMode::Enabled;
        self.graphics_state.push_constants.clear();
        self.graphics_state.blending = true;

        self.handle_descriptor_bindings()
    }

    pub fn draw_primitives(&mut self, vertex_count: u32, vertex_offset: u32, instance_count: u32, instance_offset: u32) -> Result<()> {
        self.handle_pending_graphic_state()?;
        self.commands.push(Command::DrawPrimitives {
            vertex_count,
            vertex_offset,
            instance_count,
            instance_offset,
        });
        Ok(())
    }

    pub fn draw_indexed_primitives(
        &mut self,
        index_count: u32,
        index_offset: u32,
        vertex_offset: i32,
        instance_count: u32,
        instance_offset: u32,
    ) -> Result<()> {
        self.handle_pending_graphic_state()?;
        self.commands.push(Command::DrawIndexedPrimitives {
            index_count,
            index_offset,
            vertex_offset,
            instance_count,
            instance_offset,
        });
        Ok(())
    }

    /// Indexed draws whose parameters live in `draw_call_buffer`, with the number of draws read from `count_buffer`.
    pub fn draw_indexed_indirect_with_count(
        &mut self,
        draw_call_buffer: impl Into<BufferRef>,
        count_buffer: impl Into<BufferRef>,
        max_draw_calls: u32,
        stride: u32,
        count_buffer_offset: u64,
    ) -> Result<()> {
        let draw_call_buffer = draw_call_buffer.into();
        let count_buffer = count_buffer.into();
        self.prepare_buffer(&draw_call_buffer, vk::BufferUsageFlags::INDIRECT_BUFFER)?;
        self.prepare_buffer(&count_buffer, vk::BufferUsageFlags::INDIRECT_BUFFER)?;
        self.handle_pending_graphic_state()?;
        self.commands.push(Command::DrawIndexedIndirectWithCount {
            draw_call_buffer,
            count_buffer,
            max_draw_calls,
            stride,
            count_buffer_offset,
        });
        Ok(())
    }

    pub fn draw_indirect_with_count(
        &mut self,
        draw_call_buffer: impl Into<BufferRef>,
        count_buffer: impl Into<BufferRef>,
        max_draw_calls: u32,
        stride: u32,
    ) -> Result<()> {
        let draw_call_buffer = draw_call_buffer.into();
        let count_buffer = count_buffer.into();
        self.prepare_buffer(&draw_call_buffer, vk::BufferUsageFlags::INDIRECT_BUFFER)?;
        self.prepare_buffer(&count_buffer, vk::BufferUsageFlags::INDIRECT_BUFFER)?;
        self.handle_pending_graphic_state()?;
        self.commands.push(Command::DrawIndirectWithCount {
            draw_call_buffer,
            count_buffer,
            max_draw_calls,
            stride,
            count_buffer_offset: 0,
        });
        Ok(())
    }

    /// Draw a quad covering the whole viewport with the built-in full screen vertex shader.
    /// Only a fragment shader needs to be bound.
    pub fn draw_full_screen_quad(&mut self) -> Result<()> {
        self.bind_vertex_shader(FULL_SCREEN_QUAD_SHADER);
        self.set_vertex_topology(vk::PrimitiveTopology::TRIANGLE_FAN);
        self.draw_primitives(4, 0, 1, 0)
    }

    fn bind_compute_state(&mut self) -> Result<()> {
        self.commands.push(Command::BindComputePipeline(Box::new(self.compute_state.clone())));
        self.compute_state.descriptor_state.reset();
        self.compute_state.push_constants.clear();
        self.handle_descriptor_bindings()?;
        self.flush_push_constants();
        Ok(())
    }

    pub fn dispatch(&mut self, dims: [u32; 3]) -> Result<()> {
        if dims.contains(&0) {
            return Err(Error::InvalidDispatch(dims).into());
        }
        self.bind_compute_state()?;
        self.commands.push(Command::Dispatch {
            dims,
        });
        Ok(())
    }

    pub fn dispatch_indirect(&mut self, indirect_buffer: impl Into<BufferRef>) -> Result<()> {
        let indirect_buffer = indirect_buffer.into();
        self.prepare_buffer(&indirect_buffer, vk::BufferUsageFlags::INDIRECT_BUFFER)?;
        self.bind_compute_state()?;
        self.commands.push(Command::DispatchIndirect {
            indirect_buffer,
        });
        Ok(())
    }

    pub fn trace_rays(&mut self, dims: [u32; 3]) -> Result<()> {
        self.commands.push(Command::BindRayTracingPipeline(Box::new(self.rt_state.clone())));
        self.handle_descriptor_bindings()?;
        self.flush_push_constants();
        self.commands.push(Command::TraceRays {
            dims,
        });
        self.rt_state = RayTracingPipelineState::default();
        Ok(())
    }

    fn begin_transfer(&mut self) {
        self.active_stages = vk::PipelineStageFlags2::TRANSFER;
        self.work_types |= vk::QueueFlags::TRANSFER;
    }

    /// Upload `data` to the start of a declared buffer.
    pub fn fill_buffer(&mut self, name: impl Into<Name>, data: &[u8]) -> Result<()> {
        let name = name.into();
        self.begin_transfer();
        self.prepare_buffer(&BufferRef::Declared(name.clone()), vk::BufferUsageFlags::TRANSFER_DST)?;
        self.commands.push(Command::FillBuffer {
            buffer: name,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Declare a buffer sized after `data` and fill it.
    pub fn init_buffer(&mut self, name: impl Into<Name>, data: &[u8]) -> Result<()> {
        let name = name.into();
        self.declare_buffer(name.clone(), data.len() as u64)?;
        self.fill_buffer(name, data)
    }

    pub fn copy_texture_to_buffer(&mut self, src: impl Into<TextureRef>, dst: impl Into<BufferRef>) -> Result<()> {
        let (src, dst) = (src.into(), dst.into());
        self.begin_transfer();
        self.prepare_texture(&src, TextureState::TransferSrc, vk::ImageUsageFlags::TRANSFER_SRC)?;
        self.prepare_buffer(&dst, vk::BufferUsageFlags::TRANSFER_DST)?;
        self.commands.push(Command::CopyTextureToBuffer {
            src,
            dst,
        });
        Ok(())
    }

    pub fn copy_buffer_to_texture(&mut self, src: impl Into<BufferRef>, dst: impl Into<TextureRef>) -> Result<()> {
        let (src, dst) = (src.into(), dst.into());
        self.begin_transfer();
        self.prepare_buffer(&src, vk::BufferUsageFlags::TRANSFER_SRC)?;
        self.prepare_texture(&dst, TextureState::TransferDst, vk::ImageUsageFlags::TRANSFER_DST)?;
        self.commands.push(Command::CopyBufferToTexture {
            src,
            dst,
        });
        Ok(())
    }

    pub fn copy_buffer(&mut self, src: impl Into<BufferRef>, dst: impl Into<BufferRef>) -> Result<()> {
        let (src, dst) = (src.into(), dst.into());
        self.begin_transfer();
        self.prepare_buffer(&src, vk::BufferUsageFlags::TRANSFER_SRC)?;
        self.prepare_buffer(&dst, vk::BufferUsageFlags::TRANSFER_DST)?;
        self.commands.push(Command::CopyBuffer {
            src,
            dst,
        });
        Ok(())
    }

    pub fn copy_texture(&mut self, src: impl Into<TextureRef>, dst: impl Into<TextureRef>) -> Result<()> {
        let (src, dst) = (src.into(), dst.into());
        self.begin_transfer();
        self.prepare_texture(&src, TextureState::TransferSrc, vk::ImageUsageFlags::TRANSFER_SRC)?;
        self.prepare_texture(&dst, TextureState::TransferDst, vk::ImageUsageFlags::TRANSFER_DST)?;
        self.commands.push(Command::CopyTexture {
            src,
            dst,
        });
        Ok(())
    }

    pub fn copy_texture_region(
        &mut self,
        src: impl Into<TextureRef>,
        src_offset: vk::Offset2D,
        dst: impl Into<TextureRef>,
        dst_offset: vk::Offset2D,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let (src, dst) = (src.into(), dst.into());
        self.begin_transfer();
        self.prepare_texture(&src, TextureState::TransferSrc, vk::ImageUsageFlags::TRANSFER_SRC)?;
        self.prepare_texture(&dst, TextureState::TransferDst, vk::ImageUsageFlags::TRANSFER_DST)?;
        self.commands.push(Command::CopyTextureRegion {
            src,
            src_offset,
            dst,
            dst_offset,
            extent,
        });
        Ok(())
    }

    /// Scaled copy with linear filtering. Blits need a graphics capable queue.
    pub fn blit_texture(&mut self, src: impl Into<TextureRef>, dst: impl Into<TextureRef>) -> Result<()> {
        let (src, dst) = (src.into(), dst.into());
        self.active_stages = vk::PipelineStageFlags2::TRANSFER;
        self.work_types |= vk::QueueFlags::GRAPHICS;
        self.prepare_texture(&src, TextureState::TransferSrc, vk::ImageUsageFlags::TRANSFER_SRC)?;
        self.prepare_texture(&dst, TextureState::TransferDst, vk::ImageUsageFlags::TRANSFER_DST)?;
        self.commands.push(Command::BlitTexture {
            src,
            dst,
        });
        Ok(())
    }

    /// Begin rendering into the given render targets. Every target must be declared through one of the
    /// `declare_*_target` calls.
    pub fn begin_render_pass(&mut self, pass_name: impl Into<Name>, targets: impl IntoIterator<Item = impl Into<Name>>) -> Result<()> {
        self.work_types |= vk::QueueFlags::GRAPHICS;
        let targets: Vec<Name> = targets.into_iter().map(Into::into).collect();
        for target in &targets {
            let is_depth = self
                .render_targets
                .get(target)
                .ok_or_else(|| Error::NotARenderTarget(target.clone()))?
                .is_depth;
            let format = texture_declaration(&mut self.declarations, target)?.format;
            if is_depth {
                self.graphics_state.depth_target_format = Some(format);
            } else {
                self.graphics_state.render_target_formats.push(format);
            }
        }
        self.commands.push(Command::BeginRenderPass {
            pass_name: pass_name.into(),
            render_targets: targets,
        });
        Ok(())
    }

    pub fn end_render_pass(&mut self) {
        self.graphics_state.depth_target_format = None;
        self.graphics_state.render_target_formats.clear();
        self.commands.push(Command::EndRenderPass);
    }

    fn render_target_mut(&mut self, name: &Name) -> Result<&mut RenderTarget> {
        self.render_targets
            .get_mut(name)
            .ok_or_else(|| Error::NotARenderTarget(name.clone()).into())
    }

    pub fn clear_color(&mut self, target: impl Into<Name>, color: [f32; 4]) -> Result<()> {
        self.render_target_mut(&target.into())?.clear_value = ClearValue::Color(color);
        Ok(())
    }

    pub fn clear_depth_stencil(&mut self, target: impl Into<Name>, depth: f32, stencil: u32) -> Result<()> {
        self.render_target_mut(&target.into())?.clear_value = ClearValue::DepthStencil {
            depth,
            stencil,
        };
        Ok(())
    }

    pub fn reset_timestamp_queries(&mut self, offset: u32, count: u32) {
        self.uses_timestamps = true;
        self.commands.push(Command::ResetQueries {
            offset,
            count,
            timestamps: true,
        });
    }

    pub fn reset_pipeline_queries(&mut self, offset: u32, count: u32) {
        self.uses_pipeline_stats = true;
        self.commands.push(Command::ResetQueries {
            offset,
            count,
            timestamps: false,
        });
    }

    /// Write a timestamp once all prior work finished (`is_closing`) or before any following work starts.
    pub fn query_timestamp(&mut self, index: u32, is_closing: bool) {
        self.uses_timestamps = true;
        self.commands.push(Command::QueryTimestamp {
            index,
            is_closing,
        });
    }

    pub fn begin_query(&mut self, index: u32) {
        self.uses_pipeline_stats = true;
        self.commands.push(Command::BeginQuery(index));
    }

    pub fn end_query(&mut self, index: u32) {
        self.uses_pipeline_stats = true;
        self.commands.push(Command::EndQuery(index));
    }

    /// Declare a flag of this job. Flags are numbered in declaration order.
    pub fn declare_flag(&mut self, flag: impl Into<Name>) -> Result<()> {
        let flag = flag.into();
        if self.flags.contains(&flag) {
            return Ok(());
        }
        if self.flags.len() >= MAX_FLAG_COUNT {
            return Err(Error::TooManyFlags(self.name.clone()).into());
        }
        self.flags.push(flag);
        Ok(())
    }

    fn check_flag(&self, flag: &Name) -> Result<()> {
        if self.flags.contains(flag) {
            Ok(())
        } else {
            Err(Error::FlagNotDeclared {
                job: self.name.clone(),
                flag: flag.clone(),
            }
            .into())
        }
    }

    /// Commands recorded until the matching [`BuildContext::end_if`] only run while `flag` is enabled.
    pub fn if_enabled(&mut self, flag: impl Into<Name>) -> Result<()> {
        let flag = flag.into();
        self.check_flag(&flag)?;
        self.condition_depth += 1;
        self.commands.push(Command::IfEnabledCond(flag));
        Ok(())
    }

    pub fn if_disabled(&mut self, flag: impl Into<Name>) -> Result<()> {
        let flag = flag.into();
        self.check_flag(&flag)?;
        self.condition_depth += 1;
        self.commands.push(Command::IfDisabledCond(flag));
        Ok(())
    }

    pub fn end_if(&mut self) -> Result<()> {
        if self.condition_depth == 0 {
            return Err(Error::UnbalancedCondition(self.name.clone()).into());
        }
        self.condition_depth -= 1;
        self.commands.push(Command::EndIfCond);
        Ok(())
    }

    /// Leave a texture in `state` at the end of the job, for consumers outside of the graph.
    pub fn export_texture(&mut self, name: impl Into<Name>, stage: PipelineStage, state: TextureState, usage: vk::ImageUsageFlags) -> Result<()> {
        let name = name.into();
        self.active_stages = stage;
        self.prepare_texture(&TextureRef::Declared(name.clone()), state, usage)?;
        self.commands.push(Command::ExportTexture {
            texture: name,
            stage,
            state,
        });
        Ok(())
    }

    pub fn export_buffer(&mut self, name: impl Into<Name>, stage: PipelineStage, access: BufferAccess, usage: vk::BufferUsageFlags) -> Result<()> {
        let name = name.into();
        self.add_buffer_usage(&name, usage)?;
        self.commands.push(Command::ExportBuffer {
            buffer: name,
            stage,
            access,
        });
        Ok(())
    }

    pub fn add_texture_usage(&mut self, name: &Name, usage: vk::ImageUsageFlags) -> Result<()> {
        texture_declaration(&mut self.declarations, name)?.usage |= usage;
        Ok(())
    }

    pub fn add_buffer_usage(&mut self, name: &Name, usage: vk::BufferUsageFlags) -> Result<()> {
        buffer_declaration(&mut self.declarations, name)?.usage |= usage;
        Ok(())
    }

    pub fn sampler_properties(&mut self, name: impl Into<Name>) -> Result<&mut SamplerProperties> {
        Ok(&mut texture_declaration(&mut self.declarations, &name.into())?.sampler)
    }

    pub fn set_sampler_properties(&mut self, name: impl Into<Name>, properties: SamplerProperties) -> Result<()> {
        *self.sampler_properties(name)? = properties;
        Ok(())
    }

    /// Number of command list variants the job is built with, one per combination of declared flags.
    pub fn flag_variation_count(&self) -> u32 {
        1 << self.flags.len()
    }

    pub fn flags(&self) -> &[Name] {
        &self.flags
    }

    pub fn work_types(&self) -> vk::QueueFlags {
        self.work_types
    }

    pub fn screen_size(&self) -> vk::Extent2D {
        self.screen_size
    }

    /// Change the size proportional and screen sized resources are created with. Takes effect on the next build.
    pub fn set_screen_size(&mut self, screen_size: vk::Extent2D) {
        self.screen_size = screen_size;
    }

    pub fn declaration(&self, name: impl Into<Name>) -> Option<&Declaration> {
        self.declarations.get(&name.into())
    }

    pub fn render_target(&self, name: impl Into<Name>) -> Option<&RenderTarget> {
        self.render_targets.get(&name.into())
    }

    /// The command stream as recorded, including condition markers.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Run the flag and barrier passes for the flag combination `enabled_flags`, without lowering the result.
    pub fn compile_variant(&mut self, enabled_flags: u32) -> Result<Vec<Command>> {
        let mut flag_pass = ApplyFlagConditionsPass::new(&self.name, &self.flags, enabled_flags);
        run_pass(&mut flag_pass, &self.commands)?;
        let filtered = flag_pass.into_commands()?;

        for declaration in self.declarations.values_mut() {
            match declaration {
                Declaration::Texture(texture) => texture.reset_state(),
                Declaration::Buffer(buffer) => buffer.reset_state(),
            }
        }

        let mut barrier_pass = BarrierInsertionPass::new(&mut self.declarations, &self.render_targets, self.screen_size);
        run_pass(&mut barrier_pass, &filtered)?;
        Ok(barrier_pass.into_commands())
    }

    /// Sizes of the descriptor pool the job needs and its maximum number of sets,
    /// or `None` if no descriptors are ever bound.
    pub fn descriptor_pool_sizes(&self) -> Option<(Vec<vk::DescriptorPoolSize>, u32)> {
        if self.descriptor_counts.total_sets == 0 {
            return None;
        }
        let multiplier = FRAMES_IN_FLIGHT_COUNT * self.flag_variation_count();
        Some((self.descriptor_counts.pool_sizes(multiplier), self.descriptor_counts.total_sets * multiplier))
    }

    /// Make sure every declared resource exists in `storage` for every frame in flight, with the current screen size.
    pub fn create_resources(&self, storage: &mut ResourceStorage<D>) -> Result<()> {
        for frame in 0..FRAMES_IN_FLIGHT_COUNT {
            for declaration in self.declarations.values() {
                match declaration {
                    Declaration::Texture(texture) => {
                        storage.ensure_texture(
                            &texture.name,
                            frame,
                            &TextureCreateInfo {
                                name: texture.name.as_str(),
                                extent: texture.dimensions(self.screen_size),
                                format: texture.format,
                                usage: texture.usage,
                                mip_count: texture.mip_count(self.screen_size),
                            },
                        )?;
                    }
                    Declaration::Buffer(buffer) => {
                        storage.ensure_buffer(
                            &buffer.name,
                            frame,
                            &BufferCreateInfo {
                                name: buffer.name.as_str(),
                                size: buffer.byte_size(self.screen_size),
                                usage: buffer.usage,
                                memory: buffer.memory,
                            },
                        )?;
                    }
                }
            }
        }
        storage.ensure_query_pools(self.uses_timestamps, self.uses_pipeline_stats)
    }

    /// Compile the recording into a [`Job`]: one native command list for every frame in flight and flag combination.
    pub fn build_job(&mut self, cache: &mut PipelineCache<D>, storage: &mut ResourceStorage<D>, job_name: &Name) -> Result<Job<D>> {
        let descriptor_pool = match self.descriptor_pool_sizes() {
            Some((sizes, max_sets)) => Some(self.device.create_descriptor_pool(&sizes, max_sets)?),
            None => None,
        };
        self.create_resources(storage)?;

        let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT_COUNT as usize);
        for frame in 0..FRAMES_IN_FLIGHT_COUNT {
            let mut descriptor_sets = vec![];
            let mut command_lists = Vec::with_capacity(self.flag_variation_count() as usize);
            for enabled_flags in 0..self.flag_variation_count() {
                let commands = self.compile_variant(enabled_flags)?;

                let mut list = self
                    .device
                    .create_command_list(self.work_types, &format!("{job_name}.frame{frame}.flags{enabled_flags}"))?;
                list.begin()?;
                let mut generate = GenerateCommandListPass::new(
                    &self.device,
                    cache,
                    storage,
                    &self.declarations,
                    &self.render_targets,
                    descriptor_pool.as_ref(),
                    &mut descriptor_sets,
                    &mut list,
                    frame,
                );
                run_pass(&mut generate, &commands)?;
                list.finish()?;
                command_lists.push(list);
            }
            frames.push(JobFrame {
                descriptor_sets,
                command_lists,
            });
        }

        info!(
            "Built job `{job_name}` with {} flag variant(s) and {} command(s)",
            self.flag_variation_count(),
            self.commands.len()
        );
        Ok(Job::new(self.device.clone(), descriptor_pool, frames, self.work_types, self.flags.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingDevice;

    fn context() -> BuildContext<RecordingDevice> {
        BuildContext::new(RecordingDevice::new(), "test", vk::Extent2D { width: 800, height: 600 })
    }

    #[test]
    fn duplicate_declaration() {
        let mut ctx = context();
        ctx.declare_buffer("buffer", 64).unwrap();
        let err = ctx.declare_staging_buffer("buffer", 64).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::DuplicateDeclaration(_))));
    }

    #[test]
    fn binds_accumulate_usage() -> Result<()> {
        let mut ctx = context();
        ctx.declare_screen_size_texture("lit", vk::Format::R16G16B16A16_SFLOAT)?;
        ctx.bind_compute_shader("shade.comp");
        ctx.bind_rw_texture(0, "lit")?;
        ctx.dispatch([8, 8, 1])?;
        ctx.bind_fragment_shader("post.frag");
        ctx.bind_samplable_texture(0, "lit")?;

        let Some(Declaration::Texture(texture)) = ctx.declaration("lit") else {
            panic!("lit is not a texture");
        };
        assert_eq!(texture.usage, vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED);
        assert_eq!(ctx.work_types(), vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS);
        Ok(())
    }

    #[test]
    fn sparse_descriptors_are_rejected() -> Result<()> {
        let mut ctx = context();
        ctx.declare_buffer("ubo", 64)?;
        ctx.bind_compute_shader("cull.comp");
        ctx.bind_uniform_buffer(2, "ubo")?;
        let err = ctx.dispatch([1, 1, 1]).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyDescriptorBinding(0))));
        Ok(())
    }

    #[test]
    fn descriptor_index_out_of_range() -> Result<()> {
        let mut ctx = context();
        ctx.declare_buffer("ubo", 64)?;
        ctx.bind_compute_shader("cull.comp");
        let err = ctx.bind_uniform_buffer(MAX_DESCRIPTOR_COUNT as u32, "ubo").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::TooManyDescriptors(16))));
        Ok(())
    }

    #[test]
    fn zero_sized_dispatch() {
        let mut ctx = context();
        ctx.bind_compute_shader("cull.comp");
        assert!(ctx.dispatch([0, 1, 1]).is_err());
    }

    #[test]
    fn writing_a_render_target_outside_a_pass_loads_it() -> Result<()> {
        let mut ctx = context();
        ctx.declare_render_target("color", vk::Format::R8G8B8A8_UNORM)?;
        assert_eq!(ctx.render_target("color").map(RenderTarget::load_op), Some(vk::AttachmentLoadOp::CLEAR));
        ctx.copy_buffer_to_texture(BufferRef::external("upload"), "color")?;
        assert_eq!(ctx.render_target("color").map(RenderTarget::load_op), Some(vk::AttachmentLoadOp::LOAD));
        Ok(())
    }

    #[test]
    fn flags_are_deduplicated_and_capped() -> Result<()> {
        let mut ctx = context();
        ctx.declare_flag("taa")?;
        ctx.declare_flag("taa")?;
        assert_eq!(ctx.flag_variation_count(), 2);
        for i in 1..MAX_FLAG_COUNT {
            ctx.declare_flag(format!("flag{i}").as_str())?;
        }
        let err = ctx.declare_flag("one_too_many").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::TooManyFlags(_))));
        Ok(())
    }

    #[test]
    fn undeclared_flag() {
        let mut ctx = context();
        assert!(ctx.if_enabled("missing").is_err());
        assert!(ctx.end_if().is_err());
    }
}
