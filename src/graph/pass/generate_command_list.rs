//! Lowers a filtered, barrier-augmented command stream into a native command list for one frame.

use std::collections::BTreeMap;

use anyhow::Result;
use ash::vk;

use crate::backend::{
    BufferBarrierInfo, CommandList, DescriptorResource, DescriptorWrite, Device, DeviceTexture, RenderAttachment, RenderingInfo, TextureBarrierInfo,
};
use crate::core::error::Error;
use crate::core::name::Name;
use crate::graph::command::{Command, Descriptor, DescriptorBinding};
use crate::graph::declaration::{Declaration, RenderTarget, SamplerProperties};
use crate::graph::pass::CommandVisitor;
use crate::graph::pipeline_cache::{PipelineCache, PipelineId};
use crate::graph::refs::TextureRef;
use crate::graph::resource_storage::ResourceStorage;
use crate::graph::state::TextureState;

pub struct GenerateCommandListPass<'a, D: Device> {
    device: &'a D,
    cache: &'a mut PipelineCache<D>,
    storage: &'a ResourceStorage<D>,
    declarations: &'a BTreeMap<Name, Declaration>,
    render_targets: &'a BTreeMap<Name, RenderTarget>,
    descriptor_pool: Option<&'a D::DescriptorPool>,
    descriptor_sets: &'a mut Vec<D::DescriptorSet>,
    list: &'a mut D::CommandList,
    frame: u32,
    bound_pipeline: Option<PipelineId>,
    push_constant_stages: vk::ShaderStageFlags,
    push_constant_data: Vec<u8>,
}

impl<'a, D: Device> GenerateCommandListPass<'a, D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &'a D,
        cache: &'a mut PipelineCache<D>,
        storage: &'a ResourceStorage<D>,
        declarations: &'a BTreeMap<Name, Declaration>,
        render_targets: &'a BTreeMap<Name, RenderTarget>,
        descriptor_pool: Option<&'a D::DescriptorPool>,
        descriptor_sets: &'a mut Vec<D::DescriptorSet>,
        list: &'a mut D::CommandList,
        frame: u32,
    ) -> Self {
        Self {
            device,
            cache,
            storage,
            declarations,
            render_targets,
            descriptor_pool,
            descriptor_sets,
            list,
            frame,
            bound_pipeline: None,
            push_constant_stages: vk::ShaderStageFlags::empty(),
            push_constant_data: vec![],
        }
    }

    fn bind_pipeline(&mut self, id: PipelineId) -> Result<()> {
        if self.bound_pipeline == Some(id) {
            return Ok(());
        }
        self.list.bind_pipeline(self.cache.pipeline(id)?)?;
        self.bound_pipeline = Some(id);
        Ok(())
    }

    /// Push every push constant recorded since the last draw in one call.
    fn flush_push_constants(&mut self) -> Result<()> {
        if self.push_constant_data.is_empty() {
            return Ok(());
        }
        let id = self.bound_pipeline.ok_or(Error::NoPipelineBound)?;
        self.list
            .push_constants(self.cache.pipeline(id)?, self.push_constant_stages, 0, &self.push_constant_data)?;
        self.push_constant_data.clear();
        self.push_constant_stages = vk::ShaderStageFlags::empty();
        Ok(())
    }

    fn sampler_for(&self, texture: &TextureRef, mip_count: u32) -> SamplerProperties {
        let mut sampler = match texture.declared_name().and_then(|name| self.declarations.get(name)) {
            Some(Declaration::Texture(declaration)) => declaration.sampler,
            _ => SamplerProperties::default(),
        };
        if sampler.max_lod == 0.0 {
            sampler.max_lod = mip_count as f32;
        }
        sampler
    }

    fn resolve_descriptor(&self, descriptor: &Descriptor) -> Result<DescriptorResource<'a, D>> {
        let storage = self.storage;
        let frame = self.frame;
        let sampled = |texture: &TextureRef| -> Result<_> {
            let mip_count = storage.resolve_texture(texture, frame)?.mip_count();
            Ok((storage.resolve_image(texture, frame)?, self.sampler_for(texture, mip_count)))
        };
        Ok(match descriptor {
            Descriptor::RwTexture(texture) => DescriptorResource::StorageImage(storage.resolve_image(texture, frame)?),
            Descriptor::SamplableTexture(texture) => {
                let (image, sampler) = sampled(texture)?;
                DescriptorResource::CombinedImageSampler(image, sampler)
            }
            Descriptor::Texture(texture) => DescriptorResource::SampledImage(storage.resolve_image(texture, frame)?),
            Descriptor::SampledTextureArray(textures) => DescriptorResource::SampledImageArray(textures.iter().map(sampled).collect::<Result<Vec<_>>>()?),
            Descriptor::UniformBuffer(buffer) => DescriptorResource::UniformBuffer {
                buffer: storage.resolve_buffer(buffer, frame)?,
                offset: 0,
                range: None,
            },
            Descriptor::UniformBufferRange {
                buffer,
                offset,
                size,
            } => DescriptorResource::UniformBuffer {
                buffer: storage.resolve_buffer(buffer, frame)?,
                offset: *offset,
                range: Some(*size),
            },
            Descriptor::UniformBufferArray(buffers) => DescriptorResource::UniformBufferArray(
                buffers
                    .iter()
                    .map(|buffer| storage.resolve_buffer(buffer, frame))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Descriptor::StorageBuffer(buffer) => DescriptorResource::StorageBuffer(storage.resolve_buffer(buffer, frame)?),
            Descriptor::AccelerationStructure(handle) => DescriptorResource::AccelerationStructure(*handle),
        })
    }

    fn bind_descriptors(&mut self, bindings: &[Option<DescriptorBinding>]) -> Result<()> {
        let id = self.bound_pipeline.ok_or(Error::NoPipelineBound)?;
        let pool = self.descriptor_pool.ok_or(Error::NoDescriptorPool)?;
        let writes = bindings
            .iter()
            .enumerate()
            .map(|(index, binding)| {
                let binding = binding.as_ref().ok_or(Error::EmptyDescriptorBinding(index as u32))?;
                Ok(DescriptorWrite {
                    binding: index as u32,
                    resource: self.resolve_descriptor(&binding.descriptor)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let pipeline = self.cache.pipeline(id)?;
        let set = self.device.allocate_descriptor_set(pool, pipeline)?;
        self.device.write_descriptor_set(&set, &writes)?;
        self.list.bind_descriptor_set(pipeline, &set)?;
        self.descriptor_sets.push(set);
        Ok(())
    }

    fn begin_render_pass(&mut self, pass_name: &Name, targets: &[Name]) -> Result<()> {
        let mut color_attachments = vec![];
        let mut depth_attachment = None;
        let mut extent = vk::Extent2D::default();
        for target in targets {
            let render_target = self
                .render_targets
                .get(target)
                .ok_or_else(|| Error::NotARenderTarget(target.clone()))?;
            let texture = self.storage.texture(target, self.frame)?;
            extent = texture.extent();
            let attachment = RenderAttachment {
                texture,
                state: if render_target.load && !render_target.store {
                    TextureState::ReadOnlyRenderTarget
                } else {
                    TextureState::RenderTarget
                },
                clear_value: render_target.clear_value,
                load_op: render_target.load_op(),
                store_op: render_target.store_op(),
            };
            if render_target.is_depth {
                depth_attachment = Some(attachment);
            } else {
                color_attachments.push(attachment);
            }
        }
        self.list.begin_rendering(&RenderingInfo {
            name: pass_name.as_str(),
            color_attachments,
            depth_attachment,
            extent,
        })
    }
}

impl<D: Device> CommandVisitor for GenerateCommandListPass<'_, D> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        let storage = self.storage;
        let frame = self.frame;
        match command {
            Command::BindGraphicsPipeline(state) => {
                let id = self.cache.graphics_pipeline(state)?;
                self.bind_pipeline(id)?;
            }
            Command::BindComputePipeline(state) => {
                let id = self.cache.compute_pipeline(state)?;
                self.bind_pipeline(id)?;
            }
            Command::BindRayTracingPipeline(state) => {
                let id = self.cache.ray_tracing_pipeline(state)?;
                self.bind_pipeline(id)?;
            }
            Command::DrawPrimitives {
                vertex_count,
                vertex_offset,
                instance_count,
                instance_offset,
            } => {
                self.flush_push_constants()?;
                self.list.draw(*vertex_count, *instance_count, *vertex_offset, *instance_offset)?;
            }
            Command::DrawIndexedPrimitives {
                index_count,
                index_offset,
                vertex_offset,
                instance_count,
                instance_offset,
            } => {
                self.flush_push_constants()?;
                self.list
                    .draw_indexed(*index_count, *instance_count, *index_offset, *vertex_offset, *instance_offset)?;
            }
            Command::DrawIndexedIndirectWithCount {
                draw_call_buffer,
                count_buffer,
                max_draw_calls,
                stride,
                count_buffer_offset,
            } => {
                self.flush_push_constants()?;
                self.list.draw_indexed_indirect_count(
                    storage.resolve_buffer(draw_call_buffer, frame)?,
                    storage.resolve_buffer(count_buffer, frame)?,
                    *count_buffer_offset,
                    *max_draw_calls,
                    *stride,
                )?;
            }
            Command::DrawIndirectWithCount {
                draw_call_buffer,
                count_buffer,
                max_draw_calls,
                stride,
                count_buffer_offset,
            } => {
                self.flush_push_constants()?;
                self.list.draw_indirect_count(
                    storage.resolve_buffer(draw_call_buffer, frame)?,
                    storage.resolve_buffer(count_buffer, frame)?,
                    *count_buffer_offset,
                    *max_draw_calls,
                    *stride,
                )?;
            }
            Command::Dispatch {
                dims,
            } => {
                self.flush_push_constants()?;
                self.list.dispatch(*dims)?;
            }
            Command::DispatchIndirect {
                indirect_buffer,
            } => {
                self.flush_push_constants()?;
                self.list.dispatch_indirect(storage.resolve_buffer(indirect_buffer, frame)?)?;
            }
            Command::TraceRays {
                dims,
            } => {
                self.flush_push_constants()?;
                let id = self.bound_pipeline.ok_or(Error::NoPipelineBound)?;
                self.list.trace_rays(self.cache.pipeline(id)?, *dims)?;
            }
            Command::BindDescriptors(bindings) => self.bind_descriptors(bindings)?,
            Command::BindVertexBuffer(buffer) => self.list.bind_vertex_buffer(storage.resolve_buffer(buffer, frame)?)?,
            Command::BindIndexBuffer(buffer) => self.list.bind_index_buffer(storage.resolve_buffer(buffer, frame)?)?,
            Command::CopyTextureToBuffer {
                src,
                dst,
            } => self
                .list
                .copy_texture_to_buffer(storage.resolve_texture(src, frame)?, storage.resolve_buffer(dst, frame)?)?,
            Command::CopyBufferToTexture {
                src,
                dst,
            } => self
                .list
                .copy_buffer_to_texture(storage.resolve_buffer(src, frame)?, storage.resolve_texture(dst, frame)?)?,
            Command::CopyBuffer {
                src,
                dst,
            } => self
                .list
                .copy_buffer(storage.resolve_buffer(src, frame)?, storage.resolve_buffer(dst, frame)?)?,
            Command::CopyTexture {
                src,
                dst,
            } => self
                .list
                .copy_texture(storage.resolve_texture(src, frame)?, storage.resolve_texture(dst, frame)?)?,
            Command::CopyTextureRegion {
                src,
                src_offset,
                dst,
                dst_offset,
                extent,
            } => self.list.copy_texture_region(
                storage.resolve_texture(src, frame)?,
                *src_offset,
                storage.resolve_texture(dst, frame)?,
                *dst_offset,
                *extent,
            )?,
            Command::BlitTexture {
                src,
                dst,
            } => self
                .list
                .blit_texture(storage.resolve_texture(src, frame)?, storage.resolve_texture(dst, frame)?)?,
            Command::PlaceTextureBarrier(barrier) => self.list.texture_barrier(
                storage.resolve_texture(&barrier.texture, frame)?,
                &TextureBarrierInfo {
                    src_stages: barrier.src_stages,
                    dst_stages: barrier.dst_stages,
                    src_state: barrier.src_state,
                    dst_state: barrier.dst_state,
                    base_mip: barrier.base_mip,
                    mip_count: barrier.mip_count,
                },
            )?,
            Command::PlaceBufferBarrier(barrier) => self.list.buffer_barrier(
                storage.resolve_buffer(&barrier.buffer, frame)?,
                &BufferBarrierInfo {
                    src_stages: barrier.src_stages,
                    dst_stages: barrier.dst_stages,
                    src_access: barrier.src_access,
                    dst_access: barrier.dst_access,
                },
            )?,
            Command::FillBuffer {
                buffer,
                data,
            } => self.list.update_buffer(storage.buffer(buffer, frame)?, 0, data)?,
            Command::BeginRenderPass {
                pass_name,
                render_targets,
            } => self.begin_render_pass(pass_name, render_targets)?,
            Command::EndRenderPass => self.list.end_rendering()?,
            Command::PushConstant {
                stages,
                data,
            } => {
                self.push_constant_stages |= *stages;
                self.push_constant_data.extend_from_slice(data);
            }
            Command::ResetQueries {
                offset,
                count,
                timestamps,
            } => {
                let pool = if *timestamps {
                    storage.timestamp_pool()?
                } else {
                    storage.pipeline_stats_pool()?
                };
                self.list.reset_queries(pool, *offset, *count)?;
            }
            Command::QueryTimestamp {
                index,
                is_closing,
            } => {
                let stage = if *is_closing {
                    vk::PipelineStageFlags2::BOTTOM_OF_PIPE
                } else {
                    vk::PipelineStageFlags2::TOP_OF_PIPE
                };
                self.list.write_timestamp(stage, storage.timestamp_pool()?, *index)?;
            }
            Command::BeginQuery(index) => self.list.begin_query(storage.pipeline_stats_pool()?, *index)?,
            Command::EndQuery(index) => self.list.end_query(storage.pipeline_stats_pool()?, *index)?,
            Command::SetViewport {
                dims,
                min_depth,
                max_depth,
            } => self.list.set_viewport(vk::Viewport {
                x: dims[0],
                y: dims[1],
                width: dims[2],
                height: dims[3],
                min_depth: *min_depth,
                max_depth: *max_depth,
            })?,
            _ => self.default_visit(command)?,
        }
        Ok(())
    }

    /// Condition markers and exports have no native counterpart.
    fn default_visit(&mut self, _command: &Command) -> Result<()> {
        Ok(())
    }
}
