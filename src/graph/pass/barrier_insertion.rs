//! Inserts the synchronization a command stream needs.
//!
//! The pass walks the stream while tracking, per declared resource, the state it was last left in and the
//! stages that last touched it. Whenever a command needs a resource in a different state, or writes to it, a
//! barrier from the tracked stages to the new ones is inserted in front of the command. Reads that follow a
//! barrier into the same state are folded into that barrier instead of producing a new one. Textures are
//! tracked per mip level, and adjacent mips in the same state share one barrier.

use std::collections::BTreeMap;

use anyhow::Result;
use ash::vk;

use crate::core::error::Error;
use crate::core::name::Name;
use crate::graph::command::{BufferBarrier, Command, Descriptor, TextureBarrier};
use crate::graph::declaration::{BufferDeclaration, Declaration, RenderTarget, TextureDeclaration, MAX_MIP_COUNT};
use crate::graph::pass::CommandVisitor;
use crate::graph::refs::{BufferRef, TextureRef};
use crate::graph::state::{buffer_memory_access, BufferAccess, PipelineStage, TextureState};

pub(crate) fn texture_declaration<'d>(declarations: &'d mut BTreeMap<Name, Declaration>, name: &Name) -> Result<&'d mut TextureDeclaration> {
    match declarations.get_mut(name) {
        Some(Declaration::Texture(texture)) => Ok(texture),
        Some(Declaration::Buffer(_)) => Err(Error::WrongDeclarationKind(name.clone()).into()),
        None => Err(Error::UndeclaredResource(name.clone()).into()),
    }
}

pub(crate) fn buffer_declaration<'d>(declarations: &'d mut BTreeMap<Name, Declaration>, name: &Name) -> Result<&'d mut BufferDeclaration> {
    match declarations.get_mut(name) {
        Some(Declaration::Buffer(buffer)) => Ok(buffer),
        Some(Declaration::Texture(_)) => Err(Error::WrongDeclarationKind(name.clone()).into()),
        None => Err(Error::UndeclaredResource(name.clone()).into()),
    }
}

/// Insert a barrier in front of the render pass that is currently open, or append it if there is none.
/// Barriers are never placed inside a render pass, so inserting at its start never moves an earlier barrier.
fn insert_before_render_pass(commands: &mut Vec<Command>, render_pass_start: &mut Option<usize>, command: Command) -> usize {
    match render_pass_start {
        Some(start) => {
            let index = *start;
            commands.insert(index, command);
            *start += 1;
            index
        }
        None => {
            commands.push(command);
            commands.len() - 1
        }
    }
}

pub struct BarrierInsertionPass<'a> {
    declarations: &'a mut BTreeMap<Name, Declaration>,
    render_targets: &'a BTreeMap<Name, RenderTarget>,
    screen_size: vk::Extent2D,
    commands: Vec<Command>,
    render_pass_start: Option<usize>,
}

impl<'a> BarrierInsertionPass<'a> {
    /// Declarations must have their tracked state reset before a new variant is processed.
    pub fn new(declarations: &'a mut BTreeMap<Name, Declaration>, render_targets: &'a BTreeMap<Name, RenderTarget>, screen_size: vk::Extent2D) -> Self {
        Self {
            declarations,
            render_targets,
            screen_size,
            commands: vec![],
            render_pass_start: None,
        }
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    fn setup_texture_barrier(&mut self, texture: &TextureRef, target: TextureState, target_stages: PipelineStage, last_used: Option<PipelineStage>) -> Result<()> {
        let Some(name) = texture.declared_name() else {
            return Ok(());
        };
        let barrier_ref = match texture {
            TextureRef::LastFrame(name) => TextureRef::LastFrame(name.clone()),
            _ => TextureRef::Declared(name.clone()),
        };

        let declaration = texture_declaration(self.declarations, name)?;
        let (base, count) = match texture {
            TextureRef::Mip {
                level, ..
            } => (*level, 1),
            _ => (0, declaration.mip_count(self.screen_size)),
        };
        if (base + count) as usize > MAX_MIP_COUNT {
            return Err(Error::Uncategorized("mip level out of range").into());
        }

        let late_stages = last_used.unwrap_or(target_stages);
        let writes = target.memory_access().writes();
        let end = base + count;

        let mut run = 1u32;
        for mip in base..end {
            let level = mip as usize;
            if mip + 1 < end
                && declaration.state_per_mip[level] == declaration.state_per_mip[level + 1]
                && declaration.last_stages[level] == declaration.last_stages[level + 1]
            {
                run += 1;
                continue;
            }

            let first = level + 1 - run as usize;
            let current = declaration.state_per_mip[level];
            let stages = declaration.last_stages[level];
            let range_changed = match declaration.last_barrier.map(|index| &self.commands[index]) {
                Some(Command::PlaceTextureBarrier(barrier)) => barrier.base_mip != base || barrier.mip_count != count,
                _ => false,
            };

            if writes || current != target || range_changed {
                if !stages.is_empty() {
                    let barrier = Command::PlaceTextureBarrier(TextureBarrier {
                        texture: barrier_ref.clone(),
                        src_stages: stages,
                        dst_stages: target_stages,
                        src_state: current,
                        dst_state: target,
                        base_mip: first as u32,
                        mip_count: run,
                    });
                    declaration.last_barrier = Some(insert_before_render_pass(&mut self.commands, &mut self.render_pass_start, barrier));
                }
                declaration.last_stages[first..=level].fill(late_stages);
            } else {
                if let Some(Command::PlaceTextureBarrier(barrier)) = declaration.last_barrier.map(|index| &mut self.commands[index]) {
                    barrier.dst_stages |= target_stages;
                }
                declaration.last_stages[first..=level]
                    .iter_mut()
                    .for_each(|stages| *stages |= late_stages);
            }

            declaration.state_per_mip[first..=level].fill(target);
            run = 1;
        }

        Ok(())
    }

    fn setup_buffer_barrier(&mut self, buffer: &BufferRef, target: BufferAccess, target_stages: PipelineStage) -> Result<()> {
        let Some(name) = buffer.declared_name() else {
            return Ok(());
        };
        let declaration = buffer_declaration(self.declarations, name)?;

        let writes = buffer_memory_access(target).writes() || buffer_memory_access(declaration.current_access).writes();
        if writes {
            if !declaration.last_stages.is_empty() {
                let barrier = Command::PlaceBufferBarrier(BufferBarrier {
                    buffer: buffer.clone(),
                    src_stages: declaration.last_stages,
                    dst_stages: target_stages,
                    src_access: declaration.current_access,
                    dst_access: target,
                });
                declaration.last_barrier = Some(insert_before_render_pass(&mut self.commands, &mut self.render_pass_start, barrier));
            }
            declaration.last_stages = target_stages;
        } else {
            if let Some(Command::PlaceBufferBarrier(barrier)) = declaration.last_barrier.map(|index| &mut self.commands[index]) {
                barrier.dst_stages |= target_stages;
                barrier.dst_access |= target;
            }
            declaration.last_stages |= target_stages;
        }

        declaration.current_access = target;
        Ok(())
    }

    fn setup_descriptor_barriers(&mut self, descriptor: &Descriptor, stages: PipelineStage) -> Result<()> {
        match descriptor {
            Descriptor::RwTexture(texture) => self.setup_texture_barrier(texture, TextureState::General, stages, None),
            Descriptor::SamplableTexture(texture) | Descriptor::Texture(texture) => {
                self.setup_texture_barrier(texture, TextureState::ShaderRead, stages, None)
            }
            Descriptor::SampledTextureArray(textures) => textures
                .iter()
                .try_for_each(|texture| self.setup_texture_barrier(texture, TextureState::ShaderRead, stages, None)),
            Descriptor::UniformBuffer(buffer)
            | Descriptor::UniformBufferRange {
                buffer, ..
            } => self.setup_buffer_barrier(buffer, vk::AccessFlags2::UNIFORM_READ, stages),
            Descriptor::UniformBufferArray(buffers) => buffers
                .iter()
                .try_for_each(|buffer| self.setup_buffer_barrier(buffer, vk::AccessFlags2::UNIFORM_READ, stages)),
            Descriptor::StorageBuffer(buffer) => self.setup_buffer_barrier(
                buffer,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                stages,
            ),
            Descriptor::AccelerationStructure(_) => Ok(()),
        }
    }
}

impl CommandVisitor for BarrierInsertionPass<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        let transfer = vk::PipelineStageFlags2::TRANSFER;
        match command {
            Command::BindDescriptors(descriptors) => {
                for binding in descriptors.iter().flatten() {
                    self.setup_descriptor_barriers(&binding.descriptor, binding.stages)?;
                }
            }
            Command::BindVertexBuffer(buffer) => {
                self.setup_buffer_barrier(buffer, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ, vk::PipelineStageFlags2::VERTEX_INPUT)?;
            }
            Command::BindIndexBuffer(buffer) => {
                self.setup_buffer_barrier(buffer, vk::AccessFlags2::INDEX_READ, vk::PipelineStageFlags2::VERTEX_INPUT)?;
            }
            Command::CopyTextureToBuffer {
                src,
                dst,
            } => {
                self.setup_texture_barrier(src, TextureState::TransferSrc, transfer, None)?;
                self.setup_buffer_barrier(dst, vk::AccessFlags2::TRANSFER_WRITE, transfer)?;
            }
            Command::CopyBufferToTexture {
                src,
                dst,
            } => {
                self.setup_buffer_barrier(src, vk::AccessFlags2::TRANSFER_READ, transfer)?;
                self.setup_texture_barrier(dst, TextureState::TransferDst, transfer, None)?;
            }
            Command::CopyBuffer {
                src,
                dst,
            } => {
                self.setup_buffer_barrier(src, vk::AccessFlags2::TRANSFER_READ, transfer)?;
                self.setup_buffer_barrier(dst, vk::AccessFlags2::TRANSFER_WRITE, transfer)?;
            }
            Command::CopyTexture {
                src,
                dst,
            }
            | Command::CopyTextureRegion {
                src,
                dst,
                ..
            }
            | Command::BlitTexture {
                src,
                dst,
            } => {
                self.setup_texture_barrier(src, TextureState::TransferSrc, transfer, None)?;
                self.setup_texture_barrier(dst, TextureState::TransferDst, transfer, None)?;
            }
            Command::FillBuffer {
                buffer, ..
            } => {
                self.setup_buffer_barrier(&BufferRef::Declared(buffer.clone()), vk::AccessFlags2::TRANSFER_WRITE, transfer)?;
            }
            Command::BeginRenderPass {
                render_targets, ..
            } => {
                for target in render_targets {
                    let render_target = *self
                        .render_targets
                        .get(target)
                        .ok_or_else(|| Error::NotARenderTarget(target.clone()))?;
                    let (target_stages, last_stages) = if render_target.is_depth {
                        (vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS, vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS)
                    } else {
                        (vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                    };
                    let state = if render_target.load && !render_target.store {
                        TextureState::ReadOnlyRenderTarget
                    } else {
                        TextureState::RenderTarget
                    };
                    self.setup_texture_barrier(&TextureRef::Declared(target.clone()), state, target_stages, Some(last_stages))?;
                }
                self.render_pass_start = Some(self.commands.len());
            }
            Command::EndRenderPass => {
                self.render_pass_start = None;
            }
            Command::DrawIndexedIndirectWithCount {
                draw_call_buffer,
                count_buffer,
                ..
            }
            | Command::DrawIndirectWithCount {
                draw_call_buffer,
                count_buffer,
                ..
            } => {
                let indirect = vk::PipelineStageFlags2::DRAW_INDIRECT;
                self.setup_buffer_barrier(draw_call_buffer, vk::AccessFlags2::INDIRECT_COMMAND_READ, indirect)?;
                self.setup_buffer_barrier(count_buffer, vk::AccessFlags2::INDIRECT_COMMAND_READ, indirect)?;
            }
            Command::DispatchIndirect {
                indirect_buffer,
            } => {
                self.setup_buffer_barrier(indirect_buffer, vk::AccessFlags2::INDIRECT_COMMAND_READ, vk::PipelineStageFlags2::DRAW_INDIRECT)?;
            }
            Command::ExportTexture {
                texture,
                stage,
                state,
            } => {
                // Exports only leave the resource in its final state and produce no command of their own.
                return self.setup_texture_barrier(&TextureRef::Declared(texture.clone()), *state, *stage, None);
            }
            Command::ExportBuffer {
                buffer,
                stage,
                access,
            } => return self.setup_buffer_barrier(&BufferRef::Declared(buffer.clone()), *access, *stage),
            _ => {}
        }
        self.default_visit(command)
    }

    fn default_visit(&mut self, command: &Command) -> Result<()> {
        self.commands.push(command.clone());
        Ok(())
    }
}
