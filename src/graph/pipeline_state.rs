//! Pending pipeline state accumulated by the build context between draws and dispatches. Each state struct
//! is a complete description of one pipeline object and is the key the [`PipelineCache`](crate::PipelineCache)
//! deduplicates on.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use ash::vk;

use crate::core::name::Name;
use crate::MAX_DESCRIPTOR_COUNT;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorInfo {
    pub stages: vk::ShaderStageFlags,
    pub ty: vk::DescriptorType,
    pub count: u32,
}

impl Default for DescriptorInfo {
    fn default() -> Self {
        Self {
            stages: vk::ShaderStageFlags::empty(),
            ty: vk::DescriptorType::SAMPLER,
            count: 0,
        }
    }
}

/// Layout of the single descriptor set a pipeline uses.
#[derive(Debug, Copy, Clone, Default)]
pub struct DescriptorState {
    pub descriptors: [DescriptorInfo; MAX_DESCRIPTOR_COUNT],
    pub count: u32,
}

impl DescriptorState {
    pub fn active(&self) -> &[DescriptorInfo] {
        &self.descriptors[..self.count as usize]
    }

    pub(crate) fn set(&mut self, index: u32, info: DescriptorInfo) {
        self.descriptors[index as usize] = info;
        self.count = self.count.max(index + 1);
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }
}

// Slots past `count` are stale leftovers from earlier pipelines and never take part in comparisons.
impl PartialEq for DescriptorState {
    fn eq(&self, other: &Self) -> bool {
        self.active() == other.active()
    }
}

impl Eq for DescriptorState {}

impl Hash for DescriptorState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.active().hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Single interleaved vertex binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    pub fn new(stride: u32) -> Self {
        Self {
            stride,
            attributes: vec![],
        }
    }

    pub fn add(mut self, format: vk::Format, offset: u32) -> Self {
        let location = self.attributes.len() as u32;
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset,
        });
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PushConstantDesc {
    pub stages: vk::ShaderStageFlags,
    pub size: u32,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum DepthTestMode {
    Disabled,
    #[default]
    Enabled,
    /// Test against the depth buffer without writing to it.
    ReadOnly,
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineState {
    pub vertex_shader: Option<Name>,
    pub fragment_shader: Option<Name>,
    pub vertex_layout: VertexLayout,
    pub descriptor_state: DescriptorState,
    pub render_target_formats: Vec<vk::Format>,
    pub depth_target_format: Option<vk::Format>,
    pub topology: vk::PrimitiveTopology,
    pub depth_test: DepthTestMode,
    pub push_constants: Vec<PushConstantDesc>,
    pub line_width: f32,
    pub blending: bool,
}

impl Default for GraphicsPipelineState {
    fn default() -> Self {
        Self {
            vertex_shader: None,
            fragment_shader: None,
            vertex_layout: VertexLayout::default(),
            descriptor_state: DescriptorState::default(),
            render_target_formats: vec![],
            depth_target_format: None,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            depth_test: DepthTestMode::Enabled,
            push_constants: vec![],
            line_width: 1.0,
            blending: true,
        }
    }
}

impl PartialEq for GraphicsPipelineState {
    fn eq(&self, other: &Self) -> bool {
        self.vertex_shader == other.vertex_shader
            && self.fragment_shader == other.fragment_shader
            && self.vertex_layout == other.vertex_layout
            && self.descriptor_state == other.descriptor_state
            && self.render_target_formats == other.render_target_formats
            && self.depth_target_format == other.depth_target_format
            && self.topology == other.topology
            && self.depth_test == other.depth_test
            && self.push_constants == other.push_constants
            && self.line_width.to_bits() == other.line_width.to_bits()
            && self.blending == other.blending
    }
}

impl Eq for GraphicsPipelineState {}

impl Hash for GraphicsPipelineState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vertex_shader.hash(state);
        self.fragment_shader.hash(state);
        self.vertex_layout.hash(state);
        self.descriptor_state.hash(state);
        self.render_target_formats.hash(state);
        self.depth_target_format.hash(state);
        self.topology.hash(state);
        self.depth_test.hash(state);
        self.push_constants.hash(state);
        self.line_width.to_bits().hash(state);
        self.blending.hash(state);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ComputePipelineState {
    pub compute_shader: Option<Name>,
    pub descriptor_state: DescriptorState,
    pub push_constants: Vec<PushConstantDesc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RayTracingShaderGroupType {
    General,
    Triangles,
}

/// Shader group of a ray tracing pipeline. Shaders are referenced by name and must also be bound through
/// the `bind_rt_*_shader` calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RayTracingShaderGroup {
    pub ty: RayTracingShaderGroupType,
    pub general_shader: Option<Name>,
    pub closest_hit_shader: Option<Name>,
}

pub const DEFAULT_MAX_RECURSION: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RayTracingPipelineState {
    pub ray_gen_shader: Option<Name>,
    pub miss_shaders: Vec<Name>,
    pub closest_hit_shaders: Vec<Name>,
    pub shader_groups: Vec<RayTracingShaderGroup>,
    pub descriptor_state: DescriptorState,
    pub push_constants: Vec<PushConstantDesc>,
    pub max_recursion: u32,
}

impl Default for RayTracingPipelineState {
    fn default() -> Self {
        Self {
            ray_gen_shader: None,
            miss_shaders: vec![],
            closest_hit_shaders: vec![],
            shader_groups: vec![],
            descriptor_state: DescriptorState::default(),
            push_constants: vec![],
            max_recursion: DEFAULT_MAX_RECURSION,
        }
    }
}

/// Stable 64-bit hash of a pipeline state, handy for logging and debug names.
pub fn state_hash<T: Hash>(state: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    state.hash(&mut hasher);
    hasher.finish()
}

/// Byte range covering every push constant block of a pipeline. All blocks share one range starting at zero,
/// visible to the union of their stages.
pub fn push_constant_range(push_constants: &[PushConstantDesc]) -> Option<vk::PushConstantRange> {
    if push_constants.is_empty() {
        return None;
    }
    let stage_flags = push_constants.iter().fold(vk::ShaderStageFlags::empty(), |acc, pc| acc | pc.stages);
    let size = push_constants.iter().map(|pc| pc.size).sum();
    Some(vk::PushConstantRange {
        stage_flags,
        offset: 0,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_descriptor_slots_do_not_affect_equality() {
        let mut a = DescriptorState::default();
        let info = DescriptorInfo {
            stages: vk::ShaderStageFlags::COMPUTE,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            count: 1,
        };
        a.set(0, info);
        a.set(1, info);
        a.reset();
        a.set(0, info);

        let mut b = DescriptorState::default();
        b.set(0, info);
        assert_eq!(a, b);
        assert_eq!(state_hash(&a), state_hash(&b));
    }

    #[test]
    fn line_width_participates_in_hash() {
        let a = GraphicsPipelineState::default();
        let b = GraphicsPipelineState {
            line_width: 2.0,
            ..Default::default()
        };
        assert_ne!(a, b);
        assert_ne!(state_hash(&a), state_hash(&b));
    }
}
