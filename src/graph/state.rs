//! Resource states tracked by the barrier pass, and their mapping onto Vulkan layouts and access masks.

use ash::vk;

/// Pipeline stages a resource is used in. Barriers are expressed with synchronization2 stage masks.
pub type PipelineStage = vk::PipelineStageFlags2;

/// Access mask of a buffer use.
pub type BufferAccess = vk::AccessFlags2;

/// Logical state of a texture (or a range of its mips). Each state maps onto one image layout.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum TextureState {
    #[default]
    Undefined,
    /// Storage image, read and written from shaders.
    General,
    ShaderRead,
    TransferSrc,
    TransferDst,
    RenderTarget,
    /// Attachment that is loaded but never stored, e.g. a depth buffer only used for testing.
    ReadOnlyRenderTarget,
    Present,
}

/// Coarse classification of an access, used to decide whether a barrier can be merged into the previous one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryAccess {
    None,
    Read,
    Write,
    ReadWrite,
}

impl MemoryAccess {
    pub fn writes(self) -> bool {
        matches!(self, MemoryAccess::Write | MemoryAccess::ReadWrite)
    }
}

impl TextureState {
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            TextureState::Undefined => vk::ImageLayout::UNDEFINED,
            TextureState::General => vk::ImageLayout::GENERAL,
            TextureState::ShaderRead => vk::ImageLayout::READ_ONLY_OPTIMAL,
            TextureState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            TextureState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            TextureState::RenderTarget => vk::ImageLayout::ATTACHMENT_OPTIMAL,
            TextureState::ReadOnlyRenderTarget => vk::ImageLayout::READ_ONLY_OPTIMAL,
            TextureState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Access mask matching this state. Attachment access depends on the aspect of the texture.
    pub fn access(self, is_depth: bool) -> vk::AccessFlags2 {
        match self {
            TextureState::Undefined | TextureState::Present => vk::AccessFlags2::NONE,
            TextureState::General => vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            TextureState::ShaderRead => vk::AccessFlags2::SHADER_SAMPLED_READ,
            TextureState::TransferSrc => vk::AccessFlags2::TRANSFER_READ,
            TextureState::TransferDst => vk::AccessFlags2::TRANSFER_WRITE,
            TextureState::RenderTarget if is_depth => {
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            TextureState::RenderTarget => vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            TextureState::ReadOnlyRenderTarget if is_depth => vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            TextureState::ReadOnlyRenderTarget => vk::AccessFlags2::COLOR_ATTACHMENT_READ,
        }
    }

    pub fn memory_access(self) -> MemoryAccess {
        match self {
            TextureState::Undefined => MemoryAccess::None,
            TextureState::General => MemoryAccess::ReadWrite,
            TextureState::ShaderRead | TextureState::TransferSrc | TextureState::ReadOnlyRenderTarget | TextureState::Present => {
                MemoryAccess::Read
            }
            TextureState::TransferDst | TextureState::RenderTarget => MemoryAccess::Write,
        }
    }
}

const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
);

/// Classifies a buffer access mask.
pub fn buffer_memory_access(access: BufferAccess) -> MemoryAccess {
    let writes = access.intersects(WRITE_ACCESS);
    let reads = !(access & !WRITE_ACCESS).is_empty();
    match (reads, writes) {
        (false, false) => MemoryAccess::None,
        (true, false) => MemoryAccess::Read,
        (false, true) => MemoryAccess::Write,
        (true, true) => MemoryAccess::ReadWrite,
    }
}

const RAY_TRACING_SHADERS: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::INTERSECTION_KHR.as_raw(),
);

/// Shader stages that can observe a descriptor or push constant used in these pipeline stages.
pub fn shader_stages(stages: PipelineStage) -> vk::ShaderStageFlags {
    let mut result = vk::ShaderStageFlags::empty();
    if stages.contains(vk::PipelineStageFlags2::VERTEX_SHADER) {
        result |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(vk::PipelineStageFlags2::FRAGMENT_SHADER) {
        result |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(vk::PipelineStageFlags2::COMPUTE_SHADER) {
        result |= vk::ShaderStageFlags::COMPUTE;
    }
    if stages.contains(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR) {
        result |= RAY_TRACING_SHADERS;
    }
    result
}

pub(crate) fn is_graphics_stage(stages: PipelineStage) -> bool {
    stages.intersects(vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER)
}

pub(crate) fn is_ray_tracing_stage(stages: PipelineStage) -> bool {
    stages.intersects(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
}

pub(crate) fn is_compute_stage(stages: PipelineStage) -> bool {
    stages.intersects(vk::PipelineStageFlags2::COMPUTE_SHADER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_buffer_access() {
        assert_eq!(buffer_memory_access(vk::AccessFlags2::UNIFORM_READ), MemoryAccess::Read);
        assert_eq!(buffer_memory_access(vk::AccessFlags2::TRANSFER_WRITE), MemoryAccess::Write);
        assert_eq!(buffer_memory_access(vk::AccessFlags2::NONE), MemoryAccess::None);
        assert!(buffer_memory_access(vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE).writes());
    }

    #[test]
    fn storage_images_read_and_write() {
        assert_eq!(TextureState::General.memory_access(), MemoryAccess::ReadWrite);
        assert!(!TextureState::ShaderRead.memory_access().writes());
        assert_eq!(
            shader_stages(vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }
}
