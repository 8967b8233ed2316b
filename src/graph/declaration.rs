//! Declarations are the metadata a [`BuildContext`](crate::BuildContext) keeps about each logical resource:
//! how to create it, and the state the barrier pass tracks for it while walking the command stream.

use std::hash::{Hash, Hasher};

use ash::vk;

use crate::backend::MemoryType;
use crate::core::name::Name;
use crate::graph::state::{BufferAccess, PipelineStage, TextureState};

/// Maximum number of mip levels a declared texture can have.
pub const MAX_MIP_COUNT: usize = 24;

/// Stages a resource counts as last used in at the start of a job, so its first use always gets a barrier.
const ENTRY_STAGES: PipelineStage = vk::PipelineStageFlags2::TOP_OF_PIPE;

/// Number of mip levels in a full chain for a texture of this size.
pub fn calculate_mip_count(extent: vk::Extent2D) -> u32 {
    let largest = extent.width.max(extent.height).max(1);
    (u32::BITS - largest.leading_zeros()).min(MAX_MIP_COUNT as u32)
}

/// Sampler used when a texture is bound through [`bind_samplable_texture`](crate::BuildContext::bind_samplable_texture).
#[derive(Debug, Copy, Clone)]
pub struct SamplerProperties {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
    pub min_lod: f32,
    /// Zero means "all mips of the texture" and is resolved when the texture is declared or resized.
    pub max_lod: f32,
}

impl Default for SamplerProperties {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
            min_lod: 0.0,
            max_lod: 0.0,
        }
    }
}

impl PartialEq for SamplerProperties {
    fn eq(&self, other: &Self) -> bool {
        self.min_filter == other.min_filter
            && self.mag_filter == other.mag_filter
            && self.mipmap_mode == other.mipmap_mode
            && self.address_mode == other.address_mode
            && self.max_anisotropy.map(f32::to_bits) == other.max_anisotropy.map(f32::to_bits)
            && self.min_lod.to_bits() == other.min_lod.to_bits()
            && self.max_lod.to_bits() == other.max_lod.to_bits()
    }
}

impl Eq for SamplerProperties {}

impl Hash for SamplerProperties {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.min_filter.hash(state);
        self.mag_filter.hash(state);
        self.mipmap_mode.hash(state);
        self.address_mode.hash(state);
        self.max_anisotropy.map(f32::to_bits).hash(state);
        self.min_lod.to_bits().hash(state);
        self.max_lod.to_bits().hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct TextureDeclaration {
    pub name: Name,
    /// `None` for textures sized after the screen.
    pub dims: Option<vk::Extent2D>,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub create_mips: bool,
    pub scale: Option<f32>,
    pub sampler: SamplerProperties,
    pub(crate) state_per_mip: [TextureState; MAX_MIP_COUNT],
    pub(crate) last_stages: [PipelineStage; MAX_MIP_COUNT],
    /// Index of the last barrier inserted for this texture in the barrier pass output.
    pub(crate) last_barrier: Option<usize>,
}

impl TextureDeclaration {
    pub(crate) fn new(name: Name, dims: Option<vk::Extent2D>, format: vk::Format, usage: vk::ImageUsageFlags, create_mips: bool, scale: Option<f32>) -> Self {
        Self {
            name,
            dims,
            format,
            usage,
            create_mips,
            scale,
            sampler: SamplerProperties::default(),
            state_per_mip: [TextureState::Undefined; MAX_MIP_COUNT],
            last_stages: [ENTRY_STAGES; MAX_MIP_COUNT],
            last_barrier: None,
        }
    }

    /// Size of the texture when the screen has the given size.
    pub fn dimensions(&self, screen_size: vk::Extent2D) -> vk::Extent2D {
        let base = self.dims.unwrap_or(screen_size);
        match self.scale {
            Some(scale) => vk::Extent2D {
                width: ((base.width as f32 * scale) as u32).max(1),
                height: ((base.height as f32 * scale) as u32).max(1),
            },
            None => base,
        }
    }

    pub fn mip_count(&self, screen_size: vk::Extent2D) -> u32 {
        if self.create_mips {
            calculate_mip_count(self.dimensions(screen_size))
        } else {
            1
        }
    }

    pub fn is_depth(&self) -> bool {
        is_depth_format(self.format)
    }

    pub(crate) fn reset_state(&mut self) {
        self.state_per_mip = [TextureState::Undefined; MAX_MIP_COUNT];
        self.last_stages = [ENTRY_STAGES; MAX_MIP_COUNT];
        self.last_barrier = None;
    }
}

#[derive(Debug, Clone)]
pub struct BufferDeclaration {
    pub name: Name,
    /// Size in bytes, or the per-pixel stride for proportional buffers.
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryType,
    pub scale: Option<f32>,
    pub(crate) current_access: BufferAccess,
    pub(crate) last_stages: PipelineStage,
    pub(crate) last_barrier: Option<usize>,
}

impl BufferDeclaration {
    pub(crate) fn new(name: Name, size: u64, usage: vk::BufferUsageFlags, memory: MemoryType, scale: Option<f32>) -> Self {
        Self {
            name,
            size,
            usage,
            memory,
            scale,
            current_access: BufferAccess::NONE,
            last_stages: ENTRY_STAGES,
            last_barrier: None,
        }
    }

    /// Size in bytes when the screen has the given size, rounded up to a multiple of four so that
    /// buffer updates can always cover the whole buffer.
    pub fn byte_size(&self, screen_size: vk::Extent2D) -> u64 {
        let size = match self.scale {
            Some(scale) => {
                let pixels = (screen_size.width as f64 * screen_size.height as f64 * scale as f64) as u64;
                pixels * self.size
            }
            None => self.size,
        };
        align_update_size(size)
    }

    pub(crate) fn reset_state(&mut self) {
        self.current_access = BufferAccess::NONE;
        self.last_stages = ENTRY_STAGES;
        self.last_barrier = None;
    }
}

#[derive(Debug, Clone)]
pub enum Declaration {
    Texture(TextureDeclaration),
    Buffer(BufferDeclaration),
}

impl Declaration {
    pub fn name(&self) -> &Name {
        match self {
            Declaration::Texture(texture) => &texture.name,
            Declaration::Buffer(buffer) => &buffer.name,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl From<ClearValue> for vk::ClearValue {
    fn from(value: ClearValue) -> Self {
        match value {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue {
                    float32,
                },
            },
            ClearValue::DepthStencil {
                depth,
                stencil,
            } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth,
                    stencil,
                },
            },
        }
    }
}

/// Attachment behaviour of a texture declared as render target.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RenderTarget {
    pub clear_value: ClearValue,
    pub is_depth: bool,
    pub clear: bool,
    pub load: bool,
    pub store: bool,
}

impl RenderTarget {
    pub(crate) fn color() -> Self {
        Self {
            clear_value: ClearValue::Color([0.0, 0.0, 0.0, 1.0]),
            is_depth: false,
            clear: true,
            load: false,
            store: true,
        }
    }

    pub(crate) fn depth() -> Self {
        Self {
            clear_value: ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
            is_depth: true,
            clear: true,
            load: false,
            store: false,
        }
    }

    pub fn load_op(&self) -> vk::AttachmentLoadOp {
        if self.clear {
            vk::AttachmentLoadOp::CLEAR
        } else if self.load {
            vk::AttachmentLoadOp::LOAD
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        }
    }

    pub fn store_op(&self) -> vk::AttachmentStoreOp {
        if self.store {
            vk::AttachmentStoreOp::STORE
        } else {
            vk::AttachmentStoreOp::DONT_CARE
        }
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Buffer updates are issued in whole words.
pub fn align_update_size(size: u64) -> u64 {
    (size + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizes_are_word_aligned() {
        let buffer = BufferDeclaration::new("bytes".into(), 6, vk::BufferUsageFlags::empty(), MemoryType::GpuOnly, None);
        assert_eq!(buffer.byte_size(vk::Extent2D { width: 800, height: 600 }), 8);
        assert_eq!(align_update_size(64), 64);
        assert_eq!(align_update_size(0), 0);
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(calculate_mip_count(vk::Extent2D { width: 1, height: 1 }), 1);
        assert_eq!(calculate_mip_count(vk::Extent2D { width: 800, height: 600 }), 10);
        assert_eq!(calculate_mip_count(vk::Extent2D { width: 1024, height: 16 }), 11);
    }

    #[test]
    fn proportional_dimensions() {
        let texture = TextureDeclaration::new("ao".into(), None, vk::Format::R8_UNORM, vk::ImageUsageFlags::empty(), false, Some(0.5));
        assert_eq!(texture.dimensions(vk::Extent2D { width: 800, height: 600 }), vk::Extent2D { width: 400, height: 300 });
        assert_eq!(texture.mip_count(vk::Extent2D { width: 800, height: 600 }), 1);
    }
}
