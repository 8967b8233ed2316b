//! Re-exports the types most applications need.

pub use ash::vk;

pub use crate::core::error::{is_out_of_date, Error};
pub use crate::core::name::Name;

pub use crate::backend::recording::{NativeCall, PipelineKind, RecordedCommandList, RecordingDevice, Submission};
pub use crate::backend::vulkan::{AppBuilder, AppSettings, DefaultAllocator, ExtensionID, GPURequirements, QueueRequest, QueueType, VulkanDevice};
pub use crate::backend::{
    BufferCreateInfo, CommandList, DescriptorResource, DescriptorWrite, Device, DeviceBuffer, DeviceTexture, MemoryType, TextureCreateInfo,
};

pub use crate::graph::build_context::BuildContext;
pub use crate::graph::command::{Command, Descriptor};
pub use crate::graph::declaration::{ClearValue, Declaration, RenderTarget, SamplerProperties};
pub use crate::graph::job::Job;
pub use crate::graph::job_graph::{DependencyKind, JobGraph, SemaphoreId};
pub use crate::graph::pipeline_cache::{DirectoryShaderLibrary, InMemoryShaderLibrary, PipelineCache, PipelineId, ShaderLibrary};
pub use crate::graph::pipeline_state::{DepthTestMode, RayTracingShaderGroup, RayTracingShaderGroupType, VertexAttribute, VertexLayout};
pub use crate::graph::refs::{BufferRef, TextureRef};
pub use crate::graph::resource_storage::{ImportId, ResourceStorage};
pub use crate::graph::state::{BufferAccess, MemoryAccess, PipelineStage, TextureState};
pub use crate::graph::surface::RenderSurface;
