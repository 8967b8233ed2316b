//! Exposes the deimos error type

use std::ffi::NulError;
use std::sync::PoisonError;

use ash;
use gpu_allocator::AllocationError;
use thiserror::Error;

use crate::backend::vulkan::ExtensionID;
use crate::core::name::Name;
use crate::graph::resource_storage::ImportId;

/// Error type that deimos can return.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to load the Vulkan library.
    #[error("Failed to load Vulkan.")]
    LoadFailed(ash::LoadingError),
    /// Could not convert rust string to C-String because it has null bytes
    #[error("Invalid C string")]
    InvalidString(NulError),
    /// Generic Vulkan error type.
    #[error("Vulkan error: `{0}`")]
    VkError(ash::vk::Result),
    /// Vulkan allocation error.
    #[error("Vulkan allocation error: `{0}`")]
    AllocationError(AllocationError),
    /// No suitable GPU found.
    #[error("No physical device found matching requirements.")]
    NoGPU,
    /// No queue family supports the work types a job records.
    #[error("No queue found that supports work types `{0:?}`.")]
    NoCapableQueue(ash::vk::QueueFlags),
    /// Poisoned mutex
    #[error("Poisoned mutex")]
    PoisonError,
    /// Function call requires extension to be enabled, but this extension was not requested or not available.
    #[error("Extension {0} required for this feature, but not enabled.")]
    ExtensionNotSupported(ExtensionID),
    /// A resource name was used that the build context never declared.
    #[error("Resource `{0}` was never declared.")]
    UndeclaredResource(Name),
    /// A resource name was declared twice in the same build context.
    #[error("Resource `{0}` is already declared.")]
    DuplicateDeclaration(Name),
    /// A texture operation was given a buffer name, or the other way around.
    #[error("Resource `{0}` is declared with a different kind than this operation expects.")]
    WrongDeclarationKind(Name),
    /// A render pass referenced a texture that is not a render target.
    #[error("Texture `{0}` is not a render target.")]
    NotARenderTarget(Name),
    /// Flag used in a condition or toggle before being declared.
    #[error("Flag `{flag}` is not declared on job `{job}`.")]
    FlagNotDeclared { job: Name, flag: Name },
    /// Every flag doubles the number of recorded command lists, so the count is capped.
    #[error("Job `{0}` declares more than {} flags.", crate::MAX_FLAG_COUNT)]
    TooManyFlags(Name),
    /// `end_if` without a matching `if_enabled`/`if_disabled`, or a condition left open.
    #[error("Unbalanced flag condition in job `{0}`.")]
    UnbalancedCondition(Name),
    /// Descriptor slots must be filled contiguously from zero before a draw or dispatch.
    #[error("Descriptor binding `{0}` is empty while a later binding is set.")]
    EmptyDescriptorBinding(u32),
    /// Binding index exceeds the descriptor slot count.
    #[error("Descriptor binding `{0}` is out of range.")]
    TooManyDescriptors(u32),
    /// Dispatch with a zero sized dimension.
    #[error("Dispatch dimensions must be non-zero, got `{0:?}`.")]
    InvalidDispatch([u32; 3]),
    /// A job name that was never added to the graph.
    #[error("Job `{0}` not found.")]
    JobNotFound(Name),
    /// A job with this name already exists.
    #[error("Job `{0}` already exists.")]
    DuplicateJob(Name),
    /// The same dependency is registered both within the frame and on the previous frame.
    #[error("Job `{job}` depends on `{dependency}` both in the same and in the previous frame.")]
    ConflictingDependency { job: Name, dependency: Name },
    /// Same-frame dependencies contain a cycle and cannot be ordered.
    #[error("Job graph contains a cycle.")]
    GraphHasCycle,
    /// A previous build failed. The graph has to be recreated.
    #[error("Job graph is unusable after a failed build.")]
    GraphUnusable,
    /// Frame index outside of the frames in flight.
    #[error("Frame index `{0}` is out of range.")]
    InvalidFrameIndex(u32),
    /// No resource created in storage for this name and frame.
    #[error("No resource `{name}` stored for frame `{frame}`.")]
    MissingResource { name: Name, frame: u32 },
    /// Imported resource id not present in storage.
    #[error("No imported resource with id `{0:?}`.")]
    MissingImport(ImportId),
    /// The shader library has no shader under this name.
    #[error("Shader `{0}` not found.")]
    ShaderNotFound(Name),
    /// Descriptors or push constants recorded without a pipeline bound.
    #[error("No pipeline bound.")]
    NoPipelineBound,
    /// Descriptors bound in a job that did not allocate a descriptor pool.
    #[error("Job has no descriptor pool.")]
    NoDescriptorPool,
    /// Buffer update that does not fit the buffer once padded to whole words.
    #[error("Update of `{len}` bytes at offset `{offset}` does not fit a buffer of `{size}` bytes.")]
    BufferUpdateOutOfRange { offset: u64, len: u64, size: u64 },
    /// Presentation target no longer matches the surface. Recoverable by resizing.
    #[error("Swapchain is out of date.")]
    OutOfDateSwapchain,
    /// Uncategorized error.
    #[error("Uncategorized error: `{0}`")]
    Uncategorized(&'static str),
}

impl From<ash::LoadingError> for Error {
    fn from(value: ash::LoadingError) -> Self {
        Error::LoadFailed(value)
    }
}

impl From<NulError> for Error {
    fn from(value: NulError) -> Self {
        Error::InvalidString(value)
    }
}

impl From<ash::vk::Result> for Error {
    fn from(value: ash::vk::Result) -> Self {
        match value {
            ash::vk::Result::ERROR_OUT_OF_DATE_KHR => Error::OutOfDateSwapchain,
            other => Error::VkError(other),
        }
    }
}

impl From<AllocationError> for Error {
    fn from(value: AllocationError) -> Self {
        Error::AllocationError(value)
    }
}

impl From<(Vec<ash::vk::Pipeline>, ash::vk::Result)> for Error {
    fn from((_, result): (Vec<ash::vk::Pipeline>, ash::vk::Result)) -> Self {
        Error::VkError(result)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::PoisonError
    }
}

/// Returns true if this error is the recoverable out of date presentation condition.
pub fn is_out_of_date(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<Error>(), Some(Error::OutOfDateSwapchain))
}
