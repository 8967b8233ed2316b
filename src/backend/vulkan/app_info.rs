//! Initialization parameters of the Vulkan backend.

use ash::vk;

/// Kind of queue requested from the physical device. Graphics and compute queues always support transfers.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq, Hash)]
pub enum QueueType {
    #[default]
    Graphics = vk::QueueFlags::GRAPHICS.as_raw() as isize,
    Compute = vk::QueueFlags::COMPUTE.as_raw() as isize,
    Transfer = vk::QueueFlags::TRANSFER.as_raw() as isize,
}

/// A queue with specific capabilities to request from the physical device.
///
/// # Example
/// ```
/// # use deimos::prelude::*;
/// let transfer = QueueRequest {
///     dedicated: true,
///     queue_type: QueueType::Transfer,
/// };
/// ```
#[derive(Debug, Copy, Clone)]
pub struct QueueRequest {
    /// Try to find a queue family without unrelated capabilities. A dedicated transfer queue has neither graphics
    /// nor compute support. Falls back to a shared family if none exists.
    pub dedicated: bool,
    pub queue_type: QueueType,
}

/// Minimum requirements for the GPU. Used to pick the physical device and to enable optional features.
///
/// Jobs are submitted to the first requested queue that supports all of their work types, so the order of
/// `queues` matters.
#[derive(Default, Debug)]
pub struct GPURequirements {
    /// Discard integrated GPUs.
    pub dedicated: bool,
    /// Minimum amount of video memory in bytes, shared memory included.
    pub min_video_memory: usize,
    /// Minimum amount of device local memory in bytes.
    pub min_dedicated_video_memory: usize,
    pub queues: Vec<QueueRequest>,
    pub features: vk::PhysicalDeviceFeatures,
    pub features_1_1: vk::PhysicalDeviceVulkan11Features,
    pub features_1_2: vk::PhysicalDeviceVulkan12Features,
    pub features_1_3: vk::PhysicalDeviceVulkan13Features,
    /// Device extensions that must be present. Missing extensions reject the physical device.
    pub device_extensions: Vec<String>,
}

/// Settings used to create a [`VulkanDevice`](crate::backend::vulkan::VulkanDevice).
#[derive(Debug)]
pub struct AppSettings {
    /// Application name, shown in debugging tools.
    pub name: String,
    pub version: (u32, u32, u32),
    /// Enable the Khronos validation layer and route its messages to the `log` crate. Ignored with a warning
    /// when the layer is not installed.
    pub enable_validation: bool,
    pub gpu_requirements: GPURequirements,
    /// Enable `VK_KHR_acceleration_structure` and `VK_KHR_ray_tracing_pipeline` if they are available.
    pub raytracing: bool,
    /// Extra instance extensions, e.g. the surface extensions a windowing library asks for when the graph
    /// renders into a swapchain it owns.
    pub instance_extensions: Vec<String>,
}

impl Default for AppSettings {
    /// One shared graphics queue, no validation and no ray tracing.
    fn default() -> Self {
        Self {
            name: String::new(),
            version: (0, 0, 0),
            enable_validation: false,
            gpu_requirements: GPURequirements {
                queues: vec![QueueRequest {
                    dedicated: false,
                    queue_type: QueueType::Graphics,
                }],
                ..Default::default()
            },
            raytracing: false,
            instance_extensions: vec![],
        }
    }
}

impl AppSettings {
    /// Queue types in the order jobs are matched against them.
    pub fn queue_types(&self) -> impl Iterator<Item = QueueType> + '_ {
        self.gpu_requirements.queues.iter().map(|request| request.queue_type)
    }
}

/// Convenience builder for [`AppSettings`].
///
/// # Example
/// ```
/// # use deimos::prelude::*;
/// let settings = AppBuilder::new()
///     .name("deimos example")
///     .validation(true)
///     .build();
/// assert_eq!(settings.queue_types().collect::<Vec<_>>(), vec![QueueType::Graphics]);
/// ```
#[derive(Debug, Default)]
pub struct AppBuilder {
    settings: AppSettings,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(self, name: impl Into<String>) -> Self {
        self.with(|settings| settings.name = name.into())
    }

    pub fn version(self, version: impl Into<(u32, u32, u32)>) -> Self {
        self.with(|settings| settings.version = version.into())
    }

    pub fn validation(self, enabled: bool) -> Self {
        self.with(|settings| settings.enable_validation = enabled)
    }

    /// Replace the default GPU requirements. An empty queue list is rejected when the device is created.
    pub fn gpu(self, requirements: GPURequirements) -> Self {
        self.with(|settings| settings.gpu_requirements = requirements)
    }

    /// Enable as many ray tracing extensions as are available.
    pub fn raytracing(self, enabled: bool) -> Self {
        self.with(|settings| settings.raytracing = enabled)
    }

    pub fn instance_extension(self, name: impl Into<String>) -> Self {
        self.with(|settings| settings.instance_extensions.push(name.into()))
    }

    pub fn build(self) -> AppSettings {
        self.settings
    }

    fn with(mut self, f: impl FnOnce(&mut AppSettings)) -> Self {
        f(&mut self.settings);
        self
    }
}
