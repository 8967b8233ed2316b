//! [`Device`](crate::backend::Device) implementation on top of Vulkan 1.3.
//!
//! The backend relies on dynamic rendering and synchronization2, so no render pass or framebuffer objects exist.
//! Every job records into primary command buffers that are created once and resubmitted every time the job runs.
//! Memory is managed by [`gpu_allocator`].
//!
//! Creating a device initializes the whole Vulkan context:
//! ```no_run
//! # use deimos::prelude::*;
//! # fn main() -> anyhow::Result<()> {
//! let settings = AppBuilder::new()
//!     .name("deimos app")
//!     .validation(true)
//!     .gpu(GPURequirements {
//!         queues: vec![
//!             QueueRequest { dedicated: false, queue_type: QueueType::Graphics },
//!             QueueRequest { dedicated: true, queue_type: QueueType::Transfer },
//!         ],
//!         ..Default::default()
//!     })
//!     .build();
//! let device = VulkanDevice::new(&settings)?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod app_info;
pub mod command_list;
pub mod debug;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod query_pool;
pub mod queue;
pub mod resource;
pub mod sync;
mod util;

pub use allocator::{Allocation, DefaultAllocator};
pub use app_info::{AppBuilder, AppSettings, GPURequirements, QueueRequest, QueueType};
pub use command_list::VulkanCommandList;
pub use debug::DebugMessenger;
pub use descriptor::{VulkanDescriptorPool, VulkanDescriptorSet};
pub use device::{ExtensionID, RayTracingProperties, VulkanDevice};
pub use instance::Instance;
pub use physical_device::{PhysicalDevice, QueueInfo};
pub use pipeline::{ShaderBindingTable, VulkanPipeline};
pub use query_pool::VulkanQueryPool;
pub use queue::Queue;
pub use resource::{VulkanBuffer, VulkanTexture, VulkanTextureView};
pub use sync::{Fence, Semaphore};
