use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::physical_device::QueueInfo;
use crate::core::error::Error;

/// A logical queue. Several logical queues can map onto the same `VkQueue` on devices with few queue families,
/// so the handle and the command pool sit behind mutexes.
#[derive(Debug)]
pub struct Queue {
    handle: Mutex<vk::Queue>,
    pool: Mutex<vk::CommandPool>,
    info: QueueInfo,
}

impl Queue {
    pub(crate) fn new(device: &ash::Device, info: QueueInfo, index_in_family: u32) -> Result<Self> {
        let handle = unsafe { device.get_device_queue(info.family_index, index_in_family) };
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(info.family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkCommandPool {pool:p} for queue family {}", info.family_index);
        Ok(Self {
            handle: Mutex::new(handle),
            pool: Mutex::new(pool),
            info,
        })
    }

    pub fn info(&self) -> &QueueInfo {
        &self.info
    }

    pub(crate) fn handle(&self) -> Result<MutexGuard<vk::Queue>> {
        Ok(self.handle.lock().map_err(|_| Error::PoisonError)?)
    }

    pub(crate) fn pool(&self) -> Result<MutexGuard<vk::CommandPool>> {
        Ok(self.pool.lock().map_err(|_| Error::PoisonError)?)
    }

    /// Destroy the command pool. Every command buffer allocated from it has to be freed or unused.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        if let Ok(pool) = self.pool.lock() {
            #[cfg(feature = "log-objects")]
            trace!("Destroying VkCommandPool {:p}", *pool);
            device.destroy_command_pool(*pool, None);
        }
    }
}
