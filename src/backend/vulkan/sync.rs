use ash::vk;

use crate::backend::vulkan::device::VulkanDevice;

/// Wrapper around a `VkFence`, used for CPU-GPU synchronization.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Fence {
    #[derivative(Debug = "ignore")]
    device: VulkanDevice,
    handle: vk::Fence,
}

impl Fence {
    pub(crate) fn new(device: VulkanDevice, signaled: bool) -> Result<Self, vk::Result> {
        let info = vk::FenceCreateInfo::builder().flags(if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        });
        let handle = unsafe { device.handle().create_fence(&info, None)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkFence {handle:p}");
        Ok(Self {
            device,
            handle,
        })
    }

    /// # Safety
    /// The fence must not be destroyed through this handle.
    pub unsafe fn handle(&self) -> vk::Fence {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkFence {:p}", self.handle);
        unsafe {
            self.device.handle().destroy_fence(self.handle, None);
        }
    }
}

/// Wrapper around a binary `VkSemaphore`, used for GPU-GPU synchronization.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Semaphore {
    #[derivative(Debug = "ignore")]
    device: VulkanDevice,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub(crate) fn new(device: VulkanDevice) -> Result<Self, vk::Result> {
        let info = vk::SemaphoreCreateInfo::default();
        let handle = unsafe { device.handle().create_semaphore(&info, None)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkSemaphore {handle:p}");
        Ok(Self {
            device,
            handle,
        })
    }

    /// # Safety
    /// The semaphore must not be destroyed through this handle.
    pub unsafe fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkSemaphore {:p}", self.handle);
        unsafe {
            self.device.handle().destroy_semaphore(self.handle, None);
        }
    }
}
