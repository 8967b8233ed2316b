//! Device memory through [`gpu_allocator`].

use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;
use gpu_allocator::vulkan as vk_alloc;
use gpu_allocator::vulkan::AllocationScheme;

use crate::backend::MemoryType;
use crate::core::error::Error;

/// Shared handle to the `gpu_allocator` instance of a device. Clones share the same allocator.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct DefaultAllocator {
    #[derivative(Debug = "ignore")]
    alloc: Arc<Mutex<Option<vk_alloc::Allocator>>>,
}

/// Memory bound to a buffer or image. Returned to the allocator on drop.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Allocation {
    allocator: DefaultAllocator,
    #[derivative(Debug = "ignore")]
    allocation: Option<vk_alloc::Allocation>,
}

impl DefaultAllocator {
    pub(crate) fn new(instance: &ash::Instance, device: &ash::Device, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let alloc = vk_alloc::Allocator::new(&vk_alloc::AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
        })?;
        Ok(Self {
            alloc: Arc::new(Mutex::new(Some(alloc))),
        })
    }

    pub fn allocate(&self, name: &str, requirements: &vk::MemoryRequirements, ty: MemoryType, linear: bool) -> Result<Allocation> {
        let mut alloc = self.alloc.lock().map_err(|_| Error::PoisonError)?;
        let alloc = alloc
            .as_mut()
            .ok_or(Error::Uncategorized("allocation after the device was destroyed"))?;
        let allocation = alloc.allocate(&vk_alloc::AllocationCreateDesc {
            name,
            requirements: *requirements,
            location: ty.into(),
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        Ok(Allocation {
            allocator: self.clone(),
            allocation: Some(allocation),
        })
    }

    /// Tear down the allocator. Has to run before the owning `VkDevice` is destroyed.
    pub(crate) fn destroy(&self) {
        if let Ok(mut alloc) = self.alloc.lock() {
            alloc.take();
        }
    }
}

impl Allocation {
    /// # Safety
    /// Must be used together with [`Allocation::offset`].
    pub unsafe fn memory(&self) -> vk::DeviceMemory {
        self.allocation.as_ref().map_or(vk::DeviceMemory::null(), |a| a.memory())
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.allocation.as_ref().map_or(0, |a| a.offset())
    }

    /// Host visible bytes of the allocation, if it is mapped.
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation.as_ref()?.mapped_slice()
    }

    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut()?.mapped_slice_mut()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        match self.allocator.alloc.lock() {
            Ok(mut alloc) => {
                if let Some(alloc) = alloc.as_mut() {
                    if let Err(err) = alloc.free(allocation) {
                        error!("Failed to free allocation: {err}");
                    }
                }
            }
            Err(_) => error!("Allocator mutex poisoned, leaking allocation"),
        }
    }
}
