//! Buffers and textures created by the Vulkan backend.

use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::allocator::Allocation;
use crate::backend::vulkan::device::VulkanDevice;
use crate::backend::{BufferCreateInfo, DeviceBuffer, DeviceTexture, MemoryType, TextureCreateInfo};
use crate::graph::declaration::is_depth_format;

/// A `VkBuffer` with its own memory allocation.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanBuffer {
    #[derivative(Debug = "ignore")]
    device: VulkanDevice,
    handle: vk::Buffer,
    #[derivative(Debug = "ignore")]
    memory: Allocation,
    size: u64,
    usage: vk::BufferUsageFlags,
    memory_type: MemoryType,
    address: vk::DeviceAddress,
}

impl VulkanBuffer {
    pub(crate) fn new(device: VulkanDevice, info: &BufferCreateInfo) -> Result<Self> {
        let sharing_mode = if device.is_single_queue() {
            vk::SharingMode::EXCLUSIVE
        } else {
            vk::SharingMode::CONCURRENT
        };
        let families = device.queue_families();
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(info.size.max(1))
            .usage(info.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(families.as_slice());
        let handle = unsafe { device.handle().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(handle) };
        let memory = device.allocator().allocate(info.name, &requirements, info.memory, true)?;
        unsafe { device.handle().bind_buffer_memory(handle, memory.memory(), memory.offset())? };

        let address = if info.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let address_info = vk::BufferDeviceAddressInfo::builder().buffer(handle);
            unsafe { device.handle().get_buffer_device_address(&address_info) }
        } else {
            0
        };
        device.set_name(handle, info.name);

        #[cfg(feature = "log-objects")]
        trace!("Created new VkBuffer {handle:p} ({}, {} bytes)", info.name, info.size);

        Ok(Self {
            device,
            handle,
            memory,
            size: info.size,
            usage: info.usage,
            memory_type: info.memory,
            address,
        })
    }

    /// # Safety
    /// The buffer must not be destroyed through this handle.
    pub unsafe fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Device address, or zero if the buffer was not created with `SHADER_DEVICE_ADDRESS` usage.
    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    /// Host visible contents, for buffers in [`MemoryType::CpuToGpu`] or [`MemoryType::GpuToCpu`] memory.
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        let size = self.size as usize;
        self.memory.mapped_slice().map(|slice| &slice[..size])
    }

    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        let size = self.size as usize;
        self.memory.mapped_slice_mut().map(|slice| &mut slice[..size])
    }
}

impl DeviceBuffer for VulkanBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkBuffer {:p}", self.handle);
        unsafe {
            self.device.handle().destroy_buffer(self.handle, None);
        }
    }
}

fn aspect_of(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

fn create_view(device: &VulkanDevice, image: vk::Image, format: vk::Format, base_mip: u32, mip_count: u32) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_of(format),
            base_mip_level: base_mip,
            level_count: mip_count,
            base_array_layer: 0,
            layer_count: 1,
        });
    Ok(unsafe { device.handle().create_image_view(&info, None)? })
}

/// A 2D `VkImage` together with a view covering all of its mips.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanTexture {
    #[derivative(Debug = "ignore")]
    device: VulkanDevice,
    handle: vk::Image,
    view: vk::ImageView,
    #[derivative(Debug = "ignore")]
    memory: Allocation,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    mip_count: u32,
}

impl VulkanTexture {
    pub(crate) fn new(device: VulkanDevice, info: &TextureCreateInfo) -> Result<Self> {
        let families = device.queue_families();
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(vk::Extent3D {
                width: info.extent.width.max(1),
                height: info.extent.height.max(1),
                depth: 1,
            })
            .mip_levels(info.mip_count.max(1))
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(if device.is_single_queue() {
                vk::SharingMode::EXCLUSIVE
            } else {
                vk::SharingMode::CONCURRENT
            })
            .queue_family_indices(families.as_slice())
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = unsafe { device.handle().create_image(&image_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(handle) };
        let memory = device.allocator().allocate(info.name, &requirements, MemoryType::GpuOnly, false)?;
        unsafe { device.handle().bind_image_memory(handle, memory.memory(), memory.offset())? };
        let view = create_view(&device, handle, info.format, 0, info.mip_count.max(1))?;
        device.set_name(handle, info.name);

        #[cfg(feature = "log-objects")]
        trace!("Created new VkImage {handle:p} ({}, {}x{})", info.name, info.extent.width, info.extent.height);

        Ok(Self {
            device,
            handle,
            view,
            memory,
            extent: info.extent,
            format: info.format,
            usage: info.usage,
            mip_count: info.mip_count.max(1),
        })
    }

    /// # Safety
    /// The image must not be destroyed through this handle.
    pub unsafe fn handle(&self) -> vk::Image {
        self.handle
    }

    /// # Safety
    /// The view must not be destroyed through this handle.
    pub unsafe fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_of(self.format)
    }
}

impl DeviceTexture for VulkanTexture {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.format
    }

    fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    fn mip_count(&self) -> u32 {
        self.mip_count
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkImage {:p}", self.handle);
        unsafe {
            self.device.handle().destroy_image_view(self.view, None);
            self.device.handle().destroy_image(self.handle, None);
        }
    }
}

/// View of a single mip level of a [`VulkanTexture`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanTextureView {
    #[derivative(Debug = "ignore")]
    device: VulkanDevice,
    handle: vk::ImageView,
    mip: u32,
}

impl VulkanTextureView {
    pub(crate) fn new(device: VulkanDevice, texture: &VulkanTexture, mip: u32) -> Result<Self> {
        let handle = create_view(&device, texture.handle, texture.format, mip, 1)?;
        Ok(Self {
            device,
            handle,
            mip,
        })
    }

    /// # Safety
    /// The view must not be destroyed through this handle.
    pub unsafe fn handle(&self) -> vk::ImageView {
        self.handle
    }

    pub fn mip(&self) -> u32 {
        self.mip
    }
}

impl Drop for VulkanTextureView {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_image_view(self.handle, None);
        }
    }
}
