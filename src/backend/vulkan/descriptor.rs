//! Descriptor pools, sets and descriptor writes.

use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::device::VulkanDevice;
use crate::backend::vulkan::pipeline::VulkanPipeline;
use crate::backend::vulkan::resource::VulkanBuffer;
use crate::backend::{DescriptorResource, DescriptorWrite, ImageBinding};
use crate::core::error::Error;
use crate::graph::declaration::SamplerProperties;
use crate::graph::state::TextureState;

/// Pool a job allocates all of its descriptor sets from. Sets are never freed individually.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanDescriptorPool {
    #[derivative(Debug = "ignore")]
    device: VulkanDevice,
    handle: vk::DescriptorPool,
}

impl VulkanDescriptorPool {
    pub(crate) fn new(device: VulkanDevice, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<Self> {
        let info = vk::DescriptorPoolCreateInfo::builder().pool_sizes(sizes).max_sets(max_sets);
        let handle = unsafe { device.handle().create_descriptor_pool(&info, None)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkDescriptorPool {handle:p} ({max_sets} sets)");
        Ok(Self {
            device,
            handle,
        })
    }

    pub(crate) fn allocate(&self, pipeline: &VulkanPipeline) -> Result<VulkanDescriptorSet> {
        let layouts = [pipeline.set_layout()];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.handle)
            .set_layouts(&layouts);
        let handle = unsafe { self.device.handle().allocate_descriptor_sets(&info)? }
            .into_iter()
            .next()
            .ok_or(Error::Uncategorized("descriptor set allocation returned no sets"))?;
        Ok(VulkanDescriptorSet {
            handle,
        })
    }
}

impl Drop for VulkanDescriptorPool {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkDescriptorPool {:p}", self.handle);
        unsafe {
            self.device.handle().destroy_descriptor_pool(self.handle, None);
        }
    }
}

/// Descriptor set owned by its pool.
#[derive(Debug)]
pub struct VulkanDescriptorSet {
    handle: vk::DescriptorSet,
}

impl VulkanDescriptorSet {
    /// # Safety
    /// The set is only valid while the pool it was allocated from is alive.
    pub unsafe fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }
}

enum WriteInfo {
    Images(vk::DescriptorType, Vec<vk::DescriptorImageInfo>),
    Buffers(vk::DescriptorType, Vec<vk::DescriptorBufferInfo>),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

fn image_view(image: &ImageBinding<VulkanDevice>) -> vk::ImageView {
    unsafe {
        match image {
            ImageBinding::Whole(texture) => texture.view(),
            ImageBinding::Mip(view) => view.handle(),
        }
    }
}

fn buffer_info(buffer: &VulkanBuffer, offset: u64, range: Option<u64>) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo {
        buffer: unsafe { buffer.handle() },
        offset,
        range: range.unwrap_or(vk::WHOLE_SIZE),
    }
}

fn write_info(device: &VulkanDevice, resource: &DescriptorResource<VulkanDevice>) -> Result<WriteInfo> {
    let storage_layout = TextureState::General.layout();
    let sampled_layout = TextureState::ShaderRead.layout();
    let sampled = |image: &ImageBinding<VulkanDevice>, sampler: &SamplerProperties| -> Result<vk::DescriptorImageInfo> {
        Ok(vk::DescriptorImageInfo {
            sampler: device.sampler(sampler)?,
            image_view: image_view(image),
            image_layout: sampled_layout,
        })
    };
    Ok(match resource {
        DescriptorResource::StorageImage(image) => WriteInfo::Images(
            vk::DescriptorType::STORAGE_IMAGE,
            vec![vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: image_view(image),
                image_layout: storage_layout,
            }],
        ),
        DescriptorResource::CombinedImageSampler(image, sampler) => {
            WriteInfo::Images(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vec![sampled(image, sampler)?])
        }
        DescriptorResource::SampledImage(image) => WriteInfo::Images(
            vk::DescriptorType::SAMPLED_IMAGE,
            vec![vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: image_view(image),
                image_layout: sampled_layout,
            }],
        ),
        DescriptorResource::SampledImageArray(images) => WriteInfo::Images(
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            images
                .iter()
                .map(|(image, sampler)| sampled(image, sampler))
                .collect::<Result<Vec<_>>>()?,
        ),
        DescriptorResource::UniformBuffer {
            buffer,
            offset,
            range,
        } => WriteInfo::Buffers(vk::DescriptorType::UNIFORM_BUFFER, vec![buffer_info(buffer, *offset, *range)]),
        DescriptorResource::UniformBufferArray(buffers) => WriteInfo::Buffers(
            vk::DescriptorType::UNIFORM_BUFFER,
            buffers.iter().map(|buffer| buffer_info(buffer, 0, None)).collect(),
        ),
        DescriptorResource::StorageBuffer(buffer) => WriteInfo::Buffers(vk::DescriptorType::STORAGE_BUFFER, vec![buffer_info(buffer, 0, None)]),
        DescriptorResource::AccelerationStructure(handle) => WriteInfo::AccelerationStructure(*handle),
    })
}

pub(crate) fn write_descriptor_set(device: &VulkanDevice, set: &VulkanDescriptorSet, writes: &[DescriptorWrite<VulkanDevice>]) -> Result<()> {
    let infos = writes
        .iter()
        .map(|write| write_info(device, &write.resource))
        .collect::<Result<Vec<_>>>()?;
    // The acceleration structure chain points into `infos`, which is not touched after this point.
    let mut acceleration_structures = infos
        .iter()
        .map(|info| match info {
            WriteInfo::AccelerationStructure(handle) => vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                .acceleration_structures(std::slice::from_ref(handle))
                .build(),
            _ => vk::WriteDescriptorSetAccelerationStructureKHR::default(),
        })
        .collect::<Vec<_>>();

    let vk_writes = writes
        .iter()
        .zip(infos.iter())
        .zip(acceleration_structures.iter_mut())
        .map(|((write, info), accel)| {
            let base = vk::WriteDescriptorSet::builder()
                .dst_set(set.handle)
                .dst_binding(write.binding)
                .dst_array_element(0);
            match info {
                WriteInfo::Images(ty, images) => base.descriptor_type(*ty).image_info(images).build(),
                WriteInfo::Buffers(ty, buffers) => base.descriptor_type(*ty).buffer_info(buffers).build(),
                WriteInfo::AccelerationStructure(_) => {
                    let mut write = base
                        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                        .push_next(accel)
                        .build();
                    write.descriptor_count = 1;
                    write
                }
            }
        })
        .collect::<Vec<_>>();

    unsafe { device.handle().update_descriptor_sets(&vk_writes, &[]) };
    Ok(())
}
