//! Physical device selection.

use std::ffi::CStr;

use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::app_info::{AppSettings, QueueType};
use crate::backend::vulkan::instance::Instance;
use crate::backend::vulkan::util::wrap_c_str;
use crate::core::error::Error;

/// A queue family matched to one of the requested queues.
#[derive(Default, Debug, Copy, Clone)]
pub struct QueueInfo {
    pub queue_type: QueueType,
    /// Whether the family has none of the capabilities the request wanted to avoid.
    pub dedicated: bool,
    pub family_index: u32,
    /// Everything the family supports, not only what was requested.
    pub flags: vk::QueueFlags,
}

/// A GPU that satisfies the [`GPURequirements`](crate::backend::vulkan::GPURequirements) of the application.
#[derive(Default, Debug)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    extensions: Vec<String>,
    queue_families: Vec<vk::QueueFamilyProperties>,
    queues: Vec<QueueInfo>,
}

impl PhysicalDevice {
    /// Pick the first physical device matching the requirements in `settings`.
    /// # Errors
    /// * [`Error::NoGPU`] if no device qualifies.
    pub fn select(instance: &Instance, settings: &AppSettings) -> Result<Self> {
        let devices = unsafe { instance.enumerate_physical_devices()? };
        let requirements = &settings.gpu_requirements;

        devices
            .iter()
            .find_map(|device| -> Option<PhysicalDevice> {
                let mut physical_device = PhysicalDevice {
                    handle: *device,
                    properties: unsafe { instance.get_physical_device_properties(*device) },
                    memory_properties: unsafe { instance.get_physical_device_memory_properties(*device) },
                    extensions: unsafe { instance.enumerate_device_extension_properties(*device) }
                        .ok()?
                        .iter()
                        .map(|ext| unsafe { wrap_c_str(ext.extension_name.as_ptr()) })
                        .collect(),
                    queue_families: unsafe { instance.get_physical_device_queue_family_properties(*device) },
                    queues: vec![],
                };

                if requirements.dedicated && physical_device.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
                    return None;
                }
                if requirements.min_video_memory > physical_device.total_video_memory() {
                    return None;
                }
                if requirements.min_dedicated_video_memory > physical_device.total_device_memory() {
                    return None;
                }

                physical_device.queues = requirements
                    .queues
                    .iter()
                    .filter_map(|request| {
                        let avoid = if request.dedicated {
                            match request.queue_type {
                                QueueType::Graphics => vk::QueueFlags::COMPUTE,
                                QueueType::Compute => vk::QueueFlags::GRAPHICS,
                                QueueType::Transfer => {
                                    vk::QueueFlags::COMPUTE
                                        | vk::QueueFlags::GRAPHICS
                                        | vk::QueueFlags::OPTICAL_FLOW_NV
                                        | vk::QueueFlags::VIDEO_DECODE_KHR
                                        | vk::QueueFlags::VIDEO_ENCODE_KHR
                                }
                            }
                        } else {
                            vk::QueueFlags::empty()
                        };
                        let (index, dedicated) = queue_family_prefer_dedicated(&physical_device.queue_families, request.queue_type, avoid)?;
                        Some(QueueInfo {
                            queue_type: request.queue_type,
                            dedicated,
                            family_index: index as u32,
                            flags: physical_device.queue_families[index].queue_flags,
                        })
                    })
                    .collect();

                // Every request has to be matched.
                if physical_device.queues.len() < requirements.queues.len() {
                    return None;
                }

                if !requirements
                    .device_extensions
                    .iter()
                    .all(|requested| physical_device.extensions.iter().any(|ext| ext == requested))
                {
                    return None;
                }

                let name = unsafe { CStr::from_ptr(physical_device.properties.device_name.as_ptr()) };
                info!("Picked physical device {:?}, driver version {:?}.", name, physical_device.properties.driver_version);
                info!(
                    "Device has {} bytes of available video memory, of which {} are device local.",
                    physical_device.total_video_memory(),
                    physical_device.total_device_memory()
                );
                Some(physical_device)
            })
            .ok_or_else(|| Error::NoGPU.into())
    }

    pub fn queue_families(&self) -> &[vk::QueueFamilyProperties] {
        self.queue_families.as_slice()
    }

    /// Queues matched to the requests, in request order.
    pub fn queues(&self) -> &[QueueInfo] {
        self.queues.as_slice()
    }

    /// # Safety
    /// The handle is only valid while the instance is alive.
    pub unsafe fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        let name = name.to_string_lossy();
        self.extensions.iter().any(|ext| *ext == name)
    }

    fn total_video_memory(&self) -> usize {
        self.memory_properties.memory_heaps[..self.memory_properties.memory_heap_count as usize]
            .iter()
            .map(|heap| heap.size as usize)
            .sum()
    }

    fn total_device_memory(&self) -> usize {
        self.memory_properties.memory_heaps[..self.memory_properties.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size as usize)
            .sum()
    }
}

/// Index of the best family for `queue_type`, and whether it avoids every flag in `avoid`.
fn queue_family_prefer_dedicated(families: &[vk::QueueFamilyProperties], queue_type: QueueType, avoid: vk::QueueFlags) -> Option<(usize, bool)> {
    let required = vk::QueueFlags::from_raw(queue_type as vk::Flags);
    let candidates = || {
        families
            .iter()
            .enumerate()
            .filter(move |(_, family)| family.queue_flags.contains(required))
    };
    // intersects(), not contains(): a family is only dedicated if it has none of the flags to avoid.
    candidates()
        .find(|(_, family)| !family.queue_flags.intersects(avoid))
        .map(|(index, _)| (index, true))
        .or_else(|| candidates().next().map(|(index, _)| (index, false)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_dedicated_transfer_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let avoid = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        assert_eq!(queue_family_prefer_dedicated(&families, QueueType::Transfer, avoid), Some((1, true)));
    }

    #[test]
    fn falls_back_to_shared_family() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        assert_eq!(
            queue_family_prefer_dedicated(&families, QueueType::Compute, vk::QueueFlags::GRAPHICS),
            Some((0, false))
        );
        assert_eq!(queue_family_prefer_dedicated(&[], QueueType::Compute, vk::QueueFlags::GRAPHICS), None);
    }
}
