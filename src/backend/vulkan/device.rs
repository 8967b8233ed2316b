use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString, NulError};
use std::fmt::Formatter;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::allocator::DefaultAllocator;
use crate::backend::vulkan::app_info::AppSettings;
use crate::backend::vulkan::command_list::{submit_info, VulkanCommandList};
use crate::backend::vulkan::debug::DebugMessenger;
use crate::backend::vulkan::descriptor::{write_descriptor_set, VulkanDescriptorPool, VulkanDescriptorSet};
use crate::backend::vulkan::instance::Instance;
use crate::backend::vulkan::physical_device::PhysicalDevice;
use crate::backend::vulkan::pipeline::VulkanPipeline;
use crate::backend::vulkan::query_pool::VulkanQueryPool;
use crate::backend::vulkan::queue::Queue;
use crate::backend::vulkan::resource::{VulkanBuffer, VulkanTexture, VulkanTextureView};
use crate::backend::vulkan::sync::{Fence, Semaphore};
use crate::backend::vulkan::util::unwrap_to_raw_strings;
use crate::backend::{BufferCreateInfo, DescriptorWrite, Device, GraphicsShaders, RayTracingShader, TextureCreateInfo};
use crate::core::error::Error;
use crate::graph::declaration::SamplerProperties;
use crate::graph::pipeline_state::{ComputePipelineState, GraphicsPipelineState, RayTracingPipelineState};

/// Optional device extensions deimos requests but that might not be available.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum ExtensionID {
    AccelerationStructure,
    RayTracingPipeline,
}

impl std::fmt::Display for ExtensionID {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The parts of `VkPhysicalDeviceRayTracingPipelinePropertiesKHR` needed to lay out a shader binding table.
#[derive(Debug, Copy, Clone)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct DeviceInner {
    #[derivative(Debug = "ignore")]
    handle: ash::Device,
    queues: Vec<Queue>,
    queue_families: Vec<u32>,
    properties: vk::PhysicalDeviceProperties,
    ray_tracing_properties: Option<RayTracingProperties>,
    extensions: HashSet<ExtensionID>,
    #[derivative(Debug = "ignore")]
    acceleration_structure: Option<ash::extensions::khr::AccelerationStructure>,
    #[derivative(Debug = "ignore")]
    ray_tracing_pipeline: Option<ash::extensions::khr::RayTracingPipeline>,
    allocator: DefaultAllocator,
    samplers: Mutex<HashMap<SamplerProperties, vk::Sampler>>,
    // Dropped before the instance it was created from.
    debug_messenger: Option<DebugMessenger>,
    physical_device: PhysicalDevice,
    instance: Instance,
}

/// Vulkan implementation of the [`Device`] trait. Owns the whole Vulkan context, from the instance down to the
/// allocator. Internal state lives in an `Arc`, so clones are cheap and every created object keeps the device alive.
///
/// # Example
/// ```no_run
/// # use deimos::prelude::*;
/// # fn main() -> anyhow::Result<()> {
/// let settings = AppBuilder::new().name("deimos").validation(true).build();
/// let device = VulkanDevice::new(&settings)?;
/// let graph = JobGraph::new(device, Box::new(DirectoryShaderLibrary::new("shaders")), vk::Extent2D { width: 1280, height: 720 });
/// # Ok(())
/// # }
/// ```
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct VulkanDevice {
    inner: Arc<DeviceInner>,
}

fn add_if_supported(ext: ExtensionID, name: &CStr, physical_device: &PhysicalDevice, enabled: &mut HashSet<ExtensionID>, names: &mut Vec<CString>) -> bool {
    if physical_device.supports_extension(name) {
        enabled.insert(ext);
        names.push(CString::from(name));
        true
    } else {
        info!(
            "Requested extension {} is not available. Some features might be missing.",
            name.to_bytes().escape_ascii()
        );
        false
    }
}

impl VulkanDevice {
    /// Initialize Vulkan: instance, debug messenger, physical device, logical device, queues and allocator.
    pub fn new(settings: &AppSettings) -> Result<Self> {
        if settings.gpu_requirements.queues.is_empty() {
            return Err(Error::NoCapableQueue(vk::QueueFlags::empty()).into());
        }
        let instance = Instance::new(settings)?;
        let debug_messenger = if instance.is_validation_enabled() {
            Some(DebugMessenger::new(&instance)?)
        } else {
            None
        };
        let physical_device = PhysicalDevice::select(&instance, settings)?;

        // Requests that land on the same family get consecutive queues, clamped to what the family offers.
        let mut queue_indices = Vec::with_capacity(physical_device.queues().len());
        let mut per_family: HashMap<u32, u32> = HashMap::new();
        for queue in physical_device.queues() {
            let available = physical_device.queue_families()[queue.family_index as usize].queue_count.max(1);
            let used = per_family.entry(queue.family_index).or_insert(0);
            queue_indices.push((*used).min(available - 1));
            *used = (*used + 1).min(available);
        }
        let mut families = per_family.iter().map(|(family, count)| (*family, *count)).collect::<Vec<_>>();
        families.sort();
        let max_count = families.iter().map(|(_, count)| *count).max().unwrap_or(1);
        let priorities = vec![1.0f32; max_count as usize];
        let queue_create_infos = families
            .iter()
            .map(|(family, count)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*family)
                    .queue_priorities(&priorities[..*count as usize])
                    .build()
            })
            .collect::<Vec<_>>();

        let mut extension_names = settings
            .gpu_requirements
            .device_extensions
            .iter()
            .map(|ext| CString::new(ext.clone()))
            .collect::<Result<Vec<CString>, NulError>>()?;
        let mut enabled_extensions = HashSet::new();
        let (accel_supported, rt_supported) = if settings.raytracing {
            let accel = add_if_supported(
                ExtensionID::AccelerationStructure,
                ash::extensions::khr::AccelerationStructure::name(),
                &physical_device,
                &mut enabled_extensions,
                &mut extension_names,
            );
            let rt = accel
                && add_if_supported(
                    ExtensionID::RayTracingPipeline,
                    ash::extensions::khr::RayTracingPipeline::name(),
                    &physical_device,
                    &mut enabled_extensions,
                    &mut extension_names,
                );
            if accel {
                extension_names.push(CString::from(ash::extensions::khr::DeferredHostOperations::name()));
            }
            (accel, rt)
        } else {
            (false, false)
        };

        info!("Enabled device extensions:");
        for ext in &extension_names {
            info!("{:?}", ext);
        }

        let mut features_1_1 = settings.gpu_requirements.features_1_1;
        let mut features_1_2 = settings.gpu_requirements.features_1_2;
        let mut features_1_3 = settings.gpu_requirements.features_1_3;
        features_1_2.buffer_device_address = vk::TRUE;
        features_1_2.host_query_reset = vk::TRUE;
        features_1_3.synchronization2 = vk::TRUE;
        features_1_3.dynamic_rendering = vk::TRUE;
        features_1_3.maintenance4 = vk::TRUE;
        let mut features_acceleration_structure = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut features_ray_tracing = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let extension_names_raw = unwrap_to_raw_strings(extension_names.as_slice());
        let mut info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(queue_create_infos.as_slice())
            .enabled_extension_names(extension_names_raw.as_slice())
            .enabled_features(&settings.gpu_requirements.features)
            .push_next(&mut features_1_1)
            .push_next(&mut features_1_2)
            .push_next(&mut features_1_3);
        if accel_supported {
            info = info.push_next(&mut features_acceleration_structure);
        }
        if rt_supported {
            info = info.push_next(&mut features_ray_tracing);
        }

        let handle = unsafe { instance.create_device(physical_device.handle(), &info, None)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkDevice {:p}", handle.handle());

        let allocator = DefaultAllocator::new(&instance, &handle, unsafe { physical_device.handle() })?;
        let queues = physical_device
            .queues()
            .iter()
            .zip(queue_indices)
            .map(|(info, index)| Queue::new(&handle, *info, index))
            .collect::<Result<Vec<_>>>()?;

        let acceleration_structure = accel_supported.then(|| ash::extensions::khr::AccelerationStructure::new(&instance, &handle));
        let ray_tracing_pipeline = rt_supported.then(|| ash::extensions::khr::RayTracingPipeline::new(&instance, &handle));
        let ray_tracing_properties = rt_supported.then(|| {
            let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut properties = vk::PhysicalDeviceProperties2::builder().push_next(&mut rt_properties);
            unsafe { instance.get_physical_device_properties2(physical_device.handle(), &mut properties) };
            RayTracingProperties {
                shader_group_handle_size: rt_properties.shader_group_handle_size,
                shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
                shader_group_base_alignment: rt_properties.shader_group_base_alignment,
            }
        });

        let mut queue_families = physical_device.queues().iter().map(|queue| queue.family_index).collect::<Vec<_>>();
        queue_families.sort();
        queue_families.dedup();

        Ok(Self {
            inner: Arc::new(DeviceInner {
                handle,
                queues,
                queue_families,
                properties: *physical_device.properties(),
                ray_tracing_properties,
                extensions: enabled_extensions,
                acceleration_structure,
                ray_tracing_pipeline,
                allocator,
                samplers: Mutex::new(HashMap::new()),
                debug_messenger,
                physical_device,
                instance,
            }),
        })
    }

    pub(crate) fn handle(&self) -> &ash::Device {
        &self.inner.handle
    }

    pub(crate) fn allocator(&self) -> &DefaultAllocator {
        &self.inner.allocator
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.inner.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.inner.properties
    }

    /// Unique queue family indices used by the requested queues.
    pub fn queue_families(&self) -> Vec<u32> {
        self.inner.queue_families.clone()
    }

    /// True if every queue lives in the same family, so resources never need concurrent sharing.
    pub fn is_single_queue(&self) -> bool {
        self.inner.queue_families.len() <= 1
    }

    pub(crate) fn queue(&self, index: usize) -> Result<&Queue> {
        self.inner
            .queues
            .get(index)
            .ok_or_else(|| Error::Uncategorized("queue index out of range").into())
    }

    /// Index of the first requested queue that supports all of `work_types`.
    pub fn queue_for(&self, work_types: vk::QueueFlags) -> Result<usize> {
        self.inner
            .queues
            .iter()
            .position(|queue| {
                let mut flags = queue.info().flags;
                if flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE) {
                    flags |= vk::QueueFlags::TRANSFER;
                }
                flags.contains(work_types)
            })
            .ok_or_else(|| Error::NoCapableQueue(work_types).into())
    }

    pub fn is_extension_enabled(&self, ext: ExtensionID) -> bool {
        self.inner.extensions.contains(&ext)
    }

    pub fn require_extension(&self, ext: ExtensionID) -> Result<()> {
        if self.is_extension_enabled(ext) {
            Ok(())
        } else {
            Err(Error::ExtensionNotSupported(ext).into())
        }
    }

    /// Function pointers for `VK_KHR_acceleration_structure`. Building acceleration structures is left to the
    /// application; the graph only binds them.
    pub fn acceleration_structure(&self) -> Option<&ash::extensions::khr::AccelerationStructure> {
        self.inner.acceleration_structure.as_ref()
    }

    pub fn ray_tracing_pipeline(&self) -> Option<&ash::extensions::khr::RayTracingPipeline> {
        self.inner.ray_tracing_pipeline.as_ref()
    }

    pub fn ray_tracing_properties(&self) -> Result<RayTracingProperties> {
        self.inner
            .ray_tracing_properties
            .ok_or_else(|| Error::ExtensionNotSupported(ExtensionID::RayTracingPipeline).into())
    }

    /// Cached sampler for `properties`. Samplers live as long as the device.
    pub(crate) fn sampler(&self, properties: &SamplerProperties) -> Result<vk::Sampler> {
        let mut samplers = self.inner.samplers.lock().map_err(|_| Error::PoisonError)?;
        if let Some(sampler) = samplers.get(properties) {
            return Ok(*sampler);
        }
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(properties.mag_filter)
            .min_filter(properties.min_filter)
            .mipmap_mode(properties.mipmap_mode)
            .address_mode_u(properties.address_mode)
            .address_mode_v(properties.address_mode)
            .address_mode_w(properties.address_mode)
            .anisotropy_enable(properties.max_anisotropy.is_some())
            .max_anisotropy(properties.max_anisotropy.unwrap_or(1.0))
            .min_lod(properties.min_lod)
            .max_lod(if properties.max_lod == 0.0 {
                vk::LOD_CLAMP_NONE
            } else {
                properties.max_lod
            });
        let sampler = unsafe { self.inner.handle.create_sampler(&info, None)? };
        samplers.insert(*properties, sampler);
        Ok(sampler)
    }

    /// Attach a debug name to a Vulkan object. Only does something with validation enabled.
    pub(crate) fn set_name<H: vk::Handle>(&self, handle: H, name: &str) {
        if !cfg!(feature = "debug-markers") {
            return;
        }
        let Some(debug) = self.inner.debug_messenger.as_ref() else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);
        if let Err(err) = unsafe { debug.functions().set_debug_utils_object_name(self.inner.handle.handle(), &info) } {
            warn!("Failed to name object {name:?}: {err}");
        }
    }

    pub(crate) fn begin_label(&self, command_buffer: vk::CommandBuffer, name: &str) {
        let (Some(debug), Ok(name)) = (self.inner.debug_messenger.as_ref(), CString::new(name)) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name);
        unsafe { debug.functions().cmd_begin_debug_utils_label(command_buffer, &label) };
    }

    pub(crate) fn end_label(&self, command_buffer: vk::CommandBuffer) {
        if let Some(debug) = self.inner.debug_messenger.as_ref() {
            unsafe { debug.functions().cmd_end_debug_utils_label(command_buffer) };
        }
    }

    /// Wait for the device to be completely idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { Ok(self.inner.handle.device_wait_idle()?) }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.handle.device_wait_idle() {
                error!("vkDeviceWaitIdle failed while destroying the device: {err}");
            }
            if let Ok(samplers) = self.samplers.get_mut() {
                for (_, sampler) in samplers.drain() {
                    self.handle.destroy_sampler(sampler, None);
                }
            }
            for queue in &self.queues {
                queue.destroy(&self.handle);
            }
            self.allocator.destroy();
            #[cfg(feature = "log-objects")]
            trace!("Destroying VkDevice {:p}", self.handle.handle());
            self.handle.destroy_device(None);
        }
    }
}

impl Device for VulkanDevice {
    type Buffer = VulkanBuffer;
    type Texture = VulkanTexture;
    type TextureView = VulkanTextureView;
    type Semaphore = Semaphore;
    type Fence = Fence;
    type CommandList = VulkanCommandList;
    type DescriptorPool = VulkanDescriptorPool;
    type DescriptorSet = VulkanDescriptorSet;
    type Pipeline = VulkanPipeline;
    type QueryPool = VulkanQueryPool;

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<VulkanBuffer> {
        VulkanBuffer::new(self.clone(), info)
    }

    fn create_texture(&self, info: &TextureCreateInfo) -> Result<VulkanTexture> {
        VulkanTexture::new(self.clone(), info)
    }

    fn create_texture_view(&self, texture: &VulkanTexture, mip: u32) -> Result<VulkanTextureView> {
        VulkanTextureView::new(self.clone(), texture, mip)
    }

    fn create_semaphore(&self) -> Result<Semaphore> {
        Ok(Semaphore::new(self.clone())?)
    }

    fn create_fence(&self, signaled: bool) -> Result<Fence> {
        Ok(Fence::new(self.clone(), signaled)?)
    }

    fn wait_for_fence(&self, fence: &Fence) -> Result<()> {
        unsafe { self.handle().wait_for_fences(&[fence.handle()], true, u64::MAX)? };
        Ok(())
    }

    fn reset_fence(&self, fence: &Fence) -> Result<()> {
        unsafe { self.handle().reset_fences(&[fence.handle()])? };
        Ok(())
    }

    fn create_command_list(&self, work_types: vk::QueueFlags, name: &str) -> Result<VulkanCommandList> {
        let queue = self.queue_for(work_types)?;
        VulkanCommandList::new(self.clone(), queue, name)
    }

    fn submit(&self, list: &VulkanCommandList, wait: &[&Semaphore], signal: &[&Semaphore], fence: Option<&Fence>) -> Result<()> {
        let wait = submit_info(wait);
        let signal = submit_info(signal);
        let command_buffers = [vk::CommandBufferSubmitInfo::builder()
            .command_buffer(unsafe { list.handle() })
            .build()];
        let submit = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(&wait)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signal);
        let fence = fence.map_or(vk::Fence::null(), |fence| unsafe { fence.handle() });
        let queue = self.queue(list.queue_index())?.handle()?;
        unsafe { self.handle().queue_submit2(*queue, std::slice::from_ref(&submit), fence)? };
        Ok(())
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<VulkanDescriptorPool> {
        VulkanDescriptorPool::new(self.clone(), sizes, max_sets)
    }

    fn allocate_descriptor_set(&self, pool: &VulkanDescriptorPool, pipeline: &VulkanPipeline) -> Result<VulkanDescriptorSet> {
        pool.allocate(pipeline)
    }

    fn write_descriptor_set(&self, set: &VulkanDescriptorSet, writes: &[DescriptorWrite<'_, Self>]) -> Result<()> {
        write_descriptor_set(self, set, writes)
    }

    fn create_graphics_pipeline(&self, state: &GraphicsPipelineState, shaders: &GraphicsShaders) -> Result<VulkanPipeline> {
        VulkanPipeline::graphics(self.clone(), state, shaders)
    }

    fn create_compute_pipeline(&self, state: &ComputePipelineState, shader: &[u32]) -> Result<VulkanPipeline> {
        VulkanPipeline::compute(self.clone(), state, shader)
    }

    fn create_ray_tracing_pipeline(&self, state: &RayTracingPipelineState, shaders: &[RayTracingShader]) -> Result<VulkanPipeline> {
        VulkanPipeline::ray_tracing(self.clone(), state, shaders)
    }

    fn create_query_pool(&self, ty: vk::QueryType, count: u32) -> Result<VulkanQueryPool> {
        VulkanQueryPool::new(self.clone(), ty, count)
    }

    fn query_results(&self, pool: &VulkanQueryPool, first: u32, count: u32) -> Result<Vec<u64>> {
        pool.results(first, count)
    }

    fn await_all(&self) -> Result<()> {
        self.wait_idle()
    }
}
