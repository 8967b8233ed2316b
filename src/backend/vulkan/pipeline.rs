//! Pipeline objects created from the pipeline states the build context accumulates.

use std::ffi::CStr;

use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::device::{ExtensionID, VulkanDevice};
use crate::backend::vulkan::resource::VulkanBuffer;
use crate::backend::vulkan::util::align_up;
use crate::backend::{BufferCreateInfo, GraphicsShaders, MemoryType, RayTracingShader};
use crate::core::error::Error;
use crate::core::name::Name;
use crate::graph::pipeline_state::{
    push_constant_range, ComputePipelineState, DepthTestMode, DescriptorState, GraphicsPipelineState, PushConstantDesc, RayTracingPipelineState,
    RayTracingShaderGroupType,
};

/// Regions of the shader binding table passed to `vkCmdTraceRaysKHR`.
#[derive(Debug)]
pub struct ShaderBindingTable {
    // Kept alive for the regions pointing into it.
    _buffer: VulkanBuffer,
    pub(crate) ray_gen: vk::StridedDeviceAddressRegionKHR,
    pub(crate) miss: vk::StridedDeviceAddressRegionKHR,
    pub(crate) hit: vk::StridedDeviceAddressRegionKHR,
    pub(crate) callable: vk::StridedDeviceAddressRegionKHR,
}

/// A pipeline together with its layout and the layout of its single descriptor set.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanPipeline {
    #[derivative(Debug = "ignore")]
    device: VulkanDevice,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    bind_point: vk::PipelineBindPoint,
    sbt: Option<ShaderBindingTable>,
}

impl VulkanPipeline {
    /// # Safety
    /// The pipeline must not be destroyed through this handle.
    pub unsafe fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub(crate) fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub(crate) fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    pub(crate) fn shader_binding_table(&self) -> Option<&ShaderBindingTable> {
        self.sbt.as_ref()
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkPipeline {:p}", self.handle);
        unsafe {
            let device = self.device.handle();
            device.destroy_pipeline(self.handle, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

fn entry_point() -> Result<&'static CStr> {
    Ok(CStr::from_bytes_with_nul(b"main\0")?)
}

/// Shader modules only live until the pipeline is created.
struct ShaderModules<'d> {
    device: &'d ash::Device,
    modules: Vec<vk::ShaderModule>,
}

impl<'d> ShaderModules<'d> {
    fn new(device: &'d ash::Device) -> Self {
        Self {
            device,
            modules: vec![],
        }
    }

    fn create(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);
        let module = unsafe { self.device.create_shader_module(&info, None)? };
        self.modules.push(module);
        Ok(module)
    }
}

impl Drop for ShaderModules<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }
}

struct Layouts {
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
}

fn create_layouts(device: &ash::Device, descriptors: &DescriptorState, push_constants: &[PushConstantDesc], default_stages: vk::ShaderStageFlags) -> Result<Layouts> {
    let bindings = descriptors
        .active()
        .iter()
        .enumerate()
        .map(|(binding, info)| vk::DescriptorSetLayoutBinding {
            binding: binding as u32,
            descriptor_type: info.ty,
            descriptor_count: info.count,
            stage_flags: if info.stages.is_empty() {
                default_stages
            } else {
                info.stages
            },
            p_immutable_samplers: std::ptr::null(),
        })
        .collect::<Vec<_>>();
    let set_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    let set_layout = unsafe { device.create_descriptor_set_layout(&set_info, None)? };

    let ranges = push_constant_range(push_constants).into_iter().collect::<Vec<_>>();
    let set_layouts = [set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&ranges);
    let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
        Ok(layout) => layout,
        Err(err) => {
            unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
            return Err(Error::from(err).into());
        }
    };
    Ok(Layouts {
        set_layout,
        layout,
    })
}

fn destroy_layouts(device: &ash::Device, layouts: &Layouts) {
    unsafe {
        device.destroy_pipeline_layout(layouts.layout, None);
        device.destroy_descriptor_set_layout(layouts.set_layout, None);
    }
}

impl VulkanPipeline {
    fn from_parts(device: VulkanDevice, handle: vk::Pipeline, layouts: Layouts, bind_point: vk::PipelineBindPoint, sbt: Option<ShaderBindingTable>) -> Self {
        #[cfg(feature = "log-objects")]
        trace!("Created new VkPipeline {handle:p}");
        Self {
            device,
            handle,
            layout: layouts.layout,
            set_layout: layouts.set_layout,
            bind_point,
            sbt,
        }
    }

    pub(crate) fn graphics(device: VulkanDevice, state: &GraphicsPipelineState, shaders: &GraphicsShaders) -> Result<Self> {
        let vk_device = device.handle().clone();
        let mut modules = ShaderModules::new(&vk_device);
        let entry = entry_point()?;
        let mut stages = vec![vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(modules.create(shaders.vertex)?)
            .name(entry)
            .build()];
        if let Some(fragment) = shaders.fragment {
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(modules.create(fragment)?)
                    .name(entry)
                    .build(),
            );
        }

        let layouts = create_layouts(&vk_device, &state.descriptor_state, &state.push_constants, vk::ShaderStageFlags::ALL_GRAPHICS)?;

        let vertex_bindings = if state.vertex_layout.attributes.is_empty() {
            vec![]
        } else {
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: state.vertex_layout.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }]
        };
        let vertex_attributes = state
            .vertex_layout
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: 0,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect::<Vec<_>>();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder().topology(state.topology);
        // Viewport and scissor are dynamic, only the counts matter here.
        let viewport = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(state.line_width);
        let multisample = vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let has_depth = state.depth_target_format.is_some();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(has_depth && state.depth_test != DepthTestMode::Disabled)
            .depth_write_enable(has_depth && state.depth_test == DepthTestMode::Enabled)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let blend_attachments = state
            .render_target_formats
            .iter()
            .map(|_| vk::PipelineColorBlendAttachmentState {
                blend_enable: state.blending as vk::Bool32,
                src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
                dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
                color_blend_op: vk::BlendOp::ADD,
                src_alpha_blend_factor: vk::BlendFactor::ONE,
                dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
                alpha_blend_op: vk::BlendOp::ADD,
                color_write_mask: vk::ColorComponentFlags::RGBA,
            })
            .collect::<Vec<_>>();
        let blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);
        let mut rendering = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&state.render_target_formats)
            .depth_attachment_format(state.depth_target_format.unwrap_or(vk::Format::UNDEFINED));

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(layouts.layout)
            .push_next(&mut rendering);

        let result = unsafe { vk_device.create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None) };
        let handle = match result {
            Ok(pipelines) => pipelines.first().copied(),
            Err((_, err)) => {
                destroy_layouts(&vk_device, &layouts);
                return Err(Error::VkError(err).into());
            }
        };
        let handle = handle.ok_or(Error::Uncategorized("pipeline creation returned no pipelines"))?;
        Ok(Self::from_parts(device, handle, layouts, vk::PipelineBindPoint::GRAPHICS, None))
    }

    pub(crate) fn compute(device: VulkanDevice, state: &ComputePipelineState, shader: &[u32]) -> Result<Self> {
        let vk_device = device.handle().clone();
        let mut modules = ShaderModules::new(&vk_device);
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(modules.create(shader)?)
            .name(entry_point()?)
            .build();
        let layouts = create_layouts(&vk_device, &state.descriptor_state, &state.push_constants, vk::ShaderStageFlags::COMPUTE)?;
        let info = vk::ComputePipelineCreateInfo::builder().stage(stage).layout(layouts.layout);

        let result = unsafe { vk_device.create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None) };
        let handle = match result {
            Ok(pipelines) => pipelines.first().copied(),
            Err((_, err)) => {
                destroy_layouts(&vk_device, &layouts);
                return Err(Error::VkError(err).into());
            }
        };
        let handle = handle.ok_or(Error::Uncategorized("pipeline creation returned no pipelines"))?;
        Ok(Self::from_parts(device, handle, layouts, vk::PipelineBindPoint::COMPUTE, None))
    }

    pub(crate) fn ray_tracing(device: VulkanDevice, state: &RayTracingPipelineState, shaders: &[RayTracingShader]) -> Result<Self> {
        device.require_extension(ExtensionID::RayTracingPipeline)?;
        let functions = device
            .ray_tracing_pipeline()
            .ok_or(Error::ExtensionNotSupported(ExtensionID::RayTracingPipeline))?
            .clone();
        let vk_device = device.handle().clone();
        let mut modules = ShaderModules::new(&vk_device);
        let entry = entry_point()?;
        let stages = shaders
            .iter()
            .map(|shader| -> Result<vk::PipelineShaderStageCreateInfo> {
                Ok(vk::PipelineShaderStageCreateInfo::builder()
                    .stage(shader.stage)
                    .module(modules.create(shader.code)?)
                    .name(entry)
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;

        let groups = shader_groups(state, shaders)?;
        let vk_groups = groups.iter().map(|group| group.info).collect::<Vec<_>>();

        let layouts = create_layouts(&vk_device, &state.descriptor_state, &state.push_constants, vk::ShaderStageFlags::ALL)?;
        let info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&vk_groups)
            .max_pipeline_ray_recursion_depth(state.max_recursion)
            .layout(layouts.layout);

        let result = unsafe {
            functions.create_ray_tracing_pipelines(vk::DeferredOperationKHR::null(), vk::PipelineCache::null(), std::slice::from_ref(&info), None)
        };
        let handle = match result {
            Ok(pipelines) => pipelines.first().copied(),
            Err(err) => {
                destroy_layouts(&vk_device, &layouts);
                return Err(Error::from(err).into());
            }
        };
        let handle = handle.ok_or(Error::Uncategorized("pipeline creation returned no pipelines"))?;
        let sbt = match ShaderBindingTable::new(&device, &functions, handle, &groups) {
            Ok(sbt) => sbt,
            Err(err) => {
                unsafe { vk_device.destroy_pipeline(handle, None) };
                destroy_layouts(&vk_device, &layouts);
                return Err(err);
            }
        };
        Ok(Self::from_parts(device, handle, layouts, vk::PipelineBindPoint::RAY_TRACING_KHR, Some(sbt)))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupRegion {
    RayGen,
    Miss,
    Hit,
}

struct ShaderGroup {
    region: GroupRegion,
    info: vk::RayTracingShaderGroupCreateInfoKHR,
}

fn general_group(region: GroupRegion, shader: u32) -> ShaderGroup {
    ShaderGroup {
        region,
        info: vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(shader)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
    }
}

fn hit_group(closest_hit: u32) -> ShaderGroup {
    ShaderGroup {
        region: GroupRegion::Hit,
        info: vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(closest_hit)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
    }
}

fn region_of(stage: vk::ShaderStageFlags) -> GroupRegion {
    if stage == vk::ShaderStageFlags::RAYGEN_KHR {
        GroupRegion::RayGen
    } else if stage == vk::ShaderStageFlags::MISS_KHR {
        GroupRegion::Miss
    } else {
        GroupRegion::Hit
    }
}

/// Shader groups sorted by binding table region. Without explicit groups every shader gets a group of its own.
fn shader_groups(state: &RayTracingPipelineState, shaders: &[RayTracingShader]) -> Result<Vec<ShaderGroup>> {
    let mut groups = if state.shader_groups.is_empty() {
        shaders
            .iter()
            .enumerate()
            .map(|(index, shader)| match region_of(shader.stage) {
                GroupRegion::Hit => hit_group(index as u32),
                region => general_group(region, index as u32),
            })
            .collect::<Vec<_>>()
    } else {
        let find = |name: &Option<Name>| -> Result<(u32, vk::ShaderStageFlags)> {
            let name = name
                .as_ref()
                .ok_or(Error::Uncategorized("shader group without a shader"))?;
            shaders
                .iter()
                .position(|shader| shader.name == name)
                .map(|index| (index as u32, shaders[index].stage))
                .ok_or_else(|| Error::ShaderNotFound(name.clone()).into())
        };
        state
            .shader_groups
            .iter()
            .map(|group| -> Result<ShaderGroup> {
                Ok(match group.ty {
                    RayTracingShaderGroupType::General => {
                        let (index, stage) = find(&group.general_shader)?;
                        general_group(region_of(stage), index)
                    }
                    RayTracingShaderGroupType::Triangles => hit_group(find(&group.closest_hit_shader)?.0),
                })
            })
            .collect::<Result<Vec<_>>>()?
    };
    groups.sort_by_key(|group| group.region);
    Ok(groups)
}

impl ShaderBindingTable {
    fn new(device: &VulkanDevice, functions: &ash::extensions::khr::RayTracingPipeline, pipeline: vk::Pipeline, groups: &[ShaderGroup]) -> Result<Self> {
        let properties = device.ray_tracing_properties()?;
        let handle_size = properties.shader_group_handle_size as u64;
        let stride = align_up(handle_size, properties.shader_group_handle_alignment.max(1) as u64);
        let base_alignment = properties.shader_group_base_alignment.max(1) as u64;

        let count = |region: GroupRegion| groups.iter().filter(|group| group.region == region).count() as u64;
        let counts = [count(GroupRegion::RayGen), count(GroupRegion::Miss), count(GroupRegion::Hit)];
        let region_sizes = counts.map(|count| align_up(count * stride, base_alignment));
        let size = region_sizes.iter().sum::<u64>() + base_alignment;

        let group_count = groups.len() as u32;
        let handles = unsafe { functions.get_ray_tracing_shader_group_handles(pipeline, 0, group_count, (group_count as u64 * handle_size) as usize)? };

        let mut buffer = VulkanBuffer::new(
            device.clone(),
            &BufferCreateInfo {
                name: "shader binding table",
                size,
                usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                memory: MemoryType::CpuToGpu,
            },
        )?;
        let address = buffer.address();
        let start = align_up(address, base_alignment) - address;

        let mut region_offsets = [0u64; 3];
        let mut offset = start;
        for (region, region_size) in region_offsets.iter_mut().zip(region_sizes) {
            *region = offset;
            offset += region_size;
        }

        let mapped = buffer
            .mapped_slice_mut()
            .ok_or(Error::Uncategorized("shader binding table memory is not host visible"))?;
        // Groups are sorted by region, so each region is a contiguous run of handles.
        let mut group = 0usize;
        for (region, count) in counts.iter().enumerate() {
            for slot in 0..*count {
                let dst = (region_offsets[region] + slot * stride) as usize;
                let src = group * handle_size as usize;
                mapped[dst..dst + handle_size as usize].copy_from_slice(&handles[src..src + handle_size as usize]);
                group += 1;
            }
        }

        let region = |index: usize, size: u64| vk::StridedDeviceAddressRegionKHR {
            device_address: if counts[index] == 0 {
                0
            } else {
                address + region_offsets[index]
            },
            stride: if index == 0 {
                size
            } else {
                stride
            },
            size,
        };
        Ok(Self {
            ray_gen: region(0, stride * counts[0].min(1)),
            miss: region(1, stride * counts[1]),
            hit: region(2, stride * counts[2]),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
            _buffer: buffer,
        })
    }
}
