use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::device::VulkanDevice;

/// Pipeline statistics gathered by a [`vk::QueryType::PIPELINE_STATISTICS`] pool, one value per flag.
pub const PIPELINE_STATISTICS: vk::QueryPipelineStatisticFlags = vk::QueryPipelineStatisticFlags::from_raw(
    vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_VERTICES.as_raw()
        | vk::QueryPipelineStatisticFlags::INPUT_ASSEMBLY_PRIMITIVES.as_raw()
        | vk::QueryPipelineStatisticFlags::VERTEX_SHADER_INVOCATIONS.as_raw()
        | vk::QueryPipelineStatisticFlags::CLIPPING_INVOCATIONS.as_raw()
        | vk::QueryPipelineStatisticFlags::CLIPPING_PRIMITIVES.as_raw()
        | vk::QueryPipelineStatisticFlags::FRAGMENT_SHADER_INVOCATIONS.as_raw()
        | vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS.as_raw(),
);

#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanQueryPool {
    #[derivative(Debug = "ignore")]
    device: VulkanDevice,
    handle: vk::QueryPool,
    ty: vk::QueryType,
    count: u32,
}

impl VulkanQueryPool {
    pub(crate) fn new(device: VulkanDevice, ty: vk::QueryType, count: u32) -> Result<Self> {
        let statistics = if ty == vk::QueryType::PIPELINE_STATISTICS {
            PIPELINE_STATISTICS
        } else {
            vk::QueryPipelineStatisticFlags::empty()
        };
        let info = vk::QueryPoolCreateInfo::builder()
            .query_type(ty)
            .query_count(count)
            .pipeline_statistics(statistics);
        let handle = unsafe { device.handle().create_query_pool(&info, None)? };
        // Queries have to be reset before their first use.
        unsafe { device.handle().reset_query_pool(handle, 0, count) };
        Ok(Self {
            device,
            handle,
            ty,
            count,
        })
    }

    /// # Safety
    /// The pool must not be destroyed through this handle.
    pub unsafe fn handle(&self) -> vk::QueryPool {
        self.handle
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    fn values_per_query(&self) -> usize {
        if self.ty == vk::QueryType::PIPELINE_STATISTICS {
            PIPELINE_STATISTICS.as_raw().count_ones() as usize
        } else {
            1
        }
    }

    /// Raw 64-bit results, waiting until they are available. Timestamps are converted to nanoseconds.
    pub(crate) fn results(&self, first: u32, count: u32) -> Result<Vec<u64>> {
        let mut data = vec![0u64; count as usize * self.values_per_query()];
        unsafe {
            self.device.handle().get_query_pool_results(
                self.handle,
                first,
                count,
                data.as_mut_slice(),
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
        }
        if self.ty == vk::QueryType::TIMESTAMP {
            let period = self.device.properties().limits.timestamp_period as f64;
            data.iter_mut().for_each(|value| *value = (*value as f64 * period) as u64);
        }
        Ok(data)
    }
}

impl Drop for VulkanQueryPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_query_pool(self.handle, None);
        }
    }
}
