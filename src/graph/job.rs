//! Compiled jobs.

use anyhow::Result;
use ash::vk;

use crate::backend::Device;
use crate::core::error::Error;
use crate::core::name::Name;
use crate::FRAMES_IN_FLIGHT_COUNT;

/// Everything a job records for one frame in flight.
pub struct JobFrame<D: Device> {
    /// Descriptor sets written while recording, kept alive for as long as the command lists referencing them.
    pub descriptor_sets: Vec<D::DescriptorSet>,
    /// One command list per flag combination, indexed by the enabled flag mask.
    pub command_lists: Vec<D::CommandList>,
}

/// A compiled [`BuildContext`](crate::BuildContext). Jobs are immutable apart from their enabled flags:
/// toggling a flag only changes which pre-recorded command list is submitted.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Job<D: Device> {
    // Fields drop in declaration order: command lists and sets go before the pool they were allocated from.
    #[derivative(Debug = "ignore")]
    frames: Vec<JobFrame<D>>,
    #[derivative(Debug = "ignore")]
    descriptor_pool: Option<D::DescriptorPool>,
    work_types: vk::QueueFlags,
    flags: Vec<Name>,
    enabled_flags: u32,
    #[derivative(Debug = "ignore")]
    device: D,
}

impl<D: Device> Job<D> {
    pub(crate) fn new(device: D, descriptor_pool: Option<D::DescriptorPool>, frames: Vec<JobFrame<D>>, work_types: vk::QueueFlags, flags: Vec<Name>) -> Self {
        Self {
            frames,
            descriptor_pool,
            work_types,
            flags,
            enabled_flags: 0,
            device,
        }
    }

    fn flag_bit(&self, flag: &Name) -> Option<u32> {
        self.flags.iter().position(|f| f == flag).map(|index| 1 << index)
    }

    fn flag_bit_or_err(&self, job: &Name, flag: &Name) -> Result<u32> {
        self.flag_bit(flag).ok_or_else(|| {
            Error::FlagNotDeclared {
                job: job.clone(),
                flag: flag.clone(),
            }
            .into()
        })
    }

    /// Enable a flag. `job` is only used to report errors.
    pub fn enable_flag(&mut self, job: &Name, flag: &Name) -> Result<()> {
        self.enabled_flags |= self.flag_bit_or_err(job, flag)?;
        Ok(())
    }

    pub fn disable_flag(&mut self, job: &Name, flag: &Name) -> Result<()> {
        self.enabled_flags &= !self.flag_bit_or_err(job, flag)?;
        Ok(())
    }

    pub fn is_flag_enabled(&self, flag: &Name) -> bool {
        self.flag_bit(flag).map_or(false, |bit| self.enabled_flags & bit != 0)
    }

    /// Bitmask of the enabled flags, in declaration order.
    pub fn enabled_flags(&self) -> u32 {
        self.enabled_flags
    }

    pub fn variation_count(&self) -> u32 {
        1 << self.flags.len()
    }

    pub fn work_types(&self) -> vk::QueueFlags {
        self.work_types
    }

    pub fn has_descriptor_pool(&self) -> bool {
        self.descriptor_pool.is_some()
    }

    pub fn command_list(&self, frame: u32, variant: u32) -> Option<&D::CommandList> {
        self.frames.get(frame as usize)?.command_lists.get(variant as usize)
    }

    pub fn descriptor_sets(&self, frame: u32) -> &[D::DescriptorSet] {
        self.frames
            .get(frame as usize)
            .map(|frame| frame.descriptor_sets.as_slice())
            .unwrap_or_default()
    }

    /// Submit the command list of the enabled flag variant for `frame`.
    pub fn execute(&self, frame: u32, wait: &[&D::Semaphore], signal: &[&D::Semaphore], fence: Option<&D::Fence>) -> Result<()> {
        if frame >= FRAMES_IN_FLIGHT_COUNT {
            return Err(Error::InvalidFrameIndex(frame).into());
        }
        let list = self
            .command_list(frame, self.enabled_flags)
            .ok_or(Error::Uncategorized("job is missing a command list variant"))?;
        self.device.submit(list, wait, signal, fence)
    }
}
