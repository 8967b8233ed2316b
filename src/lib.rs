//! Render graph on top of Vulkan
//!
//! Deimos records rendering work as *jobs*. Each job is recorded once into a [`BuildContext`], which collects
//! resource declarations and an abstract command stream. Building the [`JobGraph`] compiles every context into
//! native command lists, one per frame in flight and per combination of the job's flags, with all pipeline
//! barriers inserted automatically. At runtime jobs are only resubmitted, and the graph takes care of the
//! semaphores between them, both within a frame and across frames.
//!
//! To get started, the easiest way is to simply
//! ```
//! // Import all types
//! use deimos::prelude::*;
//! // Or, under a namespace
//! use deimos::prelude as dm;
//! ```
//!
//! # Example
//!
//! A graph is created over a [`Device`]. On real hardware this is a [`VulkanDevice`], see the
//! [`vulkan`](crate::backend::vulkan) module for how to create one. The [`RecordingDevice`] only records
//! what would have been sent to the GPU and is useful for tests.
//! ```
//! use deimos::prelude::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let shaders = InMemoryShaderLibrary::new()
//!     .with_shader("blur.comp", vec![0x07230203]);
//! let mut graph = JobGraph::new(RecordingDevice::new(), Box::new(shaders), vk::Extent2D { width: 1280, height: 720 });
//!
//! let blur = graph.add_job("blur")?;
//! blur.declare_screen_size_texture("blurred", vk::Format::R16G16B16A16_SFLOAT)?;
//! blur.bind_compute_shader("blur.comp");
//! blur.bind_rw_texture(0, "blurred")?;
//! blur.dispatch([1280 / 8, 720 / 8, 1])?;
//! blur.export_texture("blurred", vk::PipelineStageFlags2::FRAGMENT_SHADER, TextureState::ShaderRead, vk::ImageUsageFlags::SAMPLED)?;
//!
//! graph.build_jobs("blur")?;
//! graph.execute("blur", 0, None)?;
//! # Ok(())
//! # }
//! ```
//!
//! For further documentation, check out the following modules
//! - [`graph::build_context`] for the recording API.
//! - [`graph::pass`] for the passes that compile a job.
//! - [`graph::job_graph`] for dependencies, synchronization and execution.
//! - [`backend`] for the device abstraction and its implementations.

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod prelude;
pub use crate::prelude::*;

pub mod backend;
pub mod core;
pub mod graph;

/// Number of frames the CPU may record ahead of the GPU. Every job keeps one set of command lists per frame.
pub const FRAMES_IN_FLIGHT_COUNT: u32 = 3;
/// Number of descriptor slots per pipeline.
pub const MAX_DESCRIPTOR_COUNT: usize = 16;
/// Flags a single job may declare. Flag variants are selected with a `u32` mask.
pub const MAX_FLAG_COUNT: usize = 8;
/// Name of the built-in vertex shader used by [`BuildContext::draw_full_screen_quad`].
pub const FULL_SCREEN_QUAD_SHADER: &str = "full_screen_quad.vert";

const_assert!(FRAMES_IN_FLIGHT_COUNT >= 2);
const_assert!(MAX_FLAG_COUNT < u32::BITS as usize);
