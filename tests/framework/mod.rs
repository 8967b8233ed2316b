#![allow(dead_code)]

use anyhow::Result;

use deimos::prelude::*;

pub const SCREEN_SIZE: vk::Extent2D = vk::Extent2D {
    width: 800,
    height: 600,
};

/// Any non-empty word stream is accepted by the recording device.
const DUMMY_SPIRV: u32 = 0x07230203;

/// Every shader name used by the integration tests.
pub const SHADERS: &[&str] = &[
    deimos::FULL_SCREEN_QUAD_SHADER,
    "triangle.vert",
    "triangle.frag",
    "post.frag",
    "cull.comp",
    "shade.comp",
    "downsample.comp",
    "debug.comp",
];

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

pub fn shader_library() -> InMemoryShaderLibrary {
    SHADERS
        .iter()
        .fold(InMemoryShaderLibrary::new(), |library, name| library.with_shader(*name, vec![DUMMY_SPIRV]))
}

/// Creates a graph over a recording device. The returned device shares its log with the one owned by the graph.
pub fn make_graph() -> (RecordingDevice, JobGraph<RecordingDevice>) {
    init_logging();
    let device = RecordingDevice::new();
    let graph = JobGraph::new(device.clone(), Box::new(shader_library()), SCREEN_SIZE);
    (device, graph)
}

/// Native calls recorded for a job, frame and flag variant.
pub fn calls(graph: &JobGraph<RecordingDevice>, job: &str, frame: u32, variant: u32) -> Result<Vec<NativeCall>> {
    let list = graph
        .job(job)
        .and_then(|job| job.command_list(frame, variant))
        .ok_or_else(|| anyhow::anyhow!("no command list for {job}, frame {frame}, variant {variant}"))?;
    Ok(list.calls().to_vec())
}

pub fn dispatch_count(calls: &[NativeCall]) -> usize {
    calls.iter().filter(|call| matches!(call, NativeCall::Dispatch(_))).count()
}

pub fn texture_barriers(calls: &[NativeCall]) -> Vec<(usize, deimos::backend::TextureBarrierInfo)> {
    calls
        .iter()
        .enumerate()
        .filter_map(|(index, call)| match call {
            NativeCall::TextureBarrier {
                info, ..
            } => Some((index, *info)),
            _ => None,
        })
        .collect()
}

pub fn buffer_barriers(calls: &[NativeCall]) -> Vec<deimos::backend::BufferBarrierInfo> {
    calls
        .iter()
        .filter_map(|call| match call {
            NativeCall::BufferBarrier {
                info, ..
            } => Some(*info),
            _ => None,
        })
        .collect()
}

/// Extents of every texture created under `name`, in creation order.
pub fn texture_extents(device: &RecordingDevice, name: &str) -> Result<Vec<vk::Extent2D>> {
    Ok(device
        .textures()?
        .into_iter()
        .filter(|texture| texture.name == name)
        .map(|texture| texture.extent)
        .collect())
}
