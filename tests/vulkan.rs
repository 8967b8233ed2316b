use anyhow::Result;

use deimos::prelude::*;

mod framework;

fn make_device() -> Result<VulkanDevice> {
    framework::init_logging();
    let settings = AppBuilder::new()
        .name("deimos vulkan test")
        .validation(true)
        .gpu(GPURequirements {
            queues: vec![QueueRequest {
                dedicated: false,
                queue_type: QueueType::Graphics,
            }],
            ..Default::default()
        })
        .build();
    VulkanDevice::new(&settings)
}

// Needs a Vulkan 1.3 capable GPU.
#[test]
#[ignore]
fn transfer_jobs_run_on_hardware() -> Result<()> {
    let device = make_device()?;
    let mut graph = JobGraph::new(device.clone(), Box::new(framework::shader_library()), framework::SCREEN_SIZE);

    let upload = graph.add_job("upload")?;
    upload.declare_staging_buffer("staging", 256)?;
    upload.fill_buffer("staging", &[1u8; 256])?;
    upload.declare_buffer("particles", 256)?;
    upload.copy_buffer("staging", "particles")?;
    upload.declare_staging_buffer("readback", 256)?;
    upload.copy_buffer("particles", "readback")?;
    graph.add_self_dependency_to_previous_frame("upload");
    graph.build_jobs("upload")?;

    let mut surface = RenderSurface::new(graph)?;
    for _ in 0..deimos::FRAMES_IN_FLIGHT_COUNT + 1 {
        surface.render("upload")?;
    }
    device.wait_idle()?;

    let readback = surface.graph().resources().buffer(&"readback".into(), 0)?;
    let contents = readback.mapped_slice().ok_or_else(|| anyhow::anyhow!("readback buffer is not host visible"))?;
    assert!(contents.iter().all(|byte| *byte == 1));
    Ok(())
}
