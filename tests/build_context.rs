use anyhow::Result;
use glam::{Mat4, Vec4};

use deimos::prelude::*;

mod framework;

fn record_conditional_dispatches(graph: &mut JobGraph<RecordingDevice>) -> Result<()> {
    let ctx = graph.add_job("cull")?;
    ctx.declare_flag("debug")?;
    ctx.declare_flag("skip_tail")?;
    ctx.bind_compute_shader("cull.comp");
    ctx.dispatch([1, 1, 1])?;
    ctx.if_enabled("debug")?;
    ctx.bind_compute_shader("debug.comp");
    ctx.dispatch([2, 1, 1])?;
    ctx.end_if()?;
    ctx.if_disabled("skip_tail")?;
    ctx.dispatch([3, 1, 1])?;
    ctx.end_if()?;
    Ok(())
}

#[test]
fn every_flag_combination_is_prebuilt() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    record_conditional_dispatches(&mut graph)?;
    assert_eq!(graph.context("cull").map(BuildContext::flag_variation_count), Some(4));
    graph.build_jobs("cull")?;

    // Bit 0 is `debug`, bit 1 is `skip_tail`.
    let expected = [2, 3, 1, 2];
    for frame in 0..deimos::FRAMES_IN_FLIGHT_COUNT {
        for (variant, count) in expected.iter().enumerate() {
            let calls = framework::calls(&graph, "cull", frame, variant as u32)?;
            assert_eq!(framework::dispatch_count(&calls), *count, "frame {frame}, variant {variant}");
        }
        assert!(graph.job("cull").and_then(|job| job.command_list(frame, 4)).is_none());
    }
    Ok(())
}

#[test]
fn enabled_flags_select_the_submitted_variant() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    record_conditional_dispatches(&mut graph)?;
    graph.build_jobs("cull")?;

    graph.enable_flag("cull", "debug")?;
    graph.execute("cull", 0, None)?;
    graph.enable_flag("cull", "skip_tail")?;
    graph.disable_flag("cull", "debug")?;
    graph.execute("cull", 1, None)?;

    let job = graph.job("cull").expect("cull is built");
    let submissions = device.submissions()?;
    assert_eq!(submissions.len(), 2);
    assert_eq!(Some(submissions[0].command_list), job.command_list(0, 0b01).map(RecordedCommandList::id));
    assert_eq!(Some(submissions[1].command_list), job.command_list(1, 0b10).map(RecordedCommandList::id));

    let err = graph.enable_flag("cull", "missing").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::FlagNotDeclared { .. })));
    Ok(())
}

#[test]
fn open_condition_fails_the_build() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("cull")?;
    ctx.declare_flag("debug")?;
    ctx.if_enabled("debug")?;
    ctx.bind_compute_shader("cull.comp");
    ctx.dispatch([1, 1, 1])?;

    let err = graph.build_jobs("cull").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnbalancedCondition(_))));
    Ok(())
}

#[test]
fn screen_relative_resources_follow_resizes() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    let ctx = graph.add_job("bloom")?;
    ctx.declare_proportional_texture("half", vk::Format::R16G16B16A16_SFLOAT, 0.5, false)?;
    ctx.declare_texture("lut", vk::Extent2D { width: 32, height: 32 }, vk::Format::R8G8B8A8_UNORM)?;
    ctx.declare_proportional_buffer("histogram", 0.25, 4)?;
    graph.build_jobs("bloom")?;

    let half = vk::Extent2D {
        width: 400,
        height: 300,
    };
    assert_eq!(framework::texture_extents(&device, "half")?, vec![half; 3]);

    graph.resize(vk::Extent2D { width: 1024, height: 768 })?;
    assert_eq!(device.await_all_calls()?, 1);

    let resized = vk::Extent2D {
        width: 512,
        height: 384,
    };
    assert_eq!(framework::texture_extents(&device, "half")?, [vec![half; 3], vec![resized; 3]].concat());
    // Fixed size textures are kept across resizes.
    assert_eq!(framework::texture_extents(&device, "lut")?.len(), 3);

    let histogram: Vec<u64> = device
        .buffers()?
        .into_iter()
        .filter(|buffer| buffer.name == "histogram")
        .map(|buffer| buffer.size)
        .collect();
    let (before, after) = (800 * 600 / 4 * 4, 1024 * 768 / 4 * 4);
    assert_eq!(histogram, [vec![before; 3], vec![after; 3]].concat());
    Ok(())
}

#[test]
fn reads_after_a_barrier_share_it() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("shade")?;
    ctx.init_buffer("lights", &[1u8; 64])?;
    ctx.bind_compute_shader("cull.comp");
    ctx.bind_uniform_buffer(0, "lights")?;
    ctx.dispatch([1, 1, 1])?;
    ctx.bind_compute_shader("shade.comp");
    ctx.bind_uniform_buffer(0, "lights")?;
    ctx.dispatch([1, 1, 1])?;
    graph.build_jobs("shade")?;

    let barriers = framework::buffer_barriers(&framework::calls(&graph, "shade", 0, 0)?);
    assert_eq!(barriers.len(), 2, "one barrier for the upload, one for both reads");
    assert_eq!(barriers[0].dst_access, vk::AccessFlags2::TRANSFER_WRITE);
    assert_eq!(barriers[1].src_stages, vk::PipelineStageFlags2::TRANSFER);
    assert_eq!(barriers[1].dst_stages, vk::PipelineStageFlags2::COMPUTE_SHADER);
    assert_eq!(barriers[1].src_access, vk::AccessFlags2::TRANSFER_WRITE);
    assert_eq!(barriers[1].dst_access, vk::AccessFlags2::UNIFORM_READ);
    Ok(())
}

#[test]
fn read_only_buffers_need_no_barrier() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("shade")?;
    ctx.declare_buffer("params", 256)?;
    ctx.bind_compute_shader("cull.comp");
    ctx.bind_uniform_buffer(0, "params")?;
    ctx.dispatch([1, 1, 1])?;
    ctx.bind_compute_shader("shade.comp");
    ctx.bind_uniform_buffer(0, "params")?;
    ctx.dispatch([1, 1, 1])?;
    graph.build_jobs("shade")?;

    assert!(framework::buffer_barriers(&framework::calls(&graph, "shade", 0, 0)?).is_empty());
    Ok(())
}

#[test]
fn barriers_never_land_inside_a_render_pass() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("forward")?;
    ctx.declare_screen_size_texture("albedo", vk::Format::R8G8B8A8_UNORM)?;
    ctx.declare_render_target("color", vk::Format::R8G8B8A8_UNORM)?;

    ctx.bind_compute_shader("shade.comp");
    ctx.bind_rw_texture(0, "albedo")?;
    ctx.dispatch([100, 75, 1])?;

    ctx.begin_render_pass("main", ["color"])?;
    ctx.bind_vertex_shader("triangle.vert");
    ctx.bind_fragment_shader("triangle.frag");
    ctx.bind_samplable_texture(0, "albedo")?;
    ctx.draw_primitives(3, 0, 1, 0)?;
    ctx.end_render_pass();
    graph.build_jobs("forward")?;

    let calls = framework::calls(&graph, "forward", 0, 0)?;
    let begin = calls
        .iter()
        .position(|call| matches!(call, NativeCall::BeginRendering { .. }))
        .expect("render pass is recorded");
    let barriers = framework::texture_barriers(&calls);
    assert_eq!(barriers.len(), 3);
    assert!(barriers.iter().all(|(index, _)| *index < begin));

    let (_, read) = barriers
        .iter()
        .find(|(_, info)| info.src_state == TextureState::General)
        .expect("storage to sampled transition");
    assert_eq!(read.dst_state, TextureState::ShaderRead);
    assert_eq!(read.src_stages, vk::PipelineStageFlags2::COMPUTE_SHADER);
    assert_eq!(read.dst_stages, vk::PipelineStageFlags2::FRAGMENT_SHADER);

    let (_, target) = barriers
        .iter()
        .find(|(_, info)| info.dst_state == TextureState::RenderTarget)
        .expect("render target transition");
    assert_eq!(target.src_state, TextureState::Undefined);
    assert_eq!(target.dst_stages, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
    Ok(())
}

#[test]
fn render_pass_attachments_follow_their_targets() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("forward")?;
    ctx.declare_render_target("color", vk::Format::R8G8B8A8_UNORM)?;
    ctx.declare_depth_target("depth", vk::Format::D32_SFLOAT)?;
    ctx.clear_color("color", [0.1, 0.2, 0.3, 1.0])?;
    ctx.begin_render_pass("main", ["color", "depth"])?;
    ctx.bind_vertex_shader("triangle.vert");
    ctx.bind_fragment_shader("triangle.frag");
    ctx.draw_primitives(3, 0, 1, 0)?;
    ctx.end_render_pass();
    graph.build_jobs("forward")?;

    let calls = framework::calls(&graph, "forward", 0, 0)?;
    let Some(NativeCall::BeginRendering {
        colors,
        depth,
        extent,
        ..
    }) = calls.iter().find(|call| matches!(call, NativeCall::BeginRendering { .. }))
    else {
        panic!("render pass is recorded");
    };
    assert_eq!(colors.len(), 1);
    assert_eq!((colors[0].1, colors[0].2), (vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE));
    assert!(depth.is_some());
    assert_eq!(*extent, framework::SCREEN_SIZE);

    let depth_target = graph.context("forward").and_then(|ctx| ctx.render_target("depth")).copied();
    assert_eq!(depth_target.map(|target| target.store_op()), Some(vk::AttachmentStoreOp::DONT_CARE));
    Ok(())
}

#[test]
fn mips_are_tracked_separately() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    let ctx = graph.add_job("bloom")?;
    ctx.declare_proportional_texture("bloom", vk::Format::R16G16B16A16_SFLOAT, 0.5, true)?;
    ctx.bind_compute_shader("downsample.comp");
    ctx.bind_samplable_texture(0, TextureRef::mip("bloom", 0))?;
    ctx.bind_rw_texture(1, TextureRef::mip("bloom", 1))?;
    ctx.dispatch([50, 38, 1])?;
    ctx.bind_compute_shader("shade.comp");
    ctx.bind_samplable_texture(0, "bloom")?;
    ctx.dispatch([100, 75, 1])?;
    graph.build_jobs("bloom")?;

    // 400x300 has a chain of 9 mips.
    let created = device.textures()?;
    assert!(created.iter().filter(|texture| texture.name == "bloom").all(|texture| texture.mip_count == 9));

    let barriers: Vec<_> = framework::texture_barriers(&framework::calls(&graph, "bloom", 0, 0)?)
        .into_iter()
        .map(|(_, info)| info)
        .collect();
    let has = |src: TextureState, dst: TextureState, base_mip: u32, mip_count: u32| {
        barriers
            .iter()
            .any(|info| info.src_state == src && info.dst_state == dst && info.base_mip == base_mip && info.mip_count == mip_count)
    };
    assert!(has(TextureState::Undefined, TextureState::ShaderRead, 0, 1));
    assert!(has(TextureState::Undefined, TextureState::General, 1, 1));
    assert!(has(TextureState::General, TextureState::ShaderRead, 1, 1));
    assert!(has(TextureState::Undefined, TextureState::ShaderRead, 2, 7));
    Ok(())
}

#[test]
fn descriptor_pool_covers_every_variant() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    let ctx = graph.add_job("forward")?;
    ctx.declare_flag("ssao")?;
    ctx.declare_screen_size_texture("albedo", vk::Format::R8G8B8A8_UNORM)?;
    ctx.declare_buffer("camera", 64)?;
    ctx.bind_compute_shader("shade.comp");
    ctx.bind_rw_texture(0, "albedo")?;
    ctx.bind_uniform_buffer(1, "camera")?;
    ctx.dispatch([1, 1, 1])?;
    ctx.bind_fragment_shader("post.frag");
    ctx.bind_samplable_texture(0, "albedo")?;
    ctx.draw_full_screen_quad()?;
    graph.build_jobs("forward")?;

    let pools = device.descriptor_pools()?;
    assert_eq!(pools.len(), 1);
    // Two sets per recording, for three frames in flight and two flag variants.
    assert_eq!(pools[0].max_sets, 2 * 3 * 2);
    assert_eq!(
        pools[0].sizes,
        vec![
            (vk::DescriptorType::STORAGE_IMAGE, 6),
            (vk::DescriptorType::UNIFORM_BUFFER, 6),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 6),
        ]
    );
    assert!(graph.job("forward").map_or(false, Job::has_descriptor_pool));
    Ok(())
}

#[test]
fn jobs_without_descriptors_have_no_pool() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    let ctx = graph.add_job("cull")?;
    ctx.bind_compute_shader("cull.comp");
    ctx.dispatch([1, 1, 1])?;
    graph.build_jobs("cull")?;

    assert!(device.descriptor_pools()?.is_empty());
    assert!(graph.job("cull").map_or(false, |job| !job.has_descriptor_pool()));
    Ok(())
}

#[test]
fn identical_pipeline_states_are_shared() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    for job in ["a", "b"] {
        let ctx = graph.add_job(job)?;
        ctx.declare_render_target("color", vk::Format::R8G8B8A8_UNORM)?;
        ctx.begin_render_pass("main", ["color"])?;
        ctx.bind_vertex_shader("triangle.vert");
        ctx.bind_fragment_shader("triangle.frag");
        ctx.draw_primitives(3, 0, 1, 0)?;
        ctx.bind_vertex_shader("triangle.vert");
        ctx.bind_fragment_shader("triangle.frag");
        ctx.draw_primitives(6, 3, 1, 0)?;
        ctx.end_render_pass();
    }
    graph.add_dependency("b", "a");
    graph.build_jobs("b")?;

    assert_eq!(device.pipelines()?.len(), 1);
    assert_eq!(graph.pipeline_cache().len(), 1);

    let binds = framework::calls(&graph, "b", 0, 0)?
        .iter()
        .filter(|call| matches!(call, NativeCall::BindPipeline(_)))
        .count();
    assert_eq!(binds, 1, "the second draw reuses the bound pipeline");

    let ctx = graph.add_job("c")?;
    ctx.declare_render_target("color", vk::Format::R8G8B8A8_UNORM)?;
    ctx.begin_render_pass("main", ["color"])?;
    ctx.bind_vertex_shader("triangle.vert");
    ctx.bind_fragment_shader("triangle.frag");
    ctx.set_line_width(2.0);
    ctx.draw_primitives(3, 0, 1, 0)?;
    ctx.end_render_pass();
    graph.build_jobs("c")?;
    assert_eq!(device.pipelines()?.len(), 2);
    Ok(())
}

#[test]
fn push_constants_are_uploaded_together() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("forward")?;
    ctx.declare_render_target("color", vk::Format::R8G8B8A8_UNORM)?;
    ctx.begin_render_pass("main", ["color"])?;
    ctx.bind_vertex_shader("triangle.vert");
    ctx.push_constant_value(&Mat4::IDENTITY);
    ctx.bind_fragment_shader("triangle.frag");
    ctx.push_constant_value(&Vec4::new(1.0, 0.5, 0.25, 1.0));
    ctx.draw_primitives(3, 0, 1, 0)?;
    ctx.end_render_pass();
    graph.build_jobs("forward")?;

    let calls = framework::calls(&graph, "forward", 0, 0)?;
    let pushes: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            NativeCall::PushConstants {
                stages,
                offset,
                data,
                ..
            } => Some((*stages, *offset, data.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(pushes.len(), 1);
    let (stages, offset, data) = &pushes[0];
    assert_eq!(*stages, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);
    assert_eq!(*offset, 0);
    assert_eq!(data.len(), 64 + 16);
    let color: Vec<u8> = [1.0f32, 0.5, 0.25, 1.0].iter().flat_map(|value| value.to_ne_bytes()).collect();
    assert_eq!(&data[64..], color.as_slice());

    let push = calls.iter().position(|call| matches!(call, NativeCall::PushConstants { .. }));
    let draw = calls.iter().position(|call| matches!(call, NativeCall::Draw { .. }));
    assert!(push < draw);
    Ok(())
}

#[test]
fn missing_shader_fails_the_build() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("cull")?;
    ctx.bind_compute_shader("not_compiled.comp");
    ctx.dispatch([1, 1, 1])?;

    let err = graph.build_jobs("cull").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ShaderNotFound(_))));
    Ok(())
}

#[test]
fn exports_leave_resources_in_their_final_state() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("simulate")?;
    ctx.init_buffer("vertices", &[1u8; 64])?;
    ctx.export_buffer(
        "vertices",
        vk::PipelineStageFlags2::VERTEX_INPUT,
        vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        vk::BufferUsageFlags::VERTEX_BUFFER,
    )?;
    ctx.declare_screen_size_texture("lit", vk::Format::R16G16B16A16_SFLOAT)?;
    ctx.bind_compute_shader("shade.comp");
    ctx.bind_rw_texture(0, "lit")?;
    ctx.dispatch([100, 75, 1])?;
    ctx.export_texture("lit", vk::PipelineStageFlags2::FRAGMENT_SHADER, TextureState::ShaderRead, vk::ImageUsageFlags::SAMPLED)?;
    graph.build_jobs("simulate")?;

    let calls = framework::calls(&graph, "simulate", 0, 0)?;
    let buffers = framework::buffer_barriers(&calls);
    assert_eq!(buffers.len(), 2, "one barrier for the upload, one for the export");
    assert_eq!(buffers[1].src_stages, vk::PipelineStageFlags2::TRANSFER);
    assert_eq!(buffers[1].dst_stages, vk::PipelineStageFlags2::VERTEX_INPUT);
    assert_eq!(buffers[1].src_access, vk::AccessFlags2::TRANSFER_WRITE);
    assert_eq!(buffers[1].dst_access, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ);

    let textures = framework::texture_barriers(&calls);
    assert_eq!(textures.len(), 2);
    let (index, export) = textures[1];
    assert_eq!((export.src_state, export.dst_state), (TextureState::General, TextureState::ShaderRead));
    assert_eq!(export.src_stages, vk::PipelineStageFlags2::COMPUTE_SHADER);
    assert_eq!(export.dst_stages, vk::PipelineStageFlags2::FRAGMENT_SHADER);
    let dispatch = calls
        .iter()
        .position(|call| matches!(call, NativeCall::Dispatch(_)))
        .expect("dispatch is recorded");
    assert!(dispatch < index, "the export transition follows the last use");
    Ok(())
}

#[test]
fn last_frame_references_select_the_previous_instance() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("taa")?;
    ctx.declare_screen_size_texture("history", vk::Format::R16G16B16A16_SFLOAT)?;
    ctx.copy_texture(TextureRef::last_frame("history"), "history")?;
    ctx.declare_buffer("particles", 64)?;
    ctx.declare_buffer("previous", 64)?;
    ctx.copy_buffer(BufferRef::last_frame("particles"), "previous")?;
    graph.build_jobs("taa")?;

    let resources = graph.resources();
    let texture = |frame: u32| resources.texture(&"history".into(), frame).map(|texture| texture.id());
    let buffer = |name: &str, frame: u32| resources.buffer(&name.into(), frame).map(|buffer| buffer.id());

    for (frame, previous) in [(0, 2), (1, 0), (2, 1)] {
        let calls = framework::calls(&graph, "taa", frame, 0)?;
        let barriers: Vec<u64> = calls
            .iter()
            .filter_map(|call| match call {
                NativeCall::TextureBarrier {
                    texture, ..
                } => Some(*texture),
                _ => None,
            })
            .collect();
        assert_eq!(barriers, vec![texture(previous)?, texture(frame)?], "frame {frame}");
        assert!(calls.contains(&NativeCall::CopyTexture {
            src: texture(previous)?,
            dst: texture(frame)?,
        }));
        assert!(calls.contains(&NativeCall::CopyBuffer {
            src: buffer("particles", previous)?,
            dst: buffer("previous", frame)?,
        }));
    }
    Ok(())
}

#[test]
fn imported_resources_are_used_without_barriers() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    let environment = device.create_texture(&TextureCreateInfo {
        name: "environment",
        extent: vk::Extent2D { width: 64, height: 64 },
        format: vk::Format::R8G8B8A8_UNORM,
        usage: vk::ImageUsageFlags::TRANSFER_SRC,
        mip_count: 1,
    })?;
    let readback = device.create_buffer(&BufferCreateInfo {
        name: "readback",
        size: 64 * 64 * 4,
        usage: vk::BufferUsageFlags::TRANSFER_DST,
        memory: MemoryType::GpuToCpu,
    })?;
    let (texture_id, buffer_id) = (environment.id(), readback.id());
    let texture = graph.resources_mut().import_texture(environment);
    let buffer = graph.resources_mut().import_buffer(readback);

    let ctx = graph.add_job("capture")?;
    ctx.copy_texture_to_buffer(TextureRef::Imported(texture), BufferRef::Imported(buffer))?;
    graph.build_jobs("capture")?;

    for frame in 0..deimos::FRAMES_IN_FLIGHT_COUNT {
        let calls = framework::calls(&graph, "capture", frame, 0)?;
        assert_eq!(calls, vec![NativeCall::CopyTextureToBuffer { src: texture_id, dst: buffer_id }]);
    }
    assert_eq!(graph.resources_mut().release_buffer(buffer).map(|buffer| buffer.id()), Some(buffer_id));
    assert!(graph.resources_mut().release_buffer(buffer).is_none());
    Ok(())
}

#[test]
fn queries_are_recorded_into_the_shared_pools() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("cull")?;
    ctx.reset_timestamp_queries(0, 2);
    ctx.reset_pipeline_queries(0, 1);
    ctx.query_timestamp(0, false);
    ctx.begin_query(0);
    ctx.bind_compute_shader("cull.comp");
    ctx.dispatch([1, 1, 1])?;
    ctx.end_query(0);
    ctx.query_timestamp(1, true);
    graph.build_jobs("cull")?;

    let timestamps = graph.resources().timestamp_pool()?.id;
    let statistics = graph.resources().pipeline_stats_pool()?.id;
    assert_ne!(timestamps, statistics);

    let calls = framework::calls(&graph, "cull", 0, 0)?;
    let queries: Vec<NativeCall> = calls
        .iter()
        .filter(|call| {
            matches!(
                call,
                NativeCall::ResetQueries { .. } | NativeCall::WriteTimestamp { .. } | NativeCall::BeginQuery { .. } | NativeCall::EndQuery { .. }
            )
        })
        .cloned()
        .collect();
    assert_eq!(
        queries,
        vec![
            NativeCall::ResetQueries { pool: timestamps, first: 0, count: 2 },
            NativeCall::ResetQueries { pool: statistics, first: 0, count: 1 },
            NativeCall::WriteTimestamp { stage: vk::PipelineStageFlags2::TOP_OF_PIPE, pool: timestamps, index: 0 },
            NativeCall::BeginQuery { pool: statistics, index: 0 },
            NativeCall::EndQuery { pool: statistics, index: 0 },
            NativeCall::WriteTimestamp { stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE, pool: timestamps, index: 1 },
        ]
    );

    let begin = calls.iter().position(|call| matches!(call, NativeCall::BeginQuery { .. }));
    let dispatch = calls.iter().position(|call| matches!(call, NativeCall::Dispatch(_)));
    let end = calls.iter().position(|call| matches!(call, NativeCall::EndQuery { .. }));
    assert!(begin < dispatch && dispatch < end);
    assert_eq!(graph.resources().timestamps(0, 2)?, vec![0, 0]);
    Ok(())
}

#[test]
fn texture_copies_transition_both_sides() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("copies")?;
    ctx.declare_screen_size_texture("a", vk::Format::R8G8B8A8_UNORM)?;
    ctx.declare_screen_size_texture("b", vk::Format::R8G8B8A8_UNORM)?;
    ctx.declare_texture("c", vk::Extent2D { width: 256, height: 256 }, vk::Format::R8G8B8A8_UNORM)?;
    ctx.copy_texture("a", "b")?;
    ctx.copy_texture_region("b", vk::Offset2D { x: 0, y: 0 }, "c", vk::Offset2D { x: 16, y: 16 }, vk::Extent2D { width: 128, height: 128 })?;
    ctx.blit_texture("c", "a")?;
    graph.build_jobs("copies")?;

    let id = |name: &str| graph.resources().texture(&name.into(), 0).map(|texture| texture.id());
    let (a, b, c) = (id("a")?, id("b")?, id("c")?);

    let calls = framework::calls(&graph, "copies", 0, 0)?;
    let barriers: Vec<(usize, u64, TextureState, TextureState)> = calls
        .iter()
        .enumerate()
        .filter_map(|(index, call)| match call {
            NativeCall::TextureBarrier {
                texture,
                info,
            } => Some((index, *texture, info.src_state, info.dst_state)),
            _ => None,
        })
        .collect();
    let transitions: Vec<_> = barriers.iter().map(|(_, texture, src, dst)| (*texture, *src, *dst)).collect();
    assert_eq!(
        transitions,
        vec![
            (a, TextureState::Undefined, TextureState::TransferSrc),
            (b, TextureState::Undefined, TextureState::TransferDst),
            (b, TextureState::TransferDst, TextureState::TransferSrc),
            (c, TextureState::Undefined, TextureState::TransferDst),
            (c, TextureState::TransferDst, TextureState::TransferSrc),
            (a, TextureState::TransferSrc, TextureState::TransferDst),
        ]
    );

    let copy = calls.iter().position(|call| *call == NativeCall::CopyTexture { src: a, dst: b });
    let region = calls.iter().position(|call| {
        *call
            == NativeCall::CopyTextureRegion {
                src: b,
                src_offset: vk::Offset2D { x: 0, y: 0 },
                dst: c,
                dst_offset: vk::Offset2D { x: 16, y: 16 },
                extent: vk::Extent2D { width: 128, height: 128 },
            }
    });
    let blit = calls.iter().position(|call| *call == NativeCall::BlitTexture { src: c, dst: a });
    // Every transfer comes right after its pair of barriers.
    for (pair, transfer) in [copy, region, blit].into_iter().enumerate() {
        let transfer = transfer.ok_or_else(|| anyhow::anyhow!("transfer {pair} not recorded"))?;
        assert!(barriers[pair * 2 + 1].0 < transfer);
        if let Some(next) = barriers.get(pair * 2 + 2) {
            assert!(transfer < next.0);
        }
    }
    Ok(())
}

#[test]
fn unaligned_uploads_are_padded_to_whole_words() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    graph.add_job("upload")?.init_buffer("bytes", &[1, 2, 3, 4, 5, 6])?;
    graph.build_jobs("upload")?;
    graph.execute("upload", 0, None)?;

    assert!(device.buffers()?.iter().filter(|buffer| buffer.name == "bytes").all(|buffer| buffer.size == 8));
    assert_eq!(graph.resources().buffer(&"bytes".into(), 0)?.contents()?, vec![1, 2, 3, 4, 5, 6, 0, 0]);
    Ok(())
}

#[test]
fn oversized_uploads_fail_the_build() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("upload")?;
    ctx.declare_buffer("small", 16)?;
    ctx.fill_buffer("small", &[0u8; 30])?;

    let err = graph.build_jobs("upload").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::BufferUpdateOutOfRange {
            offset: 0,
            len: 32,
            size: 16,
        })
    ));
    Ok(())
}
