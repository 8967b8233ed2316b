use anyhow::Result;
use layout::backends::svg::SVGWriter;
use layout::gv;
use layout::gv::GraphBuilder;

use deimos::prelude::*;

mod framework;

fn add_compute_job(graph: &mut JobGraph<RecordingDevice>, name: &str) -> Result<()> {
    let ctx = graph.add_job(name)?;
    ctx.bind_compute_shader("cull.comp");
    ctx.dispatch([1, 1, 1])?;
    Ok(())
}

fn position(order: &[Name], job: &str) -> Option<usize> {
    order.iter().position(|name| name.as_str() == job)
}

#[test]
fn dependencies_come_first() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    for job in ["a", "b", "c", "d"] {
        add_compute_job(&mut graph, job)?;
    }
    graph.add_dependency("b", "a");
    graph.add_dependency("c", "a");
    graph.add_dependency("d", "b");
    graph.add_dependency("d", "c");
    graph.build_jobs("d")?;

    let order = graph.job_order();
    assert_eq!(order.len(), 4);
    assert!(position(order, "a") < position(order, "b"));
    assert!(position(order, "a") < position(order, "c"));
    assert!(position(order, "b") < position(order, "d"));
    assert!(position(order, "c") < position(order, "d"));
    Ok(())
}

#[test]
fn unrelated_jobs_are_not_ordered() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    for job in ["shadow", "forward", "ui"] {
        add_compute_job(&mut graph, job)?;
    }
    graph.add_dependency("forward", "shadow");
    graph.build_jobs("forward")?;

    assert_eq!(graph.job_order(), &[Name::from("shadow"), Name::from("forward")]);
    assert!(graph.job("ui").is_none());
    Ok(())
}

#[test]
fn job_order_is_cached_per_target() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    for job in ["a", "b", "c"] {
        add_compute_job(&mut graph, job)?;
    }
    graph.add_dependency("b", "a");
    graph.deduce_job_order(&"b".into());
    assert_eq!(graph.job_order().len(), 2);

    // The cached order is reused until a different target is requested.
    graph.add_dependency("b", "c");
    graph.deduce_job_order(&"b".into());
    assert_eq!(graph.job_order().len(), 2);

    graph.deduce_job_order(&"c".into());
    graph.deduce_job_order(&"b".into());
    assert_eq!(graph.job_order().len(), 3);
    Ok(())
}

#[test]
fn duplicate_jobs_are_rejected() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    graph.add_job("a")?;
    let err = graph.add_job("a").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::DuplicateJob(_))));
    // Replacing is allowed and starts a fresh recording.
    let ctx = graph.replace_job("a")?;
    assert!(ctx.commands().is_empty());
    Ok(())
}

#[test]
fn cycles_make_the_graph_unusable() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    add_compute_job(&mut graph, "a")?;
    add_compute_job(&mut graph, "b")?;
    graph.add_dependency("a", "b");
    graph.add_dependency("b", "a");

    let err = graph.build_jobs("a").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::GraphHasCycle)));
    assert!(!graph.is_usable());

    let err = graph.execute("a", 0, None).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::GraphUnusable)));
    Ok(())
}

#[test]
fn failed_builds_make_the_graph_unusable() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let ctx = graph.add_job("a")?;
    ctx.bind_compute_shader("missing.comp");
    ctx.dispatch([1, 1, 1])?;

    assert!(graph.build_jobs("a").is_err());
    assert!(!graph.is_usable());
    Ok(())
}

#[test]
fn semaphores_are_created_once() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    for job in ["shadow", "gbuffer", "lighting"] {
        add_compute_job(&mut graph, job)?;
    }
    graph.add_dependency("lighting", "shadow");
    graph.add_dependency("lighting", "gbuffer");
    graph.build_jobs("lighting")?;

    graph.execute("lighting", 0, None)?;
    let expected = 2 * deimos::FRAMES_IN_FLIGHT_COUNT as usize;
    assert_eq!(graph.semaphore_count(), expected);

    graph.execute("lighting", 1, None)?;
    graph.build_semaphores()?;
    assert_eq!(graph.semaphore_count(), expected);
    assert_eq!(device.semaphore_count()?, expected);

    for frame in 0..deimos::FRAMES_IN_FLIGHT_COUNT {
        let from_shadow = graph.semaphore("lighting", "shadow", frame)?;
        assert!(graph.signal_semaphores("shadow", frame)?.contains(&from_shadow));
        assert_eq!(graph.wait_semaphores("lighting", frame)?.len(), 2);
    }
    Ok(())
}

#[test]
fn previous_frame_dependencies_wrap_around() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    graph.add_job("update")?.init_buffer("counter", &[0u8; 4])?;
    graph.add_self_dependency_to_previous_frame("update");
    graph.build_jobs("update")?;
    graph.build_semaphores()?;

    let waits_in_frame_0 = graph.semaphore("update", "update", 0)?;
    assert!(graph.signal_semaphores("update", 2)?.contains(&waits_in_frame_0));
    let waits_in_frame_1 = graph.semaphore("update", "update", 1)?;
    assert!(graph.signal_semaphores("update", 0)?.contains(&waits_in_frame_1));
    assert!(graph.wait_in_frame_semaphores("update", 0)?.is_empty());
    Ok(())
}

#[test]
fn first_frame_skips_previous_frame_waits() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    graph.add_job("update")?.init_buffer("counter", &[0u8; 4])?;
    add_compute_job(&mut graph, "render")?;
    graph.add_dependency("render", "update");
    graph.add_self_dependency_to_previous_frame("update");
    graph.build_jobs("render")?;

    graph.execute("render", 0, None)?;
    graph.execute("render", 1, None)?;

    let submissions = device.submissions()?;
    assert_eq!(submissions.len(), 4);
    let updates: Vec<&Submission> = submissions.iter().filter(|s| s.name.starts_with("update.")).collect();
    assert!(updates[0].wait.is_empty());

    let previous = graph.semaphore("update", "update", 1)?;
    assert_eq!(updates[1].wait, vec![graph.semaphore_handle(previous).id]);

    // The in-frame dependency is waited on from the start.
    let renders: Vec<&Submission> = submissions.iter().filter(|s| s.name.starts_with("render.")).collect();
    let in_frame = graph.semaphore("render", "update", 0)?;
    assert_eq!(renders[0].wait, vec![graph.semaphore_handle(in_frame).id]);
    Ok(())
}

#[test]
fn conflicting_dependencies_are_reported() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    add_compute_job(&mut graph, "a")?;
    add_compute_job(&mut graph, "b")?;
    graph.add_dependency("b", "a");
    graph.add_dependency_to_previous_frame("b", "a");
    graph.build_jobs("b")?;

    let err = graph.build_semaphores().unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ConflictingDependency { .. })));
    Ok(())
}

#[test]
fn only_the_target_signals_the_fence() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    add_compute_job(&mut graph, "simulate")?;
    add_compute_job(&mut graph, "render")?;
    graph.add_dependency("render", "simulate");
    graph.build_jobs("render")?;

    let fence = device.create_fence(false)?;
    graph.execute("render", 0, Some(&fence))?;
    assert!(fence.is_signaled());

    let submissions = device.submissions()?;
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].fence, None);
    assert_eq!(submissions[1].fence, Some(fence.id));
    Ok(())
}

#[test]
fn invalid_frame_index() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    add_compute_job(&mut graph, "a")?;
    graph.build_jobs("a")?;

    let err = graph.execute("a", deimos::FRAMES_IN_FLIGHT_COUNT, None).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidFrameIndex(3))));
    Ok(())
}

#[test]
fn external_buffers_flow_between_jobs() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    let values = [7u32, 8, 9, 10];
    let bytes: Vec<u8> = values.iter().flat_map(|value| value.to_ne_bytes()).collect();
    graph.add_job("upload")?.init_buffer("src", &bytes)?;

    let ctx = graph.add_job("copy")?;
    ctx.declare_buffer("dst", 16)?;
    ctx.copy_buffer(BufferRef::external("src"), "dst")?;
    graph.add_dependency("copy", "upload");
    graph.build_jobs("copy")?;

    graph.execute("copy", 0, None)?;
    let dst = graph.resources().buffer(&"dst".into(), 0)?;
    assert_eq!(dst.read_u32(4)?, 8);
    assert_eq!(dst.read_u32(12)?, 10);
    Ok(())
}

#[test]
fn dot_output_is_valid_graphviz() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    add_compute_job(&mut graph, "simulate")?;
    add_compute_job(&mut graph, "render")?;
    graph.add_dependency("render", "simulate");
    graph.add_self_dependency_to_previous_frame("simulate");

    let dot = graph.dot()?;
    assert!(dot.contains("simulate"));
    assert!(dot.contains("render"));
    assert!(dot.contains("previous frame"));
    assert!(dot.contains("style = dashed"));

    let mut parser = gv::DotParser::new(&dot);
    assert!(parser.process().is_ok());
    Ok(())
}

#[test]
fn dot_output_renders_to_svg() -> Result<()> {
    let (_, mut graph) = framework::make_graph();
    for job in ["depth_prepass", "forward", "post"] {
        add_compute_job(&mut graph, job)?;
    }
    graph.add_dependency("forward", "depth_prepass");
    graph.add_dependency("post", "forward");

    let dot = graph.dot()?;
    let mut parser = gv::DotParser::new(&dot);
    let parsed = match parser.process() {
        Ok(parsed) => parsed,
        Err(e) => {
            parser.print_error();
            anyhow::bail!("dot parse error: {e}");
        }
    };
    let mut builder = GraphBuilder::new();
    builder.visit_graph(&parsed);
    let mut visual = builder.get();
    let mut svg = SVGWriter::new();
    visual.do_it(false, false, false, &mut svg);
    assert!(svg.finalize().contains("<svg"));
    Ok(())
}

#[test]
fn surface_cycles_frames_in_flight() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    add_compute_job(&mut graph, "main")?;
    graph.build_jobs("main")?;

    let mut surface = RenderSurface::new(graph)?;
    let mut seen = vec![];
    for _ in 0..4 {
        seen.push(surface.frame_index());
        surface.render("main")?;
    }
    assert_eq!(seen, vec![0, 1, 2, 0]);

    let submissions = device.submissions()?;
    assert_eq!(submissions.len(), 4);
    assert!(submissions.iter().all(|submission| submission.fence.is_some()));
    assert_eq!(submissions[0].fence, submissions[3].fence);
    Ok(())
}

#[test]
fn surface_defers_resizes_to_the_next_frame() -> Result<()> {
    let (device, mut graph) = framework::make_graph();
    let ctx = graph.add_job("main")?;
    ctx.declare_screen_size_texture("hdr", vk::Format::R16G16B16A16_SFLOAT)?;
    ctx.bind_compute_shader("shade.comp");
    ctx.bind_rw_texture(0, "hdr")?;
    ctx.dispatch([100, 75, 1])?;
    graph.build_jobs("main")?;

    let mut surface = RenderSurface::new(graph)?;
    surface.render("main")?;

    let new_size = vk::Extent2D {
        width: 1280,
        height: 720,
    };
    let presented = surface.handle_result::<()>(Err(Error::OutOfDateSwapchain.into()), new_size)?;
    assert!(presented.is_none());
    assert_eq!(surface.pending_resize(), Some(new_size));
    assert_eq!(framework::texture_extents(&device, "hdr")?.len(), 3);

    surface.render("main")?;
    assert_eq!(surface.pending_resize(), None);
    assert_eq!(surface.graph().screen_size(), new_size);
    let extents = framework::texture_extents(&device, "hdr")?;
    assert_eq!(extents.len(), 6);
    assert!(extents[3..].iter().all(|extent| *extent == new_size));

    let other = surface.handle_result::<()>(Err(Error::NoGPU.into()), new_size);
    assert!(other.is_err());
    Ok(())
}
