//! Frame pacing on top of a [`JobGraph`].

use anyhow::Result;
use ash::vk;

use crate::backend::Device;
use crate::core::error::is_out_of_date;
use crate::core::name::Name;
use crate::graph::job_graph::JobGraph;
use crate::FRAMES_IN_FLIGHT_COUNT;

/// Drives a job graph for one presentation target. The surface keeps a fence per frame in flight and waits on
/// it before reusing that frame's resources. Resizes requested while rendering are deferred until the start of
/// the next [`RenderSurface::render`] call.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RenderSurface<D: Device> {
    graph: JobGraph<D>,
    #[derivative(Debug = "ignore")]
    fences: Vec<D::Fence>,
    frame: u32,
    pending_resize: Option<vk::Extent2D>,
}

impl<D: Device> RenderSurface<D> {
    /// Wrap a graph whose jobs are already built.
    pub fn new(graph: JobGraph<D>) -> Result<Self> {
        let fences = (0..FRAMES_IN_FLIGHT_COUNT)
            .map(|_| graph.device().create_fence(true))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            graph,
            fences,
            frame: 0,
            pending_resize: None,
        })
    }

    pub fn graph(&self) -> &JobGraph<D> {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut JobGraph<D> {
        &mut self.graph
    }

    /// Index of the frame in flight the next [`RenderSurface::render`] call submits.
    pub fn frame_index(&self) -> u32 {
        self.frame
    }

    pub fn pending_resize(&self) -> Option<vk::Extent2D> {
        self.pending_resize
    }

    /// Schedule a resize, for example after presentation reported an out of date swapchain.
    pub fn report_out_of_date(&mut self, screen_size: vk::Extent2D) {
        debug!("Scheduling resize to {}x{}", screen_size.width, screen_size.height);
        self.pending_resize = Some(screen_size);
    }

    /// Turn an out of date swapchain error into a scheduled resize. Every other result is passed through.
    pub fn handle_result<T>(&mut self, result: Result<T>, screen_size: vk::Extent2D) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if is_out_of_date(&err) => {
                self.report_out_of_date(screen_size);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Render one frame of `target`.
    pub fn render(&mut self, target: impl Into<Name>) -> Result<()> {
        if let Some(size) = self.pending_resize.take() {
            self.graph.device().await_all()?;
            self.graph.resize(size)?;
        }

        let fence = &self.fences[self.frame as usize];
        self.graph.device().wait_for_fence(fence)?;
        self.graph.device().reset_fence(fence)?;
        self.graph.execute(target, self.frame, Some(fence))?;

        self.frame = (self.frame + 1) % FRAMES_IN_FLIGHT_COUNT;
        Ok(())
    }
}
