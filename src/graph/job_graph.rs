//! The job graph owns every job of a render surface, orders them by their dependencies and connects them
//! with semaphores.
//!
//! A graph goes through three phases. While *declaring*, jobs are recorded through the [`BuildContext`] returned
//! by [`JobGraph::add_job`] and dependencies are registered. [`JobGraph::build_jobs`] compiles every context
//! reachable from a target job into a [`Job`]. From then on [`JobGraph::execute`] submits the target and all of
//! its dependencies once per frame. Semaphores are created on the first execution and never change afterwards.
//!
//! Two kinds of dependencies exist. A regular dependency orders two jobs within the same frame. A dependency
//! on the previous frame makes a job wait for the submission of another job (or of itself) in the frame before,
//! which is how results of the last frame are consumed safely. Only regular dependencies take part in ordering.
//!
//! Through [`JobGraph::dot`], the dependency graph can be exported in graphviz `dot` format.
//!
//! # Example
//! ```
//! # use anyhow::Result;
//! # use ash::vk;
//! # use deimos::prelude::*;
//! # fn main() -> Result<()> {
//! let device = RecordingDevice::new();
//! let mut graph = JobGraph::new(device, Box::new(InMemoryShaderLibrary::new()), vk::Extent2D { width: 800, height: 600 });
//!
//! let update = graph.add_job("update")?;
//! update.init_buffer("counter", &[0u8; 4])?;
//! graph.add_job("render")?;
//! graph.add_dependency("render", "update");
//! graph.add_self_dependency_to_previous_frame("update");
//!
//! graph.build_jobs("render")?;
//! graph.execute("render", 0, None)?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};

use anyhow::Result;
use ash::vk;
use multimap::MultiMap;
use petgraph::dot::Dot;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::EdgeRef;

use crate::backend::Device;
use crate::core::error::Error;
use crate::core::name::Name;
use crate::graph::build_context::BuildContext;
use crate::graph::job::Job;
use crate::graph::pipeline_cache::{PipelineCache, ShaderLibrary};
use crate::graph::refs::previous_frame;
use crate::graph::resource_storage::ResourceStorage;
use crate::FRAMES_IN_FLIGHT_COUNT;

/// Handle to a semaphore owned by the graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemaphoreId(usize);

#[derive(Debug, Default, Clone)]
struct JobFrameSemaphores {
    /// Semaphores this job waits on, keyed by the job that signals them.
    owned: BTreeMap<Name, SemaphoreId>,
    signal: Vec<SemaphoreId>,
    wait: Vec<SemaphoreId>,
    /// Only the same-frame part of `wait`, used for the very first frame when nothing from a previous frame
    /// will ever signal.
    wait_in_frame: Vec<SemaphoreId>,
}

#[derive(Debug, Default, Clone)]
struct JobSemaphores {
    frames: [JobFrameSemaphores; FRAMES_IN_FLIGHT_COUNT as usize],
}

/// Kind of an edge in the exported dependency graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DependencyKind {
    SameFrame,
    PreviousFrame,
}

impl Display for DependencyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::SameFrame => f.write_str("same frame"),
            DependencyKind::PreviousFrame => f.write_str("previous frame"),
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct JobGraph<D: Device> {
    #[derivative(Debug = "ignore")]
    device: D,
    pipeline_cache: PipelineCache<D>,
    resources: ResourceStorage<D>,
    screen_size: vk::Extent2D,
    contexts: BTreeMap<Name, BuildContext<D>>,
    jobs: BTreeMap<Name, Job<D>>,
    external_jobs: Vec<Name>,
    job_semaphores: BTreeMap<Name, JobSemaphores>,
    #[derivative(Debug = "ignore")]
    semaphores: Vec<D::Semaphore>,
    dependencies: MultiMap<Name, Name>,
    interframe_dependencies: MultiMap<Name, Name>,
    job_order: Vec<Name>,
    last_target: Option<Name>,
    has_built_semaphores: bool,
    is_first_frame: bool,
    unusable: bool,
}

fn contains_edge(map: &MultiMap<Name, Name>, job: &Name, dependency: &Name) -> bool {
    map.get_vec(job).map_or(false, |deps| deps.contains(dependency))
}

fn insert_edge(map: &mut MultiMap<Name, Name>, job: Name, dependency: Name, kind: DependencyKind) {
    if contains_edge(map, &job, &dependency) {
        warn!("Ignoring duplicate {kind} dependency of `{job}` on `{dependency}`");
        return;
    }
    map.insert(job, dependency);
}

impl<D: Device> JobGraph<D> {
    /// Create an empty graph. Shaders referenced by jobs are loaded through `shaders`.
    pub fn new(device: D, shaders: Box<dyn ShaderLibrary>, screen_size: vk::Extent2D) -> Self {
        Self {
            pipeline_cache: PipelineCache::new(device.clone(), shaders),
            resources: ResourceStorage::new(device.clone()),
            device,
            screen_size,
            contexts: BTreeMap::new(),
            jobs: BTreeMap::new(),
            external_jobs: vec![],
            job_semaphores: BTreeMap::new(),
            semaphores: vec![],
            dependencies: MultiMap::new(),
            interframe_dependencies: MultiMap::new(),
            job_order: vec![],
            last_target: None,
            has_built_semaphores: false,
            is_first_frame: true,
            unusable: false,
        }
    }

    /// Add a job recorded at the current screen size.
    pub fn add_job(&mut self, name: impl Into<Name>) -> Result<&mut BuildContext<D>> {
        let size = self.screen_size;
        self.add_job_with_size(name, size)
    }

    pub fn add_job_with_size(&mut self, name: impl Into<Name>, screen_size: vk::Extent2D) -> Result<&mut BuildContext<D>> {
        let name = name.into();
        if self.contexts.contains_key(&name) || self.external_jobs.contains(&name) {
            return Err(Error::DuplicateJob(name).into());
        }
        let ctx = BuildContext::new(self.device.clone(), name.clone(), screen_size);
        Ok(self.contexts.entry(name).or_insert(ctx))
    }

    /// Throw away the recording of a job and start a new one. Call [`JobGraph::rebuild_job`] once recorded.
    pub fn replace_job(&mut self, name: impl Into<Name>) -> Result<&mut BuildContext<D>> {
        let name = name.into();
        self.contexts.remove(&name);
        self.add_job(name)
    }

    /// Register a job that is submitted outside of the graph, such as presentation. External jobs take part in
    /// the semaphore graph, and their semaphores are available through [`JobGraph::wait_semaphores`] and
    /// [`JobGraph::signal_semaphores`].
    pub fn add_external_job(&mut self, name: impl Into<Name>) -> Result<()> {
        let name = name.into();
        if self.contexts.contains_key(&name) || self.external_jobs.contains(&name) {
            return Err(Error::DuplicateJob(name).into());
        }
        self.external_jobs.push(name);
        Ok(())
    }

    /// Screen size used by jobs added from now on.
    pub fn set_screen_size(&mut self, screen_size: vk::Extent2D) {
        self.screen_size = screen_size;
    }

    pub fn screen_size(&self) -> vk::Extent2D {
        self.screen_size
    }

    /// `job` waits for `dependency` within the same frame.
    pub fn add_dependency(&mut self, job: impl Into<Name>, dependency: impl Into<Name>) {
        insert_edge(&mut self.dependencies, job.into(), dependency.into(), DependencyKind::SameFrame);
    }

    /// `job` in frame N waits for `dependency` in frame N - 1.
    pub fn add_dependency_to_previous_frame(&mut self, job: impl Into<Name>, dependency: impl Into<Name>) {
        insert_edge(&mut self.interframe_dependencies, job.into(), dependency.into(), DependencyKind::PreviousFrame);
    }

    /// A job that reads its own results from the previous frame.
    pub fn add_self_dependency_to_previous_frame(&mut self, job: impl Into<Name>) {
        let job = job.into();
        self.add_dependency_to_previous_frame(job.clone(), job);
    }

    fn built_job_mut(&mut self, job: &Name) -> Result<&mut Job<D>> {
        match self.jobs.get_mut(job) {
            Some(built) => Ok(built),
            None => {
                warn!("Toggling a flag of job `{job}`, which is not built");
                Err(Error::JobNotFound(job.clone()).into())
            }
        }
    }

    pub fn enable_flag(&mut self, job: impl Into<Name>, flag: impl Into<Name>) -> Result<()> {
        let job = job.into();
        self.built_job_mut(&job)?.enable_flag(&job, &flag.into())
    }

    pub fn disable_flag(&mut self, job: impl Into<Name>, flag: impl Into<Name>) -> Result<()> {
        let job = job.into();
        self.built_job_mut(&job)?.disable_flag(&job, &flag.into())
    }

    fn check_usable(&self) -> Result<()> {
        if self.unusable {
            Err(Error::GraphUnusable.into())
        } else {
            Ok(())
        }
    }

    /// Fail if the same-frame dependencies reachable from `target` contain a cycle.
    fn check_cycles(&self, target: &Name) -> Result<()> {
        let mut graph = DiGraphMap::<&str, ()>::new();
        let mut visited = BTreeSet::new();
        let mut stack = vec![target];
        while let Some(job) = stack.pop() {
            if !visited.insert(job) {
                continue;
            }
            graph.add_node(job.as_str());
            for dependency in self.dependencies.get_vec(job).into_iter().flatten() {
                graph.add_edge(dependency.as_str(), job.as_str(), ());
                stack.push(dependency);
            }
        }
        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(Error::GraphHasCycle.into());
        }
        Ok(())
    }

    /// Compile the target and every job it depends on within a frame. After a failure the graph is unusable.
    pub fn build_jobs(&mut self, target: impl Into<Name>) -> Result<()> {
        self.check_usable()?;
        let target = target.into();
        let result = self.build_jobs_for(&target);
        if let Err(err) = &result {
            error!("Failed to build jobs for `{target}`: {err}");
            self.unusable = true;
        }
        result
    }

    fn build_jobs_for(&mut self, target: &Name) -> Result<()> {
        self.check_cycles(target)?;
        self.deduce_job_order(target);

        let order = self.job_order.clone();
        for name in &order {
            let Some(ctx) = self.contexts.get_mut(name) else {
                continue;
            };
            let job = ctx.build_job(&mut self.pipeline_cache, &mut self.resources, name)?;
            self.jobs.insert(name.clone(), job);
            self.job_semaphores.entry(name.clone()).or_default();
        }
        for name in &self.external_jobs {
            self.job_semaphores.entry(name.clone()).or_default();
        }
        Ok(())
    }

    /// Recompile a single job, for example after [`JobGraph::replace_job`] or a change of screen size.
    pub fn rebuild_job(&mut self, name: impl Into<Name>) -> Result<()> {
        self.check_usable()?;
        let name = name.into();
        let ctx = self.contexts.get_mut(&name).ok_or_else(|| Error::JobNotFound(name.clone()))?;
        self.jobs.remove(&name);
        match ctx.build_job(&mut self.pipeline_cache, &mut self.resources, &name) {
            Ok(job) => {
                self.jobs.insert(name.clone(), job);
                self.job_semaphores.entry(name).or_default();
                Ok(())
            }
            Err(err) => {
                error!("Failed to rebuild job `{name}`: {err}");
                self.unusable = true;
                Err(err)
            }
        }
    }

    fn create_semaphore(&mut self) -> Result<SemaphoreId> {
        self.semaphores.push(self.device.create_semaphore()?);
        Ok(SemaphoreId(self.semaphores.len() - 1))
    }

    fn frame_semaphores_mut(&mut self, job: &Name, frame: u32) -> Result<&mut JobFrameSemaphores> {
        self.job_semaphores
            .get_mut(job)
            .map(|semaphores| &mut semaphores.frames[frame as usize])
            .ok_or_else(|| Error::JobNotFound(job.clone()).into())
    }

    fn own_semaphore(&mut self, job: &Name, dependency: &Name, frame: u32, semaphore: SemaphoreId) -> Result<()> {
        let frame_semaphores = self.frame_semaphores_mut(job, frame)?;
        if frame_semaphores.owned.contains_key(dependency) {
            return Err(Error::ConflictingDependency {
                job: job.clone(),
                dependency: dependency.clone(),
            }
            .into());
        }
        frame_semaphores.owned.insert(dependency.clone(), semaphore);
        frame_semaphores.wait.push(semaphore);
        Ok(())
    }

    /// Create the semaphores connecting jobs that depend on each other. Runs once; later calls do nothing.
    pub fn build_semaphores(&mut self) -> Result<()> {
        if self.has_built_semaphores {
            return Ok(());
        }

        let jobs: Vec<Name> = self.job_semaphores.keys().cloned().collect();
        for job in &jobs {
            let dependencies = self.dependencies.get_vec(job).cloned().unwrap_or_default();
            for dependency in &dependencies {
                if !self.job_semaphores.contains_key(dependency) {
                    return Err(Error::JobNotFound(dependency.clone()).into());
                }
                for frame in 0..FRAMES_IN_FLIGHT_COUNT {
                    let semaphore = self.create_semaphore()?;
                    self.own_semaphore(job, dependency, frame, semaphore)?;
                    self.frame_semaphores_mut(job, frame)?.wait_in_frame.push(semaphore);
                    self.frame_semaphores_mut(dependency, frame)?.signal.push(semaphore);
                }
            }

            let dependencies = self.interframe_dependencies.get_vec(job).cloned().unwrap_or_default();
            for dependency in &dependencies {
                if !self.job_semaphores.contains_key(dependency) {
                    return Err(Error::JobNotFound(dependency.clone()).into());
                }
                for frame in 0..FRAMES_IN_FLIGHT_COUNT {
                    let semaphore = self.create_semaphore()?;
                    self.own_semaphore(job, dependency, frame, semaphore)?;
                    self.frame_semaphores_mut(dependency, previous_frame(frame))?.signal.push(semaphore);
                }
            }
        }

        debug!("Built {} semaphores for {} jobs", self.semaphores.len(), jobs.len());
        self.has_built_semaphores = true;
        Ok(())
    }

    /// Order the target and its transitive same-frame dependencies so that every dependency comes before its
    /// dependents. The order is cached until a different target is requested.
    pub fn deduce_job_order(&mut self, target: &Name) {
        if self.last_target.as_ref() == Some(target) {
            return;
        }
        self.job_order.clear();
        self.last_target = Some(target.clone());

        let mut queue = VecDeque::from([target.clone()]);
        let mut visited = BTreeSet::new();
        let mut inserted = BTreeSet::new();
        while let Some(job) = queue.front().cloned() {
            if !visited.insert(job.clone()) {
                queue.pop_front();
                if inserted.insert(job.clone()) {
                    self.job_order.push(job);
                }
                continue;
            }

            let mut satisfied = true;
            for dependency in self.dependencies.get_vec(&job).into_iter().flatten() {
                if !inserted.contains(dependency) {
                    queue.push_front(dependency.clone());
                    satisfied = false;
                }
            }
            if satisfied {
                queue.pop_front();
                if inserted.insert(job.clone()) {
                    self.job_order.push(job);
                }
            }
        }
        debug!("Job order for `{target}`: {:?}", self.job_order);
    }

    /// Submit the target and its dependencies for `frame`. The fence is only attached to the target's submission.
    pub fn execute(&mut self, target: impl Into<Name>, frame: u32, fence: Option<&D::Fence>) -> Result<()> {
        self.check_usable()?;
        if frame >= FRAMES_IN_FLIGHT_COUNT {
            return Err(Error::InvalidFrameIndex(frame).into());
        }
        let target = target.into();
        self.build_semaphores()?;
        self.deduce_job_order(&target);

        for name in &self.job_order {
            let Some(job) = self.jobs.get(name) else {
                continue;
            };
            let frame_semaphores = self
                .job_semaphores
                .get(name)
                .map(|semaphores| &semaphores.frames[frame as usize])
                .ok_or_else(|| Error::JobNotFound(name.clone()))?;
            let wait_ids = if self.is_first_frame {
                &frame_semaphores.wait_in_frame
            } else {
                &frame_semaphores.wait
            };
            let wait: Vec<&D::Semaphore> = wait_ids.iter().map(|id| &self.semaphores[id.0]).collect();
            let signal: Vec<&D::Semaphore> = frame_semaphores.signal.iter().map(|id| &self.semaphores[id.0]).collect();
            let job_fence = if *name == target {
                fence
            } else {
                None
            };
            job.execute(frame, &wait, &signal, job_fence)?;
        }
        self.is_first_frame = false;
        Ok(())
    }

    /// Wait for the device to go idle, then rebuild every job with the new screen size.
    pub fn resize(&mut self, screen_size: vk::Extent2D) -> Result<()> {
        self.device.await_all()?;
        self.screen_size = screen_size;
        for ctx in self.contexts.values_mut() {
            ctx.set_screen_size(screen_size);
        }
        let built: Vec<Name> = self.jobs.keys().cloned().collect();
        for name in built {
            self.rebuild_job(name)?;
        }
        info!("Resized job graph to {}x{}", screen_size.width, screen_size.height);
        Ok(())
    }

    fn frame_semaphores(&self, job: &Name, frame: u32) -> Result<&JobFrameSemaphores> {
        if frame >= FRAMES_IN_FLIGHT_COUNT {
            return Err(Error::InvalidFrameIndex(frame).into());
        }
        self.job_semaphores
            .get(job)
            .map(|semaphores| &semaphores.frames[frame as usize])
            .ok_or_else(|| Error::JobNotFound(job.clone()).into())
    }

    /// The semaphore `wait_job` waits on in `frame` that is signaled by `signal_job`.
    pub fn semaphore(&self, wait_job: impl Into<Name>, signal_job: impl Into<Name>, frame: u32) -> Result<SemaphoreId> {
        let wait_job = wait_job.into();
        let signal_job = signal_job.into();
        self.frame_semaphores(&wait_job, frame)?
            .owned
            .get(&signal_job)
            .copied()
            .ok_or_else(|| Error::JobNotFound(signal_job).into())
    }

    pub fn wait_semaphores(&self, job: impl Into<Name>, frame: u32) -> Result<&[SemaphoreId]> {
        Ok(&self.frame_semaphores(&job.into(), frame)?.wait)
    }

    /// Wait set used for `frame` on the very first execution.
    pub fn wait_in_frame_semaphores(&self, job: impl Into<Name>, frame: u32) -> Result<&[SemaphoreId]> {
        Ok(&self.frame_semaphores(&job.into(), frame)?.wait_in_frame)
    }

    pub fn signal_semaphores(&self, job: impl Into<Name>, frame: u32) -> Result<&[SemaphoreId]> {
        Ok(&self.frame_semaphores(&job.into(), frame)?.signal)
    }

    pub fn semaphore_handle(&self, id: SemaphoreId) -> &D::Semaphore {
        &self.semaphores[id.0]
    }

    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }

    pub fn job(&self, name: impl Into<Name>) -> Option<&Job<D>> {
        self.jobs.get(&name.into())
    }

    pub fn context(&self, name: impl Into<Name>) -> Option<&BuildContext<D>> {
        self.contexts.get(&name.into())
    }

    pub fn context_mut(&mut self, name: impl Into<Name>) -> Option<&mut BuildContext<D>> {
        self.contexts.get_mut(&name.into())
    }

    /// Last deduced job order.
    pub fn job_order(&self) -> &[Name] {
        &self.job_order
    }

    pub fn is_usable(&self) -> bool {
        !self.unusable
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn resources(&self) -> &ResourceStorage<D> {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceStorage<D> {
        &mut self.resources
    }

    pub fn pipeline_cache(&self) -> &PipelineCache<D> {
        &self.pipeline_cache
    }

    /// Get the dependency graph in `dot` format. Edges are labeled with their [`DependencyKind`], dependencies on
    /// the previous frame are drawn dashed.
    pub fn dot(&self) -> Result<String> {
        let mut graph = DiGraphMap::<&str, DependencyKind>::new();
        for name in self.contexts.keys().chain(&self.external_jobs) {
            graph.add_node(name.as_str());
        }
        for (job, dependencies) in self.dependencies.iter_all() {
            for dependency in dependencies {
                graph.add_edge(dependency.as_str(), job.as_str(), DependencyKind::SameFrame);
            }
        }
        for (job, dependencies) in self.interframe_dependencies.iter_all() {
            for dependency in dependencies {
                graph.add_edge(dependency.as_str(), job.as_str(), DependencyKind::PreviousFrame);
            }
        }
        Ok(format!(
            "{}",
            Dot::with_attr_getters(
                &graph,
                &[],
                &|_, edge| match edge.weight() {
                    DependencyKind::SameFrame => String::new(),
                    DependencyKind::PreviousFrame => "style = dashed ".to_string(),
                },
                &|_, _| String::new(),
            )
        ))
    }
}
