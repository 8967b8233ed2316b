//! Memoizes pipeline objects by their full state, and loads the shaders they reference.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::io::Cursor;
use std::path::PathBuf;

use anyhow::Result;
use ash::vk;

use crate::backend::{Device, GraphicsShaders, RayTracingShader};
use crate::core::error::Error;
use crate::core::name::Name;
use crate::graph::pipeline_state::{state_hash, ComputePipelineState, GraphicsPipelineState, RayTracingPipelineState};

/// Source of SPIR-V for the shader names recorded with the `bind_*_shader` calls.
pub trait ShaderLibrary: Debug {
    fn load(&self, name: &Name) -> Result<Vec<u32>>;
}

/// Shaders registered up front, e.g. embedded with `include_bytes!`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryShaderLibrary {
    shaders: HashMap<Name, Vec<u32>>,
}

impl InMemoryShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shader(mut self, name: impl Into<Name>, spirv: Vec<u32>) -> Self {
        self.insert(name, spirv);
        self
    }

    pub fn insert(&mut self, name: impl Into<Name>, spirv: Vec<u32>) {
        self.shaders.insert(name.into(), spirv);
    }

    /// Register SPIR-V given as raw bytes.
    pub fn insert_bytes(&mut self, name: impl Into<Name>, bytes: &[u8]) -> Result<()> {
        let spirv = ash::util::read_spv(&mut Cursor::new(bytes))?;
        self.shaders.insert(name.into(), spirv);
        Ok(())
    }
}

impl ShaderLibrary for InMemoryShaderLibrary {
    fn load(&self, name: &Name) -> Result<Vec<u32>> {
        self.shaders
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ShaderNotFound(name.clone()).into())
    }
}

/// Loads `<root>/<name>.spv` from disk.
#[derive(Debug, Clone)]
pub struct DirectoryShaderLibrary {
    root: PathBuf,
}

impl DirectoryShaderLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
        }
    }
}

impl ShaderLibrary for DirectoryShaderLibrary {
    fn load(&self, name: &Name) -> Result<Vec<u32>> {
        let path = self.root.join(format!("{name}.spv"));
        let bytes = std::fs::read(&path).map_err(|_| Error::ShaderNotFound(name.clone()))?;
        Ok(ash::util::read_spv(&mut Cursor::new(bytes))?)
    }
}

/// Index of a pipeline in the cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PipelineId(usize);

#[derive(Derivative)]
#[derivative(Debug)]
pub struct PipelineCache<D: Device> {
    #[derivative(Debug = "ignore")]
    device: D,
    shaders: Box<dyn ShaderLibrary>,
    #[derivative(Debug = "ignore")]
    spirv: HashMap<Name, Vec<u32>>,
    graphics: HashMap<GraphicsPipelineState, PipelineId>,
    compute: HashMap<ComputePipelineState, PipelineId>,
    ray_tracing: HashMap<RayTracingPipelineState, PipelineId>,
    #[derivative(Debug = "ignore")]
    pipelines: Vec<D::Pipeline>,
}

fn shader<'s>(library: &dyn ShaderLibrary, spirv: &'s mut HashMap<Name, Vec<u32>>, name: &Name) -> Result<&'s [u32]> {
    if !spirv.contains_key(name) {
        let code = library.load(name)?;
        spirv.insert(name.clone(), code);
    }
    spirv
        .get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::ShaderNotFound(name.clone()).into())
}

impl<D: Device> PipelineCache<D> {
    pub fn new(device: D, shaders: Box<dyn ShaderLibrary>) -> Self {
        Self {
            device,
            shaders,
            spirv: HashMap::new(),
            graphics: HashMap::new(),
            compute: HashMap::new(),
            ray_tracing: HashMap::new(),
            pipelines: vec![],
        }
    }

    fn insert<K: Hash + Eq>(pipelines: &mut Vec<D::Pipeline>, map: &mut HashMap<K, PipelineId>, key: K, pipeline: D::Pipeline) -> PipelineId {
        let id = PipelineId(pipelines.len());
        pipelines.push(pipeline);
        map.insert(key, id);
        id
    }

    pub fn graphics_pipeline(&mut self, state: &GraphicsPipelineState) -> Result<PipelineId> {
        if let Some(id) = self.graphics.get(state) {
            return Ok(*id);
        }
        let vertex_name = state
            .vertex_shader
            .as_ref()
            .ok_or(Error::Uncategorized("graphics pipeline without a vertex shader"))?;
        // Load both first so the borrows of the shader map do not overlap.
        shader(self.shaders.as_ref(), &mut self.spirv, vertex_name)?;
        if let Some(fragment) = &state.fragment_shader {
            shader(self.shaders.as_ref(), &mut self.spirv, fragment)?;
        }
        let shaders = GraphicsShaders {
            vertex: self.spirv[vertex_name].as_slice(),
            fragment: state.fragment_shader.as_ref().map(|name| self.spirv[name].as_slice()),
        };
        let pipeline = self.device.create_graphics_pipeline(state, &shaders)?;
        info!("Created graphics pipeline {:016x} ({})", state_hash(state), vertex_name);
        Ok(Self::insert(&mut self.pipelines, &mut self.graphics, state.clone(), pipeline))
    }

    pub fn compute_pipeline(&mut self, state: &ComputePipelineState) -> Result<PipelineId> {
        if let Some(id) = self.compute.get(state) {
            return Ok(*id);
        }
        let name = state
            .compute_shader
            .as_ref()
            .ok_or(Error::Uncategorized("compute pipeline without a compute shader"))?;
        let code = shader(self.shaders.as_ref(), &mut self.spirv, name)?;
        let pipeline = self.device.create_compute_pipeline(state, code)?;
        info!("Created compute pipeline {:016x} ({})", state_hash(state), name);
        Ok(Self::insert(&mut self.pipelines, &mut self.compute, state.clone(), pipeline))
    }

    pub fn ray_tracing_pipeline(&mut self, state: &RayTracingPipelineState) -> Result<PipelineId> {
        if let Some(id) = self.ray_tracing.get(state) {
            return Ok(*id);
        }
        let ray_gen = state
            .ray_gen_shader
            .as_ref()
            .ok_or(Error::Uncategorized("ray tracing pipeline without a generation shader"))?;

        let stages: Vec<(&Name, vk::ShaderStageFlags)> = std::iter::once((ray_gen, vk::ShaderStageFlags::RAYGEN_KHR))
            .chain(state.miss_shaders.iter().map(|name| (name, vk::ShaderStageFlags::MISS_KHR)))
            .chain(state.closest_hit_shaders.iter().map(|name| (name, vk::ShaderStageFlags::CLOSEST_HIT_KHR)))
            .collect();
        for (name, _) in &stages {
            shader(self.shaders.as_ref(), &mut self.spirv, name)?;
        }
        let shaders: Vec<RayTracingShader> = stages
            .iter()
            .map(|(name, stage)| RayTracingShader {
                name,
                stage: *stage,
                code: self.spirv[*name].as_slice(),
            })
            .collect();
        let pipeline = self.device.create_ray_tracing_pipeline(state, &shaders)?;
        info!("Created ray tracing pipeline {:016x} ({})", state_hash(state), ray_gen);
        Ok(Self::insert(&mut self.pipelines, &mut self.ray_tracing, state.clone(), pipeline))
    }

    pub fn pipeline(&self, id: PipelineId) -> Result<&D::Pipeline> {
        self.pipelines
            .get(id.0)
            .ok_or_else(|| Error::Uncategorized("pipeline id from another cache").into())
    }

    /// Number of distinct pipeline objects created.
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
