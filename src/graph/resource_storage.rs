//! Storage of the concrete GPU resources behind declared names.
//!
//! Every declared resource exists once per frame in flight, keyed by `(name, frame)`. Resources are created on
//! the first build that declares them and are only recreated when their description changes, which happens
//! after a resize or when a job redeclares a name with a different format or usage. Resources created outside of
//! the graph can be moved in with [`ResourceStorage::import_texture`] and [`ResourceStorage::import_buffer`].

use std::collections::HashMap;

use anyhow::Result;
use ash::vk;

use crate::backend::{BufferCreateInfo, Device, DeviceBuffer, DeviceTexture, ImageBinding, TextureCreateInfo};
use crate::core::error::Error;
use crate::core::name::Name;
use crate::graph::refs::{BufferRef, TextureRef};

/// Number of queries in each of the timestamp and pipeline statistics pools.
pub const QUERY_POOL_SIZE: u32 = 16;

/// Handle to a resource moved into storage from outside of the graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImportId(u64);

#[derive(Derivative)]
#[derivative(Debug)]
pub struct ResourceStorage<D: Device> {
    #[derivative(Debug = "ignore")]
    device: D,
    #[derivative(Debug = "ignore")]
    textures: HashMap<(Name, u32), D::Texture>,
    #[derivative(Debug = "ignore")]
    mip_views: HashMap<(Name, u32), Vec<D::TextureView>>,
    #[derivative(Debug = "ignore")]
    buffers: HashMap<(Name, u32), D::Buffer>,
    #[derivative(Debug = "ignore")]
    imported_textures: HashMap<ImportId, D::Texture>,
    #[derivative(Debug = "ignore")]
    imported_buffers: HashMap<ImportId, D::Buffer>,
    next_import: u64,
    #[derivative(Debug = "ignore")]
    timestamps: Option<D::QueryPool>,
    #[derivative(Debug = "ignore")]
    pipeline_stats: Option<D::QueryPool>,
}

impl<D: Device> ResourceStorage<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            textures: HashMap::new(),
            mip_views: HashMap::new(),
            buffers: HashMap::new(),
            imported_textures: HashMap::new(),
            imported_buffers: HashMap::new(),
            next_import: 0,
            timestamps: None,
            pipeline_stats: None,
        }
    }

    /// Store a texture, replacing (and dropping) any previous texture and mip views under the same key.
    pub fn register_texture(&mut self, name: Name, frame: u32, texture: D::Texture) {
        self.mip_views.remove(&(name.clone(), frame));
        self.textures.insert((name, frame), texture);
    }

    pub fn register_mip_views(&mut self, name: Name, frame: u32, views: Vec<D::TextureView>) {
        self.mip_views.insert((name, frame), views);
    }

    pub fn register_buffer(&mut self, name: Name, frame: u32, buffer: D::Buffer) {
        self.buffers.insert((name, frame), buffer);
    }

    /// Make sure a texture matching `info` exists for this key. Returns whether a new texture was created.
    pub fn ensure_texture(&mut self, name: &Name, frame: u32, info: &TextureCreateInfo) -> Result<bool> {
        if let Some(existing) = self.textures.get(&(name.clone(), frame)) {
            if existing.extent() == info.extent && existing.format() == info.format && existing.usage() == info.usage && existing.mip_count() == info.mip_count {
                return Ok(false);
            }
        }

        let texture = self.device.create_texture(info)?;
        let views = if info.mip_count > 1 {
            (0..info.mip_count)
                .map(|mip| self.device.create_texture_view(&texture, mip))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![]
        };
        debug!("Created texture `{name}` for frame {frame} ({}x{}, {} mips)", info.extent.width, info.extent.height, info.mip_count);
        self.register_texture(name.clone(), frame, texture);
        if !views.is_empty() {
            self.register_mip_views(name.clone(), frame, views);
        }
        Ok(true)
    }

    /// Make sure a buffer matching `info` exists for this key. Returns whether a new buffer was created.
    pub fn ensure_buffer(&mut self, name: &Name, frame: u32, info: &BufferCreateInfo) -> Result<bool> {
        if let Some(existing) = self.buffers.get(&(name.clone(), frame)) {
            if existing.size() == info.size && existing.usage() == info.usage && existing.memory_type() == info.memory {
                return Ok(false);
            }
        }

        let buffer = self.device.create_buffer(info)?;
        debug!("Created buffer `{name}` for frame {frame} ({} bytes)", info.size);
        self.register_buffer(name.clone(), frame, buffer);
        Ok(true)
    }

    pub fn texture(&self, name: &Name, frame: u32) -> Result<&D::Texture> {
        self.textures.get(&(name.clone(), frame)).ok_or_else(|| {
            Error::MissingResource {
                name: name.clone(),
                frame,
            }
            .into()
        })
    }

    pub fn mip_view(&self, name: &Name, frame: u32, mip: u32) -> Result<&D::TextureView> {
        self.mip_views
            .get(&(name.clone(), frame))
            .and_then(|views| views.get(mip as usize))
            .ok_or_else(|| {
                Error::MissingResource {
                    name: name.clone(),
                    frame,
                }
                .into()
            })
    }

    pub fn buffer(&self, name: &Name, frame: u32) -> Result<&D::Buffer> {
        self.buffers.get(&(name.clone(), frame)).ok_or_else(|| {
            Error::MissingResource {
                name: name.clone(),
                frame,
            }
            .into()
        })
    }

    pub fn import_texture(&mut self, texture: D::Texture) -> ImportId {
        let id = ImportId(self.next_import);
        self.next_import += 1;
        self.imported_textures.insert(id, texture);
        id
    }

    pub fn import_buffer(&mut self, buffer: D::Buffer) -> ImportId {
        let id = ImportId(self.next_import);
        self.next_import += 1;
        self.imported_buffers.insert(id, buffer);
        id
    }

    /// Remove an imported texture, handing ownership back to the caller.
    pub fn release_texture(&mut self, id: ImportId) -> Option<D::Texture> {
        self.imported_textures.remove(&id)
    }

    pub fn release_buffer(&mut self, id: ImportId) -> Option<D::Buffer> {
        self.imported_buffers.remove(&id)
    }

    /// The whole texture a reference points at while recording `frame`.
    pub fn resolve_texture(&self, texture: &TextureRef, frame: u32) -> Result<&D::Texture> {
        match texture {
            TextureRef::Declared(name)
            | TextureRef::External(name)
            | TextureRef::Mip {
                name, ..
            } => self.texture(name, frame),
            TextureRef::LastFrame(name) => self.texture(name, texture.resolve_frame(frame)),
            TextureRef::Imported(id) => self.imported_textures.get(id).ok_or_else(|| Error::MissingImport(*id).into()),
        }
    }

    /// Like [`ResourceStorage::resolve_texture`], but a mip reference binds only the view of that mip.
    pub fn resolve_image(&self, texture: &TextureRef, frame: u32) -> Result<ImageBinding<'_, D>> {
        match texture {
            TextureRef::Mip {
                name,
                level,
            } => Ok(ImageBinding::Mip(self.mip_view(name, frame, *level)?)),
            _ => Ok(ImageBinding::Whole(self.resolve_texture(texture, frame)?)),
        }
    }

    pub fn resolve_buffer(&self, buffer: &BufferRef, frame: u32) -> Result<&D::Buffer> {
        match buffer {
            BufferRef::Declared(name) | BufferRef::External(name) => self.buffer(name, frame),
            BufferRef::LastFrame(name) => self.buffer(name, buffer.resolve_frame(frame)),
            BufferRef::Imported(id) => self.imported_buffers.get(id).ok_or_else(|| Error::MissingImport(*id).into()),
        }
    }

    pub(crate) fn ensure_query_pools(&mut self, timestamps: bool, pipeline_stats: bool) -> Result<()> {
        if timestamps && self.timestamps.is_none() {
            self.timestamps = Some(self.device.create_query_pool(vk::QueryType::TIMESTAMP, QUERY_POOL_SIZE)?);
        }
        if pipeline_stats && self.pipeline_stats.is_none() {
            self.pipeline_stats = Some(self.device.create_query_pool(vk::QueryType::PIPELINE_STATISTICS, QUERY_POOL_SIZE)?);
        }
        Ok(())
    }

    pub fn timestamp_pool(&self) -> Result<&D::QueryPool> {
        self.timestamps
            .as_ref()
            .ok_or_else(|| Error::Uncategorized("no job records timestamp queries").into())
    }

    pub fn pipeline_stats_pool(&self) -> Result<&D::QueryPool> {
        self.pipeline_stats
            .as_ref()
            .ok_or_else(|| Error::Uncategorized("no job records pipeline statistics queries").into())
    }

    /// Raw timestamp values written by `query_timestamp`, in device ticks.
    pub fn timestamps(&self, first: u32, count: u32) -> Result<Vec<u64>> {
        self.device.query_results(self.timestamp_pool()?, first, count)
    }

    pub fn pipeline_statistics(&self, first: u32, count: u32) -> Result<Vec<u64>> {
        self.device.query_results(self.pipeline_stats_pool()?, first, count)
    }
}
