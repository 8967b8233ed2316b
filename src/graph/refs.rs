//! References to textures and buffers as they appear in recorded commands. A reference only names a
//! resource; it is resolved against [`ResourceStorage`](crate::ResourceStorage) and a frame index when the
//! command list for that frame is generated.

use crate::core::name::Name;
use crate::graph::resource_storage::ImportId;
use crate::FRAMES_IN_FLIGHT_COUNT;

/// Frame index of the previous frame in flight, wrapping around at zero.
pub fn previous_frame(frame: u32) -> u32 {
    (frame + FRAMES_IN_FLIGHT_COUNT - 1) % FRAMES_IN_FLIGHT_COUNT
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureRef {
    /// Texture declared in the recording context.
    Declared(Name),
    /// The instance of a declared texture that belongs to the previous frame in flight.
    LastFrame(Name),
    /// Texture created by another job and looked up by name in the current frame.
    External(Name),
    /// A single mip level of a declared texture.
    Mip { name: Name, level: u32 },
    /// A texture moved into resource storage from outside of the graph.
    Imported(ImportId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BufferRef {
    Declared(Name),
    LastFrame(Name),
    External(Name),
    Imported(ImportId),
}

impl TextureRef {
    pub fn last_frame(name: impl Into<Name>) -> Self {
        Self::LastFrame(name.into())
    }

    pub fn external(name: impl Into<Name>) -> Self {
        Self::External(name.into())
    }

    pub fn mip(name: impl Into<Name>, level: u32) -> Self {
        Self::Mip {
            name: name.into(),
            level,
        }
    }

    /// Name of the declaration this reference is tracked through, if the recording context owns it.
    pub fn declared_name(&self) -> Option<&Name> {
        match self {
            TextureRef::Declared(name) | TextureRef::LastFrame(name) | TextureRef::Mip { name, .. } => Some(name),
            TextureRef::External(_) | TextureRef::Imported(_) => None,
        }
    }

    /// Frame whose instance of the resource this reference selects while recording `frame`.
    pub fn resolve_frame(&self, frame: u32) -> u32 {
        match self {
            TextureRef::LastFrame(_) => previous_frame(frame),
            _ => frame,
        }
    }
}

impl BufferRef {
    pub fn last_frame(name: impl Into<Name>) -> Self {
        Self::LastFrame(name.into())
    }

    pub fn external(name: impl Into<Name>) -> Self {
        Self::External(name.into())
    }

    pub fn declared_name(&self) -> Option<&Name> {
        match self {
            BufferRef::Declared(name) | BufferRef::LastFrame(name) => Some(name),
            BufferRef::External(_) | BufferRef::Imported(_) => None,
        }
    }

    pub fn resolve_frame(&self, frame: u32) -> u32 {
        match self {
            BufferRef::LastFrame(_) => previous_frame(frame),
            _ => frame,
        }
    }
}

impl From<&str> for TextureRef {
    fn from(value: &str) -> Self {
        Self::Declared(value.into())
    }
}

impl From<Name> for TextureRef {
    fn from(value: Name) -> Self {
        Self::Declared(value)
    }
}

impl From<&Name> for TextureRef {
    fn from(value: &Name) -> Self {
        Self::Declared(value.clone())
    }
}

impl From<ImportId> for TextureRef {
    fn from(value: ImportId) -> Self {
        Self::Imported(value)
    }
}

impl From<&str> for BufferRef {
    fn from(value: &str) -> Self {
        Self::Declared(value.into())
    }
}

impl From<Name> for BufferRef {
    fn from(value: Name) -> Self {
        Self::Declared(value)
    }
}

impl From<&Name> for BufferRef {
    fn from(value: &Name) -> Self {
        Self::Declared(value.clone())
    }
}

impl From<ImportId> for BufferRef {
    fn from(value: ImportId) -> Self {
        Self::Imported(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_frame_wraps_around() {
        assert_eq!(previous_frame(0), 2);
        assert_eq!(previous_frame(1), 0);
        assert_eq!(previous_frame(2), 1);
        assert_eq!(BufferRef::last_frame("counter").resolve_frame(0), 2);
        assert_eq!(BufferRef::external("counter").resolve_frame(0), 0);
    }

    #[test]
    fn only_owned_refs_are_tracked() {
        assert_eq!(TextureRef::mip("hiz", 3).declared_name().map(Name::as_str), Some("hiz"));
        assert!(TextureRef::external("swapchain").declared_name().is_none());
    }
}
