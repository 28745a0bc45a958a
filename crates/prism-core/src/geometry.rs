//! Geometry and instance descriptions handed in by the scene collaborator.

use glam::Mat4;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handle::BufferHandle;

/// Vertex position format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexFormat {
    /// Three 32-bit floats.
    Float32x3,
}

impl VertexFormat {
    /// Size of one position in bytes.
    pub const fn size(self) -> u64 {
        match self {
            Self::Float32x3 => 12,
        }
    }
}

/// Index element format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    /// Size of one index in bytes.
    pub const fn size(self) -> u64 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

/// Index buffer of a geometry entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexBuffer {
    pub buffer: BufferHandle,
    pub count: u32,
    pub format: IndexFormat,
}

/// Reference to a resident vertex buffer (and optional index buffer) forming a triangle list.
///
/// Owned by the geometry collaborator; the builders only read it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeometryHandle {
    pub vertex_buffer: BufferHandle,
    pub vertex_count: u32,
    pub vertex_stride: u64,
    pub vertex_format: VertexFormat,
    pub index_buffer: Option<IndexBuffer>,
    /// Opaque geometry skips any-hit invocation.
    pub opaque: bool,
}

impl GeometryHandle {
    /// Opaque, tightly packed, non-indexed triangle list.
    pub fn triangles(vertex_buffer: BufferHandle, vertex_count: u32) -> Self {
        Self {
            vertex_buffer,
            vertex_count,
            vertex_stride: VertexFormat::Float32x3.size(),
            vertex_format: VertexFormat::Float32x3,
            index_buffer: None,
            opaque: true,
        }
    }

    /// Attach an index buffer.
    #[must_use]
    pub fn with_indices(mut self, buffer: BufferHandle, count: u32, format: IndexFormat) -> Self {
        self.index_buffer = Some(IndexBuffer {
            buffer,
            count,
            format,
        });
        self
    }

    /// Number of triangles described.
    pub fn primitive_count(&self) -> u32 {
        self.index_buffer
            .map_or(self.vertex_count, |indices| indices.count)
            / 3
    }

    /// Reject geometry that cannot form a triangle list.
    pub fn validate(&self) -> Result<()> {
        if self.vertex_count == 0 {
            return Err(Error::InvalidInput("geometry has no vertices".to_string()));
        }
        if self.vertex_stride < self.vertex_format.size() {
            return Err(Error::InvalidInput(format!(
                "vertex stride {} is smaller than the vertex format ({} bytes)",
                self.vertex_stride,
                self.vertex_format.size()
            )));
        }
        let elements = self
            .index_buffer
            .map_or(self.vertex_count, |indices| indices.count);
        if elements == 0 || elements % 3 != 0 {
            return Err(Error::InvalidInput(format!(
                "{elements} elements do not form a triangle list"
            )));
        }
        Ok(())
    }
}

/// Identifier of one logical mesh; one BLAS is built per id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeometryId(pub u32);

/// One logical mesh: every entry becomes one geometry of the same BLAS.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshDesc {
    pub id: GeometryId,
    pub geometries: Vec<GeometryHandle>,
}

impl MeshDesc {
    /// Mesh made of a single geometry entry.
    pub fn single(id: GeometryId, geometry: GeometryHandle) -> Self {
        Self {
            id,
            geometries: vec![geometry],
        }
    }

    /// Validate every geometry entry.
    pub fn validate(&self) -> Result<()> {
        if self.geometries.is_empty() {
            return Err(Error::InvalidInput(format!(
                "mesh {:?} has no geometry entries",
                self.id
            )));
        }
        self.geometries.iter().try_for_each(GeometryHandle::validate)
    }

    /// Total triangle count over all entries.
    pub fn primitive_count(&self) -> u64 {
        self.geometries
            .iter()
            .map(|g| u64::from(g.primitive_count()))
            .sum()
    }
}

/// One entry of the TLAS instance list.
///
/// The position of an instance in the list is its instance index as seen by
/// hit shaders.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    /// Mesh whose BLAS this instance places.
    pub geometry: GeometryId,
    /// Object-to-world transform.
    pub transform: Mat4,
    /// Index into [`ShaderSet::hit_bindings`](crate::ShaderSet::hit_bindings).
    pub hit_binding: u32,
}

impl Instance {
    pub fn new(geometry: GeometryId, transform: Mat4, hit_binding: u32) -> Self {
        Self {
            geometry,
            transform,
            hit_binding,
        }
    }
}
