// Copyright 2026 the Basalt authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Vertex, index, and texel-buffer format descriptions.

/// What a vertex attribute feeds in the vertex shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    /// Object-space position.
    Position,
    /// Surface normal.
    Normal,
    /// Tangent vector.
    Tangent,
    /// Skinning blend weights.
    BlendWeights,
    /// Skinning blend indices.
    BlendIndices,
    /// Per-vertex color.
    Color,
    /// A texture-coordinate set, identified by index.
    TexCoord(u8),
    /// The built-in per-draw identifier stream.
    DrawId,
}

/// The in-memory layout of one vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// One 32-bit float.
    Float32,
    /// Two 32-bit floats.
    Float32x2,
    /// Three 32-bit floats.
    Float32x3,
    /// Four 32-bit floats.
    Float32x4,
    /// One 32-bit unsigned integer.
    Uint32,
    /// Four 8-bit unsigned integers.
    Uint8x4,
    /// Four 8-bit unsigned normalized values.
    Unorm8x4,
    /// Two 16-bit unsigned integers.
    Uint16x2,
}

impl VertexFormat {
    /// Size of one attribute of this format in bytes.
    pub const fn size_bytes(self) -> u32 {
        match self {
            VertexFormat::Float32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
            VertexFormat::Uint32 => 4,
            VertexFormat::Uint8x4 => 4,
            VertexFormat::Unorm8x4 => 4,
            VertexFormat::Uint16x2 => 4,
        }
    }
}

/// One attribute of a vertex declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexElement {
    /// What the attribute feeds.
    pub semantic: VertexSemantic,
    /// Its in-memory layout.
    pub format: VertexFormat,
}

impl VertexElement {
    /// Creates a vertex element.
    pub const fn new(semantic: VertexSemantic, format: VertexFormat) -> Self {
        Self { semantic, format }
    }
}

/// Byte size of one interleaved vertex described by `elements`.
pub fn vertex_size_bytes(elements: &[VertexElement]) -> u32 {
    elements.iter().map(|e| e.format.size_bytes()).sum()
}

/// Specifies the data type of indices in an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    /// Indices are 16-bit unsigned integers.
    Uint16,
    /// Indices are 32-bit unsigned integers.
    Uint32,
}

impl IndexFormat {
    /// Size of one index in bytes.
    pub const fn size_bytes(self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Primitive assembly mode for a set of vertex/index buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    /// Each vertex is an independent point.
    PointList,
    /// Each pair of vertices is an independent line.
    LineList,
    /// Consecutive vertices form a connected line.
    LineStrip,
    /// Each triple of vertices is an independent triangle.
    TriangleList,
    /// Consecutive vertices form a strip of triangles.
    TriangleStrip,
}

/// The texel layout a texel buffer is viewed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexelFormat {
    /// One 8-bit unsigned normalized channel.
    R8Unorm,
    /// Four 8-bit unsigned normalized channels.
    Rgba8Unorm,
    /// One 32-bit float channel.
    R32Float,
    /// Four 32-bit float channels.
    Rgba32Float,
    /// One 32-bit unsigned integer channel.
    R32Uint,
    /// Four 32-bit unsigned integer channels.
    Rgba32Uint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_vertex_size() {
        let elements = [
            VertexElement::new(VertexSemantic::Position, VertexFormat::Float32x3),
            VertexElement::new(VertexSemantic::Normal, VertexFormat::Float32x3),
            VertexElement::new(VertexSemantic::TexCoord(0), VertexFormat::Float32x2),
        ];
        assert_eq!(vertex_size_bytes(&elements), 32);
        assert_eq!(vertex_size_bytes(&[]), 0);
    }
}
