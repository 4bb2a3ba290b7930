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

//! Logical buffer records and the opaque handles that reference them.

use crate::renderer::api::{BufferType, IndexFormat, TexelFormat, VertexElement};
use crate::renderer::vao::buffer_interface::{BufferInterface, MappingState};
use std::sync::Arc;

/// The pool family a logical buffer is sub-allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferCategory {
    /// Vertex-buffer pools.
    Vertex = 0,
    /// Index-buffer pools.
    Index = 1,
    /// Shader-visible pools (texel, indirect).
    Shader = 2,
}

macro_rules! buffer_handle {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u64);
    };
}

buffer_handle! {
    /// Opaque handle to a vertex buffer owned by the [`VaoManager`](crate::renderer::vao::VaoManager).
    VertexBufferHandle
}
buffer_handle! {
    /// Opaque handle to an index buffer.
    IndexBufferHandle
}
buffer_handle! {
    /// Opaque handle to a constant buffer.
    ConstBufferHandle
}
buffer_handle! {
    /// Opaque handle to a texel buffer.
    TexelBufferHandle
}
buffer_handle! {
    /// Opaque handle to an indirect-argument buffer.
    IndirectBufferHandle
}
buffer_handle! {
    /// Opaque handle to an unordered-access (storage) buffer.
    UavBufferHandle
}
buffer_handle! {
    /// Opaque handle to a vertex array (deduplicated binding set).
    VertexArrayHandle
}

/// Any buffer handle, for entry points shared by all buffer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnyBufferHandle {
    /// A vertex buffer.
    Vertex(VertexBufferHandle),
    /// An index buffer.
    Index(IndexBufferHandle),
    /// A constant buffer.
    Const(ConstBufferHandle),
    /// A texel buffer.
    Texel(TexelBufferHandle),
    /// An indirect-argument buffer.
    Indirect(IndirectBufferHandle),
    /// An unordered-access buffer.
    Uav(UavBufferHandle),
}

impl AnyBufferHandle {
    pub(crate) fn raw(self) -> u64 {
        match self {
            AnyBufferHandle::Vertex(h) => h.0,
            AnyBufferHandle::Index(h) => h.0,
            AnyBufferHandle::Const(h) => h.0,
            AnyBufferHandle::Texel(h) => h.0,
            AnyBufferHandle::Indirect(h) => h.0,
            AnyBufferHandle::Uav(h) => h.0,
        }
    }
}

macro_rules! any_handle_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for AnyBufferHandle {
            fn from(handle: $ty) -> Self {
                AnyBufferHandle::$variant(handle)
            }
        }
    };
}

any_handle_from!(Vertex, VertexBufferHandle);
any_handle_from!(Index, IndexBufferHandle);
any_handle_from!(Const, ConstBufferHandle);
any_handle_from!(Texel, TexelBufferHandle);
any_handle_from!(Indirect, IndirectBufferHandle);
any_handle_from!(Uav, UavBufferHandle);

/// Kind-specific payload of a buffer record.
#[derive(Debug)]
pub(crate) enum BufferKind {
    Vertex { elements: Vec<VertexElement> },
    Index { format: IndexFormat },
    Const,
    Texel { format: TexelFormat },
    Indirect,
    Uav,
}

/// One logical buffer tracked by the manager.
#[derive(Debug)]
pub(crate) struct BufferRecord {
    pub category: BufferCategory,
    pub buffer_type: BufferType,
    /// Element index of the frame-0 copy inside the pool buffer.
    pub buffer_start: u64,
    /// Element index of the current frame's copy; equals `buffer_start` for
    /// non-dynamic buffers and rotates for dynamic ones.
    pub final_buffer_start: u64,
    pub num_elements: u64,
    pub bytes_per_element: u32,
    /// Extra elements allocated beyond `num_elements` so per-frame offsets
    /// stay aligned.
    pub num_elements_padding: u64,
    pub shadow_copy: Option<Arc<[u8]>>,
    pub mapping: MappingState,
    pub interface: BufferInterface,
    pub kind: BufferKind,
}

impl BufferRecord {
    /// Bytes of actual content (excluding alignment padding).
    pub fn total_size_bytes(&self) -> u64 {
        self.num_elements * self.bytes_per_element as u64
    }

    /// Elements between consecutive frame copies of a dynamic buffer.
    pub fn frame_stride_elements(&self) -> u64 {
        self.num_elements + self.num_elements_padding
    }

    /// Bytes reserved in the pool for one frame copy.
    pub fn internal_size_bytes(&self) -> u64 {
        self.frame_stride_elements() * self.bytes_per_element as u64
    }
}
