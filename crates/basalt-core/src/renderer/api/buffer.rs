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

//! Defines data structures related to GPU buffer resources.

use crate::basalt_bitflags;
use std::borrow::Cow;

basalt_bitflags! {
    /// A set of flags describing the allowed usages of a [`BufferId`].
    ///
    /// The graphics driver uses these to place the buffer in the most
    /// suitable memory type and to validate usage at runtime.
    pub struct BufferUsage: u32 {
        /// The buffer can be mapped for reading on the CPU.
        const MAP_READ = 1 << 0;
        /// The buffer can be mapped for writing on the CPU.
        const MAP_WRITE = 1 << 1;
        /// The buffer can be the source of a copy operation.
        const COPY_SRC = 1 << 2;
        /// The buffer can be the destination of a copy operation.
        const COPY_DST = 1 << 3;

        /// The buffer can be bound as a vertex buffer.
        const VERTEX = 1 << 4;
        /// The buffer can be bound as an index buffer.
        const INDEX = 1 << 5;
        /// The buffer can be bound as a uniform (constant) buffer.
        const UNIFORM = 1 << 6;
        /// The buffer can be bound as a texel buffer (shader resource view).
        const TEXEL = 1 << 7;
        /// The buffer can be bound as a storage buffer (read/write from shaders).
        const STORAGE = 1 << 8;
        /// The buffer can feed indirect draw or dispatch commands.
        const INDIRECT = 1 << 9;
    }
}

/// The memory placement class a buffer is created with.
///
/// Mirrors the usage classes of the underlying platform: the class fixes
/// which CPU access (if any) the buffer supports for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// GPU-only memory whose content is fixed at creation; requires initial
    /// data and can never be written again.
    Immutable,
    /// GPU-only memory, updatable through [`write_buffer`] or copies.
    ///
    /// [`write_buffer`]: crate::renderer::traits::GraphicsDevice::write_buffer
    Static,
    /// CPU-write-visible memory intended for per-frame updates via mapping.
    Dynamic,
    /// CPU-read-visible memory for GPU → CPU readback.
    Staging,
}

/// A descriptor used to create a [`BufferId`].
#[derive(Debug, Clone)]
pub struct BufferDescriptor<'a> {
    /// An optional debug label for the buffer.
    pub label: Option<Cow<'a, str>>,
    /// The total size of the buffer in bytes.
    pub size: u64,
    /// A bitmask of [`BufferUsage`] flags describing how the buffer will be used.
    pub usage: BufferUsage,
    /// The memory placement class.
    pub memory: MemoryClass,
    /// Element stride for structured (storage) buffers; `0` when unused.
    pub structure_stride: u32,
}

/// An opaque handle to a GPU buffer resource.
///
/// Returned by [`GraphicsDevice::create_buffer`] and used to reference the
/// buffer in all subsequent operations.
///
/// [`GraphicsDevice::create_buffer`]: crate::renderer::traits::GraphicsDevice::create_buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub usize);

/// How a buffer mapping synchronizes with in-flight GPU work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    /// Map for reading. The caller must have ensured the GPU writes are done.
    Read,
    /// Map for writing, telling the driver the previous content can be
    /// discarded (the driver may rename the allocation; never stalls on the
    /// GPU still reading the old content).
    WriteDiscard,
    /// Map for writing, promising not to touch any region the GPU may still
    /// be reading. The caller is responsible for that promise.
    WriteNoOverwrite,
}

/// The usage class of a logical buffer managed by the allocator.
///
/// Determines which pool the buffer is sub-allocated from and which
/// map/upload policy applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    /// Content fixed at creation; creation is deferred so many small
    /// immutable buffers can be merged into one device buffer.
    Immutable,
    /// GPU-only; updated through staging uploads, never mapped.
    Default,
    /// CPU-mappable, rotated across the frame ring to avoid stalls.
    DynamicDefault,
    /// Persistent mapping requested. The platform does not support it, so
    /// this degrades to [`BufferType::DynamicDefault`].
    DynamicPersistent,
    /// Persistent + coherent mapping requested; degrades like
    /// [`BufferType::DynamicPersistent`].
    DynamicPersistentCoherent,
}

impl BufferType {
    /// Whether this usage class maps and rotates across the frame ring.
    pub const fn is_dynamic(self) -> bool {
        matches!(
            self,
            BufferType::DynamicDefault
                | BufferType::DynamicPersistent
                | BufferType::DynamicPersistentCoherent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_classes() {
        assert!(!BufferType::Immutable.is_dynamic());
        assert!(!BufferType::Default.is_dynamic());
        assert!(BufferType::DynamicDefault.is_dynamic());
        assert!(BufferType::DynamicPersistent.is_dynamic());
        assert!(BufferType::DynamicPersistentCoherent.is_dynamic());
    }

    #[test]
    fn usage_flag_composition() {
        let usage = BufferUsage::VERTEX | BufferUsage::COPY_DST;
        assert!(usage.contains(BufferUsage::VERTEX));
        assert!(!usage.contains(BufferUsage::MAP_WRITE));
    }
}
