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

//! The collaborator boundary to the native graphics driver.

use crate::renderer::api::{BufferDescriptor, BufferId, FenceId, MapMode};
use crate::renderer::error::ResourceError;
use std::fmt::Debug;
use std::ptr::NonNull;

/// An optional capability a device implementation may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFeature {
    /// Mapping shader-visible buffers with
    /// [`MapMode::WriteNoOverwrite`](crate::renderer::api::MapMode::WriteNoOverwrite)
    /// is supported, so texel buffers can live in the common pools.
    NoOverwriteOnShaderBuffers,
    /// Indirect draw/dispatch argument buffers are supported in device
    /// memory; without this they are emulated in CPU memory.
    IndirectBuffers,
    /// Buffers can stay mapped while the GPU reads them. Not available on
    /// this subsystem's reference platform; dynamic buffers degrade to
    /// per-frame map/unmap when absent.
    PersistentMapping,
}

/// The driver entry points the buffer subsystem is built on.
///
/// Implementations wrap one native device + immediate context. All methods
/// take `&self`; an implementation is free to synchronize internally, but the
/// allocator itself assumes serialized access from the one thread issuing GPU
/// commands.
pub trait GraphicsDevice: Send + Sync + Debug {
    /// Creates a new GPU buffer.
    ///
    /// ## Errors
    /// * [`ResourceError::BackendError`] when the driver rejects the request
    ///   (typically out of video memory).
    fn create_buffer(&self, descriptor: &BufferDescriptor<'_>) -> Result<BufferId, ResourceError>;

    /// Creates a new GPU buffer initialized with `data`.
    ///
    /// This is the only way to create a buffer of
    /// [`MemoryClass::Immutable`](crate::renderer::api::MemoryClass::Immutable),
    /// whose content must be supplied up front.
    fn create_buffer_with_data(
        &self,
        descriptor: &BufferDescriptor<'_>,
        data: &[u8],
    ) -> Result<BufferId, ResourceError>;

    /// Destroys a GPU buffer.
    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError>;

    /// Writes `data` into a [`MemoryClass::Static`](crate::renderer::api::MemoryClass::Static)
    /// buffer at `offset`, scheduled on the GPU timeline.
    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError>;

    /// Maps a whole CPU-visible buffer and returns the base pointer.
    ///
    /// At most one mapping of a buffer may be outstanding; the pointer stays
    /// valid until [`unmap_buffer`](GraphicsDevice::unmap_buffer). The
    /// allocator multiplexes logical sub-region maps over this single call.
    fn map_buffer(&self, id: BufferId, mode: MapMode) -> Result<NonNull<u8>, ResourceError>;

    /// Unmaps a previously mapped buffer, invalidating its base pointer.
    fn unmap_buffer(&self, id: BufferId) -> Result<(), ResourceError>;

    /// Enqueues a GPU-side copy of `size_bytes` from `src` at `src_offset`
    /// into `dst` at `dst_offset`.
    fn copy_buffer_region(
        &self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size_bytes: u64,
    ) -> Result<(), ResourceError>;

    /// Inserts a fence into the command stream, recording all GPU work
    /// submitted so far.
    fn create_fence(&self) -> Result<FenceId, ResourceError>;

    /// Non-blocking completion query for a fence.
    ///
    /// ## Errors
    /// * [`ResourceError::BackendError`] on driver failure (e.g., device
    ///   removed); waiting loops treat this as fatal rather than spinning on.
    fn fence_status(&self, fence: FenceId) -> Result<bool, ResourceError>;

    /// Releases a fence.
    fn destroy_fence(&self, fence: FenceId) -> Result<(), ResourceError>;

    /// Indicates whether an optional capability is supported.
    fn supports_feature(&self, feature: DeviceFeature) -> bool;
}
