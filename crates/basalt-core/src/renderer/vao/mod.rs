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

//! The buffer-pool subsystem.
//!
//! [`VaoManager`] is the entry point: it sub-allocates logical buffers from
//! pooled device buffers, batches immutable-buffer creation, deduplicates
//! vertex-array binding sets, and owns the frame fence ring. The supporting
//! pieces — [`DynamicBuffer`], [`StagingBuffer`], [`AsyncTicket`] — are
//! exposed for callers that drive transfers directly.

mod block;
mod buffer_interface;
mod packed_buffer;

pub mod async_ticket;
pub mod dynamic_buffer;
pub mod staging_buffer;
pub mod vao_manager;

#[cfg(test)]
pub(crate) mod test_device;

pub use async_ticket::AsyncTicket;
pub use buffer_interface::MappedRegion;
pub use dynamic_buffer::{DynamicBuffer, MapTicket};
pub use packed_buffer::{
    AnyBufferHandle, BufferCategory, ConstBufferHandle, IndexBufferHandle, IndirectBufferHandle,
    TexelBufferHandle, UavBufferHandle, VertexArrayHandle, VertexBufferHandle,
};
pub use staging_buffer::{CopyDestination, StagingBuffer, StagingStallType};
pub use vao_manager::{
    MemoryStats, PoolClass, PoolSizes, UploadDestination, VaoManager, VaoManagerConfig,
    VertexArrayLayout, VertexBinding,
};

use crate::renderer::api::FenceId;
use crate::renderer::error::VaoError;
use crate::renderer::traits::GraphicsDevice;

/// Blocks until `fence` signals.
///
/// Busy-polls the fence, yielding the processor each iteration: fence
/// delays are typically sub-millisecond, so the spin beats parking the
/// thread. There is no timeout; a driver failure surfaces as an error, but
/// a hung GPU produces an unbounded wait.
pub(crate) fn wait_for_fence(
    device: &dyn GraphicsDevice,
    fence: FenceId,
) -> Result<(), VaoError> {
    while !device.fence_status(fence).map_err(VaoError::Resource)? {
        std::thread::yield_now();
    }
    Ok(())
}
