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

//! A software [`GraphicsDevice`] keeping every buffer in host memory.
//!
//! Good enough to run the whole allocator end to end: copies and writes are
//! plain `memcpy`s, and each fence signals after one status poll, so the
//! spin-waits actually spin once like they would against a real queue.

use basalt_core::renderer::api::{BufferDescriptor, BufferId, FenceId, MapMode, MemoryClass};
use basalt_core::renderer::error::ResourceError;
use basalt_core::renderer::traits::{DeviceFeature, GraphicsDevice};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

#[derive(Debug)]
struct SoftwareBuffer {
    data: Box<[u8]>,
    mapped: bool,
}

#[derive(Debug, Default)]
struct DeviceState {
    buffers: HashMap<usize, SoftwareBuffer>,
    fences: HashMap<usize, bool>,
    next_buffer: usize,
    next_fence: usize,
}

/// All device state behind one lock; the allocator drives it from a single
/// thread.
#[derive(Debug, Default)]
pub struct SoftwareDevice {
    state: Mutex<DeviceState>,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(
        &self,
        descriptor: &BufferDescriptor<'_>,
        data: Option<&[u8]>,
    ) -> Result<BufferId, ResourceError> {
        if descriptor.memory == MemoryClass::Immutable && data.is_none() {
            return Err(ResourceError::BackendError(
                "immutable buffer without initial data".to_string(),
            ));
        }
        let mut bytes = vec![0u8; descriptor.size as usize];
        if let Some(data) = data {
            bytes[..data.len()].copy_from_slice(data);
        }
        let mut state = self.lock();
        let id = state.next_buffer;
        state.next_buffer += 1;
        state.buffers.insert(
            id,
            SoftwareBuffer {
                data: bytes.into_boxed_slice(),
                mapped: false,
            },
        );
        log::debug!(
            "SoftwareDevice: buffer #{id} created ({} bytes, {:?})",
            descriptor.size,
            descriptor.label.as_deref().unwrap_or("unnamed")
        );
        Ok(BufferId(id))
    }
}

impl GraphicsDevice for SoftwareDevice {
    fn create_buffer(&self, descriptor: &BufferDescriptor<'_>) -> Result<BufferId, ResourceError> {
        self.insert(descriptor, None)
    }

    fn create_buffer_with_data(
        &self,
        descriptor: &BufferDescriptor<'_>,
        data: &[u8],
    ) -> Result<BufferId, ResourceError> {
        self.insert(descriptor, Some(data))
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        self.lock()
            .buffers
            .remove(&id.0)
            .map(|_| log::debug!("SoftwareDevice: buffer #{} destroyed", id.0))
            .ok_or(ResourceError::NotFound)
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        let mut state = self.lock();
        let buffer = state.buffers.get_mut(&id.0).ok_or(ResourceError::NotFound)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.data.len() {
            return Err(ResourceError::OutOfBounds);
        }
        buffer.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn map_buffer(&self, id: BufferId, _mode: MapMode) -> Result<NonNull<u8>, ResourceError> {
        let mut state = self.lock();
        let buffer = state.buffers.get_mut(&id.0).ok_or(ResourceError::NotFound)?;
        buffer.mapped = true;
        NonNull::new(buffer.data.as_mut_ptr())
            .ok_or_else(|| ResourceError::BackendError("null mapping".to_string()))
    }

    fn unmap_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        let mut state = self.lock();
        let buffer = state.buffers.get_mut(&id.0).ok_or(ResourceError::NotFound)?;
        buffer.mapped = false;
        Ok(())
    }

    fn copy_buffer_region(
        &self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size_bytes: u64,
    ) -> Result<(), ResourceError> {
        let mut state = self.lock();
        let chunk = {
            let buffer = state.buffers.get(&src.0).ok_or(ResourceError::NotFound)?;
            let range = src_offset as usize..(src_offset + size_bytes) as usize;
            if range.end > buffer.data.len() {
                return Err(ResourceError::OutOfBounds);
            }
            buffer.data[range].to_vec()
        };
        let buffer = state.buffers.get_mut(&dst.0).ok_or(ResourceError::NotFound)?;
        let range = dst_offset as usize..(dst_offset + size_bytes) as usize;
        if range.end > buffer.data.len() {
            return Err(ResourceError::OutOfBounds);
        }
        buffer.data[range].copy_from_slice(&chunk);
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceId, ResourceError> {
        let mut state = self.lock();
        let id = state.next_fence;
        state.next_fence += 1;
        // Everything "submitted" has already run; signal on the next poll.
        state.fences.insert(id, false);
        Ok(FenceId(id))
    }

    fn fence_status(&self, fence: FenceId) -> Result<bool, ResourceError> {
        let mut state = self.lock();
        let signaled = state
            .fences
            .get_mut(&fence.0)
            .ok_or(ResourceError::NotFound)?;
        let was = *signaled;
        *signaled = true;
        Ok(was)
    }

    fn destroy_fence(&self, fence: FenceId) -> Result<(), ResourceError> {
        self.lock()
            .fences
            .remove(&fence.0)
            .map(|_| ())
            .ok_or(ResourceError::NotFound)
    }

    fn supports_feature(&self, feature: DeviceFeature) -> bool {
        match feature {
            DeviceFeature::NoOverwriteOnShaderBuffers => true,
            DeviceFeature::IndirectBuffers => true,
            DeviceFeature::PersistentMapping => false,
        }
    }
}
