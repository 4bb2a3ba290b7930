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

//! A mock graphics device with real byte storage for the subsystem tests.

use crate::renderer::api::{BufferDescriptor, BufferId, FenceId, MapMode, MemoryClass};
use crate::renderer::error::ResourceError;
use crate::renderer::traits::{DeviceFeature, GraphicsDevice};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

#[derive(Debug)]
struct TestBuffer {
    data: Box<[u8]>,
    mapped: bool,
    memory: MemoryClass,
}

#[derive(Debug, Default)]
struct DeviceState {
    buffers: HashMap<usize, TestBuffer>,
    /// Fence id → polls remaining before the fence reports completion.
    fences: HashMap<usize, u32>,
    next_buffer: usize,
    next_fence: usize,
    map_log: Vec<(BufferId, MapMode)>,
    map_calls: u32,
    unmap_calls: u32,
    fail_next_create: bool,
}

/// A [`GraphicsDevice`] double backed by heap memory.
///
/// Buffers store real bytes so upload/merge/download round-trips are
/// observable. Fences simulate GPU latency by reporting completion only
/// after a configurable number of status polls, so waits terminate without
/// ever being trivially instant.
#[derive(Debug)]
pub(crate) struct TestDevice {
    state: Mutex<DeviceState>,
    fence_latency: u32,
    no_overwrite_shader_buffers: bool,
    indirect_buffers: bool,
}

impl TestDevice {
    pub fn new() -> Self {
        Self::with_fence_latency(0)
    }

    pub fn with_fence_latency(fence_latency: u32) -> Self {
        Self {
            state: Mutex::new(DeviceState::default()),
            fence_latency,
            no_overwrite_shader_buffers: true,
            indirect_buffers: true,
        }
    }

    pub fn without_features() -> Self {
        Self {
            no_overwrite_shader_buffers: false,
            indirect_buffers: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next buffer creation fail, simulating memory exhaustion.
    pub fn fail_next_create(&self) {
        self.lock().fail_next_create = true;
    }

    pub fn buffer_contents(&self, id: BufferId) -> Vec<u8> {
        self.lock().buffers[&id.0].data.to_vec()
    }

    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn live_fence_count(&self) -> usize {
        self.lock().fences.len()
    }

    pub fn map_log(&self) -> Vec<(BufferId, MapMode)> {
        self.lock().map_log.clone()
    }

    pub fn map_calls(&self) -> u32 {
        self.lock().map_calls
    }

    pub fn unmap_calls(&self) -> u32 {
        self.lock().unmap_calls
    }

    fn insert_buffer(
        &self,
        descriptor: &BufferDescriptor<'_>,
        data: Option<&[u8]>,
    ) -> Result<BufferId, ResourceError> {
        let mut state = self.lock();
        if state.fail_next_create {
            state.fail_next_create = false;
            return Err(ResourceError::BackendError("E_OUTOFMEMORY".to_string()));
        }
        if descriptor.memory == MemoryClass::Immutable && data.is_none() {
            return Err(ResourceError::BackendError(
                "immutable buffer created without initial data".to_string(),
            ));
        }
        let mut bytes = vec![0u8; descriptor.size as usize];
        if let Some(data) = data {
            bytes[..data.len()].copy_from_slice(data);
        }
        let id = state.next_buffer;
        state.next_buffer += 1;
        state.buffers.insert(
            id,
            TestBuffer {
                data: bytes.into_boxed_slice(),
                mapped: false,
                memory: descriptor.memory,
            },
        );
        Ok(BufferId(id))
    }
}

impl GraphicsDevice for TestDevice {
    fn create_buffer(&self, descriptor: &BufferDescriptor<'_>) -> Result<BufferId, ResourceError> {
        self.insert_buffer(descriptor, None)
    }

    fn create_buffer_with_data(
        &self,
        descriptor: &BufferDescriptor<'_>,
        data: &[u8],
    ) -> Result<BufferId, ResourceError> {
        self.insert_buffer(descriptor, Some(data))
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        self.lock()
            .buffers
            .remove(&id.0)
            .map(|_| ())
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

    fn map_buffer(&self, id: BufferId, mode: MapMode) -> Result<NonNull<u8>, ResourceError> {
        let mut state = self.lock();
        state.map_log.push((id, mode));
        state.map_calls += 1;
        let buffer = state.buffers.get_mut(&id.0).ok_or(ResourceError::NotFound)?;
        debug_assert!(!buffer.mapped, "buffer {id:?} mapped twice");
        buffer.mapped = true;
        NonNull::new(buffer.data.as_mut_ptr())
            .ok_or_else(|| ResourceError::BackendError("null mapping".to_string()))
    }

    fn unmap_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        let mut state = self.lock();
        state.unmap_calls += 1;
        let buffer = state.buffers.get_mut(&id.0).ok_or(ResourceError::NotFound)?;
        debug_assert!(buffer.mapped, "buffer {id:?} was not mapped");
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
        let src_range = src_offset as usize..(src_offset + size_bytes) as usize;
        let chunk = {
            let buffer = state.buffers.get(&src.0).ok_or(ResourceError::NotFound)?;
            if src_range.end > buffer.data.len() {
                return Err(ResourceError::OutOfBounds);
            }
            buffer.data[src_range].to_vec()
        };
        let buffer = state.buffers.get_mut(&dst.0).ok_or(ResourceError::NotFound)?;
        let dst_range = dst_offset as usize..(dst_offset + size_bytes) as usize;
        if dst_range.end > buffer.data.len() {
            return Err(ResourceError::OutOfBounds);
        }
        buffer.data[dst_range].copy_from_slice(&chunk);
        Ok(())
    }

    fn create_fence(&self) -> Result<FenceId, ResourceError> {
        let mut state = self.lock();
        let id = state.next_fence;
        state.next_fence += 1;
        let latency = self.fence_latency;
        state.fences.insert(id, latency);
        Ok(FenceId(id))
    }

    fn fence_status(&self, fence: FenceId) -> Result<bool, ResourceError> {
        let mut state = self.lock();
        let remaining = state
            .fences
            .get_mut(&fence.0)
            .ok_or(ResourceError::NotFound)?;
        if *remaining == 0 {
            Ok(true)
        } else {
            *remaining -= 1;
            Ok(false)
        }
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
            DeviceFeature::NoOverwriteOnShaderBuffers => self.no_overwrite_shader_buffers,
            DeviceFeature::IndirectBuffers => self.indirect_buffers,
            DeviceFeature::PersistentMapping => false,
        }
    }
}
