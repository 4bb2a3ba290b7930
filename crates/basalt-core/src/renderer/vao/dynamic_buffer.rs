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

//! Multi-region map tracking over one physical buffer.

use crate::renderer::api::{BufferId, MapMode};
use crate::renderer::error::ResourceError;
use crate::renderer::traits::GraphicsDevice;
use std::ptr::NonNull;

/// Identifies one live sub-region mapping of a [`DynamicBuffer`].
///
/// Returned by [`DynamicBuffer::map`] and consumed by
/// [`DynamicBuffer::unmap`]. Ticket slots are recycled, so a stale ticket
/// becomes meaningful again after reuse; holding one past its unmap is a
/// contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapTicket(usize);

#[derive(Debug, Clone, Copy)]
struct MappedRange {
    start: u64,
    count: u64,
}

/// Presents one physical "map the whole buffer" operation as many
/// independent logical sub-region maps.
///
/// The platform disallows mapping the same buffer object twice concurrently,
/// but a pool buffer hosts many logical buffers that map independently. The
/// first sub-map performs the real map call; later sub-maps reuse the mapped
/// pointer; the unmap of the last live sub-region performs the real unmap.
///
/// No overlap checking is performed. Callers are contractually responsible
/// for disjoint regions and for synchronizing against the GPU.
#[derive(Debug)]
pub struct DynamicBuffer {
    buffer: BufferId,
    size_bytes: u64,
    mapped_ptr: Option<NonNull<u8>>,
    mapped_ranges: Vec<MappedRange>,
    /// Slots of `mapped_ranges` available for reuse, so the vector does not
    /// grow without bound over the buffer's lifetime.
    free_ranges: Vec<usize>,
}

// The mapped pointer is only dereferenced by the thread driving the device.
unsafe impl Send for DynamicBuffer {}
unsafe impl Sync for DynamicBuffer {}

impl DynamicBuffer {
    /// Wraps the pool buffer `buffer` of `size_bytes` bytes.
    pub fn new(buffer: BufferId, size_bytes: u64) -> Self {
        Self {
            buffer,
            size_bytes,
            mapped_ptr: None,
            mapped_ranges: Vec::new(),
            free_ranges: Vec::new(),
        }
    }

    /// The physical buffer being multiplexed.
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    fn active_mappings(&self) -> usize {
        self.mapped_ranges.len() - self.free_ranges.len()
    }

    fn add_mapped_range(&mut self, start: u64, count: u64) -> usize {
        match self.free_ranges.pop() {
            Some(idx) => {
                self.mapped_ranges[idx] = MappedRange { start, count };
                idx
            }
            None => {
                self.mapped_ranges.push(MappedRange { start, count });
                self.mapped_ranges.len() - 1
            }
        }
    }

    /// Maps `count` bytes starting at byte `start`.
    ///
    /// Performs the real map call only when no other sub-region is live;
    /// otherwise returns a pointer computed from the existing mapping.
    pub fn map(
        &mut self,
        device: &dyn GraphicsDevice,
        start: u64,
        count: u64,
    ) -> Result<(NonNull<u8>, MapTicket), ResourceError> {
        debug_assert!(
            start + count <= self.size_bytes,
            "mapped range {start}..{} exceeds buffer size {}",
            start + count,
            self.size_bytes
        );

        let base = match self.mapped_ptr {
            Some(ptr) => ptr,
            None => {
                let ptr = device.map_buffer(self.buffer, MapMode::WriteNoOverwrite)?;
                self.mapped_ptr = Some(ptr);
                ptr
            }
        };

        let ticket = MapTicket(self.add_mapped_range(start, count));
        // In bounds per the assert above; the device keeps `base` valid
        // until the final unmap.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(start as usize)) };
        Ok((ptr, ticket))
    }

    /// Releases the sub-region identified by `ticket`.
    ///
    /// The real unmap happens when this was the last live sub-region.
    pub fn unmap(
        &mut self,
        device: &dyn GraphicsDevice,
        ticket: MapTicket,
    ) -> Result<(), ResourceError> {
        debug_assert!(ticket.0 < self.mapped_ranges.len(), "unknown map ticket");
        debug_assert!(
            !self.free_ranges.contains(&ticket.0),
            "map ticket released twice"
        );

        self.free_ranges.push(ticket.0);
        if self.active_mappings() == 0 {
            self.mapped_ranges.clear();
            self.free_ranges.clear();
            self.mapped_ptr = None;
            device.unmap_buffer(self.buffer)?;
        }
        Ok(())
    }
}
