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

//! Per-buffer map/upload policy state.

use crate::renderer::api::{BufferId, MapMode};
use crate::renderer::vao::dynamic_buffer::MapTicket;
use std::ptr::NonNull;
use std::sync::Arc;

/// A live mapped view of buffer memory.
///
/// Obtained from a map operation and handed back to the matching unmap,
/// which consumes it; the wrapped pointer therefore never outlives the
/// mapping. Accessors are bounds-checked against the mapped length.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size_bytes: u64,
}

// Regions are written by the one thread driving the device.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    pub(crate) fn new(ptr: NonNull<u8>, size_bytes: u64) -> Self {
        Self { ptr, size_bytes }
    }

    /// Length of the mapped region in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Copies `data` into the region at `offset_bytes`.
    ///
    /// # Panics
    /// Panics when the write would exceed the mapped length.
    pub fn write(&mut self, offset_bytes: u64, data: &[u8]) {
        assert!(
            offset_bytes + data.len() as u64 <= self.size_bytes,
            "write of {} bytes at {offset_bytes} exceeds mapped length {}",
            data.len(),
            self.size_bytes
        );
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset_bytes as usize)
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
    }

    /// Copies bytes out of the region at `offset_bytes` into `out`.
    ///
    /// # Panics
    /// Panics when the read would exceed the mapped length.
    pub fn read(&self, offset_bytes: u64, out: &mut [u8]) {
        assert!(
            offset_bytes + out.len() as u64 <= self.size_bytes,
            "read of {} bytes at {offset_bytes} exceeds mapped length {}",
            out.len(),
            self.size_bytes
        );
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset_bytes as usize)
                .copy_to_nonoverlapping(out.as_mut_ptr(), out.len());
        }
    }

    /// The whole mapped region as bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size_bytes as usize];
        self.read(0, &mut out);
        out
    }
}

/// Mapping state of one logical buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MappingState {
    Unmapped,
    Mapped,
}

/// Policy state for buffers sub-allocated from the common pools.
///
/// `buffer` is `None` while an immutable buffer waits in the deferred-batch
/// queue; `pending_upload` holds its bytes until the batch point, where the
/// interface is patched to point at the real pool buffer.
#[derive(Debug)]
pub(crate) struct StandardInterface {
    pub vbo_index: usize,
    pub buffer: Option<BufferId>,
    pub pending_upload: Option<Arc<[u8]>>,
    pub map_ticket: Option<MapTicket>,
}

impl StandardInterface {
    pub fn pooled(vbo_index: usize, buffer: BufferId) -> Self {
        Self {
            vbo_index,
            buffer: Some(buffer),
            pending_upload: None,
            map_ticket: None,
        }
    }

    pub fn deferred(pending_upload: Arc<[u8]>) -> Self {
        Self {
            vbo_index: 0,
            buffer: None,
            pending_upload: Some(pending_upload),
            map_ticket: None,
        }
    }
}

/// Policy state for buffers that own a dedicated device buffer because the
/// platform cannot no-overwrite-map their kind (constant buffers always;
/// texel buffers on older feature levels).
///
/// Each map must choose between discard and no-overwrite: discard is forced
/// whenever the new write region starts at or before the end of the previous
/// mapped region (the write head has wrapped); a region strictly beyond all
/// prior writes is safe to no-overwrite.
#[derive(Debug)]
pub(crate) struct CompatInterface {
    pub buffer: BufferId,
    pub last_mapping_start: u64,
    pub last_mapping_count: u64,
}

impl CompatInterface {
    pub fn new(buffer: BufferId) -> Self {
        Self {
            buffer,
            last_mapping_start: 0,
            last_mapping_count: 0,
        }
    }

    pub fn choose_map_mode(&self, elem_start: u64) -> MapMode {
        if elem_start <= self.last_mapping_start + self.last_mapping_count {
            MapMode::WriteDiscard
        } else {
            MapMode::WriteNoOverwrite
        }
    }

    pub fn record_mapping(&mut self, elem_start: u64, elem_count: u64) {
        self.last_mapping_start = elem_start;
        self.last_mapping_count = elem_count;
    }
}

/// The per-buffer policy object variants.
#[derive(Debug)]
pub(crate) enum BufferInterface {
    Standard(StandardInterface),
    Compat(CompatInterface),
    /// CPU-side emulation for indirect buffers on devices without indirect
    /// support; maps return this memory directly.
    Software { data: Box<[u8]> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compat_wrapping_write_forces_discard() {
        let mut compat = CompatInterface::new(BufferId(1));

        // First map after creation discards.
        assert_eq!(compat.choose_map_mode(0), MapMode::WriteDiscard);
        compat.record_mapping(0, 100);

        // Overlapping the prior write's tail must discard.
        assert_eq!(compat.choose_map_mode(50), MapMode::WriteDiscard);
        // Exactly at the prior end still discards.
        assert_eq!(compat.choose_map_mode(100), MapMode::WriteDiscard);
        // Strictly beyond all prior writes is safe.
        assert_eq!(compat.choose_map_mode(200), MapMode::WriteNoOverwrite);
    }

    #[test]
    fn mapped_region_round_trip() {
        let mut backing = vec![0u8; 64];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let mut region = MappedRegion::new(ptr, 64);

        region.write(8, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        region.read(8, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(region.to_vec()[8..12], [1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "exceeds mapped length")]
    fn mapped_region_rejects_out_of_range_write() {
        let mut backing = vec![0u8; 16];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let mut region = MappedRegion::new(ptr, 16);
        region.write(12, &[0; 8]);
    }
}
