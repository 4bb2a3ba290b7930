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

//! CPU-visible staging area for asynchronous uploads and downloads.

use crate::renderer::api::{BufferId, MapMode};
use crate::renderer::error::VaoError;
use crate::renderer::traits::GraphicsDevice;
use crate::renderer::vao::block::{merge_contiguous_blocks, Block};
use crate::renderer::vao::buffer_interface::MappedRegion;
use std::ptr::NonNull;

/// How much an upload of a given size is expected to stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingStallType {
    /// The write proceeds with no-overwrite semantics; no stall expected.
    NoStall,
    /// The write wraps the buffer and forces a discard. The driver usually
    /// renames the allocation, but that cannot be guaranteed, so a partial
    /// stall is conservatively reported.
    Partial,
    /// The request cannot be satisfied without draining in-flight work.
    Full,
}

/// One GPU-side copy performed when an upload mapping is committed.
#[derive(Debug, Clone, Copy)]
pub struct CopyDestination {
    /// Destination device buffer.
    pub buffer: BufferId,
    /// Byte offset inside the destination buffer.
    pub dst_offset_bytes: u64,
    /// Byte offset inside the mapped staging region.
    pub src_offset_bytes: u64,
    /// Bytes to copy.
    pub size_bytes: u64,
}

/// A CPU-visible intermediate buffer for transferring data to or from
/// GPU-only buffers.
///
/// Upload staging advances a write cursor with no-overwrite mappings and
/// falls back to a discard (resetting the cursor) when a write would wrap.
/// Download staging tracks free regions; a download reserves one and the
/// matching read hands it back.
#[derive(Debug)]
pub struct StagingBuffer {
    buffer: BufferId,
    size_bytes: u64,
    for_upload: bool,
    mapping_start: u64,
    mapping_count: u64,
    mapped: bool,
    available_download_regions: Vec<Block>,
    pub(crate) last_used_ms: u64,
    pub(crate) lifetime_threshold_ms: u64,
}

impl StagingBuffer {
    pub(crate) fn new(
        buffer: BufferId,
        size_bytes: u64,
        for_upload: bool,
        lifetime_threshold_ms: u64,
        now_ms: u64,
    ) -> Self {
        let available_download_regions = if for_upload {
            Vec::new()
        } else {
            vec![Block::new(0, size_bytes)]
        };
        Self {
            buffer,
            size_bytes,
            for_upload,
            mapping_start: 0,
            mapping_count: 0,
            mapped: false,
            available_download_regions,
            last_used_ms: now_ms,
            lifetime_threshold_ms,
        }
    }

    /// Total capacity in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Whether this buffer stages uploads (`true`) or downloads (`false`).
    pub fn for_upload(&self) -> bool {
        self.for_upload
    }

    pub(crate) fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub(crate) fn touch(&mut self, now_ms: u64) {
        self.last_used_ms = now_ms;
    }

    /// Conservatively predicts the stall an upload of `size_bytes` causes.
    pub fn upload_will_stall(&self, size_bytes: u64) -> StagingStallType {
        debug_assert!(self.for_upload);
        if size_bytes > self.size_bytes {
            StagingStallType::Full
        } else if self.mapping_start + size_bytes > self.size_bytes {
            StagingStallType::Partial
        } else {
            StagingStallType::NoStall
        }
    }

    /// Maps `size_bytes` of upload staging memory at the write cursor.
    ///
    /// Maps with no-overwrite semantics unless the write would exceed
    /// capacity, in which case the mapping discards and the cursor resets to
    /// zero.
    ///
    /// ## Errors
    /// * [`VaoError::StagingCapacityExceeded`] when `size_bytes` exceeds the
    ///   whole buffer.
    pub fn map(
        &mut self,
        device: &dyn GraphicsDevice,
        size_bytes: u64,
    ) -> Result<MappedRegion, VaoError> {
        debug_assert!(self.for_upload, "download staging buffers use async_download");
        debug_assert!(!self.mapped, "staging buffer is already mapped");
        if size_bytes > self.size_bytes {
            return Err(VaoError::StagingCapacityExceeded {
                requested_bytes: size_bytes,
                capacity_bytes: self.size_bytes,
            });
        }

        let mode = if self.mapping_start + size_bytes > self.size_bytes {
            self.mapping_start = 0;
            MapMode::WriteDiscard
        } else {
            MapMode::WriteNoOverwrite
        };

        let base = device.map_buffer(self.buffer, mode)?;
        self.mapping_count = size_bytes;
        self.mapped = true;
        // Cursor + size fit per the checks above.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(self.mapping_start as usize)) };
        Ok(MappedRegion::new(ptr, size_bytes))
    }

    /// Commits an upload mapping: unmaps, then enqueues one GPU copy per
    /// destination out of the just-written region, and advances the cursor.
    pub fn unmap(
        &mut self,
        device: &dyn GraphicsDevice,
        destinations: &[CopyDestination],
        region: MappedRegion,
    ) -> Result<(), VaoError> {
        debug_assert!(self.mapped, "unmap without a live mapping");
        debug_assert!(region.size_bytes() == self.mapping_count);
        drop(region);

        device.unmap_buffer(self.buffer)?;
        for dest in destinations {
            debug_assert!(
                dest.src_offset_bytes + dest.size_bytes <= self.mapping_count,
                "copy source exceeds the mapped region"
            );
            device.copy_buffer_region(
                self.buffer,
                self.mapping_start + dest.src_offset_bytes,
                dest.buffer,
                dest.dst_offset_bytes,
                dest.size_bytes,
            )?;
        }
        self.mapping_start += self.mapping_count;
        self.mapping_count = 0;
        self.mapped = false;
        Ok(())
    }

    fn get_free_download_region(&mut self, size_bytes: u64) -> Option<u64> {
        let idx = self
            .available_download_regions
            .iter()
            .position(|block| block.size >= size_bytes)?;
        let block = &mut self.available_download_regions[idx];
        let offset = block.offset;
        block.offset += size_bytes;
        block.size -= size_bytes;
        if block.size == 0 {
            self.available_download_regions.swap_remove(idx);
        }
        Some(offset)
    }

    /// Reserves a staging region and enqueues a GPU copy of `size_bytes`
    /// from `src` at `src_offset_bytes` into it. Returns the region offset,
    /// which correlates the later read with this download.
    ///
    /// ## Errors
    /// * [`VaoError::StagingCapacityExceeded`] when no free region fits; the
    ///   caller must use a different staging buffer.
    pub(crate) fn async_download(
        &mut self,
        device: &dyn GraphicsDevice,
        src: BufferId,
        src_offset_bytes: u64,
        size_bytes: u64,
    ) -> Result<u64, VaoError> {
        debug_assert!(!self.for_upload, "upload staging buffers cannot download");
        let offset = self.get_free_download_region(size_bytes).ok_or(
            VaoError::StagingCapacityExceeded {
                requested_bytes: size_bytes,
                capacity_bytes: self.size_bytes,
            },
        )?;
        device.copy_buffer_region(src, src_offset_bytes, self.buffer, offset, size_bytes)?;
        Ok(offset)
    }

    /// Maps a completed download region for reading.
    pub(crate) fn map_for_read(
        &mut self,
        device: &dyn GraphicsDevice,
        offset: u64,
        size_bytes: u64,
    ) -> Result<MappedRegion, VaoError> {
        debug_assert!(!self.mapped, "staging buffer is already mapped");
        let base = device.map_buffer(self.buffer, MapMode::Read)?;
        self.mapped = true;
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) };
        Ok(MappedRegion::new(ptr, size_bytes))
    }

    /// Unmaps a read mapping and folds the consumed region back into the
    /// free tracker; reading does not consume staging capacity long-term.
    pub(crate) fn unmap_download(
        &mut self,
        device: &dyn GraphicsDevice,
        offset: u64,
        size_bytes: u64,
        region: MappedRegion,
    ) -> Result<(), VaoError> {
        debug_assert!(self.mapped, "unmap without a live mapping");
        drop(region);
        device.unmap_buffer(self.buffer)?;
        self.mapped = false;
        self.cancel_download(offset, size_bytes);
        Ok(())
    }

    /// Returns a reserved download region without reading it.
    pub(crate) fn cancel_download(&mut self, offset: u64, size_bytes: u64) {
        self.available_download_regions
            .push(Block::new(offset, size_bytes));
        merge_contiguous_blocks(
            self.available_download_regions.len() - 1,
            &mut self.available_download_regions,
        );
    }

    /// Releases the device buffer. The staging buffer must not be mapped.
    pub fn destroy(self, device: &dyn GraphicsDevice) {
        debug_assert!(!self.mapped, "destroying a mapped staging buffer");
        if let Err(err) = device.destroy_buffer(self.buffer) {
            log::warn!("StagingBuffer: failed to destroy device buffer: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::api::{BufferDescriptor, BufferUsage, MemoryClass};
    use crate::renderer::vao::test_device::TestDevice;

    fn upload_staging(device: &TestDevice, size: u64) -> StagingBuffer {
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("upload staging".into()),
                size,
                usage: BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC,
                memory: MemoryClass::Dynamic,
                structure_stride: 0,
            })
            .unwrap();
        StagingBuffer::new(buffer, size, true, 0, 0)
    }

    fn download_staging(device: &TestDevice, size: u64) -> StagingBuffer {
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("download staging".into()),
                size,
                usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
                memory: MemoryClass::Staging,
                structure_stride: 0,
            })
            .unwrap();
        StagingBuffer::new(buffer, size, false, 0, 0)
    }

    #[test]
    fn upload_advances_cursor_with_no_overwrite() {
        let device = TestDevice::new();
        let mut staging = upload_staging(&device, 256);

        for _ in 0..2 {
            let region = staging.map(&device, 128).unwrap();
            staging.unmap(&device, &[], region).unwrap();
        }
        let modes: Vec<_> = device.map_log().into_iter().map(|(_, m)| m).collect();
        assert_eq!(
            modes,
            vec![MapMode::WriteNoOverwrite, MapMode::WriteNoOverwrite]
        );
    }

    #[test]
    fn wrap_forces_discard_and_resets_cursor() {
        let device = TestDevice::new();
        let mut staging = upload_staging(&device, 256);

        let region = staging.map(&device, 192).unwrap();
        staging.unmap(&device, &[], region).unwrap();

        assert_eq!(staging.upload_will_stall(128), StagingStallType::Partial);
        assert_eq!(staging.upload_will_stall(32), StagingStallType::NoStall);

        let region = staging.map(&device, 128).unwrap();
        staging.unmap(&device, &[], region).unwrap();

        let modes: Vec<_> = device.map_log().into_iter().map(|(_, m)| m).collect();
        assert_eq!(modes[1], MapMode::WriteDiscard);
        // Cursor restarted from zero, then advanced past the new write.
        assert_eq!(staging.mapping_start, 128);
    }

    #[test]
    fn unmap_copies_into_destinations() {
        let device = TestDevice::new();
        let mut staging = upload_staging(&device, 256);
        let dst = device
            .create_buffer(&BufferDescriptor {
                label: Some("dst".into()),
                size: 64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                memory: MemoryClass::Static,
                structure_stride: 0,
            })
            .unwrap();

        let mut region = staging.map(&device, 32).unwrap();
        region.write(0, &[7u8; 16]);
        region.write(16, &[9u8; 16]);
        staging
            .unmap(
                &device,
                &[
                    CopyDestination {
                        buffer: dst,
                        dst_offset_bytes: 0,
                        src_offset_bytes: 0,
                        size_bytes: 16,
                    },
                    CopyDestination {
                        buffer: dst,
                        dst_offset_bytes: 48,
                        src_offset_bytes: 16,
                        size_bytes: 16,
                    },
                ],
                region,
            )
            .unwrap();

        let contents = device.buffer_contents(dst);
        assert!(contents[..16].iter().all(|&b| b == 7));
        assert!(contents[48..].iter().all(|&b| b == 9));
    }

    #[test]
    fn download_capacity_error_and_cancel() {
        let device = TestDevice::new();
        let src = device
            .create_buffer(&BufferDescriptor {
                label: Some("src".into()),
                size: 512,
                usage: BufferUsage::COPY_SRC,
                memory: MemoryClass::Static,
                structure_stride: 0,
            })
            .unwrap();
        let mut staging = download_staging(&device, 128);

        let offset = staging.async_download(&device, src, 0, 128).unwrap();
        assert_eq!(offset, 0);

        // Fully reserved: the next request fails with a capacity error.
        let err = staging.async_download(&device, src, 0, 1).unwrap_err();
        assert!(matches!(err, VaoError::StagingCapacityExceeded { .. }));

        // Cancelling makes the capacity available again.
        staging.cancel_download(offset, 128);
        assert!(staging.async_download(&device, src, 0, 128).is_ok());
    }

    #[test]
    fn partial_cancel_coalesces_regions() {
        let device = TestDevice::new();
        let src = device
            .create_buffer(&BufferDescriptor {
                label: Some("src".into()),
                size: 512,
                usage: BufferUsage::COPY_SRC,
                memory: MemoryClass::Static,
                structure_stride: 0,
            })
            .unwrap();
        let mut staging = download_staging(&device, 192);

        let a = staging.async_download(&device, src, 0, 64).unwrap();
        let b = staging.async_download(&device, src, 64, 64).unwrap();
        let c = staging.async_download(&device, src, 128, 64).unwrap();

        // Release out of order; the tracker must still coalesce back to one
        // region spanning the whole buffer.
        staging.cancel_download(b, 64);
        staging.cancel_download(a, 64);
        staging.cancel_download(c, 64);
        assert_eq!(staging.available_download_regions.len(), 1);
        assert_eq!(staging.available_download_regions[0], Block::new(0, 192));
    }
}
