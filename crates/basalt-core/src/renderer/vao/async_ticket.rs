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

//! Completion handles for pending GPU → CPU transfers.

use crate::renderer::api::{BufferId, FenceId};
use crate::renderer::error::VaoError;
use crate::renderer::traits::GraphicsDevice;
use crate::renderer::vao::buffer_interface::MappedRegion;
use crate::renderer::vao::staging_buffer::StagingBuffer;
use crate::renderer::vao::wait_for_fence;

/// A handle to one pending GPU → CPU transfer into a download staging
/// buffer.
///
/// A fence is placed right after the copy is enqueued. Poll it with
/// [`query_is_transfer_done`](AsyncTicket::query_is_transfer_done), or let
/// [`map`](AsyncTicket::map) wait for it unconditionally. Reading ends with
/// [`unmap`](AsyncTicket::unmap), which hands the staging region back; a
/// ticket abandoned without mapping should be released with
/// [`cancel`](AsyncTicket::cancel) so the region is not leaked until the
/// staging buffer dies.
#[derive(Debug)]
pub struct AsyncTicket {
    staging_offset: u64,
    size_bytes: u64,
    fence: Option<FenceId>,
}

impl AsyncTicket {
    /// Reserves staging space, enqueues the copy from `src`, and places the
    /// fence that signals its completion.
    pub(crate) fn new(
        device: &dyn GraphicsDevice,
        staging: &mut StagingBuffer,
        src: BufferId,
        src_offset_bytes: u64,
        size_bytes: u64,
    ) -> Result<Self, VaoError> {
        let staging_offset = staging.async_download(device, src, src_offset_bytes, size_bytes)?;
        let fence = device.create_fence()?;
        Ok(Self {
            staging_offset,
            size_bytes,
            fence: Some(fence),
        })
    }

    /// Size of the transfer in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Non-blocking completion poll. A ticket whose fence is already
    /// retired reports done immediately.
    pub fn query_is_transfer_done(
        &mut self,
        device: &dyn GraphicsDevice,
    ) -> Result<bool, VaoError> {
        let Some(fence) = self.fence else {
            return Ok(true);
        };
        if device.fence_status(fence)? {
            self.retire_fence(device);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Maps the downloaded bytes for reading.
    ///
    /// Waits on the fence first, unconditionally, so the GPU copy is
    /// guaranteed to have completed before the CPU sees the region.
    pub fn map(
        &mut self,
        device: &dyn GraphicsDevice,
        staging: &mut StagingBuffer,
    ) -> Result<MappedRegion, VaoError> {
        if let Some(fence) = self.fence {
            wait_for_fence(device, fence)?;
            self.retire_fence(device);
        }
        staging.map_for_read(device, self.staging_offset, self.size_bytes)
    }

    /// Ends the read, folding the staging region back into the free tracker.
    pub fn unmap(
        mut self,
        device: &dyn GraphicsDevice,
        staging: &mut StagingBuffer,
        region: MappedRegion,
    ) -> Result<(), VaoError> {
        self.retire_fence(device);
        staging.unmap_download(device, self.staging_offset, self.size_bytes, region)
    }

    /// Abandons the transfer without reading it, releasing the staging
    /// region and the fence.
    pub fn cancel(mut self, device: &dyn GraphicsDevice, staging: &mut StagingBuffer) {
        self.retire_fence(device);
        staging.cancel_download(self.staging_offset, self.size_bytes);
    }

    fn retire_fence(&mut self, device: &dyn GraphicsDevice) {
        if let Some(fence) = self.fence.take() {
            if let Err(err) = device.destroy_fence(fence) {
                log::warn!("AsyncTicket: failed to destroy fence: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::api::{BufferDescriptor, BufferUsage, MemoryClass};
    use crate::renderer::vao::test_device::TestDevice;

    fn source_buffer(device: &TestDevice, data: &[u8]) -> BufferId {
        device
            .create_buffer_with_data(
                &BufferDescriptor {
                    label: Some("src".into()),
                    size: data.len() as u64,
                    usage: BufferUsage::COPY_SRC,
                    memory: MemoryClass::Static,
                    structure_stride: 0,
                },
                data,
            )
            .unwrap()
    }

    fn download_staging(device: &TestDevice, size: u64) -> StagingBuffer {
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("download".into()),
                size,
                usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
                memory: MemoryClass::Staging,
                structure_stride: 0,
            })
            .unwrap();
        StagingBuffer::new(buffer, size, false, 0, 0)
    }

    #[test]
    fn poll_is_false_until_the_gpu_catches_up_then_map_reads() {
        // Fences need three polls before they report completion.
        let device = TestDevice::with_fence_latency(3);
        let data: Vec<u8> = (0u8..64).collect();
        let src = source_buffer(&device, &data);
        let mut staging = download_staging(&device, 4096);

        let mut ticket = AsyncTicket::new(&device, &mut staging, src, 0, 64).unwrap();
        assert!(!ticket.query_is_transfer_done(&device).unwrap());

        // Mapping waits the fence out, then exposes the copied bytes.
        let region = ticket.map(&device, &mut staging).unwrap();
        assert_eq!(region.to_vec(), data);
        ticket.unmap(&device, &mut staging, region).unwrap();
    }

    #[test]
    fn ticket_without_fence_is_immediately_done() {
        let device = TestDevice::new();
        let src = source_buffer(&device, &[0u8; 16]);
        let mut staging = download_staging(&device, 4096);

        let mut ticket = AsyncTicket::new(&device, &mut staging, src, 0, 16).unwrap();
        // First poll retires the fence (zero latency), second hits the
        // no-fence path.
        assert!(ticket.query_is_transfer_done(&device).unwrap());
        assert!(ticket.query_is_transfer_done(&device).unwrap());
        ticket.cancel(&device, &mut staging);
    }

    #[test]
    fn cancel_releases_the_staging_region() {
        let device = TestDevice::new();
        let src = source_buffer(&device, &[0u8; 64]);
        let mut staging = download_staging(&device, 64);

        let ticket = AsyncTicket::new(&device, &mut staging, src, 0, 64).unwrap();
        ticket.cancel(&device, &mut staging);

        // The full capacity is available again.
        assert!(AsyncTicket::new(&device, &mut staging, src, 0, 64).is_ok());
    }
}
