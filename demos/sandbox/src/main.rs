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

//! Drives the buffer allocator through a full lifecycle against the
//! software device: immutable mesh batching, per-frame dynamic updates,
//! staged uploads, and an asynchronous readback.

mod software_device;

use anyhow::{ensure, Context, Result};
use basalt_core::renderer::api::{
    BufferType, BufferUsage, IndexFormat, PrimitiveTopology, VertexElement, VertexFormat,
    VertexSemantic,
};
use basalt_core::renderer::vao::{UploadDestination, VaoManagerConfig};
use basalt_core::VaoManager;
use software_device::SoftwareDevice;

fn main() -> Result<()> {
    env_logger::init();

    let device = SoftwareDevice::new();
    let mut vao_manager = VaoManager::new(&device, VaoManagerConfig::default())
        .context("creating the buffer allocator")?;

    // A cube's worth of immutable geometry. Creation is deferred: both
    // buffers stay CPU-side until the batch point merges them.
    let positions: Vec<f32> = (0..24).flat_map(|i| [i as f32, 0.5, -0.5]).collect();
    let position_bytes: &[u8] = bytemuck::cast_slice(&positions);
    let vertex_buffer = vao_manager.create_vertex_buffer(
        &device,
        &[VertexElement::new(
            VertexSemantic::Position,
            VertexFormat::Float32x3,
        )],
        24,
        BufferType::Immutable,
        Some(position_bytes),
        true,
    )?;

    let indices: Vec<u16> = (0..36).map(|i| (i % 24) as u16).collect();
    let index_buffer = vao_manager.create_index_buffer(
        &device,
        IndexFormat::Uint16,
        36,
        BufferType::Immutable,
        Some(bytemuck::cast_slice(&indices)),
        false,
    )?;

    let vao = vao_manager.create_vertex_array_object(
        &[vertex_buffer],
        Some(index_buffer),
        PrimitiveTopology::TriangleList,
    )?;
    ensure!(
        vao_manager.vertex_array_layout(vao).is_none(),
        "the vertex array must wait for the batch point"
    );

    // Frame begin: queued immutable buffers merge into one device buffer
    // and the vertex array snaps to the real resource.
    vao_manager.begin_frame(&device)?;
    let layout = vao_manager
        .vertex_array_layout(vao)
        .context("vertex array should be rebuilt at the batch point")?;
    log::info!(
        "vertex array ready: {} binding(s), indexed: {}",
        layout.bindings.len(),
        layout.index.is_some()
    );

    // A per-frame constant buffer plus a few simulated frames of updates.
    let per_frame = vao_manager.create_const_buffer(
        &device,
        256,
        BufferType::DynamicDefault,
        None,
        false,
    )?;
    let wobble = vao_manager.create_vertex_buffer(
        &device,
        &[VertexElement::new(
            VertexSemantic::Position,
            VertexFormat::Float32x3,
        )],
        24,
        BufferType::DynamicDefault,
        None,
        false,
    )?;

    for frame in 0u32..6 {
        vao_manager.begin_frame(&device)?;

        let mut region = vao_manager.map_buffer(&device, per_frame, 0, 256)?;
        region.write(0, &frame.to_le_bytes());
        vao_manager.unmap_buffer(&device, per_frame, region)?;

        let wobbled: Vec<f32> = positions.iter().map(|v| v + frame as f32).collect();
        let mut region = vao_manager.map_buffer(&device, wobble, 0, 24)?;
        region.write(0, bytemuck::cast_slice(&wobbled));
        vao_manager.unmap_buffer(&device, wobble, region)?;

        vao_manager.update(&device)?;
    }
    log::info!(
        "simulated {} frames, ring slot now {}",
        vao_manager.frame_count(),
        vao_manager.dynamic_frame_slot()
    );

    // Staged upload into GPU-only memory.
    let lookup = vao_manager.create_uav_buffer(
        &device,
        256,
        4,
        BufferUsage::TEXEL,
        None,
        false,
    )?;
    let table: Vec<u32> = (0..256u32).map(|i| i * i).collect();
    let mut staging = vao_manager.get_staging_buffer(&device, 1024, true)?;
    let mut region = staging.map(&device, 1024)?;
    region.write(0, bytemuck::cast_slice(&table));
    vao_manager.upload(
        &device,
        &mut staging,
        region,
        &[UploadDestination {
            dst: lookup.into(),
            dst_offset_bytes: 0,
            src_offset_bytes: 0,
            size_bytes: 1024,
        }],
    )?;
    vao_manager.retire_staging_buffer(staging);

    // Read the table back through the async path and verify it survived
    // the round trip.
    let mut download = vao_manager.get_staging_buffer(&device, 1024, false)?;
    let mut ticket =
        vao_manager.create_async_ticket(&device, lookup, &mut download, 0, 256)?;
    log::info!(
        "transfer done before waiting: {}",
        ticket.query_is_transfer_done(&device)?
    );
    let region = ticket.map(&device, &mut download)?;
    let bytes = region.to_vec();
    ensure!(
        bytes == bytemuck::cast_slice::<u32, u8>(&table),
        "readback does not match the uploaded table"
    );
    ticket.unmap(&device, &mut download, region)?;
    vao_manager.retire_staging_buffer(download);
    log::info!("async readback verified ({} bytes)", bytes.len());

    let stats = vao_manager.memory_stats();
    log::info!(
        "pools: {} ({} of {} bytes in use)",
        stats.pool_count,
        stats.used_bytes,
        stats.capacity_bytes
    );

    vao_manager.destroy_vertex_array_object(vao)?;
    vao_manager.destroy_vertex_buffer(&device, vertex_buffer)?;
    vao_manager.destroy_index_buffer(&device, index_buffer)?;
    vao_manager.destroy_vertex_buffer(&device, wobble)?;
    vao_manager.destroy_const_buffer(&device, per_frame)?;
    vao_manager.destroy_uav_buffer(&device, lookup)?;
    vao_manager.destroy(&device);

    println!("sandbox completed: allocator lifecycle verified");
    Ok(())
}
