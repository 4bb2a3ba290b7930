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

//! The top-level buffer allocator.
//!
//! [`VaoManager`] owns pools of physical device buffers per buffer-type
//! category, sub-allocates logical buffers out of them, batches small
//! immutable buffers into merged device buffers, deduplicates vertex-array
//! binding sets, and runs the per-frame fence ring that keeps the CPU from
//! overwriting regions the GPU has not consumed yet.

use crate::renderer::api::{
    vertex_size_bytes, BufferDescriptor, BufferId, BufferType, BufferUsage, FenceId, IndexFormat,
    MemoryClass, PrimitiveTopology, TexelFormat, VertexElement,
};
use crate::renderer::error::{ResourceError, VaoError};
use crate::renderer::traits::{DeviceFeature, GraphicsDevice};
use crate::renderer::vao::block::{
    align_to_next_multiple, lcm, merge_contiguous_blocks, Block, StrideChanger,
};
use crate::renderer::vao::buffer_interface::{
    BufferInterface, CompatInterface, MappedRegion, MappingState, StandardInterface,
};
use crate::renderer::vao::dynamic_buffer::DynamicBuffer;
use crate::renderer::vao::packed_buffer::{
    AnyBufferHandle, BufferCategory, BufferKind, BufferRecord, ConstBufferHandle,
    IndexBufferHandle, IndirectBufferHandle, TexelBufferHandle, UavBufferHandle,
    VertexArrayHandle, VertexBufferHandle,
};
use crate::renderer::vao::staging_buffer::{CopyDestination, StagingBuffer};
use crate::renderer::vao::{wait_for_fence, AsyncTicket};
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

/// The lifetime class a pool belongs to.
///
/// Every [`BufferType`] collapses onto one of these three: both persistent
/// dynamic variants degrade to the plain dynamic pools, since the platform
/// has no persistent mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    /// Pools for merged immutable buffers.
    Immutable = 0,
    /// Pools for GPU-only default buffers.
    Default = 1,
    /// Pools for CPU-mappable, frame-rotated buffers.
    Dynamic = 2,
}

impl PoolClass {
    /// The pool class a usage class allocates from.
    pub const fn of(buffer_type: BufferType) -> Self {
        match buffer_type {
            BufferType::Immutable => PoolClass::Immutable,
            BufferType::Default => PoolClass::Default,
            BufferType::DynamicDefault
            | BufferType::DynamicPersistent
            | BufferType::DynamicPersistentCoherent => PoolClass::Dynamic,
        }
    }
}

const CATEGORIES: [BufferCategory; 3] = [
    BufferCategory::Vertex,
    BufferCategory::Index,
    BufferCategory::Shader,
];

/// Default physical pool size per (category, class), in bytes.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizes([[u64; 3]; 3]);

impl PoolSizes {
    /// The pool size for `category` buffers of `class`.
    pub fn get(&self, category: BufferCategory, class: PoolClass) -> u64 {
        self.0[category as usize][class as usize]
    }

    /// Overrides the pool size for `category` buffers of `class`.
    pub fn set(&mut self, category: BufferCategory, class: PoolClass, bytes: u64) {
        self.0[category as usize][class as usize] = bytes;
    }

    /// The same pool size everywhere; mostly useful for tests and tools.
    pub fn uniform(bytes: u64) -> Self {
        Self([[bytes; 3]; 3])
    }
}

impl Default for PoolSizes {
    fn default() -> Self {
        const MIB: u64 = 1024 * 1024;
        // [immutable, default, dynamic] per category.
        Self([
            [64 * MIB, 32 * MIB, 16 * MIB], // vertex
            [64 * MIB, 16 * MIB, 16 * MIB], // index
            [64 * MIB, 16 * MIB, 16 * MIB], // shader
        ])
    }
}

/// Tunables of the [`VaoManager`].
#[derive(Debug, Clone)]
pub struct VaoManagerConfig {
    /// Frame ring depth: dynamic buffers hold this many frame copies, and
    /// one fence guards each slot. Double or triple buffering in practice.
    pub dynamic_buffer_multiplier: u8,
    /// How long a retired staging buffer may sit unused before
    /// [`VaoManager::update`] destroys it.
    pub staging_buffer_lifetime_ms: u64,
    /// Offset alignment required when binding constant buffers.
    pub const_buffer_alignment: u32,
    /// Offset alignment required when binding texel buffers.
    pub texel_buffer_alignment: u32,
    /// Largest constant buffer the platform can bind.
    pub const_buffer_max_size: u64,
    /// Largest texel buffer the platform can bind.
    pub texel_buffer_max_size: u64,
    /// Default physical pool sizes; a request larger than the default gets
    /// a pool of exactly its own size.
    pub default_pool_sizes: PoolSizes,
}

impl Default for VaoManagerConfig {
    fn default() -> Self {
        Self {
            dynamic_buffer_multiplier: 3,
            staging_buffer_lifetime_ms: 5 * 60 * 1000,
            const_buffer_alignment: 256,
            texel_buffer_alignment: 256,
            const_buffer_max_size: 64 * 1024,
            texel_buffer_max_size: 128 * 1024 * 1024,
            default_pool_sizes: PoolSizes::default(),
        }
    }
}

/// One physical pool buffer and its sub-allocation bookkeeping.
#[derive(Debug)]
struct Vbo {
    /// `None` once an emptied immutable pool has released its device buffer.
    buffer: Option<BufferId>,
    size_bytes: u64,
    free_blocks: Vec<Block>,
    stride_changers: Vec<StrideChanger>,
    /// Present on dynamic pools only.
    dynamic_buffer: Option<DynamicBuffer>,
}

/// One vertex-buffer binding inside a deduplicated vertex-array record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexBinding {
    /// The physical pool buffer the binding reads from.
    pub buffer: BufferId,
    /// The vertex declaration of the bound buffer.
    pub elements: Vec<VertexElement>,
    /// Interleaved vertex stride in bytes.
    pub stride: u32,
    /// Byte offset of the binding inside `buffer`.
    pub offset_bytes: u64,
    /// Instancing divisor; `0` for per-vertex data.
    pub instancing_divisor: u32,
}

/// The layout data shared by every vertex array with the same bindings.
#[derive(Debug)]
pub struct VertexArrayLayout {
    /// The vertex-buffer bindings, in binding order.
    pub bindings: Vec<VertexBinding>,
    /// The index buffer and its format, when indexed.
    pub index: Option<(BufferId, IndexFormat)>,
    /// Primitive assembly mode.
    pub operation_type: PrimitiveTopology,
}

/// A deduplicated vertex-array record; shared by reference counting.
#[derive(Debug)]
struct VaoRecord {
    vao_name: u32,
    ref_count: u32,
    operation_type: PrimitiveTopology,
    vertex_bindings: Vec<VertexBinding>,
    index_buffer: Option<BufferId>,
    index_format: IndexFormat,
    shared: Arc<VertexArrayLayout>,
}

/// One created vertex-array object, as handed to callers.
#[derive(Debug)]
struct VertexArrayRecord {
    vao_name: u32,
    render_queue_id: u32,
    vertex_buffers: Vec<VertexBufferHandle>,
    index_buffer: Option<IndexBufferHandle>,
    operation_type: PrimitiveTopology,
    /// `None` while a referenced immutable buffer is still queued for
    /// batching; filled in retroactively at the batch point.
    shared: Option<Arc<VertexArrayLayout>>,
}

/// A dynamic-buffer deallocation deferred until its frame slot cycles.
#[derive(Debug)]
struct DelayedDestroy {
    frame_count: u32,
    vbo_index: usize,
    byte_offset: u64,
    size_bytes: u64,
    buffer_type: BufferType,
    category: BufferCategory,
}

/// One GPU copy to perform when committing a staging upload, addressed by
/// logical buffer handle.
#[derive(Debug, Clone, Copy)]
pub struct UploadDestination {
    /// The destination buffer.
    pub dst: AnyBufferHandle,
    /// Byte offset inside the destination buffer's content.
    pub dst_offset_bytes: u64,
    /// Byte offset inside the mapped staging region.
    pub src_offset_bytes: u64,
    /// Bytes to copy.
    pub size_bytes: u64,
}

/// Aggregate pool memory usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Total capacity of all live pools, in bytes.
    pub capacity_bytes: u64,
    /// Bytes currently sub-allocated out of those pools.
    pub used_bytes: u64,
    /// Number of live pools.
    pub pool_count: usize,
}

// Render-queue ids mix the low bits of the shared vao name with a per-object
// unique id, so draw sorting groups the submeshes of one mesh together
// instead of interleaving them with other meshes using the same vao.
const RENDER_QUEUE_MESH_BITS: u32 = 14;
const RENDER_QUEUE_VAO_BITS: u32 = 5;

fn generate_render_queue_id(vao_name: u32, unique_vao_id: u32) -> u32 {
    let vao_mask = (1u32 << RENDER_QUEUE_VAO_BITS) - 1;
    let unique_mask = (1u32 << (RENDER_QUEUE_MESH_BITS - RENDER_QUEUE_VAO_BITS)) - 1;
    ((vao_name & vao_mask) << (RENDER_QUEUE_MESH_BITS - RENDER_QUEUE_VAO_BITS))
        | (unique_vao_id & unique_mask)
}

fn extract_unique_vao_id(render_queue_id: u32) -> u32 {
    let unique_mask = (1u32 << (RENDER_QUEUE_MESH_BITS - RENDER_QUEUE_VAO_BITS)) - 1;
    render_queue_id & unique_mask
}

fn pool_usage(category: BufferCategory) -> BufferUsage {
    let base = BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
    match category {
        BufferCategory::Vertex => base | BufferUsage::VERTEX,
        BufferCategory::Index => base | BufferUsage::INDEX,
        BufferCategory::Shader => base | BufferUsage::TEXEL | BufferUsage::INDIRECT,
    }
}

fn pool_memory(class: PoolClass) -> MemoryClass {
    match class {
        PoolClass::Immutable => MemoryClass::Immutable,
        PoolClass::Default => MemoryClass::Static,
        PoolClass::Dynamic => MemoryClass::Dynamic,
    }
}

/// Creates a dedicated (non-pooled) device buffer for the compat paths.
fn create_dedicated_buffer(
    device: &dyn GraphicsDevice,
    extra_usage: BufferUsage,
    size_bytes: u64,
    buffer_type: BufferType,
    initial_data: Option<&[u8]>,
    structure_stride: u32,
    context: &'static str,
) -> Result<BufferId, VaoError> {
    let class = PoolClass::of(buffer_type);
    let mut usage = extra_usage | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
    if class == PoolClass::Dynamic {
        usage |= BufferUsage::MAP_WRITE;
    }
    let descriptor = BufferDescriptor {
        label: Some(context.into()),
        size: size_bytes,
        usage,
        memory: pool_memory(class),
        structure_stride,
    };
    let result = match initial_data {
        Some(data) if data.len() as u64 == size_bytes => {
            device.create_buffer_with_data(&descriptor, data)
        }
        Some(data) => {
            // The allocation was rounded up past the content; pad the tail.
            let mut padded = data.to_vec();
            padded.resize(size_bytes as usize, 0);
            device.create_buffer_with_data(&descriptor, &padded)
        }
        None => device.create_buffer(&descriptor),
    };
    result.map_err(|source| VaoError::OutOfDeviceMemory {
        requested_bytes: size_bytes,
        context,
        source,
    })
}

/// The top-level allocator: pooled sub-allocation, deferred immutable
/// batching, vertex-array deduplication, staging management, and the
/// per-frame fence ring.
///
/// All operations assume serialized access from the one thread issuing GPU
/// commands; the manager performs no internal locking. Resources must be
/// released with [`destroy`](VaoManager::destroy) before the device goes
/// away.
#[derive(Debug)]
pub struct VaoManager {
    config: VaoManagerConfig,
    supports_indirect_buffers: bool,
    shader_buffers_support_no_overwrite: bool,

    /// Pools indexed by `[category][pool class]`.
    vbos: [[Vec<Vbo>; 3]; 3],
    buffers: HashMap<u64, BufferRecord>,
    next_buffer_handle: u64,
    /// Immutable buffers awaiting the deferred batch point, per category.
    delayed_buffers: [Vec<u64>; 3],

    vaos: Vec<VaoRecord>,
    vertex_arrays: HashMap<u64, VertexArrayRecord>,
    next_vertex_array_handle: u64,
    vao_names: u32,
    num_generated_vaos: u32,

    /// One fence slot per frame of the ring.
    frame_sync: Vec<Option<FenceId>>,
    dynamic_frame: usize,
    frame_count: u32,
    delayed_destroy: VecDeque<DelayedDestroy>,

    zero_ref_staging: Vec<StagingBuffer>,
    next_staging_check_ms: u64,
    epoch: Instant,

    draw_id: VertexBufferHandle,
}

impl VaoManager {
    /// Number of identity entries in the built-in draw-id buffer.
    pub const DRAW_ID_ELEMENTS: u32 = 4096;

    /// Creates the manager, querying the device's capabilities and creating
    /// the built-in draw-id vertex buffer (flushed to the GPU immediately).
    pub fn new(device: &dyn GraphicsDevice, config: VaoManagerConfig) -> Result<Self, VaoError> {
        debug_assert!(config.dynamic_buffer_multiplier >= 2);
        let frame_sync = (0..config.dynamic_buffer_multiplier).map(|_| None).collect();
        let mut manager = Self {
            supports_indirect_buffers: device.supports_feature(DeviceFeature::IndirectBuffers),
            shader_buffers_support_no_overwrite: device
                .supports_feature(DeviceFeature::NoOverwriteOnShaderBuffers),
            config,
            vbos: Default::default(),
            buffers: HashMap::new(),
            next_buffer_handle: 1,
            delayed_buffers: Default::default(),
            vaos: Vec::new(),
            vertex_arrays: HashMap::new(),
            next_vertex_array_handle: 1,
            vao_names: 1,
            num_generated_vaos: 0,
            frame_sync,
            dynamic_frame: 0,
            frame_count: 0,
            delayed_destroy: VecDeque::new(),
            zero_ref_staging: Vec::new(),
            next_staging_check_ms: u64::MAX,
            epoch: Instant::now(),
            draw_id: VertexBufferHandle(0),
        };

        let draw_ids: Vec<u32> = (0..Self::DRAW_ID_ELEMENTS).collect();
        let draw_id = manager.create_vertex_buffer(
            device,
            &[VertexElement::new(
                crate::renderer::api::VertexSemantic::DrawId,
                crate::renderer::api::VertexFormat::Uint32,
            )],
            Self::DRAW_ID_ELEMENTS as u64,
            BufferType::Immutable,
            Some(bytemuck::cast_slice(&draw_ids)),
            true,
        )?;
        // Make sure the draw-id buffer reaches the GPU before anything else
        // queues behind it.
        manager.create_delayed_immutable_buffers(device)?;
        manager.draw_id = draw_id;
        Ok(manager)
    }

    /// The built-in identity draw-id vertex buffer.
    pub fn draw_id_buffer(&self) -> VertexBufferHandle {
        self.draw_id
    }

    /// Monotonic frame counter, incremented by [`update`](VaoManager::update).
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// The frame-ring slot dynamic buffers currently write into.
    pub fn dynamic_frame_slot(&self) -> u8 {
        self.dynamic_frame as u8
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // ------------------------------------------------------------------
    // Pool sub-allocation
    // ------------------------------------------------------------------

    /// Finds or creates pool space for `size_bytes` aligned to `alignment`.
    ///
    /// Returns the pool index and the byte offset of the allocation. Blocks
    /// whose start is already aligned are preferred over blocks requiring
    /// padding, to minimize stride-changer bookkeeping; the search stops at
    /// the first exact match, otherwise the first fitting candidate is used.
    fn allocate_vbo(
        &mut self,
        device: &dyn GraphicsDevice,
        size_bytes: u64,
        alignment: u64,
        buffer_type: BufferType,
        category: BufferCategory,
    ) -> Result<(usize, u64), VaoError> {
        debug_assert!(alignment > 0);
        // Immutable buffers are delayed as much as possible so they can all
        // be merged; see create_delayed_immutable_buffers.
        debug_assert!(buffer_type != BufferType::Immutable);

        let mut size_bytes = size_bytes;
        let buffer_type = if buffer_type.is_dynamic() {
            // The allocation must hold every frame copy contiguously.
            size_bytes *= self.config.dynamic_buffer_multiplier as u64;
            BufferType::DynamicDefault
        } else {
            buffer_type
        };
        let class = PoolClass::of(buffer_type);

        let mut best: Option<(usize, usize)> = None;
        let mut found_matching_stride = false;
        'search: for (vbo_idx, vbo) in self.vbos[category as usize][class as usize]
            .iter()
            .enumerate()
        {
            for (block_idx, block) in vbo.free_blocks.iter().enumerate() {
                let new_offset = align_to_next_multiple(block.offset, alignment);
                let padding = new_offset - block.offset;
                if size_bytes + padding <= block.size {
                    if padding == 0 {
                        best = Some((vbo_idx, block_idx));
                        found_matching_stride = true;
                        break 'search;
                    }
                    if best.is_none() {
                        best = Some((vbo_idx, block_idx));
                    }
                }
            }
        }

        let (vbo_idx, block_idx) = match best {
            Some(found) => found,
            None => {
                found_matching_stride = true;
                let pool_size = self
                    .config
                    .default_pool_sizes
                    .get(category, class)
                    .max(size_bytes);
                let mut usage = pool_usage(category);
                if class == PoolClass::Dynamic {
                    usage |= BufferUsage::MAP_WRITE;
                }
                let descriptor = BufferDescriptor {
                    label: Some(format!("{category:?} buffer pool ({class:?})").into()),
                    size: pool_size,
                    usage,
                    memory: pool_memory(class),
                    structure_stride: 0,
                };
                let buffer =
                    device
                        .create_buffer(&descriptor)
                        .map_err(|source| VaoError::OutOfDeviceMemory {
                            requested_bytes: pool_size,
                            context: "buffer pool creation",
                            source,
                        })?;
                log::debug!(
                    "VaoManager: new {category:?}/{class:?} pool of {pool_size} bytes"
                );
                let dynamic_buffer =
                    (class == PoolClass::Dynamic).then(|| DynamicBuffer::new(buffer, pool_size));
                let vbos = &mut self.vbos[category as usize][class as usize];
                vbos.push(Vbo {
                    buffer: Some(buffer),
                    size_bytes: pool_size,
                    free_blocks: vec![Block::new(0, pool_size)],
                    stride_changers: Vec::new(),
                    dynamic_buffer,
                });
                (vbos.len() - 1, 0)
            }
        };

        let vbo = &mut self.vbos[category as usize][class as usize][vbo_idx];
        let block = vbo.free_blocks[block_idx];
        let new_offset = align_to_next_multiple(block.offset, alignment);
        let padding = new_offset - block.offset;
        vbo.free_blocks[block_idx].size -= size_bytes + padding;
        vbo.free_blocks[block_idx].offset = new_offset + size_bytes;
        if !found_matching_stride {
            let at = vbo
                .stride_changers
                .partition_point(|s| s.offset_after_padding < new_offset);
            vbo.stride_changers.insert(
                at,
                StrideChanger {
                    offset_after_padding: new_offset,
                    padded_bytes: padding,
                },
            );
        }
        if vbo.free_blocks[block_idx].size == 0 {
            vbo.free_blocks.remove(block_idx);
        }

        Ok((vbo_idx, new_offset))
    }

    /// Returns a sub-allocation to its pool, reversing any stride changer
    /// recorded at this offset and coalescing adjacent free blocks.
    ///
    /// An immutable pool that becomes entirely free releases its device
    /// buffer: immutable memory cannot be refilled, so an emptied pool is
    /// worthless. Trailing released pools are popped off the list.
    fn deallocate_vbo(
        &mut self,
        device: &dyn GraphicsDevice,
        vbo_idx: usize,
        mut byte_offset: u64,
        mut size_bytes: u64,
        buffer_type: BufferType,
        category: BufferCategory,
    ) {
        let buffer_type = if buffer_type.is_dynamic() {
            size_bytes *= self.config.dynamic_buffer_multiplier as u64;
            BufferType::DynamicDefault
        } else {
            buffer_type
        };
        let class = PoolClass::of(buffer_type);
        let vbos = &mut self.vbos[category as usize][class as usize];
        let vbo = &mut vbos[vbo_idx];

        let at = vbo
            .stride_changers
            .partition_point(|s| s.offset_after_padding < byte_offset);
        if at < vbo.stride_changers.len()
            && vbo.stride_changers[at].offset_after_padding == byte_offset
        {
            let padded = vbo.stride_changers[at].padded_bytes;
            byte_offset -= padded;
            size_bytes += padded;
            vbo.stride_changers.remove(at);
        }

        vbo.free_blocks.push(Block::new(byte_offset, size_bytes));
        merge_contiguous_blocks(vbo.free_blocks.len() - 1, &mut vbo.free_blocks);

        if buffer_type == BufferType::Immutable
            && vbo.free_blocks.len() == 1
            && vbo.free_blocks[0].size == vbo.size_bytes
        {
            if let Some(buffer) = vbo.buffer.take() {
                if let Err(err) = device.destroy_buffer(buffer) {
                    log::warn!("VaoManager: failed to destroy emptied immutable pool: {err}");
                }
            }
            // Released pools keep their slot so other buffers' pool indices
            // stay valid, except at the tail where they can be dropped.
            while vbos.last().is_some_and(|v| v.buffer.is_none()) {
                vbos.pop();
            }
        }
    }

    // ------------------------------------------------------------------
    // Buffer creation and destruction
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn create_pooled_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        category: BufferCategory,
        kind: BufferKind,
        num_elements: u64,
        bytes_per_element: u32,
        num_elements_padding: u64,
        alignment: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<u64, VaoError> {
        let content_bytes = num_elements * bytes_per_element as u64;
        if let Some(data) = initial_data {
            debug_assert_eq!(
                data.len() as u64,
                content_bytes,
                "initial data does not match the buffer's content size"
            );
        }

        let handle = self.next_buffer_handle;
        self.next_buffer_handle += 1;

        if buffer_type == BufferType::Immutable {
            let Some(data) = initial_data else {
                return Err(VaoError::InvalidParams(
                    "immutable buffers require initial data".to_string(),
                ));
            };
            let shadow_copy: Option<Arc<[u8]>> =
                keep_shadow_copy.then(|| Arc::from(data.to_vec()));
            // Reference the shadow copy without another copy when one
            // exists; defensive copy otherwise.
            let pending = shadow_copy
                .clone()
                .unwrap_or_else(|| Arc::from(data.to_vec()));
            self.buffers.insert(
                handle,
                BufferRecord {
                    category,
                    buffer_type,
                    buffer_start: 0,
                    final_buffer_start: 0,
                    num_elements,
                    bytes_per_element,
                    num_elements_padding,
                    shadow_copy,
                    mapping: MappingState::Unmapped,
                    interface: BufferInterface::Standard(StandardInterface::deferred(pending)),
                    kind,
                },
            );
            self.delayed_buffers[category as usize].push(handle);
            return Ok(handle);
        }

        let internal_bytes = (num_elements + num_elements_padding) * bytes_per_element as u64;
        let (vbo_idx, byte_offset) =
            self.allocate_vbo(device, internal_bytes, alignment, buffer_type, category)?;
        let class = PoolClass::of(if buffer_type.is_dynamic() {
            BufferType::DynamicDefault
        } else {
            buffer_type
        });
        let Some(pool_buffer) = self.vbos[category as usize][class as usize][vbo_idx].buffer
        else {
            debug_assert!(false, "freshly allocated pool without a device buffer");
            return Err(VaoError::Resource(ResourceError::NotFound));
        };
        let buffer_start = byte_offset / bytes_per_element as u64;

        if let Some(data) = initial_data {
            if buffer_type.is_dynamic() {
                // First upload of a dynamic buffer fills the frame-0 copy.
                let vbo = &mut self.vbos[category as usize][class as usize][vbo_idx];
                let Some(dynamic) = vbo.dynamic_buffer.as_mut() else {
                    debug_assert!(false, "dynamic pool without a mapping tracker");
                    return Err(VaoError::NotMappable);
                };
                let (ptr, ticket) = dynamic.map(device, byte_offset, data.len() as u64)?;
                unsafe {
                    ptr.as_ptr()
                        .copy_from_nonoverlapping(data.as_ptr(), data.len());
                }
                dynamic.unmap(device, ticket)?;
            } else {
                device
                    .write_buffer(pool_buffer, byte_offset, data)
                    .map_err(VaoError::Resource)?;
            }
        }

        self.buffers.insert(
            handle,
            BufferRecord {
                category,
                buffer_type,
                buffer_start,
                final_buffer_start: buffer_start,
                num_elements,
                bytes_per_element,
                num_elements_padding,
                shadow_copy: keep_shadow_copy
                    .then(|| initial_data.map(|d| Arc::from(d.to_vec())))
                    .flatten(),
                mapping: MappingState::Unmapped,
                interface: BufferInterface::Standard(StandardInterface::pooled(
                    vbo_idx,
                    pool_buffer,
                )),
                kind,
            },
        );
        Ok(handle)
    }

    /// Creates a vertex buffer of `num_elements` interleaved vertices.
    pub fn create_vertex_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        elements: &[VertexElement],
        num_elements: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<VertexBufferHandle, VaoError> {
        let bytes_per_element = vertex_size_bytes(elements);
        if bytes_per_element == 0 {
            return Err(VaoError::InvalidParams(
                "vertex declaration is empty".to_string(),
            ));
        }
        self.create_pooled_buffer(
            device,
            BufferCategory::Vertex,
            BufferKind::Vertex {
                elements: elements.to_vec(),
            },
            num_elements,
            bytes_per_element,
            0,
            bytes_per_element as u64,
            buffer_type,
            initial_data,
            keep_shadow_copy,
        )
        .map(VertexBufferHandle)
    }

    /// Destroys a vertex buffer. Dynamic buffers release their pool region
    /// only after the frame ring wraps past every slot that may still read
    /// it.
    pub fn destroy_vertex_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        handle: VertexBufferHandle,
    ) -> Result<(), VaoError> {
        self.destroy_buffer_record(device, handle.0)
    }

    /// Creates an index buffer of `num_elements` indices.
    pub fn create_index_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        format: IndexFormat,
        num_elements: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<IndexBufferHandle, VaoError> {
        let bytes_per_element = format.size_bytes();
        self.create_pooled_buffer(
            device,
            BufferCategory::Index,
            BufferKind::Index { format },
            num_elements,
            bytes_per_element,
            0,
            bytes_per_element as u64,
            buffer_type,
            initial_data,
            keep_shadow_copy,
        )
        .map(IndexBufferHandle)
    }

    /// Destroys an index buffer.
    pub fn destroy_index_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        handle: IndexBufferHandle,
    ) -> Result<(), VaoError> {
        self.destroy_buffer_record(device, handle.0)
    }

    /// Creates a constant buffer.
    ///
    /// Constant buffers are never pooled: the platform cannot bind a
    /// sub-range of one, so each gets a dedicated device buffer, and their
    /// size is capped by the platform limit.
    pub fn create_const_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        size_bytes: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<ConstBufferHandle, VaoError> {
        if size_bytes > self.config.const_buffer_max_size {
            return Err(VaoError::InvalidParams(format!(
                "constant buffer of {size_bytes} bytes exceeds the platform limit of {} bytes",
                self.config.const_buffer_max_size
            )));
        }
        if buffer_type == BufferType::Immutable && initial_data.is_none() {
            return Err(VaoError::InvalidParams(
                "immutable buffers require initial data".to_string(),
            ));
        }
        let alloc_bytes =
            align_to_next_multiple(size_bytes, self.config.const_buffer_alignment as u64);
        let buffer = create_dedicated_buffer(
            device,
            BufferUsage::UNIFORM,
            alloc_bytes,
            buffer_type,
            initial_data,
            0,
            "const buffer",
        )?;
        let handle = self.insert_dedicated_record(
            BufferCategory::Shader,
            BufferKind::Const,
            buffer,
            size_bytes,
            1,
            alloc_bytes - size_bytes,
            buffer_type,
            initial_data,
            keep_shadow_copy,
        );
        Ok(ConstBufferHandle(handle))
    }

    /// Destroys a constant buffer.
    pub fn destroy_const_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        handle: ConstBufferHandle,
    ) -> Result<(), VaoError> {
        self.destroy_buffer_record(device, handle.0)
    }

    /// Creates a texel buffer viewed with `format`.
    ///
    /// On devices that can no-overwrite-map shader buffers, texel buffers
    /// live in the common shader pools (and immutable ones batch like any
    /// other); on older devices each gets a dedicated buffer.
    pub fn create_texel_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        format: TexelFormat,
        size_bytes: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<TexelBufferHandle, VaoError> {
        if size_bytes > self.config.texel_buffer_max_size {
            return Err(VaoError::InvalidParams(format!(
                "texel buffer of {size_bytes} bytes exceeds the platform limit of {} bytes",
                self.config.texel_buffer_max_size
            )));
        }
        let alignment = self.config.texel_buffer_alignment as u64;
        // Dynamic buffers get rounded up so the offset after each frame
        // advance stays aligned.
        let alloc_bytes = if buffer_type.is_dynamic() {
            align_to_next_multiple(size_bytes, lcm(alignment, 1))
        } else {
            size_bytes
        };

        if self.shader_buffers_support_no_overwrite {
            return self
                .create_pooled_buffer(
                    device,
                    BufferCategory::Shader,
                    BufferKind::Texel { format },
                    size_bytes,
                    1,
                    alloc_bytes - size_bytes,
                    alignment,
                    buffer_type,
                    initial_data,
                    keep_shadow_copy,
                )
                .map(TexelBufferHandle);
        }

        if buffer_type == BufferType::Immutable && initial_data.is_none() {
            return Err(VaoError::InvalidParams(
                "immutable buffers require initial data".to_string(),
            ));
        }
        let buffer = create_dedicated_buffer(
            device,
            BufferUsage::TEXEL,
            alloc_bytes,
            buffer_type,
            initial_data,
            0,
            "texel buffer",
        )?;
        let handle = self.insert_dedicated_record(
            BufferCategory::Shader,
            BufferKind::Texel { format },
            buffer,
            size_bytes,
            1,
            alloc_bytes - size_bytes,
            buffer_type,
            initial_data,
            keep_shadow_copy,
        );
        Ok(TexelBufferHandle(handle))
    }

    /// Destroys a texel buffer.
    pub fn destroy_texel_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        handle: TexelBufferHandle,
    ) -> Result<(), VaoError> {
        self.destroy_buffer_record(device, handle.0)
    }

    /// Creates an indirect-argument buffer.
    ///
    /// Without device support for indirect buffers the content lives in CPU
    /// memory and maps return it directly. Immutable indirect buffers are a
    /// contract violation; the request degrades to `Default`.
    pub fn create_indirect_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        size_bytes: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<IndirectBufferHandle, VaoError> {
        debug_assert!(
            buffer_type != BufferType::Immutable,
            "immutable indirect buffers are not supported"
        );
        let buffer_type = if buffer_type == BufferType::Immutable {
            BufferType::Default
        } else {
            buffer_type
        };
        const ALIGNMENT: u64 = 4;
        let alloc_bytes = if buffer_type.is_dynamic() {
            align_to_next_multiple(size_bytes, ALIGNMENT)
        } else {
            size_bytes
        };

        if self.supports_indirect_buffers {
            return self
                .create_pooled_buffer(
                    device,
                    BufferCategory::Shader,
                    BufferKind::Indirect,
                    size_bytes,
                    1,
                    alloc_bytes - size_bytes,
                    ALIGNMENT,
                    buffer_type,
                    initial_data,
                    keep_shadow_copy,
                )
                .map(IndirectBufferHandle);
        }

        let mut data = vec![0u8; size_bytes as usize];
        if let Some(init) = initial_data {
            data[..init.len()].copy_from_slice(init);
        }
        let handle = self.next_buffer_handle;
        self.next_buffer_handle += 1;
        self.buffers.insert(
            handle,
            BufferRecord {
                category: BufferCategory::Shader,
                buffer_type,
                buffer_start: 0,
                final_buffer_start: 0,
                num_elements: size_bytes,
                bytes_per_element: 1,
                num_elements_padding: 0,
                shadow_copy: keep_shadow_copy
                    .then(|| initial_data.map(|d| Arc::from(d.to_vec())))
                    .flatten(),
                mapping: MappingState::Unmapped,
                interface: BufferInterface::Software {
                    data: data.into_boxed_slice(),
                },
                kind: BufferKind::Indirect,
            },
        );
        Ok(IndirectBufferHandle(handle))
    }

    /// Destroys an indirect buffer.
    pub fn destroy_indirect_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        handle: IndirectBufferHandle,
    ) -> Result<(), VaoError> {
        self.destroy_buffer_record(device, handle.0)
    }

    /// Creates an unordered-access (storage) buffer of structured elements.
    ///
    /// `extra_usage` adds view usages (e.g. [`BufferUsage::TEXEL`] for a
    /// read view). Always `Default`: unordered access and CPU mapping do not
    /// mix on this subsystem's platforms.
    pub fn create_uav_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        num_elements: u64,
        bytes_per_element: u32,
        extra_usage: BufferUsage,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<UavBufferHandle, VaoError> {
        let buffer_type = BufferType::Default;
        let size_bytes = num_elements * bytes_per_element as u64;
        let buffer = create_dedicated_buffer(
            device,
            BufferUsage::STORAGE | extra_usage,
            size_bytes,
            buffer_type,
            initial_data,
            bytes_per_element,
            "uav buffer",
        )?;
        let handle = self.insert_dedicated_record(
            BufferCategory::Shader,
            BufferKind::Uav,
            buffer,
            num_elements,
            bytes_per_element,
            0,
            buffer_type,
            initial_data,
            keep_shadow_copy,
        );
        Ok(UavBufferHandle(handle))
    }

    /// Destroys an unordered-access buffer.
    pub fn destroy_uav_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        handle: UavBufferHandle,
    ) -> Result<(), VaoError> {
        self.destroy_buffer_record(device, handle.0)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_dedicated_record(
        &mut self,
        category: BufferCategory,
        kind: BufferKind,
        buffer: BufferId,
        num_elements: u64,
        bytes_per_element: u32,
        num_elements_padding: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> u64 {
        let handle = self.next_buffer_handle;
        self.next_buffer_handle += 1;
        self.buffers.insert(
            handle,
            BufferRecord {
                category,
                buffer_type,
                buffer_start: 0,
                final_buffer_start: 0,
                num_elements,
                bytes_per_element,
                num_elements_padding,
                shadow_copy: keep_shadow_copy
                    .then(|| initial_data.map(|d| Arc::from(d.to_vec())))
                    .flatten(),
                mapping: MappingState::Unmapped,
                interface: BufferInterface::Compat(CompatInterface::new(buffer)),
                kind,
            },
        );
        handle
    }

    fn destroy_buffer_record(
        &mut self,
        device: &dyn GraphicsDevice,
        raw: u64,
    ) -> Result<(), VaoError> {
        let record = self
            .buffers
            .remove(&raw)
            .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
        debug_assert!(
            record.mapping == MappingState::Unmapped,
            "destroying a mapped buffer"
        );
        match record.interface {
            BufferInterface::Standard(ref st) => {
                if st.pending_upload.is_some() {
                    // Never made it to the GPU; just drop it from the queue.
                    self.delayed_buffers[record.category as usize].retain(|&h| h != raw);
                } else if record.buffer_type.is_dynamic() {
                    self.delayed_destroy.push_back(DelayedDestroy {
                        frame_count: self.frame_count,
                        vbo_index: st.vbo_index,
                        byte_offset: record.buffer_start * record.bytes_per_element as u64,
                        size_bytes: record.internal_size_bytes(),
                        buffer_type: record.buffer_type,
                        category: record.category,
                    });
                } else {
                    self.deallocate_vbo(
                        device,
                        st.vbo_index,
                        record.buffer_start * record.bytes_per_element as u64,
                        record.internal_size_bytes(),
                        record.buffer_type,
                        record.category,
                    );
                }
            }
            BufferInterface::Compat(compat) => {
                if let Err(err) = device.destroy_buffer(compat.buffer) {
                    log::warn!("VaoManager: failed to destroy dedicated buffer: {err}");
                }
            }
            BufferInterface::Software { .. } => {}
        }
        Ok(())
    }

    /// The shadow copy kept at creation, when one was requested.
    pub fn shadow_copy(&self, handle: impl Into<AnyBufferHandle>) -> Option<Arc<[u8]>> {
        self.buffers
            .get(&handle.into().raw())?
            .shadow_copy
            .clone()
    }

    // ------------------------------------------------------------------
    // Deferred immutable batching
    // ------------------------------------------------------------------

    /// Creates every queued immutable buffer, merging the queue per category
    /// into as few device buffers as fit the default pool size.
    ///
    /// Each batch concatenates the queued contents byte-wise, respecting
    /// every buffer's own alignment (recording stride changers for the
    /// padding), uploads the merged blob in one creation call, and then
    /// patches each logical buffer with its final pool location. Vertex
    /// arrays that referenced a queued buffer are rebuilt to point at the
    /// real resource. Called from [`begin_frame`](VaoManager::begin_frame).
    pub fn create_delayed_immutable_buffers(
        &mut self,
        device: &dyn GraphicsDevice,
    ) -> Result<(), VaoError> {
        let mut created = false;
        for category in CATEGORIES {
            let queue = self.delayed_buffers[category as usize].clone();
            let pool_limit = self
                .config
                .default_pool_sizes
                .get(category, PoolClass::Immutable);
            let mut start = 0;
            while start < queue.len() {
                // Each iteration builds one merged pool.
                let mut total_bytes = self.buffers[&queue[start]].total_size_bytes();
                let mut end = queue.len();
                let mut i = start + 1;
                while i < end {
                    let record = &self.buffers[&queue[i]];
                    if total_bytes + record.total_size_bytes() > pool_limit {
                        end = i;
                    } else {
                        total_bytes =
                            align_to_next_multiple(total_bytes, record.bytes_per_element as u64)
                                + record.total_size_bytes();
                        i += 1;
                    }
                }

                // Merge the contents into one contiguous blob.
                let mut merged = vec![0u8; total_bytes as usize];
                let mut stride_changers: Vec<StrideChanger> = Vec::new();
                let mut dst_offset = 0u64;
                for &raw in &queue[start..end] {
                    let Some(record) = self.buffers.get_mut(&raw) else {
                        debug_assert!(false, "queued immutable buffer has no record");
                        continue;
                    };
                    let before = dst_offset;
                    dst_offset =
                        align_to_next_multiple(dst_offset, record.bytes_per_element as u64);
                    if before != dst_offset {
                        stride_changers.push(StrideChanger {
                            offset_after_padding: dst_offset,
                            padded_bytes: dst_offset - before,
                        });
                    }
                    if let BufferInterface::Standard(st) = &mut record.interface {
                        if let Some(pending) = st.pending_upload.take() {
                            merged[dst_offset as usize..dst_offset as usize + pending.len()]
                                .copy_from_slice(&pending);
                        }
                    }
                    dst_offset += record.total_size_bytes();
                }

                let descriptor = BufferDescriptor {
                    label: Some(format!("{category:?} immutable pool").into()),
                    size: total_bytes,
                    usage: pool_usage(category),
                    memory: MemoryClass::Immutable,
                    structure_stride: 0,
                };
                let buffer = device
                    .create_buffer_with_data(&descriptor, &merged)
                    .map_err(|source| VaoError::OutOfDeviceMemory {
                        requested_bytes: total_bytes,
                        context: "immutable pool creation",
                        source,
                    })?;
                let vbos = &mut self.vbos[category as usize][PoolClass::Immutable as usize];
                vbos.push(Vbo {
                    buffer: Some(buffer),
                    size_bytes: total_bytes,
                    // Fully occupied by construction.
                    free_blocks: Vec::new(),
                    stride_changers,
                    dynamic_buffer: None,
                });
                let vbo_index = vbos.len() - 1;

                // Tell each buffer about its final pool location.
                let mut dst_offset = 0u64;
                for &raw in &queue[start..end] {
                    let Some(record) = self.buffers.get_mut(&raw) else {
                        continue;
                    };
                    let bpe = record.bytes_per_element as u64;
                    dst_offset = align_to_next_multiple(dst_offset, bpe);
                    record.buffer_start = dst_offset / bpe;
                    record.final_buffer_start = record.buffer_start;
                    if let BufferInterface::Standard(st) = &mut record.interface {
                        st.vbo_index = vbo_index;
                        st.buffer = Some(buffer);
                    }
                    dst_offset += record.total_size_bytes();
                }

                log::debug!(
                    "VaoManager: merged {} immutable {category:?} buffers into {total_bytes} bytes",
                    end - start
                );
                start = end;
                created = true;
            }
        }

        // The queued buffers now have their device locations; vertex arrays
        // caching the old (empty) state must be rebuilt before the queues
        // are cleared.
        if created {
            self.reorganize_immutable_vaos()?;
        }
        for queue in &mut self.delayed_buffers {
            queue.clear();
        }
        Ok(())
    }

    fn reorganize_immutable_vaos(&mut self) -> Result<(), VaoError> {
        let handles: Vec<u64> = self.vertex_arrays.keys().copied().collect();
        for raw in handles {
            let (needs_update, vertex_buffers, index_buffer, operation_type, render_queue_id) = {
                let record = &self.vertex_arrays[&raw];
                let mut needs = record.vertex_buffers.iter().any(|vb| {
                    self.delayed_buffers[BufferCategory::Vertex as usize].contains(&vb.0)
                });
                if let Some(ib) = record.index_buffer {
                    needs |=
                        self.delayed_buffers[BufferCategory::Index as usize].contains(&ib.0);
                }
                (
                    needs,
                    record.vertex_buffers.clone(),
                    record.index_buffer,
                    record.operation_type,
                    record.render_queue_id,
                )
            };
            if !needs_update {
                continue;
            }

            if self.vertex_arrays[&raw].shared.is_some() {
                let old_name = self.vertex_arrays[&raw].vao_name;
                self.release_vao(old_name);
            }
            let (vao_name, shared) =
                self.find_vao(&vertex_buffers, index_buffer, operation_type)?;
            let unique = extract_unique_vao_id(render_queue_id);
            if let Some(record) = self.vertex_arrays.get_mut(&raw) {
                record.vao_name = vao_name;
                record.render_queue_id = generate_render_queue_id(vao_name, unique);
                record.shared = Some(shared);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vertex arrays
    // ------------------------------------------------------------------

    fn find_vao(
        &mut self,
        vertex_buffers: &[VertexBufferHandle],
        index_buffer: Option<IndexBufferHandle>,
        operation_type: PrimitiveTopology,
    ) -> Result<(u32, Arc<VertexArrayLayout>), VaoError> {
        let mut bindings = Vec::with_capacity(vertex_buffers.len());
        for vb in vertex_buffers {
            let record = self
                .buffers
                .get(&vb.0)
                .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
            let BufferKind::Vertex { elements } = &record.kind else {
                return Err(VaoError::Resource(ResourceError::InvalidHandle));
            };
            let BufferInterface::Standard(st) = &record.interface else {
                return Err(VaoError::Resource(ResourceError::InvalidHandle));
            };
            let buffer = st
                .buffer
                .ok_or(VaoError::Resource(ResourceError::NotFound))?;
            bindings.push(VertexBinding {
                buffer,
                elements: elements.clone(),
                stride: vertex_size_bytes(elements),
                offset_bytes: 0,
                instancing_divisor: 0,
            });
        }

        let (index_id, index_format) = match index_buffer {
            Some(ib) => {
                let record = self
                    .buffers
                    .get(&ib.0)
                    .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
                let BufferKind::Index { format } = record.kind else {
                    return Err(VaoError::Resource(ResourceError::InvalidHandle));
                };
                let BufferInterface::Standard(st) = &record.interface else {
                    return Err(VaoError::Resource(ResourceError::InvalidHandle));
                };
                let buffer = st
                    .buffer
                    .ok_or(VaoError::Resource(ResourceError::NotFound))?;
                (Some(buffer), format)
            }
            None => (None, IndexFormat::Uint16),
        };

        // Linear scan for an exact structural match.
        for record in &mut self.vaos {
            if record.operation_type == operation_type
                && record.index_buffer == index_id
                && record.index_format == index_format
                && record.vertex_bindings == bindings
            {
                record.ref_count += 1;
                return Ok((record.vao_name, record.shared.clone()));
            }
        }

        let vao_name = self.vao_names;
        self.vao_names += 1;
        let shared = Arc::new(VertexArrayLayout {
            bindings: bindings.clone(),
            index: index_id.map(|b| (b, index_format)),
            operation_type,
        });
        self.vaos.push(VaoRecord {
            vao_name,
            ref_count: 1,
            operation_type,
            vertex_bindings: bindings,
            index_buffer: index_id,
            index_format,
            shared: shared.clone(),
        });
        Ok((vao_name, shared))
    }

    fn release_vao(&mut self, vao_name: u32) {
        if let Some(idx) = self.vaos.iter().position(|v| v.vao_name == vao_name) {
            self.vaos[idx].ref_count -= 1;
            if self.vaos[idx].ref_count == 0 {
                self.vaos.swap_remove(idx);
            }
        }
    }

    /// Creates a vertex array over `vertex_buffers` (and optionally an
    /// index buffer), deduplicating identical binding sets.
    ///
    /// When any referenced immutable buffer is still queued for batching,
    /// the array is created without shared layout data and rebuilt
    /// retroactively at the batch point.
    pub fn create_vertex_array_object(
        &mut self,
        vertex_buffers: &[VertexBufferHandle],
        index_buffer: Option<IndexBufferHandle>,
        operation_type: PrimitiveTopology,
    ) -> Result<VertexArrayHandle, VaoError> {
        let mut has_pending = false;
        for vb in vertex_buffers {
            let record = self
                .buffers
                .get(&vb.0)
                .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
            if let BufferInterface::Standard(st) = &record.interface {
                has_pending |= st.pending_upload.is_some();
            }
        }
        if let Some(ib) = index_buffer {
            let record = self
                .buffers
                .get(&ib.0)
                .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
            if let BufferInterface::Standard(st) = &record.interface {
                has_pending |= st.pending_upload.is_some();
            }
        }

        let unique = self.num_generated_vaos;
        self.num_generated_vaos = self.num_generated_vaos.wrapping_add(1);

        let (vao_name, shared) = if has_pending {
            (0, None)
        } else {
            let (name, shared) = self.find_vao(vertex_buffers, index_buffer, operation_type)?;
            (name, Some(shared))
        };

        let handle = self.next_vertex_array_handle;
        self.next_vertex_array_handle += 1;
        self.vertex_arrays.insert(
            handle,
            VertexArrayRecord {
                vao_name,
                render_queue_id: generate_render_queue_id(vao_name, unique),
                vertex_buffers: vertex_buffers.to_vec(),
                index_buffer,
                operation_type,
                shared,
            },
        );
        Ok(VertexArrayHandle(handle))
    }

    /// Destroys a vertex array, releasing its deduplicated record once the
    /// last referencing array is gone.
    pub fn destroy_vertex_array_object(
        &mut self,
        handle: VertexArrayHandle,
    ) -> Result<(), VaoError> {
        let record = self
            .vertex_arrays
            .remove(&handle.0)
            .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
        if record.shared.is_some() {
            self.release_vao(record.vao_name);
        }
        Ok(())
    }

    /// The shared layout of a vertex array; `None` while it waits on queued
    /// immutable buffers (or for an unknown handle).
    pub fn vertex_array_layout(
        &self,
        handle: VertexArrayHandle,
    ) -> Option<Arc<VertexArrayLayout>> {
        self.vertex_arrays.get(&handle.0)?.shared.clone()
    }

    /// The draw-sorting key of a vertex array.
    pub fn vertex_array_render_queue_id(&self, handle: VertexArrayHandle) -> Option<u32> {
        Some(self.vertex_arrays.get(&handle.0)?.render_queue_id)
    }

    // ------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------

    /// Maps `elem_count` elements starting at `elem_start` for writing.
    ///
    /// Only dynamic buffers map. The buffer's frame slot advances first, so
    /// the write lands in the copy the GPU is not reading; the returned
    /// region must be handed back to [`unmap_buffer`](VaoManager::unmap_buffer).
    pub fn map_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        handle: impl Into<AnyBufferHandle>,
        elem_start: u64,
        elem_count: u64,
    ) -> Result<MappedRegion, VaoError> {
        let raw = handle.into().raw();
        let multiplier = self.config.dynamic_buffer_multiplier as u64;
        let Self { buffers, vbos, .. } = self;
        let record = buffers
            .get_mut(&raw)
            .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
        debug_assert!(
            record.mapping == MappingState::Unmapped,
            "buffer is already mapped"
        );
        if elem_start + elem_count > record.num_elements {
            return Err(VaoError::Resource(ResourceError::OutOfBounds));
        }
        let bpe = record.bytes_per_element as u64;

        let region = match &mut record.interface {
            BufferInterface::Software { data } => {
                let start = (elem_start * bpe) as usize;
                // CPU emulation: the "mapping" is the backing memory itself.
                let ptr = unsafe { NonNull::new_unchecked(data.as_mut_ptr().add(start)) };
                MappedRegion::new(ptr, elem_count * bpe)
            }
            BufferInterface::Standard(st) => {
                if !record.buffer_type.is_dynamic() {
                    return Err(VaoError::NotMappable);
                }
                let stride = record.num_elements + record.num_elements_padding;
                let slot =
                    ((record.final_buffer_start - record.buffer_start) / stride + 1) % multiplier;
                record.final_buffer_start = record.buffer_start + slot * stride;

                let byte_start = (record.final_buffer_start + elem_start) * bpe;
                let vbo = &mut vbos[record.category as usize][PoolClass::Dynamic as usize]
                    [st.vbo_index];
                let Some(dynamic) = vbo.dynamic_buffer.as_mut() else {
                    debug_assert!(false, "dynamic pool without a mapping tracker");
                    return Err(VaoError::NotMappable);
                };
                let (ptr, ticket) = dynamic.map(device, byte_start, elem_count * bpe)?;
                st.map_ticket = Some(ticket);
                MappedRegion::new(ptr, elem_count * bpe)
            }
            BufferInterface::Compat(compat) => {
                if !record.buffer_type.is_dynamic() {
                    return Err(VaoError::NotMappable);
                }
                let mode = compat.choose_map_mode(elem_start);
                let base = device.map_buffer(compat.buffer, mode)?;
                compat.record_mapping(elem_start, elem_count);
                let ptr =
                    unsafe { NonNull::new_unchecked(base.as_ptr().add((elem_start * bpe) as usize)) };
                MappedRegion::new(ptr, elem_count * bpe)
            }
        };
        record.mapping = MappingState::Mapped;
        Ok(region)
    }

    /// Ends a write mapping, consuming the region.
    pub fn unmap_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        handle: impl Into<AnyBufferHandle>,
        region: MappedRegion,
    ) -> Result<(), VaoError> {
        drop(region);
        let raw = handle.into().raw();
        let Self { buffers, vbos, .. } = self;
        let record = buffers
            .get_mut(&raw)
            .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
        debug_assert!(
            record.mapping == MappingState::Mapped,
            "unmap without a live mapping"
        );
        match &mut record.interface {
            BufferInterface::Software { .. } => {}
            BufferInterface::Standard(st) => {
                let Some(ticket) = st.map_ticket.take() else {
                    debug_assert!(false, "mapped standard buffer without a ticket");
                    return Err(VaoError::NotMappable);
                };
                let vbo = &mut vbos[record.category as usize][PoolClass::Dynamic as usize]
                    [st.vbo_index];
                let Some(dynamic) = vbo.dynamic_buffer.as_mut() else {
                    debug_assert!(false, "dynamic pool without a mapping tracker");
                    return Err(VaoError::NotMappable);
                };
                dynamic.unmap(device, ticket)?;
            }
            BufferInterface::Compat(compat) => {
                device
                    .unmap_buffer(compat.buffer)
                    .map_err(VaoError::Resource)?;
            }
        }
        record.mapping = MappingState::Unmapped;
        Ok(())
    }

    /// Moves a dynamic buffer's frame slot forward without mapping, for
    /// frames that bind the buffer without rewriting it.
    pub fn advance_frame(&mut self, handle: impl Into<AnyBufferHandle>) -> Result<(), VaoError> {
        self.shift_frame(handle.into().raw(), 1)
    }

    /// Moves a dynamic buffer's frame slot backward, undoing a speculative
    /// advance when a triple-buffered write is aborted.
    pub fn regress_frame(&mut self, handle: impl Into<AnyBufferHandle>) -> Result<(), VaoError> {
        let steps = self.config.dynamic_buffer_multiplier as u64 - 1;
        self.shift_frame(handle.into().raw(), steps)
    }

    fn shift_frame(&mut self, raw: u64, steps: u64) -> Result<(), VaoError> {
        let multiplier = self.config.dynamic_buffer_multiplier as u64;
        let record = self
            .buffers
            .get_mut(&raw)
            .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
        if matches!(record.interface, BufferInterface::Software { .. }) {
            return Ok(());
        }
        if !record.buffer_type.is_dynamic() {
            return Err(VaoError::NotMappable);
        }
        debug_assert!(
            record.mapping == MappingState::Unmapped,
            "frame shifts require an unmapped buffer"
        );
        let stride = record.frame_stride_elements();
        let slot = ((record.final_buffer_start - record.buffer_start) / stride + steps) % multiplier;
        record.final_buffer_start = record.buffer_start + slot * stride;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Staging buffers and transfers
    // ------------------------------------------------------------------

    /// Returns a staging buffer of at least `min_size_bytes`, reviving a
    /// retired one when possible and creating one otherwise.
    pub fn get_staging_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        min_size_bytes: u64,
        for_upload: bool,
    ) -> Result<StagingBuffer, VaoError> {
        if let Some(idx) = self
            .zero_ref_staging
            .iter()
            .position(|s| s.for_upload() == for_upload && s.size_bytes() >= min_size_bytes)
        {
            let mut staging = self.zero_ref_staging.swap_remove(idx);
            staging.touch(self.now_ms());
            return Ok(staging);
        }
        self.create_staging_buffer(device, min_size_bytes, for_upload)
    }

    /// Creates a staging buffer of at least `size_bytes` (minimum 4 MiB).
    pub fn create_staging_buffer(
        &mut self,
        device: &dyn GraphicsDevice,
        size_bytes: u64,
        for_upload: bool,
    ) -> Result<StagingBuffer, VaoError> {
        let size_bytes = size_bytes.max(4 * 1024 * 1024);
        let (usage, memory) = if for_upload {
            (
                BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC,
                MemoryClass::Dynamic,
            )
        } else {
            (
                BufferUsage::MAP_READ | BufferUsage::COPY_DST,
                MemoryClass::Staging,
            )
        };
        let descriptor = BufferDescriptor {
            label: Some(if for_upload {
                "upload staging buffer".into()
            } else {
                "download staging buffer".into()
            }),
            size: size_bytes,
            usage,
            memory,
            structure_stride: 0,
        };
        let buffer =
            device
                .create_buffer(&descriptor)
                .map_err(|source| VaoError::OutOfDeviceMemory {
                    requested_bytes: size_bytes,
                    context: "staging buffer creation",
                    source,
                })?;
        let now = self.now_ms();
        if self.next_staging_check_ms == u64::MAX {
            self.next_staging_check_ms = now + self.config.staging_buffer_lifetime_ms;
        }
        Ok(StagingBuffer::new(
            buffer,
            size_bytes,
            for_upload,
            self.config.staging_buffer_lifetime_ms,
            now,
        ))
    }

    /// Parks a staging buffer for reuse; [`update`](VaoManager::update)
    /// destroys it after it sits unused past its lifetime.
    pub fn retire_staging_buffer(&mut self, mut staging: StagingBuffer) {
        let now = self.now_ms();
        staging.touch(now);
        self.next_staging_check_ms = self
            .next_staging_check_ms
            .min(now + staging.lifetime_threshold_ms);
        self.zero_ref_staging.push(staging);
    }

    /// Commits a mapped upload region: one GPU copy per destination, each
    /// resolved to its buffer's current frame location.
    pub fn upload(
        &mut self,
        device: &dyn GraphicsDevice,
        staging: &mut StagingBuffer,
        region: MappedRegion,
        destinations: &[UploadDestination],
    ) -> Result<(), VaoError> {
        let mut copies = Vec::with_capacity(destinations.len());
        for dest in destinations {
            let record = self
                .buffers
                .get(&dest.dst.raw())
                .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
            debug_assert!(
                dest.dst_offset_bytes + dest.size_bytes <= record.total_size_bytes(),
                "upload destination exceeds the buffer's content"
            );
            let buffer = match &record.interface {
                BufferInterface::Standard(st) => st.buffer.ok_or_else(|| {
                    VaoError::InvalidParams(
                        "cannot upload into a buffer still queued for batching".to_string(),
                    )
                })?,
                BufferInterface::Compat(compat) => compat.buffer,
                BufferInterface::Software { .. } => {
                    return Err(VaoError::InvalidParams(
                        "software-emulated buffers have no device storage".to_string(),
                    ));
                }
            };
            copies.push(CopyDestination {
                buffer,
                dst_offset_bytes: record.final_buffer_start * record.bytes_per_element as u64
                    + dest.dst_offset_bytes,
                src_offset_bytes: dest.src_offset_bytes,
                size_bytes: dest.size_bytes,
            });
        }
        staging.unmap(device, &copies, region)
    }

    /// Starts an asynchronous GPU → CPU transfer of `elem_count` elements
    /// from `handle`'s current frame location, returning the completion
    /// handle.
    ///
    /// An immutable source still queued for batching forces the queue to
    /// flush first, which reduces batching opportunities; a performance
    /// warning is logged when that happens.
    pub fn create_async_ticket(
        &mut self,
        device: &dyn GraphicsDevice,
        handle: impl Into<AnyBufferHandle>,
        staging: &mut StagingBuffer,
        elem_start: u64,
        elem_count: u64,
    ) -> Result<AsyncTicket, VaoError> {
        let raw = handle.into().raw();
        let is_immutable = self
            .buffers
            .get(&raw)
            .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?
            .buffer_type
            == BufferType::Immutable;
        if is_immutable {
            if self.delayed_buffers.iter().any(|q| !q.is_empty()) {
                log::warn!(
                    "VaoManager: creating an async ticket while immutable buffers are still \
                     queued for batching; the queue is flushed now, which shrinks the merge \
                     batches and can hurt rendering performance. Create tickets after all \
                     immutable buffers are loaded, or ignore this when not rendering."
                );
            }
            self.create_delayed_immutable_buffers(device)?;
        }

        let record = self
            .buffers
            .get(&raw)
            .ok_or(VaoError::Resource(ResourceError::InvalidHandle))?;
        let bpe = record.bytes_per_element as u64;
        debug_assert!(elem_start + elem_count <= record.num_elements);
        let buffer = match &record.interface {
            BufferInterface::Standard(st) => st
                .buffer
                .ok_or(VaoError::Resource(ResourceError::NotFound))?,
            BufferInterface::Compat(compat) => compat.buffer,
            BufferInterface::Software { .. } => {
                return Err(VaoError::InvalidParams(
                    "software-emulated buffers have no device storage".to_string(),
                ));
            }
        };
        let src_offset = (record.final_buffer_start + elem_start) * bpe;
        AsyncTicket::new(device, staging, buffer, src_offset, elem_count * bpe)
    }

    // ------------------------------------------------------------------
    // Frame lifecycle
    // ------------------------------------------------------------------

    /// Frame-begin hook: the deferred immutable batch point.
    pub fn begin_frame(&mut self, device: &dyn GraphicsDevice) -> Result<(), VaoError> {
        self.create_delayed_immutable_buffers(device)
    }

    /// Frame-end hook: reclaims idle staging buffers, drains due delayed
    /// destructions, places this frame's fence, and advances the ring.
    pub fn update(&mut self, device: &dyn GraphicsDevice) -> Result<(), VaoError> {
        let now = self.now_ms();
        if now >= self.next_staging_check_ms {
            self.next_staging_check_ms = u64::MAX;
            let mut idx = 0;
            while idx < self.zero_ref_staging.len() {
                let deadline = self.zero_ref_staging[idx].last_used_ms
                    + self.zero_ref_staging[idx].lifetime_threshold_ms;
                if deadline < now {
                    let staging = self.zero_ref_staging.swap_remove(idx);
                    staging.destroy(device);
                } else {
                    self.next_staging_check_ms = self.next_staging_check_ms.min(deadline);
                    idx += 1;
                }
            }
        }

        let multiplier = self.config.dynamic_buffer_multiplier as u32;
        let mut waited = false;
        loop {
            let due = self
                .delayed_destroy
                .front()
                .is_some_and(|d| self.frame_count.wrapping_sub(d.frame_count) >= multiplier);
            if !due {
                break;
            }
            if !waited {
                self.wait_for_tail_frame_to_finish(device)?;
                waited = true;
            }
            if let Some(d) = self.delayed_destroy.pop_front() {
                self.deallocate_vbo(
                    device,
                    d.vbo_index,
                    d.byte_offset,
                    d.size_bytes,
                    d.buffer_type,
                    d.category,
                );
            }
        }

        self.frame_count = self.frame_count.wrapping_add(1);

        if let Some(old) = self.frame_sync[self.dynamic_frame].take() {
            if let Err(err) = device.destroy_fence(old) {
                log::warn!("VaoManager: failed to destroy reused frame fence: {err}");
            }
        }
        self.frame_sync[self.dynamic_frame] = Some(device.create_fence()?);
        self.dynamic_frame = (self.dynamic_frame + 1) % self.frame_sync.len();
        Ok(())
    }

    /// Blocks until the fence of the slot about to be reused signals,
    /// guaranteeing the GPU consumed the frame written into it a full ring
    /// ago. Returns the slot index.
    pub fn wait_for_tail_frame_to_finish(
        &mut self,
        device: &dyn GraphicsDevice,
    ) -> Result<u8, VaoError> {
        if let Some(fence) = self.frame_sync[self.dynamic_frame].take() {
            wait_for_fence(device, fence)?;
            if let Err(err) = device.destroy_fence(fence) {
                log::warn!("VaoManager: failed to destroy waited frame fence: {err}");
            }
        }
        Ok(self.dynamic_frame as u8)
    }

    /// Blocks until the GPU has finished the frame numbered `frame_count`.
    ///
    /// The current frame forces a full stall through a throwaway fence; a
    /// frame within the ring waits on its slot fence (releasing every newer
    /// slot fence up to it); anything older needs no stall.
    pub fn wait_for_specific_frame_to_finish(
        &mut self,
        device: &dyn GraphicsDevice,
        frame_count: u32,
    ) -> Result<(), VaoError> {
        let diff = self.frame_count.wrapping_sub(frame_count);
        let multiplier = self.frame_sync.len();
        if diff == 0 {
            let fence = device.create_fence().map_err(VaoError::Resource)?;
            wait_for_fence(device, fence)?;
            if let Err(err) = device.destroy_fence(fence) {
                log::warn!("VaoManager: failed to destroy stall fence: {err}");
            }
        } else if (diff as usize) <= multiplier {
            let idx = (self.dynamic_frame + multiplier - diff as usize) % multiplier;
            if let Some(fence) = self.frame_sync[idx].take() {
                wait_for_fence(device, fence)?;
                if let Err(err) = device.destroy_fence(fence) {
                    log::warn!("VaoManager: failed to destroy waited frame fence: {err}");
                }
                // Everything older than the waited frame is finished too.
                let mut next = self.dynamic_frame;
                while next != idx {
                    if let Some(fence) = self.frame_sync[next].take() {
                        if let Err(err) = device.destroy_fence(fence) {
                            log::warn!("VaoManager: failed to destroy frame fence: {err}");
                        }
                    }
                    next = (next + 1) % multiplier;
                }
            }
        }
        Ok(())
    }

    /// Non-blocking query of whether frame `frame_count` has finished on
    /// the GPU, clearing retired fences when completion is observed.
    pub fn is_frame_finished(
        &mut self,
        device: &dyn GraphicsDevice,
        frame_count: u32,
    ) -> Result<bool, VaoError> {
        let diff = self.frame_count.wrapping_sub(frame_count);
        let multiplier = self.frame_sync.len();
        if diff == 0 {
            return Ok(true);
        }
        if (diff as usize) <= multiplier {
            let idx = (self.dynamic_frame + multiplier - diff as usize) % multiplier;
            let Some(fence) = self.frame_sync[idx] else {
                return Ok(false);
            };
            if !device.fence_status(fence).map_err(VaoError::Resource)? {
                return Ok(false);
            }
            self.frame_sync[idx] = None;
            if let Err(err) = device.destroy_fence(fence) {
                log::warn!("VaoManager: failed to destroy frame fence: {err}");
            }
            let mut next = self.dynamic_frame;
            while next != idx {
                if let Some(fence) = self.frame_sync[next].take() {
                    if let Err(err) = device.destroy_fence(fence) {
                        log::warn!("VaoManager: failed to destroy frame fence: {err}");
                    }
                }
                next = (next + 1) % multiplier;
            }
            return Ok(true);
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Introspection and teardown
    // ------------------------------------------------------------------

    /// Aggregate capacity and usage of every live pool.
    pub fn memory_stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();
        for per_category in &self.vbos {
            for per_class in per_category {
                for vbo in per_class {
                    if vbo.buffer.is_none() {
                        continue;
                    }
                    let free: u64 = vbo.free_blocks.iter().map(|b| b.size).sum();
                    stats.capacity_bytes += vbo.size_bytes;
                    stats.used_bytes += vbo.size_bytes - free;
                    stats.pool_count += 1;
                }
            }
        }
        stats
    }

    /// Releases every device resource the manager still owns: dedicated
    /// buffers, pools, frame fences, and retired staging buffers.
    pub fn destroy(mut self, device: &dyn GraphicsDevice) {
        for (_, record) in self.buffers.drain() {
            if let BufferInterface::Compat(compat) = record.interface {
                if let Err(err) = device.destroy_buffer(compat.buffer) {
                    log::warn!("VaoManager: failed to destroy dedicated buffer: {err}");
                }
            }
        }
        for per_category in &mut self.vbos {
            for per_class in per_category {
                for vbo in per_class {
                    if let Some(buffer) = vbo.buffer.take() {
                        if let Err(err) = device.destroy_buffer(buffer) {
                            log::warn!("VaoManager: failed to destroy pool buffer: {err}");
                        }
                    }
                }
            }
        }
        for slot in &mut self.frame_sync {
            if let Some(fence) = slot.take() {
                if let Err(err) = device.destroy_fence(fence) {
                    log::warn!("VaoManager: failed to destroy frame fence: {err}");
                }
            }
        }
        for staging in self.zero_ref_staging.drain(..) {
            staging.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::api::{MapMode, VertexFormat, VertexSemantic};
    use crate::renderer::vao::test_device::TestDevice;

    fn float3() -> Vec<VertexElement> {
        vec![VertexElement::new(
            VertexSemantic::Position,
            VertexFormat::Float32x3,
        )]
    }

    fn float4() -> Vec<VertexElement> {
        vec![VertexElement::new(
            VertexSemantic::Color,
            VertexFormat::Float32x4,
        )]
    }

    fn test_config() -> VaoManagerConfig {
        VaoManagerConfig {
            default_pool_sizes: PoolSizes::uniform(64 * 1024),
            ..VaoManagerConfig::default()
        }
    }

    fn manager(device: &TestDevice) -> VaoManager {
        VaoManager::new(device, test_config()).unwrap()
    }

    fn pool_buffer_of(m: &VaoManager, raw: u64) -> BufferId {
        let BufferInterface::Standard(st) = &m.buffers[&raw].interface else {
            panic!("not a pooled buffer");
        };
        st.buffer.expect("buffer has not reached the GPU")
    }

    #[test]
    fn construction_flushes_the_draw_id_batch() {
        let device = TestDevice::new();
        let m = manager(&device);

        let contents = device.buffer_contents(pool_buffer_of(&m, m.draw_id.0));
        let ids: Vec<u32> = (0..VaoManager::DRAW_ID_ELEMENTS).collect();
        assert_eq!(contents, bytemuck::cast_slice::<u32, u8>(&ids));
        assert!(m.delayed_buffers.iter().all(|q| q.is_empty()));
        assert_eq!(
            m.vbos[BufferCategory::Vertex as usize][PoolClass::Immutable as usize].len(),
            1
        );
    }

    #[test]
    fn allocations_respect_alignment_and_bounds() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let a = m
            .create_vertex_buffer(&device, &float3(), 10, BufferType::Default, None, false)
            .unwrap();
        let b = m
            .create_vertex_buffer(&device, &float4(), 10, BufferType::Default, None, false)
            .unwrap();
        let c = m
            .create_vertex_buffer(&device, &float3(), 4, BufferType::Default, None, false)
            .unwrap();

        let pool = &m.vbos[BufferCategory::Vertex as usize][PoolClass::Default as usize][0];
        for raw in [a.0, b.0, c.0] {
            let record = &m.buffers[&raw];
            let offset = record.buffer_start * record.bytes_per_element as u64;
            assert_eq!(offset % record.bytes_per_element as u64, 0);
            assert!(offset + record.total_size_bytes() <= pool.size_bytes);
        }
        // The 16-byte-stride buffer could not start at byte 120; the pad is
        // tracked for reversal.
        assert_eq!(m.buffers[&b.0].buffer_start * 16, 128);
        assert_eq!(pool.stride_changers.len(), 1);
    }

    #[test]
    fn deallocation_in_any_order_restores_one_free_block() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let a = m
            .create_vertex_buffer(&device, &float3(), 10, BufferType::Default, None, false)
            .unwrap();
        let b = m
            .create_vertex_buffer(&device, &float4(), 10, BufferType::Default, None, false)
            .unwrap();
        let c = m
            .create_vertex_buffer(&device, &float3(), 4, BufferType::Default, None, false)
            .unwrap();

        m.destroy_vertex_buffer(&device, b).unwrap();
        m.destroy_vertex_buffer(&device, c).unwrap();
        m.destroy_vertex_buffer(&device, a).unwrap();

        let pool = &m.vbos[BufferCategory::Vertex as usize][PoolClass::Default as usize][0];
        assert_eq!(pool.free_blocks, vec![Block::new(0, pool.size_bytes)]);
        assert!(pool.stride_changers.is_empty());
    }

    #[test]
    fn dynamic_allocations_reserve_every_frame_copy() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let h = m
            .create_vertex_buffer(
                &device,
                &float4(),
                100,
                BufferType::DynamicDefault,
                None,
                false,
            )
            .unwrap();

        let record = &m.buffers[&h.0];
        assert_eq!(record.buffer_start, 0);
        let pool = &m.vbos[BufferCategory::Vertex as usize][PoolClass::Dynamic as usize][0];
        // 100 elements × 16 bytes × triple buffering.
        assert_eq!(pool.free_blocks[0].offset, 4800);
    }

    #[test]
    fn immutable_batching_merges_and_round_trips() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let datas = [vec![0x11u8; 40], vec![0x22u8; 80], vec![0x33u8; 20]];
        let handles: Vec<IndexBufferHandle> = datas
            .iter()
            .map(|data| {
                m.create_index_buffer(
                    &device,
                    IndexFormat::Uint32,
                    data.len() as u64 / 4,
                    BufferType::Immutable,
                    Some(data),
                    false,
                )
                .unwrap()
            })
            .collect();

        for h in &handles {
            let BufferInterface::Standard(st) = &m.buffers[&h.0].interface else {
                panic!("index buffers are pooled");
            };
            assert!(st.buffer.is_none(), "creation must be deferred");
        }

        m.begin_frame(&device).unwrap();

        let shared_pool = pool_buffer_of(&m, handles[0].0);
        let merged = device.buffer_contents(shared_pool);
        for (h, data) in handles.iter().zip(&datas) {
            assert_eq!(pool_buffer_of(&m, h.0), shared_pool);
            let record = &m.buffers[&h.0];
            let offset = (record.buffer_start * 4) as usize;
            assert_eq!(&merged[offset..offset + data.len()], &data[..]);
        }
        assert!(m.delayed_buffers.iter().all(|q| q.is_empty()));
    }

    #[test]
    fn oversized_batches_split_into_multiple_pools() {
        let device = TestDevice::new();
        let mut config = test_config();
        config
            .default_pool_sizes
            .set(BufferCategory::Index, PoolClass::Immutable, 64);
        let mut m = VaoManager::new(&device, config).unwrap();

        let a = m
            .create_index_buffer(
                &device,
                IndexFormat::Uint32,
                12,
                BufferType::Immutable,
                Some(&[1u8; 48]),
                false,
            )
            .unwrap();
        let b = m
            .create_index_buffer(
                &device,
                IndexFormat::Uint32,
                12,
                BufferType::Immutable,
                Some(&[2u8; 48]),
                false,
            )
            .unwrap();
        m.begin_frame(&device).unwrap();

        assert_ne!(pool_buffer_of(&m, a.0), pool_buffer_of(&m, b.0));
        assert_eq!(
            m.vbos[BufferCategory::Index as usize][PoolClass::Immutable as usize].len(),
            2
        );
    }

    #[test]
    fn emptied_immutable_pools_release_their_device_buffers() {
        let device = TestDevice::new();
        let mut config = test_config();
        config
            .default_pool_sizes
            .set(BufferCategory::Index, PoolClass::Immutable, 64);
        let mut m = VaoManager::new(&device, config).unwrap();

        let a = m
            .create_index_buffer(
                &device,
                IndexFormat::Uint32,
                12,
                BufferType::Immutable,
                Some(&[1u8; 48]),
                false,
            )
            .unwrap();
        let b = m
            .create_index_buffer(
                &device,
                IndexFormat::Uint32,
                12,
                BufferType::Immutable,
                Some(&[2u8; 48]),
                false,
            )
            .unwrap();
        m.begin_frame(&device).unwrap();
        let buffers_before = device.buffer_count();

        m.destroy_index_buffer(&device, a).unwrap();
        // The first pool is released but keeps its slot; the second is
        // still live behind it.
        assert_eq!(device.buffer_count(), buffers_before - 1);
        assert_eq!(
            m.vbos[BufferCategory::Index as usize][PoolClass::Immutable as usize].len(),
            2
        );

        m.destroy_index_buffer(&device, b).unwrap();
        assert_eq!(device.buffer_count(), buffers_before - 2);
        assert!(m.vbos[BufferCategory::Index as usize][PoolClass::Immutable as usize].is_empty());
    }

    #[test]
    fn vertex_arrays_deduplicate_by_structure() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let vb = m
            .create_vertex_buffer(&device, &float3(), 10, BufferType::Default, None, false)
            .unwrap();
        let ib = m
            .create_index_buffer(&device, IndexFormat::Uint16, 30, BufferType::Default, None, false)
            .unwrap();

        let first = m
            .create_vertex_array_object(&[vb], Some(ib), PrimitiveTopology::TriangleList)
            .unwrap();
        let second = m
            .create_vertex_array_object(&[vb], Some(ib), PrimitiveTopology::TriangleList)
            .unwrap();
        let other = m
            .create_vertex_array_object(&[vb], Some(ib), PrimitiveTopology::TriangleStrip)
            .unwrap();

        assert_eq!(
            m.vertex_arrays[&first.0].vao_name,
            m.vertex_arrays[&second.0].vao_name
        );
        assert_ne!(
            m.vertex_arrays[&first.0].vao_name,
            m.vertex_arrays[&other.0].vao_name
        );
        assert_eq!(m.vaos.len(), 2);
        let shared_name = m.vertex_arrays[&first.0].vao_name;
        let ref_count = |m: &VaoManager, name: u32| {
            m.vaos
                .iter()
                .find(|v| v.vao_name == name)
                .map(|v| v.ref_count)
        };
        assert_eq!(ref_count(&m, shared_name), Some(2));

        m.destroy_vertex_array_object(first).unwrap();
        assert_eq!(ref_count(&m, shared_name), Some(1));
        m.destroy_vertex_array_object(second).unwrap();
        assert_eq!(ref_count(&m, shared_name), None);
        m.destroy_vertex_array_object(other).unwrap();
        assert!(m.vaos.is_empty());
    }

    #[test]
    fn vertex_arrays_over_queued_buffers_are_rebuilt_at_the_batch_point() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let vb = m
            .create_vertex_buffer(
                &device,
                &float3(),
                8,
                BufferType::Immutable,
                Some(&[5u8; 96]),
                false,
            )
            .unwrap();
        let vao = m
            .create_vertex_array_object(&[vb], None, PrimitiveTopology::TriangleStrip)
            .unwrap();

        assert!(m.vertex_array_layout(vao).is_none());
        let unique_before =
            extract_unique_vao_id(m.vertex_array_render_queue_id(vao).unwrap());

        m.begin_frame(&device).unwrap();

        let layout = m.vertex_array_layout(vao).expect("rebuilt at batch point");
        assert_eq!(layout.bindings.len(), 1);
        assert_eq!(layout.bindings[0].buffer, pool_buffer_of(&m, vb.0));
        assert_ne!(m.vertex_arrays[&vao.0].vao_name, 0);
        assert_eq!(
            extract_unique_vao_id(m.vertex_array_render_queue_id(vao).unwrap()),
            unique_before
        );
    }

    #[test]
    fn mapping_rotates_the_frame_slot_and_writes_land_in_it() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let h = m
            .create_vertex_buffer(
                &device,
                &float4(),
                4,
                BufferType::DynamicDefault,
                None,
                false,
            )
            .unwrap();

        let mut region = m.map_buffer(&device, h, 0, 4).unwrap();
        region.write(0, &[0xaa; 64]);
        m.unmap_buffer(&device, h, region).unwrap();

        let record = &m.buffers[&h.0];
        assert_eq!(record.final_buffer_start, record.buffer_start + 4);
        let contents = device.buffer_contents(pool_buffer_of(&m, h.0));
        let offset = (record.final_buffer_start * 16) as usize;
        assert!(contents[offset..offset + 64].iter().all(|&b| b == 0xaa));

        // Two more maps cycle through the remaining slots and wrap.
        for _ in 0..2 {
            let region = m.map_buffer(&device, h, 0, 4).unwrap();
            m.unmap_buffer(&device, h, region).unwrap();
        }
        let record = &m.buffers[&h.0];
        assert_eq!(record.final_buffer_start, record.buffer_start);
    }

    #[test]
    fn regress_frame_undoes_an_advance() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let h = m
            .create_vertex_buffer(
                &device,
                &float4(),
                4,
                BufferType::DynamicDefault,
                None,
                false,
            )
            .unwrap();
        let start = m.buffers[&h.0].final_buffer_start;
        m.advance_frame(h).unwrap();
        assert_ne!(m.buffers[&h.0].final_buffer_start, start);
        m.regress_frame(h).unwrap();
        assert_eq!(m.buffers[&h.0].final_buffer_start, start);
    }

    #[test]
    fn non_dynamic_buffers_do_not_map() {
        let device = TestDevice::new();
        let mut m = manager(&device);
        let h = m
            .create_vertex_buffer(&device, &float3(), 4, BufferType::Default, None, false)
            .unwrap();
        assert!(matches!(
            m.map_buffer(&device, h, 0, 4),
            Err(VaoError::NotMappable)
        ));
    }

    #[test]
    fn compat_mapping_discards_on_overlap_and_no_overwrites_beyond() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let cb = m
            .create_const_buffer(&device, 1024, BufferType::DynamicDefault, None, false)
            .unwrap();

        for (start, count) in [(0u64, 100u64), (50, 100), (200, 100)] {
            let region = m.map_buffer(&device, cb, start, count).unwrap();
            m.unmap_buffer(&device, cb, region).unwrap();
        }

        let modes: Vec<MapMode> = device.map_log().into_iter().map(|(_, mode)| mode).collect();
        assert_eq!(
            modes,
            vec![
                MapMode::WriteDiscard,     // first write after creation
                MapMode::WriteDiscard,     // overlaps the prior write's tail
                MapMode::WriteNoOverwrite, // strictly beyond all prior writes
            ]
        );
    }

    #[test]
    fn limited_devices_fall_back_to_dedicated_and_software_buffers() {
        let device = TestDevice::without_features();
        let mut m = manager(&device);

        // Without no-overwrite on shader buffers, texel buffers leave the
        // common pools and get dedicated device memory.
        let texel = m
            .create_texel_buffer(
                &device,
                TexelFormat::R32Uint,
                512,
                BufferType::Default,
                Some(&[3u8; 512]),
                false,
            )
            .unwrap();
        assert!(matches!(
            m.buffers[&texel.0].interface,
            BufferInterface::Compat(_)
        ));

        // Without indirect support, indirect content lives CPU-side and
        // maps return it directly.
        let indirect = m
            .create_indirect_buffer(&device, 64, BufferType::DynamicDefault, None, false)
            .unwrap();
        assert!(matches!(
            m.buffers[&indirect.0].interface,
            BufferInterface::Software { .. }
        ));
        let mut region = m.map_buffer(&device, indirect, 0, 64).unwrap();
        region.write(0, &[9u8; 64]);
        m.unmap_buffer(&device, indirect, region).unwrap();
        let BufferInterface::Software { data } = &m.buffers[&indirect.0].interface else {
            unreachable!()
        };
        assert_eq!(&data[..], &[9u8; 64]);

        m.destroy_texel_buffer(&device, texel).unwrap();
        m.destroy_indirect_buffer(&device, indirect).unwrap();
    }

    #[test]
    fn const_buffers_beyond_the_platform_limit_are_rejected() {
        let device = TestDevice::new();
        let mut m = manager(&device);
        let err = m
            .create_const_buffer(&device, 128 * 1024, BufferType::Default, None, false)
            .unwrap_err();
        assert!(matches!(err, VaoError::InvalidParams(_)));
    }

    #[test]
    fn dynamic_destruction_is_deferred_a_full_frame_ring() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let h = m
            .create_vertex_buffer(
                &device,
                &float4(),
                4,
                BufferType::DynamicDefault,
                None,
                false,
            )
            .unwrap();
        m.destroy_vertex_buffer(&device, h).unwrap();

        let pool_is_free = |m: &VaoManager| {
            let pool = &m.vbos[BufferCategory::Vertex as usize][PoolClass::Dynamic as usize][0];
            pool.free_blocks == vec![Block::new(0, pool.size_bytes)]
        };
        assert!(!pool_is_free(&m), "the region must survive the ring");

        for _ in 0..3 {
            m.update(&device).unwrap();
        }
        assert!(!pool_is_free(&m), "one slot of the ring is still pending");
        m.update(&device).unwrap();
        assert!(pool_is_free(&m));
        assert!(m.delayed_destroy.is_empty());
    }

    #[test]
    fn pool_exhaustion_surfaces_as_out_of_device_memory() {
        let device = TestDevice::new();
        let mut m = manager(&device);
        device.fail_next_create();
        let err = m
            .create_vertex_buffer(&device, &float4(), 100, BufferType::Default, None, false)
            .unwrap_err();
        match err {
            VaoError::OutOfDeviceMemory {
                requested_bytes, ..
            } => assert_eq!(requested_bytes, 64 * 1024),
            other => panic!("expected OutOfDeviceMemory, got {other:?}"),
        }
    }

    #[test]
    fn frame_fences_gate_frame_completion() {
        let device = TestDevice::with_fence_latency(2);
        let mut m = manager(&device);

        m.update(&device).unwrap();
        assert_eq!(m.frame_count(), 1);
        assert_eq!(m.dynamic_frame_slot(), 1);

        // The frame in flight reports finished by convention (full stall).
        assert!(m.is_frame_finished(&device, 1).unwrap());

        // Frame 0 sits in the ring behind a fence that needs two more polls.
        assert!(!m.is_frame_finished(&device, 0).unwrap());
        assert!(!m.is_frame_finished(&device, 0).unwrap());
        assert!(m.is_frame_finished(&device, 0).unwrap());

        // Waiting always terminates even with fence latency.
        m.update(&device).unwrap();
        m.wait_for_specific_frame_to_finish(&device, m.frame_count())
            .unwrap();
        let slot = m.wait_for_tail_frame_to_finish(&device).unwrap();
        assert_eq!(slot, m.dynamic_frame_slot());
    }

    #[test]
    fn retired_staging_buffers_are_revived_then_reclaimed() {
        let device = TestDevice::new();
        let mut config = test_config();
        config.staging_buffer_lifetime_ms = 1;
        let mut m = VaoManager::new(&device, config).unwrap();

        let staging = m.get_staging_buffer(&device, 1000, true).unwrap();
        let buffer = staging.buffer();
        m.retire_staging_buffer(staging);

        // A fitting request revives the retired buffer instead of creating
        // a new one.
        let staging = m.get_staging_buffer(&device, 4096, true).unwrap();
        assert_eq!(staging.buffer(), buffer);
        m.retire_staging_buffer(staging);

        std::thread::sleep(std::time::Duration::from_millis(5));
        m.update(&device).unwrap();
        assert!(m.zero_ref_staging.is_empty());
    }

    #[test]
    fn uploads_land_at_the_destination_buffer_location() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let data: Vec<u8> = (0u8..64).collect();
        let h = m
            .create_index_buffer(&device, IndexFormat::Uint32, 16, BufferType::Default, None, false)
            .unwrap();

        let mut staging = m.get_staging_buffer(&device, 64, true).unwrap();
        let mut region = staging.map(&device, 64).unwrap();
        region.write(0, &data);
        m.upload(
            &device,
            &mut staging,
            region,
            &[UploadDestination {
                dst: h.into(),
                dst_offset_bytes: 0,
                src_offset_bytes: 0,
                size_bytes: 64,
            }],
        )
        .unwrap();

        let record = &m.buffers[&h.0];
        let contents = device.buffer_contents(pool_buffer_of(&m, h.0));
        let offset = (record.buffer_start * 4) as usize;
        assert_eq!(&contents[offset..offset + 64], &data[..]);
        m.retire_staging_buffer(staging);
    }

    #[test]
    fn async_download_flushes_queued_immutables_and_reads_back() {
        let device = TestDevice::with_fence_latency(2);
        let mut m = manager(&device);

        let data: Vec<u8> = (0u8..64).collect();
        let h = m
            .create_vertex_buffer(
                &device,
                &float4(),
                4,
                BufferType::Immutable,
                Some(&data),
                true,
            )
            .unwrap();

        let mut staging = m.get_staging_buffer(&device, 4096, false).unwrap();
        let mut ticket = m.create_async_ticket(&device, h, &mut staging, 0, 4).unwrap();

        let region = ticket.map(&device, &mut staging).unwrap();
        assert_eq!(region.to_vec(), data);
        ticket.unmap(&device, &mut staging, region).unwrap();

        assert_eq!(m.shadow_copy(h).unwrap().as_ref(), &data[..]);
        m.retire_staging_buffer(staging);
    }

    #[test]
    fn destroy_releases_every_device_resource() {
        let device = TestDevice::new();
        let mut m = manager(&device);

        let _vb = m
            .create_vertex_buffer(&device, &float3(), 8, BufferType::DynamicDefault, None, false)
            .unwrap();
        let _cb = m
            .create_const_buffer(&device, 256, BufferType::DynamicDefault, None, false)
            .unwrap();
        let staging = m.get_staging_buffer(&device, 4096, true).unwrap();
        m.retire_staging_buffer(staging);
        m.update(&device).unwrap();

        m.destroy(&device);
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(device.live_fence_count(), 0);
    }
}
