// Copyright 2025 eraflo
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

//! The pool-based GPU buffer allocator.

use super::arena::{Arena, ArenaIndex};
use super::block::StrideChangerList;
use super::buffer::{
    pool_usage, BufferBinding, BufferHandle, BufferInfo, BufferKind, BufferPacked,
    MappingState, Placement,
};
use super::frame_fence::FrameFenceRing;
use super::immutable::{plan_batches, PendingEntry, PendingQueues};
use super::pool::{PoolKey, PoolSet};
use super::staging::StagingPool;
use super::stats::MemoryStats;
use super::vao_cache::{IndexBinding, VaoCache, VaoKey, VaoSlot, VertexBinding};
use khora_core::renderer::api::{align_to_next, lcm, vertex_stride};
use khora_core::renderer::{
    BufferDescriptor, BufferDevice, BufferDeviceLimits, BufferId, BufferManagerSettings,
    BufferType, IndexFormat, InternalBufferType, PoolCategory, PrimitiveTopology,
    ResourceError, VertexAttributeDescriptor, VertexFormat, VertexStepMode,
};
use khora_core::Stopwatch;
use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Alignment of indirect draw arguments.
const INDIRECT_BUFFER_ALIGNMENT: u64 = 4;

/// A handle to a vertex array object owned by a [`GpuBufferManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VaoHandle(pub(crate) ArenaIndex);

/// One vertex buffer of a vertex array object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferInput {
    /// The vertex buffer.
    pub buffer: BufferHandle,
    /// Whether the buffer advances per vertex or per instance.
    pub step_mode: VertexStepMode,
    /// Instances drawn per element for per-instance buffers.
    pub instancing_divisor: u32,
}

impl VertexBufferInput {
    /// A buffer read once per vertex.
    pub fn per_vertex(buffer: BufferHandle) -> Self {
        Self {
            buffer,
            step_mode: VertexStepMode::Vertex,
            instancing_divisor: 0,
        }
    }

    /// A buffer read once every `divisor` instances.
    pub fn per_instance(buffer: BufferHandle, divisor: u32) -> Self {
        Self {
            buffer,
            step_mode: VertexStepMode::Instance,
            instancing_divisor: divisor,
        }
    }
}

/// Derives the render-queue sort key of a VAO.
pub fn render_queue_id(vao_name: u32, unique_id: u32) -> u32 {
    ((vao_name & 0x1F) << 14) | (unique_id & 0x3FFF)
}

#[derive(Debug, Clone)]
pub(super) struct VertexArrayObject {
    pub inputs: Vec<VertexBufferInput>,
    pub index_buffer: Option<BufferHandle>,
    pub topology: PrimitiveTopology,
    /// `None` while any referenced buffer has no device buffer yet.
    pub slot: Option<VaoSlot>,
    pub vao_name: u32,
    pub unique_id: u32,
    pub render_queue_id: u32,
}

impl VertexArrayObject {
    fn references_any(&self, buffers: &HashSet<BufferHandle>) -> bool {
        self.inputs.iter().any(|i| buffers.contains(&i.buffer))
            || self.index_buffer.is_some_and(|h| buffers.contains(&h))
    }
}

/// The range of a destroyed dynamic buffer, freed once the GPU is done with it.
#[derive(Debug, Clone, Copy)]
pub(super) struct DelayedBuffer {
    pub key: PoolKey,
    pub pool_index: usize,
    pub offset: u64,
    pub reserved_bytes: u64,
    pub frame: u32,
    pub slot: u8,
}

struct BufferRequest {
    kind: BufferKind,
    buffer_type: BufferType,
    num_elements: u64,
    bytes_per_element: u64,
    alignment: u64,
}

pub(super) fn pool_descriptor(key: PoolKey, size: u64) -> BufferDescriptor<'static> {
    BufferDescriptor::new(format!("{} pool", key.name()), size, pool_usage(key.internal))
}

/// Sub-allocates logical GPU buffers out of a few large device buffers.
///
/// Requests are served from per-bucket pools, one bucket per internal buffer type and
/// pool category. Immutable buffers are queued and realized in batches by
/// [`flush_pending`](Self::flush_pending). Dynamic buffers reserve one slice per frame in
/// flight, and reuse of a slice is gated by the frame fences advanced in
/// [`update`](Self::update).
///
/// The manager is driven from a single thread; every mutating call takes `&mut self`.
#[derive(Debug)]
pub struct GpuBufferManager {
    pub(super) device: Arc<dyn BufferDevice>,
    pub(super) settings: BufferManagerSettings,
    pub(super) limits: BufferDeviceLimits,
    pub(super) multiplier: u8,
    pub(super) pools: PoolSet,
    pub(super) buffers: Arena<BufferPacked>,
    pub(super) pending: PendingQueues,
    pub(super) vao_cache: VaoCache,
    pub(super) vaos: Arena<VertexArrayObject>,
    pub(super) next_vao_unique_id: u32,
    pub(super) fences: FrameFenceRing,
    pub(super) delayed_destroy: VecDeque<DelayedBuffer>,
    pub(super) staging: StagingPool,
    pub(super) timer: Stopwatch,
    pub(super) draw_id: Option<BufferHandle>,
    pub(super) device_lost: bool,
}

impl GpuBufferManager {
    /// Creates a manager on top of `device`.
    ///
    /// Device limits are queried once here. When
    /// [`draw_id_instance_count`](BufferManagerSettings::draw_id_instance_count) is not
    /// zero, the draw-id vertex buffer is created and realized immediately.
    ///
    /// ## Errors
    ///
    /// Returns the device error if the draw-id buffer cannot be created.
    pub fn new(
        device: Arc<dyn BufferDevice>,
        settings: BufferManagerSettings,
    ) -> Result<Self, ResourceError> {
        let limits = device.limits();
        let multiplier = settings.effective_multiplier();
        let mut manager = Self {
            device,
            limits,
            multiplier,
            pools: PoolSet::new(),
            buffers: Arena::new(),
            pending: PendingQueues::default(),
            vao_cache: VaoCache::new(),
            vaos: Arena::new(),
            next_vao_unique_id: 0,
            fences: FrameFenceRing::new(multiplier),
            delayed_destroy: VecDeque::new(),
            staging: StagingPool::new(
                settings.staging_buffer_lifetime_ms,
                align_to_next(
                    settings.min_staging_buffer_size,
                    limits.copy_alignment.max(1),
                ),
            ),
            timer: Stopwatch::new(),
            draw_id: None,
            device_lost: false,
            settings,
        };

        if manager.settings.draw_id_instance_count > 0 {
            manager.create_draw_id_buffer()?;
        }
        log::info!(
            "GPU buffer manager ready with {} frames in flight",
            manager.multiplier
        );
        Ok(manager)
    }

    fn create_draw_id_buffer(&mut self) -> Result<(), ResourceError> {
        let ids: Vec<u32> = (0..self.settings.draw_id_instance_count).collect();
        let handle = self.create_vertex_buffer(
            &[VertexAttributeDescriptor::new(0, VertexFormat::Uint32, 0)],
            ids.len() as u64,
            BufferType::Immutable,
            Some(bytemuck::cast_slice(&ids)),
            true,
        )?;
        self.flush_pending()?;
        self.draw_id = Some(handle);
        Ok(())
    }

    /// The device this manager allocates from.
    pub fn device(&self) -> &Arc<dyn BufferDevice> {
        &self.device
    }

    /// The settings the manager was created with.
    pub fn settings(&self) -> &BufferManagerSettings {
        &self.settings
    }

    /// The device limits queried at construction.
    pub fn limits(&self) -> &BufferDeviceLimits {
        &self.limits
    }

    /// Number of frames in flight (N).
    pub fn dynamic_buffer_multiplier(&self) -> u8 {
        self.multiplier
    }

    /// The per-instance draw-id vertex buffer, holding `0..draw_id_instance_count`.
    pub fn draw_id_buffer(&self) -> Option<BufferHandle> {
        self.draw_id
    }

    /// Number of immutable buffers waiting for the next flush.
    pub fn pending_immutable_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of live pools in a bucket.
    pub fn pool_count(&self, key: PoolKey) -> usize {
        self.pools.bucket(key).iter().filter(|p| !p.released).count()
    }

    /// Returns `true` between [`on_device_lost`](Self::on_device_lost) and a successful
    /// [`on_device_restored`](Self::on_device_restored).
    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    pub(super) fn ensure_device(&self) -> Result<(), ResourceError> {
        if self.device_lost {
            Err(ResourceError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Granularity of every offset and size handed to the device for a transfer.
    pub(super) fn copy_alignment(&self) -> u64 {
        self.limits.copy_alignment.max(1)
    }

    pub(super) fn packed(&self, handle: BufferHandle) -> Result<&BufferPacked, ResourceError> {
        self.buffers
            .get(handle.0)
            .ok_or(ResourceError::InvalidHandle)
    }

    fn packed_mut(&mut self, handle: BufferHandle) -> Result<&mut BufferPacked, ResourceError> {
        self.buffers
            .get_mut(handle.0)
            .ok_or(ResourceError::InvalidHandle)
    }

    // --- Creation ---

    /// Creates a vertex buffer of `num_vertices` elements laid out as `attributes`.
    ///
    /// The element stride is the end of the furthest attribute. Immutable buffers are
    /// only queued; they get a device buffer at the next flush.
    ///
    /// ## Errors
    ///
    /// * `InvalidArgument` for an empty layout, a zero-sized buffer or too little data.
    /// * `MissingInitialData` for an immutable buffer without data.
    /// * The device error if a new pool cannot be created.
    pub fn create_vertex_buffer(
        &mut self,
        attributes: &[VertexAttributeDescriptor],
        num_vertices: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<BufferHandle, ResourceError> {
        let stride = vertex_stride(attributes);
        if stride == 0 {
            return Err(ResourceError::InvalidArgument(
                "vertex buffer without attributes".to_string(),
            ));
        }
        self.create_buffer(
            BufferRequest {
                kind: BufferKind::Vertex {
                    attributes: attributes.to_vec(),
                },
                buffer_type,
                num_elements: num_vertices,
                bytes_per_element: stride,
                alignment: stride,
            },
            initial_data,
            keep_shadow_copy,
        )
    }

    /// Creates an index buffer of `num_indices` indices of `format`.
    pub fn create_index_buffer(
        &mut self,
        format: IndexFormat,
        num_indices: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<BufferHandle, ResourceError> {
        self.create_buffer(
            BufferRequest {
                kind: BufferKind::Index(format),
                buffer_type,
                num_elements: num_indices,
                bytes_per_element: format.size(),
                alignment: format.size(),
            },
            initial_data,
            keep_shadow_copy,
        )
    }

    /// Creates a constant (uniform) buffer of `size_bytes`.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` above the device's constant buffer size limit.
    pub fn create_const_buffer(
        &mut self,
        size_bytes: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<BufferHandle, ResourceError> {
        check_max_size("constant", size_bytes, self.limits.const_buffer_max_size)?;
        self.create_buffer(
            byte_request(BufferKind::Const, buffer_type, size_bytes, self.limits.const_buffer_alignment),
            initial_data,
            keep_shadow_copy,
        )
    }

    /// Creates a texture buffer of `size_bytes`.
    pub fn create_tex_buffer(
        &mut self,
        size_bytes: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<BufferHandle, ResourceError> {
        check_max_size("texture", size_bytes, self.limits.tex_buffer_max_size)?;
        self.create_buffer(
            byte_request(BufferKind::Tex, buffer_type, size_bytes, self.limits.tex_buffer_alignment),
            initial_data,
            keep_shadow_copy,
        )
    }

    /// Creates a structured (UAV) buffer of `num_elements` elements.
    ///
    /// UAV buffers are always [`BufferType::Default`]. Their offset is aligned to both the
    /// device alignment and the element stride.
    pub fn create_uav_buffer(
        &mut self,
        num_elements: u64,
        bytes_per_element: u64,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<BufferHandle, ResourceError> {
        check_max_size(
            "UAV",
            checked_size(num_elements, bytes_per_element)?,
            self.limits.uav_buffer_max_size,
        )?;
        self.create_buffer(
            BufferRequest {
                kind: BufferKind::Uav,
                buffer_type: BufferType::Default,
                num_elements,
                bytes_per_element,
                alignment: lcm(self.limits.uav_buffer_alignment, bytes_per_element),
            },
            initial_data,
            keep_shadow_copy,
        )
    }

    /// Creates an indirect draw argument buffer of `size_bytes`.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if the device cannot consume indirect buffers.
    pub fn create_indirect_buffer(
        &mut self,
        size_bytes: u64,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<BufferHandle, ResourceError> {
        if !self.limits.supports_indirect_buffers {
            return Err(ResourceError::InvalidArgument(
                "the device does not support indirect buffers".to_string(),
            ));
        }
        self.create_buffer(
            byte_request(BufferKind::Indirect, buffer_type, size_bytes, INDIRECT_BUFFER_ALIGNMENT),
            initial_data,
            keep_shadow_copy,
        )
    }

    fn create_buffer(
        &mut self,
        request: BufferRequest,
        initial_data: Option<&[u8]>,
        keep_shadow_copy: bool,
    ) -> Result<BufferHandle, ResourceError> {
        self.ensure_device()?;
        let size_bytes = checked_size(request.num_elements, request.bytes_per_element)?;
        if size_bytes == 0 {
            return Err(ResourceError::InvalidArgument(
                "zero-sized buffer".to_string(),
            ));
        }
        let data = match initial_data {
            Some(data) if (data.len() as u64) < size_bytes => {
                return Err(ResourceError::InvalidArgument(format!(
                    "initial data holds {} bytes, {size_bytes} needed",
                    data.len()
                )));
            }
            Some(data) => Some(&data[..size_bytes as usize]),
            None => None,
        };
        let shadow = keep_shadow_copy
            .then(|| data.map_or_else(|| vec![0; size_bytes as usize], <[u8]>::to_vec));
        let internal = request.kind.internal_type();
        let copy_alignment = self.copy_alignment();
        let alignment = lcm(request.alignment, copy_alignment);

        if request.buffer_type == BufferType::Immutable {
            let data = data.ok_or(ResourceError::MissingInitialData)?;
            let handle = BufferHandle(self.buffers.insert(BufferPacked {
                kind: request.kind,
                buffer_type: request.buffer_type,
                num_elements: request.num_elements,
                bytes_per_element: request.bytes_per_element,
                alignment,
                slice_bytes: checked_align(size_bytes, copy_alignment)?,
                placement: Placement::Pending,
                initial_data: Some(data.to_vec()),
                shadow,
                mapping: MappingState::Unmapped,
                active_slot: 0,
            }));
            self.pending.push(internal, handle);
            return Ok(handle);
        }

        let dynamic = request.buffer_type.is_dynamic();
        let copies = if dynamic { u64::from(self.multiplier) } else { 1 };
        let slice_bytes = checked_align(size_bytes, if dynamic { alignment } else { copy_alignment })?;
        let reserved_bytes = checked_size(copies, slice_bytes)?;
        let upload = data
            .map(|data| widen_write(0, data, size_bytes, None, copy_alignment))
            .transpose()?;
        let key = PoolKey::new(internal, request.buffer_type.pool_category());
        let default_pool_size = align_to_next(
            self.settings.pool_sizes.get(internal, key.category),
            copy_alignment,
        );

        let device = &self.device;
        let allocation = self.pools.allocate(
            key,
            reserved_bytes,
            alignment,
            default_pool_size,
            |size| device.create_buffer(&pool_descriptor(key, size)),
        )?;

        if let Some((_, bytes)) = upload {
            let buffer = self
                .pools
                .pool(key, allocation.pool_index)
                .and_then(|p| p.buffer);
            if let Some(buffer) = buffer {
                for slot in 0..copies {
                    let offset = allocation.offset + slot * slice_bytes;
                    if let Err(e) = self.device.write_buffer(buffer, offset, &bytes) {
                        if let Err(release) = self.release_range(
                            key,
                            allocation.pool_index,
                            allocation.offset,
                            reserved_bytes,
                        ) {
                            log::error!(
                                "Failed to free a {} buffer after a failed upload: {release}",
                                key.name()
                            );
                        }
                        return Err(e);
                    }
                }
            }
        }

        Ok(BufferHandle(self.buffers.insert(BufferPacked {
            kind: request.kind,
            buffer_type: request.buffer_type,
            num_elements: request.num_elements,
            bytes_per_element: request.bytes_per_element,
            alignment,
            slice_bytes,
            placement: Placement::Realized {
                pool_index: allocation.pool_index,
                offset: allocation.offset,
            },
            initial_data: None,
            shadow,
            mapping: MappingState::Unmapped,
            active_slot: 0,
        })))
    }

    /// Destroys a logical buffer.
    ///
    /// A buffer still waiting for its flush is simply dequeued. The range of a dynamic
    /// buffer is only freed once every frame that may read it has finished on the GPU.
    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Result<(), ResourceError> {
        let packed = self
            .buffers
            .remove(handle.0)
            .ok_or(ResourceError::InvalidHandle)?;
        let key = packed.key();

        if let MappingState::Mapped { pool_offset } = packed.mapping {
            log::warn!("Destroying a {} buffer that is still mapped", key.name());
            if let Some((pool_index, _)) = packed.realized() {
                if let Some(ring) = self
                    .pools
                    .pool_mut(key, pool_index)
                    .and_then(|p| p.dynamic_ring.as_mut())
                {
                    ring.unmap(pool_offset);
                }
            }
        }

        let Some((pool_index, offset)) = packed.realized() else {
            self.pending.remove(key.internal, handle);
            return Ok(());
        };
        let reserved_bytes = packed.reserved_bytes(self.multiplier);

        if packed.buffer_type.is_dynamic() && !self.device_lost {
            self.delayed_destroy.push_back(DelayedBuffer {
                key,
                pool_index,
                offset,
                reserved_bytes,
                frame: self.fences.frame_count(),
                slot: self.fences.current_slot(),
            });
            return Ok(());
        }
        self.release_range(key, pool_index, offset, reserved_bytes)
    }

    /// Frees a range, destroying the device buffers of pools it empties.
    pub(super) fn release_range(
        &mut self,
        key: PoolKey,
        pool_index: usize,
        offset: u64,
        size: u64,
    ) -> Result<(), ResourceError> {
        for buffer in self.pools.deallocate(key, pool_index, offset, size)? {
            log::debug!("Releasing empty {} pool buffer {buffer:?}", key.name());
            if let Err(e) = self.device.destroy_buffer(buffer) {
                log::error!("Failed to destroy pool buffer {buffer:?}: {e}");
            }
        }
        Ok(())
    }

    // --- Data access ---

    fn pool_buffer(&self, key: PoolKey, pool_index: usize) -> Result<BufferId, ResourceError> {
        self.pools
            .pool(key, pool_index)
            .ok_or(ResourceError::InvalidHandle)?
            .buffer
            .ok_or(ResourceError::DeviceLost)
    }

    /// Writes `data` into a default or shared-default buffer, starting at element
    /// `elem_start`. The shadow copy, if any, is kept in sync.
    ///
    /// A range that does not start and end on the device's copy alignment is widened with
    /// the neighbouring bytes of the shadow copy.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` for such a range when the buffer keeps no shadow copy.
    pub fn upload(
        &mut self,
        handle: BufferHandle,
        elem_start: u64,
        data: &[u8],
    ) -> Result<(), ResourceError> {
        self.ensure_device()?;
        let packed = self.packed(handle)?;
        if !matches!(
            packed.buffer_type,
            BufferType::Default | BufferType::DefaultShared
        ) {
            return Err(ResourceError::InvalidArgument(format!(
                "{:?} buffers cannot be uploaded to",
                packed.buffer_type
            )));
        }
        let start = checked_size(elem_start, packed.bytes_per_element)?;
        let end = start
            .checked_add(data.len() as u64)
            .filter(|&end| end <= packed.size_bytes())
            .ok_or(ResourceError::OutOfBounds)?;
        let (pool_index, offset) = packed.realized().ok_or(ResourceError::InvalidHandle)?;
        let buffer = self.pool_buffer(packed.key(), pool_index)?;
        let (write_start, bytes) = widen_write(
            start,
            data,
            packed.size_bytes(),
            packed.shadow.as_deref(),
            self.copy_alignment(),
        )?;
        self.device.write_buffer(buffer, offset + write_start, &bytes)?;

        if let Some(shadow) = self.packed_mut(handle)?.shadow.as_mut() {
            shadow[start as usize..end as usize].copy_from_slice(data);
        }
        Ok(())
    }

    /// Maps `elem_count` elements of a dynamic buffer for writing this frame.
    ///
    /// Waits until the GPU is done with the current ring slot first. The returned bytes
    /// are seeded from the shadow copy when there is one and reach the device on
    /// [`unmap`](Self::unmap).
    ///
    /// ## Errors
    ///
    /// * `InvalidArgument` for a non-dynamic buffer, one that is already mapped, or a range
    ///   off the device's copy alignment on a buffer without a shadow copy.
    /// * `OutOfBounds` past the last element.
    pub fn map(
        &mut self,
        handle: BufferHandle,
        elem_start: u64,
        elem_count: u64,
    ) -> Result<&mut [u8], ResourceError> {
        self.ensure_device()?;
        let packed = self.packed(handle)?;
        if !packed.buffer_type.is_dynamic() {
            return Err(ResourceError::InvalidArgument(
                "only dynamic buffers can be mapped".to_string(),
            ));
        }
        if packed.mapping != MappingState::Unmapped {
            return Err(ResourceError::InvalidArgument(
                "buffer is already mapped".to_string(),
            ));
        }
        if !matches!(elem_start.checked_add(elem_count), Some(end) if end <= packed.num_elements) {
            return Err(ResourceError::OutOfBounds);
        }
        let (pool_index, offset) = packed.realized().ok_or(ResourceError::InvalidHandle)?;
        let key = packed.key();
        let slice_bytes = packed.slice_bytes;
        let start = elem_start * packed.bytes_per_element;
        let len = elem_count * packed.bytes_per_element;
        if packed.shadow.is_none()
            && needs_neighbours(start, start + len, packed.size_bytes(), self.copy_alignment())
        {
            return Err(ResourceError::InvalidArgument(format!(
                "mapping bytes {start}..{} needs a shadow copy to fill the rest of the aligned range",
                start + len
            )));
        }
        let initial = match &packed.shadow {
            Some(shadow) => shadow[start as usize..(start + len) as usize].to_vec(),
            None => vec![0; len as usize],
        };

        let slot = self.wait_for_tail_frame_to_finish()?;
        let pool_offset = offset + u64::from(slot) * slice_bytes + start;

        let Self { pools, buffers, .. } = self;
        let ring = pools
            .pool_mut(key, pool_index)
            .and_then(|p| p.dynamic_ring.as_mut())
            .ok_or(ResourceError::InvalidHandle)?;
        let bytes = ring.map(pool_offset, initial)?;
        if let Some(packed) = buffers.get_mut(handle.0) {
            packed.mapping = MappingState::Mapped { pool_offset };
            packed.active_slot = slot;
        }
        Ok(bytes)
    }

    /// Ends a mapping and flushes the written bytes to the device.
    pub fn unmap(&mut self, handle: BufferHandle) -> Result<(), ResourceError> {
        let packed = self.packed(handle)?;
        let MappingState::Mapped { pool_offset } = packed.mapping else {
            return Err(ResourceError::InvalidArgument(
                "buffer is not mapped".to_string(),
            ));
        };
        let (pool_index, offset) = packed.realized().ok_or(ResourceError::InvalidHandle)?;
        let key = packed.key();
        let slot_start = offset + u64::from(packed.active_slot) * packed.slice_bytes;

        let pool = self
            .pools
            .pool_mut(key, pool_index)
            .ok_or(ResourceError::InvalidHandle)?;
        let region = pool
            .dynamic_ring
            .as_mut()
            .and_then(|ring| ring.unmap(pool_offset))
            .ok_or(ResourceError::InvalidHandle)?;
        let buffer = pool.buffer;
        let copy_alignment = self.copy_alignment();

        let packed = self.packed_mut(handle)?;
        packed.mapping = MappingState::Unmapped;
        let start = pool_offset - slot_start;
        if let Some(shadow) = packed.shadow.as_mut() {
            shadow[start as usize..][..region.data.len()].copy_from_slice(&region.data);
        }
        let (write_start, bytes) = widen_write(
            start,
            &region.data,
            packed.size_bytes(),
            packed.shadow.as_deref(),
            copy_alignment,
        )?;

        match buffer {
            Some(buffer) => self
                .device
                .write_buffer(buffer, slot_start + write_start, &bytes),
            None => Err(ResourceError::DeviceLost),
        }
    }

    /// The device buffer and byte range a draw call should bind this frame.
    ///
    /// For dynamic buffers the range is the slice written most recently. A buffer still
    /// waiting for its flush has no device buffer.
    pub fn current_binding(&self, handle: BufferHandle) -> Result<BufferBinding, ResourceError> {
        let packed = self.packed(handle)?;
        let size = packed.size_bytes();
        let Some((pool_index, offset)) = packed.realized() else {
            return Ok(BufferBinding {
                buffer: None,
                offset: 0,
                size,
            });
        };
        let slot_offset = if packed.buffer_type.is_dynamic() {
            u64::from(packed.active_slot) * packed.slice_bytes
        } else {
            0
        };
        Ok(BufferBinding {
            buffer: self
                .pools
                .pool(packed.key(), pool_index)
                .and_then(|p| p.buffer),
            offset: offset + slot_offset,
            size,
        })
    }

    /// The CPU copy of a buffer created with `keep_shadow_copy`.
    pub fn shadow_copy(&self, handle: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(handle.0)?.shadow.as_deref()
    }

    /// Copies `src_elem_count` elements of `src` into `dst` on the GPU.
    ///
    /// Pending immutable buffers are flushed first. When either side is a UAV buffer the
    /// copied length must be a whole number of elements of both.
    ///
    /// Both starts and the length must sit on the device's copy alignment. A length that
    /// does not is still accepted when the copy runs to the end of both buffers, since the
    /// tail up to the alignment is padding on either side.
    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        dst: BufferHandle,
        dst_elem_start: u64,
        src_elem_start: u64,
        src_elem_count: u64,
    ) -> Result<(), ResourceError> {
        self.ensure_device()?;
        if self.packed(src)?.is_pending() || self.packed(dst)?.is_pending() {
            self.force_flush("a buffer copy")?;
        }

        let source = self.packed(src)?;
        let destination = self.packed(dst)?;
        if destination.buffer_type == BufferType::Immutable {
            return Err(ResourceError::InvalidArgument(
                "immutable buffers cannot be copied into".to_string(),
            ));
        }
        let length = src_elem_count * source.bytes_per_element;
        let src_start = src_elem_start * source.bytes_per_element;
        let dst_start = dst_elem_start * destination.bytes_per_element;
        if src_start + length > source.size_bytes() || dst_start + length > destination.size_bytes()
        {
            return Err(ResourceError::OutOfBounds);
        }
        let involves_uav =
            source.kind == BufferKind::Uav || destination.kind == BufferKind::Uav;
        if involves_uav && length % destination.bytes_per_element != 0 {
            debug_assert!(
                false,
                "UAV copy of {length} bytes is not a multiple of the {} byte stride",
                destination.bytes_per_element
            );
            return Err(ResourceError::InvalidArgument(format!(
                "copy of {length} bytes is not a multiple of the destination stride"
            )));
        }

        let copy_alignment = self.copy_alignment();
        let reaches_both_ends =
            src_start + length == source.size_bytes() && dst_start + length == destination.size_bytes();
        let copy_length = if reaches_both_ends {
            align_to_next(length, copy_alignment)
        } else {
            length
        };
        if src_start % copy_alignment != 0
            || dst_start % copy_alignment != 0
            || copy_length % copy_alignment != 0
        {
            return Err(ResourceError::InvalidArgument(format!(
                "copy of {length} bytes from {src_start} to {dst_start} is not {copy_alignment}-byte aligned"
            )));
        }

        let src_binding = self.current_binding(src)?;
        let dst_binding = self.current_binding(dst)?;
        self.device.copy_buffer_to_buffer(
            src_binding.buffer.ok_or(ResourceError::DeviceLost)?,
            src_binding.offset + src_start,
            dst_binding.buffer.ok_or(ResourceError::DeviceLost)?,
            dst_binding.offset + dst_start,
            copy_length,
        )?;

        let copied = self
            .shadow_copy(src)
            .map(|s| s[src_start as usize..(src_start + length) as usize].to_vec());
        if let Some(shadow) = self.packed_mut(dst)?.shadow.as_mut() {
            match copied {
                Some(bytes) => shadow[dst_start as usize..][..bytes.len()].copy_from_slice(&bytes),
                None => log::debug!("Shadow copy left stale by a GPU copy from an unshadowed buffer"),
            }
        }
        Ok(())
    }

    /// Describes a live buffer.
    pub fn buffer_info(&self, handle: BufferHandle) -> Result<BufferInfo, ResourceError> {
        let packed = self.packed(handle)?;
        let realized = packed.realized();
        Ok(BufferInfo {
            kind: packed.kind.clone(),
            buffer_type: packed.buffer_type,
            num_elements: packed.num_elements,
            bytes_per_element: packed.bytes_per_element,
            pool_key: packed.key(),
            pool_index: realized.map(|(index, _)| index),
            offset: realized.map(|(_, offset)| offset),
            reserved_bytes: packed.reserved_bytes(self.multiplier),
            mapping: packed.mapping,
        })
    }

    // --- Immutable batching ---

    /// Realizes every queued immutable buffer.
    ///
    /// Each internal type's queue is cut into batches no larger than that type's
    /// immutable pool size; every batch becomes one device buffer created with its
    /// merged data. VAOs referencing realized buffers are re-resolved afterwards.
    ///
    /// ## Errors
    ///
    /// If a device buffer cannot be created, the buffers of that batch and of every later
    /// batch stay queued and the error is returned.
    pub fn flush_pending(&mut self) -> Result<(), ResourceError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ensure_device()?;

        let mut realized = HashSet::new();
        let mut result = Ok(());
        for internal in InternalBufferType::ALL {
            if let Err(e) = self.flush_queue(internal, &mut realized) {
                result = Err(e);
                break;
            }
        }
        self.rebind_vaos(|vao| vao.references_any(&realized));
        result
    }

    fn flush_queue(
        &mut self,
        internal: InternalBufferType,
        realized: &mut HashSet<BufferHandle>,
    ) -> Result<(), ResourceError> {
        let queue = self.pending.take(internal);
        if queue.is_empty() {
            return Ok(());
        }
        let entries: Vec<PendingEntry> = queue
            .iter()
            .filter_map(|&handle| {
                self.buffers.get(handle.0).map(|p| PendingEntry {
                    handle,
                    alignment: p.alignment,
                    size: p.slice_bytes,
                })
            })
            .collect();

        let key = PoolKey::new(internal, PoolCategory::Immutable);
        let max_pool_size = self.settings.pool_sizes.get(internal, PoolCategory::Immutable);
        let batches = plan_batches(&entries, max_pool_size);

        for (i, batch) in batches.iter().enumerate() {
            let buffers = &self.buffers;
            let merged = batch.merge(|h| buffers.get(h.0).and_then(|p| p.initial_data.as_deref()));
            let buffer = match self
                .device
                .create_buffer_with_data(&pool_descriptor(key, batch.size_bytes), &merged)
            {
                Ok(buffer) => buffer,
                Err(e) => {
                    for remaining in &batches[i..] {
                        for slot in &remaining.slots {
                            self.pending.push(internal, slot.handle);
                        }
                    }
                    return Err(e);
                }
            };

            let pool_index = self.pools.push_full(
                key,
                buffer,
                batch.size_bytes,
                StrideChangerList::from_unsorted(batch.stride_changers.clone()),
            );
            for slot in &batch.slots {
                if let Some(packed) = self.buffers.get_mut(slot.handle.0) {
                    packed.placement = Placement::Realized {
                        pool_index,
                        offset: slot.offset,
                    };
                    packed.initial_data = None;
                    realized.insert(slot.handle);
                }
            }
            log::debug!(
                "Realized {} immutable buffers into {} pool #{pool_index} ({} bytes)",
                batch.slots.len(),
                key.name(),
                batch.size_bytes
            );
        }
        Ok(())
    }

    /// Flushes ahead of the frame boundary because `reason` needs realized buffers.
    pub(super) fn force_flush(&mut self, reason: &str) -> Result<(), ResourceError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        log::warn!(
            "Flushing {} pending immutable buffers early for {reason}; buffers created later this frame will not share their pools",
            self.pending.len()
        );
        self.flush_pending()
    }

    // --- Vertex array objects ---

    /// Creates a VAO binding `vertex_buffers` and an optional index buffer.
    ///
    /// Identical binding combinations share one cache entry. While a referenced buffer is
    /// still waiting for its flush the VAO is a placeholder named 0; it is re-resolved
    /// when the flush realizes the buffer.
    pub fn create_vertex_array_object(
        &mut self,
        vertex_buffers: &[VertexBufferInput],
        index_buffer: Option<BufferHandle>,
        topology: PrimitiveTopology,
    ) -> Result<VaoHandle, ResourceError> {
        if vertex_buffers.is_empty() {
            return Err(ResourceError::InvalidArgument(
                "a VAO needs at least one vertex buffer".to_string(),
            ));
        }
        let mut record = VertexArrayObject {
            inputs: vertex_buffers.to_vec(),
            index_buffer,
            topology,
            slot: None,
            vao_name: 0,
            unique_id: self.next_vao_unique_id,
            render_queue_id: 0,
        };
        self.bind_vao(&mut record)?;
        self.next_vao_unique_id = self.next_vao_unique_id.wrapping_add(1);
        Ok(VaoHandle(self.vaos.insert(record)))
    }

    /// Destroys a VAO, dropping its reference on the shared cache entry.
    pub fn destroy_vertex_array_object(&mut self, handle: VaoHandle) -> Result<(), ResourceError> {
        let record = self
            .vaos
            .remove(handle.0)
            .ok_or(ResourceError::InvalidHandle)?;
        if let Some(slot) = record.slot {
            self.vao_cache.release(slot);
        }
        Ok(())
    }

    /// The cache name of a VAO, 0 while it is a placeholder.
    pub fn vao_name(&self, handle: VaoHandle) -> Option<u32> {
        self.vaos.get(handle.0).map(|v| v.vao_name)
    }

    /// The render-queue sort key of a VAO.
    pub fn vao_render_queue_id(&self, handle: VaoHandle) -> Option<u32> {
        self.vaos.get(handle.0).map(|v| v.render_queue_id)
    }

    /// The shared VAO cache.
    pub fn vao_cache(&self) -> &VaoCache {
        &self.vao_cache
    }

    fn vao_key(&self, record: &VertexArrayObject) -> Result<Option<VaoKey>, ResourceError> {
        let mut vertex = Vec::with_capacity(record.inputs.len());
        for input in &record.inputs {
            let packed = self.packed(input.buffer)?;
            let BufferKind::Vertex { attributes } = &packed.kind else {
                return Err(ResourceError::InvalidArgument(
                    "VAO vertex input is not a vertex buffer".to_string(),
                ));
            };
            let Some(buffer) = self.current_binding(input.buffer)?.buffer else {
                return Ok(None);
            };
            vertex.push(VertexBinding {
                buffer,
                attributes: attributes.clone(),
                stride: packed.bytes_per_element,
                step_mode: input.step_mode,
                instancing_divisor: input.instancing_divisor,
            });
        }

        let index = match record.index_buffer {
            None => None,
            Some(handle) => {
                let BufferKind::Index(format) = self.packed(handle)?.kind else {
                    return Err(ResourceError::InvalidArgument(
                        "VAO index input is not an index buffer".to_string(),
                    ));
                };
                let Some(buffer) = self.current_binding(handle)?.buffer else {
                    return Ok(None);
                };
                Some(IndexBinding { buffer, format })
            }
        };

        Ok(Some(VaoKey {
            topology: record.topology,
            index,
            vertex,
        }))
    }

    /// Points `record` at the cache entry matching its buffers' current device buffers.
    ///
    /// An entry whose combination did not change is kept as is, so its name is stable.
    fn bind_vao(&mut self, record: &mut VertexArrayObject) -> Result<(), ResourceError> {
        let key = self.vao_key(record)?;
        if let (Some(old), Some(key)) = (record.slot, key.as_ref()) {
            if self.vao_cache.key(old) == Some(key) {
                return Ok(());
            }
        }

        let (slot, vao_name) = match key {
            Some(key) => {
                let lease = self.vao_cache.lease(key);
                let vao_name = lease.vao_name();
                (lease.keep(), vao_name)
            }
            None => (None, 0),
        };
        if let Some(old) = record.slot.take() {
            self.vao_cache.release(old);
        }
        record.slot = slot;
        record.vao_name = vao_name;
        record.render_queue_id = render_queue_id(vao_name, record.unique_id);
        Ok(())
    }

    /// Re-resolves every VAO matching `filter`, keeping its unique id.
    pub(super) fn rebind_vaos(&mut self, filter: impl Fn(&VertexArrayObject) -> bool) {
        let targets: Vec<ArenaIndex> = self
            .vaos
            .iter()
            .filter(|(_, vao)| filter(vao))
            .map(|(index, _)| index)
            .collect();
        for index in targets {
            let Some(mut record) = self.vaos.get(index).cloned() else {
                continue;
            };
            if let Err(e) = self.bind_vao(&mut record) {
                log::warn!("Could not re-resolve VAO #{}: {e}", record.unique_id);
                continue;
            }
            if let Some(vao) = self.vaos.get_mut(index) {
                *vao = record;
            }
        }
    }

    // --- Maintenance ---

    /// Removes every fully free pool and returns how many were removed.
    ///
    /// Buffers living in a bucket's last pool are moved to the index of the removed one.
    pub fn cleanup_empty_pools(&mut self) -> usize {
        let Self {
            device,
            pools,
            buffers,
            delayed_destroy,
            ..
        } = self;
        pools.cleanup_empty(
            |key, from, to| {
                for (_, packed) in buffers.iter_mut() {
                    if packed.key() != key {
                        continue;
                    }
                    if let Placement::Realized { pool_index, .. } = &mut packed.placement {
                        if *pool_index == from {
                            *pool_index = to;
                        }
                    }
                }
                for delayed in delayed_destroy.iter_mut() {
                    if delayed.key == key && delayed.pool_index == from {
                        delayed.pool_index = to;
                    }
                }
            },
            |buffer| {
                if let Err(e) = device.destroy_buffer(buffer) {
                    log::error!("Failed to destroy pool buffer {buffer:?}: {e}");
                }
            },
        )
    }

    /// A snapshot of every used and free extent of every pool.
    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats::collect(&self.pools)
    }

    /// Logs [`memory_stats`](Self::memory_stats) as CSV.
    pub fn log_memory_stats(&self) {
        let stats = self.memory_stats();
        log::info!(
            "GPU buffer pools: {} bytes in use, {} free, {} total",
            stats.used_bytes,
            stats.free_bytes,
            stats.total_capacity_bytes
        );
        for line in stats.to_csv().lines() {
            log::info!("{line}");
        }
    }
}

fn byte_request(
    kind: BufferKind,
    buffer_type: BufferType,
    size_bytes: u64,
    alignment: u64,
) -> BufferRequest {
    BufferRequest {
        kind,
        buffer_type,
        num_elements: size_bytes,
        bytes_per_element: 1,
        alignment,
    }
}

fn check_max_size(what: &str, size_bytes: u64, max: u64) -> Result<(), ResourceError> {
    if size_bytes > max {
        return Err(ResourceError::InvalidArgument(format!(
            "{what} buffer of {size_bytes} bytes exceeds the device limit of {max}"
        )));
    }
    Ok(())
}

fn checked_size(num_elements: u64, bytes_per_element: u64) -> Result<u64, ResourceError> {
    num_elements.checked_mul(bytes_per_element).ok_or_else(|| {
        ResourceError::InvalidArgument(format!(
            "{num_elements} elements of {bytes_per_element} bytes overflow the address space"
        ))
    })
}

fn checked_align(size_bytes: u64, alignment: u64) -> Result<u64, ResourceError> {
    size_bytes.checked_next_multiple_of(alignment).ok_or_else(|| {
        ResourceError::InvalidArgument(format!(
            "{size_bytes} bytes cannot be padded to a multiple of {alignment}"
        ))
    })
}

/// Whether widening `start..end` to `alignment` pulls in live bytes of the buffer.
///
/// Bytes past `size_bytes` are padding reserved with the buffer and never count.
pub(super) fn needs_neighbours(start: u64, end: u64, size_bytes: u64, alignment: u64) -> bool {
    start % alignment != 0 || end < align_to_next(end, alignment).min(size_bytes)
}

/// Widens a write of `data` at byte `start` of a logical buffer to whole `alignment` units.
///
/// Returns the widened start and bytes. Neighbouring live bytes come from `shadow`;
/// padding past the end of the buffer is written as zeros.
pub(super) fn widen_write<'a>(
    start: u64,
    data: &'a [u8],
    size_bytes: u64,
    shadow: Option<&[u8]>,
    alignment: u64,
) -> Result<(u64, Cow<'a, [u8]>), ResourceError> {
    let end = start + data.len() as u64;
    let aligned_start = start - start % alignment;
    let aligned_end = align_to_next(end, alignment);
    if aligned_start == start && aligned_end == end {
        return Ok((start, Cow::Borrowed(data)));
    }

    let mut bytes = vec![0u8; (aligned_end - aligned_start) as usize];
    if needs_neighbours(start, end, size_bytes, alignment) {
        let shadow = shadow.ok_or_else(|| {
            ResourceError::InvalidArgument(format!(
                "write of bytes {start}..{end} is not {alignment}-byte aligned and the buffer keeps no shadow copy"
            ))
        })?;
        let live_end = aligned_end.min(size_bytes);
        bytes[..(live_end - aligned_start) as usize]
            .copy_from_slice(&shadow[aligned_start as usize..live_end as usize]);
    }
    bytes[(start - aligned_start) as usize..][..data.len()].copy_from_slice(data);
    Ok((aligned_start, Cow::Owned(bytes)))
}
