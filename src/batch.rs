//! Barrier accumulation and deferred recording.
//!
//! Pipeline barriers are cheapest when batched: many pending dependencies
//! collapse into a single `vkCmdPipelineBarrier2` call. The types in this
//! module only *accumulate*; actually recording the resulting
//! [`vk::DependencyInfo`] is left to a caller-supplied closure, so the crate
//! never touches a device or command buffer itself.
//!
//! [`BarrierBatch`] is the lean variant: one merged global memory barrier
//! plus a list of image barriers that genuinely need a layout transition.
//! [`BarrierSet`] additionally remembers *which* buffer ranges and image
//! subresources were touched, through [`SubresourceSet`]s, so recorders can
//! ask dirtiness questions between flushes.
//!
//! Both types withhold host-read visibility until `finalize`; making GPU
//! writes visible to the host is only meaningful once, at the end of a
//! command list.

use ash::vk;
use smallvec::SmallVec;

use crate::access::AccessFlags;
use crate::subresource::{BufferSlice, ImageSlice, SubresourceSet};

const HOST_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::HOST_READ.as_raw() | vk::AccessFlags2::HOST_WRITE.as_raw(),
);

/// Accumulates barriers so they can be recorded in a single step.
///
/// Image barriers that neither transition the image layout nor transfer
/// queue family ownership fold into the merged memory barrier, keeping the
/// per-image array short.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    memory_barrier: vk::MemoryBarrier2<'static>,
    host_src_stages: vk::PipelineStageFlags2,
    host_dst_access: vk::AccessFlags2,
    image_barriers: SmallVec<[vk::ImageMemoryBarrier2<'static>; 8]>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a memory barrier.
    ///
    /// Host read visibility is withheld until [`finalize`](Self::finalize).
    pub fn add_memory_barrier(&mut self, barrier: &vk::MemoryBarrier2) {
        let device_stages = barrier.dst_stage_mask & !vk::PipelineStageFlags2::HOST;
        if !device_stages.is_empty() {
            self.memory_barrier.src_stage_mask |= barrier.src_stage_mask;
            self.memory_barrier.src_access_mask |= barrier.src_access_mask;
            self.memory_barrier.dst_stage_mask |= device_stages;
            self.memory_barrier.dst_access_mask |= barrier.dst_access_mask & !HOST_ACCESS;
        }
        if barrier.dst_stage_mask.contains(vk::PipelineStageFlags2::HOST) {
            self.host_src_stages |= barrier.src_stage_mask;
            self.host_dst_access |= barrier.dst_access_mask & HOST_ACCESS;
        }
    }

    /// Adds an image barrier.
    ///
    /// Turns into a plain memory barrier if no layout transition or queue
    /// family ownership transfer happens. Any `p_next` chain on the input
    /// is not carried over.
    pub fn add_image_barrier(&mut self, barrier: &vk::ImageMemoryBarrier2) {
        if barrier.old_layout == barrier.new_layout
            && barrier.src_queue_family_index == barrier.dst_queue_family_index
        {
            self.add_memory_barrier(&vk::MemoryBarrier2 {
                src_stage_mask: barrier.src_stage_mask,
                src_access_mask: barrier.src_access_mask,
                dst_stage_mask: barrier.dst_stage_mask,
                dst_access_mask: barrier.dst_access_mask,
                ..Default::default()
            });
            return;
        }

        self.image_barriers.push(vk::ImageMemoryBarrier2 {
            src_stage_mask: barrier.src_stage_mask,
            src_access_mask: barrier.src_access_mask,
            dst_stage_mask: barrier.dst_stage_mask,
            dst_access_mask: barrier.dst_access_mask,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout,
            src_queue_family_index: barrier.src_queue_family_index,
            dst_queue_family_index: barrier.dst_queue_family_index,
            image: barrier.image,
            subresource_range: barrier.subresource_range,
            ..Default::default()
        });
    }

    /// Hands all pending barriers to `record` as a single dependency, then
    /// clears them. `record` is not invoked when nothing is pending.
    pub fn flush(&mut self, record: impl FnOnce(&vk::DependencyInfo<'_>)) {
        let memory_barrier_count = usize::from(self.has_memory_barrier());
        if memory_barrier_count == 0 && self.image_barriers.is_empty() {
            return;
        }

        let memory_barriers = [self.memory_barrier];
        let info = vk::DependencyInfo::default()
            .memory_barriers(&memory_barriers[..memory_barrier_count])
            .image_memory_barriers(&self.image_barriers);
        record(&info);

        self.memory_barrier = vk::MemoryBarrier2::default();
        self.image_barriers.clear();
    }

    /// Flushes pending barriers together with the deferred host-read
    /// visibility. Call once when the command list ends.
    pub fn finalize(&mut self, record: impl FnOnce(&vk::DependencyInfo<'_>)) {
        if !self.host_dst_access.is_empty() {
            // Only the source stages were kept around, so make all prior
            // writes available rather than replaying their access masks.
            self.memory_barrier.src_stage_mask |= self.host_src_stages;
            self.memory_barrier.src_access_mask |= vk::AccessFlags2::MEMORY_WRITE;
            self.memory_barrier.dst_stage_mask |= vk::PipelineStageFlags2::HOST;
            self.memory_barrier.dst_access_mask |= self.host_dst_access;
            self.host_src_stages = vk::PipelineStageFlags2::empty();
            self.host_dst_access = vk::AccessFlags2::empty();
        }
        self.flush(record);
    }

    pub fn has_pending_barriers(&self) -> bool {
        self.has_memory_barrier() || !self.image_barriers.is_empty()
    }

    fn has_memory_barrier(&self) -> bool {
        !self.memory_barrier.src_stage_mask.is_empty()
            || !self.memory_barrier.dst_stage_mask.is_empty()
    }
}

/// Accumulates barriers and remembers which resource slices they covered.
///
/// Between flushes, recorders can ask whether a new access to a buffer
/// range or image subresource conflicts with a pending one
/// ([`is_buffer_dirty`](Self::is_buffer_dirty),
/// [`is_image_dirty`](Self::is_image_dirty)) and which access classes were
/// observed ([`get_buffer_access`](Self::get_buffer_access),
/// [`get_image_access`](Self::get_image_access)).
#[derive(Debug, Default)]
pub struct BarrierSet {
    all_src_stages: vk::PipelineStageFlags2,
    host_src_stages: vk::PipelineStageFlags2,
    host_dst_access: vk::AccessFlags2,
    memory_barrier: vk::MemoryBarrier2<'static>,
    image_barriers: SmallVec<[vk::ImageMemoryBarrier2<'static>; 8]>,
    buffer_slices: SubresourceSet<vk::Buffer, BufferSlice>,
    image_slices: SubresourceSet<vk::Image, ImageSlice>,
}

impl BarrierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a global execution and memory dependency.
    pub fn access_memory(
        &mut self,
        src_stages: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stages: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        self.all_src_stages |= src_stages;

        let device_stages = dst_stages & !vk::PipelineStageFlags2::HOST;
        if !device_stages.is_empty() {
            self.memory_barrier.src_stage_mask |= src_stages;
            self.memory_barrier.src_access_mask |= src_access;
            self.memory_barrier.dst_stage_mask |= device_stages;
            self.memory_barrier.dst_access_mask |= dst_access & !HOST_ACCESS;
        }
        if dst_stages.contains(vk::PipelineStageFlags2::HOST) {
            self.host_src_stages |= src_stages;
            self.host_dst_access |= dst_access & HOST_ACCESS;
        }
    }

    /// Adds a dependency on a buffer range and tracks the range as
    /// accessed.
    #[allow(clippy::too_many_arguments)]
    pub fn access_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        length: vk::DeviceSize,
        src_stages: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stages: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let access = AccessFlags::classify(src_access);
        self.access_memory(src_stages, src_access, dst_stages, dst_access);
        self.buffer_slices
            .insert(buffer, BufferSlice::new(offset, length, access));
    }

    /// Adds a dependency on image subresources and tracks them as
    /// accessed. A layout transition emits a dedicated image barrier and
    /// counts as a write to the affected subresources.
    #[allow(clippy::too_many_arguments)]
    pub fn access_image(
        &mut self,
        image: vk::Image,
        subresources: vk::ImageSubresourceRange,
        src_layout: vk::ImageLayout,
        src_stages: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_layout: vk::ImageLayout,
        dst_stages: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let mut access = AccessFlags::classify(src_access);

        if src_layout != dst_layout {
            access |= AccessFlags::WRITE;
            self.all_src_stages |= src_stages;
            self.image_barriers.push(vk::ImageMemoryBarrier2 {
                src_stage_mask: src_stages,
                src_access_mask: src_access,
                dst_stage_mask: dst_stages,
                dst_access_mask: dst_access,
                old_layout: src_layout,
                new_layout: dst_layout,
                image,
                subresource_range: subresources,
                ..Default::default()
            });
        } else {
            self.access_memory(src_stages, src_access, dst_stages, dst_access);
        }

        self.image_slices
            .insert(image, ImageSlice::new(subresources, access));
    }

    /// Checks whether a pending buffer access conflicts with the requested
    /// one.
    pub fn is_buffer_dirty(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        length: vk::DeviceSize,
        access: AccessFlags,
    ) -> bool {
        self.buffer_slices
            .is_dirty(buffer, &BufferSlice::new(offset, length, access))
    }

    /// Checks whether a pending image access conflicts with the requested
    /// one.
    pub fn is_image_dirty(
        &self,
        image: vk::Image,
        subresources: vk::ImageSubresourceRange,
        access: AccessFlags,
    ) -> bool {
        self.image_slices
            .is_dirty(image, &ImageSlice::new(subresources, access))
    }

    /// Queries the access classes pending on a buffer range.
    pub fn get_buffer_access(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        length: vk::DeviceSize,
    ) -> AccessFlags {
        self.buffer_slices
            .get_access(buffer, &BufferSlice::new(offset, length, AccessFlags::empty()))
    }

    /// Queries the access classes pending on image subresources.
    pub fn get_image_access(
        &self,
        image: vk::Image,
        subresources: vk::ImageSubresourceRange,
    ) -> AccessFlags {
        self.image_slices
            .get_access(image, &ImageSlice::new(subresources, AccessFlags::empty()))
    }

    /// Union of all source stages accumulated since the last flush.
    pub fn src_stages(&self) -> vk::PipelineStageFlags2 {
        self.all_src_stages
    }

    pub fn has_resource_barriers(&self) -> bool {
        !self.buffer_slices.is_empty() || !self.image_slices.is_empty()
    }

    /// Hands all pending barriers to `record` as a single dependency, then
    /// starts a new tracking scope. Deferred host visibility survives
    /// until [`finalize`](Self::finalize).
    pub fn record(&mut self, record: impl FnOnce(&vk::DependencyInfo<'_>)) {
        let memory_barrier_count = usize::from(self.has_memory_barrier());
        if memory_barrier_count != 0 || !self.image_barriers.is_empty() {
            let memory_barriers = [self.memory_barrier];
            let info = vk::DependencyInfo::default()
                .memory_barriers(&memory_barriers[..memory_barrier_count])
                .image_memory_barriers(&self.image_barriers);
            record(&info);
        }

        self.all_src_stages = vk::PipelineStageFlags2::empty();
        self.memory_barrier = vk::MemoryBarrier2::default();
        self.image_barriers.clear();
        self.buffer_slices.clear();
        self.image_slices.clear();
    }

    /// Records pending barriers together with the deferred host-read
    /// visibility. Call once when the command list ends.
    pub fn finalize(&mut self, record: impl FnOnce(&vk::DependencyInfo<'_>)) {
        if !self.host_dst_access.is_empty() {
            self.memory_barrier.src_stage_mask |= self.host_src_stages;
            self.memory_barrier.src_access_mask |= vk::AccessFlags2::MEMORY_WRITE;
            self.memory_barrier.dst_stage_mask |= vk::PipelineStageFlags2::HOST;
            self.memory_barrier.dst_access_mask |= self.host_dst_access;
            self.host_src_stages = vk::PipelineStageFlags2::empty();
            self.host_dst_access = vk::AccessFlags2::empty();
        }
        self.record(record);
    }

    /// Drops all pending state without recording anything.
    pub fn reset(&mut self) {
        self.all_src_stages = vk::PipelineStageFlags2::empty();
        self.host_src_stages = vk::PipelineStageFlags2::empty();
        self.host_dst_access = vk::AccessFlags2::empty();
        self.memory_barrier = vk::MemoryBarrier2::default();
        self.image_barriers.clear();
        self.buffer_slices.clear();
        self.image_slices.clear();
    }

    fn has_memory_barrier(&self) -> bool {
        !self.memory_barrier.src_stage_mask.is_empty()
            || !self.memory_barrier.dst_stage_mask.is_empty()
    }
}
