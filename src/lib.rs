//! # Tephra
//!
//! Pending-access tracking and pipeline barrier batching for Vulkan command
//! recording.
//!
//! Explicit APIs leave hazard tracking to the layer that records commands:
//! before a command reads or writes a region of memory, the recorder must
//! know whether an earlier, not-yet-synchronized command touched that region
//! with a conflicting access. Tephra provides the data structures that
//! answer this question quickly, plus small helpers that batch the resulting
//! `VkMemoryBarrier2`/`VkImageMemoryBarrier2` values into one dependency.
//! The crate records no commands itself; it hands a finished
//! [`vk::DependencyInfo`](ash::vk::DependencyInfo) to a closure supplied by
//! the caller.
//!
//! ## Range tracking
//!
//! [`BarrierTracker`] maintains pending accesses as `(resource, range)`
//! pairs in a forest of pooled red-black trees, split into read and write
//! buckets. Queries against untouched resources exit in O(1):
//!
//! ```
//! use tephra::{Access, AddressRange, BarrierTracker};
//!
//! let mut tracker = BarrierTracker::new();
//!
//! // A copy wrote the first 256 bytes of some buffer.
//! tracker
//!     .insert_range(AddressRange::new(0x1000, 0, 255), Access::Write)
//!     .unwrap();
//!
//! // A draw wants to read part of that range: barrier required.
//! assert!(tracker.find_range(AddressRange::new(0x1000, 64, 127), Access::Read));
//!
//! // Reads of an untouched buffer go through unsynchronized.
//! assert!(!tracker.find_range(AddressRange::new(0x2000, 0, 63), Access::Read));
//!
//! // After the barrier is emitted, the slate is wiped for the next scope.
//! tracker.clear();
//! assert!(tracker.is_empty());
//! ```
//!
//! ## Subresource tracking
//!
//! [`SubresourceSet`] keeps the actual access flags per buffer range or
//! image subresource box, with opportunistic slice merging and an O(1)
//! versioned clear:
//!
//! ```
//! use tephra::ash::vk::{self, Handle};
//! use tephra::{AccessFlags, BufferSlice, SubresourceSet};
//!
//! let mut slices = SubresourceSet::<vk::Buffer, BufferSlice>::new();
//! let buffer = vk::Buffer::from_raw(0xb001);
//!
//! slices.insert(buffer, BufferSlice::new(0, 64, AccessFlags::WRITE));
//!
//! assert!(slices.is_dirty(buffer, &BufferSlice::new(32, 8, AccessFlags::READ)));
//! assert!(!slices.is_dirty(buffer, &BufferSlice::new(128, 8, AccessFlags::READ)));
//! ```
//!
//! ## Barrier batching
//!
//! [`BarrierBatch`] and [`BarrierSet`] accumulate barriers until the
//! recorder flushes them in a single step; see the [`batch`] module.
//!
//! ## Ownership model
//!
//! Every tracker instance is owned by exactly one recorder and mutated from
//! a single thread. Resource keys are opaque handles; the crate never
//! dereferences them and makes no lifetime claims on the underlying GPU
//! objects.

pub mod access;
pub mod batch;
pub mod subresource;
pub mod tracker;

pub use access::{Access, AccessFlags};
pub use batch::{BarrierBatch, BarrierSet};
pub use subresource::{BufferSlice, ImageSlice, ResourceSlice, SubresourceSet};
pub use tracker::{AddressRange, BarrierTracker, TrackerError};

pub use ash;

pub mod prelude {
    pub use crate::{
        access::{Access, AccessFlags},
        ash::vk,
        batch::{BarrierBatch, BarrierSet},
        subresource::{BufferSlice, ImageSlice, SubresourceSet},
        tracker::{AddressRange, BarrierTracker},
    };
}
