//! Per-resource slice sets with versioned O(1) clearing.
//!
//! A [`SubresourceSet`] remembers which slices of a resource have been
//! accessed since the last flush, keyed by the raw Vulkan handle. Unlike the
//! range tracker it keeps the actual access flags per slice, so it can
//! answer "which accesses overlap this slice" ([`get_access`]) as well as
//! "does an overlapping write make this slice dirty" ([`is_dirty`]).
//!
//! Each hash slot stores one representative slice plus the head of a
//! singly-linked overflow list holding further slices of the same resource.
//! The representative is kept merged into a superset of everything in its
//! list, so negative answers never have to walk the list at all. Clearing
//! bumps a version stamp instead of touching the table, which keeps
//! per-command-list resets O(1).
//!
//! [`get_access`]: SubresourceSet::get_access
//! [`is_dirty`]: SubresourceSet::is_dirty

use ash::vk::{self, Handle};

use crate::access::{Access, AccessFlags};

const NO_ENTRY: u32 = u32::MAX;
const MIN_CAPACITY: usize = 64;

/// Access descriptor for part of a resource, stored in a [`SubresourceSet`].
pub trait ResourceSlice: Copy + Default {
    /// Whether insertion should scan the overflow list for merge
    /// candidates. Pays off for slice types that commonly touch adjacent
    /// regions; wasted work for those that rarely coalesce.
    const MERGE_SCAN: bool;

    /// Checks whether the two slices share any subresource.
    fn overlaps(&self, other: &Self) -> bool;

    /// Checks whether the slices overlap and either side carries a write.
    fn is_dirty(&self, other: &Self) -> bool {
        (self.access() | other.access()).contains(Access::Write) && self.overlaps(other)
    }

    /// Checks whether merging the two slices loses no precision.
    fn can_merge(&self, other: &Self) -> bool;

    /// Widens `self` to cover `other`, unioning access flags. When called
    /// with slices that cannot merge, the result is a strict superset of
    /// both.
    fn merge(&mut self, other: &Self);

    fn access(&self) -> AccessFlags;
}

/// Byte range of a buffer together with its observed access flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferSlice {
    lo_addr: vk::DeviceSize,
    hi_addr: vk::DeviceSize,
    access: AccessFlags,
}

impl BufferSlice {
    pub fn new(offset: vk::DeviceSize, length: vk::DeviceSize, access: AccessFlags) -> Self {
        Self {
            lo_addr: offset,
            hi_addr: offset + length,
            access,
        }
    }
}

impl ResourceSlice for BufferSlice {
    // Buffer ranges rarely coalesce; traversing the whole list on every
    // insertion costs more than the shorter list saves.
    const MERGE_SCAN: bool = false;

    fn overlaps(&self, other: &Self) -> bool {
        self.hi_addr > other.lo_addr && self.lo_addr < other.hi_addr
    }

    fn can_merge(&self, other: &Self) -> bool {
        if self.access == other.access {
            // Same access: overlapping or adjacent ranges merge exactly.
            self.hi_addr >= other.lo_addr && self.lo_addr <= other.hi_addr
        } else {
            // Different access: only the identical range merges, by
            // unioning the flags.
            self.lo_addr == other.lo_addr && self.hi_addr == other.hi_addr
        }
    }

    fn merge(&mut self, other: &Self) {
        self.lo_addr = self.lo_addr.min(other.lo_addr);
        self.hi_addr = self.hi_addr.max(other.hi_addr);
        self.access |= other.access;
    }

    fn access(&self) -> AccessFlags {
        self.access
    }
}

/// Image subresource box together with its observed access flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageSlice {
    aspects: vk::ImageAspectFlags,
    min_layer: u32,
    max_layer: u32,
    min_level: u32,
    max_level: u32,
    access: AccessFlags,
}

impl ImageSlice {
    pub fn new(range: vk::ImageSubresourceRange, access: AccessFlags) -> Self {
        Self {
            aspects: range.aspect_mask,
            min_layer: range.base_array_layer,
            max_layer: range.base_array_layer + range.layer_count,
            min_level: range.base_mip_level,
            max_level: range.base_mip_level + range.level_count,
            access,
        }
    }
}

impl ResourceSlice for ImageSlice {
    // Subresource ranges commonly walk adjacent layers or mip levels, so
    // keeping the list short is worth the scan.
    const MERGE_SCAN: bool = true;

    fn overlaps(&self, other: &Self) -> bool {
        self.aspects.intersects(other.aspects)
            && self.min_layer < other.max_layer
            && self.max_layer > other.min_layer
            && self.min_level < other.max_level
            && self.max_level > other.min_level
    }

    fn can_merge(&self, other: &Self) -> bool {
        let same_layers =
            self.min_layer == other.min_layer && self.max_layer == other.max_layer;
        let same_levels =
            self.min_level == other.min_level && self.max_level == other.max_level;

        if same_layers == same_levels {
            // Either the boxes are identical, in which case merging only
            // unions the access flags, or they differ on both axes and a
            // merge would cover subresources neither slice touched.
            return same_layers;
        }

        // Merging along one axis must not mix access flags into
        // subresources that never saw them.
        if self.access != other.access {
            return false;
        }

        if same_layers {
            self.max_level >= other.min_level && self.min_level <= other.max_level
        } else {
            self.max_layer >= other.min_layer && self.min_layer <= other.max_layer
        }
    }

    fn merge(&mut self, other: &Self) {
        self.aspects |= other.aspects;
        self.min_layer = self.min_layer.min(other.min_layer);
        self.max_layer = self.max_layer.max(other.max_layer);
        self.min_level = self.min_level.min(other.min_level);
        self.max_level = self.max_level.max(other.max_level);
        self.access |= other.access;
    }

    fn access(&self) -> AccessFlags {
        self.access
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ListEntry<T> {
    data: T,
    next: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct HashEntry<K, T> {
    version: u64,
    key: K,
    data: T,
    next: u32,
}

/// Set of accessed resource slices, keyed by Vulkan handle.
///
/// Open-addressed with linear probing; a slot is live only while its
/// version stamp matches the set's. The table doubles once the load factor
/// reaches 0.7 and never shrinks within a tracker's lifetime.
#[derive(Debug)]
pub struct SubresourceSet<K, T> {
    version: u64,
    used: usize,
    index_mask: usize,
    hash_map: Vec<HashEntry<K, T>>,
    list: Vec<ListEntry<T>>,
}

impl<K, T> Default for SubresourceSet<K, T>
where
    K: Handle + Copy + PartialEq + Default,
    T: ResourceSlice,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> SubresourceSet<K, T>
where
    K: Handle + Copy + PartialEq + Default,
    T: ResourceSlice,
{
    pub fn new() -> Self {
        Self {
            version: 1,
            used: 0,
            index_mask: 0,
            hash_map: Vec::new(),
            list: Vec::new(),
        }
    }

    /// Queries the union of access flags of all stored slices for
    /// `resource` that overlap the given slice.
    pub fn get_access(&self, resource: K, slice: &T) -> AccessFlags {
        let Some(index) = self.find_entry(resource) else {
            return AccessFlags::empty();
        };
        let entry = &self.hash_map[index];

        // The representative covers every slice in its list, so a miss
        // here is a miss for all of them.
        if !entry.data.overlaps(slice) {
            return AccessFlags::empty();
        }
        if entry.next == NO_ENTRY {
            return entry.data.access();
        }

        // Stop as soon as no flags beyond the summary can be gained.
        let mut access = AccessFlags::empty();
        let mut cursor = entry.next;
        while cursor != NO_ENTRY && access != entry.data.access() {
            let item = &self.list[cursor as usize];
            if item.data.overlaps(slice) {
                access |= item.data.access();
            }
            cursor = item.next;
        }
        access
    }

    /// Checks whether a stored slice overlapping the given slice involves a
    /// write on either side.
    pub fn is_dirty(&self, resource: K, slice: &T) -> bool {
        let Some(index) = self.find_entry(resource) else {
            return false;
        };
        let entry = &self.hash_map[index];

        if !entry.data.is_dirty(slice) {
            return false;
        }

        // Something under this entry is dirty; with no list the
        // representative is exact.
        if entry.next == NO_ENTRY {
            return true;
        }

        let mut cursor = entry.next;
        while cursor != NO_ENTRY {
            let item = &self.list[cursor as usize];
            if item.data.is_dirty(slice) {
                return true;
            }
            cursor = item.next;
        }
        false
    }

    /// Inserts a slice, merging it with stored entries where possible so
    /// lookups and later insertions stay fast.
    pub fn insert(&mut self, resource: K, slice: T) {
        self.grow_before_insert();

        let mut index = self.index_of(resource);
        while self.hash_map[index].version == self.version && self.hash_map[index].key != resource
        {
            index = self.advance_index(index);
        }

        if self.hash_map[index].version != self.version {
            self.hash_map[index] = HashEntry {
                version: self.version,
                key: resource,
                data: slice,
                next: NO_ENTRY,
            };
            self.used += 1;
            return;
        }

        if self.hash_map[index].next != NO_ENTRY {
            if T::MERGE_SCAN {
                let mut cursor = self.hash_map[index].next;
                loop {
                    if self.list[cursor as usize].data.can_merge(&slice) {
                        self.list[cursor as usize].data.merge(&slice);
                        break;
                    }
                    let next = self.list[cursor as usize].next;
                    if next == NO_ENTRY {
                        self.push_list_entry(index, slice);
                        break;
                    }
                    cursor = next;
                }
            } else {
                self.push_list_entry(index, slice);
            }
        } else if !self.hash_map[index].data.can_merge(&slice) {
            // Materialize the list only when the new slice cannot be folded
            // into the single stored one.
            let head = self.hash_map[index].data;
            self.push_list_entry(index, head);
            self.push_list_entry(index, slice);
        }

        // The representative stays a superset of every chained slice.
        let mut merged = self.hash_map[index].data;
        merged.merge(&slice);
        self.hash_map[index].data = merged;
    }

    /// Removes every entry in O(1) by bumping the version stamp.
    pub fn clear(&mut self) {
        self.used = 0;
        self.list.clear();

        // The rehash uses `version + 1` as a transient marker, so the stamp
        // must never reach the maximum. A wrapped stamp would also
        // resurrect stale slots; start the table over instead.
        if self.version >= u64::MAX - 2 {
            self.hash_map.fill_with(Default::default);
            self.version = 0;
        }
        self.version += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn hash(key: K) -> u64 {
        let hash = key.as_raw().wrapping_mul(93887);
        hash ^ (hash >> 16)
    }

    fn capacity(&self) -> usize {
        if self.index_mask == 0 {
            0
        } else {
            self.index_mask + 1
        }
    }

    fn index_of(&self, key: K) -> usize {
        (Self::hash(key) as usize) & self.index_mask
    }

    fn advance_index(&self, index: usize) -> usize {
        (index + 1) & self.index_mask
    }

    fn find_entry(&self, key: K) -> Option<usize> {
        if self.used == 0 {
            return None;
        }
        let mut index = self.index_of(key);
        while self.hash_map[index].version == self.version {
            if self.hash_map[index].key == key {
                return Some(index);
            }
            index = self.advance_index(index);
        }
        None
    }

    fn push_list_entry(&mut self, hash_index: usize, data: T) {
        let index = self.list.len() as u32;
        self.list.push(ListEntry {
            data,
            next: self.hash_map[hash_index].next,
        });
        self.hash_map[hash_index].next = index;
    }

    fn grow_before_insert(&mut self) {
        // A load factor of 0.7 keeps probe sequences short.
        let capacity = self.capacity();
        if 10 * self.used >= 7 * capacity {
            let new_capacity = if capacity == 0 {
                MIN_CAPACITY
            } else {
                capacity * 2
            };
            self.grow(new_capacity);
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        tracing::trace!(new_capacity, used = self.used, "growing subresource set");
        let old_capacity = self.capacity();
        self.hash_map.resize_with(new_capacity, Default::default);
        self.index_mask = new_capacity - 1;

        // Relocate live entries in place, re-probing in the grown table.
        // Already-moved entries carry a `version + 1` stamp so probing can
        // step over them; unrelocated live entries only ever sit in the
        // not-yet-scanned part of the old prefix.
        for slot in 0..old_capacity {
            let mut entry = std::mem::take(&mut self.hash_map[slot]);
            while entry.version == self.version {
                let mut index = self.index_of(entry.key);
                entry.version = self.version + 1;
                while self.hash_map[index].version > self.version {
                    index = self.advance_index(index);
                }
                std::mem::swap(&mut entry, &mut self.hash_map[index]);
            }
        }

        // Reconcile the markers with one version bump.
        self.version += 1;
    }
}
