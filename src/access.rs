//! Access classification for tracked resource ranges.
//!
//! Barrier placement only needs to know whether a pending command *reads* or
//! *writes* a region, not which pipeline stage touches it. [`Access`] names
//! the two classes, [`AccessFlags`] is the corresponding bit set, and
//! [`AccessFlags::classify`] folds a raw [`vk::AccessFlags2`] mask down to
//! those classes.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use ash::vk;

/// Access class of a command touching a resource region.
///
/// Two accesses conflict when at least one of them is a [`Write`](Access::Write).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Access {
    Read,
    Write,
}

/// Bit set of [`Access`] classes.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, access: Access) -> bool {
        self.0 & Self::from_access(access).0 != 0
    }

    const fn from_access(access: Access) -> Self {
        match access {
            Access::Read => Self::READ,
            Access::Write => Self::WRITE,
        }
    }

    /// Folds a raw Vulkan access mask into read/write classes.
    ///
    /// `MEMORY_READ` and `MEMORY_WRITE` count toward their respective
    /// classes; bits that imply neither, such as an empty mask, classify as
    /// no access.
    pub fn classify(mask: vk::AccessFlags2) -> Self {
        let mut flags = Self::empty();
        if mask.intersects(ALL_READ_BITS) {
            flags |= Self::READ;
        }
        if mask.intersects(ALL_WRITE_BITS) {
            flags |= Self::WRITE;
        }
        flags
    }
}

impl From<Access> for AccessFlags {
    fn from(access: Access) -> Self {
        Self::from_access(access)
    }
}

impl BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Access::Read), self.contains(Access::Write)) {
            (false, false) => f.write_str("AccessFlags(NONE)"),
            (true, false) => f.write_str("AccessFlags(READ)"),
            (false, true) => f.write_str("AccessFlags(WRITE)"),
            (true, true) => f.write_str("AccessFlags(READ | WRITE)"),
        }
    }
}

const ALL_WRITE_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFORM_FEEDBACK_WRITE_EXT.as_raw()
        | vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_WRITE_EXT.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
);

const ALL_READ_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::INDIRECT_COMMAND_READ.as_raw()
        | vk::AccessFlags2::INDEX_READ.as_raw()
        | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw()
        | vk::AccessFlags2::UNIFORM_READ.as_raw()
        | vk::AccessFlags2::INPUT_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::SHADER_READ.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::TRANSFER_READ.as_raw()
        | vk::AccessFlags2::HOST_READ.as_raw()
        | vk::AccessFlags2::MEMORY_READ.as_raw()
        | vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
        | vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_READ_EXT.as_raw()
        | vk::AccessFlags2::CONDITIONAL_RENDERING_READ_EXT.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
        | vk::AccessFlags2::SHADER_BINDING_TABLE_READ_KHR.as_raw(),
);
