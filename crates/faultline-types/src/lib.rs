//! # faultline-types: Core types for the Faultline injection engine
//!
//! Shared vocabulary for the fault-injection crates:
//! - Addressing ([`Lba`], [`BlockCount`], [`ObjectId`], [`ObjectClass`])
//! - Array positions ([`PositionBitmask`], [`RaidGeometry`], [`PositionKind`])
//! - The sector model ([`Sector`] with data words plus metadata stamps)
//! - Requests crossing the engine boundary ([`BlockRequest`], [`Opcode`],
//!   [`RequestStatus`])

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

mod geometry;
mod request;
mod sector;

pub use geometry::{GeometryError, PositionKind, RaidGeometry};
pub use request::{
    BlockRequest, BlockStatus, Opcode, RequestFlags, RequestStatus, StatusQualifier,
};
pub use sector::{
    CHECKSUM_SEED, INVALID_PATTERN, Sector, TEST_WORD_INDEX, WORDS_PER_SECTOR, checksum_of,
    lba_stamp_of,
};

/// Logical block address.
pub type Lba = u64;

/// Count of blocks in a request or record range.
pub type BlockCount = u64;

/// Maximum number of drive positions an array (and a position bitmask) can
/// address.
pub const MAX_POSITIONS: u32 = 16;

/// RAID-6 symbols per sector for bit-level corruption.
pub const SYMBOLS_PER_SECTOR: u32 = 16;

/// Data words per RAID-6 symbol.
pub const WORDS_PER_SYMBOL: u32 = 8;

/// Bit width of one RAID-6 data symbol.
pub const SYMBOL_SIZE_BITS: u32 = WORDS_PER_SYMBOL * 32;

/// Bit width of the 16-bit metadata targets (checksum and stamps).
pub const STAMP_SIZE_BITS: u32 = 16;

// ============================================================================
// Entity IDs
// ============================================================================

/// Identifier of a storage object (LUN, RAID group, virtual drive, ...) as
/// seen by the injection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(u32);

impl ObjectId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u32> for ObjectId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ObjectId> for u32 {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

/// Class of a storage object registered with the engine.
///
/// Class only matters at two points: LUN-class objects skip the per-position
/// filter on pre-send matching (a LUN has no array position), and spare-class
/// objects restrict which error types may inject while they are not part of a
/// proactive copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ObjectClass {
    #[default]
    Unknown,
    Lun,
    RaidGroup,
    VirtualDrive,
    ProvisionDrive,
    Spare,
}

// ============================================================================
// Position bitmasks
// ============================================================================

/// Bitmask of drive positions, one bit per array position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, PartialOrd, Ord,
)]
pub struct PositionBitmask(u16);

impl PositionBitmask {
    pub const EMPTY: Self = Self(0);

    pub fn new(bits: u16) -> Self {
        Self(bits)
    }

    /// Mask with exactly one position set.
    pub fn single(position: u32) -> Self {
        debug_assert!(position < MAX_POSITIONS);
        Self(1 << position)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, position: u32) -> bool {
        position < MAX_POSITIONS && self.0 & (1 << position) != 0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True when every bit of `self` is also set in `other`.
    pub fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn count(self) -> u32 {
        u32::from(self.0.count_ones() as u16)
    }
}

impl Display for PositionBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06b}", self.0)
    }
}

impl From<u16> for PositionBitmask {
    fn from(bits: u16) -> Self {
        Self(bits)
    }
}

impl From<PositionBitmask> for u16 {
    fn from(mask: PositionBitmask) -> Self {
        mask.0
    }
}
