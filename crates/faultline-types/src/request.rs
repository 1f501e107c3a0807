//! Requests crossing the engine boundary and the statuses the engine hands
//! back.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::{BlockCount, Lba, MAX_POSITIONS, ObjectId, PositionBitmask, Sector};

// ============================================================================
// Opcodes
// ============================================================================

/// Block operation opcode, reduced to the set the engine intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Read,
    Write,
    WriteNoncached,
    /// Write followed by a verifying read; this is the opcode that walks the
    /// media-error tracker forward (remap simulation).
    WriteVerify,
    Verify,
    ErrorVerify,
}

impl Opcode {
    /// Opcodes whose completion carries data the engine may corrupt or fail.
    pub fn is_injectable(self) -> bool {
        matches!(
            self,
            Self::Read
                | Self::Write
                | Self::WriteNoncached
                | Self::WriteVerify
                | Self::Verify
                | Self::ErrorVerify
        )
    }

    /// Read-class operations return data upstream.
    pub fn is_read_class(self) -> bool {
        matches!(self, Self::Read | Self::Verify | Self::ErrorVerify)
    }

    /// Write-class operations carry data downstream.
    pub fn is_write_class(self) -> bool {
        matches!(self, Self::Write | Self::WriteNoncached | Self::WriteVerify)
    }

    /// Verify-class operations are the only ones that can observe a pure
    /// coherency error.
    pub fn is_verify_class(self) -> bool {
        matches!(self, Self::Verify | Self::ErrorVerify)
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::WriteNoncached => "write_noncached",
            Self::WriteVerify => "write_verify",
            Self::Verify => "verify",
            Self::ErrorVerify => "error_verify",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Block-level completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BlockStatus {
    #[default]
    Success,
    MediaError,
    IoFailed,
}

/// Qualifier refining a [`BlockStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StatusQualifier {
    #[default]
    None,
    /// Soft media error: the block succeeded but wants a remap.
    RemapRequired,
    /// Hard media error on a write-verify: the data is gone.
    DataLost,
    RetryNotPossible,
    Unexpected,
    KeyWrapError,
    KeyNotFound,
    EncryptionNotEnabled,
}

/// Completion status as mutated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestStatus {
    pub status: BlockStatus,
    pub qualifier: StatusQualifier,
    /// First bad LBA for media-error statuses.
    pub media_error_lba: Option<Lba>,
}

impl RequestStatus {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.status == BlockStatus::Success && self.qualifier == StatusQualifier::None
    }

    pub fn hard_media_error(lba: Lba, qualifier: StatusQualifier) -> Self {
        Self {
            status: BlockStatus::MediaError,
            qualifier,
            media_error_lba: Some(lba),
        }
    }

    pub fn soft_media_error(lba: Lba) -> Self {
        Self {
            status: BlockStatus::Success,
            qualifier: StatusQualifier::RemapRequired,
            media_error_lba: Some(lba),
        }
    }

    pub fn failed(qualifier: StatusQualifier) -> Self {
        Self {
            status: BlockStatus::IoFailed,
            qualifier,
            media_error_lba: None,
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// Flags the upstream request tracking exposes to the match engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestFlags {
    /// The request is a retry of a previously failed attempt.
    pub retried: bool,
    /// The request is running in single-region verify mode.
    pub single_region_verify: bool,
    /// An error was already injected somewhere on this request's parent.
    pub error_injected: bool,
    /// The request has a parent (it is a child of a recovery verify).
    pub has_parent: bool,
    /// Positions of the parent already carrying faults.
    pub parent_faulted_positions: u32,
}

/// One request as submitted to the engine, pre-send and post-completion.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub opcode: Opcode,
    pub object_id: ObjectId,
    /// Physical array position this request targets.
    pub position: u32,
    /// Width of the owning array. Defaults to the maximum; set it when the
    /// stamp recipes need the real data-position mask.
    pub array_width: u32,
    /// Positions carrying parity in the owning stripe.
    pub parity_positions: PositionBitmask,
    pub lba: Lba,
    pub blocks: BlockCount,
    /// Sector images, one per block; empty for requests with no data payload.
    pub sectors: Vec<Sector>,
    pub status: RequestStatus,
    pub flags: RequestFlags,
}

impl BlockRequest {
    /// Request with deterministic valid sector images seeded by LBA.
    pub fn new(
        opcode: Opcode,
        object_id: ObjectId,
        position: u32,
        lba: Lba,
        blocks: BlockCount,
    ) -> Self {
        let sectors = (0..blocks).map(|i| Sector::with_seed(lba + i)).collect();
        Self {
            opcode,
            object_id,
            position,
            array_width: MAX_POSITIONS,
            parity_positions: PositionBitmask::EMPTY,
            lba,
            blocks,
            sectors,
            status: RequestStatus::success(),
            flags: RequestFlags::default(),
        }
    }

    pub fn with_geometry(mut self, array_width: u32, parity_positions: PositionBitmask) -> Self {
        self.array_width = array_width;
        self.parity_positions = parity_positions;
        self
    }

    pub fn end_lba(&self) -> Lba {
        self.lba + self.blocks - 1
    }

    /// Sector image at `lba`, if the request covers it and carries data.
    pub fn sector_at_mut(&mut self, lba: Lba) -> Option<&mut Sector> {
        if lba < self.lba {
            return None;
        }
        let offset = (lba - self.lba) as usize;
        self.sectors.get_mut(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_classes_are_disjoint() {
        for op in [
            Opcode::Read,
            Opcode::Write,
            Opcode::WriteNoncached,
            Opcode::WriteVerify,
            Opcode::Verify,
            Opcode::ErrorVerify,
        ] {
            assert_ne!(op.is_read_class(), op.is_write_class(), "{op}");
        }
    }

    #[test]
    fn request_sectors_track_lba() {
        let mut req = BlockRequest::new(Opcode::Read, ObjectId::new(1), 0, 100, 4);
        assert_eq!(req.end_lba(), 103);
        assert!(req.sector_at_mut(99).is_none());
        assert!(req.sector_at_mut(103).is_some());
        assert!(req.sector_at_mut(104).is_none());
    }

    #[test]
    fn media_error_status_carries_lba() {
        let status = RequestStatus::hard_media_error(42, StatusQualifier::None);
        assert_eq!(status.media_error_lba, Some(42));
        assert!(!status.is_success());
    }
}
