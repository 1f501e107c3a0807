//! Media-error progression per (object, position).
//!
//! A media-type record describes a bad region of the drive. Reads keep
//! hitting the same bad block until a write-verify "remaps" it, which walks
//! the bad block forward one LBA at a time; once the walk leaves the bad
//! region the tracker resets. All addresses here are in table space; the
//! dispatcher translates back to request space before reporting.

use faultline_types::{BlockCount, Lba};

/// First/last bad LBA for one (object, position). `None` means invalid, the
/// reset state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaTracker {
    pub first: Option<Lba>,
    pub last: Option<Lba>,
}

/// What a write-verify overlap did to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteVerifyOutcome {
    /// Inject a media error at this LBA, if any.
    pub inject: Option<Lba>,
    /// The walk advanced one block (a remap happened).
    pub remapped: bool,
    /// The tracker reset to invalid.
    pub cleared: bool,
    /// Where the walk originally started; valid when `cleared`.
    pub walked_from: Option<Lba>,
}

impl MediaTracker {
    /// Read-class overlap with the bad region `[bad_lba, bad_lba + bad_blocks)`.
    ///
    /// If the current bad block still falls inside the region, keep failing
    /// it; otherwise pin the tracker to the region start.
    pub fn on_read(&mut self, bad_lba: Lba, bad_blocks: BlockCount) -> Lba {
        if let Some(last) = self.last {
            if last >= bad_lba && last < bad_lba + bad_blocks {
                return last;
            }
        }
        self.first = Some(bad_lba);
        self.last = Some(bad_lba);
        bad_lba
    }

    /// Write-verify overlap with the bad region. A write-verify that covers
    /// the current bad block simulates a successful remap: the bad block
    /// advances one LBA. Injection continues while the walk stays inside the
    /// region; when the region is exhausted within this request the tracker
    /// clears.
    ///
    /// `pin` keeps the bad block where it is (INJECT_SAME_LBA).
    /// `request_end` is the last table-space LBA of the request, used to
    /// decide whether the region ends inside it.
    ///
    /// The region need not be clipped to the request: a region running past
    /// `request_end` keeps the walk going without clearing. The dispatcher
    /// happens to clip before calling, but the tracker does not rely on it.
    pub fn on_write_verify(
        &mut self,
        bad_lba: Lba,
        bad_blocks: BlockCount,
        request_end: Lba,
        pin: bool,
    ) -> WriteVerifyOutcome {
        let region_end = bad_lba + bad_blocks - 1;
        let mut outcome = WriteVerifyOutcome {
            inject: None,
            remapped: false,
            cleared: false,
            walked_from: None,
        };

        let Some(last) = self.last else {
            return outcome;
        };
        if last < bad_lba || last > region_end {
            return outcome;
        }

        if pin {
            outcome.inject = Some(last);
            return outcome;
        }

        let advanced = last + 1;
        outcome.remapped = true;
        if advanced <= region_end {
            self.last = Some(advanced);
            outcome.inject = Some(advanced);
        } else if region_end <= request_end {
            // The whole bad region has been walked within this request.
            outcome.walked_from = self.first;
            outcome.cleared = true;
            self.first = None;
            self.last = None;
        } else {
            self.last = Some(advanced);
        }
        outcome
    }

    pub fn is_invalid(&self) -> bool {
        self.last.is_none()
    }

    pub fn reset(&mut self) {
        self.first = None;
        self.last = None;
    }
}
