//! The error table: an ordered, fixed sequence of records plus the table
//! flags, the derived `err_adj` masks, and the normalized address space the
//! dispatcher matches against.

use rand::Rng;
use serde::{Deserialize, Serialize};

use faultline_types::{BlockCount, Lba, PositionBitmask};

use crate::error::TableError;
use crate::record::{ActiveRecord, ErrorRecord};
use crate::validate::{self, ValidateOptions};

/// Address-space gap added past the highest record before wrapping.
pub const MAX_LBA_GAP: Lba = 100;

/// Chunk granularity the wrap boundary is rounded up to.
pub const CHUNK_SIZE: Lba = 0x800;

/// Correctness class the table claims for its generated faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correctness {
    /// Every generated fault must remain correctable by the RAID level.
    Correctable,
    Uncorrectable,
}

/// Which record kinds the table may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableScope {
    AllRaidTypes,
    /// Permits the bit-level symbol types; positions are translated through
    /// array geometry at match time.
    Raid6Only,
}

/// Table-wide flags. Exclusivity of the flag pairs is structural: each pair
/// is an enum, so a table cannot claim both or neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFlags {
    pub correctness: Correctness,
    pub scope: TableScope,
}

/// Closed-interval intersection test used everywhere ranges are compared.
pub fn overlap(lba_a: Lba, len_a: BlockCount, lba_b: Lba, len_b: BlockCount) -> bool {
    if len_a == 0 || len_b == 0 {
        return false;
    }
    !(lba_b + len_b - 1 < lba_a || lba_a + len_a - 1 < lba_b)
}

/// A validated-or-not error table as configured. Activation (randomize +
/// validate) turns it into an [`ActiveTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTable {
    pub flags: TableFlags,
    pub records: Vec<ErrorRecord>,
}

impl ErrorTable {
    pub fn new(flags: TableFlags, records: Vec<ErrorRecord>) -> Self {
        Self { flags, records }
    }

    /// Loads a table fixture from JSON.
    pub fn from_json(json: &str) -> Result<Self, TableError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, TableError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Recomputes `err_adj` for every record: consecutive runs of records
    /// sharing an identical `(lba, blocks)` range get the union of their
    /// position bitmaps; a run ends at the first record with a different
    /// range.
    pub fn setup_err_adj(&mut self) {
        let n = self.records.len();
        let mut start = 0;
        while start < n {
            let (lba, blocks) = (self.records[start].lba, self.records[start].blocks);
            let mut end = start + 1;
            while end < n && self.records[end].lba == lba && self.records[end].blocks == blocks {
                end += 1;
            }
            let union = self.records[start..end]
                .iter()
                .fold(PositionBitmask::EMPTY, |acc, rec| acc.union(rec.pos_bitmap));
            for rec in &mut self.records[start..end] {
                rec.err_adj = union;
            }
            start = end;
        }
    }

    /// Wrap boundary of the normalized address space: highest `lba + blocks`
    /// plus a gap, rounded up to chunk granularity.
    pub fn max_lba(&self) -> Lba {
        let highest = self
            .records
            .iter()
            .map(|rec| rec.lba + rec.blocks)
            .max()
            .unwrap_or(0);
        let with_gap = highest + MAX_LBA_GAP;
        with_gap.div_ceil(CHUNK_SIZE) * CHUNK_SIZE
    }

    /// Randomizes unresolved fields, recomputes `err_adj`, validates, and
    /// freezes the table for dispatch. An invalid table never activates.
    pub fn activate<R: Rng>(
        mut self,
        options: ValidateOptions,
        rng: &mut R,
    ) -> Result<ActiveTable, TableError> {
        crate::randomize::randomize(&mut self, rng);
        self.setup_err_adj();
        validate::validate(&self, options)?;
        let max_lba = self.max_lba();
        let records = self.records.into_iter().map(ActiveRecord::new).collect();
        Ok(ActiveTable {
            flags: self.flags,
            max_lba,
            records,
        })
    }
}

/// An activated table: immutable shape, per-record locked mode state.
#[derive(Debug)]
pub struct ActiveTable {
    pub flags: TableFlags,
    pub max_lba: Lba,
    pub records: Vec<ActiveRecord>,
}

impl ActiveTable {
    /// Normalizes a request's start LBA into table address space.
    ///
    /// Returns `None` when the range straddles the wrap boundary; a
    /// discontinuous normalized range would alias unrelated records, so
    /// injection is suppressed for the whole request instead.
    pub fn normalize_lba(&self, lba: Lba, blocks: BlockCount) -> Option<Lba> {
        if blocks == 0 {
            return None;
        }
        let end = lba + blocks - 1;
        if end >= self.max_lba && lba < self.max_lba {
            return None;
        }
        Some(lba % self.max_lba)
    }

    pub fn record(&self, index: usize) -> Option<&ActiveRecord> {
        self.records.get(index)
    }

    /// Administrative disable of a contiguous run of records.
    pub fn disable_records(&self, start: usize, count: usize) {
        for rec in self.records.iter().skip(start).take(count) {
            rec.disable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ErrorMode, ErrorType};
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rec(pos: u16, lba: Lba, blocks: BlockCount) -> ErrorRecord {
        ErrorRecord::new(
            PositionBitmask::new(pos),
            lba,
            blocks,
            ErrorType::Crc,
            ErrorMode::Always,
        )
    }

    fn flags() -> TableFlags {
        TableFlags {
            correctness: Correctness::Correctable,
            scope: TableScope::AllRaidTypes,
        }
    }

    #[test]
    fn overlap_basics() {
        assert!(overlap(100, 10, 105, 2));
        assert!(overlap(105, 2, 100, 10));
        assert!(overlap(100, 1, 100, 1));
        assert!(!overlap(100, 10, 110, 10));
        assert!(!overlap(110, 10, 100, 10));
    }

    #[test]
    fn err_adj_unions_colocated_runs() {
        let mut table = ErrorTable::new(
            flags(),
            vec![rec(0b0001, 0, 8), rec(0b0010, 0, 8), rec(0b0100, 8, 8)],
        );
        table.setup_err_adj();
        assert_eq!(table.records[0].err_adj.bits(), 0b0011);
        assert_eq!(table.records[1].err_adj.bits(), 0b0011);
        assert_eq!(table.records[2].err_adj.bits(), 0b0100);
    }

    #[test]
    fn err_adj_run_breaks_on_range_change() {
        // Same lba but different blocks is a different run.
        let mut table = ErrorTable::new(flags(), vec![rec(0b0001, 0, 8), rec(0b0010, 0, 4)]);
        table.setup_err_adj();
        assert_eq!(table.records[0].err_adj.bits(), 0b0001);
        assert_eq!(table.records[1].err_adj.bits(), 0b0010);
    }

    #[test]
    fn max_lba_rounds_to_chunk() {
        let table = ErrorTable::new(flags(), vec![rec(0b0001, 0x1000, 0x10)]);
        // 0x1010 + 100 = 0x1074, rounded up to 0x1800.
        assert_eq!(table.max_lba(), 0x1800);
    }

    #[test]
    fn normalization_wraps_and_suppresses_straddle() {
        let table = ErrorTable::new(flags(), vec![rec(0b0001, 100, 10)])
            .activate(ValidateOptions::default(), &mut SmallRng::seed_from_u64(42))
            .unwrap();
        assert_eq!(table.max_lba, CHUNK_SIZE);
        assert_eq!(table.normalize_lba(100, 10), Some(100));
        assert_eq!(table.normalize_lba(CHUNK_SIZE + 100, 10), Some(100));
        // Straddles the boundary: suppressed.
        assert_eq!(table.normalize_lba(CHUNK_SIZE - 5, 10), None);
    }

    #[test]
    fn json_round_trip() {
        let table = ErrorTable::new(flags(), vec![rec(0b0001, 100, 10)]);
        let json = table.to_json().unwrap();
        let back = ErrorTable::from_json(&json).unwrap();
        assert_eq!(table, back);
    }
}
