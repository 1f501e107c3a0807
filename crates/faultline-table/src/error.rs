//! Configuration errors raised while building, validating, or loading an
//! error table. Every variant names the offending record and field; an
//! invalid table is never activated.

use faultline_types::{BlockCount, PositionBitmask};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("table has no records")]
    EmptyTable,

    #[error("record {index}: block count must be >= 1")]
    ZeroBlockCount { index: usize },

    #[error("record {index}: delay of {delay_ms} ms exceeds limit of {max_ms} ms")]
    DelayTooLong {
        index: usize,
        delay_ms: u32,
        max_ms: u32,
    },

    #[error("record {index}: {mode} mode requires {field} >= 1")]
    ZeroModeLimit {
        index: usize,
        mode: &'static str,
        field: &'static str,
    },

    #[error(
        "record {index}: position bitmap {pos_bitmap} is not a nonempty subset \
         of err_adj {err_adj}"
    )]
    PositionNotInAdjacency {
        index: usize,
        pos_bitmap: PositionBitmask,
        err_adj: PositionBitmask,
    },

    #[error("record {index}: {err_type} cannot target positions {pos_bitmap}")]
    IllegalPosition {
        index: usize,
        err_type: &'static str,
        pos_bitmap: PositionBitmask,
    },

    #[error("record {index}: {err_type} is only legal in a raid6-only table")]
    IllegalTypeForScope { index: usize, err_type: &'static str },

    #[error("record {index}: symbol index {symbol} out of range (max {max})")]
    SymbolOutOfRange { index: usize, symbol: u32, max: u32 },

    #[error(
        "record {index}: S-symbol placement requires logical position {logical_pos} \
         + symbol {symbol} to equal {expected}"
    )]
    BadSymbolPlacement {
        index: usize,
        logical_pos: u32,
        symbol: u32,
        expected: u32,
    },

    #[error(
        "record {index}: bit range [{start_bit}, {start_bit}+{num_bits}) exceeds \
         symbol size {symbol_size}"
    )]
    BitRangeOutOfBounds {
        index: usize,
        start_bit: u32,
        num_bits: u32,
        symbol_size: u32,
    },

    #[error("record {index}: field {field} still marked random at activation")]
    UnresolvedRandom { index: usize, field: &'static str },

    #[error("record {index}: width {width} is not a legal raid6 array width")]
    BadWidth { index: usize, width: u32 },

    #[error("record {index}: lba {lba} + blocks {blocks} overflows the address space")]
    RangeOverflow {
        index: usize,
        lba: u64,
        blocks: BlockCount,
    },

    #[error("failed to parse table fixture: {0}")]
    Parse(#[from] serde_json::Error),
}
