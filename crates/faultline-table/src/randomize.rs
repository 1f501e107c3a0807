//! Randomization of table fields marked "pick for me". Runs before
//! validation at activation time, so every choice must land on a legal
//! value.

use rand::Rng;

use faultline_types::{
    PositionBitmask, RaidGeometry, SYMBOL_SIZE_BITS, SYMBOLS_PER_SECTOR, STAMP_SIZE_BITS,
};

use crate::record::{BitParam, ErrorRecord, ErrorType};
use crate::table::ErrorTable;

/// Fills every unresolved random field in the table.
///
/// Only the raid6 bit-level types carry random fields; other records pass
/// through untouched. `err_adj` is stale afterwards and must be recomputed.
pub fn randomize<R: Rng>(table: &mut ErrorTable, rng: &mut R) {
    for record in &mut table.records {
        if record.err_type.is_raid6_bit_level() {
            randomize_record(record, rng);
        }
    }
}

fn randomize_record<R: Rng>(record: &mut ErrorRecord, rng: &mut R) {
    let Ok(geometry) = RaidGeometry::new(record.width) else {
        // An illegal width fails validation right after; nothing to pick.
        return;
    };

    if record.pos_bitmap.is_empty() {
        record.pos_bitmap = random_position(record.err_type, geometry, rng);
    }

    if !record.err_type.is_sixteen_bit_target() && record.symbol.is_none() {
        record.symbol = random_symbol(record, rng);
    }

    let symbol_size = if record.err_type.is_sixteen_bit_target() {
        STAMP_SIZE_BITS
    } else {
        SYMBOL_SIZE_BITS
    };
    match (record.start_bit, record.num_bits) {
        (None, None) => {
            let start = rng.gen_range(0..symbol_size);
            let num = rng.gen_range(1..=symbol_size - start);
            record.start_bit = Some(start);
            record.num_bits = Some(num);
        }
        (None, Some(num)) if num >= 1 && num <= symbol_size => {
            record.start_bit = Some(rng.gen_range(0..=symbol_size - num));
        }
        (Some(start), None) if start < symbol_size => {
            record.num_bits = Some(rng.gen_range(1..=symbol_size - start));
        }
        // Fixed (or unsatisfiable) combinations go to the validator as-is.
        _ => {}
    }

    if record.bit_adjacent == BitParam::Rnd {
        record.bit_adjacent = if rng.gen_range(0..2) == 0 {
            BitParam::No
        } else {
            BitParam::Yes
        };
    }
    if record.crc_detectable == BitParam::Rnd {
        record.crc_detectable = if rng.gen_range(0..2) == 0 {
            BitParam::No
        } else {
            BitParam::Yes
        };
    }
}

fn random_position<R: Rng>(
    err_type: ErrorType,
    geometry: RaidGeometry,
    rng: &mut R,
) -> PositionBitmask {
    match err_type {
        ErrorType::OneR => geometry.row_parity_mask(),
        ErrorType::OneD => geometry.diag_parity_mask(),
        ErrorType::OneCop | ErrorType::OnePoc => PositionBitmask::single(rng.gen_range(0..2)),
        ErrorType::OneNs | ErrorType::OneCod => {
            PositionBitmask::single(2 + rng.gen_range(0..geometry.data_columns()))
        }
        ErrorType::OneS => {
            // Logical data index must be > 0; width 3 arrays have no legal
            // S column, which the validator reports.
            if geometry.data_columns() <= 1 {
                PositionBitmask::EMPTY
            } else {
                PositionBitmask::single(3 + rng.gen_range(0..geometry.data_columns() - 1))
            }
        }
        _ => unreachable!("random_position called for non bit-level type"),
    }
}

fn random_symbol<R: Rng>(record: &ErrorRecord, rng: &mut R) -> Option<u32> {
    if record.err_type == ErrorType::OneS && !record.pos_bitmap.is_empty() {
        // Pinned by column: logical position p holds the S symbol at
        // SYMBOLS_PER_SECTOR - p. A fixed position below the first legal S
        // column stays unresolved; the validator rejects it.
        let physical = record.pos_bitmap.bits().trailing_zeros();
        if physical < 3 {
            return None;
        }
        Some(SYMBOLS_PER_SECTOR - (physical - 2))
    } else {
        Some(rng.gen_range(0..SYMBOLS_PER_SECTOR))
    }
}
