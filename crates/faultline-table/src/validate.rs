//! Table validation. Walks every record and rejects the table on the first
//! illegal field, naming the record index and field in the error.

use faultline_types::{RaidGeometry, SYMBOL_SIZE_BITS, SYMBOLS_PER_SECTOR, STAMP_SIZE_BITS};

use crate::error::TableError;
use crate::record::{ErrorMode, ErrorRecord, ErrorType, MAX_DELAY_MS};
use crate::table::{ErrorTable, TableScope};

/// Engine-level knobs that change what a table may legally contain.
#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    /// Whether parity-of-checksum (1POC) records are permitted.
    pub poc_injection: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            poc_injection: true,
        }
    }
}

/// Validates the whole table. `err_adj` must already be up to date; callers
/// go through [`ErrorTable::activate`], which recomputes it first.
pub fn validate(table: &ErrorTable, options: ValidateOptions) -> Result<(), TableError> {
    if table.records.is_empty() {
        return Err(TableError::EmptyTable);
    }
    for (index, record) in table.records.iter().enumerate() {
        validate_record(index, record, table.flags.scope, options)?;
    }
    Ok(())
}

fn validate_record(
    index: usize,
    record: &ErrorRecord,
    scope: TableScope,
    options: ValidateOptions,
) -> Result<(), TableError> {
    if record.blocks == 0 {
        return Err(TableError::ZeroBlockCount { index });
    }
    if record.lba.checked_add(record.blocks).is_none() {
        return Err(TableError::RangeOverflow {
            index,
            lba: record.lba,
            blocks: record.blocks,
        });
    }

    if matches!(record.err_type, ErrorType::DelayDown | ErrorType::DelayUp)
        && record.err_limit > MAX_DELAY_MS
    {
        return Err(TableError::DelayTooLong {
            index,
            delay_ms: record.err_limit,
            max_ms: MAX_DELAY_MS,
        });
    }

    match record.err_mode {
        ErrorMode::Skip | ErrorMode::SkipInsert => {
            if record.skip_limit == 0 {
                return Err(TableError::ZeroModeLimit {
                    index,
                    mode: record.err_mode.name(),
                    field: "skip_limit",
                });
            }
            if record.err_limit == 0 {
                return Err(TableError::ZeroModeLimit {
                    index,
                    mode: record.err_mode.name(),
                    field: "err_limit",
                });
            }
        }
        ErrorMode::Count if record.err_limit == 0 => {
            return Err(TableError::ZeroModeLimit {
                index,
                mode: record.err_mode.name(),
                field: "err_limit",
            });
        }
        _ => {}
    }

    if record.err_type.is_raid6_bit_level() {
        if scope != TableScope::Raid6Only {
            return Err(TableError::IllegalTypeForScope {
                index,
                err_type: record.err_type.name(),
            });
        }
        validate_raid6(index, record, options)
    } else {
        validate_all_types(index, record)
    }
}

/// All-types legality: the position bitmap must be a nonempty subset of the
/// adjacency union, so a correctable table cannot silently fault more
/// positions at one range than it declared.
fn validate_all_types(index: usize, record: &ErrorRecord) -> Result<(), TableError> {
    if record.pos_bitmap.is_empty() || !record.pos_bitmap.is_subset_of(record.err_adj) {
        return Err(TableError::PositionNotInAdjacency {
            index,
            pos_bitmap: record.pos_bitmap,
            err_adj: record.err_adj,
        });
    }
    Ok(())
}

/// Bit-level legality: the position must suit the error type's stripe role,
/// the symbol index must be in range (and placement-constrained for the S
/// symbol), and the bit range must fit the target's size.
fn validate_raid6(
    index: usize,
    record: &ErrorRecord,
    options: ValidateOptions,
) -> Result<(), TableError> {
    let geometry = RaidGeometry::new(record.width)
        .map_err(|_| TableError::BadWidth {
            index,
            width: record.width,
        })?;

    let pos = record.pos_bitmap;
    let illegal = |err_type: ErrorType| TableError::IllegalPosition {
        index,
        err_type: err_type.name(),
        pos_bitmap: pos,
    };

    let legal_mask = match record.err_type {
        ErrorType::OneR => geometry.row_parity_mask(),
        ErrorType::OneD => geometry.diag_parity_mask(),
        ErrorType::OneCop => geometry.parity_mask(),
        ErrorType::OnePoc => {
            if !options.poc_injection {
                // POC records are only usable when the engine has POC
                // injection turned on; otherwise they must target nothing.
                if !pos.is_empty() {
                    return Err(illegal(ErrorType::OnePoc));
                }
                return validate_bit_range(index, record);
            }
            geometry.parity_mask()
        }
        ErrorType::OneNs | ErrorType::OneCod => geometry.data_mask(),
        ErrorType::OneS => geometry.s_data_mask(),
        _ => unreachable!("validate_raid6 called for non bit-level type"),
    };

    if pos.count() != 1 || !pos.is_subset_of(legal_mask) {
        return Err(illegal(record.err_type));
    }

    if !record.err_type.is_sixteen_bit_target() {
        let symbol = record
            .symbol
            .ok_or(TableError::UnresolvedRandom {
                index,
                field: "symbol",
            })?;
        if symbol >= SYMBOLS_PER_SECTOR {
            return Err(TableError::SymbolOutOfRange {
                index,
                symbol,
                max: SYMBOLS_PER_SECTOR - 1,
            });
        }
        if record.err_type == ErrorType::OneS {
            // The S symbol's index is pinned by its column: logical data
            // position p holds the S symbol at index SYMBOLS_PER_SECTOR - p.
            let position = pos.bits().trailing_zeros();
            let logical_pos = position - 2;
            if logical_pos + symbol != SYMBOLS_PER_SECTOR {
                return Err(TableError::BadSymbolPlacement {
                    index,
                    logical_pos,
                    symbol,
                    expected: SYMBOLS_PER_SECTOR,
                });
            }
        }
    }

    validate_bit_range(index, record)
}

fn validate_bit_range(index: usize, record: &ErrorRecord) -> Result<(), TableError> {
    let symbol_size = if record.err_type.is_sixteen_bit_target() {
        STAMP_SIZE_BITS
    } else {
        SYMBOL_SIZE_BITS
    };
    let start_bit = record.start_bit.ok_or(TableError::UnresolvedRandom {
        index,
        field: "start_bit",
    })?;
    let num_bits = record.num_bits.ok_or(TableError::UnresolvedRandom {
        index,
        field: "num_bits",
    })?;
    if num_bits == 0 || start_bit >= symbol_size || start_bit + num_bits > symbol_size {
        return Err(TableError::BitRangeOutOfBounds {
            index,
            start_bit,
            num_bits,
            symbol_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BitParam;
    use crate::table::{Correctness, TableFlags};
    use faultline_types::PositionBitmask;

    fn raid6_flags() -> TableFlags {
        TableFlags {
            correctness: Correctness::Correctable,
            scope: TableScope::Raid6Only,
        }
    }

    fn all_flags() -> TableFlags {
        TableFlags {
            correctness: Correctness::Correctable,
            scope: TableScope::AllRaidTypes,
        }
    }

    fn bit_record(err_type: ErrorType, pos: u16) -> ErrorRecord {
        ErrorRecord::new(
            PositionBitmask::new(pos),
            0,
            0x10,
            err_type,
            ErrorMode::Always,
        )
        .with_width(6)
        .with_bits(0, 4, 8)
        .with_bit_params(BitParam::Yes, BitParam::Yes)
    }

    fn validated(mut table: ErrorTable) -> Result<(), TableError> {
        table.setup_err_adj();
        validate(&table, ValidateOptions::default())
    }

    #[test]
    fn empty_table_is_invalid() {
        let table = ErrorTable::new(all_flags(), vec![]);
        assert!(matches!(validated(table), Err(TableError::EmptyTable)));
    }

    #[test]
    fn zero_blocks_is_invalid() {
        let mut rec = bit_record(ErrorType::OneR, 0b0001);
        rec.blocks = 0;
        let table = ErrorTable::new(raid6_flags(), vec![rec]);
        assert!(matches!(
            validated(table),
            Err(TableError::ZeroBlockCount { index: 0 })
        ));
    }

    #[test]
    fn row_parity_type_must_sit_on_row_parity() {
        let table = ErrorTable::new(raid6_flags(), vec![bit_record(ErrorType::OneR, 0b0100)]);
        assert!(matches!(
            validated(table),
            Err(TableError::IllegalPosition { index: 0, .. })
        ));
        let table = ErrorTable::new(raid6_flags(), vec![bit_record(ErrorType::OneR, 0b0001)]);
        assert!(validated(table).is_ok());
    }

    #[test]
    fn s_symbol_placement_is_pinned() {
        // Position 5 (logical 3) must use symbol 13.
        let mut rec = bit_record(ErrorType::OneS, 0b10_0000);
        rec.symbol = Some(13);
        let table = ErrorTable::new(raid6_flags(), vec![rec.clone()]);
        assert!(validated(table).is_ok());

        rec.symbol = Some(12);
        let table = ErrorTable::new(raid6_flags(), vec![rec]);
        assert!(matches!(
            validated(table),
            Err(TableError::BadSymbolPlacement { index: 0, .. })
        ));
    }

    #[test]
    fn bit_range_must_fit_target() {
        let mut rec = bit_record(ErrorType::OneCod, 0b0100);
        rec.start_bit = Some(10);
        rec.num_bits = Some(10);
        // 16-bit target: 10 + 10 > 16.
        let table = ErrorTable::new(raid6_flags(), vec![rec.clone()]);
        assert!(matches!(
            validated(table),
            Err(TableError::BitRangeOutOfBounds { index: 0, .. })
        ));

        // Same range fits a 256-bit data symbol.
        rec.err_type = ErrorType::OneNs;
        let table = ErrorTable::new(raid6_flags(), vec![rec]);
        assert!(validated(table).is_ok());
    }

    #[test]
    fn bit_level_types_rejected_outside_raid6_scope() {
        let table = ErrorTable::new(all_flags(), vec![bit_record(ErrorType::OneNs, 0b0100)]);
        assert!(matches!(
            validated(table),
            Err(TableError::IllegalTypeForScope { index: 0, .. })
        ));
    }

    #[test]
    fn all_types_position_must_stay_inside_err_adj() {
        // Two co-located records union to 0b0011; a third record at the same
        // range keeps the invariant, but a hand-corrupted err_adj fails.
        let mut table = ErrorTable::new(
            all_flags(),
            vec![
                ErrorRecord::new(
                    PositionBitmask::new(0b0001),
                    0,
                    8,
                    ErrorType::Crc,
                    ErrorMode::Always,
                ),
                ErrorRecord::new(
                    PositionBitmask::new(0b0010),
                    0,
                    8,
                    ErrorType::Crc,
                    ErrorMode::Always,
                ),
            ],
        );
        table.setup_err_adj();
        assert!(validate(&table, ValidateOptions::default()).is_ok());

        table.records[0].err_adj = PositionBitmask::new(0b0010);
        assert!(matches!(
            validate(&table, ValidateOptions::default()),
            Err(TableError::PositionNotInAdjacency { index: 0, .. })
        ));
    }

    #[test]
    fn poc_requires_poc_injection() {
        let rec = bit_record(ErrorType::OnePoc, 0b0010);
        let table = {
            let mut t = ErrorTable::new(raid6_flags(), vec![rec]);
            t.setup_err_adj();
            t
        };
        assert!(validate(&table, ValidateOptions::default()).is_ok());
        let no_poc = ValidateOptions {
            poc_injection: false,
        };
        assert!(matches!(
            validate(&table, no_poc),
            Err(TableError::IllegalPosition { index: 0, .. })
        ));
    }

    #[test]
    fn delay_limit_is_bounded() {
        let mut rec = ErrorRecord::new(
            PositionBitmask::new(0b0001),
            0,
            8,
            ErrorType::DelayDown,
            ErrorMode::Always,
        );
        rec.err_limit = MAX_DELAY_MS + 1;
        let table = ErrorTable::new(all_flags(), vec![rec]);
        assert!(matches!(
            validated(table),
            Err(TableError::DelayTooLong { index: 0, .. })
        ));
    }
}
