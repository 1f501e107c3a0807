//! RAID-6 bit-level corruption: flip an explicit bit range inside one data
//! symbol (or a 16-bit metadata field) and steer the checksum so the damage
//! lands exactly on the detectability the record asked for.

use faultline_table::{BitParam, ErrorRecord, ErrorType};
use faultline_types::{
    Sector, STAMP_SIZE_BITS, SYMBOL_SIZE_BITS, WORDS_PER_SECTOR, WORDS_PER_SYMBOL, checksum_of,
};

use crate::error::CorruptionError;

/// Test-word values used when perturbing an already-invalidated sector.
/// Flipping the same bits in both halves of one word is checksum-neutral,
/// so the 0xBAD0BAD0 <-> 0xBAD1BAD1 toggle yields a pure coherency error.
const TEST_WORD_NEUTRAL_A: u32 = 0xBAD0_BAD0;
const TEST_WORD_NEUTRAL_B: u32 = 0xBAD1_BAD1;
const TEST_WORD_DETECTABLE: u32 = 0x0000_BAD0;

/// XOR `mask` into the target, thinning it to alternating bits when the
/// record wants the flipped bits non-adjacent. A mask that thins away to
/// nothing keeps its original shape; something must always flip.
fn inject_mask32(word: &mut u32, adjacent: bool, mask: u32) {
    let applied = if adjacent {
        mask
    } else {
        let thinned = mask & 0x5555_5555;
        if thinned == 0 { mask } else { thinned }
    };
    *word ^= applied;
}

fn inject_mask16(value: &mut u16, adjacent: bool, mask: u16) {
    let applied = if adjacent {
        mask
    } else {
        let thinned = mask & 0x5555;
        if thinned == 0 { mask } else { thinned }
    };
    *value ^= applied;
}

struct BitRange {
    start_bit: u32,
    num_bits: u32,
}

fn resolved_range(record: &ErrorRecord, target_size: u32) -> Result<BitRange, CorruptionError> {
    let (Some(start_bit), Some(num_bits)) = (record.start_bit, record.num_bits) else {
        return Err(CorruptionError::MissingBitParams);
    };
    if num_bits == 0 || start_bit >= target_size || start_bit + num_bits > target_size {
        return Err(CorruptionError::BitRangeOutOfBounds {
            start_bit,
            num_bits,
            target_size,
        });
    }
    Ok(BitRange {
        start_bit,
        num_bits,
    })
}

/// Bit-level injection entry point for the symbol and 16-bit types.
pub fn inject_bit_level(sector: &mut Sector, record: &ErrorRecord) -> Result<(), CorruptionError> {
    if record.err_type.is_sixteen_bit_target() {
        inject_sixteen_bit(sector, record)
    } else {
        inject_data_symbol(sector, record)
    }
}

/// Corrupts `[start_bit, start_bit + num_bits)` of the record's symbol in
/// three pieces: leading partial word, whole interior words, trailing
/// partial word. Afterwards the checksum is recomputed per `crc_detectable`.
fn inject_data_symbol(sector: &mut Sector, record: &ErrorRecord) -> Result<(), CorruptionError> {
    if sector.is_invalidated() {
        return perturb_invalidated(sector, record.crc_detectable);
    }

    let range = resolved_range(record, SYMBOL_SIZE_BITS)?;
    let symbol = record.symbol.ok_or(CorruptionError::MissingBitParams)?;
    let symbol_base = (symbol * WORDS_PER_SYMBOL) as usize;
    if symbol_base + WORDS_PER_SYMBOL as usize > WORDS_PER_SECTOR {
        return Err(CorruptionError::SymbolOutOfRange { symbol });
    }

    let crc_orig = sector.crc;
    let adjacent = record.bit_adjacent.is_yes();
    let word_first = (range.start_bit / 32) as usize;
    let bits_first = range.start_bit % 32;

    let width_first = if bits_first == 0 {
        if range.num_bits < 32 { range.num_bits } else { 0 }
    } else {
        range.num_bits.min(32 - bits_first)
    };

    let mut word_index = symbol_base + word_first;
    if width_first != 0 {
        let mask = ((1u32 << width_first) - 1) << bits_first;
        inject_mask32(&mut sector.words[word_index], adjacent, mask);
        word_index += 1;
    }

    let words_middle = (range.num_bits - width_first) / 32;
    for _ in 0..words_middle {
        inject_mask32(&mut sector.words[word_index], adjacent, u32::MAX);
        word_index += 1;
    }

    let width_last = (range.num_bits - width_first) % 32;
    if width_last != 0 {
        let mask = (1u32 << width_last) - 1;
        inject_mask32(&mut sector.words[word_index], adjacent, mask);
    }

    let crc_cooked = checksum_of(&sector.words);
    match record.crc_detectable {
        BitParam::No => {
            // Keep the checksum consistent with the mangled data: the
            // damage is only visible to a verify (coherency error).
            sector.crc = crc_cooked;
        }
        BitParam::Yes | BitParam::Rnd => {
            if crc_cooked == crc_orig {
                // Mask symmetry canceled the checksum change; force one
                // extra flip so the error stays detectable.
                let mask = 1u32 << bits_first;
                inject_mask32(&mut sector.words[symbol_base + word_first], true, mask);
                if checksum_of(&sector.words) == crc_orig {
                    return Err(CorruptionError::ValueUnchanged);
                }
            }
        }
    }
    Ok(())
}

/// 1COD/1COP target the checksum, 1POC targets the LBA stamp. The bit range
/// addresses the 16-bit field directly.
fn inject_sixteen_bit(sector: &mut Sector, record: &ErrorRecord) -> Result<(), CorruptionError> {
    let range = resolved_range(record, STAMP_SIZE_BITS)?;
    let adjacent = record.bit_adjacent.is_yes();
    let is_poc = record.err_type == ErrorType::OnePoc;

    let target = if is_poc {
        &mut sector.lba_stamp
    } else {
        &mut sector.crc
    };
    let value_orig = *target;

    let mask = (((1u32 << range.num_bits) - 1) as u16) << range.start_bit;
    inject_mask16(target, adjacent, mask);
    if *target == value_orig {
        inject_mask16(target, true, 1 << range.start_bit);
    }
    if *target == value_orig {
        return Err(CorruptionError::ValueUnchanged);
    }

    // Multiple records can land on the same sector and cancel out; the base
    // requirement for the checksum types is a checksum that reads bad.
    let crc_cooked = checksum_of(&sector.words);
    if !is_poc && crc_cooked == sector.crc {
        sector.crc = if crc_cooked == 0x0BAD { 0x1BAD } else { 0x0BAD };
    }
    Ok(())
}

/// Coherency error on a parity unit: toggle whole words between the two
/// neutral test patterns, then store the matching checksum. The data no
/// longer agrees with parity, but every per-sector check passes.
pub fn inject_coherency(sector: &mut Sector, record: &ErrorRecord) -> Result<(), CorruptionError> {
    if sector.is_invalidated() {
        return perturb_invalidated(sector, record.crc_detectable);
    }

    // For coherency records the bit parameters address words, not bits.
    let start_word = record.start_bit.unwrap_or(0) as usize;
    let num_words = record.num_bits.unwrap_or(1).max(1) as usize;
    if start_word + num_words > WORDS_PER_SECTOR {
        return Err(CorruptionError::BitRangeOutOfBounds {
            start_bit: start_word as u32,
            num_bits: num_words as u32,
            target_size: WORDS_PER_SECTOR as u32,
        });
    }

    for word in &mut sector.words[start_word..start_word + num_words] {
        *word = if *word == TEST_WORD_NEUTRAL_A {
            TEST_WORD_NEUTRAL_B
        } else {
            TEST_WORD_NEUTRAL_A
        };
    }
    sector.recompute_crc();
    Ok(())
}

/// An already-invalidated sector has no meaningful data to flip, so the
/// reserved test word carries the perturbation instead.
fn perturb_invalidated(
    sector: &mut Sector,
    crc_detectable: BitParam,
) -> Result<(), CorruptionError> {
    let test_word = sector.test_word();
    if crc_detectable == BitParam::No {
        // Checksum-neutral toggle: still a bad crc, now also incoherent.
        let next = if test_word == TEST_WORD_NEUTRAL_A {
            TEST_WORD_NEUTRAL_B
        } else {
            TEST_WORD_NEUTRAL_A
        };
        sector.set_test_word(next);
    } else {
        if test_word == TEST_WORD_DETECTABLE {
            return Err(CorruptionError::TestWordConflict { word: test_word });
        }
        sector.set_test_word(TEST_WORD_DETECTABLE);
    }
    Ok(())
}
