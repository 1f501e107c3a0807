//! # faultline-corrupt: Sector-corruption recipes
//!
//! Pure, deterministic transformations of one sector image given an error
//! record and the sector's stripe context. Nothing here allocates, performs
//! I/O, or looks at shared state: the same inputs always produce the same
//! corrupted sector.
//!
//! Three recipe families:
//! - **CRC family**: destroy data and/or checksum so reads fail validation.
//! - **Stamp family**: perturb the metadata stamps with position-aware
//!   masks, distinguishing parity columns from data columns.
//! - **RAID-6 bit-level**: flip an explicit bit range inside one symbol (or
//!   a 16-bit metadata field) and steer the checksum so the damage is, or
//!   deliberately is not, detectable.
//!
//! Out-of-range parameters abort the sector with a [`CorruptionError`];
//! recipes never write outside the sector image.

use faultline_table::{ErrorRecord, ErrorType};
use faultline_types::{Lba, Sector, checksum_of};

mod error;
mod raid6;

pub use error::CorruptionError;
pub use raid6::{inject_bit_level, inject_coherency};

/// Why a sector was deliberately invalidated. Stored inside the invalid
/// pattern so verify paths can tell the flavors apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InvalidReason {
    DhInvalidated = 1,
    DataLost = 2,
    Verify = 3,
}

/// Stripe context for the sector being corrupted.
#[derive(Debug, Clone, Copy)]
pub struct SectorTarget {
    /// Physical position of the drive holding this sector.
    pub position: u32,
    /// Whether that position carries parity for this stripe.
    pub is_parity: bool,
    pub array_width: u32,
    /// Bitmask of parity positions within the stripe.
    pub parity_bitmask: u16,
    /// Whether the owning table is raid6-only. RAID-6 treats deliberate
    /// invalidation as expected, so the invalidation recipes skip it.
    pub raid6: bool,
    /// Seed LBA of this sector (request LBA plus offset).
    pub seed: Lba,
}

/// Applies `record`'s corruption recipe to one sector.
///
/// Returns `Ok(true)` when the sector was mutated, `Ok(false)` when the
/// recipe deliberately declined (the RAID-6 invalidation skips).
pub fn corrupt_sector(
    sector: &mut Sector,
    record: &ErrorRecord,
    target: &SectorTarget,
) -> Result<bool, CorruptionError> {
    if target.position >= target.array_width {
        return Err(CorruptionError::PositionOutOfRange {
            position: target.position,
            width: target.array_width,
        });
    }
    match record.err_type {
        ErrorType::Crc | ErrorType::MultiBitCrc => {
            *sector = zeroed_bad_sector();
            Ok(true)
        }
        ErrorType::MultiBitCrcWithLbaStamp => {
            *sector = zeroed_bad_sector();
            sector.lba_stamp = if target.seed == 0xBAD { 0xBAD0 } else { 0xBAD };
            Ok(true)
        }
        ErrorType::SingleBitCrc => {
            *sector = zeroed_bad_sector();
            let crc = checksum_of(&sector.words);
            // Exactly one bit away from the correct checksum.
            sector.crc = crc ^ 0x0001;
            Ok(true)
        }
        ErrorType::KlondikeCrc => {
            *sector = zeroed_bad_sector();
            sector.words[0] = 0xFFFF_FFFF;
            sector.lba_stamp = 0xFFFF;
            sector.write_stamp = 0xFFFF;
            Ok(true)
        }
        ErrorType::DhCrc => {
            fill_invalid(sector, 0, InvalidReason::DhInvalidated);
            Ok(true)
        }
        ErrorType::InvalidatedCrc => {
            if target.raid6 {
                return Ok(false);
            }
            fill_invalid(sector, target.seed, InvalidReason::DataLost);
            Ok(true)
        }
        ErrorType::RaidCrc => {
            if target.raid6 {
                return Ok(false);
            }
            fill_invalid(sector, target.seed, InvalidReason::Verify);
            Ok(true)
        }
        ErrorType::CorruptCrc => {
            if target.raid6 {
                return Ok(false);
            }
            // Only the checksum goes bad; the data is left alone.
            let cooked = checksum_of(&sector.words);
            sector.crc = if cooked == 0x0BAD { 0x1BAD } else { 0x0BAD };
            Ok(true)
        }
        ErrorType::WriteStamp => {
            corrupt_write_stamp(sector, target);
            Ok(true)
        }
        ErrorType::TimeStamp => {
            sector.time_stamp = 0x1BAD;
            if !target.is_parity {
                // A data column's write stamp must agree with the time
                // stamp or this becomes a bogus-stamp error instead.
                sector.write_stamp = 0;
            }
            Ok(true)
        }
        ErrorType::BogusWriteStamp => {
            if target.is_parity {
                sector.write_stamp |= 1 << target.position;
            } else {
                sector.write_stamp = if target.position == 0 { 2 } else { 1 };
            }
            Ok(true)
        }
        ErrorType::BogusTimeStamp => {
            sector.time_stamp = if target.is_parity { 0xFBAD } else { 0x8BAD };
            Ok(true)
        }
        ErrorType::LbaStamp | ErrorType::ShedStamp | ErrorType::BogusShedStamp => {
            corrupt_lba_stamp(sector, record.err_type, target);
            Ok(true)
        }
        ErrorType::OneNs
        | ErrorType::OneS
        | ErrorType::OneR
        | ErrorType::OneD
        | ErrorType::OneCod
        | ErrorType::OneCop
        | ErrorType::OnePoc => {
            inject_bit_level(sector, record)?;
            Ok(true)
        }
        ErrorType::Coherency => {
            inject_coherency(sector, record)?;
            Ok(true)
        }
        other => Err(CorruptionError::NotABufferType {
            err_type: other.name(),
        }),
    }
}

/// Zeroed sector with zeroed metadata, checksum included. The zero checksum
/// is wrong for zero data (the correct one carries the seed), so the read
/// fails validation.
fn zeroed_bad_sector() -> Sector {
    let mut sector = Sector::zeroed();
    sector.crc = 0;
    sector
}

/// Writes the deliberate-invalidation pattern: every word carries the
/// invalid marker, the seed and reason are folded in past the test word, and
/// the checksum is forced bad.
pub fn fill_invalid(sector: &mut Sector, seed: Lba, reason: InvalidReason) {
    for word in &mut sector.words {
        *word = faultline_types::INVALID_PATTERN;
    }
    sector.words[3] = seed as u32;
    sector.words[4] = (seed >> 32) as u32;
    sector.words[5] = reason as u32;
    let cooked = checksum_of(&sector.words);
    sector.crc = !cooked;
    sector.write_stamp = 0;
    sector.time_stamp = 0;
    sector.lba_stamp = 0;
}

fn corrupt_write_stamp(sector: &mut Sector, target: &SectorTarget) {
    let width_mask = ((1u32 << target.array_width) - 1) as u16;
    if target.is_parity {
        // Toggle every data position's stamp bit, then scrub anything a
        // parity sector must not carry.
        let toggle = width_mask & !(1 << target.position);
        sector.write_stamp ^= toggle;
        sector.write_stamp &= width_mask;
        sector.write_stamp &= !target.parity_bitmask;
        sector.time_stamp &= !0x8000;
    } else {
        let own_bit = 1u16 << target.position;
        sector.write_stamp = if sector.write_stamp != 0 {
            sector.write_stamp & !own_bit
        } else {
            own_bit
        };
        sector.time_stamp = 0x7FFF;
    }
}

fn corrupt_lba_stamp(sector: &mut Sector, err_type: ErrorType, target: &SectorTarget) {
    if target.is_parity {
        let own_bit = 1u16 << target.position;
        sector.lba_stamp = if err_type == ErrorType::BogusShedStamp {
            0xFF | own_bit
        } else {
            own_bit
        };
    } else {
        // Dodge the one address whose stamp equals the corruption value.
        sector.lba_stamp = if target.seed as u16 == 0x8BAD {
            0xFBAD
        } else {
            0x8BAD
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_table::{ErrorMode, ErrorRecord};
    use faultline_types::PositionBitmask;

    fn record(err_type: ErrorType) -> ErrorRecord {
        ErrorRecord::new(
            PositionBitmask::new(0b0001),
            0,
            0x10,
            err_type,
            ErrorMode::Always,
        )
    }

    fn data_target(seed: Lba) -> SectorTarget {
        SectorTarget {
            position: 3,
            is_parity: false,
            array_width: 6,
            parity_bitmask: 0b0011,
            raid6: false,
            seed,
        }
    }

    fn parity_target(position: u32) -> SectorTarget {
        SectorTarget {
            position,
            is_parity: true,
            array_width: 6,
            parity_bitmask: 0b0011,
            raid6: false,
            seed: 100,
        }
    }

    #[test]
    fn corruption_is_deterministic() {
        for err_type in [
            ErrorType::Crc,
            ErrorType::MultiBitCrc,
            ErrorType::SingleBitCrc,
            ErrorType::KlondikeCrc,
            ErrorType::WriteStamp,
            ErrorType::TimeStamp,
            ErrorType::LbaStamp,
        ] {
            let mut a = Sector::with_seed(105);
            let mut b = Sector::with_seed(105);
            corrupt_sector(&mut a, &record(err_type), &data_target(105)).unwrap();
            corrupt_sector(&mut b, &record(err_type), &data_target(105)).unwrap();
            assert_eq!(a, b, "{err_type}");
        }
    }

    #[test]
    fn crc_recipe_fails_validation() {
        let mut sector = Sector::with_seed(7);
        corrupt_sector(&mut sector, &record(ErrorType::Crc), &data_target(7)).unwrap();
        assert!(!sector.crc_is_valid());
        assert!(sector.words.iter().all(|w| *w == 0));
    }

    #[test]
    fn single_bit_crc_differs_by_one_bit() {
        let mut sector = Sector::with_seed(7);
        corrupt_sector(&mut sector, &record(ErrorType::SingleBitCrc), &data_target(7)).unwrap();
        let correct = checksum_of(&sector.words);
        assert_eq!((sector.crc ^ correct).count_ones(), 1);
    }

    #[test]
    fn invalidation_skips_raid6() {
        let mut target = data_target(7);
        target.raid6 = true;
        let pristine = Sector::with_seed(7);
        let mut sector = pristine.clone();
        let injected =
            corrupt_sector(&mut sector, &record(ErrorType::InvalidatedCrc), &target).unwrap();
        assert!(!injected);
        assert_eq!(sector, pristine);

        target.raid6 = false;
        let injected =
            corrupt_sector(&mut sector, &record(ErrorType::InvalidatedCrc), &target).unwrap();
        assert!(injected);
        assert!(sector.is_invalidated());
        assert!(!sector.crc_is_valid());
    }

    #[test]
    fn corrupt_crc_leaves_data_alone() {
        let pristine = Sector::with_seed(9);
        let mut sector = pristine.clone();
        corrupt_sector(&mut sector, &record(ErrorType::CorruptCrc), &data_target(9)).unwrap();
        assert_eq!(sector.words, pristine.words);
        assert!(!sector.crc_is_valid());
    }

    #[test]
    fn write_stamp_parity_scrubs_parity_bits() {
        let mut sector = Sector::with_seed(9);
        sector.write_stamp = 0b11_1111;
        sector.time_stamp = 0x8000;
        corrupt_sector(&mut sector, &record(ErrorType::WriteStamp), &parity_target(0)).unwrap();
        assert_eq!(sector.write_stamp & 0b0011, 0);
        assert_eq!(sector.time_stamp & 0x8000, 0);
    }

    #[test]
    fn write_stamp_data_toggles_own_bit() {
        let mut sector = Sector::with_seed(9);
        sector.write_stamp = 0;
        corrupt_sector(&mut sector, &record(ErrorType::WriteStamp), &data_target(9)).unwrap();
        assert_eq!(sector.write_stamp, 1 << 3);
        assert_eq!(sector.time_stamp, 0x7FFF);
    }

    #[test]
    fn lba_stamp_dodges_colliding_seed() {
        let mut sector = Sector::with_seed(0x8BAD);
        corrupt_sector(
            &mut sector,
            &record(ErrorType::LbaStamp),
            &data_target(0x8BAD),
        )
        .unwrap();
        assert_eq!(sector.lba_stamp, 0xFBAD);
    }

    #[test]
    fn media_types_are_rejected() {
        let mut sector = Sector::with_seed(7);
        let err = corrupt_sector(&mut sector, &record(ErrorType::HardMedia), &data_target(7));
        assert!(matches!(err, Err(CorruptionError::NotABufferType { .. })));
    }
}
