//! The 520-byte sector model: 512 bytes of data plus 8 bytes of metadata
//! (checksum, time stamp, write stamp, LBA stamp).
//!
//! Corruption recipes operate on this structure directly, so the layout keeps
//! the data as 32-bit words the way the RAID stack addresses them.

use crate::Lba;

/// Data words per sector (512 bytes).
pub const WORDS_PER_SECTOR: usize = 128;

/// Seed folded into every sector checksum.
pub const CHECKSUM_SEED: u16 = 0x5EED;

/// Word pattern marking a deliberately invalidated sector.
pub const INVALID_PATTERN: u32 = 0xBAD0_BAD0;

/// Word index of the test word inside an invalidated sector. Bit-level
/// corruption of an already-invalidated sector perturbs this word instead of
/// the (meaningless) data.
pub const TEST_WORD_INDEX: usize = 2;

/// XOR checksum over the sector data, folded to 16 bits.
///
/// The fold XORs the high and low halves of the raw accumulator, so a
/// mutation that flips the same bits in both halves of one word is
/// checksum-neutral. The coherency recipes depend on that property.
pub fn checksum_of(words: &[u32; WORDS_PER_SECTOR]) -> u16 {
    let mut acc: u32 = 0;
    for word in words {
        acc ^= *word;
    }
    (((acc >> 16) ^ acc) as u16) ^ CHECKSUM_SEED
}

/// LBA stamp: the logical address folded to 16 bits. Zero is reserved to
/// mean "no stamp", so a fold of zero maps to the all-ones stamp.
pub fn lba_stamp_of(lba: Lba) -> u16 {
    let folded = (lba ^ (lba >> 16) ^ (lba >> 32) ^ (lba >> 48)) as u16;
    if folded == 0 { 0xFFFF } else { folded }
}

/// One sector as the corruption engine sees it. Sectors are in-memory
/// buffers, not fixture data, so the struct stays out of serde.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sector {
    /// 512 bytes of data as 32-bit words.
    pub words: [u32; WORDS_PER_SECTOR],
    /// Data checksum.
    pub crc: u16,
    /// Write-stamp metadata (per-position bits on parity, own bit on data).
    pub write_stamp: u16,
    /// Time-stamp metadata.
    pub time_stamp: u16,
    /// Folded logical address.
    pub lba_stamp: u16,
}

impl Sector {
    /// All-zero sector with a correct checksum and no stamps.
    pub fn zeroed() -> Self {
        let words = [0u32; WORDS_PER_SECTOR];
        let crc = checksum_of(&words);
        Self {
            words,
            crc,
            write_stamp: 0,
            time_stamp: 0,
            lba_stamp: 0,
        }
    }

    /// Deterministic valid sector for the given logical address. Data is a
    /// simple function of the LBA so tests can regenerate the pristine image.
    pub fn with_seed(lba: Lba) -> Self {
        let mut words = [0u32; WORDS_PER_SECTOR];
        for (i, word) in words.iter_mut().enumerate() {
            *word = (lba as u32).wrapping_mul(0x9E37_79B9).wrapping_add(i as u32);
        }
        let crc = checksum_of(&words);
        Self {
            words,
            crc,
            write_stamp: 0,
            time_stamp: 0,
            lba_stamp: lba_stamp_of(lba),
        }
    }

    /// Recomputes and stores the checksum for the current data.
    pub fn recompute_crc(&mut self) {
        self.crc = checksum_of(&self.words);
    }

    /// Whether the checksum matches the data.
    pub fn crc_is_valid(&self) -> bool {
        self.crc == checksum_of(&self.words)
    }

    /// Whether the sector carries the deliberate-invalidation pattern.
    pub fn is_invalidated(&self) -> bool {
        self.words[0] == INVALID_PATTERN && self.words[1] == INVALID_PATTERN
    }

    /// Test word of an invalidated sector.
    pub fn test_word(&self) -> u32 {
        self.words[TEST_WORD_INDEX]
    }

    pub fn set_test_word(&mut self, value: u32) {
        self.words[TEST_WORD_INDEX] = value;
    }
}

impl Default for Sector {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let a = Sector::with_seed(100);
        let b = Sector::with_seed(100);
        assert_eq!(a, b);
        assert!(a.crc_is_valid());
    }

    #[test]
    fn checksum_detects_single_word_change() {
        let mut sector = Sector::with_seed(7);
        sector.words[17] ^= 1;
        assert!(!sector.crc_is_valid());
    }

    #[test]
    fn lba_stamp_never_zero() {
        assert_ne!(lba_stamp_of(0), 0);
        // An lba whose folds cancel still stamps non-zero.
        let lba = 0x0001_0001_0001_0001_u64;
        assert_ne!(lba_stamp_of(lba), 0);
    }

    #[test]
    fn seeded_sectors_differ_by_lba() {
        assert_ne!(Sector::with_seed(1).words, Sector::with_seed(2).words);
    }
}
