//! Property tests for the range-intersection primitive every matcher leans
//! on.

use faultline_table::overlap;
use proptest::prelude::*;

proptest! {
    #[test]
    fn overlap_is_symmetric(
        lba_a in 0u64..1_000_000,
        len_a in 1u64..10_000,
        lba_b in 0u64..1_000_000,
        len_b in 1u64..10_000,
    ) {
        prop_assert_eq!(
            overlap(lba_a, len_a, lba_b, len_b),
            overlap(lba_b, len_b, lba_a, len_a)
        );
    }

    #[test]
    fn range_overlaps_itself(lba in 0u64..1_000_000, len in 1u64..10_000) {
        prop_assert!(overlap(lba, len, lba, len));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap(lba in 0u64..1_000_000, len in 1u64..10_000) {
        prop_assert!(!overlap(lba, len, lba + len, len));
    }

    #[test]
    fn overlap_matches_interval_model(
        lba_a in 0u64..100_000,
        len_a in 1u64..1_000,
        lba_b in 0u64..100_000,
        len_b in 1u64..1_000,
    ) {
        let model = lba_a.max(lba_b) <= (lba_a + len_a - 1).min(lba_b + len_b - 1);
        prop_assert_eq!(overlap(lba_a, len_a, lba_b, len_b), model);
    }
}
