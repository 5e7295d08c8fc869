//! Property tests for DNA range parsing and overlap detection

use proptest::prelude::*;
use replicactl::range::{overlaps, validate, IdRange, MAX_ID};

/// Small closed interval, possibly inverted
fn interval() -> impl Strategy<Value = (u64, u64)> {
    (0u64..60, 0u64..60)
}

fn point_overlap(a: (u64, u64), b: (u64, u64)) -> bool {
    (a.0..=a.1).any(|x| (b.0..=b.1).contains(&x))
}

proptest! {
    #[test]
    fn overlap_is_symmetric(a in interval(), b in interval()) {
        prop_assert_eq!(overlaps(a.0, a.1, b.0, b.1), overlaps(b.0, b.1, a.0, a.1));
    }

    #[test]
    fn overlap_matches_shared_point(a in interval(), b in interval()) {
        prop_assume!(a.0 <= a.1 && b.0 <= b.1);
        prop_assert_eq!(overlaps(a.0, a.1, b.0, b.1), point_overlap(a, b));
    }

    #[test]
    fn valid_ranges_parse_back(start in 1u32..MAX_ID - 1, len in 1u32..10_000) {
        let end = start.saturating_add(len).min(MAX_ID - 1);
        prop_assume!(start < end);
        let range = validate(&format!("{}-{}", start, end), false).unwrap();
        prop_assert_eq!(range, IdRange::new(start, end));
        prop_assert_eq!(validate(&range.to_string(), true).unwrap(), range);
    }

    #[test]
    fn inverted_or_empty_ranges_are_rejected(start in 1u32..100_000, back in 0u32..1000) {
        let end = start.saturating_sub(back).max(1);
        let text = format!("{}-{}", start, end);
        prop_assert!(validate(&text, false).is_err());
        prop_assert!(validate(&text, true).is_err());
    }

    #[test]
    fn out_of_bounds_endpoints_are_rejected(start in 1u32..1000, over in 0u64..1000) {
        let end = MAX_ID as u64 + over;
        let too_high = format!("{}-{}", start, end);
        let from_zero = format!("0-{}", start);
        prop_assert!(validate(&too_high, false).is_err());
        prop_assert!(validate(&from_zero, false).is_err());
    }

    #[test]
    fn garbage_is_rejected(text in "[a-z ]{0,12}") {
        prop_assert!(validate(&text, true).is_err());
    }
}

#[test]
fn zero_range_only_when_allowed() {
    assert!(validate("0-0", false).is_err());
    assert!(validate("0-0", true).unwrap().is_empty_marker());
}
