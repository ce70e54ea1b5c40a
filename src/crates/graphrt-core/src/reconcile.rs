//! Address-range reconciliation after a physical relocation
//!
//! When backing memory is relocated underneath loaded graphs, every touched
//! model reports the inclusive virtual ranges it re-pointed. The relocation is
//! accepted only if those ranges, once merged, cover the requested window
//! exactly.

use crate::error::{Result, SessionError};

/// Stateless merger and coverage checker for inclusive `(start, end)` ranges
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressRangeReconciler;

impl AddressRangeReconciler {
    /// Merge overlapping or adjacent inclusive ranges.
    ///
    /// The result is sorted by start and pairwise disjoint with gaps of at
    /// least one address between ranges.
    pub fn merge(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
        ranges.sort_unstable_by_key(|r| r.0);

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        merged
    }

    /// Check that `ranges` cover exactly `[va, va + len - 1]`
    pub fn reconcile(va: u64, len: u64, ranges: Vec<(u64, u64)>) -> Result<()> {
        if len == 0 {
            return Err(SessionError::InvalidParameter(
                "remap window length is zero".to_string(),
            ));
        }
        if ranges.is_empty() {
            return Err(SessionError::InvalidParameter(format!(
                "no graph remapped any part of [{:#x}, +{:#x})",
                va, len
            )));
        }

        let last = va.checked_add(len - 1).ok_or_else(|| {
            SessionError::InvalidParameter(format!("remap window {:#x}+{:#x} overflows", va, len))
        })?;

        let merged = Self::merge(ranges);
        match merged.as_slice() {
            [(start, end)] if *start == va && *end == last => Ok(()),
            _ => Err(SessionError::InvalidParameter(format!(
                "remapped ranges {:?} do not cover [{:#x}, {:#x}]",
                merged, va, last
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_merge_adjacent_and_overlapping() {
        let merged = AddressRangeReconciler::merge(vec![(10, 20), (21, 30), (5, 9)]);
        assert_eq!(merged, vec![(5, 30)]);

        let merged = AddressRangeReconciler::merge(vec![(0, 10), (3, 4), (8, 15), (40, 50)]);
        assert_eq!(merged, vec![(0, 15), (40, 50)]);
    }

    #[test]
    fn test_full_coverage_accepted() {
        assert!(AddressRangeReconciler::reconcile(5, 26, vec![(10, 20), (21, 30), (5, 9)]).is_ok());
    }

    #[test]
    fn test_gap_rejected() {
        let err = AddressRangeReconciler::reconcile(5, 26, vec![(10, 20), (25, 30)]).unwrap_err();
        assert!(matches!(err, SessionError::InvalidParameter(_)));
    }

    #[test]
    fn test_single_range_with_wrong_bounds_rejected() {
        assert!(AddressRangeReconciler::reconcile(5, 26, vec![(5, 29)]).is_err());
        assert!(AddressRangeReconciler::reconcile(5, 26, vec![(4, 30)]).is_err());
    }

    #[test]
    fn test_empty_and_zero_length_rejected() {
        assert!(AddressRangeReconciler::reconcile(5, 26, vec![]).is_err());
        assert!(AddressRangeReconciler::reconcile(5, 0, vec![(5, 5)]).is_err());
    }

    #[test]
    fn test_top_of_address_space() {
        assert!(AddressRangeReconciler::reconcile(u64::MAX, 1, vec![(u64::MAX, u64::MAX)]).is_ok());
        assert!(AddressRangeReconciler::reconcile(u64::MAX, 2, vec![(u64::MAX, u64::MAX)]).is_err());
    }

    proptest! {
        #[test]
        fn prop_merge_is_sorted_and_disjoint(
            ranges in prop::collection::vec((0u64..1000, 0u64..50), 0..32)
        ) {
            let ranges: Vec<(u64, u64)> = ranges.into_iter().map(|(s, w)| (s, s + w)).collect();
            let merged = AddressRangeReconciler::merge(ranges.clone());

            for pair in merged.windows(2) {
                prop_assert!(pair[0].1 + 1 < pair[1].0);
            }
            for (s, e) in ranges {
                prop_assert!(merged.iter().any(|(ms, me)| *ms <= s && e <= *me));
            }
        }

        #[test]
        fn prop_contiguous_split_covers_window(
            va in 0u64..1_000_000,
            cuts in prop::collection::btree_set(1u64..999, 0..8)
        ) {
            let len = 1000u64;
            let mut bounds = vec![0u64];
            bounds.extend(cuts);
            bounds.push(len);

            let mut ranges: Vec<(u64, u64)> = bounds
                .windows(2)
                .map(|w| (va + w[0], va + w[1] - 1))
                .collect();
            ranges.reverse();

            prop_assert!(AddressRangeReconciler::reconcile(va, len, ranges).is_ok());
        }
    }
}
