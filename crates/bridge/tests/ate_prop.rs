use proptest::prelude::*;

use xfab_bridge::bridge::{AteAllocator, AteRange};

fn disjoint(a: &AteRange, b: &AteRange) -> bool {
    a.base + a.count <= b.base || b.base + b.count <= a.base
}

proptest! {
    /// Random alloc/free interleavings: live ranges never overlap, index 0
    /// is never handed out, and nothing leaks permanently.
    #[test]
    fn alloc_free_interleavings_stay_disjoint(
        ops in prop::collection::vec((1u32..6, any::<bool>()), 1..64),
    ) {
        let mut ate = AteAllocator::new(32, 32);
        let mut live: Vec<AteRange> = Vec::new();

        for (count, free_first) in ops {
            if free_first && !live.is_empty() {
                let range = live.remove(0);
                prop_assert!(ate.free(range).is_ok());
            } else if let Ok(range) = ate.alloc(count) {
                prop_assert!(range.base != 0);
                prop_assert_eq!(range.count, count);
                for other in &live {
                    prop_assert!(disjoint(&range, other), "{:?} overlaps {:?}", range, other);
                }
                live.push(range);
            }
        }

        // Releasing everything restores full capacity: the internal pool
        // holds 31 usable entries (index 0 reserved).
        for range in live.drain(..) {
            prop_assert!(ate.free(range).is_ok());
        }
        prop_assert!(ate.alloc(31).is_ok());
    }

    /// Free-then-realloc of the same size can land on the same base
    /// (no permanent fragmentation at the first-fit frontier).
    #[test]
    fn freed_prefix_is_immediately_reusable(count in 1u32..16) {
        let mut ate = AteAllocator::new(64, 0);
        let first = ate.alloc(count).unwrap();
        let second = ate.alloc(count).unwrap();
        prop_assert!(disjoint(&first, &second));

        ate.free(first).unwrap();
        let third = ate.alloc(count).unwrap();
        prop_assert_eq!(third.base, first.base);
        ate.free(second).unwrap();
        ate.free(third).unwrap();
    }
}
