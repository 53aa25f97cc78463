//! Address-translation-entry table management: a first-fit range allocator
//! over the internal (on-chip) and external (expansion SRAM) pools, plus the
//! erratum workaround that quiesces bus masters around external-table writes.

use std::ops::Range;

use super::error::{BridgeError, Result};
use super::regs::{AteEntry, DeviceWord};
use super::{BridgeState, SlotId};

/// A contiguous run of table entries handed out by [`AteAllocator`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AteRange {
    /// First entry index; never 0 (0 is the "not found" sentinel).
    pub base: u32,
    pub count: u32,
}

#[derive(Debug)]
struct RangePool {
    start: u32,
    end: u32,
    live: Vec<Range<u32>>,
}

impl RangePool {
    fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            live: Vec::new(),
        }
    }

    fn alloc(&mut self, count: u32) -> Option<u32> {
        let mut candidate = self.start;
        for taken in &self.live {
            if candidate + count <= taken.start {
                break;
            }
            if candidate < taken.end {
                candidate = taken.end;
            }
        }
        if candidate + count > self.end {
            return None;
        }
        let insert_at = self
            .live
            .iter()
            .position(|r| r.start > candidate)
            .unwrap_or(self.live.len());
        self.live.insert(insert_at, candidate..candidate + count);
        Some(candidate)
    }

    fn free(&mut self, base: u32, count: u32) -> bool {
        match self.live.iter().position(|r| *r == (base..base + count)) {
            Some(i) => {
                self.live.remove(i);
                true
            }
            None => false,
        }
    }

    fn contains(&self, index: u32) -> bool {
        index >= self.start && index < self.end
    }
}

/// First-fit allocator over a 1-based entry index space.
///
/// The internal pool is preferred; the external pool (if the board populates
/// expansion SRAM) is only consulted when the internal table is full. Both
/// boundaries are fixed at attach from the probed table sizes.
#[derive(Debug)]
pub struct AteAllocator {
    internal: RangePool,
    external: Option<RangePool>,
}

impl AteAllocator {
    pub fn new(internal_entries: u32, external_entries: u32) -> Self {
        // Entry 0 exists in hardware but is reserved so 0 can mean "no entry".
        let internal = RangePool::new(1, internal_entries);
        let external = (external_entries > 0)
            .then(|| RangePool::new(internal_entries, internal_entries + external_entries));
        Self { internal, external }
    }

    /// Internal first, external as overflow.
    pub fn alloc(&mut self, count: u32) -> Result<AteRange> {
        if count == 0 {
            return Err(BridgeError::InvalidArgument("zero-length ATE request"));
        }
        let base = self
            .internal
            .alloc(count)
            .or_else(|| self.external.as_mut()?.alloc(count));
        match base {
            Some(base) => Ok(AteRange { base, count }),
            None => Err(BridgeError::ResourceExhausted {
                resource: "ATE table",
                wanted: count as usize,
                free: 0,
            }),
        }
    }

    pub fn free(&mut self, range: AteRange) -> Result<()> {
        let matched = if self.internal.contains(range.base) {
            self.internal.free(range.base, range.count)
        } else {
            self.external
                .as_mut()
                .is_some_and(|pool| pool.free(range.base, range.count))
        };
        if matched {
            Ok(())
        } else {
            tracing::warn!(base = range.base, count = range.count, "ATE free does not match any allocation");
            Err(BridgeError::InvalidArgument(
                "ATE free does not match a prior allocation",
            ))
        }
    }

    pub fn is_external(&self, index: u32) -> bool {
        self.external.as_ref().is_some_and(|pool| pool.contains(index))
    }
}

impl BridgeState {
    /// Writes a run of table entries, wrapping externally-backed writes in
    /// the freeze/thaw protocol on affected bridge revisions.
    ///
    /// The erratum: updating any externally-backed entry while any slot has
    /// a DMA in flight through the external table can corrupt unrelated
    /// transfers. Both halves of the workaround run under the one bridge
    /// lock hold the caller already owns, and the frozen window covers only
    /// the table writes themselves.
    pub(crate) fn write_ates(&mut self, updating_slot: SlotId, base: u32, entries: &[AteEntry]) {
        let external = self.ate.is_external(base);

        if external && self.erratum_ext_ate {
            self.write_ates_frozen(base, entries);
        } else {
            for (i, entry) in entries.iter().enumerate() {
                self.hw.set_ate(base + i as u32, *entry);
            }
        }

        if external {
            self.slots[updating_slot.index()].ext_ate_active = true;
        }
    }

    fn write_ates_frozen(&mut self, base: u32, entries: &[AteEntry]) {
        // Freeze: park every slot currently mastering through external ATEs,
        // with a read-back so the clears have landed before the table writes.
        let mut frozen: Vec<SlotId> = Vec::new();
        for slot in SlotId::all() {
            let st = &self.slots[slot.index()];
            if !st.ext_ate_active || !st.device_word.contains(DeviceWord::BUS_MASTER) {
                continue;
            }
            let parked = st.device_word - DeviceWord::BUS_MASTER;
            self.commit_device_word(slot, parked);
            self.hw.ordering_readback(slot);
            frozen.push(slot);
        }

        for (i, entry) in entries.iter().enumerate() {
            self.hw.set_ate(base + i as u32, *entry);
        }

        // Thaw: restore the saved enables, then flush each affected slot's
        // posted writes before mastering resumes.
        for &slot in &frozen {
            let restored = self.slots[slot.index()].device_word | DeviceWord::BUS_MASTER;
            self.commit_device_word(slot, restored);
        }
        for &slot in &frozen {
            self.hw.flush_write_buffer(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_zero_is_never_handed_out() {
        let mut ate = AteAllocator::new(8, 0);
        let range = ate.alloc(1).unwrap();
        assert_ne!(range.base, 0);
    }

    #[test]
    fn internal_pool_fills_before_external() {
        let mut ate = AteAllocator::new(4, 8);
        // Internal pool holds indices 1..4.
        let a = ate.alloc(3).unwrap();
        assert_eq!(a.base, 1);
        assert!(!ate.is_external(a.base));

        let b = ate.alloc(2).unwrap();
        assert!(ate.is_external(b.base));
        assert_eq!(b.base, 4);
    }

    #[test]
    fn freed_range_can_be_reallocated_at_the_same_base() {
        let mut ate = AteAllocator::new(16, 0);
        let a = ate.alloc(5).unwrap();
        let b = ate.alloc(5).unwrap();
        ate.free(a).unwrap();
        let c = ate.alloc(5).unwrap();
        assert_eq!(c.base, a.base);
        assert_ne!(c.base, b.base);
    }

    #[test]
    fn live_ranges_never_overlap() {
        let mut ate = AteAllocator::new(16, 16);
        let mut held = Vec::new();
        while let Ok(range) = ate.alloc(3) {
            held.push(range);
        }
        for (i, a) in held.iter().enumerate() {
            for b in &held[i + 1..] {
                let disjoint = a.base + a.count <= b.base || b.base + b.count <= a.base;
                assert!(disjoint, "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn mismatched_free_is_rejected() {
        let mut ate = AteAllocator::new(16, 0);
        let a = ate.alloc(4).unwrap();
        assert!(ate
            .free(AteRange {
                base: a.base,
                count: 2
            })
            .is_err());
        ate.free(a).unwrap();
    }

    #[test]
    fn exhaustion_reports_rather_than_wrapping() {
        let mut ate = AteAllocator::new(4, 0);
        assert!(ate.alloc(3).is_ok());
        assert!(matches!(
            ate.alloc(2),
            Err(BridgeError::ResourceExhausted { .. })
        ));
    }
}
