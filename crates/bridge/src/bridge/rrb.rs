//! Response-buffer pool management.
//!
//! Each parity class (even/odd slots) owns eight buffers described by one
//! map register. Ownership moves between slots only through the routines
//! here, which keep the hardware map and the soft accounting in step under
//! the bridge lock.

use super::error::{BridgeError, Result};
use super::regs::RRB_PER_PARITY;
use super::{BridgeState, RrbParity, SlotId, Vchan};

/// Snapshot returned by `rrb_check`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RrbCounts {
    pub chan0: usize,
    pub chan1: usize,
    /// Buffers reserved for this slot at attach, not yet claimed.
    pub reserved: usize,
    /// Unreserved buffers free in the slot's parity class.
    pub pool_free: usize,
}

/// Picks which channel's target shrinks when a rebalance request exceeds the
/// free pool: the numerically larger target, ties against the secondary
/// channel. A single point of change should the policy ever become tunable.
fn trim_victim(want0: usize, want1: usize) -> Vchan {
    if want0 > want1 {
        Vchan::Primary
    } else {
        Vchan::Secondary
    }
}

impl BridgeState {
    pub(crate) fn rrb_count_valid(&self, slot: SlotId, vchan: Vchan) -> usize {
        usize::from(self.rrb_valid[slot.index()][vchan.index()])
    }

    pub(crate) fn rrb_count_avail(&self, parity: RrbParity) -> usize {
        usize::from(self.rrb_avail[parity.index()])
    }

    pub(crate) fn rrb_check(&self, slot: SlotId) -> RrbCounts {
        RrbCounts {
            chan0: self.rrb_count_valid(slot, Vchan::Primary),
            chan1: self.rrb_count_valid(slot, Vchan::Secondary),
            reserved: usize::from(self.rrb_reserved[slot.index()]),
            pool_free: self.rrb_count_avail(slot.parity()),
        }
    }

    /// Sets aside up to `want` free buffers for a newly populated slot, to be
    /// claimed later by transparent growth.
    pub(crate) fn rrb_attach_reserve(&mut self, slot: SlotId, want: u8) {
        let parity = slot.parity();
        let take = want.min(self.rrb_avail[parity.index()]);
        self.rrb_avail[parity.index()] -= take;
        self.rrb_reserved[slot.index()] += take;
    }

    /// Claims up to `want` free map fields for `(slot, vchan)`.
    ///
    /// Touches only the hardware map and `rrb_valid`; the caller decides
    /// which soft pool (reservation or shared free count) backs the grant.
    /// Partial success writes back exactly the fields that were claimed.
    fn rrb_map_claim(&mut self, slot: SlotId, vchan: Vchan, want: usize) -> usize {
        let parity = slot.parity();
        let mut map = self.hw.rrb_map(parity);
        let mut granted = 0;
        for field in 0..RRB_PER_PARITY {
            if granted == want {
                break;
            }
            if map.owner(field).is_none() {
                map.claim(field, slot.device_code(), vchan);
                granted += 1;
            }
        }
        if granted > 0 {
            self.hw.set_rrb_map(parity, map);
            self.rrb_valid[slot.index()][vchan.index()] += granted as u8;
        }
        granted
    }

    /// Releases up to `want` fields owned by `(slot, vchan)`, draining each
    /// buffer before giving it up: disable the field, wait for the in-flight
    /// packet to land, wait for the response data to be consumed, then clear
    /// the field. A buffer reassigned without this loses the response it was
    /// holding. Fields owned by anyone else are never touched.
    fn rrb_map_release(&mut self, slot: SlotId, vchan: Vchan, want: usize) -> usize {
        let parity = slot.parity();
        let mut map = self.hw.rrb_map(parity);
        let mut released = 0;
        for field in 0..RRB_PER_PARITY {
            if released == want {
                break;
            }
            let owned = map
                .owner(field)
                .is_some_and(|o| o.device_code == slot.device_code() && o.vchan == vchan);
            if !owned {
                continue;
            }

            map.disable(field);
            self.hw.set_rrb_map(parity, map);
            while self.hw.rrb_in_flight(parity, field) {}
            while self.hw.rrb_has_data(parity, field) {}
            map.release(field);
            self.hw.set_rrb_map(parity, map);
            released += 1;
        }
        if released > 0 {
            self.rrb_valid[slot.index()][vchan.index()] -= released as u8;
        }
        released
    }

    /// Driver-facing rebalance: move the slot to `(want0, want1)` buffers,
    /// trimming the request down to what the pool can cover, then pin the
    /// result against transparent growth.
    ///
    /// All-or-nothing at the call level: if trimming would leave a channel
    /// that asked for at least one buffer with none, nothing changes.
    pub(crate) fn rrb_rebalance(
        &mut self,
        slot: SlotId,
        want0: usize,
        want1: usize,
    ) -> Result<(usize, usize)> {
        if want0 > RRB_PER_PARITY || want1 > RRB_PER_PARITY {
            return Err(BridgeError::InvalidArgument("RRB request exceeds class capacity"));
        }

        let parity = slot.parity();
        let have = [
            self.rrb_count_valid(slot, Vchan::Primary),
            self.rrb_count_valid(slot, Vchan::Secondary),
        ];
        let base_supply = usize::from(self.rrb_avail[parity.index()])
            + usize::from(self.rrb_reserved[slot.index()]);

        let mut want = [want0, want1];
        loop {
            let need: usize = (0..2).map(|i| want[i].saturating_sub(have[i])).sum();
            let shrinkage: usize = (0..2).map(|i| have[i].saturating_sub(want[i])).sum();
            if need <= base_supply + shrinkage {
                break;
            }
            match trim_victim(want[0], want[1]) {
                Vchan::Primary => want[0] -= 1,
                Vchan::Secondary => want[1] -= 1,
            }
        }

        if (want0 >= 1 && want[0] == 0) || (want1 >= 1 && want[1] == 0) {
            return Err(BridgeError::ResourceExhausted {
                resource: "RRB pool",
                wanted: want0 + want1,
                free: base_supply,
            });
        }

        if want != [want0, want1] {
            tracing::debug!(
                slot = slot.index(),
                want0,
                want1,
                final0 = want[0],
                final1 = want[1],
                "RRB request trimmed to fit the free pool"
            );
        }

        // Frees first so shrinking one channel can feed the other.
        for (i, &vchan) in [Vchan::Primary, Vchan::Secondary].iter().enumerate() {
            if want[i] < have[i] {
                let n = have[i] - want[i];
                let released = self.rrb_map_release(slot, vchan, n);
                debug_assert_eq!(released, n, "owned fields went missing");
                self.rrb_avail[parity.index()] += released as u8;
            }
        }
        for (i, &vchan) in [Vchan::Primary, Vchan::Secondary].iter().enumerate() {
            if want[i] > have[i] {
                let n = want[i] - have[i];
                let claimed = self.rrb_map_claim(slot, vchan, n);
                debug_assert_eq!(claimed, n, "free pool changed under the lock");
                let from_reserve = usize::from(self.rrb_reserved[slot.index()]).min(claimed);
                self.rrb_reserved[slot.index()] -= from_reserve as u8;
                self.rrb_avail[parity.index()] -= (claimed - from_reserve) as u8;
            }
        }

        self.rrb_fixed |= 1 << slot.index();
        Ok((want[0], want[1]))
    }

    /// Transparent growth used by the DMA translator when a transfer needs
    /// more buffering. Draws the slot's attach-time reservation first, then
    /// the shared pool. A slot pinned by an explicit rebalance never grows.
    pub(crate) fn rrb_auto_grow(&mut self, slot: SlotId, vchan: Vchan, want_more: usize) -> usize {
        if self.rrb_fixed & (1 << slot.index()) != 0 {
            return 0;
        }
        let parity = slot.parity();
        let supply = usize::from(self.rrb_reserved[slot.index()])
            + usize::from(self.rrb_avail[parity.index()]);
        let claimed = self.rrb_map_claim(slot, vchan, want_more.min(supply));
        let from_reserve = usize::from(self.rrb_reserved[slot.index()]).min(claimed);
        self.rrb_reserved[slot.index()] -= from_reserve as u8;
        self.rrb_avail[parity.index()] -= (claimed - from_reserve) as u8;
        claimed
    }

    /// Returns every buffer the slot owns to the shared pool (device detach).
    pub(crate) fn rrb_release_all(&mut self, slot: SlotId) {
        let parity = slot.parity();
        for vchan in [Vchan::Primary, Vchan::Secondary] {
            let n = self.rrb_count_valid(slot, vchan);
            let released = self.rrb_map_release(slot, vchan, n);
            self.rrb_avail[parity.index()] += released as u8;
        }
        self.rrb_avail[parity.index()] += self.rrb_reserved[slot.index()];
        self.rrb_reserved[slot.index()] = 0;
        self.rrb_fixed &= !(1 << slot.index());
    }

    /// Drains every buffer the slot owns without giving any up: each field is
    /// disabled, drained, then re-enabled for the same owner. Used to quiesce
    /// a device before reset.
    pub(crate) fn rrb_flush(&mut self, slot: SlotId) {
        let parity = slot.parity();
        let mut map = self.hw.rrb_map(parity);
        for field in 0..RRB_PER_PARITY {
            let Some(owner) = map.owner(field) else { continue };
            if owner.device_code != slot.device_code() {
                continue;
            }

            map.disable(field);
            self.hw.set_rrb_map(parity, map);
            while self.hw.rrb_in_flight(parity, field) {}
            while self.hw.rrb_has_data(parity, field) {}
            map.claim(field, owner.device_code, owner.vchan);
            self.hw.set_rrb_map(parity, map);
        }
    }

    /// Conservation audit: the hardware map, the per-slot counts, the
    /// reservations and the free pool must always tile the full class.
    pub(crate) fn rrb_audit(&self, parity: RrbParity) -> bool {
        let map = self.hw.rrb_map(parity);
        let mut accounted = usize::from(self.rrb_avail[parity.index()]);
        for slot in SlotId::all().filter(|s| s.parity() == parity) {
            let owned0 = map.count_owned(slot.device_code(), Vchan::Primary);
            let owned1 = map.count_owned(slot.device_code(), Vchan::Secondary);
            if owned0 != self.rrb_count_valid(slot, Vchan::Primary)
                || owned1 != self.rrb_count_valid(slot, Vchan::Secondary)
            {
                return false;
            }
            accounted += owned0 + owned1 + usize::from(self.rrb_reserved[slot.index()]);
        }
        accounted == RRB_PER_PARITY
    }
}
