//! DMA translation: chooses among the three hardware strategies and
//! arbitrates the per-slot attribute word they share.
//!
//! Direct-64 carries the whole fabric address plus attributes in the PCI
//! address bits; direct-32 shares one bridge-wide 2 GiB window; the windowed
//! path burns ATEs. Selection tries them in that order, constrained by what
//! the caller's device can address.

use xfab_fabric::{FabricAddr, TransportFlags};

use super::error::{BridgeError, Result};
use super::regs::{
    AteEntry, DeviceWord, ATE_PAGE_SHIFT, ATE_PAGE_SIZE, D32_PCI_BASE, D64_ADDR_MASK, D64_MARKER,
    DIRECT32_SIZE, DMA_MAPPED_PCI_BASE,
};
use super::{ate::AteRange, Bridge, BridgeState, DevConn, SlotId, Vchan};

bitflags::bitflags! {
    /// Caller-requested properties of a DMA channel.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct DmaFlags: u32 {
        /// The device issues 64-bit addresses; direct-64 becomes eligible.
        const ADDR64 = 1 << 0;
        /// Restrict selection to the fixed direct-32 window.
        const FIXED32 = 1 << 1;
        const PREFETCH = 1 << 2;
        const BARRIER = 1 << 3;
        const PRECISE = 1 << 4;
        /// Ride the secondary virtual channel.
        const VCHAN1 = 1 << 5;
        const BYTE_SWAP = 1 << 6;
        const WRITE_GATHER = 1 << 7;
        const COHERENT = 1 << 8;
        /// Take the table-translated path outright (scatter/gather users).
        const WINDOWED = 1 << 9;
    }
}

impl DmaFlags {
    /// Device-word values this request asks for. Absent flags ask for the
    /// bit to be *clear*; that request arbitrates like any other.
    fn wanted_word(self) -> DeviceWord {
        let mut word = DeviceWord::empty();
        if self.contains(DmaFlags::PREFETCH) {
            word |= DeviceWord::PREFETCH;
        }
        if self.contains(DmaFlags::BARRIER) {
            word |= DeviceWord::BARRIER;
        }
        if self.contains(DmaFlags::PRECISE) {
            word |= DeviceWord::PRECISE;
        }
        if self.contains(DmaFlags::VCHAN1) {
            word |= DeviceWord::VCHAN1;
        }
        if self.contains(DmaFlags::BYTE_SWAP) {
            word |= DeviceWord::SWAP_DIRECT;
        }
        if self.contains(DmaFlags::WRITE_GATHER) {
            word |= DeviceWord::WRITE_GATHER;
        }
        if self.contains(DmaFlags::COHERENT) {
            word |= DeviceWord::COHERENT;
        }
        word
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmaMode {
    Direct64,
    Direct32,
    AteWindowed,
}

/// An established DMA channel. Freed through [`Bridge::dmamap_free`], which
/// returns its ATEs and unpins its share of the slot's attribute word.
#[derive(Debug)]
pub struct DmaMap {
    pub slot: SlotId,
    pub vchan: Vchan,
    pub mode: DmaMode,
    /// Attributes actually in effect, after any forcing.
    pub attrs: DeviceWord,
    pub max_size: u64,
    pub(crate) pci_base: u64,
    pub(crate) ate: Option<AteRange>,
}

impl DmaMap {
    /// PCI-visible base of this channel's aperture.
    pub fn pci_base(&self) -> u64 {
        self.pci_base
    }
}

/// Worst-case table entries for a transfer of `size` bytes. The offset
/// within the first page is unknown until the mapping call, so assume a
/// maximal one.
fn ate_entries_reserve(size: u64) -> u32 {
    let worst_offset = ATE_PAGE_SIZE - 1;
    (((worst_offset + size - 1) / ATE_PAGE_SIZE) + 1) as u32
}

/// Entries actually covering `offset..offset+size`.
fn ate_entries_cover(offset: u64, size: u64) -> u32 {
    debug_assert!(size > 0);
    ((offset + size + ATE_PAGE_SIZE - 1) / ATE_PAGE_SIZE) as u32
}

/// Attributes the transport layer understands, from the channel's word.
fn transport_flags(word: DeviceWord) -> TransportFlags {
    TransportFlags {
        prefetch: word.contains(DeviceWord::PREFETCH),
        barrier: word.contains(DeviceWord::BARRIER),
    }
}

impl BridgeState {
    /// Attribute bits pinned by live users of each translation mode.
    fn pinned_attrs(&self, slot: SlotId) -> DeviceWord {
        let st = &self.slots[slot.index()];
        let mut pinned = DeviceWord::empty();
        if st.d64_uses > 0 {
            pinned |= DeviceWord::D64_ATTRS;
        }
        if st.d32_uses > 0 {
            pinned |= DeviceWord::D32_ATTRS;
        }
        if st.ate_uses > 0 {
            pinned |= DeviceWord::SWAP_ATE;
        }
        pinned
    }

    /// Merges `wanted` values for the `mask` bits into the slot's shared
    /// word. Where a pinned bit disagrees, forcing is tried first:
    /// `{precise, barrier}` may be forced on, `{write-gather, prefetch}`
    /// forced off. Anything else is a caller-visible conflict, reported
    /// distinctly from exhaustion.
    pub(crate) fn arbitrate_attrs(
        &mut self,
        slot: SlotId,
        wanted: DeviceWord,
        mask: DeviceWord,
    ) -> Result<DeviceWord> {
        let current = self.slots[slot.index()].device_word;
        let pinned = self.pinned_attrs(slot) & mask;

        let conflict = (current ^ wanted) & pinned;
        let force_on = conflict & DeviceWord::FORCE_ON;
        let force_off = conflict & DeviceWord::FORCE_OFF;
        let hard = conflict - force_on - force_off;
        if !hard.is_empty() {
            return Err(BridgeError::AttributeConflict {
                slot,
                requested: wanted,
                held: current,
            });
        }

        // Pinned bits that did not conflict already match `current`, so the
        // wanted values can be merged wholesale before forcing is applied.
        let mut word = (current - mask) | (wanted & mask);
        word |= force_on;
        word -= force_off;

        if !conflict.is_empty() {
            tracing::debug!(
                slot = slot.index(),
                forced_on = force_on.bits(),
                forced_off = force_off.bits(),
                "reconciled attribute request by forcing"
            );
        }
        if word != current {
            self.commit_device_word(slot, word);
        }
        Ok(word)
    }

    /// Driver-facing flag toggles route through the same arbitration.
    pub(crate) fn device_word_update(
        &mut self,
        slot: SlotId,
        set: DeviceWord,
        clear: DeviceWord,
    ) -> Result<()> {
        let current = self.slots[slot.index()].device_word;
        let wanted = (current | set) - clear;
        self.arbitrate_attrs(slot, wanted, set | clear)?;
        Ok(())
    }

    /// Every mode needs response buffering behind it: two buffers when the
    /// channel can prefetch, one otherwise. Shortfall goes through
    /// transparent growth; a channel left with nothing is an error.
    fn dma_rrb_precondition(&mut self, slot: SlotId, vchan: Vchan, prefetch: bool) -> Result<()> {
        let needed = if prefetch { 2 } else { 1 };
        let have = self.rrb_count_valid(slot, vchan);
        if have < needed {
            self.rrb_auto_grow(slot, vchan, needed - have);
        }
        if self.rrb_count_valid(slot, vchan) == 0 {
            return Err(BridgeError::ResourceExhausted {
                resource: "response buffers",
                wanted: needed,
                free: self.rrb_count_avail(slot.parity()),
            });
        }
        Ok(())
    }
}

impl Bridge {
    /// Opens a DMA channel able to map up to `max_size` bytes at a time,
    /// picking the best translation the device and the slot's live
    /// attribute word allow.
    pub fn dmamap_alloc(&self, conn: DevConn, max_size: u64, flags: DmaFlags) -> Result<DmaMap> {
        if max_size == 0 {
            return Err(BridgeError::InvalidArgument("zero-size DMA map"));
        }

        let mut st = self.lock();
        st.usable_slot(conn.slot)?;
        // Guest slots of dual-slot cards draw on the host's configuration.
        let slot = st.slots[conn.slot.index()].host.unwrap_or(conn.slot);
        let vchan = if flags.contains(DmaFlags::VCHAN1) {
            Vchan::Secondary
        } else {
            Vchan::Primary
        };

        st.dma_rrb_precondition(slot, vchan, flags.contains(DmaFlags::PREFETCH))?;
        let wanted = flags.wanted_word();

        let mut first_conflict: Option<BridgeError> = None;

        if flags.contains(DmaFlags::ADDR64)
            && !flags.intersects(DmaFlags::FIXED32 | DmaFlags::WINDOWED)
        {
            // A repeat of the attributes already in force reuses the cached
            // base without re-arbitrating.
            let slot_state = &st.slots[slot.index()];
            if let Some((attrs, pci_base)) = slot_state.cached_d64 {
                if slot_state.d64_uses > 0 && attrs == wanted & DeviceWord::D64_ATTRS {
                    let word = slot_state.device_word;
                    st.slots[slot.index()].d64_uses += 1;
                    return Ok(DmaMap {
                        slot,
                        vchan,
                        mode: DmaMode::Direct64,
                        attrs: word,
                        max_size,
                        pci_base,
                        ate: None,
                    });
                }
            }

            match st.arbitrate_attrs(slot, wanted, DeviceWord::D64_ATTRS) {
                Ok(word) => {
                    let attrs = word & DeviceWord::D64_ATTRS;
                    let pci_base = D64_MARKER | attrs.to_d64_bits();
                    let slot_state = &mut st.slots[slot.index()];
                    slot_state.d64_uses += 1;
                    slot_state.cached_d64 = Some((attrs, pci_base));
                    return Ok(DmaMap {
                        slot,
                        vchan,
                        mode: DmaMode::Direct64,
                        attrs: word,
                        max_size,
                        pci_base,
                        ate: None,
                    });
                }
                Err(err @ BridgeError::AttributeConflict { .. }) => {
                    first_conflict.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }

        if max_size <= DIRECT32_SIZE && !flags.contains(DmaFlags::WINDOWED) {
            match st.arbitrate_attrs(slot, wanted, DeviceWord::D32_ATTRS) {
                Ok(word) => {
                    st.slots[slot.index()].d32_uses += 1;
                    return Ok(DmaMap {
                        slot,
                        vchan,
                        mode: DmaMode::Direct32,
                        attrs: word,
                        max_size,
                        pci_base: D32_PCI_BASE,
                        ate: None,
                    });
                }
                Err(err @ BridgeError::AttributeConflict { .. }) => {
                    first_conflict.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }

        if flags.contains(DmaFlags::FIXED32) {
            return Err(first_conflict.unwrap_or(BridgeError::AddressOutOfRange {
                addr: 0,
                size: max_size,
            }));
        }

        // Windowed fallback: attributes ride in each table entry, so only
        // the swap bit is shared.
        let swap_mask = DeviceWord::SWAP_ATE;
        let swap_wanted = if flags.contains(DmaFlags::BYTE_SWAP) {
            DeviceWord::SWAP_ATE
        } else {
            DeviceWord::empty()
        };
        let word = match st.arbitrate_attrs(slot, swap_wanted, swap_mask) {
            Ok(word) => word,
            Err(err) => return Err(first_conflict.unwrap_or(err)),
        };

        let range = match st.ate.alloc(ate_entries_reserve(max_size)) {
            Ok(range) => range,
            Err(err) => return Err(first_conflict.unwrap_or(err)),
        };
        let external = st.ate.is_external(range.base);
        let slot_state = &mut st.slots[slot.index()];
        slot_state.ate_uses += 1;
        if external {
            slot_state.ext_ate_uses += 1;
        }

        // Entry attributes come from the request, not the shared word.
        let entry_attrs =
            (wanted & (DeviceWord::BARRIER | DeviceWord::PREFETCH | DeviceWord::PRECISE | DeviceWord::COHERENT))
                | (word & DeviceWord::SWAP_ATE);

        Ok(DmaMap {
            slot,
            vchan,
            mode: DmaMode::AteWindowed,
            attrs: entry_attrs,
            max_size,
            pci_base: DMA_MAPPED_PCI_BASE + (u64::from(range.base) << ATE_PAGE_SHIFT),
            ate: Some(range),
        })
    }

    /// Loads a target range into the channel and returns the PCI address the
    /// device should issue.
    pub fn dmamap_addr(&self, map: &DmaMap, paddr: FabricAddr, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(BridgeError::InvalidArgument("zero-size DMA request"));
        }
        if size > map.max_size {
            return Err(BridgeError::AddressOutOfRange { addr: paddr.0, size });
        }

        match map.mode {
            DmaMode::Direct64 => {
                if paddr.0 & !D64_ADDR_MASK != 0 {
                    return Err(BridgeError::AddressOutOfRange { addr: paddr.0, size });
                }
                let path = self
                    .fabric
                    .dma_translate(self.widget, paddr, size, transport_flags(map.attrs))?;
                Ok(map.pci_base | path.base.0)
            }
            DmaMode::Direct32 => {
                let path = self
                    .fabric
                    .dma_translate(self.widget, paddr, size, transport_flags(map.attrs))?;
                let st = self.lock();
                let offset = path
                    .base
                    .checked_sub(st.direct32_base)
                    .filter(|off| off + size <= DIRECT32_SIZE)
                    .ok_or(BridgeError::AddressOutOfRange { addr: paddr.0, size })?;
                Ok(D32_PCI_BASE + offset)
            }
            DmaMode::AteWindowed => {
                let range = map.ate.expect("windowed map without a range");
                let path = self
                    .fabric
                    .dma_translate(self.widget, paddr, size, transport_flags(map.attrs))?;
                let offset = path.base.0 & (ATE_PAGE_SIZE - 1);
                let entries = ate_entries_cover(offset, size);
                if entries > range.count {
                    return Err(BridgeError::AddressOutOfRange { addr: paddr.0, size });
                }

                let page_base = path.base.0 & !(ATE_PAGE_SIZE - 1);
                let programmed: Vec<AteEntry> = (0..entries)
                    .map(|i| {
                        AteEntry::new(
                            FabricAddr(page_base + u64::from(i) * ATE_PAGE_SIZE),
                            map.attrs,
                        )
                    })
                    .collect();

                let mut st = self.lock();
                st.write_ates(map.slot, range.base, &programmed);
                Ok(map.pci_base + offset)
            }
        }
    }

    /// Translates a scatter/gather list through the channel in one pass.
    /// Windowed channels pack the segments into consecutive table entries.
    pub fn dmamap_list(
        &self,
        map: &DmaMap,
        segments: &[(FabricAddr, u64)],
    ) -> Result<Vec<(u64, u64)>> {
        match map.mode {
            DmaMode::Direct64 | DmaMode::Direct32 => segments
                .iter()
                .map(|&(addr, size)| self.dmamap_addr(map, addr, size).map(|pci| (pci, size)))
                .collect(),
            DmaMode::AteWindowed => {
                let range = map.ate.expect("windowed map without a range");

                // Translate every segment before taking the lock; the table
                // writes are the only part that needs it.
                let mut paths = Vec::with_capacity(segments.len());
                for &(addr, size) in segments {
                    if size == 0 {
                        return Err(BridgeError::InvalidArgument("zero-size DMA segment"));
                    }
                    let path = self
                        .fabric
                        .dma_translate(self.widget, addr, size, transport_flags(map.attrs))?;
                    paths.push((path.base, size));
                }

                let mut st = self.lock();
                let mut next = 0u32;
                let mut out = Vec::with_capacity(segments.len());
                for (base, size) in paths {
                    let offset = base.0 & (ATE_PAGE_SIZE - 1);
                    let entries = ate_entries_cover(offset, size);
                    if next + entries > range.count {
                        return Err(BridgeError::ResourceExhausted {
                            resource: "ATE window",
                            wanted: (next + entries) as usize,
                            free: (range.count - next) as usize,
                        });
                    }
                    let page_base = base.0 & !(ATE_PAGE_SIZE - 1);
                    let programmed: Vec<AteEntry> = (0..entries)
                        .map(|i| {
                            AteEntry::new(
                                FabricAddr(page_base + u64::from(i) * ATE_PAGE_SIZE),
                                map.attrs,
                            )
                        })
                        .collect();
                    st.write_ates(map.slot, range.base + next, &programmed);
                    out.push((
                        map.pci_base + (u64::from(next) << ATE_PAGE_SHIFT) + offset,
                        size,
                    ));
                    next += entries;
                }
                Ok(out)
            }
        }
    }

    /// Closes a channel: returns its table entries and drops its pin on the
    /// slot's shared attribute word.
    pub fn dmamap_free(&self, map: DmaMap) {
        let mut st = self.lock();
        match map.mode {
            DmaMode::Direct64 => {
                let slot_state = &mut st.slots[map.slot.index()];
                slot_state.d64_uses = slot_state.d64_uses.saturating_sub(1);
                if slot_state.d64_uses == 0 {
                    slot_state.cached_d64 = None;
                }
            }
            DmaMode::Direct32 => {
                let slot_state = &mut st.slots[map.slot.index()];
                slot_state.d32_uses = slot_state.d32_uses.saturating_sub(1);
            }
            DmaMode::AteWindowed => {
                let range = map.ate.expect("windowed map without a range");
                let external = st.ate.is_external(range.base);
                let invalid = vec![AteEntry::invalid(); range.count as usize];
                st.write_ates(map.slot, range.base, &invalid);

                let slot_state = &mut st.slots[map.slot.index()];
                slot_state.ate_uses = slot_state.ate_uses.saturating_sub(1);
                if external {
                    slot_state.ext_ate_uses = slot_state.ext_ate_uses.saturating_sub(1);
                    if slot_state.ext_ate_uses == 0 {
                        slot_state.ext_ate_active = false;
                    }
                }
                if let Err(err) = st.ate.free(range) {
                    tracing::warn!(?err, "DMA map held an unknown ATE range");
                }
            }
        }
    }
}
