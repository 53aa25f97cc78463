//! Resource-management core of a fabric-to-PCI host bridge.
//!
//! One [`Bridge`] instance manages a PCI segment of up to eight slots:
//! the shared response-buffer pool, the three DMA translation strategies,
//! PIO routing through dedicated and shared windows, interrupt fan-out and
//! fault recovery. All shared soft state lives behind one mutex per bridge;
//! see the individual modules for the lock discipline exceptions
//! (fault counters, interrupt-wrapper creation).

pub mod ate;
pub mod dma;
pub mod error;
pub mod fault;
pub mod hw;
pub mod intr;
pub mod pio;
pub mod piospace;
pub mod regs;
pub mod rrb;
pub mod slot;

use std::sync::{Arc, Mutex, MutexGuard};

use xfab_fabric::{FabricAddr, FabricTransport, WidgetId};

pub use ate::{AteAllocator, AteRange};
pub use dma::{DmaFlags, DmaMap, DmaMode};
pub use error::{BridgeError, Result};
pub use fault::{Attribution, FaultContext, FaultDisposition, FaultHandler, FaultOutcome};
pub use hw::{BridgeHw, HwWrite, ModelHw};
pub use intr::{IntrHandle, PciPin};
pub use pio::{PioFlags, PioMap, PioMapHandle};
pub use piospace::{PioSpaceConfig, PioSpacePool};
pub use rrb::RrbCounts;
pub use slot::{DeviceWindow, SlotState, WINDOWS_PER_SLOT};

use regs::{DeviceWord, DevioWord, SLOT_COUNT};

/// One of the eight PCI slots behind a bridge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SlotId(u8);

impl SlotId {
    pub const fn new(slot: u8) -> Option<SlotId> {
        if slot < SLOT_COUNT as u8 {
            Some(SlotId(slot))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Parity class sharing one RRB map register with this slot.
    pub const fn parity(self) -> RrbParity {
        if self.0 & 1 == 0 {
            RrbParity::Even
        } else {
            RrbParity::Odd
        }
    }

    /// Device-pair code identifying this slot within its parity class.
    pub const fn device_code(self) -> u8 {
        self.0 >> 1
    }

    pub fn all() -> impl Iterator<Item = SlotId> {
        (0..SLOT_COUNT as u8).map(SlotId)
    }
}

/// Per-slot virtual channel: a second, independent RRB/DMA accounting
/// context used to keep two traffic classes from blocking each other.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Vchan {
    Primary,
    Secondary,
}

impl Vchan {
    pub const fn index(self) -> usize {
        match self {
            Vchan::Primary => 0,
            Vchan::Secondary => 1,
        }
    }
}

/// RRB parity class: even and odd slots draw from separate buffer pools.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RrbParity {
    Even,
    Odd,
}

impl RrbParity {
    pub const fn index(self) -> usize {
        match self {
            RrbParity::Even => 0,
            RrbParity::Odd => 1,
        }
    }
}

/// One of a device's six decoded base-address windows.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct WindowId(u8);

impl WindowId {
    pub const fn new(window: u8) -> Option<WindowId> {
        if window < WINDOWS_PER_SLOT as u8 {
            Some(WindowId(window))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One of the eight fabric interrupt bits of a bridge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct IntrBit(u8);

impl IntrBit {
    pub const fn new(bit: u8) -> Option<IntrBit> {
        if bit < 8 {
            Some(IntrBit(bit))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// PCI address spaces a mapping request can name.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PciSpace {
    /// Configuration space; PIO to it passes through the fixed aperture.
    Cfg,
    Io,
    Mem32,
    Mem64,
    /// Offset within one of the device's own decoded windows.
    Win(WindowId),
    /// Expansion ROM window.
    Rom,
}

/// A device connection: the addressing context every driver-facing call
/// carries. Function granularity matters only to the topology layer; the
/// resource manager accounts per slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DevConn {
    pub slot: SlotId,
    pub func: u8,
}

/// Everything the device/topology layer reports for a probed slot.
#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    pub windows: Vec<(PciSpace, u64, u64)>,
    pub rom: Option<(u64, u64)>,
    /// Present when this slot is the guest half of a dual-slot card.
    pub host: Option<SlotId>,
}

/// Attach-time configuration.
///
/// Administrative overrides (fixed RRB partitions, interrupt re-mapping,
/// host/guest pairing) are applied once and recorded as fixed: transparent
/// reallocation never overrides them later.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Fabric port this bridge hangs off.
    pub widget: WidgetId,
    pub pio_space: PioSpaceConfig,
    /// Base of the bridge-wide 2 GiB direct-32 DMA window, chosen once.
    pub direct32_base: FabricAddr,
    /// Buffers reserved per populated slot for transparent growth.
    pub default_rrb_reserve: u8,
    /// Fixed RRB partition per slot, applied (and pinned) at populate time.
    pub fixed_rrb: [Option<(usize, usize)>; SLOT_COUNT],
    /// Interrupt-bit override per (slot, pin); default is the swizzle.
    pub intr_override: [[Option<IntrBit>; 4]; SLOT_COUNT],
    /// Host slot for each guest half of a dual-slot card, when the pairing
    /// is administered rather than probed.
    pub guest_of: [Option<SlotId>; SLOT_COUNT],
    /// Bridge revision suffers the external-ATE update erratum.
    pub erratum_ext_ate: bool,
    /// On-chip ATE table entries (probed).
    pub internal_ates: u32,
    /// Populated expansion-SRAM ATE entries (probed, often zero).
    pub external_ates: u32,
    /// Link-error storm control: disable the error interrupt past this many
    /// events inside `llp_window`.
    pub llp_threshold: u32,
    pub llp_window: std::time::Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            widget: WidgetId(0),
            pio_space: PioSpaceConfig::default(),
            // High in the fabric address space, clear of memory targets.
            direct32_base: FabricAddr(0x1_0000_0000),
            default_rrb_reserve: 2,
            fixed_rrb: [None; SLOT_COUNT],
            intr_override: [[None; 4]; SLOT_COUNT],
            guest_of: [None; SLOT_COUNT],
            erratum_ext_ate: false,
            internal_ates: 128,
            external_ates: 0,
            llp_threshold: 16,
            llp_window: std::time::Duration::from_secs(1),
        }
    }
}

/// Soft state of one DevIO window.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DevioState {
    pub(crate) word: DevioWord,
    /// Slot currently decoding through this window.
    pub(crate) owner: Option<SlotId>,
    /// Live PIO maps resolved through this window.
    pub(crate) users: u32,
}

/// Byte-swap bookkeeping for one direct (non-windowed) PIO space.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DirectSwapState {
    pub(crate) swap: bool,
    pub(crate) users: u32,
}

pub(crate) struct BridgeState {
    pub(crate) hw: Box<dyn BridgeHw>,
    pub(crate) slots: [SlotState; SLOT_COUNT],

    pub(crate) rrb_valid: [[u8; 2]; SLOT_COUNT],
    pub(crate) rrb_reserved: [u8; SLOT_COUNT],
    pub(crate) rrb_avail: [u8; 2],
    pub(crate) rrb_fixed: u8,

    pub(crate) ate: AteAllocator,
    pub(crate) erratum_ext_ate: bool,

    pub(crate) pio_space: PioSpacePool,
    pub(crate) devio: [DevioState; regs::DEVIO_COUNT],
    pub(crate) direct_swap: [DirectSwapState; 2],
    pub(crate) direct32_base: FabricAddr,

    pub(crate) pio_maps: Vec<Arc<PioMap>>,

    pub(crate) llp: fault::LlpRateTracker,
    pub(crate) no_owner_faults: u64,
}

impl BridgeState {
    /// The one place a device word changes: soft copy and hardware register
    /// move together, under the bridge lock the caller holds.
    pub(crate) fn commit_device_word(&mut self, slot: SlotId, word: DeviceWord) {
        self.slots[slot.index()].device_word = word;
        self.hw.set_device_word(slot, word);
    }

    pub(crate) fn usable_slot(&self, slot: SlotId) -> Result<()> {
        let st = &self.slots[slot.index()];
        if !st.populated {
            return Err(BridgeError::InvalidArgument("slot has no device"));
        }
        if st.disabled {
            return Err(BridgeError::InvalidArgument("slot disabled after a fault"));
        }
        Ok(())
    }
}

/// One physical bridge instance.
pub struct Bridge {
    pub(crate) state: Mutex<BridgeState>,
    pub(crate) intr: [intr::IntrBitState; 8],
    pub(crate) deferred: Mutex<Vec<intr::DeferredInvoke>>,
    pub(crate) fabric: Arc<dyn FabricTransport>,
    pub(crate) widget: WidgetId,
    pub(crate) config: BridgeConfig,
}

impl Bridge {
    /// Brings the resource manager up over a register block and a fabric
    /// transport. Slots are empty until the topology layer populates them.
    pub fn attach(
        config: BridgeConfig,
        mut hw: Box<dyn BridgeHw>,
        fabric: Arc<dyn FabricTransport>,
    ) -> Arc<Bridge> {
        hw.set_direct32_base(config.direct32_base);

        let state = BridgeState {
            hw,
            slots: std::array::from_fn(|_| SlotState::new()),
            rrb_valid: [[0; 2]; SLOT_COUNT],
            rrb_reserved: [0; SLOT_COUNT],
            rrb_avail: [regs::RRB_PER_PARITY as u8; 2],
            rrb_fixed: 0,
            ate: AteAllocator::new(config.internal_ates, config.external_ates),
            erratum_ext_ate: config.erratum_ext_ate,
            pio_space: PioSpacePool::new(&config.pio_space),
            devio: [DevioState::default(); regs::DEVIO_COUNT],
            direct_swap: [DirectSwapState::default(); 2],
            direct32_base: config.direct32_base,
            pio_maps: Vec::new(),
            llp: fault::LlpRateTracker::new(config.llp_threshold, config.llp_window),
            no_owner_faults: 0,
        };

        Arc::new(Bridge {
            state: Mutex::new(state),
            intr: std::array::from_fn(|_| intr::IntrBitState::new()),
            deferred: Mutex::new(Vec::new()),
            fabric,
            widget: config.widget,
            config,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().expect("bridge lock poisoned")
    }

    /// Connection handle for a populated slot.
    pub fn conn(&self, slot: SlotId, func: u8) -> Result<DevConn> {
        if func >= 8 {
            return Err(BridgeError::InvalidArgument("function number out of range"));
        }
        self.lock().usable_slot(slot)?;
        Ok(DevConn { slot, func })
    }

    /// Installs a probed device into a slot: windows, the attach-time RRB
    /// reservation, and any administrative overrides for the slot.
    pub fn populate_slot(&self, slot: SlotId, info: DeviceInfo) -> Result<()> {
        // Probed pairing wins; the administrative override covers cards the
        // probe cannot identify.
        let host = info.host.or(self.config.guest_of[slot.index()]);
        let fixed = {
            let mut st = self.lock();
            if st.slots[slot.index()].populated {
                return Err(BridgeError::InvalidArgument("slot already populated"));
            }

            let slot_state = &mut st.slots[slot.index()];
            slot_state.populated = true;
            slot_state.host = host;
            for (i, &(space, base, size)) in info.windows.iter().take(WINDOWS_PER_SLOT).enumerate()
            {
                slot_state.windows[i] = Some(DeviceWindow {
                    space,
                    base,
                    size,
                    maps: 0,
                });
            }
            slot_state.rom_window = info.rom.map(|(base, size)| DeviceWindow {
                space: PciSpace::Rom,
                base,
                size,
                maps: 0,
            });

            if let Some(host) = host {
                // Guest half of a dual-slot card: the host owns the
                // configuration; mirror its word and skip reservations.
                let word = st.slots[host.index()].device_word;
                st.commit_device_word(slot, word);
            } else {
                st.rrb_attach_reserve(slot, self.config.default_rrb_reserve);
            }
            self.config.fixed_rrb[slot.index()]
        };

        if let Some((want0, want1)) = fixed {
            let mut st = self.lock();
            st.rrb_rebalance(slot, want0, want1)?;
        }
        Ok(())
    }

    /// Tears a slot down, returning every resource it held to the pools.
    pub fn depopulate_slot(&self, slot: SlotId) {
        let mut st = self.lock();
        st.rrb_release_all(slot);
        st.pio_maps.retain(|map| map.slot != slot);
        for win in st.devio.iter_mut() {
            if win.owner == Some(slot) {
                win.owner = None;
                win.users = 0;
            }
        }
        st.slots[slot.index()] = SlotState::new();
    }

    // --- RRB driver API -------------------------------------------------

    /// Repartitions the slot's response buffers between its two channels.
    /// The request is trimmed to the free pool; the granted counts are
    /// returned and pinned against transparent growth.
    pub fn rrb_alloc(&self, conn: DevConn, want0: usize, want1: usize) -> Result<(usize, usize)> {
        let mut st = self.lock();
        st.usable_slot(conn.slot)?;
        st.rrb_rebalance(conn.slot, want0, want1)
    }

    pub fn rrb_check(&self, conn: DevConn) -> Result<RrbCounts> {
        let st = self.lock();
        st.usable_slot(conn.slot)?;
        Ok(st.rrb_check(conn.slot))
    }

    /// Drains every response buffer the slot owns without releasing any.
    pub fn rrb_flush(&self, conn: DevConn) -> Result<()> {
        let mut st = self.lock();
        st.usable_slot(conn.slot)?;
        st.rrb_flush(conn.slot);
        Ok(())
    }

    /// Conservation audit over one parity class; test and diagnostic hook.
    pub fn rrb_audit(&self, parity: RrbParity) -> bool {
        self.lock().rrb_audit(parity)
    }

    // --- PIO space reservation ------------------------------------------

    pub fn piospace_alloc(
        &self,
        conn: DevConn,
        space: PciSpace,
        size: u64,
        align: u64,
    ) -> Result<u64> {
        let mut st = self.lock();
        st.usable_slot(conn.slot)?;
        st.pio_space.alloc(space, size, align)
    }

    pub fn piospace_free(&self, conn: DevConn, space: PciSpace, addr: u64, size: u64) -> Result<()> {
        let mut st = self.lock();
        st.usable_slot(conn.slot)?;
        st.pio_space.free(space, addr, size)
    }

    // --- Per-slot attribute toggles -------------------------------------

    /// Sets and clears device-word bits through the same conflict machinery
    /// DMA-mode selection uses: bits pinned by live maps cannot change.
    pub fn device_flags_set(&self, conn: DevConn, set: DeviceWord, clear: DeviceWord) -> Result<()> {
        let mut st = self.lock();
        st.usable_slot(conn.slot)?;
        st.device_word_update(conn.slot, set, clear)
    }

    pub fn device_priority_set(&self, conn: DevConn, realtime: bool) -> Result<()> {
        if realtime {
            self.device_flags_set(conn, DeviceWord::PRIORITY, DeviceWord::empty())
        } else {
            self.device_flags_set(conn, DeviceWord::empty(), DeviceWord::PRIORITY)
        }
    }

    /// Selects the byte-swap behavior of the slot's DMA paths.
    pub fn device_endian_set(&self, conn: DevConn, swap_ate: bool, swap_direct: bool) -> Result<()> {
        let (mut set, mut clear) = (DeviceWord::empty(), DeviceWord::empty());
        if swap_ate {
            set |= DeviceWord::SWAP_ATE;
        } else {
            clear |= DeviceWord::SWAP_ATE;
        }
        if swap_direct {
            set |= DeviceWord::SWAP_DIRECT;
        } else {
            clear |= DeviceWord::SWAP_DIRECT;
        }
        self.device_flags_set(conn, set, clear)
    }

    /// Registers the device's fault handler; the classifier consults it
    /// before disabling the slot.
    pub fn register_fault_handler(&self, conn: DevConn, handler: FaultHandler) -> Result<()> {
        let mut st = self.lock();
        st.usable_slot(conn.slot)?;
        st.slots[conn.slot.index()].fault_handler = Some(handler);
        Ok(())
    }
}
