//! Soft per-slot state mirrored alongside the hardware registers.

use super::fault::FaultHandler;
use super::regs::DeviceWord;
use super::{PciSpace, SlotId, WindowId};

/// One decoded base-address window of a device, as reported by the
/// device/topology layer during probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceWindow {
    pub space: PciSpace,
    pub base: u64,
    pub size: u64,
    /// Live PIO maps resolved through this window.
    pub maps: u32,
}

impl DeviceWindow {
    pub fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.base && addr.saturating_add(size) <= self.base.saturating_add(self.size)
    }
}

/// Windows a probe may report for one slot.
pub const WINDOWS_PER_SLOT: usize = 6;

pub struct SlotState {
    /// Set once the device/topology layer has reported a device here.
    pub populated: bool,
    /// Set by the fault classifier; a disabled slot fails all resource calls.
    pub disabled: bool,

    pub windows: [Option<DeviceWindow>; WINDOWS_PER_SLOT],
    pub rom_window: Option<DeviceWindow>,

    /// Soft copy of the hardware device word. Always updated together with
    /// the register, under the bridge lock.
    pub device_word: DeviceWord,

    // Live maps per translation mode; a mode's shared attribute bits are
    // pinned while its counter is non-zero.
    pub d64_uses: u32,
    pub d32_uses: u32,
    pub ate_uses: u32,
    /// Live maps backed by the external table.
    pub ext_ate_uses: u32,
    /// External entries of this slot hold live translations; such a slot is
    /// parked during any external-table rewrite on erratum revisions.
    pub ext_ate_active: bool,

    /// Last direct-64 base handed out, keyed by the attributes it encoded,
    /// so an identical request reuses it without re-arbitration.
    pub cached_d64: Option<(DeviceWord, u64)>,

    /// For a guest slot of a dual-slot card: the host slot that owns and
    /// initializes this slot's resources.
    pub host: Option<SlotId>,

    pub fault_handler: Option<FaultHandler>,
}

impl SlotState {
    pub fn new() -> Self {
        Self {
            populated: false,
            disabled: false,
            windows: [None; WINDOWS_PER_SLOT],
            rom_window: None,
            device_word: DeviceWord::default(),
            d64_uses: 0,
            d32_uses: 0,
            ate_uses: 0,
            ext_ate_uses: 0,
            ext_ate_active: false,
            cached_d64: None,
            host: None,
            fault_handler: None,
        }
    }

    pub fn window(&self, id: WindowId) -> Option<&DeviceWindow> {
        self.windows[id.index()].as_ref()
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut DeviceWindow> {
        self.windows[id.index()].as_mut()
    }

    /// Finds the device window containing `addr..addr+size` in `space`.
    pub fn find_window(&self, space: PciSpace, addr: u64, size: u64) -> Option<WindowId> {
        (0..WINDOWS_PER_SLOT).find_map(|i| {
            let win = self.windows[i].as_ref()?;
            if win.space == space && win.contains(addr, size) {
                WindowId::new(i as u8)
            } else {
                None
            }
        })
    }
}

impl Default for SlotState {
    fn default() -> Self {
        Self::new()
    }
}
