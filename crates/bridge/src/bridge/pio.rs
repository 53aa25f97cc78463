//! Programmed-I/O routing: config pass-through, the device's own decoded
//! windows, the eight shared DevIO windows, and the wide fixed apertures,
//! tried in that order.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use xfab_fabric::{FabricAddr, TransportFlags};

use super::error::{BridgeError, Result};
use super::regs::{
    devio_aperture, DevioWord, SpaceClass, CFG_FABRIC_BASE, CFG_PCI_BASE, CFG_SLOT_STRIDE,
    DEVIO_COUNT, DEVIO_FABRIC_BASE, DEVIO_FABRIC_STRIDE, PIO_DIRECT_IO_FABRIC_BASE,
    PIO_DIRECT_MEM_FABRIC_BASE,
};
use super::{Bridge, BridgeState, DevConn, PciSpace, SlotId, WindowId};

bitflags::bitflags! {
    /// Caller-requested properties of a PIO mapping.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PioFlags: u32 {
        /// Byte-swap data through this mapping.
        const BYTE_SWAP = 1 << 0;
        /// The wide fixed apertures are acceptable as a last resort.
        const FIXED = 1 << 1;
    }
}

/// How an established mapping reaches the bus; drives teardown accounting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PioMapKind {
    Cfg,
    /// Through a shared DevIO window, possibly on behalf of one of the
    /// device's own decoded windows (tracked for per-window accounting).
    Devio { window: usize, bar: Option<WindowId> },
    /// Through a wide fixed aperture.
    Direct(SpaceClass),
}

/// An established PIO mapping.
///
/// The fault classifier reads the registry of these without the bridge lock,
/// so the timeout counter is atomic; everything else is immutable after
/// creation.
#[derive(Debug)]
pub struct PioMap {
    pub slot: SlotId,
    pub space: PciSpace,
    pub pci_addr: u64,
    pub size: u64,
    pub fabric: FabricAddr,
    pub(crate) kind: PioMapKind,
    /// Fabric timeouts that landed inside this mapping's range.
    pub fault_timeouts: AtomicU32,
}

impl PioMap {
    pub fn contains(&self, pci_addr: u64) -> bool {
        pci_addr >= self.pci_addr && pci_addr < self.pci_addr.saturating_add(self.size)
    }
}

/// Caller-held handle to a live mapping.
#[derive(Clone, Debug)]
pub struct PioMapHandle(pub(crate) Arc<PioMap>);

impl PioMapHandle {
    pub fn fabric_base(&self) -> FabricAddr {
        self.0.fabric
    }

    pub fn pci_base(&self) -> u64 {
        self.0.pci_addr
    }

    pub fn size(&self) -> u64 {
        self.0.size
    }

    /// Fabric timeouts observed inside this mapping so far.
    pub fn fault_timeouts(&self) -> u32 {
        self.0.fault_timeouts.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Resolution of a request down to a concrete bus range.
struct ResolvedTarget {
    class: SpaceClass,
    pci_addr: u64,
    window: Option<WindowId>,
}

impl BridgeState {
    fn resolve_target(
        &self,
        slot: SlotId,
        space: PciSpace,
        addr: u64,
        size: u64,
    ) -> Result<ResolvedTarget> {
        let slot_state = &self.slots[slot.index()];
        let out_of_window = || BridgeError::AddressOutOfRange { addr, size };

        match space {
            PciSpace::Win(id) => {
                let win = slot_state.window(id).ok_or(BridgeError::InvalidArgument(
                    "device window not populated",
                ))?;
                let pci_addr = win.base.checked_add(addr).ok_or_else(out_of_window)?;
                if !win.contains(pci_addr, size) {
                    return Err(out_of_window());
                }
                Ok(ResolvedTarget {
                    class: space_class(win.space)?,
                    pci_addr,
                    window: Some(id),
                })
            }
            PciSpace::Rom => {
                let win = slot_state
                    .rom_window
                    .as_ref()
                    .ok_or(BridgeError::InvalidArgument("no expansion ROM window"))?;
                let pci_addr = win.base.checked_add(addr).ok_or_else(out_of_window)?;
                if !win.contains(pci_addr, size) {
                    return Err(out_of_window());
                }
                Ok(ResolvedTarget {
                    class: SpaceClass::Mem,
                    pci_addr,
                    window: None,
                })
            }
            PciSpace::Io | PciSpace::Mem32 | PciSpace::Mem64 => Ok(ResolvedTarget {
                class: space_class(space)?,
                pci_addr: addr,
                window: slot_state.find_window(space, addr, size),
            }),
            PciSpace::Cfg => Err(BridgeError::InvalidArgument(
                "config space resolves before window routing",
            )),
        }
    }

    /// DevIO scan: start at the requesting slot's own window to bias reuse,
    /// first matching windows already decoding a compatible range, then
    /// repointable unclaimed ones. Another populated slot's primary window
    /// is never repurposed, claimed or not.
    fn devio_acquire(
        &mut self,
        slot: SlotId,
        class: SpaceClass,
        pci_addr: u64,
        size: u64,
        swap: bool,
    ) -> Result<Option<usize>> {
        let order = (0..DEVIO_COUNT).map(|i| (slot.index() + i) % DEVIO_COUNT);
        let mut swap_conflict = false;

        for w in order.clone() {
            let win = &self.devio[w];
            if !win.word.enabled() {
                continue;
            }
            let aperture = devio_aperture(w);
            let fits = win.word.space() == class
                && pci_addr >= win.word.base()
                && pci_addr.saturating_add(size) <= win.word.base() + aperture;
            if !fits {
                continue;
            }
            if win.word.swap() != swap {
                if win.users > 0 {
                    swap_conflict = true;
                    continue;
                }
                // Unclaimed: the swap mode may be reconfigured in place,
                // subject to the primary-window rule below.
                if w != slot.index() && self.slots[w].populated {
                    continue;
                }
                let word = DevioWord::new(win.word.base(), class, swap);
                self.devio[w].word = word;
                self.hw.set_devio(w, word);
            }
            self.devio[w].owner = Some(slot);
            self.devio[w].users += 1;
            return Ok(Some(w));
        }

        for w in order {
            if self.devio[w].users > 0 {
                continue;
            }
            if w != slot.index() && self.slots[w].populated {
                continue;
            }
            let aperture = devio_aperture(w);
            let base = pci_addr & !(aperture - 1);
            if pci_addr.saturating_add(size) > base + aperture {
                continue;
            }
            let word = DevioWord::new(base, class, swap);
            self.devio[w].word = word;
            self.devio[w].owner = Some(slot);
            self.devio[w].users = 1;
            self.hw.set_devio(w, word);
            return Ok(Some(w));
        }

        if swap_conflict {
            // A window decodes the range but someone is using it at the
            // other byte-swap mode; surfacing this beats silently taking
            // the slow aperture.
            use super::regs::DeviceWord;
            let (requested, held) = if swap {
                (DeviceWord::SWAP_DIRECT, DeviceWord::empty())
            } else {
                (DeviceWord::empty(), DeviceWord::SWAP_DIRECT)
            };
            return Err(BridgeError::AttributeConflict {
                slot,
                requested,
                held,
            });
        }
        Ok(None)
    }

    /// Direct-aperture byte-swap negotiation: the first user of a space
    /// fixes the mode; it can only flip while the space is idle.
    fn direct_swap_acquire(&mut self, class: SpaceClass, swap: bool) -> Result<()> {
        let idx = match class {
            SpaceClass::Io => 0,
            SpaceClass::Mem => 1,
        };
        let state = &mut self.direct_swap[idx];
        if state.users > 0 && state.swap != swap {
            return Err(BridgeError::InvalidArgument(
                "direct PIO space already fixed at the other byte-swap mode",
            ));
        }
        if state.users == 0 && state.swap != swap {
            state.swap = swap;
            self.hw.set_pio_swap(class, swap);
        }
        self.direct_swap[idx].users += 1;
        Ok(())
    }
}

impl Bridge {
    /// Establishes a PIO path to `size` bytes at `addr` of `space`.
    ///
    /// `max_size` bounds how much the caller would accept; the mapping is
    /// made for `size` and may be translated anywhere inside it.
    pub fn piomap_alloc(
        &self,
        conn: DevConn,
        space: PciSpace,
        addr: u64,
        size: u64,
        max_size: u64,
        flags: PioFlags,
    ) -> Result<PioMapHandle> {
        if size == 0 || max_size < size {
            return Err(BridgeError::InvalidArgument("bad PIO map size"));
        }

        let mut st = self.lock();
        st.usable_slot(conn.slot)?;
        let slot = st.slots[conn.slot.index()].host.unwrap_or(conn.slot);
        let swap = flags.contains(PioFlags::BYTE_SWAP);

        // Config space short-circuits all window machinery.
        if space == PciSpace::Cfg {
            if addr.saturating_add(size) > CFG_SLOT_STRIDE {
                return Err(BridgeError::AddressOutOfRange { addr, size });
            }
            let stride = CFG_SLOT_STRIDE * slot.index() as u64;
            let path = self.fabric.pio_translate(
                self.widget,
                FabricAddr(CFG_FABRIC_BASE + stride + addr),
                size,
                TransportFlags::default(),
            )?;
            let map = Arc::new(PioMap {
                slot,
                space,
                pci_addr: CFG_PCI_BASE + stride + addr,
                size,
                fabric: path.base,
                kind: PioMapKind::Cfg,
                fault_timeouts: AtomicU32::new(0),
            });
            st.pio_maps.push(Arc::clone(&map));
            return Ok(PioMapHandle(map));
        }

        let target = st.resolve_target(slot, space, addr, size)?;

        if let Some(w) = st.devio_acquire(slot, target.class, target.pci_addr, size, swap)? {
            let local = FabricAddr(
                DEVIO_FABRIC_BASE
                    + w as u64 * DEVIO_FABRIC_STRIDE
                    + (target.pci_addr - st.devio[w].word.base()),
            );
            let path = match self
                .fabric
                .pio_translate(self.widget, local, size, TransportFlags::default())
            {
                Ok(path) => path,
                Err(err) => {
                    // Give the window claim back; nothing else changed.
                    st.devio[w].users -= 1;
                    return Err(err.into());
                }
            };
            if let Some(id) = target.window {
                if let Some(win) = st.slots[slot.index()].window_mut(id) {
                    win.maps += 1;
                }
            }
            let map = Arc::new(PioMap {
                slot,
                space,
                pci_addr: target.pci_addr,
                size,
                fabric: path.base,
                kind: PioMapKind::Devio {
                    window: w,
                    bar: target.window,
                },
                fault_timeouts: AtomicU32::new(0),
            });
            st.pio_maps.push(Arc::clone(&map));
            return Ok(PioMapHandle(map));
        }

        if !flags.contains(PioFlags::FIXED) {
            return Err(BridgeError::ResourceExhausted {
                resource: "DevIO windows",
                wanted: 1,
                free: 0,
            });
        }

        st.direct_swap_acquire(target.class, swap)?;
        let fabric_base = match target.class {
            SpaceClass::Io => PIO_DIRECT_IO_FABRIC_BASE,
            SpaceClass::Mem => PIO_DIRECT_MEM_FABRIC_BASE,
        };
        let path = match self.fabric.pio_translate(
            self.widget,
            FabricAddr(fabric_base + target.pci_addr),
            size,
            TransportFlags::default(),
        ) {
            Ok(path) => path,
            Err(err) => {
                let idx = match target.class {
                    SpaceClass::Io => 0,
                    SpaceClass::Mem => 1,
                };
                st.direct_swap[idx].users -= 1;
                return Err(err.into());
            }
        };
        let map = Arc::new(PioMap {
            slot,
            space,
            pci_addr: target.pci_addr,
            size,
            fabric: path.base,
            kind: PioMapKind::Direct(target.class),
            fault_timeouts: AtomicU32::new(0),
        });
        st.pio_maps.push(Arc::clone(&map));
        Ok(PioMapHandle(map))
    }

    /// Releases a mapping and the window claim behind it.
    pub fn piomap_free(&self, handle: PioMapHandle) {
        let mut st = self.lock();
        let map = handle.0;
        st.pio_maps.retain(|m| !Arc::ptr_eq(m, &map));

        match map.kind {
            PioMapKind::Cfg => {}
            PioMapKind::Devio { window, bar } => {
                st.devio[window].users = st.devio[window].users.saturating_sub(1);
                if let Some(id) = bar {
                    if let Some(win) = st.slots[map.slot.index()].window_mut(id) {
                        win.maps = win.maps.saturating_sub(1);
                    }
                }
            }
            PioMapKind::Direct(class) => {
                let idx = match class {
                    SpaceClass::Io => 0,
                    SpaceClass::Mem => 1,
                };
                st.direct_swap[idx].users = st.direct_swap[idx].users.saturating_sub(1);
            }
        }
    }

    /// PCI → fabric translation inside an established mapping.
    pub fn piomap_translate_addr(
        &self,
        handle: &PioMapHandle,
        pci_addr: u64,
        len: u64,
    ) -> Result<FabricAddr> {
        let map = &handle.0;
        if pci_addr < map.pci_addr
            || pci_addr.saturating_add(len) > map.pci_addr.saturating_add(map.size)
        {
            return Err(BridgeError::AddressOutOfRange { addr: pci_addr, size: len });
        }
        Ok(map.fabric.offset(pci_addr - map.pci_addr))
    }

    /// Inverse of [`Self::piomap_translate_addr`], for fault attribution and
    /// the round-trip law.
    pub fn piomap_inverse(&self, handle: &PioMapHandle, fabric: FabricAddr) -> Result<u64> {
        let map = &handle.0;
        let offset = fabric
            .checked_sub(map.fabric)
            .filter(|off| *off < map.size)
            .ok_or(BridgeError::AddressOutOfRange {
                addr: fabric.0,
                size: 0,
            })?;
        Ok(map.pci_addr + offset)
    }
}

fn space_class(space: PciSpace) -> Result<SpaceClass> {
    match space {
        PciSpace::Io => Ok(SpaceClass::Io),
        PciSpace::Mem32 | PciSpace::Mem64 | PciSpace::Rom => Ok(SpaceClass::Mem),
        _ => Err(BridgeError::InvalidArgument("space has no PIO class")),
    }
}
