use std::sync::Arc;

use xfab_bridge::bridge::regs::{CFG_FABRIC_BASE, CFG_SLOT_STRIDE};
use xfab_bridge::bridge::{
    Bridge, BridgeConfig, BridgeError, DeviceInfo, HwWrite, ModelHw, PciSpace, PioFlags, SlotId,
};
use xfab_fabric::loopback::LoopbackFabric;
use xfab_fabric::FabricAddr;

/// All eight slots populated: every DevIO window is some slot's primary
/// window, which makes the repurposing rules observable.
fn full_bridge() -> (Arc<Bridge>, ModelHw) {
    let hw = ModelHw::new(256);
    let bridge = Bridge::attach(
        BridgeConfig::default(),
        Box::new(hw.clone()),
        Arc::new(LoopbackFabric::new()),
    );
    for slot in SlotId::all() {
        bridge.populate_slot(slot, DeviceInfo::default()).unwrap();
    }
    (bridge, hw)
}

#[test]
fn a_slots_maps_share_its_own_devio_window() {
    let (bridge, hw) = full_bridge();
    let slot = SlotId::new(2).unwrap();
    let conn = bridge.conn(slot, 0).unwrap();

    let first = bridge
        .piomap_alloc(conn, PciSpace::Mem32, 0x30_0000, 0x1000, 0x1000, PioFlags::empty())
        .unwrap();
    // The window programmed is the slot's own.
    assert!(hw
        .writes()
        .iter()
        .any(|w| matches!(w, HwWrite::Devio { window: 2, .. })));

    let second = bridge
        .piomap_alloc(conn, PciSpace::Mem32, 0x30_4000, 0x1000, 0x1000, PioFlags::empty())
        .unwrap();

    // Both ride the same window: same fabric region, offset by the PCI delta.
    assert_eq!(
        second.fabric_base().0 - first.fabric_base().0,
        0x30_4000 - 0x30_0000
    );

    bridge.piomap_free(first);
    bridge.piomap_free(second);
}

#[test]
fn translate_and_inverse_recover_the_original_address() {
    let (bridge, _hw) = full_bridge();
    let slot = SlotId::new(1).unwrap();
    let conn = bridge.conn(slot, 0).unwrap();

    let map = bridge
        .piomap_alloc(conn, PciSpace::Mem32, 0x31_0000, 0x2000, 0x2000, PioFlags::empty())
        .unwrap();

    let pci = 0x31_0a40;
    let fabric = bridge.piomap_translate_addr(&map, pci, 4).unwrap();
    assert_eq!(bridge.piomap_inverse(&map, fabric).unwrap(), pci);

    // Outside the mapping both directions refuse.
    assert!(bridge.piomap_translate_addr(&map, 0x31_2000, 4).is_err());
    assert!(bridge
        .piomap_inverse(&map, FabricAddr(fabric.0 + 0x10_0000))
        .is_err());

    bridge.piomap_free(map);
}

#[test]
fn swap_mode_change_on_a_claimed_window_is_a_conflict() {
    let (bridge, _hw) = full_bridge();
    let slot = SlotId::new(2).unwrap();
    let conn = bridge.conn(slot, 0).unwrap();

    let plain = bridge
        .piomap_alloc(conn, PciSpace::Mem32, 0x30_0000, 0x1000, 0x1000, PioFlags::empty())
        .unwrap();

    // Same range, opposite byte-swap mode: the only eligible window is in
    // use at the old mode, and no other window may be repurposed.
    let err = bridge
        .piomap_alloc(
            conn,
            PciSpace::Mem32,
            0x30_0000,
            0x1000,
            0x1000,
            PioFlags::BYTE_SWAP,
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::AttributeConflict { .. }));

    // Once the window is idle the new mode can be configured in place.
    bridge.piomap_free(plain);
    let swapped = bridge
        .piomap_alloc(
            conn,
            PciSpace::Mem32,
            0x30_0000,
            0x1000,
            0x1000,
            PioFlags::BYTE_SWAP,
        )
        .unwrap();
    bridge.piomap_free(swapped);
}

#[test]
fn another_slots_primary_window_is_never_repurposed() {
    let (bridge, hw) = full_bridge();
    let slot = SlotId::new(6).unwrap();
    let conn = bridge.conn(slot, 0).unwrap();

    // Larger than window 6's 1 MiB aperture; windows 0/1 are wide enough
    // but belong to populated slots, so only the fixed aperture remains.
    let err = bridge
        .piomap_alloc(
            conn,
            PciSpace::Mem32,
            0x180_0000,
            0x18_0000,
            0x18_0000,
            PioFlags::empty(),
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::ResourceExhausted { .. }));
    assert!(!hw
        .writes()
        .iter()
        .any(|w| matches!(w, HwWrite::Devio { window: 0, .. } | HwWrite::Devio { window: 1, .. })));

    let map = bridge
        .piomap_alloc(
            conn,
            PciSpace::Mem32,
            0x180_0000,
            0x18_0000,
            0x18_0000,
            PioFlags::FIXED,
        )
        .unwrap();

    // Round trip holds through the wide aperture too.
    let fabric = bridge.piomap_translate_addr(&map, 0x180_1234, 4).unwrap();
    assert_eq!(bridge.piomap_inverse(&map, fabric).unwrap(), 0x180_1234);

    bridge.piomap_free(map);
}

#[test]
fn direct_aperture_swap_is_first_user_wins() {
    let (bridge, _hw) = full_bridge();
    let slot = SlotId::new(5).unwrap();
    let conn = bridge.conn(slot, 0).unwrap();

    // Oversized maps bypass the DevIO tier and negotiate the direct
    // aperture's single swap mode.
    let plain = bridge
        .piomap_alloc(
            conn,
            PciSpace::Mem32,
            0x200_0000,
            0x18_0000,
            0x18_0000,
            PioFlags::FIXED,
        )
        .unwrap();

    let err = bridge
        .piomap_alloc(
            conn,
            PciSpace::Mem32,
            0x220_0000,
            0x18_0000,
            0x18_0000,
            PioFlags::FIXED | PioFlags::BYTE_SWAP,
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument(_)));

    // An idle space may flip.
    bridge.piomap_free(plain);
    let swapped = bridge
        .piomap_alloc(
            conn,
            PciSpace::Mem32,
            0x220_0000,
            0x18_0000,
            0x18_0000,
            PioFlags::FIXED | PioFlags::BYTE_SWAP,
        )
        .unwrap();
    bridge.piomap_free(swapped);
}

#[test]
fn config_space_maps_bypass_the_window_machinery() {
    let (bridge, hw) = full_bridge();
    let slot = SlotId::new(3).unwrap();
    let conn = bridge.conn(slot, 0).unwrap();

    hw.take_writes();
    let map = bridge
        .piomap_alloc(conn, PciSpace::Cfg, 0x40, 4, 4, PioFlags::empty())
        .unwrap();

    assert_eq!(
        map.fabric_base(),
        FabricAddr(CFG_FABRIC_BASE + 3 * CFG_SLOT_STRIDE + 0x40)
    );
    // No window was touched.
    assert!(!hw.writes().iter().any(|w| matches!(w, HwWrite::Devio { .. })));

    // Config offsets beyond the slot's aperture are rejected.
    assert!(bridge
        .piomap_alloc(conn, PciSpace::Cfg, CFG_SLOT_STRIDE, 4, 4, PioFlags::empty())
        .is_err());

    bridge.piomap_free(map);
}

#[test]
fn bar_window_requests_account_against_the_window() {
    use xfab_bridge::bridge::WindowId;

    let hw = ModelHw::new(256);
    let bridge = Bridge::attach(
        BridgeConfig::default(),
        Box::new(hw.clone()),
        Arc::new(LoopbackFabric::new()),
    );
    let slot = SlotId::new(0).unwrap();
    bridge
        .populate_slot(
            slot,
            DeviceInfo {
                windows: vec![(PciSpace::Mem32, 0x60_0000, 0x4000)],
                ..DeviceInfo::default()
            },
        )
        .unwrap();
    let conn = bridge.conn(slot, 0).unwrap();

    let map = bridge
        .piomap_alloc(
            conn,
            PciSpace::Win(WindowId::new(0).unwrap()),
            0x1000,
            0x800,
            0x800,
            PioFlags::empty(),
        )
        .unwrap();
    // Offset is window-relative.
    assert_eq!(map.pci_base(), 0x60_1000);

    // A request past the window's end refuses.
    assert!(bridge
        .piomap_alloc(
            conn,
            PciSpace::Win(WindowId::new(0).unwrap()),
            0x3c00,
            0x800,
            0x800,
            PioFlags::empty(),
        )
        .is_err());

    bridge.piomap_free(map);
}
