use std::sync::Arc;

use xfab_bridge::bridge::regs::{
    DeviceWord, D64_ADDR_MASK, D64_MARKER, DIRECT32_SIZE,
};
use xfab_bridge::bridge::{
    Bridge, BridgeConfig, BridgeError, DeviceInfo, DmaFlags, DmaMode, ModelHw, SlotId,
};
use xfab_fabric::loopback::LoopbackFabric;
use xfab_fabric::FabricAddr;

fn bridge() -> (Arc<Bridge>, ModelHw) {
    let hw = ModelHw::new(4096);
    let bridge = Bridge::attach(
        BridgeConfig {
            internal_ates: 64,
            external_ates: 1024,
            ..BridgeConfig::default()
        },
        Box::new(hw.clone()),
        Arc::new(LoopbackFabric::new()),
    );
    (bridge, hw)
}

fn populated(bridge: &Bridge, slot: u8) -> xfab_bridge::bridge::DevConn {
    let slot = SlotId::new(slot).unwrap();
    bridge.populate_slot(slot, DeviceInfo::default()).unwrap();
    bridge.conn(slot, 0).unwrap()
}

#[test]
fn direct64_carries_the_fabric_address_in_band() {
    let (bridge, _hw) = bridge();
    let conn = populated(&bridge, 0);

    let map = bridge
        .dmamap_alloc(conn, 0x10_0000, DmaFlags::ADDR64 | DmaFlags::BARRIER)
        .unwrap();
    assert_eq!(map.mode, DmaMode::Direct64);

    let pci = bridge.dmamap_addr(&map, FabricAddr(0xABCD_E000), 0x1000).unwrap();
    assert_ne!(pci & D64_MARKER, 0);
    assert_eq!(pci & D64_ADDR_MASK, 0xABCD_E000);

    // A target beyond 48 bits cannot ride the in-band encoding.
    assert!(matches!(
        bridge.dmamap_addr(&map, FabricAddr(1 << 50), 0x1000),
        Err(BridgeError::AddressOutOfRange { .. })
    ));

    bridge.dmamap_free(map);
}

#[test]
fn direct32_translates_only_inside_the_fixed_window() {
    let (bridge, _hw) = bridge();
    let conn = populated(&bridge, 1);
    let window_base = BridgeConfig::default().direct32_base;

    let map = bridge.dmamap_alloc(conn, 0x1000, DmaFlags::empty()).unwrap();
    assert_eq!(map.mode, DmaMode::Direct32);

    let pci = bridge
        .dmamap_addr(&map, window_base.offset(0x4_0000), 0x1000)
        .unwrap();
    // Round trip: the window offset is recoverable from the PCI address.
    assert_eq!(pci - map.pci_base(), 0x4_0000);

    assert!(matches!(
        bridge.dmamap_addr(&map, FabricAddr(window_base.0 + DIRECT32_SIZE), 0x1000),
        Err(BridgeError::AddressOutOfRange { .. })
    ));
    assert!(matches!(
        bridge.dmamap_addr(&map, FabricAddr(0), 0x1000),
        Err(BridgeError::AddressOutOfRange { .. })
    ));

    bridge.dmamap_free(map);
}

#[test]
fn forceable_conflicts_are_reconciled_not_failed() {
    let (bridge, hw) = bridge();
    let conn = populated(&bridge, 2);
    let slot = SlotId::new(2).unwrap();

    // First user establishes write-gather, no barrier.
    let first = bridge
        .dmamap_alloc(conn, 0x1000, DmaFlags::WRITE_GATHER)
        .unwrap();
    assert!(hw.device_word_raw(slot).contains(DeviceWord::WRITE_GATHER));

    // Second user wants a barrier and no write-gather: barrier is in the
    // force-on set, write-gather in the force-off set, so both users end up
    // sharing a stricter word instead of failing.
    let second = bridge
        .dmamap_alloc(conn, 0x1000, DmaFlags::BARRIER)
        .unwrap();
    let word = hw.device_word_raw(slot);
    assert!(word.contains(DeviceWord::BARRIER));
    assert!(!word.contains(DeviceWord::WRITE_GATHER));

    bridge.dmamap_free(first);
    bridge.dmamap_free(second);
}

#[test]
fn unforceable_conflict_is_distinct_from_exhaustion() {
    let (bridge, _hw) = bridge();
    let conn = populated(&bridge, 3);

    // Byte-swap cannot be forced either way on the shared direct word.
    let first = bridge
        .dmamap_alloc(conn, 0x1000, DmaFlags::FIXED32 | DmaFlags::BYTE_SWAP)
        .unwrap();
    let err = bridge
        .dmamap_alloc(conn, 0x1000, DmaFlags::FIXED32)
        .unwrap_err();
    assert!(matches!(err, BridgeError::AttributeConflict { .. }));

    // Freeing the last user unpins the word; the opposite mode then wins.
    bridge.dmamap_free(first);
    let plain = bridge.dmamap_alloc(conn, 0x1000, DmaFlags::FIXED32).unwrap();
    bridge.dmamap_free(plain);
}

#[test]
fn attribute_toggles_respect_pins_from_live_maps() {
    let (bridge, hw) = bridge();
    let conn = populated(&bridge, 6);
    let slot = SlotId::new(6).unwrap();

    // Priority is not part of any mode's shared set and always toggles.
    bridge.device_priority_set(conn, true).unwrap();
    assert!(hw.device_word_raw(slot).contains(DeviceWord::PRIORITY));

    let map = bridge
        .dmamap_alloc(conn, 0x1000, DmaFlags::FIXED32 | DmaFlags::BYTE_SWAP)
        .unwrap();

    // The live direct-32 map pins the swap bit against endian changes.
    assert!(matches!(
        bridge.device_endian_set(conn, false, false),
        Err(BridgeError::AttributeConflict { .. })
    ));

    bridge.dmamap_free(map);
    bridge.device_endian_set(conn, false, false).unwrap();
    assert!(!hw.device_word_raw(slot).contains(DeviceWord::SWAP_DIRECT));
    bridge.device_priority_set(conn, false).unwrap();
    assert!(!hw.device_word_raw(slot).contains(DeviceWord::PRIORITY));
}

#[test]
fn windowed_requests_program_table_entries() {
    let (bridge, hw) = bridge();
    let conn = populated(&bridge, 4);

    let map = bridge
        .dmamap_alloc(conn, 0x4000, DmaFlags::WINDOWED | DmaFlags::BARRIER)
        .unwrap();
    assert_eq!(map.mode, DmaMode::AteWindowed);

    let target = FabricAddr(0x1234_5678);
    let pci = bridge.dmamap_addr(&map, target, 0x3000).unwrap();

    // The low page-offset bits survive translation.
    assert_eq!(pci & 0xFFF, 0x678);

    // The first programmed entry names the target's page.
    let base_entry = hw.ate_entry(first_ate_index(&bridge, &map));
    assert!(base_entry.is_valid());
    assert_eq!(base_entry.page(), FabricAddr(0x1234_5000));

    bridge.dmamap_free(map);
}

fn first_ate_index(_bridge: &Bridge, map: &xfab_bridge::bridge::DmaMap) -> u32 {
    use xfab_bridge::bridge::regs::{ATE_PAGE_SHIFT, DMA_MAPPED_PCI_BASE};
    ((map.pci_base() - DMA_MAPPED_PCI_BASE) >> ATE_PAGE_SHIFT) as u32
}

#[test]
fn guest_slot_draws_on_the_host_configuration() {
    let (bridge, hw) = bridge();
    let host = SlotId::new(0).unwrap();
    let guest = SlotId::new(1).unwrap();
    bridge.populate_slot(host, DeviceInfo::default()).unwrap();
    bridge
        .populate_slot(
            guest,
            DeviceInfo {
                host: Some(host),
                ..DeviceInfo::default()
            },
        )
        .unwrap();
    let conn_guest = bridge.conn(guest, 0).unwrap();

    // A channel opened through the guest lands on the host's accounting
    // and attribute word.
    let map = bridge
        .dmamap_alloc(conn_guest, 0x1000, DmaFlags::FIXED32 | DmaFlags::BYTE_SWAP)
        .unwrap();
    assert_eq!(map.slot, host);
    assert!(hw.device_word_raw(host).contains(DeviceWord::SWAP_DIRECT));
    assert!(!hw.device_word_raw(guest).contains(DeviceWord::SWAP_DIRECT));

    bridge.dmamap_free(map);
}

#[test]
fn administered_pairing_is_applied_when_the_probe_reports_none() {
    let hw = ModelHw::new(4096);
    let mut guest_of = [None; 8];
    guest_of[3] = Some(SlotId::new(2).unwrap());
    let bridge = Bridge::attach(
        BridgeConfig {
            guest_of,
            ..BridgeConfig::default()
        },
        Box::new(hw.clone()),
        Arc::new(LoopbackFabric::new()),
    );
    bridge
        .populate_slot(SlotId::new(2).unwrap(), DeviceInfo::default())
        .unwrap();
    bridge
        .populate_slot(SlotId::new(3).unwrap(), DeviceInfo::default())
        .unwrap();

    let conn = bridge.conn(SlotId::new(3).unwrap(), 0).unwrap();
    let map = bridge.dmamap_alloc(conn, 0x1000, DmaFlags::empty()).unwrap();
    assert_eq!(map.slot, SlotId::new(2).unwrap());
    bridge.dmamap_free(map);
}

#[test]
fn scatter_gather_segments_pack_into_consecutive_entries() {
    let (bridge, _hw) = bridge();
    let conn = populated(&bridge, 5);

    let map = bridge
        .dmamap_alloc(conn, 0x8000, DmaFlags::WINDOWED)
        .unwrap();
    assert_eq!(map.mode, DmaMode::AteWindowed);

    let translated = bridge
        .dmamap_list(
            &map,
            &[
                (FabricAddr(0x10_0000), 0x1000),
                (FabricAddr(0x20_0800), 0x800),
            ],
        )
        .unwrap();
    assert_eq!(translated.len(), 2);
    assert_eq!(translated[0].0 & 0xFFF, 0);
    assert_eq!(translated[1].0 & 0xFFF, 0x800);
    // Segments land at increasing entry offsets within the window.
    assert!(translated[1].0 > translated[0].0);

    bridge.dmamap_free(map);
}
