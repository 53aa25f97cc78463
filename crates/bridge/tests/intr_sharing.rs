use std::sync::{Arc, Mutex};

use xfab_bridge::bridge::{
    Bridge, BridgeConfig, DeviceInfo, HwWrite, IntrBit, ModelHw, PciPin, SlotId,
};
use xfab_fabric::loopback::LoopbackFabric;

fn setup() -> (Arc<Bridge>, ModelHw, Arc<LoopbackFabric>) {
    let hw = ModelHw::new(64);
    let fabric = Arc::new(LoopbackFabric::new());
    let bridge = Bridge::attach(
        BridgeConfig::default(),
        Box::new(hw.clone()),
        Arc::clone(&fabric) as Arc<dyn xfab_fabric::FabricTransport>,
    );
    (bridge, hw, fabric)
}

fn flush_count(hw: &ModelHw, slot: SlotId) -> usize {
    hw.writes()
        .iter()
        .filter(|w| matches!(w, HwWrite::FlushWriteBuffer { slot: s } if *s == slot))
        .count()
}

#[test]
fn swizzle_lands_slot0_pin_a_and_slot4_pin_b_on_the_same_bit() {
    use xfab_bridge::bridge::intr::default_intr_bit;
    let bit = default_intr_bit(SlotId::new(0).unwrap(), PciPin::A);
    assert_eq!(bit, default_intr_bit(SlotId::new(4).unwrap(), PciPin::B));
    assert_eq!(bit, IntrBit::new(0).unwrap());
}

#[test]
fn shared_bit_invokes_both_handlers_in_order_with_flushes() {
    let (bridge, hw, fabric) = setup();
    let slot0 = SlotId::new(0).unwrap();
    let slot4 = SlotId::new(4).unwrap();
    bridge.populate_slot(slot0, DeviceInfo::default()).unwrap();
    bridge.populate_slot(slot4, DeviceInfo::default()).unwrap();
    let conn0 = bridge.conn(slot0, 0).unwrap();
    let conn4 = bridge.conn(slot4, 0).unwrap();

    let handle0 = bridge.intr_alloc(conn0, &[PciPin::A], false).unwrap();
    let handle4 = bridge.intr_alloc(conn4, &[PciPin::B], false).unwrap();
    let bit = handle0.bits()[0];
    assert_eq!(handle4.bits(), vec![bit]);

    // One attacher won the fabric allocation; the loser adopted its line.
    assert_eq!(fabric.lines_allocated(), 1);

    // Each handler records how many of its device's flushes had been issued
    // by the time it ran; the second handler also retires the interrupt.
    let events: Arc<Mutex<Vec<(&'static str, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let ev = Arc::clone(&events);
    let hw0 = hw.clone();
    bridge
        .intr_connect(
            &handle0,
            Arc::new(move || {
                ev.lock().unwrap().push(("slot0", flush_count(&hw0, slot0)));
            }),
        )
        .unwrap();

    let ev = Arc::clone(&events);
    let hw4 = hw.clone();
    bridge
        .intr_connect(
            &handle4,
            Arc::new(move || {
                ev.lock().unwrap().push(("slot4", flush_count(&hw4, slot4)));
                hw4.lower_device_int(bit);
            }),
        )
        .unwrap();

    hw.raise_device_int(bit);
    let line = fabric.line(hw.int_target_raw(bit)).expect("line routed");
    line.deliver();

    let seen = events.lock().unwrap().clone();
    assert_eq!(seen, vec![("slot0", 1), ("slot4", 1)]);

    // Removing one handler leaves the other still invoked.
    bridge.intr_disconnect(&handle0);
    hw.raise_device_int(bit);
    line.deliver();
    let seen = events.lock().unwrap().clone();
    assert_eq!(seen.last().unwrap().0, "slot4");
    assert_eq!(seen.len(), 3);

    // With nobody left, dispatch turns the enable bit off instead of
    // spinning on an unserviceable interrupt.
    bridge.intr_disconnect(&handle4);
    hw.raise_device_int(bit);
    line.deliver();
    assert!(!hw.int_enable_raw().device(bit));

    bridge.intr_free(handle0);
    bridge.intr_free(handle4);
}

#[test]
fn administrative_override_beats_the_swizzle() {
    let hw = ModelHw::new(64);
    let fabric = Arc::new(LoopbackFabric::new());
    let mut intr_override = [[None; 4]; 8];
    intr_override[0][0] = Some(IntrBit::new(5).unwrap());
    let bridge = Bridge::attach(
        BridgeConfig {
            intr_override,
            ..BridgeConfig::default()
        },
        Box::new(hw.clone()),
        Arc::clone(&fabric) as Arc<dyn xfab_fabric::FabricTransport>,
    );

    let slot = SlotId::new(0).unwrap();
    bridge.populate_slot(slot, DeviceInfo::default()).unwrap();
    let conn = bridge.conn(slot, 0).unwrap();

    let handle = bridge.intr_alloc(conn, &[PciPin::A], false).unwrap();
    assert_eq!(handle.bits(), vec![IntrBit::new(5).unwrap()]);
    bridge.intr_free(handle);
}

#[test]
fn single_handler_bit_routes_directly() {
    let (bridge, hw, fabric) = setup();
    let slot1 = SlotId::new(1).unwrap();
    bridge.populate_slot(slot1, DeviceInfo::default()).unwrap();
    let conn = bridge.conn(slot1, 0).unwrap();

    let handle = bridge.intr_alloc(conn, &[PciPin::A], false).unwrap();
    let bit = handle.bits()[0];

    let hits = Arc::new(Mutex::new(0u32));
    let hits_in = Arc::clone(&hits);
    bridge
        .intr_connect(
            &handle,
            Arc::new(move || {
                *hits_in.lock().unwrap() += 1;
            }),
        )
        .unwrap();
    assert!(hw.int_enable_raw().device(bit));

    let line = fabric.line(hw.int_target_raw(bit)).unwrap();
    line.deliver();
    line.deliver();
    assert_eq!(*hits.lock().unwrap(), 2);

    bridge.intr_disconnect(&handle);
    line.deliver();
    assert_eq!(*hits.lock().unwrap(), 2);

    bridge.intr_free(handle);
}

#[test]
fn thread_preferred_handlers_run_from_the_deferred_queue() {
    let (bridge, hw, fabric) = setup();
    let slot0 = SlotId::new(0).unwrap();
    let slot4 = SlotId::new(4).unwrap();
    bridge.populate_slot(slot0, DeviceInfo::default()).unwrap();
    bridge.populate_slot(slot4, DeviceInfo::default()).unwrap();

    // Two handlers force shared dispatch; the deferred one must not run
    // inline.
    let conn0 = bridge.conn(slot0, 0).unwrap();
    let conn4 = bridge.conn(slot4, 0).unwrap();
    let inline = bridge.intr_alloc(conn0, &[PciPin::A], false).unwrap();
    let deferred = bridge.intr_alloc(conn4, &[PciPin::B], true).unwrap();
    let bit = inline.bits()[0];

    let ran: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let ran_in = Arc::clone(&ran);
    let hw_in = hw.clone();
    bridge
        .intr_connect(
            &inline,
            Arc::new(move || {
                ran_in.lock().unwrap().push("inline");
                hw_in.lower_device_int(bit);
            }),
        )
        .unwrap();
    let ran_def = Arc::clone(&ran);
    bridge
        .intr_connect(
            &deferred,
            Arc::new(move || {
                ran_def.lock().unwrap().push("deferred");
            }),
        )
        .unwrap();

    hw.raise_device_int(bit);
    fabric.line(hw.int_target_raw(bit)).unwrap().deliver();

    assert_eq!(*ran.lock().unwrap(), vec!["inline"]);
    bridge.run_deferred();
    assert_eq!(*ran.lock().unwrap(), vec!["inline", "deferred"]);

    bridge.intr_free(inline);
    bridge.intr_free(deferred);
}
