//! Hardware seam: the register accesses the bridge core performs, and a
//! software model of them for tests and bring-up.

use std::sync::{Arc, Mutex, MutexGuard};

use xfab_fabric::FabricAddr;

use super::regs::{
    AteEntry, DeviceWord, DevioWord, ErrorStatus, IntEnable, IntStatus, RrbMapWord, SpaceClass,
    DEVIO_COUNT, RRB_PER_PARITY, SLOT_COUNT,
};
use super::{IntrBit, RrbParity, SlotId};

/// Register accesses the resource-management core performs.
///
/// Reads of the drain/valid status take `&mut self` because polling them has
/// side effects on some revisions (and lets the model count polls).
pub trait BridgeHw: Send {
    fn rrb_map(&self, parity: RrbParity) -> RrbMapWord;
    fn set_rrb_map(&mut self, parity: RrbParity, map: RrbMapWord);

    /// True while the numbered buffer still holds an in-flight fabric packet.
    fn rrb_in_flight(&mut self, parity: RrbParity, field: usize) -> bool;
    /// True while the numbered buffer holds valid, unconsumed response data.
    fn rrb_has_data(&mut self, parity: RrbParity, field: usize) -> bool;

    fn device_word(&self, slot: SlotId) -> DeviceWord;
    fn set_device_word(&mut self, slot: SlotId, word: DeviceWord);

    fn set_ate(&mut self, index: u32, entry: AteEntry);

    fn set_devio(&mut self, window: usize, word: DevioWord);
    fn set_pio_swap(&mut self, space: SpaceClass, swap: bool);
    fn set_direct32_base(&mut self, base: FabricAddr);

    fn int_enable(&self) -> IntEnable;
    fn set_int_enable(&mut self, enable: IntEnable);
    fn int_status(&self) -> IntStatus;
    fn set_int_target(&mut self, bit: IntrBit, target: u64);

    fn error_status(&self) -> ErrorStatus;
    /// PCI address captured with the latched error, where the class has one.
    fn error_address(&self) -> u64;
    fn clear_error(&mut self, classes: ErrorStatus);

    /// Read-back that forces completion ordering of prior register writes.
    fn ordering_readback(&mut self, slot: SlotId);
    /// Flushes the slot's posted-write buffer.
    fn flush_write_buffer(&mut self, slot: SlotId);
}

/// Every write the model observes, in issue order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwWrite {
    RrbMap { parity: RrbParity, map: RrbMapWord },
    DeviceWord { slot: SlotId, word: DeviceWord },
    Ate { index: u32, entry: AteEntry },
    Devio { window: usize, word: DevioWord },
    PioSwap { space: SpaceClass, swap: bool },
    Direct32Base(FabricAddr),
    IntEnable(IntEnable),
    IntTarget { bit: IntrBit, target: u64 },
    ClearError(ErrorStatus),
    OrderingReadback { slot: SlotId },
    FlushWriteBuffer { slot: SlotId },
}

#[derive(Debug)]
struct ModelState {
    rrb_map: [RrbMapWord; 2],
    // Remaining polls before a buffer reports drained / empty.
    in_flight_polls: [[u32; RRB_PER_PARITY]; 2],
    has_data_polls: [[u32; RRB_PER_PARITY]; 2],
    device_words: [DeviceWord; SLOT_COUNT],
    ate: Vec<AteEntry>,
    devio: [DevioWord; DEVIO_COUNT],
    pio_swap: [bool; 2],
    direct32_base: FabricAddr,
    int_enable: IntEnable,
    int_status_device: u32,
    int_target: [u64; 8],
    error_status: ErrorStatus,
    error_address: u64,
    writes: Vec<HwWrite>,
}

/// Software register model.
///
/// Cloning yields another handle onto the same registers, so a test can hold
/// one while the bridge owns the other: inject latched errors or drain
/// delays, then assert against the write log.
#[derive(Clone)]
pub struct ModelHw(Arc<Mutex<ModelState>>);

impl ModelHw {
    pub fn new(ate_entries: u32) -> Self {
        ModelHw(Arc::new(Mutex::new(ModelState {
            rrb_map: [RrbMapWord::default(); 2],
            in_flight_polls: [[0; RRB_PER_PARITY]; 2],
            has_data_polls: [[0; RRB_PER_PARITY]; 2],
            device_words: [DeviceWord::default(); SLOT_COUNT],
            ate: vec![AteEntry::invalid(); ate_entries as usize],
            devio: [DevioWord::disabled(); DEVIO_COUNT],
            pio_swap: [false; 2],
            direct32_base: FabricAddr(0),
            int_enable: IntEnable::default(),
            int_status_device: 0,
            int_target: [0; 8],
            error_status: ErrorStatus::empty(),
            error_address: 0,
            writes: Vec::new(),
        })))
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.0.lock().expect("hardware model lock poisoned")
    }

    /// Makes the named buffer report "in flight" for the next `polls` reads.
    pub fn inject_drain_delay(&self, parity: RrbParity, field: usize, polls: u32) {
        self.lock().in_flight_polls[parity.index()][field] = polls;
    }

    /// Makes the named buffer report "valid data" for the next `polls` reads.
    pub fn inject_data_delay(&self, parity: RrbParity, field: usize, polls: u32) {
        self.lock().has_data_polls[parity.index()][field] = polls;
    }

    /// Latches an error with its captured PCI address.
    pub fn inject_error(&self, classes: ErrorStatus, address: u64) {
        let mut st = self.lock();
        st.error_status |= classes;
        st.error_address = address;
    }

    pub fn raise_device_int(&self, bit: IntrBit) {
        self.lock().int_status_device |= 1 << bit.index();
    }

    pub fn lower_device_int(&self, bit: IntrBit) {
        self.lock().int_status_device &= !(1 << bit.index());
    }

    pub fn ate_entry(&self, index: u32) -> AteEntry {
        self.lock().ate[index as usize]
    }

    pub fn device_word_raw(&self, slot: SlotId) -> DeviceWord {
        self.lock().device_words[slot.index()]
    }

    pub fn rrb_map_raw(&self, parity: RrbParity) -> RrbMapWord {
        self.lock().rrb_map[parity.index()]
    }

    pub fn int_target_raw(&self, bit: IntrBit) -> u64 {
        self.lock().int_target[bit.index()]
    }

    pub fn int_enable_raw(&self) -> IntEnable {
        self.lock().int_enable
    }

    pub fn writes(&self) -> Vec<HwWrite> {
        self.lock().writes.clone()
    }

    pub fn take_writes(&self) -> Vec<HwWrite> {
        std::mem::take(&mut self.lock().writes)
    }
}

impl BridgeHw for ModelHw {
    fn rrb_map(&self, parity: RrbParity) -> RrbMapWord {
        self.lock().rrb_map[parity.index()]
    }

    fn set_rrb_map(&mut self, parity: RrbParity, map: RrbMapWord) {
        let mut st = self.lock();
        st.rrb_map[parity.index()] = map;
        st.writes.push(HwWrite::RrbMap { parity, map });
    }

    fn rrb_in_flight(&mut self, parity: RrbParity, field: usize) -> bool {
        let mut st = self.lock();
        let polls = &mut st.in_flight_polls[parity.index()][field];
        if *polls > 0 {
            *polls -= 1;
            true
        } else {
            false
        }
    }

    fn rrb_has_data(&mut self, parity: RrbParity, field: usize) -> bool {
        let mut st = self.lock();
        let polls = &mut st.has_data_polls[parity.index()][field];
        if *polls > 0 {
            *polls -= 1;
            true
        } else {
            false
        }
    }

    fn device_word(&self, slot: SlotId) -> DeviceWord {
        self.lock().device_words[slot.index()]
    }

    fn set_device_word(&mut self, slot: SlotId, word: DeviceWord) {
        let mut st = self.lock();
        st.device_words[slot.index()] = word;
        st.writes.push(HwWrite::DeviceWord { slot, word });
    }

    fn set_ate(&mut self, index: u32, entry: AteEntry) {
        let mut st = self.lock();
        st.ate[index as usize] = entry;
        st.writes.push(HwWrite::Ate { index, entry });
    }

    fn set_devio(&mut self, window: usize, word: DevioWord) {
        let mut st = self.lock();
        st.devio[window] = word;
        st.writes.push(HwWrite::Devio { window, word });
    }

    fn set_pio_swap(&mut self, space: SpaceClass, swap: bool) {
        let mut st = self.lock();
        st.pio_swap[match space {
            SpaceClass::Io => 0,
            SpaceClass::Mem => 1,
        }] = swap;
        st.writes.push(HwWrite::PioSwap { space, swap });
    }

    fn set_direct32_base(&mut self, base: FabricAddr) {
        let mut st = self.lock();
        st.direct32_base = base;
        st.writes.push(HwWrite::Direct32Base(base));
    }

    fn int_enable(&self) -> IntEnable {
        self.lock().int_enable
    }

    fn set_int_enable(&mut self, enable: IntEnable) {
        let mut st = self.lock();
        st.int_enable = enable;
        st.writes.push(HwWrite::IntEnable(enable));
    }

    fn int_status(&self) -> IntStatus {
        let st = self.lock();
        let mut bits = st.int_status_device;
        if !st.error_status.is_empty() {
            bits |= 1 << 8;
        }
        IntStatus(bits)
    }

    fn set_int_target(&mut self, bit: IntrBit, target: u64) {
        let mut st = self.lock();
        st.int_target[bit.index()] = target;
        st.writes.push(HwWrite::IntTarget { bit, target });
    }

    fn error_status(&self) -> ErrorStatus {
        self.lock().error_status
    }

    fn error_address(&self) -> u64 {
        self.lock().error_address
    }

    fn clear_error(&mut self, classes: ErrorStatus) {
        let mut st = self.lock();
        st.error_status -= classes;
        st.writes.push(HwWrite::ClearError(classes));
    }

    fn ordering_readback(&mut self, slot: SlotId) {
        self.lock().writes.push(HwWrite::OrderingReadback { slot });
    }

    fn flush_write_buffer(&mut self, slot: SlotId) {
        self.lock().writes.push(HwWrite::FlushWriteBuffer { slot });
    }
}
