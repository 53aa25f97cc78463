//! Fault classification and recovery.
//!
//! Runs off the bridge error interrupt: decode what latched, attribute the
//! captured address to an owner, give that owner's handler the first shot,
//! and only then start disabling things: one slot at a time, never the
//! bridge.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::regs::{ErrorStatus, CFG_PCI_BASE, CFG_SLOT_STRIDE, SLOT_COUNT};
use super::slot::WINDOWS_PER_SLOT;
use super::{Bridge, PciSpace, SlotId, WindowId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultDisposition {
    /// The device recovered; clear and continue.
    Handled,
    /// The device cannot recover; the bridge fences the slot.
    Unhandled,
    /// Escalate beyond the bridge (the embedding kernel decides).
    Escalate,
}

/// Device-registered fault handler.
pub type FaultHandler = Arc<dyn Fn(&FaultContext) -> FaultDisposition + Send + Sync>;

/// Where the faulting address landed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Attribution {
    Config { slot: SlotId, offset: u64 },
    Window { slot: SlotId, window: WindowId },
    PioMap { slot: SlotId },
    /// Best-effort guess from the raw address ranges; low confidence.
    Guessed { space: PciSpace },
}

impl Attribution {
    pub fn owner(&self) -> Option<SlotId> {
        match *self {
            Attribution::Config { slot, .. }
            | Attribution::Window { slot, .. }
            | Attribution::PioMap { slot } => Some(slot),
            Attribution::Guessed { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FaultContext {
    pub classes: ErrorStatus,
    pub address: u64,
    pub attribution: Attribution,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// Nothing latched.
    Idle,
    /// Link-error storm; the error interrupt was turned off.
    RateLimited,
    /// Only link errors latched; counted and cleared.
    LinkCleared,
    /// The owner's handler recovered.
    Recovered { slot: SlotId },
    /// The owner declined; the slot is fenced off.
    SlotDisabled { slot: SlotId },
    /// No owner claimed a garden-variety fault; logged and cleared.
    ClearedNoOwner,
    /// Unclaimed and unconditionally fatal; the caller escalates.
    Escalated(ErrorStatus),
}

/// Sliding-window counter for link-level error storms.
pub(crate) struct LlpRateTracker {
    threshold: u32,
    window: Duration,
    events: VecDeque<Instant>,
}

impl LlpRateTracker {
    pub(crate) fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            events: VecDeque::new(),
        }
    }

    /// Records one event; true once the rate exceeds the threshold.
    pub(crate) fn record(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.push_back(now);
        self.events.len() as u32 > self.threshold
    }
}

const LLP_CLASSES: ErrorStatus = ErrorStatus::LLP_RETRY.union(ErrorStatus::LLP_PROTOCOL);

impl Bridge {
    /// Services the bridge error latch once. Drive this from the error
    /// interrupt (or a poll loop in bring-up environments).
    pub fn service_error(&self) -> FaultOutcome {
        let (classes, address) = {
            let st = self.lock();
            (st.hw.error_status(), st.hw.error_address())
        };
        if classes.is_empty() {
            return FaultOutcome::Idle;
        }

        if classes.intersects(LLP_CLASSES) {
            let mut st = self.lock();
            let over = st.llp.record(Instant::now());
            st.hw.clear_error(classes & LLP_CLASSES);
            if over {
                // A storm of link errors can starve the CPU; stop taking the
                // interrupt and leave recovery to the health poller.
                let mut enable = st.hw.int_enable();
                enable.set_error(false);
                st.hw.set_int_enable(enable);
                tracing::warn!("link error storm, error interrupt disabled");
                return FaultOutcome::RateLimited;
            }
            if (classes - LLP_CLASSES).is_empty() {
                return FaultOutcome::LinkCleared;
            }
        }

        let classes = classes - LLP_CLASSES;
        let attribution = self.attribute_address(address, classes);

        match attribution.owner() {
            Some(slot) => {
                let handler = self.lock().slots[slot.index()].fault_handler.clone();
                let context = FaultContext {
                    classes,
                    address,
                    attribution,
                };
                let disposition = match handler {
                    Some(handler) => handler(&context),
                    None => FaultDisposition::Unhandled,
                };

                let mut st = self.lock();
                st.hw.clear_error(classes);
                match disposition {
                    FaultDisposition::Handled => FaultOutcome::Recovered { slot },
                    FaultDisposition::Unhandled | FaultDisposition::Escalate => {
                        st.slots[slot.index()].disabled = true;
                        tracing::warn!(
                            slot = slot.index(),
                            ?classes,
                            "device declined fault recovery, slot disabled"
                        );
                        FaultOutcome::SlotDisabled { slot }
                    }
                }
            }
            None => {
                if classes.is_fatal() {
                    // Left latched: the escalation path owns it now.
                    return FaultOutcome::Escalated(classes);
                }
                let mut st = self.lock();
                st.no_owner_faults += 1;
                st.hw.clear_error(classes);
                tracing::warn!(?classes, address, "unclaimed bridge fault cleared");
                FaultOutcome::ClearedNoOwner
            }
        }
    }

    /// Attributes a captured PCI address: config aperture, then device
    /// windows, then live PIO maps, then the address-range guess. PIO-class
    /// faults also bump the counter of every map containing the address,
    /// atomically and without the bridge lock, since the counters are
    /// diagnostics that tolerate eventual consistency.
    fn attribute_address(&self, address: u64, classes: ErrorStatus) -> Attribution {
        let (window_hit, maps) = {
            let st = self.lock();

            if (CFG_PCI_BASE..CFG_PCI_BASE + SLOT_COUNT as u64 * CFG_SLOT_STRIDE).contains(&address)
            {
                let rel = address - CFG_PCI_BASE;
                let slot = SlotId::new((rel / CFG_SLOT_STRIDE) as u8).expect("bounded by range");
                return Attribution::Config {
                    slot,
                    offset: rel % CFG_SLOT_STRIDE,
                };
            }

            let mut window_hit = None;
            'outer: for slot in SlotId::all() {
                if !st.slots[slot.index()].populated {
                    continue;
                }
                for w in 0..WINDOWS_PER_SLOT {
                    if let Some(win) = &st.slots[slot.index()].windows[w] {
                        if win.contains(address, 1) {
                            window_hit = Some(Attribution::Window {
                                slot,
                                window: WindowId::new(w as u8).expect("bounded by range"),
                            });
                            break 'outer;
                        }
                    }
                }
            }

            (window_hit, st.pio_maps.clone())
        };

        let mut map_slot = None;
        if classes.intersects(ErrorStatus::PIO_TIMEOUT | ErrorStatus::PIO_PARITY) {
            for map in &maps {
                if map.contains(address) {
                    map.fault_timeouts.fetch_add(1, Ordering::Relaxed);
                    map_slot.get_or_insert(map.slot);
                }
            }
        }

        if let Some(hit) = window_hit {
            return hit;
        }
        if let Some(slot) = map_slot {
            return Attribution::PioMap { slot };
        }

        let space = if address < 1 << 30 {
            PciSpace::Mem32
        } else if address < 1 << 32 {
            PciSpace::Io
        } else {
            PciSpace::Mem64
        };
        tracing::debug!(address, ?space, "fault address unowned, low-confidence space guess");
        Attribution::Guessed { space }
    }

    /// Unclaimed faults seen so far (diagnostic).
    pub fn no_owner_faults(&self) -> u64 {
        self.lock().no_owner_faults
    }
}
