//! Interrupt line multiplexing: eight fabric interrupt bits fan out to any
//! number of per-device handlers.
//!
//! A bit starts unallocated; the first attach allocates the fabric line and
//! routes it straight at that handler. The second attach promotes the bit to
//! shared dispatch, created exactly once no matter how many attachers race,
//! with losers dropping their redundant fabric allocation and adopting the
//! winner's. Once shared, a bit stays shared; an inert wrapper costs one
//! indirection and nothing else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use xfab_fabric::FabricLine;

use super::error::Result;
use super::{Bridge, DevConn, IntrBit, SlotId};

/// PCI interrupt pin.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PciPin {
    A,
    B,
    C,
    D,
}

impl PciPin {
    pub const fn index(self) -> usize {
        match self {
            PciPin::A => 0,
            PciPin::B => 1,
            PciPin::C => 2,
            PciPin::D => 3,
        }
    }
}

pub(crate) struct HandlerRecord {
    pub(crate) slot: SlotId,
    pub(crate) connected: AtomicBool,
    pub(crate) thread_preferred: bool,
    pub(crate) handler: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

/// Per-bit state, deliberately outside the bridge lock: wrapper creation
/// must not hold it across the fabric allocation call.
pub(crate) struct IntrBitState {
    pub(crate) line: OnceLock<Arc<dyn FabricLine>>,
    /// Set exactly once when the bit goes shared.
    pub(crate) wrapper: OnceLock<()>,
    pub(crate) handlers: Mutex<Vec<Arc<HandlerRecord>>>,
}

impl IntrBitState {
    pub(crate) fn new() -> Self {
        Self {
            line: OnceLock::new(),
            wrapper: OnceLock::new(),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

/// A handler waiting for its deferred (thread-preferred) invocation.
pub(crate) struct DeferredInvoke {
    pub(crate) handler: Arc<dyn Fn() + Send + Sync>,
}

/// Driver-held handle over one device's attached interrupt records.
pub struct IntrHandle {
    records: Vec<(IntrBit, Arc<HandlerRecord>)>,
}

impl IntrHandle {
    /// Fabric interrupt bits this handle is attached to.
    pub fn bits(&self) -> Vec<IntrBit> {
        self.records.iter().map(|(bit, _)| *bit).collect()
    }
}

/// Fixed pin-to-bit spread: neighbouring slots land on different bits.
pub fn default_intr_bit(slot: SlotId, pin: PciPin) -> IntrBit {
    IntrBit::new(((slot.index() + 4 * pin.index()) % 8) as u8).expect("mod 8 stays in range")
}

impl Bridge {
    fn intr_bit_for(&self, slot: SlotId, pin: PciPin) -> IntrBit {
        self.config.intr_override[slot.index()][pin.index()]
            .unwrap_or_else(|| default_intr_bit(slot, pin))
    }

    /// Allocates (or adopts) the fabric line behind `bit`.
    ///
    /// The fabric call runs without the bridge lock; the single-winner set
    /// decides which racer's allocation survives.
    fn intr_line(self: &Arc<Self>, bit: IntrBit) -> Result<Arc<dyn FabricLine>> {
        let state = &self.intr[bit.index()];
        if let Some(line) = state.line.get() {
            return Ok(Arc::clone(line));
        }

        let fresh = self.fabric.interrupt_alloc(self.widget)?;
        match state.line.set(Arc::clone(&fresh)) {
            Ok(()) => {
                let mut st = self.lock();
                st.hw.set_int_target(bit, fresh.target());
                Ok(fresh)
            }
            // Lost the race: `fresh` drops here, freeing the redundant
            // allocation; adopt the winner's line.
            Err(_) => Ok(Arc::clone(state.line.get().expect("winner just set the line"))),
        }
    }

    /// Attaches a (not yet connected) handler record for each requested pin.
    pub fn intr_alloc(
        self: &Arc<Self>,
        conn: DevConn,
        pins: &[PciPin],
        thread_preferred: bool,
    ) -> Result<IntrHandle> {
        self.lock().usable_slot(conn.slot)?;

        let mut records = Vec::with_capacity(pins.len());
        for &pin in pins {
            let bit = self.intr_bit_for(conn.slot, pin);
            if records.iter().any(|(b, _)| *b == bit) {
                continue;
            }
            let line = self.intr_line(bit)?;

            let record = Arc::new(HandlerRecord {
                slot: conn.slot,
                connected: AtomicBool::new(false),
                thread_preferred,
                handler: Mutex::new(None),
            });

            let state = &self.intr[bit.index()];
            let attached = {
                let mut handlers = state.handlers.lock().expect("interrupt list lock poisoned");
                handlers.push(Arc::clone(&record));
                handlers.len()
            };

            if attached == 1 && state.wrapper.get().is_none() {
                // Unshared: route the line straight at this handler.
                let direct = Arc::clone(&record);
                line.connect(Box::new(move || {
                    if !direct.connected.load(Ordering::Acquire) {
                        return;
                    }
                    let handler = direct
                        .handler
                        .lock()
                        .expect("handler slot lock poisoned")
                        .clone();
                    if let Some(handler) = handler {
                        handler();
                    }
                }));
            } else if state.wrapper.set(()).is_ok() {
                // First to see sharing: re-route through the dispatch loop.
                let weak: Weak<Bridge> = Arc::downgrade(self);
                line.connect(Box::new(move || {
                    if let Some(bridge) = weak.upgrade() {
                        bridge.dispatch_intr(bit);
                    }
                }));
            }

            records.push((bit, record));
        }

        Ok(IntrHandle { records })
    }

    /// Connects `handler` to every bit of the handle and enables them.
    pub fn intr_connect(
        &self,
        handle: &IntrHandle,
        handler: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<()> {
        for (bit, record) in &handle.records {
            *record.handler.lock().expect("handler slot lock poisoned") = Some(Arc::clone(&handler));
            record.connected.store(true, Ordering::Release);

            let mut st = self.lock();
            let mut enable = st.hw.int_enable();
            enable.set_device(*bit, true);
            st.hw.set_int_enable(enable);
        }
        Ok(())
    }

    /// Disconnects the handle's records. The hardware enable stays on until
    /// the dispatch loop next finds nobody to call.
    pub fn intr_disconnect(&self, handle: &IntrHandle) {
        for (_, record) in &handle.records {
            record.connected.store(false, Ordering::Release);
            *record.handler.lock().expect("handler slot lock poisoned") = None;
        }
    }

    /// Detaches the handle's records entirely. The wrapper, if one was ever
    /// created, stays in place inert.
    pub fn intr_free(&self, handle: IntrHandle) {
        for (bit, record) in &handle.records {
            let mut handlers = self.intr[bit.index()]
                .handlers
                .lock()
                .expect("interrupt list lock poisoned");
            handlers.retain(|r| !Arc::ptr_eq(r, record));
        }
    }

    /// Shared dispatch: runs while the hardware still shows the bit pending.
    /// Each connected handler gets its device's posted writes flushed before
    /// the call, in attach order. An iteration with nobody connected turns
    /// the enable bit off so an unserviceable interrupt cannot spin.
    pub fn dispatch_intr(&self, bit: IntrBit) {
        loop {
            let pending = self.lock().hw.int_status().device(bit);
            if !pending {
                break;
            }

            let connected: Vec<Arc<HandlerRecord>> = self.intr[bit.index()]
                .handlers
                .lock()
                .expect("interrupt list lock poisoned")
                .iter()
                .filter(|r| r.connected.load(Ordering::Acquire))
                .cloned()
                .collect();

            if connected.is_empty() {
                let mut st = self.lock();
                let mut enable = st.hw.int_enable();
                enable.set_device(bit, false);
                st.hw.set_int_enable(enable);
                break;
            }

            for record in connected {
                // Transmit visibility: the device's posted writes must have
                // landed before its handler looks at memory.
                self.lock().hw.flush_write_buffer(record.slot);

                let handler = record
                    .handler
                    .lock()
                    .expect("handler slot lock poisoned")
                    .clone();
                let Some(handler) = handler else { continue };
                if record.thread_preferred {
                    self.deferred
                        .lock()
                        .expect("deferred queue lock poisoned")
                        .push(DeferredInvoke { handler });
                } else {
                    handler();
                }
            }
        }
    }

    /// Runs handlers parked for deferred execution. The embedding
    /// environment decides when this runs (a kernel would use a thread).
    pub fn run_deferred(&self) {
        let queued: Vec<DeferredInvoke> = {
            let mut queue = self.deferred.lock().expect("deferred queue lock poisoned");
            std::mem::take(&mut *queue)
        };
        for invoke in queued {
            (invoke.handler)();
        }
    }
}
