//! Software transport: identity translation plus in-process interrupt lines.

use std::sync::{Arc, Mutex};

use crate::{
    DmaPath, FabricAddr, FabricError, FabricLine, FabricTransport, PioPath, Result,
    TransportFlags, WidgetId,
};

/// Identity-mapping transport with a bounded supply of interrupt lines.
///
/// PIO and DMA translations succeed as long as they fit below `addr_limit`;
/// interrupt lines deliver by invoking the connected handler inline. The
/// fabric keeps every allocated line so tests can fetch one by target and
/// simulate a hardware delivery.
pub struct LoopbackFabric {
    addr_limit: u64,
    max_lines: usize,
    lines: Mutex<Vec<Arc<LoopbackLine>>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            addr_limit: 1 << 48,
            max_lines: 64,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn with_line_limit(max_lines: usize) -> Self {
        Self {
            max_lines,
            ..Self::new()
        }
    }

    pub fn lines_allocated(&self) -> usize {
        self.lines.lock().expect("loopback fabric lock poisoned").len()
    }

    /// Fetches a previously allocated line by its target cookie.
    pub fn line(&self, target: u64) -> Option<Arc<LoopbackLine>> {
        self.lines
            .lock()
            .expect("loopback fabric lock poisoned")
            .iter()
            .find(|line| line.target == target)
            .cloned()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricTransport for LoopbackFabric {
    fn pio_translate(
        &self,
        _widget: WidgetId,
        addr: FabricAddr,
        size: u64,
        _flags: TransportFlags,
    ) -> Result<PioPath> {
        if size == 0 || addr.0.saturating_add(size) > self.addr_limit {
            return Err(FabricError::BadWindow { addr, size });
        }
        Ok(PioPath { base: addr, size })
    }

    fn dma_translate(
        &self,
        _widget: WidgetId,
        addr: FabricAddr,
        size: u64,
        _flags: TransportFlags,
    ) -> Result<DmaPath> {
        if size == 0 || addr.0.saturating_add(size) > self.addr_limit {
            return Err(FabricError::BadWindow { addr, size });
        }
        Ok(DmaPath { base: addr, size })
    }

    fn interrupt_alloc(&self, _widget: WidgetId) -> Result<Arc<dyn FabricLine>> {
        let mut lines = self.lines.lock().expect("loopback fabric lock poisoned");
        if lines.len() >= self.max_lines {
            return Err(FabricError::InterruptExhausted);
        }
        let line = Arc::new(LoopbackLine {
            target: lines.len() as u64,
            handler: Mutex::new(None),
        });
        lines.push(Arc::clone(&line));
        Ok(line)
    }
}

/// In-process interrupt line; `deliver()` invokes the connected handler.
pub struct LoopbackLine {
    target: u64,
    handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl LoopbackLine {
    /// Simulates a hardware delivery on this line.
    pub fn deliver(&self) {
        // Move the handler out of the lock for the call so a handler that
        // re-routes the line does not deadlock against us.
        let handler = self
            .handler
            .lock()
            .expect("loopback line lock poisoned")
            .take();
        if let Some(handler) = handler {
            handler();
            let mut guard = self.handler.lock().expect("loopback line lock poisoned");
            // A handler may have connected a replacement; keep the newer one.
            if guard.is_none() {
                *guard = Some(handler);
            }
        }
    }
}

impl FabricLine for LoopbackLine {
    fn target(&self) -> u64 {
        self.target
    }

    fn connect(&self, handler: Box<dyn Fn() + Send + Sync>) {
        *self.handler.lock().expect("loopback line lock poisoned") = Some(handler);
    }

    fn disconnect(&self) {
        *self.handler.lock().expect("loopback line lock poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn pio_translation_is_identity_within_the_window() {
        let fabric = LoopbackFabric::new();
        let path = fabric
            .pio_translate(WidgetId(3), FabricAddr(0x4000), 0x1000, TransportFlags::default())
            .unwrap();
        assert_eq!(path.base, FabricAddr(0x4000));
        assert_eq!(path.size, 0x1000);
    }

    #[test]
    fn zero_size_translation_is_rejected() {
        let fabric = LoopbackFabric::new();
        let err = fabric
            .dma_translate(WidgetId(0), FabricAddr(0), 0, TransportFlags::default())
            .unwrap_err();
        assert!(matches!(err, FabricError::BadWindow { .. }));
    }

    #[test]
    fn delivery_reaches_the_connected_handler_until_disconnect() {
        let fabric = LoopbackFabric::new();
        let line = fabric.interrupt_alloc(WidgetId(0)).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = Arc::clone(&hits);
        line.connect(Box::new(move || {
            hits_in_handler.fetch_add(1, Ordering::SeqCst);
        }));

        let raw = fabric.line(line.target()).unwrap();
        raw.deliver();
        raw.deliver();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        line.disconnect();
        raw.deliver();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn line_supply_is_bounded() {
        let fabric = LoopbackFabric::with_line_limit(1);
        assert!(fabric.interrupt_alloc(WidgetId(0)).is_ok());
        assert!(matches!(
            fabric.interrupt_alloc(WidgetId(0)),
            Err(FabricError::InterruptExhausted)
        ));
    }
}
