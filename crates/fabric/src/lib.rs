#![forbid(unsafe_code)]

//! Transport seam between a host-bridge driver and the system interconnect.
//!
//! The bridge core only sees the [`FabricTransport`] trait; [`loopback`]
//! provides a software implementation for tests and bring-up.

pub mod loopback;

use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FabricError>;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("no route to widget {0:?}")]
    NoRoute(WidgetId),

    #[error("fabric translation space exhausted")]
    TranslationExhausted,

    #[error("no free fabric interrupt targets")]
    InterruptExhausted,

    #[error("translation request of {size} bytes at {addr:?} exceeds the transport window")]
    BadWindow { addr: FabricAddr, size: u64 },
}

/// Identifies an endpoint port on the interconnect.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct WidgetId(pub u8);

/// An address in the interconnect's global address space.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FabricAddr(pub u64);

impl FabricAddr {
    pub const fn offset(self, delta: u64) -> FabricAddr {
        FabricAddr(self.0 + delta)
    }

    /// Byte distance from `base`, if this address lies at or above it.
    pub fn checked_sub(self, base: FabricAddr) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}

/// Attributes a bridge can request from the transport for a translation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransportFlags {
    /// Transport may issue speculative read-ahead.
    pub prefetch: bool,
    /// Responses must not pass earlier requests.
    pub barrier: bool,
}

/// An established programmed-I/O path handed out by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PioPath {
    pub base: FabricAddr,
    pub size: u64,
}

/// An established DMA path handed out by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DmaPath {
    pub base: FabricAddr,
    pub size: u64,
}

/// One interrupt line allocated from the fabric for a widget.
///
/// The bridge programs `target()` into its interrupt routing registers and
/// re-points the line (via [`FabricLine::connect`]) as handlers come and go.
pub trait FabricLine: Send + Sync {
    /// Cookie the bridge writes into its interrupt-target register.
    fn target(&self) -> u64;

    /// Routes deliveries on this line to `handler`, replacing any previous
    /// routing.
    fn connect(&self, handler: Box<dyn Fn() + Send + Sync>);

    /// Drops the current routing; subsequent deliveries are discarded.
    fn disconnect(&self);
}

/// The interconnect services a host bridge consumes.
pub trait FabricTransport: Send + Sync {
    /// Establishes a programmed-I/O path from the CPU side to `size` bytes of
    /// widget address space at `addr`.
    fn pio_translate(
        &self,
        widget: WidgetId,
        addr: FabricAddr,
        size: u64,
        flags: TransportFlags,
    ) -> Result<PioPath>;

    /// Establishes a DMA path from the widget into system memory at `addr`.
    fn dma_translate(
        &self,
        widget: WidgetId,
        addr: FabricAddr,
        size: u64,
        flags: TransportFlags,
    ) -> Result<DmaPath>;

    /// Allocates an interrupt line targeting this widget's host.
    fn interrupt_alloc(&self, widget: WidgetId) -> Result<Arc<dyn FabricLine>>;
}
