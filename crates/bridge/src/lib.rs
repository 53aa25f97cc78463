#![forbid(unsafe_code)]

//! Resource-management core for a fabric-to-PCI host bridge: response-buffer
//! pooling, three-strategy DMA translation, PIO window routing, interrupt
//! fan-out and fault recovery.

pub mod bridge;

pub use bridge::{
    Bridge, BridgeConfig, BridgeError, DevConn, DeviceInfo, DmaFlags, DmaMap, DmaMode, IntrBit,
    PciPin, PciSpace, PioFlags, PioMapHandle, Result, RrbCounts, RrbParity, SlotId, Vchan,
    WindowId,
};
