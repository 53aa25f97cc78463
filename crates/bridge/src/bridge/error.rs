use thiserror::Error;

use super::regs::{DeviceWord, ErrorStatus};
use super::SlotId;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The RRB or ATE pool cannot cover the request. Partial grants are
    /// reported through return values, not through this variant.
    #[error("{resource} exhausted: wanted {wanted}, {free} free")]
    ResourceExhausted {
        resource: &'static str,
        wanted: usize,
        free: usize,
    },

    /// The request collides with another live user of the slot's shared
    /// attribute word and forcing could not reconcile them.
    #[error("attribute conflict on slot {slot:?}: requested {requested:?}, held {held:?}")]
    AttributeConflict {
        slot: SlotId,
        requested: DeviceWord,
        held: DeviceWord,
    },

    #[error("address {addr:#x} (+{size:#x} bytes) outside the aperture")]
    AddressOutOfRange { addr: u64, size: u64 },

    /// Asynchronous bridge-reported fault, surfaced through the registered
    /// error handler rather than a return value in the common case.
    #[error("hardware fault: {0:?}")]
    HardwareFault(ErrorStatus),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Fabric(#[from] xfab_fabric::FabricError),
}
