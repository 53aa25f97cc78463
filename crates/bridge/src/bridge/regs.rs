//! Typed accessors over the bridge's control/status registers.
//!
//! Encode/decode only, no policy. The numeric layout is the analogous
//! register set the rest of the crate is written against; the allocation and
//! translation algorithms never depend on the specific bit positions chosen
//! here, only on the accessors.

use xfab_fabric::FabricAddr;

use super::{IntrBit, Vchan};

/// PCI slots behind one bridge.
pub const SLOT_COUNT: usize = 8;

/// Response buffers per parity class, one 4-bit map field each.
pub const RRB_PER_PARITY: usize = 8;

/// DevIO windows shared by all slots.
pub const DEVIO_COUNT: usize = 8;

/// Mapping granularity of the ATE table.
pub const ATE_PAGE_SHIFT: u32 = 12;
pub const ATE_PAGE_SIZE: u64 = 1 << ATE_PAGE_SHIFT;

/// Span of the bridge-wide direct-32 DMA window.
pub const DIRECT32_SIZE: u64 = 0x8000_0000;

/// PCI-side base of the direct-32 aperture: the upper half of 32-bit space.
pub const D32_PCI_BASE: u64 = 0x8000_0000;

/// PCI-side base of the ATE-windowed DMA aperture.
pub const DMA_MAPPED_PCI_BASE: u64 = 0x2000_0000;

/// Direct-64 PCI address layout: marker bit, in-band attributes, then the
/// fabric address in the low bits.
pub const D64_MARKER: u64 = 1 << 63;
pub const D64_ATTR_SHIFT: u32 = 48;
pub const D64_ADDR_MASK: u64 = (1 << 48) - 1;

/// Fabric-side layout of the bridge's PIO windows, as offsets within the
/// widget's address space.
pub const CFG_FABRIC_BASE: u64 = 0x0010_0000;
pub const CFG_SLOT_STRIDE: u64 = 0x1000;
pub const DEVIO_FABRIC_BASE: u64 = 0x0080_0000;
pub const DEVIO_FABRIC_STRIDE: u64 = 0x20_0000;
pub const PIO_DIRECT_IO_FABRIC_BASE: u64 = 0x10_0000_0000;
pub const PIO_DIRECT_MEM_FABRIC_BASE: u64 = 0x20_0000_0000;

/// PCI-side address the hardware reports for a faulting config cycle:
/// `CFG_PCI_BASE + slot * CFG_SLOT_STRIDE + offset`.
pub const CFG_PCI_BASE: u64 = 0xFF00_0000;

const RRB_FIELD_BITS: u32 = 4;
const RRB_FIELD_MASK: u32 = 0xF;
const RRB_ENABLE: u32 = 0b1000;
const RRB_VCHAN: u32 = 0b0100;
const RRB_DEVICE_MASK: u32 = 0b0011;

/// One RRB map register: eight 4-bit fields, `0b1VDD` when owned
/// (enable, virtual channel, owning device pair).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RrbMapWord(pub u32);

/// Decoded owner of one RRB map field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RrbOwner {
    /// Device-pair code: slot number >> 1 within the parity class.
    pub device_code: u8,
    pub vchan: Vchan,
}

impl RrbMapWord {
    fn raw_field(self, field: usize) -> u32 {
        debug_assert!(field < RRB_PER_PARITY);
        (self.0 >> (field as u32 * RRB_FIELD_BITS)) & RRB_FIELD_MASK
    }

    fn set_raw_field(&mut self, field: usize, value: u32) {
        debug_assert!(field < RRB_PER_PARITY);
        debug_assert!(value <= RRB_FIELD_MASK);
        let shift = field as u32 * RRB_FIELD_BITS;
        self.0 = (self.0 & !(RRB_FIELD_MASK << shift)) | (value << shift);
    }

    /// Owner of `field`, or `None` when the field is free (enable clear).
    pub fn owner(self, field: usize) -> Option<RrbOwner> {
        let raw = self.raw_field(field);
        if raw & RRB_ENABLE == 0 {
            return None;
        }
        Some(RrbOwner {
            device_code: (raw & RRB_DEVICE_MASK) as u8,
            vchan: if raw & RRB_VCHAN != 0 {
                Vchan::Secondary
            } else {
                Vchan::Primary
            },
        })
    }

    pub fn claim(&mut self, field: usize, device_code: u8, vchan: Vchan) {
        debug_assert!(u32::from(device_code) <= RRB_DEVICE_MASK);
        let vbit = match vchan {
            Vchan::Primary => 0,
            Vchan::Secondary => RRB_VCHAN,
        };
        self.set_raw_field(field, RRB_ENABLE | vbit | u32::from(device_code));
    }

    /// Clears the enable bit, leaving the rest of the field intact so the
    /// hardware can finish draining the buffer it still names.
    pub fn disable(&mut self, field: usize) {
        let raw = self.raw_field(field);
        self.set_raw_field(field, raw & !RRB_ENABLE);
    }

    pub fn release(&mut self, field: usize) {
        self.set_raw_field(field, 0);
    }

    /// Fields currently owned by `(device_code, vchan)`.
    ///
    /// The original hardware manual suggests an XOR-fold/popcount trick for
    /// this count; a field loop is observably identical.
    pub fn count_owned(self, device_code: u8, vchan: Vchan) -> usize {
        (0..RRB_PER_PARITY)
            .filter(|&f| {
                self.owner(f)
                    == Some(RrbOwner {
                        device_code,
                        vchan,
                    })
            })
            .count()
    }

    pub fn count_free(self) -> usize {
        (0..RRB_PER_PARITY).filter(|&f| self.owner(f).is_none()).count()
    }
}

bitflags::bitflags! {
    /// Per-slot device control word.
    ///
    /// The soft copy held in `SlotState` must always equal the last value
    /// written to the hardware register; both are updated together under the
    /// bridge lock.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct DeviceWord: u32 {
        /// Responses may not pass earlier requests from this slot.
        const BARRIER = 1 << 0;
        /// Speculative read-ahead into response buffers.
        const PREFETCH = 1 << 1;
        /// Precise (non-posted) completion reporting.
        const PRECISE = 1 << 2;
        /// Direct-mapped DMA rides virtual channel 1.
        const VCHAN1 = 1 << 3;
        /// Adjacent PIO writes may be combined.
        const WRITE_GATHER = 1 << 4;
        /// Fabric requests are cache-coherent.
        const COHERENT = 1 << 5;
        /// Byte-swap data on the windowed (ATE) DMA path.
        const SWAP_ATE = 1 << 6;
        /// Byte-swap data on the direct-mapped DMA path.
        const SWAP_DIRECT = 1 << 7;
        /// Slot may master the bus. Cleared while external ATEs are rewritten.
        const BUS_MASTER = 1 << 8;
        /// Real-time response priority.
        const PRIORITY = 1 << 9;
    }
}

impl DeviceWord {
    /// Attribute bits carried in-band by direct-64 PCI addresses; all users
    /// of a slot's direct-64 path share one setting.
    pub const D64_ATTRS: DeviceWord = Self::BARRIER
        .union(Self::PREFETCH)
        .union(Self::PRECISE)
        .union(Self::VCHAN1)
        .union(Self::WRITE_GATHER)
        .union(Self::SWAP_DIRECT);

    /// Attribute bits shared by all direct-32 users of a slot.
    pub const D32_ATTRS: DeviceWord = Self::BARRIER
        .union(Self::PREFETCH)
        .union(Self::PRECISE)
        .union(Self::COHERENT)
        .union(Self::WRITE_GATHER)
        .union(Self::SWAP_DIRECT);

    /// Bits that may be forced on to reconcile two users: degrades
    /// performance, never correctness.
    pub const FORCE_ON: DeviceWord = Self::PRECISE.union(Self::BARRIER);

    /// Bits that may be forced off to reconcile two users.
    pub const FORCE_OFF: DeviceWord = Self::WRITE_GATHER.union(Self::PREFETCH);

    /// Encodes the in-band attribute bits of a direct-64 PCI address.
    pub fn to_d64_bits(self) -> u64 {
        u64::from((self & Self::D64_ATTRS).bits()) << D64_ATTR_SHIFT
    }
}

/// One ATE: fabric page base plus the transfer attributes of the window.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AteEntry(pub u64);

impl AteEntry {
    const VALID: u64 = 1 << 0;
    const COHERENT: u64 = 1 << 1;
    const BARRIER: u64 = 1 << 2;
    const PREFETCH: u64 = 1 << 3;
    const PRECISE: u64 = 1 << 4;
    const SWAP: u64 = 1 << 5;

    pub fn invalid() -> AteEntry {
        AteEntry(0)
    }

    pub fn new(page: FabricAddr, word: DeviceWord) -> AteEntry {
        debug_assert_eq!(page.0 & (ATE_PAGE_SIZE - 1), 0, "ATE page base unaligned");
        let mut bits = page.0 | Self::VALID;
        if word.contains(DeviceWord::COHERENT) {
            bits |= Self::COHERENT;
        }
        if word.contains(DeviceWord::BARRIER) {
            bits |= Self::BARRIER;
        }
        if word.contains(DeviceWord::PREFETCH) {
            bits |= Self::PREFETCH;
        }
        if word.contains(DeviceWord::PRECISE) {
            bits |= Self::PRECISE;
        }
        if word.contains(DeviceWord::SWAP_ATE) {
            bits |= Self::SWAP;
        }
        AteEntry(bits)
    }

    pub fn is_valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    pub fn page(self) -> FabricAddr {
        FabricAddr(self.0 & !(ATE_PAGE_SIZE - 1))
    }
}

/// Space decoded by a DevIO window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpaceClass {
    Io,
    Mem,
}

/// One DevIO window register: PCI base (1 MiB granular), decoded space,
/// byte-swap mode, enable.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DevioWord(pub u32);

impl DevioWord {
    const BASE_MASK: u32 = 0x0FFF;
    const BASE_SHIFT: u32 = 20;
    const SPACE_MEM: u32 = 1 << 12;
    const SWAP: u32 = 1 << 13;
    const ENABLE: u32 = 1 << 14;

    pub fn disabled() -> DevioWord {
        DevioWord(0)
    }

    pub fn new(base: u64, space: SpaceClass, swap: bool) -> DevioWord {
        debug_assert_eq!(base & ((1 << Self::BASE_SHIFT) - 1), 0, "DevIO base unaligned");
        let mut bits = ((base >> Self::BASE_SHIFT) as u32 & Self::BASE_MASK) | Self::ENABLE;
        if matches!(space, SpaceClass::Mem) {
            bits |= Self::SPACE_MEM;
        }
        if swap {
            bits |= Self::SWAP;
        }
        DevioWord(bits)
    }

    pub fn enabled(self) -> bool {
        self.0 & Self::ENABLE != 0
    }

    pub fn base(self) -> u64 {
        u64::from(self.0 & Self::BASE_MASK) << Self::BASE_SHIFT
    }

    pub fn space(self) -> SpaceClass {
        if self.0 & Self::SPACE_MEM != 0 {
            SpaceClass::Mem
        } else {
            SpaceClass::Io
        }
    }

    pub fn swap(self) -> bool {
        self.0 & Self::SWAP != 0
    }
}

/// Aperture decoded by a DevIO window. The first two windows are wired twice
/// as wide as the rest.
pub fn devio_aperture(window: usize) -> u64 {
    debug_assert!(window < DEVIO_COUNT);
    if window < 2 {
        2 << 20
    } else {
        1 << 20
    }
}

/// Interrupt enable register: one bit per device interrupt, plus a summary
/// enable for error interrupts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IntEnable(pub u32);

impl IntEnable {
    const ERROR: u32 = 1 << 8;

    pub fn device(self, bit: IntrBit) -> bool {
        self.0 & (1 << bit.index()) != 0
    }

    pub fn set_device(&mut self, bit: IntrBit, enabled: bool) {
        if enabled {
            self.0 |= 1 << bit.index();
        } else {
            self.0 &= !(1 << bit.index());
        }
    }

    pub fn error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub fn set_error(&mut self, enabled: bool) {
        if enabled {
            self.0 |= Self::ERROR;
        } else {
            self.0 &= !Self::ERROR;
        }
    }
}

/// Interrupt status register, same layout as [`IntEnable`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IntStatus(pub u32);

impl IntStatus {
    const ERROR: u32 = 1 << 8;

    pub fn device(self, bit: IntrBit) -> bool {
        self.0 & (1 << bit.index()) != 0
    }

    pub fn error(self) -> bool {
        self.0 & Self::ERROR != 0
    }
}

bitflags::bitflags! {
    /// Latched bridge error classes.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ErrorStatus: u32 {
        /// An outstanding programmed I/O timed out.
        const PIO_TIMEOUT = 1 << 0;
        /// Parity error on a programmed I/O.
        const PIO_PARITY = 1 << 1;
        /// A device read from system memory faulted.
        const DMA_READ = 1 << 2;
        /// A device write to system memory faulted.
        const DMA_WRITE = 1 << 3;
        /// Link-level retry threshold reached.
        const LLP_RETRY = 1 << 4;
        /// Malformed link-level packet.
        const LLP_PROTOCOL = 1 << 5;
        /// Internal hardware inconsistency; unconditionally fatal when
        /// unclaimed.
        const INTERNAL = 1 << 6;
    }
}

impl ErrorStatus {
    pub fn is_fatal(self) -> bool {
        self.contains(ErrorStatus::INTERNAL)
    }
}
