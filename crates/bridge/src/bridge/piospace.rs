//! Software-tracked PCI address ranges for PIO use, distinct from the
//! per-device BAR windows.

use std::ops::Range;

use super::error::{BridgeError, Result};
use super::PciSpace;

/// The three bus sub-ranges the bridge hands PIO space out of.
#[derive(Clone, Debug)]
pub struct PioSpaceConfig {
    /// I/O space, inclusive bounds.
    pub io: (u64, u64),
    /// Low memory, reachable by every decoder.
    pub mem_lo: (u64, u64),
    /// High memory.
    pub mem_hi: (u64, u64),
}

impl Default for PioSpaceConfig {
    fn default() -> Self {
        // The low few bytes of each space stay reserved: address 0 reads as
        // a config cycle on some cards, and legacy VGA/IDE claims the very
        // bottom of memory space.
        Self {
            io: (0x4, 0xFFFF_FFFF),
            mem_lo: (0x10, 0x1F_FFFF),
            mem_hi: (0x20_0000, 0x3FFF_FFFF),
        }
    }
}

#[derive(Debug)]
struct RangeTracker {
    start: u64,
    /// Inclusive upper bound.
    end: u64,
    /// Live allocations, sorted by base.
    live: Vec<Range<u64>>,
}

impl RangeTracker {
    fn new(bounds: (u64, u64)) -> Self {
        Self {
            start: bounds.0,
            end: bounds.1,
            live: Vec::new(),
        }
    }

    fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let mut candidate = align_up(self.start, align);
        for taken in &self.live {
            let end = candidate.checked_add(size)?;
            if end <= taken.start {
                break;
            }
            if candidate < taken.end {
                candidate = align_up(taken.end, align);
            }
        }
        let end = candidate.checked_add(size)?;
        if end - 1 > self.end {
            return None;
        }
        let insert_at = self
            .live
            .iter()
            .position(|r| r.start > candidate)
            .unwrap_or(self.live.len());
        self.live.insert(insert_at, candidate..end);
        Some(candidate)
    }

    /// Frees exactly one prior allocation; sub-ranges are rejected.
    fn free(&mut self, addr: u64, size: u64) -> bool {
        let end = addr.saturating_add(size);
        match self.live.iter().position(|r| *r == (addr..end)) {
            Some(i) => {
                self.live.remove(i);
                true
            }
            None => false,
        }
    }
}

/// First-fit allocator over the I/O, low-memory and high-memory ranges.
#[derive(Debug)]
pub struct PioSpacePool {
    io: RangeTracker,
    mem_lo: RangeTracker,
    mem_hi: RangeTracker,
}

impl PioSpacePool {
    pub fn new(config: &PioSpaceConfig) -> Self {
        Self {
            io: RangeTracker::new(config.io),
            mem_lo: RangeTracker::new(config.mem_lo),
            mem_hi: RangeTracker::new(config.mem_hi),
        }
    }

    pub fn alloc(&mut self, space: PciSpace, size: u64, align: u64) -> Result<u64> {
        if size == 0 {
            return Err(BridgeError::InvalidArgument("zero-size piospace request"));
        }
        let align = if align == 0 { 1 } else { align };
        if !align.is_power_of_two() {
            return Err(BridgeError::InvalidArgument("piospace alignment not a power of two"));
        }

        let base = match space {
            PciSpace::Io => self.io.alloc(size, align),
            // 32-bit requests prefer the low range so short-decode cards can
            // still reach them, spilling into high memory when it fills.
            PciSpace::Mem32 => self
                .mem_lo
                .alloc(size, align)
                .or_else(|| self.mem_hi.alloc(size, align)),
            PciSpace::Mem64 => self.mem_hi.alloc(size, align),
            _ => return Err(BridgeError::InvalidArgument("piospace wants IO or MEM space")),
        };

        base.ok_or(BridgeError::ResourceExhausted {
            resource: "pio space",
            wanted: size as usize,
            free: 0,
        })
    }

    /// Releases a `(space, addr, size)` triple returned by [`Self::alloc`].
    ///
    /// Freeing anything but an exact prior allocation is rejected rather than
    /// silently truncated.
    pub fn free(&mut self, space: PciSpace, addr: u64, size: u64) -> Result<()> {
        let matched = match space {
            PciSpace::Io => self.io.free(addr, size),
            PciSpace::Mem32 => self.mem_lo.free(addr, size) || self.mem_hi.free(addr, size),
            PciSpace::Mem64 => self.mem_hi.free(addr, size),
            _ => false,
        };
        if matched {
            Ok(())
        } else {
            tracing::warn!(?space, addr, size, "piospace free does not match any allocation");
            Err(BridgeError::InvalidArgument(
                "piospace free does not match a prior allocation",
            ))
        }
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PioSpacePool {
        PioSpacePool::new(&PioSpaceConfig::default())
    }

    #[test]
    fn io_allocations_walk_alignment_boundaries() {
        let mut pool = pool();
        assert_eq!(pool.alloc(PciSpace::Io, 0x1000, 0x1000).unwrap(), 0x1000);
        assert_eq!(pool.alloc(PciSpace::Io, 0x1000, 0x1000).unwrap(), 0x2000);
    }

    #[test]
    fn freed_range_is_reused() {
        let mut pool = pool();
        let a = pool.alloc(PciSpace::Io, 0x800, 0x800).unwrap();
        let b = pool.alloc(PciSpace::Io, 0x800, 0x800).unwrap();
        assert_ne!(a, b);
        pool.free(PciSpace::Io, a, 0x800).unwrap();
        assert_eq!(pool.alloc(PciSpace::Io, 0x800, 0x800).unwrap(), a);
    }

    #[test]
    fn mem32_spills_from_low_to_high_range() {
        let mut pool = PioSpacePool::new(&PioSpaceConfig {
            mem_lo: (0x10, 0xFFF),
            ..PioSpaceConfig::default()
        });
        let a = pool.alloc(PciSpace::Mem32, 0x800, 0x800).unwrap();
        assert!(a < 0x1000);
        // Low range is now too full for another aligned 0x800.
        let b = pool.alloc(PciSpace::Mem32, 0x800, 0x800).unwrap();
        assert!(b >= 0x20_0000);
    }

    #[test]
    fn partial_free_is_rejected() {
        let mut pool = pool();
        let a = pool.alloc(PciSpace::Io, 0x2000, 0x1000).unwrap();
        assert!(pool.free(PciSpace::Io, a, 0x1000).is_err());
        // The full range is still live and freeable.
        pool.free(PciSpace::Io, a, 0x2000).unwrap();
    }

    #[test]
    fn zero_size_and_bad_alignment_are_invalid() {
        let mut pool = pool();
        assert!(matches!(
            pool.alloc(PciSpace::Io, 0, 0x1000),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            pool.alloc(PciSpace::Io, 0x100, 0x300),
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
