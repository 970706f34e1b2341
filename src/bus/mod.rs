//! Guest physical bus access.
//!
//! Everything the core knows about guest memory goes through
//! [`BusBackend`]: instruction fetch during translation, CRC
//! verification, and the bus cycles synthesized by the page-fault
//! handler. Implementations are the shadow-RAM backend, the peripheral
//! emulation layer, and (externally) the physical bus PHY.

mod amiga;
mod shadow;

pub use amiga::{BusPolicies, SystemBus};
pub use shadow::ShadowRam;

/// Access width of a guest bus cycle, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte = 1,
    Word = 2,
    Long = 4,
    Quad = 8,
    /// Pair transfer, two 64-bit halves.
    Octa = 16,
}

impl Width {
    #[inline]
    pub const fn bytes(self) -> u32 {
        self as u32
    }

    /// Width from a byte count; anything else is a translator bug.
    pub fn from_bytes(n: u32) -> Option<Self> {
        match n {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Long),
            8 => Some(Self::Quad),
            16 => Some(Self::Octa),
            _ => None,
        }
    }
}

/// Abstract guest physical access. Values are big-endian bus values in
/// the low bits; an `Octa` transfer carries the first (lower-addressed)
/// half in bits 64..128.
pub trait BusBackend {
    fn read(&mut self, addr: u32, width: Width) -> u128;
    fn write(&mut self, addr: u32, width: Width, value: u128);

    #[inline]
    fn read_8(&mut self, addr: u32) -> u8 {
        self.read(addr, Width::Byte) as u8
    }

    #[inline]
    fn read_16(&mut self, addr: u32) -> u16 {
        self.read(addr, Width::Word) as u16
    }

    #[inline]
    fn read_32(&mut self, addr: u32) -> u32 {
        self.read(addr, Width::Long) as u32
    }

    #[inline]
    fn write_8(&mut self, addr: u32, value: u8) {
        self.write(addr, Width::Byte, value as u128)
    }

    #[inline]
    fn write_16(&mut self, addr: u32, value: u16) {
        self.write(addr, Width::Word, value as u128)
    }

    #[inline]
    fn write_32(&mut self, addr: u32, value: u32) {
        self.write(addr, Width::Long, value as u128)
    }

    /// Instruction-stream fetch used by the translator and the flag
    /// analyzer. Same as a data read on every current backend.
    #[inline]
    fn fetch_16(&mut self, addr: u32) -> u16 {
        self.read_16(addr)
    }
}

/// CRC32 over an inclusive guest address range, as stored in every
/// translation unit and recomputed on verification.
pub fn crc_range(bus: &mut dyn BusBackend, low: u32, high: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 64];
    let mut addr = low;
    while addr <= high {
        let chunk = (high - addr + 1).min(64) as usize;
        for (i, b) in buf.iter_mut().enumerate().take(chunk) {
            *b = bus.read_8(addr + i as u32);
        }
        hasher.update(&buf[..chunk]);
        match addr.checked_add(chunk as u32) {
            Some(next) => addr = next,
            None => break,
        }
    }
    hasher.finalize()
}
