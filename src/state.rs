//! Guest CPU state mirror.
//!
//! The host-side image of the architectural M68k state. Translated code
//! keeps D0-D7/A0-A7/PC in fixed host registers and the SR in a scratch
//! system register for the duration of a unit; everything else lives in
//! this struct and is reached through the context base pointer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Status register bits, architectural (68k) layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sr: u16 {
        const C   = 0x0001;
        const V   = 0x0002;
        const Z   = 0x0004;
        const N   = 0x0008;
        const X   = 0x0010;
        const IPM = 0x0700;
        const M   = 0x1000;
        const S   = 0x2000;
        const T0  = 0x4000;
        const T1  = 0x8000;
    }
}

/// All five condition-code bits.
pub const CCR_MASK: u8 = 0x1f;

/// Shift of the interrupt priority mask within SR.
pub const SR_IPM_SHIFT: u16 = 8;

/// Swap the C and V bits of a CCR/SR value.
///
/// The host mirror keeps C and V exchanged relative to the 68k layout so
/// that the four host NZCV bits can be inserted with a single bit-field
/// move after an arithmetic instruction. The swap is undone whenever an
/// architectural SR value is materialized (context save, exception
/// frames, MOVE from SR).
#[inline]
pub const fn swap_cv(sr: u16) -> u16 {
    (sr & !0x3) | ((sr & 1) << 1) | ((sr >> 1) & 1)
}

/// Source of a pending interrupt, see the injection path of the
/// dispatcher. `Serror` is normalized to level 7 (NMI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// ARM-originated system error.
    Serror,
    /// ARM-originated IRQ/FIQ signalled through the GPIO status path.
    Gpio(u8),
    /// Interrupt priority level sampled from the guest bus.
    GuestBus(u8),
}

/// Pending-interrupt bytes shared with the other host cores.
///
/// The housekeeper core stores the sampled bus IPL, interrupt handlers
/// store the ARM-originated bits; core 0 only ever reads them at a
/// dispatch boundary and clears what it consumed.
#[derive(Debug, Default)]
pub struct SharedAtomics {
    /// Bus-originated interrupt priority level (0-7).
    ipl: AtomicU8,
    /// ARM-originated pseudo-IPL request.
    arm: AtomicU8,
    /// ARM-originated system error; serviced as level 7.
    err: AtomicU8,
}

impl SharedAtomics {
    pub fn post(&self, src: InterruptSource) {
        match src {
            InterruptSource::Serror => self.err.store(1, Ordering::Release),
            InterruptSource::Gpio(level) => self.arm.store(level & 7, Ordering::Release),
            InterruptSource::GuestBus(level) => self.ipl.store(level & 7, Ordering::Release),
        }
    }

    /// Non-zero when any interrupt is pending. This is the word the
    /// dispatcher (and the inner-loop epilogue of translated code)
    /// polls at the top of every iteration.
    #[inline]
    pub fn summary(&self) -> u32 {
        let ipl = self.ipl.load(Ordering::Acquire) as u32;
        let arm = self.arm.load(Ordering::Acquire) as u32;
        let err = self.err.load(Ordering::Acquire) as u32;
        ipl | (arm << 8) | (err << 16)
    }

    pub fn ipl(&self) -> u8 {
        self.ipl.load(Ordering::Acquire)
    }

    pub fn arm_level(&self) -> u8 {
        self.arm.load(Ordering::Acquire)
    }

    pub fn serror(&self) -> bool {
        self.err.load(Ordering::Acquire) != 0
    }

    pub fn clear_arm(&self) {
        self.arm.store(0, Ordering::Release);
    }

    pub fn clear_serror(&self) {
        self.err.store(0, Ordering::Release);
    }

    pub fn set_ipl(&self, level: u8) {
        self.ipl.store(level & 7, Ordering::Release);
    }
}

/// Field offsets of the context window.
///
/// Translated code addresses the guest state through the context base
/// register using these byte offsets; the fault layer and the reference
/// executor resolve them back to fields. Keep in sync with
/// [`GuestState::ctx_read`] / [`GuestState::ctx_write`].
pub mod ctx {
    pub const D0: u32 = 0x00;
    pub const A0: u32 = 0x20;
    pub const PC: u32 = 0x40;
    pub const SR: u32 = 0x44;
    pub const USP: u32 = 0x48;
    pub const ISP: u32 = 0x4c;
    pub const MSP: u32 = 0x50;
    pub const VBR: u32 = 0x54;
    pub const CACR: u32 = 0x58;
    pub const FPCR: u32 = 0x5c;
    pub const FPSR: u32 = 0x60;
    pub const FPIAR: u32 = 0x64;
    pub const INT: u32 = 0x68;
    pub const STOPPED: u32 = 0x6c;
    pub const INSN_COUNT: u32 = 0x70;
    pub const JIT_UNIT_COUNT: u32 = 0x78;
    pub const JIT_CACHE_TOTAL: u32 = 0x7c;
    pub const JIT_CACHE_FREE: u32 = 0x80;
    pub const JIT_CACHE_MISS: u32 = 0x84;
    pub const JIT_CONTROL: u32 = 0x88;
    pub const JIT_CONTROL2: u32 = 0x8c;
    pub const FP0: u32 = 0x90;
    pub const SIZE: u32 = 0xd0;

    #[inline]
    pub const fn d(n: usize) -> u32 {
        D0 + 4 * n as u32
    }

    #[inline]
    pub const fn a(n: usize) -> u32 {
        A0 + 4 * n as u32
    }

    #[inline]
    pub const fn fp(n: usize) -> u32 {
        FP0 + 8 * n as u32
    }
}

/// Translation statistics, readable by the guest through the bus
/// window that points at the state struct. Shared with the bus backend,
/// hence atomic; core 0 is the only writer.
#[derive(Debug, Default)]
pub struct JitStats {
    pub unit_count: AtomicU32,
    pub cache_total: AtomicU32,
    pub cache_free: AtomicU32,
    pub cache_miss: AtomicU32,
    pub control: AtomicU32,
    pub control2: AtomicU32,
    /// Cumulative executed guest instruction count, maintained by the
    /// epilogue of every translation unit.
    pub insn_count: AtomicU64,
}

impl JitStats {
    #[inline]
    pub fn insns(&self) -> u64 {
        self.insn_count.load(Ordering::Relaxed)
    }

    /// Field read by window offset, for the guest-visible mapping.
    pub fn read_field(&self, offset: u32) -> u64 {
        match offset {
            ctx::JIT_UNIT_COUNT => self.unit_count.load(Ordering::Relaxed) as u64,
            ctx::JIT_CACHE_TOTAL => self.cache_total.load(Ordering::Relaxed) as u64,
            ctx::JIT_CACHE_FREE => self.cache_free.load(Ordering::Relaxed) as u64,
            ctx::JIT_CACHE_MISS => self.cache_miss.load(Ordering::Relaxed) as u64,
            ctx::JIT_CONTROL => self.control.load(Ordering::Relaxed) as u64,
            ctx::JIT_CONTROL2 => self.control2.load(Ordering::Relaxed) as u64,
            ctx::INSN_COUNT => self.insn_count.load(Ordering::Relaxed),
            _ => 0,
        }
    }
}

/// The in-memory mirror of the guest architectural state.
#[derive(Debug, Default)]
pub struct GuestState {
    /// Data registers D0-D7.
    pub d: [u32; 8],
    /// Address registers A0-A7. `a[7]` is the *active* stack pointer;
    /// the two inactive ones are parked in `usp`/`isp`/`msp`.
    pub a: [u32; 8],
    pub pc: u32,
    /// Status register, architectural layout.
    pub sr: u16,
    pub usp: u32,
    pub isp: u32,
    pub msp: u32,
    /// Vector base register.
    pub vbr: u32,
    /// Cache control register. Bit 0 gates the translation cache fast
    /// path in the dispatcher.
    pub cacr: u32,

    /// FP0-FP7, stored as IEEE-754 double.
    pub fp: [f64; 8],
    pub fpcr: u32,
    pub fpsr: u32,
    pub fpiar: u32,

    pub pending: SharedAtomics,

    /// Set by a guest STOP; cleared when an interrupt is injected.
    pub stopped: bool,

    /// Translation statistics; shared with the bus window.
    pub stats: Arc<JitStats>,
}

/// Cache-enable bit of CACR.
pub const CACR_IE: u32 = 1;

impl GuestState {
    pub fn new() -> Self {
        Self {
            sr: (Sr::S | Sr::IPM).bits(),
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_supervisor(&self) -> bool {
        self.sr & Sr::S.bits() != 0
    }

    #[inline]
    pub fn ipm(&self) -> u8 {
        ((self.sr & Sr::IPM.bits()) >> SR_IPM_SHIFT) as u8
    }

    /// SR with the C/V swap applied, as kept in the scratch system
    /// register while translated code runs.
    #[inline]
    pub fn sr_host(&self) -> u16 {
        swap_cv(self.sr)
    }

    #[inline]
    pub fn set_sr_from_host(&mut self, host_sr: u16) {
        self.sr = swap_cv(host_sr);
    }

    /// Switch to the supervisor stack, parking the user stack pointer.
    /// No-op when already in supervisor mode.
    pub fn enter_supervisor(&mut self) {
        if !self.is_supervisor() {
            self.usp = self.a[7];
            self.a[7] = if self.sr & Sr::M.bits() != 0 {
                self.msp
            } else {
                self.isp
            };
        }
    }

    /// Leave supervisor mode, parking the active supervisor stack
    /// pointer and reactivating USP. Used by RTE when the restored SR
    /// clears S.
    pub fn leave_supervisor(&mut self) {
        if self.sr & Sr::M.bits() != 0 {
            self.msp = self.a[7];
        } else {
            self.isp = self.a[7];
        }
        self.a[7] = self.usp;
    }

    /// Read a context-window field. Offsets and widths must match what
    /// the translator emits; anything else is a translator bug.
    pub fn ctx_read(&self, offset: u32, size: u8) -> u64 {
        match (offset, size) {
            (o, 4) if (ctx::D0..ctx::D0 + 32).contains(&o) => self.d[(o >> 2) as usize & 7] as u64,
            (o, 4) if (ctx::A0..ctx::A0 + 32).contains(&o) => {
                self.a[((o - ctx::A0) >> 2) as usize & 7] as u64
            }
            (ctx::PC, 4) => self.pc as u64,
            (ctx::SR, 2) => self.sr as u64,
            (ctx::USP, 4) => self.usp as u64,
            (ctx::ISP, 4) => self.isp as u64,
            (ctx::MSP, 4) => self.msp as u64,
            (ctx::VBR, 4) => self.vbr as u64,
            (ctx::CACR, 4) => self.cacr as u64,
            (ctx::FPCR, 2) => self.fpcr as u64,
            (ctx::FPSR, 4) => self.fpsr as u64,
            (ctx::FPIAR, 4) => self.fpiar as u64,
            (ctx::INT, 4) => self.pending.summary() as u64,
            (ctx::STOPPED, 4) => self.stopped as u64,
            (ctx::INSN_COUNT, 8) => self.stats.insn_count.load(Ordering::Relaxed),
            (
                ctx::JIT_UNIT_COUNT
                | ctx::JIT_CACHE_TOTAL
                | ctx::JIT_CACHE_FREE
                | ctx::JIT_CACHE_MISS
                | ctx::JIT_CONTROL
                | ctx::JIT_CONTROL2,
                4,
            ) => self.stats.read_field(offset),
            (o, 8) if (ctx::FP0..ctx::FP0 + 64).contains(&o) => {
                self.fp[((o - ctx::FP0) >> 3) as usize & 7].to_bits()
            }
            _ => {
                log::error!(target: "jit", "bad ctx read at {offset:#x} size {size}");
                0
            }
        }
    }

    /// Write a context-window field. See [`Self::ctx_read`].
    pub fn ctx_write(&mut self, offset: u32, size: u8, value: u64) {
        match (offset, size) {
            (o, 4) if (ctx::D0..ctx::D0 + 32).contains(&o) => {
                self.d[(o >> 2) as usize & 7] = value as u32
            }
            (o, 4) if (ctx::A0..ctx::A0 + 32).contains(&o) => {
                self.a[((o - ctx::A0) >> 2) as usize & 7] = value as u32
            }
            (ctx::PC, 4) => self.pc = value as u32,
            (ctx::SR, 2) => self.sr = value as u16,
            (ctx::USP, 4) => self.usp = value as u32,
            (ctx::ISP, 4) => self.isp = value as u32,
            (ctx::MSP, 4) => self.msp = value as u32,
            (ctx::VBR, 4) => self.vbr = value as u32,
            (ctx::CACR, 4) => self.cacr = value as u32,
            (ctx::FPCR, 2) => self.fpcr = value as u32,
            (ctx::FPSR, 4) => self.fpsr = value as u32,
            (ctx::FPIAR, 4) => self.fpiar = value as u32,
            (ctx::STOPPED, 4) => self.stopped = value != 0,
            (ctx::INSN_COUNT, 8) => self.stats.insn_count.store(value, Ordering::Relaxed),
            (o, 8) if (ctx::FP0..ctx::FP0 + 64).contains(&o) => {
                self.fp[((o - ctx::FP0) >> 3) as usize & 7] = f64::from_bits(value)
            }
            _ => {
                log::error!(target: "jit", "bad ctx write at {offset:#x} size {size}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_cv_is_involutive() {
        for sr in [0u16, 1, 2, 3, 0x1f, 0x2711, 0xffff] {
            assert_eq!(swap_cv(swap_cv(sr)), sr);
        }
        // C and V actually trade places.
        assert_eq!(swap_cv(Sr::C.bits()), Sr::V.bits());
        assert_eq!(swap_cv(Sr::V.bits()), Sr::C.bits());
        assert_eq!(swap_cv(Sr::Z.bits()), Sr::Z.bits());
    }

    #[test]
    fn supervisor_stack_switch() {
        let mut st = GuestState::new();
        st.sr = 0; // user mode
        st.a[7] = 0x1000;
        st.isp = 0x2000;
        st.enter_supervisor();
        assert_eq!(st.usp, 0x1000);
        assert_eq!(st.a[7], 0x2000);
    }

    #[test]
    fn pending_summary_packs_all_sources() {
        let st = GuestState::new();
        assert_eq!(st.pending.summary(), 0);
        st.pending.post(InterruptSource::GuestBus(3));
        st.pending.post(InterruptSource::Gpio(6));
        assert_eq!(st.pending.summary(), 0x0603);
        st.pending.post(InterruptSource::Serror);
        assert_ne!(st.pending.summary() & 0xff0000, 0);
    }
}
