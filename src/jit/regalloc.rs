//! Host register allocation.
//!
//! Guest D0-D7/A0-A7/PC are statically bound to fixed host registers
//! for the whole unit (see [`crate::emit::hostreg`]); there is no
//! spill or reload of those. What is allocated here is the transient
//! pool x0-x11, the FP transient pool d2-d7, and the lazily
//! materialized special slots: the packed condition-code register, the
//! guest-state base pointer, and the FPCR/FPSR mirrors.

use crate::emit::a64::{self, SysReg};
use crate::emit::hostreg;
use crate::error::CoreError;
use crate::state::ctx;

/// State of a lazily loaded special slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Slot {
    #[default]
    Unallocated,
    Loaded(u8),
    Dirty(u8),
}

impl Slot {
    #[inline]
    fn reg(self) -> Option<u8> {
        match self {
            Slot::Unallocated => None,
            Slot::Loaded(r) | Slot::Dirty(r) => Some(r),
        }
    }

    #[inline]
    fn is_dirty(self) -> bool {
        matches!(self, Slot::Dirty(_))
    }
}

/// Per-unit register allocator state, rebuilt for every translation.
#[derive(Debug, Default)]
pub struct RegAlloc {
    /// Bitmap of transient GPRs currently handed out.
    pool: u16,
    /// Every transient that was used at least once in this unit.
    changed: u16,
    /// Bitmap of transient FP registers handed out.
    fp_pool: u8,
    /// Guest FP registers written during this unit; their host homes
    /// must be stored back in the epilogue.
    fp_dirty: u8,
    cc: Slot,
    ctx_ptr: Option<u8>,
    fpcr: Slot,
    fpsr: Slot,
}

impl RegAlloc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host GPR statically holding guest Dn.
    #[inline]
    pub fn map_d(&self, n: u8) -> u8 {
        hostreg::d(n)
    }

    /// Host GPR statically holding guest An.
    #[inline]
    pub fn map_a(&self, n: u8) -> u8 {
        hostreg::a(n)
    }

    /// Host FP register statically holding guest FPn.
    #[inline]
    pub fn map_fp(&self, n: u8) -> u8 {
        hostreg::fp(n)
    }

    /// Mark guest FPn written; the epilogue stores it back.
    pub fn set_fp_dirty(&mut self, n: u8) {
        self.fp_dirty |= 1 << (n & 7);
    }

    pub fn fp_dirty_mask(&self) -> u8 {
        self.fp_dirty
    }

    fn try_alloc(&mut self) -> Option<u8> {
        let free = (!self.pool) & ((1 << hostreg::TEMP_COUNT) - 1);
        if free == 0 {
            return None;
        }
        let reg = free.trailing_zeros() as u8;
        self.pool |= 1 << reg;
        self.changed |= 1 << reg;
        Some(reg)
    }

    /// Allocate a transient GPR. When the pool is exhausted the FPCR,
    /// FPSR and CC slots are flushed back in that order to free their
    /// homes; failing even then is a translator bug.
    pub fn alloc_temp(&mut self, out: &mut Vec<u32>) -> Result<u8, CoreError> {
        if let Some(r) = self.try_alloc() {
            return Ok(r);
        }
        self.flush_fpcr(out);
        if let Some(r) = self.try_alloc() {
            return Ok(r);
        }
        self.flush_fpsr(out);
        if let Some(r) = self.try_alloc() {
            return Ok(r);
        }
        self.flush_cc(out);
        self.try_alloc().ok_or(CoreError::RegisterPoolExhausted)
    }

    pub fn free_temp(&mut self, reg: u8) {
        if reg < hostreg::TEMP_COUNT {
            self.pool &= !(1 << reg);
        }
    }

    /// Transient copy of guest Dn for destructive temporaries.
    pub fn copy_from_d(&mut self, out: &mut Vec<u32>, n: u8) -> Result<u8, CoreError> {
        let reg = self.alloc_temp(out)?;
        out.push(a64::mov_reg(reg, hostreg::d(n)));
        Ok(reg)
    }

    /// Transient copy of guest An.
    pub fn copy_from_a(&mut self, out: &mut Vec<u32>, n: u8) -> Result<u8, CoreError> {
        let reg = self.alloc_temp(out)?;
        out.push(a64::mov_reg(reg, hostreg::a(n)));
        Ok(reg)
    }

    pub fn alloc_fp_temp(&mut self) -> Result<u8, CoreError> {
        for reg in hostreg::FP_TEMP_FIRST..=hostreg::FP_TEMP_LAST {
            if self.fp_pool & (1 << reg) == 0 {
                self.fp_pool |= 1 << reg;
                return Ok(reg);
            }
        }
        Err(CoreError::RegisterPoolExhausted)
    }

    pub fn free_fp_temp(&mut self, reg: u8) {
        self.fp_pool &= !(1 << reg);
    }

    /// Bitmap of transients currently held; anything outside
    /// [`Self::special_mask`] at an instruction boundary means a
    /// handler leaked a register.
    pub fn temp_mask(&self) -> u16 {
        self.pool
    }

    /// Pool registers legitimately held across instructions by the
    /// lazy special slots (CC, CTX, FPCR, FPSR).
    pub fn special_mask(&self) -> u16 {
        let mut mask = 0;
        for slot in [self.cc, self.fpcr, self.fpsr] {
            if let Some(r) = slot.reg() {
                mask |= 1 << r;
            }
        }
        if let Some(r) = self.ctx_ptr {
            mask |= 1 << r;
        }
        mask
    }

    pub fn clear_changed(&mut self) {
        self.changed = 0;
    }

    // -- condition codes ---------------------------------------------------

    /// Register holding the packed guest SR (C/V swapped), loading it
    /// from the scratch system register on first use.
    pub fn get_cc(&mut self, out: &mut Vec<u32>) -> Result<u8, CoreError> {
        if let Some(r) = self.cc.reg() {
            return Ok(r);
        }
        let reg = self.alloc_temp(out)?;
        out.push(a64::mrs(reg, SysReg::SrScratch));
        self.cc = Slot::Loaded(reg);
        Ok(reg)
    }

    /// Like [`Self::get_cc`] but marks the value dirty.
    pub fn modify_cc(&mut self, out: &mut Vec<u32>) -> Result<u8, CoreError> {
        let reg = self.get_cc(out)?;
        self.cc = Slot::Dirty(reg);
        Ok(reg)
    }

    /// Write CC back without releasing its register (epilogue use).
    pub fn store_cc(&self, out: &mut Vec<u32>) {
        if let Slot::Dirty(r) = self.cc {
            out.push(a64::msr(SysReg::SrScratch, r));
        }
    }

    /// Write back if dirty and release the register.
    pub fn flush_cc(&mut self, out: &mut Vec<u32>) {
        if let Some(r) = self.cc.reg() {
            if self.cc.is_dirty() {
                out.push(a64::msr(SysReg::SrScratch, r));
            }
            self.free_temp(r);
        }
        self.cc = Slot::Unallocated;
    }

    pub fn cc_is_loaded(&self) -> bool {
        self.cc.reg().is_some()
    }

    // -- guest-state base pointer ------------------------------------------

    /// Register holding the guest-state base pointer, read from the
    /// read-only thread pointer on first use.
    pub fn get_ctx(&mut self, out: &mut Vec<u32>) -> Result<u8, CoreError> {
        if let Some(r) = self.ctx_ptr {
            return Ok(r);
        }
        let reg = self.alloc_temp(out)?;
        out.push(a64::mrs(reg, SysReg::CtxPointer));
        self.ctx_ptr = Some(reg);
        Ok(reg)
    }

    pub fn flush_ctx(&mut self) {
        if let Some(r) = self.ctx_ptr.take() {
            self.free_temp(r);
        }
    }

    // -- FPCR / FPSR mirrors -----------------------------------------------

    pub fn get_fpcr(&mut self, out: &mut Vec<u32>) -> Result<u8, CoreError> {
        if let Some(r) = self.fpcr.reg() {
            return Ok(r);
        }
        let base = self.get_ctx(out)?;
        let reg = self.alloc_temp(out)?;
        out.push(a64::ldrh_uoff(reg, base, ctx::FPCR));
        self.fpcr = Slot::Loaded(reg);
        Ok(reg)
    }

    pub fn modify_fpcr(&mut self, out: &mut Vec<u32>) -> Result<u8, CoreError> {
        let reg = self.get_fpcr(out)?;
        self.fpcr = Slot::Dirty(reg);
        Ok(reg)
    }

    pub fn store_fpcr(&mut self, out: &mut Vec<u32>) -> Result<(), CoreError> {
        if let Slot::Dirty(r) = self.fpcr {
            let base = self.get_ctx(out)?;
            out.push(a64::strh_uoff(r, base, ctx::FPCR));
        }
        Ok(())
    }

    pub fn flush_fpcr(&mut self, out: &mut Vec<u32>) {
        if let Some(r) = self.fpcr.reg() {
            if self.fpcr.is_dirty()
                && let Some(base) = self.ctx_ptr
            {
                out.push(a64::strh_uoff(r, base, ctx::FPCR));
            }
            self.free_temp(r);
        }
        self.fpcr = Slot::Unallocated;
    }

    pub fn get_fpsr(&mut self, out: &mut Vec<u32>) -> Result<u8, CoreError> {
        if let Some(r) = self.fpsr.reg() {
            return Ok(r);
        }
        let base = self.get_ctx(out)?;
        let reg = self.alloc_temp(out)?;
        out.push(a64::ldr_uoff(reg, base, ctx::FPSR));
        self.fpsr = Slot::Loaded(reg);
        Ok(reg)
    }

    pub fn modify_fpsr(&mut self, out: &mut Vec<u32>) -> Result<u8, CoreError> {
        let reg = self.get_fpsr(out)?;
        self.fpsr = Slot::Dirty(reg);
        Ok(reg)
    }

    pub fn store_fpsr(&mut self, out: &mut Vec<u32>) -> Result<(), CoreError> {
        if let Slot::Dirty(r) = self.fpsr {
            let base = self.get_ctx(out)?;
            out.push(a64::str_uoff(r, base, ctx::FPSR));
        }
        Ok(())
    }

    pub fn flush_fpsr(&mut self, out: &mut Vec<u32>) {
        if let Some(r) = self.fpsr.reg() {
            if self.fpsr.is_dirty()
                && let Some(base) = self.ctx_ptr
            {
                out.push(a64::str_uoff(r, base, ctx::FPSR));
            }
            self.free_temp(r);
        }
        self.fpsr = Slot::Unallocated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_maps_are_fixed() {
        let ra = RegAlloc::new();
        assert_eq!(ra.map_d(0), 19);
        assert_eq!(ra.map_d(7), 26);
        assert_eq!(ra.map_a(7), 29);
        assert_eq!(ra.map_fp(0), 8);
    }

    #[test]
    fn temps_come_from_low_pool() {
        let mut ra = RegAlloc::new();
        let mut out = Vec::new();
        let r0 = ra.alloc_temp(&mut out).unwrap();
        let r1 = ra.alloc_temp(&mut out).unwrap();
        assert_eq!((r0, r1), (0, 1));
        ra.free_temp(r0);
        assert_eq!(ra.alloc_temp(&mut out).unwrap(), 0);
    }

    #[test]
    fn exhaustion_flushes_special_slots() {
        let mut ra = RegAlloc::new();
        let mut out = Vec::new();
        // Load CC so it occupies a pool register.
        ra.modify_cc(&mut out).unwrap();
        // Drain the rest of the pool.
        let mut held = Vec::new();
        while let Some(r) = ra.try_alloc() {
            held.push(r);
        }
        let before = out.len();
        // Next allocation must flush CC (msr write-back) and succeed.
        let r = ra.alloc_temp(&mut out).unwrap();
        assert!(out.len() > before);
        assert!(!ra.cc_is_loaded());
        assert!(r < hostreg::TEMP_COUNT);
        // Now the pool really is full.
        assert!(matches!(
            ra.alloc_temp(&mut out),
            Err(CoreError::RegisterPoolExhausted)
        ));
    }

    #[test]
    fn cc_loads_once_and_stores_when_dirty() {
        let mut ra = RegAlloc::new();
        let mut out = Vec::new();
        let r1 = ra.get_cc(&mut out).unwrap();
        let r2 = ra.get_cc(&mut out).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(out.len(), 1); // single mrs
        ra.flush_cc(&mut out);
        assert_eq!(out.len(), 1); // clean: no write-back
        ra.modify_cc(&mut out).unwrap();
        ra.flush_cc(&mut out);
        assert_eq!(out.len(), 3); // mrs + msr
    }
}
