//! Page-fault MMIO and trap services.
//!
//! Unmapped guest physical addresses are absent pages on the host; a
//! load or store into them raises a data abort. The handler pattern
//! matches the faulting instruction word — every load/store form the
//! emitter produces — recomputes the target address from the register
//! image, synthesizes the bus cycle, applies index write-back and pair
//! unpacking, and resumes after the faulting instruction.
//!
//! The same module services the typed traps generated code raises on
//! purpose: unit re-validation and the FPU runtime helpers.

use std::sync::Arc;

use crate::bus::{BusBackend, Width};
use crate::config::JitConfig;
use crate::emit::hostreg;
use crate::error::CoreError;
use crate::jit::icache::ICache;
use crate::jit::unit::{EXEC_MIRROR_TAG, TranslationUnit};

/// FPU helper-trap immediates (HLT #imm).
pub mod fptrap {
    pub const BASE: u16 = 0x0f00;
    pub const ID_MASK: u16 = 0x00ff;

    pub const SIN: u16 = 0x01;
    pub const COS: u16 = 0x02;
    pub const TAN: u16 = 0x03;
    pub const ATAN: u16 = 0x04;
    pub const ASIN: u16 = 0x05;
    pub const ACOS: u16 = 0x06;
    pub const ETOX: u16 = 0x07;
    pub const ETOXM1: u16 = 0x08;
    pub const TENTOX: u16 = 0x09;
    pub const TWOTOX: u16 = 0x0a;
    pub const LOGN: u16 = 0x0b;
    pub const LOGNP1: u16 = 0x0c;
    pub const LOG10: u16 = 0x0d;
    pub const LOG2: u16 = 0x0e;
    pub const SINH: u16 = 0x0f;
    pub const COSH: u16 = 0x10;
    pub const TANH: u16 = 0x11;
    pub const ATANH: u16 = 0x12;
    pub const GETEXP: u16 = 0x13;
    pub const GETMAN: u16 = 0x14;
    pub const FMOD: u16 = 0x15;
    pub const FREM: u16 = 0x16;
    pub const FSCALE: u16 = 0x17;
    pub const LOAD96: u16 = 0x20;
    pub const SAVE96: u16 = 0x21;
    pub const LOAD_PACKED: u16 = 0x22;
    pub const SAVE_PACKED: u16 = 0x23;
}

/// Host register image at the point of the fault. x31 reads as zero;
/// the FP file holds the raw 64-bit contents.
#[derive(Debug, Clone)]
pub struct HostRegs {
    pub x: [u64; 32],
    pub v: [u64; 32],
}

impl Default for HostRegs {
    fn default() -> Self {
        Self {
            x: [0; 32],
            v: [0; 32],
        }
    }
}

impl HostRegs {
    #[inline]
    pub fn gpr(&self, n: u32) -> u64 {
        if n == 31 { 0 } else { self.x[n as usize] }
    }

    #[inline]
    pub fn set_gpr(&mut self, n: u32, value: u64) {
        if n != 31 {
            self.x[n as usize] = value;
        }
    }

    fn fp_as_single(&self, n: u32) -> u32 {
        (f64::from_bits(self.v[n as usize]) as f32).to_bits()
    }

    fn set_fp_from_single(&mut self, n: u32, bits: u32) {
        self.v[n as usize] = (f32::from_bits(bits) as f64).to_bits();
    }
}

/// Access width of the plain integer forms, from the size field.
#[inline]
fn op_size(opcode: u32) -> u32 {
    1 << (opcode >> 30)
}

#[inline]
fn unscaled_offset(opcode: u32) -> i64 {
    // imm9 at bits 20..12, sign-extended.
    (opcode as i64) << 43 >> 55
}

#[inline]
fn extend_index(opcode: u32, rm: u64) -> u64 {
    match (opcode >> 13) & 7 {
        0b010 => rm & 0xffff_ffff,                // UXTW
        0b110 => (rm as u32) as i32 as i64 as u64, // SXTW
        _ => rm,                                   // LSL / SXTX
    }
}

/// Sentinel FAR for callers that only know the instruction, not the
/// reported address (the reference executor).
pub const FAR_UNKNOWN: u64 = u64::MAX;

fn check_addr(kind: &str, computed: u64, far: u64) -> u64 {
    if far != FAR_UNKNOWN && computed != far {
        // Likely an out-of-order speculative report; trust the
        // recomputed address.
        log::warn!(
            target: "fault",
            "address mismatch in {kind}: FAR {far:#x}, recomputed {computed:#x}"
        );
    }
    computed
}

/// Fold the one-wrap mirror areas of 64-bit host arithmetic back into
/// the guest's 32-bit space.
#[inline]
pub fn fold_address(far: u64) -> u32 {
    far as u32
}

/// Decode and service a faulting *store*. Returns the recomputed fault
/// address on success.
pub fn handle_write_fault(
    opcode: u32,
    regs: &mut HostRegs,
    far: u64,
    bus: &mut dyn BusBackend,
) -> Result<u64, CoreError> {
    let rt = opcode & 31;
    let rn = (opcode >> 5) & 31;

    // Cache maintenance by VA reached an unmapped page: nothing to do.
    if opcode & 0xffff_ffe0 == 0xd50b_7e20 {
        return Ok(far);
    }

    // ---- floating-point stores --------------------------------------
    if opcode & 0xbfe0_0c00 == 0xbc00_0000 {
        // STUR Sn/Dn
        let size = if opcode & 0x4000_0000 != 0 { 8 } else { 4 };
        let addr = check_addr("stur fp", regs.gpr(rn).wrapping_add_signed(unscaled_offset(opcode)), far);
        store_fp(bus, regs, rt, size, addr);
        return Ok(addr);
    }
    if opcode & 0xbfe0_0400 == 0xbc00_0400 {
        // STR Sn/Dn, pre/post indexed
        let size = if opcode & 0x4000_0000 != 0 { 8u32 } else { 4 };
        let pre = opcode & 0x800 != 0;
        let offset = unscaled_offset(opcode);
        let base = regs.gpr(rn);
        let addr = check_addr(
            "str fp indexed",
            if pre { base.wrapping_add_signed(offset) } else { base },
            far,
        );
        store_fp(bus, regs, rt, size, addr);
        regs.set_gpr(rn, base.wrapping_add_signed(offset));
        return Ok(addr);
    }
    if opcode & 0xbfc0_0000 == 0xbd00_0000 {
        // STR Sn/Dn, unsigned offset
        let size = if opcode & 0x4000_0000 != 0 { 8u32 } else { 4 };
        let off = ((opcode >> 10) & 0xfff) as u64 * size as u64;
        let addr = check_addr("str fp uoff", regs.gpr(rn).wrapping_add(off), far);
        store_fp(bus, regs, rt, size, addr);
        return Ok(addr);
    }
    if opcode & 0xbfe0_4c00 == 0xbc20_4800 {
        // STR Sn/Dn, register offset
        let size = if opcode & 0x4000_0000 != 0 { 8u32 } else { 4 };
        let mut rm = extend_index(opcode, regs.gpr((opcode >> 16) & 31));
        if opcode & 0x1000 != 0 {
            rm <<= size.trailing_zeros();
        }
        let addr = check_addr("str fp roff", regs.gpr(rn).wrapping_add(rm), far);
        store_fp(bus, regs, rt, size, addr);
        return Ok(addr);
    }
    if opcode & 0xffc0_0000 == 0x6d00_0000 {
        // STP Dn,Dm: one 16-byte cycle, first register in the high
        // half of the value.
        let off = (((opcode >> 15) & 0x7f) as i64); // imm7
        let off = (off << 57 >> 57) * 8;
        let addr = check_addr("stp fp", regs.gpr(rn).wrapping_add_signed(off), far);
        bus_write(bus, addr, 8, regs.v[rt as usize]);
        bus_write(bus, addr.wrapping_add(8), 8, regs.v[((opcode >> 10) & 31) as usize]);
        return Ok(addr);
    }

    // ---- integer stores ---------------------------------------------
    if opcode & 0x3fe0_0c00 == 0x3800_0000 {
        // STUR
        let size = op_size(opcode);
        let addr = check_addr("stur", regs.gpr(rn).wrapping_add_signed(unscaled_offset(opcode)), far);
        bus_write(bus, addr, size, regs.gpr(rt));
        return Ok(addr);
    }
    if opcode & 0x3fe0_0400 == 0x3800_0400 {
        // STR pre/post indexed
        let size = op_size(opcode);
        let pre = opcode & 0x800 != 0;
        let offset = unscaled_offset(opcode);
        let base = regs.gpr(rn);
        let addr = check_addr(
            "str indexed",
            if pre { base.wrapping_add_signed(offset) } else { base },
            far,
        );
        bus_write(bus, addr, size, regs.gpr(rt));
        regs.set_gpr(rn, base.wrapping_add_signed(offset));
        return Ok(addr);
    }
    if opcode & 0x3fc0_0000 == 0x3900_0000 {
        // STR unsigned offset
        let size = op_size(opcode);
        let off = ((opcode >> 10) & 0xfff) as u64 * size as u64;
        let addr = check_addr("str uoff", regs.gpr(rn).wrapping_add(off), far);
        bus_write(bus, addr, size, regs.gpr(rt));
        return Ok(addr);
    }
    if opcode & 0x3fe0_0c00 == 0x3820_0800 {
        // STR register offset
        let size = op_size(opcode);
        let mut rm = extend_index(opcode, regs.gpr((opcode >> 16) & 31));
        if opcode & 0x1000 != 0 {
            rm <<= size.trailing_zeros();
        }
        let addr = check_addr("str roff", regs.gpr(rn).wrapping_add(rm), far);
        bus_write(bus, addr, size, regs.gpr(rt));
        return Ok(addr);
    }
    if opcode & 0x3fe0_7c00 == 0x0800_7c00 {
        // ST(L)XR: the guest bus has no exclusive monitor; complete as
        // an ordinary store and report success in the status register.
        let size = op_size(opcode);
        let addr = check_addr("stxr", regs.gpr(rn), far);
        bus_write(bus, addr, size, regs.gpr(rt));
        regs.set_gpr((opcode >> 16) & 31, 0);
        return Ok(addr);
    }
    if opcode & 0x7fc0_0000 == 0x2900_0000
        || opcode & 0x7fc0_0000 == 0x2880_0000
        || opcode & 0x7fc0_0000 == 0x2980_0000
    {
        // STP, signed offset / post / pre
        let size: u64 = if opcode & 0x8000_0000 != 0 { 8 } else { 4 };
        let offset = ((((opcode >> 15) & 0x7f) as i64) << 57 >> 57) * size as i64;
        let base = regs.gpr(rn);
        let post = opcode & 0x7fc0_0000 == 0x2880_0000;
        let writeback = opcode & 0x7fc0_0000 != 0x2900_0000;
        let addr = check_addr(
            "stp",
            if post { base } else { base.wrapping_add_signed(offset) },
            far,
        );
        let rt2 = (opcode >> 10) & 31;
        // Two element cycles; either half may be the one that faulted.
        bus_write(bus, addr, size as u32, regs.gpr(rt));
        bus_write(bus, addr.wrapping_add(size), size as u32, regs.gpr(rt2));
        if writeback {
            regs.set_gpr(rn, base.wrapping_add_signed(offset));
        }
        return Ok(addr);
    }

    Err(CoreError::UnhandledFault { opcode, pc: far })
}

/// Decode and service a faulting *load*.
pub fn handle_read_fault(
    opcode: u32,
    regs: &mut HostRegs,
    far: u64,
    bus: &mut dyn BusBackend,
) -> Result<u64, CoreError> {
    let rt = opcode & 31;
    let rn = (opcode >> 5) & 31;

    // ---- floating-point loads ---------------------------------------
    if opcode & 0xbfe0_0c00 == 0xbc40_0000 {
        // LDUR Sn/Dn
        let size = if opcode & 0x4000_0000 != 0 { 8u32 } else { 4 };
        let addr = check_addr("ldur fp", regs.gpr(rn).wrapping_add_signed(unscaled_offset(opcode)), far);
        load_fp(bus, regs, rt, size, addr);
        return Ok(addr);
    }
    if opcode & 0xbfe0_0400 == 0xbc40_0400 {
        // LDR Sn/Dn pre/post
        let size = if opcode & 0x4000_0000 != 0 { 8u32 } else { 4 };
        let pre = opcode & 0x800 != 0;
        let offset = unscaled_offset(opcode);
        let base = regs.gpr(rn);
        let addr = check_addr(
            "ldr fp indexed",
            if pre { base.wrapping_add_signed(offset) } else { base },
            far,
        );
        load_fp(bus, regs, rt, size, addr);
        regs.set_gpr(rn, base.wrapping_add_signed(offset));
        return Ok(addr);
    }
    if opcode & 0xbfc0_0000 == 0xbd40_0000 {
        // LDR Sn/Dn unsigned offset
        let size = if opcode & 0x4000_0000 != 0 { 8u32 } else { 4 };
        let off = ((opcode >> 10) & 0xfff) as u64 * size as u64;
        let addr = check_addr("ldr fp uoff", regs.gpr(rn).wrapping_add(off), far);
        load_fp(bus, regs, rt, size, addr);
        return Ok(addr);
    }
    if opcode & 0xbfe0_4c00 == 0xbc60_4800 || opcode & 0xbfe0_0c00 == 0xbc60_0800 {
        // LDR Sn/Dn register offset
        let size = if opcode & 0x4000_0000 != 0 { 8u32 } else { 4 };
        let mut rm = extend_index(opcode, regs.gpr((opcode >> 16) & 31));
        if opcode & 0x1000 != 0 {
            rm <<= size.trailing_zeros();
        }
        let addr = check_addr("ldr fp roff", regs.gpr(rn).wrapping_add(rm), far);
        load_fp(bus, regs, rt, size, addr);
        return Ok(addr);
    }
    if opcode & 0xffc0_0000 == 0x6d40_0000 {
        // LDP Dn,Dm
        let off = ((((opcode >> 15) & 0x7f) as i64) << 57 >> 57) * 8;
        let addr = check_addr("ldp fp", regs.gpr(rn).wrapping_add_signed(off), far);
        regs.v[rt as usize] = bus_read(bus, addr, 8);
        regs.v[((opcode >> 10) & 31) as usize] = bus_read(bus, addr.wrapping_add(8), 8);
        return Ok(addr);
    }

    // ---- PC-relative literals ---------------------------------------
    // These only fault when speculation walks off a code page; reload
    // through the bus like any other read.
    if opcode & 0xbf00_0000 == 0x1800_0000 {
        let size = if opcode & 0x4000_0000 != 0 { 8 } else { 4 };
        let value = bus_read(bus, far, size);
        regs.set_gpr(rt, value);
        return Ok(far);
    }
    if opcode & 0xff00_0000 == 0x9800_0000 {
        // LDRSW literal
        let value = bus_read(bus, far, 4) as u32 as i32 as i64 as u64;
        regs.set_gpr(rt, value);
        return Ok(far);
    }

    // ---- exclusives --------------------------------------------------
    if opcode & 0x3fff_fc00 == 0x085f_7c00 {
        // LD(A)XR: no exclusive monitor on the guest bus, complete as
        // a plain load.
        let size = op_size(opcode);
        let addr = check_addr("ldxr", regs.gpr(rn), far);
        regs.set_gpr(rt, bus_read(bus, addr, size));
        return Ok(addr);
    }

    // ---- integer loads ----------------------------------------------
    // opc field (bits 23:22): 01 zero-extend, 10 sign-extend to 64,
    // 11 sign-extend to 32.
    let opc = (opcode >> 22) & 3;
    if opcode & 0x3fe0_0c00 == 0x3840_0000
        || opcode & 0x3fe0_0c00 == 0x3880_0000
        || opcode & 0x3fe0_0c00 == 0x38c0_0000
    {
        // LDUR / LDURS*
        let size = op_size(opcode);
        let addr = check_addr("ldur", regs.gpr(rn).wrapping_add_signed(unscaled_offset(opcode)), far);
        let value = extend_loaded(bus_read(bus, addr, size), size, opc);
        regs.set_gpr(rt, value);
        return Ok(addr);
    }
    if opcode & 0x3fe0_0400 == 0x3840_0400
        || opcode & 0x3fe0_0400 == 0x3880_0400
        || opcode & 0x3fe0_0400 == 0x38c0_0400
    {
        // LDR / LDRS* pre/post indexed
        let size = op_size(opcode);
        let pre = opcode & 0x800 != 0;
        let offset = unscaled_offset(opcode);
        let base = regs.gpr(rn);
        let addr = check_addr(
            "ldr indexed",
            if pre { base.wrapping_add_signed(offset) } else { base },
            far,
        );
        let value = extend_loaded(bus_read(bus, addr, size), size, opc);
        regs.set_gpr(rt, value);
        regs.set_gpr(rn, base.wrapping_add_signed(offset));
        return Ok(addr);
    }
    if opcode & 0x3f40_0000 == 0x3940_0000 || opcode & 0x3fc0_0000 == 0x3980_0000 {
        // LDR / LDRS* unsigned offset
        let size = op_size(opcode);
        let off = ((opcode >> 10) & 0xfff) as u64 * size as u64;
        let addr = check_addr("ldr uoff", regs.gpr(rn).wrapping_add(off), far);
        let value = extend_loaded(bus_read(bus, addr, size), size, opc);
        regs.set_gpr(rt, value);
        return Ok(addr);
    }
    if opcode & 0x3fe0_0c00 == 0x3860_0800
        || opcode & 0x3fe0_0c00 == 0x38a0_0800
        || opcode & 0x3fe0_0c00 == 0x38e0_0800
    {
        // LDR / LDRS* register offset
        let size = op_size(opcode);
        let mut rm = extend_index(opcode, regs.gpr((opcode >> 16) & 31));
        if opcode & 0x1000 != 0 {
            rm <<= size.trailing_zeros();
        }
        let addr = check_addr("ldr roff", regs.gpr(rn).wrapping_add(rm), far);
        let value = extend_loaded(bus_read(bus, addr, size), size, opc);
        regs.set_gpr(rt, value);
        return Ok(addr);
    }
    if opcode & 0x7fc0_0000 == 0x2940_0000
        || opcode & 0x7fc0_0000 == 0x28c0_0000
        || opcode & 0x7fc0_0000 == 0x29c0_0000
    {
        // LDP, signed offset / post / pre
        let size: u64 = if opcode & 0x8000_0000 != 0 { 8 } else { 4 };
        let offset = ((((opcode >> 15) & 0x7f) as i64) << 57 >> 57) * size as i64;
        let base = regs.gpr(rn);
        let post = opcode & 0x7fc0_0000 == 0x28c0_0000;
        let writeback = opcode & 0x7fc0_0000 != 0x2940_0000;
        let addr = check_addr(
            "ldp",
            if post { base } else { base.wrapping_add_signed(offset) },
            far,
        );
        let rt2 = (opcode >> 10) & 31;
        // Two element cycles into the two destination registers.
        regs.set_gpr(rt, bus_read(bus, addr, size as u32));
        regs.set_gpr(rt2, bus_read(bus, addr.wrapping_add(size), size as u32));
        if writeback {
            regs.set_gpr(rn, base.wrapping_add_signed(offset));
        }
        return Ok(addr);
    }
    if opcode & 0xffc0_0000 == 0x6940_0000 {
        // LDPSW: two words, each sign-extended to 64 bits.
        let offset = ((((opcode >> 15) & 0x7f) as i64) << 57 >> 57) * 4;
        let addr = check_addr("ldpsw", regs.gpr(rn).wrapping_add_signed(offset), far);
        let rt2 = (opcode >> 10) & 31;
        regs.set_gpr(rt, bus_read(bus, addr, 4) as u32 as i32 as i64 as u64);
        regs.set_gpr(rt2, bus_read(bus, addr.wrapping_add(4), 4) as u32 as i32 as i64 as u64);
        return Ok(addr);
    }

    Err(CoreError::UnhandledFault { opcode, pc: far })
}

fn extend_loaded(value: u64, size: u32, opc: u32) -> u64 {
    match opc {
        2 => match size {
            1 => value as u8 as i8 as i64 as u64,
            2 => value as u16 as i16 as i64 as u64,
            _ => value as u32 as i32 as i64 as u64,
        },
        3 => match size {
            1 => (value as u8 as i8 as i32) as u32 as u64,
            _ => (value as u16 as i16 as i32) as u32 as u64,
        },
        _ => value,
    }
}

/// Read a bus value and convert it to the memory image the faulting
/// host instruction would have loaded: guest memory is big-endian, the
/// host load is little-endian, so multi-byte values come back swapped.
/// The byte-reverse the translator emits after the load undoes it.
fn bus_read(bus: &mut dyn BusBackend, addr: u64, size: u32) -> u64 {
    let width = Width::from_bytes(size).unwrap_or(Width::Byte);
    let value = bus.read(fold_address(addr), width) as u64;
    swap_image(value, size)
}

/// Write a host register image as a guest bus value (the inverse swap).
fn bus_write(bus: &mut dyn BusBackend, addr: u64, size: u32, image: u64) {
    let width = Width::from_bytes(size).unwrap_or(Width::Byte);
    bus.write(fold_address(addr), width, swap_image(image, size) as u128);
}

#[inline]
fn swap_image(value: u64, size: u32) -> u64 {
    match size {
        1 => value & 0xff,
        2 => (value as u16).swap_bytes() as u64,
        4 => (value as u32).swap_bytes() as u64,
        _ => value.swap_bytes(),
    }
}

fn load_fp(bus: &mut dyn BusBackend, regs: &mut HostRegs, rt: u32, size: u32, addr: u64) {
    let value = bus_read(bus, addr, size);
    if size == 8 {
        regs.v[rt as usize] = value;
    } else {
        regs.set_fp_from_single(rt, value as u32);
    }
}

fn store_fp(bus: &mut dyn BusBackend, regs: &mut HostRegs, rt: u32, size: u32, addr: u64) {
    let value = if size == 8 {
        regs.v[rt as usize]
    } else {
        regs.fp_as_single(rt) as u64
    };
    bus_write(bus, addr, size, value);
}

// ---------------------------------------------------------------------------
// Validation traps
// ---------------------------------------------------------------------------

/// Outcome of a validation trap on a tagged executable address.
pub enum VerifyOutcome {
    /// The unit still checks out; re-enter it.
    Resume(Arc<TranslationUnit>),
    /// The unit changed (or was gone); translate afresh.
    Retranslate(Arc<TranslationUnit>),
}

/// A fetch fault in the tagged range is a request to re-validate the
/// unit covering the encoded guest PC before re-entering it.
pub fn handle_verify_trap(
    addr: u64,
    icache: &mut ICache,
    bus: &mut dyn BusBackend,
    cfg: &JitConfig,
) -> Result<Option<VerifyOutcome>, CoreError> {
    if addr & EXEC_MIRROR_TAG == 0 {
        return Ok(None);
    }
    let pc = addr as u32;
    if let Some(unit) = icache.lookup(pc)
        && let Some(unit) = icache.verify(bus, unit)
    {
        return Ok(Some(VerifyOutcome::Resume(unit)));
    }
    let unit = icache.lookup_or_translate(bus, cfg, pc)?;
    Ok(Some(VerifyOutcome::Retranslate(unit)))
}

// ---------------------------------------------------------------------------
// FPU helper traps
// ---------------------------------------------------------------------------

/// Service an FPU helper trap (HLT with an immediate in the helper
/// range). Returns false when the immediate is not a helper id.
pub fn handle_fp_trap(imm: u16, regs: &mut HostRegs, bus: &mut dyn BusBackend) -> bool {
    if imm & !fptrap::ID_MASK != fptrap::BASE {
        return false;
    }
    let d0 = f64::from_bits(regs.v[0]);
    let d1 = f64::from_bits(regs.v[1]);
    let addr = fold_address(regs.x[hostreg::HELPER_ADDR as usize]);

    let result = match imm & fptrap::ID_MASK {
        x if x == fptrap::SIN => d0.sin(),
        x if x == fptrap::COS => d0.cos(),
        x if x == fptrap::TAN => d0.tan(),
        x if x == fptrap::ATAN => d0.atan(),
        x if x == fptrap::ASIN => d0.asin(),
        x if x == fptrap::ACOS => d0.acos(),
        x if x == fptrap::ETOX => d0.exp(),
        x if x == fptrap::ETOXM1 => d0.exp_m1(),
        x if x == fptrap::TENTOX => 10f64.powf(d0),
        x if x == fptrap::TWOTOX => d0.exp2(),
        x if x == fptrap::LOGN => d0.ln(),
        x if x == fptrap::LOGNP1 => d0.ln_1p(),
        x if x == fptrap::LOG10 => d0.log10(),
        x if x == fptrap::LOG2 => d0.log2(),
        x if x == fptrap::SINH => d0.sinh(),
        x if x == fptrap::COSH => d0.cosh(),
        x if x == fptrap::TANH => d0.tanh(),
        x if x == fptrap::ATANH => d0.atanh(),
        x if x == fptrap::GETEXP => {
            if d0 == 0.0 || !d0.is_finite() {
                f64::NAN
            } else {
                d0.abs().log2().floor()
            }
        }
        x if x == fptrap::GETMAN => {
            if d0 == 0.0 || !d0.is_finite() {
                d0
            } else {
                let exp = d0.abs().log2().floor();
                d0 / exp.exp2()
            }
        }
        x if x == fptrap::FMOD => {
            let q = (d0 / d1).trunc();
            d0 - q * d1
        }
        x if x == fptrap::FREM => {
            let q = (d0 / d1).round();
            d0 - q * d1
        }
        x if x == fptrap::FSCALE => d0 * ((d1.trunc() as i32) as f64).exp2(),
        x if x == fptrap::LOAD96 => {
            let v = load_extended(bus, addr);
            regs.v[0] = v.to_bits();
            return true;
        }
        x if x == fptrap::SAVE96 => {
            store_extended(bus, addr, d0);
            return true;
        }
        x if x == fptrap::LOAD_PACKED => {
            regs.v[0] = load_packed(bus, addr).to_bits();
            return true;
        }
        x if x == fptrap::SAVE_PACKED => {
            store_packed(bus, addr, d0);
            return true;
        }
        _ => return false,
    };
    regs.v[0] = result.to_bits();
    true
}

/// 96-bit extended precision to double. The extra mantissa bits are
/// truncated; values outside the double range saturate.
fn load_extended(bus: &mut dyn BusBackend, addr: u32) -> f64 {
    let se = bus.read_16(addr);
    let mantissa = ((bus.read_32(addr + 4) as u64) << 32) | bus.read_32(addr + 8) as u64;
    let sign = se & 0x8000 != 0;
    let exp = (se & 0x7fff) as i32;

    if exp == 0 && mantissa == 0 {
        return if sign { -0.0 } else { 0.0 };
    }
    if exp == 0x7fff {
        return if mantissa << 1 == 0 {
            if sign { f64::NEG_INFINITY } else { f64::INFINITY }
        } else {
            f64::NAN
        };
    }

    let e2 = exp - 16383 + 1023;
    if e2 <= 0 {
        return if sign { -0.0 } else { 0.0 };
    }
    if e2 >= 0x7ff {
        return if sign { f64::NEG_INFINITY } else { f64::INFINITY };
    }
    // Drop the explicit integer bit, keep the top 52 fraction bits.
    let frac = (mantissa << 1) >> 12;
    let bits = ((sign as u64) << 63) | ((e2 as u64) << 52) | frac;
    f64::from_bits(bits)
}

fn store_extended(bus: &mut dyn BusBackend, addr: u32, value: f64) {
    let bits = value.to_bits();
    let sign = (bits >> 63) as u16;
    let exp = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & ((1u64 << 52) - 1);

    let (se, mantissa) = if exp == 0 && frac == 0 {
        (sign << 15, 0u64)
    } else if exp == 0x7ff {
        (sign << 15 | 0x7fff, if frac == 0 { 1u64 << 63 } else { !0 })
    } else {
        let e2 = (exp - 1023 + 16383) as u16;
        ((sign << 15) | e2, (1u64 << 63) | (frac << 11))
    };

    bus.write_16(addr, se);
    bus.write_16(addr + 2, 0);
    bus.write_32(addr + 4, (mantissa >> 32) as u32);
    bus.write_32(addr + 8, mantissa as u32);
}

/// Packed decimal real to double (sign, 3-digit exponent, 17 digits).
fn load_packed(bus: &mut dyn BusBackend, addr: u32) -> f64 {
    let head = bus.read_32(addr);
    let m_hi = bus.read_32(addr + 4) as u64;
    let m_lo = bus.read_32(addr + 8) as u64;

    let sign = head & 0x8000_0000 != 0;
    let exp_sign = head & 0x4000_0000 != 0;
    let mut exp = 0i32;
    for shift in [24, 20, 16] {
        exp = exp * 10 + ((head >> shift) & 0xf) as i32;
    }
    let mut mantissa = (head & 0xf) as f64;
    let digits = (m_hi << 32) | m_lo;
    let mut scale = 0.1;
    for i in (0..16).rev() {
        let digit = ((digits >> (i * 4)) & 0xf) as f64;
        mantissa += digit * scale;
        scale /= 10.0;
    }
    let exp = if exp_sign { -exp } else { exp };
    let value = mantissa * 10f64.powi(exp);
    if sign { -value } else { value }
}

fn store_packed(bus: &mut dyn BusBackend, addr: u32, value: f64) {
    let sign = value.is_sign_negative();
    let v = value.abs();
    let exp = if v == 0.0 { 0 } else { v.log10().floor() as i32 };
    let mantissa = if v == 0.0 { 0.0 } else { v / 10f64.powi(exp) };

    let mut head = (sign as u32) << 31;
    let e = exp.unsigned_abs();
    if exp < 0 {
        head |= 0x4000_0000;
    }
    head |= (e / 100 % 10) << 24 | (e / 10 % 10) << 20 | (e % 10) << 16;
    head |= (mantissa as u32) & 0xf;

    let mut digits: u64 = 0;
    let mut rest = mantissa.fract();
    for i in (0..16).rev() {
        rest *= 10.0;
        let d = rest.trunc() as u64 & 0xf;
        rest = rest.fract();
        digits |= d << (i * 4);
    }
    bus.write_32(addr, head);
    bus.write_32(addr + 4, (digits >> 32) as u32);
    bus.write_32(addr + 8, digits as u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ShadowRam;
    use crate::emit::a64;

    fn setup() -> (HostRegs, ShadowRam) {
        (HostRegs::default(), ShadowRam::new(0, 0x10000))
    }

    #[test]
    fn ldrh_unsigned_offset_loads_memory_image() {
        let (mut regs, mut ram) = setup();
        ram.write_16(0x1204, 0xBEEF);
        regs.x[5] = 0x1200;
        let op = a64::ldrh_uoff(3, 5, 4);
        let addr = handle_read_fault(op, &mut regs, 0x1204, &mut ram).unwrap();
        assert_eq!(addr, 0x1204);
        // The register receives exactly what a host LDRH of the
        // big-endian bytes would have loaded; the byte-reverse that
        // follows in the translated stream restores the value.
        assert_eq!(regs.x[3], 0xEFBE);
    }

    #[test]
    fn post_index_load_writes_back_base() {
        let (mut regs, mut ram) = setup();
        ram.write_32(0x2000, 0x1122_3344);
        regs.x[2] = 0x2000;
        let op = a64::ldr_post(0, 2, 4);
        handle_read_fault(op, &mut regs, 0x2000, &mut ram).unwrap();
        assert_eq!(regs.x[0], 0x4433_2211); // memory image
        assert_eq!(regs.x[2], 0x2004);
    }

    #[test]
    fn pre_index_store_offsets_before_access() {
        let (mut regs, mut ram) = setup();
        regs.x[2] = 0x2004;
        regs.x[1] = 0xFECA; // image of 0xCAFE
        let op = a64::strh_pre(1, 2, -4);
        let addr = handle_write_fault(op, &mut regs, 0x2000, &mut ram).unwrap();
        assert_eq!(addr, 0x2000);
        assert_eq!(ram.read_16(0x2000), 0xCAFE);
        assert_eq!(regs.x[2], 0x2000);
    }

    #[test]
    fn register_offset_with_uxtw_and_scale() {
        let (mut regs, mut ram) = setup();
        ram.write_32(0x3010, 0xDEAD_BEEF);
        regs.x[1] = 0x3000;
        regs.x[2] = 0xffff_ffff_0000_0004; // high bits must be ignored
        let op = a64::ldr_roff(0, 1, 2, a64::Extend::Uxtw, true);
        let addr = handle_read_fault(op, &mut regs, 0x3010, &mut ram).unwrap();
        assert_eq!(addr, 0x3010);
        assert_eq!(regs.x[0], 0xEFBE_ADDE); // memory image
    }

    #[test]
    fn signed_load_sign_extends() {
        let (mut regs, mut ram) = setup();
        ram.write_16(0x1000, 0x0180); // image 0x8001: sign bit set
        regs.x[4] = 0x1000;
        let op = a64::ldrsh_uoff(0, 4, 0);
        handle_read_fault(op, &mut regs, 0x1000, &mut ram).unwrap();
        assert_eq!(regs.x[0] as u32, 0xffff_8001);
    }

    #[test]
    fn ldp_32_unpacks_both_registers() {
        let (mut regs, mut ram) = setup();
        ram.write_32(0x4000, 0x1111_1111);
        ram.write_32(0x4004, 0x2222_2222);
        regs.x[9] = 0x4000;
        let op = a64::ldp(0, 1, 9, 0);
        handle_read_fault(op, &mut regs, 0x4000, &mut ram).unwrap();
        // Byte-symmetric values: image equals value here, but each
        // destination must get its own element.
        assert_eq!(regs.x[0], 0x1111_1111);
        assert_eq!(regs.x[1], 0x2222_2222);
    }

    #[test]
    fn stxr_reports_success() {
        let (mut regs, mut ram) = setup();
        regs.x[0] = 0xDDCC_BBAA; // image of 0xAABBCCDD
        regs.x[1] = 0x5000;
        regs.x[2] = 0xff; // status register, must become 0
        let op = a64::stxr(2, 0, 1);
        handle_write_fault(op, &mut regs, 0x5000, &mut ram).unwrap();
        assert_eq!(ram.read_32(0x5000), 0xAABB_CCDD);
        assert_eq!(regs.x[2], 0);
    }

    #[test]
    fn address_mismatch_uses_recomputed() {
        let (mut regs, mut ram) = setup();
        ram.write_16(0x1200, 0x5678);
        regs.x[5] = 0x1200;
        let op = a64::ldrh_uoff(3, 5, 0);
        // Report a bogus FAR; the handler must trust base+offset.
        let addr = handle_read_fault(op, &mut regs, 0x9999, &mut ram).unwrap();
        assert_eq!(addr, 0x1200);
        assert_eq!(regs.x[3], 0x7856);
    }

    #[test]
    fn unknown_encoding_is_an_error() {
        let (mut regs, mut ram) = setup();
        let err = handle_read_fault(a64::nop(), &mut regs, 0, &mut ram);
        assert!(matches!(err, Err(CoreError::UnhandledFault { .. })));
    }

    #[test]
    fn extended_format_round_trips() {
        let (_, mut ram) = setup();
        for v in [0.0f64, 1.0, -1.5, 3.141592653589793, 1e100, -2.5e-70] {
            store_extended(&mut ram, 0x100, v);
            let back = load_extended(&mut ram, 0x100);
            assert_eq!(back, v, "extended round trip of {v}");
        }
    }

    #[test]
    fn fp_helper_trap_computes_into_d0() {
        let (mut regs, mut ram) = setup();
        regs.v[0] = 2.0f64.to_bits();
        assert!(handle_fp_trap(fptrap::BASE | fptrap::ETOX, &mut regs, &mut ram));
        let r = f64::from_bits(regs.v[0]);
        assert!((r - 2.0f64.exp()).abs() < 1e-12);
    }
}
