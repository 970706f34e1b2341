//! Single-bit operations, MOVEP, the 68020 bitfield group, and BCD
//! arithmetic.

use crate::emit::a64::{self, Shift};
use crate::emit::hostreg;
use crate::error::CoreError;
use crate::jit::flags::{FLAG_C, FLAG_NZVC, FLAG_V, FLAG_Z};

use super::ea::AddressingMode;
use super::{HB_Z, OpSize, Operand, Outcome, TranslatorContext};

/// BTST/BCHG/BCLR/BSET with a static or dynamic bit number.
pub(super) fn translate_bitop(
    ctx: &mut TranslatorContext,
    op: u16,
    static_num: bool,
) -> Result<Outcome, CoreError> {
    let kind = (op >> 6) & 3; // 0 tst, 1 chg, 2 clr, 3 set
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    // On a data register the operand is 32 bits wide, on memory one
    // byte.
    let size = if mode.is_register_direct() {
        OpSize::Long
    } else {
        OpSize::Byte
    };
    let modulus = size.bits() - 1;

    let num = ctx.alloc_temp()?;
    if static_num {
        let imm = ctx.read_ext_word() & modulus as u16;
        ctx.emit(a64::movz(num, imm, 0));
    } else {
        let dn = hostreg::d(((op >> 9) & 7) as u8);
        ctx.emit(a64::and_imm(num, dn, modulus as u32));
    }

    let dst = ctx.resolve_ea(mode, size)?;
    let v = ctx.emit_load_value(dst, size)?;

    // Z = tested bit, inverted, captured before the modification.
    if needed & FLAG_Z != 0 {
        let cc = ctx.modify_cc()?;
        let bit = ctx.alloc_temp()?;
        ctx.emit(a64::lsrv(bit, v, num));
        ctx.emit(a64::eor_imm(bit, bit, 1));
        ctx.emit(a64::bfi(cc, bit, HB_Z, 1));
        ctx.regs.free_temp(bit);
    }

    if kind != 0 {
        let mask = ctx.alloc_temp()?;
        ctx.emit(a64::movz(mask, 1, 0));
        ctx.emit(a64::lslv(mask, mask, num));
        match kind {
            1 => ctx.emit(a64::eor_reg(v, v, mask, Shift::Lsl, 0)),
            2 => ctx.emit(a64::bic_reg(v, v, mask, Shift::Lsl, 0)),
            _ => ctx.emit(a64::orr_reg(v, v, mask, Shift::Lsl, 0)),
        }
        ctx.regs.free_temp(mask);
        ctx.emit_store_result(dst, v, size)?;
    }

    ctx.regs.free_temp(v);
    ctx.free_operand(dst);
    ctx.regs.free_temp(num);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// MOVEP: byte lanes to or from alternating addresses.
pub(super) fn translate_movep(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let dx = ((op >> 9) & 7) as u8;
    let ay = (op & 7) as u8;
    let opmode = (op >> 6) & 7;
    let long = opmode & 1 != 0;
    let to_memory = opmode & 2 != 0;
    let d16 = ctx.read_ext_word() as i16 as i32;

    let addr = ctx.alloc_temp()?;
    ctx.emit_add_const(addr, hostreg::a(ay), d16)?;

    let count: u32 = if long { 4 } else { 2 };
    let dreg = hostreg::d(dx);
    let t = ctx.alloc_temp()?;

    if to_memory {
        for i in 0..count {
            let shift = 8 * (count - 1 - i) as u8;
            if shift == 0 {
                ctx.emit(a64::strb_uoff(dreg, addr, 2 * i));
            } else {
                ctx.emit(a64::lsr_imm(t, dreg, shift));
                ctx.emit(a64::strb_uoff(t, addr, 2 * i));
            }
        }
    } else {
        let acc = ctx.alloc_temp()?;
        ctx.emit(a64::movz(acc, 0, 0));
        for i in 0..count {
            ctx.emit(a64::ldrb_uoff(t, addr, 2 * i));
            ctx.emit(a64::orr_reg(acc, t, acc, Shift::Lsl, 8));
        }
        if long {
            ctx.emit(a64::mov_reg(dreg, acc));
        } else {
            ctx.emit(a64::bfi(dreg, acc, 0, 16));
        }
        ctx.regs.free_temp(acc);
    }

    ctx.regs.free_temp(t);
    ctx.regs.free_temp(addr);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

// ---------------------------------------------------------------------------
// 68020 bitfields
// ---------------------------------------------------------------------------

/// Decode the offset/width specifiers of a bitfield extension word
/// into transient registers. Offset is left unreduced for memory
/// operands (the caller splits byte/bit parts).
struct FieldSpec {
    /// Bit offset; for register operands taken modulo 32.
    offset: u8,
    /// Field width register, 1..=32.
    width: u8,
}

fn field_spec(ctx: &mut TranslatorContext, ext: u16) -> Result<FieldSpec, CoreError> {
    let offset = ctx.alloc_temp()?;
    if ext & 0x0800 != 0 {
        ctx.emit(a64::mov_reg(offset, hostreg::d(((ext >> 6) & 7) as u8)));
    } else {
        ctx.emit(a64::movz(offset, (ext >> 6) & 0x1f, 0));
    }
    let width = ctx.alloc_temp()?;
    if ext & 0x0020 != 0 {
        // Width from register, modulo 32 with 0 meaning 32.
        ctx.emit(a64::and_imm(width, hostreg::d((ext & 7) as u8), 31));
    } else {
        let w = ext & 0x1f;
        ctx.emit(a64::movz(width, w, 0));
    }
    // 0 encodes 32.
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::movz(t, 32, 0));
    ctx.emit(a64::cmp_imm(width, 0));
    ctx.emit(a64::csel(width, t, width, a64::cc::EQ));
    ctx.regs.free_temp(t);
    Ok(FieldSpec { offset, width })
}

/// Bitfield group dispatcher (line E, 0xE8C0..0xEFFF).
pub(super) fn translate_bitfield(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let kind = (op >> 8) & 7; // 0 TST 1 EXTU 2 CHG 3 EXTS 4 CLR 5 FFO 6 SET 7 INS
    let ext = ctx.read_ext_word();
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();
    let dreg = ((ext >> 12) & 7) as u8;

    let spec = field_spec(ctx, ext)?;

    // Fetch the field container into a 64-bit scratch, left-aligned on
    // the first field bit: for registers the register itself shifted
    // up, for memory an 8-byte big-endian window starting at the byte
    // holding that bit.
    let container = ctx.alloc_temp()?;
    let mem_addr = match mode {
        AddressingMode::DataDirect(n) => {
            ctx.emit(a64::and_imm(spec.offset, spec.offset, 31));
            ctx.emit(a64::rorv(container, hostreg::d(n), spec.offset));
            ctx.emit(a64::lsl_imm_64(container, container, 32));
            None
        }
        _ => {
            let dst = ctx.resolve_ea(mode, OpSize::Byte)?;
            let Operand::Mem { reg: base, .. } = dst else {
                return Err(CoreError::TranslatorBug("bitfield operand"));
            };
            let byteoff = ctx.alloc_temp()?;
            ctx.emit(a64::asr_imm(byteoff, spec.offset, 3));
            let addr = ctx.alloc_temp()?;
            ctx.emit(a64::add_reg(addr, base, byteoff, Shift::Lsl, 0));
            ctx.regs.free_temp(byteoff);
            ctx.emit(a64::and_imm(spec.offset, spec.offset, 7));
            ctx.free_operand(dst);
            ctx.emit(a64::ldr64_uoff(container, addr, 0));
            ctx.emit(a64::rev_64(container, container));
            ctx.emit(a64::lslv_64(container, container, spec.offset));
            Some(addr)
        }
    };

    // inv = 64 - width, the right-shift that brings the left-aligned
    // field down to bit 0.
    let inv = ctx.alloc_temp()?;
    ctx.emit(a64::movz(inv, 64, 0));
    ctx.emit(a64::sub_reg(inv, inv, spec.width, Shift::Lsl, 0));

    // Left-aligned mask: `width` ones at the top of the 64-bit view.
    let mask = ctx.alloc_temp()?;
    {
        let wm1 = ctx.alloc_temp()?;
        ctx.emit(a64::movz(mask, 1, 0));
        ctx.emit(a64::lsl_imm_64(mask, mask, 63));
        ctx.emit(a64::sub_imm(wm1, spec.width, 1));
        ctx.emit(a64::asrv_64(mask, mask, wm1));
        ctx.regs.free_temp(wm1);
    }

    let field = ctx.alloc_temp()?;
    ctx.emit(a64::lsrv_64(field, container, inv));

    // Flags come from the addressed field (or, for BFINS, from the
    // inserted value, handled below). N is the field's top bit, Z its
    // emptiness, V and C clear.
    if kind != 7 && needed & FLAG_NZVC != 0 {
        let msb = ctx.alloc_temp()?;
        ctx.emit(a64::sub_imm(msb, spec.width, 1));
        ctx.emit(a64::lsrv_64(msb, field, msb));
        let cc = ctx.modify_cc()?;
        ctx.emit(a64::bfi(cc, msb, super::HB_N, 1));
        ctx.emit(a64::cmp_imm(field, 0));
        ctx.emit_flag_update(needed & FLAG_Z, false)?;
        ctx.emit_flag_clear(needed & (FLAG_V | FLAG_C))?;
        ctx.regs.free_temp(msb);
    }

    let mut modified = false;
    match kind {
        0 => {} // BFTST
        1 | 3 => {
            // BFEXTU/BFEXTS into Dn.
            if kind == 3 {
                ctx.emit(a64::lslv_64(field, field, inv));
                ctx.emit(a64::asrv_64(field, field, inv));
            }
            ctx.emit(a64::mov_reg(hostreg::d(dreg), field));
        }
        5 => {
            // BFFFO: bit offset of the first set bit, scanning from the
            // top of the field; the width when the field is empty.
            let zeros = ctx.alloc_temp()?;
            ctx.emit(a64::lsr_imm_64(zeros, container, 32));
            ctx.emit(a64::clz(zeros, zeros));
            ctx.emit(a64::cmp_reg(zeros, spec.width));
            ctx.emit(a64::csel(zeros, spec.width, zeros, a64::cc::HI));
            ctx.emit(a64::add_reg(zeros, zeros, spec.offset, Shift::Lsl, 0));
            ctx.emit(a64::mov_reg(hostreg::d(dreg), zeros));
            ctx.regs.free_temp(zeros);
        }
        2 | 4 | 6 => {
            match kind {
                2 => ctx.emit(a64::eor_reg_64(container, container, mask, Shift::Lsl, 0)),
                4 => ctx.emit(a64::bic_reg(container, container, mask, Shift::Lsl, 0) | 0x8000_0000),
                _ => ctx.emit(a64::orr_reg_64(container, container, mask, Shift::Lsl, 0)),
            }
            modified = true;
        }
        7 => {
            // BFINS: insert Dn's low `width` bits; flags reflect the
            // inserted field.
            let ins = ctx.alloc_temp()?;
            ctx.emit(a64::mov_reg(ins, hostreg::d(dreg)));
            ctx.emit(a64::lslv_64(ins, ins, inv));
            ctx.emit(a64::and_reg_64(ins, ins, mask, Shift::Lsl, 0));
            if needed & FLAG_NZVC != 0 {
                let msb = ctx.alloc_temp()?;
                ctx.emit(a64::lsr_imm_64(msb, ins, 63));
                let cc = ctx.modify_cc()?;
                ctx.emit(a64::bfi(cc, msb, super::HB_N, 1));
                ctx.emit(a64::cmp_imm_64(ins, 0));
                ctx.emit_flag_update(needed & FLAG_Z, false)?;
                ctx.emit_flag_clear(needed & (FLAG_V | FLAG_C))?;
                ctx.regs.free_temp(msb);
            }
            ctx.emit(a64::bic_reg_64(container, container, mask, Shift::Lsl, 0));
            ctx.emit(a64::orr_reg_64(container, container, ins, Shift::Lsl, 0));
            ctx.regs.free_temp(ins);
            modified = true;
        }
        _ => unreachable!(),
    }

    if modified {
        match mem_addr {
            None => {
                if let AddressingMode::DataDirect(n) = mode {
                    // Rotate the container back into register position.
                    ctx.emit(a64::lsr_imm_64(container, container, 32));
                    let back = ctx.alloc_temp()?;
                    ctx.emit(a64::movz(back, 32, 0));
                    ctx.emit(a64::sub_reg(back, back, spec.offset, Shift::Lsl, 0));
                    ctx.emit(a64::and_imm(back, back, 31));
                    ctx.emit(a64::rorv(container, container, back));
                    ctx.emit(a64::mov_reg(hostreg::d(n), container));
                    ctx.regs.free_temp(back);
                }
            }
            Some(addr) => {
                ctx.emit(a64::lsrv_64(container, container, spec.offset));
                ctx.emit(a64::rev_64(container, container));
                ctx.emit(a64::str64_uoff(container, addr, 0));
            }
        }
    }

    if let Some(addr) = mem_addr {
        ctx.regs.free_temp(addr);
    }
    ctx.regs.free_temp(field);
    ctx.regs.free_temp(mask);
    ctx.regs.free_temp(inv);
    ctx.regs.free_temp(container);
    ctx.regs.free_temp(spec.width);
    ctx.regs.free_temp(spec.offset);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

// ---------------------------------------------------------------------------
// BCD
// ---------------------------------------------------------------------------

fn bcd_operands(
    ctx: &mut TranslatorContext,
    op: u16,
) -> Result<(Operand, Operand), CoreError> {
    let rx = ((op >> 9) & 7) as u8;
    let ry = (op & 7) as u8;
    if op & 0x08 != 0 {
        let s = ctx.resolve_ea(AddressingMode::PreDecrement(ry), OpSize::Byte)?;
        let d = ctx.resolve_ea(AddressingMode::PreDecrement(rx), OpSize::Byte)?;
        Ok((d, s))
    } else {
        Ok((Operand::DataReg(rx), Operand::DataReg(ry)))
    }
}

/// Decimal-adjusted add with extend.
pub(super) fn translate_abcd(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let (dst, src) = bcd_operands(ctx, op)?;
    let d = ctx.emit_load_value(dst, OpSize::Byte)?;
    let s = ctx.emit_load_value(src, OpSize::Byte)?;
    let cc = ctx.modify_cc()?;
    let x = ctx.alloc_temp()?;
    ctx.emit(a64::ubfx(x, cc, super::HB_X, 1));

    // Low-nibble sum decides the +6 correction.
    let lo = ctx.alloc_temp()?;
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::and_imm(lo, d, 0x0f));
    ctx.emit(a64::and_imm(t, s, 0x0f));
    ctx.emit(a64::add_reg(lo, lo, t, Shift::Lsl, 0));
    ctx.emit(a64::add_reg(lo, lo, x, Shift::Lsl, 0));

    // Binary sum.
    let res = ctx.alloc_temp()?;
    ctx.emit(a64::add_reg(res, d, s, Shift::Lsl, 0));
    ctx.emit(a64::add_reg(res, res, x, Shift::Lsl, 0));

    ctx.emit(a64::cmp_imm(lo, 9));
    ctx.emit(a64::add_imm(t, res, 6));
    ctx.emit(a64::csel(res, t, res, a64::cc::HI));

    // Decimal carry out of the high nibble.
    ctx.emit(a64::cmp_imm(res, 0x99));
    ctx.emit(a64::sub_imm(t, res, 0xa0));
    ctx.emit(a64::csel(res, t, res, a64::cc::HI));
    ctx.emit(a64::cset(t, a64::cc::HI));

    // X = C = decimal carry; Z accumulates; N from the result.
    ctx.emit(a64::bfi(cc, t, super::HB_C, 1));
    ctx.emit(a64::bfi(cc, t, super::HB_X, 1));
    ctx.emit(a64::and_imm(res, res, 0xff));
    emit_bcd_nz(ctx, cc, res, t)?;

    ctx.emit_store_result(dst, res, OpSize::Byte)?;
    ctx.regs.free_temp(res);
    ctx.regs.free_temp(t);
    ctx.regs.free_temp(lo);
    ctx.regs.free_temp(x);
    ctx.regs.free_temp(s);
    ctx.regs.free_temp(d);
    ctx.free_operand(src);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// Decimal-adjusted subtract with extend; also the body of NBCD (with
/// a zero minuend).
fn emit_sbcd(ctx: &mut TranslatorContext, d: u8, s: u8) -> Result<u8, CoreError> {
    let cc = ctx.modify_cc()?;
    let x = ctx.alloc_temp()?;
    ctx.emit(a64::ubfx(x, cc, super::HB_X, 1));

    let lo = ctx.alloc_temp()?;
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::and_imm(lo, d, 0x0f));
    ctx.emit(a64::and_imm(t, s, 0x0f));
    ctx.emit(a64::sub_reg(lo, lo, t, Shift::Lsl, 0));
    ctx.emit(a64::sub_reg(lo, lo, x, Shift::Lsl, 0));

    let res = ctx.alloc_temp()?;
    ctx.emit(a64::sub_reg(res, d, s, Shift::Lsl, 0));
    ctx.emit(a64::sub_reg(res, res, x, Shift::Lsl, 0));

    // Half borrow: low nibble went negative.
    ctx.emit(a64::cmp_imm(lo, 0));
    ctx.emit(a64::sub_imm(t, res, 6));
    ctx.emit(a64::csel(res, t, res, a64::cc::LT));

    // Full borrow.
    ctx.emit(a64::cmp_imm(res, 0));
    ctx.emit(a64::sub_imm(t, res, 0x60));
    ctx.emit(a64::csel(res, t, res, a64::cc::LT));
    ctx.emit(a64::cset(t, a64::cc::LT));

    ctx.emit(a64::bfi(cc, t, super::HB_C, 1));
    ctx.emit(a64::bfi(cc, t, super::HB_X, 1));
    ctx.emit(a64::and_imm(res, res, 0xff));
    emit_bcd_nz(ctx, cc, res, t)?;

    ctx.regs.free_temp(t);
    ctx.regs.free_temp(lo);
    ctx.regs.free_temp(x);
    Ok(res)
}

pub(super) fn translate_sbcd(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let (dst, src) = bcd_operands(ctx, op)?;
    let d = ctx.emit_load_value(dst, OpSize::Byte)?;
    let s = ctx.emit_load_value(src, OpSize::Byte)?;
    let res = emit_sbcd(ctx, d, s)?;
    ctx.emit_store_result(dst, res, OpSize::Byte)?;
    ctx.regs.free_temp(res);
    ctx.regs.free_temp(s);
    ctx.regs.free_temp(d);
    ctx.free_operand(src);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// NBCD <ea>: decimal negate (0 - dst - X).
pub(super) fn translate_nbcd(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let dst = ctx.resolve_ea(mode, OpSize::Byte)?;
    let v = ctx.emit_load_value(dst, OpSize::Byte)?;
    let zero = ctx.alloc_temp()?;
    ctx.emit(a64::movz(zero, 0, 0));
    let res = emit_sbcd(ctx, zero, v)?;
    ctx.emit_store_result(dst, res, OpSize::Byte)?;
    ctx.regs.free_temp(res);
    ctx.regs.free_temp(zero);
    ctx.regs.free_temp(v);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// N from bit 7, Z accumulating, V cleared. Shared by the BCD ops.
fn emit_bcd_nz(
    ctx: &mut TranslatorContext,
    cc: u8,
    res: u8,
    scratch: u8,
) -> Result<(), CoreError> {
    ctx.emit(a64::ubfx(scratch, res, 7, 1));
    ctx.emit(a64::bfi(cc, scratch, super::HB_N, 1));
    // Z &= (res == 0)
    ctx.emit(a64::cmp_imm(res, 0));
    ctx.emit(a64::cset(scratch, a64::cc::EQ));
    let old = ctx.alloc_temp()?;
    ctx.emit(a64::ubfx(old, cc, HB_Z, 1));
    ctx.emit(a64::and_reg(scratch, scratch, old, Shift::Lsl, 0));
    ctx.emit(a64::bfi(cc, scratch, HB_Z, 1));
    ctx.regs.free_temp(old);
    ctx.emit(a64::bic_imm(cc, cc, 1 << super::HB_V));
    Ok(())
}
