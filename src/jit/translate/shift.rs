//! Shifts and rotates, plain and through the extend bit.
//!
//! The sized value is widened into a 64-bit view so shift counts up to
//! 63 (the register form operates modulo 64) fall out of the host
//! shifter without special cases; the carry is recovered from the
//! neighbouring bit positions of the wide result.

use crate::emit::a64::{self, Shift};
use crate::emit::hostreg;
use crate::error::CoreError;
use crate::jit::flags::{FLAG_C, FLAG_N, FLAG_V, FLAG_X, FLAG_Z};

use super::ea::AddressingMode;
use super::{HB_C, HB_N, HB_V, HB_X, HB_Z, OpSize, Operand, Outcome, TranslatorContext, bits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShiftKind {
    Arithmetic,
    Logical,
    RotateX,
    Rotate,
}

pub(super) fn translate_linee(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    if (op & 0x08c0) == 0x08c0 {
        return bits::translate_bitfield(ctx, op);
    }
    if (op & 0x00c0) == 0x00c0 {
        return translate_memory_shift(ctx, op);
    }
    translate_register_shift(ctx, op)
}

fn kind_of(bits2: u16) -> ShiftKind {
    match bits2 & 3 {
        0 => ShiftKind::Arithmetic,
        1 => ShiftKind::Logical,
        2 => ShiftKind::RotateX,
        _ => ShiftKind::Rotate,
    }
}

fn translate_register_shift(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let kind = kind_of(op >> 3);
    let left = op & 0x0100 != 0;
    let size = OpSize::from_bits(op >> 6).ok_or(CoreError::TranslatorBug("shift size"))?;
    let reg = (op & 7) as u8;
    let needed = ctx.flags_needed();

    let cnt = ctx.alloc_temp()?;
    if op & 0x0020 != 0 {
        // Count from a data register, modulo 64.
        ctx.emit(a64::and_imm(cnt, hostreg::d(((op >> 9) & 7) as u8), 63));
    } else {
        let mut imm = (op >> 9) & 7;
        if imm == 0 {
            imm = 8;
        }
        ctx.emit(a64::movz(cnt, imm, 0));
    }

    let v = ctx.emit_load_value(Operand::DataReg(reg), size)?;
    let res = emit_shift(ctx, kind, left, size, v, cnt, needed)?;
    ctx.emit_store_dreg(reg, res, size);
    ctx.regs.free_temp(res);
    ctx.regs.free_temp(v);
    ctx.regs.free_temp(cnt);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// Memory form: word operand, single-bit shift.
fn translate_memory_shift(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let kind = kind_of(op >> 9);
    let left = op & 0x0100 != 0;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let dst = ctx.resolve_ea(mode, OpSize::Word)?;
    let v = ctx.emit_load_value(dst, OpSize::Word)?;
    let cnt = ctx.alloc_temp()?;
    ctx.emit(a64::movz(cnt, 1, 0));
    let res = emit_shift(ctx, kind, left, OpSize::Word, v, cnt, needed)?;
    ctx.emit_store_result(dst, res, OpSize::Word)?;
    ctx.regs.free_temp(res);
    ctx.regs.free_temp(cnt);
    ctx.regs.free_temp(v);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// The common shifter. `v` holds the zero-extended sized value, `cnt`
/// the count (0..63). Returns a fresh transient with the sized result
/// and updates the requested flags.
fn emit_shift(
    ctx: &mut TranslatorContext,
    kind: ShiftKind,
    left: bool,
    size: OpSize,
    v: u8,
    cnt: u8,
    needed: u8,
) -> Result<u8, CoreError> {
    match kind {
        ShiftKind::Rotate => emit_rotate(ctx, left, size, v, cnt, needed),
        ShiftKind::RotateX => emit_rotate_x(ctx, left, size, v, cnt, needed),
        _ => emit_plain_shift(ctx, kind, left, size, v, cnt, needed),
    }
}

fn emit_plain_shift(
    ctx: &mut TranslatorContext,
    kind: ShiftKind,
    left: bool,
    size: OpSize,
    v: u8,
    cnt: u8,
    needed: u8,
) -> Result<u8, CoreError> {
    let width = size.bits();
    let res = ctx.alloc_temp()?;
    let wide = ctx.alloc_temp()?;
    let c = ctx.alloc_temp()?;

    if kind == ShiftKind::Arithmetic && !left {
        // ASR works on the sign-extended 64-bit view.
        match size {
            OpSize::Byte => {
                ctx.emit(a64::sxtb(wide, v));
                ctx.emit(a64::sxtw_64(wide, wide));
            }
            OpSize::Word => {
                ctx.emit(a64::sxth(wide, v));
                ctx.emit(a64::sxtw_64(wide, wide));
            }
            OpSize::Long => ctx.emit(a64::sxtw_64(wide, v)),
        }
    } else {
        ctx.emit(a64::mov_reg(wide, v)); // zero-extended
    }

    if left {
        ctx.emit(a64::lslv_64(res, wide, cnt));
        // Carry is the first bit pushed past the top of the operand.
        ctx.emit(a64::lsr_imm_64(c, res, width));
        ctx.emit(a64::and_imm(c, c, 1));
    } else {
        if kind == ShiftKind::Arithmetic {
            ctx.emit(a64::asrv_64(res, wide, cnt));
        } else {
            ctx.emit(a64::lsrv_64(res, wide, cnt));
        }
        // Carry is the last bit shifted out: bit (cnt-1). A zero count
        // turns into a shift by 63, which reads as zero for the
        // logical form and is corrected below for the arithmetic one.
        ctx.emit(a64::sub_imm(c, cnt, 1));
        ctx.emit(a64::and_imm(c, c, 63));
        if kind == ShiftKind::Arithmetic {
            ctx.emit(a64::asrv_64(c, wide, c));
        } else {
            ctx.emit(a64::lsrv_64(c, wide, c));
        }
        ctx.emit(a64::and_imm(c, c, 1));
        if kind == ShiftKind::Arithmetic {
            ctx.emit(a64::cmp_imm(cnt, 0));
            ctx.emit(a64::csel(c, 31, c, a64::cc::EQ));
        }
    }

    if needed & (FLAG_C | FLAG_X) != 0 {
        let cc = ctx.modify_cc()?;
        if needed & FLAG_C != 0 {
            ctx.emit(a64::bfi(cc, c, HB_C, 1));
        }
        if needed & FLAG_X != 0 {
            // X keeps its value on a zero count.
            let x = ctx.alloc_temp()?;
            ctx.emit(a64::ubfx(x, cc, HB_X, 1));
            ctx.emit(a64::cmp_imm(cnt, 0));
            ctx.emit(a64::csel(x, x, c, a64::cc::EQ));
            ctx.emit(a64::bfi(cc, x, HB_X, 1));
            ctx.regs.free_temp(x);
        }
    }

    // Overflow: only ASL can overflow; the value fits iff the wide
    // result sign-extends back to itself.
    if needed & FLAG_V != 0 {
        let cc = ctx.modify_cc()?;
        if kind == ShiftKind::Arithmetic && left {
            let sext = ctx.alloc_temp()?;
            // Redo the shift on the sign-extended view for the check.
            match size {
                OpSize::Byte => {
                    ctx.emit(a64::sxtb(sext, v));
                    ctx.emit(a64::sxtw_64(sext, sext));
                }
                OpSize::Word => {
                    ctx.emit(a64::sxth(sext, v));
                    ctx.emit(a64::sxtw_64(sext, sext));
                }
                OpSize::Long => ctx.emit(a64::sxtw_64(sext, v)),
            }
            ctx.emit(a64::lslv_64(sext, sext, cnt));
            let back = ctx.alloc_temp()?;
            ctx.emit(a64::sbfx_64(back, sext, 0, width));
            ctx.emit(a64::cmp_reg_64(back, sext));
            let vb = ctx.alloc_temp()?;
            ctx.emit(a64::cset(vb, a64::cc::NE));
            ctx.emit(a64::bfi(cc, vb, HB_V, 1));
            ctx.regs.free_temp(vb);
            ctx.regs.free_temp(back);
            ctx.regs.free_temp(sext);
        } else {
            ctx.emit(a64::bic_imm(cc, cc, 1 << HB_V));
        }
    }

    // Mask the result to size and derive N/Z.
    match size {
        OpSize::Byte => ctx.emit(a64::uxtb(res, res)),
        OpSize::Word => ctx.emit(a64::uxth(res, res)),
        OpSize::Long => ctx.emit(a64::mov_reg(res, res)), // truncate the 64-bit view
    }
    emit_nz(ctx, res, width, needed)?;

    ctx.regs.free_temp(c);
    ctx.regs.free_temp(wide);
    Ok(res)
}

fn emit_rotate(
    ctx: &mut TranslatorContext,
    left: bool,
    size: OpSize,
    v: u8,
    cnt: u8,
    needed: u8,
) -> Result<u8, CoreError> {
    let width = size.bits();
    let res = ctx.alloc_temp()?;
    let m = ctx.alloc_temp()?;
    ctx.emit(a64::and_imm(m, cnt, (width - 1) as u32));
    if left {
        // Left by m is right by width - m (modulo width).
        let t = ctx.alloc_temp()?;
        ctx.emit(a64::movz(t, width as u16, 0));
        ctx.emit(a64::sub_reg(m, t, m, Shift::Lsl, 0));
        ctx.emit(a64::and_imm(m, m, (width - 1) as u32));
        ctx.regs.free_temp(t);
    }
    match size {
        OpSize::Long => ctx.emit(a64::rorv(res, v, m)),
        _ => {
            // Duplicate the value one lane up so a plain shift wraps.
            ctx.emit(a64::orr_reg(res, v, v, Shift::Lsl, width));
            ctx.emit(a64::lsrv(res, res, m));
            if size == OpSize::Byte {
                ctx.emit(a64::uxtb(res, res));
            } else {
                ctx.emit(a64::uxth(res, res));
            }
        }
    }
    ctx.regs.free_temp(m);

    if needed & FLAG_C != 0 {
        let cc = ctx.modify_cc()?;
        let c = ctx.alloc_temp()?;
        if left {
            ctx.emit(a64::and_imm(c, res, 1));
        } else {
            ctx.emit(a64::ubfx(c, res, (width - 1) as u8, 1));
        }
        // A zero count clears C.
        ctx.emit(a64::cmp_imm(cnt, 0));
        ctx.emit(a64::csel(c, 31, c, a64::cc::EQ));
        ctx.emit(a64::bfi(cc, c, HB_C, 1));
        ctx.regs.free_temp(c);
    }
    if needed & FLAG_V != 0 {
        let cc = ctx.modify_cc()?;
        ctx.emit(a64::bic_imm(cc, cc, 1 << HB_V));
    }
    emit_nz(ctx, res, width, needed)?;
    Ok(res)
}

fn emit_rotate_x(
    ctx: &mut TranslatorContext,
    left: bool,
    size: OpSize,
    v: u8,
    cnt: u8,
    needed: u8,
) -> Result<u8, CoreError> {
    let width = size.bits() as u32;
    let ext_bits = width + 1;
    let cc = ctx.modify_cc()?;

    // m = count modulo (width + 1).
    let m = ctx.alloc_temp()?;
    let mw = ctx.alloc_temp()?;
    ctx.emit(a64::movz(mw, ext_bits as u16, 0));
    ctx.emit(a64::udiv(m, cnt, mw));
    ctx.emit(a64::msub(m, m, mw, cnt));

    // Extended operand: X sits just above the value.
    let ext = ctx.alloc_temp()?;
    let x = ctx.alloc_temp()?;
    ctx.emit(a64::mov_reg(ext, v));
    ctx.emit(a64::ubfx(x, cc, HB_X, 1));
    ctx.emit(a64::bfi_64(ext, x, width as u8, 1));

    if left {
        // Left by m = right by (ext_bits - m) mod ext_bits.
        ctx.emit(a64::sub_reg(m, mw, m, Shift::Lsl, 0));
        ctx.emit(a64::cmp_reg(m, mw));
        ctx.emit(a64::csel(m, 31, m, a64::cc::EQ));
    }

    // Rotate right by m over ext_bits bits.
    let res = ctx.alloc_temp()?;
    let hi = ctx.alloc_temp()?;
    ctx.emit(a64::lsrv_64(res, ext, m));
    ctx.emit(a64::sub_reg(hi, mw, m, Shift::Lsl, 0));
    ctx.emit(a64::lslv_64(hi, ext, hi));
    ctx.emit(a64::orr_reg_64(res, res, hi, Shift::Lsl, 0));
    ctx.emit(a64::and_imm_64(res, res, (1u64 << ext_bits) - 1));
    ctx.regs.free_temp(hi);
    ctx.regs.free_temp(ext);

    // New X (and C, which always mirrors X for the extend rotates).
    ctx.emit(a64::ubfx_64(x, res, width as u8, 1));
    if needed & FLAG_X != 0 {
        ctx.emit(a64::bfi(cc, x, HB_X, 1));
    }
    if needed & FLAG_C != 0 {
        ctx.emit(a64::bfi(cc, x, HB_C, 1));
    }
    if needed & FLAG_V != 0 {
        ctx.emit(a64::bic_imm(cc, cc, 1 << HB_V));
    }
    ctx.regs.free_temp(x);
    ctx.regs.free_temp(mw);
    ctx.regs.free_temp(m);

    // Sized result.
    match size {
        OpSize::Byte => ctx.emit(a64::uxtb(res, res)),
        OpSize::Word => ctx.emit(a64::uxth(res, res)),
        OpSize::Long => ctx.emit(a64::mov_reg(res, res)),
    }
    emit_nz(ctx, res, width as u8, needed)?;
    Ok(res)
}

/// N and Z from the sized result, written straight into the packed CC.
fn emit_nz(ctx: &mut TranslatorContext, res: u8, width: u8, needed: u8) -> Result<(), CoreError> {
    if needed & (FLAG_N | FLAG_Z) == 0 {
        return Ok(());
    }
    let cc = ctx.modify_cc()?;
    let t = ctx.alloc_temp()?;
    if needed & FLAG_N != 0 {
        ctx.emit(a64::ubfx(t, res, width - 1, 1));
        ctx.emit(a64::bfi(cc, t, HB_N, 1));
    }
    if needed & FLAG_Z != 0 {
        ctx.emit(a64::cmp_imm(res, 0));
        ctx.emit(a64::cset(t, a64::cc::EQ));
        ctx.emit(a64::bfi(cc, t, HB_Z, 1));
    }
    ctx.regs.free_temp(t);
    Ok(())
}
