//! Logical operations, the immediate family, and the single-operand
//! data instructions of line 4.

use crate::emit::a64::{self, Shift, SysReg};
use crate::emit::{FixupKind, hostreg};
use crate::error::CoreError;
use crate::jit::flags::{FLAG_C, FLAG_N, FLAG_NZVC, FLAG_V, FLAG_X, FLAG_Z};
use crate::state::swap_cv;

use super::ea::AddressingMode;
use super::{HB_S, OpSize, Operand, Outcome, TranslatorContext, arith, bits, flow, host_mask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitwise {
    And,
    Or,
    Eor,
}

impl Bitwise {
    fn emit(self, ctx: &mut TranslatorContext, d: u8, s: u8) {
        match self {
            Bitwise::And => ctx.emit(a64::and_reg(d, d, s, Shift::Lsl, 0)),
            Bitwise::Or => ctx.emit(a64::orr_reg(d, d, s, Shift::Lsl, 0)),
            Bitwise::Eor => ctx.emit(a64::eor_reg(d, d, s, Shift::Lsl, 0)),
        }
    }
}

/// Line 0: immediate group, static bit ops, MOVEP, and the 68010+
/// oddballs that share the line.
pub(super) fn translate_line0(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    if op & 0x0100 != 0 {
        if (op & 0x0038) == 0x0008 {
            return bits::translate_movep(ctx, op);
        }
        return bits::translate_bitop(ctx, op, /*static_num=*/ false);
    }
    if (op & 0x0f00) == 0x0800 {
        return bits::translate_bitop(ctx, op, /*static_num=*/ true);
    }
    if (op & 0x0f00) == 0x0e00 {
        // MOVES needs the MMU-side function codes, which the bus does
        // not model.
        return flow::translate_unimplemented(ctx, op, flow::vector::ILLEGAL);
    }
    if (op & 0x00c0) == 0x00c0 {
        // CAS/CAS2/CMP2/CHK2 share the line with size field 0b11.
        return flow::translate_unimplemented(ctx, op, flow::vector::ILLEGAL);
    }

    let kind = (op >> 9) & 7;
    // ORI/ANDI/EORI to CCR or SR.
    if (op & 0x00ff) == 0x003c || (op & 0x00ff) == 0x007c {
        let bw = match kind {
            0 => Bitwise::Or,
            1 => Bitwise::And,
            5 => Bitwise::Eor,
            _ => return flow::translate_unimplemented(ctx, op, flow::vector::ILLEGAL),
        };
        return if op & 0x0040 != 0 {
            translate_imm_to_sr(ctx, bw)
        } else {
            translate_imm_to_ccr(ctx, bw)
        };
    }

    let size = OpSize::from_bits(op >> 6).ok_or(CoreError::TranslatorBug("immediate size"))?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let imm = match size {
        OpSize::Byte => (ctx.read_ext_word() & 0xff) as u32,
        OpSize::Word => ctx.read_ext_word() as u32,
        OpSize::Long => ctx.read_ext_long(),
    };

    let dst = ctx.resolve_ea(mode, size)?;
    let d = ctx.emit_load_value(dst, size)?;
    let s = ctx.alloc_temp()?;
    ctx.emit_all(a64::mov_imm32(s, imm & size.mask()));

    match kind {
        0 | 1 | 5 => {
            let bw = match kind {
                0 => Bitwise::Or,
                1 => Bitwise::And,
                _ => Bitwise::Eor,
            };
            bw.emit(ctx, d, s);
            ctx.emit_nz_from_value(d, size, needed & FLAG_NZVC)?;
            ctx.emit_store_result(dst, d, size)?;
        }
        2 => {
            // SUBI
            ctx.emit_alu_sized(arith::Alu::Sub, d, s, size);
            ctx.emit_flag_update(needed & (FLAG_NZVC | FLAG_X), true)?;
            ctx.emit_store_result(dst, d, size)?;
        }
        3 => {
            // ADDI
            ctx.emit_alu_sized(arith::Alu::Add, d, s, size);
            ctx.emit_flag_update(needed & (FLAG_NZVC | FLAG_X), false)?;
            ctx.emit_store_result(dst, d, size)?;
        }
        6 => {
            // CMPI
            ctx.emit_cmp_sized(d, s, size)?;
            ctx.emit_flag_update(needed & FLAG_NZVC, true)?;
        }
        _ => {
            ctx.regs.free_temp(s);
            ctx.regs.free_temp(d);
            ctx.free_operand(dst);
            return flow::translate_unimplemented(ctx, op, flow::vector::ILLEGAL);
        }
    }

    ctx.regs.free_temp(s);
    ctx.regs.free_temp(d);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// ORI/ANDI/EORI #imm,CCR: read-modify-write of the five flag bits,
/// with the immediate converted to the host flag order.
fn translate_imm_to_ccr(ctx: &mut TranslatorContext, bw: Bitwise) -> Result<Outcome, CoreError> {
    let imm = (ctx.read_ext_word() & 0x1f) as u16;
    let himm = host_mask(imm as u8);
    let cc = ctx.modify_cc()?;
    let t = ctx.alloc_temp()?;
    match bw {
        Bitwise::Or => ctx.emit_all(a64::mov_imm32(t, himm)),
        // Only the low five bits participate; everything above stays.
        Bitwise::And => ctx.emit_all(a64::mov_imm32(t, himm | !0x1fu32)),
        Bitwise::Eor => ctx.emit_all(a64::mov_imm32(t, himm)),
    }
    bw.emit(ctx, cc, t);
    ctx.regs.free_temp(t);
    // Careful: Bitwise::emit applied the op to `cc` with `t` as the
    // second operand, which is what we want.
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// ORI/ANDI/EORI #imm,SR. Privileged; may drop to user mode.
fn translate_imm_to_sr(ctx: &mut TranslatorContext, bw: Bitwise) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    let imm = ctx.read_ext_word();
    let himm = swap_cv(imm) as u32;

    emit_privilege_check(ctx, insn_pc)?;

    let cc = ctx.modify_cc()?;
    let old = ctx.alloc_temp()?;
    ctx.emit(a64::mov_reg(old, cc));
    let t = ctx.alloc_temp()?;
    let value = if bw == Bitwise::And { himm | 0xffff_0000 } else { himm };
    ctx.emit_all(a64::mov_imm32(t, value));
    bw.emit(ctx, cc, t);
    ctx.regs.free_temp(t);
    emit_sr_write_tail(ctx, old)?;
    ctx.regs.free_temp(old);

    // The mask or trace bits may have changed; resume through the
    // dispatcher.
    ctx.advance_insn_pc();
    ctx.flush_pc();
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// Emit the user-mode guard: in user mode the instruction must raise a
/// privilege violation instead of executing.
pub(super) fn emit_privilege_check(
    ctx: &mut TranslatorContext,
    insn_pc: u32,
) -> Result<(), CoreError> {
    let cc = ctx.get_cc()?;
    ctx.get_ctx_reg()?;
    let loc = ctx.body_len();
    ctx.emit(a64::tbz(cc, HB_S, 0));
    ctx.exit_stub(FixupKind::TestBranch, loc, |c| {
        flow::emit_exception(c, flow::vector::PRIVILEGE_VIOLATION, insn_pc)?;
        flow::emit_stub_exit(c)
    })
}

/// After a full SR write: if the supervisor bit was dropped, park the
/// active supervisor stack pointer and activate USP. `old` holds the
/// pre-write SR image.
pub(super) fn emit_sr_write_tail(ctx: &mut TranslatorContext, old: u8) -> Result<(), CoreError> {
    let cc = ctx.modify_cc()?;
    let ctxr = ctx.get_ctx_reg()?;
    let a7 = hostreg::A7;
    let base = ctx.body_len();
    // Layout (word offsets from `base`):
    //   0: tbnz cc,S  -> 6    still supervisor, nothing to do
    //   1: tbnz old,M -> 4
    //   2: str a7 -> ISP
    //   3: b -> 5
    //   4: str a7 -> MSP
    //   5: ldr a7 <- USP
    //   6: ...
    ctx.emit(a64::tbnz(cc, HB_S, 6));
    ctx.emit(a64::tbnz(old, super::HB_M, 3));
    ctx.emit(a64::str_uoff(a7, ctxr, crate::state::ctx::ISP));
    ctx.emit(a64::b(2));
    ctx.emit(a64::str_uoff(a7, ctxr, crate::state::ctx::MSP));
    ctx.emit(a64::ldr_uoff(a7, ctxr, crate::state::ctx::USP));
    debug_assert_eq!(ctx.body_len(), base + 6);
    Ok(())
}

/// AND/OR with direction bit, shared by lines 8 and C.
pub(super) fn translate_bitwise(
    ctx: &mut TranslatorContext,
    op: u16,
    bw: Bitwise,
) -> Result<Outcome, CoreError> {
    let reg = ((op >> 9) & 7) as u8;
    let opmode = (op >> 6) & 7;
    let size = OpSize::from_bits(opmode & 3).ok_or(CoreError::TranslatorBug("bitwise size"))?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();
    let to_ea = opmode >= 4;

    if to_ea {
        let dst = ctx.resolve_ea(mode, size)?;
        let d = ctx.emit_load_value(dst, size)?;
        let s = ctx.emit_load_value(Operand::DataReg(reg), size)?;
        bw.emit(ctx, d, s);
        ctx.emit_nz_from_value(d, size, needed & FLAG_NZVC)?;
        ctx.emit_store_result(dst, d, size)?;
        ctx.regs.free_temp(s);
        ctx.regs.free_temp(d);
        ctx.free_operand(dst);
    } else {
        let src = ctx.resolve_ea(mode, size)?;
        let s = ctx.emit_load_value(src, size)?;
        let d = ctx.emit_load_value(Operand::DataReg(reg), size)?;
        bw.emit(ctx, d, s);
        ctx.emit_nz_from_value(d, size, needed & FLAG_NZVC)?;
        ctx.emit_store_dreg(reg, d, size);
        ctx.regs.free_temp(d);
        ctx.regs.free_temp(s);
        ctx.free_operand(src);
    }

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// EOR Dn,<ea> (line B).
pub(super) fn translate_eor(
    ctx: &mut TranslatorContext,
    op: u16,
    size: OpSize,
) -> Result<Outcome, CoreError> {
    let reg = ((op >> 9) & 7) as u8;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let dst = ctx.resolve_ea(mode, size)?;
    let d = ctx.emit_load_value(dst, size)?;
    let s = ctx.emit_load_value(Operand::DataReg(reg), size)?;
    Bitwise::Eor.emit(ctx, d, s);
    ctx.emit_nz_from_value(d, size, needed & FLAG_NZVC)?;
    ctx.emit_store_result(dst, d, size)?;
    ctx.regs.free_temp(s);
    ctx.regs.free_temp(d);
    ctx.free_operand(dst);

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// Line C: AND, MULU/MULS.W, ABCD, EXG.
pub(super) fn translate_linec(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    if (op & 0x01f0) == 0x0100 {
        return bits::translate_abcd(ctx, op);
    }
    if (op & 0x01f8) == 0x0140 || (op & 0x01f8) == 0x0148 || (op & 0x01f8) == 0x0188 {
        return translate_exg(ctx, op);
    }
    if (op & 0x01c0) == 0x00c0 {
        return arith::translate_mul_word(ctx, op, /*signed=*/ false);
    }
    if (op & 0x01c0) == 0x01c0 {
        return arith::translate_mul_word(ctx, op, /*signed=*/ true);
    }
    translate_bitwise(ctx, op, Bitwise::And)
}

/// EXG: swap two whole registers.
fn translate_exg(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let rx = ((op >> 9) & 7) as u8;
    let ry = (op & 7) as u8;
    let (a, b) = match op & 0x01f8 {
        0x0140 => (hostreg::d(rx), hostreg::d(ry)),
        0x0148 => (hostreg::a(rx), hostreg::a(ry)),
        _ => (hostreg::d(rx), hostreg::a(ry)),
    };
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::mov_reg(t, a));
    ctx.emit(a64::mov_reg(a, b));
    ctx.emit(a64::mov_reg(b, t));
    ctx.regs.free_temp(t);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// Scc <ea>: set the destination byte to all-ones or zero.
pub(super) fn translate_scc(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let cond = ((op >> 8) & 0xf) as u8;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let dst = ctx.resolve_ea(mode, OpSize::Byte)?;
    let t = ctx.alloc_temp()?;

    match cond {
        0x0 => ctx.emit(a64::movn(t, 0, 0)), // ST
        0x1 => ctx.emit(a64::movz(t, 0, 0)), // SF
        _ => {
            let host = ctx.emit_load_nzcv(cond)?;
            // csetm: all ones when the condition holds.
            ctx.emit(a64::csinv(t, 31, 31, a64::cc::invert(host)));
        }
    }
    ctx.emit_store_result(dst, t, OpSize::Byte)?;
    ctx.regs.free_temp(t);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// CLR <ea>.
pub(super) fn translate_clr(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let size = OpSize::from_bits(op >> 6).ok_or(CoreError::TranslatorBug("clr size"))?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let dst = ctx.resolve_ea(mode, size)?;
    let z = ctx.alloc_temp()?;
    ctx.emit(a64::movz(z, 0, 0));
    ctx.emit_store_result(dst, z, size)?;
    ctx.regs.free_temp(z);
    ctx.free_operand(dst);

    ctx.emit_flag_set(needed & FLAG_Z)?;
    ctx.emit_flag_clear(needed & (FLAG_N | FLAG_V | FLAG_C))?;
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// NOT <ea>.
pub(super) fn translate_not(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let size = OpSize::from_bits(op >> 6).ok_or(CoreError::TranslatorBug("not size"))?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let dst = ctx.resolve_ea(mode, size)?;
    let d = ctx.emit_load_value(dst, size)?;
    ctx.emit(a64::mvn_reg(d, d));
    if size != OpSize::Long {
        ctx.emit(a64::and_imm(d, d, size.mask()));
    }
    ctx.emit_nz_from_value(d, size, needed & FLAG_NZVC)?;
    ctx.emit_store_result(dst, d, size)?;
    ctx.regs.free_temp(d);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// NEG / NEGX <ea>.
pub(super) fn translate_neg(
    ctx: &mut TranslatorContext,
    op: u16,
    with_x: bool,
) -> Result<Outcome, CoreError> {
    let size = OpSize::from_bits(op >> 6).ok_or(CoreError::TranslatorBug("neg size"))?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let dst = ctx.resolve_ea(mode, size)?;
    let v = ctx.emit_load_value(dst, size)?;
    let d = ctx.alloc_temp()?;
    ctx.emit(a64::movz(d, 0, 0));

    if with_x {
        // 0 - dst - X, Z accumulating.
        let cc = ctx.get_cc()?;
        let t = ctx.alloc_temp()?;
        ctx.emit(a64::ubfx(t, cc, super::HB_X, 1));
        ctx.emit(a64::eor_imm(t, t, 1));
        ctx.emit(a64::lsl_imm(t, t, 29));
        ctx.emit(a64::msr(SysReg::Nzcv, t));
        ctx.regs.free_temp(t);
        let sh = 32 - size.bits();
        if sh != 0 {
            ctx.emit(a64::lsl_imm(v, v, sh));
        }
        ctx.emit(a64::sbcs(d, d, v));
        if sh != 0 {
            ctx.emit(a64::lsr_imm(d, d, sh));
        }
        ctx.emit_flag_update_accumulate_z(needed & (FLAG_NZVC | FLAG_X), true)?;
    } else {
        ctx.emit_alu_sized(arith::Alu::Sub, d, v, size);
        ctx.emit_flag_update(needed & (FLAG_NZVC | FLAG_X), true)?;
    }

    ctx.emit_store_result(dst, d, size)?;
    ctx.regs.free_temp(d);
    ctx.regs.free_temp(v);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// TST <ea>.
pub(super) fn translate_tst(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let size = OpSize::from_bits(op >> 6).ok_or(CoreError::TranslatorBug("tst size"))?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let src = ctx.resolve_ea(mode, size)?;
    let v = ctx.emit_load_value(src, size)?;
    ctx.emit_nz_from_value(v, size, needed & FLAG_NZVC)?;
    ctx.regs.free_temp(v);
    ctx.free_operand(src);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// TAS <ea>: test the byte, then set its high bit.
pub(super) fn translate_tas(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let dst = ctx.resolve_ea(mode, OpSize::Byte)?;
    let v = ctx.emit_load_value(dst, OpSize::Byte)?;
    ctx.emit_nz_from_value(v, OpSize::Byte, needed & FLAG_NZVC)?;
    ctx.emit(a64::orr_imm(v, v, 0x80));
    ctx.emit_store_result(dst, v, OpSize::Byte)?;
    ctx.regs.free_temp(v);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// SWAP Dn.
pub(super) fn translate_swap(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let dn = hostreg::d((op & 7) as u8);
    let needed = ctx.flags_needed();
    ctx.emit(a64::ror_imm(dn, dn, 16));
    ctx.emit_nz_from_value(dn, OpSize::Long, needed & FLAG_NZVC)?;
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// EXT.W / EXT.L / EXTB.L.
pub(super) fn translate_ext(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let dn = hostreg::d((op & 7) as u8);
    let needed = ctx.flags_needed();
    let t = ctx.alloc_temp()?;
    let size = match (op >> 6) & 7 {
        2 => {
            // byte -> word
            ctx.emit(a64::sxtb(t, dn));
            ctx.emit(a64::bfi(dn, t, 0, 16));
            OpSize::Word
        }
        3 => {
            // word -> long
            ctx.emit(a64::sxth(dn, dn));
            ctx.emit(a64::mov_reg(t, dn));
            OpSize::Long
        }
        _ => {
            // EXTB.L: byte -> long
            ctx.emit(a64::sxtb(dn, dn));
            ctx.emit(a64::mov_reg(t, dn));
            OpSize::Long
        }
    };
    ctx.emit_nz_from_value(t, size, needed & FLAG_NZVC)?;
    ctx.regs.free_temp(t);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}
