//! Data movement: MOVE and friends, the register-list transfers, and
//! the stack-frame helpers.

use crate::emit::a64::{self, Shift};
use crate::emit::hostreg;
use crate::error::CoreError;
use crate::jit::flags::FLAG_NZVC;
use crate::state::ctx as ctxoff;

use super::ea::AddressingMode;
use super::{OpSize, Operand, Outcome, TranslatorContext, flow, logic};

/// Lines 1-3: MOVE / MOVEA.
pub(super) fn translate_move(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let size = OpSize::from_move_bits(op >> 12).ok_or(CoreError::TranslatorBug("move size"))?;
    let src_mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let dst_mode = AddressingMode::decode(((op >> 6) & 7) as u8, ((op >> 9) & 7) as u8)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let src = ctx.resolve_ea(src_mode, size)?;
    let v = ctx.emit_load_value(src, size)?;
    ctx.free_operand(src);

    if let AddressingMode::AddressDirect(n) = dst_mode {
        // MOVEA: word sources sign-extend, no flags.
        if size == OpSize::Word {
            ctx.emit(a64::sxth(v, v));
        }
        ctx.emit(a64::mov_reg(hostreg::a(n), v));
        ctx.regs.free_temp(v);
        ctx.advance_insn_pc();
        return Ok(Outcome::Continue);
    }

    let dst = ctx.resolve_ea(dst_mode, size)?;
    ctx.emit_store_result(dst, v, size)?;
    ctx.free_operand(dst);
    ctx.emit_nz_from_value(v, size, needed & FLAG_NZVC)?;
    ctx.regs.free_temp(v);

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// MOVEQ #imm8,Dn.
pub(super) fn translate_moveq(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let needed = ctx.flags_needed();
    let dn = hostreg::d(((op >> 9) & 7) as u8);
    let value = (op & 0xff) as i8 as i32 as u32;
    ctx.emit_all(a64::mov_imm32(dn, value));
    ctx.emit_nz_from_value(dn, OpSize::Long, needed & FLAG_NZVC)?;
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// LEA <ea>,An.
pub(super) fn translate_lea(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let an = hostreg::a(((op >> 9) & 7) as u8);
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let addr = ctx.resolve_ea(mode, OpSize::Long)?;
    match addr {
        Operand::Mem { reg, .. } => ctx.emit(a64::mov_reg(an, reg)),
        _ => return Err(CoreError::TranslatorBug("lea operand")),
    }
    ctx.free_operand(addr);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// PEA <ea>: push the effective address.
pub(super) fn translate_pea(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let addr = ctx.resolve_ea(mode, OpSize::Long)?;
    let Operand::Mem { reg, .. } = addr else {
        return Err(CoreError::TranslatorBug("pea operand"));
    };
    let a7 = hostreg::A7;
    ctx.emit(a64::sub_imm(a7, a7, 4));
    ctx.emit_store_be(reg, a7, OpSize::Long)?;
    ctx.free_operand(addr);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// MOVEM: register list to or from memory.
pub(super) fn translate_movem(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let to_regs = op & 0x0400 != 0;
    let size = if op & 0x0040 != 0 { OpSize::Long } else { OpSize::Word };
    let mask = ctx.read_ext_word();
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let step = size.bytes();

    // Host register for guest register index 0-15 (D0..A7).
    let guest = |i: u8| {
        if i < 8 {
            hostreg::d(i)
        } else {
            hostreg::a(i - 8)
        }
    };

    match mode {
        AddressingMode::PreDecrement(n) if !to_regs => {
            // Mask is reversed: bit 0 = A7, descending addresses.
            let an = hostreg::a(n);
            let t = ctx.alloc_temp()?;
            for bit in 0..16u8 {
                if mask & (1 << bit) == 0 {
                    continue;
                }
                let src = guest(15 - bit);
                ctx.emit(a64::sub_imm(an, an, step));
                if size == OpSize::Word {
                    ctx.emit(a64::rev16(t, src));
                    ctx.emit(a64::strh_uoff(t, an, 0));
                } else {
                    ctx.emit(a64::rev(t, src));
                    ctx.emit(a64::str_uoff(t, an, 0));
                }
            }
            ctx.regs.free_temp(t);
        }
        AddressingMode::PostIncrement(n) if to_regs => {
            let an = hostreg::a(n);
            for bit in 0..16u8 {
                if mask & (1 << bit) == 0 {
                    continue;
                }
                let dst = guest(bit);
                ctx.emit_load_be(dst, an, size);
                if size == OpSize::Word {
                    ctx.emit(a64::sxth(dst, dst));
                }
                ctx.emit(a64::add_imm(an, an, step));
            }
        }
        _ => {
            // Control modes: walk a transient cursor.
            let base = ctx.resolve_ea(mode, size)?;
            let Operand::Mem { reg, owned } = base else {
                return Err(CoreError::TranslatorBug("movem operand"));
            };
            let cursor = if owned {
                reg
            } else {
                let t = ctx.alloc_temp()?;
                ctx.emit(a64::mov_reg(t, reg));
                t
            };
            let t = ctx.alloc_temp()?;
            for bit in 0..16u8 {
                if mask & (1 << bit) == 0 {
                    continue;
                }
                let r = guest(bit);
                if to_regs {
                    ctx.emit_load_be(r, cursor, size);
                    if size == OpSize::Word {
                        ctx.emit(a64::sxth(r, r));
                    }
                } else if size == OpSize::Word {
                    ctx.emit(a64::rev16(t, r));
                    ctx.emit(a64::strh_uoff(t, cursor, 0));
                } else {
                    ctx.emit(a64::rev(t, r));
                    ctx.emit(a64::str_uoff(t, cursor, 0));
                }
                ctx.emit(a64::add_imm(cursor, cursor, step));
            }
            ctx.regs.free_temp(t);
            ctx.regs.free_temp(cursor);
        }
    }

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// LINK An,#d16.
pub(super) fn translate_link(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let an = hostreg::a((op & 7) as u8);
    let d16 = ctx.read_ext_word() as i16 as i32;
    let a7 = hostreg::A7;
    ctx.emit(a64::sub_imm(a7, a7, 4));
    ctx.emit_store_be(an, a7, OpSize::Long)?;
    ctx.emit(a64::mov_reg(an, a7));
    ctx.emit_add_const(a7, a7, d16)?;
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// UNLK An.
pub(super) fn translate_unlk(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let an = hostreg::a((op & 7) as u8);
    let a7 = hostreg::A7;
    ctx.emit(a64::mov_reg(a7, an));
    ctx.emit_load_be(an, a7, OpSize::Long);
    ctx.emit(a64::add_imm(a7, a7, 4));
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// MOVE An,USP / MOVE USP,An (privileged).
pub(super) fn translate_move_usp(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    logic::emit_privilege_check(ctx, insn_pc)?;
    let an = hostreg::a((op & 7) as u8);
    let ctxr = ctx.get_ctx_reg()?;
    if op & 8 != 0 {
        ctx.emit(a64::ldr_uoff(an, ctxr, ctxoff::USP));
    } else {
        ctx.emit(a64::str_uoff(an, ctxr, ctxoff::USP));
    }
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// MOVE SR,<ea>.
pub(super) fn translate_move_from_sr(
    ctx: &mut TranslatorContext,
    op: u16,
) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    // Privileged on 68010 and later.
    logic::emit_privilege_check(ctx, insn_pc)?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let cc = ctx.get_cc()?;
    let dst = ctx.resolve_ea(mode, OpSize::Word)?;
    let t = ctx.alloc_temp()?;
    let t2 = ctx.alloc_temp()?;
    // Swap C/V back into the architectural order.
    ctx.emit(a64::rbit(t2, cc));
    ctx.emit(a64::mov_reg(t, cc));
    ctx.emit(a64::bfxil(t, t2, 30, 2));
    ctx.regs.free_temp(t2);
    ctx.emit_store_result(dst, t, OpSize::Word)?;
    ctx.regs.free_temp(t);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// MOVE CCR,<ea>.
pub(super) fn translate_move_from_ccr(
    ctx: &mut TranslatorContext,
    op: u16,
) -> Result<Outcome, CoreError> {
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let cc = ctx.get_cc()?;
    let dst = ctx.resolve_ea(mode, OpSize::Word)?;
    let t = ctx.alloc_temp()?;
    let t2 = ctx.alloc_temp()?;
    ctx.emit(a64::rbit(t2, cc));
    ctx.emit(a64::and_imm(t, cc, 0x1c));
    ctx.emit(a64::bfxil(t, t2, 30, 2));
    ctx.emit(a64::and_imm(t, t, 0x1f));
    ctx.regs.free_temp(t2);
    ctx.emit_store_result(dst, t, OpSize::Word)?;
    ctx.regs.free_temp(t);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// MOVE <ea>,CCR.
pub(super) fn translate_move_to_ccr(
    ctx: &mut TranslatorContext,
    op: u16,
) -> Result<Outcome, CoreError> {
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let src = ctx.resolve_ea(mode, OpSize::Word)?;
    let v = ctx.emit_load_value(src, OpSize::Word)?;
    ctx.free_operand(src);
    let cc = ctx.modify_cc()?;
    let t2 = ctx.alloc_temp()?;
    // Swap the incoming C/V into host order, then splice the low five
    // bits into the packed SR.
    ctx.emit(a64::rbit(t2, v));
    ctx.emit(a64::bfxil(v, t2, 30, 2));
    ctx.emit(a64::bfi(cc, v, 0, 5));
    ctx.regs.free_temp(t2);
    ctx.regs.free_temp(v);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// MOVE <ea>,SR (privileged).
pub(super) fn translate_move_to_sr(
    ctx: &mut TranslatorContext,
    op: u16,
) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    logic::emit_privilege_check(ctx, insn_pc)?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let src = ctx.resolve_ea(mode, OpSize::Word)?;
    let v = ctx.emit_load_value(src, OpSize::Word)?;
    ctx.free_operand(src);

    let cc = ctx.modify_cc()?;
    let old = ctx.alloc_temp()?;
    ctx.emit(a64::mov_reg(old, cc));
    let t2 = ctx.alloc_temp()?;
    ctx.emit(a64::rbit(t2, v));
    ctx.emit(a64::bfxil(v, t2, 30, 2));
    ctx.emit(a64::mov_reg(cc, v));
    ctx.regs.free_temp(t2);
    ctx.regs.free_temp(v);
    logic::emit_sr_write_tail(ctx, old)?;
    ctx.regs.free_temp(old);

    ctx.advance_insn_pc();
    ctx.flush_pc();
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// MOVEC (68010+): the control registers the core actually models.
pub(super) fn translate_movec(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    logic::emit_privilege_check(ctx, insn_pc)?;
    let ext = ctx.read_ext_word();
    let to_ctrl = op & 1 != 0;
    let gp = ((ext >> 12) & 15) as u8;
    let host = if gp < 8 {
        hostreg::d(gp)
    } else {
        hostreg::a(gp - 8)
    };
    let ctrl = ext & 0xfff;
    let offset = match ctrl {
        0x002 => ctxoff::CACR,
        0x800 => ctxoff::USP,
        0x801 => ctxoff::VBR,
        0x803 => ctxoff::MSP,
        0x804 => ctxoff::ISP,
        _ => {
            log::warn!(target: "jit", "movec of unmodeled control register {ctrl:#x}");
            return flow::translate_unimplemented(ctx, op, flow::vector::ILLEGAL);
        }
    };
    let ctxr = ctx.get_ctx_reg()?;
    if to_ctrl {
        ctx.emit(a64::str_uoff(host, ctxr, offset));
    } else {
        ctx.emit(a64::ldr_uoff(host, ctxr, offset));
    }
    ctx.advance_insn_pc();
    if to_ctrl && ctrl == 0x002 {
        // CACR writes flip the dispatcher fast path; resume through it.
        ctx.flush_pc();
        ctx.push_stop();
        return Ok(Outcome::Stop);
    }
    Ok(Outcome::Continue)
}
