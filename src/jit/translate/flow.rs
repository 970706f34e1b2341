//! Control flow: branches, subroutine linkage, returns, traps, and
//! guest exception emission.

use crate::emit::a64::{self, SysReg};
use crate::emit::{FixupKind, hostreg};
use crate::error::CoreError;
use crate::state::ctx as ctxoff;

use super::ea::AddressingMode;
use super::{HB_M, HB_S, HB_V, OpSize, Operand, Outcome, TranslatorContext, logic, moves};

/// Guest exception vector numbers.
pub mod vector {
    pub const ILLEGAL: u32 = 4;
    pub const ZERO_DIVIDE: u32 = 5;
    pub const CHK: u32 = 6;
    pub const TRAPV: u32 = 7;
    pub const PRIVILEGE_VIOLATION: u32 = 8;
    pub const LINE_A: u32 = 10;
    pub const LINE_F: u32 = 11;
    pub const FORMAT_ERROR: u32 = 14;
    pub const TRAP_BASE: u32 = 32;
}

/// Size of the translation-time return-address stack.
const RETURN_STACK_SIZE: usize = 32;

impl TranslatorContext<'_> {
    /// Push a predicted return address for a BSR/JSR being translated.
    pub fn push_return_address(&mut self, addr: u32) {
        if self.return_stack.len() >= RETURN_STACK_SIZE {
            self.return_stack.remove(0);
        }
        self.return_stack.push(addr);
    }

    /// Consume the most recent prediction, if any.
    pub fn pop_return_address(&mut self) -> Option<u32> {
        self.return_stack.pop()
    }

    /// Whether a branch from the current instruction to `target` is
    /// close enough to keep translating through.
    fn branch_inlineable(&self, target: u32) -> bool {
        let here = self.last_insn_start();
        let distance = if target >= here {
            target - here
        } else {
            here - target
        };
        distance <= self.cfg.inline_range
    }
}

/// Tail of every side-exit stub: store dirty FP registers, the FPCR
/// and FPSR mirrors, bump the instruction counter by the path count,
/// and return to the dispatcher. The packed SR and the PC register are
/// the caller's responsibility.
pub(super) fn emit_stub_exit(ctx: &mut TranslatorContext) -> Result<(), CoreError> {
    let base = ctx.alloc_temp()?;
    ctx.emit(a64::mrs(base, SysReg::CtxPointer));

    let fp_dirty = ctx.regs.fp_dirty_mask();
    for i in 0..8u8 {
        if fp_dirty & (1 << i) != 0 {
            ctx.emit(a64::fstd_uoff(hostreg::fp(i), base, ctxoff::fp(i as usize)));
        }
    }
    let mut seq = Vec::new();
    ctx.regs.store_fpcr(&mut seq)?;
    ctx.regs.store_fpsr(&mut seq)?;
    ctx.emit_all(seq);

    let count = ctx.insn_count + 1;
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::ldr64_uoff(t, base, ctxoff::INSN_COUNT));
    ctx.emit(a64::add_imm_64(t, t, count & 0xfff));
    ctx.emit(a64::str64_uoff(t, base, ctxoff::INSN_COUNT));
    ctx.regs.free_temp(t);
    ctx.regs.free_temp(base);

    ctx.emit(a64::ret());
    Ok(())
}

/// Side exit that resumes the dispatcher at a known guest PC.
pub(super) fn emit_stub_exit_to(ctx: &mut TranslatorContext, exit_pc: u32) -> Result<(), CoreError> {
    let mut seq = Vec::new();
    ctx.regs.store_cc(&mut seq);
    ctx.emit_all(seq);
    ctx.emit_all(a64::mov_imm32(hostreg::PC, exit_pc));
    emit_stub_exit(ctx)
}

/// Build a guest exception inline: select the supervisor stack, push
/// the format-0 frame (SR, return PC, vector-offset word), update SR,
/// and load the new PC through the vector base register.
///
/// Callers in the main body must flush the CC slot first so the
/// scratch SR register is current; inside a stub the pending value is
/// stored here.
pub(super) fn emit_exception(
    ctx: &mut TranslatorContext,
    vector: u32,
    stacked_pc: u32,
) -> Result<(), CoreError> {
    let mut seq = Vec::new();
    ctx.regs.store_cc(&mut seq);
    ctx.emit_all(seq);

    let sr = ctx.alloc_temp()?;
    ctx.emit(a64::mrs(sr, SysReg::SrScratch));
    let base = ctx.alloc_temp()?;
    ctx.emit(a64::mrs(base, SysReg::CtxPointer));
    let t = ctx.alloc_temp()?;
    let a7 = hostreg::A7;

    // Stack switch when coming from user mode.
    ctx.emit(a64::tbnz(sr, HB_S, 6));
    ctx.emit(a64::str_uoff(a7, base, ctxoff::USP));
    ctx.emit(a64::tbnz(sr, HB_M, 3));
    ctx.emit(a64::ldr_uoff(a7, base, ctxoff::ISP));
    ctx.emit(a64::b(2));
    ctx.emit(a64::ldr_uoff(a7, base, ctxoff::MSP));

    // Architectural SR image (swap C/V back).
    let arch = ctx.alloc_temp()?;
    ctx.emit(a64::rbit(t, sr));
    ctx.emit(a64::mov_reg(arch, sr));
    ctx.emit(a64::bfxil(arch, t, 30, 2));

    // Format-0 frame: SR at 0, PC at 2, vector-offset word at 6.
    ctx.emit(a64::sub_imm(a7, a7, 8));
    ctx.emit(a64::rev16(arch, arch));
    ctx.emit(a64::strh_uoff(arch, a7, 0));
    ctx.emit_all(a64::mov_imm32(t, stacked_pc.swap_bytes()));
    ctx.emit(a64::stur(t, a7, 2));
    let frame = ((vector as u16) << 2).swap_bytes();
    ctx.emit_all(a64::mov_imm32(t, frame as u32));
    ctx.emit(a64::strh_uoff(t, a7, 6));
    ctx.regs.free_temp(arch);

    // Enter supervisor mode, clear both trace bits.
    ctx.emit(a64::orr_imm(sr, sr, 0x2000));
    ctx.emit(a64::bfi(sr, 31, 14, 2));
    ctx.emit(a64::msr(SysReg::SrScratch, sr));

    // New PC from the vector table.
    ctx.emit(a64::ldr_uoff(t, base, ctxoff::VBR));
    ctx.emit(a64::ldr_uoff(hostreg::PC, t, vector * 4));
    ctx.emit(a64::rev(hostreg::PC, hostreg::PC));

    ctx.regs.free_temp(t);
    ctx.regs.free_temp(base);
    ctx.regs.free_temp(sr);
    Ok(())
}

/// An opcode the translator cannot (or must not) translate: raise the
/// corresponding guest exception and close the unit.
pub(super) fn translate_unimplemented(
    ctx: &mut TranslatorContext,
    op: u16,
    vector: u32,
) -> Result<Outcome, CoreError> {
    if vector == vector::ILLEGAL {
        log::warn!(
            target: "jit",
            "raising illegal-instruction for opcode {op:#06x} at {:#010x}",
            ctx.last_insn_start()
        );
    }
    let mut seq = Vec::new();
    ctx.regs.flush_cc(&mut seq);
    ctx.emit_all(seq);
    ctx.flush_pc();
    emit_exception(ctx, vector, ctx.last_insn_start())?;
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// Static branch/jump targets (absolute and PC-relative displacement
/// forms), resolvable at translation time.
fn static_ea_target(ctx: &mut TranslatorContext, mode: AddressingMode) -> Option<u32> {
    match mode {
        AddressingMode::AbsoluteShort => Some(ctx.read_ext_word() as i16 as i32 as u32),
        AddressingMode::AbsoluteLong => Some(ctx.read_ext_long()),
        AddressingMode::PcDisplacement => {
            let base = ctx.mpc;
            let d16 = ctx.read_ext_word() as i16 as i32;
            Some(base.wrapping_add_signed(d16))
        }
        _ => None,
    }
}

/// Line 6: BRA, BSR, Bcc.
pub(super) fn translate_line6(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let cond = ((op >> 8) & 0xf) as u8;
    let disp8 = (op & 0xff) as i8;
    let base = ctx.mpc; // after the opcode word
    let target = match op & 0xff {
        0x00 => {
            let d = ctx.read_ext_word() as i16 as i32;
            base.wrapping_add_signed(d)
        }
        0xff => {
            let d = ctx.read_ext_long() as i32;
            base.wrapping_add_signed(d)
        }
        _ => base.wrapping_add_signed(disp8 as i32),
    };
    let fallthrough = ctx.mpc;

    match cond {
        0x0 => {
            // BRA
            if ctx.branch_inlineable(target) {
                let delta = target as i32 - ctx.last_insn_start() as i32;
                ctx.advance_pc(delta);
                ctx.mpc = target;
                Ok(Outcome::Continue)
            } else {
                ctx.set_pc_const(target);
                ctx.push_stop();
                Ok(Outcome::Stop)
            }
        }
        0x1 => {
            // BSR
            let a7 = hostreg::A7;
            let t = ctx.alloc_temp()?;
            ctx.emit(a64::sub_imm(a7, a7, 4));
            ctx.emit_all(a64::mov_imm32(t, fallthrough.swap_bytes()));
            ctx.emit(a64::str_uoff(t, a7, 0));
            ctx.regs.free_temp(t);
            ctx.push_return_address(fallthrough);
            if ctx.branch_inlineable(target) {
                let delta = target as i32 - ctx.last_insn_start() as i32;
                ctx.advance_pc(delta);
                ctx.mpc = target;
                Ok(Outcome::Continue)
            } else {
                ctx.set_pc_const(target);
                ctx.push_stop();
                Ok(Outcome::Stop)
            }
        }
        _ => translate_bcc(ctx, cond, target, fallthrough),
    }
}

fn translate_bcc(
    ctx: &mut TranslatorContext,
    cond: u8,
    target: u32,
    fallthrough: u32,
) -> Result<Outcome, CoreError> {
    let here = ctx.last_insn_start();
    let backward_inline = target <= here && ctx.branch_inlineable(target);

    if backward_inline {
        // Keep translating the taken (loop) path; the fall-through
        // leaves through a stub when the condition fails.
        let host = ctx.emit_load_nzcv(cond)?;
        let loc = ctx.body_len();
        ctx.emit(a64::b_cond(a64::cc::invert(host), 0));
        ctx.exit_stub(FixupKind::CondBranch, loc, |c| emit_stub_exit_to(c, fallthrough))?;
        let delta = target as i32 - here as i32;
        ctx.advance_pc(delta);
        ctx.mpc = target;
        Ok(Outcome::Continue)
    } else {
        // Keep translating the fall-through; the taken path leaves
        // through a stub.
        let host = ctx.emit_load_nzcv(cond)?;
        let loc = ctx.body_len();
        ctx.emit(a64::b_cond(host, 0));
        ctx.exit_stub(FixupKind::CondBranch, loc, |c| emit_stub_exit_to(c, target))?;
        ctx.advance_insn_pc();
        Ok(Outcome::Continue)
    }
}

/// DBcc Dn,disp.
pub(super) fn translate_dbcc(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let cond = ((op >> 8) & 0xf) as u8;
    let dn = hostreg::d((op & 7) as u8);
    let base = ctx.mpc;
    let d16 = ctx.read_ext_word() as i16 as i32;
    let target = base.wrapping_add_signed(d16);
    let fallthrough = ctx.mpc;
    let here = ctx.last_insn_start();

    if ctx.cfg.dbf_slowdown {
        // Extra guest-bus touches to pace tight delay loops.
        let off = ctx.pc_rel;
        if (-255..=255).contains(&off) {
            ctx.emit(a64::ldurh(31, hostreg::PC, off));
            ctx.emit(a64::ldurh(31, hostreg::PC, off));
        }
    }

    // Condition true: the loop finishes.
    let cond_loc = if cond != 0x1 {
        let host = ctx.emit_load_nzcv(cond)?;
        let loc = ctx.body_len();
        ctx.emit(a64::b_cond(host, 0));
        Some(loc)
    } else {
        None
    };

    // Decrement the low word; -1 also finishes the loop.
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::sxth(t, dn));
    ctx.emit(a64::sub_imm(t, t, 1));
    ctx.emit(a64::bfi(dn, t, 0, 16));
    ctx.emit(a64::cmn_imm(t, 1));
    ctx.regs.free_temp(t);
    let exp_loc = ctx.body_len();
    ctx.emit(a64::b_cond(a64::cc::EQ, 0));

    if target <= here && ctx.branch_inlineable(target) {
        // Hot shape: loop back by continuing translation at the
        // target; both finish conditions share one stub.
        match cond_loc {
            Some(c) => ctx.double_exit_stub(
                (FixupKind::CondBranch, c),
                (FixupKind::CondBranch, exp_loc),
                |cx| emit_stub_exit_to(cx, fallthrough),
            )?,
            None => {
                ctx.exit_stub(FixupKind::CondBranch, exp_loc, |cx| {
                    emit_stub_exit_to(cx, fallthrough)
                })?;
            }
        }
        let delta = target as i32 - here as i32;
        ctx.advance_pc(delta);
        ctx.mpc = target;
        Ok(Outcome::Continue)
    } else {
        // Far target: the not-finished path leaves through a stub; the
        // two finish conditions land just past it.
        let back = ctx.body_len();
        ctx.emit(a64::b_cond(a64::cc::AL, 0));
        ctx.exit_stub(FixupKind::CondBranch, back, |cx| emit_stub_exit_to(cx, target))?;
        let finish = ctx.body_len();
        ctx.emit(a64::nop());
        if let Some(c) = cond_loc {
            ctx.patch_local(c, FixupKind::CondBranch, finish);
        }
        ctx.patch_local(exp_loc, FixupKind::CondBranch, finish);
        ctx.advance_insn_pc();
        Ok(Outcome::Continue)
    }
}

/// TRAPcc (and TRAPcc.W/.L operand forms).
pub(super) fn translate_trapcc(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    let cond = ((op >> 8) & 0xf) as u8;
    match op & 7 {
        2 => {
            ctx.read_ext_word();
        }
        3 => {
            ctx.read_ext_long();
        }
        _ => {}
    }
    let next = insn_pc.wrapping_add(ctx.insn_bytes());

    if cond == 0x1 {
        // TRAPF: never traps; effectively a wide NOP.
        ctx.advance_insn_pc();
        return Ok(Outcome::Continue);
    }

    ctx.get_cc()?;
    ctx.get_ctx_reg()?;
    let host = ctx.emit_load_nzcv(cond)?;
    let loc = ctx.body_len();
    ctx.emit(a64::b_cond(host, 0));
    ctx.exit_stub(FixupKind::CondBranch, loc, |c| {
        emit_exception(c, vector::TRAPV, next)?;
        emit_stub_exit(c)
    })?;
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// Line 4 dispatcher: the miscellaneous group.
pub(super) fn translate_line4(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    use super::{arith, bits, logic as lg};

    match op {
        0x4e70 => return translate_reset(ctx),
        0x4e71 => {
            // NOP
            ctx.advance_insn_pc();
            return Ok(Outcome::Continue);
        }
        0x4e72 => return translate_stop(ctx),
        0x4e73 => return translate_rte(ctx),
        0x4e74 => return translate_rtd(ctx),
        0x4e75 => return translate_rts(ctx),
        0x4e76 => return translate_trapv(ctx),
        0x4e77 => return translate_rtr(ctx),
        0x4afc => return translate_unimplemented(ctx, op, vector::ILLEGAL),
        _ => {}
    }

    if (op & 0xfff0) == 0x4e40 {
        return translate_trap(ctx, op);
    }
    if (op & 0xfff0) == 0x4e60 {
        return moves::translate_move_usp(ctx, op);
    }
    if (op & 0xfffe) == 0x4e7a {
        return moves::translate_movec(ctx, op);
    }
    if (op & 0xfff8) == 0x4e50 {
        return moves::translate_link(ctx, op);
    }
    if (op & 0xfff8) == 0x4e58 {
        return moves::translate_unlk(ctx, op);
    }
    if (op & 0xfff8) == 0x4848 {
        // BKPT #n: taken as illegal on this machine.
        return translate_unimplemented(ctx, op, vector::ILLEGAL);
    }
    if (op & 0xffc0) == 0x4ec0 {
        return translate_jmp(ctx, op, /*call=*/ false);
    }
    if (op & 0xffc0) == 0x4e80 {
        return translate_jmp(ctx, op, /*call=*/ true);
    }
    if (op & 0xffc0) == 0x40c0 {
        return moves::translate_move_from_sr(ctx, op);
    }
    if (op & 0xffc0) == 0x42c0 {
        return moves::translate_move_from_ccr(ctx, op);
    }
    if (op & 0xffc0) == 0x44c0 {
        return moves::translate_move_to_ccr(ctx, op);
    }
    if (op & 0xffc0) == 0x46c0 {
        return moves::translate_move_to_sr(ctx, op);
    }
    if (op & 0xffc0) == 0x4800 {
        return bits::translate_nbcd(ctx, op);
    }
    if (op & 0xfff8) == 0x4840 {
        return lg::translate_swap(ctx, op);
    }
    if (op & 0xfff8) == 0x4880 || (op & 0xfff8) == 0x48c0 || (op & 0xfff8) == 0x49c0 {
        // EXT.W/EXT.L/EXTB.L sit inside the MOVEM pattern space with
        // register-direct mode.
        return lg::translate_ext(ctx, op);
    }
    if (op & 0xffc0) == 0x4840 {
        return moves::translate_pea(ctx, op);
    }
    if (op & 0xfb80) == 0x4880 && (op & 0x38) != 0 {
        return moves::translate_movem(ctx, op);
    }
    if (op & 0xffc0) == 0x4c00 {
        return arith::translate_mul_long(ctx, op);
    }
    if (op & 0xffc0) == 0x4c40 {
        return arith::translate_div_long(ctx, op);
    }
    if (op & 0xff00) == 0x4000 {
        return lg::translate_neg(ctx, op, /*with_x=*/ true); // NEGX
    }
    if (op & 0xff00) == 0x4200 {
        return lg::translate_clr(ctx, op);
    }
    if (op & 0xff00) == 0x4400 {
        return lg::translate_neg(ctx, op, /*with_x=*/ false);
    }
    if (op & 0xff00) == 0x4600 {
        return lg::translate_not(ctx, op);
    }
    if (op & 0xffc0) == 0x4ac0 {
        return lg::translate_tas(ctx, op);
    }
    if (op & 0xff00) == 0x4a00 {
        return lg::translate_tst(ctx, op);
    }
    if (op & 0xf1c0) == 0x41c0 {
        return moves::translate_lea(ctx, op);
    }
    if (op & 0xf1c0) == 0x4180 || (op & 0xf1c0) == 0x4100 {
        return arith::translate_chk(ctx, op);
    }

    translate_unimplemented(ctx, op, vector::ILLEGAL)
}

/// JMP/JSR <ea>.
fn translate_jmp(ctx: &mut TranslatorContext, op: u16, call: bool) -> Result<Outcome, CoreError> {
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;

    if let Some(target) = static_ea_target(ctx, mode) {
        let fallthrough = ctx.mpc;
        if call {
            let a7 = hostreg::A7;
            let t = ctx.alloc_temp()?;
            ctx.emit(a64::sub_imm(a7, a7, 4));
            ctx.emit_all(a64::mov_imm32(t, fallthrough.swap_bytes()));
            ctx.emit(a64::str_uoff(t, a7, 0));
            ctx.regs.free_temp(t);
            ctx.push_return_address(fallthrough);
        }
        if ctx.branch_inlineable(target) {
            let delta = target as i32 - ctx.last_insn_start() as i32;
            ctx.advance_pc(delta);
            ctx.mpc = target;
            return Ok(Outcome::Continue);
        }
        ctx.set_pc_const(target);
        ctx.push_stop();
        return Ok(Outcome::Stop);
    }

    // Dynamic target.
    let addr = ctx.resolve_ea(mode, OpSize::Long)?;
    let Operand::Mem { reg, .. } = addr else {
        return Err(CoreError::TranslatorBug("jmp operand"));
    };
    if call {
        let fallthrough = ctx.mpc;
        let a7 = hostreg::A7;
        let t = ctx.alloc_temp()?;
        ctx.emit(a64::sub_imm(a7, a7, 4));
        ctx.emit_all(a64::mov_imm32(t, fallthrough.swap_bytes()));
        ctx.emit(a64::str_uoff(t, a7, 0));
        ctx.regs.free_temp(t);
    }
    ctx.emit(a64::mov_reg(hostreg::PC, reg));
    ctx.free_operand(addr);
    ctx.pc_rel = 0;
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// RTS, with the return-stack prediction.
fn translate_rts(ctx: &mut TranslatorContext) -> Result<Outcome, CoreError> {
    let a7 = hostreg::A7;
    let t = ctx.alloc_temp()?;
    ctx.emit_load_be(t, a7, OpSize::Long);
    ctx.emit(a64::add_imm(a7, a7, 4));

    if let Some(predicted) = ctx.pop_return_address() {
        // The prediction is advisory: verify the on-stack address and
        // leave through a stub when it does not match.
        let t2 = ctx.alloc_temp()?;
        ctx.emit_all(a64::mov_imm32(t2, predicted));
        ctx.emit(a64::cmp_reg(t, t2));
        ctx.regs.free_temp(t2);
        let loc = ctx.body_len();
        ctx.emit(a64::b_cond(a64::cc::NE, 0));
        let treg = t;
        ctx.exit_stub(FixupKind::CondBranch, loc, |c| {
            let mut seq = Vec::new();
            c.regs.store_cc(&mut seq);
            c.emit_all(seq);
            c.emit(a64::mov_reg(hostreg::PC, treg));
            emit_stub_exit(c)
        })?;
        ctx.regs.free_temp(t);
        let delta = predicted as i32 - ctx.last_insn_start() as i32;
        ctx.advance_pc(delta);
        ctx.mpc = predicted;
        return Ok(Outcome::Continue);
    }

    ctx.emit(a64::mov_reg(hostreg::PC, t));
    ctx.regs.free_temp(t);
    ctx.pc_rel = 0;
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// RTR: pop CCR, then the return address.
fn translate_rtr(ctx: &mut TranslatorContext) -> Result<Outcome, CoreError> {
    let a7 = hostreg::A7;
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::ldrh_uoff(t, a7, 0));
    ctx.emit(a64::rev16(t, t));
    let cc = ctx.modify_cc()?;
    let t2 = ctx.alloc_temp()?;
    ctx.emit(a64::rbit(t2, t));
    ctx.emit(a64::bfxil(t, t2, 30, 2));
    ctx.emit(a64::bfi(cc, t, 0, 5));
    ctx.regs.free_temp(t2);
    ctx.emit(a64::ldur(t, a7, 2));
    ctx.emit(a64::rev(t, t));
    ctx.emit(a64::mov_reg(hostreg::PC, t));
    ctx.emit(a64::add_imm(a7, a7, 6));
    ctx.regs.free_temp(t);
    ctx.pc_rel = 0;
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// RTE: restore SR and PC from the supervisor frame.
fn translate_rte(ctx: &mut TranslatorContext) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    logic::emit_privilege_check(ctx, insn_pc)?;

    let a7 = hostreg::A7;
    let cc = ctx.modify_cc()?;
    let old = ctx.alloc_temp()?;
    ctx.emit(a64::mov_reg(old, cc));

    // New SR from the frame, into host order.
    let sr = ctx.alloc_temp()?;
    ctx.emit(a64::ldrh_uoff(sr, a7, 0));
    ctx.emit(a64::rev16(sr, sr));
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::rbit(t, sr));
    ctx.emit(a64::bfxil(sr, t, 30, 2));

    // Return PC.
    ctx.emit(a64::ldur(t, a7, 2));
    ctx.emit(a64::rev(t, t));
    ctx.emit(a64::mov_reg(hostreg::PC, t));

    // Frame format decides the frame length: format 2 carries an extra
    // instruction-address long word.
    ctx.emit(a64::ldrh_uoff(t, a7, 6));
    ctx.emit(a64::rev16(t, t));
    ctx.emit(a64::lsr_imm(t, t, 12));
    ctx.emit(a64::cmp_imm(t, 2));
    ctx.emit(a64::cset(t, a64::cc::EQ));
    ctx.emit(a64::add_imm(a7, a7, 8));
    ctx.emit(a64::add_reg(a7, a7, t, a64::Shift::Lsl, 2));

    ctx.emit(a64::mov_reg(cc, sr));
    ctx.regs.free_temp(t);
    ctx.regs.free_temp(sr);
    logic::emit_sr_write_tail(ctx, old)?;
    ctx.regs.free_temp(old);

    ctx.pc_rel = 0;
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// RTD #d16.
fn translate_rtd(ctx: &mut TranslatorContext) -> Result<Outcome, CoreError> {
    let d16 = ctx.read_ext_word() as i16 as i32;
    let a7 = hostreg::A7;
    let t = ctx.alloc_temp()?;
    ctx.emit_load_be(t, a7, OpSize::Long);
    ctx.emit(a64::mov_reg(hostreg::PC, t));
    ctx.regs.free_temp(t);
    ctx.emit_add_const(a7, a7, 4 + d16)?;
    ctx.pc_rel = 0;
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// TRAP #n.
fn translate_trap(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let n = (op & 0xf) as u32;
    let next = ctx.mpc;
    let mut seq = Vec::new();
    ctx.regs.flush_cc(&mut seq);
    ctx.emit_all(seq);
    ctx.flush_pc();
    emit_exception(ctx, vector::TRAP_BASE + n, next)?;
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// TRAPV.
fn translate_trapv(ctx: &mut TranslatorContext) -> Result<Outcome, CoreError> {
    let next = ctx.mpc;
    let cc = ctx.get_cc()?;
    ctx.get_ctx_reg()?;
    let loc = ctx.body_len();
    ctx.emit(a64::tbz(cc, HB_V, 0));
    ctx.exit_stub(FixupKind::TestBranch, loc, |c| {
        emit_exception(c, vector::TRAPV, next)?;
        emit_stub_exit(c)
    })?;
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// STOP #imm: load SR, flag the core stopped, and hand control back.
/// The dispatcher idles on the flag until an interrupt is injected.
fn translate_stop(ctx: &mut TranslatorContext) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    logic::emit_privilege_check(ctx, insn_pc)?;
    let imm = ctx.read_ext_word();
    let next = ctx.mpc;

    let cc = ctx.modify_cc()?;
    let old = ctx.alloc_temp()?;
    ctx.emit(a64::mov_reg(old, cc));
    ctx.emit_all(a64::mov_imm32(cc, crate::state::swap_cv(imm) as u32));
    logic::emit_sr_write_tail(ctx, old)?;
    ctx.regs.free_temp(old);

    let ctxr = ctx.get_ctx_reg()?;
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::movz(t, 1, 0));
    ctx.emit(a64::str_uoff(t, ctxr, ctxoff::STOPPED));
    ctx.regs.free_temp(t);

    ctx.set_pc_const(next);
    ctx.push_stop();
    Ok(Outcome::Stop)
}

/// RESET: pulse the external reset line. The bus side is external;
/// nothing to do in the core beyond the privilege check.
fn translate_reset(ctx: &mut TranslatorContext) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    logic::emit_privilege_check(ctx, insn_pc)?;
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}
