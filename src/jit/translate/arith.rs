//! Integer arithmetic: ADD/SUB/CMP families, the quick forms, the
//! extend forms, multiply and divide.

use crate::emit::a64::{self, Shift};
use crate::emit::{FixupKind, hostreg};
use crate::error::CoreError;
use crate::jit::flags::{FLAG_NZVC, FLAG_X};


use super::ea::AddressingMode;
use super::{OpSize, Operand, Outcome, TranslatorContext, flow, logic};

/// Kind of flag-setting binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alu {
    Add,
    Sub,
}

impl TranslatorContext<'_> {
    /// Sized add/subtract with correct host flags: byte and word
    /// operands are shifted to the top of the register so carry and
    /// overflow fall out of the host operation naturally. `d` is
    /// destroyed and receives the sized result.
    pub fn emit_alu_sized(&mut self, alu: Alu, d: u8, s: u8, size: OpSize) {
        let sh = 32 - size.bits();
        if sh == 0 {
            match alu {
                Alu::Add => self.emit(a64::adds_reg(d, d, s, Shift::Lsl, 0)),
                Alu::Sub => self.emit(a64::subs_reg(d, d, s, Shift::Lsl, 0)),
            }
        } else {
            self.emit(a64::lsl_imm(d, d, sh));
            match alu {
                Alu::Add => self.emit(a64::adds_reg(d, d, s, Shift::Lsl, sh)),
                Alu::Sub => self.emit(a64::subs_reg(d, d, s, Shift::Lsl, sh)),
            }
            self.emit(a64::lsr_imm(d, d, sh));
        }
    }

    /// Sized compare leaving only host flags (no result).
    pub fn emit_cmp_sized(&mut self, d: u8, s: u8, size: OpSize) -> Result<(), CoreError> {
        let sh = 32 - size.bits();
        if sh == 0 {
            self.emit(a64::cmp_reg(d, s));
        } else {
            let t = self.alloc_temp()?;
            self.emit(a64::lsl_imm(t, d, sh));
            self.emit(a64::subs_reg(31, t, s, Shift::Lsl, sh));
            self.regs.free_temp(t);
        }
        Ok(())
    }
}

/// ADD (line D) and SUB (line 9) share everything but the operation.
fn translate_addsub(
    ctx: &mut TranslatorContext,
    op: u16,
    alu: Alu,
) -> Result<Outcome, CoreError> {
    let reg = ((op >> 9) & 7) as u8;
    let opmode = (op >> 6) & 7;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;

    // ADDA/SUBA: full-width address arithmetic, no flags.
    if opmode == 3 || opmode == 7 {
        let size = if opmode == 3 { OpSize::Word } else { OpSize::Long };
        let src = ctx.resolve_ea(mode, size)?;
        let s = ctx.emit_load_value(src, size)?;
        if size == OpSize::Word {
            ctx.emit(a64::sxth(s, s));
        }
        let an = hostreg::a(reg);
        match alu {
            Alu::Add => ctx.emit(a64::add_reg(an, an, s, Shift::Lsl, 0)),
            Alu::Sub => ctx.emit(a64::sub_reg(an, an, s, Shift::Lsl, 0)),
        }
        ctx.regs.free_temp(s);
        ctx.free_operand(src);
        ctx.advance_insn_pc();
        return Ok(Outcome::Continue);
    }

    // ADDX/SUBX.
    if opmode >= 4 && (op & 0x30) == 0 {
        let size = OpSize::from_bits(opmode).ok_or(CoreError::TranslatorBug("addx size"))?;
        return translate_x_op(ctx, op, alu, size);
    }

    let size = OpSize::from_bits(opmode & 3).ok_or(CoreError::TranslatorBug("addsub size"))?;
    let needed = ctx.flags_needed();
    let to_ea = opmode >= 4;

    if to_ea {
        // Dn op <ea> -> <ea>
        let dst = ctx.resolve_ea(mode, size)?;
        let d = ctx.emit_load_value(dst, size)?;
        let s = ctx.emit_load_value(Operand::DataReg(reg), size)?;
        ctx.emit_alu_sized(alu, d, s, size);
        ctx.emit_flag_update(needed & (FLAG_NZVC | FLAG_X), alu == Alu::Sub)?;
        ctx.emit_store_result(dst, d, size)?;
        ctx.regs.free_temp(s);
        ctx.regs.free_temp(d);
        ctx.free_operand(dst);
    } else {
        // <ea> op Dn -> Dn
        let src = ctx.resolve_ea(mode, size)?;
        let s = ctx.emit_load_value(src, size)?;
        let d = ctx.emit_load_value(Operand::DataReg(reg), size)?;
        ctx.emit_alu_sized(alu, d, s, size);
        ctx.emit_flag_update(needed & (FLAG_NZVC | FLAG_X), alu == Alu::Sub)?;
        ctx.emit_store_dreg(reg, d, size);
        ctx.regs.free_temp(d);
        ctx.regs.free_temp(s);
        ctx.free_operand(src);
    }

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// ADDX/SUBX, register-to-register or the -(Ay),-(Ax) memory form.
fn translate_x_op(
    ctx: &mut TranslatorContext,
    op: u16,
    alu: Alu,
    size: OpSize,
) -> Result<Outcome, CoreError> {
    let rx = ((op >> 9) & 7) as u8;
    let ry = (op & 7) as u8;
    let memory = op & 0x08 != 0;

    let (dst, src) = if memory {
        let s = ctx.resolve_ea(AddressingMode::PreDecrement(ry), size)?;
        let d = ctx.resolve_ea(AddressingMode::PreDecrement(rx), size)?;
        (d, s)
    } else {
        (Operand::DataReg(rx), Operand::DataReg(ry))
    };

    let d = ctx.emit_load_value(dst, size)?;
    let s = ctx.emit_load_value(src, size)?;

    // Seed the host carry from X (inverted for subtraction, where the
    // host borrow convention is the complement of the guest's).
    let cc = ctx.get_cc()?;
    let t = ctx.alloc_temp()?;
    ctx.emit(a64::ubfx(t, cc, super::HB_X, 1));
    if alu == Alu::Sub {
        ctx.emit(a64::eor_imm(t, t, 1));
    }
    ctx.emit(a64::lsl_imm(t, t, 29));
    ctx.emit(a64::msr(crate::emit::a64::SysReg::Nzcv, t));
    ctx.regs.free_temp(t);

    let sh = 32 - size.bits();
    if sh != 0 {
        ctx.emit(a64::lsl_imm(d, d, sh));
        ctx.emit(a64::lsl_imm(s, s, sh));
    }
    match alu {
        Alu::Add => ctx.emit(a64::adcs(d, d, s)),
        Alu::Sub => ctx.emit(a64::sbcs(d, d, s)),
    }
    if sh != 0 {
        ctx.emit(a64::lsr_imm(d, d, sh));
    }
    ctx.emit_flag_update_accumulate_z(FLAG_NZVC | FLAG_X, alu == Alu::Sub)?;

    ctx.emit_store_result(dst, d, size)?;
    ctx.regs.free_temp(s);
    ctx.regs.free_temp(d);
    ctx.free_operand(src);
    ctx.free_operand(dst);

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

pub(super) fn translate_add(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    translate_addsub(ctx, op, Alu::Add)
}

pub(super) fn translate_sub(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    translate_addsub(ctx, op, Alu::Sub)
}

/// Line B: CMP, CMPA, CMPM, EOR.
pub(super) fn translate_lineb(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let reg = ((op >> 9) & 7) as u8;
    let opmode = (op >> 6) & 7;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    match opmode {
        0..=2 => {
            // CMP <ea>,Dn
            let size = OpSize::from_bits(opmode).unwrap();
            let src = ctx.resolve_ea(mode, size)?;
            let s = ctx.emit_load_value(src, size)?;
            let d = ctx.emit_load_value(Operand::DataReg(reg), size)?;
            ctx.emit_cmp_sized(d, s, size)?;
            ctx.emit_flag_update(needed & FLAG_NZVC, true)?;
            ctx.regs.free_temp(d);
            ctx.regs.free_temp(s);
            ctx.free_operand(src);
        }
        3 | 7 => {
            // CMPA <ea>,An
            let size = if opmode == 3 { OpSize::Word } else { OpSize::Long };
            let src = ctx.resolve_ea(mode, size)?;
            let s = ctx.emit_load_value(src, size)?;
            if size == OpSize::Word {
                ctx.emit(a64::sxth(s, s));
            }
            ctx.emit(a64::cmp_reg(hostreg::a(reg), s));
            ctx.emit_flag_update(needed & FLAG_NZVC, true)?;
            ctx.regs.free_temp(s);
            ctx.free_operand(src);
        }
        _ => {
            let size = OpSize::from_bits(opmode).unwrap();
            if (op & 0x38) == 0x08 {
                // CMPM (Ay)+,(Ax)+
                let src = ctx.resolve_ea(AddressingMode::PostIncrement((op & 7) as u8), size)?;
                let dst = ctx.resolve_ea(AddressingMode::PostIncrement(reg), size)?;
                let s = ctx.emit_load_value(src, size)?;
                let d = ctx.emit_load_value(dst, size)?;
                ctx.emit_cmp_sized(d, s, size)?;
                ctx.emit_flag_update(needed & FLAG_NZVC, true)?;
                ctx.regs.free_temp(d);
                ctx.regs.free_temp(s);
                ctx.free_operand(dst);
                ctx.free_operand(src);
            } else {
                // EOR Dn,<ea>
                return logic::translate_eor(ctx, op, size);
            }
        }
    }

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// Line 5: ADDQ/SUBQ, Scc, DBcc, TRAPcc.
pub(super) fn translate_line5(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    if (op & 0x00c0) == 0x00c0 {
        return match op & 0x38 {
            0x08 => flow::translate_dbcc(ctx, op),
            0x38 if (op & 7) > 1 => flow::translate_trapcc(ctx, op),
            _ => logic::translate_scc(ctx, op),
        };
    }

    let mut data = ((op >> 9) & 7) as u32;
    if data == 0 {
        data = 8;
    }
    let subtract = op & 0x0100 != 0;
    let size = OpSize::from_bits(op >> 6).ok_or(CoreError::TranslatorBug("quick size"))?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;

    // Address-register destination: whole register, no flags.
    if let AddressingMode::AddressDirect(n) = mode {
        let an = hostreg::a(n);
        if subtract {
            ctx.emit(a64::sub_imm(an, an, data));
        } else {
            ctx.emit(a64::add_imm(an, an, data));
        }
        ctx.advance_insn_pc();
        return Ok(Outcome::Continue);
    }

    let needed = ctx.flags_needed();
    let dst = ctx.resolve_ea(mode, size)?;
    let d = ctx.emit_load_value(dst, size)?;
    let s = ctx.alloc_temp()?;
    ctx.emit(a64::movz(s, data as u16, 0));
    ctx.emit_alu_sized(if subtract { Alu::Sub } else { Alu::Add }, d, s, size);
    ctx.emit_flag_update(needed & (FLAG_NZVC | FLAG_X), subtract)?;
    ctx.emit_store_result(dst, d, size)?;
    ctx.regs.free_temp(s);
    ctx.regs.free_temp(d);
    ctx.free_operand(dst);

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// Line 8: OR, DIVU/DIVS.W, SBCD.
pub(super) fn translate_line8(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    if (op & 0x01f0) == 0x0100 {
        return super::bits::translate_sbcd(ctx, op);
    }
    if (op & 0x01c0) == 0x00c0 {
        return translate_div_word(ctx, op, /*signed=*/ false);
    }
    if (op & 0x01c0) == 0x01c0 {
        return translate_div_word(ctx, op, /*signed=*/ true);
    }
    logic::translate_bitwise(ctx, op, logic::Bitwise::Or)
}

/// DIVU.W / DIVS.W: 32/16 divide, quotient and remainder packed into
/// the data register. Divide by zero raises the guest exception
/// through a side exit.
fn translate_div_word(
    ctx: &mut TranslatorContext,
    op: u16,
    signed: bool,
) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    let reg = ((op >> 9) & 7) as u8;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let src = ctx.resolve_ea(mode, OpSize::Word)?;
    let s = ctx.emit_load_value(src, OpSize::Word)?;
    if signed {
        ctx.emit(a64::sxth(s, s));
    }

    // The exception stub reads CC and the context pointer; make sure
    // both already live in registers on the main path.
    ctx.get_cc()?;
    ctx.get_ctx_reg()?;
    let zloc = ctx.body_len();
    ctx.emit(a64::cbz(s, 0));
    ctx.exit_stub(FixupKind::CondBranch, zloc, |c| {
        flow::emit_exception(c, flow::vector::ZERO_DIVIDE, insn_pc.wrapping_add(c.insn_bytes()))?;
        flow::emit_stub_exit(c)
    })?;

    let dn = hostreg::d(reg);
    let q = ctx.alloc_temp()?;
    let rem = ctx.alloc_temp()?;
    if signed {
        ctx.emit(a64::sdiv(q, dn, s));
    } else {
        ctx.emit(a64::udiv(q, dn, s));
    }
    ctx.emit(a64::msub(rem, q, s, dn));

    // Overflow: quotient does not fit in 16 bits. The register is left
    // untouched, V is set.
    let t = ctx.alloc_temp()?;
    if signed {
        ctx.emit(a64::sxth(t, q));
        ctx.emit(a64::cmp_reg(t, q));
    } else {
        ctx.emit(a64::lsr_imm(t, q, 16));
        ctx.emit(a64::cmp_imm(t, 0));
    }
    ctx.regs.free_temp(t);
    let br = ctx.body_len();
    ctx.emit(a64::b_cond(a64::cc::NE, 0));

    // Normal result: remainder in the upper word, quotient below.
    ctx.emit(a64::uxth(q, q));
    ctx.emit(a64::bfi(q, rem, 16, 16));
    ctx.emit(a64::mov_reg(dn, q));
    ctx.emit_nz_from_value(q, OpSize::Word, needed & FLAG_NZVC)?;
    let done = ctx.body_len();
    ctx.emit(a64::b_cond(a64::cc::AL, 0));

    // Overflow path: set V, clear C.
    ctx.patch_local(br, FixupKind::CondBranch, ctx.body_len());
    ctx.emit_flag_set(crate::jit::flags::FLAG_V)?;
    ctx.emit_flag_clear(crate::jit::flags::FLAG_C)?;

    let end = ctx.body_len();
    ctx.patch_local(done, FixupKind::CondBranch, end);

    ctx.regs.free_temp(rem);
    ctx.regs.free_temp(q);
    ctx.regs.free_temp(s);
    ctx.free_operand(src);

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// MULU.W / MULS.W.
pub(super) fn translate_mul_word(
    ctx: &mut TranslatorContext,
    op: u16,
    signed: bool,
) -> Result<Outcome, CoreError> {
    let reg = ((op >> 9) & 7) as u8;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let src = ctx.resolve_ea(mode, OpSize::Word)?;
    let s = ctx.emit_load_value(src, OpSize::Word)?;
    let d = ctx.emit_load_value(Operand::DataReg(reg), OpSize::Word)?;
    if signed {
        ctx.emit(a64::sxth(s, s));
        ctx.emit(a64::sxth(d, d));
    }
    ctx.emit(a64::mul(d, d, s));
    ctx.emit(a64::mov_reg(hostreg::d(reg), d));
    ctx.emit_nz_from_value(d, OpSize::Long, needed & FLAG_NZVC)?;
    ctx.regs.free_temp(d);
    ctx.regs.free_temp(s);
    ctx.free_operand(src);

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// 68020 MULU.L/MULS.L with the extension word.
pub(super) fn translate_mul_long(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let ext = ctx.read_ext_word();
    let dl = ((ext >> 12) & 7) as u8;
    let dh = (ext & 7) as u8;
    let signed = ext & 0x0800 != 0;
    let wide = ext & 0x0400 != 0;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let src = ctx.resolve_ea(mode, OpSize::Long)?;
    let s = ctx.emit_load_value(src, OpSize::Long)?;
    let dlr = hostreg::d(dl);

    if wide {
        let t = ctx.alloc_temp()?;
        if signed {
            ctx.emit(a64::smull(t, dlr, s));
        } else {
            ctx.emit(a64::umull(t, dlr, s));
        }
        ctx.emit(a64::mov_reg(dlr, t));
        ctx.emit(a64::lsr_imm_64(t, t, 32));
        ctx.emit(a64::mov_reg(hostreg::d(dh), t));
        // N/Z reflect the 64-bit product: N from the high word, Z from
        // the whole thing.
        if needed & FLAG_NZVC != 0 {
            let z = ctx.alloc_temp()?;
            ctx.emit(a64::orr_reg(z, dlr, hostreg::d(dh), Shift::Lsl, 0));
            ctx.emit(a64::cmp_imm(z, 0));
            ctx.emit_flag_update(crate::jit::flags::FLAG_Z & needed, false)?;
            ctx.emit(a64::cmp_imm(hostreg::d(dh), 0));
            ctx.emit_flag_update(crate::jit::flags::FLAG_N & needed, false)?;
            ctx.emit_flag_clear(needed & (crate::jit::flags::FLAG_V | crate::jit::flags::FLAG_C))?;
            ctx.regs.free_temp(z);
        }
        ctx.regs.free_temp(t);
    } else {
        ctx.emit(a64::mul(dlr, dlr, s));
        ctx.emit_nz_from_value(dlr, OpSize::Long, needed & FLAG_NZVC)?;
    }

    ctx.regs.free_temp(s);
    ctx.free_operand(src);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// 68020 DIVU.L/DIVS.L.
pub(super) fn translate_div_long(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    let ext = ctx.read_ext_word();
    let dq = ((ext >> 12) & 7) as u8;
    let dr = (ext & 7) as u8;
    let signed = ext & 0x0800 != 0;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let needed = ctx.flags_needed();

    let src = ctx.resolve_ea(mode, OpSize::Long)?;
    let s = ctx.emit_load_value(src, OpSize::Long)?;

    ctx.get_cc()?;
    ctx.get_ctx_reg()?;
    let zloc = ctx.body_len();
    ctx.emit(a64::cbz(s, 0));
    ctx.exit_stub(FixupKind::CondBranch, zloc, |c| {
        flow::emit_exception(c, flow::vector::ZERO_DIVIDE, insn_pc.wrapping_add(c.insn_bytes()))?;
        flow::emit_stub_exit(c)
    })?;

    let dqr = hostreg::d(dq);
    let q = ctx.alloc_temp()?;
    if signed {
        ctx.emit(a64::sdiv(q, dqr, s));
    } else {
        ctx.emit(a64::udiv(q, dqr, s));
    }
    if dr != dq {
        ctx.emit(a64::msub(hostreg::d(dr), q, s, dqr));
    }
    ctx.emit(a64::mov_reg(dqr, q));
    ctx.emit_nz_from_value(q, OpSize::Long, needed & FLAG_NZVC)?;
    ctx.regs.free_temp(q);
    ctx.regs.free_temp(s);
    ctx.free_operand(src);

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// CHK <ea>,Dn: bound check raising the guest exception on failure.
pub(super) fn translate_chk(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    let reg = ((op >> 9) & 7) as u8;
    let size = if op & 0x0080 != 0 { OpSize::Word } else { OpSize::Long };
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;

    let src = ctx.resolve_ea(mode, size)?;
    let bound = ctx.emit_load_value(src, size)?;
    let d = ctx.emit_load_value(Operand::DataReg(reg), size)?;
    if size == OpSize::Word {
        ctx.emit(a64::sxth(bound, bound));
        ctx.emit(a64::sxth(d, d));
    }

    ctx.get_cc()?;
    ctx.get_ctx_reg()?;
    let low = ctx.body_len();
    ctx.emit(a64::tbnz(d, 31, 0));
    ctx.emit(a64::cmp_reg(d, bound));
    let high = ctx.body_len();
    ctx.emit(a64::b_cond(a64::cc::GT, 0));
    ctx.double_exit_stub(
        (FixupKind::TestBranch, low),
        (FixupKind::CondBranch, high),
        |c| {
            flow::emit_exception(c, flow::vector::CHK, insn_pc.wrapping_add(c.insn_bytes()))?;
            flow::emit_stub_exit(c)
        },
    )?;

    ctx.regs.free_temp(d);
    ctx.regs.free_temp(bound);
    ctx.free_operand(src);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}
