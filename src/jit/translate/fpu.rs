//! Line F: the 68881/68882 floating-point unit, mapped onto IEEE
//! doubles.
//!
//! Arithmetic uses the host FP pipeline with the rounding mode slaved
//! to the guest FPCR. Transcendentals and the 96-bit extended memory
//! format go through typed helper traps serviced by the trap layer,
//! the same channel the validation traps use.

use crate::emit::a64::{self, SysReg};
use crate::emit::{FixupKind, hostreg};
use crate::error::CoreError;
use crate::fault::fptrap;
use crate::state::ctx as ctxoff;

use super::ea::AddressingMode;
use super::{OpSize, Operand, Outcome, TranslatorContext, flow};

// FPSR condition-code bit positions.
const FPSR_N: u8 = 27;
const FPSR_Z: u8 = 26;
const FPSR_NAN: u8 = 24;

pub(super) fn translate_linef(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    if ctx.cfg.nofpu {
        return flow::translate_unimplemented(ctx, op, flow::vector::LINE_F);
    }
    // Coprocessor id must be 1 (the FPU).
    if (op >> 9) & 7 != 1 {
        return flow::translate_unimplemented(ctx, op, flow::vector::LINE_F);
    }

    match (op >> 6) & 7 {
        0 => translate_general(ctx, op),
        1 => {
            // FScc / FDBcc / FTRAPcc
            if (op & 0x38) == 0x08 || (op & 0x38) == 0x38 {
                flow::translate_unimplemented(ctx, op, flow::vector::LINE_F)
            } else {
                translate_fscc(ctx, op)
            }
        }
        2 | 3 => translate_fbcc(ctx, op),
        4 => translate_fsave(ctx, op),
        5 => translate_frestore(ctx, op),
        _ => flow::translate_unimplemented(ctx, op, flow::vector::LINE_F),
    }
}

impl TranslatorContext<'_> {
    /// Slave the host rounding mode to the guest FPCR, once per unit.
    fn emit_fpu_rounding(&mut self) -> Result<(), CoreError> {
        if self.fpu_rounding_init {
            return Ok(());
        }
        self.fpu_rounding_init = true;
        let g = self.get_fpcr()?;
        let t = self.alloc_temp()?;
        let t2 = self.alloc_temp()?;
        // Guest RND (bits 4-5: RN/RZ/RM/RP) to host RMode (RN/RP/RM/RZ)
        // is the negation modulo 4.
        self.emit(a64::ubfx(t, g, 4, 2));
        self.emit(a64::neg(t, t));
        self.emit(a64::and_imm(t, t, 3));
        self.emit(a64::mrs(t2, SysReg::Fpcr));
        self.emit(a64::bfi(t2, t, 22, 2));
        self.emit(a64::msr(SysReg::Fpcr, t2));
        self.regs.free_temp(t2);
        self.regs.free_temp(t);
        Ok(())
    }

    /// Update the FPSR condition byte from the value in FP register
    /// `freg` (N, Z, NaN; infinity shares the NaN path of FCMP with
    /// itself and is left clear).
    fn emit_fpsr_update(&mut self, freg: u8) -> Result<(), CoreError> {
        let fpsr = self.modify_fpsr()?;
        let t = self.alloc_temp()?;
        self.emit(a64::fcmp_d_zero(freg));
        self.emit(a64::mrs(t, SysReg::Nzcv));
        self.emit(a64::lsr_imm(t, t, 28));
        // t[3]=N, t[2]=Z, t[0]=V (unordered, i.e. NaN).
        self.emit(a64::bic_imm(fpsr, fpsr, 0x0f00_0000));
        let bit = self.alloc_temp()?;
        self.emit(a64::ubfx(bit, t, 3, 1));
        self.emit(a64::bfi(fpsr, bit, FPSR_N, 1));
        self.emit(a64::ubfx(bit, t, 2, 1));
        self.emit(a64::bfi(fpsr, bit, FPSR_Z, 1));
        self.emit(a64::ubfx(bit, t, 0, 1));
        self.emit(a64::bfi(fpsr, bit, FPSR_NAN, 1));
        self.regs.free_temp(bit);
        self.regs.free_temp(t);
        Ok(())
    }

    /// Record the faulting-instruction address for the FPU.
    fn emit_fpiar(&mut self) -> Result<(), CoreError> {
        let pc = self.last_insn_start();
        let ctxr = self.get_ctx_reg()?;
        let t = self.alloc_temp()?;
        self.emit_all(a64::mov_imm32(t, pc));
        self.emit(a64::str_uoff(t, ctxr, ctxoff::FPIAR));
        self.regs.free_temp(t);
        Ok(())
    }

    /// Helper trap: d0 (and d1) carry operands, d0 the result.
    fn emit_fp_helper(&mut self, id: u16) {
        self.emit(a64::hlt(fptrap::BASE | id));
    }
}

/// Resolve a memory operand for the wide FP formats (8- and 12-byte
/// elements), stepping post-increment and pre-decrement by the real
/// element size.
fn resolve_fp_mem(
    ctx: &mut TranslatorContext,
    mode: AddressingMode,
    bytes: u32,
) -> Result<Operand, CoreError> {
    match mode {
        AddressingMode::PostIncrement(n) => {
            let an = hostreg::a(n);
            let t = ctx.alloc_temp()?;
            ctx.emit(a64::mov_reg(t, an));
            ctx.emit(a64::add_imm(an, an, bytes));
            Ok(Operand::Mem { reg: t, owned: true })
        }
        AddressingMode::PreDecrement(n) => {
            let an = hostreg::a(n);
            ctx.emit(a64::sub_imm(an, an, bytes));
            Ok(Operand::Mem {
                reg: an,
                owned: false,
            })
        }
        _ => ctx.resolve_ea(mode, OpSize::Long),
    }
}

/// Load an FP source operand into the given host FP register.
fn emit_fp_load(
    ctx: &mut TranslatorContext,
    op: u16,
    format: u16,
    dst_freg: u8,
) -> Result<(), CoreError> {
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    match format {
        0 | 4 | 6 => {
            // Integer sources: long, word, byte.
            let size = match format {
                0 => OpSize::Long,
                4 => OpSize::Word,
                _ => OpSize::Byte,
            };
            let src = ctx.resolve_ea(mode, size)?;
            let v = ctx.emit_load_value(src, size)?;
            match size {
                OpSize::Word => ctx.emit(a64::sxth(v, v)),
                OpSize::Byte => ctx.emit(a64::sxtb(v, v)),
                OpSize::Long => {}
            }
            ctx.emit(a64::scvtf_d_w(dst_freg, v));
            ctx.regs.free_temp(v);
            ctx.free_operand(src);
        }
        1 => {
            // Single precision bits.
            let src = ctx.resolve_ea(mode, OpSize::Long)?;
            let v = ctx.emit_load_value(src, OpSize::Long)?;
            ctx.emit(a64::fmov_s_w(dst_freg, v));
            ctx.emit(a64::fcvt_ds(dst_freg, dst_freg));
            ctx.regs.free_temp(v);
            ctx.free_operand(src);
        }
        5 => {
            // Double precision: eight big-endian bytes.
            let src = resolve_fp_mem(ctx, mode, 8)?;
            let Operand::Mem { reg, .. } = src else {
                return Err(CoreError::TranslatorBug("fp double operand"));
            };
            let t = ctx.alloc_temp()?;
            ctx.emit(a64::ldr64_uoff(t, reg, 0));
            ctx.emit(a64::rev_64(t, t));
            ctx.emit(a64::fmov_d_x(dst_freg, t));
            ctx.regs.free_temp(t);
            ctx.free_operand(src);
        }
        2 | 3 => {
            // Extended and packed decimal via the helper traps: the
            // address goes in x0, the value comes back in d0.
            let src = resolve_fp_mem(ctx, mode, 12)?;
            let Operand::Mem { reg, .. } = src else {
                return Err(CoreError::TranslatorBug("fp extended operand"));
            };
            ctx.emit(a64::mov_reg(hostreg::HELPER_ADDR, reg));
            ctx.emit_fp_helper(if format == 2 {
                fptrap::LOAD96
            } else {
                fptrap::LOAD_PACKED
            });
            if dst_freg != 0 {
                ctx.emit(a64::fmov_d(dst_freg, 0));
            }
            ctx.free_operand(src);
        }
        _ => return Err(CoreError::TranslatorBug("fp source format")),
    }
    Ok(())
}

/// The general opclass: register ops, memory sources, memory
/// destinations, and the FMOVEM forms.
fn translate_general(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let ext = ctx.read_ext_word();
    let opclass = (ext >> 13) & 7;

    match opclass {
        0 | 2 => {
            let opmode = ext & 0x7f;
            if !fp_opmode_supported(opmode) {
                // An opmode this FPU does not provide is a guest-level
                // unimplemented instruction, not a translator fault.
                return flow::translate_unimplemented(ctx, op, flow::vector::LINE_F);
            }
            ctx.emit_fpu_rounding()?;
            ctx.emit_fpiar()?;
            let dst = ((ext >> 7) & 7) as u8;
            let dfreg = hostreg::fp(dst);

            // Source: FP register or memory operand.
            let sfreg = if opclass == 0 {
                hostreg::fp(((ext >> 10) & 7) as u8)
            } else if (ext >> 10) & 7 == 7 {
                // FMOVECR: constant ROM.
                return translate_fmovecr(ctx, ext);
            } else {
                let f = ctx.regs.alloc_fp_temp()?;
                emit_fp_load(ctx, op, (ext >> 10) & 7, f)?;
                f
            };

            let result = translate_fp_op(ctx, opmode, dfreg, sfreg)?;
            if opclass != 0 && sfreg >= hostreg::FP_TEMP_FIRST && sfreg <= hostreg::FP_TEMP_LAST {
                ctx.regs.free_fp_temp(sfreg);
            }
            if let Some(res) = result {
                ctx.regs.set_fp_dirty(dst);
                ctx.emit_fpsr_update(res)?;
            }
            ctx.advance_insn_pc();
            Ok(Outcome::Continue)
        }
        3 => {
            // FMOVE FPn,<ea>
            ctx.emit_fpu_rounding()?;
            ctx.emit_fpiar()?;
            translate_fmove_to_mem(ctx, op, ext)
        }
        4 | 5 => translate_fmovem_control(ctx, op, ext),
        6 | 7 => translate_fmovem_regs(ctx, op, ext),
        _ => flow::translate_unimplemented(ctx, op, flow::vector::LINE_F),
    }
}

/// The opmodes [`translate_fp_op`] knows how to emit.
fn fp_opmode_supported(opmode: u16) -> bool {
    matches!(
        opmode,
        0x00..=0x04
            | 0x06
            | 0x08..=0x0a
            | 0x0c..=0x12
            | 0x14..=0x16
            | 0x18..=0x1a
            | 0x1c..=0x1f
            | 0x20..=0x28
            | 0x38
            | 0x3a
            | 0x41
            | 0x45
            | 0x58
            | 0x5a
            | 0x5c
            | 0x5e
    )
}

/// One FP operation; returns the register whose value defines the
/// condition codes (None for FCMP/FTST, which set them directly).
fn translate_fp_op(
    ctx: &mut TranslatorContext,
    opmode: u16,
    d: u8,
    s: u8,
) -> Result<Option<u8>, CoreError> {
    let monadic_trap = |id: u16| id;
    match opmode {
        0x00 => {
            if d != s {
                ctx.emit(a64::fmov_d(d, s));
            }
            Ok(Some(d))
        }
        0x01 => {
            ctx.emit(a64::frinti_d(d, s));
            Ok(Some(d))
        }
        0x03 => {
            ctx.emit(a64::frintz_d(d, s));
            Ok(Some(d))
        }
        0x04 | 0x41 | 0x45 => {
            ctx.emit(a64::fsqrt_d(d, s));
            Ok(Some(d))
        }
        0x18 | 0x58 | 0x5c => {
            ctx.emit(a64::fabs_d(d, s));
            Ok(Some(d))
        }
        0x1a | 0x5a | 0x5e => {
            ctx.emit(a64::fneg_d(d, s));
            Ok(Some(d))
        }
        0x20 | 0x24 => {
            // FDIV (FSGLDIV rounds to single afterwards).
            ctx.emit(a64::fdiv_d(d, d, s));
            if opmode == 0x24 {
                ctx.emit(a64::fcvt_sd(d, d));
                ctx.emit(a64::fcvt_ds(d, d));
            }
            Ok(Some(d))
        }
        0x22 => {
            ctx.emit(a64::fadd_d(d, d, s));
            Ok(Some(d))
        }
        0x23 | 0x27 => {
            ctx.emit(a64::fmul_d(d, d, s));
            if opmode == 0x27 {
                ctx.emit(a64::fcvt_sd(d, d));
                ctx.emit(a64::fcvt_ds(d, d));
            }
            Ok(Some(d))
        }
        0x28 => {
            ctx.emit(a64::fsub_d(d, d, s));
            Ok(Some(d))
        }
        0x38 => {
            // FCMP: condition codes from d - s.
            let t = ctx.regs.alloc_fp_temp()?;
            ctx.emit(a64::fsub_d(t, d, s));
            ctx.emit_fpsr_update(t)?;
            ctx.regs.free_fp_temp(t);
            Ok(None)
        }
        0x3a => {
            ctx.emit_fpsr_update(s)?;
            Ok(None)
        }
        // Transcendentals and the remainder family go to the runtime
        // helpers: d0 and d1 carry the operands, d0 the result.
        0x02 | 0x06 | 0x08 | 0x09 | 0x0a | 0x0c | 0x0d | 0x0e | 0x0f | 0x10 | 0x11 | 0x12
        | 0x14 | 0x15 | 0x16 | 0x19 | 0x1c | 0x1d | 0x1e | 0x1f => {
            let id = match opmode {
                0x02 => fptrap::SINH,
                0x06 => fptrap::LOGNP1,
                0x08 => fptrap::ETOXM1,
                0x09 => fptrap::TANH,
                0x0a => fptrap::ATAN,
                0x0c => fptrap::ASIN,
                0x0d => fptrap::ATANH,
                0x0e => fptrap::SIN,
                0x0f => fptrap::TAN,
                0x10 => fptrap::ETOX,
                0x11 => fptrap::TWOTOX,
                0x12 => fptrap::TENTOX,
                0x14 => fptrap::LOGN,
                0x15 => fptrap::LOG10,
                0x16 => fptrap::LOG2,
                0x19 => fptrap::COSH,
                0x1c => fptrap::ACOS,
                0x1d => fptrap::COS,
                0x1e => fptrap::GETEXP,
                _ => fptrap::GETMAN,
            };
            if s != 0 {
                ctx.emit(a64::fmov_d(0, s));
            }
            ctx.emit_fp_helper(monadic_trap(id));
            ctx.emit(a64::fmov_d(d, 0));
            Ok(Some(d))
        }
        0x21 | 0x25 | 0x26 => {
            let id = match opmode {
                0x21 => fptrap::FMOD,
                0x25 => fptrap::FREM,
                _ => fptrap::FSCALE,
            };
            ctx.emit(a64::fmov_d(0, d));
            if s != 1 {
                ctx.emit(a64::fmov_d(1, s));
            }
            ctx.emit_fp_helper(id);
            ctx.emit(a64::fmov_d(d, 0));
            Ok(Some(d))
        }
        _ => {
            log::warn!(target: "jit", "unsupported FPU opmode {opmode:#x}");
            Err(CoreError::TranslatorBug("fpu opmode"))
        }
    }
}

/// FMOVECR: a small slice of the constant ROM.
fn translate_fmovecr(ctx: &mut TranslatorContext, ext: u16) -> Result<Outcome, CoreError> {
    let dst = ((ext >> 7) & 7) as u8;
    let rom = ext & 0x7f;
    let value: f64 = match rom {
        0x00 => std::f64::consts::PI,
        0x0b => std::f64::consts::LOG10_2,
        0x0c => std::f64::consts::E,
        0x0d => std::f64::consts::LOG2_E,
        0x0e => std::f64::consts::LOG10_E,
        0x0f => 0.0,
        0x30 => std::f64::consts::LN_2,
        0x31 => std::f64::consts::LN_10,
        0x32 => 1.0,
        0x33 => 10.0,
        0x34 => 1e2,
        0x35 => 1e4,
        0x36 => 1e8,
        0x37 => 1e16,
        _ => 0.0,
    };
    let dfreg = hostreg::fp(dst);
    let t = ctx.alloc_temp()?;
    ctx.emit_all(a64::mov_imm64(t, value.to_bits()));
    ctx.emit(a64::fmov_d_x(dfreg, t));
    ctx.regs.free_temp(t);
    ctx.regs.set_fp_dirty(dst);
    ctx.emit_fpsr_update(dfreg)?;
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// FMOVE FPn,<ea> with destination rounding.
fn translate_fmove_to_mem(
    ctx: &mut TranslatorContext,
    op: u16,
    ext: u16,
) -> Result<Outcome, CoreError> {
    let format = (ext >> 10) & 7;
    let src = hostreg::fp(((ext >> 7) & 7) as u8);
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;

    match format {
        0 | 4 | 6 => {
            let size = match format {
                0 => OpSize::Long,
                4 => OpSize::Word,
                _ => OpSize::Byte,
            };
            let f = ctx.regs.alloc_fp_temp()?;
            ctx.emit(a64::frinti_d(f, src));
            let v = ctx.alloc_temp()?;
            ctx.emit(a64::fcvtzs_w_d(v, f));
            ctx.regs.free_fp_temp(f);
            let dst = ctx.resolve_ea(mode, size)?;
            ctx.emit_store_result(dst, v, size)?;
            ctx.regs.free_temp(v);
            ctx.free_operand(dst);
        }
        1 => {
            let f = ctx.regs.alloc_fp_temp()?;
            ctx.emit(a64::fcvt_sd(f, src));
            let v = ctx.alloc_temp()?;
            ctx.emit(a64::fmov_w_s(v, f));
            ctx.regs.free_fp_temp(f);
            let dst = ctx.resolve_ea(mode, OpSize::Long)?;
            ctx.emit_store_result(dst, v, OpSize::Long)?;
            ctx.regs.free_temp(v);
            ctx.free_operand(dst);
        }
        5 => {
            let dst = resolve_fp_mem(ctx, mode, 8)?;
            let Operand::Mem { reg, .. } = dst else {
                return Err(CoreError::TranslatorBug("fp double store"));
            };
            let t = ctx.alloc_temp()?;
            ctx.emit(a64::fmov_x_d(t, src));
            ctx.emit(a64::rev_64(t, t));
            ctx.emit(a64::str64_uoff(t, reg, 0));
            ctx.regs.free_temp(t);
            ctx.free_operand(dst);
        }
        2 | 3 => {
            let dst = resolve_fp_mem(ctx, mode, 12)?;
            let Operand::Mem { reg, .. } = dst else {
                return Err(CoreError::TranslatorBug("fp extended store"));
            };
            ctx.emit(a64::mov_reg(hostreg::HELPER_ADDR, reg));
            if src != 0 {
                ctx.emit(a64::fmov_d(0, src));
            }
            ctx.emit_fp_helper(if format == 2 {
                fptrap::SAVE96
            } else {
                fptrap::SAVE_PACKED
            });
            ctx.free_operand(dst);
        }
        _ => return flow::translate_unimplemented(ctx, op, flow::vector::LINE_F),
    }

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// FMOVEM of FPCR/FPSR/FPIAR.
fn translate_fmovem_control(
    ctx: &mut TranslatorContext,
    op: u16,
    ext: u16,
) -> Result<Outcome, CoreError> {
    let to_ea = ext & 0x2000 != 0;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;

    let regs: &[(u16, u32)] = &[
        (1 << 12, ctxoff::FPCR),
        (1 << 11, ctxoff::FPSR),
        (1 << 10, ctxoff::FPIAR),
    ];
    let ctxr = ctx.get_ctx_reg()?;
    // Flush any cached FPCR/FPSR mirror so the context window is
    // current in both directions.
    let mut seq = Vec::new();
    ctx.regs.flush_fpcr(&mut seq);
    ctx.regs.flush_fpsr(&mut seq);
    ctx.emit_all(seq);

    for &(bit, off) in regs {
        if ext & bit == 0 {
            continue;
        }
        if to_ea {
            let t = ctx.alloc_temp()?;
            if off == ctxoff::FPCR {
                ctx.emit(a64::ldrh_uoff(t, ctxr, off));
            } else {
                ctx.emit(a64::ldr_uoff(t, ctxr, off));
            }
            let dst = ctx.resolve_ea(mode, OpSize::Long)?;
            ctx.emit_store_result(dst, t, OpSize::Long)?;
            ctx.free_operand(dst);
            ctx.regs.free_temp(t);
        } else {
            let src = ctx.resolve_ea(mode, OpSize::Long)?;
            let v = ctx.emit_load_value(src, OpSize::Long)?;
            if off == ctxoff::FPCR {
                ctx.emit(a64::strh_uoff(v, ctxr, off));
                // Rounding may have changed.
                ctx.fpu_rounding_init = false;
            } else {
                ctx.emit(a64::str_uoff(v, ctxr, off));
            }
            ctx.regs.free_temp(v);
            ctx.free_operand(src);
        }
    }

    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// FMOVEM of FP data registers, 96-bit extended slots in memory.
fn translate_fmovem_regs(
    ctx: &mut TranslatorContext,
    op: u16,
    ext: u16,
) -> Result<Outcome, CoreError> {
    let to_regs = ext & 0x2000 == 0;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    // Static list only; the dynamic form keeps the list in a data
    // register and is rare enough to trap.
    if ext & 0x0800 != 0 {
        return flow::translate_unimplemented(ctx, op, flow::vector::LINE_F);
    }
    let list = (ext & 0xff) as u8;
    let predec = matches!(mode, AddressingMode::PreDecrement(_));

    let base = ctx.resolve_ea(mode, OpSize::Long)?;
    let Operand::Mem { reg, owned } = base else {
        return Err(CoreError::TranslatorBug("fmovem operand"));
    };
    let cursor = if owned {
        reg
    } else {
        let t = ctx.alloc_temp()?;
        ctx.emit(a64::mov_reg(t, reg));
        t
    };

    // In the predecrement form bit 7 is FP7 and addresses descend; the
    // address register was already dropped by one slot in resolve_ea,
    // correct it to step per element instead.
    if predec {
        let an = match mode {
            AddressingMode::PreDecrement(n) => hostreg::a(n),
            _ => unreachable!(),
        };
        // Undo the long-sized predecrement applied by resolve_ea; the
        // loop below steps one 12-byte slot at a time.
        ctx.emit(a64::add_imm(an, an, 4));
        ctx.emit(a64::mov_reg(cursor, an));
    }

    for i in 0..8u8 {
        let (bit, fp) = if predec {
            (7 - i, 7 - i)
        } else {
            (7 - i, i)
        };
        if list & (1 << bit) == 0 {
            continue;
        }
        let freg = hostreg::fp(fp);
        if to_regs && !predec {
            ctx.emit(a64::mov_reg(hostreg::HELPER_ADDR, cursor));
            ctx.emit_fp_helper(fptrap::LOAD96);
            ctx.emit(a64::fmov_d(freg, 0));
            ctx.regs.set_fp_dirty(fp);
            ctx.emit(a64::add_imm(cursor, cursor, 12));
        } else if predec {
            ctx.emit(a64::sub_imm(cursor, cursor, 12));
            ctx.emit(a64::mov_reg(hostreg::HELPER_ADDR, cursor));
            ctx.emit(a64::fmov_d(0, freg));
            ctx.emit_fp_helper(fptrap::SAVE96);
        } else {
            ctx.emit(a64::mov_reg(hostreg::HELPER_ADDR, cursor));
            ctx.emit(a64::fmov_d(0, freg));
            ctx.emit_fp_helper(fptrap::SAVE96);
            ctx.emit(a64::add_imm(cursor, cursor, 12));
        }
    }

    if predec {
        let an = match mode {
            AddressingMode::PreDecrement(n) => hostreg::a(n),
            _ => unreachable!(),
        };
        ctx.emit(a64::mov_reg(an, cursor));
    } else if let AddressingMode::PostIncrement(n) = mode {
        ctx.emit(a64::mov_reg(hostreg::a(n), cursor));
    }

    ctx.regs.free_temp(cursor);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// Evaluate an FPU conditional predicate into a register (non-zero
/// when the condition holds).
fn emit_fp_predicate(ctx: &mut TranslatorContext, cond: u16) -> Result<u8, CoreError> {
    let fpsr = ctx.get_fpsr()?;
    let nan = ctx.alloc_temp()?;
    let z = ctx.alloc_temp()?;
    let n = ctx.alloc_temp()?;
    ctx.emit(a64::ubfx(nan, fpsr, FPSR_NAN, 1));
    ctx.emit(a64::ubfx(z, fpsr, FPSR_Z, 1));
    ctx.emit(a64::ubfx(n, fpsr, FPSR_N, 1));
    let t = ctx.alloc_temp()?;
    use a64::Shift::Lsl;
    match cond & 0xf {
        0x0 => ctx.emit(a64::movz(t, 0, 0)),
        0x1 => ctx.emit(a64::mov_reg(t, z)),
        0x2 => {
            // OGT
            ctx.emit(a64::orr_reg(t, nan, z, Lsl, 0));
            ctx.emit(a64::orr_reg(t, t, n, Lsl, 0));
            ctx.emit(a64::eor_imm(t, t, 1));
        }
        0x3 => {
            // OGE
            ctx.emit(a64::orr_reg(t, nan, n, Lsl, 0));
            ctx.emit(a64::eor_imm(t, t, 1));
            ctx.emit(a64::orr_reg(t, t, z, Lsl, 0));
        }
        0x4 => {
            // OLT
            ctx.emit(a64::orr_reg(t, nan, z, Lsl, 0));
            ctx.emit(a64::eor_imm(t, t, 1));
            ctx.emit(a64::and_reg(t, t, n, Lsl, 0));
        }
        0x5 => {
            // OLE
            ctx.emit(a64::eor_imm(t, nan, 1));
            ctx.emit(a64::and_reg(t, t, n, Lsl, 0));
            ctx.emit(a64::orr_reg(t, t, z, Lsl, 0));
        }
        0x6 => {
            // OGL
            ctx.emit(a64::orr_reg(t, nan, z, Lsl, 0));
            ctx.emit(a64::eor_imm(t, t, 1));
        }
        0x7 => ctx.emit(a64::eor_imm(t, nan, 1)), // OR
        0x8 => ctx.emit(a64::mov_reg(t, nan)),    // UN
        0x9 => ctx.emit(a64::orr_reg(t, nan, z, Lsl, 0)), // UEQ
        0xa => {
            // UGT
            ctx.emit(a64::orr_reg(t, z, n, Lsl, 0));
            ctx.emit(a64::eor_imm(t, t, 1));
            ctx.emit(a64::orr_reg(t, t, nan, Lsl, 0));
        }
        0xb => {
            // UGE
            ctx.emit(a64::eor_imm(t, n, 1));
            ctx.emit(a64::orr_reg(t, t, z, Lsl, 0));
            ctx.emit(a64::orr_reg(t, t, nan, Lsl, 0));
        }
        0xc => {
            // ULT
            ctx.emit(a64::eor_imm(t, z, 1));
            ctx.emit(a64::and_reg(t, t, n, Lsl, 0));
            ctx.emit(a64::orr_reg(t, t, nan, Lsl, 0));
        }
        0xd => {
            // ULE
            ctx.emit(a64::orr_reg(t, nan, z, Lsl, 0));
            ctx.emit(a64::orr_reg(t, t, n, Lsl, 0));
        }
        0xe => ctx.emit(a64::eor_imm(t, z, 1)), // NE
        _ => ctx.emit(a64::movz(t, 1, 0)),      // T
    }
    ctx.regs.free_temp(n);
    ctx.regs.free_temp(z);
    ctx.regs.free_temp(nan);
    Ok(t)
}

/// FBcc.
fn translate_fbcc(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let cond = op & 0x3f;
    let long = op & 0x0040 != 0;
    let base = ctx.mpc;
    let target = if long {
        let d = ctx.read_ext_long() as i32;
        base.wrapping_add_signed(d)
    } else {
        let d = ctx.read_ext_word() as i16 as i32;
        base.wrapping_add_signed(d)
    };
    let fallthrough = ctx.mpc;
    let here = ctx.last_insn_start();

    if cond & 0xf == 0 && cond & 0x10 == 0 {
        // FBF: never taken.
        ctx.advance_insn_pc();
        return Ok(Outcome::Continue);
    }

    let pred = emit_fp_predicate(ctx, cond)?;
    if target <= here && here - target <= ctx.cfg.inline_range {
        let loc = ctx.body_len();
        ctx.emit(a64::cbz(pred, 0));
        ctx.regs.free_temp(pred);
        ctx.exit_stub(FixupKind::CondBranch, loc, |c| {
            flow::emit_stub_exit_to(c, fallthrough)
        })?;
        let delta = target as i32 - here as i32;
        ctx.advance_pc(delta);
        ctx.mpc = target;
    } else {
        let loc = ctx.body_len();
        ctx.emit(a64::cbnz(pred, 0));
        ctx.regs.free_temp(pred);
        ctx.exit_stub(FixupKind::CondBranch, loc, |c| {
            flow::emit_stub_exit_to(c, target)
        })?;
        ctx.advance_insn_pc();
    }
    Ok(Outcome::Continue)
}

/// FScc <ea>.
fn translate_fscc(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let ext = ctx.read_ext_word();
    let cond = ext & 0x3f;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let dst = ctx.resolve_ea(mode, OpSize::Byte)?;
    let pred = emit_fp_predicate(ctx, cond)?;
    ctx.emit(a64::cmp_imm(pred, 0));
    ctx.emit(a64::csinv(pred, 31, 31, a64::cc::EQ));
    ctx.emit_store_result(dst, pred, OpSize::Byte)?;
    ctx.regs.free_temp(pred);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// FSAVE: write a null idle frame.
fn translate_fsave(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    super::logic::emit_privilege_check(ctx, insn_pc)?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let dst = ctx.resolve_ea(mode, OpSize::Long)?;
    let z = ctx.alloc_temp()?;
    ctx.emit(a64::movz(z, 0, 0));
    ctx.emit_store_result(dst, z, OpSize::Long)?;
    ctx.regs.free_temp(z);
    ctx.free_operand(dst);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}

/// FRESTORE: consume a frame; only the null frame carries no state.
fn translate_frestore(ctx: &mut TranslatorContext, op: u16) -> Result<Outcome, CoreError> {
    let insn_pc = ctx.last_insn_start();
    super::logic::emit_privilege_check(ctx, insn_pc)?;
    let mode = AddressingMode::from_opcode(op)
        .ok_or(CoreError::TranslatorBug("bad addressing mode"))?;
    let src = ctx.resolve_ea(mode, OpSize::Long)?;
    let v = ctx.emit_load_value(src, OpSize::Long)?;
    // A non-null frame would carry internal coprocessor state we do
    // not model; nothing further to restore.
    ctx.regs.free_temp(v);
    ctx.free_operand(src);
    ctx.advance_insn_pc();
    Ok(Outcome::Continue)
}
