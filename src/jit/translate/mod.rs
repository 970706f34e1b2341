//! Guest instruction translation.
//!
//! [`TranslatorContext`] carries everything a line handler needs: the
//! decode cursor, the register allocator, the flag analyzer, the
//! pending PC-relative offset, and the event stream handed to the unit
//! builder. Dispatch fans out on the top four opcode bits to one of
//! sixteen line handlers, mirroring the hardware's instruction groups.

mod arith;
mod bits;
mod ea;
mod flow;
mod fpu;
mod logic;
mod moves;
mod shift;

pub use ea::{AddressingMode, Operand};

use crate::bus::BusBackend;
use crate::config::JitConfig;
use crate::emit::a64::{self, SysReg};
use crate::emit::{EmitEvent, Fixup, FixupKind, hostreg};
use crate::error::CoreError;

use super::flags::{self, FlagAnalyzer};
use super::regalloc::RegAlloc;

/// Operand size of the instruction being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSize {
    Byte,
    Word,
    Long,
}

impl OpSize {
    /// From the common two-bit size field (00/01/10).
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits & 3 {
            0 => Some(Self::Byte),
            1 => Some(Self::Word),
            2 => Some(Self::Long),
            _ => None,
        }
    }

    /// From the MOVE opcode size field (1 = byte, 3 = word, 2 = long).
    pub fn from_move_bits(bits: u16) -> Option<Self> {
        match bits & 3 {
            1 => Some(Self::Byte),
            3 => Some(Self::Word),
            2 => Some(Self::Long),
            _ => None,
        }
    }

    #[inline]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Long => 4,
        }
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Byte => 8,
            Self::Word => 16,
            Self::Long => 32,
        }
    }

    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xff,
            Self::Word => 0xffff,
            Self::Long => 0xffff_ffff,
        }
    }
}

/// What the handler wants the unit builder to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fall through to the next instruction at the decode cursor.
    Continue,
    /// Unconditional terminator.
    Stop,
    /// Soft terminator (inner loop closed).
    Break,
}

/// Host-order positions of the packed flag bits (X N Z C V).
pub const HB_V: u8 = 0;
pub const HB_C: u8 = 1;
pub const HB_Z: u8 = 2;
pub const HB_N: u8 = 3;
pub const HB_X: u8 = 4;
/// Bit position of the supervisor flag within the packed SR.
pub const HB_S: u8 = 13;
pub const HB_M: u8 = 12;

/// Convert an architectural flag mask (X N Z V C) to the host-order
/// packed layout (C and V swapped).
#[inline]
pub const fn host_mask(arch: u8) -> u32 {
    (arch as u32 & 0x1c) | ((arch as u32 & 1) << 1) | ((arch as u32 >> 1) & 1)
}

/// The PC-relative offset tracker is flushed into the PC register
/// before it leaves this range.
const PC_REL_LIMIT: i32 = 120;

/// Translation state for one unit, rebuilt per translation.
pub struct TranslatorContext<'a> {
    pub bus: &'a mut dyn BusBackend,
    pub cfg: &'a JitConfig,
    pub regs: RegAlloc,
    pub analyzer: FlagAnalyzer,

    /// Guest address of the unit entry.
    pub entry: u32,
    /// Decode cursor: guest address of the instruction being decoded.
    pub mpc: u32,
    /// Pending difference between the decode cursor and the value the
    /// host PC register currently holds.
    pub pc_rel: i32,

    /// Inclusive range of guest bytes consumed so far.
    pub low: u32,
    pub high: u32,

    /// Guest instructions translated so far.
    pub insn_count: u32,
    /// Guest address of the instruction currently being translated.
    insn_start: u32,

    out: Vec<EmitEvent>,
    /// Number of Instruction events emitted (body word count).
    body_words: usize,
    /// Event index of each body word, for local patching.
    body_positions: Vec<usize>,
    /// Redirect sink while building a side-exit stub.
    stub: Option<Vec<u32>>,
    /// Translation-time return-address predictions (BSR/JSR push,
    /// RTS consumes).
    return_stack: Vec<u32>,

    /// Rolling counter for the chip-RAM slowdown touch loads.
    pub chip_counter: u32,
    /// Host rounding mode already slaved to the guest FPCR in this
    /// unit.
    pub fpu_rounding_init: bool,
}

impl<'a> TranslatorContext<'a> {
    pub fn new(bus: &'a mut dyn BusBackend, cfg: &'a JitConfig, entry: u32) -> Self {
        Self {
            bus,
            cfg,
            regs: RegAlloc::new(),
            analyzer: FlagAnalyzer::new(cfg.ccr_scan_depth),
            entry,
            mpc: entry,
            pc_rel: 0,
            low: entry,
            high: entry,
            insn_count: 0,
            insn_start: entry,
            out: Vec::new(),
            body_words: 0,
            body_positions: Vec::new(),
            stub: None,
            return_stack: Vec::new(),
            chip_counter: 0,
            fpu_rounding_init: false,
        }
    }

    /// Take the events accumulated so far.
    pub fn drain_events(&mut self) -> Vec<EmitEvent> {
        self.out.drain(..).collect()
    }

    // -- emission ----------------------------------------------------------

    /// Append one host instruction to the unit body (or to the stub
    /// under construction).
    #[inline]
    pub fn emit(&mut self, word: u32) {
        if let Some(stub) = &mut self.stub {
            stub.push(word);
        } else {
            self.body_positions.push(self.out.len());
            self.out.push(EmitEvent::Instruction(word));
            self.body_words += 1;
        }
    }

    pub fn emit_all(&mut self, words: impl IntoIterator<Item = u32>) {
        for w in words {
            self.emit(w);
        }
    }

    /// Current body position, for local branch patching.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.body_words
    }

    /// Patch a previously emitted body branch to land on `target`.
    pub fn patch_local(&mut self, location: usize, kind: FixupKind, target: usize) {
        let ev = self.body_positions[location];
        if let EmitEvent::Instruction(word) = &mut self.out[ev] {
            let distance = (target as i64 - location as i64) as u32;
            *word = match kind {
                FixupKind::CondBranch => (*word & !(0x7ffff << 5)) | ((distance & 0x7ffff) << 5),
                FixupKind::TestBranch => (*word & !(0x3fff << 5)) | ((distance & 0x3fff) << 5),
            };
        }
    }

    /// Build a side-exit stub: emission inside `f` goes to the stub
    /// body instead of the unit body.
    pub fn exit_stub(
        &mut self,
        fixup_kind: FixupKind,
        branch_location: usize,
        f: impl FnOnce(&mut Self) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        self.stub = Some(Vec::new());
        let result = f(self);
        let code = self.stub.take().unwrap_or_default();
        result?;
        self.out.push(EmitEvent::ExitBlock {
            fixup: Fixup {
                kind: fixup_kind,
                location: branch_location,
            },
            code,
        });
        Ok(())
    }

    /// Like [`Self::exit_stub`] for a stub reached by two branches.
    pub fn double_exit_stub(
        &mut self,
        fixup1: (FixupKind, usize),
        fixup2: (FixupKind, usize),
        f: impl FnOnce(&mut Self) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        self.stub = Some(Vec::new());
        let result = f(self);
        let code = self.stub.take().unwrap_or_default();
        result?;
        self.out.push(EmitEvent::DoubleExit {
            fixup1: Fixup {
                kind: fixup1.0,
                location: fixup1.1,
            },
            fixup2: Fixup {
                kind: fixup2.0,
                location: fixup2.1,
            },
            code,
        });
        Ok(())
    }

    pub fn push_stop(&mut self) {
        self.out.push(EmitEvent::Stop);
    }

    pub fn push_break(&mut self) {
        self.out.push(EmitEvent::Break);
    }

    // -- register allocation, routed through the emission sink -------------

    fn with_ra<T>(
        &mut self,
        f: impl FnOnce(&mut RegAlloc, &mut Vec<u32>) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut seq = Vec::new();
        let result = f(&mut self.regs, &mut seq);
        self.emit_all(seq);
        result
    }

    pub fn alloc_temp(&mut self) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.alloc_temp(s))
    }

    pub fn copy_from_d(&mut self, n: u8) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.copy_from_d(s, n))
    }

    pub fn copy_from_a(&mut self, n: u8) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.copy_from_a(s, n))
    }

    pub fn get_cc(&mut self) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.get_cc(s))
    }

    pub fn modify_cc(&mut self) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.modify_cc(s))
    }

    pub fn get_ctx_reg(&mut self) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.get_ctx(s))
    }

    pub fn get_fpcr(&mut self) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.get_fpcr(s))
    }

    pub fn modify_fpcr(&mut self) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.modify_fpcr(s))
    }

    pub fn get_fpsr(&mut self) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.get_fpsr(s))
    }

    pub fn modify_fpsr(&mut self) -> Result<u8, CoreError> {
        self.with_ra(|ra, s| ra.modify_fpsr(s))
    }

    // -- instruction stream ------------------------------------------------

    /// Opcode at the decode cursor, without consuming it.
    pub fn peek_opcode(&mut self) -> u16 {
        self.bus.fetch_16(self.mpc)
    }

    /// Consume one extension word at the cursor.
    pub fn read_ext_word(&mut self) -> u16 {
        let w = self.bus.fetch_16(self.mpc);
        self.mpc = self.mpc.wrapping_add(2);
        w
    }

    pub fn read_ext_long(&mut self) -> u32 {
        let hi = self.read_ext_word() as u32;
        let lo = self.read_ext_word() as u32;
        (hi << 16) | lo
    }

    /// Track the consumed guest byte range (used for CRC verification
    /// and invalidation).
    pub fn note_range(&mut self, from: u32, to: u32) {
        if from < self.low {
            self.low = from;
        }
        if to > self.high {
            self.high = to;
        }
    }

    // -- PC-relative cursor ------------------------------------------------

    /// Record that the guest PC conceptually advanced by `bytes`
    /// without materializing the addition. Flushed before overflow of
    /// the short-immediate range.
    pub fn advance_pc(&mut self, bytes: i32) {
        self.pc_rel += bytes;
        if self.pc_rel > PC_REL_LIMIT || self.pc_rel < -PC_REL_LIMIT {
            self.flush_pc();
        }
    }

    /// Materialize the pending PC offset into the host PC register.
    pub fn flush_pc(&mut self) {
        if self.pc_rel > 0 {
            self.emit(a64::add_imm(hostreg::PC, hostreg::PC, self.pc_rel as u32));
        } else if self.pc_rel < 0 {
            self.emit(a64::sub_imm(hostreg::PC, hostreg::PC, (-self.pc_rel) as u32));
        }
        self.pc_rel = 0;
    }

    /// Load an exact guest PC value into the host PC register.
    pub fn set_pc_const(&mut self, value: u32) {
        self.emit_all(a64::mov_imm32(hostreg::PC, value));
        self.pc_rel = 0;
    }

    // -- flag materialization ----------------------------------------------

    /// Guest address of the instruction currently being translated.
    #[inline]
    pub fn last_insn_start(&self) -> u32 {
        self.insn_start
    }

    /// Bytes consumed so far by the current instruction.
    #[inline]
    pub fn insn_bytes(&self) -> u32 {
        self.mpc.wrapping_sub(self.insn_start)
    }

    /// Advance the PC tracker over the whole current instruction.
    pub fn advance_insn_pc(&mut self) {
        let bytes = self.insn_bytes() as i32;
        self.advance_pc(bytes);
    }

    /// CCR bits the current instruction must produce. The analyzer's
    /// lookahead widens the unit's verification footprint.
    pub fn flags_needed(&mut self) -> u8 {
        let pc = self.insn_start;
        let (needed, extent) = self.analyzer.needed_flags_with_extent(self.bus, pc);
        self.note_range(pc, extent);
        needed
    }

    /// Capture the host NZCV flags into the packed CC register.
    ///
    /// `mask` is an architectural flag mask; `invert_c` is set for
    /// subtraction-style operations whose guest borrow is the inverse
    /// of the host carry. When X is in the mask it receives a copy of
    /// the (possibly inverted) carry.
    pub fn emit_flag_update(&mut self, mask: u8, invert_c: bool) -> Result<(), CoreError> {
        if mask == 0 {
            return Ok(());
        }
        if invert_c {
            self.emit(a64::cfinv());
        }
        let cc = self.modify_cc()?;
        let t = self.alloc_temp()?;
        self.emit(a64::mrs(t, SysReg::Nzcv));
        self.emit(a64::lsr_imm(t, t, 28));
        // t[3:0] = N Z C V, exactly the low nibble of the packed CC.
        if mask & flags::FLAG_X != 0 {
            let x = self.alloc_temp()?;
            self.emit(a64::ubfx(x, t, HB_C, 1));
            self.emit(a64::bfi(cc, x, HB_X, 1));
            self.regs.free_temp(x);
        }
        let nzvc = mask & flags::FLAG_NZVC;
        if nzvc == flags::FLAG_NZVC {
            self.emit(a64::bfi(cc, t, 0, 4));
        } else if nzvc == flags::FLAG_NZ {
            let nz = self.alloc_temp()?;
            self.emit(a64::ubfx(nz, t, HB_Z, 2));
            self.emit(a64::bfi(cc, nz, HB_Z, 2));
            self.regs.free_temp(nz);
        } else if nzvc != 0 {
            let bit = self.alloc_temp()?;
            for (arch, host) in [
                (flags::FLAG_N, HB_N),
                (flags::FLAG_Z, HB_Z),
                (flags::FLAG_V, HB_V),
                (flags::FLAG_C, HB_C),
            ] {
                if nzvc & arch != 0 {
                    self.emit(a64::ubfx(bit, t, host, 1));
                    self.emit(a64::bfi(cc, bit, host, 1));
                }
            }
            self.regs.free_temp(bit);
        }
        self.regs.free_temp(t);
        Ok(())
    }

    /// Flag capture for the X-propagation family (ADDX/SUBX/NEGX and
    /// the extend rotates): Z is accumulated (only ever cleared, never
    /// set), matching the multi-precision arithmetic contract.
    pub fn emit_flag_update_accumulate_z(
        &mut self,
        mask: u8,
        invert_c: bool,
    ) -> Result<(), CoreError> {
        if mask == 0 {
            return Ok(());
        }
        if invert_c {
            self.emit(a64::cfinv());
        }
        let cc = self.modify_cc()?;
        let t = self.alloc_temp()?;
        self.emit(a64::mrs(t, SysReg::Nzcv));
        self.emit(a64::lsr_imm(t, t, 28));
        let bit = self.alloc_temp()?;
        if mask & flags::FLAG_X != 0 {
            self.emit(a64::ubfx(bit, t, HB_C, 1));
            self.emit(a64::bfi(cc, bit, HB_X, 1));
        }
        for (arch, host) in [
            (flags::FLAG_N, HB_N),
            (flags::FLAG_V, HB_V),
            (flags::FLAG_C, HB_C),
        ] {
            if mask & arch != 0 {
                self.emit(a64::ubfx(bit, t, host, 1));
                self.emit(a64::bfi(cc, bit, host, 1));
            }
        }
        if mask & flags::FLAG_Z != 0 {
            // Z_new = Z_host AND Z_old.
            let old = self.alloc_temp()?;
            self.emit(a64::ubfx(bit, t, HB_Z, 1));
            self.emit(a64::ubfx(old, cc, HB_Z, 1));
            self.emit(a64::and_reg(bit, bit, old, a64::Shift::Lsl, 0));
            self.emit(a64::bfi(cc, bit, HB_Z, 1));
            self.regs.free_temp(old);
        }
        self.regs.free_temp(bit);
        self.regs.free_temp(t);
        Ok(())
    }

    /// Clear flag bits to fixed zero (architectural mask).
    pub fn emit_flag_clear(&mut self, mask: u8) -> Result<(), CoreError> {
        if mask == 0 {
            return Ok(());
        }
        let cc = self.modify_cc()?;
        self.emit(a64::bic_imm(cc, cc, host_mask(mask)));
        Ok(())
    }

    /// Set flag bits to fixed one (architectural mask).
    pub fn emit_flag_set(&mut self, mask: u8) -> Result<(), CoreError> {
        if mask == 0 {
            return Ok(());
        }
        let cc = self.modify_cc()?;
        self.emit(a64::orr_imm(cc, cc, host_mask(mask)));
        Ok(())
    }

    /// N/Z (plus cleared V/C) from a value register, honoring the
    /// operand size. Only the bits in `mask` are touched.
    pub fn emit_nz_from_value(
        &mut self,
        reg: u8,
        size: OpSize,
        mask: u8,
    ) -> Result<(), CoreError> {
        let mask = mask & flags::FLAG_NZVC;
        if mask == 0 {
            return Ok(());
        }
        // ADDS of zero and the (shifted) value: N/Z reflect the sized
        // operand, carry and overflow come out zero, which is exactly
        // the guest semantics of a move-style update.
        let shift = 32 - size.bits();
        self.emit(a64::adds_reg(31, 31, reg, a64::Shift::Lsl, shift));
        self.emit_flag_update(mask, false)?;
        Ok(())
    }

    /// Load host NZCV from the packed CC so a native `b.cond` can be
    /// used. Returns the host condition matching the 68k condition:
    /// only CC/CS swap (the stored carry is the guest borrow).
    pub fn emit_load_nzcv(&mut self, cond68k: u8) -> Result<u8, CoreError> {
        let cc = self.get_cc()?;
        let t = self.alloc_temp()?;
        self.emit(a64::eor_imm(t, cc, 1 << HB_C));
        self.emit(a64::lsl_imm(t, t, 28));
        self.emit(a64::msr(SysReg::Nzcv, t));
        self.regs.free_temp(t);
        Ok(host_cond(cond68k))
    }

    /// Guest memory load with the big-endian fixup.
    pub fn emit_load_be(&mut self, dst: u8, addr: u8, size: OpSize) {
        match size {
            OpSize::Byte => self.emit(a64::ldrb_uoff(dst, addr, 0)),
            OpSize::Word => {
                self.emit(a64::ldrh_uoff(dst, addr, 0));
                self.emit(a64::rev16(dst, dst));
            }
            OpSize::Long => {
                self.emit(a64::ldr_uoff(dst, addr, 0));
                self.emit(a64::rev(dst, dst));
            }
        }
    }

    /// Guest memory store with the big-endian fixup. `src` is
    /// preserved; a scratch register is used for the swapped copy.
    pub fn emit_store_be(&mut self, src: u8, addr: u8, size: OpSize) -> Result<(), CoreError> {
        match size {
            OpSize::Byte => self.emit(a64::strb_uoff(src, addr, 0)),
            OpSize::Word => {
                let t = self.alloc_temp()?;
                self.emit(a64::rev16(t, src));
                self.emit(a64::strh_uoff(t, addr, 0));
                self.regs.free_temp(t);
            }
            OpSize::Long => {
                let t = self.alloc_temp()?;
                self.emit(a64::rev(t, src));
                self.emit(a64::str_uoff(t, addr, 0));
                self.regs.free_temp(t);
            }
        }
        Ok(())
    }

    /// Add a signed constant to a register, routing around the 12-bit
    /// immediate limit.
    pub fn emit_add_const(&mut self, dst: u8, src: u8, value: i32) -> Result<(), CoreError> {
        if value == 0 {
            if dst != src {
                self.emit(a64::mov_reg(dst, src));
            }
        } else if (0..=0xfff).contains(&value) {
            self.emit(a64::add_imm(dst, src, value as u32));
        } else if (-0xfff..0).contains(&value) {
            self.emit(a64::sub_imm(dst, src, (-value) as u32));
        } else {
            let t = self.alloc_temp()?;
            self.emit_all(a64::mov_imm32(t, value as u32));
            self.emit(a64::add_reg(dst, src, t, a64::Shift::Lsl, 0));
            self.regs.free_temp(t);
        }
        Ok(())
    }

    /// Write a sized result into a data register, preserving the upper
    /// bits for byte and word operations.
    pub fn emit_store_dreg(&mut self, dn: u8, value: u8, size: OpSize) {
        let dreg = hostreg::d(dn);
        match size {
            OpSize::Long => {
                if dreg != value {
                    self.emit(a64::mov_reg(dreg, value));
                }
            }
            OpSize::Word => self.emit(a64::bfi(dreg, value, 0, 16)),
            OpSize::Byte => self.emit(a64::bfi(dreg, value, 0, 8)),
        }
    }

    /// Chip-RAM slowdown: touch the PC stream every Nth instruction
    /// while translating code below the chip limit.
    pub fn emit_chip_slowdown(&mut self) {
        if !self.cfg.chip_slowdown || self.mpc >= 0x20_0000 {
            return;
        }
        self.chip_counter += 1;
        if self.chip_counter % self.cfg.cs_dist == 0 {
            let off = self.pc_rel;
            if (-255..=255).contains(&off) {
                self.emit(a64::ldurh(31, hostreg::PC, off));
            } else {
                self.flush_pc();
                self.emit(a64::ldurh(31, hostreg::PC, 0));
            }
        }
    }

    /// Fetch the opcode at the cursor and translate one instruction.
    /// The cursor is left at the next instruction to decode (which for
    /// branches may be the branch target).
    pub fn translate_insn(&mut self) -> Result<Outcome, CoreError> {
        let start = self.mpc;
        self.insn_start = start;
        let opcode = self.read_ext_word();
        self.emit_chip_slowdown();

        let outcome = match opcode >> 12 {
            0x0 => logic::translate_line0(self, opcode),
            0x1 | 0x2 | 0x3 => moves::translate_move(self, opcode),
            0x4 => flow::translate_line4(self, opcode),
            0x5 => arith::translate_line5(self, opcode),
            0x6 => flow::translate_line6(self, opcode),
            0x7 => moves::translate_moveq(self, opcode),
            0x8 => arith::translate_line8(self, opcode),
            0x9 => arith::translate_sub(self, opcode),
            0xa => flow::translate_unimplemented(self, opcode, flow::vector::LINE_A),
            0xb => arith::translate_lineb(self, opcode),
            0xc => logic::translate_linec(self, opcode),
            0xd => arith::translate_add(self, opcode),
            0xe => shift::translate_linee(self, opcode),
            0xf => fpu::translate_linef(self, opcode),
            _ => unreachable!(),
        }?;

        // Bytes consumed by decode, plus the flag-analyzer lookahead,
        // feed the unit's verification footprint.
        let consumed_end = self.mpc.max(start + 2) - 1;
        self.note_range(start.min(self.mpc), consumed_end);
        self.insn_count += 1;

        let leaked = self.regs.temp_mask() & !self.regs.special_mask();
        if leaked != 0 && !matches!(outcome, Outcome::Stop | Outcome::Break) {
            log::error!(
                target: "jit",
                "temp register leak {leaked:#x} after opcode {opcode:#06x} at {start:#x}"
            );
            return Err(CoreError::TranslatorBug("temporary register leak"));
        }

        Ok(outcome)
    }
}

/// Map a 68k condition code to the host condition used after
/// [`TranslatorContext::emit_load_nzcv`].
pub const fn host_cond(cond68k: u8) -> u8 {
    match cond68k & 0xf {
        0x0 => a64::cc::AL,
        0x1 => a64::cc::AL, // F is handled by the callers
        0x2 => a64::cc::HI,
        0x3 => a64::cc::LS,
        0x4 => a64::cc::CS, // guest CC: stored carry is the borrow
        0x5 => a64::cc::CC, // guest CS
        0x6 => a64::cc::NE,
        0x7 => a64::cc::EQ,
        0x8 => a64::cc::VC,
        0x9 => a64::cc::VS,
        0xa => a64::cc::PL,
        0xb => a64::cc::MI,
        0xc => a64::cc::GE,
        0xd => a64::cc::LT,
        0xe => a64::cc::GT,
        _ => a64::cc::LE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_mask_swaps_c_and_v() {
        assert_eq!(host_mask(flags::FLAG_C), 1 << HB_C);
        assert_eq!(host_mask(flags::FLAG_V), 1 << HB_V);
        assert_eq!(host_mask(flags::FLAG_X | flags::FLAG_Z), 0x14);
    }

    #[test]
    fn guest_carry_conditions_swap() {
        assert_eq!(host_cond(0x4), a64::cc::CS); // guest CC
        assert_eq!(host_cond(0x5), a64::cc::CC); // guest CS
        assert_eq!(host_cond(0x7), a64::cc::EQ);
        assert_eq!(host_cond(0x2), a64::cc::HI);
    }
}
