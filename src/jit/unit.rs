//! Translation units and their builder.
//!
//! The builder drives the decoder over a run of guest instructions,
//! collects the emitted events, resolves side-exit stubs, and closes
//! the body with the epilogue (or the inner-loop epilogue when the run
//! turned out to be a self-loop).

use std::cell::Cell;
use std::sync::Arc;

use intrusive_collections::{LinkedListLink, intrusive_adapter};

use crate::bus::{BusBackend, crc_range};
use crate::config::{JitConfig, LOOP_COUNT_DEFAULT};
use crate::emit::a64;
use crate::emit::{CodeBuffer, EmitEvent, Fixup, hostreg};
use crate::error::CoreError;
use crate::state::ctx as ctxoff;

use super::translate::TranslatorContext;

/// Tag bit distinguishing the executable mirror of the code heap from
/// the writable one.
pub const EXEC_MIRROR_TAG: u64 = 1 << 36;

/// A pointer into the executable mirror of the code heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecPtr(u64);

impl ExecPtr {
    pub fn new(writable_base: u64) -> Self {
        Self(writable_base | EXEC_MIRROR_TAG)
    }

    #[inline]
    pub fn addr(self) -> u64 {
        self.0
    }

    /// Address in the writable mirror.
    #[inline]
    pub fn writable(self) -> u64 {
        self.0 & !EXEC_MIRROR_TAG
    }
}

/// One translated run of guest code. Immutable once installed;
/// invalidation discards the whole unit.
pub struct TranslationUnit {
    pub(crate) hash_link: LinkedListLink,
    pub(crate) lru_link: LinkedListLink,

    pub guest_entry_pc: u32,
    /// Inclusive guest byte range consumed during translation
    /// (including the flag analyzer's lookahead); the verification CRC
    /// covers exactly this span.
    pub guest_low: u32,
    pub guest_high: u32,
    pub crc32: u32,

    /// Host code, entry first, side-exit stubs after the epilogue.
    pub host_code: Vec<u32>,
    /// Entry address in the executable mirror.
    pub host_entry: ExecPtr,

    /// Guest instructions translated into the body.
    pub insn_count: u32,
    pub use_count: Cell<u64>,
    pub fetch_count: Cell<u64>,
}

intrusive_adapter!(pub(crate) HashAdapter = Arc<TranslationUnit>: TranslationUnit { hash_link: LinkedListLink });
intrusive_adapter!(pub(crate) LruAdapter = Arc<TranslationUnit>: TranslationUnit { lru_link: LinkedListLink });

impl TranslationUnit {
    /// Bytes the unit occupies in the executable heap.
    pub fn heap_bytes(&self) -> usize {
        // Header plus code, padded to the 64-byte line like the
        // original allocator.
        (self.host_code.len() * 4 + 64 + 63) & !63
    }
}

impl std::fmt::Debug for TranslationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationUnit")
            .field("entry", &format_args!("{:#010x}", self.guest_entry_pc))
            .field(
                "range",
                &format_args!("{:#x}..={:#x}", self.guest_low, self.guest_high),
            )
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .field("host_words", &self.host_code.len())
            .field("insns", &self.insn_count)
            .finish()
    }
}

/// Builder output before cache installation.
#[derive(Debug)]
pub struct BuiltUnit {
    pub guest_entry_pc: u32,
    pub guest_low: u32,
    pub guest_high: u32,
    pub crc32: u32,
    pub host_code: Vec<u32>,
    pub insn_count: u32,
}

/// Collected side exit awaiting placement.
enum PendingStub {
    Single { fixup: Fixup, code: Vec<u32> },
    Double {
        fixup1: Fixup,
        fixup2: Fixup,
        code: Vec<u32>,
    },
}

/// Translate a run of guest instructions starting at `entry`.
pub fn build_unit(
    bus: &mut dyn BusBackend,
    cfg: &JitConfig,
    entry: u32,
) -> Result<BuiltUnit, CoreError> {
    let mut ctx = TranslatorContext::new(bus, cfg, entry);
    let mut body = CodeBuffer::new();
    let mut stubs: Vec<PendingStub> = Vec::new();
    // (guest pc, host word offset) per translated instruction, for
    // back-edge bookkeeping.
    let mut local_state: Vec<(u32, usize)> = Vec::new();

    let depth = cfg.insn_depth;
    let loop_budget = LOOP_COUNT_DEFAULT;

    let mut break_loop = false;
    let mut soft_break = false;
    let mut inner_loop = false;
    let mut last_rev_jump: Option<u32> = None;
    let mut rev_jumps_left = 0u32;
    let mut inner_loop_insns: Option<u32> = None;
    let mut inner_loop_left = 0u32;

    while !break_loop && !soft_break && ctx.insn_count < depth {
        // A backward move onto an already-translated instruction with
        // no room left for another pass ends the unit here.
        if let Some(&(_, _)) = local_state.last()
            && let Some(idx) = local_state.iter().rposition(|&(pc, _)| pc == ctx.mpc)
            && ctx.mpc < local_state.last().unwrap().0
            && (ctx.insn_count - idx as u32) > depth - ctx.insn_count
        {
            break;
        }

        let in_pc = ctx.mpc;
        local_state.push((in_pc, body.len()));

        ctx.translate_insn()?;

        for event in ctx.drain_events() {
            match event {
                EmitEvent::Instruction(word) => body.push(word),
                EmitEvent::ExitBlock { fixup, code } => {
                    stubs.push(PendingStub::Single { fixup, code })
                }
                EmitEvent::DoubleExit {
                    fixup1,
                    fixup2,
                    code,
                } => stubs.push(PendingStub::Double {
                    fixup1,
                    fixup2,
                    code,
                }),
                EmitEvent::Stop => break_loop = true,
                EmitEvent::Break => soft_break = true,
            }
        }

        // Reverse-jump budget: the same backward target may only be
        // revisited a bounded number of times per unit.
        if !break_loop && in_pc > ctx.mpc {
            if last_rev_jump == Some(ctx.mpc) {
                rev_jumps_left = rev_jumps_left.saturating_sub(1);
                if rev_jumps_left == 0 {
                    break;
                }
            } else {
                last_rev_jump = Some(ctx.mpc);
                rev_jumps_left = loop_budget - 1;
            }
        }

        // Re-entering the unit entry flips inner-loop mode.
        if !break_loop && ctx.mpc == ctx.entry {
            inner_loop = true;
            soft_break = true;
        }

        if inner_loop {
            if inner_loop_insns.is_none() {
                inner_loop_insns = Some(ctx.insn_count);
                inner_loop_left = loop_budget;
            }
            // Unroll further copies of the loop body while the budget
            // and the instruction depth allow.
            inner_loop_left = inner_loop_left.saturating_sub(1);
            if inner_loop_left > 0 {
                let body_insns = inner_loop_insns.unwrap_or(1);
                soft_break = depth - ctx.insn_count <= body_insns;
            }
        }
    }

    debug_assert_eq!(body.len(), ctx.body_len());

    // Epilogue: store dirty FP registers, flush the PC tracker and the
    // special slots, account the executed instructions, and (for inner
    // loops) branch back to the start while nothing is pending. The
    // loop-back is only valid when translation closed exactly at the
    // entry PC again.
    let loop_back = inner_loop && ctx.mpc == ctx.entry;
    emit_epilogue(&mut ctx, &mut body, loop_back)?;

    // Append the side exits and point their branches at them.
    for stub in stubs {
        let start = body.len();
        match stub {
            PendingStub::Single { fixup, code } => {
                body.extend(code);
                body.patch(fixup, start);
            }
            PendingStub::Double {
                fixup1,
                fixup2,
                code,
            } => {
                body.extend(code);
                body.patch(fixup1, start);
                body.patch(fixup2, start);
            }
        }
    }

    let crc32 = crc_range(ctx.bus, ctx.low, ctx.high);
    if cfg.debug {
        log::debug!(
            target: "icache",
            "translated {} guest insns at {entry:#010x} into {} host words (range {:#x}..={:#x})",
            ctx.insn_count,
            body.len(),
            ctx.low,
            ctx.high
        );
    }
    if cfg.disassemble {
        for (i, chunk) in body.words().chunks(5).enumerate() {
            let line: Vec<String> = chunk.iter().map(|w| format!("{w:08x}")).collect();
            log::trace!(target: "icache", "  {:4}: {}", i * 5, line.join(" "));
        }
    }

    Ok(BuiltUnit {
        guest_entry_pc: entry,
        guest_low: ctx.low,
        guest_high: ctx.high,
        crc32,
        host_code: body.into_words(),
        insn_count: ctx.insn_count,
    })
}

fn emit_epilogue(
    ctx: &mut TranslatorContext,
    body: &mut CodeBuffer,
    inner_loop: bool,
) -> Result<(), CoreError> {
    let mut seq: Vec<u32> = Vec::new();

    // Dirty FP registers.
    let fp_dirty = ctx.regs.fp_dirty_mask();
    let mut ctxreg = None;
    if fp_dirty != 0 {
        let base = ctx.regs.get_ctx(&mut seq)?;
        ctxreg = Some(base);
        for i in 0..8u8 {
            if fp_dirty & (1 << i) != 0 {
                seq.push(a64::fstd_uoff(hostreg::fp(i), base, ctxoff::fp(i as usize)));
            }
        }
    }

    // Pending PC offset.
    if ctx.pc_rel > 0 {
        seq.push(a64::add_imm(hostreg::PC, hostreg::PC, ctx.pc_rel as u32));
    } else if ctx.pc_rel < 0 {
        seq.push(a64::sub_imm(hostreg::PC, hostreg::PC, (-ctx.pc_rel) as u32));
    }
    ctx.pc_rel = 0;

    // Special slots back to their homes.
    ctx.regs.flush_cc(&mut seq);
    ctx.regs.flush_fpcr(&mut seq);
    ctx.regs.flush_fpsr(&mut seq);

    // Cumulative instruction counter and, for inner loops, the
    // pending-interrupt poll.
    let base = match ctxreg {
        Some(b) => b,
        None => ctx.regs.get_ctx(&mut seq)?,
    };
    let counter = ctx.regs.alloc_temp(&mut seq)?;
    let pending = if inner_loop {
        let p = ctx.regs.alloc_temp(&mut seq)?;
        seq.push(a64::ldr_uoff(p, base, ctxoff::INT));
        Some(p)
    } else {
        None
    };
    seq.push(a64::ldr64_uoff(counter, base, ctxoff::INSN_COUNT));
    seq.push(a64::add_imm_64(counter, counter, ctx.insn_count & 0xfff));
    seq.push(a64::str64_uoff(counter, base, ctxoff::INSN_COUNT));

    body.extend(seq.iter().copied());

    if let Some(p) = pending {
        // Loop back to the unit start while nothing is pending.
        let here = body.len() as i32;
        body.push(a64::cbz(p, -here));
        ctx.regs.free_temp(p);
    }
    body.push(a64::ret());

    ctx.regs.free_temp(counter);
    ctx.regs.flush_ctx();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusBackend, ShadowRam, Width};

    fn code(words: &[u16]) -> ShadowRam {
        let mut ram = ShadowRam::new(0x1000, 0x400);
        for (i, w) in words.iter().enumerate() {
            ram.write(0x1000 + 2 * i as u32, Width::Word, *w as u128);
        }
        ram
    }

    #[test]
    fn straight_line_unit_ends_with_ret() {
        // MOVEQ #5,D0 ; RTS
        let mut ram = code(&[0x7005, 0x4e75]);
        let cfg = JitConfig::default();
        let unit = build_unit(&mut ram, &cfg, 0x1000).unwrap();
        assert_eq!(unit.guest_entry_pc, 0x1000);
        assert_eq!(unit.insn_count, 2);
        assert_eq!(*unit.host_code.last().unwrap(), a64::ret());
        // The consumed range covers both instructions.
        assert_eq!(unit.guest_low, 0x1000);
        assert!(unit.guest_high >= 0x1003);
    }

    #[test]
    fn crc_matches_guest_bytes() {
        let mut ram = code(&[0x7005, 0x4e75]);
        let cfg = JitConfig::default();
        let unit = build_unit(&mut ram, &cfg, 0x1000).unwrap();
        let crc = crc_range(&mut ram, unit.guest_low, unit.guest_high);
        assert_eq!(crc, unit.crc32);
    }

    #[test]
    fn entry_self_loop_gets_inner_loop_epilogue() {
        // Tight polling loop: BRA.S to self.
        let mut ram = code(&[0x60fe]);
        let cfg = JitConfig::default();
        let unit = build_unit(&mut ram, &cfg, 0x1000).unwrap();
        // The epilogue must contain a backward CBZ on the pending word
        // (a negative 19-bit offset) right before the final ret.
        let n = unit.host_code.len();
        let cbz = unit.host_code[n - 2];
        assert_eq!(cbz & 0xff00_0000, 0x3400_0000, "expected cbz, got {cbz:#010x}");
        let off = (cbz >> 5) & 0x7ffff;
        assert!(off & 0x40000 != 0, "loop-back offset must be negative");
    }
}
