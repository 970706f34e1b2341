//! Condition-code liveness analysis.
//!
//! For a guest instruction, compute which CCR bits may be read before
//! they are next written. The translator skips materializing provably
//! dead flag bits, which is most of the cost of emulating a flags-happy
//! CISC in tight loops.
//!
//! A small table per opcode family records (bits written, bits read);
//! a bounded forward scan ORs up reads while masking off bits already
//! overwritten. BRA/BSR/JMP with static targets are followed;
//! conditional branches fork the scan and the two results are unioned;
//! anything indirect ends the scan conservatively.

use crate::bus::BusBackend;

pub const FLAG_C: u8 = 0x01;
pub const FLAG_V: u8 = 0x02;
pub const FLAG_Z: u8 = 0x04;
pub const FLAG_N: u8 = 0x08;
pub const FLAG_X: u8 = 0x10;
pub const FLAG_NZ: u8 = FLAG_N | FLAG_Z;
pub const FLAG_NZVC: u8 = FLAG_N | FLAG_Z | FLAG_V | FLAG_C;
pub const FLAG_ALL: u8 = 0x1f;

/// (bits written, bits read) for one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlagUse {
    sets: u8,
    needs: u8,
}

const NONE: FlagUse = FlagUse { sets: 0, needs: 0 };

#[inline]
const fn fu(sets: u8, needs: u8) -> FlagUse {
    FlagUse { sets, needs }
}

/// Flags a conditional test consumes, by 68k condition code.
pub const fn condition_needs(cond: u8) -> u8 {
    match cond & 0xf {
        0x0 | 0x1 => 0,                // T, F
        0x2 | 0x3 => FLAG_C | FLAG_Z,  // HI, LS
        0x4 | 0x5 => FLAG_C,           // CC, CS
        0x6 | 0x7 => FLAG_Z,           // NE, EQ
        0x8 | 0x9 => FLAG_V,           // VC, VS
        0xa | 0xb => FLAG_N,           // PL, MI
        0xc | 0xd => FLAG_N | FLAG_V,  // GE, LT
        _ => FLAG_N | FLAG_V | FLAG_Z, // GT, LE
    }
}

fn check_line0(op: u16) -> FlagUse {
    // Immediate group, bit ops, MOVEP.
    if op & 0x0100 != 0 || (op & 0x0f00) == 0x0800 {
        if (op & 0x0038) == 0x0008 {
            return NONE; // MOVEP
        }
        // BTST/BCHG/BCLR/BSET
        return fu(FLAG_Z, 0);
    }
    match op & 0x0f00 {
        0x0000 | 0x0200 | 0x0a00 => {
            if op & 0x00ff == 0x003c {
                // ORI/ANDI/EORI to CCR (or SR): read-modify-write of
                // the whole flag set.
                fu(FLAG_ALL, FLAG_ALL)
            } else {
                fu(FLAG_NZVC, 0)
            }
        }
        0x0400 | 0x0600 => fu(FLAG_ALL, 0), // SUBI/ADDI
        0x0c00 => fu(FLAG_NZVC, 0),         // CMPI
        0x0e00 => NONE,                     // MOVES
        _ => NONE,
    }
}

fn check_move(op: u16) -> FlagUse {
    // MOVEA leaves the flags alone.
    if (op & 0x01c0) == 0x0040 {
        NONE
    } else {
        fu(FLAG_NZVC, 0)
    }
}

fn check_line4(op: u16) -> FlagUse {
    match op {
        0x4e70 => NONE,                 // RESET
        0x4e71 => NONE,                 // NOP
        0x4e72 => fu(FLAG_ALL, FLAG_ALL), // STOP
        0x4e73 => fu(FLAG_ALL, FLAG_ALL), // RTE
        0x4e75 => NONE,                 // RTS
        0x4e76 => fu(0, FLAG_V),        // TRAPV
        0x4e77 => fu(FLAG_ALL, FLAG_ALL), // RTR
        _ => {
            if (op & 0xffc0) == 0x40c0 {
                return fu(0, FLAG_ALL); // MOVE from SR
            }
            if (op & 0xffc0) == 0x42c0 {
                return fu(0, FLAG_ALL); // MOVE from CCR
            }
            if (op & 0xffc0) == 0x44c0 || (op & 0xffc0) == 0x46c0 {
                return fu(FLAG_ALL, 0); // MOVE to CCR / SR
            }
            if (op & 0xff00) == 0x4000 {
                return fu(FLAG_ALL, FLAG_X | FLAG_Z); // NEGX
            }
            if (op & 0xff00) == 0x4200 {
                return fu(FLAG_NZVC, 0); // CLR
            }
            if (op & 0xff00) == 0x4400 {
                return fu(FLAG_ALL, 0); // NEG
            }
            if (op & 0xff00) == 0x4600 {
                return fu(FLAG_NZVC, 0); // NOT
            }
            if (op & 0xffb8) == 0x4880 {
                return fu(FLAG_NZVC, 0); // EXT
            }
            if (op & 0xffc0) == 0x4800 {
                return fu(FLAG_ALL, FLAG_X | FLAG_Z); // NBCD
            }
            if (op & 0xfff8) == 0x4840 {
                return fu(FLAG_NZVC, 0); // SWAP
            }
            if (op & 0xffc0) == 0x4ac0 {
                return fu(FLAG_NZVC, 0); // TAS
            }
            if (op & 0xff00) == 0x4a00 {
                return fu(FLAG_NZVC, 0); // TST
            }
            if (op & 0xffc0) == 0x4c00 || (op & 0xffc0) == 0x4c40 {
                return fu(FLAG_NZVC, 0); // MULx.L / DIVx.L
            }
            if (op & 0xf1c0) == 0x4180 {
                return fu(FLAG_NZVC, 0); // CHK
            }
            if (op & 0xfff0) == 0x4e40 {
                return fu(FLAG_ALL, FLAG_ALL); // TRAP #n
            }
            NONE // LEA, PEA, MOVEM, LINK, UNLK, JSR, JMP, ...
        }
    }
}

fn check_line5(op: u16) -> FlagUse {
    match op & 0x00c0 {
        0x00c0 => {
            // Scc/DBcc/TRAPcc consume their condition.
            fu(0, condition_needs((op >> 8) as u8))
        }
        _ => {
            if (op & 0x0038) == 0x0008 {
                NONE // ADDQ/SUBQ to An
            } else {
                fu(FLAG_ALL, 0)
            }
        }
    }
}

fn check_line6(op: u16) -> FlagUse {
    // BRA/BSR need nothing; Bcc needs its condition.
    fu(0, condition_needs((op >> 8) as u8))
}

fn check_line8(op: u16) -> FlagUse {
    if (op & 0x01f0) == 0x0100 {
        return fu(FLAG_ALL, FLAG_X | FLAG_Z); // SBCD
    }
    if (op & 0x00c0) == 0x00c0 {
        return fu(FLAG_NZVC, 0); // DIVU/DIVS
    }
    fu(FLAG_NZVC, 0) // OR
}

fn check_line9_d(op: u16) -> FlagUse {
    if (op & 0x00c0) == 0x00c0 {
        return NONE; // SUBA/ADDA
    }
    if (op & 0x0130) == 0x0100 {
        return fu(FLAG_ALL, FLAG_X | FLAG_Z); // SUBX/ADDX
    }
    fu(FLAG_ALL, 0)
}

fn check_lineb(op: u16) -> FlagUse {
    fu(FLAG_NZVC, 0) // CMP/CMPA/CMPM/EOR
}

fn check_linec(op: u16) -> FlagUse {
    if (op & 0x01f0) == 0x0100 {
        return fu(FLAG_ALL, FLAG_X | FLAG_Z); // ABCD
    }
    if (op & 0x01f0) == 0x0140 || (op & 0x01f8) == 0x0188 {
        return NONE; // EXG
    }
    if (op & 0x00c0) == 0x00c0 {
        return fu(FLAG_NZVC, 0); // MULU/MULS
    }
    fu(FLAG_NZVC, 0) // AND
}

fn check_linee(op: u16) -> FlagUse {
    if (op & 0x08c0) == 0x08c0 {
        return fu(FLAG_NZVC, 0); // bitfield group
    }
    // ROXL/ROXR propagate X into the rotate.
    let kind = if (op & 0x00c0) == 0x00c0 {
        (op >> 9) & 3
    } else {
        (op >> 3) & 3
    };
    if kind == 2 {
        fu(FLAG_ALL, FLAG_X)
    } else {
        fu(FLAG_ALL, 0)
    }
}

/// Table lookup: (bits written, bits read) for one opcode.
fn flag_use(op: u16) -> FlagUse {
    match op >> 12 {
        0x0 => check_line0(op),
        0x1 | 0x2 | 0x3 => check_move(op),
        0x4 => check_line4(op),
        0x5 => check_line5(op),
        0x6 => check_line6(op),
        0x7 => fu(FLAG_NZVC, 0), // MOVEQ
        0x8 => check_line8(op),
        0x9 | 0xd => check_line9_d(op),
        0xa => fu(0, FLAG_ALL), // LINE A exception stacks the SR
        0xb => check_lineb(op),
        0xc => check_linec(op),
        0xe => check_linee(op),
        0xf => NONE,
        _ => unreachable!(),
    }
}

/// Number of extension words an effective-address field consumes.
/// `imm_bytes` is the immediate size for mode 7.4.
fn ea_words(bus: &mut dyn BusBackend, ext_pc: u32, ea: u8, imm_bytes: u8) -> u32 {
    let mode = (ea >> 3) & 7;
    let reg = ea & 7;
    match mode {
        0..=4 => 0,
        5 => 1,
        6 => full_index_words(bus, ext_pc),
        _ => match reg {
            0 => 1,
            1 => 2,
            2 => 1,
            3 => full_index_words(bus, ext_pc),
            4 => match imm_bytes {
                1 | 2 => 1,
                4 => 2,
                8 => 4,
                12 => 6,
                _ => 0,
            },
            _ => 0,
        },
    }
}

fn full_index_words(bus: &mut dyn BusBackend, ext_pc: u32) -> u32 {
    let brief = bus.fetch_16(ext_pc);
    let mut words = 1;
    if brief & 0x100 != 0 {
        match (brief >> 4) & 3 {
            2 => words += 1,
            3 => words += 2,
            _ => {}
        }
        match brief & 3 {
            2 => words += 1,
            3 => words += 2,
            _ => {}
        }
    }
    words
}

/// Total length of the instruction at `pc`, in words, or `None` when
/// the length cannot be determined statically (the scan then stops
/// conservatively).
fn insn_words(bus: &mut dyn BusBackend, pc: u32) -> Option<u32> {
    let op = bus.fetch_16(pc);
    let ea = (op & 0x3f) as u8;
    let size_bits = (op >> 6) & 3;
    let imm_bytes = match size_bits {
        0 => 1,
        1 => 2,
        2 => 4,
        _ => 0,
    };

    let words = match op >> 12 {
        0x0 => {
            if op & 0x0100 != 0 {
                if (op & 0x0038) == 0x0008 {
                    2 // MOVEP
                } else {
                    1 + ea_words(bus, pc + 2, ea, 1) // dynamic bit op
                }
            } else if (op & 0x0f00) == 0x0800 {
                2 + ea_words(bus, pc + 4, ea, 1) // static bit op
            } else {
                let imm_words = if imm_bytes == 4 { 2 } else { 1 };
                1 + imm_words + ea_words(bus, pc + 2 + 2 * imm_words, ea, imm_bytes)
            }
        }
        0x1 | 0x2 | 0x3 => {
            let src_bytes = if op >> 12 == 0x2 { 4 } else { 2 };
            let src = ea_words(bus, pc + 2, ea, src_bytes);
            let dst_ea = (((op >> 9) & 7) | ((op >> 3) & 0x38)) as u8;
            src + ea_words(bus, pc + 2 + 2 * src, dst_ea, 0) + 1
        }
        0x4 => {
            if (op & 0xfff8) == 0x4e50 {
                2 // LINK
            } else if op == 0x4e74 {
                2 // RTD
            } else if op == 0x4e72 {
                2 // STOP
            } else if (op & 0xfb80) == 0x4880 && (op & 0xc0) != 0 && (op & 0x38) != 0 {
                2 + ea_words(bus, pc + 4, ea, 0) // MOVEM
            } else if (op & 0xffc0) == 0x4c00 || (op & 0xffc0) == 0x4c40 {
                2 + ea_words(bus, pc + 4, ea, 4) // MULx.L / DIVx.L
            } else if (op & 0xff00) == 0x4e00 && (op & 0xc0) == 0 {
                1 // TRAP and friends
            } else {
                1 + ea_words(bus, pc + 2, ea, imm_bytes)
            }
        }
        0x5 => {
            if (op & 0x00f8) == 0x00c8 {
                2 // DBcc
            } else if (op & 0x00ff) == 0x00fa || (op & 0x00ff) == 0x00fb {
                return None; // TRAPcc with operand
            } else {
                1 + ea_words(bus, pc + 2, ea, 1)
            }
        }
        0x6 => match op & 0xff {
            0x00 => 2,
            0xff => 3,
            _ => 1,
        },
        0x7 => 1,
        0x8 | 0x9 | 0xb | 0xc | 0xd => 1 + ea_words(bus, pc + 2, ea, imm_bytes),
        0xa => 1,
        0xe => {
            if (op & 0x08c0) == 0x08c0 {
                2 + ea_words(bus, pc + 4, ea, 0) // bitfield
            } else if (op & 0x00c0) == 0x00c0 {
                1 + ea_words(bus, pc + 2, ea, 0) // memory shift
            } else {
                1
            }
        }
        0xf => return None, // coprocessor: give up
        _ => unreachable!(),
    };
    Some(words)
}

/// True when the opcode ends straight-line execution.
fn is_branch(op: u16) -> bool {
    if op >> 12 == 0x6 {
        return true;
    }
    if (op & 0xf0f8) == 0x50c8 {
        return true; // DBcc
    }
    matches!(op, 0x4e70..=0x4e77) // RESET..RTR, incl. RTS/RTE
        || (op & 0xffc0) == 0x4ec0 // JMP
        || (op & 0xffc0) == 0x4e80 // JSR
        || (op & 0xfff0) == 0x4e40 // TRAP
}

/// Resolve the target of a BRA/BSR/Bcc at `pc`.
fn branch_target(bus: &mut dyn BusBackend, pc: u32, op: u16) -> (u32, u32) {
    // Returns (target, fall-through).
    let disp8 = (op & 0xff) as i8;
    match op & 0xff {
        0x00 => {
            let d = bus.fetch_16(pc + 2) as i16 as i32;
            ((pc + 2).wrapping_add_signed(d), pc + 4)
        }
        0xff => {
            let hi = bus.fetch_16(pc + 2) as u32;
            let lo = bus.fetch_16(pc + 4) as u32;
            ((pc + 2).wrapping_add((hi << 16) | lo), pc + 6)
        }
        _ => ((pc + 2).wrapping_add_signed(disp8 as i32), pc + 2),
    }
}

/// Scan one straight-line path, consuming `mask` until it is empty or
/// the budget runs out. Returns the surviving mask plus bits seen read.
fn scan_linear(
    bus: &mut dyn BusBackend,
    mut pc: u32,
    mut mask: u8,
    mut needed: u8,
    mut depth: u32,
    max_depth: u32,
) -> u8 {
    while mask != 0 && depth < max_depth {
        depth += 1;
        let op = bus.fetch_16(pc);
        if is_branch(op) {
            break;
        }
        let use_ = flag_use(op);
        needed |= mask & use_.needs;
        mask &= !use_.sets;
        if use_.needs == FLAG_ALL {
            break;
        }
        let Some(words) = insn_words(bus, pc) else {
            break;
        };
        pc = pc.wrapping_add(2 * words);
    }
    mask | needed
}

/// Instruction-stream reader that records the furthest byte touched,
/// so the scan's lookahead can be folded into a unit's verification
/// footprint.
struct TrackingBus<'a> {
    inner: &'a mut dyn BusBackend,
    max_read: u32,
}

impl crate::bus::BusBackend for TrackingBus<'_> {
    fn read(&mut self, addr: u32, width: crate::bus::Width) -> u128 {
        let end = addr.wrapping_add(width.bytes()).wrapping_sub(1);
        if end > self.max_read {
            self.max_read = end;
        }
        self.inner.read(addr, width)
    }

    fn write(&mut self, addr: u32, width: crate::bus::Width, value: u128) {
        self.inner.write(addr, width, value)
    }
}

/// Bounded forward liveness scan.
#[derive(Debug, Clone, Copy)]
pub struct FlagAnalyzer {
    max_depth: u32,
}

impl FlagAnalyzer {
    pub fn new(max_depth: u32) -> Self {
        Self { max_depth }
    }

    /// Like [`Self::needed_flags`], also reporting the furthest guest
    /// byte the scan read. The caller folds that lookahead into the
    /// unit's verification footprint.
    pub fn needed_flags_with_extent(&self, bus: &mut dyn BusBackend, pc: u32) -> (u8, u32) {
        let mut tracker = TrackingBus {
            inner: bus,
            max_read: pc,
        };
        let needed = self.needed_flags(&mut tracker, pc);
        (needed, tracker.max_read)
    }

    /// The set of CCR bits the instruction at `pc` must actually
    /// produce: the intersection of what it writes with what some
    /// later instruction may read, plus what it reads itself.
    pub fn needed_flags(&self, bus: &mut dyn BusBackend, pc: u32) -> u8 {
        let op = bus.fetch_16(pc);
        let first = flag_use(op);
        let mut mask = first.sets;
        let mut needed = first.needs;
        let mut depth = 0;
        let mut cursor = pc;

        while mask != 0 && depth < self.max_depth {
            depth += 1;
            let op = bus.fetch_16(cursor);
            if is_branch(op) {
                if (op & 0xfe00) == 0x6000 {
                    // BRA/BSR: follow the static target.
                    let (target, _) = branch_target(bus, cursor, op);
                    cursor = target;
                } else if (op & 0xffbe) == 0x4eb8 {
                    // JMP/JSR absolute short/long.
                    cursor = if op & 1 != 0 {
                        let hi = bus.fetch_16(cursor + 2) as u32;
                        let lo = bus.fetch_16(cursor + 4) as u32;
                        (hi << 16) | lo
                    } else {
                        bus.fetch_16(cursor + 2) as i16 as i32 as u32
                    };
                } else if op >> 12 == 0x6 {
                    // Conditional branch: the test itself reads flags,
                    // then the scan forks and the results are unioned.
                    needed |= mask & condition_needs((op >> 8) as u8);
                    let (target, fall) = branch_target(bus, cursor, op);
                    let taken = scan_linear(bus, target, mask, needed, depth, self.max_depth);
                    let fallthrough = scan_linear(bus, fall, mask, needed, depth, self.max_depth);
                    return taken | fallthrough;
                } else {
                    // Indirect flow: stop conservatively.
                    break;
                }
            } else {
                let Some(words) = insn_words(bus, cursor) else {
                    break;
                };
                cursor = cursor.wrapping_add(2 * words);
            }

            let op = bus.fetch_16(cursor);
            let use_ = flag_use(op);
            needed |= mask & use_.needs;
            mask &= !use_.sets;
            if use_.needs == FLAG_ALL {
                break;
            }
        }

        mask | needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusBackend, ShadowRam, Width};

    fn code(words: &[u16]) -> ShadowRam {
        let mut ram = ShadowRam::new(0x1000, 0x200);
        for (i, w) in words.iter().enumerate() {
            ram.write(0x1000 + 2 * i as u32, Width::Word, *w as u128);
        }
        ram
    }

    #[test]
    fn dead_flags_pruned_by_following_writer() {
        // MOVEQ #1,D0 ; MOVEQ #2,D0 ; RTS — the first MOVEQ's NZVC are
        // all rewritten before any read.
        let mut ram = code(&[0x7001, 0x7002, 0x4e75]);
        let fa = FlagAnalyzer::new(20);
        assert_eq!(fa.needed_flags(&mut ram, 0x1000), 0);
    }

    #[test]
    fn conditional_reader_keeps_flag_alive() {
        // SUBQ.L #1,D6 ; BNE.S -4 — the branch consumes Z; the taken
        // path rewrites everything, the fall-through hits RTS and keeps
        // the rest conservatively alive.
        let mut ram = code(&[0x5386, 0x66fc, 0x4e75]);
        let fa = FlagAnalyzer::new(20);
        let needed = fa.needed_flags(&mut ram, 0x1000);
        assert_ne!(needed & FLAG_Z, 0);
    }

    #[test]
    fn depth_bound_returns_superset() {
        // A long run of ADDQs after a SUB: with depth 1 the scan cannot
        // see any overwrite, so everything the SUB sets stays required.
        let mut ram = code(&[0x5386, 0x7001, 0x7001, 0x4e75]);
        let fa = FlagAnalyzer::new(0);
        assert_eq!(fa.needed_flags(&mut ram, 0x1000), FLAG_ALL);
    }

    #[test]
    fn move_to_an_writes_nothing() {
        assert_eq!(flag_use(0x2040).sets, 0); // MOVEA.L D0,A0
        assert_eq!(flag_use(0x2000).sets, FLAG_NZVC); // MOVE.L D0,D0
    }

    #[test]
    fn scc_and_dbcc_consume_their_condition() {
        // SNE D0
        assert_eq!(flag_use(0x56c0).needs, FLAG_Z);
        // DBEQ D0, disp
        assert_eq!(flag_use(0x57c8).needs, FLAG_Z);
        // SGE
        assert_eq!(flag_use(0x5cc0).needs, FLAG_N | FLAG_V);
    }
}
