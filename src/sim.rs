//! Reference execution backend.
//!
//! Interprets the host instruction words of a translation unit against
//! the guest state and bus, the way the aero stack uses a reference
//! runtime to execute its generated code under test. Every load and
//! store is routed through the fault handler's decode tables, so the
//! emitter and the fault path are exercised against each other on each
//! access — the production backend only takes that path for unmapped
//! pages.

use crate::bus::{BusBackend, Width};
use crate::emit::a64::{self, SysReg};
use crate::emit::hostreg;
use crate::error::CoreError;
use crate::fault::{self, FAR_UNKNOWN, HostRegs};
use crate::jit::dispatch::UnitExecutor;
use crate::jit::unit::TranslationUnit;
use crate::state::{GuestState, ctx as ctxoff, swap_cv};

/// Synthetic host address of the guest-state block. The low 32 bits
/// fall in the unused motherboard space above the Zorro window, so the
/// folded guest view cannot collide with RAM or chipset registers.
pub const CTX_BASE: u64 = 0x6000_ee00_0000;

/// The guest-visible alias of the context block after address folding.
const CTX_FOLDED: u32 = CTX_BASE as u32;

/// Link-register value marking "return to the dispatcher".
const RETURN_SENTINEL: u64 = 0x5a5a_0000_0000;

/// Bus adapter that folds the guest-state window into the address
/// space. Values leave byte-swapped so the image semantics of the
/// fault path cancel out to native field accesses.
struct SimBus<'a> {
    state: &'a mut GuestState,
    bus: &'a mut dyn BusBackend,
}

impl SimBus<'_> {
    fn ctx_offset(addr: u32) -> Option<u32> {
        if (CTX_FOLDED..CTX_FOLDED + ctxoff::SIZE).contains(&addr) {
            Some(addr - CTX_FOLDED)
        } else {
            None
        }
    }
}

impl BusBackend for SimBus<'_> {
    fn read(&mut self, addr: u32, width: Width) -> u128 {
        match Self::ctx_offset(addr) {
            Some(off) => {
                let native = self.state.ctx_read(off, width.bytes() as u8);
                swap_for_width(native, width) as u128
            }
            None => self.bus.read(addr, width),
        }
    }

    fn write(&mut self, addr: u32, width: Width, value: u128) {
        match Self::ctx_offset(addr) {
            Some(off) => {
                let native = swap_for_width(value as u64, width);
                self.state.ctx_write(off, width.bytes() as u8, native);
            }
            None => self.bus.write(addr, width, value),
        }
    }
}

#[inline]
fn swap_for_width(value: u64, width: Width) -> u64 {
    match width {
        Width::Byte => value & 0xff,
        Width::Word => (value as u16).swap_bytes() as u64,
        Width::Long => (value as u32).swap_bytes() as u64,
        _ => value.swap_bytes(),
    }
}

/// The interpreter backend.
#[derive(Debug, Clone)]
pub struct Interp {
    /// Host instruction budget per unit entry, a backstop against
    /// runaway loops in generated code.
    pub max_steps: u64,
}

impl Default for Interp {
    fn default() -> Self {
        Self {
            max_steps: 50_000_000,
        }
    }
}

/// NZCV bits live in 31..28, exactly as the system register reads.
#[derive(Debug, Clone, Copy, Default)]
struct Flags(u32);

impl Flags {
    fn set(&mut self, n: bool, z: bool, c: bool, v: bool) {
        self.0 = (n as u32) << 31 | (z as u32) << 30 | (c as u32) << 29 | (v as u32) << 28;
    }

    fn n(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    fn z(self) -> bool {
        self.0 & 0x4000_0000 != 0
    }

    fn c(self) -> bool {
        self.0 & 0x2000_0000 != 0
    }

    fn v(self) -> bool {
        self.0 & 0x1000_0000 != 0
    }

    fn holds(self, cond: u8) -> bool {
        let base = match cond >> 1 {
            0 => self.z(),
            1 => self.c(),
            2 => self.n(),
            3 => self.v(),
            4 => self.c() && !self.z(),
            5 => self.n() == self.v(),
            6 => self.n() == self.v() && !self.z(),
            _ => true,
        };
        if cond >= 14 { true } else { base ^ (cond & 1 != 0) }
    }
}

fn add_with_carry_32(a: u32, b: u32, carry: bool) -> (u32, Flags) {
    let wide = a as u64 + b as u64 + carry as u64;
    let res = wide as u32;
    let mut f = Flags::default();
    f.set(
        res & 0x8000_0000 != 0,
        res == 0,
        wide >> 32 != 0,
        (!(a ^ b) & (a ^ res)) & 0x8000_0000 != 0,
    );
    (res, f)
}

fn add_with_carry_64(a: u64, b: u64, carry: bool) -> (u64, Flags) {
    let wide = a as u128 + b as u128 + carry as u128;
    let res = wide as u64;
    let mut f = Flags::default();
    f.set(
        res >> 63 != 0,
        res == 0,
        wide >> 64 != 0,
        (!(a ^ b) & (a ^ res)) >> 63 != 0,
    );
    (res, f)
}

fn shifted_operand_64(value: u64, shift: u32, amount: u32, is64: bool) -> u64 {
    let v = if is64 { value } else { value as u32 as u64 };
    let res = match shift {
        0 => v.wrapping_shl(amount),
        1 => {
            if is64 {
                v.wrapping_shr(amount)
            } else {
                ((v as u32).wrapping_shr(amount)) as u64
            }
        }
        2 => {
            if is64 {
                (v as i64).wrapping_shr(amount) as u64
            } else {
                ((v as u32 as i32).wrapping_shr(amount)) as u32 as u64
            }
        }
        _ => {
            if is64 {
                v.rotate_right(amount)
            } else {
                ((v as u32).rotate_right(amount)) as u64
            }
        }
    };
    if is64 { res } else { res as u32 as u64 }
}

/// Interpreter state for one unit entry.
struct Cpu {
    regs: HostRegs,
    flags: Flags,
    sr_scratch: u64,
    ctx_ptr: u64,
    pc_guard: u64,
    fpcr: u64,
}

impl Interp {
    fn load_context(state: &GuestState) -> Cpu {
        let mut regs = HostRegs::default();
        for i in 0..8 {
            regs.x[hostreg::d(i as u8) as usize] = state.d[i] as u64;
            regs.x[hostreg::a(i as u8) as usize] = state.a[i] as u64;
            regs.v[hostreg::fp(i as u8) as usize] = state.fp[i].to_bits();
        }
        regs.x[hostreg::PC as usize] = state.pc as u64;
        regs.x[hostreg::LR as usize] = RETURN_SENTINEL;
        Cpu {
            regs,
            flags: Flags::default(),
            sr_scratch: swap_cv(state.sr) as u64,
            ctx_ptr: CTX_BASE,
            pc_guard: 0,
            fpcr: 0,
        }
    }

    fn save_context(cpu: &Cpu, state: &mut GuestState) {
        for i in 0..8 {
            state.d[i] = cpu.regs.x[hostreg::d(i as u8) as usize] as u32;
            state.a[i] = cpu.regs.x[hostreg::a(i as u8) as usize] as u32;
            state.fp[i] = f64::from_bits(cpu.regs.v[hostreg::fp(i as u8) as usize]);
        }
        state.pc = cpu.regs.x[hostreg::PC as usize] as u32;
        state.sr = swap_cv(cpu.sr_scratch as u16);
    }
}

impl UnitExecutor for Interp {
    fn run(
        &mut self,
        unit: &TranslationUnit,
        state: &mut GuestState,
        bus: &mut dyn BusBackend,
    ) -> Result<(), CoreError> {
        let code = &unit.host_code;
        let mut cpu = Self::load_context(state);
        let mut idx: i64 = 0;
        let mut steps = 0u64;

        loop {
            steps += 1;
            if steps > self.max_steps {
                Self::save_context(&cpu, state);
                return Err(CoreError::Executor("host instruction budget exceeded"));
            }
            if idx < 0 || idx as usize >= code.len() {
                Self::save_context(&cpu, state);
                return Err(CoreError::Executor("branch left the unit"));
            }
            let op = code[idx as usize];

            match step(&mut cpu, op, state, bus)? {
                Step::Next => idx += 1,
                Step::Branch(delta) => idx += delta as i64,
                Step::Return => break,
            }
        }

        Self::save_context(&cpu, state);
        Ok(())
    }
}

enum Step {
    Next,
    Branch(i32),
    Return,
}

#[inline]
fn sext(value: u32, bits: u32) -> i32 {
    ((value << (32 - bits)) as i32) >> (32 - bits)
}

fn step(
    cpu: &mut Cpu,
    op: u32,
    state: &mut GuestState,
    bus: &mut dyn BusBackend,
) -> Result<Step, CoreError> {
    let sf = op & 0x8000_0000 != 0;
    let rd = op & 31;
    let rn5 = (op >> 5) & 31;
    let rm16 = (op >> 16) & 31;

    // Return.
    if op == a64::ret() {
        return Ok(Step::Return);
    }
    if op & 0xffff_fc1f == 0xd65f_0000 {
        let target = cpu.regs.gpr(rn5);
        if target == RETURN_SENTINEL {
            return Ok(Step::Return);
        }
        return Err(CoreError::Executor("indirect return target"));
    }

    // Unconditional branch.
    if op & 0x7c00_0000 == 0x1400_0000 {
        let delta = sext(op & 0x03ff_ffff, 26);
        if op & 0x8000_0000 != 0 {
            cpu.regs.x[hostreg::LR as usize] = RETURN_SENTINEL;
        }
        return Ok(Step::Branch(delta));
    }
    // Conditional branch.
    if op & 0xff00_0010 == 0x5400_0000 {
        let cond = (op & 15) as u8;
        let delta = sext((op >> 5) & 0x7ffff, 19);
        return Ok(if cpu.flags.holds(cond) {
            Step::Branch(delta)
        } else {
            Step::Next
        });
    }
    // CBZ/CBNZ.
    if op & 0x7e00_0000 == 0x3400_0000 {
        let v = if sf {
            cpu.regs.gpr(rd)
        } else {
            cpu.regs.gpr(rd) as u32 as u64
        };
        let taken = (v == 0) != (op & 0x0100_0000 != 0);
        let delta = sext((op >> 5) & 0x7ffff, 19);
        return Ok(if taken { Step::Branch(delta) } else { Step::Next });
    }
    // TBZ/TBNZ.
    if op & 0x7e00_0000 == 0x3600_0000 {
        let bit = ((op >> 19) & 31) | ((op >> 26) & 0x20);
        let set = cpu.regs.gpr(rd) & (1 << bit) != 0;
        let taken = set == (op & 0x0100_0000 != 0);
        let delta = sext((op >> 5) & 0x3fff, 14);
        return Ok(if taken { Step::Branch(delta) } else { Step::Next });
    }

    // System register moves.
    if op & 0xfff0_0000 == 0xd530_0000 {
        let value = match sysreg_of(op) {
            Some(SysReg::SrScratch) => cpu.sr_scratch,
            Some(SysReg::CtxPointer) => cpu.ctx_ptr,
            Some(SysReg::PcGuard) => cpu.pc_guard,
            Some(SysReg::Nzcv) => cpu.flags.0 as u64,
            Some(SysReg::Fpcr) => cpu.fpcr,
            None => return Err(CoreError::Executor("unknown system register read")),
        };
        cpu.regs.set_gpr(rd, value);
        return Ok(Step::Next);
    }
    if op & 0xfff0_0000 == 0xd510_0000 {
        let value = cpu.regs.gpr(rd);
        match sysreg_of(op) {
            Some(SysReg::SrScratch) => cpu.sr_scratch = value,
            Some(SysReg::CtxPointer) => {}
            Some(SysReg::PcGuard) => cpu.pc_guard = value,
            Some(SysReg::Nzcv) => cpu.flags.0 = value as u32 & 0xf000_0000,
            Some(SysReg::Fpcr) => cpu.fpcr = value,
            None => return Err(CoreError::Executor("unknown system register write")),
        }
        return Ok(Step::Next);
    }
    if op == a64::cfinv() {
        cpu.flags.0 ^= 0x2000_0000;
        return Ok(Step::Next);
    }
    // Hints, barriers, cache maintenance: nothing to observe.
    if op & 0xffff_f000 == 0xd503_2000
        || op == a64::dsb_sy()
        || op == a64::dmb_ish()
        || op == a64::isb()
        || op & 0xfff8_0000 == 0xd508_0000
    {
        return Ok(Step::Next);
    }
    // Traps.
    if op & 0xffe0_001f == 0xd440_0000 {
        let imm = ((op >> 5) & 0xffff) as u16;
        if imm == a64::GUARD_TRAP {
            return Err(CoreError::TranslatorBug("guard trap executed"));
        }
        let mut sim_bus = SimBus { state, bus };
        if fault::handle_fp_trap(imm, &mut cpu.regs, &mut sim_bus) {
            return Ok(Step::Next);
        }
        return Err(CoreError::Executor("unexpected trap"));
    }

    // Loads and stores: route through the fault decoder so the shared
    // tables are exercised on every access.
    if op & 0x0a00_0000 == 0x0800_0000 {
        let mut sim_bus = SimBus { state, bus };
        let literal = op & 0xbf00_0000 == 0x1800_0000 || op & 0xff00_0000 == 0x9800_0000;
        // Everything with the L bit, plus the sign-extend-to-64 loads
        // whose opc field clears it.
        let load = literal
            || op & 0x0040_0000 != 0
            || op & 0x3fc0_0000 == 0x3980_0000
            || op & 0x3fe0_0000 == 0x3880_0000;
        if load {
            fault::handle_read_fault(op, &mut cpu.regs, FAR_UNKNOWN, &mut sim_bus)?;
        } else {
            fault::handle_write_fault(op, &mut cpu.regs, FAR_UNKNOWN, &mut sim_bus)?;
        }
        return Ok(Step::Next);
    }

    // Move wide.
    if op & 0x1f80_0000 == 0x1280_0000 {
        let imm = ((op >> 5) & 0xffff) as u64;
        let hw = ((op >> 21) & 3) * 16;
        let value = match (op >> 29) & 3 {
            0 => !(imm << hw),
            2 => imm << hw,
            3 => {
                let keep = !(0xffffu64 << hw);
                (cpu.regs.gpr(rd) & keep) | (imm << hw)
            }
            _ => return Err(CoreError::Executor("bad move-wide opc")),
        };
        let value = if sf { value } else { value as u32 as u64 };
        cpu.regs.set_gpr(rd, value);
        return Ok(Step::Next);
    }

    // Add/subtract immediate.
    if op & 0x1f00_0000 == 0x1100_0000 {
        let imm = ((op >> 10) & 0xfff) as u64;
        let imm = if op & 0x0040_0000 != 0 { imm << 12 } else { imm };
        let sub = op & 0x4000_0000 != 0;
        let setflags = op & 0x2000_0000 != 0;
        let a = cpu.regs.gpr(rn5);
        let (res, flags) = if sf {
            let b = if sub { !imm } else { imm };
            add_with_carry_64(a, b, sub)
        } else {
            let b = if sub { !(imm as u32) } else { imm as u32 };
            let (r, f) = add_with_carry_32(a as u32, b, sub);
            (r as u64, f)
        };
        if setflags {
            cpu.flags = flags;
        }
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // Logical immediate.
    if op & 0x1f80_0000 == 0x1200_0000 {
        let n = (op >> 22) & 1;
        let immr = (op >> 16) & 0x3f;
        let imms = (op >> 10) & 0x3f;
        let mask = a64::decode_bitmask(n, immr, imms, sf)
            .ok_or(CoreError::Executor("bad logical immediate"))?;
        let a = if sf {
            cpu.regs.gpr(rn5)
        } else {
            cpu.regs.gpr(rn5) as u32 as u64
        };
        let opc = (op >> 29) & 3;
        let res = match opc {
            0 | 3 => a & mask,
            1 => a | mask,
            _ => a ^ mask,
        };
        let res = if sf { res } else { res as u32 as u64 };
        if opc == 3 {
            let neg = if sf { res >> 63 != 0 } else { res >> 31 != 0 };
            cpu.flags.set(neg, res == 0, false, false);
        }
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // Bitfield moves.
    if op & 0x1f80_0000 == 0x1300_0000 {
        let immr = (op >> 16) & 0x3f;
        let imms = (op >> 10) & 0x3f;
        let src = cpu.regs.gpr(rn5);
        let dst = cpu.regs.gpr(rd);
        let opc = (op >> 29) & 3;
        let res = bitfield_move(dst, src, immr, imms, sf, opc)?;
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }
    // EXTR.
    if op & 0x1f80_0000 == 0x1380_0000 {
        let lsb = (op >> 10) & 0x3f;
        let res = if sf {
            let cat = ((cpu.regs.gpr(rn5) as u128) << 64) | cpu.regs.gpr(rm16) as u128;
            (cat >> lsb) as u64
        } else {
            let cat = ((cpu.regs.gpr(rn5) as u32 as u64) << 32) | cpu.regs.gpr(rm16) as u32 as u64;
            ((cat >> lsb) as u32) as u64
        };
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // Logical shifted register.
    if op & 0x1f00_0000 == 0x0a00_0000 {
        let amount = (op >> 10) & 0x3f;
        let shift = (op >> 22) & 3;
        let mut b = shifted_operand_64(cpu.regs.gpr(rm16), shift, amount, sf);
        if op & 0x0020_0000 != 0 {
            b = if sf { !b } else { !b & 0xffff_ffff };
        }
        let a = if sf {
            cpu.regs.gpr(rn5)
        } else {
            cpu.regs.gpr(rn5) as u32 as u64
        };
        let opc = (op >> 29) & 3;
        let res = match opc {
            0 | 3 => a & b,
            1 => a | b,
            _ => a ^ b,
        };
        let res = if sf { res } else { res as u32 as u64 };
        if opc == 3 {
            let neg = if sf { res >> 63 != 0 } else { res >> 31 != 0 };
            cpu.flags.set(neg, res == 0, false, false);
        }
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // Add/subtract shifted register.
    if op & 0x1f20_0000 == 0x0b00_0000 {
        let amount = (op >> 10) & 0x3f;
        let shift = (op >> 22) & 3;
        let b = shifted_operand_64(cpu.regs.gpr(rm16), shift, amount, sf);
        let sub = op & 0x4000_0000 != 0;
        let setflags = op & 0x2000_0000 != 0;
        let a = cpu.regs.gpr(rn5);
        let (res, flags) = if sf {
            add_with_carry_64(a, if sub { !b } else { b }, sub)
        } else {
            let (r, f) = add_with_carry_32(a as u32, if sub { !(b as u32) } else { b as u32 }, sub);
            (r as u64, f)
        };
        if setflags {
            cpu.flags = flags;
        }
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // Add/subtract with carry.
    if op & 0x1fe0_fc00 == 0x1a00_0000 {
        let sub = op & 0x4000_0000 != 0;
        let setflags = op & 0x2000_0000 != 0;
        let a = cpu.regs.gpr(rn5);
        let b = cpu.regs.gpr(rm16);
        let (res, flags) = if sf {
            add_with_carry_64(a, if sub { !b } else { b }, cpu.flags.c())
        } else {
            let bb = if sub { !(b as u32) } else { b as u32 };
            let (r, f) = add_with_carry_32(a as u32, bb, cpu.flags.c());
            (r as u64, f)
        };
        if setflags {
            cpu.flags = flags;
        }
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // Conditional select family.
    if op & 0x1fe0_0800 == 0x1a80_0000 {
        let cond = ((op >> 12) & 15) as u8;
        let invert = op & 0x4000_0000 != 0;
        let increment = op & 0x0400 != 0;
        let a = cpu.regs.gpr(rn5);
        let b = cpu.regs.gpr(rm16);
        let res = if cpu.flags.holds(cond) {
            a
        } else {
            let mut v = b;
            if invert {
                v = !v;
            }
            if increment {
                v = v.wrapping_add(1);
            }
            v
        };
        let res = if sf { res } else { res as u32 as u64 };
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // Two-source data processing.
    if op & 0x5fe0_0000 == 0x1ac0_0000 {
        let a = cpu.regs.gpr(rn5);
        let b = cpu.regs.gpr(rm16);
        let res = match (op >> 10) & 0x3f {
            2 => {
                // UDIV
                if sf {
                    if b == 0 { 0 } else { a / b }
                } else {
                    let (a, b) = (a as u32, b as u32);
                    (if b == 0 { 0 } else { a / b }) as u64
                }
            }
            3 => {
                // SDIV
                if sf {
                    let (a, b) = (a as i64, b as i64);
                    (if b == 0 { 0 } else { a.wrapping_div(b) }) as u64
                } else {
                    let (a, b) = (a as u32 as i32, b as u32 as i32);
                    (if b == 0 { 0 } else { a.wrapping_div(b) }) as u32 as u64
                }
            }
            8 => shifted_operand_64(a, 0, (b % if sf { 64 } else { 32 }) as u32, sf),
            9 => shifted_operand_64(a, 1, (b % if sf { 64 } else { 32 }) as u32, sf),
            10 => shifted_operand_64(a, 2, (b % if sf { 64 } else { 32 }) as u32, sf),
            11 => shifted_operand_64(a, 3, (b % if sf { 64 } else { 32 }) as u32, sf),
            _ => return Err(CoreError::Executor("unknown two-source op")),
        };
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // One-source data processing.
    if op & 0x5fe0_e000 == 0x5ac0_0000 {
        let a = cpu.regs.gpr(rn5);
        let res = match (op >> 10) & 0x3f {
            0 => {
                if sf {
                    a.reverse_bits()
                } else {
                    (a as u32).reverse_bits() as u64
                }
            }
            1 => {
                // REV16: swap bytes within each halfword.
                if sf {
                    let mut r = 0u64;
                    for i in 0..4 {
                        let half = (a >> (16 * i)) as u16;
                        r |= (half.swap_bytes() as u64) << (16 * i);
                    }
                    r
                } else {
                    let lo = (a as u16).swap_bytes() as u64;
                    let hi = ((a >> 16) as u16).swap_bytes() as u64;
                    (hi << 16) | lo
                }
            }
            2 => {
                if sf {
                    let lo = (a as u32).swap_bytes() as u64;
                    let hi = ((a >> 32) as u32).swap_bytes() as u64;
                    (hi << 32) | lo
                } else {
                    (a as u32).swap_bytes() as u64
                }
            }
            3 if sf => a.swap_bytes(),
            4 => {
                if sf {
                    a.leading_zeros() as u64
                } else {
                    (a as u32).leading_zeros() as u64
                }
            }
            _ => return Err(CoreError::Executor("unknown one-source op")),
        };
        let res = if sf { res } else { res as u32 as u64 };
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // Multiply-add family.
    if op & 0xffe0_0000 == 0x9b20_0000 || op & 0xffe0_0000 == 0x9ba0_0000 {
        // SMADDL / UMADDL
        let ra = (op >> 10) & 31;
        let acc = cpu.regs.gpr(ra);
        let prod = if op & 0x0080_0000 != 0 {
            (cpu.regs.gpr(rn5) as u32 as u64).wrapping_mul(cpu.regs.gpr(rm16) as u32 as u64)
        } else {
            ((cpu.regs.gpr(rn5) as u32 as i32 as i64)
                .wrapping_mul(cpu.regs.gpr(rm16) as u32 as i32 as i64)) as u64
        };
        cpu.regs.set_gpr(rd, acc.wrapping_add(prod));
        return Ok(Step::Next);
    }
    if op & 0x1f00_0000 == 0x1b00_0000 {
        let ra = (op >> 10) & 31;
        let acc = cpu.regs.gpr(ra);
        let a = cpu.regs.gpr(rn5);
        let b = cpu.regs.gpr(rm16);
        let sub = op & 0x8000 != 0;
        let res = if sf {
            let p = a.wrapping_mul(b);
            if sub { acc.wrapping_sub(p) } else { acc.wrapping_add(p) }
        } else {
            let p = (a as u32).wrapping_mul(b as u32);
            let r = if sub {
                (acc as u32).wrapping_sub(p)
            } else {
                (acc as u32).wrapping_add(p)
            };
            r as u64
        };
        cpu.regs.set_gpr(rd, res);
        return Ok(Step::Next);
    }

    // Floating point.
    if let Some(next) = fp_step(cpu, op)? {
        return Ok(next);
    }

    log::error!(target: "jit", "reference executor cannot decode {op:#010x}");
    Err(CoreError::Executor("undecodable host instruction"))
}

fn sysreg_of(op: u32) -> Option<SysReg> {
    for sr in [
        SysReg::SrScratch,
        SysReg::CtxPointer,
        SysReg::PcGuard,
        SysReg::Nzcv,
        SysReg::Fpcr,
    ] {
        if a64::mrs(0, sr) & 0x000f_ffe0 == op & 0x000f_ffe0 {
            return Some(sr);
        }
    }
    None
}

fn bitfield_move(
    dst: u64,
    src: u64,
    immr: u32,
    imms: u32,
    is64: bool,
    opc: u32,
) -> Result<u64, CoreError> {
    let size: u32 = if is64 { 64 } else { 32 };
    let ones = |n: u32| -> u64 {
        if n >= 64 { u64::MAX } else { (1u64 << n) - 1 }
    };
    let src = if is64 { src } else { src as u32 as u64 };

    let (field, shift, width) = if imms >= immr {
        // Extract src[imms:immr] at bit 0.
        let width = imms - immr + 1;
        ((src >> immr) & ones(width), 0u32, width)
    } else {
        // Insert src[imms:0] at bit (size - immr).
        let width = imms + 1;
        let shift = size - immr;
        ((src & ones(width)) << shift, shift, width)
    };

    let top = shift + width - 1;
    let mask = ones(width) << shift;
    let res = match opc {
        0 => {
            // SBFM: sign-extend from the field's top bit.
            if field >> top & 1 != 0 {
                field | (!ones(top + 1) & ones(size))
            } else {
                field
            }
        }
        1 => (dst & !mask) | field, // BFM
        2 => field,                 // UBFM
        _ => return Err(CoreError::Executor("bad bitfield opc")),
    };
    Ok(if is64 { res } else { res as u32 as u64 })
}

/// Floating-point subset: everything the FPU translator emits.
fn fp_step(cpu: &mut Cpu, op: u32) -> Result<Option<Step>, CoreError> {
    let rd = (op & 31) as usize;
    let rn = ((op >> 5) & 31) as usize;
    let rm = ((op >> 16) & 31) as usize;

    // Compare forms first (their low bits overlap the two-register
    // layout).
    if op & 0xffe0_fc1f == 0x1e60_2000 || op & 0xffff_fc1f == 0x1e60_2008 {
        let a = f64::from_bits(cpu.regs.v[rn]);
        let b = if op & 8 != 0 {
            0.0
        } else {
            f64::from_bits(cpu.regs.v[rm])
        };
        if a.is_nan() || b.is_nan() {
            cpu.flags.set(false, false, true, true);
        } else if a == b {
            cpu.flags.set(false, true, true, false);
        } else if a < b {
            cpu.flags.set(true, false, false, false);
        } else {
            cpu.flags.set(false, false, true, false);
        }
        return Ok(Some(Step::Next));
    }

    // Three-operand arithmetic.
    let a = f64::from_bits(cpu.regs.v[rn]);
    let b = f64::from_bits(cpu.regs.v[rm]);
    match op & 0xffe0_fc00 {
        0x1e60_2800 => {
            cpu.regs.v[rd] = (a + b).to_bits();
            return Ok(Some(Step::Next));
        }
        0x1e60_3800 => {
            cpu.regs.v[rd] = (a - b).to_bits();
            return Ok(Some(Step::Next));
        }
        0x1e60_0800 => {
            cpu.regs.v[rd] = (a * b).to_bits();
            return Ok(Some(Step::Next));
        }
        0x1e60_1800 => {
            cpu.regs.v[rd] = (a / b).to_bits();
            return Ok(Some(Step::Next));
        }
        _ => {}
    }

    // Two-operand forms.
    let result = match op & 0xffff_fc00 {
        x if x == 0x1e60_4000 => Some(a.to_bits()),              // fmov d,d
        x if x == 0x1e60_c000 => Some(a.abs().to_bits()),        // fabs
        x if x == 0x1e61_4000 => Some((-a).to_bits()),           // fneg
        x if x == 0x1e61_c000 => Some(a.sqrt().to_bits()),       // fsqrt
        x if x == 0x1e65_c000 => Some(a.trunc().to_bits()),      // frintz
        x if x == 0x1e67_c000 => {
            // frinti: round per the FPCR mode.
            let rounded = match (cpu.fpcr >> 22) & 3 {
                0 => a.round_ties_even(),
                1 => a.ceil(),
                2 => a.floor(),
                _ => a.trunc(),
            };
            Some(rounded.to_bits())
        }
        x if x == 0x1e62_4000 => {
            // fcvt d -> s: the S view holds raw f32 bits.
            Some((a as f32).to_bits() as u64)
        }
        x if x == 0x1e22_c000 => {
            // fcvt s -> d
            let s32 = f32::from_bits(cpu.regs.v[rn] as u32);
            Some((s32 as f64).to_bits())
        }
        x if x == 0x1e62_0000 => {
            // scvtf d <- w
            Some(((cpu.regs.gpr(rn as u32) as u32 as i32) as f64).to_bits())
        }
        _ => None,
    };
    if let Some(bits) = result {
        cpu.regs.v[rd] = bits;
        return Ok(Some(Step::Next));
    }

    match op & 0xffff_fc00 {
        x if x == 0x1e78_0000 => {
            // fcvtzs w <- d (saturating, NaN to zero)
            let v = f64::from_bits(cpu.regs.v[rn]) as i32;
            cpu.regs.set_gpr(rd as u32, v as u32 as u64);
            Ok(Some(Step::Next))
        }
        x if x == 0x1e26_0000 => {
            // fmov w <- s
            let bits = cpu.regs.v[rn] as u32;
            cpu.regs.set_gpr(rd as u32, bits as u64);
            Ok(Some(Step::Next))
        }
        x if x == 0x1e27_0000 => {
            // fmov s <- w
            cpu.regs.v[rd] = cpu.regs.gpr(rn as u32) as u32 as u64;
            Ok(Some(Step::Next))
        }
        x if x == 0x9e66_0000 => {
            cpu.regs.set_gpr(rd as u32, cpu.regs.v[rn]);
            Ok(Some(Step::Next))
        }
        x if x == 0x9e67_0000 => {
            cpu.regs.v[rd] = cpu.regs.gpr(rn as u32);
            Ok(Some(Step::Next))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_condition_evaluation() {
        let mut f = Flags::default();
        f.set(false, true, false, false);
        assert!(f.holds(a64::cc::EQ));
        assert!(!f.holds(a64::cc::NE));
        assert!(f.holds(a64::cc::AL));
        f.set(true, false, false, true);
        assert!(f.holds(a64::cc::GE)); // N == V
        assert!(!f.holds(a64::cc::LT));
    }

    #[test]
    fn add_with_carry_models_borrow() {
        // 5 - 7 as a + !b + 1
        let (res, f) = add_with_carry_32(5, !7u32, true);
        assert_eq!(res as i32, -2);
        assert!(!f.c()); // borrow -> carry clear
        assert!(f.n());
        let (res, f) = add_with_carry_32(7, !5u32, true);
        assert_eq!(res, 2);
        assert!(f.c());
    }

    #[test]
    fn bitfield_move_matches_aliases() {
        // ubfx w0, w1, #8, #8 == ubfm immr=8 imms=15
        let r = bitfield_move(0, 0x00aa_bb00, 8, 15, false, 2).unwrap();
        assert_eq!(r, 0xbb);
        // bfi: dst[15:8] = src[7:0] -> bfm immr=24 imms=7
        let r = bitfield_move(0xffff_0000, 0xcd, 24, 7, false, 1).unwrap();
        assert_eq!(r, 0xffff_cd00);
        // sbfm asr: immr=16 imms=31
        let r = bitfield_move(0, 0x8000_0000, 16, 31, false, 0).unwrap();
        assert_eq!(r, 0xffff_8000);
    }

    #[test]
    fn sim_bus_round_trips_ctx_fields() {
        let mut state = GuestState::new();
        state.vbr = 0x1234_5678;
        let mut ram = crate::bus::ShadowRam::new(0, 0x1000);
        let mut sim = SimBus {
            state: &mut state,
            bus: &mut ram,
        };
        let image = sim.read(CTX_FOLDED + ctxoff::VBR, Width::Long) as u64;
        assert_eq!(image, 0x7856_3412); // byte-swapped native value
        sim.write(CTX_FOLDED + ctxoff::VBR, Width::Long, 0x1020_3040);
        assert_eq!(sim.state.vbr, 0x4030_2010);
    }
}
