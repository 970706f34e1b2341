//! Effective-address materialization.
//!
//! Decodes every 68000 addressing mode plus the 68020 extended forms
//! (scaled index, base displacement, memory indirect) and emits either
//! an address computation into a transient register or an in-register
//! operand, depending on the mode.

use crate::emit::a64::{self, Shift};
use crate::emit::hostreg;
use crate::error::CoreError;

use super::{OpSize, TranslatorContext};

/// Addressing mode encoding, from the mode/register opcode fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// Dn
    DataDirect(u8),
    /// An
    AddressDirect(u8),
    /// (An)
    AddressIndirect(u8),
    /// (An)+
    PostIncrement(u8),
    /// -(An)
    PreDecrement(u8),
    /// (d16,An)
    Displacement(u8),
    /// (d8,An,Xn) and the 68020 full formats
    Index(u8),
    /// (xxx).W
    AbsoluteShort,
    /// (xxx).L
    AbsoluteLong,
    /// (d16,PC)
    PcDisplacement,
    /// (d8,PC,Xn) and the 68020 full formats
    PcIndex,
    /// #imm
    Immediate,
}

impl AddressingMode {
    pub fn decode(mode: u8, reg: u8) -> Option<Self> {
        match mode {
            0b000 => Some(Self::DataDirect(reg)),
            0b001 => Some(Self::AddressDirect(reg)),
            0b010 => Some(Self::AddressIndirect(reg)),
            0b011 => Some(Self::PostIncrement(reg)),
            0b100 => Some(Self::PreDecrement(reg)),
            0b101 => Some(Self::Displacement(reg)),
            0b110 => Some(Self::Index(reg)),
            0b111 => match reg {
                0b000 => Some(Self::AbsoluteShort),
                0b001 => Some(Self::AbsoluteLong),
                0b010 => Some(Self::PcDisplacement),
                0b011 => Some(Self::PcIndex),
                0b100 => Some(Self::Immediate),
                _ => None,
            },
            _ => None,
        }
    }

    /// Split out of an opcode's low six bits.
    pub fn from_opcode(op: u16) -> Option<Self> {
        Self::decode(((op >> 3) & 7) as u8, (op & 7) as u8)
    }

    pub fn is_register_direct(&self) -> bool {
        matches!(self, Self::DataDirect(_) | Self::AddressDirect(_))
    }

    pub fn is_memory(&self) -> bool {
        !matches!(
            self,
            Self::DataDirect(_) | Self::AddressDirect(_) | Self::Immediate
        )
    }
}

/// A materialized operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Value lives in guest Dn (statically mapped host register).
    DataReg(u8),
    /// Value lives in guest An.
    AddrReg(u8),
    /// Value lives in guest memory; the host register holds the
    /// address. `owned` marks a transient that must be released.
    Mem { reg: u8, owned: bool },
    /// Immediate from the instruction stream.
    Imm(u32),
}

impl Operand {
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem { .. })
    }
}

/// Post-increment step; A7 keeps word alignment even for bytes.
#[inline]
fn step(reg: u8, size: OpSize) -> u32 {
    if reg == 7 && size == OpSize::Byte {
        2
    } else {
        size.bytes()
    }
}

impl TranslatorContext<'_> {
    /// Resolve an effective address, emitting whatever address
    /// computation it needs. Post-increment and pre-decrement update
    /// the address register here.
    pub fn resolve_ea(&mut self, mode: AddressingMode, size: OpSize) -> Result<Operand, CoreError> {
        match mode {
            AddressingMode::DataDirect(n) => Ok(Operand::DataReg(n)),
            AddressingMode::AddressDirect(n) => Ok(Operand::AddrReg(n)),
            AddressingMode::AddressIndirect(n) => Ok(Operand::Mem {
                reg: hostreg::a(n),
                owned: false,
            }),
            AddressingMode::PostIncrement(n) => {
                let an = hostreg::a(n);
                let t = self.alloc_temp()?;
                self.emit(a64::mov_reg(t, an));
                self.emit(a64::add_imm(an, an, step(n, size)));
                Ok(Operand::Mem { reg: t, owned: true })
            }
            AddressingMode::PreDecrement(n) => {
                let an = hostreg::a(n);
                self.emit(a64::sub_imm(an, an, step(n, size)));
                Ok(Operand::Mem {
                    reg: an,
                    owned: false,
                })
            }
            AddressingMode::Displacement(n) => {
                let d16 = self.read_ext_word() as i16 as i32;
                let t = self.alloc_temp()?;
                self.emit_add_const(t, hostreg::a(n), d16)?;
                Ok(Operand::Mem { reg: t, owned: true })
            }
            AddressingMode::Index(n) => {
                let addr = self.emit_indexed_address(Base::Reg(hostreg::a(n)))?;
                Ok(Operand::Mem {
                    reg: addr,
                    owned: true,
                })
            }
            AddressingMode::AbsoluteShort => {
                let addr = self.read_ext_word() as i16 as i32 as u32;
                let t = self.alloc_temp()?;
                self.emit_all(a64::mov_imm32(t, addr));
                Ok(Operand::Mem { reg: t, owned: true })
            }
            AddressingMode::AbsoluteLong => {
                let addr = self.read_ext_long();
                let t = self.alloc_temp()?;
                self.emit_all(a64::mov_imm32(t, addr));
                Ok(Operand::Mem { reg: t, owned: true })
            }
            AddressingMode::PcDisplacement => {
                let base = self.mpc;
                let d16 = self.read_ext_word() as i16 as i32;
                let t = self.alloc_temp()?;
                self.emit_all(a64::mov_imm32(t, base.wrapping_add_signed(d16)));
                Ok(Operand::Mem { reg: t, owned: true })
            }
            AddressingMode::PcIndex => {
                let base = self.mpc;
                let addr = self.emit_indexed_address(Base::Const(base))?;
                Ok(Operand::Mem {
                    reg: addr,
                    owned: true,
                })
            }
            AddressingMode::Immediate => {
                let value = match size {
                    OpSize::Byte => (self.read_ext_word() & 0xff) as u32,
                    OpSize::Word => self.read_ext_word() as u32,
                    OpSize::Long => self.read_ext_long(),
                };
                Ok(Operand::Imm(value))
            }
        }
    }

    /// Release the transient behind a memory operand.
    pub fn free_operand(&mut self, op: Operand) {
        if let Operand::Mem { reg, owned: true } = op {
            self.regs.free_temp(reg);
        }
    }

    /// Load an operand's value into a fresh transient, masked to the
    /// operand size.
    pub fn emit_load_value(&mut self, op: Operand, size: OpSize) -> Result<u8, CoreError> {
        let t = self.alloc_temp()?;
        match op {
            Operand::DataReg(n) => match size {
                OpSize::Long => self.emit(a64::mov_reg(t, hostreg::d(n))),
                OpSize::Word => self.emit(a64::uxth(t, hostreg::d(n))),
                OpSize::Byte => self.emit(a64::uxtb(t, hostreg::d(n))),
            },
            Operand::AddrReg(n) => match size {
                OpSize::Long => self.emit(a64::mov_reg(t, hostreg::a(n))),
                _ => self.emit(a64::uxth(t, hostreg::a(n))),
            },
            Operand::Mem { reg, .. } => self.emit_load_be(t, reg, size),
            Operand::Imm(v) => self.emit_all(a64::mov_imm32(t, v & size.mask())),
        }
        Ok(t)
    }

    /// Store a result back through an operand.
    pub fn emit_store_result(
        &mut self,
        op: Operand,
        value: u8,
        size: OpSize,
    ) -> Result<(), CoreError> {
        match op {
            Operand::DataReg(n) => self.emit_store_dreg(n, value, size),
            Operand::AddrReg(n) => {
                // Writes to address registers are always full-width;
                // word sources were sign-extended by the caller.
                self.emit(a64::mov_reg(hostreg::a(n), value));
            }
            Operand::Mem { reg, .. } => self.emit_store_be(value, reg, size)?,
            Operand::Imm(_) => {
                return Err(CoreError::TranslatorBug("store to immediate operand"));
            }
        }
        Ok(())
    }

    /// Brief/full extension word handling shared by (d8,An,Xn) and
    /// (d8,PC,Xn).
    fn emit_indexed_address(&mut self, base: Base) -> Result<u8, CoreError> {
        let ext = self.read_ext_word();
        if ext & 0x100 != 0 {
            return self.emit_full_format(base, ext);
        }

        let t = self.alloc_temp()?;
        let d8 = (ext & 0xff) as i8 as i32;
        let idx = self.emit_index_value(ext)?;
        let scale = ((ext >> 9) & 3) as u8;
        match base {
            Base::Reg(r) => self.emit(a64::add_reg(t, r, idx, Shift::Lsl, scale)),
            Base::Const(c) => {
                self.emit_all(a64::mov_imm32(t, c));
                self.emit(a64::add_reg(t, t, idx, Shift::Lsl, scale));
            }
        }
        self.regs.free_temp(idx);
        self.emit_add_const(t, t, d8)?;
        Ok(t)
    }

    /// The (possibly sign-extended, unscaled) index register value in a
    /// fresh transient.
    fn emit_index_value(&mut self, ext: u16) -> Result<u8, CoreError> {
        let idx_n = ((ext >> 12) & 0xf) as u8;
        let idx_host = if ext & 0x8000 != 0 {
            hostreg::a(idx_n & 7)
        } else {
            hostreg::d(idx_n & 7)
        };
        let t = self.alloc_temp()?;
        if ext & 0x0800 != 0 {
            self.emit(a64::mov_reg(t, idx_host));
        } else {
            self.emit(a64::sxth(t, idx_host));
        }
        Ok(t)
    }

    /// 68020 full-format extension word: base/outer displacements and
    /// the memory-indirect pre-/post-indexed forms.
    fn emit_full_format(&mut self, base: Base, ext: u16) -> Result<u8, CoreError> {
        let base_suppress = ext & 0x0080 != 0;
        let index_suppress = ext & 0x0040 != 0;
        let bd: i32 = match (ext >> 4) & 3 {
            2 => self.read_ext_word() as i16 as i32,
            3 => self.read_ext_long() as i32,
            _ => 0,
        };
        let iis = ext & 7;

        let t = self.alloc_temp()?;
        match (base, base_suppress) {
            (_, true) => self.emit_all(a64::mov_imm32(t, 0)),
            (Base::Reg(r), false) => self.emit(a64::mov_reg(t, r)),
            (Base::Const(c), false) => self.emit_all(a64::mov_imm32(t, c)),
        }
        self.emit_add_const(t, t, bd)?;

        let index = if index_suppress {
            None
        } else {
            let idx = self.emit_index_value(ext)?;
            Some((idx, ((ext >> 9) & 3) as u8))
        };

        if iis == 0 {
            // No memory indirection.
            if let Some((idx, scale)) = index {
                self.emit(a64::add_reg(t, t, idx, Shift::Lsl, scale));
                self.regs.free_temp(idx);
            }
            return Ok(t);
        }

        let post_indexed = iis & 4 != 0;
        if !post_indexed && let Some((idx, scale)) = index {
            self.emit(a64::add_reg(t, t, idx, Shift::Lsl, scale));
            self.regs.free_temp(idx);
            self.emit_load_be(t, t, OpSize::Long);
        } else {
            self.emit_load_be(t, t, OpSize::Long);
            if let Some((idx, scale)) = index {
                self.emit(a64::add_reg(t, t, idx, Shift::Lsl, scale));
                self.regs.free_temp(idx);
            }
        }

        let od: i32 = match iis & 3 {
            2 => self.read_ext_word() as i16 as i32,
            3 => self.read_ext_long() as i32,
            _ => 0,
        };
        self.emit_add_const(t, t, od)?;
        Ok(t)
    }
}

/// Base of an indexed mode: an address register or the (static) PC.
#[derive(Debug, Clone, Copy)]
enum Base {
    Reg(u8),
    Const(u32),
}
