//! Host code emission.
//!
//! [`a64`] encodes individual instructions; [`CodeBuffer`] collects the
//! words of a unit under construction; [`EmitEvent`] is how the
//! instruction translators talk to the unit builder.

pub mod a64;

/// Fixed host register assignments.
///
/// Guest D0-D7, A0-A7 and PC are statically bound for the duration of a
/// unit; x0-x11 form the transient pool handed out by the register
/// allocator.
pub mod hostreg {
    /// Number of registers in the transient pool (x0..).
    pub const TEMP_COUNT: u8 = 12;

    /// Scratch register carrying the address operand of helper traps;
    /// outside both the temp pool and the static guest map.
    pub const HELPER_ADDR: u8 = 12;

    pub const A0: u8 = 13;
    pub const A1: u8 = 14;
    pub const A2: u8 = 15;
    pub const A3: u8 = 16;
    pub const A4: u8 = 17;
    pub const PC: u8 = 18;
    pub const D0: u8 = 19;
    // D1-D7 follow D0.
    pub const A5: u8 = 27;
    pub const A6: u8 = 28;
    pub const A7: u8 = 29;
    pub const LR: u8 = 30;
    pub const ZR: u8 = 31;

    /// First host FP register backing FP0; FP1-FP7 follow.
    pub const FP0: u8 = 8;
    /// FP transient pool is d2..d7.
    pub const FP_TEMP_FIRST: u8 = 2;
    pub const FP_TEMP_LAST: u8 = 7;

    /// Host register statically holding guest Dn.
    #[inline]
    pub const fn d(n: u8) -> u8 {
        D0 + (n & 7)
    }

    /// Host register statically holding guest An.
    #[inline]
    pub const fn a(n: u8) -> u8 {
        match n & 7 {
            0 => A0,
            1 => A1,
            2 => A2,
            3 => A3,
            4 => A4,
            5 => A5,
            6 => A6,
            _ => A7,
        }
    }

    /// Host FP register statically holding guest FPn.
    #[inline]
    pub const fn fp(n: u8) -> u8 {
        FP0 + (n & 7)
    }
}

/// Branch encodings a deferred fixup may have to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// Conditional branch or CBZ/CBNZ: 19-bit word offset at bit 5.
    CondBranch,
    /// TBZ/TBNZ: 14-bit word offset at bit 5.
    TestBranch,
}

/// A branch already emitted into the body whose target is a stub that
/// will only exist once the body is closed.
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    pub kind: FixupKind,
    /// Word index of the branch within the unit body.
    pub location: usize,
}

/// One step of translator output, consumed by the unit builder.
#[derive(Debug, Clone)]
pub enum EmitEvent {
    /// An encoded host instruction belonging to the unit body.
    Instruction(u32),
    /// A deferred side exit: `code` is appended after the body and
    /// `fixup` is patched to reach it.
    ExitBlock { fixup: Fixup, code: Vec<u32> },
    /// A side exit reached by two distinct branches.
    DoubleExit {
        fixup1: Fixup,
        fixup2: Fixup,
        code: Vec<u32>,
    },
    /// Unconditional terminator: close the unit after this instruction.
    Stop,
    /// Soft terminator: close the unit but emit the inner-loop epilogue.
    Break,
}

/// Growing buffer of host instruction words.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    words: Vec<u32>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[inline]
    pub fn push(&mut self, word: u32) {
        self.words.push(word);
    }

    pub fn extend(&mut self, words: impl IntoIterator<Item = u32>) {
        self.words.extend(words);
    }

    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn into_words(self) -> Vec<u32> {
        self.words
    }

    /// Patch the branch at `fixup` to target the word at `target`.
    pub fn patch(&mut self, fixup: Fixup, target: usize) {
        let distance = target as i64 - fixup.location as i64;
        let word = &mut self.words[fixup.location];
        match fixup.kind {
            FixupKind::CondBranch => {
                *word = (*word & !(0x7ffff << 5)) | (((distance as u32) & 0x7ffff) << 5);
            }
            FixupKind::TestBranch => {
                *word = (*word & !(0x3fff << 5)) | (((distance as u32) & 0x3fff) << 5);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a64::cc;

    #[test]
    fn fixup_patches_cond_branch() {
        let mut buf = CodeBuffer::new();
        buf.push(a64::b_cond(cc::EQ, 0));
        buf.push(a64::nop());
        buf.push(a64::ret());
        buf.patch(
            Fixup {
                kind: FixupKind::CondBranch,
                location: 0,
            },
            2,
        );
        assert_eq!(buf.words()[0], a64::b_cond(cc::EQ, 2));
    }

    #[test]
    fn fixup_patches_test_branch() {
        let mut buf = CodeBuffer::new();
        buf.push(a64::tbz(3, 2, 0));
        for _ in 0..5 {
            buf.push(a64::nop());
        }
        buf.patch(
            Fixup {
                kind: FixupKind::TestBranch,
                location: 0,
            },
            5,
        );
        assert_eq!(buf.words()[0], a64::tbz(3, 2, 5));
    }

    #[test]
    fn static_register_map() {
        assert_eq!(hostreg::d(6), 25);
        assert_eq!(hostreg::a(7), 29);
        assert_eq!(hostreg::a(0), 13);
        assert_eq!(hostreg::fp(3), 11);
    }
}
