//! Core error taxonomy.
//!
//! Only host-side failures are errors. Guest-visible conditions
//! (illegal opcodes, divide by zero, privilege violations) are not:
//! they become 68k exceptions inside the translated code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The transient register pool ran dry even after flushing the
    /// FPCR, FPSR and CC slots. Translator bug.
    #[error("transient register pool exhausted")]
    RegisterPoolExhausted,

    /// Internal inconsistency in the translator.
    #[error("translator inconsistency: {0}")]
    TranslatorBug(&'static str),

    /// The executable heap could not satisfy an allocation even after
    /// evicting the whole cache.
    #[error("executable heap exhausted ({requested} bytes requested)")]
    HeapExhausted { requested: usize },

    /// The fault handler could not pattern-match a faulting host
    /// instruction.
    #[error("unrecognized load/store encoding {opcode:#010x} at {pc:#x}")]
    UnhandledFault { opcode: u32, pc: u64 },

    /// The execution backend hit a condition it cannot represent.
    #[error("unit executor fault: {0}")]
    Executor(&'static str),
}
