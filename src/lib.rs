//! # m68k-jit
//!
//! An M68000-family to AArch64 dynamic binary translator core: guest
//! instructions are translated into short runs of native code on
//! demand, cached with CRC-verified LRU eviction, and driven by a
//! dispatch loop with interrupt injection. Bus-mapped guest addresses
//! that are absent on the host are serviced by synthesizing the bus
//! cycle from the faulting instruction's encoding.

pub mod bus;
pub mod config;
pub mod emit;
pub mod error;
pub mod fault;
pub mod jit;
pub mod sim;
pub mod state;

// Re-export the types a host integration touches.
pub use bus::{BusBackend, ShadowRam, SystemBus, Width};
pub use config::JitConfig;
pub use error::CoreError;
pub use jit::dispatch::{Dispatcher, Progress, UnitExecutor};
pub use jit::icache::ICache;
pub use jit::unit::TranslationUnit;
pub use sim::Interp;
pub use state::{GuestState, InterruptSource, JitStats, Sr};
