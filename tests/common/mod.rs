#![allow(dead_code)]

//! Shared test harness: a small machine with RAM, a recording MMIO
//! window, and helpers to run guest programs through the full
//! translate-and-execute stack.

use m68k_jit::bus::{BusBackend, ShadowRam, Width};
use m68k_jit::jit::icache::ICache;
use m68k_jit::{Dispatcher, GuestState, Interp, JitConfig, Sr};

/// First address of the recording MMIO window (the custom-chip page).
pub const MMIO_BASE: u32 = 0x00DF_0000;
pub const MMIO_END: u32 = 0x00E0_0000;

/// One observed bus cycle in the MMIO window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioCycle {
    pub write: bool,
    pub addr: u32,
    pub bytes: u32,
    pub value: u128,
}

/// RAM plus a recording MMIO device window.
pub struct TestBus {
    pub ram: ShadowRam,
    pub mmio_log: Vec<MmioCycle>,
    /// Value returned for MMIO reads (replicated per access).
    pub mmio_value: u128,
}

impl TestBus {
    pub fn new() -> Self {
        Self {
            ram: ShadowRam::new(0, 0xe0_0000),
            mmio_log: Vec::new(),
            mmio_value: 0,
        }
    }

    /// Place big-endian opcode words at a guest address.
    pub fn load_words(&mut self, addr: u32, words: &[u16]) {
        for (i, w) in words.iter().enumerate() {
            self.ram.write(addr + 2 * i as u32, Width::Word, *w as u128);
        }
    }
}

impl Default for TestBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusBackend for TestBus {
    fn read(&mut self, addr: u32, width: Width) -> u128 {
        if (MMIO_BASE..MMIO_END).contains(&addr) {
            self.mmio_log.push(MmioCycle {
                write: false,
                addr,
                bytes: width.bytes(),
                value: 0,
            });
            return self.mmio_value;
        }
        if self.ram.contains(addr, width.bytes()) {
            self.ram.read(addr, width)
        } else {
            0
        }
    }

    fn write(&mut self, addr: u32, width: Width, value: u128) {
        if (MMIO_BASE..MMIO_END).contains(&addr) {
            self.mmio_log.push(MmioCycle {
                write: true,
                addr,
                bytes: width.bytes(),
                value,
            });
            return;
        }
        if self.ram.contains(addr, width.bytes()) {
            self.ram.write(addr, width, value);
        }
    }
}

/// A ready-to-run machine.
pub struct Machine {
    pub state: GuestState,
    pub bus: TestBus,
    pub dispatcher: Dispatcher<Interp>,
}

pub const CODE_BASE: u32 = 0x1000;
pub const STACK_TOP: u32 = 0x8000;

impl Machine {
    /// Supervisor-mode machine with the program at CODE_BASE and a
    /// zero return address on the stack, so a final RTS lands on the
    /// PC-zero sentinel and ends the dispatch loop.
    pub fn with_program(words: &[u16]) -> Self {
        let mut bus = TestBus::new();
        bus.load_words(CODE_BASE, words);

        let mut state = GuestState::new();
        state.pc = CODE_BASE;
        state.sr = Sr::S.bits(); // supervisor, interrupt mask 0
        state.a[7] = STACK_TOP - 4;
        state.cacr = m68k_jit::state::CACR_IE;

        let stats = state.stats.clone();
        let dispatcher = Dispatcher::new(
            JitConfig::default(),
            Interp::default(),
            ICache::new(1 << 22, stats),
        );
        Self {
            state,
            bus,
            dispatcher,
        }
    }

    /// Run until the guest PC hits zero.
    pub fn run(&mut self) {
        self.dispatcher
            .run(&mut self.state, &mut self.bus)
            .expect("dispatch loop failed");
    }

    /// Flags as an architectural XNZVC byte.
    pub fn ccr(&self) -> u8 {
        (self.state.sr & 0x1f) as u8
    }
}
