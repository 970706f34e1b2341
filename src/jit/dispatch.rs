//! The dispatch loop.
//!
//! The only caller of translated code. Each iteration: check for
//! pending interrupts, find (or build) the unit for the current guest
//! PC, and hand it to the execution backend. A guest PC of zero ends
//! the loop.

use std::sync::Arc;

use crate::bus::BusBackend;
use crate::config::JitConfig;
use crate::error::CoreError;
use crate::state::{CACR_IE, GuestState, Sr, SR_IPM_SHIFT};

use super::icache::ICache;
use super::unit::TranslationUnit;

/// Execution backend for translated units. The production backend on
/// an AArch64 host branches straight into the executable mirror; the
/// in-tree reference backend interprets the words.
pub trait UnitExecutor {
    fn run(
        &mut self,
        unit: &TranslationUnit,
        state: &mut GuestState,
        bus: &mut dyn BusBackend,
    ) -> Result<(), CoreError>;
}

/// What one dispatch iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A unit ran (or an interrupt was injected).
    Ran,
    /// The guest is stopped with nothing pending.
    Idle,
    /// The guest PC hit the zero sentinel.
    Exited,
}

pub struct Dispatcher<E> {
    pub icache: ICache,
    cfg: JitConfig,
    executor: E,
    /// The "last translated PC" guard: when the incoming PC matches,
    /// the previously selected unit is re-entered with no lookup.
    guard_pc: Option<u32>,
    current: Option<Arc<TranslationUnit>>,
}

impl<E: UnitExecutor> Dispatcher<E> {
    pub fn new(cfg: JitConfig, executor: E, icache: ICache) -> Self {
        Self {
            icache,
            cfg,
            executor,
            guard_pc: None,
            current: None,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.cfg
    }

    /// Invalidate the PC guard (after anything that may have replaced
    /// units under it).
    pub fn clear_guard(&mut self) {
        self.guard_pc = None;
        self.current = None;
    }

    /// Run until the guest PC becomes zero.
    pub fn run(
        &mut self,
        state: &mut GuestState,
        bus: &mut dyn BusBackend,
    ) -> Result<(), CoreError> {
        loop {
            match self.step(state, bus)? {
                Progress::Exited => return Ok(()),
                Progress::Idle => std::hint::spin_loop(),
                Progress::Ran => {}
            }
        }
    }

    /// One dispatch iteration.
    pub fn step(
        &mut self,
        state: &mut GuestState,
        bus: &mut dyn BusBackend,
    ) -> Result<Progress, CoreError> {
        if state.pc == 0 {
            return Ok(Progress::Exited);
        }

        // Guest-requested soft flush of the translation cache.
        let control = state.stats.control.load(std::sync::atomic::Ordering::Relaxed);
        if JitConfig::soft_flush_requested(control) {
            self.icache.flush_all();
            self.clear_guard();
            state
                .stats
                .control
                .store(control & !1, std::sync::atomic::Ordering::Relaxed);
        }

        // Interrupts first: if something is pending and unmasked, the
        // next host-visible effect is the exception frame build.
        if state.pending.summary() != 0 && self.inject_interrupt(state, bus) {
            return Ok(Progress::Ran);
        }

        if state.stopped {
            return Ok(Progress::Idle);
        }

        let pc = state.pc;
        let unit = if state.cacr & CACR_IE == 0 {
            // Cache-disabled slow path: verify on every entry.
            self.guard_pc = None;
            self.icache.lookup_or_translate(bus, &self.cfg, pc)?
        } else if self.guard_pc == Some(pc) {
            // Fast path: the guard says the current unit still matches.
            let unit = self
                .current
                .clone()
                .ok_or(CoreError::TranslatorBug("guard without current unit"))?;
            unit.use_count.set(unit.use_count.get() + 1);
            unit
        } else {
            let unit = self.icache.lookup_or_translate(bus, &self.cfg, pc)?;
            self.guard_pc = Some(pc);
            self.current = Some(unit.clone());
            unit
        };

        self.executor.run(&unit, state, bus)?;
        Ok(Progress::Ran)
    }

    /// The interrupt-injection path. Returns true when an exception
    /// frame was built (the next unit then runs from the handler).
    fn inject_interrupt(&mut self, state: &mut GuestState, bus: &mut dyn BusBackend) -> bool {
        // Select the highest pending level; a host SError is NMI.
        let serror = state.pending.serror();
        let arm = state.pending.arm_level();
        let ipl = state.pending.ipl();
        let level = if serror { 7 } else { arm.max(ipl) };
        if level == 0 {
            return false;
        }

        // Masked and not NMI: back to the normal fetch.
        if level != 7 && level <= state.ipm() {
            return false;
        }

        // Consume the winning source. The bus IPL is level-sensitive
        // and stays up until the device is acknowledged.
        if serror {
            state.pending.clear_serror();
        } else if arm >= ipl {
            state.pending.clear_arm();
        }

        let old_sr = state.sr;
        state.enter_supervisor();
        state.sr |= Sr::S.bits();
        state.sr &= !(Sr::T0 | Sr::T1).bits();
        state.sr = (state.sr & !Sr::IPM.bits()) | ((level as u16) << SR_IPM_SHIFT);

        // Format-0 frame on the supervisor stack: SR, return PC, and
        // the vector-offset word.
        let vector_offset = 0x60 + (level as u32) * 4;
        let sp = state.a[7].wrapping_sub(8);
        state.a[7] = sp;
        bus.write_16(sp, old_sr);
        bus.write_32(sp.wrapping_add(2), state.pc);
        bus.write_16(sp.wrapping_add(6), vector_offset as u16);

        state.pc = bus.read_32(state.vbr.wrapping_add(vector_offset));
        state.stopped = false;

        log::trace!(
            target: "jit",
            "injected level-{level} interrupt, new pc {:#010x}",
            state.pc
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusBackend, ShadowRam, Width};
    use crate::state::InterruptSource;
    use std::sync::Arc;

    /// Executor that pretends every unit immediately returns with the
    /// PC advanced to a fixed address.
    struct ScriptedExecutor {
        next_pc: u32,
        runs: u32,
    }

    impl UnitExecutor for ScriptedExecutor {
        fn run(
            &mut self,
            _unit: &TranslationUnit,
            state: &mut GuestState,
            _bus: &mut dyn BusBackend,
        ) -> Result<(), CoreError> {
            self.runs += 1;
            state.pc = self.next_pc;
            Ok(())
        }
    }

    fn setup() -> (GuestState, ShadowRam) {
        let mut state = GuestState::new();
        state.cacr = CACR_IE;
        let mut ram = ShadowRam::new(0, 0x10000);
        ram.write(0x1000, Width::Word, 0x4e75); // RTS
        (state, ram)
    }

    #[test]
    fn pc_zero_terminates() {
        let (mut state, mut ram) = setup();
        state.pc = 0;
        let stats = state.stats.clone();
        let mut disp = Dispatcher::new(
            JitConfig::default(),
            ScriptedExecutor { next_pc: 0, runs: 0 },
            ICache::new(1 << 20, stats),
        );
        disp.run(&mut state, &mut ram).unwrap();
    }

    #[test]
    fn guard_hit_skips_lookup() {
        let (mut state, mut ram) = setup();
        state.pc = 0x1000;
        let stats = state.stats.clone();
        let mut disp = Dispatcher::new(
            JitConfig::default(),
            ScriptedExecutor {
                next_pc: 0x1000,
                runs: 0,
            },
            ICache::new(1 << 20, stats.clone()),
        );
        disp.step(&mut state, &mut ram).unwrap();
        let misses = stats.cache_miss.load(std::sync::atomic::Ordering::Relaxed);
        // Same PC again: guard short-circuits, no new translation.
        disp.step(&mut state, &mut ram).unwrap();
        assert_eq!(
            stats.cache_miss.load(std::sync::atomic::Ordering::Relaxed),
            misses
        );
        assert!(disp.current.as_ref().unwrap().use_count.get() >= 1);
    }

    #[test]
    fn masked_interrupt_stays_pending() {
        let (mut state, mut ram) = setup();
        state.pc = 0x1000;
        state.sr = (Sr::S | Sr::IPM).bits(); // mask 7
        state.pending.post(InterruptSource::GuestBus(3));
        let stats = state.stats.clone();
        let mut disp = Dispatcher::new(
            JitConfig::default(),
            ScriptedExecutor { next_pc: 0, runs: 0 },
            ICache::new(1 << 20, stats),
        );
        disp.step(&mut state, &mut ram).unwrap();
        // Level 3 against mask 7: no injection, unit ran instead.
        assert_eq!(state.pending.ipl(), 3);
        assert_ne!(state.sr & Sr::IPM.bits(), 0x0300);
    }

    #[test]
    fn interrupt_injection_builds_frame_and_vectors() {
        let (mut state, mut ram) = setup();
        // Scenario: pending level 6, mask 3, user mode.
        state.pc = 0x1000;
        state.sr = 0x0300; // user mode, mask 3
        state.a[7] = 0x4000; // user stack
        state.isp = 0x3000;
        state.vbr = 0;
        ram.write(0x78, Width::Long, 0x0000_2222); // vector for level 6
        state.pending.post(InterruptSource::GuestBus(6));

        let stats = state.stats.clone();
        let mut disp = Dispatcher::new(
            JitConfig::default(),
            ScriptedExecutor { next_pc: 0, runs: 0 },
            ICache::new(1 << 20, stats),
        );
        disp.step(&mut state, &mut ram).unwrap();

        // USP parked, ISP active, frame pushed.
        assert_eq!(state.usp, 0x4000);
        assert_eq!(state.a[7], 0x3000 - 8);
        assert_eq!(ram.read_16(0x3000 - 8), 0x0300); // old SR
        assert_eq!(ram.read_32(0x3000 - 6), 0x1000); // return PC
        assert_eq!(ram.read_16(0x3000 - 2), 0x0078); // format word
        // SR: supervisor, IPM raised to 6.
        assert_ne!(state.sr & Sr::S.bits(), 0);
        assert_eq!((state.sr >> 8) & 7, 6);
        assert_eq!(state.pc, 0x2222);
    }

    #[test]
    fn serror_is_nmi() {
        let (mut state, mut ram) = setup();
        state.pc = 0x1000;
        state.sr = (Sr::S | Sr::IPM).bits(); // everything masked
        state.a[7] = 0x3000;
        ram.write(0x7c, Width::Long, 0x0000_3333); // level 7 vector
        state.pending.post(InterruptSource::Serror);
        let stats = state.stats.clone();
        let mut disp = Dispatcher::new(
            JitConfig::default(),
            ScriptedExecutor { next_pc: 0, runs: 0 },
            ICache::new(1 << 20, stats),
        );
        disp.step(&mut state, &mut ram).unwrap();
        assert_eq!(state.pc, 0x3333);
        assert!(!state.pending.serror());
    }

    #[test]
    fn stopped_core_idles_until_interrupt() {
        let (mut state, mut ram) = setup();
        state.pc = 0x1000;
        state.sr = Sr::S.bits(); // mask 0
        state.stopped = true;
        state.a[7] = 0x3000;
        ram.write(0x64, Width::Long, 0x0000_4444); // level 1 vector
        let stats = state.stats.clone();
        let mut disp = Dispatcher::new(
            JitConfig::default(),
            ScriptedExecutor { next_pc: 0, runs: 0 },
            ICache::new(1 << 20, stats),
        );
        assert_eq!(disp.step(&mut state, &mut ram).unwrap(), Progress::Idle);
        state.pending.post(InterruptSource::GuestBus(1));
        assert_eq!(disp.step(&mut state, &mut ram).unwrap(), Progress::Ran);
        assert!(!state.stopped);
        assert_eq!(state.pc, 0x4444);
    }
}
