//! End-to-end dispatch loop scenarios: the tight decrement loop, cache
//! coherence against self-modifying code, and interrupt gating.

mod common;

use common::{CODE_BASE, Machine, STACK_TOP};
use m68k_jit::bus::BusBackend;
use m68k_jit::state::InterruptSource;
use m68k_jit::{Progress, Sr};

#[test]
fn trivial_loop_runs_to_completion() {
    // MOVEQ #32,D6 ; SUBQ.L #1,D6 ; BNE.S -4 ; RTS
    let mut m = Machine::with_program(&[0x7c20, 0x5386, 0x66fc, 0x4e75]);
    m.run();

    assert_eq!(m.state.d[6], 0);
    // Z set, N/V/C/X clear.
    assert_eq!(m.ccr(), 0x04);
    // 1 MOVEQ + 32 SUBQ + 32 BNE + 1 RTS, path-accurately counted
    // across loop-backs and side exits.
    assert_eq!(m.state.stats.insns(), 66);
    // The loop body became a unit whose verification footprint covers
    // all four instructions (the flag scan read the RTS).
    let unit = m.dispatcher.icache.lookup(CODE_BASE).expect("unit");
    assert_eq!(unit.guest_entry_pc, CODE_BASE);
    assert!(unit.guest_low <= CODE_BASE);
    assert!(unit.guest_high >= CODE_BASE + 7);
}

#[test]
fn self_modifying_code_retranslates() {
    // 0x1000: MOVEQ #1,D0 ; RTS
    // 0x1100: MOVE.W #$7002,($1000).L ; RTS   (rewrites the MOVEQ)
    let mut m = Machine::with_program(&[0x7001, 0x4e75]);
    m.bus
        .load_words(0x1100, &[0x33fc, 0x7002, 0x0000, 0x1000, 0x4e75]);

    // First pass: original fragment.
    m.run();
    assert_eq!(m.state.d[0], 1);

    // Second pass: run the writer, then return into the fragment.
    m.state.pc = 0x1100;
    m.state.a[7] = STACK_TOP - 8;
    m.bus.ram.write_32(STACK_TOP - 8, 0x1000); // writer returns into F
    m.bus.ram.write_32(STACK_TOP - 4, 0); // F returns to the sentinel
    m.run();

    // The probe hit, verification caught the stale CRC, and the
    // fragment was retranslated with the new immediate.
    assert_eq!(m.state.d[0], 2);
}

#[test]
fn masked_interrupt_does_not_preempt() {
    // BRA.S self: the classic polling loop, compiled to a host loop
    // with a pending check at the back edge.
    let mut m = Machine::with_program(&[0x60fe]);
    m.state.sr = (Sr::S | Sr::IPM).bits(); // mask 7
    m.state.pending.post(InterruptSource::GuestBus(3));

    // Level 3 against mask 7 is not deliverable: the unit runs, and
    // the inner loop falls out after one pass because the pending word
    // is non-zero.
    let p = m
        .dispatcher
        .step(&mut m.state, &mut m.bus)
        .expect("dispatch");
    assert_eq!(p, Progress::Ran);
    assert_eq!(m.state.pc, CODE_BASE); // still at the loop head
    assert_eq!(m.state.pending.ipl(), 3); // left pending
    assert!(m.state.stats.insns() > 0);
}

#[test]
fn unmasked_interrupt_enters_handler_loop() {
    // Same polling loop, but deliverable: level 6 against mask 3.
    // The handler exits the machine by jumping to the zero sentinel.
    let mut m = Machine::with_program(&[0x60fe]);
    m.state.sr = Sr::S.bits() | 0x0300; // supervisor, mask 3
    m.state.isp = STACK_TOP - 64;
    // Vector 0x78 (level 6 autovector) -> handler at 0x2000.
    m.bus.ram.write_32(0x78, 0x2000);
    // Handler: JMP ($0).W — the zero sentinel ends the run.
    m.bus.load_words(0x2000, &[0x4ef8, 0x0000]);
    m.state.pending.post(InterruptSource::GuestBus(6));

    m.run();

    // Frame format word for level 6 is 0x0078, pushed at SP+6.
    let sp = m.state.a[7];
    assert_eq!(m.bus.ram.read_16(sp + 6), 0x0078);
    assert_eq!((m.state.sr >> 8) & 7, 6); // IPM raised
}

#[test]
fn trap_and_rte_round_trip() {
    // TRAP #0 ; RTS — with the trap vector pointing at a bare RTE.
    let mut m = Machine::with_program(&[0x4e40, 0x4e75]);
    m.bus.ram.write_32(32 * 4, 0x2000); // vector 32
    m.bus.load_words(0x2000, &[0x4e73]); // RTE
    let sp0 = m.state.a[7];

    m.run();

    // The frame was consumed and control returned to the RTS.
    assert_eq!(m.state.a[7], sp0 + 4); // RTS popped the sentinel
    assert!(m.state.sr & Sr::S.bits() != 0);
}

#[test]
fn divide_by_zero_raises_guest_exception() {
    // MOVEQ #0,D1 ; MOVEQ #9,D0 ; DIVU.W D1,D0 ; RTS
    let mut m = Machine::with_program(&[0x7200, 0x7009, 0x80c1, 0x4e75]);
    m.bus.ram.write_32(5 * 4, 0x2000); // zero-divide vector
    m.bus.load_words(0x2000, &[0x4e73]); // RTE back to the next insn

    m.run();

    // The division never wrote its result.
    assert_eq!(m.state.d[0], 9);
}

#[test]
fn stats_window_reflects_unit_count() {
    let mut m = Machine::with_program(&[0x7001, 0x4e75]);
    m.run();
    assert!(m.state.stats.unit_count.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    assert!(m.state.stats.insns() >= 2);
}
