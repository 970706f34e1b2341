//! Guest programs run through the full translate-and-execute stack,
//! checking architectural results and condition codes.

mod common;

use common::{Machine, STACK_TOP};
use m68k_jit::bus::BusBackend;

fn run(words: &[u16]) -> Machine {
    let mut m = Machine::with_program(words);
    m.run();
    m
}

#[test]
fn add_long_registers() {
    // MOVEQ #5,D0 ; MOVEQ #3,D1 ; ADD.L D1,D0 ; RTS
    let m = run(&[0x7005, 0x7203, 0xd081, 0x4e75]);
    assert_eq!(m.state.d[0], 8);
    assert_eq!(m.ccr(), 0);
}

#[test]
fn sub_sets_borrow_and_extend() {
    // MOVEQ #3,D0 ; MOVEQ #5,D1 ; SUB.L D1,D0 ; RTS
    let m = run(&[0x7003, 0x7205, 0x9081, 0x4e75]);
    assert_eq!(m.state.d[0], 0xffff_fffe);
    // N, C and X set; V and Z clear.
    assert_eq!(m.ccr(), 0x19);
}

#[test]
fn word_write_preserves_upper_half() {
    // MOVE.L #$AABBCCDD,D0 ; MOVE.W #$1122,D0 ; RTS
    let m = run(&[0x203c, 0xaabb, 0xccdd, 0x303c, 0x1122, 0x4e75]);
    assert_eq!(m.state.d[0], 0xaabb_1122);
}

#[test]
fn memory_round_trip_is_big_endian() {
    // MOVEA.L #$4000,A0 ; MOVE.L #$11223344,D0 ;
    // MOVE.L D0,(A0) ; MOVE.L (A0),D1 ; RTS
    let m = run(&[
        0x207c, 0x0000, 0x4000, 0x203c, 0x1122, 0x3344, 0x2080, 0x2210, 0x4e75,
    ]);
    assert_eq!(m.state.d[1], 0x1122_3344);
    let mut bus = m.bus;
    assert_eq!(bus.ram.read_8(0x4000), 0x11);
    assert_eq!(bus.ram.read_8(0x4003), 0x44);
}

#[test]
fn postincrement_and_predecrement() {
    // MOVEA.L #$4000,A0 ; MOVE.W #$BEEF,(A0)+ ; MOVE.W -(A0),D0 ; RTS
    let m = run(&[0x207c, 0x0000, 0x4000, 0x30fc, 0xbeef, 0x3020, 0x4e75]);
    assert_eq!(m.state.a[0], 0x4000);
    assert_eq!(m.state.d[0] & 0xffff, 0xbeef);
}

#[test]
fn dbf_counts_down_through_the_loop() {
    // MOVEQ #0,D0 ; MOVE.W #9,D1 ;
    // loop: ADDQ.L #1,D0 ; DBF D1,loop ; RTS
    let m = run(&[0x7000, 0x323c, 0x0009, 0x5280, 0x51c9, 0xfffc, 0x4e75]);
    assert_eq!(m.state.d[0], 10);
    assert_eq!(m.state.d[1] & 0xffff, 0xffff);
}

#[test]
fn lsr_shifts_carry_into_x() {
    // MOVE.L #$80000001,D0 ; LSR.L #1,D0 ; RTS
    let m = run(&[0x203c, 0x8000, 0x0001, 0xe288, 0x4e75]);
    assert_eq!(m.state.d[0], 0x4000_0000);
    // C and X from the shifted-out bit.
    assert_eq!(m.ccr(), 0x11);
}

#[test]
fn asl_detects_sign_overflow() {
    // MOVE.L #$40000000,D0 ; ASL.L #1,D0 ; RTS
    let m = run(&[0x203c, 0x4000, 0x0000, 0xe380, 0x4e75]);
    assert_eq!(m.state.d[0], 0x8000_0000);
    // N and V set; the shifted-out bit was zero so C/X stay clear.
    assert_eq!(m.ccr(), 0x0a);
}

#[test]
fn mulu_and_divu_word_forms() {
    // MOVEQ #100,D0 ; MOVEQ #7,D1 ; DIVU.W D1,D0 ; RTS
    let m = run(&[0x7064, 0x7207, 0x80c1, 0x4e75]);
    // Quotient 14 below, remainder 2 above.
    assert_eq!(m.state.d[0], 0x0002_000e);

    // MOVEQ #7,D0 ; MOVEQ #6,D1 ; MULU.W D1,D0 ; RTS
    let m = run(&[0x7007, 0x7206, 0xc0c1, 0x4e75]);
    assert_eq!(m.state.d[0], 42);
}

#[test]
fn bit_set_and_test() {
    // MOVEQ #0,D0 ; BSET #3,D0 ; BTST #3,D0 ; RTS
    let m = run(&[0x7000, 0x08c0, 0x0003, 0x0800, 0x0003, 0x4e75]);
    assert_eq!(m.state.d[0], 8);
    // The final BTST saw the bit set, so Z is clear.
    assert_eq!(m.ccr() & 0x04, 0);
}

#[test]
fn jsr_and_rts_with_return_prediction() {
    // 0x1000: JSR ($1100).W ; MOVEQ #7,D0 ; RTS
    // 0x1100: MOVEQ #1,D1 ; RTS
    let mut m = Machine::with_program(&[0x4eb8, 0x1100, 0x7007, 0x4e75]);
    m.bus.load_words(0x1100, &[0x7201, 0x4e75]);
    m.run();
    assert_eq!(m.state.d[0], 7);
    assert_eq!(m.state.d[1], 1);
    // The whole call tree fits one unit thanks to the return-stack
    // prediction.
    assert_eq!(m.dispatcher.icache.unit_count(), 1);
}

#[test]
fn link_and_unlk_balance_the_stack() {
    // LINK A6,#-8 ; UNLK A6 ; RTS
    let mut m = Machine::with_program(&[0x4e56, 0xfff8, 0x4e5e, 0x4e75]);
    let sp0 = m.state.a[7];
    let a6_0 = m.state.a[6];
    m.run();
    assert_eq!(m.state.a[7], sp0 + 4); // only the RTS pop remains
    assert_eq!(m.state.a[6], a6_0);
}

#[test]
fn ext_and_swap() {
    // MOVE.L #$80,D0 ; EXT.W D0 ; SWAP D0 ; RTS
    let m = run(&[0x203c, 0x0000, 0x0080, 0x4880, 0x4840, 0x4e75]);
    assert_eq!(m.state.d[0], 0xff80_0000);
    assert_eq!(m.ccr() & 0x08, 0x08); // negative after the swap
}

#[test]
fn scc_materializes_conditions() {
    // MOVEQ #0,D0 ; TST.L D0 ; SEQ D1 ; SNE D2 ; RTS
    let m = run(&[0x7000, 0x4a80, 0x57c1, 0x56c2, 0x4e75]);
    assert_eq!(m.state.d[1] & 0xff, 0xff);
    assert_eq!(m.state.d[2] & 0xff, 0x00);
}

#[test]
fn movem_push_and_pop() {
    // MOVEQ #1,D2 ; MOVEQ #2,D3 ; MOVEM.L D2-D3,-(A7) ;
    // CLR.L D2 ; CLR.L D3 ; MOVEM.L (A7)+,D2-D3 ; RTS
    let mut m = Machine::with_program(&[
        0x7401, 0x7602, 0x48e7, 0x3000, 0x4282, 0x4283, 0x4cdf, 0x000c, 0x4e75,
    ]);
    let sp0 = m.state.a[7];
    m.run();
    assert_eq!(m.state.d[2], 1);
    assert_eq!(m.state.d[3], 2);
    assert_eq!(m.state.a[7], sp0 + 4);
}

#[test]
fn immediate_family_on_registers() {
    // MOVEQ #-1,D0 ; ANDI.B #$0F,D0 ; EORI.W #$00FF,D0 ; RTS
    let m = run(&[0x70ff, 0x0200, 0x000f, 0x0a40, 0x00ff, 0x4e75]);
    assert_eq!(m.state.d[0], 0xffff_fff0);
}

#[test]
fn conditional_branch_skips_fallthrough() {
    // MOVEQ #5,D0 ; CMPI.L #5,D0 ; BEQ.S over ; MOVEQ #0,D0 ; over: RTS
    let m = run(&[0x7005, 0x0c80, 0x0000, 0x0005, 0x6702, 0x7000, 0x4e75]);
    assert_eq!(m.state.d[0], 5);
}

#[test]
fn addx_propagates_the_carry_chain() {
    // 64-bit add of 0x00000001_FFFFFFFF + 1 in the D1:D0 pair:
    // MOVEQ #-1,D0 ; MOVEQ #1,D1 ; MOVEQ #1,D2 ; MOVEQ #0,D3 ;
    // ADD.L D2,D0 ; ADDX.L D3,D1 ; RTS
    let m = run(&[0x70ff, 0x7201, 0x7401, 0x7600, 0xd082, 0xd383, 0x4e75]);
    assert_eq!(m.state.d[0], 0);
    assert_eq!(m.state.d[1], 2);
}

#[test]
fn rte_restores_state_from_frame() {
    // A hand-built format-0 frame whose return PC is the sentinel.
    let mut m = Machine::with_program(&[0x4e73]); // RTE
    let sp = STACK_TOP - 16;
    m.state.a[7] = sp;
    m.bus.ram.write_16(sp, 0x2700); // SR: supervisor, mask 7
    m.bus.ram.write_32(sp + 2, 0); // return PC = exit sentinel
    m.bus.ram.write_16(sp + 6, 0x0000); // format 0
    m.run();
    assert_eq!(m.state.a[7], sp + 8);
    assert_eq!(m.state.sr, 0x2700);
}

#[test]
fn rotate_through_extend() {
    // MOVE.L #1,D0 ; ROXR.L #1,D0 ; RTS — X starts clear, so the
    // rotated-out bit lands in X/C and the register becomes zero.
    let m = run(&[0x203c, 0x0000, 0x0001, 0xe290, 0x4e75]);
    assert_eq!(m.state.d[0], 0);
    assert_eq!(m.ccr() & 0x11, 0x11); // X and C from the rotated bit
    assert_eq!(m.ccr() & 0x04, 0x04); // result is zero
}

#[test]
fn neg_produces_twos_complement() {
    // MOVEQ #5,D0 ; NEG.L D0 ; RTS
    let m = run(&[0x7005, 0x4480, 0x4e75]);
    assert_eq!(m.state.d[0], 0xffff_fffb);
    assert_eq!(m.ccr() & 0x08, 0x08); // negative
    assert_eq!(m.ccr() & 0x11, 0x11); // borrow into C and X
}

#[test]
fn rts_prediction_miss_takes_the_slow_path() {
    // The subroutine rewrites its own return address, so the inlined
    // return path must be abandoned through the mismatch stub.
    // 0x1000: JSR ($1100).W ; MOVEQ #1,D0 ; RTS
    // 0x1100: MOVE.L #$2000,(A7) ; RTS
    // 0x2000: MOVEQ #9,D0 ; RTS
    let mut m = Machine::with_program(&[0x4eb8, 0x1100, 0x7001, 0x4e75]);
    m.bus
        .load_words(0x1100, &[0x2ebc, 0x0000, 0x2000, 0x4e75]);
    m.bus.load_words(0x2000, &[0x7009, 0x4e75]);
    m.run();

    // Control went to the rewritten address, not the predicted one.
    assert_eq!(m.state.d[0], 9);
}
