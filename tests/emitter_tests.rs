//! Encoder/decoder round trips: every load/store form the emitter
//! produces must be decodable by the fault handler's patterns with the
//! original operands recovered (the two sides share their tables).

mod common;

use m68k_jit::bus::BusBackend;
use m68k_jit::emit::a64::{self, Extend};
use m68k_jit::fault::{FAR_UNKNOWN, HostRegs, handle_read_fault, handle_write_fault};

use common::TestBus;

const BASE: u32 = 0x4000;

fn regs_with_base(rn: usize) -> HostRegs {
    let mut regs = HostRegs::default();
    regs.x[rn] = BASE as u64;
    regs
}

/// Seed a value, run a store encoder through the write decoder, then
/// the matching load encoder through the read decoder, and compare.
fn round_trip_int(
    store_op: u32,
    load_op: u32,
    image: u64,
    expected_addr: u32,
    bus: &mut TestBus,
) {
    let mut regs = regs_with_base(9);
    regs.x[0] = image;
    let addr = handle_write_fault(store_op, &mut regs, FAR_UNKNOWN, bus).unwrap();
    assert_eq!(addr as u32, expected_addr, "store address");

    let mut regs = regs_with_base(9);
    let addr = handle_read_fault(load_op, &mut regs, FAR_UNKNOWN, bus).unwrap();
    assert_eq!(addr as u32, expected_addr, "load address");
    assert_eq!(regs.x[0], image, "round-tripped image");
}

#[test]
fn unsigned_offset_forms() {
    let mut bus = TestBus::new();
    round_trip_int(
        a64::strb_uoff(0, 9, 5),
        a64::ldrb_uoff(0, 9, 5),
        0xA5,
        BASE + 5,
        &mut bus,
    );
    round_trip_int(
        a64::strh_uoff(0, 9, 6),
        a64::ldrh_uoff(0, 9, 6),
        0x1234,
        BASE + 6,
        &mut bus,
    );
    round_trip_int(
        a64::str_uoff(0, 9, 8),
        a64::ldr_uoff(0, 9, 8),
        0xDEAD_BEEF,
        BASE + 8,
        &mut bus,
    );
    round_trip_int(
        a64::str64_uoff(0, 9, 16),
        a64::ldr64_uoff(0, 9, 16),
        0x0102_0304_0506_0708,
        BASE + 16,
        &mut bus,
    );
}

#[test]
fn unscaled_and_indexed_forms() {
    let mut bus = TestBus::new();
    round_trip_int(
        a64::stur(0, 9, -8),
        a64::ldur(0, 9, -8),
        0x55AA_55AA,
        BASE - 8,
        &mut bus,
    );

    // Post-index: access at base, then base moves.
    let mut regs = regs_with_base(9);
    regs.x[0] = 0x11223344;
    handle_write_fault(a64::str_post(0, 9, 4), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[9], BASE as u64 + 4);

    let mut regs = regs_with_base(9);
    handle_read_fault(a64::ldr_post(0, 9, 4), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[0], 0x11223344);
    assert_eq!(regs.x[9], BASE as u64 + 4);

    // Pre-index: base moves, then the access happens there.
    let mut regs = regs_with_base(9);
    regs.x[0] = 0xCC;
    handle_write_fault(a64::strb_pre(0, 9, 3), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[9], BASE as u64 + 3);
    assert_eq!(bus.ram.read_8(BASE + 3), 0xCC);
}

#[test]
fn register_offset_forms() {
    let mut bus = TestBus::new();
    for (ext, index, scaled) in [
        (Extend::Uxtw, 0x10u64, false),
        (Extend::Sxtw, 0x10, false),
        (Extend::Lsl, 0x10, false),
    ] {
        let mut regs = regs_with_base(9);
        regs.x[2] = index;
        regs.x[0] = 0x77;
        handle_write_fault(
            a64::strb_roff(0, 9, 2, ext),
            &mut regs,
            FAR_UNKNOWN,
            &mut bus,
        )
        .unwrap();
        assert_eq!(bus.ram.read_8(BASE + index as u32), 0x77);
        let _ = scaled;
    }

    // Scaled halfword index.
    let mut regs = regs_with_base(9);
    regs.x[2] = 3; // element index, scaled by 2
    regs.x[0] = 0x99AA;
    handle_write_fault(
        a64::strh_roff(0, 9, 2, Extend::Lsl, true),
        &mut regs,
        FAR_UNKNOWN,
        &mut bus,
    )
    .unwrap();
    assert_eq!(bus.ram.read_16(BASE + 6), 0xAA99); // image order
}

#[test]
fn pair_and_exclusive_forms() {
    let mut bus = TestBus::new();

    let mut regs = regs_with_base(9);
    regs.x[0] = 0x0101_0101;
    regs.x[1] = 0x0202_0202;
    handle_write_fault(a64::stp(0, 1, 9, 8), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    let mut regs = regs_with_base(9);
    handle_read_fault(a64::ldp(2, 3, 9, 8), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[2], 0x0101_0101);
    assert_eq!(regs.x[3], 0x0202_0202);

    // Pre/post-index pair writebacks.
    let mut regs = regs_with_base(9);
    handle_read_fault(a64::ldp_post(2, 3, 9, 16), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[9], BASE as u64 + 16);
    let mut regs = regs_with_base(9);
    handle_read_fault(a64::ldp_pre(2, 3, 9, 8), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[9], BASE as u64 + 8);
    assert_eq!(regs.x[2], 0x0101_0101);

    // Exclusives complete as plain accesses with success status.
    let mut regs = regs_with_base(9);
    regs.x[0] = 0x5A5A_5A5A;
    regs.x[4] = 0xffff;
    handle_write_fault(a64::stxr(4, 0, 9), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[4], 0, "exclusive store reports success");
    let mut regs = regs_with_base(9);
    handle_read_fault(a64::ldxr(0, 9), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[0], 0x5A5A_5A5A);
}

#[test]
fn floating_point_forms() {
    let mut bus = TestBus::new();

    // Double store/load, unsigned offset.
    let mut regs = regs_with_base(9);
    regs.v[0] = 0x4045_0000_0000_0000; // 42.0 bits
    handle_write_fault(a64::fstd_uoff(0, 9, 8), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    let mut regs = regs_with_base(9);
    handle_read_fault(a64::fldd_uoff(1, 9, 8), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.v[1], 0x4045_0000_0000_0000);

    // Post-indexed double.
    let mut regs = regs_with_base(9);
    regs.v[2] = 1.5f64.to_bits();
    handle_write_fault(a64::fstd_post(2, 9, 8), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[9], BASE as u64 + 8);
    let mut regs = regs_with_base(9);
    handle_read_fault(a64::fldd_post(3, 9, 8), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.v[3], 1.5f64.to_bits());
}

#[test]
fn sign_extending_loads() {
    let mut bus = TestBus::new();
    bus.ram.write_8(BASE, 0x80);
    let mut regs = regs_with_base(9);
    handle_read_fault(a64::ldrsb_uoff(0, 9, 0), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[0] as u32, 0xffff_ff80);

    bus.ram.write_16(BASE + 2, 0x0190); // image 0x9001
    let mut regs = regs_with_base(9);
    handle_read_fault(a64::ldrsh_uoff(0, 9, 2), &mut regs, FAR_UNKNOWN, &mut bus).unwrap();
    assert_eq!(regs.x[0] as u32, 0xffff_9001);
}
