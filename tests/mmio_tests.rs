//! Page-fault MMIO scenarios: guest accesses to bus-mapped addresses
//! outside the RAM shadow become synthesized bus cycles.

mod common;

use common::{Machine, MmioCycle};
use m68k_jit::bus::{BusBackend, ShadowRam, Width};
use m68k_jit::emit::a64;
use m68k_jit::fault::{self, HostRegs};

#[test]
fn guest_word_read_from_mmio() {
    // MOVE.W ($DFF006).L,D0 ; RTS — a chipset register read.
    let mut m = Machine::with_program(&[0x3039, 0x00df, 0xf006, 0x4e75]);
    m.bus.mmio_value = 0x1234;
    m.run();

    assert_eq!(m.state.d[0] & 0xffff, 0x1234);
    assert_eq!(
        m.bus.mmio_log,
        vec![MmioCycle {
            write: false,
            addr: 0x00df_f006,
            bytes: 2,
            value: 0,
        }]
    );
}

#[test]
fn guest_word_write_to_mmio() {
    // MOVE.W #$8020,($DFF09A).L ; RTS — INTENA-style write.
    let mut m = Machine::with_program(&[0x33fc, 0x8020, 0x00df, 0xf09a, 0x4e75]);
    m.run();
    assert_eq!(
        m.bus.mmio_log,
        vec![MmioCycle {
            write: true,
            addr: 0x00df_f09a,
            bytes: 2,
            value: 0x8020,
        }]
    );
}

#[test]
fn ldp_straddling_ram_and_mmio() {
    // An emitter-built LDP of two words whose second element falls in
    // the MMIO window: the handler must issue one cycle per element.
    let mut bus = common::TestBus::new();
    bus.mmio_value = 0xCAFE_F00D;

    let mut regs = HostRegs::default();
    // Pretend the pair starts four bytes below the window.
    regs.x[9] = common::MMIO_BASE as u64 - 4;
    bus.ram.write_32(common::MMIO_BASE - 4, 0x0102_0304);

    let op = a64::ldp(0, 1, 9, 0);
    fault::handle_read_fault(op, &mut regs, common::MMIO_BASE as u64, &mut bus).unwrap();

    // First element from RAM (memory image), second from the bus.
    assert_eq!(regs.x[0], 0x0403_0201);
    assert_eq!(regs.x[1], 0x0DF0_FECA); // image of 0xCAFEF00D
    assert_eq!(bus.mmio_log.len(), 1);
    assert_eq!(bus.mmio_log[0].addr, common::MMIO_BASE);
    assert_eq!(bus.mmio_log[0].bytes, 4);
}

#[test]
fn verify_trap_resumes_unchanged_unit() {
    use m68k_jit::jit::icache::ICache;
    use m68k_jit::jit::unit::EXEC_MIRROR_TAG;
    use m68k_jit::{JitConfig, JitStats};
    use std::sync::Arc;

    let mut ram = ShadowRam::new(0, 0x10000);
    ram.write(0x1000, Width::Word, 0x4e75);
    let cfg = JitConfig::default();
    let mut cache = ICache::new(1 << 20, Arc::new(JitStats::default()));
    let unit = cache.lookup_or_translate(&mut ram, &cfg, 0x1000).unwrap();
    let crc = unit.crc32;
    drop(unit);

    // Unchanged code: the trap resumes into the same unit.
    let outcome = fault::handle_verify_trap(EXEC_MIRROR_TAG | 0x1000, &mut cache, &mut ram, &cfg)
        .unwrap()
        .expect("tagged address");
    match outcome {
        fault::VerifyOutcome::Resume(u) => assert_eq!(u.crc32, crc),
        fault::VerifyOutcome::Retranslate(_) => panic!("should have resumed"),
    }

    // Changed code: the trap forces a retranslation.
    ram.write(0x1000, Width::Word, 0x7001);
    ram.write(0x1002, Width::Word, 0x4e75);
    let outcome = fault::handle_verify_trap(EXEC_MIRROR_TAG | 0x1000, &mut cache, &mut ram, &cfg)
        .unwrap()
        .expect("tagged address");
    match outcome {
        fault::VerifyOutcome::Retranslate(u) => assert_ne!(u.crc32, crc),
        fault::VerifyOutcome::Resume(_) => panic!("stale unit must not resume"),
    }

    // Untagged addresses are not verification traps.
    assert!(
        fault::handle_verify_trap(0x1000, &mut cache, &mut ram, &cfg)
            .unwrap()
            .is_none()
    );
}
