//! System bus with peripheral-emulation policies.
//!
//! Combines shadow-RAM blocks, an optional downstream PHY backend for
//! the physical bus window, and the control-register windows that need
//! side effects beyond raw read/write: the interrupt-enable shadow, the
//! CIA drive-select spoofing used when floppy drives are remapped, and
//! the expansion-board autoconfig handshake.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{BusBackend, ShadowRam, Width};
use crate::config::JitConfig;
use crate::state::JitStats;

// Amiga chipset registers the policies key off.
const CIAAPRA: u32 = 0xBFE001;
const CIABPRB: u32 = 0xBFD100;
const DMACONR: u32 = 0xDFF002;
const INTENAR: u32 = 0xDFF01C;
const INTREQR: u32 = 0xDFF01E;
const INTENA: u32 = 0xDFF09A;
const INTREQ: u32 = 0xDFF09C;

const AUTOCONF_BASE: u32 = 0xE8_0000;
const AUTOCONF_END: u32 = 0xE8_FFFF;

const SEL0_BIT: u32 = 3;

/// Rewiring and throttling policies applied inside the bus backend.
#[derive(Debug, Clone, Default)]
pub struct BusPolicies {
    /// Swap DF0 with DF1..DF3; 0 disables the swap.
    pub swap_df0_with: u32,
    /// Remap the trapdoor slow RAM window into chip space.
    pub move_slow_to_chip: bool,
    /// Treat the blitter as immediately idle at poll points.
    pub blitwait: bool,
}

impl BusPolicies {
    pub fn from_config(cfg: &JitConfig) -> Self {
        Self {
            swap_df0_with: cfg.swap_df0_with,
            move_slow_to_chip: cfg.move_slow_to_chip,
            blitwait: cfg.blitwait,
        }
    }
}

/// One expansion board participating in the autoconfig handshake.
#[derive(Debug)]
pub struct ExpansionBoard {
    pub rom: Vec<u8>,
    pub is_z3: bool,
    pub map_base: u32,
    pub enabled: bool,
}

/// Ownership lock for the physical bus: whichever core drives a cycle
/// holds it for the duration of that single transfer.
#[derive(Debug, Default)]
pub struct BusLock(AtomicBool);

impl BusLock {
    pub fn acquire(&self) {
        while self
            .0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The default bus backend: RAM shadow plus peripheral emulation.
pub struct SystemBus {
    ram: Vec<ShadowRam>,
    phy: Option<Box<dyn BusBackend>>,
    phy_lock: Arc<BusLock>,
    policies: BusPolicies,

    boards: Vec<ExpansionBoard>,
    board_idx: usize,

    intena: u16,
    intreq: u16,

    /// When the Amiga reads a drive ID with DF0 selected and the motor
    /// off, the CIAAPRA read must be spoofed; latched on CIABPRB writes.
    spoof_df0_id: bool,

    /// Guest-visible window onto the JIT statistics block.
    stats_window: Option<(u32, Arc<JitStats>)>,
}

impl SystemBus {
    pub fn new(policies: BusPolicies) -> Self {
        Self {
            ram: Vec::new(),
            phy: None,
            phy_lock: Arc::new(BusLock::default()),
            policies,
            boards: Vec::new(),
            board_idx: 0,
            intena: 0,
            intreq: 0,
            spoof_df0_id: false,
            stats_window: None,
        }
    }

    pub fn add_ram(&mut self, block: ShadowRam) {
        self.ram.push(block);
    }

    pub fn add_board(&mut self, board: ExpansionBoard) {
        self.boards.push(board);
    }

    pub fn set_phy(&mut self, phy: Box<dyn BusBackend>) {
        self.phy = Some(phy);
    }

    /// The lock serializing physical bus cycles across cores.
    pub fn phy_lock(&self) -> Arc<BusLock> {
        self.phy_lock.clone()
    }

    pub fn map_stats(&mut self, base: u32, stats: Arc<JitStats>) {
        self.stats_window = Some((base, stats));
    }

    pub fn intena_shadow(&self) -> u16 {
        self.intena
    }

    fn remap(&self, addr: u32) -> Option<u32> {
        if self.policies.move_slow_to_chip {
            if (0x08_0000..=0x0F_FFFF).contains(&addr) {
                // Trapdoor RAM decoded at the chip mirror instead.
                return Some(addr + 0xB8_0000);
            }
            if (0xC0_0000..=0xC7_FFFF).contains(&addr) {
                // Block the slow-RAM alias so the trapdoor is not
                // detected twice.
                return None;
            }
        }
        Some(addr)
    }

    fn ram_read(&mut self, addr: u32, width: Width) -> Option<u128> {
        self.ram
            .iter_mut()
            .find(|r| r.contains(addr, width.bytes()))
            .map(|r| r.read(addr, width))
    }

    fn ram_write(&mut self, addr: u32, width: Width, value: u128) -> bool {
        if let Some(r) = self.ram.iter_mut().find(|r| r.contains(addr, width.bytes())) {
            r.write(addr, width, value);
            true
        } else {
            false
        }
    }

    /// Unmapped reads return a rotating recognizable pattern so stray
    /// pointers show up in crash dumps.
    fn unmapped(addr: u32, width: Width) -> u128 {
        const PATTERN: [u8; 8] = [0xBA, 0xD0, 0x0B, 0xAD, 0x00, 0xBA, 0xD0, 0x0B];
        let mut v: u128 = 0;
        for i in 0..width.bytes() {
            v = (v << 8) | PATTERN[((addr + i) % 8) as usize] as u128;
        }
        v
    }

    fn autoconfig_read(&mut self, addr: u32) -> u8 {
        while self.board_idx < self.boards.len() && !self.boards[self.board_idx].enabled {
            self.board_idx += 1;
        }
        match self.boards.get(self.board_idx) {
            Some(b) => {
                let off = (addr - AUTOCONF_BASE) as usize;
                b.rom.get(off).copied().unwrap_or(0xff)
            }
            None => 0xff,
        }
    }

    fn autoconfig_write(&mut self, addr: u32, value: u128) {
        let Some(board) = self.boards.get_mut(self.board_idx) else {
            return;
        };
        if board.is_z3 {
            if addr == 0xE8_0044 {
                board.map_base = ((value as u32) & 0xffff) << 16;
                log::debug!(target: "bus", "autoconfig Z3 board mapped at {:#x}", board.map_base);
                self.board_idx += 1;
            }
        } else if addr == 0xE8_0048 {
            board.map_base = ((value as u32) & 0xff) << 16;
            log::debug!(target: "bus", "autoconfig Z2 board mapped at {:#x}", board.map_base);
            self.board_idx += 1;
        }
        // Shut-up register: board declines configuration.
        if addr == 0xE8_004C || addr == 0xE8_004E {
            self.board_idx += 1;
        }
    }

    /// Swap the SEL0/SELx bits of a CIA port value when drive remapping
    /// is active.
    fn swap_sel_bits(&self, mut value: u128) -> u128 {
        let n = self.policies.swap_df0_with;
        if n != 0 && ((value >> SEL0_BIT) & 1) != ((value >> (SEL0_BIT + n)) & 1) {
            value ^= (1 << SEL0_BIT) | (1 << (SEL0_BIT + n));
        }
        value
    }
}

impl BusBackend for SystemBus {
    fn read(&mut self, addr: u32, width: Width) -> u128 {
        let Some(addr) = self.remap(addr) else {
            return 0;
        };

        if let Some((base, stats)) = &self.stats_window
            && addr >= *base
            && addr < *base + crate::state::ctx::SIZE
        {
            return stats.read_field(addr - *base) as u128;
        }

        if let Some(v) = self.ram_read(addr, width) {
            return v;
        }

        if (AUTOCONF_BASE..=AUTOCONF_END).contains(&addr) && width == Width::Byte {
            return self.autoconfig_read(addr) as u128;
        }

        let mut value = match addr & !1 {
            _ if addr == DMACONR && self.policies.blitwait => {
                // Poll points see the blitter idle immediately: BBUSY
                // and BZERO clear.
                return 0;
            }
            a if a == INTENAR => self.intena as u128,
            a if a == INTREQR => self.intreq as u128,
            _ => match &mut self.phy {
                Some(phy) => {
                    self.phy_lock.acquire();
                    let v = phy.read(addr, width);
                    self.phy_lock.release();
                    v
                }
                None => Self::unmapped(addr, width),
            },
        };

        if addr == CIAAPRA && self.policies.swap_df0_with != 0 && self.spoof_df0_id {
            // DF0 has no drive-type ID on RDY; when remapped, hold RDY
            // low so the swapped drive keeps functioning as DF0.
            value &= 0xDF;
        }
        if addr == CIABPRB {
            value = self.swap_sel_bits(value);
        }

        value
    }

    fn write(&mut self, addr: u32, width: Width, mut value: u128) {
        let Some(addr) = self.remap(addr) else {
            return;
        };

        if addr == CIABPRB {
            let n = self.policies.swap_df0_with;
            if n != 0 {
                // Drive selected with motor off means the guest is about
                // to read the drive ID.
                self.spoof_df0_id =
                    (value as u32 & ((1 << (SEL0_BIT + n)) | 0x80)) == 0x80;
                value = self.swap_sel_bits(value);
            }
        }

        match addr & !1 {
            a if a == INTENA => {
                let v = value as u16;
                if v & 0x8000 != 0 {
                    self.intena |= v & 0x7fff;
                } else {
                    self.intena &= !(v & 0x7fff);
                }
                return;
            }
            a if a == INTREQ => {
                let v = value as u16;
                if v & 0x8000 != 0 {
                    self.intreq |= v & 0x7fff;
                } else {
                    self.intreq &= !(v & 0x7fff);
                }
                return;
            }
            _ => {}
        }

        if (AUTOCONF_BASE..=AUTOCONF_END).contains(&addr) {
            self.autoconfig_write(addr, value);
            return;
        }

        if self.ram_write(addr, width, value) {
            return;
        }

        if let Some(phy) = &mut self.phy {
            self.phy_lock.acquire();
            phy.write(addr, width, value);
            self.phy_lock.release();
        }
        // Unmapped writes are dropped.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with_swap(n: u32) -> SystemBus {
        SystemBus::new(BusPolicies {
            swap_df0_with: n,
            ..Default::default()
        })
    }

    #[test]
    fn unmapped_read_returns_pattern() {
        let mut bus = SystemBus::new(BusPolicies::default());
        let v = bus.read(0x0200_0000, Width::Word) as u16;
        assert_eq!(v, 0xBAD0);
    }

    #[test]
    fn intena_shadow_set_and_clear() {
        let mut bus = SystemBus::new(BusPolicies::default());
        bus.write(INTENA, Width::Word, 0x8000 | 0x4000);
        assert_eq!(bus.read(INTENAR, Width::Word) as u16, 0x4000);
        bus.write(INTENA, Width::Word, 0x4000);
        assert_eq!(bus.read(INTENAR, Width::Word) as u16, 0);
    }

    #[test]
    fn drive_select_bits_swapped() {
        let mut bus = bus_with_swap(1);
        // SEL0 low, SEL1 high: bits must trade places on the way out.
        let out = bus.swap_sel_bits(0x10);
        assert_eq!(out, 0x08);
    }

    #[test]
    fn autoconfig_z2_handshake_advances_board() {
        let mut bus = SystemBus::new(BusPolicies::default());
        bus.add_board(ExpansionBoard {
            rom: vec![0xC5; 64],
            is_z3: false,
            map_base: 0,
            enabled: true,
        });
        assert_eq!(bus.read(AUTOCONF_BASE, Width::Byte) as u8, 0xC5);
        bus.write(0xE8_0048, Width::Byte, 0x40);
        assert_eq!(bus.board_idx, 1);
        assert_eq!(bus.boards[0].map_base, 0x40_0000);
    }
}
