//! Runtime tuning knobs.
//!
//! The host bring-up hands the core the `bootargs` string from the
//! device tree; everything the core recognizes is collected here. Two
//! bit-packed control words mirror the active settings into the guest
//! state so that guest-side tools can inspect them.

/// Per-unit instruction budget bounds.
pub const INSN_DEPTH_MAX: u32 = 256;
/// FlagAnalyzer scan depth bound.
pub const CCR_DEPTH_MAX: u32 = 31;
/// Default number of times a backward jump may be revisited per unit.
pub const LOOP_COUNT_DEFAULT: u32 = 8;

// JIT_CONTROL layout.
const JCB_SOFT_FLUSH: u32 = 1 << 0;
const JCB_INSN_DEPTH_SHIFT: u32 = 1; // 8 bits, 0 encodes 256
const JCB_INLINE_RANGE_SHIFT: u32 = 9; // 16 bits
const JCB_LOOP_COUNT_SHIFT: u32 = 25; // 4 bits, 0 encodes 8

// JIT_CONTROL2 layout.
const JC2F_CHIP_SLOWDOWN: u32 = 1 << 0;
const JC2F_DBF_SLOWDOWN: u32 = 1 << 1;
const JC2F_BLITWAIT: u32 = 1 << 2;
const JC2B_CHIP_RATIO_SHIFT: u32 = 4; // 3 bits
const JC2B_CCR_DEPTH_SHIFT: u32 = 8; // 5 bits

/// Tuning options recognized in the bootargs string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Start with the guest cache-enable bit set (`enable_cache`).
    pub enable_cache: bool,
    /// Restrict the RAM map to the low 2 GiB window (`limit_2g`).
    pub limit_2g: bool,
    /// Refuse to translate FP opcodes, trap instead (`nofpu`).
    pub nofpu: bool,
    /// Developer tracing switches (`debug`, `disassemble`).
    pub debug: bool,
    pub disassemble: bool,
    /// Throttle code running from chip memory (`chip_slowdown`/`SC`),
    /// touching the PC every `cs_dist` instructions.
    pub chip_slowdown: bool,
    pub cs_dist: u32,
    /// Extra delay in DBcc loops (`dbf_slowdown`/`DBF`).
    pub dbf_slowdown: bool,
    /// Block until the blitter is idle at known poll points (`blitwait`).
    pub blitwait: bool,
    /// Per-unit instruction budget (`ICNT=n`, 1..256).
    pub insn_depth: u32,
    /// FlagAnalyzer scan depth (`CCRD=n`, 0..31).
    pub ccr_scan_depth: u32,
    /// Branch inlining distance in bytes (`IRNG=n`).
    pub inline_range: u32,
    /// Start-time memory test size in MiB and iterations
    /// (`buptest=N`, `bupiter=K`); consumed by the bring-up.
    pub buptest: u32,
    pub bupiter: u32,
    /// MiB reserved at the top of RAM for the coprocessor (`vc4.mem=N`).
    pub vc4_mem: u32,
    /// ROM handling switches.
    pub checksum_rom: bool,
    pub copy_rom: u32,
    pub fast_page_zero: bool,
    /// Swap DF0 with DF1..DF3 (`swap_df0_with_dfx`); 0 = off.
    pub swap_df0_with: u32,
    /// Remap trapdoor slow RAM into chip space (`move_slow_to_chip`).
    pub move_slow_to_chip: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enable_cache: false,
            limit_2g: false,
            nofpu: false,
            debug: false,
            disassemble: false,
            chip_slowdown: false,
            cs_dist: 1,
            dbf_slowdown: false,
            blitwait: false,
            insn_depth: INSN_DEPTH_MAX,
            ccr_scan_depth: 20,
            inline_range: 4096,
            buptest: 0,
            bupiter: 1,
            vc4_mem: 0,
            checksum_rom: false,
            copy_rom: 0,
            fast_page_zero: false,
            swap_df0_with: 0,
            move_slow_to_chip: false,
        }
    }
}

/// Return the decimal value following `key` if `args` contains a token
/// starting with it.
fn find_value(args: &str, key: &str) -> Option<u32> {
    for token in args.split_whitespace() {
        if let Some(rest) = token.strip_prefix(key) {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(v) = digits.parse() {
                return Some(v);
            }
        }
    }
    None
}

fn find_token(args: &str, token: &str) -> bool {
    args.split_whitespace().any(|t| t == token)
}

impl JitConfig {
    /// Parse the recognized tuning options out of a bootargs string.
    /// Unknown tokens are ignored; out-of-range values are clamped.
    pub fn from_bootargs(args: &str) -> Self {
        let mut cfg = Self::default();

        cfg.enable_cache = find_token(args, "enable_cache");
        cfg.limit_2g = find_token(args, "limit_2g");
        cfg.nofpu = find_token(args, "nofpu");
        cfg.debug = find_token(args, "debug");
        cfg.disassemble = find_token(args, "disassemble");
        cfg.chip_slowdown = find_token(args, "chip_slowdown") || find_token(args, "SC");
        cfg.dbf_slowdown = find_token(args, "dbf_slowdown") || find_token(args, "DBF");
        cfg.blitwait = find_token(args, "blitwait") || find_token(args, "BW");
        cfg.checksum_rom = find_token(args, "checksum_rom");
        cfg.fast_page_zero = find_token(args, "fast_page_zero");
        cfg.move_slow_to_chip = find_token(args, "move_slow_to_chip");

        if let Some(v) = find_value(args, "cs_dist=") {
            cfg.cs_dist = v.clamp(1, 8);
        }
        if let Some(v) = find_value(args, "ICNT=") {
            cfg.insn_depth = v.clamp(1, INSN_DEPTH_MAX);
        }
        if let Some(v) = find_value(args, "CCRD=") {
            cfg.ccr_scan_depth = v.min(CCR_DEPTH_MAX);
        }
        if let Some(v) = find_value(args, "IRNG=") {
            cfg.inline_range = v.min(65535);
        }
        if let Some(v) = find_value(args, "buptest=") {
            cfg.buptest = v.min(2048);
        }
        if let Some(v) = find_value(args, "bupiter=") {
            cfg.bupiter = v.clamp(1, 99);
        }
        if let Some(v) = find_value(args, "vc4.mem=") {
            cfg.vc4_mem = v;
        }
        if let Some(v) = find_value(args, "copy_rom=") {
            cfg.copy_rom = v;
        }
        for n in 1..=3 {
            if find_token(args, &format!("swap_df0_with_df{n}")) {
                cfg.swap_df0_with = n;
            }
        }

        cfg
    }

    /// Pack the translation-related settings into the JIT_CONTROL word.
    pub fn jit_control(&self) -> u32 {
        let depth = self.insn_depth & 0xff; // 0 encodes 256
        let range = self.inline_range & 0xffff;
        (depth << JCB_INSN_DEPTH_SHIFT)
            | (range << JCB_INLINE_RANGE_SHIFT)
            | ((LOOP_COUNT_DEFAULT & 0xf) << JCB_LOOP_COUNT_SHIFT)
    }

    /// Pack the slowdown-related settings into the JIT_CONTROL2 word.
    pub fn jit_control2(&self) -> u32 {
        let mut w = 0;
        if self.chip_slowdown {
            w |= JC2F_CHIP_SLOWDOWN;
        }
        if self.dbf_slowdown {
            w |= JC2F_DBF_SLOWDOWN;
        }
        if self.blitwait {
            w |= JC2F_BLITWAIT;
        }
        w |= (self.cs_dist.saturating_sub(1) & 7) << JC2B_CHIP_RATIO_SHIFT;
        w |= (self.ccr_scan_depth & 0x1f) << JC2B_CCR_DEPTH_SHIFT;
        w
    }

    /// Soft-flush request bit, set by the guest through the control
    /// window to ask for a full cache flush at the next boundary.
    pub fn soft_flush_requested(control: u32) -> bool {
        control & JCB_SOFT_FLUSH != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flag_tokens() {
        let cfg = JitConfig::from_bootargs("enable_cache debug SC DBF blitwait nofpu");
        assert!(cfg.enable_cache);
        assert!(cfg.debug);
        assert!(cfg.chip_slowdown);
        assert!(cfg.dbf_slowdown);
        assert!(cfg.blitwait);
        assert!(cfg.nofpu);
        assert!(!cfg.limit_2g);
    }

    #[test]
    fn clamps_numeric_values() {
        let cfg = JitConfig::from_bootargs("ICNT=999 CCRD=77 cs_dist=12 IRNG=100000");
        assert_eq!(cfg.insn_depth, INSN_DEPTH_MAX);
        assert_eq!(cfg.ccr_scan_depth, CCR_DEPTH_MAX);
        assert_eq!(cfg.cs_dist, 8);
        assert_eq!(cfg.inline_range, 65535);
    }

    #[test]
    fn drive_swap_selection() {
        assert_eq!(JitConfig::from_bootargs("swap_df0_with_df2").swap_df0_with, 2);
        assert_eq!(JitConfig::from_bootargs("").swap_df0_with, 0);
    }

    #[test]
    fn control_words_round_trip_depth() {
        let cfg = JitConfig::from_bootargs("ICNT=32 CCRD=5");
        assert_eq!((cfg.jit_control() >> 1) & 0xff, 32);
        assert_eq!((cfg.jit_control2() >> 8) & 0x1f, 5);
    }
}
