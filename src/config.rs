//! Boot-time configuration
//!
//! Defaults for every tunable, optionally overridden from the kernel
//! command line with whitespace separated `eas.<key>=<value>` tokens:
//!
//! ```text
//! eas.window_ms=4 eas.flt=full eas.rotation=1 eas.rotate_ms=6
//! eas.grp_dvfs=1 eas.adaptive_margin=1 eas.margin=1280
//! eas.grp2_pct=60 eas.up_pct=80 eas.down_pct=60 eas.irq_pct=25
//! eas.telemetry=0 eas.loglevel=debug
//! ```
//!
//! Unknown keys are ignored; malformed values keep the default.

use crate::flt::{DEFAULT_WINDOW_NS, GROUP_COUNT};
use crate::logger::{self, LogLevel};
use crate::tunables::{
    FltMode, MAX_MARGIN, MAX_ROTATION_THRESHOLD_NS, MAX_WINDOW_NS, MIN_MARGIN,
    MIN_ROTATION_THRESHOLD_NS, MIN_WINDOW_NS,
};
use crate::{kdebug, kwarn};

pub const DEFAULT_GROUP_THRESHOLD_PCT: u32 = 80;
pub const DEFAULT_UP_PCT: u32 = 80;
pub const DEFAULT_DOWN_PCT: u32 = 60;
pub const DEFAULT_ROTATION_THRESHOLD_NS: u64 = 6_000_000;
pub const DEFAULT_HIGH_IRQ_PCT: u32 = 25;

const PREFIX: &str = "eas.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EasConfig {
    pub window_ns: u64,
    pub flt_mode: FltMode,
    pub rotation: bool,
    pub rotation_threshold_ns: u64,
    pub group_aware_dvfs: bool,
    pub adaptive_margin: bool,
    /// Manual margin override; `None` keeps the computed margins.
    pub manual_margin: Option<u64>,
    pub group_threshold_pct: [u32; GROUP_COUNT],
    pub up_pct: u32,
    pub down_pct: u32,
    pub high_irq_pct: u32,
    pub telemetry: bool,
    pub log_level: Option<LogLevel>,
}

impl Default for EasConfig {
    fn default() -> Self {
        Self {
            window_ns: DEFAULT_WINDOW_NS,
            flt_mode: FltMode::TaskAndCpu,
            rotation: true,
            rotation_threshold_ns: DEFAULT_ROTATION_THRESHOLD_NS,
            group_aware_dvfs: true,
            adaptive_margin: true,
            manual_margin: None,
            group_threshold_pct: [DEFAULT_GROUP_THRESHOLD_PCT; GROUP_COUNT],
            up_pct: DEFAULT_UP_PCT,
            down_pct: DEFAULT_DOWN_PCT,
            high_irq_pct: DEFAULT_HIGH_IRQ_PCT,
            telemetry: cfg!(feature = "telemetry"),
            log_level: None,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "on" | "true" | "y" | "yes" => Some(true),
        "0" | "off" | "false" | "n" | "no" => Some(false),
        _ => None,
    }
}

fn parse_ranged<T>(value: &str, min: T, max: T) -> Option<T>
where
    T: core::str::FromStr + PartialOrd + Copy,
{
    value
        .parse::<T>()
        .ok()
        .filter(|parsed| *parsed >= min && *parsed <= max)
}

impl EasConfig {
    /// Defaults overridden by the `eas.*` tokens of `cmdline`.
    pub fn parse_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        config.apply_cmdline(cmdline);
        config
    }

    /// Apply `eas.*` tokens on top of the current values. Returns the number
    /// of tokens that were applied.
    pub fn apply_cmdline(&mut self, cmdline: &str) -> usize {
        let mut applied = 0;
        for token in cmdline.split_whitespace() {
            let Some(rest) = token.strip_prefix(PREFIX) else {
                continue;
            };
            let Some((key, value)) = rest.split_once('=') else {
                kwarn!("eas: ignoring '{}' (missing value)", token);
                continue;
            };
            match self.apply_one(key, value) {
                Some(true) => applied += 1,
                Some(false) => kwarn!("eas: bad value for '{}', keeping default", token),
                None => kdebug!("eas: unknown option '{}'", key),
            }
        }
        applied
    }

    /// `None` for an unknown key, `Some(false)` for a rejected value.
    fn apply_one(&mut self, key: &str, value: &str) -> Option<bool> {
        let ok = match key {
            "window_ms" => {
                match parse_ranged(value, MIN_WINDOW_NS / 1_000_000, MAX_WINDOW_NS / 1_000_000) {
                    Some(ms) => {
                        self.window_ns = ms * 1_000_000;
                        true
                    }
                    None => false,
                }
            }
            "flt" => set(&mut self.flt_mode, FltMode::from_str(value)),
            "rotation" => set(&mut self.rotation, parse_bool(value)),
            "rotate_ms" => match parse_ranged(
                value,
                MIN_ROTATION_THRESHOLD_NS / 1_000_000,
                MAX_ROTATION_THRESHOLD_NS / 1_000_000,
            ) {
                Some(ms) => {
                    self.rotation_threshold_ns = ms * 1_000_000;
                    true
                }
                None => false,
            },
            "grp_dvfs" => set(&mut self.group_aware_dvfs, parse_bool(value)),
            "adaptive_margin" => set(&mut self.adaptive_margin, parse_bool(value)),
            "margin" => {
                if value == "auto" {
                    self.manual_margin = None;
                    true
                } else {
                    match parse_ranged(value, MIN_MARGIN, MAX_MARGIN) {
                        Some(margin) => {
                            self.manual_margin = Some(margin);
                            true
                        }
                        None => false,
                    }
                }
            }
            "up_pct" => set(&mut self.up_pct, parse_ranged(value, 1, 100)),
            "down_pct" => set(&mut self.down_pct, parse_ranged(value, 1, 100)),
            "irq_pct" => set(&mut self.high_irq_pct, parse_ranged(value, 1, 100)),
            "telemetry" => set(&mut self.telemetry, parse_bool(value)),
            "loglevel" => match LogLevel::from_str(value) {
                Some(level) => {
                    self.log_level = Some(level);
                    true
                }
                None => false,
            },
            _ => {
                let group = key
                    .strip_prefix("grp")
                    .and_then(|rest| rest.strip_suffix("_pct"))
                    .and_then(|idx| idx.parse::<usize>().ok())
                    .filter(|idx| *idx < GROUP_COUNT)?;
                set(
                    &mut self.group_threshold_pct[group],
                    parse_ranged(value, 0, 100),
                )
            }
        };
        Some(ok)
    }

    /// Apply the configured log level, if any.
    pub fn apply_log_level(&self) {
        if let Some(level) = self.log_level {
            logger::set_max_level(level);
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(value) => {
            *slot = value;
            true
        }
        None => false,
    }
}
