//! Boot configuration, runtime tunables and the logger

use nexa_eas::config::EasConfig;
use nexa_eas::flt::GroupId;
use nexa_eas::logger::{self, LogLevel, LOG_TARGET};
use nexa_eas::{ClusterId, FltMode, PlacementPath, SchedulerEventSink, SchedulingExtension, TaskId};
use serial_test::serial;
use spin::Mutex;

use crate::mock::{cpu, engine_with, request, two_gear, two_gear_calibration};

// ============================================================================
// Command line
// ============================================================================

#[test]
fn test_cmdline_reaches_tunables() {
    let config = EasConfig::parse_cmdline(
        "console=ttyS0 eas.flt=cpu eas.rotation=off eas.rotate_ms=12 eas.grp_dvfs=0 \
         eas.margin=1536 eas.grp0_pct=50 eas.irq_pct=40 eas.telemetry=1",
    );
    let engine = engine_with(two_gear(), Some(&two_gear_calibration()), config);
    let tunables = engine.tunables();

    assert_eq!(tunables.flt_mode(), FltMode::CpuOnly);
    assert!(!tunables.rotation_enabled());
    assert_eq!(tunables.rotation_threshold_ns(), 12_000_000);
    assert!(!tunables.group_aware_dvfs());
    assert_eq!(tunables.forced_margin(), Some(1536));
    assert_eq!(tunables.group_threshold_pct(GroupId::new(0).expect("group")), 50);
    assert_eq!(tunables.high_irq_pct(), 40);
    assert!(tunables.telemetry());
}

#[test]
fn test_margin_auto_clears_override() {
    let mut config = EasConfig::parse_cmdline("eas.margin=1300");
    assert_eq!(config.manual_margin, Some(1300));
    assert_eq!(config.apply_cmdline("eas.margin=auto"), 1);
    assert_eq!(config.manual_margin, None);
}

#[test]
fn test_later_tokens_win() {
    let config = EasConfig::parse_cmdline("eas.window_ms=8 eas.window_ms=16");
    assert_eq!(config.window_ns, 16_000_000);
}

#[test]
fn test_up_pct_changes_what_fits() {
    // 450 * 100 < 512 * 90
    let roomy = EasConfig::parse_cmdline("eas.up_pct=90 eas.down_pct=70");
    let engine = engine_with(two_gear(), Some(&two_gear_calibration()), roomy);
    let mut task = SchedulingExtension::new(TaskId(1));
    let placement = engine.on_wakeup(&request(1, 0, 450), &mut task);
    assert_eq!(placement.path, PlacementPath::SingleCandidate);
    assert_eq!(placement.cpu, Some(cpu(0)));

    let engine = engine_with(two_gear(), Some(&two_gear_calibration()), EasConfig::default());
    let placement = engine.on_wakeup(&request(1, 0, 450), &mut task);
    assert_eq!(placement.cpu, Some(cpu(2)));
}

// ============================================================================
// Runtime tunables
// ============================================================================

#[test]
fn test_tunables_reject_out_of_range() {
    let engine = engine_with(two_gear(), None, EasConfig::default());
    let tunables = engine.tunables();

    assert!(!tunables.set_high_irq_pct(0));
    assert!(!tunables.set_high_irq_pct(101));
    assert_eq!(tunables.high_irq_pct(), 25);

    assert!(!tunables.set_rotation_threshold_ns(200_000_000));
    assert!(tunables.set_rotation_threshold_ns(2_000_000));
    assert_eq!(tunables.rotation_threshold_ns(), 2_000_000);

    assert!(tunables.set_migration_pct(ClusterId(0), 95, 85));
    assert_eq!(tunables.up_pct(ClusterId(0)), 95);
    assert_eq!(tunables.down_pct(ClusterId(0)), 85);
    assert_eq!(tunables.up_pct(ClusterId(1)), 80);
    // unknown clusters report the full 100%
    assert_eq!(tunables.up_pct(ClusterId(7)), 100);
}

// ============================================================================
// Logger
// ============================================================================

struct Capture {
    records: Mutex<Vec<(log::Level, String)>>,
}

impl log::Log for Capture {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.target() == LOG_TARGET
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            self.records
                .lock()
                .push((record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture {
    records: Mutex::new(Vec::new()),
};

fn capture() -> &'static Capture {
    // only the first install succeeds; later calls find it in place
    let _ = log::set_logger(&CAPTURE);
    log::set_max_level(log::LevelFilter::Trace);
    &CAPTURE
}

fn captured(needle: &str) -> Vec<(log::Level, String)> {
    CAPTURE
        .records
        .lock()
        .iter()
        .filter(|(_, line)| line.contains(needle))
        .cloned()
        .collect()
}

fn fixed_clock() -> u64 {
    42_000_000_000
}

#[test]
#[serial]
fn test_records_reach_facade_with_level_tag() {
    capture();
    logger::set_max_level(LogLevel::DEBUG);
    nexa_eas::kwarn!("capture-warn {}", 7);

    let lines = captured("capture-warn 7");
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].0, log::Level::Warn);
    assert!(lines[0].1.ends_with("[WARN ] capture-warn 7"), "{}", lines[0].1);
    logger::set_max_level(LogLevel::INFO);
}

#[test]
#[serial]
fn test_records_above_max_level_are_dropped() {
    capture();
    logger::set_max_level(LogLevel::WARN);
    nexa_eas::kinfo!("capture-filtered");
    nexa_eas::kerror!("capture-kept");
    assert!(captured("capture-filtered").is_empty());
    assert_eq!(captured("capture-kept").len(), 1);
    logger::set_max_level(LogLevel::INFO);
}

#[test]
#[serial]
fn test_long_records_are_truncated() {
    capture();
    logger::set_max_level(LogLevel::INFO);
    let before = logger::truncated_records();
    let long = "x".repeat(400);
    nexa_eas::kinfo!("capture-long {}", long);

    assert!(logger::truncated_records() > before);
    let lines = captured("capture-long");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].1.len() <= 256);
}

#[test]
#[serial]
fn test_first_clock_wins() {
    logger::init(fixed_clock);
    assert!(logger::is_initialized());
    assert!(!logger::init(fixed_clock));
    assert_eq!(logger::boot_time_us(), 0);
}

#[test]
#[serial]
fn test_config_log_level_applies_at_bring_up() {
    let config = EasConfig::parse_cmdline("eas.loglevel=trace");
    let _engine = engine_with(two_gear(), None, config);
    assert_eq!(logger::max_level(), LogLevel::TRACE);
    logger::set_max_level(LogLevel::INFO);
}
