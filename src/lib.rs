//! NexaOS energy-aware scheduling core
//!
//! Energy-aware CPU placement for heterogeneous (big.LITTLE style) SMP
//! systems. The host scheduler keeps ownership of run queues, task
//! activation and locking of its own structures; this crate is invoked
//! synchronously from the host's tick, wakeup, enqueue/dequeue and
//! context-switch paths through [`SchedulerEventSink`].
//!
//! ## Module Organization
//!
//! - `topology`: CPU ids, CPU masks, clusters ("gears")
//! - `percpu`: per-CPU arena and run-queue side state, ordered double locking
//! - `energy`: energy model tables, calibration blob, DSU sub-model
//! - `flt`: fast load tracking (sliding windows per CPU, task and group)
//! - `grp_awr`: group utilization aggregation and preferred-gear hints
//! - `estimate`: energy estimation for a candidate placement
//! - `placement`: CFS wakeup/fork placement with fallback chain
//! - `rt`: real-time class placement
//! - `rotate`: misfit migration and big task rotation
//! - `engine`: ties everything together behind the host interfaces

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod energy;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod flt;
pub mod grp_awr;
pub mod host;
pub mod logger;
pub mod percpu;
pub mod placement;
pub mod rotate;
pub mod rt;
pub mod task;
pub mod telemetry;
pub mod topology;
pub mod tunables;

pub use config::EasConfig;
pub use energy::{
    build_energy_model, EmCalibration, EnergyModel, ModelKind, OperatingPoint, WorkloadType,
};
pub use engine::EasEngine;
pub use error::{EasError, EmError, Timeout};
pub use host::{
    CpuSnapshot, MigrationRequest, RunningTask, SchedPolicy, SchedulerEventSink, SchedulerHost,
};
pub use placement::{Placement, PlacementKind, PlacementPath, PlacementRequest, WakerInfo};
pub use task::{GearHints, SchedulingExtension, TaskId, VipTier};
pub use topology::{ClusterDesc, ClusterId, CpuId, CpuMask, Topology};
pub use tunables::{FltMode, Tunables};

/// Full capacity of the biggest CPU at its highest operating point.
pub const SCHED_CAPACITY_SCALE: u64 = 1024;

/// Shift matching [`SCHED_CAPACITY_SCALE`].
pub const SCHED_CAPACITY_SHIFT: u32 = 10;

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::FATAL, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
