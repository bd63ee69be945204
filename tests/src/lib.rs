//! NexaOS EAS core test suite
//!
//! Drives `nexa-eas` through its public interface against a scriptable
//! host scheduler (`mock::MockHost`). Unit tests that need private items
//! live next to the code in `src/`.
//!
//! # Layout
//! - `mock`: host, topologies, calibrations and a placement harness
//! - one module per subsystem, plus `engine` for bring-up and end to end
//!   scenarios


#[cfg(test)]
mod config;
#[cfg(test)]
mod estimate;
#[cfg(test)]
mod rt;
