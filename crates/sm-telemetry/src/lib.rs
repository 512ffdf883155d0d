//! sm-telemetry: tracing bootstrap and lightweight process counters.

pub mod logging;
pub mod metrics;
