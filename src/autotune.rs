//! # CPU load sampling
//!
//! The coordinator throttles workers against a live CPU reading. The reading
//! comes from a [`CpuProbe`] so tests can drive the throttle with a scripted
//! load curve instead of the real machine.

use std::time::{Duration, Instant};
use sysinfo::System;

/// Source of "current CPU usage" readings in percent (0.0-100.0).
pub trait CpuProbe {
    fn sample(&mut self) -> f32;
}

impl<F: FnMut() -> f32> CpuProbe for F {
    fn sample(&mut self) -> f32 {
        self()
    }
}

/// Global CPU usage of the host, as reported by `sysinfo`.
pub struct SystemCpuProbe {
    system: System,
    last_update: Instant,
    update_interval: Duration,
    last_value: f32,
}

impl SystemCpuProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system,
            last_update: Instant::now(),
            // sysinfo needs a minimum delay between two refreshes to compute usage.
            update_interval: sysinfo::MINIMUM_CPU_UPDATE_INTERVAL,
            last_value: 0.0,
        }
    }
}

impl Default for SystemCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for SystemCpuProbe {
    fn sample(&mut self) -> f32 {
        if self.last_update.elapsed() >= self.update_interval {
            self.system.refresh_cpu();
            self.last_update = Instant::now();
            self.last_value = self.system.global_cpu_info().cpu_usage();
        }
        self.last_value
    }
}
