use std::time::{Duration, Instant};

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_mb: u64,
    pub used_mb: u64,
    pub avail_mb: u64,
}

pub fn memory_stats_mb() -> MemoryStats {
    let mut sys = System::new_with_specifics(RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()));
    sys.refresh_memory();
    // sysinfo reports bytes
    let total_mb = sys.total_memory() / (1024 * 1024);
    let avail_mb = sys.available_memory() / (1024 * 1024);
    let used_mb = total_mb.saturating_sub(avail_mb);
    MemoryStats { total_mb, used_mb, avail_mb }
}

/// Progress rate for one stage: units done out of a known total.
#[derive(Debug, Clone, Copy)]
pub struct Throughput {
    start: Instant,
    total: u64,
}

impl Throughput {
    pub fn start(total: u64) -> Self { Self { start: Instant::now(), total } }

    pub fn elapsed(&self) -> Duration { self.start.elapsed() }

    pub fn fraction(&self, done: u64) -> f32 {
        if self.total == 0 { 1.0 } else { (done as f32 / self.total as f32).clamp(0.0, 1.0) }
    }

    /// Remaining seconds extrapolated from the rate so far.
    pub fn eta_secs(&self, done: u64) -> u64 {
        let frac = self.fraction(done);
        if frac <= 0.0 || frac >= 1.0 { return 0; }
        (self.start.elapsed().as_secs_f32() * (1.0 - frac) / frac) as u64
    }

    pub fn per_second(&self, done: u64) -> f64 {
        let secs = self.start.elapsed().as_secs_f64();
        if secs > 0.0 { done as f64 / secs } else { 0.0 }
    }
}
