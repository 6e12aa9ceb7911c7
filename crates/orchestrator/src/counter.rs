//! Throughput counter in iterations times particles per second.

use std::time::Instant;

/// Accumulates iterations x particles and reports them per second of wall time.
#[derive(Debug, Clone, Default)]
pub struct IppsCounter {
    start: Option<Instant>,
    iters_times_parts: u64,
}

impl IppsCounter {
    /// Counter that is not running yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing if not already started. Returns the start instant.
    pub fn start(&mut self) -> Instant {
        *self.start.get_or_insert_with(Instant::now)
    }

    /// Zero the count and start timing again.
    pub fn restart(&mut self) -> Instant {
        self.iters_times_parts = 0;
        let now = Instant::now();
        self.start = Some(now);
        now
    }

    /// Count one iteration over `particles` particles.
    pub fn inc_iters_times_parts(&mut self, particles: u64) -> u64 {
        self.iters_times_parts = self.iters_times_parts.saturating_add(particles);
        self.iters_times_parts
    }

    /// Accumulated iterations x particles.
    pub fn iters_times_parts(&self) -> u64 {
        self.iters_times_parts
    }

    /// Wall time since start, zero if never started.
    pub fn elapsed_seconds(&self) -> f64 {
        self.start.map_or(0.0, |s| s.elapsed().as_secs_f64())
    }

    /// Millions of iterations x particles per second.
    pub fn mipps(&self) -> f64 {
        let elapsed = self.elapsed_seconds();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.iters_times_parts as f64 / elapsed / 1.0e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_restarts() {
        let mut counter = IppsCounter::new();
        assert_eq!(counter.mipps(), 0.0);
        counter.start();
        counter.inc_iters_times_parts(1000);
        assert_eq!(counter.inc_iters_times_parts(500), 1500);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(counter.mipps() > 0.0);
        counter.restart();
        assert_eq!(counter.iters_times_parts(), 0);
    }
}
