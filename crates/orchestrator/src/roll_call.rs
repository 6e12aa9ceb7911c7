//! Particle roll call: find duplicated and missing ids.
//!
//! Only meaningful on a single node, where the host holds every particle.
//! Each id is reported at most once per run.

use kernel::ParticleInfo;
use tracing::{debug, warn};

/// Anomalies found by one roll call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollCallReport {
    /// Ids seen more than once, with the indices of two occurrences.
    pub doubles: Vec<(u32, usize, usize)>,
    /// Ids in `0..count` never seen.
    pub missing: Vec<u32>,
    /// Ids at or beyond the expected id space.
    pub out_of_range: Vec<u32>,
}

impl RollCallReport {
    /// True if nothing was found.
    pub fn is_clean(&self) -> bool {
        self.doubles.is_empty() && self.missing.is_empty() && self.out_of_range.is_empty()
    }
}

/// Presence check over the id space, with sticky notification flags.
#[derive(Debug, Clone)]
pub struct RollCall {
    notified: Vec<bool>,
}

impl RollCall {
    /// Roll call for ids below `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            notified: vec![false; capacity],
        }
    }

    /// Check that `infos` holds every id in `0..expected` exactly once.
    ///
    /// Only anomalies not already notified in an earlier call are returned.
    pub fn check(&mut self, infos: &[ParticleInfo], expected: usize, iteration: u64) -> RollCallReport {
        let mut seen: Vec<Option<usize>> = vec![None; expected];
        let mut report = RollCallReport::default();

        for (pos, info) in infos.iter().enumerate() {
            let id = info.id as usize;
            let Some(slot) = seen.get_mut(id) else {
                if !self.take_notice(id) {
                    report.out_of_range.push(info.id);
                }
                continue;
            };
            match *slot {
                Some(first) => {
                    if !self.take_notice(id) {
                        report.doubles.push((info.id, first, pos));
                    }
                }
                None => *slot = Some(pos),
            }
        }
        for (id, slot) in seen.iter().enumerate() {
            if slot.is_none() && !self.take_notice(id) {
                report.missing.push(id as u32);
            }
        }

        for (n, (id, first, second)) in report.doubles.iter().enumerate() {
            if n == 0 {
                warn!("iteration {}: id {} found at {} and {}", iteration, id, first, second);
            } else {
                debug!("iteration {}: id {} found at {} and {}", iteration, id, first, second);
            }
        }
        for (n, id) in report.missing.iter().enumerate() {
            if n == 0 {
                warn!("iteration {}: id {} is missing", iteration, id);
            } else {
                debug!("iteration {}: id {} is missing", iteration, id);
            }
        }
        if !report.out_of_range.is_empty() {
            warn!(
                "iteration {}: {} ids beyond the expected {}",
                iteration,
                report.out_of_range.len(),
                expected
            );
        }
        report
    }

    /// Mark `id` notified; true if it already was.
    fn take_notice(&mut self, id: usize) -> bool {
        if id >= self.notified.len() {
            self.notified.resize(id + 1, false);
        }
        std::mem::replace(&mut self.notified[id], true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infos(ids: &[u32]) -> Vec<ParticleInfo> {
        ids.iter().map(|&id| ParticleInfo::fluid(id)).collect()
    }

    #[test]
    fn complete_set_is_clean() {
        let mut roll = RollCall::new(4);
        assert!(roll.check(&infos(&[2, 0, 3, 1]), 4, 0).is_clean());
    }

    #[test]
    fn doubles_and_missing_are_reported_once() {
        let mut roll = RollCall::new(4);
        let report = roll.check(&infos(&[0, 1, 1, 3]), 4, 7);
        assert_eq!(report.doubles, vec![(1, 1, 2)]);
        assert_eq!(report.missing, vec![2]);

        // same anomalies again: already notified
        assert!(roll.check(&infos(&[0, 1, 1, 3]), 4, 8).is_clean());
    }

    #[test]
    fn ids_beyond_the_space_are_flagged() {
        let mut roll = RollCall::new(2);
        let report = roll.check(&infos(&[0, 5]), 2, 0);
        assert_eq!(report.out_of_range, vec![5]);
        assert_eq!(report.missing, vec![1]);
    }
}
