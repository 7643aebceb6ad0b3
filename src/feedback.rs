//! Code coverage feedback gathered across runs

use crate::addrs::{GvaSet, VirtAddr};

/// Tracks executed instruction addresses for the whole session and for the run in
/// flight
#[derive(Default, Clone, Debug)]
pub struct CoverageTracker {
    /// Every address executed by any run of the session
    aggregated: GvaSet,

    /// Addresses executed by the current run
    last_run: GvaSet,

    /// Addresses first discovered by the current run. Always a subset of both
    /// `aggregated` and `last_run`.
    new: GvaSet,

    /// Number of new addresses discovered over the whole session
    new_count: u64,
}

impl CoverageTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the execution of `addr`. Returns `true` if the address was never seen
    /// before in this session.
    pub fn record_hit(&mut self, addr: VirtAddr) -> bool {
        self.last_run.insert(addr);

        let is_new = self.aggregated.insert(addr);
        if is_new {
            self.new.insert(addr);
            self.new_count += 1;
        }

        is_new
    }

    /// Addresses first discovered by the last run
    #[must_use]
    pub fn last_new_coverage(&self) -> &GvaSet {
        &self.new
    }

    /// Addresses executed by the last run, new or not
    #[must_use]
    pub fn last_run_coverage(&self) -> &GvaSet {
        &self.last_run
    }

    /// Every address executed in this session
    #[must_use]
    pub fn aggregated_coverage(&self) -> &GvaSet {
        &self.aggregated
    }

    /// Returns `true` if the last run discovered new coverage
    #[must_use]
    pub fn has_new(&self) -> bool {
        !self.new.is_empty()
    }

    /// Number of new addresses discovered over the session, revocations included
    #[must_use]
    pub fn new_count(&self) -> u64 {
        self.new_count
    }

    /// Drop the coverage contributed by the last run from the aggregated coverage.
    /// Calling this again without an intervening run is a no-op.
    pub fn revoke_last_new_coverage(&mut self) {
        for addr in self.new.drain() {
            self.aggregated.remove(&addr);
        }

        self.last_run.clear();
    }

    /// Reset the per-run state at the start of a run
    pub fn start_run(&mut self) {
        self.last_run.clear();
        self.new.clear();
    }

    /// Number of unique addresses in the aggregated coverage
    #[must_use]
    pub fn len(&self) -> usize {
        self.aggregated.len()
    }

    /// Returns `true` if nothing was executed yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aggregated.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_hit_reports_new_addresses() {
        let mut cov = CoverageTracker::new();
        assert!(cov.record_hit(VirtAddr(0x1000)));
        assert!(!cov.record_hit(VirtAddr(0x1000)));
        assert!(cov.record_hit(VirtAddr(0x1004)));
        assert_eq!(cov.len(), 2);
        assert_eq!(cov.new_count(), 2);
        assert_eq!(cov.last_run_coverage().len(), 2);
    }

    #[test]
    fn last_new_coverage_is_per_run() {
        let mut cov = CoverageTracker::new();
        cov.start_run();
        cov.record_hit(VirtAddr(0x1000));
        cov.record_hit(VirtAddr(0x1004));

        cov.start_run();
        cov.record_hit(VirtAddr(0x1000));
        cov.record_hit(VirtAddr(0x1008));

        let new: Vec<_> = cov.last_new_coverage().iter().copied().collect();
        assert_eq!(new, vec![VirtAddr(0x1008)]);
        assert_eq!(cov.last_run_coverage().len(), 2);
        assert!(cov.has_new());
    }

    #[test]
    fn revoke_removes_only_last_run() {
        let mut cov = CoverageTracker::new();
        cov.start_run();
        cov.record_hit(VirtAddr(0x1000));

        cov.start_run();
        cov.record_hit(VirtAddr(0x1000));
        cov.record_hit(VirtAddr(0x2000));
        cov.record_hit(VirtAddr(0x3000));

        cov.revoke_last_new_coverage();
        assert_eq!(cov.len(), 1);
        assert!(cov.aggregated_coverage().contains(&VirtAddr(0x1000)));
        assert!(!cov.has_new());

        // Second revoke does nothing
        cov.revoke_last_new_coverage();
        assert_eq!(cov.len(), 1);

        // Revoked addresses count as new again
        cov.start_run();
        assert!(cov.record_hit(VirtAddr(0x2000)));
    }
}
