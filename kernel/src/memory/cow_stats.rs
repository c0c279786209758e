//! Copy-on-Write statistics
//!
//! Counters are updated by the fork protocol, trap delivery and the COW
//! fault resolver. Each process manager owns one set, so independent
//! simulations never mix their numbers.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Live counters.
#[derive(Debug, Default)]
pub struct CowCounters {
    /// Completed forks
    pub forks: AtomicU64,
    /// Pages mapped into a child verbatim (Shared marker)
    pub pages_shared: AtomicU64,
    /// Pages converted to (or kept as) copy-on-write
    pub pages_cow: AtomicU64,
    /// Read-only pages mapped into a child unchanged
    pub pages_readonly: AtomicU64,
    /// Page faults delivered to a user upcall
    pub total_faults: AtomicU64,
    /// COW faults resolved
    pub faults_resolved: AtomicU64,
    /// Pages that were copied into a fresh frame
    pub pages_copied: AtomicU64,
}

impl CowCounters {
    pub const fn new() -> Self {
        Self {
            forks: AtomicU64::new(0),
            pages_shared: AtomicU64::new(0),
            pages_cow: AtomicU64::new(0),
            pages_readonly: AtomicU64::new(0),
            total_faults: AtomicU64::new(0),
            faults_resolved: AtomicU64::new(0),
            pages_copied: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current CoW statistics
    pub fn snapshot(&self) -> CowStats {
        CowStats {
            forks: self.forks.load(Ordering::Relaxed),
            pages_shared: self.pages_shared.load(Ordering::Relaxed),
            pages_cow: self.pages_cow.load(Ordering::Relaxed),
            pages_readonly: self.pages_readonly.load(Ordering::Relaxed),
            total_faults: self.total_faults.load(Ordering::Relaxed),
            faults_resolved: self.faults_resolved.load(Ordering::Relaxed),
            pages_copied: self.pages_copied.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.forks,
            &self.pages_shared,
            &self.pages_cow,
            &self.pages_readonly,
            &self.total_faults,
            &self.faults_resolved,
            &self.pages_copied,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// CoW statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CowStats {
    pub forks: u64,
    pub pages_shared: u64,
    pub pages_cow: u64,
    pub pages_readonly: u64,
    pub total_faults: u64,
    pub faults_resolved: u64,
    pub pages_copied: u64,
}

impl fmt::Display for CowStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[COW STATS] forks={} shared={} cow={} readonly={} faults={} resolved={} copied={}",
            self.forks,
            self.pages_shared,
            self.pages_cow,
            self.pages_readonly,
            self.total_faults,
            self.faults_resolved,
            self.pages_copied
        )
    }
}
