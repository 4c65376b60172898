use std::sync::atomic::{AtomicU64, Ordering};

use super::{StatisticValue, StatisticsProvider};
use crate::statistics_list;

/// Counters updated by the fault handler and by drains.
#[derive(Debug, Default)]
pub struct GuardStatistics {
    faults: AtomicU64,
    read_faults: AtomicU64,
    protection_failures: AtomicU64,
    drains: AtomicU64,
    ranges_reported: AtomicU64,
    bytes_reported: AtomicU64,
    bytes_synchronized: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStatisticsSnapshot {
    pub faults: u64,
    pub read_faults: u64,
    pub protection_failures: u64,
    pub drains: u64,
    pub ranges_reported: u64,
    pub bytes_reported: u64,
    pub bytes_synchronized: u64,
}

impl GuardStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_fault(&self, is_write: bool) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        if !is_write {
            self.read_faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_protection_failure(&self) {
        self.protection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drain(&self) {
        self.drains.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_range(&self, len: usize, synchronized: bool) {
        self.ranges_reported.fetch_add(1, Ordering::Relaxed);
        self.bytes_reported.fetch_add(len as u64, Ordering::Relaxed);
        if synchronized {
            self.bytes_synchronized
                .fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> GuardStatisticsSnapshot {
        GuardStatisticsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            read_faults: self.read_faults.load(Ordering::Relaxed),
            protection_failures: self.protection_failures.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            ranges_reported: self.ranges_reported.load(Ordering::Relaxed),
            bytes_reported: self.bytes_reported.load(Ordering::Relaxed),
            bytes_synchronized: self.bytes_synchronized.load(Ordering::Relaxed),
        }
    }
}

impl StatisticsProvider for GuardStatistics {
    fn class_name(&self) -> &'static str {
        "page_guard"
    }

    fn statistics(&self) -> Box<[(String, Box<dyn StatisticValue>)]> {
        let s = self.snapshot();

        statistics_list!(
            faults = s.faults,
            read_faults = s.read_faults,
            protection_failures = s.protection_failures,
            drains = s.drains,
            ranges_reported = s.ranges_reported,
            bytes_reported = s.bytes_reported,
            bytes_synchronized = s.bytes_synchronized
        )
    }
}
