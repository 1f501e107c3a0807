//! Injection counters, global and per-object. Counters are plain atomics
//! bumped on the dispatch path; snapshots are serde-serializable so test
//! harnesses can export and assert on them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Internal atomic counters for the whole engine.
#[derive(Debug, Default)]
pub(crate) struct GlobalCounters {
    pub errors_injected: AtomicU64,
    pub media_errors_injected: AtomicU64,
    pub requests_delayed: AtomicU64,
    pub requests_dropped: AtomicU64,
    pub requests_failed: AtomicU64,
    pub corruptions_aborted: AtomicU64,
    pub passed_through: AtomicU64,
}

impl GlobalCounters {
    pub fn reset(&self) {
        self.errors_injected.store(0, Ordering::Relaxed);
        self.media_errors_injected.store(0, Ordering::Relaxed);
        self.requests_delayed.store(0, Ordering::Relaxed);
        self.requests_dropped.store(0, Ordering::Relaxed);
        self.requests_failed.store(0, Ordering::Relaxed);
        self.corruptions_aborted.store(0, Ordering::Relaxed);
        self.passed_through.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of the engine-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EngineStats {
    pub errors_injected: u64,
    pub media_errors_injected: u64,
    pub requests_delayed: u64,
    pub requests_dropped: u64,
    pub requests_failed: u64,
    pub corruptions_aborted: u64,
    pub passed_through: u64,
    /// Currently registered objects.
    pub objects: usize,
    /// Currently enabled objects.
    pub objects_enabled: usize,
    /// Records in the active table, zero when none is loaded.
    pub records: usize,
}

impl GlobalCounters {
    pub fn snapshot(&self, objects: usize, objects_enabled: usize, records: usize) -> EngineStats {
        EngineStats {
            errors_injected: self.errors_injected.load(Ordering::Relaxed),
            media_errors_injected: self.media_errors_injected.load(Ordering::Relaxed),
            requests_delayed: self.requests_delayed.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            corruptions_aborted: self.corruptions_aborted.load(Ordering::Relaxed),
            passed_through: self.passed_through.load(Ordering::Relaxed),
            objects,
            objects_enabled,
            records,
        }
    }
}

/// Internal atomic counters for one injection object.
#[derive(Debug, Default)]
pub(crate) struct ObjectCounters {
    pub errors_injected: AtomicU64,
    pub read_media_errors_injected: AtomicU64,
    pub write_remaps: AtomicU64,
}

/// Snapshot of one object's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectStats {
    pub errors_injected: u64,
    pub read_media_errors_injected: u64,
    pub write_remaps: u64,
    /// Operations currently between pre-send and completion.
    pub in_progress: u32,
}

impl ObjectCounters {
    pub fn snapshot(&self, in_progress: u32) -> ObjectStats {
        ObjectStats {
            errors_injected: self.errors_injected.load(Ordering::Relaxed),
            read_media_errors_injected: self.read_media_errors_injected.load(Ordering::Relaxed),
            write_remaps: self.write_remaps.load(Ordering::Relaxed),
            in_progress,
        }
    }
}
