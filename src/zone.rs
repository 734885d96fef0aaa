//! C9: zone isolation, zone/global connection limits, and named timeout
//! policies (`spec.md` §4.9, §3 "Zone limit").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::config::ZoneLimit;

/// A snapshot of one zone's limit and live usage, exposed for introspection
/// (`SPEC_FULL.md` ambient "zone-limit-get" supplemented feature).
#[derive(Debug, Clone, Copy)]
pub struct ZoneLimitSnapshot {
    pub zone: u16,
    pub limit: ZoneLimit,
    pub current_count: u32,
    pub generation: u64,
}

struct ZoneLimitRecord {
    limit: ZoneLimit,
    generation: u64,
}

/// `spec.md` §4.9: a zone limit may be unlimited, a specific count, or
/// delegate to the tracker-wide default. The generation counter
/// disambiguates a connection admitted under a since-deleted-and-recreated
/// limit record (`spec.md` §3 invariant 6).
pub struct ZoneLimits {
    records: RwLock<HashMap<u16, ZoneLimitRecord>>,
    default_limit: RwLock<Option<ZoneLimit>>,
    next_generation: AtomicU64,
}

impl ZoneLimits {
    pub fn new(default_limit: Option<ZoneLimit>) -> Self {
        ZoneLimits {
            records: RwLock::new(HashMap::new()),
            default_limit: RwLock::new(default_limit),
            next_generation: AtomicU64::new(1),
        }
    }

    fn bump_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolves the limit actually in force for `zone` right now: a
    /// per-zone record if one exists, else the tracker-wide default, else
    /// unlimited.
    pub fn effective_limit(&self, zone: u16) -> ZoneLimit {
        let records = self.records.read().unwrap();
        if let Some(record) = records.get(&zone) {
            return record.limit;
        }
        drop(records);
        self.default_limit.read().unwrap().unwrap_or(ZoneLimit::Unlimited)
    }

    /// Current admission generation for `zone` — callers stamp this onto a
    /// newly admitted connection's `admit_zone_generation`.
    pub fn current_generation(&self, zone: u16) -> u64 {
        self.records
            .read()
            .unwrap()
            .get(&zone)
            .map(|r| r.generation)
            .unwrap_or(0)
    }

    pub fn set_limit(&self, zone: u16, limit: ZoneLimit) -> u64 {
        let mut records = self.records.write().unwrap();
        let generation = self.bump_generation();
        records.insert(zone, ZoneLimitRecord { limit, generation });
        generation
    }

    /// `zone-limit-del`: removing an explicit limit demotes the zone back to
    /// the tracker-wide default unless that default is itself unlimited
    /// (`spec.md` §3 "Zone limit" lifecycle).
    pub fn delete_limit(&self, zone: u16) {
        self.records.write().unwrap().remove(&zone);
    }

    pub fn set_default_limit(&self, limit: Option<ZoneLimit>) {
        *self.default_limit.write().unwrap() = limit;
    }

    pub fn snapshot(&self, zone: u16, current_count: u32) -> ZoneLimitSnapshot {
        ZoneLimitSnapshot {
            zone,
            limit: self.effective_limit(zone),
            current_count,
            generation: self.current_generation(zone),
        }
    }

    /// Admission check: `spec.md` §8 invariant 6 — creation above the limit
    /// fails with `LimitExhausted`.
    pub fn admits(&self, zone: u16, live_count: u32) -> bool {
        match self.effective_limit(zone) {
            ZoneLimit::Unlimited => true,
            ZoneLimit::Count(limit) => live_count < limit,
        }
    }
}

/// Global cap across all zones, tracked as a simple atomic counter
/// alongside the per-zone limits above.
pub struct GlobalLimit {
    count: AtomicU32,
}

impl Default for GlobalLimit {
    fn default() -> Self {
        GlobalLimit {
            count: AtomicU32::new(0),
        }
    }
}

impl GlobalLimit {
    pub fn admits(&self, max_conns: u32) -> bool {
        self.count.load(Ordering::Relaxed) < max_conns
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_without_explicit_limit_falls_back_to_default() {
        let limits = ZoneLimits::new(Some(ZoneLimit::Count(2)));
        assert_eq!(limits.effective_limit(7), ZoneLimit::Count(2));
        assert!(limits.admits(7, 1));
        assert!(!limits.admits(7, 2));
    }

    #[test]
    fn explicit_zone_limit_overrides_default() {
        let limits = ZoneLimits::new(Some(ZoneLimit::Count(2)));
        limits.set_limit(7, ZoneLimit::Unlimited);
        assert!(limits.admits(7, 1_000_000));
    }

    #[test]
    fn generation_changes_on_redefinition() {
        let limits = ZoneLimits::new(None);
        let g1 = limits.set_limit(7, ZoneLimit::Count(5));
        limits.delete_limit(7);
        let g2 = limits.set_limit(7, ZoneLimit::Count(5));
        assert_ne!(g1, g2);
    }

    #[test]
    fn global_limit_admits_under_cap() {
        let global = GlobalLimit::default();
        global.increment();
        assert!(global.admits(2));
        global.increment();
        assert!(!global.admits(2));
    }
}
