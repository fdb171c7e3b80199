//! Eviction planning
//!
//! [`EvictionManager::plan`] is a pure function of an index snapshot and
//! the current time. Callers apply the plan while holding the cache's
//! write lock, so the size bound holds as soon as `put` returns.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use stow_core::Digest;

use crate::index::{IndexEntry, Slot};

#[derive(Debug, Clone, Copy)]
pub struct EvictionManager {
    max_size_bytes: u64,
}

/// Slots to remove, in removal order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionPlan {
    pub victims: Vec<Slot>,
    /// Blob bytes freed by applying the plan
    pub reclaimed_bytes: u64,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }

    fn push(&mut self, slot: Slot, chosen: &mut HashSet<Slot>) -> bool {
        if chosen.insert(slot.clone()) {
            self.victims.push(slot);
            true
        } else {
            false
        }
    }
}

impl EvictionManager {
    pub fn new(max_size_bytes: u64) -> Self {
        Self { max_size_bytes }
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Choose victims so live blob bytes fit within the budget
    ///
    /// 1. Every expired slot.
    /// 2. Live blobs other than `protect`, least recently accessed first
    ///    (earliest expiry breaks ties), until within budget.
    /// 3. Manifest records whose blob was chosen, and blobs no surviving
    ///    record points at.
    pub fn plan(&self, entries: &[IndexEntry], now: DateTime<Utc>, protect: Option<&Digest>) -> EvictionPlan {
        let mut plan = EvictionPlan::default();
        let mut chosen = HashSet::new();

        for entry in entries.iter().filter(|e| e.is_expired_at(now)) {
            if plan.push(entry.slot.clone(), &mut chosen) {
                plan.reclaimed_bytes += entry.size;
            }
        }

        let mut live_blobs: Vec<&IndexEntry> = entries
            .iter()
            .filter(|e| e.is_blob() && !e.is_expired_at(now))
            .collect();
        let mut live_size: u64 = live_blobs.iter().map(|e| e.size).sum();

        if live_size > self.max_size_bytes {
            live_blobs.sort_by(|a, b| {
                a.last_accessed
                    .cmp(&b.last_accessed)
                    .then(a.expires_at.cmp(&b.expires_at))
            });

            for entry in live_blobs {
                if live_size <= self.max_size_bytes {
                    break;
                }
                if matches!((&entry.slot, protect), (Slot::Blob(d), Some(p)) if d == p) {
                    continue;
                }
                if plan.push(entry.slot.clone(), &mut chosen) {
                    live_size -= entry.size;
                    plan.reclaimed_bytes += entry.size;
                }
            }
        }

        // Records follow their blobs out
        for entry in entries {
            if let Some(blob) = &entry.blob {
                if chosen.contains(&Slot::Blob(blob.clone())) {
                    plan.push(entry.slot.clone(), &mut chosen);
                }
            }
        }

        // Blobs nothing points at any more
        let referenced: HashSet<&Digest> = entries
            .iter()
            .filter(|e| !chosen.contains(&e.slot))
            .filter_map(|e| e.blob.as_ref())
            .collect();
        for entry in entries {
            if let Slot::Blob(digest) = &entry.slot {
                let protected = protect == Some(digest);
                if !protected && !referenced.contains(digest) && plan.push(entry.slot.clone(), &mut chosen) {
                    plan.reclaimed_bytes += entry.size;
                }
            }
        }

        plan
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::entry::CacheKey;
    use chrono::Duration;
    use proptest::prelude::*;
    use proptest::test_runner::Config as ProptestConfig;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        /// Applying a plan leaves live blob bytes within budget whenever
        /// the protected blob fits on its own
        #[test]
        fn plan_restores_budget(
            blobs in prop::collection::vec((1u64..500, 0i64..600, -60i64..600), 1..20),
            max in 500u64..2000,
        ) {
            let now = Utc::now();
            let mut entries = Vec::new();
            for (n, (size, accessed_ago, expires_in)) in blobs.iter().enumerate() {
                let digest = Digest::of(format!("blob-{}", n).as_bytes());
                let accessed = now - Duration::seconds(*accessed_ago);
                let expires = now + Duration::seconds(*expires_in);
                entries.push(IndexEntry::blob(digest.clone(), *size, accessed, expires));
                let key = CacheKey::pull(&format!("registry.test/app:v{}", n).parse().unwrap());
                entries.push(IndexEntry::manifest(key, digest, accessed, expires));
            }
            let protect = Digest::of(b"blob-0");

            let plan = EvictionManager::new(max).plan(&entries, now, Some(&protect));

            let remaining: u64 = entries
                .iter()
                .filter(|e| e.is_blob() && !e.is_expired_at(now) && !plan.victims.contains(&e.slot))
                .map(|e| e.size)
                .sum();
            prop_assert!(remaining <= max);
            prop_assert!(!plan.victims.contains(&Slot::Blob(protect)) || entries[0].is_expired_at(now));

            // No surviving record points at an evicted blob
            for entry in entries.iter().filter(|e| !plan.victims.contains(&e.slot)) {
                if let Some(blob) = &entry.blob {
                    prop_assert!(!plan.victims.contains(&Slot::Blob(blob.clone())));
                }
            }
        }
    }
}
