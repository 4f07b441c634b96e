//! Agreement tracking — per (peer, archival unit) history of vote
//! agreement, consumed when ranking repair sources and gating
//! trust-weighted acceptance.
//!
//! Records are immutable values replaced on update. Signals carry their own
//! timestamps so replayed or out-of-order history loads cannot regress a
//! record: a signal older than the last applied signal of its kind is
//! ignored, and the highest-ever percentage only ratchets upward.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use vigil_core::identity::PeerIdentity;

use crate::PeerStateStore;

/// Agreement history with one peer on one archival unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgreementRecord {
    /// Most recent signalled agreement percentage, in [0.0, 1.0].
    pub percent: f32,
    /// When `percent` was signalled (ms since the epoch).
    pub percent_time: u64,
    /// Highest percentage ever signalled. Monotonically non-decreasing.
    pub highest_percent: f32,
    pub highest_time: u64,
    /// Last agreement signal applied. Zero if never.
    pub last_agree: u64,
    /// Last disagreement signal applied. Zero if never.
    pub last_disagree: u64,
}

impl AgreementRecord {
    fn new() -> Self {
        AgreementRecord {
            percent: -1.0,
            percent_time: 0,
            highest_percent: -1.0,
            highest_time: 0,
            last_agree: 0,
            last_disagree: 0,
        }
    }

    fn with_agreement(self, percent: f32, at: u64) -> Self {
        let mut rec = self;
        rec.percent = percent;
        rec.percent_time = at;
        rec.last_agree = at;
        if percent > rec.highest_percent {
            rec.highest_percent = percent;
            rec.highest_time = at;
        }
        rec
    }

    fn with_disagreement(self, percent: f32, at: u64) -> Self {
        let mut rec = self;
        rec.percent = percent;
        rec.percent_time = at;
        rec.last_disagree = at;
        rec
    }

    /// True when the peer has disagreed since it last agreed.
    pub fn has_outstanding_disagreement(&self) -> bool {
        self.last_disagree > self.last_agree
    }
}

/// Per-unit agreement maps, keyed by archival unit id, then peer key.
pub struct AgreementTracker {
    units: DashMap<String, HashMap<String, AgreementRecord>>,
}

impl AgreementTracker {
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
        }
    }

    /// Record an agreement of `percent` with `peer` on `unit` signalled at
    /// `at` (ms since the epoch). Ignored if not newer than the last
    /// applied agreement.
    pub fn signal_agreement(&self, peer: &PeerIdentity, unit: &str, percent: f32, at: u64) {
        let mut map = self.units.entry(unit.to_string()).or_default();
        let rec = map
            .entry(peer.key().to_string())
            .or_insert_with(AgreementRecord::new);
        if at <= rec.last_agree {
            tracing::debug!(peer = %peer, unit, at, "ignoring stale agreement signal");
            return;
        }
        *rec = rec.with_agreement(percent, at);
    }

    /// Record a disagreement. Same staleness rule, against the last
    /// applied disagreement.
    pub fn signal_disagreement(&self, peer: &PeerIdentity, unit: &str, percent: f32, at: u64) {
        let mut map = self.units.entry(unit.to_string()).or_default();
        let rec = map
            .entry(peer.key().to_string())
            .or_insert_with(AgreementRecord::new);
        if at <= rec.last_disagree {
            tracing::debug!(peer = %peer, unit, at, "ignoring stale disagreement signal");
            return;
        }
        *rec = rec.with_disagreement(percent, at);
    }

    pub fn record(&self, peer: &PeerIdentity, unit: &str) -> Option<AgreementRecord> {
        self.units.get(unit)?.get(peer.key()).copied()
    }

    /// Has the peer ever reached `threshold` agreement on this unit?
    /// Compares the highest-ever percentage, not the most recent.
    pub fn has_agreed(&self, peer: &PeerIdentity, unit: &str, threshold: f32) -> bool {
        self.record(peer, unit)
            .map(|rec| rec.highest_percent >= threshold)
            .unwrap_or(false)
    }

    /// Peers worth asking for a repair of `unit`: everyone who has ever
    /// agreed, with peers whose last disagreement postdates their last
    /// agreement ranked after all others. Within each group, strongest and
    /// most recent agreement first.
    pub fn repair_sources(&self, unit: &str) -> Vec<String> {
        let Some(map) = self.units.get(unit) else {
            return Vec::new();
        };
        let mut sources: Vec<(String, AgreementRecord)> = map
            .iter()
            .filter(|(_, rec)| rec.last_agree > 0)
            .map(|(k, rec)| (k.clone(), *rec))
            .collect();
        sources.sort_by(|(_, a), (_, b)| {
            a.has_outstanding_disagreement()
                .cmp(&b.has_outstanding_disagreement())
                .then(
                    b.highest_percent
                        .partial_cmp(&a.highest_percent)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(b.last_agree.cmp(&a.last_agree))
        });
        sources.into_iter().map(|(k, _)| k).collect()
    }

    /// Archival units with recorded history.
    pub fn unit_ids(&self) -> Vec<String> {
        self.units.iter().map(|e| e.key().clone()).collect()
    }

    // ── Persistence ───────────────────────────────────────────────────────

    /// Flush one unit's map through the persistence collaborator.
    pub fn store_unit(&self, unit: &str, store: &dyn PeerStateStore) -> std::io::Result<()> {
        let map = self
            .units
            .get(unit)
            .map(|m| m.clone())
            .unwrap_or_default();
        let blob = serde_json::to_vec(&map)?;
        store.store(&format!("agreement:{unit}"), &blob)
    }

    /// Load one unit's map, replaying stored records through the signal
    /// path so staleness rules keep holding.
    pub fn load_unit(&self, unit: &str, store: &dyn PeerStateStore) -> std::io::Result<()> {
        let Some(blob) = store.load(&format!("agreement:{unit}"))? else {
            return Ok(());
        };
        let map: HashMap<String, AgreementRecord> = serde_json::from_slice(&blob)?;
        let mut current = self.units.entry(unit.to_string()).or_default();
        for (key, rec) in map {
            current.entry(key).or_insert(rec);
        }
        Ok(())
    }
}

impl Default for AgreementTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::identity::IdentityRegistry;

    const UNIT: &str = "unit:journal-2024";

    fn registry() -> IdentityRegistry {
        IdentityRegistry::new("TCP:[127.0.0.1]:9729").unwrap()
    }

    #[test]
    fn first_signal_creates_record() {
        let reg = registry();
        let peer = reg.find_or_create("10.4.0.2").unwrap();
        let tracker = AgreementTracker::new();
        tracker.signal_agreement(&peer, UNIT, 0.8, 100);
        let rec = tracker.record(&peer, UNIT).unwrap();
        assert_eq!(rec.percent, 0.8);
        assert_eq!(rec.highest_percent, 0.8);
        assert_eq!(rec.last_agree, 100);
    }

    #[test]
    fn highest_percent_is_monotone() {
        let reg = registry();
        let peer = reg.find_or_create("10.4.0.2").unwrap();
        let tracker = AgreementTracker::new();
        tracker.signal_agreement(&peer, UNIT, 0.9, 100);
        tracker.signal_agreement(&peer, UNIT, 0.5, 200);
        let rec = tracker.record(&peer, UNIT).unwrap();
        assert_eq!(rec.percent, 0.5, "current tracks the latest signal");
        assert_eq!(rec.highest_percent, 0.9, "highest never decreases");
        assert_eq!(rec.highest_time, 100);
    }

    #[test]
    fn stale_signals_are_ignored() {
        let reg = registry();
        let peer = reg.find_or_create("10.4.0.2").unwrap();
        let tracker = AgreementTracker::new();
        tracker.signal_agreement(&peer, UNIT, 0.7, 200);
        tracker.signal_agreement(&peer, UNIT, 1.0, 150);
        let rec = tracker.record(&peer, UNIT).unwrap();
        assert_eq!(rec.percent, 0.7);
        assert_eq!(rec.highest_percent, 0.7);
        assert_eq!(rec.last_agree, 200);
    }

    #[test]
    fn has_agreed_uses_highest_ever() {
        let reg = registry();
        let peer = reg.find_or_create("10.4.0.2").unwrap();
        let tracker = AgreementTracker::new();
        tracker.signal_agreement(&peer, UNIT, 0.95, 100);
        tracker.signal_agreement(&peer, UNIT, 0.10, 200);
        assert!(tracker.has_agreed(&peer, UNIT, 0.9));
        assert!(!tracker.has_agreed(&peer, UNIT, 0.99));
    }

    #[test]
    fn has_agreed_false_for_unknown_peer() {
        let reg = registry();
        let peer = reg.find_or_create("10.4.0.2").unwrap();
        let tracker = AgreementTracker::new();
        assert!(!tracker.has_agreed(&peer, UNIT, 0.5));
    }

    #[test]
    fn repair_sources_rank_clean_agreers_first() {
        let reg = registry();
        let clean = reg.find_or_create("10.4.0.2").unwrap();
        let soured = reg.find_or_create("10.4.0.3").unwrap();
        let never = reg.find_or_create("10.4.0.4").unwrap();
        let tracker = AgreementTracker::new();

        tracker.signal_agreement(&clean, UNIT, 0.9, 100);
        tracker.signal_agreement(&soured, UNIT, 1.0, 100);
        tracker.signal_disagreement(&soured, UNIT, 0.2, 300);
        tracker.signal_disagreement(&never, UNIT, 0.1, 100);

        let sources = tracker.repair_sources(UNIT);
        assert_eq!(sources, vec!["10.4.0.2".to_string(), "10.4.0.3".to_string()]);
    }

    #[test]
    fn disagreement_then_agreement_restores_rank() {
        let reg = registry();
        let a = reg.find_or_create("10.4.0.2").unwrap();
        let b = reg.find_or_create("10.4.0.3").unwrap();
        let tracker = AgreementTracker::new();

        tracker.signal_agreement(&a, UNIT, 0.5, 100);
        tracker.signal_agreement(&b, UNIT, 0.9, 100);
        tracker.signal_disagreement(&b, UNIT, 0.0, 200);
        tracker.signal_agreement(&b, UNIT, 0.9, 300);

        let sources = tracker.repair_sources(UNIT);
        assert_eq!(sources[0], "10.4.0.3", "recovered peer outranks on percent");
    }

    struct MemStore(std::sync::Mutex<HashMap<String, Vec<u8>>>);

    impl PeerStateStore for MemStore {
        fn load(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }
        fn store(&self, key: &str, blob: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().insert(key.to_string(), blob.to_vec());
            Ok(())
        }
    }

    #[test]
    fn unit_maps_round_trip_through_store() {
        let reg = registry();
        let peer = reg.find_or_create("10.4.0.2").unwrap();
        let tracker = AgreementTracker::new();
        tracker.signal_agreement(&peer, UNIT, 0.9, 100);

        let store = MemStore(std::sync::Mutex::new(HashMap::new()));
        tracker.store_unit(UNIT, &store).unwrap();

        let reloaded = AgreementTracker::new();
        reloaded.load_unit(UNIT, &store).unwrap();
        assert!(reloaded.has_agreed(&peer, UNIT, 0.9));
    }
}
