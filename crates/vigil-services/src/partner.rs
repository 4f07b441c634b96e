//! Partner list — peers unicast-supplemented to patch over imperfect
//! multicast reachability.
//!
//! Membership is probabilistic and aging: qualifying receipts admit a peer
//! with a configured probability, peers recently proven multicast-reachable
//! are suppressed, and the least-recently-contacted entry is evicted when
//! the list overflows (throttled so churn cannot thrash the list). An empty
//! list reseeds from the configured defaults.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use vigil_core::config::PartnerConfig;

struct Inner {
    /// peer key → last contact.
    partners: HashMap<String, Instant>,
    /// peer key → last time a multicast packet arrived from it.
    recent_multicast: HashMap<String, Instant>,
    last_eviction: Option<Instant>,
}

pub struct PartnerList {
    inner: Mutex<Inner>,
    cfg: PartnerConfig,
}

impl PartnerList {
    pub fn new(cfg: PartnerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                partners: HashMap::new(),
                recent_multicast: HashMap::new(),
                last_eviction: None,
            }),
            cfg,
        }
    }

    /// Admit `key` with the given probability. Peers seen via multicast
    /// within the suppression window are never admitted — unicasting to
    /// them would only duplicate traffic.
    pub fn add_partner(&self, key: &str, probability: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(seen) = inner.recent_multicast.get(key) {
            if seen.elapsed() < Duration::from_millis(self.cfg.recent_multicast_ms) {
                tracing::trace!(peer = key, "not adding partner, recently multicast-reachable");
                return;
            }
        }
        if probability < 1.0 && !rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0)) {
            return;
        }
        let existed = inner.partners.insert(key.to_string(), Instant::now()).is_some();
        if !existed {
            tracing::debug!(peer = key, count = inner.partners.len(), "added partner");
        }
        self.maybe_evict(&mut inner);
    }

    /// Record a multicast receipt from `key`: the peer is demonstrably
    /// multicast-reachable, so it leaves the partner list.
    pub fn multicast_seen(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.recent_multicast.insert(key.to_string(), Instant::now());
        if inner.partners.remove(key).is_some() {
            tracing::debug!(peer = key, "removed partner, now multicast-reachable");
        }
        self.reseed_if_empty(&mut inner);
    }

    /// Drop a partner (send failure or explicit removal).
    pub fn remove_partner(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.partners.remove(key).is_some() {
            tracing::debug!(peer = key, "removed partner");
        }
        self.reseed_if_empty(&mut inner);
    }

    pub fn is_partner(&self, key: &str) -> bool {
        self.inner.lock().unwrap().partners.contains_key(key)
    }

    /// Snapshot of current partner keys.
    pub fn partners(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        self.reseed_if_empty(&mut inner);
        inner.partners.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().partners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed from the configured default list, unconditionally. Used by the
    /// router when no non-partner traffic has arrived for a long time.
    pub fn add_from_defaults(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.seed_defaults(&mut inner);
    }

    fn reseed_if_empty(&self, inner: &mut Inner) {
        if inner.partners.is_empty() && !self.cfg.default_partners.is_empty() {
            tracing::info!("partner list empty, reseeding from defaults");
            self.seed_defaults(inner);
        }
    }

    fn seed_defaults(&self, inner: &mut Inner) {
        for key in &self.cfg.default_partners {
            inner.partners.entry(key.clone()).or_insert_with(Instant::now);
        }
    }

    /// Evict the least-recently-contacted entry when over capacity, at most
    /// once per `min_eviction_interval`. Until the throttle allows another
    /// eviction the list may transiently exceed the maximum.
    fn maybe_evict(&self, inner: &mut Inner) {
        if inner.partners.len() <= self.cfg.max_partners {
            return;
        }
        if let Some(last) = inner.last_eviction {
            if last.elapsed() < Duration::from_millis(self.cfg.min_eviction_interval_ms) {
                return;
            }
        }
        let oldest = inner
            .partners
            .iter()
            .min_by_key(|(_, t)| **t)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            inner.partners.remove(&key);
            inner.last_eviction = Some(Instant::now());
            tracing::debug!(peer = %key, "evicted least-recently-contacted partner");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PartnerConfig {
        PartnerConfig {
            max_partners: 3,
            recent_multicast_ms: 60_000,
            min_eviction_interval_ms: 0,
            default_partners: Vec::new(),
        }
    }

    #[test]
    fn probability_one_always_admits() {
        let list = PartnerList::new(cfg());
        list.add_partner("10.4.0.1", 1.0);
        assert!(list.is_partner("10.4.0.1"));
    }

    #[test]
    fn probability_zero_never_admits() {
        let list = PartnerList::new(cfg());
        for _ in 0..50 {
            list.add_partner("10.4.0.1", 0.0);
        }
        assert!(!list.is_partner("10.4.0.1"));
    }

    #[test]
    fn recent_multicast_suppresses_admission() {
        let list = PartnerList::new(cfg());
        list.multicast_seen("10.4.0.1");
        list.add_partner("10.4.0.1", 1.0);
        assert!(!list.is_partner("10.4.0.1"));
    }

    #[test]
    fn stale_multicast_sighting_does_not_suppress() {
        let mut c = cfg();
        c.recent_multicast_ms = 0;
        let list = PartnerList::new(c);
        list.multicast_seen("10.4.0.1");
        list.add_partner("10.4.0.1", 1.0);
        assert!(list.is_partner("10.4.0.1"));
    }

    #[test]
    fn multicast_sighting_removes_existing_partner() {
        let list = PartnerList::new(cfg());
        list.add_partner("10.4.0.1", 1.0);
        list.multicast_seen("10.4.0.1");
        assert!(!list.is_partner("10.4.0.1"));
    }

    #[test]
    fn overflow_evicts_least_recently_contacted() {
        let list = PartnerList::new(cfg());
        list.add_partner("10.4.0.1", 1.0);
        std::thread::sleep(Duration::from_millis(5));
        list.add_partner("10.4.0.2", 1.0);
        list.add_partner("10.4.0.3", 1.0);
        list.add_partner("10.4.0.4", 1.0);
        assert_eq!(list.len(), 3);
        assert!(!list.is_partner("10.4.0.1"), "oldest contact should be evicted");
    }

    #[test]
    fn eviction_is_throttled() {
        let mut c = cfg();
        c.min_eviction_interval_ms = 60_000;
        let list = PartnerList::new(c);
        for i in 1..=6 {
            list.add_partner(&format!("10.4.0.{i}"), 1.0);
            std::thread::sleep(Duration::from_millis(2));
        }
        // one eviction allowed, after which the list may exceed max
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn empty_list_reseeds_from_defaults() {
        let mut c = cfg();
        c.default_partners = vec!["10.9.0.1".to_string(), "10.9.0.2".to_string()];
        let list = PartnerList::new(c);
        list.add_partner("10.4.0.1", 1.0);
        list.remove_partner("10.4.0.1");
        let partners = list.partners();
        assert!(partners.contains(&"10.9.0.1".to_string()));
        assert!(partners.contains(&"10.9.0.2".to_string()));
    }
}
