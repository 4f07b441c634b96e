//! Reputation tracking — per-peer trust scalar adjusted by poll events.
//!
//! Deltas are configured per event kind, scaled by a random factor in
//! [0, 1) so repeated identical events do not move scores in lockstep
//! across the network, then clamped twice: to the per-event magnitude cap
//! and into [0, MAX_REPUTATION]. The local identity's score never moves.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use vigil_core::config::ReputationConfig;
use vigil_core::identity::PeerIdentity;

use crate::PeerStateStore;

/// Upper bound of the reputation range.
pub const MAX_REPUTATION: i32 = 1000;

/// Score assigned to a peer on first sight.
pub const INITIAL_REPUTATION: i32 = 500;

/// Blob key used with the persistence collaborator.
const STORE_KEY: &str = "reputation";

/// Poll-related events that move a peer's reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    AgreeVote,
    DisagreeVote,
    CallInternal,
    SpoofDetected,
    ReplayDetected,
    AttackDetected,
    VoteVerified,
    VoteNotVerified,
    VoteDisowned,
}

fn delta_for(cfg: &ReputationConfig, event: ReputationEvent) -> i32 {
    match event {
        ReputationEvent::AgreeVote => cfg.agree_vote,
        ReputationEvent::DisagreeVote => cfg.disagree_vote,
        ReputationEvent::CallInternal => cfg.call_internal,
        ReputationEvent::SpoofDetected => cfg.spoof_detected,
        ReputationEvent::ReplayDetected => cfg.replay_detected,
        ReputationEvent::AttackDetected => cfg.attack_detected,
        ReputationEvent::VoteVerified => cfg.vote_verified,
        ReputationEvent::VoteNotVerified => cfg.vote_not_verified,
        ReputationEvent::VoteDisowned => cfg.vote_disowned,
    }
}

/// Per-peer reputation scores, keyed by identity key.
pub struct ReputationTable {
    scores: DashMap<String, i32>,
    cfg: ReputationConfig,
}

#[derive(Serialize, Deserialize)]
struct ReputationSnapshot {
    scores: Vec<(String, i32)>,
}

impl ReputationTable {
    pub fn new(cfg: ReputationConfig) -> Self {
        Self {
            scores: DashMap::new(),
            cfg,
        }
    }

    /// Current score for a peer, initializing on first sight.
    pub fn reputation(&self, peer: &PeerIdentity) -> i32 {
        *self
            .scores
            .entry(peer.key().to_string())
            .or_insert(INITIAL_REPUTATION)
    }

    /// Apply the configured delta for `event`, scaled by a random factor.
    /// A change to the local identity is logged and not applied.
    pub fn change(&self, peer: &PeerIdentity, event: ReputationEvent) {
        let base = delta_for(&self.cfg, event);
        let scaled = (base as f32 * rand::thread_rng().gen::<f32>()) as i32;
        self.change_scaled(peer, scaled);
    }

    /// Apply an already-scaled delta with both clamps. Split out so tests
    /// can exercise the clamping without the random factor.
    pub fn change_scaled(&self, peer: &PeerIdentity, mut delta: i32) {
        if peer.is_local() {
            tracing::debug!(peer = %peer, delta, "ignoring reputation delta for local identity");
            return;
        }
        let max_delta = self.cfg.max_delta.abs();
        let mut entry = self
            .scores
            .entry(peer.key().to_string())
            .or_insert(INITIAL_REPUTATION);
        let reputation = *entry;

        if delta > 0 {
            delta = delta.min(max_delta).min(MAX_REPUTATION - reputation);
        } else if delta < 0 {
            delta = delta.max(-max_delta).max(-reputation);
        }
        if delta != 0 {
            tracing::debug!(
                peer = %peer,
                from = reputation,
                to = reputation + delta,
                "reputation change"
            );
        }
        *entry = reputation + delta;
    }

    pub fn max_reputation(&self) -> i32 {
        MAX_REPUTATION
    }

    // ── Persistence ───────────────────────────────────────────────────────

    /// Flush all scores through the persistence collaborator.
    pub fn store(&self, store: &dyn PeerStateStore) -> std::io::Result<()> {
        let snapshot = ReputationSnapshot {
            scores: self
                .scores
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        };
        let blob = serde_json::to_vec(&snapshot)?;
        store.store(STORE_KEY, &blob)
    }

    /// Reload scores previously written by [`store`](Self::store).
    /// Unknown peers reappear lazily as they are looked up.
    pub fn load(&self, store: &dyn PeerStateStore) -> std::io::Result<()> {
        let Some(blob) = store.load(STORE_KEY)? else {
            return Ok(());
        };
        let snapshot: ReputationSnapshot = serde_json::from_slice(&blob)?;
        for (key, score) in snapshot.scores {
            self.scores.insert(key, score.clamp(0, MAX_REPUTATION));
        }
        Ok(())
    }
}
