//! Audit message router — multicast/unicast forwarding with loop
//! prevention, duplicate suppression, partner maintenance, and the
//! periodic keep-alive beacon.
//!
//! The router sits behind the datagram transport's handler registry for
//! [`PROTOCOL_AUDIT`], decodes envelopes, and decides whether and how to
//! propagate them before handing non-noop messages to its own registered
//! handlers. Payload semantics stay opaque here.

use std::io;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use tokio::sync::broadcast;

use vigil_core::config::RouterConfig;
use vigil_core::identity::{IdentityRegistry, PeerIdentity};
use vigil_core::wire::{Envelope, PROTOCOL_AUDIT, VERIFIER_LEN};
use vigil_services::{PartnerList, RateLimiter};

use crate::datagram::{DatagramTransport, ReceivedDatagram};

/// Sending seam between the router and the datagram transport.
pub trait DatagramSend: Send + Sync {
    fn multicast(&self, protocol: u32, payload: &[u8]) -> io::Result<()>;
    fn unicast(&self, protocol: u32, payload: &[u8], peer_key: &str) -> io::Result<()>;
}

impl DatagramSend for DatagramTransport {
    fn multicast(&self, protocol: u32, payload: &[u8]) -> io::Result<()> {
        self.send_multicast(protocol, payload)
    }

    fn unicast(&self, protocol: u32, payload: &[u8], peer_key: &str) -> io::Result<()> {
        self.send_unicast(protocol, payload, peer_key)
    }
}

/// Callback registered by the poll layer for routed audit messages.
pub trait EnvelopeHandler: Send + Sync {
    fn handle_envelope(&self, env: &Envelope, sender: &PeerIdentity);
}

struct RouterInner {
    cfg: RouterConfig,
    registry: Arc<IdentityRegistry>,
    partners: Arc<PartnerList>,
    transport: Arc<dyn DatagramSend>,
    handlers: RwLock<Vec<Arc<dyn EnvelopeHandler>>>,
    recent_verifiers: Mutex<LruCache<[u8; VERIFIER_LEN], ()>>,
    orig_msg_limiter: Mutex<RateLimiter>,
    fwd_msg_limiter: Mutex<RateLimiter>,
    beacon_deadline: Mutex<Instant>,
    refresh_partners_at: Mutex<Instant>,
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        cfg: RouterConfig,
        registry: Arc<IdentityRegistry>,
        partners: Arc<PartnerList>,
        transport: Arc<dyn DatagramSend>,
    ) -> Self {
        let beacon = beacon_interval(&cfg);
        let refresh = Duration::from_millis(cfg.partner_refresh_interval_ms);
        Router {
            inner: Arc::new(RouterInner {
                handlers: RwLock::new(Vec::new()),
                recent_verifiers: Mutex::new(LruCache::new(cfg.dup_cache_size.max(1))),
                orig_msg_limiter: Mutex::new(RateLimiter::from_config(cfg.originate_rate)),
                fwd_msg_limiter: Mutex::new(RateLimiter::from_config(cfg.forward_rate)),
                beacon_deadline: Mutex::new(Instant::now() + beacon),
                refresh_partners_at: Mutex::new(Instant::now() + refresh),
                cfg,
                registry,
                partners,
                transport,
            }),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn EnvelopeHandler>) {
        self.inner.handlers.write().unwrap().push(handler);
    }

    // ── Originating ───────────────────────────────────────────────────────

    /// Multicast a message to all caches, supplemented by unicast to the
    /// partner list. All locally originated flood traffic goes through
    /// here.
    pub fn originate_multicast(&self, mut env: Envelope) -> io::Result<()> {
        let inner = &self.inner;
        inner.check_stale_partners();
        env.hop_count = inner.cfg.initial_hop_count;
        if !inner.orig_msg_limiter.lock().unwrap().allow() {
            tracing::debug!("originate rate limited");
            return Ok(());
        }
        let encoded = encode_envelope(&env)?;
        if let Err(e) = inner.transport.multicast(PROTOCOL_AUDIT, &encoded) {
            tracing::warn!(error = %e, "multicast send failed");
        } else {
            inner.update_beacon();
        }
        inner.unicast_to_partners(&encoded, None, None);
        Ok(())
    }

    /// Unicast a message to a single cache.
    pub fn originate_unicast(&self, mut env: Envelope, peer: &PeerIdentity) -> io::Result<()> {
        let inner = &self.inner;
        env.hop_count = inner.cfg.initial_hop_count;
        if !inner.orig_msg_limiter.lock().unwrap().allow() {
            tracing::debug!("originate rate limited");
            return Ok(());
        }
        let encoded = encode_envelope(&env)?;
        inner.transport.unicast(PROTOCOL_AUDIT, &encoded, peer.key())?;
        inner.update_beacon();
        Ok(())
    }

    // ── Receiving ─────────────────────────────────────────────────────────

    /// Entry point from the datagram dispatch: dedup, route, hand to
    /// handlers.
    pub fn handle_datagram(&self, dg: ReceivedDatagram) {
        let inner = &self.inner;
        let sender = match inner.registry.for_ip(dg.source.ip()) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(source = %dg.source, error = %e, "bad peer id in incoming message");
                return;
            }
        };
        let env = match Envelope::decode(&dg.payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(sender = %sender, error = %e, "couldn't decode incoming message");
                return;
            }
        };
        tracing::debug!(sender = %sender, kind = ?env.kind, hops = env.hop_count, "received message");

        // packets from non-partners prove the partner list isn't stale
        if !inner.did_i_originate_or_send(&dg, &env) && !inner.partners.is_partner(sender.key()) {
            *inner.refresh_partners_at.lock().unwrap() =
                Instant::now() + Duration::from_millis(inner.cfg.partner_refresh_interval_ms);
        }

        if inner.is_duplicate(&env) {
            tracing::debug!(sender = %sender, verifier = %hex::encode(env.verifier), "discarding duplicate");
            return;
        }
        inner.route_incoming(&dg, &env, &sender);
        if !env.kind.is_noop() {
            inner.run_handlers(&env, &sender);
        }
    }

    /// Forwarding predicate, minus the rate-limit budget which is only
    /// consumed on an actual forward.
    pub fn is_eligible_to_forward(&self, dg: &ReceivedDatagram, env: &Envelope) -> bool {
        self.inner.is_eligible_to_forward(dg, env)
    }

    // ── Beacon ────────────────────────────────────────────────────────────

    /// Periodic no-op originate to keep partner/multicast liveness fresh.
    /// Any send pushes the deadline out.
    pub async fn run_beacon(self, mut shutdown: broadcast::Receiver<()>) {
        if self.inner.cfg.beacon_interval_ms == 0 {
            return;
        }
        let interval = beacon_interval(&self.inner.cfg);
        tracing::info!(interval_ms = self.inner.cfg.beacon_interval_ms, "beacon starting");
        loop {
            let deadline = *self.inner.beacon_deadline.lock().unwrap();
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("beacon shutting down");
                    return;
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            }
            let now = Instant::now();
            let current = *self.inner.beacon_deadline.lock().unwrap();
            if now >= current {
                tracing::debug!("beacon send");
                self.send_noop();
                *self.inner.beacon_deadline.lock().unwrap() = now + interval;
            }
        }
    }

    fn send_noop(&self) {
        let noop = Envelope::noop(self.inner.registry.local().key());
        if let Err(e) = self.originate_multicast(noop) {
            tracing::warn!(error = %e, "couldn't send no-op message");
        }
    }
}

impl RouterInner {
    fn is_duplicate(&self, env: &Envelope) -> bool {
        self.recent_verifiers
            .lock()
            .unwrap()
            .put(env.verifier, ())
            .is_some()
    }

    /// True if the packet came from one of our interfaces or the message
    /// names us as originator.
    fn did_i_originate_or_send(&self, dg: &ReceivedDatagram, env: &Envelope) -> bool {
        let local = self.registry.local();
        if env.originator == local.key() {
            return true;
        }
        dg.source.ip() == local.address().ip()
    }

    fn is_eligible_to_forward(&self, dg: &ReceivedDatagram, env: &Envelope) -> bool {
        if env.hop_count == 0 {
            tracing::trace!("not forwarding, hop count exhausted");
            return false;
        }
        if env.kind.is_unicast_only() {
            tracing::trace!("not forwarding, unicast-only kind");
            return false;
        }
        if self.did_i_originate_or_send(dg, env) {
            tracing::trace!("not forwarding, I sent it");
            return false;
        }
        if !env.kind.is_noop() && env.stop_time <= now_ms() {
            tracing::trace!("not forwarding, poll over");
            return false;
        }
        true
    }

    /// Decide where to forward an incoming message and maintain the
    /// partner list from what its arrival path proves about reachability.
    fn route_incoming(&self, dg: &ReceivedDatagram, env: &Envelope, sender: &PeerIdentity) {
        let originator = match self.registry.find_or_create(&env.originator) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "bad originator key, not routing");
                return;
            }
        };
        if !self.is_eligible_to_forward(dg, env) {
            return;
        }
        if !self.fwd_msg_limiter.lock().unwrap().allow() {
            tracing::debug!("forward rate limited");
            return;
        }
        let mut fwd = env.clone();
        fwd.hop_count -= 1;
        let encoded = match encode_envelope(&fwd) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "couldn't re-encode message for forwarding");
                return;
            }
        };
        let prob = self.cfg.partner_add_probability;
        if dg.multicast {
            self.partners.multicast_seen(sender.key());
            if sender != &originator {
                self.partners.add_partner(originator.key(), prob);
            }
            self.unicast_to_partners(&encoded, Some(sender.key()), Some(originator.key()));
        } else {
            self.partners.add_partner(sender.key(), 1.0);
            if sender != &originator {
                self.partners.add_partner(originator.key(), prob);
            }
            if let Err(e) = self.transport.multicast(PROTOCOL_AUDIT, &encoded) {
                tracing::warn!(error = %e, "couldn't re-multicast");
            } else {
                self.update_beacon();
            }
            self.unicast_to_partners(&encoded, Some(sender.key()), Some(originator.key()));
        }
    }

    /// Unicast to every partner except the message's sender and
    /// originator. A failed send drops the partner.
    fn unicast_to_partners(&self, encoded: &[u8], sender: Option<&str>, originator: Option<&str>) {
        for partner in self.partners.partners() {
            if Some(partner.as_str()) == sender || Some(partner.as_str()) == originator {
                continue;
            }
            match self.transport.unicast(PROTOCOL_AUDIT, encoded, &partner) {
                Ok(()) => self.update_beacon(),
                Err(e) => {
                    tracing::warn!(partner = %partner, error = %e, "unicast failed, dropping partner");
                    self.partners.remove_partner(&partner);
                }
            }
        }
    }

    /// No packet from any non-partner for a long time: freshen the list
    /// from the configured defaults.
    fn check_stale_partners(&self) {
        let mut refresh_at = self.refresh_partners_at.lock().unwrap();
        if Instant::now() >= *refresh_at {
            tracing::debug!("refreshing partner list: no recent non-partner packets");
            self.partners.add_from_defaults();
            *refresh_at =
                Instant::now() + Duration::from_millis(self.cfg.partner_refresh_interval_ms);
        }
    }

    fn update_beacon(&self) {
        if self.cfg.beacon_interval_ms != 0 {
            *self.beacon_deadline.lock().unwrap() =
                Instant::now() + Duration::from_millis(self.cfg.beacon_interval_ms);
        }
    }

    fn run_handlers(&self, env: &Envelope, sender: &PeerIdentity) {
        let handlers: Vec<_> = self.handlers.read().unwrap().iter().cloned().collect();
        for handler in handlers {
            handler.handle_envelope(env, sender);
        }
    }
}

fn encode_envelope(env: &Envelope) -> io::Result<bytes::Bytes> {
    env.encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Beacon period, falling back to the partner refresh interval when the
/// beacon is disabled so stale-partner resets still have a sane horizon.
fn beacon_interval(cfg: &RouterConfig) -> Duration {
    if cfg.beacon_interval_ms != 0 {
        Duration::from_millis(cfg.beacon_interval_ms)
    } else {
        Duration::from_millis(cfg.partner_refresh_interval_ms.max(60_000))
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Tests ─────────────────────────────────────────────────────────────────────
