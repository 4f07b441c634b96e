//! Channel pool — multiplexes many peers over a bounded channel budget.
//!
//! One primary channel per peer carries traffic; a second inbound
//! connection for an already-associated peer is kept as a secondary and
//! promoted when the primary goes away. Messages that cannot be handed to
//! a live channel are held per peer and adopted by the next channel that
//! associates. Exceeding the channel ceiling is a synchronous backpressure
//! error to the sender, never a silent queue-and-wait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use vigil_core::config::StreamConfig;
use vigil_core::identity::{IdentityRegistry, PeerIdentity};
use vigil_core::message::PeerMessage;
use vigil_services::RateLimiter;

use crate::channel::{Channel, ChannelState};

/// Shared core handed to every channel.
pub(crate) struct CommCore {
    pub(crate) cfg: StreamConfig,
    pub(crate) registry: Arc<IdentityRegistry>,
    peers: DashMap<String, Arc<Mutex<PeerData>>>,
    n_primary: AtomicUsize,
    rcv_tx: mpsc::UnboundedSender<PeerMessage>,
    rcv_limiters: DashMap<String, RateLimiter>,
    /// Channels that half-closed output and are still reading. Kept only
    /// for status reporting; entries drop out as the channels close.
    draining: Mutex<Vec<Weak<Channel>>>,
}

#[derive(Default)]
struct PeerData {
    primary: Option<Arc<Channel>>,
    secondary: Option<Arc<Channel>>,
    /// Messages waiting for the next channel to associate.
    held: VecDeque<PeerMessage>,
}

/// Errors surfaced synchronously from [`ChannelManager::send_to`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("channel pool at capacity ({0} channels)")]
    Backpressure(usize),

    #[error("peer {0} has no stream address")]
    NoStreamAddress(String),

    #[error("couldn't hand message to a channel for {peer} after {attempts} attempts")]
    Refused { peer: String, attempts: u32 },
}

/// The connection-pool/dispatch manager.
#[derive(Clone)]
pub struct ChannelManager {
    core: Arc<CommCore>,
}

impl ChannelManager {
    /// Build the manager. The returned receiver yields every message read
    /// off any channel, in per-channel FIFO order.
    pub fn new(
        cfg: StreamConfig,
        registry: Arc<IdentityRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerMessage>) {
        let (rcv_tx, rcv_rx) = mpsc::unbounded_channel();
        std::fs::create_dir_all(&cfg.message_dir).ok();
        let core = Arc::new(CommCore {
            cfg,
            registry,
            peers: DashMap::new(),
            n_primary: AtomicUsize::new(0),
            rcv_tx,
            rcv_limiters: DashMap::new(),
            draining: Mutex::new(Vec::new()),
        });
        (ChannelManager { core }, rcv_rx)
    }

    /// Enqueue `msg` for delivery to `peer`, creating a channel if none
    /// exists. A channel that refuses the message because it is closing is
    /// dissociated and the send retried against a fresh channel, a bounded
    /// number of times.
    pub fn send_to(&self, msg: PeerMessage, peer: &PeerIdentity) -> Result<(), SendError> {
        const MAX_ATTEMPTS: u32 = 3;

        let pd_arc = self.peer_data(peer);
        let mut pd = pd_arc.lock().unwrap();

        let mut msg = msg;
        for attempt in 1..=MAX_ATTEMPTS {
            let chan = self.find_or_make_channel(&mut pd, peer)?;
            // earlier held messages go first so per-peer order holds
            chan.adopt_queue(&mut pd.held);
            match chan.send(msg) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    msg = back;
                    if chan.is_unused_originating_channel() {
                        // the channel failed before carrying anything
                        tracing::warn!(peer = %peer, "channel failed to start");
                        remove_from_slots(&self.core, &mut pd, &chan);
                        if chan.should_retry() && msg.is_requeueable() {
                            pd.held.push_back(msg);
                            return Ok(());
                        }
                        msg.delete();
                        return Err(SendError::Refused {
                            peer: peer.key().to_string(),
                            attempts: attempt,
                        });
                    }
                    tracing::debug!(peer = %peer, attempt, "channel refused message, retrying");
                    remove_from_slots(&self.core, &mut pd, &chan);
                }
            }
        }
        msg.delete();
        Err(SendError::Refused {
            peer: peer.key().to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Accept loop. Each accepted socket becomes a channel whose identity
    /// is learned from the handshake; a bad connection only ever costs
    /// itself.
    pub async fn run_listener(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("channel listener shutting down");
                    self.stop_all();
                    return;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::debug!(%addr, "accepted connection");
                            stream.set_nodelay(true).ok();
                            Channel::incoming(self.core.clone()).start_incoming(stream);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    /// Periodic scan for channels hung mid-send.
    pub async fn run_hung_check(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.core.cfg.hung_check_ms.max(100)));
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    for chan in self.all_channels() {
                        chan.check_hung();
                    }
                }
            }
        }
    }

    /// Abort every channel. Used at shutdown.
    pub fn stop_all(&self) {
        for chan in self.all_channels() {
            chan.stop(true, Some("shutting down"));
        }
    }

    // ── Introspection ─────────────────────────────────────────────────────

    /// Number of live primary channels.
    pub fn live_channels(&self) -> usize {
        self.core.n_primary.load(Ordering::Relaxed)
    }

    /// State of the primary channel to `peer`, if any.
    pub fn channel_state(&self, peer: &PeerIdentity) -> Option<ChannelState> {
        let pd_arc = self.core.peers.get(peer.key())?;
        let pd = pd_arc.lock().unwrap();
        pd.primary.as_ref().map(|c| c.state())
    }

    /// Messages held for `peer` awaiting a channel.
    pub fn held_count(&self, peer: &PeerIdentity) -> usize {
        self.core
            .peers
            .get(peer.key())
            .map(|pd| pd.lock().unwrap().held.len())
            .unwrap_or(0)
    }

    /// States of channels that have half-closed output and are draining
    /// input.
    pub fn draining_states(&self) -> Vec<ChannelState> {
        let mut draining = self.core.draining.lock().unwrap();
        draining.retain(|weak| {
            weak.upgrade()
                .map(|c| c.state() == ChannelState::DrainInput)
                .unwrap_or(false)
        });
        draining
            .iter()
            .filter_map(|w| w.upgrade().map(|c| c.state()))
            .collect()
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn peer_data(&self, peer: &PeerIdentity) -> Arc<Mutex<PeerData>> {
        self.core
            .peers
            .entry(peer.key().to_string())
            .or_default()
            .clone()
    }

    fn all_channels(&self) -> Vec<Arc<Channel>> {
        let mut out = Vec::new();
        for entry in self.core.peers.iter() {
            let pd = entry.value().lock().unwrap();
            out.extend(pd.primary.iter().cloned());
            out.extend(pd.secondary.iter().cloned());
        }
        out
    }

    fn find_or_make_channel(
        &self,
        pd: &mut PeerData,
        peer: &PeerIdentity,
    ) -> Result<Arc<Channel>, SendError> {
        if let Some(primary) = &pd.primary {
            return Ok(primary.clone());
        }
        if let Some(secondary) = pd.secondary.take() {
            tracing::debug!(peer = %peer, "promoted secondary channel");
            pd.primary = Some(secondary.clone());
            self.core.n_primary.fetch_add(1, Ordering::Relaxed);
            secondary.adopt_queue(&mut pd.held);
            return Ok(secondary);
        }
        let live = self.core.n_primary.load(Ordering::Relaxed);
        if live >= self.core.cfg.max_channels {
            return Err(SendError::Backpressure(live));
        }
        let chan = Channel::originate(self.core.clone(), peer.clone());
        chan.clone().start_originate()?;
        chan.adopt_queue(&mut pd.held);
        tracing::debug!(peer = %peer, "created channel");
        pd.primary = Some(chan.clone());
        self.core.n_primary.fetch_add(1, Ordering::Relaxed);
        Ok(chan)
    }
}

impl CommCore {
    /// A completed inbound handshake binds `chan` to `peer`: primary if the
    /// slot is free, otherwise secondary.
    pub(crate) fn associate_channel(&self, chan: &Arc<Channel>, peer: &PeerIdentity) {
        let pd_arc = self
            .peers
            .entry(peer.key().to_string())
            .or_default()
            .clone();
        let mut pd = pd_arc.lock().unwrap();
        if pd.primary.is_none() {
            pd.primary = Some(chan.clone());
            self.n_primary.fetch_add(1, Ordering::Relaxed);
            chan.adopt_queue(&mut pd.held);
            tracing::debug!(peer = %peer, "associated channel");
        } else if Arc::ptr_eq(pd.primary.as_ref().unwrap(), chan) {
            tracing::warn!(peer = %peer, "redundant peer-channel association");
        } else if pd.secondary.is_none() {
            pd.secondary = Some(chan.clone());
            tracing::debug!(peer = %peer, "associated secondary channel");
        } else if Arc::ptr_eq(pd.secondary.as_ref().unwrap(), chan) {
            tracing::debug!(peer = %peer, "redundant secondary peer-channel association");
        } else {
            // the old channels will time out and close on their own
            tracing::warn!(peer = %peer, "conflicting peer-channel association");
        }
    }

    /// Remove `chan` from the peer's slots and decide the fate of its
    /// unsent messages. Safe to call more than once for the same channel.
    pub(crate) fn dissociate_channel(
        &self,
        chan: &Channel,
        peer: Option<&PeerIdentity>,
        unsent: VecDeque<PeerMessage>,
        should_retry: bool,
    ) {
        let Some(peer) = peer else {
            for msg in unsent {
                msg.delete();
            }
            return;
        };
        let pd_arc = self
            .peers
            .entry(peer.key().to_string())
            .or_default()
            .clone();
        let mut pd = pd_arc.lock().unwrap();
        remove_from_slots(self, &mut pd, chan);
        if should_retry {
            for mut msg in unsent {
                if msg.is_requeueable() && !msg.is_expired() && msg.retries_left() {
                    msg.incr_retry_count();
                    pd.held.push_back(msg);
                } else {
                    msg.delete();
                }
            }
        } else {
            for msg in unsent {
                msg.delete();
            }
        }
    }

    /// Remember a channel that half-closed output, for status reporting.
    /// Entries fall out once the channel leaves `DrainInput`.
    pub(crate) fn note_draining(&self, chan: &Arc<Channel>) {
        let mut draining = self.draining.lock().unwrap();
        draining.retain(|weak| {
            weak.upgrade()
                .map(|c| c.state() == ChannelState::DrainInput)
                .unwrap_or(false)
        });
        draining.push(Arc::downgrade(chan));
    }

    pub(crate) fn receive_allowed(&self, peer: &PeerIdentity) -> bool {
        let mut limiter = self
            .rcv_limiters
            .entry(peer.key().to_string())
            .or_insert_with(|| RateLimiter::from_config(self.cfg.receive_rate));
        limiter.allow()
    }

    pub(crate) fn deliver_received(&self, msg: PeerMessage) {
        if self.rcv_tx.send(msg).is_err() {
            tracing::warn!("receive queue closed, dropping message");
        }
    }
}

fn remove_from_slots(core: &CommCore, pd: &mut PeerData, chan: &Channel) {
    if let Some(primary) = &pd.primary {
        if std::ptr::eq(Arc::as_ptr(primary), chan as *const Channel) {
            pd.primary = None;
            core.n_primary.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!("removed primary channel");
        }
    }
    if let Some(secondary) = &pd.secondary {
        if std::ptr::eq(Arc::as_ptr(secondary), chan as *const Channel) {
            pd.secondary = None;
            tracing::debug!("removed secondary channel");
        }
    }
}
