//! Datagram transport — raw UDP send/receive, unicast and multicast.
//!
//! Multicast receive can run on two sockets joined to the same group: a
//! packet is accepted as genuine multicast only once the identical
//! payload+source has been observed on both, which a unicast packet spoofed
//! at the multicast port never is. If our own multicast sends stop coming
//! back for long enough, multicast is muzzled and packets are looped back
//! locally instead, so handlers keep running while the network is deaf.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use lru::LruCache;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use vigil_core::config::DatagramConfig;
use vigil_core::identity::PeerAddress;
use vigil_core::wire::{decode_datagram, encode_datagram};

use crate::dispatch::HandlerRegistry;

/// A decoded datagram as handed to protocol handlers.
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    pub protocol: u32,
    pub payload: Bytes,
    pub source: SocketAddr,
    pub multicast: bool,
}

/// Which of the two multicast sockets a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum McastSocket {
    First,
    Second,
}

/// Dual-socket multicast verification cache.
///
/// First sighting of a packet is remembered and suppressed; a repeat on
/// the *other* socket proves real multicast delivery and releases exactly
/// one copy; repeats on the same socket stay suppressed.
pub(crate) struct MulticastVerifier {
    cache: LruCache<[u8; 32], McastSocket>,
}

impl MulticastVerifier {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(capacity.max(1)),
        }
    }

    /// Returns true when the packet should be processed.
    pub(crate) fn observe(
        &mut self,
        payload: &[u8],
        source: SocketAddr,
        socket: McastSocket,
    ) -> bool {
        let key = verify_key(payload, source);
        match self.cache.get(&key).copied() {
            None => {
                self.cache.put(key, socket);
                false
            }
            Some(first) if first != socket => {
                self.cache.pop(&key);
                true
            }
            Some(_) => false,
        }
    }
}

fn verify_key(payload: &[u8], source: SocketAddr) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(payload);
    hasher.update(source.to_string().as_bytes());
    *hasher.finalize().as_bytes()
}

struct DatagramInner {
    cfg: DatagramConfig,
    local_ip: IpAddr,
    group: Option<Ipv4Addr>,
    unicast_sock: Arc<UdpSocket>,
    mcast_socks: Vec<Arc<UdpSocket>>,
    handlers: Arc<HandlerRegistry<ReceivedDatagram>>,
    verifier: Mutex<MulticastVerifier>,
    muzzled: AtomicBool,
    last_self_multicast: Mutex<Instant>,
}

/// Sends/receives raw UDP packets on a unicast socket and on one or two
/// multicast sockets.
#[derive(Clone)]
pub struct DatagramTransport {
    inner: Arc<DatagramInner>,
}

impl DatagramTransport {
    /// Bind the unicast socket and join the multicast group (twice when
    /// verification is on).
    pub async fn bind(
        cfg: DatagramConfig,
        local_ip: IpAddr,
        handlers: Arc<HandlerRegistry<ReceivedDatagram>>,
    ) -> anyhow::Result<Self> {
        let unicast_sock = UdpSocket::bind(("0.0.0.0", cfg.unicast_port))
            .await
            .context("failed to bind unicast socket")?;

        let group: Option<Ipv4Addr> = if cfg.group.is_empty() {
            None
        } else {
            Some(cfg.group.parse().context("bad multicast group")?)
        };

        let mut mcast_socks = Vec::new();
        if let Some(group_addr) = group {
            match make_multicast_socket(group_addr, cfg.multicast_port) {
                Ok(sock) => {
                    mcast_socks.push(Arc::new(sock));
                    if cfg.verify_multicast {
                        match make_multicast_socket(group_addr, cfg.multicast_port) {
                            Ok(sock) => mcast_socks.push(Arc::new(sock)),
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    "can't create 2nd multicast socket, not detecting multicast spoofing"
                                );
                            }
                        }
                    }
                    tracing::info!(group = %group_addr, port = cfg.multicast_port, sockets = mcast_socks.len(), "multicast receive started");
                }
                Err(e) => {
                    tracing::error!(error = %e, "can't create multicast socket, not starting multicast receive");
                }
            }
        } else {
            tracing::info!("multicast group not configured, unicast only");
        }

        let verify_cache = cfg.verify_cache_size;
        Ok(DatagramTransport {
            inner: Arc::new(DatagramInner {
                cfg,
                local_ip,
                group,
                unicast_sock: Arc::new(unicast_sock),
                mcast_socks,
                handlers,
                verifier: Mutex::new(MulticastVerifier::new(verify_cache)),
                muzzled: AtomicBool::new(false),
                last_self_multicast: Mutex::new(Instant::now()),
            }),
        })
    }

    /// Port the unicast socket actually bound.
    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.inner.unicast_sock.local_addr()?.port())
    }

    /// Spawn one receive task per socket.
    pub fn spawn_receivers(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(recv_loop(
            self.inner.clone(),
            self.inner.unicast_sock.clone(),
            None,
            shutdown.subscribe(),
        )));
        for (ix, sock) in self.inner.mcast_socks.iter().enumerate() {
            // verification only means anything with both sockets up
            let id = if ix == 0 {
                McastSocket::First
            } else {
                McastSocket::Second
            };
            tasks.push(tokio::spawn(recv_loop(
                self.inner.clone(),
                sock.clone(),
                Some(id),
                shutdown.subscribe(),
            )));
        }
        tasks
    }

    /// Multicast a packet to the group, subject to the muzzle check.
    pub fn send_multicast(&self, protocol: u32, payload: &[u8]) -> std::io::Result<()> {
        let inner = &self.inner;
        let Some(group) = inner.group else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "multicast group not configured",
            ));
        };
        if inner.check_muzzled() {
            // We normally see our own packets come back via multicast; if
            // that's muzzled, hand the packet to our own handlers instead.
            if inner.cfg.loopback_if_muzzled {
                inner.loopback(protocol, payload);
            }
            return Ok(());
        }
        let pkt = encode_packet(inner, protocol, payload)?;
        let dest = SocketAddr::new(IpAddr::V4(group), inner.cfg.multicast_port);
        inner.unicast_sock.try_send_to(&pkt, dest)?;
        Ok(())
    }

    /// Unicast a packet to the peer named by `peer_key`.
    pub fn send_unicast(&self, protocol: u32, payload: &[u8], peer_key: &str) -> std::io::Result<()> {
        let inner = &self.inner;
        let addr = PeerAddress::from_key(peer_key)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let port = if inner.cfg.unicast_send_port != 0 {
            inner.cfg.unicast_send_port
        } else {
            inner.cfg.unicast_port
        };
        let pkt = encode_packet(inner, protocol, payload)?;
        inner.unicast_sock.try_send_to(&pkt, SocketAddr::new(addr.ip(), port))?;
        Ok(())
    }
}

fn encode_packet(inner: &DatagramInner, protocol: u32, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    encode_datagram(protocol, payload, inner.cfg.compress, inner.cfg.compress_min)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl DatagramInner {
    /// True when multicast sending should stop: no self-observed receipt
    /// within the configured window.
    fn check_muzzled(&self) -> bool {
        if self.muzzled.load(Ordering::Relaxed) {
            return true;
        }
        let last = *self.last_self_multicast.lock().unwrap();
        if last.elapsed() >= Duration::from_millis(self.cfg.multicast_muzzle_after_ms) {
            tracing::info!("no multicast connectivity; disabling multicast send");
            self.muzzled.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Deliver a packet to local handlers as if received via unicast.
    fn loopback(&self, protocol: u32, payload: &[u8]) {
        tracing::debug!(protocol, "looping packet back locally");
        let dg = ReceivedDatagram {
            protocol,
            payload: Bytes::copy_from_slice(payload),
            source: SocketAddr::new(self.local_ip, self.cfg.unicast_port),
            multicast: false,
        };
        if !self.handlers.dispatch(protocol, dg) {
            tracing::warn!(protocol, "looped-back packet has no handler");
        }
    }

    fn process_packet(&self, data: &[u8], source: SocketAddr, via: Option<McastSocket>) {
        if let Some(socket) = via {
            if self.cfg.verify_multicast && self.mcast_socks.len() == 2 {
                let accept = self
                    .verifier
                    .lock()
                    .unwrap()
                    .observe(data, source, socket);
                if !accept {
                    tracing::trace!(%source, "multicast packet awaiting verification");
                    return;
                }
            }
            if source.ip() == self.local_ip {
                // our own send came back; multicast connectivity confirmed
                *self.last_self_multicast.lock().unwrap() = Instant::now();
                self.muzzled.store(false, Ordering::Relaxed);
            }
        }
        let (protocol, payload) = match decode_datagram(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(%source, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        let dg = ReceivedDatagram {
            protocol,
            payload,
            source,
            multicast: via.is_some(),
        };
        if !self.handlers.dispatch(protocol, dg) {
            tracing::warn!(protocol, %source, "received datagram with unregistered protocol");
        }
    }
}

async fn recv_loop(
    inner: Arc<DatagramInner>,
    sock: Arc<UdpSocket>,
    via: Option<McastSocket>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; 65_536];
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            result = sock.recv_from(&mut buf) => {
                match result {
                    Ok((len, source)) => inner.process_packet(&buf[..len], source, via),
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                    }
                }
            }
        }
    }
}

/// UDP socket joined to the multicast group, reusable so a second socket
/// (and other processes on this host) can join the same group/port.
fn make_multicast_socket(group: Ipv4Addr, port: u16) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    let bind_addr: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&bind_addr.into()).context("bind")?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .context("IP_ADD_MEMBERSHIP")?;
    socket.set_multicast_loop_v4(true).context("IP_MULTICAST_LOOP")?;
    socket.set_nonblocking(true).context("O_NONBLOCK")?;
    let std_sock: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_sock)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(port: u16) -> SocketAddr {
        SocketAddr::new("10.4.0.1".parse().unwrap(), port)
    }

    #[test]
    fn packet_on_both_sockets_accepted_exactly_once() {
        let mut verifier = MulticastVerifier::new(16);
        assert!(!verifier.observe(b"pkt", src(9731), McastSocket::First));
        assert!(verifier.observe(b"pkt", src(9731), McastSocket::Second));
        // the cache entry is consumed; a re-send starts over
        assert!(!verifier.observe(b"pkt", src(9731), McastSocket::First));
    }

    #[test]
    fn repeats_on_one_socket_never_accepted() {
        let mut verifier = MulticastVerifier::new(16);
        for _ in 0..10 {
            assert!(!verifier.observe(b"spoofed", src(9731), McastSocket::First));
        }
    }

    #[test]
    fn distinct_payloads_verify_independently() {
        let mut verifier = MulticastVerifier::new(16);
        assert!(!verifier.observe(b"a", src(9731), McastSocket::First));
        assert!(!verifier.observe(b"b", src(9731), McastSocket::Second));
        assert!(verifier.observe(b"a", src(9731), McastSocket::Second));
        assert!(verifier.observe(b"b", src(9731), McastSocket::First));
    }

    #[test]
    fn source_address_is_part_of_identity() {
        let mut verifier = MulticastVerifier::new(16);
        assert!(!verifier.observe(b"pkt", src(9731), McastSocket::First));
        // same bytes from a different source is a different packet
        assert!(!verifier.observe(b"pkt", src(9732), McastSocket::Second));
    }

    #[test]
    fn cache_eviction_forgets_oldest_sighting() {
        let mut verifier = MulticastVerifier::new(2);
        assert!(!verifier.observe(b"a", src(1), McastSocket::First));
        assert!(!verifier.observe(b"b", src(1), McastSocket::First));
        assert!(!verifier.observe(b"c", src(1), McastSocket::First));
        // "a" was evicted, so its second-socket sighting restarts
        assert!(!verifier.observe(b"a", src(1), McastSocket::Second));
    }
}
