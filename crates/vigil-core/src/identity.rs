//! Peer identity model — interned peer handles and their network addresses.
//!
//! Every layer above this one compares peers by identity, never by key
//! string. The registry guarantees one handle per key, so `==` on
//! [`PeerIdentity`] is a pointer comparison and is safe to use in routing
//! decisions (sender vs. originator, local vs. remote).

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;

use crate::wire::MAX_PEERID_LEN;

// ── Addresses ─────────────────────────────────────────────────────────────────

/// Resolved network endpoint for a peer, derived deterministically from
/// its identity key.
///
/// Key grammar:
///   * `"10.4.0.1"`              — datagram-only peer (unicast UDP)
///   * `"TCP:[10.4.0.1]:9729"`   — stream-capable peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddress {
    Udp { ip: IpAddr },
    Tcp { ip: IpAddr, port: u16 },
}

impl PeerAddress {
    pub fn from_key(key: &str) -> Result<Self, MalformedIdentityError> {
        if key.is_empty() || key.len() > MAX_PEERID_LEN {
            return Err(MalformedIdentityError::new(key, "bad key length"));
        }
        if let Some(rest) = key.strip_prefix("TCP:[") {
            let (ip_str, port_str) = rest
                .split_once("]:")
                .ok_or_else(|| MalformedIdentityError::new(key, "missing \"]:\""))?;
            let ip: IpAddr = ip_str
                .parse()
                .map_err(|_| MalformedIdentityError::new(key, "unparseable IP address"))?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| MalformedIdentityError::new(key, "unparseable port"))?;
            if port == 0 {
                return Err(MalformedIdentityError::new(key, "port must be non-zero"));
            }
            Ok(PeerAddress::Tcp { ip, port })
        } else {
            let ip: IpAddr = key
                .parse()
                .map_err(|_| MalformedIdentityError::new(key, "unparseable IP address"))?;
            Ok(PeerAddress::Udp { ip })
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            PeerAddress::Udp { ip } => *ip,
            PeerAddress::Tcp { ip, .. } => *ip,
        }
    }
}

// ── Identities ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PeerIdentityInner {
    key: String,
    addr: PeerAddress,
    is_local: bool,
}

/// Interned handle for a peer.
///
/// Cheap to clone; two handles compare equal iff they refer to the same
/// interned record, which the registry guarantees means the same key.
#[derive(Debug, Clone)]
pub struct PeerIdentity(Arc<PeerIdentityInner>);

impl PeerIdentity {
    pub fn key(&self) -> &str {
        &self.0.key
    }

    pub fn address(&self) -> PeerAddress {
        self.0.addr
    }

    pub fn is_local(&self) -> bool {
        self.0.is_local
    }

    /// True for peers that can accept a stream channel.
    pub fn is_stream_capable(&self) -> bool {
        matches!(self.0.addr, PeerAddress::Tcp { .. })
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for PeerIdentity {}

impl std::hash::Hash for PeerIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.key)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Lookup-or-create table of peer identities.
///
/// Explicitly constructed and passed by reference, never a process global;
/// tests build as many isolated registries as they need. Identities live as
/// long as the registry — there is no eviction.
pub struct IdentityRegistry {
    peers: DashMap<String, PeerIdentity>,
    local: PeerIdentity,
}

impl IdentityRegistry {
    /// Build a registry whose local identity has the given key.
    pub fn new(local_key: &str) -> Result<Self, MalformedIdentityError> {
        let addr = PeerAddress::from_key(local_key)?;
        let local = PeerIdentity(Arc::new(PeerIdentityInner {
            key: local_key.to_string(),
            addr,
            is_local: true,
        }));
        let peers = DashMap::new();
        peers.insert(local_key.to_string(), local.clone());
        Ok(IdentityRegistry { peers, local })
    }

    /// Return the identity for `key`, creating and interning it on first
    /// sight. The same key always yields the same handle.
    pub fn find_or_create(&self, key: &str) -> Result<PeerIdentity, MalformedIdentityError> {
        if let Some(existing) = self.peers.get(key) {
            return Ok(existing.clone());
        }
        let addr = PeerAddress::from_key(key)?;
        // Two threads can race to the entry; or_insert_with keeps exactly one.
        let entry = self.peers.entry(key.to_string()).or_insert_with(|| {
            PeerIdentity(Arc::new(PeerIdentityInner {
                key: key.to_string(),
                addr,
                is_local: false,
            }))
        });
        Ok(entry.clone())
    }

    /// Identity for a datagram source address (datagram-only key form).
    pub fn for_ip(&self, ip: IpAddr) -> Result<PeerIdentity, MalformedIdentityError> {
        self.find_or_create(&ip.to_string())
    }

    pub fn local(&self) -> PeerIdentity {
        self.local.clone()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// An identity key that cannot be parsed into a [`PeerAddress`].
/// Fatal to that identity's creation only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed peer key {key:?}: {reason}")]
pub struct MalformedIdentityError {
    pub key: String,
    pub reason: &'static str,
}

impl MalformedIdentityError {
    fn new(key: &str, reason: &'static str) -> Self {
        MalformedIdentityError {
            key: key.to_string(),
            reason,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
