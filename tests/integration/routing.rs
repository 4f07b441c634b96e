//! Datagram transport and router behavior over real loopback UDP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use vigil_core::config::{DatagramConfig, PartnerConfig, RouterConfig};
use vigil_core::identity::{IdentityRegistry, PeerIdentity};
use vigil_core::wire::{Envelope, EnvelopeKind, PROTOCOL_AUDIT};
use vigil_services::PartnerList;
use vigild::datagram::{DatagramTransport, ReceivedDatagram};
use vigild::dispatch::HandlerRegistry;
use vigild::router::{now_ms, EnvelopeHandler, Router};

/// A transport bound to an ephemeral unicast port, receivers running.
async fn spawn_transport(
    tweak: impl FnOnce(&mut DatagramConfig),
) -> (DatagramTransport, Arc<HandlerRegistry<ReceivedDatagram>>, u16, broadcast::Sender<()>) {
    let mut cfg = DatagramConfig {
        group: String::new(),
        unicast_port: 0,
        ..DatagramConfig::default()
    };
    tweak(&mut cfg);
    let handlers = Arc::new(HandlerRegistry::new());
    let transport = DatagramTransport::bind(cfg, "127.0.0.1".parse().unwrap(), handlers.clone())
        .await
        .unwrap();
    let port = transport.local_port().unwrap();
    let (shutdown, _) = broadcast::channel(1);
    transport.spawn_receivers(&shutdown);
    (transport, handlers, port, shutdown)
}

struct Capture {
    hits: AtomicUsize,
    tx: mpsc::UnboundedSender<(Envelope, String)>,
}

impl EnvelopeHandler for Capture {
    fn handle_envelope(&self, env: &Envelope, sender: &PeerIdentity) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send((env.clone(), sender.key().to_string()));
    }
}

fn poll_envelope(originator: &str) -> Envelope {
    Envelope {
        kind: EnvelopeKind::ContentPollCall,
        hop_count: 2,
        stop_time: now_ms() + 60_000,
        verifier: vigil_core::wire::random_verifier(),
        originator: originator.to_string(),
        payload: Bytes::from_static(b"vote with me"),
    }
}

/// An envelope unicast across loopback reaches the remote router exactly
/// once, surfaces the sender identity, and recruits the sender as a
/// partner; the duplicate is suppressed.
#[tokio::test]
async fn unicast_envelope_reaches_remote_router_once() {
    // receiver node
    let (_rcv_transport, rcv_handlers, rcv_port, _rcv_shutdown) = spawn_transport(|_| {}).await;
    // the receiver believes it lives elsewhere, so loopback traffic from
    // 127.0.0.1 is a real peer rather than itself
    let registry = Arc::new(IdentityRegistry::new("TCP:[10.0.0.2]:9729").unwrap());
    let partners = Arc::new(PartnerList::new(PartnerConfig::default()));
    // forwarding goes nowhere in this test; any bound transport will do
    let (fwd_transport, _fwd_handlers, _fwd_port, _fwd_shutdown) = spawn_transport(|_| {}).await;
    let router = Router::new(
        RouterConfig::default(),
        registry.clone(),
        partners.clone(),
        Arc::new(fwd_transport),
    );
    {
        let router = router.clone();
        rcv_handlers
            .register(PROTOCOL_AUDIT, Arc::new(move |dg| router.handle_datagram(dg)))
            .unwrap();
    }
    let (tx, mut rx) = mpsc::unbounded_channel();
    let capture = Arc::new(Capture {
        hits: AtomicUsize::new(0),
        tx,
    });
    router.register_handler(capture.clone());

    // sender node aims its unicasts at the receiver's port
    let (snd_transport, _snd_handlers, _snd_port, _snd_shutdown) =
        spawn_transport(|cfg| cfg.unicast_send_port = rcv_port).await;

    let env = poll_envelope("10.9.9.9");
    let encoded = env.encode().unwrap();
    snd_transport
        .send_unicast(PROTOCOL_AUDIT, &encoded, "127.0.0.1")
        .unwrap();

    let (got, sender_key) = timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("envelope never arrived")
        .unwrap();
    assert_eq!(got.payload, env.payload);
    assert_eq!(got.verifier, env.verifier);
    assert_eq!(sender_key, "127.0.0.1");
    assert!(
        partners.is_partner("127.0.0.1"),
        "unicast sender must become a partner"
    );

    // identical packet again: duplicate suppression eats it
    snd_transport
        .send_unicast(PROTOCOL_AUDIT, &encoded, "127.0.0.1")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(capture.hits.load(Ordering::Relaxed), 1);
}

/// Large payloads are gzip-wrapped on the wire and transparently
/// decompressed on receipt.
#[tokio::test]
async fn compressed_datagrams_round_trip() {
    let (_rcv_transport, rcv_handlers, rcv_port, _rcv_shutdown) = spawn_transport(|_| {}).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<ReceivedDatagram>();
    rcv_handlers
        .register(
            42,
            Arc::new(move |dg: ReceivedDatagram| {
                let _ = tx.send(dg);
            }),
        )
        .unwrap();

    let (snd_transport, _h, _p, _s) = spawn_transport(|cfg| {
        cfg.unicast_send_port = rcv_port;
        cfg.compress = true;
        cfg.compress_min = 64;
    })
    .await;

    let body = vec![0x42u8; 8 * 1024];
    snd_transport.send_unicast(42, &body, "127.0.0.1").unwrap();

    let got = timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("datagram never arrived")
        .unwrap();
    assert_eq!(got.protocol, 42);
    assert_eq!(&got.payload[..], &body[..]);
    assert!(!got.multicast);
}

/// With multicast muzzled from the start, normally-multicast packets are
/// looped back to local handlers instead of being sent into a void.
#[tokio::test]
async fn muzzled_multicast_loops_back_locally() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();

    let (transport, handlers, _port, _shutdown) = spawn_transport(|cfg| {
        cfg.group = "239.64.8.33".to_string();
        cfg.multicast_muzzle_after_ms = 0;
        cfg.loopback_if_muzzled = true;
    })
    .await;
    handlers
        .register(
            PROTOCOL_AUDIT,
            Arc::new(move |dg: ReceivedDatagram| {
                seen2.lock().unwrap().push(dg);
            }),
        )
        .unwrap();

    transport
        .send_multicast(PROTOCOL_AUDIT, b"beacon body")
        .unwrap();

    let got = seen.lock().unwrap();
    assert_eq!(got.len(), 1, "muzzled send must be looped back");
    assert_eq!(&got[0].payload[..], b"beacon body");
    assert!(!got[0].multicast);
}
