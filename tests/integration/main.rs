//! Vigil integration test harness.
//!
//! Tests run fully in-process over loopback sockets: each `TestNode` is a
//! live channel pool with its own identity registry and accept loop on an
//! ephemeral port. Raw-socket fake peers are used where a test needs to
//! observe or script the wire protocol directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use vigil_core::config::StreamConfig;
use vigil_core::identity::{IdentityRegistry, PeerIdentity};
use vigil_core::message::PeerMessage;
use vigil_core::wire::{StreamHeader, HEADER_LEN};
use vigild::pool::ChannelManager;

mod channels;
mod routing;

/// A running channel pool bound to an ephemeral loopback port.
pub struct TestNode {
    pub manager: ChannelManager,
    pub registry: Arc<IdentityRegistry>,
    pub local_key: String,
    pub received: mpsc::UnboundedReceiver<PeerMessage>,
    pub shutdown: broadcast::Sender<()>,
}

impl TestNode {
    /// Identity of another node, interned in this node's registry.
    pub fn peer(&self, other_key: &str) -> PeerIdentity {
        self.registry.find_or_create(other_key).unwrap()
    }

    /// Receive the next message or panic after a generous deadline.
    pub async fn recv(&mut self) -> PeerMessage {
        timeout(Duration::from_secs(10), self.received.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("receive queue closed")
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        self.manager.stop_all();
    }
}

/// Spawn a node, letting the caller adjust stream config before start.
pub async fn spawn_node(tweak: impl FnOnce(&mut StreamConfig)) -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let local_key = format!("TCP:[127.0.0.1]:{port}");
    let registry = Arc::new(IdentityRegistry::new(&local_key).unwrap());

    let mut cfg = StreamConfig {
        message_dir: std::env::temp_dir().join("vigil-integration"),
        ..StreamConfig::default()
    };
    tweak(&mut cfg);

    let (manager, received) = ChannelManager::new(cfg, registry.clone());
    let (shutdown, _) = broadcast::channel(1);

    {
        let manager = manager.clone();
        let shutdown = shutdown.subscribe();
        tokio::spawn(async move { manager.run_listener(listener, shutdown).await });
    }

    TestNode {
        manager,
        registry,
        local_key,
        received,
        shutdown,
    }
}

/// Read one framed message off a raw socket: header plus payload.
pub async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<(StreamHeader, Vec<u8>)> {
    let mut hdr_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut hdr_buf).await?;
    let hdr = StreamHeader::decode(&hdr_buf)?;
    let mut payload = vec![0u8; hdr.len as usize];
    stream.read_exact(&mut payload).await?;
    Ok((hdr, payload))
}

/// Drain a message's payload.
pub fn payload_of(msg: &mut PeerMessage) -> Vec<u8> {
    use std::io::Read;
    let mut out = Vec::new();
    msg.reader().unwrap().read_to_end(&mut out).unwrap();
    out
}
