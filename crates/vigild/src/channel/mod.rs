//! Peer channels — one stateful, framed stream connection per peer.
//!
//! Channels are ephemeral, coming and going as needed. Each open channel
//! runs one reader task and one writer task; both park on their socket half
//! (or the send queue) and are cancelled by the channel's closed signal,
//! which also closes the underlying socket. A message leaves the FIFO send
//! queue only once its bytes are fully written (a failed write puts it
//! back at the front), so an aborted channel hands its unsent tail back to
//! the pool for retry.

mod state;

pub use state::{ChannelState, StateCell, STOP_IGNORE};

use std::collections::VecDeque;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;

use vigil_core::identity::{MalformedIdentityError, PeerAddress, PeerIdentity};
use vigil_core::message::PeerMessage;
use vigil_core::wire::{Opcode, StreamHeader, WireError, HEADER_LEN, MAX_PEERID_LEN};

use crate::pool::CommCore;

const COPY_BUFFER_SIZE: usize = 4096;

/// A violation of the stream protocol. Aborts the offending channel,
/// never the process or any other channel.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("didn't receive peer id first: {0:?}")]
    NoHandshake(Opcode),

    #[error("bad peer id length: {0}")]
    BadPeerIdLength(usize),

    #[error("peer id is not UTF-8")]
    PeerIdNotUtf8,

    #[error("peer id does not parse: {0}")]
    BadPeerId(#[from] MalformedIdentityError),

    #[error("peer {0} has no stream address")]
    NotStreamCapable(String),

    #[error("conflicting peer id: got {got}, channel bound to {bound}")]
    PeerMismatch { got: String, bound: String },

    #[error("too-large incoming message: {0}")]
    Oversize(u64),

    #[error(transparent)]
    Frame(#[from] WireError),
}

/// Per-channel traffic counters.
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub msgs_in: AtomicU64,
    pub msgs_out: AtomicU64,
}

pub struct Channel {
    comm: Arc<CommCore>,
    state: StateCell,
    /// Known from creation for originating channels; learned from the
    /// handshake for accepted ones.
    peer: Mutex<Option<PeerIdentity>>,
    remote: Mutex<Option<SocketAddr>>,
    originate: bool,

    queue: Mutex<VecDeque<PeerMessage>>,
    queue_notify: Notify,

    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,

    epoch: Instant,
    last_send_ms: AtomicU64,
    last_rcv_ms: AtomicU64,
    last_active_ms: AtomicU64,

    send_cnt: AtomicUsize,
    did_open: AtomicBool,
    connect_refused: AtomicBool,

    pub stats: ChannelStats,
}

impl Channel {
    fn new(comm: Arc<CommCore>, peer: Option<PeerIdentity>, originate: bool) -> Arc<Self> {
        let initial = if originate {
            ChannelState::Init
        } else {
            ChannelState::Accepted
        };
        let (closed_tx, closed_rx) = watch::channel(false);
        Arc::new(Channel {
            comm,
            state: StateCell::new(initial),
            peer: Mutex::new(peer),
            remote: Mutex::new(None),
            originate,
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            closed_tx,
            closed_rx,
            epoch: Instant::now(),
            last_send_ms: AtomicU64::new(0),
            last_rcv_ms: AtomicU64::new(0),
            last_active_ms: AtomicU64::new(0),
            send_cnt: AtomicUsize::new(0),
            did_open: AtomicBool::new(false),
            connect_refused: AtomicBool::new(false),
            stats: ChannelStats::default(),
        })
    }

    /// Channel that will connect out to `peer` when started.
    pub(crate) fn originate(comm: Arc<CommCore>, peer: PeerIdentity) -> Arc<Self> {
        Self::new(comm, Some(peer), true)
    }

    /// Channel for an accepted connection whose peer is not yet known.
    pub(crate) fn incoming(comm: Arc<CommCore>) -> Arc<Self> {
        Self::new(comm, None, false)
    }

    pub fn peer(&self) -> Option<PeerIdentity> {
        self.peer.lock().unwrap().clone()
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub fn is_originate(&self) -> bool {
        self.originate
    }

    /// (last send, last receive, last activity), in ms since the channel
    /// was created; zero means never.
    pub fn activity_times(&self) -> (u64, u64, u64) {
        (
            self.last_send_ms.load(Ordering::Relaxed),
            self.last_rcv_ms.load(Ordering::Relaxed),
            self.last_active_ms.load(Ordering::Relaxed),
        )
    }

    // ── Entry points from the pool ────────────────────────────────────────

    /// Spawn the connector task. Fails synchronously if the peer has no
    /// stream address.
    pub(crate) fn start_originate(self: Arc<Self>) -> Result<(), crate::pool::SendError> {
        let peer = self.peer().expect("originating channel always has a peer");
        let addr = match peer.address() {
            PeerAddress::Tcp { ip, port } => SocketAddr::new(ip, port),
            PeerAddress::Udp { .. } => {
                return Err(crate::pool::SendError::NoStreamAddress(peer.key().to_string()))
            }
        };
        if self.state.state_trans(ChannelState::Init, ChannelState::Connecting) {
            let this = self.clone();
            tokio::spawn(async move { this.run_connector(addr).await });
        }
        Ok(())
    }

    /// Start reader/writer for an accepted connection.
    pub(crate) fn start_incoming(self: Arc<Self>, stream: TcpStream) {
        *self.remote.lock().unwrap() = stream.peer_addr().ok();
        if self
            .state
            .state_trans(ChannelState::Accepted, ChannelState::Starting)
        {
            self.start_connected(stream);
        }
    }

    /// Enqueue a message for delivery. Returns the message back when this
    /// channel cannot take it (closing, failed, or draining input).
    pub(crate) fn send(&self, msg: PeerMessage) -> Result<(), PeerMessage> {
        // holding the state lock across the enqueue keeps the message out
        // of a queue that stop() has already drained
        let result = self.state.with_state(|st| match st {
            ChannelState::Closed
            | ChannelState::Closing
            | ChannelState::ConnectFail
            | ChannelState::DrainInput => Err(msg),
            _ => {
                self.queue.lock().unwrap().push_back(msg);
                self.send_cnt.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });
        if result.is_ok() {
            self.queue_notify.notify_one();
        }
        result
    }

    /// Adopt messages held by the pool while no channel existed. Goes
    /// through [`send`](Self::send) so a channel that died in the meantime
    /// refuses them and they stay held.
    pub(crate) fn adopt_queue(&self, held: &mut VecDeque<PeerMessage>) {
        if held.is_empty() {
            return;
        }
        tracing::debug!(count = held.len(), "adopting held messages");
        while let Some(msg) = held.pop_front() {
            if let Err(refused) = self.send(msg) {
                held.push_front(refused);
                return;
            }
        }
    }

    /// True if this channel was created to originate and never accepted a
    /// message — i.e. it failed before being useful.
    pub(crate) fn is_unused_originating_channel(&self) -> bool {
        self.originate && self.send_cnt.load(Ordering::Relaxed) == 0
    }

    /// Worth requeueing unsent messages? True if the connection ever
    /// opened, or failed with a socket-level error rather than a timeout.
    pub(crate) fn should_retry(&self) -> bool {
        self.did_open.load(Ordering::Relaxed) || self.connect_refused.load(Ordering::Relaxed)
    }

    /// Called periodically by the pool: abort a channel that has queued
    /// sends but no socket activity past the hung threshold.
    pub(crate) fn check_hung(&self) {
        let st = self.state.get();
        let last_active = self.last_active_ms.load(Ordering::Relaxed);
        if (st == ChannelState::Open || st == ChannelState::DrainOutput)
            && last_active != 0
            && !self.queue.lock().unwrap().is_empty()
            && self.now_ms().saturating_sub(last_active) > self.comm.cfg.channel_hung_ms
        {
            self.abort("hung sending");
        }
    }

    // ── Lifecycle internals ───────────────────────────────────────────────

    async fn run_connector(self: Arc<Self>, addr: SocketAddr) {
        let connect_timeout = Duration::from_millis(self.comm.cfg.connect_timeout_ms);
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                self.did_open.store(true, Ordering::Relaxed);
                stream.set_nodelay(true).ok();
                *self.remote.lock().unwrap() = stream.peer_addr().ok();
                tracing::debug!(peer = %self.p(), "connected");
                if self
                    .state
                    .state_trans(ChannelState::Connecting, ChannelState::Starting)
                {
                    self.clone().start_connected(stream);
                }
                // else: aborted while connecting; dropping the stream closes it
            }
            Ok(Err(e)) => {
                self.connect_refused.store(true, Ordering::Relaxed);
                self.state
                    .state_trans(ChannelState::Connecting, ChannelState::ConnectFail);
                self.stop(true, Some(&format!("connect failed to {addr}: {e}")));
            }
            Err(_) => {
                self.state
                    .state_trans(ChannelState::Connecting, ChannelState::ConnectFail);
                self.stop(true, Some(&format!("connect to {addr} timed out")));
            }
        }
    }

    fn start_connected(self: Arc<Self>, stream: TcpStream) {
        let (rd, wr) = stream.into_split();
        if !self
            .state
            .state_trans(ChannelState::Starting, ChannelState::Open)
        {
            return;
        }
        let reader = self.clone();
        tokio::spawn(async move { reader.run_reader(rd).await });
        let writer = self.clone();
        tokio::spawn(async move { writer.run_writer(wr).await });
    }

    pub(crate) fn abort(&self, reason: &str) {
        self.stop(true, Some(reason));
    }

    /// Move to `Closing`/`Closed`, hand unsent messages back to the pool,
    /// and wake both I/O tasks so the socket halves drop.
    pub(crate) fn stop(&self, abort: bool, reason: Option<&str>) {
        if !self.state.not_state_trans(STOP_IGNORE, ChannelState::Closing) {
            return;
        }
        if let Some(msg) = reason {
            if abort {
                tracing::warn!(peer = %self.p(), "aborting channel: {msg}");
            } else {
                tracing::debug!(peer = %self.p(), "closing channel: {msg}");
            }
        }
        let unsent = std::mem::take(&mut *self.queue.lock().unwrap());
        let peer = self.peer();
        self.comm
            .dissociate_channel(self, peer.as_ref(), unsent, self.should_retry());
        let _ = self.closed_tx.send(true);
        self.queue_notify.notify_one();
        tracing::debug!(
            peer = %self.p(),
            msgs_in = self.stats.msgs_in.load(Ordering::Relaxed),
            msgs_out = self.stats.msgs_out.load(Ordering::Relaxed),
            bytes_in = self.stats.bytes_in.load(Ordering::Relaxed),
            bytes_out = self.stats.bytes_out.load(Ordering::Relaxed),
            "channel closed"
        );
        self.state
            .state_trans(ChannelState::Closing, ChannelState::Closed);
    }

    // ── Reader side ───────────────────────────────────────────────────────

    async fn run_reader(self: Arc<Self>, mut rd: OwnedReadHalf) {
        let mut closed = self.closed_rx.clone();
        if *closed.borrow() {
            return;
        }
        let this = self.clone();
        let result = tokio::select! {
            _ = closed.changed() => Ok(()),
            r = this.handle_input(&mut rd) => r,
        };
        if let Err(e) = result {
            if self.state.is_closed() {
                // expected when the socket is torn down under us
                self.stop(true, None);
            } else {
                self.abort(&format!("read: {e:#}"));
            }
        }
    }

    async fn handle_input(self: Arc<Self>, rd: &mut OwnedReadHalf) -> anyhow::Result<()> {
        let drain_time = Duration::from_millis(self.comm.cfg.drain_input_ms);
        loop {
            let header = if self.state.is(ChannelState::DrainInput) {
                match timeout(drain_time, self.read_header(rd)).await {
                    Ok(r) => r?,
                    Err(_) => bail!("drain input timed out"),
                }
            } else {
                self.read_header(rd).await?
            };

            let Some(hdr) = header else {
                // input closed by peer; drain output if necessary
                let send_idle = self.queue.lock().unwrap().is_empty();
                if !send_idle
                    && self
                        .state
                        .state_trans(ChannelState::Open, ChannelState::DrainOutput)
                {
                    tracing::debug!(peer = %self.p(), "peer closed input, draining output");
                    self.queue_notify.notify_one();
                } else {
                    tracing::debug!(peer = %self.p(), "input closed");
                    self.stop(false, None);
                }
                return Ok(());
            };

            if self.peer().is_none() && hdr.op != Opcode::PeerId {
                return Err(ProtocolError::NoHandshake(hdr.op).into());
            }
            match hdr.op {
                Opcode::PeerId => self.read_peer_id(rd, hdr, &self).await?,
                Opcode::Data => self.read_data_msg(rd, hdr).await?,
            }
        }
    }

    /// Read one message header. `Ok(None)` on clean EOF before any bytes.
    async fn read_header(&self, rd: &mut OwnedReadHalf) -> anyhow::Result<Option<StreamHeader>> {
        let mut buf = [0u8; HEADER_LEN];
        let n = rd.read(&mut buf[..1]).await?;
        if n == 0 {
            return Ok(None);
        }
        rd.read_exact(&mut buf[1..])
            .await
            .context("connection closed in middle of header")?;
        self.touch_rcv();
        self.stats
            .bytes_in
            .fetch_add(HEADER_LEN as u64, Ordering::Relaxed);
        Ok(Some(StreamHeader::decode(&buf).map_err(ProtocolError::Frame)?))
    }

    /// Read a peer id message, verify it, and associate with the pool.
    async fn read_peer_id(
        &self,
        rd: &mut OwnedReadHalf,
        hdr: StreamHeader,
        chan: &Arc<Self>,
    ) -> anyhow::Result<()> {
        let len = hdr.len as usize;
        if len == 0 || len > MAX_PEERID_LEN {
            return Err(ProtocolError::BadPeerIdLength(len).into());
        }
        let mut buf = [0u8; MAX_PEERID_LEN];
        rd.read_exact(&mut buf[..len])
            .await
            .context("connection closed in peer id message")?;
        self.touch_rcv();
        let key = std::str::from_utf8(&buf[..len]).map_err(|_| ProtocolError::PeerIdNotUtf8)?;
        let pid = self
            .comm
            .registry
            .find_or_create(key)
            .map_err(ProtocolError::BadPeerId)?;

        let previous = {
            let mut guard = self.peer.lock().unwrap();
            match &*guard {
                None => {
                    *guard = Some(pid.clone());
                    None
                }
                Some(existing) => Some(existing.clone()),
            }
        };
        match previous {
            None => {
                tracing::debug!(peer = %pid, "handshake complete");
                if !pid.is_stream_capable() {
                    return Err(ProtocolError::NotStreamCapable(pid.key().to_string()).into());
                }
                if self.state.is(ChannelState::Open) && !self.originate {
                    // unassociated incoming channel; the pool decides
                    // whether we become primary or secondary
                    self.comm.associate_channel(chan, &pid);
                }
            }
            Some(existing) if existing != pid => {
                return Err(ProtocolError::PeerMismatch {
                    got: pid.key().to_string(),
                    bound: existing.key().to_string(),
                }
                .into());
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Read a data message into a new PeerMessage and hand it up.
    async fn read_data_msg(&self, rd: &mut OwnedReadHalf, hdr: StreamHeader) -> anyhow::Result<()> {
        let len = u64::from(hdr.len);
        if len > self.comm.cfg.max_message_size {
            return Err(ProtocolError::Oversize(len).into());
        }
        let mut msg = PeerMessage::with_estimated_size(
            hdr.protocol,
            len,
            self.comm.cfg.min_file_message_size,
            &self.comm.cfg.message_dir,
        )?;
        let mut buf = [0u8; COPY_BUFFER_SIZE];
        let mut rem = len;
        while rem > 0 {
            let take = rem.min(COPY_BUFFER_SIZE as u64) as usize;
            rd.read_exact(&mut buf[..take])
                .await
                .context("connection closed in middle of message")?;
            msg.append(&buf[..take])?;
            self.touch_rcv();
            self.stats.bytes_in.fetch_add(take as u64, Ordering::Relaxed);
            rem -= take as u64;
        }
        msg.finish()?;

        let peer = self.peer().expect("handshake precedes data");
        msg.set_sender(peer.clone());
        if self.comm.receive_allowed(&peer) {
            self.stats.msgs_in.fetch_add(1, Ordering::Relaxed);
            self.comm.deliver_received(msg);
        } else {
            tracing::debug!(peer = %peer, "receive rate limited, dropping message");
            msg.delete();
        }
        Ok(())
    }

    // ── Writer side ───────────────────────────────────────────────────────

    async fn run_writer(self: Arc<Self>, mut wr: OwnedWriteHalf) {
        let mut closed = self.closed_rx.clone();
        if *closed.borrow() {
            return;
        }
        let this = self.clone();
        let result = tokio::select! {
            _ = closed.changed() => Ok(()),
            r = this.handle_output(&mut wr) => r,
        };
        if let Err(e) = result {
            if self.state.is_closed() {
                // stop() already drained the queue; hand back anything we
                // re-queued after that, so no message strands here
                let leftovers = std::mem::take(&mut *self.queue.lock().unwrap());
                if !leftovers.is_empty() {
                    self.comm.dissociate_channel(
                        &self,
                        self.peer().as_ref(),
                        leftovers,
                        self.should_retry(),
                    );
                }
            } else {
                self.abort(&format!("write: {e:#}"));
            }
        }
    }

    /// Send the peer id first, then drain the queue as messages arrive,
    /// observing the idle-close deadline between messages.
    async fn handle_output(self: Arc<Self>, wr: &mut OwnedWriteHalf) -> anyhow::Result<()> {
        self.write_peer_id(wr).await?;
        loop {
            let next = self.queue.lock().unwrap().pop_front();
            if let Some(mut msg) = next {
                self.touch_send();
                msg.note_retry();
                if let Err(e) = self.write_data_msg(&mut msg, wr).await {
                    // leave it at the front so the abort path requeues it
                    msg.rewind();
                    self.queue.lock().unwrap().push_front(msg);
                    return Err(e);
                }
                self.stats.msgs_out.fetch_add(1, Ordering::Relaxed);
                msg.delete();
                self.touch_send();
                continue;
            }

            // queue empty: a draining channel has nothing left to flush
            if self.state.is(ChannelState::DrainOutput) {
                self.stop(false, Some("output drained"));
                return Ok(());
            }

            if self.send_idle_past_deadline() {
                if self
                    .state
                    .not_state_trans(STOP_IGNORE, ChannelState::DrainInput)
                {
                    tracing::debug!(peer = %self.p(), "idle, half-closing output");
                    // can no longer send, so the pool must stop routing to us
                    self.comm.dissociate_channel(
                        &self,
                        self.peer().as_ref(),
                        VecDeque::new(),
                        false,
                    );
                    self.comm.note_draining(&self);
                    self.clone().spawn_drain_closer();
                    wr.shutdown().await.ok();
                }
                return Ok(());
            }

            let wait = self.calc_send_wait();
            let _ = timeout(wait, self.queue_notify.notified()).await;
        }
    }

    async fn write_peer_id(&self, wr: &mut OwnedWriteHalf) -> anyhow::Result<()> {
        let key = self.comm.registry.local().key().to_string();
        tracing::trace!(peer = %self.p(), local = %key, "sending peer id");
        let hdr = StreamHeader {
            op: Opcode::PeerId,
            len: key.len() as u32,
            protocol: 0,
        };
        wr.write_all(&hdr.encode()).await?;
        wr.write_all(key.as_bytes()).await?;
        wr.flush().await?;
        self.stats
            .bytes_out
            .fetch_add((HEADER_LEN + key.len()) as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn write_data_msg(
        &self,
        msg: &mut PeerMessage,
        wr: &mut OwnedWriteHalf,
    ) -> anyhow::Result<()> {
        let len = msg.data_size();
        tracing::trace!(peer = %self.p(), protocol = msg.protocol(), len, "sending data");
        let hdr = StreamHeader {
            op: Opcode::Data,
            len: len as u32,
            protocol: msg.protocol(),
        };
        wr.write_all(&hdr.encode()).await?;

        let mut reader = msg.reader()?;
        let mut buf = [0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            wr.write_all(&buf[..n]).await?;
            self.touch_send();
            self.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        }
        wr.flush().await?;
        Ok(())
    }

    /// Abort a channel stuck in DrainInput once the drain window passes
    /// with no traffic.
    fn spawn_drain_closer(self: Arc<Self>) {
        let this = self;
        tokio::spawn(async move {
            let drain = Duration::from_millis(this.comm.cfg.drain_input_ms);
            loop {
                tokio::time::sleep(drain / 2).await;
                if !this.state.is(ChannelState::DrainInput) {
                    return;
                }
                let idle = this
                    .now_ms()
                    .saturating_sub(this.last_active_ms.load(Ordering::Relaxed));
                if idle > this.comm.cfg.drain_input_ms {
                    this.abort("drain input expired");
                    return;
                }
            }
        });
    }

    // ── Timers ────────────────────────────────────────────────────────────

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch_send(&self) {
        let now = self.now_ms().max(1);
        self.last_send_ms.store(now, Ordering::Relaxed);
        self.last_active_ms.store(now, Ordering::Relaxed);
    }

    fn touch_rcv(&self) {
        let now = self.now_ms().max(1);
        self.last_rcv_ms.store(now, Ordering::Relaxed);
        self.last_active_ms.store(now, Ordering::Relaxed);
    }

    fn send_idle_past_deadline(&self) -> bool {
        if !self.queue.lock().unwrap().is_empty() {
            return false;
        }
        // a channel that never saw traffic idles out from its creation time
        let base = self.last_active_ms.load(Ordering::Relaxed);
        self.now_ms().saturating_sub(base) > self.comm.cfg.channel_idle_ms
    }

    /// Sleep long enough to notice the idle deadline, bounded by the send
    /// wakeup so a busy peer cannot postpone the check forever.
    fn calc_send_wait(&self) -> Duration {
        let idle = self.comm.cfg.channel_idle_ms;
        let base = self.last_active_ms.load(Ordering::Relaxed);
        let elapsed = self.now_ms().saturating_sub(base);
        let until_idle = idle.saturating_sub(elapsed).max(10);
        Duration::from_millis(until_idle.min(self.comm.cfg.send_wakeup_ms))
    }

    // for logging convenience
    fn p(&self) -> String {
        match self.peer() {
            Some(peer) => peer.key().to_string(),
            None => match *self.remote.lock().unwrap() {
                Some(addr) => format!("(conn from {addr})"),
                None => "(unknown)".to_string(),
            },
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Chan({:?}): {}]", self.state.get(), self.p())
    }
}
