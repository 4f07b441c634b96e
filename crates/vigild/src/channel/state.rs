//! Channel state tracking.
//!
//! The state cell has its own lock, separate from the send-queue lock, so
//! application sends are never serialized behind state-transition
//! bookkeeping. All transitions go through compare-and-set helpers; there
//! is no way to write the state unconditionally.

use std::sync::Mutex;
use std::time::Instant;

/// Lifecycle of a peer channel. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Connecting,
    ConnectFail,
    Accepted,
    Starting,
    Open,
    /// Output half-closed by local idle policy; still reading in case the
    /// peer is mid-send.
    DrainInput,
    /// Peer closed its write side; flushing our remaining queue.
    DrainOutput,
    Closing,
    Closed,
}

/// States in which a stop request is a no-op.
pub const STOP_IGNORE: &[ChannelState] =
    &[ChannelState::Init, ChannelState::Closing, ChannelState::Closed];

struct Inner {
    state: ChannelState,
    prev: ChannelState,
    last_change: Instant,
}

/// Mutex-guarded channel state with compare-and-set transitions.
pub struct StateCell {
    inner: Mutex<Inner>,
}

impl StateCell {
    pub fn new(initial: ChannelState) -> Self {
        StateCell {
            inner: Mutex::new(Inner {
                state: initial,
                prev: initial,
                last_change: Instant::now(),
            }),
        }
    }

    pub fn get(&self) -> ChannelState {
        self.inner.lock().unwrap().state
    }

    pub fn prev(&self) -> ChannelState {
        self.inner.lock().unwrap().prev
    }

    pub fn is(&self, state: ChannelState) -> bool {
        self.get() == state
    }

    /// True in `Closing` or `Closed`.
    pub fn is_closed(&self) -> bool {
        matches!(self.get(), ChannelState::Closing | ChannelState::Closed)
    }

    /// If currently in `from`, transition to `to` and return true.
    pub fn state_trans(&self, from: ChannelState, to: ChannelState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == from {
            set(&mut inner, to);
            true
        } else {
            false
        }
    }

    /// If currently in none of `not_from`, transition to `to` and return
    /// true.
    pub fn not_state_trans(&self, not_from: &[ChannelState], to: ChannelState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if not_from.contains(&inner.state) {
            false
        } else {
            set(&mut inner, to);
            true
        }
    }

    pub fn last_change(&self) -> Instant {
        self.inner.lock().unwrap().last_change
    }

    /// Run `f` with the current state while the state lock is held, so the
    /// decision and its consequence are atomic against transitions.
    pub fn with_state<R>(&self, f: impl FnOnce(ChannelState) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        f(inner.state)
    }
}

fn set(inner: &mut Inner, to: ChannelState) {
    if inner.state != to {
        tracing::trace!(from = ?inner.state, to = ?to, "channel state");
        inner.prev = inner.state;
        inner.last_change = Instant::now();
    }
    inner.state = to;
}
