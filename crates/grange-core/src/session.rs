use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{UserIdentity, Zone};

/// Monotonic microseconds since process start. Used for heartbeat
/// timestamps and idle accounting; never compared across processes.
pub fn monotonic_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// Handshake state machine position of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Client side, before the handshake is sent.
    Init,
    /// Server side, awaiting the client's handshake.
    WaitingHandshake,
    /// Client side, handshake sent, awaiting acknowledgement.
    WaitingAck,
    /// Both sides: traffic flows.
    Ready,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::WaitingHandshake => "waiting-handshake",
            SessionState::WaitingAck => "waiting-ack",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    /// A session's identity is set exactly once and never changes.
    IdentityAlreadyBound,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidTransition { from, to } => {
                write!(f, "invalid session transition {} -> {}", from, to)
            }
            SessionError::IdentityAlreadyBound => {
                write!(f, "session identity is already bound")
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// What an incoming heartbeat turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatDisposition {
    /// A beat initiated by the peer; the session should echo it back.
    Fresh,
    /// The echo of a beat this session sent; carries the measured rtt.
    Echo { rtt_micros: u64 },
    /// A timestamp this session already echoed once. Never echoed again,
    /// so a delayed echo cannot ping-pong between two peers forever.
    Stale,
}

/// Authenticated per-peer session state shared by the client and server
/// runtimes. The surrounding runtime owns the transport; this struct owns
/// the handshake state, the bound identity, and liveness bookkeeping.
pub struct Session {
    state: Mutex<SessionState>,
    peer_id: Mutex<Option<String>>,
    identity: OnceLock<Arc<UserIdentity>>,
    features: Mutex<BTreeSet<String>>,
    zone: Mutex<Option<Zone>>,
    established_at: Mutex<Option<Instant>>,
    last_seen_at: Mutex<Instant>,
    last_beat_sent: AtomicU64,
    last_echo_sent: AtomicU64,
    rtt_micros: AtomicU64,
}

impl Session {
    /// A client-side session, starting in `Init`.
    pub fn client() -> Self {
        Self::with_state(SessionState::Init)
    }

    /// A server-side session, starting in `WaitingHandshake`.
    pub fn server() -> Self {
        Self::with_state(SessionState::WaitingHandshake)
    }

    fn with_state(state: SessionState) -> Self {
        Session {
            state: Mutex::new(state),
            peer_id: Mutex::new(None),
            identity: OnceLock::new(),
            features: Mutex::new(BTreeSet::new()),
            zone: Mutex::new(None),
            established_at: Mutex::new(None),
            last_seen_at: Mutex::new(Instant::now()),
            last_beat_sent: AtomicU64::new(0),
            last_echo_sent: AtomicU64::new(0),
            rtt_micros: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Advances the state machine. Closing is always permitted and
    /// idempotent; every other edge is validated.
    pub fn transition(&self, to: SessionState) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let from = *state;
        let ok = matches!(
            (from, to),
            (SessionState::Init, SessionState::WaitingAck)
                | (SessionState::WaitingAck, SessionState::Ready)
                | (SessionState::WaitingHandshake, SessionState::Ready)
                | (_, SessionState::Closed)
        );
        if !ok {
            return Err(SessionError::InvalidTransition { from, to });
        }
        if to == SessionState::Ready {
            *self.established_at.lock() = Some(Instant::now());
        }
        *state = to;
        Ok(())
    }

    /// Closes the session. Returns `true` if this call did the closing.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Closed {
            return false;
        }
        *state = SessionState::Closed;
        true
    }

    /// Binds the authenticated identity. Fails on the second attempt; a
    /// session has exactly one identity for its lifetime.
    pub fn bind_identity(&self, identity: Arc<UserIdentity>) -> Result<(), SessionError> {
        self.identity
            .set(identity)
            .map_err(|_| SessionError::IdentityAlreadyBound)
    }

    pub fn identity(&self) -> Option<Arc<UserIdentity>> {
        self.identity.get().cloned()
    }

    pub fn set_peer_id(&self, peer: impl Into<String>) {
        *self.peer_id.lock() = Some(peer.into());
    }

    pub fn peer_id(&self) -> Option<String> {
        self.peer_id.lock().clone()
    }

    pub fn set_features(&self, features: BTreeSet<String>) {
        *self.features.lock() = features;
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.lock().contains(feature)
    }

    pub fn set_zone(&self, zone: Option<Zone>) {
        *self.zone.lock() = zone;
    }

    pub fn zone(&self) -> Option<Zone> {
        *self.zone.lock()
    }

    pub fn established_at(&self) -> Option<Instant> {
        *self.established_at.lock()
    }

    /// Resets the liveness clock. Called on every inbound frame.
    pub fn mark_seen(&self) {
        *self.last_seen_at.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen_at.lock().elapsed()
    }

    /// Records the timestamp of a heartbeat this session just emitted.
    pub fn note_heartbeat_sent(&self, timestamp_micros: u64) {
        self.last_beat_sent
            .store(timestamp_micros, Ordering::Relaxed);
    }

    /// Classifies an incoming heartbeat and resets the liveness clock.
    ///
    /// A beat echoing our own timestamp closes the round-trip and updates
    /// the smoothed rtt; anything else is a peer-initiated beat the caller
    /// should echo.
    pub fn observe_heartbeat(&self, timestamp_micros: u64) -> HeartbeatDisposition {
        self.mark_seen();
        let sent = self.last_beat_sent.load(Ordering::Relaxed);
        if sent != 0 && sent == timestamp_micros {
            let sample = monotonic_micros().saturating_sub(timestamp_micros);
            let prior = self.rtt_micros.load(Ordering::Relaxed);
            let smoothed = if prior == 0 {
                sample
            } else {
                // EWMA with alpha 1/8.
                prior - prior / 8 + sample / 8
            };
            self.rtt_micros.store(smoothed, Ordering::Relaxed);
            return HeartbeatDisposition::Echo {
                rtt_micros: sample,
            };
        }
        // One echo per timestamp.
        if self.last_echo_sent.swap(timestamp_micros, Ordering::Relaxed) == timestamp_micros {
            HeartbeatDisposition::Stale
        } else {
            HeartbeatDisposition::Fresh
        }
    }

    /// Smoothed round-trip time, if any heartbeat echo has completed.
    pub fn rtt(&self) -> Option<Duration> {
        match self.rtt_micros.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }
}
