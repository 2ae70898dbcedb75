//! Transport enum and internal backend trait.
//!
//! The public API is the [`Transport`] enum. Each backend lives in its own
//! module under `transport/` and implements the internal
//! [`TransportBackend`] trait; `enum_dispatch` forwards calls without
//! handwritten `match` boilerplate.
//!
//! A transport moves whole datagrams, each carrying exactly one encoded
//! frame. Socket I/O itself lives outside the runtime: a UDP framing
//! library pumps datagrams through a [`channel::ChannelTransport`].

use std::fmt;

use bytes::Bytes;
use enum_dispatch::enum_dispatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer or the local side closed the transport.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

#[enum_dispatch]
pub(crate) trait TransportBackend: Send + Sync + Clone + 'static {
    async fn send(&self, datagram: Bytes) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Bytes, TransportError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[enum_dispatch(TransportBackend)]
#[derive(Clone, Debug)]
pub enum Transport {
    Mem(mem::MemTransport),
    Channel(channel::ChannelTransport),
}

impl Transport {
    pub async fn send(&self, datagram: Bytes) -> Result<(), TransportError> {
        TransportBackend::send(self, datagram).await
    }

    pub async fn recv(&self) -> Result<Bytes, TransportError> {
        TransportBackend::recv(self).await
    }

    pub fn close(&self) {
        TransportBackend::close(self);
    }

    pub fn is_closed(&self) -> bool {
        TransportBackend::is_closed(self)
    }

    /// A connected in-process pair, for tests and loopback wiring.
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    /// A transport driven by an external datagram pump. The returned
    /// [`channel::TransportPump`] is the embedder's end: it injects
    /// received datagrams and drains outbound ones.
    pub fn channel() -> (Self, channel::TransportPump) {
        let (t, pump) = channel::ChannelTransport::endpoint();
        (Transport::Channel(t), pump)
    }
}

pub mod channel;
pub mod mem;
