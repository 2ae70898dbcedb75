use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{TransportBackend, TransportError};

const CHANNEL_CAPACITY: usize = 256;

/// The embedder's end of a [`ChannelTransport`].
///
/// Whatever does the socket work (a UDP framing library, a relay, a test
/// harness) holds this: datagrams read off the wire go into `inbound`,
/// and datagrams the runtime sends are drained from `outbound`.
pub struct TransportPump {
    pub inbound: mpsc::Sender<Bytes>,
    pub outbound: mpsc::Receiver<Bytes>,
}

/// Transport backend fed by an external datagram pump.
#[derive(Clone, Debug)]
pub struct ChannelTransport {
    inner: Arc<ChannelInner>,
}

#[derive(Debug)]
struct ChannelInner {
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn endpoint() -> (Self, TransportPump) {
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let transport = ChannelTransport {
            inner: Arc::new(ChannelInner {
                tx: out_tx,
                rx: tokio::sync::Mutex::new(in_rx),
                closed: AtomicBool::new(false),
            }),
        };
        let pump = TransportPump {
            inbound: in_tx,
            outbound: out_rx,
        };
        (transport, pump)
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for ChannelTransport {
    async fn send(&self, datagram: Bytes) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        self.inner
            .tx
            .send(datagram)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;

    #[tokio::test]
    async fn pump_feeds_the_transport() {
        let (t, mut pump) = Transport::channel();

        pump.inbound.send(Bytes::from_static(b"from-wire")).await.unwrap();
        assert_eq!(t.recv().await.unwrap(), Bytes::from_static(b"from-wire"));

        t.send(Bytes::from_static(b"to-wire")).await.unwrap();
        assert_eq!(
            pump.outbound.recv().await.unwrap(),
            Bytes::from_static(b"to-wire")
        );
    }

    #[tokio::test]
    async fn dropping_the_pump_closes_the_transport() {
        let (t, pump) = Transport::channel();
        drop(pump);
        assert_eq!(t.recv().await, Err(TransportError::Closed));
    }
}
